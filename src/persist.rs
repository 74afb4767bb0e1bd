//! Durable snapshot storage: a single async trait with two shipped
//! implementations, selected by configuration rather than compiled-in
//! generics, since the manager only ever needs one store at a time.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::error::ManagerError;
use crate::model::PersistedState;

#[async_trait]
pub trait Persister: Send + Sync {
    /// Loads the most recently saved snapshot, if any. Called once, before
    /// event intake opens.
    async fn load(&self) -> Result<Option<PersistedState>, ManagerError>;

    /// Saves a snapshot. `version` is the manager's monotonic commit
    /// counter at the time of the save, passed through for implementations
    /// that want to log or reject out-of-order writes; it is not part of
    /// the recovered state. Must be atomic with respect to `load`: a
    /// concurrent `load` never observes a half-written snapshot.
    async fn save(&self, state: &PersistedState, version: u64) -> Result<(), ManagerError>;
}

/// No-op persister for ephemeral clusters.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPersister;

#[async_trait]
impl Persister for NoopPersister {
    async fn load(&self) -> Result<Option<PersistedState>, ManagerError> {
        Ok(None)
    }

    async fn save(&self, _state: &PersistedState, _version: u64) -> Result<(), ManagerError> {
        Ok(())
    }
}

/// JSON snapshot written to a single file via write-temp-then-rename,
/// giving atomicity (and therefore the prefix invariant) for free: a
/// reader of the final path never sees a partially written snapshot, and
/// a crash mid-write leaves the previous snapshot intact.
pub struct FilePersister {
    path: PathBuf,
}

impl FilePersister {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl Persister for FilePersister {
    async fn load(&self) -> Result<Option<PersistedState>, ManagerError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) => {
                let state: PersistedState = serde_json::from_slice(&bytes).map_err(|e| {
                    ManagerError::Persistence {
                        reason: format!("corrupt snapshot at {}: {e}", self.path.display()),
                    }
                })?;
                Ok(Some(state))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ManagerError::Persistence {
                reason: format!("reading {}: {e}", self.path.display()),
            }),
        }
    }

    async fn save(&self, state: &PersistedState, _version: u64) -> Result<(), ManagerError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| ManagerError::Persistence {
                reason: format!("creating {}: {e}", parent.display()),
            })?;
        }

        let tmp_path = self.path.with_extension("tmp");
        let body = serde_json::to_vec(state).map_err(|e| ManagerError::Persistence {
            reason: format!("serializing snapshot: {e}"),
        })?;

        let mut file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| ManagerError::Persistence {
                reason: format!("creating {}: {e}", tmp_path.display()),
            })?;
        file.write_all(&body).await.map_err(|e| ManagerError::Persistence {
            reason: format!("writing {}: {e}", tmp_path.display()),
        })?;
        file.sync_all().await.map_err(|e| ManagerError::Persistence {
            reason: format!("fsync {}: {e}", tmp_path.display()),
        })?;

        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .map_err(|e| ManagerError::Persistence {
                reason: format!("renaming into {}: {e}", self.path.display()),
            })
    }
}
