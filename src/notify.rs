//! Per-runner notification fan-out. Each registered runner gets its own
//! bounded channel; a slow or wedged runner backs up its own queue and
//! never blocks delivery to anyone else.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::mpsc;

use crate::model::{Delta, RunnerAddress, RunnerDelta, ShardId};

/// A single notification handed to a runner: either its full current
/// assignment (sent once, right after registration) or an incremental
/// delta from a committed mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Full(Vec<ShardId>),
    Delta(RunnerDelta),
}

struct Channel {
    tx: mpsc::Sender<Notification>,
    /// Taken by the `Notifications` RPC handler once the runner subscribes.
    /// `None` after the first take, or if nobody has subscribed yet.
    rx: Option<mpsc::Receiver<Notification>>,
}

pub struct Notifier {
    buffer: usize,
    channels: Mutex<HashMap<RunnerAddress, Channel>>,
}

impl Notifier {
    pub fn new(buffer: usize) -> Self {
        Self {
            buffer,
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Opens a fresh channel for a (re-)registering runner, replacing any
    /// previous one — a reconnect always starts a new notification stream,
    /// and the old receiver (if nobody had subscribed to it yet) is simply
    /// dropped along with the old sender. Queues the runner's current full
    /// assignment as the first message so a reconnecting runner never has
    /// to diff locally.
    pub fn register(&self, address: RunnerAddress, current: Vec<ShardId>) {
        let (tx, rx) = mpsc::channel(self.buffer);
        let _ = tx.try_send(Notification::Full(current));
        self.channels.lock().unwrap().insert(
            address,
            Channel {
                tx,
                rx: Some(rx),
            },
        );
    }

    /// Hands the receiving half to the caller (the `Notifications` RPC
    /// handler), once. Returns `None` if the runner never registered, or if
    /// its stream was already claimed by an earlier call.
    pub fn take_stream(&self, address: &RunnerAddress) -> Option<mpsc::Receiver<Notification>> {
        self.channels.lock().unwrap().get_mut(address).and_then(|c| c.rx.take())
    }

    pub fn unregister(&self, address: &RunnerAddress) {
        self.channels.lock().unwrap().remove(address);
    }

    /// Delivers a committed delta to every affected runner. Sends block
    /// (back-pressure) rather than drop, so a runner can never silently
    /// miss an assignment change; a runner that never drains its channel
    /// eventually causes the notifier task to stall on it alone, which is
    /// why the health prober evicts on missed heartbeats independent of
    /// notification delivery.
    pub async fn deliver(&self, delta: &Delta) {
        for (address, runner_delta) in &delta.per_runner {
            if runner_delta.is_empty() {
                continue;
            }
            let sender = self.channels.lock().unwrap().get(address).map(|c| c.tx.clone());
            if let Some(sender) = sender {
                let _ = sender.send(Notification::Delta(runner_delta.clone())).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(host: &str) -> RunnerAddress {
        RunnerAddress {
            host: host.to_string(),
            port: 1,
        }
    }

    #[tokio::test]
    async fn register_sends_full_assignment_first() {
        let notifier = Notifier::new(8);
        notifier.register(addr("r1"), vec![ShardId(1), ShardId(2)]);
        let mut rx = notifier.take_stream(&addr("r1")).expect("stream claimable once");
        let first = rx.recv().await.unwrap();
        assert_eq!(first, Notification::Full(vec![ShardId(1), ShardId(2)]));
    }

    #[tokio::test]
    async fn take_stream_is_claimable_only_once() {
        let notifier = Notifier::new(8);
        notifier.register(addr("r1"), vec![]);
        assert!(notifier.take_stream(&addr("r1")).is_some());
        assert!(notifier.take_stream(&addr("r1")).is_none());
    }

    #[tokio::test]
    async fn take_stream_on_unknown_runner_is_none() {
        let notifier = Notifier::new(8);
        assert!(notifier.take_stream(&addr("ghost")).is_none());
    }

    #[tokio::test]
    async fn deliver_only_reaches_affected_runners() {
        let notifier = Notifier::new(8);
        notifier.register(addr("r1"), vec![]);
        notifier.register(addr("r2"), vec![]);
        let mut rx1 = notifier.take_stream(&addr("r1")).unwrap();
        let mut rx2 = notifier.take_stream(&addr("r2")).unwrap();
        rx1.recv().await.unwrap();
        rx2.recv().await.unwrap();

        let mut delta = Delta::default();
        delta.record_added(addr("r1"), ShardId(5));
        notifier.deliver(&delta).await;

        let msg = rx1.recv().await.unwrap();
        assert_eq!(
            msg,
            Notification::Delta(RunnerDelta {
                added: [ShardId(5)].into_iter().collect(),
                removed: Default::default(),
            })
        );
        assert!(rx2.try_recv().is_err());
    }

    #[tokio::test]
    async fn unregister_drops_the_channel() {
        let notifier = Notifier::new(8);
        notifier.register(addr("r1"), vec![]);
        let mut rx = notifier.take_stream(&addr("r1")).unwrap();
        rx.recv().await.unwrap();
        notifier.unregister(&addr("r1"));

        let mut delta = Delta::default();
        delta.record_added(addr("r1"), ShardId(1));
        notifier.deliver(&delta).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn reregister_replaces_the_stream() {
        let notifier = Notifier::new(8);
        notifier.register(addr("r1"), vec![ShardId(1)]);
        notifier.register(addr("r1"), vec![ShardId(2), ShardId(3)]);

        let mut rx = notifier.take_stream(&addr("r1")).unwrap();
        let first = rx.recv().await.unwrap();
        assert_eq!(first, Notification::Full(vec![ShardId(2), ShardId(3)]));
    }
}
