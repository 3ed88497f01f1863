use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::warn;
use uuid::Uuid;

use aperture_types::events::OutboundFrame;

/// Handle for pushing frames into one connected session's outbound queue.
pub type SessionSender = mpsc::UnboundedSender<Arc<OutboundFrame>>;

/// Runtime registry mapping a conversation id to the sessions currently
/// subscribed to it. Purely transient state: entries exist only while the
/// owning connection is alive, and `leave` is the unconditional teardown path.
#[derive(Clone)]
pub struct GroupRouter {
    inner: Arc<RouterInner>,
}

struct RouterInner {
    groups: RwLock<HashMap<Uuid, HashMap<Uuid, SessionSender>>>,
}

impl GroupRouter {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RouterInner {
                groups: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a session under a group. Idempotent: re-joining with the same
    /// session id replaces the previous sender.
    pub async fn join(&self, group: Uuid, session_id: Uuid, tx: SessionSender) {
        let mut groups = self.inner.groups.write().await;
        groups.entry(group).or_default().insert(session_id, tx);
    }

    /// Remove a session from a group. A no-op when the session was never a
    /// member or the group is already gone.
    pub async fn leave(&self, group: Uuid, session_id: Uuid) {
        let mut groups = self.inner.groups.write().await;
        if let Some(members) = groups.get_mut(&group) {
            members.remove(&session_id);
            if members.is_empty() {
                groups.remove(&group);
            }
        }
    }

    /// Deliver a frame to every session in the group, including the sender's
    /// own session. Each delivery is a non-blocking push into the session's
    /// queue; a session whose queue is gone is skipped so it can never stall
    /// the rest of the group.
    pub async fn broadcast(&self, group: Uuid, frame: OutboundFrame) {
        let frame = Arc::new(frame);
        let groups = self.inner.groups.read().await;
        let Some(members) = groups.get(&group) else {
            return;
        };
        for (session_id, tx) in members {
            if tx.send(frame.clone()).is_err() {
                warn!("Skipping dead session {} in group {}", session_id, group);
            }
        }
    }

    /// Number of live sessions in a group.
    pub async fn group_size(&self, group: Uuid) -> usize {
        self.inner
            .groups
            .read()
            .await
            .get(&group)
            .map_or(0, HashMap::len)
    }
}

impl Default for GroupRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aperture_types::events::ErrorPayload;

    fn test_frame() -> OutboundFrame {
        OutboundFrame::Error(ErrorPayload::field("text", "test"))
    }

    #[tokio::test]
    async fn join_is_idempotent() {
        let router = GroupRouter::new();
        let group = Uuid::new_v4();
        let session = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();

        router.join(group, session, tx.clone()).await;
        router.join(group, session, tx).await;
        assert_eq!(router.group_size(group).await, 1);

        router.broadcast(group, test_frame()).await;
        assert!(rx.recv().await.is_some());
        assert!(rx.try_recv().is_err(), "double join must not double deliver");
    }

    #[tokio::test]
    async fn leave_of_non_member_is_a_noop() {
        let router = GroupRouter::new();
        let group = Uuid::new_v4();

        // Never joined, group doesn't even exist.
        router.leave(group, Uuid::new_v4()).await;
        assert_eq!(router.group_size(group).await, 0);

        // Broadcasting into the void is also fine.
        router.broadcast(group, test_frame()).await;
    }

    #[tokio::test]
    async fn broadcast_reaches_every_member() {
        let router = GroupRouter::new();
        let group = Uuid::new_v4();
        let (tx_a, mut rx_a) = mpsc::unbounded_channel();
        let (tx_b, mut rx_b) = mpsc::unbounded_channel();

        router.join(group, Uuid::new_v4(), tx_a).await;
        router.join(group, Uuid::new_v4(), tx_b).await;

        router.broadcast(group, test_frame()).await;

        let a = rx_a.recv().await.unwrap();
        let b = rx_b.recv().await.unwrap();
        assert_eq!(
            serde_json::to_string(&*a).unwrap(),
            serde_json::to_string(&*b).unwrap()
        );
    }

    #[tokio::test]
    async fn dead_member_does_not_block_the_rest() {
        let router = GroupRouter::new();
        let group = Uuid::new_v4();
        let (tx_dead, rx_dead) = mpsc::unbounded_channel();
        let (tx_live, mut rx_live) = mpsc::unbounded_channel();

        router.join(group, Uuid::new_v4(), tx_dead).await;
        router.join(group, Uuid::new_v4(), tx_live).await;
        drop(rx_dead);

        router.broadcast(group, test_frame()).await;
        assert!(rx_live.recv().await.is_some());
    }

    #[tokio::test]
    async fn departed_session_receives_nothing() {
        let router = GroupRouter::new();
        let group = Uuid::new_v4();
        let session = Uuid::new_v4();
        let (tx, mut rx) = mpsc::unbounded_channel();

        router.join(group, session, tx).await;
        router.leave(group, session).await;
        assert_eq!(router.group_size(group).await, 0);

        router.broadcast(group, test_frame()).await;
        assert!(rx.try_recv().is_err());
    }
}
