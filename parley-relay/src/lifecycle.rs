//! Per-connection join/leave protocol.
//!
//! ```text
//!            join(user)                 disconnect
//! Unjoined ─────────────► Joined(user) ───────────► Closed
//!     │                     │    ▲                    ▲ │
//!     │                     └────┘ join(other)        │ │ disconnect (no-op)
//!     └───────────────────────────────────────────────┘ └──┘
//!                     disconnect
//! ```
//!
//! Joining registers the connection in the presence registry and flushes
//! the user's pending notifications to it as one batch. Leaving removes the
//! presence entry only if it still belongs to this connection.

use std::sync::Arc;

use crate::notifications::NotificationBuffer;
use crate::presence::{ConnectionHandle, DeliveryError, PresenceRegistry};
use crate::protocol::{ServerEvent, UserId};

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Unjoined,
    Joined(UserId),
    Closed,
}

/// One client session as seen by the lifecycle manager.
///
/// Owned by the task that drives the socket.
#[derive(Debug)]
pub struct Connection {
    handle: ConnectionHandle,
    state: ConnectionState,
}

impl Connection {
    pub fn new(handle: ConnectionHandle) -> Self {
        Self {
            handle,
            state: ConnectionState::Unjoined,
        }
    }

    pub fn handle(&self) -> &ConnectionHandle {
        &self.handle
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    /// The joined user, if any.
    pub fn user(&self) -> Option<&UserId> {
        match &self.state {
            ConnectionState::Joined(user) => Some(user),
            _ => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }
}

/// Result of a join attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinOutcome {
    Joined {
        /// Pending notifications delivered in the reconnect batch.
        flushed: usize,
        /// Another connection held this user's presence and was replaced.
        superseded: bool,
    },
    /// The connection is already closed.
    Ignored,
}

/// Drives join, disconnect and mark-read against the shared stores.
pub struct LifecycleManager {
    registry: Arc<PresenceRegistry>,
    buffer: Arc<NotificationBuffer>,
}

impl LifecycleManager {
    pub fn new(registry: Arc<PresenceRegistry>, buffer: Arc<NotificationBuffer>) -> Self {
        Self { registry, buffer }
    }

    /// Bind `conn` to `user` and flush anything buffered for them.
    ///
    /// Joining an already joined connection is treated as a reconnect; if
    /// the user changed, the previous user's presence is released.
    pub fn join(&self, conn: &mut Connection, user: UserId) -> JoinOutcome {
        match &conn.state {
            ConnectionState::Closed => {
                log::warn!("Join for {user} on closed connection {} ignored", conn.handle.id());
                return JoinOutcome::Ignored;
            }
            ConnectionState::Joined(previous) if *previous != user => {
                log::info!("Connection {} switching user {previous} → {user}", conn.handle.id());
            }
            _ => {}
        }

        // Register, drain and hand over the batch under the registry's write
        // lock: a message routed concurrently is either in the batch or sees
        // this connection as live, and a batch that cannot be delivered goes
        // back in front of anything queued after it.
        let handle = &conn.handle;
        let (superseded, flush) =
            self.registry
                .register_then(user.clone(), handle.clone(), |previous| {
                    (previous.is_some(), flush_pending(&self.buffer, handle, &user))
                });

        let flushed = match flush {
            Ok(flushed) => flushed,
            Err(e) => {
                log::warn!("Could not flush pending notifications to {user} ({e:?}); requeued");
                0
            }
        };

        log::info!(
            "{user} joined on connection {} ({flushed} pending flushed{})",
            conn.handle.id(),
            if superseded { ", replaced older connection" } else { "" }
        );
        conn.state = ConnectionState::Joined(user);
        JoinOutcome::Joined { flushed, superseded }
    }

    /// Close `conn`. Idempotent.
    ///
    /// Returns whether a presence entry was removed.
    pub fn disconnect(&self, conn: &mut Connection) -> bool {
        match std::mem::replace(&mut conn.state, ConnectionState::Closed) {
            ConnectionState::Joined(user) => {
                let removed = self.registry.unregister(&conn.handle).is_some();
                if removed {
                    log::info!("{user} left (connection {})", conn.handle.id());
                } else {
                    log::debug!(
                        "{user}'s connection {} closed after being superseded",
                        conn.handle.id()
                    );
                }
                removed
            }
            ConnectionState::Unjoined => {
                log::debug!("Connection {} closed before joining", conn.handle.id());
                false
            }
            ConnectionState::Closed => false,
        }
    }

    /// Discard `user`'s pending notifications. Returns how many were cleared.
    pub fn mark_read(&self, user: &UserId) -> usize {
        let cleared = self.buffer.drain_all(user).len();
        if cleared > 0 {
            log::debug!("{user} marked {cleared} notifications read");
        }
        cleared
    }
}

/// Drain `user`'s queue onto `handle` as one batch. An undeliverable batch
/// goes back in front of the queue.
fn flush_pending(
    buffer: &NotificationBuffer,
    handle: &ConnectionHandle,
    user: &UserId,
) -> Result<usize, DeliveryError> {
    let pending = buffer.drain_all(user);
    if pending.is_empty() {
        return Ok(0);
    }
    let count = pending.len();
    match handle.try_deliver(ServerEvent::PendingNotifications(pending.clone())) {
        Ok(()) => Ok(count),
        Err(e) => {
            buffer.requeue_front(user, pending);
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageSend, PendingNotification};
    use crate::router::{Signal, SignalingRouter};
    use tokio::sync::mpsc;

    struct Fixture {
        registry: Arc<PresenceRegistry>,
        buffer: Arc<NotificationBuffer>,
        lifecycle: LifecycleManager,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(PresenceRegistry::new());
        let buffer = Arc::new(NotificationBuffer::new());
        let lifecycle = LifecycleManager::new(registry.clone(), buffer.clone());
        Fixture { registry, buffer, lifecycle }
    }

    fn connection() -> (Connection, mpsc::Receiver<ServerEvent>) {
        let (handle, rx) = ConnectionHandle::channel(16);
        (Connection::new(handle), rx)
    }

    fn note(from: &str, message: &str) -> PendingNotification {
        PendingNotification::new(from.into(), message)
    }

    #[test]
    fn test_join_registers_presence() {
        let f = fixture();
        let (mut conn, mut rx) = connection();

        let outcome = f.lifecycle.join(&mut conn, "bob".into());
        assert_eq!(outcome, JoinOutcome::Joined { flushed: 0, superseded: false });
        assert_eq!(conn.user(), Some(&UserId::from("bob")));
        assert_eq!(f.registry.lookup(&"bob".into()).as_ref(), Some(conn.handle()));
        // Nothing pending: no batch is sent.
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_join_flushes_pending_in_order() {
        let f = fixture();
        let bob: UserId = "bob".into();
        f.buffer.enqueue(&bob, note("alice", "n1"));
        f.buffer.enqueue(&bob, note("carol", "n2"));

        let (mut conn, mut rx) = connection();
        let outcome = f.lifecycle.join(&mut conn, bob.clone());
        assert_eq!(outcome, JoinOutcome::Joined { flushed: 2, superseded: false });

        assert_eq!(
            rx.try_recv().unwrap(),
            ServerEvent::PendingNotifications(vec![note("alice", "n1"), note("carol", "n2")])
        );
        assert!(rx.try_recv().is_err());
        assert_eq!(f.buffer.pending_count(&bob), 0);
    }

    #[test]
    fn test_reconnect_flush_is_exactly_once() {
        let f = fixture();
        let bob: UserId = "bob".into();
        f.buffer.enqueue(&bob, note("alice", "hi"));

        let (mut first, mut rx1) = connection();
        f.lifecycle.join(&mut first, bob.clone());
        f.lifecycle.disconnect(&mut first);

        let (mut second, mut rx2) = connection();
        let outcome = f.lifecycle.join(&mut second, bob.clone());

        assert!(matches!(
            rx1.try_recv(),
            Ok(ServerEvent::PendingNotifications(ref v)) if v.len() == 1
        ));
        assert_eq!(outcome, JoinOutcome::Joined { flushed: 0, superseded: false });
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_second_connection_supersedes_first() {
        let f = fixture();
        let (mut first, _rx1) = connection();
        let (mut second, _rx2) = connection();

        f.lifecycle.join(&mut first, "bob".into());
        let outcome = f.lifecycle.join(&mut second, "bob".into());
        assert_eq!(outcome, JoinOutcome::Joined { flushed: 0, superseded: true });

        // The stale connection closing must not take the new one offline.
        assert!(!f.lifecycle.disconnect(&mut first));
        assert_eq!(f.registry.lookup(&"bob".into()).as_ref(), Some(second.handle()));
    }

    #[test]
    fn test_disconnect_is_idempotent() {
        let f = fixture();
        let (mut conn, _rx) = connection();
        f.lifecycle.join(&mut conn, "bob".into());

        assert!(f.lifecycle.disconnect(&mut conn));
        assert!(conn.is_closed());
        assert!(!f.registry.is_online(&"bob".into()));

        assert!(!f.lifecycle.disconnect(&mut conn));
        assert!(conn.is_closed());
        assert_eq!(f.registry.online_count(), 0);
    }

    #[test]
    fn test_disconnect_before_join() {
        let f = fixture();
        let (mut conn, _rx) = connection();
        assert!(!f.lifecycle.disconnect(&mut conn));
        assert_eq!(conn.state(), &ConnectionState::Closed);
    }

    #[test]
    fn test_join_after_close_ignored() {
        let f = fixture();
        let (mut conn, _rx) = connection();
        f.lifecycle.disconnect(&mut conn);

        assert_eq!(f.lifecycle.join(&mut conn, "bob".into()), JoinOutcome::Ignored);
        assert!(!f.registry.is_online(&"bob".into()));
    }

    #[test]
    fn test_rejoin_as_other_user_releases_previous() {
        let f = fixture();
        let (mut conn, _rx) = connection();
        f.lifecycle.join(&mut conn, "bob".into());
        f.lifecycle.join(&mut conn, "carol".into());

        assert!(!f.registry.is_online(&"bob".into()));
        assert!(f.registry.is_online(&"carol".into()));
        assert_eq!(conn.user(), Some(&UserId::from("carol")));
    }

    #[test]
    fn test_duplicate_join_same_user() {
        let f = fixture();
        let (mut conn, _rx) = connection();
        f.lifecycle.join(&mut conn, "bob".into());
        let outcome = f.lifecycle.join(&mut conn, "bob".into());

        assert_eq!(outcome, JoinOutcome::Joined { flushed: 0, superseded: false });
        assert_eq!(f.registry.online_count(), 1);
    }

    #[test]
    fn test_failed_flush_requeues() {
        let f = fixture();
        let bob: UserId = "bob".into();
        f.buffer.enqueue(&bob, note("alice", "n1"));
        f.buffer.enqueue(&bob, note("alice", "n2"));

        let (handle, rx) = ConnectionHandle::channel(1);
        drop(rx);
        let mut conn = Connection::new(handle);

        let outcome = f.lifecycle.join(&mut conn, bob.clone());
        assert_eq!(outcome, JoinOutcome::Joined { flushed: 0, superseded: false });
        assert_eq!(f.buffer.drain_all(&bob), vec![note("alice", "n1"), note("alice", "n2")]);
    }

    #[test]
    fn test_requeued_batch_stays_ahead_of_later_messages() {
        let f = fixture();
        let router = SignalingRouter::new(f.registry.clone(), f.buffer.clone());
        let bob: UserId = "bob".into();
        f.buffer.enqueue(&bob, note("alice", "n1"));
        f.buffer.enqueue(&bob, note("alice", "n2"));

        let (handle, rx) = ConnectionHandle::channel(4);
        drop(rx);
        let mut dead = Connection::new(handle);
        f.lifecycle.join(&mut dead, bob.clone());

        // Routed to the dead connection, so it falls back to the buffer.
        router.route(Signal::MessageSend(MessageSend {
            to: bob.clone(),
            from: "carol".into(),
            message: "n3".into(),
        }));

        let (mut live, mut rx) = connection();
        let outcome = f.lifecycle.join(&mut live, bob.clone());
        assert_eq!(outcome, JoinOutcome::Joined { flushed: 3, superseded: true });
        assert_eq!(
            rx.try_recv().unwrap(),
            ServerEvent::PendingNotifications(vec![
                note("alice", "n1"),
                note("alice", "n2"),
                note("carol", "n3"),
            ])
        );
    }

    #[test]
    fn test_mark_read_clears_without_delivery() {
        let f = fixture();
        let bob: UserId = "bob".into();
        f.buffer.enqueue(&bob, note("alice", "n1"));
        f.buffer.enqueue(&bob, note("alice", "n2"));

        assert_eq!(f.lifecycle.mark_read(&bob), 2);
        assert_eq!(f.lifecycle.mark_read(&bob), 0);

        let (mut conn, mut rx) = connection();
        f.lifecycle.join(&mut conn, bob);
        assert!(rx.try_recv().is_err());
    }
}
