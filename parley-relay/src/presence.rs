//! Presence registry: which user is reachable through which live connection.
//!
//! ```text
//!   join ──► register(user, handle) ──┐
//!                                     ▼
//!                          ┌──────────────────────┐
//!   route ──► lookup(user) │ user_id → handle     │
//!                          │ conn_id → user_id    │
//!                          └──────────────────────┘
//!                                     ▲
//!   close ──► unregister(handle) ─────┘   (only if the stored handle matches)
//! ```
//!
//! At most one handle per user; the newest registration wins and the
//! superseded connection is not told. All reads and writes go through a
//! single `RwLock`, so a register racing a lookup or unregister for the
//! same user is linearizable.

use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use crate::protocol::{ServerEvent, UserId};

/// Why an event could not be pushed onto a connection's outbound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryError {
    /// The outbound queue is at capacity; the event was dropped.
    QueueFull,
    /// The connection task is gone.
    Closed,
}

/// Addressable reference to one live connection.
///
/// Cloning is cheap. Two handles are equal iff they refer to the same
/// connection, regardless of which clone is compared.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    sender: mpsc::Sender<ServerEvent>,
}

impl ConnectionHandle {
    /// Wrap an existing outbound sender under a fresh connection id.
    pub fn new(sender: mpsc::Sender<ServerEvent>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
        }
    }

    /// Create a handle together with the receiving end of its outbound queue.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Push an event without waiting. Never blocks.
    pub fn try_deliver(&self, event: ServerEvent) -> Result<(), DeliveryError> {
        self.sender.try_send(event).map_err(|e| match e {
            TrySendError::Full(_) => DeliveryError::QueueFull,
            TrySendError::Closed(_) => DeliveryError::Closed,
        })
    }

    /// Whether the connection task has dropped its receiver.
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }
}

impl PartialEq for ConnectionHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ConnectionHandle {}

impl Hash for ConnectionHandle {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[derive(Default)]
struct Entries {
    by_user: HashMap<UserId, ConnectionHandle>,
    by_connection: HashMap<Uuid, UserId>,
}

impl Entries {
    fn remove_user_if(&mut self, user: &UserId, conn_id: Uuid) -> bool {
        match self.by_user.get(user) {
            Some(stored) if stored.id == conn_id => {
                self.by_user.remove(user);
                true
            }
            _ => false,
        }
    }
}

/// Authoritative map of online users.
#[derive(Default)]
pub struct PresenceRegistry {
    entries: RwLock<Entries>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Entries> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Entries> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Associate `handle` with `user`, replacing any previous association.
    ///
    /// Returns the superseded handle, if there was one.
    pub fn register(&self, user: UserId, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        self.register_then(user, handle, |previous| previous)
    }

    /// Register and then run `f` before any other reader or writer can
    /// observe the registry.
    ///
    /// `f` receives the superseded handle. It must not call back into the
    /// registry.
    pub fn register_then<R>(
        &self,
        user: UserId,
        handle: ConnectionHandle,
        f: impl FnOnce(Option<ConnectionHandle>) -> R,
    ) -> R {
        let mut entries = self.write();

        // A connection maps to at most one user.
        if let Some(old_user) = entries.by_connection.get(&handle.id).cloned() {
            if old_user != user {
                entries.remove_user_if(&old_user, handle.id);
            }
        }

        entries.by_connection.insert(handle.id, user.clone());
        let previous = entries.by_user.insert(user, handle.clone());
        if let Some(prev) = &previous {
            if prev.id != handle.id {
                entries.by_connection.remove(&prev.id);
            }
        }

        f(previous.filter(|prev| prev.id != handle.id))
    }

    /// Current handle for `user`, if online.
    pub fn lookup(&self, user: &UserId) -> Option<ConnectionHandle> {
        self.read().by_user.get(user).cloned()
    }

    /// Run `f` on `user`'s current handle while the registry is still
    /// read-locked, so no register or unregister for any user can interleave.
    ///
    /// `f` must not call back into the registry's write side.
    pub fn with_current<R>(
        &self,
        user: &UserId,
        f: impl FnOnce(Option<&ConnectionHandle>) -> R,
    ) -> R {
        let entries = self.read();
        f(entries.by_user.get(user))
    }

    /// Remove the entry held by `handle`. A handle that has been superseded,
    /// or was already removed, is a no-op.
    ///
    /// Returns the user that went offline.
    pub fn unregister(&self, handle: &ConnectionHandle) -> Option<UserId> {
        let mut entries = self.write();
        let user = entries.by_connection.remove(&handle.id)?;
        if entries.remove_user_if(&user, handle.id) {
            Some(user)
        } else {
            None
        }
    }

    pub fn is_online(&self, user: &UserId) -> bool {
        self.read().by_user.contains_key(user)
    }

    pub fn online_count(&self) -> usize {
        self.read().by_user.len()
    }

    /// Snapshot of online users, in no particular order.
    pub fn online_users(&self) -> Vec<UserId> {
        self.read().by_user.keys().cloned().collect()
    }
}
