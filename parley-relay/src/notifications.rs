//! Per-user queue of notifications held while the user is offline.
//!
//! Queues are created on the first undeliverable message and removed
//! wholesale when drained (reconnect flush or explicit mark-read). The
//! whole map sits behind one mutex, so an enqueue racing a drain for the
//! same user lands entirely before or entirely after it.
//!
//! By default queues are unbounded. A cap can be configured together with
//! an explicit [`OverflowPolicy`]; every overflow is logged.
//!
//! Nothing here survives a process restart.

use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::protocol::{PendingNotification, UserId};

/// What to do when a capped queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest pending notification to make room.
    #[default]
    DropOldest,
    /// Refuse the incoming notification.
    DropNewest,
}

/// Notification buffer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferConfig {
    /// Maximum pending notifications per user (`None` = unbounded).
    pub max_per_user: Option<usize>,
    /// Applied once `max_per_user` is reached.
    pub overflow: OverflowPolicy,
}

impl BufferConfig {
    /// Bounded buffer with the given per-user cap and policy.
    pub fn capped(max_per_user: usize, overflow: OverflowPolicy) -> Self {
        Self {
            max_per_user: Some(max_per_user),
            overflow,
        }
    }
}

/// Result of an enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// Queued after evicting this (oldest) notification.
    Evicted(PendingNotification),
    /// The queue was full and the policy (or a zero cap) refused the new
    /// notification.
    Rejected,
}

/// Shared offline notification store.
#[derive(Default)]
pub struct NotificationBuffer {
    queues: Mutex<HashMap<UserId, VecDeque<PendingNotification>>>,
    config: BufferConfig,
}

impl NotificationBuffer {
    /// Unbounded buffer.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_config(config: BufferConfig) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub fn config(&self) -> BufferConfig {
        self.config
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<UserId, VecDeque<PendingNotification>>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append to the user's queue, creating it if needed.
    pub fn enqueue(&self, user: &UserId, notification: PendingNotification) -> EnqueueOutcome {
        // Zero cap: nothing is ever held, and no empty queue is left behind.
        if self.config.max_per_user == Some(0) {
            log::warn!("Notification for {user} discarded: buffer cap is zero");
            return EnqueueOutcome::Rejected;
        }

        let mut queues = self.lock();
        let queue = queues.entry(user.clone()).or_default();

        let full = self
            .config
            .max_per_user
            .is_some_and(|cap| queue.len() >= cap);
        if !full {
            queue.push_back(notification);
            return EnqueueOutcome::Queued;
        }

        match self.config.overflow {
            OverflowPolicy::DropOldest => {
                let evicted = queue.pop_front();
                queue.push_back(notification);
                log::warn!("Notification queue for {user} full; dropped oldest");
                match evicted {
                    Some(old) => EnqueueOutcome::Evicted(old),
                    None => EnqueueOutcome::Queued,
                }
            }
            OverflowPolicy::DropNewest => {
                log::warn!("Notification queue for {user} full; rejected newest");
                EnqueueOutcome::Rejected
            }
        }
    }

    /// Atomically remove and return everything pending for `user`, oldest
    /// first. Empty if nothing was queued.
    pub fn drain_all(&self, user: &UserId) -> Vec<PendingNotification> {
        self.lock()
            .remove(user)
            .map(Vec::from)
            .unwrap_or_default()
    }

    /// Put a drained `batch` back at the front of `user`'s queue, ahead of
    /// anything queued since, in its original order.
    ///
    /// With a cap, the combined queue is trimmed by the overflow policy:
    /// `DropOldest` sheds from the front, `DropNewest` from the back.
    /// Returns how many notifications were discarded.
    pub fn requeue_front(&self, user: &UserId, batch: Vec<PendingNotification>) -> usize {
        if batch.is_empty() {
            return 0;
        }

        let mut queues = self.lock();
        let queue = queues.entry(user.clone()).or_default();
        for notification in batch.into_iter().rev() {
            queue.push_front(notification);
        }

        let excess = self
            .config
            .max_per_user
            .map_or(0, |cap| queue.len().saturating_sub(cap));
        if excess > 0 {
            let keep = queue.len() - excess;
            match self.config.overflow {
                OverflowPolicy::DropOldest => {
                    queue.drain(..excess);
                }
                OverflowPolicy::DropNewest => queue.truncate(keep),
            }
            log::warn!("Requeue for {user} over cap; discarded {excess}");
        }
        if queue.is_empty() {
            queues.remove(user);
        }
        excess
    }

    pub fn pending_count(&self, user: &UserId) -> usize {
        self.lock().get(user).map_or(0, VecDeque::len)
    }

    /// Users with at least one pending notification.
    pub fn queued_users(&self) -> Vec<UserId> {
        self.lock().keys().cloned().collect()
    }

    /// Total pending notifications across all users.
    pub fn total_pending(&self) -> usize {
        self.lock().values().map(VecDeque::len).sum()
    }
}
