//! Point-to-point routing of chat messages and call signaling.
//!
//! Every signal names a recipient. If the recipient is online the signal is
//! pushed onto their connection's outbound queue and forgotten; nothing is
//! awaited or retried. If they are offline a chat message leaves a
//! [`PendingNotification`] behind, while call signaling is dropped (a call
//! needs both ends live).
//!
//! ```text
//! Signal ──► lookup(to) ──┬── online ──► try_deliver(event)            → Forwarded
//!                         │              (+ new-message-notification for chat)
//!                         └── offline ─┬─ message-send ─► enqueue       → Buffered
//!                                      └─ offer/answer/ice            → Dropped
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::notifications::{EnqueueOutcome, NotificationBuffer};
use crate::presence::{DeliveryError, PresenceRegistry};
use crate::protocol::{
    CallAnswer, CallOffer, IceCandidate, MessageSend, PendingNotification, ServerEvent, UserId,
};

/// The four routable event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalKind {
    MessageSend,
    CallOffer,
    CallAnswer,
    IceCandidate,
}

impl SignalKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MessageSend => "message-send",
            Self::CallOffer => "call-offer",
            Self::CallAnswer => "call-answer",
            Self::IceCandidate => "ice-candidate",
        }
    }
}

/// A routable event: `(to, from, payload)` tagged with its kind.
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    MessageSend(MessageSend),
    CallOffer(CallOffer),
    CallAnswer(CallAnswer),
    IceCandidate(IceCandidate),
}

impl Signal {
    pub fn kind(&self) -> SignalKind {
        match self {
            Self::MessageSend(_) => SignalKind::MessageSend,
            Self::CallOffer(_) => SignalKind::CallOffer,
            Self::CallAnswer(_) => SignalKind::CallAnswer,
            Self::IceCandidate(_) => SignalKind::IceCandidate,
        }
    }

    pub fn recipient(&self) -> &UserId {
        match self {
            Self::MessageSend(m) => &m.to,
            Self::CallOffer(o) => &o.to,
            Self::CallAnswer(a) => &a.to,
            Self::IceCandidate(c) => &c.to,
        }
    }

    pub fn sender(&self) -> &UserId {
        match self {
            Self::MessageSend(m) => &m.from,
            Self::CallOffer(o) => &o.from,
            Self::CallAnswer(a) => &a.from,
            Self::IceCandidate(c) => &c.from,
        }
    }
}

/// Local outcome of a routing attempt. Says nothing about whether the
/// remote client actually received it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Pushed onto the recipient's live connection.
    Forwarded,
    /// Recipient offline; a pending notification was stored.
    Buffered,
    /// Nothing was delivered or stored.
    Dropped,
}

/// Router configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterConfig {
    /// Characters of the message kept in a notification summary.
    pub preview_chars: usize,
    /// Use this fixed text as every notification summary instead of a
    /// message preview (e.g. "You have a new message").
    pub fixed_summary: Option<String>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            preview_chars: 140,
            fixed_summary: None,
        }
    }
}

/// Routing counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouterStats {
    pub forwarded: u64,
    pub buffered: u64,
    pub dropped: u64,
}

/// Lock-free counters behind [`RouterStats`].
#[derive(Default)]
struct AtomicRouterStats {
    forwarded: AtomicU64,
    buffered: AtomicU64,
    dropped: AtomicU64,
}

impl AtomicRouterStats {
    fn record(&self, delivery: Delivery) {
        let counter = match delivery {
            Delivery::Forwarded => &self.forwarded,
            Delivery::Buffered => &self.buffered,
            Delivery::Dropped => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Forwards signals to live connections or falls back to the buffer.
pub struct SignalingRouter {
    registry: Arc<PresenceRegistry>,
    buffer: Arc<NotificationBuffer>,
    config: RouterConfig,
    stats: AtomicRouterStats,
}

impl SignalingRouter {
    pub fn new(registry: Arc<PresenceRegistry>, buffer: Arc<NotificationBuffer>) -> Self {
        Self::with_config(registry, buffer, RouterConfig::default())
    }

    pub fn with_config(
        registry: Arc<PresenceRegistry>,
        buffer: Arc<NotificationBuffer>,
        config: RouterConfig,
    ) -> Self {
        Self {
            registry,
            buffer,
            config,
            stats: AtomicRouterStats::default(),
        }
    }

    /// Route one signal. Never blocks and never fails.
    pub fn route(&self, signal: Signal) -> Delivery {
        let kind = signal.kind();
        log::trace!("Routing {} {} → {}", kind.as_str(), signal.sender(), signal.recipient());
        let delivery = match signal {
            Signal::MessageSend(msg) => self.route_message(msg),
            Signal::CallOffer(offer) => {
                let to = offer.to.clone();
                self.route_call(kind, &to, ServerEvent::CallOffer(offer))
            }
            Signal::CallAnswer(answer) => {
                let to = answer.to.clone();
                self.route_call(kind, &to, ServerEvent::CallAnswer(answer))
            }
            Signal::IceCandidate(candidate) => {
                let to = candidate.to.clone();
                self.route_call(kind, &to, ServerEvent::IceCandidate(candidate))
            }
        };
        self.stats.record(delivery);
        delivery
    }

    fn route_message(&self, msg: MessageSend) -> Delivery {
        let summary = self.summarize(&msg.message);
        let MessageSend { to, from, message } = msg;

        // Everything below runs under the registry's read lock: a concurrent
        // join either drains what is stored here or is the handle delivered
        // to, and a closed handle cannot be swapped out mid-fallback.
        self.registry.with_current(&to, |current| {
            let Some(handle) = current else {
                log::debug!("{to} offline; buffered message from {from}");
                return self.store(&to, PendingNotification::new(from, summary));
            };

            match handle.try_deliver(ServerEvent::MessageReceived { message }) {
                Ok(()) => {
                    let notice = ServerEvent::NewMessageNotification {
                        from: from.clone(),
                        message: summary,
                    };
                    if let Err(e) = handle.try_deliver(notice) {
                        log::debug!("New-message notice to {to} not sent: {e:?}");
                    }
                    log::debug!("Forwarded message {from} → {to}");
                    Delivery::Forwarded
                }
                Err(DeliveryError::Closed) => {
                    // Connection died before its disconnect was processed.
                    log::debug!("{to} has a closed connection; buffering message from {from}");
                    self.store(&to, PendingNotification::new(from, summary))
                }
                Err(DeliveryError::QueueFull) => {
                    log::warn!("Outbound queue for {to} full; dropped message from {from}");
                    Delivery::Dropped
                }
            }
        })
    }

    fn route_call(&self, kind: SignalKind, to: &UserId, event: ServerEvent) -> Delivery {
        let Some(handle) = self.registry.lookup(to) else {
            log::debug!("{to} offline; dropped {}", kind.as_str());
            return Delivery::Dropped;
        };

        match handle.try_deliver(event) {
            Ok(()) => {
                if kind == SignalKind::IceCandidate {
                    log::trace!("Forwarded ice-candidate to {to}");
                } else {
                    log::debug!("Forwarded {} to {to}", kind.as_str());
                }
                Delivery::Forwarded
            }
            Err(e) => {
                log::warn!("Could not forward {} to {to}: {e:?}", kind.as_str());
                Delivery::Dropped
            }
        }
    }

    fn store(&self, to: &UserId, notification: PendingNotification) -> Delivery {
        match self.buffer.enqueue(to, notification) {
            EnqueueOutcome::Queued | EnqueueOutcome::Evicted(_) => Delivery::Buffered,
            EnqueueOutcome::Rejected => Delivery::Dropped,
        }
    }

    /// Summary text stored in notifications for `message`.
    pub fn summarize(&self, message: &str) -> String {
        if let Some(fixed) = &self.config.fixed_summary {
            return fixed.clone();
        }
        let limit = self.config.preview_chars;
        match message.char_indices().nth(limit) {
            Some((cut, _)) => format!("{}…", &message[..cut]),
            None => message.to_owned(),
        }
    }

    pub fn stats(&self) -> RouterStats {
        RouterStats {
            forwarded: self.stats.forwarded.load(Ordering::Relaxed),
            buffered: self.stats.buffered.load(Ordering::Relaxed),
            dropped: self.stats.dropped.load(Ordering::Relaxed),
        }
    }
}
