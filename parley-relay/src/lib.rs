//! # parley-relay: realtime signaling and presence relay
//!
//! Tracks which users are connected, routes chat messages and WebRTC
//! negotiation payloads between them, and holds notifications for users who
//! are offline until they come back.
//!
//! ## Architecture
//!
//! ```text
//!  WebSocket ──► RelayServer ──► ClientEvent
//!                                   │
//!            ┌──── join / leave / mark-read ────┐
//!            ▼                                  │ message / offer / answer / ice
//!  ┌──────────────────┐                         ▼
//!  │ LifecycleManager │               ┌──────────────────┐
//!  └───────┬──────────┘               │ SignalingRouter  │
//!          │                          └───────┬──────────┘
//!          ▼                                  ▼
//!  ┌──────────────────┐  online?  ┌──────────────────────┐
//!  │ PresenceRegistry │◄──────────│ NotificationBuffer   │
//!  └──────────────────┘  offline  └──────────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: JSON event wire format
//! - [`presence`]: user → live connection registry
//! - [`notifications`]: per-user offline notification queues
//! - [`router`]: point-to-point forwarding with offline fallback
//! - [`lifecycle`]: join / disconnect / mark-read state machine
//! - [`server`]: WebSocket relay server
//! - [`client`]: WebSocket relay client
//!
//! All state is in memory. A restart forgets presence and drops every
//! pending notification.

pub mod protocol;
pub mod presence;
pub mod notifications;
pub mod router;
pub mod lifecycle;
pub mod server;
pub mod client;

// Re-exports for convenience
pub use protocol::{
    CallAnswer, CallOffer, ClientEvent, IceCandidate, MessageSend, PendingNotification,
    ProtocolError, ServerEvent, UserId,
};
pub use presence::{ConnectionHandle, DeliveryError, PresenceRegistry};
pub use notifications::{BufferConfig, EnqueueOutcome, NotificationBuffer, OverflowPolicy};
pub use router::{Delivery, RouterConfig, RouterStats, Signal, SignalKind, SignalingRouter};
pub use lifecycle::{Connection, ConnectionState, JoinOutcome, LifecycleManager};
pub use server::{RelayServer, ServerConfig, ServerStats};
pub use client::{ClientState, RelayClient};
