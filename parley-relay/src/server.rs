//! WebSocket relay server.
//!
//! Architecture:
//! ```text
//! Client ──WS text──► connection task ──► ClientEvent
//!                          │                 │
//!                          │      join / mark-read ──► LifecycleManager
//!                          │      message / call  ──► SignalingRouter
//!                          │                              │
//!                          ◄── outbound mpsc ◄── ConnectionHandle::try_deliver
//! ```
//!
//! One task per socket. The task owns the socket's [`Connection`]; the
//! sending half of its outbound queue is the handle other tasks route to.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;

use crate::lifecycle::{Connection, LifecycleManager};
use crate::notifications::{BufferConfig, NotificationBuffer};
use crate::presence::{ConnectionHandle, PresenceRegistry};
use crate::protocol::{ClientEvent, ProtocolError, ServerEvent};
use crate::router::{RouterConfig, Signal, SignalingRouter};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind (e.g. "127.0.0.1:5000")
    pub bind_addr: String,
    /// Events buffered per connection before further events are dropped
    pub outbound_capacity: usize,
    /// Send WebSocket pings at this interval and close connections silent
    /// for two intervals. `None` disables liveness checks.
    pub heartbeat_interval_secs: Option<u64>,
    /// Offline notification cap and overflow policy
    pub buffer: BufferConfig,
    /// Notification summary settings
    pub router: RouterConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:5000".to_string(),
            outbound_capacity: 256,
            heartbeat_interval_secs: None,
            buffer: BufferConfig::default(),
            router: RouterConfig::default(),
        }
    }
}

impl ServerConfig {
    fn heartbeat_interval(&self) -> Option<Duration> {
        self.heartbeat_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

/// Server statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_events: u64,
    pub rejected_frames: u64,
    pub online_users: usize,
    pub pending_notifications: usize,
    pub forwarded: u64,
    pub buffered: u64,
    pub dropped: u64,
}

/// State shared by every connection task.
struct Shared {
    config: ServerConfig,
    registry: Arc<PresenceRegistry>,
    buffer: Arc<NotificationBuffer>,
    router: SignalingRouter,
    lifecycle: LifecycleManager,
    stats: RwLock<ServerStats>,
}

impl Shared {
    /// Apply one inbound event to the core.
    fn dispatch(&self, conn: &mut Connection, event: ClientEvent) {
        match event {
            ClientEvent::Join(user) => {
                self.lifecycle.join(conn, user);
            }
            ClientEvent::MarkRead(user) => {
                self.lifecycle.mark_read(&user);
            }
            ClientEvent::MessageSend(msg) => {
                self.router.route(Signal::MessageSend(msg));
            }
            ClientEvent::CallOffer(offer) => {
                self.router.route(Signal::CallOffer(offer));
            }
            ClientEvent::CallAnswer(answer) => {
                self.router.route(Signal::CallAnswer(answer));
            }
            ClientEvent::IceCandidate(candidate) => {
                self.router.route(Signal::IceCandidate(candidate));
            }
        }
    }
}

/// The relay server. Cheap to clone; clones share all state.
#[derive(Clone)]
pub struct RelayServer {
    shared: Arc<Shared>,
}

impl RelayServer {
    /// Create a new relay server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let registry = Arc::new(PresenceRegistry::new());
        let buffer = Arc::new(NotificationBuffer::with_config(config.buffer));
        let router =
            SignalingRouter::with_config(registry.clone(), buffer.clone(), config.router.clone());
        let lifecycle = LifecycleManager::new(registry.clone(), buffer.clone());

        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                buffer,
                router,
                lifecycle,
                stats: RwLock::new(ServerStats::default()),
            }),
        }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<(), BoxError> {
        let listener = TcpListener::bind(&self.shared.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), BoxError> {
        log::info!("Relay server listening on {}", listener.local_addr()?);
        if let Some(interval) = self.shared.config.heartbeat_interval() {
            log::info!("Heartbeat enabled every {}s", interval.as_secs());
        }

        loop {
            let (stream, addr) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    log::warn!("Accept failed: {e}");
                    continue;
                }
            };
            log::debug!("New TCP connection from {addr}");

            let shared = self.shared.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, shared).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    /// Handle a single WebSocket connection.
    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        shared: Arc<Shared>,
    ) -> Result<(), BoxError> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (handle, outbound_rx) = ConnectionHandle::channel(shared.config.outbound_capacity);
        let mut conn = Connection::new(handle);

        log::info!("WebSocket connection {} established from {addr}", conn.handle().id());
        {
            let mut s = shared.stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let result = Self::pump(ws_stream, addr, &shared, &mut conn, outbound_rx).await;

        // Cleanup runs whichever way the socket ended.
        shared.lifecycle.disconnect(&mut conn);
        {
            let mut s = shared.stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }
        log::info!("Connection {} from {addr} closed", conn.handle().id());

        result
    }

    /// Shuttle frames between the socket and the core until either side ends.
    async fn pump(
        ws_stream: tokio_tungstenite::WebSocketStream<TcpStream>,
        addr: SocketAddr,
        shared: &Shared,
        conn: &mut Connection,
        mut outbound_rx: mpsc::Receiver<ServerEvent>,
    ) -> Result<(), BoxError> {
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let heartbeat_every = shared.config.heartbeat_interval();
        let mut heartbeat = heartbeat_every.map(|every| {
            let mut interval = tokio::time::interval(every);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut last_seen = Instant::now();

        loop {
            tokio::select! {
                // Incoming WebSocket message
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            last_seen = Instant::now();
                            match ClientEvent::decode(text.as_str()) {
                                Ok(event) => {
                                    log::trace!("{addr} → {}", event.name());
                                    shared.stats.write().await.total_events += 1;
                                    shared.dispatch(conn, event);
                                }
                                Err(e) => {
                                    shared.stats.write().await.rejected_frames += 1;
                                    log::warn!("Failed to decode event from {addr}: {e}");
                                }
                            }
                        }

                        Some(Ok(Message::Binary(_))) => {
                            last_seen = Instant::now();
                            shared.stats.write().await.rejected_frames += 1;
                            log::warn!(
                                "Ignoring frame from {addr}: {}",
                                ProtocolError::UnexpectedFrame
                            );
                        }

                        Some(Ok(Message::Ping(data))) => {
                            last_seen = Instant::now();
                            ws_sender.send(Message::Pong(data)).await?;
                        }

                        Some(Ok(Message::Pong(_))) => {
                            last_seen = Instant::now();
                        }

                        Some(Ok(Message::Close(_))) | None => {
                            log::debug!("Close from {addr}");
                            return Ok(());
                        }

                        Some(Err(e)) => {
                            log::error!("WebSocket error from {addr}: {e}");
                            return Ok(());
                        }

                        Some(Ok(Message::Frame(_))) => {}
                    }
                }

                // Outgoing event routed to this connection
                Some(event) = outbound_rx.recv() => {
                    let text = event.encode()?;
                    log::trace!("{addr} ← {}", event.name());
                    ws_sender.send(Message::Text(text.into())).await?;
                }

                // Liveness check
                _ = next_tick(&mut heartbeat) => {
                    if let Some(every) = heartbeat_every {
                        if last_seen.elapsed() > every * 2 {
                            log::info!("{addr} missed heartbeats; closing");
                            let _ = ws_sender.send(Message::Close(None)).await;
                            return Ok(());
                        }
                    }
                    ws_sender.send(Message::Ping(Vec::new().into())).await?;
                }
            }
        }
    }

    /// Get server statistics.
    pub async fn stats(&self) -> ServerStats {
        let mut stats = self.shared.stats.read().await.clone();
        let routed = self.shared.router.stats();
        stats.online_users = self.shared.registry.online_count();
        stats.pending_notifications = self.shared.buffer.total_pending();
        stats.forwarded = routed.forwarded;
        stats.buffered = routed.buffered;
        stats.dropped = routed.dropped;
        stats
    }

    /// Get the configured bind address.
    pub fn bind_addr(&self) -> &str {
        &self.shared.config.bind_addr
    }

    pub fn config(&self) -> &ServerConfig {
        &self.shared.config
    }

    /// Presence registry backing this server.
    pub fn registry(&self) -> &Arc<PresenceRegistry> {
        &self.shared.registry
    }

    /// Notification buffer backing this server.
    pub fn notifications(&self) -> &Arc<NotificationBuffer> {
        &self.shared.buffer
    }
}

/// Resolves on the next heartbeat tick, or never when heartbeats are off.
async fn next_tick(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
