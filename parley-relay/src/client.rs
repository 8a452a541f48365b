//! WebSocket client for the relay.
//!
//! Provides:
//! - Connection lifecycle (connect, close)
//! - Typed senders for every inbound event
//! - A channel of decoded [`ServerEvent`]s for the application

use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::protocol::{
    CallAnswer, CallOffer, ClientEvent, IceCandidate, MessageSend, ProtocolError, ServerEvent,
    UserId,
};

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
}

/// The relay client.
pub struct RelayClient {
    /// Server URL (ws://host:port)
    server_url: String,

    /// Connection state
    state: Arc<RwLock<ClientState>>,

    /// Channel to the WebSocket writer task
    outgoing_tx: Option<mpsc::Sender<String>>,

    /// Event receiver for the application
    event_rx: Option<mpsc::Receiver<ServerEvent>>,

    /// Event sender (held by the reader task)
    event_tx: mpsc::Sender<ServerEvent>,
}

impl RelayClient {
    /// Create a new relay client.
    pub fn new(server_url: impl Into<String>) -> Self {
        let (event_tx, event_rx) = mpsc::channel(256);
        Self {
            server_url: server_url.into(),
            state: Arc::new(RwLock::new(ClientState::Disconnected)),
            outgoing_tx: None,
            event_rx: Some(event_rx),
            event_tx,
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ServerEvent>> {
        self.event_rx.take()
    }

    /// Connect to the server.
    ///
    /// Spawns background tasks for reading/writing WebSocket frames.
    pub async fn connect(&mut self) -> Result<(), ProtocolError> {
        *self.state.write().await = ClientState::Connecting;

        let (ws_stream, _) = match tokio_tungstenite::connect_async(&self.server_url).await {
            Ok(connected) => connected,
            Err(e) => {
                log::warn!("Could not connect to {}: {e}", self.server_url);
                *self.state.write().await = ClientState::Disconnected;
                return Err(ProtocolError::ConnectionClosed);
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward outgoing channel to the socket, then close it.
        let (out_tx, mut out_rx) = mpsc::channel::<String>(256);
        self.outgoing_tx = Some(out_tx);
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                if ws_writer.send(Message::Text(text.into())).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
            let _ = ws_writer.close().await;
        });

        *self.state.write().await = ClientState::Connected;

        // Reader task: decode server events.
        let event_tx = self.event_tx.clone();
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match ServerEvent::decode(text.as_str()) {
                        Ok(event) => {
                            if event_tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => log::warn!("Dropping undecodable server event: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }
            *state.write().await = ClientState::Disconnected;
        });

        Ok(())
    }

    /// Send any client event.
    pub async fn send(&self, event: &ClientEvent) -> Result<(), ProtocolError> {
        let tx = self
            .outgoing_tx
            .as_ref()
            .ok_or(ProtocolError::ConnectionClosed)?;
        let text = event.encode()?;
        tx.send(text)
            .await
            .map_err(|_| ProtocolError::ConnectionClosed)
    }

    /// Announce which user this connection belongs to.
    pub async fn join(&self, user: impl Into<UserId>) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::Join(user.into())).await
    }

    pub async fn send_message(
        &self,
        from: impl Into<UserId>,
        to: impl Into<UserId>,
        message: impl Into<String>,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::MessageSend(MessageSend {
            to: to.into(),
            from: from.into(),
            message: message.into(),
        }))
        .await
    }

    pub async fn send_offer(
        &self,
        from: impl Into<UserId>,
        to: impl Into<UserId>,
        offer: Value,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::CallOffer(CallOffer {
            to: to.into(),
            from: from.into(),
            offer,
        }))
        .await
    }

    pub async fn send_answer(
        &self,
        from: impl Into<UserId>,
        to: impl Into<UserId>,
        answer: Value,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::CallAnswer(CallAnswer {
            to: to.into(),
            from: from.into(),
            answer,
        }))
        .await
    }

    pub async fn send_ice_candidate(
        &self,
        from: impl Into<UserId>,
        to: impl Into<UserId>,
        candidate: Value,
    ) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::IceCandidate(IceCandidate {
            to: to.into(),
            from: from.into(),
            candidate,
        }))
        .await
    }

    /// Clear the user's pending notifications on the server.
    pub async fn mark_read(&self, user: impl Into<UserId>) -> Result<(), ProtocolError> {
        self.send(&ClientEvent::MarkRead(user.into())).await
    }

    /// Close the connection after flushing queued frames.
    pub async fn close(&mut self) {
        self.outgoing_tx = None;
        *self.state.write().await = ClientState::Disconnected;
    }

    /// Get the current connection state.
    pub async fn connection_state(&self) -> ClientState {
        *self.state.read().await
    }

    /// Get the server URL.
    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}
