//! WebSocket Client für das Broadcast-Relay
//!
//! Verbindet sich auf den Channel-Socket (`/ws/{channel_id}/{token}`),
//! liest eingehende Frames und reicht erkannte Signaling-Nachrichten an die
//! Applikation weiter. Der Socket transportiert auch Chat-Traffic - alles
//! was nicht als `SignalMessage` parst wird verworfen. Kein automatischer
//! Reconnect: Wiederverbinden ist Sache des Mitglieds (erneuter Join).

use super::messages::SignalMessage;
use super::SignalOutbox;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug, Clone)]
pub enum SignalingError {
    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("WebSocket connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Not connected to relay")]
    NotConnected,

    #[error("Failed to send message: {0}")]
    SendFailed(String),
}

// ============================================================================
// RELAY EVENTS
// ============================================================================

/// Verbindungs-Ereignisse des Relay-Clients
#[derive(Debug, Clone)]
pub enum RelayEvent {
    Connected,
    Disconnected,
}

// ============================================================================
// RELAY CLIENT
// ============================================================================

/// WebSocket-Verbindung zum Broadcast-Relay eines Channels
pub struct RelayClient {
    channel_id: String,
    connected: Arc<RwLock<bool>>,
    tx: mpsc::Sender<String>,
    event_tx: broadcast::Sender<RelayEvent>,
}

impl RelayClient {
    /// Verbindet mit dem Relay des angegebenen Channels
    ///
    /// Gibt den Client plus den Empfänger für eingehende Signaling-
    /// Nachrichten zurück; letzterer wird von der Applikation in
    /// `handle_signal` der Orchestratoren gefüttert.
    pub async fn connect(
        server_url: &str,
        channel_id: &str,
        token: &str,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SignalMessage>), SignalingError> {
        let ws_url = relay_url(server_url, channel_id, token)?;

        tracing::info!(channel_id, "connecting to signaling relay: {}", ws_url);

        let (ws_stream, _) = connect_async(ws_url.as_str())
            .await
            .map_err(|e| SignalingError::ConnectionFailed(e.to_string()))?;

        let (mut write, mut read) = ws_stream.split();

        let (tx, mut rx) = mpsc::channel::<String>(100);
        let (signal_tx, signal_rx) = mpsc::unbounded_channel::<SignalMessage>();
        let (event_tx, _) = broadcast::channel(16);
        let connected = Arc::new(RwLock::new(true));

        let _ = event_tx.send(RelayEvent::Connected);

        // Read-Task: Frames parsen und Signale weiterreichen
        let connected_clone = Arc::clone(&connected);
        let event_tx_clone = event_tx.clone();
        tokio::spawn(async move {
            while let Some(msg_result) = read.next().await {
                match msg_result {
                    Ok(Message::Text(text)) => {
                        match serde_json::from_str::<SignalMessage>(&text) {
                            Ok(signal) => {
                                if signal_tx.send(signal).is_err() {
                                    // Applikation hört nicht mehr zu
                                    break;
                                }
                            }
                            Err(_) => {
                                // Chat-/Typing-Traffic auf demselben Socket
                                tracing::trace!("ignoring non-signal frame");
                            }
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("relay closed the connection");
                        break;
                    }
                    Err(e) => {
                        tracing::error!("relay read error: {}", e);
                        break;
                    }
                    _ => {}
                }
            }

            *connected_clone.write() = false;
            let _ = event_tx_clone.send(RelayEvent::Disconnected);
        });

        // Write-Task
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg)).await {
                    tracing::error!("failed to send relay message: {}", e);
                    break;
                }
            }
        });

        Ok((
            Self {
                channel_id: channel_id.to_string(),
                connected,
                tx,
                event_tx,
            },
            signal_rx,
        ))
    }

    /// Gibt einen Event-Receiver zurück
    pub fn subscribe(&self) -> broadcast::Receiver<RelayEvent> {
        self.event_tx.subscribe()
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.read()
    }

    /// Sendet eine Nachricht non-blocking (try_send)
    pub fn try_send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }
        let text = serde_json::to_string(&message)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;
        self.tx
            .try_send(text)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }
}

#[async_trait]
impl SignalOutbox for RelayClient {
    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        if !self.is_connected() {
            return Err(SignalingError::NotConnected);
        }
        let text = serde_json::to_string(&message)
            .map_err(|e| SignalingError::SendFailed(e.to_string()))?;
        self.tx
            .send(text)
            .await
            .map_err(|e| SignalingError::SendFailed(e.to_string()))
    }
}

impl std::fmt::Debug for RelayClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayClient")
            .field("channel_id", &self.channel_id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Baut die WebSocket-URL des Channel-Relays
fn relay_url(server_url: &str, channel_id: &str, token: &str) -> Result<Url, SignalingError> {
    let mut url =
        Url::parse(server_url).map_err(|e| SignalingError::InvalidUrl(e.to_string()))?;

    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => {
            return Err(SignalingError::InvalidUrl(format!(
                "unsupported scheme: {other}"
            )))
        }
    };
    url.set_scheme(scheme)
        .map_err(|_| SignalingError::InvalidUrl(server_url.to_string()))?;

    url.path_segments_mut()
        .map_err(|_| SignalingError::InvalidUrl(server_url.to_string()))?
        .pop_if_empty()
        .extend(["ws", channel_id, token]);

    Ok(url)
}

// ============================================================================
// TESTS
// ============================================================================
