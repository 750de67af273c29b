//! Signaling: Broadcast-Envelope und Relay-Anbindung
//!
//! Der Transport ist ein dummes Broadcast-Relay: jede Nachricht geht an
//! alle Mitglieder des Channels, unsortiert und ohne Deduplizierung -
//! inklusive des Absenders selbst. Alle Protokoll-Entscheidungen passieren
//! beim Empfänger.

pub mod client;
pub mod messages;

pub use client::{RelayClient, RelayEvent, SignalingError};
pub use messages::{
    IceCandidate, LocalIdentity, SdpKind, SessionDescription, SignalKind, SignalMessage,
};

use async_trait::async_trait;

/// Ausgang für Signaling-Nachrichten
///
/// Produktion: `RelayClient`. Tests hängen hier einen Sammel-Puffer ein.
#[async_trait]
pub trait SignalOutbox: Send + Sync {
    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError>;
}
