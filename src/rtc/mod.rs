//! Transport-Sessions: Verhandlung direkter P2P-Medienkanäle
//!
//! `MediaSession` kapselt genau eine verschlüsselte Peer-Verbindung
//! (SDP-Austausch, Candidate-Gathering, Track-Anbindung). Alle Transport-
//! Ereignisse laufen als `SessionEvent`-Nachrichten in die Queue des
//! besitzenden Orchestrators statt als Callbacks - so bleibt die
//! Zustandslogik ohne echten Transport testbar.

pub mod candidate_queue;
pub mod session;

pub use candidate_queue::{Admission, CandidateQueue, MAX_QUEUED_CANDIDATES};
pub use session::{
    MediaSession, RtcError, RtcSession, RtcSessionFactory, SessionEvent, SessionFactory, SessionId,
};

use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

// ============================================================================
// ICE SERVER CONFIGURATION
// ============================================================================

/// Konfiguration für neue Transport-Sessions
#[derive(Debug, Clone)]
pub struct RtcConfig {
    pub ice_servers: Vec<RTCIceServer>,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: default_ice_servers(),
        }
    }
}

impl RtcConfig {
    /// Fügt optionale TURN-Server Credentials hinzu
    pub fn add_turn_server(&mut self, url: String, username: String, credential: String) {
        self.ice_servers.push(RTCIceServer {
            urls: vec![url],
            username,
            credential,
            ..Default::default()
        });
    }
}

/// Standard STUN-Server Konfiguration
pub fn default_ice_servers() -> Vec<RTCIceServer> {
    vec![
        // Google STUN (kostenlos, reicht für die meisten Verbindungen)
        RTCIceServer {
            urls: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            ..Default::default()
        },
    ]
}

// ============================================================================
// TRANSPORT STATE
// ============================================================================

/// Verbindungszustand einer Transport-Session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl TransportState {
    /// Session ist endgültig unbrauchbar und darf beim nächsten
    /// Join/Offer-Zyklus abgeräumt werden
    pub fn is_defunct(&self) -> bool {
        matches!(self, TransportState::Failed | TransportState::Closed)
    }
}

impl From<RTCPeerConnectionState> for TransportState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => TransportState::Connecting,
            RTCPeerConnectionState::Connected => TransportState::Connected,
            RTCPeerConnectionState::Disconnected => TransportState::Disconnected,
            RTCPeerConnectionState::Failed => TransportState::Failed,
            RTCPeerConnectionState::Closed => TransportState::Closed,
            _ => TransportState::New,
        }
    }
}
