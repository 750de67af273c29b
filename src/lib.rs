//! meshcall - WebRTC Signaling & Peer-Lifecycle-Orchestrierung
//!
//! Koordiniert Peer-Connections über einen Broadcast-JSON-Relay:
//! - Mesh-Voice-Channel mit einer Transport-Session pro Mitglied
//! - 1:1-Anrufe mit Offer/Ring/Answer/Hangup-Zustandsmaschine
//! - Kandidaten-Pufferung bis die Remote Description steht
//! - WebRTC für den Medientransport, cpal für die Audio-Aufnahme
//!
//! Der Relay stellt jede Nachricht an ALLE Teilnehmer zu, auch an den
//! Absender - Echo-Filterung und Adressierung passieren clientseitig.

pub mod call;
pub mod media;
pub mod rtc;
pub mod signaling;
pub mod voice;

pub use call::{CallError, CallEvent, CallPeer, CallSession, CallStatus};
pub use media::{DeviceMediaSource, LocalMedia, MediaProfile, MediaSource, RemoteStream, TrackKind};
pub use rtc::{RtcConfig, RtcSessionFactory, SessionFactory, TransportState};
pub use signaling::{LocalIdentity, RelayClient, SignalKind, SignalMessage, SignalOutbox};
pub use voice::{MeshEvent, VoiceMesh};

/// Initialisiert das Logging über `RUST_LOG`, mit sinnvollen Defaults
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("meshcall=debug".parse().expect("static directive"))
                .add_directive("webrtc=warn".parse().expect("static directive")),
        )
        .init();
}
