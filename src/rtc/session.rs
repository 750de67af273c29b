//! Media Transport Session
//!
//! Trait-Schnittstelle plus die Produktions-Implementierung über die
//! webrtc-Crate. Jede Session gehört genau einem PeerRecord bzw. einer
//! CallSession und ist über eine monoton steigende `SessionId` an ihn
//! gebunden - Events veralteter Sessions werden am Empfänger verworfen.

use super::{RtcConfig, TransportState};
use crate::media::{LocalMedia, RemoteStream, RemoteTrack, TrackKind};
use crate::signaling::messages::{IceCandidate, SdpKind, SessionDescription};
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum RtcError {
    #[error("WebRTC error: {0}")]
    WebRTC(String),

    #[error("Invalid SDP: {0}")]
    InvalidSdp(String),
}

// ============================================================================
// SESSION EVENTS
// ============================================================================

/// Laufende Nummer einer Session innerhalb eines Orchestrators
pub type SessionId = u64;

/// Transport-Ereignisse als Nachrichten an den besitzenden Orchestrator
///
/// `session` identifiziert die auslösende Session; nach einem Teardown
/// eintreffende Events tragen eine veraltete Id und werden verworfen.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Lokal gesammelter Netzwerk-Kandidat, muss zum Peer signalisiert werden
    CandidateGathered {
        peer_id: String,
        session: SessionId,
        candidate: IceCandidate,
    },
    /// Remote-Track eingetroffen
    TrackArrived {
        peer_id: String,
        session: SessionId,
        stream: RemoteStream,
    },
    /// Verbindungszustand hat sich geändert
    StateChanged {
        peer_id: String,
        session: SessionId,
        state: TransportState,
    },
}

// ============================================================================
// TRAIT SEAMS
// ============================================================================

/// Eine verhandelte P2P-Medienverbindung zu genau einem Peer
#[async_trait]
pub trait MediaSession: Send + Sync {
    /// Hängt die lokalen Tracks an die Verbindung
    async fn attach_local_media(&self, media: &LocalMedia) -> Result<(), RtcError>;

    /// Erzeugt ein Offer und setzt es als Local Description
    async fn create_offer(&self) -> Result<SessionDescription, RtcError>;

    /// Erzeugt ein Answer und setzt es als Local Description
    async fn create_answer(&self) -> Result<SessionDescription, RtcError>;

    /// Setzt die Remote Description des Peers
    async fn set_remote_description(&self, description: SessionDescription)
        -> Result<(), RtcError>;

    /// Wendet einen Netzwerk-Kandidaten des Peers an
    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError>;

    /// Schließt die Verbindung; idempotent
    async fn close(&self);
}

/// Baut Transport-Sessions - im Test durch eine Fake-Factory ersetzt
#[async_trait]
pub trait SessionFactory: Send + Sync {
    async fn open_session(
        &self,
        peer_id: &str,
        session: SessionId,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<dyn MediaSession>, RtcError>;
}

// ============================================================================
// WEBRTC IMPLEMENTATION
// ============================================================================

/// Produktions-Session über `RTCPeerConnection`
pub struct RtcSession {
    pc: Arc<RTCPeerConnection>,
}

#[async_trait]
impl MediaSession for RtcSession {
    async fn attach_local_media(&self, media: &LocalMedia) -> Result<(), RtcError> {
        for track in media.rtc_tracks() {
            self.pc
                .add_track(track)
                .await
                .map_err(|e| RtcError::WebRTC(e.to_string()))?;
        }
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        let offer = self
            .pc
            .create_offer(None)
            .await
            .map_err(|e| RtcError::WebRTC(e.to_string()))?;

        self.pc
            .set_local_description(offer.clone())
            .await
            .map_err(|e| RtcError::WebRTC(e.to_string()))?;

        Ok(SessionDescription::offer(offer.sdp))
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        let answer = self
            .pc
            .create_answer(None)
            .await
            .map_err(|e| RtcError::WebRTC(e.to_string()))?;

        self.pc
            .set_local_description(answer.clone())
            .await
            .map_err(|e| RtcError::WebRTC(e.to_string()))?;

        Ok(SessionDescription::answer(answer.sdp))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        let remote = match description.kind {
            SdpKind::Offer => RTCSessionDescription::offer(description.sdp),
            SdpKind::Answer => RTCSessionDescription::answer(description.sdp),
        }
        .map_err(|e| RtcError::InvalidSdp(e.to_string()))?;

        self.pc
            .set_remote_description(remote)
            .await
            .map_err(|e| RtcError::WebRTC(e.to_string()))
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            ..Default::default()
        };

        self.pc
            .add_ice_candidate(init)
            .await
            .map_err(|e| RtcError::WebRTC(e.to_string()))
    }

    async fn close(&self) {
        if let Err(e) = self.pc.close().await {
            tracing::warn!("failed to close peer connection: {}", e);
        }
    }
}

/// Factory für `RtcSession`s
pub struct RtcSessionFactory {
    config: RtcConfig,
}

impl RtcSessionFactory {
    pub fn new(config: RtcConfig) -> Self {
        Self { config }
    }
}

impl Default for RtcSessionFactory {
    fn default() -> Self {
        Self::new(RtcConfig::default())
    }
}

#[async_trait]
impl SessionFactory for RtcSessionFactory {
    async fn open_session(
        &self,
        peer_id: &str,
        session: SessionId,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<dyn MediaSession>, RtcError> {
        // Media Engine mit Standard-Codecs
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| RtcError::WebRTC(e.to_string()))?;

        // Interceptors für RTCP, NACK etc.
        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)
            .map_err(|e| RtcError::WebRTC(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let config = RTCConfiguration {
            ice_servers: self.config.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(config)
                .await
                .map_err(|e| RtcError::WebRTC(e.to_string()))?,
        );

        register_event_handlers(&pc, peer_id.to_string(), session, events);

        tracing::debug!(peer_id, session, "opened transport session");
        Ok(Arc::new(RtcSession { pc }))
    }
}

/// Verdrahtet die Transport-Callbacks auf die Event-Queue
fn register_event_handlers(
    pc: &Arc<RTCPeerConnection>,
    peer_id: String,
    session: SessionId,
    events: mpsc::UnboundedSender<SessionEvent>,
) {
    // Connection State
    let peer = peer_id.clone();
    let tx = events.clone();
    pc.on_peer_connection_state_change(Box::new(move |s| {
        tracing::info!(peer_id = %peer, "peer connection state: {:?}", s);
        let _ = tx.send(SessionEvent::StateChanged {
            peer_id: peer.clone(),
            session,
            state: TransportState::from(s),
        });
        Box::pin(async {})
    }));

    // ICE Candidates
    let peer = peer_id.clone();
    let tx = events.clone();
    pc.on_ice_candidate(Box::new(move |candidate| {
        if let Some(c) = candidate {
            if let Ok(init) = c.to_json() {
                let _ = tx.send(SessionEvent::CandidateGathered {
                    peer_id: peer.clone(),
                    session,
                    candidate: IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    },
                });
            }
        }
        Box::pin(async {})
    }));

    // Eingehende Tracks
    let peer = peer_id;
    let tx = events;
    pc.on_track(Box::new(move |track, _, _| {
        let kind = match track.kind() {
            RTPCodecType::Audio => Some(TrackKind::Audio),
            RTPCodecType::Video => Some(TrackKind::Video),
            _ => None,
        };

        if let Some(kind) = kind {
            let stream = RemoteStream::with_track(
                track.stream_id(),
                RemoteTrack::new(kind, Some(Arc::clone(&track))),
            );
            let _ = tx.send(SessionEvent::TrackArrived {
                peer_id: peer.clone(),
                session,
                stream,
            });
        } else {
            tracing::warn!(peer_id = %peer, "track with unspecified codec type ignored");
        }

        Box::pin(async {})
    }));
}
