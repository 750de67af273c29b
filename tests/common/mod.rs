//! Gemeinsame Fakes für die Szenario-Tests
//!
//! Ersetzen WebRTC, Geräte-Medien und den Relay durch In-Memory-Doubles,
//! damit die Orchestratoren deterministisch und ohne Netz testbar sind.
#![allow(dead_code)]

use async_trait::async_trait;
use meshcall::media::{LocalMedia, LocalTrack, MediaError, MediaProfile, MediaSource, TrackKind};
use meshcall::rtc::{MediaSession, RtcError, SessionEvent, SessionFactory, SessionId};
use meshcall::signaling::{
    IceCandidate, LocalIdentity, SessionDescription, SignalKind, SignalMessage, SignalOutbox,
    SignalingError,
};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

// ============================================================================
// FAKE TRANSPORT SESSION
// ============================================================================

/// Eine Transport-Session, die nur mitschreibt statt zu verbinden
#[derive(Default)]
pub struct FakeSession {
    pub attached: AtomicBool,
    pub closed: AtomicBool,
    pub remote_descriptions: Mutex<Vec<SessionDescription>>,
    pub applied_candidates: Mutex<Vec<IceCandidate>>,
    pub fail_remote_description: AtomicBool,
}

impl FakeSession {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn applied(&self) -> Vec<IceCandidate> {
        self.applied_candidates.lock().clone()
    }

    pub fn remote_description_count(&self) -> usize {
        self.remote_descriptions.lock().len()
    }
}

#[async_trait]
impl MediaSession for FakeSession {
    async fn attach_local_media(&self, _media: &LocalMedia) -> Result<(), RtcError> {
        self.attached.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn create_offer(&self) -> Result<SessionDescription, RtcError> {
        Ok(SessionDescription::offer("v=0\r\nfake-offer"))
    }

    async fn create_answer(&self) -> Result<SessionDescription, RtcError> {
        Ok(SessionDescription::answer("v=0\r\nfake-answer"))
    }

    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), RtcError> {
        if self.fail_remote_description.load(Ordering::SeqCst) {
            return Err(RtcError::InvalidSdp("rejected by fake".into()));
        }
        self.remote_descriptions.lock().push(description);
        Ok(())
    }

    async fn add_remote_candidate(&self, candidate: IceCandidate) -> Result<(), RtcError> {
        self.applied_candidates.lock().push(candidate);
        Ok(())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

// ============================================================================
// FAKE SESSION FACTORY
// ============================================================================

pub struct OpenedSession {
    pub peer_id: String,
    pub session_id: SessionId,
    pub session: Arc<FakeSession>,
    pub events: mpsc::UnboundedSender<SessionEvent>,
}

/// Gibt [`FakeSession`]s aus und behält Handles für Assertions
#[derive(Default)]
pub struct FakeSessionFactory {
    pub opened: Mutex<Vec<OpenedSession>>,
    pub fail_next: AtomicBool,
}

impl FakeSessionFactory {
    pub fn opened_count(&self) -> usize {
        self.opened.lock().len()
    }

    /// Die zuletzt geöffnete Session für diesen Peer
    pub fn session_for(&self, peer_id: &str) -> Option<Arc<FakeSession>> {
        self.opened
            .lock()
            .iter()
            .rev()
            .find(|o| o.peer_id == peer_id)
            .map(|o| Arc::clone(&o.session))
    }

    pub fn last_session(&self) -> Option<Arc<FakeSession>> {
        self.opened.lock().last().map(|o| Arc::clone(&o.session))
    }

    /// Speist ein Transport-Ereignis über den Kanal der zuletzt geöffneten
    /// Session dieses Peers ein
    pub fn emit_for(&self, peer_id: &str, make: impl FnOnce(SessionId) -> SessionEvent) {
        let opened = self.opened.lock();
        let entry = opened
            .iter()
            .rev()
            .find(|o| o.peer_id == peer_id)
            .expect("no session opened for peer");
        entry
            .events
            .send(make(entry.session_id))
            .expect("event channel closed");
    }

    pub fn emit_for_last(&self, make: impl FnOnce(SessionId) -> SessionEvent) {
        let opened = self.opened.lock();
        let entry = opened.last().expect("no session opened");
        entry
            .events
            .send(make(entry.session_id))
            .expect("event channel closed");
    }
}

#[async_trait]
impl SessionFactory for FakeSessionFactory {
    async fn open_session(
        &self,
        peer_id: &str,
        session: SessionId,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Result<Arc<dyn MediaSession>, RtcError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(RtcError::WebRTC("fake factory failure".into()));
        }
        let fake = Arc::new(FakeSession::default());
        self.opened.lock().push(OpenedSession {
            peer_id: peer_id.to_string(),
            session_id: session,
            session: Arc::clone(&fake),
            events,
        });
        Ok(fake)
    }
}

// ============================================================================
// FAKE MEDIA SOURCE
// ============================================================================

/// Liefert Tracks ohne Geräte-Zugriff; optional schaltbar auf Fehler
#[derive(Default)]
pub struct FakeMediaSource {
    pub fail: AtomicBool,
}

#[async_trait]
impl MediaSource for FakeMediaSource {
    async fn acquire(&self, profile: &MediaProfile) -> Result<LocalMedia, MediaError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(MediaError::AccessDenied("fake device unavailable".into()));
        }
        let mut tracks = Vec::new();
        if profile.audio {
            tracks.push(LocalTrack::new(TrackKind::Audio, None));
        }
        if profile.video {
            tracks.push(LocalTrack::new(TrackKind::Video, None));
        }
        if tracks.is_empty() {
            return Err(MediaError::EmptyProfile);
        }
        Ok(LocalMedia::new(tracks))
    }
}

// ============================================================================
// MEMORY OUTBOX
// ============================================================================

/// Sammelt gesendete Signale statt sie über einen Socket zu schicken
#[derive(Default)]
pub struct MemoryOutbox {
    pub sent: Mutex<Vec<SignalMessage>>,
    pub fail: AtomicBool,
}

impl MemoryOutbox {
    /// Entnimmt alle bisher gesendeten Nachrichten
    pub fn take(&self) -> Vec<SignalMessage> {
        std::mem::take(&mut *self.sent.lock())
    }

    pub fn kinds(&self) -> Vec<SignalKind> {
        self.sent.lock().iter().map(|m| m.kind).collect()
    }

    pub fn last_of(&self, kind: SignalKind) -> Option<SignalMessage> {
        self.sent
            .lock()
            .iter()
            .rev()
            .find(|m| m.kind == kind)
            .cloned()
    }
}

#[async_trait]
impl SignalOutbox for MemoryOutbox {
    async fn send(&self, message: SignalMessage) -> Result<(), SignalingError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(SignalingError::NotConnected);
        }
        self.sent.lock().push(message);
        Ok(())
    }
}

// ============================================================================
// HELPERS
// ============================================================================

pub fn identity(user_id: &str) -> LocalIdentity {
    LocalIdentity::new(user_id, format!("user-{user_id}"))
}

pub fn candidate(n: u32) -> IceCandidate {
    IceCandidate::new(format!(
        "candidate:{n} 1 udp 2122260223 192.168.0.{n} 54321 typ host"
    ))
}
