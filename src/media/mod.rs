//! Lokale und entfernte Medien-Streams
//!
//! Der lokale Stream (Mikrofon/Kamera) gehört exklusiv genau einer aktiven
//! Session - Mesh-Orchestrator oder Call State Machine. Wird die Session
//! zerstört, MUSS `stop()` laufen, sonst bleibt die Kamera/Mikrofon-Anzeige
//! des Nutzers an. Remote-Streams sind reine Handles für die Darstellung.

pub mod capture;

pub use capture::{AudioCapture, AudioError};

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("Audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("Media access denied: {0}")]
    AccessDenied(String),

    #[error("Media profile requests no tracks")]
    EmptyProfile,
}

// ============================================================================
// TRACK KINDS & PROFILE
// ============================================================================

/// Art eines Medien-Tracks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrackKind {
    Audio,
    Video,
}

/// Welche Tracks beim Acquire angefordert werden
#[derive(Debug, Clone)]
pub struct MediaProfile {
    pub audio: bool,
    pub video: bool,
    pub video_width: u32,
    pub video_height: u32,
}

impl Default for MediaProfile {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            video_width: 720,
            video_height: 480,
        }
    }
}

impl MediaProfile {
    /// Nur Audio (Voice-Channel ohne Kamera)
    pub fn audio_only() -> Self {
        Self {
            audio: true,
            video: false,
            ..Self::default()
        }
    }
}

// ============================================================================
// LOCAL MEDIA
// ============================================================================

/// Ein lokaler Track samt Enabled-Flag
pub struct LocalTrack {
    kind: TrackKind,
    rtc: Option<Arc<dyn TrackLocal + Send + Sync>>,
    enabled: AtomicBool,
}

impl LocalTrack {
    pub fn new(kind: TrackKind, rtc: Option<Arc<dyn TrackLocal + Send + Sync>>) -> Self {
        Self {
            kind,
            rtc,
            enabled: AtomicBool::new(true),
        }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }
}

struct LocalMediaInner {
    stream_id: String,
    tracks: Vec<LocalTrack>,
    capture: Mutex<Option<AudioCapture>>,
    stopped: AtomicBool,
}

/// Handle auf den lokalen Medien-Stream
///
/// Klonbar (Arc-basiert) - die exklusive Eigentümerschaft bezieht sich auf
/// den Lebenszyklus (acquire/stop), nicht auf das Handle selbst.
#[derive(Clone)]
pub struct LocalMedia {
    inner: Arc<LocalMediaInner>,
}

impl LocalMedia {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        Self {
            inner: Arc::new(LocalMediaInner {
                stream_id: format!("meshcall-{}", Uuid::new_v4()),
                tracks,
                capture: Mutex::new(None),
                stopped: AtomicBool::new(false),
            }),
        }
    }

    fn with_capture(tracks: Vec<LocalTrack>, capture: AudioCapture) -> Self {
        let media = Self::new(tracks);
        *media.inner.capture.lock() = Some(capture);
        media
    }

    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    pub fn track_kinds(&self) -> Vec<TrackKind> {
        self.inner.tracks.iter().map(LocalTrack::kind).collect()
    }

    /// Tracks für `RTCPeerConnection::add_track`
    pub fn rtc_tracks(&self) -> Vec<Arc<dyn TrackLocal + Send + Sync>> {
        self.inner
            .tracks
            .iter()
            .filter_map(|t| t.rtc.clone())
            .collect()
    }

    fn set_kind_enabled(&self, kind: TrackKind, enabled: bool) {
        for track in self.inner.tracks.iter().filter(|t| t.kind == kind) {
            track.enabled.store(enabled, Ordering::SeqCst);
        }
        if kind == TrackKind::Audio {
            if let Some(capture) = self.inner.capture.lock().as_ref() {
                capture.set_muted(!enabled);
            }
        }
    }

    fn kind_enabled(&self, kind: TrackKind) -> bool {
        self.inner
            .tracks
            .iter()
            .filter(|t| t.kind == kind)
            .all(LocalTrack::is_enabled)
    }

    /// Schaltet alle Audio-Tracks an/aus - Protokoll-State bleibt unberührt
    pub fn set_audio_enabled(&self, enabled: bool) {
        self.set_kind_enabled(TrackKind::Audio, enabled);
    }

    /// Schaltet alle Video-Tracks an/aus
    pub fn set_video_enabled(&self, enabled: bool) {
        self.set_kind_enabled(TrackKind::Video, enabled);
    }

    pub fn audio_enabled(&self) -> bool {
        self.kind_enabled(TrackKind::Audio)
    }

    pub fn video_enabled(&self) -> bool {
        self.kind_enabled(TrackKind::Video)
    }

    /// Stoppt alle Tracks und gibt das Aufnahmegerät frei
    ///
    /// Idempotent; muss auf jedem Teardown-Pfad laufen.
    pub fn stop(&self) {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(mut capture) = self.inner.capture.lock().take() {
            capture.stop();
        }
        tracing::debug!(stream_id = %self.inner.stream_id, "local media stopped");
    }

    /// Alle Tracks melden gestoppt?
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for LocalMedia {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalMedia")
            .field("stream_id", &self.inner.stream_id)
            .field("tracks", &self.track_kinds())
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

// ============================================================================
// REMOTE MEDIA
// ============================================================================

/// Ein vom Peer empfangener Track
#[derive(Clone)]
pub struct RemoteTrack {
    kind: TrackKind,
    rtc: Option<Arc<TrackRemote>>,
}

impl RemoteTrack {
    pub fn new(kind: TrackKind, rtc: Option<Arc<TrackRemote>>) -> Self {
        Self { kind, rtc }
    }

    pub fn kind(&self) -> TrackKind {
        self.kind
    }

    pub fn rtc(&self) -> Option<Arc<TrackRemote>> {
        self.rtc.clone()
    }
}

struct RemoteStreamInner {
    stream_id: String,
    tracks: Mutex<Vec<RemoteTrack>>,
}

/// Handle auf den Medien-Stream eines Peers
///
/// Tracks treffen asynchron einzeln ein und werden hier unter ihrer
/// Stream-ID zusammengeführt.
#[derive(Clone)]
pub struct RemoteStream {
    inner: Arc<RemoteStreamInner>,
}

impl RemoteStream {
    pub fn new(stream_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(RemoteStreamInner {
                stream_id: stream_id.into(),
                tracks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn with_track(stream_id: impl Into<String>, track: RemoteTrack) -> Self {
        let stream = Self::new(stream_id);
        stream.push_track(track);
        stream
    }

    pub fn stream_id(&self) -> &str {
        &self.inner.stream_id
    }

    pub fn push_track(&self, track: RemoteTrack) {
        self.inner.tracks.lock().push(track);
    }

    /// Übernimmt die Tracks eines weiteren Events derselben Stream-ID
    pub fn merge(&self, other: &RemoteStream) {
        let incoming: Vec<RemoteTrack> = other.inner.tracks.lock().clone();
        self.inner.tracks.lock().extend(incoming);
    }

    pub fn track_kinds(&self) -> Vec<TrackKind> {
        self.inner.tracks.lock().iter().map(RemoteTrack::kind).collect()
    }
}

impl std::fmt::Debug for RemoteStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteStream")
            .field("stream_id", &self.inner.stream_id)
            .field("tracks", &self.track_kinds())
            .finish()
    }
}

// ============================================================================
// MEDIA SOURCE
// ============================================================================

/// Abstraktion über die Medien-Beschaffung
///
/// Acquire kann beliebig lange dauern (Geräte-Freigabe durch den Nutzer)
/// und fehlschlagen - beides ohne Teil-Session zu hinterlassen.
#[async_trait]
pub trait MediaSource: Send + Sync {
    async fn acquire(&self, profile: &MediaProfile) -> Result<LocalMedia, MediaError>;
}

/// Produktions-Quelle: Mikrofon über cpal, Tracks über die webrtc-API
#[derive(Debug, Default)]
pub struct DeviceMediaSource;

#[async_trait]
impl MediaSource for DeviceMediaSource {
    async fn acquire(&self, profile: &MediaProfile) -> Result<LocalMedia, MediaError> {
        if !profile.audio && !profile.video {
            return Err(MediaError::EmptyProfile);
        }

        let stream_id = format!("meshcall-{}", Uuid::new_v4());
        let mut tracks = Vec::new();
        let mut capture = None;

        if profile.audio {
            let mut audio = AudioCapture::new()?;
            audio.start()?;
            capture = Some(audio);

            let audio_track = Arc::new(TrackLocalStaticRTP::new(
                RTCRtpCodecCapability {
                    mime_type: "audio/opus".to_string(),
                    clock_rate: capture::SAMPLE_RATE,
                    channels: capture::CHANNELS,
                    ..Default::default()
                },
                "audio".to_string(),
                stream_id.clone(),
            ));
            tracks.push(LocalTrack::new(
                TrackKind::Audio,
                Some(audio_track as Arc<dyn TrackLocal + Send + Sync>),
            ));
        }

        if profile.video {
            let video_track = Arc::new(TrackLocalStaticSample::new(
                RTCRtpCodecCapability {
                    mime_type: "video/VP8".to_string(),
                    clock_rate: 90000,
                    ..Default::default()
                },
                "video".to_string(),
                stream_id.clone(),
            ));
            tracks.push(LocalTrack::new(
                TrackKind::Video,
                Some(video_track as Arc<dyn TrackLocal + Send + Sync>),
            ));
        }

        tracing::info!(
            audio = profile.audio,
            video = profile.video,
            "acquired local media"
        );

        Ok(match capture {
            Some(c) => LocalMedia::with_capture(tracks, c),
            None => LocalMedia::new(tracks),
        })
    }
}

// ============================================================================
// TESTS
// ============================================================================
