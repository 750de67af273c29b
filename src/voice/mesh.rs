//! Peer Connection Orchestrator für den Mesh-Voice-Channel
//!
//! Hält pro aktivem Mitglied genau eine Transport-Session und konvergiert
//! unabhängig von der Zustellreihenfolge der Signale. Das Join-Protokoll:
//!
//! 1. Lokaler Join: Medien beschaffen, `voice_join` broadcasten.
//! 2. Bestehende Mitglieder antworten mit `voice_presence`.
//! 3. Der NEULING initiiert daraufhin das Offer zu jedem Antwortenden -
//!    fester Tie-Break, damit nie beide Seiten gleichzeitig anbieten.
//!
//! Defekte Sessions werden nicht automatisch neu verbunden, sondern beim
//! nächsten Join/Offer desselben Peers abgeräumt.

use crate::media::{LocalMedia, MediaError, MediaProfile, MediaSource, RemoteStream};
use crate::rtc::{
    Admission, CandidateQueue, MediaSession, RtcError, SessionEvent, SessionFactory, SessionId,
    TransportState,
};
use crate::signaling::{LocalIdentity, SignalKind, SignalMessage, SignalOutbox, SignalingError};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum MeshError {
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Transport error: {0}")]
    Transport(#[from] RtcError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("Already joined the voice channel")]
    AlreadyJoined,

    #[error("Not in a voice channel")]
    NotJoined,
}

// ============================================================================
// PEER RECORDS & EVENTS
// ============================================================================

/// Ein Mitglied des Meshs samt seiner Transport-Session
///
/// Invariante: höchstens ein Record pro peer_id; ein zweites Offer desselben
/// Peers ersetzt den Record atomar (Restart), es wird nie gemerged.
pub struct PeerRecord {
    peer_id: String,
    display_name: String,
    session: Arc<dyn MediaSession>,
    session_id: SessionId,
    remote_ready: bool,
    remote_stream: Option<RemoteStream>,
    state: TransportState,
}

impl PeerRecord {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    pub fn connection_state(&self) -> TransportState {
        self.state
    }
}

impl std::fmt::Debug for PeerRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRecord")
            .field("peer_id", &self.peer_id)
            .field("display_name", &self.display_name)
            .field("state", &self.state)
            .field("remote_ready", &self.remote_ready)
            .field("has_stream", &self.remote_stream.is_some())
            .finish()
    }
}

/// Reaktive Ereignisse für die Präsentationsschicht
#[derive(Debug, Clone)]
pub enum MeshEvent {
    PeerAdded {
        peer_id: String,
        display_name: String,
    },
    PeerRemoved {
        peer_id: String,
    },
    StreamUpdated {
        peer_id: String,
    },
    PeerStateChanged {
        peer_id: String,
        state: TransportState,
    },
}

// ============================================================================
// VOICE MESH
// ============================================================================

/// Orchestrator für einen Mesh-Voice-Channel
///
/// Single-threaded, event-getrieben: alle Methoden laufen als Reaktion auf
/// eine Nutzeraktion oder eine zugestellte Nachricht. Transport-Ereignisse
/// werden über `process_events` aus der Session-Queue nachgezogen.
pub struct VoiceMesh {
    identity: LocalIdentity,
    channel_id: String,
    media_source: Arc<dyn MediaSource>,
    sessions: Arc<dyn SessionFactory>,
    outbox: Arc<dyn SignalOutbox>,
    profile: MediaProfile,

    local_media: Option<LocalMedia>,
    peers: HashMap<String, PeerRecord>,
    /// Kandidaten-Puffer pro Peer - existiert auch bevor ein Record existiert,
    /// weil das Relay keine Offer-vor-Candidate-Ordnung garantiert
    queues: HashMap<String, CandidateQueue>,

    event_tx: mpsc::UnboundedSender<SessionEvent>,
    event_rx: mpsc::UnboundedReceiver<SessionEvent>,
    next_session: SessionId,
    mesh_events: broadcast::Sender<MeshEvent>,
}

impl VoiceMesh {
    pub fn new(
        identity: LocalIdentity,
        channel_id: impl Into<String>,
        media_source: Arc<dyn MediaSource>,
        sessions: Arc<dyn SessionFactory>,
        outbox: Arc<dyn SignalOutbox>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (mesh_events, _) = broadcast::channel(100);

        Self {
            identity,
            channel_id: channel_id.into(),
            media_source,
            sessions,
            outbox,
            profile: MediaProfile::default(),
            local_media: None,
            peers: HashMap::new(),
            queues: HashMap::new(),
            event_tx,
            event_rx,
            next_session: 1,
            mesh_events,
        }
    }

    /// Überschreibt das Medien-Profil (Default: Audio + Video 720x480)
    pub fn with_profile(mut self, profile: MediaProfile) -> Self {
        self.profile = profile;
        self
    }

    // ========================================================================
    // PUBLIC API
    // ========================================================================

    /// Betritt den Voice-Channel: Medien beschaffen, `voice_join` broadcasten
    ///
    /// Schlägt die Medien-Beschaffung oder der Broadcast fehl, bleibt der
    /// Orchestrator unverändert - die Medien werden wieder freigegeben und
    /// es bleibt kein Teil-Zustand zurück.
    pub async fn join_voice(&mut self) -> Result<(), MeshError> {
        if self.local_media.is_some() {
            return Err(MeshError::AlreadyJoined);
        }

        let media = self.media_source.acquire(&self.profile).await?;
        tracing::info!(channel_id = %self.channel_id, "joining voice channel");

        if let Err(e) = self.send(SignalMessage::voice_join(&self.identity)).await {
            // Niemand hat uns gehört - Mikrofon/Kamera dürfen nicht anbleiben
            media.stop();
            return Err(e);
        }
        self.local_media = Some(media);
        Ok(())
    }

    /// Verlässt den Voice-Channel
    ///
    /// Schließt alle Sessions und gibt die lokalen Medien frei - auch wenn
    /// der `voice_leave`-Broadcast fehlschlägt oder Verhandlungen gerade
    /// in der Schwebe sind.
    pub async fn leave_voice(&mut self) -> Result<(), MeshError> {
        let media = self.local_media.take().ok_or(MeshError::NotJoined)?;

        tracing::info!(channel_id = %self.channel_id, "leaving voice channel");
        let send_result = self.send(SignalMessage::voice_leave(&self.identity)).await;

        let peer_ids: Vec<String> = self.peers.keys().cloned().collect();
        for peer_id in peer_ids {
            self.remove_peer(&peer_id).await;
        }
        self.queues.clear();
        media.stop();

        send_result
    }

    /// Verarbeitet eine vom Transport zugestellte Signaling-Nachricht
    pub async fn handle_signal(&mut self, msg: SignalMessage) -> Result<(), MeshError> {
        if msg.is_echo_of(&self.identity) {
            return Ok(());
        }
        if self.local_media.is_none() {
            // Vor dem eigenen Join sind wir nicht Teil des Protokolls
            tracing::debug!(kind = ?msg.kind, "signal before join ignored");
            return Ok(());
        }

        match msg.kind {
            SignalKind::VoiceJoin => self.on_join(msg).await,
            SignalKind::VoicePresence => self.on_presence(msg).await,
            SignalKind::VoiceLeave => self.on_leave(msg).await,
            SignalKind::CallOffer => self.on_offer(msg).await,
            SignalKind::CallAnswer => self.on_answer(msg).await,
            SignalKind::IceCandidate => self.on_candidate(msg).await,
            SignalKind::CallEnd => {
                // 1:1-Semantik, im Mesh bedeutungslos
                tracing::trace!("call_end ignored in mesh mode");
                Ok(())
            }
        }
    }

    /// Zieht alle anstehenden Transport-Ereignisse aus der Session-Queue nach
    pub async fn process_events(&mut self) -> Result<(), MeshError> {
        while let Ok(event) = self.event_rx.try_recv() {
            self.handle_session_event(event).await?;
        }
        Ok(())
    }

    /// Wendet ein einzelnes Transport-Ereignis an
    ///
    /// Ereignisse mit veralteter Session-Id (Record ersetzt oder entfernt)
    /// werden verworfen statt angewendet.
    pub async fn handle_session_event(&mut self, event: SessionEvent) -> Result<(), MeshError> {
        match event {
            SessionEvent::CandidateGathered {
                peer_id,
                session,
                candidate,
            } => {
                if !self.session_is_current(&peer_id, session) {
                    tracing::debug!(peer_id = %peer_id, "stale candidate event discarded");
                    return Ok(());
                }
                self.send(SignalMessage::ice_candidate(
                    &self.identity,
                    &candidate,
                    Some(&peer_id),
                ))
                .await
            }

            SessionEvent::TrackArrived {
                peer_id,
                session,
                stream,
            } => {
                let Some(record) = self.peers.get_mut(&peer_id) else {
                    return Ok(());
                };
                if record.session_id != session {
                    tracing::debug!(peer_id = %peer_id, "stale track event discarded");
                    return Ok(());
                }
                let merged = match &record.remote_stream {
                    Some(existing) if existing.stream_id() == stream.stream_id() => {
                        existing.merge(&stream);
                        true
                    }
                    _ => false,
                };
                if !merged {
                    record.remote_stream = Some(stream);
                }
                let _ = self.mesh_events.send(MeshEvent::StreamUpdated { peer_id });
                Ok(())
            }

            SessionEvent::StateChanged {
                peer_id,
                session,
                state,
            } => {
                let Some(record) = self.peers.get_mut(&peer_id) else {
                    return Ok(());
                };
                if record.session_id != session {
                    return Ok(());
                }
                record.state = state;
                if matches!(
                    state,
                    TransportState::Failed | TransportState::Disconnected
                ) {
                    // Kein synchroner Retry; der nächste Join/Offer-Zyklus
                    // dieses Peers räumt die Session ab
                    tracing::warn!(peer_id = %peer_id, ?state, "transport degraded");
                }
                let _ = self
                    .mesh_events
                    .send(MeshEvent::PeerStateChanged { peer_id, state });
                Ok(())
            }
        }
    }

    /// Schaltet die lokalen Audio-Tracks um; gibt den neuen Zustand zurück
    pub fn toggle_audio(&self) -> bool {
        match &self.local_media {
            Some(media) => {
                let enabled = !media.audio_enabled();
                media.set_audio_enabled(enabled);
                enabled
            }
            None => false,
        }
    }

    /// Schaltet die lokalen Video-Tracks um; gibt den neuen Zustand zurück
    pub fn toggle_video(&self) -> bool {
        match &self.local_media {
            Some(media) => {
                let enabled = !media.video_enabled();
                media.set_video_enabled(enabled);
                enabled
            }
            None => false,
        }
    }

    pub fn is_joined(&self) -> bool {
        self.local_media.is_some()
    }

    pub fn local_stream(&self) -> Option<&LocalMedia> {
        self.local_media.as_ref()
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerRecord> {
        self.peers.values()
    }

    pub fn peer(&self, peer_id: &str) -> Option<&PeerRecord> {
        self.peers.get(peer_id)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Gibt einen Receiver für Mesh-Ereignisse zurück
    pub fn subscribe(&self) -> broadcast::Receiver<MeshEvent> {
        self.mesh_events.subscribe()
    }

    // ========================================================================
    // SIGNAL HANDLERS
    // ========================================================================

    /// `voice_join`: Altlast abräumen, mit `voice_presence` antworten
    async fn on_join(&mut self, msg: SignalMessage) -> Result<(), MeshError> {
        tracing::info!(
            peer_id = %msg.sender_id,
            name = %msg.sender_username,
            "peer joined the voice channel"
        );

        // Nur defekte Records entfernen - ein frischer Join darf nichts
        // Lebendiges abreißen
        if let Some(record) = self.peers.get(&msg.sender_id) {
            if record.state.is_defunct() {
                tracing::info!(peer_id = %msg.sender_id, "reaping defunct session on rejoin");
                self.remove_peer(&msg.sender_id).await;
            }
        }

        self.send(SignalMessage::voice_presence(&self.identity))
            .await
    }

    /// `voice_presence`: wir sind der Neuling und initiieren das Offer
    async fn on_presence(&mut self, msg: SignalMessage) -> Result<(), MeshError> {
        if self.peers.contains_key(&msg.sender_id) {
            // Paar existiert bereits; Tie-Break greift nur für neue Paare
            return Ok(());
        }

        let peer_id = msg.sender_id.clone();
        tracing::info!(peer_id = %peer_id, "presence received, initiating offer");

        let session = self.open_record(&peer_id, &msg.sender_username).await?;
        let offer = match session.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                self.remove_peer(&peer_id).await;
                return Err(e.into());
            }
        };

        self.send(SignalMessage::call_offer(
            &self.identity,
            &offer,
            Some(&peer_id),
        ))
        .await
    }

    /// `voice_leave`: Session schließen und Record entfernen
    async fn on_leave(&mut self, msg: SignalMessage) -> Result<(), MeshError> {
        tracing::info!(peer_id = %msg.sender_id, "peer left the voice channel");
        self.remove_peer(&msg.sender_id).await;
        Ok(())
    }

    /// `call_offer`: Antwortseite aufbauen; ein Offer eines bekannten Peers
    /// gewinnt immer gegen dessen alte Session (Restart)
    async fn on_offer(&mut self, msg: SignalMessage) -> Result<(), MeshError> {
        if msg.is_addressed_elsewhere(&self.identity) {
            return Ok(());
        }
        let Some(description) = msg.description() else {
            tracing::warn!(peer_id = %msg.sender_id, "offer without usable description dropped");
            return Ok(());
        };

        let peer_id = msg.sender_id.clone();
        if self.peers.contains_key(&peer_id) {
            tracing::warn!(peer_id = %peer_id, "offer from known peer, replacing stale session");
            self.remove_peer(&peer_id).await;
        }

        let session = self.open_record(&peer_id, &msg.sender_username).await?;

        if let Err(e) = session.set_remote_description(description).await {
            self.remove_peer(&peer_id).await;
            return Err(e.into());
        }
        self.flush_candidates(&peer_id).await;

        let answer = match session.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                self.remove_peer(&peer_id).await;
                return Err(e.into());
            }
        };

        self.send(SignalMessage::call_answer(
            &self.identity,
            &answer,
            Some(&peer_id),
        ))
        .await
    }

    /// `call_answer`: Remote Description setzen, Queue flushen
    async fn on_answer(&mut self, msg: SignalMessage) -> Result<(), MeshError> {
        if msg.is_addressed_elsewhere(&self.identity) {
            return Ok(());
        }
        let Some(description) = msg.description() else {
            tracing::warn!(peer_id = %msg.sender_id, "answer without usable description dropped");
            return Ok(());
        };
        let Some(record) = self.peers.get(&msg.sender_id) else {
            tracing::warn!(peer_id = %msg.sender_id, "answer from peer without session dropped");
            return Ok(());
        };

        let peer_id = msg.sender_id.clone();
        let session = Arc::clone(&record.session);
        if let Err(e) = session.set_remote_description(description).await {
            if let Some(record) = self.peers.get_mut(&peer_id) {
                record.state = TransportState::Failed;
            }
            return Err(e.into());
        }
        self.flush_candidates(&peer_id).await;
        Ok(())
    }

    /// `ice_candidate`: anwenden sobald möglich, sonst puffern
    ///
    /// Bewusst KEIN target-Filter - die Zuordnung läuft über sender_id,
    /// und Kandidaten können vor dem Offer des Peers eintreffen.
    async fn on_candidate(&mut self, msg: SignalMessage) -> Result<(), MeshError> {
        let Some(candidate) = msg.candidate() else {
            tracing::warn!(peer_id = %msg.sender_id, "candidate without usable payload dropped");
            return Ok(());
        };

        let peer_id = msg.sender_id.clone();
        let remote_ready = self
            .peers
            .get(&peer_id)
            .map(|r| r.remote_ready)
            .unwrap_or(false);

        let admission = self
            .queues
            .entry(peer_id.clone())
            .or_default()
            .admit(candidate.clone(), remote_ready);

        match admission {
            Admission::Apply => {
                if let Some(record) = self.peers.get(&peer_id) {
                    let session = Arc::clone(&record.session);
                    if let Err(e) = session.add_remote_candidate(candidate).await {
                        tracing::warn!(peer_id = %peer_id, "failed to apply candidate: {}", e);
                    }
                }
            }
            Admission::Queued => {
                tracing::trace!(peer_id = %peer_id, "candidate queued (no remote description yet)");
            }
            Admission::Duplicate => {
                tracing::debug!(peer_id = %peer_id, "duplicate candidate ignored");
            }
            Admission::Overflow => {
                tracing::warn!(peer_id = %peer_id, "candidate queue full, candidate dropped");
            }
        }
        Ok(())
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    /// Legt Record + Session für einen Peer an und hängt die lokalen Tracks an
    async fn open_record(
        &mut self,
        peer_id: &str,
        display_name: &str,
    ) -> Result<Arc<dyn MediaSession>, MeshError> {
        let session_id = self.next_session;
        self.next_session += 1;

        let session = self
            .sessions
            .open_session(peer_id, session_id, self.event_tx.clone())
            .await?;

        if let Some(media) = &self.local_media {
            if let Err(e) = session.attach_local_media(media).await {
                session.close().await;
                return Err(e.into());
            }
        }

        self.peers.insert(
            peer_id.to_string(),
            PeerRecord {
                peer_id: peer_id.to_string(),
                display_name: display_name.to_string(),
                session: Arc::clone(&session),
                session_id,
                remote_ready: false,
                remote_stream: None,
                state: TransportState::New,
            },
        );
        self.queues.entry(peer_id.to_string()).or_default();

        let _ = self.mesh_events.send(MeshEvent::PeerAdded {
            peer_id: peer_id.to_string(),
            display_name: display_name.to_string(),
        });

        Ok(session)
    }

    /// Schließt Session und entfernt Record + Queue eines Peers
    async fn remove_peer(&mut self, peer_id: &str) {
        if let Some(record) = self.peers.remove(peer_id) {
            record.session.close().await;
            self.queues.remove(peer_id);
            let _ = self.mesh_events.send(MeshEvent::PeerRemoved {
                peer_id: peer_id.to_string(),
            });
        }
    }

    /// Markiert die Remote Description als gesetzt und wendet die
    /// gepufferten Kandidaten in Ankunftsreihenfolge an
    async fn flush_candidates(&mut self, peer_id: &str) {
        let session = match self.peers.get_mut(peer_id) {
            Some(record) => {
                record.remote_ready = true;
                Arc::clone(&record.session)
            }
            None => return,
        };

        let drained = self
            .queues
            .get_mut(peer_id)
            .map(CandidateQueue::drain)
            .unwrap_or_default();
        if drained.is_empty() {
            return;
        }

        tracing::debug!(peer_id = %peer_id, count = drained.len(), "flushing queued candidates");
        for candidate in drained {
            if let Err(e) = session.add_remote_candidate(candidate).await {
                tracing::warn!(peer_id = %peer_id, "failed to apply queued candidate: {}", e);
            }
        }
    }

    fn session_is_current(&self, peer_id: &str, session: SessionId) -> bool {
        self.peers
            .get(peer_id)
            .is_some_and(|record| record.session_id == session)
    }

    /// Stempelt die Channel-Id und schickt die Nachricht raus
    async fn send(&self, mut msg: SignalMessage) -> Result<(), MeshError> {
        msg.channel_id = Some(self.channel_id.clone());
        self.outbox.send(msg).await?;
        Ok(())
    }
}

impl std::fmt::Debug for VoiceMesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VoiceMesh")
            .field("channel_id", &self.channel_id)
            .field("joined", &self.is_joined())
            .field("peers", &self.peers.len())
            .finish()
    }
}
