//! Zustandsmaschine für 1:1-Anrufe
//!
//! Genau ein Anruf zur Zeit: `Idle → Outgoing → Active` beim Anrufen,
//! `Idle → Incoming → Active` beim Angerufen-Werden, aus jedem Zustand
//! zurück nach `Idle` per Hangup oder Transport-Fehler.
//!
//! Kollisions-Regel: Ein eingehendes Offer gewinnt IMMER. Läuft bereits ein
//! Anruf (egal in welchem Zustand), wird er vollständig abgeräumt und das
//! neue Offer behandelt, als wäre die Maschine idle gewesen.

use crate::media::{LocalMedia, MediaError, MediaProfile, MediaSource, RemoteStream};
use crate::rtc::{
    Admission, CandidateQueue, MediaSession, RtcError, SessionEvent, SessionFactory, SessionId,
    TransportState,
};
use crate::signaling::{LocalIdentity, SignalKind, SignalMessage, SignalOutbox, SignalingError};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

// ============================================================================
// ERROR TYPES
// ============================================================================

#[derive(Error, Debug)]
pub enum CallError {
    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Transport error: {0}")]
    Transport(#[from] RtcError),

    #[error("Signaling error: {0}")]
    Signaling(#[from] SignalingError),

    #[error("A call is already in progress")]
    AlreadyInCall,

    #[error("No incoming call to answer")]
    NotRinging,
}

// ============================================================================
// STATUS & EVENTS
// ============================================================================

/// Lebenszyklus eines 1:1-Anrufs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    /// Kein Anruf
    Idle,
    /// Offer gesendet, warten auf Answer
    Outgoing,
    /// Offer empfangen, es klingelt
    Incoming,
    /// Beide Descriptions stehen, der Anruf läuft
    Active,
}

/// Die Gegenstelle eines Anrufs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallPeer {
    pub user_id: String,
    pub username: String,
}

/// Nach außen sichtbare Anruf-Ereignisse
#[derive(Debug, Clone)]
pub enum CallEvent {
    StatusChanged(CallStatus),
    IncomingCall { user_id: String, username: String },
    StreamUpdated,
}

// ============================================================================
// CALL SESSION
// ============================================================================

/// Orchestriert genau einen 1:1-Anruf über den Broadcast-Relay
///
/// Die Maschine ist rein signalgetrieben: `Active` wird beim Signal-Austausch
/// erreicht, nicht erst wenn der Transport `Connected` meldet.
pub struct CallSession {
    identity: LocalIdentity,
    channel_id: String,

    media_source: Arc<dyn MediaSource>,
    sessions: Arc<dyn SessionFactory>,
    outbox: Arc<dyn SignalOutbox>,
    profile: MediaProfile,

    status: CallStatus,
    remote: Option<CallPeer>,
    session: Option<Arc<dyn MediaSession>>,
    session_id: SessionId,
    next_session: SessionId,

    queue: CandidateQueue,
    remote_ready: bool,

    local_media: Option<LocalMedia>,
    remote_stream: Option<RemoteStream>,

    event_tx: mpsc::UnboundedSender<SessionEvent>,
    event_rx: mpsc::UnboundedReceiver<SessionEvent>,
    call_events: broadcast::Sender<CallEvent>,
}

impl CallSession {
    pub fn new(
        identity: LocalIdentity,
        channel_id: impl Into<String>,
        media_source: Arc<dyn MediaSource>,
        sessions: Arc<dyn SessionFactory>,
        outbox: Arc<dyn SignalOutbox>,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (call_events, _) = broadcast::channel(100);

        Self {
            identity,
            channel_id: channel_id.into(),
            media_source,
            sessions,
            outbox,
            profile: MediaProfile::default(),
            status: CallStatus::Idle,
            remote: None,
            session: None,
            session_id: 0,
            next_session: 1,
            queue: CandidateQueue::new(),
            remote_ready: false,
            local_media: None,
            remote_stream: None,
            event_tx,
            event_rx,
            call_events,
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

    /// Startet einen ausgehenden Anruf: Medien beschaffen, Offer broadcasten
    ///
    /// Schlägt ein Schritt fehl (Medien, Transport, Broadcast), bleibt die
    /// Maschine idle - Medien freigegeben, keine Teil-Session angelegt.
    pub async fn start_call(&mut self) -> Result<(), CallError> {
        if self.status != CallStatus::Idle {
            return Err(CallError::AlreadyInCall);
        }

        let media = self.media_source.acquire(&self.profile).await?;
        let session = match self.open_session("outgoing").await {
            Ok(session) => session,
            Err(e) => {
                media.stop();
                return Err(e);
            }
        };

        if let Err(e) = session.attach_local_media(&media).await {
            media.stop();
            session.close().await;
            return Err(e.into());
        }
        let offer = match session.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                media.stop();
                session.close().await;
                return Err(e.into());
            }
        };

        tracing::info!(channel_id = %self.channel_id, "starting outgoing call");

        // Der Angerufene ist noch unbekannt, das Offer geht unadressiert raus
        if let Err(e) = self
            .send(SignalMessage::call_offer(&self.identity, &offer, None))
            .await
        {
            // Offer hat den Relay nie erreicht - nichts darf zurückbleiben
            media.stop();
            session.close().await;
            return Err(e);
        }

        self.local_media = Some(media);
        self.session = Some(session);
        self.set_status(CallStatus::Outgoing);
        Ok(())
    }

    /// Nimmt den klingelnden Anruf an
    ///
    /// Schlägt die Medien-Beschaffung fehl, klingelt es weiter - der Anruf
    /// kann erneut angenommen oder per [`end_call`](Self::end_call)
    /// abgelehnt werden.
    pub async fn answer_call(&mut self) -> Result<(), CallError> {
        if self.status != CallStatus::Incoming {
            return Err(CallError::NotRinging);
        }
        let session = match &self.session {
            Some(session) => Arc::clone(session),
            None => return Err(CallError::NotRinging),
        };

        let media = self.media_source.acquire(&self.profile).await?;
        if let Err(e) = session.attach_local_media(&media).await {
            media.stop();
            return Err(e.into());
        }
        let answer = match session.create_answer().await {
            Ok(answer) => answer,
            Err(e) => {
                media.stop();
                return Err(e.into());
            }
        };

        let target = self.remote.as_ref().map(|peer| peer.user_id.clone());
        tracing::info!(
            peer_id = target.as_deref().unwrap_or("?"),
            "answering incoming call"
        );

        if let Err(e) = self
            .send(SignalMessage::call_answer(
                &self.identity,
                &answer,
                target.as_deref(),
            ))
            .await
        {
            // Answer nicht raus - es klingelt weiter, Medien wieder frei
            media.stop();
            return Err(e);
        }

        self.local_media = Some(media);
        self.set_status(CallStatus::Active);
        Ok(())
    }

    /// Beendet den laufenden oder klingelnden Anruf
    ///
    /// Räumt lokal immer vollständig ab, auch wenn der `call_end`-Broadcast
    /// fehlschlägt. Ohne Anruf ein No-op.
    pub async fn end_call(&mut self) -> Result<(), CallError> {
        if self.status == CallStatus::Idle {
            return Ok(());
        }

        let send_result = self.send(SignalMessage::call_end(&self.identity)).await;
        self.teardown("local hangup").await;
        send_result
    }

    /// Verarbeitet eine vom Transport zugestellte Signaling-Nachricht
    pub async fn handle_signal(&mut self, msg: SignalMessage) -> Result<(), CallError> {
        if msg.is_echo_of(&self.identity) {
            return Ok(());
        }

        match msg.kind {
            SignalKind::CallOffer => self.on_offer(msg).await,
            SignalKind::CallAnswer => self.on_answer(msg).await,
            SignalKind::IceCandidate => self.on_candidate(msg).await,
            SignalKind::CallEnd => self.on_call_end(msg).await,
            SignalKind::VoiceJoin | SignalKind::VoicePresence | SignalKind::VoiceLeave => {
                // Mesh-Semantik, im 1:1-Modus bedeutungslos
                tracing::trace!(kind = ?msg.kind, "voice signal ignored in call mode");
                Ok(())
            }
        }
    }

    /// Zieht alle anstehenden Transport-Ereignisse aus der Session-Queue nach
    pub async fn process_events(&mut self) -> Result<(), CallError> {
        while let Ok(event) = self.event_rx.try_recv() {
            self.handle_session_event(event).await?;
        }
        Ok(())
    }

    /// Wendet ein einzelnes Transport-Ereignis an
    ///
    /// Ereignisse mit veralteter Session-Id (Anruf ersetzt oder beendet)
    /// werden verworfen statt angewendet.
    pub async fn handle_session_event(&mut self, event: SessionEvent) -> Result<(), CallError> {
        match event {
            SessionEvent::CandidateGathered {
                session, candidate, ..
            } => {
                if !self.session_is_current(session) {
                    tracing::trace!(session, "dropping candidate from stale session");
                    return Ok(());
                }
                let target = self.remote.as_ref().map(|peer| peer.user_id.clone());
                self.send(SignalMessage::ice_candidate(
                    &self.identity,
                    &candidate,
                    target.as_deref(),
                ))
                .await
            }
            SessionEvent::TrackArrived {
                session, stream, ..
            } => {
                if !self.session_is_current(session) {
                    tracing::trace!(session, "dropping track from stale session");
                    return Ok(());
                }
                let merged = match &self.remote_stream {
                    Some(existing) if existing.stream_id() == stream.stream_id() => {
                        existing.merge(&stream);
                        true
                    }
                    _ => false,
                };
                if !merged {
                    self.remote_stream = Some(stream);
                }
                let _ = self.call_events.send(CallEvent::StreamUpdated);
                Ok(())
            }
            SessionEvent::StateChanged { session, state, .. } => {
                if !self.session_is_current(session) {
                    return Ok(());
                }
                tracing::debug!(?state, "call transport state changed");
                if matches!(
                    state,
                    TransportState::Failed | TransportState::Closed | TransportState::Disconnected
                ) {
                    tracing::warn!(?state, "call transport lost, ending call");
                    // Kein call_end-Broadcast: die Gegenseite sieht den
                    // Transport-Abriss selbst
                    self.teardown("transport lost").await;
                }
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

    pub fn status(&self) -> CallStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.status == CallStatus::Active
    }

    /// Die klingelnde Gegenstelle, solange der Anruf unbeantwortet ist
    pub fn incoming_call(&self) -> Option<&CallPeer> {
        if self.status == CallStatus::Incoming {
            self.remote.as_ref()
        } else {
            None
        }
    }

    pub fn remote_peer(&self) -> Option<&CallPeer> {
        self.remote.as_ref()
    }

    pub fn local_stream(&self) -> Option<&LocalMedia> {
        self.local_media.as_ref()
    }

    pub fn remote_stream(&self) -> Option<&RemoteStream> {
        self.remote_stream.as_ref()
    }

    /// Gibt einen Receiver für Anruf-Ereignisse zurück
    pub fn subscribe(&self) -> broadcast::Receiver<CallEvent> {
        self.call_events.subscribe()
    }

    // ========================================================================
    // SIGNAL HANDLERS
    // ========================================================================

    /// `call_offer`: Es klingelt - ein laufender Anruf verliert
    async fn on_offer(&mut self, msg: SignalMessage) -> Result<(), CallError> {
        if msg.is_addressed_elsewhere(&self.identity) {
            return Ok(());
        }
        let Some(description) = msg.description() else {
            tracing::warn!(peer_id = %msg.sender_id, "call_offer without usable SDP dropped");
            return Ok(());
        };

        if self.status != CallStatus::Idle {
            tracing::warn!(
                status = ?self.status,
                peer_id = %msg.sender_id,
                "call collision: incoming offer replaces current call"
            );
            self.teardown("offer collision").await;
        }

        let session = self.open_session(&msg.sender_id).await?;
        if let Err(e) = session.set_remote_description(description).await {
            session.close().await;
            return Err(e.into());
        }

        tracing::info!(
            peer_id = %msg.sender_id,
            name = %msg.sender_username,
            "incoming call"
        );
        self.session = Some(session);
        self.remote = Some(CallPeer {
            user_id: msg.sender_id.clone(),
            username: msg.sender_username.clone(),
        });
        self.flush_queue().await;
        self.set_status(CallStatus::Incoming);
        let _ = self.call_events.send(CallEvent::IncomingCall {
            user_id: msg.sender_id,
            username: msg.sender_username,
        });
        Ok(())
    }

    /// `call_answer`: Der Angerufene hat abgenommen
    async fn on_answer(&mut self, msg: SignalMessage) -> Result<(), CallError> {
        if msg.is_addressed_elsewhere(&self.identity) {
            return Ok(());
        }
        if self.status != CallStatus::Outgoing {
            tracing::warn!(
                status = ?self.status,
                peer_id = %msg.sender_id,
                "unexpected call_answer dropped"
            );
            return Ok(());
        }
        let Some(description) = msg.description() else {
            tracing::warn!(peer_id = %msg.sender_id, "call_answer without usable SDP dropped");
            return Ok(());
        };
        let Some(session) = self.session.clone() else {
            return Ok(());
        };

        session.set_remote_description(description).await?;

        tracing::info!(
            peer_id = %msg.sender_id,
            name = %msg.sender_username,
            "call answered"
        );
        self.remote = Some(CallPeer {
            user_id: msg.sender_id,
            username: msg.sender_username,
        });
        self.flush_queue().await;
        self.set_status(CallStatus::Active);
        Ok(())
    }

    /// `ice_candidate`: anwenden oder puffern, je nach Remote Description
    async fn on_candidate(&mut self, msg: SignalMessage) -> Result<(), CallError> {
        if msg.is_addressed_elsewhere(&self.identity) {
            return Ok(());
        }
        // Läuft ein Anruf mit bekannter Gegenstelle, zählen nur deren
        // Kandidaten; davor puffern wir für das erwartete Offer
        if let Some(remote) = &self.remote {
            if remote.user_id != msg.sender_id {
                tracing::trace!(peer_id = %msg.sender_id, "candidate from third party ignored");
                return Ok(());
            }
        }
        let Some(candidate) = msg.candidate() else {
            tracing::warn!(peer_id = %msg.sender_id, "ice_candidate without payload dropped");
            return Ok(());
        };

        let ready = self.remote_ready && self.session.is_some();
        match self.queue.admit(candidate.clone(), ready) {
            Admission::Apply => {
                let session = self.session.clone();
                if let Some(session) = session {
                    if let Err(e) = session.add_remote_candidate(candidate).await {
                        tracing::warn!("failed to apply candidate: {}", e);
                    }
                }
                Ok(())
            }
            Admission::Queued => {
                tracing::trace!(queued = self.queue.len(), "candidate queued");
                Ok(())
            }
            Admission::Duplicate => {
                tracing::trace!("duplicate candidate ignored");
                Ok(())
            }
            Admission::Overflow => {
                tracing::warn!("candidate queue overflow, candidate dropped");
                Ok(())
            }
        }
    }

    /// `call_end`: Die Gegenstelle hat aufgelegt
    async fn on_call_end(&mut self, msg: SignalMessage) -> Result<(), CallError> {
        if self.status == CallStatus::Idle {
            return Ok(());
        }
        // Nur die Gegenstelle darf unseren Anruf beenden
        if let Some(remote) = &self.remote {
            if remote.user_id != msg.sender_id {
                tracing::trace!(peer_id = %msg.sender_id, "call_end from third party ignored");
                return Ok(());
            }
        }

        tracing::info!(peer_id = %msg.sender_id, "remote ended the call");
        self.teardown("remote hangup").await;
        Ok(())
    }

    // ========================================================================
    // INTERNALS
    // ========================================================================

    /// Öffnet eine frische Transport-Session und macht sie zur aktuellen
    async fn open_session(&mut self, peer_label: &str) -> Result<Arc<dyn MediaSession>, CallError> {
        let session_id = self.next_session;
        self.next_session += 1;
        self.session_id = session_id;

        let session = self
            .sessions
            .open_session(peer_label, session_id, self.event_tx.clone())
            .await?;
        Ok(session)
    }

    /// Markiert die Remote Description als gesetzt und wendet die
    /// gepufferten Kandidaten in Ankunftsreihenfolge an
    async fn flush_queue(&mut self) {
        self.remote_ready = true;
        let Some(session) = self.session.clone() else {
            return;
        };

        let drained = self.queue.drain();
        if drained.is_empty() {
            return;
        }

        tracing::debug!(count = drained.len(), "flushing queued candidates");
        for candidate in drained {
            if let Err(e) = session.add_remote_candidate(candidate).await {
                tracing::warn!("failed to apply queued candidate: {}", e);
            }
        }
    }

    /// Räumt den Anruf vollständig ab und setzt die Maschine auf `Idle`
    async fn teardown(&mut self, reason: &str) {
        tracing::info!(reason, "tearing down call");

        if let Some(media) = self.local_media.take() {
            media.stop();
        }
        if let Some(session) = self.session.take() {
            session.close().await;
        }
        self.queue.clear();
        self.remote_ready = false;
        self.remote = None;
        self.remote_stream = None;
        self.set_status(CallStatus::Idle);
    }

    fn session_is_current(&self, session: SessionId) -> bool {
        self.session.is_some() && self.session_id == session
    }

    fn set_status(&mut self, status: CallStatus) {
        if self.status != status {
            self.status = status;
            let _ = self.call_events.send(CallEvent::StatusChanged(status));
        }
    }

    /// Stempelt die Channel-Id und schickt die Nachricht raus
    async fn send(&self, mut msg: SignalMessage) -> Result<(), CallError> {
        msg.channel_id = Some(self.channel_id.clone());
        self.outbox.send(msg).await?;
        Ok(())
    }
}

impl std::fmt::Debug for CallSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallSession")
            .field("channel_id", &self.channel_id)
            .field("status", &self.status)
            .field("remote", &self.remote)
            .finish()
    }
}
