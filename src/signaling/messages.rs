//! Message Types für das Broadcast-Signaling-Protokoll
//!
//! Alle Signaling-Nachrichten teilen sich einen gemeinsamen JSON-Envelope:
//! `{type, sender_id, sender_username, payload?, target_user_id?, channel_id?}`.
//! Das Relay stempelt sender_id/sender_username und broadcastet an alle
//! Mitglieder des Channels - auch an den Absender selbst (Echo).

use serde::{Deserialize, Serialize};

// ============================================================================
// LOCAL IDENTITY
// ============================================================================

/// Identität des lokalen Teilnehmers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalIdentity {
    pub user_id: String,
    pub username: String,
}

impl LocalIdentity {
    pub fn new(user_id: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            username: username.into(),
        }
    }
}

// ============================================================================
// WIRE ENVELOPE
// ============================================================================

/// Erkannte Nachrichten-Typen auf dem Signaling-Kanal
///
/// Der Channel-Socket transportiert auch Chat-Traffic; unbekannte
/// `type`-Werte schlagen beim Deserialisieren fehl und werden verworfen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    VoiceJoin,
    VoicePresence,
    VoiceLeave,
    CallOffer,
    CallAnswer,
    IceCandidate,
    CallEnd,
}

/// Signaling-Envelope wie er über das Relay läuft
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalMessage {
    #[serde(rename = "type")]
    pub kind: SignalKind,
    #[serde(default)]
    pub sender_id: String,
    #[serde(default)]
    pub sender_username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
    /// Adressat - rein advisorisch, das Relay broadcastet trotzdem.
    /// Empfänger filtern selbst.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
}

impl SignalMessage {
    fn base(kind: SignalKind, from: &LocalIdentity) -> Self {
        Self {
            kind,
            sender_id: from.user_id.clone(),
            sender_username: from.username.clone(),
            payload: None,
            target_user_id: None,
            channel_id: None,
        }
    }

    /// `voice_join` - Beitritt zum Voice-Channel ankündigen
    pub fn voice_join(from: &LocalIdentity) -> Self {
        Self::base(SignalKind::VoiceJoin, from)
    }

    /// `voice_presence` - "ich bin schon hier" als Antwort auf einen Join
    pub fn voice_presence(from: &LocalIdentity) -> Self {
        Self::base(SignalKind::VoicePresence, from)
    }

    /// `voice_leave` - Austritt aus dem Voice-Channel
    pub fn voice_leave(from: &LocalIdentity) -> Self {
        Self::base(SignalKind::VoiceLeave, from)
    }

    /// `call_offer` mit SDP-Payload, optional adressiert
    pub fn call_offer(
        from: &LocalIdentity,
        description: &SessionDescription,
        target: Option<&str>,
    ) -> Self {
        let mut msg = Self::base(SignalKind::CallOffer, from);
        msg.payload = serde_json::to_value(description).ok();
        msg.target_user_id = target.map(str::to_owned);
        msg
    }

    /// `call_answer` mit SDP-Payload, optional adressiert
    pub fn call_answer(
        from: &LocalIdentity,
        description: &SessionDescription,
        target: Option<&str>,
    ) -> Self {
        let mut msg = Self::base(SignalKind::CallAnswer, from);
        msg.payload = serde_json::to_value(description).ok();
        msg.target_user_id = target.map(str::to_owned);
        msg
    }

    /// `ice_candidate` mit Candidate-Payload, optional adressiert
    pub fn ice_candidate(
        from: &LocalIdentity,
        candidate: &IceCandidate,
        target: Option<&str>,
    ) -> Self {
        let mut msg = Self::base(SignalKind::IceCandidate, from);
        msg.payload = serde_json::to_value(candidate).ok();
        msg.target_user_id = target.map(str::to_owned);
        msg
    }

    /// `call_end` - Anruf beenden
    pub fn call_end(from: &LocalIdentity) -> Self {
        Self::base(SignalKind::CallEnd, from)
    }

    /// Prüft ob die Nachricht ein Echo des eigenen Broadcasts ist
    pub fn is_echo_of(&self, identity: &LocalIdentity) -> bool {
        self.sender_id == identity.user_id
    }

    /// Prüft ob eine adressierte Nachricht für einen anderen Teilnehmer
    /// bestimmt ist (Transport ist Broadcast, wir filtern selbst)
    pub fn is_addressed_elsewhere(&self, identity: &LocalIdentity) -> bool {
        matches!(&self.target_user_id, Some(target) if target != &identity.user_id)
    }

    /// Dekodiert den Payload als Session Description
    ///
    /// Fehlende oder kaputte Payloads ergeben `None` - die Nachricht wird
    /// dann vom Aufrufer kommentarlos verworfen.
    pub fn description(&self) -> Option<SessionDescription> {
        self.payload
            .as_ref()
            .and_then(|p| serde_json::from_value(p.clone()).ok())
    }

    /// Dekodiert den Payload als ICE Candidate
    pub fn candidate(&self) -> Option<IceCandidate> {
        self.payload
            .as_ref()
            .and_then(|p| serde_json::from_value(p.clone()).ok())
    }
}

// ============================================================================
// NEGOTIATION PAYLOADS
// ============================================================================

/// Offer oder Answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Session Description wie sie im Payload eines `call_offer`/`call_answer`
/// steckt - JSON-kompatibel zu RTCSessionDescription
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Ein Netzwerk-Kandidat, JSON-kompatibel zu RTCIceCandidateInit
///
/// `Eq + Hash` damit doppelt zugestellte Kandidaten erkannt werden können.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn alice() -> LocalIdentity {
        LocalIdentity::new("user-a", "alice")
    }

    #[test]
    fn test_offer_wire_format() {
        let desc = SessionDescription::offer("v=0...");
        let msg = SignalMessage::call_offer(&alice(), &desc, Some("user-b"));
        let json = serde_json::to_value(&msg).unwrap();

        assert_eq!(json["type"], "call_offer");
        assert_eq!(json["sender_id"], "user-a");
        assert_eq!(json["sender_username"], "alice");
        assert_eq!(json["target_user_id"], "user-b");
        assert_eq!(json["payload"]["type"], "offer");
        assert_eq!(json["payload"]["sdp"], "v=0...");
        // Nicht gesetzte Optionals dürfen gar nicht serialisiert werden
        assert!(json.get("channel_id").is_none());
    }

    #[test]
    fn test_join_has_no_payload() {
        let json = serde_json::to_value(SignalMessage::voice_join(&alice())).unwrap();
        assert_eq!(json["type"], "voice_join");
        assert!(json.get("payload").is_none());
        assert!(json.get("target_user_id").is_none());
    }

    #[test]
    fn test_candidate_payload_roundtrip() {
        let cand = IceCandidate {
            candidate: "candidate:1 1 udp 2130706431 10.0.0.1 54321 typ host".into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        };
        let msg = SignalMessage::ice_candidate(&alice(), &cand, Some("user-b"));
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: SignalMessage = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.kind, SignalKind::IceCandidate);
        assert_eq!(parsed.candidate().unwrap(), cand);
        // Browser-kompatible Feldnamen auf dem Draht
        assert!(json.contains("\"sdpMid\""));
        assert!(json.contains("\"sdpMLineIndex\""));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        // Chat-Traffic auf demselben Socket darf nicht als Signal parsen
        let raw = r#"{"type":"typing","user_id":"x","username":"bob"}"#;
        assert!(serde_json::from_str::<SignalMessage>(raw).is_err());
    }

    #[test]
    fn test_malformed_payload_decodes_to_none() {
        let raw = r#"{"type":"call_offer","sender_id":"u","sender_username":"bob","payload":{"garbage":true}}"#;
        let msg: SignalMessage = serde_json::from_str(raw).unwrap();
        assert!(msg.description().is_none());
        assert!(msg.candidate().is_none());
    }

    #[test]
    fn test_echo_and_target_filter() {
        let me = alice();
        let mut msg = SignalMessage::voice_join(&me);
        assert!(msg.is_echo_of(&me));

        msg.sender_id = "user-b".into();
        assert!(!msg.is_echo_of(&me));
        assert!(!msg.is_addressed_elsewhere(&me));

        msg.target_user_id = Some("user-c".into());
        assert!(msg.is_addressed_elsewhere(&me));

        msg.target_user_id = Some("user-a".into());
        assert!(!msg.is_addressed_elsewhere(&me));
    }
}
