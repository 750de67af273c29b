//! Candidate Queue - Puffer für zu früh eingetroffene ICE Candidates
//!
//! Der Transport garantiert keine Reihenfolge: Kandidaten können vor dem
//! Offer/Answer des Peers ankommen. Bis die Remote Description gesetzt ist
//! werden sie hier in Ankunftsreihenfolge gepuffert und danach genau einmal
//! geflusht. Doppelt zugestellte Kandidaten werden über beide Pfade hinweg
//! (gepuffert wie sofort angewendet) erkannt.

use crate::signaling::messages::IceCandidate;
use std::collections::HashSet;

/// Obergrenze pro Queue, damit Geister-Peers den Speicher nicht
/// unbegrenzt wachsen lassen
pub const MAX_QUEUED_CANDIDATES: usize = 64;

/// Ergebnis der Zulassungsprüfung eines eingehenden Kandidaten
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Remote Description vorhanden - sofort anwenden
    Apply,
    /// Gepuffert bis die Remote Description gesetzt ist
    Queued,
    /// Bereits gesehen - keine Wirkung über die erste Anwendung hinaus
    Duplicate,
    /// Queue voll - verworfen
    Overflow,
}

/// Geordneter Puffer noch nicht anwendbarer Netzwerk-Kandidaten
#[derive(Debug, Default)]
pub struct CandidateQueue {
    pending: Vec<IceCandidate>,
    seen: HashSet<IceCandidate>,
}

impl CandidateQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Lässt einen Kandidaten zu
    ///
    /// `remote_ready` gibt an ob die Remote Description der zugehörigen
    /// Transport-Session bereits gesetzt ist. Der Kandidat wird bei
    /// `Admission::Apply` NICHT gespeichert - anwenden muss der Aufrufer.
    pub fn admit(&mut self, candidate: IceCandidate, remote_ready: bool) -> Admission {
        if self.seen.contains(&candidate) {
            return Admission::Duplicate;
        }

        if remote_ready {
            self.seen.insert(candidate);
            Admission::Apply
        } else if self.pending.len() >= MAX_QUEUED_CANDIDATES {
            // Verworfen zählt nicht als gesehen - eine erneute Zustellung
            // nach gesetzter Remote Description darf noch wirken
            Admission::Overflow
        } else {
            self.seen.insert(candidate.clone());
            self.pending.push(candidate);
            Admission::Queued
        }
    }

    /// Entnimmt alle gepufferten Kandidaten in Ankunftsreihenfolge
    ///
    /// Nach dem Drain ist die Queue leer; ein zweiter Drain liefert nichts.
    pub fn drain(&mut self) -> Vec<IceCandidate> {
        std::mem::take(&mut self.pending)
    }

    /// Verwirft Puffer und Duplikat-Historie (Session-Teardown)
    pub fn clear(&mut self) {
        self.pending.clear();
        self.seen.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }
}

// ============================================================================
// TESTS
// ============================================================================
