//! 1:1-Anrufe: Offer/Ring/Answer/Hangup zwischen genau zwei Identitäten

pub mod session;

pub use session::{CallError, CallEvent, CallPeer, CallSession, CallStatus};
