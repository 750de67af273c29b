//! Szenario-Tests für die 1:1-Anruf-Zustandsmaschine

mod common;

use common::{candidate, identity, FakeMediaSource, FakeSessionFactory, MemoryOutbox};
use meshcall::call::{CallSession, CallStatus};
use meshcall::rtc::{SessionEvent, TransportState};
use meshcall::signaling::{SessionDescription, SignalKind, SignalMessage};
use std::sync::atomic::Ordering;
use std::sync::Arc;

struct Party {
    call: CallSession,
    factory: Arc<FakeSessionFactory>,
    media: Arc<FakeMediaSource>,
    outbox: Arc<MemoryOutbox>,
}

fn party(user_id: &str) -> Party {
    let factory = Arc::new(FakeSessionFactory::default());
    let media = Arc::new(FakeMediaSource::default());
    let outbox = Arc::new(MemoryOutbox::default());
    let call = CallSession::new(
        identity(user_id),
        "channel-1",
        Arc::clone(&media) as _,
        Arc::clone(&factory) as _,
        Arc::clone(&outbox) as _,
    );
    Party {
        call,
        factory,
        media,
        outbox,
    }
}

/// Baut einen aktiven Anruf zwischen beiden Parteien auf
async fn establish(a: &mut Party, b: &mut Party) {
    a.call.start_call().await.unwrap();
    let offer = a.outbox.last_of(SignalKind::CallOffer).unwrap();
    b.call.handle_signal(offer).await.unwrap();
    b.call.answer_call().await.unwrap();
    let answer = b.outbox.last_of(SignalKind::CallAnswer).unwrap();
    a.call.handle_signal(answer).await.unwrap();
}

#[tokio::test]
async fn test_two_party_call_flow() {
    let mut a = party("alice");
    let mut b = party("bob");

    a.call.start_call().await.unwrap();
    assert_eq!(a.call.status(), CallStatus::Outgoing);
    let offer = a.outbox.last_of(SignalKind::CallOffer).unwrap();
    assert!(offer.target_user_id.is_none(), "callee is not known yet");
    assert_eq!(offer.channel_id.as_deref(), Some("channel-1"));

    // Der Relay stellt das Offer auch an den Absender zu
    a.call.handle_signal(offer.clone()).await.unwrap();
    assert_eq!(a.call.status(), CallStatus::Outgoing, "echo must be ignored");
    assert_eq!(a.factory.opened_count(), 1);

    b.call.handle_signal(offer).await.unwrap();
    assert_eq!(b.call.status(), CallStatus::Incoming);
    assert_eq!(b.call.remote_peer().unwrap().user_id, "alice");
    assert!(b.call.local_stream().is_none(), "no media until answered");

    b.call.answer_call().await.unwrap();
    assert_eq!(b.call.status(), CallStatus::Active);
    let answer = b.outbox.last_of(SignalKind::CallAnswer).unwrap();
    assert_eq!(answer.target_user_id.as_deref(), Some("alice"));

    a.call.handle_signal(answer).await.unwrap();
    assert_eq!(a.call.status(), CallStatus::Active);
    assert_eq!(a.call.remote_peer().unwrap().user_id, "bob");
}

#[tokio::test]
async fn test_incoming_offer_wins_collision() {
    let mut a = party("alice");
    a.call.start_call().await.unwrap();
    let first = a.factory.last_session().unwrap();
    let outgoing_media = a.call.local_stream().unwrap().clone();

    let offer = SessionDescription::offer("v=0\r\ncarol-offer");
    a.call
        .handle_signal(SignalMessage::call_offer(&identity("carol"), &offer, None))
        .await
        .unwrap();

    assert_eq!(a.call.status(), CallStatus::Incoming);
    assert_eq!(a.call.remote_peer().unwrap().user_id, "carol");
    assert!(first.is_closed(), "outgoing session must be torn down");
    assert!(outgoing_media.is_stopped(), "outgoing media must be released");
    assert!(a.call.local_stream().is_none());
}

#[tokio::test]
async fn test_answer_in_wrong_state_dropped() {
    let mut b = party("bob");

    let answer = SessionDescription::answer("v=0\r\nstray-answer");
    b.call
        .handle_signal(SignalMessage::call_answer(
            &identity("alice"),
            &answer,
            Some("bob"),
        ))
        .await
        .unwrap();

    assert_eq!(b.call.status(), CallStatus::Idle);
    assert_eq!(b.factory.opened_count(), 0);
}

#[tokio::test]
async fn test_targeted_signal_for_other_user_ignored() {
    let mut b = party("bob");

    let offer = SessionDescription::offer("v=0\r\nalice-offer");
    b.call
        .handle_signal(SignalMessage::call_offer(
            &identity("alice"),
            &offer,
            Some("carol"),
        ))
        .await
        .unwrap();

    assert_eq!(b.call.status(), CallStatus::Idle);
    assert_eq!(b.factory.opened_count(), 0);
}

#[tokio::test]
async fn test_media_failure_leaves_machine_idle() {
    let mut a = party("alice");
    a.media.fail.store(true, Ordering::SeqCst);

    assert!(a.call.start_call().await.is_err());
    assert_eq!(a.call.status(), CallStatus::Idle);
    assert_eq!(a.factory.opened_count(), 0, "no partial session");
    assert!(a.outbox.take().is_empty(), "nothing signaled on failure");
}

#[tokio::test]
async fn test_answer_media_failure_keeps_ringing() {
    let mut a = party("alice");
    let mut b = party("bob");

    a.call.start_call().await.unwrap();
    let offer = a.outbox.last_of(SignalKind::CallOffer).unwrap();
    b.call.handle_signal(offer).await.unwrap();

    b.media.fail.store(true, Ordering::SeqCst);
    assert!(b.call.answer_call().await.is_err());
    assert_eq!(b.call.status(), CallStatus::Incoming, "still ringing");

    // Zweiter Versuch nach behobenem Geräte-Problem
    b.media.fail.store(false, Ordering::SeqCst);
    b.call.answer_call().await.unwrap();
    assert_eq!(b.call.status(), CallStatus::Active);
}

#[tokio::test]
async fn test_offer_send_failure_rolls_back_to_idle() {
    let mut a = party("alice");
    a.outbox.fail.store(true, Ordering::SeqCst);

    assert!(a.call.start_call().await.is_err());
    assert_eq!(a.call.status(), CallStatus::Idle);
    assert!(a.call.local_stream().is_none(), "media must be released");
    let session = a.factory.last_session().unwrap();
    assert!(session.is_closed(), "half-open session must be closed");

    // Relay wieder da - frischer Versuch startet sauber
    a.outbox.fail.store(false, Ordering::SeqCst);
    a.call.start_call().await.unwrap();
    assert_eq!(a.call.status(), CallStatus::Outgoing);
}

#[tokio::test]
async fn test_answer_send_failure_keeps_ringing() {
    let mut a = party("alice");
    let mut b = party("bob");

    a.call.start_call().await.unwrap();
    let offer = a.outbox.last_of(SignalKind::CallOffer).unwrap();
    b.call.handle_signal(offer).await.unwrap();

    b.outbox.fail.store(true, Ordering::SeqCst);
    assert!(b.call.answer_call().await.is_err());
    assert_eq!(b.call.status(), CallStatus::Incoming, "still ringing");
    assert!(b.call.local_stream().is_none(), "media must be released");

    b.outbox.fail.store(false, Ordering::SeqCst);
    b.call.answer_call().await.unwrap();
    assert_eq!(b.call.status(), CallStatus::Active);
}

#[tokio::test]
async fn test_answer_without_ringing_rejected() {
    let mut b = party("bob");
    assert!(b.call.answer_call().await.is_err());
    assert_eq!(b.call.status(), CallStatus::Idle);
}

#[tokio::test]
async fn test_candidates_buffered_until_remote_description() {
    let mut b = party("bob");
    let alice = identity("alice");

    // Kandidaten können das Offer überholen
    for n in 1..=2 {
        b.call
            .handle_signal(SignalMessage::ice_candidate(&alice, &candidate(n), None))
            .await
            .unwrap();
    }
    assert_eq!(b.factory.opened_count(), 0);

    let offer = SessionDescription::offer("v=0\r\nalice-offer");
    b.call
        .handle_signal(SignalMessage::call_offer(&alice, &offer, Some("bob")))
        .await
        .unwrap();

    let session = b.factory.last_session().unwrap();
    assert_eq!(session.applied(), vec![candidate(1), candidate(2)]);

    // Duplikat nach dem Flush bleibt Duplikat
    b.call
        .handle_signal(SignalMessage::ice_candidate(&alice, &candidate(1), None))
        .await
        .unwrap();
    assert_eq!(session.applied().len(), 2);
}

#[tokio::test]
async fn test_candidate_from_third_party_ignored() {
    let mut a = party("alice");
    let mut b = party("bob");
    establish(&mut a, &mut b).await;

    b.call
        .handle_signal(SignalMessage::ice_candidate(
            &identity("carol"),
            &candidate(5),
            None,
        ))
        .await
        .unwrap();

    let session = b.factory.last_session().unwrap();
    assert!(session.applied().is_empty());
}

#[tokio::test]
async fn test_end_call_cleans_up_completely() {
    let mut a = party("alice");
    let mut b = party("bob");
    establish(&mut a, &mut b).await;
    let session = a.factory.last_session().unwrap();
    let media = a.call.local_stream().unwrap().clone();
    a.outbox.take();

    a.call.end_call().await.unwrap();

    assert_eq!(a.call.status(), CallStatus::Idle);
    assert_eq!(a.outbox.kinds(), vec![SignalKind::CallEnd]);
    assert!(session.is_closed());
    assert!(media.is_stopped());
    assert!(a.call.remote_peer().is_none());
    assert!(a.call.local_stream().is_none());
    assert!(a.call.remote_stream().is_none());
}

#[tokio::test]
async fn test_end_call_while_idle_is_noop() {
    let mut a = party("alice");
    a.call.end_call().await.unwrap();
    assert!(a.outbox.take().is_empty());
}

#[tokio::test]
async fn test_remote_hangup_tears_down_without_reply() {
    let mut a = party("alice");
    let mut b = party("bob");
    establish(&mut a, &mut b).await;
    let session = b.factory.last_session().unwrap();
    b.outbox.take();

    b.call
        .handle_signal(SignalMessage::call_end(&identity("alice")))
        .await
        .unwrap();

    assert_eq!(b.call.status(), CallStatus::Idle);
    assert!(session.is_closed());
    assert!(b.outbox.take().is_empty(), "hangup is not echoed back");
}

#[tokio::test]
async fn test_call_end_from_stranger_ignored() {
    let mut a = party("alice");
    let mut b = party("bob");
    establish(&mut a, &mut b).await;

    b.call
        .handle_signal(SignalMessage::call_end(&identity("carol")))
        .await
        .unwrap();

    assert_eq!(b.call.status(), CallStatus::Active);
}

#[tokio::test]
async fn test_transport_loss_ends_call_silently() {
    let mut a = party("alice");
    let mut b = party("bob");
    establish(&mut a, &mut b).await;
    a.outbox.take();

    a.factory.emit_for_last(|session| SessionEvent::StateChanged {
        peer_id: "bob".into(),
        session,
        state: TransportState::Failed,
    });
    a.call.process_events().await.unwrap();

    assert_eq!(a.call.status(), CallStatus::Idle);
    assert!(
        a.outbox.last_of(SignalKind::CallEnd).is_none(),
        "transport loss must not broadcast call_end"
    );
}

#[tokio::test]
async fn test_stale_session_events_discarded() {
    let mut a = party("alice");
    let mut b = party("bob");
    establish(&mut a, &mut b).await;

    a.factory.emit_for_last(|session| SessionEvent::CandidateGathered {
        peer_id: "bob".into(),
        session,
        candidate: candidate(9),
    });
    a.call.end_call().await.unwrap();
    a.outbox.take();

    a.call.process_events().await.unwrap();

    assert_eq!(a.call.status(), CallStatus::Idle);
    assert!(
        a.outbox.last_of(SignalKind::IceCandidate).is_none(),
        "events of the ended call must be dropped"
    );
}

#[tokio::test]
async fn test_gathered_candidate_signaled() {
    let mut a = party("alice");
    let mut b = party("bob");
    establish(&mut a, &mut b).await;
    a.outbox.take();

    a.factory.emit_for_last(|session| SessionEvent::CandidateGathered {
        peer_id: "bob".into(),
        session,
        candidate: candidate(4),
    });
    a.call.process_events().await.unwrap();

    let sent = a.outbox.last_of(SignalKind::IceCandidate).unwrap();
    assert_eq!(sent.target_user_id.as_deref(), Some("bob"));
    assert_eq!(sent.candidate().unwrap(), candidate(4));
}

#[tokio::test]
async fn test_second_outgoing_call_rejected() {
    let mut a = party("alice");
    a.call.start_call().await.unwrap();
    assert!(a.call.start_call().await.is_err());
    assert_eq!(a.factory.opened_count(), 1);
}
