use arcall_lib::config::{LocalIdentity, SignalingSettings};
use arcall_lib::peer::{
    DataMessage, PeerConnectionCoordinator, PeerEvent, SdpKind, SessionDescription, DATA_CHANNEL_LABEL,
};
use arcall_lib::session::{
    Annotation, AnnotationType, CallSessionManager, CallState, ConnectTarget, ConnectionHealth,
    DavFileLocator, Point,
};
use arcall_lib::signaling::{SignalPayload, SignalingChannel};
use arcall_lib::testing::{participant, FakeCallRoomApi, FakeMedia, MemoryLogSink, TransportCall};
use arcall_lib::{CallCommand, CallError};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    manager: CallSessionManager,
    media: FakeMedia,
    api: FakeCallRoomApi,
    sink: MemoryLogSink,
}

fn harness() -> Harness {
    let media = FakeMedia::new();
    let api = FakeCallRoomApi::new("room42");
    api.set_participants(vec![participant("expert", "Expert")]);
    let sink = MemoryLogSink::new();

    let signaling = SignalingChannel::new(Arc::new(api.clone()), &SignalingSettings::default());
    let peer = PeerConnectionCoordinator::new(Arc::new(media.clone()), DATA_CHANNEL_LABEL);
    let files = DavFileLocator::new("https://cloud.example.org/", "glasses").unwrap();
    let identity = LocalIdentity {
        user_id: "glasses".into(),
        display_name: "Field engineer".into(),
    };
    let manager = CallSessionManager::new(
        signaling,
        peer,
        Arc::new(sink.clone()),
        Arc::new(files),
        identity,
    );

    Harness {
        manager,
        media,
        api,
        sink,
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("condition was not reached");
}

fn annotation(id: &str) -> Annotation {
    Annotation {
        id: id.into(),
        kind: AnnotationType::Arrow,
        points: vec![Point::new(0.1, 0.1), Point::new(0.9, 0.9)],
        color: -16776961,
        timestamp: 1,
    }
}

fn active(h: &Harness) -> arcall_lib::session::ActiveCall {
    match h.manager.current_state() {
        CallState::Active(call) => call,
        other => panic!("expected active call, got {other:?}"),
    }
}

#[tokio::test(start_paused = true)]
async fn outgoing_call_pushes_offer_once_and_applies_answer() {
    let h = harness();
    h.manager.initiate_call("userB").await;

    let call = active(&h);
    assert_eq!(call.call_id, "room42");
    assert_eq!(call.participants, vec![participant("expert", "Expert")]);
    assert!(call.local_video.is_some());
    assert_eq!(h.api.initiated(), vec!["userB".to_string()]);

    let offers: Vec<_> = h
        .api
        .sent_signals()
        .into_iter()
        .filter(|s| matches!(s.payload, SignalPayload::Offer { .. }))
        .collect();
    assert_eq!(offers.len(), 1);

    h.api.push_remote_signal(SignalPayload::Answer {
        sdp: "v=0 answer".into(),
    });
    eventually(|| !h.media.remote_descriptions().is_empty()).await;

    let remote = h.media.remote_descriptions();
    assert_eq!(remote[0].kind, SdpKind::Answer);
    assert_eq!(remote[0].sdp, "v=0 answer");
    assert!(!h.manager.peer().is_awaiting_answer());
    assert!(h.manager.current_state().is_active());
}

#[tokio::test(start_paused = true)]
async fn answering_waits_for_remote_offer() {
    let h = harness();
    h.api.push_remote_signal(SignalPayload::Offer {
        sdp: "v=0 offer".into(),
    });

    h.manager.answer_call("room42").await;
    assert_eq!(active(&h).call_id, "room42");
    assert!(h.api.initiated().is_empty());

    eventually(|| {
        h.api
            .sent_signals()
            .iter()
            .any(|s| matches!(s.payload, SignalPayload::Answer { .. }))
    })
    .await;
    assert!(!h
        .media
        .calls()
        .contains(&TransportCall::CreateOffer));
}

#[tokio::test(start_paused = true)]
async fn remote_candidates_before_answer_are_applied_in_order() {
    let h = harness();
    h.manager.initiate_call("userB").await;

    let cand = |n: u32| arcall_lib::peer::IceCandidate::new(format!("candidate:{n}"), Some("0".into()), Some(0));
    h.api.push_remote_signal(SignalPayload::Candidate(cand(1)));
    h.api.push_remote_signal(SignalPayload::Candidate(cand(2)));
    eventually(|| h.manager.peer().pending_candidates() == 2).await;
    assert!(h.media.applied_candidates().is_empty());

    h.api.push_remote_signal(SignalPayload::Answer { sdp: "v=0".into() });
    h.api.push_remote_signal(SignalPayload::Candidate(cand(3)));
    eventually(|| h.media.applied_candidates().len() == 3).await;
    assert_eq!(h.media.applied_candidates(), vec![cand(1), cand(2), cand(3)]);
}

#[tokio::test(start_paused = true)]
async fn initiate_failure_becomes_error_state() {
    let h = harness();
    h.api.fail_initiate(CallError::Server {
        status: 404,
        message: "user not found".into(),
    });

    h.manager.initiate_call("ghost").await;
    match h.manager.current_state() {
        CallState::Error { message } => assert!(message.contains("user not found")),
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(h.media.transports_created(), 0);

    // без reset новая попытка игнорируется
    h.manager.initiate_call("ghost").await;
    assert_eq!(h.api.initiated().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn media_failure_during_connect_is_reported() {
    let h = harness();
    h.media.fail_initialization(true);

    h.manager.answer_call("room42").await;
    assert!(matches!(h.manager.current_state(), CallState::Error { .. }));
    assert!(h.manager.peer().is_released());
}

#[tokio::test(start_paused = true)]
async fn negotiation_failure_ends_in_error() {
    let h = harness();
    h.manager.initiate_call("userB").await;
    h.media.fail_remote_descriptions(true);

    h.api.push_remote_signal(SignalPayload::Answer { sdp: "bogus".into() });
    eventually(|| matches!(h.manager.current_state(), CallState::Error { .. })).await;
    assert!(h.manager.peer().is_released());
}

#[tokio::test(start_paused = true)]
async fn send_message_in_initial_is_noop() {
    let h = harness();
    h.manager.send_message("hello").await;
    h.manager.toggle_microphone(false).await;
    h.manager.add_annotation(annotation("a1")).await;

    assert_eq!(h.manager.current_state(), CallState::Initial);
    assert!(h.media.sent_data().is_empty());
    assert!(h.media.calls().is_empty());
    tokio::task::yield_now().await;
    assert!(h.sink.messages().is_empty());
}

#[tokio::test(start_paused = true)]
async fn annotations_keep_order_and_publish_sequence() {
    let h = harness();
    h.manager.initiate_call("userB").await;

    for id in ["a1", "a2", "a3"] {
        h.manager.add_annotation(annotation(id)).await;
    }
    h.manager.remove_annotation("a2").await;

    let ids: Vec<_> = active(&h).annotations.into_iter().map(|a| a.id).collect();
    assert_eq!(ids, vec!["a1", "a3"]);

    let published: Vec<_> = h
        .media
        .sent_data()
        .iter()
        .map(|raw| DataMessage::decode(raw).unwrap())
        .collect();
    assert_eq!(
        published,
        vec![
            DataMessage::Annotation(annotation("a1")),
            DataMessage::Annotation(annotation("a2")),
            DataMessage::Annotation(annotation("a3")),
            DataMessage::RemoveAnnotation { id: "a2".into() },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn messages_and_files_are_published_and_persisted() {
    let h = harness();
    h.manager.initiate_call("userB").await;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("valve.pdf");
    std::fs::write(&path, vec![1u8; 512]).unwrap();

    h.manager
        .handle(CallCommand::SendMessage {
            text: "check valve 3".into(),
        })
        .await;
    h.manager
        .send_file(path.to_str().unwrap(), "valve.pdf", "application/pdf")
        .await;

    let call = active(&h);
    assert_eq!(call.messages[0].text, "check valve 3");
    assert_eq!(call.messages[0].sender_name, "Field engineer");
    assert_eq!(call.shared_files[0].size, 512);
    assert_eq!(
        call.shared_files[0].url,
        "https://cloud.example.org/remote.php/dav/files/glasses/valve.pdf"
    );

    let kinds: Vec<_> = h
        .media
        .sent_data()
        .iter()
        .map(|raw| serde_json::from_str::<serde_json::Value>(raw).unwrap()["type"].clone())
        .collect();
    assert_eq!(kinds, vec![json!("message"), json!("file")]);

    eventually(|| h.sink.messages().len() == 1 && h.sink.files().len() == 1).await;
    assert_eq!(h.sink.messages()[0].0, "room42");
}

#[tokio::test(start_paused = true)]
async fn persistence_failure_does_not_surface() {
    let h = harness();
    h.sink.set_failing(true);
    h.manager.initiate_call("userB").await;

    h.manager.send_message("hello").await;
    tokio::task::yield_now().await;
    assert_eq!(active(&h).messages.len(), 1);

    h.manager.end_call().await;
    assert!(matches!(h.manager.current_state(), CallState::Ended { .. }));
    assert!(h.sink.records().is_empty());
}

#[tokio::test(start_paused = true)]
async fn closed_data_channel_keeps_local_state() {
    let h = harness();
    h.manager.initiate_call("userB").await;
    h.media.set_channel_open(false);

    h.manager.add_annotation(annotation("a1")).await;
    assert_eq!(active(&h).annotations.len(), 1);
    assert!(h.media.sent_data().is_empty());
}

#[tokio::test(start_paused = true)]
async fn toggles_update_transport_and_state() {
    let h = harness();
    h.manager.initiate_call("userB").await;

    h.manager.toggle_microphone(false).await;
    h.manager.toggle_camera(false).await;

    let call = active(&h);
    assert!(!call.mic_enabled);
    assert!(!call.camera_enabled);
    let calls = h.media.calls();
    assert!(calls.contains(&TransportCall::TrackEnabled(arcall_lib::peer::TrackKind::Audio, false)));
    assert!(calls.contains(&TransportCall::TrackEnabled(arcall_lib::peer::TrackKind::Video, false)));
}

#[tokio::test(start_paused = true)]
async fn remote_data_messages_update_collections() {
    let h = harness();
    h.manager.initiate_call("userB").await;

    let remote = json!({
        "type": "annotation",
        "data": {"id": "r1", "type": "CIRCLE", "points": [{"x": 0.5, "y": 0.5}], "color": 255, "timestamp": 3}
    });
    let outside = json!({
        "type": "annotation",
        "data": {"id": "r2", "type": "ARROW", "points": [{"x": 1.5, "y": 0.5}], "color": 255, "timestamp": 4}
    });
    let chat = json!({
        "type": "message",
        "data": {"id": "m1", "senderId": "expert", "senderName": "Expert", "text": "turn it left", "timestamp": 5}
    });
    assert!(h.media.emit(PeerEvent::DataMessage(remote.to_string())));
    h.media.emit(PeerEvent::DataMessage(outside.to_string()));
    h.media.emit(PeerEvent::DataMessage("not json".into()));
    h.media.emit(PeerEvent::DataMessage(chat.to_string()));

    eventually(|| active(&h).messages.len() == 1).await;
    let call = active(&h);
    let ids: Vec<_> = call.annotations.iter().map(|a| a.id.as_str()).collect();
    assert_eq!(ids, vec!["r1"]);
    assert_eq!(call.messages[0].sender_name, "Expert");

    h.media.emit(PeerEvent::DataMessage(
        json!({"type": "remove_annotation", "data": {"id": "r1"}}).to_string(),
    ));
    eventually(|| active(&h).annotations.is_empty()).await;
}

#[tokio::test(start_paused = true)]
async fn connection_loss_is_not_fatal() {
    let h = harness();
    h.manager.initiate_call("userB").await;

    h.media.emit(PeerEvent::ConnectionLost);
    eventually(|| active(&h).connection == ConnectionHealth::Recovering).await;

    h.media.emit(PeerEvent::ConnectionRecovered);
    eventually(|| active(&h).connection == ConnectionHealth::Stable).await;
}

#[tokio::test(start_paused = true)]
async fn end_call_persists_log_and_notifies_once() {
    let h = harness();
    h.manager.initiate_call("userB").await;
    tokio::time::advance(Duration::from_secs(61)).await;

    h.manager.end_call().await;
    match h.manager.current_state() {
        CallState::Ended {
            call_id,
            duration_seconds,
        } => {
            assert_eq!(call_id, "room42");
            assert!((61..70).contains(&duration_seconds));
        }
        other => panic!("unexpected {other:?}"),
    }

    let records = h.sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].0, "room42");
    assert_eq!(records[0].1.peer, "userB");
    assert_eq!(records[0].1.user_id, "glasses");

    // повторные end_call и reset не шлют завершение ещё раз
    h.manager.end_call().await;
    h.manager.reset().await;
    h.manager.reset().await;
    assert_eq!(h.api.ended_calls(), vec!["room42".to_string()]);
    assert_eq!(h.media.close_count(), 1);
    assert_eq!(h.manager.current_state(), CallState::Initial);
}

#[tokio::test(start_paused = true)]
async fn remote_hangup_ends_without_server_call() {
    let h = harness();
    h.manager.initiate_call("userB").await;

    h.api.set_status("ended");
    eventually(|| matches!(h.manager.current_state(), CallState::Ended { .. })).await;

    assert!(h.api.ended_calls().is_empty());
    assert_eq!(h.sink.records().len(), 1);
    assert!(h.manager.peer().is_released());
}

#[tokio::test(start_paused = true)]
async fn reset_from_any_state_releases_everything() {
    // Active
    let h = harness();
    h.manager.initiate_call("userB").await;
    h.manager.reset().await;
    assert_eq!(h.manager.current_state(), CallState::Initial);
    assert!(h.manager.signaling().is_released());
    assert!(h.manager.peer().is_released());

    // Error
    let h = harness();
    h.api.fail_initiate(CallError::Network("timeout".into()));
    h.manager.initiate_call("userB").await;
    h.manager.reset().await;
    assert_eq!(h.manager.current_state(), CallState::Initial);
    assert!(h.manager.signaling().is_released());
    assert!(h.manager.peer().is_released());

    // Ended
    let h = harness();
    h.manager.initiate_call("userB").await;
    h.manager.end_call().await;
    h.manager.reset().await;
    assert_eq!(h.manager.current_state(), CallState::Initial);
    assert!(h.manager.peer().is_released());

    // Initial
    let h = harness();
    h.manager.reset().await;
    assert_eq!(h.manager.current_state(), CallState::Initial);
    assert!(h.manager.signaling().is_released());
    assert!(h.manager.peer().is_released());
}

#[tokio::test(start_paused = true)]
async fn reset_then_new_call_works() {
    let h = harness();
    h.manager.initiate_call("userB").await;
    h.manager.reset().await;

    h.manager.initiate_call("userC").await;
    assert!(h.manager.current_state().is_active());
    assert_eq!(h.media.transports_created(), 2);
}

#[tokio::test(start_paused = true)]
async fn observers_see_the_same_latest_state() {
    let h = harness();
    let first = h.manager.subscribe();
    let second = h.manager.subscribe();

    h.manager.answer_call("room42").await;

    assert!(first.borrow().is_active());
    assert_eq!(*first.borrow(), *second.borrow());

    let mut late = h.manager.subscribe();
    assert!(late.borrow_and_update().is_active());
}

#[tokio::test(start_paused = true)]
async fn connecting_state_names_the_target() {
    let h = harness();
    let mut states = h.manager.subscribe();
    let manager = h.manager.clone();
    let task = tokio::spawn(async move { manager.initiate_call("userB").await });

    let seen = states
        .wait_for(|s| matches!(s, CallState::Connecting { .. } | CallState::Active(_)))
        .await
        .unwrap()
        .clone();
    task.await.unwrap();

    if let CallState::Connecting { target } = seen {
        assert_eq!(target, ConnectTarget::User("userB".into()));
    }
    assert!(h.manager.current_state().is_active());
}

fn assert_fully_released(h: &Harness) {
    assert_eq!(h.manager.current_state(), CallState::Initial);
    assert!(h.manager.peer().is_released());
    assert!(h.manager.signaling().is_released());
    assert_eq!(h.media.close_count(), h.media.transports_created());
}

#[tokio::test(start_paused = true)]
async fn reset_while_room_is_created_cancels_attempt() {
    let h = harness();
    let gate = h.api.hold_initiate();

    let manager = h.manager.clone();
    let attempt = tokio::spawn(async move { manager.initiate_call("userB").await });
    eventually(|| matches!(h.manager.current_state(), CallState::Connecting { .. })).await;

    h.manager.reset().await;
    gate.notify_one();
    attempt.await.unwrap();

    assert_fully_released(&h);
    assert_eq!(h.api.initiated(), vec!["userB".to_string()]);
    assert_eq!(h.media.transports_created(), 0);
    assert!(h.api.sent_signals().is_empty());
}

#[tokio::test(start_paused = true)]
async fn reset_during_media_start_closes_new_transport() {
    let h = harness();
    let gate = h.media.hold_local_media();

    let manager = h.manager.clone();
    let attempt = tokio::spawn(async move { manager.answer_call("room42").await });
    eventually(|| h.media.transports_created() == 1).await;

    let manager = h.manager.clone();
    let reset = tokio::spawn(async move { manager.reset().await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    gate.notify_one();
    attempt.await.unwrap();
    reset.await.unwrap();

    assert_fully_released(&h);
    assert_eq!(h.media.close_count(), 1);
    assert_eq!(h.api.info_requests(), 0);
}

#[tokio::test(start_paused = true)]
async fn repeated_reset_while_negotiation_is_busy() {
    let h = harness();
    h.manager.initiate_call("userB").await;

    // запоздавший answer держит очередь согласования
    let gate = h.media.hold_remote_descriptions();
    let manager = h.manager.clone();
    let late_answer = tokio::spawn(async move {
        manager
            .peer()
            .set_remote_description(SessionDescription::answer("v=0 late"))
            .await
    });
    eventually(|| !h.media.remote_descriptions().is_empty()).await;
    h.manager.reset().await;

    let manager = h.manager.clone();
    let attempt = tokio::spawn(async move { manager.initiate_call("userC").await });
    eventually(|| matches!(h.manager.current_state(), CallState::Connecting { .. })).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let manager = h.manager.clone();
    let second_reset = tokio::spawn(async move { manager.reset().await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    gate.notify_one();

    assert!(!late_answer.await.unwrap().unwrap());
    attempt.await.unwrap();
    second_reset.await.unwrap();

    assert_fully_released(&h);
    assert_eq!(h.api.initiated(), vec!["userB".to_string(), "userC".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn rejoining_same_room_ends_it_on_server_again() {
    let h = harness();

    h.manager.answer_call("room42").await;
    h.manager.end_call().await;
    h.manager.reset().await;

    h.manager.answer_call("room42").await;
    assert!(h.manager.current_state().is_active());
    h.manager.end_call().await;

    assert_eq!(
        h.api.ended_calls(),
        vec!["room42".to_string(), "room42".to_string()]
    );
    assert_eq!(h.sink.records().len(), 2);
}
