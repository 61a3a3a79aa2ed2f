use std::time::Duration;

use super::*;
use crate::tests_support::{raw, FakeApi, RecordingTransport};
use shared::{
    domain::{DeliveryState, MessageId},
    protocol::{ClientRequest, ServerEvent},
};
use tokio::time::timeout;

fn me() -> UserId {
    UserId::from("me")
}

fn partner() -> UserId {
    UserId::from("partner")
}

fn direct() -> Conversation {
    Conversation::direct("c1", partner())
}

fn circle() -> Conversation {
    Conversation::circle("circle-1")
}

fn ids(messages: &[Message]) -> Vec<&str> {
    messages.iter().map(|m| m.id.as_str()).collect()
}

async fn connected_session(
    api: FakeApi,
) -> (Arc<ChatSession>, Arc<RecordingTransport>, Arc<FakeApi>) {
    let api = Arc::new(api);
    let transport = Arc::new(RecordingTransport::default());
    let session =
        ChatSession::new_with_dependencies(&SyncConfig::default(), api.clone(), transport.clone());
    session.sign_in(me()).await.expect("sign in");
    session
        .connection()
        .handle_signal(TransportSignal::Connected)
        .await;
    transport.clear_sent();
    (session, transport, api)
}

async fn next_matching<F>(events: &mut broadcast::Receiver<SyncEvent>, mut matches: F) -> SyncEvent
where
    F: FnMut(&SyncEvent) -> bool,
{
    timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) => continue,
                Err(err) => panic!("event stream ended: {err}"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

#[tokio::test]
async fn send_shows_pending_entry_then_confirms_with_server_id() {
    let (session, _, api) =
        connected_session(FakeApi::default().reply_with(raw("m-554", "c1", "me", "hello"))).await;
    let mut events = session.subscribe_events();
    session.open_conversation(direct()).await.expect("open");

    let confirmed = session
        .send_message(&direct(), "  hello  ")
        .await
        .expect("send");

    assert_eq!(confirmed.id.as_str(), "m-554");
    assert_eq!(confirmed.delivery_state, DeliveryState::Confirmed);
    assert_eq!(api.sent_texts.lock().expect("texts").clone(), vec!["hello"]);

    let appended = next_matching(&mut events, |e| matches!(e, SyncEvent::MessageAppended { .. })).await;
    let SyncEvent::MessageAppended { message: optimistic, .. } = appended else {
        unreachable!()
    };
    assert!(optimistic.is_pending());
    assert_eq!(optimistic.sender_id, me());
    assert_eq!(optimistic.text, "hello");

    let event = next_matching(&mut events, |e| matches!(e, SyncEvent::MessageConfirmed { .. })).await;
    let SyncEvent::MessageConfirmed { temp_id, message, .. } = event else {
        unreachable!()
    };
    assert_eq!(temp_id, optimistic.id);
    assert_eq!(message.id.as_str(), "m-554");

    let messages = session.messages(&direct().id).await;
    assert_eq!(ids(&messages), vec!["m-554"]);
}

fn confirmations(events: &mut broadcast::Receiver<SyncEvent>) -> usize {
    let mut count = 0;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SyncEvent::MessageConfirmed { .. }) {
            count += 1;
        }
    }
    count
}

#[tokio::test]
async fn echo_arriving_before_confirmation_takes_the_pending_slot() {
    let (session, _, api) = connected_session(
        FakeApi::with_history(vec![raw("m-1", "c1", "partner", "hi")])
            .reply_with(raw("m-554", "c1", "me", "hello")),
    )
    .await;
    session.open_conversation(direct()).await.expect("open");
    let mut events = session.subscribe_events();
    let release = api.gate_send().await;

    let sender = Arc::clone(&session);
    let send = tokio::spawn(async move { sender.send_message(&direct(), "hello").await });
    next_matching(&mut events, |e| matches!(e, SyncEvent::MessageAppended { .. })).await;

    session
        .apply_channel_event(ChannelEvent::MessageReceived {
            conversation_id: direct().id,
            message: raw("m-554", "c1", "me", "hello"),
        })
        .await;
    let messages = session.messages(&direct().id).await;
    assert_eq!(ids(&messages), vec!["m-1", "m-554"]);
    assert_eq!(messages[1].delivery_state, DeliveryState::Confirmed);

    release.send(()).expect("release send");
    let confirmed = send.await.expect("join").expect("send");

    assert_eq!(confirmed.id.as_str(), "m-554");
    assert_eq!(ids(&session.messages(&direct().id).await), vec!["m-1", "m-554"]);
    assert_eq!(confirmations(&mut events), 1);
}

#[tokio::test]
async fn echo_from_another_sender_is_not_taken_for_a_pending_send() {
    let (session, _, api) =
        connected_session(FakeApi::default().reply_with(raw("m-554", "c1", "me", "hello"))).await;
    session.open_conversation(direct()).await.expect("open");
    let mut events = session.subscribe_events();
    let release = api.gate_send().await;

    let sender = Arc::clone(&session);
    let send = tokio::spawn(async move { sender.send_message(&direct(), "hello").await });
    next_matching(&mut events, |e| matches!(e, SyncEvent::MessageAppended { .. })).await;

    session
        .apply_channel_event(ChannelEvent::MessageReceived {
            conversation_id: direct().id,
            message: raw("m-9", "c1", "partner", "hello"),
        })
        .await;
    let messages = session.messages(&direct().id).await;
    assert_eq!(messages.len(), 2);
    assert!(messages[0].is_pending());

    release.send(()).expect("release send");
    send.await.expect("join").expect("send");
    assert_eq!(ids(&session.messages(&direct().id).await), vec!["m-554", "m-9"]);
}

#[tokio::test]
async fn send_error_after_echo_keeps_the_delivered_message() {
    let (session, _, api) = connected_session(FakeApi::default()).await;
    session.open_conversation(direct()).await.expect("open");
    let mut events = session.subscribe_events();
    let release = api.gate_send().await;

    let sender = Arc::clone(&session);
    let send = tokio::spawn(async move { sender.send_message(&direct(), "hello").await });
    next_matching(&mut events, |e| matches!(e, SyncEvent::MessageAppended { .. })).await;
    session
        .apply_channel_event(ChannelEvent::MessageReceived {
            conversation_id: direct().id,
            message: raw("m-554", "c1", "me", "hello"),
        })
        .await;

    release.send(()).expect("release send");
    let delivered = send.await.expect("join").expect("delivered by echo");

    assert_eq!(delivered.id.as_str(), "m-554");
    assert_eq!(ids(&session.messages(&direct().id).await), vec!["m-554"]);
}

#[tokio::test]
async fn echo_after_confirmation_is_suppressed() {
    let (session, _, _) =
        connected_session(FakeApi::default().reply_with(raw("m-554", "c1", "me", "hello"))).await;
    session.open_conversation(direct()).await.expect("open");
    session.send_message(&direct(), "hello").await.expect("send");

    session
        .apply_channel_event(ChannelEvent::MessageReceived {
            conversation_id: direct().id,
            message: raw("m-554", "c1", "me", "hello"),
        })
        .await;

    assert_eq!(ids(&session.messages(&direct().id).await), vec!["m-554"]);
}

#[tokio::test]
async fn failed_send_rolls_back_and_returns_the_draft() {
    let (session, _, _) =
        connected_session(FakeApi::with_history(vec![raw("m-1", "c1", "partner", "hi")])).await;
    session.open_conversation(direct()).await.expect("open");
    let mut events = session.subscribe_events();

    let err = session
        .send_message(&direct(), "hello")
        .await
        .expect_err("send must fail");

    assert!(matches!(err, SyncError::SendFailed { .. }));
    assert_eq!(err.draft(), Some("hello"));
    assert!(err.to_string().contains("500 Internal Server Error"));
    assert_eq!(ids(&session.messages(&direct().id).await), vec!["m-1"]);

    let event = next_matching(&mut events, |e| matches!(e, SyncEvent::MessageFailed { .. })).await;
    let SyncEvent::MessageFailed { draft, temp_id, .. } = event else {
        unreachable!()
    };
    assert_eq!(draft, "hello");
    assert!(temp_id.as_str().starts_with("temp-"));
}

#[tokio::test]
async fn failed_send_restores_the_draft_as_typed() {
    let (session, _, api) = connected_session(FakeApi::default()).await;
    session.open_conversation(direct()).await.expect("open");

    let err = session
        .send_message(&direct(), "  hello  ")
        .await
        .expect_err("send must fail");

    assert_eq!(err.draft(), Some("  hello  "));
    assert_eq!(api.sent_texts.lock().expect("texts").clone(), vec!["hello"]);
}

#[tokio::test]
async fn blank_messages_and_signed_out_sends_are_rejected() {
    let (session, _, api) = connected_session(FakeApi::default()).await;
    assert!(matches!(
        session.send_message(&direct(), "   ").await,
        Err(SyncError::EmptyMessage)
    ));

    session.sign_out().await;
    assert!(matches!(
        session.send_message(&direct(), "hello").await,
        Err(SyncError::NotSignedIn)
    ));
    assert!(matches!(
        session.open_conversation(direct()).await,
        Err(SyncError::NotSignedIn)
    ));
    assert!(api.sent_texts.lock().expect("texts").is_empty());
}

#[tokio::test]
async fn opening_a_circle_seeds_history_then_joins_its_room() {
    let (session, transport, _) = connected_session(FakeApi::with_history(vec![
        raw("m-1", "circle-1", "u-1", "one"),
        raw("m-2", "circle-1", "u-2", "two"),
    ]))
    .await;

    let messages = session.open_conversation(circle()).await.expect("open");

    assert_eq!(ids(&messages), vec!["m-1", "m-2"]);
    assert_eq!(
        transport.sent(),
        vec![ClientRequest::JoinRoom {
            conversation_id: circle().id
        }]
    );

    session.open_conversation(direct()).await.expect("open direct");
    assert_eq!(transport.sent().len(), 1, "direct chats do not join rooms");

    session
        .close_conversation(&circle().id)
        .await
        .expect("close");
    assert_eq!(
        transport.sent().last(),
        Some(&ClientRequest::LeaveRoom {
            conversation_id: circle().id
        })
    );
    assert_eq!(session.messages(&circle().id).await.len(), 2);
}

#[tokio::test]
async fn history_failure_is_reported_but_the_room_is_still_joined() {
    let (session, transport, _) = connected_session(FakeApi {
        fail_history: true,
        ..FakeApi::default()
    })
    .await;
    let mut events = session.subscribe_events();

    let err = session
        .open_conversation(circle())
        .await
        .expect_err("history fails");

    assert!(matches!(err, SyncError::Other(_)));
    assert_eq!(transport.sent().len(), 1);
    let event = next_matching(&mut events, |e| matches!(e, SyncEvent::Error(_))).await;
    let SyncEvent::Error(text) = event else {
        unreachable!()
    };
    assert!(text.contains("history endpoint unavailable"));
}

#[tokio::test]
async fn reconnect_reasserts_registration_and_rooms() {
    let (session, transport, _) = connected_session(FakeApi::default()).await;
    session.open_conversation(circle()).await.expect("open");
    session.open_conversation(direct()).await.expect("open");
    transport.clear_sent();

    let connection = session.connection();
    connection
        .handle_signal(TransportSignal::Disconnected {
            reason: "connection reset".into(),
        })
        .await;
    assert_eq!(session.connection_state().await, SessionState::Connecting);

    connection
        .handle_signal(TransportSignal::Reconnected { attempt: 1 })
        .await;
    assert_eq!(session.connection_state().await, SessionState::Connected);
    assert_eq!(
        transport.sent(),
        vec![
            ClientRequest::Register { user_id: me() },
            ClientRequest::JoinRoom {
                conversation_id: circle().id
            },
        ]
    );
}

#[tokio::test]
async fn pushed_messages_flow_through_the_applier() {
    let (session, transport, _) = connected_session(FakeApi::default()).await;
    session.open_conversation(circle()).await.expect("open");
    let mut events = session.subscribe_events();

    transport.push(TransportSignal::Frame(ServerEvent::NewMessage {
        conversation_id: circle().id,
        message: raw("m-7", "circle-1", "u-3", "from the room"),
    }));

    let event = next_matching(&mut events, |e| matches!(e, SyncEvent::MessageAppended { .. })).await;
    let SyncEvent::MessageAppended { message, .. } = event else {
        unreachable!()
    };
    assert_eq!(message.id.as_str(), "m-7");
    assert_eq!(message.sender_id, UserId::from("u-3"));
    assert_eq!(ids(&session.messages(&circle().id).await), vec!["m-7"]);
}

#[tokio::test]
async fn read_receipts_mark_cached_messages() {
    let (session, _, _) = connected_session(FakeApi::with_history(vec![
        raw("m-1", "c1", "me", "one"),
        raw("m-2", "c1", "me", "two"),
    ]))
    .await;
    session.open_conversation(direct()).await.expect("open");

    session
        .apply_channel_event(ChannelEvent::ReadReceipt {
            conversation_id: direct().id,
            user_id: partner(),
        })
        .await;

    let messages = session.messages(&direct().id).await;
    assert!(messages.iter().all(|m| m.read_by.contains(&partner())));
}

#[tokio::test]
async fn clearing_empties_the_log_locally_and_from_push() {
    let (session, _, _) =
        connected_session(FakeApi::with_history(vec![raw("m-1", "c1", "partner", "hi")])).await;
    session.open_conversation(direct()).await.expect("open");

    session.clear_history(&direct()).await.expect("clear");
    assert!(session.messages(&direct().id).await.is_empty());

    session
        .apply_channel_event(ChannelEvent::MessageReceived {
            conversation_id: direct().id,
            message: raw("m-2", "c1", "partner", "again"),
        })
        .await;
    session
        .apply_channel_event(ChannelEvent::ConversationCleared {
            conversation_id: direct().id,
        })
        .await;
    assert!(session.messages(&direct().id).await.is_empty());
}

#[tokio::test]
async fn blocked_conversations_reject_sends_and_calls() {
    let (session, transport, api) = connected_session(FakeApi::default()).await;
    session.open_conversation(direct()).await.expect("open");

    session
        .apply_channel_event(ChannelEvent::BlockUpdated {
            conversation_id: direct().id,
            blocked_by: vec![partner()],
        })
        .await;
    let err = session
        .send_message(&direct(), "hello")
        .await
        .expect_err("blocked");
    assert!(matches!(
        err,
        SyncError::Authorization(ChannelErrorCode::BlockedByTarget)
    ));
    assert_eq!(err.to_string(), ChannelErrorCode::BlockedByTarget.describe());

    session.set_blocked(&direct(), true).await.expect("block");
    assert!(matches!(
        session
            .send_signal(partner(), CallType::Audio, CallSignal::End)
            .await,
        Err(SyncError::Authorization(ChannelErrorCode::YouBlockedTarget))
    ));
    assert!(api.sent_texts.lock().expect("texts").is_empty());
    assert!(transport.sent().is_empty());
    assert!(session.messages(&direct().id).await.is_empty());
}

#[tokio::test]
async fn signals_go_out_when_connected_and_not_blocked() {
    let (session, transport, _) = connected_session(FakeApi::default()).await;
    let offer = CallSignal::Offer {
        sdp: "v=0".into(),
    };

    session
        .send_signal(partner(), CallType::Video, offer.clone())
        .await
        .expect("signal");

    assert_eq!(
        transport.sent(),
        vec![ClientRequest::Signal {
            to: partner(),
            call_type: CallType::Video,
            signal: offer,
        }]
    );
}

#[tokio::test]
async fn load_older_prepends_before_the_oldest_entry() {
    let api = FakeApi::with_history(vec![raw("m-3", "c1", "partner", "three")]);
    *api.older.lock().expect("older") = vec![
        raw("m-1", "c1", "partner", "one"),
        raw("m-2", "c1", "me", "two"),
    ];
    let (session, _, api) = connected_session(api).await;
    session.open_conversation(direct()).await.expect("open");

    let added = session.load_older(&direct()).await.expect("older");

    assert_eq!(added, 2);
    assert_eq!(
        ids(&session.messages(&direct().id).await),
        vec!["m-1", "m-2", "m-3"]
    );
    let before = api
        .queries
        .lock()
        .expect("queries")
        .last()
        .and_then(|q| q.before.clone());
    assert_eq!(before, Some(MessageId::from("m-3")));
}

#[tokio::test]
async fn reopening_a_cached_conversation_keeps_older_pages() {
    let api = FakeApi::with_history(vec![raw("m-3", "circle-1", "u-1", "three")]);
    *api.older.lock().expect("older") = vec![
        raw("m-1", "circle-1", "u-2", "one"),
        raw("m-2", "circle-1", "u-2", "two"),
    ];
    let (session, _, api) = connected_session(api).await;
    session.open_conversation(circle()).await.expect("open");
    session.load_older(&circle()).await.expect("older");
    session
        .close_conversation(&circle().id)
        .await
        .expect("close");

    api.history
        .lock()
        .expect("history")
        .push(raw("m-4", "circle-1", "u-1", "while away"));
    let messages = session.open_conversation(circle()).await.expect("reopen");

    assert_eq!(ids(&messages), vec!["m-1", "m-2", "m-3", "m-4"]);
}

#[tokio::test]
async fn sign_out_leaves_rooms_and_drops_state() {
    let (session, transport, _) =
        connected_session(FakeApi::with_history(vec![raw("m-1", "circle-1", "u-1", "one")])).await;
    session.open_conversation(circle()).await.expect("open");

    session.sign_out().await;

    assert_eq!(
        transport.sent().last(),
        Some(&ClientRequest::LeaveRoom {
            conversation_id: circle().id
        })
    );
    assert!(transport.is_closed());
    assert_eq!(session.connection_state().await, SessionState::Disconnected);
    assert!(session.messages(&circle().id).await.is_empty());
}

#[tokio::test]
async fn signing_in_as_someone_else_requires_sign_out() {
    let (session, _, _) = connected_session(FakeApi::default()).await;

    assert!(session.sign_in(me()).await.is_ok());
    let err = session
        .sign_in(UserId::from("someone-else"))
        .await
        .expect_err("second user");
    assert!(err.to_string().contains("sign out first"));
}

#[tokio::test]
async fn failed_connect_leaves_the_session_signed_out() {
    let session = ChatSession::new_with_dependencies(
        &SyncConfig::default(),
        Arc::new(FakeApi::default()),
        Arc::new(RecordingTransport::failing_open()),
    );

    assert!(session.sign_in(me()).await.is_err());
    assert_eq!(session.connection_state().await, SessionState::Disconnected);
    assert!(matches!(
        session.send_message(&direct(), "hello").await,
        Err(SyncError::NotSignedIn)
    ));
}
