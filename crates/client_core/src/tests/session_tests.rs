use std::{sync::Arc, time::Duration};

use serde_json::{json, Value};
use shared::{
    domain::{DeliveryState, UserId},
    protocol::{InboxItem, RawPushFrame},
};
use tokio::sync::broadcast;

use super::*;
use crate::{
    fakes::{at, profile, wire, FakeBackend, FakeTransport, TransportCall},
    session_store::MemorySessionStore,
    subscriptions::TransportFrame,
};

struct Harness {
    session: Arc<ChatSession>,
    backend: Arc<FakeBackend>,
    transport: Arc<FakeTransport>,
    store: Arc<MemorySessionStore>,
    events: broadcast::Receiver<ClientEvent>,
}

fn harness() -> Harness {
    let backend = FakeBackend::new();
    let transport = FakeTransport::new();
    let snapshot = SessionSnapshot {
        access_token: AccessToken::new("token-1"),
        user: profile("me", "Me"),
    };
    let store = Arc::new(MemorySessionStore::new(Some(snapshot.clone())));
    let session = ChatSession::new(
        ClientSettings::default(),
        snapshot,
        backend.clone(),
        transport.clone(),
        store.clone(),
    );
    let events = session.subscribe_events();
    Harness {
        session,
        backend,
        transport,
        store,
        events,
    }
}

fn id(value: &str) -> UserId {
    UserId::new(value)
}

fn inbox_item(participant: &str, message: shared::protocol::WireMessage) -> InboxItem {
    InboxItem {
        id: format!("conv-{participant}"),
        participant: profile(participant, &participant.to_uppercase()),
        last_message: message,
    }
}

fn push(transport: &FakeTransport, channel: &str, event: &str, data: Value) {
    transport.emit(TransportFrame::Event(RawPushFrame::new(channel, event, data)));
}

fn incoming(id: &str, sender: &str, seconds: i64) -> Value {
    serde_json::to_value(wire(id, sender, "me", "hello", seconds)).expect("serialize message")
}

fn presence_snapshot(ids: &[&str]) -> Value {
    let hash: serde_json::Map<String, Value> = ids
        .iter()
        .map(|id| (id.to_string(), json!({ "name": id.to_uppercase() })))
        .collect();
    json!({ "presence": { "ids": ids, "hash": hash, "count": ids.len() } })
}

async fn wait_for(
    events: &mut broadcast::Receiver<ClientEvent>,
    mut matches: impl FnMut(&ClientEvent) -> bool,
) -> ClientEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return event,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(err) => panic!("event bus closed: {err}"),
            }
        }
    })
    .await
    .expect("event within timeout")
}

async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

fn row_keys(rows: &[InboxRow]) -> Vec<String> {
    rows.iter()
        .map(|row| row.summary.conversation_key.to_string())
        .collect()
}

#[tokio::test]
async fn start_loads_sorted_inbox_and_subscribes() {
    let h = harness();
    h.backend
        .set_friends(vec![profile("bob", "Bob"), profile("carol", "Carol")]);
    h.backend.set_inbox(vec![
        inbox_item("bob", wire("m1", "bob", "me", "hey", 10)),
        inbox_item("carol", wire("m2", "me", "carol", "yo", 20)),
    ]);

    h.session.start().await.expect("start");

    let rows = h.session.inbox_rows().await;
    assert_eq!(row_keys(&rows), ["carol", "bob"]);
    assert!(!rows[0].unread_for_me);
    assert!(rows[1].unread_for_me);
    assert_eq!(h.transport.subscribed().len(), 3);
    assert!(h.transport.subscribed().contains("private-chat-me"));
    assert_eq!(h.session.subscription_state(), SubscriptionState::Subscribed);
    assert!(h.session.last_error().await.is_none());
}

#[tokio::test]
async fn opening_a_conversation_loads_history_and_marks_it_read() {
    let mut h = harness();
    h.backend.set_inbox(vec![inbox_item(
        "bob",
        wire("m3", "bob", "me", "third", 3),
    )]);
    h.backend.set_history(
        "bob",
        vec![
            wire("m1", "bob", "me", "first", 1),
            wire("m2", "me", "bob", "second", 2),
            wire("m3", "bob", "me", "third", 3),
        ],
    );
    let mut bob = profile("bob", "Bob");
    bob.is_online = true;
    bob.last_seen = Some(at(50));
    h.backend.add_user(bob.clone());
    h.session.start().await.expect("start");
    assert!(h.session.inbox_rows().await[0].unread_for_me);

    h.session.open_conversation(id("bob")).await.expect("open conversation");

    let messages = h.session.messages(&id("bob")).await;
    let ids: Vec<_> = messages.iter().map(|m| m.id.to_string()).collect();
    assert_eq!(ids, ["m1", "m2", "m3"]);
    assert!(messages.iter().filter(|m| m.is_from(&id("bob"))).all(|m| m.read));
    assert_eq!(h.backend.mark_read_calls(), vec![id("bob")]);
    assert!(!h.session.inbox_rows().await[0].unread_for_me);
    assert_eq!(h.backend.page_requests(), vec![(id("bob"), 100, 0)]);

    wait_for(&mut h.events, |event| {
        matches!(event, ClientEvent::ScrollToLatest { conversation } if conversation == &id("bob"))
    })
    .await;
    let counterpart = h.session.counterpart().await.expect("counterpart resolved");
    assert_eq!(counterpart.profile, bob);
    assert!(counterpart.online);
    assert_eq!(h.session.active_conversation().await, Some(id("bob")));
}

#[tokio::test]
async fn pagination_stops_after_a_short_page() {
    let mut h = harness();
    let history = (0..140)
        .map(|i| wire(&format!("m{i}"), "bob", "me", "x", i))
        .collect();
    h.backend.set_history("bob", history);

    h.session.open_conversation(id("bob")).await.expect("open conversation");
    let cursor = h.session.pagination_cursor().await.expect("pagination cursor");
    assert_eq!(cursor.offset, 100);
    assert!(!cursor.exhausted);

    assert!(h.session.load_older().await.expect("load older"));
    let cursor = h.session.pagination_cursor().await.expect("pagination cursor");
    assert_eq!(cursor.offset, 140);
    assert!(cursor.exhausted);
    wait_for(&mut h.events, |event| {
        matches!(event, ClientEvent::HistoryExhausted { .. })
    })
    .await;

    assert!(!h.session.load_older().await.expect("load older"));
    assert_eq!(
        h.backend.page_requests(),
        vec![(id("bob"), 100, 0), (id("bob"), 100, 100)]
    );

    let messages = h.session.messages(&id("bob")).await;
    assert_eq!(messages.len(), 140);
    assert!(messages
        .windows(2)
        .all(|pair| pair[0].created_at <= pair[1].created_at));
}

#[tokio::test]
async fn reopening_an_exhausted_conversation_does_not_walk_history_again() {
    let h = harness();
    let history = (0..140)
        .map(|i| wire(&format!("m{i}"), "bob", "me", "x", i))
        .collect();
    h.backend.set_history("bob", history);

    h.session.open_conversation(id("bob")).await.expect("open conversation");
    assert!(h.session.load_older().await.expect("load older"));
    h.session.close_conversation().await;
    h.session.open_conversation(id("bob")).await.expect("reopen conversation");

    assert!(!h.session.load_older().await.expect("load older"));
    assert!(!h.session.on_scroll(0.0).await.expect("on scroll"));
    let cursor = h.session.pagination_cursor().await.expect("pagination cursor");
    assert_eq!(cursor.offset, 140);
    assert!(cursor.exhausted);
    assert_eq!(
        h.backend.page_requests(),
        vec![(id("bob"), 100, 0), (id("bob"), 100, 100), (id("bob"), 100, 0)]
    );
    assert_eq!(h.session.messages(&id("bob")).await.len(), 140);
}

#[tokio::test]
async fn scrolling_near_the_top_loads_older_history() {
    let h = harness();
    let history = (0..150)
        .map(|i| wire(&format!("m{i}"), "bob", "me", "x", i))
        .collect();
    h.backend.set_history("bob", history);
    h.session.open_conversation(id("bob")).await.expect("open conversation");

    assert!(!h.session.on_scroll(120.0).await.expect("on scroll"));
    assert_eq!(h.backend.page_requests().len(), 1);

    assert!(h.session.on_scroll(10.0).await.expect("on scroll"));
    assert_eq!(h.backend.page_requests().len(), 2);
    assert_eq!(h.session.messages(&id("bob")).await.len(), 150);
}

#[tokio::test]
async fn stale_page_for_a_previous_conversation_is_discarded() {
    let h = harness();
    h.backend
        .set_history("bob", vec![wire("b1", "bob", "me", "old", 1)]);
    h.backend
        .set_history("carol", vec![wire("c1", "carol", "me", "hi", 2)]);
    h.backend.add_user(profile("bob", "Bob"));
    h.backend.add_user(profile("carol", "Carol"));
    let gate = h.backend.gate_pages("bob");

    let session = Arc::clone(&h.session);
    let slow = tokio::spawn(async move { session.open_conversation(id("bob")).await });
    tokio::time::timeout(Duration::from_secs(2), async {
        while !h
            .backend
            .page_requests()
            .iter()
            .any(|(peer, _, _)| peer == &id("bob"))
        {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("bob's page requested");

    h.session.open_conversation(id("carol")).await.expect("open conversation");
    gate.notify_one();
    slow.await.expect("open task").expect("open bob");

    assert!(h.session.messages(&id("bob")).await.is_empty());
    assert_eq!(h.session.messages(&id("carol")).await.len(), 1);
    assert_eq!(h.session.active_conversation().await, Some(id("carol")));
    assert_eq!(h.backend.mark_read_calls(), vec![id("carol")]);
    assert_eq!(
        h.session.counterpart().await.map(|c| c.profile.id),
        Some(id("carol"))
    );
}

#[tokio::test]
async fn replaced_context_is_reported_as_stale() {
    let h = harness();
    let mut state = h.session.inner.lock().await;
    let guard = state.guard();
    assert!(state.check_current(guard).is_ok());

    state.epoch += 1;
    assert!(matches!(
        state.check_current(guard),
        Err(SyncError::StaleContext)
    ));
}

#[tokio::test]
async fn sent_message_is_reconciled_in_place_and_peer_is_notified() {
    let mut h = harness();
    h.backend
        .set_history("bob", vec![wire("m1", "bob", "me", "hello", 1)]);
    h.session.start().await.expect("start");
    h.session.open_conversation(id("bob")).await.expect("open conversation");

    let temp_id = h.session.send_message("  hi there  ").await.expect("send message");

    assert!(temp_id.is_temporary());
    let optimistic = h.session.messages(&id("bob")).await;
    assert_eq!(optimistic.len(), 2);
    assert_eq!(optimistic[1].id, temp_id);
    assert_eq!(optimistic[1].body, "hi there");
    assert_eq!(optimistic[1].delivery_state, DeliveryState::Optimistic);
    assert_eq!(h.session.send_state(&temp_id).await, Some(SendState::Pending));

    let delivered = wait_for(&mut h.events, |event| {
        matches!(event, ClientEvent::MessageDelivered { temp_id: t, .. } if t == &temp_id)
    })
    .await;
    let ClientEvent::MessageDelivered { id: server_id, .. } = delivered else {
        unreachable!();
    };

    let messages = h.session.messages(&id("bob")).await;
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1].id, server_id);
    assert_eq!(messages[1].delivery_state, DeliveryState::Confirmed);
    assert_eq!(
        h.session.send_state(&temp_id).await,
        Some(SendState::Confirmed)
    );
    assert_eq!(h.backend.sent(), vec![(id("bob"), "hi there".to_string())]);
    assert!(h.transport.triggers().contains(&(
        "client-sent-bob".to_string(),
        json!({ "senderId": "me" })
    )));

    let rows = h.session.inbox_rows().await;
    assert_eq!(rows[0].summary.last_message.id, server_id);
    assert!(!rows[0].unread_for_me);
}

#[tokio::test]
async fn push_echo_of_a_delivered_message_is_not_duplicated() {
    let mut h = harness();
    h.session.start().await.expect("start");
    h.session.open_conversation(id("bob")).await.expect("open conversation");

    let temp_id = h.session.send_message("hi").await.expect("send message");
    wait_for(&mut h.events, |event| {
        matches!(event, ClientEvent::MessageDelivered { temp_id: t, .. } if t == &temp_id)
    })
    .await;

    let echo = serde_json::to_value(wire("srv-0", "me", "bob", "hi", 5)).expect("serialize echo");
    push(&h.transport, "private-chat-me", "new-message", echo);
    settle().await;

    let ids: Vec<String> = h
        .session
        .messages(&id("bob"))
        .await
        .iter()
        .map(|message| message.id.to_string())
        .collect();
    assert_eq!(ids, ["srv-0"]);
    assert_eq!(h.session.inbox_rows().await.len(), 1);
}

#[tokio::test]
async fn failed_send_is_kept_and_can_be_retried_manually() {
    let mut h = harness();
    h.backend.push_send_result(Err(SyncError::network(
        "send message",
        "HTTP 500 Internal Server Error: db down",
    )));
    h.session.open_conversation(id("bob")).await.expect("open conversation");

    let temp_id = h.session.send_message("hello").await.expect("send message");
    wait_for(&mut h.events, |event| {
        matches!(event, ClientEvent::SendFailed { temp_id: t, .. } if t == &temp_id)
    })
    .await;

    let messages = h.session.messages(&id("bob")).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].delivery_state, DeliveryState::Failed);
    assert_eq!(h.session.send_state(&temp_id).await, Some(SendState::Failed));
    assert!(matches!(
        h.session.last_error().await,
        Some(SyncError::Delivery { temp_id: ref t, .. }) if t == &temp_id
    ));

    h.session.retry_failed(&temp_id).await.expect("retry failed");
    wait_for(&mut h.events, |event| {
        matches!(event, ClientEvent::MessageDelivered { temp_id: t, .. } if t == &temp_id)
    })
    .await;

    let messages = h.session.messages(&id("bob")).await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].delivery_state, DeliveryState::Confirmed);
    assert_eq!(h.backend.sent().len(), 2);

    let err = h.session.retry_failed(&temp_id).await.expect_err("already delivered");
    assert!(matches!(err, SyncError::InvalidInput(_)));
}

#[tokio::test]
async fn blank_or_unaddressed_messages_are_rejected() {
    let h = harness();

    let err = h.session.send_message("hi").await.expect_err("rejected message");
    assert!(matches!(err, SyncError::InvalidInput(_)));

    h.session.open_conversation(id("bob")).await.expect("open conversation");
    let err = h
        .session
        .send_message("   \n ")
        .await
        .expect_err("blank message");
    assert!(matches!(err, SyncError::InvalidInput(_)));

    assert!(h.session.messages(&id("bob")).await.is_empty());
    settle().await;
    assert!(h.backend.sent().is_empty());

    let err = h.session.open_conversation(id("me")).await.expect_err("self conversation");
    assert!(matches!(err, SyncError::InvalidInput(_)));
}

#[tokio::test]
async fn live_message_in_open_conversation_is_merged_once_and_marked_read() {
    let h = harness();
    h.session.start().await.expect("start");
    h.session.open_conversation(id("bob")).await.expect("open conversation");
    assert_eq!(h.backend.mark_read_calls().len(), 1);

    let frame = incoming("m9", "bob", 9);
    push(&h.transport, "private-chat-me", "new-message", frame.clone());
    tokio::time::timeout(Duration::from_secs(2), async {
        while h.backend.mark_read_calls().len() < 2 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("read receipt sent for live message");
    settle().await;

    push(&h.transport, "private-chat-me", "new-message", frame);
    settle().await;

    let messages = h.session.messages(&id("bob")).await;
    assert_eq!(messages.len(), 1);
    assert!(messages[0].read);
    let rows = h.session.inbox_rows().await;
    assert_eq!(rows.len(), 1);
    assert!(!rows[0].unread_for_me);
}

#[tokio::test]
async fn live_message_from_unseen_counterpart_is_inserted_at_inbox_head() {
    let mut h = harness();
    h.backend.set_inbox(vec![
        inbox_item("bob", wire("m1", "bob", "me", "hey", 10)),
        inbox_item("carol", wire("m2", "carol", "me", "yo", 20)),
    ]);
    h.backend.add_user(profile("dave", "Dave"));
    h.session.start().await.expect("start");

    let frame = incoming("m3", "dave", 100);
    push(&h.transport, "private-chat-me", "new-message", frame);

    wait_for(&mut h.events, |event| match event {
        ClientEvent::InboxUpdated(rows) => rows
            .first()
            .is_some_and(|row| row.summary.participant.name == "Dave"),
        _ => false,
    })
    .await;

    let rows = h.session.inbox_rows().await;
    assert_eq!(row_keys(&rows), ["dave", "carol", "bob"]);
    assert!(rows[0].unread_for_me);
    assert!(h.backend.mark_read_calls().is_empty());
}

#[tokio::test]
async fn presence_is_the_intersection_of_connected_members_and_friends() {
    let mut h = harness();
    h.backend.set_friends(vec![profile("a", "A")]);
    h.session.start().await.expect("start");

    push(
        &h.transport,
        "presence-global",
        "pusher_internal:subscription_succeeded",
        presence_snapshot(&["a", "b"]),
    );
    let online = wait_for(&mut h.events, |event| {
        matches!(event, ClientEvent::PresenceChanged(_))
    })
    .await;
    let ClientEvent::PresenceChanged(online) = online else {
        unreachable!();
    };
    assert_eq!(online.len(), 1);
    assert_eq!(online[0].friend_id, id("a"));

    push(
        &h.transport,
        "presence-global",
        "pusher_internal:member_added",
        json!({ "user_id": "c", "user_info": { "name": "C" } }),
    );
    push(
        &h.transport,
        "presence-global",
        "pusher_internal:member_added",
        json!({ "user_id": "c", "user_info": { "name": "C" } }),
    );
    push(
        &h.transport,
        "presence-global",
        "pusher_internal:member_removed",
        json!({ "user_id": "a" }),
    );
    wait_for(&mut h.events, |event| {
        matches!(event, ClientEvent::PresenceChanged(online) if online.is_empty())
    })
    .await;
    assert!(h.session.online_friends().is_empty());
}

#[tokio::test]
async fn friend_changes_rederive_the_online_set() {
    let mut h = harness();
    h.backend.set_friends(vec![profile("a", "A")]);
    h.backend
        .set_inbox(vec![inbox_item("a", wire("m1", "a", "me", "hey", 10))]);
    h.backend.add_user(profile("b", "B"));
    h.session.start().await.expect("start");
    push(
        &h.transport,
        "presence-global",
        "pusher_internal:subscription_succeeded",
        presence_snapshot(&["a", "b"]),
    );
    wait_for(&mut h.events, |event| {
        matches!(event, ClientEvent::PresenceChanged(online) if online.len() == 1)
    })
    .await;

    h.session.add_friend(id("b")).await.expect("add friend");
    let online: Vec<UserId> = h
        .session
        .online_friends()
        .into_iter()
        .map(|entry| entry.friend_id)
        .collect();
    assert_eq!(online, [id("a"), id("b")]);

    h.session.remove_friend(id("a")).await.expect("remove friend");
    let online: Vec<UserId> = h
        .session
        .online_friends()
        .into_iter()
        .map(|entry| entry.friend_id)
        .collect();
    assert_eq!(online, [id("b")]);
    let rows = h.session.inbox_rows().await;
    assert!(!rows[0].online);
    assert_eq!(h.backend.friend_changes(), ["add b", "remove a"]);
}

#[tokio::test]
async fn friend_changes_need_a_live_session_and_another_user() {
    let h = harness();
    assert!(matches!(
        h.session.add_friend(id("me")).await,
        Err(SyncError::InvalidInput(_))
    ));

    h.session.logout().await;
    assert!(matches!(
        h.session.add_friend(id("b")).await,
        Err(SyncError::NotAuthenticated)
    ));
    assert!(h.backend.friend_changes().is_empty());
}

#[tokio::test]
async fn presence_falls_back_to_connected_members_without_friend_list() {
    let mut h = harness();
    h.backend.fail_friends();
    h.session.start().await.expect("start");
    assert!(matches!(
        h.session.last_error().await,
        Some(SyncError::Network { .. })
    ));

    push(
        &h.transport,
        "presence-global",
        "pusher_internal:subscription_succeeded",
        presence_snapshot(&["a", "b"]),
    );
    wait_for(&mut h.events, |event| {
        matches!(event, ClientEvent::PresenceChanged(online) if online.len() == 2)
    })
    .await;

    let mut view = h.session.presence();
    let ids: Vec<_> = view
        .borrow_and_update()
        .iter()
        .map(|entry| entry.friend_id.to_string())
        .collect();
    assert_eq!(ids, ["a", "b"]);
}

#[tokio::test]
async fn counterpart_online_state_follows_live_presence() {
    let mut h = harness();
    h.backend.set_friends(vec![profile("bob", "Bob")]);
    h.backend.add_user(profile("bob", "Bob"));
    h.session.start().await.expect("start");
    h.session.open_conversation(id("bob")).await.expect("open conversation");
    assert!(!h.session.counterpart().await.expect("counterpart").online);

    push(
        &h.transport,
        "presence-global",
        "pusher_internal:subscription_succeeded",
        presence_snapshot(&["bob"]),
    );
    wait_for(&mut h.events, |event| {
        matches!(event, ClientEvent::PresenceChanged(online) if online.len() == 1)
    })
    .await;

    assert!(h.session.counterpart().await.expect("counterpart").online);
}

#[tokio::test(start_paused = true)]
async fn typing_indicator_restarts_on_each_event_and_clears_after_quiet_period() {
    let mut h = harness();
    h.session.open_conversation(id("bob")).await.expect("open conversation");
    let started = tokio::time::Instant::now();

    push(
        &h.transport,
        "presence-globchat",
        "client-typing-me",
        json!({ "senderId": "bob" }),
    );
    wait_for(&mut h.events, |event| {
        matches!(event, ClientEvent::TypingChanged { typing: true, .. })
    })
    .await;
    assert!(h.session.is_typing().await);

    tokio::time::sleep(Duration::from_millis(1000)).await;
    push(
        &h.transport,
        "presence-globchat",
        "client-typing-me",
        json!({ "senderId": "bob" }),
    );
    tokio::time::sleep(Duration::from_millis(1000)).await;
    assert!(h.session.is_typing().await);

    wait_for(&mut h.events, |event| {
        matches!(event, ClientEvent::TypingChanged { typing: false, .. })
    })
    .await;
    assert!(!h.session.is_typing().await);
    assert!(started.elapsed() >= Duration::from_millis(2200));
}

#[tokio::test]
async fn typing_from_others_is_ignored_and_peer_send_clears_it() {
    let mut h = harness();
    h.session.open_conversation(id("bob")).await.expect("open conversation");

    push(
        &h.transport,
        "presence-globchat",
        "client-typing-me",
        json!({ "senderId": "carol" }),
    );
    push(
        &h.transport,
        "presence-globchat",
        "client-typing-someone-else",
        json!({ "senderId": "bob" }),
    );
    settle().await;
    assert!(!h.session.is_typing().await);

    push(
        &h.transport,
        "presence-globchat",
        "client-typing-me",
        json!({ "senderId": "bob" }),
    );
    wait_for(&mut h.events, |event| {
        matches!(event, ClientEvent::TypingChanged { typing: true, .. })
    })
    .await;

    push(
        &h.transport,
        "presence-globchat",
        "client-sent-me",
        json!({ "senderId": "bob" }),
    );
    wait_for(&mut h.events, |event| {
        matches!(event, ClientEvent::TypingChanged { typing: false, .. })
    })
    .await;
    assert!(!h.session.is_typing().await);
}

#[tokio::test]
async fn keystrokes_signal_typing_to_the_counterpart() {
    let h = harness();
    h.session.start().await.expect("start");
    assert!(!h.session.on_keystroke(false).await.expect("on keystroke"));

    h.session.open_conversation(id("bob")).await.expect("open conversation");
    assert!(h.session.on_keystroke(false).await.expect("on keystroke"));
    assert!(!h.session.on_keystroke(true).await.expect("on keystroke"));

    let typing: Vec<_> = h
        .transport
        .triggers()
        .into_iter()
        .filter(|(event, _)| event == "client-typing-bob")
        .collect();
    assert_eq!(typing, vec![("client-typing-bob".to_string(), json!({ "senderId": "me" }))]);
}

#[tokio::test]
async fn reopening_a_conversation_refetches_without_duplicates() {
    let h = harness();
    h.backend.set_history(
        "bob",
        vec![wire("m1", "bob", "me", "a", 1), wire("m2", "bob", "me", "b", 2)],
    );
    h.session.open_conversation(id("bob")).await.expect("open conversation");
    h.session.close_conversation().await;
    assert_eq!(h.session.active_conversation().await, None);

    h.session.open_conversation(id("bob")).await.expect("open conversation");

    assert_eq!(h.session.messages(&id("bob")).await.len(), 2);
    assert_eq!(h.backend.page_requests().len(), 2);
}

#[tokio::test]
async fn subscription_failure_degrades_without_blocking_rest() {
    let mut h = harness();
    h.transport.fail_channel("presence-global");
    h.backend
        .set_inbox(vec![inbox_item("bob", wire("m1", "bob", "me", "hey", 10))]);

    h.session.start().await.expect("start");

    wait_for(&mut h.events, |event| {
        matches!(event, ClientEvent::Error(reason) if reason.contains("presence-global"))
    })
    .await;
    assert_eq!(h.session.inbox_rows().await.len(), 1);
    assert_eq!(h.session.subscription_state(), SubscriptionState::Subscribed);
}

#[tokio::test]
async fn logout_tears_down_channels_presence_and_persisted_session() {
    let mut h = harness();
    h.backend.set_friends(vec![profile("a", "A")]);
    h.session.start().await.expect("start");
    h.session.open_conversation(id("bob")).await.expect("open conversation");
    push(
        &h.transport,
        "presence-global",
        "pusher_internal:subscription_succeeded",
        presence_snapshot(&["a"]),
    );
    wait_for(&mut h.events, |event| {
        matches!(event, ClientEvent::PresenceChanged(online) if online.len() == 1)
    })
    .await;

    h.session.logout().await;

    wait_for(&mut h.events, |event| matches!(event, ClientEvent::LoggedOut)).await;
    assert!(h.transport.subscribed().is_empty());
    assert_eq!(h.transport.calls().last(), Some(&TransportCall::Disconnect));
    assert_eq!(h.session.subscription_state(), SubscriptionState::Unsubscribed);
    assert!(h.session.online_friends().is_empty());
    assert!(h.store.load().expect("load").is_none());
    assert_eq!(h.session.active_conversation().await, None);

    assert!(matches!(
        h.session.open_conversation(id("bob")).await,
        Err(SyncError::NotAuthenticated)
    ));
    assert!(matches!(
        h.session.send_message("hi").await,
        Err(SyncError::NotAuthenticated)
    ));
    assert!(matches!(
        h.session.start().await,
        Err(SyncError::NotAuthenticated)
    ));
}

#[tokio::test]
async fn logout_invalidates_the_credential_server_side_once() {
    let h = harness();
    h.session.start().await.expect("start");

    h.session.logout().await;
    h.session.logout().await;

    assert_eq!(h.backend.logout_calls(), 1);
}

#[tokio::test]
async fn failed_server_logout_still_tears_down_locally() {
    let mut h = harness();
    h.backend.fail_logout();
    h.session.start().await.expect("start");

    h.session.logout().await;

    wait_for(&mut h.events, |event| matches!(event, ClientEvent::LoggedOut)).await;
    assert_eq!(h.backend.logout_calls(), 1);
    assert!(h.transport.subscribed().is_empty());
    assert!(h.store.load().expect("load").is_none());
}

#[tokio::test]
async fn rejected_credential_logs_the_session_out() {
    let mut h = harness();
    h.backend.push_send_result(Err(SyncError::network(
        "send message",
        "HTTP 401 Unauthorized: jwt expired",
    )));
    h.session.start().await.expect("start");
    h.session.open_conversation(id("bob")).await.expect("open conversation");

    h.session.send_message("hello").await.expect("send message");

    wait_for(&mut h.events, |event| matches!(event, ClientEvent::LoggedOut)).await;
    assert!(h.store.load().expect("load").is_none());
    assert!(h.transport.subscribed().is_empty());
}

#[tokio::test]
async fn read_receipt_requests_are_single_flight() {
    let h = harness();
    h.session.open_conversation(id("bob")).await.expect("open conversation");
    let gate = h.backend.gate_mark_read();

    for n in 0..3 {
        let frame = incoming(&format!("m{n}"), "bob", n);
        push(&h.transport, "private-chat-me", "new-message", frame);
    }
    settle().await;
    assert_eq!(h.backend.mark_read_calls().len(), 2);

    gate.notify_one();
    tokio::time::timeout(Duration::from_secs(2), async {
        while h.backend.mark_read_calls().len() < 3 {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("queued receipt replayed");
    settle().await;
    assert_eq!(h.backend.mark_read_calls().len(), 3);
    assert!(h
        .session
        .messages(&id("bob"))
        .await
        .iter()
        .all(|message| message.read));
}

#[tokio::test]
async fn restore_requires_a_persisted_credential() {
    let result = ChatSession::restore(
        ClientSettings::default(),
        Arc::new(MemorySessionStore::new(None)),
    );
    assert!(matches!(result, Err(SyncError::NotAuthenticated)));
}
