use tokio::sync::Notify;

use super::*;
use crate::test_support::{COMPANY, FakeConnector, STUDENT, eventually, message, push_event, test_config};

fn hub_with(connector: &FakeConnector) -> ChatHub {
    ChatHub::new(Arc::new(connector.clone()), &test_config(), MessageStore::new(), RoomTracker::new())
}

async fn wait_for_state(hub: &ChatHub, state: ConnectionState) {
    eventually(|| hub.status().state == state).await;
}

#[tokio::test]
async fn connect_reaches_connected_without_error() {
    let connector = FakeConnector::new();
    let hub = hub_with(&connector);
    let mut status = hub.subscribe_status();

    hub.connect().await.expect("connect");

    assert_eq!(hub.status(), ConnectionStatus::new(ConnectionState::Connected, None));
    assert!(status.has_changed().expect("sender alive"));
    assert_eq!(status.borrow_and_update().state, ConnectionState::Connected);
    assert!(connector.calls(JOIN_CONVERSATION).is_empty(), "no active room, no join");
}

#[tokio::test]
async fn connect_failure_records_error_and_returns_it() {
    let connector = FakeConnector::new();
    connector.fail_next_opens(1);
    let hub = hub_with(&connector);

    let err = hub.connect().await.unwrap_err();
    assert!(matches!(err, ChatError::Connect(_)));

    let status = hub.status();
    assert_eq!(status.state, ConnectionState::Disconnected);
    let last_error = status.last_error.expect("error recorded");
    assert!(last_error.starts_with("Failed to connect:"), "{last_error}");
}

#[tokio::test]
async fn connect_times_out_when_open_hangs() {
    let connector = FakeConnector::new();
    connector.hang_opens(true);
    let hub = hub_with(&connector);

    let err = hub.connect().await.unwrap_err();
    assert!(matches!(err, ChatError::Timeout(_)));
    assert_eq!(hub.status().state, ConnectionState::Disconnected);
}

#[tokio::test]
async fn connect_stops_the_previous_link_first() {
    let connector = FakeConnector::new();
    let hub = hub_with(&connector);

    hub.connect().await.expect("first connect");
    hub.connect().await.expect("second connect");

    assert_eq!(connector.opens(), 2);
    assert_eq!(connector.stops(), 1);
    assert_eq!(hub.status().state, ConnectionState::Connected);
}

#[tokio::test]
async fn room_set_while_disconnected_is_joined_once_on_connect() {
    let connector = FakeConnector::new();
    let hub = hub_with(&connector);

    for _ in 0..3 {
        hub.set_active_conversation(Some("c1".to_owned())).await;
    }
    assert!(connector.invocations().is_empty(), "nothing is sent while disconnected");

    hub.connect().await.expect("connect");
    assert_eq!(connector.calls(JOIN_CONVERSATION), vec!["c1"]);
}

#[tokio::test]
async fn switching_rooms_leaves_then_joins() {
    let connector = FakeConnector::new();
    let hub = hub_with(&connector);
    hub.connect().await.expect("connect");

    hub.set_active_conversation(Some("c1".to_owned())).await;
    hub.set_active_conversation(Some("c2".to_owned())).await;
    hub.set_active_conversation(None).await;

    let sequence: Vec<(String, String)> = connector
        .invocations()
        .into_iter()
        .map(|(target, args)| (target, args[0].as_str().unwrap_or_default().to_owned()))
        .collect();
    assert_eq!(
        sequence,
        vec![
            (JOIN_CONVERSATION.to_owned(), "c1".to_owned()),
            (LEAVE_CONVERSATION.to_owned(), "c1".to_owned()),
            (JOIN_CONVERSATION.to_owned(), "c2".to_owned()),
            (LEAVE_CONVERSATION.to_owned(), "c2".to_owned()),
        ]
    );
}

#[tokio::test]
async fn room_switch_racing_a_connect_is_announced_after_its_join() {
    let connector = FakeConnector::new();
    let gate = Arc::new(Notify::new());
    connector.hold_target(JOIN_CONVERSATION, gate.clone());
    let hub = hub_with(&connector);
    hub.set_active_conversation(Some("c1".to_owned())).await;

    let connecting = tokio::spawn({
        let hub = hub.clone();
        async move { hub.connect().await }
    });
    eventually(|| connector.calls(JOIN_CONVERSATION) == vec!["c1"]).await;
    assert_eq!(hub.status().state, ConnectionState::Connected);

    let switching = tokio::spawn({
        let hub = hub.clone();
        async move { hub.set_active_conversation(Some("c2".to_owned())).await }
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(connector.calls(LEAVE_CONVERSATION).is_empty(), "switch waits for the install join");

    gate.notify_one();
    connecting.await.expect("connect task").expect("connect");
    gate.notify_one();
    switching.await.expect("switch task");

    let sequence: Vec<(String, String)> = connector
        .invocations()
        .into_iter()
        .map(|(target, args)| (target, args[0].as_str().unwrap_or_default().to_owned()))
        .collect();
    assert_eq!(
        sequence,
        vec![
            (JOIN_CONVERSATION.to_owned(), "c1".to_owned()),
            (LEAVE_CONVERSATION.to_owned(), "c1".to_owned()),
            (JOIN_CONVERSATION.to_owned(), "c2".to_owned()),
        ]
    );
}

#[tokio::test]
async fn pushes_land_in_store_regardless_of_active_room() {
    let connector = FakeConnector::new();
    let hub = hub_with(&connector);
    hub.set_active_conversation(Some("c1".to_owned())).await;
    hub.connect().await.expect("connect");

    connector.emit(push_event(&message("m1", "c2", STUDENT, "hello from c2")));
    eventually(|| hub.store().contains("c2", "m1")).await;
    assert!(hub.store().read("c1").is_empty());
}

#[tokio::test]
async fn push_filtering_drops_unusable_and_duplicate_messages() {
    let connector = FakeConnector::new();
    let hub = hub_with(&connector);
    hub.connect().await.expect("connect");

    connector.emit(push_event(&message("m0", "", STUDENT, "no conversation")));
    connector.emit(push_event(&message("own", "c1", COMPANY, "echo of my own send")));
    connector.emit(push_event(&message("m1", "c1", STUDENT, "first")));
    connector.emit(push_event(&message("m1", "c1", STUDENT, "first")));
    connector.emit(HubEvent::Invocation {
        target: "receivemessage".to_owned(),
        arguments: vec![serde_json::to_value(message("m2", "c1", STUDENT, "second")).expect("json")],
    });
    connector.emit(HubEvent::Invocation { target: "UserTyping".to_owned(), arguments: Vec::new() });

    eventually(|| hub.store().contains("c1", "m2")).await;
    let uuids: Vec<String> = hub.store().read("c1").iter().map(|m| m.uuid.clone()).collect();
    assert_eq!(uuids, vec!["m1", "m2"]);
    assert_eq!(hub.store().conversations(), vec!["c1"]);
}

#[tokio::test]
async fn transport_loss_reconnects_and_rejoins_once() {
    let connector = FakeConnector::new();
    let hub = hub_with(&connector);
    hub.set_active_conversation(Some("c1".to_owned())).await;
    hub.connect().await.expect("connect");
    assert_eq!(connector.calls(JOIN_CONVERSATION).len(), 1);

    connector.drop_link("socket reset");
    eventually(|| connector.opens() == 2 && hub.status().state == ConnectionState::Connected).await;
    eventually(|| connector.calls(JOIN_CONVERSATION).len() == 2).await;
    assert!(hub.status().last_error.is_none());

    connector.drop_link("socket reset again");
    eventually(|| connector.calls(JOIN_CONVERSATION).len() == 3).await;
    assert_eq!(connector.calls(JOIN_CONVERSATION), vec!["c1", "c1", "c1"]);
}

#[tokio::test]
async fn reconnecting_state_is_published_while_retrying() {
    let connector = FakeConnector::new();
    let hub = hub_with(&connector);
    hub.connect().await.expect("connect");
    let mut status = hub.subscribe_status();
    status.borrow_and_update();

    connector.hang_opens(true);
    connector.drop_link("socket reset");
    status.changed().await.expect("status change");
    let seen = status.borrow_and_update().clone();
    assert_eq!(seen, ConnectionStatus::new(ConnectionState::Reconnecting, Some("socket reset".to_owned())));

    // Manual reconnect supersedes the hanging retry loop.
    connector.hang_opens(false);
    hub.reconnect().await.expect("reconnect");
    assert_eq!(hub.status().state, ConnectionState::Connected);
}

#[tokio::test]
async fn exhausted_retries_fail_until_manual_reconnect() {
    let connector = FakeConnector::new();
    let hub = hub_with(&connector);
    hub.connect().await.expect("connect");

    connector.fail_next_opens(3);
    connector.drop_link("socket reset");
    wait_for_state(&hub, ConnectionState::Failed).await;

    let status = hub.status();
    assert_eq!(connector.opens(), 4, "one connect plus three capped retries");
    assert_eq!(status.last_error.as_deref(), Some("hub connect failed: connection refused"));

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(connector.opens(), 4, "no retries after giving up");

    hub.reconnect().await.expect("manual reconnect");
    assert_eq!(hub.status(), ConnectionStatus::new(ConnectionState::Connected, None));
}

#[tokio::test]
async fn close_without_reconnect_allowance_disconnects() {
    let connector = FakeConnector::new();
    let hub = hub_with(&connector);
    hub.connect().await.expect("connect");

    connector.emit(HubEvent::Closed { error: Some("server shutting down".to_owned()), allow_reconnect: false });
    wait_for_state(&hub, ConnectionState::Disconnected).await;
    assert_eq!(hub.status().last_error.as_deref(), Some("server shutting down"));
    assert_eq!(connector.opens(), 1);
}

#[tokio::test]
async fn clean_close_records_no_error() {
    let connector = FakeConnector::new();
    let hub = hub_with(&connector);
    hub.connect().await.expect("connect");

    connector.emit(HubEvent::Closed { error: None, allow_reconnect: false });
    wait_for_state(&hub, ConnectionState::Disconnected).await;
    assert!(hub.status().last_error.is_none());
}

#[tokio::test]
async fn send_only_invokes_while_connected_and_swallows_failures() {
    let connector = FakeConnector::new();
    let hub = hub_with(&connector);

    hub.send("c1", COMPANY, "before connect").await;
    assert!(connector.invocations().is_empty());

    hub.connect().await.expect("connect");
    hub.send("c1", COMPANY, "hello").await;
    let invocations = connector.invocations();
    assert_eq!(invocations.len(), 1);
    assert_eq!(invocations[0].0, SEND_MESSAGE_TO_CONVERSATION);
    assert_eq!(
        invocations[0].1,
        vec![Value::from("c1"), Value::from(COMPANY), Value::from("hello")]
    );

    connector.fail_target(SEND_MESSAGE_TO_CONVERSATION);
    hub.send("c1", COMPANY, "rejected").await;
    assert_eq!(hub.status().state, ConnectionState::Connected);
}

#[tokio::test]
async fn disconnect_is_final_for_the_old_link() {
    let connector = FakeConnector::new();
    let hub = hub_with(&connector);
    hub.connect().await.expect("connect");

    hub.disconnect().await;
    assert_eq!(hub.status(), ConnectionStatus::new(ConnectionState::Disconnected, None));
    assert_eq!(connector.stops(), 1);

    // Events from the retired link change nothing.
    connector.drop_link("late loss");
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(hub.status().state, ConnectionState::Disconnected);
    assert_eq!(connector.opens(), 1);

    hub.disconnect().await;
    assert_eq!(hub.status().state, ConnectionState::Disconnected);
}
