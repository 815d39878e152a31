use std::time::Duration;

use shared::error::{ApiError, ErrorCode};

use super::*;
use crate::api::ChannelPage;
use crate::repository::InMemoryRepositoryFacade;
use crate::testutil::{
    at, cid, connected_event, message, message_deleted_event, new_message_event, text_frame,
    wait_until, MockChatApi, SessionDriver, TestTransport,
};

struct Fixture {
    client: Arc<ChatClient>,
    transport: Arc<TestTransport>,
    api: Arc<MockChatApi>,
    repo: Arc<InMemoryRepositoryFacade>,
}

fn fixture(api: MockChatApi) -> Fixture {
    let transport = TestTransport::new();
    let api = Arc::new(api);
    let repo = InMemoryRepositoryFacade::new();
    let config = ChatConfig {
        backoff_base: Duration::from_millis(1),
        backoff_cap: Duration::from_millis(8),
        backoff_jitter: false,
        health_check_timeout: Duration::from_secs(5),
        ..ChatConfig::default()
    };
    let user = User::new("u1");
    let client = ChatClient::with_dependencies(
        config,
        user,
        Arc::clone(&transport) as Arc<dyn SocketTransport>,
        Arc::clone(&api) as Arc<dyn ChatApi>,
        Arc::clone(&repo) as Arc<dyn RepositoryFacade>,
        Arc::new(NoRetryPolicy),
        Arc::new(DefaultChatEventHandler::new("u1".into())),
    );
    Fixture {
        client,
        transport,
        api,
        repo,
    }
}

async fn connect(fixture: &Fixture) -> SessionDriver {
    let driver = fixture.transport.accept();
    fixture.client.connect();
    driver
        .frames
        .send(text_frame(&connected_event("c1", "u1")))
        .expect("inject ack");
    let client = Arc::clone(&fixture.client);
    assert!(wait_until(move || client.connection_state().is_connected()).await);
    driver
}

#[tokio::test]
async fn offline_to_connected_to_tombstone_scenario() {
    let f = fixture(MockChatApi::default());
    assert_eq!(f.client.connection_state(), ConnectionState::Disconnected);

    let driver = connect(&f).await;
    assert_eq!(
        f.client.connection_state(),
        ConnectionState::Connected {
            connection_id: "c1".into(),
        }
    );
    assert_eq!(
        f.client.global_state().user().map(|u| u.id),
        Some("u1".into())
    );
    assert!(f.client.client_state().initialized());

    let channel = f.client.channel_state(&cid("messaging:123"));
    driver
        .frames
        .send(text_frame(&new_message_event(
            "messaging:123",
            message("m1", "messaging:123", "u2", 10, 10),
        )))
        .expect("inject message");

    let channel_ref = Arc::clone(&channel);
    assert!(wait_until(move || channel_ref.message(&"m1".into()).is_some()).await);

    driver
        .frames
        .send(text_frame(&message_deleted_event(
            "messaging:123",
            message("m1", "messaging:123", "u2", 10, 10),
            at(20),
        )))
        .expect("inject delete");

    let channel_ref = Arc::clone(&channel);
    assert!(
        wait_until(move || {
            channel_ref
                .message(&"m1".into())
                .is_some_and(|m| m.is_deleted())
        })
        .await
    );
    // Tombstoned, not removed: present for sort stability, hidden from the
    // visible view.
    assert_eq!(channel.sorted_messages().len(), 1);
    assert!(channel.visible_messages().is_empty());

    f.client.disconnect().await;
}

#[tokio::test]
async fn optimistic_send_reconciles_with_server_ack() {
    let f = fixture(MockChatApi::default());
    let channel_cid = cid("messaging:1");

    let sent = f
        .client
        .send_message(&channel_cid, "hello")
        .await
        .expect("send");
    assert_eq!(sent.sync_status, SyncStatus::Completed);

    let stored = f
        .repo
        .select_message(&sent.id)
        .await
        .expect("select")
        .expect("stored");
    assert_eq!(stored.sync_status, SyncStatus::Completed);

    let channel = f.client.channel_state(&channel_cid);
    assert_eq!(
        channel.message(&sent.id).map(|m| m.sync_status),
        Some(SyncStatus::Completed)
    );
}

#[tokio::test]
async fn permanently_rejected_send_is_marked_and_surfaced() {
    let api = MockChatApi::default();
    *api.fail_sends_with.lock().expect("lock") = Some(ChatError::Server(ApiError::new(
        ErrorCode::Validation,
        "rejected",
    )));
    let f = fixture(api);
    let channel_cid = cid("messaging:1");

    let err = f
        .client
        .send_message(&channel_cid, "hello")
        .await
        .expect_err("must fail");
    assert!(err.is_permanent());

    let ids = f
        .repo
        .select_message_ids_by_sync_status(SyncStatus::FailedPermanently)
        .await
        .expect("select");
    assert_eq!(ids.len(), 1);

    let channel = f.client.channel_state(&channel_cid);
    assert_eq!(
        channel.message(&ids[0]).map(|m| m.sync_status),
        Some(SyncStatus::FailedPermanently)
    );
    assert!(f.client.global_state().snapshot().last_error.is_some());
}

#[tokio::test]
async fn transiently_failed_send_is_resubmitted_by_sync() {
    let api = MockChatApi::default();
    *api.fail_sends_with.lock().expect("lock") = Some(ChatError::network("offline"));
    let f = fixture(api);
    let channel_cid = cid("messaging:1");

    let err = f
        .client
        .send_message(&channel_cid, "hello")
        .await
        .expect_err("offline send fails");
    assert!(err.is_temporary());

    let pending = f
        .repo
        .select_message_ids_by_sync_status(SyncStatus::SyncNeeded)
        .await
        .expect("select");
    assert_eq!(pending.len(), 1);

    // Connectivity returns; the sync pass pushes the queued message.
    *f.api.fail_sends_with.lock().expect("lock") = None;
    let report = f.client.sync().await;
    assert_eq!(report.synced_messages, pending);

    let stored = f
        .repo
        .select_message(&pending[0])
        .await
        .expect("select")
        .expect("stored");
    assert_eq!(stored.sync_status, SyncStatus::Completed);
}

#[tokio::test]
async fn delete_message_tombstones_locally_and_remotely() {
    let f = fixture(MockChatApi::default());
    let channel_cid = cid("messaging:1");
    let sent = f
        .client
        .send_message(&channel_cid, "hello")
        .await
        .expect("send");

    let deleted = f.client.delete_message(&sent.id).await.expect("delete");
    assert!(deleted.is_deleted());
    assert_eq!(deleted.sync_status, SyncStatus::Completed);
    assert!(f
        .api
        .ops()
        .iter()
        .any(|op| op.starts_with("delete_message")));
}

#[tokio::test]
async fn push_message_triggers_channel_watch_through_dispatcher() {
    let api = MockChatApi::default().with_channel_page(
        "messaging:7",
        ChannelPage {
            channel: shared::models::ChannelData {
                cid: cid("messaging:7"),
                ..shared::models::ChannelData::default()
            },
            messages: vec![message("m9", "messaging:7", "u2", 10, 10)],
            ..ChannelPage::default()
        },
    );
    let f = fixture(api);

    f.client.on_push_message(PushMessage {
        channel_type: "messaging".to_string(),
        channel_id: "7".to_string(),
        message_id: "m9".into(),
    });

    let api = Arc::clone(&f.api);
    assert!(
        wait_until(move || {
            api.ops()
                .iter()
                .any(|op| op.starts_with("query_channel:messaging:7"))
        })
        .await
    );
    let client = Arc::clone(&f.client);
    assert!(
        wait_until(move || {
            client
                .channel_state(&cid("messaging:7"))
                .message(&"m9".into())
                .is_some()
        })
        .await
    );
}

#[tokio::test]
async fn reconnection_resubmits_queued_work_automatically() {
    let api = MockChatApi::default();
    *api.fail_sends_with.lock().expect("lock") = Some(ChatError::network("offline"));
    let f = fixture(api);
    let channel_cid = cid("messaging:1");

    let _ = f
        .client
        .send_message(&channel_cid, "queued while offline")
        .await
        .expect_err("offline send fails");

    // Connection comes up; the connected ack must trigger a sync that
    // resubmits the queued message without any manual call.
    *f.api.fail_sends_with.lock().expect("lock") = None;
    let _driver = connect(&f).await;

    let mut drained = false;
    for _ in 0..200 {
        let pending = f
            .repo
            .select_message_ids_by_sync_status(SyncStatus::SyncNeeded)
            .await
            .expect("select");
        if pending.is_empty() {
            drained = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(drained, "queued message should be resubmitted on reconnect");

    f.client.disconnect().await;
}

#[tokio::test]
async fn logout_clears_session_state_and_cache() {
    let f = fixture(MockChatApi::default());
    let channel_cid = cid("messaging:1");
    f.client
        .send_message(&channel_cid, "hello")
        .await
        .expect("send");
    assert!(f.client.global_state().user().is_some());

    f.client.logout().await;

    assert!(f.client.global_state().user().is_none());
    assert!(f.client.client_state().user().is_none());
    let remaining = f
        .repo
        .select_message_ids_by_sync_status(SyncStatus::Completed)
        .await
        .expect("select");
    assert!(remaining.is_empty());
}

#[tokio::test]
async fn subscriptions_receive_dispatched_events() {
    let f = fixture(MockChatApi::default());
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _sub = f.client.subscribe(
        EventFilter::type_tag("message.new"),
        move |event| {
            sink.lock().expect("lock").push(event.type_tag());
        },
    );

    let driver = connect(&f).await;
    let channel = f.client.channel_state(&cid("messaging:1"));
    driver
        .frames
        .send(text_frame(&new_message_event(
            "messaging:1",
            message("m1", "messaging:1", "u2", 10, 10),
        )))
        .expect("inject message");

    let channel_ref = Arc::clone(&channel);
    assert!(wait_until(move || channel_ref.message(&"m1".into()).is_some()).await);
    assert_eq!(*seen.lock().expect("lock"), vec!["message.new"]);

    f.client.disconnect().await;
}
