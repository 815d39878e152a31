use std::collections::HashSet;

use chrono::DateTime;
use shared::models::{Member, Read};

use super::*;
use crate::api::ChannelPage;
use crate::repository::InMemoryRepositoryFacade;
use crate::testutil::{at, cid, message, new_message_event, wait_until, MockChatApi};

struct Fixture {
    manager: Arc<SyncManager>,
    api: Arc<MockChatApi>,
    repo: Arc<InMemoryRepositoryFacade>,
    registry: Arc<StateRegistry>,
    global: Arc<GlobalState>,
    dispatcher: Arc<EventDispatcher>,
}

fn fixture(api: MockChatApi) -> Fixture {
    let api = Arc::new(api);
    let repo = InMemoryRepositoryFacade::new();
    let registry = Arc::new(StateRegistry::new());
    let global = Arc::new(GlobalState::new());
    let dispatcher = EventDispatcher::new();
    let manager = SyncManager::new(
        Arc::clone(&api) as Arc<dyn ChatApi>,
        Arc::clone(&repo) as Arc<dyn RepositoryFacade>,
        Arc::clone(&registry),
        Arc::clone(&global),
        Arc::clone(&dispatcher),
        CallRetryService::default(),
        Duration::from_secs(60 * 60),
    );
    Fixture {
        manager,
        api,
        repo,
        registry,
        global,
        dispatcher,
    }
}

async fn insert_dirty_message(repo: &InMemoryRepositoryFacade, id: &str, seconds: i64) {
    let mut dirty = message(id, "messaging:1", "u1", seconds, seconds);
    dirty.sync_status = SyncStatus::SyncNeeded;
    repo.insert_message(&dirty).await.expect("insert");
}

#[tokio::test]
async fn one_permanent_failure_does_not_abort_the_batch() {
    let api = MockChatApi {
        permanent_failures: HashSet::from([MessageId::from("m2")]),
        ..MockChatApi::default()
    };
    let f = fixture(api);
    insert_dirty_message(&f.repo, "m1", 10).await;
    insert_dirty_message(&f.repo, "m2", 11).await;
    insert_dirty_message(&f.repo, "m3", 12).await;

    let report = f.manager.sync().await;

    assert_eq!(report.synced_messages.len(), 2);
    assert_eq!(report.failures.len(), 1);
    assert!(matches!(
        report.failures[0].entity,
        SyncEntity::Message(ref id) if id.as_str() == "m2"
    ));

    let stored = |id: &str| {
        let repo = Arc::clone(&f.repo);
        let id = MessageId::from(id);
        async move {
            repo.select_message(&id)
                .await
                .expect("select")
                .expect("present")
                .sync_status
        }
    };
    assert_eq!(stored("m1").await, SyncStatus::Completed);
    assert_eq!(stored("m2").await, SyncStatus::FailedPermanently);
    assert_eq!(stored("m3").await, SyncStatus::Completed);

    // Permanent failure also reaches UI consumers through global state.
    assert!(f.global.snapshot().last_error.is_some());
}

#[tokio::test]
async fn transient_failures_stay_sync_needed_for_the_next_pass() {
    let api = MockChatApi {
        transient_failures: HashSet::from([MessageId::from("m1")]),
        ..MockChatApi::default()
    };
    let f = fixture(api);
    insert_dirty_message(&f.repo, "m1", 10).await;

    let report = f.manager.sync().await;

    assert!(report.synced_messages.is_empty());
    assert_eq!(report.failures.len(), 1);
    let stored = f
        .repo
        .select_message(&"m1".into())
        .await
        .expect("select")
        .expect("present");
    assert_eq!(stored.sync_status, SyncStatus::SyncNeeded);
}

#[tokio::test]
async fn dirty_pushes_precede_channel_refresh_pulls() {
    let api = MockChatApi::default().with_channel_page(
        "messaging:1",
        ChannelPage {
            channel: shared::models::ChannelData {
                cid: cid("messaging:1"),
                ..shared::models::ChannelData::default()
            },
            ..ChannelPage::default()
        },
    );
    let f = fixture(api);
    insert_dirty_message(&f.repo, "m1", 10).await;
    f.repo
        .set_channel_recovery_needed(&cid("messaging:1"), true)
        .await
        .expect("flag");

    f.manager.sync().await;

    let ops = f.api.ops();
    let send_pos = ops
        .iter()
        .position(|op| op.starts_with("send_message"))
        .expect("send recorded");
    let query_pos = ops
        .iter()
        .position(|op| op.starts_with("query_channel"))
        .expect("query recorded");
    assert!(
        send_pos < query_pos,
        "push must precede pull, got {ops:?}"
    );
}

#[tokio::test]
async fn channel_refresh_merges_without_regressing_newer_local_state() {
    let stale_server_copy = message("m1", "messaging:1", "u1", 10, 50);
    let api = MockChatApi::default().with_channel_page(
        "messaging:1",
        ChannelPage {
            channel: shared::models::ChannelData {
                cid: cid("messaging:1"),
                ..shared::models::ChannelData::default()
            },
            messages: vec![stale_server_copy],
            members: vec![Member {
                user_id: "u2".into(),
                ..Member::default()
            }],
            reads: vec![Read {
                user_id: "u2".into(),
                last_read: at(40),
                unread_messages: 0,
            }],
        },
    );
    let f = fixture(api);

    let channel = f.registry.channel(&cid("messaging:1"));
    let newer_local = message("m1", "messaging:1", "u1", 10, 90);
    channel.upsert_message(&newer_local);
    channel.set_recovery_needed(true);

    let report = f.manager.sync().await;

    assert_eq!(report.refreshed_channels, vec![cid("messaging:1")]);
    let cached = channel.message(&"m1".into()).expect("cached");
    assert_eq!(cached.updated_at, at(90), "stale refresh must not regress");
    assert!(!channel.recovery_needed());
    let snapshot = channel.snapshot();
    assert!(snapshot.members.contains_key(&"u2".into()));
    assert!(snapshot.reads.contains_key(&"u2".into()));
}

#[tokio::test]
async fn replays_missed_events_through_the_dispatcher_in_order() {
    let api = MockChatApi::default();
    *api.replay_events.lock().expect("lock") = vec![
        new_message_event("messaging:1", message("m1", "messaging:1", "u2", 10, 10)),
        new_message_event("messaging:1", message("m2", "messaging:1", "u2", 11, 11)),
    ];
    let f = fixture(api);
    f.registry.channel(&cid("messaging:1"));
    f.repo.set_last_synced_at(at(5)).await.expect("marker");

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let _sub = f
        .dispatcher
        .subscribe(EventFilter::type_tag("message.new"), move |event| {
            if let shared::events::EventKind::NewMessage { message, .. } = &event.kind {
                sink.lock().expect("lock").push(message.id.as_str().to_owned());
            }
        });

    let report = f.manager.sync().await;

    assert_eq!(report.replayed_events, 2);
    assert_eq!(*seen.lock().expect("lock"), vec!["m1", "m2"]);
}

#[tokio::test]
async fn no_replay_without_a_last_sync_marker() {
    let f = fixture(MockChatApi::default());
    f.registry.channel(&cid("messaging:1"));

    f.manager.sync().await;
    assert_eq!(f.api.sync_event_calls.load(Ordering::SeqCst), 0);

    // The pass itself records a marker, so the next one replays.
    f.manager.sync().await;
    assert_eq!(f.api.sync_event_calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn health_check_after_offline_gap_triggers_a_sync() {
    let f = fixture(MockChatApi::default());
    insert_dirty_message(&f.repo, "m1", 10).await;

    let connection = Arc::new(ObservableValue::new(ConnectionState::Disconnected));
    f.manager.start(Arc::clone(&connection));

    connection.set(ConnectionState::Connected {
        connection_id: "c1".into(),
    });
    connection.set(ConnectionState::Disconnected);
    f.dispatcher.dispatch(&crate::testutil::health_event("c1"));

    let api = Arc::clone(&f.api);
    assert!(
        wait_until(move || {
            api.ops()
                .iter()
                .any(|op| op.starts_with("send_message:m1"))
        })
        .await
    );

    // A second health check without an offline gap stays quiet.
    let ops_before = f.api.ops().len();
    f.dispatcher.dispatch(&crate::testutil::health_event("c1"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(f.api.ops().len(), ops_before);

    f.manager.stop();
}

#[tokio::test]
async fn disconnection_marks_loaded_channels_for_recovery() {
    let f = fixture(MockChatApi::default());
    let channel = f.registry.channel(&cid("messaging:1"));
    let connection = Arc::new(ObservableValue::new(ConnectionState::Connected {
        connection_id: "c1".into(),
    }));
    f.manager.start(Arc::clone(&connection));

    connection.set(ConnectionState::Disconnected);
    assert!(channel.recovery_needed());

    f.manager.stop();
}

#[tokio::test]
async fn sweeps_expired_tombstones_during_the_pass() {
    let f = fixture(MockChatApi::default());
    let channel = f.registry.channel(&cid("messaging:1"));
    let mut ancient = message("m-old", "messaging:1", "u1", 0, 0);
    ancient.deleted_at = Some(DateTime::UNIX_EPOCH);
    channel.upsert_message(&ancient);

    f.manager.sync().await;

    assert!(channel.message(&"m-old".into()).is_none());
}
