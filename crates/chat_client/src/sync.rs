use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use shared::domain::{Cid, MessageId, ReactionId};
use shared::error::ChatError;
use shared::models::{Message, Reaction, SyncStatus};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::api::ChatApi;
use crate::connection::ConnectionState;
use crate::dispatcher::{EventDispatcher, EventFilter, Subscription};
use crate::repository::RepositoryFacade;
use crate::retry::CallRetryService;
use crate::state::{GlobalState, ObservableValue, StateRegistry};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEntity {
    Message(MessageId),
    Reaction(ReactionId),
    Channel(Cid),
    EventReplay,
}

#[derive(Debug, Clone)]
pub struct SyncFailure {
    pub entity: SyncEntity,
    pub error: ChatError,
}

/// Aggregate outcome of one sync pass. A single entity's failure never
/// aborts the batch; everything dirty is attempted and accounted for here.
#[derive(Debug, Default)]
pub struct SyncReport {
    pub synced_messages: Vec<MessageId>,
    pub synced_reactions: Vec<ReactionId>,
    pub refreshed_channels: Vec<Cid>,
    pub replayed_events: usize,
    pub failures: Vec<SyncFailure>,
}

impl SyncReport {
    pub fn successes(&self) -> usize {
        self.synced_messages.len() + self.synced_reactions.len() + self.refreshed_channels.len()
    }
}

/// Catch-up orchestration on (re)connection: push locally dirty entities,
/// pull server-authoritative channel refreshes, replay missed events.
///
/// Triggered by a fresh connection acknowledgement, or by a health check
/// arriving after an offline gap.
pub struct SyncManager {
    api: Arc<dyn ChatApi>,
    repo: Arc<dyn RepositoryFacade>,
    registry: Arc<StateRegistry>,
    global: Arc<GlobalState>,
    dispatcher: Arc<EventDispatcher>,
    retry: CallRetryService,
    tombstone_retention: Duration,
    sync_lock: AsyncMutex<()>,
    was_offline: AtomicBool,
    subscriptions: Mutex<Vec<Subscription>>,
    connection_watch: Mutex<Option<(Arc<ObservableValue<ConnectionState>>, u64)>>,
}

impl SyncManager {
    pub fn new(
        api: Arc<dyn ChatApi>,
        repo: Arc<dyn RepositoryFacade>,
        registry: Arc<StateRegistry>,
        global: Arc<GlobalState>,
        dispatcher: Arc<EventDispatcher>,
        retry: CallRetryService,
        tombstone_retention: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            api,
            repo,
            registry,
            global,
            dispatcher,
            retry,
            tombstone_retention,
            sync_lock: AsyncMutex::new(()),
            was_offline: AtomicBool::new(true),
            subscriptions: Mutex::new(Vec::new()),
            connection_watch: Mutex::new(None),
        })
    }

    /// Wire the trigger paths: connection acks and health checks from the
    /// dispatcher, plus offline detection from the connection state.
    pub fn start(self: &Arc<Self>, connection: Arc<ObservableValue<ConnectionState>>) {
        let manager = Arc::clone(self);
        let registry = Arc::clone(&self.registry);
        let watch_id = connection.watch(move |state| {
            if !state.is_connected() {
                manager.was_offline.store(true, Ordering::SeqCst);
                // Everything we were watching needs a server refresh once
                // connectivity returns.
                for cid in registry.loaded_channel_cids() {
                    if let Some(channel) = registry.channel_if_loaded(&cid) {
                        channel.set_recovery_needed(true);
                    }
                }
            }
        });
        *lock_watch(&self.connection_watch) = Some((connection, watch_id));

        let manager = Arc::clone(self);
        let on_connected = self.dispatcher.subscribe(
            EventFilter::type_tag("connection.ok"),
            move |_| {
                manager.was_offline.store(false, Ordering::SeqCst);
                let manager = Arc::clone(&manager);
                tokio::spawn(async move {
                    manager.sync().await;
                });
            },
        );

        let manager = Arc::clone(self);
        let on_health = self
            .dispatcher
            .subscribe(EventFilter::type_tag("health.check"), move |_| {
                // A heartbeat after an offline gap means the drop was missed;
                // recover as if freshly connected.
                if manager.was_offline.swap(false, Ordering::SeqCst) {
                    let manager = Arc::clone(&manager);
                    tokio::spawn(async move {
                        manager.sync().await;
                    });
                }
            });

        let mut subscriptions = lock_subs(&self.subscriptions);
        subscriptions.push(on_connected);
        subscriptions.push(on_health);
    }

    pub fn stop(&self) {
        for subscription in lock_subs(&self.subscriptions).drain(..) {
            subscription.unsubscribe();
        }
        if let Some((connection, watch_id)) = lock_watch(&self.connection_watch).take() {
            connection.unwatch(watch_id);
        }
    }

    /// One full catch-up pass. Runs are serialized; a second trigger waits
    /// for the current pass to finish.
    pub async fn sync(self: &Arc<Self>) -> SyncReport {
        let _guard = self.sync_lock.lock().await;
        debug!("sync: starting pass");
        let mut report = SyncReport::default();

        // Local-dirty pushes strictly precede the server-authoritative pull
        // so a refresh cannot clobber an optimistic edit it predates.
        self.push_dirty_messages(&mut report).await;
        self.push_dirty_reactions(&mut report).await;
        self.refresh_recovery_channels(&mut report).await;
        self.replay_missed_events(&mut report).await;
        self.sweep_tombstones();

        if let Err(error) = self.repo.set_last_synced_at(Utc::now()).await {
            warn!(%error, "sync: failed to persist last sync marker");
        }
        info!(
            synced_messages = report.synced_messages.len(),
            synced_reactions = report.synced_reactions.len(),
            refreshed_channels = report.refreshed_channels.len(),
            replayed_events = report.replayed_events,
            failures = report.failures.len(),
            "sync: pass completed"
        );
        report
    }

    async fn push_dirty_messages(&self, report: &mut SyncReport) {
        let mut ids: Vec<MessageId> = Vec::new();
        for status in [SyncStatus::SyncNeeded, SyncStatus::AwaitingAttachments] {
            match self.repo.select_message_ids_by_sync_status(status).await {
                Ok(batch) => ids.extend(batch),
                Err(error) => warn!(%error, ?status, "sync: dirty message query failed"),
            }
        }

        for id in ids {
            let message = match self.repo.select_message(&id).await {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(error) => {
                    report.failures.push(SyncFailure {
                        entity: SyncEntity::Message(id),
                        error,
                    });
                    continue;
                }
            };

            let outcome = self.resubmit_message(&message).await;
            match outcome {
                Ok(acked) => {
                    self.store_message(&acked).await;
                    report.synced_messages.push(id);
                }
                Err(error) if error.is_permanent() => {
                    let mut failed = message;
                    failed.sync_status = SyncStatus::FailedPermanently;
                    self.store_message(&failed).await;
                    self.global
                        .record_error(format!("message {id} failed to sync"), error.clone());
                    report.failures.push(SyncFailure {
                        entity: SyncEntity::Message(id),
                        error,
                    });
                }
                Err(error) => {
                    // Still SyncNeeded; the next recovery picks it up.
                    report.failures.push(SyncFailure {
                        entity: SyncEntity::Message(id),
                        error,
                    });
                }
            }
        }
    }

    /// Replay the original mutation: a tombstoned dirty message is a pending
    /// delete, anything else is a pending send/edit (the backend upserts by
    /// id).
    async fn resubmit_message(&self, message: &Message) -> Result<Message, ChatError> {
        if message.deleted_at.is_some() {
            self.retry
                .run(|| self.api.delete_message(&message.id))
                .await
        } else {
            self.retry.run(|| self.api.send_message(message)).await
        }
    }

    async fn store_message(&self, message: &Message) {
        let mut stored = message.clone();
        if stored.sync_status == SyncStatus::SyncNeeded
            || stored.sync_status == SyncStatus::AwaitingAttachments
        {
            stored.sync_status = SyncStatus::Completed;
        }
        if let Err(error) = self.repo.insert_message(&stored).await {
            warn!(message_id = %stored.id, %error, "sync: failed to persist message");
        }
        if let Some(channel) = self.registry.channel_if_loaded(&stored.cid) {
            channel.upsert_message(&stored);
        }
    }

    async fn push_dirty_reactions(&self, report: &mut SyncReport) {
        let ids = match self
            .repo
            .select_reaction_ids_by_sync_status(SyncStatus::SyncNeeded)
            .await
        {
            Ok(ids) => ids,
            Err(error) => {
                warn!(%error, "sync: dirty reaction query failed");
                return;
            }
        };

        for id in ids {
            let reaction = match self.repo.select_reaction(&id).await {
                Ok(Some(reaction)) => reaction,
                Ok(None) => continue,
                Err(error) => {
                    report.failures.push(SyncFailure {
                        entity: SyncEntity::Reaction(id),
                        error,
                    });
                    continue;
                }
            };

            let outcome = self.resubmit_reaction(&reaction).await;
            match outcome {
                Ok(acked) => {
                    if let Err(error) = self.repo.insert_reaction(&acked).await {
                        warn!(reaction_id = %acked.id, %error, "sync: failed to persist reaction");
                    }
                    report.synced_reactions.push(id);
                }
                Err(error) if error.is_permanent() => {
                    let mut failed = reaction;
                    failed.sync_status = SyncStatus::FailedPermanently;
                    if let Err(store_error) = self.repo.insert_reaction(&failed).await {
                        warn!(%store_error, "sync: failed to persist reaction failure");
                    }
                    self.global
                        .record_error(format!("reaction {id} failed to sync"), error.clone());
                    report.failures.push(SyncFailure {
                        entity: SyncEntity::Reaction(id),
                        error,
                    });
                }
                Err(error) => {
                    report.failures.push(SyncFailure {
                        entity: SyncEntity::Reaction(id),
                        error,
                    });
                }
            }
        }
    }

    async fn resubmit_reaction(&self, reaction: &Reaction) -> Result<Reaction, ChatError> {
        if reaction.deleted_at.is_some() {
            self.retry
                .run(|| {
                    self.api
                        .delete_reaction(&reaction.message_id, &reaction.kind, &reaction.user_id)
                })
                .await?;
            let mut acked = reaction.clone();
            acked.sync_status = SyncStatus::Completed;
            Ok(acked)
        } else {
            let mut acked = self.retry.run(|| self.api.send_reaction(reaction)).await?;
            acked.sync_status = SyncStatus::Completed;
            Ok(acked)
        }
    }

    async fn refresh_recovery_channels(&self, report: &mut SyncReport) {
        let mut cids = match self.repo.select_channel_cids_needing_sync().await {
            Ok(cids) => cids,
            Err(error) => {
                warn!(%error, "sync: recovery channel query failed");
                Vec::new()
            }
        };
        for cid in self.registry.loaded_channel_cids() {
            let flagged = self
                .registry
                .channel_if_loaded(&cid)
                .is_some_and(|c| c.recovery_needed());
            if flagged && !cids.contains(&cid) {
                cids.push(cid);
            }
        }

        for cid in cids {
            match self.retry.run(|| self.api.query_channel(&cid)).await {
                Ok(page) => {
                    // Same upsert/tombstone rules as live events: the refresh
                    // cannot regress newer local optimistic state.
                    let channel = self.registry.channel(&cid);
                    channel.set_channel_data(&page.channel);
                    channel.upsert_messages(&page.messages);
                    for member in &page.members {
                        channel.upsert_member(member);
                    }
                    channel.upsert_reads(&page.reads);
                    channel.set_recovery_needed(false);
                    if let Err(error) = self.repo.set_channel_recovery_needed(&cid, false).await {
                        warn!(%cid, %error, "sync: failed to clear recovery flag");
                    }
                    report.refreshed_channels.push(cid);
                }
                Err(error) => {
                    report.failures.push(SyncFailure {
                        entity: SyncEntity::Channel(cid),
                        error,
                    });
                }
            }
        }
    }

    async fn replay_missed_events(&self, report: &mut SyncReport) {
        let cids = self.registry.loaded_channel_cids();
        if cids.is_empty() {
            return;
        }
        let since = match self.repo.select_last_synced_at().await {
            Ok(Some(since)) => since,
            Ok(None) => return,
            Err(error) => {
                warn!(%error, "sync: last sync marker unavailable");
                return;
            }
        };

        match self.retry.run(|| self.api.sync_events(&cids, since)).await {
            Ok(events) => {
                report.replayed_events = events.len();
                // Server order, one at a time, through the same delivery
                // path as live events: observers see the incremental changes
                // they would have seen online.
                for event in &events {
                    self.dispatcher.dispatch(event);
                }
            }
            Err(error) => {
                report.failures.push(SyncFailure {
                    entity: SyncEntity::EventReplay,
                    error,
                });
            }
        }
    }

    fn sweep_tombstones(&self) {
        let now = Utc::now();
        for cid in self.registry.loaded_channel_cids() {
            if let Some(channel) = self.registry.channel_if_loaded(&cid) {
                channel.sweep_tombstones(now, self.tombstone_retention);
            }
        }
    }
}

fn lock_subs(mutex: &Mutex<Vec<Subscription>>) -> std::sync::MutexGuard<'_, Vec<Subscription>> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[allow(clippy::type_complexity)]
fn lock_watch(
    mutex: &Mutex<Option<(Arc<ObservableValue<ConnectionState>>, u64)>>,
) -> std::sync::MutexGuard<'_, Option<(Arc<ObservableValue<ConnectionState>>, u64)>> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
#[path = "tests/sync_tests.rs"]
mod tests;
