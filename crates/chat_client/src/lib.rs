use std::sync::{Arc, Mutex};

use chrono::Utc;
use shared::domain::{Cid, MessageId};
use shared::error::ChatError;
use shared::events::{ChatEvent, EventKind};
use shared::models::{Message, PushMessage, Reaction, SyncStatus, User};
use tracing::{info, warn};

pub mod api;
pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod handler;
pub mod repository;
pub mod retry;
pub mod socket;
pub mod state;
pub mod sync;

#[cfg(test)]
pub(crate) mod testutil;

use api::{ChatApi, ChannelPage, HttpChatApi, QueryChannelsRequest};
use config::ChatConfig;
use connection::{ConnectionController, ConnectionState};
use dispatcher::{EventDispatcher, EventFilter, Subscription};
use handler::{ChannelFilter, ChatEventHandler, DefaultChatEventHandler, EventRouter, FollowUp};
use repository::{InMemoryRepositoryFacade, RepositoryFacade};
use retry::{CallRetryService, NoRetryPolicy, RetryPolicy};
use socket::{SocketTransport, TungsteniteTransport};
use state::{ChannelState, ClientState, GlobalState, QueryChannelsState, StateRegistry, ThreadState};
use sync::{SyncManager, SyncReport};

/// Chat session object: explicitly constructed per logged-in user, torn down
/// on logout. Owns the connection controller, the dispatcher, every state
/// container and the sync manager; no global singletons.
pub struct ChatClient {
    user: User,
    api: Arc<dyn ChatApi>,
    repo: Arc<dyn RepositoryFacade>,
    dispatcher: Arc<EventDispatcher>,
    registry: Arc<StateRegistry>,
    client_state: Arc<ClientState>,
    global_state: Arc<GlobalState>,
    connection: Arc<ConnectionController>,
    sync_manager: Arc<SyncManager>,
    retry: CallRetryService,
    router_subscription: Mutex<Option<Subscription>>,
}

impl ChatClient {
    /// Default wiring: tungstenite socket, reqwest api with api-key
    /// interceptor, in-memory repository, no-op retry policy.
    pub fn new(config: ChatConfig, user: User) -> Arc<Self> {
        let api: Arc<dyn ChatApi> = Arc::new(HttpChatApi::new(
            config.api_url.clone(),
            vec![Arc::new(api::ApiKeyInterceptor {
                api_key: config.api_key.clone(),
            })],
        ));
        let handler: Arc<dyn ChatEventHandler> =
            Arc::new(DefaultChatEventHandler::new(user.id.clone()));
        Self::with_dependencies(
            config,
            user,
            Arc::new(TungsteniteTransport),
            api,
            InMemoryRepositoryFacade::new(),
            Arc::new(NoRetryPolicy),
            handler,
        )
    }

    pub fn with_dependencies(
        config: ChatConfig,
        user: User,
        transport: Arc<dyn SocketTransport>,
        api: Arc<dyn ChatApi>,
        repo: Arc<dyn RepositoryFacade>,
        retry_policy: Arc<dyn RetryPolicy>,
        handler: Arc<dyn ChatEventHandler>,
    ) -> Arc<Self> {
        let dispatcher = EventDispatcher::new();
        let connection =
            ConnectionController::new(transport, config.clone(), Arc::clone(&dispatcher));
        let client_state = Arc::new(ClientState::new(connection.state()));
        client_state.set_user(user.clone());
        let global_state = Arc::new(GlobalState::new());
        global_state.set_user(user.clone());
        let registry = Arc::new(StateRegistry::new());
        let retry = CallRetryService::new(retry_policy);
        let sync_manager = SyncManager::new(
            Arc::clone(&api),
            Arc::clone(&repo),
            Arc::clone(&registry),
            Arc::clone(&global_state),
            Arc::clone(&dispatcher),
            retry.clone(),
            config.tombstone_retention,
        );
        let router = Arc::new(EventRouter::new(
            Arc::clone(&registry),
            Arc::clone(&global_state),
            Arc::clone(&client_state),
            handler,
        ));

        let client = Arc::new(Self {
            user,
            api,
            repo,
            dispatcher,
            registry,
            client_state,
            global_state,
            connection,
            sync_manager,
            retry,
            router_subscription: Mutex::new(None),
        });
        client.wire(router);
        client
    }

    fn wire(self: &Arc<Self>, router: Arc<EventRouter>) {
        let weak = Arc::downgrade(self);
        let subscription = self.dispatcher.subscribe(EventFilter::all(), move |event| {
            let follow_ups = router.route(event);
            if follow_ups.is_empty() {
                return;
            }
            let Some(client) = weak.upgrade() else {
                return;
            };
            for follow_up in follow_ups {
                match follow_up {
                    FollowUp::WatchChannel(cid) => {
                        let client = Arc::clone(&client);
                        tokio::spawn(async move {
                            if let Err(error) = client.watch_channel(&cid).await {
                                warn!(%cid, %error, "client: deferred channel watch failed");
                            }
                        });
                    }
                }
            }
        });
        *lock_sub(&self.router_subscription) = Some(subscription);
        self.sync_manager.start(self.connection.state());
    }

    pub fn user(&self) -> &User {
        &self.user
    }

    pub fn client_state(&self) -> &Arc<ClientState> {
        &self.client_state
    }

    pub fn global_state(&self) -> &Arc<GlobalState> {
        &self.global_state
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.current_state()
    }

    /// Open the realtime connection. Failures surface as state transitions
    /// and `connection.error` events, never as a return value here.
    pub fn connect(&self) {
        info!(user_id = %self.user.id, "client: connect requested");
        self.connection.connect(&self.user);
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Tear the session down: close the socket, stop sync triggers, clear
    /// all per-session state and the local cache.
    pub async fn logout(&self) {
        self.connection.disconnect().await;
        self.sync_manager.stop();
        if let Some(subscription) = lock_sub(&self.router_subscription).take() {
            subscription.unsubscribe();
        }
        self.global_state.clear();
        self.client_state.clear_user();
        self.registry.clear();
        if let Err(error) = self.repo.clear().await {
            warn!(%error, "client: failed to clear local cache on logout");
        }
    }

    pub fn subscribe(
        &self,
        filter: EventFilter,
        handler: impl Fn(&ChatEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.dispatcher.subscribe(filter, handler)
    }

    /// Channel state container, created lazily.
    pub fn channel_state(&self, cid: &Cid) -> Arc<ChannelState> {
        self.registry.channel(cid)
    }

    pub fn thread_state(&self, parent_id: &MessageId) -> Arc<ThreadState> {
        self.registry.thread(parent_id)
    }

    /// Fetch the server-authoritative channel snapshot and merge it into the
    /// local container.
    pub async fn watch_channel(&self, cid: &Cid) -> Result<Arc<ChannelState>, ChatError> {
        let page = self.retry.run(|| self.api.query_channel(cid)).await?;
        Ok(self.merge_channel_page(cid, &page))
    }

    fn merge_channel_page(&self, cid: &Cid, page: &ChannelPage) -> Arc<ChannelState> {
        let channel = self.registry.channel(cid);
        channel.set_channel_data(&page.channel);
        channel.upsert_messages(&page.messages);
        for member in &page.members {
            channel.upsert_member(member);
        }
        channel.upsert_reads(&page.reads);
        channel
    }

    /// Optimistic send: the message lands in local state as `SyncNeeded`
    /// before the network round-trip, and is reconciled with the server
    /// acknowledgement or marked `FailedPermanently`.
    pub async fn send_message(&self, cid: &Cid, text: &str) -> Result<Message, ChatError> {
        let now = Utc::now();
        let message = Message {
            id: MessageId::new(uuid::Uuid::new_v4().to_string()),
            cid: cid.clone(),
            user_id: self.user.id.clone(),
            text: text.to_string(),
            created_at: now,
            updated_at: now,
            sync_status: SyncStatus::SyncNeeded,
            ..Message::default()
        };
        self.repo.insert_message(&message).await?;
        self.registry.channel(cid).upsert_message(&message);

        self.reconcile_message_submission(message).await
    }

    /// Soft-delete: tombstone locally first, then tell the server.
    pub async fn delete_message(&self, id: &MessageId) -> Result<Message, ChatError> {
        let Some(existing) = self.repo.select_message(id).await? else {
            return Err(ChatError::Validation(format!("unknown message '{id}'")));
        };
        let now = Utc::now();
        let mut tombstone = existing;
        tombstone.deleted_at = Some(now);
        tombstone.updated_at = now;
        tombstone.sync_status = SyncStatus::SyncNeeded;
        self.repo.insert_message(&tombstone).await?;
        if let Some(channel) = self.registry.channel_if_loaded(&tombstone.cid) {
            channel.upsert_message(&tombstone);
        }

        self.reconcile_message_submission(tombstone).await
    }

    async fn reconcile_message_submission(&self, message: Message) -> Result<Message, ChatError> {
        let outcome = if message.deleted_at.is_some() {
            self.retry
                .run(|| self.api.delete_message(&message.id))
                .await
        } else {
            self.retry.run(|| self.api.send_message(&message)).await
        };
        match outcome {
            Ok(mut acked) => {
                acked.sync_status = SyncStatus::Completed;
                self.repo.insert_message(&acked).await?;
                if let Some(channel) = self.registry.channel_if_loaded(&acked.cid) {
                    channel.upsert_message(&acked);
                }
                Ok(acked)
            }
            Err(error) if error.is_permanent() => {
                let mut failed = message;
                failed.sync_status = SyncStatus::FailedPermanently;
                let _ = self.repo.insert_message(&failed).await;
                if let Some(channel) = self.registry.channel_if_loaded(&failed.cid) {
                    channel.upsert_message(&failed);
                }
                self.global_state
                    .record_error(format!("message {} failed to send", failed.id), error.clone());
                Err(error)
            }
            // Transient failure: the message stays SyncNeeded and the sync
            // manager resubmits it once connectivity recovers.
            Err(error) => Err(error),
        }
    }

    pub async fn send_reaction(
        &self,
        cid: &Cid,
        message_id: &MessageId,
        kind: &str,
    ) -> Result<Reaction, ChatError> {
        let now = Utc::now();
        let reaction = Reaction {
            id: shared::domain::ReactionId::new(uuid::Uuid::new_v4().to_string()),
            message_id: message_id.clone(),
            cid: cid.clone(),
            user_id: self.user.id.clone(),
            kind: kind.to_string(),
            score: 1,
            created_at: now,
            updated_at: now,
            sync_status: SyncStatus::SyncNeeded,
            ..Reaction::default()
        };
        self.repo.insert_reaction(&reaction).await?;

        match self.retry.run(|| self.api.send_reaction(&reaction)).await {
            Ok(mut acked) => {
                acked.sync_status = SyncStatus::Completed;
                self.repo.insert_reaction(&acked).await?;
                Ok(acked)
            }
            Err(error) if error.is_permanent() => {
                let mut failed = reaction;
                failed.sync_status = SyncStatus::FailedPermanently;
                let _ = self.repo.insert_reaction(&failed).await;
                self.global_state
                    .record_error(format!("reaction {} failed to send", failed.id), error.clone());
                Err(error)
            }
            Err(error) => Err(error),
        }
    }

    pub async fn mark_read(&self, cid: &Cid) -> Result<(), ChatError> {
        self.retry
            .run(|| self.api.mark_read(cid, &self.user.id))
            .await?;
        if let Some(channel) = self.registry.channel_if_loaded(cid) {
            channel.upsert_read(&shared::models::Read {
                user_id: self.user.id.clone(),
                last_read: Utc::now(),
                unread_messages: 0,
            });
        }
        self.global_state.set_channel_unread_count(cid, 0);
        Ok(())
    }

    /// Run a channel-list query; the result set stays live through the
    /// configured event-handler policy.
    pub async fn query_channels(
        &self,
        key: &str,
        filter: Arc<dyn ChannelFilter>,
        request: &QueryChannelsRequest,
    ) -> Result<Arc<QueryChannelsState>, ChatError> {
        let state = self.registry.query(key, filter);
        let response = self.retry.run(|| self.api.query_channels(request)).await?;
        let mut cids = Vec::with_capacity(response.channels.len());
        for page in &response.channels {
            let cid = page.channel.cid.clone();
            self.merge_channel_page(&cid, page);
            cids.push(cid);
        }
        state.set_channels(cids, response.next_cursor.clone());
        Ok(state)
    }

    /// Entry point for push-provider plumbing: the payload is converted into
    /// a synthetic event and delivered through the regular dispatcher path.
    pub fn on_push_message(&self, push: PushMessage) {
        let now = Utc::now();
        let event = ChatEvent::new(
            now,
            EventKind::PushMessage {
                channel_type: push.channel_type,
                channel_id: push.channel_id,
                message_id: push.message_id,
            },
        )
        .received(now);
        self.dispatcher.dispatch(&event);
    }

    /// Manual catch-up trigger; the same pass runs automatically on
    /// reconnection.
    pub async fn sync(&self) -> SyncReport {
        self.sync_manager.sync().await
    }
}

fn lock_sub(mutex: &Mutex<Option<Subscription>>) -> std::sync::MutexGuard<'_, Option<Subscription>> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
