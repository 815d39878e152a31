use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::domain::{Cid, MessageId, ReactionId};
use shared::error::ChatError;
use shared::models::{Message, Reaction, SyncStatus};
use tokio::sync::Mutex;

/// Persistence read/write contract consumed by the sync manager and the
/// state containers. On-disk wiring is an external concern; the SDK ships an
/// in-memory implementation.
#[async_trait]
pub trait RepositoryFacade: Send + Sync {
    async fn select_channel_cids_needing_sync(&self) -> Result<Vec<Cid>, ChatError>;
    async fn select_message_ids_by_sync_status(
        &self,
        status: SyncStatus,
    ) -> Result<Vec<MessageId>, ChatError>;
    async fn select_reaction_ids_by_sync_status(
        &self,
        status: SyncStatus,
    ) -> Result<Vec<ReactionId>, ChatError>;
    async fn select_message(&self, id: &MessageId) -> Result<Option<Message>, ChatError>;
    async fn select_reaction(&self, id: &ReactionId) -> Result<Option<Reaction>, ChatError>;
    async fn insert_message(&self, message: &Message) -> Result<(), ChatError>;
    async fn insert_reaction(&self, reaction: &Reaction) -> Result<(), ChatError>;
    async fn delete_message(&self, id: &MessageId) -> Result<(), ChatError>;
    async fn set_channel_recovery_needed(&self, cid: &Cid, needed: bool) -> Result<(), ChatError>;
    async fn select_last_synced_at(&self) -> Result<Option<DateTime<Utc>>, ChatError>;
    async fn set_last_synced_at(&self, at: DateTime<Utc>) -> Result<(), ChatError>;
    async fn clear(&self) -> Result<(), ChatError>;
}

#[derive(Default)]
struct RepositoryInner {
    messages: HashMap<MessageId, Message>,
    reactions: HashMap<ReactionId, Reaction>,
    recovery_channels: HashSet<Cid>,
    last_synced_at: Option<DateTime<Utc>>,
}

/// Default repository: plain maps behind a mutex, ordered deterministically
/// on read so sync batches are stable.
#[derive(Default)]
pub struct InMemoryRepositoryFacade {
    inner: Mutex<RepositoryInner>,
}

impl InMemoryRepositoryFacade {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl RepositoryFacade for InMemoryRepositoryFacade {
    async fn select_channel_cids_needing_sync(&self) -> Result<Vec<Cid>, ChatError> {
        let inner = self.inner.lock().await;
        let mut cids: Vec<Cid> = inner.recovery_channels.iter().cloned().collect();
        cids.sort();
        Ok(cids)
    }

    async fn select_message_ids_by_sync_status(
        &self,
        status: SyncStatus,
    ) -> Result<Vec<MessageId>, ChatError> {
        let inner = self.inner.lock().await;
        let mut ids: Vec<MessageId> = inner
            .messages
            .values()
            .filter(|m| m.sync_status == status)
            .map(|m| m.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn select_reaction_ids_by_sync_status(
        &self,
        status: SyncStatus,
    ) -> Result<Vec<ReactionId>, ChatError> {
        let inner = self.inner.lock().await;
        let mut ids: Vec<ReactionId> = inner
            .reactions
            .values()
            .filter(|r| r.sync_status == status)
            .map(|r| r.id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn select_message(&self, id: &MessageId) -> Result<Option<Message>, ChatError> {
        Ok(self.inner.lock().await.messages.get(id).cloned())
    }

    async fn select_reaction(&self, id: &ReactionId) -> Result<Option<Reaction>, ChatError> {
        Ok(self.inner.lock().await.reactions.get(id).cloned())
    }

    async fn insert_message(&self, message: &Message) -> Result<(), ChatError> {
        self.inner
            .lock()
            .await
            .messages
            .insert(message.id.clone(), message.clone());
        Ok(())
    }

    async fn insert_reaction(&self, reaction: &Reaction) -> Result<(), ChatError> {
        self.inner
            .lock()
            .await
            .reactions
            .insert(reaction.id.clone(), reaction.clone());
        Ok(())
    }

    async fn delete_message(&self, id: &MessageId) -> Result<(), ChatError> {
        self.inner.lock().await.messages.remove(id);
        Ok(())
    }

    async fn set_channel_recovery_needed(&self, cid: &Cid, needed: bool) -> Result<(), ChatError> {
        let mut inner = self.inner.lock().await;
        if needed {
            inner.recovery_channels.insert(cid.clone());
        } else {
            inner.recovery_channels.remove(cid);
        }
        Ok(())
    }

    async fn select_last_synced_at(&self) -> Result<Option<DateTime<Utc>>, ChatError> {
        Ok(self.inner.lock().await.last_synced_at)
    }

    async fn set_last_synced_at(&self, at: DateTime<Utc>) -> Result<(), ChatError> {
        self.inner.lock().await.last_synced_at = Some(at);
        Ok(())
    }

    async fn clear(&self) -> Result<(), ChatError> {
        let mut inner = self.inner.lock().await;
        *inner = RepositoryInner::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{at, cid, message};

    #[tokio::test]
    async fn selects_messages_by_sync_status_in_stable_order() {
        let repo = InMemoryRepositoryFacade::new();
        let mut pending_b = message("m-b", "messaging:1", "u1", 10, 10);
        pending_b.sync_status = SyncStatus::SyncNeeded;
        let mut pending_a = message("m-a", "messaging:1", "u1", 11, 11);
        pending_a.sync_status = SyncStatus::SyncNeeded;
        let completed = message("m-c", "messaging:1", "u1", 12, 12);

        repo.insert_message(&pending_b).await.expect("insert");
        repo.insert_message(&pending_a).await.expect("insert");
        repo.insert_message(&completed).await.expect("insert");

        let ids = repo
            .select_message_ids_by_sync_status(SyncStatus::SyncNeeded)
            .await
            .expect("select");
        assert_eq!(ids, vec![MessageId::from("m-a"), MessageId::from("m-b")]);
    }

    #[tokio::test]
    async fn tracks_channel_recovery_flags() {
        let repo = InMemoryRepositoryFacade::new();
        repo.set_channel_recovery_needed(&cid("messaging:1"), true)
            .await
            .expect("set");
        repo.set_channel_recovery_needed(&cid("messaging:2"), true)
            .await
            .expect("set");
        repo.set_channel_recovery_needed(&cid("messaging:1"), false)
            .await
            .expect("clear");

        let cids = repo
            .select_channel_cids_needing_sync()
            .await
            .expect("select");
        assert_eq!(cids, vec![cid("messaging:2")]);
    }

    #[tokio::test]
    async fn clear_wipes_everything() {
        let repo = InMemoryRepositoryFacade::new();
        repo.insert_message(&message("m1", "messaging:1", "u1", 10, 10))
            .await
            .expect("insert");
        repo.set_last_synced_at(at(10)).await.expect("set");
        repo.clear().await.expect("clear");

        assert!(repo
            .select_message(&"m1".into())
            .await
            .expect("select")
            .is_none());
        assert!(repo
            .select_last_synced_at()
            .await
            .expect("select")
            .is_none());
    }
}
