use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use shared::domain::MessageId;
use shared::models::Message;

use crate::state::observable::ObservableValue;

/// Observable snapshot of one thread's replies.
///
/// The parent message is never canonical here; the owning channel's message
/// map is the single source of truth and thread state re-derives from it.
#[derive(Debug, Clone, Default)]
pub struct ThreadSnapshot {
    pub replies: HashMap<MessageId, Message>,
    pub oldest_loaded: Option<DateTime<Utc>>,
    pub newest_loaded: Option<DateTime<Utc>>,
    pub loading_older: bool,
    pub end_of_older_replies: bool,
}

pub struct ThreadState {
    parent_id: MessageId,
    snapshot: ObservableValue<ThreadSnapshot>,
}

impl ThreadState {
    pub fn new(parent_id: MessageId) -> Self {
        Self {
            parent_id,
            snapshot: ObservableValue::new(ThreadSnapshot::default()),
        }
    }

    pub fn parent_id(&self) -> &MessageId {
        &self.parent_id
    }

    pub fn snapshot(&self) -> Arc<ThreadSnapshot> {
        self.snapshot.get()
    }

    pub fn watch(&self, watcher: impl Fn(&ThreadSnapshot) + Send + Sync + 'static) -> u64 {
        self.snapshot.watch(watcher)
    }

    pub fn unwatch(&self, id: u64) {
        self.snapshot.unwatch(id)
    }

    /// Same last-writer-wins rule as the channel message map.
    pub fn upsert_reply(&self, incoming: &Message) {
        if incoming.parent_id.as_ref() != Some(&self.parent_id) {
            return;
        }
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            match next.replies.get(&incoming.id) {
                Some(cached) if incoming.updated_at < cached.updated_at => {}
                _ => {
                    next.replies.insert(incoming.id.clone(), incoming.clone());
                }
            }
            let bounds = (
                next.oldest_loaded.min(Some(incoming.created_at)),
                next.newest_loaded.max(Some(incoming.created_at)),
            );
            next.oldest_loaded = bounds.0.or(Some(incoming.created_at));
            next.newest_loaded = bounds.1;
            next
        });
    }

    pub fn remove_reply(&self, id: &MessageId) {
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            next.replies.remove(id);
            next
        });
    }

    pub fn sorted_replies(&self) -> Vec<Message> {
        let snapshot = self.snapshot.get();
        let mut replies: Vec<Message> = snapshot.replies.values().cloned().collect();
        replies.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        replies
    }

    pub fn visible_replies(&self) -> Vec<Message> {
        self.sorted_replies()
            .into_iter()
            .filter(|m| !m.is_deleted())
            .collect()
    }

    pub fn set_loading_older(&self, loading: bool) {
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            next.loading_older = loading;
            next
        });
    }

    pub fn set_end_of_older_replies(&self, end: bool) {
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            next.end_of_older_replies = end;
            next
        });
    }
}
