use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use shared::domain::{Cid, MessageId, UserId};
use shared::models::{ChannelData, Member, Message, Read};
use tracing::trace;

use crate::state::observable::ObservableValue;

/// Observable snapshot of one channel's cached truth.
///
/// The raw message map keeps soft-deleted entries as tombstones so sort
/// stability and thread back-references stay valid; derived views filter
/// them out.
#[derive(Debug, Clone, Default)]
pub struct ChannelSnapshot {
    pub channel_data: ChannelData,
    pub messages: HashMap<MessageId, Message>,
    pub members: HashMap<UserId, Member>,
    pub reads: HashMap<UserId, Read>,
    pub watchers: HashSet<UserId>,
    pub typing: HashMap<UserId, DateTime<Utc>>,
    pub end_of_older_messages: bool,
    pub end_of_newer_messages: bool,
    pub recovery_needed: bool,
}

pub struct ChannelState {
    cid: Cid,
    snapshot: ObservableValue<ChannelSnapshot>,
}

impl ChannelState {
    pub fn new(cid: Cid) -> Self {
        let channel_data = ChannelData {
            cid: cid.clone(),
            ..ChannelData::default()
        };
        Self {
            cid,
            snapshot: ObservableValue::new(ChannelSnapshot {
                channel_data,
                ..ChannelSnapshot::default()
            }),
        }
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn snapshot(&self) -> Arc<ChannelSnapshot> {
        self.snapshot.get()
    }

    pub fn watch(&self, watcher: impl Fn(&ChannelSnapshot) + Send + Sync + 'static) -> u64 {
        self.snapshot.watch(watcher)
    }

    pub fn unwatch(&self, id: u64) {
        self.snapshot.unwatch(id)
    }

    /// Last-writer-wins upsert keyed by message id.
    ///
    /// An incoming message strictly older (by `updated_at`) than the cached
    /// one is rejected; arrival order is not trustworthy under retries and
    /// reconnection replay. Equal timestamps are accepted so that replaying
    /// the same event is idempotent.
    pub fn upsert_message(&self, incoming: &Message) {
        if incoming.id.as_str().is_empty() {
            return;
        }
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            upsert_into(&mut next.messages, incoming);
            next
        });
    }

    pub fn upsert_messages(&self, incoming: &[Message]) {
        if incoming.is_empty() {
            return;
        }
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            for message in incoming {
                upsert_into(&mut next.messages, message);
            }
            next
        });
    }

    /// Apply a delete event. Soft deletes tombstone the entry (the message
    /// carries `deleted_at`); hard deletes remove it outright.
    pub fn delete_message(&self, message: &Message, hard: bool) {
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            if hard {
                next.messages.remove(&message.id);
            } else {
                upsert_into(&mut next.messages, message);
            }
            next
        });
    }

    pub fn message(&self, id: &MessageId) -> Option<Message> {
        self.snapshot.get().messages.get(id).cloned()
    }

    /// Deterministic ordering of the raw map: creation time, tie-broken by
    /// id. Tombstones included for sort stability.
    pub fn sorted_messages(&self) -> Vec<Message> {
        let snapshot = self.snapshot.get();
        let mut messages: Vec<Message> = snapshot.messages.values().cloned().collect();
        messages.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        messages
    }

    /// Ordering for display: tombstoned entries excluded.
    pub fn visible_messages(&self) -> Vec<Message> {
        self.sorted_messages()
            .into_iter()
            .filter(|m| !m.is_deleted())
            .collect()
    }

    /// Purge tombstones older than the retention threshold.
    pub fn sweep_tombstones(&self, now: DateTime<Utc>, retention: Duration) {
        let retention = chrono::Duration::from_std(retention).unwrap_or(chrono::Duration::MAX);
        let cutoff = now - retention;
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            let before = next.messages.len();
            next.messages
                .retain(|_, m| m.deleted_at.map_or(true, |at| at > cutoff));
            if next.messages.len() != before {
                trace!(
                    cid = %self.cid,
                    purged = before - next.messages.len(),
                    "channel: swept expired tombstones"
                );
            }
            next
        });
    }

    pub fn set_channel_data(&self, incoming: &ChannelData) {
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            let cached = &next.channel_data;
            let stale = match (cached.updated_at, incoming.updated_at) {
                (Some(cached_at), Some(incoming_at)) => incoming_at < cached_at,
                _ => false,
            };
            if !stale {
                next.channel_data = incoming.clone();
            }
            next
        });
    }

    pub fn mark_deleted(&self, at: DateTime<Utc>) {
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            next.channel_data.deleted_at = Some(at);
            next
        });
    }

    pub fn upsert_member(&self, member: &Member) {
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            next.members.insert(member.user_id.clone(), member.clone());
            if !next.channel_data.is_member(&member.user_id) {
                next.channel_data.members.push(member.clone());
            }
            next
        });
    }

    pub fn remove_member(&self, user_id: &UserId) {
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            next.members.remove(user_id);
            next.channel_data.members.retain(|m| &m.user_id != user_id);
            next
        });
    }

    pub fn upsert_read(&self, read: &Read) {
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            let newer = next
                .reads
                .get(&read.user_id)
                .map_or(true, |cached| read.last_read >= cached.last_read);
            if newer {
                next.reads.insert(read.user_id.clone(), read.clone());
            }
            next
        });
    }

    pub fn upsert_reads(&self, reads: &[Read]) {
        for read in reads {
            self.upsert_read(read);
        }
    }

    pub fn set_typing(&self, user_id: &UserId, at: DateTime<Utc>) {
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            next.typing.insert(user_id.clone(), at);
            next
        });
    }

    pub fn clear_typing(&self, user_id: &UserId) {
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            next.typing.remove(user_id);
            next
        });
    }

    pub fn add_watcher(&self, user_id: &UserId) {
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            next.watchers.insert(user_id.clone());
            next
        });
    }

    pub fn remove_watcher(&self, user_id: &UserId) {
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            next.watchers.remove(user_id);
            next
        });
    }

    pub fn set_pagination(&self, end_of_older: bool, end_of_newer: bool) {
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            next.end_of_older_messages = end_of_older;
            next.end_of_newer_messages = end_of_newer;
            next
        });
    }

    pub fn set_recovery_needed(&self, needed: bool) {
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            next.recovery_needed = needed;
            next
        });
    }

    pub fn recovery_needed(&self) -> bool {
        self.snapshot.get().recovery_needed
    }
}

fn upsert_into(messages: &mut HashMap<MessageId, Message>, incoming: &Message) {
    match messages.get(&incoming.id) {
        Some(cached) if incoming.updated_at < cached.updated_at => {
            trace!(
                message_id = %incoming.id,
                cached_at = %cached.updated_at,
                incoming_at = %incoming.updated_at,
                "channel: rejecting stale message update"
            );
        }
        _ => {
            messages.insert(incoming.id.clone(), incoming.clone());
        }
    }
}

#[cfg(test)]
#[path = "tests/channel_tests.rs"]
mod tests;
