use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use shared::domain::{Cid, MessageId};

use crate::handler::ChannelFilter;
use crate::state::channel::ChannelState;
use crate::state::query::QueryChannelsState;
use crate::state::thread::ThreadState;

/// Owner of all per-channel, per-thread and per-query state containers for a
/// session. Containers are created lazily on first access and torn down when
/// released.
#[derive(Default)]
pub struct StateRegistry {
    channels: Mutex<HashMap<Cid, Arc<ChannelState>>>,
    threads: Mutex<HashMap<MessageId, Arc<ThreadState>>>,
    queries: Mutex<HashMap<String, QueryEntry>>,
}

#[derive(Clone)]
pub struct QueryEntry {
    pub filter: Arc<dyn ChannelFilter>,
    pub state: Arc<QueryChannelsState>,
}

impl StateRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn channel(&self, cid: &Cid) -> Arc<ChannelState> {
        let mut channels = lock(&self.channels);
        Arc::clone(
            channels
                .entry(cid.clone())
                .or_insert_with(|| Arc::new(ChannelState::new(cid.clone()))),
        )
    }

    /// Channel state only if it has been loaded already; entity merges for
    /// channels nobody watches are skipped at this seam.
    pub fn channel_if_loaded(&self, cid: &Cid) -> Option<Arc<ChannelState>> {
        lock(&self.channels).get(cid).cloned()
    }

    pub fn loaded_channel_cids(&self) -> Vec<Cid> {
        lock(&self.channels).keys().cloned().collect()
    }

    pub fn release_channel(&self, cid: &Cid) {
        lock(&self.channels).remove(cid);
    }

    pub fn thread(&self, parent_id: &MessageId) -> Arc<ThreadState> {
        let mut threads = lock(&self.threads);
        Arc::clone(
            threads
                .entry(parent_id.clone())
                .or_insert_with(|| Arc::new(ThreadState::new(parent_id.clone()))),
        )
    }

    pub fn thread_if_loaded(&self, parent_id: &MessageId) -> Option<Arc<ThreadState>> {
        lock(&self.threads).get(parent_id).cloned()
    }

    pub fn release_thread(&self, parent_id: &MessageId) {
        lock(&self.threads).remove(parent_id);
    }

    pub fn query(&self, key: &str, filter: Arc<dyn ChannelFilter>) -> Arc<QueryChannelsState> {
        let mut queries = lock(&self.queries);
        Arc::clone(
            &queries
                .entry(key.to_string())
                .or_insert_with(|| QueryEntry {
                    filter,
                    state: Arc::new(QueryChannelsState::new(key)),
                })
                .state,
        )
    }

    pub fn query_entries(&self) -> Vec<QueryEntry> {
        lock(&self.queries).values().cloned().collect()
    }

    pub fn release_query(&self, key: &str) {
        lock(&self.queries).remove(key);
    }

    /// Drop every container; used on logout.
    pub fn clear(&self) {
        lock(&self.channels).clear();
        lock(&self.threads).clear();
        lock(&self.queries).clear();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
