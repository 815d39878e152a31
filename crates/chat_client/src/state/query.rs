use std::sync::Arc;

use shared::domain::Cid;

use crate::state::observable::ObservableValue;

/// Observable result set of one channel-list query.
#[derive(Debug, Clone, Default)]
pub struct QuerySnapshot {
    /// Current result ordering. The server's ordering is kept on `set`;
    /// channels added by live events are placed first (most recent activity).
    pub channels: Vec<Cid>,
    pub next_cursor: Option<String>,
    pub recovery_needed: bool,
}

pub struct QueryChannelsState {
    key: String,
    snapshot: ObservableValue<QuerySnapshot>,
}

impl QueryChannelsState {
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            snapshot: ObservableValue::new(QuerySnapshot::default()),
        }
    }

    /// Identifier of the (filter, sort) pair this query state belongs to.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn snapshot(&self) -> Arc<QuerySnapshot> {
        self.snapshot.get()
    }

    pub fn watch(&self, watcher: impl Fn(&QuerySnapshot) + Send + Sync + 'static) -> u64 {
        self.snapshot.watch(watcher)
    }

    pub fn unwatch(&self, id: u64) {
        self.snapshot.unwatch(id)
    }

    pub fn set_channels(&self, channels: Vec<Cid>, next_cursor: Option<String>) {
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            next.channels = channels.clone();
            next.next_cursor = next_cursor.clone();
            next
        });
    }

    pub fn add(&self, cid: &Cid) {
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            if !next.channels.contains(cid) {
                next.channels.insert(0, cid.clone());
            }
            next
        });
    }

    pub fn remove(&self, cid: &Cid) {
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            next.channels.retain(|c| c != cid);
            next
        });
    }

    pub fn contains(&self, cid: &Cid) -> bool {
        self.snapshot.get().channels.contains(cid)
    }

    pub fn set_recovery_needed(&self, needed: bool) {
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            next.recovery_needed = needed;
            next
        });
    }
}
