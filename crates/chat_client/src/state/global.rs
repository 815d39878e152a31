use std::collections::HashMap;
use std::sync::Arc;

use shared::domain::{Cid, UserId};
use shared::error::ChatError;
use shared::models::{ChannelMute, Mute, User};

use crate::state::observable::ObservableValue;

/// Per-session global state: one instance per logged-in user, created on
/// session start and cleared on logout. Passed by reference to every
/// component that needs it; there is no process-wide singleton.
#[derive(Debug, Clone, Default)]
pub struct GlobalSnapshot {
    pub user: Option<User>,
    pub total_unread_count: u32,
    pub channel_unread_count: HashMap<Cid, u32>,
    pub muted_users: Vec<Mute>,
    pub channel_mutes: Vec<ChannelMute>,
    pub banned: bool,
    /// Most recent failure surfaced to UI consumers (e.g. a permanently
    /// failed sync entity). Never raised as an exception.
    pub last_error: Option<ErrorNotice>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorNotice {
    pub context: String,
    pub error: ChatError,
}

pub struct GlobalState {
    snapshot: ObservableValue<GlobalSnapshot>,
}

impl GlobalState {
    pub fn new() -> Self {
        Self {
            snapshot: ObservableValue::new(GlobalSnapshot::default()),
        }
    }

    pub fn snapshot(&self) -> Arc<GlobalSnapshot> {
        self.snapshot.get()
    }

    pub fn watch(&self, watcher: impl Fn(&GlobalSnapshot) + Send + Sync + 'static) -> u64 {
        self.snapshot.watch(watcher)
    }

    pub fn unwatch(&self, id: u64) {
        self.snapshot.unwatch(id)
    }

    pub fn user(&self) -> Option<User> {
        self.snapshot.get().user.clone()
    }

    pub fn set_user(&self, user: User) {
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            next.user = Some(user.clone());
            next
        });
    }

    pub fn set_total_unread_count(&self, count: u32) {
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            next.total_unread_count = count;
            next
        });
    }

    pub fn set_channel_unread_count(&self, cid: &Cid, count: u32) {
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            if count == 0 {
                next.channel_unread_count.remove(cid);
            } else {
                next.channel_unread_count.insert(cid.clone(), count);
            }
            next
        });
    }

    pub fn bump_channel_unread_count(&self, cid: &Cid) {
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            *next.channel_unread_count.entry(cid.clone()).or_default() += 1;
            next
        });
    }

    pub fn set_mutes(&self, muted_users: Vec<Mute>, channel_mutes: Vec<ChannelMute>) {
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            next.muted_users = muted_users.clone();
            next.channel_mutes = channel_mutes.clone();
            next
        });
    }

    pub fn is_user_muted(&self, user_id: &UserId) -> bool {
        self.snapshot
            .get()
            .muted_users
            .iter()
            .any(|m| &m.user_id == user_id)
    }

    pub fn is_channel_muted(&self, cid: &Cid) -> bool {
        self.snapshot
            .get()
            .channel_mutes
            .iter()
            .any(|m| &m.cid == cid)
    }

    pub fn set_banned(&self, banned: bool) {
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            next.banned = banned;
            next
        });
    }

    pub fn record_error(&self, context: impl Into<String>, error: ChatError) {
        let notice = ErrorNotice {
            context: context.into(),
            error,
        };
        self.snapshot.update(|snapshot| {
            let mut next = snapshot.clone();
            next.last_error = Some(notice.clone());
            next
        });
    }

    /// Reset everything on logout.
    pub fn clear(&self) {
        self.snapshot.set(GlobalSnapshot::default());
    }
}

impl Default for GlobalState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;

    use super::*;

    #[test]
    fn clear_resets_the_whole_snapshot() {
        let global = GlobalState::new();
        global.set_user(User::new("u1"));
        global.set_total_unread_count(7);
        global.set_banned(true);

        global.clear();

        let snapshot = global.snapshot();
        assert!(snapshot.user.is_none());
        assert_eq!(snapshot.total_unread_count, 0);
        assert!(!snapshot.banned);
    }

    #[test]
    fn channel_unread_bump_and_reset() {
        let global = GlobalState::new();
        let cid: Cid = "messaging:1".parse().expect("cid");
        global.bump_channel_unread_count(&cid);
        global.bump_channel_unread_count(&cid);
        assert_eq!(
            global.snapshot().channel_unread_count.get(&cid).copied(),
            Some(2)
        );

        global.set_channel_unread_count(&cid, 0);
        assert!(global.snapshot().channel_unread_count.is_empty());
    }

    #[test]
    fn mute_lookups_match_on_ids() {
        let global = GlobalState::new();
        let cid: Cid = "messaging:1".parse().expect("cid");
        global.set_mutes(
            vec![Mute {
                user_id: "u2".into(),
                created_at: DateTime::from_timestamp(0, 0).expect("timestamp"),
                expires: None,
            }],
            vec![ChannelMute {
                cid: cid.clone(),
                created_at: DateTime::from_timestamp(0, 0).expect("timestamp"),
                expires: None,
            }],
        );

        assert!(global.is_user_muted(&"u2".into()));
        assert!(!global.is_user_muted(&"u3".into()));
        assert!(global.is_channel_muted(&cid));
    }
}
