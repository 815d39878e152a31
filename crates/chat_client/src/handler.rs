use std::sync::Arc;

use shared::domain::{Cid, UserId};
use shared::error::ChatError;
use shared::events::{ChatEvent, EventKind};
use shared::models::{ChannelData, Read};
use tracing::trace;

use crate::state::{ClientState, GlobalState, StateRegistry};

/// Decision on whether a channel enters or leaves one query result set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipDecision {
    Add,
    /// Add, and start watching the channel so its state gets loaded.
    WatchAndAdd,
    Remove,
    Skip,
}

/// Predicate over channel data backing a channel-list query.
pub trait ChannelFilter: Send + Sync {
    fn matches(&self, channel: &ChannelData) -> bool;
}

/// Matches channels the given user is a member of.
pub struct MemberOfFilter {
    pub user_id: UserId,
}

impl ChannelFilter for MemberOfFilter {
    fn matches(&self, channel: &ChannelData) -> bool {
        channel.is_member(&self.user_id)
    }
}

/// Matches channels of one channel type.
pub struct ChannelTypeFilter {
    pub channel_type: String,
}

impl ChannelFilter for ChannelTypeFilter {
    fn matches(&self, channel: &ChannelData) -> bool {
        channel.cid.channel_type == self.channel_type
    }
}

pub struct AnyChannelFilter;

impl ChannelFilter for AnyChannelFilter {
    fn matches(&self, _channel: &ChannelData) -> bool {
        true
    }
}

/// Pluggable membership policy for query result sets.
///
/// Entity-level merges are NOT the handler's job; they are applied
/// unconditionally by the router regardless of the membership outcome.
pub trait ChatEventHandler: Send + Sync {
    fn handle(
        &self,
        event: &ChatEvent,
        filter: &dyn ChannelFilter,
        cached_channel: Option<&ChannelData>,
    ) -> MembershipDecision;
}

/// Member-based policy: the result set follows the current user's channel
/// membership.
pub struct DefaultChatEventHandler {
    current_user: UserId,
}

impl DefaultChatEventHandler {
    pub fn new(current_user: UserId) -> Self {
        Self { current_user }
    }
}

impl ChatEventHandler for DefaultChatEventHandler {
    fn handle(
        &self,
        event: &ChatEvent,
        filter: &dyn ChannelFilter,
        cached_channel: Option<&ChannelData>,
    ) -> MembershipDecision {
        match &event.kind {
            EventKind::NotificationAddedToChannel { channel } => {
                if filter.matches(channel) {
                    MembershipDecision::WatchAndAdd
                } else {
                    MembershipDecision::Skip
                }
            }
            EventKind::NotificationMessageNew { channel, .. } => {
                if filter.matches(channel) {
                    MembershipDecision::Add
                } else {
                    MembershipDecision::Skip
                }
            }
            EventKind::MemberAdded { member, .. } if member.user_id == self.current_user => {
                match cached_channel {
                    Some(channel) if !filter.matches(channel) => MembershipDecision::Skip,
                    // Unknown channels are brought in; the watch fetches
                    // their state and a later update can still evict them.
                    _ => MembershipDecision::WatchAndAdd,
                }
            }
            EventKind::MemberRemoved { member, .. } if member.user_id == self.current_user => {
                MembershipDecision::Remove
            }
            EventKind::ChannelDeleted { .. } => MembershipDecision::Remove,
            EventKind::ChannelUpdated { channel } => {
                if filter.matches(channel) {
                    MembershipDecision::Skip
                } else {
                    MembershipDecision::Remove
                }
            }
            _ => MembershipDecision::Skip,
        }
    }
}

/// Inverse policy for moderation views listing channels the user is NOT a
/// member of.
pub struct NonMemberChatEventHandler {
    current_user: UserId,
}

impl NonMemberChatEventHandler {
    pub fn new(current_user: UserId) -> Self {
        Self { current_user }
    }
}

impl ChatEventHandler for NonMemberChatEventHandler {
    fn handle(
        &self,
        event: &ChatEvent,
        filter: &dyn ChannelFilter,
        cached_channel: Option<&ChannelData>,
    ) -> MembershipDecision {
        match &event.kind {
            // Becoming a member evicts the channel from a non-member view.
            EventKind::NotificationAddedToChannel { .. } => MembershipDecision::Remove,
            EventKind::MemberAdded { member, .. } if member.user_id == self.current_user => {
                MembershipDecision::Remove
            }
            EventKind::MemberRemoved { member, .. } if member.user_id == self.current_user => {
                match cached_channel {
                    Some(channel) if !filter.matches(channel) => MembershipDecision::Skip,
                    _ => MembershipDecision::WatchAndAdd,
                }
            }
            EventKind::ChannelDeleted { .. } => MembershipDecision::Remove,
            EventKind::ChannelUpdated { channel } => {
                if filter.matches(channel) && !channel.is_member(&self.current_user) {
                    MembershipDecision::Skip
                } else {
                    MembershipDecision::Remove
                }
            }
            _ => MembershipDecision::Skip,
        }
    }
}

/// Deferred work a routing pass asks the session to perform; routing itself
/// stays synchronous on the event-delivery path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FollowUp {
    WatchChannel(Cid),
}

/// Applies incoming events to the state containers and evaluates query
/// membership through the configured handler strategy.
pub struct EventRouter {
    registry: Arc<StateRegistry>,
    global: Arc<GlobalState>,
    client_state: Arc<ClientState>,
    handler: Arc<dyn ChatEventHandler>,
}

impl EventRouter {
    pub fn new(
        registry: Arc<StateRegistry>,
        global: Arc<GlobalState>,
        client_state: Arc<ClientState>,
        handler: Arc<dyn ChatEventHandler>,
    ) -> Self {
        Self {
            registry,
            global,
            client_state,
            handler,
        }
    }

    pub fn route(&self, event: &ChatEvent) -> Vec<FollowUp> {
        let mut follow_ups = self.apply_entity_merges(event);
        follow_ups.extend(self.apply_query_membership(event));
        follow_ups
    }

    fn current_user(&self) -> Option<UserId> {
        self.client_state.user().map(|u| u.id)
    }

    fn apply_entity_merges(&self, event: &ChatEvent) -> Vec<FollowUp> {
        let mut follow_ups = Vec::new();
        match &event.kind {
            EventKind::Connected { me, .. } => {
                self.client_state.set_user(me.clone());
                self.client_state.mark_initialized();
                self.global.set_user(me.clone());
            }
            EventKind::Health { .. } => {}
            EventKind::NewMessage {
                cid,
                message,
                total_unread_count,
            } => {
                if let Some(channel) = self.registry.channel_if_loaded(cid) {
                    channel.upsert_message(message);
                    // A delivered message implies the sender stopped typing.
                    channel.clear_typing(&message.user_id);
                }
                self.mirror_into_thread(message);
                if let Some(total) = total_unread_count {
                    self.global.set_total_unread_count(*total);
                }
                let own = self.current_user().as_ref() == Some(&message.user_id);
                if !own && !self.global.is_channel_muted(cid) {
                    self.global.bump_channel_unread_count(cid);
                }
            }
            EventKind::MessageUpdated { cid, message } => {
                if let Some(channel) = self.registry.channel_if_loaded(cid) {
                    channel.upsert_message(message);
                }
                self.mirror_into_thread(message);
            }
            EventKind::MessageDeleted { cid, message, hard } => {
                if let Some(channel) = self.registry.channel_if_loaded(cid) {
                    channel.delete_message(message, *hard);
                }
                if let Some(parent_id) = &message.parent_id {
                    if let Some(thread) = self.registry.thread_if_loaded(parent_id) {
                        if *hard {
                            thread.remove_reply(&message.id);
                        } else {
                            thread.upsert_reply(message);
                        }
                    }
                }
            }
            EventKind::ReactionNew { cid, message, .. }
            | EventKind::ReactionDeleted { cid, message, .. } => {
                // Reaction events carry the parent message with reaction
                // state already applied; merging it covers both maps.
                if let Some(channel) = self.registry.channel_if_loaded(cid) {
                    channel.upsert_message(message);
                }
                self.mirror_into_thread(message);
            }
            EventKind::TypingStart { cid, user_id, .. } => {
                if let Some(channel) = self.registry.channel_if_loaded(cid) {
                    channel.set_typing(user_id, event.created_at);
                }
            }
            EventKind::TypingStop { cid, user_id } => {
                if let Some(channel) = self.registry.channel_if_loaded(cid) {
                    channel.clear_typing(user_id);
                }
            }
            EventKind::MemberAdded { cid, member } => {
                if let Some(channel) = self.registry.channel_if_loaded(cid) {
                    channel.upsert_member(member);
                }
            }
            EventKind::MemberRemoved { cid, member } => {
                if let Some(channel) = self.registry.channel_if_loaded(cid) {
                    channel.remove_member(&member.user_id);
                }
            }
            EventKind::ChannelUpdated { channel } => {
                if let Some(state) = self.registry.channel_if_loaded(&channel.cid) {
                    state.set_channel_data(channel);
                }
            }
            EventKind::ChannelDeleted { cid, deleted_at } => {
                if let Some(state) = self.registry.channel_if_loaded(cid) {
                    state.mark_deleted(*deleted_at);
                }
            }
            EventKind::MessageRead { cid, user_id } => {
                if let Some(channel) = self.registry.channel_if_loaded(cid) {
                    channel.upsert_read(&Read {
                        user_id: user_id.clone(),
                        last_read: event.created_at,
                        unread_messages: 0,
                    });
                }
                if self.current_user().as_ref() == Some(user_id) {
                    self.global.set_channel_unread_count(cid, 0);
                }
            }
            EventKind::NotificationAddedToChannel { channel } => {
                if let Some(state) = self.registry.channel_if_loaded(&channel.cid) {
                    state.set_channel_data(channel);
                }
            }
            EventKind::NotificationMessageNew {
                channel,
                message,
                total_unread_count,
            } => {
                if let Some(state) = self.registry.channel_if_loaded(&channel.cid) {
                    state.set_channel_data(channel);
                    state.upsert_message(message);
                }
                self.mirror_into_thread(message);
                if let Some(total) = total_unread_count {
                    self.global.set_total_unread_count(*total);
                }
            }
            EventKind::NotificationMutesUpdated {
                mutes,
                channel_mutes,
            } => {
                self.global.set_mutes(mutes.clone(), channel_mutes.clone());
            }
            EventKind::UserBanned { user_id } => {
                if self.current_user().as_ref() == Some(user_id) {
                    self.global.set_banned(true);
                }
            }
            EventKind::UserUnbanned { user_id } => {
                if self.current_user().as_ref() == Some(user_id) {
                    self.global.set_banned(false);
                }
            }
            EventKind::ConnectionError { error } => {
                self.global
                    .record_error("connection", ChatError::Server(error.clone()));
            }
            EventKind::PushMessage {
                channel_type,
                channel_id,
                ..
            } => {
                // Push arrives for channels that may not be loaded; fetching
                // the channel brings the referenced message in.
                let cid = Cid::new(channel_type.clone(), channel_id.clone());
                follow_ups.push(FollowUp::WatchChannel(cid));
            }
        }
        follow_ups
    }

    fn mirror_into_thread(&self, message: &shared::models::Message) {
        // The channel message map stays canonical; a loaded thread re-derives
        // its reply from the same payload.
        if let Some(parent_id) = &message.parent_id {
            if let Some(thread) = self.registry.thread_if_loaded(parent_id) {
                thread.upsert_reply(message);
            }
        }
    }

    fn apply_query_membership(&self, event: &ChatEvent) -> Vec<FollowUp> {
        let Some(cid) = event.cid().cloned() else {
            return Vec::new();
        };
        let cached = self
            .registry
            .channel_if_loaded(&cid)
            .map(|c| c.snapshot().channel_data.clone());

        let mut follow_ups = Vec::new();
        for entry in self.registry.query_entries() {
            let decision = self
                .handler
                .handle(event, entry.filter.as_ref(), cached.as_ref());
            trace!(
                query = entry.state.key(),
                cid = %cid,
                ?decision,
                type_tag = event.type_tag(),
                "handler: membership decision"
            );
            match decision {
                MembershipDecision::Add => entry.state.add(&cid),
                MembershipDecision::WatchAndAdd => {
                    entry.state.add(&cid);
                    follow_ups.push(FollowUp::WatchChannel(cid.clone()));
                }
                MembershipDecision::Remove => entry.state.remove(&cid),
                MembershipDecision::Skip => {}
            }
        }
        follow_ups
    }
}

#[cfg(test)]
#[path = "tests/handler_tests.rs"]
mod tests;
