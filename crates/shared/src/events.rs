use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{Cid, ConnectionId, MessageId, UserId};
use crate::error::ApiError;
use crate::models::{ChannelData, ChannelMute, Member, Message, Mute, Reaction, User};

/// A domain event as observed by the client.
///
/// `created_at` is assigned by the server; `received_at` is stamped exactly
/// once when the frame arrives and never travels over the wire. Events are
/// immutable after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatEvent {
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub received_at: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl ChatEvent {
    pub fn new(created_at: DateTime<Utc>, kind: EventKind) -> Self {
        Self {
            created_at,
            received_at: None,
            kind,
        }
    }

    pub fn received(mut self, at: DateTime<Utc>) -> Self {
        self.received_at = Some(at);
        self
    }

    /// Channel this event belongs to, if it is channel-scoped.
    pub fn cid(&self) -> Option<&Cid> {
        match &self.kind {
            EventKind::NewMessage { cid, .. }
            | EventKind::MessageUpdated { cid, .. }
            | EventKind::MessageDeleted { cid, .. }
            | EventKind::ReactionNew { cid, .. }
            | EventKind::ReactionDeleted { cid, .. }
            | EventKind::TypingStart { cid, .. }
            | EventKind::TypingStop { cid, .. }
            | EventKind::MemberAdded { cid, .. }
            | EventKind::MemberRemoved { cid, .. }
            | EventKind::ChannelDeleted { cid, .. }
            | EventKind::MessageRead { cid, .. } => Some(cid),
            EventKind::ChannelUpdated { channel }
            | EventKind::NotificationAddedToChannel { channel }
            | EventKind::NotificationMessageNew { channel, .. } => Some(&channel.cid),
            _ => None,
        }
    }

    pub fn type_tag(&self) -> &'static str {
        self.kind.type_tag()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum EventKind {
    /// Server acknowledgement of a freshly opened socket.
    #[serde(rename = "connection.ok")]
    Connected { connection_id: ConnectionId, me: User },
    #[serde(rename = "connection.error")]
    ConnectionError { error: ApiError },
    #[serde(rename = "health.check")]
    Health { connection_id: ConnectionId },
    #[serde(rename = "message.new")]
    NewMessage {
        cid: Cid,
        message: Message,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_unread_count: Option<u32>,
    },
    #[serde(rename = "message.updated")]
    MessageUpdated { cid: Cid, message: Message },
    #[serde(rename = "message.deleted")]
    MessageDeleted {
        cid: Cid,
        message: Message,
        #[serde(default)]
        hard: bool,
    },
    #[serde(rename = "reaction.new")]
    ReactionNew {
        cid: Cid,
        reaction: Reaction,
        message: Message,
    },
    #[serde(rename = "reaction.deleted")]
    ReactionDeleted {
        cid: Cid,
        reaction: Reaction,
        message: Message,
    },
    #[serde(rename = "typing.start")]
    TypingStart {
        cid: Cid,
        user_id: UserId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        parent_id: Option<MessageId>,
    },
    #[serde(rename = "typing.stop")]
    TypingStop { cid: Cid, user_id: UserId },
    #[serde(rename = "member.added")]
    MemberAdded { cid: Cid, member: Member },
    #[serde(rename = "member.removed")]
    MemberRemoved { cid: Cid, member: Member },
    #[serde(rename = "channel.updated")]
    ChannelUpdated { channel: ChannelData },
    #[serde(rename = "channel.deleted")]
    ChannelDeleted { cid: Cid, deleted_at: DateTime<Utc> },
    #[serde(rename = "message.read")]
    MessageRead { cid: Cid, user_id: UserId },
    #[serde(rename = "notification.added_to_channel")]
    NotificationAddedToChannel { channel: ChannelData },
    #[serde(rename = "notification.message_new")]
    NotificationMessageNew {
        channel: ChannelData,
        message: Message,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        total_unread_count: Option<u32>,
    },
    #[serde(rename = "notification.mutes_updated")]
    NotificationMutesUpdated {
        #[serde(default)]
        mutes: Vec<Mute>,
        #[serde(default)]
        channel_mutes: Vec<ChannelMute>,
    },
    #[serde(rename = "user.banned")]
    UserBanned { user_id: UserId },
    #[serde(rename = "user.unbanned")]
    UserUnbanned { user_id: UserId },
    /// Synthetic event injected by push-provider plumbing; never sent by the
    /// realtime socket itself.
    #[serde(rename = "push.message")]
    PushMessage {
        channel_type: String,
        channel_id: String,
        message_id: MessageId,
    },
}

impl EventKind {
    pub fn type_tag(&self) -> &'static str {
        match self {
            EventKind::Connected { .. } => "connection.ok",
            EventKind::ConnectionError { .. } => "connection.error",
            EventKind::Health { .. } => "health.check",
            EventKind::NewMessage { .. } => "message.new",
            EventKind::MessageUpdated { .. } => "message.updated",
            EventKind::MessageDeleted { .. } => "message.deleted",
            EventKind::ReactionNew { .. } => "reaction.new",
            EventKind::ReactionDeleted { .. } => "reaction.deleted",
            EventKind::TypingStart { .. } => "typing.start",
            EventKind::TypingStop { .. } => "typing.stop",
            EventKind::MemberAdded { .. } => "member.added",
            EventKind::MemberRemoved { .. } => "member.removed",
            EventKind::ChannelUpdated { .. } => "channel.updated",
            EventKind::ChannelDeleted { .. } => "channel.deleted",
            EventKind::MessageRead { .. } => "message.read",
            EventKind::NotificationAddedToChannel { .. } => "notification.added_to_channel",
            EventKind::NotificationMessageNew { .. } => "notification.message_new",
            EventKind::NotificationMutesUpdated { .. } => "notification.mutes_updated",
            EventKind::UserBanned { .. } => "user.banned",
            EventKind::UserUnbanned { .. } => "user.unbanned",
            EventKind::PushMessage { .. } => "push.message",
        }
    }
}
