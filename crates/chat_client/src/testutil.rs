//! In-memory doubles shared by the async test suites.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared::domain::{Cid, ConnectionId, MessageId, UserId};
use shared::error::{ApiError, ChatError, ErrorCode};
use shared::events::{ChatEvent, EventKind};
use shared::models::{Message, Reaction, SyncStatus, User};
use tokio::sync::mpsc;

use crate::api::{ChannelPage, ChatApi, QueryChannelsRequest, QueryChannelsResponse};
use crate::socket::{SocketFrame, SocketHandle, SocketTransport};

pub fn at(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, 0).expect("timestamp")
}

pub fn connected_event(connection_id: &str, user_id: &str) -> ChatEvent {
    ChatEvent::new(
        at(0),
        EventKind::Connected {
            connection_id: ConnectionId::new(connection_id),
            me: User::new(user_id),
        },
    )
}

pub fn health_event(connection_id: &str) -> ChatEvent {
    ChatEvent::new(
        at(0),
        EventKind::Health {
            connection_id: ConnectionId::new(connection_id),
        },
    )
}

pub fn message(id: &str, cid: &str, user_id: &str, created: i64, updated: i64) -> Message {
    Message {
        id: id.into(),
        cid: cid.parse().expect("cid"),
        user_id: user_id.into(),
        text: format!("text-{id}"),
        created_at: at(created),
        updated_at: at(updated),
        ..Message::default()
    }
}

pub fn new_message_event(cid: &str, message: Message) -> ChatEvent {
    let created_at = message.created_at;
    ChatEvent::new(
        created_at,
        EventKind::NewMessage {
            cid: cid.parse().expect("cid"),
            message,
            total_unread_count: None,
        },
    )
}

pub fn message_deleted_event(cid: &str, mut message: Message, deleted_at: DateTime<Utc>) -> ChatEvent {
    message.deleted_at = Some(deleted_at);
    message.updated_at = deleted_at;
    ChatEvent::new(
        deleted_at,
        EventKind::MessageDeleted {
            cid: cid.parse().expect("cid"),
            message,
            hard: false,
        },
    )
}

pub fn text_frame(event: &ChatEvent) -> Result<SocketFrame, ChatError> {
    Ok(SocketFrame::Text(
        serde_json::to_string(event).expect("encode event"),
    ))
}

/// Scripted transport: each `connect` consumes the next outcome. Tests hold
/// the frame sender and the sink of outbound texts for accepted sessions.
pub struct TestTransport {
    sessions: Mutex<VecDeque<SessionScript>>,
    attempts: AtomicUsize,
}

pub enum SessionScript {
    Refuse(ChatError),
    Accept(SessionPipes),
}

pub struct SessionPipes {
    pub frames: mpsc::UnboundedReceiver<Result<SocketFrame, ChatError>>,
    pub sent: mpsc::UnboundedSender<String>,
}

/// Test-side ends of an accepted session.
pub struct SessionDriver {
    pub frames: mpsc::UnboundedSender<Result<SocketFrame, ChatError>>,
    pub sent: mpsc::UnboundedReceiver<String>,
}

impl TestTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: Mutex::new(VecDeque::new()),
            attempts: AtomicUsize::new(0),
        })
    }

    pub fn refuse(&self, error: ChatError) {
        self.sessions
            .lock()
            .expect("lock")
            .push_back(SessionScript::Refuse(error));
    }

    /// Script one accepted session; returns the test-side driver.
    pub fn accept(&self) -> SessionDriver {
        let (frame_tx, frame_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        self.sessions
            .lock()
            .expect("lock")
            .push_back(SessionScript::Accept(SessionPipes {
                frames: frame_rx,
                sent: sent_tx,
            }));
        SessionDriver {
            frames: frame_tx,
            sent: sent_rx,
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SocketTransport for TestTransport {
    async fn connect(&self, _url: &str) -> Result<Box<dyn SocketHandle>, ChatError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let script = self.sessions.lock().expect("lock").pop_front();
        match script {
            Some(SessionScript::Accept(pipes)) => Ok(Box::new(TestHandle {
                frames: pipes.frames,
                sent: pipes.sent,
                closed: false,
            })),
            Some(SessionScript::Refuse(error)) => Err(error),
            None => Err(ChatError::network("no scripted session")),
        }
    }
}

struct TestHandle {
    frames: mpsc::UnboundedReceiver<Result<SocketFrame, ChatError>>,
    sent: mpsc::UnboundedSender<String>,
    closed: bool,
}

#[async_trait]
impl SocketHandle for TestHandle {
    async fn next_frame(&mut self) -> Option<Result<SocketFrame, ChatError>> {
        if self.closed {
            return None;
        }
        self.frames.recv().await
    }

    async fn send_text(&mut self, text: String) -> Result<(), ChatError> {
        if self.closed {
            return Err(ChatError::network("handle closed"));
        }
        self.sent
            .send(text)
            .map_err(|_| ChatError::network("test sink dropped"))
    }

    async fn close(&mut self) -> Result<(), ChatError> {
        self.closed = true;
        Ok(())
    }
}

/// Scripted REST api: records calls, fails selected message ids, serves
/// canned channel pages and replay events.
#[derive(Default)]
pub struct MockChatApi {
    pub ops: Mutex<Vec<String>>,
    pub permanent_failures: HashSet<MessageId>,
    pub transient_failures: HashSet<MessageId>,
    /// When set, every send fails with a clone of this error.
    pub fail_sends_with: Mutex<Option<ChatError>>,
    pub channel_pages: Mutex<HashMap<Cid, ChannelPage>>,
    pub replay_events: Mutex<Vec<ChatEvent>>,
    pub sync_event_calls: AtomicUsize,
}

impl MockChatApi {
    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().expect("lock").clone()
    }

    fn record(&self, op: impl Into<String>) {
        self.ops.lock().expect("lock").push(op.into());
    }

    pub fn with_channel_page(self, cid_raw: &str, page: ChannelPage) -> Self {
        self.channel_pages
            .lock()
            .expect("lock")
            .insert(cid(cid_raw), page);
        self
    }
}

#[async_trait]
impl ChatApi for MockChatApi {
    async fn send_message(&self, message: &Message) -> Result<Message, ChatError> {
        self.record(format!("send_message:{}", message.id));
        if let Some(error) = self.fail_sends_with.lock().expect("lock").clone() {
            return Err(error);
        }
        if self.permanent_failures.contains(&message.id) {
            return Err(ChatError::Server(ApiError::new(
                ErrorCode::Validation,
                "rejected",
            )));
        }
        if self.transient_failures.contains(&message.id) {
            return Err(ChatError::network("flaky"));
        }
        let mut acked = message.clone();
        acked.sync_status = SyncStatus::Completed;
        Ok(acked)
    }

    async fn delete_message(&self, id: &MessageId) -> Result<Message, ChatError> {
        self.record(format!("delete_message:{id}"));
        let mut tombstone = message("deleted", "messaging:1", "u1", 0, 0);
        tombstone.id = id.clone();
        tombstone.deleted_at = Some(at(0));
        tombstone.sync_status = SyncStatus::Completed;
        Ok(tombstone)
    }

    async fn send_reaction(&self, reaction: &Reaction) -> Result<Reaction, ChatError> {
        self.record(format!("send_reaction:{}", reaction.id));
        let mut acked = reaction.clone();
        acked.sync_status = SyncStatus::Completed;
        Ok(acked)
    }

    async fn delete_reaction(
        &self,
        message_id: &MessageId,
        kind: &str,
        _user_id: &UserId,
    ) -> Result<(), ChatError> {
        self.record(format!("delete_reaction:{message_id}:{kind}"));
        Ok(())
    }

    async fn query_channel(&self, cid: &Cid) -> Result<ChannelPage, ChatError> {
        self.record(format!("query_channel:{cid}"));
        self.channel_pages
            .lock()
            .expect("lock")
            .get(cid)
            .cloned()
            .ok_or_else(|| ChatError::Server(ApiError::new(ErrorCode::NotFound, "no channel")))
    }

    async fn query_channels(
        &self,
        _request: &QueryChannelsRequest,
    ) -> Result<QueryChannelsResponse, ChatError> {
        self.record("query_channels");
        Ok(QueryChannelsResponse {
            channels: Vec::new(),
            next_cursor: None,
        })
    }

    async fn sync_events(
        &self,
        _cids: &[Cid],
        _since: DateTime<Utc>,
    ) -> Result<Vec<ChatEvent>, ChatError> {
        self.record("sync_events");
        self.sync_event_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.replay_events.lock().expect("lock").clone())
    }

    async fn mark_read(&self, cid: &Cid, _user_id: &UserId) -> Result<(), ChatError> {
        self.record(format!("mark_read:{cid}"));
        Ok(())
    }
}

/// Poll `condition` until it holds or two seconds elapse.
pub async fn wait_until(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}

pub fn cid(raw: &str) -> Cid {
    raw.parse().expect("cid")
}
