use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::Utc;
use futures::{SinkExt, StreamExt};
use shared::error::ChatError;
use shared::events::ChatEvent;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, warn};

/// Inbound frame as seen by the socket layer, already stripped of transport
/// concerns (pings, binary frames).
#[derive(Debug, Clone, PartialEq)]
pub enum SocketFrame {
    Text(String),
    Close(Option<String>),
}

/// Lifecycle events observed on an open socket.
///
/// `Closed` and a non-parse `Failed` are terminal and emitted exactly once.
/// `Failed` carrying a `ChatError::Parse` is informational: the offending
/// frame is dropped and the connection stays up.
#[derive(Debug)]
pub enum SocketEvent {
    Opened,
    Message(ChatEvent),
    Closing { reason: String },
    Closed { reason: String },
    Failed(ChatError),
}

/// One physical realtime connection; implemented by the external WebSocket
/// library and by in-memory doubles in tests.
#[async_trait]
pub trait SocketHandle: Send {
    /// Next inbound frame; `None` once the peer is gone.
    async fn next_frame(&mut self) -> Option<Result<SocketFrame, ChatError>>;
    async fn send_text(&mut self, text: String) -> Result<(), ChatError>;
    async fn close(&mut self) -> Result<(), ChatError>;
}

#[async_trait]
pub trait SocketTransport: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Box<dyn SocketHandle>, ChatError>;
}

/// Production transport over tokio-tungstenite.
#[derive(Debug, Default)]
pub struct TungsteniteTransport;

#[async_trait]
impl SocketTransport for TungsteniteTransport {
    async fn connect(&self, url: &str) -> Result<Box<dyn SocketHandle>, ChatError> {
        let (stream, _) = tokio_tungstenite::connect_async(url)
            .await
            .map_err(|err| ChatError::network(format!("websocket connect failed: {err}")))?;
        Ok(Box::new(TungsteniteHandle { inner: stream }))
    }
}

struct TungsteniteHandle {
    inner: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
}

#[async_trait]
impl SocketHandle for TungsteniteHandle {
    async fn next_frame(&mut self) -> Option<Result<SocketFrame, ChatError>> {
        loop {
            match self.inner.next().await? {
                Ok(WsMessage::Text(text)) => return Some(Ok(SocketFrame::Text(text.to_string()))),
                Ok(WsMessage::Close(frame)) => {
                    return Some(Ok(SocketFrame::Close(
                        frame.map(|f| f.reason.to_string()),
                    )))
                }
                // Transport-level frames are not domain input.
                Ok(_) => continue,
                Err(err) => {
                    return Some(Err(ChatError::network(format!(
                        "websocket receive failed: {err}"
                    ))))
                }
            }
        }
    }

    async fn send_text(&mut self, text: String) -> Result<(), ChatError> {
        self.inner
            .send(WsMessage::Text(text.into()))
            .await
            .map_err(|err| ChatError::network(format!("websocket send failed: {err}")))
    }

    async fn close(&mut self) -> Result<(), ChatError> {
        self.inner
            .close(None)
            .await
            .map_err(|err| ChatError::network(format!("websocket close failed: {err}")))
    }
}

enum SocketCommand {
    Send(String, oneshot::Sender<Result<(), ChatError>>),
    Close(String),
}

#[derive(Default)]
struct ConnectionInner {
    commands: Option<mpsc::UnboundedSender<SocketCommand>>,
    task: Option<JoinHandle<()>>,
}

/// Owns exactly one physical connection at a time.
///
/// `open` spawns the read loop and returns the ordered lifecycle stream.
/// `send` before `open` or after termination returns a failure, never
/// panics. A fresh `SocketConnection` is created per connection attempt.
pub struct SocketConnection {
    transport: Arc<dyn SocketTransport>,
    url: String,
    inner: Mutex<ConnectionInner>,
    terminated: Arc<AtomicBool>,
    // Consumed when the terminal event fires so the lifecycle stream ends.
    terminal_sender: Arc<Mutex<Option<mpsc::UnboundedSender<SocketEvent>>>>,
}

impl SocketConnection {
    pub fn new(transport: Arc<dyn SocketTransport>, url: impl Into<String>) -> Self {
        Self {
            transport,
            url: url.into(),
            inner: Mutex::new(ConnectionInner::default()),
            terminated: Arc::new(AtomicBool::new(false)),
            terminal_sender: Arc::new(Mutex::new(None)),
        }
    }

    pub async fn open(&self) -> Result<mpsc::UnboundedReceiver<SocketEvent>, ChatError> {
        if lock(&self.inner).commands.is_some() {
            return Err(ChatError::network("socket already opened"));
        }

        let mut handle = self.transport.connect(&self.url).await?;
        debug!(url = %self.url, "socket: connection opened");

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, mut command_rx) = mpsc::unbounded_channel();
        let _ = event_tx.send(SocketEvent::Opened);
        *lock(&self.terminal_sender) = Some(event_tx.clone());

        let terminated = Arc::clone(&self.terminated);
        let terminal_sender = Arc::clone(&self.terminal_sender);
        let events = event_tx;
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    command = command_rx.recv() => match command {
                        Some(SocketCommand::Send(text, ack)) => {
                            let result = handle.send_text(text).await;
                            let _ = ack.send(result);
                        }
                        Some(SocketCommand::Close(reason)) => {
                            let _ = events.send(SocketEvent::Closing {
                                reason: reason.clone(),
                            });
                            let _ = handle.close().await;
                            emit_terminal(&terminal_sender, &terminated, SocketEvent::Closed { reason });
                            break;
                        }
                        None => {
                            let _ = handle.close().await;
                            emit_terminal(
                                &terminal_sender,
                                &terminated,
                                SocketEvent::Closed {
                                    reason: "connection dropped".to_string(),
                                },
                            );
                            break;
                        }
                    },
                    frame = handle.next_frame() => match frame {
                        Some(Ok(SocketFrame::Text(text))) => {
                            match serde_json::from_str::<ChatEvent>(&text) {
                                Ok(event) => {
                                    let _ = events.send(SocketEvent::Message(
                                        event.received(Utc::now()),
                                    ));
                                }
                                Err(err) => {
                                    warn!(%err, "socket: dropping undecodable frame");
                                    let _ = events.send(SocketEvent::Failed(ChatError::parse(
                                        format!("invalid server event: {err}"),
                                    )));
                                }
                            }
                        }
                        Some(Ok(SocketFrame::Close(reason))) => {
                            let reason = reason.unwrap_or_else(|| "closed by server".to_string());
                            let _ = events.send(SocketEvent::Closing {
                                reason: reason.clone(),
                            });
                            emit_terminal(&terminal_sender, &terminated, SocketEvent::Closed { reason });
                            break;
                        }
                        Some(Err(error)) => {
                            emit_terminal(&terminal_sender, &terminated, SocketEvent::Failed(error));
                            break;
                        }
                        None => {
                            emit_terminal(
                                &terminal_sender,
                                &terminated,
                                SocketEvent::Closed {
                                    reason: "stream ended".to_string(),
                                },
                            );
                            break;
                        }
                    },
                }
            }
        });

        let mut inner = lock(&self.inner);
        inner.commands = Some(command_tx);
        inner.task = Some(task);
        Ok(event_rx)
    }

    pub async fn send(&self, event: &ChatEvent) -> Result<(), ChatError> {
        let text = serde_json::to_string(event)?;
        let commands = lock(&self.inner).commands.clone();
        let Some(commands) = commands else {
            return Err(ChatError::network("socket not open"));
        };
        let (ack_tx, ack_rx) = oneshot::channel();
        commands
            .send(SocketCommand::Send(text, ack_tx))
            .map_err(|_| ChatError::network("socket terminated"))?;
        ack_rx
            .await
            .map_err(|_| ChatError::network("socket terminated"))?
    }

    /// Graceful close with a close handshake.
    pub fn close(&self, reason: impl Into<String>) {
        if let Some(commands) = lock(&self.inner).commands.clone() {
            let _ = commands.send(SocketCommand::Close(reason.into()));
        }
    }

    /// Hard abort: no close handshake. Termination is still signaled exactly
    /// once.
    pub fn cancel(&self) {
        let task = lock(&self.inner).task.take();
        if let Some(task) = task {
            task.abort();
        }
        emit_terminal(
            &self.terminal_sender,
            &self.terminated,
            SocketEvent::Closed {
                reason: "cancelled".to_string(),
            },
        );
    }

    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }
}

fn emit_terminal(
    terminal_sender: &Mutex<Option<mpsc::UnboundedSender<SocketEvent>>>,
    terminated: &AtomicBool,
    event: SocketEvent,
) {
    let sender = lock(terminal_sender).take();
    if !terminated.swap(true, Ordering::SeqCst) {
        if let Some(sender) = sender {
            let _ = sender.send(event);
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
#[path = "tests/socket_tests.rs"]
mod tests;
