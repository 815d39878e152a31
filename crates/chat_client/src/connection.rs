use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::Rng;
use shared::domain::ConnectionId;
use shared::error::{ApiError, ChatError, ErrorCode};
use shared::events::{ChatEvent, EventKind};
use shared::models::User;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ChatConfig;
use crate::dispatcher::EventDispatcher;
use crate::socket::{SocketConnection, SocketEvent, SocketTransport};
use crate::state::ObservableValue;

/// Connection lifecycle as observed by the rest of the SDK. Mutated only by
/// the connection controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected { connection_id: ConnectionId },
    Disconnecting,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected { .. })
    }
}

/// Exponential backoff for reconnect attempts: seeded low, capped high,
/// optionally jittered. Without jitter the delays are monotonically
/// non-decreasing up to the cap, then stay at the cap.
#[derive(Debug)]
pub struct ReconnectBackoff {
    base: Duration,
    cap: Duration,
    jitter: bool,
    attempt: u32,
}

impl ReconnectBackoff {
    pub fn new(base: Duration, cap: Duration, jitter: bool) -> Self {
        Self {
            base,
            cap,
            jitter,
            attempt: 0,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        let shift = self.attempt.min(20);
        let multiplier = 1_u64 << shift;
        let capped = (self.base.as_millis() as u64)
            .saturating_mul(multiplier)
            .min(self.cap.as_millis() as u64);
        self.attempt = self.attempt.saturating_add(1);

        let with_jitter = if self.jitter {
            capped + rand::thread_rng().gen_range(0..=capped / 4)
        } else {
            capped
        };
        Duration::from_millis(with_jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

enum SessionEnd {
    /// Disconnect was requested; leave the loop.
    Stopped,
    /// Connection dropped unexpectedly; reconnect after backoff.
    Lost,
}

#[derive(Default)]
struct StopSignal {
    flag: AtomicBool,
    notify: Notify,
}

impl StopSignal {
    fn requested(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    fn request(&self) {
        self.flag.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }
}

#[derive(Default)]
struct ControllerInner {
    driver: Option<JoinHandle<()>>,
    socket: Option<Arc<SocketConnection>>,
    stop: Option<Arc<StopSignal>>,
}

/// Wraps the socket with explicit connection states, a health-check watchdog
/// and automatic reconnection with backoff.
///
/// Connection failures are never raised to `connect` callers; they surface
/// as state transitions plus `connection.error` events on the dispatcher.
pub struct ConnectionController {
    transport: Arc<dyn SocketTransport>,
    config: ChatConfig,
    dispatcher: Arc<EventDispatcher>,
    state: Arc<ObservableValue<ConnectionState>>,
    inner: Mutex<ControllerInner>,
}

impl ConnectionController {
    pub fn new(
        transport: Arc<dyn SocketTransport>,
        config: ChatConfig,
        dispatcher: Arc<EventDispatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            config,
            dispatcher,
            state: Arc::new(ObservableValue::new(ConnectionState::Disconnected)),
            inner: Mutex::new(ControllerInner::default()),
        })
    }

    /// Shared read-only view of the connection state.
    pub fn state(&self) -> Arc<ObservableValue<ConnectionState>> {
        Arc::clone(&self.state)
    }

    pub fn current_state(&self) -> ConnectionState {
        self.state.get().as_ref().clone()
    }

    /// Start connecting as `user`. No-op unless currently disconnected.
    pub fn connect(self: &Arc<Self>, user: &User) {
        {
            let inner = lock(&self.inner);
            if inner.driver.is_some() {
                warn!("connection: connect ignored, already active");
                return;
            }
        }
        info!(user_id = %user.id, "connection: connecting");
        self.state.set(ConnectionState::Connecting);

        let stop = Arc::new(StopSignal::default());
        let driver = tokio::spawn(Arc::clone(self).drive(user.clone(), Arc::clone(&stop)));

        let mut inner = lock(&self.inner);
        inner.stop = Some(stop);
        inner.driver = Some(driver);
    }

    /// Stop the connection and any in-flight reconnect attempt.
    pub async fn disconnect(&self) {
        let (driver, socket, stop) = {
            let mut inner = lock(&self.inner);
            (inner.driver.take(), inner.socket.take(), inner.stop.take())
        };
        let Some(stop) = stop else {
            self.state.set(ConnectionState::Disconnected);
            return;
        };
        info!("connection: disconnecting");
        let was_connected = self.current_state().is_connected();
        self.state.set(ConnectionState::Disconnecting);
        stop.request();

        if let Some(socket) = socket {
            if was_connected {
                socket.close("disconnect requested");
            } else {
                socket.cancel();
            }
        }
        if let Some(mut driver) = driver {
            if tokio::time::timeout(Duration::from_secs(5), &mut driver)
                .await
                .is_err()
            {
                driver.abort();
            }
        }
        self.state.set(ConnectionState::Disconnected);
    }

    async fn drive(self: Arc<Self>, user: User, stop: Arc<StopSignal>) {
        let mut backoff = ReconnectBackoff::new(
            self.config.backoff_base,
            self.config.backoff_cap,
            self.config.backoff_jitter,
        );
        let url = format!(
            "{}?api_key={}&user_id={}",
            self.config.ws_url, self.config.api_key, user.id
        );

        loop {
            if stop.requested() {
                break;
            }
            self.state.set(ConnectionState::Connecting);
            let socket = Arc::new(SocketConnection::new(Arc::clone(&self.transport), &*url));
            let events = match socket.open().await {
                Ok(events) => events,
                Err(error) => {
                    warn!(%error, "connection: open failed");
                    self.dispatch_error(&error);
                    if self.backoff_wait(&mut backoff, &stop).await {
                        continue;
                    }
                    break;
                }
            };

            lock(&self.inner).socket = Some(Arc::clone(&socket));
            let end = self.run_session(&socket, events, &mut backoff, &stop).await;
            lock(&self.inner).socket = None;

            match end {
                SessionEnd::Stopped => break,
                SessionEnd::Lost => {
                    if !self.backoff_wait(&mut backoff, &stop).await {
                        break;
                    }
                }
            }
        }
        self.state.set(ConnectionState::Disconnected);
        debug!("connection: driver finished");
    }

    async fn run_session(
        &self,
        socket: &Arc<SocketConnection>,
        mut events: mpsc::UnboundedReceiver<SocketEvent>,
        backoff: &mut ReconnectBackoff,
        stop: &StopSignal,
    ) -> SessionEnd {
        loop {
            let next = tokio::time::timeout(self.config.health_check_timeout, events.recv()).await;
            if stop.requested() {
                return SessionEnd::Stopped;
            }
            match next {
                // Silence past the health window is a silent failure; the
                // transport close callback cannot be relied on.
                Err(_) => {
                    warn!(
                        timeout_ms = self.config.health_check_timeout.as_millis() as u64,
                        "connection: no events within health window, forcing close"
                    );
                    socket.cancel();
                    self.dispatch_error(&ChatError::network("health check timed out"));
                    return SessionEnd::Lost;
                }
                Ok(None) => return SessionEnd::Lost,
                Ok(Some(SocketEvent::Opened)) => continue,
                Ok(Some(SocketEvent::Message(event))) => {
                    match &event.kind {
                        EventKind::Connected { connection_id, .. } => {
                            info!(connection_id = %connection_id, "connection: established");
                            backoff.reset();
                            self.state.set(ConnectionState::Connected {
                                connection_id: connection_id.clone(),
                            });
                        }
                        EventKind::Health { .. } => {
                            // Ack the heartbeat so the server keeps the
                            // connection alive.
                            if let Err(error) = socket.send(&event).await {
                                debug!(%error, "connection: health ack failed");
                            }
                        }
                        _ => {}
                    }
                    self.dispatcher.dispatch(&event);
                }
                Ok(Some(SocketEvent::Failed(error))) => {
                    self.dispatch_error(&error);
                    if matches!(error, ChatError::Parse(_)) {
                        // Undecodable frame; connection itself is fine.
                        continue;
                    }
                    return SessionEnd::Lost;
                }
                Ok(Some(SocketEvent::Closing { .. })) => continue,
                Ok(Some(SocketEvent::Closed { reason })) => {
                    info!(reason = %reason, "connection: socket closed");
                    return if stop.requested() {
                        SessionEnd::Stopped
                    } else {
                        SessionEnd::Lost
                    };
                }
            }
        }
    }

    async fn backoff_wait(&self, backoff: &mut ReconnectBackoff, stop: &StopSignal) -> bool {
        if stop.requested() {
            return false;
        }
        let delay = backoff.next_delay();
        info!(
            delay_ms = delay.as_millis() as u64,
            attempt = backoff.attempt(),
            "connection: waiting before reconnect"
        );
        tokio::select! {
            _ = tokio::time::sleep(delay) => !stop.requested(),
            _ = stop.notify.notified() => false,
        }
    }

    fn dispatch_error(&self, error: &ChatError) {
        let event = ChatEvent::new(
            chrono::Utc::now(),
            EventKind::ConnectionError {
                error: match error {
                    ChatError::Server(api) => api.clone(),
                    other => ApiError::new(ErrorCode::Internal, other.to_string()),
                },
            },
        );
        self.dispatcher.dispatch(&event);
    }
}

fn lock(mutex: &Mutex<ControllerInner>) -> MutexGuard<'_, ControllerInner> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
#[path = "tests/connection_tests.rs"]
mod tests;
