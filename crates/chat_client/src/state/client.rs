use std::sync::Arc;

use shared::models::User;

use crate::connection::ConnectionState;
use crate::state::observable::ObservableValue;

/// Current user and connection snapshot.
///
/// The connection value is owned and mutated exclusively by the connection
/// controller; this container only hands out read access to it.
pub struct ClientState {
    user: ObservableValue<Option<User>>,
    initialized: ObservableValue<bool>,
    connection: Arc<ObservableValue<ConnectionState>>,
}

impl ClientState {
    pub fn new(connection: Arc<ObservableValue<ConnectionState>>) -> Self {
        Self {
            user: ObservableValue::new(None),
            initialized: ObservableValue::new(false),
            connection,
        }
    }

    pub fn user(&self) -> Option<User> {
        self.user.get().as_ref().clone()
    }

    pub fn set_user(&self, user: User) {
        self.user.set(Some(user));
    }

    pub fn clear_user(&self) {
        self.user.set(None);
        self.initialized.set(false);
    }

    /// True once the first connection acknowledgement has been received.
    pub fn initialized(&self) -> bool {
        *self.initialized.get()
    }

    pub fn mark_initialized(&self) {
        self.initialized.set(true);
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.get().as_ref().clone()
    }

    pub fn watch_connection(
        &self,
        watcher: impl Fn(&ConnectionState) + Send + Sync + 'static,
    ) -> u64 {
        self.connection.watch(watcher)
    }

    pub fn unwatch_connection(&self, id: u64) {
        self.connection.unwatch(id)
    }

    pub fn is_online(&self) -> bool {
        self.connection_state().is_connected()
    }
}
