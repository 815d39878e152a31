pub mod channel;
pub mod client;
pub mod global;
pub mod observable;
pub mod query;
pub mod registry;
pub mod thread;

pub use channel::{ChannelSnapshot, ChannelState};
pub use client::ClientState;
pub use global::{ErrorNotice, GlobalSnapshot, GlobalState};
pub use observable::ObservableValue;
pub use query::{QueryChannelsState, QuerySnapshot};
pub use registry::{QueryEntry, StateRegistry};
pub use thread::{ThreadSnapshot, ThreadState};
