pub mod connection;
pub mod dispatch;
pub mod error;
pub mod notify;
pub mod registry;
pub mod session;
pub mod store;

pub use dispatch::MessageDispatcher;
pub use notify::Notifier;
pub use registry::{ChannelRegistry, ConnectionHandle, Registration};
pub use store::MessageStore;
