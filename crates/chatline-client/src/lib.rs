//! Client-side connection driver for the chatline gateway.
//!
//! [`GatewayClient`] owns the WebSocket and its reconnect loop,
//! [`MessageView`] folds live events and history pages into one ordered
//! conversation, and [`ApiClient`] fetches that history.

pub mod api;
pub mod driver;
pub mod reconnect;
pub mod view;

pub use api::ApiClient;
pub use driver::{DriverConfig, DriverEvent, GatewayClient};
pub use reconnect::{ReconnectPolicy, Reconnector};
pub use view::{Conversation, MessageView};
