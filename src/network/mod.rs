//! Network fan-out to subscribers.

pub mod broadcaster;
pub mod protocol;
pub mod subscriber;

pub use broadcaster::{Broadcaster, BroadcasterConfig, ClientEvent};
pub use protocol::{ClientMessage, ServerMessage, CLOSE_ABNORMAL, CLOSE_NORMAL, CLOSE_PROTOCOL};
pub use subscriber::SubscriberDescriptor;
