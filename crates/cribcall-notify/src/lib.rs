//! Noise fan-out: live WebSocket broadcast, push relay for offline
//! listeners, and mTLS webhooks.

pub mod dispatcher;
pub mod push;
pub mod webhook;

pub use dispatcher::{DispatcherConfig, EventDispatcher};
pub use push::{PushRelaySender, PushRequest, PushResponse};
pub use webhook::{WebhookEndpoint, WebhookEvent, WebhookSender};
