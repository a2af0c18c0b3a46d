//! Pinned-mTLS control plane: HTTP endpoints, the framed WebSocket channel,
//! the noise-subscription registry, and the client that talks to all of it.
//!
//! # Architecture
//!
//! ```text
//! Listener                              Monitor (this crate's server)
//! ───────────────────────────           ─────────────────────────────────
//! ControlClient ──mTLS:48080──►  ControlServer ──► ControlServerEvent channel
//!   GET  /health                   │
//!   POST /unpair                   ├─ TrustStore (fingerprint gate)
//!   POST /noise/subscribe          ├─ NoiseSubscriptionRegistry
//!   POST /noise/unsubscribe        └─ per-connection outbound queues
//!   GET  /control/ws  ──101──►       framed ControlMessage duplex
//! ```
//!
//! The wire is HTTP/1.1 with JSON bodies plus an RFC 6455 upgrade on
//! `/control/ws`; post-upgrade frames are text JSON or u32-BE length-prefixed
//! binary JSON batches, both accepted.

pub mod client;
pub mod http;
pub mod messages;
pub mod queue;
pub mod server;
pub mod subscriptions;
pub mod ws;

pub use client::{ControlClient, ControlStream, HealthReport};
pub use messages::{ControlMessage, StreamType};
pub use server::{ControlServer, ControlServerContext, ControlServerEvent, ControlServerHandle};
pub use subscriptions::NoiseSubscriptionRegistry;
