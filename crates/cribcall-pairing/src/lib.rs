//! PIN-based PAKE pairing.
//!
//! Trust bootstrap between a monitor and a listener that have never met:
//! an ephemeral X25519 exchange mixed with a short displayed PIN through
//! HKDF, verified by an HMAC over a canonical transcript binding both device
//! identities, and double-checked by two humans comparing a 6-digit code
//! derived from the transcript hash. The monitor's trust decision gates on
//! explicit user confirmation.
//!
//! ```text
//! Listener                                   Monitor
//! ─────────────────────────                  ──────────────────────────────
//! PIN_PAIRING_INIT ───────────────────────►  create session, show PIN
//!                  ◄─────────── PIN_REQUIRED (pakeMsgA, 60 s, 3 attempts)
//! derive key from PIN + ECDH
//! PIN_SUBMIT (pakeMsgB, transcript, tag) ─►  verify tag, show code, wait
//!                  ◄─────────── PAIR_ACCEPTED | PAIR_REJECTED(reason)
//! pin monitor cert                            pin listener cert
//! ```

pub mod client;
pub mod messages;
pub mod server;
pub mod session;

pub use client::{PairingClient, PairingOutcome};
pub use messages::{PairingMessage, RejectReason, Transcript};
pub use server::PairingServer;
pub use session::{PairingEngine, PairingPrompt};
