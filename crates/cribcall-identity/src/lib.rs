//! Device identity and pinned trust persistence.
//!
//! Each device owns a P-256 key pair and a self-signed X.509 certificate that
//! acts as its own trust anchor: peers pin its SHA-256 fingerprint after
//! pairing. [`DeviceIdentity`] manages the key material lifecycle;
//! [`TrustStore`] persists the set of pinned peers per role.

pub mod identity;
pub mod store;
pub mod tls;

pub use identity::{DeviceIdentity, IdentityError};
pub use store::TrustStore;
pub use tls::{PinnedServerVerifier, TlsAcceptance};
