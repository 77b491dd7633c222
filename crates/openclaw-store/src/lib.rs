//! Durable state for the OpenClaw gateway.
//!
//! Three concerns live here: the append-only session store (JSONL logs with
//! an in-memory token-bounded cache), the device identity keypair, and
//! single-use pairing tokens.

pub mod cache;
pub mod identity;
pub mod pairing;
pub mod session_store;

pub use identity::DeviceIdentity;
pub use pairing::{PairingRegistry, Role};
pub use session_store::{SessionSnapshot, SessionStore};
