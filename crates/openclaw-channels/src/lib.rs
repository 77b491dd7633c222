//! Channel adapter interface.
//!
//! Adapters normalise provider-specific messages into [`InboundMessage`]s
//! keyed by session, and deliver outbound replies. Concrete bit-formats are
//! external; this crate defines the contract, the DM gating policy, and the
//! health reporting surface every adapter shares.

pub mod gating;
pub mod health;
pub mod types;

pub use gating::{DmGate, GateDecision};
pub use health::{HealthRegistry, HealthReport};
pub use types::{split_message, Attachment, ChannelAdapter, InboundMessage, OutboundContent};
