//! OpenClaw gateway — the WebSocket control plane.
//!
//! Assembles the session store, agent runtime, event bus, lane scheduler,
//! cron wakeups, and channel adapters behind a challenge-response
//! authenticated RPC endpoint.

pub mod auth;
pub mod config_watch;
pub mod cron;
pub mod event_bus;
pub mod gateway;
pub mod lanes;
pub mod rpc;
pub mod server;

pub use auth::{Authenticator, NodeDirectory, Principal};
pub use config_watch::{ConfigHandle, ConfigReloader};
pub use cron::{Schedule, WakeupScheduler};
pub use event_bus::EventBus;
pub use gateway::{ControlPlane, InvokeOrigin};
pub use lanes::{LanePermit, LaneScheduler};
pub use rpc::NodeLinks;
pub use server::{bind_listener, serve, ServerState};
