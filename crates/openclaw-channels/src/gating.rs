//! DM gating — who gets through to the agent.
//!
//! Every adapter consults its channel's `dmPolicy` before routing an inbound
//! DM. Under `pairing` (the default) an unknown sender receives exactly one
//! pairing challenge and is ignored until paired. `open` requires an
//! explicit `"*"` allowlist entry to pass unknowns. `closed` drops unknowns
//! silently.

use dashmap::DashSet;
use openclaw_types::config::{ChannelConfig, DmPolicy};
use tracing::debug;

/// What to do with an inbound DM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateDecision {
    /// Route to the agent.
    Pass,
    /// Reply with a pairing challenge, then ignore until paired.
    Challenge,
    /// Ignore silently.
    Drop,
}

/// Per-channel gate state.
pub struct DmGate {
    policy: DmPolicy,
    allowlist: Vec<String>,
    paired: DashSet<String>,
    challenged: DashSet<String>,
}

impl DmGate {
    pub fn new(config: &ChannelConfig) -> Self {
        Self {
            policy: config.dm_policy,
            allowlist: config.allowlist.clone(),
            paired: DashSet::new(),
            challenged: DashSet::new(),
        }
    }

    /// Known senders are allowlisted explicitly or previously paired.
    fn is_known(&self, sender_id: &str) -> bool {
        self.paired.contains(sender_id) || self.allowlist.iter().any(|a| a == sender_id)
    }

    /// Evaluate one inbound DM from `sender_id`.
    pub fn evaluate(&self, sender_id: &str) -> GateDecision {
        if self.is_known(sender_id) {
            return GateDecision::Pass;
        }
        match self.policy {
            DmPolicy::Pairing => {
                if self.challenged.insert(sender_id.to_string()) {
                    debug!(sender = sender_id, "unknown sender — issuing pairing challenge");
                    GateDecision::Challenge
                } else {
                    GateDecision::Drop
                }
            }
            DmPolicy::Open => {
                if self.allowlist.iter().any(|a| a == "*") {
                    GateDecision::Pass
                } else {
                    GateDecision::Drop
                }
            }
            DmPolicy::Closed => GateDecision::Drop,
        }
    }

    /// Record a successful pairing; the sender passes from now on.
    pub fn mark_paired(&self, sender_id: &str) {
        self.paired.insert(sender_id.to_string());
        self.challenged.remove(sender_id);
    }

    pub fn paired_count(&self) -> usize {
        self.paired.len()
    }
}
