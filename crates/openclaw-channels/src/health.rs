//! Adapter health reporting.
//!
//! Adapters produce [`HealthReport`] snapshots; the gateway polls the
//! registry on an interval and publishes `channel.health` events.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// One adapter's liveness snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub channel: String,
    pub healthy: bool,
    pub detail: String,
    pub last_inbound: Option<DateTime<Utc>>,
}

impl HealthReport {
    pub fn healthy(channel: &str) -> Self {
        Self {
            channel: channel.to_string(),
            healthy: true,
            detail: "ok".to_string(),
            last_inbound: None,
        }
    }

    pub fn unhealthy(channel: &str, detail: &str) -> Self {
        Self {
            channel: channel.to_string(),
            healthy: false,
            detail: detail.to_string(),
            last_inbound: None,
        }
    }
}

/// Latest report per channel.
#[derive(Default)]
pub struct HealthRegistry {
    reports: DashMap<String, HealthReport>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, report: HealthReport) {
        self.reports.insert(report.channel.clone(), report);
    }

    /// Note inbound activity for a channel (keeps `last_inbound` fresh).
    pub fn touch_inbound(&self, channel: &str) {
        let mut entry = self
            .reports
            .entry(channel.to_string())
            .or_insert_with(|| HealthReport::healthy(channel));
        entry.last_inbound = Some(Utc::now());
    }

    pub fn report(&self, channel: &str) -> Option<HealthReport> {
        self.reports.get(channel).map(|r| r.clone())
    }

    pub fn all(&self) -> Vec<HealthReport> {
        let mut reports: Vec<HealthReport> =
            self.reports.iter().map(|r| r.value().clone()).collect();
        reports.sort_by(|a, b| a.channel.cmp(&b.channel));
        reports
    }
}
