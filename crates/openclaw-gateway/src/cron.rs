//! Scheduled session wakeups.
//!
//! Jobs target a session key with a wakeup message and fire as ordinary
//! `agent.invoke`s on the session's lane. The scheduler keeps jobs in a
//! `DashMap`, persists them to `cron_jobs.json` via atomic write, and is
//! polled by the gateway tick loop for due jobs.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use openclaw_types::error::{OpenClawError, OpenClawResult};
use openclaw_types::session::SessionKey;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::{debug, info, warn};

/// Maximum consecutive errors before a job is auto-disabled.
const MAX_CONSECUTIVE_ERRORS: u32 = 5;

/// When a job fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Schedule {
    /// Fire once at a fixed instant.
    At { at: DateTime<Utc> },
    /// Fire every `every_secs` seconds.
    Every { every_secs: u64 },
    /// Standard 5-field (or 6-field) cron expression.
    Cron { expr: String },
}

/// One scheduled wakeup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WakeupJob {
    pub id: String,
    pub session_key: SessionKey,
    pub name: String,
    /// The message injected into the session when the job fires.
    pub text: String,
    pub schedule: Schedule,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: Option<DateTime<Utc>>,
}

/// Runtime metadata the scheduler tracks beyond the job definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobMeta {
    pub job: WakeupJob,
    /// Remove after a single successful execution.
    pub one_shot: bool,
    pub last_status: Option<String>,
    pub consecutive_errors: u32,
}

impl JobMeta {
    fn new(job: WakeupJob, one_shot: bool) -> Self {
        Self {
            job,
            one_shot,
            last_status: None,
            consecutive_errors: 0,
        }
    }
}

/// The wakeup scheduler.
pub struct WakeupScheduler {
    jobs: DashMap<String, JobMeta>,
    persist_path: PathBuf,
    max_jobs: AtomicUsize,
}

impl WakeupScheduler {
    pub fn new(workspace: &Path, max_jobs: usize) -> Self {
        Self {
            jobs: DashMap::new(),
            persist_path: workspace.join("cron_jobs.json"),
            max_jobs: AtomicUsize::new(max_jobs),
        }
    }

    /// Update the job cap (hot-reload).
    pub fn set_max_jobs(&self, max: usize) {
        self.max_jobs.store(max, Ordering::Relaxed);
    }

    // -- persistence --------------------------------------------------------

    /// Load persisted jobs. Missing file is not an error.
    pub fn load(&self) -> OpenClawResult<usize> {
        if !self.persist_path.exists() {
            return Ok(0);
        }
        let text = std::fs::read_to_string(&self.persist_path)
            .map_err(|e| OpenClawError::StorageUnavailable(format!("read cron jobs: {e}")))?;
        let metas: Vec<JobMeta> = serde_json::from_str(&text)?;
        let count = metas.len();
        for meta in metas {
            self.jobs.insert(meta.job.id.clone(), meta);
        }
        info!(count, "loaded cron jobs");
        Ok(count)
    }

    /// Persist all jobs via atomic write.
    pub fn persist(&self) -> OpenClawResult<()> {
        let metas: Vec<JobMeta> = self.jobs.iter().map(|r| r.value().clone()).collect();
        let data = serde_json::to_string_pretty(&metas)?;
        let tmp = self.persist_path.with_extension("json.tmp");
        std::fs::write(&tmp, data.as_bytes())
            .map_err(|e| OpenClawError::StorageUnavailable(format!("write cron jobs: {e}")))?;
        std::fs::rename(&tmp, &self.persist_path)
            .map_err(|e| OpenClawError::StorageUnavailable(format!("rename cron jobs: {e}")))?;
        debug!(count = metas.len(), "persisted cron jobs");
        Ok(())
    }

    // -- CRUD ---------------------------------------------------------------

    /// Add a job; computes its initial `next_run`.
    pub fn add_job(
        &self,
        session_key: SessionKey,
        name: &str,
        text: &str,
        schedule: Schedule,
        one_shot: bool,
    ) -> OpenClawResult<String> {
        if self.jobs.len() >= self.max_jobs.load(Ordering::Relaxed) {
            return Err(OpenClawError::BadRequest(format!(
                "cron job limit reached ({})",
                self.max_jobs.load(Ordering::Relaxed)
            )));
        }
        if name.is_empty() {
            return Err(OpenClawError::BadRequest("job name must not be empty".into()));
        }
        if text.is_empty() {
            return Err(OpenClawError::BadRequest("job text must not be empty".into()));
        }
        if let Schedule::Cron { expr } = &schedule {
            if parse_cron(expr).is_none() {
                return Err(OpenClawError::BadRequest(format!(
                    "invalid cron expression `{expr}`"
                )));
            }
        }

        let job = WakeupJob {
            id: format!("cron-{}", uuid::Uuid::new_v4()),
            session_key,
            name: name.to_string(),
            text: text.to_string(),
            next_run: Some(compute_next_run(&schedule)),
            schedule,
            enabled: true,
            created_at: Utc::now(),
            last_run: None,
        };
        let id = job.id.clone();
        self.jobs.insert(id.clone(), JobMeta::new(job, one_shot));
        self.persist()?;
        Ok(id)
    }

    /// Remove a job by id, returning it.
    pub fn remove_job(&self, id: &str) -> OpenClawResult<WakeupJob> {
        let removed = self
            .jobs
            .remove(id)
            .map(|(_, meta)| meta.job)
            .ok_or_else(|| OpenClawError::BadRequest(format!("cron job {id} not found")))?;
        self.persist()?;
        Ok(removed)
    }

    /// Enable or disable. Re-enabling resets errors and recomputes next_run.
    pub fn set_enabled(&self, id: &str, enabled: bool) -> OpenClawResult<()> {
        let mut meta = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| OpenClawError::BadRequest(format!("cron job {id} not found")))?;
        meta.job.enabled = enabled;
        if enabled {
            meta.consecutive_errors = 0;
            meta.job.next_run = Some(compute_next_run(&meta.job.schedule));
        }
        Ok(())
    }

    // -- queries ------------------------------------------------------------

    pub fn get(&self, id: &str) -> Option<JobMeta> {
        self.jobs.get(id).map(|r| r.value().clone())
    }

    pub fn list(&self) -> Vec<WakeupJob> {
        let mut jobs: Vec<WakeupJob> = self.jobs.iter().map(|r| r.value().job.clone()).collect();
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        jobs
    }

    pub fn total_jobs(&self) -> usize {
        self.jobs.len()
    }

    /// Enabled jobs whose `next_run` is due.
    pub fn due_jobs(&self) -> Vec<WakeupJob> {
        let now = Utc::now();
        self.jobs
            .iter()
            .filter(|r| {
                let meta = r.value();
                meta.job.enabled && meta.job.next_run.map(|t| t <= now).unwrap_or(false)
            })
            .map(|r| r.value().job.clone())
            .collect()
    }

    // -- outcome recording --------------------------------------------------

    /// Mark a job as fired so the tick loop doesn't re-queue it while its
    /// turn is still running. One-shot jobs park until the outcome lands.
    pub fn mark_fired(&self, id: &str) {
        if let Some(mut meta) = self.jobs.get_mut(id) {
            meta.job.last_run = Some(Utc::now());
            meta.job.next_run = if meta.one_shot {
                None
            } else {
                Some(compute_next_run(&meta.job.schedule))
            };
        }
    }

    /// Record success: one-shot jobs are removed, recurring jobs advance.
    pub fn record_success(&self, id: &str) {
        let should_remove = {
            let Some(mut meta) = self.jobs.get_mut(id) else {
                return;
            };
            meta.job.last_run = Some(Utc::now());
            meta.last_status = Some("ok".to_string());
            meta.consecutive_errors = 0;
            if meta.one_shot {
                true
            } else {
                meta.job.next_run = Some(compute_next_run(&meta.job.schedule));
                false
            }
        };
        if should_remove {
            self.jobs.remove(id);
        }
        let _ = self.persist();
    }

    /// Record failure; repeated failures auto-disable the job.
    pub fn record_failure(&self, id: &str, error_msg: &str) {
        if let Some(mut meta) = self.jobs.get_mut(id) {
            meta.job.last_run = Some(Utc::now());
            let truncated: String = error_msg.chars().take(256).collect();
            meta.last_status = Some(format!("error: {truncated}"));
            meta.consecutive_errors += 1;
            if meta.consecutive_errors >= MAX_CONSECUTIVE_ERRORS {
                warn!(
                    job = %id,
                    errors = meta.consecutive_errors,
                    "auto-disabling cron job after repeated failures"
                );
                meta.job.enabled = false;
            } else {
                meta.job.next_run = Some(compute_next_run(&meta.job.schedule));
            }
        }
        let _ = self.persist();
    }
}

// ---------------------------------------------------------------------------
// Next-run computation
// ---------------------------------------------------------------------------

/// Compute the next fire time for a schedule.
///
/// Standard 5-field (`min hour dom month dow`) and 6-field expressions are
/// converted to the 7-field format the `cron` crate expects.
pub fn compute_next_run(schedule: &Schedule) -> DateTime<Utc> {
    match schedule {
        Schedule::At { at } => *at,
        Schedule::Every { every_secs } => Utc::now() + Duration::seconds(*every_secs as i64),
        Schedule::Cron { expr } => match parse_cron(expr) {
            Some(parsed) => parsed
                .upcoming(Utc)
                .next()
                .unwrap_or_else(|| Utc::now() + Duration::hours(1)),
            None => {
                warn!("invalid cron expression `{expr}` — deferring one hour");
                Utc::now() + Duration::hours(1)
            }
        },
    }
}

fn parse_cron(expr: &str) -> Option<cron::Schedule> {
    let trimmed = expr.trim();
    let fields = trimmed.split_whitespace().count();
    let seven_field = match fields {
        5 => format!("0 {trimmed} *"),
        6 => format!("{trimmed} *"),
        _ => trimmed.to_string(),
    };
    seven_field.parse::<cron::Schedule>().ok()
}
