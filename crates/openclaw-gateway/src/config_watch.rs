//! Config hot-reload.
//!
//! The live config is an immutable `Arc` behind a read-mostly lock; readers
//! clone the pointer, updates swap it. A `notify` watcher re-parses the file
//! on change: a valid non-empty diff swaps the value, emits `config.changed`
//! and runs registered reload callbacks; a validation failure keeps the old
//! value and emits `config.invalid` with the offending path.

use crate::event_bus::EventBus;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use openclaw_types::config::{changed_paths, load_config, Config};
use openclaw_types::error::{OpenClawError, OpenClawResult};
use openclaw_types::event::{Event, EventPayload};
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Shared handle to the current config value.
pub struct ConfigHandle {
    current: RwLock<Arc<Config>>,
    path: PathBuf,
}

impl ConfigHandle {
    pub fn new(config: Config, path: &Path) -> Self {
        Self {
            current: RwLock::new(Arc::new(config)),
            path: path.to_path_buf(),
        }
    }

    /// The live value. Cheap; callers hold the Arc for the operation's
    /// duration and never observe a partial update.
    pub fn get(&self) -> Arc<Config> {
        self.current.read().clone()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn swap(&self, config: Config) -> Arc<Config> {
        let new = Arc::new(config);
        let mut slot = self.current.write();
        let old = slot.clone();
        *slot = new;
        old
    }
}

/// Callback run after a successful reload: (new config, changed paths).
pub type ReloadCallback = Box<dyn Fn(&Config, &[String]) + Send + Sync>;

/// Validates, diffs, and applies config changes from disk or RPC.
pub struct ConfigReloader {
    handle: Arc<ConfigHandle>,
    bus: Arc<EventBus>,
    callbacks: RwLock<Vec<ReloadCallback>>,
}

impl ConfigReloader {
    pub fn new(handle: Arc<ConfigHandle>, bus: Arc<EventBus>) -> Self {
        Self {
            handle,
            bus,
            callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Register a live consumer updated on every applied change.
    pub fn on_reload(&self, callback: ReloadCallback) {
        self.callbacks.write().push(callback);
    }

    /// Re-read the config file and apply it. Returns the changed paths
    /// (empty when the file parsed identical).
    pub fn reload_from_disk(&self) -> OpenClawResult<Vec<String>> {
        match load_config(self.handle.path()) {
            Ok(new_config) => Ok(self.apply(new_config)),
            Err(e) => {
                let (path, message) = match &e {
                    OpenClawError::ConfigInvalid { path, message } => {
                        (path.clone(), message.clone())
                    }
                    other => (
                        self.handle.path().display().to_string(),
                        other.to_string(),
                    ),
                };
                warn!(%path, %message, "config reload rejected — previous config retained");
                self.bus
                    .publish(Event::new(EventPayload::ConfigInvalid { path, message }));
                Err(e)
            }
        }
    }

    /// Apply an already-validated config (the `config.update` RPC path)
    /// and persist it to disk.
    pub fn apply_update(&self, new_config: Config) -> OpenClawResult<Vec<String>> {
        new_config.validate()?;
        self.persist(&new_config)?;
        Ok(self.apply(new_config))
    }

    fn apply(&self, new_config: Config) -> Vec<String> {
        let old = self.handle.get();
        let paths = changed_paths(&old, &new_config);
        if paths.is_empty() {
            return paths;
        }
        self.handle.swap(new_config);
        let current = self.handle.get();
        info!(changed = ?paths, "config updated");
        self.bus.publish(Event::new(EventPayload::ConfigChanged {
            changed_paths: paths.clone(),
        }));
        for callback in self.callbacks.read().iter() {
            callback(&current, &paths);
        }
        paths
    }

    fn persist(&self, config: &Config) -> OpenClawResult<()> {
        let path = self.handle.path();
        let rendered = match path.extension().and_then(|e| e.to_str()) {
            Some("yaml") | Some("yml") => serde_yaml::to_string(config)
                .map_err(|e| OpenClawError::Internal(format!("render config: {e}")))?,
            _ => serde_json::to_string_pretty(config)?,
        };
        let tmp = path.with_extension("cfg.tmp");
        std::fs::write(&tmp, rendered.as_bytes())
            .map_err(|e| OpenClawError::StorageUnavailable(format!("write config: {e}")))?;
        std::fs::rename(&tmp, path)
            .map_err(|e| OpenClawError::StorageUnavailable(format!("rename config: {e}")))?;
        Ok(())
    }

    /// Watch the config file and reload on change. Runs until the process
    /// exits; debounces bursts of filesystem events.
    pub async fn watch(self: Arc<Self>) {
        let (tx, mut rx) = mpsc::channel::<()>(8);
        let path = self.handle.path().to_path_buf();

        let mut watcher: RecommendedWatcher = match notify::recommended_watcher(
            move |result: Result<notify::Event, notify::Error>| {
                if result.is_ok() {
                    let _ = tx.try_send(());
                }
            },
        ) {
            Ok(watcher) => watcher,
            Err(e) => {
                warn!(error = %e, "config watcher unavailable — hot-reload disabled");
                return;
            }
        };
        if let Err(e) = watcher.watch(&path, RecursiveMode::NonRecursive) {
            warn!(error = %e, path = %path.display(), "cannot watch config file");
            return;
        }
        info!(path = %path.display(), "watching config for changes");

        while rx.recv().await.is_some() {
            // Editors produce bursts; settle before reloading.
            tokio::time::sleep(Duration::from_millis(200)).await;
            while rx.try_recv().is_ok() {}
            let _ = self.reload_from_disk();
        }
    }
}
