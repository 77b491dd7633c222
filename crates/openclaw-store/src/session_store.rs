//! Append-only session store.
//!
//! One JSONL file per session under `<workspace>/sessions/`, one entry per
//! line, never rewritten. Sequence numbers are dense and gap-free; a gap or
//! unparseable line found during load marks the key corrupted and the store
//! refuses further writes to it until [`SessionStore::clear_poison`].
//!
//! Writers are serialised per key. Readers get cheap `Arc` snapshots that
//! are always equal to the fold of the persisted log.

use crate::cache::{TokenLru, DEFAULT_CACHE_TOKENS};
use dashmap::DashMap;
use openclaw_types::error::{OpenClawError, OpenClawResult};
use openclaw_types::estimate::estimate_entry_tokens;
use openclaw_types::session::{EntryPayload, HistoryEntry, SessionKey, SessionMetadata};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Immutable view of one session: history plus folded metadata.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub key: SessionKey,
    pub history: Vec<HistoryEntry>,
    pub metadata: SessionMetadata,
    /// Sequence the next append will receive.
    pub next_seq: u64,
    /// Estimated history tokens, used for cache accounting.
    pub estimated_tokens: u64,
}

impl SessionSnapshot {
    fn empty(key: SessionKey) -> Self {
        Self {
            key,
            history: Vec::new(),
            metadata: SessionMetadata::default(),
            next_seq: 1,
            estimated_tokens: 0,
        }
    }

    /// Fold one appended entry into a new snapshot.
    fn with_entry(&self, entry: HistoryEntry) -> Self {
        let mut next = self.clone();
        next.estimated_tokens += estimate_entry_tokens(&entry);
        next.next_seq = entry.seq + 1;
        next.metadata.last_active = Some(entry.timestamp);
        match &entry.payload {
            EntryPayload::Assistant { usage, .. } => {
                next.metadata.token_counters.add(usage);
            }
            EntryPayload::Summary { .. } => {
                next.metadata.summary_seq = Some(entry.seq);
            }
            _ => {}
        }
        next.history.push(entry);
        next
    }
}

struct Slot {
    /// Serialises appends per key; also guards snapshot (re)loads.
    writer: tokio::sync::Mutex<()>,
    snapshot: parking_lot::RwLock<Option<Arc<SessionSnapshot>>>,
    poisoned: AtomicBool,
}

impl Slot {
    fn new() -> Self {
        Self {
            writer: tokio::sync::Mutex::new(()),
            snapshot: parking_lot::RwLock::new(None),
            poisoned: AtomicBool::new(false),
        }
    }
}

/// Append-only durable log per session, with an in-memory LRU cache bounded
/// by total estimated tokens.
pub struct SessionStore {
    sessions_dir: PathBuf,
    slots: DashMap<SessionKey, Arc<Slot>>,
    cache: TokenLru,
}

impl SessionStore {
    /// Open (creating if needed) the store under a workspace root.
    pub fn open(workspace: &Path) -> OpenClawResult<Self> {
        Self::open_with_cache(workspace, DEFAULT_CACHE_TOKENS)
    }

    /// Open with an explicit cache budget (tests use small budgets).
    pub fn open_with_cache(workspace: &Path, cache_tokens: u64) -> OpenClawResult<Self> {
        let sessions_dir = workspace.join("sessions");
        std::fs::create_dir_all(&sessions_dir)
            .map_err(|e| OpenClawError::StorageUnavailable(format!("create sessions dir: {e}")))?;
        Ok(Self {
            sessions_dir,
            slots: DashMap::new(),
            cache: TokenLru::new(cache_tokens),
        })
    }

    fn session_path(&self, key: &SessionKey) -> PathBuf {
        self.sessions_dir.join(format!("{}.jsonl", key.storage_name()))
    }

    fn slot(&self, key: &SessionKey) -> Arc<Slot> {
        self.slots
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Slot::new()))
            .clone()
    }

    /// Append one entry. Assigns the next dense sequence number, makes it
    /// durable, publishes a new snapshot, and returns the assigned sequence.
    pub async fn append(&self, key: &SessionKey, entry: HistoryEntry) -> OpenClawResult<u64> {
        let slot = self.slot(key);
        let _guard = slot.writer.lock().await;

        if slot.poisoned.load(Ordering::Acquire) {
            return Err(OpenClawError::SessionCorrupted {
                key: key.to_string(),
                detail: "writes refused until operator intervention".to_string(),
            });
        }

        let current = match self.resident_or_load(key, &slot) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.poison(key, &slot);
                return Err(e);
            }
        };

        let mut entry = entry;
        entry.seq = current.next_seq;

        let line = serde_json::to_string(&entry)?;
        let path = self.session_path(key);
        let write_result = (|| -> std::io::Result<()> {
            let mut file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)?;
            writeln!(file, "{line}")?;
            file.sync_all()
        })();
        write_result.map_err(|e| OpenClawError::StorageUnavailable(format!("append: {e}")))?;

        let seq = entry.seq;
        let next = Arc::new(current.with_entry(entry));
        let weight = next.estimated_tokens;
        *slot.snapshot.write() = Some(next);
        self.evict(self.cache.touch(key, weight));

        debug!(session = %key, seq, "appended entry");
        Ok(seq)
    }

    /// Entries in order, optionally from a sequence and with a limit.
    pub async fn load(
        &self,
        key: &SessionKey,
        from_seq: Option<u64>,
        limit: Option<usize>,
    ) -> OpenClawResult<Vec<HistoryEntry>> {
        let snapshot = self.snapshot(key).await?;
        let from = from_seq.unwrap_or(0);
        let iter = snapshot
            .history
            .iter()
            .filter(|e| e.seq >= from)
            .cloned();
        Ok(match limit {
            Some(n) => iter.take(n).collect(),
            None => iter.collect(),
        })
    }

    /// The in-memory cached representation, loading from disk on a miss.
    pub async fn snapshot(&self, key: &SessionKey) -> OpenClawResult<Arc<SessionSnapshot>> {
        let slot = self.slot(key);
        if let Some(snapshot) = slot.snapshot.read().clone() {
            self.evict(self.cache.touch(key, snapshot.estimated_tokens));
            return Ok(snapshot);
        }
        // Take the writer lock so a concurrent append doesn't race the load.
        let _guard = slot.writer.lock().await;
        match self.resident_or_load(key, &slot) {
            Ok(snapshot) => {
                self.evict(self.cache.touch(key, snapshot.estimated_tokens));
                Ok(snapshot)
            }
            Err(e) => {
                self.poison(key, &slot);
                Err(e)
            }
        }
    }

    /// Keys with a log file on disk.
    pub fn list_keys(&self) -> OpenClawResult<Vec<SessionKey>> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.sessions_dir)
            .map_err(|e| OpenClawError::StorageUnavailable(e.to_string()))?
        {
            let entry = entry.map_err(|e| OpenClawError::StorageUnavailable(e.to_string()))?;
            let name = entry.file_name();
            let Some(stem) = name.to_str().and_then(|n| n.strip_suffix(".jsonl")) else {
                continue;
            };
            match unescape_storage_name(stem).and_then(|raw| raw.parse::<SessionKey>().ok()) {
                Some(key) => keys.push(key),
                None => warn!(file = %name.to_string_lossy(), "skipping unrecognised session file"),
            }
        }
        keys.sort_by_key(|k| k.to_string());
        Ok(keys)
    }

    /// Whether writes to this key are currently refused.
    pub fn is_poisoned(&self, key: &SessionKey) -> bool {
        self.slots
            .get(key)
            .map(|s| s.poisoned.load(Ordering::Acquire))
            .unwrap_or(false)
    }

    /// Operator intervention: accept writes again and reload from disk on
    /// next access. The log itself is never rewritten by the store.
    pub fn clear_poison(&self, key: &SessionKey) {
        if let Some(slot) = self.slots.get(key) {
            slot.poisoned.store(false, Ordering::Release);
            *slot.snapshot.write() = None;
        }
        self.cache.forget(key);
    }

    // -- internals ----------------------------------------------------------

    /// Snapshot already resident, or fold the log from disk. Caller must
    /// hold the slot's writer lock.
    fn resident_or_load(
        &self,
        key: &SessionKey,
        slot: &Slot,
    ) -> OpenClawResult<Arc<SessionSnapshot>> {
        if let Some(snapshot) = slot.snapshot.read().clone() {
            return Ok(snapshot);
        }
        let snapshot = Arc::new(self.load_from_disk(key)?);
        *slot.snapshot.write() = Some(snapshot.clone());
        Ok(snapshot)
    }

    fn load_from_disk(&self, key: &SessionKey) -> OpenClawResult<SessionSnapshot> {
        let path = self.session_path(key);
        if !path.exists() {
            return Ok(SessionSnapshot::empty(key.clone()));
        }
        let text = std::fs::read_to_string(&path)
            .map_err(|e| OpenClawError::StorageUnavailable(format!("read {key}: {e}")))?;

        let mut snapshot = SessionSnapshot::empty(key.clone());
        for (line_no, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: HistoryEntry =
                serde_json::from_str(line).map_err(|e| OpenClawError::SessionCorrupted {
                    key: key.to_string(),
                    detail: format!("line {}: {e}", line_no + 1),
                })?;
            if entry.seq != snapshot.next_seq {
                return Err(OpenClawError::SessionCorrupted {
                    key: key.to_string(),
                    detail: format!(
                        "sequence gap at line {}: expected {}, found {}",
                        line_no + 1,
                        snapshot.next_seq,
                        entry.seq
                    ),
                });
            }
            snapshot = snapshot.with_entry(entry);
        }
        Ok(snapshot)
    }

    fn poison(&self, key: &SessionKey, slot: &Slot) {
        warn!(session = %key, "session log corrupted — refusing further writes");
        slot.poisoned.store(true, Ordering::Release);
        *slot.snapshot.write() = None;
        self.cache.forget(key);
    }

    fn evict(&self, victims: Vec<SessionKey>) {
        for victim in victims {
            if let Some(slot) = self.slots.get(&victim) {
                *slot.snapshot.write() = None;
                debug!(session = %victim, "evicted session snapshot from cache");
            }
        }
    }
}

/// Inverse of [`SessionKey::storage_name`].
fn unescape_storage_name(name: &str) -> Option<String> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let hex = name.get(i + 1..i + 3)?;
            out.push(u8::from_str_radix(hex, 16).ok()?);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use openclaw_types::session::{StopReason, TokenUsage};

    fn key() -> SessionKey {
        "agent:main:telegram:dm:u42".parse().unwrap()
    }

    fn user(text: &str) -> HistoryEntry {
        HistoryEntry::new(EntryPayload::User {
            text: text.into(),
            sender_id: None,
        })
    }

    fn assistant(text: &str) -> HistoryEntry {
        HistoryEntry::new(EntryPayload::Assistant {
            text: text.into(),
            stop_reason: StopReason::EndTurn,
            usage: TokenUsage {
                input_tokens: 10,
                output_tokens: 5,
            },
        })
    }

    #[tokio::test]
    async fn test_append_then_load_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::open(tmp.path()).unwrap();

        let s1 = store.append(&key(), user("hi")).await.unwrap();
        let s2 = store.append(&key(), assistant("hello!")).await.unwrap();
        assert_eq!((s1, s2), (1, 2));

        let entries = store.load(&key(), None, None).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].seq, 1);
        assert_eq!(entries[0].kind(), "user");
        assert_eq!(entries[1].kind(), "assistant");
    }

    #[tokio::test]
    async fn test_snapshot_equals_fold_of_log() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = SessionStore::open(tmp.path()).unwrap();
            store.append(&key(), user("one")).await.unwrap();
            store.append(&key(), assistant("two")).await.unwrap();
            store.append(&key(), user("three")).await.unwrap();
        }
        // Fresh store: snapshot must be rebuilt purely from the log.
        let store = SessionStore::open(tmp.path()).unwrap();
        let snapshot = store.snapshot(&key()).await.unwrap();
        assert_eq!(snapshot.history.len(), 3);
        assert_eq!(snapshot.next_seq, 4);
        assert_eq!(snapshot.metadata.token_counters.total(), 15);
        assert!(snapshot.metadata.last_active.is_some());
    }

    #[tokio::test]
    async fn test_load_from_seq_and_limit() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::open(tmp.path()).unwrap();
        for i in 0..5 {
            store.append(&key(), user(&format!("m{i}"))).await.unwrap();
        }
        let entries = store.load(&key(), Some(3), Some(2)).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].seq, 3);
        assert_eq!(entries[1].seq, 4);
    }

    #[tokio::test]
    async fn test_gap_detection_poisons_key() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::open(tmp.path()).unwrap();
        store.append(&key(), user("ok")).await.unwrap();

        // Corrupt the log: append a line with a skipped sequence number.
        let path = tmp
            .path()
            .join("sessions")
            .join(format!("{}.jsonl", key().storage_name()));
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        let rogue = serde_json::to_string(&HistoryEntry {
            seq: 5,
            ..user("gap")
        })
        .unwrap();
        writeln!(file, "{rogue}").unwrap();

        let store = SessionStore::open(tmp.path()).unwrap();
        let err = store.snapshot(&key()).await.unwrap_err();
        assert!(matches!(err, OpenClawError::SessionCorrupted { .. }));
        assert!(store.is_poisoned(&key()));

        // Writes refused until operator intervention.
        let err = store.append(&key(), user("nope")).await.unwrap_err();
        assert!(matches!(err, OpenClawError::SessionCorrupted { .. }));
    }

    #[tokio::test]
    async fn test_clear_poison_restores_writes_after_repair() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::open(tmp.path()).unwrap();
        store.append(&key(), user("ok")).await.unwrap();

        let path = tmp
            .path()
            .join("sessions")
            .join(format!("{}.jsonl", key().storage_name()));
        let good = std::fs::read_to_string(&path).unwrap();
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "not json").unwrap();
        drop(file);

        assert!(store.snapshot(&key()).await.is_err());
        assert!(store.is_poisoned(&key()));

        // Operator repairs the file out of band, then clears the poison.
        std::fs::write(&path, good).unwrap();
        store.clear_poison(&key());
        let seq = store.append(&key(), user("back")).await.unwrap();
        assert_eq!(seq, 2);
    }

    #[tokio::test]
    async fn test_cache_eviction_reloads_from_disk() {
        let tmp = tempfile::tempdir().unwrap();
        // Tiny budget: each session is ~ a few tokens, so the second touch
        // evicts the first.
        let store = SessionStore::open_with_cache(tmp.path(), 10).unwrap();
        let k1: SessionKey = "agent:main:telegram:dm:u1".parse().unwrap();
        let k2: SessionKey = "agent:main:telegram:dm:u2".parse().unwrap();

        store.append(&k1, user("first session")).await.unwrap();
        store.append(&k2, user("second session")).await.unwrap();

        // k1 was evicted but must reload transparently and identically.
        let snapshot = store.snapshot(&k1).await.unwrap();
        assert_eq!(snapshot.history.len(), 1);
        assert_eq!(snapshot.next_seq, 2);
    }

    #[tokio::test]
    async fn test_list_keys() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::open(tmp.path()).unwrap();
        let k1: SessionKey = "agent:main:telegram:dm:u1".parse().unwrap();
        let k2: SessionKey = "agent:sub:discord:group:g9:thread:2".parse().unwrap();
        store.append(&k1, user("a")).await.unwrap();
        store.append(&k2, user("b")).await.unwrap();

        let keys = store.list_keys().unwrap();
        assert_eq!(keys.len(), 2);
        assert!(keys.contains(&k1));
        assert!(keys.contains(&k2));
    }

    #[tokio::test]
    async fn test_unknown_entry_kinds_survive_roundtrip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = SessionStore::open(tmp.path()).unwrap();
        store.append(&key(), user("hi")).await.unwrap();

        // Simulate a newer build writing an unknown entry kind.
        let path = tmp
            .path()
            .join("sessions")
            .join(format!("{}.jsonl", key().storage_name()));
        let mut file = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(
            file,
            r#"{{"seq":2,"type":"reaction","emoji":"👍","timestamp":"2026-01-01T00:00:00Z"}}"#
        )
        .unwrap();
        drop(file);

        let store = SessionStore::open(tmp.path()).unwrap();
        let snapshot = store.snapshot(&key()).await.unwrap();
        assert_eq!(snapshot.history.len(), 2);
        assert_eq!(snapshot.history[1].kind(), "reaction");
        assert_eq!(snapshot.next_seq, 3);

        // Appending after an unknown kind continues the dense sequence.
        let seq = store.append(&key(), user("next")).await.unwrap();
        assert_eq!(seq, 3);
    }
}
