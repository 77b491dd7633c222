//! Session model — keys, history entries, and per-session metadata.
//!
//! A session is identified by a [`SessionKey`] of the form
//! `agent:<main|sub>:<provider>:<kind>:<userId>[:thread:<n>]` and backed by
//! an append-only log of [`HistoryEntry`] values. The entry schema is
//! forward-compatible: unknown entry kinds round-trip untouched and are
//! skipped by history selection.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Whether a session belongs to the primary agent or a sub-agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionScope {
    Main,
    Sub,
}

impl fmt::Display for SessionScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionScope::Main => write!(f, "main"),
            SessionScope::Sub => write!(f, "sub"),
        }
    }
}

/// Conversation kind within a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Dm,
    Group,
    Channel,
}

impl fmt::Display for SessionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionKind::Dm => write!(f, "dm"),
            SessionKind::Group => write!(f, "group"),
            SessionKind::Channel => write!(f, "channel"),
        }
    }
}

/// Stable identifier mapping a correspondent to conversation state.
///
/// Grammar: `agent:(main|sub):<provider>:(dm|group|channel):<userId>(:thread:<nat>)?`
/// where `provider` is lowercase alphanumeric and `userId` is provider-opaque.
/// Two keys differing only in the thread suffix are distinct sessions;
/// adapters that coalesce threads simply omit the suffix at ingress.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionKey {
    pub scope: SessionScope,
    pub provider: String,
    pub kind: SessionKind,
    pub user_id: String,
    pub thread: Option<u64>,
}

/// Error produced by [`SessionKey::from_str`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid session key `{key}`: {reason}")]
pub struct SessionKeyError {
    pub key: String,
    pub reason: String,
}

impl SessionKey {
    /// Build a DM session key for the main agent.
    pub fn main_dm(provider: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            scope: SessionScope::Main,
            provider: provider.into(),
            kind: SessionKind::Dm,
            user_id: user_id.into(),
            thread: None,
        }
    }

    /// Same correspondent, different thread.
    pub fn with_thread(mut self, thread: u64) -> Self {
        self.thread = Some(thread);
        self
    }

    /// Filesystem-safe file stem for this key.
    ///
    /// `[A-Za-z0-9._-]` bytes pass through; everything else (including the
    /// `:` separators) is escaped as `%XX`. The mapping is injective, so two
    /// distinct keys never collide on disk.
    pub fn storage_name(&self) -> String {
        let raw = self.to_string();
        let mut out = String::with_capacity(raw.len());
        for b in raw.bytes() {
            match b {
                b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'_' | b'-' => {
                    out.push(b as char)
                }
                _ => out.push_str(&format!("%{b:02X}")),
            }
        }
        out
    }
}

impl fmt::Display for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "agent:{}:{}:{}:{}",
            self.scope, self.provider, self.kind, self.user_id
        )?;
        if let Some(n) = self.thread {
            write!(f, ":thread:{n}")?;
        }
        Ok(())
    }
}

impl FromStr for SessionKey {
    type Err = SessionKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = |reason: &str| SessionKeyError {
            key: s.to_string(),
            reason: reason.to_string(),
        };

        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 5 && parts.len() != 7 {
            return Err(err("expected 5 or 7 colon-separated segments"));
        }
        if parts[0] != "agent" {
            return Err(err("must start with `agent:`"));
        }
        let scope = match parts[1] {
            "main" => SessionScope::Main,
            "sub" => SessionScope::Sub,
            _ => return Err(err("scope must be `main` or `sub`")),
        };
        let provider = parts[2];
        if provider.is_empty()
            || !provider
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
        {
            return Err(err("provider must be non-empty lowercase alphanumeric"));
        }
        let kind = match parts[3] {
            "dm" => SessionKind::Dm,
            "group" => SessionKind::Group,
            "channel" => SessionKind::Channel,
            _ => return Err(err("kind must be `dm`, `group`, or `channel`")),
        };
        let user_id = parts[4];
        if user_id.is_empty() {
            return Err(err("userId must be non-empty"));
        }
        let thread = if parts.len() == 7 {
            if parts[5] != "thread" {
                return Err(err("expected `thread` segment"));
            }
            let n: u64 = parts[6]
                .parse()
                .map_err(|_| err("thread index must be a natural number"))?;
            Some(n)
        } else {
            None
        };

        Ok(SessionKey {
            scope,
            provider: provider.to_string(),
            kind,
            user_id: user_id.to_string(),
            thread,
        })
    }
}

impl Serialize for SessionKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SessionKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Token counts reported by a model provider for one call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }

    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }
}

/// Why a model turn stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    Cancelled,
    Error,
}

/// One line of a session log.
///
/// `seq` is assigned by the store on append and is dense per session.
/// Unknown entry payloads deserialize to [`EntryPayload::Other`] and are
/// preserved verbatim on rewrite.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub seq: u64,
    #[serde(flatten)]
    pub payload: EntryPayload,
    pub timestamp: DateTime<Utc>,
}

impl HistoryEntry {
    /// Entry with seq 0 — the store assigns the real sequence on append.
    pub fn new(payload: EntryPayload) -> Self {
        Self {
            seq: 0,
            payload,
            timestamp: Utc::now(),
        }
    }

    /// Stable wire name of this entry's kind.
    pub fn kind(&self) -> &str {
        match &self.payload {
            EntryPayload::User { .. } => "user",
            EntryPayload::Assistant { .. } => "assistant",
            EntryPayload::ToolCall { .. } => "tool_call",
            EntryPayload::ToolResult { .. } => "tool_result",
            EntryPayload::ToolFailed { .. } => "tool_failed",
            EntryPayload::Summary { .. } => "summary",
            EntryPayload::MessageTruncated { .. } => "message_truncated",
            EntryPayload::Other { kind, .. } => kind,
        }
    }
}

/// Entry payloads, discriminated by a `type` tag on the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EntryPayload {
    User {
        text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_id: Option<String>,
    },
    Assistant {
        text: String,
        stop_reason: StopReason,
        #[serde(default)]
        usage: TokenUsage,
    },
    ToolCall {
        call_id: String,
        tool: String,
        args: serde_json::Value,
    },
    ToolResult {
        call_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
    ToolFailed {
        call_id: String,
        reason: String,
    },
    Summary {
        text: String,
        covers_turns: u64,
        original_tokens: u64,
        model: String,
        /// Sequence of the summary entry this one supersedes, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        supersedes: Option<u64>,
    },
    MessageTruncated {
        reason: String,
    },
    /// Forward-compatibility escape hatch: entries written by a newer build
    /// are carried through untouched.
    #[serde(untagged)]
    Other {
        #[serde(rename = "type")]
        kind: String,
        #[serde(flatten)]
        data: serde_json::Value,
    },
}

/// Mutable per-session state held alongside the log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionMetadata {
    /// Model override for this session (agent default if None).
    pub model_override: Option<String>,
    /// Accumulated provider-reported usage across turns.
    pub token_counters: TokenUsage,
    /// Sequence of the newest rolling-summary entry, if any.
    pub summary_seq: Option<u64>,
    /// Last time this session saw activity.
    pub last_active: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_roundtrip_plain() {
        let key: SessionKey = "agent:main:telegram:dm:u42".parse().unwrap();
        assert_eq!(key.scope, SessionScope::Main);
        assert_eq!(key.provider, "telegram");
        assert_eq!(key.kind, SessionKind::Dm);
        assert_eq!(key.user_id, "u42");
        assert_eq!(key.thread, None);
        assert_eq!(key.to_string(), "agent:main:telegram:dm:u42");
    }

    #[test]
    fn test_key_roundtrip_thread() {
        let key: SessionKey = "agent:sub:discord:channel:general:thread:3".parse().unwrap();
        assert_eq!(key.scope, SessionScope::Sub);
        assert_eq!(key.kind, SessionKind::Channel);
        assert_eq!(key.thread, Some(3));
        assert_eq!(
            key.to_string(),
            "agent:sub:discord:channel:general:thread:3"
        );
    }

    #[test]
    fn test_key_thread_is_distinct_session() {
        let a: SessionKey = "agent:main:telegram:dm:u1".parse().unwrap();
        let b: SessionKey = "agent:main:telegram:dm:u1:thread:1".parse().unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_rejects_bad_prefix() {
        assert!("session:main:telegram:dm:u1".parse::<SessionKey>().is_err());
    }

    #[test]
    fn test_key_rejects_uppercase_provider() {
        assert!("agent:main:Telegram:dm:u1".parse::<SessionKey>().is_err());
    }

    #[test]
    fn test_key_rejects_bad_kind() {
        assert!("agent:main:telegram:room:u1".parse::<SessionKey>().is_err());
    }

    #[test]
    fn test_key_rejects_bad_thread() {
        assert!("agent:main:telegram:dm:u1:thread:x"
            .parse::<SessionKey>()
            .is_err());
        assert!("agent:main:telegram:dm:u1:topic:2"
            .parse::<SessionKey>()
            .is_err());
    }

    #[test]
    fn test_storage_name_escapes_separators() {
        let key: SessionKey = "agent:main:telegram:dm:u/42".parse().unwrap();
        let name = key.storage_name();
        assert!(!name.contains(':'));
        assert!(!name.contains('/'));
        assert!(name.contains("%3A"));
    }

    #[test]
    fn test_storage_name_injective() {
        let a: SessionKey = "agent:main:telegram:dm:u42".parse().unwrap();
        let b: SessionKey = "agent:main:telegram:dm:u-42".parse().unwrap();
        assert_ne!(a.storage_name(), b.storage_name());
    }

    #[test]
    fn test_key_serde_as_string() {
        let key: SessionKey = "agent:main:telegram:dm:u42".parse().unwrap();
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"agent:main:telegram:dm:u42\"");
        let back: SessionKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
    }

    #[test]
    fn test_entry_serde_user() {
        let entry = HistoryEntry::new(EntryPayload::User {
            text: "hi".into(),
            sender_id: Some("u42".into()),
        });
        let line = serde_json::to_string(&entry).unwrap();
        assert!(line.contains("\"type\":\"user\""));
        let back: HistoryEntry = serde_json::from_str(&line).unwrap();
        assert_eq!(back.kind(), "user");
    }

    #[test]
    fn test_entry_unknown_kind_preserved() {
        let line = r#"{"seq":7,"type":"voice_note","duration_ms":1200,"timestamp":"2026-01-01T00:00:00Z"}"#;
        let entry: HistoryEntry = serde_json::from_str(line).unwrap();
        assert_eq!(entry.kind(), "voice_note");
        let rewritten = serde_json::to_string(&entry).unwrap();
        let back: HistoryEntry = serde_json::from_str(&rewritten).unwrap();
        assert_eq!(back.kind(), "voice_note");
        match back.payload {
            EntryPayload::Other { data, .. } => {
                assert_eq!(data["duration_ms"], 1200);
            }
            other => panic!("expected Other, got {other:?}"),
        }
    }

    #[test]
    fn test_token_usage_total() {
        let mut usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
        };
        assert_eq!(usage.total(), 150);
        usage.add(&TokenUsage {
            input_tokens: 1,
            output_tokens: 2,
        });
        assert_eq!(usage.total(), 153);
    }
}
