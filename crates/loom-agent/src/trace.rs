//! Trace Sink (spec C10): an append-only structured-event journal per
//! session, used for debugging and audit rather than correctness — nothing
//! downstream depends on its content, so write failures are logged, never
//! propagated.
//!
//! Layout: `<data_dir>/traces/<session_id>/{metadata.json,events.jsonl}`.
//! `events.jsonl` is opened in append mode and each record is one JSON
//! object per line; writes for a given session are serialized through a
//! per-session `tokio::sync::Mutex` guarding the open file handle.

use dashmap::DashMap;
use loom_core::types::TraceRecord;
use serde_json::json;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

const MAX_FIELD_CHARS: usize = 4096;

struct SessionJournal {
    turn: AtomicU64,
    writer: Mutex<Option<tokio::fs::File>>,
}

pub struct TraceSink {
    data_dir: PathBuf,
    sessions: DashMap<String, Arc<SessionJournal>>,
}

impl TraceSink {
    pub fn new(data_dir: impl Into<PathBuf>) -> Arc<Self> {
        Arc::new(Self {
            data_dir: data_dir.into(),
            sessions: DashMap::new(),
        })
    }

    fn journal(&self, session_id: &str) -> Arc<SessionJournal> {
        self.sessions
            .entry(session_id.to_string())
            .or_insert_with(|| {
                Arc::new(SessionJournal {
                    turn: AtomicU64::new(0),
                    writer: Mutex::new(None),
                })
            })
            .clone()
    }

    /// Bumps and returns the session's turn counter — the Planner calls this
    /// once per turn so every record in that turn shares the number.
    pub fn next_turn(&self, session_id: &str) -> u64 {
        self.journal(session_id).turn.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub async fn record(
        &self,
        session_id: &str,
        turn: u64,
        kind: &str,
        payload: serde_json::Value,
        duration_ms: Option<u64>,
    ) {
        let record = TraceRecord {
            ts: chrono::Utc::now(),
            session_id: session_id.to_string(),
            turn,
            kind: kind.to_string(),
            payload: truncate_value(payload),
            duration_ms,
        };
        if let Err(e) = self.append(session_id, &record).await {
            warn!(session_id, error = %e, "trace sink write failed");
        }
    }

    async fn append(&self, session_id: &str, record: &TraceRecord) -> loom_core::Result<()> {
        let journal = self.journal(session_id);
        let mut writer = journal.writer.lock().await;
        if writer.is_none() {
            let dir = self.data_dir.join("traces").join(session_id);
            tokio::fs::create_dir_all(&dir).await?;
            self.ensure_metadata(&dir, session_id).await?;
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(dir.join("events.jsonl"))
                .await?;
            *writer = Some(file);
        }
        let file = writer.as_mut().expect("just initialized above");
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn ensure_metadata(&self, dir: &std::path::Path, session_id: &str) -> loom_core::Result<()> {
        let path = dir.join("metadata.json");
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(());
        }
        let metadata = json!({ "session_id": session_id, "created_at": chrono::Utc::now() });
        let tmp = path.with_extension("json.tmp");
        tokio::fs::write(&tmp, serde_json::to_vec_pretty(&metadata)?).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }
}

/// Recursively truncates any string field longer than `MAX_FIELD_CHARS`,
/// appending `... [truncated N chars]` — keeps the journal bounded against
/// arbitrarily large tool output or LLM responses.
fn truncate_value(value: serde_json::Value) -> serde_json::Value {
    match value {
        serde_json::Value::String(s) if s.chars().count() > MAX_FIELD_CHARS => {
            let truncated_len = s.chars().count() - MAX_FIELD_CHARS;
            let head: String = s.chars().take(MAX_FIELD_CHARS).collect();
            serde_json::Value::String(format!("{head}... [truncated {truncated_len} chars]"))
        }
        serde_json::Value::Array(items) => {
            serde_json::Value::Array(items.into_iter().map(truncate_value).collect())
        }
        serde_json::Value::Object(map) => serde_json::Value::Object(
            map.into_iter().map(|(k, v)| (k, truncate_value(v))).collect(),
        ),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_one_json_line_per_record() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TraceSink::new(dir.path());
        let turn = sink.next_turn("s1");
        sink.record("s1", turn, "turn.start", json!({"text": "hi"}), None)
            .await;
        sink.record("s1", turn, "turn.end", json!({"text": "bye"}), Some(12))
            .await;

        let content = tokio::fs::read_to_string(dir.path().join("traces/s1/events.jsonl"))
            .await
            .unwrap();
        let lines: Vec<&str> = content.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["kind"], "turn.start");
    }

    #[tokio::test]
    async fn writes_metadata_file_once() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TraceSink::new(dir.path());
        sink.record("s1", 1, "session.start", json!({}), None).await;
        sink.record("s1", 1, "session.end", json!({}), None).await;
        let metadata = tokio::fs::read_to_string(dir.path().join("traces/s1/metadata.json"))
            .await
            .unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&metadata).unwrap();
        assert_eq!(parsed["session_id"], "s1");
    }

    #[tokio::test]
    async fn oversized_field_is_truncated_with_marker() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TraceSink::new(dir.path());
        let huge = "x".repeat(MAX_FIELD_CHARS + 500);
        sink.record("s1", 1, "tool.result", json!({"output": huge}), None)
            .await;
        let content = tokio::fs::read_to_string(dir.path().join("traces/s1/events.jsonl"))
            .await
            .unwrap();
        assert!(content.contains("[truncated 500 chars]"));
    }

    #[tokio::test]
    async fn turn_counter_is_monotonic_per_session() {
        let dir = tempfile::tempdir().unwrap();
        let sink = TraceSink::new(dir.path());
        assert_eq!(sink.next_turn("s1"), 1);
        assert_eq!(sink.next_turn("s1"), 2);
        assert_eq!(sink.next_turn("s2"), 1);
    }
}
