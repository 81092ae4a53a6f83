//! C1 — Audit Sink. Append-only, hash-chained event log with one
//! serialized writer per stream: sequence-numbered append plus
//! restart-time replay, generalized to multiple named streams with a
//! canonical-encode-then-hash chaining rule.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::Mutex;

use crate::types::{AuditEvent, RequestId};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("unknown audit stream: {0}")]
    UnknownStream(String),
    #[error("audit store unwritable: {0}")]
    Unwritable(#[from] std::io::Error),
    #[error("corrupt audit record: {0}")]
    Corrupt(String),
}

const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000";

/// Deterministic, order-stable encoding used both for hashing and for
/// on-disk storage: object keys sorted at every nesting level, compact
/// serialization, default (non-scientific) number formatting.
pub fn canonicalize(value: &Value) -> String {
    let sorted = sort_keys(value);
    serde_json::to_string(&sorted).expect("canonical value always serializes")
}

fn sort_keys(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.iter().map(|(k, v)| (k.clone(), sort_keys(v))).collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            let mut out = serde_json::Map::new();
            for (k, v) in entries {
                out.insert(k, v);
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(sort_keys).collect()),
        other => other.clone(),
    }
}

fn chain_hash(prev_hash: &str, canonical_fields: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(canonical_fields.as_bytes());
    hex::encode(hasher.finalize())
}

struct StreamState {
    seq: u64,
    prev_hash: String,
    file: std::fs::File,
}

/// One hash-chained, append-only log per named stream.
pub struct AuditSink {
    streams: HashMap<String, Arc<Mutex<StreamState>>>,
}

impl AuditSink {
    /// Opens (creating if absent) one file per stream under `dir`,
    /// recovering each stream's `seq`/`prev_hash` from its last line.
    pub fn open(dir: &Path, stream_names: &[String]) -> Result<Self, AuditError> {
        std::fs::create_dir_all(dir)?;
        let mut streams = HashMap::new();
        for name in stream_names {
            let path = stream_path(dir, name);
            let (seq, prev_hash) = recover_tail(&path)?;
            let file = std::fs::OpenOptions::new().create(true).append(true).open(&path)?;
            streams.insert(name.clone(), Arc::new(Mutex::new(StreamState { seq, prev_hash, file })));
        }
        Ok(Self { streams })
    }

    /// In-memory variant for tests: no file backing, still hash-chained.
    pub fn in_memory(stream_names: &[String]) -> Self {
        let dir = std::env::temp_dir().join(format!("hnsc-audit-{}", uuid::Uuid::new_v4()));
        Self::open(&dir, stream_names).expect("temp dir is writable")
    }

    pub async fn append(
        &self,
        stream: &str,
        category: &str,
        actor_id: &str,
        request_id: RequestId,
        fields: Value,
    ) -> Result<AuditEvent, AuditError> {
        let state = self.streams.get(stream).ok_or_else(|| AuditError::UnknownStream(stream.to_string()))?;
        let mut guard = state.lock().await;

        let canonical = canonicalize(&fields);
        let hash = chain_hash(&guard.prev_hash, &canonical);
        let seq = guard.seq + 1;
        let event = AuditEvent {
            seq,
            monotonic_ts: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_nanos(),
            wall_ts: Utc::now(),
            category: category.to_string(),
            actor_id: actor_id.to_string(),
            request_id,
            fields,
            prev_hash: guard.prev_hash.clone(),
            hash: hash.clone(),
        };

        let line = serde_json::to_string(&event).map_err(|e| AuditError::Corrupt(e.to_string()))?;
        writeln!(guard.file, "{line}")?;
        guard.file.flush()?;

        guard.seq = seq;
        guard.prev_hash = hash;

        Ok(event)
    }

    /// Verifies the hash chain invariant: for all `i`,
    /// `hash_i = H(hash_{i-1} || canonical(fields_i))`.
    pub fn verify_stream(dir: &Path, stream: &str) -> Result<(), AuditError> {
        let path = stream_path(dir, stream);
        if !path.exists() {
            return Ok(());
        }
        let text = std::fs::read_to_string(&path)?;
        let mut expected_prev = GENESIS_HASH.to_string();
        for (i, line) in text.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let event: AuditEvent = serde_json::from_str(line).map_err(|e| AuditError::Corrupt(e.to_string()))?;
            if event.prev_hash != expected_prev {
                return Err(AuditError::Corrupt(format!("broken chain at line {i}")));
            }
            let recomputed = chain_hash(&event.prev_hash, &canonicalize(&event.fields));
            if recomputed != event.hash {
                return Err(AuditError::Corrupt(format!("hash mismatch at line {i}")));
            }
            expected_prev = event.hash;
        }
        Ok(())
    }
}

fn stream_path(dir: &Path, stream: &str) -> PathBuf {
    dir.join(format!("{stream}.jsonl"))
}

fn recover_tail(path: &Path) -> Result<(u64, String), AuditError> {
    if !path.exists() {
        return Ok((0, GENESIS_HASH.to_string()));
    }
    let text = std::fs::read_to_string(path)?;
    match text.lines().rev().find(|l| !l.trim().is_empty()) {
        None => Ok((0, GENESIS_HASH.to_string())),
        Some(last) => {
            let event: AuditEvent = serde_json::from_str(last).map_err(|e| AuditError::Corrupt(e.to_string()))?;
            Ok((event.seq, event.hash))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn streams() -> Vec<String> {
        vec!["governance".into(), "tool-invocation".into()]
    }

    #[tokio::test]
    async fn append_chains_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let sink = AuditSink::open(dir.path(), &streams()).unwrap();
        let rid = RequestId::new();
        let e1 = sink.append("governance", "policy.deny", "alice", rid, json!({"reason": "x"})).await.unwrap();
        assert_eq!(e1.prev_hash, GENESIS_HASH);
        let e2 = sink.append("governance", "policy.allow", "alice", rid, json!({"tool": "y"})).await.unwrap();
        assert_eq!(e2.prev_hash, e1.hash);
        assert_eq!(e2.seq, e1.seq + 1);
    }

    #[tokio::test]
    async fn unknown_stream_errors() {
        let dir = tempfile::tempdir().unwrap();
        let sink = AuditSink::open(dir.path(), &streams()).unwrap();
        let err = sink.append("nope", "x", "a", RequestId::new(), json!({})).await.unwrap_err();
        assert!(matches!(err, AuditError::UnknownStream(_)));
    }

    #[tokio::test]
    async fn verify_detects_tamper() {
        let dir = tempfile::tempdir().unwrap();
        {
            let sink = AuditSink::open(dir.path(), &streams()).unwrap();
            sink.append("governance", "policy.deny", "alice", RequestId::new(), json!({"a": 1})).await.unwrap();
            sink.append("governance", "policy.allow", "alice", RequestId::new(), json!({"b": 2})).await.unwrap();
        }
        AuditSink::verify_stream(dir.path(), "governance").unwrap();

        let path = dir.path().join("governance.jsonl");
        let mut text = std::fs::read_to_string(&path).unwrap();
        text = text.replace("\"a\":1", "\"a\":999");
        std::fs::write(&path, text).unwrap();

        assert!(AuditSink::verify_stream(dir.path(), "governance").is_err());
    }

    #[test]
    fn canonical_encoding_sorts_keys() {
        let a = json!({"b": 1, "a": 2});
        let b = json!({"a": 2, "b": 1});
        assert_eq!(canonicalize(&a), canonicalize(&b));
    }

    #[tokio::test]
    async fn restart_seeds_chain_from_last_entry() {
        let dir = tempfile::tempdir().unwrap();
        let last_hash = {
            let sink = AuditSink::open(dir.path(), &streams()).unwrap();
            sink.append("governance", "policy.deny", "alice", RequestId::new(), json!({"a": 1})).await.unwrap().hash
        };
        let sink2 = AuditSink::open(dir.path(), &streams()).unwrap();
        let next = sink2.append("governance", "policy.allow", "alice", RequestId::new(), json!({"b": 2})).await.unwrap();
        assert_eq!(next.prev_hash, last_hash);
    }
}
