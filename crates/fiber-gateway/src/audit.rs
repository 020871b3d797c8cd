//! Append-only, tamper-evident audit trail.
//!
//! Each entry links to its predecessor through a truncated SHA-256 hash
//! chain over the canonical (sorted-key) JSON of the entry, so any edit,
//! insertion or deletion inside the file breaks verification at the first
//! affected line. Written for trust-relevant gateway actions: auth
//! denials and region-mismatch rejections on write endpoints.

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::PathBuf;
use std::sync::Mutex;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info};

const GENESIS: &str = "GENESIS";
const HASH_LEN: usize = 16;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct AuditEntry {
    pub ts: String,
    pub actor: String,
    pub action: String,
    pub resource: String,
    #[serde(default)]
    pub details: serde_json::Value,
    pub prev_hash: String,
    pub hash: String,
}

pub struct AuditLog {
    path: PathBuf,
    last_hash: Mutex<String>,
}

fn compute_hash(entry: &serde_json::Value, prev_hash: &str) -> String {
    // sorted keys keep the digest stable across serializers
    let canonical = canonical_json(entry);
    let digest = Sha256::digest(format!("{canonical}{prev_hash}").as_bytes());
    hex::encode(digest)[..HASH_LEN].to_string()
}

fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let fields: Vec<String> = keys
                .into_iter()
                .map(|k| format!("{}:{}", serde_json::Value::String(k.clone()), canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", fields.join(","))
        }
        serde_json::Value::Array(items) => {
            let fields: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", fields.join(","))
        }
        other => other.to_string(),
    }
}

impl AuditLog {
    /// Opens (or prepares to create) the log and restores the chain head
    /// from the last line so restarts keep the chain unbroken.
    pub fn new(path: PathBuf) -> Self {
        let last_hash = read_last_hash(&path).unwrap_or_else(|| GENESIS.to_string());
        AuditLog {
            path,
            last_hash: Mutex::new(last_hash),
        }
    }

    /// Appends one entry. A failed file write is logged and swallowed;
    /// audit must never take the ingest path down with it.
    pub fn append(&self, actor: &str, action: &str, resource: &str, details: serde_json::Value) {
        #[allow(clippy::expect_used)]
        let mut last = self.last_hash.lock().expect("audit lock poisoned");

        let mut body = serde_json::json!({
            "ts": Utc::now().to_rfc3339(),
            "actor": actor,
            "action": action,
            "resource": resource,
            "details": details,
            "prev_hash": *last,
        });
        let hash = compute_hash(&body, &last);
        body["hash"] = serde_json::Value::String(hash.clone());

        info!(actor, action, resource, "AUDIT");

        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        let write = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{body}"));
        match write {
            Ok(()) => *last = hash,
            Err(e) => error!(error = %e, path = %self.path.display(), "audit write failed"),
        }
    }

    /// Walks the whole file; returns the first broken line, if any.
    pub fn verify_chain(&self) -> Result<(), usize> {
        verify_chain_at(&self.path)
    }
}

fn read_last_hash(path: &PathBuf) -> Option<String> {
    let file = std::fs::File::open(path).ok()?;
    let mut last = None;
    for line in BufReader::new(file).lines().map_while(Result::ok) {
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(entry) = serde_json::from_str::<AuditEntry>(&line) {
            last = Some(entry.hash);
        }
    }
    last
}

pub fn verify_chain_at(path: &PathBuf) -> Result<(), usize> {
    let Ok(file) = std::fs::File::open(path) else {
        return Ok(()); // no file yet is a valid empty chain
    };
    let mut prev = GENESIS.to_string();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line_no = line_no + 1;
        let Ok(line) = line else { return Err(line_no) };
        if line.trim().is_empty() {
            continue;
        }
        let Ok(mut value) = serde_json::from_str::<serde_json::Value>(&line) else {
            return Err(line_no);
        };
        if value.get("prev_hash").and_then(|v| v.as_str()) != Some(prev.as_str()) {
            return Err(line_no);
        }
        let Some(stored) = value
            .as_object_mut()
            .and_then(|map| map.remove("hash"))
            .and_then(|v| v.as_str().map(str::to_string))
        else {
            return Err(line_no);
        };
        if compute_hash(&value, &prev) != stored {
            return Err(line_no);
        }
        prev = stored;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_log() -> (tempfile::TempDir, AuditLog) {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new(dir.path().join("audit.jsonl"));
        (dir, log)
    }

    #[test]
    fn test_empty_chain_verifies() {
        let (_dir, log) = temp_log();
        assert_eq!(log.verify_chain(), Ok(()));
    }

    #[test]
    fn test_chain_verifies_after_appends() {
        let (_dir, log) = temp_log();
        log.append("probe-1", "AUTH_DENIED", "/push", json!({"reason": "expired"}));
        log.append("federation", "FEDERATION_AUTH", "/ingest", json!({}));
        log.append("relay-gh", "REGION_MISMATCH", "/ingest", json!({"declared": "ng"}));
        assert_eq!(log.verify_chain(), Ok(()));
    }

    #[test]
    fn test_tampered_line_detected() {
        let (dir, log) = temp_log();
        log.append("a", "X", "r", json!({}));
        log.append("b", "Y", "r", json!({}));
        log.append("c", "Z", "r", json!({}));

        let path = dir.path().join("audit.jsonl");
        let contents = std::fs::read_to_string(&path).unwrap();
        let tampered = contents.replacen("\"actor\":\"b\"", "\"actor\":\"evil\"", 1);
        std::fs::write(&path, tampered).unwrap();

        assert_eq!(verify_chain_at(&path), Err(2));
    }

    #[test]
    fn test_deleted_line_detected() {
        let (dir, log) = temp_log();
        log.append("a", "X", "r", json!({}));
        log.append("b", "Y", "r", json!({}));
        log.append("c", "Z", "r", json!({}));

        let path = dir.path().join("audit.jsonl");
        let contents = std::fs::read_to_string(&path).unwrap();
        let kept: Vec<&str> = contents.lines().enumerate()
            .filter(|(i, _)| *i != 1)
            .map(|(_, l)| l)
            .collect();
        std::fs::write(&path, kept.join("\n") + "\n").unwrap();

        assert_eq!(verify_chain_at(&path), Err(2));
    }

    #[test]
    fn test_chain_survives_restart() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        {
            let log = AuditLog::new(path.clone());
            log.append("a", "X", "r", json!({}));
        }
        {
            let log = AuditLog::new(path.clone());
            log.append("b", "Y", "r", json!({}));
        }
        assert_eq!(verify_chain_at(&path), Ok(()));
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let a = serde_json::from_str::<serde_json::Value>(r#"{"b":1,"a":{"d":2,"c":3}}"#).unwrap();
        assert_eq!(canonical_json(&a), r#"{"a":{"c":3,"d":2},"b":1}"#);
    }
}
