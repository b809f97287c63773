//! Append-only, hash-chained audit trail.
//!
//! One JSON object per line. Each entry carries the SHA-256 of its own
//! contents and the hash of the previous entry, so edits and reordering are
//! detectable with [`AuditLog::verify_chain`]. Passwords, hashes and tokens are
//! never written here.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::VaultResult;

const MAX_ROTATIONS: usize = 5;
const CHAIN_START: &str = "CHAIN_START";
pub const DEFAULT_AUDIT_MAX_BYTES: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditOutcome {
    Success,
    Denied,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub seq: u64,
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub action: String,
    pub outcome: AuditOutcome,
    pub target: Option<String>,
    pub detail: serde_json::Value,
    pub prev_hash: String,
    pub hash: String,
}

/// Result of walking the current log file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChainCheck {
    Intact { entries: u64 },
    Broken { line: usize, reason: String },
}

pub struct AuditLog {
    path: PathBuf,
    max_bytes: u64,
    inner: Mutex<ChainState>,
}

#[derive(Debug)]
struct ChainState {
    last_seq: u64,
    last_hash: String,
}

impl AuditLog {
    pub fn open<P: AsRef<Path>>(path: P, max_bytes: u64) -> VaultResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let (last_seq, last_hash) = Self::load_state(&path)?;
        Ok(Self {
            path,
            max_bytes,
            inner: Mutex::new(ChainState {
                last_seq,
                last_hash,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The live file followed by each rotated file that exists, newest first.
    pub fn files(&self) -> Vec<PathBuf> {
        std::iter::once(self.path.clone())
            .chain((1..=MAX_ROTATIONS).map(|i| self.path_with_suffix(i)))
            .filter(|path| path.exists())
            .collect()
    }

    fn load_state(path: &Path) -> VaultResult<(u64, String)> {
        if !path.exists() {
            return Ok((0, CHAIN_START.to_string()));
        }
        let reader = BufReader::new(File::open(path)?);
        let mut last_seq = 0;
        let mut last_hash = CHAIN_START.to_string();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditEntry = serde_json::from_str(&line)?;
            last_seq = entry.seq;
            last_hash = entry.hash;
        }
        Ok((last_seq, last_hash))
    }

    fn compute_hash(entry_without_hash: &serde_json::Value) -> String {
        hex::encode(Sha256::digest(entry_without_hash.to_string().as_bytes()))
    }

    pub fn record(
        &self,
        actor: &str,
        action: &str,
        outcome: AuditOutcome,
        target: Option<&str>,
        detail: serde_json::Value,
    ) -> VaultResult<AuditEntry> {
        match outcome {
            AuditOutcome::Success => {
                info!(target: "tabvault::audit", actor, action, subject = ?target, %detail, "success")
            }
            AuditOutcome::Denied => {
                warn!(target: "tabvault::audit", actor, action, subject = ?target, %detail, "denied")
            }
            AuditOutcome::Failed => {
                warn!(target: "tabvault::audit", actor, action, subject = ?target, %detail, "failed")
            }
        }

        let mut state = self.inner.lock();
        self.rotate_if_needed(&mut state)?;
        let seq = state.last_seq + 1;
        let mut value = serde_json::json!({
            "seq": seq,
            "event_id": Uuid::new_v4(),
            "timestamp": Utc::now(),
            "actor": actor,
            "action": action,
            "outcome": outcome,
            "target": target,
            "detail": detail,
            "prev_hash": state.last_hash,
        });
        let hash = Self::compute_hash(&value);
        value["hash"] = serde_json::Value::String(hash.clone());
        let entry: AuditEntry = serde_json::from_value(value)?;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", serde_json::to_string(&entry)?)?;
        file.flush()?;

        state.last_seq = seq;
        state.last_hash = hash;
        Ok(entry)
    }

    fn rotate_if_needed(&self, state: &mut ChainState) -> VaultResult<()> {
        match fs::metadata(&self.path) {
            Ok(metadata) if metadata.len() >= self.max_bytes => {}
            _ => return Ok(()),
        }
        for i in (1..=MAX_ROTATIONS).rev() {
            let rotated = self.path_with_suffix(i);
            if rotated.exists() {
                if i == MAX_ROTATIONS {
                    fs::remove_file(&rotated)?;
                } else {
                    fs::rename(&rotated, self.path_with_suffix(i + 1))?;
                }
            }
        }
        fs::rename(&self.path, self.path_with_suffix(1))?;
        // each file starts a fresh chain; seq stays monotonic
        state.last_hash = CHAIN_START.to_string();
        Ok(())
    }

    /// Most recent entries first.
    pub fn read_recent(
        &self,
        since: Option<DateTime<Utc>>,
        limit: Option<usize>,
    ) -> VaultResult<Vec<AuditEntry>> {
        if !self.path.exists() {
            return Ok(vec![]);
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut entries = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditEntry = serde_json::from_str(&line)?;
            if since.map_or(false, |since| entry.timestamp < since) {
                continue;
            }
            entries.push(entry);
        }
        entries.reverse();
        if let Some(limit) = limit {
            entries.truncate(limit);
        }
        Ok(entries)
    }

    pub fn verify_chain(&self) -> VaultResult<ChainCheck> {
        if !self.path.exists() {
            return Ok(ChainCheck::Intact { entries: 0 });
        }
        let reader = BufReader::new(File::open(&self.path)?);
        let mut prev_hash = CHAIN_START.to_string();
        let mut count = 0;
        for (idx, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let broken = |reason: &str| ChainCheck::Broken {
                line: idx + 1,
                reason: reason.to_string(),
            };
            let mut value: serde_json::Value = match serde_json::from_str(&line) {
                Ok(value) => value,
                Err(_) => return Ok(broken("unparseable entry")),
            };
            let stored = match value.as_object_mut().and_then(|obj| obj.remove("hash")) {
                Some(serde_json::Value::String(hash)) => hash,
                _ => return Ok(broken("missing hash")),
            };
            if value["prev_hash"].as_str() != Some(prev_hash.as_str()) {
                return Ok(broken("previous hash mismatch"));
            }
            if Self::compute_hash(&value) != stored {
                return Ok(broken("entry hash mismatch"));
            }
            prev_hash = stored;
            count += 1;
        }
        Ok(ChainCheck::Intact { entries: count })
    }

    fn path_with_suffix(&self, index: usize) -> PathBuf {
        let filename = self
            .path
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| "audit.log".to_string());
        self.path.with_file_name(format!("{filename}.{index}"))
    }
}
