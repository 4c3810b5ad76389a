//! Tamper-evident append-only audit log.
//!
//! One JSONL file per group. Every append assigns the next sequence number
//! for that group inside the same critical section as the write, so
//! sequences stay monotonic across all writers and any later gap, duplicate
//! or reorder is detectable by [`AuditLog::verify_integrity`]. There is no
//! delete, truncate or modify operation.

pub mod scrub;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use crate::protocol::PipelineStage;
use crate::types::{AuditConfig, Error, Result};

/// Terminal outcome of a pipeline stage, as recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditOutcome {
    Routed,
    Sanitized,
    Rejected,
    Error,
}

/// One audit record. `seq` is assigned by the log on append.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AuditEntry {
    #[serde(default)]
    pub seq: u64,

    pub timestamp: DateTime<Utc>,
    pub group: String,
    pub source: String,
    pub topic: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation: Option<String>,

    pub stage: PipelineStage,
    pub outcome: AuditOutcome,

    /// Rejection reason (`outcome: rejected`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,

    /// Dotted paths of fields the scrubber redacted (`outcome: sanitized`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_paths: Option<Vec<String>>,

    /// Error text (`outcome: error`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Phase label qualifying an error (`outcome: error`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl AuditEntry {
    pub fn new(
        group: impl Into<String>,
        source: impl Into<String>,
        topic: impl Into<String>,
        correlation: Option<String>,
        stage: PipelineStage,
        outcome: AuditOutcome,
    ) -> Self {
        Self {
            seq: 0,
            timestamp: Utc::now(),
            group: group.into(),
            source: source.into(),
            topic: topic.into(),
            correlation,
            stage,
            outcome,
            reason: None,
            field_paths: None,
            error: None,
            phase: None,
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_field_paths(mut self, paths: Vec<String>) -> Self {
        self.field_paths = Some(paths);
        self
    }

    pub fn with_error(mut self, error: impl Into<String>, phase: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self.phase = Some(phase.into());
        self
    }
}

/// Result of an integrity check over one group file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntegrityReport {
    pub valid: bool,
    pub entries: u64,
    pub detail: Option<String>,
}

/// Result of a rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotateOutcome {
    pub rotated: bool,
    pub archived_to: Option<PathBuf>,
}

/// Filter for audit queries.
#[derive(Debug, Clone, Default)]
pub struct AuditFilter {
    pub correlation: Option<String>,
    pub topic: Option<String>,
    pub outcomes: Option<Vec<AuditOutcome>>,
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    /// Keep only the last N entries after filtering.
    pub tail: Option<usize>,
}

#[derive(Debug)]
struct GroupState {
    /// Last assigned sequence number; `None` until the existing file has
    /// been scanned.
    last_seq: Option<u64>,
}

/// Append-only per-group audit log.
#[derive(Debug)]
pub struct AuditLog {
    dir: PathBuf,
    groups: StdMutex<HashMap<String, Arc<Mutex<GroupState>>>>,
}

impl AuditLog {
    pub fn new(config: &AuditConfig) -> Self {
        Self {
            dir: config.dir.clone(),
            groups: StdMutex::new(HashMap::new()),
        }
    }

    fn group_file(&self, group: &str) -> Result<PathBuf> {
        validate_group_name(group)?;
        Ok(self.dir.join(format!("{}.jsonl", group)))
    }

    fn group_state(&self, group: &str) -> Arc<Mutex<GroupState>> {
        let mut groups = self.groups.lock().expect("audit group map poisoned");
        groups
            .entry(group.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(GroupState { last_seq: None })))
            .clone()
    }

    /// Append one entry. The entry is scrubbed, assigned `last + 1`, and
    /// written as one line; seq update and write share the critical section.
    pub async fn append(&self, entry: AuditEntry) -> Result<u64> {
        let path = self.group_file(&entry.group)?;
        let state = self.group_state(&entry.group);
        let mut state = state.lock().await;

        let last = match state.last_seq {
            Some(last) => last,
            None => scan_last_seq(&path).await?,
        };
        let seq = last + 1;

        let mut value = serde_json::to_value(&entry)?;
        scrub::scrub_value(&mut value);
        value["seq"] = serde_json::json!(seq);

        tokio::fs::create_dir_all(&self.dir).await?;
        let mut line = serde_json::to_vec(&value)?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;

        state.last_seq = Some(seq);
        Ok(seq)
    }

    /// Verify that the group's sequence numbers form a contiguous `1..=n`.
    /// A missing or empty file verifies as valid.
    pub async fn verify_integrity(&self, group: &str) -> Result<IntegrityReport> {
        let path = self.group_file(group)?;
        self.verify_file(&path).await
    }

    /// Verify any log file, including rotated archives.
    pub async fn verify_file(&self, path: &std::path::Path) -> Result<IntegrityReport> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(IntegrityReport {
                    valid: true,
                    entries: 0,
                    detail: None,
                })
            }
            Err(e) => return Err(e.into()),
        };

        let mut expected: u64 = 1;
        for (i, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let value: serde_json::Value = serde_json::from_str(line).map_err(|e| {
                Error::validation(format!("line {}: unparseable audit entry: {}", i + 1, e))
            })?;
            let seq = value
                .get("seq")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| Error::validation(format!("line {}: missing seq", i + 1)))?;

            if seq != expected {
                let detail = if seq > expected {
                    format!(
                        "line {}: sequence gap, expected {} but found {}",
                        i + 1,
                        expected,
                        seq
                    )
                } else {
                    format!(
                        "line {}: sequence regression, expected {} but found {}",
                        i + 1,
                        expected,
                        seq
                    )
                };
                return Ok(IntegrityReport {
                    valid: false,
                    entries: expected - 1,
                    detail: Some(detail),
                });
            }
            expected += 1;
        }

        Ok(IntegrityReport {
            valid: true,
            entries: expected - 1,
            detail: None,
        })
    }

    /// Archive the group's current file with a timestamp suffix and reset
    /// the sequence counter. Returns `rotated: false` when there is nothing
    /// to rotate.
    pub async fn rotate(&self, group: &str) -> Result<RotateOutcome> {
        let path = self.group_file(group)?;
        let state = self.group_state(group);
        let mut state = state.lock().await;

        match tokio::fs::metadata(&path).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(RotateOutcome {
                    rotated: false,
                    archived_to: None,
                })
            }
            Err(e) => return Err(e.into()),
        }

        let stamp = Utc::now().format("%Y-%m-%dT%H-%M-%S%.3fZ");
        let archive = self.dir.join(format!("{}.{}.jsonl", group, stamp));
        tokio::fs::rename(&path, &archive).await?;
        tokio::fs::File::create(&path).await?;
        state.last_seq = Some(0);

        Ok(RotateOutcome {
            rotated: true,
            archived_to: Some(archive),
        })
    }

    /// Read the group's entries, applying the filter.
    pub async fn query(&self, group: &str, filter: &AuditFilter) -> Result<Vec<AuditEntry>> {
        let path = self.group_file(group)?;
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries: Vec<AuditEntry> = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: AuditEntry = match serde_json::from_str(line) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(group, "skipping unparseable audit line: {}", e);
                    continue;
                }
            };
            if let Some(correlation) = &filter.correlation {
                if entry.correlation.as_deref() != Some(correlation.as_str()) {
                    continue;
                }
            }
            if let Some(topic) = &filter.topic {
                if &entry.topic != topic {
                    continue;
                }
            }
            if let Some(outcomes) = &filter.outcomes {
                if !outcomes.contains(&entry.outcome) {
                    continue;
                }
            }
            if let Some(since) = filter.since {
                if entry.timestamp < since {
                    continue;
                }
            }
            if let Some(until) = filter.until {
                if entry.timestamp > until {
                    continue;
                }
            }
            entries.push(entry);
        }

        if let Some(tail) = filter.tail {
            if entries.len() > tail {
                entries.drain(..entries.len() - tail);
            }
        }
        Ok(entries)
    }

    /// Groups with an active audit file.
    pub async fn list_groups(&self) -> Result<Vec<String>> {
        let mut groups = Vec::new();
        let mut dir = match tokio::fs::read_dir(&self.dir).await {
            Ok(dir) => dir,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(groups),
            Err(e) => return Err(e.into()),
        };
        while let Some(item) = dir.next_entry().await? {
            let name = item.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".jsonl") {
                if !is_archive_stem(stem) {
                    groups.push(stem.to_string());
                }
            }
        }
        groups.sort();
        Ok(groups)
    }
}

/// Whether a file stem carries the rotation timestamp suffix, i.e. names an
/// archive (`<group>.<timestamp>.jsonl`) rather than an active group file.
fn is_archive_stem(stem: &str) -> bool {
    static ARCHIVE_SUFFIX: std::sync::OnceLock<regex::Regex> = std::sync::OnceLock::new();
    let re = ARCHIVE_SUFFIX.get_or_init(|| {
        regex::Regex::new(r"\.\d{4}-\d{2}-\d{2}T\d{2}-\d{2}-\d{2}\.\d{3}Z$")
            .expect("static archive pattern")
    });
    re.is_match(stem)
}

/// Group names become file names; refuse anything that could escape the
/// audit directory.
fn validate_group_name(group: &str) -> Result<()> {
    if group.is_empty() {
        return Err(Error::validation("group name cannot be empty"));
    }
    if group.contains('/') || group.contains('\\') || group.contains("..") || group.contains('\0') {
        return Err(Error::validation(format!(
            "group name {:?} contains path separators",
            group
        )));
    }
    Ok(())
}

/// Scan an existing group file for the highest sequence number.
async fn scan_last_seq(path: &std::path::Path) -> Result<u64> {
    let raw = match tokio::fs::read_to_string(path).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };
    let mut last = 0u64;
    for line in raw.lines() {
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(line) {
            if let Some(seq) = value.get("seq").and_then(|v| v.as_u64()) {
                last = last.max(seq);
            }
        }
    }
    Ok(last)
}
