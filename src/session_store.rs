//! Persisted LLM-session store.
//!
//! Remembers the most recent LLM session id per group across host restarts,
//! backed by a single JSON file. Rows are keyed `(group, session_id)`;
//! repeated saves bump `last_used_at`. A TTL governs "latest": expired rows
//! are skipped by `get_latest` but remain visible to `list`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::Duration;

use crate::types::{Error, Result, SessionStoreConfig};

/// Current on-disk schema version. Migrations are linear bumps.
const SCHEMA_VERSION: u32 = 1;

/// One remembered LLM session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmSessionRow {
    pub group: String,
    pub session_id: String,
    pub created_at: DateTime<Utc>,
    pub last_used_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoreFile {
    schema_version: u32,
    rows: Vec<LlmSessionRow>,
}

/// File-backed store of `(group, session_id)` rows.
#[derive(Debug)]
pub struct LlmSessionStore {
    path: PathBuf,
    ttl: Duration,
    rows: RwLock<BTreeMap<(String, String), LlmSessionRow>>,
}

impl LlmSessionStore {
    /// Load the store, creating an empty one if the file does not exist.
    pub fn new(config: &SessionStoreConfig) -> Result<Self> {
        let rows = match std::fs::read_to_string(&config.path) {
            Ok(raw) => {
                let file: StoreFile = serde_json::from_str(&raw)?;
                if file.schema_version > SCHEMA_VERSION {
                    return Err(Error::validation(format!(
                        "session store schema version {} is newer than supported version {}",
                        file.schema_version, SCHEMA_VERSION
                    )));
                }
                // schema_version < SCHEMA_VERSION: apply linear migrations
                // here as versions accrue. v1 is the first.
                file.rows
                    .into_iter()
                    .map(|row| ((row.group.clone(), row.session_id.clone()), row))
                    .collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(
            rows = rows.len(),
            path = %config.path.display(),
            "llm session store loaded"
        );

        Ok(Self {
            path: config.path.clone(),
            ttl: config.ttl,
            rows: RwLock::new(rows),
        })
    }

    /// Remember a session for a group, updating `last_used_at` if the row
    /// already exists. The id must be a canonical 36-character lowercase
    /// hyphenated hex id.
    pub fn save(&self, group: &str, session_id: &str) -> Result<LlmSessionRow> {
        if !is_canonical_session_id(session_id) {
            return Err(Error::validation(format!(
                "session id {:?} is not a canonical lowercase hyphenated id",
                session_id
            )));
        }
        if group.is_empty() {
            return Err(Error::validation("group cannot be empty"));
        }

        let now = Utc::now();
        let row = {
            let mut rows = self.rows.write().expect("session store poisoned");
            let key = (group.to_string(), session_id.to_string());
            let row = rows
                .entry(key)
                .and_modify(|row| row.last_used_at = now)
                .or_insert_with(|| LlmSessionRow {
                    group: group.to_string(),
                    session_id: session_id.to_string(),
                    created_at: now,
                    last_used_at: now,
                });
            row.clone()
        };
        self.persist()?;
        Ok(row)
    }

    /// The most recently used non-expired session for a group.
    pub fn get_latest(&self, group: &str) -> Option<LlmSessionRow> {
        let cutoff = Utc::now()
            - ChronoDuration::from_std(self.ttl).unwrap_or_else(|_| ChronoDuration::zero());
        let rows = self.rows.read().expect("session store poisoned");
        rows.range(group_range(group))
            .map(|(_, row)| row)
            .filter(|row| row.last_used_at >= cutoff)
            .max_by_key(|row| row.last_used_at)
            .cloned()
    }

    /// All rows for a group, expired included, most recent first.
    pub fn list(&self, group: &str) -> Vec<LlmSessionRow> {
        let rows = self.rows.read().expect("session store poisoned");
        let mut out: Vec<LlmSessionRow> =
            rows.range(group_range(group)).map(|(_, row)| row.clone()).collect();
        out.sort_by(|a, b| b.last_used_at.cmp(&a.last_used_at));
        out
    }

    /// Write the whole store, replacing the file atomically.
    fn persist(&self) -> Result<()> {
        let file = {
            let rows = self.rows.read().expect("session store poisoned");
            StoreFile {
                schema_version: SCHEMA_VERSION,
                rows: rows.values().cloned().collect(),
            }
        };
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

fn group_range(
    group: &str,
) -> std::ops::RangeInclusive<(String, String)> {
    (group.to_string(), String::new())..=(group.to_string(), "\u{10ffff}".to_string())
}

/// Canonical form: 36 chars, hyphens at 8/13/18/23, lowercase hex elsewhere.
fn is_canonical_session_id(id: &str) -> bool {
    if id.len() != 36 {
        return false;
    }
    id.char_indices().all(|(i, c)| match i {
        8 | 13 | 18 | 23 => c == '-',
        _ => c.is_ascii_hexdigit() && !c.is_ascii_uppercase(),
    })
}
