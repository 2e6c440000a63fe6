//! Wire and storage types for the PLC directory operation log.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One record in the directory's append-only log, as served by the upstream
/// `/export` endpoint. `(did, cid)` is unique; `created_at` is the RFC 3339
/// pagination cursor and ordering key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlcLogEntry {
    pub did: String,
    pub cid: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(default)]
    pub nullified: bool,
    pub operation: serde_json::Value,
}

/// A log entry as stored inside a schema-v2 per-DID array. The DID lives in
/// the row key, so it is dropped from the entry body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntryBody {
    pub cid: String,
    #[serde(rename = "createdAt")]
    pub created_at: String,
    #[serde(default)]
    pub nullified: bool,
    pub operation: serde_json::Value,
}

impl LogEntryBody {
    pub fn into_entry(self, did: &str) -> PlcLogEntry {
        PlcLogEntry {
            did: did.to_string(),
            cid: self.cid,
            created_at: self.created_at,
            nullified: self.nullified,
            operation: self.operation,
        }
    }
}

impl From<PlcLogEntry> for LogEntryBody {
    fn from(entry: PlcLogEntry) -> Self {
        Self {
            cid: entry.cid,
            created_at: entry.created_at,
            nullified: entry.nullified,
            operation: entry.operation,
        }
    }
}

/// The greatest `created_at` across the batch, or an empty string for an
/// empty batch. RFC 3339 timestamps from the directory are UTC and compare
/// correctly as strings.
pub fn next_cursor(entries: &[PlcLogEntry]) -> String {
    entries
        .iter()
        .map(|entry| entry.created_at.as_str())
        .max()
        .unwrap_or_default()
        .to_string()
}

pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Groups a batch by DID with each group ordered newest-first, dropping
/// batch-internal `(did, cid)` duplicates. Rows come back sorted by DID so
/// callers iterate deterministically.
pub fn group_newest_first(mut entries: Vec<PlcLogEntry>) -> Vec<(String, Vec<LogEntryBody>)> {
    entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));

    let mut seen: HashSet<(String, String)> = HashSet::new();
    let mut groups: Vec<(String, Vec<LogEntryBody>)> = Vec::new();
    let mut index: HashMap<String, usize> = HashMap::new();

    for entry in entries {
        if !seen.insert((entry.did.clone(), entry.cid.clone())) {
            continue;
        }
        let did = entry.did.clone();
        match index.get(&did) {
            Some(&at) => groups[at].1.push(entry.into()),
            None => {
                index.insert(did.clone(), groups.len());
                groups.push((did, vec![entry.into()]));
            }
        }
    }

    groups.sort_by(|a, b| a.0.cmp(&b.0));
    groups
}
