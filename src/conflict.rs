//! Resolution of diverging local and remote row versions.
//!
//! Rows are JSON objects. Timestamps come from the `updated_at` field and must
//! be RFC 3339; anything else is treated as absent.

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

const UPDATED_AT: &str = "updated_at";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "strategy", content = "fields")]
pub enum ConflictStrategy {
    /// Keep the local version.
    Local,
    /// Keep the remote version.
    Remote,
    /// Start from the remote version and overlay the listed fields from the
    /// local one.
    Merge(Vec<String>),
    /// Keep the remote version; the caller presents the conflict to the user.
    Manual,
    /// Whichever side has the later `updated_at`. Ties and missing stamps go
    /// to the remote.
    #[default]
    LastWriteWins,
}

fn updated_at(row: &Map<String, Value>) -> Option<DateTime<FixedOffset>> {
    let raw = row.get(UPDATED_AT)?.as_str()?;
    match DateTime::parse_from_rfc3339(raw) {
        Ok(ts) => Some(ts),
        Err(e) => {
            log::debug!("Ignoring unparseable {UPDATED_AT} '{raw}': {e}");
            None
        }
    }
}

pub fn resolve_conflict(
    local: &Map<String, Value>,
    remote: &Map<String, Value>,
    strategy: &ConflictStrategy,
) -> Map<String, Value> {
    match strategy {
        ConflictStrategy::Local => local.clone(),
        ConflictStrategy::Remote | ConflictStrategy::Manual => remote.clone(),
        ConflictStrategy::Merge(fields) => {
            let mut merged = remote.clone();
            for field in fields {
                if let Some(value) = local.get(field) {
                    merged.insert(field.clone(), value.clone());
                }
            }
            merged
        }
        ConflictStrategy::LastWriteWins => match (updated_at(local), updated_at(remote)) {
            (Some(l), Some(r)) if l > r => local.clone(),
            _ => remote.clone(),
        },
    }
}

/// True when the remote row changed after `last_known_updated_at`.
pub fn detect_conflict(remote: &Map<String, Value>, last_known_updated_at: Option<&str>) -> bool {
    let Some(known) = last_known_updated_at.and_then(|s| DateTime::parse_from_rfc3339(s).ok())
    else {
        return false;
    };
    updated_at(remote).is_some_and(|r| r > known)
}
