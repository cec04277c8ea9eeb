//! Session state as a small event-sourced log
//!
//! A [`Session`] keeps the last snapshot the remote side acknowledged
//! (`base`), the ordered log of unacknowledged [`Change`]s, and the current
//! local `snapshot`. The snapshot is always `replay(base, pending_changes)`;
//! every operation here preserves that.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::error::ChatlinkError;

/// Named session fields
pub type Snapshot = Map<String, Value>;

/// One optimistic edit of the snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Mutation {
    /// Overwrite the given fields
    Set(Snapshot),
    /// Push a value onto an array field
    Append {
        /// Target field
        field: String,
        /// Value to push
        value: Value,
    },
    /// Add to a numeric field
    Increment {
        /// Target field
        field: String,
        /// Amount to add
        by: i64,
    },
    /// Delete a field
    Remove {
        /// Target field
        field: String,
    },
}

impl Mutation {
    /// Set a single field.
    pub fn set(field: impl Into<String>, value: Value) -> Self {
        let mut fields = Snapshot::new();
        fields.insert(field.into(), value);
        Self::Set(fields)
    }

    /// Fields this mutation writes.
    pub fn touched_fields(&self) -> Vec<&str> {
        match self {
            Self::Set(fields) => fields.keys().map(String::as_str).collect(),
            Self::Append { field, .. } | Self::Increment { field, .. } | Self::Remove { field } => {
                vec![field.as_str()]
            }
        }
    }

    /// Apply to a snapshot.
    ///
    /// Appending to a missing or non-array field starts a new array.
    /// Incrementing a missing or non-numeric field starts from zero.
    pub fn apply(&self, snapshot: &mut Snapshot) {
        match self {
            Self::Set(fields) => {
                for (key, value) in fields {
                    snapshot.insert(key.clone(), value.clone());
                }
            }
            Self::Append { field, value } => match snapshot.get_mut(field) {
                Some(Value::Array(items)) => items.push(value.clone()),
                _ => {
                    snapshot.insert(field.clone(), Value::Array(vec![value.clone()]));
                }
            },
            Self::Increment { field, by } => {
                let next = match snapshot.get(field) {
                    Some(Value::Number(n)) => match n.as_i64() {
                        Some(i) => Number::from(i.saturating_add(*by)),
                        None => Number::from_f64(n.as_f64().unwrap_or_default() + *by as f64)
                            .unwrap_or_else(|| Number::from(*by)),
                    },
                    _ => Number::from(*by),
                };
                snapshot.insert(field.clone(), Value::Number(next));
            }
            Self::Remove { field } => {
                snapshot.remove(field);
            }
        }
    }
}

/// A mutation waiting for remote acknowledgement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Change {
    /// What changed
    #[serde(flatten)]
    pub mutation: Mutation,
    /// When the change was made locally
    pub timestamp: DateTime<Utc>,
}

impl Change {
    /// Stamp a mutation with the current time.
    pub fn now(mutation: Mutation) -> Self {
        Self {
            mutation,
            timestamp: Utc::now(),
        }
    }
}

/// Rebuild a snapshot from an acknowledged base and a change log.
pub fn replay(base: &Snapshot, changes: &[Change]) -> Snapshot {
    let mut snapshot = base.clone();
    for change in changes {
        change.mutation.apply(&mut snapshot);
    }
    snapshot
}

/// Where the local copy stands relative to the remote store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// No unacknowledged changes
    #[default]
    Synced,
    /// Changes waiting for a flush
    Pending,
    /// Flush in flight
    Syncing,
    /// Last flush failed; changes kept
    Error,
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Result of merging a remote push
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Remote snapshot equals the local one
    Unchanged,
    /// Remote values taken for `applied`; `skipped` fields are locally pending
    Merged {
        /// Fields overwritten with remote values
        applied: Vec<String>,
        /// Fields kept because a local change is pending
        skipped: Vec<String>,
    },
}

/// The unit of synchronization
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Stable identifier assigned by the remote side
    pub session_id: String,
    /// Last snapshot acknowledged by the remote side
    pub base: Snapshot,
    /// Current local snapshot
    pub snapshot: Snapshot,
    /// Unacknowledged changes, oldest first
    pub pending_changes: Vec<Change>,
    /// Sync state
    pub sync_status: SyncStatus,
    /// Time of the last successful flush
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Reason for the last failed flush
    pub last_error: Option<String>,
}

impl Session {
    /// Fresh session with an acknowledged snapshot.
    pub fn new(session_id: impl Into<String>, base: Snapshot) -> Self {
        Self {
            session_id: session_id.into(),
            snapshot: base.clone(),
            base,
            pending_changes: Vec::new(),
            sync_status: SyncStatus::Synced,
            last_sync_at: None,
            last_error: None,
        }
    }

    /// Rebuild a session from persisted state.
    pub fn restore(session_id: impl Into<String>, base: Snapshot, pending: Vec<Change>) -> Self {
        let snapshot = replay(&base, &pending);
        let sync_status = if pending.is_empty() {
            SyncStatus::Synced
        } else {
            SyncStatus::Pending
        };
        Self {
            session_id: session_id.into(),
            base,
            snapshot,
            pending_changes: pending,
            sync_status,
            last_sync_at: None,
            last_error: None,
        }
    }

    /// Apply a mutation optimistically and log it.
    pub fn apply(&mut self, mutation: Mutation) {
        mutation.apply(&mut self.snapshot);
        self.pending_changes.push(Change::now(mutation));
    }

    /// Fold the oldest `count` changes into the acknowledged base.
    pub fn acknowledge(&mut self, count: usize) {
        let count = count.min(self.pending_changes.len());
        for change in self.pending_changes.drain(..count) {
            change.mutation.apply(&mut self.base);
        }
        self.last_sync_at = Some(Utc::now());
        self.last_error = None;
    }

    /// Fields written by any pending change.
    pub fn pending_fields(&self) -> BTreeSet<&str> {
        self.pending_changes
            .iter()
            .flat_map(|change| change.mutation.touched_fields())
            .collect()
    }

    /// Whether the snapshot equals the replayed log.
    pub fn is_consistent(&self) -> bool {
        replay(&self.base, &self.pending_changes) == self.snapshot
    }

    /// Merge an authoritative remote snapshot.
    ///
    /// Remote values win per field, except for fields with a pending local
    /// change, which are left alone. A field missing from the remote snapshot
    /// is removed locally only if it was previously acknowledged.
    ///
    /// # Errors
    ///
    /// [`ChatlinkError::SyncConflict`] when every differing field is locally
    /// pending, so nothing could be merged. The session is unchanged.
    pub fn merge_remote(&mut self, remote: &Snapshot) -> Result<MergeOutcome, ChatlinkError> {
        if remote == &self.snapshot {
            return Ok(MergeOutcome::Unchanged);
        }

        let pending: BTreeSet<String> = self
            .pending_fields()
            .into_iter()
            .map(str::to_string)
            .collect();
        let mut applied = Vec::new();
        let mut skipped = Vec::new();
        let mut base = self.base.clone();

        for (key, value) in remote {
            if self.snapshot.get(key) == Some(value) {
                continue;
            }
            if pending.contains(key) {
                skipped.push(key.clone());
            } else {
                base.insert(key.clone(), value.clone());
                applied.push(key.clone());
            }
        }
        let removed: Vec<String> = self
            .base
            .keys()
            .filter(|key| !remote.contains_key(*key))
            .cloned()
            .collect();
        for key in removed {
            if pending.contains(&key) {
                skipped.push(key);
            } else {
                base.remove(&key);
                applied.push(key);
            }
        }

        if applied.is_empty() {
            if skipped.is_empty() {
                return Ok(MergeOutcome::Unchanged);
            }
            return Err(ChatlinkError::SyncConflict { fields: skipped });
        }

        self.base = base;
        self.snapshot = replay(&self.base, &self.pending_changes);
        Ok(MergeOutcome::Merged { applied, skipped })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn snapshot(value: Value) -> Snapshot {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_change_wire_shape() {
        let change = Change::now(Mutation::set("view", json!("list")));
        let value = serde_json::to_value(&change).unwrap();
        assert_eq!(value["type"], "set");
        assert_eq!(value["data"], json!({ "view": "list" }));
        assert!(value["timestamp"].is_string());

        let back: Change = serde_json::from_value(value).unwrap();
        assert_eq!(back, change);
    }

    #[test]
    fn test_mutation_apply_variants() {
        let mut snap = snapshot(json!({ "count": 1, "ratio": 0.5, "log": ["a"] }));
        Mutation::Increment {
            field: "count".into(),
            by: 2,
        }
        .apply(&mut snap);
        Mutation::Increment {
            field: "ratio".into(),
            by: 1,
        }
        .apply(&mut snap);
        Mutation::Increment {
            field: "fresh".into(),
            by: 5,
        }
        .apply(&mut snap);
        Mutation::Append {
            field: "log".into(),
            value: json!("b"),
        }
        .apply(&mut snap);
        Mutation::Append {
            field: "transcript".into(),
            value: json!({ "role": "user" }),
        }
        .apply(&mut snap);
        Mutation::Remove {
            field: "ratio".into(),
        }
        .apply(&mut snap);

        assert_eq!(
            Value::Object(snap),
            json!({
                "count": 3,
                "fresh": 5,
                "log": ["a", "b"],
                "transcript": [{ "role": "user" }]
            })
        );
    }

    #[test]
    fn test_replay_invariant_holds_across_mutations() {
        let mut session = Session::new("s1", snapshot(json!({ "view": "intro", "count": 0 })));
        let mutations = vec![
            Mutation::set("view", json!("survey")),
            Mutation::Increment {
                field: "count".into(),
                by: 1,
            },
            Mutation::Append {
                field: "transcript".into(),
                value: json!("hello"),
            },
            Mutation::Remove {
                field: "view".into(),
            },
            Mutation::set("view", json!("results")),
        ];
        for (i, mutation) in mutations.into_iter().enumerate() {
            session.apply(mutation);
            assert!(session.is_consistent(), "diverged after mutation {i}");
            if i == 2 {
                session.acknowledge(2);
                assert!(session.is_consistent(), "diverged after acknowledge");
            }
        }
        assert_eq!(session.pending_changes.len(), 3);
        assert_eq!(session.snapshot["view"], "results");
    }

    #[test]
    fn test_acknowledge_moves_changes_into_base() {
        let mut session = Session::new("s1", Snapshot::new());
        session.apply(Mutation::set("a", json!(1)));
        session.apply(Mutation::set("b", json!(2)));
        session.apply(Mutation::set("c", json!(3)));

        session.acknowledge(2);
        assert_eq!(session.pending_changes.len(), 1);
        assert_eq!(Value::Object(session.base.clone()), json!({ "a": 1, "b": 2 }));
        assert!(session.last_sync_at.is_some());
        assert!(session.is_consistent());

        session.acknowledge(10);
        assert!(session.pending_changes.is_empty());
        assert_eq!(session.base, session.snapshot);
    }

    #[test]
    fn test_merge_keeps_locally_pending_field() {
        let mut session = Session::new("s1", snapshot(json!({ "F": "v1", "G": "g1" })));
        session.apply(Mutation::set("F", json!("v3")));

        let outcome = session
            .merge_remote(&snapshot(json!({ "F": "v2", "G": "g2" })))
            .unwrap();
        assert_eq!(
            outcome,
            MergeOutcome::Merged {
                applied: vec!["G".to_string()],
                skipped: vec!["F".to_string()],
            }
        );
        assert_eq!(session.snapshot["F"], "v3");
        assert_eq!(session.snapshot["G"], "g2");
        assert_eq!(session.base["F"], "v1");
        assert!(session.is_consistent());
    }

    #[test]
    fn test_merge_only_pending_fields_is_conflict() {
        let mut session = Session::new("s1", snapshot(json!({ "F": "v1" })));
        session.apply(Mutation::set("F", json!("v3")));
        let before = session.clone();

        let err = session
            .merge_remote(&snapshot(json!({ "F": "v2" })))
            .unwrap_err();
        assert!(matches!(err, ChatlinkError::SyncConflict { ref fields } if fields == &["F"]));
        assert_eq!(session, before);
    }

    #[test]
    fn test_merge_identical_snapshot_is_unchanged() {
        let mut session = Session::new("s1", snapshot(json!({ "F": 1 })));
        let outcome = session.merge_remote(&snapshot(json!({ "F": 1 }))).unwrap();
        assert_eq!(outcome, MergeOutcome::Unchanged);
    }

    #[test]
    fn test_merge_removes_acknowledged_field_missing_remotely() {
        let mut session = Session::new("s1", snapshot(json!({ "old": true, "keep": 1 })));
        session.apply(Mutation::set("draft", json!("local only")));

        let outcome = session.merge_remote(&snapshot(json!({ "keep": 1 }))).unwrap();
        assert_eq!(
            outcome,
            MergeOutcome::Merged {
                applied: vec!["old".to_string()],
                skipped: vec![],
            }
        );
        assert!(!session.snapshot.contains_key("old"));
        assert_eq!(session.snapshot["draft"], "local only");
    }

    #[test]
    fn test_restore_replays_pending() {
        let pending = vec![
            Change::now(Mutation::set("view", json!("b"))),
            Change::now(Mutation::Increment {
                field: "n".into(),
                by: 4,
            }),
        ];
        let session = Session::restore("s9", snapshot(json!({ "view": "a" })), pending);
        assert_eq!(session.sync_status, SyncStatus::Pending);
        assert_eq!(
            Value::Object(session.snapshot.clone()),
            json!({ "view": "b", "n": 4 })
        );
    }

    #[test]
    fn test_pending_fields_collects_all_touched() {
        let mut session = Session::new("s1", Snapshot::new());
        session.apply(Mutation::Set(snapshot(json!({ "a": 1, "b": 2 }))));
        session.apply(Mutation::Remove { field: "c".into() });
        let fields: Vec<_> = session.pending_fields().into_iter().collect();
        assert_eq!(fields, vec!["a", "b", "c"]);
    }
}
