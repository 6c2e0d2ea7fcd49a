//! The persisted snapshot an incarnator can be rebuilt from.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::config::IncarnatorConfig;
use crate::storage::Seq;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IncarnatorStatus {
    Uninitialized,
    Initializing,
    Initialized,
    Deleting,
}

impl fmt::Display for IncarnatorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            IncarnatorStatus::Uninitialized => "uninitialized",
            IncarnatorStatus::Initializing => "initializing",
            IncarnatorStatus::Initialized => "initialized",
            IncarnatorStatus::Deleting => "deleting",
        };
        write!(f, "{}", text)
    }
}

/// Full recoverable snapshot: rewritten on every sync and lifecycle
/// transition, removed on destroy. Everything an incarnator is (config,
/// generation token, cursors) reconstructs from this.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncarnatorState {
    pub conf: IncarnatorConfig,
    pub status: IncarnatorStatus,
    /// Generation token namespacing the physical collections. A new one
    /// is minted on every successful (re)setup.
    pub internal_id: String,
    pub source_to_map_seq: Seq,
    /// Reduction name → group level (display form) → cursor.
    pub map_to_inc_seqs: BTreeMap<String, BTreeMap<String, Seq>>,
}

impl IncarnatorState {
    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }

    pub fn from_value(value: &Value) -> Result<Self, String> {
        serde_json::from_value(value.clone()).map_err(|err| err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn snapshot_roundtrip() {
        let state: IncarnatorState = serde_json::from_value(json!({
            "conf": {
                "source": "my_db",
                "map": "emit(doc.for, doc.score)",
                "reduces": {
                    "count": { "function": "_count", "group_levels": [1] }
                }
            },
            "status": "initialized",
            "internal_id": "f00",
            "source_to_map_seq": 12,
            "map_to_inc_seqs": { "count": { "1": 7 } }
        }))
        .unwrap();
        assert_eq!(state.status, IncarnatorStatus::Initialized);
        assert_eq!(state.source_to_map_seq, Seq(12));
        assert_eq!(state.map_to_inc_seqs["count"]["1"], Seq(7));

        let back = IncarnatorState::from_value(&state.to_value()).unwrap();
        assert_eq!(back, state);
    }

    #[test]
    fn malformed_snapshot_is_an_error() {
        assert!(IncarnatorState::from_value(&json!({"status": "halfway"})).is_err());
        assert!(IncarnatorState::from_value(&json!("not an object")).is_err());
    }
}
