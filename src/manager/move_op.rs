//! The persisted descriptor of an in-flight move.
//!
//! At most one of these exists system-wide. It is written before every
//! stage transition, so a restart resumes exactly where the crash hit -
//! the captured source state was taken before anything destructive, no
//! re-derivation is ever needed.

use serde::{Deserialize, Serialize};

use crate::incarnator::IncarnatorState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpKind {
    Move,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveStage {
    /// Source captured, target wiped; the target has not yet adopted the
    /// captured state.
    PreInitTarget,
    /// Target adopted the state; the source's bookkeeping is still there.
    PreDeleteSource,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveAsyncOp {
    #[serde(rename = "type")]
    pub kind: OpKind,
    pub source_id: String,
    pub target_id: String,
    /// Source state as captured at stage start, internal_id included -
    /// adopting it is what hands the physical collections over.
    pub captured: IncarnatorState,
    pub stage: MoveStage,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_format() {
        let value = json!({
            "type": "move",
            "source_id": "a",
            "target_id": "b",
            "captured": {
                "conf": { "source": "db", "map": "emit(doc.k, 1)", "reduces": {} },
                "status": "initialized",
                "internal_id": "g1",
                "source_to_map_seq": 3,
                "map_to_inc_seqs": {}
            },
            "stage": "pre_init_target"
        });
        let op: ActiveAsyncOp = serde_json::from_value(value.clone()).unwrap();
        assert_eq!(op.stage, MoveStage::PreInitTarget);
        assert_eq!(serde_json::to_value(&op).unwrap(), value);
    }

    #[test]
    fn unrecognized_stage_fails_to_parse() {
        let value = json!({
            "type": "move",
            "source_id": "a",
            "target_id": "b",
            "captured": {
                "conf": { "source": "db", "map": "emit(doc.k, 1)", "reduces": {} },
                "status": "initialized",
                "internal_id": "g1",
                "source_to_map_seq": 0,
                "map_to_inc_seqs": {}
            },
            "stage": "pre_frobnicate"
        });
        assert!(serde_json::from_value::<ActiveAsyncOp>(value).is_err());
    }
}
