//! The multi-stage move and its crash recovery.

mod support;

use incarnate::{
    ActiveAsyncOp, ManagerError, MoveStage, OpKind, Persister, PersisterProvider, RawRequest,
};
use serde_json::json;
use support::{scores_conf, testbed};

fn get_x() -> RawRequest {
    RawRequest::get(&json!("x").to_string())
}

#[test]
fn move_transfers_the_generation() {
    let bed = testbed();
    bed.put_source("d0", json!({"for": "x", "score": 1}));
    bed.manager.setup("a", scores_conf()).unwrap();
    bed.manager.forward("a", "count", "1", get_x()).unwrap();
    let source_state = bed.manager.get_state("a").unwrap();
    let collections = bed.derived_collections();

    bed.manager.move_incarnator("a", "b").unwrap();

    assert_eq!(bed.manager.get_state("a"), Err(ManagerError::NoSuchIncarnator));
    let target_state = bed.manager.get_state("b").unwrap();
    assert_eq!(target_state.internal_id, source_state.internal_id);
    // Same physical collections: the generation token moved, the data
    // never did.
    assert_eq!(bed.derived_collections(), collections);
    let response = bed.manager.forward("b", "count", "1", get_x()).unwrap();
    assert_eq!(response.body["value"], json!(1));
    // The descriptor was cleared on completion.
    assert!(bed.provider.active_op().load().is_err());
}

#[test]
fn move_of_a_missing_source_fails_clean() {
    let bed = testbed();
    assert_eq!(
        bed.manager.move_incarnator("ghost", "b"),
        Err(ManagerError::NoSuchIncarnator)
    );
    assert!(bed.provider.active_op().load().is_err());
    assert_eq!(bed.manager.get_state("b"), Err(ManagerError::NoSuchIncarnator));
}

#[test]
fn move_wipes_an_existing_target_first() {
    let bed = testbed();
    bed.put_source("d0", json!({"for": "x", "score": 1}));
    bed.manager.setup("a", scores_conf()).unwrap();
    bed.manager.setup("b", scores_conf()).unwrap();
    let old_target_generation = bed.manager.get_state("b").unwrap().internal_id;

    bed.manager.move_incarnator("a", "b").unwrap();

    let target_state = bed.manager.get_state("b").unwrap();
    assert_ne!(target_state.internal_id, old_target_generation);
    // The old target generation's collections are gone.
    assert!(bed
        .derived_collections()
        .iter()
        .all(|c| !c.contains(&old_target_generation)));
    let response = bed.manager.forward("b", "count", "1", get_x()).unwrap();
    assert_eq!(response.body["value"], json!(1));
}

#[test]
fn crash_after_stage_one_resumes_without_rewiping_the_target() {
    let bed = testbed();
    bed.put_source("d0", json!({"for": "x", "score": 1}));
    bed.manager.setup("a", scores_conf()).unwrap();
    let captured = bed.manager.get_state("a").unwrap();

    // A target that, in the crashed run's history, would already have
    // been wiped. Its collections standing is how we observe that the
    // resume does not wipe again.
    bed.manager.setup("b", scores_conf()).unwrap();
    let leftover_generation = bed.manager.get_state("b").unwrap().internal_id;

    let op = ActiveAsyncOp {
        kind: OpKind::Move,
        source_id: "a".to_string(),
        target_id: "b".to_string(),
        captured: captured.clone(),
        stage: MoveStage::PreInitTarget,
    };
    bed.provider
        .active_op()
        .save(&serde_json::to_value(&op).unwrap())
        .unwrap();

    // "Restart" and recover.
    let restarted = bed.restarted_manager();
    restarted.recover().unwrap();

    // Target adopted the captured state; no second wipe happened, so the
    // pre-crash target generation's collections are still around.
    assert_eq!(
        restarted.get_state("b").unwrap().internal_id,
        captured.internal_id
    );
    assert!(bed
        .derived_collections()
        .iter()
        .any(|c| c.contains(&leftover_generation)));
    // Source was destroyed (bookkeeping only) and the descriptor cleared.
    assert_eq!(restarted.get_state("a"), Err(ManagerError::NoSuchIncarnator));
    assert!(bed.provider.active_op().load().is_err());
    let response = restarted.forward("b", "count", "1", get_x()).unwrap();
    assert_eq!(response.body["value"], json!(1));
}

#[test]
fn crash_after_stage_two_resumes_at_source_deletion() {
    let bed = testbed();
    bed.put_source("d0", json!({"for": "x", "score": 1}));
    bed.manager.setup("a", scores_conf()).unwrap();
    let captured = bed.manager.get_state("a").unwrap();

    // Simulate the crashed run having completed stage 2: the target's
    // state record already carries the captured state.
    bed.provider
        .incarnator("b")
        .save(&serde_json::to_value(&captured).unwrap())
        .unwrap();
    let op = ActiveAsyncOp {
        kind: OpKind::Move,
        source_id: "a".to_string(),
        target_id: "b".to_string(),
        captured: captured.clone(),
        stage: MoveStage::PreDeleteSource,
    };
    bed.provider
        .active_op()
        .save(&serde_json::to_value(&op).unwrap())
        .unwrap();

    let restarted = bed.restarted_manager();
    restarted.recover().unwrap();

    assert_eq!(restarted.get_state("a"), Err(ManagerError::NoSuchIncarnator));
    assert_eq!(
        restarted.get_state("b").unwrap().internal_id,
        captured.internal_id
    );
    assert!(bed.provider.active_op().load().is_err());
    // The physical collections survived the source's bookkeeping-only
    // destroy and serve the target.
    let response = restarted.forward("b", "count", "1", get_x()).unwrap();
    assert_eq!(response.body["value"], json!(1));
}

#[test]
fn recovery_in_an_unrecognized_stage_is_fatal() {
    let bed = testbed();
    bed.provider
        .active_op()
        .save(&json!({
            "type": "move",
            "source_id": "a",
            "target_id": "b",
            "captured": {
                "conf": { "source": "my_db", "map": "emit(doc.k, 1)", "reduces": {} },
                "status": "initialized",
                "internal_id": "g1",
                "source_to_map_seq": 0,
                "map_to_inc_seqs": {}
            },
            "stage": "pre_frobnicate"
        }))
        .unwrap();

    let restarted = bed.restarted_manager();
    assert!(matches!(
        restarted.recover(),
        Err(ManagerError::IllegalState(_))
    ));
    // The descriptor stays for operator correction.
    assert!(bed.provider.active_op().load().is_ok());
}

#[test]
fn recovery_with_no_pending_op_is_a_noop() {
    let bed = testbed();
    bed.restarted_manager().recover().unwrap();
}
