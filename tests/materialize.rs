//! End-to-end materialization: source documents in, reduced views out
//! through the manager's front door.

mod support;

use incarnate::{IncarnatorConfig, RawRequest};
use serde_json::json;
use support::{scores_conf, testbed, SOURCE_DB};

fn get_key(key: serde_json::Value) -> RawRequest {
    RawRequest::get(&key.to_string())
}

#[test]
fn count_reduction_over_grouped_source() {
    let bed = testbed();
    for i in 0..3 {
        bed.put_source(&format!("d{}", i), json!({"for": "x", "score": 10 + i}));
    }
    bed.manager.setup("scores", scores_conf()).unwrap();

    let response = bed
        .manager
        .forward("scores", "count", "1", get_key(json!("x")))
        .unwrap();
    assert_eq!(response.status, 200);
    assert_eq!(response.body["key"], json!("x"));
    assert_eq!(response.body["value"], json!(3));

    // A group nothing emitted into has no derived document.
    let missing = bed
        .manager
        .forward("scores", "count", "1", get_key(json!("y")))
        .unwrap();
    assert_eq!(missing.status, 404);
}

#[test]
fn updates_and_deletes_propagate_incrementally() {
    let bed = testbed();
    for i in 0..3 {
        bed.put_source(&format!("d{}", i), json!({"for": "x", "score": 1}));
    }
    bed.manager.setup("scores", scores_conf()).unwrap();
    let response = bed
        .manager
        .forward("scores", "count", "1", get_key(json!("x")))
        .unwrap();
    assert_eq!(response.body["value"], json!(3));

    // One more for "x", and one defector to "y".
    bed.put_source("d3", json!({"for": "x", "score": 1}));
    bed.update_source("d0", json!({"for": "y", "score": 1}));

    let x = bed
        .manager
        .forward("scores", "count", "1", get_key(json!("x")))
        .unwrap();
    assert_eq!(x.body["value"], json!(3));
    let y = bed
        .manager
        .forward("scores", "count", "1", get_key(json!("y")))
        .unwrap();
    assert_eq!(y.body["value"], json!(1));
}

#[test]
fn reads_without_source_changes_are_stable() {
    let bed = testbed();
    bed.put_source("d0", json!({"for": "x", "score": 5}));
    bed.manager.setup("scores", scores_conf()).unwrap();

    let first = bed
        .manager
        .forward("scores", "count", "1", get_key(json!("x")))
        .unwrap();
    let cursors = bed.manager.get_state("scores").unwrap();
    let second = bed
        .manager
        .forward("scores", "count", "1", get_key(json!("x")))
        .unwrap();

    assert_eq!(first.body, second.body);
    // The no-change sync left every cursor where it was.
    assert_eq!(bed.manager.get_state("scores").unwrap(), cursors);
}

#[test]
fn array_keys_truncate_to_group_level() {
    let bed = testbed();
    let conf: IncarnatorConfig = serde_json::from_value(json!({
        "source": SOURCE_DB,
        "map": "emit([doc.country, doc.city, doc.street], doc.n)",
        "reduces": {
            "sum": { "function": "_sum", "group_levels": [2] }
        }
    }))
    .unwrap();
    bed.put_source("d0", json!({"country": "il", "city": "tlv", "street": "a", "n": 1}));
    bed.put_source("d1", json!({"country": "il", "city": "tlv", "street": "b", "n": 2}));
    bed.put_source("d2", json!({"country": "il", "city": "hfa", "street": "a", "n": 10}));
    bed.manager.setup("streets", conf).unwrap();

    let tlv = bed
        .manager
        .forward("streets", "sum", "2", get_key(json!(["il", "tlv"])))
        .unwrap();
    assert_eq!(tlv.body["key"], json!(["il", "tlv"]));
    assert_eq!(tlv.body["value"], json!(3));
    let hfa = bed
        .manager
        .forward("streets", "sum", "2", get_key(json!(["il", "hfa"])))
        .unwrap();
    assert_eq!(hfa.body["value"], json!(10));
}

#[test]
fn group_level_zero_collapses_everything() {
    let bed = testbed();
    let conf: IncarnatorConfig = serde_json::from_value(json!({
        "source": SOURCE_DB,
        "map": "emit(doc.for, doc.score)",
        "reduces": {
            "count": { "function": "_count", "group_levels": [0] }
        }
    }))
    .unwrap();
    bed.put_source("d0", json!({"for": "x", "score": 1}));
    bed.put_source("d1", json!({"for": "y", "score": 2}));
    bed.put_source("d2", json!({"for": "z", "score": 3}));
    bed.manager.setup("total", conf).unwrap();

    // Every emission lands in the one null group.
    let total = bed
        .manager
        .forward("total", "count", "0", get_key(json!(null)))
        .unwrap();
    assert_eq!(total.status, 200);
    assert_eq!(total.body["value"], json!(3));
}

#[test]
fn multiple_group_levels_materialize_separately() {
    let bed = testbed();
    let conf: IncarnatorConfig = serde_json::from_value(json!({
        "source": SOURCE_DB,
        "map": "emit([doc.a, doc.b], 1)",
        "reduces": {
            "count": { "function": "_count", "group_levels": [1, 2] }
        }
    }))
    .unwrap();
    bed.put_source("d0", json!({"a": "p", "b": "q"}));
    bed.put_source("d1", json!({"a": "p", "b": "r"}));
    bed.manager.setup("pairs", conf).unwrap();

    let level1 = bed
        .manager
        .forward("pairs", "count", "1", get_key(json!(["p"])))
        .unwrap();
    assert_eq!(level1.body["value"], json!(2));
    let level2 = bed
        .manager
        .forward("pairs", "count", "2", get_key(json!(["p", "q"])))
        .unwrap();
    assert_eq!(level2.body["value"], json!(1));
}
