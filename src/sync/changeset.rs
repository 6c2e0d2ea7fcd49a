//! Minimal change-set derivation for one propagation hop.
//!
//! Both hops end the same way: a set of previously written documents
//! (known only by their revision tokens) is compared against the set of
//! documents that should exist now, and the difference becomes one
//! all-or-nothing bulk write. Keys present on both sides are rewritten in
//! full: after a crash mid-apply there is no telling which of them
//! already carry the new contents, so they are written again rather than
//! skipped.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::storage::Document;

/// Diff prior revisions against desired bodies, keyed by document id.
///
/// Inserts go bare, deletions carry the prior revision forward, documents
/// present on both sides become revisioned overwrites.
pub fn change_set(old: &BTreeMap<String, String>, new: &BTreeMap<String, Value>) -> Vec<Document> {
    let mut docs = Vec::new();
    for (id, body) in new {
        if !old.contains_key(id) {
            docs.push(Document::new(id.clone(), body.clone()));
        }
    }
    for (id, rev) in old {
        if !new.contains_key(id) {
            docs.push(Document::deletion(id.clone(), rev.clone()));
        }
    }
    for (id, body) in new {
        if let Some(rev) = old.get(id) {
            docs.push(Document::new(id.clone(), body.clone()).with_rev(rev.clone()));
        }
    }
    docs
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn old(entries: &[(&str, &str)]) -> BTreeMap<String, String> {
        entries
            .iter()
            .map(|(id, rev)| (id.to_string(), rev.to_string()))
            .collect()
    }

    fn new(entries: &[(&str, Value)]) -> BTreeMap<String, Value> {
        entries
            .iter()
            .map(|(id, body)| (id.to_string(), body.clone()))
            .collect()
    }

    #[test]
    fn disjoint_sets_insert_and_delete() {
        let docs = change_set(
            &old(&[("gone", "1-aa")]),
            &new(&[("fresh", json!({"v": 1}))]),
        );
        assert_eq!(docs.len(), 2);
        assert_eq!(docs[0].id, "fresh");
        assert_eq!(docs[0].rev, None);
        assert!(!docs[0].deleted);
        assert_eq!(docs[1].id, "gone");
        assert_eq!(docs[1].rev.as_deref(), Some("1-aa"));
        assert!(docs[1].deleted);
    }

    #[test]
    fn overlap_becomes_revisioned_overwrite() {
        let docs = change_set(
            &old(&[("both", "2-bb")]),
            &new(&[("both", json!({"v": 2}))]),
        );
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].rev.as_deref(), Some("2-bb"));
        assert_eq!(docs[0].body, json!({"v": 2}));
        assert!(!docs[0].deleted);
    }

    #[test]
    fn identical_state_yields_rewrites_not_nothing() {
        // The diff is by key, not by content: matching keys are written
        // again because their contents cannot be trusted after a resume.
        let docs = change_set(&old(&[("k", "1-aa")]), &new(&[("k", json!(1))]));
        assert_eq!(docs.len(), 1);
    }

    #[test]
    fn empty_sides() {
        assert!(change_set(&BTreeMap::new(), &BTreeMap::new()).is_empty());
        let adds = change_set(&BTreeMap::new(), &new(&[("a", json!(1))]));
        assert_eq!(adds.len(), 1);
        let dels = change_set(&old(&[("a", "1-aa")]), &BTreeMap::new());
        assert_eq!(dels.len(), 1);
        assert!(dels[0].deleted);
    }
}
