//! View key collation.
//!
//! Grouped and bracketed view queries need a total order over JSON keys.
//! The order follows the CouchDB collation rules by type class:
//! null < false < true < numbers < strings < arrays < objects.
//! Arrays compare element-wise with the shorter array first on a tie,
//! which is what makes the `[key .. key + [{}]]` bracket cover every
//! longer extension of `key`: objects sort after everything else, so the
//! `{}` sentinel caps the range. Strings compare by code point rather
//! than ICU rules.

use std::cmp::Ordering;

use serde_json::Value;

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(false) => 1,
        Value::Bool(true) => 2,
        Value::Number(_) => 3,
        Value::String(_) => 4,
        Value::Array(_) => 5,
        Value::Object(_) => 6,
    }
}

/// Total order over JSON view keys.
pub fn cmp_keys(a: &Value, b: &Value) -> Ordering {
    let rank = type_rank(a).cmp(&type_rank(b));
    if rank != Ordering::Equal {
        return rank;
    }
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => {
            let x = x.as_f64().unwrap_or(f64::NAN);
            let y = y.as_f64().unwrap_or(f64::NAN);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(x), Value::Array(y)) => {
            for (ex, ey) in x.iter().zip(y.iter()) {
                let ord = cmp_keys(ex, ey);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }
        (Value::Object(x), Value::Object(y)) => {
            // Member-by-member over sorted keys; enough to make the order
            // total, the sentinel case never compares two real objects.
            let mut xk: Vec<_> = x.iter().collect();
            let mut yk: Vec<_> = y.iter().collect();
            xk.sort_by(|l, r| l.0.cmp(r.0));
            yk.sort_by(|l, r| l.0.cmp(r.0));
            for ((kx, vx), (ky, vy)) in xk.iter().zip(yk.iter()) {
                let ord = kx.cmp(ky);
                if ord != Ordering::Equal {
                    return ord;
                }
                let ord = cmp_keys(vx, vy);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            xk.len().cmp(&yk.len())
        }
        _ => Ordering::Equal,
    }
}

/// `true` when `key` falls inside the inclusive `[start, end]` bracket.
pub fn in_range(key: &Value, start: &Value, end: &Value) -> bool {
    cmp_keys(key, start) != Ordering::Less && cmp_keys(key, end) != Ordering::Greater
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn type_classes_order() {
        let seq = [
            json!(null),
            json!(false),
            json!(true),
            json!(-1),
            json!(0),
            json!(1.5),
            json!("a"),
            json!("b"),
            json!([]),
            json!(["a"]),
            json!({}),
        ];
        for pair in seq.windows(2) {
            assert_eq!(cmp_keys(&pair[0], &pair[1]), Ordering::Less);
        }
    }

    #[test]
    fn arrays_element_wise_then_length() {
        assert_eq!(cmp_keys(&json!(["a"]), &json!(["a", "b"])), Ordering::Less);
        assert_eq!(cmp_keys(&json!(["a", "z"]), &json!(["b"])), Ordering::Less);
        assert_eq!(cmp_keys(&json!(["a", 1]), &json!(["a", 1])), Ordering::Equal);
    }

    #[test]
    fn sentinel_bracket_covers_extensions() {
        let start = json!(["a", "b"]);
        let end = json!(["a", "b", {}]);
        assert!(in_range(&json!(["a", "b"]), &start, &end));
        assert!(in_range(&json!(["a", "b", "c"]), &start, &end));
        assert!(in_range(&json!(["a", "b", 42]), &start, &end));
        assert!(!in_range(&json!(["a", "c"]), &start, &end));
        assert!(!in_range(&json!(["a"]), &start, &end));
    }
}
