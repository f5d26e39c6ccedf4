//! Value coercion and comparison helpers for the evaluator.
//!
//! - `compare_values`: total order over JSON values
//! - `values_equal`: equality derived from that order
//! - `fingerprint`: canonical encoding used by `distinct` and grouping
//! - `expect_*`: runtime coercions that raise located errors

use std::cmp::Ordering;

use serde_json::{Map, Number, Value};

use crate::ast::Comparison;
use crate::backtrace::Backtrace;
use crate::error::{QlError, QlResult};

/// Convert f64 to a JSON number. Whole numbers in the safe integer range
/// are normalized to integers; NaN and infinities fall back to 0 and must
/// be screened out by the caller first.
pub fn number_from_f64(f: f64) -> Number {
    if f.is_finite() && f.fract() == 0.0 && f.abs() <= 9e15 {
        Number::from(f as i64)
    } else {
        Number::from_f64(f).unwrap_or_else(|| Number::from(0))
    }
}

pub fn expect_f64(v: &Value, what: &str, bt: &Backtrace) -> QlResult<f64> {
    v.as_f64()
        .ok_or_else(|| QlError::runtime(format!("{}: expected a number", what), bt))
}

pub fn expect_bool(v: &Value, what: &str, bt: &Backtrace) -> QlResult<bool> {
    v.as_bool()
        .ok_or_else(|| QlError::runtime(format!("{}: expected a boolean", what), bt))
}

pub fn expect_str<'a>(v: &'a Value, what: &str, bt: &Backtrace) -> QlResult<&'a str> {
    v.as_str()
        .ok_or_else(|| QlError::runtime(format!("{}: expected a string", what), bt))
}

pub fn expect_object<'a>(
    v: &'a Value,
    what: &str,
    bt: &Backtrace,
) -> QlResult<&'a Map<String, Value>> {
    v.as_object()
        .ok_or_else(|| QlError::runtime(format!("{}: expected an object", what), bt))
}

pub fn expect_array<'a>(v: &'a Value, what: &str, bt: &Backtrace) -> QlResult<&'a Vec<Value>> {
    v.as_array()
        .ok_or_else(|| QlError::runtime(format!("{}: expected an array", what), bt))
}

/// Non-negative integer coercion; accepts whole-valued floats.
pub fn expect_nonneg_int(v: &Value, what: &str, bt: &Backtrace) -> QlResult<usize> {
    let err = || QlError::runtime(format!("{}: expected a non-negative integer", what), bt);
    match v {
        Value::Number(n) => {
            if let Some(i) = n.as_u64() {
                Ok(i as usize)
            } else if let Some(f) = n.as_f64() {
                if f >= 0.0 && f.fract() == 0.0 {
                    Ok(f as usize)
                } else {
                    Err(err())
                }
            } else {
                Err(err())
            }
        }
        _ => Err(err()),
    }
}

fn type_rank(v: &Value) -> u8 {
    match v {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: values of different types order by type
/// rank (null < bool < number < string < array < object); numbers compare
/// as doubles, strings byte-lexicographically, arrays element-wise with
/// length as tiebreak, objects by their sorted key/value pairs.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => {
            let a = a.as_f64().unwrap_or(0.0);
            let b = b.as_f64().unwrap_or(0.0);
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        (Value::String(a), Value::String(b)) => a.as_bytes().cmp(b.as_bytes()),
        (Value::Array(a), Value::Array(b)) => {
            for (x, y) in a.iter().zip(b.iter()) {
                let ord = compare_values(x, y);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.len().cmp(&b.len())
        }
        (Value::Object(a), Value::Object(b)) => {
            for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
                let ord = ka.cmp(kb);
                if ord != Ordering::Equal {
                    return ord;
                }
                let ord = compare_values(va, vb);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            a.len().cmp(&b.len())
        }
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

pub fn values_equal(a: &Value, b: &Value) -> bool {
    compare_values(a, b) == Ordering::Equal
}

pub fn comparison_holds(cmp: Comparison, a: &Value, b: &Value) -> bool {
    let ord = compare_values(a, b);
    match cmp {
        Comparison::Eq => ord == Ordering::Equal,
        Comparison::Ne => ord != Ordering::Equal,
        Comparison::Lt => ord == Ordering::Less,
        Comparison::Le => ord != Ordering::Greater,
        Comparison::Gt => ord == Ordering::Greater,
        Comparison::Ge => ord != Ordering::Less,
    }
}

/// Canonical encoding of a document: the serialized form with object keys
/// in sorted order (the map type keeps keys sorted), so key order never
/// distinguishes otherwise-identical documents.
pub fn fingerprint(v: &Value) -> String {
    serde_json::to_string(v).unwrap_or_default()
}

/// Label used for a grouped-map-reduce output key: strings as themselves,
/// everything else by canonical encoding.
pub fn group_key_label(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        other => fingerprint(other),
    }
}

/// Attribute lookup that treats a missing attribute (or a non-object) as
/// `null`. Used by `orderby`, where absence must still sort.
pub fn attr_or_null(doc: &Value, attr: &str) -> Value {
    doc.get(attr).cloned().unwrap_or(Value::Null)
}

/// Right-biased object merge.
pub fn merge_objects(base: &Map<String, Value>, patch: &Map<String, Value>) -> Value {
    let mut out = base.clone();
    for (k, v) in patch {
        out.insert(k.clone(), v.clone());
    }
    Value::Object(out)
}
