//! MongoDB canonical comparison: cross-type ordering used by sort and by
//! range predicates.
//!
//! Values compare first by type bracket, then by the per-type rule.
//! Numeric kinds share one bracket and compare by mathematical value.

use std::cmp::Ordering;

use crate::document::Document;
use crate::value::Value;

/// Type-bracket rank. Missing fields are treated as Null by callers.
fn type_rank(value: &Value) -> u8 {
    match value {
        Value::MinKey => 0,
        Value::Null => 1,
        Value::Double(_) | Value::Int32(_) | Value::Int64(_) | Value::Decimal128(_) => 2,
        Value::String(_) => 3,
        Value::Document(_) => 4,
        Value::Array(_) => 5,
        Value::Binary(_) => 6,
        Value::ObjectId(_) => 7,
        Value::Bool(_) => 8,
        Value::DateTime(_) => 9,
        Value::Timestamp(_) => 10,
        Value::Regex(_) => 11,
        Value::MaxKey => 12,
    }
}

/// Total order over BSON values following MongoDB's canonical rules.
pub fn canonical_cmp(a: &Value, b: &Value) -> Ordering {
    let (ra, rb) = (type_rank(a), type_rank(b));
    if ra != rb {
        return ra.cmp(&rb);
    }

    match (a, b) {
        (Value::MinKey, Value::MinKey)
        | (Value::Null, Value::Null)
        | (Value::MaxKey, Value::MaxKey) => Ordering::Equal,

        _ if a.is_number() && b.is_number() => numeric_cmp(a, b),

        (Value::String(x), Value::String(y)) => x.as_bytes().cmp(y.as_bytes()),

        (Value::Document(x), Value::Document(y)) => document_cmp(x, y),

        (Value::Array(x), Value::Array(y)) => {
            for (va, vb) in x.iter().zip(y.iter()) {
                let ord = canonical_cmp(va, vb);
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            x.len().cmp(&y.len())
        }

        (Value::Binary(x), Value::Binary(y)) => x
            .bytes
            .len()
            .cmp(&y.bytes.len())
            .then(x.subtype.cmp(&y.subtype))
            .then_with(|| x.bytes.cmp(&y.bytes)),

        (Value::ObjectId(x), Value::ObjectId(y)) => x.as_bytes().cmp(y.as_bytes()),

        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),

        (Value::DateTime(x), Value::DateTime(y)) => x.cmp(y),

        (Value::Timestamp(x), Value::Timestamp(y)) => x.cmp(y),

        (Value::Regex(x), Value::Regex(y)) => x
            .pattern
            .as_bytes()
            .cmp(y.pattern.as_bytes())
            .then_with(|| x.options.as_bytes().cmp(y.options.as_bytes())),

        _ => unreachable!("type ranks matched but kinds differ"),
    }
}

/// Equality under canonical comparison (int32 1 == double 1.0 etc.).
pub fn canonical_eq(a: &Value, b: &Value) -> bool {
    canonical_cmp(a, b) == Ordering::Equal
}

/// True when both values share a type bracket, which is what makes range
/// comparisons between them meaningful.
pub fn same_type_bracket(a: &Value, b: &Value) -> bool {
    type_rank(a) == type_rank(b)
}

fn numeric_cmp(a: &Value, b: &Value) -> Ordering {
    // Exact integer path avoids double rounding above 2^53.
    if let (Some(x), Some(y)) = (exact_i64(a), exact_i64(b)) {
        return x.cmp(&y);
    }
    let x = a.as_f64().unwrap_or(f64::NAN);
    let y = b.as_f64().unwrap_or(f64::NAN);
    // NaN compares below every number and equal to itself.
    match (x.is_nan(), y.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => x.partial_cmp(&y).unwrap_or(Ordering::Equal),
    }
}

fn exact_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Int32(i) => Some(*i as i64),
        Value::Int64(i) => Some(*i),
        _ => None,
    }
}

fn document_cmp(a: &Document, b: &Document) -> Ordering {
    // Field by field in insertion order: name, then value; shorter
    // document wins a tie on the common prefix.
    for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
        let ord = ka.as_bytes().cmp(kb.as_bytes());
        if ord != Ordering::Equal {
            return ord;
        }
        let ord = canonical_cmp(va, vb);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decimal128::Decimal128;
    use crate::doc;

    #[test]
    fn test_numbers_compare_across_kinds() {
        assert!(canonical_eq(&Value::Int32(1), &Value::Double(1.0)));
        assert!(canonical_eq(&Value::Int64(5), &Value::Int32(5)));
        assert!(canonical_eq(
            &Value::Decimal128(Decimal128::parse("2.0").unwrap()),
            &Value::Double(2.0)
        ));
        assert_eq!(
            canonical_cmp(&Value::Int32(2), &Value::Double(2.5)),
            Ordering::Less
        );
    }

    #[test]
    fn test_large_integers_compare_exactly() {
        // Adjacent i64s that collapse to the same f64.
        let a = Value::Int64(i64::MAX - 1);
        let b = Value::Int64(i64::MAX);
        assert_eq!(canonical_cmp(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_nan_sorts_below_numbers() {
        assert_eq!(
            canonical_cmp(&Value::Double(f64::NAN), &Value::Int32(i32::MIN)),
            Ordering::Less
        );
        assert!(canonical_eq(
            &Value::Double(f64::NAN),
            &Value::Double(f64::NAN)
        ));
    }

    #[test]
    fn test_type_bracket_order() {
        let ordered = [
            Value::MinKey,
            Value::Null,
            Value::Int32(0),
            Value::String(String::new()),
            Value::Document(Document::new()),
            Value::Array(vec![]),
            Value::Binary(crate::value::Binary {
                subtype: 0,
                bytes: vec![],
            }),
            Value::ObjectId(crate::oid::ObjectId::from_bytes([0; 12])),
            Value::Bool(false),
            Value::DateTime(0),
            Value::Timestamp(0),
            Value::Regex(crate::value::Regex {
                pattern: String::new(),
                options: String::new(),
            }),
            Value::MaxKey,
        ];
        for pair in ordered.windows(2) {
            assert_eq!(
                canonical_cmp(&pair[0], &pair[1]),
                Ordering::Less,
                "{:?} < {:?}",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn test_cross_type_never_equal() {
        assert!(!canonical_eq(&Value::Int32(1), &Value::String("1".into())));
        assert!(!canonical_eq(&Value::Bool(true), &Value::Int32(1)));
    }

    #[test]
    fn test_document_order_field_by_field() {
        let a = doc! { "a" => 1, "b" => 1 };
        let b = doc! { "a" => 1, "b" => 2 };
        assert_eq!(
            canonical_cmp(&Value::Document(a.clone()), &Value::Document(b)),
            Ordering::Less
        );
        let shorter = doc! { "a" => 1 };
        assert_eq!(
            canonical_cmp(&Value::Document(shorter), &Value::Document(a)),
            Ordering::Less
        );
    }

    #[test]
    fn test_array_prefix_rule() {
        let a = Value::Array(vec![Value::Int32(1)]);
        let b = Value::Array(vec![Value::Int32(1), Value::Int32(0)]);
        assert_eq!(canonical_cmp(&a, &b), Ordering::Less);
    }

    #[test]
    fn test_binary_compares_length_first() {
        let short = Value::Binary(crate::value::Binary {
            subtype: 9,
            bytes: vec![0xff],
        });
        let long = Value::Binary(crate::value::Binary {
            subtype: 0,
            bytes: vec![0, 0],
        });
        assert_eq!(canonical_cmp(&short, &long), Ordering::Less);
    }
}
