//! Filter evaluation over in-memory documents.
//!
//! This is the authoritative implementation of the query operators; SQL
//! pushdown only ever pre-filters a superset of what this module accepts.
//! Comparisons across type brackets yield no match rather than an error.

use mangrove_bson::{canonical_cmp, canonical_eq, same_type_bracket, Document, Value};
use mangrove_common::{ErrorCode, MongoError, MongoResult};

use super::path;

/// Does the document match the filter?
pub fn matches(doc: &Document, filter: &Document) -> MongoResult<bool> {
    for (key, condition) in filter.iter() {
        let matched = match key {
            "$and" => logical_all(doc, condition, key)?,
            "$or" => logical_any(doc, condition)?,
            "$nor" => !logical_any(doc, condition)?,
            "$comment" => true,
            _ if key.starts_with('$') => {
                return Err(MongoError::bad_value(format!(
                    "unknown top level operator: {key}"
                )))
            }
            _ => field_matches(doc, key, condition)?,
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

fn operand_documents<'a>(condition: &'a Value, op: &str) -> MongoResult<Vec<&'a Document>> {
    let elements = condition.as_array().ok_or_else(|| {
        MongoError::bad_value(format!("{op} must be an array"))
    })?;
    if elements.is_empty() {
        return Err(MongoError::bad_value(format!(
            "{op} must be a nonempty array"
        )));
    }
    elements
        .iter()
        .map(|e| {
            e.as_document()
                .ok_or_else(|| MongoError::bad_value(format!("{op} entries must be documents")))
        })
        .collect()
}

fn logical_all(doc: &Document, condition: &Value, op: &str) -> MongoResult<bool> {
    for sub in operand_documents(condition, op)? {
        if !matches(doc, sub)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn logical_any(doc: &Document, condition: &Value) -> MongoResult<bool> {
    for sub in operand_documents(condition, "$or/$nor")? {
        if matches(doc, sub)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn field_matches(doc: &Document, field: &str, condition: &Value) -> MongoResult<bool> {
    let candidates = path::gather(doc, field);
    condition_matches_candidates(&candidates, condition)
}

/// Evaluates a field condition against one value; used by `$pull` and by
/// element-wise traversal.
pub fn condition_matches(value: &Value, condition: &Value) -> MongoResult<bool> {
    condition_matches_candidates(&[value], condition)
}

fn condition_matches_candidates(candidates: &[&Value], condition: &Value) -> MongoResult<bool> {
    match condition {
        Value::Document(ops) if is_operator_document(ops)? => {
            apply_operators(candidates, ops)
        }
        Value::Regex(re) => Ok(regex_matches(candidates, &re.pattern, &re.options)?),
        other => Ok(eq_matches(candidates, other)),
    }
}

/// An operator document has every key starting with `$`; mixing operator
/// and literal keys is rejected the way the server does.
fn is_operator_document(doc: &Document) -> MongoResult<bool> {
    let mut operators = 0usize;
    for key in doc.keys() {
        if key.starts_with('$') {
            operators += 1;
        }
    }
    if operators == 0 {
        return Ok(false);
    }
    if operators != doc.len() {
        return Err(MongoError::bad_value(
            "cannot mix operator and literal fields in an expression",
        ));
    }
    Ok(true)
}

fn apply_operators(candidates: &[&Value], ops: &Document) -> MongoResult<bool> {
    for (op, operand) in ops.iter() {
        let matched = match op {
            "$eq" => eq_matches(candidates, operand),
            "$ne" => !eq_matches(candidates, operand),
            "$gt" => range_matches(candidates, operand, |o| o == std::cmp::Ordering::Greater),
            "$gte" => range_matches(candidates, operand, |o| o != std::cmp::Ordering::Less),
            "$lt" => range_matches(candidates, operand, |o| o == std::cmp::Ordering::Less),
            "$lte" => range_matches(candidates, operand, |o| o != std::cmp::Ordering::Greater),
            "$in" => in_matches(candidates, operand)?,
            "$nin" => !in_matches(candidates, operand)?,
            "$exists" => exists_matches(candidates, operand),
            "$type" => type_matches(candidates, operand)?,
            "$not" => !not_operand_matches(candidates, operand)?,
            "$regex" => {
                let pattern = operand_regex_pattern(operand)?;
                let options = ops
                    .get_str("$options")
                    .map(str::to_owned)
                    .or_else(|| match operand {
                        Value::Regex(re) => Some(re.options.clone()),
                        _ => None,
                    })
                    .unwrap_or_default();
                regex_matches(candidates, &pattern, &options)?
            }
            // Consumed together with $regex above.
            "$options" => {
                if !ops.contains_key("$regex") {
                    return Err(MongoError::bad_value("$options needs a $regex"));
                }
                true
            }
            other => {
                return Err(MongoError::bad_value(format!(
                    "unknown operator: {other}"
                )))
            }
        };
        if !matched {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Equality with implicit array traversal: a candidate matches when it
/// equals the operand, or is an array containing an equal element.
fn eq_matches(candidates: &[&Value], operand: &Value) -> bool {
    if matches!(operand, Value::Null) {
        // {field: null} matches explicit null and missing fields alike.
        return candidates.is_empty()
            || candidates.iter().any(|c| {
                matches!(c, Value::Null)
                    || matches!(c, Value::Array(a) if a.iter().any(|e| matches!(e, Value::Null)))
            });
    }
    candidates.iter().any(|candidate| {
        if canonical_eq(candidate, operand) {
            return true;
        }
        match candidate {
            Value::Array(elements) => elements.iter().any(|e| canonical_eq(e, operand)),
            _ => false,
        }
    })
}

fn range_matches(
    candidates: &[&Value],
    operand: &Value,
    accept: impl Fn(std::cmp::Ordering) -> bool,
) -> bool {
    let mut leaves: Vec<&Value> = Vec::new();
    for candidate in candidates {
        leaves.push(candidate);
        if let Value::Array(elements) = candidate {
            leaves.extend(elements.iter());
        }
    }
    leaves
        .into_iter()
        .filter(|leaf| same_type_bracket(leaf, operand))
        .any(|leaf| accept(canonical_cmp(leaf, operand)))
}

fn in_matches(candidates: &[&Value], operand: &Value) -> MongoResult<bool> {
    let alternatives = operand
        .as_array()
        .ok_or_else(|| MongoError::bad_value("$in needs an array"))?;
    for alternative in alternatives {
        let matched = match alternative {
            Value::Regex(re) => regex_matches(candidates, &re.pattern, &re.options)?,
            other => eq_matches(candidates, other),
        };
        if matched {
            return Ok(true);
        }
    }
    Ok(false)
}

fn exists_matches(candidates: &[&Value], operand: &Value) -> bool {
    let wanted = match operand {
        Value::Bool(b) => *b,
        other => other.as_f64().map(|f| f != 0.0).unwrap_or(true),
    };
    candidates.is_empty() != wanted
}

fn type_matches(candidates: &[&Value], operand: &Value) -> MongoResult<bool> {
    let accepted: Vec<&Value> = match operand {
        Value::Array(list) => list.iter().collect(),
        single => vec![single],
    };
    for spec in accepted {
        for candidate in candidates {
            if type_spec_matches(candidate, spec)? {
                return Ok(true);
            }
            if let Value::Array(elements) = candidate {
                for element in elements {
                    if type_spec_matches(element, spec)? {
                        return Ok(true);
                    }
                }
            }
        }
    }
    Ok(false)
}

fn type_spec_matches(value: &Value, spec: &Value) -> MongoResult<bool> {
    match spec {
        Value::String(alias) => {
            if alias == "number" {
                return Ok(value.is_number());
            }
            Ok(value.type_alias() == alias)
        }
        other => {
            let code = other.as_integer().ok_or_else(|| {
                MongoError::bad_value("$type needs a type name or number")
            })?;
            Ok(value.type_byte() as i64 == code)
        }
    }
}

fn not_operand_matches(candidates: &[&Value], operand: &Value) -> MongoResult<bool> {
    match operand {
        Value::Document(ops) => {
            if !is_operator_document(ops)? || ops.is_empty() {
                return Err(MongoError::bad_value("$not needs an operator document"));
            }
            apply_operators(candidates, ops)
        }
        Value::Regex(re) => regex_matches(candidates, &re.pattern, &re.options),
        _ => Err(MongoError::bad_value("$not needs a regex or a document")),
    }
}

fn operand_regex_pattern(operand: &Value) -> MongoResult<String> {
    match operand {
        Value::String(s) => Ok(s.clone()),
        Value::Regex(re) => Ok(re.pattern.clone()),
        _ => Err(MongoError::bad_value("$regex has to be a string")),
    }
}

fn regex_matches(candidates: &[&Value], pattern: &str, options: &str) -> MongoResult<bool> {
    let re = compile_regex(pattern, options)?;
    Ok(candidates.iter().any(|candidate| {
        let direct = matches!(candidate, Value::String(s) if re.is_match(s));
        let in_array = matches!(candidate, Value::Array(a)
            if a.iter().any(|e| matches!(e, Value::String(s) if re.is_match(s))));
        direct || in_array
    }))
}

/// Compiles a MongoDB regex, translating the option letters to inline
/// flags.
pub fn compile_regex(pattern: &str, options: &str) -> MongoResult<regex::Regex> {
    let mut flags = String::new();
    for opt in options.chars() {
        match opt {
            'i' => flags.push('i'),
            'm' => flags.push('m'),
            's' => flags.push('s'),
            'x' => flags.push('x'),
            other => {
                return Err(MongoError::bad_value(format!(
                    "invalid regex option: {other}"
                )))
            }
        }
    }
    let full = if flags.is_empty() {
        pattern.to_owned()
    } else {
        format!("(?{flags}){pattern}")
    };
    regex::Regex::new(&full)
        .map_err(|e| MongoError::new(ErrorCode::BadValue, format!("invalid regex: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use mangrove_bson::doc;

    fn order() -> Document {
        doc! {
            "_id" => 1,
            "status" => "open",
            "qty" => 7,
            "price" => 19.5,
            "tags" => vec![Value::from("red"), Value::from("sale")],
            "dims" => doc! { "w" => 10, "h" => 20 },
            "note" => Value::Null,
        }
    }

    fn check(filter: Document) -> bool {
        matches(&order(), &filter).unwrap()
    }

    #[test]
    fn test_implicit_equality() {
        assert!(check(doc! { "status" => "open" }));
        assert!(!check(doc! { "status" => "closed" }));
        // Numbers compare across tags.
        assert!(check(doc! { "qty" => 7.0 }));
    }

    #[test]
    fn test_equality_traverses_arrays() {
        assert!(check(doc! { "tags" => "sale" }));
        assert!(!check(doc! { "tags" => "blue" }));
        // Whole-array equality also matches.
        assert!(check(
            doc! { "tags" => vec![Value::from("red"), Value::from("sale")] }
        ));
    }

    #[test]
    fn test_null_matches_missing_and_null() {
        assert!(check(doc! { "note" => Value::Null }));
        assert!(check(doc! { "missing_field" => Value::Null }));
        assert!(!check(doc! { "qty" => Value::Null }));
    }

    #[test]
    fn test_range_operators() {
        assert!(check(doc! { "qty" => doc! { "$gt" => 5 } }));
        assert!(check(doc! { "qty" => doc! { "$gte" => 7 } }));
        assert!(check(doc! { "qty" => doc! { "$lt" => 8, "$gt" => 6 } }));
        assert!(!check(doc! { "qty" => doc! { "$lt" => 7 } }));
    }

    #[test]
    fn test_cross_bracket_comparison_is_false_not_error() {
        assert!(!check(doc! { "status" => doc! { "$gt" => 5 } }));
        assert!(!check(doc! { "qty" => doc! { "$lt" => "zzz" } }));
    }

    #[test]
    fn test_in_nin() {
        assert!(check(doc! {
            "status" => doc! { "$in" => vec![Value::from("open"), Value::from("closed")] }
        }));
        assert!(check(doc! {
            "qty" => doc! { "$nin" => vec![Value::from(1), Value::from(2)] }
        }));
        assert!(matches(
            &order(),
            &doc! { "qty" => doc! { "$in" => "oops" } }
        )
        .is_err());
    }

    #[test]
    fn test_exists() {
        assert!(check(doc! { "qty" => doc! { "$exists" => true } }));
        assert!(check(doc! { "nope" => doc! { "$exists" => false } }));
        assert!(!check(doc! { "nope" => doc! { "$exists" => true } }));
        // An explicit null still exists.
        assert!(check(doc! { "note" => doc! { "$exists" => true } }));
    }

    #[test]
    fn test_type() {
        assert!(check(doc! { "status" => doc! { "$type" => "string" } }));
        assert!(check(doc! { "qty" => doc! { "$type" => "int" } }));
        assert!(check(doc! { "qty" => doc! { "$type" => "number" } }));
        assert!(check(doc! { "price" => doc! { "$type" => 1 } })); // 0x01 double
        assert!(check(doc! { "tags" => doc! { "$type" => "array" } }));
        assert!(!check(doc! { "qty" => doc! { "$type" => "string" } }));
    }

    #[test]
    fn test_logical_operators() {
        assert!(check(doc! {
            "$and" => vec![
                Value::Document(doc! { "qty" => doc! { "$gt" => 5 } }),
                Value::Document(doc! { "status" => "open" }),
            ]
        }));
        assert!(check(doc! {
            "$or" => vec![
                Value::Document(doc! { "qty" => 0 }),
                Value::Document(doc! { "status" => "open" }),
            ]
        }));
        assert!(check(doc! {
            "$nor" => vec![
                Value::Document(doc! { "qty" => 0 }),
                Value::Document(doc! { "status" => "closed" }),
            ]
        }));
        assert!(matches(&order(), &doc! { "$or" => Value::Array(vec![]) }).is_err());
        assert!(matches(&order(), &doc! { "$unknownOp" => 1 }).is_err());
    }

    #[test]
    fn test_not() {
        assert!(check(doc! { "qty" => doc! { "$not" => doc! { "$lt" => 5 } } }));
        assert!(!check(doc! { "qty" => doc! { "$not" => doc! { "$gt" => 5 } } }));
        // $not over a missing field matches.
        assert!(check(doc! { "nope" => doc! { "$not" => doc! { "$gt" => 5 } } }));
    }

    #[test]
    fn test_regex() {
        assert!(check(doc! { "status" => doc! { "$regex" => "^op" } }));
        assert!(check(doc! {
            "status" => doc! { "$regex" => "^OP", "$options" => "i" }
        }));
        assert!(check(doc! { "tags" => doc! { "$regex" => "^sa" } }));
        assert!(!check(doc! { "status" => doc! { "$regex" => "^x" } }));
        assert!(matches(
            &order(),
            &doc! { "status" => doc! { "$regex" => "(", } }
        )
        .is_err());
        assert!(matches(
            &order(),
            &doc! { "status" => doc! { "$regex" => "a", "$options" => "q" } }
        )
        .is_err());
    }

    #[test]
    fn test_dotted_paths() {
        assert!(check(doc! { "dims.w" => 10 }));
        assert!(check(doc! { "dims.h" => doc! { "$gte" => 20 } }));
        assert!(!check(doc! { "dims.w" => 11 }));
    }

    #[test]
    fn test_ne_with_arrays() {
        assert!(!check(doc! { "tags" => doc! { "$ne" => "red" } }));
        assert!(check(doc! { "tags" => doc! { "$ne" => "blue" } }));
    }

    #[test]
    fn test_mixed_operator_literal_rejected() {
        let err = matches(
            &order(),
            &doc! { "qty" => doc! { "$gt" => 1, "plain" => 2 } },
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::BadValue);
    }
}
