//! Update operators.
//!
//! An update request is validated as a whole before any field mutates:
//! unknown operators, malformed operands and conflicting paths are all
//! rejected up front, so a failed update leaves the document untouched.

use mangrove_bson::{canonical_cmp, canonical_eq, Decimal128, Document, Value};
use mangrove_common::{ErrorCode, MongoError, MongoResult};

use super::{filter, path};

const UPDATE_OPERATORS: &[&str] = &[
    "$set",
    "$unset",
    "$inc",
    "$mul",
    "$min",
    "$max",
    "$rename",
    "$currentDate",
    "$push",
    "$addToSet",
    "$pop",
    "$pull",
    "$pullAll",
];

/// True when the update document is a replacement (no operators).
pub fn is_replacement(update: &Document) -> bool {
    update.keys().all(|k| !k.starts_with('$'))
}

/// Validates the whole update request: operator names, operand shapes,
/// and path conflicts between operators.
pub fn validate(update: &Document) -> MongoResult<()> {
    if is_replacement(update) {
        return Ok(());
    }

    let mut paths: Vec<String> = Vec::new();
    for (op, operand) in update.iter() {
        if !UPDATE_OPERATORS.contains(&op) {
            return Err(MongoError::failed_to_parse(format!(
                "unknown modifier: {op}"
            )));
        }
        let fields = operand.as_document().ok_or_else(|| {
            MongoError::failed_to_parse(format!(
                "modifier {op} expects a document, found {}",
                operand.type_alias()
            ))
        })?;
        if fields.is_empty() {
            return Err(MongoError::failed_to_parse(format!(
                "modifier {op} has no fields"
            )));
        }

        for (field, argument) in fields.iter() {
            validate_operand(op, field, argument)?;
            paths.push(field.to_owned());
            if op == "$rename" {
                if let Some(to) = argument.as_str() {
                    paths.push(to.to_owned());
                }
            }
        }
    }

    // Two operators writing the same path, or a path and its prefix,
    // conflict regardless of their order.
    for (i, a) in paths.iter().enumerate() {
        for b in paths.iter().skip(i + 1) {
            if a == b || is_path_prefix(a, b) || is_path_prefix(b, a) {
                return Err(MongoError::new(
                    ErrorCode::ConflictingUpdateOperators,
                    format!("Updating the path {b:?} would create a conflict at {a:?}"),
                ));
            }
        }
    }
    Ok(())
}

fn is_path_prefix(prefix: &str, path: &str) -> bool {
    path.len() > prefix.len()
        && path.starts_with(prefix)
        && path.as_bytes()[prefix.len()] == b'.'
}

fn validate_operand(op: &str, field: &str, argument: &Value) -> MongoResult<()> {
    match op {
        "$inc" | "$mul" => {
            if !argument.is_number() {
                return Err(MongoError::type_mismatch(format!(
                    "Cannot {} with non-numeric argument: {{{field}: {}}}",
                    if op == "$inc" { "increment" } else { "multiply" },
                    argument.type_alias()
                )));
            }
        }
        "$rename" => {
            let to = argument.as_str().ok_or_else(|| {
                MongoError::bad_value(format!(
                    "The 'to' field for $rename must be a string: {field}"
                ))
            })?;
            if to == field {
                return Err(MongoError::bad_value(format!(
                    "The source and target field for $rename must differ: {field}"
                )));
            }
        }
        "$currentDate" => match argument {
            Value::Bool(_) => {}
            Value::Document(spec) => {
                let ok = matches!(
                    spec.get_str("$type"),
                    Some("date") | Some("timestamp")
                ) && spec.len() == 1;
                if !ok {
                    return Err(MongoError::bad_value(
                        "$currentDate $type must be 'date' or 'timestamp'",
                    ));
                }
            }
            _ => {
                return Err(MongoError::bad_value(
                    "$currentDate takes true or {$type: ...}",
                ))
            }
        },
        "$pop" => {
            if !matches!(argument.as_integer(), Some(1) | Some(-1)) {
                return Err(MongoError::failed_to_parse(
                    "$pop expects 1 or -1",
                ));
            }
        }
        "$pullAll" => {
            if argument.as_array().is_none() {
                return Err(MongoError::bad_value(format!(
                    "$pullAll requires an array argument: {field}"
                )));
            }
        }
        "$push" | "$addToSet" => {
            if let Value::Document(spec) = argument {
                if spec.keys().any(|k| k.starts_with('$')) {
                    validate_each_modifiers(op, spec)?;
                }
            }
        }
        _ => {}
    }
    Ok(())
}

fn validate_each_modifiers(op: &str, spec: &Document) -> MongoResult<()> {
    for (modifier, value) in spec.iter() {
        match modifier {
            "$each" => {
                if value.as_array().is_none() {
                    return Err(MongoError::bad_value(format!(
                        "The argument to $each in {op} must be an array"
                    )));
                }
            }
            "$position" | "$slice" if op == "$push" => {
                if value.as_integer().is_none() {
                    return Err(MongoError::bad_value(format!(
                        "The {modifier} modifier must be a number"
                    )));
                }
            }
            "$sort" if op == "$push" => match value {
                Value::Document(_) => {}
                other if other.as_integer().map_or(false, |i| i == 1 || i == -1) => {}
                _ => return Err(MongoError::bad_value("Invalid $sort modifier")),
            },
            other => {
                return Err(MongoError::bad_value(format!(
                    "Unrecognized clause in {op}: {other}"
                )))
            }
        }
    }
    if !spec.contains_key("$each") {
        return Err(MongoError::bad_value(format!(
            "{op} modifiers require $each"
        )));
    }
    Ok(())
}

/// Applies a validated update in place. Returns true when the document
/// changed.
pub fn apply(doc: &mut Document, update: &Document) -> MongoResult<bool> {
    let mut changed = false;
    for (op, operand) in update.iter() {
        let fields = operand.as_document().expect("validated operand");
        for (field, argument) in fields.iter() {
            changed |= apply_one(doc, op, field, argument)?;
        }
    }
    Ok(changed)
}

fn apply_one(doc: &mut Document, op: &str, field: &str, argument: &Value) -> MongoResult<bool> {
    match op {
        "$set" => {
            if path::get(doc, field) == Some(argument) {
                return Ok(false);
            }
            path::set(doc, field, argument.clone())?;
            Ok(true)
        }
        "$unset" => Ok(path::unset(doc, field).is_some()),
        "$inc" => arithmetic(doc, field, argument, add_values, || argument.clone()),
        "$mul" => arithmetic(doc, field, argument, mul_values, || zero_like(argument)),
        "$min" => {
            let current = path::get(doc, field).cloned();
            match current {
                Some(existing) => {
                    if canonical_cmp(argument, &existing) == std::cmp::Ordering::Less {
                        path::set(doc, field, argument.clone())?;
                        Ok(true)
                    } else {
                        Ok(false)
                    }
                }
                None => {
                    path::set(doc, field, argument.clone())?;
                    Ok(true)
                }
            }
        }
        "$max" => {
            let current = path::get(doc, field).cloned();
            match current {
                Some(existing) => {
                    if canonical_cmp(argument, &existing) == std::cmp::Ordering::Greater {
                        path::set(doc, field, argument.clone())?;
                        Ok(true)
                    } else {
                        Ok(false)
                    }
                }
                None => {
                    path::set(doc, field, argument.clone())?;
                    Ok(true)
                }
            }
        }
        "$rename" => {
            let to = argument.as_str().expect("validated operand");
            match path::unset(doc, field) {
                Some(value) => {
                    path::set(doc, to, value)?;
                    Ok(true)
                }
                None => Ok(false),
            }
        }
        "$currentDate" => {
            let now = chrono::Utc::now();
            let value = match argument {
                Value::Document(spec) if spec.get_str("$type") == Some("timestamp") => {
                    Value::Timestamp(((now.timestamp() as u64) << 32) | 1)
                }
                _ => Value::DateTime(now.timestamp_millis()),
            };
            path::set(doc, field, value)?;
            Ok(true)
        }
        "$push" => push_values(doc, field, argument),
        "$addToSet" => add_to_set(doc, field, argument),
        "$pop" => {
            let direction = argument.as_integer().expect("validated operand");
            let Some(elements) = array_at(doc, field, "$pop")? else {
                return Ok(false);
            };
            if elements.is_empty() {
                return Ok(false);
            }
            if direction == -1 {
                elements.remove(0);
            } else {
                elements.pop();
            }
            Ok(true)
        }
        "$pull" => {
            let condition = argument.clone();
            let Some(elements) = array_at(doc, field, "$pull")? else {
                return Ok(false);
            };
            let before = elements.len();
            let mut kept = Vec::with_capacity(elements.len());
            for element in elements.drain(..) {
                if !pull_matches(&element, &condition)? {
                    kept.push(element);
                }
            }
            *elements = kept;
            Ok(elements.len() != before)
        }
        "$pullAll" => {
            let targets = argument.as_array().expect("validated operand").to_vec();
            let Some(elements) = array_at(doc, field, "$pullAll")? else {
                return Ok(false);
            };
            let before = elements.len();
            elements.retain(|e| !targets.iter().any(|t| canonical_eq(e, t)));
            Ok(elements.len() != before)
        }
        other => Err(MongoError::failed_to_parse(format!(
            "unknown modifier: {other}"
        ))),
    }
}

/// Mutable access to the value at a dotted path; `Ok(None)` when absent.
fn path_get_mut<'a>(doc: &'a mut Document, field: &str) -> MongoResult<Option<&'a mut Value>> {
    let parts: Vec<&str> = field.split('.').collect();
    let mut current = match doc.get_mut(parts[0]) {
        Some(v) => v,
        None => return Ok(None),
    };
    for part in &parts[1..] {
        current = match current {
            Value::Document(d) => match d.get_mut(part) {
                Some(v) => v,
                None => return Ok(None),
            },
            Value::Array(a) => match part.parse::<usize>().ok().and_then(|i| a.get_mut(i)) {
                Some(v) => v,
                None => return Ok(None),
            },
            _ => return Ok(None),
        };
    }
    Ok(Some(current))
}

/// Mutable access to the array at `field`. `Ok(None)` when the field is
/// missing (array operators no-op there); a type error when it holds a
/// non-array.
fn array_at<'a>(
    doc: &'a mut Document,
    field: &str,
    op: &str,
) -> MongoResult<Option<&'a mut Vec<Value>>> {
    match path::get(doc, field) {
        None => return Ok(None),
        Some(Value::Array(_)) => {}
        Some(other) => {
            return Err(MongoError::type_mismatch(format!(
                "{op} requires an array argument but field {field:?} holds {}",
                other.type_alias()
            )))
        }
    }
    match path_get_mut(doc, field)? {
        Some(Value::Array(elements)) => Ok(Some(elements)),
        _ => Ok(None),
    }
}

fn pull_matches(element: &Value, condition: &Value) -> MongoResult<bool> {
    match condition {
        Value::Document(d) if d.keys().any(|k| k.starts_with('$')) => {
            filter::condition_matches(element, condition)
        }
        other => Ok(canonical_eq(element, other)),
    }
}

fn push_values(doc: &mut Document, field: &str, argument: &Value) -> MongoResult<bool> {
    let (values, position, slice, sort_spec) = split_each(argument)?;

    if path::get(doc, field).is_none() {
        path::set(doc, field, Value::Array(Vec::new()))?;
    }
    let Some(elements) = array_at(doc, field, "$push")? else {
        return Ok(false);
    };

    let mut changed = false;
    match position {
        Some(pos) => {
            let at = clamp_position(pos, elements.len());
            for (offset, value) in values.into_iter().enumerate() {
                elements.insert(at + offset, value);
                changed = true;
            }
        }
        None => {
            for value in values {
                elements.push(value);
                changed = true;
            }
        }
    }

    if let Some(sort_spec) = sort_spec {
        sort_pushed(elements, &sort_spec)?;
        changed = true;
    }
    if let Some(limit) = slice {
        let before = elements.len();
        apply_push_slice(elements, limit);
        changed |= elements.len() != before;
    }
    Ok(changed)
}

fn add_to_set(doc: &mut Document, field: &str, argument: &Value) -> MongoResult<bool> {
    let (values, _, _, _) = split_each(argument)?;

    if path::get(doc, field).is_none() {
        path::set(doc, field, Value::Array(Vec::new()))?;
    }
    let Some(elements) = array_at(doc, field, "$addToSet")? else {
        return Ok(false);
    };

    let mut changed = false;
    for value in values {
        if !elements.iter().any(|e| canonical_eq(e, &value)) {
            elements.push(value);
            changed = true;
        }
    }
    Ok(changed)
}

/// Splits a `$push`/`$addToSet` argument into the values to append plus
/// the `$position`/`$slice`/`$sort` modifiers.
#[allow(clippy::type_complexity)]
fn split_each(
    argument: &Value,
) -> MongoResult<(Vec<Value>, Option<i64>, Option<i64>, Option<Value>)> {
    match argument {
        Value::Document(spec) if spec.keys().any(|k| k.starts_with('$')) => {
            let values = spec
                .get_array("$each")
                .expect("validated operand")
                .to_vec();
            let position = spec.get_integer("$position");
            let slice = spec.get_integer("$slice");
            let sort_spec = spec.get("$sort").cloned();
            Ok((values, position, slice, sort_spec))
        }
        single => Ok((vec![single.clone()], None, None, None)),
    }
}

fn clamp_position(position: i64, len: usize) -> usize {
    if position < 0 {
        (len as i64 + position).max(0) as usize
    } else {
        (position as usize).min(len)
    }
}

fn sort_pushed(elements: &mut [Value], spec: &Value) -> MongoResult<()> {
    match spec {
        Value::Document(keys) => {
            let spec = super::sort::validate(keys)?;
            let mut docs: Vec<Document> = Vec::with_capacity(elements.len());
            for element in elements.iter() {
                match element {
                    Value::Document(d) => docs.push(d.clone()),
                    _ => {
                        return Err(MongoError::bad_value(
                            "$sort by fields requires document elements",
                        ))
                    }
                }
            }
            super::sort::sort_documents(&mut docs, &spec);
            for (slot, sorted) in elements.iter_mut().zip(docs.into_iter()) {
                *slot = Value::Document(sorted);
            }
        }
        other => {
            let direction = other.as_integer().expect("validated operand");
            elements.sort_by(|a, b| {
                let ord = canonical_cmp(a, b);
                if direction < 0 {
                    ord.reverse()
                } else {
                    ord
                }
            });
        }
    }
    Ok(())
}

fn apply_push_slice(elements: &mut Vec<Value>, limit: i64) {
    if limit >= 0 {
        elements.truncate(limit as usize);
    } else {
        let keep = (-limit) as usize;
        let drop = elements.len().saturating_sub(keep);
        elements.drain(..drop);
    }
}

fn zero_like(argument: &Value) -> Value {
    match argument {
        Value::Double(_) => Value::Double(0.0),
        Value::Int64(_) => Value::Int64(0),
        Value::Decimal128(_) => Value::Decimal128(Decimal128::parse("0").expect("constant")),
        _ => Value::Int32(0),
    }
}

fn arithmetic(
    doc: &mut Document,
    field: &str,
    argument: &Value,
    combine: fn(&Value, &Value) -> MongoResult<Value>,
    on_missing: impl Fn() -> Value,
) -> MongoResult<bool> {
    match path::get(doc, field).cloned() {
        Some(existing) => {
            if !existing.is_number() {
                return Err(MongoError::type_mismatch(format!(
                    "Cannot apply numeric update to field {field:?} of type {}",
                    existing.type_alias()
                )));
            }
            let next = combine(&existing, argument)?;
            let changed = next != existing;
            path::set(doc, field, next)?;
            Ok(changed)
        }
        None => {
            path::set(doc, field, on_missing())?;
            Ok(true)
        }
    }
}

/// Numeric addition with MongoDB's promotion rules: int32 widens to
/// int64 on overflow, any double operand produces a double.
fn add_values(a: &Value, b: &Value) -> MongoResult<Value> {
    numeric_combine(a, b, i64::checked_add, |x, y| x + y)
}

fn mul_values(a: &Value, b: &Value) -> MongoResult<Value> {
    numeric_combine(a, b, i64::checked_mul, |x, y| x * y)
}

fn numeric_combine(
    a: &Value,
    b: &Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> MongoResult<Value> {
    if matches!(a, Value::Decimal128(_)) || matches!(b, Value::Decimal128(_)) {
        return Err(MongoError::new(
            ErrorCode::NotImplemented,
            "decimal arithmetic is not supported",
        ));
    }
    match (a, b) {
        (Value::Double(_), _) | (_, Value::Double(_)) => {
            let result = float_op(a.as_f64().unwrap(), b.as_f64().unwrap());
            Ok(Value::Double(result))
        }
        (Value::Int32(x), Value::Int32(y)) => {
            let wide = int_op(*x as i64, *y as i64).ok_or_else(int_overflow)?;
            Ok(match i32::try_from(wide) {
                Ok(narrow) => Value::Int32(narrow),
                Err(_) => Value::Int64(wide),
            })
        }
        _ => {
            let x = a.as_integer().unwrap();
            let y = b.as_integer().unwrap();
            Ok(Value::Int64(int_op(x, y).ok_or_else(int_overflow)?))
        }
    }
}

fn int_overflow() -> MongoError {
    MongoError::bad_value("integer overflow in update")
}
