//! Dotted field paths: read-side gathering with implicit array traversal
//! and write-side navigation for the update operators.

use mangrove_bson::{Document, Value};
use mangrove_common::{ErrorCode, MongoError, MongoResult};

/// Collects every value reachable at `path`. Array hops are implicit: a
/// component both indexes arrays (when numeric) and descends into each
/// document element. The empty result means the path resolves nowhere,
/// which filters treat as a missing field.
pub fn gather<'a>(doc: &'a Document, path: &str) -> Vec<&'a Value> {
    let parts: Vec<&str> = path.split('.').collect();
    let mut out = Vec::new();
    if let Some(first) = parts.first() {
        if let Some(value) = doc.get(first) {
            gather_into(value, &parts[1..], &mut out);
        }
    }
    out
}

fn gather_into<'a>(value: &'a Value, parts: &[&str], out: &mut Vec<&'a Value>) {
    if parts.is_empty() {
        out.push(value);
        return;
    }
    let head = parts[0];
    match value {
        Value::Document(doc) => {
            if let Some(child) = doc.get(head) {
                gather_into(child, &parts[1..], out);
            }
        }
        Value::Array(elements) => {
            // A numeric component indexes the array...
            if let Ok(index) = head.parse::<usize>() {
                if let Some(child) = elements.get(index) {
                    gather_into(child, &parts[1..], out);
                }
            }
            // ...and the path also descends into document elements.
            for element in elements {
                if matches!(element, Value::Document(_)) {
                    gather_into(element, parts, out);
                }
            }
        }
        _ => {}
    }
}

/// Strict lookup without implicit traversal; numeric components index
/// arrays. This is the write-side view of a path.
pub fn get<'a>(doc: &'a Document, path: &str) -> Option<&'a Value> {
    let mut current = doc.get(path.split('.').next()?)?;
    for part in path.split('.').skip(1) {
        current = match current {
            Value::Document(d) => d.get(part)?,
            Value::Array(a) => a.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Sets the value at `path`, creating intermediate documents and padding
/// arrays with nulls for out-of-range indices. Fails when the path runs
/// through a scalar.
pub fn set(doc: &mut Document, path: &str, value: Value) -> MongoResult<()> {
    let parts: Vec<&str> = path.split('.').collect();
    set_inner(doc, &parts, value, path)
}

fn set_inner(doc: &mut Document, parts: &[&str], value: Value, full: &str) -> MongoResult<()> {
    let head = parts[0];
    if parts.len() == 1 {
        doc.insert(head, value);
        return Ok(());
    }
    if doc.get(head).is_none() {
        doc.insert(head, Document::new());
    }
    match doc.get_mut(head).unwrap() {
        Value::Document(child) => set_inner(child, &parts[1..], value, full),
        Value::Array(elements) => set_in_array(elements, &parts[1..], value, full),
        other => Err(MongoError::new(
            ErrorCode::TypeMismatch,
            format!(
                "cannot create field {:?} in element of type {}",
                parts[1],
                other.type_alias()
            ),
        )),
    }
}

fn set_in_array(
    elements: &mut Vec<Value>,
    parts: &[&str],
    value: Value,
    full: &str,
) -> MongoResult<()> {
    let head = parts[0];
    let index: usize = head.parse().map_err(|_| {
        MongoError::new(
            ErrorCode::TypeMismatch,
            format!("cannot use part {head:?} of {full:?} to traverse an array"),
        )
    })?;
    while elements.len() <= index {
        elements.push(Value::Null);
    }
    if parts.len() == 1 {
        elements[index] = value;
        return Ok(());
    }
    if matches!(elements[index], Value::Null) {
        elements[index] = Value::Document(Document::new());
    }
    match &mut elements[index] {
        Value::Document(child) => set_inner(child, &parts[1..], value, full),
        Value::Array(child) => set_in_array(child, &parts[1..], value, full),
        other => Err(MongoError::new(
            ErrorCode::TypeMismatch,
            format!(
                "cannot create field {:?} in element of type {}",
                parts[1],
                other.type_alias()
            ),
        )),
    }
}

/// Removes the value at `path`. Removing an array element nulls it to
/// keep sibling positions stable. Returns the removed value.
pub fn unset(doc: &mut Document, path: &str) -> Option<Value> {
    let parts: Vec<&str> = path.split('.').collect();
    unset_inner(doc, &parts)
}

fn unset_inner(doc: &mut Document, parts: &[&str]) -> Option<Value> {
    let head = parts[0];
    if parts.len() == 1 {
        return doc.remove(head);
    }
    match doc.get_mut(head)? {
        Value::Document(child) => unset_inner(child, &parts[1..]),
        Value::Array(elements) => unset_in_array(elements, &parts[1..]),
        _ => None,
    }
}

fn unset_in_array(elements: &mut [Value], parts: &[&str]) -> Option<Value> {
    let index: usize = parts[0].parse().ok()?;
    let slot = elements.get_mut(index)?;
    if parts.len() == 1 {
        return Some(std::mem::replace(slot, Value::Null));
    }
    match slot {
        Value::Document(child) => unset_inner(child, &parts[1..]),
        Value::Array(child) => unset_in_array(child, &parts[1..]),
        _ => None,
    }
}
