//! Canonical JSONB mapping: the on-disk form of BSON values.
//!
//! Documents are stored in a single JSONB column as MongoDB Extended JSON
//! v2 canonical mode: every type that plain JSON cannot carry losslessly
//! is wrapped in a `$`-tagged object (`{"$oid": ...}`,
//! `{"$date": {"$numberLong": ...}}`, `{"$numberInt": ...}`). The mapping
//! round-trips exactly: `from_canonical_json(to_canonical_json(v)) == v`
//! with the original type tag intact.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Map, Number};

use crate::decimal128::Decimal128;
use crate::document::Document;
use crate::error::BsonError;
use crate::oid::ObjectId;
use crate::value::{Binary, Regex, Value};

/// Encodes a document into its canonical JSONB object.
pub fn document_to_json(doc: &Document) -> serde_json::Value {
    let mut map = Map::with_capacity(doc.len());
    for (key, value) in doc.iter() {
        map.insert(key.to_owned(), value_to_json(value));
    }
    serde_json::Value::Object(map)
}

/// Decodes a canonical JSONB object back into a document.
pub fn document_from_json(json: &serde_json::Value) -> Result<Document, BsonError> {
    match json {
        serde_json::Value::Object(map) => {
            let mut doc = Document::with_capacity(map.len());
            for (key, value) in map {
                doc.push_unique(key.clone(), value_from_json(value)?)?;
            }
            Ok(doc)
        }
        other => Err(BsonError::InvalidExtendedJson(format!(
            "expected object at document root, got {other}"
        ))),
    }
}

/// Encodes a single value into its canonical JSON form.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::Double(d) => json!({ "$numberDouble": double_to_string(*d) }),
        Value::String(s) => serde_json::Value::String(s.clone()),
        Value::Document(doc) => document_to_json(doc),
        Value::Array(values) => {
            serde_json::Value::Array(values.iter().map(value_to_json).collect())
        }
        Value::Binary(bin) => json!({
            "$binary": {
                "base64": BASE64.encode(&bin.bytes),
                "subType": format!("{:02x}", bin.subtype),
            }
        }),
        Value::ObjectId(id) => json!({ "$oid": id.to_string() }),
        Value::Bool(b) => serde_json::Value::Bool(*b),
        Value::DateTime(ms) => json!({ "$date": { "$numberLong": ms.to_string() } }),
        Value::Null => serde_json::Value::Null,
        Value::Regex(re) => json!({
            "$regularExpression": { "pattern": re.pattern, "options": re.options }
        }),
        Value::Int32(i) => json!({ "$numberInt": i.to_string() }),
        Value::Timestamp(ts) => json!({
            "$timestamp": { "t": (ts >> 32) as u32, "i": *ts as u32 }
        }),
        Value::Int64(i) => json!({ "$numberLong": i.to_string() }),
        Value::Decimal128(dec) => json!({ "$numberDecimal": dec.to_string() }),
        Value::MinKey => json!({ "$minKey": 1 }),
        Value::MaxKey => json!({ "$maxKey": 1 }),
    }
}

/// Decodes one canonical JSON value.
pub fn value_from_json(json: &serde_json::Value) -> Result<Value, BsonError> {
    match json {
        serde_json::Value::Null => Ok(Value::Null),
        serde_json::Value::Bool(b) => Ok(Value::Bool(*b)),
        serde_json::Value::String(s) => Ok(Value::String(s.clone())),
        // Untagged numbers do not appear in our own output but JSONB
        // operators can synthesize them; map them to the nearest kind.
        serde_json::Value::Number(n) => Ok(number_to_value(n)),
        serde_json::Value::Array(values) => {
            let decoded: Result<Vec<_>, _> = values.iter().map(value_from_json).collect();
            Ok(Value::Array(decoded?))
        }
        serde_json::Value::Object(map) => {
            if let Some(value) = try_tagged(map)? {
                return Ok(value);
            }
            let mut doc = Document::with_capacity(map.len());
            for (key, value) in map {
                doc.push_unique(key.clone(), value_from_json(value)?)?;
            }
            Ok(Value::Document(doc))
        }
    }
}

fn number_to_value(n: &Number) -> Value {
    if let Some(i) = n.as_i64() {
        Value::Int64(i)
    } else {
        Value::Double(n.as_f64().unwrap_or(f64::NAN))
    }
}

/// Recognizes the `$`-tagged wrapper shapes. Returns Ok(None) for plain
/// objects.
fn try_tagged(map: &Map<String, serde_json::Value>) -> Result<Option<Value>, BsonError> {
    let bad = |what: &str| BsonError::InvalidExtendedJson(format!("malformed {what} wrapper"));

    if map.len() != 1 {
        return Ok(None);
    }
    let (tag, inner) = map.iter().next().unwrap();

    let value = match tag.as_str() {
        "$oid" => {
            let hex = inner.as_str().ok_or_else(|| bad("$oid"))?;
            Value::ObjectId(ObjectId::parse_hex(hex)?)
        }
        "$numberInt" => {
            let s = inner.as_str().ok_or_else(|| bad("$numberInt"))?;
            Value::Int32(s.parse().map_err(|_| bad("$numberInt"))?)
        }
        "$numberLong" => {
            let s = inner.as_str().ok_or_else(|| bad("$numberLong"))?;
            Value::Int64(s.parse().map_err(|_| bad("$numberLong"))?)
        }
        "$numberDouble" => {
            let s = inner.as_str().ok_or_else(|| bad("$numberDouble"))?;
            Value::Double(double_from_string(s).ok_or_else(|| bad("$numberDouble"))?)
        }
        "$numberDecimal" => {
            let s = inner.as_str().ok_or_else(|| bad("$numberDecimal"))?;
            Value::Decimal128(Decimal128::parse(s)?)
        }
        "$date" => {
            let ms = inner
                .get("$numberLong")
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse().ok())
                .ok_or_else(|| bad("$date"))?;
            Value::DateTime(ms)
        }
        "$timestamp" => {
            let t = inner
                .get("t")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| bad("$timestamp"))?;
            let i = inner
                .get("i")
                .and_then(|v| v.as_u64())
                .ok_or_else(|| bad("$timestamp"))?;
            Value::Timestamp((t << 32) | (i & 0xffff_ffff))
        }
        "$binary" => {
            let base64 = inner
                .get("base64")
                .and_then(|v| v.as_str())
                .ok_or_else(|| bad("$binary"))?;
            let subtype = inner
                .get("subType")
                .and_then(|v| v.as_str())
                .and_then(|s| u8::from_str_radix(s, 16).ok())
                .ok_or_else(|| bad("$binary"))?;
            let bytes = BASE64.decode(base64).map_err(|_| bad("$binary"))?;
            Value::Binary(Binary { subtype, bytes })
        }
        "$regularExpression" => {
            let pattern = inner
                .get("pattern")
                .and_then(|v| v.as_str())
                .ok_or_else(|| bad("$regularExpression"))?;
            let options = inner
                .get("options")
                .and_then(|v| v.as_str())
                .ok_or_else(|| bad("$regularExpression"))?;
            Value::Regex(Regex {
                pattern: pattern.to_owned(),
                options: options.to_owned(),
            })
        }
        "$minKey" => Value::MinKey,
        "$maxKey" => Value::MaxKey,
        _ => return Ok(None),
    };
    Ok(Some(value))
}

fn double_to_string(d: f64) -> String {
    if d.is_nan() {
        "NaN".to_owned()
    } else if d == f64::INFINITY {
        "Infinity".to_owned()
    } else if d == f64::NEG_INFINITY {
        "-Infinity".to_owned()
    } else {
        // Rust's shortest round-trip formatting.
        format!("{d}")
    }
}

fn double_from_string(s: &str) -> Option<f64> {
    match s {
        "NaN" => Some(f64::NAN),
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        _ => s.parse().ok(),
    }
}
