//! Canonical BSON document encoder.
//!
//! Field order is preserved and tagged integer kinds keep their tags; the
//! encoder never re-narrows an int64 to int32 or vice versa.

use crate::document::Document;
use crate::value::Value;

/// Encodes a document to its BSON byte form.
pub fn encode_document(doc: &Document) -> Vec<u8> {
    let mut buf = Vec::with_capacity(64);
    write_document(&mut buf, doc);
    buf
}

fn write_document(buf: &mut Vec<u8>, doc: &Document) {
    let size_at = buf.len();
    buf.extend_from_slice(&[0u8; 4]); // patched below
    for (key, value) in doc.iter() {
        write_element(buf, key, value);
    }
    buf.push(0);
    let size = (buf.len() - size_at) as i32;
    buf[size_at..size_at + 4].copy_from_slice(&size.to_le_bytes());
}

fn write_element(buf: &mut Vec<u8>, key: &str, value: &Value) {
    buf.push(value.type_byte());
    write_cstring(buf, key);
    match value {
        Value::Double(d) => buf.extend_from_slice(&d.to_le_bytes()),
        Value::String(s) => write_string(buf, s),
        Value::Document(doc) => write_document(buf, doc),
        Value::Array(values) => {
            let size_at = buf.len();
            buf.extend_from_slice(&[0u8; 4]);
            for (i, v) in values.iter().enumerate() {
                write_element(buf, &i.to_string(), v);
            }
            buf.push(0);
            let size = (buf.len() - size_at) as i32;
            buf[size_at..size_at + 4].copy_from_slice(&size.to_le_bytes());
        }
        Value::Binary(bin) => {
            buf.extend_from_slice(&(bin.bytes.len() as i32).to_le_bytes());
            buf.push(bin.subtype);
            buf.extend_from_slice(&bin.bytes);
        }
        Value::ObjectId(id) => buf.extend_from_slice(id.as_bytes()),
        Value::Bool(b) => buf.push(*b as u8),
        Value::DateTime(ms) => buf.extend_from_slice(&ms.to_le_bytes()),
        Value::Null | Value::MinKey | Value::MaxKey => {}
        Value::Regex(re) => {
            write_cstring(buf, &re.pattern);
            write_cstring(buf, &re.options);
        }
        Value::Int32(i) => buf.extend_from_slice(&i.to_le_bytes()),
        Value::Timestamp(ts) => buf.extend_from_slice(&ts.to_le_bytes()),
        Value::Int64(i) => buf.extend_from_slice(&i.to_le_bytes()),
        Value::Decimal128(dec) => buf.extend_from_slice(dec.as_bytes()),
    }
}

/// Null-terminated cstring. BSON keys and regex parts cannot contain
/// interior nulls; anything after one is dropped.
fn write_cstring(buf: &mut Vec<u8>, s: &str) {
    match s.as_bytes().iter().position(|&b| b == 0) {
        Some(pos) => buf.extend_from_slice(&s.as_bytes()[..pos]),
        None => buf.extend_from_slice(s.as_bytes()),
    }
    buf.push(0);
}

/// Length-prefixed string: i32 (bytes + 1), UTF-8 bytes, null.
fn write_string(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&((s.len() + 1) as i32).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode_document;
    use crate::decimal128::Decimal128;
    use crate::doc;
    use crate::oid::ObjectId;
    use crate::value::{Binary, Regex};

    fn sample() -> Document {
        doc! {
            "double" => 3.5,
            "string" => "hello",
            "doc" => doc! { "nested" => true },
            "arr" => vec![Value::Int32(1), Value::String("two".into())],
            "bin" => Value::Binary(Binary { subtype: 0x80, bytes: vec![1, 2, 3] }),
            "oid" => ObjectId::from_bytes([1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]),
            "bool" => false,
            "date" => Value::DateTime(1_700_000_000_000),
            "null" => Value::Null,
            "re" => Value::Regex(Regex { pattern: "^a".into(), options: "i".into() }),
            "i32" => 42,
            "ts" => Value::Timestamp(7_000_000_001),
            "i64" => 9_000_000_000i64,
            "dec" => Value::Decimal128(Decimal128::parse("10.5").unwrap()),
            "min" => Value::MinKey,
            "max" => Value::MaxKey,
        }
    }

    #[test]
    fn test_round_trip_all_kinds() {
        let doc = sample();
        let bytes = encode_document(&doc);
        let decoded = decode_document(&bytes).unwrap();
        assert_eq!(doc, decoded);
    }

    #[test]
    fn test_encode_is_idempotent() {
        let bytes = encode_document(&sample());
        let again = encode_document(&decode_document(&bytes).unwrap());
        assert_eq!(bytes, again);
    }

    #[test]
    fn test_integer_tags_are_preserved() {
        // An int64 that fits in 32 bits must stay an int64.
        let doc = doc! { "n" => Value::Int64(7) };
        let decoded = decode_document(&encode_document(&doc)).unwrap();
        assert_eq!(decoded.get("n"), Some(&Value::Int64(7)));
    }

    #[test]
    fn test_empty_document_is_five_bytes() {
        assert_eq!(encode_document(&Document::new()), vec![5, 0, 0, 0, 0]);
    }

    #[test]
    fn test_array_keys_are_indices() {
        let doc = doc! { "a" => vec![Value::Int32(10), Value::Int32(20)] };
        let bytes = encode_document(&doc);
        // The nested array document contains cstrings "0" and "1".
        let needle0 = [0x10, b'0', 0x00];
        let needle1 = [0x10, b'1', 0x00];
        assert!(bytes.windows(3).any(|w| w == needle0));
        assert!(bytes.windows(3).any(|w| w == needle1));
    }
}
