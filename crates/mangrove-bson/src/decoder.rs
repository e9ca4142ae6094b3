//! Strict BSON document decoder.
//!
//! BSON is little-endian. Decoding rejects unknown and deprecated element
//! types, malformed lengths, duplicate field names, non-UTF-8 strings and
//! trailing bytes.

use crate::decimal128::Decimal128;
use crate::document::Document;
use crate::error::BsonError;
use crate::oid::ObjectId;
use crate::value::{Binary, Regex, Value};

/// Decodes one BSON document spanning the whole input.
pub fn decode_document(data: &[u8]) -> Result<Document, BsonError> {
    let mut decoder = Decoder { data, pos: 0 };
    let doc = decoder.read_document()?;
    if decoder.pos != data.len() {
        return Err(BsonError::TrailingBytes);
    }
    Ok(doc)
}

/// Decodes a BSON document from the front of `data`, returning the
/// document and the number of bytes consumed. Used by the wire layer for
/// document sequences.
pub fn decode_document_prefix(data: &[u8]) -> Result<(Document, usize), BsonError> {
    let mut decoder = Decoder { data, pos: 0 };
    let doc = decoder.read_document()?;
    Ok((doc, decoder.pos))
}

struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    fn check(&self, n: usize) -> Result<(), BsonError> {
        if self.pos + n > self.data.len() {
            Err(BsonError::UnexpectedEof)
        } else {
            Ok(())
        }
    }

    fn u8(&mut self) -> Result<u8, BsonError> {
        self.check(1)?;
        let b = self.data[self.pos];
        self.pos += 1;
        Ok(b)
    }

    fn i32_le(&mut self) -> Result<i32, BsonError> {
        self.check(4)?;
        let v = i32::from_le_bytes(self.data[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    fn i64_le(&mut self) -> Result<i64, BsonError> {
        self.check(8)?;
        let v = i64::from_le_bytes(self.data[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    fn u64_le(&mut self) -> Result<u64, BsonError> {
        self.check(8)?;
        let v = u64::from_le_bytes(self.data[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    fn f64_le(&mut self) -> Result<f64, BsonError> {
        self.check(8)?;
        let v = f64::from_le_bytes(self.data[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], BsonError> {
        self.check(n)?;
        let slice = &self.data[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn read_document(&mut self) -> Result<Document, BsonError> {
        let stated = self.i32_le()?;
        if stated < 5 {
            return Err(BsonError::NegativeLength);
        }
        let stated = stated as usize;
        let start = self.pos; // just past the size field
        let end = start
            .checked_add(stated - 4)
            .filter(|end| *end <= self.data.len())
            .ok_or(BsonError::LengthMismatch { stated })?;

        let mut doc = Document::new();
        loop {
            if self.pos >= end {
                return Err(BsonError::LengthMismatch { stated });
            }
            let element_type = self.u8()?;
            if element_type == 0 {
                break;
            }
            let key = self.read_cstring()?;
            let value = self.read_element(element_type)?;
            doc.push_unique(key, value)?;
        }

        // The terminating null must land exactly on the stated boundary.
        if self.pos != end {
            return Err(BsonError::LengthMismatch { stated });
        }
        Ok(doc)
    }

    fn read_cstring(&mut self) -> Result<String, BsonError> {
        let start = self.pos;
        while self.pos < self.data.len() && self.data[self.pos] != 0 {
            self.pos += 1;
        }
        if self.pos >= self.data.len() {
            return Err(BsonError::UnexpectedEof);
        }
        let s = std::str::from_utf8(&self.data[start..self.pos])
            .map_err(|_| BsonError::InvalidUtf8("cstring"))?
            .to_owned();
        self.pos += 1; // null terminator
        Ok(s)
    }

    fn read_string(&mut self) -> Result<String, BsonError> {
        let len = self.i32_le()?;
        if len < 1 {
            return Err(BsonError::NegativeLength);
        }
        let bytes = self.bytes(len as usize - 1)?;
        let s = std::str::from_utf8(bytes)
            .map_err(|_| BsonError::InvalidUtf8("string"))?
            .to_owned();
        if self.u8()? != 0 {
            return Err(BsonError::LengthMismatch {
                stated: len as usize,
            });
        }
        Ok(s)
    }

    fn read_element(&mut self, element_type: u8) -> Result<Value, BsonError> {
        match element_type {
            0x01 => Ok(Value::Double(self.f64_le()?)),
            0x02 => Ok(Value::String(self.read_string()?)),
            0x03 => Ok(Value::Document(self.read_document()?)),
            0x04 => Ok(Value::Array(self.read_array()?)),
            0x05 => {
                let len = self.i32_le()?;
                if len < 0 {
                    return Err(BsonError::NegativeLength);
                }
                let subtype = self.u8()?;
                let bytes = self.bytes(len as usize)?.to_vec();
                Ok(Value::Binary(Binary { subtype, bytes }))
            }
            0x07 => {
                let bytes: [u8; 12] = self.bytes(12)?.try_into().unwrap();
                Ok(Value::ObjectId(ObjectId::from_bytes(bytes)))
            }
            0x08 => match self.u8()? {
                0 => Ok(Value::Bool(false)),
                1 => Ok(Value::Bool(true)),
                b => Err(BsonError::InvalidBool(b)),
            },
            0x09 => Ok(Value::DateTime(self.i64_le()?)),
            0x0a => Ok(Value::Null),
            0x0b => {
                let pattern = self.read_cstring()?;
                let options = self.read_cstring()?;
                Ok(Value::Regex(Regex { pattern, options }))
            }
            0x10 => Ok(Value::Int32(self.i32_le()?)),
            0x11 => Ok(Value::Timestamp(self.u64_le()?)),
            0x12 => Ok(Value::Int64(self.i64_le()?)),
            0x13 => {
                let bytes: [u8; 16] = self.bytes(16)?.try_into().unwrap();
                Ok(Value::Decimal128(Decimal128::from_bytes(bytes)))
            }
            0x7f => Ok(Value::MaxKey),
            0xff => Ok(Value::MinKey),
            // Deprecated kinds (undefined, dbPointer, code, symbol,
            // codeWithScope) are rejected along with unknown bytes.
            t => Err(BsonError::UnsupportedType(t)),
        }
    }

    fn read_array(&mut self) -> Result<Vec<Value>, BsonError> {
        // Arrays are documents keyed "0", "1", ... in order.
        let doc = self.read_document()?;
        Ok(doc.into_iter().map(|(_, v)| v).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::doc;
    use crate::encoder::encode_document;

    #[test]
    fn test_decode_minimal_document() {
        // {} == 5-byte document
        let doc = decode_document(&[5, 0, 0, 0, 0]).unwrap();
        assert!(doc.is_empty());
    }

    #[test]
    fn test_decode_rejects_truncation() {
        let bytes = encode_document(&doc! { "a" => 1 });
        for cut in 1..bytes.len() {
            assert!(
                decode_document(&bytes[..cut]).is_err(),
                "truncation at {cut} must fail"
            );
        }
    }

    #[test]
    fn test_decode_rejects_trailing_bytes() {
        let mut bytes = encode_document(&doc! { "a" => 1 });
        bytes.push(0);
        assert_eq!(decode_document(&bytes), Err(BsonError::TrailingBytes));
    }

    #[test]
    fn test_decode_rejects_unknown_type() {
        // {<0x06 "undefined"> "a"}
        let bytes = [8, 0, 0, 0, 0x06, b'a', 0, 0];
        assert_eq!(
            decode_document(&bytes),
            Err(BsonError::UnsupportedType(0x06))
        );
    }

    #[test]
    fn test_decode_rejects_bad_length() {
        let mut bytes = encode_document(&doc! { "a" => 1 });
        bytes[0] += 1; // lie about the size
        assert!(matches!(
            decode_document(&bytes),
            Err(BsonError::LengthMismatch { .. }) | Err(BsonError::UnexpectedEof)
        ));
    }

    #[test]
    fn test_decode_rejects_duplicate_fields() {
        // Hand-build {"a": 1, "a": 2}
        let mut body = Vec::new();
        for v in [1i32, 2] {
            body.push(0x10);
            body.extend_from_slice(b"a\0");
            body.extend_from_slice(&v.to_le_bytes());
        }
        body.push(0);
        let mut bytes = ((body.len() + 4) as i32).to_le_bytes().to_vec();
        bytes.extend_from_slice(&body);
        assert_eq!(
            decode_document(&bytes),
            Err(BsonError::DuplicateField("a".into()))
        );
    }

    #[test]
    fn test_decode_rejects_invalid_bool() {
        let bytes = [9, 0, 0, 0, 0x08, b'b', 0, 2, 0];
        assert_eq!(decode_document(&bytes), Err(BsonError::InvalidBool(2)));
    }

    #[test]
    fn test_decode_prefix_reports_consumed() {
        let mut bytes = encode_document(&doc! { "a" => 1 });
        let len = bytes.len();
        bytes.extend_from_slice(&encode_document(&doc! { "b" => 2 }));
        let (doc, consumed) = decode_document_prefix(&bytes).unwrap();
        assert_eq!(consumed, len);
        assert_eq!(doc.get("a"), Some(&Value::Int32(1)));
    }
}
