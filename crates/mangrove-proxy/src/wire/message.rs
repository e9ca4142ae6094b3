//! OP_MSG / OP_QUERY parsing and reply construction.
//!
//! OP_MSG is the primary path; OP_QUERY survives only for the legacy
//! handshake (`hello`/`isMaster` against `*.$cmd`), answered with
//! OP_REPLY.

use mangrove_bson::{
    decode_document, decode_document_prefix, encode_document, BsonError, Document, Value,
};

use super::constants::{FLAG_CHECKSUM_PRESENT, KNOWN_REQUEST_FLAGS, OP_MSG, OP_QUERY, OP_REPLY};
use super::frame::FrameError;

/// A decoded client request.
#[derive(Debug)]
pub enum Request {
    /// OP_MSG with document sequences folded into the command document.
    Msg { flags: u32, document: Document },
    /// Legacy OP_QUERY against `<db>.$cmd`.
    Query {
        collection: String,
        document: Document,
    },
}

impl Request {
    /// Parses a request body for the given opcode.
    pub fn parse(op_code: i32, body: &[u8]) -> Result<Request, FrameError> {
        match op_code {
            OP_MSG => parse_msg(body),
            OP_QUERY => parse_query(body),
            other => Err(FrameError::UnsupportedOpcode(other)),
        }
    }

    /// The command document.
    pub fn document(&self) -> &Document {
        match self {
            Request::Msg { document, .. } => document,
            Request::Query { document, .. } => document,
        }
    }

    pub fn into_document(self) -> Document {
        match self {
            Request::Msg { document, .. } => document,
            Request::Query { document, .. } => document,
        }
    }

    /// Opcode the reply must use.
    pub fn reply_op_code(&self) -> i32 {
        match self {
            Request::Msg { .. } => OP_MSG,
            Request::Query { .. } => OP_REPLY,
        }
    }
}

fn malformed(section: &'static str, detail: impl Into<String>) -> FrameError {
    FrameError::Malformed {
        section,
        detail: detail.into(),
    }
}

fn invalid_bson(section: &'static str) -> impl Fn(BsonError) -> FrameError {
    move |source| FrameError::InvalidBson { section, source }
}

fn parse_msg(body: &[u8]) -> Result<Request, FrameError> {
    if body.len() < 5 {
        return Err(malformed("OP_MSG", "body shorter than flags + section"));
    }
    let flags = u32::from_le_bytes(body[0..4].try_into().unwrap());
    if flags & !KNOWN_REQUEST_FLAGS != 0 {
        return Err(malformed("OP_MSG", format!("unknown flag bits 0x{flags:x}")));
    }

    // The trailing CRC-32C is recognized but not validated.
    let end = if flags & FLAG_CHECKSUM_PRESENT != 0 {
        body.len()
            .checked_sub(4)
            .ok_or_else(|| malformed("OP_MSG", "checksum flag without checksum bytes"))?
    } else {
        body.len()
    };

    let mut pos = 4;
    let mut main: Option<Document> = None;
    let mut sequences: Vec<(String, Vec<Value>)> = Vec::new();

    while pos < end {
        let kind = body[pos];
        pos += 1;
        match kind {
            0 => {
                let (doc, used) = decode_document_prefix(&body[pos..end])
                    .map_err(invalid_bson("OP_MSG section 0"))?;
                pos += used;
                if main.replace(doc).is_some() {
                    return Err(malformed("OP_MSG", "multiple kind-0 sections"));
                }
            }
            1 => {
                if pos + 4 > end {
                    return Err(malformed("OP_MSG section 1", "truncated size"));
                }
                let size = i32::from_le_bytes(body[pos..pos + 4].try_into().unwrap());
                if size < 5 || pos + size as usize > end {
                    return Err(malformed("OP_MSG section 1", "size out of bounds"));
                }
                let section_end = pos + size as usize;
                pos += 4;

                let identifier_end = body[pos..section_end]
                    .iter()
                    .position(|&b| b == 0)
                    .ok_or_else(|| malformed("OP_MSG section 1", "unterminated identifier"))?;
                let identifier = std::str::from_utf8(&body[pos..pos + identifier_end])
                    .map_err(|_| malformed("OP_MSG section 1", "identifier not UTF-8"))?
                    .to_owned();
                pos += identifier_end + 1;

                let mut documents = Vec::new();
                while pos < section_end {
                    let (doc, used) = decode_document_prefix(&body[pos..section_end])
                        .map_err(invalid_bson("OP_MSG section 1"))?;
                    pos += used;
                    documents.push(Value::Document(doc));
                }
                sequences.push((identifier, documents));
            }
            other => {
                return Err(malformed(
                    "OP_MSG",
                    format!("unsupported section kind {other}"),
                ))
            }
        }
    }

    let mut document = main.ok_or_else(|| malformed("OP_MSG", "missing kind-0 section"))?;
    // Document sequences are equivalent to inline arrays of the same name.
    for (identifier, documents) in sequences {
        if document.contains_key(&identifier) {
            return Err(malformed(
                "OP_MSG",
                format!("sequence {identifier:?} duplicates a body field"),
            ));
        }
        document.insert(identifier, Value::Array(documents));
    }

    Ok(Request::Msg { flags, document })
}

fn parse_query(body: &[u8]) -> Result<Request, FrameError> {
    if body.len() < 4 {
        return Err(malformed("OP_QUERY", "missing flags"));
    }
    let mut pos = 4; // flags ignored

    let name_end = body[pos..]
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| malformed("OP_QUERY", "unterminated collection name"))?;
    let collection = std::str::from_utf8(&body[pos..pos + name_end])
        .map_err(|_| malformed("OP_QUERY", "collection name not UTF-8"))?
        .to_owned();
    pos += name_end + 1;

    // numberToSkip and numberToReturn.
    if pos + 8 > body.len() {
        return Err(malformed("OP_QUERY", "truncated skip/return"));
    }
    pos += 8;

    let (document, used) = decode_document_prefix(&body[pos..])
        .map_err(invalid_bson("OP_QUERY"))?;
    pos += used;
    // An optional returnFieldsSelector may follow; it is ignored.
    if pos < body.len() {
        decode_document(&body[pos..]).map_err(invalid_bson("OP_QUERY selector"))?;
    }

    // Some drivers wrap the handshake in {"$query": {...}}.
    let document = match document.get("$query") {
        Some(Value::Document(inner)) => inner.clone(),
        _ => document,
    };

    Ok(Request::Query {
        collection,
        document,
    })
}

/// Builds an OP_MSG reply body: flags 0 + one kind-0 section.
pub fn build_msg_body(reply: &Document) -> Vec<u8> {
    let doc = encode_document(reply);
    let mut body = Vec::with_capacity(5 + doc.len());
    body.extend_from_slice(&0u32.to_le_bytes());
    body.push(0);
    body.extend_from_slice(&doc);
    body
}

/// Builds an OP_REPLY body carrying one document.
pub fn build_reply_body(reply: &Document) -> Vec<u8> {
    let doc = encode_document(reply);
    let mut body = Vec::with_capacity(20 + doc.len());
    body.extend_from_slice(&8i32.to_le_bytes()); // responseFlags: AwaitCapable
    body.extend_from_slice(&0i64.to_le_bytes()); // cursorID
    body.extend_from_slice(&0i32.to_le_bytes()); // startingFrom
    body.extend_from_slice(&1i32.to_le_bytes()); // numberReturned
    body.extend_from_slice(&doc);
    body
}

#[cfg(test)]
mod tests {
    use super::*;
    use mangrove_bson::doc;

    fn msg_body(flags: u32, doc: &Document) -> Vec<u8> {
        let mut body = flags.to_le_bytes().to_vec();
        body.push(0);
        body.extend_from_slice(&encode_document(doc));
        body
    }

    #[test]
    fn test_parse_msg_kind0() {
        let body = msg_body(0, &doc! { "ping" => 1, "$db" => "admin" });
        let request = Request::parse(OP_MSG, &body).unwrap();
        assert_eq!(request.document().command_name(), Some("ping"));
        assert_eq!(request.reply_op_code(), OP_MSG);
    }

    #[test]
    fn test_parse_msg_folds_sequences() {
        let mut body = msg_body(0, &doc! { "insert" => "orders", "$db" => "shop" });

        // Append a kind-1 section "documents" with two documents.
        let d1 = encode_document(&doc! { "a" => 1 });
        let d2 = encode_document(&doc! { "a" => 2 });
        let identifier = b"documents\0";
        let size = 4 + identifier.len() + d1.len() + d2.len();
        body.push(1);
        body.extend_from_slice(&(size as i32).to_le_bytes());
        body.extend_from_slice(identifier);
        body.extend_from_slice(&d1);
        body.extend_from_slice(&d2);

        let request = Request::parse(OP_MSG, &body).unwrap();
        let docs = request.document().get_array("documents").unwrap();
        assert_eq!(docs.len(), 2);
    }

    #[test]
    fn test_parse_msg_rejects_unknown_flags() {
        let body = msg_body(1 << 5, &doc! { "ping" => 1 });
        assert!(Request::parse(OP_MSG, &body).is_err());
    }

    #[test]
    fn test_parse_msg_tolerates_checksum_flag() {
        let mut body = msg_body(FLAG_CHECKSUM_PRESENT, &doc! { "ping" => 1 });
        body.extend_from_slice(&[0xde, 0xad, 0xbe, 0xef]);
        let request = Request::parse(OP_MSG, &body).unwrap();
        assert_eq!(request.document().command_name(), Some("ping"));
    }

    #[test]
    fn test_parse_query_handshake() {
        let mut body = 0i32.to_le_bytes().to_vec();
        body.extend_from_slice(b"admin.$cmd\0");
        body.extend_from_slice(&0i32.to_le_bytes()); // skip
        body.extend_from_slice(&(-1i32).to_le_bytes()); // return
        body.extend_from_slice(&encode_document(&doc! { "isMaster" => 1 }));

        let request = Request::parse(OP_QUERY, &body).unwrap();
        match &request {
            Request::Query { collection, .. } => assert_eq!(collection, "admin.$cmd"),
            _ => panic!("expected Query"),
        }
        assert_eq!(request.reply_op_code(), OP_REPLY);
    }

    #[test]
    fn test_parse_rejects_unknown_opcode() {
        let err = Request::parse(2005, &[]).unwrap_err();
        assert!(matches!(err, FrameError::UnsupportedOpcode(2005)));
    }

    #[test]
    fn test_reply_bodies_embed_the_document() {
        let reply = doc! { "ok" => 1.0 };
        let encoded = encode_document(&reply);

        let msg = build_msg_body(&reply);
        assert_eq!(&msg[5..], &encoded[..]);
        assert_eq!(msg[4], 0); // kind 0

        let legacy = build_reply_body(&reply);
        assert_eq!(&legacy[20..], &encoded[..]);
    }
}
