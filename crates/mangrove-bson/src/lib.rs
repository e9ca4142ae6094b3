//! BSON value model and codecs for Mangrove.
//!
//! Three representations of the same data model:
//!
//! - the in-memory [`Value`]/[`Document`] tree,
//! - the BSON wire form ([`decode_document`]/[`encode_document`]),
//! - the canonical JSONB form stored in PostgreSQL ([`pgjson`]).
//!
//! Cross-type comparison semantics live in [`order`]; they are shared by
//! sorting, range filters and `$min`/`$max`.

pub mod decimal128;
pub mod decoder;
pub mod document;
pub mod encoder;
pub mod error;
pub mod oid;
pub mod order;
pub mod pgjson;
pub mod value;

pub use decimal128::Decimal128;
pub use decoder::{decode_document, decode_document_prefix};
pub use document::Document;
pub use encoder::encode_document;
pub use error::BsonError;
pub use oid::ObjectId;
pub use order::{canonical_cmp, canonical_eq, same_type_bracket};
pub use value::{Binary, Regex, Value};
