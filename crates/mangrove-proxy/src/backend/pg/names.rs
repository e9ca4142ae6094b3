//! Name validation and PostgreSQL identifier mapping.
//!
//! Database names map 1:1 to schemas; collection names map to table
//! names derived deterministically (sanitized, hash-suffixed when the
//! sanitization was lossy). Validation happens before any SQL is issued.

use once_cell::sync::Lazy;
use regex::Regex;

use crate::backend::BackendError;

/// Reserved prefix for internal namespaces.
pub const RESERVED_PREFIX: &str = "_mangrove_";

/// Longest sanitized table name before the hash suffix kicks in.
const MAX_TABLE_LEN: usize = 59;

static DATABASE_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z_-][a-z0-9_-]{0,62}$").unwrap());

static COLLECTION_NAME_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-zA-Z_-][a-zA-Z0-9._-]{0,119}$").unwrap());

/// Validates a database name against the naming rules.
pub fn validate_database_name(db: &str) -> Result<(), BackendError> {
    if !DATABASE_NAME_RE.is_match(db) || db.starts_with(RESERVED_PREFIX) {
        return Err(BackendError::InvalidName(format!(
            "invalid database name {db:?}"
        )));
    }
    Ok(())
}

/// Validates a collection name against the naming rules.
pub fn validate_collection_name(collection: &str) -> Result<(), BackendError> {
    if !COLLECTION_NAME_RE.is_match(collection) || collection.starts_with(RESERVED_PREFIX) {
        return Err(BackendError::InvalidName(format!(
            "invalid collection name {collection:?}"
        )));
    }
    Ok(())
}

/// Quotes a PostgreSQL identifier, doubling embedded quotes.
pub fn quote_ident(ident: &str) -> String {
    let mut out = String::with_capacity(ident.len() + 2);
    out.push('"');
    for c in ident.chars() {
        if c == '"' {
            out.push('"');
        }
        out.push(c);
    }
    out.push('"');
    out
}

/// Derives the backing table name for a collection: lowercased, reduced
/// to `[a-z0-9_]`, hash-suffixed whenever the reduction was lossy or the
/// name would overflow. The settings table stores the authoritative
/// mapping; this function only picks the name at creation time.
pub fn derive_table_name(collection: &str) -> String {
    let mut sanitized = String::with_capacity(collection.len());
    for c in collection.chars() {
        let lower = c.to_ascii_lowercase();
        if lower.is_ascii_lowercase() || lower.is_ascii_digit() || lower == '_' {
            sanitized.push(lower);
        }
    }

    let lossy = sanitized != collection
        || sanitized.is_empty()
        || sanitized.starts_with(|c: char| c.is_ascii_digit());

    if !lossy && sanitized.len() <= MAX_TABLE_LEN {
        return sanitized;
    }

    sanitized.truncate(MAX_TABLE_LEN.saturating_sub(9));
    format!("{sanitized}_{:08x}", fnv1a32(collection.as_bytes()))
}

/// Derives the PostgreSQL index name for a collection index. The hash of
/// the MongoDB index name keeps the result unique per table and inside
/// PostgreSQL's 63-byte identifier limit.
pub fn derive_index_name(table: &str, index: &str) -> String {
    let mut prefix = table.to_owned();
    prefix.truncate(45);
    format!("{prefix}_{:08x}_idx", fnv1a32(index.as_bytes()))
}

fn fnv1a32(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 0x811c_9dc5;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_name_rules() {
        assert!(validate_database_name("app").is_ok());
        assert!(validate_database_name("my-db_1").is_ok());
        assert!(validate_database_name("_private").is_ok());

        assert!(validate_database_name("").is_err());
        assert!(validate_database_name("1app").is_err());
        assert!(validate_database_name("App").is_err());
        assert!(validate_database_name("has space").is_err());
        assert!(validate_database_name(&"a".repeat(64)).is_err());
        assert!(validate_database_name("_mangrove_x").is_err());
    }

    #[test]
    fn test_collection_name_rules() {
        assert!(validate_collection_name("Orders").is_ok());
        assert!(validate_collection_name("a.b.c").is_ok());
        assert!(validate_collection_name("_tmp").is_ok());

        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name("5days").is_err());
        assert!(validate_collection_name("with space").is_err());
        assert!(validate_collection_name("_mangrove_settings").is_err());
    }

    #[test]
    fn test_clean_names_map_directly() {
        assert_eq!(derive_table_name("orders"), "orders");
        assert_eq!(derive_table_name("order_items"), "order_items");
    }

    #[test]
    fn test_lossy_names_get_hash_suffix() {
        let name = derive_table_name("Orders");
        assert!(name.starts_with("orders_"), "{name}");
        assert_eq!(name.len(), "orders_".len() + 8);

        let dotted = derive_table_name("a.b");
        assert!(dotted.starts_with("ab_"), "{dotted}");
    }

    #[test]
    fn test_distinct_originals_stay_distinct() {
        // Both sanitize to "ab" but the hash disambiguates.
        assert_ne!(derive_table_name("a.b"), derive_table_name("a-b"));
    }

    #[test]
    fn test_long_names_are_bounded() {
        let long = "x".repeat(120);
        let name = derive_table_name(&long);
        assert!(name.len() <= MAX_TABLE_LEN);
    }

    #[test]
    fn test_index_names_are_bounded_and_distinct() {
        let a = derive_index_name("orders", "a_1");
        let b = derive_index_name("orders", "b_1");
        assert_ne!(a, b);
        assert!(a.starts_with("orders_"));

        let long = derive_index_name(&"t".repeat(59), "a_1_b_1_c_1");
        assert!(long.len() <= 63);
    }

    #[test]
    fn test_quote_ident_escapes_quotes() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
