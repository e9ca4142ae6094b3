//! BSON ObjectId: 12 bytes, 4-byte big-endian seconds + 5 random bytes
//! fixed per process + 3-byte big-endian counter.

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};

use once_cell::sync::Lazy;
use rand::Rng;

use crate::error::BsonError;

static PROCESS_UNIQUE: Lazy<[u8; 5]> = Lazy::new(|| rand::thread_rng().gen());
static COUNTER: Lazy<AtomicU32> =
    Lazy::new(|| AtomicU32::new(rand::thread_rng().gen_range(0..0x00ff_ffff)));

/// A 12-byte BSON ObjectId.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectId(pub [u8; 12]);

impl ObjectId {
    /// Generates a fresh ObjectId from the current time, the per-process
    /// random value and the rolling counter.
    pub fn new() -> Self {
        let secs = chrono::Utc::now().timestamp() as u32;
        let count = COUNTER.fetch_add(1, Ordering::SeqCst) & 0x00ff_ffff;

        let mut bytes = [0u8; 12];
        bytes[0..4].copy_from_slice(&secs.to_be_bytes());
        bytes[4..9].copy_from_slice(&*PROCESS_UNIQUE);
        bytes[9] = (count >> 16) as u8;
        bytes[10] = (count >> 8) as u8;
        bytes[11] = count as u8;
        ObjectId(bytes)
    }

    pub fn from_bytes(bytes: [u8; 12]) -> Self {
        ObjectId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 12] {
        &self.0
    }

    /// Seconds since the epoch encoded in the leading 4 bytes.
    pub fn timestamp(&self) -> u32 {
        u32::from_be_bytes([self.0[0], self.0[1], self.0[2], self.0[3]])
    }

    /// Parses the canonical 24-character lowercase hex form.
    pub fn parse_hex(s: &str) -> Result<Self, BsonError> {
        if s.len() != 24 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(BsonError::InvalidExtendedJson(format!(
                "invalid ObjectId hex {s:?}"
            )));
        }
        let mut bytes = [0u8; 12];
        for (i, byte) in bytes.iter_mut().enumerate() {
            let hi = hex_nibble(s.as_bytes()[2 * i]);
            let lo = hex_nibble(s.as_bytes()[2 * i + 1]);
            *byte = (hi << 4) | lo;
        }
        Ok(ObjectId(bytes))
    }
}

fn hex_nibble(b: u8) -> u8 {
    match b {
        b'0'..=b'9' => b - b'0',
        b'a'..=b'f' => b - b'a' + 10,
        b'A'..=b'F' => b - b'A' + 10,
        _ => 0,
    }
}

impl Default for ObjectId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for ObjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ObjectId({self})")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_ids_are_unique_and_ordered() {
        let a = ObjectId::new();
        let b = ObjectId::new();
        assert_ne!(a, b);
        // Same process, same second: only the counter differs.
        assert_eq!(a.0[4..9], b.0[4..9]);
    }

    #[test]
    fn test_hex_round_trip() {
        let id = ObjectId::new();
        let parsed = ObjectId::parse_hex(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_parse_rejects_bad_input() {
        assert!(ObjectId::parse_hex("xyz").is_err());
        assert!(ObjectId::parse_hex("00112233445566778899aabbcc").is_err()); // 26 chars
        assert!(ObjectId::parse_hex("00112233445566778899aagg").is_err());
    }

    #[test]
    fn test_timestamp_extraction() {
        let id = ObjectId::from_bytes([0x65, 0x00, 0x00, 0x00, 1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(id.timestamp(), 0x6500_0000);
    }
}
