//! Per-connection cursor state.
//!
//! Cursors are owned by the connection that opened them: no sharing, no
//! background reaper. Staleness is checked lazily when a cursor is next
//! touched, and every cursor dies with its connection.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use mangrove_bson::Document;
use rand::Rng;
use tracing::debug;

/// One open cursor: the undrained remainder of a result set.
#[derive(Debug)]
pub struct StoredCursor {
    pub db: String,
    pub collection: String,
    remaining: VecDeque<Document>,
    last_accessed: Instant,
}

impl StoredCursor {
    pub fn new(db: String, collection: String, remaining: Vec<Document>) -> Self {
        StoredCursor {
            db,
            collection,
            remaining: remaining.into(),
            last_accessed: Instant::now(),
        }
    }

    /// Namespace string as replies spell it.
    pub fn namespace(&self) -> String {
        format!("{}.{}", self.db, self.collection)
    }

    pub fn touch(&mut self) {
        self.last_accessed = Instant::now();
    }

    pub fn is_stale(&self, ttl: Duration) -> bool {
        self.last_accessed.elapsed() > ttl
    }

    pub fn is_exhausted(&self) -> bool {
        self.remaining.is_empty()
    }

    /// Takes up to `batch_size` documents off the front.
    pub fn next_batch(&mut self, batch_size: usize) -> Vec<Document> {
        let take = batch_size.min(self.remaining.len());
        self.remaining.drain(..take).collect()
    }
}

/// The cursor table of one connection.
pub struct CursorRegistry {
    cursors: HashMap<i64, StoredCursor>,
    next_id: i64,
    ttl: Duration,
}

impl CursorRegistry {
    pub fn new(ttl: Duration) -> Self {
        // Ids count up from a random positive start, so they are unique
        // for the connection's lifetime and never zero.
        let start = rand::thread_rng().gen_range(1..i64::MAX / 2);
        CursorRegistry {
            cursors: HashMap::new(),
            next_id: start,
            ttl,
        }
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    /// Stores a cursor and returns its fresh id.
    pub fn register(&mut self, cursor: StoredCursor) -> i64 {
        let id = self.next_id;
        self.next_id += 1;
        debug!(cursor_id = id, ns = %cursor.namespace(), remaining = cursor.remaining.len(), "cursor opened");
        self.cursors.insert(id, cursor);
        id
    }

    /// Looks a cursor up, reaping it first if its TTL expired.
    pub fn get_mut(&mut self, id: i64) -> Option<&mut StoredCursor> {
        let stale = self
            .cursors
            .get(&id)
            .map(|c| c.is_stale(self.ttl))
            .unwrap_or(false);
        if stale {
            debug!(cursor_id = id, "reaping stale cursor");
            self.cursors.remove(&id);
            return None;
        }
        let cursor = self.cursors.get_mut(&id)?;
        cursor.touch();
        Some(cursor)
    }

    /// Removes a cursor; true when it existed.
    pub fn remove(&mut self, id: i64) -> bool {
        self.cursors.remove(&id).is_some()
    }

    /// Drops every cursor (connection close).
    pub fn clear(&mut self) {
        if !self.cursors.is_empty() {
            debug!(count = self.cursors.len(), "destroying cursors");
        }
        self.cursors.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mangrove_bson::doc;

    fn docs(n: usize) -> Vec<Document> {
        (0..n).map(|i| doc! { "_id" => i as i32 }).collect()
    }

    fn registry() -> CursorRegistry {
        CursorRegistry::new(Duration::from_secs(600))
    }

    #[test]
    fn test_ids_are_nonzero_and_never_reused() {
        let mut registry = registry();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..100 {
            let id = registry.register(StoredCursor::new("db".into(), "c".into(), docs(1)));
            assert_ne!(id, 0);
            assert!(seen.insert(id), "cursor id reused");
            registry.remove(id);
        }
    }

    #[test]
    fn test_batches_drain_in_order() {
        let mut registry = registry();
        let id = registry.register(StoredCursor::new("db".into(), "c".into(), docs(5)));

        let cursor = registry.get_mut(id).unwrap();
        let first = cursor.next_batch(2);
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].get("_id"), Some(&mangrove_bson::Value::Int32(0)));

        assert_eq!(cursor.next_batch(2).len(), 2);
        assert_eq!(cursor.next_batch(2).len(), 1);
        assert!(cursor.is_exhausted());
    }

    #[test]
    fn test_stale_cursors_reaped_on_access() {
        let mut registry = CursorRegistry::new(Duration::from_secs(0));
        let id = registry.register(StoredCursor::new("db".into(), "c".into(), docs(1)));
        std::thread::sleep(Duration::from_millis(5));
        assert!(registry.get_mut(id).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_and_clear() {
        let mut registry = registry();
        let id = registry.register(StoredCursor::new("db".into(), "c".into(), docs(1)));
        assert!(registry.remove(id));
        assert!(!registry.remove(id));

        registry.register(StoredCursor::new("db".into(), "c".into(), docs(1)));
        registry.register(StoredCursor::new("db".into(), "d".into(), docs(1)));
        registry.clear();
        assert!(registry.is_empty());
    }
}
