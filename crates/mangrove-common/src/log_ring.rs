//! Bounded in-memory ring of recent log lines.
//!
//! The `getLog` command serves its `global` view from this ring; a
//! tracing layer in [`crate::telemetry`] feeds it.

use std::collections::VecDeque;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::RwLock;

/// One retained log line.
#[derive(Debug, Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: tracing::Level,
    pub target: String,
    pub message: String,
}

impl LogEntry {
    /// Renders the entry the way `getLog` exposes it.
    pub fn render(&self) -> String {
        format!(
            "{} {:>5} [{}] {}",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.level,
            self.target,
            self.message
        )
    }
}

/// Fixed-capacity ring buffer of log entries.
pub struct LogRing {
    entries: RwLock<VecDeque<LogEntry>>,
    capacity: usize,
}

impl LogRing {
    pub fn new(capacity: usize) -> Self {
        LogRing {
            entries: RwLock::new(VecDeque::with_capacity(capacity)),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, entry: LogEntry) {
        let mut entries = self.entries.write();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Most recent `limit` lines, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<String> {
        let entries = self.entries.read();
        let skip = entries.len().saturating_sub(limit);
        entries.iter().skip(skip).map(LogEntry::render).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(message: &str) -> LogEntry {
        LogEntry {
            timestamp: Utc::now(),
            level: tracing::Level::INFO,
            target: "test".into(),
            message: message.into(),
        }
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let ring = LogRing::new(3);
        for i in 0..5 {
            ring.push(entry(&format!("line {i}")));
        }
        let lines = ring.recent(10);
        assert_eq!(lines.len(), 3);
        assert!(lines[0].ends_with("line 2"));
        assert!(lines[2].ends_with("line 4"));
    }

    #[test]
    fn test_recent_limits_and_orders() {
        let ring = LogRing::new(10);
        for i in 0..4 {
            ring.push(entry(&format!("m{i}")));
        }
        let lines = ring.recent(2);
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("m2"));
        assert!(lines[1].ends_with("m3"));
    }
}
