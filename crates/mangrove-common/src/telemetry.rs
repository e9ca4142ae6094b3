//! Telemetry initialization: tracing subscriber with env-filter, optional
//! JSON output, and a layer feeding the in-memory log ring.

use std::sync::Arc;

use anyhow::Result;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

use crate::log_ring::{LogEntry, LogRing};

/// Initialize telemetry (tracing + log ring). Returns the ring that
/// `getLog` reads from.
pub fn init(log_level: &str, json_logs: bool, ring_capacity: usize) -> Result<Arc<LogRing>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let ring = Arc::new(LogRing::new(ring_capacity));
    let ring_layer = RingLayer { ring: ring.clone() };

    let subscriber = tracing_subscriber::registry().with(filter).with(ring_layer);

    if json_logs {
        subscriber
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        subscriber.with(tracing_subscriber::fmt::layer()).init();
    }

    Ok(ring)
}

/// Tracing layer that copies each event's message into the log ring.
struct RingLayer {
    ring: Arc<LogRing>,
}

impl<S: Subscriber> Layer<S> for RingLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = MessageVisitor::default();
        event.record(&mut visitor);
        self.ring.push(LogEntry {
            timestamp: chrono::Utc::now(),
            level: *event.metadata().level(),
            target: event.metadata().target().to_owned(),
            message: visitor.into_message(),
        });
    }
}

/// Collects the `message` field plus any structured fields.
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: Vec<(String, String)>,
}

impl MessageVisitor {
    fn into_message(self) -> String {
        if self.fields.is_empty() {
            return self.message;
        }
        let mut out = self.message;
        for (name, value) in self.fields {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&name);
            out.push('=');
            out.push_str(&value);
        }
        out
    }
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{value:?}");
        } else {
            self.fields
                .push((field.name().to_owned(), format!("{value:?}")));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_owned();
        } else {
            self.fields
                .push((field.name().to_owned(), value.to_owned()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visitor_joins_fields() {
        let visitor = MessageVisitor {
            message: "connected".into(),
            fields: vec![
                ("peer".into(), "10.0.0.1".into()),
                ("db".into(), "app".into()),
            ],
        };
        assert_eq!(visitor.into_message(), "connected peer=10.0.0.1 db=app");
    }

    #[test]
    fn test_bare_message_passes_through() {
        let visitor = MessageVisitor {
            message: "plain".into(),
            fields: vec![],
        };
        assert_eq!(visitor.into_message(), "plain");
    }
}
