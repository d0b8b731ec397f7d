//! Tracing layer that forwards loader logs to the supervisor.
//!
//! Events become `log` replies on the status channel, carrying level, message,
//! target and any structured fields. Only the process that installed the layer
//! writes: workers and intermediaries inherit the subscriber across `fork()`,
//! but their events stay on stderr so the channel only ever carries worker
//! output in the form of `ack` lines.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::Value;
use tracing::Subscriber;
use tracing::field::{Field, Visit};
use tracing_subscriber::layer::{Context, Layer};

use crate::bridge::channel::StatusWriter;
use crate::bridge::protocol::{LogLevel, Reply};

pub struct StatusLogLayer {
    writer: StatusWriter,
    owner: u32,
}

impl StatusLogLayer {
    /// Forward events on `writer` for as long as the calling process is the
    /// one emitting them.
    pub fn new(writer: StatusWriter) -> Self {
        Self {
            writer,
            owner: std::process::id(),
        }
    }
}

impl<S> Layer<S> for StatusLogLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        if std::process::id() != self.owner {
            return;
        }

        let metadata = event.metadata();
        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);
        // A field the event recorded itself wins over the metadata target.
        visitor
            .fields
            .entry("target".to_string())
            .or_insert_with(|| Value::from(metadata.target()));

        // Nothing sensible to do if the supervisor stopped listening.
        let _ = self.writer.send(&Reply::Log {
            level: LogLevel::from(metadata.level()),
            message: visitor.message,
            fields: visitor.fields,
        });
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: String,
    fields: BTreeMap<String, Value>,
}

impl FieldVisitor {
    fn insert(&mut self, field: &Field, value: Value) {
        if field.name() == "message" {
            self.message = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
        } else {
            self.fields.insert(field.name().to_string(), value);
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.insert(field, Value::from(format!("{value:?}")));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.insert(field, Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.insert(field, Value::from(value));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.insert(field, Value::from(value));
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.insert(field, Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.insert(field, Value::from(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::channel::StatusChannel;
    use std::fs::File;
    use std::io::{BufRead, BufReader};
    use std::os::fd::OwnedFd;
    use std::os::unix::net::UnixStream;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn events_become_log_replies() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let channel = StatusChannel::new(File::from(OwnedFd::from(ours)), 1024);
        let subscriber = tracing_subscriber::registry().with(StatusLogLayer::new(channel.writer()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(worker_id = "w1", pid = 77, "Worker launched");
            tracing::warn!(retry = true, "Something odd");
        });
        drop(channel);

        let mut lines = BufReader::new(theirs).lines();
        let first: Reply = serde_json::from_str(&lines.next().unwrap().unwrap()).unwrap();
        let Reply::Log {
            level,
            message,
            fields,
        } = first
        else {
            panic!("expected a log reply, got {first:?}");
        };
        assert_eq!(level, LogLevel::Info);
        assert_eq!(message, "Worker launched");
        assert_eq!(fields["worker_id"], "w1");
        assert_eq!(fields["pid"], 77);
        assert_eq!(fields["target"], module_path!());

        let second: Reply = serde_json::from_str(&lines.next().unwrap().unwrap()).unwrap();
        assert!(matches!(
            second,
            Reply::Log {
                level: LogLevel::Warn,
                ..
            }
        ));
    }

    #[test]
    fn event_field_named_target_is_kept() {
        let (ours, theirs) = UnixStream::pair().unwrap();
        let channel = StatusChannel::new(File::from(OwnedFd::from(ours)), 1024);
        let subscriber = tracing_subscriber::registry().with(StatusLogLayer::new(channel.writer()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target = "app.rb", "Preloading");
        });
        drop(channel);

        let mut lines = BufReader::new(theirs).lines();
        let reply: Reply = serde_json::from_str(&lines.next().unwrap().unwrap()).unwrap();
        let Reply::Log { fields, .. } = reply else {
            panic!("expected a log reply, got {reply:?}");
        };
        assert_eq!(fields["target"], "app.rb");
        assert_eq!(fields.len(), 1);
    }
}
