//! In-process log capture. The core emits structured records into a bounded
//! ring; retention on disk and rendering belong to the consumer, which
//! polls `records_since` through the control API.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// Maximum number of records kept in memory.
const MAX_LOG_RECORDS: usize = 500;

/// One captured log event. `seq` increases monotonically, so a poller asks
/// for everything after the last sequence number it has seen.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub seq: u64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
}

#[derive(Debug, Default)]
struct BufferInner {
    records: VecDeque<LogRecord>,
    next_seq: u64,
}

/// Thread-safe bounded record buffer.
#[derive(Debug, Clone, Default)]
pub struct LogBuffer {
    inner: Arc<Mutex<BufferInner>>,
}

impl LogBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, level: &str, target: &str, message: &str) {
        let timestamp = chrono::Local::now().format("%H:%M:%S%.3f").to_string();
        let mut inner = self.inner.lock().unwrap();
        inner.next_seq += 1;
        let record = LogRecord {
            seq: inner.next_seq,
            timestamp,
            level: level.to_string(),
            target: target.to_string(),
            message: message.to_string(),
        };
        if inner.records.len() >= MAX_LOG_RECORDS {
            inner.records.pop_front();
        }
        inner.records.push_back(record);
    }

    /// Records with a sequence number greater than `since`, oldest first.
    pub fn records_since(&self, since: u64) -> Vec<LogRecord> {
        let inner = self.inner.lock().unwrap();
        inner
            .records
            .iter()
            .filter(|r| r.seq > since)
            .cloned()
            .collect()
    }

    pub fn clear(&self) {
        self.inner.lock().unwrap().records.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().records.is_empty()
    }
}

/// Pulls the `message` field out of a tracing event.
struct MessageVisitor {
    message: String,
}

impl Visit for MessageVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
            if self.message.starts_with('"') && self.message.ends_with('"') {
                self.message = self.message[1..self.message.len() - 1].to_string();
            }
        } else if self.message.is_empty() {
            self.message = format!("{}={:?}", field.name(), value);
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" || self.message.is_empty() {
            self.message = value.to_string();
        }
    }
}

/// A tracing layer that copies every event into a [`LogBuffer`].
pub struct LogCaptureLayer {
    buffer: LogBuffer,
}

impl LogCaptureLayer {
    pub fn new(buffer: LogBuffer) -> Self {
        Self { buffer }
    }
}

impl<S> Layer<S> for LogCaptureLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();

        let mut visitor = MessageVisitor {
            message: String::new(),
        };
        event.record(&mut visitor);

        self.buffer.push(
            metadata.level().as_str(),
            metadata.target(),
            &visitor.message,
        );
    }
}
