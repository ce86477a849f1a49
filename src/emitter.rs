//! The single consumer of the ingestion queue.
//!
//! The emitter turns each queued message into an event body (the raw text, or flattened
//! `key=value` pairs) and hands it to the [`Sink`].  Sink failures are logged and the entry is
//! dropped; they never reach the listener or the sender, who was acknowledged long ago.

use std::io;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use chrono::Utc;
use log::{debug, error, info};

use crate::error::SinkWriteError;
use crate::filter::MessageFilter;
use crate::flatten::flatten_with;
use crate::queue::{QueueConsumer, QueueEntry};
use crate::sink::{RoutingAttributes, Sink, SinkEvent};

/// How a message is rendered into an event body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    /// The message text as received (or re-serialized, when a filter is in play).
    Raw,
    /// Flattened `name=value` pairs separated by single spaces.
    KeyValue,
}

/// Totals reported when the emitter stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmitterStats {
    pub written: u64,
    pub dropped: u64,
}

pub struct Emitter {
    mode: OutputMode,
    quote_values: bool,
    filter: MessageFilter,
    routing: RoutingAttributes,
    sink: Arc<Sink>,
}

impl Emitter {
    pub fn new(mode: OutputMode, routing: RoutingAttributes, sink: Arc<Sink>) -> Self {
        Emitter {
            mode,
            quote_values: true,
            filter: MessageFilter::default(),
            routing,
            sink,
        }
    }

    pub fn with_filter(mut self, filter: MessageFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Whether every flattened value is quoted, or only those that need it.
    pub fn with_quoted_values(mut self, quote_values: bool) -> Self {
        self.quote_values = quote_values;
        self
    }

    pub fn mode(&self) -> OutputMode {
        self.mode
    }

    pub fn format(&self, entry: &QueueEntry) -> String {
        match self.mode {
            OutputMode::Raw if self.filter.is_empty() => entry.raw.clone(),
            OutputMode::Raw => self.filter.apply(&entry.message).to_er7(),
            OutputMode::KeyValue => {
                let lines = if self.filter.is_empty() {
                    flatten_with(&entry.message, self.quote_values)
                } else {
                    flatten_with(&self.filter.apply(&entry.message), self.quote_values)
                };
                lines
                    .iter()
                    .map(|line| line.trim_start())
                    .collect::<Vec<_>>()
                    .join(" ")
            }
        }
    }

    /// Writes one event body, stamped with the current time.
    pub fn write(&self, body: &str) -> Result<(), SinkWriteError> {
        self.sink.write(&SinkEvent {
            routing: &self.routing,
            time: Utc::now().timestamp(),
            data: body,
        })
    }

    pub fn emit(&self, entry: &QueueEntry) -> Result<(), SinkWriteError> {
        let body = self.format(entry);
        debug!(
            "EMIT: Sending {} message {} ({} bytes)",
            entry.message.message_type(),
            entry.message.control_id(),
            body.len()
        );
        self.write(&body)
    }

    /// Drains `consumer` until the queue is closed and empty, then terminates the event stream.
    ///
    /// Blocks the calling thread; run it on a thread of its own (see [`spawn`](Self::spawn)).
    pub fn run(&self, mut consumer: QueueConsumer) -> EmitterStats {
        let mut stats = EmitterStats::default();
        while let Some(entry) = consumer.dequeue_blocking() {
            match self.emit(&entry) {
                Ok(()) => stats.written += 1,
                Err(e) => {
                    error!(
                        "EMIT: Dropping message {}: {}",
                        entry.message.control_id(),
                        e
                    );
                    stats.dropped += 1;
                }
            }
        }
        if let Err(e) = self.sink.close() {
            error!("EMIT: Failed to close event stream: {}", e);
        }
        info!(
            "EMIT: Queue drained, {} written, {} dropped",
            stats.written, stats.dropped
        );
        stats
    }

    /// Runs the emitter on a dedicated, named thread.
    pub fn spawn(self, consumer: QueueConsumer) -> io::Result<JoinHandle<EmitterStats>> {
        thread::Builder::new()
            .name("hl7-emitter".to_string())
            .spawn(move || self.run(consumer))
    }
}
