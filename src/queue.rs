//! The hand-off between connection handlers (many producers) and the emitter (one consumer).
//!
//! Enqueueing never waits for the consumer, so acknowledgment latency does not depend on how fast
//! the sink drains.  Entries come out in the order they went in across all producers.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::error::QueueClosed;
use crate::message::Message;

/// One received message: the raw text as it came off the wire plus its parsed tree.
#[derive(Debug, Clone)]
pub struct QueueEntry {
    pub raw: String,
    pub message: Message,
}

impl QueueEntry {
    pub fn new(raw: impl Into<String>, message: Message) -> Self {
        QueueEntry {
            raw: raw.into(),
            message,
        }
    }
}

/// Creates a connected producer/consumer pair.
pub fn channel() -> (QueueProducer, QueueConsumer) {
    let (tx, rx) = mpsc::unbounded_channel();
    let depth = Arc::new(AtomicUsize::new(0));
    (
        QueueProducer {
            tx,
            depth: Arc::clone(&depth),
        },
        QueueConsumer { rx, depth },
    )
}

/// Cloneable sending half, one clone per connection handler.
#[derive(Debug, Clone)]
pub struct QueueProducer {
    tx: mpsc::UnboundedSender<QueueEntry>,
    depth: Arc<AtomicUsize>,
}

impl QueueProducer {
    /// Appends `entry`.  Fails only once the consumer has closed the queue.
    pub fn enqueue(&self, entry: QueueEntry) -> Result<(), QueueClosed> {
        self.depth.fetch_add(1, Ordering::Relaxed);
        self.tx.send(entry).map_err(|_| {
            self.depth.fetch_sub(1, Ordering::Relaxed);
            QueueClosed
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Entries waiting for the consumer.
    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// The single receiving half.
#[derive(Debug)]
pub struct QueueConsumer {
    rx: mpsc::UnboundedReceiver<QueueEntry>,
    depth: Arc<AtomicUsize>,
}

impl QueueConsumer {
    /// Waits for the next entry.  Returns `None` once the queue is closed (explicitly or by every
    /// producer going away) and everything already queued has been handed out.
    pub async fn dequeue(&mut self) -> Option<QueueEntry> {
        let entry = self.rx.recv().await;
        self.taken(entry)
    }

    /// Blocking flavour of [`dequeue`](Self::dequeue) for a dedicated consumer thread.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context.
    pub fn dequeue_blocking(&mut self) -> Option<QueueEntry> {
        let entry = self.rx.blocking_recv();
        self.taken(entry)
    }

    /// Takes an entry if one is ready, without waiting.
    pub fn try_dequeue(&mut self) -> Option<QueueEntry> {
        let entry = self.rx.try_recv().ok();
        self.taken(entry)
    }

    /// Stops accepting new entries.  Entries already queued are still delivered.
    pub fn close(&mut self) {
        self.rx.close();
    }

    pub fn len(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn taken(&self, entry: Option<QueueEntry>) -> Option<QueueEntry> {
        if entry.is_some() {
            self.depth.fetch_sub(1, Ordering::Relaxed);
        }
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn entry(id: usize) -> QueueEntry {
        let raw = format!("MSH|^~\\&|A|B|C|D|1||ADT^A04|{}|P|2.5", id);
        let message = parse(&raw).unwrap();
        QueueEntry::new(raw, message)
    }

    #[test]
    fn entries_come_out_in_order() {
        let (producer, mut consumer) = channel();
        for i in 0..5 {
            producer.enqueue(entry(i)).unwrap();
        }
        assert_eq!(consumer.len(), 5);

        let ids: Vec<String> = std::iter::from_fn(|| consumer.try_dequeue())
            .map(|e| e.message.control_id())
            .collect();
        assert_eq!(ids, vec!["0", "1", "2", "3", "4"]);
        assert!(consumer.is_empty());
    }

    #[test]
    fn close_drains_then_ends() {
        let (producer, mut consumer) = channel();
        producer.enqueue(entry(1)).unwrap();
        consumer.close();

        assert_eq!(producer.enqueue(entry(2)), Err(QueueClosed));
        assert!(producer.is_closed());
        assert_eq!(
            consumer.dequeue_blocking().map(|e| e.message.control_id()),
            Some("1".to_string())
        );
        assert!(consumer.dequeue_blocking().is_none());
        assert_eq!(producer.len(), 0);
    }

    #[test]
    fn dropping_every_producer_ends_the_stream() {
        let (producer, mut consumer) = channel();
        let second = producer.clone();
        producer.enqueue(entry(1)).unwrap();
        drop(producer);
        second.enqueue(entry(2)).unwrap();
        drop(second);

        assert!(consumer.dequeue_blocking().is_some());
        assert!(consumer.dequeue_blocking().is_some());
        assert!(consumer.dequeue_blocking().is_none());
    }

    #[tokio::test]
    async fn many_producers_lose_nothing() {
        let (producer, mut consumer) = channel();
        let mut handles = Vec::new();
        for p in 0..10 {
            let producer = producer.clone();
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    producer.enqueue(entry(p * 1000 + i)).unwrap();
                }
            }));
        }
        drop(producer);
        for h in handles {
            h.await.unwrap();
        }

        let mut seen = std::collections::HashSet::new();
        while let Some(e) = consumer.dequeue().await {
            assert!(seen.insert(e.message.control_id()), "duplicate entry");
        }
        assert_eq!(seen.len(), 500);
    }
}
