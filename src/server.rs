//! The MLLP listener.
//!
//! One tokio task per connection.  Each connection loops: read a frame, parse it, enqueue it, send
//! the acknowledgment, read the next frame.  Nothing that happens to a single message or a single
//! connection stops the accept loop; only cancellation does.
//!
//! A connection that stays silent, or stops reading its acknowledgments, for longer than the
//! socket timeout is closed.  A frame left half sent when that happens is answered with an `AR`
//! first.

use std::future::Future;
use std::net::SocketAddr;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use futures::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use crate::ack;
use crate::config::Config;
use crate::error::{ConfigurationError, FramingError, QueueClosed};
use crate::message::Message;
use crate::mllp::{Frame, MllpCodec};
use crate::parser;
use crate::queue::{QueueEntry, QueueProducer};

/// Counters kept by a running listener.
#[derive(Debug, Default)]
pub struct ServerMetrics {
    connections_total: AtomicU64,
    messages_accepted: AtomicU64,
    messages_rejected: AtomicU64,
    framing_errors: AtomicU64,
}

impl ServerMetrics {
    fn count(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ServerMetricsSnapshot {
        ServerMetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            messages_accepted: self.messages_accepted.load(Ordering::Relaxed),
            messages_rejected: self.messages_rejected.load(Ordering::Relaxed),
            framing_errors: self.framing_errors.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ServerMetricsSnapshot {
    pub connections_total: u64,
    pub messages_accepted: u64,
    pub messages_rejected: u64,
    pub framing_errors: u64,
}

/// Everything a connection handler needs, shared between all of them.
struct Ingest {
    producer: QueueProducer,
    ack_text: String,
    max_frame_bytes: usize,
    socket_timeout: Option<Duration>,
    metrics: Arc<ServerMetrics>,
}

/// Runs `io` to completion, or gives up after `limit`.  `None` means it timed out.
async fn within<F: Future>(limit: Option<Duration>, io: F) -> Option<F::Output> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, io).await.ok(),
        None => Some(io.await),
    }
}

impl Ingest {
    /// Turns one frame into the acknowledgment to send back, enqueueing the message on the way.
    fn process(&self, frame: Frame, peer: SocketAddr) -> Message {
        let bytes = match frame {
            Frame::Message(bytes) => bytes,
            Frame::Malformed(e) => {
                ServerMetrics::count(&self.metrics.framing_errors);
                warn!("MLLP: Framing error from {}: {}", peer, e);
                return ack::reject(b"", &e.to_string());
            }
        };

        let message = match parser::parse_bytes(&bytes) {
            Ok(message) => message,
            Err(e) => {
                ServerMetrics::count(&self.metrics.messages_rejected);
                warn!("HL7: Rejecting message from {}: {}", peer, e);
                return ack::reject(&bytes, &e.to_string());
            }
        };

        let raw = String::from_utf8_lossy(&bytes).into_owned();
        let control_id = message.control_id();
        let ack = match self.producer.enqueue(QueueEntry::new(raw, message.clone())) {
            Ok(()) => {
                ServerMetrics::count(&self.metrics.messages_accepted);
                ack::accept(&message, &self.ack_text)
            }
            Err(QueueClosed) => {
                error!("HL7: Queue closed, cannot accept message {}", control_id);
                ack::error(&message, &QueueClosed.to_string())
            }
        };
        debug!(
            "HL7: {} message {} from {}, queue depth {}",
            message.message_type(),
            control_id,
            peer,
            self.producer.len()
        );
        ack
    }

    /// [`process`](Self::process), with a panic turned into a reject so the connection carries on.
    fn process_isolated(&self, frame: Frame, peer: SocketAddr) -> Message {
        panic::catch_unwind(AssertUnwindSafe(|| self.process(frame, peer))).unwrap_or_else(|_| {
            error!("HL7: Handler panicked on a message from {}", peer);
            ack::reject(b"", "internal error")
        })
    }

    async fn handle(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
        cancel: CancellationToken,
    ) -> std::io::Result<()> {
        let mut transport = Framed::new(stream, MllpCodec::with_max_frame_bytes(self.max_frame_bytes));

        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = within(self.socket_timeout, transport.next()) => frame,
            };
            let ack = match frame {
                Some(Some(frame)) => self.process_isolated(frame?, peer),
                Some(None) => break,
                None if transport.codec().framer().in_frame() => {
                    let partial = transport.codec().framer().partial();
                    let e = FramingError::Truncated {
                        buffered: partial.len(),
                    };
                    ServerMetrics::count(&self.metrics.framing_errors);
                    warn!("MLLP: Timed out mid-frame from {}: {}", peer, e);
                    let ack = ack::reject(partial, &e.to_string());
                    self.send_ack(&mut transport, ack, peer, &cancel).await?;
                    break;
                }
                None => {
                    debug!("MLLP: Closing idle connection from {}", peer);
                    break;
                }
            };
            if !self.send_ack(&mut transport, ack, peer, &cancel).await? {
                break;
            }
        }

        debug!("MLLP: Connection from {} closed", peer);
        Ok(())
    }

    /// Writes `ack`, unless the peer stops reading for longer than the socket timeout or the
    /// server shuts down first.  Returns whether the connection should carry on.
    async fn send_ack(
        &self,
        transport: &mut Framed<TcpStream, MllpCodec>,
        ack: Message,
        peer: SocketAddr,
        cancel: &CancellationToken,
    ) -> std::io::Result<bool> {
        let wire = BytesMut::from(ack.to_er7().as_bytes());
        tokio::select! {
            _ = cancel.cancelled() => Ok(false),
            sent = within(self.socket_timeout, transport.send(wire)) => match sent {
                Some(sent) => sent.map(|()| true),
                None => {
                    warn!("MLLP: Timed out writing an acknowledgment to {}", peer);
                    Ok(false)
                }
            },
        }
    }
}

pub struct MllpServer {
    listener: TcpListener,
    ingest: Arc<Ingest>,
}

impl MllpServer {
    /// Validates `config` and binds the listener.
    pub async fn bind(config: &Config, producer: QueueProducer) -> Result<Self, ConfigurationError> {
        config.validate().await?;
        let address = config.socket_addr()?;
        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| ConfigurationError::Bind {
                address: address.to_string(),
                source,
            })?;
        Ok(Self::from_listener(listener, config, producer))
    }

    /// Serves on a listener that is already bound.  Only settings unrelated to the address are
    /// taken from `config`.
    pub fn from_listener(listener: TcpListener, config: &Config, producer: QueueProducer) -> Self {
        MllpServer {
            listener,
            ingest: Arc::new(Ingest {
                producer,
                ack_text: config.ack_text.clone(),
                max_frame_bytes: config.max_frame_bytes,
                socket_timeout: config.socket_timeout(),
                metrics: Arc::new(ServerMetrics::default()),
            }),
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        Arc::clone(&self.ingest.metrics)
    }

    /// Accepts connections until `cancel` fires, then waits for open connections to wind down.
    ///
    /// The queue producer is dropped on return, so a consumer sees the end of the queue once the
    /// last entry has been handed out.
    pub async fn run(self, cancel: CancellationToken) -> ServerMetricsSnapshot {
        if let Ok(address) = self.local_addr() {
            info!("MLLP: Listening on {}", address);
        }

        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        ServerMetrics::count(&self.ingest.metrics.connections_total);
                        debug!("MLLP: Connection opened from {}", peer);
                        let ingest = Arc::clone(&self.ingest);
                        let cancel = cancel.child_token();
                        connections.spawn(async move {
                            if let Err(e) = ingest.handle(stream, peer, cancel).await {
                                warn!("MLLP: Connection from {} failed: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => warn!("MLLP: Accept failed: {}", e),
                },
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    log_join(joined);
                }
            }
        }

        info!("MLLP: Shutting down, waiting on {} connections", connections.len());
        drop(self.listener);
        while let Some(joined) = connections.join_next().await {
            log_join(joined);
        }

        let snapshot = self.ingest.metrics.snapshot();
        info!(
            "MLLP: Stopped after {} connections, {} accepted, {} rejected, {} framing errors",
            snapshot.connections_total,
            snapshot.messages_accepted,
            snapshot.messages_rejected,
            snapshot.framing_errors
        );
        snapshot
    }
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        if e.is_panic() {
            error!("MLLP: Connection task panicked: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FramingError;
    use crate::queue::channel;

    fn ingest(producer: QueueProducer) -> Ingest {
        Ingest {
            producer,
            ack_text: ack::DEFAULT_ACK_TEXT.to_string(),
            max_frame_bytes: 1024,
            socket_timeout: None,
            metrics: Arc::new(ServerMetrics::default()),
        }
    }

    fn peer() -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], 40000))
    }

    fn msa(ack: &Message, position: usize) -> String {
        ack.segment("MSA")
            .unwrap()
            .field_text(position, ack.delimiters())
    }

    #[test]
    fn good_messages_are_enqueued_and_accepted() {
        let (producer, mut consumer) = channel();
        let ingest = ingest(producer);
        let frame = Frame::Message(BytesMut::from(
            &b"MSH|^~\\&|A|B|C|D|1||ADT^A04|123|P|2.5\rPID||1"[..],
        ));

        let ack = ingest.process(frame, peer());
        assert_eq!(msa(&ack, 1), "AA");
        assert_eq!(msa(&ack, 2), "123");

        let entry = consumer.try_dequeue().unwrap();
        assert_eq!(entry.raw, "MSH|^~\\&|A|B|C|D|1||ADT^A04|123|P|2.5\rPID||1");
        assert_eq!(ingest.metrics.snapshot().messages_accepted, 1);
    }

    #[test]
    fn unparseable_messages_are_rejected_and_not_enqueued() {
        let (producer, mut consumer) = channel();
        let ingest = ingest(producer);

        let ack = ingest.process(Frame::Message(BytesMut::from(&b"hello"[..])), peer());
        assert_eq!(msa(&ack, 1), "AR");
        assert!(consumer.try_dequeue().is_none());
        assert_eq!(ingest.metrics.snapshot().messages_rejected, 1);
    }

    #[test]
    fn framing_errors_are_rejected() {
        let (producer, _consumer) = channel();
        let ingest = ingest(producer);

        let ack = ingest.process(
            Frame::Malformed(FramingError::Truncated { buffered: 12 }),
            peer(),
        );
        assert_eq!(msa(&ack, 1), "AR");
        assert_eq!(ingest.metrics.snapshot().framing_errors, 1);
    }

    #[tokio::test]
    async fn within_gives_up_after_the_limit() {
        let limit = Some(Duration::from_millis(20));
        assert_eq!(within(limit, std::future::pending::<()>()).await, None);
        assert_eq!(within(limit, async { 7 }).await, Some(7));
        assert_eq!(within(None, async { 7 }).await, Some(7));
    }

    #[test]
    fn a_closed_queue_is_an_application_error() {
        let (producer, mut consumer) = channel();
        consumer.close();
        let ingest = ingest(producer);
        let frame = Frame::Message(BytesMut::from(&b"MSH|^~\\&|A|B|C|D|1||ADT^A04|9|P|2.5"[..]));

        let ack = ingest.process(frame, peer());
        assert_eq!(msa(&ack, 1), "AE");
        assert_eq!(msa(&ack, 2), "9");
    }
}
