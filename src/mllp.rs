//! MLLP framing: the per-connection state machine and the tokio codec wrapping it.
//!
//! MLLP Spec: https://www.hl7.org/implement/standards/product_brief.cfm?product_id=55
//!
//! A frame is `<VT> payload <FS><CR>`.  Bytes outside a frame are ignored, as MLLP requires.  Anything
//! else that goes wrong (a missing end block, a stray byte after the end block, an oversized body,
//! the peer hanging up mid-frame) is reported as a [`Frame::Malformed`] item rather than a stream
//! error, so the connection can answer it with a negative acknowledgment and carry on.

use bytes::buf::{Buf, BufMut};
use bytes::BytesMut;
use log::{debug, trace};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::FramingError;

/// Vertical-Tab char, the marker for the start of a message
pub const BLOCK_HEADER: u8 = 0x0B;
/// File-Separator char + CR, the marker for the end of a message
pub const BLOCK_FOOTER: [u8; 2] = [0x1C, 0x0D];

/// Default cap on a single frame's payload.
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// One unit read off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// A complete payload with the MLLP envelope removed.
    Message(BytesMut),
    /// Something framed badly; the sender still deserves an answer.
    Malformed(FramingError),
}

/// The state of our state machine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameState {
    /// We are waiting for a StartBlock byte to indicate a new message
    AwaitStart,
    /// All data is considered message data, we're waiting to see an End Block byte
    ReadingBody,
    /// We've received an End-Block char, and are expecting a CR next
    AwaitEnd,
    /// A frame was just handed out
    Complete,
    /// A malformed frame was just reported
    Error,
}

/// Framing state owned by exactly one connection.
#[derive(Debug)]
pub struct Framer {
    state: FrameState,
    current_message: BytesMut,
    max_frame_bytes: usize,
}

impl Default for Framer {
    fn default() -> Self {
        Framer::new(DEFAULT_MAX_FRAME_BYTES)
    }
}

impl Framer {
    pub fn new(max_frame_bytes: usize) -> Framer {
        Framer {
            state: FrameState::AwaitStart,
            current_message: BytesMut::new(),
            max_frame_bytes,
        }
    }

    pub fn state(&self) -> FrameState {
        self.state
    }

    /// Number of payload bytes buffered for the frame in progress.
    pub fn buffered(&self) -> usize {
        self.current_message.len()
    }

    /// The payload buffered so far for the frame in progress.
    pub fn partial(&self) -> &[u8] {
        &self.current_message
    }

    /// Whether a start block has been seen and the frame it opened is not finished yet.
    pub fn in_frame(&self) -> bool {
        matches!(self.state, FrameState::ReadingBody | FrameState::AwaitEnd)
    }

    /// Consumes bytes from `src` until a frame completes or fails.
    ///
    /// Consumed bytes are removed from `src`; anything after the returned frame stays put for the
    /// next call.  Returns `None` once `src` is exhausted without finishing a frame.
    pub fn advance(&mut self, src: &mut BytesMut) -> Option<Frame> {
        if matches!(self.state, FrameState::Complete | FrameState::Error) {
            self.state = FrameState::AwaitStart;
        }

        while !src.is_empty() {
            match self.state {
                FrameState::AwaitStart | FrameState::Complete | FrameState::Error => {
                    match src.iter().position(|b| *b == BLOCK_HEADER) {
                        Some(start) => {
                            if start > 0 {
                                trace!("MLLP: Ignoring {} bytes before start block", start);
                            }
                            src.advance(start + 1);
                            self.current_message.clear();
                            self.state = FrameState::ReadingBody;
                        }
                        None => {
                            //we are meant to ignore any other bytes
                            trace!("MLLP: Ignoring {} non-StartBlock bytes", src.len());
                            src.advance(src.len());
                        }
                    }
                }
                FrameState::ReadingBody => {
                    let marker = src
                        .iter()
                        .position(|b| *b == BLOCK_FOOTER[0] || *b == BLOCK_HEADER);
                    let chunk = marker.unwrap_or(src.len());

                    if self.current_message.len() + chunk > self.max_frame_bytes {
                        debug!(
                            "MLLP: Frame exceeds {} bytes, discarding",
                            self.max_frame_bytes
                        );
                        src.advance(chunk);
                        return Some(self.fail(FramingError::Oversized {
                            limit: self.max_frame_bytes,
                        }));
                    }

                    self.current_message.reserve(chunk);
                    self.current_message.put_slice(&src[..chunk]);
                    src.advance(chunk);

                    match marker {
                        Some(_) if src[0] == BLOCK_HEADER => {
                            // the previous frame never got its footer; this start block opens a new one
                            let discarded = self.current_message.len();
                            src.advance(1);
                            self.current_message.clear();
                            self.state = FrameState::ReadingBody;
                            return Some(Frame::Malformed(FramingError::UnexpectedStartBlock {
                                discarded,
                            }));
                        }
                        Some(_) => {
                            src.advance(1);
                            self.state = FrameState::AwaitEnd;
                        }
                        None => {}
                    }
                }
                FrameState::AwaitEnd => {
                    let b = src[0];
                    if b == BLOCK_FOOTER[1] {
                        src.advance(1);
                        self.state = FrameState::Complete;
                        let msg = self.current_message.split();
                        trace!("MLLP: Completed frame of {} bytes", msg.len());
                        return Some(Frame::Message(msg));
                    }
                    // leave the byte in place, it may be the start of the next frame
                    return Some(self.fail(FramingError::MissingCarriageReturn { found: b }));
                }
            }
        }

        None
    }

    /// Called when the stream ends.  Reports a frame cut short, if there was one.
    pub fn finish(&mut self) -> Option<Frame> {
        if !self.in_frame() {
            return None;
        }
        let buffered = self.current_message.len();
        Some(self.fail(FramingError::Truncated { buffered }))
    }

    fn fail(&mut self, error: FramingError) -> Frame {
        self.current_message.clear();
        self.state = FrameState::Error;
        Frame::Malformed(error)
    }
}

/// A tokio codec for MLLP frames, generally used within a
/// [Tokio Framed](https://docs.rs/tokio-util/0.7/tokio_util/codec/struct.Framed.html).
///
/// ```
/// use hl7_mllp_ingest::MllpCodec;
/// let mllp = MllpCodec::new();
/// ```
#[derive(Debug, Default)]
pub struct MllpCodec {
    // a frame may straddle several reads; the framer keeps the partial payload between calls
    framer: Framer,
}

impl MllpCodec {
    pub fn new() -> Self {
        MllpCodec {
            framer: Framer::default(),
        }
    }

    /// A codec that reports frames longer than `max_frame_bytes` as malformed.
    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        MllpCodec {
            framer: Framer::new(max_frame_bytes),
        }
    }

    pub fn framer(&self) -> &Framer {
        &self.framer
    }
}

// Support encoding data as an MLLP Frame.
// This is used for both the primary HL7 message sent from a publisher, and also any ACK/NACK messages sent from a Listener.
impl Encoder<BytesMut> for MllpCodec {
    type Error = std::io::Error;

    fn encode(&mut self, event: BytesMut, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.reserve(event.len() + 3); //we need an extra 3 bytes of space on top of the message proper
        dst.put_u8(BLOCK_HEADER); //header

        dst.put_slice(&event); //data

        dst.put_slice(&BLOCK_FOOTER); //footer

        trace!("MLLP: Encoded value for send: '{:?}'", dst);
        Ok(())
    }
}

// Support decoding data from an MLLP Frame.
// This is used for receiving the primary HL7 message in a listener, and also decoding any ACK/NACK responses in a publisher.
impl Decoder for MllpCodec {
    type Item = Frame;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(self.framer.advance(src))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(frame) = self.framer.advance(src) {
            return Ok(Some(frame));
        }
        Ok(self.framer.finish())
    }
}
