/*!
# An HL7 v2 MLLP ingestion service.

 HL7's MLLP is a simple, single-byte-text based protocol for framing HL7 messages over a TCP (or similar) transport.
 The full specification is available at [the HL7 site](https://www.hl7.org/documentcenter/private/standards/v3/V3_TRMLLP_R2_R2019.zip) (Note that they place the standards behind a free membership/login form).

 This crate listens for MLLP framed HL7 v2 messages, answers every one of them with an HL7 `ACK`, and hands
 accepted messages to a single emitter that writes them to a downstream event stream, either verbatim or
 flattened into `key=value` pairs.

 The pieces are usable on their own:
 - [`MllpCodec`] is a [tokio codec](https://docs.rs/tokio-util/latest/tokio_util/codec/index.html) that frames
   and unframes MLLP, reporting malformed frames as items rather than tearing the stream down.
 - [`parse`] / [`serialize`] convert between ER7 text and a [`Message`] tree, byte-for-byte.
 - [`flatten`] renders a [`Message`] as indented `name=value` lines.
 - [`MllpServer`], [`queue::channel`] and [`Emitter`] wire those together into the running service.

 ## Example
 A publisher sending one message and reading the acknowledgment back.

 ### Publisher
 ```no_run
use bytes::*;
use tokio_util::codec::Framed;
use tokio::net::TcpStream;
use futures::{SinkExt, StreamExt};

use hl7_mllp_ingest::{parse_bytes, Frame, MllpCodec};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Open a TCP stream to the listener.
    let stream = TcpStream::connect("127.0.0.1:6661").await?;

    // Construct a MLLP transport using our codec
    let mut transport = Framed::new(stream, MllpCodec::new());

    // Send a message, the codec wraps it in the MLLP header/footer for us
    transport.send(BytesMut::from("MSH|^~\\&|A|B|C|D|20240101||ADT^A04|123|P|2.5\rPID||1")).await?;

    if let Some(Ok(Frame::Message(response))) = transport.next().await {
        let ack = parse_bytes(&response)?;
        println!("  Received {} for {}", ack.message_type(), ack.control_id());
    }

    Ok(())
}
```

 ### Flattening
 ```
use hl7_mllp_ingest::{flatten, parse};

let msg = parse("MSH|^~\\&|A|B|C|D|1||ADT^A04|7|P|2.5\rPID||1").unwrap();
let lines = flatten(&msg);
assert!(lines.contains(&"    PID_2=\"1\"".to_string()));
```
 */

pub mod ack;
pub mod config;
pub mod emitter;
pub mod error;
pub mod filter;
pub mod flatten;
pub mod message;
pub mod mllp;
pub mod parser;
pub mod queue;
pub mod server;
pub mod sink;

pub use crate::ack::AcceptCode;
pub use crate::config::Config;
pub use crate::emitter::{Emitter, EmitterStats, OutputMode};
pub use crate::error::{
    ConfigurationError, Error, FramingError, ParseError, QueueClosed, Result, SinkWriteError,
};
pub use crate::filter::MessageFilter;
pub use crate::flatten::{escape_value, flatten, flatten_with};
pub use crate::message::{Content, Delimiters, Field, Message, Node, PathRef, Segment};
pub use crate::mllp::{Frame, FrameState, Framer, MllpCodec};
pub use crate::parser::{parse, parse_bytes, serialize};
pub use crate::queue::{QueueConsumer, QueueEntry, QueueProducer};
pub use crate::server::MllpServer;
pub use crate::sink::{RoutingAttributes, Sink};
