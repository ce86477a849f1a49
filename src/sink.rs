//! The downstream event stream.
//!
//! Events are written in the XML streaming format consumed by Splunk modular inputs:
//!
//! ```text
//! <stream>
//! <event stanza="hl7://ward-7"><time>1700000000</time><data>...</data><index>default</index>...</event>
//! ...
//! </stream>
//! ```
//!
//! The stream is a single shared resource, so every event is rendered up front and written and
//! flushed under one lock.

use std::fmt::Write as _;
use std::io::Write;
use std::sync::Mutex;

use log::trace;

use crate::error::SinkWriteError;

/// Where an event is routed once it reaches the sink.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoutingAttributes {
    pub stanza: String,
    pub index: Option<String>,
    pub source: Option<String>,
    pub sourcetype: Option<String>,
    pub host: Option<String>,
}

/// One event: routing attributes, a timestamp (seconds since the epoch) and a body.
#[derive(Debug, Clone, Copy)]
pub struct SinkEvent<'a> {
    pub routing: &'a RoutingAttributes,
    pub time: i64,
    pub data: &'a str,
}

impl SinkEvent<'_> {
    pub fn render(&self) -> String {
        let mut out = String::with_capacity(self.data.len() + 128);
        let _ = write!(
            out,
            "<event stanza=\"{}\"><time>{}</time><data>{}</data>",
            xml_escape(&self.routing.stanza),
            self.time,
            xml_escape(self.data)
        );
        let optional = [
            ("index", &self.routing.index),
            ("source", &self.routing.source),
            ("sourcetype", &self.routing.sourcetype),
            ("host", &self.routing.host),
        ];
        for (tag, value) in optional {
            if let Some(value) = value {
                let _ = write!(out, "<{0}>{1}</{0}>", tag, xml_escape(value));
            }
        }
        out.push_str("</event>\n");
        out
    }
}

struct SinkState {
    out: Box<dyn Write + Send>,
    opened: bool,
    closed: bool,
}

/// A serialized writer of events.
pub struct Sink {
    state: Mutex<SinkState>,
}

impl Sink {
    pub fn new<W>(out: W) -> Self
    where
        W: Write + Send + 'static,
    {
        Sink {
            state: Mutex::new(SinkState {
                out: Box::new(out),
                opened: false,
                closed: false,
            }),
        }
    }

    pub fn stdout() -> Self {
        Sink::new(std::io::stdout())
    }

    /// Writes one event.  The `<stream>` prologue goes out ahead of the first event.
    pub fn write(&self, event: &SinkEvent<'_>) -> Result<(), SinkWriteError> {
        let rendered = event.render();
        let mut state = self.state.lock().map_err(|_| SinkWriteError::Poisoned)?;
        if !state.opened {
            state.out.write_all(b"<stream>\n")?;
            state.opened = true;
        }
        state.out.write_all(rendered.as_bytes())?;
        state.out.flush()?;
        trace!("SINK: Wrote event of {} bytes", rendered.len());
        Ok(())
    }

    /// Terminates the stream, if one was started.  Safe to call more than once.
    pub fn close(&self) -> Result<(), SinkWriteError> {
        let mut state = self.state.lock().map_err(|_| SinkWriteError::Poisoned)?;
        if state.opened && !state.closed {
            state.out.write_all(b"</stream>\n")?;
            state.out.flush()?;
        }
        state.closed = true;
        Ok(())
    }
}

pub(crate) fn xml_escape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            c => out.push(c),
        }
    }
    out
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::io;
    use std::sync::Arc;

    /// An in-memory writer whose contents stay readable after the sink takes ownership.
    #[derive(Clone, Default)]
    pub(crate) struct SharedBuffer(pub Arc<Mutex<Vec<u8>>>);

    impl SharedBuffer {
        pub(crate) fn contents(&self) -> String {
            String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
        }
    }

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    pub(crate) struct BrokenPipe;

    impl Write for BrokenPipe {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "sink went away"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn routing() -> RoutingAttributes {
        RoutingAttributes {
            stanza: "hl7://ward-7".to_string(),
            index: Some("default".to_string()),
            source: None,
            sourcetype: Some("hl7".to_string()),
            host: Some("mllp-01".to_string()),
        }
    }

    #[test]
    fn renders_routing_attributes_and_escapes_data() {
        let routing = routing();
        let event = SinkEvent {
            routing: &routing,
            time: 1_700_000_000,
            data: "MSH|^~\\&|A<B>",
        };
        assert_eq!(
            event.render(),
            "<event stanza=\"hl7://ward-7\"><time>1700000000</time><data>MSH|^~\\&amp;|A&lt;B&gt;</data><index>default</index><sourcetype>hl7</sourcetype><host>mllp-01</host></event>\n"
        );
    }

    #[test]
    fn wraps_events_in_a_single_stream() {
        let buffer = SharedBuffer::default();
        let sink = Sink::new(buffer.clone());
        let routing = routing();

        for data in ["one", "two"] {
            sink.write(&SinkEvent {
                routing: &routing,
                time: 1,
                data,
            })
            .unwrap();
        }
        sink.close().unwrap();
        sink.close().unwrap();

        let out = buffer.contents();
        assert!(out.starts_with("<stream>\n<event"));
        assert!(out.ends_with("</event>\n</stream>\n"));
        assert_eq!(out.matches("<event ").count(), 2);
        assert_eq!(out.matches("</stream>").count(), 1);
    }

    #[test]
    fn closing_an_unused_sink_writes_nothing() {
        let buffer = SharedBuffer::default();
        let sink = Sink::new(buffer.clone());
        sink.close().unwrap();
        assert_eq!(buffer.contents(), "");
    }

    #[test]
    fn write_failures_surface_as_errors() {
        let sink = Sink::new(BrokenPipe);
        let routing = routing();
        let result = sink.write(&SinkEvent {
            routing: &routing,
            time: 1,
            data: "x",
        });
        assert!(matches!(result, Err(SinkWriteError::Io(_))));
    }
}
