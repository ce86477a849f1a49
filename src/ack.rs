//! Building the `ACK` returned for every framed message.
//!
//! Building an acknowledgment never fails: a message that parsed gets an ack built from its own
//! header, and anything that did not parse gets a reject built from whatever header can be
//! salvaged from the raw bytes (or from default delimiters if nothing can).

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Local;
use log::trace;

use crate::message::{Delimiters, Message, Segment};
use crate::parser;

/// Free text placed in `MSA-3` of a positive acknowledgment unless configured otherwise.
pub const DEFAULT_ACK_TEXT: &str = "received by sink";

const DEFAULT_PROCESSING_ID: &str = "P";
const DEFAULT_VERSION: &str = "2.5";

static ACK_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// `MSA-1` acknowledgment codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptCode {
    /// `AA`, application accept
    Accept,
    /// `AE`, application error
    Error,
    /// `AR`, application reject
    Reject,
}

impl AcceptCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AcceptCode::Accept => "AA",
            AcceptCode::Error => "AE",
            AcceptCode::Reject => "AR",
        }
    }

    pub fn is_positive(&self) -> bool {
        matches!(self, AcceptCode::Accept)
    }
}

/// `AA` for `trigger`, echoing its control ID.
pub fn accept(trigger: &Message, text: &str) -> Message {
    build(
        trigger.msh(),
        *trigger.delimiters(),
        AcceptCode::Accept,
        &trigger.control_id(),
        text,
    )
}

/// `AE` for a message that parsed but could not be processed.
pub fn error(trigger: &Message, reason: &str) -> Message {
    build(
        trigger.msh(),
        *trigger.delimiters(),
        AcceptCode::Error,
        &trigger.control_id(),
        reason,
    )
}

/// `AR` for a payload that could not be parsed (or framed) at all.
///
/// The control ID and delimiters are salvaged from the payload's first segment when it looks
/// enough like an `MSH`.
pub fn reject(raw: &[u8], reason: &str) -> Message {
    let text = String::from_utf8_lossy(raw);
    let (delimiters, header) = salvage_header(&text);
    let control_id = header
        .as_ref()
        .map(|msh| msh.field_text(10, &delimiters))
        .unwrap_or_default();
    build(
        header.as_ref(),
        delimiters,
        AcceptCode::Reject,
        &control_id,
        reason,
    )
}

fn salvage_header(text: &str) -> (Delimiters, Option<Segment>) {
    let first_line = text.split(['\r', '\n']).next().unwrap_or_default();
    match parser::read_delimiters(first_line) {
        Ok(delimiters) => {
            let header = parser::parse_segment(first_line, &delimiters, 0).ok();
            (delimiters, header)
        }
        Err(_) => (Delimiters::default(), None),
    }
}

fn build(
    trigger: Option<&Segment>,
    delimiters: Delimiters,
    code: AcceptCode,
    control_id: &str,
    text: &str,
) -> Message {
    let copy = |position: usize| {
        trigger
            .map(|msh| msh.field_text(position, &delimiters))
            .unwrap_or_default()
    };
    let or_default = |value: String, default: &str| {
        if value.is_empty() {
            default.to_string()
        } else {
            value
        }
    };

    let mut msh = Segment::header(&delimiters);
    // sender and receiver swap roles
    msh.set_field_text(3, &copy(5), &delimiters);
    msh.set_field_text(4, &copy(6), &delimiters);
    msh.set_field_text(5, &copy(3), &delimiters);
    msh.set_field_text(6, &copy(4), &delimiters);
    msh.set_field_text(7, &Local::now().format("%Y%m%d%H%M%S").to_string(), &delimiters);
    msh.set_field_text(9, "ACK", &delimiters);
    msh.set_field_text(10, &next_control_id(), &delimiters);
    msh.set_field_text(11, &or_default(copy(11), DEFAULT_PROCESSING_ID), &delimiters);
    msh.set_field_text(12, &or_default(copy(12), DEFAULT_VERSION), &delimiters);

    let mut msa = Segment::new("MSA");
    msa.set_field_text(1, code.as_str(), &delimiters);
    msa.set_field_text(2, control_id, &delimiters);
    msa.set_field_text(3, &sanitize(text, &delimiters), &delimiters);

    let mut ack = Message::new(delimiters);
    ack.push_segment(msh);
    ack.push_segment(msa);

    trace!("HL7: Built {} ack for control id '{}'", code.as_str(), control_id);
    ack
}

fn next_control_id() -> String {
    let seq = ACK_SEQUENCE.fetch_add(1, Ordering::Relaxed) % 1_000_000;
    format!("{}{:06}", Local::now().format("%Y%m%d%H%M%S"), seq)
}

// Free text must not introduce structure into MSA-3.
fn sanitize(text: &str, delimiters: &Delimiters) -> String {
    text.chars()
        .map(|c| if delimiters.is_delimiter(c) { ' ' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    const TRIGGER: &str =
        "MSH|^~\\&|A|B|C|D|199912271408|X|ADT^A04|123|D|2.5\rPID||1||DOE^JOHN";

    fn msa(ack: &Message, position: usize) -> String {
        ack.segment("MSA")
            .unwrap()
            .field_text(position, ack.delimiters())
    }

    #[test]
    fn accept_echoes_the_control_id() {
        let trigger = parse(TRIGGER).unwrap();
        let ack = accept(&trigger, DEFAULT_ACK_TEXT);

        assert_eq!(ack.message_type(), "ACK");
        assert_eq!(msa(&ack, 1), "AA");
        assert_eq!(msa(&ack, 2), "123");
        assert_eq!(msa(&ack, 3), "received by sink");
    }

    #[test]
    fn accept_mirrors_the_trigger_header() {
        let trigger = parse(TRIGGER).unwrap();
        let ack = accept(&trigger, DEFAULT_ACK_TEXT);
        let msh = ack.msh().unwrap();
        let d = ack.delimiters();

        assert_eq!(msh.field_text(3, d), "C");
        assert_eq!(msh.field_text(4, d), "D");
        assert_eq!(msh.field_text(5, d), "A");
        assert_eq!(msh.field_text(6, d), "B");
        assert_eq!(msh.field_text(11, d), "D");
        assert_eq!(msh.field_text(12, d), "2.5");
        assert_eq!(msh.field_text(10, d).len(), 20);
    }

    #[test]
    fn ack_reparses_cleanly() {
        let trigger = parse(TRIGGER).unwrap();
        let ack = accept(&trigger, DEFAULT_ACK_TEXT);
        let wire = ack.to_er7();
        assert!(wire.ends_with('\r'));
        let reparsed = parse(&wire).unwrap();
        assert_eq!(reparsed, ack);
    }

    #[test]
    fn ack_uses_the_trigger_delimiters() {
        let trigger = parse("MSH#!$@%#A#B#C#D#1##ADT!A04#55#P#2.5").unwrap();
        let ack = accept(&trigger, DEFAULT_ACK_TEXT);
        let wire = ack.to_er7();
        assert!(wire.starts_with("MSH#!$@%#C#D#A#B#"));
        assert!(wire.contains("\rMSA#AA#55#received by sink"));
    }

    #[test]
    fn reject_salvages_what_it_can() {
        // MSH parses, the second segment does not
        let ack = reject(
            b"MSH|^~\\&|A|B|C|D|1||ADT^A04|77|P|2.4\rbad|segment",
            "invalid segment name",
        );
        assert_eq!(msa(&ack, 1), "AR");
        assert_eq!(msa(&ack, 2), "77");
        assert_eq!(ack.msh().unwrap().field_text(12, ack.delimiters()), "2.4");
    }

    #[test]
    fn reject_of_garbage_is_still_well_formed() {
        for raw in [&b""[..], b"garbage", b"\xFF\xFE", b"MSH"] {
            let ack = reject(raw, "unparseable");
            let reparsed = parse(&ack.to_er7()).unwrap();
            assert_eq!(msa(&reparsed, 1), "AR");
            assert_eq!(msa(&reparsed, 2), "");
        }
    }

    #[test]
    fn reason_text_cannot_inject_structure() {
        let trigger = parse(TRIGGER).unwrap();
        let ack = error(&trigger, "bad|field^here\rMSA|AA");
        assert_eq!(ack.segments().len(), 2);
        assert_eq!(msa(&ack, 1), "AE");
        assert_eq!(msa(&ack, 3), "bad field here MSA AA");
    }
}
