//! ER7 (pipe and hat) grammar: text to [`Message`] and back.
//!
//! Parsing never unescapes HL7 escape sequences and never trims anything, so a parsed message
//! serializes back to exactly the bytes it came from.

use log::trace;

use crate::error::ParseError;
use crate::message::{
    field_name, is_segment_name, Content, Delimiters, Field, Message, Node, Segment,
    SegmentTerminator,
};

/// Parses a raw frame payload.  The payload must be UTF-8.
pub fn parse_bytes(bytes: &[u8]) -> Result<Message, ParseError> {
    let text = std::str::from_utf8(bytes).map_err(|_| ParseError::InvalidEncoding)?;
    parse(text)
}

/// Parses an ER7 encoded message.
///
/// ```
/// let msg = hl7_mllp_ingest::parse("MSH|^~\\&|A|B|C|D|199912271408|X|ADT^A04|123|D|2.5\rPID||1||DOE^JOHN").unwrap();
/// assert_eq!(msg.control_id(), "123");
/// assert_eq!(msg.message_type(), "ADT^A04");
/// ```
pub fn parse(text: &str) -> Result<Message, ParseError> {
    if text.trim().is_empty() {
        return Err(ParseError::Empty);
    }
    if !text.starts_with("MSH") {
        return Err(ParseError::MissingHeader);
    }

    let delimiters = read_delimiters(text)?;
    let terminator = detect_terminator(text);

    let (body, trailing_terminator) = match text.strip_suffix(terminator.as_str()) {
        Some(body) => (body, true),
        None => (text, false),
    };

    let mut segments = Vec::new();
    for (index, segment_text) in body.split(terminator.as_str()).enumerate() {
        if segment_text.is_empty() {
            return Err(ParseError::EmptySegment(index + 1));
        }
        segments.push(parse_segment(segment_text, &delimiters, index)?);
    }

    // MSH-9 and MSH-10 (type and control id) must at least be present
    match segments.first().map(|msh| msh.fields().len()) {
        Some(n) if n >= 10 => {}
        Some(9) => return Err(ParseError::MissingField("MSH-10")),
        _ => return Err(ParseError::MissingField("MSH-9")),
    }

    trace!(
        "HL7: Parsed {} segments with delimiters {:?}",
        segments.len(),
        delimiters
    );

    Ok(Message::from_parts(
        delimiters,
        terminator,
        trailing_terminator,
        segments,
    ))
}

/// Serializes a message using its own delimiters and segment terminator.
pub fn serialize(message: &Message) -> String {
    let delimiters = message.delimiters();
    let terminator = message.terminator().as_str();

    let mut out = String::new();
    for (i, segment) in message.segments().iter().enumerate() {
        if i > 0 {
            out.push_str(terminator);
        }
        out.push_str(&segment.to_er7(delimiters));
    }
    if message.has_trailing_terminator() {
        out.push_str(terminator);
    }
    out
}

pub(crate) fn read_delimiters(text: &str) -> Result<Delimiters, ParseError> {
    let mut chars = text.chars().skip(3);
    let field = chars.next().ok_or(ParseError::MissingFieldSeparator)?;
    if field.is_ascii_alphanumeric() || field == '\r' || field == '\n' {
        return Err(ParseError::MissingFieldSeparator);
    }

    let encoding: String = chars
        .take_while(|c| *c != field && *c != '\r' && *c != '\n')
        .collect();
    let enc: Vec<char> = encoding.chars().collect();
    let valid = (enc.len() == 4 || enc.len() == 5)
        && enc.iter().all(|c| !c.is_ascii_alphanumeric() && *c != ' ')
        && enc
            .iter()
            .enumerate()
            .all(|(i, c)| !enc[i + 1..].contains(c));
    if !valid {
        return Err(ParseError::InvalidEncodingCharacters(encoding));
    }

    Ok(Delimiters {
        field,
        component: enc[0],
        repetition: enc[1],
        escape: enc[2],
        subcomponent: enc[3],
        truncation: enc.get(4).copied(),
    })
}

fn detect_terminator(text: &str) -> SegmentTerminator {
    if text.contains("\r\n") {
        SegmentTerminator::CrLf
    } else if text.contains('\r') {
        SegmentTerminator::Cr
    } else if text.contains('\n') {
        SegmentTerminator::Lf
    } else {
        SegmentTerminator::Cr
    }
}

/// Parses one segment.  `index` is the segment's position in the message; index 0 is the header.
pub(crate) fn parse_segment(
    text: &str,
    delimiters: &Delimiters,
    index: usize,
) -> Result<Segment, ParseError> {
    let invalid_name = || ParseError::InvalidSegmentName {
        index: index + 1,
        name: text.chars().take(3).collect(),
    };

    let name = text.get(..3).filter(|n| is_segment_name(n)).ok_or_else(invalid_name)?;
    let rest = &text[3..];
    if index == 0 && name != "MSH" {
        return Err(ParseError::MissingHeader);
    }

    let mut fields = Vec::new();
    if rest.is_empty() {
        return Ok(Segment::with_fields(name.to_string(), fields));
    }
    let rest = rest.strip_prefix(delimiters.field).ok_or_else(invalid_name)?;

    let mut pieces = rest.split(delimiters.field);
    let mut position = 1;
    if name == "MSH" {
        // MSH-1 is the separator itself and MSH-2 is taken verbatim
        fields.push(Field::leaf(
            Some(field_name(name, 1)),
            delimiters.field.to_string(),
        ));
        let encoding = pieces.next().unwrap_or_default();
        fields.push(Field::leaf(Some(field_name(name, 2)), encoding));
        position = 3;
    }
    for piece in pieces {
        fields.push(parse_field(piece, delimiters, field_name(name, position)));
        position += 1;
    }

    Ok(Segment::with_fields(name.to_string(), fields))
}

/// Parses the text of one field (all repetitions).
pub(crate) fn parse_field(text: &str, delimiters: &Delimiters, name: String) -> Field {
    let repetitions = text
        .split(delimiters.repetition)
        .map(|rep| parse_repetition(rep, delimiters, &name))
        .collect();
    Field::new(Some(name), repetitions)
}

fn parse_repetition(text: &str, delimiters: &Delimiters, name: &str) -> Content {
    if text.contains(delimiters.component) {
        Content::Children(
            text.split(delimiters.component)
                .enumerate()
                .map(|(i, c)| parse_component(c, delimiters, format!("{}_{}", name, i + 1)))
                .collect(),
        )
    } else if text.contains(delimiters.subcomponent) {
        Content::Children(vec![parse_component(
            text,
            delimiters,
            format!("{}_1", name),
        )])
    } else {
        Content::Value(text.to_string())
    }
}

/// Parses the text of one component, splitting sub-components.
pub(crate) fn parse_component(text: &str, delimiters: &Delimiters, name: String) -> Node {
    if text.contains(delimiters.subcomponent) {
        let subs = text
            .split(delimiters.subcomponent)
            .enumerate()
            .map(|(i, s)| Node::leaf(Some(format!("{}_{}", name, i + 1)), s))
            .collect();
        Node::new(Some(name), Content::Children(subs))
    } else {
        Node::leaf(Some(name), text)
    }
}
