//! Optional removal of PHI fields and over-long segments before a message reaches the sink.

use log::debug;

use crate::message::{FieldPath, Message};

/// Fields removed when `remove_phi` is switched on: patient and next-of-kin names, birth date,
/// addresses, phone numbers, SSN and driver's licence.
pub const DEFAULT_PHI_FIELDS: &[&str] = &[
    "PID.PID_5",
    "PID.PID_6",
    "PID.PID_7",
    "PID.PID_9",
    "PID.PID_11",
    "PID.PID_13",
    "PID.PID_14",
    "PID.PID_19",
    "PID.PID_20",
    "NK1.NK1_2",
    "NK1.NK1_4",
    "NK1.NK1_5",
    "NK1.NK1_6",
    "GT1.GT1_3",
    "GT1.GT1_5",
    "GT1.GT1_6",
    "IN1.IN1_16",
    "IN1.IN1_19",
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageFilter {
    paths: Vec<String>,
    max_segment_len: Option<usize>,
}

impl MessageFilter {
    /// `fields_to_remove` are dotted paths (see [`Message::resolve_path`]).  A `max_segment_len`
    /// of `None` or `Some(0)` keeps segments of any length.
    pub fn new(remove_phi: bool, fields_to_remove: &[String], max_segment_len: Option<usize>) -> Self {
        let mut paths: Vec<String> = Vec::new();
        if remove_phi {
            paths.extend(DEFAULT_PHI_FIELDS.iter().map(|p| p.to_string()));
        }
        for path in fields_to_remove {
            let path = path.trim();
            if !path.is_empty() && !paths.iter().any(|p| p == path) {
                paths.push(path.to_string());
            }
        }
        MessageFilter {
            paths,
            max_segment_len: max_segment_len.filter(|n| *n > 0),
        }
    }

    /// Returns the first entry of `paths` that is not a well-formed field path.
    pub fn invalid_path(paths: &[String]) -> Option<&str> {
        paths
            .iter()
            .map(|p| p.trim())
            .find(|p| !p.is_empty() && FieldPath::parse(p).is_none())
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty() && self.max_segment_len.is_none()
    }

    pub fn paths(&self) -> &[String] {
        &self.paths
    }

    /// A filtered copy of `message`; the original is left alone.
    pub fn apply(&self, message: &Message) -> Message {
        let mut filtered = message.deep_copy();
        for path in &self.paths {
            if filtered.delete_value(path) {
                debug!("HL7: Removed {} from message {}", path, message.control_id());
            }
        }

        if let Some(limit) = self.max_segment_len {
            let delimiters = *filtered.delimiters();
            filtered.retain_segments(|segment| {
                let len = segment.to_er7(&delimiters).len();
                if len > limit {
                    debug!(
                        "HL7: Dropping {} segment of {} bytes (limit {})",
                        segment.name(),
                        len,
                        limit
                    );
                }
                len <= limit
            });
        }
        filtered
    }
}
