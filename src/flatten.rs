//! Flattening of a message tree into indented `name=value` lines.

use crate::message::Message;

/// Indent unit per level of depth.
pub const INDENT: &str = "    ";

/// Name used for nodes built without one.
pub const UNNAMED: &str = "unnamed";

/// Escapes a value for key=value output.
///
/// Double and single quotes are backslash escaped first.  The result is wrapped in double quotes
/// if it contains a space, is empty, or `force_quotes` is set.
///
/// ```
/// use hl7_mllp_ingest::escape_value;
/// assert_eq!(escape_value("He said \"hi\"", false), "\"He said \\\"hi\\\"\"");
/// assert_eq!(escape_value("AA", false), "AA");
/// assert_eq!(escape_value("", false), "\"\"");
/// ```
pub fn escape_value(value: &str, force_quotes: bool) -> String {
    let escaped = value.replace('"', "\\\"").replace('\'', "\\'");
    if force_quotes || escaped.is_empty() || escaped.contains(' ') {
        format!("\"{}\"", escaped)
    } else {
        escaped
    }
}

/// Flattens `message` with every value quoted.
pub fn flatten(message: &Message) -> Vec<String> {
    flatten_with(message, true)
}

/// One line per node in preorder: `<indent><name>=<escaped er7 value>`.
pub fn flatten_with(message: &Message, force_quotes: bool) -> Vec<String> {
    let delimiters = message.delimiters();
    message
        .preorder()
        .map(|(node, depth)| {
            format!(
                "{}{}={}",
                INDENT.repeat(depth),
                node.name().unwrap_or(UNNAMED),
                escape_value(&node.to_er7(delimiters), force_quotes)
            )
        })
        .collect()
}
