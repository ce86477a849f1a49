//! The HL7 v2 message tree.
//!
//! A [`Message`] owns its [`Segment`]s, which own their [`Field`]s, which own one [`Content`] per
//! repetition.  A repetition is either a scalar value or a list of component [`Node`]s, and a
//! component is either a scalar or a list of sub-component nodes.  Nothing is shared and nothing
//! points back up the tree; traversal carries its depth explicitly (see [`Message::preorder`]).
//!
//! Delimiters are message-local: they are discovered from the `MSH` segment when parsing and every
//! mutation or serialization of the tree uses the same set.

use crate::parser;

/// The delimiter set declared by a message's `MSH` segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delimiters {
    pub field: char,
    pub component: char,
    pub repetition: char,
    pub escape: char,
    pub subcomponent: char,
    /// HL7 2.7+ truncation character, only present when the sender declared one.
    pub truncation: Option<char>,
}

impl Default for Delimiters {
    fn default() -> Self {
        Delimiters {
            field: '|',
            component: '^',
            repetition: '~',
            escape: '\\',
            subcomponent: '&',
            truncation: None,
        }
    }
}

impl Delimiters {
    /// The `MSH-2` value declaring this set.
    pub fn encoding_characters(&self) -> String {
        let mut s = String::with_capacity(5);
        s.push(self.component);
        s.push(self.repetition);
        s.push(self.escape);
        s.push(self.subcomponent);
        if let Some(t) = self.truncation {
            s.push(t);
        }
        s
    }

    /// Whether `c` has structural meaning in this message.
    pub fn is_delimiter(&self, c: char) -> bool {
        c == self.field
            || c == self.component
            || c == self.repetition
            || c == self.escape
            || c == self.subcomponent
            || c == '\r'
            || c == '\n'
    }

    /// Whether `value` can be stored at `depth` (1 field, 2 component, 3 sub-component; 0 a whole
    /// segment) without introducing structure at or above that level.  Segment terminators are
    /// never allowed.
    pub(crate) fn fits(&self, value: &str, depth: usize) -> bool {
        value.chars().all(|c| {
            let breaks_out = match c {
                '\r' | '\n' => true,
                c if c == self.field => depth >= 1,
                c if c == self.repetition || c == self.component => depth >= 2,
                c if c == self.subcomponent => depth >= 3,
                _ => false,
            };
            !breaks_out
        })
    }
}

/// The segment terminator found on the wire, remembered so serialization reproduces it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SegmentTerminator {
    #[default]
    Cr,
    Lf,
    CrLf,
}

impl SegmentTerminator {
    pub fn as_str(&self) -> &'static str {
        match self {
            SegmentTerminator::Cr => "\r",
            SegmentTerminator::Lf => "\n",
            SegmentTerminator::CrLf => "\r\n",
        }
    }
}

/// A leaf value or a list of children.  Never both.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Content {
    Value(String),
    Children(Vec<Node>),
}

impl Content {
    pub fn empty() -> Self {
        Content::Value(String::new())
    }

    /// The scalar value, if this is a leaf.
    pub fn value(&self) -> Option<&str> {
        match self {
            Content::Value(v) => Some(v),
            Content::Children(_) => None,
        }
    }

    pub fn children(&self) -> &[Node] {
        match self {
            Content::Value(_) => &[],
            Content::Children(c) => c,
        }
    }

    // `separators` lists the delimiter between children at this level, then the next level down.
    pub(crate) fn write(&self, out: &mut String, separators: &[char]) {
        match self {
            Content::Value(v) => out.push_str(v),
            Content::Children(children) => {
                let (sep, rest) = match separators.split_first() {
                    Some((sep, rest)) => (Some(*sep), rest),
                    None => (None, separators),
                };
                for (i, child) in children.iter().enumerate() {
                    if i > 0 {
                        if let Some(sep) = sep {
                            out.push(sep);
                        }
                    }
                    child.content.write(out, rest);
                }
            }
        }
    }

    // Collapse a single leaf child into a plain value, matching what the parser would produce.
    fn normalize(&mut self) {
        if let Content::Children(children) = self {
            for child in children.iter_mut() {
                child.content.normalize();
            }
            if children.len() == 1 && children[0].content.value().is_some() {
                let only = children.remove(0);
                *self = only.content;
            }
        }
    }
}

/// A named component or sub-component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    name: Option<String>,
    content: Content,
}

impl Node {
    pub fn new(name: Option<String>, content: Content) -> Self {
        Node { name, content }
    }

    pub fn leaf(name: Option<String>, value: impl Into<String>) -> Self {
        Node {
            name,
            content: Content::Value(value.into()),
        }
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn content(&self) -> &Content {
        &self.content
    }

    pub fn value(&self) -> Option<&str> {
        self.content.value()
    }

    pub fn children(&self) -> &[Node] {
        self.content.children()
    }
}

/// One field position of a segment, with one content per repetition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field {
    name: Option<String>,
    repetitions: Vec<Content>,
}

impl Field {
    pub fn new(name: Option<String>, repetitions: Vec<Content>) -> Self {
        let repetitions = if repetitions.is_empty() {
            vec![Content::empty()]
        } else {
            repetitions
        };
        Field { name, repetitions }
    }

    /// A single-repetition scalar field.  The value is stored verbatim, without splitting.
    pub fn leaf(name: Option<String>, value: impl Into<String>) -> Self {
        Field::new(name, vec![Content::Value(value.into())])
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn repetitions(&self) -> &[Content] {
        &self.repetitions
    }

    /// The scalar value of the first repetition, if it has no components.
    pub fn value(&self) -> Option<&str> {
        self.repetitions.first().and_then(Content::value)
    }

    pub fn to_er7(&self, delimiters: &Delimiters) -> String {
        let mut out = String::new();
        for (i, rep) in self.repetitions.iter().enumerate() {
            if i > 0 {
                out.push(delimiters.repetition);
            }
            rep.write(&mut out, &[delimiters.component, delimiters.subcomponent]);
        }
        out
    }

    fn clear(&mut self) {
        self.repetitions = vec![Content::empty()];
    }
}

/// A named segment such as `MSH` or `PID`.
///
/// Fields are stored by position, `fields()[0]` being `SEG-1`.  For `MSH`, `MSH-1` holds the
/// field separator and `MSH-2` the encoding characters; both are verbatim leaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    name: String,
    fields: Vec<Field>,
}

impl Segment {
    pub fn new(name: impl Into<String>) -> Self {
        Segment {
            name: name.into(),
            fields: Vec::new(),
        }
    }

    pub(crate) fn with_fields(name: String, fields: Vec<Field>) -> Self {
        Segment { name, fields }
    }

    /// An `MSH` segment declaring `delimiters`, with nothing after `MSH-2`.
    pub fn header(delimiters: &Delimiters) -> Self {
        Segment {
            name: "MSH".to_string(),
            fields: vec![
                Field::leaf(Some("MSH_1".to_string()), delimiters.field.to_string()),
                Field::leaf(
                    Some("MSH_2".to_string()),
                    delimiters.encoding_characters(),
                ),
            ],
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_header(&self) -> bool {
        self.name == "MSH"
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn push_field(&mut self, field: Field) {
        self.fields.push(field);
    }

    /// The field at 1-based `position`.
    pub fn field(&self, position: usize) -> Option<&Field> {
        position.checked_sub(1).and_then(|i| self.fields.get(i))
    }

    /// The er7 text of the field at `position`, or an empty string if the segment is shorter.
    pub fn field_text(&self, position: usize, delimiters: &Delimiters) -> String {
        self.field(position)
            .map(|f| f.to_er7(delimiters))
            .unwrap_or_default()
    }

    /// Parses `text` with `delimiters` and stores it at 1-based `position`, padding with empty
    /// fields as needed.  `MSH-1`/`MSH-2` cannot be replaced this way, and neither can a field be
    /// given text containing the field separator or a segment terminator; both return `false`.
    pub fn set_field_text(&mut self, position: usize, text: &str, delimiters: &Delimiters) -> bool {
        if position == 0 || (self.is_header() && position <= 2) || !delimiters.fits(text, 1) {
            return false;
        }
        self.pad_to(position);
        let name = field_name(&self.name, position);
        self.fields[position - 1] = parser::parse_field(text, delimiters, name);
        true
    }

    pub fn to_er7(&self, delimiters: &Delimiters) -> String {
        let mut out = self.name.clone();
        let fields = if self.is_header() {
            self.fields.get(1..).unwrap_or(&[])
        } else {
            &self.fields[..]
        };
        for field in fields {
            out.push(delimiters.field);
            out.push_str(&field.to_er7(delimiters));
        }
        out
    }

    fn pad_to(&mut self, position: usize) {
        while self.fields.len() < position {
            let name = field_name(&self.name, self.fields.len() + 1);
            self.fields.push(Field::leaf(Some(name), ""));
        }
    }
}

pub(crate) fn field_name(segment: &str, position: usize) -> String {
    format!("{}_{}", segment, position)
}

/// The root of an HL7 v2 message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    delimiters: Delimiters,
    terminator: SegmentTerminator,
    trailing_terminator: bool,
    segments: Vec<Segment>,
}

impl Message {
    /// An empty message with the given delimiters, typically used to build an acknowledgment.
    /// Every segment, including the last, is terminated with a carriage return.
    pub fn new(delimiters: Delimiters) -> Self {
        Message {
            delimiters,
            terminator: SegmentTerminator::Cr,
            trailing_terminator: true,
            segments: Vec::new(),
        }
    }

    pub(crate) fn from_parts(
        delimiters: Delimiters,
        terminator: SegmentTerminator,
        trailing_terminator: bool,
        segments: Vec<Segment>,
    ) -> Self {
        Message {
            delimiters,
            terminator,
            trailing_terminator,
            segments,
        }
    }

    pub fn delimiters(&self) -> &Delimiters {
        &self.delimiters
    }

    pub fn terminator(&self) -> SegmentTerminator {
        self.terminator
    }

    pub fn has_trailing_terminator(&self) -> bool {
        self.trailing_terminator
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn push_segment(&mut self, segment: Segment) {
        self.segments.push(segment);
    }

    /// Keeps only the segments for which `keep` returns true.  The header is always kept.
    pub fn retain_segments<F>(&mut self, mut keep: F)
    where
        F: FnMut(&Segment) -> bool,
    {
        self.segments.retain(|s| s.is_header() || keep(s));
    }

    /// The first segment called `name`.
    pub fn segment(&self, name: &str) -> Option<&Segment> {
        self.segments.iter().find(|s| s.name == name)
    }

    pub fn segment_mut(&mut self, name: &str) -> Option<&mut Segment> {
        self.segments.iter_mut().find(|s| s.name == name)
    }

    pub fn segments_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Segment> + 'a {
        self.segments.iter().filter(move |s| s.name == name)
    }

    pub fn msh(&self) -> Option<&Segment> {
        self.segments.first().filter(|s| s.is_header())
    }

    /// `MSH-9`, e.g. `ADT^A04`.
    pub fn message_type(&self) -> String {
        self.msh()
            .map(|msh| msh.field_text(9, &self.delimiters))
            .unwrap_or_default()
    }

    /// `MSH-10`, the sender assigned control ID.
    pub fn control_id(&self) -> String {
        self.msh()
            .map(|msh| msh.field_text(10, &self.delimiters))
            .unwrap_or_default()
    }

    pub fn to_er7(&self) -> String {
        parser::serialize(self)
    }

    /// A fully independent copy, produced by serializing and re-parsing the tree.
    pub fn deep_copy(&self) -> Message {
        match parser::parse(&self.to_er7()) {
            Ok(copy) => copy,
            Err(_) => self.clone(), // only reachable for hand built trees without a valid header
        }
    }

    /// Depth-first preorder walk: segments at depth 0, field repetitions at 1, components at 2,
    /// sub-components at 3.
    pub fn preorder(&self) -> Preorder<'_> {
        let stack = self
            .segments
            .iter()
            .rev()
            .map(|s| (NodeRef::Segment(s), 0))
            .collect();
        Preorder { stack }
    }

    /// Resolves a dotted path such as `PID`, `MSH.MSH_10` or `PID.PID_5.PID_5_1`.
    ///
    /// Components address the first repetition of a field.  Component 1 of a field without
    /// components is the field value itself.
    pub fn resolve_path(&self, path: &str) -> Option<PathRef<'_>> {
        let path = FieldPath::parse(path)?;
        let segment = self.segment(&path.segment)?;
        let field_pos = match path.field {
            None => return Some(PathRef::Segment(segment)),
            Some(f) => f,
        };
        let field = segment.field(field_pos)?;
        let comp_pos = match path.component {
            None => return Some(PathRef::Field(field)),
            Some(c) => c,
        };
        let rep = field.repetitions.first()?;
        let (comp_content, comp_node) = match rep {
            Content::Value(v) if comp_pos == 1 => {
                return match path.subcomponent {
                    None | Some(1) => Some(PathRef::Scalar(v)),
                    Some(_) => None,
                }
            }
            Content::Value(_) => return None,
            Content::Children(children) => {
                let node = children.get(comp_pos - 1)?;
                (&node.content, node)
            }
        };
        let sub_pos = match path.subcomponent {
            None => return Some(PathRef::Component(comp_node)),
            Some(s) => s,
        };
        match comp_content {
            Content::Value(v) if sub_pos == 1 => Some(PathRef::Scalar(v)),
            Content::Value(_) => None,
            Content::Children(children) => children.get(sub_pos - 1).map(PathRef::SubComponent),
        }
    }

    /// Sets the element addressed by `path` to `value`, parsed with this message's delimiters.
    ///
    /// Returns `false` (and leaves the tree untouched) if the path does not resolve to an existing
    /// segment, or if `value` carries a delimiter of the addressed level or one above it (a
    /// component value may not contain `^`, for instance).  Fields and components past the end of
    /// a resolved segment are created.
    pub fn set_value(&mut self, path: &str, value: &str) -> bool {
        let path = match FieldPath::parse(path) {
            Some(p) => p,
            None => return false,
        };
        let delimiters = self.delimiters;

        let field_pos = match path.field {
            None => {
                if path.segment == "MSH" {
                    return false;
                }
                if !delimiters.fits(value, 0) {
                    return false;
                }
                let index = match self.segments.iter().position(|s| s.name == path.segment) {
                    Some(i) => i,
                    None => return false,
                };
                return match parser::parse_segment(value, &delimiters, index) {
                    Ok(segment) if segment.name == path.segment => {
                        self.segments[index] = segment;
                        true
                    }
                    _ => false,
                };
            }
            Some(f) => f,
        };

        let segment = match self.segment_mut(&path.segment) {
            Some(s) => s,
            None => return false,
        };

        let comp_pos = match path.component {
            None => return segment.set_field_text(field_pos, value, &delimiters),
            Some(c) => c,
        };
        let depth = if path.subcomponent.is_some() { 3 } else { 2 };
        if (segment.is_header() && field_pos <= 2) || !delimiters.fits(value, depth) {
            return false;
        }
        segment.pad_to(field_pos);
        let field_label = field_name(&segment.name, field_pos);
        let field = &mut segment.fields[field_pos - 1];
        let rep = &mut field.repetitions[0];

        let comp_label = format!("{}_{}", field_label, comp_pos);
        let comp = child_mut(rep, comp_pos, &field_label);
        match path.subcomponent {
            None => {
                *comp = parser::parse_component(value, &delimiters, comp_label);
            }
            Some(sub_pos) => {
                let sub = child_mut(&mut comp.content, sub_pos, &comp_label);
                sub.content = Content::Value(value.to_string());
            }
        }
        rep.normalize();
        true
    }

    /// Clears the element addressed by `path` in every segment carrying that name.
    ///
    /// A bare segment path removes those segments entirely (`MSH` is never removed).  Returns
    /// `false` if nothing was affected.
    pub fn delete_value(&mut self, path: &str) -> bool {
        let path = match FieldPath::parse(path) {
            Some(p) => p,
            None => return false,
        };

        let field_pos = match path.field {
            None => {
                if path.segment == "MSH" {
                    return false;
                }
                let before = self.segments.len();
                self.segments.retain(|s| s.name != path.segment);
                return self.segments.len() != before;
            }
            Some(f) => f,
        };

        let mut affected = false;
        for segment in self.segments.iter_mut().filter(|s| s.name == path.segment) {
            if segment.is_header() && field_pos <= 2 {
                continue;
            }
            let field = match field_pos
                .checked_sub(1)
                .and_then(|i| segment.fields.get_mut(i))
            {
                Some(f) => f,
                None => continue,
            };
            affected |= clear_in_field(field, path.component, path.subcomponent);
        }
        affected
    }
}

fn clear_in_field(field: &mut Field, component: Option<usize>, subcomponent: Option<usize>) -> bool {
    let comp_pos = match component {
        None => {
            field.clear();
            return true;
        }
        Some(c) => c,
    };
    let mut affected = false;
    for rep in field.repetitions.iter_mut() {
        affected |= match rep {
            Content::Value(v) if comp_pos == 1 && subcomponent.map_or(true, |s| s == 1) => {
                v.clear();
                true
            }
            Content::Value(_) => false,
            Content::Children(children) => match children.get_mut(comp_pos - 1) {
                None => false,
                Some(comp) => match subcomponent {
                    None => {
                        comp.content = Content::empty();
                        true
                    }
                    Some(sub_pos) => match &mut comp.content {
                        Content::Value(v) if sub_pos == 1 => {
                            v.clear();
                            true
                        }
                        Content::Value(_) => false,
                        Content::Children(subs) => match subs.get_mut(sub_pos - 1) {
                            Some(sub) => {
                                sub.content = Content::empty();
                                true
                            }
                            None => false,
                        },
                    },
                },
            },
        };
        rep.normalize();
    }
    affected
}

// Returns child `position` (1-based) of `content`, promoting a scalar into a child list and
// padding with empty named nodes as needed.
fn child_mut<'a>(content: &'a mut Content, position: usize, parent_name: &str) -> &'a mut Node {
    if let Content::Value(v) = content {
        let first = Node::leaf(Some(format!("{}_1", parent_name)), std::mem::take(v));
        *content = Content::Children(vec![first]);
    }
    match content {
        Content::Children(children) => {
            while children.len() < position {
                let name = format!("{}_{}", parent_name, children.len() + 1);
                children.push(Node::leaf(Some(name), ""));
            }
            &mut children[position - 1]
        }
        Content::Value(_) => unreachable!("scalar content was promoted above"),
    }
}

/// A parsed dotted path: `SEG[.SEG_n[.SEG_n_m[.SEG_n_m_k]]]`, positions 1-based.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldPath {
    pub segment: String,
    pub field: Option<usize>,
    pub component: Option<usize>,
    pub subcomponent: Option<usize>,
}

impl FieldPath {
    pub fn parse(path: &str) -> Option<FieldPath> {
        let mut parts = path.trim().split('.');
        let segment = parts.next()?;
        if !is_segment_name(segment) {
            return None;
        }

        let mut positions = Vec::with_capacity(3);
        for (depth, part) in parts.enumerate() {
            if depth >= 3 {
                return None;
            }
            let mut tokens = part.split('_');
            if tokens.next()? != segment {
                return None;
            }
            let numbers = tokens
                .map(|t| t.parse::<usize>().ok().filter(|n| *n > 0))
                .collect::<Option<Vec<_>>>()?;
            // each level repeats its parent's positions: PID_5 -> PID_5_1 -> PID_5_1_2
            if numbers.len() != depth + 1 || numbers[..depth] != positions[..] {
                return None;
            }
            positions.push(numbers[depth]);
        }

        Some(FieldPath {
            segment: segment.to_string(),
            field: positions.first().copied(),
            component: positions.get(1).copied(),
            subcomponent: positions.get(2).copied(),
        })
    }
}

pub(crate) fn is_segment_name(name: &str) -> bool {
    name.len() == 3
        && name
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

/// The target of a resolved path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathRef<'a> {
    Segment(&'a Segment),
    Field(&'a Field),
    Component(&'a Node),
    SubComponent(&'a Node),
    /// The implied first component (or sub-component) of an element that has none.
    Scalar(&'a str),
}

impl PathRef<'_> {
    pub fn to_er7(&self, delimiters: &Delimiters) -> String {
        match self {
            PathRef::Segment(s) => s.to_er7(delimiters),
            PathRef::Field(f) => f.to_er7(delimiters),
            PathRef::Component(n) => node_er7(n, &[delimiters.subcomponent]),
            PathRef::SubComponent(n) => node_er7(n, &[]),
            PathRef::Scalar(v) => v.to_string(),
        }
    }
}

fn node_er7(node: &Node, separators: &[char]) -> String {
    let mut out = String::new();
    node.content.write(&mut out, separators);
    out
}

/// A borrowed view of any node in the tree, as yielded by [`Message::preorder`].
#[derive(Debug, Clone, Copy)]
pub enum NodeRef<'a> {
    Segment(&'a Segment),
    Field {
        field: &'a Field,
        repetition: &'a Content,
    },
    Component(&'a Node),
    SubComponent(&'a Node),
}

impl<'a> NodeRef<'a> {
    pub fn name(&self) -> Option<&'a str> {
        match self {
            NodeRef::Segment(s) => Some(s.name()),
            NodeRef::Field { field, .. } => field.name(),
            NodeRef::Component(n) | NodeRef::SubComponent(n) => n.name(),
        }
    }

    pub fn to_er7(&self, delimiters: &Delimiters) -> String {
        match self {
            NodeRef::Segment(s) => s.to_er7(delimiters),
            NodeRef::Field { repetition, .. } => {
                let mut out = String::new();
                repetition.write(&mut out, &[delimiters.component, delimiters.subcomponent]);
                out
            }
            NodeRef::Component(n) => node_er7(n, &[delimiters.subcomponent]),
            NodeRef::SubComponent(n) => node_er7(n, &[]),
        }
    }

    fn push_children(&self, stack: &mut Vec<(NodeRef<'a>, usize)>, depth: usize) {
        match *self {
            NodeRef::Segment(s) => {
                for field in s.fields.iter().rev() {
                    for repetition in field.repetitions.iter().rev() {
                        stack.push((NodeRef::Field { field, repetition }, depth + 1));
                    }
                }
            }
            NodeRef::Field { repetition, .. } => {
                for child in repetition.children().iter().rev() {
                    stack.push((NodeRef::Component(child), depth + 1));
                }
            }
            NodeRef::Component(n) => {
                for child in n.children().iter().rev() {
                    stack.push((NodeRef::SubComponent(child), depth + 1));
                }
            }
            NodeRef::SubComponent(_) => {}
        }
    }
}

/// Iterator returned by [`Message::preorder`].
pub struct Preorder<'a> {
    stack: Vec<(NodeRef<'a>, usize)>,
}

impl<'a> Iterator for Preorder<'a> {
    type Item = (NodeRef<'a>, usize);

    fn next(&mut self) -> Option<Self::Item> {
        let (node, depth) = self.stack.pop()?;
        node.push_children(&mut self.stack, depth);
        Some((node, depth))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    const ADT: &str = "MSH|^~\\&|A|B|C|D|199912271408|X|ADT^A04|123|D|2.5\rPID||1||DOE^JOHN~ROE&X^MARY|19480203\rNK1||ROE^MARIE\rNK1||DOE^ROBERT";

    #[test]
    fn typed_accessors() {
        let m = parse(ADT).unwrap();
        assert_eq!(m.message_type(), "ADT^A04");
        assert_eq!(m.control_id(), "123");
        assert_eq!(m.segments_named("NK1").count(), 2);
        assert_eq!(m.segment("PID").unwrap().field(2).unwrap().value(), Some("1"));
    }

    #[test]
    fn resolve_path_walks_down_to_sub_components() {
        let m = parse(ADT).unwrap();
        let d = *m.delimiters();

        match m.resolve_path("MSH.MSH_10") {
            Some(PathRef::Field(f)) => assert_eq!(f.value(), Some("123")),
            other => panic!("unexpected resolution {:?}", other),
        }

        let name = m.resolve_path("PID.PID_4").unwrap();
        assert_eq!(name.to_er7(&d), "DOE^JOHN~ROE&X^MARY");

        let given = m.resolve_path("PID.PID_4.PID_4_2").unwrap();
        assert_eq!(given.to_er7(&d), "JOHN");

        // first component of an unsplit field is the field value
        assert_eq!(m.resolve_path("PID.PID_2.PID_2_1"), Some(PathRef::Scalar("1")));
    }

    #[test]
    fn resolve_path_reports_absence() {
        let m = parse(ADT).unwrap();
        assert!(m.resolve_path("ZZZ").is_none());
        assert!(m.resolve_path("PID.PID_99").is_none());
        assert!(m.resolve_path("PID.NK1_1").is_none());
        assert!(m.resolve_path("PID.PID_4.PID_5_1").is_none());
        assert!(m.resolve_path("pid").is_none());
        assert!(m.resolve_path("").is_none());
    }

    #[test]
    fn set_value_parses_with_message_delimiters() {
        let mut m = parse(ADT).unwrap();
        assert!(m.set_value("PID.PID_4", "SMITH^JANE"));
        assert_eq!(
            m.segment("PID").unwrap().field(4).unwrap().repetitions()[0]
                .children()
                .len(),
            2
        );
        assert!(m.to_er7().contains("PID||1||SMITH^JANE|19480203"));
    }

    #[test]
    fn set_value_extends_fields_and_components() {
        let mut m = parse("MSH|^~\\&|A|B|C|D|1||ACK|9|P|2.5\rMSA|AA").unwrap();
        assert!(m.set_value("MSA.MSA_3", "received"));
        assert!(!m.set_value("PID.PID_1", "x"));
        assert!(m.set_value("MSH.MSH_3.MSH_3_3", "L"));
        assert_eq!(
            m.to_er7(),
            "MSH|^~\\&|A^^L|B|C|D|1||ACK|9|P|2.5\rMSA|AA||received"
        );
    }

    #[test]
    fn set_value_refuses_delimiter_fields() {
        let mut m = parse(ADT).unwrap();
        assert!(!m.set_value("MSH.MSH_1", "#"));
        assert!(!m.set_value("MSH.MSH_2", "!!!!"));
        assert!(!m.set_value("MSH", "MSH|whatever"));
        assert_eq!(m, parse(ADT).unwrap());
    }

    #[test]
    fn set_value_refuses_text_that_would_split_the_field() {
        let mut m = parse(ADT).unwrap();
        assert!(!m.set_value("PID.PID_5", "a|b"));
        assert!(!m.set_value("PID.PID_5", "x\rZZZ|1"));
        assert!(!m.set_value("NK1", "NK1||A\rZZZ|1"));
        assert_eq!(m, parse(ADT).unwrap());

        assert!(m.set_value("PID.PID_5", "SMITH^JANE~ROE&X^MARY"));
        assert_eq!(m.resolve_path("PID.PID_5.PID_5_2").unwrap().to_er7(m.delimiters()), "JANE");
        assert_eq!(parse(&m.to_er7()).unwrap(), m);
    }

    #[test]
    fn set_value_refuses_component_text_with_higher_delimiters() {
        let mut m = parse(ADT).unwrap();
        assert!(!m.set_value("PID.PID_4.PID_4_1", "SMITH^JANE"));
        assert!(!m.set_value("PID.PID_4.PID_4_1", "SMITH~JANE"));
        assert!(!m.set_value("PID.PID_4.PID_4_1", "SMITH|JANE"));
        assert_eq!(m, parse(ADT).unwrap());

        assert!(m.set_value("PID.PID_4.PID_4_1", "SMITH&J"));
        assert_eq!(parse(&m.to_er7()).unwrap(), m);
    }

    #[test]
    fn set_value_refuses_subcomponent_text_with_any_delimiter() {
        let mut m = parse(ADT).unwrap();
        for text in ["A^B", "A&B", "A~B", "A|B", "A\nB"] {
            assert!(!m.set_value("PID.PID_4.PID_4_2.PID_4_2_1", text), "{:?} was stored", text);
        }
        assert_eq!(m, parse(ADT).unwrap());

        assert!(m.set_value("PID.PID_4.PID_4_2.PID_4_2_1", "JIM"));
        assert_eq!(parse(&m.to_er7()).unwrap(), m);
    }

    #[test]
    fn delete_value_clears_every_occurrence() {
        let mut m = parse(ADT).unwrap();
        assert!(m.delete_value("NK1.NK1_2"));
        assert_eq!(
            m.to_er7(),
            "MSH|^~\\&|A|B|C|D|199912271408|X|ADT^A04|123|D|2.5\rPID||1||DOE^JOHN~ROE&X^MARY|19480203\rNK1||\rNK1||"
        );
    }

    #[test]
    fn delete_value_removes_segments_but_not_the_header() {
        let mut m = parse(ADT).unwrap();
        assert!(m.delete_value("NK1"));
        assert_eq!(m.segments().len(), 2);
        assert!(!m.delete_value("NK1"));
        assert!(!m.delete_value("MSH"));
        assert!(m.msh().is_some());
    }

    #[test]
    fn delete_value_on_missing_path_is_a_no_op() {
        let mut m = parse(ADT).unwrap();
        assert!(!m.delete_value("PID.PID_40"));
        assert!(!m.delete_value("OBX.OBX_5"));
        assert!(!m.delete_value("not a path"));
        assert_eq!(m, parse(ADT).unwrap());
    }

    #[test]
    fn deep_copy_is_independent() {
        let original = parse(ADT).unwrap();
        let mut copy = original.deep_copy();
        assert_eq!(copy, original);
        copy.delete_value("PID.PID_4");
        assert_ne!(copy, original);
        assert_eq!(original.segment("PID").unwrap().field_text(4, original.delimiters()), "DOE^JOHN~ROE&X^MARY");
    }

    #[test]
    fn preorder_visits_segment_then_field_then_component() {
        let m = parse("MSH|^~\\&|A|B|C|D|1||ADT^A04|7|P|2.5\rPID|a&b|x^y").unwrap();
        let pid: Vec<(String, usize)> = m
            .preorder()
            .skip_while(|(n, _)| n.name() != Some("PID"))
            .map(|(n, d)| (n.name().unwrap_or("unnamed").to_string(), d))
            .collect();
        assert_eq!(
            pid,
            vec![
                ("PID".to_string(), 0),
                ("PID_1".to_string(), 1),
                ("PID_1_1".to_string(), 2),
                ("PID_1_1_1".to_string(), 3),
                ("PID_1_1_2".to_string(), 3),
                ("PID_2".to_string(), 1),
                ("PID_2_1".to_string(), 2),
                ("PID_2_2".to_string(), 2),
            ]
        );
    }

    #[test]
    fn field_paths_must_repeat_their_parent() {
        assert!(FieldPath::parse("PID.PID_5.PID_5_1.PID_5_1_2").is_some());
        assert!(FieldPath::parse("PID.PID_5.PID_6_1").is_none());
        assert!(FieldPath::parse("PID.PID_0").is_none());
        assert!(FieldPath::parse("PID.PID_5.PID_5_1.PID_5_1_2.PID_5_1_2_1").is_none());
    }
}
