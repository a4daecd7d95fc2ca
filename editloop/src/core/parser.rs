//! Incremental parser for `<edit-*>` directives embedded in streamed text.
//!
//! The parser is a small explicit state machine over an append-only buffer:
//!
//! ```text
//! Text --"<edit-"--> OpenTag --">"--> Body --"</edit-kind>"--> Text
//!                       \--"/>"-----------------------------> Text
//! ```
//!
//! A scan cursor only ever moves forward, so growing the buffer never re-emits a
//! directive and never rescans text already classified. Partial markers at the
//! tail of the buffer (`<ed`, `</edit-wr`) keep the cursor parked just before
//! them until more input arrives.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, warn};

use crate::core::directive::{
    Directive, DirectiveIssue, DirectiveKind, SourceSpan, SpannedDirective,
};
use crate::core::error::BufferDiverged;
use crate::core::path::{ProjectPath, normalize};

const OPEN_PREFIX: &str = "<edit-";

/// Directives closed by one `push`, plus directives skipped by the path guard.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseBatch {
    pub directives: Vec<SpannedDirective>,
    pub rejected: Vec<DirectiveIssue>,
}

impl ParseBatch {
    pub fn is_empty(&self) -> bool {
        self.directives.is_empty() && self.rejected.is_empty()
    }

    /// Merge another batch, preserving stream order.
    pub fn extend(&mut self, other: ParseBatch) {
        self.directives.extend(other.directives);
        self.rejected.extend(other.rejected);
    }
}

#[derive(Debug, Clone)]
struct OpenedTag {
    kind: DirectiveKind,
    attrs: BTreeMap<String, String>,
    start: usize,
    body_start: usize,
}

#[derive(Debug, Clone)]
enum ScanState {
    /// Looking for the next `<edit-` marker.
    Text,
    /// Inside `<edit-... ` waiting for the unquoted `>`.
    OpenTag { start: usize, quote: Option<u8> },
    /// Accumulating a body until the matching close tag.
    Body(OpenedTag),
}

/// Streaming directive parser for one generation stream.
#[derive(Debug, Clone)]
pub struct TagParser {
    stream: u32,
    buffer: String,
    cursor: usize,
    state: ScanState,
    warnings: Vec<DirectiveIssue>,
}

impl TagParser {
    /// Create a parser for the `stream`-th generation of a turn.
    pub fn new(stream: u32) -> Self {
        Self {
            stream,
            buffer: String::new(),
            cursor: 0,
            state: ScanState::Text,
            warnings: Vec::new(),
        }
    }

    /// All text received so far.
    pub fn buffer(&self) -> &str {
        &self.buffer
    }

    /// True while a directive has been opened but not yet closed.
    pub fn is_inside_directive(&self) -> bool {
        !matches!(self.state, ScanState::Text)
    }

    /// Append a chunk and return every directive it closed.
    pub fn push(&mut self, chunk: &str) -> ParseBatch {
        self.buffer.push_str(chunk);
        let mut out = ParseBatch::default();
        self.scan(&mut out);
        out
    }

    /// Feed the whole cumulative text seen so far for this stream.
    ///
    /// Only the suffix beyond what was already parsed is scanned. A buffer that
    /// does not start with the already-parsed text is rejected.
    pub fn sync(&mut self, cumulative: &str) -> Result<ParseBatch, BufferDiverged> {
        let Some(suffix) = cumulative.strip_prefix(self.buffer.as_str()) else {
            return Err(BufferDiverged {
                seen: self.buffer.len(),
            });
        };
        let suffix = suffix.to_string();
        Ok(self.push(&suffix))
    }

    /// End the stream and return all malformed-directive warnings.
    ///
    /// A directive still open at this point is reported as unterminated.
    pub fn finish(mut self) -> Vec<DirectiveIssue> {
        let open_start = match &self.state {
            ScanState::Text => None,
            ScanState::OpenTag { start, .. } => Some(*start),
            ScanState::Body(tag) => Some(tag.start),
        };
        if let Some(start) = open_start {
            let span = self.span(start, self.buffer.len());
            let preview: String = self.buffer[start..].chars().take(60).collect();
            warn!(start, "unterminated directive at end of stream");
            self.warnings.push(DirectiveIssue::malformed(
                span,
                format!("unterminated directive: {preview}"),
            ));
        }
        self.warnings
    }

    fn span(&self, start: usize, end: usize) -> SourceSpan {
        SourceSpan {
            stream: self.stream,
            start,
            end,
        }
    }

    fn scan(&mut self, out: &mut ParseBatch) {
        loop {
            let state = std::mem::replace(&mut self.state, ScanState::Text);
            let progressed = match state {
                ScanState::Text => self.scan_text(),
                ScanState::OpenTag { start, quote } => self.scan_open_tag(start, quote, out),
                ScanState::Body(tag) => self.scan_body(tag, out),
            };
            if !progressed {
                return;
            }
        }
    }

    fn scan_text(&mut self) -> bool {
        while let Some(rel) = self.buffer[self.cursor..].find('<') {
            let at = self.cursor + rel;
            let rest = &self.buffer[at..];
            if rest.starts_with(OPEN_PREFIX) {
                self.cursor = at + OPEN_PREFIX.len();
                self.state = ScanState::OpenTag {
                    start: at,
                    quote: None,
                };
                return true;
            }
            if OPEN_PREFIX.starts_with(rest) {
                // Possibly a marker split across chunks.
                self.cursor = at;
                return false;
            }
            self.cursor = at + 1;
        }
        self.cursor = self.buffer.len();
        false
    }

    fn scan_open_tag(&mut self, start: usize, mut quote: Option<u8>, out: &mut ParseBatch) -> bool {
        let bytes = self.buffer.as_bytes();
        let mut i = self.cursor;
        while i < bytes.len() {
            let b = bytes[i];
            match quote {
                Some(q) if b == q => quote = None,
                Some(_) => {}
                None if b == b'"' || b == b'\'' => quote = Some(b),
                None if b == b'>' => {
                    let header = self.buffer[start + 1..i].to_string();
                    self.cursor = i + 1;
                    self.open_tag(start, &header, i + 1, out);
                    return true;
                }
                None if b == b'<' => {
                    let span = self.span(start, i);
                    self.warnings.push(DirectiveIssue::malformed(
                        span,
                        "directive tag interrupted before '>'",
                    ));
                    self.cursor = i;
                    return true;
                }
                None => {}
            }
            i += 1;
        }
        self.cursor = i;
        self.state = ScanState::OpenTag { start, quote };
        false
    }

    fn open_tag(&mut self, start: usize, header: &str, body_start: usize, out: &mut ParseBatch) {
        let header = header.trim_end();
        let self_closing = header.ends_with('/');
        let header = header.trim_end_matches('/');
        let (name, attr_text) = match header.find(char::is_whitespace) {
            Some(idx) => (&header[..idx], &header[idx..]),
            None => (header, ""),
        };
        let span = self.span(start, body_start);

        let Some(kind) = name
            .strip_prefix("edit-")
            .and_then(DirectiveKind::from_tag_name)
        else {
            self.warnings.push(DirectiveIssue::malformed(
                span,
                format!("unknown directive tag <{name}>"),
            ));
            return;
        };
        let attrs = parse_attributes(attr_text);

        if self_closing {
            if kind == DirectiveKind::Write {
                self.warnings.push(DirectiveIssue::malformed(
                    span,
                    "edit-write requires a body and a closing tag",
                ));
                return;
            }
            self.close_directive(kind, &attrs, "", span, out);
            return;
        }

        self.state = ScanState::Body(OpenedTag {
            kind,
            attrs,
            start,
            body_start,
        });
    }

    fn scan_body(&mut self, tag: OpenedTag, out: &mut ParseBatch) -> bool {
        let close = close_tag(tag.kind);
        let search_from = self.cursor.max(tag.body_start);
        match self.buffer[search_from..].find(close.as_str()) {
            Some(rel) => {
                let close_at = search_from + rel;
                let end = close_at + close.len();
                let span = self.span(tag.start, end);
                let body = self.buffer[tag.body_start..close_at].to_string();
                self.close_directive(tag.kind, &tag.attrs, &body, span, out);
                self.cursor = end;
                true
            }
            None => {
                // Keep enough tail to recognize a close tag split across chunks.
                let resume = self
                    .buffer
                    .len()
                    .saturating_sub(close.len() - 1)
                    .max(tag.body_start);
                self.cursor = floor_char_boundary(&self.buffer, resume).max(tag.body_start);
                self.state = ScanState::Body(tag);
                false
            }
        }
    }

    fn close_directive(
        &mut self,
        kind: DirectiveKind,
        attrs: &BTreeMap<String, String>,
        body: &str,
        span: SourceSpan,
        out: &mut ParseBatch,
    ) {
        match build_directive(kind, attrs, body) {
            Ok(directive) => {
                debug!(directive = %directive.label(), start = span.start, end = span.end, "directive closed");
                out.directives.push(SpannedDirective { directive, span });
            }
            Err(BuildError::Path(err)) => {
                warn!(%err, "directive skipped by path guard");
                out.rejected.push(DirectiveIssue::from_path_error(span, &err));
            }
            Err(BuildError::Malformed(message)) => {
                self.warnings.push(DirectiveIssue::malformed(span, message));
            }
        }
    }
}

enum BuildError {
    Path(crate::core::error::PathError),
    Malformed(String),
}

fn build_directive(
    kind: DirectiveKind,
    attrs: &BTreeMap<String, String>,
    body: &str,
) -> Result<Directive, BuildError> {
    match kind {
        DirectiveKind::Write => Ok(Directive::Write {
            path: required_path(kind, attrs, "path")?,
            content: write_content(body),
            description: attrs
                .get("description")
                .map(|d| d.trim().to_string())
                .filter(|d| !d.is_empty()),
        }),
        DirectiveKind::Rename => Ok(Directive::Rename {
            from: required_path(kind, attrs, "from")?,
            to: required_path(kind, attrs, "to")?,
        }),
        DirectiveKind::Delete => Ok(Directive::Delete {
            path: required_path(kind, attrs, "path")?,
        }),
        DirectiveKind::AddDependency => {
            let source = attrs.get("packages").map(String::as_str).unwrap_or(body);
            let packages: BTreeSet<String> =
                source.split_whitespace().map(str::to_string).collect();
            if packages.is_empty() {
                return Err(BuildError::Malformed(
                    "edit-add-dependency lists no packages".to_string(),
                ));
            }
            Ok(Directive::AddDependency { packages })
        }
    }
}

fn required_path(
    kind: DirectiveKind,
    attrs: &BTreeMap<String, String>,
    name: &str,
) -> Result<ProjectPath, BuildError> {
    let raw = attrs.get(name).ok_or_else(|| {
        BuildError::Malformed(format!(
            "edit-{} is missing the {name:?} attribute",
            kind.tag_name()
        ))
    })?;
    normalize(raw).map_err(BuildError::Path)
}

fn close_tag(kind: DirectiveKind) -> String {
    format!("</edit-{}>", kind.tag_name())
}

/// Parse `key="value"` / `key='value'` pairs, decoding the basic XML entities.
fn parse_attributes(text: &str) -> BTreeMap<String, String> {
    static ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r#"([A-Za-z_][\w\-:]*)\s*=\s*(?:"([^"]*)"|'([^']*)')"#).unwrap()
    });

    let mut attrs = BTreeMap::new();
    for caps in ATTR_RE.captures_iter(text) {
        let key = caps[1].to_string();
        let value = caps
            .get(2)
            .or_else(|| caps.get(3))
            .map(|m| decode_entities(m.as_str()))
            .unwrap_or_default();
        attrs.entry(key).or_insert(value);
    }
    attrs
}

fn decode_entities(raw: &str) -> String {
    if !raw.contains('&') {
        return raw.to_string();
    }
    raw.replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

/// Final file content for a write body.
///
/// A body wrapped in a single fenced block loses both fence lines; otherwise
/// only the line break right after the opening tag is dropped. Line endings
/// are kept as written.
fn write_content(body: &str) -> String {
    let lines: Vec<&str> = body.split_inclusive('\n').collect();
    let first = lines.iter().position(|line| !line.trim().is_empty());
    let last = lines.iter().rposition(|line| !line.trim().is_empty());
    if let (Some(first), Some(last)) = (first, last)
        && last > first
        && lines[first].trim_start().starts_with("```")
        && lines[last].trim() == "```"
    {
        return lines[first + 1..last].concat();
    }
    body.strip_prefix("\r\n")
        .or_else(|| body.strip_prefix('\n'))
        .unwrap_or(body)
        .to_string()
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}
