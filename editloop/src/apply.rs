//! Offline transcript handling for `editloop parse` and `editloop apply`.
//!
//! A saved agent response is replayed through the same streaming parser the
//! controller uses, split into fixed-size chunks.

use serde::Serialize;

use crate::core::applier::{BatchReport, apply_batch};
use crate::core::directive::{DirectiveIssue, SpannedDirective};
use crate::core::overlay::{BaseTree, OverlayStore};
use crate::core::parser::TagParser;

pub const DEFAULT_CHUNK_BYTES: usize = 64;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ParsedTranscript {
    pub directives: Vec<SpannedDirective>,
    /// Path-guard rejections and malformed-directive warnings.
    pub issues: Vec<DirectiveIssue>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AppliedTranscript {
    pub applied: Vec<SpannedDirective>,
    pub unchanged: usize,
    pub issues: Vec<DirectiveIssue>,
}

/// Split `text` into chunks of at most `chunk_bytes`, never inside a character.
pub fn chunk_text(text: &str, chunk_bytes: usize) -> Vec<&str> {
    let chunk_bytes = chunk_bytes.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let mut end = (start + chunk_bytes).min(text.len());
        while !text.is_char_boundary(end) {
            end += 1;
        }
        chunks.push(&text[start..end]);
        start = end;
    }
    chunks
}

pub fn parse_transcript(text: &str, chunk_bytes: usize) -> ParsedTranscript {
    let mut parser = TagParser::new(0);
    let mut parsed = ParsedTranscript::default();
    for chunk in chunk_text(text, chunk_bytes) {
        let batch = parser.push(chunk);
        parsed.directives.extend(batch.directives);
        parsed.issues.extend(batch.rejected);
    }
    parsed.issues.extend(parser.finish());
    parsed
}

/// Parse and apply a transcript batch by batch, as if it were streaming.
pub fn apply_transcript<B: BaseTree + ?Sized>(
    text: &str,
    chunk_bytes: usize,
    overlay: &mut OverlayStore,
    base: &B,
) -> AppliedTranscript {
    let mut parser = TagParser::new(0);
    let mut outcome = AppliedTranscript::default();
    for chunk in chunk_text(text, chunk_bytes) {
        let batch = parser.push(chunk);
        if batch.is_empty() {
            continue;
        }
        outcome.issues.extend(batch.rejected);
        let BatchReport {
            applied,
            unchanged,
            issues,
        } = apply_batch(overlay, base, &batch.directives);
        outcome.applied.extend(applied);
        outcome.unchanged += unchanged.len();
        outcome.issues.extend(issues);
    }
    outcome.issues.extend(parser.finish());
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::directive::{Directive, IssueKind};
    use crate::core::overlay::MemoryTree;
    use crate::core::path::normalize;

    const TRANSCRIPT: &str = "Plan: rename then write.\n\
<edit-rename from=\"src/a.ts\" to=\"src/b.ts\" />\n\
<edit-write path=\"src/c.ts\">\nexport const c = 1;\n</edit-write>\n\
<edit-delete path=\"../escape.ts\" />\n\
<edit-write path=\"src/unfinished.ts\">\nnever closed";

    #[test]
    fn chunks_respect_char_boundaries() {
        let chunks = chunk_text("aé日b", 2);
        assert_eq!(chunks.concat(), "aé日b");
        assert!(chunks.iter().all(|c| !c.is_empty()));
    }

    #[test]
    fn parse_reports_directives_and_issues() {
        let parsed = parse_transcript(TRANSCRIPT, 7);
        assert_eq!(parsed.directives.len(), 2);
        let kinds: Vec<IssueKind> = parsed.issues.iter().map(|i| i.kind).collect();
        assert_eq!(
            kinds,
            vec![IssueKind::PathEscape, IssueKind::MalformedDirective]
        );
    }

    #[test]
    fn apply_uses_base_tree_for_renames() {
        let base = MemoryTree::new().with_file(normalize("src/a.ts").unwrap(), "a");
        let mut overlay = OverlayStore::new();
        let outcome = apply_transcript(TRANSCRIPT, 5, &mut overlay, &base);

        assert_eq!(outcome.applied.len(), 2);
        assert!(matches!(
            outcome.applied[0].directive,
            Directive::Rename { .. }
        ));
        assert_eq!(
            overlay.read_file(&base, &normalize("src/b.ts").unwrap()).as_deref(),
            Some("a")
        );
        assert!(overlay.deleted_files().contains(&normalize("src/a.ts").unwrap()));
        assert_eq!(
            overlay.writes().get(&normalize("src/c.ts").unwrap()).map(String::as_str),
            Some("export const c = 1;\n")
        );
    }
}
