//! Deterministic application of directive batches to an [`OverlayStore`].
//!
//! Within one batch every delete applies first, then every rename, then every
//! write; add-dependency directives are unioned last. Each class keeps stream
//! order. A failing directive is recorded as an issue and the rest of the batch
//! still applies.

use tracing::{debug, warn};

use crate::core::directive::{Directive, DirectiveIssue, DirectiveKind, SpannedDirective};
use crate::core::error::ApplyError;
use crate::core::overlay::{BaseTree, OverlayStore};
use crate::core::path::ProjectPath;

/// Effect of applying one directive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The overlay changed.
    Changed,
    /// The directive replayed state the overlay already holds.
    Unchanged,
}

/// Outcome of one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    /// Directives that changed the overlay, in application order.
    pub applied: Vec<SpannedDirective>,
    /// Directives that were no-op replays.
    pub unchanged: Vec<SpannedDirective>,
    pub issues: Vec<DirectiveIssue>,
}

impl BatchReport {
    pub fn is_empty(&self) -> bool {
        self.applied.is_empty() && self.unchanged.is_empty() && self.issues.is_empty()
    }
}

/// Position of a directive class in the fixed application order.
fn class_rank(kind: DirectiveKind) -> u8 {
    match kind {
        DirectiveKind::Delete => 0,
        DirectiveKind::Rename => 1,
        DirectiveKind::Write => 2,
        DirectiveKind::AddDependency => 3,
    }
}

/// Apply a batch of newly closed directives in the fixed class order.
pub fn apply_batch<B: BaseTree + ?Sized>(
    overlay: &mut OverlayStore,
    base: &B,
    batch: &[SpannedDirective],
) -> BatchReport {
    let mut ordered: Vec<&SpannedDirective> = batch.iter().collect();
    // Stable sort keeps stream order within each class.
    ordered.sort_by_key(|spanned| class_rank(spanned.directive.kind()));

    let mut report = BatchReport::default();
    for spanned in ordered {
        match apply_directive(overlay, base, &spanned.directive) {
            Ok(Applied::Changed) => {
                debug!(directive = %spanned.directive.label(), "applied");
                report.applied.push(spanned.clone());
            }
            Ok(Applied::Unchanged) => {
                debug!(directive = %spanned.directive.label(), "replay was a no-op");
                report.unchanged.push(spanned.clone());
            }
            Err(err) => {
                warn!(%err, directive = %spanned.directive.label(), "directive failed");
                report
                    .issues
                    .push(DirectiveIssue::from_apply_error(spanned.span, &err));
            }
        }
    }
    debug_assert!(overlay.holds_consistent_state());
    report
}

/// Apply a single directive.
pub fn apply_directive<B: BaseTree + ?Sized>(
    overlay: &mut OverlayStore,
    base: &B,
    directive: &Directive,
) -> Result<Applied, ApplyError> {
    match directive {
        Directive::Delete { path } => Ok(apply_delete(overlay, path)),
        Directive::Rename { from, to } => apply_rename(overlay, base, from, to),
        Directive::Write { path, content, .. } => Ok(apply_write(overlay, path, content)),
        Directive::AddDependency { packages } => {
            let mut added = false;
            for package in packages {
                added |= overlay.dependencies.insert(package.clone());
            }
            Ok(if added {
                Applied::Changed
            } else {
                Applied::Unchanged
            })
        }
    }
}

pub fn apply_delete(overlay: &mut OverlayStore, path: &ProjectPath) -> Applied {
    let removed_write = overlay.writes.remove(path).is_some();
    overlay.closed_writes.remove(path);
    let newly_deleted = overlay.deletes.insert(path.clone());
    if removed_write || newly_deleted {
        Applied::Changed
    } else {
        Applied::Unchanged
    }
}

pub fn apply_rename<B: BaseTree + ?Sized>(
    overlay: &mut OverlayStore,
    base: &B,
    from: &ProjectPath,
    to: &ProjectPath,
) -> Result<Applied, ApplyError> {
    if from == to {
        return if overlay.file_exists(base, from) {
            Ok(Applied::Unchanged)
        } else {
            Err(ApplyError::SourceNotFound { from: from.clone() })
        };
    }

    let content = match overlay.writes.remove(from) {
        Some(content) => content,
        None => overlay
            .read_file(base, from)
            .ok_or_else(|| ApplyError::SourceNotFound { from: from.clone() })?,
    };
    overlay.closed_writes.remove(from);
    overlay.writes.insert(to.clone(), content);
    overlay.deletes.remove(to);
    overlay.deletes.insert(from.clone());
    record_rename(overlay, from, to);
    Ok(Applied::Changed)
}

fn record_rename(overlay: &mut OverlayStore, from: &ProjectPath, to: &ProjectPath) {
    let origin = overlay
        .renames
        .iter()
        .find(|(_, target)| *target == from)
        .map(|(origin, _)| origin.clone());
    match origin {
        Some(origin) if origin == *to => {
            overlay.renames.remove(&origin);
        }
        Some(origin) => {
            overlay.renames.insert(origin, to.clone());
        }
        None => {
            overlay.renames.insert(from.clone(), to.clone());
        }
    }
}

pub fn apply_write(overlay: &mut OverlayStore, path: &ProjectPath, content: &str) -> Applied {
    if overlay.closed_writes.contains(path)
        && overlay.writes.get(path).map(String::as_str) == Some(content)
    {
        return Applied::Unchanged;
    }
    overlay.writes.insert(path.clone(), content.to_string());
    overlay.deletes.remove(path);
    overlay.closed_writes.insert(path.clone());
    Applied::Changed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::directive::{IssueKind, SourceSpan};
    use crate::core::overlay::MemoryTree;
    use crate::core::path::normalize;

    fn p(raw: &str) -> ProjectPath {
        normalize(raw).unwrap()
    }

    fn spanned(directive: Directive, start: usize) -> SpannedDirective {
        SpannedDirective {
            directive,
            span: SourceSpan {
                stream: 0,
                start,
                end: start + 1,
            },
        }
    }

    fn write(path: &str, content: &str) -> Directive {
        Directive::Write {
            path: p(path),
            content: content.to_string(),
            description: None,
        }
    }

    #[test]
    fn write_after_delete_in_same_batch_wins() {
        let base = MemoryTree::new().with_file(p("a.ts"), "old");
        let mut overlay = OverlayStore::new();
        // Write appears first in the stream, but deletes always apply first.
        let batch = vec![
            spanned(write("a.ts", "new"), 0),
            spanned(Directive::Delete { path: p("a.ts") }, 10),
        ];

        let report = apply_batch(&mut overlay, &base, &batch);

        assert_eq!(report.applied.len(), 2);
        assert_eq!(report.applied[0].directive.kind(), DirectiveKind::Delete);
        assert_eq!(overlay.writes().get(&p("a.ts")).map(String::as_str), Some("new"));
        assert!(!overlay.deletes().contains(&p("a.ts")));
    }

    #[test]
    fn replaying_a_closed_write_is_a_no_op() {
        let base = MemoryTree::new();
        let mut overlay = OverlayStore::new();
        let batch = vec![spanned(write("a.ts", "same"), 0)];

        let first = apply_batch(&mut overlay, &base, &batch);
        let after_first = overlay.clone();
        let second = apply_batch(&mut overlay, &base, &batch);

        assert_eq!(first.applied.len(), 1);
        assert!(second.applied.is_empty());
        assert_eq!(second.unchanged.len(), 1);
        assert!(second.issues.is_empty());
        assert_eq!(overlay, after_first);
    }

    #[test]
    fn last_write_in_stream_order_wins() {
        let base = MemoryTree::new();
        let mut overlay = OverlayStore::new();
        let batch = vec![
            spanned(write("a.ts", "first"), 0),
            spanned(write("a.ts", "second"), 10),
        ];
        apply_batch(&mut overlay, &base, &batch);
        assert_eq!(
            overlay.writes().get(&p("a.ts")).map(String::as_str),
            Some("second")
        );
    }

    #[test]
    fn rename_from_base_reads_base_content() {
        let base = MemoryTree::new().with_file(p("src/old.ts"), "export {}\n");
        let mut overlay = OverlayStore::new();

        let applied = apply_rename(&mut overlay, &base, &p("src/old.ts"), &p("src/new.ts"));

        assert_eq!(applied, Ok(Applied::Changed));
        assert_eq!(
            overlay.writes().get(&p("src/new.ts")).map(String::as_str),
            Some("export {}\n")
        );
        assert!(overlay.deleted_files().contains(&p("src/old.ts")));
        assert_eq!(overlay.renames().get(&p("src/old.ts")), Some(&p("src/new.ts")));
    }

    #[test]
    fn rename_moves_overlay_content() {
        let base = MemoryTree::new();
        let mut overlay = OverlayStore::new();
        apply_write(&mut overlay, &p("a.ts"), "draft");

        apply_rename(&mut overlay, &base, &p("a.ts"), &p("b.ts")).unwrap();

        assert!(!overlay.writes().contains_key(&p("a.ts")));
        assert!(!overlay.closed_writes().contains(&p("a.ts")));
        assert_eq!(overlay.writes().get(&p("b.ts")).map(String::as_str), Some("draft"));
    }

    #[test]
    fn rename_of_missing_source_fails_but_batch_continues() {
        let base = MemoryTree::new();
        let mut overlay = OverlayStore::new();
        let batch = vec![
            spanned(
                Directive::Rename {
                    from: p("ghost.ts"),
                    to: p("real.ts"),
                },
                0,
            ),
            spanned(write("other.ts", "ok"), 10),
        ];

        let report = apply_batch(&mut overlay, &base, &batch);

        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].kind, IssueKind::SourceNotFound);
        assert_eq!(report.applied.len(), 1);
        assert!(overlay.writes().contains_key(&p("other.ts")));
    }

    #[test]
    fn rename_of_deleted_base_file_is_not_found() {
        let base = MemoryTree::new().with_file(p("a.ts"), "a");
        let mut overlay = OverlayStore::new();
        apply_delete(&mut overlay, &p("a.ts"));
        assert_eq!(
            apply_rename(&mut overlay, &base, &p("a.ts"), &p("b.ts")),
            Err(ApplyError::SourceNotFound { from: p("a.ts") })
        );
    }

    #[test]
    fn rename_chains_collapse() {
        let base = MemoryTree::new().with_file(p("a.ts"), "a");
        let mut overlay = OverlayStore::new();
        apply_rename(&mut overlay, &base, &p("a.ts"), &p("b.ts")).unwrap();
        apply_rename(&mut overlay, &base, &p("b.ts"), &p("c.ts")).unwrap();

        assert_eq!(overlay.renames().len(), 1);
        assert_eq!(overlay.renames().get(&p("a.ts")), Some(&p("c.ts")));
        assert!(overlay.deletes().contains(&p("a.ts")));
        assert!(overlay.deletes().contains(&p("b.ts")));

        apply_rename(&mut overlay, &base, &p("c.ts"), &p("a.ts")).unwrap();
        assert!(overlay.renames().is_empty());
        assert!(!overlay.deletes().contains(&p("a.ts")));
    }

    #[test]
    fn dependencies_union_across_directives() {
        let base = MemoryTree::new();
        let mut overlay = OverlayStore::new();
        let first = Directive::AddDependency {
            packages: ["zod".to_string(), "clsx".to_string()].into(),
        };
        let second = Directive::AddDependency {
            packages: ["zod".to_string()].into(),
        };
        assert_eq!(apply_directive(&mut overlay, &base, &first), Ok(Applied::Changed));
        assert_eq!(
            apply_directive(&mut overlay, &base, &second),
            Ok(Applied::Unchanged)
        );
        assert_eq!(overlay.dependencies().len(), 2);
    }

    #[test]
    fn delete_of_overlay_only_file_clears_write() {
        let mut overlay = OverlayStore::new();
        apply_write(&mut overlay, &p("tmp.ts"), "x");
        assert_eq!(apply_delete(&mut overlay, &p("tmp.ts")), Applied::Changed);
        assert!(overlay.writes().is_empty());
        assert!(overlay.closed_writes().is_empty());
        assert_eq!(apply_delete(&mut overlay, &p("tmp.ts")), Applied::Unchanged);
    }
}
