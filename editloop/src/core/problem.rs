//! Typechecker problems and the repair digest rendered from them.

use serde::{Deserialize, Serialize};

use crate::core::path::ProjectPath;

/// One compiler diagnostic.
///
/// Field order defines the derived ordering: `(file, line, column)` first, so
/// sorted problem lists report deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Problem {
    pub file: ProjectPath,
    pub line: u32,
    pub column: u32,
    pub message: String,
    pub code: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snippet: Option<String>,
}

impl Problem {
    /// `path:line:col - message (code)`.
    pub fn headline(&self) -> String {
        format!(
            "{}:{}:{} - {} ({})",
            self.file, self.line, self.column, self.message, self.code
        )
    }
}

/// Sort by `(file, line, column)` and drop exact duplicates.
pub fn sort_problems(problems: &mut Vec<Problem>) {
    problems.sort();
    problems.dedup();
}

/// Fill missing snippets with the offending source line, looked up by `source`.
pub fn attach_snippets<F>(problems: &mut [Problem], mut source: F)
where
    F: FnMut(&ProjectPath) -> Option<String>,
{
    for problem in problems.iter_mut().filter(|p| p.snippet.is_none()) {
        let Some(text) = source(&problem.file) else {
            continue;
        };
        let index = problem.line.saturating_sub(1) as usize;
        problem.snippet = text
            .lines()
            .nth(index)
            .map(|line| line.trim_end().to_string())
            .filter(|line| !line.trim().is_empty());
    }
}

/// Render the concise diagnostic digest fed back to the generating agent.
///
/// At most `limit` problems are listed; the remainder is summarized in one line.
pub fn render_digest(problems: &[Problem], limit: usize) -> String {
    let mut out = String::new();
    for problem in problems.iter().take(limit) {
        out.push_str(&problem.headline());
        out.push('\n');
        if let Some(snippet) = &problem.snippet {
            out.push_str("    ");
            out.push_str(snippet.trim());
            out.push('\n');
        }
    }
    if problems.len() > limit {
        out.push_str(&format!("... and {} more\n", problems.len() - limit));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::path::normalize;

    fn problem(file: &str, line: u32, column: u32, code: u32) -> Problem {
        Problem {
            file: normalize(file).unwrap(),
            line,
            column,
            message: format!("error {code}"),
            code,
            snippet: None,
        }
    }

    #[test]
    fn problems_sort_by_file_line_column() {
        let mut problems = vec![
            problem("b.ts", 1, 1, 1),
            problem("a.ts", 9, 2, 2),
            problem("a.ts", 3, 7, 3),
            problem("a.ts", 3, 7, 3),
        ];
        sort_problems(&mut problems);
        let keys: Vec<(String, u32)> = problems
            .iter()
            .map(|p| (p.file.to_string(), p.line))
            .collect();
        assert_eq!(
            keys,
            vec![
                ("a.ts".to_string(), 3),
                ("a.ts".to_string(), 9),
                ("b.ts".to_string(), 1)
            ]
        );
    }

    #[test]
    fn digest_renders_headline_and_snippet() {
        let mut problems = vec![problem("app/page.tsx", 2, 5, 2322)];
        attach_snippets(&mut problems, |_| {
            Some("line one\n    const x: number = 'a';\n".to_string())
        });
        let digest = render_digest(&problems, 10);
        assert_eq!(
            digest,
            "app/page.tsx:2:5 - error 2322 (2322)\n    const x: number = 'a';\n"
        );
    }

    #[test]
    fn digest_truncates_long_lists() {
        let problems: Vec<Problem> = (1..=5).map(|i| problem("a.ts", i, 1, i)).collect();
        let digest = render_digest(&problems, 2);
        assert_eq!(digest.lines().count(), 3);
        assert!(digest.ends_with("... and 3 more\n"));
    }
}
