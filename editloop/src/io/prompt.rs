//! Prompt builder for the generating collaborator.
//!
//! Templates are minijinja markdown split into sections by
//! `<!-- section:KEY required|droppable -->` markers. When the rendered prompt
//! exceeds the byte budget, droppable sections go first and the last section is
//! truncated as a final resort.

use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use regex::Regex;
use tracing::debug;

use crate::core::overlay::OverlayStore;

const CONTRACT_TEMPLATE: &str = include_str!("prompts/contract.md");
const TURN_TEMPLATE: &str = include_str!("prompts/turn.md");
const REPAIR_TEMPLATE: &str = include_str!("prompts/repair.md");

/// Drop order for droppable repair sections.
const DROP_ORDER: [&str; 2] = ["files", "request"];

struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("contract", CONTRACT_TEMPLATE)
            .expect("contract template should be valid");
        env.add_template("turn", TURN_TEMPLATE)
            .expect("turn template should be valid");
        env.add_template("repair", REPAIR_TEMPLATE)
            .expect("repair template should be valid");
        Self { env }
    }
}

static ENGINE: LazyLock<PromptEngine> = LazyLock::new(PromptEngine::new);

#[derive(Debug, Clone)]
struct ParsedSection {
    key: String,
    required: bool,
    content: String,
}

fn parse_sections(rendered: &str) -> Vec<ParsedSection> {
    static SECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"<!--\s*section:(\w+)\s+(required|droppable)\s*-->").unwrap()
    });

    let markers: Vec<_> = SECTION_RE
        .captures_iter(rendered)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            Some((
                caps.get(1)?.as_str().to_string(),
                caps.get(2)?.as_str() == "required",
                whole.start(),
                whole.end(),
            ))
        })
        .collect();

    let mut sections = Vec::new();
    for (i, (key, required, _, body_start)) in markers.iter().enumerate() {
        let end = markers
            .get(i + 1)
            .map(|(_, _, start, _)| *start)
            .unwrap_or(rendered.len());
        let content = rendered[*body_start..end].trim().to_string();
        if !content.is_empty() || *required {
            sections.push(ParsedSection {
                key: key.clone(),
                required: *required,
                content,
            });
        }
    }
    sections
}

fn total_len(sections: &[ParsedSection]) -> usize {
    sections.iter().map(|s| s.content.len()).sum()
}

fn apply_budget_to_sections(sections: &mut Vec<ParsedSection>, budget: usize) {
    for key in DROP_ORDER {
        if total_len(sections) <= budget {
            return;
        }
        if let Some(idx) = sections.iter().position(|s| s.key == key && !s.required) {
            debug!(
                section = key,
                bytes_dropped = sections[idx].content.len(),
                "dropped section for budget"
            );
            sections.remove(idx);
        }
    }

    if total_len(sections) <= budget {
        return;
    }
    let Some((last, rest)) = sections.split_last_mut() else {
        return;
    };
    let allowed = budget.saturating_sub(total_len(rest));
    let before_len = last.content.len();
    const MARKER: &str = "\n[truncated]";
    let keep = if allowed > MARKER.len() {
        allowed - MARKER.len()
    } else {
        allowed
    };
    last.content.truncate(floor_char_boundary(&last.content, keep));
    if allowed > MARKER.len() {
        last.content.push_str(MARKER);
    }
    debug!(
        section = last.key,
        before_len,
        after_len = last.content.len(),
        "truncated section for budget"
    );
}

fn floor_char_boundary(text: &str, index: usize) -> usize {
    let mut index = index.min(text.len());
    while !text.is_char_boundary(index) {
        index -= 1;
    }
    index
}

fn render_sections(sections: &[ParsedSection]) -> String {
    sections
        .iter()
        .map(|s| s.content.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}

/// Inputs for a repair prompt.
#[derive(Debug, Clone)]
pub struct RepairInputs<'a> {
    /// Rendered diagnostic digest.
    pub digest: &'a str,
    /// Repair cycle this prompt starts, counting from 1.
    pub attempt: u32,
    pub max_attempts: u32,
    /// The request that started the turn.
    pub request: &'a str,
    pub overlay: &'a OverlayStore,
}

/// Builds generator prompts within a byte budget.
#[derive(Debug, Clone)]
pub struct PromptBuilder {
    budget_bytes: usize,
}

impl PromptBuilder {
    pub fn new(budget_bytes: usize) -> Self {
        Self { budget_bytes }
    }

    /// First prompt of a turn: the edit contract plus the user's request.
    pub fn build_turn(&self, request: &str) -> Result<String> {
        let rendered = ENGINE
            .env
            .get_template("turn")?
            .render(context! { request => request.trim() })
            .context("render turn prompt")?;
        Ok(self.fit(&rendered))
    }

    /// Follow-up prompt feeding typecheck problems back to the generator.
    pub fn build_repair(&self, input: &RepairInputs<'_>) -> Result<String> {
        let files: Vec<String> = input
            .overlay
            .writes()
            .keys()
            .map(|path| format!("write {path}"))
            .chain(
                input
                    .overlay
                    .deletes()
                    .iter()
                    .map(|path| format!("delete {path}")),
            )
            .collect();
        let request = input.request.trim();
        let rendered = ENGINE
            .env
            .get_template("repair")?
            .render(context! {
                digest => input.digest.trim_end(),
                attempt => input.attempt,
                max_attempts => input.max_attempts,
                files => files,
                request => (!request.is_empty()).then_some(request),
            })
            .context("render repair prompt")?;
        Ok(self.fit(&rendered))
    }

    fn fit(&self, rendered: &str) -> String {
        let mut sections = parse_sections(rendered);
        apply_budget_to_sections(&mut sections, self.budget_bytes);
        render_sections(&sections)
    }
}
