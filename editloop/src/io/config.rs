//! Edit loop configuration stored under `.editloop/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use super::atomic::write_atomic;

/// Edit loop configuration (TOML).
///
/// Edited by humans; missing fields fall back to the defaults below.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct EditloopConfig {
    /// Repair cycles allowed per turn. The typechecker runs at most
    /// `max_attempts + 1` times.
    pub max_attempts: u32,

    /// Byte budget for rendered repair prompts.
    pub prompt_budget_bytes: usize,

    /// Problems listed in a repair digest before the remainder is summarized.
    pub digest_problem_limit: usize,

    pub typecheck: TypecheckConfig,
    pub generator: GeneratorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct TypecheckConfig {
    /// Command run inside the staged tree (e.g. `["npx","tsc","--noEmit"]`).
    pub command: Vec<String>,
    pub timeout_secs: u64,
    /// Truncate captured compiler output beyond this many bytes.
    pub output_limit_bytes: usize,
    /// Top-level directories never copied into the staged tree.
    pub skip_dirs: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Command that reads a prompt on stdin and streams a response on stdout.
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for TypecheckConfig {
    fn default() -> Self {
        Self {
            command: ["npx", "tsc", "--noEmit", "--pretty", "false"]
                .into_iter()
                .map(String::from)
                .collect(),
            timeout_secs: 120,
            output_limit_bytes: 1_000_000,
            skip_dirs: ["node_modules", ".git", ".editloop"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            command: vec!["codex".to_string(), "exec".to_string(), "-".to_string()],
            timeout_secs: 30 * 60,
        }
    }
}

impl Default for EditloopConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            prompt_budget_bytes: 20_000,
            digest_problem_limit: 25,
            typecheck: TypecheckConfig::default(),
            generator: GeneratorConfig::default(),
        }
    }
}

impl TypecheckConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl GeneratorConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl EditloopConfig {
    pub fn validate(&self) -> Result<()> {
        if self.prompt_budget_bytes < 1_000 {
            return Err(anyhow!("prompt_budget_bytes must be >= 1000"));
        }
        if self.digest_problem_limit == 0 {
            return Err(anyhow!("digest_problem_limit must be > 0"));
        }
        if self.typecheck.timeout_secs == 0 {
            return Err(anyhow!("typecheck.timeout_secs must be > 0"));
        }
        if self.typecheck.output_limit_bytes == 0 {
            return Err(anyhow!("typecheck.output_limit_bytes must be > 0"));
        }
        if self.generator.timeout_secs == 0 {
            return Err(anyhow!("generator.timeout_secs must be > 0"));
        }
        if !is_valid_command(&self.typecheck.command) {
            return Err(anyhow!("typecheck.command must be a non-empty array"));
        }
        if !is_valid_command(&self.generator.command) {
            return Err(anyhow!("generator.command must be a non-empty array"));
        }
        if let Some(dir) = self
            .typecheck
            .skip_dirs
            .iter()
            .find(|dir| dir.trim().is_empty() || dir.contains('/'))
        {
            return Err(anyhow!(
                "typecheck.skip_dirs entries must be top-level names, got {dir:?}"
            ));
        }
        Ok(())
    }
}

fn is_valid_command(command: &[String]) -> bool {
    command.first().is_some_and(|program| !program.trim().is_empty())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EditloopConfig::default()`.
pub fn load_config(path: &Path) -> Result<EditloopConfig> {
    if !path.exists() {
        let cfg = EditloopConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EditloopConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EditloopConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}
