//! Scripted collaborators and fixtures for controller tests.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::core::error::TypecheckError;
use crate::core::path::normalize;
use crate::core::problem::Problem;
use crate::io::generator::{ChunkStream, Generator};
use crate::io::typecheck::{TypecheckRequest, Typechecker};

/// One scripted generation.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Stream these chunks, then end.
    Chunks(Vec<String>),
    /// Stream these chunks, then never end (until cancelled).
    ChunksThenHang(Vec<String>),
    /// Stream these chunks, then fail.
    ChunksThenError(Vec<String>, String),
    /// Fail before producing a stream.
    SpawnError(String),
}

impl ScriptedReply {
    pub fn chunks<I, S>(chunks: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ScriptedReply::Chunks(chunks.into_iter().map(Into::into).collect())
    }
}

/// Generator that replays scripted replies in order and records prompts.
///
/// Once the script runs out, the last reply repeats.
#[derive(Debug, Clone, Default)]
pub struct ScriptedGenerator {
    replies: Arc<Mutex<VecDeque<ScriptedReply>>>,
    last: Arc<Mutex<Option<ScriptedReply>>>,
    prompts: Arc<Mutex<Vec<String>>>,
}

impl ScriptedGenerator {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Arc::new(Mutex::new(replies.into())),
            ..Self::default()
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().expect("prompts lock").clone()
    }

    pub fn calls(&self) -> usize {
        self.prompts.lock().expect("prompts lock").len()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, prompt: &str) -> Result<ChunkStream> {
        self.prompts
            .lock()
            .expect("prompts lock")
            .push(prompt.to_string());
        let next = self.replies.lock().expect("replies lock").pop_front();
        let reply = match next {
            Some(reply) => {
                *self.last.lock().expect("last lock") = Some(reply.clone());
                reply
            }
            None => self
                .last
                .lock()
                .expect("last lock")
                .clone()
                .ok_or_else(|| anyhow!("scripted generator has no replies"))?,
        };
        let ok = |chunks: Vec<String>| stream::iter(chunks.into_iter().map(Ok));
        Ok(match reply {
            ScriptedReply::Chunks(chunks) => ok(chunks).boxed(),
            ScriptedReply::ChunksThenHang(chunks) => ok(chunks).chain(stream::pending()).boxed(),
            ScriptedReply::ChunksThenError(chunks, message) => ok(chunks)
                .chain(stream::once(async move { Err(anyhow!(message)) }))
                .boxed(),
            ScriptedReply::SpawnError(message) => return Err(anyhow!(message)),
        })
    }
}

/// Typechecker that replays scripted results and records every request.
///
/// Once the script runs out, the last result repeats.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTypechecker {
    results: Arc<Mutex<VecDeque<Result<Vec<Problem>, TypecheckError>>>>,
    last: Arc<Mutex<Option<Result<Vec<Problem>, TypecheckError>>>>,
    requests: Arc<Mutex<Vec<TypecheckRequest>>>,
}

impl ScriptedTypechecker {
    pub fn new(results: Vec<Result<Vec<Problem>, TypecheckError>>) -> Self {
        Self {
            results: Arc::new(Mutex::new(results.into())),
            ..Self::default()
        }
    }

    /// Always report no problems.
    pub fn clean() -> Self {
        Self::new(vec![Ok(Vec::new())])
    }

    /// Always report the same problems.
    pub fn always(problems: Vec<Problem>) -> Self {
        Self::new(vec![Ok(problems)])
    }

    pub fn calls(&self) -> usize {
        self.requests.lock().expect("requests lock").len()
    }

    pub fn requests(&self) -> Vec<TypecheckRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

#[async_trait]
impl Typechecker for ScriptedTypechecker {
    async fn check(&self, request: &TypecheckRequest) -> Result<Vec<Problem>, TypecheckError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let next = self.results.lock().expect("results lock").pop_front();
        match next {
            Some(result) => {
                *self.last.lock().expect("last lock") = Some(result.clone());
                result
            }
            None => self
                .last
                .lock()
                .expect("last lock")
                .clone()
                .unwrap_or_else(|| Ok(Vec::new())),
        }
    }
}

/// A problem at `file:line:column` with a fixed code.
pub fn problem(file: &str, line: u32, column: u32, message: &str) -> Problem {
    Problem {
        file: normalize(file).expect("valid test path"),
        line,
        column,
        message: message.to_string(),
        code: 2322,
        snippet: None,
    }
}

/// `<edit-write>` tag with a fenced body.
pub fn fenced_write(path: &str, content: &str) -> String {
    format!("<edit-write path=\"{path}\">\n```tsx\n{content}```\n</edit-write>\n")
}

/// `<edit-write>` tag with a bare body.
pub fn write_tag(path: &str, content: &str) -> String {
    format!("<edit-write path=\"{path}\">\n{content}</edit-write>\n")
}
