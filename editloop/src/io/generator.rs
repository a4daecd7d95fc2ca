//! Generating collaborator: turns a prompt into a stream of text chunks.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tracing::{debug, error, instrument, warn};

use super::config::GeneratorConfig;
use super::process::read_stream_limited;

/// Ordered text chunks from one generation. An `Err` item ends the stream.
pub type ChunkStream = BoxStream<'static, Result<String>>;

#[async_trait]
pub trait Generator: Send + Sync {
    /// Start generating a response to `prompt`.
    async fn generate(&self, prompt: &str) -> Result<ChunkStream>;
}

/// Runs an external agent command, writing the prompt to stdin and streaming stdout.
#[derive(Debug, Clone)]
pub struct CommandGenerator {
    command: Vec<String>,
    timeout: Duration,
    cwd: Option<std::path::PathBuf>,
}

const STDERR_LIMIT_BYTES: usize = 64 * 1024;

impl CommandGenerator {
    pub fn new(config: &GeneratorConfig) -> Self {
        Self {
            command: config.command.clone(),
            timeout: config.timeout(),
            cwd: None,
        }
    }

    pub fn with_cwd(mut self, cwd: impl Into<std::path::PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

#[async_trait]
impl Generator for CommandGenerator {
    #[instrument(skip_all, fields(prompt_bytes = prompt.len()))]
    async fn generate(&self, prompt: &str) -> Result<ChunkStream> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| anyhow!("generator command is empty"))?;
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }

        let mut child = match cmd.spawn() {
            Ok(c) => c,
            Err(e) => {
                error!(err = %e, "failed to spawn generator");
                return Err(e).with_context(|| format!("spawn generator {program}"));
            }
        };

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("stdin was not piped"))?;
        let input = prompt.as_bytes().to_vec();
        tokio::spawn(async move {
            if let Err(e) = stdin.write_all(&input).await {
                debug!(err = %e, "generator closed stdin early");
            }
        });

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;
        let stderr_handle = tokio::spawn(read_stream_limited(stderr, STDERR_LIMIT_BYTES));

        let timeout = self.timeout;
        let deadline = tokio::time::Instant::now() + timeout;
        let stream = async_stream::try_stream! {
            let mut decoder = Utf8Decoder::default();
            let mut buf = [0u8; 8192];
            loop {
                let n = tokio::time::timeout_at(deadline, stdout.read(&mut buf))
                    .await
                    .map_err(|_| {
                        warn!(timeout_secs = timeout.as_secs(), "generator timed out");
                        anyhow!("generator timed out after {}s", timeout.as_secs())
                    })?
                    .context("read generator stdout")?;
                if n == 0 {
                    break;
                }
                let text = decoder.decode(&buf[..n]);
                if !text.is_empty() {
                    yield text;
                }
            }
            let tail = decoder.finish();
            if !tail.is_empty() {
                yield tail;
            }

            let status = tokio::time::timeout_at(deadline, child.wait())
                .await
                .map_err(|_| anyhow!("generator timed out after {}s", timeout.as_secs()))?
                .context("wait for generator")?;
            if !status.success() {
                let stderr = match stderr_handle.await {
                    Ok(Ok((bytes, _))) => String::from_utf8_lossy(&bytes).trim().to_string(),
                    _ => String::new(),
                };
                Err::<(), _>(anyhow!("generator exited with {status}: {stderr}"))?;
            }
            debug!("generator finished");
        };
        Ok(stream.boxed())
    }
}

/// Incremental UTF-8 decoding that never splits a multi-byte character.
#[derive(Debug, Default)]
pub(crate) struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub(crate) fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    return out;
                }
                Err(err) => {
                    let valid = err.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match err.error_len() {
                        // Incomplete trailing sequence: wait for more bytes.
                        None => {
                            self.pending.drain(..valid);
                            return out;
                        }
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + len);
                        }
                    }
                }
            }
        }
    }

    pub(crate) fn finish(self) -> String {
        String::from_utf8_lossy(&self.pending).into_owned()
    }
}
