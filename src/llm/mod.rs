//! LLM Gateway — single invocation surface for the external model
//! process. Normalizes its multi-shaped output (bare value, `{"result":
//! "..."}` envelope, fenced code block) before handing text back to callers.
//! Never surfaces a parse failure as an error: callers degrade instead.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

/// Output format requested from the external model process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Json,
    Text,
    StreamJson,
}

impl OutputFormat {
    fn as_flag(self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::Text => "text",
            OutputFormat::StreamJson => "stream-json",
        }
    }
}

/// Result of a single gateway invocation.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub ok: bool,
    pub output: String,
    pub error: Option<String>,
}

/// Outcome of running an external process, independent of what it was.
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Pluggable process runner. Production shells out to the real binary;
/// tests inject canned responses (no subprocess, no flakiness).
#[async_trait]
pub trait ProcessRunner: Send + Sync {
    async fn run(&self, args: &[String]) -> anyhow::Result<ProcessOutput>;
}

/// Shells out to the configured model binary via `tokio::process::Command`.
pub struct SubprocessRunner {
    pub bin: String,
}

impl SubprocessRunner {
    pub fn new(bin: impl Into<String>) -> Self {
        Self { bin: bin.into() }
    }
}

#[async_trait]
impl ProcessRunner for SubprocessRunner {
    async fn run(&self, args: &[String]) -> anyhow::Result<ProcessOutput> {
        let output = Command::new(&self.bin).args(args).output().await?;
        Ok(ProcessOutput {
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// The envelope shape the model process may wrap its real payload in.
#[derive(Debug, Deserialize, Serialize)]
struct Envelope {
    result: String,
}

pub struct LlmGateway {
    runner: Box<dyn ProcessRunner>,
}

impl LlmGateway {
    pub fn new(runner: Box<dyn ProcessRunner>) -> Self {
        Self { runner }
    }

    pub fn subprocess(bin: impl Into<String>) -> Self {
        Self::new(Box::new(SubprocessRunner::new(bin)))
    }

    /// Cheap liveness probe.
    pub async fn available(&self) -> bool {
        match self.runner.run(&["--version".to_string()]).await {
            Ok(out) => out.exit_code == 0,
            Err(e) => {
                debug!("llm gateway availability probe failed: {e}");
                false
            }
        }
    }

    /// Invoke the model process and return its normalized stdout, or an
    /// error description. Never panics on malformed output at this layer —
    /// that only matters for `run_json`.
    pub async fn run(&self, prompt: &str, format: OutputFormat) -> RunOutcome {
        let args = vec![
            "-p".to_string(),
            prompt.to_string(),
            "--output-format".to_string(),
            format.as_flag().to_string(),
        ];

        match self.runner.run(&args).await {
            Ok(out) if out.exit_code == 0 => RunOutcome {
                ok: true,
                output: out.stdout,
                error: None,
            },
            Ok(out) => RunOutcome {
                ok: false,
                output: String::new(),
                error: Some(if out.stderr.is_empty() {
                    format!("model process exited with code {}", out.exit_code)
                } else {
                    out.stderr
                }),
            },
            Err(e) => RunOutcome {
                ok: false,
                output: String::new(),
                error: Some(e.to_string()),
            },
        }
    }

    /// Invoke in JSON mode, normalize, and parse into `T`. `None` on any
    /// failure along the chain (process failure, envelope unwrap, parse) —
    /// per contract this never throws to the caller.
    pub async fn run_json<T: DeserializeOwned>(&self, prompt: &str) -> Option<T> {
        let outcome = self.run(prompt, OutputFormat::Json).await;
        if !outcome.ok {
            warn!("llm gateway run_json: process failed: {:?}", outcome.error);
            return None;
        }
        normalize_and_parse(&outcome.output)
    }
}

/// Strip a fenced code block (with optional language tag) from raw model
/// text, if one wraps the whole response.
pub fn strip_fences(text: &str) -> &str {
    let trimmed = text.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let rest = rest.trim_start_matches(|c: char| c.is_alphanumeric());
        let rest = rest.trim_start_matches('\n');
        if let Some(end) = rest.rfind("```") {
            return rest[..end].trim();
        }
        return rest.trim();
    }
    trimmed
}

/// Unwrap a `{"result": "<payload>"}` envelope if the text parses as one;
/// otherwise return the text unchanged.
pub fn unwrap_envelope(text: &str) -> String {
    match serde_json::from_str::<Envelope>(text) {
        Ok(env) => env.result,
        Err(_) => text.to_string(),
    }
}

/// Full normalization chain: strip fences, unwrap envelope, strip fences
/// again (the inner payload may itself be fenced), then parse as `T`.
pub fn normalize_and_parse<T: DeserializeOwned>(raw: &str) -> Option<T> {
    let stage1 = strip_fences(raw);
    let stage2 = unwrap_envelope(stage1);
    let stage3 = strip_fences(&stage2);
    serde_json::from_str(stage3).ok()
}
