//! Headless agent CLI backend.
//!
//! Runs the configured agent binary in non-interactive mode (`-p`) with JSON
//! output, one process per call. Workers request follow-up subtasks by
//! printing `spawn_worker {json}` lines; those are registered through the
//! worker's [`SpawnHandle`] before the worker result is returned.

use crate::error::{Error, Result};
use crate::orchestration::backend::{AgentBackend, AggregateRequest, PlanRequest, WorkerRequest};
use crate::orchestration::registry::SpawnHandle;
use crate::orchestration::usage::{CallKind, Usage};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, trace, warn};

/// Default timeout for one agent process (10 minutes).
pub const DEFAULT_TIMEOUT_SECS: u64 = 600;

/// Line prefix a worker uses to request a follow-up subtask.
pub const SPAWN_PREFIX: &str = "spawn_worker";

/// Final state reported by the agent process.
#[derive(Debug, Clone, PartialEq)]
pub enum ResultType {
    Success { output: String },
    Error { message: String },
}

/// Parsed response of one headless run.
#[derive(Debug, Clone)]
pub struct HeadlessResponse {
    pub result: ResultType,
    pub cost_usd: Option<f64>,
    pub num_turns: Option<u32>,
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
}

impl HeadlessResponse {
    fn error(message: String) -> Self {
        Self {
            result: ResultType::Error { message },
            cost_usd: None,
            num_turns: None,
            input_tokens: None,
            output_tokens: None,
        }
    }

    /// What this call consumed; unreported fields count as zero.
    pub fn usage(&self) -> Usage {
        Usage::call(
            self.input_tokens.unwrap_or(0),
            self.output_tokens.unwrap_or(0),
            self.cost_usd.unwrap_or(0.0),
            self.num_turns.map(u64::from).unwrap_or(0),
        )
    }

    /// Convert into the output text, turning agent-side errors into
    /// [`Error::Backend`].
    pub fn into_output(self) -> Result<String> {
        match self.result {
            ResultType::Success { output } => Ok(output),
            ResultType::Error { message } => Err(Error::Backend(message)),
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    subtype: Option<String>,
    result: Option<String>,
    total_cost_usd: Option<f64>,
    num_turns: Option<u32>,
    #[serde(default)]
    is_error: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    usage: Option<RawUsage>,
}

#[derive(Debug, Default, Deserialize)]
struct RawUsage {
    #[serde(default)]
    input_tokens: u64,
    #[serde(default)]
    output_tokens: u64,
}

/// A follow-up subtask requested in worker output.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SpawnRequest {
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub context: Option<String>,
}

/// Headless agent CLI backend.
#[derive(Debug, Clone)]
pub struct HeadlessBackend {
    binary: PathBuf,
    /// Extra arguments from the configured command line.
    base_args: Vec<String>,
    timeout: Duration,
}

impl HeadlessBackend {
    /// Create a backend from a command line such as
    /// `claude --dangerously-skip-permissions`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::BinaryNotFound`] if the program is not on `PATH`.
    pub fn new(command: &str) -> Result<Self> {
        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| Error::Validation("empty agent command".to_string()))?;
        let binary =
            which::which(program).map_err(|_| Error::BinaryNotFound(program.to_string()))?;
        Ok(Self {
            binary,
            base_args: parts.map(str::to_string).collect(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        })
    }

    /// Create a backend with a specific binary path.
    pub fn with_binary(binary: PathBuf) -> Self {
        Self {
            binary,
            base_args: Vec::new(),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    /// Arguments passed for one call, excluding the binary itself.
    pub fn args_for(
        &self,
        system: &str,
        prompt: &str,
        model: &str,
        max_turns: Option<u32>,
    ) -> Vec<String> {
        let mut args = self.base_args.clone();
        args.extend([
            "-p".to_string(),
            prompt.to_string(),
            "--output-format".to_string(),
            "json".to_string(),
            "--model".to_string(),
            model.to_string(),
        ]);
        if !system.is_empty() {
            args.push("--append-system-prompt".to_string());
            args.push(system.to_string());
        }
        if let Some(turns) = max_turns {
            args.push("--max-turns".to_string());
            args.push(turns.to_string());
        }
        args
    }

    /// Run one headless call in `cwd`.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned or times out. A
    /// process that runs but reports failure yields a response with
    /// [`ResultType::Error`].
    pub async fn run(
        &self,
        system: &str,
        prompt: &str,
        model: &str,
        max_turns: Option<u32>,
        cwd: &Path,
    ) -> Result<HeadlessResponse> {
        let args = self.args_for(system, prompt, model, max_turns);
        debug!(binary = %self.binary.display(), model, "running headless agent");

        let output = tokio::time::timeout(
            self.timeout,
            Command::new(&self.binary)
                .args(&args)
                .current_dir(cwd)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| Error::Timeout(self.timeout))?
        .map_err(Error::Io)?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        trace!(stdout = %stdout, "headless agent output");

        if let Ok(response) = Self::parse_json_response(&stdout) {
            debug!(
                cost_usd = ?response.cost_usd,
                turns = ?response.num_turns,
                "headless agent finished"
            );
            return Ok(response);
        }

        if !output.status.success() {
            let message = if stderr.trim().is_empty() {
                format!(
                    "agent exited with code {}",
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr.trim().to_string()
            };
            return Ok(HeadlessResponse::error(message));
        }

        Ok(HeadlessResponse {
            result: ResultType::Success {
                output: stdout.trim().to_string(),
            },
            cost_usd: None,
            num_turns: None,
            input_tokens: None,
            output_tokens: None,
        })
    }

    /// Parse the JSON document printed by `--output-format json`.
    pub fn parse_json_response(json_str: &str) -> Result<HeadlessResponse> {
        let raw: RawResponse = serde_json::from_str(json_str.trim())?;

        let failed = raw.is_error || raw.subtype.as_deref().is_some_and(|s| s.starts_with("error"));
        let result = if failed {
            ResultType::Error {
                message: raw
                    .error
                    .or(raw.result)
                    .unwrap_or_else(|| raw.subtype.unwrap_or_else(|| "unknown error".to_string())),
            }
        } else if let Some(output) = raw.result {
            ResultType::Success { output }
        } else if let Some(message) = raw.error {
            ResultType::Error { message }
        } else {
            ResultType::Error {
                message: "Unknown response format".to_string(),
            }
        };

        Ok(HeadlessResponse {
            result,
            cost_usd: raw.total_cost_usd,
            num_turns: raw.num_turns,
            input_tokens: raw.usage.as_ref().map(|u| u.input_tokens),
            output_tokens: raw.usage.as_ref().map(|u| u.output_tokens),
        })
    }
}

/// Extract `spawn_worker {json}` requests from worker output.
///
/// Returns the requests and the output with those lines removed. Malformed
/// request lines are kept in the output and logged.
pub fn extract_spawn_requests(output: &str) -> (Vec<SpawnRequest>, String) {
    let mut requests = Vec::new();
    let mut kept = Vec::new();
    for line in output.lines() {
        let trimmed = line.trim();
        let Some(payload) = trimmed.strip_prefix(SPAWN_PREFIX) else {
            kept.push(line);
            continue;
        };
        match serde_json::from_str::<SpawnRequest>(payload.trim()) {
            Ok(request) => requests.push(request),
            Err(e) => {
                warn!(error = %e, "ignoring malformed spawn request");
                kept.push(line);
            }
        }
    }
    (requests, kept.join("\n"))
}

#[async_trait]
impl AgentBackend for HeadlessBackend {
    async fn plan(&self, request: &PlanRequest) -> Result<String> {
        let response = self
            .run(
                &request.system,
                &request.prompt,
                &request.model,
                Some(1),
                &request.workdir,
            )
            .await?;
        request.usage.record(CallKind::Plan, response.usage());
        response.into_output()
    }

    async fn execute(&self, request: WorkerRequest, spawn: SpawnHandle) -> Result<String> {
        let response = self
            .run(
                &request.system,
                &request.prompt,
                &request.model,
                Some(request.max_iterations),
                &request.workdir,
            )
            .await?;
        request.usage.record(CallKind::Worker, response.usage());
        let output = response.into_output()?;

        let (spawns, mut text) = extract_spawn_requests(&output);
        for spawned in spawns {
            let ack = spawn.spawn_worker(
                &spawned.title,
                &spawned.description,
                spawned.context.as_deref(),
            );
            text.push('\n');
            text.push_str(&ack);
        }
        Ok(text)
    }

    async fn aggregate(&self, request: &AggregateRequest) -> Result<String> {
        let response = self
            .run(
                &request.system,
                &request.prompt,
                &request.model,
                Some(1),
                &request.workdir,
            )
            .await?;
        request.usage.record(CallKind::Aggregate, response.usage());
        response.into_output()
    }
}
