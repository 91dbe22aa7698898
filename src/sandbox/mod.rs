//! Sandboxed Executor
//!
//! Runs user-supplied code under a hard deadline and resource ceilings and
//! reports a normalized [`ExecutionResult`]. Two failure channels are kept apart:
//!
//! - `Err(SandboxError)`: the invocation itself failed (setup, timeout, cancellation)
//! - `Ok(ExecutionResult { success: false, .. })`: the code ran, or was statically
//!   rejected, and reports an application-level failure
//!
//! Lua runs in-process on a blocking thread with a restricted standard library.
//! Python, JavaScript and shell run as subprocesses in their own process group
//! with rlimits applied before `exec` and a per-invocation temp directory.

pub mod lua;
pub mod policy;
pub mod process;

use crate::config::{duration_ms, SandboxConfig};
use crate::error::SandboxError;
use crate::workflow::types::ValueMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

/// Languages the sandbox can run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Language {
    Lua,
    Python,
    JavaScript,
    Shell,
}

impl Language {
    pub fn as_str(self) -> &'static str {
        match self {
            Language::Lua => "lua",
            Language::Python => "python",
            Language::JavaScript => "javascript",
            Language::Shell => "shell",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "lua" => Ok(Language::Lua),
            "python" | "python3" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" => Ok(Language::JavaScript),
            "shell" | "sh" | "bash" => Ok(Language::Shell),
            other => Err(SandboxError::UnsupportedLanguage(other.to_string())),
        }
    }
}

/// Cancellation and deadline of the caller
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    pub cancel: CancellationToken,
    pub deadline: Option<Instant>,
}

/// Normalized outcome of a sandboxed run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub data: Value,
    pub error: Option<String>,
    #[serde(rename = "exec_time_ms", with = "duration_ms")]
    pub exec_time: Duration,
    pub resource_usage: ResourceUsage,
}

impl ExecutionResult {
    pub(crate) fn failure(error: impl Into<String>, exec_time: Duration, usage: ResourceUsage) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(error.into()),
            exec_time,
            resource_usage: usage,
        }
    }
}

/// Limits in force and what the run consumed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    pub memory_limit_bytes: u64,
    pub cpu_limit_secs: u64,
    /// Reported for in-process runtimes only
    pub peak_memory_bytes: Option<u64>,
    pub stdout_bytes: usize,
    pub stderr_bytes: usize,
    pub exit_code: Option<i32>,
}

/// The sandboxed executor. Cheap to share; holds only configuration.
#[derive(Debug, Clone)]
pub struct Sandbox {
    config: SandboxConfig,
}

impl Sandbox {
    pub fn new(config: SandboxConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    #[instrument(name = "sandbox_execute", skip(self, call, code, inputs), fields(language = %language))]
    pub async fn execute(
        &self,
        call: &CallContext,
        code: &str,
        language: Language,
        inputs: &ValueMap,
    ) -> Result<ExecutionResult, SandboxError> {
        let started = Instant::now();
        let usage = ResourceUsage {
            memory_limit_bytes: self.config.max_memory_bytes,
            cpu_limit_secs: self.config.max_cpu_secs,
            ..ResourceUsage::default()
        };

        if let Some(pattern) = policy::find_forbidden(code, language) {
            warn!(pattern, "🚨 Rejected sandboxed code");
            return Ok(ExecutionResult::failure(
                format!("code contains forbidden pattern '{pattern}'"),
                started.elapsed(),
                usage,
            ));
        }
        if call.cancel.is_cancelled() {
            return Err(SandboxError::Cancelled);
        }

        let own_deadline = started + self.config.timeout;
        let deadline = match call.deadline {
            Some(caller) => caller.min(own_deadline),
            None => own_deadline,
        };
        let budget = deadline.saturating_duration_since(started);

        let outcome = match language {
            Language::Lua => lua::run(&self.config, code, inputs, &call.cancel, deadline, usage).await,
            _ => process::run(&self.config, language, code, inputs, &call.cancel, deadline, usage).await,
        };

        match &outcome {
            Ok(result) => debug!(
                success = result.success,
                elapsed_ms = result.exec_time.as_millis() as u64,
                "sandboxed run finished"
            ),
            Err(SandboxError::Timeout(_)) => warn!(budget_ms = budget.as_millis() as u64, "⏰ Sandboxed run timed out"),
            Err(e) => warn!(error = %e, "❌ Sandboxed run failed"),
        }
        outcome.map_err(|e| match e {
            SandboxError::Timeout(_) => SandboxError::Timeout(budget),
            other => other,
        })
    }
}
