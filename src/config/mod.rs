//! Configuration management for the Citadel execution core
//!
//! Holds the engine-wide limits and middleware defaults. `Default` reads
//! `CITADEL_*` environment variables so containerized deployments can tune the
//! engine without a config file; a JSON file loaded with [`EngineConfig::from_file`]
//! is layered over those defaults.

use crate::resilience::{BreakerConfig, RetryPolicy};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Main engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Upper bound on node invocations running at once inside one execution
    pub max_concurrent_nodes: usize,
    /// Wall-clock budget for a whole execution unless the workflow sets `timeout_ms`
    #[serde(rename = "workflow_timeout_ms", with = "duration_ms")]
    pub workflow_timeout: Duration,
    /// How long an interrupted execution waits for in-flight nodes to wind down
    #[serde(rename = "cancel_grace_ms", with = "duration_ms")]
    pub cancel_grace: Duration,
    /// Finished executions a runner keeps queryable; older ones are forgotten
    pub retained_executions: usize,
    /// Retry policy applied to nodes that don't declare their own
    pub retry: RetryPolicy,
    /// Settings for breakers created on demand by the breaker registry
    pub breaker: BreakerConfig,
    /// Sandboxed executor limits
    pub sandbox: SandboxConfig,
}

/// Resource ceilings and runtimes for the sandboxed executor
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Hard wall-clock limit per invocation, further narrowed by the caller's deadline
    #[serde(rename = "timeout_ms", with = "duration_ms")]
    pub timeout: Duration,
    /// Memory ceiling: RLIMIT_AS for python and shell, RLIMIT_DATA plus a V8
    /// heap cap for node, allocator limit for Lua
    pub max_memory_bytes: u64,
    /// RLIMIT_CPU for subprocesses
    pub max_cpu_secs: u64,
    /// RLIMIT_NOFILE for subprocesses
    pub max_open_files: u64,
    /// RLIMIT_NPROC for subprocesses
    pub max_processes: u64,
    /// RLIMIT_FSIZE for subprocesses
    pub max_file_size_bytes: u64,
    /// Captured stdout/stderr beyond this many bytes is discarded
    pub max_output_bytes: usize,
    /// Parent directory for per-invocation work dirs (system temp dir when unset)
    pub work_root: Option<PathBuf>,
    /// Interpreter binaries, resolved against the sandbox PATH
    pub python: String,
    pub node: String,
    pub shell: String,
}

impl Default for EngineConfig {
    /// Default configuration with ENV_VAR support for container deployment
    fn default() -> Self {
        Self {
            max_concurrent_nodes: env_parse("CITADEL_MAX_CONCURRENT_NODES", 16),
            workflow_timeout: Duration::from_secs(env_parse("CITADEL_WORKFLOW_TIMEOUT_SECS", 300)),
            cancel_grace: Duration::from_millis(env_parse("CITADEL_CANCEL_GRACE_MS", 5_000)),
            retained_executions: env_parse("CITADEL_RETAINED_EXECUTIONS", 1_024),
            retry: RetryPolicy::default(),
            breaker: BreakerConfig::default(),
            sandbox: SandboxConfig::default(),
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(env_parse("CITADEL_SANDBOX_TIMEOUT_SECS", 30)),
            max_memory_bytes: env_parse("CITADEL_SANDBOX_MAX_MEMORY_BYTES", 256 * 1024 * 1024),
            max_cpu_secs: env_parse("CITADEL_SANDBOX_MAX_CPU_SECS", 30),
            max_open_files: env_parse("CITADEL_SANDBOX_MAX_OPEN_FILES", 64),
            max_processes: env_parse("CITADEL_SANDBOX_MAX_PROCESSES", 64),
            max_file_size_bytes: env_parse("CITADEL_SANDBOX_MAX_FILE_SIZE_BYTES", 10 * 1024 * 1024),
            max_output_bytes: env_parse("CITADEL_SANDBOX_MAX_OUTPUT_BYTES", 1024 * 1024),
            work_root: std::env::var("CITADEL_SANDBOX_WORK_ROOT").ok().map(PathBuf::from),
            python: std::env::var("CITADEL_PYTHON").unwrap_or_else(|_| "python3".to_string()),
            node: std::env::var("CITADEL_NODE").unwrap_or_else(|_| "node".to_string()),
            shell: std::env::var("CITADEL_SHELL").unwrap_or_else(|_| "sh".to_string()),
        }
    }
}

impl EngineConfig {
    /// Load a JSON config file; absent keys keep their defaults
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("invalid config file {}", path.display()))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, fallback: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(fallback)
}

/// Serde adapter storing a `Duration` as integer milliseconds
pub mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis().min(u64::MAX as u128) as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn file_overrides_only_the_keys_it_sets() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"max_concurrent_nodes": 2, "sandbox": {{"timeout_ms": 1500}}, "retry": {{"max_attempts": 5}}}}"#
        )
        .unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_concurrent_nodes, 2);
        assert_eq!(config.sandbox.timeout, Duration::from_millis(1500));
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.retry.multiplier, RetryPolicy::default().multiplier);
        assert_eq!(config.sandbox.shell, SandboxConfig::default().shell);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(EngineConfig::from_file(file.path()).is_err());
    }
}
