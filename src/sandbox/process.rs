//! Subprocess runtimes: Python, JavaScript (node) and shell
//!
//! Every invocation gets a fresh temp directory holding the script and
//! `input.json`. The child starts in its own process group with a cleared
//! environment, and rlimits are applied between `fork` and `exec`, so a limit
//! that cannot be applied aborts the spawn. On timeout, cancellation, or when
//! the caller drops the future, the whole group is SIGKILLed. The directory is
//! removed when the `TempDir` guard drops, on every path.

use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::sandbox::{ExecutionResult, Language, ResourceUsage};
use crate::workflow::types::ValueMap;
use serde_json::Value;
use std::io;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{ChildStdin, Command};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

const SANDBOX_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Trusted wrappers around user code. The user code runs at top level and
/// communicates through the `inputs` binding and the `result` variable.
const PYTHON_PRELUDE: &str = "import json as __citadel_json\nwith open('input.json') as __citadel_f:\n    inputs = __citadel_json.load(__citadel_f)\nresult = None\n";
const PYTHON_EPILOGUE: &str = "\nwith open('result.json', 'w') as __citadel_f:\n    __citadel_json.dump(result, __citadel_f)\n";
const JAVASCRIPT_PRELUDE: &str = "const __citadelFs = require('fs');\nconst inputs = JSON.parse(__citadelFs.readFileSync('input.json', 'utf8'));\nlet result = null;\n";
const JAVASCRIPT_EPILOGUE: &str = "\n__citadelFs.writeFileSync('result.json', JSON.stringify(result === undefined ? null : result));\n";

/// Which rlimit carries the memory cap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemoryLimit {
    AddressSpace,
    /// V8 reserves gigabytes of address space up front (code range, pointer
    /// cage), so node only starts under a cap on writable data segments.
    Data,
}

impl MemoryLimit {
    fn for_language(language: Language) -> Self {
        match language {
            Language::JavaScript => Self::Data,
            _ => Self::AddressSpace,
        }
    }
}

/// Resource limits copied into the pre-exec hook
#[derive(Debug, Clone, Copy)]
struct Limits {
    memory: MemoryLimit,
    memory_bytes: u64,
    cpu_secs: u64,
    open_files: u64,
    processes: u64,
    file_size_bytes: u64,
}

impl Limits {
    fn from_config(config: &SandboxConfig, language: Language) -> Self {
        Self {
            memory: MemoryLimit::for_language(language),
            memory_bytes: config.max_memory_bytes,
            cpu_secs: config.max_cpu_secs,
            open_files: config.max_open_files,
            processes: config.max_processes,
            file_size_bytes: config.max_file_size_bytes,
        }
    }

    /// Runs in the forked child before exec: only async-signal-safe calls
    fn apply(&self) -> io::Result<()> {
        // SAFETY: setpgid/getrlimit/setrlimit are async-signal-safe and only
        // touch the calling (child) process.
        unsafe {
            if libc::setpgid(0, 0) != 0 {
                return Err(io::Error::last_os_error());
            }
            let memory = match self.memory {
                MemoryLimit::AddressSpace => libc::RLIMIT_AS,
                MemoryLimit::Data => libc::RLIMIT_DATA,
            };
            let limits = [
                (memory, self.memory_bytes),
                (libc::RLIMIT_CPU, self.cpu_secs),
                (libc::RLIMIT_NOFILE, self.open_files),
                (libc::RLIMIT_NPROC, self.processes),
                (libc::RLIMIT_FSIZE, self.file_size_bytes),
            ];
            for (resource, wanted) in limits {
                let mut current = libc::rlimit { rlim_cur: 0, rlim_max: 0 };
                if libc::getrlimit(resource, &mut current) != 0 {
                    return Err(io::Error::last_os_error());
                }
                // Never above the inherited hard limit, which would fail with EPERM
                let value = (wanted as libc::rlim_t).min(current.rlim_max);
                let limit = libc::rlimit { rlim_cur: value, rlim_max: value };
                if libc::setrlimit(resource, &limit) != 0 {
                    return Err(io::Error::last_os_error());
                }
            }
        }
        Ok(())
    }
}

/// SIGKILLs the child's process group unless it already has been
struct ProcessGroup(Option<libc::pid_t>);

impl ProcessGroup {
    fn kill(&mut self) {
        if let Some(pgid) = self.0.take() {
            // SAFETY: signalling a process group we created; ESRCH is harmless
            unsafe {
                libc::killpg(pgid, libc::SIGKILL);
            }
        }
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        self.kill();
    }
}

enum Outcome {
    Exited(io::Result<std::process::ExitStatus>, Captured, Captured),
    TimedOut,
    Cancelled,
}

#[derive(Default)]
struct Captured {
    bytes: Vec<u8>,
    truncated: bool,
}

impl Captured {
    fn text(&self) -> String {
        String::from_utf8_lossy(&self.bytes).trim().to_string()
    }
}

pub(crate) async fn run(
    config: &SandboxConfig,
    language: Language,
    code: &str,
    inputs: &ValueMap,
    cancel: &CancellationToken,
    deadline: Instant,
    mut usage: ResourceUsage,
) -> Result<ExecutionResult, SandboxError> {
    let started = Instant::now();
    let workdir = make_workdir(config)?;
    let input_json = serde_json::to_vec(inputs).map_err(|e| SandboxError::Io(e.to_string()))?;

    let (interpreter, script_name, script) = match language {
        Language::Python => (
            config.python.as_str(),
            "main.py",
            format!("{PYTHON_PRELUDE}{code}{PYTHON_EPILOGUE}"),
        ),
        Language::JavaScript => (
            config.node.as_str(),
            "main.js",
            format!("{JAVASCRIPT_PRELUDE}{code}{JAVASCRIPT_EPILOGUE}"),
        ),
        Language::Shell => (config.shell.as_str(), "main.sh", code.to_string()),
        Language::Lua => return Err(SandboxError::UnsupportedLanguage("lua subprocess".into())),
    };

    write_file(&workdir.path().join(script_name), script.as_bytes()).await?;
    write_file(&workdir.path().join("input.json"), &input_json).await?;

    let mut command = Command::new(interpreter);
    if language == Language::JavaScript {
        command.arg(format!("--max-old-space-size={}", heap_mib(config.max_memory_bytes)));
    }
    command
        .arg(script_name)
        .current_dir(workdir.path())
        .env_clear()
        .env("PATH", SANDBOX_PATH)
        .env("HOME", workdir.path())
        .env("TMPDIR", workdir.path())
        .env("LANG", "C")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let limits = Limits::from_config(config, language);
    // SAFETY: the hook only performs async-signal-safe libc calls
    unsafe {
        command.pre_exec(move || limits.apply());
    }

    let mut child = command.spawn().map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => SandboxError::RuntimeUnavailable(interpreter.to_string()),
        _ => SandboxError::SetupFailed(format!("failed to start {interpreter}: {e}")),
    })?;
    let mut group = ProcessGroup(child.id().and_then(|pid| libc::pid_t::try_from(pid).ok()));

    let stdin = child.stdin.take();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let cap = config.max_output_bytes;

    let outcome = tokio::select! {
        (out, err, status) = async {
            let (_, out, err) = tokio::join!(
                feed_stdin(stdin, &input_json),
                read_capped(stdout, cap),
                read_capped(stderr, cap),
            );
            (out, err, child.wait().await)
        } => Outcome::Exited(status, out, err),
        _ = tokio::time::sleep_until(deadline) => Outcome::TimedOut,
        _ = cancel.cancelled() => Outcome::Cancelled,
    };

    // Reap stragglers the script may have left in its group
    group.kill();

    let (status, out, err) = match outcome {
        Outcome::Exited(status, out, err) => (status, out, err),
        Outcome::TimedOut => {
            let _ = child.kill().await;
            return Err(SandboxError::Timeout(started.elapsed()));
        }
        Outcome::Cancelled => {
            let _ = child.kill().await;
            return Err(SandboxError::Cancelled);
        }
    };

    let status = status.map_err(|e| SandboxError::Io(format!("failed to wait for {interpreter}: {e}")))?;
    let elapsed = started.elapsed();
    usage.stdout_bytes = out.bytes.len();
    usage.stderr_bytes = err.bytes.len();
    usage.exit_code = status.code();

    if out.truncated || err.truncated {
        return Ok(ExecutionResult::failure(
            format!("output exceeded {cap} bytes"),
            elapsed,
            usage,
        ));
    }
    if !status.success() {
        let message = match err.text() {
            text if !text.is_empty() => text,
            _ => format!("{interpreter} exited with {status}"),
        };
        return Ok(ExecutionResult::failure(message, elapsed, usage));
    }

    let data = match read_result_file(workdir.path()).await? {
        Some(data) => data,
        None => parse_stdout(&out),
    };
    Ok(ExecutionResult {
        success: true,
        data,
        error: None,
        exec_time: elapsed,
        resource_usage: usage,
    })
}

/// V8 old-space budget: half the data cap, leaving room for the runtime itself
fn heap_mib(memory_bytes: u64) -> u64 {
    (memory_bytes / 2 / (1024 * 1024)).max(16)
}

fn make_workdir(config: &SandboxConfig) -> Result<tempfile::TempDir, SandboxError> {
    let mut builder = tempfile::Builder::new();
    builder.prefix("citadel-sandbox-");
    let created = match &config.work_root {
        Some(root) => builder.tempdir_in(root),
        None => builder.tempdir(),
    };
    created.map_err(|e| SandboxError::SetupFailed(format!("failed to create work dir: {e}")))
}

async fn write_file(path: &Path, contents: &[u8]) -> Result<(), SandboxError> {
    tokio::fs::write(path, contents)
        .await
        .map_err(|e| SandboxError::SetupFailed(format!("failed to write {}: {e}", path.display())))
}

/// Write the inputs and close stdin. A script that never reads stdin closes
/// the pipe early; that's fine.
async fn feed_stdin(stdin: Option<ChildStdin>, data: &[u8]) {
    if let Some(mut stdin) = stdin {
        let _ = stdin.write_all(data).await;
    }
}

/// Keep at most `cap` bytes; anything beyond is drained so the child never
/// blocks on a full pipe.
async fn read_capped<R: AsyncRead + Unpin>(pipe: Option<R>, cap: usize) -> Captured {
    let Some(mut pipe) = pipe else {
        return Captured::default();
    };
    let mut bytes = Vec::new();
    let limit = u64::try_from(cap).unwrap_or(u64::MAX).saturating_add(1);
    let _ = (&mut pipe).take(limit).read_to_end(&mut bytes).await;
    let truncated = bytes.len() > cap;
    if truncated {
        bytes.truncate(cap);
        let _ = tokio::io::copy(&mut pipe, &mut tokio::io::sink()).await;
    }
    Captured { bytes, truncated }
}

async fn read_result_file(workdir: &Path) -> Result<Option<Value>, SandboxError> {
    match tokio::fs::read(workdir.join("result.json")).await {
        Ok(raw) => serde_json::from_slice(&raw)
            .map(Some)
            .map_err(|e| SandboxError::Io(format!("unreadable result: {e}"))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(SandboxError::Io(e.to_string())),
    }
}

/// Stdout as JSON when it parses, otherwise as a trimmed string
fn parse_stdout(out: &Captured) -> Value {
    let text = out.text();
    if text.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(&text).unwrap_or(Value::String(text))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    fn config(root: &Path) -> SandboxConfig {
        SandboxConfig {
            work_root: Some(root.to_path_buf()),
            max_processes: 4096,
            ..SandboxConfig::default()
        }
    }

    fn entries(root: &Path) -> usize {
        std::fs::read_dir(root).unwrap().count()
    }

    async fn shell(config: &SandboxConfig, code: &str, timeout: Duration) -> Result<ExecutionResult, SandboxError> {
        let inputs: ValueMap = serde_json::from_value(json!({"name": "citadel"})).unwrap();
        run(
            config,
            Language::Shell,
            code,
            &inputs,
            &CancellationToken::new(),
            Instant::now() + timeout,
            ResourceUsage::default(),
        )
        .await
    }

    #[tokio::test]
    async fn shell_stdout_becomes_data() {
        let root = tempfile::tempdir().unwrap();
        let cfg = config(root.path());

        let result = shell(&cfg, "echo '{\"ok\": true}'", Duration::from_secs(10)).await.unwrap();
        assert!(result.success, "{result:?}");
        assert_eq!(result.data, json!({"ok": true}));

        let result = shell(&cfg, "cat input.json", Duration::from_secs(10)).await.unwrap();
        assert_eq!(result.data, json!({"name": "citadel"}));
        assert_eq!(entries(root.path()), 0);
    }

    #[tokio::test]
    async fn non_zero_exit_is_an_application_failure() {
        let root = tempfile::tempdir().unwrap();
        let result = shell(&config(root.path()), "exit 3", Duration::from_secs(10)).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.resource_usage.exit_code, Some(3));
        assert_eq!(entries(root.path()), 0);
    }

    #[tokio::test]
    async fn timeout_kills_the_child_and_removes_the_work_dir() {
        let root = tempfile::tempdir().unwrap();
        let started = std::time::Instant::now();
        let err = shell(&config(root.path()), "sleep 30", Duration::from_millis(300))
            .await
            .unwrap_err();

        assert!(matches!(err, SandboxError::Timeout(_)), "{err:?}");
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(entries(root.path()), 0);
    }

    #[tokio::test]
    async fn cancellation_stops_the_child() {
        let root = tempfile::tempdir().unwrap();
        let cfg = config(root.path());
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let err = run(
            &cfg,
            Language::Shell,
            "sleep 30",
            &ValueMap::new(),
            &cancel,
            Instant::now() + Duration::from_secs(60),
            ResourceUsage::default(),
        )
        .await
        .unwrap_err();
        assert_eq!(err, SandboxError::Cancelled);
        assert_eq!(entries(root.path()), 0);
    }

    #[tokio::test]
    async fn missing_interpreter_is_reported() {
        let root = tempfile::tempdir().unwrap();
        let cfg = SandboxConfig {
            shell: "citadel-no-such-shell".into(),
            ..config(root.path())
        };
        let err = shell(&cfg, "true", Duration::from_secs(5)).await.unwrap_err();
        assert_eq!(err, SandboxError::RuntimeUnavailable("citadel-no-such-shell".into()));
        assert_eq!(entries(root.path()), 0);
    }

    async fn script(language: Language, code: &str) -> Option<ExecutionResult> {
        let root = tempfile::tempdir().unwrap();
        let inputs: ValueMap = serde_json::from_value(json!({"n": 20})).unwrap();
        let outcome = run(
            &config(root.path()),
            language,
            code,
            &inputs,
            &CancellationToken::new(),
            Instant::now() + Duration::from_secs(30),
            ResourceUsage::default(),
        )
        .await;
        assert_eq!(entries(root.path()), 0);
        match outcome {
            Err(SandboxError::RuntimeUnavailable(interpreter)) => {
                eprintln!("skipping: {interpreter} is not installed");
                None
            }
            other => Some(other.unwrap()),
        }
    }

    #[tokio::test]
    async fn python_runs_under_the_default_memory_cap() {
        let Some(result) = script(Language::Python, "result = inputs['n'] + 1").await else {
            return;
        };
        assert!(result.success, "{result:?}");
        assert_eq!(result.data, json!(21));
    }

    #[tokio::test]
    async fn javascript_runs_under_the_default_memory_cap() {
        let Some(result) = script(Language::JavaScript, "result = 1 + 1").await else {
            return;
        };
        assert!(result.success, "{result:?}");
        assert_eq!(result.data, json!(2));

        let Some(result) = script(Language::JavaScript, "result = { doubled: inputs.n * 2 }").await else {
            return;
        };
        assert_eq!(result.data, json!({"doubled": 40}));
    }

    #[test]
    fn memory_cap_follows_the_runtime() {
        let cfg = SandboxConfig::default();
        assert_eq!(Limits::from_config(&cfg, Language::JavaScript).memory, MemoryLimit::Data);
        assert_eq!(Limits::from_config(&cfg, Language::Python).memory, MemoryLimit::AddressSpace);
        assert_eq!(Limits::from_config(&cfg, Language::Shell).memory, MemoryLimit::AddressSpace);
        assert_eq!(heap_mib(256 * 1024 * 1024), 128);
        assert_eq!(heap_mib(1024), 16);
    }

    #[tokio::test]
    async fn unusable_work_root_is_a_setup_failure() {
        let root = tempfile::tempdir().unwrap();
        let cfg = config(&root.path().join("missing"));
        let err = shell(&cfg, "true", Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, SandboxError::SetupFailed(_)), "{err:?}");
    }
}
