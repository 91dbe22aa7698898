//! In-process Lua runtime
//!
//! Each run gets a fresh `mlua::Lua` state with only the table, string, math
//! and utf8 libraries, no loaders, and a heap ceiling. An instruction-count
//! hook enforces the deadline and cancellation while the script runs on a
//! blocking worker thread.

use crate::config::SandboxConfig;
use crate::error::SandboxError;
use crate::sandbox::{policy, ExecutionResult, ResourceUsage};
use crate::workflow::types::ValueMap;
use mlua::{HookTriggers, Lua, LuaOptions, LuaSerdeExt, SerializeOptions, StdLib, VmState};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Instructions between deadline/cancellation checks
const HOOK_INTERVAL: u32 = 1_000;

/// Budget for evaluating a connection condition
const CONDITION_BUDGET: Duration = Duration::from_millis(100);
const CONDITION_MEMORY: usize = 4 * 1024 * 1024;

/// Globals removed from every state on top of the libraries that are never loaded
const REMOVED_GLOBALS: &[&str] = &[
    "dofile", "loadfile", "load", "loadstring", "require", "collectgarbage", "print",
    "rawget", "rawset", "rawequal", "getmetatable", "setmetatable",
];

pub(crate) async fn run(
    config: &SandboxConfig,
    code: &str,
    inputs: &ValueMap,
    cancel: &CancellationToken,
    deadline: Instant,
    usage: ResourceUsage,
) -> Result<ExecutionResult, SandboxError> {
    let interrupt = Arc::new(AtomicBool::new(false));
    // Stops the worker thread if this future is dropped or loses the race below
    let _stop = InterruptOnDrop(Arc::clone(&interrupt));

    let script = LuaScript {
        code: code.to_string(),
        inputs: Value::Object(inputs.clone().into_iter().collect()),
        memory_limit: usize::try_from(config.max_memory_bytes).unwrap_or(usize::MAX),
        deadline: deadline.into_std(),
        interrupt,
        usage,
    };
    let started = Instant::now();
    let worker = tokio::task::spawn_blocking(move || script.run());

    tokio::select! {
        joined = worker => joined.map_err(|e| SandboxError::Io(format!("lua worker stopped: {e}")))?,
        _ = tokio::time::sleep_until(deadline) => Err(SandboxError::Timeout(started.elapsed())),
        _ = cancel.cancelled() => Err(SandboxError::Cancelled),
    }
}

/// Evaluate a connection condition against the source node's outputs.
///
/// The expression sees the outputs as `output`; Lua truthiness decides.
pub fn eval_condition(expr: &str, outputs: &ValueMap) -> Result<bool, String> {
    if !policy::is_safe_expression(expr) {
        return Err(format!("expression '{expr}' is not allowed"));
    }

    let lua = restricted_state(CONDITION_MEMORY).map_err(|e| e.to_string())?;
    install_hook(&lua, std::time::Instant::now() + CONDITION_BUDGET, None);

    let output = lua
        .to_value_with(&Value::Object(outputs.clone().into_iter().collect()), serialize_options())
        .map_err(|e| e.to_string())?;
    lua.globals().set("output", output).map_err(|e| e.to_string())?;

    let value: mlua::Value = lua
        .load(format!("return {expr}"))
        .set_name("condition")
        .eval()
        .map_err(|e| e.to_string())?;
    Ok(!matches!(value, mlua::Value::Nil | mlua::Value::Boolean(false)))
}

/// Compile a condition without running it
pub fn check_condition(expr: &str) -> Result<(), String> {
    if expr.trim().is_empty() {
        return Err("expression is empty".to_string());
    }
    if !policy::is_safe_expression(expr) {
        return Err(format!("expression '{expr}' is not allowed"));
    }
    let lua = restricted_state(CONDITION_MEMORY).map_err(|e| e.to_string())?;
    lua.load(format!("return {expr}"))
        .set_name("condition")
        .into_function()
        .map(|_| ())
        .map_err(|e| e.to_string())
}

struct LuaScript {
    code: String,
    inputs: Value,
    memory_limit: usize,
    deadline: std::time::Instant,
    interrupt: Arc<AtomicBool>,
    usage: ResourceUsage,
}

impl LuaScript {
    fn run(self) -> Result<ExecutionResult, SandboxError> {
        let started = std::time::Instant::now();
        let lua = restricted_state(self.memory_limit)?;
        install_hook(&lua, self.deadline, Some(Arc::clone(&self.interrupt)));

        let inputs = lua
            .to_value_with(&self.inputs, serialize_options())
            .map_err(|e| SandboxError::SetupFailed(format!("failed to load inputs: {e}")))?;
        lua.globals()
            .set("inputs", inputs)
            .map_err(|e| SandboxError::SetupFailed(e.to_string()))?;

        let evaluated = lua.load(&self.code).set_name("code").eval::<mlua::Value>();

        let mut usage = self.usage;
        usage.peak_memory_bytes = Some(lua.used_memory() as u64);
        let elapsed = started.elapsed();

        let value = match evaluated {
            Ok(value) if value.is_nil() => lua.globals().get("result").unwrap_or(mlua::Value::Nil),
            Ok(value) => value,
            Err(_) if self.interrupt.load(Ordering::Relaxed) => return Err(SandboxError::Cancelled),
            Err(_) if std::time::Instant::now() >= self.deadline => {
                return Err(SandboxError::Timeout(elapsed))
            }
            Err(mlua::Error::MemoryError(_)) => {
                return Ok(ExecutionResult::failure("memory limit exceeded", elapsed, usage))
            }
            Err(e) => return Ok(ExecutionResult::failure(e.to_string(), elapsed, usage)),
        };

        match lua.from_value::<Value>(value) {
            Ok(data) => Ok(ExecutionResult {
                success: true,
                data,
                error: None,
                exec_time: elapsed,
                resource_usage: usage,
            }),
            Err(e) => Ok(ExecutionResult::failure(
                format!("result is not serializable: {e}"),
                elapsed,
                usage,
            )),
        }
    }
}

fn restricted_state(memory_limit: usize) -> Result<Lua, SandboxError> {
    let setup = |e: mlua::Error| SandboxError::SetupFailed(format!("lua state: {e}"));

    let lua = Lua::new_with(
        StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::UTF8,
        LuaOptions::default(),
    )
    .map_err(setup)?;
    lua.set_memory_limit(memory_limit).map_err(setup)?;

    let globals = lua.globals();
    for name in REMOVED_GLOBALS {
        globals.set(*name, mlua::Nil).map_err(setup)?;
    }
    Ok(lua)
}

fn install_hook(lua: &Lua, deadline: std::time::Instant, interrupt: Option<Arc<AtomicBool>>) {
    lua.set_hook(
        HookTriggers::new().every_nth_instruction(HOOK_INTERVAL),
        move |_lua, _debug| {
            if interrupt
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::Relaxed))
            {
                return Err(mlua::Error::runtime("interrupted"));
            }
            if std::time::Instant::now() >= deadline {
                return Err(mlua::Error::runtime("deadline exceeded"));
            }
            Ok(VmState::Continue)
        },
    );
}

fn serialize_options() -> SerializeOptions {
    SerializeOptions::new()
        .serialize_none_to_null(false)
        .serialize_unit_to_null(false)
}

struct InterruptOnDrop(Arc<AtomicBool>);

impl Drop for InterruptOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Relaxed);
    }
}
