/// Citadel: workflow execution core
///
/// Command-line entry point. Runs a workflow file to completion, validates one,
/// or lists the registered node types. Logs go to stderr; stdout carries only
/// the report.

use anyhow::{Context, Result};
use citadel_core::config::EngineConfig;
use citadel_core::error::EngineError;
use citadel_core::runtime::{Execution, ExecutionEngine, ExecutionStatus, WorkflowRunner};
use citadel_core::workflow::{load_workflow, ValueMap};
use citadel_core::NodeRegistry;
use clap::{Parser, Subcommand};
use serde_json::Value;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "citadel", version, about = "Run and check workflow graphs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Execute a workflow and print its result
    Run {
        workflow: PathBuf,
        /// JSON engine config layered over the defaults
        #[arg(long)]
        config: Option<PathBuf>,
        /// Trigger parameter as key=value; values are parsed as JSON when possible
        #[arg(long = "param", value_parser = parse_param)]
        params: Vec<(String, Value)>,
        /// Print the execution snapshot as JSON
        #[arg(long)]
        json: bool,
    },
    /// Check a workflow without running it
    Validate { workflow: PathBuf },
    /// List registered node types
    Nodes,
}

const EXIT_INVALID: u8 = 2;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!("❌ {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let registry = Arc::new(NodeRegistry::with_builtins());

    match cli.command {
        Command::Nodes => {
            for definition in registry.list() {
                println!("{:<12} {}", definition.type_name, definition.description);
            }
            Ok(ExitCode::SUCCESS)
        }
        Command::Validate { workflow } => {
            let workflow = load_workflow(&workflow)?;
            let engine = ExecutionEngine::new(registry, EngineConfig::default());
            match engine.validate(&workflow) {
                Ok(()) => {
                    println!("workflow '{}' is valid", workflow.id);
                    Ok(ExitCode::SUCCESS)
                }
                Err(e) => {
                    print_issues(&e);
                    Ok(ExitCode::from(EXIT_INVALID))
                }
            }
        }
        Command::Run {
            workflow,
            config,
            params,
            json,
        } => {
            let config = match config {
                Some(path) => EngineConfig::from_file(&path)?,
                None => EngineConfig::default(),
            };
            let workflow = load_workflow(&workflow)?;
            let params: ValueMap = params.into_iter().collect();

            let runner = WorkflowRunner::new(Arc::new(ExecutionEngine::new(registry, config)));
            let id = match runner.start_execution(workflow, params) {
                Ok(id) => id,
                Err(EngineError::Validation(e)) => {
                    print_issues(&e);
                    return Ok(ExitCode::from(EXIT_INVALID));
                }
                Err(e) => return Err(e.into()),
            };

            let finished = runner.wait(id);
            tokio::pin!(finished);
            let mut interrupted = false;
            let execution = loop {
                tokio::select! {
                    execution = &mut finished => break execution?,
                    _ = tokio::signal::ctrl_c(), if !interrupted => {
                        interrupted = true;
                        tracing::warn!("🛑 Interrupt received, cancelling execution");
                        let _ = runner.cancel_execution(id);
                    }
                }
            };

            if json {
                println!(
                    "{}",
                    serde_json::to_string_pretty(&execution).context("failed to serialize execution")?
                );
            } else {
                print_report(&execution);
            }

            Ok(if execution.status == ExecutionStatus::Succeeded {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
    }
}

fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty parameter name in '{raw}'"));
    }
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    Ok((key.to_string(), value))
}

fn print_issues(error: &citadel_core::ValidationError) {
    println!("workflow '{}' is invalid:", error.workflow_id);
    for issue in &error.issues {
        println!("  - {issue}");
    }
}

fn print_report(execution: &Execution) {
    println!("execution {} {}", execution.id, execution.status);
    if let Some(error) = &execution.error {
        let node = execution.failed_node.as_deref().unwrap_or("-");
        println!("error in {node}: {error}");
    }

    let mut nodes: Vec<_> = execution.node_results.values().collect();
    nodes.sort_by_key(|result| (result.started_at.is_none(), result.started_at, result.node_id.clone()));
    for result in nodes {
        let mut line = format!("  {:<16} {:<10} retries={}", result.node_id, result.status.as_str(), result.retry_count);
        if result.outputs_cached {
            line.push_str(" cached");
        }
        if let Some(error) = &result.error {
            line.push_str(&format!(" error={error}"));
        }
        println!("{line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn params_parse_as_json_with_string_fallback() {
        assert_eq!(parse_param("n=3").unwrap(), ("n".to_string(), Value::from(3)));
        assert_eq!(parse_param("name=ada").unwrap(), ("name".to_string(), Value::from("ada")));
        assert_eq!(parse_param("eq=a=b").unwrap(), ("eq".to_string(), Value::from("a=b")));
        assert!(parse_param("novalue").is_err());
        assert!(parse_param("=1").is_err());
    }

    #[test]
    fn cli_definition_is_consistent() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
