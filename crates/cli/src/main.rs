//! Flowlane CLI
//!
//! Validates workflow files against the compiler and runs them in-process
//! with no-op bodies, which exercises the full lane/scheduler pipeline.

use anyhow::{anyhow, Context, Result};
use clap::{Arg, Command};
use flowlane_common::types::{WorkflowSpec, WorkflowState};
use flowlane_common::Config;
use flowlane_core::compiler::compile;
use flowlane_core::store::MemoryStore;
use flowlane_engine::{Engine, SubmitMode, TaskBodies};
use std::path::Path;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<()> {
    let app = Command::new("flowlane-cli")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Flowlane workflow tool")
        .subcommand(
            Command::new("validate")
                .about("Compile a workflow file and print its execution plan")
                .arg(Arg::new("file").required(true).help("Workflow file (YAML or JSON)")),
        )
        .subcommand(
            Command::new("run")
                .about("Execute a workflow file in-process with no-op task bodies")
                .arg(Arg::new("file").required(true).help("Workflow file (YAML or JSON)")),
        );

    match app.get_matches().subcommand() {
        Some(("validate", matches)) => {
            let file = matches.get_one::<String>("file").expect("required arg");
            let spec = load_workflow(file)?;
            let plan = compile(&spec)?;
            println!("✅ {} is valid: {} tasks", spec.id, plan.task_count());
            for (i, layer) in plan.layers.iter().enumerate() {
                println!("  layer {i}: {}", layer.join(", "));
            }
        }
        Some(("run", matches)) => {
            let file = matches.get_one::<String>("file").expect("required arg");
            let spec = load_workflow(file)?;
            let result = run_workflow(spec).await?;
            let icon = match result.status {
                WorkflowState::Completed => "✅",
                _ => "❌",
            };
            println!("{icon} workflow {}: {}", result.workflow_id, result.status.as_str());
            let mut ids: Vec<&String> = result.task_results.keys().collect();
            ids.sort();
            for id in ids {
                let task = &result.task_results[id];
                println!("  {} -> {}", id, task.state.as_str());
            }
        }
        _ => {
            println!("Use --help for usage information");
        }
    }

    Ok(())
}

fn load_workflow(path: &str) -> Result<WorkflowSpec> {
    let raw = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    let extension = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    match extension {
        "yaml" | "yml" => serde_yaml::from_str(&raw).with_context(|| format!("parsing {path}")),
        "json" => serde_json::from_str(&raw).with_context(|| format!("parsing {path}")),
        other => Err(anyhow!("unsupported workflow file extension: {other}")),
    }
}

async fn run_workflow(spec: WorkflowSpec) -> Result<flowlane_common::types::WorkflowResult> {
    let engine = Engine::new(Config::default(), Arc::new(MemoryStore::new()));
    engine.start()?;

    let mut bodies = TaskBodies::new();
    for task in &spec.tasks {
        bodies.insert(task.id.clone(), flowlane_engine::noop_body());
    }

    let outcome = engine.submit(spec, bodies, SubmitMode::Sync).await?;
    engine.stop().await?;
    outcome
        .result
        .ok_or_else(|| anyhow!("workflow did not run synchronously"))
}
