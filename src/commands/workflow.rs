use std::path::Path;

use clap::Subcommand;
use hnsc_core::config::Config;
use hnsc_core::types::ExecutionId;
use hnsc_core::workflow::ExecutionHandle;

use crate::wiring::build_controller;

#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Print the status of a running or completed execution.
    Status { handle: uuid::Uuid },
    /// Request cooperative cancellation of an execution.
    Cancel { handle: uuid::Uuid },
}

/// Each invocation constructs a fresh controller, so `status`/`cancel` only
/// resolve executions started by a still-running `submit` in the same
/// process — there is no cross-process execution store yet. Until one
/// exists, these subcommands surface that as `execution not found` rather
/// than pretending the handle was ever reachable.
pub async fn run(config_path: &Path, cmd: WorkflowCommand) -> anyhow::Result<()> {
    let config = Config::from_file(config_path)?;
    let controller = build_controller(&config)?;

    match cmd {
        WorkflowCommand::Status { handle } => {
            let handle = ExecutionHandle(ExecutionId(handle));
            match controller.workflow_status(handle) {
                Ok(status) => println!("{:#?}", status.overall_status),
                Err(e) => {
                    eprintln!("{e}");
                    std::process::exit(1);
                }
            }
        }
        WorkflowCommand::Cancel { handle } => {
            let handle = ExecutionHandle(ExecutionId(handle));
            if let Err(e) = controller.cancel(handle) {
                eprintln!("{e}");
                std::process::exit(1);
            }
            println!("cancellation requested");
        }
    }

    Ok(())
}
