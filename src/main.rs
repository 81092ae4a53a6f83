//! `hnsc` — the command-line front end for the HNSC control plane.
//! Carries no pipeline authority of its own: every decision in the
//! controller's per-request lifecycle is made inside `hnsc-core`, and this
//! binary only constructs the controller from configuration and
//! serializes the result. Structured as a `clap`-derived command tree,
//! one module per subcommand.

mod commands;
mod wiring;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "hnsc", version, about = "Hybrid Neuro-Symbolic Control plane CLI")]
struct Cli {
    #[arg(long, global = true, default_value = "hnsc.yaml")]
    config: std::path::PathBuf,

    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Submit a request through the full pipeline and print the outcome.
    Submit(commands::submit::SubmitArgs),
    /// Inspect or cancel a workflow execution.
    #[command(subcommand)]
    Workflow(commands::workflow::WorkflowCommand),
    /// Operate on the audit log.
    #[command(subcommand)]
    Audit(commands::audit::AuditCommand),
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    hnsc_core::logging::init(&cli.log_level);

    match cli.command {
        Command::Submit(args) => commands::submit::run(&cli.config, args).await,
        Command::Workflow(cmd) => commands::workflow::run(&cli.config, cmd).await,
        Command::Audit(cmd) => commands::audit::run(&cli.config, cmd).await,
    }
}
