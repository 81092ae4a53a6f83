use std::path::Path;
use std::time::Duration;

use clap::Args;
use hnsc_core::config::Config;
use hnsc_core::controller::HnscOutcome;
use hnsc_core::types::{Mode, Request};

use crate::wiring::build_controller;

#[derive(Args)]
pub struct SubmitArgs {
    #[arg(long)]
    actor: String,

    #[arg(long, default_value = "cli-session")]
    session: String,

    #[arg(long, value_enum, default_value = "general")]
    mode: CliMode,

    #[arg(long, default_value_t = 30)]
    timeout_secs: u64,

    text: String,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum CliMode {
    Auto,
    Concierge,
    General,
    Mcp,
    Debug,
}

impl From<CliMode> for Mode {
    fn from(m: CliMode) -> Self {
        match m {
            CliMode::Auto => Mode::Auto,
            CliMode::Concierge => Mode::Concierge,
            CliMode::General => Mode::General,
            CliMode::Mcp => Mode::Mcp,
            CliMode::Debug => Mode::Debug,
        }
    }
}

pub async fn run(config_path: &Path, args: SubmitArgs) -> anyhow::Result<()> {
    let config = Config::from_file(config_path)?;
    let controller = build_controller(&config)?;

    let request = Request::new(args.actor, args.session, args.text, args.mode.into(), Duration::from_secs(args.timeout_secs));
    let outcome = controller.submit(request).await;

    match outcome {
        HnscOutcome::TextResult(text) => println!("{text}"),
        HnscOutcome::ToolResult(value) => println!("{}", serde_json::to_string_pretty(&value)?),
        HnscOutcome::WorkflowHandle(handle) => println!("workflow started: {}", handle.0),
        HnscOutcome::ApprovalRequired { action_id, tool } => {
            println!("approval required for tool {tool} (action {action_id})");
        }
        HnscOutcome::Error(envelope) => {
            eprintln!("error [{:?}]: {}", envelope.kind, envelope.message);
            std::process::exit(1);
        }
    }

    Ok(())
}
