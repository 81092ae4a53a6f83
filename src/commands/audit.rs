use std::path::Path;

use clap::Subcommand;
use hnsc_core::audit::AuditSink;
use hnsc_core::config::Config;

#[derive(Subcommand)]
pub enum AuditCommand {
    /// Walk a stream's hash chain and report whether it is intact.
    Verify { stream: String },
}

pub async fn run(config_path: &Path, cmd: AuditCommand) -> anyhow::Result<()> {
    let config = Config::from_file(config_path)?;

    match cmd {
        AuditCommand::Verify { stream } => match AuditSink::verify_stream(&config.audit.dir, &stream) {
            Ok(()) => println!("stream '{stream}' chain intact"),
            Err(e) => {
                eprintln!("stream '{stream}' chain broken: {e}");
                std::process::exit(1);
            }
        },
    }

    Ok(())
}
