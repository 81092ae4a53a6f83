//! Structured logging setup: tracing + tracing-subscriber with an
//! env-filter, exposed as a single `init` entry point the CLI calls once
//! at startup. Logs are operational and are kept strictly separate from
//! the Audit Sink's governance record — a log line is never a substitute
//! for an audit event.

use tracing_subscriber::{fmt, EnvFilter};

pub fn init(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    fmt().with_env_filter(filter).with_target(true).init();
}
