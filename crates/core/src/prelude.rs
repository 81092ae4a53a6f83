//! Convenience re-exports for downstream crates.

pub use crate::config::Config;
pub use crate::controller::{HnscController, HnscOutcome, ToolHandler};
pub use crate::types::error::{ErrorEnvelope, ErrorKind, HnscError, HnscResult};
pub use crate::types::{Mode, Request, RequestId, Tool, ToolCall, Workflow};
