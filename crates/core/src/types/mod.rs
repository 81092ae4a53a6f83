//! Shared data model: requests, tools, workflows, and the values that flow
//! between components without being owned by any single one of them.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub mod error;

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(RequestId);
uuid_id!(ExecutionId);
uuid_id!(StepId);
uuid_id!(ToolCallId);
uuid_id!(ActionId);

/// The set of request-handling contexts the Symbolic Router and Safety
/// Policy key their scope decisions on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Auto,
    Concierge,
    General,
    Mcp,
    Debug,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Mode::Auto => "auto",
            Mode::Concierge => "concierge",
            Mode::General => "general",
            Mode::Mcp => "mcp",
            Mode::Debug => "debug",
        };
        write!(f, "{s}")
    }
}

/// A single inbound request. `deadline` is relative to construction time
/// and is converted to a `tokio::time::Instant` by the controller.
#[derive(Debug, Clone)]
pub struct Request {
    pub id: RequestId,
    pub actor_id: String,
    pub session_id: String,
    pub text: String,
    pub mode: Mode,
    pub received_at: std::time::Instant,
    pub deadline: std::time::Instant,
}

impl Request {
    pub fn new(actor_id: impl Into<String>, session_id: impl Into<String>, text: impl Into<String>, mode: Mode, budget: Duration) -> Self {
        let now = std::time::Instant::now();
        Self {
            id: RequestId::new(),
            actor_id: actor_id.into(),
            session_id: session_id.into(),
            text: text.into(),
            mode,
            received_at: now,
            deadline: now + budget,
        }
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(std::time::Instant::now())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideEffectClass {
    None,
    Read,
    Write,
    Irreversible,
}

/// Registered, schema-validated capability. Immutable after registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Tool {
    pub name: String,
    pub scope_tags: BTreeSet<String>,
    pub input_schema: serde_json::Value,
    pub output_schema: serde_json::Value,
    pub idempotent: bool,
    pub side_effect_class: SideEffectClass,
    pub risk_weight: f64,
}

/// A tool invocation that has already passed schema validation — by
/// construction, a `ToolCall` cannot exist without that having happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub issued_by: String,
    pub correlation_id: RequestId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OnFailure {
    Skip,
    FailWorkflow,
    Retry,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: StepId,
    pub tool_name: String,
    pub args_template: serde_json::Value,
    pub depends_on: BTreeSet<StepId>,
    pub on_failure: OnFailure,
    pub max_retries: u32,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workflow {
    pub name: String,
    pub steps: Vec<Step>,
    pub max_concurrent: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Skipped,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: StepId,
    pub status: StepStatus,
    pub attempts: u32,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub ended_at: Option<chrono::DateTime<chrono::Utc>>,
    pub output: Option<serde_json::Value>,
    pub error: Option<String>,
}

impl StepResult {
    pub fn pending(step_id: StepId) -> Self {
        Self {
            step_id,
            status: StepStatus::Pending,
            attempts: 0,
            started_at: None,
            ended_at: None,
            output: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievalRequest {
    pub query: String,
    pub top_k: usize,
    pub token_budget: usize,
    pub filter: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedDocument {
    pub text: String,
    pub score: f64,
    pub meta: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RetrievalResult {
    pub documents: Vec<RetrievedDocument>,
    pub truncated: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub seq: u64,
    pub monotonic_ts: u128,
    pub wall_ts: chrono::DateTime<chrono::Utc>,
    pub category: String,
    pub actor_id: String,
    pub request_id: RequestId,
    pub fields: serde_json::Value,
    pub prev_hash: String,
    pub hash: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyDecision {
    pub allowed: bool,
    pub risk: f64,
    pub reasons: Vec<String>,
    pub version: String,
}

/// Sign-off for a sensitive action, issued out of band and checked at the
/// pre-tool safety checkpoint — distinct from a failure, since the action
/// itself is otherwise policy-eligible and only waiting on approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalToken {
    pub action_id: ActionId,
    pub tool: String,
    pub issued_at: chrono::DateTime<chrono::Utc>,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

impl ApprovalToken {
    pub fn is_valid(&self) -> bool {
        chrono::Utc::now() < self.expires_at
    }
}

pub type ArgMap = HashMap<String, serde_json::Value>;
