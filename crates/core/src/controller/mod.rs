//! C13 — HNSC Controller. Binds C1–C12 into one per-request lifecycle and
//! is the only component with pipeline authority: no generator output is
//! ever treated as a decision. It is built once at startup as an explicit
//! context object — every component it owns is constructed up front and
//! passed through, rather than looked up from ambient state per request.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{info, info_span, Instrument};

use crate::arbitration::Chosen;
use crate::audit::AuditSink;
use crate::circuit_breaker::{CallOutcome, CircuitBreakerRegistry};
use crate::dual_model::DualModelDriver;
use crate::pii::PiiFilter;
use crate::policy_gateway::PolicyGateway;
use crate::rate_limit::RateLimiter;
use crate::registry::ToolRegistry;
use crate::router::{Disposition, SymbolicRouter};
use crate::safety::SafetyPolicy;
use crate::types::{ApprovalToken, Mode, Request, RequestId, SideEffectClass};
use crate::workflow::{ExecutionHandle, ExecutionStatus, WorkflowEngine, WorkflowError};

const TOOL_BREAKER_KEY: &str = "tool-invocation";

#[derive(Debug, Clone)]
pub enum HnscOutcome {
    TextResult(String),
    ToolResult(Value),
    WorkflowHandle(ExecutionHandle),
    ApprovalRequired { action_id: crate::types::ActionId, tool: String },
    Error(crate::types::error::ErrorEnvelope),
}

#[async_trait::async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(&self, tool_name: &str, args: Value) -> Result<Value, String>;
}

pub struct HnscController {
    pub rate_limiter: RateLimiter,
    pub pii_filter: PiiFilter,
    pub safety: SafetyPolicy,
    pub router: SymbolicRouter,
    pub registry: ToolRegistry,
    pub workflow_engine: WorkflowEngine,
    pub dual_model: DualModelDriver,
    pub policy_gateway: PolicyGateway,
    pub audit: AuditSink,
    pub tool_handler: Arc<dyn ToolHandler>,
    pub breaker: CircuitBreakerRegistry,
    pub risk_threshold: f64,
}

impl HnscController {
    /// The full per-request lifecycle folded into one async function;
    /// each step's failure short-circuits to the matching error envelope
    /// instead of propagating as a Rust error, since `submit`'s contract
    /// is that the error envelope is the only channel for user-facing
    /// failures.
    pub async fn submit(&self, request: Request) -> HnscOutcome {
        let span = info_span!("request", request_id = %request.id, actor_id = %request.actor_id, mode = %request.mode);
        self.submit_inner(request).instrument(span).await
    }

    async fn submit_inner(&self, request: Request) -> HnscOutcome {
        // S1 — admission.
        let bucket_key = format!("{}:chat", request.actor_id);
        let (admitted, retry_after) = self.rate_limiter.allow(&bucket_key, 1);
        if !admitted {
            let retry_after = retry_after.unwrap_or(Duration::from_secs(1));
            return self.deny(request.id, &request.actor_id, crate::types::error::HnscError::RateLimited { retry_after }).await;
        }

        // S2 — PII-redact for logging only; routing uses the original text.
        let redacted_for_log = self.pii_filter.redact(&request.text);
        info!(redacted_text = %redacted_for_log, "request admitted");

        // S3 — ingress safety check on the original text.
        let ingress = self.safety.check_ingress(&request.text, request.mode, true);
        if !ingress.allowed {
            self.audit
                .append("governance", "policy.deny", &request.actor_id, request.id, serde_json::json!({"reasons": ingress.reasons, "checkpoint": "ingress"}))
                .await
                .ok();
            return HnscOutcome::Error(crate::types::error::ErrorEnvelope {
                code: "PolicyDenied".into(),
                kind: crate::types::error::ErrorKind::PolicyDenied,
                message: format!("ingress denied: {:?}", ingress.reasons),
                retry_after: None,
                correlation_id: request.id,
            });
        }

        // S4 — symbolic routing.
        let disposition = self.router.route(&request.text, request.mode);

        match disposition {
            Disposition::Tool { name, args } => self.handle_tool(&request, &name, args).await,
            Disposition::Workflow { name, binding } => self.handle_workflow(&request, &name, binding).await,
            Disposition::Generate { prompt, .. } => self.handle_generate(&request, &prompt).await,
        }
    }

    async fn handle_tool(&self, request: &Request, name: &str, args: Value) -> HnscOutcome {
        // S5 — validate, pre-tool safety, policy risk score, then invoke
        // behind the circuit breaker.
        let tool = match self.registry.lookup(name) {
            Ok(t) => t.clone(),
            Err(e) => return self.deny(request.id, &request.actor_id, crate::types::error::HnscError::Schema(e)).await,
        };

        let call = match self.registry.validate(name, args, "router", request.id) {
            Ok(c) => c,
            Err(e) => return self.deny(request.id, &request.actor_id, crate::types::error::HnscError::Schema(e)).await,
        };

        let approval: Option<ApprovalToken> = None;
        if let Err(e) = self.safety.check_pre_tool(request.mode, &tool.scope_tags, tool.side_effect_class, approval.as_ref()) {
            self.audit
                .append("governance", "policy.deny", &request.actor_id, request.id, serde_json::json!({"tool": name, "checkpoint": "pre_tool"}))
                .await
                .ok();
            return self.deny(request.id, &request.actor_id, crate::types::error::HnscError::Safety(e)).await;
        }

        let decision = self.policy_gateway.decide(&request.actor_id, name, &serde_json::json!({}));
        let sensitive = matches!(tool.side_effect_class, SideEffectClass::Write | SideEffectClass::Irreversible);
        if sensitive && decision.risk >= self.risk_threshold {
            return HnscOutcome::ApprovalRequired { action_id: crate::types::ActionId::new(), tool: name.to_string() };
        }
        if !decision.allowed {
            return self.deny(request.id, &request.actor_id, crate::types::error::HnscError::PolicyDenied(decision.reasons)).await;
        }

        self.audit
            .append("governance", "policy.allow", &request.actor_id, request.id, serde_json::json!({"tool": name}))
            .await
            .ok();
        self.audit
            .append("tool-invocation", "tool.invoked", &request.actor_id, request.id, serde_json::json!({"tool": name, "correlation_id": call.correlation_id.to_string()}))
            .await
            .ok();

        let handler = self.tool_handler.clone();
        let tool_name = name.to_string();
        let arguments = call.arguments.clone();
        let result = self
            .breaker
            .call(TOOL_BREAKER_KEY, || async move { handler.invoke(&tool_name, arguments).await })
            .await;

        match result {
            Ok(output) => {
                self.audit
                    .append("tool-invocation", "tool.completed", &request.actor_id, request.id, serde_json::json!({"tool": name}))
                    .await
                    .ok();
                self.finish(request, HnscOutcome::ToolResult(output), false).await
            }
            Err(CallOutcome::Open(e)) => self.deny(request.id, &request.actor_id, crate::types::error::HnscError::CircuitOpen(e)).await,
            Err(CallOutcome::Inner(msg)) => self.deny(request.id, &request.actor_id, crate::types::error::HnscError::UpstreamUnavailable(msg)).await,
        }
    }

    async fn handle_workflow(&self, request: &Request, name: &str, binding: Value) -> HnscOutcome {
        // S6 — start the engine with the request deadline.
        let workflow = match self.lookup_workflow(name) {
            Some(w) => w,
            None => {
                return self
                    .deny(request.id, &request.actor_id, crate::types::error::HnscError::Workflow(WorkflowError::Invalid(format!("unknown workflow {name}"))))
                    .await
            }
        };

        let deadline = tokio::time::Instant::now() + request.remaining();
        match self.workflow_engine.start(workflow, binding, deadline) {
            Ok(handle) => {
                self.audit
                    .append("governance", "workflow.started", &request.actor_id, request.id, serde_json::json!({"workflow": name}))
                    .await
                    .ok();
                self.finish(request, HnscOutcome::WorkflowHandle(handle), false).await
            }
            Err(e) => self.deny(request.id, &request.actor_id, crate::types::error::HnscError::Workflow(e)).await,
        }
    }

    /// Workflow catalog lookup is intentionally a caller-provided hook
    /// point (`lookup_workflow`) rather than a field here, so embedding
    /// binaries can back it with whatever storage they choose; the
    /// default always returns `None`, which `handle_workflow` maps to a
    /// `workflow_invalid` denial.
    fn lookup_workflow(&self, _name: &str) -> Option<crate::types::Workflow> {
        None
    }

    async fn handle_generate(&self, request: &Request, prompt: &str) -> HnscOutcome {
        // S7 — Dual-Model Driver.
        let retrieval_enabled = !matches!(request.mode, Mode::Debug);
        match self.dual_model.run(prompt, retrieval_enabled).await {
            Ok(result) => {
                if !result.context_used {
                    self.audit
                        .append("governance", "retrieval.failed", &request.actor_id, request.id, serde_json::json!({}))
                        .await
                        .ok();
                }
                if result.arbitration.chosen.is_none() {
                    self.audit
                        .append("governance", "arbitration.denied", &request.actor_id, request.id, serde_json::json!({"reasons": result.arbitration.reasons}))
                        .await
                        .ok();
                    return self
                        .deny(request.id, &request.actor_id, crate::types::error::HnscError::PolicyDenied(result.arbitration.reasons))
                        .await;
                }
                let policy_violation_tagged = matches!(result.arbitration.chosen, Some(Chosen::Synthesized(_)));
                if policy_violation_tagged {
                    self.audit
                        .append("governance", "arbitration.synthesized", &request.actor_id, request.id, serde_json::json!({"similarity": result.arbitration.similarity}))
                        .await
                        .ok();
                }
                self.finish(request, HnscOutcome::TextResult(result.text), policy_violation_tagged).await
            }
            Err(e) => self.deny(request.id, &request.actor_id, crate::types::error::HnscError::Driver(e)).await,
        }
    }

    /// S8 — egress safety, then S9 — the terminal audit event.
    /// `policy_violation_tagged` carries the upstream arbitration/policy
    /// verdict into the egress checkpoint so it is weighed alongside PII
    /// presence, rather than silently dropped at the last hop.
    async fn finish(&self, request: &Request, outcome: HnscOutcome, policy_violation_tagged: bool) -> HnscOutcome {
        let final_outcome = if let HnscOutcome::TextResult(text) = &outcome {
            match self.safety.check_egress(text, policy_violation_tagged) {
                Ok(redacted) => HnscOutcome::TextResult(redacted),
                Err(_) => {
                    return self
                        .deny(request.id, &request.actor_id, crate::types::error::HnscError::PolicyDenied(vec!["egress_policy_violation".into()]))
                        .await
                }
            }
        } else {
            outcome
        };

        self.audit
            .append("governance", "request.completed", &request.actor_id, request.id, serde_json::json!({}))
            .await
            .ok();

        final_outcome
    }

    async fn deny(&self, request_id: RequestId, actor_id: &str, error: crate::types::error::HnscError) -> HnscOutcome {
        self.audit
            .append("governance", "request.completed", actor_id, request_id, serde_json::json!({"error": error.to_string()}))
            .await
            .ok();
        HnscOutcome::Error(crate::types::error::ErrorEnvelope::from_error(&error, request_id))
    }

    pub fn workflow_status(&self, handle: ExecutionHandle) -> Result<ExecutionStatus, WorkflowError> {
        self.workflow_engine.status(handle)
    }

    pub fn cancel(&self, handle: ExecutionHandle) -> Result<(), WorkflowError> {
        self.workflow_engine.cancel(handle)
    }
}
