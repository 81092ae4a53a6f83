//! Builds an `HnscController` from `Config`, wiring the default
//! in-process backends. No network vector store or generator is assumed
//! available to the CLI out of the box — operators register real tool
//! handlers, embedding services, and a generator client by replacing the
//! stub implementations in this module with their own.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use hnsc_core::audit::AuditSink;
use hnsc_core::circuit_breaker::{BreakerSettings, CircuitBreakerRegistry};
use hnsc_core::config::Config;
use hnsc_core::controller::{HnscController, ToolHandler};
use hnsc_core::dual_model::{DualModelDriver, Generator, TiktokenCounter};
use hnsc_core::pii::PiiFilter;
use hnsc_core::policy_gateway::{PolicyGateway, PolicyRuleSet};
use hnsc_core::rate_limit::{RateLimitSettings, RateLimiter};
use hnsc_core::registry::ToolRegistry;
use hnsc_core::retriever::{Candidate, EmbeddingService, Retriever, VectorStore};
use hnsc_core::router::SymbolicRouter;
use hnsc_core::safety::SafetyPolicy;
use hnsc_core::types::{SideEffectClass, Tool};
use hnsc_core::workflow::{CancellationToken, ToolExecutor, WorkflowEngine};

struct EchoToolHandler;

#[async_trait]
impl ToolHandler for EchoToolHandler {
    async fn invoke(&self, tool_name: &str, args: serde_json::Value) -> Result<serde_json::Value, String> {
        Ok(serde_json::json!({"tool": tool_name, "echoed_args": args}))
    }
}

struct EchoToolExecutor {
    registry_tools: Vec<String>,
}

#[async_trait]
impl ToolExecutor for EchoToolExecutor {
    async fn invoke(&self, tool_name: &str, args: serde_json::Value, _cancel: CancellationToken) -> Result<serde_json::Value, String> {
        Ok(serde_json::json!({"tool": tool_name, "echoed_args": args}))
    }
    fn exists(&self, tool_name: &str) -> bool {
        self.registry_tools.iter().any(|t| t == tool_name)
    }
    fn is_idempotent(&self, _tool_name: &str) -> bool {
        true
    }
}

struct PlaceholderGenerator;

#[async_trait]
impl Generator for PlaceholderGenerator {
    async fn generate(&self, _system_prompt: &str, user_prompt: &str) -> Result<String, String> {
        Ok(format!("No generator backend configured; echoing prompt: {user_prompt}"))
    }
}

struct NullEmbeddingService;

#[async_trait]
impl EmbeddingService for NullEmbeddingService {
    async fn embed(&self, _text: &str) -> Result<Vec<f32>, String> {
        Err("no embedding backend configured".to_string())
    }
}

struct EmptyVectorStore;

#[async_trait]
impl VectorStore for EmptyVectorStore {
    async fn search(&self, _vector: &[f32], _top_k: usize, _filter: Option<&serde_json::Value>) -> Result<Vec<Candidate>, String> {
        Ok(vec![])
    }
}

fn builtin_tools() -> Vec<Tool> {
    vec![Tool {
        name: "check_health".to_string(),
        scope_tags: BTreeSet::from(["diagnostics".to_string()]),
        input_schema: serde_json::json!({"type": "object", "properties": {}}),
        output_schema: serde_json::json!({"type": "object"}),
        idempotent: true,
        side_effect_class: SideEffectClass::Read,
        risk_weight: 0.0,
    }]
}

pub fn build_controller(config: &Config) -> anyhow::Result<HnscController> {
    let mut registry = ToolRegistry::new();
    let tools = builtin_tools();
    let tool_names: Vec<String> = tools.iter().map(|t| t.name.clone()).collect();
    for tool in tools {
        registry.register(tool)?;
    }

    let mut router = SymbolicRouter::new();
    router.add_exact_rule("check_health", hnsc_core::router::RuleTarget::Tool { name: "check_health".into(), args: serde_json::json!({}) });
    router.register_tool_meta("check_health", SideEffectClass::Read, 0.0);

    let breaker = CircuitBreakerRegistry::new(BreakerSettings {
        fail_threshold: config.breaker.fail_threshold,
        window: config.breaker.window,
        cooldown: config.breaker.cooldown,
    });

    let workflow_engine = WorkflowEngine::new(Arc::new(EchoToolExecutor { registry_tools: tool_names.clone() }), config.workflow.cancel_grace);

    let retriever = Retriever::new(
        Arc::new(NullEmbeddingService),
        Arc::new(EmptyVectorStore),
        None,
        config.retrieval.query_expansion,
        config.retrieval.max_expansions,
        config.retrieval.rerank_enabled,
        config.retrieval.rerank_top_k,
    );

    let mut mode_scope_tags = HashMap::new();
    for (mode, scopes) in &config.mode_scope_tags {
        mode_scope_tags.insert(mode.clone(), scopes.iter().cloned().collect::<HashSet<_>>());
    }

    let safety = SafetyPolicy::new(config.safety.profile, PiiFilter::new(config.safety.profile, vec![]), mode_scope_tags);

    let dual_model = DualModelDriver::new(
        Arc::new(PlaceholderGenerator),
        if config.retrieval.enabled { Some(Arc::new(retriever)) } else { None },
        config.arbitration.consensus_threshold,
        safety.clone(),
        Arc::new(TiktokenCounter::cl100k()),
        8000,
        config.retrieval.token_budget,
    );

    let policy_gateway = PolicyGateway::new(
        PolicyRuleSet {
            version: "v1".to_string(),
            capabilities: tool_names
                .iter()
                .map(|name| hnsc_core::policy_gateway::RoleCapability { role: "*".to_string(), tool: name.clone(), allowed: true })
                .collect(),
            base_risk: HashMap::new(),
            modifiers: vec![],
        },
        Duration::from_secs(config.policy.ttl_seconds),
    );

    let audit = AuditSink::open(&config.audit.dir, &config.audit.streams)?;

    Ok(HnscController {
        rate_limiter: RateLimiter::new(RateLimitSettings { capacity: config.rate_limit.capacity, refill_per_sec: config.rate_limit.refill_per_sec }),
        pii_filter: PiiFilter::new(config.safety.profile, vec![]),
        safety,
        router,
        registry,
        workflow_engine,
        dual_model,
        policy_gateway,
        audit,
        tool_handler: Arc::new(EchoToolHandler),
        breaker,
        risk_threshold: 0.7,
    })
}
