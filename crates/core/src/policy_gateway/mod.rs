//! C14 — Policy Gateway. Versioned policy lookup and risk scoring that
//! gates sensitive actions. The built-in evaluator here is deny-by-default
//! and fails closed on any evaluation error; behind the `cedar` feature,
//! `PolicyGateway::with_cedar_evaluator` substitutes a formal
//! Cedar-backed evaluator without changing this module's public surface.
//! Content addressing reuses the Audit Sink's canonical encoder, and the
//! decision cache follows the same keyed, TTL-bounded shape used
//! elsewhere in this crate for read-mostly state.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::audit::canonicalize;
use crate::types::PolicyDecision;

#[derive(Debug, Error)]
pub enum PolicyError {
    #[error("policy evaluation failed: {0}")]
    EvaluationFailed(String),
}

/// `role = "*"` matches any actor, for tools that are allowed
/// regardless of who calls them.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RoleCapability {
    pub role: String,
    pub tool: String,
    pub allowed: bool,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ContextModifier {
    pub predicate_key: String,
    pub predicate_value: serde_json::Value,
    pub risk_delta: f64,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct PolicyRuleSet {
    pub version: String,
    pub capabilities: Vec<RoleCapability>,
    pub base_risk: HashMap<String, f64>,
    pub modifiers: Vec<ContextModifier>,
}

impl PolicyRuleSet {
    pub fn checksum(&self) -> String {
        let value = serde_json::to_value(self).expect("rule set serializes");
        let mut hasher = Sha256::new();
        hasher.update(canonicalize(&value).as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[derive(Clone)]
struct CachedDecision {
    decision: PolicyDecision,
    cached_at: Instant,
}

/// Read-mostly with versioned invalidation: the cache is keyed
/// by `(actor, tool, context_fingerprint)` and entirely dropped on a
/// version bump rather than invalidated entry-by-entry.
pub struct PolicyGateway {
    active: parking_lot::RwLock<Arc<PolicyRuleSet>>,
    cache: DashMap<String, CachedDecision>,
    ttl: Duration,
    #[cfg(feature = "cedar")]
    cedar_enabled: bool,
}

impl PolicyGateway {
    pub fn new(initial: PolicyRuleSet, ttl: Duration) -> Self {
        Self {
            active: parking_lot::RwLock::new(Arc::new(initial)),
            cache: DashMap::new(),
            ttl,
            #[cfg(feature = "cedar")]
            cedar_enabled: false,
        }
    }

    /// Same as `new`, but authorizes through the formal Cedar evaluator
    /// instead of the built-in linear scan. Only available behind the
    /// `cedar` feature.
    #[cfg(feature = "cedar")]
    pub fn with_cedar_evaluator(initial: PolicyRuleSet, ttl: Duration) -> Self {
        Self { active: parking_lot::RwLock::new(Arc::new(initial)), cache: DashMap::new(), ttl, cedar_enabled: true }
    }

    pub fn active_version(&self) -> String {
        self.active.read().version.clone()
    }

    fn fingerprint(&self, actor: &str, tool: &str, context: &serde_json::Value) -> String {
        let mut hasher = Sha256::new();
        hasher.update(actor.as_bytes());
        hasher.update(tool.as_bytes());
        hasher.update(canonicalize(context).as_bytes());
        hex::encode(hasher.finalize())
    }

    /// In-flight requests complete under the version they started with
    /// (snapshot isolation): callers that need a stable view across a
    /// request should call `snapshot()` once and reuse it rather than
    /// calling `decide` repeatedly against the live `active` pointer.
    pub fn snapshot(&self) -> Arc<PolicyRuleSet> {
        self.active.read().clone()
    }

    pub fn decide(&self, actor: &str, tool: &str, context: &serde_json::Value) -> PolicyDecision {
        self.decide_against(&self.snapshot(), actor, tool, context)
    }

    pub fn decide_against(&self, rules: &Arc<PolicyRuleSet>, actor: &str, tool: &str, context: &serde_json::Value) -> PolicyDecision {
        let fingerprint = format!("{}:{}", rules.version, self.fingerprint(actor, tool, context));

        if let Some(cached) = self.cache.get(&fingerprint) {
            if cached.cached_at.elapsed() < self.ttl {
                return cached.decision.clone();
            }
        }

        #[cfg(feature = "cedar")]
        let decision = if self.cedar_enabled { cedar_eval::evaluate(rules, actor, tool, context) } else { evaluate(rules, actor, tool, context) };
        #[cfg(not(feature = "cedar"))]
        let decision = evaluate(rules, actor, tool, context);

        self.cache.insert(fingerprint, CachedDecision { decision: decision.clone(), cached_at: Instant::now() });
        decision
    }

    /// A policy change appends a `policy.version` audit event (the caller
    /// is responsible for calling the Audit Sink — the gateway only
    /// returns the checksum to put in that event) and drops the decision
    /// cache, since it is keyed by version already; this just avoids
    /// keeping stale memory around.
    pub fn activate(&mut self, new_rules: PolicyRuleSet) -> String {
        let checksum = new_rules.checksum();
        *self.active.write() = Arc::new(new_rules);
        self.cache.clear();
        checksum
    }

    /// Returns a diff/impact report without mutating runtime state unless
    /// `dry_run == false`. Fingerprints are one-way hashes of
    /// `(actor, tool, context)`, so the report can only state how many
    /// cached decisions are in scope for the new version, not replay them
    /// against `candidate` — a real impact diff needs the gateway's
    /// caller to resubmit the underlying `(actor, tool, context)` triples.
    pub fn migrate(&mut self, candidate: PolicyRuleSet, dry_run: bool) -> MigrationReport {
        let candidate = Arc::new(candidate);
        let fingerprints_considered = self.cache.len();

        let report = MigrationReport { from_version: self.active_version(), to_version: candidate.version.clone(), fingerprints_considered };

        if !dry_run {
            self.active = parking_lot::RwLock::new(candidate);
            self.cache.clear();
        }

        report
    }
}

#[derive(Debug, Clone)]
pub struct MigrationReport {
    pub from_version: String,
    pub to_version: String,
    pub fingerprints_considered: usize,
}

#[cfg(feature = "cedar")]
mod cedar_eval {
    use std::str::FromStr;

    use cedar_policy::{Authorizer, Context, Decision, Entities, EntityId, EntityTypeName, EntityUid, PolicySet, Request};

    use super::PolicyRuleSet;
    use crate::types::PolicyDecision;

    /// Formal alternative to the built-in linear-scan evaluator: synthesizes
    /// a Cedar `PolicySet` from the rule set's capabilities (one
    /// `permit`/`forbid` statement per role+tool pair) and authorizes
    /// through the real Cedar `Authorizer`. Risk scoring is unaffected —
    /// Cedar has no native notion of a numeric risk score, so `base_risk`
    /// and `modifiers` are applied the same way as the built-in evaluator.
    pub fn evaluate(rules: &PolicyRuleSet, actor: &str, tool: &str, context: &serde_json::Value) -> PolicyDecision {
        let mut reasons = Vec::new();

        let allowed = match authorize(rules, actor, tool) {
            Ok(decision) => decision,
            Err(e) => {
                reasons.push(format!("cedar evaluation error: {e}"));
                false
            }
        };
        if !allowed && reasons.is_empty() {
            reasons.push(format!("cedar denied actor={actor} tool={tool}"));
        }

        let mut risk = *rules.base_risk.get(tool).unwrap_or(&0.1);
        for modifier in &rules.modifiers {
            if let Some(value) = context.get(&modifier.predicate_key) {
                if *value == modifier.predicate_value {
                    risk += modifier.risk_delta;
                    reasons.push(format!("modifier:{}", modifier.predicate_key));
                }
            }
        }
        risk = risk.clamp(0.0, 1.0);

        PolicyDecision { allowed, risk, reasons, version: rules.version.clone() }
    }

    fn authorize(rules: &PolicyRuleSet, actor: &str, tool: &str) -> Result<bool, String> {
        let source: String = rules
            .capabilities
            .iter()
            .map(|c| {
                let effect = if c.allowed { "permit" } else { "forbid" };
                let principal = if c.role == "*" { "principal".to_string() } else { format!("principal == Role::\"{}\"", c.role) };
                format!("{effect}({principal}, action == Action::\"{}\", resource);", c.tool)
            })
            .collect::<Vec<_>>()
            .join("\n");

        let policy_set: PolicySet = source.parse().map_err(|e| format!("policy parse error: {e}"))?;

        let principal = entity_uid("Role", actor)?;
        let action = entity_uid("Action", tool)?;
        let resource = entity_uid("Resource", "default")?;

        let request = Request::new(principal, action, resource, Context::empty(), None).map_err(|e| e.to_string())?;
        let authorizer = Authorizer::new();
        let response = authorizer.is_authorized(&request, &policy_set, &Entities::empty());
        Ok(matches!(response.decision(), Decision::Allow))
    }

    fn entity_uid(type_name: &str, id: &str) -> Result<EntityUid, String> {
        let entity_type = EntityTypeName::from_str(type_name).map_err(|e| e.to_string())?;
        let entity_id = EntityId::from_str(id).map_err(|e| e.to_string())?;
        Ok(EntityUid::from_type_name_and_id(entity_type, entity_id))
    }
}

fn evaluate(rules: &PolicyRuleSet, actor: &str, tool: &str, context: &serde_json::Value) -> PolicyDecision {
    let mut reasons = Vec::new();

    let allowed = rules
        .capabilities
        .iter()
        .find(|c| (c.role == actor || c.role == "*") && c.tool == tool)
        .map(|c| c.allowed)
        .unwrap_or(false);

    if !allowed {
        reasons.push(format!("no allow rule for actor={actor} tool={tool}"));
    }

    let mut risk = *rules.base_risk.get(tool).unwrap_or(&0.1);
    for modifier in &rules.modifiers {
        if let Some(value) = context.get(&modifier.predicate_key) {
            if *value == modifier.predicate_value {
                risk += modifier.risk_delta;
                reasons.push(format!("modifier:{}", modifier.predicate_key));
            }
        }
    }
    risk = risk.clamp(0.0, 1.0);

    PolicyDecision { allowed, risk, reasons, version: rules.version.clone() }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rules() -> PolicyRuleSet {
        PolicyRuleSet {
            version: "v1".into(),
            capabilities: vec![RoleCapability { role: "alice".into(), tool: "delete_account".into(), allowed: true }],
            base_risk: HashMap::from([("delete_account".to_string(), 0.5)]),
            modifiers: vec![ContextModifier { predicate_key: "bulk".into(), predicate_value: json!(true), risk_delta: 0.4 }],
        }
    }

    #[test]
    fn allows_known_capability() {
        let gw = PolicyGateway::new(rules(), Duration::from_secs(60));
        let decision = gw.decide("alice", "delete_account", &json!({}));
        assert!(decision.allowed);
    }

    #[test]
    fn denies_unknown_capability() {
        let gw = PolicyGateway::new(rules(), Duration::from_secs(60));
        let decision = gw.decide("mallory", "delete_account", &json!({}));
        assert!(!decision.allowed);
    }

    #[test]
    fn wildcard_role_allows_any_actor() {
        let mut rules = rules();
        rules.capabilities.push(RoleCapability { role: "*".into(), tool: "check_health".into(), allowed: true });
        let gw = PolicyGateway::new(rules, Duration::from_secs(60));
        assert!(gw.decide("anyone", "check_health", &json!({})).allowed);
        assert!(gw.decide("someone_else", "check_health", &json!({})).allowed);
    }

    #[test]
    fn risk_modifier_applies_and_clamps() {
        let gw = PolicyGateway::new(rules(), Duration::from_secs(60));
        let decision = gw.decide("alice", "delete_account", &json!({"bulk": true}));
        assert!(decision.risk > 0.5);
        assert!(decision.risk <= 1.0);
    }

    #[test]
    fn cache_invalidated_on_version_bump() {
        let mut gw = PolicyGateway::new(rules(), Duration::from_secs(60));
        let d1 = gw.decide("alice", "delete_account", &json!({}));
        assert!(d1.allowed);
        let mut v2 = rules();
        v2.version = "v2".into();
        v2.capabilities.clear();
        gw.activate(v2);
        let d2 = gw.decide("alice", "delete_account", &json!({}));
        assert!(!d2.allowed);
    }

    #[cfg(feature = "cedar")]
    #[test]
    fn cedar_evaluator_honors_same_capabilities() {
        let gw = PolicyGateway::with_cedar_evaluator(rules(), Duration::from_secs(60));
        assert!(gw.decide("alice", "delete_account", &json!({})).allowed);
        assert!(!gw.decide("mallory", "delete_account", &json!({})).allowed);
    }

    #[test]
    fn dry_run_migration_does_not_mutate_state() {
        let mut gw = PolicyGateway::new(rules(), Duration::from_secs(60));
        gw.decide("alice", "delete_account", &json!({}));
        let mut v2 = rules();
        v2.version = "v2".into();
        let report = gw.migrate(v2, true);
        assert_eq!(report.to_version, "v2");
        assert_eq!(gw.active_version(), "v1");
    }
}
