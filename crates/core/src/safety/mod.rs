//! C8 — Safety Policy. A deny-first predicate evaluated at three
//! checkpoints: ingress, pre-tool, and egress. Every checkpoint fails
//! closed — an evaluation error or ambiguous signal denies rather than
//! admits.

use regex::Regex;
use std::collections::HashSet;
use thiserror::Error;

use crate::arbitration::SafetyScore;
use crate::config::SafetyProfile;
use crate::pii::PiiFilter;
use crate::types::{ApprovalToken, Mode, SideEffectClass, ToolCall};

#[derive(Debug, Error)]
pub enum SafetyError {
    #[error("denied: {0:?}")]
    Denied(Vec<String>),
}

const PROMPT_INJECTION_PATTERNS: &[&str] = &[
    r"(?i)ignore (all )?previous instructions",
    r"(?i)disregard (the )?(system|previous) prompt",
    r"(?i)reveal (the )?system prompt",
    r"(?i)dump (the )?system prompt",
];

const MAX_INGRESS_BYTES: usize = 32 * 1024;

#[derive(Clone)]
pub struct SafetyPolicy {
    profile: SafetyProfile,
    pii_filter: PiiFilter,
    injection_patterns: Vec<Regex>,
    mode_scope_tags: std::collections::HashMap<String, HashSet<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct IngressCheckResult {
    pub allowed: bool,
    pub reasons: Vec<String>,
}

impl SafetyPolicy {
    pub fn new(profile: SafetyProfile, pii_filter: PiiFilter, mode_scope_tags: std::collections::HashMap<String, HashSet<String>>) -> Self {
        let injection_patterns = PROMPT_INJECTION_PATTERNS.iter().map(|p| Regex::new(p).unwrap()).collect();
        Self { profile, pii_filter, injection_patterns, mode_scope_tags }
    }

    pub fn profile(&self) -> SafetyProfile {
        self.profile
    }

    /// Ingress checkpoint: raw input. Deny on prompt-injection-style
    /// phrases, oversized payloads, or unauthenticated access to a
    /// restricted mode (callers pass `authenticated=false` for anonymous
    /// callers attempting `debug`/`mcp`).
    pub fn check_ingress(&self, text: &str, mode: Mode, authenticated: bool) -> IngressCheckResult {
        let mut reasons = Vec::new();

        if text.len() > MAX_INGRESS_BYTES {
            reasons.push("oversized_payload".to_string());
        }
        for pattern in &self.injection_patterns {
            if pattern.is_match(text) {
                reasons.push("prompt_injection".to_string());
                break;
            }
        }
        if matches!(mode, Mode::Debug | Mode::Mcp) && !authenticated {
            reasons.push("unauthenticated_restricted_mode".to_string());
        }

        IngressCheckResult { allowed: reasons.is_empty(), reasons }
    }

    /// Pre-tool checkpoint: candidate `ToolCall`. Deny if the tool's scope
    /// tags are not permitted for the request's mode, or the tool is
    /// `irreversible` without a valid approval token.
    pub fn check_pre_tool(
        &self,
        mode: Mode,
        tool_scope_tags: &std::collections::BTreeSet<String>,
        side_effect_class: SideEffectClass,
        approval: Option<&ApprovalToken>,
    ) -> Result<(), SafetyError> {
        let mut reasons = Vec::new();

        if self.profile != SafetyProfile::Development {
            if let Some(allowed_scopes) = self.mode_scope_tags.get(&mode.to_string()) {
                if !tool_scope_tags.iter().any(|tag| allowed_scopes.contains(tag)) {
                    reasons.push("scope_not_permitted_for_mode".to_string());
                }
            }
        }

        if side_effect_class == SideEffectClass::Irreversible {
            let valid = approval.map(|a| a.is_valid()).unwrap_or(false);
            if !valid {
                reasons.push("approval_required".to_string());
            }
        }

        if reasons.is_empty() {
            Ok(())
        } else {
            Err(SafetyError::Denied(reasons))
        }
    }

    /// Egress checkpoint: assembled response. Deny if it still contains
    /// redactable PII, or Arbitration tagged it `policy_violation`.
    ///
    /// `development` does not fail-closed on PII presence, since the
    /// profile already relaxes `PiiFilter::redact`'s lower-risk detectors.
    pub fn check_egress(&self, text: &str, policy_violation_tagged: bool) -> Result<String, SafetyError> {
        let mut reasons = Vec::new();
        if policy_violation_tagged {
            reasons.push("policy_violation".to_string());
        }
        if self.profile != SafetyProfile::Development && self.pii_filter.contains_pii(text) {
            reasons.push("pii_detected".to_string());
        }
        if !reasons.is_empty() {
            return Err(SafetyError::Denied(reasons));
        }
        Ok(self.pii_filter.redact(text))
    }

    /// Scores a single candidate's egress safety without deciding whether
    /// to deny it, for the Arbitration Engine's per-candidate tie-break.
    pub fn assess_candidate(&self, text: &str) -> SafetyScore {
        SafetyScore { redaction_count: self.pii_filter.count_redactions(text), policy_hit: self.check_egress(text, false).is_err() }
    }

    pub fn is_restricted_tool_call(&self, call: &ToolCall) -> bool {
        call.tool_name.is_empty()
    }
}
