//! C9 — Symbolic Router. Deterministic, non-LLM intent classifier: a
//! layered evaluator of ordered passes with confidence scores, applied to
//! exact-phrase, regex, and keyword matching against the Tool Registry.

use std::collections::HashMap;

use regex::Regex;
use thiserror::Error;

use crate::types::{Mode, SideEffectClass};

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("router misconfigured: {0}")]
    Misconfigured(String),
}

#[derive(Debug, Clone)]
pub enum Disposition {
    Workflow { name: String, binding: serde_json::Value },
    Tool { name: String, args: serde_json::Value },
    Generate { prompt: String, hints: Vec<String> },
}

#[derive(Debug, Clone)]
pub struct ExactRule {
    pub phrase: String,
    pub target: RuleTarget,
}

#[derive(Debug, Clone)]
pub struct RegexRule {
    pub pattern: Regex,
    pub target: RuleTarget,
}

#[derive(Debug, Clone)]
pub enum RuleTarget {
    Tool { name: String, args: serde_json::Value },
    Workflow { name: String, binding: serde_json::Value },
}

#[derive(Debug, Clone, Copy)]
struct ToolMeta {
    side_effect_class: SideEffectClass,
    risk_weight: f64,
}

pub struct SymbolicRouter {
    exact_rules: Vec<ExactRule>,
    regex_rules: Vec<RegexRule>,
    /// tool/workflow name -> bag-of-words keyword dictionary
    keyword_dicts: HashMap<String, Vec<String>>,
    keyword_targets: HashMap<String, RuleTarget>,
    tool_meta: HashMap<String, ToolMeta>,
}

#[derive(Debug, Clone)]
struct ScoredCandidate {
    name: String,
    confidence: f64,
    target: RuleTarget,
}

impl SymbolicRouter {
    pub fn new() -> Self {
        Self {
            exact_rules: Vec::new(),
            regex_rules: Vec::new(),
            keyword_dicts: HashMap::new(),
            keyword_targets: HashMap::new(),
            tool_meta: HashMap::new(),
        }
    }

    pub fn add_exact_rule(&mut self, phrase: impl Into<String>, target: RuleTarget) {
        self.exact_rules.push(ExactRule { phrase: phrase.into(), target });
    }

    pub fn add_regex_rule(&mut self, pattern: Regex, target: RuleTarget) {
        self.regex_rules.push(RegexRule { pattern, target });
    }

    pub fn add_keyword_rule(&mut self, name: impl Into<String>, keywords: Vec<String>, target: RuleTarget) {
        let name = name.into();
        self.keyword_dicts.insert(name.clone(), keywords);
        self.keyword_targets.insert(name, target);
    }

    pub fn register_tool_meta(&mut self, name: impl Into<String>, side_effect_class: SideEffectClass, risk_weight: f64) {
        self.tool_meta.insert(name.into(), ToolMeta { side_effect_class, risk_weight });
    }

    /// Selection uses a priority-ordered rule set: exact phrase, then
    /// anchored regex, then keyword bag-of-words.
    pub fn route(&self, text: &str, _mode: Mode) -> Disposition {
        let normalized = text.trim();

        for rule in &self.exact_rules {
            if rule.phrase.eq_ignore_ascii_case(normalized) {
                return self.disposition_for(rule.target.clone(), 1.0, Vec::new());
            }
        }

        for rule in &self.regex_rules {
            if rule.pattern.is_match(normalized) {
                return self.disposition_for(rule.target.clone(), 1.0, Vec::new());
            }
        }

        let tokens = tokenize(normalized);
        let mut candidates: Vec<ScoredCandidate> = Vec::new();
        for (name, keywords) in &self.keyword_dicts {
            if keywords.is_empty() {
                continue;
            }
            let hits = keywords.iter().filter(|k| tokens.contains(&k.to_lowercase())).count();
            let confidence = hits as f64 / keywords.len() as f64;
            if confidence > 0.0 {
                if let Some(target) = self.keyword_targets.get(name) {
                    candidates.push(ScoredCandidate { name: name.clone(), confidence, target: target.clone() });
                }
            }
        }

        let best = self.best_candidate(candidates);

        match best {
            Some(candidate) if candidate.confidence >= 0.8 => {
                self.disposition_for(candidate.target, candidate.confidence, Vec::new())
            }
            Some(candidate) if candidate.confidence >= 0.5 => Disposition::Generate {
                prompt: text.to_string(),
                hints: vec![candidate.name],
            },
            _ => Disposition::Generate { prompt: text.to_string(), hints: Vec::new() },
        }
    }

    /// Ties broken by (a) lower side-effect class, (b) lower risk weight,
    /// (c) lexicographic tool name.
    fn best_candidate(&self, mut candidates: Vec<ScoredCandidate>) -> Option<ScoredCandidate> {
        if candidates.is_empty() {
            return None;
        }
        let max_confidence = candidates.iter().map(|c| c.confidence).fold(f64::MIN, f64::max);
        candidates.retain(|c| (c.confidence - max_confidence).abs() < 1e-9);
        candidates.sort_by(|a, b| {
            let meta_a = self.tool_meta.get(&a.name);
            let meta_b = self.tool_meta.get(&b.name);
            let sec_a = meta_a.map(|m| m.side_effect_class).unwrap_or(SideEffectClass::None);
            let sec_b = meta_b.map(|m| m.side_effect_class).unwrap_or(SideEffectClass::None);
            sec_a
                .cmp(&sec_b)
                .then_with(|| {
                    let risk_a = meta_a.map(|m| m.risk_weight).unwrap_or(0.0);
                    let risk_b = meta_b.map(|m| m.risk_weight).unwrap_or(0.0);
                    risk_a.partial_cmp(&risk_b).unwrap_or(std::cmp::Ordering::Equal)
                })
                .then_with(|| a.name.cmp(&b.name))
        });
        candidates.into_iter().next()
    }

    fn disposition_for(&self, target: RuleTarget, confidence: f64, hints: Vec<String>) -> Disposition {
        match target {
            RuleTarget::Tool { name, args } => {
                if confidence >= 0.8 {
                    Disposition::Tool { name, args }
                } else {
                    Disposition::Generate { prompt: name, hints }
                }
            }
            RuleTarget::Workflow { name, binding } => {
                if confidence >= 0.8 {
                    Disposition::Workflow { name, binding }
                } else {
                    Disposition::Generate { prompt: name, hints }
                }
            }
        }
    }
}

impl Default for SymbolicRouter {
    fn default() -> Self {
        Self::new()
    }
}

fn tokenize(text: &str) -> std::collections::HashSet<String> {
    text.split_whitespace().map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn exact_match_wins_with_full_confidence() {
        let mut router = SymbolicRouter::new();
        router.add_exact_rule("check_health", RuleTarget::Tool { name: "check_health".into(), args: json!({}) });
        let disposition = router.route("check_health", Mode::Mcp);
        assert!(matches!(disposition, Disposition::Tool { name, .. } if name == "check_health"));
    }

    #[test]
    fn low_confidence_keyword_match_falls_to_generate() {
        let mut router = SymbolicRouter::new();
        router.add_keyword_rule(
            "diagnose",
            vec!["system".into(), "status".into(), "logs".into(), "summarize".into()],
            RuleTarget::Workflow { name: "diagnose".into(), binding: json!({}) },
        );
        let disposition = router.route("tell me about logs", Mode::Debug);
        assert!(matches!(disposition, Disposition::Generate { .. }));
    }

    #[test]
    fn boundary_confidence_0_8_is_inclusive() {
        let mut router = SymbolicRouter::new();
        router.add_keyword_rule(
            "greet",
            vec!["hello".into(), "there".into(), "world".into(), "friend".into(), "today".into()],
            RuleTarget::Tool { name: "greet".into(), args: json!({}) },
        );
        // four of five keywords hit => confidence exactly 0.8
        let disposition = router.route("hello there world friend", Mode::General);
        assert!(matches!(disposition, Disposition::Tool { name, .. } if name == "greet"));
    }

    #[test]
    fn no_match_defaults_to_generate() {
        let router = SymbolicRouter::new();
        let disposition = router.route("what is the meaning of life", Mode::General);
        assert!(matches!(disposition, Disposition::Generate { .. }));
    }
}
