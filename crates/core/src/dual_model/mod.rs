//! C12 — Dual-Model Driver. Two-pass generation with retrieval grounding
//! and arbitration: a reasoner pass followed by a critic pass, scored
//! against each other through the Arbitration Engine. Token accounting
//! goes through a `TokenCounter` trait so the usage forecaster stays
//! backend-agnostic, and the rolling usage history is kept as a bounded
//! ring buffer rather than a growing array.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::arbitration::{ArbitrationEngine, ArbitrationOutcome};
use crate::retriever::Retriever;
use crate::safety::SafetyPolicy;
use crate::types::RetrievalRequest;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("generator unavailable: {0}")]
    GeneratorUnavailable(String),
}

#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, system_prompt: &str, user_prompt: &str) -> Result<String, String>;
}

pub trait TokenCounter: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;
}

pub struct TiktokenCounter {
    bpe: tiktoken_rs::CoreBPE,
}

impl TiktokenCounter {
    pub fn cl100k() -> Self {
        Self { bpe: tiktoken_rs::cl100k_base().expect("bundled cl100k ranks") }
    }
}

impl TokenCounter for TiktokenCounter {
    fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }
}

const HISTORY_CAPACITY: usize = 20;

#[derive(Debug, Clone, Copy)]
struct UsageSample {
    tokens_in: usize,
    tokens_out: usize,
    latency: Duration,
}

/// A bounded ring buffer of the last 20 request samples, used to forecast
/// whether a new request's projected usage will exceed budget.
pub struct TokenBudgetForecaster {
    history: parking_lot::Mutex<VecDeque<UsageSample>>,
    per_request_budget: usize,
}

impl TokenBudgetForecaster {
    pub fn new(per_request_budget: usize) -> Self {
        Self { history: parking_lot::Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY)), per_request_budget }
    }

    fn record(&self, tokens_in: usize, tokens_out: usize, latency: Duration) {
        let mut history = self.history.lock();
        if history.len() == HISTORY_CAPACITY {
            history.pop_front();
        }
        history.push_back(UsageSample { tokens_in, tokens_out, latency });
    }

    /// `margin` is a caller-provided fraction, clamped to `[0, 0.5]`.
    /// Returns `true` if the projected total
    /// (current input plus the historical average output, inflated by
    /// `margin`) would exceed `per_request_budget`.
    pub fn forecast_usage(&self, current_input: usize, margin: f64) -> bool {
        let margin = margin.clamp(0.0, 0.5);
        let history = self.history.lock();
        let avg_out = if history.is_empty() {
            0.0
        } else {
            history.iter().map(|s| s.tokens_out as f64).sum::<f64>() / history.len() as f64
        };
        let projected = current_input as f64 + avg_out * (1.0 + margin);
        projected > self.per_request_budget as f64
    }
}

pub struct DualModelResult {
    pub text: String,
    pub arbitration: ArbitrationOutcome,
    pub context_used: bool,
}

pub struct DualModelDriver {
    generator: Arc<dyn Generator>,
    retriever: Option<Arc<Retriever>>,
    arbitration: ArbitrationEngine,
    safety: SafetyPolicy,
    token_counter: Arc<dyn TokenCounter>,
    forecaster: TokenBudgetForecaster,
    context_token_budget: usize,
}

impl DualModelDriver {
    pub fn new(
        generator: Arc<dyn Generator>,
        retriever: Option<Arc<Retriever>>,
        consensus_threshold: f64,
        safety: SafetyPolicy,
        token_counter: Arc<dyn TokenCounter>,
        per_request_budget: usize,
        context_token_budget: usize,
    ) -> Self {
        Self {
            generator,
            retriever,
            arbitration: ArbitrationEngine::new(consensus_threshold),
            safety,
            token_counter,
            forecaster: TokenBudgetForecaster::new(per_request_budget),
            context_token_budget,
        }
    }

    pub async fn run(&self, prompt: &str, retrieval_enabled_for_mode: bool) -> Result<DualModelResult, DriverError> {
        let start = std::time::Instant::now();

        let (context, context_used) = if retrieval_enabled_for_mode {
            if let Some(retriever) = &self.retriever {
                let req = RetrievalRequest { query: prompt.to_string(), top_k: 8, token_budget: self.context_token_budget, filter: None };
                let result = retriever.retrieve(&req).await;
                let used = !result.documents.is_empty();
                let joined = result.documents.iter().map(|d| d.text.clone()).collect::<Vec<_>>().join("\n---\n");
                (joined, used)
            } else {
                (String::new(), false)
            }
        } else {
            (String::new(), false)
        };

        let grounded_prompt = if context.is_empty() { prompt.to_string() } else { format!("Context:\n{context}\n\nQuestion: {prompt}") };

        let candidate_a = self
            .generator
            .generate("You are a careful reasoner. Answer precisely and factually.", &grounded_prompt)
            .await
            .map_err(DriverError::GeneratorUnavailable)?;

        let critic_prompt = format!("Original answer:\n{candidate_a}\n\nQuestion: {prompt}");
        let candidate_b = self
            .generator
            .generate("You are a skeptical critic. Review and, if needed, correct the original answer.", &critic_prompt)
            .await
            .map_err(DriverError::GeneratorUnavailable)?;

        let a_safety = self.safety.assess_candidate(&candidate_a);
        let b_safety = self.safety.assess_candidate(&candidate_b);
        let a_failed_safety = a_safety.policy_hit;
        let b_failed_safety = b_safety.policy_hit;

        let outcome = self.arbitration.arbitrate(&candidate_a, &candidate_b, a_safety, b_safety, a_failed_safety, b_failed_safety);

        let text = match &outcome.chosen {
            Some(crate::arbitration::Chosen::A) => candidate_a.clone(),
            Some(crate::arbitration::Chosen::B) => candidate_b.clone(),
            Some(crate::arbitration::Chosen::Synthesized(s)) => s.clone(),
            None => String::new(),
        };

        let tokens_in = self.token_counter.count_tokens(&grounded_prompt);
        let tokens_out = self.token_counter.count_tokens(&text);
        self.forecaster.record(tokens_in, tokens_out, start.elapsed());

        Ok(DualModelResult { text, arbitration: outcome, context_used })
    }

    pub fn forecast_usage(&self, current_input_tokens: usize, margin: f64) -> bool {
        self.forecaster.forecast_usage(current_input_tokens, margin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoGenerator;
    #[async_trait]
    impl Generator for EchoGenerator {
        async fn generate(&self, _system: &str, user: &str) -> Result<String, String> {
            Ok(format!("echo: {user}"))
        }
    }

    struct WordCounter;
    impl TokenCounter for WordCounter {
        fn count_tokens(&self, text: &str) -> usize {
            text.split_whitespace().count()
        }
    }

    fn test_safety() -> SafetyPolicy {
        SafetyPolicy::new(
            crate::config::SafetyProfile::Production,
            crate::pii::PiiFilter::new(crate::config::SafetyProfile::Production, vec![]),
            std::collections::HashMap::new(),
        )
    }

    #[tokio::test]
    async fn runs_two_pass_pipeline_without_retrieval() {
        let driver = DualModelDriver::new(Arc::new(EchoGenerator), None, 0.85, test_safety(), Arc::new(WordCounter), 10_000, 2000);
        let result = driver.run("what time is it", false).await.unwrap();
        assert!(!result.context_used);
        assert!(!result.text.is_empty());
    }

    #[test]
    fn forecaster_flags_projected_overrun() {
        let forecaster = TokenBudgetForecaster::new(100);
        for _ in 0..5 {
            forecaster.record(10, 200, Duration::from_millis(1));
        }
        assert!(forecaster.forecast_usage(50, 0.1));
    }

    #[test]
    fn forecaster_with_no_history_uses_input_only() {
        let forecaster = TokenBudgetForecaster::new(100);
        assert!(!forecaster.forecast_usage(50, 0.1));
        assert!(forecaster.forecast_usage(150, 0.1));
    }

    #[test]
    fn history_is_bounded_to_20_samples() {
        let forecaster = TokenBudgetForecaster::new(100_000);
        for i in 0..50 {
            forecaster.record(i, i, Duration::from_millis(1));
        }
        assert_eq!(forecaster.history.lock().len(), HISTORY_CAPACITY);
    }
}
