//! C11 — Arbitration Engine. Reconciles two candidate generator outputs
//! into one response under safety constraints: a deterministic, non-LLM
//! comparison of two strings scored for consensus, with a safety-score
//! tie-break and a synthesized fallback when they diverge.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chosen {
    A,
    B,
    Synthesized(String),
}

#[derive(Debug, Clone)]
pub struct SafetyScore {
    pub redaction_count: u32,
    pub policy_hit: bool,
}

impl SafetyScore {
    /// Higher is safer: no policy hit and fewer redactions.
    fn score(&self) -> f64 {
        let base = if self.policy_hit { 0.0 } else { 1.0 };
        base - (self.redaction_count as f64 * 0.01)
    }
}

#[derive(Debug, Clone)]
pub struct ArbitrationOutcome {
    pub consensus: bool,
    pub chosen: Option<Chosen>,
    pub similarity: f64,
    pub reasons: Vec<String>,
}

fn tokenize(text: &str) -> Vec<String> {
    text.split_whitespace().map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase()).collect()
}

fn jaccard(a: &[String], b: &[String]) -> f64 {
    use std::collections::HashSet;
    let sa: HashSet<&String> = a.iter().collect();
    let sb: HashSet<&String> = b.iter().collect();
    if sa.is_empty() && sb.is_empty() {
        return 0.0;
    }
    let inter = sa.intersection(&sb).count() as f64;
    let union = sa.union(&sb).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Ratnaparkhi-style token-sequence ratio: `2M / T` where `M` is matching
/// tokens found by a greedy longest-common-subsequence-like walk and `T`
/// is the total token count of both sequences — the same shape as
/// Python's `difflib.SequenceMatcher.ratio()`, computed here over tokens
/// rather than characters since we are comparing generated prose.
fn token_sequence_ratio(a: &[String], b: &[String]) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let matches = lcs_len(a, b);
    (2 * matches) as f64 / (a.len() + b.len()) as f64
}

fn lcs_len(a: &[String], b: &[String]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for i in 1..=a.len() {
        for j in 1..=b.len() {
            curr[j] = if a[i - 1] == b[j - 1] { prev[j - 1] + 1 } else { prev[j].max(curr[j - 1]) };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

fn common_prefix(a: &str, b: &str) -> String {
    let a_words: Vec<&str> = a.split_whitespace().collect();
    let b_words: Vec<&str> = b.split_whitespace().collect();
    let mut prefix = Vec::new();
    for (wa, wb) in a_words.iter().zip(b_words.iter()) {
        if wa == wb {
            prefix.push(*wa);
        } else {
            break;
        }
    }
    prefix.join(" ")
}

pub struct ArbitrationEngine {
    consensus_threshold: f64,
}

impl ArbitrationEngine {
    pub fn new(consensus_threshold: f64) -> Self {
        Self { consensus_threshold }
    }

    /// `a_failed_safety`/`b_failed_safety` are the egress-safety
    /// verdicts for each candidate; a failing candidate is discarded
    /// before scoring.
    pub fn arbitrate(
        &self,
        a: &str,
        b: &str,
        a_safety: SafetyScore,
        b_safety: SafetyScore,
        a_failed_safety: bool,
        b_failed_safety: bool,
    ) -> ArbitrationOutcome {
        if a_failed_safety && b_failed_safety {
            return ArbitrationOutcome { consensus: false, chosen: None, similarity: 0.0, reasons: vec!["both_failed_safety".into()] };
        }
        if a_failed_safety {
            return ArbitrationOutcome { consensus: false, chosen: Some(Chosen::B), similarity: 0.0, reasons: vec!["a_failed_safety".into()] };
        }
        if b_failed_safety {
            return ArbitrationOutcome { consensus: false, chosen: Some(Chosen::A), similarity: 0.0, reasons: vec!["b_failed_safety".into()] };
        }

        let ta = tokenize(a);
        let tb = tokenize(b);
        let similarity = token_sequence_ratio(&ta, &tb).max(jaccard(&ta, &tb));
        let consensus = similarity >= self.consensus_threshold;

        let score_a = a_safety.score();
        let score_b = b_safety.score();

        let (chosen, reasons) = if consensus {
            if score_a >= score_b {
                (Chosen::A, vec!["consensus".into()])
            } else {
                (Chosen::B, vec!["consensus".into(), "b_safer".into()])
            }
        } else if score_a > score_b {
            (Chosen::A, vec!["a_safer".into()])
        } else if score_b > score_a {
            (Chosen::B, vec!["b_safer".into()])
        } else {
            let prefix = common_prefix(a, b);
            let synthesized = format!("{prefix} [responses diverged; showing the agreed portion only]").trim().to_string();
            (Chosen::Synthesized(synthesized), vec!["tied_safety_score".into(), "divergent".into()])
        };

        ArbitrationOutcome { consensus, chosen: Some(chosen), similarity, reasons }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn safe() -> SafetyScore {
        SafetyScore { redaction_count: 0, policy_hit: false }
    }

    #[test]
    fn consensus_on_near_identical_text() {
        let engine = ArbitrationEngine::new(0.85);
        let outcome = engine.arbitrate("The answer is 42.", "The answer is forty-two.", safe(), safe(), false, false);
        assert!(outcome.consensus);
        assert_eq!(outcome.chosen, Some(Chosen::A));
    }

    #[test]
    fn divergence_with_tie_synthesizes() {
        let engine = ArbitrationEngine::new(0.85);
        let outcome = engine.arbitrate("The sky is blue today", "Bananas are yellow fruit", safe(), safe(), false, false);
        assert!(!outcome.consensus);
        assert!(matches!(outcome.chosen, Some(Chosen::Synthesized(_))));
    }

    #[test]
    fn both_failing_safety_yields_no_chosen_candidate() {
        let engine = ArbitrationEngine::new(0.85);
        let outcome = engine.arbitrate("a", "b", safe(), safe(), true, true);
        assert!(!outcome.consensus);
        assert!(outcome.chosen.is_none());
        assert_eq!(outcome.reasons, vec!["both_failed_safety".to_string()]);
    }

    #[test]
    fn empty_candidates_have_zero_similarity() {
        let engine = ArbitrationEngine::new(0.85);
        let outcome = engine.arbitrate("", "", safe(), safe(), false, false);
        assert_eq!(outcome.similarity, 0.0);
    }

    #[test]
    fn deterministic_given_same_inputs() {
        let engine = ArbitrationEngine::new(0.85);
        let o1 = engine.arbitrate("hello world", "hello there", safe(), safe(), false, false);
        let o2 = engine.arbitrate("hello world", "hello there", safe(), safe(), false, false);
        assert_eq!(o1.similarity, o2.similarity);
        assert_eq!(o1.chosen, o2.chosen);
    }
}
