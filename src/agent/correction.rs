//! Correction Detector
//!
//! Looks at the tail of a conversation for a human message that reverses or
//! rejects something an agent just did. The judgement itself comes from a
//! `CorrectionStrategy`; this module owns windowing, evidence bookkeeping and
//! confidence thresholding.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::conversation::{truncate_chars, Author, HistoryEntry};

/// What a strategy reports about a window
///
/// Indices are positions inside the window the strategy was given.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionVerdict {
    pub agent_index: usize,
    pub human_index: usize,
    pub corrected_behavior: String,
    pub confidence: f64,
}

/// Pluggable correction judgement (heuristic or model-backed)
#[async_trait]
pub trait CorrectionStrategy: Send + Sync {
    async fn assess(&self, window: &[HistoryEntry]) -> anyhow::Result<Option<CorrectionVerdict>>;
}

/// A detected correction with its evidence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionPattern {
    pub conversation_id: String,
    /// Pubkey of the agent that was corrected
    pub offending_agent: String,
    pub corrected_behavior: String,
    /// First and last history entry id of the evidence
    pub evidence_span: (String, String),
    pub offending_action: String,
    pub human_correction: String,
}

/// Verdict over one window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectionAnalysis {
    pub found: bool,
    pub pattern: Option<CorrectionPattern>,
    pub confidence: f64,
}

impl CorrectionAnalysis {
    pub fn none() -> Self {
        Self {
            found: false,
            pattern: None,
            confidence: 0.0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DetectorConfig {
    /// Number of most recent history entries inspected
    pub window: usize,
    /// Verdicts below this are treated as no correction
    pub min_confidence: f64,
    pub timeout: Duration,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window: 10,
            min_confidence: 0.6,
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct CorrectionDetector {
    strategy: Arc<dyn CorrectionStrategy>,
    config: DetectorConfig,
}

impl CorrectionDetector {
    pub fn new(strategy: Arc<dyn CorrectionStrategy>, config: DetectorConfig) -> Self {
        Self { strategy, config }
    }

    pub fn window_size(&self) -> usize {
        self.config.window
    }

    /// Inspect the last `window` entries of `history`
    ///
    /// Strategy failures and malformed verdicts are logged and count as no
    /// correction.
    pub async fn detect(&self, conversation_id: &str, history: &[HistoryEntry]) -> CorrectionAnalysis {
        let start = history.len().saturating_sub(self.config.window);
        let window = &history[start..];

        if window.len() < 2 {
            return CorrectionAnalysis::none();
        }

        let verdict = match tokio::time::timeout(self.config.timeout, self.strategy.assess(window)).await {
            Ok(Ok(Some(verdict))) => verdict,
            Ok(Ok(None)) => return CorrectionAnalysis::none(),
            Ok(Err(e)) => {
                warn!("Correction strategy failed for {}: {}", conversation_id, e);
                return CorrectionAnalysis::none();
            }
            Err(_) => {
                warn!(
                    "Correction strategy timed out after {:?} for {}",
                    self.config.timeout, conversation_id
                );
                return CorrectionAnalysis::none();
            }
        };

        let confidence = if verdict.confidence.is_nan() {
            0.0
        } else {
            verdict.confidence.clamp(0.0, 1.0)
        };

        let Some(pattern) = build_pattern(conversation_id, window, &verdict) else {
            warn!(
                "Discarding inconsistent correction verdict for {} (agent {}, human {})",
                conversation_id, verdict.agent_index, verdict.human_index
            );
            return CorrectionAnalysis::none();
        };

        if confidence < self.config.min_confidence {
            debug!(
                "Correction in {} below threshold ({:.2} < {:.2})",
                conversation_id, confidence, self.config.min_confidence
            );
            return CorrectionAnalysis {
                found: false,
                pattern: None,
                confidence,
            };
        }

        CorrectionAnalysis {
            found: true,
            pattern: Some(pattern),
            confidence,
        }
    }
}

fn build_pattern(
    conversation_id: &str,
    window: &[HistoryEntry],
    verdict: &CorrectionVerdict,
) -> Option<CorrectionPattern> {
    if verdict.human_index <= verdict.agent_index {
        return None;
    }
    let agent_entry = window.get(verdict.agent_index)?;
    let human_entry = window.get(verdict.human_index)?;

    let offending_agent = agent_entry.author.agent_pubkey()?;
    if !human_entry.author.is_human() {
        return None;
    }

    let corrected_behavior = if verdict.corrected_behavior.trim().is_empty() {
        human_entry.content.trim().to_string()
    } else {
        verdict.corrected_behavior.trim().to_string()
    };

    Some(CorrectionPattern {
        conversation_id: conversation_id.to_string(),
        offending_agent: offending_agent.to_string(),
        corrected_behavior,
        evidence_span: (agent_entry.id.clone(), human_entry.id.clone()),
        offending_action: agent_entry.content.clone(),
        human_correction: human_entry.content.clone(),
    })
}

// Phrases that almost always mean "you got it wrong"
const STRONG_MARKERS: &[&str] = &[
    "that's wrong",
    "that is wrong",
    "not what i asked",
    "not what i meant",
    "i said",
    "don't do that",
    "do not do that",
    "undo",
    "revert",
    "you shouldn't",
    "you should not",
];

const WEAK_MARKERS: &[&str] = &[
    "actually",
    "instead",
    "wrong",
    "don't",
    "do not",
    "stop",
    "not that",
    "incorrect",
];

/// Deterministic keyword heuristic
///
/// Picks the latest human message containing correction phrasing that
/// follows an agent message, and blames the nearest preceding agent entry.
#[derive(Debug, Default, Clone)]
pub struct KeywordCorrectionStrategy;

impl KeywordCorrectionStrategy {
    pub fn new() -> Self {
        Self
    }

    fn score(text: &str) -> f64 {
        let lower = text.to_lowercase();
        let strong = STRONG_MARKERS.iter().filter(|m| lower.contains(*m)).count();
        let weak = WEAK_MARKERS.iter().filter(|m| lower.contains(*m)).count();
        let opens_with_no = lower.trim_start().starts_with("no,") || lower.trim_start().starts_with("no.");

        let base = if strong > 0 {
            0.85
        } else if weak > 0 || opens_with_no {
            0.6
        } else {
            return 0.0;
        };

        let hits = strong + weak + usize::from(opens_with_no);
        (base + 0.05 * hits.saturating_sub(1) as f64).min(0.95)
    }
}

#[async_trait]
impl CorrectionStrategy for KeywordCorrectionStrategy {
    async fn assess(&self, window: &[HistoryEntry]) -> anyhow::Result<Option<CorrectionVerdict>> {
        for human_index in (1..window.len()).rev() {
            let entry = &window[human_index];
            if !matches!(entry.author, Author::Human) {
                continue;
            }

            let confidence = Self::score(&entry.content);
            if confidence == 0.0 {
                continue;
            }

            let agent_index = window[..human_index]
                .iter()
                .rposition(|e| e.author.agent_pubkey().is_some());

            if let Some(agent_index) = agent_index {
                return Ok(Some(CorrectionVerdict {
                    agent_index,
                    human_index,
                    corrected_behavior: truncate_chars(entry.content.trim(), 500),
                    confidence,
                }));
            }
        }

        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(index: usize, author: Author, content: &str) -> HistoryEntry {
        HistoryEntry {
            id: format!("c1:{}", index),
            author,
            content: content.to_string(),
            created_at: Utc::now(),
        }
    }

    fn history(messages: &[(Author, &str)]) -> Vec<HistoryEntry> {
        messages
            .iter()
            .enumerate()
            .map(|(i, (author, content))| entry(i, author.clone(), content))
            .collect()
    }

    struct Fixed(Option<CorrectionVerdict>);

    #[async_trait]
    impl CorrectionStrategy for Fixed {
        async fn assess(&self, _window: &[HistoryEntry]) -> anyhow::Result<Option<CorrectionVerdict>> {
            Ok(self.0.clone())
        }
    }

    fn detector(strategy: impl CorrectionStrategy + 'static) -> CorrectionDetector {
        CorrectionDetector::new(Arc::new(strategy), DetectorConfig::default())
    }

    #[tokio::test]
    async fn test_keyword_detects_correction() {
        let history = history(&[
            (Author::Human, "Clean up the build directory"),
            (Author::agent("pk-coder"), "Deleted the whole repository."),
            (Author::Human, "No, that's wrong. Only delete target/, never the repo."),
        ]);

        let analysis = detector(KeywordCorrectionStrategy::new()).detect("c1", &history).await;
        assert!(analysis.found);

        let pattern = analysis.pattern.unwrap();
        assert_eq!(pattern.offending_agent, "pk-coder");
        assert_eq!(pattern.evidence_span, ("c1:1".to_string(), "c1:2".to_string()));
        assert!(analysis.confidence >= 0.85);
    }

    #[tokio::test]
    async fn test_no_correction_in_friendly_window() {
        let history = history(&[
            (Author::Human, "Add a README"),
            (Author::agent("pk-coder"), "Added README.md"),
            (Author::Human, "Thanks, looks great!"),
        ]);

        let analysis = detector(KeywordCorrectionStrategy::new()).detect("c1", &history).await;
        assert!(!analysis.found);
        assert!(analysis.pattern.is_none());
    }

    #[tokio::test]
    async fn test_below_threshold_is_not_found() {
        let history = history(&[(Author::agent("pk"), "Did X"), (Author::Human, "hmm")]);
        let analysis = detector(Fixed(Some(CorrectionVerdict {
            agent_index: 0,
            human_index: 1,
            corrected_behavior: "Do Y".into(),
            confidence: 0.3,
        })))
        .detect("c1", &history)
        .await;

        assert!(!analysis.found);
        assert_eq!(analysis.confidence, 0.3);
    }

    #[tokio::test]
    async fn test_human_must_follow_agent() {
        let history = history(&[(Author::Human, "Do X"), (Author::agent("pk"), "Did Y")]);
        let analysis = detector(Fixed(Some(CorrectionVerdict {
            agent_index: 1,
            human_index: 0,
            corrected_behavior: "X".into(),
            confidence: 0.9,
        })))
        .detect("c1", &history)
        .await;

        assert!(!analysis.found);
    }

    #[tokio::test]
    async fn test_indices_are_relative_to_window() {
        let mut messages: Vec<(Author, &str)> = vec![(Author::Human, "filler"); 12];
        messages.push((Author::agent("pk"), "Pushed to main"));
        messages.push((Author::Human, "Don't push to main, open a PR instead"));
        let history = history(&messages);

        let analysis = detector(KeywordCorrectionStrategy::new()).detect("c1", &history).await;
        let pattern = analysis.pattern.unwrap();
        assert_eq!(pattern.evidence_span.0, "c1:12");
        assert_eq!(pattern.evidence_span.1, "c1:13");
    }

    #[test]
    fn test_keyword_score() {
        assert_eq!(KeywordCorrectionStrategy::score("Great work"), 0.0);
        assert_eq!(KeywordCorrectionStrategy::score("Use tabs instead"), 0.6);
        assert!(KeywordCorrectionStrategy::score("Undo that, it's wrong") > 0.85);
    }
}
