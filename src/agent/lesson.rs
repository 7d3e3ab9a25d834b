//! Lesson Generator
//!
//! Turns a correction pattern into an `AgentLesson`. Text comes from a
//! `LessonSynthesizer`; the generator stamps identity, time and the dedup key.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::correction::CorrectionPattern;
use crate::conversation::truncate_chars;
use crate::event::{UnsignedEvent, KIND_AGENT_LESSON};

/// Lesson text before identity and key are attached
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LessonDraft {
    pub situation: String,
    pub mistake: String,
    pub correction: String,
    pub generalized_rule: String,
}

#[async_trait]
pub trait LessonSynthesizer: Send + Sync {
    async fn synthesize(&self, pattern: &CorrectionPattern) -> Result<LessonDraft>;
}

/// Deterministic synthesizer built from the pattern text alone
#[derive(Debug, Default, Clone)]
pub struct TemplateSynthesizer;

#[async_trait]
impl LessonSynthesizer for TemplateSynthesizer {
    async fn synthesize(&self, pattern: &CorrectionPattern) -> Result<LessonDraft> {
        let action = pattern.offending_action.trim();
        let first_line = action.lines().next().unwrap_or_default();

        Ok(LessonDraft {
            situation: truncate_chars(first_line, 200),
            mistake: truncate_chars(action, 500),
            correction: pattern.corrected_behavior.clone(),
            generalized_rule: format!(
                "When a similar situation comes up, follow the user's correction: {}",
                truncate_chars(&pattern.corrected_behavior, 300)
            ),
        })
    }
}

/// Immutable lesson record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentLesson {
    pub agent_pubkey: String,
    pub situation: String,
    pub mistake: String,
    pub correction: String,
    pub generalized_rule: String,
    pub created_at: DateTime<Utc>,
    pub dedup_key: String,
}

impl AgentLesson {
    /// `hex(sha256(agent ":" hex(sha256(normalized situation))))`
    pub fn dedup_key_for(agent_pubkey: &str, situation: &str) -> String {
        let situation_hash = hex::encode(Sha256::digest(normalize(situation).as_bytes()));
        let mut hasher = Sha256::new();
        hasher.update(agent_pubkey.as_bytes());
        hasher.update(b":");
        hasher.update(situation_hash.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// Unsigned lesson event authored by the corrected agent
    pub fn to_event(&self) -> UnsignedEvent {
        UnsignedEvent::new(KIND_AGENT_LESSON, &self.agent_pubkey, &self.generalized_rule)
            .with_created_at(self.created_at.timestamp())
            .tag("d", &self.dedup_key)
            .tag("title", &truncate_chars(&self.situation, 80))
            .tag("situation", &self.situation)
            .tag("mistake", &self.mistake)
            .tag("correction", &self.correction)
    }
}

// Case and whitespace differences must not produce a new key
fn normalize(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub struct LessonGenerator {
    synthesizer: Arc<dyn LessonSynthesizer>,
    timeout: Duration,
}

impl LessonGenerator {
    pub fn new(synthesizer: Arc<dyn LessonSynthesizer>, timeout: Duration) -> Self {
        Self { synthesizer, timeout }
    }

    pub async fn generate(&self, pattern: &CorrectionPattern) -> Result<AgentLesson> {
        let draft = tokio::time::timeout(self.timeout, self.synthesizer.synthesize(pattern))
            .await
            .with_context(|| format!("Lesson synthesis timed out after {:?}", self.timeout))?
            .context("Lesson synthesis failed")?;

        if draft.situation.trim().is_empty() || draft.generalized_rule.trim().is_empty() {
            bail!("Synthesized lesson has an empty situation or rule");
        }

        let dedup_key = AgentLesson::dedup_key_for(&pattern.offending_agent, &draft.situation);
        debug!(
            "Generated lesson {} for agent {}",
            &dedup_key[..12],
            pattern.offending_agent
        );

        Ok(AgentLesson {
            agent_pubkey: pattern.offending_agent.clone(),
            situation: draft.situation,
            mistake: draft.mistake,
            correction: draft.correction,
            generalized_rule: draft.generalized_rule,
            created_at: Utc::now(),
            dedup_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::LessonView;

    fn pattern() -> CorrectionPattern {
        CorrectionPattern {
            conversation_id: "c1".into(),
            offending_agent: "pk-coder".into(),
            corrected_behavior: "Only delete target/".into(),
            evidence_span: ("c1:1".into(), "c1:2".into()),
            offending_action: "Deleted the whole repository.\nDone.".into(),
            human_correction: "No, only delete target/".into(),
        }
    }

    fn generator() -> LessonGenerator {
        LessonGenerator::new(Arc::new(TemplateSynthesizer), Duration::from_secs(5))
    }

    #[tokio::test]
    async fn test_generate_populates_key() {
        let lesson = generator().generate(&pattern()).await.unwrap();
        assert_eq!(lesson.agent_pubkey, "pk-coder");
        assert_eq!(lesson.situation, "Deleted the whole repository.");
        assert_eq!(lesson.dedup_key.len(), 64);
        assert_eq!(
            lesson.dedup_key,
            AgentLesson::dedup_key_for("pk-coder", "Deleted the whole repository.")
        );
    }

    #[tokio::test]
    async fn test_same_pattern_same_key() {
        let a = generator().generate(&pattern()).await.unwrap();
        let b = generator().generate(&pattern()).await.unwrap();
        assert_eq!(a.dedup_key, b.dedup_key);
    }

    #[test]
    fn test_key_ignores_case_and_spacing() {
        assert_eq!(
            AgentLesson::dedup_key_for("pk", "Deleted  the Repo"),
            AgentLesson::dedup_key_for("pk", "deleted the repo ")
        );
        assert_ne!(
            AgentLesson::dedup_key_for("pk", "deleted the repo"),
            AgentLesson::dedup_key_for("pk2", "deleted the repo")
        );
    }

    #[tokio::test]
    async fn test_event_projects_back() {
        let lesson = generator().generate(&pattern()).await.unwrap();
        let event = lesson.to_event().into_signed("sig".into());

        let view = LessonView::from_event(&event).unwrap();
        assert_eq!(view.dedup_key, lesson.dedup_key);
        assert_eq!(view.agent_pubkey, "pk-coder");
        assert_eq!(view.rule, lesson.generalized_rule);
    }
}
