//! Phase Router
//!
//! Decides which phase a conversation moves to and which agent takes the next
//! turn. The actual choice is made by a pluggable [`RoutingStrategy`]
//! (usually an LLM call); the router builds a deterministic menu of legal
//! options, validates whatever comes back, retries once, and otherwise falls
//! back to the current assignment.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::agent::AgentSummary;
use crate::conversation::{Conversation, HistoryEntry};
use crate::phase::Phase;

/// Read-only snapshot handed to the router
#[derive(Debug, Clone)]
pub struct RoutingContext {
    pub conversation_id: String,
    pub current_phase: Phase,
    pub current_agent: Option<String>,
    pub message_content: String,
    pub available_agents: Vec<AgentSummary>,
    pub conversation_history_summary: String,
}

impl RoutingContext {
    /// Snapshot a conversation for routing the given message
    pub fn from_conversation(
        conversation: &Conversation,
        message: &str,
        available_agents: Vec<AgentSummary>,
        summary_entries: usize,
    ) -> Self {
        Self {
            conversation_id: conversation.id.clone(),
            current_phase: conversation.phase,
            current_agent: conversation.current_agent.clone(),
            message_content: message.to_string(),
            available_agents,
            conversation_history_summary: conversation.summary(summary_entries),
        }
    }
}

/// Routing outcome. Only the router constructs these, always from a member
/// of the menu it offered.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoutingDecision {
    phase: Phase,
    next_agent: String,
    reasoning: String,
    confidence: f64,
}

impl RoutingDecision {
    fn new(phase: Phase, agent: &AgentSummary, reasoning: String, confidence: f64) -> Self {
        let confidence = if confidence.is_finite() {
            confidence.clamp(0.0, 1.0)
        } else {
            0.0
        };
        Self {
            phase,
            next_agent: agent.pubkey.clone(),
            reasoning,
            confidence,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Pubkey of the chosen agent
    pub fn next_agent(&self) -> &str {
        &self.next_agent
    }

    pub fn reasoning(&self) -> &str {
        &self.reasoning
    }

    pub fn confidence(&self) -> f64 {
        self.confidence
    }

    /// Advisory: should a human confirm before acting on this?
    pub fn needs_confirmation(&self, threshold: f64) -> bool {
        self.confidence < threshold
    }
}

/// Routing errors surfaced to the caller
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("No agents available to route conversation {conversation_id}")]
    NoAgentsAvailable { conversation_id: String },
}

/// A legal phase as offered to the strategy
#[derive(Debug, Clone, Serialize)]
pub struct PhaseOption {
    pub phase: Phase,
    pub description: &'static str,
}

/// Structured menu of legal choices for one routing call
#[derive(Debug, Clone, Serialize)]
pub struct RoutingMenu {
    pub conversation_id: String,
    pub current_phase: Phase,
    pub current_agent: Option<String>,
    pub phases: Vec<PhaseOption>,
    pub agents: Vec<AgentSummary>,
    pub message: String,
    pub history: String,
    /// 1 for the first call, 2 for the retry
    pub attempt: u8,
    /// Why the previous choice was rejected
    pub previous_rejection: Option<String>,
}

impl RoutingMenu {
    fn build(context: &RoutingContext, history: &[HistoryEntry], history_entries: usize) -> Self {
        let phases = context
            .current_phase
            .legal_next()
            .into_iter()
            .map(|phase| PhaseOption {
                phase,
                description: phase.description(),
            })
            .collect();

        let mut transcript = context.conversation_history_summary.clone();
        if transcript.is_empty() {
            let start = history.len().saturating_sub(history_entries);
            for entry in &history[start..] {
                let who = match entry.author.agent_pubkey() {
                    Some(pk) => pk,
                    None if entry.author.is_human() => "User",
                    None => "System",
                };
                transcript.push_str(&format!("{}: {}\n", who, entry.content));
            }
        }

        Self {
            conversation_id: context.conversation_id.clone(),
            current_phase: context.current_phase,
            current_agent: context.current_agent.clone(),
            phases,
            agents: context.available_agents.clone(),
            message: context.message_content.clone(),
            history: transcript,
            attempt: 1,
            previous_rejection: None,
        }
    }

    /// Deterministic prompt text for LLM-backed strategies
    pub fn prompt(&self) -> String {
        let mut prompt = String::from(
            "You are routing a conversation between specialized agents.\n\n",
        );
        prompt.push_str(&format!("Conversation: {}\n", self.conversation_id));
        prompt.push_str(&format!("Current phase: {}\n", self.current_phase));
        prompt.push_str(&format!(
            "Current agent: {}\n\n",
            self.current_agent.as_deref().unwrap_or("none")
        ));

        prompt.push_str("Legal phases:\n");
        for option in &self.phases {
            prompt.push_str(&format!("- {}: {}\n", option.phase, option.description));
        }

        prompt.push_str("\nAvailable agents:\n");
        for agent in &self.agents {
            prompt.push_str(&format!(
                "- {} ({}): role={}; expertise={}\n",
                agent.name, agent.pubkey, agent.role, agent.expertise
            ));
        }

        if !self.history.is_empty() {
            prompt.push_str("\nRecent history:\n");
            prompt.push_str(&self.history);
        }

        prompt.push_str(&format!("\nLatest message:\n{}\n", self.message));

        if let Some(ref rejection) = self.previous_rejection {
            prompt.push_str(&format!(
                "\nYour previous answer was rejected: {}\nPick only from the lists above.\n",
                rejection
            ));
        }

        prompt.push_str(
            "\nRespond with JSON only:\n\
             {\"phase\": \"<phase>\", \"agent\": \"<agent pubkey>\", \"reasoning\": \"...\", \"confidence\": 0.0}\n",
        );
        prompt
    }

    fn find_agent(&self, reference: &str) -> Option<&AgentSummary> {
        let reference = reference.trim().trim_start_matches('@');
        self.agents
            .iter()
            .find(|a| a.pubkey == reference)
            .or_else(|| {
                self.agents
                    .iter()
                    .find(|a| a.name.eq_ignore_ascii_case(reference))
            })
    }

    /// Check a choice against the menu
    fn validate(&self, choice: &RoutingChoice) -> Result<RoutingDecision, String> {
        let phase: Phase = choice.phase.parse()?;
        if !self.phases.iter().any(|o| o.phase == phase) {
            return Err(format!(
                "phase '{}' is not reachable from '{}'",
                phase, self.current_phase
            ));
        }

        let agent = self
            .find_agent(&choice.agent)
            .ok_or_else(|| format!("agent '{}' is not available", choice.agent))?;

        Ok(RoutingDecision::new(
            phase,
            agent,
            choice.reasoning.clone(),
            choice.confidence,
        ))
    }
}

/// Raw choice returned by a strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingChoice {
    pub phase: String,
    /// Pubkey, or name as a fallback
    pub agent: String,
    #[serde(default)]
    pub reasoning: String,
    #[serde(default)]
    pub confidence: f64,
}

impl RoutingChoice {
    /// Parse a choice out of free-form model output
    pub fn from_text(text: &str) -> Option<Self> {
        let json = extract_json(text)?;
        serde_json::from_str(json).ok()
    }
}

/// Pluggable decision maker
#[async_trait]
pub trait RoutingStrategy: Send + Sync {
    async fn choose(&self, menu: &RoutingMenu) -> anyhow::Result<RoutingChoice>;
}

/// Router configuration
#[derive(Debug, Clone)]
pub struct RouterConfig {
    pub reasoning_timeout: Duration,
    /// History entries included in the menu when the context has no summary
    pub history_entries: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            reasoning_timeout: Duration::from_secs(30),
            history_entries: 10,
        }
    }
}

const MAX_ATTEMPTS: u8 = 2;

/// Phase/agent router
pub struct PhaseRouter {
    strategy: Arc<dyn RoutingStrategy>,
    config: RouterConfig,
}

impl PhaseRouter {
    pub fn new(strategy: Arc<dyn RoutingStrategy>) -> Self {
        Self::with_config(strategy, RouterConfig::default())
    }

    pub fn with_config(strategy: Arc<dyn RoutingStrategy>, config: RouterConfig) -> Self {
        Self { strategy, config }
    }

    /// Decide the next phase and agent
    pub async fn decide(
        &self,
        context: &RoutingContext,
        history: &[HistoryEntry],
    ) -> Result<RoutingDecision, RoutingError> {
        if context.available_agents.is_empty() {
            warn!(
                "Routing failed for {}: no agents available",
                context.conversation_id
            );
            return Err(RoutingError::NoAgentsAvailable {
                conversation_id: context.conversation_id.clone(),
            });
        }

        let mut menu = RoutingMenu::build(context, history, self.config.history_entries);
        let mut rejection: Option<String> = None;

        for attempt in 1..=MAX_ATTEMPTS {
            menu.attempt = attempt;
            menu.previous_rejection = rejection.take();

            let outcome =
                tokio::time::timeout(self.config.reasoning_timeout, self.strategy.choose(&menu))
                    .await;

            let reason = match outcome {
                Ok(Ok(choice)) => match menu.validate(&choice) {
                    Ok(decision) => {
                        info!(
                            "Routed {} -> {} / {} ({:.0}%)",
                            context.conversation_id,
                            decision.phase,
                            decision.next_agent,
                            decision.confidence * 100.0
                        );
                        return Ok(decision);
                    }
                    Err(reason) => reason,
                },
                Ok(Err(e)) => format!("reasoning failed: {}", e),
                Err(_) => format!(
                    "reasoning timed out after {:?}",
                    self.config.reasoning_timeout
                ),
            };

            warn!(
                "Routing attempt {} for {} rejected: {}",
                attempt, context.conversation_id, reason
            );
            rejection = Some(reason);
        }

        Ok(self.fail_closed(context, &menu, rejection.unwrap_or_default()))
    }

    /// Keep the current phase and agent (or the first available agent)
    fn fail_closed(
        &self,
        context: &RoutingContext,
        menu: &RoutingMenu,
        reason: String,
    ) -> RoutingDecision {
        let agent = context
            .current_agent
            .as_deref()
            .and_then(|pk| menu.agents.iter().find(|a| a.pubkey == pk))
            .unwrap_or(&menu.agents[0]);

        debug!(
            "Routing {} failed closed to {} / {}",
            context.conversation_id, context.current_phase, agent.pubkey
        );

        RoutingDecision::new(
            context.current_phase,
            agent,
            format!("Kept current assignment: {}", reason),
            0.0,
        )
    }
}

// Phase keyword sets for the heuristic strategy
static PLAN_KEYWORDS: &[&str] = &[
    "plan", "design", "architecture", "break down", "steps", "approach", "strategy",
];

static EXECUTE_KEYWORDS: &[&str] = &[
    "implement", "fix", "build", "code", "write", "add", "refactor", "change", "go ahead",
];

static REVIEW_KEYWORDS: &[&str] = &["review", "check", "verify", "test", "look over"];

static DONE_KEYWORDS: &[&str] = &["done", "ship it", "that's all", "thanks, bye", "looks good"];

static EXPLICIT_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"@([A-Za-z0-9_\-]+)").expect("static regex")
});

/// Deterministic keyword strategy: explicit `@agent` mentions, phase
/// keywords, then a role match for the chosen phase
#[derive(Debug, Clone, Default)]
pub struct KeywordRoutingStrategy;

impl KeywordRoutingStrategy {
    pub fn new() -> Self {
        Self
    }

    fn phase_for(&self, menu: &RoutingMenu, msg_lower: &str) -> Phase {
        let candidates = [
            (Phase::Done, DONE_KEYWORDS),
            (Phase::Review, REVIEW_KEYWORDS),
            (Phase::Execute, EXECUTE_KEYWORDS),
            (Phase::Plan, PLAN_KEYWORDS),
        ];

        for (phase, keywords) in candidates {
            let legal = menu.phases.iter().any(|o| o.phase == phase);
            if legal && keywords.iter().any(|kw| msg_lower.contains(kw)) {
                return phase;
            }
        }
        menu.current_phase
    }

    fn role_hint(phase: Phase) -> &'static str {
        match phase {
            Phase::Chat | Phase::Done => "orchestrator",
            Phase::Plan => "plan",
            Phase::Execute => "execut",
            Phase::Review => "review",
        }
    }
}

#[async_trait]
impl RoutingStrategy for KeywordRoutingStrategy {
    async fn choose(&self, menu: &RoutingMenu) -> anyhow::Result<RoutingChoice> {
        let msg_lower = menu.message.to_lowercase();
        let phase = self.phase_for(menu, &msg_lower);

        // 1. Explicit @agent
        for caps in EXPLICIT_PATTERN.captures_iter(&menu.message) {
            if let Some(agent) = menu.find_agent(&caps[1]) {
                return Ok(RoutingChoice {
                    phase: phase.to_string(),
                    agent: agent.pubkey.clone(),
                    reasoning: format!("Explicit @{}", &caps[1]),
                    confidence: 1.0,
                });
            }
        }

        // 2. Role matching the phase
        let hint = Self::role_hint(phase);
        if let Some(agent) = menu
            .agents
            .iter()
            .find(|a| a.role.to_lowercase().contains(hint))
        {
            return Ok(RoutingChoice {
                phase: phase.to_string(),
                agent: agent.pubkey.clone(),
                reasoning: format!("Role '{}' fits phase {}", agent.role, phase),
                confidence: 0.8,
            });
        }

        // 3. Keep whoever has the turn
        let agent = menu
            .current_agent
            .as_deref()
            .and_then(|pk| menu.agents.iter().find(|a| a.pubkey == pk))
            .or_else(|| menu.agents.first())
            .ok_or_else(|| anyhow::anyhow!("menu has no agents"))?;

        Ok(RoutingChoice {
            phase: phase.to_string(),
            agent: agent.pubkey.clone(),
            reasoning: "No strong signal".to_string(),
            confidence: 0.6,
        })
    }
}

/// Extract the first balanced JSON object from a string
pub(crate) fn extract_json(s: &str) -> Option<&str> {
    let start = s.find('{')?;
    let mut depth = 0;
    let mut in_string = false;
    let mut escaped = false;

    for (i, c) in s[start..].char_indices() {
        if in_string {
            match c {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(&s[start..start + i + 1]);
                }
            }
            _ => {}
        }
    }
    None
}
