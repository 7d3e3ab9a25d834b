//! Agent Framework
//!
//! Agent records plus the machinery that runs around an agent's turn:
//! - Correction detection and lesson learning (reflection pipeline)
//! - Structured tool execution
//! - Streaming status from external coding-agent processes
//!
//! Agents are configuration records referenced by pubkey; no conversation
//! owns them.

pub mod correction;
pub mod lesson;
pub mod process;
pub mod publisher;
pub mod reflection;
pub mod streaming;
pub mod tools;

pub use correction::{
    CorrectionAnalysis, CorrectionDetector, CorrectionPattern, CorrectionStrategy,
    CorrectionVerdict, DetectorConfig, KeywordCorrectionStrategy,
};
pub use lesson::{AgentLesson, LessonDraft, LessonGenerator, LessonSynthesizer, TemplateSynthesizer};
pub use process::{CodingAgentProcess, ProcessError, ProcessSpec, ProcessSummary};
pub use publisher::{
    EventPublisher, LedgerError, LessonLedger, LessonPublisher, MemoryLedger, PublishError,
    PublishOutcome, Signer, SqliteLedger,
};
pub use reflection::{
    ReflectionConfig, ReflectionError, ReflectionOutcome, ReflectionState, ReflectionSystem,
    ReflectionTrigger, TriggerKind,
};
pub use streaming::{MessageHandler, ProcessMessage, ProcessOutputParser, StreamDecodeError};
pub use tools::{
    HandlerError, Tool, ToolContext, ToolError, ToolExecutor, ToolMetadata, ToolOutput,
    ToolRegistry, ToolRequest, ToolResult,
};

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::event::AgentDefinitionView;

/// A configured agent persona
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    pub name: String,
    /// Stable identity
    pub pubkey: String,
    pub role: String,
    pub expertise: String,
    pub instructions: String,
    /// Named LLM configuration (or process backend) this agent runs on
    pub llm_config: String,
    pub tools: BTreeSet<String>,
}

impl Agent {
    pub fn new(name: &str, pubkey: &str, role: &str) -> Self {
        Self {
            name: name.to_string(),
            pubkey: pubkey.to_string(),
            role: role.to_string(),
            expertise: String::new(),
            instructions: String::new(),
            llm_config: "default".to_string(),
            tools: BTreeSet::new(),
        }
    }

    pub fn with_expertise(mut self, expertise: &str) -> Self {
        self.expertise = expertise.to_string();
        self
    }

    pub fn with_instructions(mut self, instructions: &str) -> Self {
        self.instructions = instructions.to_string();
        self
    }

    pub fn with_llm_config(mut self, llm_config: &str) -> Self {
        self.llm_config = llm_config.to_string();
        self
    }

    pub fn with_tool(mut self, tool: &str) -> Self {
        self.tools.insert(tool.to_string());
        self
    }

    /// Build an agent from a published agent definition
    pub fn from_definition(pubkey: &str, definition: &AgentDefinitionView) -> Self {
        Self {
            name: definition.title.clone(),
            pubkey: pubkey.to_string(),
            role: definition.role.clone(),
            expertise: definition.expertise.clone().unwrap_or_default(),
            instructions: definition.instructions.clone(),
            llm_config: definition
                .llm_config
                .clone()
                .unwrap_or_else(|| "default".to_string()),
            tools: definition.tools.iter().cloned().collect(),
        }
    }

    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            name: self.name.clone(),
            pubkey: self.pubkey.clone(),
            role: self.role.clone(),
            expertise: self.expertise.clone(),
        }
    }
}

/// What the router sees of an agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub name: String,
    pub pubkey: String,
    pub role: String,
    pub expertise: String,
}

/// Ordered set of agents keyed by pubkey
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: Vec<Agent>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent, replacing any agent with the same pubkey in place
    pub fn register(&mut self, agent: Agent) {
        match self.agents.iter_mut().find(|a| a.pubkey == agent.pubkey) {
            Some(existing) => *existing = agent,
            None => self.agents.push(agent),
        }
    }

    pub fn get(&self, pubkey: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.pubkey == pubkey)
    }

    pub fn by_name(&self, name: &str) -> Option<&Agent> {
        self.agents.iter().find(|a| a.name.eq_ignore_ascii_case(name))
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Summaries in registration order
    pub fn summaries(&self) -> Vec<AgentSummary> {
        self.agents.iter().map(Agent::summary).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_replaces_same_pubkey() {
        let mut registry = AgentRegistry::new();
        registry.register(Agent::new("Planner", "pk1", "planner"));
        registry.register(Agent::new("Coder", "pk2", "executor"));
        registry.register(Agent::new("Planner v2", "pk1", "planner"));

        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get("pk1").unwrap().name, "Planner v2");
        assert_eq!(registry.summaries()[0].pubkey, "pk1");
    }

    #[test]
    fn test_lookup_by_name_is_case_insensitive() {
        let mut registry = AgentRegistry::new();
        registry.register(Agent::new("Reviewer", "pk3", "reviewer").with_tool("read_file"));

        let agent = registry.by_name("reviewer").unwrap();
        assert!(agent.tools.contains("read_file"));
    }
}
