//! phaseflow
//!
//! Multi-agent conversation core: routes each turn through task phases to a
//! specialized agent, and learns from human corrections by publishing
//! lessons exactly once.
//!
//! # Features
//!
//! - **Phase Router**: validated phase/agent choice from a pluggable strategy
//! - **Reflection**: correction detection, lesson generation, idempotent publishing
//! - **Tool Protocol**: `<tool_use>` blocks embedded in agent text
//! - **Tool Executor**: structured results for every call, panics included
//! - **Process Streaming**: NDJSON status from external coding agents
//!
//! # Architecture
//!
//! ```text
//! message ──► ConversationStore ──► PhaseRouter ──► agent turn
//!                    │                                  │
//!                    │                    ┌─────────────┴────────────┐
//!                    │                    ▼                          ▼
//!                    │              tool protocol          coding-agent process
//!                    │                    │                          │
//!                    │                    ▼                          ▼
//!                    │              ToolExecutor           ProcessOutputParser
//!                    ▼
//!             ReflectionSystem ──► Detector ──► Generator ──► Publisher ──► ledger
//! ```

pub mod agent;
pub mod config;
pub mod conversation;
pub mod event;
mod locks;
pub mod phase;
pub mod protocol;
pub mod router;
pub mod runtime;

pub use agent::{
    Agent, AgentLesson, AgentRegistry, AgentSummary, CodingAgentProcess, CorrectionAnalysis,
    CorrectionDetector, CorrectionPattern, LessonPublisher, ProcessMessage, ProcessOutputParser,
    PublishOutcome, ReflectionOutcome, ReflectionSystem, ReflectionTrigger, ToolExecutor,
    ToolRequest, ToolResult,
};
pub use config::Config;
pub use conversation::{Author, Conversation, ConversationStore, HistoryEntry};
pub use event::{AgentDefinitionView, EventRecord, LessonView, UnsignedEvent};
pub use phase::Phase;
pub use protocol::{format_tool_call, has_tool_calls, parse_tool_calls, remove_tool_calls, ToolCall};
pub use router::{PhaseRouter, RoutingContext, RoutingDecision, RoutingError, RoutingStrategy};
pub use runtime::{Collaborators, Runtime, TurnError};
