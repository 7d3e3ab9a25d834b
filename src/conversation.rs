//! Conversation Store
//!
//! Holds per-conversation state: phase, append-only history and the agent
//! currently holding the turn. Each conversation sits behind its own mutex so
//! writes to one conversation are serialized while other conversations
//! progress independently.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

use crate::phase::Phase;
use crate::router::RoutingDecision;

/// Who wrote a history entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Author {
    Human,
    Agent { pubkey: String },
    System,
}

impl Author {
    pub fn agent(pubkey: impl Into<String>) -> Self {
        Self::Agent {
            pubkey: pubkey.into(),
        }
    }

    pub fn is_human(&self) -> bool {
        matches!(self, Self::Human)
    }

    pub fn agent_pubkey(&self) -> Option<&str> {
        match self {
            Self::Agent { pubkey } => Some(pubkey),
            _ => None,
        }
    }

    fn label(&self) -> &str {
        match self {
            Self::Human => "User",
            Self::Agent { pubkey } => pubkey,
            Self::System => "System",
        }
    }
}

/// A single immutable entry in a conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// `<conversation-id>:<index>`
    pub id: String,
    pub author: Author,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

/// Conversation state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub phase: Phase,
    history: Vec<HistoryEntry>,
    pub current_agent: Option<String>,
    pub phase_started_at: DateTime<Utc>,
    pub metadata: HashMap<String, Value>,
}

impl Conversation {
    fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            phase: Phase::Chat,
            history: Vec::new(),
            current_agent: None,
            phase_started_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn history(&self) -> &[HistoryEntry] {
        &self.history
    }

    /// Last `n` entries in chronological order
    pub fn recent(&self, n: usize) -> &[HistoryEntry] {
        let start = self.history.len().saturating_sub(n);
        &self.history[start..]
    }

    /// Compact transcript of the last `n` entries for prompts
    pub fn summary(&self, n: usize) -> String {
        let mut out = String::new();
        for entry in self.recent(n) {
            out.push_str(&format!(
                "{}: {}\n",
                entry.author.label(),
                truncate_chars(&entry.content, 300)
            ));
        }
        out
    }

    fn set_phase(&mut self, phase: Phase) {
        if self.phase != phase {
            debug!("Conversation {}: {} -> {}", self.id, self.phase, phase);
            self.phase = phase;
            self.phase_started_at = Utc::now();
        }
    }
}

/// Errors from conversation mutations
#[derive(Debug, thiserror::Error)]
pub enum ConversationError {
    #[error("Conversation not found: {0}")]
    NotFound(String),

    #[error("Conversation already exists: {0}")]
    AlreadyExists(String),

    #[error("Illegal phase transition in {id}: {from} -> {to}")]
    IllegalTransition { id: String, from: Phase, to: Phase },

    #[error("Illegal backtrack in {id}: {from} -> {to}")]
    IllegalBacktrack { id: String, from: Phase, to: Phase },
}

/// In-memory conversation store
#[derive(Default)]
pub struct ConversationStore {
    conversations: RwLock<HashMap<String, Arc<Mutex<Conversation>>>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new conversation in the `chat` phase
    pub async fn create(&self, id: &str, title: &str) -> Result<Conversation, ConversationError> {
        let mut conversations = self.conversations.write().await;
        if conversations.contains_key(id) {
            return Err(ConversationError::AlreadyExists(id.to_string()));
        }

        let conversation = Conversation::new(id, title);
        conversations.insert(id.to_string(), Arc::new(Mutex::new(conversation.clone())));

        info!("Conversation created: {} ({})", id, title);
        Ok(conversation)
    }

    async fn handle(&self, id: &str) -> Result<Arc<Mutex<Conversation>>, ConversationError> {
        let conversations = self.conversations.read().await;
        conversations
            .get(id)
            .cloned()
            .ok_or_else(|| ConversationError::NotFound(id.to_string()))
    }

    /// Point-in-time copy of a conversation
    pub async fn snapshot(&self, id: &str) -> Result<Conversation, ConversationError> {
        let handle = self.handle(id).await?;
        let conversation = handle.lock().await;
        Ok(conversation.clone())
    }

    /// Last `n` history entries
    pub async fn recent(&self, id: &str, n: usize) -> Result<Vec<HistoryEntry>, ConversationError> {
        let handle = self.handle(id).await?;
        let conversation = handle.lock().await;
        Ok(conversation.recent(n).to_vec())
    }

    pub async fn history_len(&self, id: &str) -> Result<usize, ConversationError> {
        let handle = self.handle(id).await?;
        let len = handle.lock().await.history.len();
        Ok(len)
    }

    /// All conversation ids (unordered)
    pub async fn ids(&self) -> Vec<String> {
        self.conversations.read().await.keys().cloned().collect()
    }

    /// Append a message; returns the stored entry
    pub async fn append(
        &self,
        id: &str,
        author: Author,
        content: &str,
    ) -> Result<HistoryEntry, ConversationError> {
        let handle = self.handle(id).await?;
        let mut conversation = handle.lock().await;

        let entry = HistoryEntry {
            id: format!("{}:{}", id, conversation.history.len()),
            author,
            content: content.to_string(),
            created_at: Utc::now(),
        };
        conversation.history.push(entry.clone());

        debug!("Appended {} to {}", entry.id, id);
        Ok(entry)
    }

    /// Move forward along the phase graph (or stay)
    pub async fn change_phase(&self, id: &str, to: Phase) -> Result<(), ConversationError> {
        let handle = self.handle(id).await?;
        let mut conversation = handle.lock().await;

        if !conversation.phase.can_advance_to(to) {
            return Err(ConversationError::IllegalTransition {
                id: id.to_string(),
                from: conversation.phase,
                to,
            });
        }
        conversation.set_phase(to);
        Ok(())
    }

    /// Step back to an earlier phase after a correction
    pub async fn backtrack(&self, id: &str, to: Phase) -> Result<(), ConversationError> {
        let handle = self.handle(id).await?;
        let mut conversation = handle.lock().await;

        if !conversation.phase.can_backtrack_to(to) {
            return Err(ConversationError::IllegalBacktrack {
                id: id.to_string(),
                from: conversation.phase,
                to,
            });
        }
        info!("Conversation {} backtracking {} -> {}", id, conversation.phase, to);
        conversation.set_phase(to);
        Ok(())
    }

    pub async fn assign_agent(&self, id: &str, pubkey: &str) -> Result<(), ConversationError> {
        let handle = self.handle(id).await?;
        let mut conversation = handle.lock().await;
        conversation.current_agent = Some(pubkey.to_string());
        Ok(())
    }

    /// Apply phase and agent of a routing decision in one step
    pub async fn apply_decision(
        &self,
        id: &str,
        decision: &RoutingDecision,
    ) -> Result<(), ConversationError> {
        let handle = self.handle(id).await?;
        let mut conversation = handle.lock().await;

        if !conversation.phase.can_advance_to(decision.phase()) {
            return Err(ConversationError::IllegalTransition {
                id: id.to_string(),
                from: conversation.phase,
                to: decision.phase(),
            });
        }
        conversation.set_phase(decision.phase());
        conversation.current_agent = Some(decision.next_agent().to_string());
        Ok(())
    }

    pub async fn set_metadata(
        &self,
        id: &str,
        key: &str,
        value: Value,
    ) -> Result<(), ConversationError> {
        let handle = self.handle(id).await?;
        let mut conversation = handle.lock().await;
        conversation.metadata.insert(key.to_string(), value);
        Ok(())
    }
}

/// Truncate on a char boundary
pub(crate) fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let cut: String = s.chars().take(max).collect();
        format!("{}...", cut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_append_preserves_order() {
        let store = ConversationStore::new();
        store.create("c1", "Test").await.unwrap();

        store.append("c1", Author::Human, "Hello").await.unwrap();
        store.append("c1", Author::agent("pk1"), "Hi!").await.unwrap();
        let entry = store.append("c1", Author::Human, "Bye").await.unwrap();

        assert_eq!(entry.id, "c1:2");
        let snapshot = store.snapshot("c1").await.unwrap();
        assert_eq!(snapshot.history().len(), 3);
        assert_eq!(snapshot.history()[0].content, "Hello");
        assert_eq!(snapshot.history()[1].author.agent_pubkey(), Some("pk1"));
    }

    #[tokio::test]
    async fn test_duplicate_create() {
        let store = ConversationStore::new();
        store.create("c1", "A").await.unwrap();
        assert!(matches!(
            store.create("c1", "B").await,
            Err(ConversationError::AlreadyExists(_))
        ));
    }

    #[tokio::test]
    async fn test_phase_transitions() {
        let store = ConversationStore::new();
        store.create("c1", "Test").await.unwrap();

        store.change_phase("c1", Phase::Plan).await.unwrap();
        let err = store.change_phase("c1", Phase::Done).await.unwrap_err();
        assert!(matches!(err, ConversationError::IllegalTransition { .. }));

        store.change_phase("c1", Phase::Execute).await.unwrap();
        store.backtrack("c1", Phase::Plan).await.unwrap();
        assert_eq!(store.snapshot("c1").await.unwrap().phase, Phase::Plan);

        assert!(store.backtrack("c1", Phase::Review).await.is_err());
    }

    #[tokio::test]
    async fn test_recent_window() {
        let store = ConversationStore::new();
        store.create("c1", "Test").await.unwrap();
        for i in 0..5 {
            store.append("c1", Author::Human, &format!("m{}", i)).await.unwrap();
        }

        let recent = store.recent("c1", 2).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].content, "m3");
        assert_eq!(recent[1].content, "m4");
        assert_eq!(store.recent("c1", 50).await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_missing_conversation() {
        let store = ConversationStore::new();
        assert!(matches!(
            store.append("nope", Author::Human, "x").await,
            Err(ConversationError::NotFound(_))
        ));
    }

    #[test]
    fn test_truncate_chars_utf8() {
        assert_eq!(truncate_chars("héllo", 10), "héllo");
        assert_eq!(truncate_chars("héllo", 2), "hé...");
    }
}
