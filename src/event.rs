//! Event Records
//!
//! One generic tagged record for everything that gets published, with typed
//! projections per kind. Projections validate the tags they need and derive
//! fields (title, version, ...) instead of relying on per-kind record types.

use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256};

/// Event kind for agent lessons
pub const KIND_AGENT_LESSON: u32 = 4129;

/// Event kind for agent definitions
pub const KIND_AGENT_DEFINITION: u32 = 4199;

/// Event before signing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnsignedEvent {
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
}

impl UnsignedEvent {
    pub fn new(kind: u32, pubkey: &str, content: &str) -> Self {
        Self {
            pubkey: pubkey.to_string(),
            created_at: chrono::Utc::now().timestamp(),
            kind,
            tags: Vec::new(),
            content: content.to_string(),
        }
    }

    pub fn with_created_at(mut self, created_at: i64) -> Self {
        self.created_at = created_at;
        self
    }

    pub fn tag(mut self, name: &str, value: &str) -> Self {
        self.tags.push(vec![name.to_string(), value.to_string()]);
        self
    }

    /// Content hash over the canonical serialization
    /// `[0, pubkey, created_at, kind, tags, content]`
    pub fn id(&self) -> String {
        let canonical = json!([0, self.pubkey, self.created_at, self.kind, self.tags, self.content]);
        hex::encode(Sha256::digest(canonical.to_string().as_bytes()))
    }

    /// Attach a signature produced elsewhere
    pub fn into_signed(self, sig: String) -> EventRecord {
        EventRecord {
            id: self.id(),
            pubkey: self.pubkey,
            created_at: self.created_at,
            kind: self.kind,
            tags: self.tags,
            content: self.content,
            sig,
        }
    }
}

/// Signed, publishable record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u32,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl EventRecord {
    /// First value of a tag
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    /// All values of a repeated tag
    pub fn tag_values(&self, name: &str) -> Vec<&str> {
        self.tags
            .iter()
            .filter(|t| t.first().map(String::as_str) == Some(name))
            .filter_map(|t| t.get(1))
            .map(String::as_str)
            .collect()
    }

    fn expect_kind(&self, expected: u32) -> Result<(), ProjectionError> {
        if self.kind == expected {
            Ok(())
        } else {
            Err(ProjectionError::WrongKind {
                expected,
                actual: self.kind,
            })
        }
    }

    fn required_tag(&self, name: &'static str) -> Result<String, ProjectionError> {
        self.tag_value(name)
            .filter(|v| !v.trim().is_empty())
            .map(str::to_string)
            .ok_or(ProjectionError::MissingTag(name))
    }
}

/// Why a record does not fit a projection
#[derive(Debug, thiserror::Error)]
pub enum ProjectionError {
    #[error("Expected event kind {expected}, got {actual}")]
    WrongKind { expected: u32, actual: u32 },

    #[error("Missing required tag '{0}'")]
    MissingTag(&'static str),

    #[error("Invalid value for tag '{tag}': {value}")]
    InvalidTag { tag: &'static str, value: String },
}

/// Typed view over a lesson event
#[derive(Debug, Clone, PartialEq)]
pub struct LessonView {
    pub agent_pubkey: String,
    pub dedup_key: String,
    pub title: String,
    pub situation: Option<String>,
    pub mistake: Option<String>,
    pub correction: Option<String>,
    pub rule: String,
}

impl LessonView {
    pub fn from_event(event: &EventRecord) -> Result<Self, ProjectionError> {
        event.expect_kind(KIND_AGENT_LESSON)?;
        let dedup_key = event.required_tag("d")?;

        // Older lessons carry no explicit title; fall back to the rule's first line
        let title = event
            .tag_value("title")
            .map(str::to_string)
            .unwrap_or_else(|| event.content.lines().next().unwrap_or_default().to_string());

        Ok(Self {
            agent_pubkey: event.pubkey.clone(),
            dedup_key,
            title,
            situation: event.tag_value("situation").map(str::to_string),
            mistake: event.tag_value("mistake").map(str::to_string),
            correction: event.tag_value("correction").map(str::to_string),
            rule: event.content.clone(),
        })
    }
}

/// Typed view over an agent definition event
#[derive(Debug, Clone, PartialEq)]
pub struct AgentDefinitionView {
    pub title: String,
    pub role: String,
    pub instructions: String,
    pub expertise: Option<String>,
    pub llm_config: Option<String>,
    pub tools: Vec<String>,
    pub version: u32,
}

impl AgentDefinitionView {
    pub fn from_event(event: &EventRecord) -> Result<Self, ProjectionError> {
        event.expect_kind(KIND_AGENT_DEFINITION)?;

        let version = match event.tag_value("ver") {
            None => 1,
            Some(raw) => raw.trim().parse().map_err(|_| ProjectionError::InvalidTag {
                tag: "ver",
                value: raw.to_string(),
            })?,
        };

        let instructions = event
            .tag_value("instructions")
            .map(str::to_string)
            .unwrap_or_else(|| event.content.clone());

        Ok(Self {
            title: event.required_tag("title")?,
            role: event.required_tag("role")?,
            instructions,
            expertise: event.tag_value("expertise").map(str::to_string),
            llm_config: event.tag_value("llm").map(str::to_string),
            tools: event.tag_values("tool").into_iter().map(str::to_string).collect(),
            version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn definition() -> EventRecord {
        UnsignedEvent::new(KIND_AGENT_DEFINITION, "pk-author", "Write careful code.")
            .with_created_at(1_700_000_000)
            .tag("title", "Coder")
            .tag("role", "executor")
            .tag("tool", "read_file")
            .tag("tool", "write_file")
            .tag("ver", "3")
            .into_signed("sig".into())
    }

    #[test]
    fn test_id_is_deterministic() {
        let a = UnsignedEvent::new(1, "pk", "hello").with_created_at(42);
        let b = UnsignedEvent::new(1, "pk", "hello").with_created_at(42);
        assert_eq!(a.id(), b.id());
        assert_eq!(a.id().len(), 64);
        assert_ne!(a.id(), b.tag("x", "y").id());
    }

    #[test]
    fn test_agent_definition_projection() {
        let view = AgentDefinitionView::from_event(&definition()).unwrap();
        assert_eq!(view.title, "Coder");
        assert_eq!(view.version, 3);
        assert_eq!(view.tools, vec!["read_file", "write_file"]);
        assert_eq!(view.instructions, "Write careful code.");
    }

    #[test]
    fn test_projection_rejects_wrong_kind() {
        let err = LessonView::from_event(&definition()).unwrap_err();
        assert!(matches!(err, ProjectionError::WrongKind { .. }));
    }

    #[test]
    fn test_invalid_version_tag() {
        let event = UnsignedEvent::new(KIND_AGENT_DEFINITION, "pk", "")
            .tag("title", "X")
            .tag("role", "r")
            .tag("ver", "v2")
            .into_signed(String::new());
        assert!(matches!(
            AgentDefinitionView::from_event(&event),
            Err(ProjectionError::InvalidTag { tag: "ver", .. })
        ));
    }

    #[test]
    fn test_lesson_title_falls_back_to_rule() {
        let event = UnsignedEvent::new(KIND_AGENT_LESSON, "pk-agent", "Ask before deleting.\nMore.")
            .tag("d", "key-1")
            .into_signed(String::new());
        let view = LessonView::from_event(&event).unwrap();
        assert_eq!(view.title, "Ask before deleting.");
        assert_eq!(view.dedup_key, "key-1");
    }
}
