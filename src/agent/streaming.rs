//! Process Output Parser
//!
//! Consumes the NDJSON status stream of an external coding-agent process
//! (Claude CLI `--output-format stream-json` and compatible tools):
//! - Reassembles lines split across reads, including split UTF-8 sequences
//! - Skips corrupt lines without interrupting the stream
//! - Tracks session id (first seen wins), cumulative cost and assistant turns
//! - Hands messages to an optional handler through a bounded in-order queue

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Cost field names, in precedence order
const COST_ALIASES: &[&str] = &["cost_usd", "total_cost_usd", "total_cost", "cost"];

const SESSION_ALIASES: &[&str] = &["session_id", "sessionId"];

/// One decoded status line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessMessage {
    /// The `type` field
    pub kind: String,
    pub subtype: Option<String>,
    pub session_id: Option<String>,
    pub cost: Option<f64>,
    pub role: Option<String>,
    pub content: Option<Value>,
    /// Every field not mapped above
    pub extra: Map<String, Value>,
}

impl ProcessMessage {
    pub fn from_value(value: Value) -> Result<Self, StreamDecodeError> {
        let Value::Object(mut fields) = value else {
            return Err(StreamDecodeError::NotAnObject);
        };

        let kind = match fields.remove("type") {
            Some(Value::String(kind)) => kind,
            _ => return Err(StreamDecodeError::MissingType),
        };

        let session_id = SESSION_ALIASES
            .iter()
            .find_map(|key| fields.get(*key).and_then(Value::as_str).map(str::to_string));
        for key in SESSION_ALIASES {
            if fields.get(*key).is_some_and(Value::is_string) {
                fields.remove(*key);
            }
        }

        let cost = COST_ALIASES.iter().find_map(|key| {
            let value = fields.get(*key)?.as_f64()?;
            fields.remove(*key);
            Some(value)
        });

        let subtype = take_string(&mut fields, "subtype");
        let role = take_string(&mut fields, "role").or_else(|| {
            fields
                .get("message")
                .and_then(|m| m.get("role"))
                .and_then(Value::as_str)
                .map(str::to_string)
        });
        let content = fields.remove("content");

        Ok(Self {
            kind,
            subtype,
            session_id,
            cost,
            role,
            content,
            extra: fields,
        })
    }

    pub fn is_assistant(&self) -> bool {
        self.kind == "assistant"
    }

    /// Best-effort human-readable text of the message
    pub fn text(&self) -> Option<String> {
        if let Some(Value::String(s)) = &self.content {
            return Some(s.clone());
        }
        if let Some(Value::String(s)) = self.extra.get("result") {
            return Some(s.clone());
        }

        let blocks = self
            .content
            .as_ref()
            .or_else(|| self.extra.get("message").and_then(|m| m.get("content")))?
            .as_array()?;

        let text: Vec<&str> = blocks
            .iter()
            .filter(|b| b.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|b| b.get("text").and_then(Value::as_str))
            .collect();

        if text.is_empty() {
            None
        } else {
            Some(text.join("\n"))
        }
    }
}

fn take_string(fields: &mut Map<String, Value>, key: &str) -> Option<String> {
    match fields.get(key) {
        Some(Value::String(_)) => match fields.remove(key) {
            Some(Value::String(s)) => Some(s),
            _ => None,
        },
        _ => None,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StreamDecodeError {
    #[error("Invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Status line is not a JSON object")]
    NotAnObject,

    #[error("Status line has no string 'type' field")]
    MissingType,
}

/// Receives decoded messages in stream order
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: ProcessMessage);
}

struct Dispatcher {
    tx: mpsc::Sender<ProcessMessage>,
    worker: JoinHandle<()>,
}

pub struct ProcessOutputParser {
    buffer: Vec<u8>,
    session_id: Option<String>,
    total_cost: f64,
    message_count: usize,
    started: Instant,
    dispatcher: Option<Dispatcher>,
}

impl Default for ProcessOutputParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessOutputParser {
    pub fn new() -> Self {
        Self {
            buffer: Vec::new(),
            session_id: None,
            total_cost: 0.0,
            message_count: 0,
            started: Instant::now(),
            dispatcher: None,
        }
    }

    /// Parser whose messages are also delivered to `handler`
    ///
    /// A single worker drains a queue of `capacity` messages, so the handler
    /// sees messages in arrival order. Must be called inside a Tokio runtime.
    pub fn with_handler(handler: Arc<dyn MessageHandler>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<ProcessMessage>(capacity.max(1));

        let worker = tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                handler.handle(message).await;
            }
            debug!("Process message handler queue closed");
        });

        Self {
            dispatcher: Some(Dispatcher { tx, worker }),
            ..Self::new()
        }
    }

    pub async fn feed(&mut self, chunk: &str) -> Vec<ProcessMessage> {
        self.feed_bytes(chunk.as_bytes()).await
    }

    /// Feed raw bytes; the trailing incomplete line is kept for the next call
    pub async fn feed_bytes(&mut self, chunk: &[u8]) -> Vec<ProcessMessage> {
        self.buffer.extend_from_slice(chunk);

        let Some(last_newline) = self.buffer.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };

        let complete: Vec<u8> = self.buffer.drain(..=last_newline).collect();
        let messages: Vec<ProcessMessage> = complete
            .split(|b| *b == b'\n')
            .filter_map(|line| self.decode_line(line))
            .collect();

        self.dispatch(&messages).await;
        messages
    }

    /// Decode whatever partial line is still buffered
    pub async fn flush(&mut self) -> Vec<ProcessMessage> {
        let rest = std::mem::take(&mut self.buffer);
        let messages: Vec<ProcessMessage> = self.decode_line(&rest).into_iter().collect();
        self.dispatch(&messages).await;
        messages
    }

    fn decode_line(&mut self, line: &[u8]) -> Option<ProcessMessage> {
        if line.iter().all(u8::is_ascii_whitespace) {
            return None;
        }

        let decoded = serde_json::from_slice::<Value>(line)
            .map_err(StreamDecodeError::from)
            .and_then(ProcessMessage::from_value);

        let message = match decoded {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "Skipping status line ({}): {}",
                    e,
                    crate::conversation::truncate_chars(&String::from_utf8_lossy(line), 120)
                );
                return None;
            }
        };

        if self.session_id.is_none() {
            if let Some(session_id) = &message.session_id {
                debug!("Process session: {}", session_id);
                self.session_id = Some(session_id.clone());
            }
        }
        match message.cost {
            Some(cost) if cost.is_finite() && cost >= 0.0 => self.total_cost += cost,
            Some(cost) => warn!("Ignoring invalid cost {} on {} message", cost, message.kind),
            None => {}
        }
        if message.is_assistant() {
            self.message_count += 1;
        }

        Some(message)
    }

    async fn dispatch(&mut self, messages: &[ProcessMessage]) {
        let Some(dispatcher) = &self.dispatcher else {
            return;
        };

        for message in messages {
            if dispatcher.tx.send(message.clone()).await.is_err() {
                warn!("Process message handler stopped; dropping further dispatch");
                self.dispatcher = None;
                return;
            }
        }
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    pub fn total_cost(&self) -> f64 {
        self.total_cost
    }

    /// Number of assistant messages seen
    pub fn message_count(&self) -> usize {
        self.message_count
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Partial line bytes still buffered
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Clear buffer and statistics; the handler stays attached
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.session_id = None;
        self.total_cost = 0.0;
        self.message_count = 0;
        self.started = Instant::now();
    }

    /// Stop accepting messages and wait for the handler to drain its queue
    pub async fn close(mut self) {
        if let Some(Dispatcher { tx, worker }) = self.dispatcher.take() {
            drop(tx);
            if let Err(e) = worker.await {
                warn!("Process message handler ended abnormally: {}", e);
            }
        }
    }
}
