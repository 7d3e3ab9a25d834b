//! Tool Executor
//!
//! Dispatches tool requests to registered handlers and always answers with a
//! structured `ToolResult`:
//! - Unknown tools and handler failures become error results, never crashes
//! - Handler panics are caught and reported as `handler_error`
//! - Wall-clock duration is measured here, not trusted from handlers

use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::phase::Phase;
use crate::protocol::ToolCall;

/// Who is calling, and from where
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolContext {
    pub conversation_id: String,
    pub agent_pubkey: String,
    pub phase: Phase,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolRequest {
    pub tool_name: String,
    pub parameters: Map<String, Value>,
    pub context: ToolContext,
    pub request_id: String,
    pub timestamp: DateTime<Utc>,
}

impl ToolRequest {
    pub fn new(tool_name: &str, parameters: Map<String, Value>, context: ToolContext) -> Self {
        Self {
            tool_name: tool_name.to_string(),
            parameters,
            context,
            request_id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// What a handler returns on success
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    pub data: Option<Value>,
    pub tokens_used: Option<u64>,
    pub cost: Option<f64>,
    pub cache_hit: bool,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn with_usage(mut self, tokens_used: u64, cost: f64) -> Self {
        self.tokens_used = Some(tokens_used);
        self.cost = Some(cost);
        self
    }

    pub fn cached(mut self) -> Self {
        self.cache_hit = true;
        self
    }
}

/// Handler failure; `recoverable` defaults to true when unset
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct HandlerError {
    pub message: String,
    pub recoverable: Option<bool>,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: None,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            recoverable: Some(false),
        }
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(e: anyhow::Error) -> Self {
        Self::new(format!("{:#}", e))
    }
}

pub type ToolHandler = Arc<
    dyn Fn(Map<String, Value>, ToolContext) -> Pin<Box<dyn Future<Output = Result<ToolOutput, HandlerError>> + Send>>
        + Send
        + Sync,
>;

/// A named tool with its handler
pub struct Tool {
    pub name: String,
    pub description: String,
    handler: ToolHandler,
}

impl Tool {
    pub fn new<F, Fut>(name: &str, description: &str, handler: F) -> Self
    where
        F: Fn(Map<String, Value>, ToolContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<ToolOutput, HandlerError>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            handler: Arc::new(move |params, ctx| Box::pin(handler(params, ctx))),
        }
    }
}

#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Tool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool, replacing any tool with the same name
    pub fn register(&mut self, tool: Tool) {
        info!("Registered tool: {}", tool.name);
        self.tools.insert(tool.name.clone(), tool);
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    /// Sorted tool names
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolMetadata {
    pub duration_ms: u64,
    pub tokens_used: Option<u64>,
    pub cost: Option<f64>,
    pub cache_hit: bool,
}

impl ToolMetadata {
    fn timed(started: Instant) -> Self {
        Self {
            duration_ms: started.elapsed().as_millis() as u64,
            tokens_used: None,
            cost: None,
            cache_hit: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct ToolError {
    pub code: String,
    pub message: String,
    pub recoverable: bool,
}

impl ToolError {
    pub const UNKNOWN_TOOL: &'static str = "unknown_tool";
    pub const HANDLER_ERROR: &'static str = "handler_error";
    pub const TIMEOUT: &'static str = "timeout";

    fn new(code: &str, message: String, recoverable: bool) -> Self {
        Self {
            code: code.to_string(),
            message,
            recoverable,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub request_id: String,
    pub tool_name: String,
    pub success: bool,
    pub content: String,
    pub data: Option<Value>,
    pub error: Option<ToolError>,
    pub metadata: ToolMetadata,
}

impl ToolResult {
    fn failure(request: &ToolRequest, error: ToolError, metadata: ToolMetadata) -> Self {
        Self {
            request_id: request.request_id.clone(),
            tool_name: request.tool_name.clone(),
            success: false,
            content: error.message.clone(),
            data: None,
            error: Some(error),
            metadata,
        }
    }
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    timeout: Duration,
}

impl ToolExecutor {
    pub fn new(registry: Arc<ToolRegistry>, timeout: Duration) -> Self {
        Self { registry, timeout }
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    pub async fn execute(&self, request: ToolRequest) -> ToolResult {
        let started = Instant::now();

        let Some(tool) = self.registry.get(&request.tool_name) else {
            warn!("Unknown tool requested: {}", request.tool_name);
            let error = ToolError::new(
                ToolError::UNKNOWN_TOOL,
                format!("Unknown tool: {}", request.tool_name),
                false,
            );
            return ToolResult::failure(&request, error, ToolMetadata::timed(started));
        };

        let handler = Arc::clone(&tool.handler);
        let params = request.parameters.clone();
        let ctx = request.context.clone();
        // Handler is called inside the future so a panic while building it is caught too
        let invocation = AssertUnwindSafe(async move { handler(params, ctx).await }).catch_unwind();

        let outcome = tokio::time::timeout(self.timeout, invocation).await;
        let metadata = ToolMetadata::timed(started);

        match outcome {
            Ok(Ok(Ok(output))) => {
                debug!(
                    "Tool {} ({}) succeeded in {}ms",
                    request.tool_name, request.request_id, metadata.duration_ms
                );
                ToolResult {
                    request_id: request.request_id,
                    tool_name: request.tool_name,
                    success: true,
                    content: output.content,
                    data: output.data,
                    error: None,
                    metadata: ToolMetadata {
                        tokens_used: output.tokens_used,
                        cost: output.cost,
                        cache_hit: output.cache_hit,
                        ..metadata
                    },
                }
            }
            Ok(Ok(Err(e))) => {
                warn!("Tool {} failed: {}", request.tool_name, e.message);
                let error = ToolError::new(ToolError::HANDLER_ERROR, e.message, e.recoverable.unwrap_or(true));
                ToolResult::failure(&request, error, metadata)
            }
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                warn!("Tool {} panicked: {}", request.tool_name, message);
                let error = ToolError::new(ToolError::HANDLER_ERROR, format!("Handler panicked: {}", message), true);
                ToolResult::failure(&request, error, metadata)
            }
            Err(_) => {
                warn!("Tool {} timed out after {:?}", request.tool_name, self.timeout);
                let error = ToolError::new(
                    ToolError::TIMEOUT,
                    format!("Tool timed out after {:?}", self.timeout),
                    true,
                );
                ToolResult::failure(&request, error, metadata)
            }
        }
    }

    /// Execute a call parsed from agent text
    pub async fn execute_call(&self, call: &ToolCall, context: &ToolContext) -> ToolResult {
        let request = ToolRequest::new(&call.name, call.arguments.clone(), context.clone());
        self.execute(request).await
    }

    /// Execute several calls concurrently; results keep call order
    pub async fn execute_all(&self, calls: &[ToolCall], context: &ToolContext) -> Vec<ToolResult> {
        join_all(calls.iter().map(|call| self.execute_call(call, context))).await
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
