//! Tool-Call Protocol
//!
//! Agents request tools by embedding delimited blocks in their free-form text:
//!
//! ```text
//! <tool_use>
//! { "tool": "read_file", "arguments": { "path": "src/main.rs" } }
//! </tool_use>
//! ```
//!
//! Delimiters are case-sensitive and do not nest: the first closing tag after
//! an opening tag ends the block. A block whose body is not a valid call is
//! skipped; scanning continues with the next block.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::warn;

pub const TOOL_OPEN: &str = "<tool_use>";
pub const TOOL_CLOSE: &str = "</tool_use>";

static BLOCK_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<tool_use>(.*?)</tool_use>").expect("static regex")
});

/// A tool invocation parsed from agent text
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    /// Always a mapping, empty when the block gave none
    pub arguments: Map<String, Value>,
}

impl ToolCall {
    pub fn new(name: &str, arguments: Map<String, Value>) -> Self {
        Self {
            name: name.to_string(),
            arguments,
        }
    }
}

/// Why a block was skipped
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Tool call body is not valid JSON: {0}")]
    InvalidJson(#[from] serde_json::Error),

    #[error("Tool call body must be a JSON object")]
    NotAnObject,

    #[error("Tool call is missing a string 'tool' field")]
    MissingTool,

    #[error("Tool call 'arguments' must be an object")]
    InvalidArguments,
}

/// True iff at least one complete delimited block exists
pub fn has_tool_calls(text: &str) -> bool {
    BLOCK_PATTERN.is_match(text)
}

/// All well-formed tool calls in document order
pub fn parse_tool_calls(text: &str) -> Vec<ToolCall> {
    let mut calls = Vec::new();

    for (index, caps) in BLOCK_PATTERN.captures_iter(text).enumerate() {
        match parse_block(&caps[1]) {
            Ok(call) => calls.push(call),
            Err(e) => warn!("Skipping tool call block {}: {}", index, e),
        }
    }

    calls
}

fn parse_block(body: &str) -> Result<ToolCall, ProtocolError> {
    let value: Value = serde_json::from_str(body.trim())?;
    let Value::Object(mut object) = value else {
        return Err(ProtocolError::NotAnObject);
    };

    let name = match object.remove("tool") {
        Some(Value::String(name)) if !name.trim().is_empty() => name,
        _ => return Err(ProtocolError::MissingTool),
    };

    let arguments = match object.remove("arguments") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(arguments)) => arguments,
        Some(_) => return Err(ProtocolError::InvalidArguments),
    };

    Ok(ToolCall { name, arguments })
}

/// Strip every block, whether or not its body parses
///
/// Text without blocks comes back untouched. Whitespace is only normalized
/// where a block was cut out: the two sides are joined by one blank line, or
/// the blank lines are dropped when one side is empty. Everything else keeps
/// its original layout.
pub fn remove_tool_calls(text: &str) -> String {
    if !has_tool_calls(text) {
        return text.to_string();
    }

    let mut result = String::with_capacity(text.len());
    let mut last = 0;
    for block in BLOCK_PATTERN.find_iter(text) {
        if last == 0 {
            result.push_str(&text[..block.start()]);
        } else {
            join_at_seam(&mut result, &text[last..block.start()]);
        }
        last = block.end();
    }
    join_at_seam(&mut result, &text[last..]);
    result
}

// Append `right` to `left` across the gap a removed block left behind
fn join_at_seam(left: &mut String, right: &str) {
    let inline = !left.ends_with(['\n', '\r'])
        && !left.trim_end_matches([' ', '\t']).is_empty()
        && !right.starts_with(['\n', '\r'])
        && !right.trim_start_matches([' ', '\t']).is_empty();
    if inline {
        // Block sat inside a line of prose
        let kept = left.trim_end_matches([' ', '\t']).len();
        left.truncate(kept);
        left.push(' ');
        left.push_str(right.trim_start_matches([' ', '\t']));
        return;
    }

    let kept = left.trim_end().len();
    left.truncate(kept);
    let right = skip_blank_lines(right);
    match (left.is_empty(), right.trim().is_empty()) {
        (_, true) => {}
        (true, false) => left.push_str(right),
        (false, false) => {
            left.push_str("\n\n");
            left.push_str(right);
        }
    }
}

// Drop whole leading lines that hold only whitespace, keeping the indentation
// of the first line with content
fn skip_blank_lines(mut text: &str) -> &str {
    loop {
        match text.find('\n') {
            Some(end) if text[..end].trim().is_empty() => text = &text[end + 1..],
            Some(_) => return text,
            None if text.trim().is_empty() => return "",
            None => return text,
        }
    }
}

/// Render a call in wire format
pub fn format_tool_call(call: &ToolCall) -> String {
    let body = serde_json::json!({
        "tool": call.name,
        "arguments": call.arguments,
    });
    format!("{}\n{}\n{}", TOOL_OPEN, body, TOOL_CLOSE)
}
