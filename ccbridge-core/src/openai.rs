//! Downstream chat-completions dialect.
//!
//! Decodes incoming chat-completion requests into the internal [`ChatRequest`]
//! and encodes internal results back out, both as a complete response body
//! and as streaming chunk payloads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::{BridgeError, CoreResult};
use crate::model::{ChatRequest, ChatResponse, Role, Turn};

/// Placeholder user turn inserted when a conversation opens with an
/// assistant message, which the upstream API rejects.
const LEADING_TURN_PLACEHOLDER: &str = "...";

// ===== incoming wire types =====

/// Incoming request body. Unknown fields (temperature, tools, ...) are
/// accepted and ignored.
#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatCompletionMessage>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct ChatCompletionMessage {
    pub role: String,
    #[serde(default)]
    pub content: MessageContent,
}

/// Message content in the incoming dialect is either a plain string or an
/// array of typed parts; only text parts carry over.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl Default for MessageContent {
    fn default() -> Self {
        Self::Text(String::new())
    }
}

impl MessageContent {
    fn into_text(self) -> String {
        match self {
            Self::Text(s) => s,
            Self::Parts(parts) => parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join(""),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ContentPart {
    #[allow(dead_code)]
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub text: Option<String>,
}

/// Decode an incoming request into the internal form.
///
/// System messages are pulled out of the turn list and joined (blank-line
/// separated) into the single system field. A conversation that opens with
/// an assistant turn gets a placeholder user turn prepended.
pub fn to_internal(req: ChatCompletionRequest) -> CoreResult<ChatRequest> {
    if req.messages.is_empty() {
        return Err(BridgeError::validation(
            "invalid_messages",
            "messages must not be empty",
        ));
    }

    let mut system_parts: Vec<String> = Vec::new();
    let mut turns: Vec<Turn> = Vec::new();

    for msg in req.messages {
        let content = msg.content.into_text();
        match msg.role.as_str() {
            "system" | "developer" => system_parts.push(content),
            "assistant" => turns.push(Turn {
                role: Role::Assistant,
                content,
            }),
            // "user", "tool", and anything else carries user-side content.
            _ => turns.push(Turn {
                role: Role::User,
                content,
            }),
        }
    }

    if turns.is_empty() {
        return Err(BridgeError::validation(
            "invalid_messages",
            "messages must contain at least one user or assistant message",
        ));
    }

    if turns[0].role == Role::Assistant {
        turns.insert(0, Turn::user(LEADING_TURN_PLACEHOLDER));
    }

    let system = if system_parts.is_empty() {
        None
    } else {
        Some(system_parts.join("\n\n"))
    };

    Ok(ChatRequest {
        model: req.model,
        turns,
        system,
        max_output_tokens: req.max_tokens,
        stream: req.stream.unwrap_or(false),
        request_id: None,
    })
}

// ===== outgoing wire types =====

#[derive(Debug, Serialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

fn finish_reason(stop_reason: Option<&str>) -> &'static str {
    match stop_reason {
        Some("max_tokens") => "length",
        _ => "stop",
    }
}

static COMPLETION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Fresh response id, unique per process.
pub fn next_completion_id() -> String {
    let n = COMPLETION_COUNTER.fetch_add(1, Ordering::Relaxed);
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    format!("chatcmpl-{ts:x}{n:04}")
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Encode a completed response body.
pub fn from_internal(resp: &ChatResponse, id: &str, created: u64) -> serde_json::Value {
    json!({
        "id": id,
        "object": "chat.completion",
        "created": created,
        "model": resp.model,
        "choices": [{
            "index": 0,
            "message": { "role": "assistant", "content": resp.text },
            "finish_reason": finish_reason(resp.stop_reason.as_deref()),
        }],
        "usage": Usage {
            prompt_tokens: resp.input_tokens,
            completion_tokens: resp.output_tokens,
            total_tokens: resp.input_tokens.saturating_add(resp.output_tokens),
        },
    })
}

/// Streaming chunk carrying the assistant role announcement.
pub fn chunk_role(id: &str, created: u64, model: &str) -> serde_json::Value {
    chunk(id, created, model, json!({ "role": "assistant" }), None)
}

/// Streaming chunk carrying one content delta.
pub fn chunk_content(id: &str, created: u64, model: &str, delta: &str) -> serde_json::Value {
    chunk(id, created, model, json!({ "content": delta }), None)
}

/// Final streaming chunk: empty delta plus the finish reason and usage.
pub fn chunk_finish(
    id: &str,
    created: u64,
    model: &str,
    stop_reason: &str,
    input_tokens: u32,
    output_tokens: u32,
) -> serde_json::Value {
    let mut v = chunk(
        id,
        created,
        model,
        json!({}),
        Some(finish_reason(Some(stop_reason))),
    );
    v["usage"] = serde_json::to_value(Usage {
        prompt_tokens: input_tokens,
        completion_tokens: output_tokens,
        total_tokens: input_tokens.saturating_add(output_tokens),
    })
    .unwrap_or_default();
    v
}

fn chunk(
    id: &str,
    created: u64,
    model: &str,
    delta: serde_json::Value,
    finish: Option<&str>,
) -> serde_json::Value {
    json!({
        "id": id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish,
        }],
    })
}

/// Error payload sent in-band once streaming has already begun.
pub fn stream_error_payload(err: &BridgeError) -> serde_json::Value {
    json!({
        "error": {
            "message": err.to_string(),
            "type": "api_error",
            "code": err.wire_code(),
        }
    })
}
