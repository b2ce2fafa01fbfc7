use serde::{Deserialize, Serialize};

/// Default output-token budget applied when the caller omits `max_tokens`.
pub const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 8192;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One conversation turn in the normalized internal request.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Normalized chat request, dialect-independent.
///
/// Invariants (enforced by the downstream adapter, relied on by backends):
/// - `turns` is non-empty and contains only user/assistant roles.
/// - `turns` never begins with an assistant turn.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub turns: Vec<Turn>,
    pub system: Option<String>,
    pub max_output_tokens: Option<u32>,
    pub stream: bool,
    pub request_id: Option<String>,
}

/// Completed (non-streaming) chat result produced by a backend.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChatResponse {
    pub model: String,
    pub text: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub stop_reason: Option<String>,
    pub backend: String,
}

/// Fixed alias table from short model names to full dated identifiers.
/// Unmapped names pass through unchanged.
const MODEL_ALIASES: &[(&str, &str)] = &[
    ("opus", "claude-3-opus-20240229"),
    ("sonnet", "claude-3-5-sonnet-20241022"),
    ("haiku", "claude-3-5-haiku-20241022"),
    ("opus-3", "claude-3-opus-20240229"),
    ("sonnet-3.5", "claude-3-5-sonnet-20241022"),
    ("sonnet-3.7", "claude-3-7-sonnet-20250219"),
    ("haiku-3.5", "claude-3-5-haiku-20241022"),
];

/// Resolve a short model alias to its full dated identifier.
pub fn resolve_model_alias(model: &str) -> &str {
    for (alias, full) in MODEL_ALIASES {
        if *alias == model {
            return full;
        }
    }
    model
}

/// Model identifiers advertised by `GET /v1/models`.
pub fn supported_models() -> Vec<&'static str> {
    let mut ids: Vec<&'static str> = MODEL_ALIASES.iter().map(|(_, full)| *full).collect();
    ids.sort_unstable();
    ids.dedup();
    ids
}
