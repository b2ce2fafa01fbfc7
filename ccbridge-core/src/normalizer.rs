use crate::model::{ChatRequest, DEFAULT_MAX_OUTPUT_TOKENS, resolve_model_alias};
use unicode_normalization::UnicodeNormalization;

fn clean_text(s: &str) -> String {
    // Unicode NFC normalization + BOM strip + CRLF -> LF + trim
    let mut t = s.nfc().collect::<String>();
    if t.starts_with('\u{FEFF}') {
        t.remove(0);
    }
    if t.contains("\r\n") {
        t = t.replace("\r\n", "\n");
    }
    t.trim().to_string()
}

/// Normalize an internal chat request before it reaches a backend:
/// clean every turn and the system text, resolve the model alias, and
/// fill in the default output-token budget.
pub fn normalize_chat(mut req: ChatRequest) -> ChatRequest {
    for turn in &mut req.turns {
        turn.content = clean_text(&turn.content);
    }
    if let Some(system) = req.system.take() {
        let cleaned = clean_text(&system);
        req.system = if cleaned.is_empty() { None } else { Some(cleaned) };
    }
    req.model = resolve_model_alias(&req.model).to_string();
    if req.max_output_tokens.is_none() {
        req.max_output_tokens = Some(DEFAULT_MAX_OUTPUT_TOKENS);
    }
    req
}
