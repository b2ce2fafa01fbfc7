use serde::Serialize;

/// Structured, backend-agnostic completion log event.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CompletionLog {
    pub backend: Option<String>,
    pub model: Option<String>,
    pub request_id: Option<String>,
    pub created_at_ms: Option<u64>,
    pub latency_ms: Option<u64>,

    pub stop_reason: Option<String>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,

    pub text: Option<String>,
    pub tokens_prompt: Option<u32>,
    pub tokens_completion: Option<u32>,
    pub tokens_total: Option<u32>,
}

impl CompletionLog {
    pub fn new() -> Self { Self::default() }
    pub fn backend(mut self, v: &str) -> Self { self.backend = Some(v.to_string()); self }
    pub fn model(mut self, v: &str) -> Self { self.model = Some(v.to_string()); self }
    pub fn request_id_opt(mut self, v: Option<&str>) -> Self { self.request_id = v.map(|s| s.to_string()); self }
    pub fn created_at_ms(mut self, v: u64) -> Self { self.created_at_ms = Some(v); self }
    pub fn latency_ms(mut self, v: u64) -> Self { self.latency_ms = Some(v); self }
    pub fn stop_reason_opt(mut self, v: Option<&str>) -> Self { self.stop_reason = v.map(|s| s.to_string()); self }
    pub fn error_kind_opt(mut self, v: Option<&str>) -> Self { self.error_kind = v.map(|s| s.to_string()); self }
    pub fn error_message(mut self, v: &str) -> Self { self.error_message = Some(v.to_string()); self }
    pub fn text_opt(mut self, v: Option<&str>) -> Self { self.text = v.map(|s| s.to_string()); self }
    pub fn tokens(mut self, p: Option<u32>, c: Option<u32>, t: Option<u32>) -> Self {
        self.tokens_prompt = p; self.tokens_completion = c; self.tokens_total = t; self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn completion_log_serializes() {
        let log = CompletionLog::new()
            .backend("anthropic")
            .model("claude-3-5-sonnet-20241022")
            .request_id_opt(Some("req-abc"))
            .latency_ms(42)
            .tokens(Some(10), Some(20), Some(30))
            .stop_reason_opt(Some("end_turn"));

        let as_json = serde_json::to_value(&log).unwrap();
        assert_eq!(as_json["backend"], json!("anthropic"));
        assert_eq!(as_json["model"], json!("claude-3-5-sonnet-20241022"));
        assert_eq!(as_json["latency_ms"], json!(42));
        assert_eq!(as_json["tokens_total"], json!(30));
        assert_eq!(as_json["stop_reason"], json!("end_turn"));
    }
}
