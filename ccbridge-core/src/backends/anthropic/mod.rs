use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};

use crate::{
    backend::ChatBackend,
    credentials::CredentialProvider,
    error::CoreResult,
    http_client::{HttpClient, RequestCtx},
    model::{ChatRequest, ChatResponse, Role},
    stream::BoxStreamEv,
    translate::{StreamTranslator, UpstreamEvent},
};

/// API version header required by the vendor Messages API.
const ANTHROPIC_API_VERSION: &str = "2023-06-01";

/// Tokens with this prefix came from the OAuth flow and authenticate with a
/// Bearer header plus the beta opt-in, not `x-api-key`.
const OAUTH_TOKEN_PREFIX: &str = "sk-ant-oat";
const OAUTH_BETA: &str = "oauth-2025-04-20";

/// OAuth tokens are only accepted when the request identifies as the first-
/// party CLI, which requires this exact system preamble.
const OAUTH_IDENTITY_PREAMBLE: &str =
    "You are Claude Code, Anthropic's official CLI for Claude.";

#[derive(Clone)]
pub struct AnthropicClient {
    http: HttpClient,
    credentials: Arc<CredentialProvider>,
    base: String,
    api_version: String,
    name: String,
}

impl AnthropicClient {
    pub fn new(http: HttpClient, credentials: Arc<CredentialProvider>, base: String) -> Self {
        Self {
            http,
            credentials,
            base,
            api_version: ANTHROPIC_API_VERSION.to_string(),
            name: "anthropic".into(),
        }
    }

    pub fn with_api_version(mut self, version: impl Into<String>) -> Self {
        self.api_version = version.into();
        self
    }

    fn headers(token: &str, api_version: &str) -> Vec<(String, String)> {
        let mut headers = vec![("anthropic-version".to_string(), api_version.to_string())];
        if token.starts_with(OAUTH_TOKEN_PREFIX) {
            headers.push(("Authorization".to_string(), format!("Bearer {token}")));
            headers.push(("anthropic-beta".to_string(), OAUTH_BETA.to_string()));
        } else {
            headers.push(("x-api-key".to_string(), token.to_string()));
        }
        headers
    }

    /// OAuth tokens require the CLI identity as the leading system text; a
    /// caller-supplied system prompt is appended after it.
    fn system_for(token: &str, user_system: Option<&str>) -> Option<String> {
        if token.starts_with(OAUTH_TOKEN_PREFIX) {
            Some(match user_system {
                Some(s) => format!("{OAUTH_IDENTITY_PREAMBLE}\n\n{s}"),
                None => OAUTH_IDENTITY_PREAMBLE.to_string(),
            })
        } else {
            user_system.map(|s| s.to_string())
        }
    }

    fn wire_messages(req: &ChatRequest) -> Vec<AMessage<'_>> {
        req.turns
            .iter()
            .map(|t| AMessage {
                role: match t.role {
                    Role::Assistant => "assistant",
                    _ => "user",
                },
                content: vec![AContent::Text { text: &t.content }],
            })
            .collect()
    }
}

// ===== vendor wire types (Messages API) =====

#[derive(Serialize)]
struct AMsgReq<'a> {
    model: &'a str,
    messages: Vec<AMessage<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    max_tokens: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Serialize)]
struct AMessage<'a> {
    role: &'a str,
    content: Vec<AContent<'a>>, // the API requires an array of content blocks
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AContent<'a> {
    Text { text: &'a str },
}

#[derive(Deserialize)]
struct AMsgResp {
    #[serde(rename = "id")]
    _id: String,
    model: Option<String>,
    content: Vec<ARespContent>,
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<AUsage>,
}

#[derive(Deserialize)]
struct ARespContent {
    #[allow(dead_code)]
    r#type: String,
    text: Option<String>,
}

#[derive(Deserialize, Default)]
struct AUsage {
    input_tokens: Option<u32>,
    output_tokens: Option<u32>,
}

// ===== SSE decoding =====

#[derive(Deserialize)]
struct SseData {
    r#type: String,
    #[serde(default)]
    message: Option<SseMessage>,
    #[serde(default)]
    delta: Option<SseDelta>,
    #[serde(default)]
    usage: Option<AUsage>,
}

#[derive(Deserialize)]
struct SseMessage {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    usage: Option<AUsage>,
}

#[derive(Deserialize)]
struct SseDelta {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    stop_reason: Option<String>,
}

/// Decode one SSE line into an upstream event. `event:` lines, blank
/// separators, and undecodable payloads all yield `None` and are skipped;
/// recognized-but-untranslated event types yield `Other`.
fn decode_sse_line(line: &str) -> Option<UpstreamEvent> {
    let payload = line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:"))?;
    let data: SseData = serde_json::from_str(payload.trim()).ok()?;
    match data.r#type.as_str() {
        "message_start" => {
            let msg = data.message?;
            Some(UpstreamEvent::MessageStart {
                model: msg.model.unwrap_or_default(),
                input_tokens: msg.usage.and_then(|u| u.input_tokens).unwrap_or(0),
            })
        }
        "content_block_delta" => {
            let text = data.delta.and_then(|d| d.text)?;
            Some(UpstreamEvent::ContentDelta(text))
        }
        "message_delta" => Some(UpstreamEvent::MessageDelta {
            output_tokens: data.usage.and_then(|u| u.output_tokens).unwrap_or(0),
            stop_reason: data.delta.and_then(|d| d.stop_reason),
        }),
        "message_stop" => Some(UpstreamEvent::MessageStop),
        _ => Some(UpstreamEvent::Other),
    }
}

#[async_trait]
impl ChatBackend for AnthropicClient {
    fn name(&self) -> &str {
        &self.name
    }

    async fn chat(&self, req: ChatRequest) -> CoreResult<ChatResponse> {
        let token = self.credentials.bearer()?;
        let payload = AMsgReq {
            model: &req.model,
            messages: Self::wire_messages(&req),
            system: Self::system_for(&token, req.system.as_deref()),
            max_tokens: req.max_output_tokens.unwrap_or(crate::model::DEFAULT_MAX_OUTPUT_TOKENS),
            stream: false,
        };

        let url = format!("{}/v1/messages", self.base);
        let ctx = RequestCtx {
            request_id: req.request_id.as_deref(),
        };
        let headers = Self::headers(&token, &self.api_version);
        let header_pairs: Vec<(&str, &str)> = headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let (resp, latency_ms) = self
            .http
            .post_json::<_, AMsgResp>(&url, &payload, &header_pairs, &ctx)
            .await?;

        let text = resp
            .content
            .iter()
            .filter_map(|c| c.text.as_deref())
            .collect::<Vec<_>>()
            .join("");
        let input_tokens = resp
            .usage
            .as_ref()
            .and_then(|u| u.input_tokens)
            .unwrap_or(0);
        let output_tokens = resp
            .usage
            .as_ref()
            .and_then(|u| u.output_tokens)
            .unwrap_or(0);

        let out = ChatResponse {
            model: resp.model.unwrap_or(req.model),
            text,
            input_tokens,
            output_tokens,
            stop_reason: resp.stop_reason,
            backend: self.name.clone(),
        };

        let clog = crate::telemetry::CompletionLog::new()
            .backend(&self.name)
            .model(&out.model)
            .request_id_opt(req.request_id.as_deref())
            .created_at_ms(started)
            .latency_ms(latency_ms as u64)
            .stop_reason_opt(out.stop_reason.as_deref())
            .text_opt(Some(&out.text))
            .tokens(
                Some(input_tokens),
                Some(output_tokens),
                input_tokens.checked_add(output_tokens),
            );
        crate::telemetry::emit_completion(clog);
        Ok(out)
    }

    async fn chat_stream(&self, req: ChatRequest) -> CoreResult<BoxStreamEv> {
        let token = self.credentials.bearer()?;
        let payload = AMsgReq {
            model: &req.model,
            messages: Self::wire_messages(&req),
            system: Self::system_for(&token, req.system.as_deref()),
            max_tokens: req.max_output_tokens.unwrap_or(crate::model::DEFAULT_MAX_OUTPUT_TOKENS),
            stream: true,
        };

        let url = format!("{}/v1/messages", self.base);
        let ctx = RequestCtx {
            request_id: req.request_id.as_deref(),
        };
        let headers = Self::headers(&token, &self.api_version);
        let header_pairs: Vec<(&str, &str)> = headers
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();

        let mut lines = self
            .http
            .post_sse_lines(&url, &payload, &header_pairs, &ctx)
            .await?;

        let backend = self.name.clone();
        let request_id = req.request_id.clone();
        let model = req.model.clone();
        let started = SystemTime::now();

        let stream = async_stream::stream! {
            let mut tr = StreamTranslator::new();
            while let Some(item) = lines.next().await {
                match item {
                    Ok(sse) => {
                        if let Some(ev) = decode_sse_line(&sse.line) {
                            for out in tr.on_event(ev) {
                                yield out;
                            }
                            if tr.is_terminal() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        for out in tr.fail(e) {
                            yield out;
                        }
                        break;
                    }
                }
            }
            // Upstream closed without message_stop: finish rather than hang.
            if !tr.is_terminal() {
                for out in tr.finish() {
                    yield out;
                }
            }

            let (tin, tout) = tr.usage();
            let latency = started.elapsed().unwrap_or_default().as_millis() as u64;
            let clog = crate::telemetry::CompletionLog::new()
                .backend(&backend)
                .model(tr.model().unwrap_or(&model))
                .request_id_opt(request_id.as_deref())
                .latency_ms(latency)
                .stop_reason_opt(tr.stop_reason())
                .text_opt(Some(tr.text()))
                .tokens(Some(tin), Some(tout), tin.checked_add(tout));
            crate::telemetry::emit_completion(clog);
        };
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Turn;
    use crate::stream::StreamEvent;
    use httpmock::prelude::*;

    fn provider_with_token(token: &str) -> Arc<CredentialProvider> {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("credentials.json");
        std::fs::write(
            &path,
            format!(r#"{{"claudeAiOauth":{{"accessToken":"{token}"}}}}"#),
        )
        .unwrap();
        // Leak the dir so the profile file outlives the test body.
        std::mem::forget(dir);
        Arc::new(CredentialProvider::with_default_sources(
            Some(path),
            "unused-service",
        ))
    }

    fn mk_req(stream: bool) -> ChatRequest {
        ChatRequest {
            model: "claude-3-5-sonnet-20241022".into(),
            turns: vec![Turn::user("hi")],
            system: None,
            max_output_tokens: Some(128),
            stream,
            request_id: None,
        }
    }

    #[test]
    fn api_key_headers() {
        let headers = AnthropicClient::headers("sk-ant-api03-xyz", ANTHROPIC_API_VERSION);
        assert!(headers.iter().any(|(k, v)| k == "x-api-key" && v == "sk-ant-api03-xyz"));
        assert!(headers.iter().all(|(k, _)| k != "Authorization"));
        assert!(headers
            .iter()
            .any(|(k, v)| k == "anthropic-version" && v == ANTHROPIC_API_VERSION));
    }

    #[test]
    fn oauth_headers_use_bearer_and_beta() {
        let headers = AnthropicClient::headers("sk-ant-oat01-xyz", ANTHROPIC_API_VERSION);
        assert!(headers
            .iter()
            .any(|(k, v)| k == "Authorization" && v == "Bearer sk-ant-oat01-xyz"));
        assert!(headers.iter().any(|(k, v)| k == "anthropic-beta" && v == OAUTH_BETA));
        assert!(headers.iter().all(|(k, _)| k != "x-api-key"));
    }

    #[test]
    fn oauth_system_prepends_identity() {
        let sys = AnthropicClient::system_for("sk-ant-oat01-x", Some("Be brief")).unwrap();
        assert!(sys.starts_with(OAUTH_IDENTITY_PREAMBLE));
        assert!(sys.ends_with("Be brief"));

        let bare = AnthropicClient::system_for("sk-ant-oat01-x", None).unwrap();
        assert_eq!(bare, OAUTH_IDENTITY_PREAMBLE);

        assert_eq!(
            AnthropicClient::system_for("sk-ant-api03-x", Some("Be brief")).as_deref(),
            Some("Be brief")
        );
        assert!(AnthropicClient::system_for("sk-ant-api03-x", None).is_none());
    }

    #[test]
    fn decode_classifies_event_types() {
        assert_eq!(
            decode_sse_line(
                r#"data: {"type":"content_block_delta","delta":{"type":"text_delta","text":"Hi"}}"#
            ),
            Some(UpstreamEvent::ContentDelta("Hi".into()))
        );
        assert_eq!(
            decode_sse_line(
                r#"data: {"type":"message_start","message":{"model":"m","usage":{"input_tokens":7}}}"#
            ),
            Some(UpstreamEvent::MessageStart {
                model: "m".into(),
                input_tokens: 7
            })
        );
        assert_eq!(
            decode_sse_line(
                r#"data: {"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":4}}"#
            ),
            Some(UpstreamEvent::MessageDelta {
                output_tokens: 4,
                stop_reason: Some("end_turn".into())
            })
        );
        assert_eq!(
            decode_sse_line(r#"data: {"type":"message_stop"}"#),
            Some(UpstreamEvent::MessageStop)
        );
        assert_eq!(
            decode_sse_line(r#"data: {"type":"ping"}"#),
            Some(UpstreamEvent::Other)
        );
    }

    #[test]
    fn decode_skips_non_data_and_garbage() {
        assert_eq!(decode_sse_line("event: message_start"), None);
        assert_eq!(decode_sse_line(""), None);
        assert_eq!(decode_sse_line("data: not-json"), None);
    }

    // CompletionLog test sink & helpers
    static COMPLETION_LOGS: once_cell::sync::Lazy<std::sync::Mutex<Vec<crate::telemetry::CompletionLog>>> =
        once_cell::sync::Lazy::new(|| std::sync::Mutex::new(Vec::new()));

    struct CaptureSink;
    impl crate::telemetry::TelemetrySink for CaptureSink {
        fn record_completion(&self, log: crate::telemetry::CompletionLog) {
            COMPLETION_LOGS.lock().unwrap().push(log);
        }
    }

    #[tokio::test]
    async fn chat_emits_completion_log() {
        let _ = crate::telemetry::set_telemetry_sink(Arc::new(CaptureSink));
        crate::telemetry::test_set_capture_enabled(true);
        COMPLETION_LOGS.lock().unwrap().clear();

        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/messages");
            then.status(200)
                .header("content-type", "application/json")
                .body(
                    r#"{ "id":"x", "model":"m", "content":[{"type":"text","text":"ok"}],
                        "stop_reason":"end_turn",
                        "usage":{"input_tokens":4,"output_tokens":1} }"#,
                );
        });

        let client = AnthropicClient::new(
            HttpClient::new_default().unwrap(),
            provider_with_token("sk-ant-api03-test"),
            server.base_url(),
        );
        let _ = client.chat(mk_req(false)).await.unwrap();
        crate::telemetry::test_set_capture_enabled(false);

        let logs = COMPLETION_LOGS.lock().unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].backend.as_deref(), Some("anthropic"));
        assert_eq!(logs[0].text.as_deref(), Some("ok"));
        assert_eq!(logs[0].tokens_total, Some(5));
        assert_eq!(logs[0].stop_reason.as_deref(), Some("end_turn"));
    }

    #[tokio::test]
    async fn chat_200_maps_fields() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/messages")
                .header("x-api-key", "sk-ant-api03-test")
                .header("anthropic-version", ANTHROPIC_API_VERSION);
            then.status(200)
                .header("content-type", "application/json")
                .body(
                    r#"{
                    "id": "msg_123",
                    "model": "claude-3-5-sonnet-20241022",
                    "content": [ { "type": "text", "text": "hello there" } ],
                    "stop_reason": "end_turn",
                    "usage": { "input_tokens": 9, "output_tokens": 3 }
                }"#,
                );
        });

        let client = AnthropicClient::new(
            HttpClient::new_default().unwrap(),
            provider_with_token("sk-ant-api03-test"),
            server.base_url(),
        );

        let resp = client.chat(mk_req(false)).await.expect("chat ok");
        assert_eq!(resp.text, "hello there");
        assert_eq!(resp.stop_reason.as_deref(), Some("end_turn"));
        assert_eq!(resp.backend, "anthropic");
        assert_eq!(resp.input_tokens, 9);
        assert_eq!(resp.output_tokens, 3);
    }

    #[tokio::test]
    async fn oauth_chat_sends_identity_preamble() {
        let server = MockServer::start();
        let m = server.mock(|when, then| {
            when.method(POST)
                .path("/v1/messages")
                .header_exists("authorization")
                .body_contains("You are Claude Code");
            then.status(200)
                .header("content-type", "application/json")
                .body(r#"{ "id":"x", "content":[{"type":"text","text":"ok"}] }"#);
        });

        let client = AnthropicClient::new(
            HttpClient::new_default().unwrap(),
            provider_with_token("sk-ant-oat01-test"),
            server.base_url(),
        );

        let _ = client.chat(mk_req(false)).await.unwrap();
        m.assert();
    }

    #[tokio::test]
    async fn chat_stream_translates_sse() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/messages");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body(concat!(
                    "event: message_start\n",
                    "data: {\"type\":\"message_start\",\"message\":{\"model\":\"m\",\"usage\":{\"input_tokens\":5}}}\n\n",
                    "event: content_block_delta\n",
                    "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"Hel\"}}\n\n",
                    "data: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"lo\"}}\n\n",
                    "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":2}}\n\n",
                    "data: {\"type\":\"message_stop\"}\n\n",
                ));
        });

        let client = AnthropicClient::new(
            HttpClient::new_default().unwrap(),
            provider_with_token("sk-ant-api03-test"),
            server.base_url(),
        );

        let stream = client.chat_stream(mk_req(true)).await.unwrap();
        let events: Vec<StreamEvent> = stream.collect().await;

        assert!(matches!(events[0], StreamEvent::Role));
        assert_eq!(events[1].as_content(), Some("Hel"));
        assert_eq!(events[2].as_content(), Some("lo"));
        match &events[3] {
            StreamEvent::Finish {
                reason,
                input_tokens,
                output_tokens,
            } => {
                assert_eq!(reason, "end_turn");
                assert_eq!(*input_tokens, 5);
                assert_eq!(*output_tokens, 2);
            }
            other => panic!("expected Finish, got {other:?}"),
        }
        assert!(matches!(events[4], StreamEvent::Done));
        assert_eq!(events.len(), 5);
    }

    #[tokio::test]
    async fn chat_stream_finishes_on_truncated_upstream() {
        let server = MockServer::start();
        let _m = server.mock(|when, then| {
            when.method(POST).path("/v1/messages");
            then.status(200)
                .header("content-type", "text/event-stream")
                .body("data: {\"type\":\"content_block_delta\",\"delta\":{\"text\":\"partial\"}}\n\n");
        });

        let client = AnthropicClient::new(
            HttpClient::new_default().unwrap(),
            provider_with_token("sk-ant-api03-test"),
            server.base_url(),
        );

        let stream = client.chat_stream(mk_req(true)).await.unwrap();
        let events: Vec<StreamEvent> = stream.collect().await;
        assert!(matches!(events.last(), Some(StreamEvent::Done)));
        assert_eq!(events[1].as_content(), Some("partial"));
    }
}
