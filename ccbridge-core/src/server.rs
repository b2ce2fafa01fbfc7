//! HTTP surface: health, model listing, and the chat-completions endpoint.
//!
//! Error mapping: validation failures are 400, everything else that happens
//! before the response body starts is 500, and anything after the first
//! streamed byte is delivered in-band as an SSE error payload.

use std::convert::Infallible;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures_util::StreamExt;
use serde_json::json;

use crate::{
    backend::ChatBackend,
    error::BridgeError,
    model::supported_models,
    normalizer::normalize_chat,
    openai::{
        ChatCompletionRequest, chunk_content, chunk_finish, chunk_role, from_internal,
        next_completion_id, stream_error_payload, to_internal, unix_now,
    },
    stream::StreamEvent,
};

#[derive(Clone)]
pub struct AppState {
    pub backend: Arc<dyn ChatBackend>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/models", get(models))
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(state)
}

/// Bind and serve until the listener fails.
pub async fn serve(state: AppState, bind: &str, port: u16) -> crate::error::CoreResult<()> {
    let addr = format!("{bind}:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(%addr, "listening");
    axum::serve(listener, router(state))
        .await
        .map_err(BridgeError::Io)?;
    Ok(())
}

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "provider": state.backend.name(),
        "timestamp": unix_now(),
    }))
}

async fn models() -> Json<serde_json::Value> {
    let created = unix_now();
    let data: Vec<serde_json::Value> = supported_models()
        .into_iter()
        .map(|id| {
            json!({
                "id": id,
                "object": "model",
                "created": created,
                "owned_by": "anthropic",
            })
        })
        .collect();
    Json(json!({ "object": "list", "data": data }))
}

fn error_response(err: &BridgeError) -> Response {
    let status = match err {
        BridgeError::Validation { .. } => StatusCode::BAD_REQUEST,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    let body = json!({
        "error": {
            "message": err.to_string(),
            "type": if status == StatusCode::BAD_REQUEST { "invalid_request_error" } else { "api_error" },
            "code": err.wire_code(),
        }
    });
    (status, Json(body)).into_response()
}

async fn chat_completions(
    State(state): State<AppState>,
    Json(wire): Json<ChatCompletionRequest>,
) -> Response {
    let internal = match to_internal(wire) {
        Ok(req) => normalize_chat(req),
        Err(e) => return error_response(&e),
    };

    if internal.stream {
        let model = internal.model.clone();
        match state.backend.chat_stream(internal).await {
            Ok(events) => stream_response(events, model),
            Err(e) => error_response(&e),
        }
    } else {
        match state.backend.chat(internal).await {
            Ok(resp) => {
                let body = from_internal(&resp, &next_completion_id(), unix_now());
                Json(body).into_response()
            }
            Err(e) => error_response(&e),
        }
    }
}

/// Adapt the backend event stream to the downstream SSE chunk protocol:
/// one `data: <json>` frame per event, closed by `data: [DONE]`.
fn stream_response(
    mut events: crate::stream::BoxStreamEv,
    model: String,
) -> Response {
    let id = next_completion_id();
    let created = unix_now();

    let sse = async_stream::stream! {
        while let Some(event) = events.next().await {
            match event {
                StreamEvent::Role => {
                    yield Ok::<_, Infallible>(
                        Event::default().data(chunk_role(&id, created, &model).to_string()),
                    );
                }
                StreamEvent::Content(delta) => {
                    yield Ok(Event::default()
                        .data(chunk_content(&id, created, &model, &delta).to_string()));
                }
                StreamEvent::Finish {
                    reason,
                    input_tokens,
                    output_tokens,
                } => {
                    yield Ok(Event::default().data(
                        chunk_finish(&id, created, &model, &reason, input_tokens, output_tokens)
                            .to_string(),
                    ));
                }
                StreamEvent::Done => {
                    yield Ok(Event::default().data("[DONE]"));
                    break;
                }
                StreamEvent::Error(e) => {
                    tracing::warn!(error = %e, "stream failed after first byte");
                    yield Ok(Event::default().data(stream_error_payload(&e).to_string()));
                    yield Ok(Event::default().data("[DONE]"));
                    break;
                }
            }
        }
    };

    Sse::new(sse).keep_alive(KeepAlive::default()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreResult;
    use crate::model::{ChatRequest, ChatResponse};
    use crate::stream::BoxStreamEv;
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};
    use axum::http::Request;
    use tower::ServiceExt;

    struct FakeBackend {
        fail_before_stream: bool,
        fail_mid_stream: bool,
    }

    impl FakeBackend {
        fn ok() -> Self {
            Self {
                fail_before_stream: false,
                fail_mid_stream: false,
            }
        }
    }

    #[async_trait]
    impl ChatBackend for FakeBackend {
        fn name(&self) -> &str {
            "fake"
        }

        async fn chat(&self, req: ChatRequest) -> CoreResult<ChatResponse> {
            if self.fail_before_stream {
                return Err(BridgeError::UpstreamUnavailable);
            }
            Ok(ChatResponse {
                model: req.model,
                text: format!("echo: {}", req.turns.last().map(|t| t.content.as_str()).unwrap_or("")),
                input_tokens: 7,
                output_tokens: 2,
                stop_reason: Some("end_turn".into()),
                backend: "fake".into(),
            })
        }

        async fn chat_stream(&self, _req: ChatRequest) -> CoreResult<BoxStreamEv> {
            if self.fail_before_stream {
                return Err(BridgeError::CredentialsMissing);
            }
            let fail = self.fail_mid_stream;
            let stream = async_stream::stream! {
                yield StreamEvent::Role;
                yield StreamEvent::Content("Hel".into());
                if fail {
                    yield StreamEvent::Error(BridgeError::UpstreamUnavailable);
                    return;
                }
                yield StreamEvent::Content("lo".into());
                yield StreamEvent::Finish {
                    reason: "end_turn".into(),
                    input_tokens: 7,
                    output_tokens: 2,
                };
                yield StreamEvent::Done;
            };
            Ok(Box::pin(stream))
        }
    }

    fn app(backend: FakeBackend) -> Router {
        router(AppState {
            backend: Arc::new(backend),
        })
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn post_chat(body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri("/v1/chat/completions")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[tokio::test]
    async fn health_reports_backend() {
        let resp = app(FakeBackend::ok())
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["status"], "ok");
        assert_eq!(v["provider"], "fake");
        assert!(v["timestamp"].as_u64().unwrap() > 0);
    }

    #[tokio::test]
    async fn models_lists_supported_ids() {
        let resp = app(FakeBackend::ok())
            .oneshot(Request::get("/v1/models").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["object"], "list");
        let ids: Vec<&str> = v["data"]
            .as_array()
            .unwrap()
            .iter()
            .map(|m| m["id"].as_str().unwrap())
            .collect();
        assert!(ids.contains(&"claude-3-5-sonnet-20241022"));
    }

    #[tokio::test]
    async fn empty_messages_is_400_invalid_messages() {
        let resp = app(FakeBackend::ok())
            .oneshot(post_chat(r#"{"model":"sonnet","messages":[]}"#))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let v = body_json(resp).await;
        assert_eq!(v["error"]["code"], "invalid_messages");
        assert_eq!(v["error"]["type"], "invalid_request_error");
    }

    #[tokio::test]
    async fn non_streaming_completion_round_trips() {
        let resp = app(FakeBackend::ok())
            .oneshot(post_chat(
                r#"{"model":"sonnet","messages":[{"role":"user","content":"hi"}]}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let v = body_json(resp).await;
        assert_eq!(v["object"], "chat.completion");
        // alias resolved by the normalizer before the backend saw it
        assert_eq!(v["model"], "claude-3-5-sonnet-20241022");
        assert_eq!(v["choices"][0]["message"]["content"], "echo: hi");
        assert_eq!(v["usage"]["total_tokens"], 9);
    }

    #[tokio::test]
    async fn backend_failure_is_500_envelope() {
        let resp = app(FakeBackend {
            fail_before_stream: true,
            fail_mid_stream: false,
        })
        .oneshot(post_chat(
            r#"{"model":"sonnet","messages":[{"role":"user","content":"hi"}]}"#,
        ))
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let v = body_json(resp).await;
        assert_eq!(v["error"]["type"], "api_error");
        assert_eq!(v["error"]["code"], "upstream_unavailable");
    }

    #[tokio::test]
    async fn streaming_emits_chunks_then_done() {
        let resp = app(FakeBackend::ok())
            .oneshot(post_chat(
                r#"{"model":"sonnet","messages":[{"role":"user","content":"hi"}],"stream":true}"#,
            ))
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));

        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(bytes.to_vec()).unwrap();

        let payloads: Vec<&str> = body
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .collect();
        assert_eq!(payloads.last(), Some(&"[DONE]"));

        let role: serde_json::Value = serde_json::from_str(payloads[0]).unwrap();
        assert_eq!(role["choices"][0]["delta"]["role"], "assistant");

        let content: String = payloads[1..payloads.len() - 2]
            .iter()
            .map(|p| {
                let v: serde_json::Value = serde_json::from_str(p).unwrap();
                v["choices"][0]["delta"]["content"]
                    .as_str()
                    .unwrap_or("")
                    .to_string()
            })
            .collect();
        assert_eq!(content, "Hello");

        let finish: serde_json::Value =
            serde_json::from_str(payloads[payloads.len() - 2]).unwrap();
        assert_eq!(finish["choices"][0]["finish_reason"], "stop");
        assert_eq!(finish["usage"]["total_tokens"], 9);
    }

    #[tokio::test]
    async fn mid_stream_error_arrives_in_band() {
        let resp = app(FakeBackend {
            fail_before_stream: false,
            fail_mid_stream: true,
        })
        .oneshot(post_chat(
            r#"{"model":"sonnet","messages":[{"role":"user","content":"hi"}],"stream":true}"#,
        ))
        .await
        .unwrap();
        // The status was already committed before the failure.
        assert_eq!(resp.status(), StatusCode::OK);

        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body = String::from_utf8(bytes.to_vec()).unwrap();
        let payloads: Vec<&str> = body
            .lines()
            .filter_map(|l| l.strip_prefix("data: "))
            .collect();

        let err: serde_json::Value =
            serde_json::from_str(payloads[payloads.len() - 2]).unwrap();
        assert_eq!(err["error"]["code"], "upstream_unavailable");
        assert_eq!(payloads.last(), Some(&"[DONE]"));
    }

    #[tokio::test]
    async fn pre_stream_failure_is_http_error() {
        let resp = app(FakeBackend {
            fail_before_stream: true,
            fail_mid_stream: false,
        })
        .oneshot(post_chat(
            r#"{"model":"sonnet","messages":[{"role":"user","content":"hi"}],"stream":true}"#,
        ))
        .await
        .unwrap();
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let v = body_json(resp).await;
        assert_eq!(v["error"]["code"], "auth_missing");
    }
}
