use async_trait::async_trait;

use crate::error::CoreResult;
use crate::model::{ChatRequest, ChatResponse};
use crate::stream::BoxStreamEv;

/// A chat backend: either the vendor HTTP API or the local agent binary.
///
/// `chat` runs a request to completion; `chat_stream` returns the
/// incremental event stream described in [`crate::stream`]. Errors that
/// occur before any event is produced surface as `Err`; errors after the
/// first event arrive in-band as `StreamEvent::Error`.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn chat(&self, req: ChatRequest) -> CoreResult<ChatResponse>;

    async fn chat_stream(&self, req: ChatRequest) -> CoreResult<BoxStreamEv>;
}
