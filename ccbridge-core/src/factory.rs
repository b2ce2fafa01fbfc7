use std::path::PathBuf;
use std::sync::Arc;

use crate::backend::ChatBackend;
use crate::backends::anthropic::AnthropicClient;
use crate::backends::cli::{AgentConfig, CliBackend};
use crate::config::{BackendKind, Config};
use crate::credentials::CredentialProvider;
use crate::error::CoreResult;
use crate::http_client::HttpClient;

/// Build the configured chat backend.
pub fn build_backend(cfg: &Config) -> CoreResult<Arc<dyn ChatBackend>> {
    match cfg.backend {
        BackendKind::Api => {
            let http = HttpClient::with_timeouts(
                cfg.http.connect_timeout_ms,
                cfg.http.request_timeout_ms,
            )?;
            let credentials = Arc::new(CredentialProvider::with_default_sources(
                cfg.credentials.profile_path.as_ref().map(PathBuf::from),
                &cfg.credentials.keychain_service,
            ));
            Ok(Arc::new(
                AnthropicClient::new(http, credentials, cfg.upstream.base_url.clone())
                    .with_api_version(cfg.upstream.api_version.as_str()),
            ))
        }
        BackendKind::Cli => {
            let agent = AgentConfig {
                binary: cfg.agent.binary.clone(),
                pty_wrapper: cfg
                    .agent
                    .pty_wrapper
                    .clone()
                    .filter(|w| !w.is_empty()),
                timeout_ms: cfg.agent.timeout_ms,
                session_id: cfg.agent.session_id.clone(),
            };
            Ok(Arc::new(CliBackend::new(agent)))
        }
    }
}
