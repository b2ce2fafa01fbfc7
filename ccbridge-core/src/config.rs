use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

use crate::backends::cli::DEFAULT_AGENT_TIMEOUT_MS;

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ServerCfg {
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerCfg {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}
fn default_port() -> u16 {
    8000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct UpstreamCfg {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
}

impl Default for UpstreamCfg {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            api_version: default_api_version(),
        }
    }
}

fn default_base_url() -> String {
    "https://api.anthropic.com".to_string()
}
fn default_api_version() -> String {
    "2023-06-01".to_string()
}

/// Which backend serves chat requests.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Api,
    Cli,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct AgentCfg {
    #[serde(default = "default_agent_binary")]
    pub binary: String,
    /// PTY wrapper binary; empty disables the wrapper.
    #[serde(default = "default_pty_wrapper")]
    pub pty_wrapper: Option<String>,
    #[serde(default = "default_agent_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default)]
    pub session_id: Option<String>,
}

impl Default for AgentCfg {
    fn default() -> Self {
        Self {
            binary: default_agent_binary(),
            pty_wrapper: default_pty_wrapper(),
            timeout_ms: default_agent_timeout_ms(),
            session_id: None,
        }
    }
}

fn default_agent_binary() -> String {
    "claude".to_string()
}
fn default_pty_wrapper() -> Option<String> {
    Some("script".to_string())
}
fn default_agent_timeout_ms() -> u64 {
    DEFAULT_AGENT_TIMEOUT_MS
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct CredentialsCfg {
    /// Override for the auth-profile file path.
    #[serde(default)]
    pub profile_path: Option<String>,
    #[serde(default = "default_keychain_service")]
    pub keychain_service: String,
}

impl Default for CredentialsCfg {
    fn default() -> Self {
        Self {
            profile_path: None,
            keychain_service: default_keychain_service(),
        }
    }
}

fn default_keychain_service() -> String {
    "Claude Code-credentials".to_string()
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct HttpCfg {
    /// TCP connect timeout in milliseconds (default 5000ms)
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    /// Total request timeout in milliseconds (default 600000ms; streams run long)
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for HttpCfg {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}
fn default_request_timeout_ms() -> u64 {
    600_000
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerCfg,
    #[serde(default)]
    pub upstream: UpstreamCfg,
    #[serde(default)]
    pub backend: BackendKind,
    #[serde(default)]
    pub agent: AgentCfg,
    #[serde(default)]
    pub credentials: CredentialsCfg,
    #[serde(default)]
    pub http: HttpCfg,
}

impl Config {
    /// Load a Config from a file path (JSON or TOML by extension). If the
    /// extension is missing or unrecognized, try JSON first, then TOML.
    pub fn from_path<P: AsRef<Path>>(path: P) -> crate::error::CoreResult<Self> {
        let path = path.as_ref();
        let bytes = fs::read(path).map_err(crate::error::BridgeError::from)?;
        let s = std::str::from_utf8(&bytes)
            .map_err(|e| crate::error::BridgeError::Other(e.into()))?;
        let cfg: Self = match path.extension().and_then(|e| e.to_str()) {
            Some("json") => serde_json::from_str::<Self>(s)
                .map_err(|e| crate::error::BridgeError::Other(e.into()))?,
            Some("toml") => toml::from_str::<Self>(s)
                .map_err(|e| crate::error::BridgeError::Other(e.into()))?,
            _ => serde_json::from_str::<Self>(s)
                .map_err(|e| crate::error::BridgeError::Other(e.into()))
                .or_else(|_| {
                    toml::from_str::<Self>(s)
                        .map_err(|e| crate::error::BridgeError::Other(e.into()))
                })?,
        };
        Ok(cfg)
    }
}
