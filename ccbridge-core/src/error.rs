use thiserror::Error;

/// Core error type for ccbridge.
/// Internally, modules can use `anyhow::Result<T>` for convenience,
/// but public boundaries should expose `CoreResult<T>` with this error.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("{message}")]
    Validation { code: String, message: String },

    #[error("no credentials available from any configured source")]
    CredentialsMissing,

    #[error("credentials are expired (or expire within the safety margin)")]
    CredentialsExpired,

    #[error("upstream error: {code} {message}")]
    Upstream { code: String, message: String },

    #[error("upstream unavailable")]
    UpstreamUnavailable,

    #[error("agent command not found: {command}")]
    ProcessNotFound { command: String },

    #[error("agent process exceeded {ms}ms timeout")]
    ProcessTimeout { ms: u64 },

    #[error("agent process exited with status {code}")]
    ProcessExit { code: i32 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl BridgeError {
    /// Convenience constructor for validation failures with a wire-level code.
    pub fn validation(code: &str, message: impl Into<String>) -> Self {
        Self::Validation {
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Stable machine-readable code used in the client-facing error envelope.
    pub fn wire_code(&self) -> &str {
        match self {
            Self::Validation { code, .. } => code.as_str(),
            Self::CredentialsMissing => "auth_missing",
            Self::CredentialsExpired => "auth_expired",
            Self::Upstream { .. } => "upstream_error",
            Self::UpstreamUnavailable => "upstream_unavailable",
            Self::ProcessNotFound { .. } => "process_not_found",
            Self::ProcessTimeout { .. } => "process_timeout",
            Self::ProcessExit { .. } => "process_exit",
            Self::Io(_) => "io_error",
            Self::Other(_) => "internal_error",
        }
    }
}

pub type CoreResult<T> = std::result::Result<T, BridgeError>;
