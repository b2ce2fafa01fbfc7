//! Credential resolution for the upstream vendor API.
//!
//! Sources are tried in order; a source that errors (missing file, parse
//! failure, secret-store call failure) yields nothing rather than failing the
//! whole resolution. The first source producing a token wins, even if that
//! token turns out to be expired — expiry is the caller's error, not a reason
//! to fall through.

use std::path::PathBuf;
use std::process::Command;
use std::sync::RwLock;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::error::{BridgeError, CoreResult};

/// Tokens are treated as expired this long before their actual expiry, so a
/// request never leaves with a token that dies mid-flight.
pub const EXPIRY_SAFETY_MARGIN: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct Credentials {
    pub access_token: SecretString,
    pub expires_at: Option<SystemTime>,
}

impl Credentials {
    pub fn new(token: impl Into<String>, expires_at: Option<SystemTime>) -> Self {
        Self {
            access_token: SecretString::new(token.into().into()),
            expires_at,
        }
    }

    /// A token with no expiry is perpetually valid; one with an expiry is
    /// valid only while `now + margin` stays below it.
    pub fn is_valid_at(&self, now: SystemTime) -> bool {
        match self.expires_at {
            None => true,
            Some(exp) => now + EXPIRY_SAFETY_MARGIN < exp,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.is_valid_at(SystemTime::now())
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("access_token", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

pub trait CredentialSource: Send + Sync {
    fn name(&self) -> &str;
    /// `None` means "no credentials from this source" — including errors.
    fn resolve(&self) -> Option<Credentials>;
}

// ===== managed auth-profile store (JSON file) =====

#[derive(Deserialize)]
struct AuthProfileFile {
    #[serde(rename = "claudeAiOauth")]
    oauth: Option<AuthProfileEntry>,
}

#[derive(Deserialize)]
struct AuthProfileEntry {
    #[serde(rename = "accessToken")]
    access_token: String,
    /// Unix milliseconds.
    #[serde(rename = "expiresAt")]
    expires_at: Option<u64>,
}

/// Reads the managed auth-profile file (`~/.claude/.credentials.json`).
pub struct AuthProfileSource {
    path: PathBuf,
}

impl AuthProfileSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".claude").join(".credentials.json"))
    }
}

fn credentials_from_entry(entry: AuthProfileEntry) -> Credentials {
    let expires_at = entry
        .expires_at
        .map(|ms| UNIX_EPOCH + Duration::from_millis(ms));
    Credentials::new(entry.access_token, expires_at)
}

impl CredentialSource for AuthProfileSource {
    fn name(&self) -> &str {
        "auth-profile"
    }

    fn resolve(&self) -> Option<Credentials> {
        let raw = std::fs::read_to_string(&self.path).ok()?;
        let file: AuthProfileFile = serde_json::from_str(&raw).ok()?;
        file.oauth.map(credentials_from_entry)
    }
}

// ===== platform secret store =====

/// Reads the platform keychain through the `security` CLI. The stored secret
/// carries the same JSON payload as the auth-profile file.
pub struct SecretStoreSource {
    service: String,
}

impl SecretStoreSource {
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
        }
    }
}

impl CredentialSource for SecretStoreSource {
    fn name(&self) -> &str {
        "secret-store"
    }

    fn resolve(&self) -> Option<Credentials> {
        let out = Command::new("security")
            .args(["find-generic-password", "-s", &self.service, "-w"])
            .output()
            .ok()?;
        if !out.status.success() {
            return None;
        }
        let raw = String::from_utf8(out.stdout).ok()?;
        let raw = raw.trim();
        let file: AuthProfileFile = serde_json::from_str(raw).ok()?;
        file.oauth.map(credentials_from_entry)
    }
}

// ===== provider with process-wide cache =====

/// Resolves credentials from an ordered source list, caching the last result.
///
/// The cache is read-mostly; refreshing it redundantly from two concurrent
/// requests is harmless (last writer wins), since staleness is self-detected
/// by the validity predicate.
pub struct CredentialProvider {
    sources: Vec<Box<dyn CredentialSource>>,
    cached: RwLock<Option<Credentials>>,
}

impl CredentialProvider {
    pub fn new(sources: Vec<Box<dyn CredentialSource>>) -> Self {
        Self {
            sources,
            cached: RwLock::new(None),
        }
    }

    /// Default source order: auth-profile file, then platform secret store.
    pub fn with_default_sources(
        profile_path: Option<PathBuf>,
        keychain_service: &str,
    ) -> Self {
        let mut sources: Vec<Box<dyn CredentialSource>> = Vec::new();
        if let Some(path) = profile_path.or_else(AuthProfileSource::default_path) {
            sources.push(Box::new(AuthProfileSource::new(path)));
        }
        sources.push(Box::new(SecretStoreSource::new(keychain_service)));
        Self::new(sources)
    }

    /// Resolve valid credentials, re-reading sources only when the cached
    /// token is absent or stale.
    pub fn resolve(&self) -> CoreResult<Credentials> {
        if let Ok(guard) = self.cached.read()
            && let Some(creds) = guard.as_ref()
            && creds.is_valid()
        {
            return Ok(creds.clone());
        }

        for source in &self.sources {
            if let Some(creds) = source.resolve() {
                tracing::debug!(source = source.name(), "credentials resolved");
                if !creds.is_valid() {
                    return Err(BridgeError::CredentialsExpired);
                }
                if let Ok(mut guard) = self.cached.write() {
                    *guard = Some(creds.clone());
                }
                return Ok(creds);
            }
        }
        Err(BridgeError::CredentialsMissing)
    }

    /// Expose the raw token for header construction.
    pub fn bearer(&self) -> CoreResult<String> {
        Ok(self.resolve()?.access_token.expose_secret().to_string())
    }
}
