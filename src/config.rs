//! Client configuration parsed from environment variables.
//!
//! The CLI loads `.env` first (via `dotenvy`) so the same variables can
//! live in a file next to the binary, then lets flags override them.

use std::path::PathBuf;

use directories::ProjectDirs;

use crate::error::ErrorCode;

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:8080";
pub const DEFAULT_REALTIME_URL: &str = "https://locality-connect-default-rtdb.firebaseio.com";
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 10;
pub const SESSION_FILE_NAME: &str = "session.json";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{var} must be an http(s) URL, got '{value}'")]
    InvalidUrl { var: &'static str, value: String },
}

impl ErrorCode for ConfigError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidUrl { .. } => "E_CONFIG_URL",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub request_secs: u64,
    pub connect_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Server origin without the `/api` suffix or a trailing slash.
    pub api_base_url: String,
    pub realtime_url: String,
    pub realtime_auth: Option<String>,
    pub state_dir: Option<PathBuf>,
    pub timeouts: Timeouts,
}

impl ClientConfig {
    /// Build typed config from environment variables.
    ///
    /// Optional:
    /// - `LOCALITY_API_BASE_URL`: server origin, default `http://localhost:8080`
    /// - `LOCALITY_REALTIME_URL`: realtime database URL
    /// - `LOCALITY_REALTIME_AUTH`: realtime database auth token
    /// - `LOCALITY_STATE_DIR`: where the login session is kept, default the platform
    ///   data directory (`~/.local/share/locality-connect` on Linux)
    /// - `LOCALITY_REQUEST_TIMEOUT_SECS`: default 30
    /// - `LOCALITY_CONNECT_TIMEOUT_SECS`: default 10
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidUrl`] when a URL variable isn't http(s).
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let api_base_url = parse_url(
            "LOCALITY_API_BASE_URL",
            lookup("LOCALITY_API_BASE_URL").unwrap_or_else(|| DEFAULT_API_BASE_URL.to_owned()),
        )?;
        let realtime_url = parse_url(
            "LOCALITY_REALTIME_URL",
            lookup("LOCALITY_REALTIME_URL").unwrap_or_else(|| DEFAULT_REALTIME_URL.to_owned()),
        )?;
        let realtime_auth = lookup("LOCALITY_REALTIME_AUTH").filter(|v| !v.trim().is_empty());
        let state_dir = lookup("LOCALITY_STATE_DIR")
            .map(PathBuf::from)
            .or_else(default_state_dir);
        let timeouts = Timeouts {
            request_secs: parse_secs(&lookup, "LOCALITY_REQUEST_TIMEOUT_SECS", DEFAULT_REQUEST_TIMEOUT_SECS),
            connect_secs: parse_secs(&lookup, "LOCALITY_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS),
        };

        Ok(Self { api_base_url, realtime_url, realtime_auth, state_dir, timeouts })
    }

    /// Root of the REST API: the origin with `/api` appended.
    #[must_use]
    pub fn api_url(&self) -> String {
        format!("{}/api", self.api_base_url)
    }

    /// Where the login session is persisted, if anywhere.
    #[must_use]
    pub fn session_file(&self) -> Option<PathBuf> {
        self.state_dir.as_ref().map(|dir| dir.join(SESSION_FILE_NAME))
    }
}

/// Validate and normalize a base URL: http(s) only, no trailing slash.
///
/// # Errors
///
/// Returns [`ConfigError::InvalidUrl`] for any other scheme.
pub fn parse_url(var: &'static str, raw: String) -> Result<String, ConfigError> {
    let trimmed = raw.trim().trim_end_matches('/');
    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(ConfigError::InvalidUrl { var, value: raw });
    }
    Ok(trimmed.to_owned())
}

/// Platform data directory for the login session. `None` when the OS
/// reports no home directory; the session then lives in memory only.
#[must_use]
pub fn default_state_dir() -> Option<PathBuf> {
    let Some(dirs) = ProjectDirs::from("", "", "locality-connect") else {
        tracing::warn!("no home directory found; login session will not be persisted");
        return None;
    };
    Some(dirs.data_dir().to_path_buf())
}

fn parse_secs(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    let Some(raw) = lookup(key) else {
        return default;
    };
    match raw.trim().parse::<u64>() {
        Ok(secs) if secs > 0 => secs,
        _ => {
            tracing::warn!(%key, value = %raw, default, "ignoring invalid timeout");
            default
        }
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
