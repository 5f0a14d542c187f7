//! Login session: bearer token plus the user it belongs to.
//!
//! DESIGN
//! ======
//! The session is shared between the REST client (which reads the token
//! for every request and clears it on a 401) and chat sessions (which ask
//! who the current user is to tell own messages from others'). It lives
//! behind an `RwLock` so both can hold an `Arc` to it.
//!
//! When a path is configured the session is mirrored to a small JSON file
//! so a login survives between CLI invocations.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::api::types::{AuthResponse, User};
use crate::chat::{Identity, UserIdentity};
use crate::error::ErrorCode;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("session file {path}: {message}")]
    Io { path: String, message: String },

    #[error("session file {path} is corrupt: {message}")]
    Corrupt { path: String, message: String },
}

impl ErrorCode for AuthError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Io { .. } => "E_SESSION_IO",
            Self::Corrupt { .. } => "E_SESSION_CORRUPT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct StoredSession {
    token: String,
    user: User,
}

pub struct AuthSession {
    path: Option<PathBuf>,
    state: RwLock<Option<StoredSession>>,
}

impl AuthSession {
    /// A session that is never written to disk.
    #[must_use]
    pub fn in_memory() -> Self {
        Self { path: None, state: RwLock::new(None) }
    }

    /// Load the session persisted at `path`. A missing file is an empty
    /// session, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Io`] if the file exists but can't be read and
    /// [`AuthError::Corrupt`] if it isn't a valid session.
    pub fn load(path: PathBuf) -> Result<Self, AuthError> {
        let stored = match std::fs::read_to_string(&path) {
            Ok(text) => Some(serde_json::from_str::<StoredSession>(&text).map_err(|e| AuthError::Corrupt {
                path: path.display().to_string(),
                message: e.to_string(),
            })?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(io_error(&path, &e)),
        };
        Ok(Self { path: Some(path), state: RwLock::new(stored) })
    }

    /// Remember a successful login and return its user.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Io`] if the session can't be persisted. The
    /// in-memory session is updated either way.
    pub fn store(&self, response: AuthResponse) -> Result<User, AuthError> {
        let stored = StoredSession { token: response.token, user: response.user };
        let user = stored.user.clone();
        *self.write() = Some(stored.clone());
        tracing::info!(user = %user.username, "session stored");
        self.persist(Some(&stored))?;
        Ok(user)
    }

    /// Forget the current login.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Io`] if the session file can't be removed.
    pub fn clear(&self) -> Result<(), AuthError> {
        if self.write().take().is_some() {
            tracing::info!("session cleared");
        }
        self.persist(None)
    }

    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.read().as_ref().map(|s| s.token.clone())
    }

    #[must_use]
    pub fn user(&self) -> Option<User> {
        self.read().as_ref().map(|s| s.user.clone())
    }

    fn persist(&self, stored: Option<&StoredSession>) -> Result<(), AuthError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        match stored {
            Some(stored) => {
                if let Some(dir) = path.parent() {
                    std::fs::create_dir_all(dir).map_err(|e| io_error(dir, &e))?;
                }
                let text = serde_json::to_string_pretty(stored).map_err(|e| AuthError::Io {
                    path: path.display().to_string(),
                    message: e.to_string(),
                })?;
                std::fs::write(path, text).map_err(|e| io_error(path, &e))
            }
            None => match std::fs::remove_file(path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(io_error(path, &e)),
            },
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Option<StoredSession>> {
        self.state
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Option<StoredSession>> {
        self.state
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Identity for AuthSession {
    fn current(&self) -> Option<UserIdentity> {
        self.user()
            .map(|user| UserIdentity { id: user.id, display_name: user.username })
    }
}

fn io_error(path: &Path, err: &std::io::Error) -> AuthError {
    AuthError::Io { path: path.display().to_string(), message: err.to_string() }
}

#[cfg(test)]
#[path = "auth_test.rs"]
mod tests;
