//! REST client for the community-feedback server.
//!
//! DESIGN
//! ======
//! One `reqwest::Client` per process, built with the configured request
//! and connect timeouts. Every call goes through [`ApiClient::execute`],
//! which attaches the bearer token from the shared [`AuthSession`] and
//! maps the response status onto [`ApiError`].
//!
//! A 401 on a request that carried a token means the session is dead:
//! the stored login is cleared and the caller gets
//! [`ApiError::Unauthorized`]. A 401 without a token (a failed login) is
//! reported like any other rejection, with the server's message.

pub mod types;

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Method, RequestBuilder, StatusCode};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::auth::AuthSession;
use crate::chat::{ChatBackend, ChatHandle};
use crate::config::ClientConfig;
use types::{
    ApiError, AuthResponse, ChatInfo, Locality, LocalityRequest, LoginRequest, NewSuggestion, RegisterRequest,
    SendMessageRequest, Suggestion, User, VoteRequest, error_message,
};

// =============================================================================
// CLIENT
// =============================================================================

pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    auth: Arc<AuthSession>,
}

impl ApiClient {
    /// # Errors
    ///
    /// Returns [`ApiError::HttpClientBuild`] if the TLS backend can't be
    /// initialized.
    pub fn new(config: &ClientConfig, auth: Arc<AuthSession>) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeouts.request_secs))
            .connect_timeout(Duration::from_secs(config.timeouts.connect_secs))
            .build()
            .map_err(|e| ApiError::HttpClientBuild(e.to_string()))?;
        Ok(Self { http, base_url: config.api_url(), auth })
    }

    /// `…/api`, no trailing slash.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[must_use]
    pub fn auth(&self) -> &Arc<AuthSession> {
        &self.auth
    }

    // -------------------------------------------------------------------------
    // auth
    // -------------------------------------------------------------------------

    /// Create an account. Does not log in.
    ///
    /// # Errors
    ///
    /// Any [`ApiError`] from the request.
    pub async fn register(&self, request: &RegisterRequest) -> Result<(), ApiError> {
        self.execute(self.request(Method::POST, "/auth/register").json(request))
            .await
            .map(drop)
    }

    /// Log in and remember the session.
    ///
    /// # Errors
    ///
    /// Any [`ApiError`] from the request, or [`ApiError::Session`] if the
    /// session file can't be written.
    pub async fn login(&self, request: &LoginRequest) -> Result<User, ApiError> {
        let response: AuthResponse = self.send_json(Method::POST, "/auth/login", Some(request)).await?;
        self.auth.store(response).map_err(|e| ApiError::Session(e.to_string()))
    }

    // -------------------------------------------------------------------------
    // localities
    // -------------------------------------------------------------------------

    /// # Errors
    ///
    /// Any [`ApiError`] from the request.
    pub async fn localities(&self) -> Result<Vec<Locality>, ApiError> {
        self.send_json(Method::GET, "/localities/all", None::<&()>).await
    }

    /// # Errors
    ///
    /// Any [`ApiError`] from the request.
    pub async fn locality(&self, id: i64) -> Result<Locality, ApiError> {
        self.send_json(Method::GET, &format!("/localities/{id}"), None::<&()>).await
    }

    /// # Errors
    ///
    /// Any [`ApiError`] from the request.
    pub async fn create_locality(&self, request: &LocalityRequest) -> Result<Locality, ApiError> {
        self.send_json(Method::POST, "/localities", Some(request)).await
    }

    /// # Errors
    ///
    /// Any [`ApiError`] from the request.
    pub async fn update_locality(&self, id: i64, request: &LocalityRequest) -> Result<Locality, ApiError> {
        self.send_json(Method::PUT, &format!("/localities/{id}"), Some(request)).await
    }

    // -------------------------------------------------------------------------
    // suggestions
    // -------------------------------------------------------------------------

    /// # Errors
    ///
    /// Any [`ApiError`] from the request.
    pub async fn create_suggestion(&self, suggestion: &NewSuggestion) -> Result<Suggestion, ApiError> {
        self.send_json(Method::POST, "/suggestions", Some(suggestion)).await
    }

    /// # Errors
    ///
    /// Any [`ApiError`] from the request.
    pub async fn update_suggestion(&self, id: i64, suggestion: &NewSuggestion) -> Result<Suggestion, ApiError> {
        self.send_json(Method::PUT, &format!("/suggestions/{id}"), Some(suggestion))
            .await
    }

    /// # Errors
    ///
    /// Any [`ApiError`] from the request.
    pub async fn delete_suggestion(&self, id: i64) -> Result<(), ApiError> {
        self.execute(self.request(Method::DELETE, &format!("/suggestions/{id}")))
            .await
            .map(drop)
    }

    /// Suggestions written by the current user.
    ///
    /// # Errors
    ///
    /// Any [`ApiError`] from the request.
    pub async fn my_suggestions(&self) -> Result<Vec<Suggestion>, ApiError> {
        self.send_json(Method::GET, "/suggestions/my", None::<&()>).await
    }

    /// Suggestions in the current user's locality.
    ///
    /// # Errors
    ///
    /// Any [`ApiError`] from the request.
    pub async fn dashboard(&self) -> Result<Vec<Suggestion>, ApiError> {
        self.send_json(Method::GET, "/suggestions/dashboard", None::<&()>).await
    }

    /// Suggestions that reached the discussion threshold.
    ///
    /// # Errors
    ///
    /// Any [`ApiError`] from the request.
    pub async fn discussion(&self) -> Result<Vec<Suggestion>, ApiError> {
        self.send_json(Method::GET, "/suggestions/discussion", None::<&()>).await
    }

    // -------------------------------------------------------------------------
    // votes
    // -------------------------------------------------------------------------

    /// # Errors
    ///
    /// Any [`ApiError`] from the request.
    pub async fn cast_vote(&self, vote: &VoteRequest) -> Result<(), ApiError> {
        self.execute(self.request(Method::POST, "/votes").json(vote))
            .await
            .map(drop)
    }

    // -------------------------------------------------------------------------
    // plumbing
    // -------------------------------------------------------------------------

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.http.request(method, format!("{}{path}", self.base_url))
    }

    async fn send_json<B, T>(&self, method: Method, path: &str, body: Option<&B>) -> Result<T, ApiError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let mut builder = self.request(method, path);
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let text = self.execute(builder).await?;
        serde_json::from_str(&text).map_err(|e| ApiError::Parse(e.to_string()))
    }

    /// Send `builder` with the bearer token and return the response body.
    async fn execute(&self, builder: RequestBuilder) -> Result<String, ApiError> {
        let token = self.auth.token();
        let builder = match &token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        };

        let response = builder.send().await.map_err(|e| ApiError::Request(e.to_string()))?;
        let status = response.status();
        let url = response.url().path().to_owned();
        let text = response
            .text()
            .await
            .map_err(|e| ApiError::Request(e.to_string()))?;

        if status == StatusCode::UNAUTHORIZED && token.is_some() {
            tracing::warn!(%url, "session rejected by server, clearing");
            if let Err(error) = self.auth.clear() {
                tracing::warn!(%error, "failed to clear session");
            }
            return Err(ApiError::Unauthorized);
        }
        if !status.is_success() {
            tracing::debug!(%url, status = status.as_u16(), "request rejected");
            return Err(ApiError::Status { status: status.as_u16(), message: error_message(&text) });
        }
        tracing::trace!(%url, status = status.as_u16(), "request ok");
        Ok(text)
    }
}

// =============================================================================
// CHAT BACKEND
// =============================================================================

#[async_trait::async_trait]
impl ChatBackend for ApiClient {
    async fn get_or_create_chat(&self, topic_id: &str) -> Result<ChatHandle, ApiError> {
        let info: ChatInfo = self
            .send_json(Method::GET, &format!("/chats/suggestion/{topic_id}"), None::<&()>)
            .await?;
        let handle = info.firebase_chat_id.trim();
        if handle.is_empty() {
            return Err(ApiError::Parse("chat reply has an empty firebaseChatId".into()));
        }
        Ok(ChatHandle::new(handle))
    }

    async fn append_message(&self, topic_id: &str, text: &str) -> Result<(), ApiError> {
        let body = SendMessageRequest { message: text };
        self.execute(
            self.request(Method::POST, &format!("/chats/suggestion/{topic_id}/message"))
                .json(&body),
        )
        .await
        .map(drop)
    }
}

#[cfg(test)]
#[path = "mod_test.rs"]
mod tests;
