//! Chat backend that writes straight into a [`MemoryLog`].
//!
//! Stands in for the REST server when there is none: handles are derived
//! from the topic id and accepted messages are appended to the log the
//! way the server would append them to the realtime database.

use std::sync::Arc;

use serde_json::json;

use super::message::now_ms;
use super::{ChatBackend, ChatHandle, Identity};
use crate::api::types::ApiError;
use crate::realtime::MemoryLog;

const GUEST_ID: &str = "guest";
const GUEST_NAME: &str = "Guest";

pub struct OfflineBackend {
    log: Arc<MemoryLog>,
    identity: Arc<dyn Identity>,
}

impl OfflineBackend {
    pub fn new(log: Arc<MemoryLog>, identity: Arc<dyn Identity>) -> Self {
        Self { log, identity }
    }

    /// Handle assigned to `topic_id`.
    #[must_use]
    pub fn handle_for(topic_id: &str) -> ChatHandle {
        ChatHandle::new(format!("offline-{topic_id}"))
    }
}

#[async_trait::async_trait]
impl ChatBackend for OfflineBackend {
    async fn get_or_create_chat(&self, topic_id: &str) -> Result<ChatHandle, ApiError> {
        Ok(Self::handle_for(topic_id))
    }

    async fn append_message(&self, topic_id: &str, text: &str) -> Result<(), ApiError> {
        let (user_id, username) = match self.identity.current() {
            Some(user) => (user.id, user.display_name),
            None => (GUEST_ID.to_owned(), GUEST_NAME.to_owned()),
        };
        let address = Self::handle_for(topic_id).log_address();
        let key = self.log.push(
            &address,
            json!({"userId": user_id, "username": username, "text": text, "timestamp": now_ms()}),
        );
        tracing::debug!(%address, %key, "offline message appended");
        Ok(())
    }
}
