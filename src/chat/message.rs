//! Chat messages: decoding log snapshots and validating outgoing text.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use time::macros::format_description;

use crate::api::types::string_or_number;
use crate::error::ErrorCode;

/// Longest message accepted for sending, in characters.
pub const MAX_MESSAGE_LEN: usize = 2000;

const DAY_MS: i64 = 24 * 60 * 60 * 1000;

// =============================================================================
// MESSAGE
// =============================================================================

/// One entry of a chat's message log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    /// Key the log assigned to the entry.
    pub id: String,
    pub author_id: String,
    pub author_name: String,
    pub text: String,
    /// Milliseconds since the Unix epoch.
    pub timestamp: i64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireMessage {
    #[serde(alias = "authorId", deserialize_with = "string_or_number")]
    user_id: String,
    #[serde(alias = "authorName")]
    username: String,
    text: String,
    #[serde(deserialize_with = "epoch_millis")]
    timestamp: i64,
}

#[allow(clippy::cast_possible_truncation)]
fn epoch_millis<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    value
        .as_i64()
        .or_else(|| value.as_f64().map(|f| f as i64))
        .ok_or_else(|| serde::de::Error::custom(format!("expected epoch millis, got {value}")))
}

/// Decode a full log snapshot into the visible message list.
///
/// The result is sorted by timestamp, ties broken by key. Entries that
/// don't decode are skipped so one bad write can't blank the chat.
#[must_use]
pub fn decode_snapshot(raw: Option<&Value>) -> Vec<Message> {
    let entries: Vec<(String, &Value)> = match raw {
        None | Some(Value::Null) => return Vec::new(),
        Some(Value::Object(map)) => map.iter().map(|(key, value)| (key.clone(), value)).collect(),
        Some(Value::Array(items)) => items
            .iter()
            .enumerate()
            .filter(|(_, value)| !value.is_null())
            .map(|(index, value)| (index.to_string(), value))
            .collect(),
        Some(other) => {
            tracing::warn!(snapshot = %other, "chat snapshot is not a collection");
            return Vec::new();
        }
    };

    let mut messages: Vec<Message> = entries
        .into_iter()
        .filter_map(|(key, value)| decode_entry(key, value))
        .collect();
    sort_messages(&mut messages);
    messages
}

fn decode_entry(key: String, value: &Value) -> Option<Message> {
    let wire = match WireMessage::deserialize(value) {
        Ok(wire) => wire,
        Err(error) => {
            tracing::warn!(%key, %error, "skipping undecodable chat entry");
            return None;
        }
    };
    if wire.text.trim().is_empty() {
        tracing::warn!(%key, "skipping empty chat entry");
        return None;
    }
    Some(Message {
        id: key,
        author_id: wire.user_id,
        author_name: wire.username,
        text: wire.text,
        timestamp: wire.timestamp,
    })
}

/// Order by timestamp ascending, then by key.
pub fn sort_messages(messages: &mut [Message]) {
    messages.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
}

// =============================================================================
// OUTGOING
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("message is empty")]
    Empty,

    #[error("message is {len} characters, max is {max}")]
    TooLong { len: usize, max: usize },
}

impl ErrorCode for ValidationError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::Empty => "E_MESSAGE_EMPTY",
            Self::TooLong { .. } => "E_MESSAGE_TOO_LONG",
        }
    }
}

/// Trim `text` and check it can be sent.
///
/// # Errors
///
/// [`ValidationError::Empty`] for blank text, [`ValidationError::TooLong`]
/// past [`MAX_MESSAGE_LEN`] characters.
pub fn validate_outgoing(text: &str) -> Result<&str, ValidationError> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Err(ValidationError::Empty);
    }
    let len = trimmed.chars().count();
    if len > MAX_MESSAGE_LEN {
        return Err(ValidationError::TooLong { len, max: MAX_MESSAGE_LEN });
    }
    Ok(trimmed)
}

// =============================================================================
// TIME
// =============================================================================

/// Current time as milliseconds since the Unix epoch.
#[must_use]
pub fn now_ms() -> i64 {
    let Ok(duration) = SystemTime::now().duration_since(UNIX_EPOCH) else {
        return 0;
    };
    i64::try_from(duration.as_millis()).unwrap_or(0)
}

/// Render a message time: `HH:MM` within the last day, otherwise
/// `YYYY-MM-DD HH:MM`. UTC.
#[must_use]
pub fn format_timestamp(timestamp: i64, now: i64) -> String {
    let Ok(at) = OffsetDateTime::from_unix_timestamp_nanos(i128::from(timestamp) * 1_000_000) else {
        return timestamp.to_string();
    };
    let formatted = if now.saturating_sub(timestamp) < DAY_MS {
        at.format(format_description!("[hour]:[minute]"))
    } else {
        at.format(format_description!("[year]-[month]-[day] [hour]:[minute]"))
    };
    formatted.unwrap_or_else(|_| timestamp.to_string())
}

#[cfg(test)]
#[path = "message_test.rs"]
mod tests;
