//! Client-side rules for suggestions and voting.
//!
//! The server owns priorities, tallies and the discussion threshold. What
//! lives here is what the client checks before it bothers the server: the
//! cap on open (`NEW`) suggestions per user, form validation, and keeping
//! at most one vote in flight per suggestion.

use std::collections::HashSet;
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::api::ApiClient;
use crate::api::types::{ApiError, Category, NewSuggestion, Suggestion, SuggestionStatus, VoteRequest, VoteType};
use crate::error::ErrorCode;

/// A user may have at most this many suggestions still in `NEW`.
pub const MAX_NEW_SUGGESTIONS: usize = 5;
pub const MIN_PRIORITY: u8 = 1;
pub const MAX_PRIORITY: u8 = 5;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SuggestionError {
    #[error("title is required")]
    EmptyTitle,

    #[error("description is required")]
    EmptyDescription,

    #[error("priority must be between 1 and 5, got {0}")]
    PriorityOutOfRange(u8),

    #[error("you already have {max} new suggestions; wait for one to be reviewed")]
    QuotaReached { max: usize },

    #[error("a vote on suggestion {0} is already being sent")]
    VoteInFlight(i64),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl ErrorCode for SuggestionError {
    fn error_code(&self) -> &'static str {
        match self {
            Self::EmptyTitle => "E_SUGGESTION_TITLE",
            Self::EmptyDescription => "E_SUGGESTION_DESCRIPTION",
            Self::PriorityOutOfRange(_) => "E_SUGGESTION_PRIORITY",
            Self::QuotaReached { .. } => "E_SUGGESTION_QUOTA",
            Self::VoteInFlight(_) => "E_VOTE_IN_FLIGHT",
            Self::Api(e) => e.error_code(),
        }
    }

    fn retryable(&self) -> bool {
        match self {
            Self::Api(e) => e.retryable(),
            _ => false,
        }
    }
}

// =============================================================================
// QUOTA
// =============================================================================

/// Number of suggestions still awaiting review.
#[must_use]
pub fn new_count(suggestions: &[Suggestion]) -> usize {
    suggestions
        .iter()
        .filter(|s| s.status == SuggestionStatus::New)
        .count()
}

#[must_use]
pub fn can_create_more(suggestions: &[Suggestion]) -> bool {
    new_count(suggestions) < MAX_NEW_SUGGESTIONS
}

/// # Errors
///
/// [`SuggestionError::QuotaReached`] once the user has
/// [`MAX_NEW_SUGGESTIONS`] suggestions in `NEW`.
pub fn ensure_quota(suggestions: &[Suggestion]) -> Result<(), SuggestionError> {
    if can_create_more(suggestions) {
        Ok(())
    } else {
        Err(SuggestionError::QuotaReached { max: MAX_NEW_SUGGESTIONS })
    }
}

// =============================================================================
// DRAFTS
// =============================================================================

/// Build a trimmed, validated suggestion body. Priority defaults to
/// [`MIN_PRIORITY`].
///
/// # Errors
///
/// Fails for a blank title or description, or a priority outside
/// `1..=5`.
pub fn draft(
    title: &str,
    description: &str,
    category: Category,
    priority: Option<u8>,
) -> Result<NewSuggestion, SuggestionError> {
    let title = title.trim();
    if title.is_empty() {
        return Err(SuggestionError::EmptyTitle);
    }
    let description = description.trim();
    if description.is_empty() {
        return Err(SuggestionError::EmptyDescription);
    }
    let priority = priority.unwrap_or(MIN_PRIORITY);
    if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&priority) {
        return Err(SuggestionError::PriorityOutOfRange(priority));
    }
    Ok(NewSuggestion {
        title: title.to_owned(),
        description: description.to_owned(),
        category,
        user_priority: priority,
    })
}

// =============================================================================
// LABELS
// =============================================================================

#[must_use]
pub fn status_label(status: SuggestionStatus) -> &'static str {
    match status {
        SuggestionStatus::New => "NEW",
        SuggestionStatus::Valid => "VALID",
        SuggestionStatus::Invalid => "INVALID",
        SuggestionStatus::Later => "LATER",
        SuggestionStatus::InDiscussion => "IN DISCUSSION",
    }
}

#[must_use]
pub fn category_label(category: Category) -> &'static str {
    match category {
        Category::Suggestion => "SUGGESTION",
        Category::Complaint => "COMPLAINT",
    }
}

#[must_use]
pub fn vote_label(vote: VoteType) -> &'static str {
    match vote {
        VoteType::Like => "like",
        VoteType::Dislike => "dislike",
    }
}

// =============================================================================
// VOTING
// =============================================================================

/// Where votes are sent.
#[async_trait::async_trait]
pub trait VoteSink: Send + Sync {
    /// # Errors
    ///
    /// Returns an [`ApiError`] when the vote is not recorded.
    async fn cast_vote(&self, vote: &VoteRequest) -> Result<(), ApiError>;
}

#[async_trait::async_trait]
impl VoteSink for ApiClient {
    async fn cast_vote(&self, vote: &VoteRequest) -> Result<(), ApiError> {
        ApiClient::cast_vote(self, vote).await
    }
}

/// Allows one outstanding vote per suggestion.
///
/// The user's own choice is not tracked locally; after a successful vote
/// the caller refetches the list to get fresh tallies.
#[derive(Debug, Default)]
pub struct VoteGate {
    in_flight: Mutex<HashSet<i64>>,
}

impl VoteGate {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn is_voting(&self, suggestion_id: i64) -> bool {
        self.lock().contains(&suggestion_id)
    }

    /// Cast `vote` on `suggestion_id` unless a vote on it is outstanding.
    ///
    /// # Errors
    ///
    /// [`SuggestionError::VoteInFlight`] without contacting `sink`, or the
    /// sink's failure as [`SuggestionError::Api`].
    pub async fn cast(&self, sink: &dyn VoteSink, suggestion_id: i64, vote: VoteType) -> Result<(), SuggestionError> {
        if !self.lock().insert(suggestion_id) {
            return Err(SuggestionError::VoteInFlight(suggestion_id));
        }
        let _slot = VoteSlot { gate: self, suggestion_id };

        let request = VoteRequest { suggestion_id, vote_type: vote };
        match sink.cast_vote(&request).await {
            Ok(()) => {
                tracing::info!(suggestion_id, vote = vote_label(vote), "vote cast");
                Ok(())
            }
            Err(error) => {
                tracing::warn!(suggestion_id, %error, "vote failed");
                Err(error.into())
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashSet<i64>> {
        self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

struct VoteSlot<'a> {
    gate: &'a VoteGate,
    suggestion_id: i64,
}

impl Drop for VoteSlot<'_> {
    fn drop(&mut self) {
        self.gate.lock().remove(&self.suggestion_id);
    }
}

#[cfg(test)]
#[path = "suggestions_test.rs"]
mod tests;
