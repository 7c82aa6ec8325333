use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the directory/SSO facades.
#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("no SSO instance with ARN {0} found in this account")]
    InstanceNotFound(String),

    #[error("SSO user not found for email {email} (fallback domains tried: {fallbacks_tried})")]
    UserNotFound { email: String, fallbacks_tried: usize },

    #[error("group {0} not found in the identity store")]
    GroupNotFound(String),

    #[error("account assignment operation {request_id} failed: {reason}")]
    OperationFailed { request_id: String, reason: String },

    #[error("operation did not reach a terminal state within {0:?}")]
    PollBudgetExhausted(Duration),

    #[error("{context}: {message}")]
    Api {
        context: &'static str,
        message: String,
        /// Throttling and transport failures; callers already get these
        /// retried inside the facade, so a surfaced retryable error means
        /// the retry budget is spent.
        retryable: bool,
    },
}

impl DirectoryError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DirectoryError::Api { retryable: true, .. })
    }
}

pub type DirectoryResult<T> = Result<T, DirectoryError>;
