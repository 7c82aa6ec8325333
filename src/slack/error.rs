use thiserror::Error;

#[derive(Debug, Error)]
pub enum SlackError {
    #[error("HTTP error calling Slack: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Slack {method} returned error: {code}")]
    Api { method: &'static str, code: String },

    #[error("Slack response missing field: {0}")]
    MissingField(&'static str),
}

pub type SlackResult<T> = Result<T, SlackError>;
