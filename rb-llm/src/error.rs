use thiserror::Error;

pub type Result<T> = std::result::Result<T, LlmError>;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("http error: {0}")]
    Http(String),

    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("unexpected response format: {0}")]
    ResponseFormat(String),

    #[error("model returned an empty completion")]
    EmptyCompletion,

    #[error("all models failed ({attempts} attempts)")]
    AllModelsFailed { attempts: usize },
}

impl From<reqwest::Error> for LlmError {
    fn from(e: reqwest::Error) -> Self {
        // Request URLs may carry credentials.
        Self::Http(e.without_url().to_string())
    }
}

impl From<serde_json::Error> for LlmError {
    fn from(e: serde_json::Error) -> Self {
        Self::ResponseFormat(e.to_string())
    }
}
