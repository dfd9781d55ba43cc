//! Error types for the newscast pipeline.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum NewscastError {
    #[error("Malformed script: {0}")]
    MalformedScript(String),

    #[error("Unknown speaker '{0}': no voice is configured for it")]
    UnknownSpeaker(String),

    #[error("Text too long for synthesis: {len} characters (limit {limit})")]
    TextTooLong { len: usize, limit: usize },

    #[error("Speech provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("Speech provider rejected the request (HTTP {status}): {message}")]
    ProviderRejected { status: u16, message: String },

    #[error("Failed to decode audio fragment #{index}: {message}")]
    FragmentDecode { index: usize, message: String },

    #[error("Audio encoding failed: {0}")]
    Encode(String),

    #[error("Publish failed: {0}")]
    PublishFailed(String),

    #[error("OpenAI API error: {0}")]
    OpenAIError(#[from] async_openai::error::OpenAIError),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Background task failed: {0}")]
    TaskFailed(String),

    #[error("Run cancelled")]
    Cancelled,
}

/// What a caller should do about a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Transient upstream trouble, the same request may succeed later.
    RetryLater,
    /// Voice mapping, credentials or storage settings need fixing.
    FixConfiguration,
    /// The dialogue script itself is unusable.
    FixInput,
    /// Local fault (encoder, disk, runtime).
    Internal,
}

impl FailureClass {
    pub fn display_name(&self) -> &str {
        match self {
            FailureClass::RetryLater => "try again later",
            FailureClass::FixConfiguration => "fix configuration",
            FailureClass::FixInput => "fix input",
            FailureClass::Internal => "internal error",
        }
    }
}

impl NewscastError {
    pub fn class(&self) -> FailureClass {
        match self {
            NewscastError::ProviderUnavailable(_) | NewscastError::PublishFailed(_) => {
                FailureClass::RetryLater
            }
            NewscastError::OpenAIError(_) => FailureClass::RetryLater,
            NewscastError::UnknownSpeaker(_)
            | NewscastError::ProviderRejected { .. }
            | NewscastError::ConfigError(_) => FailureClass::FixConfiguration,
            NewscastError::MalformedScript(_)
            | NewscastError::TextTooLong { .. } => FailureClass::FixInput,
            NewscastError::FragmentDecode { .. }
            | NewscastError::Encode(_)
            | NewscastError::Io(_)
            | NewscastError::TaskFailed(_)
            | NewscastError::Cancelled => FailureClass::Internal,
        }
    }

    /// Only transient provider failures are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, NewscastError::ProviderUnavailable(_))
    }
}
