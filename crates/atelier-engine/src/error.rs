use atelier_contracts::ValidationError;

/// Failure reported by a provider adapter.
///
/// `retryable` marks network/5xx failures; adapters that retry have already
/// done so by the time this reaches the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ProviderError {
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub status: Option<u16>,
}

impl ProviderError {
    pub fn terminal(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: false,
            status: None,
        }
    }

    pub fn retryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: true,
            status: None,
        }
    }

    pub fn from_status(status: u16, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            retryable: status >= 500 || status == 429,
            status: Some(status),
        }
    }

    pub fn malformed(message: impl Into<String>) -> Self {
        Self::terminal("malformed_response", message)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum VariantError {
    #[error("failed to decode source image: {0}")]
    Decode(String),

    #[error("output format '{0}' cannot be encoded here")]
    UnsupportedFormat(String),

    #[error("failed to encode {variant} variant: {message}")]
    Encode {
        variant: &'static str,
        message: String,
    },
}

/// Errors that end an orchestration call with no image.
#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("Prompt not found: {0}")]
    PromptNotFound(String),

    #[error("Prompt lookup failed: {0}")]
    PromptLookup(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error(transparent)]
    Provider(#[from] ProviderError),
}
