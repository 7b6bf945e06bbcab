/// Rejections raised before any network call is made.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Invalid prompt: {0}")]
    InvalidPrompt(String),

    #[error("Invalid model: {0}")]
    InvalidModel(String),
}
