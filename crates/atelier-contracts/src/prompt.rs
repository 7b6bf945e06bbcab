use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ValidationError;

pub const MAX_PROMPT_CHARS: usize = 3000;
pub const MIN_PROMPT_CHARS: usize = 2;

/// Curated prompt row. Written by the ingestion process, read-only here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PromptRecord {
    pub id: String,
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
    #[serde(default)]
    pub year: Option<i32>,
    #[serde(default)]
    pub theme: Option<String>,
    #[serde(default)]
    pub people_count: Option<u32>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub is_celebrity: bool,
    #[serde(default)]
    pub full_hints: bool,
}

/// Normalizes prompt text before it is handed to any provider.
///
/// Trims, truncates to [`MAX_PROMPT_CHARS`] characters and rejects anything
/// shorter than [`MIN_PROMPT_CHARS`] after trimming.
pub fn build_positive_prompt(raw: impl AsRef<str>) -> Result<String, ValidationError> {
    let trimmed = raw.as_ref().trim();
    let truncated: String = trimmed.chars().take(MAX_PROMPT_CHARS).collect();
    if truncated.chars().count() < MIN_PROMPT_CHARS {
        return Err(ValidationError::InvalidPrompt(format!(
            "prompt must contain at least {MIN_PROMPT_CHARS} characters"
        )));
    }
    Ok(truncated)
}

/// Same gate for loosely typed input: `null` coerces to an empty string,
/// scalars to their display form.
pub fn build_positive_prompt_value(raw: &Value) -> Result<String, ValidationError> {
    let text = match raw {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    build_positive_prompt(text)
}
