use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

use super::registry::ModelRegistry;
use crate::error::ValidationError;

/// Base model used whenever a requested id cannot be honored.
pub const DEFAULT_BASE_MODEL: &str = "rundiffusion:130@100";

pub const FAL_PREFIX: &str = "fal-ai/";
pub const REVE_PREFIX: &str = "reve:";

/// `source:modelNum@version`, e.g. `rundiffusion:130@100`.
pub const AIR_PATTERN: &str = r"^[A-Za-z0-9_-]+:\d+@\d+$";

const REVE_VERSION_PATTERN: &str = r"^[A-Za-z0-9._@-]+$";

const CONTROL_NET_PREFIXES: &[&str] = &["runware:20@", "runware:21@", "civitai:"];

pub static AIR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(AIR_PATTERN).expect("valid regex"));

static REVE_VERSION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(REVE_VERSION_PATTERN).expect("valid regex"));

static DEFAULT_REGISTRY: LazyLock<ModelRegistry> = LazyLock::new(ModelRegistry::default);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelFamily {
    Fal,
    Air,
    Reve,
    Unknown,
}

impl ModelFamily {
    /// Name of the provider adapter serving this family.
    pub fn provider_name(self) -> &'static str {
        match self {
            ModelFamily::Fal => "fal",
            ModelFamily::Air => "runware",
            ModelFamily::Reve => "reve",
            ModelFamily::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ModelFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.provider_name())
    }
}

pub fn classify(model_id: &str) -> ModelFamily {
    let model_id = model_id.trim();
    if model_id.starts_with(FAL_PREFIX) {
        return ModelFamily::Fal;
    }
    if model_id.starts_with(REVE_PREFIX) {
        return ModelFamily::Reve;
    }
    if AIR_REGEX.is_match(model_id) {
        return ModelFamily::Air;
    }
    ModelFamily::Unknown
}

pub fn is_control_net(model_id: &str) -> bool {
    let model_id = model_id.trim();
    CONTROL_NET_PREFIXES
        .iter()
        .any(|prefix| model_id.starts_with(prefix))
}

/// Version part of a `reve:<version>` id.
pub fn reve_version(model_id: &str) -> Option<&str> {
    model_id
        .trim()
        .strip_prefix(REVE_PREFIX)
        .map(str::trim)
        .filter(|version| REVE_VERSION_REGEX.is_match(version))
}

/// Syntactic base-model check against the built-in FAL allow-list.
///
/// ControlNet-shaped AIR ids pass here; callers that need a usable base
/// model must also check [`is_control_net`].
pub fn validate_base_model(model_id: &str) -> Result<&str, ValidationError> {
    validate_base_model_in(&DEFAULT_REGISTRY, model_id)
}

pub fn validate_base_model_in<'a>(
    registry: &ModelRegistry,
    model_id: &'a str,
) -> Result<&'a str, ValidationError> {
    if model_id.trim().is_empty() {
        return Err(ValidationError::InvalidModel(
            "model id is empty".to_string(),
        ));
    }
    match classify(model_id) {
        ModelFamily::Fal => {
            if registry.contains(model_id.trim()) {
                Ok(model_id)
            } else {
                Err(ValidationError::InvalidModel(format!(
                    "'{model_id}' is not a supported FAL model"
                )))
            }
        }
        ModelFamily::Reve => {
            if reve_version(model_id).is_some() {
                Ok(model_id)
            } else {
                Err(ValidationError::InvalidModel(format!(
                    "'{model_id}' is missing a REVE version"
                )))
            }
        }
        ModelFamily::Air => Ok(model_id),
        ModelFamily::Unknown => Err(ValidationError::InvalidModel(format!(
            "'{model_id}' is not a valid AIR identifier (expected source:model@version)"
        ))),
    }
}
