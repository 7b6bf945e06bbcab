use super::registry::ModelRegistry;
use super::router::{classify, validate_base_model_in, ModelFamily, DEFAULT_BASE_MODEL};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSelection {
    pub model_id: String,
    pub family: ModelFamily,
    pub requested: Option<String>,
    pub fallback_reason: Option<String>,
}

/// Permissive model resolution: invalid or missing ids fall back to
/// [`DEFAULT_BASE_MODEL`] with an explanation instead of failing.
#[derive(Debug, Clone, Default)]
pub struct ModelSelector {
    pub registry: ModelRegistry,
}

impl ModelSelector {
    pub fn new(registry: Option<ModelRegistry>) -> Self {
        Self {
            registry: registry.unwrap_or_default(),
        }
    }

    pub fn select(&self, requested: Option<&str>) -> ModelSelection {
        let requested = requested
            .map(str::trim)
            .filter(|value| !value.is_empty());
        let fallback_reason = match requested {
            Some(model_id) => match validate_base_model_in(&self.registry, model_id) {
                Ok(valid) => {
                    return ModelSelection {
                        model_id: valid.to_string(),
                        family: classify(valid),
                        requested: Some(model_id.to_string()),
                        fallback_reason: None,
                    };
                }
                Err(err) => format!("{err}; using default model '{DEFAULT_BASE_MODEL}'."),
            },
            None => "No model specified; using default.".to_string(),
        };

        ModelSelection {
            model_id: DEFAULT_BASE_MODEL.to_string(),
            family: ModelFamily::Air,
            requested: requested.map(str::to_string),
            fallback_reason: Some(fallback_reason),
        }
    }
}
