use indexmap::IndexMap;

/// Shape of the request body a FAL model expects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FalPayloadStyle {
    Imagen4,
    Flux,
    FluxUltra,
    Recraft,
    Ideogram,
    Generic,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelSpec {
    pub name: String,
    pub label: String,
    pub payload: FalPayloadStyle,
    pub supports_negative_prompt: bool,
}

/// Allow-list of FAL model ids the pipeline is willing to dispatch.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    models: IndexMap<String, ModelSpec>,
}

impl Default for ModelRegistry {
    fn default() -> Self {
        Self::new(None)
    }
}

impl ModelRegistry {
    pub fn new(models: Option<IndexMap<String, ModelSpec>>) -> Self {
        Self {
            models: models.unwrap_or_else(default_fal_models),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelSpec> {
        self.models.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.models.contains_key(name)
    }

    pub fn list(&self) -> impl Iterator<Item = &ModelSpec> {
        self.models.values()
    }

    /// Payload style for a FAL id; ids outside the allow-list get the generic body.
    pub fn payload_style(&self, name: &str) -> FalPayloadStyle {
        self.get(name)
            .map(|spec| spec.payload)
            .unwrap_or(FalPayloadStyle::Generic)
    }
}

fn default_fal_models() -> IndexMap<String, ModelSpec> {
    let mut map = IndexMap::new();

    let mut insert = |name: &str, label: &str, payload: FalPayloadStyle, negative: bool| {
        map.insert(
            name.to_string(),
            ModelSpec {
                name: name.to_string(),
                label: label.to_string(),
                payload,
                supports_negative_prompt: negative,
            },
        );
    };

    insert(
        "fal-ai/imagen4/preview",
        "Imagen 4",
        FalPayloadStyle::Imagen4,
        true,
    );
    insert(
        "fal-ai/imagen4/preview/fast",
        "Imagen 4 Fast",
        FalPayloadStyle::Imagen4,
        true,
    );
    insert(
        "fal-ai/imagen4/preview/ultra",
        "Imagen 4 Ultra",
        FalPayloadStyle::Imagen4,
        true,
    );
    insert("fal-ai/flux/dev", "FLUX.1 [dev]", FalPayloadStyle::Flux, false);
    insert(
        "fal-ai/flux/schnell",
        "FLUX.1 [schnell]",
        FalPayloadStyle::Flux,
        false,
    );
    insert(
        "fal-ai/flux-pro/v1.1",
        "FLUX1.1 [pro]",
        FalPayloadStyle::Flux,
        false,
    );
    insert(
        "fal-ai/flux-pro/v1.1-ultra",
        "FLUX1.1 [pro] ultra",
        FalPayloadStyle::FluxUltra,
        false,
    );
    insert(
        "fal-ai/recraft-v3",
        "Recraft V3",
        FalPayloadStyle::Recraft,
        false,
    );
    insert(
        "fal-ai/ideogram/v2",
        "Ideogram V2",
        FalPayloadStyle::Ideogram,
        true,
    );
    insert(
        "fal-ai/hidream-i1-full",
        "HiDream I1 Full",
        FalPayloadStyle::Generic,
        true,
    );
    insert(
        "fal-ai/stable-diffusion-v35-large",
        "Stable Diffusion 3.5 Large",
        FalPayloadStyle::Generic,
        true,
    );

    map
}

#[cfg(test)]
mod tests {
    use super::{FalPayloadStyle, ModelRegistry};

    #[test]
    fn default_registry_lists_imagen_first() {
        let registry = ModelRegistry::default();
        let first = registry.list().next().map(|spec| spec.name.clone());
        assert_eq!(first.as_deref(), Some("fal-ai/imagen4/preview"));
        assert!(registry.contains("fal-ai/flux/dev"));
        assert!(!registry.contains("fal-ai/not-a-real-model"));
    }

    #[test]
    fn unknown_ids_use_generic_payload() {
        let registry = ModelRegistry::default();
        assert_eq!(
            registry.payload_style("fal-ai/flux-pro/v1.1-ultra"),
            FalPayloadStyle::FluxUltra
        );
        assert_eq!(
            registry.payload_style("fal-ai/something-new"),
            FalPayloadStyle::Generic
        );
    }
}
