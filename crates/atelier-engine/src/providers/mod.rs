mod fal;
mod reve;
mod runware;

use std::collections::BTreeMap;

use atelier_contracts::models::ModelFamily;
use atelier_contracts::request::GenerationRequest;
use serde_json::{Map, Value};

use crate::config::EngineConfig;
use crate::error::ProviderError;

pub use fal::FalProvider;
pub use reve::ReveProvider;
pub use runware::{backoff_delay, RunwareProvider, CONTROL_NET_BASE_MODEL_CODE};

/// Provider output normalized to one shape: either a URL or an inline
/// base64 payload, plus whatever metadata the provider reported.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ProviderImage {
    pub image_url: Option<String>,
    pub image_base64: Option<String>,
    pub mime_type: Option<String>,
    pub width: u32,
    pub height: u32,
    pub seed: Option<i64>,
    pub cost: Option<f64>,
    pub nsfw: Option<bool>,
    pub provider_meta: Map<String, Value>,
}

pub trait ImageProvider: Send + Sync {
    fn name(&self) -> &str;

    fn family(&self) -> ModelFamily;

    /// Reports missing credentials before any request is attempted.
    fn check_configuration(&self) -> Result<(), String>;

    fn generate(&self, request: &GenerationRequest) -> Result<ProviderImage, ProviderError>;
}

#[derive(Default)]
pub struct ImageProviderRegistry {
    providers: BTreeMap<String, Box<dyn ImageProvider>>,
}

impl ImageProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: ImageProvider + 'static>(&mut self, provider: P) {
        self.providers
            .insert(provider.name().to_string(), Box::new(provider));
    }

    pub fn register_boxed(&mut self, provider: Box<dyn ImageProvider>) {
        self.providers.insert(provider.name().to_string(), provider);
    }

    pub fn get(&self, name: &str) -> Option<&dyn ImageProvider> {
        self.providers.get(name).map(|provider| provider.as_ref())
    }

    pub fn for_family(&self, family: ModelFamily) -> Option<&dyn ImageProvider> {
        self.providers
            .values()
            .find(|provider| provider.family() == family)
            .map(|provider| provider.as_ref())
    }

    pub fn names(&self) -> Vec<String> {
        self.providers.keys().cloned().collect()
    }
}

pub fn default_provider_registry(config: &EngineConfig) -> ImageProviderRegistry {
    let mut providers = ImageProviderRegistry::new();
    providers.register(RunwareProvider::new(config.runware.clone()));
    providers.register(FalProvider::new(config.fal.clone()));
    providers.register(ReveProvider::new(config.reve.clone()));
    providers
}
