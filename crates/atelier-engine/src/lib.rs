pub mod config;
pub mod error;
mod http;
pub mod orchestrator;
pub mod persistence;
pub mod providers;
pub mod runner;
pub mod storage;
pub mod variants;

#[cfg(test)]
mod test_support;

pub use config::EngineConfig;
pub use error::{GenerationError, ProviderError, VariantError};
pub use orchestrator::{GenerationReport, Orchestrator, PipelineOutcome};
pub use providers::{default_provider_registry, ImageProvider, ImageProviderRegistry, ProviderImage};
pub use runner::{drain_queue, QueueRunner, RunSummary};
