//! One prompt in, one catalogued image out.
//!
//! Flow: validate → provisional row → provider call → variants + uploads →
//! single final update → recent-images mirror. Only validation, prompt
//! lookup, configuration and provider failures surface to the caller;
//! everything after a successful provider call degrades instead of failing.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context};
use atelier_contracts::cache::{BestEffortSink, RecentImages};
use atelier_contracts::events::{EventPayload, EventWriter};
use atelier_contracts::models::{ModelSelection, ModelSelector};
use atelier_contracts::prompt::build_positive_prompt;
use atelier_contracts::records::{size_kb, GeneratedImage};
use atelier_contracts::request::{aspect_ratio_label, GenerationOptions, GenerationRequest};
use chrono::Utc;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};

use crate::config::EngineConfig;
use crate::error::GenerationError;
use crate::http::{build_client, data_url, decode_base64_payload, guess_mime, truncate_text};
use crate::persistence::{
    ImageRecordStore, JsonPromptSource, JsonRecordStore, PromptSource, RestPromptSource,
    RestRecordStore,
};
use crate::providers::{default_provider_registry, ImageProvider, ImageProviderRegistry, ProviderImage};
use crate::storage::{upload_bundle, LocalObjectStorage, ObjectStorage, RestObjectStorage};
use crate::variants::generate_variants;

const SOURCE_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(60);

/// How far post-provider processing got.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// Variants generated and all four renditions uploaded.
    Full,
    /// Variants or uploads failed; the record carries the image inline.
    Degraded { reason: String },
    /// No image bytes could be obtained; the record keeps the provider URL.
    Unrecoverable { reason: String },
}

impl PipelineOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineOutcome::Full => "full",
            PipelineOutcome::Degraded { .. } => "degraded",
            PipelineOutcome::Unrecoverable { .. } => "unrecoverable",
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            PipelineOutcome::Full => None,
            PipelineOutcome::Degraded { reason } | PipelineOutcome::Unrecoverable { reason } => {
                Some(reason)
            }
        }
    }
}

impl fmt::Display for PipelineOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct GenerationReport {
    pub record: GeneratedImage,
    pub outcome: PipelineOutcome,
    pub fallback_reason: Option<String>,
}

struct SourceImage {
    bytes: Vec<u8>,
    mime_type: String,
}

pub struct Orchestrator {
    prompts: Arc<dyn PromptSource>,
    records: Arc<dyn ImageRecordStore>,
    storage: Arc<dyn ObjectStorage>,
    providers: ImageProviderRegistry,
    selector: ModelSelector,
    recent: Option<Box<dyn BestEffortSink<GeneratedImage>>>,
    events: Option<EventWriter>,
    http: HttpClient,
}

impl Orchestrator {
    pub fn new(
        prompts: Arc<dyn PromptSource>,
        records: Arc<dyn ImageRecordStore>,
        storage: Arc<dyn ObjectStorage>,
        providers: ImageProviderRegistry,
    ) -> Self {
        Self {
            prompts,
            records,
            storage,
            providers,
            selector: ModelSelector::default(),
            recent: None,
            events: None,
            http: build_client(Some(SOURCE_DOWNLOAD_TIMEOUT)),
        }
    }

    /// Default wiring: the REST backend when configured, local JSON files
    /// and directory storage otherwise.
    pub fn from_config(config: &EngineConfig) -> Self {
        let prompts: Arc<dyn PromptSource>;
        let records: Arc<dyn ImageRecordStore>;
        let storage: Arc<dyn ObjectStorage>;
        match &config.rest {
            Some(rest) => {
                prompts = Arc::new(RestPromptSource::new(rest));
                records = Arc::new(RestRecordStore::new(rest));
                storage = Arc::new(RestObjectStorage::new(rest));
            }
            None => {
                prompts = Arc::new(JsonPromptSource::new(config.prompts_path()));
                records = Arc::new(JsonRecordStore::new(config.records_path()));
                storage = Arc::new(LocalObjectStorage::new(
                    &config.storage_dir,
                    config.storage_public_base.clone(),
                ));
            }
        }
        Self::new(prompts, records, storage, default_provider_registry(config))
            .with_recent_cache(RecentImages::new(config.recent_images_path()))
    }

    pub fn with_selector(mut self, selector: ModelSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn with_recent_cache(mut self, cache: impl BestEffortSink<GeneratedImage> + 'static) -> Self {
        self.recent = Some(Box::new(cache));
        self
    }

    pub fn with_events(mut self, events: EventWriter) -> Self {
        self.events = Some(events);
        self
    }

    /// Client used to download provider-hosted images.
    pub fn with_http(mut self, http: HttpClient) -> Self {
        self.http = http;
        self
    }

    pub fn providers(&self) -> &ImageProviderRegistry {
        &self.providers
    }

    pub fn generate(
        &self,
        prompt_id: &str,
        options: &GenerationOptions,
    ) -> Result<GenerationReport, GenerationError> {
        let prompt = self
            .prompts
            .prompt(prompt_id)
            .map_err(|err| GenerationError::PromptLookup(format!("{err:#}")))?
            .ok_or_else(|| GenerationError::PromptNotFound(prompt_id.to_string()))?;
        let text = build_positive_prompt(&prompt.prompt)?;

        let selection = self.selector.select(options.model.as_deref());
        if let Some(reason) = &selection.fallback_reason {
            tracing::warn!(prompt_id, requested = ?selection.requested, %reason, "model fallback applied");
        }
        let mut request = GenerationRequest::new(prompt_id, text).with_options(options);
        request.model = selection.model_id.clone();
        request.negative_prompt = prompt.negative_prompt.clone();

        let provider = self.providers.for_family(selection.family).ok_or_else(|| {
            GenerationError::Configuration(format!(
                "no provider registered for {} models",
                selection.family
            ))
        })?;
        provider
            .check_configuration()
            .map_err(GenerationError::Configuration)?;

        let record_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("generation", record_id = %record_id, prompt_id, provider = provider.name());
        let _entered = span.enter();

        let mut record = GeneratedImage::provisional(&record_id, &request, &prompt);
        record.extended_metadata = base_metadata(provider, &selection);
        self.emit(
            "generation_started",
            &record_id,
            json!({
                "prompt_id": prompt_id,
                "model": request.model,
                "provider": provider.name(),
                "fallback_reason": selection.fallback_reason,
            }),
        );

        let provisional_saved = match self.records.insert(&record) {
            Ok(()) => {
                self.emit("record_provisional", &record_id, json!({}));
                true
            }
            Err(err) => {
                tracing::warn!(
                    store = self.records.name(),
                    error = %format!("{err:#}"),
                    "provisional insert failed; continuing"
                );
                false
            }
        };

        let started = Instant::now();
        let image = match provider.generate(&request) {
            Ok(image) => image,
            Err(err) => {
                tracing::error!(code = %err.code, retryable = err.retryable, error = %err.message, "provider failed");
                self.emit(
                    "generation_failed",
                    &record_id,
                    json!({
                        "provider": provider.name(),
                        "model": request.model,
                        "code": err.code,
                        "error": err.message,
                    }),
                );
                return Err(err.into());
            }
        };
        let latency_ms = started.elapsed().as_millis() as u64;
        tracing::info!(latency_ms, "provider completed");
        self.emit(
            "provider_completed",
            &record_id,
            json!({
                "provider": provider.name(),
                "latency_ms": latency_ms,
                "cost": image.cost,
            }),
        );

        let outcome = self.finalize(&mut record, &request, &image);
        if let Some(reason) = outcome.reason() {
            tracing::warn!(outcome = %outcome, %reason, "pipeline degraded");
            self.emit(
                "pipeline_degraded",
                &record_id,
                json!({"outcome": outcome.as_str(), "reason": reason}),
            );
        }

        self.write_final(&record, provisional_saved);
        if let Some(recent) = &self.recent {
            recent.try_persist(&record);
        }

        self.emit(
            "generation_finished",
            &record_id,
            json!({
                "outcome": outcome.as_str(),
                "image_url": record.image_url.as_deref().map(|url| truncate_text(url, 256)),
                "width": record.width,
                "height": record.height,
            }),
        );
        tracing::info!(outcome = %outcome, "generation finished");

        Ok(GenerationReport {
            record,
            outcome,
            fallback_reason: selection.fallback_reason,
        })
    }

    /// Patches the provisional row, or inserts the whole record when that
    /// row was never written.
    fn write_final(&self, record: &GeneratedImage, provisional_saved: bool) {
        let result = if provisional_saved {
            record
                .final_patch()
                .and_then(|patch| self.records.update(&record.id, &patch))
        } else {
            self.records.insert(record)
        };
        if let Err(err) = result {
            tracing::warn!(
                store = self.records.name(),
                error = %format!("{err:#}"),
                provisional_saved,
                "final write failed"
            );
        }
    }

    fn finalize(
        &self,
        record: &mut GeneratedImage,
        request: &GenerationRequest,
        image: &ProviderImage,
    ) -> PipelineOutcome {
        record.seed = image.seed.or(request.seed);
        record.cost = image.cost;
        record.mature_content = image.nsfw.unwrap_or(false);
        record.updated_at = Utc::now();
        record.width = request.width;
        record.height = request.height;
        if !image.provider_meta.is_empty() {
            record.extended_metadata.insert(
                "provider_meta".to_string(),
                Value::Object(image.provider_meta.clone()),
            );
        }

        let outcome = match self.fetch_source(image) {
            Err(err) => {
                let raw = image.image_url.clone();
                record.image_url = raw.clone();
                record.desktop_url = raw.clone();
                record.mobile_url = raw.clone();
                record.thumbnail_url = raw;
                PipelineOutcome::Unrecoverable {
                    reason: format!("{err:#}"),
                }
            }
            Ok(source) => match self.store_variants(record, request, &source) {
                Ok(()) => PipelineOutcome::Full,
                Err(err) => {
                    let inline = data_url(&source.mime_type, &source.bytes);
                    let size = Some(size_kb(source.bytes.len()));
                    record.image_url = Some(inline.clone());
                    record.desktop_url = Some(inline.clone());
                    record.mobile_url = Some(inline.clone());
                    record.thumbnail_url = Some(inline);
                    record.original_size_kb = size;
                    record.desktop_size_kb = size;
                    record.mobile_size_kb = size;
                    record.thumbnail_size_kb = size;
                    PipelineOutcome::Degraded {
                        reason: format!("{err:#}"),
                    }
                }
            },
        };

        record.aspect_ratio = aspect_ratio_label(record.width, record.height);
        record
            .extended_metadata
            .insert("pipeline_outcome".to_string(), json!(outcome.as_str()));
        if let Some(reason) = outcome.reason() {
            record
                .extended_metadata
                .insert("degraded_reason".to_string(), json!(reason));
        }
        outcome
    }

    fn store_variants(
        &self,
        record: &mut GeneratedImage,
        request: &GenerationRequest,
        source: &SourceImage,
    ) -> anyhow::Result<()> {
        let bundle = generate_variants(&source.bytes, request.output_format.extension())?;
        let uploaded = upload_bundle(self.storage.as_ref(), &record.id, &bundle)?;

        record.image_url = Some(uploaded.original_url);
        record.desktop_url = Some(uploaded.desktop_url);
        record.mobile_url = Some(uploaded.mobile_url);
        record.thumbnail_url = Some(uploaded.thumbnail_url);
        record.original_size_kb = Some(size_kb(bundle.original.bytes.len()));
        record.desktop_size_kb = Some(size_kb(bundle.desktop.bytes.len()));
        record.mobile_size_kb = Some(size_kb(bundle.mobile.bytes.len()));
        record.thumbnail_size_kb = Some(size_kb(bundle.thumbnail.bytes.len()));
        record.width = bundle.desktop.width;
        record.height = bundle.desktop.height;
        Ok(())
    }

    fn fetch_source(&self, image: &ProviderImage) -> anyhow::Result<SourceImage> {
        let inline = image
            .image_base64
            .as_deref()
            .or_else(|| image.image_url.as_deref().filter(|url| url.starts_with("data:")));
        if let Some(encoded) = inline {
            let (bytes, mime) =
                decode_base64_payload(encoded).map_err(|err| anyhow::anyhow!(err))?;
            return Ok(source_image(bytes, mime.or_else(|| image.mime_type.clone())));
        }

        let Some(url) = image.image_url.as_deref() else {
            bail!("provider returned neither an image URL nor inline data");
        };
        let response = self
            .http
            .get(url)
            .send()
            .with_context(|| format!("failed downloading generated image ({url})"))?;
        if !response.status().is_success() {
            bail!(
                "generated image download failed ({})",
                response.status().as_u16()
            );
        }
        let header_mime = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let bytes = response
            .bytes()
            .context("failed reading generated image bytes")?
            .to_vec();
        if bytes.is_empty() {
            bail!("generated image download returned no bytes");
        }
        Ok(source_image(bytes, header_mime.or_else(|| image.mime_type.clone())))
    }

    fn emit(&self, event_type: &str, record_id: &str, payload: Value) {
        if let Some(events) = &self.events {
            events.record(event_type, record_id, map_object(payload));
        }
    }
}

fn source_image(bytes: Vec<u8>, declared: Option<String>) -> SourceImage {
    let mime_type = declared
        .filter(|mime| mime.starts_with("image/"))
        .unwrap_or_else(|| guess_mime(&bytes).to_string());
    SourceImage { bytes, mime_type }
}

fn base_metadata(provider: &dyn ImageProvider, selection: &ModelSelection) -> Map<String, Value> {
    let mut meta = Map::new();
    meta.insert("provider".to_string(), json!(provider.name()));
    if let Some(requested) = &selection.requested {
        meta.insert("requested_model".to_string(), json!(requested));
    }
    if let Some(reason) = &selection.fallback_reason {
        meta.insert("model_fallback".to_string(), json!(reason));
    }
    meta
}

fn map_object(value: Value) -> EventPayload {
    value.as_object().cloned().unwrap_or_default()
}
