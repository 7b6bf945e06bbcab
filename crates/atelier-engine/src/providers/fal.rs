use std::thread;
use std::time::{Duration, Instant};

use atelier_contracts::models::{FalPayloadStyle, ModelFamily, ModelRegistry};
use atelier_contracts::request::{nearest_supported_ratio, GenerationRequest, OutputFormat};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::AUTHORIZATION;
use serde_json::{json, Map, Value};

use super::{ImageProvider, ProviderImage};
use crate::config::{FalConfig, FalMode};
use crate::error::ProviderError;
use crate::http::{build_client, is_retryable_transport_error, response_json_or_error};

const IMAGEN_RATIOS: &[&str] = &["1:1", "16:9", "9:16", "3:4", "4:3"];
const FLUX_ULTRA_RATIOS: &[&str] = &[
    "21:9", "16:9", "4:3", "3:2", "1:1", "2:3", "3:4", "9:16", "9:21",
];
const IDEOGRAM_RATIOS: &[&str] = &[
    "10:16", "16:10", "9:16", "16:9", "4:3", "3:4", "1:1", "1:3", "3:1", "3:2", "2:3",
];

/// Keys under which some FAL models nest their `images` array.
const NESTED_RESULT_KEYS: &[&str] = &["data", "response", "output", "result"];

pub struct FalProvider {
    config: FalConfig,
    registry: ModelRegistry,
    http: HttpClient,
}

impl FalProvider {
    pub fn new(config: FalConfig) -> Self {
        let http = build_client(Some(config.timeout));
        Self {
            config,
            registry: ModelRegistry::default(),
            http,
        }
    }

    pub fn with_registry(mut self, registry: ModelRegistry) -> Self {
        self.registry = registry;
        self
    }

    fn build_payload(&self, request: &GenerationRequest) -> Value {
        let style = self.registry.payload_style(&request.model);
        let negative = self
            .registry
            .get(&request.model)
            .map(|spec| spec.supports_negative_prompt)
            .unwrap_or(true);
        let image_size = json!({"width": request.width, "height": request.height});

        let mut payload = Map::new();
        payload.insert("prompt".to_string(), json!(request.prompt));
        match style {
            FalPayloadStyle::Imagen4 => {
                payload.insert(
                    "aspect_ratio".to_string(),
                    json!(nearest_supported_ratio(
                        request.width,
                        request.height,
                        IMAGEN_RATIOS
                    )),
                );
                payload.insert("num_images".to_string(), json!(1));
            }
            FalPayloadStyle::Flux => {
                payload.insert("image_size".to_string(), image_size);
                payload.insert(
                    "num_inference_steps".to_string(),
                    json!(request.steps.clamp(1, 50)),
                );
                payload.insert(
                    "guidance_scale".to_string(),
                    json!(request.cfg_scale.clamp(1.0, 20.0)),
                );
                payload.insert("num_images".to_string(), json!(1));
                payload.insert("enable_safety_checker".to_string(), json!(true));
                payload.insert(
                    "output_format".to_string(),
                    json!(flux_output_format(request.output_format)),
                );
            }
            FalPayloadStyle::FluxUltra => {
                payload.insert(
                    "aspect_ratio".to_string(),
                    json!(nearest_supported_ratio(
                        request.width,
                        request.height,
                        FLUX_ULTRA_RATIOS
                    )),
                );
                payload.insert("num_images".to_string(), json!(1));
                payload.insert("enable_safety_checker".to_string(), json!(true));
                payload.insert(
                    "output_format".to_string(),
                    json!(flux_output_format(request.output_format)),
                );
            }
            FalPayloadStyle::Recraft => {
                payload.insert("image_size".to_string(), image_size);
                payload.insert("style".to_string(), json!("realistic_image"));
            }
            FalPayloadStyle::Ideogram => {
                payload.insert(
                    "aspect_ratio".to_string(),
                    json!(nearest_supported_ratio(
                        request.width,
                        request.height,
                        IDEOGRAM_RATIOS
                    )),
                );
                payload.insert("expand_prompt".to_string(), json!(false));
            }
            FalPayloadStyle::Generic => {
                payload.insert("image_size".to_string(), image_size);
                payload.insert("num_inference_steps".to_string(), json!(request.steps));
                payload.insert("guidance_scale".to_string(), json!(request.cfg_scale));
                payload.insert("num_images".to_string(), json!(1));
            }
        }
        if negative {
            if let Some(text) = request
                .negative_prompt
                .as_deref()
                .map(str::trim)
                .filter(|value| !value.is_empty())
            {
                payload.insert("negative_prompt".to_string(), json!(text));
            }
        }
        if let Some(seed) = request.seed {
            payload.insert("seed".to_string(), json!(seed));
        }
        Value::Object(payload)
    }

    fn timed_out(&self, what: &str) -> ProviderError {
        ProviderError::retryable(
            "timeout",
            format!(
                "FAL {what} timed out after {:.1}s",
                self.config.timeout.as_secs_f64()
            ),
        )
    }

    fn send_error(&self, err: reqwest::Error, what: &str) -> ProviderError {
        if err.is_timeout() {
            return self.timed_out(what);
        }
        if is_retryable_transport_error(&err) {
            ProviderError::retryable("network_error", format!("FAL {what} failed: {err}"))
        } else {
            ProviderError::terminal("request_failed", format!("FAL {what} failed: {err}"))
        }
    }

    /// Time left before `deadline`, or the timeout error once it has passed.
    fn remaining(&self, deadline: Instant, what: &str) -> Result<Duration, ProviderError> {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            return Err(self.timed_out(what));
        }
        Ok(left)
    }

    fn post(
        &self,
        url: &str,
        api_key: &str,
        payload: &Value,
        timeout: Duration,
    ) -> Result<Value, ProviderError> {
        let response = self
            .http
            .post(url)
            .header(AUTHORIZATION, format!("Key {api_key}"))
            .timeout(timeout)
            .json(payload)
            .send()
            .map_err(|err| self.send_error(err, "request"))?;
        response_json_or_error("FAL", response)
    }

    fn get(&self, url: &str, api_key: &str, timeout: Duration) -> Result<Value, ProviderError> {
        let response = self
            .http
            .get(url)
            .header(AUTHORIZATION, format!("Key {api_key}"))
            .timeout(timeout)
            .send()
            .map_err(|err| self.send_error(err, "poll"))?;
        response_json_or_error("FAL", response)
    }

    fn run_sync(&self, api_key: &str, request: &GenerationRequest) -> Result<Value, ProviderError> {
        let url = format!(
            "{}/{}",
            self.config.sync_base.trim_end_matches('/'),
            request.model
        );
        self.post(&url, api_key, &self.build_payload(request), self.config.timeout)
    }

    fn run_queued(
        &self,
        api_key: &str,
        request: &GenerationRequest,
    ) -> Result<(Value, Option<String>), ProviderError> {
        let deadline = Instant::now() + self.config.timeout;
        let queue_base = self.config.queue_base.trim_end_matches('/');
        let submit_url = format!("{queue_base}/{}", request.model);
        let submitted = self.post(
            &submit_url,
            api_key,
            &self.build_payload(request),
            self.remaining(deadline, "submission")?,
        )?;

        let request_id = string_field(&submitted, "request_id");
        let status_url = string_field(&submitted, "status_url").or_else(|| {
            request_id
                .as_ref()
                .map(|id| format!("{submit_url}/requests/{id}/status"))
        });
        let response_url = string_field(&submitted, "response_url").or_else(|| {
            request_id
                .as_ref()
                .map(|id| format!("{submit_url}/requests/{id}"))
        });
        let (Some(status_url), Some(response_url)) = (status_url, response_url) else {
            return Err(ProviderError::malformed(
                "FAL queue submission returned no request id",
            ));
        };
        tracing::debug!(request_id = ?request_id, model = %request.model, "FAL job queued");

        loop {
            let left = self.remaining(deadline, "generation")?;
            let status = self.get(&status_url, api_key, left)?;
            let state = string_field(&status, "status")
                .unwrap_or_default()
                .to_ascii_uppercase();
            match state.as_str() {
                "COMPLETED" => break,
                "FAILED" | "ERROR" => {
                    let detail = string_field(&status, "error")
                        .or_else(|| string_field(&status, "message"))
                        .unwrap_or_else(|| state.to_lowercase());
                    return Err(ProviderError::terminal(
                        "generation_failed",
                        format!("FAL generation failed: {detail}"),
                    ));
                }
                _ => {
                    let left = self.remaining(deadline, "generation")?;
                    thread::sleep(self.config.poll_interval.min(left));
                }
            }
        }

        let result = self.get(
            &response_url,
            api_key,
            self.remaining(deadline, "result fetch")?,
        )?;
        Ok((result, request_id))
    }
}

fn flux_output_format(format: OutputFormat) -> &'static str {
    match format {
        OutputFormat::Png => "png",
        OutputFormat::Jpg | OutputFormat::Webp => "jpeg",
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value
        .get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string)
}

/// First entry of `images`, looked up at the top level and then one level down.
fn first_image(result: &Value) -> Option<&Value> {
    fn direct(value: &Value) -> Option<&Value> {
        value
            .get("images")
            .and_then(Value::as_array)
            .and_then(|images| images.first())
            .or_else(|| value.get("image").filter(|image| !image.is_null()))
    }
    direct(result).or_else(|| {
        NESTED_RESULT_KEYS
            .iter()
            .filter_map(|key| result.get(*key))
            .find_map(direct)
    })
}

fn image_url(image: &Value) -> Option<&str> {
    match image {
        Value::String(url) => Some(url.as_str()),
        Value::Object(obj) => obj.get("url").and_then(Value::as_str),
        _ => None,
    }
    .map(str::trim)
    .filter(|url| !url.is_empty())
}

fn to_provider_image(
    result: &Value,
    request: &GenerationRequest,
    request_id: Option<String>,
) -> Result<ProviderImage, ProviderError> {
    let image = first_image(result)
        .ok_or_else(|| ProviderError::malformed("FAL response returned no images"))?;
    let url = image_url(image)
        .ok_or_else(|| ProviderError::malformed("FAL response returned no image URL"))?;
    let dim = |key: &str| {
        image
            .get(key)
            .and_then(Value::as_u64)
            .and_then(|value| u32::try_from(value).ok())
    };

    let mut provider_meta = Map::new();
    provider_meta.insert("endpoint".to_string(), json!(request.model));
    if let Some(id) = request_id {
        provider_meta.insert("request_id".to_string(), json!(id));
    }
    if let Some(prompt) = result.get("prompt").filter(|value| value.is_string()) {
        provider_meta.insert("revised_prompt".to_string(), prompt.clone());
    }

    let (image_url, image_base64) = if url.starts_with("data:") {
        (None, Some(url.to_string()))
    } else {
        (Some(url.to_string()), None)
    };
    Ok(ProviderImage {
        image_url,
        image_base64,
        mime_type: image
            .get("content_type")
            .and_then(Value::as_str)
            .map(str::to_string),
        width: dim("width").unwrap_or(request.width),
        height: dim("height").unwrap_or(request.height),
        seed: result.get("seed").and_then(Value::as_i64).or(request.seed),
        cost: None,
        nsfw: result
            .get("has_nsfw_concepts")
            .and_then(Value::as_array)
            .and_then(|flags| flags.first())
            .and_then(Value::as_bool),
        provider_meta,
    })
}

impl ImageProvider for FalProvider {
    fn name(&self) -> &str {
        "fal"
    }

    fn family(&self) -> ModelFamily {
        ModelFamily::Fal
    }

    fn check_configuration(&self) -> Result<(), String> {
        match self.config.api_key {
            Some(_) => Ok(()),
            None => Err("FAL_KEY (or FAL_API_KEY) not set".to_string()),
        }
    }

    fn generate(&self, request: &GenerationRequest) -> Result<ProviderImage, ProviderError> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            return Err(ProviderError::terminal(
                "missing_api_key",
                "FAL_KEY (or FAL_API_KEY) not set",
            ));
        };
        let (result, request_id) = match self.config.mode {
            FalMode::Sync => (self.run_sync(api_key, request)?, None),
            FalMode::Queue => self.run_queued(api_key, request)?,
        };
        to_provider_image(&result, request, request_id)
    }
}
