use std::thread;
use std::time::Duration;

use atelier_contracts::models::{is_control_net, ModelFamily};
use atelier_contracts::request::GenerationRequest;
use rand::Rng;
use reqwest::blocking::Client as HttpClient;
use serde_json::{json, Map, Value};

use super::{ImageProvider, ProviderImage};
use crate::config::RunwareConfig;
use crate::error::ProviderError;
use crate::http::{build_client, is_retryable_transport_error, truncate_text};

/// Error code Runware returns when a ControlNet model is sent as the base model.
pub const CONTROL_NET_BASE_MODEL_CODE: &str = "invalidControlNetAsBaseModel";

const CONTROL_NET_MESSAGE: &str = "The selected model is a ControlNet model and cannot be used \
     as a base model. Choose a checkpoint model instead.";

/// `base × 2^attempt × jitter`; callers draw `jitter` from [0.8, 1.2).
pub fn backoff_delay(base: Duration, attempt: u32, jitter: f64) -> Duration {
    base.mul_f64(2f64.powi(attempt as i32) * jitter)
}

pub struct RunwareProvider {
    config: RunwareConfig,
    http: HttpClient,
}

impl RunwareProvider {
    pub fn new(config: RunwareConfig) -> Self {
        Self {
            config,
            http: build_client(None),
        }
    }

    fn build_task(request: &GenerationRequest) -> Value {
        let mut task = Map::new();
        task.insert("taskType".to_string(), json!("imageInference"));
        task.insert(
            "taskUUID".to_string(),
            json!(uuid::Uuid::new_v4().to_string()),
        );
        task.insert("positivePrompt".to_string(), json!(request.prompt));
        if let Some(negative) = request
            .negative_prompt
            .as_deref()
            .map(str::trim)
            .filter(|value| value.chars().count() >= 2)
        {
            task.insert("negativePrompt".to_string(), json!(negative));
        }
        task.insert("model".to_string(), json!(request.model));
        task.insert("width".to_string(), json!(request.width));
        task.insert("height".to_string(), json!(request.height));
        task.insert("steps".to_string(), json!(request.steps));
        task.insert("CFGScale".to_string(), json!(request.cfg_scale));
        task.insert("scheduler".to_string(), json!(request.scheduler));
        task.insert("numberResults".to_string(), json!(1));
        task.insert(
            "outputFormat".to_string(),
            json!(request.output_format.as_provider_str()),
        );
        task.insert("outputType".to_string(), json!("URL"));
        task.insert("includeCost".to_string(), json!(true));
        task.insert("checkNSFW".to_string(), json!(true));
        if let Some(seed) = request.seed {
            task.insert("seed".to_string(), json!(seed));
        }
        Value::Array(vec![Value::Object(task)])
    }

    fn map_error_code(code: &str, message: &str, status: Option<u16>) -> ProviderError {
        let message = if code == CONTROL_NET_BASE_MODEL_CODE {
            CONTROL_NET_MESSAGE.to_string()
        } else {
            message.to_string()
        };
        ProviderError {
            code: code.to_string(),
            message,
            retryable: false,
            status,
        }
    }

    /// Reads the envelope of a non-5xx response.
    fn parse_envelope(status: u16, body: &str) -> Result<Value, ProviderError> {
        let parsed: Option<Value> = serde_json::from_str(body).ok();
        if let Some(first) = parsed
            .as_ref()
            .and_then(|value| value.get("errors"))
            .and_then(Value::as_array)
            .and_then(|errors| errors.first())
        {
            let code = first
                .get("code")
                .and_then(Value::as_str)
                .unwrap_or("unknown_error");
            let message = first
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Runware reported an error without a message");
            return Err(Self::map_error_code(code, message, Some(status)));
        }
        if !(200..300).contains(&status) {
            return Err(ProviderError::from_status(
                status,
                format!("http_{status}"),
                format!("Runware request failed ({status}): {}", truncate_text(body, 512)),
            ));
        }
        parsed.ok_or_else(|| ProviderError::malformed("Runware returned invalid JSON payload"))
    }

    fn post_with_retries(&self, api_key: &str, payload: &Value) -> Result<Value, ProviderError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            if attempt > 0 {
                let jitter = rand::rng().random_range(0.8..1.2);
                let delay = backoff_delay(self.config.base_delay, attempt - 1, jitter);
                tracing::warn!(
                    attempt = attempt + 1,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %last_error,
                    "retrying Runware request after transient failure"
                );
                thread::sleep(delay);
            }

            let response = self
                .http
                .post(&self.config.api_base)
                .bearer_auth(api_key)
                .json(payload)
                .send();
            let response = match response {
                Ok(response) => response,
                Err(err) if is_retryable_transport_error(&err) => {
                    last_error = err.to_string();
                    continue;
                }
                Err(err) => {
                    return Err(ProviderError::terminal(
                        "request_failed",
                        format!("Runware request failed: {err}"),
                    ));
                }
            };

            let status = response.status().as_u16();
            let body = match response.text() {
                Ok(body) => body,
                Err(err) => {
                    last_error = format!("response body read failed: {err}");
                    continue;
                }
            };
            if status >= 500 {
                last_error = format!("HTTP {status}: {}", truncate_text(&body, 256));
                continue;
            }
            return Self::parse_envelope(status, &body);
        }

        Err(ProviderError::retryable(
            "network_error",
            format!("Network error after {max_attempts} retries: {last_error}"),
        ))
    }
}

impl ImageProvider for RunwareProvider {
    fn name(&self) -> &str {
        "runware"
    }

    fn family(&self) -> ModelFamily {
        ModelFamily::Air
    }

    fn check_configuration(&self) -> Result<(), String> {
        match self.config.api_key {
            Some(_) => Ok(()),
            None => Err("RUNWARE_API_KEY not set".to_string()),
        }
    }

    fn generate(&self, request: &GenerationRequest) -> Result<ProviderImage, ProviderError> {
        if is_control_net(&request.model) {
            return Err(Self::map_error_code(
                CONTROL_NET_BASE_MODEL_CODE,
                "ControlNet model used as base model",
                None,
            ));
        }
        let Some(api_key) = self.config.api_key.as_deref() else {
            return Err(ProviderError::terminal(
                "missing_api_key",
                "RUNWARE_API_KEY not set",
            ));
        };

        let payload = Self::build_task(request);
        let envelope = self.post_with_retries(api_key, &payload)?;
        let item = envelope
            .get("data")
            .and_then(Value::as_array)
            .and_then(|rows| rows.first())
            .ok_or_else(|| ProviderError::malformed("Runware response contained no data"))?;
        let image_url = item
            .get("imageURL")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ProviderError::malformed("Runware response contained no imageURL"))?;

        let mut provider_meta = Map::new();
        for key in ["taskUUID", "imageUUID"] {
            if let Some(value) = item.get(key).filter(|value| !value.is_null()) {
                provider_meta.insert(key.to_string(), value.clone());
            }
        }

        Ok(ProviderImage {
            image_url: Some(image_url.to_string()),
            image_base64: None,
            mime_type: Some(request.output_format.mime_type().to_string()),
            width: request.width,
            height: request.height,
            seed: item.get("seed").and_then(Value::as_i64).or(request.seed),
            cost: item.get("cost").and_then(Value::as_f64),
            nsfw: item.get("NSFWContent").and_then(Value::as_bool),
            provider_meta,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::test_support::{StubResponse, StubServer};

    fn provider(base: &str) -> RunwareProvider {
        RunwareProvider::new(RunwareConfig {
            api_key: Some("rw-key".to_string()),
            api_base: base.to_string(),
            max_attempts: 3,
            base_delay: Duration::from_millis(1),
        })
    }

    fn request(model: &str) -> GenerationRequest {
        let mut request = GenerationRequest::new("p-1", "A cat");
        request.model = model.to_string();
        request
    }

    #[test]
    fn sends_single_image_inference_task() {
        let server = StubServer::start(|_| {
            vec![StubResponse::json(
                200,
                json!({"data": [{
                    "taskType": "imageInference",
                    "imageUUID": "img-uuid",
                    "imageURL": "https://im.runware.ai/image/img-uuid.webp",
                    "seed": 42,
                    "cost": 0.0038,
                    "NSFWContent": false
                }]}),
            )]
        });
        let image = provider(server.url())
            .generate(&request("rundiffusion:130@100"))
            .unwrap();
        assert_eq!(
            image.image_url.as_deref(),
            Some("https://im.runware.ai/image/img-uuid.webp")
        );
        assert_eq!(image.seed, Some(42));
        assert_eq!(image.cost, Some(0.0038));
        assert_eq!(image.nsfw, Some(false));
        assert_eq!((image.width, image.height), (1024, 1024));
        assert_eq!(image.provider_meta["imageUUID"], json!("img-uuid"));

        let requests = server.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].header("authorization"), Some("Bearer rw-key"));
        let body = requests[0].json();
        let tasks = body.as_array().expect("task array");
        assert_eq!(tasks.len(), 1);
        let task = &tasks[0];
        assert_eq!(task["taskType"], json!("imageInference"));
        assert_eq!(task["positivePrompt"], json!("A cat"));
        assert_eq!(task["model"], json!("rundiffusion:130@100"));
        assert_eq!(task["steps"], json!(35));
        assert_eq!(task["CFGScale"], json!(15.0));
        assert_eq!(task["scheduler"], json!("FlowMatchEulerDiscreteScheduler"));
        assert_eq!(task["outputFormat"], json!("WEBP"));
        assert_eq!(task["outputType"], json!("URL"));
        assert_eq!(task["numberResults"], json!(1));
        assert!(task.get("negativePrompt").is_none());
    }

    #[test]
    fn control_net_models_are_rejected_without_a_request() {
        let server = StubServer::start(|_| Vec::new());
        let err = provider(server.url())
            .generate(&request("runware:20@1"))
            .unwrap_err();
        assert_eq!(err.code, CONTROL_NET_BASE_MODEL_CODE);
        assert!(err.message.contains("ControlNet"));
        assert!(!err.retryable);
        assert!(server.requests().is_empty());
    }

    #[test]
    fn gives_up_after_three_server_errors() {
        let server = StubServer::start(|_| {
            (0..3)
                .map(|_| StubResponse::text(503, "upstream unavailable"))
                .collect()
        });
        let err = provider(server.url())
            .generate(&request("rundiffusion:130@100"))
            .unwrap_err();
        assert!(err.message.starts_with("Network error after 3 retries"));
        assert!(err.message.contains("503"));
        assert_eq!(server.requests().len(), 3);
    }

    #[test]
    fn recovers_when_a_retry_succeeds() {
        let server = StubServer::start(|_| {
            vec![
                StubResponse::text(502, "bad gateway"),
                StubResponse::json(200, json!({"data": [{"imageURL": "https://x/y.webp"}]})),
            ]
        });
        let image = provider(server.url())
            .generate(&request("rundiffusion:130@100"))
            .unwrap();
        assert_eq!(image.image_url.as_deref(), Some("https://x/y.webp"));
        assert_eq!(server.requests().len(), 2);
    }

    #[test]
    fn client_errors_are_not_retried() {
        let server = StubServer::start(|_| {
            vec![StubResponse::json(
                400,
                json!({"errors": [{"code": "invalidPositivePrompt", "message": "Prompt too short"}]}),
            )]
        });
        let err = provider(server.url())
            .generate(&request("rundiffusion:130@100"))
            .unwrap_err();
        assert_eq!(err.code, "invalidPositivePrompt");
        assert_eq!(err.message, "Prompt too short");
        assert_eq!(err.status, Some(400));
        assert_eq!(server.requests().len(), 1);
    }

    #[test]
    fn control_net_error_code_gets_friendly_message() {
        let server = StubServer::start(|_| {
            vec![StubResponse::json(
                400,
                json!({"errors": [{"code": CONTROL_NET_BASE_MODEL_CODE, "message": "raw"}]}),
            )]
        });
        let err = provider(server.url())
            .generate(&request("rundiffusion:130@100"))
            .unwrap_err();
        assert_eq!(err.message, CONTROL_NET_MESSAGE);
    }

    #[test]
    fn missing_image_url_is_malformed() {
        let server =
            StubServer::start(|_| vec![StubResponse::json(200, json!({"data": [{"seed": 1}]}))]);
        let err = provider(server.url())
            .generate(&request("rundiffusion:130@100"))
            .unwrap_err();
        assert_eq!(err.code, "malformed_response");
    }

    #[test]
    fn backoff_doubles_per_attempt() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, 0, 1.0), Duration::from_millis(100));
        assert_eq!(backoff_delay(base, 2, 1.0), Duration::from_millis(400));
        let low = backoff_delay(base, 1, 0.8);
        let high = backoff_delay(base, 1, 1.2);
        assert!(low >= Duration::from_millis(159) && low <= Duration::from_millis(161));
        assert!(high >= Duration::from_millis(239) && high <= Duration::from_millis(241));
    }
}
