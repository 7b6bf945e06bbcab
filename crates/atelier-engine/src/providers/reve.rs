use atelier_contracts::models::{reve_version, ModelFamily};
use atelier_contracts::request::{nearest_supported_ratio, GenerationRequest};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE};
use serde_json::{json, Map, Value};

use super::{ImageProvider, ProviderImage};
use crate::config::ReveConfig;
use crate::error::ProviderError;
use crate::http::{build_client, is_retryable_transport_error, truncate_text};

const REVE_RATIOS: &[&str] = &["16:9", "9:16", "3:2", "2:3", "4:3", "3:4", "1:1"];

pub struct ReveProvider {
    config: ReveConfig,
    http: HttpClient,
}

impl ReveProvider {
    pub fn new(config: ReveConfig) -> Self {
        let http = build_client(Some(config.timeout));
        Self { config, http }
    }

    fn build_payload(request: &GenerationRequest, version: &str) -> Value {
        json!({
            "prompt": request.prompt,
            "aspect_ratio": nearest_supported_ratio(request.width, request.height, REVE_RATIOS),
            "version": version,
        })
    }

    fn error_from_response(response: HttpResponse) -> ProviderError {
        let status = response.status();
        let header_code = header_str(response.headers(), "x-reve-error-code");
        let body = response.text().unwrap_or_default();
        let body_message = serde_json::from_str::<Value>(&body).ok().and_then(|value| {
            ["message", "error", "detail"]
                .iter()
                .find_map(|key| value.get(*key).and_then(Value::as_str).map(str::to_string))
        });
        let message = body_message
            .or_else(|| {
                let trimmed = body.trim();
                (!trimmed.is_empty()).then(|| truncate_text(trimmed, 256))
            })
            .or_else(|| status.canonical_reason().map(str::to_string))
            .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));
        let code = header_code.unwrap_or_else(|| format!("http_{}", status.as_u16()));
        ProviderError::from_status(
            status.as_u16(),
            code.clone(),
            format!("REVE request failed ({code}): {message}"),
        )
    }

    fn read_json(
        response: HttpResponse,
        request: &GenerationRequest,
    ) -> Result<ProviderImage, ProviderError> {
        let payload: Value = response
            .json()
            .map_err(|_| ProviderError::malformed("REVE returned invalid JSON payload"))?;
        let image = payload
            .get("image")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ProviderError::malformed("REVE response contained no image"))?;

        let mut meta = Map::new();
        for key in [
            "version",
            "request_id",
            "credits_used",
            "credits_remaining",
            "content_violation",
        ] {
            if let Some(value) = payload.get(key).filter(|value| !value.is_null()) {
                meta.insert(key.to_string(), value.clone());
            }
        }
        Ok(ProviderImage {
            image_url: None,
            image_base64: Some(image.to_string()),
            mime_type: None,
            width: request.width,
            height: request.height,
            seed: request.seed,
            cost: payload.get("credits_used").and_then(Value::as_f64),
            nsfw: payload.get("content_violation").and_then(Value::as_bool),
            provider_meta: meta,
        })
    }

    fn read_binary(
        response: HttpResponse,
        request: &GenerationRequest,
    ) -> Result<ProviderImage, ProviderError> {
        let headers = response.headers().clone();
        let bytes = response.bytes().map_err(|err| {
            ProviderError::retryable(
                "body_read_failed",
                format!("REVE response body read failed: {err}"),
            )
        })?;
        if bytes.is_empty() {
            return Err(ProviderError::malformed("REVE returned an empty image body"));
        }

        let mut meta = Map::new();
        let mut header_meta = |header: &str, key: &str, numeric: bool| {
            let Some(raw) = header_str(&headers, header) else {
                return;
            };
            let value = if numeric {
                raw.parse::<f64>().map(Value::from).unwrap_or(Value::String(raw))
            } else if header == "x-reve-content-violation" {
                Value::Bool(raw.eq_ignore_ascii_case("true"))
            } else {
                Value::String(raw)
            };
            meta.insert(key.to_string(), value);
        };
        header_meta("x-reve-version", "version", false);
        header_meta("x-reve-request-id", "request_id", false);
        header_meta("x-reve-credits-used", "credits_used", true);
        header_meta("x-reve-credits-remaining", "credits_remaining", true);
        header_meta("x-reve-content-violation", "content_violation", false);

        Ok(ProviderImage {
            image_url: None,
            image_base64: Some(BASE64.encode(&bytes)),
            mime_type: header_str(&headers, CONTENT_TYPE.as_str()),
            width: request.width,
            height: request.height,
            seed: request.seed,
            cost: meta.get("credits_used").and_then(Value::as_f64),
            nsfw: meta.get("content_violation").and_then(Value::as_bool),
            provider_meta: meta,
        })
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

impl ImageProvider for ReveProvider {
    fn name(&self) -> &str {
        "reve"
    }

    fn family(&self) -> ModelFamily {
        ModelFamily::Reve
    }

    fn check_configuration(&self) -> Result<(), String> {
        match self.config.api_key {
            Some(_) => Ok(()),
            None => Err("REVE_API_KEY not set".to_string()),
        }
    }

    fn generate(&self, request: &GenerationRequest) -> Result<ProviderImage, ProviderError> {
        let Some(api_key) = self.config.api_key.as_deref() else {
            return Err(ProviderError::terminal(
                "missing_api_key",
                "REVE_API_KEY not set",
            ));
        };
        let version = reve_version(&request.model).ok_or_else(|| {
            ProviderError::terminal(
                "invalid_model",
                format!("'{}' is not a REVE model id", request.model),
            )
        })?;

        let endpoint = self.config.endpoint();
        let response = self
            .http
            .post(&endpoint)
            .bearer_auth(api_key)
            .header(ACCEPT, &self.config.accept)
            .json(&Self::build_payload(request, version))
            .send()
            .map_err(|err| {
                if err.is_timeout() {
                    ProviderError::retryable(
                        "timeout",
                        format!(
                            "REVE request timed out after {}s",
                            self.config.timeout.as_secs()
                        ),
                    )
                } else if is_retryable_transport_error(&err) {
                    ProviderError::retryable("network_error", format!("REVE request failed: {err}"))
                } else {
                    ProviderError::terminal("request_failed", format!("REVE request failed: {err}"))
                }
            })?;

        if !response.status().is_success() {
            return Err(Self::error_from_response(response));
        }
        if self.config.expects_json() {
            Self::read_json(response, request)
        } else {
            Self::read_binary(response, request)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::test_support::{png_bytes, StubResponse, StubServer};

    fn config(base: &str, accept: &str) -> ReveConfig {
        ReveConfig {
            api_key: Some("reve-key".to_string()),
            api_base: base.to_string(),
            api_path: "/v1/image/create".to_string(),
            accept: accept.to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    fn request() -> GenerationRequest {
        let mut request = GenerationRequest::new("p-1", "A harbor in fog");
        request.model = "reve:reve-create@20250915".to_string();
        request.width = 1920;
        request.height = 1080;
        request
    }

    #[test]
    fn json_mode_reads_inline_image() {
        let server = StubServer::start(|_| {
            vec![StubResponse::json(
                200,
                json!({
                    "image": "aGVsbG8=",
                    "version": "reve-create@20250915",
                    "content_violation": false,
                    "request_id": "rq-9",
                    "credits_used": 18,
                    "credits_remaining": 982
                }),
            )]
        });
        let image = ReveProvider::new(config(server.url(), "application/json"))
            .generate(&request())
            .unwrap();
        assert_eq!(image.image_base64.as_deref(), Some("aGVsbG8="));
        assert_eq!(image.nsfw, Some(false));
        assert_eq!(image.cost, Some(18.0));
        assert_eq!(image.provider_meta["request_id"], json!("rq-9"));

        let requests = server.requests();
        assert_eq!(requests[0].path, "/v1/image/create");
        assert_eq!(requests[0].header("authorization"), Some("Bearer reve-key"));
        assert_eq!(requests[0].header("accept"), Some("application/json"));
        let body = requests[0].json();
        assert_eq!(body["aspect_ratio"], json!("16:9"));
        assert_eq!(body["version"], json!("reve-create@20250915"));
        assert_eq!(body["prompt"], json!("A harbor in fog"));
    }

    #[test]
    fn binary_mode_encodes_body_and_reads_headers() {
        let png = png_bytes(4, 4);
        let expected = BASE64.encode(&png);
        let server = StubServer::start(move |_| {
            vec![StubResponse::bytes(200, "image/png", png)
                .header("X-Reve-Version", "reve-create@20250915")
                .header("X-Reve-Request-Id", "rq-10")
                .header("X-Reve-Credits-Used", "18")
                .header("X-Reve-Content-Violation", "false")]
        });
        let image = ReveProvider::new(config(server.url(), "image/png"))
            .generate(&request())
            .unwrap();
        assert_eq!(image.image_base64.as_deref(), Some(expected.as_str()));
        assert_eq!(image.mime_type.as_deref(), Some("image/png"));
        assert_eq!(image.provider_meta["version"], json!("reve-create@20250915"));
        assert_eq!(image.cost, Some(18.0));
        assert_eq!(image.nsfw, Some(false));
    }

    #[test]
    fn errors_combine_header_code_and_body_message() {
        let server = StubServer::start(|_| {
            vec![StubResponse::json(400, json!({"message": "prompt rejected"}))
                .header("X-Reve-Error-Code", "PROMPT_REJECTED")]
        });
        let err = ReveProvider::new(config(server.url(), "application/json"))
            .generate(&request())
            .unwrap_err();
        assert_eq!(err.code, "PROMPT_REJECTED");
        assert_eq!(err.status, Some(400));
        assert!(err.message.contains("PROMPT_REJECTED"));
        assert!(err.message.contains("prompt rejected"));
    }

    #[test]
    fn empty_error_body_falls_back_to_status_text() {
        let server = StubServer::start(|_| vec![StubResponse::text(503, "")]);
        let err = ReveProvider::new(config(server.url(), "application/json"))
            .generate(&request())
            .unwrap_err();
        assert_eq!(err.code, "http_503");
        assert!(err.message.contains("Service Unavailable"));
        assert!(err.retryable);
    }

    #[test]
    fn missing_version_is_rejected_before_request() {
        let server = StubServer::start(|_| Vec::new());
        let mut req = request();
        req.model = "reve:".to_string();
        let err = ReveProvider::new(config(server.url(), "application/json"))
            .generate(&req)
            .unwrap_err();
        assert_eq!(err.code, "invalid_model");
        assert!(server.requests().is_empty());
    }
}
