use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use serde_json::Value;

use crate::error::ProviderError;

pub(crate) fn build_client(timeout: Option<Duration>) -> HttpClient {
    let mut builder = HttpClient::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().unwrap_or_else(|err| {
        tracing::warn!(error = %err, "falling back to default HTTP client");
        HttpClient::new()
    })
}

pub(crate) fn is_retryable_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

/// Reads a JSON body, turning non-2xx statuses and undecodable bodies into
/// provider errors.
pub(crate) fn response_json_or_error(
    provider: &str,
    response: HttpResponse,
) -> Result<Value, ProviderError> {
    let status = response.status();
    let code = status.as_u16();
    let body = response.text().map_err(|err| {
        ProviderError::retryable(
            "body_read_failed",
            format!("{provider} response body read failed: {err}"),
        )
    })?;
    if !status.is_success() {
        return Err(ProviderError::from_status(
            code,
            format!("http_{code}"),
            format!(
                "{provider} request failed ({code}): {}",
                truncate_text(&body, 512)
            ),
        ));
    }
    serde_json::from_str(&body).map_err(|_| {
        ProviderError::malformed(format!("{provider} returned invalid JSON payload"))
    })
}

pub(crate) fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

/// Strips an optional `data:<mime>;base64,` prefix and decodes the payload.
pub(crate) fn decode_base64_payload(raw: &str) -> Result<(Vec<u8>, Option<String>), String> {
    let raw = raw.trim();
    let (mime, payload) = match raw.strip_prefix("data:") {
        Some(rest) => {
            let (header, payload) = rest
                .split_once(',')
                .ok_or_else(|| "data URL is missing its payload".to_string())?;
            let mime = header.split(';').next().map(str::to_string);
            (mime.filter(|value| !value.is_empty()), payload)
        }
        None => (None, raw),
    };
    let bytes = BASE64
        .decode(payload.trim())
        .map_err(|err| format!("invalid base64 image payload: {err}"))?;
    Ok((bytes, mime))
}

pub(crate) fn data_url(mime: &str, bytes: &[u8]) -> String {
    format!("data:{mime};base64,{}", BASE64.encode(bytes))
}

pub(crate) fn guess_mime(bytes: &[u8]) -> &'static str {
    match image::guess_format(bytes) {
        Ok(image::ImageFormat::Png) => "image/png",
        Ok(image::ImageFormat::Jpeg) => "image/jpeg",
        Ok(image::ImageFormat::WebP) => "image/webp",
        Ok(image::ImageFormat::Gif) => "image/gif",
        _ => "application/octet-stream",
    }
}

pub(crate) fn extension_for_mime(mime: &str) -> &'static str {
    let lowered = mime.to_ascii_lowercase();
    if lowered.contains("jpeg") || lowered.contains("jpg") {
        return "jpg";
    }
    if lowered.contains("webp") {
        return "webp";
    }
    if lowered.contains("gif") {
        return "gif";
    }
    if lowered.contains("png") {
        return "png";
    }
    "bin"
}
