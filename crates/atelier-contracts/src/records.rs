use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::prompt::PromptRecord;
use crate::request::GenerationRequest;

/// Persisted artifact of one orchestration run.
///
/// `ready` stays `false` from the orchestration path; flipping it is left to
/// a separate approval step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedImage {
    pub id: String,
    pub prompt_id: String,
    pub prompt: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    pub model: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub cfg_scale: f64,
    #[serde(default)]
    pub seed: Option<i64>,
    pub scheduler: String,
    pub aspect_ratio: String,
    pub output_format: String,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub desktop_url: Option<String>,
    #[serde(default)]
    pub mobile_url: Option<String>,
    #[serde(default)]
    pub thumbnail_url: Option<String>,
    #[serde(default)]
    pub original_size_kb: Option<f64>,
    #[serde(default)]
    pub desktop_size_kb: Option<f64>,
    #[serde(default)]
    pub mobile_size_kb: Option<f64>,
    #[serde(default)]
    pub thumbnail_size_kb: Option<f64>,
    #[serde(default)]
    pub cost: Option<f64>,
    #[serde(default)]
    pub ready: bool,
    #[serde(default)]
    pub mature_content: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Provider side-channel and legacy fields that have no column of their own.
    #[serde(default)]
    pub extended_metadata: Map<String, Value>,
}

impl GeneratedImage {
    /// Row written before the provider is called so progress is observable.
    pub fn provisional(
        id: impl Into<String>,
        request: &GenerationRequest,
        prompt: &PromptRecord,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            prompt_id: request.prompt_id.clone(),
            prompt: request.prompt.clone(),
            title: prompt.title.clone(),
            description: prompt.description.clone(),
            model: request.model.clone(),
            width: request.width,
            height: request.height,
            steps: request.steps,
            cfg_scale: request.cfg_scale,
            seed: request.seed,
            scheduler: request.scheduler.clone(),
            aspect_ratio: request.aspect_ratio(),
            output_format: request.output_format.as_provider_str().to_string(),
            image_url: None,
            desktop_url: None,
            mobile_url: None,
            thumbnail_url: None,
            original_size_kb: None,
            desktop_size_kb: None,
            mobile_size_kb: None,
            thumbnail_size_kb: None,
            cost: None,
            ready: false,
            mature_content: false,
            created_at: now,
            updated_at: now,
            extended_metadata: Map::new(),
        }
    }

    pub fn to_row(&self) -> anyhow::Result<Map<String, Value>> {
        match serde_json::to_value(self)? {
            Value::Object(row) => Ok(row),
            other => anyhow::bail!("generated image serialized to non-object: {other}"),
        }
    }

    pub fn from_row(row: Map<String, Value>) -> anyhow::Result<Self> {
        Ok(serde_json::from_value(Value::Object(row))?)
    }

    /// Columns touched by the single final update.
    pub fn final_patch(&self) -> anyhow::Result<Map<String, Value>> {
        const FINAL_COLUMNS: &[&str] = &[
            "model",
            "width",
            "height",
            "seed",
            "aspect_ratio",
            "image_url",
            "desktop_url",
            "mobile_url",
            "thumbnail_url",
            "original_size_kb",
            "desktop_size_kb",
            "mobile_size_kb",
            "thumbnail_size_kb",
            "cost",
            "ready",
            "mature_content",
            "updated_at",
            "extended_metadata",
        ];
        let row = self.to_row()?;
        Ok(row
            .into_iter()
            .filter(|(key, _)| FINAL_COLUMNS.contains(&key.as_str()))
            .collect())
    }
}

/// Kilobytes rounded to two decimals.
pub fn size_kb(bytes: usize) -> f64 {
    (bytes as f64 / 1024.0 * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn request() -> GenerationRequest {
        let mut request = GenerationRequest::new("p-7", "A lighthouse");
        request.width = 1024;
        request.height = 768;
        request
    }

    #[test]
    fn provisional_record_is_not_ready() {
        let prompt = PromptRecord {
            id: "p-7".to_string(),
            prompt: "A lighthouse".to_string(),
            title: Some("Lighthouse".to_string()),
            ..PromptRecord::default()
        };
        let record = GeneratedImage::provisional("img-1", &request(), &prompt);
        assert!(!record.ready);
        assert_eq!(record.aspect_ratio, "4:3");
        assert_eq!(record.output_format, "WEBP");
        assert_eq!(record.title.as_deref(), Some("Lighthouse"));
        assert!(record.image_url.is_none());
    }

    #[test]
    fn final_patch_only_carries_final_columns() -> anyhow::Result<()> {
        let mut record =
            GeneratedImage::provisional("img-1", &request(), &PromptRecord::default());
        record.image_url = Some("https://cdn.example/original/img-1.png".to_string());
        record
            .extended_metadata
            .insert("provider".to_string(), json!("runware"));
        let patch = record.final_patch()?;
        assert!(patch.contains_key("image_url"));
        assert!(patch.contains_key("ready"));
        assert!(!patch.contains_key("prompt"));
        assert!(!patch.contains_key("created_at"));
        assert_eq!(patch["extended_metadata"]["provider"], json!("runware"));
        Ok(())
    }

    #[test]
    fn row_round_trips_through_map() -> anyhow::Result<()> {
        let record = GeneratedImage::provisional("img-2", &request(), &PromptRecord::default());
        let row = record.to_row()?;
        assert_eq!(GeneratedImage::from_row(row)?, record);
        Ok(())
    }

    #[test]
    fn size_kb_rounds_to_two_decimals() {
        assert_eq!(size_kb(2048), 2.0);
        assert_eq!(size_kb(1536), 1.5);
        assert_eq!(size_kb(1000), 0.98);
        assert_eq!(size_kb(0), 0.0);
    }
}
