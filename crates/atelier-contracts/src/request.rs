use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::models::DEFAULT_BASE_MODEL;

pub const DEFAULT_WIDTH: u32 = 1024;
pub const DEFAULT_HEIGHT: u32 = 1024;
pub const DEFAULT_STEPS: u32 = 35;
pub const DEFAULT_CFG_SCALE: f64 = 15.0;
pub const DEFAULT_SCHEDULER: &str = "FlowMatchEulerDiscreteScheduler";

/// Ratios providers understand by name, with the tolerance used to snap to them.
const NAMED_RATIOS: &[(u32, u32)] = &[
    (1, 1),
    (4, 3),
    (3, 4),
    (3, 2),
    (2, 3),
    (16, 9),
    (9, 16),
    (5, 4),
    (4, 5),
    (21, 9),
    (9, 21),
];
const RATIO_TOLERANCE: f64 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Webp,
    Png,
    Jpg,
}

impl OutputFormat {
    /// Upper-case form used in provider payloads and persisted records.
    pub fn as_provider_str(self) -> &'static str {
        match self {
            OutputFormat::Webp => "WEBP",
            OutputFormat::Png => "PNG",
            OutputFormat::Jpg => "JPG",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Webp => "webp",
            OutputFormat::Png => "png",
            OutputFormat::Jpg => "jpg",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            OutputFormat::Webp => "image/webp",
            OutputFormat::Png => "image/png",
            OutputFormat::Jpg => "image/jpeg",
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "webp" => Ok(OutputFormat::Webp),
            "png" => Ok(OutputFormat::Png),
            "jpg" | "jpeg" => Ok(OutputFormat::Jpg),
            other => Err(format!("unsupported output format '{other}'")),
        }
    }
}

/// Caller-supplied overrides; anything left `None` takes the pipeline default.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct GenerationOptions {
    pub model: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub steps: Option<u32>,
    pub cfg_scale: Option<f64>,
    pub seed: Option<i64>,
    pub scheduler: Option<String>,
    pub output_format: Option<OutputFormat>,
}

/// Fully resolved parameters for one provider invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt_id: String,
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub model: String,
    pub steps: u32,
    pub cfg_scale: f64,
    pub width: u32,
    pub height: u32,
    pub seed: Option<i64>,
    pub scheduler: String,
    pub output_format: OutputFormat,
}

impl GenerationRequest {
    pub fn new(prompt_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            prompt_id: prompt_id.into(),
            prompt: prompt.into(),
            negative_prompt: None,
            model: DEFAULT_BASE_MODEL.to_string(),
            steps: DEFAULT_STEPS,
            cfg_scale: DEFAULT_CFG_SCALE,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
            seed: None,
            scheduler: DEFAULT_SCHEDULER.to_string(),
            output_format: OutputFormat::default(),
        }
    }

    /// Applies overrides except `model`, which goes through model selection.
    pub fn with_options(mut self, options: &GenerationOptions) -> Self {
        if let Some(width) = options.width.filter(|value| *value > 0) {
            self.width = width;
        }
        if let Some(height) = options.height.filter(|value| *value > 0) {
            self.height = height;
        }
        if let Some(steps) = options.steps.filter(|value| *value > 0) {
            self.steps = steps;
        }
        if let Some(cfg_scale) = options.cfg_scale.filter(|value| value.is_finite()) {
            self.cfg_scale = cfg_scale;
        }
        if let Some(scheduler) = options
            .scheduler
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
        {
            self.scheduler = scheduler.to_string();
        }
        if options.seed.is_some() {
            self.seed = options.seed;
        }
        if let Some(format) = options.output_format {
            self.output_format = format;
        }
        self
    }

    pub fn aspect_ratio(&self) -> String {
        aspect_ratio_label(self.width, self.height)
    }
}

pub fn gcd(a: u32, b: u32) -> u32 {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

/// `width:height` reduced by their GCD, snapped to a named ratio when the
/// quotient lands within ±0.01 of one (so 1.33 reads as "4:3").
pub fn aspect_ratio_label(width: u32, height: u32) -> String {
    if width == 0 || height == 0 {
        return "1:1".to_string();
    }
    let ratio = width as f64 / height as f64;
    if let Some((w, h)) = NAMED_RATIOS
        .iter()
        .copied()
        .find(|(w, h)| (ratio - *w as f64 / *h as f64).abs() <= RATIO_TOLERANCE)
    {
        return format!("{w}:{h}");
    }
    let divisor = gcd(width, height);
    format!("{}:{}", width / divisor, height / divisor)
}

/// Closest ratio out of `supported`, for providers that only accept named ratios.
pub fn nearest_supported_ratio<'a>(width: u32, height: u32, supported: &[&'a str]) -> &'a str {
    let target = if height == 0 {
        1.0
    } else {
        width as f64 / height as f64
    };
    supported
        .iter()
        .copied()
        .filter_map(|label| parse_ratio(label).map(|value| (label, value)))
        .min_by(|(_, a), (_, b)| {
            (a - target)
                .abs()
                .partial_cmp(&(b - target).abs())
                .unwrap_or(std::cmp::Ordering::Equal)
        })
        .map(|(label, _)| label)
        .unwrap_or("1:1")
}

fn parse_ratio(label: &str) -> Option<f64> {
    let (w, h) = label.split_once(':')?;
    let w = w.trim().parse::<f64>().ok()?;
    let h = h.trim().parse::<f64>().ok()?;
    if h <= 0.0 {
        return None;
    }
    Some(w / h)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_pipeline_contract() {
        let request = GenerationRequest::new("p-1", "A cat");
        assert_eq!(request.model, "rundiffusion:130@100");
        assert_eq!(request.width, 1024);
        assert_eq!(request.height, 1024);
        assert_eq!(request.steps, 35);
        assert_eq!(request.cfg_scale, 15.0);
        assert_eq!(request.scheduler, "FlowMatchEulerDiscreteScheduler");
        assert_eq!(request.output_format.as_provider_str(), "WEBP");
    }

    #[test]
    fn options_override_defaults() {
        let options = GenerationOptions {
            width: Some(1024),
            height: Some(768),
            steps: Some(0),
            output_format: Some(OutputFormat::Png),
            ..GenerationOptions::default()
        };
        let request = GenerationRequest::new("p-1", "A cat").with_options(&options);
        assert_eq!((request.width, request.height), (1024, 768));
        assert_eq!(request.steps, DEFAULT_STEPS);
        assert_eq!(request.output_format, OutputFormat::Png);
        assert_eq!(request.aspect_ratio(), "4:3");
    }

    #[test]
    fn aspect_ratio_reduces_and_snaps() {
        assert_eq!(aspect_ratio_label(1024, 768), "4:3");
        assert_eq!(aspect_ratio_label(1024, 1024), "1:1");
        assert_eq!(aspect_ratio_label(1920, 1080), "16:9");
        assert_eq!(aspect_ratio_label(1000, 750), "4:3");
        assert_eq!(aspect_ratio_label(1331, 1000), "4:3");
        assert_eq!(aspect_ratio_label(500, 300), "5:3");
        assert_eq!(aspect_ratio_label(700, 300), "21:9");
        assert_eq!(aspect_ratio_label(0, 300), "1:1");
    }

    #[test]
    fn nearest_ratio_picks_closest_label() {
        let supported = ["1:1", "16:9", "9:16", "4:3", "3:4"];
        assert_eq!(nearest_supported_ratio(1024, 768, &supported), "4:3");
        assert_eq!(nearest_supported_ratio(1200, 640, &supported), "16:9");
        assert_eq!(nearest_supported_ratio(512, 512, &supported), "1:1");
    }

    #[test]
    fn output_format_parses_aliases() {
        assert_eq!("JPEG".parse::<OutputFormat>(), Ok(OutputFormat::Jpg));
        assert_eq!(" webp ".parse::<OutputFormat>(), Ok(OutputFormat::Webp));
        assert!("avif".parse::<OutputFormat>().is_err());
    }
}
