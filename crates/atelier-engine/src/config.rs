//! Explicit configuration built once at startup and handed to adapters.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use atelier_contracts::queue::DEFAULT_CONCURRENCY;

pub const RUNWARE_API_BASE: &str = "https://api.runware.ai/v1";
pub const RUNWARE_MAX_ATTEMPTS: u32 = 3;
pub const RUNWARE_BASE_DELAY: Duration = Duration::from_millis(1000);

pub const FAL_QUEUE_BASE: &str = "https://queue.fal.run";
pub const FAL_SYNC_BASE: &str = "https://fal.run";
pub const FAL_TIMEOUT: Duration = Duration::from_secs(180);
pub const FAL_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub const REVE_API_BASE: &str = "https://api.reve.com";
pub const REVE_API_PATH: &str = "/v1/image/create";
pub const REVE_ACCEPT: &str = "application/json";
pub const REVE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct RunwareConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RunwareConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: RUNWARE_API_BASE.to_string(),
            max_attempts: RUNWARE_MAX_ATTEMPTS,
            base_delay: RUNWARE_BASE_DELAY,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FalMode {
    /// Submit to the queue endpoint and poll until completed.
    Queue,
    /// Block on the synchronous run endpoint.
    Sync,
}

#[derive(Debug, Clone)]
pub struct FalConfig {
    pub api_key: Option<String>,
    pub mode: FalMode,
    pub queue_base: String,
    pub sync_base: String,
    pub timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for FalConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            mode: FalMode::Queue,
            queue_base: FAL_QUEUE_BASE.to_string(),
            sync_base: FAL_SYNC_BASE.to_string(),
            timeout: FAL_TIMEOUT,
            poll_interval: FAL_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReveConfig {
    pub api_key: Option<String>,
    pub api_base: String,
    pub api_path: String,
    pub accept: String,
    pub timeout: Duration,
}

impl Default for ReveConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_base: REVE_API_BASE.to_string(),
            api_path: REVE_API_PATH.to_string(),
            accept: REVE_ACCEPT.to_string(),
            timeout: REVE_TIMEOUT,
        }
    }
}

impl ReveConfig {
    pub fn endpoint(&self) -> String {
        format!(
            "{}/{}",
            self.api_base.trim_end_matches('/'),
            self.api_path.trim_start_matches('/')
        )
    }

    pub fn expects_json(&self) -> bool {
        self.accept.to_ascii_lowercase().contains("json")
    }
}

/// Row store and object storage served by a Supabase-style REST backend.
#[derive(Debug, Clone)]
pub struct RestBackendConfig {
    pub base_url: String,
    pub service_key: String,
    pub bucket: String,
    pub images_table: String,
    pub prompts_table: String,
}

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub runware: RunwareConfig,
    pub fal: FalConfig,
    pub reve: ReveConfig,
    pub concurrency: usize,
    pub data_dir: PathBuf,
    pub storage_dir: PathBuf,
    pub storage_public_base: Option<String>,
    pub rest: Option<RestBackendConfig>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from(".atelier");
        Self {
            runware: RunwareConfig::default(),
            fal: FalConfig::default(),
            reve: ReveConfig::default(),
            concurrency: DEFAULT_CONCURRENCY,
            storage_dir: data_dir.join("storage"),
            data_dir,
            storage_public_base: None,
            rest: None,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key/value source; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |key: &str| {
            lookup(key)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let secs = |key: &str, default: Duration| {
            let Some(raw) = get(key) else {
                return default;
            };
            let parsed = raw
                .parse::<f64>()
                .ok()
                .filter(|value| *value > 0.0)
                .and_then(|value| Duration::try_from_secs_f64(value).ok());
            parsed.unwrap_or_else(|| {
                tracing::warn!(key, value = %raw, "invalid timeout ignored; using default");
                default
            })
        };

        let mut config = Self::default();

        config.runware.api_key = get("RUNWARE_API_KEY");
        if let Some(base) = get("RUNWARE_API_BASE") {
            config.runware.api_base = base.trim_end_matches('/').to_string();
        }

        config.fal.api_key = get("FAL_KEY").or_else(|| get("FAL_API_KEY"));
        if let Some(mode) = get("FAL_MODE") {
            config.fal.mode = if mode.eq_ignore_ascii_case("sync") {
                FalMode::Sync
            } else {
                FalMode::Queue
            };
        }
        config.fal.timeout = secs("FAL_TIMEOUT_SECS", FAL_TIMEOUT);

        config.reve.api_key = get("REVE_API_KEY");
        if let Some(base) = get("REVE_API_BASE") {
            config.reve.api_base = base.trim_end_matches('/').to_string();
        }
        if let Some(path) = get("REVE_API_PATH") {
            config.reve.api_path = path;
        }
        if let Some(accept) = get("REVE_ACCEPT") {
            config.reve.accept = accept;
        }
        config.reve.timeout = secs("REVE_TIMEOUT_SECS", REVE_TIMEOUT);

        if let Some(concurrency) = get("GENERATION_CONCURRENCY")
            .and_then(|value| value.parse::<usize>().ok())
            .filter(|value| *value > 0)
        {
            config.concurrency = concurrency;
        }

        if let Some(dir) = get("ATELIER_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
            config.storage_dir = config.data_dir.join("storage");
        }
        if let Some(dir) = get("STORAGE_DIR") {
            config.storage_dir = PathBuf::from(dir);
        }
        config.storage_public_base =
            get("STORAGE_PUBLIC_BASE").map(|value| value.trim_end_matches('/').to_string());

        if let (Some(base_url), Some(service_key)) =
            (get("SUPABASE_URL"), get("SUPABASE_SERVICE_KEY"))
        {
            config.rest = Some(RestBackendConfig {
                base_url: base_url.trim_end_matches('/').to_string(),
                service_key,
                bucket: get("SUPABASE_BUCKET").unwrap_or_else(|| "images".to_string()),
                images_table: get("SUPABASE_IMAGES_TABLE")
                    .unwrap_or_else(|| "generated_images".to_string()),
                prompts_table: get("SUPABASE_PROMPTS_TABLE")
                    .unwrap_or_else(|| "prompts".to_string()),
            });
        }

        config
    }

    pub fn queue_path(&self) -> PathBuf {
        self.data_dir.join("queue.json")
    }

    pub fn recent_images_path(&self) -> PathBuf {
        self.data_dir.join("recent_images.json")
    }

    pub fn prompts_path(&self) -> PathBuf {
        self.data_dir.join("prompts.json")
    }

    pub fn records_path(&self) -> PathBuf {
        self.data_dir.join("generated_images.json")
    }

    pub fn events_path(&self) -> PathBuf {
        self.data_dir.join("events.jsonl")
    }
}
