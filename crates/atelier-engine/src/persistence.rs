//! Prompt lookup and generated-image rows.
//!
//! Both seams are traits so the orchestrator can run against local JSON
//! files or a PostgREST-style backend.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, bail, Context, Result};
use atelier_contracts::prompt::PromptRecord;
use atelier_contracts::records::GeneratedImage;
use reqwest::blocking::{Client as HttpClient, RequestBuilder};
use serde_json::{Map, Value};

use crate::config::RestBackendConfig;
use crate::http::{build_client, truncate_text};

pub trait PromptSource: Send + Sync {
    fn prompt(&self, id: &str) -> Result<Option<PromptRecord>>;
}

/// Row store with column-level partial updates.
pub trait ImageRecordStore: Send + Sync {
    fn name(&self) -> &str;

    fn insert(&self, record: &GeneratedImage) -> Result<()>;

    /// Merges `patch` into the row with `id`; unknown ids are an error.
    fn update(&self, id: &str, patch: &Map<String, Value>) -> Result<()>;

    fn get(&self, id: &str) -> Result<Option<GeneratedImage>>;
}

/// Prompts from a JSON file holding either an array of records or an
/// object keyed by id.
pub struct JsonPromptSource {
    path: PathBuf,
}

impl JsonPromptSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Vec<PromptRecord>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        let parsed: Value = serde_json::from_str(&raw)
            .with_context(|| format!("invalid JSON in {}", self.path.display()))?;
        match parsed {
            Value::Array(rows) => rows
                .into_iter()
                .map(|row| serde_json::from_value(row).map_err(Into::into))
                .collect(),
            Value::Object(map) => map
                .into_iter()
                .map(|(id, mut row)| {
                    if let Value::Object(obj) = &mut row {
                        obj.entry("id").or_insert(Value::String(id));
                    }
                    serde_json::from_value(row).map_err(Into::into)
                })
                .collect(),
            other => bail!(
                "{} must hold an array or object, found {}",
                self.path.display(),
                json_kind(&other)
            ),
        }
    }
}

impl PromptSource for JsonPromptSource {
    fn prompt(&self, id: &str) -> Result<Option<PromptRecord>> {
        Ok(self.load()?.into_iter().find(|record| record.id == id))
    }
}

/// Rows kept as a JSON array on disk, rewritten on every change.
pub struct JsonRecordStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonRecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn read_rows(&self) -> Result<Vec<Map<String, Value>>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("failed to read {}", self.path.display()))?;
        if raw.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", self.path.display()))
    }

    fn write_rows(&self, rows: &[Map<String, Value>]) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(rows)?)
            .with_context(|| format!("failed to write {}", self.path.display()))
    }

    pub fn list(&self) -> Result<Vec<GeneratedImage>> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("record store lock poisoned"))?;
        self.read_rows()?
            .into_iter()
            .map(GeneratedImage::from_row)
            .collect()
    }
}

fn row_id(row: &Map<String, Value>) -> Option<&str> {
    row.get("id").and_then(Value::as_str)
}

impl ImageRecordStore for JsonRecordStore {
    fn name(&self) -> &str {
        "json"
    }

    fn insert(&self, record: &GeneratedImage) -> Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("record store lock poisoned"))?;
        let mut rows = self.read_rows()?;
        if rows.iter().any(|row| row_id(row) == Some(record.id.as_str())) {
            bail!("record {} already exists", record.id);
        }
        rows.push(record.to_row()?);
        self.write_rows(&rows)
    }

    fn update(&self, id: &str, patch: &Map<String, Value>) -> Result<()> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("record store lock poisoned"))?;
        let mut rows = self.read_rows()?;
        let row = rows
            .iter_mut()
            .find(|row| row_id(row) == Some(id))
            .ok_or_else(|| anyhow!("record {id} not found"))?;
        for (key, value) in patch {
            row.insert(key.clone(), value.clone());
        }
        self.write_rows(&rows)
    }

    fn get(&self, id: &str) -> Result<Option<GeneratedImage>> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("record store lock poisoned"))?;
        self.read_rows()?
            .into_iter()
            .find(|row| row_id(row) == Some(id))
            .map(GeneratedImage::from_row)
            .transpose()
    }
}

/// PostgREST client shared by the REST prompt source and record store.
struct RestTable {
    base_url: String,
    service_key: String,
    table: String,
    http: HttpClient,
}

impl RestTable {
    fn new(config: &RestBackendConfig, table: &str) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            service_key: config.service_key.clone(),
            table: table.to_string(),
            http: build_client(None),
        }
    }

    fn url(&self) -> String {
        format!("{}/rest/v1/{}", self.base_url, self.table)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
    }

    fn check(&self, action: &str, response: reqwest::blocking::Response) -> Result<String> {
        let status = response.status();
        let body = response.text().unwrap_or_default();
        if !status.is_success() {
            bail!(
                "{} {action} failed ({}): {}",
                self.table,
                status.as_u16(),
                truncate_text(&body, 512)
            );
        }
        Ok(body)
    }

    fn select_by_id(&self, id: &str) -> Result<Option<Map<String, Value>>> {
        let response = self
            .authorized(self.http.get(self.url()))
            .query(&[("id", format!("eq.{id}")), ("select", "*".to_string())])
            .send()
            .with_context(|| format!("{} select request failed", self.table))?;
        let body = self.check("select", response)?;
        let rows: Vec<Map<String, Value>> = serde_json::from_str(&body)
            .with_context(|| format!("{} select returned invalid JSON", self.table))?;
        Ok(rows.into_iter().next())
    }
}

pub struct RestPromptSource {
    table: RestTable,
}

impl RestPromptSource {
    pub fn new(config: &RestBackendConfig) -> Self {
        Self {
            table: RestTable::new(config, &config.prompts_table),
        }
    }
}

impl PromptSource for RestPromptSource {
    fn prompt(&self, id: &str) -> Result<Option<PromptRecord>> {
        self.table
            .select_by_id(id)?
            .map(|row| serde_json::from_value(Value::Object(row)).map_err(Into::into))
            .transpose()
    }
}

pub struct RestRecordStore {
    table: RestTable,
}

impl RestRecordStore {
    pub fn new(config: &RestBackendConfig) -> Self {
        Self {
            table: RestTable::new(config, &config.images_table),
        }
    }
}

impl ImageRecordStore for RestRecordStore {
    fn name(&self) -> &str {
        "rest"
    }

    fn insert(&self, record: &GeneratedImage) -> Result<()> {
        let response = self
            .table
            .authorized(self.table.http.post(self.table.url()))
            .header("Prefer", "resolution=merge-duplicates,return=minimal")
            .json(&record.to_row()?)
            .send()
            .context("record insert request failed")?;
        self.table.check("insert", response).map(|_| ())
    }

    fn update(&self, id: &str, patch: &Map<String, Value>) -> Result<()> {
        let response = self
            .table
            .authorized(self.table.http.patch(self.table.url()))
            .query(&[("id", format!("eq.{id}")), ("select", "id".to_string())])
            .header("Prefer", "return=representation")
            .json(patch)
            .send()
            .context("record update request failed")?;
        let body = self.table.check("update", response)?;
        let touched: Vec<Value> = serde_json::from_str(&body)
            .with_context(|| format!("{} update returned invalid JSON", self.table.table))?;
        if touched.is_empty() {
            bail!("record {id} not found");
        }
        Ok(())
    }

    fn get(&self, id: &str) -> Result<Option<GeneratedImage>> {
        self.table
            .select_by_id(id)?
            .map(GeneratedImage::from_row)
            .transpose()
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
