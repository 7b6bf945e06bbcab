//! Object storage for the original image and its variants.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client as HttpClient;
use reqwest::header::CONTENT_TYPE;

use crate::config::RestBackendConfig;
use crate::http::{build_client, extension_for_mime, truncate_text};
use crate::variants::{EncodedImage, VariantBundle};

pub trait ObjectStorage: Send + Sync {
    fn name(&self) -> &str;

    /// Stores `bytes` at `path` (overwriting) and returns its public URL.
    fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<String>;
}

/// Writes objects under a directory; URLs use `public_base` when set and
/// `file://` paths otherwise.
pub struct LocalObjectStorage {
    root: PathBuf,
    public_base: Option<String>,
}

impl LocalObjectStorage {
    pub fn new(root: impl Into<PathBuf>, public_base: Option<String>) -> Self {
        Self {
            root: root.into(),
            public_base: public_base.map(|base| base.trim_end_matches('/').to_string()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ObjectStorage for LocalObjectStorage {
    fn name(&self) -> &str {
        "local"
    }

    fn put(&self, path: &str, bytes: &[u8], _content_type: &str) -> Result<String> {
        let relative = path.trim_start_matches('/');
        if relative.split('/').any(|part| part == "..") {
            bail!("refusing to write outside storage root: {path}");
        }
        let target = self.root.join(relative);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        fs::write(&target, bytes)
            .with_context(|| format!("failed to write {}", target.display()))?;
        Ok(match &self.public_base {
            Some(base) => format!("{base}/{relative}"),
            None => {
                let absolute = fs::canonicalize(&target).unwrap_or(target);
                format!("file://{}", absolute.display())
            }
        })
    }
}

/// Supabase-style storage bucket over HTTP.
pub struct RestObjectStorage {
    base_url: String,
    service_key: String,
    bucket: String,
    http: HttpClient,
}

impl RestObjectStorage {
    pub fn new(config: &RestBackendConfig) -> Self {
        Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            service_key: config.service_key.clone(),
            bucket: config.bucket.clone(),
            http: build_client(None),
        }
    }

    pub fn public_url(&self, path: &str) -> String {
        format!(
            "{}/storage/v1/object/public/{}/{}",
            self.base_url,
            self.bucket,
            path.trim_start_matches('/')
        )
    }
}

impl ObjectStorage for RestObjectStorage {
    fn name(&self) -> &str {
        "rest"
    }

    fn put(&self, path: &str, bytes: &[u8], content_type: &str) -> Result<String> {
        let path = path.trim_start_matches('/');
        let url = format!(
            "{}/storage/v1/object/{}/{path}",
            self.base_url, self.bucket
        );
        let response = self
            .http
            .post(&url)
            .bearer_auth(&self.service_key)
            .header("apikey", &self.service_key)
            .header("x-upsert", "true")
            .header(CONTENT_TYPE, content_type)
            .body(bytes.to_vec())
            .send()
            .with_context(|| format!("storage upload failed ({url})"))?;
        if !response.status().is_success() {
            let code = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            bail!(
                "storage upload failed ({code}): {}",
                truncate_text(&body, 512)
            );
        }
        Ok(self.public_url(path))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedVariants {
    pub original_url: String,
    pub desktop_url: String,
    pub mobile_url: String,
    pub thumbnail_url: String,
}

/// `<category>/<record_id>.<ext>`
pub fn object_path(category: &str, record_id: &str, mime_type: &str) -> String {
    format!("{category}/{record_id}.{}", extension_for_mime(mime_type))
}

/// Uploads all four renditions concurrently; any single failure fails the bundle.
pub fn upload_bundle(
    storage: &dyn ObjectStorage,
    record_id: &str,
    bundle: &VariantBundle,
) -> Result<UploadedVariants> {
    let upload = |category: &str, image: &EncodedImage| -> Result<String> {
        let path = object_path(category, record_id, &image.mime_type);
        let url = storage
            .put(&path, &image.bytes, &image.mime_type)
            .with_context(|| format!("failed to upload {category} image"))?;
        tracing::debug!(storage = storage.name(), %path, bytes = image.bytes.len(), "uploaded image");
        Ok(url)
    };

    let (original, desktop, mobile, thumbnail) = thread::scope(|scope| {
        let original = scope.spawn(|| upload("original", &bundle.original));
        let desktop = scope.spawn(|| upload("desktop", &bundle.desktop));
        let mobile = scope.spawn(|| upload("mobile", &bundle.mobile));
        let thumbnail = scope.spawn(|| upload("thumbnail", &bundle.thumbnail));
        (
            joined(original.join()),
            joined(desktop.join()),
            joined(mobile.join()),
            joined(thumbnail.join()),
        )
    });

    Ok(UploadedVariants {
        original_url: original?,
        desktop_url: desktop?,
        mobile_url: mobile?,
        thumbnail_url: thumbnail?,
    })
}

fn joined(result: thread::Result<Result<String>>) -> Result<String> {
    result.unwrap_or_else(|_| Err(anyhow::anyhow!("upload thread panicked")))
}
