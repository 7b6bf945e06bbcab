use std::path::{Path, PathBuf};

use super::{read_json, write_json, BestEffortSink};
use crate::records::GeneratedImage;

pub const RECENT_IMAGES_LIMIT: usize = 50;

/// Offline mirror of the most recently finalized images, newest first.
#[derive(Debug, Clone)]
pub struct RecentImages {
    path: PathBuf,
    limit: usize,
}

impl RecentImages {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            limit: RECENT_IMAGES_LIMIT,
        }
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Vec<GeneratedImage> {
        read_json(&self.path).unwrap_or_default()
    }
}

impl BestEffortSink<GeneratedImage> for RecentImages {
    fn name(&self) -> &str {
        "recent_images"
    }

    fn persist(&self, image: &GeneratedImage) -> anyhow::Result<()> {
        let mut images = self.load();
        images.retain(|existing| existing.id != image.id);
        images.insert(0, image.clone());
        images.truncate(self.limit);
        write_json(&self.path, &images)
    }
}
