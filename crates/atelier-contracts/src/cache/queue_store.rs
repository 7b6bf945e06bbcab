use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use super::{read_json, write_json, BestEffortSink};
use crate::queue::QueueItem;

#[derive(Debug, Default, Serialize, Deserialize)]
struct QueueSnapshot {
    #[serde(default)]
    items: Vec<QueueItem>,
}

/// JSON file holding queue items across restarts. Concurrency is not stored.
#[derive(Debug, Clone)]
pub struct QueueStore {
    path: PathBuf,
}

impl QueueStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Vec<QueueItem> {
        read_json::<QueueSnapshot>(&self.path)
            .map(|snapshot| snapshot.items)
            .unwrap_or_default()
    }
}

impl BestEffortSink<[QueueItem]> for QueueStore {
    fn name(&self) -> &str {
        "queue_store"
    }

    fn persist(&self, items: &[QueueItem]) -> anyhow::Result<()> {
        write_json(
            &self.path,
            &QueueSnapshot {
                items: items.to_vec(),
            },
        )
    }
}
