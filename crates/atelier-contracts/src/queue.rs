use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cache::{BestEffortSink, QueueStore};

pub const DEFAULT_CONCURRENCY: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueStatus {
    Pending,
    Processing,
    Done,
    Error,
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            QueueStatus::Pending => "pending",
            QueueStatus::Processing => "processing",
            QueueStatus::Done => "done",
            QueueStatus::Error => "error",
        };
        f.write_str(label)
    }
}

/// One prompt waiting for (or done with) generation. `id` is the prompt id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueItem {
    pub id: String,
    pub status: QueueStatus,
    #[serde(default)]
    pub error: Option<String>,
}

impl QueueItem {
    pub fn pending(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: QueueStatus::Pending,
            error: None,
        }
    }
}

/// Best-effort list of desired vs. in-flight generations.
///
/// The queue never runs anything itself: a runner pulls [`next_batch`],
/// marks items processing, and reports back through [`set_status`]. The
/// concurrency cap is advisory.
///
/// [`next_batch`]: GenerationQueue::next_batch
/// [`set_status`]: GenerationQueue::set_status
pub struct GenerationQueue {
    items: Vec<QueueItem>,
    concurrency: usize,
    sink: Option<Box<dyn BestEffortSink<[QueueItem]>>>,
}

impl fmt::Debug for GenerationQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GenerationQueue")
            .field("items", &self.items)
            .field("concurrency", &self.concurrency)
            .field("sink", &self.sink.as_ref().map(|sink| sink.name().to_string()))
            .finish()
    }
}

impl GenerationQueue {
    pub fn new(concurrency: usize) -> Self {
        Self {
            items: Vec::new(),
            concurrency,
            sink: None,
        }
    }

    /// Reloads items from `store`. Items caught mid-flight by a restart go
    /// back to pending since nothing is working on them anymore.
    pub fn restore(concurrency: usize, store: QueueStore) -> Self {
        let items = store
            .load()
            .into_iter()
            .map(|mut item| {
                if item.status == QueueStatus::Processing {
                    item.status = QueueStatus::Pending;
                }
                item
            })
            .collect();
        Self {
            items,
            concurrency,
            sink: Some(Box::new(store)),
        }
    }

    pub fn with_sink(mut self, sink: Box<dyn BestEffortSink<[QueueItem]>>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn set_concurrency(&mut self, concurrency: usize) {
        self.concurrency = concurrency;
    }

    pub fn items(&self) -> &[QueueItem] {
        &self.items
    }

    pub fn get(&self, id: &str) -> Option<&QueueItem> {
        self.items.iter().find(|item| item.id == id)
    }

    /// Adds pending items; ids already present (in any state) are ignored.
    /// Returns how many were added.
    pub fn enqueue<I, S>(&mut self, ids: I) -> usize
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut added = 0;
        for id in ids {
            let id = id.as_ref().trim();
            if id.is_empty() || self.items.iter().any(|item| item.id == id) {
                continue;
            }
            self.items.push(QueueItem::pending(id));
            added += 1;
        }
        if added > 0 {
            self.sync();
        }
        added
    }

    pub fn remove(&mut self, id: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|item| item.id != id);
        let removed = self.items.len() != before;
        if removed {
            self.sync();
        }
        removed
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.sync();
    }

    pub fn set_status(&mut self, id: &str, status: QueueStatus, error: Option<String>) -> bool {
        let Some(item) = self.items.iter_mut().find(|item| item.id == id) else {
            return false;
        };
        item.status = status;
        item.error = error;
        self.sync();
        true
    }

    pub fn pending(&self) -> Vec<&QueueItem> {
        self.with_status(QueueStatus::Pending)
    }

    pub fn processing(&self) -> Vec<&QueueItem> {
        self.with_status(QueueStatus::Processing)
    }

    pub fn completed(&self) -> Vec<&QueueItem> {
        self.with_status(QueueStatus::Done)
    }

    pub fn failed(&self) -> Vec<&QueueItem> {
        self.with_status(QueueStatus::Error)
    }

    /// Pending items that fit in the free slots: at most
    /// `concurrency - processing().len()`, never below zero.
    pub fn next_batch(&self) -> Vec<QueueItem> {
        let slots = self.concurrency.saturating_sub(self.processing().len());
        self.items
            .iter()
            .filter(|item| item.status == QueueStatus::Pending)
            .take(slots)
            .cloned()
            .collect()
    }

    pub fn is_idle(&self) -> bool {
        self.pending().is_empty() && self.processing().is_empty()
    }

    fn with_status(&self, status: QueueStatus) -> Vec<&QueueItem> {
        self.items
            .iter()
            .filter(|item| item.status == status)
            .collect()
    }

    fn sync(&self) {
        if let Some(sink) = &self.sink {
            sink.try_persist(&self.items);
        }
    }
}
