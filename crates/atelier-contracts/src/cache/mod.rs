//! Local, last-write-wins caches that must never fail their caller.

mod queue_store;
mod recent;

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

pub use queue_store::QueueStore;
pub use recent::{RecentImages, RECENT_IMAGES_LIMIT};

/// A collaborator whose writes are advisory.
///
/// `persist` reports failures; `try_persist` is what call sites use and it
/// only logs them.
pub trait BestEffortSink<T: ?Sized>: Send + Sync {
    fn name(&self) -> &str;

    fn persist(&self, value: &T) -> anyhow::Result<()>;

    fn try_persist(&self, value: &T) {
        if let Err(err) = self.persist(value) {
            tracing::warn!(sink = self.name(), error = %format!("{err:#}"), "best-effort persist failed");
        }
    }
}

pub(crate) fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

/// Writes through a sibling temp file and renames it over `path`, so readers
/// never see a half-written cache.
pub(crate) fn write_json<T: Serialize + ?Sized>(path: &Path, payload: &T) -> anyhow::Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(parent)?;
    let mut staged = tempfile::NamedTempFile::new_in(parent)?;
    serde_json::to_writer_pretty(&mut staged, payload)?;
    staged.as_file().sync_all()?;
    staged.persist(path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::{json, Value};

    use super::*;

    struct FailingSink {
        calls: Mutex<u32>,
    }

    impl BestEffortSink<Value> for FailingSink {
        fn name(&self) -> &str {
            "failing"
        }

        fn persist(&self, _value: &Value) -> anyhow::Result<()> {
            *self.calls.lock().map_err(|_| anyhow::anyhow!("poisoned"))? += 1;
            anyhow::bail!("disk full")
        }
    }

    #[test]
    fn try_persist_swallows_errors() {
        let sink = FailingSink {
            calls: Mutex::new(0),
        };
        sink.try_persist(&json!({"id": 1}));
        sink.try_persist(&json!({"id": 2}));
        assert_eq!(*sink.calls.lock().unwrap(), 2);
    }

    #[test]
    fn read_json_tolerates_missing_and_corrupt_files() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("state.json");
        assert!(read_json::<Value>(&path).is_none());
        std::fs::write(&path, "{not json")?;
        assert!(read_json::<Value>(&path).is_none());
        write_json(&path, &json!({"ok": true}))?;
        assert_eq!(read_json::<Value>(&path), Some(json!({"ok": true})));
        Ok(())
    }

    #[test]
    fn write_json_replaces_file_without_leftovers() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("queue.json");
        write_json(&path, &json!([1, 2, 3]))?;
        write_json(&path, &json!([4]))?;
        assert_eq!(read_json::<Value>(&path), Some(json!([4])));
        let entries = std::fs::read_dir(temp.path().join("nested"))?.count();
        assert_eq!(entries, 1);
        Ok(())
    }
}
