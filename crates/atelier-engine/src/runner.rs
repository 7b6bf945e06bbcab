//! Bounded-concurrency draining of the generation queue.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc;
use std::thread;

use atelier_contracts::queue::{GenerationQueue, QueueStatus};
use atelier_contracts::request::GenerationOptions;

use crate::orchestrator::{GenerationReport, Orchestrator};

#[derive(Debug)]
pub struct RunSummary<T> {
    pub completed: Vec<(String, T)>,
    pub failed: Vec<(String, String)>,
}

impl<T> Default for RunSummary<T> {
    fn default() -> Self {
        Self {
            completed: Vec::new(),
            failed: Vec::new(),
        }
    }
}

/// Runs `job` for every pending item with at most `queue.concurrency()`
/// calls in flight, refilling from `next_batch` as jobs finish.
///
/// Items move pending → processing → done/error and every transition goes
/// through the queue's sink. A panicking job marks its item as errored.
pub fn drain_queue<T, F>(queue: &mut GenerationQueue, job: F) -> RunSummary<T>
where
    T: Send,
    F: Fn(&str) -> Result<T, String> + Sync,
{
    let mut summary = RunSummary::default();
    let job = &job;

    thread::scope(|scope| {
        let (tx, rx) = mpsc::channel::<(String, Result<T, String>)>();
        let mut in_flight = 0usize;

        loop {
            for item in queue.next_batch() {
                queue.set_status(&item.id, QueueStatus::Processing, None);
                in_flight += 1;
                let tx = tx.clone();
                scope.spawn(move || {
                    let result = panic::catch_unwind(AssertUnwindSafe(|| job(&item.id)))
                        .unwrap_or_else(|_| Err("generation panicked".to_string()));
                    let _ = tx.send((item.id, result));
                });
            }
            if in_flight == 0 {
                break;
            }

            let Ok((id, result)) = rx.recv() else {
                break;
            };
            in_flight -= 1;
            match result {
                Ok(value) => {
                    queue.set_status(&id, QueueStatus::Done, None);
                    summary.completed.push((id, value));
                }
                Err(message) => {
                    tracing::warn!(item = %id, error = %message, "queue item failed");
                    queue.set_status(&id, QueueStatus::Error, Some(message.clone()));
                    summary.failed.push((id, message));
                }
            }
        }
    });

    summary
}

/// Feeds queued prompt ids through an [`Orchestrator`].
pub struct QueueRunner<'a> {
    orchestrator: &'a Orchestrator,
    options: GenerationOptions,
}

impl<'a> QueueRunner<'a> {
    pub fn new(orchestrator: &'a Orchestrator, options: GenerationOptions) -> Self {
        Self {
            orchestrator,
            options,
        }
    }

    pub fn run(&self, queue: &mut GenerationQueue) -> RunSummary<GenerationReport> {
        tracing::info!(
            pending = queue.pending().len(),
            concurrency = queue.concurrency(),
            "draining generation queue"
        );
        let summary = drain_queue(queue, |prompt_id| {
            self.orchestrator
                .generate(prompt_id, &self.options)
                .map_err(|err| err.to_string())
        });
        tracing::info!(
            completed = summary.completed.len(),
            failed = summary.failed.len(),
            "queue drained"
        );
        summary
    }
}
