//! SOLARFLOW Batch - Ordered Startup Orchestration
//!
//! Runs a declared sequence of startup units one at a time. A failed required
//! unit aborts everything after it; failed optional units are recorded and the
//! sequence continues. There is no rollback: units that already ran stay ran,
//! and the report says exactly what happened to each one.

use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures_util::future::BoxFuture;
use solarflow_core::{SolarflowError, SolarflowResult};
use tracing::{debug, error, info, warn};

/// Boxed unit of startup work.
pub type UnitOfWork = BoxFuture<'static, SolarflowResult<()>>;

/// Progress observer: `(completed, total, name, outcome)` after each unit
/// settles. Units skipped by an abort never settle and are not reported.
pub type ProgressFn = Arc<dyn Fn(usize, usize, &str, &ItemStatus) + Send + Sync>;

/// One named unit in a batch.
pub struct BatchItem {
    name: String,
    required: bool,
    work: UnitOfWork,
}

impl BatchItem {
    /// A unit whose failure aborts the remainder of the batch.
    pub fn required(
        name: impl Into<String>,
        work: impl Future<Output = SolarflowResult<()>> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            required: true,
            work: Box::pin(work),
        }
    }

    /// A unit whose failure is recorded without stopping the batch.
    pub fn optional(
        name: impl Into<String>,
        work: impl Future<Output = SolarflowResult<()>> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            required: false,
            work: Box::pin(work),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_required(&self) -> bool {
        self.required
    }
}

impl std::fmt::Debug for BatchItem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchItem")
            .field("name", &self.name)
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}

/// Outcome of a single unit.
#[derive(Debug, Clone, PartialEq)]
pub enum ItemStatus {
    Succeeded,
    /// A required unit failed; everything after it was skipped.
    FailedRequired(SolarflowError),
    /// An optional unit failed; the batch continued.
    FailedOptional(SolarflowError),
    /// Skipped because an earlier required unit failed.
    NotRun,
}

/// Per-unit entry in the batch report.
#[derive(Debug, Clone, PartialEq)]
pub struct ItemReport {
    pub name: String,
    pub required: bool,
    pub status: ItemStatus,
    pub duration_ms: u64,
}

/// Summary of one batch run.
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub total: usize,
    pub succeeded: usize,
    pub failed_required: usize,
    pub failed_optional: usize,
    pub per_item: Vec<ItemReport>,
}

impl BatchReport {
    /// Whether every required unit ran and succeeded.
    pub fn is_success(&self) -> bool {
        self.failed_required == 0
    }
}

/// Runs batches of startup units in declared order.
#[derive(Default)]
pub struct BatchOrchestrator {
    progress: Option<ProgressFn>,
}

impl BatchOrchestrator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Observe progress after each unit finishes. Units skipped after an
    /// abort are not reported as progress.
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Run `items` front to back. Never returns an error: the report carries
    /// every outcome, including the error that caused an abort.
    pub async fn run(&self, items: Vec<BatchItem>) -> BatchReport {
        let total = items.len();
        let mut per_item = Vec::with_capacity(total);
        let mut succeeded = 0;
        let mut failed_required = 0;
        let mut failed_optional = 0;
        let mut completed = 0;

        info!(total, "Batch started");

        let mut queue = items.into_iter();
        for item in queue.by_ref() {
            let BatchItem {
                name,
                required,
                work,
            } = item;

            let started = Instant::now();
            let result = work.await;
            let duration_ms = started.elapsed().as_millis() as u64;
            completed += 1;

            let status = match result {
                Ok(()) => {
                    succeeded += 1;
                    debug!(item = %name, duration_ms, "Batch item succeeded");
                    ItemStatus::Succeeded
                }
                Err(e) if required => {
                    failed_required += 1;
                    error!(item = %name, error = %e, "Required batch item failed; aborting remainder");
                    ItemStatus::FailedRequired(e)
                }
                Err(e) => {
                    failed_optional += 1;
                    warn!(item = %name, error = %e, "Optional batch item failed; continuing");
                    ItemStatus::FailedOptional(e)
                }
            };

            if let Some(progress) = &self.progress {
                progress(completed, total, &name, &status);
            }
            let abort = matches!(status, ItemStatus::FailedRequired(_));
            per_item.push(ItemReport {
                name,
                required,
                status,
                duration_ms,
            });
            if abort {
                break;
            }
        }

        // Whatever is left never ran; its futures are dropped unpolled.
        for item in queue {
            per_item.push(ItemReport {
                name: item.name,
                required: item.required,
                status: ItemStatus::NotRun,
                duration_ms: 0,
            });
        }

        info!(
            total,
            succeeded,
            failed_required,
            failed_optional,
            "Batch finished"
        );

        BatchReport {
            total,
            succeeded,
            failed_required,
            failed_optional,
            per_item,
        }
    }
}
