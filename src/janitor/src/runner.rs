//! Page-concurrent job runner.
//!
//! Pages are processed strictly in order; within a page, every candidate
//! gets its own worker task, so the page size configuration is the
//! concurrency bound. The page always drains completely before the verdict:
//! a single failed candidate interrupts the job, but its successful
//! siblings keep their side effects; reclamation is idempotent, so the
//! next run retries only what is still there.

use std::sync::Arc;

use async_trait::async_trait;

use common::FeatureGate;

use crate::error::CleanupError;

/// One paginated cleanup job: a candidate query plus a per-candidate
/// cascade.
#[async_trait]
pub trait CleanupJob: Send + Sync + 'static {
    type Candidate: Send + 'static;

    fn name(&self) -> &'static str;

    /// Feature flag gating this job, re-checked at every page boundary.
    fn flag(&self) -> &'static str;

    fn page_size(&self) -> i64;

    /// Ceiling on pages per run, guarding against unbounded iteration when
    /// candidates are regenerated faster than they are consumed.
    fn max_pages(&self) -> u32;

    async fn fetch_page(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Self::Candidate>, CleanupError>;

    /// Process one candidate. Implementations log their own candidate
    /// context on failure.
    async fn process(&self, candidate: Self::Candidate) -> Result<(), CleanupError>;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub pages: u32,
    pub processed: u64,
}

/// Drive a job to completion, page by page.
pub async fn run_job<J: CleanupJob>(
    job: Arc<J>,
    flags: &dyn FeatureGate,
) -> Result<RunSummary, CleanupError> {
    let mut summary = RunSummary::default();
    let mut page: u32 = 0;

    while page < job.max_pages() {
        if !flags.is_enabled(job.flag()) {
            tracing::info!(job = job.name(), flag = job.flag(), page, "feature flag disabled");
            return Err(CleanupError::FeatureDisabled(job.flag()));
        }

        let limit = job.page_size();
        let offset = limit * i64::from(page);
        let candidates = job.fetch_page(limit, offset).await?;
        if candidates.is_empty() {
            break;
        }

        let total = candidates.len();
        tracing::debug!(job = job.name(), page, candidates = total, "processing page");

        let mut workers = Vec::with_capacity(total);
        for candidate in candidates {
            let job = Arc::clone(&job);
            workers.push(tokio::spawn(async move { job.process(candidate).await }));
        }

        // Drain the whole page before deciding; siblings of a failed
        // candidate finish their work.
        let mut failed = 0usize;
        for worker in workers {
            match worker.await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => failed += 1,
                Err(error) => {
                    tracing::error!(job = job.name(), page, %error, "cleanup worker panicked");
                    failed += 1;
                }
            }
        }

        if failed > 0 {
            return Err(CleanupError::Interrupted {
                job: job.name(),
                page,
                failed,
                total,
            });
        }

        summary.pages += 1;
        summary.processed += total as u64;
        page += 1;
    }

    tracing::info!(
        job = job.name(),
        pages = summary.pages,
        processed = summary.processed,
        "job complete"
    );
    Ok(summary)
}
