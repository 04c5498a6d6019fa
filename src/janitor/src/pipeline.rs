//! The four-stage reclamation pipeline.
//!
//! Fixed order, chosen so each stage feeds the next: retention soft-deletes
//! images, image reclamation consumes them, device reclamation unpins
//! commits, and the orphan-commit sweep catches whatever the ordering gaps
//! between those stages left behind. A disabled stage is a logged skip; a
//! failing stage halts the run so operators see partial runs instead of
//! silently accumulating them.

use std::sync::Arc;

use common::config::CleanupConfig;
use common::{Database, FeatureGate};
use object_store::ObjectStore;

use crate::commits::OrphanCommitJob;
use crate::devices::{DeviceCleanupJob, OrphanUpdateJob};
use crate::error::CleanupError;
use crate::images::ImageCleanupJob;
use crate::reclaim::StorageReclaimer;
use crate::retention::{RetentionSummary, RetentionSweep};
use crate::runner::{CleanupJob, RunSummary, run_job};

pub const FLAG_IMAGE_RETENTION: &str = "cleanup-image-retention";
pub const FLAG_IMAGES: &str = "cleanup-images";
pub const FLAG_DEVICES: &str = "cleanup-devices";
pub const FLAG_ORPHAN_COMMITS: &str = "cleanup-orphan-commits";

/// Per-stage outcome of one pipeline run. `None` means the stage was
/// skipped by its feature flag.
#[derive(Clone, Copy, Debug, Default)]
pub struct PipelineSummary {
    pub retention: Option<RetentionSummary>,
    pub images: Option<RunSummary>,
    pub orphan_updates: Option<RunSummary>,
    pub devices: Option<RunSummary>,
    pub commits: Option<RunSummary>,
}

pub struct CleanupPipeline {
    db: Database,
    reclaimer: Arc<StorageReclaimer>,
    flags: Arc<dyn FeatureGate>,
    config: CleanupConfig,
}

impl CleanupPipeline {
    pub fn new(
        db: Database,
        store: Arc<dyn ObjectStore>,
        flags: Arc<dyn FeatureGate>,
        config: CleanupConfig,
    ) -> Self {
        let reclaimer = Arc::new(StorageReclaimer::new(
            store,
            config.delete_attempts,
            config.delete_retry_delay,
        ));
        Self {
            db,
            reclaimer,
            flags,
            config,
        }
    }

    /// Run the pipeline once. Returns the first fatal stage error;
    /// flag-disabled stages are skipped and the run continues.
    pub async fn run(&self) -> Result<PipelineSummary, CleanupError> {
        let mut summary = PipelineSummary::default();

        // Stage 1: image retention.
        if self.flags.is_enabled(FLAG_IMAGE_RETENTION) {
            let sweep = RetentionSweep::new(self.db.clone(), self.config.retention.clone());
            summary.retention = Some(sweep.run().await?);
        } else {
            tracing::info!(flag = FLAG_IMAGE_RETENTION, "stage disabled, skipping");
        }

        // Stage 2: image reclamation.
        summary.images = self
            .stage(ImageCleanupJob::new(
                self.db.clone(),
                Arc::clone(&self.reclaimer),
                self.config.images,
            ))
            .await?;

        // Stage 3: device reclamation. Repair the historical orphan
        // device-update state first, then drain device candidates.
        summary.orphan_updates = self
            .stage(OrphanUpdateJob::new(
                self.db.clone(),
                Arc::clone(&self.reclaimer),
                self.config.devices,
            ))
            .await?;
        summary.devices = self
            .stage(DeviceCleanupJob::new(
                self.db.clone(),
                Arc::clone(&self.reclaimer),
                self.config.devices,
            ))
            .await?;

        // Stage 4: orphan-commit sweep.
        summary.commits = self
            .stage(OrphanCommitJob::new(
                self.db.clone(),
                Arc::clone(&self.reclaimer),
                self.config.commits,
                self.config.preserve_update_history,
            ))
            .await?;

        Ok(summary)
    }

    async fn stage<J: CleanupJob>(&self, job: J) -> Result<Option<RunSummary>, CleanupError> {
        match run_job(Arc::new(job), &*self.flags).await {
            Ok(summary) => Ok(Some(summary)),
            Err(CleanupError::FeatureDisabled(flag)) => {
                tracing::info!(flag, "stage disabled, skipping");
                Ok(None)
            }
            Err(error) => Err(error),
        }
    }
}
