//! Device and update-transaction reclamation.
//!
//! A soft-deleted device is drained in two rounds: the first round removes
//! its update transaction (reclaiming the update-built repo first), the
//! second, once no update links remain, removes the device row itself.
//! The update's current commit is only deleted when no image owns it; a
//! commit shared with a live image must survive its devices.

use std::sync::Arc;

use async_trait::async_trait;
use common::Database;
use common::config::PageConfig;
use common::model::BuildStatus;

use crate::error::CleanupError;
use crate::pipeline::FLAG_DEVICES;
use crate::queries::{self, DeviceCandidate, OrphanUpdateCandidate};
use crate::reclaim::{StorageReclaimer, update_storage_prefix};
use crate::runner::CleanupJob;

pub struct DeviceCleaner {
    db: Database,
    reclaimer: Arc<StorageReclaimer>,
}

impl DeviceCleaner {
    pub fn new(db: Database, reclaimer: Arc<StorageReclaimer>) -> Self {
        Self { db, reclaimer }
    }

    /// Process one device candidate.
    pub async fn clean_up_device(&self, candidate: &DeviceCandidate) -> Result<(), CleanupError> {
        if candidate.deleted_at.is_none() {
            return Err(CleanupError::NotCandidate(format!(
                "device {} ({}) is not soft-deleted",
                candidate.device_id, candidate.device_uuid
            )));
        }

        if let Some(update_id) = candidate.update_id {
            self.clean_up_update_transaction(
                update_id,
                candidate.update_repo_id,
                candidate.update_repo_url.as_deref(),
            )
            .await?;

            if candidate.image_id.is_none() {
                if let Some(commit_id) = candidate.commit_id {
                    self.clean_up_commit(commit_id, candidate.commit_repo_id)
                        .await?;
                }
            }

            // The device row stays: the next run finds it without an update
            // transaction and takes the deletion path below.
            return Ok(());
        }

        self.delete_device(candidate).await
    }

    /// Reclaim an update transaction: free the update-built repo content,
    /// then drop the transaction and its join rows. The current commit is
    /// never deleted here since it may still be owned by a live image.
    pub async fn clean_up_update_transaction(
        &self,
        update_id: i64,
        repo_id: Option<i64>,
        repo_url: Option<&str>,
    ) -> Result<(), CleanupError> {
        if let (Some(repo_id), Some(url)) = (repo_id, repo_url) {
            if !url.is_empty() {
                if let Some(prefix) = update_storage_prefix(url) {
                    self.reclaimer.delete_prefix(&prefix).await?;
                    // Recorded outside the deletion transaction: the content
                    // is gone even if the row deletions below fail.
                    sqlx::query("UPDATE repos SET status = $1, url = '' WHERE id = $2")
                        .bind(BuildStatus::StorageCleaned.as_str())
                        .bind(repo_id)
                        .execute(self.db.pool())
                        .await?;
                    tracing::info!(update_id, repo_id, prefix, "update repo storage reclaimed");
                }
            }
        }

        let mut tx = self.db.pool().begin().await?;
        sqlx::query("DELETE FROM updatetransaction_dispatchrecords WHERE update_transaction_id = $1")
            .bind(update_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM updatetransaction_devices WHERE update_transaction_id = $1")
            .bind(update_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM updatetransaction_commits WHERE update_transaction_id = $1")
            .bind(update_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM update_transactions WHERE id = $1")
            .bind(update_id)
            .execute(&mut *tx)
            .await?;
        if let Some(repo_id) = repo_id {
            sqlx::query("DELETE FROM repos WHERE id = $1")
                .bind(repo_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        tracing::info!(update_id, "update transaction deleted");
        Ok(())
    }

    /// Delete a commit the caller has established no image owns.
    pub(crate) async fn clean_up_commit(
        &self,
        commit_id: i64,
        repo_id: Option<i64>,
    ) -> Result<(), CleanupError> {
        let mut tx = self.db.pool().begin().await?;
        sqlx::query("DELETE FROM updatetransaction_commits WHERE commit_id = $1")
            .bind(commit_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM commit_installed_packages WHERE commit_id = $1")
            .bind(commit_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM commits WHERE id = $1")
            .bind(commit_id)
            .execute(&mut *tx)
            .await?;
        if let Some(repo_id) = repo_id {
            sqlx::query("DELETE FROM repos WHERE id = $1")
                .bind(repo_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        tracing::info!(commit_id, "commit deleted");
        Ok(())
    }

    /// Delete the device row itself, with its dispatch records and group
    /// memberships. Only valid once no update transaction links remain.
    pub async fn delete_device(&self, candidate: &DeviceCandidate) -> Result<(), CleanupError> {
        if candidate.deleted_at.is_none() {
            return Err(CleanupError::NotCandidate(format!(
                "device {} ({}) is not soft-deleted",
                candidate.device_id, candidate.device_uuid
            )));
        }
        if let Some(update_id) = candidate.update_id {
            return Err(CleanupError::ConflictingState(format!(
                "device {} is still linked to update transaction {update_id}",
                candidate.device_id
            )));
        }

        let mut tx = self.db.pool().begin().await?;
        sqlx::query("DELETE FROM dispatch_records WHERE device_id = $1")
            .bind(candidate.device_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM device_groups_devices WHERE device_id = $1")
            .bind(candidate.device_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM devices WHERE id = $1")
            .bind(candidate.device_id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::info!(
            device_id = candidate.device_id,
            device_uuid = %candidate.device_uuid,
            org_id = %candidate.org_id,
            "device deleted"
        );
        Ok(())
    }
}

/// Repair pass for the historical inconsistency where an update transaction
/// is reachable from a device only through a dispatch record.
pub struct OrphanUpdateJob {
    db: Database,
    cleaner: DeviceCleaner,
    pages: PageConfig,
}

impl OrphanUpdateJob {
    pub fn new(db: Database, reclaimer: Arc<StorageReclaimer>, pages: PageConfig) -> Self {
        Self {
            cleaner: DeviceCleaner::new(db.clone(), reclaimer),
            db,
            pages,
        }
    }
}

#[async_trait]
impl CleanupJob for OrphanUpdateJob {
    type Candidate = OrphanUpdateCandidate;

    fn name(&self) -> &'static str {
        "orphan-device-updates"
    }

    fn flag(&self) -> &'static str {
        FLAG_DEVICES
    }

    fn page_size(&self) -> i64 {
        i64::from(self.pages.page_size)
    }

    fn max_pages(&self) -> u32 {
        self.pages.max_pages
    }

    async fn fetch_page(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Self::Candidate>, CleanupError> {
        queries::orphan_device_updates(&self.db, limit, offset).await
    }

    async fn process(&self, candidate: Self::Candidate) -> Result<(), CleanupError> {
        if let Err(error) = self
            .cleaner
            .clean_up_update_transaction(
                candidate.update_id,
                candidate.update_repo_id,
                candidate.update_repo_url.as_deref(),
            )
            .await
        {
            tracing::error!(
                device_id = candidate.device_id,
                device_uuid = %candidate.device_uuid,
                org_id = %candidate.org_id,
                update_id = candidate.update_id,
                repo_url = candidate.update_repo_url.as_deref().unwrap_or(""),
                %error,
                "orphan device-update cleanup failed"
            );
            return Err(error);
        }
        Ok(())
    }
}

/// The main device reclamation job.
pub struct DeviceCleanupJob {
    db: Database,
    cleaner: DeviceCleaner,
    pages: PageConfig,
}

impl DeviceCleanupJob {
    pub fn new(db: Database, reclaimer: Arc<StorageReclaimer>, pages: PageConfig) -> Self {
        Self {
            cleaner: DeviceCleaner::new(db.clone(), reclaimer),
            db,
            pages,
        }
    }
}

#[async_trait]
impl CleanupJob for DeviceCleanupJob {
    type Candidate = DeviceCandidate;

    fn name(&self) -> &'static str {
        "device-cleanup"
    }

    fn flag(&self) -> &'static str {
        FLAG_DEVICES
    }

    fn page_size(&self) -> i64 {
        i64::from(self.pages.page_size)
    }

    fn max_pages(&self) -> u32 {
        self.pages.max_pages
    }

    async fn fetch_page(
        &self,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Self::Candidate>, CleanupError> {
        queries::device_candidates(&self.db, limit, offset).await
    }

    async fn process(&self, candidate: Self::Candidate) -> Result<(), CleanupError> {
        if let Err(error) = self.cleaner.clean_up_device(&candidate).await {
            tracing::error!(
                device_id = candidate.device_id,
                device_uuid = %candidate.device_uuid,
                org_id = %candidate.org_id,
                update_id = candidate.update_id,
                repo_url = candidate.update_repo_url.as_deref().unwrap_or(""),
                %error,
                "device cleanup failed"
            );
            return Err(error);
        }
        Ok(())
    }
}
