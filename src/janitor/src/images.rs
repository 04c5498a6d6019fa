//! Image artifact reclamation and hard deletion.
//!
//! Reclamation and deletion are deliberately decoupled: each of the three
//! remote artifacts (build tarball, build repo, ISO installer) is reclaimed
//! whenever its own build succeeded, even when the image row itself stays;
//! that is how an `ERROR` image sheds its partial remote content. Hard
//! deletion then only happens for soft-deleted images.

use std::sync::Arc;

use async_trait::async_trait;
use common::Database;
use common::config::PageConfig;
use common::model::BuildStatus;
use sqlx::Row;

use crate::error::CleanupError;
use crate::pipeline::FLAG_IMAGES;
use crate::queries::{self, ImageCandidate};
use crate::reclaim::{StorageReclaimer, storage_location_from_url};
use crate::runner::CleanupJob;

pub struct ImageCleaner {
    db: Database,
    reclaimer: Arc<StorageReclaimer>,
}

impl ImageCleaner {
    pub fn new(db: Database, reclaimer: Arc<StorageReclaimer>) -> Self {
        Self { db, reclaimer }
    }

    /// Process one image candidate: reclaim remote artifacts, then
    /// hard-delete the image if it is soft-deleted.
    pub async fn clean_up_image(&self, candidate: &ImageCandidate) -> Result<(), CleanupError> {
        self.reclaim_artifacts(candidate).await?;

        if candidate.deleted_at.is_some() {
            self.hard_delete(candidate).await?;
        }
        Ok(())
    }

    async fn reclaim_artifacts(&self, candidate: &ImageCandidate) -> Result<(), CleanupError> {
        // Build tarball, owned by the commit.
        if candidate.commit_status == Some(BuildStatus::Success) && !candidate.tar_url.is_empty() {
            if let Some(key) = storage_location_from_url(&candidate.tar_url) {
                self.reclaimer.delete_object(&key).await?;
                sqlx::query("UPDATE commits SET status = $1, tar_url = '' WHERE id = $2")
                    .bind(BuildStatus::StorageCleaned.as_str())
                    .bind(candidate.commit_id)
                    .execute(self.db.pool())
                    .await?;
                tracing::info!(
                    image_id = candidate.image_id,
                    commit_id = candidate.commit_id,
                    key,
                    "image tarball reclaimed"
                );
            }
        }

        // OSTree build repo, owned by the repo row.
        if candidate.repo_status == Some(BuildStatus::Success) {
            if let (Some(repo_id), Some(url)) = (candidate.commit_repo_id, &candidate.repo_url) {
                if !url.is_empty() {
                    if let Some(prefix) = storage_location_from_url(url) {
                        self.reclaimer.delete_prefix(&prefix).await?;
                        sqlx::query("UPDATE repos SET status = $1, url = '' WHERE id = $2")
                            .bind(BuildStatus::StorageCleaned.as_str())
                            .bind(repo_id)
                            .execute(self.db.pool())
                            .await?;
                        tracing::info!(
                            image_id = candidate.image_id,
                            repo_id,
                            prefix,
                            "image repo storage reclaimed"
                        );
                    }
                }
            }
        }

        // ISO, owned by the installer.
        if candidate.installer_status == Some(BuildStatus::Success) && !candidate.iso_url.is_empty()
        {
            if let Some(key) = storage_location_from_url(&candidate.iso_url) {
                self.reclaimer.delete_object(&key).await?;
                sqlx::query("UPDATE installers SET status = $1, iso_url = '' WHERE id = $2")
                    .bind(BuildStatus::StorageCleaned.as_str())
                    .bind(candidate.installer_id)
                    .execute(self.db.pool())
                    .await?;
                tracing::info!(
                    image_id = candidate.image_id,
                    installer_id = candidate.installer_id,
                    key,
                    "installer ISO reclaimed"
                );
            }
        }

        Ok(())
    }

    async fn hard_delete(&self, candidate: &ImageCandidate) -> Result<(), CleanupError> {
        let mut tx = self.db.pool().begin().await?;

        sqlx::query("DELETE FROM images_packages WHERE image_id = $1")
            .bind(candidate.image_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM images_repos WHERE image_id = $1")
            .bind(candidate.image_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM images_custom_packages WHERE image_id = $1")
            .bind(candidate.image_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM commit_installed_packages WHERE commit_id = $1")
            .bind(candidate.commit_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM images WHERE id = $1")
            .bind(candidate.image_id)
            .execute(&mut *tx)
            .await?;

        // The commit goes only when no update transaction still points at
        // it; devices may be mid-update on this image's content.
        let row = sqlx::query("SELECT COUNT(*) AS n FROM update_transactions WHERE commit_id = $1")
            .bind(candidate.commit_id)
            .fetch_one(&mut *tx)
            .await?;
        let referencing_updates: i64 = row.try_get("n")?;
        if referencing_updates == 0 {
            sqlx::query("DELETE FROM commits WHERE id = $1")
                .bind(candidate.commit_id)
                .execute(&mut *tx)
                .await?;
            if let Some(repo_id) = candidate.commit_repo_id {
                sqlx::query("DELETE FROM repos WHERE id = $1")
                    .bind(repo_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        sqlx::query("DELETE FROM installers WHERE id = $1")
            .bind(candidate.installer_id)
            .execute(&mut *tx)
            .await?;

        // The image set goes with its last image.
        if let Some(image_set_id) = candidate.image_set_id {
            let row = sqlx::query("SELECT COUNT(*) AS n FROM images WHERE image_set_id = $1")
                .bind(image_set_id)
                .fetch_one(&mut *tx)
                .await?;
            let remaining_images: i64 = row.try_get("n")?;
            if remaining_images == 0 {
                sqlx::query("DELETE FROM image_sets WHERE id = $1")
                    .bind(image_set_id)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        tx.commit().await?;

        tracing::info!(
            image_id = candidate.image_id,
            org_id = %candidate.org_id,
            name = %candidate.name,
            commit_deleted = referencing_updates == 0,
            "image deleted"
        );
        Ok(())
    }
}

pub struct ImageCleanupJob {
    db: Database,
    cleaner: ImageCleaner,
    pages: PageConfig,
}

impl ImageCleanupJob {
    pub fn new(db: Database, reclaimer: Arc<StorageReclaimer>, pages: PageConfig) -> Self {
        Self {
            cleaner: ImageCleaner::new(db.clone(), reclaimer),
            db,
            pages,
        }
    }
}

#[async_trait]
impl CleanupJob for ImageCleanupJob {
    type Candidate = ImageCandidate;

    fn name(&self) -> &'static str {
        "image-cleanup"
    }

    fn flag(&self) -> &'static str {
        FLAG_IMAGES
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
        queries::image_candidates(&self.db, limit, offset).await
    }

    async fn process(&self, candidate: Self::Candidate) -> Result<(), CleanupError> {
        if let Err(error) = self.cleaner.clean_up_image(&candidate).await {
            tracing::error!(
                image_id = candidate.image_id,
                org_id = %candidate.org_id,
                name = %candidate.name,
                tar_url = %candidate.tar_url,
                repo_url = candidate.repo_url.as_deref().unwrap_or(""),
                iso_url = %candidate.iso_url,
                %error,
                "image cleanup failed"
            );
            return Err(error);
        }
        Ok(())
    }
}
