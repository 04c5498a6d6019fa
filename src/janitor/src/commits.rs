//! Orphan-commit sweep.
//!
//! The final pipeline stage: commits left behind by ordering gaps between
//! image and device reclamation, referenced by neither, lose their repo
//! content and their rows.

use std::sync::Arc;

use async_trait::async_trait;
use common::Database;
use common::config::PageConfig;
use common::model::BuildStatus;

use crate::error::CleanupError;
use crate::pipeline::FLAG_ORPHAN_COMMITS;
use crate::queries::{self, OrphanCommitCandidate};
use crate::reclaim::{StorageReclaimer, storage_location_from_url};
use crate::runner::CleanupJob;

pub struct CommitSweeper {
    db: Database,
    reclaimer: Arc<StorageReclaimer>,
}

impl CommitSweeper {
    pub fn new(db: Database, reclaimer: Arc<StorageReclaimer>) -> Self {
        Self { db, reclaimer }
    }

    pub async fn sweep_commit(&self, candidate: &OrphanCommitCandidate) -> Result<(), CleanupError> {
        if candidate.repo_status == Some(BuildStatus::Success) {
            if let (Some(repo_id), Some(url)) = (candidate.repo_id, &candidate.repo_url) {
                if !url.is_empty() {
                    if let Some(prefix) = storage_location_from_url(url) {
                        self.reclaimer.delete_prefix(&prefix).await?;
                        sqlx::query("UPDATE repos SET status = $1, url = '' WHERE id = $2")
                            .bind(BuildStatus::StorageCleaned.as_str())
                            .bind(repo_id)
                            .execute(self.db.pool())
                            .await?;
                        tracing::info!(
                            commit_id = candidate.commit_id,
                            repo_id,
                            prefix,
                            "orphan commit repo storage reclaimed"
                        );
                    }
                }
            }
        }

        let mut tx = self.db.pool().begin().await?;
        sqlx::query("DELETE FROM updatetransaction_commits WHERE commit_id = $1")
            .bind(candidate.commit_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM commit_installed_packages WHERE commit_id = $1")
            .bind(candidate.commit_id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM commits WHERE id = $1")
            .bind(candidate.commit_id)
            .execute(&mut *tx)
            .await?;
        if let Some(repo_id) = candidate.repo_id {
            sqlx::query("DELETE FROM repos WHERE id = $1")
                .bind(repo_id)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        tracing::info!(commit_id = candidate.commit_id, "orphan commit swept");
        Ok(())
    }
}

pub struct OrphanCommitJob {
    db: Database,
    sweeper: CommitSweeper,
    pages: PageConfig,
    preserve_update_history: bool,
}

impl OrphanCommitJob {
    pub fn new(
        db: Database,
        reclaimer: Arc<StorageReclaimer>,
        pages: PageConfig,
        preserve_update_history: bool,
    ) -> Self {
        Self {
            sweeper: CommitSweeper::new(db.clone(), reclaimer),
            db,
            pages,
            preserve_update_history,
        }
    }
}

#[async_trait]
impl CleanupJob for OrphanCommitJob {
    type Candidate = OrphanCommitCandidate;

    fn name(&self) -> &'static str {
        "orphan-commit-sweep"
    }

    fn flag(&self) -> &'static str {
        FLAG_ORPHAN_COMMITS
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
        queries::orphan_commits(&self.db, limit, offset, self.preserve_update_history).await
    }

    async fn process(&self, candidate: Self::Candidate) -> Result<(), CleanupError> {
        if let Err(error) = self.sweeper.sweep_commit(&candidate).await {
            tracing::error!(
                commit_id = candidate.commit_id,
                org_id = %candidate.org_id,
                repo_url = candidate.repo_url.as_deref().unwrap_or(""),
                %error,
                "orphan commit sweep failed"
            );
            return Err(error);
        }
        Ok(())
    }
}
