//! Image retention: the soft-delete stage.
//!
//! Marks images for the reclamation stage that follows. Two rules: images
//! whose set is already soft-deleted are orphans and go regardless of age;
//! images past the retention window go when no live device runs them and
//! no keep-list prefix protects them.

use common::Database;
use common::config::RetentionConfig;
use common::model::{timestamp_before, timestamp_now};
use sqlx::Row;

use crate::error::CleanupError;

#[derive(Clone, Copy, Debug, Default)]
pub struct RetentionSummary {
    /// Images soft-deleted because their set is gone.
    pub set_orphans: u64,
    /// Images soft-deleted past the retention window.
    pub expired: u64,
}

pub struct RetentionSweep {
    db: Database,
    config: RetentionConfig,
}

impl RetentionSweep {
    pub fn new(db: Database, config: RetentionConfig) -> Self {
        Self { db, config }
    }

    pub async fn run(&self) -> Result<RetentionSummary, CleanupError> {
        let set_orphans = self.soft_delete_set_orphans().await?;
        let expired = self.soft_delete_expired().await?;

        tracing::info!(set_orphans, expired, "image retention pass complete");
        Ok(RetentionSummary {
            set_orphans,
            expired,
        })
    }

    async fn soft_delete_set_orphans(&self) -> Result<u64, CleanupError> {
        let result = sqlx::query(
            r#"
            UPDATE images SET deleted_at = $1
            WHERE deleted_at IS NULL
              AND image_set_id IN (SELECT id FROM image_sets WHERE deleted_at IS NOT NULL)
            "#,
        )
        .bind(timestamp_now())
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected())
    }

    async fn soft_delete_expired(&self) -> Result<u64, CleanupError> {
        let cutoff = timestamp_before(self.config.older_than);
        let rows = sqlx::query(
            r#"
            SELECT i.id AS image_id, i.name AS name
            FROM images i
            WHERE i.deleted_at IS NULL
              AND i.created_at < $1
              AND i.id NOT IN (
                  SELECT image_id FROM devices
                  WHERE image_id IS NOT NULL AND deleted_at IS NULL
              )
            ORDER BY i.id
            "#,
        )
        .bind(cutoff)
        .fetch_all(self.db.pool())
        .await?;

        let keep_prefixes: Vec<String> = self
            .config
            .keep_prefixes
            .iter()
            .map(|p| p.to_lowercase())
            .collect();

        let now = timestamp_now();
        let mut expired = 0;
        for row in rows {
            let image_id: i64 = row.try_get("image_id")?;
            let name: String = row.try_get("name")?;

            let lowered = name.to_lowercase();
            if keep_prefixes.iter().any(|p| lowered.starts_with(p)) {
                tracing::debug!(image_id, name = %name, "image exempt from retention");
                continue;
            }

            let result = sqlx::query("UPDATE images SET deleted_at = $1 WHERE id = $2 AND deleted_at IS NULL")
                .bind(now.as_str())
                .bind(image_id)
                .execute(self.db.pool())
                .await?;
            expired += result.rows_affected();
        }
        Ok(expired)
    }
}
