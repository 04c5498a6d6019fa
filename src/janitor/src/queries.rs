//! Candidate discovery.
//!
//! Read-only joins over the fleet schema. Every query orders by primary key
//! and paginates with LIMIT/OFFSET so pages are deterministic; the cascade
//! engines make processing idempotent, so a candidate skipped by an
//! advancing cursor is simply found by the next run.

use common::Database;
use common::model::BuildStatus;
use sqlx::Row;

use crate::error::CleanupError;

/// Soft-deleted device reachable from an update transaction only through a
/// dispatch record, with the direct device link missing. An inconsistent
/// historical state repaired by deleting the update transaction.
#[derive(Clone, Debug)]
pub struct OrphanUpdateCandidate {
    pub device_id: i64,
    pub device_uuid: String,
    pub org_id: String,
    pub update_id: i64,
    pub update_repo_id: Option<i64>,
    pub update_repo_url: Option<String>,
}

/// Soft-deleted device, optionally joined to one of its update
/// transactions, that update's repo and current commit, and the image (if
/// any) owning that commit.
#[derive(Clone, Debug)]
pub struct DeviceCandidate {
    pub device_id: i64,
    pub device_uuid: String,
    pub org_id: String,
    pub deleted_at: Option<String>,
    pub update_id: Option<i64>,
    pub update_repo_id: Option<i64>,
    pub update_repo_url: Option<String>,
    pub commit_id: Option<i64>,
    pub commit_repo_id: Option<i64>,
    pub image_id: Option<i64>,
}

/// Image needing artifact reclamation and possibly hard deletion: either
/// soft-deleted, or stuck in `ERROR` with at least one successfully built
/// artifact still occupying remote storage.
#[derive(Clone, Debug)]
pub struct ImageCandidate {
    pub image_id: i64,
    pub org_id: String,
    pub name: String,
    pub deleted_at: Option<String>,
    pub image_set_id: Option<i64>,
    pub commit_id: i64,
    pub commit_status: Option<BuildStatus>,
    pub tar_url: String,
    pub commit_repo_id: Option<i64>,
    pub repo_url: Option<String>,
    pub repo_status: Option<BuildStatus>,
    pub installer_id: i64,
    pub installer_status: Option<BuildStatus>,
    pub iso_url: String,
}

/// Commit referenced by no image and no update transaction.
#[derive(Clone, Debug)]
pub struct OrphanCommitCandidate {
    pub commit_id: i64,
    pub org_id: String,
    pub repo_id: Option<i64>,
    pub repo_url: Option<String>,
    pub repo_status: Option<BuildStatus>,
}

pub async fn orphan_device_updates(
    db: &Database,
    limit: i64,
    offset: i64,
) -> Result<Vec<OrphanUpdateCandidate>, CleanupError> {
    let rows = sqlx::query(
        r#"
        SELECT DISTINCT
            d.id AS device_id,
            d.uuid AS device_uuid,
            d.org_id AS org_id,
            ut.id AS update_id,
            ut.repo_id AS update_repo_id,
            r.url AS update_repo_url
        FROM devices d
        JOIN dispatch_records dr ON dr.device_id = d.id
        JOIN updatetransaction_dispatchrecords utdr ON utdr.dispatch_record_id = dr.id
        JOIN update_transactions ut ON ut.id = utdr.update_transaction_id
        LEFT JOIN updatetransaction_devices utd
            ON utd.update_transaction_id = ut.id AND utd.device_id = d.id
        LEFT JOIN repos r ON r.id = ut.repo_id
        WHERE d.deleted_at IS NOT NULL
          AND utd.update_transaction_id IS NULL
        ORDER BY d.id, ut.id
        LIMIT $1 OFFSET $2
        "#,
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(db.pool())
    .await?;

    let mut candidates = Vec::with_capacity(rows.len());
    for row in rows {
        candidates.push(OrphanUpdateCandidate {
            device_id: row.try_get("device_id")?,
            device_uuid: row.try_get("device_uuid")?,
            org_id: row.try_get("org_id")?,
            update_id: row.try_get("update_id")?,
            update_repo_id: row.try_get("update_repo_id")?,
            update_repo_url: row.try_get("update_repo_url")?,
        });
    }
    Ok(candidates)
}

pub async fn device_candidates(
    db: &Database,
    limit: i64,
    offset: i64,
) -> Result<Vec<DeviceCandidate>, CleanupError> {
    let rows = sqlx::query(
        r#"
        SELECT
            d.id AS device_id,
            d.uuid AS device_uuid,
            d.org_id AS org_id,
            d.deleted_at AS deleted_at,
            ut.id AS update_id,
            ut.repo_id AS update_repo_id,
            r.url AS update_repo_url,
            c.id AS commit_id,
            cr.id AS commit_repo_id,
            i.id AS image_id
        FROM devices d
        LEFT JOIN updatetransaction_devices utd ON utd.device_id = d.id
        LEFT JOIN update_transactions ut ON ut.id = utd.update_transaction_id
        LEFT JOIN repos r ON r.id = ut.repo_id
        LEFT JOIN commits c ON c.id = ut.commit_id
        LEFT JOIN images i ON i.commit_id = c.id
        LEFT JOIN repos cr ON cr.id = c.repo_id
        WHERE d.deleted_at IS NOT NULL
        ORDER BY d.id, ut.id
        LIMIT $1 OFFSET $2
        "#,
    )
    .bind(limit)
    .bind(offset)
    .fetch_all(db.pool())
    .await?;

    let mut candidates = Vec::with_capacity(rows.len());
    for row in rows {
        candidates.push(DeviceCandidate {
            device_id: row.try_get("device_id")?,
            device_uuid: row.try_get("device_uuid")?,
            org_id: row.try_get("org_id")?,
            deleted_at: row.try_get("deleted_at")?,
            update_id: row.try_get("update_id")?,
            update_repo_id: row.try_get("update_repo_id")?,
            update_repo_url: row.try_get("update_repo_url")?,
            commit_id: row.try_get("commit_id")?,
            commit_repo_id: row.try_get("commit_repo_id")?,
            image_id: row.try_get("image_id")?,
        });
    }
    Ok(candidates)
}

pub async fn image_candidates(
    db: &Database,
    limit: i64,
    offset: i64,
) -> Result<Vec<ImageCandidate>, CleanupError> {
    let rows = sqlx::query(
        r#"
        SELECT
            i.id AS image_id,
            i.org_id AS org_id,
            i.name AS name,
            i.deleted_at AS deleted_at,
            i.image_set_id AS image_set_id,
            c.id AS commit_id,
            c.status AS commit_status,
            c.tar_url AS tar_url,
            c.repo_id AS commit_repo_id,
            r.url AS repo_url,
            r.status AS repo_status,
            n.id AS installer_id,
            n.status AS installer_status,
            n.iso_url AS iso_url
        FROM images i
        JOIN commits c ON c.id = i.commit_id
        JOIN installers n ON n.id = i.installer_id
        LEFT JOIN repos r ON r.id = c.repo_id
        WHERE i.deleted_at IS NOT NULL
           OR (i.status = $1 AND (c.status = $2 OR n.status = $2 OR r.status = $2))
        ORDER BY i.id
        LIMIT $3 OFFSET $4
        "#,
    )
    .bind(BuildStatus::Error.as_str())
    .bind(BuildStatus::Success.as_str())
    .bind(limit)
    .bind(offset)
    .fetch_all(db.pool())
    .await?;

    let mut candidates = Vec::with_capacity(rows.len());
    for row in rows {
        let commit_status: String = row.try_get("commit_status")?;
        let installer_status: String = row.try_get("installer_status")?;
        let repo_status: Option<String> = row.try_get("repo_status")?;
        candidates.push(ImageCandidate {
            image_id: row.try_get("image_id")?,
            org_id: row.try_get("org_id")?,
            name: row.try_get("name")?,
            deleted_at: row.try_get("deleted_at")?,
            image_set_id: row.try_get("image_set_id")?,
            commit_id: row.try_get("commit_id")?,
            commit_status: BuildStatus::parse(&commit_status),
            tar_url: row.try_get("tar_url")?,
            commit_repo_id: row.try_get("commit_repo_id")?,
            repo_url: row.try_get("repo_url")?,
            repo_status: repo_status.as_deref().and_then(BuildStatus::parse),
            installer_id: row.try_get("installer_id")?,
            installer_status: BuildStatus::parse(&installer_status),
            iso_url: row.try_get("iso_url")?,
        });
    }
    Ok(candidates)
}

/// `preserve_update_history` additionally excludes commits still referenced
/// from the legacy `updatetransaction_commits` history table; see the
/// `cleanup.preserve_update_history` configuration option.
pub async fn orphan_commits(
    db: &Database,
    limit: i64,
    offset: i64,
    preserve_update_history: bool,
) -> Result<Vec<OrphanCommitCandidate>, CleanupError> {
    let history_exclusion = if preserve_update_history {
        "AND c.id NOT IN (SELECT commit_id FROM updatetransaction_commits)"
    } else {
        ""
    };

    let sql = format!(
        r#"
        SELECT
            c.id AS commit_id,
            c.org_id AS org_id,
            c.repo_id AS repo_id,
            r.url AS repo_url,
            r.status AS repo_status
        FROM commits c
        LEFT JOIN images i ON i.commit_id = c.id
        LEFT JOIN update_transactions ut ON ut.commit_id = c.id
        LEFT JOIN repos r ON r.id = c.repo_id
        WHERE i.id IS NULL
          AND ut.id IS NULL
          {history_exclusion}
        ORDER BY c.id
        LIMIT $1 OFFSET $2
        "#
    );

    let rows = sqlx::query(&sql)
        .bind(limit)
        .bind(offset)
        .fetch_all(db.pool())
        .await?;

    let mut candidates = Vec::with_capacity(rows.len());
    for row in rows {
        let repo_status: Option<String> = row.try_get("repo_status")?;
        candidates.push(OrphanCommitCandidate {
            commit_id: row.try_get("commit_id")?,
            org_id: row.try_get("org_id")?,
            repo_id: row.try_get("repo_id")?,
            repo_url: row.try_get("repo_url")?,
            repo_status: repo_status.as_deref().and_then(BuildStatus::parse),
        });
    }
    Ok(candidates)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::model::timestamp_now;
    use common::testing as seed;
    use common::testing::ImageSeed;

    #[tokio::test]
    async fn test_orphan_device_updates_requires_missing_direct_link() {
        let db = Database::new_in_memory().await.unwrap();

        // Device 1: linked through dispatch record only (orphan state).
        seed::insert_device(&db, 1, None, Some(timestamp_now()))
            .await
            .unwrap();
        seed::insert_repo(&db, 10, "http://a/org/upd/one", BuildStatus::Success)
            .await
            .unwrap();
        seed::insert_update_transaction(&db, 100, None, Some(10))
            .await
            .unwrap();
        seed::insert_dispatch_record(&db, 1000, 1).await.unwrap();
        seed::link_update_dispatch_record(&db, 100, 1000)
            .await
            .unwrap();

        // Device 2: same shape but with the direct device link present.
        seed::insert_device(&db, 2, None, Some(timestamp_now()))
            .await
            .unwrap();
        seed::insert_update_transaction(&db, 200, None, None)
            .await
            .unwrap();
        seed::insert_dispatch_record(&db, 2000, 2).await.unwrap();
        seed::link_update_dispatch_record(&db, 200, 2000)
            .await
            .unwrap();
        seed::link_update_device(&db, 200, 2).await.unwrap();

        // Device 3: orphan shape but not soft-deleted.
        seed::insert_device(&db, 3, None, None).await.unwrap();
        seed::insert_update_transaction(&db, 300, None, None)
            .await
            .unwrap();
        seed::insert_dispatch_record(&db, 3000, 3).await.unwrap();
        seed::link_update_dispatch_record(&db, 300, 3000)
            .await
            .unwrap();

        let candidates = orphan_device_updates(&db, 50, 0).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].device_id, 1);
        assert_eq!(candidates[0].update_id, 100);
        assert_eq!(
            candidates[0].update_repo_url.as_deref(),
            Some("http://a/org/upd/one")
        );
    }

    #[tokio::test]
    async fn test_device_candidates_join_shape() {
        let db = Database::new_in_memory().await.unwrap();

        seed::insert_repo(&db, 10, "http://a/org/upd/abc", BuildStatus::Success)
            .await
            .unwrap();
        seed::insert_repo(&db, 11, "http://a/org/repo/xyz", BuildStatus::Success)
            .await
            .unwrap();
        seed::insert_commit(&db, 20, Some(11), BuildStatus::Success, "")
            .await
            .unwrap();
        seed::insert_update_transaction(&db, 100, Some(20), Some(10))
            .await
            .unwrap();
        seed::insert_device(&db, 1, None, Some(timestamp_now()))
            .await
            .unwrap();
        seed::link_update_device(&db, 100, 1).await.unwrap();

        // Live device is never a candidate.
        seed::insert_device(&db, 2, None, None).await.unwrap();

        let candidates = device_candidates(&db, 50, 0).await.unwrap();
        assert_eq!(candidates.len(), 1);
        let c = &candidates[0];
        assert_eq!(c.device_id, 1);
        assert_eq!(c.update_id, Some(100));
        assert_eq!(c.update_repo_id, Some(10));
        assert_eq!(c.update_repo_url.as_deref(), Some("http://a/org/upd/abc"));
        assert_eq!(c.commit_id, Some(20));
        assert_eq!(c.commit_repo_id, Some(11));
        // No image owns commit 20.
        assert_eq!(c.image_id, None);
    }

    #[tokio::test]
    async fn test_device_candidates_without_update() {
        let db = Database::new_in_memory().await.unwrap();
        seed::insert_device(&db, 1, None, Some(timestamp_now()))
            .await
            .unwrap();

        let candidates = device_candidates(&db, 50, 0).await.unwrap();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].update_id, None);
        assert_eq!(candidates[0].commit_id, None);
    }

    #[tokio::test]
    async fn test_image_candidates_predicates() {
        let db = Database::new_in_memory().await.unwrap();

        seed::insert_repo(&db, 10, "http://a/org/repo/one", BuildStatus::Success)
            .await
            .unwrap();
        seed::insert_commit(&db, 20, Some(10), BuildStatus::Success, "http://a/org/tar/one")
            .await
            .unwrap();
        seed::insert_installer(&db, 30, BuildStatus::Success, "http://a/org/iso/one")
            .await
            .unwrap();

        // Soft-deleted image: candidate.
        seed::insert_image(
            &db,
            &ImageSeed {
                installer_id: Some(30),
                deleted_at: Some(timestamp_now()),
                ..ImageSeed::new(1, 20)
            },
        )
        .await
        .unwrap();

        // Error image with successful artifacts: candidate.
        seed::insert_commit(&db, 21, None, BuildStatus::Success, "http://a/org/tar/two")
            .await
            .unwrap();
        seed::insert_installer(&db, 31, BuildStatus::Error, "")
            .await
            .unwrap();
        seed::insert_image(
            &db,
            &ImageSeed {
                installer_id: Some(31),
                status: BuildStatus::Error,
                ..ImageSeed::new(2, 21)
            },
        )
        .await
        .unwrap();

        // Error image with nothing built: not a candidate.
        seed::insert_commit(&db, 22, None, BuildStatus::Error, "")
            .await
            .unwrap();
        seed::insert_installer(&db, 32, BuildStatus::Error, "")
            .await
            .unwrap();
        seed::insert_image(
            &db,
            &ImageSeed {
                installer_id: Some(32),
                status: BuildStatus::Error,
                ..ImageSeed::new(3, 22)
            },
        )
        .await
        .unwrap();

        // Healthy live image: not a candidate.
        seed::insert_commit(&db, 23, None, BuildStatus::Success, "http://a/org/tar/four")
            .await
            .unwrap();
        seed::insert_installer(&db, 33, BuildStatus::Success, "http://a/org/iso/four")
            .await
            .unwrap();
        seed::insert_image(
            &db,
            &ImageSeed {
                installer_id: Some(33),
                ..ImageSeed::new(4, 23)
            },
        )
        .await
        .unwrap();

        let candidates = image_candidates(&db, 50, 0).await.unwrap();
        let ids: Vec<i64> = candidates.iter().map(|c| c.image_id).collect();
        assert_eq!(ids, vec![1, 2]);

        let deleted = &candidates[0];
        assert_eq!(deleted.commit_status, Some(BuildStatus::Success));
        assert_eq!(deleted.repo_status, Some(BuildStatus::Success));
        assert_eq!(deleted.repo_url.as_deref(), Some("http://a/org/repo/one"));
        assert_eq!(deleted.installer_status, Some(BuildStatus::Success));

        let errored = &candidates[1];
        assert!(errored.deleted_at.is_none());
        assert_eq!(errored.repo_status, None);
    }

    #[tokio::test]
    async fn test_orphan_commits_and_history_exclusion() {
        let db = Database::new_in_memory().await.unwrap();

        // Referenced by an image: not orphaned.
        seed::insert_commit(&db, 20, None, BuildStatus::Success, "")
            .await
            .unwrap();
        seed::insert_installer(&db, 30, BuildStatus::Success, "")
            .await
            .unwrap();
        seed::insert_image(
            &db,
            &ImageSeed {
                installer_id: Some(30),
                ..ImageSeed::new(1, 20)
            },
        )
        .await
        .unwrap();

        // Referenced by an update transaction: not orphaned.
        seed::insert_commit(&db, 21, None, BuildStatus::Success, "")
            .await
            .unwrap();
        seed::insert_update_transaction(&db, 100, Some(21), None)
            .await
            .unwrap();

        // Unreferenced: orphaned.
        seed::insert_repo(&db, 12, "http://a/org/repo/three", BuildStatus::Success)
            .await
            .unwrap();
        seed::insert_commit(&db, 22, Some(12), BuildStatus::Success, "")
            .await
            .unwrap();

        // Only in the legacy history table.
        seed::insert_commit(&db, 23, None, BuildStatus::Success, "")
            .await
            .unwrap();
        seed::link_update_commit(&db, 100, 23).await.unwrap();

        let swept = orphan_commits(&db, 50, 0, false).await.unwrap();
        let ids: Vec<i64> = swept.iter().map(|c| c.commit_id).collect();
        assert_eq!(ids, vec![22, 23]);
        assert_eq!(swept[0].repo_url.as_deref(), Some("http://a/org/repo/three"));

        let preserved = orphan_commits(&db, 50, 0, true).await.unwrap();
        let ids: Vec<i64> = preserved.iter().map(|c| c.commit_id).collect();
        assert_eq!(ids, vec![22]);
    }

    #[tokio::test]
    async fn test_pagination_is_ordered_and_bounded() {
        let db = Database::new_in_memory().await.unwrap();
        for id in 1..=5 {
            seed::insert_device(&db, id, None, Some(timestamp_now()))
                .await
                .unwrap();
        }

        let first = device_candidates(&db, 2, 0).await.unwrap();
        let second = device_candidates(&db, 2, 2).await.unwrap();
        let third = device_candidates(&db, 2, 4).await.unwrap();

        assert_eq!(
            first.iter().map(|c| c.device_id).collect::<Vec<_>>(),
            vec![1, 2]
        );
        assert_eq!(
            second.iter().map(|c| c.device_id).collect::<Vec<_>>(),
            vec![3, 4]
        );
        assert_eq!(
            third.iter().map(|c| c.device_id).collect::<Vec<_>>(),
            vec![5]
        );
    }
}
