//! Seed fixtures for cleanup tests.
//!
//! The janitor never creates fleet entities itself, so its tests need a way
//! to plant devices, images, updates and their join rows. Everything here
//! inserts through the same portable SQL the production queries use.

use sqlx::Row;

use crate::db::Database;
use crate::model::{BuildStatus, timestamp_now};

/// Org every fixture row belongs to.
pub const TEST_ORG: &str = "test-org";

/// Image row under construction; fields default to a freshly built,
/// undeleted image so tests only state what matters to them.
#[derive(Clone, Debug)]
pub struct ImageSeed {
    pub id: i64,
    pub name: String,
    pub version: i64,
    pub commit_id: i64,
    pub installer_id: Option<i64>,
    pub image_set_id: Option<i64>,
    pub status: BuildStatus,
    pub created_at: String,
    pub deleted_at: Option<String>,
}

impl ImageSeed {
    pub fn new(id: i64, commit_id: i64) -> Self {
        Self {
            id,
            name: format!("image-{id}"),
            version: 1,
            commit_id,
            installer_id: None,
            image_set_id: None,
            status: BuildStatus::Success,
            created_at: timestamp_now(),
            deleted_at: None,
        }
    }
}

pub async fn insert_device(
    db: &Database,
    id: i64,
    image_id: Option<i64>,
    deleted_at: Option<String>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO devices (id, uuid, org_id, name, image_id, created_at, deleted_at)
           VALUES ($1, $2, $3, $4, $5, $6, $7)"#,
    )
    .bind(id)
    .bind(uuid::Uuid::new_v4().to_string())
    .bind(TEST_ORG)
    .bind(format!("device-{id}"))
    .bind(image_id)
    .bind(timestamp_now())
    .bind(deleted_at)
    .execute(db.pool())
    .await?;
    Ok(())
}

pub async fn insert_device_group(db: &Database, id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO device_groups (id, org_id, name) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(TEST_ORG)
        .bind(format!("group-{id}"))
        .execute(db.pool())
        .await?;
    Ok(())
}

pub async fn add_device_to_group(
    db: &Database,
    group_id: i64,
    device_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO device_groups_devices (device_group_id, device_id) VALUES ($1, $2)")
        .bind(group_id)
        .bind(device_id)
        .execute(db.pool())
        .await?;
    Ok(())
}

pub async fn insert_dispatch_record(
    db: &Database,
    id: i64,
    device_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO dispatch_records (id, device_id, status) VALUES ($1, $2, $3)")
        .bind(id)
        .bind(device_id)
        .bind("BUILT")
        .execute(db.pool())
        .await?;
    Ok(())
}

pub async fn insert_update_transaction(
    db: &Database,
    id: i64,
    commit_id: Option<i64>,
    repo_id: Option<i64>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO update_transactions (id, org_id, commit_id, repo_id, status, created_at)
           VALUES ($1, $2, $3, $4, $5, $6)"#,
    )
    .bind(id)
    .bind(TEST_ORG)
    .bind(commit_id)
    .bind(repo_id)
    .bind(BuildStatus::Success.as_str())
    .bind(timestamp_now())
    .execute(db.pool())
    .await?;
    Ok(())
}

pub async fn link_update_device(
    db: &Database,
    update_id: i64,
    device_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO updatetransaction_devices (update_transaction_id, device_id) VALUES ($1, $2)",
    )
    .bind(update_id)
    .bind(device_id)
    .execute(db.pool())
    .await?;
    Ok(())
}

pub async fn link_update_commit(
    db: &Database,
    update_id: i64,
    commit_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO updatetransaction_commits (update_transaction_id, commit_id) VALUES ($1, $2)",
    )
    .bind(update_id)
    .bind(commit_id)
    .execute(db.pool())
    .await?;
    Ok(())
}

pub async fn link_update_dispatch_record(
    db: &Database,
    update_id: i64,
    dispatch_record_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO updatetransaction_dispatchrecords (update_transaction_id, dispatch_record_id)
           VALUES ($1, $2)"#,
    )
    .bind(update_id)
    .bind(dispatch_record_id)
    .execute(db.pool())
    .await?;
    Ok(())
}

pub async fn insert_commit(
    db: &Database,
    id: i64,
    repo_id: Option<i64>,
    status: BuildStatus,
    tar_url: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO commits (id, org_id, repo_id, status, tar_url, created_at)
           VALUES ($1, $2, $3, $4, $5, $6)"#,
    )
    .bind(id)
    .bind(TEST_ORG)
    .bind(repo_id)
    .bind(status.as_str())
    .bind(tar_url)
    .bind(timestamp_now())
    .execute(db.pool())
    .await?;
    Ok(())
}

pub async fn add_installed_package(
    db: &Database,
    commit_id: i64,
    package_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO commit_installed_packages (commit_id, installed_package_id) VALUES ($1, $2)",
    )
    .bind(commit_id)
    .bind(package_id)
    .execute(db.pool())
    .await?;
    Ok(())
}

pub async fn insert_repo(
    db: &Database,
    id: i64,
    url: &str,
    status: BuildStatus,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO repos (id, url, status, created_at) VALUES ($1, $2, $3, $4)")
        .bind(id)
        .bind(url)
        .bind(status.as_str())
        .bind(timestamp_now())
        .execute(db.pool())
        .await?;
    Ok(())
}

pub async fn insert_image(db: &Database, seed: &ImageSeed) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"INSERT INTO images
           (id, org_id, name, version, commit_id, installer_id, image_set_id, status, created_at, deleted_at)
           VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)"#,
    )
    .bind(seed.id)
    .bind(TEST_ORG)
    .bind(seed.name.as_str())
    .bind(seed.version)
    .bind(seed.commit_id)
    .bind(seed.installer_id)
    .bind(seed.image_set_id)
    .bind(seed.status.as_str())
    .bind(seed.created_at.as_str())
    .bind(seed.deleted_at.clone())
    .execute(db.pool())
    .await?;
    Ok(())
}

pub async fn add_image_package(
    db: &Database,
    image_id: i64,
    package_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO images_packages (image_id, package_id) VALUES ($1, $2)")
        .bind(image_id)
        .bind(package_id)
        .execute(db.pool())
        .await?;
    Ok(())
}

pub async fn add_image_repo(
    db: &Database,
    image_id: i64,
    third_party_repo_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO images_repos (image_id, third_party_repo_id) VALUES ($1, $2)")
        .bind(image_id)
        .bind(third_party_repo_id)
        .execute(db.pool())
        .await?;
    Ok(())
}

pub async fn add_image_custom_package(
    db: &Database,
    image_id: i64,
    custom_package_id: i64,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO images_custom_packages (image_id, custom_package_id) VALUES ($1, $2)")
        .bind(image_id)
        .bind(custom_package_id)
        .execute(db.pool())
        .await?;
    Ok(())
}

pub async fn insert_installer(
    db: &Database,
    id: i64,
    status: BuildStatus,
    iso_url: &str,
) -> Result<(), sqlx::Error> {
    sqlx::query("INSERT INTO installers (id, org_id, status, iso_url) VALUES ($1, $2, $3, $4)")
        .bind(id)
        .bind(TEST_ORG)
        .bind(status.as_str())
        .bind(iso_url)
        .execute(db.pool())
        .await?;
    Ok(())
}

pub async fn insert_image_set(
    db: &Database,
    id: i64,
    deleted_at: Option<String>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO image_sets (id, org_id, name, created_at, deleted_at) VALUES ($1, $2, $3, $4, $5)",
    )
    .bind(id)
    .bind(TEST_ORG)
    .bind(format!("set-{id}"))
    .bind(timestamp_now())
    .bind(deleted_at)
    .execute(db.pool())
    .await?;
    Ok(())
}

/// Row count of a fixture table. Assertion helper; `table` must be a
/// literal from the schema, never user input.
pub async fn count(db: &Database, table: &str) -> i64 {
    let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {table}"))
        .fetch_one(db.pool())
        .await
        .unwrap_or_else(|e| panic!("count {table}: {e}"));
    row.try_get("n").expect("count column")
}

/// Whether a row with the given primary key still exists.
pub async fn row_exists(db: &Database, table: &str, id: i64) -> bool {
    let row = sqlx::query(&format!("SELECT COUNT(*) AS n FROM {table} WHERE id = $1"))
        .bind(id)
        .fetch_one(db.pool())
        .await
        .unwrap_or_else(|e| panic!("row_exists {table}: {e}"));
    let n: i64 = row.try_get("n").expect("count column");
    n > 0
}

/// Status column of a row, parsed.
pub async fn row_status(db: &Database, table: &str, id: i64) -> Option<BuildStatus> {
    let row = sqlx::query(&format!("SELECT status FROM {table} WHERE id = $1"))
        .bind(id)
        .fetch_one(db.pool())
        .await
        .unwrap_or_else(|e| panic!("row_status {table}: {e}"));
    let status: String = row.try_get("status").expect("status column");
    BuildStatus::parse(&status)
}
