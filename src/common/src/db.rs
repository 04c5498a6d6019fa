use sqlx::AnyPool;
use sqlx::any::{AnyPoolOptions, install_default_drivers};

/// The fleet schema tables touched by reclamation. DDL is written in the
/// portable subset accepted by both PostgreSQL and SQLite: BIGINT ids,
/// TEXT status columns, RFC 3339 TEXT timestamps. Rows are created by the
/// build and update subsystems; this service only mutates and deletes them.
const SCHEMA: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS devices (
        id BIGINT PRIMARY KEY,
        uuid TEXT NOT NULL,
        org_id TEXT NOT NULL,
        name TEXT,
        image_id BIGINT,
        created_at TEXT NOT NULL,
        deleted_at TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS device_groups (
        id BIGINT PRIMARY KEY,
        org_id TEXT NOT NULL,
        name TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS device_groups_devices (
        device_group_id BIGINT NOT NULL,
        device_id BIGINT NOT NULL,
        PRIMARY KEY (device_group_id, device_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS dispatch_records (
        id BIGINT PRIMARY KEY,
        device_id BIGINT NOT NULL,
        status TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS update_transactions (
        id BIGINT PRIMARY KEY,
        org_id TEXT NOT NULL,
        commit_id BIGINT,
        repo_id BIGINT,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS updatetransaction_devices (
        update_transaction_id BIGINT NOT NULL,
        device_id BIGINT NOT NULL,
        PRIMARY KEY (update_transaction_id, device_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS updatetransaction_commits (
        update_transaction_id BIGINT NOT NULL,
        commit_id BIGINT NOT NULL,
        PRIMARY KEY (update_transaction_id, commit_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS updatetransaction_dispatchrecords (
        update_transaction_id BIGINT NOT NULL,
        dispatch_record_id BIGINT NOT NULL,
        PRIMARY KEY (update_transaction_id, dispatch_record_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS commits (
        id BIGINT PRIMARY KEY,
        org_id TEXT NOT NULL,
        repo_id BIGINT,
        status TEXT NOT NULL,
        tar_url TEXT NOT NULL,
        created_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS commit_installed_packages (
        commit_id BIGINT NOT NULL,
        installed_package_id BIGINT NOT NULL,
        PRIMARY KEY (commit_id, installed_package_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS repos (
        id BIGINT PRIMARY KEY,
        url TEXT NOT NULL,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS images (
        id BIGINT PRIMARY KEY,
        org_id TEXT NOT NULL,
        name TEXT NOT NULL,
        version BIGINT NOT NULL,
        commit_id BIGINT NOT NULL,
        installer_id BIGINT,
        image_set_id BIGINT,
        status TEXT NOT NULL,
        created_at TEXT NOT NULL,
        deleted_at TEXT
    )"#,
    r#"CREATE TABLE IF NOT EXISTS images_packages (
        image_id BIGINT NOT NULL,
        package_id BIGINT NOT NULL,
        PRIMARY KEY (image_id, package_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS images_repos (
        image_id BIGINT NOT NULL,
        third_party_repo_id BIGINT NOT NULL,
        PRIMARY KEY (image_id, third_party_repo_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS images_custom_packages (
        image_id BIGINT NOT NULL,
        custom_package_id BIGINT NOT NULL,
        PRIMARY KEY (image_id, custom_package_id)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS installers (
        id BIGINT PRIMARY KEY,
        org_id TEXT NOT NULL,
        status TEXT NOT NULL,
        iso_url TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS image_sets (
        id BIGINT PRIMARY KEY,
        org_id TEXT NOT NULL,
        name TEXT NOT NULL,
        created_at TEXT NOT NULL,
        deleted_at TEXT
    )"#,
];

/// Handle to the fleet database (PostgreSQL or SQLite).
///
/// Both backends are served by one code path through sqlx's `Any` driver;
/// every query in this workspace is written with `$N` placeholders, which
/// both backends accept.
#[derive(Clone)]
pub struct Database {
    pool: AnyPool,
}

impl Database {
    /// Connect to the fleet database.
    pub async fn connect(dsn: &str) -> Result<Self, sqlx::Error> {
        install_default_drivers();

        tracing::info!(dsn, "connecting to fleet database");

        let pool = if let Some(rest) = dsn.strip_prefix("sqlite:") {
            // Add mode=rwc so the database file is created on first run.
            let dsn_with_create = if rest == ":memory:" || dsn.contains("mode=") {
                dsn.to_string()
            } else if dsn.contains('?') {
                format!("{dsn}&mode=rwc")
            } else {
                format!("{dsn}?mode=rwc")
            };

            // One connection only: an in-memory SQLite database exists per
            // connection, and a single writer sidesteps SQLITE_BUSY when a
            // page fans out.
            AnyPoolOptions::new()
                .max_connections(1)
                .connect(&dsn_with_create)
                .await?
        } else {
            AnyPoolOptions::new().connect(dsn).await?
        };

        Ok(Self { pool })
    }

    /// In-memory SQLite database with the schema applied. Test constructor.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        let db = Self::connect("sqlite::memory:").await?;
        db.ensure_schema().await?;
        Ok(db)
    }

    /// Create the fleet tables if they do not exist. Idempotent; the schema
    /// is owned by the wider backend, so nothing here alters existing
    /// tables.
    pub async fn ensure_schema(&self) -> Result<(), sqlx::Error> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &AnyPool {
        &self.pool
    }
}
