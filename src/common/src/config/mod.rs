use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};

/// Relational store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// DSN of the fleet database (PostgreSQL or SQLite).
    ///
    /// Env: EDGEFLEET__DATABASE__DSN
    pub dsn: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("sqlite://.data/edgefleet.db"),
        }
    }
}

/// Object storage configuration for build artifacts.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageConfig {
    /// DSN of the artifact bucket (`s3://`, `file://` or `memory://`).
    ///
    /// Env: EDGEFLEET__STORAGE__DSN
    pub dsn: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            dsn: String::from("file://.data/artifacts"),
        }
    }
}

/// Pagination bounds for one cleanup job.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct PageConfig {
    /// Candidates fetched (and workers spawned) per page.
    pub page_size: u32,
    /// Safety ceiling on pages per run, guarding against candidates being
    /// regenerated faster than they are consumed.
    pub max_pages: u32,
}

impl PageConfig {
    const fn new(page_size: u32) -> Self {
        Self {
            page_size,
            max_pages: 1000,
        }
    }
}

/// Image retention policy for the soft-delete stage.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetentionConfig {
    /// Unused images older than this are soft-deleted.
    ///
    /// Env: EDGEFLEET__CLEANUP__RETENTION__OLDER_THAN
    #[serde(with = "humantime_serde")]
    pub older_than: Duration,

    /// Image name prefixes exempt from retention, matched
    /// case-insensitively.
    ///
    /// Env: EDGEFLEET__CLEANUP__RETENTION__KEEP_PREFIXES
    #[serde(default)]
    pub keep_prefixes: Vec<String>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            older_than: Duration::from_secs(7 * 24 * 3600),
            keep_prefixes: Vec::new(),
        }
    }
}

/// Knobs of the reclamation pipeline.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanupConfig {
    /// Attempts per remote storage deletion before giving up.
    ///
    /// Env: EDGEFLEET__CLEANUP__DELETE_ATTEMPTS
    pub delete_attempts: u32,

    /// Fixed delay between storage deletion attempts.
    ///
    /// Env: EDGEFLEET__CLEANUP__DELETE_RETRY_DELAY
    #[serde(with = "humantime_serde")]
    pub delete_retry_delay: Duration,

    /// Device cleanup pagination (shared by the orphan device-update pass).
    pub devices: PageConfig,
    /// Image cleanup pagination.
    pub images: PageConfig,
    /// Orphan-commit sweep pagination.
    pub commits: PageConfig,

    /// Image retention policy.
    pub retention: RetentionConfig,

    /// Compatibility option for deployments that still keep old-commit
    /// history in `updatetransaction_commits`: when set, the orphan-commit
    /// sweep leaves commits referenced from that table alone. Which
    /// deployments still need this is pending product clarification.
    ///
    /// Env: EDGEFLEET__CLEANUP__PRESERVE_UPDATE_HISTORY
    #[serde(default)]
    pub preserve_update_history: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            delete_attempts: 10,
            delete_retry_delay: Duration::from_secs(5),
            devices: PageConfig::new(100),
            images: PageConfig::new(30),
            commits: PageConfig::new(45),
            retention: RetentionConfig::default(),
            preserve_update_history: false,
        }
    }
}

/// Feature gating for the pipeline stages.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeatureConfig {
    /// Whether flags absent from `enabled` count as on.
    ///
    /// Env: EDGEFLEET__FEATURES__DEFAULT_ENABLED
    pub default_enabled: bool,

    /// Per-flag overrides, keyed by flag name.
    #[serde(default)]
    pub enabled: HashMap<String, bool>,
}

impl Default for FeatureConfig {
    fn default() -> Self {
        Self {
            default_enabled: true,
            enabled: HashMap::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default)]
pub struct Configuration {
    /// Relational store holding the fleet schema.
    pub database: DatabaseConfig,
    /// Remote object storage holding build artifacts.
    pub storage: StorageConfig,
    /// Reclamation pipeline knobs.
    pub cleanup: CleanupConfig,
    /// Stage feature flags.
    pub features: FeatureConfig,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cleanup.delete_attempts must be at least 1")]
    InvalidDeleteAttempts,
    #[error("cleanup.{job}.page_size must be at least 1")]
    InvalidPageSize { job: &'static str },
    #[error("cleanup.{job}.max_pages must be at least 1")]
    InvalidMaxPages { job: &'static str },
    #[error("cleanup.retention.older_than must be positive")]
    InvalidRetentionWindow,
}

impl Configuration {
    /// Load configuration from `edgefleet.toml` and the environment.
    pub fn load() -> Result<Self, Box<figment::Error>> {
        Self::load_from_path(Path::new("edgefleet.toml"))
    }

    /// Load configuration from a specific TOML file and the environment.
    pub fn load_from_path(path: &Path) -> Result<Self, Box<figment::Error>> {
        let config = Figment::from(Serialized::defaults(Configuration::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("EDGEFLEET__").split("__"))
            .extract()
            .map_err(Box::new)?;

        Ok(config)
    }

    /// Validate the pagination and retry knobs.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.cleanup.validate()
    }
}

impl CleanupConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.delete_attempts == 0 {
            return Err(ConfigError::InvalidDeleteAttempts);
        }

        for (job, pages) in [
            ("devices", self.devices),
            ("images", self.images),
            ("commits", self.commits),
        ] {
            if pages.page_size == 0 {
                return Err(ConfigError::InvalidPageSize { job });
            }
            if pages.max_pages == 0 {
                return Err(ConfigError::InvalidMaxPages { job });
            }
        }

        if self.retention.older_than.is_zero() {
            return Err(ConfigError::InvalidRetentionWindow);
        }

        Ok(())
    }
}
