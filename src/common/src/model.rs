//! Shared vocabulary of the fleet cleanup schema.
//!
//! Timestamps are stored as RFC 3339 TEXT so the same SQL serves both
//! database backends; the helpers here produce the canonical encoding.

use std::fmt;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};

/// Build lifecycle of an artifact-producing row (repo, commit, installer,
/// image). `StorageCleaned` is terminal: the remote content is gone and the
/// row's URL has been cleared.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BuildStatus {
    Pending,
    Building,
    Success,
    Error,
    StorageCleaned,
}

impl BuildStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Building => "BUILDING",
            Self::Success => "SUCCESS",
            Self::Error => "ERROR",
            Self::StorageCleaned => "STORAGE_CLEANED",
        }
    }

    /// Parse a status column value; unknown values map to `None` so callers
    /// treat them as not actionable rather than guessing.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "PENDING" => Some(Self::Pending),
            "BUILDING" => Some(Self::Building),
            "SUCCESS" => Some(Self::Success),
            "ERROR" => Some(Self::Error),
            "STORAGE_CLEANED" => Some(Self::StorageCleaned),
            _ => None,
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Current instant in the canonical column encoding.
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Instant `age` before now, in the canonical column encoding. Used for
/// retention cutoffs; the fixed format makes `<` comparisons on the column
/// equivalent to instant comparisons.
pub fn timestamp_before(age: Duration) -> String {
    let age = chrono::Duration::from_std(age).unwrap_or(chrono::Duration::MAX);
    (Utc::now() - age).to_rfc3339_opts(SecondsFormat::Micros, true)
}
