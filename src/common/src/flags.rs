//! Feature gating for the cleanup stages.
//!
//! The flag service proper is an external collaborator; only its
//! `is_enabled` contract is modeled here. Flags are re-checked at every
//! page boundary, so flipping one mid-run stops a job before its next page.

use std::collections::HashMap;

use crate::config::FeatureConfig;

/// Boolean gate consulted per job and per page.
pub trait FeatureGate: Send + Sync {
    fn is_enabled(&self, flag: &str) -> bool;
}

/// Gate backed by the `[features]` configuration table. An environment
/// variable (`EDGEFLEET_FEATURE_<FLAG>`, upper-cased, `-` mapped to `_`)
/// set to `true`/`1` is always an alternative "on" signal, regardless of
/// the configured value.
pub struct ConfigFlags {
    default_enabled: bool,
    enabled: HashMap<String, bool>,
}

impl ConfigFlags {
    pub fn new(config: &FeatureConfig) -> Self {
        Self {
            default_enabled: config.default_enabled,
            enabled: config.enabled.clone(),
        }
    }

    /// Environment variable name carrying the override for `flag`.
    pub fn env_var(flag: &str) -> String {
        let flag = flag
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_uppercase()
                } else {
                    '_'
                }
            })
            .collect::<String>();
        format!("EDGEFLEET_FEATURE_{flag}")
    }

    fn env_override(flag: &str) -> bool {
        matches!(
            std::env::var(Self::env_var(flag)).ok().as_deref(),
            Some("1") | Some("true") | Some("TRUE") | Some("True")
        )
    }
}

impl FeatureGate for ConfigFlags {
    fn is_enabled(&self, flag: &str) -> bool {
        Self::env_override(flag)
            || self
                .enabled
                .get(flag)
                .copied()
                .unwrap_or(self.default_enabled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(default_enabled: bool, enabled: &[(&str, bool)]) -> FeatureConfig {
        FeatureConfig {
            default_enabled,
            enabled: enabled
                .iter()
                .map(|(k, v)| (k.to_string(), *v))
                .collect(),
        }
    }

    #[test]
    fn test_config_table() {
        let flags = ConfigFlags::new(&config(true, &[("cleanup-devices", false)]));
        assert!(!flags.is_enabled("cleanup-devices"));
        assert!(flags.is_enabled("cleanup-images"));

        let flags = ConfigFlags::new(&config(false, &[("cleanup-devices", true)]));
        assert!(flags.is_enabled("cleanup-devices"));
        assert!(!flags.is_enabled("cleanup-images"));
    }

    #[test]
    fn test_env_var_name() {
        assert_eq!(
            ConfigFlags::env_var("cleanup-orphan-commits"),
            "EDGEFLEET_FEATURE_CLEANUP_ORPHAN_COMMITS"
        );
    }

    #[test]
    fn test_env_override_wins() {
        let var = ConfigFlags::env_var("cleanup-flagtest");
        // SAFETY: no other thread in this test binary reads this variable.
        unsafe { std::env::set_var(&var, "true") };

        let flags = ConfigFlags::new(&config(false, &[("cleanup-flagtest", false)]));
        assert!(flags.is_enabled("cleanup-flagtest"));

        unsafe { std::env::remove_var(&var) };
        assert!(!flags.is_enabled("cleanup-flagtest"));
    }
}
