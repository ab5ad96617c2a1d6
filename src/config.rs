//! Configuration Module
//!
//! Recognized cache options and their eager validation.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use crate::cache::HASH_HEX_LEN;
use crate::error::{CacheError, Result};

// == Limits ==
/// Maximum accepted TTL. Catches unit mistakes (milliseconds passed where
/// seconds were meant) long before a deadline a year out would reveal them.
pub const MAX_TTL: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Ceiling on `base_path` + separator + filename, per the most restrictive
/// host filesystem (Windows MAX_PATH).
pub const MAX_PATH_LEN: usize = 260;

/// Cache configuration.
///
/// All options have defaults; `FileCacheBuilder::build` validates the
/// combination eagerly and rejects invalid ones as [`CacheError::Config`].
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cache directory; relative paths resolve against the process working
    /// directory at build time
    pub base_path: PathBuf,
    /// Fixed duration of inactivity after which an entry is evicted
    pub ttl: Duration,
    /// Accept TTLs that are not whole seconds
    pub allow_subsecond_ttl: bool,
    /// Defer the directory scan to an explicit `init().await`
    pub skip_initial_scan: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("./cache"),
            ttl: Duration::from_secs(30 * 24 * 60 * 60),
            allow_subsecond_ttl: false,
            skip_initial_scan: false,
        }
    }
}

impl CacheConfig {
    // == Validation ==
    /// Checks the TTL against granularity and range rules.
    pub(crate) fn validate_ttl(&self) -> Result<()> {
        if self.ttl.subsec_nanos() != 0 && !self.allow_subsecond_ttl {
            return Err(CacheError::Config(
                "ttl must be a whole number of seconds (set allow_subsecond_ttl to override)"
                    .to_string(),
            ));
        }
        if self.ttl > MAX_TTL {
            return Err(CacheError::Config(format!(
                "ttl exceeds the maximum of {} seconds",
                MAX_TTL.as_secs()
            )));
        }
        Ok(())
    }

    /// Resolves `base_path` against the working directory and checks that a
    /// full entry path stays under [`MAX_PATH_LEN`].
    pub(crate) fn resolved_base_path(&self) -> Result<PathBuf> {
        let resolved = if self.base_path.is_absolute() {
            self.base_path.clone()
        } else {
            env::current_dir()
                .map_err(|e| CacheError::Config(format!("cannot resolve working directory: {e}")))?
                .join(&self.base_path)
        };

        let full_len = resolved.as_os_str().len() + 1 + HASH_HEX_LEN;
        if full_len > MAX_PATH_LEN {
            return Err(CacheError::Config(format!(
                "base_path is too long: entry paths would be {} bytes (limit {})",
                full_len, MAX_PATH_LEN
            )));
        }
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = CacheConfig::default();
        assert_eq!(config.base_path, PathBuf::from("./cache"));
        assert_eq!(config.ttl, Duration::from_secs(30 * 24 * 60 * 60));
        assert!(!config.allow_subsecond_ttl);
        assert!(!config.skip_initial_scan);
    }

    #[test]
    fn test_subsecond_ttl_rejected() {
        let config = CacheConfig {
            ttl: Duration::from_millis(1500),
            ..Default::default()
        };
        assert!(matches!(
            config.validate_ttl(),
            Err(CacheError::Config(_))
        ));
    }

    #[test]
    fn test_subsecond_ttl_allowed_with_override() {
        let config = CacheConfig {
            ttl: Duration::from_millis(1500),
            allow_subsecond_ttl: true,
            ..Default::default()
        };
        assert!(config.validate_ttl().is_ok());
    }

    #[test]
    fn test_ttl_above_maximum_rejected() {
        let config = CacheConfig {
            ttl: MAX_TTL + Duration::from_secs(1),
            ..Default::default()
        };
        assert!(matches!(
            config.validate_ttl(),
            Err(CacheError::Config(_))
        ));
    }

    #[test]
    fn test_relative_base_path_resolves_to_absolute() {
        let config = CacheConfig::default();
        let resolved = config.resolved_base_path().unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("cache"));
    }

    #[test]
    fn test_overlong_base_path_rejected() {
        let long = "x".repeat(MAX_PATH_LEN);
        let config = CacheConfig {
            base_path: PathBuf::from(format!("/{long}")),
            ..Default::default()
        };
        assert!(matches!(
            config.resolved_base_path(),
            Err(CacheError::Config(_))
        ));
    }
}
