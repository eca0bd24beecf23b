//! Configuration loaded from environment variables.

use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};

use crate::cache::CacheConfig;
use crate::menu::MenuCatalog;
use crate::permissions::PermissionTable;

/// Application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Permission table file (TOML or YAML). Built-in table when unset.
    pub permissions_file: Option<PathBuf>,

    /// Menu catalog file (TOML or YAML). Built-in catalog when unset.
    pub catalog_file: Option<PathBuf>,

    /// Base URL of the menu API. Required for syncing.
    pub api_url: Option<String>,

    /// Default cache entry TTL in seconds (default: 300).
    pub cache_ttl_secs: u64,

    /// Maximum cache entries (default: 10000).
    pub cache_max_entries: usize,

    /// Hit rate below which the cache reports unhealthy (default: 0.5).
    pub cache_health_threshold: f64,

    /// Lookups required before health is judged (default: 20).
    pub cache_min_samples: u64,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration through `lookup`, which maps a variable name to its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let permissions_file = lookup("WORDNAV_PERMISSIONS_FILE").map(PathBuf::from);
        let catalog_file = lookup("WORDNAV_CATALOG_FILE").map(PathBuf::from);
        let api_url = lookup("WORDNAV_API_URL").filter(|u| !u.trim().is_empty());

        let cache_ttl_secs = lookup("WORDNAV_CACHE_TTL_SECS")
            .unwrap_or_else(|| "300".to_string())
            .parse()
            .context("WORDNAV_CACHE_TTL_SECS must be a valid u64")?;

        let cache_max_entries = lookup("WORDNAV_CACHE_MAX_ENTRIES")
            .unwrap_or_else(|| "10000".to_string())
            .parse()
            .context("WORDNAV_CACHE_MAX_ENTRIES must be a valid usize")?;

        let cache_health_threshold: f64 = lookup("WORDNAV_CACHE_HEALTH_THRESHOLD")
            .unwrap_or_else(|| "0.5".to_string())
            .parse()
            .context("WORDNAV_CACHE_HEALTH_THRESHOLD must be a number")?;
        anyhow::ensure!(
            (0.0..=1.0).contains(&cache_health_threshold),
            "WORDNAV_CACHE_HEALTH_THRESHOLD must be between 0 and 1"
        );

        let cache_min_samples = lookup("WORDNAV_CACHE_MIN_SAMPLES")
            .unwrap_or_else(|| "20".to_string())
            .parse()
            .context("WORDNAV_CACHE_MIN_SAMPLES must be a valid u64")?;

        Ok(Self {
            permissions_file,
            catalog_file,
            api_url,
            cache_ttl_secs,
            cache_max_entries,
            cache_health_threshold,
            cache_min_samples,
        })
    }

    /// Cache settings.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            default_ttl: Duration::from_secs(self.cache_ttl_secs),
            max_entries: self.cache_max_entries,
            health_threshold: self.cache_health_threshold,
            min_samples: self.cache_min_samples,
        }
    }

    /// The configured permission table, or the built-in one.
    pub fn permission_table(&self) -> Result<PermissionTable> {
        match &self.permissions_file {
            Some(path) => PermissionTable::load(path)
                .with_context(|| format!("failed to load permission table {}", display(path))),
            None => Ok(PermissionTable::builtin()),
        }
    }

    /// The configured menu catalog, or the built-in one.
    pub fn catalog(&self) -> Result<MenuCatalog> {
        match &self.catalog_file {
            Some(path) => MenuCatalog::load(path)
                .with_context(|| format!("failed to load menu catalog {}", display(path))),
            None => Ok(MenuCatalog::builtin()),
        }
    }

    /// The API URL, or an error naming the variable to set.
    pub fn require_api_url(&self) -> Result<&str> {
        self.api_url
            .as_deref()
            .context("WORDNAV_API_URL environment variable is required")
    }
}

fn display(path: &Path) -> String {
    path.display().to_string()
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_apply_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.cache_ttl_secs, 300);
        assert_eq!(config.cache_max_entries, 10_000);
        assert_eq!(config.cache_min_samples, 20);
        assert!(config.api_url.is_none());
        assert!(config.require_api_url().is_err());
        assert!(config.permission_table().is_ok());
        assert!(config.catalog().is_ok());
    }

    #[test]
    fn values_are_parsed() {
        let config = Config::from_lookup(lookup(&[
            ("WORDNAV_API_URL", "http://localhost:8000/api"),
            ("WORDNAV_CACHE_TTL_SECS", "60"),
            ("WORDNAV_CACHE_HEALTH_THRESHOLD", "0.8"),
        ]))
        .unwrap();
        assert_eq!(config.require_api_url().unwrap(), "http://localhost:8000/api");
        assert_eq!(config.cache_config().default_ttl, Duration::from_secs(60));
        assert!((config.cache_health_threshold - 0.8).abs() < f64::EPSILON);
    }

    #[test]
    fn invalid_values_are_rejected() {
        let err = Config::from_lookup(lookup(&[("WORDNAV_CACHE_TTL_SECS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("WORDNAV_CACHE_TTL_SECS"));
        assert!(Config::from_lookup(lookup(&[("WORDNAV_CACHE_HEALTH_THRESHOLD", "2")])).is_err());
    }

    #[test]
    fn missing_permission_file_is_reported() {
        let config = Config::from_lookup(lookup(&[(
            "WORDNAV_PERMISSIONS_FILE",
            "/nonexistent/permissions.toml",
        )]))
        .unwrap();
        let err = config.permission_table().unwrap_err();
        assert!(format!("{err:#}").contains("permissions.toml"));
    }
}
