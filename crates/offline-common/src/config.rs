//! Deployment configuration

use crate::{OfflineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use url::Url;

/// Deployment configuration shared by the background script and the page.
///
/// Relative paths (`scope`, `script`, `manifest`, `navigation_fallback`) are
/// resolved against `base_url`, the directory the application is deployed to.
/// Bumping `version` is the only thing that invalidates the offline cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineConfig {
    /// Deployment root, e.g. `https://example.github.io/app/`
    pub base_url: String,

    /// Prefix shared by every cache generation of this application
    pub cache_prefix: String,

    /// Version baked into the background script at deploy time
    pub version: String,

    /// Directory controlled by the background script
    pub scope: String,

    /// Background script path
    pub script: String,

    /// Assets fetched into a fresh generation at install time
    pub manifest: Vec<String>,

    /// Document served for navigations when the network is unavailable
    pub navigation_fallback: String,

    /// Seconds between update checks
    pub update_interval_secs: u64,

    /// Seconds before the "installed" notice dismisses itself
    pub installed_notice_secs: u64,

    /// Milliseconds between a notice starting to dismiss and its removal
    pub notice_exit_millis: u64,

    /// Activate a freshly installed script without waiting for the page
    pub skip_waiting_on_install: bool,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost/".to_string(),
            cache_prefix: "DeltaF-".to_string(),
            version: "v1.0.0".to_string(),
            scope: "./".to_string(),
            script: "./sw.js".to_string(),
            manifest: vec![
                "./".to_string(),
                "./index.html".to_string(),
                "./manifest.json".to_string(),
                "./icon.svg".to_string(),
            ],
            navigation_fallback: "./index.html".to_string(),
            update_interval_secs: 60,
            installed_notice_secs: 5,
            notice_exit_millis: 300,
            skip_waiting_on_install: false,
        }
    }
}

impl OfflineConfig {
    /// Parse and validate a JSON configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| {
            OfflineError::config_with_source(format!("cannot read {}", path.display()), e)
        })?;
        Self::from_json_str(&raw)
    }

    /// Check the invariants the rest of the system relies on.
    pub fn validate(&self) -> Result<()> {
        let base = self.base()?;
        if !matches!(base.scheme(), "http" | "https") {
            return Err(OfflineError::config(format!(
                "base_url must be http or https, got '{}'",
                base.scheme()
            )));
        }
        if self.version.trim().is_empty() {
            return Err(OfflineError::config("version must not be empty"));
        }
        if self.update_interval_secs == 0 {
            return Err(OfflineError::config("update_interval_secs must be positive"));
        }

        let fallback = self.fallback_url()?;
        if !self.manifest_urls()?.contains(&fallback) {
            return Err(OfflineError::config(format!(
                "navigation fallback '{}' is not listed in the manifest",
                self.navigation_fallback
            )));
        }
        Ok(())
    }

    /// Name of the cache generation owned by this version.
    pub fn cache_name(&self) -> String {
        format!("{}{}", self.cache_prefix, self.version)
    }

    /// Deployment root as a URL.
    pub fn base(&self) -> Result<Url> {
        Url::parse(&self.base_url)
            .map_err(|e| OfflineError::InvalidUrl(format!("{}: {}", self.base_url, e)))
    }

    /// Scope controlled by the background script.
    pub fn scope_url(&self) -> Result<Url> {
        self.resolve(&self.scope)
    }

    /// Location of the background script.
    pub fn script_url(&self) -> Result<Url> {
        self.resolve(&self.script)
    }

    /// Navigation fallback document.
    pub fn fallback_url(&self) -> Result<Url> {
        self.resolve(&self.navigation_fallback)
    }

    /// Manifest entries resolved in order.
    pub fn manifest_urls(&self) -> Result<Vec<Url>> {
        self.manifest.iter().map(|path| self.resolve(path)).collect()
    }

    /// Update check interval.
    pub fn update_interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }

    /// Auto-dismiss delay of the "installed" notice.
    pub fn installed_notice_delay(&self) -> Duration {
        Duration::from_secs(self.installed_notice_secs)
    }

    /// Exit phase of a dismissed notice.
    pub fn notice_exit_delay(&self) -> Duration {
        Duration::from_millis(self.notice_exit_millis)
    }

    fn resolve(&self, path: &str) -> Result<Url> {
        self.base()?
            .join(path)
            .map_err(|e| OfflineError::InvalidUrl(format!("{}: {}", path, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = OfflineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.cache_name(), "DeltaF-v1.0.0");
        assert_eq!(config.update_interval(), Duration::from_secs(60));
    }

    #[test]
    fn test_paths_resolve_against_deployment_root() {
        let config = OfflineConfig {
            base_url: "https://example.github.io/app/".to_string(),
            ..Default::default()
        };

        assert_eq!(
            config.scope_url().unwrap().as_str(),
            "https://example.github.io/app/"
        );
        assert_eq!(
            config.script_url().unwrap().as_str(),
            "https://example.github.io/app/sw.js"
        );
        let manifest = config.manifest_urls().unwrap();
        assert_eq!(manifest[1].as_str(), "https://example.github.io/app/index.html");
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = OfflineConfig::from_json_str(
            r#"{ "base_url": "https://example.com/", "version": "v2" }"#,
        )
        .unwrap();
        assert_eq!(config.version, "v2");
        assert_eq!(config.cache_name(), "DeltaF-v2");
        assert_eq!(config.manifest.len(), 4);
    }

    #[test]
    fn test_fallback_must_be_in_manifest() {
        let config = OfflineConfig {
            manifest: vec!["./".to_string()],
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(OfflineError::Config { .. })
        ));
    }

    #[test]
    fn test_rejects_zero_interval_and_empty_version() {
        let config = OfflineConfig {
            update_interval_secs: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = OfflineConfig {
            version: " ".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_non_http_base() {
        let config = OfflineConfig {
            base_url: "file:///srv/app/".to_string(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_missing_file() {
        let err = OfflineConfig::load("/definitely/not/here.json").unwrap_err();
        assert_eq!(err.category(), "config");
    }
}
