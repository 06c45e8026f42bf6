//! Assets pre-populated into every fresh cache generation.

use offline_common::OfflineConfig;
use url::Url;

use crate::ServiceWorkerError;

/// Ordered, duplicate-free list of assets fetched at install time.
///
/// The manifest seeds the cache; anything else is cached lazily on first
/// successful fetch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssetManifest {
    urls: Vec<Url>,
}

impl AssetManifest {
    /// Build a manifest from absolute URLs, keeping the first occurrence of each.
    pub fn new(urls: impl IntoIterator<Item = Url>) -> Self {
        let mut manifest = Self::default();
        for url in urls {
            if !manifest.urls.contains(&url) {
                manifest.urls.push(url);
            }
        }
        manifest
    }

    /// Resolve relative paths against the deployment root.
    pub fn from_paths<S: AsRef<str>>(base: &Url, paths: &[S]) -> Result<Self, ServiceWorkerError> {
        let urls = paths
            .iter()
            .map(|p| {
                base.join(p.as_ref()).map_err(|e| {
                    ServiceWorkerError::ScriptError(format!("bad manifest path '{}': {}", p.as_ref(), e))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self::new(urls))
    }

    /// Manifest declared in the deployment configuration.
    pub fn from_config(config: &OfflineConfig) -> Result<Self, ServiceWorkerError> {
        Ok(Self::new(config.manifest_urls()?))
    }

    pub fn urls(&self) -> &[Url] {
        &self.urls
    }

    pub fn len(&self) -> usize {
        self.urls.len()
    }

    pub fn is_empty(&self) -> bool {
        self.urls.is_empty()
    }

    pub fn contains(&self, url: &Url) -> bool {
        self.urls.contains(url)
    }
}
