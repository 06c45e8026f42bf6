//! Cache population, pruning, and request resolution.

use futures::future::{join_all, try_join_all};
use http::Method;
use offline_common::OfflineConfig;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, info, trace, warn};
use url::{Origin, Url};

use crate::cache::CacheStorage;
use crate::fetch::Fetcher;
use crate::manifest::AssetManifest;
use crate::request::{Request, RequestKey, Response};
use crate::ServiceWorkerError;

/// How an intercepted request was answered.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    /// Not intercepted; the host performs the request itself.
    Passthrough,
    /// Served from the current generation without touching the network.
    Cache(Response),
    /// Fetched from the network.
    Network(Response),
    /// Network failed on a navigation; the cached entry document was served.
    Fallback(Response),
    /// Network failed and nothing could be served.
    Unresolved(ServiceWorkerError),
}

impl FetchOutcome {
    /// The response handed back to the page, if any.
    pub fn response(&self) -> Option<&Response> {
        match self {
            FetchOutcome::Cache(r) | FetchOutcome::Network(r) | FetchOutcome::Fallback(r) => {
                Some(r)
            }
            FetchOutcome::Passthrough | FetchOutcome::Unresolved(_) => None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        matches!(self, FetchOutcome::Passthrough)
    }

    /// Short label for logs and reports.
    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Passthrough => "passthrough",
            FetchOutcome::Cache(_) => "cache",
            FetchOutcome::Network(_) => "network",
            FetchOutcome::Fallback(_) => "fallback",
            FetchOutcome::Unresolved(_) => "unresolved",
        }
    }
}

/// Result of pruning at activation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    /// Generation that survived.
    pub current: String,
    /// Generations that were deleted.
    pub deleted: Vec<String>,
}

/// Owns one cache generation and answers intercepted requests from it.
pub struct CacheManager {
    cache_name: String,
    origin: Origin,
    manifest: AssetManifest,
    fallback: RequestKey,
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    writes: Mutex<JoinSet<()>>,
}

impl CacheManager {
    /// Create a manager for generation `cache_name` of an app served from `origin`.
    pub fn new(
        cache_name: impl Into<String>,
        origin: &Url,
        manifest: AssetManifest,
        fallback: &Url,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            cache_name: cache_name.into(),
            origin: origin.origin(),
            manifest,
            fallback: RequestKey::get(fallback),
            storage,
            fetcher,
            writes: Mutex::new(JoinSet::new()),
        }
    }

    /// Create a manager from the deployment configuration.
    pub fn from_config(
        config: &OfflineConfig,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, ServiceWorkerError> {
        Ok(Self::new(
            config.cache_name(),
            &config.base()?,
            AssetManifest::from_config(config)?,
            &config.fallback_url()?,
            storage,
            fetcher,
        ))
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn manifest(&self) -> &AssetManifest {
        &self.manifest
    }

    /// Fetch every manifest asset, then commit them to the generation in one batch.
    ///
    /// Any failed or unusable fetch aborts the install before the generation is
    /// touched. Returns the number of entries committed.
    pub async fn install(&self) -> Result<usize, ServiceWorkerError> {
        info!(
            cache = %self.cache_name,
            assets = self.manifest.len(),
            "Installing cache generation"
        );

        let entries = try_join_all(self.manifest.urls().iter().map(|url| self.fetch_asset(url)))
            .await
            .inspect_err(|e| warn!(cache = %self.cache_name, error = %e, "Install aborted"))?;

        let existed = self
            .storage
            .has(&self.cache_name)
            .await
            .map_err(|e| ServiceWorkerError::InstallFailed(e.to_string()))?;
        let cache = self
            .storage
            .open(&self.cache_name)
            .await
            .map_err(|e| ServiceWorkerError::InstallFailed(e.to_string()))?;

        let count = entries.len();
        if let Err(err) = cache.put_all(entries).await {
            warn!(cache = %self.cache_name, error = %err, "Committing install failed");
            if !existed {
                if let Err(e) = self.storage.delete(&self.cache_name).await {
                    warn!(cache = %self.cache_name, error = %e, "Discarding partial generation failed");
                }
            }
            return Err(ServiceWorkerError::InstallFailed(err.to_string()));
        }

        info!(cache = %self.cache_name, entries = count, "Cache generation populated");
        Ok(count)
    }

    async fn fetch_asset(&self, url: &Url) -> Result<(RequestKey, Response), ServiceWorkerError> {
        let request = Request::get(url.clone());
        let response = self
            .fetcher
            .fetch(&request)
            .await
            .map_err(|e| ServiceWorkerError::InstallFailed(format!("{}: {}", url, e)))?;

        if !response.is_cacheable() {
            return Err(ServiceWorkerError::InstallFailed(format!(
                "{}: unusable response (status {}, {:?}, redirected: {})",
                url, response.status, response.response_type, response.redirected
            )));
        }
        Ok((request.key(), response))
    }

    /// Delete every generation except the current one. Idempotent.
    pub async fn activate(&self) -> Result<ActivationReport, ServiceWorkerError> {
        let stale: Vec<String> = self
            .storage
            .keys()
            .await?
            .into_iter()
            .filter(|name| name != &self.cache_name)
            .collect();

        let results = join_all(stale.iter().map(|name| async move {
            (name, self.storage.delete(name).await)
        }))
        .await;

        let mut deleted = Vec::new();
        for (name, result) in results {
            match result {
                Ok(_) => {
                    info!(cache = %name, "Deleted stale cache generation");
                    deleted.push(name.clone());
                }
                Err(e) => warn!(cache = %name, error = %e, "Deleting stale generation failed"),
            }
        }

        Ok(ActivationReport {
            current: self.cache_name.clone(),
            deleted,
        })
    }

    /// Answer an intercepted request: cache first, then network, then the offline shell.
    pub async fn resolve(&self, request: Request) -> FetchOutcome {
        if request.method != Method::GET || request.url.origin() != self.origin {
            trace!(url = %request.url, method = %request.method, "Not intercepted");
            return FetchOutcome::Passthrough;
        }

        let key = request.key();
        if let Some(response) = self.lookup(&key).await {
            trace!(key = %key, "Served from cache");
            return FetchOutcome::Cache(response);
        }

        match self.fetcher.fetch(&request).await {
            Ok(response) => {
                if response.is_cacheable() {
                    self.cache_in_background(key, response.clone()).await;
                } else {
                    debug!(
                        key = %key,
                        status = response.status,
                        "Response not cacheable"
                    );
                }
                FetchOutcome::Network(response)
            }
            Err(err) if request.is_navigation() => match self.lookup(&self.fallback).await {
                Some(shell) => {
                    debug!(url = %request.url, error = %err, "Offline, serving navigation fallback");
                    FetchOutcome::Fallback(shell)
                }
                None => FetchOutcome::Unresolved(err),
            },
            Err(err) => {
                debug!(url = %request.url, error = %err, "Network failed with no cached copy");
                FetchOutcome::Unresolved(err)
            }
        }
    }

    /// Wait for outstanding background cache writes.
    pub async fn settle(&self) {
        let mut writes = self.writes.lock().await;
        while let Some(result) = writes.join_next().await {
            if let Err(e) = result {
                warn!(error = %e, "Cache write task failed");
            }
        }
    }

    async fn lookup(&self, key: &RequestKey) -> Option<Response> {
        let lookup = async {
            match self.storage.open_existing(&self.cache_name).await? {
                Some(cache) => cache.match_request(key).await,
                None => Ok(None),
            }
        };

        match lookup.await {
            Ok(hit) => hit,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache lookup failed, treating as miss");
                None
            }
        }
    }

    async fn cache_in_background(&self, key: RequestKey, response: Response) {
        let storage = Arc::clone(&self.storage);
        let name = self.cache_name.clone();

        let mut writes = self.writes.lock().await;
        while writes.try_join_next().is_some() {}
        writes.spawn(async move {
            // Never recreate a generation that activation already pruned.
            let result = match storage.open_existing(&name).await {
                Ok(Some(cache)) => cache.put(key.clone(), response).await.map(|()| true),
                Ok(None) => Ok(false),
                Err(e) => Err(e),
            };
            match result {
                Ok(true) => trace!(cache = %name, key = %key, "Cached network response"),
                Ok(false) => debug!(cache = %name, key = %key, "Generation gone, dropping write"),
                Err(e) => warn!(cache = %name, key = %key, error = %e, "Opportunistic cache write failed"),
            }
        });
    }
}
