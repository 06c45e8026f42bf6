//! The background script: event handlers wired to a [`CacheManager`].

use bytes::Bytes;
use offline_common::OfflineConfig;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::cache::CacheStorage;
use crate::fetch::Fetcher;
use crate::manager::{CacheManager, FetchOutcome};
use crate::message::{ClientMessage, WorkerMessage};
use crate::request::Request;
use crate::ServiceWorkerError;

/// Deployed script: its bytes plus the configuration baked into it.
///
/// Update checks compare `source` byte for byte.
#[derive(Debug, Clone)]
pub struct WorkerScript {
    pub source: Bytes,
    pub config: OfflineConfig,
}

impl WorkerScript {
    /// Build the script for a validated configuration.
    pub fn new(config: OfflineConfig) -> Result<Self, ServiceWorkerError> {
        config.validate()?;
        let source = serde_json::to_vec(&config)
            .map_err(|e| ServiceWorkerError::ScriptError(e.to_string()))?;
        Ok(Self {
            source: Bytes::from(source),
            config,
        })
    }

    /// Version identifier reported to pages.
    pub fn version(&self) -> String {
        self.config.cache_name()
    }
}

/// What the host should do after an event handler ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerAction {
    None,
    /// Activate without waiting for controlled pages to close.
    SkipWaiting,
}

/// One instance of the background script.
pub struct OfflineWorker {
    version: String,
    manager: CacheManager,
    skip_waiting_on_install: bool,
}

impl OfflineWorker {
    /// Evaluate `script` against the given cache repository and network.
    pub fn new(
        script: &WorkerScript,
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Result<Self, ServiceWorkerError> {
        Ok(Self {
            version: script.version(),
            manager: CacheManager::from_config(&script.config, storage, fetcher)?,
            skip_waiting_on_install: script.config.skip_waiting_on_install,
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn manager(&self) -> &CacheManager {
        &self.manager
    }

    /// Install event: populate the generation.
    pub async fn on_install(&self) -> Result<WorkerAction, ServiceWorkerError> {
        self.manager.install().await?;
        if self.skip_waiting_on_install {
            debug!(version = %self.version, "Skipping wait after install");
            return Ok(WorkerAction::SkipWaiting);
        }
        Ok(WorkerAction::None)
    }

    /// Activate event: prune stale generations while `claim` takes over open pages.
    ///
    /// Returns the broadcast announcing the active version.
    pub async fn on_activate<F>(&self, claim: F) -> WorkerMessage
    where
        F: Future<Output = usize>,
    {
        let (report, claimed) = tokio::join!(self.manager.activate(), claim);
        match report {
            Ok(report) => info!(
                version = %self.version,
                deleted = report.deleted.len(),
                claimed,
                "Activated"
            ),
            Err(e) => warn!(version = %self.version, error = %e, claimed, "Activated without pruning"),
        }

        WorkerMessage::Activated {
            version: self.version.clone(),
        }
    }

    /// Fetch event.
    pub async fn on_fetch(&self, request: Request) -> FetchOutcome {
        self.manager.resolve(request).await
    }

    /// Message event.
    pub fn on_message(&self, message: &ClientMessage) -> WorkerAction {
        match message {
            ClientMessage::SkipWaiting => {
                debug!(version = %self.version, "Skip waiting requested by page");
                WorkerAction::SkipWaiting
            }
        }
    }
}
