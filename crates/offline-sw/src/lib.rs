//! # Offline Service Worker
//!
//! Cache-first offline support for a single-page application, plus the
//! in-process host runtime the background script runs in.
//!
//! ## Features
//!
//! - **Install**: all-or-nothing population of a versioned cache generation
//! - **Activate**: pruning of every stale generation, claiming open pages
//! - **Fetch interception**: cache first, network fallback, offline shell
//! - **Lifecycle**: per-instance state machine with a transition log
//! - **Host runtime**: registrations, containers, controller changes
//!
//! ## Architecture
//!
//! ```text
//! ServiceWorkerHost
//!     ├── ServiceWorkerRegistration (per scope)
//!     │       ├── installing / waiting / active (ServiceWorker)
//!     │       │       └── OfflineWorker
//!     │       │               └── CacheManager ── Fetcher
//!     │       │                       └── CacheStorage
//!     │       │                               └── Cache (generation)
//!     │       │                                       └── RequestKey → Response
//!     │       └── scope
//!     └── ServiceWorkerContainer (per page) ──→ ContainerEvent
//! ```

use thiserror::Error;

pub mod cache;
pub mod fetch;
pub mod host;
pub mod lifecycle;
pub mod manager;
pub mod manifest;
pub mod message;
pub mod request;
pub mod worker;

pub use cache::{Cache, CacheEntry, CacheStorage, MemoryCache, MemoryCacheStorage};
pub use fetch::{Fetcher, FetcherConfig, HttpFetcher, StaticFetcher};
pub use host::{
    ContainerEvent, RegistrationOptions, ScriptSource, ServiceWorker, ServiceWorkerContainer,
    ServiceWorkerHost, ServiceWorkerRegistration, StaticScriptSource, UpdateOutcome,
};
pub use lifecycle::{ServiceWorkerId, ServiceWorkerState, StateTransition, WorkerLifecycle};
pub use manager::{ActivationReport, CacheManager, FetchOutcome};
pub use manifest::AssetManifest;
pub use message::{ClientMessage, WorkerMessage};
pub use request::{Request, RequestKey, RequestMode, Response, ResponseType};
pub use worker::{OfflineWorker, WorkerAction, WorkerScript};

// ==================== Errors ====================

/// Errors that can occur in service worker operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ServiceWorkerError {
    #[error("Registration failed: {0}")]
    RegistrationFailed(String),

    #[error("Install failed: {0}")]
    InstallFailed(String),

    #[error("Script error: {0}")]
    ScriptError(String),

    #[error("Security error: {0}")]
    SecurityError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("State error: {0}")]
    StateError(String),

    #[error("Cache error: {0}")]
    CacheError(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<offline_common::OfflineError> for ServiceWorkerError {
    fn from(err: offline_common::OfflineError) -> Self {
        Self::ScriptError(err.to_string())
    }
}
