//! In-process host runtime for the background script.
//!
//! Plays the browser's part: it owns registrations, moves workers through
//! their lifecycle, tracks which worker controls each page, and delivers
//! events to pages in the order they happen.

use async_trait::async_trait;
use bytes::Bytes;
use hashbrown::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock as StdRwLock, Weak};
use std::time::Instant;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::{debug, info, warn};
use url::Url;

use crate::cache::CacheStorage;
use crate::fetch::Fetcher;
use crate::lifecycle::{ServiceWorkerId, ServiceWorkerState, StateTransition, WorkerLifecycle};
use crate::manager::FetchOutcome;
use crate::message::{ClientMessage, WorkerMessage};
use crate::request::Request;
use crate::worker::{OfflineWorker, WorkerAction, WorkerScript};
use crate::ServiceWorkerError;

// ==================== Script Source ====================

/// Where the host downloads background scripts from.
#[async_trait]
pub trait ScriptSource: Send + Sync {
    async fn fetch_script(&self, url: &Url) -> Result<WorkerScript, ServiceWorkerError>;
}

/// Script source backed by an in-memory table; `publish` is a deploy.
#[derive(Debug, Default)]
pub struct StaticScriptSource {
    scripts: RwLock<HashMap<String, WorkerScript>>,
}

impl StaticScriptSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Deploy `script` at `url`, replacing what was there.
    pub async fn publish(&self, url: &Url, script: WorkerScript) {
        info!(url = %url, version = %script.version(), "Published worker script");
        self.scripts.write().await.insert(url.to_string(), script);
    }

    /// Remove the script at `url`.
    pub async fn withdraw(&self, url: &Url) {
        self.scripts.write().await.remove(url.as_str());
    }
}

#[async_trait]
impl ScriptSource for StaticScriptSource {
    async fn fetch_script(&self, url: &Url) -> Result<WorkerScript, ServiceWorkerError> {
        self.scripts
            .read()
            .await
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| ServiceWorkerError::NotFound(url.to_string()))
    }
}

// ==================== Service Worker ====================

struct WorkerInner {
    id: ServiceWorkerId,
    script_url: Url,
    source: Bytes,
    lifecycle: WorkerLifecycle,
    script: OfflineWorker,
    skip_waiting: AtomicBool,
    registration: Weak<ServiceWorkerRegistration>,
}

/// Handle to one background-script instance.
#[derive(Clone)]
pub struct ServiceWorker {
    inner: Arc<WorkerInner>,
}

impl ServiceWorker {
    fn spawn(
        registration: &Arc<ServiceWorkerRegistration>,
        script: &WorkerScript,
    ) -> Result<Self, ServiceWorkerError> {
        let shared = &registration.shared;
        let offline = OfflineWorker::new(script, shared.storage.clone(), shared.fetcher.clone())?;

        Ok(Self {
            inner: Arc::new(WorkerInner {
                id: ServiceWorkerId::new(),
                script_url: registration.script_url.clone(),
                source: script.source.clone(),
                lifecycle: WorkerLifecycle::new(),
                script: offline,
                skip_waiting: AtomicBool::new(false),
                registration: Arc::downgrade(registration),
            }),
        })
    }

    pub fn id(&self) -> ServiceWorkerId {
        self.inner.id
    }

    pub fn script_url(&self) -> &Url {
        &self.inner.script_url
    }

    pub fn state(&self) -> ServiceWorkerState {
        self.inner.lifecycle.state()
    }

    pub fn lifecycle(&self) -> &WorkerLifecycle {
        &self.inner.lifecycle
    }

    /// The script running in this instance.
    pub fn script(&self) -> &OfflineWorker {
        &self.inner.script
    }

    pub fn version(&self) -> &str {
        self.inner.script.version()
    }

    pub fn is_active(&self) -> bool {
        self.state() == ServiceWorkerState::Activated
    }

    pub fn is_redundant(&self) -> bool {
        self.state() == ServiceWorkerState::Redundant
    }

    /// Deliver a message to the worker's message handler.
    ///
    /// Returns once the message has been handled; any activation it triggers
    /// has completed by then.
    pub async fn post_message(&self, message: ClientMessage) -> Result<(), ServiceWorkerError> {
        if self.is_redundant() {
            return Err(ServiceWorkerError::StateError(
                "Cannot post message to redundant worker".to_string(),
            ));
        }

        match self.inner.script.on_message(&message) {
            WorkerAction::SkipWaiting => {
                self.inner.skip_waiting.store(true, Ordering::SeqCst);
                if let Some(registration) = self.inner.registration.upgrade() {
                    registration.skip_waiting(self).await?;
                }
            }
            WorkerAction::None => {}
        }
        Ok(())
    }

    fn skip_waiting_requested(&self) -> bool {
        self.inner.skip_waiting.load(Ordering::SeqCst)
    }
}

impl PartialEq for ServiceWorker {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for ServiceWorker {}

impl fmt::Debug for ServiceWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceWorker")
            .field("id", &self.id())
            .field("script_url", &self.script_url().as_str())
            .field("version", &self.version())
            .field("state", &self.state())
            .finish()
    }
}

// ==================== Events ====================

/// Events delivered to a page, in order.
#[derive(Debug, Clone)]
pub enum ContainerEvent {
    /// A new worker started installing for the page's registration.
    UpdateFound { worker: ServiceWorker },
    /// A worker of the page's registration changed state.
    StateChange {
        worker: ServiceWorker,
        transition: StateTransition,
    },
    /// The page is now controlled by `controller`.
    ControllerChange { controller: ServiceWorker },
    /// Broadcast from a worker.
    Message(WorkerMessage),
}

// ==================== Clients ====================

/// Identifier of a connected page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientId(u64);

impl ClientId {
    fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

struct ClientState {
    id: ClientId,
    url: Url,
    controller: StdRwLock<Option<ServiceWorker>>,
    events: mpsc::UnboundedSender<ContainerEvent>,
}

impl ClientState {
    fn controller(&self) -> Option<ServiceWorker> {
        self.controller
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns false if `worker` already controls this page.
    fn set_controller(&self, worker: &ServiceWorker) -> bool {
        {
            let mut controller = self
                .controller
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if controller.as_ref() == Some(worker) {
                return false;
            }
            *controller = Some(worker.clone());
        }

        debug!(client = ?self.id, worker = %worker.id(), "Controller changed");
        self.send(ContainerEvent::ControllerChange {
            controller: worker.clone(),
        });
        true
    }

    fn send(&self, event: ContainerEvent) {
        // A closed receiver means the page went away.
        let _ = self.events.send(event);
    }
}

fn in_scope(scope: &Url, url: &Url) -> bool {
    url.origin() == scope.origin() && url.path().starts_with(scope.path())
}

struct HostShared {
    storage: Arc<dyn CacheStorage>,
    fetcher: Arc<dyn Fetcher>,
    scripts: Arc<dyn ScriptSource>,
    clients: StdRwLock<Vec<Weak<ClientState>>>,
}

impl HostShared {
    fn clients_in_scope(&self, scope: &Url) -> Vec<Arc<ClientState>> {
        let mut clients = self.clients.write().unwrap_or_else(PoisonError::into_inner);
        clients.retain(|c| c.strong_count() > 0);
        clients
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| in_scope(scope, &c.url))
            .collect()
    }
}

// ==================== Registration ====================

#[derive(Default)]
struct Slots {
    installing: Option<ServiceWorker>,
    waiting: Option<ServiceWorker>,
    active: Option<ServiceWorker>,
    last_update_check: Option<Instant>,
}

/// Result of an update check.
#[derive(Debug, Clone)]
pub enum UpdateOutcome {
    /// Script bytes unchanged.
    UpToDate,
    /// A new worker installed; it is waiting or already active.
    Installed(ServiceWorker),
}

/// A scope's relationship with its background script.
pub struct ServiceWorkerRegistration {
    scope: Url,
    script_url: Url,
    shared: Arc<HostShared>,
    slots: RwLock<Slots>,
    update_job: Mutex<()>,
    activation_job: Mutex<()>,
}

impl ServiceWorkerRegistration {
    fn new(scope: Url, script_url: Url, shared: Arc<HostShared>) -> Self {
        Self {
            scope,
            script_url,
            shared,
            slots: RwLock::new(Slots::default()),
            update_job: Mutex::new(()),
            activation_job: Mutex::new(()),
        }
    }

    pub fn scope(&self) -> &Url {
        &self.scope
    }

    pub fn script_url(&self) -> &Url {
        &self.script_url
    }

    pub async fn installing(&self) -> Option<ServiceWorker> {
        self.slots.read().await.installing.clone()
    }

    pub async fn waiting(&self) -> Option<ServiceWorker> {
        self.slots.read().await.waiting.clone()
    }

    pub async fn active(&self) -> Option<ServiceWorker> {
        self.slots.read().await.active.clone()
    }

    pub async fn last_update_check(&self) -> Option<Instant> {
        self.slots.read().await.last_update_check
    }

    async fn is_idle(&self) -> bool {
        let slots = self.slots.read().await;
        slots.installing.is_none() && slots.waiting.is_none() && slots.active.is_none()
    }

    /// Check for new script bytes and install them if found.
    ///
    /// The new worker activates straight away when nothing is active yet or
    /// when it asked to skip waiting; otherwise it stays in `waiting`.
    pub async fn update(self: &Arc<Self>) -> Result<UpdateOutcome, ServiceWorkerError> {
        let _job = self.update_job.lock().await;
        let script = self.shared.scripts.fetch_script(&self.script_url).await?;

        {
            let mut slots = self.slots.write().await;
            slots.last_update_check = Some(Instant::now());
            let newest = slots
                .installing
                .as_ref()
                .or(slots.waiting.as_ref())
                .or(slots.active.as_ref());
            if newest.is_some_and(|w| w.inner.source == script.source) {
                debug!(scope = %self.scope, "Worker script unchanged");
                return Ok(UpdateOutcome::UpToDate);
            }
        }

        let worker = ServiceWorker::spawn(self, &script)?;
        info!(
            scope = %self.scope,
            worker = %worker.id(),
            version = %worker.version(),
            "Installing new worker"
        );

        self.slots.write().await.installing = Some(worker.clone());
        self.broadcast(ContainerEvent::UpdateFound {
            worker: worker.clone(),
        });
        self.transition(&worker, ServiceWorkerState::Installing)?;

        match worker.script().on_install().await {
            Ok(WorkerAction::SkipWaiting) => worker.inner.skip_waiting.store(true, Ordering::SeqCst),
            Ok(WorkerAction::None) => {}
            Err(err) => {
                warn!(worker = %worker.id(), error = %err, "Install failed");
                self.slots.write().await.installing = None;
                self.transition(&worker, ServiceWorkerState::Redundant)?;
                return Err(err);
            }
        }

        let replaced = {
            let mut slots = self.slots.write().await;
            slots.installing = None;
            slots.waiting.replace(worker.clone())
        };
        if let Some(replaced) = replaced {
            self.transition(&replaced, ServiceWorkerState::Redundant)?;
        }
        self.transition(&worker, ServiceWorkerState::Installed)?;

        let has_active = self.slots.read().await.active.is_some();
        if !has_active || worker.skip_waiting_requested() {
            self.activate_waiting().await?;
        }

        Ok(UpdateOutcome::Installed(worker))
    }

    async fn skip_waiting(self: &Arc<Self>, worker: &ServiceWorker) -> Result<(), ServiceWorkerError> {
        let is_waiting = self.slots.read().await.waiting.as_ref() == Some(worker);
        if is_waiting {
            self.activate_waiting().await?;
        }
        Ok(())
    }

    async fn activate_waiting(self: &Arc<Self>) -> Result<(), ServiceWorkerError> {
        let _job = self.activation_job.lock().await;
        let (worker, previous) = {
            let mut slots = self.slots.write().await;
            let Some(worker) = slots.waiting.take() else {
                return Ok(());
            };
            let previous = slots.active.replace(worker.clone());
            (worker, previous)
        };

        if let Some(previous) = &previous {
            self.transition(previous, ServiceWorkerState::Redundant)?;
        }
        self.transition(&worker, ServiceWorkerState::Activating)?;

        // Pages the previous worker controlled move over regardless of claiming.
        if let Some(previous) = &previous {
            for client in self.shared.clients_in_scope(&self.scope) {
                if client.controller().as_ref() == Some(previous) {
                    client.set_controller(&worker);
                }
            }
        }

        let claim = async { self.claim(&worker) };
        let message = worker.script().on_activate(claim).await;
        self.transition(&worker, ServiceWorkerState::Activated)?;
        self.broadcast(ContainerEvent::Message(message));
        Ok(())
    }

    /// Take control of every in-scope page. Returns how many pages changed.
    fn claim(&self, worker: &ServiceWorker) -> usize {
        self.shared
            .clients_in_scope(&self.scope)
            .iter()
            .filter(|client| client.set_controller(worker))
            .count()
    }

    fn transition(
        &self,
        worker: &ServiceWorker,
        to: ServiceWorkerState,
    ) -> Result<(), ServiceWorkerError> {
        let transition = worker.lifecycle().advance(to)?;
        debug!(
            worker = %worker.id(),
            from = %transition.from,
            to = %transition.to,
            "Worker state change"
        );
        self.broadcast(ContainerEvent::StateChange {
            worker: worker.clone(),
            transition,
        });
        Ok(())
    }

    fn broadcast(&self, event: ContainerEvent) {
        for client in self.shared.clients_in_scope(&self.scope) {
            client.send(event.clone());
        }
    }
}

impl fmt::Debug for ServiceWorkerRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceWorkerRegistration")
            .field("scope", &self.scope.as_str())
            .field("script_url", &self.script_url.as_str())
            .finish()
    }
}

// ==================== Container ====================

/// Options for [`ServiceWorkerContainer::register`].
#[derive(Debug, Clone, Default)]
pub struct RegistrationOptions {
    /// Scope URL; defaults to the script's directory.
    pub scope: Option<Url>,
}

/// A page's view of the host (`navigator.serviceWorker`).
pub struct ServiceWorkerContainer {
    host: ServiceWorkerHost,
    client: Arc<ClientState>,
}

impl ServiceWorkerContainer {
    pub fn client_id(&self) -> ClientId {
        self.client.id
    }

    pub fn url(&self) -> &Url {
        &self.client.url
    }

    /// Worker currently intercepting this page's requests.
    pub fn controller(&self) -> Option<ServiceWorker> {
        self.client.controller()
    }

    /// Register a background script and run its first update.
    ///
    /// A failed install does not fail registration; the registration stays
    /// and the next update retries.
    pub async fn register(
        &self,
        script_url: &Url,
        options: RegistrationOptions,
    ) -> Result<Arc<ServiceWorkerRegistration>, ServiceWorkerError> {
        if script_url.origin() != self.client.url.origin() {
            return Err(ServiceWorkerError::SecurityError(format!(
                "script {} is not same-origin with {}",
                script_url, self.client.url
            )));
        }

        let scope = match options.scope {
            Some(scope) => scope,
            None => script_url
                .join("./")
                .map_err(|e| ServiceWorkerError::RegistrationFailed(e.to_string()))?,
        };
        if scope.origin() != script_url.origin() {
            return Err(ServiceWorkerError::SecurityError(format!(
                "scope {} is not same-origin with {}",
                scope, script_url
            )));
        }

        let registration = self.host.get_or_create(scope, script_url).await;
        match registration.update().await {
            Ok(_) => {}
            Err(ServiceWorkerError::InstallFailed(reason)) => {
                warn!(scope = %registration.scope(), %reason, "Registered, but install failed");
            }
            Err(err) => {
                self.host.remove_if_idle(&registration).await;
                return Err(ServiceWorkerError::RegistrationFailed(err.to_string()));
            }
        }
        Ok(registration)
    }

    /// Registration whose scope covers this page.
    pub async fn get_registration(&self) -> Option<Arc<ServiceWorkerRegistration>> {
        self.host.registration_for(&self.client.url).await
    }

    /// Issue a request from this page; the controller intercepts it if there is one.
    pub async fn fetch(&self, request: Request) -> FetchOutcome {
        match self.controller() {
            Some(worker) => worker.script().on_fetch(request).await,
            None => FetchOutcome::Passthrough,
        }
    }
}

// ==================== Host ====================

/// The runtime background scripts and pages live in.
#[derive(Clone)]
pub struct ServiceWorkerHost {
    shared: Arc<HostShared>,
    registrations: Arc<RwLock<HashMap<String, Arc<ServiceWorkerRegistration>>>>,
}

impl ServiceWorkerHost {
    /// Create a host over the given cache repository, network, and script source.
    pub fn new(
        storage: Arc<dyn CacheStorage>,
        fetcher: Arc<dyn Fetcher>,
        scripts: Arc<dyn ScriptSource>,
    ) -> Self {
        Self {
            shared: Arc::new(HostShared {
                storage,
                fetcher,
                scripts,
                clients: StdRwLock::new(Vec::new()),
            }),
            registrations: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn storage(&self) -> Arc<dyn CacheStorage> {
        Arc::clone(&self.shared.storage)
    }

    /// Open a page. It starts out controlled by the active worker covering it, if any.
    pub async fn connect(
        &self,
        page_url: Url,
    ) -> (ServiceWorkerContainer, mpsc::UnboundedReceiver<ContainerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let controller = match self.registration_for(&page_url).await {
            Some(registration) => registration.active().await,
            None => None,
        };

        let client = Arc::new(ClientState {
            id: ClientId::new(),
            url: page_url,
            controller: StdRwLock::new(controller),
            events,
        });
        self.shared
            .clients
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::downgrade(&client));

        debug!(
            client = ?client.id,
            url = %client.url,
            controlled = client.controller().is_some(),
            "Page connected"
        );

        (
            ServiceWorkerContainer {
                host: self.clone(),
                client,
            },
            rx,
        )
    }

    /// Registration with the longest scope covering `url`.
    pub async fn registration_for(&self, url: &Url) -> Option<Arc<ServiceWorkerRegistration>> {
        self.registrations
            .read()
            .await
            .values()
            .filter(|r| in_scope(r.scope(), url))
            .max_by_key(|r| r.scope().path().len())
            .cloned()
    }

    pub async fn registrations(&self) -> Vec<Arc<ServiceWorkerRegistration>> {
        self.registrations.read().await.values().cloned().collect()
    }

    async fn get_or_create(&self, scope: Url, script_url: &Url) -> Arc<ServiceWorkerRegistration> {
        let mut registrations = self.registrations.write().await;
        registrations
            .entry(scope.to_string())
            .or_insert_with(|| {
                info!(scope = %scope, script = %script_url, "Created registration");
                Arc::new(ServiceWorkerRegistration::new(
                    scope.clone(),
                    script_url.clone(),
                    self.shared.clone(),
                ))
            })
            .clone()
    }

    async fn remove_if_idle(&self, registration: &Arc<ServiceWorkerRegistration>) {
        if registration.is_idle().await {
            self.registrations
                .write()
                .await
                .remove(registration.scope().as_str());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCacheStorage;
    use crate::fetch::StaticFetcher;
    use offline_common::OfflineConfig;

    const BASE: &str = "https://app.example/deltaf/";

    struct Fixture {
        host: ServiceWorkerHost,
        fetcher: Arc<StaticFetcher>,
        scripts: Arc<StaticScriptSource>,
        storage: Arc<MemoryCacheStorage>,
    }

    fn config(version: &str) -> OfflineConfig {
        OfflineConfig {
            base_url: BASE.to_string(),
            version: version.to_string(),
            manifest: vec!["./".to_string(), "./index.html".to_string()],
            ..Default::default()
        }
    }

    impl Fixture {
        async fn new() -> Self {
            let fetcher = Arc::new(StaticFetcher::new());
            for url in config("v1").manifest_urls().unwrap() {
                fetcher.serve_ok(&url, "page").await;
            }
            let storage = Arc::new(MemoryCacheStorage::new());
            let scripts = Arc::new(StaticScriptSource::new());
            let host = ServiceWorkerHost::new(storage.clone(), fetcher.clone(), scripts.clone());
            Self {
                host,
                fetcher,
                scripts,
                storage,
            }
        }

        async fn deploy(&self, version: &str) {
            let config = config(version);
            let script = WorkerScript::new(config.clone()).unwrap();
            self.scripts
                .publish(&config.script_url().unwrap(), script)
                .await;
        }

        fn url(&self, path: &str) -> Url {
            Url::parse(BASE).unwrap().join(path).unwrap()
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ContainerEvent>) -> Vec<ContainerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn test_first_registration_installs_and_activates() {
        let fx = Fixture::new().await;
        fx.deploy("v1").await;
        let (page, mut rx) = fx.host.connect(fx.url("./")).await;

        let registration = page
            .register(&fx.url("sw.js"), RegistrationOptions::default())
            .await
            .unwrap();

        assert_eq!(registration.scope().as_str(), BASE);
        let active = registration.active().await.unwrap();
        assert!(active.is_active());
        assert!(registration.waiting().await.is_none());
        assert_eq!(page.controller(), Some(active.clone()));

        let states: Vec<ServiceWorkerState> = active
            .lifecycle()
            .transitions()
            .iter()
            .map(|t| t.to)
            .collect();
        assert_eq!(
            states,
            vec![
                ServiceWorkerState::Installing,
                ServiceWorkerState::Installed,
                ServiceWorkerState::Activating,
                ServiceWorkerState::Activated,
            ]
        );

        let events = drain(&mut rx);
        assert!(matches!(events[0], ContainerEvent::UpdateFound { .. }));
        assert!(matches!(
            events.last(),
            Some(ContainerEvent::Message(WorkerMessage::Activated { .. }))
        ));
    }

    #[tokio::test]
    async fn test_update_with_same_bytes_is_noop() {
        let fx = Fixture::new().await;
        fx.deploy("v1").await;
        let (page, _rx) = fx.host.connect(fx.url("./")).await;
        let registration = page
            .register(&fx.url("sw.js"), RegistrationOptions::default())
            .await
            .unwrap();

        let outcome = registration.update().await.unwrap();
        assert!(matches!(outcome, UpdateOutcome::UpToDate));
        assert!(registration.last_update_check().await.is_some());
    }

    #[tokio::test]
    async fn test_new_version_waits_until_skip_waiting() {
        let fx = Fixture::new().await;
        fx.deploy("v1").await;
        let (page, _rx) = fx.host.connect(fx.url("./")).await;
        let registration = page
            .register(&fx.url("sw.js"), RegistrationOptions::default())
            .await
            .unwrap();
        let v1 = registration.active().await.unwrap();

        fx.deploy("v2").await;
        registration.update().await.unwrap();
        let v2 = registration.waiting().await.unwrap();
        assert_eq!(v2.state(), ServiceWorkerState::Installed);
        assert_eq!(page.controller(), Some(v1.clone()));

        v2.post_message(ClientMessage::SkipWaiting).await.unwrap();
        assert!(v2.is_active());
        assert!(v1.is_redundant());
        assert_eq!(page.controller(), Some(v2));
        assert_eq!(fx.storage.keys().await.unwrap(), vec!["DeltaF-v2"]);

        let err = v1.post_message(ClientMessage::SkipWaiting).await.unwrap_err();
        assert!(matches!(err, ServiceWorkerError::StateError(_)));
    }

    #[tokio::test]
    async fn test_failed_install_keeps_registration_and_previous_worker() {
        let fx = Fixture::new().await;
        fx.deploy("v1").await;
        let (page, _rx) = fx.host.connect(fx.url("./")).await;
        let registration = page
            .register(&fx.url("sw.js"), RegistrationOptions::default())
            .await
            .unwrap();

        fx.fetcher.set_online(false);
        fx.deploy("v2").await;
        let err = registration.update().await.unwrap_err();
        assert!(matches!(err, ServiceWorkerError::InstallFailed(_)));

        assert!(registration.installing().await.is_none());
        assert!(registration.waiting().await.is_none());
        assert_eq!(registration.active().await.unwrap().version(), "DeltaF-v1");
        assert_eq!(fx.storage.keys().await.unwrap(), vec!["DeltaF-v1"]);
    }

    #[tokio::test]
    async fn test_register_offline_keeps_registration() {
        let fx = Fixture::new().await;
        fx.deploy("v1").await;
        fx.fetcher.set_online(false);
        let (page, _rx) = fx.host.connect(fx.url("./")).await;

        let registration = page
            .register(&fx.url("sw.js"), RegistrationOptions::default())
            .await
            .unwrap();
        assert!(registration.active().await.is_none());
        assert!(page.controller().is_none());
    }

    #[tokio::test]
    async fn test_register_missing_script_fails() {
        let fx = Fixture::new().await;
        let (page, _rx) = fx.host.connect(fx.url("./")).await;

        let err = page
            .register(&fx.url("sw.js"), RegistrationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceWorkerError::RegistrationFailed(_)));
        assert!(fx.host.registrations().await.is_empty());
    }

    #[tokio::test]
    async fn test_withdrawn_script_fails_update() {
        let fx = Fixture::new().await;
        fx.deploy("v1").await;
        let (page, _rx) = fx.host.connect(fx.url("./")).await;
        let registration = page
            .register(&fx.url("sw.js"), RegistrationOptions::default())
            .await
            .unwrap();

        fx.scripts.withdraw(&fx.url("sw.js")).await;
        let err = registration.update().await.unwrap_err();
        assert!(matches!(err, ServiceWorkerError::NotFound(_)));
        assert_eq!(registration.active().await.unwrap().version(), "DeltaF-v1");
    }

    #[tokio::test]
    async fn test_pages_find_their_registration() {
        let fx = Fixture::new().await;
        fx.deploy("v1").await;
        let (page, _rx) = fx.host.connect(fx.url("./")).await;
        let (other, _other_rx) = fx.host.connect(fx.url("index.html")).await;
        let (outside, _outside_rx) = fx.host.connect(fx.url("/elsewhere/")).await;
        assert_ne!(page.client_id(), other.client_id());
        assert!(page.get_registration().await.is_none());

        let registration = page
            .register(&fx.url("sw.js"), RegistrationOptions::default())
            .await
            .unwrap();

        let found = other.get_registration().await.unwrap();
        assert!(Arc::ptr_eq(&found, &registration));
        assert!(outside.get_registration().await.is_none());
        assert_eq!(fx.host.storage().keys().await.unwrap(), vec!["DeltaF-v1"]);
    }

    #[tokio::test]
    async fn test_register_cross_origin_script_is_rejected() {
        let fx = Fixture::new().await;
        let (page, _rx) = fx.host.connect(fx.url("./")).await;
        let foreign = Url::parse("https://evil.example/sw.js").unwrap();

        let err = page
            .register(&foreign, RegistrationOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, ServiceWorkerError::SecurityError(_)));
    }

    #[tokio::test]
    async fn test_reconnected_page_is_controlled() {
        let fx = Fixture::new().await;
        fx.deploy("v1").await;
        let (page, _rx) = fx.host.connect(fx.url("./")).await;
        page.register(&fx.url("sw.js"), RegistrationOptions::default())
            .await
            .unwrap();

        let (reloaded, _rx) = fx.host.connect(fx.url("index.html")).await;
        assert!(reloaded.controller().is_some());

        let (outside, _rx) = fx.host.connect(fx.url("/other/")).await;
        assert!(outside.controller().is_none());
    }

    #[tokio::test]
    async fn test_container_fetch_goes_through_controller() {
        let fx = Fixture::new().await;
        let (uncontrolled, _rx) = fx.host.connect(fx.url("./")).await;
        assert!(uncontrolled
            .fetch(Request::get(fx.url("index.html")))
            .await
            .is_passthrough());

        fx.deploy("v1").await;
        uncontrolled
            .register(&fx.url("sw.js"), RegistrationOptions::default())
            .await
            .unwrap();
        let outcome = uncontrolled.fetch(Request::get(fx.url("index.html"))).await;
        assert!(matches!(outcome, FetchOutcome::Cache(_)));
    }

    #[tokio::test]
    async fn test_skip_waiting_on_install_activates_immediately() {
        let fx = Fixture::new().await;
        fx.deploy("v1").await;
        let (page, _rx) = fx.host.connect(fx.url("./")).await;
        let registration = page
            .register(&fx.url("sw.js"), RegistrationOptions::default())
            .await
            .unwrap();

        let eager = OfflineConfig {
            skip_waiting_on_install: true,
            ..config("v2")
        };
        fx.scripts
            .publish(&eager.script_url().unwrap(), WorkerScript::new(eager.clone()).unwrap())
            .await;
        registration.update().await.unwrap();

        assert!(registration.waiting().await.is_none());
        assert_eq!(registration.active().await.unwrap().version(), "DeltaF-v2");
    }
}
