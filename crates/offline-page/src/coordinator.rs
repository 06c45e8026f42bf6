//! Page-side half of the upgrade flow.
//!
//! The coordinator registers the background script, polls for new versions,
//! turns lifecycle events into the two user-facing notifications, and reloads
//! the page once when a new worker takes control.

use hashbrown::HashSet;
use offline_common::OfflineConfig;
use offline_sw::{
    ClientMessage, ContainerEvent, RegistrationOptions, ServiceWorker, ServiceWorkerContainer,
    ServiceWorkerError, ServiceWorkerId, ServiceWorkerRegistration, ServiceWorkerState,
    WorkerMessage,
};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::reload::ReloadGuard;

/// Receives the two conditions surfaced to the user.
pub trait UpdateNotifier: Send + Sync {
    /// A new version is installed and waiting. `worker` accepts activation requests.
    fn update_ready(&self, worker: ServiceWorker);

    /// The first install finished; the app works offline.
    fn installed(&self);
}

/// The document hosting the coordinator.
pub trait PageHost: Send + Sync {
    fn reload(&self);
}

#[derive(Debug, Default)]
struct PageView {
    has_controller: bool,
    tracked: HashSet<ServiceWorkerId>,
}

/// Drives registration, update polling, and the reload-on-takeover rule for one page.
pub struct UpdateCoordinator {
    notifier: Arc<dyn UpdateNotifier>,
    page: Arc<dyn PageHost>,
    reload: Mutex<ReloadGuard>,
    view: Mutex<PageView>,
}

impl UpdateCoordinator {
    pub fn new(notifier: Arc<dyn UpdateNotifier>, page: Arc<dyn PageHost>) -> Self {
        Self {
            notifier,
            page,
            reload: Mutex::new(ReloadGuard::new()),
            view: Mutex::new(PageView::default()),
        }
    }

    /// Register the configured background script for this page.
    ///
    /// Failures are logged and swallowed; the page keeps working without
    /// offline support. On success an update check runs right away.
    pub async fn register(
        &self,
        container: &ServiceWorkerContainer,
        config: &OfflineConfig,
    ) -> Option<Arc<ServiceWorkerRegistration>> {
        self.view().has_controller = container.controller().is_some();

        let urls = config
            .script_url()
            .and_then(|script| Ok((script, config.scope_url()?)));
        let (script, scope) = match urls {
            Ok(urls) => urls,
            Err(e) => {
                error!(error = %e, "Invalid background script location");
                return None;
            }
        };

        match container
            .register(&script, RegistrationOptions { scope: Some(scope) })
            .await
        {
            Ok(registration) => {
                info!(scope = %registration.scope(), "Background script registered");
                if let Err(e) = registration.update().await {
                    debug!(error = %e, "Update check failed");
                }
                Some(registration)
            }
            Err(e) => {
                error!(script = %script, error = %e, "Background script registration failed");
                None
            }
        }
    }

    /// Ask `registration` for new script bytes every `interval`, until the handle is aborted.
    ///
    /// The first check happens one interval after the call.
    pub fn poll_for_updates(
        registration: Arc<ServiceWorkerRegistration>,
        interval: Duration,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            if interval.is_zero() {
                warn!("Update polling disabled: zero interval");
                return;
            }

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                ticker.tick().await;
                debug!(scope = %registration.scope(), "Checking for updates");
                if let Err(e) = registration.update().await {
                    debug!(error = %e, "Update check failed");
                }
            }
        })
    }

    /// React to one container event.
    pub fn handle_event(&self, event: ContainerEvent) {
        match event {
            ContainerEvent::UpdateFound { worker } => {
                info!(worker = %worker.id(), version = %worker.version(), "New version found, installing");
                self.view().tracked.insert(worker.id());
            }
            ContainerEvent::StateChange { worker, transition } => {
                debug!(worker = %worker.id(), state = %transition.to, "Worker state changed");
                match transition.to {
                    ServiceWorkerState::Installed => self.on_installed(worker),
                    ServiceWorkerState::Redundant => {
                        self.view().tracked.remove(&worker.id());
                    }
                    _ => {}
                }
            }
            ContainerEvent::ControllerChange { controller } => self.on_controller_change(&controller),
            ContainerEvent::Message(WorkerMessage::Activated { version }) => {
                info!(%version, "Background script activated");
            }
        }
    }

    /// Handle events until the container goes away.
    pub async fn run(&self, mut events: UnboundedReceiver<ContainerEvent>) {
        while let Some(event) = events.recv().await {
            self.handle_event(event);
        }
        debug!("Container event stream closed");
    }

    /// Ask a waiting worker to activate now. The reload follows from the controller change.
    pub async fn request_activation(&self, worker: &ServiceWorker) -> Result<(), ServiceWorkerError> {
        info!(worker = %worker.id(), "Activation requested");
        worker.post_message(ClientMessage::SkipWaiting).await
    }

    /// Whether this page has already asked to reload.
    pub fn reload_requested(&self) -> bool {
        self.reload
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_consumed()
    }

    fn on_installed(&self, worker: ServiceWorker) {
        let has_controller = {
            let mut view = self.view();
            if !view.tracked.remove(&worker.id()) {
                return;
            }
            view.has_controller
        };

        if has_controller {
            info!(version = %worker.version(), "New version ready to activate");
            self.notifier.update_ready(worker);
        } else {
            info!(version = %worker.version(), "Installed for offline use");
            self.notifier.installed();
        }
    }

    fn on_controller_change(&self, controller: &ServiceWorker) {
        self.view().has_controller = true;

        let first = self
            .reload
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_consume();
        if first {
            info!(controller = %controller.id(), "New background script took control, reloading");
            self.page.reload();
        } else {
            debug!(controller = %controller.id(), "Reload already requested");
        }
    }

    fn view(&self) -> MutexGuard<'_, PageView> {
        self.view.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use offline_sw::{
        MemoryCacheStorage, ServiceWorkerHost, StateTransition, StaticFetcher, StaticScriptSource,
        WorkerScript,
    };
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;
    use tokio::sync::mpsc;

    #[derive(Default)]
    struct Recorder {
        ready: AtomicUsize,
        installed: AtomicUsize,
        reloads: AtomicUsize,
    }

    impl UpdateNotifier for Recorder {
        fn update_ready(&self, _worker: ServiceWorker) {
            self.ready.fetch_add(1, Ordering::SeqCst);
        }

        fn installed(&self) {
            self.installed.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl PageHost for Recorder {
        fn reload(&self) {
            self.reloads.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        host: ServiceWorkerHost,
        scripts: Arc<StaticScriptSource>,
        config: OfflineConfig,
        recorder: Arc<Recorder>,
        coordinator: UpdateCoordinator,
    }

    impl Fixture {
        async fn new() -> Self {
            let config = OfflineConfig {
                base_url: "https://app.example/".to_string(),
                manifest: vec!["./".to_string(), "./index.html".to_string()],
                ..Default::default()
            };
            let fetcher = Arc::new(StaticFetcher::new());
            for url in config.manifest_urls().unwrap() {
                fetcher.serve_ok(&url, "shell").await;
            }
            let scripts = Arc::new(StaticScriptSource::new());
            let host = ServiceWorkerHost::new(
                Arc::new(MemoryCacheStorage::new()),
                fetcher,
                scripts.clone(),
            );
            let recorder = Arc::new(Recorder::default());
            let coordinator = UpdateCoordinator::new(recorder.clone(), recorder.clone());
            Self {
                host,
                scripts,
                config,
                recorder,
                coordinator,
            }
        }

        async fn deploy(&self) {
            self.scripts
                .publish(
                    &self.config.script_url().unwrap(),
                    WorkerScript::new(self.config.clone()).unwrap(),
                )
                .await;
        }

        fn drain(&self, rx: &mut mpsc::UnboundedReceiver<ContainerEvent>) {
            while let Ok(event) = rx.try_recv() {
                self.coordinator.handle_event(event);
            }
        }
    }

    #[tokio::test]
    async fn test_repeated_controller_changes_reload_once() {
        let fx = Fixture::new().await;
        fx.deploy().await;
        let (page, mut rx) = fx.host.connect(fx.config.scope_url().unwrap()).await;
        fx.coordinator.register(&page, &fx.config).await.unwrap();
        fx.drain(&mut rx);

        let controller = page.controller().unwrap();
        for _ in 0..5 {
            fx.coordinator.handle_event(ContainerEvent::ControllerChange {
                controller: controller.clone(),
            });
        }
        assert_eq!(fx.recorder.reloads.load(Ordering::SeqCst), 1);
        assert!(fx.coordinator.reload_requested());
    }

    #[tokio::test]
    async fn test_installed_without_updatefound_is_ignored() {
        let fx = Fixture::new().await;
        fx.deploy().await;
        let (page, _rx) = fx.host.connect(fx.config.scope_url().unwrap()).await;
        fx.coordinator.register(&page, &fx.config).await.unwrap();
        let worker = page.controller().unwrap();

        fx.coordinator.handle_event(ContainerEvent::StateChange {
            worker,
            transition: StateTransition {
                from: ServiceWorkerState::Installing,
                to: ServiceWorkerState::Installed,
                at: Instant::now(),
            },
        });
        assert_eq!(fx.recorder.installed.load(Ordering::SeqCst), 0);
        assert_eq!(fx.recorder.ready.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_registration_failure_is_swallowed() {
        let fx = Fixture::new().await;
        let (page, mut rx) = fx.host.connect(fx.config.scope_url().unwrap()).await;

        assert!(fx.coordinator.register(&page, &fx.config).await.is_none());
        fx.drain(&mut rx);
        assert_eq!(fx.recorder.installed.load(Ordering::SeqCst), 0);
        assert_eq!(fx.recorder.reloads.load(Ordering::SeqCst), 0);
        assert!(page.controller().is_none());
    }

    #[tokio::test]
    async fn test_activation_message_changes_nothing() {
        let fx = Fixture::new().await;
        fx.coordinator
            .handle_event(ContainerEvent::Message(WorkerMessage::Activated {
                version: "DeltaF-v1.0.0".to_string(),
            }));
        assert_eq!(fx.recorder.reloads.load(Ordering::SeqCst), 0);
        assert!(!fx.coordinator.reload_requested());
    }

    #[tokio::test]
    async fn test_run_stops_when_container_goes_away() {
        let fx = Fixture::new().await;
        fx.deploy().await;
        let (page, rx) = fx.host.connect(fx.config.scope_url().unwrap()).await;
        fx.coordinator.register(&page, &fx.config).await.unwrap();
        drop(page);

        // The host only holds pages weakly, so the stream ends once the page is gone.
        fx.coordinator.run(rx).await;
        assert_eq!(fx.recorder.installed.load(Ordering::SeqCst), 1);
        assert_eq!(fx.recorder.reloads.load(Ordering::SeqCst), 1);
    }
}
