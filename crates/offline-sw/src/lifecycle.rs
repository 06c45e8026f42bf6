//! Per-instance lifecycle state machine.
//!
//! The host drives transitions; observers either subscribe to the current
//! state or read the transition log after the fact.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Instant;
use tokio::sync::watch;

use crate::ServiceWorkerError;

/// Unique identifier for a service worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ServiceWorkerId(u64);

impl ServiceWorkerId {
    pub(crate) fn new() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ServiceWorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sw-{}", self.0)
    }
}

/// Service worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceWorkerState {
    /// Script fetched, not yet installing.
    #[default]
    Parsed,
    /// Install handler running.
    Installing,
    /// Installed, waiting for activation.
    Installed,
    /// Activate handler running.
    Activating,
    /// Active and controlling pages.
    Activated,
    /// Replaced, or install failed.
    Redundant,
}

impl ServiceWorkerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parsed => "parsed",
            Self::Installing => "installing",
            Self::Installed => "installed",
            Self::Activating => "activating",
            Self::Activated => "activated",
            Self::Redundant => "redundant",
        }
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(self, next: ServiceWorkerState) -> bool {
        use ServiceWorkerState::*;
        matches!(
            (self, next),
            (Parsed, Installing)
                | (Installing, Installed)
                | (Installed, Activating)
                | (Activating, Activated)
                | (Parsed | Installing | Installed | Activating | Activated, Redundant)
        )
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Redundant
    }
}

impl fmt::Display for ServiceWorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: ServiceWorkerState,
    pub to: ServiceWorkerState,
    pub at: Instant,
}

/// State machine of a single background-script instance.
#[derive(Debug)]
pub struct WorkerLifecycle {
    state: watch::Sender<ServiceWorkerState>,
    log: Mutex<Vec<StateTransition>>,
}

impl Default for WorkerLifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkerLifecycle {
    /// Start in [`ServiceWorkerState::Parsed`].
    pub fn new() -> Self {
        let (state, _) = watch::channel(ServiceWorkerState::Parsed);
        Self {
            state,
            log: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> ServiceWorkerState {
        *self.state.borrow()
    }

    /// Move to `to`, recording the transition.
    pub fn advance(&self, to: ServiceWorkerState) -> Result<StateTransition, ServiceWorkerError> {
        let mut log = self.log.lock().unwrap_or_else(PoisonError::into_inner);
        let from = self.state();
        if !from.can_transition_to(to) {
            return Err(ServiceWorkerError::StateError(format!(
                "illegal transition {} -> {}",
                from, to
            )));
        }

        let transition = StateTransition {
            from,
            to,
            at: Instant::now(),
        };
        log.push(transition);
        self.state.send_replace(to);
        Ok(transition)
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<ServiceWorkerState> {
        self.state.subscribe()
    }

    /// All transitions so far, oldest first.
    pub fn transitions(&self) -> Vec<StateTransition> {
        self.log
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::ServiceWorkerState::*;

    #[test]
    fn test_happy_path_is_logged_in_order() {
        let lifecycle = WorkerLifecycle::new();
        for state in [Installing, Installed, Activating, Activated] {
            lifecycle.advance(state).unwrap();
        }

        let log = lifecycle.transitions();
        assert_eq!(log.len(), 4);
        assert_eq!((log[0].from, log[0].to), (Parsed, Installing));
        assert_eq!((log[3].from, log[3].to), (Activating, Activated));
        assert!(log.windows(2).all(|w| w[0].at <= w[1].at));
        assert_eq!(lifecycle.state(), Activated);
    }

    #[test]
    fn test_illegal_transitions_are_rejected() {
        let lifecycle = WorkerLifecycle::new();
        assert!(lifecycle.advance(Installed).is_err());

        lifecycle.advance(Installing).unwrap();
        lifecycle.advance(Redundant).unwrap();
        assert!(lifecycle.advance(Installed).is_err());
        assert!(lifecycle.advance(Redundant).is_err());
        assert_eq!(lifecycle.transitions().len(), 2);
    }

    #[test]
    fn test_failed_install_goes_redundant() {
        assert!(Installing.can_transition_to(Redundant));
        assert!(!Installing.can_transition_to(Activating));
        assert!(Redundant.is_terminal());
    }

    #[tokio::test]
    async fn test_subscribers_see_latest_state() {
        let lifecycle = WorkerLifecycle::new();
        let mut rx = lifecycle.subscribe();

        lifecycle.advance(Installing).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow_and_update(), Installing);

        lifecycle.advance(Installed).unwrap();
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), Installed);
    }

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let first = ServiceWorkerId::new();
        let second = ServiceWorkerId::new();
        assert_ne!(first, second);
        assert!(second.raw() > first.raw());
        assert_eq!(second.to_string(), format!("sw-{}", second.raw()));
    }
}
