//! Notification board for the two user-facing conditions.
//!
//! The board decides when notices appear and disappear; a [`NoticeSink`]
//! renders them.

use hashbrown::HashMap;
use offline_common::OfflineConfig;
use offline_sw::{ClientMessage, ServiceWorker, ServiceWorkerError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use crate::coordinator::UpdateNotifier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NoticeKind {
    /// Actionable: a new version is waiting.
    UpdateAvailable,
    /// Informational: offline support is ready.
    Installed,
}

/// Button on a notice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeAction {
    Update,
    Close,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: NoticeKind,
    pub title: String,
    pub body: String,
    pub actions: Vec<NoticeAction>,
}

impl Notice {
    pub fn update_available() -> Self {
        Self {
            kind: NoticeKind::UpdateAvailable,
            title: "New version available".to_string(),
            body: "Tap \"Update\" to see what changed".to_string(),
            actions: vec![NoticeAction::Update, NoticeAction::Close],
        }
    }

    pub fn installed() -> Self {
        Self {
            kind: NoticeKind::Installed,
            title: "App installed".to_string(),
            body: "The app now works offline".to_string(),
            actions: Vec::new(),
        }
    }
}

/// Renders notices.
pub trait NoticeSink: Send + Sync {
    fn show(&self, notice: &Notice);

    /// The exit phase started.
    fn dismissing(&self, kind: NoticeKind);

    fn remove(&self, kind: NoticeKind);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Shown,
    Dismissing,
}

struct Slot {
    phase: Phase,
    timer: Option<AbortHandle>,
}

#[derive(Default)]
struct BoardState {
    slots: HashMap<NoticeKind, Slot>,
    pending: Option<ServiceWorker>,
}

struct BoardInner {
    sink: Arc<dyn NoticeSink>,
    installed_delay: Duration,
    exit_delay: Duration,
    state: Mutex<BoardState>,
}

impl BoardInner {
    fn state(&self) -> MutexGuard<'_, BoardState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for BoardInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for slot in state.slots.values() {
            if let Some(timer) = &slot.timer {
                timer.abort();
            }
        }
    }
}

/// Shows at most one notice of each kind and runs their dismiss timers.
///
/// Dropping the board cancels every pending timer.
pub struct NoticeBoard {
    inner: Arc<BoardInner>,
}

impl NoticeBoard {
    pub fn new(sink: Arc<dyn NoticeSink>, installed_delay: Duration, exit_delay: Duration) -> Self {
        Self {
            inner: Arc::new(BoardInner {
                sink,
                installed_delay,
                exit_delay,
                state: Mutex::new(BoardState::default()),
            }),
        }
    }

    pub fn from_config(sink: Arc<dyn NoticeSink>, config: &OfflineConfig) -> Self {
        Self::new(sink, config.installed_notice_delay(), config.notice_exit_delay())
    }

    pub fn is_visible(&self, kind: NoticeKind) -> bool {
        self.inner.state().slots.contains_key(&kind)
    }

    /// User pressed "Update": ask the waiting worker to activate.
    ///
    /// Returns false when no update is pending. The notice stays up; the
    /// page reloads once the new worker takes control.
    pub async fn accept(&self) -> Result<bool, ServiceWorkerError> {
        let worker = self.inner.state().pending.clone();
        let Some(worker) = worker else {
            return Ok(false);
        };

        info!(worker = %worker.id(), "Update accepted");
        worker.post_message(ClientMessage::SkipWaiting).await?;
        Ok(true)
    }

    /// User closed the update notice.
    pub fn close(&self) {
        self.dismiss(NoticeKind::UpdateAvailable);
    }

    /// Take a notice down immediately, e.g. when the page tears it down itself.
    ///
    /// Returns false if it was not showing.
    pub fn remove(&self, kind: NoticeKind) -> bool {
        remove_notice(&self.inner, kind)
    }

    fn show(&self, notice: Notice) -> bool {
        {
            let mut state = self.inner.state();
            if state.slots.contains_key(&notice.kind) {
                debug!(kind = ?notice.kind, "Notice already showing");
                return false;
            }
            state.slots.insert(
                notice.kind,
                Slot {
                    phase: Phase::Shown,
                    timer: None,
                },
            );
        }
        self.inner.sink.show(&notice);
        true
    }

    fn dismiss(&self, kind: NoticeKind) {
        if begin_dismiss(&self.inner, kind) {
            let weak = Arc::downgrade(&self.inner);
            let delay = self.inner.exit_delay;
            self.schedule(kind, async move {
                tokio::time::sleep(delay).await;
                if let Some(inner) = weak.upgrade() {
                    remove_notice(&inner, kind);
                }
            });
        }
    }

    fn schedule_auto_dismiss(&self, kind: NoticeKind) {
        let weak = Arc::downgrade(&self.inner);
        let (delay, exit) = (self.inner.installed_delay, self.inner.exit_delay);
        self.schedule(kind, async move {
            tokio::time::sleep(delay).await;
            if !weak.upgrade().is_some_and(|inner| begin_dismiss(&inner, kind)) {
                return;
            }
            tokio::time::sleep(exit).await;
            if let Some(inner) = weak.upgrade() {
                remove_notice(&inner, kind);
            }
        });
    }

    fn schedule<F>(&self, kind: NoticeKind, timer: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(e) => {
                warn!(kind = ?kind, error = %e, "No runtime for notice timer");
                return;
            }
        };

        let task = handle.spawn(timer).abort_handle();
        let mut state = self.inner.state();
        match state.slots.get_mut(&kind) {
            Some(slot) => {
                if let Some(previous) = slot.timer.replace(task) {
                    previous.abort();
                }
            }
            None => task.abort(),
        }
    }
}

impl UpdateNotifier for NoticeBoard {
    fn update_ready(&self, worker: ServiceWorker) {
        // A newer waiting worker replaces the one the visible notice points at.
        self.inner.state().pending = Some(worker);
        self.show(Notice::update_available());
    }

    fn installed(&self) {
        if self.show(Notice::installed()) {
            self.schedule_auto_dismiss(NoticeKind::Installed);
        }
    }
}

/// Starts the exit phase. False if the notice is gone or already leaving.
fn begin_dismiss(inner: &BoardInner, kind: NoticeKind) -> bool {
    {
        let mut state = inner.state();
        match state.slots.get_mut(&kind) {
            Some(slot) if slot.phase == Phase::Shown => slot.phase = Phase::Dismissing,
            _ => return false,
        }
    }
    inner.sink.dismissing(kind);
    true
}

fn remove_notice(inner: &BoardInner, kind: NoticeKind) -> bool {
    let removed = {
        let mut state = inner.state();
        if kind == NoticeKind::UpdateAvailable {
            state.pending = None;
        }
        state.slots.remove(&kind)
    };

    let Some(slot) = removed else {
        return false;
    };
    if let Some(timer) = slot.timer {
        timer.abort();
    }
    inner.sink.remove(kind);
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Call {
        Show(NoticeKind),
        Dismissing(NoticeKind),
        Remove(NoticeKind),
    }

    #[derive(Default)]
    struct RecordingSink {
        calls: Mutex<Vec<Call>>,
    }

    impl RecordingSink {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl NoticeSink for RecordingSink {
        fn show(&self, notice: &Notice) {
            self.calls.lock().unwrap().push(Call::Show(notice.kind));
        }

        fn dismissing(&self, kind: NoticeKind) {
            self.calls.lock().unwrap().push(Call::Dismissing(kind));
        }

        fn remove(&self, kind: NoticeKind) {
            self.calls.lock().unwrap().push(Call::Remove(kind));
        }
    }

    fn board() -> (NoticeBoard, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::default());
        let board = NoticeBoard::new(
            sink.clone(),
            Duration::from_secs(5),
            Duration::from_millis(300),
        );
        (board, sink)
    }

    #[tokio::test(start_paused = true)]
    async fn test_installed_notice_dismisses_itself() {
        let (board, sink) = board();
        board.installed();
        assert_eq!(sink.calls(), vec![Call::Show(NoticeKind::Installed)]);

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(
            sink.calls(),
            vec![
                Call::Show(NoticeKind::Installed),
                Call::Dismissing(NoticeKind::Installed),
            ]
        );

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(sink.calls().last(), Some(&Call::Remove(NoticeKind::Installed)));
        assert!(!board.is_visible(NoticeKind::Installed));
    }

    #[tokio::test(start_paused = true)]
    async fn test_early_removal_cancels_timer() {
        let (board, sink) = board();
        board.installed();
        assert!(board.remove(NoticeKind::Installed));
        assert!(!board.remove(NoticeKind::Installed));

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(
            sink.calls(),
            vec![
                Call::Show(NoticeKind::Installed),
                Call::Remove(NoticeKind::Installed),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_removal_during_exit_phase_happens_once() {
        let (board, sink) = board();
        board.installed();
        tokio::time::sleep(Duration::from_millis(5_100)).await;

        assert!(board.remove(NoticeKind::Installed));
        tokio::time::sleep(Duration::from_secs(1)).await;
        let removals = sink
            .calls()
            .iter()
            .filter(|c| **c == Call::Remove(NoticeKind::Installed))
            .count();
        assert_eq!(removals, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropping_board_cancels_timers() {
        let (board, sink) = board();
        board.installed();
        drop(board);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(sink.calls(), vec![Call::Show(NoticeKind::Installed)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_plays_exit_phase() {
        let (board, sink) = board();
        board.show(Notice::update_available());
        board.close();
        board.close();
        assert!(board.is_visible(NoticeKind::UpdateAvailable));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(
            sink.calls(),
            vec![
                Call::Show(NoticeKind::UpdateAvailable),
                Call::Dismissing(NoticeKind::UpdateAvailable),
                Call::Remove(NoticeKind::UpdateAvailable),
            ]
        );
        assert!(!board.is_visible(NoticeKind::UpdateAvailable));
    }

    #[tokio::test]
    async fn test_accept_without_pending_update() {
        let (board, sink) = board();
        assert!(!board.accept().await.unwrap());
        assert!(sink.calls().is_empty());
    }

    #[test]
    fn test_notice_text() {
        let update = Notice::update_available();
        assert_eq!(update.kind, NoticeKind::UpdateAvailable);
        assert_eq!(update.actions, vec![NoticeAction::Update, NoticeAction::Close]);
        assert!(Notice::installed().actions.is_empty());
    }
}
