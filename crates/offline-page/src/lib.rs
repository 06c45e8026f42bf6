//! Page-side update coordination.
//!
//! Runs in the document: registers the background script, checks for new
//! versions on a timer, and tells the user about the two conditions that
//! matter.
//!
//! ```text
//! ServiceWorkerContainer --events--> UpdateCoordinator --> UpdateNotifier (NoticeBoard)
//!          ^                               |
//!          +------ SKIP_WAITING -----------+--> PageHost::reload (once)
//! ```

pub mod coordinator;
pub mod notice;
pub mod reload;

pub use coordinator::{PageHost, UpdateCoordinator, UpdateNotifier};
pub use notice::{Notice, NoticeAction, NoticeBoard, NoticeKind, NoticeSink};
pub use reload::ReloadGuard;
