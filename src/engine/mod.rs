//! Engine-wide coordination: the scheduler, the per-download request group,
//! and session persistence.

pub mod request_group;
pub mod scheduler;
pub mod session;

pub use request_group::{DownloadState, DownloadStatus, RequestGroup};
pub use scheduler::{DownloadEngine, EngineConfig, Event, EventCallback, EventKind};
pub use session::{Session, SessionEntry, SessionManager};
