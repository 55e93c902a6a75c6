//! Grapnel is a multi-connection HTTP(S) download manager: files are split
//! into pieces, pieces are grouped into worker-owned segments fetched with
//! ranged GETs, and progress is persisted to a sidecar control file so an
//! interrupted download can resume where it stopped.

pub mod buffer;
pub mod checksum;
pub mod cli;
pub mod control;
pub mod disk;
pub mod engine;
pub mod error;
pub mod gid;
pub mod limit;
pub mod logging;
pub mod net;
pub mod options;
pub mod segment;
pub mod stats;
pub mod ui;

pub use engine::{
    DownloadEngine, DownloadState, DownloadStatus, EngineConfig, Event, EventKind,
};
pub use error::{DownloadError, Result, StoreError};
pub use gid::Gid;
pub use options::{DownloadOptions, NetworkOptions};
