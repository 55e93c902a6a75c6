//! The engine owns every request group, admits them against the
//! max-concurrent limit, keeps the priority queue, and fans lifecycle events
//! out to an optional callback.

use crate::engine::request_group::{DownloadState, DownloadStatus, RequestGroup};
use crate::engine::session::{Session, SessionEntry, SessionManager};
use crate::error::{DownloadError, Result};
use crate::gid::Gid;
use crate::logging;
use crate::net::build_client;
use crate::options::{DownloadOptions, NetworkOptions};
use crate::ui::ProgressSink;
use reqwest::Client;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Start,
    Complete,
    Error,
    Pause,
    Resume,
    Cancel,
}

/// Snapshot fanned out on state transitions.
#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub gid: Gid,
    pub error: Option<String>,
    pub downloaded: u64,
    pub total: u64,
    pub speed: u64,
}

pub type EventCallback = Box<dyn Fn(Event) + Send + Sync>;

#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub network: NetworkOptions,
    /// 0 means unbounded.
    pub max_concurrent: usize,
    pub session_file: Option<PathBuf>,
}

struct QueueState {
    pending: Vec<Arc<RequestGroup>>,
    active: usize,
    max_concurrent: usize,
}

/// Process-wide download coordinator. The shared HTTP client (and its
/// connection pool) lives here; request groups only borrow it.
pub struct DownloadEngine {
    client: Client,
    groups: RwLock<HashMap<Gid, Arc<RequestGroup>>>,
    queue: Mutex<QueueState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    shutdown: watch::Sender<bool>,
    session: Option<SessionManager>,
    /// Session-restored paused downloads that have no running task yet;
    /// resume admits them instead of only flipping state.
    dormant: Mutex<HashSet<Gid>>,
    event_callback: Option<EventCallback>,
    progress_sink: Option<Arc<dyn ProgressSink>>,
}

impl DownloadEngine {
    pub fn new(config: EngineConfig) -> Result<Self> {
        let client = build_client(&config.network)?;
        let (shutdown, _) = watch::channel(false);
        Ok(Self {
            client,
            groups: RwLock::new(HashMap::new()),
            queue: Mutex::new(QueueState {
                pending: Vec::new(),
                active: 0,
                max_concurrent: config.max_concurrent,
            }),
            tasks: Mutex::new(Vec::new()),
            shutdown,
            session: config.session_file.map(SessionManager::new),
            dormant: Mutex::new(HashSet::new()),
            event_callback: None,
            progress_sink: None,
        })
    }

    /// Must be called before the engine is shared.
    pub fn set_event_callback(&mut self, callback: EventCallback) {
        self.event_callback = Some(callback);
    }

    /// Default progress sink for downloads that do not bring their own.
    pub fn set_progress_sink(&mut self, sink: Arc<dyn ProgressSink>) {
        self.progress_sink = Some(sink);
    }

    pub fn add_uri(
        self: &Arc<Self>,
        uris: Vec<String>,
        options: DownloadOptions,
        priority: i32,
    ) -> Result<Gid> {
        self.add_uri_with_sink(uris, options, priority, None)
    }

    /// Admits a download: starts it immediately when a slot is free,
    /// otherwise parks it in the priority queue (descending priority, stable
    /// on ties).
    pub fn add_uri_with_sink(
        self: &Arc<Self>,
        uris: Vec<String>,
        options: DownloadOptions,
        priority: i32,
        sink: Option<Arc<dyn ProgressSink>>,
    ) -> Result<Gid> {
        if uris.is_empty() {
            return Err(DownloadError::NoUris);
        }
        let gid = Gid::generate()?;
        let rg = Arc::new(RequestGroup::new(
            gid.clone(),
            uris,
            options,
            self.client.clone(),
            priority,
        ));
        if let Some(sink) = sink.or_else(|| self.progress_sink.clone()) {
            rg.set_progress_sink(sink);
        }

        self.groups_write().insert(gid.clone(), Arc::clone(&rg));
        self.admit(rg);
        Ok(gid)
    }

    fn admit(self: &Arc<Self>, rg: Arc<RequestGroup>) {
        let mut queue = self.queue_lock();
        if queue.max_concurrent > 0 && queue.active >= queue.max_concurrent {
            queue.pending.push(rg);
            queue
                .pending
                .sort_by(|a, b| b.priority().cmp(&a.priority()));
            return;
        }
        queue.active += 1;
        drop(queue);
        self.spawn_download(rg);
    }

    fn spawn_download(self: &Arc<Self>, rg: Arc<RequestGroup>) {
        let engine = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let shutdown = engine.shutdown.subscribe();

            engine.fire_event(EventKind::Start, &rg, None);
            let result = Arc::clone(&rg).execute(shutdown).await;
            match result {
                Ok(()) => {
                    tracing::info!(gid = %rg.gid(), "download complete");
                    engine.fire_event(EventKind::Complete, &rg, None);
                }
                Err(e) => {
                    if rg.state() == DownloadState::Cancelled {
                        tracing::info!(gid = %rg.gid(), "download cancelled");
                        engine.fire_event(EventKind::Cancel, &rg, None);
                    } else {
                        tracing::warn!(gid = %rg.gid(), error = %e, "download failed");
                        engine.fire_event(EventKind::Error, &rg, Some(e.to_string()));
                    }
                }
            }
            engine.on_download_finished().await;
        });
        self.tasks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(handle);
    }

    /// Admission happens in the same critical section that released the
    /// slot, so no separate dispatcher task is needed.
    async fn on_download_finished(self: &Arc<Self>) {
        {
            let mut queue = self.queue_lock();
            queue.active = queue.active.saturating_sub(1);
            if !queue.pending.is_empty()
                && (queue.max_concurrent == 0 || queue.active < queue.max_concurrent)
            {
                let next = queue.pending.remove(0);
                queue.active += 1;
                drop(queue);
                self.spawn_download(next);
            }
        }

        if self.session.is_some() {
            if let Err(e) = self.save_session().await {
                if logging::warn_throttled("session-save", Duration::from_secs(60)) {
                    tracing::warn!(error = %e, "failed to save session");
                }
            }
        }
    }

    fn fire_event(&self, kind: EventKind, rg: &Arc<RequestGroup>, error: Option<String>) {
        let Some(callback) = &self.event_callback else {
            return;
        };
        let status = rg.status();
        callback(Event {
            kind,
            gid: rg.gid().clone(),
            error,
            downloaded: status.completed,
            total: status.total,
            speed: status.speed,
        });
    }

    fn group(&self, gid: &Gid) -> Option<Arc<RequestGroup>> {
        self.groups
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(gid)
            .cloned()
    }

    fn groups_write(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<Gid, Arc<RequestGroup>>> {
        self.groups
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn queue_lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn status(&self, gid: &Gid) -> Option<DownloadStatus> {
        self.group(gid).map(|rg| rg.status())
    }

    pub fn statuses(&self) -> Vec<DownloadStatus> {
        self.groups
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .map(|rg| rg.status())
            .collect()
    }

    /// Events fire only on a successful transition.
    pub fn pause(&self, gid: &Gid) -> bool {
        let Some(rg) = self.group(gid) else {
            return false;
        };
        if rg.pause() {
            self.fire_event(EventKind::Pause, &rg, None);
            return true;
        }
        false
    }

    pub fn resume(self: &Arc<Self>, gid: &Gid) -> bool {
        let Some(rg) = self.group(gid) else {
            return false;
        };
        if rg.resume() {
            let was_dormant = self
                .dormant
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .remove(gid);
            if was_dormant {
                self.admit(Arc::clone(&rg));
            }
            self.fire_event(EventKind::Resume, &rg, None);
            return true;
        }
        false
    }

    pub fn cancel(&self, gid: &Gid) -> bool {
        let Some(rg) = self.group(gid) else {
            return false;
        };
        rg.cancel()
    }

    pub fn active_count(&self) -> usize {
        self.queue_lock().active
    }

    pub fn pending_count(&self) -> usize {
        self.queue_lock().pending.len()
    }

    /// Position in the pending queue; 0 is next to start. None when the
    /// download is active, finished, or unknown.
    pub fn queue_position(&self, gid: &Gid) -> Option<usize> {
        self.queue_lock()
            .pending
            .iter()
            .position(|rg| rg.gid() == gid)
    }

    pub fn queued_downloads(&self) -> Vec<Gid> {
        self.queue_lock()
            .pending
            .iter()
            .map(|rg| rg.gid().clone())
            .collect()
    }

    /// Raising the limit (or removing it with 0) dispatches queued
    /// downloads immediately; running downloads are never pre-empted.
    pub fn set_max_concurrent(self: &Arc<Self>, n: usize) {
        let mut ready = Vec::new();
        {
            let mut queue = self.queue_lock();
            let old = queue.max_concurrent;
            queue.max_concurrent = n;
            if n > old || n == 0 {
                while !queue.pending.is_empty() && (n == 0 || queue.active < n) {
                    let next = queue.pending.remove(0);
                    queue.active += 1;
                    ready.push(next);
                }
            }
        }
        for rg in ready {
            self.spawn_download(rg);
        }
    }

    /// Waits for every download to finish. Returns the single failure, or a
    /// composite error describing each failed download.
    pub async fn run(&self) -> Result<()> {
        loop {
            let handles: Vec<JoinHandle<()>> = {
                let mut tasks = self
                    .tasks
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                tasks.drain(..).collect()
            };
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                if let Err(e) = handle.await {
                    tracing::warn!(error = %e, "download task join failed");
                }
            }
        }

        let failures: Vec<(String, String)> = self
            .statuses()
            .into_iter()
            .filter(|s| s.state == DownloadState::Error)
            .filter_map(|s| s.error.map(|e| (s.gid.to_string(), e)))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            Err(DownloadError::Failed(failures))
        }
    }

    /// Snapshots the session, stops every download, and joins the tasks.
    /// Dropping the shared client afterwards releases idle connections.
    pub async fn shutdown(&self) {
        if self.session.is_some() {
            if let Err(e) = self.save_session().await {
                tracing::warn!(error = %e, "failed to save session during shutdown");
            }
        }
        self.shutdown.send_replace(true);

        loop {
            let handles: Vec<JoinHandle<()>> = {
                let mut tasks = self
                    .tasks
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner());
                tasks.drain(..).collect()
            };
            if handles.is_empty() {
                break;
            }
            for handle in handles {
                let _ = handle.await;
            }
        }
    }

    /// Serializes every non-terminal download (errors included, so they can
    /// be retried next run).
    pub async fn save_session(&self) -> Result<()> {
        let Some(session) = &self.session else {
            return Ok(());
        };
        let downloads: Vec<SessionEntry> = {
            let groups = self
                .groups
                .read()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            groups
                .values()
                .filter(|rg| {
                    !matches!(
                        rg.state(),
                        DownloadState::Complete | DownloadState::Cancelled
                    )
                })
                .map(|rg| SessionEntry {
                    gid: rg.gid().to_string(),
                    uris: rg.uris().to_vec(),
                    options: rg.options().clone(),
                    state: rg.state(),
                    priority: rg.priority(),
                })
                .collect()
        };
        session.save(&Session { downloads }).await?;
        Ok(())
    }

    /// Rebuilds downloads from the session file. Previously paused entries
    /// are registered paused and wait for an explicit resume; everything
    /// else re-enters admission.
    pub async fn load_session(self: &Arc<Self>) -> Result<usize> {
        let Some(session) = &self.session else {
            return Ok(0);
        };
        let loaded = session.load().await?;
        let count = loaded.downloads.len();

        for entry in loaded.downloads {
            let gid = Gid::from(entry.gid);
            let rg = Arc::new(RequestGroup::new(
                gid.clone(),
                entry.uris,
                entry.options,
                self.client.clone(),
                entry.priority,
            ));
            if let Some(sink) = self.progress_sink.clone() {
                rg.set_progress_sink(sink);
            }
            self.groups_write().insert(gid.clone(), Arc::clone(&rg));

            match entry.state {
                DownloadState::Paused => {
                    rg.mark_paused();
                    self.dormant
                        .lock()
                        .unwrap_or_else(|poisoned| poisoned.into_inner())
                        .insert(gid);
                }
                _ => self.admit(rg),
            }
        }
        Ok(count)
    }
}
