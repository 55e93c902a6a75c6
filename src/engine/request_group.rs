//! Per-download orchestration: probe the origin, pick a transfer mode, drive
//! range workers, persist resume state, and verify the finished file.

use crate::checksum::{self, ChecksumSpec};
use crate::control::{ControlFile, Controller};
use crate::disk::BufferedAdapter;
use crate::error::{DownloadError, Result};
use crate::gid::Gid;
use crate::limit::RateLimiter;
use crate::logging;
use crate::options::DownloadOptions;
use crate::segment::{optimal_piece_length, PieceStorage, SegmentManager};
use crate::stats::SpeedCalc;
use crate::ui::{ProgressSink, ProgressUpdate};
use futures_util::StreamExt;
use reqwest::{header, Client, StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinSet;

const CONTROL_SAVE_INTERVAL: Duration = Duration::from_secs(30);
const STATS_INTERVAL: Duration = Duration::from_secs(1);
const PAUSE_POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Segment/counter updates are batched to this many bytes to keep lock
/// traffic off the hot read path.
const FLUSH_THRESHOLD: u64 = 256 * 1024;

/// Download lifecycle. Permitted transitions are
/// `Pending -> Active -> (Paused <-> Active) -> Complete | Error | Cancelled`;
/// `Error` and `Cancelled` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum DownloadState {
    Pending = 0,
    Active = 1,
    Paused = 2,
    Complete = 3,
    Error = 4,
    Cancelled = 5,
}

impl DownloadState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Self::Active,
            2 => Self::Paused,
            3 => Self::Complete,
            4 => Self::Error,
            5 => Self::Cancelled,
            _ => Self::Pending,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Error | Self::Cancelled)
    }
}

/// Point-in-time snapshot of a download, fed to events and the CLI.
#[derive(Debug, Clone)]
pub struct DownloadStatus {
    pub gid: Gid,
    pub state: DownloadState,
    pub total: u64,
    pub completed: u64,
    pub speed: u64,
    pub output_path: Option<PathBuf>,
    pub checksum_ok: Option<bool>,
    pub error: Option<String>,
}

/// One download: a set of URIs (the first is dialed; the rest are held as
/// mirrors for future use), an immutable option record, and the transfer
/// state machine.
pub struct RequestGroup {
    gid: Gid,
    uris: Vec<String>,
    options: DownloadOptions,
    client: Client,
    priority: i32,

    state: AtomicU8,
    completed_bytes: AtomicU64,
    total_length: AtomicU64,
    output_path: Mutex<Option<PathBuf>>,
    last_error: Mutex<Option<String>>,
    checksum_ok: Mutex<Option<bool>>,
    speed: SpeedCalc,
    limiter: RateLimiter,
    progress: Mutex<Option<Arc<dyn ProgressSink>>>,

    paused: watch::Sender<bool>,
    cancelled: watch::Sender<bool>,
}

impl RequestGroup {
    pub fn new(
        gid: Gid,
        uris: Vec<String>,
        options: DownloadOptions,
        client: Client,
        priority: i32,
    ) -> Self {
        let limiter = RateLimiter::new(options.max_download_limit);
        let (paused, _) = watch::channel(false);
        let (cancelled, _) = watch::channel(false);
        Self {
            gid,
            uris,
            options,
            client,
            priority,
            state: AtomicU8::new(DownloadState::Pending as u8),
            completed_bytes: AtomicU64::new(0),
            total_length: AtomicU64::new(0),
            output_path: Mutex::new(None),
            last_error: Mutex::new(None),
            checksum_ok: Mutex::new(None),
            speed: SpeedCalc::new(),
            limiter,
            progress: Mutex::new(None),
            paused,
            cancelled,
        }
    }

    pub fn gid(&self) -> &Gid {
        &self.gid
    }

    pub fn uris(&self) -> &[String] {
        &self.uris
    }

    pub fn options(&self) -> &DownloadOptions {
        &self.options
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn state(&self) -> DownloadState {
        DownloadState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn mark_paused(&self) {
        self.state
            .store(DownloadState::Paused as u8, Ordering::Release);
        self.paused.send_replace(true);
    }

    pub fn set_progress_sink(&self, sink: Arc<dyn ProgressSink>) {
        let mut slot = self
            .progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(sink);
    }

    fn progress_sink(&self) -> Option<Arc<dyn ProgressSink>> {
        self.progress
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Pause is permitted only from `Active`. Idempotent: repeated calls
    /// return false.
    pub fn pause(&self) -> bool {
        if self
            .state
            .compare_exchange(
                DownloadState::Active as u8,
                DownloadState::Paused as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.paused.send_replace(true);
            return true;
        }
        false
    }

    /// Resume is permitted only from `Paused`.
    pub fn resume(&self) -> bool {
        if self
            .state
            .compare_exchange(
                DownloadState::Paused as u8,
                DownloadState::Active as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.paused.send_replace(false);
            return true;
        }
        false
    }

    /// Cancel is permitted from any non-terminal state. All workers observe
    /// the shared flag without per-worker wiring.
    pub fn cancel(&self) -> bool {
        loop {
            let current = self.state.load(Ordering::Acquire);
            if DownloadState::from_u8(current).is_terminal() {
                return false;
            }
            if self
                .state
                .compare_exchange(
                    current,
                    DownloadState::Cancelled as u8,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                self.cancelled.send_replace(true);
                return true;
            }
        }
    }

    pub fn is_paused(&self) -> bool {
        self.state() == DownloadState::Paused
    }

    /// The cancel flag is authoritative: a cancel issued before `execute`
    /// started still stops the transfer.
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    pub fn status(&self) -> DownloadStatus {
        DownloadStatus {
            gid: self.gid.clone(),
            state: self.state(),
            total: self.total_length.load(Ordering::Acquire),
            completed: self.completed_bytes.load(Ordering::Acquire),
            speed: self.speed.speed(),
            output_path: self
                .output_path
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
            checksum_ok: *self
                .checksum_ok
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()),
            error: self
                .last_error
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .clone(),
        }
    }

    fn record_error(&self, message: String) {
        let mut slot = self
            .last_error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(message);
    }

    /// Runs the download to a terminal state. `shutdown` is the engine-wide
    /// stop signal, kept separate from per-download cancel so the two are
    /// distinguishable in events.
    pub async fn execute(
        self: Arc<Self>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        self.state
            .store(DownloadState::Active as u8, Ordering::Release);

        let result = self.run(shutdown).await;

        match &result {
            Ok(()) => {
                if self.is_cancelled() {
                    self.state
                        .store(DownloadState::Cancelled as u8, Ordering::Release);
                } else {
                    self.state
                        .store(DownloadState::Complete as u8, Ordering::Release);
                }
            }
            Err(e) => {
                if self.is_cancelled() {
                    self.state
                        .store(DownloadState::Cancelled as u8, Ordering::Release);
                    self.record_error(DownloadError::Cancelled.to_string());
                } else if matches!(e, DownloadError::Shutdown) {
                    // Keep Active/Paused so the session restores the download
                    // in the state it was interrupted in.
                    self.record_error(e.to_string());
                } else {
                    self.state
                        .store(DownloadState::Error as u8, Ordering::Release);
                    self.record_error(e.to_string());
                }
            }
        }
        result
    }

    async fn run(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Result<()> {
        let Some(uri) = self.uris.first() else {
            return Err(DownloadError::NoUris);
        };
        let url = Url::parse(uri).map_err(|e| DownloadError::InvalidUri {
            uri: uri.clone(),
            reason: e.to_string(),
        })?;

        let mut output_path = self.resolve_output_path(&url);
        let mut controller = Controller::new(&output_path);

        // A loadable sidecar with sane geometry wins over everything else.
        let mut resumed_state: Option<ControlFile> = None;
        if controller.exists() {
            match controller.load().await {
                Ok(cf) if cf.is_resumable() => resumed_state = Some(cf),
                Ok(_) => {
                    tracing::warn!(gid = %self.gid, "control file has no usable geometry; starting fresh");
                }
                Err(e) => {
                    tracing::warn!(gid = %self.gid, error = %e, "failed to load control file; starting fresh");
                }
            }
        }

        let total_length: u64;
        if let Some(cf) = &resumed_state {
            total_length = cf.total_length;
        } else {
            if tokio::fs::try_exists(&output_path).await.unwrap_or(false)
                && !self.options.allow_overwrite
            {
                if self.options.auto_file_renaming {
                    output_path = next_available_name(&output_path).await;
                    controller = Controller::new(&output_path);
                } else {
                    return Err(DownloadError::FileConflict { path: output_path });
                }
            }

            let head = self
                .enrich_request(self.client.head(url.clone()))
                .send()
                .await?;
            let status = head.status();
            if !status.is_success() {
                return Err(DownloadError::HttpStatus { status });
            }

            let content_length = header_u64(&head, header::CONTENT_LENGTH);
            let accept_ranges = head
                .headers()
                .get(header::ACCEPT_RANGES)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.eq_ignore_ascii_case("bytes"))
                .unwrap_or(false);

            if let Some(len) = content_length {
                self.total_length.store(len, Ordering::Release);
            }
            self.set_output_path(&output_path);

            match content_length {
                Some(len) if len > 0 && accept_ranges => total_length = len,
                _ => {
                    // No usable length or no range support: stream over a
                    // single connection instead.
                    self.download_single(&url, &output_path, shutdown).await?;
                    return self.verify_checksum(&output_path).await;
                }
            }
        }
        self.total_length.store(total_length, Ordering::Release);
        self.set_output_path(&output_path);

        let piece_length = match &resumed_state {
            Some(cf) => cf.piece_length,
            None => optimal_piece_length(total_length),
        };
        let storage = Arc::new(PieceStorage::new(total_length, piece_length));
        let manager = Arc::new(SegmentManager::new(
            Arc::clone(&storage),
            self.options.max_pieces_per_segment,
            self.options.piece_selector,
        ));

        if let Some(cf) = &resumed_state {
            match storage.bitfield().from_hex(&cf.bitfield) {
                Ok(()) => {
                    self.completed_bytes
                        .store(storage.completed_bytes(), Ordering::Release);
                }
                Err(e) => {
                    tracing::warn!(gid = %self.gid, error = %e, "failed to restore bitfield; re-downloading everything");
                }
            }
        } else {
            self.save_control_file(&controller, &storage, &output_path)
                .await;
        }

        let adapter = Arc::new(BufferedAdapter::new(self.options.file_allocation));
        adapter.open_queue(&output_path, total_length)?;

        let result = self
            .run_workers(&url, &controller, &storage, &manager, &adapter, &output_path, shutdown)
            .await;
        if result.is_err() {
            if let Err(e) = adapter.close_queue() {
                tracing::warn!(gid = %self.gid, error = %e, "closing disk adapter after failure");
            }
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    async fn run_workers(
        self: &Arc<Self>,
        url: &Url,
        controller: &Controller,
        storage: &Arc<PieceStorage>,
        manager: &Arc<SegmentManager>,
        adapter: &Arc<BufferedAdapter>,
        output_path: &Path,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let split = self.options.split.max(1);
        let mut workers: JoinSet<Result<()>> = JoinSet::new();
        for id in 0..split {
            let rg = Arc::clone(self);
            let manager = Arc::clone(manager);
            let adapter = Arc::clone(adapter);
            let url = url.clone();
            let shutdown = shutdown.clone();
            workers.spawn(async move {
                rg.worker_loop(id as usize, url, manager, adapter, shutdown)
                    .await
            });
        }

        self.save_control_file(controller, storage, output_path).await;

        let mut save_tick = tokio::time::interval(CONTROL_SAVE_INTERVAL);
        save_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut stats_tick = tokio::time::interval(STATS_INTERVAL);
        stats_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        let cancel_rx = self.cancelled.subscribe();
        let pause_rx = self.paused.subscribe();
        let shutdown_rx = shutdown.clone();

        loop {
            tokio::select! {
                _ = wait_flag(cancel_rx.clone(), true) => {
                    self.save_control_file(controller, storage, output_path).await;
                    return Err(DownloadError::Cancelled);
                }
                _ = wait_flag(pause_rx.clone(), true) => {
                    self.save_control_file(controller, storage, output_path).await;
                    loop {
                        tokio::select! {
                            _ = wait_flag(pause_rx.clone(), false) => break,
                            _ = wait_flag(cancel_rx.clone(), true) => {
                                return Err(DownloadError::Cancelled);
                            }
                            _ = wait_flag(shutdown_rx.clone(), true) => {
                                self.save_control_file(controller, storage, output_path).await;
                                return Err(DownloadError::Shutdown);
                            }
                        }
                    }
                }
                _ = wait_flag(shutdown_rx.clone(), true) => {
                    self.save_control_file(controller, storage, output_path).await;
                    return Err(DownloadError::Shutdown);
                }
                _ = save_tick.tick() => {
                    self.save_control_file(controller, storage, output_path).await;
                }
                _ = stats_tick.tick() => {
                    if !self.is_paused() {
                        self.emit_progress(self.speed.speed());
                    }
                }
                joined = workers.join_next() => match joined {
                    Some(Ok(Ok(()))) => {}
                    Some(Ok(Err(e))) => {
                        self.save_control_file(controller, storage, output_path).await;
                        return Err(e);
                    }
                    Some(Err(join_err)) => {
                        self.save_control_file(controller, storage, output_path).await;
                        return Err(DownloadError::TaskJoin(join_err));
                    }
                    None => {
                        self.emit_progress(0);
                        if !manager.is_all_complete() {
                            self.save_control_file(controller, storage, output_path).await;
                            return Err(DownloadError::Incomplete);
                        }
                        adapter.close_queue()?;
                        if let Err(e) = controller.remove().await {
                            tracing::warn!(gid = %self.gid, error = %e, "failed to remove control file");
                        }
                        return self.verify_checksum(output_path).await;
                    }
                }
            }
        }
    }

    /// One connection slot: claim a segment, fetch it with retries, repeat
    /// until the manager is drained.
    async fn worker_loop(
        self: Arc<Self>,
        id: usize,
        url: Url,
        manager: Arc<SegmentManager>,
        adapter: Arc<BufferedAdapter>,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let max_tries = self.options.max_tries.max(1);
        let retry_wait = self.options.retry_wait();

        loop {
            if self.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            // Poll-sleep while paused: suspending mid-read would stall the
            // range request instead of parking it.
            while self.is_paused() {
                if self.is_cancelled() {
                    return Err(DownloadError::Cancelled);
                }
                if *shutdown.borrow() {
                    return Err(DownloadError::Shutdown);
                }
                tokio::time::sleep(PAUSE_POLL_INTERVAL).await;
            }
            if *shutdown.borrow() {
                return Err(DownloadError::Shutdown);
            }

            let Some(claim) = manager.get_segment() else {
                return Ok(());
            };
            let segment_index = claim.index;

            let mut last_error: Option<DownloadError> = None;
            let mut success = false;
            for attempt in 0..max_tries {
                if self.is_cancelled() {
                    manager.cancel_segment(segment_index);
                    return Err(DownloadError::Cancelled);
                }
                if *shutdown.borrow() {
                    manager.cancel_segment(segment_index);
                    return Err(DownloadError::Shutdown);
                }

                match self
                    .run_attempt(&url, &manager, &adapter, segment_index, &shutdown)
                    .await
                {
                    Ok(()) => {
                        manager.complete_segment(segment_index);
                        success = true;
                        break;
                    }
                    Err(e) if e.is_interrupt() => {
                        manager.cancel_segment(segment_index);
                        return Err(e);
                    }
                    Err(e) => {
                        tracing::debug!(
                            gid = %self.gid,
                            worker = id,
                            segment = segment_index,
                            attempt,
                            error = %e,
                            "segment attempt failed"
                        );
                        last_error = Some(e);
                        if attempt + 1 < max_tries && !retry_wait.is_zero() {
                            tokio::select! {
                                _ = tokio::time::sleep(retry_wait) => {}
                                _ = wait_flag(self.cancelled.subscribe(), true) => {
                                    manager.cancel_segment(segment_index);
                                    return Err(DownloadError::Cancelled);
                                }
                                _ = wait_flag(shutdown.clone(), true) => {
                                    manager.cancel_segment(segment_index);
                                    return Err(DownloadError::Shutdown);
                                }
                            }
                        }
                    }
                }
            }

            if !success {
                manager.cancel_segment(segment_index);
                let source = last_error.unwrap_or(DownloadError::Incomplete);
                return Err(DownloadError::Worker {
                    id,
                    segment: segment_index,
                    tries: max_tries,
                    source: Box::new(source),
                });
            }
        }
    }

    /// One ranged GET for one segment. Resumes from `written` so a retried
    /// segment only re-fetches what is missing.
    async fn run_attempt(
        &self,
        url: &Url,
        manager: &SegmentManager,
        adapter: &BufferedAdapter,
        segment_index: u64,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<()> {
        let Some(seg) = manager.claim(segment_index) else {
            return Ok(());
        };
        let start = seg.position + seg.written;
        let end = seg.position + seg.length - 1;
        if start > end {
            return Ok(());
        }

        let request = self
            .enrich_request(self.client.get(url.clone()))
            .header(header::RANGE, format!("bytes={start}-{end}"));
        let response = request.send().await?;
        let status = response.status();
        if status != StatusCode::PARTIAL_CONTENT && status != StatusCode::OK {
            return Err(DownloadError::HttpStatus { status });
        }

        // A 200 means the server ignored the range and is replaying the file
        // from byte zero: discard up to `start`, then take the request size.
        let mut discard = if status == StatusCode::OK { start } else { 0 };
        let mut request_remaining = end - start + 1;
        let mut offset = start;
        let mut pending: u64 = 0;

        let lowest_speed = self.options.lowest_speed_limit;
        let check_interval = self.options.speed_check_interval();
        let mut last_check = Instant::now();
        let mut bytes_since_check: u64 = 0;

        let cancel_rx = self.cancelled.subscribe();
        let mut stream = response.bytes_stream();

        loop {
            let item = tokio::select! {
                item = stream.next() => item,
                _ = wait_flag(cancel_rx.clone(), true) => {
                    self.flush_progress(manager, segment_index, &mut pending);
                    return Err(DownloadError::Cancelled);
                }
                _ = wait_flag(shutdown.clone(), true) => {
                    self.flush_progress(manager, segment_index, &mut pending);
                    return Err(DownloadError::Shutdown);
                }
            };
            let Some(item) = item else {
                break;
            };
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.flush_progress(manager, segment_index, &mut pending);
                    return Err(DownloadError::Network(e));
                }
            };
            let received = chunk.len() as u64;

            let mut data = &chunk[..];
            if discard > 0 {
                let skip = discard.min(data.len() as u64);
                data = &data[skip as usize..];
                discard -= skip;
            }
            let take = request_remaining.min(data.len() as u64) as usize;
            if take > 0 {
                let data = &data[..take];
                if let Err(e) = adapter.enqueue_write(data, offset).await {
                    self.flush_progress(manager, segment_index, &mut pending);
                    return Err(DownloadError::Disk(e));
                }
                offset += take as u64;
                request_remaining -= take as u64;
                pending += take as u64;

                if pending >= FLUSH_THRESHOLD
                    && self.flush_progress(manager, segment_index, &mut pending)
                {
                    // An endgame thief took the tail; nothing left to write.
                    break;
                }
            }

            if lowest_speed > 0 {
                bytes_since_check += received;
                let elapsed = last_check.elapsed();
                if elapsed >= check_interval {
                    let observed = (bytes_since_check as f64 / elapsed.as_secs_f64()) as u64;
                    if observed < lowest_speed {
                        self.flush_progress(manager, segment_index, &mut pending);
                        return Err(DownloadError::SpeedTooLow {
                            observed,
                            minimum: lowest_speed,
                        });
                    }
                    last_check = Instant::now();
                    bytes_since_check = 0;
                }
            }

            // Tokens are taken after the read so bytes already on the wire
            // are accounted for instead of stalled mid-transfer.
            self.limiter.wait(received as usize).await;

            if request_remaining == 0 {
                break;
            }
        }

        let complete = self.flush_progress(manager, segment_index, &mut pending);
        // A stream that ends before delivering the requested range must not
        // promote the segment's pieces; let the retry loop re-fetch the tail.
        if request_remaining > 0 && !complete {
            return Err(DownloadError::ShortBody {
                missing: request_remaining,
            });
        }
        Ok(())
    }

    /// Applies batched byte counts to the segment, the atomic total, and the
    /// speed window. Returns true when the segment is complete.
    fn flush_progress(&self, manager: &SegmentManager, segment_index: u64, pending: &mut u64) -> bool {
        if *pending == 0 {
            return manager
                .claim(segment_index)
                .map(|c| c.written == c.length)
                .unwrap_or(false);
        }
        let complete = manager.update_segment(segment_index, *pending);
        self.completed_bytes.fetch_add(*pending, Ordering::AcqRel);
        self.speed.update(*pending);
        *pending = 0;
        complete
    }

    /// Single-connection fallback for servers without a usable length or
    /// range support. Resumes by appending: the current file size becomes
    /// the range start.
    async fn download_single(
        &self,
        url: &Url,
        output_path: &Path,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let max_tries = self.options.max_tries.max(1);
        let retry_wait = self.options.retry_wait();
        let cancel_rx = self.cancelled.subscribe();

        let mut last_error: Option<DownloadError> = None;
        for attempt in 0..max_tries {
            if self.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            if *shutdown.borrow() {
                return Err(DownloadError::Shutdown);
            }

            match self
                .single_attempt(url, output_path, &cancel_rx, &shutdown)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_interrupt() => return Err(e),
                Err(e) => {
                    tracing::debug!(gid = %self.gid, attempt, error = %e, "single-connection attempt failed");
                    last_error = Some(e);
                    if attempt + 1 < max_tries && !retry_wait.is_zero() {
                        tokio::select! {
                            _ = tokio::time::sleep(retry_wait) => {}
                            _ = wait_flag(cancel_rx.clone(), true) => return Err(DownloadError::Cancelled),
                            _ = wait_flag(shutdown.clone(), true) => return Err(DownloadError::Shutdown),
                        }
                    }
                }
            }
        }
        Err(last_error.unwrap_or(DownloadError::Incomplete))
    }

    async fn single_attempt(
        &self,
        url: &Url,
        output_path: &Path,
        cancel_rx: &watch::Receiver<bool>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<()> {
        let mut start_pos = tokio::fs::metadata(output_path)
            .await
            .map(|m| m.len())
            .unwrap_or(0);

        let mut request = self.enrich_request(self.client.get(url.clone()));
        if start_pos > 0 {
            request = request.header(header::RANGE, format!("bytes={start_pos}-"));
        }
        let response = request.send().await?;
        let status = response.status();

        if start_pos > 0 && status == StatusCode::RANGE_NOT_SATISFIABLE {
            // Nothing past our offset: the file is already complete.
            return Ok(());
        }
        if start_pos > 0 && status != StatusCode::PARTIAL_CONTENT {
            // The server ignored the range; restart from zero.
            start_pos = 0;
        }
        if start_pos == 0 && status != StatusCode::OK {
            return Err(DownloadError::HttpStatus { status });
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(start_pos > 0)
            .truncate(start_pos == 0)
            .open(output_path)
            .await?;

        self.completed_bytes.store(start_pos, Ordering::Release);
        let mut last_emit = Instant::now();
        let mut stream = response.bytes_stream();

        loop {
            let item = tokio::select! {
                item = stream.next() => item,
                _ = wait_flag(cancel_rx.clone(), true) => return Err(DownloadError::Cancelled),
                _ = wait_flag(shutdown.clone(), true) => return Err(DownloadError::Shutdown),
            };
            let Some(item) = item else {
                break;
            };
            let chunk = item?;
            if chunk.is_empty() {
                continue;
            }
            file.write_all(&chunk).await?;
            self.completed_bytes
                .fetch_add(chunk.len() as u64, Ordering::AcqRel);
            self.speed.update(chunk.len() as u64);

            if last_emit.elapsed() >= STATS_INTERVAL {
                self.emit_progress(self.speed.speed());
                last_emit = Instant::now();
            }
            self.limiter.wait(chunk.len()).await;
        }

        file.flush().await?;
        self.emit_progress(0);
        Ok(())
    }

    fn resolve_output_path(&self, url: &Url) -> PathBuf {
        let file_name = match &self.options.out {
            Some(out) => out.clone(),
            None => {
                let candidate = url
                    .path_segments()
                    .and_then(|segments| segments.last())
                    .unwrap_or("")
                    .to_string();
                if candidate.is_empty() || candidate == "/" || candidate == "." {
                    "index.html".to_string()
                } else {
                    candidate
                }
            }
        };
        match &self.options.dir {
            Some(dir) => dir.join(file_name),
            None => PathBuf::from(file_name),
        }
    }

    fn set_output_path(&self, path: &Path) {
        let mut slot = self
            .output_path
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(path.to_path_buf());
    }

    /// Applies User-Agent, Referer, custom headers, and Basic Auth. Cookies
    /// are not handled here; the jar lives on the shared client.
    fn enrich_request(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if let Some(ua) = &self.options.user_agent {
            request = request.header(header::USER_AGENT, ua.as_str());
        }
        if let Some(referer) = &self.options.referer {
            request = request.header(header::REFERER, referer.as_str());
        }
        for (name, value) in &self.options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if self.options.http_user.is_some() || self.options.http_passwd.is_some() {
            request = request.basic_auth(
                self.options.http_user.clone().unwrap_or_default(),
                self.options.http_passwd.clone(),
            );
        }
        request
    }

    /// Save failures are logged, never fatal: losing a snapshot only costs
    /// re-downloading since the previous one.
    async fn save_control_file(
        &self,
        controller: &Controller,
        storage: &PieceStorage,
        output_path: &Path,
    ) {
        let state = ControlFile {
            gid: self.gid.to_string(),
            total_length: storage.total_length(),
            piece_length: storage.piece_length(),
            num_pieces: storage.num_pieces(),
            bitfield: storage.bitfield().to_hex(),
            uris: self.uris.clone(),
            path: output_path.display().to_string(),
        };
        if let Err(e) = controller.save(&state).await {
            if logging::warn_throttled("control-file-save", Duration::from_secs(60)) {
                tracing::warn!(gid = %self.gid, error = %e, "failed to save control file");
            }
        }
    }

    async fn verify_checksum(&self, output_path: &Path) -> Result<()> {
        let Some(raw) = &self.options.checksum else {
            return Ok(());
        };
        let spec = ChecksumSpec::parse(raw)?;
        let result = checksum::verify_file(output_path, &spec).await;
        let mut slot = self
            .checksum_ok
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(result.is_ok());
        drop(slot);
        result
    }

    fn emit_progress(&self, speed: u64) {
        let Some(sink) = self.progress_sink() else {
            return;
        };
        let total = self.total_length.load(Ordering::Acquire);
        let mut completed = self.completed_bytes.load(Ordering::Acquire);
        if total > 0 {
            completed = completed.min(total);
        }
        sink.progress(&ProgressUpdate {
            gid: self.gid.clone(),
            total,
            completed,
            speed,
            connections: self.options.split.max(1),
        });
    }
}

/// Resolves once the flag reaches `target`; never resolves if the sender is
/// gone (the select arm simply stays quiet).
async fn wait_flag(mut rx: watch::Receiver<bool>, target: bool) {
    loop {
        if *rx.borrow() == target {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

fn header_u64(response: &reqwest::Response, name: header::HeaderName) -> Option<u64> {
    response
        .headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
}

/// Appends `.1`, `.2`, ... before the extension until a free name is found.
async fn next_available_name(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("download");
    let ext = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| format!(".{e}"))
        .unwrap_or_default();

    let mut counter = 1u64;
    loop {
        let candidate_name = format!("{stem}.{counter}{ext}");
        let candidate = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.join(&candidate_name),
            _ => PathBuf::from(&candidate_name),
        };
        if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        counter += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn group(uris: Vec<String>) -> RequestGroup {
        RequestGroup::new(
            Gid::generate().expect("gid"),
            uris,
            DownloadOptions::default(),
            Client::new(),
            0,
        )
    }

    #[test]
    fn state_transitions_are_gated() {
        let rg = group(vec!["http://example.com/a".to_string()]);
        assert_eq!(rg.state(), DownloadState::Pending);

        // Pause from Pending is rejected.
        assert!(!rg.pause());

        rg.state
            .store(DownloadState::Active as u8, Ordering::Release);
        assert!(rg.pause());
        assert!(!rg.pause());
        assert!(rg.is_paused());

        assert!(rg.resume());
        assert!(!rg.resume());
        assert_eq!(rg.state(), DownloadState::Active);

        assert!(rg.cancel());
        assert!(!rg.cancel());
        assert!(rg.is_cancelled());

        // Terminal states refuse further transitions.
        assert!(!rg.pause());
        assert!(!rg.resume());
    }

    #[test]
    fn cancel_is_visible_through_the_watch_channel() {
        let rg = group(vec!["http://example.com/a".to_string()]);
        let rx = rg.cancelled.subscribe();
        rg.state
            .store(DownloadState::Active as u8, Ordering::Release);
        assert!(rg.cancel());
        assert!(*rx.borrow());
    }

    #[test]
    fn output_path_falls_back_to_index_html() {
        let rg = group(vec!["http://example.com/".to_string()]);
        let url = Url::parse("http://example.com/").expect("url");
        assert_eq!(rg.resolve_output_path(&url), PathBuf::from("index.html"));

        let url = Url::parse("http://example.com/files/data.bin").expect("url");
        assert_eq!(rg.resolve_output_path(&url), PathBuf::from("data.bin"));
    }

    #[test]
    fn output_path_honors_out_and_dir() {
        let mut options = DownloadOptions::default();
        options.out = Some("named.bin".to_string());
        options.dir = Some(PathBuf::from("/downloads"));
        let rg = RequestGroup::new(
            Gid::generate().expect("gid"),
            vec!["http://example.com/whatever".to_string()],
            options,
            Client::new(),
            0,
        );
        let url = Url::parse("http://example.com/whatever").expect("url");
        assert_eq!(
            rg.resolve_output_path(&url),
            PathBuf::from("/downloads/named.bin")
        );
    }

    #[tokio::test]
    async fn execute_with_no_uris_fails() {
        let rg = Arc::new(group(Vec::new()));
        let (_tx, rx) = watch::channel(false);
        let err = rg.clone().execute(rx).await.expect_err("no uris");
        assert!(matches!(err, DownloadError::NoUris));
        assert_eq!(rg.state(), DownloadState::Error);
    }

    #[tokio::test]
    async fn execute_with_invalid_uri_fails() {
        let rg = Arc::new(group(vec!["not a uri".to_string()]));
        let (_tx, rx) = watch::channel(false);
        let err = rg.clone().execute(rx).await.expect_err("invalid uri");
        assert!(matches!(err, DownloadError::InvalidUri { .. }));
    }

    #[tokio::test]
    async fn next_available_name_inserts_counter_before_extension() {
        let dir = std::env::temp_dir().join(format!("grapnel-rename-{}", std::process::id()));
        tokio::fs::create_dir_all(&dir).await.expect("mkdir");
        let base = dir.join("report.pdf");
        tokio::fs::write(&base, b"x").await.expect("write");
        tokio::fs::write(dir.join("report.1.pdf"), b"x")
            .await
            .expect("write");

        let next = next_available_name(&base).await;
        assert_eq!(next, dir.join("report.2.pdf"));

        let _ = tokio::fs::remove_dir_all(dir).await;
    }

    #[test]
    fn status_snapshot_reflects_counters() {
        let rg = group(vec!["http://example.com/a".to_string()]);
        rg.total_length.store(1000, Ordering::Release);
        rg.completed_bytes.store(250, Ordering::Release);
        let status = rg.status();
        assert_eq!(status.total, 1000);
        assert_eq!(status.completed, 250);
        assert_eq!(status.state, DownloadState::Pending);
        assert!(status.error.is_none());
    }
}
