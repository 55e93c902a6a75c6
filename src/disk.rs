//! Disk output: a direct positional writer with configurable pre-allocation,
//! and a buffered variant that decouples network workers from disk latency
//! through a bounded write queue and a single writer thread.

use crate::buffer;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// Bounded depth of the buffered write queue. When full, workers block on
/// enqueue, which slows socket reads and lets TCP flow-control the sender.
pub const WRITE_QUEUE_DEPTH: usize = 64;

/// File pre-allocation policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Allocation {
    /// No allocation; the file grows as writes land.
    None,
    /// Set the file length up front (sparse on most filesystems).
    #[default]
    Trunc,
    /// Reserve blocks; falls back to `Trunc` where unsupported.
    Falloc,
}

impl Allocation {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "none" => Some(Self::None),
            "trunc" => Some(Self::Trunc),
            "falloc" => Some(Self::Falloc),
            _ => None,
        }
    }
}

/// Contract shared by both adapters: open with known geometry, write at
/// absolute offsets (concurrent non-overlapping writes allowed), close once.
pub trait DiskAdapter {
    fn open(&self, path: &Path, total_length: u64) -> io::Result<()>;
    fn write_at(&self, data: &[u8], offset: u64) -> impl std::future::Future<Output = io::Result<()>> + Send;
    fn close(&self) -> io::Result<()>;
}

/// Writes straight to the target file with positional writes.
pub struct DirectAdapter {
    allocation: Allocation,
    file: Mutex<Option<File>>,
}

impl DirectAdapter {
    pub fn new(allocation: Allocation) -> Self {
        Self {
            allocation,
            file: Mutex::new(None),
        }
    }

    pub fn open_file(&self, path: &Path, total_length: u64) -> io::Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        if total_length > 0 {
            match self.allocation {
                Allocation::None => {}
                Allocation::Trunc => file.set_len(total_length)?,
                Allocation::Falloc => {
                    if fs2::FileExt::allocate(&file, total_length).is_err() {
                        file.set_len(total_length)?;
                    }
                }
            }
        }

        let mut slot = self
            .file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(file);
        Ok(())
    }

    pub fn write_at_sync(&self, data: &[u8], offset: u64) -> io::Result<()> {
        let slot = self
            .file
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let file = slot
            .as_ref()
            .ok_or_else(|| io::Error::other("file not open"))?;
        write_all_at(file, data, offset)
    }

    pub fn close_file(&self) -> io::Result<()> {
        let file = {
            let mut slot = self
                .file
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            slot.take()
        };
        if let Some(file) = file {
            file.sync_all()?;
        }
        Ok(())
    }
}

impl DiskAdapter for DirectAdapter {
    fn open(&self, path: &Path, total_length: u64) -> io::Result<()> {
        self.open_file(path, total_length)
    }

    fn write_at(
        &self,
        data: &[u8],
        offset: u64,
    ) -> impl std::future::Future<Output = io::Result<()>> + Send {
        std::future::ready(self.write_at_sync(data, offset))
    }

    fn close(&self) -> io::Result<()> {
        self.close_file()
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(data, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, data: &[u8], offset: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    let mut written = 0usize;
    while written < data.len() {
        let n = file.seek_write(&data[written..], offset + written as u64)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::WriteZero,
                "failed to write whole buffer",
            ));
        }
        written += n;
    }
    Ok(())
}

struct WriteRequest {
    data: Vec<u8>,
    len: usize,
    offset: u64,
}

/// Wraps [`DirectAdapter`] with a bounded queue drained by one background
/// writer thread. `write_at` copies the caller's bytes into a pooled buffer;
/// a writer failure surfaces on the next call. Close drains the queue, joins
/// the writer, then closes the file; double-close is a no-op.
pub struct BufferedAdapter {
    inner: Arc<DirectAdapter>,
    sender: Mutex<Option<mpsc::Sender<WriteRequest>>>,
    writer: Mutex<Option<std::thread::JoinHandle<()>>>,
    error: Arc<Mutex<Option<io::Error>>>,
    closed: AtomicBool,
}

impl BufferedAdapter {
    pub fn new(allocation: Allocation) -> Self {
        Self {
            inner: Arc::new(DirectAdapter::new(allocation)),
            sender: Mutex::new(None),
            writer: Mutex::new(None),
            error: Arc::new(Mutex::new(None)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn open_queue(&self, path: &Path, total_length: u64) -> io::Result<()> {
        self.inner.open_file(path, total_length)?;

        let (tx, mut rx) = mpsc::channel::<WriteRequest>(WRITE_QUEUE_DEPTH);
        let inner = Arc::clone(&self.inner);
        let error = Arc::clone(&self.error);
        let handle = std::thread::spawn(move || {
            while let Some(req) = rx.blocking_recv() {
                if let Err(e) = inner.write_at_sync(&req.data[..req.len], req.offset) {
                    let mut slot = error.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                    // Keep the first error; later ones are usually noise.
                    slot.get_or_insert(e);
                }
                buffer::put(req.data);
            }
        });

        let mut sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *sender = Some(tx);
        let mut writer = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *writer = Some(handle);
        Ok(())
    }

    fn take_error(&self) -> Option<io::Error> {
        self.error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    pub async fn enqueue_write(&self, data: &[u8], offset: u64) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::other("adapter closed"));
        }
        if let Some(e) = self.take_error() {
            return Err(e);
        }

        let mut copy = if data.len() <= buffer::BUFFER_SIZE {
            buffer::get()
        } else {
            // Unusually large chunks get a dedicated buffer.
            vec![0u8; data.len()]
        };
        copy[..data.len()].copy_from_slice(data);

        let sender = {
            let slot = self
                .sender
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            slot.clone()
        };
        let Some(sender) = sender else {
            return Err(io::Error::other("adapter not open"));
        };
        sender
            .send(WriteRequest {
                data: copy,
                len: data.len(),
                offset,
            })
            .await
            .map_err(|_| io::Error::other("write queue closed"))
    }

    pub fn close_queue(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        {
            let mut sender = self
                .sender
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            sender.take();
        }
        let handle = {
            let mut writer = self
                .writer
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            writer.take()
        };
        if let Some(handle) = handle {
            handle
                .join()
                .map_err(|_| io::Error::other("disk writer thread panicked"))?;
        }
        if let Some(e) = self.take_error() {
            let _ = self.inner.close_file();
            return Err(e);
        }
        self.inner.close_file()
    }
}

impl DiskAdapter for BufferedAdapter {
    fn open(&self, path: &Path, total_length: u64) -> io::Result<()> {
        self.open_queue(path, total_length)
    }

    fn write_at(
        &self,
        data: &[u8],
        offset: u64,
    ) -> impl std::future::Future<Output = io::Result<()>> + Send {
        self.enqueue_write(data, offset)
    }

    fn close(&self) -> io::Result<()> {
        self.close_queue()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn temp_path(tag: &str) -> PathBuf {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        let id = NEXT.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "grapnel-disk-{tag}-{}-{id}.bin",
            std::process::id()
        ))
    }

    #[test]
    fn direct_adapter_writes_at_offsets() {
        let path = temp_path("direct");
        let adapter = DirectAdapter::new(Allocation::Trunc);
        adapter.open_file(&path, 10).expect("open");
        adapter.write_at_sync(b"world", 5).expect("tail");
        adapter.write_at_sync(b"hello", 0).expect("head");
        adapter.close_file().expect("close");

        assert_eq!(std::fs::read(&path).expect("read"), b"helloworld");
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn trunc_allocation_sets_the_length_up_front() {
        let path = temp_path("trunc");
        let adapter = DirectAdapter::new(Allocation::Trunc);
        adapter.open_file(&path, 4096).expect("open");
        adapter.close_file().expect("close");
        assert_eq!(std::fs::metadata(&path).expect("stat").len(), 4096);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn none_allocation_leaves_the_file_empty() {
        let path = temp_path("none");
        let adapter = DirectAdapter::new(Allocation::None);
        adapter.open_file(&path, 4096).expect("open");
        adapter.close_file().expect("close");
        assert_eq!(std::fs::metadata(&path).expect("stat").len(), 0);
        let _ = std::fs::remove_file(path);
    }

    #[test]
    fn falloc_allocation_reserves_or_falls_back() {
        let path = temp_path("falloc");
        let adapter = DirectAdapter::new(Allocation::Falloc);
        adapter.open_file(&path, 4096).expect("open");
        adapter.close_file().expect("close");
        assert_eq!(std::fs::metadata(&path).expect("stat").len(), 4096);
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn buffered_adapter_round_trips_interleaved_writes() {
        let path = temp_path("buffered");
        let adapter = BufferedAdapter::new(Allocation::Trunc);
        adapter.open_queue(&path, 12).expect("open");
        adapter.enqueue_write(b"fox!", 8).await.expect("third");
        adapter.enqueue_write(b"quick", 0).await.expect("first");
        adapter.enqueue_write(b"bro", 5).await.expect("second");
        adapter.close_queue().expect("close drains the queue");

        assert_eq!(std::fs::read(&path).expect("read"), b"quickbrofox!");
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn buffered_adapter_double_close_is_a_noop() {
        let path = temp_path("double-close");
        let adapter = BufferedAdapter::new(Allocation::Trunc);
        adapter.open_queue(&path, 4).expect("open");
        adapter.enqueue_write(b"data", 0).await.expect("write");
        adapter.close_queue().expect("first close");
        adapter.close_queue().expect("second close is a no-op");
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn writes_after_close_fail() {
        let path = temp_path("after-close");
        let adapter = BufferedAdapter::new(Allocation::Trunc);
        adapter.open_queue(&path, 4).expect("open");
        adapter.close_queue().expect("close");
        assert!(adapter.enqueue_write(b"late", 0).await.is_err());
        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn allocation_parse_accepts_known_policies() {
        assert_eq!(Allocation::parse("none"), Some(Allocation::None));
        assert_eq!(Allocation::parse("trunc"), Some(Allocation::Trunc));
        assert_eq!(Allocation::parse("falloc"), Some(Allocation::Falloc));
        assert_eq!(Allocation::parse("magic"), None);
    }

    async fn write_through<A: DiskAdapter>(
        adapter: &A,
        path: &std::path::Path,
        data: &[u8],
    ) -> io::Result<()> {
        adapter.open(path, data.len() as u64)?;
        adapter.write_at(data, 0).await?;
        adapter.close()
    }

    #[tokio::test]
    async fn both_adapters_satisfy_the_same_contract() {
        for (tag, direct) in [("contract-direct", true), ("contract-buffered", false)] {
            let path = temp_path(tag);
            if direct {
                let adapter = DirectAdapter::new(Allocation::Trunc);
                write_through(&adapter, &path, b"contract").await.expect("direct");
            } else {
                let adapter = BufferedAdapter::new(Allocation::Trunc);
                write_through(&adapter, &path, b"contract").await.expect("buffered");
            }
            assert_eq!(std::fs::read(&path).expect("read"), b"contract");
            let _ = std::fs::remove_file(path);
        }
    }

    #[tokio::test]
    async fn oversized_chunks_are_written_whole() {
        let path = temp_path("oversized");
        let adapter = BufferedAdapter::new(Allocation::Trunc);
        let big = vec![0xabu8; buffer::BUFFER_SIZE + 100];
        adapter
            .open_queue(&path, big.len() as u64)
            .expect("open");
        adapter.enqueue_write(&big, 0).await.expect("write");
        adapter.close_queue().expect("close");
        assert_eq!(std::fs::read(&path).expect("read"), big);
        let _ = std::fs::remove_file(path);
    }
}
