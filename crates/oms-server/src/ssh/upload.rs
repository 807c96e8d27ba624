//! Streaming uploads with live progress
//!
//! An incoming file is spooled to a local temp file while one worker per
//! target host copies the same spool to its remote. Workers read behind
//! the writer and wait at end-of-file until the writer has finished, so
//! no file is ever held in memory whole.
//!
//! Progress lives in an [`UploadRegistry`] of [`TaskItem`]s keyed by
//! `<host>/<file>`. A reporter publishes snapshots to subscribers every
//! 500ms; finished and failed tasks are published once, then dropped.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use oms_transport::sftp::parent_dir;
use oms_transport::{CallContext, Client, TransportError};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, ServerError};

/// Copy block size
pub const BLOCK_SIZE: usize = 4 * 1024;

/// Reporter cadence
pub const REPORT_INTERVAL: Duration = Duration::from_millis(500);

/// Pending byte counts between a writer and its counter
const COUNT_QUEUE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Running,
    Done,
    Failed,
}

/// One file going to one host
#[derive(Debug)]
pub struct TaskItem {
    pub host: String,
    pub file_name: String,
    pub dest: String,
    pub total: u64,
    /// Bytes read from the source
    csize: AtomicU64,
    /// Bytes written to the remote
    rsize: AtomicU64,
    status: Mutex<TaskStatus>,
    started: Instant,
}

impl TaskItem {
    pub fn new(host: &str, file_name: &str, dest: &str, total: u64) -> Self {
        Self {
            host: host.to_string(),
            file_name: file_name.to_string(),
            dest: dest.to_string(),
            total,
            csize: AtomicU64::new(0),
            rsize: AtomicU64::new(0),
            status: Mutex::new(TaskStatus::Running),
            started: Instant::now(),
        }
    }

    pub fn key(&self) -> String {
        task_key(&self.host, &self.file_name)
    }

    pub fn status(&self) -> TaskStatus {
        *self.status.lock()
    }

    pub fn set_status(&self, status: TaskStatus) {
        *self.status.lock() = status;
    }

    pub fn read_bytes(&self) -> u64 {
        self.csize.load(Ordering::Relaxed)
    }

    pub fn written_bytes(&self) -> u64 {
        self.rsize.load(Ordering::Relaxed)
    }

    fn add_read(&self, n: u64) {
        self.csize.fetch_add(n, Ordering::Relaxed);
    }

    fn add_written(&self, n: u64) {
        self.rsize.fetch_add(n, Ordering::Relaxed);
    }

    pub fn progress(&self) -> FileProgress {
        let current = self.written_bytes();
        let elapsed = self.started.elapsed().as_secs_f64();
        let speed = if elapsed > 0.0 {
            current as f64 / elapsed
        } else {
            0.0
        };
        let percent = if self.total == 0 {
            if self.status() == TaskStatus::Done {
                100
            } else {
                0
            }
        } else {
            ((current.min(self.total) * 100) / self.total) as u8
        };
        FileProgress {
            file: self.file_name.clone(),
            dest: self.dest.clone(),
            host: self.host.clone(),
            speed: format_speed(speed),
            current,
            total: self.total,
            status: self.status(),
            percent,
        }
    }
}

pub fn task_key(host: &str, file_name: &str) -> String {
    format!("{host}/{file_name}")
}

/// Progress snapshot sent to subscribers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileProgress {
    pub file: String,
    pub dest: String,
    pub host: String,
    pub speed: String,
    pub current: u64,
    pub total: u64,
    pub status: TaskStatus,
    pub percent: u8,
}

fn format_speed(bytes_per_sec: f64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes_per_sec;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{value:.2}{}/s", UNITS[unit])
}

/// Active upload tasks and the subscribers watching them
#[derive(Default)]
pub struct UploadRegistry {
    tasks: DashMap<String, Arc<TaskItem>>,
    subs: DashMap<String, mpsc::Sender<Vec<FileProgress>>>,
}

impl UploadRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_sub(&self, key: impl Into<String>, tx: mpsc::Sender<Vec<FileProgress>>) {
        self.subs.insert(key.into(), tx);
    }

    pub fn remove_sub(&self, key: &str) -> bool {
        self.subs.remove(key).is_some()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subs.len()
    }

    /// Track a new task; `None` if the same file is already running to that host
    pub fn begin(&self, host: &str, file_name: &str, dest: &str, total: u64) -> Option<Arc<TaskItem>> {
        let key = task_key(host, file_name);
        match self.tasks.entry(key) {
            dashmap::mapref::entry::Entry::Occupied(mut slot) => {
                if slot.get().status() == TaskStatus::Running {
                    return None;
                }
                let item = Arc::new(TaskItem::new(host, file_name, dest, total));
                slot.insert(Arc::clone(&item));
                Some(item)
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                let item = Arc::new(TaskItem::new(host, file_name, dest, total));
                slot.insert(Arc::clone(&item));
                Some(item)
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<Arc<TaskItem>> {
        self.tasks.get(key).map(|r| Arc::clone(&r))
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Progress of every task; terminal tasks are dropped after this call
    pub fn snapshot(&self) -> Vec<FileProgress> {
        let mut items: Vec<Arc<TaskItem>> = self.tasks.iter().map(|r| Arc::clone(&r)).collect();
        items.sort_by_key(|item| item.key());

        let snapshot: Vec<FileProgress> = items.iter().map(|item| item.progress()).collect();
        for item in &items {
            if item.status() != TaskStatus::Running {
                self.tasks
                    .remove_if(&item.key(), |_, current| Arc::ptr_eq(current, item));
            }
        }
        snapshot
    }

    /// Push one snapshot to every subscriber; returns how many got it
    pub fn publish(&self) -> usize {
        if self.tasks.is_empty() {
            return 0;
        }
        let snapshot = self.snapshot();

        let mut delivered = 0;
        let mut gone = Vec::new();
        for sub in self.subs.iter() {
            match sub.value().try_send(snapshot.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::trace!(sub = %sub.key(), "subscriber lagging, snapshot skipped");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => gone.push(sub.key().clone()),
            }
        }
        for key in gone {
            tracing::debug!(sub = %key, "dropping closed upload subscriber");
            self.subs.remove(&key);
        }
        delivered
    }

    /// Publish every [`REPORT_INTERVAL`] until cancelled
    pub async fn run_reporter(self: Arc<Self>, cancel: CancellationToken) {
        let mut interval = tokio::time::interval(REPORT_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    self.publish();
                }
                _ = cancel.cancelled() => {
                    tracing::debug!("upload reporter shutting down");
                    break;
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
struct SpoolState {
    written: u64,
    finished: bool,
    failed: bool,
}

/// Local temp copy of one incoming file.
///
/// Shared by its writer and every reader; the file is removed when the
/// last of them lets go.
#[derive(Debug)]
pub struct TempSpool {
    path: PathBuf,
    state: watch::Sender<SpoolState>,
}

impl TempSpool {
    /// `<tmp_dir>/multipart-<unix seconds>-<uuid>-<name>`
    pub fn path_for(tmp_dir: &Path, file_name: &str) -> PathBuf {
        let base = Path::new(file_name)
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("file");
        tmp_dir.join(format!(
            "multipart-{}-{}-{}",
            chrono::Utc::now().timestamp(),
            uuid::Uuid::new_v4().simple(),
            base
        ))
    }

    /// Create the spool file and its writer
    pub async fn create(path: PathBuf) -> io::Result<(Arc<Self>, SpoolWriter)> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = tokio::fs::File::create(&path).await?;
        let (state, _) = watch::channel(SpoolState::default());
        let spool = Arc::new(Self { path, state });
        let writer = SpoolWriter {
            file,
            spool: Arc::clone(&spool),
            closed: false,
        };
        Ok((spool, writer))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn written(&self) -> u64 {
        self.state.borrow().written
    }

    /// A reader starting at the beginning of the spool
    pub async fn reader(self: &Arc<Self>) -> io::Result<SpoolReader> {
        let file = tokio::fs::File::open(&self.path).await?;
        Ok(SpoolReader {
            file,
            state: self.state.subscribe(),
            _spool: Arc::clone(self),
        })
    }
}

impl Drop for TempSpool {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => tracing::trace!(path = %self.path.display(), "removed spool"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::warn!(path = %self.path.display(), "failed to remove spool: {}", e),
        }
    }
}

/// Appends to a spool; dropping it without [`SpoolWriter::finish`] marks the spool failed
pub struct SpoolWriter {
    file: tokio::fs::File,
    spool: Arc<TempSpool>,
    closed: bool,
}

impl SpoolWriter {
    pub async fn write(&mut self, chunk: &[u8]) -> io::Result<()> {
        self.file.write_all(chunk).await?;
        self.file.flush().await?;
        let n = chunk.len() as u64;
        self.spool.state.send_modify(|s| s.written += n);
        Ok(())
    }

    pub async fn finish(mut self) -> io::Result<()> {
        self.file.flush().await?;
        self.closed = true;
        self.spool.state.send_modify(|s| s.finished = true);
        Ok(())
    }

    pub fn fail(mut self) {
        self.closed = true;
        self.spool.state.send_modify(|s| s.failed = true);
    }
}

impl Drop for SpoolWriter {
    fn drop(&mut self) {
        if !self.closed {
            self.spool.state.send_modify(|s| s.failed = true);
        }
    }
}

/// Follows a spool while it is still being written
pub struct SpoolReader {
    file: tokio::fs::File,
    state: watch::Receiver<SpoolState>,
    _spool: Arc<TempSpool>,
}

impl SpoolReader {
    /// Next bytes of the spool; `Ok(0)` only once the writer has finished
    pub async fn read_chunk(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            let state = *self.state.borrow_and_update();
            let n = self.file.read(buf).await?;
            if n > 0 {
                return Ok(n);
            }
            if state.failed {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "upload aborted before the file was complete",
                ));
            }
            if state.finished {
                return Ok(0);
            }
            if self.state.changed().await.is_err() {
                return Ok(0);
            }
        }
    }
}

/// Copy a spool to `remote`, tracking progress in `item`.
///
/// On failure or cancellation the task is marked failed and the partial
/// remote file is removed.
pub async fn upload_stream(
    client: &Client,
    item: &Arc<TaskItem>,
    reader: &mut SpoolReader,
    remote: &str,
    call: &CallContext,
) -> Result<u64> {
    let result = tokio::select! {
        r = copy_to_remote(client, item, reader, remote) => r,
        reason = call.done() => Err(TransportError::Cancelled(reason).into()),
    };

    match &result {
        Ok(n) => {
            item.set_status(TaskStatus::Done);
            tracing::info!(host = %item.host, remote, bytes = n, "upload finished");
        }
        Err(e) => {
            item.set_status(TaskStatus::Failed);
            tracing::warn!(host = %item.host, remote, "upload failed: {}", e);
            if client.path_exists(remote).await {
                if let Err(e) = client.remove(remote).await {
                    tracing::warn!(host = %item.host, remote, "failed to remove partial upload: {}", e);
                }
            }
        }
    }
    result
}

async fn copy_to_remote(
    client: &Client,
    item: &Arc<TaskItem>,
    reader: &mut SpoolReader,
    remote: &str,
) -> Result<u64> {
    client.mkdir_all(&parent_dir(remote)).await?;
    let mut file = client.create(remote).await?;

    // a separate counter keeps slow progress readers off the copy path
    let (tx, mut rx) = mpsc::channel::<u64>(COUNT_QUEUE);
    let counter = {
        let item = Arc::clone(item);
        tokio::spawn(async move {
            while let Some(n) = rx.recv().await {
                item.add_written(n);
            }
        })
    };

    let mut buf = vec![0u8; BLOCK_SIZE];
    let mut sent = 0u64;
    loop {
        let n = reader.read_chunk(&mut buf).await?;
        if n == 0 {
            break;
        }
        item.add_read(n as u64);
        file.write_all(&buf[..n]).await?;
        sent += n as u64;
        let _ = tx.send(n as u64).await;
    }
    file.shutdown().await?;

    drop(tx);
    let _ = counter.await;

    if item.total > 0 && sent < item.total {
        return Err(ServerError::Upload(format!(
            "short read: {sent} of {} bytes",
            item.total
        )));
    }
    Ok(sent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_running_task_is_skipped() {
        let registry = UploadRegistry::new();
        let first = registry.begin("10.0.0.1:22", "app.tar", "/opt/app.tar", 10).unwrap();
        assert!(registry.begin("10.0.0.1:22", "app.tar", "/opt/app.tar", 10).is_none());
        assert!(registry.begin("10.0.0.2:22", "app.tar", "/opt/app.tar", 10).is_some());

        first.set_status(TaskStatus::Failed);
        assert!(registry.begin("10.0.0.1:22", "app.tar", "/opt/app.tar", 10).is_some());
    }

    #[tokio::test]
    async fn test_terminal_tasks_published_once() {
        let registry = UploadRegistry::new();
        let (tx, mut rx) = mpsc::channel(4);
        registry.register_sub("ws-1", tx);

        let done = registry.begin("h1", "a.txt", "/tmp/a.txt", 4).unwrap();
        done.add_written(4);
        done.set_status(TaskStatus::Done);
        registry.begin("h2", "a.txt", "/tmp/a.txt", 8).unwrap();

        assert_eq!(registry.publish(), 1);
        let first = rx.recv().await.unwrap();
        assert_eq!(first.len(), 2);
        assert_eq!(first[0].status, TaskStatus::Done);
        assert_eq!(first[0].percent, 100);
        assert_eq!(first[1].status, TaskStatus::Running);

        registry.publish();
        let second = rx.recv().await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].host, "h2");
    }

    #[tokio::test]
    async fn test_closed_subscriber_is_dropped() {
        let registry = UploadRegistry::new();
        let (tx, rx) = mpsc::channel(1);
        registry.register_sub("gone", tx);
        drop(rx);
        registry.begin("h", "f", "/f", 1).unwrap();
        assert_eq!(registry.publish(), 0);
        assert_eq!(registry.subscriber_count(), 0);
    }

    #[test]
    fn test_spool_paths_for_same_name_differ() {
        let dir = Path::new("/tmp/spool");
        let a = TempSpool::path_for(dir, "data.bin");
        let b = TempSpool::path_for(dir, "data.bin");
        assert_ne!(a, b);
        assert!(a.to_string_lossy().ends_with("-data.bin"));
    }

    #[tokio::test]
    async fn test_reader_follows_writer_and_spool_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        let path = TempSpool::path_for(dir.path(), "../evil/data.bin");
        assert_eq!(path.parent(), Some(dir.path()));
        assert!(path.to_string_lossy().ends_with("-data.bin"));

        let (spool, mut writer) = TempSpool::create(path.clone()).await.unwrap();
        let mut reader = spool.reader().await.unwrap();

        let follower = tokio::spawn(async move {
            let mut out = Vec::new();
            let mut buf = [0u8; 3];
            loop {
                let n = reader.read_chunk(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                out.extend_from_slice(&buf[..n]);
            }
            out
        });

        writer.write(b"hello ").await.unwrap();
        tokio::task::yield_now().await;
        writer.write(b"world").await.unwrap();
        writer.finish().await.unwrap();

        assert_eq!(follower.await.unwrap(), b"hello world");
        assert_eq!(spool.written(), 11);
        assert!(path.exists());
        drop(spool);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_dropped_writer_fails_readers() {
        let dir = tempfile::tempdir().unwrap();
        let (spool, mut writer) = TempSpool::create(dir.path().join("s")).await.unwrap();
        let mut reader = spool.reader().await.unwrap();
        writer.write(b"part").await.unwrap();
        drop(writer);

        let mut buf = [0u8; 16];
        assert_eq!(reader.read_chunk(&mut buf).await.unwrap(), 4);
        let err = reader.read_chunk(&mut buf).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_format_speed() {
        assert_eq!(format_speed(512.0), "512.00B/s");
        assert_eq!(format_speed(1536.0), "1.50KB/s");
        assert_eq!(format_speed(3.0 * 1024.0 * 1024.0), "3.00MB/s");
    }
}
