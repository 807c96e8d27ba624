//! Per-job log files
//!
//! Each job writes to `<root>/<job>/<job>.log`. Writers append to an
//! in-memory buffer that a background task drains every 120 ms, so remote
//! output never waits on the disk. Files rotate by size; rotated files are
//! gzipped and pruned by count and age.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use chrono::{Local, SecondsFormat};
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const FLUSH_INTERVAL: Duration = Duration::from_millis(120);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rotation {
    pub max_size: u64,
    pub max_backups: usize,
    pub max_age: Duration,
}

impl Default for Rotation {
    fn default() -> Self {
        Self {
            max_size: 20 * 1024 * 1024,
            max_backups: 3,
            max_age: Duration::from_secs(20 * 24 * 3600),
        }
    }
}

/// File-system safe form of a job name
pub fn sanitize(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| if matches!(c, '/' | '\\' | '\0') { '_' } else { c })
        .collect();
    match cleaned.as_str() {
        "" | "." | ".." => "_".to_string(),
        _ => cleaned,
    }
}

pub fn log_dir(root: &Path, job_name: &str) -> PathBuf {
    root.join(sanitize(job_name))
}

pub fn log_path(root: &Path, job_name: &str) -> PathBuf {
    let name = sanitize(job_name);
    root.join(&name).join(format!("{name}.log"))
}

pub struct JobLog {
    path: PathBuf,
    shared: Arc<Shared>,
    stop: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
}

struct Shared {
    buf: Mutex<Vec<u8>>,
    // serializes drains so chunks reach the file in order
    order: tokio::sync::Mutex<()>,
    file: Arc<Mutex<RotatingFile>>,
}

impl Shared {
    async fn flush(&self) -> io::Result<()> {
        let _order = self.order.lock().await;
        let data = std::mem::take(&mut *self.buf.lock());
        if data.is_empty() {
            return Ok(());
        }
        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || file.lock().write(&data))
            .await
            .map_err(io::Error::other)?
    }
}

impl JobLog {
    pub fn open(root: &Path, job_name: &str) -> io::Result<Self> {
        Self::with_rotation(root, job_name, Rotation::default())
    }

    pub fn with_rotation(root: &Path, job_name: &str, rotation: Rotation) -> io::Result<Self> {
        let path = log_path(root, job_name);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        let shared = Arc::new(Shared {
            buf: Mutex::new(Vec::new()),
            order: tokio::sync::Mutex::new(()),
            file: Arc::new(Mutex::new(RotatingFile::new(path.clone(), rotation))),
        });

        let stop = CancellationToken::new();
        let flusher = tokio::spawn(run_flusher(Arc::clone(&shared), stop.clone()));
        Ok(Self {
            path,
            shared,
            stop,
            flusher: Mutex::new(Some(flusher)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn info(&self, msg: impl AsRef<str>) {
        self.line("info", msg.as_ref());
    }

    pub fn error(&self, msg: impl AsRef<str>) {
        self.line("error", msg.as_ref());
    }

    fn line(&self, level: &str, msg: &str) {
        let stamp = Local::now().to_rfc3339_opts(SecondsFormat::Secs, false);
        let mut buf = self.shared.buf.lock();
        for line in msg.trim_end_matches('\n').split('\n') {
            buf.extend_from_slice(format!("{stamp} [{level}] {line}\n").as_bytes());
        }
    }

    /// Collects streamed output into whole `info` lines
    pub fn line_sink(&self) -> LineSink<'_> {
        LineSink {
            log: self,
            pending: Vec::new(),
        }
    }

    pub async fn flush(&self) -> io::Result<()> {
        self.shared.flush().await
    }

    /// Stop the flusher and write whatever is buffered. Later calls are no-ops.
    pub async fn close(&self) {
        let handle = self.flusher.lock().take();
        if let Some(handle) = handle {
            self.stop.cancel();
            if let Err(e) = handle.await {
                tracing::warn!(path = %self.path.display(), "log flusher ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for JobLog {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

async fn run_flusher(shared: Arc<Shared>, stop: CancellationToken) {
    let mut interval = tokio::time::interval(FLUSH_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = shared.flush().await {
                    tracing::warn!("job log flush failed: {}", e);
                }
            }
            _ = stop.cancelled() => {
                if let Err(e) = shared.flush().await {
                    tracing::warn!("job log final flush failed: {}", e);
                }
                break;
            }
        }
    }
}

pub struct LineSink<'a> {
    log: &'a JobLog,
    pending: Vec<u8>,
}

impl LineSink<'_> {
    pub fn push(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line[..line.len() - 1]);
            self.log.info(text.trim_end_matches('\r'));
        }
    }

    /// Emit a trailing partial line
    pub fn finish(mut self) {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            self.log.info(String::from_utf8_lossy(&rest));
        }
    }
}

struct RotatingFile {
    path: PathBuf,
    rotation: Rotation,
    file: Option<File>,
    size: u64,
}

impl RotatingFile {
    fn new(path: PathBuf, rotation: Rotation) -> Self {
        Self {
            path,
            rotation,
            file: None,
            size: 0,
        }
    }

    fn write(&mut self, data: &[u8]) -> io::Result<()> {
        if self.file.is_none() {
            self.open()?;
        }
        if self.size > 0 && self.size + data.len() as u64 > self.rotation.max_size {
            self.rotate()?;
        }
        let file = match self.file.as_mut() {
            Some(file) => file,
            None => return Err(io::Error::other("log file not open")),
        };
        file.write_all(data)?;
        self.size += data.len() as u64;
        Ok(())
    }

    fn open(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.size = file.metadata()?.len();
        self.file = Some(file);
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file = None;
        let backup = self.backup_name();
        fs::rename(&self.path, &backup)?;
        if let Err(e) = compress(&backup) {
            tracing::warn!(path = %backup.display(), "failed to compress rotated log: {}", e);
        }
        self.prune();
        self.open()
    }

    fn stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    fn backup_name(&self) -> PathBuf {
        let stamp = Local::now().format("%Y-%m-%dT%H-%M-%S%.3f");
        self.path.with_file_name(format!("{}-{stamp}.log", self.stem()))
    }

    /// Drop backups past the count or age limit, newest kept first
    fn prune(&self) {
        let Some(dir) = self.path.parent() else { return };
        let prefix = format!("{}-", self.stem());
        let Ok(entries) = fs::read_dir(dir) else { return };

        let mut backups: Vec<(SystemTime, PathBuf)> = entries
            .filter_map(|e| e.ok())
            .filter(|e| {
                let name = e.file_name().to_string_lossy().into_owned();
                name.starts_with(&prefix) && (name.ends_with(".log.gz") || name.ends_with(".log"))
            })
            .filter_map(|e| {
                let modified = e.metadata().and_then(|m| m.modified()).ok()?;
                Some((modified, e.path()))
            })
            .collect();
        backups.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.cmp(&a.1)));

        let now = SystemTime::now();
        for (i, (modified, path)) in backups.iter().enumerate() {
            let expired = now
                .duration_since(*modified)
                .map(|age| age > self.rotation.max_age)
                .unwrap_or(false);
            if i >= self.rotation.max_backups || expired {
                if let Err(e) = fs::remove_file(path) {
                    tracing::warn!(path = %path.display(), "failed to remove old log: {}", e);
                }
            }
        }
    }
}

fn compress(path: &Path) -> io::Result<()> {
    let mut gz_name = path.as_os_str().to_owned();
    gz_name.push(".gz");
    let mut source = File::open(path)?;
    let mut encoder = GzEncoder::new(File::create(&gz_name)?, Compression::default());
    io::copy(&mut source, &mut encoder)?;
    encoder.finish()?;
    fs::remove_file(path)
}
