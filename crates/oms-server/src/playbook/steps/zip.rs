//! `zip`: extract a cached `.tar`, `.tar.gz` or `.zip` onto the remote
//!
//! The archive is decoded on a blocking thread and streamed to the async
//! side entry by entry, so large members never sit in memory whole.

use std::fs::File;
use std::io::Read;
use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use oms_transport::sftp::{join, parent_dir};
use oms_transport::Client;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;

use super::{decode, schema_of, step_meta};
use crate::error::ServerError;
use crate::playbook::registry::StepKind;
use crate::playbook::{Step, StepContext};

pub const NAME: &str = "zip";

const CHUNK: usize = 32 * 1024;
const QUEUE: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ZipConfig {
    /// *.tar | *.tar.gz | *.zip
    #[schemars(extend("format" = "data-url"))]
    pub file: String,
    /// Remote directory to extract into
    pub remote: String,
}

/// Supported archive formats, by file extension
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveKind {
    Tar,
    TarGz,
    Zip,
}

impl ArchiveKind {
    pub fn from_path(path: &str) -> Option<Self> {
        let lower = path.to_ascii_lowercase();
        if lower.ends_with(".tar.gz") || lower.ends_with(".tgz") {
            Some(Self::TarGz)
        } else if lower.ends_with(".tar") {
            Some(Self::Tar)
        } else if lower.ends_with(".zip") {
            Some(Self::Zip)
        } else {
            None
        }
    }
}

/// What the decoder thread hands to the uploader
#[derive(Debug)]
enum Entry {
    Dir(String),
    File(String),
    Chunk(Bytes),
    EndFile,
}

pub struct ZipStep {
    id: String,
    cfg: ZipConfig,
}

impl ZipStep {
    pub fn kind() -> StepKind {
        StepKind::new(NAME, "Extract an archive", schema_of::<ZipConfig>(), |config| {
            Ok(Box::new(ZipStep {
                id: String::new(),
                cfg: decode(NAME, config)?,
            }))
        })
    }
}

#[async_trait]
impl Step for ZipStep {
    step_meta!(NAME, "Extract an archive");

    fn parse_caches(&self) -> Vec<String> {
        vec![self.cfg.file.clone()]
    }

    async fn exec(&self, ctx: &StepContext) -> Result<Vec<u8>, ServerError> {
        let kind = ArchiveKind::from_path(&self.cfg.file).ok_or_else(|| {
            ServerError::Step(format!("unsupported archive type: {}", self.cfg.file))
        })?;
        if !tokio::fs::try_exists(&self.cfg.file).await.unwrap_or(false) {
            return Err(ServerError::Step(format!(
                "local cache does not exist: {}",
                self.cfg.file
            )));
        }

        ctx.client.sftp().await?;
        if !ctx.client.path_exists(&self.cfg.remote).await {
            ctx.client.mkdir_all(&self.cfg.remote).await?;
        }

        let (tx, rx) = mpsc::channel(QUEUE);
        let local = PathBuf::from(&self.cfg.file);
        let decoder = tokio::task::spawn_blocking(move || decode_archive(&local, kind, tx));

        let written = write_entries(&ctx.client, &self.cfg.remote, rx).await;
        // the decoder stops once the receiver is gone
        let decoded = decoder
            .await
            .map_err(|e| ServerError::Step(format!("archive decoder panicked: {e}")))?;

        written?;
        decoded.map_err(|e| ServerError::Step(format!("read archive {}: {e}", self.cfg.file)))?;

        Ok(format!("extract success, remote path: {}\r\n", self.cfg.remote).into_bytes())
    }
}

async fn write_entries(
    client: &Client,
    remote_root: &str,
    mut rx: mpsc::Receiver<Entry>,
) -> Result<(), ServerError> {
    let mut current = None;
    while let Some(entry) = rx.recv().await {
        match entry {
            Entry::Dir(rel) => {
                client.mkdir_all(&join(remote_root, &rel)).await?;
            }
            Entry::File(rel) => {
                let target = join(remote_root, &rel);
                client.mkdir_all(&parent_dir(&target)).await?;
                current = Some(client.create(&target).await?);
            }
            Entry::Chunk(data) => {
                if let Some(file) = current.as_mut() {
                    file.write_all(&data).await?;
                }
            }
            Entry::EndFile => {
                if let Some(mut file) = current.take() {
                    file.shutdown().await?;
                }
            }
        }
    }
    Ok(())
}

/// Walk the archive, pushing entries until done or the receiver hangs up
fn decode_archive(path: &Path, kind: ArchiveKind, tx: mpsc::Sender<Entry>) -> std::io::Result<()> {
    let file = File::open(path)?;
    match kind {
        ArchiveKind::Tar => decode_tar(tar::Archive::new(file), &tx),
        ArchiveKind::TarGz => decode_tar(tar::Archive::new(flate2::read::GzDecoder::new(file)), &tx),
        ArchiveKind::Zip => decode_zip(file, &tx),
    }
}

fn decode_tar<R: Read>(mut archive: tar::Archive<R>, tx: &mpsc::Sender<Entry>) -> std::io::Result<()> {
    for entry in archive.entries()? {
        let mut entry = entry?;
        let Some(rel) = safe_relative(&entry.path()?) else {
            continue;
        };
        let entry_type = entry.header().entry_type();
        if entry_type.is_dir() {
            if !send(tx, Entry::Dir(rel)) {
                return Ok(());
            }
        } else if entry_type.is_file() {
            if !stream_member(&mut entry, rel, tx)? {
                return Ok(());
            }
        }
    }
    Ok(())
}

fn decode_zip(file: File, tx: &mpsc::Sender<Entry>) -> std::io::Result<()> {
    let mut archive = ::zip::ZipArchive::new(file).map_err(std::io::Error::other)?;
    for i in 0..archive.len() {
        let mut member = archive.by_index(i).map_err(std::io::Error::other)?;
        let Some(rel) = member.enclosed_name().and_then(|p| safe_relative(&p)) else {
            continue;
        };
        if member.is_dir() {
            if !send(tx, Entry::Dir(rel)) {
                return Ok(());
            }
        } else if !stream_member(&mut member, rel, tx)? {
            return Ok(());
        }
    }
    Ok(())
}

/// Returns false once the receiver is gone
fn stream_member<R: Read>(reader: &mut R, rel: String, tx: &mpsc::Sender<Entry>) -> std::io::Result<bool> {
    if !send(tx, Entry::File(rel)) {
        return Ok(false);
    }
    let mut buf = vec![0u8; CHUNK];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        if !send(tx, Entry::Chunk(Bytes::copy_from_slice(&buf[..n]))) {
            return Ok(false);
        }
    }
    Ok(send(tx, Entry::EndFile))
}

fn send(tx: &mpsc::Sender<Entry>, entry: Entry) -> bool {
    tx.blocking_send(entry).is_ok()
}

/// Member path as a `/`-joined relative path; absolute and `..` paths are refused
fn safe_relative(path: &Path) -> Option<String> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?.to_string()),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => return None,
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_kind_from_extension() {
        assert_eq!(ArchiveKind::from_path("/c/app.tar.gz"), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::from_path("/c/APP.TGZ"), Some(ArchiveKind::TarGz));
        assert_eq!(ArchiveKind::from_path("/c/app.tar"), Some(ArchiveKind::Tar));
        assert_eq!(ArchiveKind::from_path("/c/app.zip"), Some(ArchiveKind::Zip));
        assert_eq!(ArchiveKind::from_path("/c/app.rar"), None);
    }

    #[test]
    fn test_safe_relative() {
        assert_eq!(safe_relative(Path::new("./a/b.txt")), Some("a/b.txt".into()));
        assert_eq!(safe_relative(Path::new("../etc/passwd")), None);
        assert_eq!(safe_relative(Path::new("/etc/passwd")), None);
        assert_eq!(safe_relative(Path::new(".")), None);
    }

    fn drain(rx: &mut mpsc::Receiver<Entry>) -> Vec<String> {
        let mut seen = Vec::new();
        while let Ok(entry) = rx.try_recv() {
            seen.push(match entry {
                Entry::Dir(p) => format!("dir {p}"),
                Entry::File(p) => format!("file {p}"),
                Entry::Chunk(b) => format!("chunk {}", String::from_utf8_lossy(&b)),
                Entry::EndFile => "end".to_string(),
            });
        }
        seen
    }

    #[test]
    fn test_decode_tar_gz_keeps_hierarchy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.tar.gz");

        let gz = flate2::write::GzEncoder::new(
            File::create(&path).unwrap(),
            flate2::Compression::default(),
        );
        let mut builder = tar::Builder::new(gz);
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        builder
            .append_data(&mut header, "conf/", std::io::empty())
            .unwrap();
        let body = b"port: 80\n";
        let mut header = tar::Header::new_gnu();
        header.set_size(body.len() as u64);
        header.set_mode(0o644);
        builder
            .append_data(&mut header, "conf/app.yaml", &body[..])
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        decode_archive(&path, ArchiveKind::TarGz, tx).unwrap();
        assert_eq!(
            drain(&mut rx),
            vec!["dir conf", "file conf/app.yaml", "chunk port: 80\n", "end"]
        );
    }

    #[test]
    fn test_decode_zip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("site.zip");

        let mut writer = ::zip::ZipWriter::new(File::create(&path).unwrap());
        let options = ::zip::write::FileOptions::default();
        writer.add_directory("www/", options).unwrap();
        writer.start_file("www/index.html", options).unwrap();
        std::io::Write::write_all(&mut writer, b"<h1>hi</h1>").unwrap();
        writer.finish().unwrap();

        let (tx, mut rx) = mpsc::channel(64);
        decode_archive(&path, ArchiveKind::Zip, tx).unwrap();
        assert_eq!(
            drain(&mut rx),
            vec!["dir www", "file www/index.html", "chunk <h1>hi</h1>", "end"]
        );
    }
}
