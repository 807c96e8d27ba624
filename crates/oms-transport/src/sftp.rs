//! SFTP file operations on a [`Client`]
//!
//! All paths are remote POSIX paths. The subsystem is started on first use
//! and shared by every caller of the same client.

use std::path::Path;

use russh_sftp::client::fs::{File, Metadata};
use russh_sftp::protocol::{FileAttributes, OpenFlags};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::client::Client;
use crate::error::{Result, TransportError};

const COPY_BUFFER: usize = 32 * 1024;

/// Directory listing entry
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RemoteFileInfo {
    pub name: String,
    pub path: String,
    pub size: u64,
    pub mode: u32,
    pub is_dir: bool,
    pub is_symlink: bool,
    /// Seconds since the epoch
    pub mod_time: u32,
}

impl RemoteFileInfo {
    fn from_metadata(name: String, path: String, meta: &Metadata) -> Self {
        Self {
            name,
            path,
            size: meta.size.unwrap_or(0),
            mode: meta.permissions.unwrap_or(0),
            is_dir: meta.is_dir(),
            is_symlink: meta.is_symlink(),
            mod_time: meta.mtime.unwrap_or(0),
        }
    }
}

impl Client {
    pub async fn read_dir(&self, path: &str) -> Result<Vec<RemoteFileInfo>> {
        let sftp = self.sftp().await?;
        let mut entries: Vec<_> = sftp
            .read_dir(path)
            .await?
            .map(|entry| {
                let name = entry.file_name();
                let full = join(path, &name);
                RemoteFileInfo::from_metadata(name, full, &entry.metadata())
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    pub async fn open(&self, path: &str) -> Result<File> {
        Ok(self.sftp().await?.open(path).await?)
    }

    /// Create or truncate
    pub async fn create(&self, path: &str) -> Result<File> {
        Ok(self.sftp().await?.create(path).await?)
    }

    pub async fn open_file(&self, path: &str, flags: OpenFlags) -> Result<File> {
        Ok(self.sftp().await?.open_with_flags(path, flags).await?)
    }

    /// Follows symlinks
    pub async fn stat(&self, path: &str) -> Result<RemoteFileInfo> {
        let meta = self.sftp().await?.metadata(path).await?;
        Ok(RemoteFileInfo::from_metadata(base_name(path), path.to_string(), &meta))
    }

    pub async fn lstat(&self, path: &str) -> Result<RemoteFileInfo> {
        let meta = self.sftp().await?.symlink_metadata(path).await?;
        Ok(RemoteFileInfo::from_metadata(base_name(path), path.to_string(), &meta))
    }

    pub async fn read_link(&self, path: &str) -> Result<String> {
        Ok(self.sftp().await?.read_link(path).await?)
    }

    pub async fn real_path(&self, path: &str) -> Result<String> {
        Ok(self.sftp().await?.canonicalize(path).await?)
    }

    /// Remote working directory (the login user's home on most servers)
    pub async fn getwd(&self) -> Result<String> {
        self.real_path(".").await
    }

    pub async fn path_exists(&self, path: &str) -> bool {
        match self.sftp().await {
            Ok(sftp) => sftp.try_exists(path).await.unwrap_or(false),
            Err(_) => false,
        }
    }

    pub async fn is_dir(&self, path: &str) -> bool {
        match self.sftp().await {
            Ok(sftp) => sftp
                .metadata(path)
                .await
                .map(|m| m.is_dir())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Create `path` and any missing parents
    pub async fn mkdir_all(&self, path: &str) -> Result<()> {
        let sftp = self.sftp().await?;

        let mut missing = Vec::new();
        let mut current = trim_trailing(path).to_string();
        while !current.is_empty() && current != "/" && current != "." {
            if self.path_exists(&current).await {
                if !self.is_dir(&current).await {
                    return Err(TransportError::Sftp(format!("{current}: not a directory")));
                }
                break;
            }
            let parent = parent_dir(&current);
            missing.push(current);
            current = parent;
        }

        for dir in missing.into_iter().rev() {
            if let Err(e) = sftp.create_dir(dir.as_str()).await {
                // raced with another creator
                if !self.is_dir(&dir).await {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }

    /// Remove a single file
    pub async fn remove(&self, path: &str) -> Result<()> {
        Ok(self.sftp().await?.remove_file(path).await?)
    }

    /// Remove a directory tree
    pub async fn remove_dir(&self, path: &str) -> Result<()> {
        let sftp = self.sftp().await?;

        // iterative post-order walk
        let mut stack = vec![(path.to_string(), false)];
        while let Some((dir, visited)) = stack.pop() {
            if visited {
                sftp.remove_dir(dir.as_str()).await?;
                continue;
            }
            stack.push((dir.clone(), true));
            for entry in sftp.read_dir(dir.as_str()).await? {
                let child = join(&dir, &entry.file_name());
                if entry.file_type().is_dir() {
                    stack.push((child, false));
                } else {
                    sftp.remove_file(child.as_str()).await?;
                }
            }
        }
        Ok(())
    }

    /// Set permission bits on `path`, recursing into directories
    pub async fn chmod(&self, path: &str, mode: u32) -> Result<()> {
        let sftp = self.sftp().await?;
        let mut pending = vec![path.to_string()];
        while let Some(current) = pending.pop() {
            let mut attrs = FileAttributes::empty();
            attrs.permissions = Some(mode);
            sftp.set_metadata(current.as_str(), attrs).await?;

            if self.is_dir(&current).await {
                for entry in sftp.read_dir(current.as_str()).await? {
                    if !entry.file_type().is_symlink() {
                        pending.push(join(&current, &entry.file_name()));
                    }
                }
            }
        }
        Ok(())
    }

    /// Copy a local file to `remote`, creating parent directories.
    ///
    /// Returns the number of bytes written.
    pub async fn upload_file(&self, local: &Path, remote: &str) -> Result<u64> {
        let mut source = tokio::fs::File::open(local).await?;
        self.mkdir_all(&parent_dir(remote)).await?;
        let mut target = self.create(remote).await?;

        let mut buf = vec![0u8; COPY_BUFFER];
        let mut written = 0u64;
        loop {
            let n = source.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            target.write_all(&buf[..n]).await?;
            written += n as u64;
        }
        target.shutdown().await?;
        Ok(written)
    }

    /// Write `content` to `remote`, creating parent directories
    pub async fn write_file(&self, content: &[u8], remote: &str) -> Result<()> {
        self.mkdir_all(&parent_dir(remote)).await?;
        let mut target = self.create(remote).await?;
        target.write_all(content).await?;
        target.shutdown().await?;
        Ok(())
    }
}

/// Resolve an upload destination into `(remote file, remote dir)`.
///
/// A trailing `/` means "into this directory, keep the local name";
/// otherwise `remote` names the file itself. An empty `remote` uploads
/// under the local name relative to the remote working directory.
pub fn parse_upload_path(remote: &str, filename: &str) -> (String, String) {
    if remote.is_empty() {
        return (filename.to_string(), parent_dir(filename));
    }
    if remote.ends_with('/') {
        let file = join(remote, &base_name(filename));
        return (file, remote.to_string());
    }
    (remote.to_string(), parent_dir(remote))
}

/// Join a remote directory and a child name
pub fn join(dir: &str, name: &str) -> String {
    if dir.is_empty() {
        name.to_string()
    } else if dir.ends_with('/') {
        format!("{dir}{name}")
    } else {
        format!("{dir}/{name}")
    }
}

/// Parent of a remote path; `"."` for bare names
pub fn parent_dir(path: &str) -> String {
    match trim_trailing(path).rsplit_once('/') {
        Some(("", _)) => "/".to_string(),
        Some((parent, _)) => parent.to_string(),
        None => ".".to_string(),
    }
}

fn base_name(path: &str) -> String {
    trim_trailing(path)
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

fn trim_trailing(path: &str) -> &str {
    match path.trim_end_matches('/') {
        "" if path.starts_with('/') => "/",
        trimmed => trimmed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_upload_path() {
        assert_eq!(
            parse_upload_path("/opt/app/", "a.tar"),
            ("/opt/app/a.tar".to_string(), "/opt/app/".to_string())
        );
        assert_eq!(
            parse_upload_path("/opt/app/", "local/dir/a.tar"),
            ("/opt/app/a.tar".to_string(), "/opt/app/".to_string())
        );
        assert_eq!(
            parse_upload_path("/opt/app/b.tar", "a.tar"),
            ("/opt/app/b.tar".to_string(), "/opt/app".to_string())
        );
        assert_eq!(
            parse_upload_path("/x", "a.tar"),
            ("/x".to_string(), "/".to_string())
        );
        assert_eq!(
            parse_upload_path("", "a.tar"),
            ("a.tar".to_string(), ".".to_string())
        );
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir("/tmp/script/abc"), "/tmp/script");
        assert_eq!(parent_dir("/tmp"), "/");
        assert_eq!(parent_dir("/tmp/dir/"), "/tmp");
        assert_eq!(parent_dir("file"), ".");
        assert_eq!(parent_dir("a/b"), "a");
    }

    #[test]
    fn test_join_and_base_name() {
        assert_eq!(join("/", "etc"), "/etc");
        assert_eq!(join("/etc", "hosts"), "/etc/hosts");
        assert_eq!(join("", "x"), "x");
        assert_eq!(base_name("/etc/hosts"), "hosts");
        assert_eq!(base_name("/etc/"), "etc");
    }
}
