//! Follow a job log as a byte stream

use std::io::{self, SeekFrom};
use std::path::PathBuf;
use std::time::Duration;

use bytes::Bytes;
use futures::Stream;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// How far back from the end the stream starts
pub const TAIL_BYTES: u64 = 2000;
pub const POLL_INTERVAL: Duration = Duration::from_millis(500);

const READ_CHUNK: usize = 8 * 1024;

struct Follow {
    path: PathBuf,
    file: File,
    pos: u64,
    poll: Duration,
}

/// Stream the last [`TAIL_BYTES`] of `path`, then everything appended.
///
/// The stream never ends on its own; dropping it stops the tail. A file
/// that shrinks (truncated or rotated) is reopened from the start.
pub async fn follow(path: PathBuf, poll: Duration) -> io::Result<impl Stream<Item = io::Result<Bytes>>> {
    let mut file = File::open(&path).await?;
    let len = file.metadata().await?.len();
    let pos = len.saturating_sub(TAIL_BYTES);
    file.seek(SeekFrom::Start(pos)).await?;

    let state = Follow { path, file, pos, poll };
    Ok(futures::stream::unfold(Some(state), |state| async move {
        let mut state = state?;
        match next_chunk(&mut state).await {
            Ok(chunk) => Some((Ok(chunk), Some(state))),
            Err(e) => Some((Err(e), None)),
        }
    }))
}

async fn next_chunk(state: &mut Follow) -> io::Result<Bytes> {
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        let n = state.file.read(&mut buf).await?;
        if n > 0 {
            state.pos += n as u64;
            buf.truncate(n);
            return Ok(Bytes::from(buf));
        }

        tokio::time::sleep(state.poll).await;
        match tokio::fs::metadata(&state.path).await {
            Ok(meta) if meta.len() < state.pos => {
                tracing::debug!(path = %state.path.display(), "log shrank, reopening");
                state.file = File::open(&state.path).await?;
                state.pos = 0;
            }
            Ok(_) => {}
            // between rotation and the next write
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use tokio::io::AsyncWriteExt;

    #[tokio::test]
    async fn test_starts_near_the_end_and_follows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.log");
        let head = "x".repeat(5000);
        tokio::fs::write(&path, format!("{head}\nlast line\n")).await.unwrap();

        let stream = follow(path.clone(), Duration::from_millis(10)).await.unwrap();
        let mut stream = Box::pin(stream);
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.len() as u64, TAIL_BYTES);
        assert!(first.ends_with(b"last line\n"));

        let mut file = tokio::fs::OpenOptions::new().append(true).open(&path).await.unwrap();
        file.write_all(b"appended\n").await.unwrap();
        file.flush().await.unwrap();

        let next = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&next[..], b"appended\n");
    }

    #[tokio::test]
    async fn test_small_file_is_sent_whole() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.log");
        tokio::fs::write(&path, "only\n").await.unwrap();
        let mut stream = Box::pin(follow(path, Duration::from_millis(10)).await.unwrap());
        assert_eq!(&stream.next().await.unwrap().unwrap()[..], b"only\n");
    }

    #[tokio::test]
    async fn test_truncation_restarts_from_zero() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("job.log");
        tokio::fs::write(&path, "a fairly long first line\n").await.unwrap();
        let mut stream = Box::pin(follow(path.clone(), Duration::from_millis(10)).await.unwrap());
        stream.next().await.unwrap().unwrap();

        tokio::fs::write(&path, "new\n").await.unwrap();
        let next = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(&next[..], b"new\n");
    }

    #[tokio::test]
    async fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(follow(dir.path().join("nope.log"), POLL_INTERVAL).await.is_err());
    }
}
