//! Staging of uploaded payloads on local storage.
//!
//! Each upload is streamed into a uniquely named file under the configured
//! staging directory.  The returned [`StagedFile`] owns the path: calling
//! [`StagedFile::release`] removes it and logs (never returns) removal errors,
//! and dropping it without release still removes it, which covers cancelled
//! requests whose handler future is dropped mid-flight.

use std::path::{Path, PathBuf};

use bytes::Bytes;
use tempfile::TempPath;
use tokio::io::AsyncWriteExt;
use tokio_stream::{Stream, StreamExt};

/// Prefix shared by every staged file name.
pub const STAGED_PREFIX: &str = "pharmaguard_";

#[derive(Debug, thiserror::Error)]
pub enum StageError {
    #[error("failed to write staged upload: {0}")]
    Io(#[from] std::io::Error),
    #[error("upload stream interrupted: {0}")]
    Stream(String),
    #[error("upload exceeds limit of {limit} bytes")]
    TooLarge { limit: u64 },
}

/// Creates staged files in one directory, optionally capping their size.
#[derive(Debug, Clone)]
pub struct Stager {
    dir: PathBuf,
    max_bytes: Option<u64>,
}

impl Stager {
    pub fn new(dir: impl Into<PathBuf>, max_bytes: Option<u64>) -> Self {
        Self {
            dir: dir.into(),
            max_bytes,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn max_bytes(&self) -> Option<u64> {
        self.max_bytes
    }

    /// Copy `stream` into a fresh file ending in `suffix`.  On any error the
    /// partially written file is removed before returning.
    pub async fn stage<S, E>(&self, stream: S, suffix: &str) -> Result<StagedFile, StageError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        let dir = self.dir.clone();
        let suffix = suffix.to_string();
        let named = tokio::task::spawn_blocking(move || {
            tempfile::Builder::new()
                .prefix(STAGED_PREFIX)
                .suffix(&suffix)
                .tempfile_in(dir)
        })
        .await
        .map_err(std::io::Error::other)??;
        let (file, path) = named.into_parts();
        tracing::debug!(path = %path.display(), "staging upload");

        let mut file = tokio::fs::File::from_std(file);
        match self.copy_stream(stream, &mut file).await {
            Ok(size) => {
                drop(file);
                Ok(StagedFile { path, size })
            }
            Err(err) => {
                drop(file);
                discard(path);
                Err(err)
            }
        }
    }

    async fn copy_stream<S, E>(&self, stream: S, file: &mut tokio::fs::File) -> Result<u64, StageError>
    where
        S: Stream<Item = Result<Bytes, E>>,
        E: std::fmt::Display,
    {
        let mut stream = std::pin::pin!(stream);
        let mut written: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| StageError::Stream(e.to_string()))?;
            written += chunk.len() as u64;
            if let Some(limit) = self.max_bytes {
                if written > limit {
                    return Err(StageError::TooLarge { limit });
                }
            }
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        Ok(written)
    }
}

/// A staged upload.  Removed from disk on [`release`](Self::release) or drop.
#[derive(Debug)]
pub struct StagedFile {
    path: TempPath,
    size: u64,
}

impl StagedFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of bytes copied from the upload stream.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Remove the file.  Failures are logged and swallowed so they can never
    /// replace the outcome of the request that owned the file.
    pub fn release(self) {
        discard(self.path);
    }
}

fn discard(path: TempPath) {
    let shown = path.to_path_buf();
    match path.close() {
        Ok(()) => tracing::debug!(path = %shown.display(), "staged upload removed"),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::debug!(path = %shown.display(), "staged upload already gone");
        }
        Err(err) => {
            tracing::warn!(path = %shown.display(), error = %err, "failed to remove staged upload");
        }
    }
}
