use std::io;

use async_trait::async_trait;
use camino::Utf8PathBuf;
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::{BoxedReader, DownloadError, RemotePath, RemoteStorage, StorageError};

/// A storage backend that writes artifacts under a directory on local disk.
///
/// Uploads are written to a sibling `.partial-*` file and renamed into place on success, so a
/// reader never observes a half-written artifact and a cancelled or failed upload never leaves
/// a file visible under the final name (SPEC_FULL.md §4.4: "storage partial writes are never
/// committed by the sink under error").
pub struct LocalFs {
    base: Utf8PathBuf,
}

impl LocalFs {
    pub async fn new(base: Utf8PathBuf) -> anyhow::Result<Self> {
        tokio::fs::create_dir_all(&base).await?;
        Ok(Self { base })
    }

    fn path_for(&self, key: &RemotePath) -> Utf8PathBuf {
        self.base.join(key.as_str())
    }
}

const COPY_CHUNK: usize = 64 * 1024;

#[async_trait]
impl RemoteStorage for LocalFs {
    async fn upload(
        &self,
        mut from: BoxedReader,
        to: &RemotePath,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<(), StorageError> {
        let final_path = self.path_for(to);
        let tmp_path = self.base.join(format!(".partial-{}", uuid_like_suffix()));

        let mut tmp_file = tokio::fs::File::create(&tmp_path)
            .await
            .map_err(|e| StorageError::Other(e.into()))?;

        let mut buf = vec![0u8; COPY_CHUNK];
        let result = async {
            loop {
                if cancel.is_cancelled() {
                    return Err(StorageError::Cancelled);
                }
                let n = from
                    .read(&mut buf)
                    .await
                    .map_err(|e| StorageError::Other(e.into()))?;
                if n == 0 {
                    break;
                }
                tmp_file
                    .write_all(&buf[..n])
                    .await
                    .map_err(|e| StorageError::Other(e.into()))?;
            }
            tmp_file
                .flush()
                .await
                .map_err(|e| StorageError::Other(e.into()))
        }
        .await;

        if let Err(e) = result {
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Err(e);
        }

        tokio::fs::rename(&tmp_path, &final_path)
            .await
            .map_err(|e| StorageError::Other(e.into()))
    }

    async fn download(&self, from: &RemotePath) -> Result<BoxedReader, DownloadError> {
        let path = self.path_for(from);
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Box::pin(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(DownloadError::NotFound),
            Err(e) => Err(DownloadError::Other(e.into())),
        }
    }

    async fn delete(
        &self,
        path: &RemotePath,
        _cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<(), StorageError> {
        let path = self.path_for(path);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Other(e.into())),
        }
    }

    async fn exists(&self, path: &RemotePath) -> Result<bool, StorageError> {
        match tokio::fs::metadata(self.path_for(path)).await {
            Ok(_) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(StorageError::Other(e.into())),
        }
    }
}

/// Cheap unique-enough suffix for partial-upload filenames; collisions would only matter for
/// two concurrent uploads of the exact same artifact, which never happens (backup ids are
/// unique and a database has at most one in-flight backup).
fn uuid_like_suffix() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    format!("{nanos:x}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    async fn backend() -> (LocalFs, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let base = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (LocalFs::new(base).await.unwrap(), dir)
    }

    #[tokio::test]
    async fn upload_then_download_round_trips() {
        let (fs, _dir) = backend().await;
        let cancel = CancellationToken::new();
        let key = RemotePath::new("abc");

        let data = b"hello backup world".to_vec();
        let reader: BoxedReader = Box::pin(std::io::Cursor::new(data.clone()));
        fs.upload(reader, &key, &cancel).await.unwrap();

        assert!(fs.exists(&key).await.unwrap());
        let mut downloaded = fs.download(&key).await.unwrap();
        let mut out = Vec::new();
        downloaded.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, data);
    }

    #[tokio::test]
    async fn download_missing_is_not_found() {
        let (fs, _dir) = backend().await;
        let result = fs.download(&RemotePath::new("missing")).await;
        assert!(matches!(result, Err(DownloadError::NotFound)));
    }

    #[tokio::test]
    async fn cancelled_upload_leaves_no_artifact() {
        let (fs, _dir) = backend().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let key = RemotePath::new("cancelled");
        let reader: BoxedReader = Box::pin(std::io::Cursor::new(b"data".to_vec()));

        let result = fs.upload(reader, &key, &cancel).await;
        assert!(result.is_err());
        assert!(!fs.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let (fs, _dir) = backend().await;
        let cancel = CancellationToken::new();
        let key = RemotePath::new("gone");
        fs.delete(&key, &cancel).await.unwrap();
        fs.delete(&key, &cancel).await.unwrap();
    }
}
