//! Artifact reader (component C7).
//!
//! Opens a completed backup's artifact for reading, transparently decrypting it if it was
//! written encrypted. Decryption runs on a background task and streams plaintext back through a
//! [`tokio::io::duplex`] pipe, the same pattern the dump pipeline uses to avoid holding a whole
//! artifact in memory.

use async_compression::tokio::bufread::ZstdDecoder;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader};

use crate::collaborators::SecretKeyService;
use crate::crypto::{self, EncryptionMetadata, FrameDecryptor};
use crate::error::ServiceError;
use crate::record::{BackupRecord, EncryptionKind};
use remote_storage::{BoxedReader, DownloadError, DynRemoteStorage, RemotePath};

#[derive(Debug, Error)]
pub enum ReadError {
    #[error("backup artifact not found")]
    NotFound,
    #[error("artifact failed its integrity check")]
    Integrity,
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<DownloadError> for ReadError {
    fn from(e: DownloadError) -> Self {
        match e {
            DownloadError::NotFound => ReadError::NotFound,
            DownloadError::Cancelled => ReadError::Other(anyhow::anyhow!("download cancelled")),
            DownloadError::Other(e) => ReadError::Other(e),
        }
    }
}

/// Opens `record`'s artifact for reading. The returned reader yields plaintext regardless of
/// whether the artifact is stored compressed-only or compressed-and-encrypted.
pub async fn open_for_read(
    storage: &DynRemoteStorage,
    secret_keys: &dyn SecretKeyService,
    record: &BackupRecord,
) -> Result<BoxedReader, ReadError> {
    let key = RemotePath::new(record.id.to_string());
    let mut raw = storage.download(&key).await?;

    let compressed: BoxedReader = if record.encryption == EncryptionKind::None {
        raw
    } else {
        let (salt, iv) = record
            .encryption_metadata()?
            .expect("encryption_metadata returns Some for EncryptionKind::Encrypted");

        let mut header = [0u8; crypto::HEADER_LEN];
        raw.read_exact(&mut header)
            .await
            .map_err(|_| ReadError::Integrity)?;
        let parsed = EncryptionMetadata::parse_header(&header).map_err(|_| ReadError::Integrity)?;
        if parsed.salt != salt || parsed.iv != iv {
            return Err(ReadError::Integrity);
        }

        let master_key = secret_keys.get_secret_key();
        let decryptor = FrameDecryptor::new(&master_key, &parsed, record.id);
        let backup_id = record.id;

        let (writer, reader) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            if let Err(e) = decrypt_frames(raw, writer, decryptor).await {
                tracing::warn!(backup_id = %backup_id, error = %e, "decrypt stream aborted");
            }
        });
        Box::pin(reader)
    };

    Ok(Box::pin(ZstdDecoder::new(BufReader::new(compressed))))
}

async fn decrypt_frames<R, W>(
    mut sealed: R,
    mut plaintext: W,
    decryptor: FrameDecryptor,
) -> Result<(), ReadError>
where
    R: tokio::io::AsyncRead + Unpin,
    W: tokio::io::AsyncWrite + Unpin,
{
    let mut frame_index = 0u64;
    loop {
        let mut len_buf = [0u8; 4];
        match sealed.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(e) => return Err(ReadError::Other(e.into())),
        }
        let len = u32::from_be_bytes(len_buf) as usize;
        let mut buf = vec![0u8; len];
        sealed
            .read_exact(&mut buf)
            .await
            .map_err(|e| ReadError::Other(e.into()))?;
        let plain = decryptor
            .open_frame(frame_index, &buf)
            .map_err(|_| ReadError::Integrity)?;
        plaintext
            .write_all(&plain)
            .await
            .map_err(|e| ReadError::Other(e.into()))?;
        frame_index += 1;
    }
    plaintext.flush().await.map_err(|e| ReadError::Other(e.into()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{FixtureDumpProducer, StaticSecretKeyService};
    use crate::config::DesiredEncryption;
    use crate::pipeline::{self, PipelineInput};
    use crate::record::BackupStatus;
    use chrono::Utc;
    use remote_storage::{LocalFs, RemoteStorage};
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;
    use uuid::Uuid;

    async fn local_storage() -> (Arc<LocalFs>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let base = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
        (Arc::new(LocalFs::new(base).await.unwrap()), dir)
    }

    #[tokio::test]
    async fn reads_back_plaintext_of_encrypted_artifact() {
        let (storage, _dir) = local_storage().await;
        let backup_id = Uuid::new_v4();
        let payload = b"reader round trip".repeat(200);
        let dump = FixtureDumpProducer::new(payload.clone());
        let master_key = [3u8; 32];

        let outcome = pipeline::run(
            &dump,
            PipelineInput {
                backup_id,
                desired_encryption: DesiredEncryption::Encrypted,
                secret_key: Some(master_key),
                storage: storage.clone(),
                storage_key: RemotePath::new(backup_id.to_string()),
                cancel: CancellationToken::new(),
                cpu_count_hint: 1,
            },
            |_| {},
        )
        .await
        .unwrap();
        let meta = outcome.encryption.unwrap();

        let record = BackupRecord {
            id: backup_id,
            database_id: Uuid::new_v4(),
            storage_id: Uuid::new_v4(),
            status: BackupStatus::Completed,
            size_mb: outcome.size_mb,
            duration_ms: 1,
            fail_message: None,
            encryption: EncryptionKind::Encrypted,
            encryption_salt: Some(meta.salt),
            encryption_iv: Some(meta.iv),
            created_at: Utc::now(),
        };

        let secret_keys = StaticSecretKeyService::new(master_key);
        let mut reader = open_for_read(&(storage as DynRemoteStorage), &secret_keys, &record)
            .await
            .unwrap();
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, payload);
    }

    #[tokio::test]
    async fn mismatched_header_is_an_integrity_error() {
        let (storage, _dir) = local_storage().await;
        let backup_id = Uuid::new_v4();
        let key = RemotePath::new(backup_id.to_string());
        storage
            .upload(
                Box::pin(std::io::Cursor::new(vec![0u8; 10])),
                &key,
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        let record = BackupRecord {
            id: backup_id,
            database_id: Uuid::new_v4(),
            storage_id: Uuid::new_v4(),
            status: BackupStatus::Completed,
            size_mb: 0.0,
            duration_ms: 1,
            fail_message: None,
            encryption: EncryptionKind::Encrypted,
            encryption_salt: Some([1u8; 16]),
            encryption_iv: Some([2u8; 12]),
            created_at: Utc::now(),
        };

        let secret_keys = StaticSecretKeyService::new([0u8; 32]);
        let result = open_for_read(&(storage as DynRemoteStorage), &secret_keys, &record).await;
        assert!(matches!(result, Err(ReadError::Integrity)));
    }
}
