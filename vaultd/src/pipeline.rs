//! Streaming dump pipeline (component C4).
//!
//! Wires the per-engine dump producer through compression, optional frame encryption and the
//! storage sink without ever buffering a whole artifact in memory. The producer and the storage
//! upload run concurrently, joined by a [`tokio::io::duplex`] pipe, which is the bounded buffer
//! that gives the whole chain backpressure: a slow sink stalls the producer rather than letting
//! it race ahead.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration as StdDuration, Instant};

use async_compression::tokio::bufread::ZstdEncoder;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::collaborators::{DumpError, DumpProducer};
use crate::config::DesiredEncryption;
use crate::crypto::{EncryptionMetadata, FrameEncryptor};
use remote_storage::{DynRemoteStorage, RemotePath, StorageError};

const FRAME_SIZE: usize = 64 * 1024;
const PROGRESS_BYTES_INTERVAL: u64 = 4 * 1024 * 1024;
const PROGRESS_TIME_INTERVAL: StdDuration = StdDuration::from_secs(1);

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("dump producer failed: {0}")]
    Dump(#[from] DumpError),
    #[error("reading the compressed stream failed: {0}")]
    Compression(#[source] std::io::Error),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error("backup was cancelled")]
    Cancelled,
}

#[derive(Debug)]
pub struct PipelineOutcome {
    pub encryption: Option<EncryptionMetadata>,
    pub size_mb: f64,
}

pub struct PipelineInput {
    pub backup_id: Uuid,
    pub desired_encryption: DesiredEncryption,
    pub secret_key: Option<[u8; 32]>,
    pub storage: DynRemoteStorage,
    pub storage_key: RemotePath,
    pub cancel: CancellationToken,
    pub cpu_count_hint: u32,
}

/// An [`AsyncRead`] wrapper that tallies bytes as they come off `inner`, independent of anything
/// downstream. Wrapping the dump producer's raw reader (before compression) is what makes the
/// counter track dump throughput rather than artifact size.
struct CountingReader<R> {
    inner: R,
    counted: Arc<AtomicU64>,
}

impl<R: AsyncRead + Unpin> AsyncRead for CountingReader<R> {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        let before = buf.filled().len();
        let poll = Pin::new(&mut self.inner).poll_read(cx, buf);
        if poll.is_ready() {
            let read = buf.filled().len() - before;
            self.counted.fetch_add(read as u64, Ordering::Relaxed);
        }
        poll
    }
}

/// Runs one backup's dump-compress-encrypt-upload chain. `on_progress` is called with the total
/// number of raw dump-producer bytes read so far, debounced to roughly once a second or every
/// 4 MiB, whichever comes first.
pub async fn run(
    dump: &dyn DumpProducer,
    input: PipelineInput,
    mut on_progress: impl FnMut(u64) + Send,
) -> Result<PipelineOutcome, PipelineError> {
    let raw = dump.execute(&input.cancel, input.cpu_count_hint).await?;
    let raw_bytes = Arc::new(AtomicU64::new(0));
    let counted = CountingReader {
        inner: raw,
        counted: raw_bytes.clone(),
    };
    let compressed = ZstdEncoder::new(BufReader::new(counted));

    let encryptor = match input.desired_encryption {
        DesiredEncryption::None => None,
        DesiredEncryption::Encrypted => {
            let key = input
                .secret_key
                .expect("DesiredEncryption::Encrypted always carries a secret key");
            Some(FrameEncryptor::new(&key, input.backup_id))
        }
    };
    let metadata = encryptor.as_ref().map(|e| e.metadata);

    let (writer, reader) = tokio::io::duplex(FRAME_SIZE);
    let storage = input.storage.clone();
    let storage_key = input.storage_key.clone();
    let upload_cancel = input.cancel.clone();
    let upload_task = tokio::spawn(async move {
        storage
            .upload(Box::pin(reader), &storage_key, &upload_cancel)
            .await
    });

    let produce_result = produce(
        compressed,
        writer,
        encryptor,
        &input.cancel,
        raw_bytes.clone(),
        &mut on_progress,
    )
    .await;

    let upload_result = upload_task
        .await
        .unwrap_or(Err(StorageError::Other(anyhow::anyhow!(
            "upload task panicked"
        ))));

    produce_result?;
    upload_result?;
    let total_bytes = raw_bytes.load(Ordering::Relaxed);

    Ok(PipelineOutcome {
        encryption: metadata,
        size_mb: total_bytes as f64 / (1024.0 * 1024.0),
    })
}

async fn produce<R, W>(
    mut compressed: R,
    mut sink: W,
    encryptor: Option<FrameEncryptor>,
    cancel: &CancellationToken,
    raw_bytes: Arc<AtomicU64>,
    on_progress: &mut (impl FnMut(u64) + Send),
) -> Result<(), PipelineError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    if let Some(encryptor) = &encryptor {
        sink.write_all(&encryptor.metadata.header_bytes())
            .await
            .map_err(PipelineError::Compression)?;
    }

    let mut buf = vec![0u8; FRAME_SIZE];
    let mut frame_index: u64 = 0;
    let mut last_reported: u64 = 0;
    let mut last_report = Instant::now();

    loop {
        if cancel.is_cancelled() {
            return Err(PipelineError::Cancelled);
        }
        let n = compressed
            .read(&mut buf)
            .await
            .map_err(PipelineError::Compression)?;
        if n == 0 {
            break;
        }

        match &encryptor {
            Some(enc) => {
                let sealed = enc
                    .seal_frame(frame_index, &buf[..n])
                    .map_err(|e| PipelineError::Compression(std::io::Error::other(e)))?;
                frame_index += 1;
                sink.write_u32(sealed.len() as u32)
                    .await
                    .map_err(PipelineError::Compression)?;
                sink.write_all(&sealed)
                    .await
                    .map_err(PipelineError::Compression)?;
            }
            None => {
                sink.write_all(&buf[..n])
                    .await
                    .map_err(PipelineError::Compression)?;
            }
        }

        let current = raw_bytes.load(Ordering::Relaxed);
        if current - last_reported >= PROGRESS_BYTES_INTERVAL || last_report.elapsed() >= PROGRESS_TIME_INTERVAL {
            on_progress(current);
            last_reported = current;
            last_report = Instant::now();
        }
    }

    sink.flush().await.map_err(PipelineError::Compression)?;
    on_progress(raw_bytes.load(Ordering::Relaxed));
    Ok(())
}
