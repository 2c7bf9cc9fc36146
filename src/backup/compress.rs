// backman/src/backup/compress.rs
use bytes::Bytes;
use chrono::{DateTime, Utc};
use flate2::{Compression, GzBuilder};
use std::io::{self, Write};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::debug;

const CHUNK_SIZE: usize = 64 * 1024;
const CHANNEL_DEPTH: usize = 4;

/// Body handed to an uploader: a readable stream of unknown length.
pub type UploadBody = Box<dyn AsyncRead + Send + Unpin>;

/// Metadata embedded in the gzip header.
#[derive(Debug, Clone)]
pub struct GzipHeader {
    pub filename: String,
    pub mtime: DateTime<Utc>,
}

impl GzipHeader {
    /// Header stamped with the current time.
    pub fn now(filename: impl Into<String>) -> Self {
        Self {
            filename: filename.into(),
            mtime: Utc::now(),
        }
    }

    fn mtime_secs(&self) -> u32 {
        u32::try_from(self.mtime.timestamp()).unwrap_or(0)
    }
}

/// Write end of the compressed stream.
#[derive(Debug)]
pub struct CompressedSink {
    tx: mpsc::Sender<io::Result<Bytes>>,
}

impl CompressedSink {
    async fn send(&self, chunk: Vec<u8>) -> io::Result<()> {
        self.tx
            .send(Ok(Bytes::from(chunk)))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "compressed stream reader dropped"))
    }

    async fn fail(&self, err: &io::Error) {
        let _ = self.tx.send(Err(io::Error::new(err.kind(), err.to_string()))).await;
    }
}

/// Creates a bounded pipe for compressed bytes. Errors sent by the compression
/// side surface as read errors on the returned body.
pub fn compressed_channel() -> (CompressedSink, UploadBody) {
    let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
    let body = StreamReader::new(ReceiverStream::new(rx));
    (CompressedSink { tx }, Box::new(body))
}

/// Gzips `source` into `sink` until the source is exhausted.
///
/// End-of-file alone does not finish the stream: the gzip trailer is only
/// written once `source_complete` reports `true`. A `false`, a dropped sender
/// or `cancel` firing first all count as a truncated source.
///
/// The sink is closed on every return path; on failure the error is forwarded
/// to the reader first so a truncated stream is never mistaken for a complete one.
/// Returns the number of uncompressed bytes consumed.
pub async fn compress_stream<R>(
    source: R,
    sink: CompressedSink,
    header: &GzipHeader,
    source_complete: oneshot::Receiver<bool>,
    cancel: &CancellationToken,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let result = gzip_into(source, &sink, header, source_complete, cancel).await;
    if let Err(e) = &result {
        sink.fail(e).await;
    }
    drop(sink);
    result
}

async fn gzip_into<R>(
    mut source: R,
    sink: &CompressedSink,
    header: &GzipHeader,
    source_complete: oneshot::Receiver<bool>,
    cancel: &CancellationToken,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
{
    let mut encoder = GzBuilder::new()
        .filename(header.filename.as_bytes())
        .mtime(header.mtime_secs())
        .write(Vec::with_capacity(CHUNK_SIZE), Compression::default());
    let mut chunk = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "compression cancelled"));
            }
            read = source.read(&mut chunk) => read?,
        };
        if n == 0 {
            break;
        }
        total += n as u64;
        encoder.write_all(&chunk[..n])?;

        let pending = std::mem::take(encoder.get_mut());
        if !pending.is_empty() {
            sink.send(pending).await?;
        }
    }

    let complete = tokio::select! {
        biased;
        _ = cancel.cancelled() => false,
        complete = source_complete => complete.unwrap_or(false),
    };
    if !complete {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "dump output ended before the dump completed",
        ));
    }

    let tail = encoder.finish()?;
    if !tail.is_empty() {
        sink.send(tail).await?;
    }
    debug!(filename = %header.filename, bytes = total, "compression finished");
    Ok(total)
}
