//! A single outstanding transfer and the state it reports back.

use crate::error::{Result, UpdaterError};
use crate::transport::{FetchResponse, Transport};
use bytes::BytesMut;
use futures::StreamExt;
use reqwest::Url;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// Default buffer size for writes to disk.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Default time a transfer may go without progress.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const RANGE_NOT_SATISFIABLE: u16 = 416;

/// What to fetch.
#[derive(Debug, Clone)]
pub enum TransferRequest {
    /// Fetch the whole body and deliver it as text.
    Text { url: Url },
    /// Stream the body into `dest`, resuming at `offset`.
    File {
        url: Url,
        dest: PathBuf,
        offset: u64,
        /// When set, the finished file must hash to this SHA-256 hex digest.
        expected_sha256: Option<String>,
    },
}

/// Limits applied to every transfer.
#[derive(Debug, Clone, Copy)]
pub struct TransferLimits {
    /// Maximum wait for the response and for each subsequent chunk.
    pub timeout: Duration,
    pub chunk_size: usize,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// Callback notifications emitted by a running transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    Started { offset: u64, total: Option<u64> },
    /// Total bytes received so far, counted from the start of the resource.
    Progress { received: u64 },
    TextReady(String),
    FileReady { len: u64 },
    Failed { status: Option<u16>, message: String },
}

/// Terminal result of a transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferResult {
    Text(String),
    File { len: u64 },
    Failed { status: Option<u16>, message: String },
}

/// Accumulated view of a transfer, folded from its events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferStatus {
    pub offset: u64,
    pub received: u64,
    pub total: Option<u64>,
    pub result: Option<TransferResult>,
}

impl TransferStatus {
    pub fn apply(&mut self, event: TransferEvent) {
        match event {
            TransferEvent::Started { offset, total } => {
                self.offset = offset;
                self.received = offset;
                self.total = total;
            }
            TransferEvent::Progress { received } => self.received = received,
            TransferEvent::TextReady(text) => self.result = Some(TransferResult::Text(text)),
            TransferEvent::FileReady { len } => {
                self.received = len;
                self.result = Some(TransferResult::File { len });
            }
            TransferEvent::Failed { status, message } => {
                self.result = Some(TransferResult::Failed { status, message })
            }
        }
    }

    /// Fraction of the resource received, when its size is known.
    pub fn fraction(&self) -> Option<f32> {
        match self.total {
            Some(total) if total > 0 => Some((self.received as f64 / total as f64).min(1.0) as f32),
            _ => None,
        }
    }
}

/// Receives the events of one transfer. May be called from any thread.
pub type EventSink = Arc<dyn Fn(TransferEvent) + Send + Sync>;

/// Handle on one in-flight transfer.
///
/// Dropping the session aborts the transfer; no event is delivered after
/// the abort has taken effect.
pub struct TransferSession {
    id: u64,
    task: JoinHandle<()>,
}

impl TransferSession {
    /// Spawn the transfer on `runtime`.
    pub fn start(
        id: u64,
        runtime: &Handle,
        transport: Arc<dyn Transport>,
        request: TransferRequest,
        limits: TransferLimits,
        sink: EventSink,
    ) -> Self {
        tracing::debug!("transfer {} starting: {:?}", id, request);
        let task = runtime.spawn(run(transport, request, limits, sink));
        Self { id, task }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Abort the transfer.
    pub fn dispose(self) {
        tracing::debug!("transfer {} disposed", self.id);
    }
}

impl Drop for TransferSession {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn run(
    transport: Arc<dyn Transport>,
    request: TransferRequest,
    limits: TransferLimits,
    sink: EventSink,
) {
    let outcome = match request {
        TransferRequest::Text { url } => fetch_text(transport.as_ref(), &url, limits, &sink)
            .await
            .map(TransferEvent::TextReady),
        TransferRequest::File {
            url,
            dest,
            offset,
            expected_sha256,
        } => {
            let fetched = fetch_file(transport.as_ref(), &url, &dest, offset, limits, &sink).await;
            match (fetched, expected_sha256) {
                (Ok(len), Some(expected)) => verify_file(dest, expected)
                    .await
                    .map(|()| TransferEvent::FileReady { len }),
                (fetched, None) => fetched.map(|len| TransferEvent::FileReady { len }),
                (Err(err), Some(_)) => Err(err),
            }
        }
    };

    let event = outcome.unwrap_or_else(|err| TransferEvent::Failed {
        status: err.status(),
        message: err.to_string(),
    });
    sink(event);
}

async fn within<T>(limit: Duration, fut: impl Future<Output = T>) -> Result<T> {
    timeout(limit, fut).await.map_err(|_| UpdaterError::Timeout)
}

async fn fetch_text(
    transport: &dyn Transport,
    url: &Url,
    limits: TransferLimits,
    sink: &EventSink,
) -> Result<String> {
    let FetchResponse {
        content_length,
        mut body,
        ..
    } = within(limits.timeout, transport.get(url, 0)).await??;
    sink(TransferEvent::Started {
        offset: 0,
        total: content_length,
    });

    let mut text = Vec::new();
    while let Some(chunk) = within(limits.timeout, body.next()).await? {
        text.extend_from_slice(&chunk?);
        sink(TransferEvent::Progress {
            received: text.len() as u64,
        });
    }
    Ok(String::from_utf8_lossy(&text).into_owned())
}

/// Stream `url` into `dest` starting at `offset`; returns the final length.
async fn fetch_file(
    transport: &dyn Transport,
    url: &Url,
    dest: &Path,
    offset: u64,
    limits: TransferLimits,
    sink: &EventSink,
) -> Result<u64> {
    let response = match within(limits.timeout, transport.get(url, offset)).await? {
        Ok(response) => response,
        // Everything up to `offset` is already here.
        Err(err) if offset > 0 && err.status() == Some(RANGE_NOT_SATISFIABLE) => {
            tracing::debug!("{} already complete at {} bytes", url, offset);
            return Ok(offset);
        }
        Err(err) => return Err(err),
    };

    let start = response.offset;
    if start != offset {
        tracing::info!("server ignored range request for {}, restarting", url);
    }
    sink(TransferEvent::Started {
        offset: start,
        total: response.content_length.map(|len| len + start),
    });

    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).await?;
    }
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(dest)
        .await?;
    file.set_len(start).await?;
    file.seek(SeekFrom::Start(start)).await?;

    let mut body = response.body;
    let mut buffer = BytesMut::with_capacity(limits.chunk_size);
    let mut written = start;
    while let Some(chunk) = within(limits.timeout, body.next()).await? {
        buffer.extend_from_slice(&chunk?);
        if buffer.len() >= limits.chunk_size {
            written += write_chunk(&mut file, &mut buffer).await?;
            sink(TransferEvent::Progress { received: written });
        }
    }
    if !buffer.is_empty() {
        written += write_chunk(&mut file, &mut buffer).await?;
        sink(TransferEvent::Progress { received: written });
    }
    file.sync_all().await?;

    Ok(written)
}

async fn write_chunk(file: &mut fs::File, buffer: &mut BytesMut) -> Result<u64> {
    let chunk = buffer.split();
    file.write_all(&chunk).await?;
    file.flush().await?;
    Ok(chunk.len() as u64)
}

/// Hash the finished file; a mismatch deletes it so the next attempt starts over.
async fn verify_file(dest: PathBuf, expected: String) -> Result<()> {
    let expected = expected.to_ascii_lowercase();
    let path = dest.clone();
    let actual = tokio::task::spawn_blocking(move || -> Result<String> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|err| UpdaterError::Other(format!("task join error: {err}")))??;

    if actual != expected {
        if let Err(err) = fs::remove_file(&dest).await {
            tracing::warn!("failed to discard corrupt download {:?}: {}", dest, err);
        }
        return Err(UpdaterError::IntegrityMismatch { expected, actual });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ByteStream;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::stream;
    use parking_lot::Mutex;
    use tempfile::tempdir;

    /// Serves a fixed body, honouring range requests.
    struct StaticTransport {
        body: Vec<u8>,
        chunk: usize,
        requested: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl Transport for StaticTransport {
        async fn get(&self, _url: &Url, offset: u64) -> Result<FetchResponse> {
            self.requested.lock().push(offset);
            let offset = offset.min(self.body.len() as u64);
            let rest = self.body[offset as usize..].to_vec();
            let chunks: Vec<Result<Bytes>> = rest
                .chunks(self.chunk)
                .map(|c| Ok(Bytes::copy_from_slice(c)))
                .collect();
            let body: ByteStream = stream::iter(chunks).boxed();
            Ok(FetchResponse {
                offset,
                content_length: Some(rest.len() as u64),
                body,
            })
        }
    }

    fn collecting_sink() -> (EventSink, Arc<Mutex<TransferStatus>>) {
        let status = Arc::new(Mutex::new(TransferStatus::default()));
        let shared = status.clone();
        (Arc::new(move |event| shared.lock().apply(event)), status)
    }

    fn url() -> Url {
        Url::parse("http://updates.test/a.bin").unwrap()
    }

    #[tokio::test]
    async fn text_transfer_delivers_whole_body() {
        let transport = StaticTransport {
            body: b"res=1.0\r\nfileList=abc".to_vec(),
            chunk: 4,
            requested: Mutex::new(Vec::new()),
        };
        let (sink, status) = collecting_sink();

        let text = fetch_text(&transport, &url(), TransferLimits::default(), &sink)
            .await
            .unwrap();

        assert_eq!(text, "res=1.0\r\nfileList=abc");
        assert_eq!(status.lock().received, text.len() as u64);
    }

    #[tokio::test]
    async fn file_transfer_resumes_from_offset() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("a.bin");
        let body: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&dest, &body[..4096]).unwrap();

        let transport = StaticTransport {
            body: body.clone(),
            chunk: 1000,
            requested: Mutex::new(Vec::new()),
        };
        let (sink, status) = collecting_sink();
        let limits = TransferLimits {
            chunk_size: 2048,
            ..TransferLimits::default()
        };

        let len = fetch_file(&transport, &url(), &dest, 4096, limits, &sink)
            .await
            .unwrap();

        assert_eq!(*transport.requested.lock(), vec![4096]);
        assert_eq!(len, body.len() as u64);
        assert_eq!(std::fs::read(&dest).unwrap(), body);
        let status = status.lock();
        assert_eq!(status.offset, 4096);
        assert_eq!(status.total, Some(body.len() as u64));
    }

    #[tokio::test]
    async fn integrity_mismatch_deletes_file() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("a.bin");
        std::fs::write(&dest, b"payload").unwrap();

        let err = verify_file(dest.clone(), "00".repeat(32)).await.unwrap_err();
        assert!(matches!(err, UpdaterError::IntegrityMismatch { .. }));
        assert!(!dest.exists());

        std::fs::write(&dest, b"payload").unwrap();
        let good = hex::encode(Sha256::digest(b"payload"));
        verify_file(dest.clone(), good.to_uppercase()).await.unwrap();
    }

    #[tokio::test]
    async fn stalled_transfer_times_out() {
        struct Stalled;

        #[async_trait]
        impl Transport for Stalled {
            async fn get(&self, _url: &Url, _offset: u64) -> Result<FetchResponse> {
                Ok(FetchResponse {
                    offset: 0,
                    content_length: None,
                    body: stream::pending().boxed(),
                })
            }
        }

        let (sink, _) = collecting_sink();
        let limits = TransferLimits {
            timeout: Duration::from_millis(20),
            ..TransferLimits::default()
        };
        let err = fetch_text(&Stalled, &url(), limits, &sink).await.unwrap_err();
        assert!(matches!(err, UpdaterError::Timeout));
    }
}
