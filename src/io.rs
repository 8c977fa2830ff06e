//! Uniform byte source for local files and network streams.
//!
//! An [`IoStream`] hides whether audio bytes come from the filesystem or
//! from an HTTP(S) stream bridged through `stream-download`. On top of plain
//! reads it offers:
//!
//! * [`peek`](IoStream::peek) — non-consuming look-ahead, used by
//!   content-based decoder dispatch,
//! * [`prebuffer`](IoStream::prebuffer) — blocking until a number of bytes
//!   is buffered ahead, used to ride out network jitter,
//! * [`abort`](IoStream::abort) — unblocking any pending read with an
//!   error, used by the stop path.
//!
//! The handle is cheaply cloneable: the player keeps one clone for
//! prebuffering and aborting while the decoder owns another for reading.
//! All clones share one reader, one look-ahead buffer and one abort flag.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use stream_download::http::HttpStream;
use stream_download::source::SourceStream;
use stream_download::storage::temp::TempStorageProvider;
use stream_download::{Settings, StreamDownload};
use symphonia::core::io::MediaSource;
use url::Url;

use crate::error::{Error, Result};

/// Buffer size for local file reads (32 KiB).
///
/// Matches Symphonia's sequential read pattern, which grows its requests up
/// to 32 KiB.
pub const BUFFER_LEN: usize = 32 * 1024;

/// Chunk size for look-ahead fills; small enough that an abort is observed
/// promptly between chunks.
const FILL_CHUNK: usize = 8 * 1024;

/// Combines Read and Seek for audio byte sources.
pub trait ReadSeek: Read + Seek + Send + Sync {}

/// Blanket implementation for any type that implements both Read and Seek.
impl<T: Read + Seek + Send + Sync> ReadSeek for T {}

/// Returns whether `source` names a network stream rather than a local path.
///
/// Recognizes the `http://`, `https://` and `ftp://` schemes,
/// case-insensitively.
#[must_use]
pub fn is_url(source: &str) -> bool {
    ["http://", "https://", "ftp://"]
        .iter()
        .any(|scheme| source.len() > scheme.len() && source[..scheme.len()].eq_ignore_ascii_case(scheme))
}

/// Cloneable handle that aborts a stream's pending and future reads.
///
/// Held by the player session under its own lock so that a stop request can
/// interrupt a decoder blocked in I/O.
#[derive(Clone, Debug)]
pub struct AbortHandle {
    aborted: Arc<AtomicBool>,
}

impl AbortHandle {
    /// Aborts the stream. All subsequent operations fail with an error.
    pub fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }

    /// Whether the stream has been aborted.
    #[must_use]
    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }
}

struct StreamState {
    reader: Box<dyn ReadSeek>,
    /// Bytes read ahead of the consumer; `peeked[peek_pos..]` is pending.
    peeked: Vec<u8>,
    peek_pos: usize,
}

struct Inner {
    state: Mutex<StreamState>,
    aborted: Arc<AtomicBool>,
    mime: Option<String>,
    byte_len: Option<u64>,
    seekable: bool,
    source: String,
}

/// Shared byte source for a local file or a network stream.
pub struct IoStream {
    inner: Arc<Inner>,
}

impl Clone for IoStream {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl IoStream {
    /// Opens a local path or URL, dispatching on [`is_url`].
    ///
    /// `buffered` wraps local files in a [`BUFFER_LEN`] read buffer;
    /// `prefetch_kib` sizes the initial network prefetch.
    ///
    /// Opening a URL requires a Tokio runtime context (the download bridge
    /// is async under the hood); the decode loop runs on a runtime-managed
    /// blocking thread, which qualifies.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened, the URL is invalid or the
    /// HTTP request fails.
    pub fn open(source: &str, buffered: bool, prefetch_kib: usize) -> Result<Self> {
        if is_url(source) {
            let url: Url = source.parse()?;
            let handle = tokio::runtime::Handle::try_current().map_err(|e| {
                Error::failed_precondition(format!("network streams need a runtime: {e}"))
            })?;
            handle.block_on(Self::open_url(url, prefetch_kib))
        } else {
            Self::open_file(Path::new(source), buffered)
        }
    }

    /// Opens a local file.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened or its length queried.
    pub fn open_file(path: &Path, buffered: bool) -> Result<Self> {
        let file = File::open(path)?;
        let byte_len = file.metadata().ok().map(|meta| meta.len());
        let reader: Box<dyn ReadSeek> = if buffered {
            Box::new(BufReader::with_capacity(BUFFER_LEN, file))
        } else {
            Box::new(file)
        };

        let mime = mime_guess::from_path(path).first().map(|m| m.to_string());
        Ok(Self::from_parts(
            reader,
            mime,
            byte_len,
            true,
            path.to_string_lossy().into_owned(),
        ))
    }

    /// Opens a network stream and starts downloading in the background.
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the download cannot start.
    pub async fn open_url(url: Url, prefetch_kib: usize) -> Result<Self> {
        let client = reqwest::Client::new();
        let stream = HttpStream::new(client, url.clone())
            .await
            .map_err(|e| Error::unavailable(e.to_string()))?;

        let mime = stream.header("content-type").map(str::to_owned);
        let byte_len = stream.content_length();

        let download = StreamDownload::from_stream(
            stream,
            TempStorageProvider::new(),
            Settings::default()
                .prefetch_bytes(prefetch_kib as u64 * 1024)
                .cancel_on_drop(true),
        )
        .await
        .map_err(|e| Error::unavailable(e.to_string()))?;

        debug!("streaming {url} ({})", mime.as_deref().unwrap_or("unknown type"));
        Ok(Self::from_parts(
            Box::new(download),
            mime,
            byte_len,
            byte_len.is_some(),
            url.to_string(),
        ))
    }

    /// Builds a stream from an arbitrary reader.
    ///
    /// Used by the URL and file constructors and by tests that need a
    /// scripted byte source.
    #[must_use]
    pub fn from_parts(
        reader: Box<dyn ReadSeek>,
        mime: Option<String>,
        byte_len: Option<u64>,
        seekable: bool,
        source: String,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(StreamState {
                    reader,
                    peeked: Vec::new(),
                    peek_pos: 0,
                }),
                aborted: Arc::new(AtomicBool::new(false)),
                mime,
                byte_len,
                seekable,
                source,
            }),
        }
    }

    /// The path or URL this stream reads from.
    #[must_use]
    pub fn source(&self) -> &str {
        &self.inner.source
    }

    /// MIME type reported by the transport, if any.
    #[must_use]
    pub fn mime_type(&self) -> Option<&str> {
        self.inner.mime.as_deref()
    }

    /// Returns a handle that can abort this stream from another thread.
    #[must_use]
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            aborted: Arc::clone(&self.inner.aborted),
        }
    }

    /// Aborts the stream; pending and future reads fail with an error.
    pub fn abort(&self) {
        self.abort_handle().abort();
    }

    fn check_aborted(&self) -> io::Result<()> {
        if self.inner.aborted.load(Ordering::SeqCst) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionAborted,
                "stream aborted",
            ));
        }
        Ok(())
    }

    /// Grows the look-ahead buffer until at least `want` unconsumed bytes
    /// are pending, EOF is reached or the stream is aborted. Returns the
    /// number of pending bytes.
    fn fill_ahead(&self, want: usize) -> io::Result<usize> {
        loop {
            self.check_aborted()?;

            let mut state = self.inner.state.lock().unwrap();
            let pending = state.peeked.len() - state.peek_pos;
            if pending >= want {
                return Ok(pending);
            }

            let chunk = FILL_CHUNK.min(want - pending);
            let mut tmp = vec![0u8; chunk];
            let n = state.reader.read(&mut tmp)?;
            if n == 0 {
                return Ok(pending);
            }
            state.peeked.extend_from_slice(&tmp[..n]);
        }
    }

    /// Non-consuming read of up to `max` bytes from the current position.
    ///
    /// Returns fewer bytes only at end of stream.
    ///
    /// # Errors
    ///
    /// Returns error if the stream was aborted or the underlying read fails.
    pub fn peek(&self, max: usize) -> Result<Vec<u8>> {
        self.fill_ahead(max)?;
        let state = self.inner.state.lock().unwrap();
        let pending = &state.peeked[state.peek_pos..];
        Ok(pending[..pending.len().min(max)].to_vec())
    }

    /// Blocks until `bytes` bytes are buffered ahead of the consumer, EOF is
    /// reached or the stream is aborted.
    ///
    /// # Errors
    ///
    /// Returns error if the stream was aborted or the underlying read fails.
    pub fn prebuffer(&self, bytes: usize) -> Result<()> {
        let pending = self.fill_ahead(bytes)?;
        trace!("prebuffered {pending} of {bytes} requested bytes");
        Ok(())
    }
}

impl Read for IoStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_aborted()?;

        let mut state = self.inner.state.lock().unwrap();
        let pending = state.peeked.len() - state.peek_pos;
        if pending > 0 {
            let n = pending.min(buf.len());
            let start = state.peek_pos;
            buf[..n].copy_from_slice(&state.peeked[start..start + n]);
            state.peek_pos += n;
            if state.peek_pos == state.peeked.len() {
                state.peeked.clear();
                state.peek_pos = 0;
            }
            return Ok(n);
        }

        state.reader.read(buf)
    }
}

impl Seek for IoStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.check_aborted()?;

        let mut state = self.inner.state.lock().unwrap();
        // The reader is ahead of the consumer by the pending look-ahead;
        // relative seeks must be taken from the consumer's position.
        let pending = (state.peeked.len() - state.peek_pos) as u64;
        let target = match pos {
            SeekFrom::Current(delta) => {
                let physical = state.reader.stream_position()?;
                let logical = physical.saturating_sub(pending);
                let resolved = logical
                    .checked_add_signed(delta)
                    .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "seek before start"))?;
                SeekFrom::Start(resolved)
            }
            other => other,
        };

        state.peeked.clear();
        state.peek_pos = 0;
        state.reader.seek(target)
    }
}

impl MediaSource for IoStream {
    fn is_seekable(&self) -> bool {
        self.inner.seekable
    }

    fn byte_len(&self) -> Option<u64> {
        self.inner.byte_len
    }
}
