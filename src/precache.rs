//! Background decode of the next track.
//!
//! Shortly before the current track ends, the player arms a precache: a
//! worker thread resolves a decoder for the next file, opens it and decodes
//! one staging slot's worth of PCM. On a clean end of stream with matching
//! sound parameters, the player adopts the staged buffer, the open decoder
//! and its bitrate log wholesale and continues without a gap.
//!
//! The staging buffer holds a single format. Any of these conditions
//! abandons the attempt: end of stream before the slot fills (the handover
//! cannot express "this is the whole track"), a fatal decoder error, or a
//! mid-stream parameter change. A recoverable stream error only stops the
//! fill early and keeps the partial data.

use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use crate::bitrate::BitrateLog;
use crate::decoder::registry::Registry;
use crate::decoder::{Decoder, Severity};
use crate::events::{Event, EventSink};
use crate::outbuf::PCM_BUF_SIZE;
use crate::params::SoundParams;

/// Everything the player adopts on handover. Ownership moves as one value;
/// nothing stays shared with the precache afterwards.
pub struct Staged {
    /// Decoded PCM, at most 2 x [`PCM_BUF_SIZE`].
    pub buf: Vec<u8>,

    /// Parameters of the staged PCM.
    pub params: SoundParams,

    /// The open decoder, positioned right after the staged bytes.
    pub decoder: Box<dyn Decoder>,

    /// Bitrate change points covering the staged data.
    pub bitrate: BitrateLog,

    /// Seconds of audio decoded into the staging buffer.
    pub decoded_time: f64,

    /// Average bitrate of the track, if known.
    pub avg_bitrate: Option<u32>,

    /// Track duration in seconds, if known.
    pub duration: Option<u32>,
}

/// Staging state for the next track.
///
/// Lifecycle: idle -> running -> joined, then either handed off with
/// [`take`](Precache::take) or discarded with [`reset`](Precache::reset).
#[derive(Default)]
pub struct Precache {
    /// Target file, set while armed.
    file: Option<String>,

    /// Running worker; `None` once joined.
    worker: Option<JoinHandle<Option<Staged>>>,

    /// Worker outcome, present after a successful join.
    staged: Option<Staged>,
}

impl Precache {
    /// Creates an idle precache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether nothing is armed, running or staged.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.file.is_none()
    }

    /// Whether the worker thread is still running (or not yet joined).
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker.is_some()
    }

    /// The armed target file, if any.
    #[must_use]
    pub fn file(&self) -> Option<&str> {
        self.file.as_deref()
    }

    /// Whether the worker finished and left usable staging data.
    #[must_use]
    pub fn ok(&self) -> bool {
        self.staged.is_some()
    }

    /// Arms the precache for `file` and spawns the worker thread.
    ///
    /// Must only be called while idle.
    pub fn start(&mut self, registry: Arc<Registry>, file: &str, events: EventSink) {
        debug_assert!(self.is_idle(), "precache armed while busy");

        info!("precaching file {file}");
        self.file = Some(file.to_string());
        self.staged = None;

        let file = file.to_string();
        let builder = std::thread::Builder::new().name("precache".to_string());
        match builder.spawn(move || precache_worker(&registry, &file, &events)) {
            Ok(handle) => self.worker = Some(handle),
            Err(e) => error!("could not run precache thread: {e}"),
        }
    }

    /// Joins the worker thread, if one is running, and records its outcome.
    pub fn wait(&mut self) {
        if let Some(worker) = self.worker.take() {
            debug!("waiting for precache thread");
            match worker.join() {
                Ok(staged) => self.staged = staged,
                Err(_) => error!("precache thread panicked"),
            }
        }
    }

    /// Hands the staging data to the caller.
    #[must_use]
    pub fn take(&mut self) -> Option<Staged> {
        debug_assert!(!self.is_running(), "handover from a running precache");
        self.staged.take()
    }

    /// Returns to idle, dropping any staging data (which closes its
    /// decoder). Must not be called while the worker runs.
    pub fn reset(&mut self) {
        debug_assert!(!self.is_running(), "reset of a running precache");
        self.file = None;
        self.staged = None;
    }
}

/// Decodes up to one staging slot of the file.
///
/// Returns `None` whenever the staging data cannot be used; the player will
/// then open the track from scratch.
fn precache_worker(registry: &Registry, file: &str, events: &EventSink) -> Option<Staged> {
    let Some(codec) = registry.get_decoder(file) else {
        info!("no decoder for precache of {file}");
        events.emit(Event::AudioFail(file.to_string()));
        return None;
    };

    let mut decoder = match codec.open(Path::new(file)) {
        Ok(decoder) => decoder,
        Err(e) => {
            info!("failed to open file for precache: {e}");
            events.emit(Event::AudioFail(file.to_string()));
            return None;
        }
    };

    let duration = decoder.duration();
    if let Some(seconds) = duration {
        events.emit(Event::PlaylistTime {
            file: file.to_string(),
            seconds,
        });
    }
    let avg_bitrate = decoder.avg_bitrate();

    let mut buf = vec![0u8; 2 * PCM_BUF_SIZE];
    let mut fill = 0;
    let mut params = SoundParams::default();
    let bitrate = BitrateLog::new();
    let mut decoded_time = 0.0_f64;

    // Stop at one slot: anything decoded beyond it would have nowhere to go
    // when the output buffer takes over.
    while fill < PCM_BUF_SIZE {
        let end = buf.len().min(fill + PCM_BUF_SIZE);
        let step = decoder.decode(&mut buf[fill..end]);

        if step.bytes == 0 {
            // The handover cannot express an already-finished track.
            info!("EOF when precaching {file}");
            return None;
        }

        let err = decoder.take_error();
        if err.severity == Severity::Fatal {
            info!("error reading file for precache: {}", err.message);
            events.emit(Event::AudioFail(file.to_string()));
            return None;
        }

        if !params.is_known() {
            params = step.params;
        } else if params != step.params {
            // A staging buffer cannot hold two formats (this should never
            // happen this early in a track).
            info!("sound parameters changed when precaching {file}");
            return None;
        }

        #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let second = decoded_time as u32;
        if let Some(kbps) = decoder.bitrate() {
            bitrate.add(second, kbps);
        }

        fill += step.bytes;
        decoded_time += step.bytes as f64 / step.params.bytes_per_second() as f64;

        if err.severity == Severity::Stream {
            // Keep the partial data rather than risk losing the stream.
            warn!("stream error when precaching {file}: {}", err.message);
            break;
        }
    }

    buf.truncate(fill);
    info!("successfully precached {file} ({fill} bytes)");
    Some(Staged {
        buf,
        params,
        decoder,
        bitrate,
        decoded_time,
        avg_bitrate,
        duration,
    })
}
