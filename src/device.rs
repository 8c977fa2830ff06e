//! Audio output device.
//!
//! The output side of the pipeline: a [`BufferSource`] pulls PCM bytes out
//! of the shared [`OutputBuffer`] and feeds them to a rodio sink as `f32`
//! samples. Reading from the ring advances the playback time cursor and
//! fires the free callback that wakes the decode loop, so the device does
//! double duty as the engine's clock.
//!
//! The cpal stream is not `Send`, so a dedicated thread owns it and serves
//! open/pause/resume commands over a channel. Opening with the parameters
//! that are already playing is a no-op; that is what makes same-format
//! gapless handover seamless.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait};

use crate::error::{Error, Result};
use crate::outbuf::OutputBuffer;
use crate::params::{SampleEncoding, SoundParams};

/// How many bytes a [`BufferSource`] pulls from the ring at a time.
const SOURCE_CHUNK: usize = 4096;

/// The playback side the decode loop talks to.
///
/// [`AudioDevice`] implements this against real hardware; tests substitute
/// their own.
pub trait AudioOutput: Send + Sync {
    /// (Re)opens the output for the given parameters.
    ///
    /// Opening with the parameters already playing keeps the current stream
    /// untouched.
    ///
    /// # Errors
    ///
    /// Returns error if the device cannot be opened or configured.
    fn open(&self, params: &SoundParams) -> Result<()>;

    /// Suspends playback without discarding anything.
    fn pause(&self);

    /// Resumes a paused output.
    fn resume(&self);
}

/// Iterator adapter turning ring bytes into `f32` samples for rodio.
///
/// An empty ring yields silence rather than ending the source; the sink
/// stays alive across track boundaries and buffer resets, and is replaced
/// only on a format change.
pub struct BufferSource {
    buf: Arc<OutputBuffer>,
    params: SoundParams,
    chunk: Vec<u8>,
    len: usize,
    pos: usize,
}

impl BufferSource {
    /// Creates a source draining `buf`, interpreting bytes per `params`.
    #[must_use]
    pub fn new(buf: Arc<OutputBuffer>, params: SoundParams) -> Self {
        Self {
            buf,
            params,
            chunk: vec![0; SOURCE_CHUNK],
            len: 0,
            pos: 0,
        }
    }

    fn decode_sample(&self, at: usize) -> f32 {
        let chunk = &self.chunk;
        match self.params.encoding {
            SampleEncoding::U8 => (f32::from(chunk[at]) - 128.0) / 128.0,
            SampleEncoding::S16Le => {
                f32::from(i16::from_le_bytes([chunk[at], chunk[at + 1]])) / 32_768.0
            }
            SampleEncoding::S24Le => {
                let raw =
                    i32::from_le_bytes([chunk[at], chunk[at + 1], chunk[at + 2], chunk[at + 3]]);
                #[expect(clippy::cast_precision_loss)]
                let sample = ((raw << 8) >> 8) as f32 / 8_388_608.0;
                sample
            }
            SampleEncoding::S32Le => {
                let raw =
                    i32::from_le_bytes([chunk[at], chunk[at + 1], chunk[at + 2], chunk[at + 3]]);
                #[expect(clippy::cast_precision_loss)]
                let sample = raw as f32 / 2_147_483_648.0;
                sample
            }
            SampleEncoding::F32Le => {
                f32::from_le_bytes([chunk[at], chunk[at + 1], chunk[at + 2], chunk[at + 3]])
            }
        }
    }
}

impl Iterator for BufferSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        let width = self.params.encoding.bytes_per_sample();
        if self.pos + width > self.len {
            // A ring read can end mid-sample; the tail bytes are already
            // out of the ring and must survive until the rest arrives.
            let leftover = self.len - self.pos;
            self.chunk.copy_within(self.pos..self.len, 0);
            self.pos = 0;
            self.len = leftover;

            self.len += self.buf.read(&mut self.chunk[leftover..]);
            if self.len < width {
                // Silence keeps the sink running while the ring is dry.
                return Some(0.0);
            }
        }

        let at = self.pos;
        self.pos += width;
        Some(self.decode_sample(at))
    }
}

impl rodio::Source for BufferSource {
    fn current_frame_len(&self) -> Option<usize> {
        None
    }

    fn channels(&self) -> u16 {
        self.params.channels
    }

    fn sample_rate(&self) -> u32 {
        self.params.rate
    }

    fn total_duration(&self) -> Option<Duration> {
        None
    }
}

enum DeviceCmd {
    Open(SoundParams, mpsc::SyncSender<Result<()>>),
    Pause,
    Resume,
    Close,
}

/// Real audio output backed by rodio/cpal.
///
/// A worker thread owns the (non-`Send`) output stream; this handle is
/// freely shareable.
pub struct AudioDevice {
    tx: mpsc::Sender<DeviceCmd>,
}

impl AudioDevice {
    /// Selects the output device described by `spec` and starts the worker.
    ///
    /// The spec has the form `[<host>][|<device>]` (case-insensitive); both
    /// fields are optional and default to the system's choices.
    ///
    /// # Errors
    ///
    /// Returns error if the host or device cannot be found or configured.
    pub fn new(spec: &str, out_buf: Arc<OutputBuffer>) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        let (ready_tx, ready_rx) = mpsc::sync_channel(1);

        let spec = spec.to_string();
        std::thread::Builder::new()
            .name("audio output".to_string())
            .spawn(move || device_worker(&spec, &out_buf, &rx, &ready_tx))
            .map_err(|e| Error::internal(format!("could not start audio thread: {e}")))?;

        ready_rx
            .recv()
            .map_err(|e| Error::internal(format!("audio thread died during setup: {e}")))??;
        Ok(Self { tx })
    }
}

impl AudioOutput for AudioDevice {
    fn open(&self, params: &SoundParams) -> Result<()> {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.tx
            .send(DeviceCmd::Open(*params, reply_tx))
            .map_err(|_| Error::unavailable("audio thread gone"))?;
        reply_rx
            .recv()
            .map_err(|_| Error::unavailable("audio thread gone"))?
    }

    fn pause(&self) {
        let _ = self.tx.send(DeviceCmd::Pause);
    }

    fn resume(&self) {
        let _ = self.tx.send(DeviceCmd::Resume);
    }
}

impl Drop for AudioDevice {
    fn drop(&mut self) {
        let _ = self.tx.send(DeviceCmd::Close);
    }
}

/// Resolves `[<host>][|<device>]` to a cpal device and a default output
/// configuration.
fn get_device(spec: &str) -> Result<(rodio::Device, rodio::SupportedStreamConfig)> {
    let mut components = spec.split('|');

    let host = match components.next() {
        Some("") | None => cpal::default_host(),
        Some(name) => {
            let host_ids = cpal::available_hosts();
            host_ids
                .into_iter()
                .find_map(|host_id| {
                    let host = cpal::host_from_id(host_id).ok()?;
                    if host.id().name().eq_ignore_ascii_case(name) {
                        Some(host)
                    } else {
                        None
                    }
                })
                .ok_or_else(|| Error::not_found(format!("audio host {name} not found")))?
        }
    };

    let device = match components.next() {
        Some("") | None => host.default_output_device().ok_or_else(|| {
            Error::not_found(format!(
                "default audio output device not found on {}",
                host.id().name()
            ))
        })?,
        Some(name) => {
            let mut devices = host.output_devices()?;
            devices
                .find(|device| device.name().is_ok_and(|n| n.eq_ignore_ascii_case(name)))
                .ok_or_else(|| {
                    Error::not_found(format!(
                        "audio output device {name} not found on {}",
                        host.id().name()
                    ))
                })?
        }
    };

    let config = device.default_output_config().map_err(|e| {
        Error::unavailable(format!("default output configuration unavailable: {e}"))
    })?;

    info!(
        "audio output device: {} on {}",
        device.name().as_deref().unwrap_or("UNKNOWN"),
        host.id().name()
    );

    Ok((device, config))
}

struct OpenOutput {
    // The stream must stay alive for playback; rodio stops when it drops.
    _stream: rodio::OutputStream,
    sink: rodio::Sink,
    params: SoundParams,
}

fn open_output(
    device: &rodio::Device,
    config: &rodio::SupportedStreamConfig,
    current: &mut Option<OpenOutput>,
    out_buf: &Arc<OutputBuffer>,
    params: SoundParams,
) -> Result<()> {
    // Same parameters: the playing source keeps draining the ring, which is
    // exactly the gapless handover case.
    if current.as_ref().is_some_and(|open| open.params == params) {
        debug!("audio output already open with {params}");
        return Ok(());
    }

    if let Some(open) = current.as_mut() {
        open.sink.append(BufferSource::new(Arc::clone(out_buf), params));
        open.sink.skip_one();
        open.sink.play();
        open.params = params;
        debug!("audio output reopened with {params}");
        return Ok(());
    }

    let (stream, handle) = rodio::OutputStream::try_from_device_config(device, config.clone())?;
    let sink = rodio::Sink::try_new(&handle)?;
    sink.append(BufferSource::new(Arc::clone(out_buf), params));
    sink.play();

    debug!("audio output opened with {params}");
    *current = Some(OpenOutput {
        _stream: stream,
        sink,
        params,
    });
    Ok(())
}

fn device_worker(
    spec: &str,
    out_buf: &Arc<OutputBuffer>,
    rx: &mpsc::Receiver<DeviceCmd>,
    ready_tx: &mpsc::SyncSender<Result<()>>,
) {
    let (device, config) = match get_device(spec) {
        Ok(selected) => {
            let _ = ready_tx.send(Ok(()));
            selected
        }
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    };

    let mut current: Option<OpenOutput> = None;
    while let Ok(cmd) = rx.recv() {
        match cmd {
            DeviceCmd::Open(params, reply) => {
                let result = open_output(&device, &config, &mut current, out_buf, params);
                let _ = reply.send(result);
            }
            DeviceCmd::Pause => {
                if let Some(open) = current.as_ref() {
                    open.sink.pause();
                }
            }
            DeviceCmd::Resume => {
                if let Some(open) = current.as_ref() {
                    open.sink.play();
                }
            }
            DeviceCmd::Close => break,
        }
    }

    debug!("closing audio output");
}

#[cfg(test)]
mod tests {
    use rodio::Source;

    use super::*;
    use crate::outbuf::PCM_BUF_SIZE;

    fn ring() -> Arc<OutputBuffer> {
        Arc::new(OutputBuffer::new(3 * PCM_BUF_SIZE))
    }

    #[test]
    fn source_reports_stream_parameters() {
        let params = SoundParams::new(SampleEncoding::F32Le, 48_000, 2);
        let source = BufferSource::new(ring(), params);
        assert_eq!(source.sample_rate(), 48_000);
        assert_eq!(source.channels(), 2);
        assert_eq!(source.total_duration(), None);
    }

    #[test]
    fn source_decodes_f32_bytes() {
        let buf = ring();
        let params = SoundParams::new(SampleEncoding::F32Le, 44_100, 1);

        let samples = [0.0f32, 0.5, -0.5, 1.0];
        let mut bytes = Vec::new();
        for sample in samples {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        buf.send(&bytes);

        let mut source = BufferSource::new(Arc::clone(&buf), params);
        for expected in samples {
            assert!((source.next().unwrap() - expected).abs() < f32::EPSILON);
        }
    }

    #[test]
    fn source_decodes_s16_bytes() {
        let buf = ring();
        let params = SoundParams::new(SampleEncoding::S16Le, 44_100, 1);

        let mut bytes = Vec::new();
        for sample in [0i16, i16::MAX, i16::MIN] {
            bytes.extend_from_slice(&sample.to_le_bytes());
        }
        buf.send(&bytes);

        let mut source = BufferSource::new(Arc::clone(&buf), params);
        assert!((source.next().unwrap() - 0.0).abs() < 1e-6);
        assert!((source.next().unwrap() - (f32::from(i16::MAX) / 32_768.0)).abs() < 1e-6);
        assert!((source.next().unwrap() - (-1.0)).abs() < 1e-6);
    }

    #[test]
    fn empty_ring_yields_silence() {
        let mut source = BufferSource::new(
            ring(),
            SoundParams::new(SampleEncoding::F32Le, 44_100, 2),
        );
        assert_eq!(source.next(), Some(0.0));
        assert_eq!(source.next(), Some(0.0));
    }

    #[test]
    fn sample_split_across_reads_is_carried_over() {
        let buf = ring();
        let params = SoundParams::new(SampleEncoding::S16Le, 44_100, 1);

        // One whole sample plus the first byte of the next.
        let first = 1_234_i16.to_le_bytes();
        let second = (-4_321_i16).to_le_bytes();
        buf.send(&[first[0], first[1], second[0]]);

        let mut source = BufferSource::new(Arc::clone(&buf), params);
        assert!((source.next().unwrap() - f32::from(1_234_i16) / 32_768.0).abs() < 1e-6);

        // The ring is dry mid-sample: silence, but the tail byte is kept.
        assert_eq!(source.next(), Some(0.0));

        // Once the rest arrives, the split sample comes out intact.
        buf.send(&[second[1]]);
        assert!((source.next().unwrap() - f32::from(-4_321_i16) / 32_768.0).abs() < 1e-6);
    }
}
