//! Symphonia-backed codec plugins.
//!
//! One decoder implementation covers every bundled format; the per-format
//! plugins differ only in which codecs and probes they register and which
//! extensions and MIME types they claim. Registering format-specific
//! handlers instead of the full default set keeps initialization fast and
//! probing unambiguous.
//!
//! # Error Handling
//!
//! The packet loop recovers where it can:
//! * Malformed or unreadable packets are skipped, up to 3 in a row, and
//!   surface as recoverable stream errors
//! * Codec reset requests rebuild the decoder and may change the reported
//!   sound parameters
//! * End of stream is reported as a zero-byte decode, never as an error

use std::io::Cursor;
use std::path::Path;

use symphonia::core::{
    audio::SampleBuffer,
    codecs::{CodecRegistry, DecoderOptions},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
    io::{MediaSource, MediaSourceStream, MediaSourceStreamOptions, ReadOnlySource},
    meta::MetadataOptions,
    probe::{Hint, Probe},
    units::{Time, TimeBase},
};
use symphonia::default::{
    codecs::{AacDecoder, FlacDecoder, MpaDecoder, PcmDecoder, VorbisDecoder},
    formats::{AdtsReader, FlacReader, IsoMp4Reader, MpaReader, OggReader, WavReader},
};

use crate::decoder::registry::split_mime;
use crate::decoder::{Codec, Decoded, Decoder, DecoderError, Severity};
use crate::error::{Error, Result};
use crate::io::{IoStream, BUFFER_LEN};
use crate::params::{SampleEncoding, SoundParams};

/// Maximum number of consecutive corrupted packets to skip before giving up.
const MAX_RETRIES: usize = 3;

/// How much content a plugin peeks when sniffing a stream.
const SNIFF_LEN: usize = 8 * 1024;

/// One format family: a plugin name plus what it claims and registers.
struct Family {
    name: &'static str,
    extensions: &'static [&'static str],
    mimes: &'static [&'static str],
    register: fn(&mut CodecRegistry, &mut Probe),
}

static FLAC: Family = Family {
    name: "flac",
    extensions: &["flac"],
    mimes: &["audio/flac"],
    register: |codecs, probe| {
        codecs.register_all::<FlacDecoder>();
        probe.register_all::<FlacReader>();
    },
};

static VORBIS: Family = Family {
    name: "vorbis",
    extensions: &["ogg", "oga"],
    mimes: &["audio/ogg", "application/ogg", "audio/vorbis"],
    register: |codecs, probe| {
        codecs.register_all::<VorbisDecoder>();
        probe.register_all::<OggReader>();
    },
};

static MPA: Family = Family {
    name: "mpa",
    extensions: &["mp3", "mp2", "mpga"],
    mimes: &["audio/mpeg", "audio/mp3", "audio/mpa"],
    register: |codecs, probe| {
        codecs.register_all::<MpaDecoder>();
        probe.register_all::<MpaReader>();
    },
};

static WAV: Family = Family {
    name: "wav",
    extensions: &["wav", "wave"],
    mimes: &["audio/wav", "audio/wave", "audio/vnd.wave"],
    register: |codecs, probe| {
        codecs.register_all::<PcmDecoder>();
        probe.register_all::<WavReader>();
    },
};

static AAC: Family = Family {
    name: "aac",
    extensions: &["aac", "m4a", "mp4"],
    mimes: &["audio/aac", "audio/aacp", "audio/mp4", "audio/m4a"],
    register: |codecs, probe| {
        codecs.register_all::<AacDecoder>();
        probe.register_all::<AdtsReader>();
        probe.register_all::<IsoMp4Reader>();
    },
};

/// FLAC plugin factory.
#[must_use]
pub fn flac_plugin() -> Box<dyn Codec> {
    Box::new(SymphoniaCodec { family: &FLAC })
}

/// Ogg Vorbis plugin factory.
#[must_use]
pub fn vorbis_plugin() -> Box<dyn Codec> {
    Box::new(SymphoniaCodec { family: &VORBIS })
}

/// MPEG audio plugin factory.
#[must_use]
pub fn mpa_plugin() -> Box<dyn Codec> {
    Box::new(SymphoniaCodec { family: &MPA })
}

/// WAV/PCM plugin factory.
#[must_use]
pub fn wav_plugin() -> Box<dyn Codec> {
    Box::new(SymphoniaCodec { family: &WAV })
}

/// AAC (ADTS and MP4) plugin factory.
#[must_use]
pub fn aac_plugin() -> Box<dyn Codec> {
    Box::new(SymphoniaCodec { family: &AAC })
}

/// Codec backend for one Symphonia format family.
pub struct SymphoniaCodec {
    family: &'static Family,
}

impl SymphoniaCodec {
    fn media_stream(source: Box<dyn MediaSource>) -> MediaSourceStream {
        // Twice the read buffer to allow for Symphonia's read-ahead, and
        // the 64 kB minimum that Symphonia asserts for its ring buffer.
        let buffer_len = usize::max(64 * 1024, BUFFER_LEN * 2);
        MediaSourceStream::new(source, MediaSourceStreamOptions { buffer_len })
    }
}

impl Codec for SymphoniaCodec {
    fn name(&self) -> &'static str {
        self.family.name
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Decoder>> {
        let stream = IoStream::open_file(path, true)?;
        let byte_len = stream.byte_len();

        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|ext| ext.to_str()) {
            hint.with_extension(ext);
        }

        let stream = Self::media_stream(Box::new(stream));
        let decoder = SymphoniaDecoder::new(stream, &hint, self.family, byte_len)?;
        Ok(Box::new(decoder))
    }

    fn open_stream(&self, stream: IoStream) -> Result<Box<dyn Decoder>> {
        let byte_len = stream.byte_len();

        let mut hint = Hint::new();
        if let Some(mime) = stream.mime_type() {
            hint.mime_type(mime);
        }

        let stream = Self::media_stream(Box::new(stream));
        let decoder = SymphoniaDecoder::new(stream, &hint, self.family, byte_len)?;
        Ok(Box::new(decoder))
    }

    fn handles_ext(&self, ext: &str) -> bool {
        self.family
            .extensions
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(ext))
    }

    fn handles_mime(&self, mime: &str) -> bool {
        let Some((typ, subtype)) = split_mime(mime) else {
            return false;
        };
        self.family.mimes.iter().any(|candidate| {
            split_mime(candidate).is_some_and(|(ctyp, csub)| {
                ctyp.eq_ignore_ascii_case(typ) && csub.eq_ignore_ascii_case(subtype)
            })
        })
    }

    fn can_decode(&self, stream: &IoStream) -> bool {
        let Ok(peeked) = stream.peek(SNIFF_LEN) else {
            return false;
        };
        if peeked.len() < 512 {
            return false;
        }

        let mut codecs = CodecRegistry::default();
        let mut probe = Probe::default();
        (self.family.register)(&mut codecs, &mut probe);

        let source = ReadOnlySource::new(Cursor::new(peeked));
        let stream = Self::media_stream(Box::new(source));
        probe
            .format(
                &Hint::new(),
                stream,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .is_ok()
    }
}

/// Running decoder over a Symphonia demuxer/decoder pair.
///
/// Emits interleaved little-endian `f32` PCM regardless of the source
/// format.
struct SymphoniaDecoder {
    /// Format reader (demuxer) extracting encoded packets.
    demuxer: Box<dyn FormatReader>,

    /// Codec decoder turning packets into PCM samples.
    decoder: Box<dyn symphonia::core::codecs::Decoder>,

    /// Reusable sample buffer; `consumed` samples of it are already out.
    sample_buf: Option<SampleBuffer<f32>>,
    consumed: usize,

    /// Parameters of the samples currently in `sample_buf`.
    buf_params: SoundParams,

    /// Pending error, reported once through `take_error`.
    error: DecoderError,

    eof: bool,
    seek_mode: SeekMode,
    time_base: Option<TimeBase>,
    n_frames: Option<u64>,
    byte_len: Option<u64>,

    /// Instantaneous bitrate of the last decoded packet, in kbps.
    kbps: Option<u32>,
}

impl SymphoniaDecoder {
    fn new(
        stream: MediaSourceStream,
        hint: &Hint,
        family: &'static Family,
        byte_len: Option<u64>,
    ) -> Result<Self> {
        let mut codecs = CodecRegistry::default();
        let mut probe = Probe::default();
        (family.register)(&mut codecs, &mut probe);

        let demuxer = probe
            .format(
                hint,
                stream,
                &FormatOptions {
                    enable_gapless: true,
                    ..Default::default()
                },
                &MetadataOptions::default(),
            )?
            .format;
        let track = demuxer
            .default_track()
            .ok_or_else(|| Error::not_found("default track not found"))?;

        let codec_params = &track.codec_params;
        let decoder = codecs.make(codec_params, &DecoderOptions::default())?;

        // Read the parameters back from the decoder; initialization may
        // have filled in fields the probe left empty.
        let codec_params = decoder.codec_params();
        let time_base = codec_params.time_base;
        let n_frames = codec_params.n_frames;

        Ok(Self {
            demuxer,
            decoder,
            sample_buf: None,
            consumed: 0,
            buf_params: SoundParams::default(),
            error: DecoderError::default(),
            eof: false,
            // Accurate seeking is required without CBR knowledge; coarse
            // seeking is also unreliable for VBR streams.
            seek_mode: SeekMode::Accurate,
            time_base,
            n_frames,
            byte_len,
            kbps: None,
        })
    }

    /// Recomputes the cached stream properties after a codec reset.
    fn reload_spec(&mut self) {
        let codec_params = self.decoder.codec_params();
        self.time_base = codec_params.time_base;
        self.n_frames = codec_params.n_frames;

        // Drop the buffer to force reinitialization with the new spec.
        self.sample_buf = None;
        self.consumed = 0;
    }

    /// Records a recoverable error; an earlier pending one wins so the
    /// first cause is what gets reported.
    fn note_stream_error(&mut self, message: String) {
        if self.error.is_ok() {
            self.error = DecoderError::stream(message);
        }
    }

    /// Decodes packets until fresh samples land in `sample_buf`.
    ///
    /// Returns `false` at end of stream or on a fatal error (recorded in
    /// `self.error`).
    fn next_packet(&mut self) -> bool {
        let mut discarded = 0;
        loop {
            if discarded > MAX_RETRIES {
                self.error = DecoderError::fatal("discarded too many packets, giving up");
                return false;
            }

            let packet = match self.demuxer.next_packet() {
                Ok(packet) => packet,

                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    self.eof = true;
                    return false;
                }

                // The track list must be re-examined and the decoder
                // re-created.
                Err(SymphoniaError::ResetRequired) => {
                    trace!("re-creating decoder");
                    let Some(track) = self.demuxer.default_track() else {
                        self.error = DecoderError::fatal("default track not found after reset");
                        return false;
                    };
                    match symphonia::default::get_codecs()
                        .make(&track.codec_params, &DecoderOptions::default())
                    {
                        Ok(decoder) => {
                            self.decoder = decoder;
                            self.reload_spec();
                            continue;
                        }
                        Err(e) => {
                            self.error = DecoderError::fatal(e.to_string());
                            return false;
                        }
                    }
                }

                Err(e) => {
                    self.error = DecoderError::fatal(e.to_string());
                    return false;
                }
            };

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    #[expect(clippy::cast_possible_truncation)]
                    let params = SoundParams::new(
                        SampleEncoding::F32Le,
                        spec.rate,
                        spec.channels.count() as u16,
                    );

                    let needed = decoded.capacity() * spec.channels.count();
                    let fits = self
                        .sample_buf
                        .as_ref()
                        .is_some_and(|buf| buf.capacity() >= needed);
                    if !fits || params != self.buf_params {
                        self.sample_buf =
                            Some(SampleBuffer::new(decoded.capacity() as u64, spec));
                    }
                    if let Some(buf) = self.sample_buf.as_mut() {
                        buf.copy_interleaved_ref(decoded);
                    }
                    self.consumed = 0;
                    self.buf_params = params;

                    // Instantaneous bitrate from the packet's compressed
                    // size over its decoded duration.
                    if let Some(time_base) = self.time_base {
                        let time = time_base.calc_time(packet.dur());
                        #[expect(clippy::cast_precision_loss)]
                        let seconds = time.seconds as f64 + time.frac;
                        if seconds > 0.0 {
                            #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                            let kbps =
                                (packet.data.len() as f64 * 8.0 / seconds / 1000.0).round() as u32;
                            self.kbps = Some(kbps);
                        }
                    }
                    return true;
                }

                // The packet is undecodeable and should be discarded;
                // decoding continues with the next one.
                Err(SymphoniaError::DecodeError(e)) => {
                    self.note_stream_error(format!("discarding malformed packet: {e}"));
                    discarded += 1;
                }
                Err(SymphoniaError::IoError(e)) => {
                    self.note_stream_error(format!("discarding unreadable packet: {e}"));
                    discarded += 1;
                }

                // Consumers should expect the spec of the decoded audio to
                // change after a reset.
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    self.reload_spec();
                }

                Err(e) => {
                    self.error = DecoderError::fatal(e.to_string());
                    return false;
                }
            }
        }
    }
}

impl Decoder for SymphoniaDecoder {
    fn decode(&mut self, dst: &mut [u8]) -> Decoded {
        const SAMPLE_BYTES: usize = 4;

        let mut written = 0;
        let mut out_params = self.buf_params;

        loop {
            // Drain whatever the sample buffer still holds.
            if let Some(buf) = self.sample_buf.as_ref() {
                let samples = buf.samples();
                if self.consumed < samples.len() {
                    if written == 0 {
                        out_params = self.buf_params;
                    } else if self.buf_params != out_params {
                        // A burst never mixes parameter sets; the rest
                        // waits for the next call.
                        break;
                    }

                    let space = (dst.len() - written) / SAMPLE_BYTES;
                    if space == 0 {
                        break;
                    }
                    let n = space.min(samples.len() - self.consumed);
                    for (i, sample) in samples[self.consumed..self.consumed + n]
                        .iter()
                        .enumerate()
                    {
                        let at = written + i * SAMPLE_BYTES;
                        dst[at..at + SAMPLE_BYTES].copy_from_slice(&sample.to_le_bytes());
                    }
                    self.consumed += n;
                    written += n * SAMPLE_BYTES;
                    continue;
                }
            }

            if self.eof || self.error.severity == Severity::Fatal {
                break;
            }
            if !self.next_packet() {
                break;
            }
        }

        Decoded {
            bytes: written,
            params: out_params,
        }
    }

    fn take_error(&mut self) -> DecoderError {
        std::mem::take(&mut self.error)
    }

    fn seek(&mut self, seconds: u32) -> Option<u32> {
        let result = self.demuxer.seek(
            self.seek_mode,
            SeekTo::Time {
                track_id: None, // implies the default or first track
                time: Time::new(u64::from(seconds), 0.0),
            },
        );

        match result {
            Ok(seeked) => {
                // Seeking is a demuxer operation; reset the decoder to
                // avoid glitches from stale state.
                self.decoder.reset();
                self.sample_buf = None;
                self.consumed = 0;
                self.eof = false;

                #[expect(clippy::cast_possible_truncation)]
                let effective = self
                    .time_base
                    .map_or(seconds, |tb| tb.calc_time(seeked.actual_ts).seconds as u32);
                Some(effective)
            }
            Err(e) => {
                debug!("seek to {seconds} failed: {e}");
                None
            }
        }
    }

    fn duration(&self) -> Option<u32> {
        let (time_base, n_frames) = (self.time_base?, self.n_frames?);
        #[expect(clippy::cast_possible_truncation)]
        let seconds = time_base.calc_time(n_frames).seconds as u32;
        Some(seconds)
    }

    fn bitrate(&self) -> Option<u32> {
        self.kbps
    }

    fn avg_bitrate(&self) -> Option<u32> {
        let byte_len = self.byte_len?;
        let duration = u64::from(self.duration()?);
        if duration == 0 {
            return None;
        }
        #[expect(clippy::cast_possible_truncation)]
        let kbps = (byte_len * 8 / duration / 1000) as u32;
        Some(kbps)
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    /// Builds a minimal 16-bit PCM WAV file.
    fn wav_bytes(rate: u32, channels: u16, frames: usize) -> Vec<u8> {
        let data_len = frames * usize::from(channels) * 2;
        let byte_rate = rate * u32::from(channels) * 2;
        let mut out = Vec::with_capacity(44 + data_len);

        out.extend_from_slice(b"RIFF");
        out.extend_from_slice(&(36 + data_len as u32).to_le_bytes());
        out.extend_from_slice(b"WAVE");
        out.extend_from_slice(b"fmt ");
        out.extend_from_slice(&16u32.to_le_bytes());
        out.extend_from_slice(&1u16.to_le_bytes()); // PCM
        out.extend_from_slice(&channels.to_le_bytes());
        out.extend_from_slice(&rate.to_le_bytes());
        out.extend_from_slice(&byte_rate.to_le_bytes());
        out.extend_from_slice(&(channels * 2).to_le_bytes());
        out.extend_from_slice(&16u16.to_le_bytes());
        out.extend_from_slice(b"data");
        out.extend_from_slice(&(data_len as u32).to_le_bytes());
        for i in 0..frames * usize::from(channels) {
            let sample = ((i % 97) as i16).wrapping_mul(257);
            out.extend_from_slice(&sample.to_le_bytes());
        }
        out
    }

    fn wav_file(rate: u32, channels: u16, frames: usize) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".wav").tempfile().unwrap();
        file.write_all(&wav_bytes(rate, channels, frames)).unwrap();
        file.flush().unwrap();
        file
    }

    #[test]
    fn plugin_claims_extensions_and_mimes() {
        let plugin = wav_plugin();
        assert_eq!(plugin.name(), "wav");
        assert!(plugin.handles_ext("wav"));
        assert!(plugin.handles_ext("WAV"));
        assert!(!plugin.handles_ext("flac"));
        assert!(plugin.handles_mime("audio/wav"));
        assert!(plugin.handles_mime("audio/x-wav; rate=44100"));
        assert!(!plugin.handles_mime("audio/flac"));
    }

    #[test]
    fn decodes_wav_to_f32_pcm() {
        let file = wav_file(8_000, 2, 8_000);
        let plugin = wav_plugin();
        let mut decoder = plugin.open(file.path()).unwrap();

        let mut dst = vec![0u8; 4096];
        let first = decoder.decode(&mut dst);
        assert!(first.bytes > 0);
        assert_eq!(first.bytes % 4, 0);
        assert_eq!(
            first.params,
            SoundParams::new(SampleEncoding::F32Le, 8_000, 2)
        );
        assert!(decoder.take_error().is_ok());

        // One second of stereo 16-bit input becomes one second of f32:
        // keep decoding to EOF and count.
        let mut total = first.bytes;
        loop {
            let step = decoder.decode(&mut dst);
            if step.bytes == 0 {
                break;
            }
            total += step.bytes;
        }
        assert_eq!(total, 8_000 * 2 * 4);
        assert_eq!(decoder.duration(), Some(1));
    }

    #[test]
    fn seek_reports_effective_position() {
        let file = wav_file(8_000, 1, 4 * 8_000);
        let plugin = wav_plugin();
        let mut decoder = plugin.open(file.path()).unwrap();

        assert_eq!(decoder.duration(), Some(4));
        let effective = decoder.seek(2).unwrap();
        assert_eq!(effective, 2);

        // Decoding resumes and reaches EOF after roughly the remainder.
        let mut dst = vec![0u8; 64 * 1024];
        let mut total = 0;
        loop {
            let step = decoder.decode(&mut dst);
            if step.bytes == 0 {
                break;
            }
            total += step.bytes;
        }
        assert_eq!(total, 2 * 8_000 * 4);
    }

    #[test]
    fn sniffs_wav_content() {
        let data = wav_bytes(8_000, 1, 8_000);
        let stream = IoStream::from_parts(
            Box::new(Cursor::new(data)),
            None,
            None,
            true,
            "anon".to_string(),
        );

        assert!(wav_plugin().can_decode(&stream));
        assert!(!flac_plugin().can_decode(&stream));
    }

    #[test]
    fn open_missing_file_fails() {
        let plugin = wav_plugin();
        assert!(plugin.open(Path::new("/nonexistent/a.wav")).is_err());
    }
}
