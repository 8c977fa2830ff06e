//! Decoder plugin interface and registry.
//!
//! Every codec backend implements [`Codec`], the process-wide capability
//! surface: it answers which extensions and MIME types it handles, can sniff
//! raw stream content, and opens files or streams into running [`Decoder`]
//! instances. The [`registry`] module resolves a backend for a given input,
//! honoring user-configured preferences; [`symphonia`] provides the bundled
//! backends.
//!
//! Optional capabilities are default trait methods: a backend that cannot
//! decode network streams simply keeps the default [`Codec::open_stream`],
//! mirroring an absent function in a plugin vtable.

pub mod registry;
pub mod symphonia;

use std::path::Path;

use crate::error::{Error, Result};
use crate::io::IoStream;
use crate::params::SoundParams;

/// How severe a decoder error is.
#[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
pub enum Severity {
    /// No error.
    #[default]
    Ok,
    /// Recoverable stream damage; the track keeps playing.
    Stream,
    /// Unrecoverable; the decoder is done.
    Fatal,
}

/// An error observed while decoding, with an owned message.
///
/// The default value is [`Severity::Ok`] with an empty message.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct DecoderError {
    /// How severe the error is.
    pub severity: Severity,
    /// Human-readable description.
    pub message: String,
}

impl DecoderError {
    /// A recoverable stream error.
    #[must_use]
    pub fn stream(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Stream,
            message: message.into(),
        }
    }

    /// An unrecoverable error.
    #[must_use]
    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            severity: Severity::Fatal,
            message: message.into(),
        }
    }

    /// Whether this represents no error at all.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        self.severity == Severity::Ok
    }
}

/// Outcome of one decode burst.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Decoded {
    /// Bytes written into the destination; 0 means end of stream.
    pub bytes: usize,
    /// Parameters of the written PCM. May differ between calls; the player
    /// handles mid-stream changes.
    pub params: SoundParams,
}

/// A running decoder instance producing raw PCM.
pub trait Decoder: Send {
    /// Decodes up to `dst.len()` bytes of PCM into `dst`.
    ///
    /// Returns how many bytes were written and their sound parameters. Zero
    /// bytes means end of stream. A call never mixes two parameter sets in
    /// one burst.
    fn decode(&mut self, dst: &mut [u8]) -> Decoded;

    /// Returns the pending error and resets it to [`Severity::Ok`].
    ///
    /// A [`Severity::Stream`] error accompanies data that was still decoded;
    /// the caller reports it once and keeps going. [`Severity::Fatal`] means
    /// the previous [`decode`](Self::decode) result was final.
    fn take_error(&mut self) -> DecoderError;

    /// Seeks to `seconds` from the start.
    ///
    /// Returns the effective position, or `None` if the decoder could not
    /// seek there. The player treats `None` at or past the duration as a
    /// snap to end of stream.
    fn seek(&mut self, seconds: u32) -> Option<u32>;

    /// Total duration in seconds, if known.
    fn duration(&self) -> Option<u32>;

    /// Instantaneous bitrate of the most recently decoded data, in kbps.
    fn bitrate(&self) -> Option<u32>;

    /// Average bitrate over the whole track, in kbps.
    fn avg_bitrate(&self) -> Option<u32>;
}

/// A codec backend: the process-wide, registrable half of a plugin.
pub trait Codec: Send + Sync {
    /// Compile-time plugin name used in preference lists.
    fn name(&self) -> &'static str;

    /// Opens a local file for decoding.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be opened or its format probed.
    fn open(&self, path: &Path) -> Result<Box<dyn Decoder>>;

    /// Opens an already-connected byte stream for decoding.
    ///
    /// The stream is lent by the player, which keeps its own handle for
    /// prebuffering and aborting.
    ///
    /// # Errors
    ///
    /// The default implementation reports the capability as missing.
    fn open_stream(&self, stream: IoStream) -> Result<Box<dyn Decoder>> {
        drop(stream);
        Err(Error::unimplemented(format!(
            "{} cannot decode streams",
            self.name()
        )))
    }

    /// Whether this backend handles files with the given extension.
    ///
    /// `ext` is passed lowercase, without the dot.
    fn handles_ext(&self, _ext: &str) -> bool {
        false
    }

    /// Whether this backend handles the given MIME type.
    ///
    /// `mime` is the full string as reported by the transport; backends
    /// normalize before comparing.
    fn handles_mime(&self, _mime: &str) -> bool {
        false
    }

    /// Whether this backend recognizes the stream by its content.
    ///
    /// Implementations peek; they must not consume.
    fn can_decode(&self, _stream: &IoStream) -> bool {
        false
    }
}

/// Registers the named plugins with a [`registry::Registry`], in order.
///
/// Each argument is a factory function `<name>_plugin()` exported by a
/// backend module:
///
/// ```ignore
/// let mut registry = Registry::new();
/// register_plugins!(registry, flac_plugin, vorbis_plugin, mpa_plugin);
/// ```
#[macro_export]
macro_rules! register_plugins {
    ($registry:expr, $($plugin:expr),+ $(,)?) => {
        $( $registry.register($plugin()); )+
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uninitialized_error_is_ok_and_empty() {
        let err = DecoderError::default();
        assert!(err.is_ok());
        assert!(err.message.is_empty());
    }

    #[test]
    fn severities() {
        assert!(!DecoderError::stream("hiccup").is_ok());
        assert_eq!(DecoderError::fatal("dead").severity, Severity::Fatal);
    }
}
