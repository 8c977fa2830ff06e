//! Playback engine configuration.
//!
//! A plain struct with sensible defaults, deserializable from a TOML file.
//! The binary overlays command-line flags on top; the library takes the
//! struct as-is.

use std::path::Path;

use serde::Deserialize;

use crate::error::Result;

/// Default preference specs covering the bundled decoder plugins.
///
/// Each entry maps a filename extension or MIME type to an ordered plugin
/// list; `*` expands to the plugins not named explicitly.
const DEFAULT_PREFERRED_DECODERS: &[&str] = &[
    "flac(flac,*)",
    "ogg(vorbis,*)",
    "oga(vorbis,*)",
    "mp3(mpa,*)",
    "mp2(mpa,*)",
    "wav(wav,*)",
    "aac(aac)",
    "m4a(aac)",
    "audio/flac(flac)",
    "audio/ogg(vorbis)",
    "application/ogg(vorbis)",
    "audio/mpeg(mpa)",
    "audio/wav(wav,*)",
    "audio/aac(aac)",
    "audio/aacp(aac)",
];

/// Engine configuration.
#[derive(Clone, Debug, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    /// How much of a network stream to buffer before decoding, in KiB.
    pub prebuffering: usize,

    /// Whether playback advances to the next playlist item on its own.
    /// Also gates next-track precaching.
    pub autonext: bool,

    /// Whether to derive a MIME type from the file name when a MIME-typed
    /// decoder preference is consulted without a transport-reported type.
    pub use_mime_magic: bool,

    /// Ordered decoder preference specs, e.g. `"ogg(vorbis,*)"`.
    pub preferred_decoders: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            prebuffering: 32,
            autonext: true,
            use_mime_magic: false,
            preferred_decoders: DEFAULT_PREFERRED_DECODERS
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }
}

impl Config {
    /// Loads configuration from a TOML file.
    ///
    /// Missing keys fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }
}
