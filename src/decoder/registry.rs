//! Decoder registry and dispatch.
//!
//! Backends are registered once at startup, in a fixed order that doubles
//! as the default lookup order. Users can override lookup per filename
//! extension or MIME type with preference specs like `"ogg(vorbis,*)"` or
//! `"audio/flac(flac)"`: the parenthesized names are tried first, and a `*`
//! stands for every plugin not named explicitly, in registration order.
//!
//! Dispatch runs in three tiers: the preference table, a default list of
//! all plugins (MIME before extension), and content sniffing for streams
//! whose name tells nothing.

use std::path::Path;

use crate::decoder::Codec;
use crate::io::IoStream;

/// Minimum peeked bytes for content-based dispatch; with less than this,
/// probing would fail in every backend anyway.
const MIN_SNIFF_LEN: usize = 512;

/// How much content to peek when sniffing a stream.
const SNIFF_LEN: usize = 8 * 1024;

/// Splits a MIME string into `(type, subtype)`, normalizing the subtype:
/// an `x-` prefix is stripped and parameters after `;` are cut.
///
/// Returns `None` when there is no `/`.
pub(crate) fn split_mime(mime: &str) -> Option<(&str, &str)> {
    let (typ, mut subtype) = mime.split_once('/')?;
    if subtype.len() >= 2 && subtype[..2].eq_ignore_ascii_case("x-") {
        subtype = &subtype[2..];
    }
    if let Some((cut, _params)) = subtype.split_once(';') {
        subtype = cut;
    }
    Some((typ, subtype.trim()))
}

/// Lowercased extension of a path, without the dot.
fn ext_of(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
}

/// One parsed preference: a filename extension or MIME type mapped to an
/// ordered list of plugin indices.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct DecoderPreference {
    /// Filename extension, or MIME type when `subtype` is set.
    typ: String,
    /// MIME subtype; `None` marks an extension preference.
    subtype: Option<String>,
    /// Plugin indices to try, in order.
    decoders: Vec<usize>,
}

impl DecoderPreference {
    /// Parses a spec like `"ogg(vorbis,*,ffmpeg)"` against the registered
    /// plugins. Unknown names and duplicates are dropped (first occurrence
    /// wins); the first `*` expands once, at its position, to all plugins
    /// not named explicitly anywhere in the list.
    ///
    /// Returns `None` for specs without a key.
    fn parse(spec: &str, plugins: &[Box<dyn Codec>]) -> Option<Self> {
        let mut tokens = spec.split(['(', ',', ')']).map(str::trim);
        let key = tokens.next().filter(|key| !key.is_empty())?;

        let (typ, subtype) = match split_mime(key) {
            Some((typ, subtype)) => (typ.to_string(), Some(subtype.to_string())),
            None => (key.to_string(), None),
        };

        let mut decoders = Vec::new();
        let mut asterisk_at = None;
        for name in tokens.filter(|name| !name.is_empty()) {
            if name == "*" {
                if asterisk_at.is_none() {
                    asterisk_at = Some(decoders.len());
                }
                continue;
            }

            let Some(index) = plugins
                .iter()
                .position(|plugin| plugin.name().eq_ignore_ascii_case(name))
            else {
                warn!("unknown decoder {name} in preference {spec}");
                continue;
            };
            if !decoders.contains(&index) {
                decoders.push(index);
            }
        }

        if let Some(mut at) = asterisk_at {
            for index in 0..plugins.len() {
                if !decoders.contains(&index) {
                    decoders.insert(at, index);
                    at += 1;
                }
            }
        }

        Some(Self {
            typ,
            subtype,
            decoders,
        })
    }
}

/// Process-wide table of codec backends plus the user's lookup preferences.
#[derive(Default)]
pub struct Registry {
    plugins: Vec<Box<dyn Codec>>,
    preferences: Vec<DecoderPreference>,
    use_mime_magic: bool,
}

impl Registry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a registry with all bundled backends registered.
    #[must_use]
    pub fn with_builtin_plugins() -> Self {
        use crate::decoder::symphonia::{
            aac_plugin, flac_plugin, mpa_plugin, vorbis_plugin, wav_plugin,
        };

        let mut registry = Self::new();
        crate::register_plugins!(registry, flac_plugin, vorbis_plugin, mpa_plugin, wav_plugin, aac_plugin);
        registry
    }

    /// Registers a backend. Registration order defines the default lookup
    /// order and the expansion order of `*` in preferences.
    pub fn register(&mut self, plugin: Box<dyn Codec>) {
        debug!("registered decoder {}", plugin.name());
        self.plugins.push(plugin);
    }

    /// Enables deriving a MIME type from the file name when dispatching on
    /// a MIME preference without a transport-reported type.
    pub fn set_mime_magic(&mut self, enabled: bool) {
        self.use_mime_magic = enabled;
    }

    /// Parses and installs preference specs, replacing any prior ones.
    pub fn set_preferences<S: AsRef<str>>(&mut self, specs: &[S]) {
        self.preferences = specs
            .iter()
            .filter_map(|spec| DecoderPreference::parse(spec.as_ref(), &self.plugins))
            .collect();
    }

    /// Registered plugin names, in registration order.
    #[must_use]
    pub fn plugin_names(&self) -> Vec<&'static str> {
        self.plugins.iter().map(|plugin| plugin.name()).collect()
    }

    fn find_extn_decoder(&self, decoders: &[usize], ext: &str) -> Option<&dyn Codec> {
        decoders
            .iter()
            .map(|&index| self.plugins[index].as_ref())
            .find(|plugin| plugin.handles_ext(ext))
    }

    fn find_mime_decoder(&self, decoders: &[usize], mime: &str) -> Option<&dyn Codec> {
        decoders
            .iter()
            .map(|&index| self.plugins[index].as_ref())
            .find(|plugin| plugin.handles_mime(mime))
    }

    /// Resolves a backend for a path and/or MIME type.
    ///
    /// Preferences are consulted in order; the first whose key matches
    /// decides (even when none of its plugins accepts). Without a matching
    /// preference, all plugins are tried in registration order, MIME first
    /// when one is available, then extension.
    #[must_use]
    pub fn find_decoder(&self, path: Option<&Path>, mime: Option<&str>) -> Option<&dyn Codec> {
        let ext = path.and_then(ext_of);
        let all: Vec<usize> = (0..self.plugins.len()).collect();

        // The MIME string a subtype preference dispatches on: the reported
        // one, or one derived from the file name if MIME magic is on.
        // Computed at most once.
        let mut derived: Option<Option<String>> = None;

        for pref in &self.preferences {
            match &pref.subtype {
                None => {
                    let Some(ext) = ext.as_deref() else { continue };
                    if !pref.typ.eq_ignore_ascii_case(ext) {
                        continue;
                    }
                    return self.find_extn_decoder(&pref.decoders, ext);
                }
                Some(pref_subtype) => {
                    let mime = derived
                        .get_or_insert_with(|| {
                            if let Some(mime) = mime {
                                Some(mime.to_string())
                            } else if self.use_mime_magic {
                                path.and_then(|path| {
                                    mime_guess::from_path(path).first().map(|m| m.to_string())
                                })
                            } else {
                                None
                            }
                        })
                        .clone();
                    let Some(mime) = mime else { continue };
                    let Some((typ, subtype)) = split_mime(&mime) else {
                        continue;
                    };
                    if !pref.typ.eq_ignore_ascii_case(typ)
                        || !pref_subtype.eq_ignore_ascii_case(subtype)
                    {
                        continue;
                    }
                    return self.find_mime_decoder(&pref.decoders, &mime);
                }
            }
        }

        let mut decoder = None;
        if let Some(mime) = mime {
            decoder = self.find_mime_decoder(&all, mime);
        }
        if decoder.is_none() {
            if let Some(ext) = ext.as_deref() {
                decoder = self.find_extn_decoder(&all, ext);
            }
        }
        decoder
    }

    /// Resolves a backend for a local file by name.
    #[must_use]
    pub fn get_decoder(&self, file: &str) -> Option<&dyn Codec> {
        self.find_decoder(Some(Path::new(file)), None)
    }

    /// Whether any backend claims files with this name.
    #[must_use]
    pub fn is_sound_file(&self, file: &str) -> bool {
        self.get_decoder(file).is_some()
    }

    /// Resolves a backend for a connected stream by its content.
    ///
    /// Peeks at the stream start; gives up when less than 512 bytes are
    /// available since every backend would just report an error. Tries the
    /// transport MIME type first, then lets each plugin sniff.
    #[must_use]
    pub fn get_decoder_by_content(&self, stream: &IoStream) -> Option<&dyn Codec> {
        debug!("testing the stream");
        let peeked = match stream.peek(SNIFF_LEN) {
            Ok(peeked) => peeked,
            Err(e) => {
                error!("stream error: {e}");
                return None;
            }
        };
        if peeked.len() < MIN_SNIFF_LEN {
            info!("stream too short to identify");
            return None;
        }

        if let Some(mime) = stream.mime_type() {
            if let Some(decoder) = self.find_decoder(None, Some(mime)) {
                debug!("found decoder for MIME type {mime}");
                return Some(decoder);
            }
        } else {
            debug!("no MIME type");
        }

        for plugin in &self.plugins {
            if plugin.can_decode(stream) {
                debug!("found decoder for stream: {}", plugin.name());
                return Some(plugin.as_ref());
            }
        }

        error!("format not supported");
        None
    }
}
