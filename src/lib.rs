//! Audio playback engine for a console music player.
//!
//! **tremolo** is the server-side subsystem that turns a sequence of audio
//! files or network streams into one continuous PCM stream, while answering
//! seek, stop and pause commands promptly and prefetching the next track
//! for gapless playback.
//!
//! # Architecture
//!
//! * **Decoding**
//!   - [`decoder`]: plugin trait, registry with extension/MIME/content
//!     dispatch, and the bundled Symphonia backends
//!   - [`io`]: uniform byte source for files and URLs with peek, prebuffer
//!     and abort
//! * **Pipeline**
//!   - [`outbuf`]: bounded PCM ring with time cursor and free callback
//!   - [`player`]: the session owning the decode loop and the request API
//!   - [`precache`]: background decode of the next track
//!   - [`device`]: rodio-backed output draining the ring
//! * **Reporting**
//!   - [`bitrate`]: per-position bitrate log so the UI matches what is
//!     audible
//!   - [`events`]: playback-state events for the protocol layer
//! * **Support**
//!   - [`config`]: engine options
//!   - [`error`]: error types and handling
//!   - [`params`]: PCM sound parameters
//!   - [`signal`]: shutdown signals for the binary
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use tremolo::{
//!     config::Config, decoder::registry::Registry, device::AudioDevice,
//!     events::EventSink, outbuf::{OutputBuffer, PCM_BUF_SIZE},
//!     player::PlayerSession,
//! };
//!
//! fn example() -> tremolo::error::Result<()> {
//!     let registry = Arc::new(Registry::with_builtin_plugins());
//!     let out_buf = Arc::new(OutputBuffer::new(4 * PCM_BUF_SIZE));
//!     let device = Arc::new(AudioDevice::new("", Arc::clone(&out_buf))?);
//!
//!     let session = PlayerSession::new(
//!         registry,
//!         device,
//!         out_buf,
//!         Config::default(),
//!         EventSink::none(),
//!     );
//!     session.play("first.flac", Some("second.flac"));
//!     Ok(())
//! }
//! ```
//!
//! # Concurrency
//!
//! The decode loop is synchronous and belongs on a blocking thread (e.g.
//! `tokio::task::spawn_blocking`); request methods are thread-safe and may
//! be called from any task. Events are delivered over an unbounded channel
//! and never block playback.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![doc(test(attr(ignore)))]

#[macro_use]
extern crate log;

pub mod bitrate;
pub mod config;
pub mod decoder;
pub mod device;
pub mod error;
pub mod events;
pub mod io;
pub mod outbuf;
pub mod params;
pub mod player;
pub mod precache;
pub mod signal;
