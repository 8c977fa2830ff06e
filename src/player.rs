//! Playback session and decode loop.
//!
//! A [`PlayerSession`] owns everything one playing server needs: the output
//! buffer, the live bitrate log, the precache slot, the request slot and the
//! handle used to abort a blocking stream read. The server holds exactly one
//! session; command handlers call the request methods from their own tasks
//! while [`play`](PlayerSession::play) runs the decode loop on a blocking
//! thread.
//!
//! # The decode loop
//!
//! Each iteration decodes one burst (when nothing is pending), waits when
//! the output buffer has no room, then acts on the latest request. Stop
//! latches and wins over everything; seek flushes the buffer and restarts
//! decoding at the new position; otherwise pending PCM is pushed out, a
//! format change is applied once the buffer drained, and a drained buffer at
//! end of stream ends the track.
//!
//! Displayed time comes from the output buffer's cursor via the free
//! callback, never from the decoder, which may be many seconds ahead.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use crate::bitrate::BitrateLog;
use crate::config::Config;
use crate::decoder::registry::Registry;
use crate::decoder::{Codec, Decoder, Severity};
use crate::device::AudioOutput;
use crate::events::{Event, EventSink, PlayState};
use crate::io::{is_url, AbortHandle, IoStream};
use crate::outbuf::{OutputBuffer, PCM_BUF_SIZE, PREBUFFER_THRESHOLD};
use crate::params::SoundParams;
use crate::precache::Precache;

/// A control request for the decode loop.
///
/// At most one request is pending; setting a new one overwrites the old,
/// except that a pending `Stop` latches until the loop consumes it.
#[derive(Copy, Clone, Debug, Default, Eq, Hash, PartialEq)]
pub enum PlayerRequest {
    /// Nothing requested.
    #[default]
    None,
    /// Seek to an absolute position in seconds.
    Seek(u32),
    /// Stop playback and discard buffered audio.
    Stop,
    /// Suspend the output device.
    Pause,
    /// Resume the output device.
    Unpause,
}

/// Single-slot, coalescing request channel with a condition the decode loop
/// waits on while the output buffer is full.
pub(crate) struct RequestSlot {
    slot: Mutex<PlayerRequest>,
    cond: Condvar,
}

impl RequestSlot {
    fn new() -> Self {
        Self {
            slot: Mutex::new(PlayerRequest::None),
            cond: Condvar::new(),
        }
    }

    /// Stores a request; last writer wins except that `Stop` latches.
    fn set(&self, request: PlayerRequest) {
        let mut slot = self.slot.lock().unwrap();
        if *slot != PlayerRequest::Stop || request == PlayerRequest::Stop {
            *slot = request;
        }
        self.cond.notify_all();
    }

    fn get(&self) -> PlayerRequest {
        *self.slot.lock().unwrap()
    }

    /// Clears the slot only if it still holds `observed`; a request that
    /// arrived in the meantime survives.
    fn clear_if(&self, observed: PlayerRequest) {
        let mut slot = self.slot.lock().unwrap();
        if *slot == observed {
            *slot = PlayerRequest::None;
        }
    }

    fn clear(&self) {
        *self.slot.lock().unwrap() = PlayerRequest::None;
    }

    /// Wakes the loop without changing the slot. Takes the lock so a wake
    /// cannot slip between the loop's state check and its wait.
    fn notify(&self) {
        let _slot = self.slot.lock().unwrap();
        self.cond.notify_all();
    }

    fn lock(&self) -> MutexGuard<'_, PlayerRequest> {
        self.slot.lock().unwrap()
    }

    fn wait<'a>(&self, guard: MutexGuard<'a, PlayerRequest>) -> MutexGuard<'a, PlayerRequest> {
        self.cond.wait(guard).unwrap()
    }
}

/// One playback session: the engine behind the server's audio commands.
pub struct PlayerSession {
    registry: Arc<Registry>,
    output: Arc<dyn AudioOutput>,
    out_buf: Arc<OutputBuffer>,
    events: EventSink,
    config: Config,

    requests: Arc<RequestSlot>,

    /// Abort handle of the stream feeding the running decoder, if any.
    /// Held so a stop request can interrupt a blocking read.
    decoder_stream: Mutex<Option<AbortHandle>>,

    /// Bitrate log of the currently playing track.
    bitrate: Arc<BitrateLog>,

    precache: Mutex<Precache>,

    /// Whether the loop is currently blocked prebuffering a stream.
    prebuffering: AtomicBool,
}

impl PlayerSession {
    /// Creates a session and installs its time-keeping callback on the
    /// output buffer.
    #[must_use]
    pub fn new(
        registry: Arc<Registry>,
        output: Arc<dyn AudioOutput>,
        out_buf: Arc<OutputBuffer>,
        config: Config,
        events: EventSink,
    ) -> Self {
        let requests = Arc::new(RequestSlot::new());
        let bitrate = Arc::new(BitrateLog::new());

        // Every time the device frees space: wake the decode loop, and
        // refresh the displayed time and bitrate when the second changed.
        {
            let requests = Arc::clone(&requests);
            let bitrate = Arc::clone(&bitrate);
            let events = events.clone();
            let last_time = AtomicU32::new(0);
            out_buf.set_free_callback(Box::new(move |time| {
                requests.notify();

                #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                let second = time as u32;
                if last_time.swap(second, Ordering::SeqCst) != second {
                    events.emit(Event::CurrentTime(second));
                    events.emit(Event::Bitrate(bitrate.get(second)));
                }
            }));
        }

        Self {
            registry,
            output,
            out_buf,
            events,
            config,
            requests,
            decoder_stream: Mutex::new(None),
            bitrate,
            precache: Mutex::new(Precache::new()),
            prebuffering: AtomicBool::new(false),
        }
    }

    /// The playback position the listener currently hears, in seconds.
    #[must_use]
    pub fn current_time(&self) -> u32 {
        #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let second = self.out_buf.time() as u32;
        second
    }

    /// Whether the loop is blocked filling a network stream's buffer.
    #[must_use]
    pub fn is_prebuffering(&self) -> bool {
        self.prebuffering.load(Ordering::SeqCst)
    }

    /// Requests playback stop. Also aborts the decoder's stream so a read
    /// blocked on the network unblocks.
    pub fn stop(&self) {
        debug!("requesting stop");
        self.requests.set(PlayerRequest::Stop);

        let stream = self.decoder_stream.lock().unwrap();
        if let Some(handle) = stream.as_ref() {
            debug!("decoder stream present, aborting");
            handle.abort();
        }
    }

    /// Requests a seek relative to the audible position.
    pub fn seek(&self, delta: i32) {
        let target = i64::from(self.current_time()) + i64::from(delta);
        #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let target = target.max(0) as u32;
        self.requests.set(PlayerRequest::Seek(target));
    }

    /// Requests a seek to an absolute position in seconds.
    pub fn jump_to(&self, seconds: u32) {
        self.requests.set(PlayerRequest::Seek(seconds));
    }

    /// Requests that the output device be paused.
    pub fn pause(&self) {
        self.requests.set(PlayerRequest::Pause);
    }

    /// Requests that the output device resume.
    pub fn unpause(&self) {
        self.requests.set(PlayerRequest::Unpause);
    }

    /// Discards any pending request.
    pub fn reset(&self) {
        self.requests.clear();
    }

    /// Plays one file or URL to completion, precaching `next_file` near the
    /// end when auto-advance is on.
    ///
    /// Blocks until the track finished, failed or was stopped; run it on a
    /// blocking thread. Outcomes surface as events.
    pub fn play(&self, file: &str, next_file: Option<&str>) {
        if is_url(file) {
            let stream = match IoStream::open(file, true, self.config.prebuffering) {
                Ok(stream) => stream,
                Err(e) => {
                    self.events.error(format!("could not open URL: {e}"));
                    self.events.emit(Event::AudioFail(file.to_string()));
                    return;
                }
            };
            *self.decoder_stream.lock().unwrap() = Some(stream.abort_handle());

            let Some(codec) = self.registry.get_decoder_by_content(&stream) else {
                *self.decoder_stream.lock().unwrap() = None;
                return;
            };

            self.prebuffering.store(true, Ordering::SeqCst);
            if let Err(e) = stream.prebuffer(self.config.prebuffering * 1024) {
                debug!("prebuffer interrupted: {e}");
            }
            self.prebuffering.store(false, Ordering::SeqCst);

            self.events.emit(Event::AudioStart);
            self.play_stream(codec, stream);
            self.events.emit(Event::AudioStop);
        } else {
            let Some(codec) = self.registry.get_decoder(file) else {
                self.events.error(format!("can't get decoder for {file}"));
                self.events.emit(Event::AudioFail(file.to_string()));
                return;
            };
            *self.decoder_stream.lock().unwrap() = None;

            self.events.emit(Event::AudioStart);
            self.play_file(file, codec, next_file);
            self.events.emit(Event::AudioStop);
        }

        debug!("player exiting");
    }

    /// Plays a local file, reconciling any armed precache first.
    fn play_file(&self, file: &str, codec: &dyn Codec, next_file: Option<&str>) {
        self.out_buf.reset();

        let staged = {
            let mut precache = self.precache.lock().unwrap();
            precache.wait();

            if precache.ok() && precache.file() != Some(file) {
                // A user skip invalidated the prefetch.
                debug!("the precached file is not the file we want");
                precache.reset();
            }

            let staged = precache.take();
            precache.reset();
            staged
        };

        let (decoder, sound_params, already_decoded) = if let Some(staged) = staged {
            debug!("using precached file");
            let crate::precache::Staged {
                buf,
                params,
                decoder,
                bitrate,
                decoded_time,
                avg_bitrate,
                duration,
            } = staged;

            self.events.emit(Event::Channels(params.channels));
            self.events.emit(Event::Rate(params.rate));

            if let Err(e) = self.output.open(&params) {
                self.events.error(format!("cannot open audio output: {e}"));
                return;
            }
            self.out_buf.set_format(&params);
            self.out_buf.send(&buf);

            self.events.emit(Event::AvgBitrate(avg_bitrate));
            self.bitrate.adopt(bitrate);
            if let Some(seconds) = duration {
                self.events.emit(Event::PlaylistTime {
                    file: file.to_string(),
                    seconds,
                });
            }

            (decoder, params, decoded_time)
        } else {
            let decoder = match codec.open(Path::new(file)) {
                Ok(decoder) => decoder,
                Err(e) => {
                    self.events.error(format!("cannot open {file}: {e}"));
                    debug!("can't open file, exiting");
                    self.events.emit(Event::AudioFail(file.to_string()));
                    return;
                }
            };

            self.events.emit(Event::AvgBitrate(decoder.avg_bitrate()));
            self.bitrate.empty();
            if let Some(seconds) = decoder.duration() {
                self.events.emit(Event::PlaylistTime {
                    file: file.to_string(),
                    seconds,
                });
            }

            // The device opens from the decode loop once the first burst
            // reveals the sound parameters.
            (decoder, SoundParams::default(), 0.0)
        };

        self.events.emit(Event::State(PlayState::Playing));
        self.decode_loop(decoder, next_file, None, sound_params, already_decoded);
    }

    /// Plays an already-open network stream. No next-file precache.
    fn play_stream(&self, codec: &dyn Codec, stream: IoStream) {
        self.out_buf.reset();

        let player_handle = stream.clone();
        let decoder = match codec.open_stream(stream) {
            Ok(decoder) => decoder,
            Err(e) => {
                *self.decoder_stream.lock().unwrap() = None;
                self.events.error(format!("cannot decode stream: {e}"));
                return;
            }
        };

        self.events.emit(Event::State(PlayState::Playing));
        self.bitrate.empty();
        self.decode_loop(decoder, None, Some(&player_handle), SoundParams::default(), 0.0);
    }

    /// The common decode loop for files and streams.
    #[expect(clippy::too_many_lines)]
    fn decode_loop(
        &self,
        mut decoder: Box<dyn Decoder>,
        next_file: Option<&str>,
        stream: Option<&IoStream>,
        mut sound_params: SoundParams,
        already_decoded: f64,
    ) {
        let out_buf = &self.out_buf;
        let mut eof = false;
        let mut stopped = false;
        let mut pcm = vec![0u8; PCM_BUF_SIZE];
        let mut decoded = 0;
        let mut new_params = sound_params;
        let mut params_change = false;
        let mut decode_time = already_decoded;

        loop {
            let guard = self.requests.lock();
            if !eof && decoded == 0 {
                drop(guard);

                if let Some(stream) = stream {
                    if out_buf.get_fill() < PREBUFFER_THRESHOLD {
                        self.prebuffering.store(true, Ordering::SeqCst);
                        if let Err(e) = stream.prebuffer(self.config.prebuffering * 1024) {
                            debug!("prebuffer interrupted: {e}");
                        }
                        self.prebuffering.store(false, Ordering::SeqCst);
                    }
                }

                let step = decoder.decode(&mut pcm);
                decoded = step.bytes;
                if decoded > 0 {
                    decode_time += decoded as f64 / step.params.bytes_per_second() as f64;
                }

                let err = decoder.take_error();
                match err.severity {
                    Severity::Ok => {}
                    Severity::Stream => warn!("{}", err.message),
                    Severity::Fatal => self.events.error(err.message),
                }

                if decoded == 0 {
                    debug!("EOF from decoder");
                    eof = true;
                } else {
                    new_params = step.params;
                    if new_params != sound_params {
                        params_change = true;
                    }

                    #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let second = decode_time as u32;
                    if let Some(kbps) = decoder.bitrate() {
                        self.bitrate.add(second, kbps);
                    }
                }
            } else if *guard == PlayerRequest::None
                && (decoded > out_buf.get_free()
                    || (eof && out_buf.get_fill() > 0)
                    || (params_change && out_buf.get_fill() > 0))
            {
                // No room for the pending payload, or the tail of the track
                // (or format) is still draining. Arm the precache before
                // parking on the request condition.
                if eof && self.config.autonext {
                    if let Some(next) = next_file.filter(|next| !is_url(next)) {
                        let mut precache = self.precache.lock().unwrap();
                        if precache.is_idle() && self.registry.is_sound_file(next) {
                            precache.start(
                                Arc::clone(&self.registry),
                                next,
                                self.events.clone(),
                            );
                        }
                    }
                }
                drop(self.requests.wait(guard));
            } else {
                drop(guard);
            }

            // Re-read the request when acting on it, so a request that
            // arrived after the one we clear is not lost.
            let request = self.requests.get();
            match request {
                PlayerRequest::Stop => {
                    debug!("stop");
                    stopped = true;
                    out_buf.stop();
                    self.requests.clear_if(request);
                    break;
                }

                PlayerRequest::Seek(target) => {
                    debug!("seeking to {target}");
                    match decoder.seek(target) {
                        Some(effective) => {
                            out_buf.stop();
                            out_buf.reset();
                            out_buf.time_set(f64::from(effective));
                            self.bitrate.empty();
                            decode_time = f64::from(effective);
                            eof = false;
                            decoded = 0;
                        }
                        None => match decoder.duration() {
                            // Seeking past the end is not an error, just
                            // the end of the song.
                            Some(duration) if duration > 0 && duration <= target => {
                                debug!("seeking to EOF");
                                out_buf.stop();
                                out_buf.reset();
                                out_buf.time_set(f64::from(duration));
                                self.bitrate.empty();
                                decode_time = f64::from(duration);
                                eof = true;
                                decoded = 0;
                            }
                            _ => debug!("true error when seeking"),
                        },
                    }
                    self.requests.clear_if(request);
                }

                PlayerRequest::Pause => {
                    debug!("pause");
                    self.output.pause();
                    self.events.emit(Event::State(PlayState::Paused));
                    self.requests.clear_if(request);
                }

                PlayerRequest::Unpause => {
                    debug!("unpause");
                    self.output.resume();
                    self.events.emit(Event::State(PlayState::Playing));
                    self.requests.clear_if(request);
                }

                PlayerRequest::None => {
                    if !eof && decoded > 0 && decoded <= out_buf.get_free() && !params_change {
                        out_buf.send(&pcm[..decoded]);
                        decoded = 0;
                    } else if !eof && params_change && out_buf.get_fill() == 0 {
                        debug!("sound parameters changed to {new_params}");
                        sound_params = new_params;
                        params_change = false;
                        self.events.emit(Event::Channels(sound_params.channels));
                        self.events.emit(Event::Rate(sound_params.rate));
                        out_buf.wait_drained();
                        if let Err(e) = self.output.open(&sound_params) {
                            self.events.error(format!("cannot open audio output: {e}"));
                            break;
                        }
                        out_buf.set_format(&sound_params);
                    } else if eof && out_buf.get_fill() == 0 {
                        debug!("played everything");
                        break;
                    }
                }
            }
        }

        *self.decoder_stream.lock().unwrap() = None;
        drop(decoder);
        self.bitrate.empty();

        out_buf.wait_drained();

        // A successful precache that nobody will consume (stop, or
        // auto-advance off) must not leak its open decoder.
        let mut precache = self.precache.lock().unwrap();
        if (stopped || !self.config.autonext) && !precache.is_idle() {
            precache.wait();
            precache.reset();
        }
    }
}

impl Drop for PlayerSession {
    /// Joins and discards any precache still in flight.
    fn drop(&mut self) {
        if let Ok(precache) = self.precache.get_mut() {
            precache.wait();
            precache.reset();
        }
    }
}
