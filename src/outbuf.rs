//! Bounded PCM output buffer.
//!
//! The decode loop produces PCM faster than the audio device consumes it;
//! this ring decouples the two. The writer side ([`OutputBuffer::send`])
//! blocks while the ring is full, the consumer side ([`OutputBuffer::read`])
//! never blocks and is meant to be called from the audio output path.
//!
//! Besides the byte accounting the buffer tracks the *playback time cursor*:
//! the position in seconds of the oldest byte still unplayed. The cursor is
//! installed with [`OutputBuffer::time_set`] after a seek and advanced by
//! every read, which makes it the authoritative "what the listener hears
//! right now" clock. Displayed time must come from here, never from the
//! decoder, which may be many seconds ahead.

use std::sync::{Condvar, Mutex};

use crate::params::SoundParams;

/// Unit size for decode bursts and precache staging slots.
pub const PCM_BUF_SIZE: usize = 36 * 1024;

/// Output-buffer fill below which a network stream is prebuffered again.
pub const PREBUFFER_THRESHOLD: usize = PCM_BUF_SIZE / 2;

/// Callback invoked with the new time cursor whenever a read opens space.
pub type FreeCallback = Box<dyn Fn(f64) + Send + Sync>;

#[derive(Debug)]
struct State {
    ring: Vec<u8>,
    /// Index of the oldest unread byte.
    head: usize,
    fill: usize,
    stopped: bool,
    /// Playback position of the oldest unread byte, in seconds.
    time: f64,
    /// Byte rate of the PCM currently in the ring; 0 while unknown.
    bytes_per_second: usize,
}

/// Bounded PCM byte ring with fill/free accounting and a time cursor.
pub struct OutputBuffer {
    state: Mutex<State>,
    /// Signalled when space opens, the buffer stops or is reset.
    space: Condvar,
    /// Signalled when the ring drains to empty.
    drained: Condvar,
    free_cb: Mutex<Option<FreeCallback>>,
    capacity: usize,
}

impl OutputBuffer {
    /// Creates a ring of `capacity` bytes.
    ///
    /// The capacity must hold at least one decode burst plus a full precache
    /// staging slot, i.e. 3 x [`PCM_BUF_SIZE`]; the player uses 4 x.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        assert!(capacity >= 3 * PCM_BUF_SIZE, "output buffer too small");
        Self {
            state: Mutex::new(State {
                ring: vec![0; capacity],
                head: 0,
                fill: 0,
                stopped: false,
                time: 0.0,
                bytes_per_second: 0,
            }),
            space: Condvar::new(),
            drained: Condvar::new(),
            free_cb: Mutex::new(None),
            capacity,
        }
    }

    /// Total capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Installs the callback invoked each time a read opens space.
    pub fn set_free_callback(&self, cb: FreeCallback) {
        *self.free_cb.lock().unwrap() = Some(cb);
    }

    /// Installs the byte rate used to advance the time cursor.
    ///
    /// Called when the audio device is (re)opened with new sound parameters;
    /// the bytes already in the ring are expected to match.
    pub fn set_format(&self, params: &SoundParams) {
        let mut state = self.state.lock().unwrap();
        state.bytes_per_second = params.bytes_per_second();
    }

    /// Clears the ring and the stopped flag; zeroes fill and time.
    pub fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        state.head = 0;
        state.fill = 0;
        state.time = 0.0;
        state.stopped = false;
        self.space.notify_all();
        self.drained.notify_all();
    }

    /// Stops the buffer: discards the current fill and rejects all further
    /// writes until [`reset`](Self::reset). Idempotent.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.stopped = true;
        state.head = 0;
        state.fill = 0;
        self.space.notify_all();
        self.drained.notify_all();
    }

    /// Whether the buffer is stopped.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state.lock().unwrap().stopped
    }

    /// Number of bytes waiting to be played.
    #[must_use]
    pub fn get_fill(&self) -> usize {
        self.state.lock().unwrap().fill
    }

    /// Number of bytes that can be written without blocking.
    ///
    /// A stopped buffer reports its full capacity free.
    #[must_use]
    pub fn get_free(&self) -> usize {
        let state = self.state.lock().unwrap();
        self.capacity - state.fill
    }

    /// Sets the playback time cursor, in seconds.
    pub fn time_set(&self, seconds: f64) {
        self.state.lock().unwrap().time = seconds;
    }

    /// Playback time cursor, in seconds.
    #[must_use]
    pub fn time(&self) -> f64 {
        self.state.lock().unwrap().time
    }

    /// Writes `data` into the ring, blocking while there is not enough free
    /// space. A stopped buffer drops the write silently.
    ///
    /// # Panics
    ///
    /// Panics if `data` is larger than the ring; callers write at most
    /// 2 x [`PCM_BUF_SIZE`] at a time (the precache staging flush).
    pub fn send(&self, data: &[u8]) {
        assert!(data.len() <= self.capacity, "write exceeds ring capacity");

        let mut state = self.state.lock().unwrap();
        loop {
            if state.stopped {
                return;
            }
            if self.capacity - state.fill >= data.len() {
                break;
            }
            state = self.space.wait(state).unwrap();
        }

        let capacity = self.capacity;
        let tail = (state.head + state.fill) % capacity;
        let first = data.len().min(capacity - tail);
        state.ring[tail..tail + first].copy_from_slice(&data[..first]);
        if first < data.len() {
            let rest = data.len() - first;
            state.ring[..rest].copy_from_slice(&data[first..]);
        }
        state.fill += data.len();
    }

    /// Reads up to `dst.len()` bytes into `dst` without blocking and returns
    /// the number of bytes copied. Advances the time cursor and invokes the
    /// free callback when data was consumed.
    pub fn read(&self, dst: &mut [u8]) -> usize {
        let (n, time) = {
            let mut state = self.state.lock().unwrap();
            let n = state.fill.min(dst.len());
            if n == 0 {
                return 0;
            }

            let capacity = self.capacity;
            let first = n.min(capacity - state.head);
            dst[..first].copy_from_slice(&state.ring[state.head..state.head + first]);
            if first < n {
                dst[first..n].copy_from_slice(&state.ring[..n - first]);
            }
            state.head = (state.head + n) % capacity;
            state.fill -= n;

            if state.bytes_per_second > 0 {
                state.time += n as f64 / state.bytes_per_second as f64;
            }
            if state.fill == 0 {
                self.drained.notify_all();
            }
            self.space.notify_all();
            (n, state.time)
        };

        // The callback takes its own locks; invoke it outside ours.
        if let Some(cb) = self.free_cb.lock().unwrap().as_ref() {
            cb(time);
        }

        n
    }

    /// Blocks until the ring drains to empty (or the buffer is stopped,
    /// which empties it).
    pub fn wait_drained(&self) {
        let mut state = self.state.lock().unwrap();
        while state.fill > 0 {
            state = self.drained.wait(state).unwrap();
        }
    }
}
