//! End-to-end playback scenarios driven through a scripted codec backend
//! and a fake audio output, so no audio hardware or real media files are
//! needed. The fake decoder emits a deterministic byte pattern, which lets
//! the tests check byte-exact delivery across precache handovers, seeks and
//! stops.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tremolo::config::Config;
use tremolo::decoder::registry::Registry;
use tremolo::decoder::{Codec, Decoded, Decoder, DecoderError};
use tremolo::device::AudioOutput;
use tremolo::error::{Error, Result};
use tremolo::events::{Event, EventSink, PlayState};
use tremolo::outbuf::{OutputBuffer, PCM_BUF_SIZE};
use tremolo::params::{SampleEncoding, SoundParams};
use tremolo::player::PlayerSession;

/// 4 kHz mono 16-bit: 8000 bytes per second, so tracks stay small.
fn mono() -> SoundParams {
    SoundParams::new(SampleEncoding::S16Le, 4_000, 1)
}

/// A second format for handover-mismatch scenarios.
fn mono48() -> SoundParams {
    SoundParams::new(SampleEncoding::S16Le, 48_000, 1)
}

fn pattern(i: usize) -> u8 {
    (i % 251) as u8
}

#[derive(Clone)]
struct TrackSpec {
    params: SoundParams,
    total: usize,
    fail_open: bool,
    seek_works: bool,
    duration: Option<u32>,
    /// Byte offset at which the emitted parameters change.
    switch_at: Option<(usize, SoundParams)>,
    kbps: u32,
}

impl TrackSpec {
    fn new(params: SoundParams, total: usize) -> Self {
        Self {
            params,
            total,
            fail_open: false,
            seek_works: true,
            duration: None,
            switch_at: None,
            kbps: 128,
        }
    }
}

struct FakeInner {
    tracks: Mutex<HashMap<String, TrackSpec>>,
    opens: Mutex<HashMap<String, usize>>,
}

/// Codec backend that serves scripted tracks for the `fake` extension.
struct FakeCodec(Arc<FakeInner>);

impl Codec for FakeCodec {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn open(&self, path: &Path) -> Result<Box<dyn Decoder>> {
        let key = path.to_string_lossy().into_owned();
        *self.0.opens.lock().unwrap().entry(key.clone()).or_insert(0) += 1;

        let spec = self
            .0
            .tracks
            .lock()
            .unwrap()
            .get(&key)
            .cloned()
            .ok_or_else(|| Error::not_found(format!("no such track {key}")))?;
        if spec.fail_open {
            return Err(Error::not_found(format!("cannot open {key}")));
        }
        Ok(Box::new(FakeDecoder { spec, pos: 0 }))
    }

    fn handles_ext(&self, ext: &str) -> bool {
        ext == "fake"
    }
}

struct FakeDecoder {
    spec: TrackSpec,
    pos: usize,
}

impl FakeDecoder {
    fn params_at(&self, pos: usize) -> SoundParams {
        match self.spec.switch_at {
            Some((at, params)) if pos >= at => params,
            _ => self.spec.params,
        }
    }
}

impl Decoder for FakeDecoder {
    fn decode(&mut self, dst: &mut [u8]) -> Decoded {
        if self.pos >= self.spec.total {
            return Decoded {
                bytes: 0,
                params: self.params_at(self.pos),
            };
        }

        let params = self.params_at(self.pos);
        let mut n = (self.spec.total - self.pos).min(dst.len()).min(8_192);
        if let Some((at, _)) = self.spec.switch_at {
            if self.pos < at {
                n = n.min(at - self.pos);
            }
        }
        for (i, byte) in dst[..n].iter_mut().enumerate() {
            *byte = pattern(self.pos + i);
        }
        self.pos += n;
        Decoded { bytes: n, params }
    }

    fn take_error(&mut self) -> DecoderError {
        DecoderError::default()
    }

    fn seek(&mut self, seconds: u32) -> Option<u32> {
        if !self.spec.seek_works {
            return None;
        }
        let target = (seconds as usize * self.spec.params.bytes_per_second()).min(self.spec.total);
        self.pos = target;
        Some(seconds)
    }

    fn duration(&self) -> Option<u32> {
        self.spec
            .duration
            .or_else(|| Some((self.spec.total / self.spec.params.bytes_per_second()) as u32))
    }

    fn bitrate(&self) -> Option<u32> {
        Some(self.spec.kbps)
    }

    fn avg_bitrate(&self) -> Option<u32> {
        Some(self.spec.kbps)
    }
}

/// Output stub recording every effective (re)open.
#[derive(Default)]
struct FakeOutput {
    opens: Mutex<Vec<SoundParams>>,
    current: Mutex<Option<SoundParams>>,
    paused: AtomicBool,
}

impl AudioOutput for FakeOutput {
    fn open(&self, params: &SoundParams) -> Result<()> {
        let mut current = self.current.lock().unwrap();
        if *current == Some(*params) {
            return Ok(());
        }
        *current = Some(*params);
        self.opens.lock().unwrap().push(*params);
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }
}

struct Harness {
    session: Arc<PlayerSession>,
    out_buf: Arc<OutputBuffer>,
    output: Arc<FakeOutput>,
    inner: Arc<FakeInner>,
    rx: tokio::sync::mpsc::UnboundedReceiver<Event>,
    drained: Arc<Mutex<Vec<u8>>>,
    drain_stop: Arc<AtomicBool>,
    drainer: Option<JoinHandle<()>>,
    events: Vec<Event>,
}

impl Harness {
    /// Builds a session over the fake codec and starts a paced drainer
    /// thread standing in for the audio device consumer.
    fn new(tracks: &[(&str, TrackSpec)], drain_pause: Duration) -> Self {
        let inner = Arc::new(FakeInner {
            tracks: Mutex::new(
                tracks
                    .iter()
                    .map(|(name, spec)| ((*name).to_string(), spec.clone()))
                    .collect(),
            ),
            opens: Mutex::new(HashMap::new()),
        });

        let mut registry = Registry::new();
        registry.register(Box::new(FakeCodec(Arc::clone(&inner))));

        let out_buf = Arc::new(OutputBuffer::new(4 * PCM_BUF_SIZE));
        let output = Arc::new(FakeOutput::default());
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();

        let session = Arc::new(PlayerSession::new(
            Arc::new(registry),
            Arc::clone(&output) as Arc<dyn AudioOutput>,
            Arc::clone(&out_buf),
            Config::default(),
            EventSink::new(tx),
        ));

        let drained = Arc::new(Mutex::new(Vec::new()));
        let drain_stop = Arc::new(AtomicBool::new(false));
        let drainer = {
            let out_buf = Arc::clone(&out_buf);
            let drained = Arc::clone(&drained);
            let stop = Arc::clone(&drain_stop);
            std::thread::spawn(move || {
                let mut chunk = vec![0u8; 4096];
                while !stop.load(Ordering::SeqCst) {
                    let n = out_buf.read(&mut chunk);
                    if n > 0 {
                        drained.lock().unwrap().extend_from_slice(&chunk[..n]);
                    }
                    std::thread::sleep(drain_pause);
                }
            })
        };

        Self {
            session,
            out_buf,
            output,
            inner,
            rx,
            drained,
            drain_stop,
            drainer: Some(drainer),
            events: Vec::new(),
        }
    }

    fn opens(&self, file: &str) -> usize {
        self.inner.opens.lock().unwrap().get(file).copied().unwrap_or(0)
    }

    fn device_opens(&self) -> Vec<SoundParams> {
        self.output.opens.lock().unwrap().clone()
    }

    fn drained_len(&self) -> usize {
        self.drained.lock().unwrap().len()
    }

    /// Collects all events emitted so far.
    fn poll_events(&mut self) -> &[Event] {
        while let Ok(event) = self.rx.try_recv() {
            self.events.push(event);
        }
        &self.events
    }

    fn count(&mut self, wanted: &Event) -> usize {
        self.poll_events();
        self.events.iter().filter(|event| *event == wanted).count()
    }

    /// Polls until `cond` holds or the timeout elapses.
    fn wait_until(&self, cond: impl Fn() -> bool, timeout: Duration) -> bool {
        let start = Instant::now();
        while start.elapsed() < timeout {
            if cond() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        cond()
    }

    /// Stops the drainer and returns everything the "device" received.
    fn finish(mut self) -> Vec<u8> {
        self.drain_stop.store(true, Ordering::SeqCst);
        if let Some(drainer) = self.drainer.take() {
            drainer.join().unwrap();
        }
        let drained = self.drained.lock().unwrap().clone();
        drained
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.drain_stop.store(true, Ordering::SeqCst);
    }
}

fn assert_pattern(bytes: &[u8], tracks: &[usize]) {
    let mut at = 0;
    for (index, &total) in tracks.iter().enumerate() {
        for i in 0..total {
            assert_eq!(
                bytes[at + i],
                pattern(i),
                "byte {i} of track {index} is wrong"
            );
        }
        at += total;
    }
    assert_eq!(bytes.len(), at, "device received a different byte count");
}

#[test]
fn gapless_handover_reuses_precached_decoder() {
    let a_total = 200_000;
    let b_total = 150_000;
    let mut harness = Harness::new(
        &[
            ("a.fake", TrackSpec::new(mono(), a_total)),
            ("b.fake", TrackSpec::new(mono(), b_total)),
        ],
        Duration::from_millis(1),
    );

    harness.session.play("a.fake", Some("b.fake"));

    // The precache opened the next track while `a` was still draining.
    assert!(
        harness.wait_until(|| harness.opens("b.fake") == 1, Duration::from_secs(2)),
        "precache never opened the next track"
    );

    harness.session.play("b.fake", None);

    // No second open: the staging handover kept the precache decoder.
    assert_eq!(harness.opens("a.fake"), 1);
    assert_eq!(harness.opens("b.fake"), 1);

    // Same format end to end: the device was opened exactly once.
    assert_eq!(harness.device_opens(), vec![mono()]);

    assert_eq!(harness.count(&Event::AudioStart), 2);
    assert_eq!(harness.count(&Event::AudioStop), 2);

    // The device received both tracks byte-exact and in order, with the
    // precached prefix never re-decoded.
    let drained = harness.finish();
    assert_pattern(&drained, &[a_total, b_total]);
}

#[test]
fn mismatched_handover_reopens_device_after_drain() {
    let a_total = 200_000;
    let b_total = 150_000;
    let mut harness = Harness::new(
        &[
            ("a.fake", TrackSpec::new(mono(), a_total)),
            ("b.fake", TrackSpec::new(mono48(), b_total)),
        ],
        Duration::from_millis(1),
    );

    harness.session.play("a.fake", Some("b.fake"));
    harness.session.play("b.fake", None);

    // One reopen for the new sample rate, and the right order.
    assert_eq!(harness.device_opens(), vec![mono(), mono48()]);

    // Channel/rate refresh accompanied the reopen.
    assert!(harness.count(&Event::Rate(48_000)) >= 1);

    let drained = harness.finish();
    assert_pattern(&drained, &[a_total, b_total]);
}

#[test]
fn mid_stream_format_change_waits_for_drain() {
    let total = 260_000;
    let switch_at = 130_000;
    let mut spec = TrackSpec::new(mono(), total);
    spec.switch_at = Some((switch_at, mono48()));

    let harness = Harness::new(&[("c.fake", spec)], Duration::from_millis(1));
    harness.session.play("c.fake", None);

    // Both formats were opened, in order, exactly once each.
    assert_eq!(harness.device_opens(), vec![mono(), mono48()]);

    // Nothing was lost around the switch.
    let drained = harness.finish();
    assert_pattern(&drained, &[total]);
}

#[test]
fn seek_past_end_snaps_to_duration() {
    // 30 seconds at 8000 bytes/s, and a decoder that cannot seek.
    let mut spec = TrackSpec::new(mono(), 240_000);
    spec.seek_works = false;

    let harness = Harness::new(&[("d.fake", spec)], Duration::from_millis(2));

    let player = Arc::clone(&harness.session);
    let playing = std::thread::spawn(move || player.play("d.fake", None));

    assert!(
        harness.wait_until(|| harness.drained_len() > 0, Duration::from_secs(2)),
        "playback never started"
    );

    harness.session.jump_to(100);
    playing.join().unwrap();

    // The buffer was stopped, reset and its cursor pinned to the duration.
    assert!((harness.out_buf.time() - 30.0).abs() < 1e-6);
    assert_eq!(harness.out_buf.get_fill(), 0);

    // Well short of the whole track: playback ended at the seek.
    assert!(harness.drained_len() < 240_000);
}

#[test]
fn seek_restarts_decoding_at_target() {
    // 50 seconds; seek backwards replays data.
    let total = 400_000;
    let harness = Harness::new(
        &[("e.fake", TrackSpec::new(mono(), total))],
        Duration::from_millis(1),
    );

    let player = Arc::clone(&harness.session);
    let playing = std::thread::spawn(move || player.play("e.fake", None));

    assert!(
        harness.wait_until(|| harness.drained_len() > 8_192, Duration::from_secs(2)),
        "playback never started"
    );

    harness.session.jump_to(10);
    playing.join().unwrap();

    // After the seek the device received the byte at 10 s (offset 80000)
    // immediately after the flush point.
    let drained = harness.finish();
    let tail = &drained[drained.len() - (total - 80_000)..];
    for (i, &byte) in tail.iter().enumerate() {
        assert_eq!(byte, pattern(80_000 + i), "post-seek byte {i} is wrong");
    }
}

#[test]
fn stop_discards_buffered_audio() {
    // A long track and a slow drain; stop must cut playback short.
    let mut harness = Harness::new(
        &[("long.fake", TrackSpec::new(mono(), 5_000_000))],
        Duration::from_millis(2),
    );

    let player = Arc::clone(&harness.session);
    let playing = std::thread::spawn(move || player.play("long.fake", None));

    assert!(
        harness.wait_until(|| harness.drained_len() > 0, Duration::from_secs(2)),
        "playback never started"
    );

    harness.session.stop();
    playing.join().unwrap();

    // Buffered but unplayed audio never reaches the device.
    let after_stop = harness.drained_len();
    std::thread::sleep(Duration::from_millis(50));
    assert_eq!(harness.drained_len(), after_stop);
    assert!(after_stop < 5_000_000);

    assert_eq!(harness.count(&Event::AudioStop), 1);
}

#[test]
fn pause_and_unpause_toggle_the_device() {
    let mut harness = Harness::new(
        &[("p.fake", TrackSpec::new(mono(), 2_000_000))],
        Duration::from_millis(2),
    );

    let player = Arc::clone(&harness.session);
    let playing = std::thread::spawn(move || player.play("p.fake", None));

    assert!(
        harness.wait_until(|| harness.drained_len() > 0, Duration::from_secs(2)),
        "playback never started"
    );

    harness.session.pause();
    assert!(
        harness.wait_until(
            || harness.output.paused.load(Ordering::SeqCst),
            Duration::from_secs(2)
        ),
        "pause was never applied"
    );

    harness.session.unpause();
    assert!(
        harness.wait_until(
            || !harness.output.paused.load(Ordering::SeqCst),
            Duration::from_secs(2)
        ),
        "unpause was never applied"
    );

    harness.session.stop();
    playing.join().unwrap();

    assert!(harness.count(&Event::State(PlayState::Paused)) >= 1);
}

#[test]
fn failed_precache_reports_once_and_replays_failure() {
    let a_total = 200_000;
    let mut harness = Harness::new(
        &[
            ("a.fake", TrackSpec::new(mono(), a_total)),
            // "missing.fake" is intentionally not registered.
        ],
        Duration::from_millis(1),
    );

    harness.session.play("a.fake", Some("missing.fake"));

    // The precache attempt failed and reported exactly once.
    let failed = Event::AudioFail("missing.fake".to_string());
    let deadline = Instant::now() + Duration::from_secs(2);
    while harness.count(&failed) < 1 && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(harness.opens("missing.fake"), 1);
    assert_eq!(harness.count(&failed), 1);

    // Switching to the track re-opens and fails again, with its own event.
    harness.session.play("missing.fake", None);
    assert_eq!(harness.opens("missing.fake"), 2);
    assert_eq!(
        harness.count(&Event::AudioFail("missing.fake".to_string())),
        2
    );

    // Both playback attempts were bracketed by start/stop events.
    assert_eq!(harness.count(&Event::AudioStart), 2);
    assert_eq!(harness.count(&Event::AudioStop), 2);
}

#[test]
fn current_time_follows_the_buffer_cursor() {
    let harness = Harness::new(
        &[("t.fake", TrackSpec::new(mono(), 160_000))],
        Duration::from_millis(1),
    );

    harness.session.play("t.fake", None);

    // 160000 bytes at 8000 bytes/s: the cursor ends at 20 s.
    assert!(
        harness.wait_until(
            || (harness.out_buf.time() - 20.0).abs() < 1e-6,
            Duration::from_secs(2)
        ),
        "time cursor did not reach the track end"
    );
    // Within floating-point accumulation of the per-read increments.
    assert!((19..=20).contains(&harness.session.current_time()));
}
