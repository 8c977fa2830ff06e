//! Events emitted during playback.
//!
//! The playback engine reports state changes through these events without
//! interpreting them; the server protocol layer forwards them to connected
//! clients, and the terminal UI renders them. Delivery is fire-and-forget
//! over an unbounded channel so the decode loop never blocks on a slow
//! consumer.

use tokio::sync::mpsc::UnboundedSender;

/// Coarse playback state reported to clients.
#[derive(Copy, Clone, Debug, Eq, Hash, PartialEq)]
pub enum PlayState {
    /// A track or stream is playing.
    Playing,
    /// Playback is suspended and can be resumed.
    Paused,
    /// Nothing is playing.
    Stopped,
}

/// Events that can be emitted by the playback engine.
///
/// Playback lifecycle:
/// * [`AudioStart`](Self::AudioStart) / [`AudioStop`](Self::AudioStop) bracket
///   every playback attempt, successful or not.
/// * [`AudioFail`](Self::AudioFail) names a path that could not be opened or
///   decoded.
///
/// Metadata refresh:
/// * [`CurrentTime`](Self::CurrentTime) and [`Bitrate`](Self::Bitrate) follow
///   the output buffer's playback cursor, not the decoder position, so they
///   match what the listener currently hears.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Event {
    /// Playback of a file or stream is about to begin.
    AudioStart,

    /// Playback of the current file or stream has ended.
    AudioStop,

    /// The named path could not be opened or decoded.
    AudioFail(String),

    /// The playback state changed.
    State(PlayState),

    /// The audible position advanced to a new integer second.
    CurrentTime(u32),

    /// The bitrate at the audible position changed, in kbps.
    /// `None` means no bitrate information is available.
    Bitrate(Option<u32>),

    /// The channel count of the playing stream changed.
    Channels(u16),

    /// The sample rate of the playing stream changed, in Hz.
    Rate(u32),

    /// The average bitrate of the current track, in kbps.
    AvgBitrate(Option<u32>),

    /// The duration of a playlist item became known, in seconds.
    PlaylistTime {
        /// Path of the playlist item.
        file: String,
        /// Duration in seconds.
        seconds: u32,
    },

    /// A user-visible status message, usually describing a failure.
    Error(String),
}

/// Fire-and-forget event publisher.
///
/// Wraps an optional channel sender; a sink created with [`EventSink::none`]
/// silently drops everything, which keeps the engine usable without a
/// connected client. Send failures are logged and never interrupt playback.
#[derive(Clone, Debug, Default)]
pub struct EventSink {
    tx: Option<UnboundedSender<Event>>,
}

impl EventSink {
    /// Creates a sink publishing to the given channel.
    #[must_use]
    pub fn new(tx: UnboundedSender<Event>) -> Self {
        Self { tx: Some(tx) }
    }

    /// Creates a sink that discards all events.
    #[must_use]
    pub fn none() -> Self {
        Self { tx: None }
    }

    /// Publishes an event.
    pub fn emit(&self, event: Event) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.send(event) {
                error!("failed to send event: {e}");
            }
        }
    }

    /// Publishes a status message and logs it.
    pub fn error(&self, message: impl Into<String>) {
        let message = message.into();
        error!("{message}");
        self.emit(Event::Error(message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sink_delivers_in_order() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let sink = EventSink::new(tx);

        sink.emit(Event::AudioStart);
        sink.emit(Event::CurrentTime(3));
        sink.emit(Event::AudioStop);

        assert_eq!(rx.try_recv().ok(), Some(Event::AudioStart));
        assert_eq!(rx.try_recv().ok(), Some(Event::CurrentTime(3)));
        assert_eq!(rx.try_recv().ok(), Some(Event::AudioStop));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn none_sink_discards() {
        let sink = EventSink::none();
        sink.emit(Event::AudioStart);
    }
}
