//! Per-position bitrate log.
//!
//! The output buffer may hold many seconds of PCM, so decoding runs well
//! ahead of what the listener hears. The bitrate log records at which
//! decoded time the bitrate changed; queries by the playback cursor then
//! return the bitrate of the audio currently audible rather than the
//! bitrate the decoder just produced.

use std::collections::VecDeque;
use std::sync::Mutex;

/// One change point: from `time` onwards the stream plays at `kbps`.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct Entry {
    time: u32,
    kbps: u32,
}

/// Ordered time -> bitrate map, trimmed as playback advances.
///
/// Entries are strictly increasing in time and consecutive entries differ in
/// bitrate. The log carries its own lock: the decode loop appends while the
/// UI refresh path queries.
#[derive(Debug, Default)]
pub struct BitrateLog {
    entries: Mutex<VecDeque<Entry>>,
}

impl BitrateLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that the stream plays at `kbps` from `time` seconds onwards.
    ///
    /// Appends only when both the bitrate and the time differ from the tail
    /// entry; a repeated bitrate extends the tail's span implicitly, and a
    /// changed bitrate within the same second is coalesced away. This keeps
    /// the log minimal at one-second granularity.
    pub fn add(&self, time: u32, kbps: u32) {
        let mut entries = self.entries.lock().unwrap();
        match entries.back() {
            None => entries.push_back(Entry { time, kbps }),
            Some(tail) if tail.kbps != kbps && tail.time != time => {
                debug_assert!(tail.time < time);
                entries.push_back(Entry { time, kbps });
            }
            Some(_) => {}
        }
    }

    /// Returns the bitrate audible at `time` seconds, or `None` if unknown.
    ///
    /// Entries wholly in the past are discarded: once playback has advanced
    /// past an entry's successor, the entry can never be queried again.
    pub fn get(&self, time: u32) -> Option<u32> {
        let mut entries = self.entries.lock().unwrap();
        while entries.len() > 1 {
            // Peek the successor; the head stays current until the successor
            // becomes audible.
            let next_time = entries[1].time;
            if next_time > time {
                break;
            }
            let old = entries.pop_front();
            trace!("dropping old bitrate {old:?} for time {time}");
        }
        entries.front().map(|entry| entry.kbps)
    }

    /// Discards all entries.
    pub fn empty(&self) {
        let mut entries = self.entries.lock().unwrap();
        if !entries.is_empty() {
            entries.clear();
            debug!("bitrate log emptied");
        }
    }

    /// Replaces this log's contents with another log's, consuming it.
    ///
    /// Used on precache handover: the staged log becomes the live one by
    /// moving its entries, so nothing is shared or double-owned afterwards.
    pub fn adopt(&self, other: BitrateLog) {
        let staged = other.entries.into_inner().unwrap();
        *self.entries.lock().unwrap() = staged;
    }

    /// Number of change points currently held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// Whether the log holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_log_has_no_bitrate() {
        let log = BitrateLog::new();
        assert_eq!(log.get(0), None);
        assert_eq!(log.get(100), None);
    }

    #[test]
    fn get_returns_latest_entry_at_or_before_time() {
        let log = BitrateLog::new();
        log.add(0, 128);
        log.add(3, 192);
        log.add(7, 160);

        assert_eq!(log.get(0), Some(128));
        assert_eq!(log.get(2), Some(128));
        assert_eq!(log.get(3), Some(192));
        assert_eq!(log.get(6), Some(192));
        assert_eq!(log.get(7), Some(160));
        assert_eq!(log.get(1000), Some(160));
    }

    #[test]
    fn get_trims_consumed_entries() {
        let log = BitrateLog::new();
        log.add(0, 128);
        log.add(3, 192);
        log.add(7, 160);

        assert_eq!(log.get(8), Some(160));
        assert_eq!(log.len(), 1);
        // Queries never look backwards once trimmed.
        assert_eq!(log.get(0), Some(160));
    }

    #[test]
    fn same_bitrate_appends_are_no_ops() {
        let log = BitrateLog::new();
        log.add(0, 128);
        log.add(5, 128);
        log.add(9, 128);
        assert_eq!(log.len(), 1);
        assert_eq!(log.get(9), Some(128));
    }

    #[test]
    fn bitrate_change_within_same_second_is_coalesced() {
        // Reference behavior: an append needs both fields to differ from the
        // tail, so a change at the same integer second is dropped.
        let log = BitrateLog::new();
        log.add(4, 128);
        log.add(4, 320);
        assert_eq!(log.len(), 1);
        assert_eq!(log.get(4), Some(128));
    }

    #[test]
    fn empty_discards_everything() {
        let log = BitrateLog::new();
        log.add(0, 128);
        log.add(3, 192);
        log.empty();
        assert!(log.is_empty());
        assert_eq!(log.get(5), None);
    }

    #[test]
    fn adopt_moves_entries_wholesale() {
        let live = BitrateLog::new();
        live.add(0, 96);

        let staged = BitrateLog::new();
        staged.add(0, 128);
        staged.add(2, 192);

        live.adopt(staged);
        assert_eq!(live.len(), 2);
        assert_eq!(live.get(0), Some(128));
        assert_eq!(live.get(2), Some(192));
    }
}
