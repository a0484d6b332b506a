//! Segment bookkeeping for the history ring.
//!
//! A [`Seg`] describes one contiguous run of valid frames inside the ring:
//! physical `tail`/`head` indices, the frame offset of this run within the
//! unbounded logical stream, and the stream's start time. The ring holds a
//! [`Segs`] pair (`current` accepts new frames, `old` is trimmed away
//! after an exchange) plus the [`FillState`] machine that sequences their
//! life cycle.

use crate::timebase::FrameClock;
use chrono::{DateTime, Utc};

/// One contiguous run of frames inside the ring.
///
/// Invariant: `0 <= tail <= head <= n_ring_frames`. Times are derived from
/// `offset`, the indices, and `start_time`; nothing is stored redundantly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Seg {
    tail: usize,
    head: usize,
    offset: u64,
    start_time: DateTime<Utc>,
}

impl Seg {
    pub(crate) fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            tail: 0,
            head: 0,
            offset: 0,
            start_time,
        }
    }

    pub fn tail(&self) -> usize {
        self.tail
    }

    pub fn head(&self) -> usize {
        self.head
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    pub fn n_frames(&self) -> usize {
        self.head - self.tail
    }

    /// A segment holding at least one frame.
    pub fn is_active(&self) -> bool {
        self.n_frames() > 0
    }

    /// Index of the first held frame in the logical stream.
    pub fn tail_in_stream(&self) -> u64 {
        self.offset + self.tail as u64
    }

    /// Index one past the last held frame in the logical stream.
    pub fn head_in_stream(&self) -> u64 {
        self.offset + self.head as u64
    }

    pub fn tail_time(&self, clock: &FrameClock) -> DateTime<Utc> {
        clock.time_of(self.start_time, self.tail_in_stream())
    }

    pub fn head_time(&self, clock: &FrameClock) -> DateTime<Utc> {
        clock.time_of(self.start_time, self.head_in_stream())
    }

    pub(crate) fn advance_head(&mut self, n: usize, n_ring_frames: usize) {
        self.head += n;
        assert!(
            self.head <= n_ring_frames,
            "segment head {} ran past the ring end {}",
            self.head,
            n_ring_frames
        );
    }

    pub(crate) fn advance_tail(&mut self, n: usize) {
        self.trim_tail_to(self.tail + n);
    }

    pub(crate) fn trim_tail_to(&mut self, new_tail: usize) {
        assert!(
            new_tail >= self.tail && new_tail <= self.head,
            "segment tail trim {} outside [{}, {}]",
            new_tail,
            self.tail,
            self.head
        );
        self.tail = new_tail;
    }

    pub(crate) fn reset(&mut self) {
        self.tail = 0;
        self.head = 0;
    }

    pub(crate) fn set_offset(&mut self, offset: u64) {
        self.offset = offset;
    }

    pub(crate) fn set_start_time(&mut self, start_time: DateTime<Utc>) {
        self.start_time = start_time;
    }
}

/// Life-cycle state of the segment pair as callbacks arrive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FillState {
    /// No data has ever arrived; both segments inactive.
    AtStart,
    /// Current grows from ring index 0; total frames still below the
    /// retained-data target.
    AtBegin,
    /// Current's tail is trimmed as its head advances.
    Moving,
    /// Transient label while an exchange is in flight; never observable
    /// across callbacks.
    AtEnd,
    /// After an exchange: current regrows from 0 while old's tail retreats
    /// by the same frame count.
    Chasing,
}

/// The ring's segment pair.
///
/// When both segments are active, `old` sits ahead of `current` in the
/// physical ring (`current.head < old.tail`), separated by the reader
/// grace gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segs {
    pub current: Seg,
    pub old: Seg,
}

impl Segs {
    pub(crate) fn new(start_time: DateTime<Utc>) -> Self {
        Self {
            current: Seg::new(start_time),
            old: Seg::new(start_time),
        }
    }

    /// Swap `current` and `old` when current reaches the physical ring
    /// end. The fresh current restarts at index 0 with its offset advanced
    /// by everything the outgoing segment ever held, keeping stream
    /// indices globally monotone.
    pub(crate) fn exchange(&mut self) {
        assert!(
            !self.old.is_active(),
            "ring exchange with the old segment still active"
        );
        std::mem::swap(&mut self.current, &mut self.old);
        let offset = self.old.head_in_stream();
        self.current.reset();
        self.current.set_offset(offset);
    }

    /// First retained frame, in stream coordinates.
    pub fn tail_in_stream(&self) -> u64 {
        if self.old.is_active() {
            self.old.tail_in_stream()
        } else {
            self.current.tail_in_stream()
        }
    }

    /// One past the newest retained frame, in stream coordinates.
    pub fn head_in_stream(&self) -> u64 {
        self.current.head_in_stream()
    }

    pub fn n_frames(&self) -> usize {
        self.current.n_frames() + self.old.n_frames()
    }

    pub fn tail_time(&self, clock: &FrameClock) -> DateTime<Utc> {
        if self.old.is_active() {
            self.old.tail_time(clock)
        } else {
            self.current.tail_time(clock)
        }
    }

    pub fn head_time(&self, clock: &FrameClock) -> DateTime<Utc> {
        self.current.head_time(clock)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn t0() -> DateTime<Utc> {
        "2025-06-01T00:00:00Z".parse().unwrap()
    }

    #[test]
    fn test_new_seg_is_inactive() {
        let seg = Seg::new(t0());
        assert!(!seg.is_active());
        assert_eq!(seg.n_frames(), 0);
        assert_eq!(seg.tail_in_stream(), 0);
    }

    #[test]
    fn test_advance_and_trim() {
        let mut seg = Seg::new(t0());
        seg.advance_head(10, 20);
        assert_eq!(seg.n_frames(), 10);
        seg.trim_tail_to(4);
        assert_eq!(seg.n_frames(), 6);
        seg.advance_tail(2);
        assert_eq!(seg.tail(), 6);
    }

    #[test]
    #[should_panic(expected = "ran past the ring end")]
    fn test_head_cannot_pass_ring_end() {
        let mut seg = Seg::new(t0());
        seg.advance_head(21, 20);
    }

    #[test]
    #[should_panic(expected = "outside")]
    fn test_tail_cannot_pass_head() {
        let mut seg = Seg::new(t0());
        seg.advance_head(5, 20);
        seg.trim_tail_to(6);
    }

    #[test]
    fn test_reset_keeps_offset_and_start_time() {
        let mut seg = Seg::new(t0());
        seg.set_offset(100);
        seg.advance_head(5, 20);
        seg.reset();
        assert!(!seg.is_active());
        assert_eq!(seg.offset(), 100);
        assert_eq!(seg.start_time(), t0());
    }

    #[test]
    fn test_times_derive_from_stream_index() {
        let clock = FrameClock::new(1_000);
        let mut seg = Seg::new(t0());
        seg.set_offset(500);
        seg.advance_head(250, 1_000);
        seg.trim_tail_to(100);
        assert_eq!(seg.tail_time(&clock), t0() + TimeDelta::milliseconds(600));
        assert_eq!(seg.head_time(&clock), t0() + TimeDelta::milliseconds(750));
    }

    #[test]
    fn test_exchange_preserves_stream_monotonicity() {
        let mut segs = Segs::new(t0());
        segs.current.advance_head(20, 20);
        segs.current.trim_tail_to(6);
        segs.exchange();

        assert!(!segs.current.is_active());
        assert_eq!(segs.current.offset(), 20);
        assert_eq!(segs.old.tail(), 6);
        assert_eq!(segs.old.head(), 20);
        // Stream coordinates continue without a jump.
        assert_eq!(segs.old.head_in_stream(), segs.current.head_in_stream());
    }

    #[test]
    #[should_panic(expected = "still active")]
    fn test_exchange_requires_inactive_old() {
        let mut segs = Segs::new(t0());
        segs.current.advance_head(20, 20);
        segs.old.advance_head(3, 20);
        segs.exchange();
    }

    #[test]
    fn test_pair_range_spans_old_and_current() {
        let clock = FrameClock::new(1_000);
        let mut segs = Segs::new(t0());
        segs.current.advance_head(20, 20);
        segs.current.trim_tail_to(6);
        segs.exchange();
        segs.current.advance_head(5, 20);
        segs.old.advance_tail(5);

        assert_eq!(segs.tail_in_stream(), 11);
        assert_eq!(segs.head_in_stream(), 25);
        assert_eq!(segs.n_frames(), 14);
        assert_eq!(segs.tail_time(&clock), t0() + TimeDelta::milliseconds(11));
        assert_eq!(segs.head_time(&clock), t0() + TimeDelta::milliseconds(25));
    }
}
