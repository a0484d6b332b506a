//! The shared audio history ring.
//!
//! One producer, the soundcard callback, installs each block with
//! [`AudioBuffer::add_system_data`]; any number of background consumers
//! pull arbitrary recent time windows with [`AudioBuffer::read`]. The
//! producer never allocates, blocks, or locks; readers take seqlock
//! snapshots of the segment bookkeeping and reference ring data that is
//! guaranteed to survive for the gap grace period.

use super::handoff::CallbackHandoff;
use super::read::{clip_range, Clip, ReadResult, RingSpan};
use super::seg::{FillState, Seg, Segs};
use super::seqlock::{SnapshotError, Synchronizer};
use super::subscribers::{SubscriberId, SubscriberList, Subscription};
use crate::config::{BufferConfig, ConfigError};
use crate::timebase::FrameClock;
use chrono::{DateTime, TimeDelta, Utc};
use std::cell::UnsafeCell;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tracing::info;

/// Deadline for one stable snapshot attempt. Producer critical sections
/// last for one block copy, so readers normally succeed on the first or
/// second try.
pub const SNAPSHOT_TIMEOUT: Duration = Duration::from_micros(100);

/// Poll interval for [`AudioBuffer::wait_until`].
const WAIT_POLL: Duration = Duration::from_millis(1);

#[derive(Error, Debug)]
pub enum BufferError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to spawn handoff worker: {0}")]
    WorkerSpawn(#[from] std::io::Error),
}

/// Outcome of [`AudioBuffer::wait_until`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The buffer head time reached the target.
    Reached,
    /// The cancellation flag was observed first.
    Cancelled,
}

/// Metadata of the most recent callback block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatestBlock {
    /// Ring frame index where the block was copied.
    pub ring_index: usize,
    pub n_frames: usize,
    /// ADC wall-clock time of the block's first frame.
    pub start_time: DateTime<Utc>,
}

/// Everything the producer mutates under the seqlock. Copied wholesale
/// by reader snapshots, so it stays `Copy` and small.
#[derive(Debug, Clone, Copy)]
struct Shared {
    segs: Segs,
    state: FillState,
    start_time: Option<DateTime<Utc>>,
    latest: Option<LatestBlock>,
    n_frames_total: u64,
}

/// Fixed-size history ring with one real-time writer and many cooperative
/// readers.
///
/// Geometry: `n_ring_frames = n_data_frames + 3 * n_gap_frames / 2`. The
/// data region approximates the configured retained duration; the gap is
/// the head start the producer keeps ahead of delivered read spans.
pub struct AudioBuffer {
    clock: FrameClock,
    channel_count: usize,
    n_ring_frames: usize,
    n_data_frames: usize,
    /// Grows monotonically, producer-written only (adaptive gap step).
    n_gap_frames: AtomicUsize,
    n_usable_frames: AtomicUsize,
    ring: UnsafeCell<Box<[f32]>>,
    shared: UnsafeCell<Shared>,
    sync: Synchronizer,
    subscribers: SubscriberList<AudioBuffer>,
    post: OnceLock<CallbackHandoff>,
}

// SAFETY: AudioBuffer is shared between one producer thread and any
// number of reader threads under these rules:
//
// 1. Only the audio callback mutates `ring` and `shared`, and only
//    between `sync.enter_unstable()` / `sync.leave_unstable()`.
// 2. Readers copy `shared` inside `sync.when_stable`, which discards any
//    copy that overlapped a producer critical section, so no torn segment
//    bookkeeping is ever acted upon.
// 3. Readers only dereference ring positions named by a delivered
//    `ReadResult`, and the producer keeps at least the gap's worth of
//    frames between its write head and any span it has handed out.
// 4. `n_gap_frames`/`n_usable_frames` are atomics written only by the
//    producer; everything else is immutable after construction.
unsafe impl Send for AudioBuffer {}
unsafe impl Sync for AudioBuffer {}

impl AudioBuffer {
    /// Build a buffer without the handoff worker. Broadcasts then only
    /// happen if the owner wires its own; most callers want
    /// [`AudioBuffer::shared`].
    pub fn new(config: &BufferConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let (n_data_frames, n_gap_frames) = config.data_and_gap_frames()?;
        let n_ring_frames = n_data_frames + 3 * n_gap_frames / 2;
        if n_ring_frames < 2 * n_gap_frames {
            return Err(ConfigError::ValidationError(format!(
                "ring of {n_ring_frames} frames cannot maintain a {n_gap_frames}-frame gap"
            )));
        }

        let clock = config.frame_clock();
        let channel_count = config.channel_count;
        let ring = vec![0.0f32; n_ring_frames * channel_count].into_boxed_slice();

        info!(
            "History ring: {} frames ({:.1}s data + {:.2}s gap at {} Hz, {} ch, {:.2} MB)",
            n_ring_frames,
            n_data_frames as f64 / f64::from(config.frame_rate),
            n_gap_frames as f64 / f64::from(config.frame_rate),
            config.frame_rate,
            channel_count,
            (ring.len() * std::mem::size_of::<f32>()) as f64 / 1_000_000.0
        );

        let epoch = DateTime::<Utc>::UNIX_EPOCH;
        Ok(Self {
            clock,
            channel_count,
            n_ring_frames,
            n_data_frames,
            n_gap_frames: AtomicUsize::new(n_gap_frames),
            n_usable_frames: AtomicUsize::new(n_ring_frames),
            ring: UnsafeCell::new(ring),
            shared: UnsafeCell::new(Shared {
                segs: Segs::new(epoch),
                state: FillState::AtStart,
                start_time: None,
                latest: None,
                n_frames_total: 0,
            }),
            sync: Synchronizer::new(),
            subscribers: SubscriberList::new(),
            post: OnceLock::new(),
        })
    }

    /// Build a shared buffer with its handoff worker attached: after each
    /// callback the worker broadcasts to the subscriber list.
    pub fn shared(config: &BufferConfig) -> Result<Arc<Self>, BufferError> {
        let buffer = Arc::new(Self::new(config)?);
        let weak = Arc::downgrade(&buffer);
        let handoff = CallbackHandoff::spawn("audiosonde-handoff", move || {
            if let Some(buffer) = weak.upgrade() {
                buffer.subscribers.broadcast(&buffer);
            }
        })?;
        let _ = buffer.post.set(handoff);
        Ok(buffer)
    }

    pub fn channel_count(&self) -> usize {
        self.channel_count
    }

    pub fn frame_rate(&self) -> u32 {
        self.clock.frame_rate()
    }

    pub fn frame_clock(&self) -> FrameClock {
        self.clock
    }

    pub fn n_ring_frames(&self) -> usize {
        self.n_ring_frames
    }

    pub fn n_data_frames(&self) -> usize {
        self.n_data_frames
    }

    /// Current gap size in frames. Grows if the driver delivers larger
    /// blocks than the configuration provisioned for.
    pub fn gap_frames(&self) -> usize {
        self.n_gap_frames.load(Ordering::Acquire)
    }

    /// Ring capacity truncated to a whole number of callback blocks, per
    /// the largest block observed so far.
    pub fn usable_frames(&self) -> usize {
        self.n_usable_frames.load(Ordering::Acquire)
    }

    /// How long a delivered read span is guaranteed to stay valid.
    pub fn grace_duration(&self) -> TimeDelta {
        self.clock.duration_of(self.gap_frames() as u64)
    }

    pub fn duration_of(&self, n_frames: u64) -> TimeDelta {
        self.clock.duration_of(n_frames)
    }

    pub fn n_frames_of(&self, duration: TimeDelta) -> i64 {
        self.clock.n_frames_of(duration)
    }

    /// Install one callback block. This is the driver-facing producer
    /// entry point: interrupt-safe, no allocation, no locks, one bulk
    /// copy into the ring.
    ///
    /// `samples` holds `n * channel_count` interleaved samples;
    /// `block_start_time` is the ADC wall-clock instant of the first
    /// frame.
    ///
    /// # Panics
    ///
    /// Panics on conditions the producer cannot survive: partial frames,
    /// blocks too large for the ring geometry, or segment invariant
    /// violations (which would mean a second writer).
    pub fn add_system_data(&self, samples: &[f32], block_start_time: DateTime<Utc>) {
        let channels = self.channel_count;
        assert_eq!(samples.len() % channels, 0, "input block ends mid-frame");
        let n = samples.len() / channels;
        if n == 0 {
            return;
        }
        assert!(
            n <= self.n_ring_frames,
            "callback block of {n} frames larger than the whole ring"
        );

        self.sync.enter_unstable();
        // SAFETY: single producer by contract; readers only observe this
        // state through seqlock-guarded snapshots (see the Send/Sync
        // notes above).
        let shared = unsafe { &mut *self.shared.get() };
        let ring = unsafe { &mut *self.ring.get() };

        if shared.start_time.is_none() {
            shared.start_time = Some(block_start_time);
            shared.segs.current.set_start_time(block_start_time);
            shared.segs.old.set_start_time(block_start_time);
        }

        let mut new_head = shared.segs.current.head() + n;

        if new_head > self.n_ring_frames {
            // Exchange point: current would overflow the physical ring.
            assert_eq!(
                shared.state,
                FillState::Moving,
                "ring exchange outside steady state"
            );
            shared.state = FillState::AtEnd;
            shared.segs.exchange();
            new_head = shared.segs.current.head() + n;
            shared.state = FillState::Chasing;
        }
        let new_tail = new_head.saturating_sub(self.n_data_frames);

        match shared.state {
            FillState::AtStart => {
                assert_eq!(new_head, n);
                shared.state = FillState::AtBegin;
            }
            FillState::AtBegin => {
                if new_tail > 0 {
                    shared.segs.current.trim_tail_to(new_tail);
                    shared.state = FillState::Moving;
                }
            }
            FillState::Moving => {
                shared.segs.current.trim_tail_to(new_tail);
            }
            FillState::Chasing => {
                assert!(shared.segs.old.is_active(), "chasing without an old segment");
                assert!(
                    shared.segs.current.head() < shared.segs.old.tail(),
                    "chasing head overlaps the old segment"
                );
                shared.segs.current.trim_tail_to(new_tail);
                let retreat = n.min(shared.segs.old.n_frames());
                shared.segs.old.advance_tail(retreat);
                if shared.segs.old.n_frames() <= n {
                    shared.segs.old.reset();
                    shared.state = FillState::Moving;
                } else {
                    let half_gap = self.n_gap_frames.load(Ordering::Relaxed) / 2;
                    assert!(
                        new_head + half_gap <= shared.segs.old.tail(),
                        "chasing head closed the reader gap"
                    );
                }
            }
            FillState::AtEnd => unreachable!("transient exchange label at dispatch"),
        }

        // Adaptive gap: a block bigger than the gap was provisioned for
        // widens the gap to four blocks, or dies if the ring cannot
        // afford that.
        let gap = self.n_gap_frames.load(Ordering::Relaxed);
        if n > 2 * gap {
            let new_gap = gap.max(4 * n);
            let usable = n * (self.n_ring_frames / n);
            self.n_gap_frames.store(new_gap, Ordering::Release);
            self.n_usable_frames.store(usable, Ordering::Release);
            assert!(
                usable >= 2 * new_gap,
                "callback blocks of {n} frames are too large for a ring of {} frames",
                self.n_ring_frames
            );
        }

        let head = shared.segs.current.head();
        let dst = head * channels;
        ring[dst..dst + n * channels].copy_from_slice(samples);

        shared.latest = Some(LatestBlock {
            ring_index: head,
            n_frames: n,
            start_time: block_start_time,
        });
        shared.segs.current.advance_head(n, self.n_ring_frames);
        shared.n_frames_total += n as u64;

        self.sync.leave_unstable();

        if let Some(handoff) = self.post.get() {
            handoff.signal();
        }
    }

    /// Read the window `[time, time + duration)` from the retained
    /// history.
    ///
    /// Windows partially or fully outside the retained range come back
    /// clipped or empty; that is a normal result, not an error. The only
    /// failure is not obtaining a stable snapshot in time.
    pub fn read(
        &self,
        time: DateTime<Utc>,
        duration: TimeDelta,
    ) -> Result<ReadResult<'_>, SnapshotError> {
        self.read_with_timeout(time, duration, SNAPSHOT_TIMEOUT)
    }

    pub fn read_with_timeout(
        &self,
        time: DateTime<Utc>,
        duration: TimeDelta,
        timeout: Duration,
    ) -> Result<ReadResult<'_>, SnapshotError> {
        let shared = self.snapshot(timeout)?;

        let Some(epoch) = shared.start_time else {
            // Nothing has ever arrived; whatever was asked for lies ahead
            // of the data.
            return Ok(ReadResult {
                buffer: self,
                clip: Clip::BeforeData,
                time,
                duration: TimeDelta::zero(),
                parts: Vec::new(),
            });
        };

        let want_begin = self.clock.n_frames_of(time - epoch);
        let want_len = self.clock.n_frames_of(duration).max(0);
        let have_begin = shared.segs.tail_in_stream() as i64;
        let have_len = (shared.segs.head_in_stream() - shared.segs.tail_in_stream()) as i64;

        let (clip, begin, len) = clip_range(want_begin, want_len, have_begin, have_len);

        let mut parts = Vec::new();
        if !clip.is_empty() && len > 0 {
            let begin = begin as u64;
            let end = begin + len as u64;
            if let Some(span) = ring_span(&shared.segs.old, begin, end) {
                parts.push(span);
            }
            if let Some(span) = ring_span(&shared.segs.current, begin, end) {
                parts.push(span);
            }
            debug_assert_eq!(
                parts.iter().map(|span| span.n_frames).sum::<usize>(),
                len as usize,
                "ring spans do not cover the clipped range"
            );
        }

        Ok(ReadResult {
            buffer: self,
            clip,
            time: self.clock.time_of(epoch, begin as u64),
            duration: self.clock.duration_of(len as u64),
            parts,
        })
    }

    /// Wall-clock time of the oldest retained frame.
    pub fn tail_time(&self) -> Result<DateTime<Utc>, SnapshotError> {
        let shared = self.snapshot_entered(SNAPSHOT_TIMEOUT)?;
        Ok(shared.segs.tail_time(&self.clock))
    }

    /// Wall-clock time just past the newest retained frame.
    pub fn head_time(&self) -> Result<DateTime<Utc>, SnapshotError> {
        let shared = self.snapshot_entered(SNAPSHOT_TIMEOUT)?;
        Ok(shared.segs.head_time(&self.clock))
    }

    /// Both ends of the retained window from one consistent snapshot.
    pub fn date_time_range(&self) -> Result<(DateTime<Utc>, DateTime<Utc>), SnapshotError> {
        let shared = self.snapshot_entered(SNAPSHOT_TIMEOUT)?;
        Ok((
            shared.segs.tail_time(&self.clock),
            shared.segs.head_time(&self.clock),
        ))
    }

    /// Metadata of the newest installed block, if any block has arrived.
    pub fn latest_block(&self) -> Result<Option<LatestBlock>, SnapshotError> {
        Ok(self.snapshot(SNAPSHOT_TIMEOUT)?.latest)
    }

    /// Total frames ever produced into this buffer.
    pub fn n_frames_total(&self) -> Result<u64, SnapshotError> {
        Ok(self.snapshot(SNAPSHOT_TIMEOUT)?.n_frames_total)
    }

    /// Segment bookkeeping snapshot, for diagnostics and tests.
    pub fn segs(&self) -> Result<Segs, SnapshotError> {
        Ok(self.snapshot(SNAPSHOT_TIMEOUT)?.segs)
    }

    /// State-machine position, for diagnostics and tests.
    pub fn fill_state(&self) -> Result<FillState, SnapshotError> {
        Ok(self.snapshot(SNAPSHOT_TIMEOUT)?.state)
    }

    /// Block until the buffer head time reaches `time` or `cancel` is
    /// set. Polls; meant for scheduled reads from background tasks.
    pub fn wait_until(&self, time: DateTime<Utc>, cancel: &AtomicBool) -> WaitOutcome {
        loop {
            if cancel.load(Ordering::Relaxed) {
                return WaitOutcome::Cancelled;
            }
            if let Ok(head_time) = self.head_time() {
                if head_time >= time {
                    return WaitOutcome::Reached;
                }
            }
            std::thread::sleep(WAIT_POLL);
        }
    }

    /// Register a handler invoked after every callback (from the handoff
    /// worker), with its own id and an unsubscribe closure.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&AudioBuffer, SubscriberId, &dyn Fn()) + Send + Sync + 'static,
    {
        self.subscribers.subscribe(handler)
    }

    /// Remove a subscription. Returns false when it was already gone.
    pub fn unsubscribe(&self, subscription: &Subscription) -> bool {
        self.subscribers.unsubscribe(subscription)
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    fn snapshot(&self, timeout: Duration) -> Result<Shared, SnapshotError> {
        // SAFETY: the seqlock retry discipline discards any copy taken
        // while the producer was inside its critical section.
        self.sync
            .when_stable(timeout, || unsafe { *self.shared.get() })
    }

    fn snapshot_entered(&self, timeout: Duration) -> Result<Shared, SnapshotError> {
        self.sync
            .when_stable_and_entered(timeout, || unsafe { *self.shared.get() })
    }

    /// Raw view of the ring samples for span delivery.
    ///
    /// # Safety
    ///
    /// Only read positions named by a `ReadResult`, and only within the
    /// gap grace period; elsewhere the producer may be writing
    /// concurrently.
    pub(crate) unsafe fn ring_samples(&self) -> &[f32] {
        &*self.ring.get()
    }
}

impl fmt::Debug for AudioBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AudioBuffer")
            .field("n_ring_frames", &self.n_ring_frames)
            .field("n_data_frames", &self.n_data_frames)
            .field("n_gap_frames", &self.gap_frames())
            .field("channel_count", &self.channel_count)
            .field("frame_rate", &self.frame_rate())
            .finish_non_exhaustive()
    }
}

fn ring_span(seg: &Seg, begin: u64, end: u64) -> Option<RingSpan> {
    if !seg.is_active() {
        return None;
    }
    let clipped_begin = begin.max(seg.tail_in_stream());
    let clipped_end = end.min(seg.head_in_stream());
    if clipped_begin >= clipped_end {
        return None;
    }
    Some(RingSpan {
        index: (clipped_begin - seg.offset()) as usize,
        n_frames: (clipped_end - clipped_begin) as usize,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Simulating;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn t0() -> DateTime<Utc> {
        "2025-06-01T12:00:00Z".parse().unwrap()
    }

    /// Tiny deterministic geometry: frame rate 1000 makes one frame one
    /// millisecond.
    fn sim_config(n_data: usize, n_gap: usize, channels: usize) -> BufferConfig {
        BufferConfig {
            channel_count: channels,
            frame_rate: 1_000,
            simulating: Simulating::Frames { n_data, n_gap },
            ..BufferConfig::default()
        }
    }

    /// Interleaved ramp where the sample at global stream-sample index
    /// `k` has the value `k`, so reads are checkable bit for bit.
    fn ramp(start_frame: u64, n_frames: usize, channels: usize) -> Vec<f32> {
        let base = start_frame as usize * channels;
        (0..n_frames * channels).map(|i| (base + i) as f32).collect()
    }

    fn feed(buffer: &AudioBuffer, next_frame: &mut u64, n_frames: usize) {
        let time = buffer.frame_clock().time_of(t0(), *next_frame);
        buffer.add_system_data(
            &ramp(*next_frame, n_frames, buffer.channel_count()),
            time,
        );
        *next_frame += n_frames as u64;
    }

    fn ms(n: i64) -> TimeDelta {
        TimeDelta::milliseconds(n)
    }

    // --- seed scenarios ---

    #[test]
    fn test_s1_first_block_fits_at_start() {
        let buffer = AudioBuffer::new(&sim_config(14, 4, 1)).unwrap();
        assert_eq!(buffer.n_ring_frames(), 20);
        let mut next = 0;
        feed(&buffer, &mut next, 5);

        let result = buffer.read(t0(), ms(5)).unwrap();
        assert_eq!(result.clip(), Clip::RangeOk);
        assert_eq!(result.parts(), &[RingSpan { index: 0, n_frames: 5 }]);
        assert_eq!(result.n_samples(), 5);
        assert_eq!(result.to_vec(), ramp(0, 5, 1));

        assert_eq!(buffer.fill_state().unwrap(), FillState::AtBegin);
        let segs = buffer.segs().unwrap();
        assert_eq!((segs.current.tail(), segs.current.head()), (0, 5));
        assert!(!segs.old.is_active());
    }

    #[test]
    fn test_s2_moving_then_exchange() {
        let buffer = AudioBuffer::new(&sim_config(14, 4, 1)).unwrap();
        let mut next = 0;
        for _ in 0..4 {
            feed(&buffer, &mut next, 5);
        }

        // Block 4 lands exactly on the ring end; no exchange yet.
        let segs = buffer.segs().unwrap();
        assert_eq!((segs.current.tail(), segs.current.head()), (6, 20));
        assert!(!segs.old.is_active());
        assert_eq!(buffer.fill_state().unwrap(), FillState::Moving);

        let (tail_time, head_time) = buffer.date_time_range().unwrap();
        assert_eq!(head_time - tail_time, ms(14));

        // Block 5 would overflow; the exchange fires.
        feed(&buffer, &mut next, 5);
        let segs = buffer.segs().unwrap();
        assert_eq!(buffer.fill_state().unwrap(), FillState::Chasing);
        assert_eq!((segs.old.tail(), segs.old.head()), (11, 20));
        assert_eq!(segs.old.offset(), 0);
        assert_eq!((segs.current.tail(), segs.current.head()), (0, 5));
        assert_eq!(segs.current.offset(), 20);

        let (tail_time, head_time) = buffer.date_time_range().unwrap();
        assert_eq!(head_time - tail_time, ms(14));
        assert_eq!(head_time, t0() + ms(25));
    }

    #[test]
    fn test_s3_read_before_any_data() {
        let buffer = AudioBuffer::new(&sim_config(14, 4, 1)).unwrap();
        let result = buffer.read(t0(), ms(1)).unwrap();
        assert_eq!(result.clip(), Clip::BeforeData);
        assert_eq!(result.n_samples(), 0);
        assert!(result.parts().is_empty());
    }

    #[test]
    fn test_s4_read_straddling_old_and_current() {
        let buffer = AudioBuffer::new(&sim_config(14, 4, 1)).unwrap();
        let mut next = 0;
        for _ in 0..5 {
            feed(&buffer, &mut next, 5);
        }

        // Frames [13, 21): ends in old [11, 20), finishes in current [20, 25).
        let result = buffer.read(t0() + ms(13), ms(8)).unwrap();
        assert_eq!(result.clip(), Clip::RangeOk);
        assert_eq!(
            result.parts(),
            &[
                RingSpan { index: 13, n_frames: 7 },
                RingSpan { index: 0, n_frames: 1 },
            ]
        );
        assert_eq!(result.to_vec(), ramp(13, 8, 1));
    }

    #[test]
    #[should_panic(expected = "too large for a ring")]
    fn test_s5_oversized_block_with_tiny_gap_fails_fast() {
        let buffer = AudioBuffer::new(&sim_config(14, 2, 1)).unwrap();
        let mut next = 0;
        feed(&buffer, &mut next, 10);
    }

    #[test]
    fn test_s6_subscriber_self_unsubscribe() {
        let buffer = AudioBuffer::shared(&sim_config(1_000, 4, 1)).unwrap();
        let a_calls = Arc::new(AtomicUsize::new(0));
        let b_calls = Arc::new(AtomicUsize::new(0));

        {
            let a_calls = Arc::clone(&a_calls);
            buffer.subscribe(move |_, _, unsubscribe| {
                a_calls.fetch_add(1, Ordering::SeqCst);
                unsubscribe();
            });
        }
        {
            let b_calls = Arc::clone(&b_calls);
            buffer.subscribe(move |_, _, _| {
                b_calls.fetch_add(1, Ordering::SeqCst);
            });
        }

        let mut next = 0;
        feed(&buffer, &mut next, 5);
        wait_for(|| b_calls.load(Ordering::SeqCst) >= 1);
        feed(&buffer, &mut next, 5);
        wait_for(|| b_calls.load(Ordering::SeqCst) >= 2);

        assert_eq!(a_calls.load(Ordering::SeqCst), 1);
        assert_eq!(buffer.subscriber_count(), 1);
    }

    // --- property laws ---

    #[test]
    fn test_monotone_head_and_tail_times() {
        let buffer = AudioBuffer::new(&sim_config(14, 4, 1)).unwrap();
        let mut next = 0;
        let mut last_tail = None;
        let mut last_head = None;

        for _ in 0..30 {
            feed(&buffer, &mut next, 5);
            let (tail_time, head_time) = buffer.date_time_range().unwrap();
            if let (Some(previous_tail), Some(previous_head)) = (last_tail, last_head) {
                assert!(tail_time >= previous_tail);
                assert!(head_time >= previous_head);
            }
            last_tail = Some(tail_time);
            last_head = Some(head_time);
        }
    }

    #[test]
    fn test_retention_stays_bounded() {
        let buffer = AudioBuffer::new(&sim_config(14, 4, 1)).unwrap();
        let mut next = 0;
        for _ in 0..40 {
            feed(&buffer, &mut next, 5);
            let (tail_time, head_time) = buffer.date_time_range().unwrap();
            // Bound: retained duration + one block.
            assert!(head_time - tail_time <= ms(14 + 5));
        }
    }

    #[test]
    fn test_round_trip_across_many_exchanges() {
        let buffer = AudioBuffer::new(&sim_config(14, 4, 1)).unwrap();
        let mut next = 0;
        for _ in 0..37 {
            feed(&buffer, &mut next, 5);

            // Read back the newest 10 frames and compare bit for bit.
            let head_frame = next;
            if head_frame >= 10 {
                let start = head_frame - 10;
                let result = buffer
                    .read(buffer.frame_clock().time_of(t0(), start), ms(10))
                    .unwrap();
                assert_eq!(result.clip(), Clip::RangeOk, "at head frame {head_frame}");
                assert_eq!(result.to_vec(), ramp(start, 10, 1));
            }
        }
    }

    #[test]
    fn test_grace_period_preserves_delivered_spans() {
        let buffer = AudioBuffer::new(&sim_config(14, 4, 1)).unwrap();
        let mut next = 0;
        for _ in 0..5 {
            feed(&buffer, &mut next, 5);
        }

        // Oldest retained frames [11, 16).
        let result = buffer.read(t0() + ms(11), ms(5)).unwrap();
        assert_eq!(result.clip(), Clip::RangeOk);
        let before = result.to_vec();

        // A gap's worth of new audio may arrive without invalidating the
        // delivered spans.
        feed(&buffer, &mut next, 4);
        assert_eq!(result.to_vec(), before);
    }

    #[test]
    fn test_multichannel_round_trip() {
        let buffer = AudioBuffer::new(&sim_config(14, 4, 2)).unwrap();
        let mut next = 0;
        for _ in 0..5 {
            feed(&buffer, &mut next, 5);
        }

        let result = buffer.read(t0() + ms(13), ms(8)).unwrap();
        assert_eq!(result.clip(), Clip::RangeOk);
        assert_eq!(result.n_samples(), 16);
        assert_eq!(result.to_vec(), ramp(13, 8, 2));
    }

    // --- clipping through the public read path ---

    #[test]
    fn test_read_clips_tail_and_head() {
        let buffer = AudioBuffer::new(&sim_config(14, 4, 1)).unwrap();
        let mut next = 0;
        for _ in 0..5 {
            feed(&buffer, &mut next, 5);
        }
        // Retained: frames [11, 25).

        let result = buffer.read(t0() + ms(5), ms(10)).unwrap();
        assert_eq!(result.clip(), Clip::ClippedTail);
        assert_eq!(result.time(), t0() + ms(11));
        assert_eq!(result.duration(), ms(4));
        assert_eq!(result.to_vec(), ramp(11, 4, 1));

        let result = buffer.read(t0() + ms(20), ms(10)).unwrap();
        assert_eq!(result.clip(), Clip::ClippedHead);
        assert_eq!(result.duration(), ms(5));
        assert_eq!(result.to_vec(), ramp(20, 5, 1));

        let result = buffer.read(t0(), ms(60)).unwrap();
        assert_eq!(result.clip(), Clip::ClippedBothEnds);
        assert_eq!(result.time(), t0() + ms(11));
        assert_eq!(result.duration(), ms(14));

        let result = buffer.read(t0() + ms(40), ms(5)).unwrap();
        assert_eq!(result.clip(), Clip::AfterData);
        assert!(result.parts().is_empty());
        assert_eq!(result.duration(), TimeDelta::zero());
    }

    #[test]
    fn test_read_before_retained_window() {
        let buffer = AudioBuffer::new(&sim_config(14, 4, 1)).unwrap();
        let mut next = 0;
        for _ in 0..5 {
            feed(&buffer, &mut next, 5);
        }

        let result = buffer.read(t0(), ms(5)).unwrap();
        assert_eq!(result.clip(), Clip::BeforeData);
        assert_eq!(result.n_samples(), 0);
        assert_eq!(result.time(), t0() + ms(11));
    }

    // --- producer protocol details ---

    #[test]
    fn test_first_block_sets_the_epoch() {
        let buffer = AudioBuffer::new(&sim_config(14, 4, 1)).unwrap();
        let mut next = 0;
        feed(&buffer, &mut next, 5);
        assert_eq!(buffer.tail_time().unwrap(), t0());
        assert_eq!(buffer.head_time().unwrap(), t0() + ms(5));
    }

    #[test]
    fn test_empty_block_is_a_no_op() {
        let buffer = AudioBuffer::new(&sim_config(14, 4, 1)).unwrap();
        buffer.add_system_data(&[], t0());
        assert_eq!(buffer.fill_state().unwrap(), FillState::AtStart);
        assert_eq!(buffer.n_frames_total().unwrap(), 0);
    }

    #[test]
    #[should_panic(expected = "mid-frame")]
    fn test_partial_frame_panics() {
        let buffer = AudioBuffer::new(&sim_config(14, 4, 2)).unwrap();
        buffer.add_system_data(&[0.0; 5], t0());
    }

    #[test]
    fn test_latest_block_metadata() {
        let buffer = AudioBuffer::new(&sim_config(14, 4, 1)).unwrap();
        assert_eq!(buffer.latest_block().unwrap(), None);

        let mut next = 0;
        feed(&buffer, &mut next, 5);
        feed(&buffer, &mut next, 5);

        let latest = buffer.latest_block().unwrap().unwrap();
        assert_eq!(latest.ring_index, 5);
        assert_eq!(latest.n_frames, 5);
        assert_eq!(latest.start_time, t0() + ms(5));
        assert_eq!(buffer.n_frames_total().unwrap(), 10);
    }

    #[test]
    fn test_chasing_resolves_back_to_moving() {
        let buffer = AudioBuffer::new(&sim_config(14, 4, 1)).unwrap();
        let mut next = 0;
        for _ in 0..5 {
            feed(&buffer, &mut next, 5);
        }
        assert_eq!(buffer.fill_state().unwrap(), FillState::Chasing);

        feed(&buffer, &mut next, 5);
        assert_eq!(buffer.fill_state().unwrap(), FillState::Moving);
        assert!(!buffer.segs().unwrap().old.is_active());
    }

    #[test]
    fn test_adaptive_gap_grows_when_the_ring_affords_it() {
        let buffer = AudioBuffer::new(&sim_config(1_000, 2, 1)).unwrap();
        let mut next = 0;
        feed(&buffer, &mut next, 10);
        assert_eq!(buffer.gap_frames(), 40);
        assert_eq!(buffer.grace_duration(), ms(40));

        // Same-sized blocks do not grow the gap again.
        feed(&buffer, &mut next, 10);
        assert_eq!(buffer.gap_frames(), 40);
    }

    #[test]
    fn test_construction_rejects_gap_dominated_ring() {
        let result = AudioBuffer::new(&sim_config(1, 4, 1));
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    // --- synchronizer interaction ---

    #[test]
    fn test_read_times_out_while_producer_is_stuck() {
        let buffer = AudioBuffer::new(&sim_config(14, 4, 1)).unwrap();
        buffer.sync.enter_unstable();
        let result = buffer.read(t0(), ms(1));
        assert!(matches!(result, Err(SnapshotError::TimedOut(_))));
    }

    #[test]
    fn test_concurrent_producer_and_readers() {
        let buffer = Arc::new(AudioBuffer::new(&sim_config(500, 50, 1)).unwrap());

        let producer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                let mut next = 0u64;
                for _ in 0..2_000 {
                    feed(&buffer, &mut next, 25);
                }
            })
        };

        while !producer.is_finished() {
            // Snapshot timeouts under contention are allowed; torn
            // bookkeeping is not.
            if let Ok((tail_time, head_time)) = buffer.date_time_range() {
                assert!(tail_time <= head_time);
            }
            if let Ok(segs) = buffer.segs() {
                assert!(segs.tail_in_stream() <= segs.head_in_stream());
            }
        }
        producer.join().unwrap();

        let segs = buffer.segs().unwrap();
        assert_eq!(segs.head_in_stream(), 2_000 * 25);
        assert!(segs.head_in_stream() - segs.tail_in_stream() <= 500);
    }

    // --- wait_until ---

    #[test]
    fn test_wait_until_reaches_target() {
        let buffer = Arc::new(AudioBuffer::new(&sim_config(500, 50, 1)).unwrap());
        let cancel = AtomicBool::new(false);

        let producer = {
            let buffer = Arc::clone(&buffer);
            std::thread::spawn(move || {
                let mut next = 0u64;
                for _ in 0..10 {
                    feed(&buffer, &mut next, 25);
                    std::thread::sleep(Duration::from_millis(2));
                }
            })
        };

        let outcome = buffer.wait_until(t0() + ms(200), &cancel);
        assert_eq!(outcome, WaitOutcome::Reached);
        assert!(buffer.head_time().unwrap() >= t0() + ms(200));
        producer.join().unwrap();
    }

    #[test]
    fn test_wait_until_observes_cancellation() {
        let buffer = Arc::new(AudioBuffer::new(&sim_config(14, 4, 1)).unwrap());
        let cancel = Arc::new(AtomicBool::new(false));

        let canceller = {
            let cancel = Arc::clone(&cancel);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(10));
                cancel.store(true, Ordering::Relaxed);
            })
        };

        let outcome = buffer.wait_until(t0() + ms(1_000), &cancel);
        assert_eq!(outcome, WaitOutcome::Cancelled);
        canceller.join().unwrap();
    }

    fn wait_for(check: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while !check() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            std::thread::sleep(Duration::from_millis(1));
        }
    }
}
