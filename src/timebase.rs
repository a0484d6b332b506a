//! Frame/time arithmetic at the configured frame rate.
//!
//! The ring buffer addresses audio by frame index into an unbounded logical
//! stream; everything user-facing speaks wall-clock time. This module owns
//! the conversion between the two, plus the clock abstraction that lets
//! tests drive capture with synthetic timestamps.

use chrono::{DateTime, TimeDelta, Utc};
use std::sync::Mutex;

const NANOS_PER_SEC: i128 = 1_000_000_000;

/// Converts between frame counts and wall-clock durations at a fixed rate.
///
/// All conversions round to the nearest unit so that
/// `n_frames_of(duration_of(n)) == n` for any frame count that fits the
/// retained window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameClock {
    frame_rate: u32,
}

impl FrameClock {
    pub fn new(frame_rate: u32) -> Self {
        debug_assert!(frame_rate > 0, "frame rate must be positive");
        Self { frame_rate }
    }

    pub fn frame_rate(&self) -> u32 {
        self.frame_rate
    }

    /// Duration spanned by `n_frames` frames.
    pub fn duration_of(&self, n_frames: u64) -> TimeDelta {
        let rate = i128::from(self.frame_rate);
        let nanos = (i128::from(n_frames) * NANOS_PER_SEC + rate / 2) / rate;
        TimeDelta::nanoseconds(nanos as i64)
    }

    /// Number of frames spanned by `duration`.
    ///
    /// Negative durations yield negative frame counts; callers clamp as
    /// appropriate for their context.
    pub fn n_frames_of(&self, duration: TimeDelta) -> i64 {
        let nanos = i128::from(duration.num_nanoseconds().unwrap_or_else(|| {
            if duration > TimeDelta::zero() {
                i64::MAX
            } else {
                i64::MIN
            }
        }));
        let rate = i128::from(self.frame_rate);
        // Round half away from zero via euclidean division so negative
        // durations mirror positive ones.
        let scaled = nanos * rate;
        let frames = if scaled >= 0 {
            (scaled + NANOS_PER_SEC / 2) / NANOS_PER_SEC
        } else {
            (scaled - NANOS_PER_SEC / 2) / NANOS_PER_SEC
        };
        frames as i64
    }

    /// Wall-clock instant of `stream_index` frames past `epoch`.
    pub fn time_of(&self, epoch: DateTime<Utc>, stream_index: u64) -> DateTime<Utc> {
        epoch + self.duration_of(stream_index)
    }
}

/// Source of wall-clock time.
///
/// Production code uses [`SystemClock`]; tests inject a [`ManualClock`] so
/// capture scenarios are deterministic.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// The real wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    pub fn starting_at(now: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(now),
        }
    }

    pub fn advance(&self, delta: TimeDelta) {
        let mut now = self.now.lock().unwrap();
        *now += delta;
    }

    pub fn set(&self, to: DateTime<Utc>) {
        *self.now.lock().unwrap() = to;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap()
    }
}
