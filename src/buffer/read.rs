//! Read-side results: range clipping and span delivery.
//!
//! A consumer asks for `(time, duration)`; the buffer answers with a
//! [`ReadResult`]: how the request intersected the retained data
//! ([`Clip`]) and at most two [`RingSpan`]s referencing live ring
//! positions: two when the window straddles the old/current segment
//! boundary, ordered oldest first.

use super::AudioBuffer;
use chrono::{DateTime, TimeDelta, Utc};
use std::ops::{Add, Sub};

/// How a requested range intersected the available one.
///
/// `BeforeData` and `AfterData` are normal outcomes, not errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Clip {
    /// The request ends before the first retained frame.
    BeforeData,
    /// The request begins after the newest retained frame.
    AfterData,
    /// The request started before the retained window; its head survived.
    ClippedTail,
    /// The request ran past the newest data; its tail survived.
    ClippedHead,
    /// The request enclosed the retained window on both sides.
    ClippedBothEnds,
    /// The request fell entirely inside the retained window.
    RangeOk,
}

impl Clip {
    /// True when the intersection is empty.
    pub fn is_empty(&self) -> bool {
        matches!(self, Clip::BeforeData | Clip::AfterData)
    }
}

/// Intersect a wanted `(begin, length)` range with an available one.
///
/// Works for any coordinate type with `T + L -> T` and `T - T -> L`, which
/// covers both stream frame indices and `(DateTime, TimeDelta)` windows.
pub fn clip_range<T, L>(want_begin: T, want_len: L, have_begin: T, have_len: L) -> (Clip, T, L)
where
    T: Copy + PartialOrd + Add<L, Output = T> + Sub<Output = L>,
    L: Copy,
{
    let want_end = want_begin + want_len;
    let have_end = have_begin + have_len;
    let zero = have_begin - have_begin;

    if want_end <= have_begin {
        (Clip::BeforeData, have_begin, zero)
    } else if have_end <= want_begin {
        (Clip::AfterData, have_end, zero)
    } else if want_begin < have_begin && have_end < want_end {
        (Clip::ClippedBothEnds, have_begin, have_end - have_begin)
    } else if want_begin < have_begin {
        (Clip::ClippedTail, have_begin, want_end - have_begin)
    } else if have_end < want_end {
        (Clip::ClippedHead, want_begin, have_end - want_begin)
    } else {
        (Clip::RangeOk, want_begin, want_end - want_begin)
    }
}

/// A run of frames inside the physical ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingSpan {
    /// Ring frame index of the first frame.
    pub index: usize,
    pub n_frames: usize,
}

/// Outcome of [`AudioBuffer::read`].
///
/// The spans reference positions in the live ring that the producer will
/// not overwrite for at least the gap duration; consume or copy them
/// within that grace period.
#[derive(Debug)]
pub struct ReadResult<'a> {
    pub(crate) buffer: &'a AudioBuffer,
    pub(crate) clip: Clip,
    pub(crate) time: DateTime<Utc>,
    pub(crate) duration: TimeDelta,
    pub(crate) parts: Vec<RingSpan>,
}

impl ReadResult<'_> {
    pub fn clip(&self) -> Clip {
        self.clip
    }

    /// Start of the window actually delivered (after clipping).
    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// Length of the window actually delivered (after clipping).
    pub fn duration(&self) -> TimeDelta {
        self.duration
    }

    /// The 0–2 ring spans, oldest first.
    pub fn parts(&self) -> &[RingSpan] {
        &self.parts
    }

    pub fn channel_count(&self) -> usize {
        self.buffer.channel_count()
    }

    pub fn frame_rate(&self) -> u32 {
        self.buffer.frame_rate()
    }

    pub fn n_frames(&self) -> usize {
        self.parts.iter().map(|span| span.n_frames).sum()
    }

    pub fn n_samples(&self) -> usize {
        self.n_frames() * self.buffer.channel_count()
    }

    /// Iterate the parts in order, calling
    /// `f(src_sample_index, dst_sample_index, n_samples)` once per span.
    /// Destination indices accumulate so the parts concatenate into one
    /// contiguous output.
    pub fn deliver(&self, mut f: impl FnMut(usize, usize, usize)) {
        let channels = self.buffer.channel_count();
        let mut dst = 0;
        for span in &self.parts {
            let n_samples = span.n_frames * channels;
            f(span.index * channels, dst, n_samples);
            dst += n_samples;
        }
    }

    /// Copy the referenced samples out of the ring into a fresh vector.
    pub fn to_vec(&self) -> Vec<f32> {
        let mut out = vec![0.0f32; self.n_samples()];
        // SAFETY: the producer leaves delivered spans untouched for the
        // gap grace period, and we copy immediately.
        let ring = unsafe { self.buffer.ring_samples() };
        self.deliver(|src, dst, n| out[dst..dst + n].copy_from_slice(&ring[src..src + n]));
        out
    }
}
