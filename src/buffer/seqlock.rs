//! Writer/reader synchronization for ring snapshots.
//!
//! A seqlock-style primitive: the single producer brackets every mutation
//! of the shared segment bookkeeping with `enter_unstable`/`leave_unstable`,
//! and readers run a closure between two reads of the counter word,
//! retrying whenever the producer was (or became) active. The producer
//! never waits; readers only ever pay with retries.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Reader-side failure: a stable snapshot could not be taken in time.
///
/// This never reaches the producer; it is surfaced to whichever consumer
/// asked for the snapshot.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("timed out taking a stable snapshot: {0}")]
    TimedOut(&'static str),
}

/// Packed counter word: low 16 bits count critical-section entries, high
/// 16 bits count exits. Equal halves mean the producer is outside its
/// critical section.
fn unpack(word: u32) -> (u16, u16) {
    (word as u16, (word >> 16) as u16)
}

fn pack(enters: u16, leaves: u16) -> u32 {
    u32::from(enters) | (u32::from(leaves) << 16)
}

/// Seqlock guarding the producer's segment bookkeeping.
///
/// Single-writer by contract: only the audio callback calls
/// `enter_unstable`/`leave_unstable`, so plain load/store pairs on the
/// word are race-free on the writer side. Readers see the whole word in
/// one sequentially consistent load.
#[derive(Debug, Default)]
pub struct Synchronizer {
    word: AtomicU32,
    entered: AtomicBool,
}

impl Synchronizer {
    pub fn new() -> Self {
        Self {
            word: AtomicU32::new(0),
            entered: AtomicBool::new(false),
        }
    }

    /// Writer call: mark the start of a producer critical section.
    pub fn enter_unstable(&self) {
        let (enters, leaves) = unpack(self.word.load(Ordering::SeqCst));
        debug_assert_eq!(enters, leaves, "producer re-entered its critical section");
        self.word
            .store(pack(enters.wrapping_add(1), leaves), Ordering::SeqCst);
    }

    /// Writer call: mark the end of a producer critical section.
    pub fn leave_unstable(&self) {
        let (enters, leaves) = unpack(self.word.load(Ordering::SeqCst));
        debug_assert_eq!(
            enters,
            leaves.wrapping_add(1),
            "leave_unstable without matching enter_unstable"
        );
        self.word
            .store(pack(enters, leaves.wrapping_add(1)), Ordering::SeqCst);
        self.entered.store(true, Ordering::Release);
    }

    /// True once at least one producer critical section has completed.
    pub fn has_entered(&self) -> bool {
        self.entered.load(Ordering::Acquire)
    }

    /// Reader call: run `f` while the producer is outside its critical
    /// section, retrying until a run completes with no producer entry in
    /// between. `f` may run several times; only the last result is kept.
    pub fn when_stable<T>(
        &self,
        timeout: Duration,
        mut f: impl FnMut() -> T,
    ) -> Result<T, SnapshotError> {
        let deadline = Instant::now() + timeout;
        let mut spins = 0u32;
        loop {
            let (enters, leaves) = unpack(self.word.load(Ordering::SeqCst));
            if enters != leaves {
                if Instant::now() >= deadline {
                    return Err(SnapshotError::TimedOut(
                        "writer stayed inside its critical section",
                    ));
                }
                backoff(&mut spins);
                continue;
            }

            let value = f();

            let (enters_after, leaves_after) = unpack(self.word.load(Ordering::SeqCst));
            if enters_after != enters {
                // Writer entered while f ran; the result may be torn.
                // (16-bit counters alias only after 65536 full producer
                // cycles within one run of f, far beyond callback rates.)
                if Instant::now() >= deadline {
                    return Err(SnapshotError::TimedOut(
                        "writer kept interrupting the snapshot",
                    ));
                }
                backoff(&mut spins);
                continue;
            }
            assert_eq!(
                leaves_after, enters_after,
                "synchronizer word advanced exits without entries: second producer?"
            );
            return Ok(value);
        }
    }

    /// As [`when_stable`](Self::when_stable), but first waits until at
    /// least one producer critical section has completed, so the snapshot
    /// is guaranteed to describe real data.
    pub fn when_stable_and_entered<T>(
        &self,
        timeout: Duration,
        f: impl FnMut() -> T,
    ) -> Result<T, SnapshotError> {
        let deadline = Instant::now() + timeout;
        let mut spins = 0u32;
        while !self.has_entered() {
            if Instant::now() >= deadline {
                return Err(SnapshotError::TimedOut("no audio block has arrived yet"));
            }
            backoff(&mut spins);
        }
        self.when_stable(deadline.saturating_duration_since(Instant::now()), f)
    }
}

fn backoff(spins: &mut u32) {
    *spins += 1;
    if *spins % 64 == 0 {
        std::thread::yield_now();
    } else {
        std::hint::spin_loop();
    }
}
