//! Fuzz target for history-ring operations.
//!
//! Drives arbitrary feed/read sequences through the public API to find
//! edge cases in the segment state machine and range clipping.

#![no_main]

use arbitrary::Arbitrary;
use audiosonde::{AudioBuffer, BufferConfig, Simulating};
use chrono::{DateTime, TimeDelta, Utc};
use libfuzzer_sys::fuzz_target;

/// Operations that can be performed on the ring.
#[derive(Arbitrary, Debug)]
enum Operation {
    /// Install a callback block.
    Feed { n_frames: u16 },
    /// Read a time window relative to the stream epoch.
    Read { offset_ms: i32, duration_ms: u16 },
    /// Snapshot the retained time range.
    Range,
}

fuzz_target!(|ops: Vec<Operation>| {
    let config = BufferConfig {
        channel_count: 1,
        frame_rate: 1_000,
        simulating: Simulating::Frames {
            n_data: 2_000,
            n_gap: 200,
        },
        ..BufferConfig::default()
    };
    let buffer = AudioBuffer::new(&config).unwrap();
    let epoch: DateTime<Utc> = DateTime::UNIX_EPOCH;
    let mut next_frame: u64 = 0;

    for op in ops {
        match op {
            Operation::Feed { n_frames } => {
                // Stay below the adaptive-gap trigger so geometry panics
                // (which are deliberate) don't drown real findings.
                let n = usize::from(n_frames) % 100;
                let samples = vec![0.5f32; n];
                buffer.add_system_data(&samples, epoch + buffer.duration_of(next_frame));
                next_frame += n as u64;
            }
            Operation::Read {
                offset_ms,
                duration_ms,
            } => {
                let time = epoch + TimeDelta::milliseconds(i64::from(offset_ms));
                let duration = TimeDelta::milliseconds(i64::from(duration_ms));
                if let Ok(result) = buffer.read(time, duration) {
                    // Delivered spans must cover exactly the clipped window.
                    let _ = result.to_vec();
                    assert!(result.parts().len() <= 2);
                }
            }
            Operation::Range => {
                if let Ok((tail_time, head_time)) = buffer.date_time_range() {
                    assert!(tail_time <= head_time);
                }
            }
        }
    }
});
