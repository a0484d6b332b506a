//! End-to-end exercise of the public crate surface without hardware: a
//! simulated driver thread installs blocks while consumers read windows,
//! receive broadcasts, and persist audio through the WAV sink.

use audiosonde::buffer::WaitOutcome;
use audiosonde::sink::WavSink;
use audiosonde::{AudioBuffer, BufferConfig, Clip, Simulating};
use chrono::{DateTime, TimeDelta, Utc};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn t0() -> DateTime<Utc> {
    "2025-06-01T08:00:00Z".parse().unwrap()
}

fn sim_config(n_data: usize, n_gap: usize) -> BufferConfig {
    BufferConfig {
        channel_count: 1,
        frame_rate: 1_000,
        simulating: Simulating::Frames { n_data, n_gap },
        ..BufferConfig::default()
    }
}

/// Ramp where the sample at stream frame `k` has the value `k`.
fn ramp(start_frame: u64, n_frames: usize) -> Vec<f32> {
    (0..n_frames)
        .map(|i| (start_frame as usize + i) as f32)
        .collect()
}

#[test]
fn test_simulated_capture_session() {
    let buffer = AudioBuffer::shared(&sim_config(2_000, 200)).unwrap();
    let broadcasts = Arc::new(AtomicUsize::new(0));
    {
        let broadcasts = Arc::clone(&broadcasts);
        buffer.subscribe(move |buffer, _, _| {
            broadcasts.fetch_add(1, Ordering::SeqCst);
            // Subscribers see a buffer with data by the time they run.
            assert!(buffer.head_time().is_ok());
        });
    }

    // Simulated driver: 100 blocks of 20 frames, paced like a callback.
    let driver = {
        let buffer = Arc::clone(&buffer);
        thread::spawn(move || {
            let clock = buffer.frame_clock();
            for block in 0..100u64 {
                let start_frame = block * 20;
                buffer.add_system_data(
                    &ramp(start_frame, 20),
                    clock.time_of(t0(), start_frame),
                );
                thread::sleep(Duration::from_micros(500));
            }
        })
    };

    // Scheduled read: wait for the first second of audio, then pull a
    // window out of the middle and check it bit for bit.
    let cancel = AtomicBool::new(false);
    let outcome = buffer.wait_until(t0() + TimeDelta::seconds(1), &cancel);
    assert_eq!(outcome, WaitOutcome::Reached);

    let result = buffer
        .read(t0() + TimeDelta::milliseconds(400), TimeDelta::milliseconds(500))
        .unwrap();
    assert_eq!(result.clip(), Clip::RangeOk);
    assert_eq!(result.to_vec(), ramp(400, 500));

    driver.join().unwrap();

    // Everything produced, nothing torn, broadcasts flowed.
    assert_eq!(buffer.n_frames_total().unwrap(), 2_000);
    assert!(broadcasts.load(Ordering::SeqCst) > 0);
    assert_eq!(buffer.head_time().unwrap(), t0() + TimeDelta::seconds(2));
}

#[test]
fn test_recorded_window_survives_the_trip_to_disk() {
    let buffer = AudioBuffer::shared(&sim_config(2_000, 200)).unwrap();
    let clock = buffer.frame_clock();
    for block in 0..50u64 {
        let start_frame = block * 20;
        buffer.add_system_data(&ramp(start_frame, 20), clock.time_of(t0(), start_frame));
    }

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("session.wav");
    let mut sink = WavSink::create(&path, 1, 1_000).unwrap();

    // Append two adjacent windows, as the chunked recorder does.
    for window_start in [0i64, 500] {
        let result = buffer
            .read(
                t0() + TimeDelta::milliseconds(window_start),
                TimeDelta::milliseconds(500),
            )
            .unwrap();
        assert_eq!(result.clip(), Clip::RangeOk);
        sink.append(&result).unwrap();
    }
    assert_eq!(sink.samples_written(), 1_000);
    sink.finalize().unwrap();

    let mut reader = hound::WavReader::open(&path).unwrap();
    let read_back: Vec<f32> = reader.samples::<f32>().map(|s| s.unwrap()).collect();
    assert_eq!(read_back, ramp(0, 1_000));
}

#[test]
fn test_late_subscriber_only_sees_new_broadcasts() {
    let buffer = AudioBuffer::shared(&sim_config(2_000, 200)).unwrap();
    let clock = buffer.frame_clock();

    buffer.add_system_data(&ramp(0, 20), clock.time_of(t0(), 0));
    // Let the first broadcast drain before subscribing.
    thread::sleep(Duration::from_millis(50));

    let calls = Arc::new(AtomicUsize::new(0));
    let subscription = {
        let calls = Arc::clone(&calls);
        buffer.subscribe(move |_, _, _| {
            calls.fetch_add(1, Ordering::SeqCst);
        })
    };
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    buffer.add_system_data(&ramp(20, 20), clock.time_of(t0(), 20));
    let deadline = std::time::Instant::now() + Duration::from_secs(2);
    while calls.load(Ordering::SeqCst) == 0 {
        assert!(std::time::Instant::now() < deadline, "broadcast never arrived");
        thread::sleep(Duration::from_millis(1));
    }

    assert!(buffer.unsubscribe(&subscription));
}
