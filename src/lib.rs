//! Audiosonde library exports.
//!
//! The core is the [`buffer`] module: a lock-free audio history ring fed
//! by a soundcard callback and read by background consumers. The
//! surrounding modules supply the capture adapter, WAV sink, metering,
//! configuration, and the frame/time arithmetic they all share.

pub mod buffer;
pub mod capture;
pub mod config;
pub mod meter;
pub mod panic_handler;
pub mod sink;
pub mod timebase;

// Re-export commonly used types for convenience
pub use buffer::{
    AudioBuffer, BufferError, Clip, LatestBlock, ReadResult, RingSpan, SnapshotError,
    Subscription, WaitOutcome,
};
pub use config::{BufferConfig, Config, ConfigError, Simulating};
pub use timebase::{Clock, FrameClock, ManualClock, SystemClock};
