//! The real-time ingestion core: seqlock, segment pair, history ring,
//! callback handoff, and subscriber fan-out.

pub mod audio_buffer;
pub mod handoff;
pub mod read;
pub mod seg;
pub mod seqlock;
pub mod subscribers;

pub use audio_buffer::{AudioBuffer, BufferError, LatestBlock, WaitOutcome, SNAPSHOT_TIMEOUT};
pub use handoff::CallbackHandoff;
pub use read::{clip_range, Clip, ReadResult, RingSpan};
pub use seg::{FillState, Seg, Segs};
pub use seqlock::{SnapshotError, Synchronizer};
pub use subscribers::{SubscriberId, SubscriberList, Subscription};
