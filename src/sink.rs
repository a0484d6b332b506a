//! WAV capture sink.
//!
//! One consumer of ring read results: copies each delivered window out of
//! the ring (within the grace period) and appends it to a 32-bit float
//! WAV file.

use crate::buffer::ReadResult;
use hound::{SampleFormat, WavSpec, WavWriter};
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),
}

/// Append-only WAV writer fed from [`ReadResult`]s.
pub struct WavSink {
    writer: WavWriter<BufWriter<File>>,
    samples_written: usize,
}

impl WavSink {
    pub fn create(path: &Path, channel_count: u16, frame_rate: u32) -> Result<Self, SinkError> {
        let spec = WavSpec {
            channels: channel_count,
            sample_rate: frame_rate,
            bits_per_sample: 32,
            sample_format: SampleFormat::Float,
        };
        Ok(Self {
            writer: WavWriter::create(path, spec)?,
            samples_written: 0,
        })
    }

    /// Append the samples referenced by `result`. Returns the number of
    /// samples written (zero for empty windows).
    pub fn append(&mut self, result: &ReadResult) -> Result<usize, SinkError> {
        let samples = result.to_vec();
        for &sample in &samples {
            self.writer.write_sample(sample)?;
        }
        debug!(
            "Appended {} samples ({:?}) to WAV sink",
            samples.len(),
            result.clip()
        );
        self.samples_written += samples.len();
        Ok(samples.len())
    }

    pub fn samples_written(&self) -> usize {
        self.samples_written
    }

    /// Flush headers and close the file.
    pub fn finalize(self) -> Result<(), SinkError> {
        self.writer.finalize()?;
        Ok(())
    }
}
