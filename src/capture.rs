//! Soundcard capture using cpal.
//!
//! Thin adapter between the driver callback and the history ring: each
//! input block is forwarded to [`AudioBuffer::add_system_data`] with a
//! wall-clock block time derived from the stream epoch plus frames
//! elapsed, so ring timestamps and ring arithmetic agree exactly.

use crate::buffer::AudioBuffer;
use crate::timebase::Clock;
use chrono::{DateTime, Utc};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, Stream, StreamConfig};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("No audio input device found")]
    NoInputDevice,

    #[error("Input device '{0}' not found")]
    DeviceNotFound(String),

    #[error("Failed to enumerate input devices: {0}")]
    DeviceEnumeration(String),

    #[error("Failed to build audio stream: {0}")]
    StreamBuildFailed(String),

    #[error("Failed to start audio stream: {0}")]
    StreamStartFailed(String),
}

/// A running input stream feeding one [`AudioBuffer`].
///
/// Capture stops when this is dropped.
pub struct Capture {
    _stream: Stream,
    device_name: String,
}

impl Capture {
    /// Open `device_name` (or the default input device) with the ring's
    /// channel count and frame rate and start streaming into `buffer`.
    ///
    /// The stream epoch is taken from `clock` at the first callback; every
    /// block time thereafter is epoch + frames-elapsed, which keeps the
    /// time model identical to the ring's own frame arithmetic.
    pub fn start(
        buffer: Arc<AudioBuffer>,
        device_name: Option<&str>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, CaptureError> {
        let device = find_device(device_name)?;
        let resolved_name = device.name().unwrap_or_else(|_| "unknown".to_string());
        info!("Using audio input device: {}", resolved_name);

        let config = StreamConfig {
            channels: buffer.channel_count() as u16,
            sample_rate: buffer.frame_rate(),
            buffer_size: cpal::BufferSize::Default,
        };

        let channels = buffer.channel_count();
        let frame_clock = buffer.frame_clock();
        let mut epoch: Option<DateTime<Utc>> = None;
        let mut frames_seen: u64 = 0;

        let err_fn = |err| error!("Audio stream error: {}", err);
        let stream = device
            .build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let epoch = *epoch.get_or_insert_with(|| clock.now());
                    let block_time = frame_clock.time_of(epoch, frames_seen);
                    buffer.add_system_data(data, block_time);
                    frames_seen += (data.len() / channels) as u64;
                },
                err_fn,
                None,
            )
            .map_err(|e| CaptureError::StreamBuildFailed(e.to_string()))?;

        stream
            .play()
            .map_err(|e| CaptureError::StreamStartFailed(e.to_string()))?;

        info!(
            "Capture started: {} Hz, {} channel(s)",
            frame_clock.frame_rate(),
            channels
        );

        Ok(Self {
            _stream: stream,
            device_name: resolved_name,
        })
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    /// Names of all available input devices.
    pub fn list_devices() -> Vec<String> {
        let host = cpal::default_host();
        host.input_devices()
            .map(|devices| devices.filter_map(|d| d.name().ok()).collect())
            .unwrap_or_default()
    }
}

fn find_device(device_name: Option<&str>) -> Result<Device, CaptureError> {
    let host = cpal::default_host();
    match device_name {
        None => host.default_input_device().ok_or(CaptureError::NoInputDevice),
        Some(wanted) => {
            let mut devices = host
                .input_devices()
                .map_err(|e| CaptureError::DeviceEnumeration(e.to_string()))?;
            devices
                .find(|d| d.name().map(|name| name == wanted).unwrap_or(false))
                .ok_or_else(|| CaptureError::DeviceNotFound(wanted.to_string()))
        }
    }
}
