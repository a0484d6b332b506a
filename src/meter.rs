//! Input level metering.

/// RMS level of `samples` in dBFS. Empty input reads as silence.
pub fn rms_db(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return f32::NEG_INFINITY;
    }
    let sum_of_squares: f32 = samples.iter().map(|sample| sample * sample).sum();
    let rms = (sum_of_squares / samples.len() as f32).sqrt();
    20.0 * rms.max(1e-10).log10()
}

/// Peak absolute level of `samples` in dBFS.
pub fn peak_db(samples: &[f32]) -> f32 {
    let peak = samples.iter().fold(0.0f32, |max, s| max.max(s.abs()));
    20.0 * peak.max(1e-10).log10()
}
