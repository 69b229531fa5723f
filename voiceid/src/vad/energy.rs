//! Energy-threshold VAD engine.
//!
//! Classifies a frame as speech when its RMS level in dBFS exceeds a fixed
//! threshold. No model assets required; this is the default engine when no
//! Silero model path is configured.

use crate::error::Result;

use super::VadEngine;

/// Default decision threshold in dBFS. Typical speech sits well above
/// -40 dBFS; room noise well below.
const DEFAULT_THRESHOLD_DB: f32 = -40.0;

/// RMS-energy speech classifier.
pub struct EnergyVad {
    threshold_db: f32,
}

impl EnergyVad {
    /// Creates an engine with the default -40 dBFS threshold.
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_THRESHOLD_DB)
    }

    /// Creates an engine with a custom dBFS threshold.
    pub fn with_threshold(threshold_db: f32) -> Self {
        Self { threshold_db }
    }
}

impl Default for EnergyVad {
    fn default() -> Self {
        Self::new()
    }
}

impl VadEngine for EnergyVad {
    fn process(&mut self, frame: &[i16]) -> Result<bool> {
        if frame.is_empty() {
            return Ok(false);
        }
        let sum_squares: i64 = frame
            .iter()
            .map(|&s| {
                let s = s as i64;
                s * s
            })
            .sum();
        let rms = ((sum_squares as f64 / frame.len() as f64).sqrt() / 32768.0) as f32;
        let dbfs = if rms <= 1e-10 {
            -100.0
        } else {
            20.0 * rms.log10()
        };
        Ok(dbfs > self.threshold_db)
    }
}
