//! Streaming noise detector.
//!
//! Per frame: RMS over normalised samples, mapped to a 0..100 level with a
//! −60 dB silence floor. Frames at or above the threshold accumulate loud
//! time and track the peak; any quieter frame resets both. An event fires
//! once the loud time reaches `min_duration_ms` and the cooldown since the
//! previous event has elapsed; both accumulators reset on emission.
//!
//! The detector is clocked by the frames themselves, never by wall time, so
//! identical input produces an identical event sequence.

use tracing::debug;

use cribcall_core::config::NoiseSettings;
use cribcall_core::types::{epoch_ms, DetectedNoise};

pub const DEFAULT_SAMPLE_RATE: u32 = 16_000;
/// 20 ms of mono 16 kHz audio.
pub const DEFAULT_FRAME_SAMPLES: usize = 320;

/// RMS of signed 16-bit samples, normalised to 0.0..1.0.
pub fn rms(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples
        .iter()
        .map(|&s| {
            let x = s as f64 / 32768.0;
            x * x
        })
        .sum();
    (sum_squares / samples.len() as f64).sqrt() as f32
}

/// `clamp((20·log10(rms) + 60) · 100 / 60, 0, 100)` — 0 at the −60 dB
/// silence floor, 100 at full scale.
pub fn level_from_rms(rms: f32) -> f32 {
    if rms <= 0.0 {
        return 0.0;
    }
    let db = 20.0 * rms.log10();
    ((db + 60.0) * 100.0 / 60.0).clamp(0.0, 100.0)
}

pub struct SoundDetector {
    settings: NoiseSettings,
    sample_rate: u32,
    /// Wall-clock epoch of frame 0; event timestamps are epoch + frame clock.
    epoch_ms: u64,
    clock_ms: i64,
    loud_duration_ms: u64,
    peak_level: f32,
    last_event_ms: i64,
}

impl SoundDetector {
    pub fn new(settings: NoiseSettings, sample_rate: u32) -> Self {
        Self::with_epoch(settings, sample_rate, epoch_ms())
    }

    /// Fixed epoch constructor: timestamps become a pure function of the
    /// input frames.
    pub fn with_epoch(settings: NoiseSettings, sample_rate: u32, epoch_ms: u64) -> Self {
        let cooldown_ms = settings.cooldown_seconds as i64 * 1000;
        Self {
            settings,
            sample_rate,
            epoch_ms,
            clock_ms: 0,
            loud_duration_ms: 0,
            peak_level: 0.0,
            // The first qualifying event may fire immediately.
            last_event_ms: -cooldown_ms,
        }
    }

    /// Feed one mono i16 frame; returns an event when one fires.
    ///
    /// Invalid frames (empty) are logged and dropped — the pipeline never
    /// terminates on bad input.
    pub fn process_frame(&mut self, samples: &[i16]) -> Option<DetectedNoise> {
        if samples.is_empty() {
            debug!("[detector] Dropped empty frame");
            return None;
        }

        let frame_ms = (samples.len() as u64 * 1000) / self.sample_rate as u64;
        self.clock_ms += frame_ms as i64;

        let level = level_from_rms(rms(samples));
        if level >= self.settings.threshold {
            self.loud_duration_ms += frame_ms;
            if level > self.peak_level {
                self.peak_level = level;
            }
        } else {
            self.loud_duration_ms = 0;
            self.peak_level = 0.0;
        }

        let cooldown_ms = self.settings.cooldown_seconds as i64 * 1000;
        if self.loud_duration_ms >= self.settings.min_duration_ms
            && self.clock_ms - self.last_event_ms >= cooldown_ms
        {
            let event = DetectedNoise {
                timestamp_ms: self.epoch_ms + self.clock_ms as u64,
                peak_level: self.peak_level,
            };
            self.loud_duration_ms = 0;
            self.peak_level = 0.0;
            self.last_event_ms = self.clock_ms;
            return Some(event);
        }
        None
    }
}
