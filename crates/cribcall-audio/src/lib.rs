//! Bounded real-time sound detection.
//!
//! A blocking producer thread (the capture back-end) feeds fixed-size PCM
//! frames through an SPSC channel into the async side, where
//! [`SoundDetector`] turns them into at-most-once [`DetectedNoise`] events:
//! RMS → dB level, a loud-duration accumulator, and a cooldown between
//! emissions.

pub mod capture;
pub mod detector;

pub use capture::AudioSource;
pub use detector::{SoundDetector, DEFAULT_FRAME_SAMPLES, DEFAULT_SAMPLE_RATE};
