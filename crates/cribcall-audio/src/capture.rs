//! Capture back-ends behind a small set of tagged variants.
//!
//! Platform capture (ALSA, Android AudioRecord, …) lives outside this crate;
//! only the PCM contract is fixed here: mono signed 16-bit frames at a fixed
//! sample rate. The variants below stand in for real back-ends — `Silence`
//! for production without a microphone, `SyntheticBursts` as the test and
//! demo seam.

use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, info};

/// Frame channel depth. Single producer (the capture thread), single
/// consumer (the detector loop).
const RING_CAPACITY: usize = 32;

#[derive(Debug, Clone)]
pub enum AudioSource {
    /// Emits all-zero frames at the nominal rate.
    Silence { sample_rate: u32, frame_samples: usize },
    /// Square-wave bursts of `burst_ms` every `interval_ms`.
    SyntheticBursts {
        sample_rate: u32,
        frame_samples: usize,
        amplitude: i16,
        burst_ms: u64,
        interval_ms: u64,
    },
}

impl AudioSource {
    pub fn sample_rate(&self) -> u32 {
        match self {
            Self::Silence { sample_rate, .. } | Self::SyntheticBursts { sample_rate, .. } => {
                *sample_rate
            }
        }
    }

    fn frame_samples(&self) -> usize {
        match self {
            Self::Silence { frame_samples, .. } | Self::SyntheticBursts { frame_samples, .. } => {
                *frame_samples
            }
        }
    }

    /// The frame the source produces at a given position of its clock.
    /// Pure, so the synthetic pattern is testable without threads.
    pub fn frame_at(&self, clock_ms: u64) -> Vec<i16> {
        match self {
            Self::Silence { frame_samples, .. } => vec![0; *frame_samples],
            Self::SyntheticBursts {
                frame_samples,
                amplitude,
                burst_ms,
                interval_ms,
                ..
            } => {
                let in_burst = clock_ms % interval_ms < *burst_ms;
                if in_burst {
                    (0..*frame_samples)
                        .map(|i| if i % 2 == 0 { *amplitude } else { -*amplitude })
                        .collect()
                } else {
                    vec![0; *frame_samples]
                }
            }
        }
    }

    /// Start the blocking producer thread. Frames arrive on the returned
    /// channel paced at real time; the thread exits once the receiver drops.
    pub fn spawn(self) -> mpsc::Receiver<Vec<i16>> {
        let (tx, rx) = mpsc::channel(RING_CAPACITY);
        let frame_ms = (self.frame_samples() as u64 * 1000) / self.sample_rate() as u64;
        info!(
            "[audio] Capture source started ({} Hz, {} ms frames)",
            self.sample_rate(),
            frame_ms
        );

        std::thread::spawn(move || {
            let mut clock_ms: u64 = 0;
            loop {
                let frame = self.frame_at(clock_ms);
                clock_ms += frame_ms;
                if tx.blocking_send(frame).is_err() {
                    debug!("[audio] Frame channel closed; capture thread exiting");
                    return;
                }
                std::thread::sleep(Duration::from_millis(frame_ms));
            }
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detector::{DEFAULT_FRAME_SAMPLES, DEFAULT_SAMPLE_RATE};

    #[test]
    fn silence_is_all_zero() {
        let source = AudioSource::Silence {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_samples: DEFAULT_FRAME_SAMPLES,
        };
        let frame = source.frame_at(0);
        assert_eq!(frame.len(), DEFAULT_FRAME_SAMPLES);
        assert!(frame.iter().all(|&s| s == 0));
    }

    #[test]
    fn bursts_follow_the_cycle() {
        let source = AudioSource::SyntheticBursts {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_samples: DEFAULT_FRAME_SAMPLES,
            amplitude: 10_000,
            burst_ms: 200,
            interval_ms: 1000,
        };
        assert!(source.frame_at(0).iter().any(|&s| s != 0));
        assert!(source.frame_at(199).iter().any(|&s| s != 0));
        assert!(source.frame_at(200).iter().all(|&s| s == 0));
        assert!(source.frame_at(999).iter().all(|&s| s == 0));
        assert!(source.frame_at(1000).iter().any(|&s| s != 0));
    }

    #[tokio::test]
    async fn spawned_source_delivers_frames() {
        let source = AudioSource::Silence {
            sample_rate: DEFAULT_SAMPLE_RATE,
            frame_samples: DEFAULT_FRAME_SAMPLES,
        };
        let mut rx = source.spawn();
        let frame = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("frame within deadline")
            .expect("channel open");
        assert_eq!(frame.len(), DEFAULT_FRAME_SAMPLES);
    }
}
