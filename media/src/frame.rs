use std::time::{Duration, Instant};
use strum_macros::{Display, EnumString};

/// Which way audio is moving relative to the engine. The serialized
/// forms double as the tap file names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
pub enum StreamDirection {
    #[strum(serialize = "in")]
    Inbound,
    #[strum(serialize = "out")]
    Outbound,
}

/// One unit of audio in flight: mono PCM16 samples at a known rate.
/// Owned by whichever stage is processing it.
#[derive(Debug, Clone)]
pub struct StreamFrame {
    pub at: Instant,
    pub pcm: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u8,
}

impl StreamFrame {
    pub fn new(pcm: Vec<i16>, sample_rate: u32) -> Self {
        Self {
            at: Instant::now(),
            pcm,
            sample_rate,
            channels: 1,
        }
    }

    pub fn silence(sample_rate: u32, frame_ms: usize) -> Self {
        Self::new(
            vec![0; Self::samples_per_frame(sample_rate, frame_ms)],
            sample_rate,
        )
    }

    pub fn samples_per_frame(sample_rate: u32, frame_ms: usize) -> usize {
        (sample_rate / 1000) as usize * frame_ms
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs_f64(self.pcm.len() as f64 / self.sample_rate as f64)
    }

    pub fn is_silent(&self) -> bool {
        self.pcm.iter().all(|s| *s == 0)
    }

    pub fn rms(&self) -> f64 {
        if self.pcm.is_empty() {
            return 0.0;
        }
        let sum: f64 = self.pcm.iter().map(|s| (*s as f64) * (*s as f64)).sum();
        (sum / self.pcm.len() as f64).sqrt()
    }

    pub fn dc_offset(&self) -> f64 {
        if self.pcm.is_empty() {
            return 0.0;
        }
        self.pcm.iter().map(|s| *s as f64).sum::<f64>() / self.pcm.len() as f64
    }

    pub fn clip_ratio(&self) -> f64 {
        if self.pcm.is_empty() {
            return 0.0;
        }
        let clipped = self
            .pcm
            .iter()
            .filter(|s| s.unsigned_abs() >= i16::MAX as u16 - 16)
            .count();
        clipped as f64 / self.pcm.len() as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn direction_round_trips_through_strings() {
        assert_eq!(StreamDirection::Inbound.to_string(), "in");
        assert_eq!(
            StreamDirection::from_str("out").unwrap(),
            StreamDirection::Outbound
        );
    }

    #[test]
    fn frame_math() {
        assert_eq!(StreamFrame::samples_per_frame(8000, 20), 160);
        assert_eq!(StreamFrame::samples_per_frame(16000, 20), 320);
        let frame = StreamFrame::silence(8000, 20);
        assert_eq!(frame.duration(), Duration::from_millis(20));
        assert!(frame.is_silent());
        assert_eq!(frame.rms(), 0.0);
    }

    #[test]
    fn quality_stats() {
        let frame = StreamFrame::new(vec![i16::MAX; 160], 8000);
        assert!(frame.clip_ratio() > 0.99);
        assert!(frame.dc_offset() > 32000.0);
        let quiet = StreamFrame::new(vec![100, -100, 100, -100], 8000);
        assert!(quiet.clip_ratio() < f64::EPSILON);
        assert!((quiet.rms() - 100.0).abs() < 1e-9);
    }
}
