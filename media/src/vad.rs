use crate::frame::StreamFrame;

// mu-law companding constant; maps telephone-band energy onto [0, 1]
const MU: f64 = 255.0;

const DEFAULT_HANGOVER_FRAMES: u32 = 5;

/// Outcome of scoring one frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VadDecision {
    pub confidence: f64,
    /// Frame belongs to an utterance (voiced, or inside the hangover).
    pub speech: bool,
    pub utterance_start: bool,
    pub utterance_end: bool,
}

/// Energy voice-activity detector. Per-frame RMS is companded to a
/// [0, 1] confidence and compared against the configured threshold;
/// a few hangover frames keep an utterance open across short dips so
/// one word doesn't split into many.
pub struct Vad {
    threshold: f64,
    hangover_frames: u32,
    hangover_left: u32,
    in_speech: bool,
}

impl Vad {
    pub fn new(threshold: f64) -> Self {
        Self {
            threshold,
            hangover_frames: DEFAULT_HANGOVER_FRAMES,
            hangover_left: 0,
            in_speech: false,
        }
    }

    /// Confidence for a single frame, independent of utterance state.
    pub fn score(frame: &StreamFrame) -> f64 {
        let norm = (frame.rms() / i16::MAX as f64).clamp(0.0, 1.0);
        (1.0 + MU * norm).ln() / (1.0 + MU).ln()
    }

    pub fn detect(&mut self, frame: &StreamFrame) -> VadDecision {
        let confidence = Self::score(frame);
        if confidence >= self.threshold {
            let utterance_start = !self.in_speech;
            self.in_speech = true;
            self.hangover_left = self.hangover_frames;
            return VadDecision {
                confidence,
                speech: true,
                utterance_start,
                utterance_end: false,
            };
        }

        if self.in_speech {
            if self.hangover_left > 0 {
                self.hangover_left -= 1;
                return VadDecision {
                    confidence,
                    speech: true,
                    utterance_start: false,
                    utterance_end: false,
                };
            }
            self.in_speech = false;
            return VadDecision {
                confidence,
                speech: false,
                utterance_start: false,
                utterance_end: true,
            };
        }

        VadDecision {
            confidence,
            speech: false,
            utterance_start: false,
            utterance_end: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn loud_frame() -> StreamFrame {
        let pcm = (0..320)
            .map(|i| if i % 2 == 0 { 20_000 } else { -20_000 })
            .collect();
        StreamFrame::new(pcm, 16000)
    }

    fn quiet_frame() -> StreamFrame {
        StreamFrame::new(vec![10; 320], 16000)
    }

    #[test]
    fn confidence_orders_energy() {
        assert!(Vad::score(&loud_frame()) > 0.9);
        assert!(Vad::score(&quiet_frame()) < 0.2);
        assert_eq!(Vad::score(&StreamFrame::silence(16000, 20)), 0.0);
    }

    #[test]
    fn utterance_starts_once() {
        let mut vad = Vad::new(0.6);
        let first = vad.detect(&loud_frame());
        assert!(first.speech && first.utterance_start);
        let second = vad.detect(&loud_frame());
        assert!(second.speech && !second.utterance_start);
    }

    #[test]
    fn hangover_bridges_short_dips() {
        let mut vad = Vad::new(0.6);
        vad.detect(&loud_frame());
        for _ in 0..3 {
            assert!(vad.detect(&quiet_frame()).speech);
        }
        assert!(vad.detect(&loud_frame()).speech);
    }

    #[test]
    fn utterance_ends_after_hangover() {
        let mut vad = Vad::new(0.6);
        vad.detect(&loud_frame());
        let mut saw_end = false;
        for _ in 0..=DEFAULT_HANGOVER_FRAMES + 1 {
            if vad.detect(&quiet_frame()).utterance_end {
                saw_end = true;
                break;
            }
        }
        assert!(saw_end);
        // silence outside an utterance reports nothing
        let idle = vad.detect(&quiet_frame());
        assert!(!idle.speech && !idle.utterance_end);
    }
}
