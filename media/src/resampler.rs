use anyhow::Result;
use rubato::{FftFixedIn, VecResampler};

/// PCM16 rate converter built on an FFT resampler.
///
/// Output length is pinned to the rate ratio with a fractional carry,
/// so converting a stream never drifts from wall-clock duration by more
/// than one sample.
pub struct Resampler {
    ratio: f64,
    fft: FftFixedIn<f64>,
    src_sample_rate: u32,
    dst_sample_rate: u32,
    src_pcm_len: usize,
    carry: f64,
}

impl Resampler {
    pub async fn new(
        src_sample_rate: u32,
        dst_sample_rate: u32,
    ) -> Result<Resampler> {
        let (ratio, src_pcm_len, fft) = aria_task::spawn_task(move || {
            let ratio = dst_sample_rate as f64 / src_sample_rate as f64;
            let src_pcm_len = 160;
            let fft = FftFixedIn::new(
                src_sample_rate as usize,
                dst_sample_rate as usize,
                src_pcm_len,
                1,
                1,
            )
            .expect("valid resampler parameters");
            (ratio, src_pcm_len, fft)
        })
        .await?;

        Ok(Resampler {
            ratio,
            fft,
            src_sample_rate,
            dst_sample_rate,
            src_pcm_len,
            carry: 0.0,
        })
    }

    pub fn convert(&mut self, src: &[i16]) -> Vec<i16> {
        if src.len() != self.src_pcm_len {
            self.src_pcm_len = src.len();
            self.fft = FftFixedIn::new(
                self.src_sample_rate as usize,
                self.dst_sample_rate as usize,
                self.src_pcm_len,
                1,
                1,
            )
            .expect("valid resampler parameters");
            self.carry = 0.0;
        }

        let exact = src.len() as f64 * self.ratio + self.carry;
        let want = exact as usize;
        self.carry = exact - want as f64;

        let src: Vec<f64> = src.iter().map(|i| *i as f64).collect();

        let mut dst = match self.fft.process(&[src], None) {
            Ok(outputs) => outputs
                .into_iter()
                .next()
                .map(|output| {
                    output
                        .iter()
                        .map(|amp| amp.round() as i16)
                        .collect::<Vec<i16>>()
                })
                .unwrap_or_else(|| vec![0; want]),
            Err(_) => vec![0; want],
        };

        // hold the rate ratio exactly; the remainder rides in `carry`
        if dst.len() > want {
            dst.truncate(want);
        } else {
            let pad = *dst.last().unwrap_or(&0);
            dst.resize(want, pad);
        }
        dst
    }
}
