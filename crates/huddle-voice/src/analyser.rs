use std::f32::consts::TAU;
use std::sync::Arc;

use rustfft::num_complex::Complex;
use rustfft::{Fft, FftPlanner};

/// Decibel range mapped onto [0, 1] for each frequency bin.
const MIN_DECIBELS: f32 = -100.0;
const MAX_DECIBELS: f32 = -30.0;

/// Frequency-domain level estimator.
///
/// Each call windows the most recent `fft_size` samples (Blackman), takes the
/// magnitude spectrum of the lower `fft_size / 2` bins, smooths every bin
/// against its previous value, maps the result from decibels onto [0, 1] and
/// returns the RMS over all bins. Silence yields exactly 0.
pub struct LevelAnalyser {
    fft_size: usize,
    fft: Arc<dyn Fft<f32>>,
    smoothing: f32,
    window: Vec<f32>,
    smoothed: Vec<f32>,
    buffer: Vec<Complex<f32>>,
    fft_scratch: Vec<Complex<f32>>,
}

impl LevelAnalyser {
    /// `fft_size` is clamped to at least 32 samples, `smoothing` to [0, 1).
    pub fn new(fft_size: usize, smoothing: f32) -> Self {
        let n = fft_size.max(32);
        #[allow(clippy::cast_precision_loss)] // window sizes are tiny
        let nf = n as f32;

        let window: Vec<f32> = (0..n)
            .map(|i| {
                #[allow(clippy::cast_precision_loss)]
                let x = i as f32 / nf;
                0.42 - 0.5 * (TAU * x).cos() + 0.08 * (2.0 * TAU * x).cos()
            })
            .collect();

        let mut planner = FftPlanner::new();
        let fft = planner.plan_fft_forward(n);
        let fft_scratch = vec![Complex::new(0.0, 0.0); fft.get_inplace_scratch_len()];

        Self {
            fft_size: n,
            fft,
            smoothing: smoothing.clamp(0.0, 0.99),
            window,
            smoothed: vec![0.0; n / 2],
            buffer: vec![Complex::new(0.0, 0.0); n],
            fft_scratch,
        }
    }

    pub fn fft_size(&self) -> usize {
        self.fft_size
    }

    /// Estimate the level of the most recent window of `samples`.
    ///
    /// Fewer than `fft_size` samples are zero-padded at the front.
    pub fn analyse(&mut self, samples: &[f32]) -> f32 {
        let n = self.fft_size;
        let take = samples.len().min(n);
        let pad = n - take;
        self.buffer[..pad].fill(Complex::new(0.0, 0.0));
        for (i, s) in samples[samples.len() - take..].iter().enumerate() {
            self.buffer[pad + i] = Complex::new(s * self.window[pad + i], 0.0);
        }

        self.fft.process_with_scratch(&mut self.buffer, &mut self.fft_scratch);

        #[allow(clippy::cast_precision_loss)]
        let norm = n as f32;
        let mut sum_sq = 0.0f32;

        for (bin, value) in self.smoothed.iter_mut().zip(&self.buffer) {
            let magnitude = value.norm() / norm;
            *bin = self.smoothing * *bin + (1.0 - self.smoothing) * magnitude;

            let scaled = to_unit(*bin);
            sum_sq += scaled * scaled;
        }

        #[allow(clippy::cast_precision_loss)]
        let bins = self.smoothed.len() as f32;
        (sum_sq / bins).sqrt().clamp(0.0, 1.0)
    }

    /// Forget smoothing history (new capture session).
    pub fn reset(&mut self) {
        self.smoothed.fill(0.0);
    }
}

/// Map a linear magnitude onto [0, 1] across the analyser's decibel range.
fn to_unit(magnitude: f32) -> f32 {
    if magnitude <= 0.0 {
        return 0.0;
    }
    let db = 20.0 * magnitude.log10();
    ((db - MIN_DECIBELS) / (MAX_DECIBELS - MIN_DECIBELS)).clamp(0.0, 1.0)
}
