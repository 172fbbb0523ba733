use std::collections::VecDeque;
use std::sync::Arc;

use nnnoiseless::DenoiseState;
use parking_lot::Mutex;

use crate::config::CaptureConstraints;

/// Processing rate. nnnoiseless and AEC3 both run at 48 kHz mono.
pub const PROCESSING_RATE: usize = 48000;
const CHANNELS: usize = 1;

/// Processing block: 10 ms at 48 kHz.
pub const SUB_FRAME: usize = DenoiseState::FRAME_SIZE;

/// One second of played-back audio is the most the echo canceller can use.
const RENDER_CAPACITY: usize = PROCESSING_RATE;

const AGC_TARGET_RMS: f32 = 0.1;
const AGC_MIN_GAIN: f32 = 0.5;
const AGC_MAX_GAIN: f32 = 8.0;
/// Fraction of the gain error corrected per sub-frame.
const AGC_ADAPT_RATE: f32 = 0.05;
/// Below this RMS the sub-frame is treated as silence and gain is held.
const AGC_SILENCE_RMS: f32 = 0.002;

/// Samples actually sent to the speakers, consumed by the echo canceller as
/// its render (far-end) reference.
#[derive(Clone, Default)]
pub struct RenderReference {
    samples: Arc<Mutex<VecDeque<f32>>>,
}

impl RenderReference {
    pub fn push(&self, played: &[f32]) {
        let mut samples = self.samples.lock();
        samples.extend(played.iter().copied());
        let excess = samples.len().saturating_sub(RENDER_CAPACITY);
        samples.drain(..excess);
    }

    /// Pop `len` samples if that many are buffered.
    pub fn pop_frame(&self, len: usize) -> Option<Vec<f32>> {
        let mut samples = self.samples.lock();
        if samples.len() < len {
            return None;
        }
        Some(samples.drain(..len).collect())
    }

    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Tracks the input RMS and steers a gain towards a fixed target level.
struct AutoGain {
    gain: f32,
}

impl AutoGain {
    fn new() -> Self {
        Self { gain: 1.0 }
    }

    fn apply(&mut self, frame: &mut [f32]) {
        let rms = rms(frame);
        if rms > AGC_SILENCE_RMS {
            let wanted = (AGC_TARGET_RMS / rms).clamp(AGC_MIN_GAIN, AGC_MAX_GAIN);
            self.gain += (wanted - self.gain) * AGC_ADAPT_RATE;
        }
        for sample in frame.iter_mut() {
            *sample = (*sample * self.gain).clamp(-1.0, 1.0);
        }
    }
}

fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_sq: f32 = samples.iter().map(|s| s * s).sum();
    #[allow(clippy::cast_precision_loss)] // frame lengths never approach f32 mantissa range
    let len = samples.len() as f32;
    (sum_sq / len).sqrt()
}

/// Capture chain applying the requested [`CaptureConstraints`].
///
/// Per 10 ms sub-frame:
/// ```text
/// mic → AEC3 (render reference from playback) → nnnoiseless → auto gain → track
/// ```
///
/// Input of arbitrary length is buffered; `process` returns only whole
/// processed sub-frames. `VoipAec3` is `!Send`, so the processor must be
/// built on the thread that uses it (the capture thread).
pub struct AudioProcessor {
    constraints: CaptureConstraints,
    denoiser: Box<DenoiseState<'static>>,
    echo_canceller: Option<aec3::voip::VoipAec3>,
    render: RenderReference,
    gain: AutoGain,
    pending: Vec<f32>,
}

impl AudioProcessor {
    pub fn new(constraints: CaptureConstraints, render: RenderReference) -> Self {
        let echo_canceller = if constraints.echo_cancellation {
            match aec3::voip::VoipAec3::builder(PROCESSING_RATE, CHANNELS, CHANNELS).build() {
                Ok(aec) => Some(aec),
                Err(e) => {
                    tracing::warn!(error = ?e, "failed to create AEC3, echo cancellation disabled");
                    None
                }
            }
        } else {
            None
        };

        Self {
            constraints,
            denoiser: DenoiseState::new(),
            echo_canceller,
            render,
            gain: AutoGain::new(),
            pending: Vec::with_capacity(SUB_FRAME * 4),
        }
    }

    /// Buffer `input` and return every complete processed sub-frame.
    pub fn process(&mut self, input: &[f32]) -> Vec<f32> {
        self.pending.extend_from_slice(input);
        let whole = self.pending.len() / SUB_FRAME * SUB_FRAME;
        let mut output = Vec::with_capacity(whole);

        let mut start = 0;
        while start < whole {
            let sub: Vec<f32> = self.pending[start..start + SUB_FRAME].to_vec();
            output.extend(self.process_sub_frame(&sub));
            start += SUB_FRAME;
        }
        self.pending.drain(..whole);
        output
    }

    fn process_sub_frame(&mut self, input: &[f32]) -> Vec<f32> {
        let mut frame = self.cancel_echo(input);

        if self.constraints.noise_suppression {
            // nnnoiseless expects the 16-bit range, not normalized floats.
            let mut scaled = [0.0f32; SUB_FRAME];
            for (dst, src) in scaled.iter_mut().zip(&frame) {
                *dst = src * 32767.0;
            }
            let mut denoised = [0.0f32; SUB_FRAME];
            self.denoiser.process_frame(&mut denoised, &scaled);
            for (dst, src) in frame.iter_mut().zip(denoised.iter()) {
                *dst = (src / 32767.0).clamp(-1.0, 1.0);
            }
        }

        if self.constraints.auto_gain_control {
            self.gain.apply(&mut frame);
        }

        frame
    }

    fn cancel_echo(&mut self, input: &[f32]) -> Vec<f32> {
        let Some(aec) = self.echo_canceller.as_mut() else {
            return input.to_vec();
        };

        while let Some(played) = self.render.pop_frame(SUB_FRAME) {
            if let Err(e) = aec.handle_render_frame(&played) {
                tracing::trace!(error = ?e, "AEC3 render feed failed");
            }
        }

        let mut out = vec![0.0f32; SUB_FRAME];
        match aec.process(input, None, false, &mut out) {
            Ok(_metrics) => out,
            Err(e) => {
                tracing::trace!(error = ?e, "AEC3 process failed, passing through");
                input.to_vec()
            }
        }
    }
}
