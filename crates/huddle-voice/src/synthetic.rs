//! A software audio device for simulations and tests.
//!
//! Capture produces a generated signal on a 20 ms tokio interval; outputs
//! drain their stream and record what they received. Every acquired track
//! and opened output stays inspectable through the device handle.

use std::f32::consts::TAU;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::config::CaptureConstraints;
use crate::device::{AudioDevice, AudioOutput, RemoteAudioStream};
use crate::error::VoiceError;
use crate::playback::SharedVolume;
use crate::track::{CaptureStream, LocalAudio, LocalAudioTrack};

const SAMPLE_RATE: u32 = 48000;
const FRAME: usize = 960;
const FRAME_PERIOD: Duration = Duration::from_millis(20);

/// What the synthetic microphone hears.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyntheticSignal {
    Silence,
    Tone { frequency: f32, amplitude: f32 },
    Noise { amplitude: f32 },
}

#[derive(Clone)]
pub struct SyntheticAudioDevice {
    inner: Arc<Inner>,
}

struct Inner {
    signal: Mutex<SyntheticSignal>,
    denial: Mutex<Option<String>>,
    acquire_delay: Mutex<Duration>,
    acquisitions: AtomicUsize,
    active_captures: AtomicUsize,
    last_constraints: Mutex<Option<CaptureConstraints>>,
    last_track: Mutex<Option<LocalAudioTrack>>,
    capture_errors: Mutex<Option<mpsc::UnboundedSender<String>>>,
    outputs: Mutex<Vec<OutputProbe>>,
}

impl SyntheticAudioDevice {
    pub fn new(signal: SyntheticSignal) -> Self {
        Self {
            inner: Arc::new(Inner {
                signal: Mutex::new(signal),
                denial: Mutex::new(None),
                acquire_delay: Mutex::new(Duration::ZERO),
                acquisitions: AtomicUsize::new(0),
                active_captures: AtomicUsize::new(0),
                last_constraints: Mutex::new(None),
                last_track: Mutex::new(None),
                capture_errors: Mutex::new(None),
                outputs: Mutex::new(Vec::new()),
            }),
        }
    }

    /// A device whose every acquisition is refused with `reason`.
    pub fn denied(reason: &str) -> Self {
        let device = Self::new(SyntheticSignal::Silence);
        device.deny(Some(reason));
        device
    }

    pub fn deny(&self, reason: Option<&str>) {
        *self.inner.denial.lock() = reason.map(String::from);
    }

    pub fn set_signal(&self, signal: SyntheticSignal) {
        *self.inner.signal.lock() = signal;
    }

    /// Simulated permission-prompt latency before `acquire` resolves.
    pub fn set_acquire_delay(&self, delay: Duration) {
        *self.inner.acquire_delay.lock() = delay;
    }

    /// Successful acquisitions so far.
    pub fn acquisitions(&self) -> usize {
        self.inner.acquisitions.load(Ordering::SeqCst)
    }

    /// Captures acquired and not yet released.
    pub fn active_captures(&self) -> usize {
        self.inner.active_captures.load(Ordering::SeqCst)
    }

    pub fn last_constraints(&self) -> Option<CaptureConstraints> {
        *self.inner.last_constraints.lock()
    }

    pub fn last_track(&self) -> Option<LocalAudioTrack> {
        self.inner.last_track.lock().clone()
    }

    /// Report a runtime fault on the active capture, as a device unplug would.
    ///
    /// Returns false when no capture is active.
    pub fn fail_capture(&self, reason: &str) -> bool {
        self.inner
            .capture_errors
            .lock()
            .as_ref()
            .is_some_and(|tx| tx.send(reason.to_string()).is_ok())
    }

    /// Outputs opened so far. Stopped ones are pruned when the next output
    /// opens.
    pub fn outputs(&self) -> Vec<OutputProbe> {
        self.inner.outputs.lock().clone()
    }

    /// Outputs still playing.
    pub fn live_outputs(&self) -> Vec<OutputProbe> {
        self.outputs().into_iter().filter(|o| !o.is_stopped()).collect()
    }
}

#[async_trait]
impl AudioDevice for SyntheticAudioDevice {
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<LocalAudio, VoiceError> {
        let delay = *self.inner.acquire_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = self.inner.denial.lock().clone() {
            return Err(VoiceError::PermissionDenied(reason));
        }

        let track = LocalAudioTrack::new(SAMPLE_RATE);
        let generator = tokio::spawn(generate(Arc::clone(&self.inner), track.clone()));
        let (error_tx, error_rx) = mpsc::unbounded_channel();

        self.inner.acquisitions.fetch_add(1, Ordering::SeqCst);
        self.inner.active_captures.fetch_add(1, Ordering::SeqCst);
        *self.inner.last_constraints.lock() = Some(*constraints);
        *self.inner.last_track.lock() = Some(track.clone());
        *self.inner.capture_errors.lock() = Some(error_tx.clone());
        tracing::debug!("synthetic capture acquired");

        let stream = SyntheticCapture {
            inner: Arc::clone(&self.inner),
            generator: Some(generator),
            errors: error_tx,
        };
        Ok(LocalAudio::new(track, Box::new(stream), Some(error_rx)))
    }

    fn open_output(
        &self,
        stream: RemoteAudioStream,
        volume: f32,
    ) -> Result<Box<dyn AudioOutput>, VoiceError> {
        let probe = OutputProbe {
            peer: stream.peer.clone(),
            volume: SharedVolume::new(volume),
            stopped: Arc::new(AtomicBool::new(false)),
            received: Arc::new(AtomicU64::new(0)),
        };
        let drain = tokio::spawn(drain(stream, Arc::clone(&probe.received)));
        let mut outputs = self.inner.outputs.lock();
        outputs.retain(|o| !o.is_stopped());
        outputs.push(probe.clone());
        drop(outputs);
        Ok(Box::new(SyntheticOutput {
            probe,
            drain: Some(drain),
        }))
    }
}

async fn generate(inner: Arc<Inner>, track: LocalAudioTrack) {
    let mut tick = tokio::time::interval(FRAME_PERIOD);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut phase = 0.0f32;
    loop {
        tick.tick().await;
        let signal = *inner.signal.lock();
        let frame = render_frame(signal, &mut phase);
        track.push(&frame);
    }
}

fn render_frame(signal: SyntheticSignal, phase: &mut f32) -> Vec<f32> {
    match signal {
        SyntheticSignal::Silence => vec![0.0; FRAME],
        SyntheticSignal::Tone {
            frequency,
            amplitude,
        } => {
            #[allow(clippy::cast_precision_loss)]
            let step = TAU * frequency / SAMPLE_RATE as f32;
            (0..FRAME)
                .map(|_| {
                    *phase = (*phase + step) % TAU;
                    phase.sin() * amplitude
                })
                .collect()
        }
        SyntheticSignal::Noise { amplitude } => {
            let mut rng = rand::thread_rng();
            (0..FRAME)
                .map(|_| rng.gen_range(-amplitude..=amplitude))
                .collect()
        }
    }
}

async fn drain(mut stream: RemoteAudioStream, received: Arc<AtomicU64>) {
    while let Some(frame) = stream.frames.recv().await {
        received.fetch_add(frame.len() as u64, Ordering::Relaxed);
    }
}

struct SyntheticCapture {
    inner: Arc<Inner>,
    generator: Option<JoinHandle<()>>,
    errors: mpsc::UnboundedSender<String>,
}

impl CaptureStream for SyntheticCapture {
    fn stop(&mut self) {
        if let Some(generator) = self.generator.take() {
            generator.abort();
            let mut errors = self.inner.capture_errors.lock();
            if errors.as_ref().is_some_and(|tx| tx.same_channel(&self.errors)) {
                *errors = None;
            }
            drop(errors);
            self.inner.active_captures.fetch_sub(1, Ordering::SeqCst);
            tracing::debug!("synthetic capture released");
        }
    }
}

impl Drop for SyntheticCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Observation handle on a synthetic output.
#[derive(Clone)]
pub struct OutputProbe {
    peer: String,
    volume: SharedVolume,
    stopped: Arc<AtomicBool>,
    received: Arc<AtomicU64>,
}

impl OutputProbe {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn volume(&self) -> f32 {
        self.volume.get()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn samples_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

struct SyntheticOutput {
    probe: OutputProbe,
    drain: Option<JoinHandle<()>>,
}

impl AudioOutput for SyntheticOutput {
    fn set_volume(&mut self, volume: f32) {
        self.probe.volume.set(volume);
    }

    fn volume(&self) -> f32 {
        self.probe.volume.get()
    }

    fn stop(&mut self) {
        if let Some(drain) = self.drain.take() {
            drain.abort();
            self.probe.stopped.store(true, Ordering::SeqCst);
        }
    }
}

impl Drop for SyntheticOutput {
    fn drop(&mut self) {
        self.stop();
    }
}
