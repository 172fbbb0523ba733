use std::sync::mpsc as std_mpsc;
use std::thread;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use dasp_sample::Sample;
use tokio::sync::mpsc;

use crate::audio_processing::{AudioProcessor, RenderReference};
use crate::config::CaptureConstraints;
use crate::device::{find_device, DeviceDirection};
use crate::error::VoiceError;
use crate::track::{CaptureStream, LocalAudioTrack};

/// Raw callback chunks buffered between the cpal callback and the
/// processing loop (~1 s at typical callback sizes).
const RAW_QUEUE: usize = 100;

/// How often the processing loop checks for shutdown while idle.
const IDLE_POLL: Duration = Duration::from_millis(20);

/// Microphone capture via cpal.
///
/// A dedicated thread owns the `cpal::Stream` (it is `!Send` on macOS) and
/// the [`AudioProcessor`] (AEC3 is `!Send`). The stream callback forwards
/// raw chunks to that thread, which down-mixes to mono, runs the processing
/// chain and pushes the result into the [`LocalAudioTrack`].
pub struct AudioCapture {
    sample_rate: u32,
    channels: u16,
    /// Dropping this sender signals the audio thread to shut down.
    shutdown_tx: Option<std_mpsc::Sender<()>>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

/// Everything the capture thread needs, moved in at start.
struct CaptureJob {
    sample_rate: u32,
    channels: u16,
    device_name: Option<String>,
    constraints: CaptureConstraints,
    track: LocalAudioTrack,
    render: RenderReference,
    device_error_tx: mpsc::UnboundedSender<String>,
}

impl AudioCapture {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            shutdown_tx: None,
            thread_handle: None,
        }
    }

    /// Open the input device and start feeding `track`.
    ///
    /// Blocks until the audio thread reports that the stream is playing, so
    /// call it from a blocking context. Any failure to open the device is
    /// reported as [`VoiceError::PermissionDenied`].
    pub fn start(
        &mut self,
        track: LocalAudioTrack,
        constraints: CaptureConstraints,
        device_name: Option<&str>,
        render: RenderReference,
        device_error_tx: mpsc::UnboundedSender<String>,
    ) -> Result<(), VoiceError> {
        let (init_tx, init_rx) = std_mpsc::sync_channel::<Result<(), VoiceError>>(1);
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        let job = CaptureJob {
            sample_rate: self.sample_rate,
            channels: self.channels,
            device_name: device_name.map(String::from),
            constraints,
            track,
            render,
            device_error_tx,
        };

        let handle = thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || run_capture_thread(job, &init_tx, &shutdown_rx))
            .map_err(|e| {
                VoiceError::PermissionDenied(format!("failed to spawn capture thread: {e}"))
            })?;

        let init = init_rx
            .recv()
            .map_err(|_| VoiceError::PermissionDenied("capture thread died during init".into()));
        if let Err(e) = init.and_then(|r| r) {
            let _ = handle.join();
            return Err(e);
        }

        self.shutdown_tx = Some(shutdown_tx);
        self.thread_handle = Some(handle);
        tracing::info!(
            sample_rate = self.sample_rate,
            channels = self.channels,
            echo_cancellation = constraints.echo_cancellation,
            noise_suppression = constraints.noise_suppression,
            auto_gain_control = constraints.auto_gain_control,
            "audio capture started"
        );
        Ok(())
    }

    /// Signal the audio thread and wait for it so the device is released.
    pub fn stop(&mut self) {
        self.shutdown_tx = None;
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            tracing::info!("audio capture stopped");
        }
    }
}

impl CaptureStream for AudioCapture {
    fn stop(&mut self) {
        AudioCapture::stop(self);
    }
}

impl Drop for AudioCapture {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_capture_thread(
    job: CaptureJob,
    init_tx: &std_mpsc::SyncSender<Result<(), VoiceError>>,
    shutdown_rx: &std_mpsc::Receiver<()>,
) {
    let (raw_tx, raw_rx) = std_mpsc::sync_channel::<Vec<f32>>(RAW_QUEUE);

    let stream = match build_capture_stream(&job, raw_tx) {
        Ok(stream) => stream,
        Err(e) => {
            let _ = init_tx.send(Err(e));
            return;
        }
    };
    if let Err(e) = stream.play() {
        let _ = init_tx.send(Err(VoiceError::PermissionDenied(format!(
            "failed to start input stream: {e}"
        ))));
        return;
    }
    let _ = init_tx.send(Ok(()));

    let mut processor = AudioProcessor::new(job.constraints, job.render.clone());
    loop {
        match shutdown_rx.try_recv() {
            Err(std_mpsc::TryRecvError::Empty) => {}
            Ok(()) | Err(std_mpsc::TryRecvError::Disconnected) => break,
        }
        match raw_rx.recv_timeout(IDLE_POLL) {
            Ok(raw) => {
                let mono = downmix(&raw, job.channels);
                let processed = processor.process(&mono);
                if !processed.is_empty() {
                    job.track.push(&processed);
                }
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {}
            Err(std_mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }
    drop(stream);
}

/// Average interleaved channels into mono.
fn downmix(samples: &[f32], channels: u16) -> Vec<f32> {
    let channels = usize::from(channels.max(1));
    if channels == 1 {
        return samples.to_vec();
    }
    #[allow(clippy::cast_precision_loss)]
    let scale = 1.0 / channels as f32;
    samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() * scale)
        .collect()
}

/// Build a cpal input stream on the current thread. The returned stream must
/// stay alive for audio to flow.
fn build_capture_stream(
    job: &CaptureJob,
    raw_tx: std_mpsc::SyncSender<Vec<f32>>,
) -> Result<cpal::Stream, VoiceError> {
    let host = cpal::default_host();
    let device = match job.device_name.as_deref() {
        Some(name) => find_device(&host, name, &DeviceDirection::Input)
            .map_err(|e| VoiceError::PermissionDenied(e.to_string()))?,
        None => host
            .default_input_device()
            .ok_or_else(|| VoiceError::PermissionDenied("no input device available".into()))?,
    };

    let supported = device
        .default_input_config()
        .map_err(|e| VoiceError::PermissionDenied(format!("no input config: {e}")))?;

    let config = cpal::StreamConfig {
        channels: job.channels,
        sample_rate: cpal::SampleRate(job.sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    let error_tx = job.device_error_tx.clone();
    let on_error = move |err: cpal::StreamError| {
        tracing::error!("input stream error: {err}");
        let _ = error_tx.send(format!("input: {err}"));
    };

    match supported.sample_format() {
        cpal::SampleFormat::F32 => device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                // Dropping a chunk under backpressure is fine for live voice.
                let _ = raw_tx.try_send(data.to_vec());
            },
            on_error,
            None,
        ),
        cpal::SampleFormat::I16 => device.build_input_stream(
            &config,
            move |data: &[i16], _: &cpal::InputCallbackInfo| {
                let _ = raw_tx.try_send(data.iter().map(|&s| s.to_sample::<f32>()).collect());
            },
            on_error,
            None,
        ),
        cpal::SampleFormat::U16 => device.build_input_stream(
            &config,
            move |data: &[u16], _: &cpal::InputCallbackInfo| {
                let _ = raw_tx.try_send(data.iter().map(|&s| s.to_sample::<f32>()).collect());
            },
            on_error,
            None,
        ),
        format => {
            return Err(VoiceError::PermissionDenied(format!(
                "unsupported sample format: {format:?}"
            )))
        }
    }
    .map_err(|e| VoiceError::PermissionDenied(format!("failed to build input stream: {e}")))
}
