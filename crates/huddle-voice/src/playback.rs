use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use tokio::sync::mpsc;

use crate::audio_processing::RenderReference;
use crate::config::AudioConfig;
use crate::device::{find_device, AudioOutput, DeviceDirection, RemoteAudioStream};
use crate::error::VoiceError;

/// Volume shared lock-free with the audio callback, stored as `f32` bits.
#[derive(Clone)]
pub struct SharedVolume(Arc<AtomicU32>);

impl SharedVolume {
    pub fn new(volume: f32) -> Self {
        Self(Arc::new(AtomicU32::new(volume.clamp(0.0, 1.0).to_bits())))
    }

    pub fn set(&self, volume: f32) {
        self.0.store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
    }

    pub fn get(&self) -> f32 {
        f32::from_bits(self.0.load(Ordering::Relaxed))
    }
}

/// Playback of one remote stream via cpal.
///
/// Opens an output device on a dedicated audio thread and plays PCM chunks
/// received from the stream's channel. A `VecDeque` inside the callback
/// smooths out timing differences; missing samples play as silence.
///
/// The `cpal::Stream` lives entirely within the spawned thread (it is `!Send`
/// on macOS), so `CpalOutput` itself is `Send`.
pub struct CpalOutput {
    peer: String,
    volume: SharedVolume,
    /// Dropping this sender signals the audio thread to shut down.
    shutdown_tx: Option<std_mpsc::Sender<()>>,
    thread_handle: Option<thread::JoinHandle<()>>,
}

impl CpalOutput {
    /// Start playing `stream` on the configured output device.
    pub fn open(
        config: &AudioConfig,
        stream: RemoteAudioStream,
        volume: f32,
        render: RenderReference,
    ) -> Result<Self, VoiceError> {
        let (init_tx, init_rx) = std_mpsc::sync_channel::<Result<(), VoiceError>>(1);
        let (shutdown_tx, shutdown_rx) = std_mpsc::channel::<()>();

        let volume = SharedVolume::new(volume);
        let thread_volume = volume.clone();
        let sample_rate = config.sample_rate;
        let channels = config.channels;
        let device_name = config.output_device.clone();
        let RemoteAudioStream { peer, frames } = stream;

        let handle = thread::Builder::new()
            .name(format!("audio-playback-{peer}"))
            .spawn(move || {
                let result = build_playback_stream(
                    sample_rate,
                    channels,
                    frames,
                    device_name.as_deref(),
                    thread_volume,
                    render,
                );
                match result {
                    Ok(stream) => {
                        if let Err(e) = stream.play() {
                            let _ = init_tx.send(Err(VoiceError::AudioDevice(format!(
                                "failed to start output stream: {e}"
                            ))));
                            return;
                        }
                        let _ = init_tx.send(Ok(()));
                        // The stream stays alive until shutdown.
                        let _ = shutdown_rx.recv();
                        drop(stream);
                    }
                    Err(e) => {
                        let _ = init_tx.send(Err(e));
                    }
                }
            })
            .map_err(|e| {
                VoiceError::AudioDevice(format!("failed to spawn playback thread: {e}"))
            })?;

        init_rx
            .recv()
            .map_err(|_| VoiceError::AudioDevice("playback thread died during init".into()))??;

        tracing::info!(peer = %peer, volume = volume.get(), "audio playback started");
        Ok(Self {
            peer,
            volume,
            shutdown_tx: Some(shutdown_tx),
            thread_handle: Some(handle),
        })
    }
}

impl AudioOutput for CpalOutput {
    fn set_volume(&mut self, volume: f32) {
        self.volume.set(volume);
    }

    fn volume(&self) -> f32 {
        self.volume.get()
    }

    fn stop(&mut self) {
        self.shutdown_tx = None;
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
            tracing::info!(peer = %self.peer, "audio playback stopped");
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Build a cpal output stream on the current thread. `frames` is moved into
/// the output callback and drained via `try_recv` each tick.
fn build_playback_stream(
    sample_rate: u32,
    channels: u16,
    mut frames: mpsc::Receiver<Vec<f32>>,
    device_name: Option<&str>,
    volume: SharedVolume,
    render: RenderReference,
) -> Result<cpal::Stream, VoiceError> {
    let host = cpal::default_host();
    let device = match device_name {
        Some(name) => find_device(&host, name, &DeviceDirection::Output)?,
        None => host
            .default_output_device()
            .ok_or_else(|| VoiceError::AudioDevice("no output device available".into()))?,
    };

    let config = cpal::StreamConfig {
        channels,
        sample_rate: cpal::SampleRate(sample_rate),
        buffer_size: cpal::BufferSize::Default,
    };

    // One second of audio is a generous ceiling for the ring buffer.
    let buffer_capacity = sample_rate as usize * usize::from(channels);
    let mut sample_buffer: VecDeque<f32> = VecDeque::with_capacity(buffer_capacity);
    let channels = usize::from(channels.max(1));

    device
        .build_output_stream(
            &config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                while let Ok(samples) = frames.try_recv() {
                    sample_buffer.extend(samples);
                }
                let gain = volume.get();
                // Remote streams are mono: duplicate each sample across channels.
                for frame in data.chunks_mut(channels) {
                    let sample = sample_buffer.pop_front().unwrap_or(0.0) * gain;
                    frame.fill(sample);
                }
                let played: Vec<f32> = data.iter().step_by(channels).copied().collect();
                render.push(&played);
            },
            move |err: cpal::StreamError| {
                tracing::error!("output stream error: {err}");
            },
            None,
        )
        .map_err(|e| VoiceError::AudioDevice(format!("failed to build output stream: {e}")))
}
