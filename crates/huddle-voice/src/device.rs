use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait};
use tokio::sync::mpsc;

use crate::audio_processing::RenderReference;
use crate::capture::AudioCapture;
use crate::config::{AudioConfig, CaptureConstraints};
use crate::error::VoiceError;
use crate::playback::CpalOutput;
use crate::track::{LocalAudio, LocalAudioTrack};

/// Decoded audio arriving from one remote participant.
pub struct RemoteAudioStream {
    pub peer: String,
    pub frames: mpsc::Receiver<Vec<f32>>,
}

/// A playback output for one remote stream.
pub trait AudioOutput: Send {
    /// Volume in [0, 1]; 0 silences the output without stopping it.
    fn set_volume(&mut self, volume: f32);
    fn volume(&self) -> f32;
    /// Stop playback and release the output. Idempotent.
    fn stop(&mut self);
}

/// Platform audio: microphone capture and per-stream playback.
#[async_trait]
pub trait AudioDevice: Send + Sync {
    /// Acquire exclusive use of the input device.
    ///
    /// Fails with [`VoiceError::PermissionDenied`] when the device is refused,
    /// busy or absent.
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<LocalAudio, VoiceError>;

    /// Start playing `stream` at `volume`.
    fn open_output(
        &self,
        stream: RemoteAudioStream,
        volume: f32,
    ) -> Result<Box<dyn AudioOutput>, VoiceError>;
}

/// Whether to search for an input or output device.
pub enum DeviceDirection {
    Input,
    Output,
}

/// Find an audio device by name, falling back to the default for that direction.
pub fn find_device(
    host: &cpal::Host,
    name: &str,
    direction: &DeviceDirection,
) -> Result<cpal::Device, VoiceError> {
    let is_input = matches!(direction, DeviceDirection::Input);
    let label = if is_input { "input" } else { "output" };

    let devices: Vec<cpal::Device> = if is_input {
        host.input_devices().into_iter().flatten().collect()
    } else {
        host.output_devices().into_iter().flatten().collect()
    };

    for device in devices {
        if device.name().ok().as_deref() == Some(name) {
            return Ok(device);
        }
    }

    tracing::warn!(device = %name, direction = label, "requested device not found, falling back to default");
    let default = if is_input {
        host.default_input_device()
    } else {
        host.default_output_device()
    };
    default.ok_or_else(|| VoiceError::AudioDevice(format!("no {label} device available")))
}

/// The system's real audio hardware via cpal.
///
/// Playback outputs write what they play into a shared [`RenderReference`]
/// that the capture chain's echo canceller consumes.
pub struct CpalAudioDevice {
    config: AudioConfig,
    render: RenderReference,
}

impl CpalAudioDevice {
    pub fn new(config: AudioConfig) -> Self {
        Self {
            config,
            render: RenderReference::default(),
        }
    }
}

#[async_trait]
impl AudioDevice for CpalAudioDevice {
    async fn acquire(&self, constraints: &CaptureConstraints) -> Result<LocalAudio, VoiceError> {
        let track = LocalAudioTrack::new(self.config.sample_rate);
        let (error_tx, error_rx) = mpsc::unbounded_channel();

        let mut capture = AudioCapture::new(self.config.sample_rate, self.config.channels);
        let thread_track = track.clone();
        let constraints = *constraints;
        let device_name = self.config.input_device.clone();
        let render = self.render.clone();

        let capture = tokio::task::spawn_blocking(move || {
            capture
                .start(thread_track, constraints, device_name.as_deref(), render, error_tx)
                .map(|()| capture)
        })
        .await
        .map_err(|e| VoiceError::PermissionDenied(format!("capture task failed: {e}")))??;

        Ok(LocalAudio::new(track, Box::new(capture), Some(error_rx)))
    }

    fn open_output(
        &self,
        stream: RemoteAudioStream,
        volume: f32,
    ) -> Result<Box<dyn AudioOutput>, VoiceError> {
        let output = CpalOutput::open(&self.config, stream, volume, self.render.clone())?;
        Ok(Box::new(output))
    }
}
