use serde::{Deserialize, Serialize};

/// Processing requested from the input device when capture is acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct CaptureConstraints {
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    pub auto_gain_control: bool,
}

impl Default for CaptureConstraints {
    fn default() -> Self {
        Self {
            echo_cancellation: true,
            noise_suppression: true,
            auto_gain_control: true,
        }
    }
}

/// Tuning of the local speaking-level loop.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ActivityConfig {
    /// Sampling cadence of the analysis loop.
    pub sample_interval_ms: u64,
    /// Analysis window in samples.
    pub fft_size: usize,
    /// Per-bin exponential smoothing (0 = none, close to 1 = slow).
    pub smoothing: f32,
    /// Levels strictly above this count as speaking.
    pub speaking_threshold: f32,
    /// Levels at or below this are not broadcast.
    pub broadcast_floor: f32,
}

impl Default for ActivityConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: 50,
            fft_size: 256,
            smoothing: 0.8,
            speaking_threshold: 0.15,
            broadcast_floor: 0.05,
        }
    }
}

/// Device-level settings for the cpal backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Input device name. `None` = system default.
    pub input_device: Option<String>,
    /// Output device name. `None` = system default.
    pub output_device: Option<String>,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            channels: 1,
            input_device: None,
            output_device: None,
        }
    }
}
