use thiserror::Error;

#[derive(Debug, Error)]
pub enum VoiceError {
    /// The input device could not be opened: refused, busy or absent.
    #[error("microphone unavailable: {0}")]
    PermissionDenied(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("capture already released")]
    Released,
}
