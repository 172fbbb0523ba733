use thiserror::Error;

use huddle_voice::VoiceError;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("microphone unavailable: {0}")]
    PermissionDenied(String),

    #[error("signaling relay unavailable: {0}")]
    RelayUnavailable(String),

    #[error("connection to {peer} failed: {reason}")]
    PeerConnectionFailed { peer: String, reason: String },

    #[error("invalid negotiation payload: {0}")]
    Negotiation(String),

    #[error("signal encoding error: {0}")]
    Codec(String),

    #[error("audio device error: {0}")]
    AudioDevice(String),

    #[error("connection attempt cancelled")]
    Cancelled,

    #[error("voice session closed")]
    SessionClosed,
}

impl MeshError {
    pub fn peer_failed(peer: &str, reason: impl Into<String>) -> Self {
        Self::PeerConnectionFailed {
            peer: peer.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<VoiceError> for MeshError {
    fn from(e: VoiceError) -> Self {
        match e {
            VoiceError::PermissionDenied(reason) => Self::PermissionDenied(reason),
            other => Self::AudioDevice(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for MeshError {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(e.to_string())
    }
}
