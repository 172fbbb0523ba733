use serde::{Deserialize, Serialize};

use huddle_voice::{ActivityConfig, CaptureConstraints};

use crate::error::MeshError;

/// Settings for one voice session controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Relay topics are named `{topic_prefix}:{channel_id}`.
    pub topic_prefix: String,
    pub constraints: CaptureConstraints,
    pub activity: ActivityConfig,
    /// Depth of the controller's command queue.
    pub command_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "voice".to_string(),
            constraints: CaptureConstraints::default(),
            activity: ActivityConfig::default(),
            command_buffer: 32,
        }
    }
}

impl SessionConfig {
    /// Parse a JSON document; absent fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self, MeshError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn topic_for(&self, channel_id: &str) -> String {
        format!("{}:{channel_id}", self.topic_prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_uses_voice_prefix() {
        assert_eq!(SessionConfig::default().topic_for("c1"), "voice:c1");
    }

    #[test]
    fn json_overrides_nested_fields() {
        let cfg = SessionConfig::from_json(
            r#"{"activity":{"sampleIntervalMs":100},"constraints":{"echoCancellation":false}}"#,
        )
        .unwrap();
        assert_eq!(cfg.activity.sample_interval_ms, 100);
        assert_eq!(cfg.activity.fft_size, 256);
        assert!(!cfg.constraints.echo_cancellation);
        assert!(cfg.constraints.noise_suppression);
        assert_eq!(cfg.topic_prefix, "voice");
    }

    #[test]
    fn malformed_json_is_a_codec_error() {
        assert!(matches!(
            SessionConfig::from_json("{not json"),
            Err(MeshError::Codec(_))
        ));
    }
}
