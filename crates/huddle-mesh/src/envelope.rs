//! Wire format of everything carried on a voice channel topic.
//!
//! Envelopes are JSON, adjacently tagged:
//!
//! ```text
//! {"kind":"negotiation","data":{"sender":"alice","target":"bob","payload":{"type":"offer","sdp":"..."}}}
//! ```

use serde::{Deserialize, Serialize};

use crate::error::MeshError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PresenceChange {
    Join,
    Leave,
}

/// Offer/answer/candidate exchange between two peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum NegotiationPayload {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    Candidate {
        candidate: String,
        #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
        sdp_mid: Option<String>,
        #[serde(
            rename = "sdpMLineIndex",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        sdp_m_line_index: Option<u16>,
    },
}

impl NegotiationPayload {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Offer { .. } => "offer",
            Self::Answer { .. } => "answer",
            Self::Candidate { .. } => "candidate",
        }
    }
}

/// A peer's speaking state. The newest `seq` per sender wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivitySample {
    pub sender: String,
    pub seq: u64,
    pub is_speaking: bool,
    pub audio_level: f32,
    pub muted: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "camelCase")]
pub enum SignalEnvelope {
    Presence {
        sender: String,
        change: PresenceChange,
    },
    Negotiation {
        sender: String,
        target: String,
        payload: NegotiationPayload,
    },
    Activity(ActivitySample),
}

impl SignalEnvelope {
    pub fn sender(&self) -> &str {
        match self {
            Self::Presence { sender, .. } | Self::Negotiation { sender, .. } => sender,
            Self::Activity(sample) => &sample.sender,
        }
    }

    pub fn encode(&self) -> Result<String, MeshError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(text: &str) -> Result<Self, MeshError> {
        Ok(serde_json::from_str(text)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_wire_shape() {
        let env = SignalEnvelope::Negotiation {
            sender: "alice".into(),
            target: "bob".into(),
            payload: NegotiationPayload::Candidate {
                candidate: "candidate:1 udp".into(),
                sdp_mid: Some("0".into()),
                sdp_m_line_index: Some(0),
            },
        };
        let value: serde_json::Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(value["kind"], "negotiation");
        assert_eq!(value["data"]["target"], "bob");
        assert_eq!(value["data"]["payload"]["type"], "candidate");
        assert_eq!(value["data"]["payload"]["sdpMid"], "0");
        assert_eq!(value["data"]["payload"]["sdpMLineIndex"], 0);
    }

    #[test]
    fn activity_fields_are_camel_case() {
        let env = SignalEnvelope::Activity(ActivitySample {
            sender: "bob".into(),
            seq: 7,
            is_speaking: true,
            audio_level: 0.5,
            muted: false,
        });
        let value: serde_json::Value = serde_json::from_str(&env.encode().unwrap()).unwrap();
        assert_eq!(value["kind"], "activity");
        assert_eq!(value["data"]["isSpeaking"], true);
        assert_eq!(value["data"]["audioLevel"], 0.5);
        assert_eq!(env.sender(), "bob");
    }

    #[test]
    fn candidate_without_mid_decodes() {
        let env = SignalEnvelope::decode(
            r#"{"kind":"negotiation","data":{"sender":"a","target":"b","payload":{"type":"candidate","candidate":"c"}}}"#,
        )
        .unwrap();
        let SignalEnvelope::Negotiation { payload, .. } = env else {
            panic!("expected negotiation");
        };
        assert_eq!(
            payload,
            NegotiationPayload::Candidate {
                candidate: "c".into(),
                sdp_mid: None,
                sdp_m_line_index: None,
            }
        );
    }

    #[test]
    fn unknown_kind_is_rejected() {
        assert!(matches!(
            SignalEnvelope::decode(r#"{"kind":"typing","data":{}}"#),
            Err(MeshError::Codec(_))
        ));
        assert!(SignalEnvelope::decode("not json").is_err());
    }
}
