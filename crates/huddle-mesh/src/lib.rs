pub mod config;
pub mod envelope;
pub mod error;
pub mod link_crypto;
pub mod loopback;
pub mod mesh;
pub mod peer;
pub mod relay;
pub mod session;
pub mod signaling;

pub use config::SessionConfig;
pub use envelope::{ActivitySample, NegotiationPayload, PresenceChange, SignalEnvelope};
pub use error::MeshError;
pub use loopback::{LoopbackConnector, LoopbackNetwork};
pub use mesh::{MeshManager, Outbound, PeerLink};
pub use peer::{
    MeshEvent, PeerConnection, PeerConnectionState, PeerConnector, PeerEvent, PeerEvents, PeerRole,
};
pub use relay::{MemoryRelay, PresenceUpdate, RelayFrame, RelaySink, RelaySubscription, SignalRelay};
pub use session::{
    spawn_session, PeerSnapshot, SessionSnapshot, SessionState, VoiceHandle, VoicePlatform,
};
pub use signaling::{SignalEvent, SignalingChannel};
