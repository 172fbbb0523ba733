//! Seam between the mesh manager and the media transport.

use std::fmt;

use serde::Serialize;
use tokio::sync::mpsc;

use huddle_voice::{LocalAudioTrack, RemoteAudioStream};

use crate::envelope::NegotiationPayload;
use crate::error::MeshError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerRole {
    Initiator,
    Responder,
}

impl PeerRole {
    /// The smaller identity (byte order) initiates.
    pub fn elect(local: &str, peer: &str) -> Self {
        if local < peer {
            Self::Initiator
        } else {
            Self::Responder
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Something a connection reports on its own.
pub enum PeerEvent {
    StateChanged(PeerConnectionState),
    /// A payload the connection produced outside of `apply_remote`
    /// (late trickle candidates).
    LocalNegotiation(NegotiationPayload),
    RemoteStream(RemoteAudioStream),
}

impl fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StateChanged(state) => write!(f, "StateChanged({state})"),
            Self::LocalNegotiation(payload) => write!(f, "LocalNegotiation({})", payload.kind()),
            Self::RemoteStream(stream) => write!(f, "RemoteStream({})", stream.peer),
        }
    }
}

/// A [`PeerEvent`] tagged with the link that produced it.
#[derive(Debug)]
pub struct MeshEvent {
    pub peer: String,
    /// Generation of the link; events from a replaced link are stale.
    pub link: u64,
    pub event: PeerEvent,
}

/// Emitter handed to a connection at creation.
#[derive(Clone)]
pub struct PeerEvents {
    peer: String,
    link: u64,
    tx: mpsc::UnboundedSender<MeshEvent>,
}

impl PeerEvents {
    pub fn new(peer: &str, link: u64, tx: mpsc::UnboundedSender<MeshEvent>) -> Self {
        Self {
            peer: peer.to_string(),
            link,
            tx,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Returns false once the session no longer listens.
    pub fn emit(&self, event: PeerEvent) -> bool {
        self.tx
            .send(MeshEvent {
                peer: self.peer.clone(),
                link: self.link,
                event,
            })
            .is_ok()
    }
}

/// Creates media connections to remote peers.
pub trait PeerConnector: Send + Sync {
    fn connect(
        &self,
        local: &str,
        peer: &str,
        role: PeerRole,
        events: PeerEvents,
    ) -> Result<Box<dyn PeerConnection>, MeshError>;
}

/// One media connection to one remote peer.
pub trait PeerConnection: Send {
    fn role(&self) -> PeerRole;
    fn state(&self) -> PeerConnectionState;

    /// Start negotiation. Only meaningful for the initiator.
    fn create_offer(&mut self) -> Result<NegotiationPayload, MeshError>;

    /// Apply a payload from the peer; returns payloads to relay back.
    fn apply_remote(
        &mut self,
        payload: NegotiationPayload,
    ) -> Result<Vec<NegotiationPayload>, MeshError>;

    /// Start sending `track` to the peer. Requires a connected link.
    fn attach_local_audio(&mut self, track: &LocalAudioTrack) -> Result<(), MeshError>;

    /// Close the connection. Idempotent; emits no further events.
    fn close(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smaller_identity_initiates() {
        assert_eq!(PeerRole::elect("alice", "bob"), PeerRole::Initiator);
        assert_eq!(PeerRole::elect("bob", "alice"), PeerRole::Responder);
        // Byte order, not locale order.
        assert_eq!(PeerRole::elect("Zed", "alice"), PeerRole::Initiator);
        assert_eq!(PeerRole::elect("alice", "alice2"), PeerRole::Initiator);
    }

    #[test]
    fn emit_reports_closed_receiver() {
        let (tx, rx) = mpsc::unbounded_channel();
        let events = PeerEvents::new("bob", 3, tx);
        assert!(events.emit(PeerEvent::StateChanged(PeerConnectionState::Connecting)));
        drop(rx);
        assert!(!events.emit(PeerEvent::StateChanged(PeerConnectionState::Closed)));
    }
}
