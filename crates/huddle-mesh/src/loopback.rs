//! In-process media transport.
//!
//! Connections negotiate over the real signaling path: the SDP carries an
//! X25519 key, candidates gate connectivity, and audio frames travel
//! AES-256-GCM sealed between endpoints registered on a shared
//! [`LoopbackNetwork`]. Links can be failed on demand.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use huddle_voice::{LocalAudioTrack, RemoteAudioStream};

use crate::envelope::NegotiationPayload;
use crate::error::MeshError;
use crate::link_crypto::{FrameOpener, FrameSealer, LinkKeyPair};
use crate::peer::{
    PeerConnection, PeerConnectionState, PeerConnector, PeerEvent, PeerEvents, PeerRole,
};

/// Sealed frames queued towards one endpoint.
const INBOX_DEPTH: usize = 64;
/// Decoded frames queued towards the playback output.
const REMOTE_QUEUE: usize = 100;

const SDP_KEY_PREFIX: &str = "a=x25519:";

#[derive(Clone, Default)]
pub struct LoopbackNetwork {
    inner: Arc<Mutex<Registry>>,
}

#[derive(Default)]
struct Registry {
    next_endpoint: u64,
    /// Keyed by (owner, remote peer).
    endpoints: HashMap<(String, String), Endpoint>,
    failed: HashSet<(String, String)>,
}

struct Endpoint {
    id: u64,
    inbox: mpsc::Sender<Vec<u8>>,
    state: Arc<Mutex<PeerConnectionState>>,
    events: PeerEvents,
}

fn pair(a: &str, b: &str) -> (String, String) {
    if a <= b {
        (a.to_string(), b.to_string())
    } else {
        (b.to_string(), a.to_string())
    }
}

impl LoopbackNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connector(&self) -> LoopbackConnector {
        LoopbackConnector {
            network: self.clone(),
        }
    }

    /// Break the link between `a` and `b` in both directions. Both
    /// endpoints report `Failed`; connections created later fail too.
    pub fn fail_link(&self, a: &str, b: &str) {
        let mut registry = self.inner.lock();
        registry.failed.insert(pair(a, b));
        for key in [(a.to_string(), b.to_string()), (b.to_string(), a.to_string())] {
            if let Some(endpoint) = registry.endpoints.get(&key) {
                *endpoint.state.lock() = PeerConnectionState::Failed;
                endpoint
                    .events
                    .emit(PeerEvent::StateChanged(PeerConnectionState::Failed));
            }
        }
        tracing::warn!(a = %a, b = %b, "loopback link failed");
    }

    pub fn heal_link(&self, a: &str, b: &str) {
        self.inner.lock().failed.remove(&pair(a, b));
    }

    pub fn is_failed(&self, a: &str, b: &str) -> bool {
        self.inner.lock().failed.contains(&pair(a, b))
    }

    /// Open endpoints, one per live connection.
    pub fn endpoint_count(&self) -> usize {
        self.inner.lock().endpoints.len()
    }

    fn register(
        &self,
        local: &str,
        peer: &str,
        inbox: mpsc::Sender<Vec<u8>>,
        state: Arc<Mutex<PeerConnectionState>>,
        events: PeerEvents,
    ) -> u64 {
        let mut registry = self.inner.lock();
        let id = registry.next_endpoint;
        registry.next_endpoint += 1;
        registry.endpoints.insert(
            (local.to_string(), peer.to_string()),
            Endpoint {
                id,
                inbox,
                state,
                events,
            },
        );
        id
    }

    fn unregister(&self, local: &str, peer: &str, id: u64) {
        let mut registry = self.inner.lock();
        let key = (local.to_string(), peer.to_string());
        if registry.endpoints.get(&key).is_some_and(|e| e.id == id) {
            registry.endpoints.remove(&key);
        }
    }

    fn is_reachable(&self, owner: &str, peer: &str) -> bool {
        self.inner
            .lock()
            .endpoints
            .contains_key(&(owner.to_string(), peer.to_string()))
    }

    fn inbox_of(&self, owner: &str, peer: &str) -> Option<mpsc::Sender<Vec<u8>>> {
        self.inner
            .lock()
            .endpoints
            .get(&(owner.to_string(), peer.to_string()))
            .map(|e| e.inbox.clone())
    }
}

#[derive(Clone)]
pub struct LoopbackConnector {
    network: LoopbackNetwork,
}

impl PeerConnector for LoopbackConnector {
    fn connect(
        &self,
        local: &str,
        peer: &str,
        role: PeerRole,
        events: PeerEvents,
    ) -> Result<Box<dyn PeerConnection>, MeshError> {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_DEPTH);
        let state = Arc::new(Mutex::new(PeerConnectionState::New));
        let endpoint = self.network.register(
            local,
            peer,
            inbox_tx,
            Arc::clone(&state),
            events.clone(),
        );
        tracing::debug!(local = %local, peer = %peer, ?role, endpoint, "loopback connection created");

        Ok(Box::new(LoopbackConnection {
            network: self.network.clone(),
            local: local.to_string(),
            peer: peer.to_string(),
            role,
            events,
            endpoint,
            keypair: LinkKeyPair::generate(),
            session: rand::thread_rng().gen(),
            sealer: None,
            opener: None,
            secured: false,
            remote_candidate: false,
            state,
            inbox: Some(inbox_rx),
            sender: None,
            receiver: None,
        }))
    }
}

pub struct LoopbackConnection {
    network: LoopbackNetwork,
    local: String,
    peer: String,
    role: PeerRole,
    events: PeerEvents,
    endpoint: u64,
    keypair: LinkKeyPair,
    session: u64,
    sealer: Option<FrameSealer>,
    opener: Option<FrameOpener>,
    secured: bool,
    remote_candidate: bool,
    state: Arc<Mutex<PeerConnectionState>>,
    inbox: Option<mpsc::Receiver<Vec<u8>>>,
    sender: Option<JoinHandle<()>>,
    receiver: Option<JoinHandle<()>>,
}

impl LoopbackConnection {
    fn local_sdp(&self) -> String {
        format!(
            "v=0\r\no=- {} 0 IN IP4 127.0.0.1\r\ns=huddle\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\n{SDP_KEY_PREFIX}{}\r\n",
            self.session,
            self.keypair.public_hex()
        )
    }

    fn local_candidate(&self) -> NegotiationPayload {
        NegotiationPayload::Candidate {
            candidate: format!(
                "candidate:{} 1 udp 2130706431 127.0.0.1 {} typ host",
                self.endpoint,
                9000 + self.endpoint
            ),
            sdp_mid: Some("0".into()),
            sdp_m_line_index: Some(0),
        }
    }

    fn set_state(&self, next: PeerConnectionState) {
        let mut state = self.state.lock();
        if *state == next {
            return;
        }
        *state = next;
        drop(state);
        tracing::debug!(peer = %self.peer, state = %next, "loopback link state");
        self.events.emit(PeerEvent::StateChanged(next));
    }

    fn install_keys(&mut self, sdp: &str) -> Result<(), MeshError> {
        if self.secured {
            return Err(MeshError::Negotiation(format!(
                "duplicate session description from {}",
                self.peer
            )));
        }
        let remote_key = sdp
            .lines()
            .find_map(|line| line.trim().strip_prefix(SDP_KEY_PREFIX))
            .ok_or_else(|| MeshError::Negotiation("session description has no link key".into()))?;
        let keys = self.keypair.derive(remote_key, self.role)?;
        self.sealer = Some(keys.send);
        self.opener = Some(keys.recv);
        self.secured = true;
        Ok(())
    }

    fn try_connect(&mut self) {
        if !self.secured || !self.remote_candidate || self.state() != PeerConnectionState::Connecting
        {
            return;
        }
        if self.network.is_failed(&self.local, &self.peer) {
            self.set_state(PeerConnectionState::Failed);
            return;
        }
        if !self.network.is_reachable(&self.peer, &self.local) {
            return;
        }
        let (Some(inbox), Some(opener)) = (self.inbox.take(), self.opener.take()) else {
            return;
        };

        let (frames_tx, frames_rx) = mpsc::channel(REMOTE_QUEUE);
        self.receiver = Some(tokio::spawn(receive_frames(
            inbox,
            opener,
            frames_tx,
            self.peer.clone(),
        )));
        self.set_state(PeerConnectionState::Connected);
        self.events.emit(PeerEvent::RemoteStream(RemoteAudioStream {
            peer: self.peer.clone(),
            frames: frames_rx,
        }));
    }
}

impl PeerConnection for LoopbackConnection {
    fn role(&self) -> PeerRole {
        self.role
    }

    fn state(&self) -> PeerConnectionState {
        *self.state.lock()
    }

    fn create_offer(&mut self) -> Result<NegotiationPayload, MeshError> {
        if self.role != PeerRole::Initiator {
            return Err(MeshError::Negotiation("responder cannot offer".into()));
        }
        self.set_state(PeerConnectionState::Connecting);
        Ok(NegotiationPayload::Offer {
            sdp: self.local_sdp(),
        })
    }

    fn apply_remote(
        &mut self,
        payload: NegotiationPayload,
    ) -> Result<Vec<NegotiationPayload>, MeshError> {
        if matches!(
            self.state(),
            PeerConnectionState::Failed | PeerConnectionState::Closed
        ) {
            return Err(MeshError::peer_failed(&self.peer, "link is not usable"));
        }
        match payload {
            NegotiationPayload::Offer { sdp } => {
                if self.role == PeerRole::Initiator {
                    return Err(MeshError::Negotiation("offer sent to initiator".into()));
                }
                self.install_keys(&sdp)?;
                self.set_state(PeerConnectionState::Connecting);
                let replies = vec![
                    NegotiationPayload::Answer {
                        sdp: self.local_sdp(),
                    },
                    self.local_candidate(),
                ];
                self.try_connect();
                Ok(replies)
            }
            NegotiationPayload::Answer { sdp } => {
                if self.role == PeerRole::Responder {
                    return Err(MeshError::Negotiation("answer sent to responder".into()));
                }
                self.install_keys(&sdp)?;
                let replies = vec![self.local_candidate()];
                self.try_connect();
                Ok(replies)
            }
            NegotiationPayload::Candidate { candidate, .. } => {
                if !candidate.starts_with("candidate:") {
                    return Err(MeshError::Negotiation(format!(
                        "malformed candidate {candidate:?}"
                    )));
                }
                self.remote_candidate = true;
                self.try_connect();
                Ok(Vec::new())
            }
        }
    }

    fn attach_local_audio(&mut self, track: &LocalAudioTrack) -> Result<(), MeshError> {
        if self.sender.is_some() {
            return Ok(());
        }
        if self.state() != PeerConnectionState::Connected {
            return Err(MeshError::peer_failed(&self.peer, "link is not connected"));
        }
        let sealer = self
            .sealer
            .take()
            .ok_or_else(|| MeshError::peer_failed(&self.peer, "link is not secured"))?;
        self.sender = Some(tokio::spawn(send_frames(
            self.network.clone(),
            self.local.clone(),
            self.peer.clone(),
            track.subscribe(),
            sealer,
        )));
        tracing::debug!(peer = %self.peer, "local audio attached");
        Ok(())
    }

    fn close(&mut self) {
        if self.state() == PeerConnectionState::Closed {
            return;
        }
        if let Some(task) = self.sender.take() {
            task.abort();
        }
        if let Some(task) = self.receiver.take() {
            task.abort();
        }
        *self.state.lock() = PeerConnectionState::Closed;
        self.network
            .unregister(&self.local, &self.peer, self.endpoint);
        tracing::debug!(peer = %self.peer, "loopback connection closed");
    }
}

impl Drop for LoopbackConnection {
    fn drop(&mut self) {
        self.close();
    }
}

async fn send_frames(
    network: LoopbackNetwork,
    local: String,
    peer: String,
    mut frames: broadcast::Receiver<Arc<[f32]>>,
    mut sealer: FrameSealer,
) {
    loop {
        match frames.recv().await {
            Ok(frame) => {
                if network.is_failed(&local, &peer) {
                    continue;
                }
                let sealed = match sealer.seal(&encode_pcm(&frame)) {
                    Ok(sealed) => sealed,
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %e, "dropping outbound frame");
                        continue;
                    }
                };
                if let Some(inbox) = network.inbox_of(&peer, &local) {
                    // Full inbox: the receiver is behind, drop like a lossy link.
                    let _ = inbox.try_send(sealed);
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::trace!(peer = %peer, skipped, "outbound audio lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn receive_frames(
    mut inbox: mpsc::Receiver<Vec<u8>>,
    opener: FrameOpener,
    frames: mpsc::Sender<Vec<f32>>,
    peer: String,
) {
    while let Some(sealed) = inbox.recv().await {
        let pcm = match opener.open(&sealed) {
            Ok(pcm) => decode_pcm(&pcm),
            Err(e) => {
                tracing::trace!(peer = %peer, error = %e, "dropping inbound frame");
                continue;
            }
        };
        match frames.try_send(pcm) {
            Ok(()) | Err(mpsc::error::TrySendError::Full(_)) => {}
            Err(mpsc::error::TrySendError::Closed(_)) => break,
        }
    }
}

fn encode_pcm(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

fn decode_pcm(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::MeshEvent;

    struct Side {
        conn: Box<dyn PeerConnection>,
        events: mpsc::UnboundedReceiver<MeshEvent>,
    }

    fn side(network: &LoopbackNetwork, local: &str, peer: &str, role: PeerRole) -> Side {
        let (tx, events) = mpsc::unbounded_channel();
        let conn = network
            .connector()
            .connect(local, peer, role, PeerEvents::new(peer, 0, tx))
            .unwrap();
        Side { conn, events }
    }

    /// Relay payloads between the two sides until neither has more to say.
    fn negotiate(initiator: &mut Side, responder: &mut Side) {
        let mut to_responder = vec![initiator.conn.create_offer().unwrap()];
        while !to_responder.is_empty() {
            let mut to_initiator = Vec::new();
            for payload in to_responder.drain(..) {
                to_initiator.extend(responder.conn.apply_remote(payload).unwrap());
            }
            for payload in to_initiator {
                to_responder.extend(initiator.conn.apply_remote(payload).unwrap());
            }
        }
    }

    fn drain(side: &mut Side) -> (Vec<PeerConnectionState>, Option<RemoteAudioStream>) {
        let mut states = Vec::new();
        let mut stream = None;
        while let Ok(event) = side.events.try_recv() {
            match event.event {
                PeerEvent::StateChanged(state) => states.push(state),
                PeerEvent::RemoteStream(s) => stream = Some(s),
                PeerEvent::LocalNegotiation(_) => {}
            }
        }
        (states, stream)
    }

    #[tokio::test]
    async fn offer_answer_candidates_connect_both_sides() {
        let network = LoopbackNetwork::new();
        let mut alice = side(&network, "alice", "bob", PeerRole::Initiator);
        let mut bob = side(&network, "bob", "alice", PeerRole::Responder);
        negotiate(&mut alice, &mut bob);

        assert_eq!(alice.conn.state(), PeerConnectionState::Connected);
        assert_eq!(bob.conn.state(), PeerConnectionState::Connected);
        let (states, stream) = drain(&mut alice);
        assert_eq!(
            states,
            vec![PeerConnectionState::Connecting, PeerConnectionState::Connected]
        );
        assert_eq!(stream.unwrap().peer, "bob");
    }

    #[tokio::test]
    async fn audio_flows_through_sealed_link() {
        let network = LoopbackNetwork::new();
        let mut alice = side(&network, "alice", "bob", PeerRole::Initiator);
        let mut bob = side(&network, "bob", "alice", PeerRole::Responder);
        negotiate(&mut alice, &mut bob);

        let track = LocalAudioTrack::new(48000);
        alice.conn.attach_local_audio(&track).unwrap();
        let (_, stream) = drain(&mut bob);
        let mut stream = stream.unwrap();

        track.push(&[0.25, -0.5, 0.75]);
        let frame = tokio::time::timeout(std::time::Duration::from_secs(1), stream.frames.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(frame, vec![0.25, -0.5, 0.75]);
    }

    #[tokio::test]
    async fn attach_before_connect_is_rejected() {
        let network = LoopbackNetwork::new();
        let mut alice = side(&network, "alice", "bob", PeerRole::Initiator);
        let track = LocalAudioTrack::new(48000);
        assert!(matches!(
            alice.conn.attach_local_audio(&track),
            Err(MeshError::PeerConnectionFailed { .. })
        ));
    }

    #[tokio::test]
    async fn misdirected_payloads_are_negotiation_errors() {
        let network = LoopbackNetwork::new();
        let mut alice = side(&network, "alice", "bob", PeerRole::Initiator);
        let mut bob = side(&network, "bob", "alice", PeerRole::Responder);
        assert!(bob.conn.create_offer().is_err());

        let offer = alice.conn.create_offer().unwrap();
        assert!(alice.conn.apply_remote(offer.clone()).is_err());
        bob.conn.apply_remote(offer.clone()).unwrap();
        assert!(matches!(
            bob.conn.apply_remote(offer),
            Err(MeshError::Negotiation(_))
        ));
        assert!(bob
            .conn
            .apply_remote(NegotiationPayload::Candidate {
                candidate: "garbage".into(),
                sdp_mid: None,
                sdp_m_line_index: None,
            })
            .is_err());
    }

    #[tokio::test]
    async fn failed_link_reports_to_both_ends() {
        let network = LoopbackNetwork::new();
        let mut alice = side(&network, "alice", "bob", PeerRole::Initiator);
        let mut bob = side(&network, "bob", "alice", PeerRole::Responder);
        negotiate(&mut alice, &mut bob);
        drain(&mut alice);
        drain(&mut bob);

        network.fail_link("bob", "alice");
        assert_eq!(drain(&mut alice).0, vec![PeerConnectionState::Failed]);
        assert_eq!(drain(&mut bob).0, vec![PeerConnectionState::Failed]);
        assert_eq!(alice.conn.state(), PeerConnectionState::Failed);
        assert!(network.is_failed("alice", "bob"));

        network.heal_link("alice", "bob");
        assert!(!network.is_failed("bob", "alice"));
        let mut alice = side(&network, "alice", "bob", PeerRole::Initiator);
        let mut bob = side(&network, "bob", "alice", PeerRole::Responder);
        negotiate(&mut alice, &mut bob);
        assert_eq!(alice.conn.state(), PeerConnectionState::Connected);
        assert_eq!(bob.conn.state(), PeerConnectionState::Connected);
    }

    #[tokio::test]
    async fn close_unregisters_endpoint_once() {
        let network = LoopbackNetwork::new();
        let mut alice = side(&network, "alice", "bob", PeerRole::Initiator);
        assert_eq!(network.endpoint_count(), 1);
        alice.conn.close();
        alice.conn.close();
        assert_eq!(network.endpoint_count(), 0);
        assert_eq!(alice.conn.state(), PeerConnectionState::Closed);
    }

    #[test]
    fn pcm_codec_preserves_samples() {
        let samples = [0.0, 1.0, -1.0, 0.123];
        assert_eq!(decode_pcm(&encode_pcm(&samples)), samples);
    }
}
