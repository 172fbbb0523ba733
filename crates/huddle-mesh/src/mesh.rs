//! Per-peer connection bookkeeping for one voice session.
//!
//! The manager is driven entirely by the session actor: every presence
//! change, negotiation payload, peer event and activity sample is handed to
//! one of the `on_*` methods, which return the negotiation payloads to relay.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::mpsc;

use huddle_voice::{is_speaking, AudioDevice, AudioOutput, LocalAudioTrack};

use crate::envelope::{ActivitySample, NegotiationPayload, PresenceChange};
use crate::error::MeshError;
use crate::peer::{
    MeshEvent, PeerConnection, PeerConnectionState, PeerConnector, PeerEvent, PeerEvents,
    PeerRole,
};
use crate::relay::PresenceUpdate;

/// A negotiation payload to relay to `target`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub target: String,
    pub payload: NegotiationPayload,
}

/// State of the link to one remote participant.
pub struct PeerLink {
    peer: String,
    role: PeerRole,
    state: PeerConnectionState,
    remote_muted: bool,
    is_speaking: bool,
    audio_level: f32,
    last_seq: Option<u64>,
    generation: u64,
    offer_applied: bool,
    audio_attached: bool,
    output: Option<usize>,
    connection: Box<dyn PeerConnection>,
}

impl PeerLink {
    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_initiator(&self) -> bool {
        self.role == PeerRole::Initiator
    }

    pub fn role(&self) -> PeerRole {
        self.role
    }

    pub fn state(&self) -> PeerConnectionState {
        self.state
    }

    pub fn remote_muted(&self) -> bool {
        self.remote_muted
    }

    pub fn is_speaking(&self) -> bool {
        self.is_speaking
    }

    pub fn audio_level(&self) -> f32 {
        self.audio_level
    }

    pub fn has_remote_audio(&self) -> bool {
        self.output.is_some()
    }
}

/// Remote playback outputs, referenced from links by slot index.
#[derive(Default)]
struct OutputArena {
    slots: Vec<Option<Box<dyn AudioOutput>>>,
    free: Vec<usize>,
}

impl OutputArena {
    fn insert(&mut self, output: Box<dyn AudioOutput>) -> usize {
        if let Some(index) = self.free.pop() {
            self.slots[index] = Some(output);
            index
        } else {
            self.slots.push(Some(output));
            self.slots.len() - 1
        }
    }

    fn get(&self, index: usize) -> Option<&dyn AudioOutput> {
        self.slots.get(index).and_then(|slot| slot.as_deref())
    }

    /// Stop and drop the output in `index`.
    fn release(&mut self, index: usize) {
        if let Some(mut output) = self.slots.get_mut(index).and_then(Option::take) {
            output.stop();
            self.free.push(index);
        }
    }

    fn iter_mut(&mut self) -> impl Iterator<Item = &mut Box<dyn AudioOutput>> {
        self.slots.iter_mut().flatten()
    }

    fn live(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }
}

fn volume_for(deafened: bool) -> f32 {
    if deafened {
        0.0
    } else {
        1.0
    }
}

pub struct MeshManager {
    local: String,
    connector: Arc<dyn PeerConnector>,
    audio: Arc<dyn AudioDevice>,
    events: mpsc::UnboundedSender<MeshEvent>,
    links: BTreeMap<String, PeerLink>,
    outputs: OutputArena,
    local_track: Option<LocalAudioTrack>,
    deafened: bool,
    speaking_threshold: f32,
    next_generation: u64,
}

impl MeshManager {
    pub fn new(
        local: &str,
        connector: Arc<dyn PeerConnector>,
        audio: Arc<dyn AudioDevice>,
        events: mpsc::UnboundedSender<MeshEvent>,
        speaking_threshold: f32,
    ) -> Self {
        Self {
            local: local.to_string(),
            connector,
            audio,
            events,
            links: BTreeMap::new(),
            outputs: OutputArena::default(),
            local_track: None,
            deafened: false,
            speaking_threshold,
            next_generation: 0,
        }
    }

    pub fn local(&self) -> &str {
        &self.local
    }

    /// Lend the outbound track; connected links start sending it.
    pub fn set_local_track(&mut self, track: Option<LocalAudioTrack>) {
        self.local_track = track;
        let peers: Vec<String> = self
            .links
            .values()
            .filter(|l| l.state == PeerConnectionState::Connected && !l.audio_attached)
            .map(|l| l.peer.clone())
            .collect();
        for peer in peers {
            self.attach_audio(&peer);
        }
    }

    pub fn on_roster(&mut self, update: &PresenceUpdate) -> Vec<Outbound> {
        match update {
            // A sync never tears down links: peers we negotiate with may not
            // be tracked yet.
            PresenceUpdate::Sync(peers) | PresenceUpdate::Join(peers) => {
                peers.iter().flat_map(|p| self.ensure_link(p)).collect()
            }
            PresenceUpdate::Leave(peers) => {
                for peer in peers {
                    self.remove_peer(peer);
                }
                Vec::new()
            }
        }
    }

    pub fn on_peer_presence(&mut self, peer: &str, change: PresenceChange) -> Vec<Outbound> {
        match change {
            PresenceChange::Join => self.ensure_link(peer),
            PresenceChange::Leave => {
                self.remove_peer(peer);
                Vec::new()
            }
        }
    }

    /// Create a link to a newly present peer and start negotiating if we
    /// are the elected initiator.
    fn ensure_link(&mut self, peer: &str) -> Vec<Outbound> {
        if peer == self.local || self.links.contains_key(peer) {
            return Vec::new();
        }
        let role = PeerRole::elect(&self.local, peer);
        if !self.create_link(peer, role) {
            return Vec::new();
        }
        if role == PeerRole::Responder {
            return Vec::new();
        }

        let offer = match self.links.get_mut(peer) {
            Some(link) => link.connection.create_offer(),
            None => return Vec::new(),
        };
        match offer {
            Ok(payload) => vec![Outbound {
                target: peer.to_string(),
                payload,
            }],
            Err(e) => {
                self.fail_peer(peer, &e);
                Vec::new()
            }
        }
    }

    fn create_link(&mut self, peer: &str, role: PeerRole) -> bool {
        let generation = self.next_generation;
        self.next_generation += 1;
        let events = PeerEvents::new(peer, generation, self.events.clone());

        match self.connector.connect(&self.local, peer, role, events) {
            Ok(connection) => {
                tracing::info!(peer = %peer, ?role, "peer link created");
                self.links.insert(
                    peer.to_string(),
                    PeerLink {
                        peer: peer.to_string(),
                        role,
                        state: connection.state(),
                        remote_muted: false,
                        is_speaking: false,
                        audio_level: 0.0,
                        last_seq: None,
                        generation,
                        offer_applied: false,
                        audio_attached: false,
                        output: None,
                        connection,
                    },
                );
                true
            }
            Err(e) => {
                tracing::warn!(peer = %peer, error = %e, "failed to create peer connection");
                false
            }
        }
    }

    pub fn on_negotiation(&mut self, from: &str, payload: NegotiationPayload) -> Vec<Outbound> {
        if from == self.local {
            return Vec::new();
        }

        if let NegotiationPayload::Offer { .. } = payload {
            let restarted = self
                .links
                .get(from)
                .is_some_and(|l| l.role == PeerRole::Initiator || l.offer_applied);
            if restarted {
                tracing::info!(peer = %from, "fresh offer from known peer, replacing link");
                self.remove_peer(from);
            }
        }
        // Whoever speaks first to an unknown peer defines the roles.
        if !self.links.contains_key(from) && !self.create_link(from, PeerRole::Responder) {
            return Vec::new();
        }

        let is_offer = matches!(payload, NegotiationPayload::Offer { .. });
        let kind = payload.kind();
        let result = match self.links.get_mut(from) {
            Some(link) => {
                let result = link.connection.apply_remote(payload);
                if is_offer && result.is_ok() {
                    link.offer_applied = true;
                }
                link.state = link.connection.state();
                result
            }
            None => return Vec::new(),
        };

        match result {
            Ok(replies) => replies
                .into_iter()
                .map(|payload| Outbound {
                    target: from.to_string(),
                    payload,
                })
                .collect(),
            Err(MeshError::Negotiation(reason)) => {
                tracing::warn!(peer = %from, kind, reason = %reason, "ignoring negotiation payload");
                Vec::new()
            }
            Err(e) => {
                self.fail_peer(from, &e);
                Vec::new()
            }
        }
    }

    pub fn on_peer_event(&mut self, event: MeshEvent) -> Vec<Outbound> {
        let MeshEvent { peer, link, event } = event;
        let Some(current) = self.links.get_mut(&peer) else {
            return Vec::new();
        };
        if current.generation != link {
            tracing::trace!(peer = %peer, "dropping event from replaced link");
            return Vec::new();
        }

        match event {
            PeerEvent::StateChanged(state) => {
                current.state = state;
                match state {
                    PeerConnectionState::Connected => {
                        tracing::info!(peer = %peer, "peer connected");
                        self.attach_audio(&peer);
                    }
                    PeerConnectionState::Failed | PeerConnectionState::Closed => {
                        let e = MeshError::peer_failed(&peer, format!("connection {state}"));
                        self.fail_peer(&peer, &e);
                    }
                    PeerConnectionState::New | PeerConnectionState::Connecting => {}
                }
                Vec::new()
            }
            PeerEvent::LocalNegotiation(payload) => vec![Outbound {
                target: peer,
                payload,
            }],
            PeerEvent::RemoteStream(stream) => {
                let volume = volume_for(self.deafened);
                match self.audio.open_output(stream, volume) {
                    Ok(output) => {
                        let index = self.outputs.insert(output);
                        if let Some(link) = self.links.get_mut(&peer) {
                            if let Some(old) = link.output.replace(index) {
                                self.outputs.release(old);
                            }
                        }
                        tracing::debug!(peer = %peer, volume, "remote audio attached");
                    }
                    Err(e) => {
                        tracing::warn!(peer = %peer, error = %e, "cannot play remote audio");
                    }
                }
                Vec::new()
            }
        }
    }

    fn attach_audio(&mut self, peer: &str) {
        let Some(track) = self.local_track.clone() else {
            return;
        };
        let Some(link) = self.links.get_mut(peer) else {
            return;
        };
        match link.connection.attach_local_audio(&track) {
            Ok(()) => link.audio_attached = true,
            Err(e) => self.fail_peer(peer, &e),
        }
    }

    /// Apply a remote activity sample. Returns false when it was stale or
    /// from an unknown peer.
    ///
    /// Speaking is judged from the sample's level against the local
    /// threshold, not from the sender's own flag.
    pub fn on_activity(&mut self, sample: &ActivitySample) -> bool {
        let Some(link) = self.links.get_mut(&sample.sender) else {
            return false;
        };
        if link.last_seq.is_some_and(|last| sample.seq <= last) {
            return false;
        }
        link.last_seq = Some(sample.seq);
        link.remote_muted = sample.muted;
        let level = if sample.audio_level.is_finite() {
            sample.audio_level.clamp(0.0, 1.0)
        } else {
            0.0
        };
        link.audio_level = level;
        link.is_speaking = is_speaking(level, self.speaking_threshold) && !sample.muted;
        true
    }

    pub fn set_deafened(&mut self, deafened: bool) {
        self.deafened = deafened;
        let volume = volume_for(deafened);
        for output in self.outputs.iter_mut() {
            output.set_volume(volume);
        }
    }

    pub fn is_deafened(&self) -> bool {
        self.deafened
    }

    fn fail_peer(&mut self, peer: &str, error: &MeshError) {
        tracing::warn!(peer = %peer, error = %error, "peer link failed");
        self.remove_peer(peer);
    }

    /// Close and forget the link to `peer`. Other links are untouched.
    pub fn remove_peer(&mut self, peer: &str) -> bool {
        let Some(mut link) = self.links.remove(peer) else {
            return false;
        };
        link.connection.close();
        if let Some(index) = link.output.take() {
            self.outputs.release(index);
        }
        tracing::info!(peer = %peer, "peer link removed");
        true
    }

    pub fn close_all(&mut self) {
        let peers: Vec<String> = self.links.keys().cloned().collect();
        for peer in peers {
            self.remove_peer(&peer);
        }
        self.local_track = None;
    }

    pub fn link(&self, peer: &str) -> Option<&PeerLink> {
        self.links.get(peer)
    }

    /// Links ordered by peer identity.
    pub fn links(&self) -> impl Iterator<Item = &PeerLink> {
        self.links.values()
    }

    pub fn len(&self) -> usize {
        self.links.len()
    }

    pub fn is_empty(&self) -> bool {
        self.links.is_empty()
    }

    pub fn output_volume(&self, peer: &str) -> Option<f32> {
        let index = self.links.get(peer)?.output?;
        self.outputs.get(index).map(|output| output.volume())
    }

    pub fn live_outputs(&self) -> usize {
        self.outputs.live()
    }
}

impl Drop for MeshManager {
    fn drop(&mut self) {
        self.close_all();
    }
}
