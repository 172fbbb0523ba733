//! The voice session controller.
//!
//! One actor task owns every session resource (capture, relay subscription,
//! mesh) and processes commands, signaling, peer events, device errors and
//! the activity tick one at a time. Callers talk to it through a cloneable
//! [`VoiceHandle`] and observe it through a `watch` of [`SessionSnapshot`].

use std::future::{pending, Future};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Interval, MissedTickBehavior};

use huddle_voice::{ActivityMonitor, AudioDevice, LocalAudio};

use crate::config::SessionConfig;
use crate::envelope::ActivitySample;
use crate::error::MeshError;
use crate::mesh::{MeshManager, Outbound};
use crate::peer::{MeshEvent, PeerConnectionState, PeerConnector};
use crate::relay::SignalRelay;
use crate::signaling::{SignalEvent, SignalingChannel};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSnapshot {
    pub peer: String,
    pub connection_state: PeerConnectionState,
    pub is_initiator: bool,
    pub remote_muted: bool,
    pub is_speaking: bool,
    pub audio_level: f32,
}

/// What the display layer renders.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    /// Set by `enable` and cleared only by `disable`; survives `Error`.
    pub enabled: bool,
    pub state: SessionState,
    pub channel_id: Option<String>,
    pub identity: Option<String>,
    pub muted: bool,
    pub deafened: bool,
    pub local_level: f32,
    pub local_speaking: bool,
    pub error: Option<String>,
    pub peers: Vec<PeerSnapshot>,
}

impl SessionSnapshot {
    pub fn peer(&self, peer: &str) -> Option<&PeerSnapshot> {
        self.peers.iter().find(|p| p.peer == peer)
    }
}

/// Platform collaborators a session runs on.
#[derive(Clone)]
pub struct VoicePlatform {
    pub audio: Arc<dyn AudioDevice>,
    pub relay: Arc<dyn SignalRelay>,
    pub connector: Arc<dyn PeerConnector>,
}

enum Command {
    Enable {
        channel_id: String,
        identity: String,
        reply: oneshot::Sender<Result<SessionState, MeshError>>,
    },
    Disable {
        reply: oneshot::Sender<()>,
    },
    ToggleMute {
        reply: oneshot::Sender<bool>,
    },
    ToggleDeafen {
        reply: oneshot::Sender<bool>,
    },
}

/// Cloneable handle to a running session controller. The controller tears
/// its session down and exits once every handle is dropped.
#[derive(Clone)]
pub struct VoiceHandle {
    commands: mpsc::Sender<Command>,
    snapshots: watch::Receiver<SessionSnapshot>,
}

impl VoiceHandle {
    async fn request<T>(
        &self,
        command: Command,
        reply: oneshot::Receiver<T>,
    ) -> Result<T, MeshError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| MeshError::SessionClosed)?;
        reply.await.map_err(|_| MeshError::SessionClosed)
    }

    /// Join `channel_id` as `identity`. Resolves once the attempt has
    /// finished; a no-op returning the current state while connecting or
    /// connected.
    pub async fn enable(&self, channel_id: &str, identity: &str) -> Result<SessionState, MeshError> {
        let (reply, rx) = oneshot::channel();
        let command = Command::Enable {
            channel_id: channel_id.to_string(),
            identity: identity.to_string(),
            reply,
        };
        self.request(command, rx).await?
    }

    /// Leave the channel and release everything. All effects have been
    /// applied when this returns. Safe in any state.
    pub async fn disable(&self) -> Result<(), MeshError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::Disable { reply }, rx).await
    }

    /// Returns the new `muted` flag.
    pub async fn toggle_mute(&self) -> Result<bool, MeshError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::ToggleMute { reply }, rx).await
    }

    /// Returns the new `deafened` flag.
    pub async fn toggle_deafen(&self) -> Result<bool, MeshError> {
        let (reply, rx) = oneshot::channel();
        self.request(Command::ToggleDeafen { reply }, rx).await
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Wait until a published snapshot satisfies `condition`.
    pub async fn wait_for(
        &self,
        condition: impl FnMut(&SessionSnapshot) -> bool,
    ) -> Result<SessionSnapshot, MeshError> {
        let mut snapshots = self.snapshots.clone();
        let snapshot = snapshots
            .wait_for(condition)
            .await
            .map_err(|_| MeshError::SessionClosed)?;
        Ok((*snapshot).clone())
    }
}

/// Start a session controller on the current runtime.
pub fn spawn_session(config: SessionConfig, platform: VoicePlatform) -> (VoiceHandle, JoinHandle<()>) {
    let (command_tx, command_rx) = mpsc::channel(config.command_buffer.max(1));
    let (snapshot_tx, snapshot_rx) = watch::channel(SessionSnapshot::default());
    let actor = SessionActor::new(config, platform, command_rx, snapshot_tx);
    let task = tokio::spawn(actor.run_loop());
    (
        VoiceHandle {
            commands: command_tx,
            snapshots: snapshot_rx,
        },
        task,
    )
}

struct SessionActor {
    config: SessionConfig,
    platform: VoicePlatform,
    commands: mpsc::Receiver<Command>,
    snapshots: watch::Sender<SessionSnapshot>,

    enabled: bool,
    state: SessionState,
    muted: bool,
    deafened: bool,
    error: Option<String>,
    channel_id: Option<String>,
    identity: Option<String>,
    /// Activity sequence number; monotonic for the controller's lifetime.
    seq: u64,

    audio: Option<LocalAudio>,
    device_errors: Option<mpsc::UnboundedReceiver<String>>,
    signaling: Option<SignalingChannel>,
    mesh: Option<MeshManager>,
    peer_events: Option<mpsc::UnboundedReceiver<MeshEvent>>,
    ticker: Option<Interval>,
    monitor: ActivityMonitor,
    local_level: f32,
    local_speaking: bool,
}

impl SessionActor {
    fn new(
        config: SessionConfig,
        platform: VoicePlatform,
        commands: mpsc::Receiver<Command>,
        snapshots: watch::Sender<SessionSnapshot>,
    ) -> Self {
        let monitor = ActivityMonitor::new(&config.activity);
        Self {
            config,
            platform,
            commands,
            snapshots,
            enabled: false,
            state: SessionState::Disconnected,
            muted: false,
            deafened: false,
            error: None,
            channel_id: None,
            identity: None,
            seq: 0,
            audio: None,
            device_errors: None,
            signaling: None,
            mesh: None,
            peer_events: None,
            ticker: None,
            monitor,
            local_level: 0.0,
            local_speaking: false,
        }
    }

    async fn run_loop(mut self) {
        tracing::debug!("voice session controller started");
        loop {
            tokio::select! {
                command = self.commands.recv() => {
                    let Some(command) = command else {
                        tracing::debug!("all voice handles dropped");
                        break;
                    };
                    self.handle_command(command).await;
                }
                event = next_signal(self.signaling.as_mut()) => self.on_signal(event),
                event = next_peer_event(self.peer_events.as_mut()) => self.on_peer_event(event),
                error = next_device_error(self.device_errors.as_mut()) => self.on_device_error(error),
                () = next_tick(self.ticker.as_mut()) => self.on_tick(),
            }
        }
        self.disable();
        tracing::debug!("voice session controller stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Enable {
                channel_id,
                identity,
                reply,
            } => {
                let result = self.enable(channel_id, identity).await;
                let _ = reply.send(result);
            }
            Command::Disable { reply } => {
                self.disable();
                let _ = reply.send(());
            }
            other => self.handle_toggle(other),
        }
    }

    /// Commands that never suspend and are valid in every state.
    fn handle_toggle(&mut self, command: Command) {
        match command {
            Command::ToggleMute { reply } => {
                self.toggle_mute();
                let _ = reply.send(self.muted);
            }
            Command::ToggleDeafen { reply } => {
                self.toggle_deafen();
                let _ = reply.send(self.deafened);
            }
            Command::Enable { reply, .. } => {
                let _ = reply.send(Ok(self.state));
            }
            Command::Disable { reply } => {
                self.disable();
                let _ = reply.send(());
            }
        }
    }

    async fn enable(&mut self, channel_id: String, identity: String) -> Result<SessionState, MeshError> {
        if matches!(self.state, SessionState::Connecting | SessionState::Connected) {
            return Ok(self.state);
        }
        tracing::info!(channel = %channel_id, identity = %identity, "voice session connecting");
        self.enabled = true;
        self.error = None;
        self.channel_id = Some(channel_id.clone());
        self.identity = Some(identity.clone());
        self.state = SessionState::Connecting;
        self.publish();

        match self.connect(&channel_id, &identity).await {
            Ok(()) => {
                self.state = SessionState::Connected;
                self.publish();
                tracing::info!(channel = %channel_id, "voice session connected");
                Ok(SessionState::Connected)
            }
            Err(MeshError::Cancelled) => Err(MeshError::Cancelled),
            Err(e) => {
                self.fail(&e);
                Err(e)
            }
        }
    }

    async fn connect(&mut self, channel_id: &str, identity: &str) -> Result<(), MeshError> {
        let device = Arc::clone(&self.platform.audio);
        let constraints = self.config.constraints;
        let mut audio = self.interruptible(device.acquire(&constraints)).await??;

        audio.track().set_enabled(!self.muted);
        self.device_errors = audio.take_device_errors();
        let track = audio.track().clone();
        self.audio = Some(audio);

        let topic = self.config.topic_for(channel_id);
        let relay = Arc::clone(&self.platform.relay);
        let channel = self
            .interruptible(SignalingChannel::open(relay.as_ref(), &topic, identity))
            .await??;
        let signaling = self.signaling.insert(channel);
        signaling.announce_presence()?;

        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let mut mesh = MeshManager::new(
            identity,
            Arc::clone(&self.platform.connector),
            device,
            event_tx,
            self.config.activity.speaking_threshold,
        );
        mesh.set_deafened(self.deafened);
        mesh.set_local_track(Some(track));
        self.mesh = Some(mesh);
        self.peer_events = Some(event_rx);

        self.monitor.reset();
        let period = Duration::from_millis(self.config.activity.sample_interval_ms.max(1));
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        self.ticker = Some(ticker);
        Ok(())
    }

    /// Await `fut` while still serving commands. A disable (or every handle
    /// going away) abandons `fut` and yields [`MeshError::Cancelled`].
    async fn interruptible<T>(&mut self, fut: impl Future<Output = T>) -> Result<T, MeshError> {
        tokio::pin!(fut);
        loop {
            tokio::select! {
                output = &mut fut => return Ok(output),
                command = self.commands.recv() => match command {
                    Some(Command::Disable { reply }) => {
                        tracing::info!("connection attempt cancelled");
                        self.disable();
                        let _ = reply.send(());
                        return Err(MeshError::Cancelled);
                    }
                    Some(other) => self.handle_toggle(other),
                    None => {
                        self.disable();
                        return Err(MeshError::Cancelled);
                    }
                },
            }
        }
    }

    fn toggle_mute(&mut self) {
        self.muted = !self.muted;
        if let Some(audio) = &self.audio {
            audio.track().set_enabled(!self.muted);
        }
        if self.muted {
            self.local_level = 0.0;
            self.local_speaking = false;
        }
        tracing::info!(muted = self.muted, "mute toggled");
        self.broadcast_activity();
        self.publish();
    }

    fn toggle_deafen(&mut self) {
        self.deafened = !self.deafened;
        if let Some(mesh) = self.mesh.as_mut() {
            mesh.set_deafened(self.deafened);
        }
        tracing::info!(deafened = self.deafened, "deafen toggled");
        self.publish();
    }

    fn broadcast_activity(&mut self) {
        let (Some(signaling), Some(identity)) = (self.signaling.as_mut(), self.identity.as_ref())
        else {
            return;
        };
        self.seq += 1;
        let sample = ActivitySample {
            sender: identity.clone(),
            seq: self.seq,
            is_speaking: self.local_speaking && !self.muted,
            audio_level: if self.muted { 0.0 } else { self.local_level },
            muted: self.muted,
        };
        if let Err(e) = signaling.send_activity(sample) {
            tracing::debug!(error = %e, "activity sample not sent");
        }
    }

    fn on_tick(&mut self) {
        let Some(audio) = &self.audio else {
            return;
        };
        let reading = self.monitor.sample(audio.track());
        self.local_level = if self.muted { 0.0 } else { reading.level };
        self.local_speaking = reading.speaking && !self.muted;
        if reading.broadcast && !self.muted {
            self.broadcast_activity();
        }
        self.publish();
    }

    fn on_signal(&mut self, event: Option<SignalEvent>) {
        let Some(event) = event else {
            self.fail(&MeshError::RelayUnavailable("relay stream ended".into()));
            return;
        };
        let Some(mesh) = self.mesh.as_mut() else {
            return;
        };
        let known = mesh.len();
        let outbound = match event {
            SignalEvent::Roster(update) => mesh.on_roster(&update),
            SignalEvent::PeerPresence { peer, change } => mesh.on_peer_presence(&peer, change),
            SignalEvent::Negotiation { from, payload } => mesh.on_negotiation(&from, payload),
            SignalEvent::Activity(sample) => {
                mesh.on_activity(&sample);
                Vec::new()
            }
        };
        let grew = mesh.len() > known;
        self.relay(outbound);
        // New peers have not seen our mute state yet.
        if grew {
            self.broadcast_activity();
        }
        self.publish();
    }

    fn on_peer_event(&mut self, event: Option<MeshEvent>) {
        let (Some(event), Some(mesh)) = (event, self.mesh.as_mut()) else {
            self.peer_events = None;
            return;
        };
        let outbound = mesh.on_peer_event(event);
        self.relay(outbound);
        self.publish();
    }

    fn on_device_error(&mut self, error: Option<String>) {
        match error {
            Some(reason) => self.fail(&MeshError::AudioDevice(reason)),
            // Capture backend finished without reporting anything.
            None => self.device_errors = None,
        }
    }

    fn relay(&mut self, outbound: Vec<Outbound>) {
        let Some(signaling) = self.signaling.as_mut() else {
            return;
        };
        for Outbound { target, payload } in outbound {
            if let Err(e) = signaling.send_negotiation(&target, payload) {
                tracing::warn!(peer = %target, error = %e, "negotiation not relayed");
            }
        }
    }

    /// Release every session resource. Idempotent.
    fn teardown(&mut self) {
        self.ticker = None;
        if let Some(mut mesh) = self.mesh.take() {
            mesh.close_all();
        }
        self.peer_events = None;
        if let Some(mut audio) = self.audio.take() {
            audio.release();
        }
        self.device_errors = None;
        if let Some(mut signaling) = self.signaling.take() {
            signaling.unsubscribe();
        }
        self.monitor.reset();
        self.local_level = 0.0;
        self.local_speaking = false;
    }

    fn disable(&mut self) {
        let was = self.state;
        self.teardown();
        self.enabled = false;
        self.state = SessionState::Disconnected;
        self.error = None;
        self.channel_id = None;
        self.identity = None;
        self.publish();
        if was != SessionState::Disconnected {
            tracing::info!(from = ?was, "voice session disabled");
        }
    }

    fn fail(&mut self, error: &MeshError) {
        tracing::warn!(error = %error, "voice session failed");
        self.teardown();
        self.state = SessionState::Error;
        self.error = Some(error.to_string());
        self.publish();
    }

    fn snapshot(&self) -> SessionSnapshot {
        let peers = self
            .mesh
            .iter()
            .flat_map(|mesh| mesh.links())
            .map(|link| PeerSnapshot {
                peer: link.peer().to_string(),
                connection_state: link.state(),
                is_initiator: link.is_initiator(),
                remote_muted: link.remote_muted(),
                is_speaking: link.is_speaking(),
                audio_level: link.audio_level(),
            })
            .collect();
        SessionSnapshot {
            enabled: self.enabled,
            state: self.state,
            channel_id: self.channel_id.clone(),
            identity: self.identity.clone(),
            muted: self.muted,
            deafened: self.deafened,
            local_level: self.local_level,
            local_speaking: self.local_speaking,
            error: self.error.clone(),
            peers,
        }
    }

    fn publish(&self) {
        let next = self.snapshot();
        self.snapshots.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
    }
}

async fn next_signal(channel: Option<&mut SignalingChannel>) -> Option<SignalEvent> {
    match channel {
        Some(channel) => channel.next_event().await,
        None => pending().await,
    }
}

async fn next_peer_event(events: Option<&mut mpsc::UnboundedReceiver<MeshEvent>>) -> Option<MeshEvent> {
    match events {
        Some(events) => events.recv().await,
        None => pending().await,
    }
}

async fn next_device_error(errors: Option<&mut mpsc::UnboundedReceiver<String>>) -> Option<String> {
    match errors {
        Some(errors) => errors.recv().await,
        None => pending().await,
    }
}

async fn next_tick(ticker: Option<&mut Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loopback::LoopbackNetwork;
    use crate::relay::MemoryRelay;
    use huddle_voice::{SyntheticAudioDevice, SyntheticSignal};

    fn platform(device: &SyntheticAudioDevice, relay: &MemoryRelay) -> VoicePlatform {
        VoicePlatform {
            audio: Arc::new(device.clone()),
            relay: Arc::new(relay.clone()),
            connector: Arc::new(LoopbackNetwork::new().connector()),
        }
    }

    #[tokio::test]
    async fn enable_twice_is_a_no_op() {
        let device = SyntheticAudioDevice::new(SyntheticSignal::Silence);
        let relay = MemoryRelay::new();
        let (voice, _task) = spawn_session(SessionConfig::default(), platform(&device, &relay));

        assert_eq!(voice.enable("c1", "alice").await.unwrap(), SessionState::Connected);
        assert_eq!(voice.enable("c2", "alice").await.unwrap(), SessionState::Connected);
        assert_eq!(device.acquisitions(), 1);
        assert_eq!(relay.subscriber_count("voice:c1"), 1);
        assert_eq!(relay.subscriber_count("voice:c2"), 0);
        assert_eq!(voice.snapshot().channel_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn enabled_flag_spans_enable_to_disable() {
        let device = SyntheticAudioDevice::new(SyntheticSignal::Silence);
        let relay = MemoryRelay::new();
        let (voice, _task) = spawn_session(SessionConfig::default(), platform(&device, &relay));
        assert!(!voice.snapshot().enabled);

        voice.enable("c1", "alice").await.unwrap();
        assert!(voice.snapshot().enabled);

        voice.disable().await.unwrap();
        assert!(!voice.snapshot().enabled);
    }

    #[tokio::test]
    async fn dropping_every_handle_tears_down() {
        let device = SyntheticAudioDevice::new(SyntheticSignal::Silence);
        let relay = MemoryRelay::new();
        let (voice, task) = spawn_session(SessionConfig::default(), platform(&device, &relay));
        voice.enable("c1", "alice").await.unwrap();

        drop(voice);
        task.await.unwrap();
        assert_eq!(device.active_captures(), 0);
        assert_eq!(relay.subscriber_count("voice:c1"), 0);
    }

    #[tokio::test]
    async fn relay_refusal_is_an_error_and_releases_capture() {
        let device = SyntheticAudioDevice::new(SyntheticSignal::Silence);
        let relay = MemoryRelay::new();
        relay.set_available(false);
        let (voice, _task) = spawn_session(SessionConfig::default(), platform(&device, &relay));

        assert!(matches!(
            voice.enable("c1", "alice").await,
            Err(MeshError::RelayUnavailable(_))
        ));
        let snapshot = voice.snapshot();
        assert_eq!(snapshot.state, SessionState::Error);
        assert!(snapshot.enabled);
        assert!(snapshot.error.is_some());
        assert_eq!(device.active_captures(), 0);

        // Error is not sticky: a later enable may succeed.
        relay.set_available(true);
        assert_eq!(voice.enable("c1", "alice").await.unwrap(), SessionState::Connected);
        assert!(voice.snapshot().error.is_none());
    }

    #[tokio::test]
    async fn snapshot_serializes_camel_case() {
        let snapshot = SessionSnapshot {
            local_speaking: true,
            ..SessionSnapshot::default()
        };
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["state"], "disconnected");
        assert_eq!(value["localSpeaking"], true);
        assert_eq!(value["enabled"], false);
    }
}
