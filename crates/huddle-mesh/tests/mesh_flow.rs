//! End-to-end voice sessions over the in-memory relay, loopback links and
//! synthetic audio devices. Every participant runs a real controller.

use std::sync::Arc;
use std::time::Duration;

use huddle_mesh::{
    spawn_session, LoopbackNetwork, MemoryRelay, MeshError, PeerConnectionState, SessionConfig,
    SessionSnapshot, SessionState, VoiceHandle, VoicePlatform,
};
use huddle_voice::{SyntheticAudioDevice, SyntheticSignal};

const WAIT: Duration = Duration::from_secs(5);

struct World {
    relay: MemoryRelay,
    network: LoopbackNetwork,
}

struct Participant {
    voice: VoiceHandle,
    device: SyntheticAudioDevice,
}

impl World {
    fn new() -> Self {
        Self {
            relay: MemoryRelay::new(),
            network: LoopbackNetwork::new(),
        }
    }

    fn participant(&self, signal: SyntheticSignal) -> Participant {
        self.participant_with(SyntheticAudioDevice::new(signal))
    }

    fn participant_with(&self, device: SyntheticAudioDevice) -> Participant {
        let platform = VoicePlatform {
            audio: Arc::new(device.clone()),
            relay: Arc::new(self.relay.clone()),
            connector: Arc::new(self.network.connector()),
        };
        let (voice, _task) = spawn_session(SessionConfig::default(), platform);
        Participant { voice, device }
    }
}

async fn settle(
    voice: &VoiceHandle,
    condition: impl FnMut(&SessionSnapshot) -> bool,
) -> SessionSnapshot {
    tokio::time::timeout(WAIT, voice.wait_for(condition))
        .await
        .expect("snapshot condition not reached in time")
        .expect("session controller stopped")
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

fn connected_to(snapshot: &SessionSnapshot, peers: &[&str]) -> bool {
    snapshot.peers.len() == peers.len()
        && peers.iter().all(|p| {
            snapshot
                .peer(p)
                .is_some_and(|s| s.connection_state == PeerConnectionState::Connected)
        })
}

fn assert_released(world: &World, who: &Participant, snapshot: &SessionSnapshot) {
    assert_eq!(snapshot.state, SessionState::Disconnected);
    assert!(snapshot.peers.is_empty());
    assert_eq!(who.device.active_captures(), 0);
    assert_eq!(world.relay.subscriber_count("voice:c1"), 0);
}

// ── Mesh formation ───────────────────────────────────────────────────

#[tokio::test]
async fn alice_initiates_towards_bob() {
    let world = World::new();
    let alice = world.participant(SyntheticSignal::Silence);
    let bob = world.participant(SyntheticSignal::Silence);

    assert_eq!(
        alice.voice.enable("c1", "alice").await.unwrap(),
        SessionState::Connected
    );
    bob.voice.enable("c1", "bob").await.unwrap();

    let a = settle(&alice.voice, |s| connected_to(s, &["bob"])).await;
    let b = settle(&bob.voice, |s| connected_to(s, &["alice"])).await;
    assert!(a.peer("bob").unwrap().is_initiator);
    assert!(!b.peer("alice").unwrap().is_initiator);

    bob.voice.disable().await.unwrap();
    settle(&alice.voice, |s| s.peers.is_empty()).await;
    assert_eq!(alice.voice.snapshot().state, SessionState::Connected);
}

#[tokio::test]
async fn leaving_only_drops_the_leavers_links() {
    let world = World::new();
    let alice = world.participant(SyntheticSignal::Silence);
    let bob = world.participant(SyntheticSignal::Silence);
    let carol = world.participant(SyntheticSignal::Silence);

    alice.voice.enable("c1", "alice").await.unwrap();
    bob.voice.enable("c1", "bob").await.unwrap();
    carol.voice.enable("c1", "carol").await.unwrap();
    settle(&alice.voice, |s| connected_to(s, &["bob", "carol"])).await;
    settle(&bob.voice, |s| connected_to(s, &["alice", "carol"])).await;
    settle(&carol.voice, |s| connected_to(s, &["alice", "bob"])).await;

    carol.voice.disable().await.unwrap();
    settle(&alice.voice, |s| connected_to(s, &["bob"])).await;
    settle(&bob.voice, |s| connected_to(s, &["alice"])).await;
    assert!(carol.voice.snapshot().peers.is_empty());
}

#[tokio::test]
async fn remote_audio_reaches_the_peer() {
    let world = World::new();
    let alice = world.participant(SyntheticSignal::Tone {
        frequency: 440.0,
        amplitude: 0.3,
    });
    let bob = world.participant(SyntheticSignal::Silence);

    alice.voice.enable("c1", "alice").await.unwrap();
    bob.voice.enable("c1", "bob").await.unwrap();
    settle(&bob.voice, |s| connected_to(s, &["alice"])).await;

    eventually(|| {
        bob.device
            .live_outputs()
            .iter()
            .any(|o| o.peer() == "alice" && o.samples_received() > 0)
    })
    .await;
}

// ── Failure paths ────────────────────────────────────────────────────

#[tokio::test]
async fn denied_microphone_never_touches_the_relay() {
    let world = World::new();
    let alice = world.participant_with(SyntheticAudioDevice::denied("user dismissed prompt"));

    let err = alice.voice.enable("c1", "alice").await.unwrap_err();
    assert!(matches!(err, MeshError::PermissionDenied(_)));

    let snapshot = alice.voice.snapshot();
    assert_eq!(snapshot.state, SessionState::Error);
    assert!(snapshot.error.unwrap().contains("user dismissed prompt"));
    assert!(snapshot.peers.is_empty());
    assert_eq!(world.relay.subscriber_count("voice:c1"), 0);
    assert_eq!(alice.device.acquisitions(), 0);
}

#[tokio::test]
async fn relay_outage_moves_session_to_error() {
    let world = World::new();
    let alice = world.participant(SyntheticSignal::Silence);
    let bob = world.participant(SyntheticSignal::Silence);
    alice.voice.enable("c1", "alice").await.unwrap();
    bob.voice.enable("c1", "bob").await.unwrap();
    settle(&alice.voice, |s| connected_to(s, &["bob"])).await;

    world.relay.disconnect_all();
    let snapshot = settle(&alice.voice, |s| s.state == SessionState::Error).await;
    assert!(snapshot.error.is_some());
    assert!(snapshot.peers.is_empty());
    assert_eq!(alice.device.active_captures(), 0);
}

#[tokio::test]
async fn capture_fault_moves_session_to_error() {
    let world = World::new();
    let alice = world.participant(SyntheticSignal::Silence);
    let bob = world.participant(SyntheticSignal::Silence);
    alice.voice.enable("c1", "alice").await.unwrap();
    bob.voice.enable("c1", "bob").await.unwrap();
    settle(&alice.voice, |s| connected_to(s, &["bob"])).await;

    assert!(alice.device.fail_capture("headset unplugged"));
    let snapshot = settle(&alice.voice, |s| s.state == SessionState::Error).await;
    assert!(snapshot.error.unwrap().contains("headset unplugged"));
    assert!(snapshot.peers.is_empty());
    assert_eq!(alice.device.active_captures(), 0);
    assert_eq!(world.relay.subscriber_count("voice:c1"), 1);
    settle(&bob.voice, |s| s.peers.is_empty()).await;
}

#[tokio::test]
async fn failed_link_leaves_other_peers_connected() {
    let world = World::new();
    let alice = world.participant(SyntheticSignal::Silence);
    let bob = world.participant(SyntheticSignal::Silence);
    let carol = world.participant(SyntheticSignal::Silence);
    alice.voice.enable("c1", "alice").await.unwrap();
    bob.voice.enable("c1", "bob").await.unwrap();
    carol.voice.enable("c1", "carol").await.unwrap();
    settle(&alice.voice, |s| connected_to(s, &["bob", "carol"])).await;
    settle(&bob.voice, |s| connected_to(s, &["alice", "carol"])).await;

    world.network.fail_link("alice", "bob");
    let a = settle(&alice.voice, |s| connected_to(s, &["carol"])).await;
    assert_eq!(a.state, SessionState::Connected);
    settle(&bob.voice, |s| connected_to(s, &["carol"])).await;
}

#[tokio::test]
async fn lost_negotiation_leaves_links_unconnected() {
    let world = World::new();
    world
        .relay
        .drop_messages_where(|text| text.contains(r#""kind":"negotiation""#));
    let alice = world.participant(SyntheticSignal::Silence);
    let bob = world.participant(SyntheticSignal::Silence);
    alice.voice.enable("c1", "alice").await.unwrap();
    bob.voice.enable("c1", "bob").await.unwrap();

    settle(&alice.voice, |s| s.peer("bob").is_some()).await;
    settle(&bob.voice, |s| s.peer("alice").is_some()).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    let a = alice.voice.snapshot();
    assert_eq!(
        a.peer("bob").unwrap().connection_state,
        PeerConnectionState::Connecting
    );
    let b = bob.voice.snapshot();
    assert_eq!(
        b.peer("alice").unwrap().connection_state,
        PeerConnectionState::New
    );
    assert!(alice.device.live_outputs().is_empty());

    alice.voice.disable().await.unwrap();
    settle(&bob.voice, |s| s.peers.is_empty()).await;
}

// ── Disable ──────────────────────────────────────────────────────────

#[tokio::test]
async fn disable_is_idempotent_from_every_state() {
    let world = World::new();
    let alice = world.participant(SyntheticSignal::Noise { amplitude: 0.4 });
    let bob = world.participant(SyntheticSignal::Silence);
    bob.voice.enable("c1", "bob").await.unwrap();

    // Disconnected
    alice.voice.disable().await.unwrap();
    alice.voice.disable().await.unwrap();
    assert_eq!(alice.voice.snapshot().state, SessionState::Disconnected);

    // Connected
    alice.voice.enable("c1", "alice").await.unwrap();
    settle(&alice.voice, |s| connected_to(s, &["bob"])).await;
    for _ in 0..2 {
        alice.voice.disable().await.unwrap();
        let snapshot = alice.voice.snapshot();
        assert_eq!(snapshot.state, SessionState::Disconnected);
        assert!(snapshot.peers.is_empty());
        assert_eq!(alice.device.active_captures(), 0);
        assert_eq!(world.relay.subscriber_count("voice:c1"), 1);
    }
    settle(&bob.voice, |s| s.peers.is_empty()).await;

    // Error
    alice.device.deny(Some("device busy"));
    assert!(alice.voice.enable("c1", "alice").await.is_err());
    assert_eq!(alice.voice.snapshot().state, SessionState::Error);
    for _ in 0..2 {
        alice.voice.disable().await.unwrap();
        let snapshot = alice.voice.snapshot();
        assert_eq!(snapshot.state, SessionState::Disconnected);
        assert!(snapshot.error.is_none());
    }

    bob.voice.disable().await.unwrap();
    assert_released(&world, &bob, &bob.voice.snapshot());
}

#[tokio::test]
async fn disable_cancels_pending_acquisition() {
    let world = World::new();
    let alice = world.participant(SyntheticSignal::Silence);
    alice.device.set_acquire_delay(Duration::from_millis(500));

    let voice = alice.voice.clone();
    let enabling = tokio::spawn(async move { voice.enable("c1", "alice").await });
    settle(&alice.voice, |s| s.state == SessionState::Connecting).await;

    alice.voice.disable().await.unwrap();
    assert_released(&world, &alice, &alice.voice.snapshot());
    assert!(matches!(
        enabling.await.unwrap(),
        Err(MeshError::Cancelled)
    ));

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(alice.device.acquisitions(), 0);
    assert_eq!(alice.voice.snapshot().state, SessionState::Disconnected);
}

#[tokio::test]
async fn disable_cancels_pending_subscription() {
    let world = World::new();
    world.relay.set_subscribe_delay(Duration::from_millis(500));
    let alice = world.participant(SyntheticSignal::Silence);

    let voice = alice.voice.clone();
    let enabling = tokio::spawn(async move { voice.enable("c1", "alice").await });
    eventually(|| alice.device.acquisitions() == 1).await;

    alice.voice.disable().await.unwrap();
    assert_released(&world, &alice, &alice.voice.snapshot());
    assert!(matches!(
        enabling.await.unwrap(),
        Err(MeshError::Cancelled)
    ));

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(world.relay.subscriber_count("voice:c1"), 0);
}

// ── Mute / deafen ────────────────────────────────────────────────────

#[tokio::test]
async fn mute_while_disconnected_carries_into_session() {
    let world = World::new();
    let alice = world.participant(SyntheticSignal::Silence);
    let bob = world.participant(SyntheticSignal::Silence);

    assert!(alice.voice.toggle_mute().await.unwrap());
    assert!(alice.voice.snapshot().muted);

    alice.voice.enable("c1", "alice").await.unwrap();
    bob.voice.enable("c1", "bob").await.unwrap();
    assert!(alice.voice.snapshot().muted);
    assert!(!alice.device.last_track().unwrap().is_enabled());
    settle(&bob.voice, |s| s.peer("alice").is_some_and(|p| p.remote_muted)).await;
}

#[tokio::test]
async fn mute_twice_restores_flag_and_track() {
    let world = World::new();
    let alice = world.participant(SyntheticSignal::Silence);
    let bob = world.participant(SyntheticSignal::Silence);
    alice.voice.enable("c1", "alice").await.unwrap();
    bob.voice.enable("c1", "bob").await.unwrap();
    settle(&bob.voice, |s| connected_to(s, &["alice"])).await;
    let track = alice.device.last_track().unwrap();

    assert!(alice.voice.toggle_mute().await.unwrap());
    assert!(!track.is_enabled());
    settle(&bob.voice, |s| s.peer("alice").is_some_and(|p| p.remote_muted)).await;

    assert!(!alice.voice.toggle_mute().await.unwrap());
    assert!(track.is_enabled());
    settle(&bob.voice, |s| s.peer("alice").is_some_and(|p| !p.remote_muted)).await;

    // Links survive muting.
    assert!(connected_to(&alice.voice.snapshot(), &["bob"]));
}

#[tokio::test]
async fn deafen_silences_current_and_later_outputs() {
    let world = World::new();
    let alice = world.participant(SyntheticSignal::Silence);
    let bob = world.participant(SyntheticSignal::Silence);
    let carol = world.participant(SyntheticSignal::Silence);
    alice.voice.enable("c1", "alice").await.unwrap();
    bob.voice.enable("c1", "bob").await.unwrap();
    eventually(|| alice.device.live_outputs().len() == 1).await;

    assert!(alice.voice.toggle_deafen().await.unwrap());
    assert!(alice.device.live_outputs().iter().all(|o| o.volume() == 0.0));
    assert!(alice.device.last_track().unwrap().is_enabled());
    assert!(!alice.voice.snapshot().muted);

    carol.voice.enable("c1", "carol").await.unwrap();
    eventually(|| alice.device.live_outputs().len() == 2).await;
    assert!(alice.device.live_outputs().iter().all(|o| o.volume() == 0.0));

    assert!(!alice.voice.toggle_deafen().await.unwrap());
    assert!(alice.device.live_outputs().iter().all(|o| o.volume() == 1.0));
}

#[tokio::test]
async fn deafen_while_disconnected_applies_on_join() {
    let world = World::new();
    let alice = world.participant(SyntheticSignal::Silence);
    let bob = world.participant(SyntheticSignal::Silence);
    assert!(alice.voice.toggle_deafen().await.unwrap());

    alice.voice.enable("c1", "alice").await.unwrap();
    bob.voice.enable("c1", "bob").await.unwrap();
    eventually(|| alice.device.live_outputs().len() == 1).await;
    assert_eq!(alice.device.live_outputs()[0].volume(), 0.0);
}

// ── Activity ─────────────────────────────────────────────────────────

#[tokio::test]
async fn speaking_state_fans_out_to_peers() {
    let world = World::new();
    let alice = world.participant(SyntheticSignal::Noise { amplitude: 0.8 });
    let bob = world.participant(SyntheticSignal::Silence);
    alice.voice.enable("c1", "alice").await.unwrap();
    bob.voice.enable("c1", "bob").await.unwrap();

    settle(&alice.voice, |s| s.local_speaking).await;
    let b = settle(&bob.voice, |s| s.peer("alice").is_some_and(|p| p.is_speaking)).await;
    assert!(b.peer("alice").unwrap().audio_level > 0.15);

    alice.device.set_signal(SyntheticSignal::Silence);
    settle(&bob.voice, |s| s.peer("alice").is_some_and(|p| !p.is_speaking)).await;
    settle(&alice.voice, |s| !s.local_speaking).await;
}

#[tokio::test]
async fn muted_speaker_is_not_shown_speaking() {
    let world = World::new();
    let alice = world.participant(SyntheticSignal::Noise { amplitude: 0.8 });
    let bob = world.participant(SyntheticSignal::Silence);
    alice.voice.enable("c1", "alice").await.unwrap();
    bob.voice.enable("c1", "bob").await.unwrap();
    settle(&bob.voice, |s| s.peer("alice").is_some_and(|p| p.is_speaking)).await;

    alice.voice.toggle_mute().await.unwrap();
    let b = settle(&bob.voice, |s| s.peer("alice").is_some_and(|p| p.remote_muted)).await;
    assert!(!b.peer("alice").unwrap().is_speaking);
    let a = settle(&alice.voice, |s| s.local_level == 0.0).await;
    assert!(!a.local_speaking);
}
