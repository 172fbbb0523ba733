use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use huddle_mesh::{
    spawn_session, LoopbackNetwork, MemoryRelay, PeerConnectionState, SessionConfig,
    SessionSnapshot, VoiceHandle, VoicePlatform,
};
use huddle_voice::{AudioConfig, AudioDevice, CpalAudioDevice, SyntheticAudioDevice, SyntheticSignal};
use tracing_subscriber::EnvFilter;

/// Command-line arguments for the simulator.
struct Args {
    channel: String,
    peers: Vec<String>,
    duration: Duration,
    config_path: Option<String>,
    /// Give the first participant the real microphone and speakers.
    live: bool,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = std::env::args().skip(1);
    let mut channel = "lobby".to_string();
    let mut peers = vec!["alice".to_string(), "bob".to_string(), "carol".to_string()];
    let mut duration = Duration::from_secs(6);
    let mut config_path = None;
    let mut live = false;

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--channel" => channel = args.next().unwrap_or_default(),
            "--peers" => {
                peers = args
                    .next()
                    .unwrap_or_default()
                    .split(',')
                    .map(str::trim)
                    .filter(|p| !p.is_empty())
                    .map(String::from)
                    .collect();
            }
            "--seconds" => {
                let secs: u64 = args
                    .next()
                    .unwrap_or_default()
                    .parse()
                    .context("--seconds expects a whole number")?;
                duration = Duration::from_secs(secs.max(1));
            }
            "--config" => config_path = args.next(),
            "--live" => live = true,
            other => tracing::warn!(arg = %other, "ignoring unknown argument"),
        }
    }

    if channel.is_empty() {
        bail!("--channel must not be empty");
    }
    if peers.len() < 2 {
        bail!("--peers needs at least two identities");
    }

    Ok(Args {
        channel,
        peers,
        duration,
        config_path,
        live,
    })
}

fn load_config(path: Option<&str>) -> anyhow::Result<SessionConfig> {
    let Some(path) = path else {
        return Ok(SessionConfig::default());
    };
    let text = std::fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    SessionConfig::from_json(&text).with_context(|| format!("parsing {path}"))
}

/// A distinct voice per participant so activity differs across the roster.
fn synthetic_signal(index: usize) -> SyntheticSignal {
    match index % 3 {
        0 => SyntheticSignal::Noise { amplitude: 0.6 },
        1 => SyntheticSignal::Tone {
            frequency: 220.0,
            amplitude: 0.4,
        },
        _ => SyntheticSignal::Silence,
    }
}

fn summarize(name: &str, snapshot: &SessionSnapshot) {
    match serde_json::to_string(snapshot) {
        Ok(json) => tracing::info!(participant = %name, snapshot = %json, "state"),
        Err(e) => tracing::warn!(participant = %name, error = %e, "snapshot not serializable"),
    }
}

async fn wait_for_full_mesh(name: &str, voice: &VoiceHandle, others: usize) -> anyhow::Result<()> {
    let full = move |s: &SessionSnapshot| {
        s.peers.len() == others
            && s.peers
                .iter()
                .all(|p| p.connection_state == PeerConnectionState::Connected)
    };
    tokio::time::timeout(Duration::from_secs(10), voice.wait_for(full))
        .await
        .with_context(|| format!("{name} did not reach a full mesh"))??;
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = parse_args()?;
    let config = load_config(args.config_path.as_deref())?;
    tracing::info!(channel = %args.channel, peers = ?args.peers, live = args.live, "huddle-sim starting");

    let relay = MemoryRelay::new();
    let network = LoopbackNetwork::new();

    let mut participants = Vec::new();
    for (index, name) in args.peers.iter().enumerate() {
        let audio: Arc<dyn AudioDevice> = if args.live && index == 0 {
            Arc::new(CpalAudioDevice::new(AudioConfig::default()))
        } else {
            Arc::new(SyntheticAudioDevice::new(synthetic_signal(index)))
        };
        let platform = VoicePlatform {
            audio,
            relay: Arc::new(relay.clone()),
            connector: Arc::new(network.connector()),
        };
        let (voice, task) = spawn_session(config.clone(), platform);
        voice
            .enable(&args.channel, name)
            .await
            .with_context(|| format!("{name} could not join {}", args.channel))?;
        participants.push((name.clone(), voice, task));
    }

    let others = participants.len() - 1;
    for (name, voice, _) in &participants {
        wait_for_full_mesh(name, voice, others).await?;
    }
    tracing::info!(peers = participants.len(), "full mesh established");

    let step = args.duration / 3;
    tokio::time::sleep(step).await;

    if let Some((name, voice, _)) = participants.first() {
        let muted = voice.toggle_mute().await?;
        tracing::info!(participant = %name, muted, "toggled mute");
    }
    if let Some((name, voice, _)) = participants.get(1) {
        let deafened = voice.toggle_deafen().await?;
        tracing::info!(participant = %name, deafened, "toggled deafen");
    }
    tokio::time::sleep(step).await;

    for (name, voice, _) in &participants {
        summarize(name, &voice.snapshot());
    }

    // The last participant leaves first; everyone else keeps their links.
    if let Some((name, voice, _)) = participants.last() {
        voice.disable().await?;
        tracing::info!(participant = %name, "left the channel");
    }
    tokio::time::sleep(step).await;

    for (name, voice, task) in participants {
        voice.disable().await?;
        summarize(&name, &voice.snapshot());
        drop(voice);
        task.await.context("session controller panicked")?;
    }
    tracing::info!(subscribers = relay.subscriber_count(&config.topic_for(&args.channel)), "huddle-sim finished");
    Ok(())
}
