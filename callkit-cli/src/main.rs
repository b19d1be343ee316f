//! Callkit CLI Application
//!
//! Runs call scenarios between simulated participants on the in-memory
//! loopback network and prints what each controller reports.

use anyhow::{Context, Result};
use callkit_core::loopback::{
    LoopbackDevices, LoopbackHub, LoopbackNetwork, LoopbackRelayServer, RecordingCallRecords,
};
use callkit_core::prelude::*;
use clap::{Parser, Subcommand};
use rand::Rng;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// Name of the local participant (random if omitted)
    #[arg(short, long, env = "CALLKIT_IDENTITY")]
    identity: Option<String>,

    /// JSON file with controller settings
    #[arg(short, long, env = "CALLKIT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Place a direct call to a simulated peer
    Call {
        /// Peer to call
        peer: String,

        /// Send camera video
        #[arg(long)]
        video: bool,

        /// Have the peer decline instead of answering
        #[arg(long)]
        decline: bool,

        /// Let the call ring out instead of answering
        #[arg(long, conflicts_with = "decline")]
        no_answer: bool,

        /// Seconds to stay connected before hanging up
        #[arg(long, default_value = "2")]
        hold: u64,
    },

    /// Place a group call to several simulated members
    Group {
        /// Number of members besides the local participant
        #[arg(long, default_value = "3")]
        members: usize,

        /// Send camera video
        #[arg(long)]
        video: bool,

        /// Seconds to stay connected before hanging up
        #[arg(long, default_value = "2")]
        hold: u64,
    },

    /// Show the effective configuration
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("callkit_core=info")),
        )
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let identity = cli.identity.unwrap_or_else(generate_random_identity);

    match cli.command {
        Commands::Call {
            peer,
            video,
            decline,
            no_answer,
            hold,
        } => {
            let answer = if decline {
                Answer::Decline
            } else if no_answer {
                Answer::Ignore
            } else {
                Answer::Accept
            };
            handle_call(config, &identity, &peer, video, answer, hold).await?;
        }
        Commands::Group {
            members,
            video,
            hold,
        } => {
            handle_group(config, &identity, members, video, hold).await?;
        }
        Commands::Status => {
            handle_status(&config, &identity)?;
        }
    }

    Ok(())
}

/// What a simulated peer does when it rings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Answer {
    Accept,
    Decline,
    Ignore,
}

/// Loopback network shared by every simulated participant
struct Simulation {
    config: CallConfig,
    chat: ChatId,
    hub: Arc<LoopbackHub>,
    network: Arc<LoopbackNetwork>,
    relay: Arc<LoopbackRelayServer>,
}

impl Simulation {
    fn new(config: CallConfig, chat: &str) -> Self {
        Self {
            config,
            chat: ChatId::new(chat),
            hub: LoopbackHub::new(),
            network: LoopbackNetwork::new(),
            relay: LoopbackRelayServer::new(),
        }
    }

    fn participant(&self, name: &str) -> Result<CallSessionController> {
        let id = MemberId::new(name);
        let (gateway, inbox) = self.hub.register(id.clone());
        self.hub.join(&self.chat, &id);

        let controller = CallSessionController::builder(id.clone())
            .with_config(self.config.clone())
            .with_signaling(gateway)
            .with_records(Arc::new(RecordingCallRecords::new()))
            .with_devices(Arc::new(LoopbackDevices::new()))
            .with_peer_transport(self.network.transport(id.clone()))
            .with_relay_connector(self.relay.connector(id))
            .build()?;
        controller.spawn_signal_listener(inbox);
        Ok(controller)
    }

    /// Spawn a peer that reacts to its incoming call per `answer`
    fn auto_answer(&self, name: &str, answer: Answer) -> Result<CallSessionController> {
        let controller = self.participant(name)?;
        let mut events = controller.subscribe_events();
        let peer = controller.clone();
        tokio::spawn(async move {
            while let Ok(event) = events.recv().await {
                if !matches!(event, CallEvent::IncomingCall { .. }) {
                    continue;
                }
                let result = match answer {
                    Answer::Accept => peer.accept_call().await,
                    Answer::Decline => peer.reject_call(false).await,
                    Answer::Ignore => Ok(()),
                };
                if let Err(e) = result {
                    tracing::warn!(member = %peer.local_member(), error = %e, "Simulated peer could not answer");
                }
            }
        });
        Ok(controller)
    }
}

async fn handle_call(
    config: CallConfig,
    identity: &str,
    peer: &str,
    video: bool,
    answer: Answer,
    hold: u64,
) -> Result<()> {
    let sim = Simulation::new(config, &format!("{identity}+{peer}"));
    let local = sim.participant(identity)?;
    let _peer = sim.auto_answer(peer, answer)?;

    let options = if video {
        CallOptions::video_call()
    } else {
        CallOptions::audio_call()
    };
    println!("📞 {identity} calling {peer} (video: {video})");
    run_call(&sim, &local, options, hold).await
}

async fn handle_group(
    config: CallConfig,
    identity: &str,
    members: usize,
    video: bool,
    hold: u64,
) -> Result<()> {
    anyhow::ensure!(members > 0, "a group call needs at least one other member");
    let sim = Simulation::new(config, &format!("{identity}-group"));
    let local = sim.participant(identity)?;
    let mut peers = Vec::with_capacity(members);
    for idx in 1..=members {
        peers.push(sim.auto_answer(&format!("member-{idx}"), Answer::Accept)?);
    }

    println!("📞 {identity} calling {members} members (video: {video})");
    run_call(&sim, &local, CallOptions::group_call(video), hold).await
}

async fn run_call(
    sim: &Simulation,
    local: &CallSessionController,
    options: CallOptions,
    hold: u64,
) -> Result<()> {
    let mut events = local.subscribe_events();
    let call_id = local.start_call(sim.chat.clone(), options).await?;
    println!("🔔 Ringing, call {call_id}");

    let ring_limit = sim.config.answer_timeout + Duration::from_secs(1);
    let state = tokio::time::timeout(ring_limit, wait_for_outcome(&mut events))
        .await
        .context("call neither connected nor ended")??;

    if state == CallState::Connected {
        println!("✅ Connected");
        for member in local.members() {
            println!(
                "   {} | muted: {} | video: {} | screen: {}",
                member.member_id, member.is_muted, member.is_video_enabled, member.is_screen_sharing
            );
        }

        let after = local.toggle_mute().await?;
        println!("🎙️  Muted: {}", after.is_muted);
        let after = local.toggle_mute().await?;
        println!("🎙️  Muted: {}", after.is_muted);

        tokio::time::sleep(Duration::from_secs(hold)).await;
        local.end_call(EndReason::Hangup).await?;
    }

    let session = local.session().context("call session vanished")?;
    println!("📴 Call ended: {:?}", session.state);
    if let Some(duration) = session.duration() {
        println!("   Duration: {}s", duration.num_seconds());
    }
    Ok(())
}

/// Wait until the call connects or reaches a terminal state
async fn wait_for_outcome(events: &mut broadcast::Receiver<CallEvent>) -> Result<CallState> {
    loop {
        match events.recv().await {
            Ok(CallEvent::StateChanged { new_state, .. })
                if new_state == CallState::Connected || new_state.is_terminal() =>
            {
                return Ok(new_state);
            }
            Ok(other) => {
                tracing::debug!("Received event: {:?}", other);
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => {
                anyhow::bail!("event stream closed");
            }
        }
    }
}

fn handle_status(config: &CallConfig, identity: &str) -> Result<()> {
    println!("📊 Callkit status");
    println!("=================");
    println!("Identity: {identity}");
    match default_config_path() {
        Some(path) => println!("Default config: {}", path.display()),
        None => println!("Default config: unavailable"),
    }
    println!("{}", serde_json::to_string_pretty(config)?);
    println!();
    println!("Available commands:");
    println!("  callkit call <peer> [options]  - Simulate a direct call");
    println!("  callkit group [options]        - Simulate a group call");
    println!("  callkit status                 - Show this status");
    Ok(())
}

fn default_config_path() -> Option<PathBuf> {
    directories::ProjectDirs::from("org", "callkit", "callkit")
        .map(|dirs| dirs.config_dir().join("config.json"))
}

/// Load settings from `path`, the default location, or built-in defaults
fn load_config(path: Option<&Path>) -> Result<CallConfig> {
    let path = match path {
        Some(path) => path.to_path_buf(),
        None => match default_config_path() {
            Some(path) if path.exists() => path,
            _ => return Ok(CallConfig::default()),
        },
    };
    let json = std::fs::read_to_string(&path)
        .with_context(|| format!("reading {}", path.display()))?;
    CallConfig::from_json(&json).with_context(|| format!("parsing {}", path.display()))
}

fn generate_random_identity() -> String {
    const WORDS: &[&str] = &[
        "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india",
        "juliet", "kilo", "lima", "mike", "november", "oscar", "papa", "quebec", "romeo",
    ];

    let mut rng = rand::thread_rng();
    format!(
        "{}-{}",
        WORDS[rng.gen_range(0..WORDS.len())],
        rng.gen_range(100..1000)
    )
}
