//! CLI command implementations

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use clap::{Args, Subcommand};
use seedsim_core::config::SeedSimConfig;
use seedsim_core::dht::{DhtNode, NodeId};
use seedsim_core::peer::{PeerId, PeerListener};
use seedsim_core::profile::SeedingProfile;
use seedsim_core::random::{RandomSource, SeededRandom};
use seedsim_core::scheduler::{SchedulerDeps, SessionScheduler, spawn_scheduler};
use seedsim_core::telemetry::{ChannelSink, TelemetrySnapshot};
use seedsim_core::torrent::{InfoHash, ResumeData, TorrentMetadata};
use seedsim_core::tracker::{
    AnnounceEvent, AnnounceRequest, MultiProtocolTrackerClient, TrackerClient,
};

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Seed a synthetic torrent until interrupted
    Seed(SeedArgs),
    /// Send a single announce and print the tracker's answer
    Announce {
        /// Tracker announce URL (http, https or udp)
        tracker: String,
        /// 40-character hex info hash
        info_hash: String,
        /// Port advertised to the tracker
        #[arg(short, long, default_value = "6881")]
        port: u16,
        /// Announce event: started, stopped, completed or none
        #[arg(long, default_value = "started")]
        event: String,
    },
    /// List the built-in seeding profiles
    Profiles,
}

#[derive(Args)]
pub struct SeedArgs {
    /// Tracker announce URL; repeat for several trackers
    #[arg(short, long = "tracker")]
    trackers: Vec<String>,
    /// 40-character hex info hash; random when omitted
    #[arg(long)]
    info_hash: Option<String>,
    /// Torrent name shown in telemetry
    #[arg(long, default_value = "seedsim")]
    name: String,
    /// Total torrent size in bytes
    #[arg(long, default_value = "734003200")]
    size: u64,
    /// Piece length in bytes
    #[arg(long, default_value = "262144")]
    piece_length: u32,
    /// Seeding profile preset
    #[arg(long)]
    profile: Option<String>,
    /// Upload cap in bytes per second, overriding the profile
    #[arg(long)]
    upload_cap: Option<u64>,
    /// Connection cap, overriding the profile
    #[arg(long)]
    max_connections: Option<usize>,
    /// TCP port accepting peers
    #[arg(short, long)]
    port: Option<u16>,
    /// Join the DHT as an additional peer source
    #[arg(long)]
    dht: bool,
    /// Seed for reproducible runs
    #[arg(long)]
    seed: Option<u64>,
    /// Stop after this many seconds
    #[arg(long)]
    duration: Option<u64>,
    /// Print snapshots as JSON lines
    #[arg(long)]
    json: bool,
}

/// Handle the CLI command
///
/// # Errors
/// Returns appropriate error based on the command that fails
pub async fn handle_command(command: Commands) -> Result<()> {
    match command {
        Commands::Seed(args) => seed(args).await,
        Commands::Announce {
            tracker,
            info_hash,
            port,
            event,
        } => announce_once(&tracker, &info_hash, port, &event).await,
        Commands::Profiles => {
            list_profiles();
            Ok(())
        }
    }
}

/// Seeds one synthetic torrent and prints telemetry until Ctrl+C or the
/// requested duration.
///
/// # Errors
/// - Invalid arguments or configuration
/// - Listener or DHT socket could not be bound
pub async fn seed(args: SeedArgs) -> Result<()> {
    let mut config = SeedSimConfig::from_env();
    if let Some(port) = args.port {
        config.torrent.listen_port = port;
    }
    if args.dht {
        config.dht.enabled = true;
    }
    if let Some(seed) = args.seed {
        config.simulation.deterministic_seed = Some(seed);
    }
    if let Some(profile) = &args.profile {
        config.simulation.default_profile = profile.clone();
    }
    config.validate().context("invalid configuration")?;

    let mut rng = match config.simulation.deterministic_seed {
        Some(seed) => SeededRandom::from_seed(seed),
        None => SeededRandom::from_entropy(),
    };
    let profile = build_profile(&args, &config)?;
    let metadata = build_metadata(&args, &mut rng)?;
    if metadata.announce_urls.is_empty() && !config.dht.enabled {
        bail!("no peer source: pass at least one --tracker or enable --dht");
    }

    let tracker = Arc::new(
        MultiProtocolTrackerClient::new(&config.tracker).context("failed to build HTTP client")?,
    );
    let (sink, mut snapshots) = ChannelSink::new();
    let mut deps = SchedulerDeps::new(tracker, Arc::new(sink));

    let dht = if config.dht.enabled {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.dht.port));
        let own_id = NodeId::random(&mut rng);
        let node = DhtNode::bind(addr, own_id, config.dht.query_timeout, &mut rng)
            .await
            .context("failed to bind DHT socket")?;
        node.bootstrap(&config.dht.bootstrap_nodes).await;
        deps = deps.with_dht(Arc::clone(&node));
        Some(node)
    } else {
        None
    };

    let scheduler = SessionScheduler::new(config.clone(), deps, Instant::now())?;
    let listen_addr = SocketAddr::from(([0, 0, 0, 0], config.torrent.listen_port));
    let listener = PeerListener::bind(
        listen_addr,
        Arc::clone(scheduler.connections()),
        config.peer.handshake_timeout,
    )
    .await
    .with_context(|| format!("failed to listen on {listen_addr}"))?;

    let handle = spawn_scheduler(scheduler);
    tracing::info!(
        "Scheduler started: profile '{}', {} tracker(s), DHT {}",
        profile.name,
        metadata.announce_urls.len(),
        if dht.is_some() { "on" } else { "off" }
    );
    let info_hash = handle
        .add_torrent(metadata, Some(profile), ResumeData::default())
        .await?;
    println!("Seeding {info_hash} ({}) on {}", args.name, listener.local_addr());
    println!("Press Ctrl+C to stop");

    let deadline = args.duration.map(Duration::from_secs);
    let stop_after = async {
        match deadline {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(stop_after);

    loop {
        tokio::select! {
            snapshot = snapshots.recv() => {
                let Some(snapshot) = snapshot else {
                    break;
                };
                print_snapshot(&snapshot, args.json)?;
            }
            _ = tokio::signal::ctrl_c() => {
                println!("Interrupted, announcing stop...");
                break;
            }
            _ = &mut stop_after => {
                println!("Duration reached, announcing stop...");
                break;
            }
        }
    }

    listener.shutdown();
    handle.shutdown().await?;
    if let Some(node) = dht {
        node.shutdown();
    }
    println!("Stopped");
    Ok(())
}

fn build_profile(args: &SeedArgs, config: &SeedSimConfig) -> Result<SeedingProfile> {
    let mut profile = SeedingProfile::by_name(&config.simulation.default_profile)?;
    if args.upload_cap.is_some() || args.max_connections.is_some() {
        profile = SeedingProfile {
            max_connections: config.peer.per_torrent_max_connections,
            ..profile
        };
        profile.name = format!("{}+custom", profile.name);
    }
    if let Some(cap) = args.upload_cap {
        profile.upload_speed = cap;
    }
    if let Some(connections) = args.max_connections {
        profile.max_connections = connections;
    }
    profile.validate()?;
    Ok(profile)
}

fn build_metadata(args: &SeedArgs, rng: &mut dyn RandomSource) -> Result<TorrentMetadata> {
    let info_hash = match &args.info_hash {
        Some(hex) => InfoHash::from_hex(hex)?,
        None => {
            let mut bytes = [0u8; 20];
            rng.fill_bytes(&mut bytes);
            InfoHash::new(bytes)
        }
    };
    let metadata = TorrentMetadata::new(
        info_hash,
        args.name.clone(),
        args.piece_length,
        args.size,
        vec![args.trackers.clone()],
    )?;
    Ok(metadata)
}

fn print_snapshot(snapshot: &TelemetrySnapshot, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string(snapshot)?);
        return Ok(());
    }

    for torrent in &snapshot.torrents {
        println!(
            "{} [{:?}] up {:.1} KiB/s, total {:.2} MiB, {} peers ({} queued)",
            torrent.name,
            torrent.state,
            torrent.upload_speed as f64 / 1024.0,
            torrent.total_uploaded as f64 / 1_048_576.0,
            torrent.connections,
            torrent.queued_candidates,
        );
        for tracker in &torrent.trackers {
            println!(
                "  {} {:?}: {} seeders, {} leechers{}",
                tracker.url,
                tracker.status,
                tracker.seeders,
                tracker.leechers,
                tracker
                    .last_error
                    .as_deref()
                    .map(|e| format!(" ({e})"))
                    .unwrap_or_default()
            );
        }
    }
    Ok(())
}

fn parse_event(event: &str) -> Result<AnnounceEvent> {
    Ok(match event {
        "started" => AnnounceEvent::Started,
        "stopped" => AnnounceEvent::Stopped,
        "completed" => AnnounceEvent::Completed,
        "none" => AnnounceEvent::None,
        other => bail!("unknown announce event '{other}'"),
    })
}

/// Sends one announce and prints the response.
///
/// # Errors
/// - Invalid info hash or event
/// - Tracker request failed
pub async fn announce_once(tracker: &str, info_hash: &str, port: u16, event: &str) -> Result<()> {
    let config = SeedSimConfig::from_env();
    let event = parse_event(event)?;

    let mut rng = SeededRandom::from_entropy();
    let request = AnnounceRequest {
        info_hash: InfoHash::from_hex(info_hash)?,
        peer_id: PeerId::generate(&config.torrent.client_id, &mut rng),
        port,
        uploaded: 0,
        downloaded: 0,
        left: 0,
        event,
        numwant: if event == AnnounceEvent::Stopped {
            0
        } else {
            config.torrent.numwant
        },
        key: rng.next_u32(),
        tracker_id: None,
    };

    let client = MultiProtocolTrackerClient::new(&config.tracker)?;
    let response = client.announce(tracker, &request).await?;

    println!("Tracker: {tracker}");
    println!("Interval: {}s", response.interval);
    if let Some(min_interval) = response.min_interval {
        println!("Min interval: {min_interval}s");
    }
    println!("Seeders: {}", response.complete);
    println!("Leechers: {}", response.incomplete);
    if let Some(warning) = &response.warning_message {
        println!("Warning: {warning}");
    }
    println!("Peers ({}):", response.peers.len());
    for peer in &response.peers {
        println!("  {peer}");
    }
    Ok(())
}

fn list_profiles() {
    println!("Seeding Profiles");
    println!("{:-<60}", "");
    for profile in [
        SeedingProfile::conservative(),
        SeedingProfile::balanced(),
        SeedingProfile::aggressive(),
    ] {
        let upload = match profile.upload_speed {
            0 => "unlimited".to_string(),
            speed => format!("{} KiB/s", speed / 1024),
        };
        println!(
            "{:<14} up {:<12} {:>3} connections, announce every {}s",
            profile.name,
            upload,
            profile.max_connections,
            profile.announce_interval.as_secs()
        );
    }
}
