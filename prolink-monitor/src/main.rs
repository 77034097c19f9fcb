//! Text monitor for the ProDJ Link client
//!
//! Joins the link, prints one line per player event and serves as the
//! reference consumer of the event stream and query interface.

use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use prolink_net::{Config, PlayerEvent, ProLink};

#[derive(Parser)]
#[command(name = "prolink-monitor")]
#[command(about = "Watch Pioneer ProDJ Link players on the local network")]
struct Cli {
    /// Our interface address; required for keepalive announcements and
    /// link info queries
    #[arg(long)]
    ip: Option<Ipv4Addr>,

    /// Our mac address (aa:bb:cc:dd:ee:ff)
    #[arg(long)]
    mac: Option<String>,

    /// Broadcast address of the link network
    #[arg(long, default_value = "255.255.255.255")]
    broadcast: Ipv4Addr,

    /// Player number to announce ourselves with
    #[arg(long, default_value = "5")]
    player_number: u8,

    /// Append played tracks to this log file
    #[arg(long)]
    history_log: Option<PathBuf>,

    /// Download every newly loaded track
    #[arg(long)]
    auto_download: bool,

    /// Target directory for downloads
    #[arg(long, default_value = "./downloads")]
    download_dir: PathBuf,

    /// Directory for downloaded export databases
    #[arg(long, default_value = "./databases")]
    database_dir: PathBuf,

    /// Print events as JSON lines
    #[arg(long)]
    json: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn parse_mac(s: &str) -> anyhow::Result<[u8; 6]> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        anyhow::bail!("mac address must have six octets");
    }
    let mut mac = [0u8; 6];
    for (slot, part) in mac.iter_mut().zip(parts) {
        *slot = u8::from_str_radix(part, 16)?;
    }
    Ok(mac)
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config {
        vcdj_player_number: cli.player_number,
        own_ip: cli.ip,
        own_mac: cli.mac.as_deref().map(parse_mac).transpose()?,
        broadcast_ip: cli.broadcast,
        played_tracks_log: cli.history_log,
        auto_track_download: cli.auto_download,
        download_dir: cli.download_dir,
        database_dir: cli.database_dir,
        ..Config::default()
    };

    info!("joining the link");
    let (client, mut events) = ProLink::start(config).await?;

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                print_event(&client, event, cli.json);
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutting down");
                break;
            }
        }
    }

    client.shutdown().await;
    Ok(())
}

fn print_event(client: &ProLink, event: PlayerEvent, json: bool) {
    match event {
        PlayerEvent::Added(player_number) => {
            let Some(player) = client.player_snapshot(player_number) else {
                return;
            };
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "event": "added",
                        "player": player_number,
                        "model": player.model,
                        "ip": player.ip_addr.to_string(),
                    })
                );
            } else {
                println!(
                    "player {} appeared: {} at {}",
                    player_number, player.model, player.ip_addr
                );
            }
        }
        PlayerEvent::Changed(player_number) => {
            let Some(player) = client.player_snapshot(player_number) else {
                return;
            };
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "event": "changed",
                        "player": player_number,
                        "bpm": player.bpm,
                        "pitch": player.actual_pitch,
                        "beat": player.beat,
                        "play_state": player.play_state,
                        "position": player.position,
                        "on_air": player.on_air,
                        "track_id": player.track_id,
                    })
                );
            } else {
                let bpm = player
                    .bpm
                    .map(|b| format!("{:.2}", b))
                    .unwrap_or_else(|| "-".into());
                let position = player
                    .position
                    .map(|p| format!("{:7.2}s", p))
                    .unwrap_or_else(|| "   ?   ".into());
                println!(
                    "player {}: {:?} bpm {} pitch {:+.2}% beat {} pos {}",
                    player_number,
                    player.play_state,
                    bpm,
                    (player.actual_pitch - 1.0) * 100.0,
                    player.beat,
                    position,
                );
            }
        }
        PlayerEvent::Removed(player_number) => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({"event": "removed", "player": player_number})
                );
            } else {
                println!("player {} left", player_number);
            }
        }
        PlayerEvent::MediaChanged {
            player_number,
            slot,
        } => {
            if json {
                println!(
                    "{}",
                    serde_json::json!({
                        "event": "media_changed",
                        "player": player_number,
                        "slot": slot.to_string(),
                    })
                );
            } else {
                println!("player {} media changed in {} slot", player_number, slot);
            }
        }
    }
}
