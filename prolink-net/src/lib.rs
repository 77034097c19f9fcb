//! prolink-net: live Pioneer ProDJ Link client
//!
//! Joins the link passively, tracks player state from the three UDP
//! broadcast families and serves metadata/waveform/beatgrid queries
//! from the players' exported files or their live database service,
//! whichever answers first.
//!
//! One task owns the UDP sockets and drives the registry synchronously
//! from packet arrival; that path never waits on queries. All query
//! work runs on the provider task; NFS transfers pipeline their reads
//! internally.

pub mod config;
pub mod dbclient;
pub mod error;
pub mod model;
pub mod nfs;
pub mod provider;
pub mod registry;
pub mod vcdj;

mod pdbprovider;

use std::net::Ipv4Addr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use prolink_core::packets::beat::BeatPacket;
use prolink_core::packets::keepalive::KeepalivePacket;
use prolink_core::packets::status::StatusPacket;
use prolink_core::packets::{BEAT_PORT, KEEPALIVE_PORT, STATUS_PORT};
use prolink_core::DataStore;

pub use config::Config;
pub use error::{NetError, QueryError, Result};
pub use model::{BrowseRow, MenuColumn, MountInfo, QueryKind, QueryValue, SortMode, TrackMetadata};
pub use provider::{DataProvider, QueryOutcome};
pub use registry::{MediaInfo, Player, PlayerEvent, PlayerRegistry};

use nfs::NfsClient;
use provider::ProviderWorker;
use registry::{BeatgridStore, RegistryAction};
use vcdj::VirtualCdj;

/// The running client: spawned tasks plus handles into them.
pub struct ProLink {
    provider: DataProvider,
    vcdj: VirtualCdj,
    nfs: NfsClient,
    registry: Arc<Mutex<PlayerRegistry>>,
    tasks: Vec<JoinHandle<()>>,
}

impl ProLink {
    /// Binds the link ports, spawns the ingest, provider, dispatch and
    /// announcement tasks and returns the running client plus the
    /// player event stream.
    pub async fn start(
        config: Config,
    ) -> Result<(ProLink, mpsc::UnboundedReceiver<PlayerEvent>)> {
        let keepalive_sock = Arc::new(bind_broadcast(KEEPALIVE_PORT).await?);
        let beat_sock = Arc::new(bind_broadcast(BEAT_PORT).await?);
        let status_sock = Arc::new(bind_broadcast(STATUS_PORT).await?);
        info!(
            keepalive = KEEPALIVE_PORT,
            beat = BEAT_PORT,
            status = STATUS_PORT,
            "listening for link packets"
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        let beatgrids: BeatgridStore = Arc::new(DataStore::new(16));

        let mut registry = PlayerRegistry::new(events_tx, actions_tx, beatgrids.clone());
        registry.auto_request_beatgrid = config.auto_request_beatgrid;
        registry.log_played_tracks = config.played_tracks_log.is_some();
        registry.auto_track_download = config.auto_track_download;
        let registry = Arc::new(Mutex::new(registry));

        let nfs = NfsClient::new().await?;
        let (provider, worker) =
            ProviderWorker::new(&config, registry.clone(), nfs.clone(), beatgrids);

        let vcdj = VirtualCdj::new(
            config.vcdj_player_number,
            config.vcdj_model.clone(),
            config.own_ip.unwrap_or(Ipv4Addr::UNSPECIFIED),
            config.own_mac.unwrap_or([0; 6]),
            config.broadcast_ip,
            keepalive_sock.clone(),
            beat_sock.clone(),
            status_sock.clone(),
        );

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(ingest_loop(
            keepalive_sock,
            beat_sock,
            status_sock,
            registry.clone(),
        )));
        tasks.push(tokio::spawn(worker.run()));
        tasks.push(tokio::spawn(dispatch_actions(
            actions_rx,
            registry.clone(),
            provider.clone(),
            vcdj.clone(),
            nfs.clone(),
            config.clone(),
        )));
        if config.own_ip.is_some() && config.own_mac.is_some() {
            tasks.push(tokio::spawn(vcdj.clone().run()));
        } else {
            warn!("no interface identity configured, not announcing ourselves");
        }

        Ok((
            ProLink {
                provider,
                vcdj,
                nfs,
                registry,
                tasks,
            },
            events_rx,
        ))
    }

    /// Query entry point handed to collaborators.
    pub fn provider(&self) -> DataProvider {
        self.provider.clone()
    }

    pub fn vcdj(&self) -> &VirtualCdj {
        &self.vcdj
    }

    pub fn nfs(&self) -> &NfsClient {
        &self.nfs
    }

    /// Runs a closure against the current player list. Snapshots must
    /// be taken inside; references do not survive the next gc sweep.
    pub fn with_players<R>(&self, f: impl FnOnce(&[Player]) -> R) -> R {
        let registry = self.registry.lock().unwrap();
        f(registry.players())
    }

    pub fn player_snapshot(&self, player_number: u8) -> Option<Player> {
        let registry = self.registry.lock().unwrap();
        registry.player(player_number).cloned()
    }

    /// Cancels every task and releases the sockets.
    pub async fn shutdown(self) {
        for task in &self.tasks {
            task.abort();
        }
        for task in self.tasks {
            let _ = task.await;
        }
        info!("client stopped");
    }
}

async fn bind_broadcast(port: u16) -> Result<UdpSocket> {
    let sock = UdpSocket::bind(("0.0.0.0", port)).await?;
    sock.set_broadcast(true)?;
    Ok(sock)
}

/// Owns the sockets and the registry writes; latency sensitive, never
/// blocks on query work. Decode failures drop the packet, log and keep
/// the loop alive.
async fn ingest_loop(
    keepalive_sock: Arc<UdpSocket>,
    beat_sock: Arc<UdpSocket>,
    status_sock: Arc<UdpSocket>,
    registry: Arc<Mutex<PlayerRegistry>>,
) {
    let mut keepalive_buf = [0u8; 256];
    let mut beat_buf = [0u8; 256];
    // sized for the largest observed status packet (CDJ-3000)
    let mut status_buf = [0u8; 2048];
    let mut gc_interval = tokio::time::interval(std::time::Duration::from_secs(1));

    loop {
        tokio::select! {
            received = keepalive_sock.recv_from(&mut keepalive_buf) => {
                if let Ok((len, addr)) = received {
                    match KeepalivePacket::decode(&keepalive_buf[..len]) {
                        Ok(packet) => {
                            registry.lock().unwrap().ingest_keepalive(&packet, Instant::now());
                        }
                        Err(e) => warn!(%addr, len, error = %e, "bad keepalive packet"),
                    }
                }
            }
            received = beat_sock.recv_from(&mut beat_buf) => {
                if let Ok((len, addr)) = received {
                    match BeatPacket::decode(&beat_buf[..len]) {
                        Ok(packet) => {
                            registry.lock().unwrap().ingest_beat(&packet, Instant::now());
                        }
                        Err(e) => warn!(%addr, len, error = %e, "bad beat packet"),
                    }
                }
            }
            received = status_sock.recv_from(&mut status_buf) => {
                if let Ok((len, addr)) = received {
                    match StatusPacket::decode(&status_buf[..len]) {
                        Ok(packet) => {
                            registry.lock().unwrap().ingest_status(&packet, Instant::now());
                        }
                        Err(e) => warn!(%addr, len, error = %e, "bad status packet"),
                    }
                }
            }
            _ = gc_interval.tick() => {
                registry.lock().unwrap().gc(Instant::now());
            }
        }
    }
}

/// Drains registry follow-up work and routes it to the right component.
async fn dispatch_actions(
    mut actions: mpsc::UnboundedReceiver<RegistryAction>,
    registry: Arc<Mutex<PlayerRegistry>>,
    provider: DataProvider,
    vcdj: VirtualCdj,
    nfs: NfsClient,
    config: Config,
) {
    while let Some(action) = actions.recv().await {
        match action {
            RegistryAction::QueryLinkInfo {
                player_number,
                slot,
            } => {
                let ip = registry
                    .lock()
                    .unwrap()
                    .player(player_number)
                    .map(|p| p.ip_addr);
                match ip {
                    Some(ip) => {
                        if let Err(e) = vcdj.query_link_info(ip, player_number, slot).await {
                            warn!(player_number, error = %e, "link info query failed");
                        }
                    }
                    None => debug!(player_number, "link info target vanished"),
                }
            }
            RegistryAction::InvalidateSlot {
                player_number,
                slot,
            } => provider.invalidate_slot(player_number, slot),
            RegistryAction::FetchMetadata {
                player_number,
                slot,
                track_id,
            } => provider.request_background(
                player_number,
                slot,
                QueryKind::Metadata { track_id },
                true,
            ),
            RegistryAction::FetchBeatgrid {
                player_number,
                slot,
                track_id,
            } => provider.request_background(
                player_number,
                slot,
                QueryKind::Beatgrid { track_id },
                false,
            ),
            RegistryAction::DownloadTrack {
                player_number,
                slot,
                track_id,
            } => {
                let outcome = provider.get_mount_info(player_number, slot, track_id);
                let ip = registry
                    .lock()
                    .unwrap()
                    .player(player_number)
                    .map(|p| p.ip_addr);
                let nfs = nfs.clone();
                let download_dir = config.download_dir.clone();
                tokio::spawn(async move {
                    let Some(ip) = ip else {
                        warn!(player_number, "download target vanished");
                        return;
                    };
                    let mount_info = match outcome.await {
                        Ok(Ok(QueryValue::MountInfo(info))) => info,
                        other => {
                            warn!(player_number, track_id, ok = other.is_ok(), "mount info unavailable, skipping download");
                            return;
                        }
                    };
                    let name = mount_info
                        .mount_path
                        .rsplit('/')
                        .next()
                        .unwrap_or("track.bin");
                    let dst = download_dir.join(name);
                    match nfs
                        .download_file(ip, slot, &mount_info.mount_path, dst)
                        .await
                    {
                        Ok(path) => info!(path = %path.display(), "track downloaded"),
                        Err(e) => warn!(error = %e, "track download failed"),
                    }
                });
            }
        }
    }
}
