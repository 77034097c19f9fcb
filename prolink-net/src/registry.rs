//! The authoritative model of all players seen on the network.
//!
//! Decoded packets feed in, change notifications and follow-up query
//! requests come out. The registry is mutated only by the ingest loop
//! and the gc tick, which run on the same task; everyone else reads
//! through accessors or listens on the event channel.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use prolink_core::packets::beat::{BeatContent, BeatPacket};
use prolink_core::packets::keepalive::{KeepaliveContent, KeepalivePacket};
use prolink_core::packets::status::{
    CdjStatus, LinkReply, PlayState, StateFlags, StatusContent, StatusPacket, StorageState,
};
use prolink_core::packets::{format_mac, DeviceType, PlayerSlot, TrackAnalyzeType};
use prolink_core::store::DataStore;
use prolink_core::GridBeat;

use crate::model::TrackMetadata;

/// Players are dropped after this long without a keepalive or status
/// packet.
pub const PLAYER_TTL: Duration = Duration::from_secs(5);

/// Cache key of per-track data: source player, slot, track id.
pub type TrackKey = (u8, PlayerSlot, u32);

/// Shared store of fetched beatgrids, read synchronously by the
/// position tracking.
pub type BeatgridStore = Arc<DataStore<TrackKey, Arc<Vec<GridBeat>>>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerEvent {
    Added(u8),
    Changed(u8),
    Removed(u8),
    MediaChanged { player_number: u8, slot: PlayerSlot },
}

/// Follow-up work the registry wants done; drained and dispatched by
/// the owner so ingest never blocks on queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryAction {
    QueryLinkInfo {
        player_number: u8,
        slot: PlayerSlot,
    },
    InvalidateSlot {
        player_number: u8,
        slot: PlayerSlot,
    },
    FetchMetadata {
        player_number: u8,
        slot: PlayerSlot,
        track_id: u32,
    },
    FetchBeatgrid {
        player_number: u8,
        slot: PlayerSlot,
        track_id: u32,
    },
    DownloadTrack {
        player_number: u8,
        slot: PlayerSlot,
        track_id: u32,
    },
}

/// Storage info of one mounted slot, from a link reply.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MediaInfo {
    pub name: String,
    pub date: String,
    pub track_count: u32,
    pub playlist_count: u32,
    pub bytes_total: u64,
    pub bytes_free: u64,
}

#[derive(Debug, Clone)]
pub struct Player {
    pub model: String,
    pub firmware: String,
    pub device_type: DeviceType,
    pub ip_addr: Ipv4Addr,
    pub mac_addr: [u8; 6],
    pub player_number: u8,

    pub bpm: Option<f64>,
    pub pitch: f64,
    pub actual_pitch: f64,
    pub beat: u8,
    pub beat_count: u32,
    pub cue_distance: Option<u16>,
    pub play_state: PlayState,
    pub state: StateFlags,
    pub on_air: bool,

    pub usb_state: StorageState,
    pub sd_state: StorageState,
    pub usb_info: Option<MediaInfo>,
    pub sd_info: Option<MediaInfo>,

    pub loaded_player_number: u8,
    pub loaded_slot: PlayerSlot,
    pub track_analyze_type: TrackAnalyzeType,
    pub track_number: u32,
    pub track_id: u32,

    /// Interpolated seconds into the track; None when not determinable,
    /// which is distinct from a computed position of zero.
    pub position: Option<f64>,
    position_timestamp: Instant,

    pub metadata: Option<TrackMetadata>,

    /// Beat packets only drive pitch/bpm until status packets arrive.
    status_packet_received: bool,
    last_keepalive: Instant,
}

impl Player {
    fn new(
        model: String,
        device_type: DeviceType,
        ip_addr: Ipv4Addr,
        mac_addr: [u8; 6],
        player_number: u8,
        now: Instant,
    ) -> Self {
        Player {
            model,
            firmware: String::new(),
            device_type,
            ip_addr,
            mac_addr,
            player_number,
            bpm: None,
            pitch: 1.0,
            actual_pitch: 1.0,
            beat: 0,
            beat_count: 0,
            cue_distance: None,
            play_state: PlayState::NoTrack,
            state: StateFlags::default(),
            on_air: false,
            usb_state: StorageState::NotLoaded,
            sd_state: StorageState::NotLoaded,
            usb_info: None,
            sd_info: None,
            loaded_player_number: 0,
            loaded_slot: PlayerSlot::Empty,
            track_analyze_type: TrackAnalyzeType::Unknown,
            track_number: 0,
            track_id: 0,
            position: None,
            position_timestamp: now,
            metadata: None,
            status_packet_received: false,
            last_keepalive: now,
        }
    }

    fn refresh_ttl(&mut self, now: Instant) {
        self.last_keepalive = now;
    }

    fn ttl_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_keepalive) > PLAYER_TTL
    }

    /// Advances the position by linear interpolation since the last
    /// absolute fix. Interpolation pauses while the player sits at the
    /// cue point.
    fn update_position_by_pitch(&mut self, now: Instant) {
        let Some(position) = self.position else {
            return;
        };
        if self.actual_pitch == 0.0 {
            return;
        }
        let effective_pitch = if self.play_state == PlayState::Cued {
            0.0
        } else {
            self.actual_pitch
        };
        let elapsed = now.duration_since(self.position_timestamp).as_secs_f64();
        self.position = Some(position + effective_pitch * elapsed);
        self.position_timestamp = now;
    }
}

pub struct PlayerRegistry {
    players: Vec<Player>,
    events: mpsc::UnboundedSender<PlayerEvent>,
    actions: mpsc::UnboundedSender<RegistryAction>,
    beatgrids: BeatgridStore,

    pub auto_request_beatgrid: bool,
    pub log_played_tracks: bool,
    pub auto_track_download: bool,
}

impl PlayerRegistry {
    pub fn new(
        events: mpsc::UnboundedSender<PlayerEvent>,
        actions: mpsc::UnboundedSender<RegistryAction>,
        beatgrids: BeatgridStore,
    ) -> Self {
        PlayerRegistry {
            players: Vec::new(),
            events,
            actions,
            beatgrids,
            auto_request_beatgrid: true,
            log_played_tracks: true,
            auto_track_download: false,
        }
    }

    pub fn len(&self) -> usize {
        self.players.len()
    }

    pub fn is_empty(&self) -> bool {
        self.players.is_empty()
    }

    pub fn player(&self, player_number: u8) -> Option<&Player> {
        self.players
            .iter()
            .find(|p| p.player_number == player_number)
    }

    pub fn players(&self) -> &[Player] {
        &self.players
    }

    pub fn player_ips(&self) -> Vec<Ipv4Addr> {
        self.players.iter().map(|p| p.ip_addr).collect()
    }

    fn player_mut(&mut self, player_number: u8) -> Option<&mut Player> {
        self.players
            .iter_mut()
            .find(|p| p.player_number == player_number)
    }

    fn emit(&self, event: PlayerEvent) {
        let _ = self.events.send(event);
    }

    fn act(&self, action: RegistryAction) {
        let _ = self.actions.send(action);
    }

    /// Stores resolved metadata on every player that has the track
    /// loaded.
    pub fn store_metadata_by_loaded_track(
        &mut self,
        loaded_player_number: u8,
        loaded_slot: PlayerSlot,
        track_id: u32,
        metadata: &TrackMetadata,
    ) {
        for player in self.players.iter_mut() {
            if player.loaded_player_number == loaded_player_number
                && player.loaded_slot == loaded_slot
                && player.track_id == track_id
            {
                player.metadata = Some(metadata.clone());
            }
        }
    }

    /// Adds the player if unseen; refreshes its liveness either way.
    pub fn ingest_keepalive(&mut self, packet: &KeepalivePacket, now: Instant) {
        let (ip_addr, mac_addr, player_number) = match &packet.content {
            KeepaliveContent::Ip {
                ip_addr,
                mac_addr,
                player_number,
                ..
            } => (*ip_addr, *mac_addr, *player_number),
            KeepaliveContent::Status {
                ip_addr,
                mac_addr,
                player_number,
                ..
            } => (*ip_addr, *mac_addr, *player_number),
            KeepaliveContent::Change { ip_addr, .. } => {
                // no new number in here; wait for the next regular
                // packet to pick it up
                if let Some(player) =
                    self.players.iter_mut().find(|p| p.ip_addr == *ip_addr)
                {
                    player.refresh_ttl(now);
                }
                return;
            }
            _ => return,
        };

        match self.players.iter().position(|p| p.ip_addr == ip_addr) {
            None => {
                if let Some(conflicting) =
                    self.players.iter().find(|p| p.player_number == player_number)
                {
                    warn!(
                        player_number,
                        new_ip = %ip_addr,
                        existing_ip = %conflicting.ip_addr,
                        "player number already in use, ignoring keepalive"
                    );
                    return;
                }
                let player = Player::new(
                    packet.model.clone(),
                    packet.device_type,
                    ip_addr,
                    mac_addr,
                    player_number,
                    now,
                );
                info!(
                    player_number,
                    model = %player.model,
                    ip = %ip_addr,
                    mac = %format_mac(&mac_addr),
                    "new player"
                );
                self.players.push(player);
                self.emit(PlayerEvent::Added(player_number));
                self.emit(PlayerEvent::Changed(player_number));
            }
            Some(index) => {
                let old_number = self.players[index].player_number;
                if old_number != player_number {
                    info!(
                        ip = %ip_addr,
                        old_number,
                        new_number = player_number,
                        "player changed number"
                    );
                    self.players[index].player_number = player_number;
                    // listeners may be indexed by number; notify both
                    self.emit(PlayerEvent::Changed(old_number));
                    self.emit(PlayerEvent::Changed(player_number));
                }
                self.players[index].refresh_ttl(now);
            }
        }
    }

    /// Beat packets update pitch/bpm/beat for players that do not send
    /// status packets (and models known to need it), plus the mixer
    /// on-air bitmap.
    pub fn ingest_beat(&mut self, packet: &BeatPacket, now: Instant) {
        let mut changed_players: Vec<u8> = Vec::new();

        match &packet.content {
            BeatContent::MixerOnAir { ch_on_air } => {
                if self.player_mut(packet.player_number).is_none() {
                    return;
                }
                for channel in 1..=4u8 {
                    let on_air = ch_on_air[channel as usize - 1] == 1;
                    if let Some(player) = self.player_mut(channel) {
                        if player.on_air != on_air {
                            player.on_air = on_air;
                            changed_players.push(channel);
                        }
                    }
                }
            }
            BeatContent::Beat {
                pitch, bpm, beat, ..
            } => {
                let Some(player) = self.player_mut(packet.player_number) else {
                    return;
                };
                if !player.status_packet_received || player.model == "CDJ-2000" {
                    if player.actual_pitch != *pitch {
                        player.actual_pitch = *pitch;
                        changed_players.push(player.player_number);
                    }
                    if player.bpm != Some(*bpm) {
                        player.bpm = Some(*bpm);
                        changed_players.push(player.player_number);
                    }
                    if player.beat != *beat {
                        player.beat = *beat;
                        changed_players.push(player.player_number);
                    }
                }
            }
            _ => {
                if self.player_mut(packet.player_number).is_none() {
                    return;
                }
            }
        }

        if let Some(player) = self.player_mut(packet.player_number) {
            player.refresh_ttl(now);
        }
        changed_players.dedup();
        for player_number in changed_players {
            self.emit(PlayerEvent::Changed(player_number));
        }
    }

    /// Updates the full player state from a status packet.
    pub fn ingest_status(&mut self, packet: &StatusPacket, now: Instant) {
        let cdj = match &packet.content {
            StatusContent::Cdj(cdj) => Some(cdj),
            StatusContent::Djm(_) => None,
            StatusContent::LinkReply(reply) => {
                self.ingest_link_reply(packet.player_number, reply, now);
                return;
            }
            _ => {
                info!(
                    player_number = packet.player_number,
                    "ignoring status packet of unsupported kind"
                );
                return;
            }
        };

        let Some(index) = self
            .players
            .iter()
            .position(|p| p.player_number == packet.player_number)
        else {
            return; // packet from unknown player
        };

        let mut changed = false;
        {
            let player = &mut self.players[index];
            player.status_packet_received = true;

            let (new_bpm, new_pitch, new_beat, new_state) = match &packet.content {
                StatusContent::Cdj(c) => (c.bpm, c.physical_pitch, c.beat, c.state),
                StatusContent::Djm(d) => (d.bpm, d.physical_pitch, d.beat, d.state),
                _ => unreachable!(),
            };

            if player.bpm != new_bpm {
                player.bpm = new_bpm;
                changed = true;
            }
            if player.pitch != new_pitch {
                player.pitch = new_pitch;
                changed = true;
            }
            if player.beat != new_beat && new_beat != 0 {
                player.beat = new_beat;
                changed = true;
            }
            if player.state != new_state {
                player.state = new_state;
                changed = true;
            }
        }

        if let Some(cdj) = cdj {
            changed |= self.ingest_cdj_body(index, cdj, now);
        }

        self.players[index].refresh_ttl(now);
        if changed {
            self.emit(PlayerEvent::Changed(self.players[index].player_number));
        }
    }

    fn ingest_link_reply(&mut self, player_number: u8, reply: &LinkReply, now: Instant) {
        let Some(player) = self.player_mut(player_number) else {
            return;
        };
        player.refresh_ttl(now);
        let media_info = MediaInfo {
            name: reply.name.clone(),
            date: reply.date.clone(),
            track_count: reply.track_count,
            playlist_count: reply.playlist_count,
            bytes_total: reply.bytes_total,
            bytes_free: reply.bytes_free,
        };
        info!(
            player_number,
            slot = %reply.slot,
            name = %media_info.name,
            tracks = media_info.track_count,
            playlists = media_info.playlist_count,
            free_mb = media_info.bytes_free / 1024 / 1024,
            total_mb = media_info.bytes_total / 1024 / 1024,
            "link info"
        );
        match reply.slot {
            PlayerSlot::Usb => player.usb_info = Some(media_info),
            PlayerSlot::Sd => player.sd_info = Some(media_info),
            other => {
                warn!(slot = %other, "link info for unsupported slot");
                return;
            }
        }
        self.media_changed(player_number, reply.slot);
    }

    fn media_changed(&mut self, player_number: u8, slot: PlayerSlot) {
        debug!(player_number, %slot, "media changed");
        self.act(RegistryAction::InvalidateSlot {
            player_number,
            slot,
        });
        self.emit(PlayerEvent::MediaChanged {
            player_number,
            slot,
        });
    }

    /// Cdj-only portion of the status ingest. Returns whether any
    /// observable field changed.
    fn ingest_cdj_body(&mut self, index: usize, cdj: &CdjStatus, now: Instant) -> bool {
        let mut changed = false;

        let (old_beat_count, old_play_state) = {
            let player = &self.players[index];
            (player.beat_count, player.play_state)
        };
        if cdj.beat_count != old_beat_count || cdj.play_state != old_play_state {
            // absolute fix from the beatgrid
            self.update_position_by_beat(index, cdj.beat_count, cdj.play_state, now);
        } else {
            self.players[index].update_position_by_pitch(now);
        }

        let mut media_transitions: Vec<PlayerSlot> = Vec::new();
        let mut link_queries: Vec<PlayerSlot> = Vec::new();
        let mut track_actions: Vec<RegistryAction> = Vec::new();

        {
            let player = &mut self.players[index];

            if player.beat_count != cdj.beat_count {
                player.beat_count = cdj.beat_count;
                changed = true;
            }
            if player.play_state != cdj.play_state {
                player.play_state = cdj.play_state;
                changed = true;
            }
            player.firmware = cdj.firmware.clone();
            if player.actual_pitch != cdj.actual_pitch {
                player.actual_pitch = cdj.actual_pitch;
                changed = true;
            }
            if player.cue_distance != cdj.cue_distance {
                player.cue_distance = cdj.cue_distance;
                changed = true;
            }

            if player.usb_state != cdj.usb_state {
                player.usb_state = cdj.usb_state;
                if cdj.usb_state == StorageState::Loaded {
                    link_queries.push(PlayerSlot::Usb);
                } else {
                    player.usb_info = None;
                }
                media_transitions.push(PlayerSlot::Usb);
            }
            if player.sd_state != cdj.sd_state {
                player.sd_state = cdj.sd_state;
                if cdj.sd_state == StorageState::Loaded {
                    link_queries.push(PlayerSlot::Sd);
                } else {
                    player.sd_info = None;
                }
                media_transitions.push(PlayerSlot::Sd);
            }

            player.track_number = cdj.track_number;
            player.loaded_player_number = cdj.loaded_player_number;
            player.loaded_slot = cdj.loaded_slot;
            player.track_analyze_type = cdj.track_analyze_type;

            if player.track_id != cdj.track_id {
                player.track_id = cdj.track_id;
                changed = true;
                player.metadata = None;
                player.position = None;
                let removable = matches!(
                    player.loaded_slot,
                    PlayerSlot::Usb | PlayerSlot::Sd
                );
                if removable && player.track_analyze_type == TrackAnalyzeType::Rekordbox {
                    let source = (
                        player.loaded_player_number,
                        player.loaded_slot,
                        player.track_id,
                    );
                    if self.log_played_tracks {
                        track_actions.push(RegistryAction::FetchMetadata {
                            player_number: source.0,
                            slot: source.1,
                            track_id: source.2,
                        });
                    }
                    if self.auto_request_beatgrid && player.track_id != 0 {
                        track_actions.push(RegistryAction::FetchBeatgrid {
                            player_number: source.0,
                            slot: source.1,
                            track_id: source.2,
                        });
                    }
                    if self.auto_track_download {
                        info!(
                            player_number = player.player_number,
                            "automatic download of loaded track"
                        );
                        track_actions.push(RegistryAction::DownloadTrack {
                            player_number: source.0,
                            slot: source.1,
                            track_id: source.2,
                        });
                    }
                }
            }
        }

        let player_number = self.players[index].player_number;
        for slot in link_queries {
            self.act(RegistryAction::QueryLinkInfo {
                player_number,
                slot,
            });
        }
        for slot in media_transitions {
            self.media_changed(player_number, slot);
        }
        for action in track_actions {
            self.act(action);
        }

        changed
    }

    /// Recomputes the absolute position from the beatgrid when the
    /// (beat count, play state) pair changed.
    fn update_position_by_beat(
        &mut self,
        index: usize,
        new_beat_count: u32,
        new_play_state: PlayState,
        now: Instant,
    ) {
        let key = {
            let player = &self.players[index];
            (
                player.loaded_player_number,
                player.loaded_slot,
                player.track_id,
            )
        };
        let old_play_state = self.players[index].play_state;
        match self.beatgrids.get(&key) {
            Some(grid) => {
                if new_beat_count > 0 {
                    // transitions around the cue point report a stale
                    // absolute beat; keep interpolating instead
                    if (old_play_state == PlayState::Cued && new_play_state == PlayState::Cueing)
                        || (old_play_state == PlayState::Playing
                            && new_play_state == PlayState::Paused)
                        || (old_play_state == PlayState::Paused
                            && new_play_state == PlayState::Playing)
                    {
                        return;
                    }
                    // observed off-by-one: outside the cued state the
                    // reported count is one beat ahead of the grid
                    let mut beat_index = new_beat_count as usize;
                    if new_play_state != PlayState::Cued {
                        beat_index -= 1;
                    }
                    if let Some(entry) = grid.get(beat_index) {
                        self.players[index].position = Some(entry.time_ms as f64 / 1000.0);
                    }
                } else {
                    self.players[index].position = Some(0.0);
                }
            }
            None => {
                // unknown, which is not the same as zero
                self.players[index].position = None;
            }
        }
        self.players[index].position_timestamp = now;
    }

    /// Drops players whose liveness expired, notifying dependents so
    /// they release per-player resources.
    pub fn gc(&mut self, now: Instant) {
        let mut removed: Vec<u8> = Vec::new();
        self.players.retain(|player| {
            if player.ttl_expired(now) {
                info!(
                    player_number = player.player_number,
                    "player dropped due to timeout"
                );
                removed.push(player.player_number);
                false
            } else {
                true
            }
        });
        for player_number in removed {
            self.emit(PlayerEvent::Removed(player_number));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prolink_core::packets::status::{DjmStatus, StatusPacket};

    struct Fixture {
        registry: PlayerRegistry,
        events: mpsc::UnboundedReceiver<PlayerEvent>,
        actions: mpsc::UnboundedReceiver<RegistryAction>,
        beatgrids: BeatgridStore,
        now: Instant,
    }

    fn fixture() -> Fixture {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (actions_tx, actions_rx) = mpsc::unbounded_channel();
        let beatgrids: BeatgridStore = Arc::new(DataStore::new(16));
        let registry = PlayerRegistry::new(events_tx, actions_tx, beatgrids.clone());
        Fixture {
            registry,
            events: events_rx,
            actions: actions_rx,
            beatgrids,
            now: Instant::now(),
        }
    }

    fn keepalive(player_number: u8, ip: [u8; 4]) -> KeepalivePacket {
        KeepalivePacket {
            model: "XDJ-1000".into(),
            device_type: DeviceType::Cdj,
            content: KeepaliveContent::Status {
                player_number,
                mac_addr: [0, 1, 2, 3, 4, player_number],
                ip_addr: Ipv4Addr::new(ip[0], ip[1], ip[2], ip[3]),
                device_count: 1,
            },
        }
    }

    fn cdj_status(player_number: u8, cdj: CdjStatus) -> StatusPacket {
        StatusPacket {
            model: "XDJ-1000".into(),
            player_number,
            content: StatusContent::Cdj(cdj),
        }
    }

    fn base_cdj() -> CdjStatus {
        CdjStatus {
            activity: 0,
            loaded_player_number: 3,
            loaded_slot: PlayerSlot::Usb,
            track_analyze_type: TrackAnalyzeType::Rekordbox,
            track_id: 0,
            track_number: 0,
            usb_active: false,
            sd_active: false,
            usb_state: StorageState::NotLoaded,
            sd_state: StorageState::NotLoaded,
            play_state: PlayState::NoTrack,
            firmware: "1.05".into(),
            tempo_master_count: 0,
            state: StateFlags::default(),
            physical_pitch: 1.0,
            bpm: Some(128.0),
            actual_pitch: 1.0,
            beat_count: 0,
            cue_distance: None,
            beat: 1,
            packet_count: 1,
            is_nexus: true,
            extension: None,
        }
    }

    fn drain_events(rx: &mut mpsc::UnboundedReceiver<PlayerEvent>) -> Vec<PlayerEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_player_lifecycle() {
        let mut f = fixture();
        f.registry.ingest_keepalive(&keepalive(3, [10, 0, 0, 3]), f.now);
        f.registry
            .ingest_status(&cdj_status(3, base_cdj()), f.now);
        assert_eq!(f.registry.len(), 1);
        assert_eq!(f.registry.player(3).unwrap().player_number, 3);

        // another keepalive keeps it alive
        f.registry
            .ingest_keepalive(&keepalive(3, [10, 0, 0, 3]), f.now + Duration::from_secs(3));
        f.registry.gc(f.now + Duration::from_secs(5));
        assert_eq!(f.registry.len(), 1);

        // silence beyond the ttl drops it with exactly one removal
        f.registry.gc(f.now + Duration::from_secs(9));
        assert_eq!(f.registry.len(), 0);
        let removed: Vec<_> = drain_events(&mut f.events)
            .into_iter()
            .filter(|e| matches!(e, PlayerEvent::Removed(_)))
            .collect();
        assert_eq!(removed, vec![PlayerEvent::Removed(3)]);
    }

    #[test]
    fn test_player_number_conflict_ignored() {
        let mut f = fixture();
        f.registry.ingest_keepalive(&keepalive(2, [10, 0, 0, 2]), f.now);
        assert_eq!(f.registry.len(), 1);
        // same number from a different ip must not create or overwrite
        f.registry.ingest_keepalive(&keepalive(2, [10, 0, 0, 9]), f.now);
        assert_eq!(f.registry.len(), 1);
        assert_eq!(
            f.registry.player(2).unwrap().ip_addr,
            Ipv4Addr::new(10, 0, 0, 2)
        );
    }

    #[test]
    fn test_player_number_change_notifies_both() {
        let mut f = fixture();
        f.registry.ingest_keepalive(&keepalive(2, [10, 0, 0, 2]), f.now);
        drain_events(&mut f.events);
        f.registry.ingest_keepalive(&keepalive(4, [10, 0, 0, 2]), f.now);
        assert_eq!(f.registry.len(), 1);
        assert_eq!(f.registry.player(4).unwrap().ip_addr, Ipv4Addr::new(10, 0, 0, 2));
        assert!(f.registry.player(2).is_none());
        let events = drain_events(&mut f.events);
        assert!(events.contains(&PlayerEvent::Changed(2)));
        assert!(events.contains(&PlayerEvent::Changed(4)));
    }

    #[test]
    fn test_position_interpolation() {
        let mut f = fixture();
        f.registry.ingest_keepalive(&keepalive(1, [10, 0, 0, 1]), f.now);
        let player = f.registry.player_mut(1).unwrap();
        player.position = Some(10.0);
        player.position_timestamp = f.now;
        player.actual_pitch = 1.0;
        player.play_state = PlayState::Playing;
        f.registry.players[0].update_position_by_pitch(f.now + Duration::from_secs(2));
        let position = f.registry.player(1).unwrap().position.unwrap();
        assert!((position - 12.0).abs() < 1e-6);

        // cued players do not advance
        let player = f.registry.player_mut(1).unwrap();
        player.play_state = PlayState::Cued;
        player.position = Some(10.0);
        player.position_timestamp = f.now;
        f.registry.players[0].update_position_by_pitch(f.now + Duration::from_secs(30));
        let position = f.registry.player(1).unwrap().position.unwrap();
        assert!((position - 10.0).abs() < 1e-6);
    }

    #[test]
    fn test_position_from_beatgrid() {
        let mut f = fixture();
        f.registry.ingest_keepalive(&keepalive(1, [10, 0, 0, 1]), f.now);

        // load a beatgrid for the track about to play
        let grid: Vec<GridBeat> = (0..64)
            .map(|i| GridBeat {
                beat: (i % 4 + 1) as u16,
                bpm_100: 12800,
                time_ms: if i == 10 { 5230 } else { i * 469 },
            })
            .collect();
        f.beatgrids
            .insert((3, PlayerSlot::Usb, 42), Arc::new(grid));

        let mut cdj = base_cdj();
        cdj.track_id = 42;
        cdj.play_state = PlayState::Playing;
        cdj.beat_count = 10;
        f.registry.ingest_status(&cdj_status(1, cdj.clone()), f.now);
        drain_events(&mut f.events);

        cdj.beat_count = 11;
        f.registry.ingest_status(&cdj_status(1, cdj), f.now);
        let position = f.registry.player(1).unwrap().position.unwrap();
        assert!((position - 5.230).abs() < 1e-6);
        let events = drain_events(&mut f.events);
        assert_eq!(events, vec![PlayerEvent::Changed(1)]);
    }

    #[test]
    fn test_position_unknown_without_beatgrid() {
        let mut f = fixture();
        f.registry.ingest_keepalive(&keepalive(1, [10, 0, 0, 1]), f.now);
        let mut cdj = base_cdj();
        cdj.track_id = 42;
        cdj.play_state = PlayState::Playing;
        cdj.beat_count = 10;
        f.registry.ingest_status(&cdj_status(1, cdj), f.now);
        assert_eq!(f.registry.player(1).unwrap().position, None);
    }

    #[test]
    fn test_track_change_triggers_queries() {
        let mut f = fixture();
        f.registry.ingest_keepalive(&keepalive(1, [10, 0, 0, 1]), f.now);
        let mut cdj = base_cdj();
        cdj.track_id = 7;
        f.registry.ingest_status(&cdj_status(1, cdj), f.now);
        let mut actions = Vec::new();
        while let Ok(action) = f.actions.try_recv() {
            actions.push(action);
        }
        assert!(actions.contains(&RegistryAction::FetchMetadata {
            player_number: 3,
            slot: PlayerSlot::Usb,
            track_id: 7,
        }));
        assert!(actions.contains(&RegistryAction::FetchBeatgrid {
            player_number: 3,
            slot: PlayerSlot::Usb,
            track_id: 7,
        }));
    }

    #[test]
    fn test_media_change_fires_and_queries_link_info() {
        let mut f = fixture();
        f.registry.ingest_keepalive(&keepalive(1, [10, 0, 0, 1]), f.now);
        let mut cdj = base_cdj();
        cdj.usb_state = StorageState::Loaded;
        f.registry.ingest_status(&cdj_status(1, cdj), f.now);

        let events = drain_events(&mut f.events);
        assert!(events.contains(&PlayerEvent::MediaChanged {
            player_number: 1,
            slot: PlayerSlot::Usb,
        }));
        let mut actions = Vec::new();
        while let Ok(action) = f.actions.try_recv() {
            actions.push(action);
        }
        assert!(actions.contains(&RegistryAction::QueryLinkInfo {
            player_number: 1,
            slot: PlayerSlot::Usb,
        }));
        assert!(actions.contains(&RegistryAction::InvalidateSlot {
            player_number: 1,
            slot: PlayerSlot::Usb,
        }));
    }

    #[test]
    fn test_djm_status_updates_common_fields() {
        let mut f = fixture();
        f.registry.ingest_keepalive(&keepalive(33, [10, 0, 0, 33]), f.now);
        let packet = StatusPacket {
            model: "DJM-900NXS2".into(),
            player_number: 33,
            content: StatusContent::Djm(DjmStatus {
                state: StateFlags {
                    on_air: false,
                    sync: true,
                    master: true,
                    play: false,
                },
                physical_pitch: 1.02,
                bpm: Some(140.0),
                beat: 2,
            }),
        };
        f.registry.ingest_status(&packet, f.now);
        let player = f.registry.player(33).unwrap();
        assert_eq!(player.bpm, Some(140.0));
        assert_eq!(player.beat, 2);
        assert!(player.state.master);
    }

    #[test]
    fn test_beat_packet_only_before_status() {
        let mut f = fixture();
        f.registry.ingest_keepalive(&keepalive(1, [10, 0, 0, 1]), f.now);
        let beat = BeatPacket {
            model: "XDJ-1000".into(),
            player_number: 1,
            content: BeatContent::Beat {
                distances: Default::default(),
                pitch: 1.02,
                bpm: 174.0,
                beat: 3,
            },
        };
        f.registry.ingest_beat(&beat, f.now);
        assert_eq!(f.registry.player(1).unwrap().bpm, Some(174.0));

        // once status packets flow, beat packets stop driving state
        f.registry
            .ingest_status(&cdj_status(1, base_cdj()), f.now);
        let beat2 = BeatPacket {
            model: "XDJ-1000".into(),
            player_number: 1,
            content: BeatContent::Beat {
                distances: Default::default(),
                pitch: 0.5,
                bpm: 90.0,
                beat: 1,
            },
        };
        f.registry.ingest_beat(&beat2, f.now);
        assert_eq!(f.registry.player(1).unwrap().bpm, Some(128.0));
    }

    #[test]
    fn test_on_air_from_mixer_packet() {
        let mut f = fixture();
        f.registry.ingest_keepalive(&keepalive(1, [10, 0, 0, 1]), f.now);
        f.registry.ingest_keepalive(&keepalive(33, [10, 0, 0, 33]), f.now);
        let packet = BeatPacket {
            model: "DJM-900NXS2".into(),
            player_number: 33,
            content: BeatContent::MixerOnAir {
                ch_on_air: [1, 0, 0, 0],
            },
        };
        f.registry.ingest_beat(&packet, f.now);
        assert!(f.registry.player(1).unwrap().on_air);
    }
}
