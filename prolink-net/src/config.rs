//! Client configuration

use std::net::Ipv4Addr;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct Config {
    /// Player number the virtual cdj announces itself with.
    pub vcdj_player_number: u8,
    /// Model string sent in our keepalive packets.
    pub vcdj_model: String,
    /// Our interface address; announcements are disabled without it.
    pub own_ip: Option<Ipv4Addr>,
    pub own_mac: Option<[u8; 6]>,
    /// Broadcast address for keepalive/fader packets.
    pub broadcast_ip: Ipv4Addr,
    /// Player number sent inside db queries. 0 works with up to three
    /// real players on the link; a real number 1..4 avoids rendering
    /// glitches on the players at the cost of one usable slot.
    pub query_player_number: u8,
    /// Fetch the beatgrid when a new track loads, enabling position
    /// tracking.
    pub auto_request_beatgrid: bool,
    /// Append resolved metadata of every newly loaded track here.
    pub played_tracks_log: Option<PathBuf>,
    /// Download every newly loaded track from the player.
    pub auto_track_download: bool,
    /// Target directory for automatic track downloads.
    pub download_dir: PathBuf,
    /// Directory for downloaded export databases.
    pub database_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vcdj_player_number: 5,
            vcdj_model: "Virtual CDJ".into(),
            own_ip: None,
            own_mac: None,
            broadcast_ip: Ipv4Addr::BROADCAST,
            query_player_number: 0,
            auto_request_beatgrid: true,
            played_tracks_log: None,
            auto_track_download: false,
            download_dir: PathBuf::from("./downloads"),
            database_dir: PathBuf::from("./databases"),
        }
    }
}
