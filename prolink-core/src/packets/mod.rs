//! Wire codecs for the ProDJ Link UDP packet families and the TCP
//! database protocol.
//!
//! All three UDP families share a 10-byte magic prefix and a 20-byte
//! zero-padded model string. Multi-byte integers are big-endian on the
//! wire. Decoding is strict about magic and truncation (both are typed
//! errors the ingest loop logs and drops) but lenient about reserved
//! fields, which are ignored rather than interpreted.

pub mod beat;
pub mod dbmessage;
pub mod keepalive;
pub mod rpc;
pub mod status;

use serde::{Deserialize, Serialize};

use crate::bytesio::{ByteReader, ByteWriter};
use crate::error::{Error, Result};

/// Magic prefix of every keepalive/beat/status datagram.
pub const UDP_MAGIC: &[u8; 10] = b"Qspt1WmJOL";

/// Discovery/keepalive broadcasts.
pub const KEEPALIVE_PORT: u16 = 50000;
/// Beat broadcasts.
pub const BEAT_PORT: u16 = 50001;
/// Status/load/link packets.
pub const STATUS_PORT: u16 = 50002;

/// Fixed-point pitch: raw / 0x100000, so 1.0 is neutral.
pub fn pitch_from_raw(raw: u32) -> f64 {
    raw as f64 / 0x100000 as f64
}

pub fn pitch_to_raw(pitch: f64) -> u32 {
    (pitch * 0x100000 as f64).round() as u32
}

/// Fixed-point bpm: raw / 100.
pub fn bpm_from_raw(raw: u16) -> f64 {
    raw as f64 / 100.0
}

pub fn bpm_to_raw(bpm: f64) -> u16 {
    (bpm * 100.0).round() as u16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Djm,
    Cdj,
    /// Also used by the CDJ-3000.
    Rekordbox,
}

impl DeviceType {
    pub fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            1 => Ok(DeviceType::Djm),
            2 => Ok(DeviceType::Cdj),
            3 => Ok(DeviceType::Rekordbox),
            v => Err(Error::UnknownValue {
                what: "device type",
                value: v as u64,
            }),
        }
    }

    pub fn to_raw(self) -> u8 {
        match self {
            DeviceType::Djm => 1,
            DeviceType::Cdj => 2,
            DeviceType::Rekordbox => 3,
        }
    }
}

/// A storage location on a player.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerSlot {
    Empty,
    Cd,
    Sd,
    Usb,
    Rekordbox,
}

impl PlayerSlot {
    pub fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(PlayerSlot::Empty),
            1 => Ok(PlayerSlot::Cd),
            2 => Ok(PlayerSlot::Sd),
            3 => Ok(PlayerSlot::Usb),
            4 => Ok(PlayerSlot::Rekordbox),
            v => Err(Error::UnknownValue {
                what: "player slot",
                value: v as u64,
            }),
        }
    }

    pub fn to_raw(self) -> u8 {
        match self {
            PlayerSlot::Empty => 0,
            PlayerSlot::Cd => 1,
            PlayerSlot::Sd => 2,
            PlayerSlot::Usb => 3,
            PlayerSlot::Rekordbox => 4,
        }
    }
}

impl std::fmt::Display for PlayerSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            PlayerSlot::Empty => "empty",
            PlayerSlot::Cd => "cd",
            PlayerSlot::Sd => "sd",
            PlayerSlot::Usb => "usb",
            PlayerSlot::Rekordbox => "rekordbox",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackAnalyzeType {
    /// No track, or an unanalyzed one.
    Unknown,
    /// Rekordbox-analyzed track.
    Rekordbox,
    /// Plain file on usb.
    File,
    Cd,
}

impl TrackAnalyzeType {
    pub fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(TrackAnalyzeType::Unknown),
            1 => Ok(TrackAnalyzeType::Rekordbox),
            2 => Ok(TrackAnalyzeType::File),
            5 => Ok(TrackAnalyzeType::Cd),
            v => Err(Error::UnknownValue {
                what: "track analyze type",
                value: v as u64,
            }),
        }
    }

    pub fn to_raw(self) -> u8 {
        match self {
            TrackAnalyzeType::Unknown => 0,
            TrackAnalyzeType::Rekordbox => 1,
            TrackAnalyzeType::File => 2,
            TrackAnalyzeType::Cd => 5,
        }
    }
}

pub(crate) fn check_magic(r: &mut ByteReader<'_>) -> Result<()> {
    if r.take(10)? != UDP_MAGIC {
        return Err(Error::BadMagic {
            what: "udp packet",
        });
    }
    Ok(())
}

/// 20-byte zero-padded ascii model name.
pub(crate) fn read_model(r: &mut ByteReader<'_>) -> Result<String> {
    let raw = r.take(20)?;
    let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
    Ok(raw[..end].iter().map(|&b| b as char).collect())
}

pub(crate) fn write_model(w: &mut ByteWriter, model: &str) {
    let start = w.len();
    for b in model.bytes().take(19) {
        w.u8(b);
    }
    w.zeros(20 - (w.len() - start));
}

pub(crate) fn read_ip(r: &mut ByteReader<'_>) -> Result<std::net::Ipv4Addr> {
    let b = r.take(4)?;
    Ok(std::net::Ipv4Addr::new(b[0], b[1], b[2], b[3]))
}

pub(crate) fn read_mac(r: &mut ByteReader<'_>) -> Result<[u8; 6]> {
    let b = r.take(6)?;
    let mut mac = [0u8; 6];
    mac.copy_from_slice(b);
    Ok(mac)
}

/// `aa:bb:cc:dd:ee:ff` rendering used in logs.
pub fn format_mac(mac: &[u8; 6]) -> String {
    mac.iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}
