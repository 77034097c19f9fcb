//! Status packets (udp port 50002).
//!
//! The largest and quirkiest family: full cdj transport state, mixer
//! state, remote load commands and the storage link info exchange. The
//! cdj body layout is fixed-offset; a trailing extension with key and
//! loop data is present when the length marker announces the CDJ-3000
//! size. Sentinel values are normalized on decode: bpm 655.35 and cue
//! distance 511 become "unknown", beat counts of all-ones become 0.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use super::{
    bpm_from_raw, bpm_to_raw, check_magic, pitch_from_raw, pitch_to_raw, read_ip, read_model,
    write_model, PlayerSlot, TrackAnalyzeType,
};
use crate::bytesio::{ByteReader, ByteWriter};
use crate::error::{Error, Result};

/// Length marker announcing the extended CDJ-3000 cdj body.
const CDJ3000_BODY_LEN: u16 = 0x438;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayState {
    NoTrack,
    LoadingTrack,
    Playing,
    Looping,
    /// Paused anywhere other than the cue point.
    Paused,
    /// Paused at the cue point.
    Cued,
    /// Playing from the cue point (cue play).
    Cueing,
    /// Cue play while touching the platter.
    CueScratch,
    Seeking,
    CannotPlayTrack,
    EndOfTrack,
    /// Emergency mode after losing the link.
    Emergency,
}

impl PlayState {
    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0x00 => Ok(PlayState::NoTrack),
            0x02 => Ok(PlayState::LoadingTrack),
            0x03 => Ok(PlayState::Playing),
            0x04 => Ok(PlayState::Looping),
            0x05 => Ok(PlayState::Paused),
            0x06 => Ok(PlayState::Cued),
            0x07 => Ok(PlayState::Cueing),
            0x08 => Ok(PlayState::CueScratch),
            0x09 => Ok(PlayState::Seeking),
            0x0e => Ok(PlayState::CannotPlayTrack),
            0x11 => Ok(PlayState::EndOfTrack),
            0x12 => Ok(PlayState::Emergency),
            v => Err(Error::UnknownValue {
                what: "play state",
                value: v as u64,
            }),
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            PlayState::NoTrack => 0x00,
            PlayState::LoadingTrack => 0x02,
            PlayState::Playing => 0x03,
            PlayState::Looping => 0x04,
            PlayState::Paused => 0x05,
            PlayState::Cued => 0x06,
            PlayState::Cueing => 0x07,
            PlayState::CueScratch => 0x08,
            PlayState::Seeking => 0x09,
            PlayState::CannotPlayTrack => 0x0e,
            PlayState::EndOfTrack => 0x11,
            PlayState::Emergency => 0x12,
        }
    }

    /// States in which the on-player database service is not reliably
    /// responsive; queries are deferred while a player is in one.
    pub fn is_not_ready(self) -> bool {
        matches!(
            self,
            PlayState::NoTrack
                | PlayState::LoadingTrack
                | PlayState::CannotPlayTrack
                | PlayState::Emergency
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageState {
    Loaded,
    Stopping,
    Unmounting,
    NotLoaded,
}

impl StorageState {
    pub fn from_raw(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(StorageState::Loaded),
            2 => Ok(StorageState::Stopping),
            3 => Ok(StorageState::Unmounting),
            4 => Ok(StorageState::NotLoaded),
            v => Err(Error::UnknownValue {
                what: "storage state",
                value: v as u64,
            }),
        }
    }

    pub fn to_raw(self) -> u32 {
        match self {
            StorageState::Loaded => 0,
            StorageState::Stopping => 2,
            StorageState::Unmounting => 3,
            StorageState::NotLoaded => 4,
        }
    }
}

/// On-air/sync/master/play bitmask. Two reserved bits (0x84) are always
/// set on the wire and OR'd back in on encode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StateFlags {
    pub on_air: bool,
    pub sync: bool,
    pub master: bool,
    pub play: bool,
}

impl StateFlags {
    pub fn from_bits(bits: u16) -> Self {
        StateFlags {
            on_air: bits & 0x08 != 0,
            sync: bits & 0x10 != 0,
            master: bits & 0x20 != 0,
            play: bits & 0x40 != 0,
        }
    }

    pub fn to_bits(self) -> u16 {
        let mut bits = 0x84;
        if self.on_air {
            bits |= 0x08;
        }
        if self.sync {
            bits |= 0x10;
        }
        if self.master {
            bits |= 0x20;
        }
        if self.play {
            bits |= 0x40;
        }
        bits
    }
}

/// Musical key reported in the CDJ-3000 status extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[rustfmt::skip]
pub enum MusicalKey {
    AMinor, BFlatMinor, BMinor, CMinor, CSharpMinor, DMinor, EFlatMinor,
    EMinor, FMinor, FSharpMinor, GMinor, AFlatMinor,
    CMajor, DFlatMajor, DMajor, EFlatMajor, EMajor, FMajor, FSharpMajor,
    GMajor, AFlatMajor, AMajor, BFlatMajor, BMajor,
}

impl MusicalKey {
    pub fn from_raw(raw: u32) -> Option<Self> {
        use MusicalKey::*;
        match raw {
            0x00000001 => Some(AMinor),
            0x0100ff01 => Some(BFlatMinor),
            0x02000001 => Some(BMinor),
            0x03000001 => Some(CMinor),
            0x04000101 => Some(CSharpMinor),
            0x05000001 => Some(DMinor),
            0x0600ff01 => Some(EFlatMinor),
            0x07000001 => Some(EMinor),
            0x08000001 => Some(FMinor),
            0x09000101 => Some(FSharpMinor),
            0x0a000001 => Some(GMinor),
            0x0b00ff01 => Some(AFlatMinor),
            0x00010001 => Some(CMajor),
            0x0101ff01 => Some(DFlatMajor),
            0x02010001 => Some(DMajor),
            0x0301ff01 => Some(EFlatMajor),
            0x04010001 => Some(EMajor),
            0x05010001 => Some(FMajor),
            0x06010101 => Some(FSharpMajor),
            0x07010001 => Some(GMajor),
            0x0801ff01 => Some(AFlatMajor),
            0x09010001 => Some(AMajor),
            0x0a01ff01 => Some(BFlatMajor),
            0x0b010001 => Some(BMajor),
            _ => None,
        }
    }
}

/// Keyshift raw value to semitones, per the observed constant table.
/// The positive constants are not a linear scale below +8; they are kept
/// verbatim rather than derived.
pub fn keyshift_semitones(raw: i64) -> Option<i8> {
    match raw as u64 {
        0x04b0 => Some(12),
        0x044c => Some(11),
        0x03e8 => Some(10),
        0x0384 => Some(9),
        0x0320 => Some(8),
        0x02cc => Some(7),
        0x0278 => Some(6),
        0x0224 => Some(5),
        0x01d0 => Some(4),
        0x017c => Some(3),
        0x0128 => Some(2),
        0x00d4 => Some(1),
        0x0000 => Some(0),
        0xffffffffffffff9c => Some(-1),
        0xffffffffffffff38 => Some(-2),
        0xfffffffffffffed4 => Some(-3),
        0xfffffffffffffe70 => Some(-4),
        0xfffffffffffffe0c => Some(-5),
        0xfffffffffffffdac => Some(-6),
        0xfffffffffffffd48 => Some(-7),
        0xfffffffffffffcf4 => Some(-8),
        0xfffffffffffffc90 => Some(-9),
        0xfffffffffffffc2c => Some(-10),
        0xfffffffffffffbb4 => Some(-11),
        0xfffffffffffffb50 => Some(-12),
        _ => None,
    }
}

/// Trailing cdj body extension sent by CDJ-3000 hardware.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Cdj3000Extension {
    pub key: Option<MusicalKey>,
    pub keyshift_raw: i64,
    /// Loop region, raw units; multiply by 0.65536 for ms.
    pub loop_start: u32,
    pub loop_end: u32,
    /// Whole beats in the loop, minimum 1.
    pub loop_beats: u16,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CdjStatus {
    /// 0 when idle, 1 when playing.
    pub activity: u16,
    /// Player the loaded track comes from; own number for local tracks.
    pub loaded_player_number: u8,
    pub loaded_slot: PlayerSlot,
    pub track_analyze_type: TrackAnalyzeType,
    /// Rekordbox database id, or cd track number.
    pub track_id: u32,
    /// Position in the playlist or browse list.
    pub track_number: u32,
    pub usb_active: bool,
    pub sd_active: bool,
    pub usb_state: StorageState,
    pub sd_state: StorageState,
    pub play_state: PlayState,
    pub firmware: String,
    pub tempo_master_count: u32,
    pub state: StateFlags,
    /// Pitch slider position.
    pub physical_pitch: f64,
    /// None when the player reports the unknown sentinel (655.35).
    pub bpm: Option<f64>,
    /// The pitch actually applied to playback.
    pub actual_pitch: f64,
    /// Beats into the track; the all-ones sentinel decodes to 0.
    pub beat_count: u32,
    /// Beats to the next cue; None when the player reports none (511).
    pub cue_distance: Option<u16>,
    /// Beat in measure 1..4; 0 when unknown.
    pub beat: u8,
    pub packet_count: u32,
    pub is_nexus: bool,
    pub extension: Option<Cdj3000Extension>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DjmStatus {
    pub state: StateFlags,
    pub physical_pitch: f64,
    pub bpm: Option<f64>,
    pub beat: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadCmd {
    pub load_player_number: u8,
    pub load_slot: PlayerSlot,
    pub load_track_id: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkQuery {
    pub source_ip: Ipv4Addr,
    pub remote_player_number: u8,
    pub slot: PlayerSlot,
}

/// Storage info reply for one slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkReply {
    pub source_player_number: u8,
    pub slot: PlayerSlot,
    pub name: String,
    pub date: String,
    pub track_count: u32,
    pub playlist_count: u32,
    pub bytes_total: u64,
    pub bytes_free: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusPacket {
    pub model: String,
    pub player_number: u8,
    pub content: StatusContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusContent {
    Cdj(CdjStatus),
    Djm(DjmStatus),
    /// Remote "load this track" command.
    LoadCmd(LoadCmd),
    LoadCmdReply,
    LinkQuery(LinkQuery),
    LinkReply(LinkReply),
    /// Sent by players looking for a rekordbox instance.
    RekordboxHello,
    RekordboxReply { name: String },
}

const TYPE_CDJ: u8 = 0x0a;
const TYPE_DJM: u8 = 0x29;
const TYPE_LOAD_CMD: u8 = 0x19;
const TYPE_LOAD_CMD_REPLY: u8 = 0x1a;
const TYPE_LINK_QUERY: u8 = 0x05;
const TYPE_LINK_REPLY: u8 = 0x06;
const TYPE_REKORDBOX_HELLO: u8 = 0x10;
const TYPE_REKORDBOX_REPLY: u8 = 0x11;

const BPM_UNKNOWN_RAW: u16 = 0xffff; // reads back as 655.35
const CUE_DISTANCE_UNKNOWN: u16 = 0x1ff;

fn normalize_bpm(raw: u16) -> Option<f64> {
    if raw == BPM_UNKNOWN_RAW {
        None
    } else {
        Some(bpm_from_raw(raw))
    }
}

impl StatusPacket {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        check_magic(&mut r)?;
        let type_code = r.u8()?;
        let model = read_model(&mut r)?;
        r.skip(2)?; // constant 1, device revision
        let player_number = r.u8()?;

        let content = match type_code {
            TYPE_CDJ => {
                let remaining = r.u16_be()?;
                r.skip(2)?; // duplicate player number, flags
                StatusContent::Cdj(decode_cdj(&mut r, remaining)?)
            }
            TYPE_DJM => {
                r.skip(4)?;
                StatusContent::Djm(DjmStatus {
                    state: StateFlags::from_bits(r.u16_be()?),
                    physical_pitch: pitch_from_raw(r.u32_be()?),
                    bpm: {
                        r.skip(2)?;
                        normalize_bpm(r.u16_be()?)
                    },
                    beat: {
                        r.skip(7)?;
                        r.u8()?
                    },
                })
            }
            TYPE_LOAD_CMD => {
                r.skip(4)?;
                r.skip(2)?;
                let load_player_number = r.u8()?;
                let load_slot = PlayerSlot::from_raw(r.u8()?)?;
                r.skip(2)?;
                let load_track_id = r.u32_be()?;
                StatusContent::LoadCmd(LoadCmd {
                    load_player_number,
                    load_slot,
                    load_track_id,
                })
            }
            TYPE_LOAD_CMD_REPLY => StatusContent::LoadCmdReply,
            TYPE_LINK_QUERY => {
                r.skip(2)?; // remaining bytes, 0x0c
                let source_ip = read_ip(&mut r)?;
                r.skip(3)?;
                let remote_player_number = r.u8()?;
                r.skip(3)?;
                let slot = PlayerSlot::from_raw(r.u8()?)?;
                StatusContent::LinkQuery(LinkQuery {
                    source_ip,
                    remote_player_number,
                    slot,
                })
            }
            TYPE_LINK_REPLY => {
                r.skip(2)?; // payload size, 0x9c
                r.skip(3)?;
                let source_player_number = r.u8()?;
                r.skip(3)?;
                let slot = PlayerSlot::from_raw(r.u8()?)?;
                let name = r.utf16_be(64)?;
                let date = r.utf16_be(24)?;
                r.skip(32)?; // model string, unused
                let track_count = r.u32_be()?;
                r.skip(4)?;
                let playlist_count = r.u32_be()?;
                let bytes_total = r.u64_be()?;
                let bytes_free = r.u64_be()?;
                StatusContent::LinkReply(LinkReply {
                    source_player_number,
                    slot,
                    name,
                    date,
                    track_count,
                    playlist_count,
                    bytes_total,
                    bytes_free,
                })
            }
            TYPE_REKORDBOX_HELLO => StatusContent::RekordboxHello,
            TYPE_REKORDBOX_REPLY => {
                r.skip(4)?; // length marker, duplicate player number, flags
                r.skip(2)?;
                StatusContent::RekordboxReply {
                    name: r.utf16_be(256)?,
                }
            }
            v => {
                return Err(Error::UnknownValue {
                    what: "status packet type",
                    value: v as u64,
                })
            }
        };

        Ok(StatusPacket {
            model,
            player_number,
            content,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(292);
        w.bytes(super::UDP_MAGIC);
        w.u8(match self.content {
            StatusContent::Cdj(_) => TYPE_CDJ,
            StatusContent::Djm(_) => TYPE_DJM,
            StatusContent::LoadCmd(_) => TYPE_LOAD_CMD,
            StatusContent::LoadCmdReply => TYPE_LOAD_CMD_REPLY,
            StatusContent::LinkQuery(_) => TYPE_LINK_QUERY,
            StatusContent::LinkReply(_) => TYPE_LINK_REPLY,
            StatusContent::RekordboxHello => TYPE_REKORDBOX_HELLO,
            StatusContent::RekordboxReply { .. } => TYPE_REKORDBOX_REPLY,
        });
        write_model(&mut w, &self.model);
        w.u8(1);
        w.u8(match self.content {
            StatusContent::Djm(_) => 1,
            StatusContent::LinkQuery(_) => 0,
            _ => 4,
        });
        w.u8(self.player_number);

        match &self.content {
            StatusContent::Cdj(cdj) => encode_cdj(&mut w, self.player_number, cdj),
            StatusContent::Djm(djm) => {
                w.u16_be(0x14);
                w.u8(self.player_number);
                w.u8(0);
                w.u16_be(djm.state.to_bits());
                w.u32_be(pitch_to_raw(djm.physical_pitch));
                w.u16_be(0x8000);
                w.u16_be(djm.bpm.map(bpm_to_raw).unwrap_or(BPM_UNKNOWN_RAW));
                w.zeros(7);
                w.u8(djm.beat);
            }
            StatusContent::LoadCmd(cmd) => {
                w.u16_be(0x34);
                w.u8(self.player_number);
                w.u8(0);
                w.zeros(2);
                w.u8(cmd.load_player_number);
                w.u8(cmd.load_slot.to_raw());
                w.u16_be(0x100);
                w.u32_be(cmd.load_track_id);
                w.u32_be(0x32);
                w.zeros(16);
                w.zeros(12); // three reserved words
                w.zeros(8);
            }
            StatusContent::LoadCmdReply => {
                w.u16_be(0x02);
                w.u8(self.player_number);
                w.u8(0);
                w.zeros(2);
            }
            StatusContent::LinkQuery(q) => {
                w.u16_be(0x0c);
                w.bytes(&q.source_ip.octets());
                w.zeros(3);
                w.u8(q.remote_player_number);
                w.zeros(3);
                w.u8(q.slot.to_raw());
            }
            StatusContent::LinkReply(reply) => {
                w.u16_be(0x9c);
                w.zeros(3);
                w.u8(reply.source_player_number);
                w.zeros(3);
                w.u8(reply.slot.to_raw());
                w.utf16_be_padded(&reply.name, 64);
                w.utf16_be_padded(&reply.date, 24);
                w.utf16_be_padded("1000", 32);
                w.u32_be(reply.track_count);
                w.u16_be(0);
                w.u16_be(0x101);
                w.u32_be(reply.playlist_count);
                w.u64_be(reply.bytes_total);
                w.u64_be(reply.bytes_free);
            }
            StatusContent::RekordboxHello => w.u16_be(0),
            StatusContent::RekordboxReply { name } => {
                w.u16_be(0x104);
                w.u8(self.player_number);
                w.u8(0);
                w.zeros(2);
                w.utf16_be_padded(name, 256);
            }
        }

        w.into_vec()
    }
}

fn decode_cdj(r: &mut ByteReader<'_>, remaining: u16) -> Result<CdjStatus> {
    let activity = r.u16_be()?;
    let loaded_player_number = r.u8()?;
    let loaded_slot = PlayerSlot::from_raw(r.u8()?)?;
    let track_analyze_type = TrackAnalyzeType::from_raw(r.u8()?)?;
    r.skip(1)?;
    let track_id = r.u32_be()?;
    let track_number = r.u32_be()?;
    r.skip(12)?; // load progress words
    r.skip(4)?;
    r.skip(4)?;
    r.skip(32)?;
    r.skip(2)?;
    let usb_active = r.u8()? == 6;
    let sd_active = r.u8()? == 6;
    let usb_state = StorageState::from_raw(r.u32_be()?)?;
    let sd_state = StorageState::from_raw(r.u32_be()?)?;
    r.skip(4)?; // link available
    let play_state = PlayState::from_raw(r.u32_be()?)?;
    let firmware = {
        let raw = r.take(4)?;
        raw.iter()
            .take_while(|&&b| b != 0)
            .map(|&b| b as char)
            .collect()
    };
    r.skip(4)?;
    let tempo_master_count = r.u32_be()?;
    let state = StateFlags::from_bits(r.u16_be()?);
    r.skip(2)?; // startup counter, secondary play state
    let physical_pitch = pitch_from_raw(r.u32_be()?);
    r.skip(2)?; // bpm source marker
    let bpm = normalize_bpm(r.u16_be()?);
    r.skip(4)?;
    let actual_pitch = pitch_from_raw(r.u32_be()?);
    r.skip(2)?; // tertiary play state
    r.skip(2)?;
    let beat_count = match r.u32_be()? {
        0xffffffff => 0,
        v => v,
    };
    let cue_distance = match r.u16_be()? {
        CUE_DISTANCE_UNKNOWN => None,
        v => Some(v),
    };
    let beat = match r.u8()? {
        0xff => 0,
        v => v,
    };
    r.skip(15)?;
    r.skip(2)?;
    r.skip(8)?;
    r.skip(8)?; // duplicate pitch pair
    let packet_count = r.u32_be()?;
    let is_nexus = r.u8()? != 0x05;

    let extension = if remaining == CDJ3000_BODY_LEN {
        r.skip(143)?;
        let key = MusicalKey::from_raw(r.u32_be()?);
        r.skip(4)?;
        let keyshift_raw = r.u64_be()? as i64;
        r.skip(76)?;
        let loop_start = r.u32_be()?;
        r.skip(4)?;
        let loop_end = r.u32_be()?;
        r.skip(4)?;
        let loop_beats = r.u16_be()?;
        Some(Cdj3000Extension {
            key,
            keyshift_raw,
            loop_start,
            loop_end,
            loop_beats,
        })
    } else {
        None
    };

    Ok(CdjStatus {
        activity,
        loaded_player_number,
        loaded_slot,
        track_analyze_type,
        track_id,
        track_number,
        usb_active,
        sd_active,
        usb_state,
        sd_state,
        play_state,
        firmware,
        tempo_master_count,
        state,
        physical_pitch,
        bpm,
        actual_pitch,
        beat_count,
        cue_distance,
        beat,
        packet_count,
        is_nexus,
        extension,
    })
}

fn encode_cdj(w: &mut ByteWriter, player_number: u8, cdj: &CdjStatus) {
    let body_len: u16 = if cdj.extension.is_some() {
        CDJ3000_BODY_LEN
    } else {
        0xf8
    };
    w.u16_be(body_len);
    w.u8(player_number);
    w.u8(0);
    let body_start = w.len();

    w.u16_be(cdj.activity);
    w.u8(cdj.loaded_player_number);
    w.u8(cdj.loaded_slot.to_raw());
    w.u8(cdj.track_analyze_type.to_raw());
    w.u8(0);
    w.u32_be(cdj.track_id);
    w.u32_be(cdj.track_number);
    w.zeros(12);
    w.zeros(4);
    w.zeros(4);
    w.zeros(32);
    w.u16_be(0x100);
    w.u8(if cdj.usb_active { 6 } else { 4 });
    w.u8(if cdj.sd_active { 6 } else { 4 });
    w.u32_be(cdj.usb_state.to_raw());
    w.u32_be(cdj.sd_state.to_raw());
    w.u32_be(1);
    w.u32_be(cdj.play_state.to_raw());
    let start = w.len();
    for b in cdj.firmware.bytes().take(4) {
        w.u8(b);
    }
    w.zeros(4 - (w.len() - start));
    w.zeros(4);
    w.u32_be(cdj.tempo_master_count);
    w.u16_be(cdj.state.to_bits());
    w.u8(0xff);
    w.u8(if cdj.play_state == PlayState::Playing {
        0xfa
    } else {
        0xfe
    });
    w.u32_be(pitch_to_raw(cdj.physical_pitch));
    w.u16_be(0x8000);
    w.u16_be(cdj.bpm.map(bpm_to_raw).unwrap_or(BPM_UNKNOWN_RAW));
    w.u32_be(0x7fffffff);
    w.u32_be(pitch_to_raw(cdj.actual_pitch));
    w.u16_be(if cdj.play_state == PlayState::Playing {
        9
    } else {
        1
    });
    w.u8(1);
    w.u8(0xff);
    w.u32_be(cdj.beat_count);
    w.u16_be(cdj.cue_distance.unwrap_or(CUE_DISTANCE_UNKNOWN));
    w.u8(if cdj.beat == 0 { 0xff } else { cdj.beat });
    w.zeros(15);
    w.u16_be(0x1000);
    w.zeros(8);
    w.u32_be(pitch_to_raw(cdj.physical_pitch));
    w.u32_be(pitch_to_raw(cdj.actual_pitch));
    w.u32_be(cdj.packet_count);
    w.u8(if cdj.is_nexus { 0x0f } else { 0x05 });

    if let Some(ext) = &cdj.extension {
        w.zeros(143);
        // raw key constants are reconstructed from the decoded enum
        w.u32_be(match ext.key {
            Some(key) => musical_key_to_raw(key),
            None => 0,
        });
        w.zeros(4);
        w.u64_be(ext.keyshift_raw as u64);
        w.zeros(76);
        w.u32_be(ext.loop_start);
        w.zeros(4);
        w.u32_be(ext.loop_end);
        w.zeros(4);
        w.u16_be(ext.loop_beats);
    }

    // players pad the body out to the announced length
    let target = body_start + body_len as usize;
    if w.len() < target {
        w.zeros(target - w.len());
    }
}

fn musical_key_to_raw(key: MusicalKey) -> u32 {
    use MusicalKey::*;
    match key {
        AMinor => 0x00000001,
        BFlatMinor => 0x0100ff01,
        BMinor => 0x02000001,
        CMinor => 0x03000001,
        CSharpMinor => 0x04000101,
        DMinor => 0x05000001,
        EFlatMinor => 0x0600ff01,
        EMinor => 0x07000001,
        FMinor => 0x08000001,
        FSharpMinor => 0x09000101,
        GMinor => 0x0a000001,
        AFlatMinor => 0x0b00ff01,
        CMajor => 0x00010001,
        DFlatMajor => 0x0101ff01,
        DMajor => 0x02010001,
        EFlatMajor => 0x0301ff01,
        EMajor => 0x04010001,
        FMajor => 0x05010001,
        FSharpMajor => 0x06010101,
        GMajor => 0x07010001,
        AFlatMajor => 0x0801ff01,
        AMajor => 0x09010001,
        BFlatMajor => 0x0a01ff01,
        BMajor => 0x0b010001,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_cdj() -> CdjStatus {
        CdjStatus {
            activity: 1,
            loaded_player_number: 2,
            loaded_slot: PlayerSlot::Usb,
            track_analyze_type: TrackAnalyzeType::Rekordbox,
            track_id: 1234,
            track_number: 7,
            usb_active: true,
            sd_active: false,
            usb_state: StorageState::Loaded,
            sd_state: StorageState::NotLoaded,
            play_state: PlayState::Playing,
            firmware: "1.05".into(),
            tempo_master_count: 3,
            state: StateFlags {
                on_air: true,
                sync: false,
                master: true,
                play: true,
            },
            physical_pitch: 1.05,
            bpm: Some(128.0),
            actual_pitch: 1.05,
            beat_count: 250,
            cue_distance: Some(16),
            beat: 2,
            packet_count: 4711,
            is_nexus: true,
            extension: None,
        }
    }

    #[test]
    fn test_cdj_roundtrip() {
        let packet = StatusPacket {
            model: "XDJ-1000".into(),
            player_number: 2,
            content: StatusContent::Cdj(sample_cdj()),
        };
        let encoded = packet.encode();
        assert_eq!(encoded.len(), 38 + 0xf8);
        let decoded = StatusPacket::decode(&encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_cdj3000_extension_roundtrip() {
        let mut cdj = sample_cdj();
        cdj.extension = Some(Cdj3000Extension {
            key: Some(MusicalKey::AMinor),
            keyshift_raw: -100,
            loop_start: 1000,
            loop_end: 2000,
            loop_beats: 4,
        });
        let packet = StatusPacket {
            model: "CDJ-3000".into(),
            player_number: 1,
            content: StatusContent::Cdj(cdj),
        };
        let decoded = StatusPacket::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
        match decoded.content {
            StatusContent::Cdj(c) => {
                let ext = c.extension.unwrap();
                assert_eq!(keyshift_semitones(ext.keyshift_raw), Some(-1));
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_sentinel_normalization() {
        let mut cdj = sample_cdj();
        cdj.bpm = None;
        cdj.cue_distance = None;
        cdj.beat = 0;
        let packet = StatusPacket {
            model: "XDJ-1000".into(),
            player_number: 2,
            content: StatusContent::Cdj(cdj),
        };
        let encoded = packet.encode();
        // bpm sentinel bytes are 0xffff at body offset 108
        assert_eq!(&encoded[38 + 108..38 + 110], &[0xff, 0xff]);
        match StatusPacket::decode(&encoded).unwrap().content {
            StatusContent::Cdj(decoded) => {
                assert_eq!(decoded.bpm, None);
                assert_eq!(decoded.cue_distance, None);
                assert_eq!(decoded.beat, 0);
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_beat_count_sentinel() {
        let packet = StatusPacket {
            model: "XDJ-1000".into(),
            player_number: 2,
            content: StatusContent::Cdj(sample_cdj()),
        };
        let mut encoded = packet.encode();
        // overwrite beat_count with the all-ones sentinel
        encoded[38 + 122..38 + 126].copy_from_slice(&[0xff; 4]);
        match StatusPacket::decode(&encoded).unwrap().content {
            StatusContent::Cdj(decoded) => assert_eq!(decoded.beat_count, 0),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_djm_roundtrip() {
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
                physical_pitch: 1.0,
                bpm: Some(140.0),
                beat: 4,
            }),
        };
        assert_eq!(StatusPacket::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn test_link_reply_roundtrip() {
        let packet = StatusPacket {
            model: "CDJ-2000NXS2".into(),
            player_number: 3,
            content: StatusContent::LinkReply(LinkReply {
                source_player_number: 3,
                slot: PlayerSlot::Usb,
                name: "PIONEER USB".into(),
                date: "2024-02-11".into(),
                track_count: 842,
                playlist_count: 12,
                bytes_total: 64 * 1024 * 1024 * 1024,
                bytes_free: 12 * 1024 * 1024 * 1024,
            }),
        };
        assert_eq!(StatusPacket::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn test_load_cmd_roundtrip() {
        let packet = StatusPacket {
            model: "Virtual CDJ".into(),
            player_number: 5,
            content: StatusContent::LoadCmd(LoadCmd {
                load_player_number: 2,
                load_slot: PlayerSlot::Sd,
                load_track_id: 99,
            }),
        };
        assert_eq!(StatusPacket::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn test_link_query_roundtrip() {
        let packet = StatusPacket {
            model: "Virtual CDJ".into(),
            player_number: 5,
            content: StatusContent::LinkQuery(LinkQuery {
                source_ip: Ipv4Addr::new(192, 168, 1, 10),
                remote_player_number: 2,
                slot: PlayerSlot::Sd,
            }),
        };
        assert_eq!(StatusPacket::decode(&packet.encode()).unwrap(), packet);
    }

    #[test]
    fn test_state_flags_always_on_bits() {
        let flags = StateFlags {
            on_air: true,
            sync: false,
            master: false,
            play: true,
        };
        assert_eq!(flags.to_bits() & 0x84, 0x84);
        assert_eq!(StateFlags::from_bits(flags.to_bits()), flags);
    }

    #[test]
    fn test_truncated_rejected() {
        let packet = StatusPacket {
            model: "XDJ-1000".into(),
            player_number: 2,
            content: StatusContent::Cdj(sample_cdj()),
        };
        let encoded = packet.encode();
        assert!(StatusPacket::decode(&encoded[..100]).is_err());
        assert!(StatusPacket::decode(&encoded[..38 + 120]).is_err());
    }
}
