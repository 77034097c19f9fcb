//! Beat packets (udp port 50001).
//!
//! Beside the per-beat timing broadcast these carry the mixer on-air
//! bitmap, fader start commands and the CDJ-3000 absolute position
//! report.

use serde::{Deserialize, Serialize};

use super::{
    bpm_from_raw, bpm_to_raw, check_magic, pitch_from_raw, pitch_to_raw, read_model, write_model,
};
use crate::bytesio::{ByteReader, ByteWriter};
use crate::error::{Error, Result};

/// Millisecond distances to the upcoming beats and bars.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BeatDistances {
    pub next_beat: u32,
    pub second_beat: u32,
    pub next_bar: u32,
    pub fourth_beat: u32,
    pub second_bar: u32,
    pub eighth_beat: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaderCommand {
    Start,
    Stop,
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BeatPacket {
    pub model: String,
    pub player_number: u8,
    pub content: BeatContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeatContent {
    /// The standard beat info packet, sent on every beat.
    Beat {
        distances: BeatDistances,
        pitch: f64,
        bpm: f64,
        /// Beat in measure, 1..4.
        beat: u8,
    },
    /// Precise playhead report, only sent by CDJ-3000 hardware.
    AbsolutePosition {
        /// Track length, rounded to the nearest second.
        track_len: u32,
        /// Playhead position in ms.
        playhead: u32,
        /// Pitch in percent, times 100.
        pitch: i32,
        /// Bpm times 10.
        bpm: u32,
    },
    /// Nxs mixer channel on-air states, one byte per channel 1..4.
    MixerOnAir { ch_on_air: [u8; 4] },
    /// Periodic mixer presence packet with an opaque counter.
    MixerHello { counter: u8 },
    /// Remote start/stop per channel.
    FaderStart { player: [FaderCommand; 4] },
}

const TYPE_BEAT: u8 = 0x28;
const TYPE_ABSOLUTE_POSITION: u8 = 0x0b;
const TYPE_MIXER: u8 = 0x03;
const TYPE_MIXER_HELLO: u8 = 0x04;
const TYPE_FADER_START: u8 = 0x02;

const STYPE_BEAT: u8 = 0x3c;
const STYPE_MIXER: u8 = 0x09;
const STYPE_MIXER_HELLO: u8 = 0x40;
const STYPE_FADER_START: u8 = 0x04;

impl FaderCommand {
    fn from_raw(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(FaderCommand::Start),
            1 => Ok(FaderCommand::Stop),
            2 => Ok(FaderCommand::Ignore),
            v => Err(Error::UnknownValue {
                what: "fader command",
                value: v as u64,
            }),
        }
    }

    fn to_raw(self) -> u8 {
        match self {
            FaderCommand::Start => 0,
            FaderCommand::Stop => 1,
            FaderCommand::Ignore => 2,
        }
    }
}

impl BeatPacket {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        check_magic(&mut r)?;
        let type_code = r.u8()?;
        let model = read_model(&mut r)?;
        r.skip(2)?; // 256 for cdjs, 257 for rekordbox
        let player_number = r.u8()?;
        r.skip(1)?;
        r.skip(1)?; // subtype

        let content = match type_code {
            TYPE_BEAT => {
                let distances = BeatDistances {
                    next_beat: r.u32_be()?,
                    second_beat: r.u32_be()?,
                    next_bar: r.u32_be()?,
                    fourth_beat: r.u32_be()?,
                    second_bar: r.u32_be()?,
                    eighth_beat: r.u32_be()?,
                };
                r.skip(24)?;
                let pitch = pitch_from_raw(r.u32_be()?);
                r.skip(2)?; // 0, or 0xff while scratching
                let bpm = bpm_from_raw(r.u16_be()?);
                let beat = r.u8()?;
                BeatContent::Beat {
                    distances,
                    pitch,
                    bpm,
                    beat,
                }
            }
            TYPE_ABSOLUTE_POSITION => {
                let track_len = r.u32_be()?;
                let playhead = r.u32_be()?;
                let pitch = r.u32_be()? as i32;
                r.skip(8)?;
                let bpm = r.u32_be()?;
                BeatContent::AbsolutePosition {
                    track_len,
                    playhead,
                    pitch,
                    bpm,
                }
            }
            TYPE_MIXER => {
                let b = r.take(4)?;
                BeatContent::MixerOnAir {
                    ch_on_air: [b[0], b[1], b[2], b[3]],
                }
            }
            TYPE_MIXER_HELLO => {
                let counter = r.u8()?;
                r.skip(1)?;
                BeatContent::MixerHello { counter }
            }
            TYPE_FADER_START => {
                let b = r.take(4)?;
                BeatContent::FaderStart {
                    player: [
                        FaderCommand::from_raw(b[0])?,
                        FaderCommand::from_raw(b[1])?,
                        FaderCommand::from_raw(b[2])?,
                        FaderCommand::from_raw(b[3])?,
                    ],
                }
            }
            v => {
                return Err(Error::UnknownValue {
                    what: "beat packet type",
                    value: v as u64,
                })
            }
        };

        Ok(BeatPacket {
            model,
            player_number,
            content,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let (type_code, subtype) = match self.content {
            BeatContent::Beat { .. } => (TYPE_BEAT, STYPE_BEAT),
            BeatContent::AbsolutePosition { .. } => (TYPE_ABSOLUTE_POSITION, STYPE_BEAT),
            BeatContent::MixerOnAir { .. } => (TYPE_MIXER, STYPE_MIXER),
            BeatContent::MixerHello { .. } => (TYPE_MIXER_HELLO, STYPE_MIXER_HELLO),
            BeatContent::FaderStart { .. } => (TYPE_FADER_START, STYPE_FADER_START),
        };

        let mut w = ByteWriter::with_capacity(96);
        w.bytes(super::UDP_MAGIC);
        w.u8(type_code);
        write_model(&mut w, &self.model);
        w.u16_be(256);
        w.u8(self.player_number);
        w.u8(0);
        w.u8(subtype);

        match &self.content {
            BeatContent::Beat {
                distances,
                pitch,
                bpm,
                beat,
            } => {
                w.u32_be(distances.next_beat);
                w.u32_be(distances.second_beat);
                w.u32_be(distances.next_bar);
                w.u32_be(distances.fourth_beat);
                w.u32_be(distances.second_bar);
                w.u32_be(distances.eighth_beat);
                w.zeros(24);
                w.u32_be(pitch_to_raw(*pitch));
                w.zeros(2);
                w.u16_be(bpm_to_raw(*bpm));
                w.u8(*beat);
                w.zeros(2);
                w.u8(self.player_number);
            }
            BeatContent::AbsolutePosition {
                track_len,
                playhead,
                pitch,
                bpm,
            } => {
                w.u32_be(*track_len);
                w.u32_be(*playhead);
                w.u32_be(*pitch as u32);
                w.zeros(8);
                w.u32_be(*bpm);
            }
            BeatContent::MixerOnAir { ch_on_air } => w.bytes(ch_on_air),
            BeatContent::MixerHello { counter } => {
                w.u8(*counter);
                w.u8(self.player_number);
            }
            BeatContent::FaderStart { player } => {
                for cmd in player {
                    w.u8(cmd.to_raw());
                }
            }
        }

        w.into_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: BeatPacket) {
        let decoded = BeatPacket::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_beat_roundtrip() {
        roundtrip(BeatPacket {
            model: "XDJ-1000".into(),
            player_number: 2,
            content: BeatContent::Beat {
                distances: BeatDistances {
                    next_beat: 468,
                    second_beat: 937,
                    next_bar: 1875,
                    fourth_beat: 1406,
                    second_bar: 3750,
                    eighth_beat: 3281,
                },
                pitch: 1.0,
                bpm: 128.0,
                beat: 3,
            },
        });
    }

    #[test]
    fn test_beat_packet_is_96_bytes() {
        let packet = BeatPacket {
            model: "CDJ-2000NXS".into(),
            player_number: 1,
            content: BeatContent::Beat {
                distances: BeatDistances::default(),
                pitch: 1.0,
                bpm: 120.0,
                beat: 1,
            },
        };
        assert_eq!(packet.encode().len(), 96);
    }

    #[test]
    fn test_mixer_and_fader_roundtrip() {
        roundtrip(BeatPacket {
            model: "DJM-900NXS2".into(),
            player_number: 33,
            content: BeatContent::MixerOnAir {
                ch_on_air: [1, 0, 0, 1],
            },
        });
        roundtrip(BeatPacket {
            model: "Virtual CDJ".into(),
            player_number: 5,
            content: BeatContent::FaderStart {
                player: [
                    FaderCommand::Start,
                    FaderCommand::Ignore,
                    FaderCommand::Ignore,
                    FaderCommand::Stop,
                ],
            },
        });
    }

    #[test]
    fn test_absolute_position_roundtrip() {
        roundtrip(BeatPacket {
            model: "CDJ-3000".into(),
            player_number: 1,
            content: BeatContent::AbsolutePosition {
                track_len: 323,
                playhead: 152340,
                pitch: -250,
                bpm: 1280,
            },
        });
    }

    #[test]
    fn test_pitch_fixed_point() {
        assert_eq!(pitch_from_raw(0x100000), 1.0);
        assert_eq!(pitch_to_raw(1.0), 0x100000);
        assert!((pitch_from_raw(pitch_to_raw(1.0563)) - 1.0563).abs() < 1e-5);
    }

    #[test]
    fn test_truncated_rejected() {
        let data = BeatPacket {
            model: "XDJ-1000".into(),
            player_number: 2,
            content: BeatContent::MixerOnAir {
                ch_on_air: [0, 0, 0, 0],
            },
        }
        .encode();
        assert!(BeatPacket::decode(&data[..data.len() - 2]).is_err());
    }
}
