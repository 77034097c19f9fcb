//! Keepalive/discovery packets (udp port 50000).
//!
//! The type byte selects one of six variants used during the player
//! number negotiation and as the periodic presence announcement. Type
//! and subtype come in fixed pairs; the subtype is not validated on
//! decode since mixers reuse it inconsistently.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use super::{check_magic, read_ip, read_mac, read_model, write_model, DeviceType};
use crate::bytesio::{ByteReader, ByteWriter};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlayerNumberAssignment {
    Auto,
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeepalivePacket {
    pub model: String,
    pub device_type: DeviceType,
    pub content: KeepaliveContent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeepaliveContent {
    /// Request for other players to propose a player number.
    Hello,
    /// Proposed player number being claimed; iteration counts 1..3.
    Number { proposed_player_number: u8, iteration: u8 },
    /// Mac address announcement during negotiation.
    Mac { iteration: u8, mac_addr: [u8; 6] },
    /// Ip + mac announcement during negotiation.
    Ip {
        ip_addr: Ipv4Addr,
        mac_addr: [u8; 6],
        player_number: u8,
        iteration: u8,
        assignment: PlayerNumberAssignment,
    },
    /// The periodic presence announcement.
    Status {
        player_number: u8,
        mac_addr: [u8; 6],
        ip_addr: Ipv4Addr,
        device_count: u8,
    },
    /// Sent while a player changes its number; carries only the old one.
    Change { old_player_number: u8, ip_addr: Ipv4Addr },
}

const TYPE_HELLO: u8 = 0x0a;
const TYPE_NUMBER: u8 = 0x04;
const TYPE_MAC: u8 = 0x00;
const TYPE_IP: u8 = 0x02;
const TYPE_STATUS: u8 = 0x06;
const TYPE_CHANGE: u8 = 0x08;

const STYPE_HELLO: u8 = 0x25;
const STYPE_NUMBER: u8 = 0x26;
const STYPE_MAC: u8 = 0x2c;
const STYPE_IP: u8 = 0x32;
const STYPE_STATUS: u8 = 0x36;
const STYPE_CHANGE: u8 = 0x29;

impl KeepalivePacket {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        check_magic(&mut r)?;
        let type_code = r.u8()?;
        r.skip(1)?;
        let model = read_model(&mut r)?;
        r.skip(1)?; // constant 1
        let device_type = DeviceType::from_raw(r.u8()?)?;
        r.skip(1)?;
        r.skip(1)?; // subtype, paired with type but not trustworthy

        let content = match type_code {
            TYPE_HELLO => {
                r.skip(1)?;
                KeepaliveContent::Hello
            }
            TYPE_NUMBER => KeepaliveContent::Number {
                proposed_player_number: r.u8()?,
                iteration: r.u8()?,
            },
            TYPE_MAC => {
                let iteration = r.u8()?;
                r.skip(1)?; // feature flags
                KeepaliveContent::Mac {
                    iteration,
                    mac_addr: read_mac(&mut r)?,
                }
            }
            TYPE_IP => {
                let ip_addr = read_ip(&mut r)?;
                let mac_addr = read_mac(&mut r)?;
                let player_number = r.u8()?;
                let iteration = r.u8()?;
                r.skip(1)?; // feature flags
                let assignment = match r.u8()? {
                    1 => PlayerNumberAssignment::Auto,
                    _ => PlayerNumberAssignment::Manual,
                };
                KeepaliveContent::Ip {
                    ip_addr,
                    mac_addr,
                    player_number,
                    iteration,
                    assignment,
                }
            }
            TYPE_STATUS => {
                let player_number = r.u8()?;
                r.skip(1)?; // secondary player number
                let mac_addr = read_mac(&mut r)?;
                let ip_addr = read_ip(&mut r)?;
                let device_count = r.u8()?;
                KeepaliveContent::Status {
                    player_number,
                    mac_addr,
                    ip_addr,
                    device_count,
                }
            }
            TYPE_CHANGE => KeepaliveContent::Change {
                old_player_number: r.u8()?,
                ip_addr: read_ip(&mut r)?,
            },
            v => {
                return Err(Error::UnknownValue {
                    what: "keepalive packet type",
                    value: v as u64,
                })
            }
        };

        Ok(KeepalivePacket {
            model,
            device_type,
            content,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let (type_code, subtype) = match self.content {
            KeepaliveContent::Hello => (TYPE_HELLO, STYPE_HELLO),
            KeepaliveContent::Number { .. } => (TYPE_NUMBER, STYPE_NUMBER),
            KeepaliveContent::Mac { .. } => (TYPE_MAC, STYPE_MAC),
            KeepaliveContent::Ip { .. } => (TYPE_IP, STYPE_IP),
            KeepaliveContent::Status { .. } => (TYPE_STATUS, STYPE_STATUS),
            KeepaliveContent::Change { .. } => (TYPE_CHANGE, STYPE_CHANGE),
        };

        let mut w = ByteWriter::with_capacity(64);
        w.bytes(super::UDP_MAGIC);
        w.u8(type_code);
        w.u8(0);
        write_model(&mut w, &self.model);
        w.u8(1);
        w.u8(self.device_type.to_raw());
        w.u8(0);
        w.u8(subtype);

        match &self.content {
            KeepaliveContent::Hello => w.u8(1),
            KeepaliveContent::Number {
                proposed_player_number,
                iteration,
            } => {
                w.u8(*proposed_player_number);
                w.u8(*iteration);
            }
            KeepaliveContent::Mac {
                iteration,
                mac_addr,
            } => {
                w.u8(*iteration);
                w.u8(1);
                w.bytes(mac_addr);
            }
            KeepaliveContent::Ip {
                ip_addr,
                mac_addr,
                player_number,
                iteration,
                assignment,
            } => {
                w.bytes(&ip_addr.octets());
                w.bytes(mac_addr);
                w.u8(*player_number);
                w.u8(*iteration);
                w.u8(1);
                w.u8(match assignment {
                    PlayerNumberAssignment::Auto => 1,
                    PlayerNumberAssignment::Manual => 2,
                });
            }
            KeepaliveContent::Status {
                player_number,
                mac_addr,
                ip_addr,
                device_count,
            } => {
                w.u8(*player_number);
                w.u8(1);
                w.bytes(mac_addr);
                w.bytes(&ip_addr.octets());
                w.u8(*device_count);
                w.zeros(3);
                w.u8(1); // feature flags
                w.u8(0);
            }
            KeepaliveContent::Change {
                old_player_number,
                ip_addr,
            } => {
                w.u8(*old_player_number);
                w.bytes(&ip_addr.octets());
            }
        }

        w.into_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(packet: KeepalivePacket) {
        let encoded = packet.encode();
        let decoded = KeepalivePacket::decode(&encoded).unwrap();
        assert_eq!(decoded, packet);
    }

    #[test]
    fn test_status_roundtrip() {
        roundtrip(KeepalivePacket {
            model: "XDJ-1000".into(),
            device_type: DeviceType::Cdj,
            content: KeepaliveContent::Status {
                player_number: 3,
                mac_addr: [0x74, 0x5e, 0x1c, 0x01, 0x02, 0x03],
                ip_addr: Ipv4Addr::new(192, 168, 1, 30),
                device_count: 2,
            },
        });
    }

    #[test]
    fn test_negotiation_roundtrips() {
        roundtrip(KeepalivePacket {
            model: "CDJ-2000NXS2".into(),
            device_type: DeviceType::Cdj,
            content: KeepaliveContent::Hello,
        });
        roundtrip(KeepalivePacket {
            model: "CDJ-2000NXS2".into(),
            device_type: DeviceType::Cdj,
            content: KeepaliveContent::Number {
                proposed_player_number: 2,
                iteration: 1,
            },
        });
        roundtrip(KeepalivePacket {
            model: "CDJ-2000NXS2".into(),
            device_type: DeviceType::Cdj,
            content: KeepaliveContent::Ip {
                ip_addr: Ipv4Addr::new(10, 0, 0, 7),
                mac_addr: [1, 2, 3, 4, 5, 6],
                player_number: 4,
                iteration: 3,
                assignment: PlayerNumberAssignment::Manual,
            },
        });
        roundtrip(KeepalivePacket {
            model: "DJM-900NXS2".into(),
            device_type: DeviceType::Djm,
            content: KeepaliveContent::Change {
                old_player_number: 2,
                ip_addr: Ipv4Addr::new(10, 0, 0, 7),
            },
        });
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut data = KeepalivePacket {
            model: "XDJ-1000".into(),
            device_type: DeviceType::Cdj,
            content: KeepaliveContent::Hello,
        }
        .encode();
        data[0] = b'X';
        assert!(matches!(
            KeepalivePacket::decode(&data),
            Err(Error::BadMagic { .. })
        ));
    }

    #[test]
    fn test_truncated_rejected() {
        let data = KeepalivePacket {
            model: "XDJ-1000".into(),
            device_type: DeviceType::Cdj,
            content: KeepaliveContent::Status {
                player_number: 1,
                mac_addr: [0; 6],
                ip_addr: Ipv4Addr::new(10, 0, 0, 1),
                device_count: 1,
            },
        }
        .encode();
        for cut in [4, 11, 36, 40] {
            assert!(KeepalivePacket::decode(&data[..cut]).is_err());
        }
    }
}
