//! Beatgrid data, shared between the live protocol blob reply and the
//! analysis file `PQTZ` tag.

use std::io::Cursor;

use binrw::{binrw, BinRead};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// One grid entry: beat in measure, tempo at that beat and the absolute
/// time from track start. Tempo may change on every beat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridBeat {
    /// Beat in measure, 1..4.
    pub beat: u16,
    /// Bpm times 100.
    pub bpm_100: u16,
    /// Milliseconds from track start.
    pub time_ms: u32,
}

impl GridBeat {
    pub fn bpm(&self) -> f64 {
        self.bpm_100 as f64 / 100.0
    }
}

#[binrw]
#[brw(little)]
#[allow(dead_code)]
struct LiveGridHeader {
    #[brw(pad_before = 4)]
    beat_count: u32,
    payload_size: u32,
    u1: u32,
    u2: u16,
    u3: u16,
}

#[binrw]
#[brw(little)]
struct LiveGridBeat {
    beat: u16,
    bpm_100: u16,
    #[brw(pad_after = 8)]
    time_ms: u32,
}

/// Parses the little-endian beatgrid blob returned by a live beatgrid
/// query.
pub fn parse_live_beatgrid(data: &[u8]) -> Result<Vec<GridBeat>> {
    let mut cursor = Cursor::new(data);
    let header = LiveGridHeader::read(&mut cursor)?;
    let mut beats = Vec::with_capacity(header.beat_count as usize);
    for _ in 0..header.beat_count {
        let raw = LiveGridBeat::read(&mut cursor)?;
        beats.push(GridBeat {
            beat: raw.beat,
            bpm_100: raw.bpm_100,
            time_ms: raw.time_ms,
        });
    }
    Ok(beats)
}

/// Constructs the live-protocol wire form; only used by tests and tools.
pub fn build_live_beatgrid(beats: &[GridBeat]) -> Vec<u8> {
    let mut out = Vec::with_capacity(20 + beats.len() * 16);
    out.extend_from_slice(&[0u8; 4]);
    out.extend_from_slice(&(beats.len() as u32).to_le_bytes());
    out.extend_from_slice(&((beats.len() * 16) as u32).to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    out.extend_from_slice(&0u16.to_le_bytes());
    for beat in beats {
        out.extend_from_slice(&beat.beat.to_le_bytes());
        out.extend_from_slice(&beat.bpm_100.to_le_bytes());
        out.extend_from_slice(&beat.time_ms.to_le_bytes());
        out.extend_from_slice(&[0xff; 8]);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_live_beatgrid_roundtrip() {
        let beats = vec![
            GridBeat {
                beat: 1,
                bpm_100: 12800,
                time_ms: 100,
            },
            GridBeat {
                beat: 2,
                bpm_100: 12800,
                time_ms: 568,
            },
            GridBeat {
                beat: 3,
                bpm_100: 12810,
                time_ms: 1037,
            },
        ];
        let blob = build_live_beatgrid(&beats);
        assert_eq!(parse_live_beatgrid(&blob).unwrap(), beats);
    }

    #[test]
    fn test_truncated_beatgrid_fails() {
        let blob = build_live_beatgrid(&[GridBeat {
            beat: 1,
            bpm_100: 12000,
            time_ms: 50,
        }]);
        assert!(parse_live_beatgrid(&blob[..blob.len() - 4]).is_err());
    }
}
