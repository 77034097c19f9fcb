//! ANLZ analysis file parsing (.DAT, .EXT)
//!
//! ANLZ files are **big-endian** and contain self-describing tagged
//! sections after a `PMAI` file header:
//! - PPTH: source file path
//! - PVBR: VBR seek index
//! - PQTZ: beat grid
//! - PWAV / PWV2: preview waveform (monochrome)
//! - PWV3: detail waveform
//! - PWV4 / PWV5: color waveforms (consumed raw by the rendering layer)
//! - PCOB / PCO2: cue and loop points, two historical record shapes
//!
//! Unrecognized tags are skipped using their declared size, never
//! assumed to be a fixed shape.
//!
//! Reference: https://djl-analysis.deepsymmetry.org/rekordbox-export-analysis/anlz.html

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bytesio::ByteReader;
use crate::error::{Error, Result};
use crate::grid::GridBeat;

const PMAI_TAG: &[u8; 4] = b"PMAI";
const PPTH_TAG: &[u8; 4] = b"PPTH";
const PVBR_TAG: &[u8; 4] = b"PVBR";
const PQTZ_TAG: &[u8; 4] = b"PQTZ";
const PWAV_TAG: &[u8; 4] = b"PWAV";
const PWV2_TAG: &[u8; 4] = b"PWV2";
const PWV3_TAG: &[u8; 4] = b"PWV3";
const PWV4_TAG: &[u8; 4] = b"PWV4";
const PWV5_TAG: &[u8; 4] = b"PWV5";
const PCOB_TAG: &[u8; 4] = b"PCOB";
const PCO2_TAG: &[u8; 4] = b"PCO2";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CueKind {
    Single,
    Loop,
}

/// One memory or hot cue. The `PCO2` record shape lacks the kind,
/// status and ordering fields, which decode as their defaults there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CuePoint {
    /// 0 for memory cues, 1..8 for hot cues.
    pub hotcue_number: u32,
    pub kind: CueKind,
    pub enabled: bool,
    pub order_first: u16,
    pub order_last: u16,
    pub time_ms: u32,
    /// Loop end; u32::MAX when the cue is not a loop.
    pub time_end_ms: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AnlzTag {
    Path(String),
    /// 400-column VBR seek index.
    VbrIndex(Vec<u32>),
    Beatgrid(Vec<GridBeat>),
    /// 1 byte per column: low 5 bits height, high 3 bits brightness.
    Waveform(Vec<u8>),
    TinyWaveform(Vec<u8>),
    BigWaveform(Vec<u8>),
    /// Raw packed color columns, max-reduced by the rendering layer.
    ColorPreviewWaveform(Vec<u8>),
    ColorWaveform(Vec<u8>),
    CueList(Vec<CuePoint>),
    ExtendedCueList(Vec<CuePoint>),
    /// Preserved opaquely for interoperability.
    Unknown { tag: [u8; 4], payload: Vec<u8> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnlzFile {
    pub tags: Vec<AnlzTag>,
}

impl AnlzFile {
    pub fn parse(data: &[u8]) -> Result<Self> {
        let mut r = ByteReader::new(data);
        if r.take(4)? != PMAI_TAG {
            return Err(Error::BadMagic {
                what: "analysis file",
            });
        }
        let head_size = r.u32_be()? as usize;
        let _file_size = r.u32_be()?;
        if head_size < 12 {
            return Err(Error::Analysis(format!(
                "header size {} too small",
                head_size
            )));
        }
        r.skip(head_size - 12)?;

        let mut tags = Vec::new();
        while r.remaining() >= 12 {
            let tag_start = r.position();
            let mut tag = [0u8; 4];
            tag.copy_from_slice(r.take(4)?);
            let tag_head_size = r.u32_be()? as usize;
            let tag_size = r.u32_be()? as usize;
            if tag_size < 12 || tag_start + tag_size > data.len() {
                warn!(
                    tag = %String::from_utf8_lossy(&tag),
                    tag_size,
                    "tag with impossible size, stopping"
                );
                break;
            }
            let payload = &data[tag_start + 12..tag_start + tag_size];
            match parse_tag(&tag, tag_head_size, payload) {
                Ok(parsed) => tags.push(parsed),
                Err(e) => {
                    // a malformed section does not fail the whole file
                    warn!(tag = %String::from_utf8_lossy(&tag), error = %e, "skipping tag");
                }
            }
            r.skip(tag_size - 12)?;
        }
        debug!(count = tags.len(), "analysis tags loaded");
        Ok(AnlzFile { tags })
    }
}

/// Parses a single tag starting at offset 0, as found in live-protocol
/// replies that smuggle analysis payloads.
pub fn parse_single_tag(data: &[u8]) -> Result<AnlzTag> {
    let mut r = ByteReader::new(data);
    let mut tag = [0u8; 4];
    tag.copy_from_slice(r.take(4)?);
    let head_size = r.u32_be()? as usize;
    let tag_size = r.u32_be()? as usize;
    if tag_size < 12 || tag_size > data.len() {
        return Err(Error::Analysis(format!(
            "tag with impossible size {}",
            tag_size
        )));
    }
    parse_tag(&tag, head_size, &data[12..tag_size])
}

fn parse_tag(tag: &[u8; 4], _head_size: usize, payload: &[u8]) -> Result<AnlzTag> {
    let mut r = ByteReader::new(payload);
    match tag {
        PPTH_TAG => {
            let len = r.u32_be()? as usize;
            if len < 2 {
                return Ok(AnlzTag::Path(String::new()));
            }
            Ok(AnlzTag::Path(r.utf16_be(len - 2)?))
        }
        PVBR_TAG => {
            r.skip(4)?;
            let mut idx = Vec::with_capacity(400);
            for _ in 0..400 {
                idx.push(r.u32_be()?);
            }
            Ok(AnlzTag::VbrIndex(idx))
        }
        PQTZ_TAG => {
            r.skip(4)?;
            r.skip(4)?; // format marker
            let count = r.u32_be()? as usize;
            let mut beats = Vec::with_capacity(count);
            for _ in 0..count {
                beats.push(GridBeat {
                    beat: r.u16_be()?,
                    bpm_100: r.u16_be()?,
                    time_ms: r.u32_be()?,
                });
            }
            Ok(AnlzTag::Beatgrid(beats))
        }
        PWAV_TAG | PWV2_TAG => {
            let len = r.u32_be()? as usize;
            r.skip(4)?; // format marker
            let entries = r.take(len)?.to_vec();
            if tag == PWAV_TAG {
                Ok(AnlzTag::Waveform(entries))
            } else {
                Ok(AnlzTag::TinyWaveform(entries))
            }
        }
        PWV3_TAG => {
            r.skip(4)?;
            let len = r.u32_be()? as usize;
            r.skip(4)?; // format marker
            Ok(AnlzTag::BigWaveform(r.take(len)?.to_vec()))
        }
        PWV4_TAG | PWV5_TAG => {
            let entry_bytes = r.u32_be()? as usize;
            let entry_count = r.u32_be()? as usize;
            r.skip(4)?;
            let want = entry_bytes.saturating_mul(entry_count);
            let data = if want > 0 && want <= r.remaining() {
                r.take(want)?.to_vec()
            } else {
                r.take(r.remaining())?.to_vec()
            };
            if tag == PWV4_TAG {
                Ok(AnlzTag::ColorPreviewWaveform(data))
            } else {
                Ok(AnlzTag::ColorWaveform(data))
            }
        }
        PCOB_TAG => {
            r.skip(4)?; // list kind: memory or hotcue
            let count = r.u32_be()? as usize;
            r.skip(4)?; // memory count
            let mut cues = Vec::with_capacity(count);
            for _ in 0..count {
                cues.push(parse_cue(&mut r, payload)?);
            }
            Ok(AnlzTag::CueList(cues))
        }
        PCO2_TAG => {
            r.skip(4)?; // list kind
            let count = r.u16_be()? as usize;
            r.skip(2)?;
            let mut cues = Vec::with_capacity(count);
            for _ in 0..count {
                cues.push(parse_cue2(&mut r, payload)?);
            }
            Ok(AnlzTag::ExtendedCueList(cues))
        }
        _ => Ok(AnlzTag::Unknown {
            tag: *tag,
            payload: payload.to_vec(),
        }),
    }
}

fn parse_cue(r: &mut ByteReader<'_>, payload: &[u8]) -> Result<CuePoint> {
    let entry_start = r.position();
    if r.take(4)? != b"PCPT" {
        return Err(Error::BadMagic { what: "cue entry" });
    }
    r.skip(4)?; // head size
    let tag_size = r.u32_be()? as usize;
    let hotcue_number = r.u32_be()?;
    let enabled = r.u32_be()? == 4;
    r.skip(4)?;
    let order_first = r.u16_be()?;
    let order_last = r.u16_be()?;
    let kind = match r.u8()? {
        2 => CueKind::Loop,
        _ => CueKind::Single,
    };
    r.skip(3)?;
    let time_ms = r.u32_be()?;
    let time_end_ms = r.u32_be()?;
    seek_entry_end(r, payload, entry_start, tag_size)?;
    Ok(CuePoint {
        hotcue_number,
        kind,
        enabled,
        order_first,
        order_last,
        time_ms,
        time_end_ms,
    })
}

fn parse_cue2(r: &mut ByteReader<'_>, payload: &[u8]) -> Result<CuePoint> {
    let entry_start = r.position();
    if r.take(4)? != b"PCP2" {
        return Err(Error::BadMagic { what: "cue entry" });
    }
    r.skip(4)?; // head size
    let tag_size = r.u32_be()? as usize;
    let hotcue_number = r.u32_be()?;
    r.skip(4)?;
    let time_ms = r.u32_be()?;
    let time_end_ms = r.u32_be()?;
    seek_entry_end(r, payload, entry_start, tag_size)?;
    Ok(CuePoint {
        hotcue_number,
        kind: if time_end_ms != u32::MAX {
            CueKind::Loop
        } else {
            CueKind::Single
        },
        enabled: true,
        order_first: 0,
        order_last: 0,
        time_ms,
        time_end_ms,
    })
}

/// Cue entries are self-sized; later firmware appends fields.
fn seek_entry_end(
    r: &mut ByteReader<'_>,
    payload: &[u8],
    entry_start: usize,
    tag_size: usize,
) -> Result<()> {
    let end = entry_start + tag_size;
    if tag_size < 12 || end > payload.len() {
        return Err(Error::Analysis(format!(
            "cue entry with impossible size {}",
            tag_size
        )));
    }
    if end > r.position() {
        r.skip(end - r.position())?;
    }
    Ok(())
}

/// Tables gathered from a track's DAT/EXT pair. A missing table
/// degrades the dependent query to "not available" instead of failing
/// the whole load.
#[derive(Debug, Clone, Default)]
pub struct AnlzCollection {
    beatgrid: Option<Vec<GridBeat>>,
    cue_points: Option<Vec<CuePoint>>,
    preview_waveform: Option<Vec<u8>>,
    waveform: Option<Vec<u8>>,
    color_waveform: Option<Vec<u8>>,
    color_preview_waveform: Option<Vec<u8>>,
}

impl AnlzCollection {
    /// Collects beatgrid, cues and the preview waveform from a DAT file.
    pub fn load_dat(&mut self, data: &[u8]) -> Result<()> {
        let file = AnlzFile::parse(data)?;
        for tag in file.tags {
            match tag {
                AnlzTag::Beatgrid(beats) => self.beatgrid = Some(beats),
                AnlzTag::CueList(cues) => self.cue_points = Some(cues),
                AnlzTag::Waveform(entries) => self.preview_waveform = Some(entries),
                _ => {}
            }
        }
        Ok(())
    }

    /// Collects the detail and color waveforms from an EXT file.
    pub fn load_ext(&mut self, data: &[u8]) -> Result<()> {
        let file = AnlzFile::parse(data)?;
        for tag in file.tags {
            match tag {
                AnlzTag::BigWaveform(entries) => self.waveform = Some(entries),
                AnlzTag::ColorPreviewWaveform(entries) => {
                    self.color_preview_waveform = Some(entries)
                }
                AnlzTag::ColorWaveform(entries) => self.color_waveform = Some(entries),
                _ => {}
            }
        }
        Ok(())
    }

    pub fn beatgrid(&self) -> Option<&[GridBeat]> {
        self.beatgrid.as_deref()
    }

    pub fn cue_points(&self) -> Option<&[CuePoint]> {
        self.cue_points.as_deref()
    }

    pub fn preview_waveform(&self) -> Option<&[u8]> {
        self.preview_waveform.as_deref()
    }

    pub fn waveform(&self) -> Option<&[u8]> {
        self.waveform.as_deref()
    }

    pub fn color_waveform(&self) -> Option<&[u8]> {
        self.color_waveform.as_deref()
    }

    pub fn color_preview_waveform(&self) -> Option<&[u8]> {
        self.color_preview_waveform.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_tag(out: &mut Vec<u8>, tag: &[u8; 4], payload: &[u8]) {
        out.extend_from_slice(tag);
        out.extend_from_slice(&12u32.to_be_bytes());
        out.extend_from_slice(&(12 + payload.len() as u32).to_be_bytes());
        out.extend_from_slice(payload);
    }

    fn file_with_tags(build: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        let mut body = Vec::new();
        build(&mut body);
        let mut out = Vec::new();
        out.extend_from_slice(PMAI_TAG);
        out.extend_from_slice(&28u32.to_be_bytes());
        out.extend_from_slice(&(28 + body.len() as u32).to_be_bytes());
        out.extend_from_slice(&[0u8; 16]);
        out.extend_from_slice(&body);
        out
    }

    fn pqtz_payload(beats: &[(u16, u16, u32)]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&[0u8; 4]);
        payload.extend_from_slice(&0x80000u32.to_be_bytes());
        payload.extend_from_slice(&(beats.len() as u32).to_be_bytes());
        for (beat, bpm, time) in beats {
            payload.extend_from_slice(&beat.to_be_bytes());
            payload.extend_from_slice(&bpm.to_be_bytes());
            payload.extend_from_slice(&time.to_be_bytes());
        }
        payload
    }

    #[test]
    fn test_beatgrid_tag() {
        let data = file_with_tags(|body| {
            push_tag(
                body,
                PQTZ_TAG,
                &pqtz_payload(&[(1, 12800, 100), (2, 12800, 568)]),
            );
        });
        let file = AnlzFile::parse(&data).unwrap();
        assert_eq!(file.tags.len(), 1);
        match &file.tags[0] {
            AnlzTag::Beatgrid(beats) => {
                assert_eq!(beats.len(), 2);
                assert_eq!(beats[1].time_ms, 568);
                assert_eq!(beats[0].bpm(), 128.0);
            }
            other => panic!("unexpected tag {:?}", other),
        }
    }

    #[test]
    fn test_path_tag() {
        let path = "/PIONEER/USBANLZ/P000/00000001/ANLZ0000.DAT";
        let data = file_with_tags(|body| {
            let mut payload = Vec::new();
            let units: Vec<u8> = path.encode_utf16().flat_map(|u| u.to_be_bytes()).collect();
            payload.extend_from_slice(&(units.len() as u32 + 2).to_be_bytes());
            payload.extend_from_slice(&units);
            payload.extend_from_slice(&[0, 0]);
            push_tag(body, PPTH_TAG, &payload);
        });
        let file = AnlzFile::parse(&data).unwrap();
        assert_eq!(file.tags[0], AnlzTag::Path(path.into()));
    }

    #[test]
    fn test_waveform_tag() {
        let data = file_with_tags(|body| {
            let mut payload = Vec::new();
            payload.extend_from_slice(&4u32.to_be_bytes());
            payload.extend_from_slice(&0x10000u32.to_be_bytes());
            payload.extend_from_slice(&[0x1f, 0x3f, 0x7f, 0xff]);
            push_tag(body, PWAV_TAG, &payload);
        });
        let file = AnlzFile::parse(&data).unwrap();
        assert_eq!(
            file.tags[0],
            AnlzTag::Waveform(vec![0x1f, 0x3f, 0x7f, 0xff])
        );
    }

    #[test]
    fn test_unknown_tag_skipped_by_size() {
        let data = file_with_tags(|body| {
            push_tag(body, b"PXXX", &[1, 2, 3, 4, 5]);
            let mut payload = Vec::new();
            payload.extend_from_slice(&1u32.to_be_bytes());
            payload.extend_from_slice(&0x10000u32.to_be_bytes());
            payload.push(0x0a);
            push_tag(body, PWAV_TAG, &payload);
        });
        let file = AnlzFile::parse(&data).unwrap();
        assert_eq!(file.tags.len(), 2);
        assert!(matches!(file.tags[0], AnlzTag::Unknown { .. }));
        assert!(matches!(file.tags[1], AnlzTag::Waveform(_)));
    }

    #[test]
    fn test_cue_list() {
        let data = file_with_tags(|body| {
            let mut payload = Vec::new();
            payload.extend_from_slice(&0u32.to_be_bytes()); // memory list
            payload.extend_from_slice(&1u32.to_be_bytes());
            payload.extend_from_slice(&1u32.to_be_bytes());
            // one PCPT entry, 56 bytes
            payload.extend_from_slice(b"PCPT");
            payload.extend_from_slice(&28u32.to_be_bytes());
            payload.extend_from_slice(&56u32.to_be_bytes());
            payload.extend_from_slice(&0u32.to_be_bytes()); // memory cue
            payload.extend_from_slice(&4u32.to_be_bytes()); // enabled
            payload.extend_from_slice(&0x10000u32.to_be_bytes());
            payload.extend_from_slice(&0xffffu16.to_be_bytes());
            payload.extend_from_slice(&1u16.to_be_bytes());
            payload.push(1); // single
            payload.extend_from_slice(&[0, 0x03, 0xe8]);
            payload.extend_from_slice(&5000u32.to_be_bytes());
            payload.extend_from_slice(&u32::MAX.to_be_bytes());
            payload.extend_from_slice(&[0u8; 16]);
            push_tag(body, PCOB_TAG, &payload);
        });
        let file = AnlzFile::parse(&data).unwrap();
        match &file.tags[0] {
            AnlzTag::CueList(cues) => {
                assert_eq!(cues.len(), 1);
                assert_eq!(cues[0].time_ms, 5000);
                assert_eq!(cues[0].kind, CueKind::Single);
                assert!(cues[0].enabled);
            }
            other => panic!("unexpected tag {:?}", other),
        }
    }

    #[test]
    fn test_collection_degrades_missing_tables() {
        let dat = file_with_tags(|body| {
            push_tag(body, PQTZ_TAG, &pqtz_payload(&[(1, 12800, 100)]));
        });
        let mut collection = AnlzCollection::default();
        collection.load_dat(&dat).unwrap();
        assert!(collection.beatgrid().is_some());
        assert!(collection.waveform().is_none());
        assert!(collection.preview_waveform().is_none());
    }

    #[test]
    fn test_bad_magic() {
        assert!(AnlzFile::parse(b"QMAI\x00\x00\x00\x1c\x00\x00\x00\x1c").is_err());
    }
}
