//! Row parsers for the exported database, one per page kind.
//!
//! All rows are little-endian. Most carry a small fixed header followed
//! by DeviceSQL strings, either inline or addressed through per-row
//! offsets relative to the row start. Raw exports are sometimes
//! internally inconsistent, so id lookups elsewhere tolerate dangling
//! references.

use serde::{Deserialize, Serialize};

use super::string::read_string;
use crate::error::{Error, Result};

pub const TRACK_ROW_MAGIC: u16 = 0x24;
pub const ARTIST_ROW_MAGIC: u16 = 0x60;
/// Artist rows with wide string offsets.
pub const LONG_ARTIST_ROW_MAGIC: u16 = 0x64;
pub const ALBUM_ROW_MAGIC: u16 = 0x80;

struct RowReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> RowReader<'a> {
    fn new(data: &'a [u8], start: usize) -> Self {
        Self { data, pos: start }
    }

    fn u8(&mut self) -> Result<u8> {
        let v = *self.data.get(self.pos).ok_or(Error::Truncated {
            offset: self.pos,
            needed: 1,
        })?;
        self.pos += 1;
        Ok(v)
    }

    fn u16(&mut self) -> Result<u16> {
        let raw = self
            .data
            .get(self.pos..self.pos + 2)
            .ok_or(Error::Truncated {
                offset: self.pos,
                needed: 2,
            })?;
        self.pos += 2;
        Ok(u16::from_le_bytes([raw[0], raw[1]]))
    }

    fn u32(&mut self) -> Result<u32> {
        let raw = self
            .data
            .get(self.pos..self.pos + 4)
            .ok_or(Error::Truncated {
                offset: self.pos,
                needed: 4,
            })?;
        self.pos += 4;
        Ok(u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]))
    }

    fn skip(&mut self, n: usize) {
        self.pos += n;
    }

    /// Inline DeviceSQL string at the current position.
    fn string(&mut self) -> Result<String> {
        let (text, end) = read_string(self.data, self.pos)?;
        self.pos = end;
        Ok(text)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackRow {
    /// Byte offset of this row within its page.
    pub entry_start: usize,
    pub id: u32,
    pub artist_id: u32,
    pub album_id: u32,
    pub genre_id: u32,
    pub artwork_id: u32,
    pub key_id: u32,
    pub original_artist_id: u32,
    pub label_id: u32,
    pub remixer_id: u32,
    pub composer_id: u32,
    pub color_id: u8,
    pub rating: u8,
    pub sample_rate: u32,
    pub sample_depth: u16,
    pub bitrate: u32,
    pub file_size: u32,
    pub track_number: u32,
    pub disc_number: u16,
    pub play_count: u16,
    pub year: u16,
    pub bpm_100: u32,
    pub duration_seconds: u16,
    pub title: String,
    pub comment: String,
    pub date_added: String,
    pub release_date: String,
    pub mix_name: String,
    pub analyze_path: String,
    pub analyze_date: String,
    pub filename: String,
    pub path: String,
}

impl TrackRow {
    pub fn parse(page: &[u8], entry_start: usize) -> Result<Self> {
        let mut r = RowReader::new(page, entry_start);
        let magic = r.u16()?;
        if magic != TRACK_ROW_MAGIC {
            return Err(Error::BadMagic { what: "track row" });
        }
        r.u16()?; // index shift
        r.u32()?; // bitmask
        let sample_rate = r.u32()?;
        let composer_id = r.u32()?;
        let file_size = r.u32()?;
        r.u32()?; // unknown id
        r.u16()?;
        r.u16()?;
        let artwork_id = r.u32()?;
        let key_id = r.u32()?;
        let original_artist_id = r.u32()?;
        let label_id = r.u32()?;
        let remixer_id = r.u32()?;
        let bitrate = r.u32()?;
        let track_number = r.u32()?;
        let bpm_100 = r.u32()?;
        let genre_id = r.u32()?;
        let album_id = r.u32()?;
        let artist_id = r.u32()?;
        let id = r.u32()?;
        let disc_number = r.u16()?;
        let play_count = r.u16()?;
        let year = r.u16()?;
        let sample_depth = r.u16()?;
        let duration_seconds = r.u16()?;
        r.u16()?;
        let color_id = r.u8()?;
        let rating = r.u8()?;
        r.skip(4); // two leading offset-table entries, unused

        // 21 string offsets relative to the row start
        let mut offsets = [0u16; 21];
        for slot in offsets.iter_mut() {
            *slot = r.u16()?;
        }
        let string_at = |index: usize| -> Result<String> {
            read_string(page, entry_start + offsets[index] as usize).map(|(text, _)| text)
        };

        Ok(TrackRow {
            entry_start,
            id,
            artist_id,
            album_id,
            genre_id,
            artwork_id,
            key_id,
            original_artist_id,
            label_id,
            remixer_id,
            composer_id,
            color_id,
            rating,
            sample_rate,
            sample_depth,
            bitrate,
            file_size,
            track_number,
            disc_number,
            play_count,
            year,
            bpm_100,
            duration_seconds,
            date_added: string_at(10)?,
            release_date: string_at(11)?,
            mix_name: string_at(12)?,
            analyze_path: string_at(14)?,
            analyze_date: string_at(15)?,
            comment: string_at(16)?,
            title: string_at(17)?,
            filename: string_at(19)?,
            path: string_at(20)?,
        })
    }

    pub fn bpm(&self) -> f64 {
        self.bpm_100 as f64 / 100.0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtistRow {
    pub entry_start: usize,
    pub id: u32,
    pub name: String,
}

impl ArtistRow {
    pub fn parse(page: &[u8], entry_start: usize) -> Result<Self> {
        let mut r = RowReader::new(page, entry_start);
        let magic = r.u16()?;
        if magic != ARTIST_ROW_MAGIC && magic != LONG_ARTIST_ROW_MAGIC {
            return Err(Error::BadMagic { what: "artist row" });
        }
        r.u16()?; // index shift
        let id = r.u32()?;
        let name_idx = if magic == LONG_ARTIST_ROW_MAGIC {
            r.u16()?; // unknown, usually 0x03
            r.u16()?
        } else {
            r.u8()?; // unknown, usually 0x03
            r.u8()? as u16
        };
        let (name, _) = read_string(page, entry_start + name_idx as usize)?;
        Ok(ArtistRow {
            entry_start,
            id,
            name,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlbumRow {
    pub id: u32,
    pub album_artist_id: u32,
    pub name: String,
}

impl AlbumRow {
    pub fn parse(page: &[u8], entry_start: usize) -> Result<Self> {
        let mut r = RowReader::new(page, entry_start);
        let magic = r.u16()?;
        if magic != ALBUM_ROW_MAGIC {
            return Err(Error::BadMagic { what: "album row" });
        }
        r.u16()?; // index shift
        r.u32()?;
        let album_artist_id = r.u32()?;
        let id = r.u32()?;
        r.u32()?;
        r.u16()?; // string form marker
        let name = r.string()?;
        Ok(AlbumRow {
            id,
            album_artist_id,
            name,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistRow {
    /// Parent folder id, 0 at the root.
    pub folder_id: u32,
    pub sort_order: u32,
    pub id: u32,
    pub is_folder: bool,
    pub name: String,
}

impl PlaylistRow {
    pub fn parse(page: &[u8], entry_start: usize) -> Result<Self> {
        let mut r = RowReader::new(page, entry_start);
        let folder_id = r.u32()?;
        r.u32()?;
        let sort_order = r.u32()?;
        let id = r.u32()?;
        let is_folder = r.u32()? != 0;
        let name = r.string()?;
        Ok(PlaylistRow {
            folder_id,
            sort_order,
            id,
            is_folder,
            name,
        })
    }
}

/// One playlist membership row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlaylistEntryRow {
    pub entry_index: u32,
    pub track_id: u32,
    pub playlist_id: u32,
}

impl PlaylistEntryRow {
    pub fn parse(page: &[u8], entry_start: usize) -> Result<Self> {
        let mut r = RowReader::new(page, entry_start);
        Ok(PlaylistEntryRow {
            entry_index: r.u32()?,
            track_id: r.u32()?,
            playlist_id: r.u32()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArtworkRow {
    pub id: u32,
    pub path: String,
}

impl ArtworkRow {
    pub fn parse(page: &[u8], entry_start: usize) -> Result<Self> {
        let mut r = RowReader::new(page, entry_start);
        let id = r.u32()?;
        let path = r.string()?;
        Ok(ArtworkRow { id, path })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColorRow {
    pub id: u8,
    pub name: String,
}

impl ColorRow {
    pub fn parse(page: &[u8], entry_start: usize) -> Result<Self> {
        let mut r = RowReader::new(page, entry_start);
        r.u32()?;
        r.u8()?; // duplicate id on some exports
        let id = r.u8()?;
        r.u16()?;
        let name = r.string()?;
        Ok(ColorRow { id, name })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenreRow {
    pub id: u32,
    pub name: String,
}

impl GenreRow {
    pub fn parse(page: &[u8], entry_start: usize) -> Result<Self> {
        let mut r = RowReader::new(page, entry_start);
        let id = r.u32()?;
        let name = r.string()?;
        Ok(GenreRow { id, name })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRow {
    pub id: u32,
    pub name: String,
}

impl KeyRow {
    pub fn parse(page: &[u8], entry_start: usize) -> Result<Self> {
        let mut r = RowReader::new(page, entry_start);
        let id = r.u32()?;
        r.u32()?; // duplicate of id
        let name = r.string()?;
        Ok(KeyRow { id, name })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LabelRow {
    pub id: u32,
    pub name: String,
}

impl LabelRow {
    pub fn parse(page: &[u8], entry_start: usize) -> Result<Self> {
        let mut r = RowReader::new(page, entry_start);
        let id = r.u32()?;
        let name = r.string()?;
        Ok(LabelRow { id, name })
    }
}
