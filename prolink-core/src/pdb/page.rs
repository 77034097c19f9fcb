//! Page structure of the exported database.
//!
//! Pages are 4096 bytes: a fixed header, a heap growing forward from
//! offset 0x28 and a reverse index growing backward from the page end.
//! The reverse index is made of blocks covering 16 rows each: the row
//! offsets, a presence bitmap and an override bitmap. Rows can be
//! individually disabled without rewriting the page, which is why the
//! bitmaps exist.

use std::io::Cursor;

use binrw::{binrw, BinRead};
use tracing::debug;

use super::row::{
    AlbumRow, ArtistRow, ArtworkRow, ColorRow, GenreRow, KeyRow, LabelRow, PlaylistEntryRow,
    PlaylistRow, TrackRow,
};
use crate::error::{Error, Result};

pub const PAGE_SIZE: usize = 4096;

/// Offset where heap data begins.
pub const HEAP_START: usize = 0x28;

/// Rows covered by one reverse index block.
const ROWS_PER_BLOCK: usize = 16;

/// Size of a full reverse index block: 16 offsets plus two bitmaps.
const FULL_BLOCK_SIZE: usize = ROWS_PER_BLOCK * 2 + 4;

/// The entry-count-large value that marks the field as unset.
const ENTRY_COUNT_UNSET: u16 = 8191;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Tracks,
    Genres,
    Artists,
    Albums,
    Labels,
    Keys,
    Colors,
    PlaylistTree,
    PlaylistEntries,
    Artwork,
    Columns,
    History,
}

impl PageType {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(PageType::Tracks),
            1 => Some(PageType::Genres),
            2 => Some(PageType::Artists),
            3 => Some(PageType::Albums),
            4 => Some(PageType::Labels),
            5 => Some(PageType::Keys),
            6 => Some(PageType::Colors),
            7 => Some(PageType::PlaylistTree),
            8 => Some(PageType::PlaylistEntries),
            13 => Some(PageType::Artwork),
            16 => Some(PageType::Columns),
            19 => Some(PageType::History),
            _ => None,
        }
    }
}

#[binrw]
#[brw(little)]
#[allow(dead_code)]
pub struct PageHeader {
    #[brw(pad_before = 4)]
    pub index: u32,
    pub page_type_raw: u32,
    /// Next page of the same table; eventually points past the file.
    pub next_index: u32,
    #[brw(pad_after = 4)]
    pub sequence: u32,
    pub entry_count_small: u8,
    pub u3: u8,
    pub u4: u8,
    pub page_flags: u8,
    pub free_size: u16,
    pub payload_size: u16,
    /// Rows overriding entries of earlier blocks; 8191 when unset.
    pub overridden_entries: u16,
    pub entry_count_large: u16,
    pub u9: u16,
    pub u10: u16,
}

impl PageHeader {
    /// Index pages interleaved with the data pages; they carry no rows.
    pub fn is_strange_page(&self) -> bool {
        self.index != 0 && self.page_flags & 0x40 != 0
    }

    pub fn is_empty_page(&self) -> bool {
        self.index == 0 && self.u9 == 0
    }

    /// Chooses between the small and large entry count fields.
    ///
    /// Artwork and playlist-entry pages hold more rows than the small
    /// field can express, so the large field wins when it is larger --
    /// unless it carries the unset marker or the page is one of the
    /// non-data kinds. This is a compatibility heuristic for exports of
    /// varying rekordbox versions, not a format guarantee.
    pub fn entry_count(&self) -> usize {
        let small = self.entry_count_small as usize;
        let large = self.entry_count_large as usize;
        if small < large
            && !self.is_strange_page()
            && !self.is_empty_page()
            && self.entry_count_large != ENTRY_COUNT_UNSET
        {
            large
        } else {
            small
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Row {
    Track(TrackRow),
    Artist(ArtistRow),
    Album(AlbumRow),
    Playlist(PlaylistRow),
    PlaylistEntry(PlaylistEntryRow),
    Artwork(ArtworkRow),
    Color(ColorRow),
    Genre(GenreRow),
    Key(KeyRow),
    Label(LabelRow),
}

pub struct ParsedPage {
    pub page_type: PageType,
    pub index: u32,
    pub rows: Vec<Row>,
}

/// One reverse index block, read backward from the page end.
struct IndexBlock {
    offsets: Vec<u16>,
    enabled: u16,
    /// Preserved but not interpreted.
    #[allow(dead_code)]
    enabled_override: u16,
}

fn read_index_blocks(page: &[u8], entry_count: usize) -> Result<Vec<IndexBlock>> {
    let mut blocks = Vec::new();
    let mut block_index = 0;
    let mut remaining = entry_count;
    while remaining > 0 {
        let count = remaining.min(ROWS_PER_BLOCK);
        let block_end = PAGE_SIZE - block_index * FULL_BLOCK_SIZE;
        let start = block_end
            .checked_sub(4 + 2 * count)
            .ok_or(Error::Database("reverse index outgrew page".into()))?;
        if start < HEAP_START {
            return Err(Error::Database("reverse index outgrew page".into()));
        }
        let mut offsets = Vec::with_capacity(count);
        for i in 0..count {
            let at = start + 2 * i;
            offsets.push(u16::from_le_bytes([page[at], page[at + 1]]));
        }
        let enabled = u16::from_le_bytes([page[block_end - 4], page[block_end - 3]]);
        let enabled_override = u16::from_le_bytes([page[block_end - 2], page[block_end - 1]]);
        blocks.push(IndexBlock {
            offsets,
            enabled,
            enabled_override,
        });
        remaining -= count;
        block_index += 1;
    }
    Ok(blocks)
}

fn parse_row(page_type: PageType, page: &[u8], entry_start: usize) -> Result<Option<Row>> {
    let row = match page_type {
        PageType::Tracks => Row::Track(TrackRow::parse(page, entry_start)?),
        PageType::Artists => Row::Artist(ArtistRow::parse(page, entry_start)?),
        PageType::Albums => Row::Album(AlbumRow::parse(page, entry_start)?),
        PageType::PlaylistTree => Row::Playlist(PlaylistRow::parse(page, entry_start)?),
        PageType::PlaylistEntries => {
            Row::PlaylistEntry(PlaylistEntryRow::parse(page, entry_start)?)
        }
        PageType::Artwork => Row::Artwork(ArtworkRow::parse(page, entry_start)?),
        PageType::Colors => Row::Color(ColorRow::parse(page, entry_start)?),
        PageType::Genres => Row::Genre(GenreRow::parse(page, entry_start)?),
        PageType::Keys => Row::Key(KeyRow::parse(page, entry_start)?),
        PageType::Labels => Row::Label(LabelRow::parse(page, entry_start)?),
        PageType::Columns | PageType::History => return Ok(None),
    };
    Ok(Some(row))
}

/// Parses one 4096-byte page into its enabled rows. Rows that fail to
/// parse are skipped individually; whole-page problems are errors the
/// caller may choose to skip.
pub fn parse_page(page: &[u8]) -> Result<Option<ParsedPage>> {
    if page.len() != PAGE_SIZE {
        return Err(Error::Database(format!(
            "page has {} bytes instead of {}",
            page.len(),
            PAGE_SIZE
        )));
    }
    let header = PageHeader::read(&mut Cursor::new(page))?;
    let page_type = match PageType::from_raw(header.page_type_raw) {
        Some(t) => t,
        None => return Ok(None),
    };
    if header.is_strange_page() || header.is_empty_page() {
        return Ok(None);
    }

    let entry_count = header.entry_count();
    let blocks = read_index_blocks(page, entry_count)?;

    let mut rows = Vec::with_capacity(entry_count);
    for block in &blocks {
        // rows are indexed in reverse order within a block
        for (i, &offset) in block.offsets.iter().enumerate().rev() {
            if block.enabled & (1 << i) == 0 {
                continue;
            }
            let entry_start = HEAP_START + offset as usize;
            if entry_start >= PAGE_SIZE {
                debug!(offset, "row offset outside page, skipping");
                continue;
            }
            match parse_row(page_type, page, entry_start) {
                Ok(Some(row)) => rows.push(row),
                Ok(None) => {}
                Err(e) => debug!(?page_type, entry_start, error = %e, "skipping unparsable row"),
            }
        }
    }

    Ok(Some(ParsedPage {
        page_type,
        index: header.index,
        rows,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a page carrying artist rows, mirroring how rekordbox lays
    /// out the heap and the reverse index.
    fn build_artist_page(names: &[&str], disabled: &[usize]) -> Vec<u8> {
        let mut page = vec![0u8; PAGE_SIZE];
        page[4..8].copy_from_slice(&165u32.to_le_bytes()); // index
        page[8..12].copy_from_slice(&2u32.to_le_bytes()); // artists
        page[24] = names.len() as u8; // entry_count_small
        page[27] = 0x24; // page flags
        page[34..36].copy_from_slice(&ENTRY_COUNT_UNSET.to_le_bytes());

        let mut heap_pos = HEAP_START;
        let mut offsets = Vec::new();
        for name in names {
            offsets.push((heap_pos - HEAP_START) as u16);
            let row_start = heap_pos;
            page[row_start..row_start + 2].copy_from_slice(&0x60u16.to_le_bytes());
            page[row_start + 2..row_start + 4].copy_from_slice(&0u16.to_le_bytes());
            page[row_start + 4..row_start + 8]
                .copy_from_slice(&(700 + offsets.len() as u32).to_le_bytes());
            page[row_start + 8] = 0x03;
            page[row_start + 9] = 10; // name offset
            let header = ((name.len() as u8 + 1) << 1) | 1;
            page[row_start + 10] = header;
            page[row_start + 11..row_start + 11 + name.len()]
                .copy_from_slice(name.as_bytes());
            heap_pos = row_start + 11 + name.len();
        }

        let count = names.len();
        let block_end = PAGE_SIZE;
        let start = block_end - 4 - 2 * count;
        for (i, offset) in offsets.iter().enumerate() {
            page[start + 2 * i..start + 2 * i + 2].copy_from_slice(&offset.to_le_bytes());
        }
        let mut enabled: u16 = (1u32 << count).wrapping_sub(1) as u16;
        for &d in disabled {
            enabled &= !(1 << d);
        }
        page[block_end - 4..block_end - 2].copy_from_slice(&enabled.to_le_bytes());
        page[block_end - 2..block_end].copy_from_slice(&0u16.to_le_bytes());
        page
    }

    #[test]
    fn test_artist_page_parsing() {
        let page = build_artist_page(&["Gerwin", "LaMeduza", "Airstrike"], &[]);
        let parsed = parse_page(&page).unwrap().unwrap();
        assert_eq!(parsed.page_type, PageType::Artists);
        assert_eq!(parsed.index, 165);
        assert_eq!(parsed.rows.len(), 3);
        let names: Vec<_> = parsed
            .rows
            .iter()
            .map(|r| match r {
                Row::Artist(a) => a.name.clone(),
                _ => unreachable!(),
            })
            .collect();
        // rows come out in reverse index order
        assert!(names.contains(&"Gerwin".to_string()));
        assert!(names.contains(&"Airstrike".to_string()));
    }

    #[test]
    fn test_disabled_rows_skipped() {
        let page = build_artist_page(&["One", "Two", "Three"], &[1]);
        let parsed = parse_page(&page).unwrap().unwrap();
        assert_eq!(parsed.rows.len(), 2);
        for row in &parsed.rows {
            match row {
                Row::Artist(a) => assert_ne!(a.name, "Two"),
                _ => unreachable!(),
            }
        }
    }

    #[test]
    fn test_entry_count_heuristic() {
        let mut header = PageHeader {
            index: 1,
            page_type_raw: 13,
            next_index: 2,
            sequence: 1,
            entry_count_small: 3,
            u3: 0,
            u4: 0,
            page_flags: 0x24,
            free_size: 0,
            payload_size: 0,
            overridden_entries: 0,
            entry_count_large: 40,
            u9: 0,
            u10: 0,
        };
        assert_eq!(header.entry_count(), 40);
        header.entry_count_large = ENTRY_COUNT_UNSET;
        assert_eq!(header.entry_count(), 3);
        header.entry_count_large = 40;
        header.page_flags = 0x64; // strange page
        assert_eq!(header.entry_count(), 3);
    }

    #[test]
    fn test_unknown_page_type_skipped() {
        let mut page = vec![0u8; PAGE_SIZE];
        page[4..8].copy_from_slice(&5u32.to_le_bytes());
        page[8..12].copy_from_slice(&11u32.to_le_bytes()); // unknown kind
        assert!(parse_page(&page).unwrap().is_none());
    }

    #[test]
    fn test_short_page_rejected() {
        assert!(parse_page(&[0u8; 100]).is_err());
    }
}
