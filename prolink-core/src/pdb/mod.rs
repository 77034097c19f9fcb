//! Reader for the exported database (`export.pdb`).
//!
//! The file is a little-endian paged database: one header page listing
//! per-table first/last page indices, then 4096-byte data pages. Some
//! observed files carry an inconsistent page linked list while being
//! physically consistent, so pages are walked in file order and
//! selected by their own type field instead of following the list.

pub mod page;
pub mod row;
pub mod string;

use std::io::Cursor;
use std::path::Path;

use binrw::{binrw, BinRead};
use memmap2::Mmap;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use page::{parse_page, Row, PAGE_SIZE};
use row::{
    AlbumRow, ArtistRow, ArtworkRow, ColorRow, GenreRow, KeyRow, LabelRow, PlaylistEntryRow,
    PlaylistRow, TrackRow,
};

#[binrw]
#[brw(little)]
#[allow(dead_code)]
struct FileHeader {
    #[brw(pad_before = 4)]
    page_size: u32,
    table_count: u32,
    next_unused_page: u32,
    unknown1: u32,
    #[brw(pad_after = 4)]
    sequence: u32,
}

#[binrw]
#[brw(little)]
#[allow(dead_code)]
struct TablePointer {
    page_type: u32,
    empty_candidate: u32,
    first_page: u32,
    last_page: u32,
}

/// All tables of one export, parsed into immutable in-memory rows.
#[derive(Debug, Default)]
pub struct PdbDatabase {
    pub tracks: Vec<TrackRow>,
    pub artists: Vec<ArtistRow>,
    pub albums: Vec<AlbumRow>,
    pub playlists: Vec<PlaylistRow>,
    pub playlist_entries: Vec<PlaylistEntryRow>,
    pub artwork: Vec<ArtworkRow>,
    pub colors: Vec<ColorRow>,
    pub genres: Vec<GenreRow>,
    pub keys: Vec<KeyRow>,
    pub labels: Vec<LabelRow>,
}

impl PdbDatabase {
    /// Memory-maps and parses an export file.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref())?;
        let mmap = unsafe { Mmap::map(&file)? };
        info!(path = %path.as_ref().display(), bytes = mmap.len(), "loading database");
        Self::parse(&mmap)
    }

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < PAGE_SIZE {
            return Err(Error::Database(format!(
                "file of {} bytes is smaller than one page",
                data.len()
            )));
        }
        if data.len() % PAGE_SIZE != 0 {
            return Err(Error::Database(format!(
                "file size {} is not a whole number of pages",
                data.len()
            )));
        }

        let header = FileHeader::read(&mut Cursor::new(data))?;
        if header.page_size != PAGE_SIZE as u32 {
            return Err(Error::Database(format!(
                "unsupported page size {}",
                header.page_size
            )));
        }
        // table pointers follow the fixed header; read for validation
        // only, pages are walked in file order below
        let mut cursor = Cursor::new(&data[28..]);
        for _ in 0..header.table_count.min(32) {
            let _ = TablePointer::read(&mut cursor)?;
        }

        let mut db = PdbDatabase::default();
        for page_index in 1..data.len() / PAGE_SIZE {
            let page = &data[page_index * PAGE_SIZE..(page_index + 1) * PAGE_SIZE];
            match parse_page(page) {
                Ok(Some(parsed)) => {
                    for parsed_row in parsed.rows {
                        db.insert(parsed_row);
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(page_index, error = %e, "skipping unparsable page");
                }
            }
        }

        debug!(
            tracks = db.tracks.len(),
            artists = db.artists.len(),
            playlists = db.playlists.len(),
            "database loaded"
        );
        Ok(db)
    }

    fn insert(&mut self, row: Row) {
        match row {
            Row::Track(r) => self.tracks.push(r),
            Row::Artist(r) => self.artists.push(r),
            Row::Album(r) => self.albums.push(r),
            Row::Playlist(r) => self.playlists.push(r),
            Row::PlaylistEntry(r) => self.playlist_entries.push(r),
            Row::Artwork(r) => self.artwork.push(r),
            Row::Color(r) => self.colors.push(r),
            Row::Genre(r) => self.genres.push(r),
            Row::Key(r) => self.keys.push(r),
            Row::Label(r) => self.labels.push(r),
        }
    }

    pub fn track(&self, id: u32) -> Option<&TrackRow> {
        self.tracks.iter().find(|t| t.id == id)
    }

    pub fn artist(&self, id: u32) -> Option<&ArtistRow> {
        self.artists.iter().find(|a| a.id == id)
    }

    pub fn album(&self, id: u32) -> Option<&AlbumRow> {
        self.albums.iter().find(|a| a.id == id)
    }

    pub fn genre(&self, id: u32) -> Option<&GenreRow> {
        self.genres.iter().find(|g| g.id == id)
    }

    pub fn key(&self, id: u32) -> Option<&KeyRow> {
        self.keys.iter().find(|k| k.id == id)
    }

    pub fn label(&self, id: u32) -> Option<&LabelRow> {
        self.labels.iter().find(|l| l.id == id)
    }

    pub fn color(&self, id: u8) -> Option<&ColorRow> {
        self.colors.iter().find(|c| c.id == id)
    }

    pub fn artwork(&self, id: u32) -> Option<&ArtworkRow> {
        self.artwork.iter().find(|a| a.id == id)
    }

    /// Playlists and folders directly under `folder_id`, in the
    /// user-defined sort order.
    pub fn playlists_in_folder(&self, folder_id: u32) -> Vec<&PlaylistRow> {
        let mut out: Vec<&PlaylistRow> = self
            .playlists
            .iter()
            .filter(|p| p.folder_id == folder_id)
            .collect();
        out.sort_by_key(|p| p.sort_order);
        out
    }

    /// Tracks of one playlist in playlist order. Dangling track ids are
    /// dropped rather than reported.
    pub fn playlist_tracks(&self, playlist_id: u32) -> Vec<&TrackRow> {
        let mut entries: Vec<&PlaylistEntryRow> = self
            .playlist_entries
            .iter()
            .filter(|e| e.playlist_id == playlist_id)
            .collect();
        entries.sort_by_key(|e| e.entry_index);
        entries
            .iter()
            .filter_map(|e| self.track(e.track_id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn empty_file(pages: usize) -> Vec<u8> {
        let mut data = vec![0u8; PAGE_SIZE * pages];
        data[4..8].copy_from_slice(&(PAGE_SIZE as u32).to_le_bytes());
        data[8..12].copy_from_slice(&0u32.to_le_bytes());
        data
    }

    #[test]
    fn test_empty_database() {
        let db = PdbDatabase::parse(&empty_file(1)).unwrap();
        assert!(db.tracks.is_empty());
        assert!(db.artists.is_empty());
    }

    #[test]
    fn test_rejects_truncated_file() {
        assert!(PdbDatabase::parse(&[0u8; 100]).is_err());
        let mut data = empty_file(2);
        data.truncate(PAGE_SIZE + 17);
        assert!(PdbDatabase::parse(&data).is_err());
    }

    #[test]
    fn test_rejects_wrong_page_size() {
        let mut data = empty_file(1);
        data[4..8].copy_from_slice(&512u32.to_le_bytes());
        assert!(PdbDatabase::parse(&data).is_err());
    }

    #[test]
    fn test_open_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.pdb");
        std::fs::write(&path, empty_file(1)).unwrap();
        let db = PdbDatabase::open(&path).unwrap();
        assert!(db.tracks.is_empty());
    }

    #[test]
    fn test_playlist_ordering() {
        let mut db = PdbDatabase::default();
        for (entry_index, track_id) in [(2u32, 20u32), (0, 10), (1, 30)] {
            db.playlist_entries.push(PlaylistEntryRow {
                entry_index,
                track_id,
                playlist_id: 5,
            });
        }
        for id in [10u32, 20, 30] {
            let mut track = blank_track();
            track.id = id;
            db.tracks.push(track);
        }
        let ordered: Vec<u32> = db.playlist_tracks(5).iter().map(|t| t.id).collect();
        assert_eq!(ordered, vec![10, 30, 20]);
    }

    fn blank_track() -> TrackRow {
        TrackRow {
            entry_start: 0,
            id: 0,
            artist_id: 0,
            album_id: 0,
            genre_id: 0,
            artwork_id: 0,
            key_id: 0,
            original_artist_id: 0,
            label_id: 0,
            remixer_id: 0,
            composer_id: 0,
            color_id: 0,
            rating: 0,
            sample_rate: 44100,
            sample_depth: 16,
            bitrate: 320,
            file_size: 0,
            track_number: 0,
            disc_number: 0,
            play_count: 0,
            year: 0,
            bpm_100: 12000,
            duration_seconds: 180,
            title: String::new(),
            comment: String::new(),
            date_added: String::new(),
            release_date: String::new(),
            mix_name: String::new(),
            analyze_path: String::new(),
            analyze_date: String::new(),
            filename: String::new(),
            path: String::new(),
        }
    }
}
