//! Query model shared by the live-db and file-backed providers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use prolink_core::GridBeat;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackColor {
    Pink,
    Red,
    Orange,
    Yellow,
    Green,
    Aqua,
    Blue,
    Purple,
}

impl TrackColor {
    pub fn from_id(id: u8) -> Option<Self> {
        match id {
            1 => Some(TrackColor::Pink),
            2 => Some(TrackColor::Red),
            3 => Some(TrackColor::Orange),
            4 => Some(TrackColor::Yellow),
            5 => Some(TrackColor::Green),
            6 => Some(TrackColor::Aqua),
            7 => Some(TrackColor::Blue),
            8 => Some(TrackColor::Purple),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TrackColor::Pink => "pink",
            TrackColor::Red => "red",
            TrackColor::Orange => "orange",
            TrackColor::Yellow => "yellow",
            TrackColor::Green => "green",
            TrackColor::Aqua => "aqua",
            TrackColor::Blue => "blue",
            TrackColor::Purple => "purple",
        }
    }
}

/// Column sort selector for title lists; maps to the sort id the db
/// protocol expects, and to the second column rendered next to the
/// title.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortMode {
    Default,
    Title,
    Artist,
    Album,
    Bpm,
    Rating,
    Genre,
    Comment,
    Duration,
    Remixer,
    Label,
    OriginalArtist,
    Key,
    Bitrate,
    PlayCount,
}

impl SortMode {
    pub fn sort_id(self) -> u32 {
        match self {
            SortMode::Default => 0x00,
            SortMode::Title => 0x01,
            SortMode::Artist => 0x02,
            SortMode::Album => 0x03,
            SortMode::Bpm => 0x04,
            SortMode::Rating => 0x05,
            SortMode::Genre => 0x06,
            SortMode::Comment => 0x07,
            SortMode::Duration => 0x08,
            SortMode::Remixer => 0x09,
            SortMode::Label => 0x0a,
            SortMode::OriginalArtist => 0x0b,
            SortMode::Key => 0x0c,
            SortMode::Bitrate => 0x0d,
            SortMode::PlayCount => 0x10,
        }
    }
}

/// Track metadata assembled from a metadata query or the exported
/// database. Unknown fields stay at their defaults.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrackMetadata {
    pub track_id: u32,
    pub title: String,
    pub artist_id: u32,
    pub artist: String,
    pub album_id: u32,
    pub album: String,
    pub genre_id: u32,
    pub genre: String,
    pub key_id: u32,
    pub key: String,
    pub label: String,
    pub original_artist: String,
    pub remixer: String,
    pub comment: String,
    pub date_added: String,
    pub color: Option<TrackColor>,
    pub color_text: String,
    /// Seconds.
    pub duration: u32,
    pub rating: u32,
    pub play_count: u32,
    pub bitrate: u32,
    pub year: u32,
    pub artwork_id: u32,
    pub bpm: Option<f64>,
}

/// One column of a rendered browse row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MenuColumn {
    Title {
        text: String,
        track_id: u32,
        artist_id: u32,
        artwork_id: u32,
    },
    Artist { name: String, id: u32 },
    Album { name: String, id: u32 },
    Genre { name: String, id: u32 },
    Label { name: String, id: u32 },
    Key { name: String, id: u32 },
    OriginalArtist { name: String, id: u32 },
    Remixer { name: String, id: u32 },
    Folder { name: String, id: u32 },
    Playlist { name: String, id: u32, parent_id: u32 },
    /// Category rows of the root menu.
    MenuName { name: String, menu_id: u32 },
    Color { color: Option<TrackColor>, text: String },
    Comment(String),
    DateAdded(String),
    MountPath(String),
    All(String),
    Duration(u32),
    Rating(u32),
    Disc(u32),
    PlayCount(u32),
    Bitrate(u32),
    Year(u32),
    Bpm(f64),
}

/// One rendered browse row; composite "title and x" items decompose
/// into two columns.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct BrowseRow(pub Vec<MenuColumn>);

impl BrowseRow {
    pub fn single(column: MenuColumn) -> Self {
        BrowseRow(vec![column])
    }
}

/// Reply to a mount info query; the path feeds the NFS downloader.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct MountInfo {
    pub track_id: u32,
    pub duration: u32,
    pub bpm: Option<f64>,
    pub mount_path: String,
}

/// One query addressed to a (player, slot), resolved by whichever data
/// source succeeds first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Metadata { track_id: u32 },
    RootMenu,
    Titles { sort: SortMode },
    TitlesByAlbum { sort: SortMode, album_id: u32 },
    TitlesByArtistAlbum { sort: SortMode, artist_id: u32, album_id: u32 },
    TitlesByGenreArtistAlbum {
        sort: SortMode,
        genre_id: u32,
        artist_id: u32,
        album_id: u32,
    },
    Artists,
    ArtistsByGenre { genre_id: u32 },
    Albums,
    AlbumsByArtist { artist_id: u32 },
    AlbumsByGenreArtist { genre_id: u32, artist_id: u32 },
    Genres,
    PlaylistFolder { folder_id: u32 },
    Playlist { sort: SortMode, playlist_id: u32 },
    Artwork { artwork_id: u32 },
    Waveform { track_id: u32 },
    PreviewWaveform { track_id: u32 },
    ColorWaveform { track_id: u32 },
    ColorPreviewWaveform { track_id: u32 },
    Beatgrid { track_id: u32 },
    MountInfo { track_id: u32 },
    TrackInfo { track_id: u32 },
}

impl QueryKind {
    /// Cache key id for kinds whose results are stored; browse lists
    /// are not cached.
    pub fn cache_id(&self) -> Option<u32> {
        match *self {
            QueryKind::Metadata { track_id }
            | QueryKind::Waveform { track_id }
            | QueryKind::PreviewWaveform { track_id }
            | QueryKind::ColorWaveform { track_id }
            | QueryKind::ColorPreviewWaveform { track_id }
            | QueryKind::Beatgrid { track_id } => Some(track_id),
            QueryKind::Artwork { artwork_id } => Some(artwork_id),
            _ => None,
        }
    }
}

/// A successful query result. `Unavailable` is an explicit "no data"
/// signal, distinct from failure.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    Metadata(TrackMetadata),
    Rows(Vec<BrowseRow>),
    Blob(Arc<Vec<u8>>),
    Beatgrid(Arc<Vec<GridBeat>>),
    MountInfo(MountInfo),
    Unavailable,
}

impl TrackMetadata {
    /// Folds one menu column into the metadata record.
    pub fn apply_column(&mut self, column: MenuColumn) {
        match column {
            MenuColumn::Title {
                text,
                track_id,
                artist_id,
                artwork_id,
            } => {
                self.title = text;
                self.track_id = track_id;
                self.artist_id = artist_id;
                self.artwork_id = artwork_id;
            }
            MenuColumn::Artist { name, id } => {
                self.artist = name;
                self.artist_id = id;
            }
            MenuColumn::Album { name, id } => {
                self.album = name;
                self.album_id = id;
            }
            MenuColumn::Genre { name, id } => {
                self.genre = name;
                self.genre_id = id;
            }
            MenuColumn::Label { name, .. } => self.label = name,
            MenuColumn::Key { name, id } => {
                self.key = name;
                self.key_id = id;
            }
            MenuColumn::OriginalArtist { name, .. } => self.original_artist = name,
            MenuColumn::Remixer { name, .. } => self.remixer = name,
            MenuColumn::Color { color, text } => {
                self.color = color;
                self.color_text = text;
            }
            MenuColumn::Comment(text) => self.comment = text,
            MenuColumn::DateAdded(text) => self.date_added = text,
            MenuColumn::Duration(v) => self.duration = v,
            MenuColumn::Rating(v) => self.rating = v,
            MenuColumn::PlayCount(v) => self.play_count = v,
            MenuColumn::Bitrate(v) => self.bitrate = v,
            MenuColumn::Year(v) => self.year = v,
            MenuColumn::Bpm(v) => self.bpm = Some(v),
            // rows without a place in track metadata
            MenuColumn::Folder { .. }
            | MenuColumn::Playlist { .. }
            | MenuColumn::MenuName { .. }
            | MenuColumn::MountPath(_)
            | MenuColumn::All(_)
            | MenuColumn::Disc(_) => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metadata_fold() {
        let mut md = TrackMetadata::default();
        md.apply_column(MenuColumn::Title {
            text: "Demo Track 1".into(),
            track_id: 1,
            artist_id: 9,
            artwork_id: 17,
        });
        md.apply_column(MenuColumn::Artist {
            name: "Loopmasters".into(),
            id: 9,
        });
        md.apply_column(MenuColumn::Bpm(128.0));
        assert_eq!(md.title, "Demo Track 1");
        assert_eq!(md.artist, "Loopmasters");
        assert_eq!(md.artwork_id, 17);
        assert_eq!(md.bpm, Some(128.0));
    }

    #[test]
    fn test_color_ids() {
        assert_eq!(TrackColor::from_id(0), None);
        assert_eq!(TrackColor::from_id(3), Some(TrackColor::Orange));
        assert_eq!(TrackColor::from_id(9), None);
    }
}
