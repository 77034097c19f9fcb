//! Query provider backed by the players' exported files.
//!
//! The export database is downloaded once per (player, slot) and
//! queried in memory; per-track analysis pairs are pulled straight into
//! buffers. This is the cheap path the dispatcher tries before the live
//! database protocol. A failed download or parse marks the slot invalid
//! so later queries fail fast to the live path until the media changes.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use tracing::{debug, warn};

use prolink_core::anlz::AnlzCollection;
use prolink_core::packets::PlayerSlot;
use prolink_core::pdb::row::TrackRow;
use prolink_core::pdb::PdbDatabase;
use prolink_core::{DataStore, Error as CodecError};

use crate::error::{NetError, QueryError, QueryResult};
use crate::model::{
    BrowseRow, MenuColumn, MountInfo, QueryKind, QueryValue, SortMode, TrackColor, TrackMetadata,
};
use crate::nfs::NfsClient;
use crate::registry::{PlayerRegistry, TrackKey};

const EXPORT_PDB_PATH: &str = "/PIONEER/rekordbox/export.pdb";
/// Exports written on MacOS hide the vendor directory.
const EXPORT_PDB_PATH_ALT: &str = "/.PIONEER/rekordbox/export.pdb";

enum PdbState {
    Ready(PdbDatabase),
    Invalid(String),
}

pub struct PdbProvider {
    registry: Arc<Mutex<PlayerRegistry>>,
    nfs: NfsClient,
    database_dir: PathBuf,
    databases: DataStore<(u8, PlayerSlot), Arc<PdbState>>,
    analysis: DataStore<TrackKey, Arc<AnlzCollection>>,
}

impl PdbProvider {
    pub fn new(
        registry: Arc<Mutex<PlayerRegistry>>,
        nfs: NfsClient,
        database_dir: PathBuf,
    ) -> Self {
        PdbProvider {
            registry,
            nfs,
            database_dir,
            databases: DataStore::new(8),
            analysis: DataStore::new(32),
        }
    }

    pub fn invalidate_slot(&self, player_number: u8, slot: PlayerSlot) {
        self.databases.remove_player_slot(player_number, slot);
        self.analysis.remove_player_slot(player_number, slot);
    }

    pub async fn handle(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        kind: &QueryKind,
    ) -> QueryResult<QueryValue> {
        debug!(player_number, %slot, ?kind, "pdb query");
        match *kind {
            QueryKind::Metadata { track_id } => self.metadata(player_number, slot, track_id).await,
            QueryKind::RootMenu => Ok(QueryValue::Rows(root_menu())),
            QueryKind::Titles { sort } => {
                self.titles(player_number, slot, sort, &[]).await
            }
            QueryKind::TitlesByAlbum { sort, album_id } => {
                self.titles(player_number, slot, sort, &[album_id]).await
            }
            QueryKind::TitlesByArtistAlbum {
                sort,
                artist_id,
                album_id,
            } => {
                self.titles(player_number, slot, sort, &[artist_id, album_id])
                    .await
            }
            QueryKind::TitlesByGenreArtistAlbum {
                sort,
                genre_id,
                artist_id,
                album_id,
            } => {
                self.titles(player_number, slot, sort, &[genre_id, artist_id, album_id])
                    .await
            }
            QueryKind::Artists => self.artists(player_number, slot, None).await,
            QueryKind::ArtistsByGenre { genre_id } => {
                self.artists(player_number, slot, Some(genre_id)).await
            }
            QueryKind::Albums => self.albums(player_number, slot, &[]).await,
            QueryKind::AlbumsByArtist { artist_id } => {
                self.albums(player_number, slot, &[artist_id]).await
            }
            QueryKind::AlbumsByGenreArtist {
                genre_id,
                artist_id,
            } => {
                self.albums(player_number, slot, &[genre_id, artist_id])
                    .await
            }
            QueryKind::Genres => self.genres(player_number, slot).await,
            QueryKind::PlaylistFolder { folder_id } => {
                self.playlist_folder(player_number, slot, folder_id).await
            }
            QueryKind::Playlist { sort, playlist_id } => {
                self.playlist(player_number, slot, sort, playlist_id).await
            }
            QueryKind::Artwork { artwork_id } => {
                self.artwork(player_number, slot, artwork_id).await
            }
            QueryKind::Waveform { track_id } => {
                let analysis = self.analysis(player_number, slot, track_id).await?;
                Ok(opt_blob(analysis.waveform()))
            }
            QueryKind::PreviewWaveform { track_id } => {
                let analysis = self.analysis(player_number, slot, track_id).await?;
                // one byte per column spreads into (height, brightness)
                Ok(match analysis.preview_waveform() {
                    None => QueryValue::Unavailable,
                    Some(columns) => {
                        let mut spread = Vec::with_capacity(columns.len() * 2);
                        for &column in columns {
                            spread.push(column & 0x1f);
                            spread.push(column >> 5);
                        }
                        QueryValue::Blob(Arc::new(spread))
                    }
                })
            }
            QueryKind::ColorWaveform { track_id } => {
                let analysis = self.analysis(player_number, slot, track_id).await?;
                Ok(opt_blob(analysis.color_waveform()))
            }
            QueryKind::ColorPreviewWaveform { track_id } => {
                let analysis = self.analysis(player_number, slot, track_id).await?;
                Ok(opt_blob(analysis.color_preview_waveform()))
            }
            QueryKind::Beatgrid { track_id } => {
                let analysis = self.analysis(player_number, slot, track_id).await?;
                Ok(match analysis.beatgrid() {
                    None => QueryValue::Unavailable,
                    Some(beats) => QueryValue::Beatgrid(Arc::new(beats.to_vec())),
                })
            }
            QueryKind::MountInfo { track_id } => {
                self.mount_info(player_number, slot, track_id).await
            }
            QueryKind::TrackInfo { .. } => Err(QueryError::Fatal(
                "track info is only served by the live database".into(),
            )),
        }
    }

    fn player_ip(&self, player_number: u8) -> QueryResult<std::net::Ipv4Addr> {
        let registry = self.registry.lock().unwrap();
        registry
            .player(player_number)
            .map(|p| p.ip_addr)
            .ok_or_else(|| QueryError::Fatal(format!("player {} not in registry", player_number)))
    }

    async fn database(
        &self,
        player_number: u8,
        slot: PlayerSlot,
    ) -> QueryResult<Arc<PdbState>> {
        if let Some(state) = self.databases.get(&(player_number, slot)) {
            return Ok(state);
        }
        let state = match self.download_and_parse(player_number, slot).await {
            Ok(db) => Arc::new(PdbState::Ready(db)),
            Err(e) => {
                warn!(player_number, %slot, error = %e, "database unavailable");
                Arc::new(PdbState::Invalid(e.to_string()))
            }
        };
        self.databases.insert((player_number, slot), state.clone());
        Ok(state)
    }

    async fn ready_database(
        &self,
        player_number: u8,
        slot: PlayerSlot,
    ) -> QueryResult<Arc<PdbState>> {
        let state = self.database(player_number, slot).await?;
        if let PdbState::Invalid(reason) = &*state {
            return Err(QueryError::Fatal(format!(
                "database not available: {}",
                reason
            )));
        }
        Ok(state)
    }

    async fn download_and_parse(
        &self,
        player_number: u8,
        slot: PlayerSlot,
    ) -> QueryResult<PdbDatabase> {
        let ip = self.player_ip(player_number)?;
        let filename = self
            .database_dir
            .join(format!("player-{}-{}.pdb", player_number, slot));
        // stale partial downloads must not survive a retry
        let _ = tokio::fs::remove_file(&filename).await;

        let result = self
            .nfs
            .download_file(ip, slot, EXPORT_PDB_PATH, filename.clone())
            .await;
        let path = match result {
            Ok(path) => path,
            Err(NetError::Codec(CodecError::Nfs { status: 2, .. })) => {
                debug!(player_number, "default pdb path not found, trying MacOS path");
                let _ = tokio::fs::remove_file(&filename).await;
                self.nfs
                    .download_file(ip, slot, EXPORT_PDB_PATH_ALT, filename)
                    .await
                    .map_err(|e| {
                        QueryError::Fatal(format!(
                            "database download from player {} failed: {}",
                            player_number, e
                        ))
                    })?
            }
            Err(e) => {
                return Err(QueryError::Fatal(format!(
                    "database download from player {} failed: {}",
                    player_number, e
                )))
            }
        };
        PdbDatabase::open(&path)
            .map_err(|e| QueryError::Fatal(format!("failed to parse {}: {}", path.display(), e)))
    }

    async fn analysis(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        track_id: u32,
    ) -> QueryResult<Arc<AnlzCollection>> {
        let key = (player_number, slot, track_id);
        if let Some(analysis) = self.analysis.get(&key) {
            return Ok(analysis);
        }
        let analyze_path = {
            let state = self.ready_database(player_number, slot).await?;
            let PdbState::Ready(db) = &*state else {
                unreachable!()
            };
            let track = db.track(track_id).ok_or_else(|| {
                QueryError::Fatal(format!("track {} not in database", track_id))
            })?;
            track.analyze_path.clone()
        };

        let ip = self.player_ip(player_number)?;
        let dat = self.nfs.download_buffer(ip, slot, &analyze_path).await;
        let ext_path = analyze_path.replace("DAT", "EXT");
        let ext = self.nfs.download_buffer(ip, slot, &ext_path).await;

        let mut collection = AnlzCollection::default();
        match (dat, ext) {
            (Ok(dat), Ok(ext)) => {
                collection
                    .load_dat(&dat)
                    .map_err(|e| QueryError::Fatal(format!("bad DAT file: {}", e)))?;
                collection
                    .load_ext(&ext)
                    .map_err(|e| QueryError::Fatal(format!("bad EXT file: {}", e)))?;
            }
            (dat, ext) => {
                warn!(
                    dat_ok = dat.is_ok(),
                    ext_ok = ext.is_ok(),
                    "missing DAT or EXT data, keeping analysis empty"
                );
            }
        }
        let collection = Arc::new(collection);
        self.analysis.insert(key, collection.clone());
        Ok(collection)
    }

    async fn metadata(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        track_id: u32,
    ) -> QueryResult<QueryValue> {
        let state = self.ready_database(player_number, slot).await?;
        let PdbState::Ready(db) = &*state else {
            unreachable!()
        };
        let track = db
            .track(track_id)
            .ok_or_else(|| QueryError::Fatal(format!("track {} not in database", track_id)))?;

        let metadata = TrackMetadata {
            track_id: track.id,
            title: track.title.clone(),
            artist_id: track.artist_id,
            artist: name_or_placeholder(track.artist_id, db.artist(track.artist_id).map(|a| &a.name)),
            album_id: track.album_id,
            album: name_or_placeholder(track.album_id, db.album(track.album_id).map(|a| &a.name)),
            genre_id: track.genre_id,
            genre: name_or_placeholder(track.genre_id, db.genre(track.genre_id).map(|g| &g.name)),
            key_id: track.key_id,
            key: name_or_placeholder(track.key_id, db.key(track.key_id).map(|k| &k.name)),
            label: name_or_placeholder(track.label_id, db.label(track.label_id).map(|l| &l.name)),
            original_artist: name_or_placeholder(
                track.original_artist_id,
                db.artist(track.original_artist_id).map(|a| &a.name),
            ),
            remixer: name_or_placeholder(
                track.remixer_id,
                db.artist(track.remixer_id).map(|a| &a.name),
            ),
            comment: track.comment.clone(),
            date_added: track.date_added.clone(),
            color: TrackColor::from_id(track.color_id),
            color_text: name_or_placeholder(
                track.color_id as u32,
                db.color(track.color_id).map(|c| &c.name),
            ),
            duration: track.duration_seconds as u32,
            rating: track.rating as u32,
            play_count: track.play_count as u32,
            bitrate: track.bitrate,
            year: track.year as u32,
            artwork_id: track.artwork_id,
            bpm: Some(track.bpm()),
        };
        Ok(QueryValue::Metadata(metadata))
    }

    async fn mount_info(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        track_id: u32,
    ) -> QueryResult<QueryValue> {
        let state = self.ready_database(player_number, slot).await?;
        let PdbState::Ready(db) = &*state else {
            unreachable!()
        };
        let track = db
            .track(track_id)
            .ok_or_else(|| QueryError::Fatal(format!("track {} not in database", track_id)))?;
        Ok(QueryValue::MountInfo(MountInfo {
            track_id: track.id,
            duration: track.duration_seconds as u32,
            bpm: Some(track.bpm()),
            mount_path: track.path.clone(),
        }))
    }

    async fn artwork(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        artwork_id: u32,
    ) -> QueryResult<QueryValue> {
        let path = {
            let state = self.ready_database(player_number, slot).await?;
            let PdbState::Ready(db) = &*state else {
                unreachable!()
            };
            match db.artwork(artwork_id) {
                Some(artwork) => artwork.path.clone(),
                None => {
                    warn!(artwork_id, "no artwork entry, returning nothing");
                    return Ok(QueryValue::Unavailable);
                }
            }
        };
        let ip = self.player_ip(player_number)?;
        let data = self
            .nfs
            .download_buffer(ip, slot, &path)
            .await
            .map_err(|e| QueryError::Fatal(format!("artwork download failed: {}", e)))?;
        Ok(QueryValue::Blob(Arc::new(data)))
    }

    async fn titles(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        sort: SortMode,
        id_list: &[u32],
    ) -> QueryResult<QueryValue> {
        let state = self.ready_database(player_number, slot).await?;
        let PdbState::Ready(db) = &*state else {
            unreachable!()
        };
        let tracks: Vec<&TrackRow> = db
            .tracks
            .iter()
            .filter(|track| match id_list {
                [] => true,
                [album_id] => track.album_id == *album_id,
                [artist_id, album_id] => {
                    track.artist_id == *artist_id
                        && (*album_id == 0 || track.album_id == *album_id)
                }
                [genre_id, artist_id, album_id] => {
                    track.genre_id == *genre_id
                        && (*artist_id == 0 || track.artist_id == *artist_id)
                        && (*album_id == 0 || track.album_id == *album_id)
                }
                _ => false,
            })
            .collect();
        // the user's configured default column is unknowable here, fall
        // back to sorting by title
        let sort = match sort {
            SortMode::Default => SortMode::Title,
            other => other,
        };
        Ok(QueryValue::Rows(title_rows(db, tracks, sort)))
    }

    async fn artists(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        genre_id: Option<u32>,
    ) -> QueryResult<QueryValue> {
        let state = self.ready_database(player_number, slot).await?;
        let PdbState::Ready(db) = &*state else {
            unreachable!()
        };
        let mut rows: Vec<BrowseRow> = Vec::new();
        if genre_id.is_some() {
            rows.push(BrowseRow::single(MenuColumn::All(" ALL ".into())));
        }
        let mut artists: Vec<(&str, u32)> = db
            .artists
            .iter()
            .filter(|artist| match genre_id {
                None => true,
                Some(genre_id) => db
                    .tracks
                    .iter()
                    .any(|t| t.genre_id == genre_id && t.artist_id == artist.id),
            })
            .map(|artist| (artist.name.as_str(), artist.id))
            .collect();
        artists.sort_by(|a, b| a.0.cmp(b.0));
        rows.extend(artists.into_iter().map(|(name, id)| {
            BrowseRow::single(MenuColumn::Artist {
                name: name.to_string(),
                id,
            })
        }));
        Ok(QueryValue::Rows(rows))
    }

    async fn albums(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        id_list: &[u32],
    ) -> QueryResult<QueryValue> {
        let state = self.ready_database(player_number, slot).await?;
        let PdbState::Ready(db) = &*state else {
            unreachable!()
        };
        let mut rows: Vec<BrowseRow> = Vec::new();
        if !id_list.is_empty() {
            rows.push(BrowseRow::single(MenuColumn::All(" ALL ".into())));
        }
        let matches = |album_id: u32| -> bool {
            match id_list {
                [] => true,
                [artist_id] => db
                    .tracks
                    .iter()
                    .any(|t| t.album_id == album_id && t.artist_id == *artist_id),
                [genre_id, artist_id] => db.tracks.iter().any(|t| {
                    t.album_id == album_id
                        && t.genre_id == *genre_id
                        && (*artist_id == 0 || t.artist_id == *artist_id)
                }),
                _ => false,
            }
        };
        let mut albums: Vec<(&str, u32)> = db
            .albums
            .iter()
            .filter(|album| matches(album.id))
            .map(|album| (album.name.as_str(), album.id))
            .collect();
        albums.sort_by(|a, b| a.0.cmp(b.0));
        rows.extend(albums.into_iter().map(|(name, id)| {
            BrowseRow::single(MenuColumn::Album {
                name: name.to_string(),
                id,
            })
        }));
        Ok(QueryValue::Rows(rows))
    }

    async fn genres(&self, player_number: u8, slot: PlayerSlot) -> QueryResult<QueryValue> {
        let state = self.ready_database(player_number, slot).await?;
        let PdbState::Ready(db) = &*state else {
            unreachable!()
        };
        let mut genres: Vec<(&str, u32)> = db
            .genres
            .iter()
            .map(|genre| (genre.name.as_str(), genre.id))
            .collect();
        genres.sort_by(|a, b| a.0.cmp(b.0));
        Ok(QueryValue::Rows(
            genres
                .into_iter()
                .map(|(name, id)| {
                    BrowseRow::single(MenuColumn::Genre {
                        name: name.to_string(),
                        id,
                    })
                })
                .collect(),
        ))
    }

    async fn playlist_folder(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        folder_id: u32,
    ) -> QueryResult<QueryValue> {
        let state = self.ready_database(player_number, slot).await?;
        let PdbState::Ready(db) = &*state else {
            unreachable!()
        };
        let rows = db
            .playlists_in_folder(folder_id)
            .into_iter()
            .map(|playlist| {
                BrowseRow::single(if playlist.is_folder {
                    MenuColumn::Folder {
                        name: playlist.name.clone(),
                        id: playlist.id,
                    }
                } else {
                    MenuColumn::Playlist {
                        name: playlist.name.clone(),
                        id: playlist.id,
                        parent_id: playlist.folder_id,
                    }
                })
            })
            .collect();
        Ok(QueryValue::Rows(rows))
    }

    async fn playlist(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        sort: SortMode,
        playlist_id: u32,
    ) -> QueryResult<QueryValue> {
        let state = self.ready_database(player_number, slot).await?;
        let PdbState::Ready(db) = &*state else {
            unreachable!()
        };
        let tracks = db.playlist_tracks(playlist_id);
        Ok(QueryValue::Rows(title_rows(db, tracks, sort)))
    }
}

fn opt_blob(data: Option<&[u8]>) -> QueryValue {
    match data {
        Some(data) => QueryValue::Blob(Arc::new(data.to_vec())),
        None => QueryValue::Unavailable,
    }
}

/// Id 0 means "none"; a missing row on a non-zero id is a broken
/// export, rendered as a placeholder instead of failing the query.
fn name_or_placeholder(id: u32, name: Option<&String>) -> String {
    if id == 0 {
        return String::new();
    }
    match name {
        Some(name) => name.clone(),
        None => {
            warn!(id, "broken database reference");
            "?".into()
        }
    }
}

/// The static root menu a real player would render.
fn root_menu() -> Vec<BrowseRow> {
    [
        ("\u{fffa}TRACK\u{fffb}", 4),
        ("\u{fffa}ARTIST\u{fffb}", 2),
        ("\u{fffa}ALBUM\u{fffb}", 3),
        ("\u{fffa}GENRE\u{fffb}", 1),
        ("\u{fffa}KEY\u{fffb}", 12),
        ("\u{fffa}PLAYLIST\u{fffb}", 5),
        ("\u{fffa}HISTORY\u{fffb}", 22),
        ("\u{fffa}SEARCH\u{fffb}", 18),
        ("\u{fffa}FOLDER\u{fffb}", 17),
    ]
    .into_iter()
    .map(|(name, menu_id)| {
        BrowseRow::single(MenuColumn::MenuName {
            name: name.into(),
            menu_id,
        })
    })
    .collect()
}

/// Builds title rows with the second column implied by the sort mode,
/// sorted the way a player would render them.
fn title_rows(db: &PdbDatabase, mut tracks: Vec<&TrackRow>, sort: SortMode) -> Vec<BrowseRow> {
    let artist_name = |id: u32| name_or_placeholder(id, db.artist(id).map(|a| &a.name));

    match sort {
        SortMode::Default => {}
        SortMode::Title => tracks.sort_by(|a, b| a.title.cmp(&b.title)),
        SortMode::Artist => {
            tracks.sort_by_key(|t| artist_name(t.artist_id));
        }
        SortMode::Album => {
            tracks.sort_by_key(|t| name_or_placeholder(t.album_id, db.album(t.album_id).map(|a| &a.name)));
        }
        SortMode::Genre => {
            tracks.sort_by_key(|t| name_or_placeholder(t.genre_id, db.genre(t.genre_id).map(|g| &g.name)));
        }
        SortMode::Label => {
            tracks.sort_by_key(|t| name_or_placeholder(t.label_id, db.label(t.label_id).map(|l| &l.name)));
        }
        SortMode::Key => {
            tracks.sort_by_key(|t| name_or_placeholder(t.key_id, db.key(t.key_id).map(|k| &k.name)));
        }
        SortMode::OriginalArtist => tracks.sort_by_key(|t| artist_name(t.original_artist_id)),
        SortMode::Remixer => tracks.sort_by_key(|t| artist_name(t.remixer_id)),
        SortMode::Bpm => tracks.sort_by_key(|t| t.bpm_100),
        SortMode::Rating => tracks.sort_by_key(|t| std::cmp::Reverse(t.rating)),
        SortMode::Comment => tracks.sort_by(|a, b| a.comment.cmp(&b.comment)),
        SortMode::Duration => tracks.sort_by_key(|t| t.duration_seconds),
        SortMode::Bitrate => tracks.sort_by_key(|t| t.bitrate),
        SortMode::PlayCount => tracks.sort_by_key(|t| t.play_count),
    }

    tracks
        .into_iter()
        .map(|track| {
            let second = match sort {
                SortMode::Default | SortMode::Title | SortMode::Artist => MenuColumn::Artist {
                    name: artist_name(track.artist_id),
                    id: track.artist_id,
                },
                SortMode::Album => MenuColumn::Album {
                    name: name_or_placeholder(
                        track.album_id,
                        db.album(track.album_id).map(|a| &a.name),
                    ),
                    id: track.album_id,
                },
                SortMode::Genre => MenuColumn::Genre {
                    name: name_or_placeholder(
                        track.genre_id,
                        db.genre(track.genre_id).map(|g| &g.name),
                    ),
                    id: track.genre_id,
                },
                SortMode::Label => MenuColumn::Label {
                    name: name_or_placeholder(
                        track.label_id,
                        db.label(track.label_id).map(|l| &l.name),
                    ),
                    id: track.label_id,
                },
                SortMode::Key => MenuColumn::Key {
                    name: name_or_placeholder(
                        track.key_id,
                        db.key(track.key_id).map(|k| &k.name),
                    ),
                    id: track.key_id,
                },
                SortMode::OriginalArtist => MenuColumn::OriginalArtist {
                    name: artist_name(track.original_artist_id),
                    id: track.original_artist_id,
                },
                SortMode::Remixer => MenuColumn::Remixer {
                    name: artist_name(track.remixer_id),
                    id: track.remixer_id,
                },
                SortMode::Bpm => MenuColumn::Bpm(track.bpm()),
                SortMode::Rating => MenuColumn::Rating(track.rating as u32),
                SortMode::Comment => MenuColumn::Comment(track.comment.clone()),
                SortMode::Duration => MenuColumn::Duration(track.duration_seconds as u32),
                SortMode::Bitrate => MenuColumn::Bitrate(track.bitrate),
                SortMode::PlayCount => MenuColumn::PlayCount(track.play_count as u32),
            };
            BrowseRow(vec![
                MenuColumn::Title {
                    text: track.title.clone(),
                    track_id: track.id,
                    artist_id: track.artist_id,
                    artwork_id: track.artwork_id,
                },
                second,
            ])
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use prolink_core::pdb::row::{ArtistRow, GenreRow};

    fn track(id: u32, title: &str, artist_id: u32, genre_id: u32, bpm_100: u32) -> TrackRow {
        TrackRow {
            entry_start: 0,
            id,
            artist_id,
            album_id: 0,
            genre_id,
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
            year: 2020,
            bpm_100,
            duration_seconds: 180,
            title: title.into(),
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

    fn sample_db() -> PdbDatabase {
        let mut db = PdbDatabase::default();
        db.tracks.push(track(1, "Banana", 10, 1, 12400));
        db.tracks.push(track(2, "Apple", 11, 1, 12800));
        db.tracks.push(track(3, "Cherry", 10, 2, 11000));
        db.artists.push(ArtistRow {
            entry_start: 0,
            id: 10,
            name: "Loopmasters".into(),
        });
        db.artists.push(ArtistRow {
            entry_start: 0,
            id: 11,
            name: "Airstrike".into(),
        });
        db.genres.push(GenreRow {
            id: 1,
            name: "House".into(),
        });
        db
    }

    #[test]
    fn test_title_rows_sorted_by_title() {
        let db = sample_db();
        let tracks: Vec<&TrackRow> = db.tracks.iter().collect();
        let rows = title_rows(&db, tracks, SortMode::Title);
        let titles: Vec<&str> = rows
            .iter()
            .map(|row| match &row.0[0] {
                MenuColumn::Title { text, .. } => text.as_str(),
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(titles, vec!["Apple", "Banana", "Cherry"]);
        // second column defaults to the artist
        assert!(matches!(&rows[0].0[1], MenuColumn::Artist { name, .. } if name == "Airstrike"));
    }

    #[test]
    fn test_title_rows_sorted_by_bpm() {
        let db = sample_db();
        let tracks: Vec<&TrackRow> = db.tracks.iter().collect();
        let rows = title_rows(&db, tracks, SortMode::Bpm);
        assert!(matches!(rows[0].0[1], MenuColumn::Bpm(bpm) if bpm == 110.0));
        assert!(matches!(rows[2].0[1], MenuColumn::Bpm(bpm) if bpm == 128.0));
    }

    #[test]
    fn test_dangling_reference_placeholder() {
        let db = sample_db();
        // genre 2 has no row
        assert_eq!(
            name_or_placeholder(2, db.genre(2).map(|g| &g.name)),
            "?"
        );
        assert_eq!(name_or_placeholder(0, None), "");
    }

    #[test]
    fn test_root_menu_shape() {
        let rows = root_menu();
        assert_eq!(rows.len(), 9);
        assert!(matches!(
            &rows[0].0[0],
            MenuColumn::MenuName { name, menu_id: 4 } if name == "\u{fffa}TRACK\u{fffb}"
        ));
    }
}
