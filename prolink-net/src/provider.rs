//! Query dispatcher: cache, then exported files, then the live db.
//!
//! All query work funnels through one worker task so the packet ingest
//! loop never waits on a TCP or NFS round trip. Temporary failures are
//! requeued with a bounded retry budget and a short backoff; the color
//! waveform family degrades to the monochrome request kind once its
//! retries are exhausted instead of failing outright.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use prolink_core::packets::PlayerSlot;
use prolink_core::DataStore;

use crate::config::Config;
use crate::dbclient::DbClient;
use crate::error::{QueryError, QueryResult};
use crate::model::{QueryKind, QueryValue, SortMode, TrackMetadata};
use crate::nfs::NfsClient;
use crate::pdbprovider::PdbProvider;
use crate::registry::{BeatgridStore, PlayerRegistry, TrackKey};

const RETRY_LIMIT: u32 = 3;
const RETRY_BACKOFF: Duration = Duration::from_secs(1);
const GC_INTERVAL: Duration = Duration::from_secs(1);

pub type QueryOutcome = QueryResult<QueryValue>;

pub struct QueryRequest {
    pub player_number: u8,
    pub slot: PlayerSlot,
    pub kind: QueryKind,
    pub responder: Option<oneshot::Sender<QueryOutcome>>,
    /// Log the resolved metadata to the played-tracks history.
    pub record_history: bool,
    retries_left: u32,
}

impl QueryRequest {
    fn new(player_number: u8, slot: PlayerSlot, kind: QueryKind) -> Self {
        QueryRequest {
            player_number,
            slot,
            kind,
            responder: None,
            record_history: false,
            retries_left: RETRY_LIMIT,
        }
    }
}

/// Per-kind result caches, shared with the registry (beatgrids drive
/// position tracking synchronously).
pub struct Stores {
    pub metadata: DataStore<TrackKey, TrackMetadata>,
    pub artwork: DataStore<TrackKey, Arc<Vec<u8>>>,
    pub waveform: DataStore<TrackKey, Arc<Vec<u8>>>,
    pub preview_waveform: DataStore<TrackKey, Arc<Vec<u8>>>,
    pub color_waveform: DataStore<TrackKey, Arc<Vec<u8>>>,
    pub color_preview_waveform: DataStore<TrackKey, Arc<Vec<u8>>>,
    pub beatgrids: BeatgridStore,
}

impl Stores {
    pub fn new(beatgrids: BeatgridStore) -> Self {
        Stores {
            metadata: DataStore::default(),
            artwork: DataStore::default(),
            waveform: DataStore::default(),
            preview_waveform: DataStore::default(),
            color_waveform: DataStore::default(),
            color_preview_waveform: DataStore::default(),
            beatgrids,
        }
    }

    fn invalidate_slot(&self, player_number: u8, slot: PlayerSlot) {
        self.metadata.remove_player_slot(player_number, slot);
        self.artwork.remove_player_slot(player_number, slot);
        self.waveform.remove_player_slot(player_number, slot);
        self.preview_waveform.remove_player_slot(player_number, slot);
        self.color_waveform.remove_player_slot(player_number, slot);
        self.color_preview_waveform
            .remove_player_slot(player_number, slot);
        self.beatgrids.remove_player_slot(player_number, slot);
    }

    fn evict(&self) {
        self.metadata.evict();
        self.artwork.evict();
        self.waveform.evict();
        self.preview_waveform.evict();
        self.color_waveform.evict();
        self.color_preview_waveform.evict();
        self.beatgrids.evict();
    }

    fn lookup(&self, request: &QueryRequest) -> Option<QueryValue> {
        let id = request.kind.cache_id()?;
        let key = (request.player_number, request.slot, id);
        match request.kind {
            QueryKind::Metadata { .. } => self.metadata.get(&key).map(QueryValue::Metadata),
            QueryKind::Artwork { .. } => self.artwork.get(&key).map(QueryValue::Blob),
            QueryKind::Waveform { .. } => self.waveform.get(&key).map(QueryValue::Blob),
            QueryKind::PreviewWaveform { .. } => {
                self.preview_waveform.get(&key).map(QueryValue::Blob)
            }
            QueryKind::ColorWaveform { .. } => {
                self.color_waveform.get(&key).map(QueryValue::Blob)
            }
            QueryKind::ColorPreviewWaveform { .. } => {
                self.color_preview_waveform.get(&key).map(QueryValue::Blob)
            }
            QueryKind::Beatgrid { .. } => self.beatgrids.get(&key).map(QueryValue::Beatgrid),
            _ => None,
        }
    }

    fn cache(&self, request: &QueryRequest, value: &QueryValue) {
        let Some(id) = request.kind.cache_id() else {
            return;
        };
        let key = (request.player_number, request.slot, id);
        match (&request.kind, value) {
            (QueryKind::Metadata { .. }, QueryValue::Metadata(md)) => {
                self.metadata.insert(key, md.clone())
            }
            (QueryKind::Artwork { .. }, QueryValue::Blob(blob)) => {
                self.artwork.insert(key, blob.clone())
            }
            (QueryKind::Waveform { .. }, QueryValue::Blob(blob)) => {
                self.waveform.insert(key, blob.clone())
            }
            (QueryKind::PreviewWaveform { .. }, QueryValue::Blob(blob)) => {
                self.preview_waveform.insert(key, blob.clone())
            }
            (QueryKind::ColorWaveform { .. }, QueryValue::Blob(blob)) => {
                self.color_waveform.insert(key, blob.clone())
            }
            (QueryKind::ColorPreviewWaveform { .. }, QueryValue::Blob(blob)) => {
                self.color_preview_waveform.insert(key, blob.clone())
            }
            (QueryKind::Beatgrid { .. }, QueryValue::Beatgrid(beats)) => {
                self.beatgrids.insert(key, beats.clone())
            }
            _ => {}
        }
    }
}

/// Work delivered to the provider task.
enum WorkItem {
    Query(QueryRequest),
    /// Media changed on a slot; every cache for it must go.
    InvalidateSlot { player_number: u8, slot: PlayerSlot },
}

/// Cloneable handle enqueueing queries to the worker.
#[derive(Clone)]
pub struct DataProvider {
    tx: mpsc::UnboundedSender<WorkItem>,
}

impl DataProvider {
    pub fn invalidate_slot(&self, player_number: u8, slot: PlayerSlot) {
        let _ = self.tx.send(WorkItem::InvalidateSlot {
            player_number,
            slot,
        });
    }

    /// Enqueues a query; the receiver resolves with the outcome.
    pub fn request(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        kind: QueryKind,
    ) -> oneshot::Receiver<QueryOutcome> {
        let (tx, rx) = oneshot::channel();
        if player_number == 0 || player_number > 4 {
            warn!(player_number, ?kind, "invalid query parameters");
            let _ = tx.send(Err(QueryError::Fatal(format!(
                "invalid player number {}",
                player_number
            ))));
            return rx;
        }
        let mut request = QueryRequest::new(player_number, slot, kind);
        request.responder = Some(tx);
        debug!(player_number, %slot, ?kind, "enqueueing query");
        let _ = self.tx.send(WorkItem::Query(request));
        rx
    }

    /// Fire-and-forget variant used for the registry's automatic
    /// queries.
    pub fn request_background(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        kind: QueryKind,
        record_history: bool,
    ) {
        if player_number == 0 || player_number > 4 {
            warn!(player_number, ?kind, "invalid query parameters");
            return;
        }
        let mut request = QueryRequest::new(player_number, slot, kind);
        request.record_history = record_history;
        let _ = self.tx.send(WorkItem::Query(request));
    }

    pub fn get_metadata(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        track_id: u32,
    ) -> oneshot::Receiver<QueryOutcome> {
        self.request(player_number, slot, QueryKind::Metadata { track_id })
    }

    pub fn get_artwork(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        artwork_id: u32,
    ) -> oneshot::Receiver<QueryOutcome> {
        self.request(player_number, slot, QueryKind::Artwork { artwork_id })
    }

    pub fn get_waveform(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        track_id: u32,
    ) -> oneshot::Receiver<QueryOutcome> {
        self.request(player_number, slot, QueryKind::Waveform { track_id })
    }

    pub fn get_preview_waveform(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        track_id: u32,
    ) -> oneshot::Receiver<QueryOutcome> {
        self.request(player_number, slot, QueryKind::PreviewWaveform { track_id })
    }

    pub fn get_color_waveform(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        track_id: u32,
    ) -> oneshot::Receiver<QueryOutcome> {
        self.request(player_number, slot, QueryKind::ColorWaveform { track_id })
    }

    pub fn get_color_preview_waveform(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        track_id: u32,
    ) -> oneshot::Receiver<QueryOutcome> {
        self.request(
            player_number,
            slot,
            QueryKind::ColorPreviewWaveform { track_id },
        )
    }

    pub fn get_beatgrid(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        track_id: u32,
    ) -> oneshot::Receiver<QueryOutcome> {
        self.request(player_number, slot, QueryKind::Beatgrid { track_id })
    }

    pub fn get_mount_info(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        track_id: u32,
    ) -> oneshot::Receiver<QueryOutcome> {
        self.request(player_number, slot, QueryKind::MountInfo { track_id })
    }

    pub fn get_track_info(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        track_id: u32,
    ) -> oneshot::Receiver<QueryOutcome> {
        self.request(player_number, slot, QueryKind::TrackInfo { track_id })
    }

    pub fn get_root_menu(
        &self,
        player_number: u8,
        slot: PlayerSlot,
    ) -> oneshot::Receiver<QueryOutcome> {
        self.request(player_number, slot, QueryKind::RootMenu)
    }

    pub fn get_titles(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        sort: SortMode,
    ) -> oneshot::Receiver<QueryOutcome> {
        self.request(player_number, slot, QueryKind::Titles { sort })
    }

    pub fn get_titles_by_album(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        album_id: u32,
        sort: SortMode,
    ) -> oneshot::Receiver<QueryOutcome> {
        self.request(
            player_number,
            slot,
            QueryKind::TitlesByAlbum { sort, album_id },
        )
    }

    pub fn get_titles_by_artist_album(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        artist_id: u32,
        album_id: u32,
        sort: SortMode,
    ) -> oneshot::Receiver<QueryOutcome> {
        self.request(
            player_number,
            slot,
            QueryKind::TitlesByArtistAlbum {
                sort,
                artist_id,
                album_id,
            },
        )
    }

    pub fn get_titles_by_genre_artist_album(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        genre_id: u32,
        artist_id: u32,
        album_id: u32,
        sort: SortMode,
    ) -> oneshot::Receiver<QueryOutcome> {
        self.request(
            player_number,
            slot,
            QueryKind::TitlesByGenreArtistAlbum {
                sort,
                genre_id,
                artist_id,
                album_id,
            },
        )
    }

    pub fn get_artists(
        &self,
        player_number: u8,
        slot: PlayerSlot,
    ) -> oneshot::Receiver<QueryOutcome> {
        self.request(player_number, slot, QueryKind::Artists)
    }

    pub fn get_artists_by_genre(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        genre_id: u32,
    ) -> oneshot::Receiver<QueryOutcome> {
        self.request(player_number, slot, QueryKind::ArtistsByGenre { genre_id })
    }

    pub fn get_albums(
        &self,
        player_number: u8,
        slot: PlayerSlot,
    ) -> oneshot::Receiver<QueryOutcome> {
        self.request(player_number, slot, QueryKind::Albums)
    }

    pub fn get_albums_by_artist(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        artist_id: u32,
    ) -> oneshot::Receiver<QueryOutcome> {
        self.request(player_number, slot, QueryKind::AlbumsByArtist { artist_id })
    }

    pub fn get_albums_by_genre_artist(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        genre_id: u32,
        artist_id: u32,
    ) -> oneshot::Receiver<QueryOutcome> {
        self.request(
            player_number,
            slot,
            QueryKind::AlbumsByGenreArtist {
                genre_id,
                artist_id,
            },
        )
    }

    pub fn get_genres(
        &self,
        player_number: u8,
        slot: PlayerSlot,
    ) -> oneshot::Receiver<QueryOutcome> {
        self.request(player_number, slot, QueryKind::Genres)
    }

    pub fn get_playlist_folder(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        folder_id: u32,
    ) -> oneshot::Receiver<QueryOutcome> {
        self.request(player_number, slot, QueryKind::PlaylistFolder { folder_id })
    }

    pub fn get_playlist(
        &self,
        player_number: u8,
        slot: PlayerSlot,
        playlist_id: u32,
        sort: SortMode,
    ) -> oneshot::Receiver<QueryOutcome> {
        self.request(
            player_number,
            slot,
            QueryKind::Playlist { sort, playlist_id },
        )
    }
}

/// What to do with a request that failed with a temporary error.
#[derive(Debug, PartialEq, Eq)]
enum RetryDecision {
    Requeue { kind: QueryKind, retries_left: u32 },
    GiveUp,
}

fn on_temporary_failure(kind: QueryKind, retries_left: u32) -> RetryDecision {
    if retries_left > 0 {
        return RetryDecision::Requeue {
            kind,
            retries_left: retries_left - 1,
        };
    }
    // out of retries: the color waveforms have a monochrome stand-in
    match kind {
        QueryKind::ColorWaveform { track_id } => RetryDecision::Requeue {
            kind: QueryKind::Waveform { track_id },
            retries_left: RETRY_LIMIT,
        },
        QueryKind::ColorPreviewWaveform { track_id } => RetryDecision::Requeue {
            kind: QueryKind::PreviewWaveform { track_id },
            retries_left: RETRY_LIMIT,
        },
        _ => RetryDecision::GiveUp,
    }
}

pub struct ProviderWorker {
    rx: mpsc::UnboundedReceiver<WorkItem>,
    tx: mpsc::UnboundedSender<WorkItem>,
    dbc: DbClient,
    pdb: PdbProvider,
    stores: Stores,
    registry: Arc<Mutex<PlayerRegistry>>,
    played_tracks_log: Option<PathBuf>,
    pdb_enabled: bool,
    dbc_enabled: bool,
}

impl ProviderWorker {
    pub fn new(
        config: &Config,
        registry: Arc<Mutex<PlayerRegistry>>,
        nfs: NfsClient,
        beatgrids: BeatgridStore,
    ) -> (DataProvider, ProviderWorker) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = ProviderWorker {
            rx,
            tx: tx.clone(),
            dbc: DbClient::new(registry.clone(), config.query_player_number),
            pdb: PdbProvider::new(registry.clone(), nfs, config.database_dir.clone()),
            stores: Stores::new(beatgrids),
            registry,
            played_tracks_log: config.played_tracks_log.clone(),
            pdb_enabled: true,
            dbc_enabled: true,
        };
        (DataProvider { tx }, worker)
    }

    /// Invalidates every store for a slot whose media changed.
    pub fn invalidate_slot(&self, player_number: u8, slot: PlayerSlot) {
        self.stores.invalidate_slot(player_number, slot);
        self.pdb.invalidate_slot(player_number, slot);
    }

    pub async fn run(mut self) {
        debug!("data provider starting");
        let mut gc_interval = tokio::time::interval(GC_INTERVAL);
        loop {
            tokio::select! {
                item = self.rx.recv() => {
                    match item {
                        Some(WorkItem::Query(request)) => self.process(request).await,
                        Some(WorkItem::InvalidateSlot {
                            player_number,
                            slot,
                        }) => self.invalidate_slot(player_number, slot),
                        None => break,
                    }
                }
                _ = gc_interval.tick() => {
                    self.dbc.gc();
                    self.stores.evict();
                }
            }
        }
        debug!("data provider shutting down");
    }

    async fn process(&mut self, mut request: QueryRequest) {
        match self.resolve(&request).await {
            Ok(value) => {
                self.finish(&request, &value).await;
                if let Some(responder) = request.responder.take() {
                    let _ = responder.send(Ok(value));
                }
            }
            Err(e) if e.is_temporary() => {
                warn!(kind = ?request.kind, error = %e, "query failed");
                match on_temporary_failure(request.kind, request.retries_left) {
                    RetryDecision::Requeue { kind, retries_left } => {
                        if kind != request.kind {
                            info!(from = ?request.kind, to = ?kind, "degrading query kind");
                        } else {
                            info!(kind = ?kind, retries_left, "retrying query");
                        }
                        request.kind = kind;
                        request.retries_left = retries_left;
                        let tx = self.tx.clone();
                        // backoff without stalling the worker
                        tokio::spawn(async move {
                            tokio::time::sleep(RETRY_BACKOFF).await;
                            let _ = tx.send(WorkItem::Query(request));
                        });
                    }
                    RetryDecision::GiveUp => {
                        info!(kind = ?request.kind, "query failed after all retries");
                        if let Some(responder) = request.responder.take() {
                            let _ = responder.send(Err(e));
                        }
                    }
                }
            }
            Err(e) => {
                warn!(kind = ?request.kind, error = %e, "query failed fatally");
                if let Some(responder) = request.responder.take() {
                    let _ = responder.send(Err(e));
                }
            }
        }
    }

    /// Resolution order: store, exported files, live database.
    async fn resolve(&mut self, request: &QueryRequest) -> QueryOutcome {
        if let Some(value) = self.stores.lookup(request) {
            debug!(kind = ?request.kind, "answered from store");
            return Ok(value);
        }

        let mut value: Option<QueryValue> = None;
        if self.pdb_enabled {
            match self
                .pdb
                .handle(request.player_number, request.slot, &request.kind)
                .await
            {
                Ok(QueryValue::Unavailable) => {}
                Ok(v) => value = Some(v),
                Err(e) if e.is_temporary() => return Err(e),
                Err(e) => {
                    // fatal here still leaves the live path
                    warn!(error = %e, "pdb path failed");
                    if !self.dbc_enabled {
                        return Err(e);
                    }
                }
            }
        }
        if value.is_none() && self.dbc_enabled {
            value = Some(
                self.dbc
                    .handle(request.player_number, request.slot, &request.kind)
                    .await?,
            );
        }
        value.ok_or_else(|| QueryError::Fatal("no data source enabled".into()))
    }

    /// Post-processing of a successful value: caches, registry
    /// metadata, history logging.
    async fn finish(&mut self, request: &QueryRequest, value: &QueryValue) {
        if matches!(value, QueryValue::Unavailable) {
            return;
        }
        self.stores.cache(request, value);

        if let (QueryKind::Metadata { track_id }, QueryValue::Metadata(metadata)) =
            (&request.kind, value)
        {
            self.registry.lock().unwrap().store_metadata_by_loaded_track(
                request.player_number,
                request.slot,
                *track_id,
                metadata,
            );
            if request.record_history {
                if let Some(path) = &self.played_tracks_log {
                    if let Err(e) = append_history(path, metadata).await {
                        warn!(error = %e, "failed to append played-track history");
                    }
                }
            }
        }
    }
}

async fn append_history(path: &PathBuf, metadata: &TrackMetadata) -> std::io::Result<()> {
    use tokio::io::AsyncWriteExt;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    let line = format!(
        "{}: {} - {} ({})\n",
        unix_timestamp(),
        metadata.artist,
        metadata.title,
        metadata.album
    );
    file.write_all(line.as_bytes()).await
}

fn unix_timestamp() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::BeatgridStore;
    use tokio::sync::mpsc as tokio_mpsc;

    #[test]
    fn test_retry_decision_counts_down() {
        let kind = QueryKind::Metadata { track_id: 1 };
        assert_eq!(
            on_temporary_failure(kind, 3),
            RetryDecision::Requeue {
                kind,
                retries_left: 2
            }
        );
        assert_eq!(on_temporary_failure(kind, 0), RetryDecision::GiveUp);
    }

    #[test]
    fn test_color_waveform_degrades_after_retries() {
        let kind = QueryKind::ColorWaveform { track_id: 7 };
        assert_eq!(
            on_temporary_failure(kind, 0),
            RetryDecision::Requeue {
                kind: QueryKind::Waveform { track_id: 7 },
                retries_left: RETRY_LIMIT,
            }
        );
        let kind = QueryKind::ColorPreviewWaveform { track_id: 7 };
        assert_eq!(
            on_temporary_failure(kind, 0),
            RetryDecision::Requeue {
                kind: QueryKind::PreviewWaveform { track_id: 7 },
                retries_left: RETRY_LIMIT,
            }
        );
    }

    #[tokio::test]
    async fn test_invalid_player_number_fails_immediately() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let provider = DataProvider { tx };
        let outcome = provider
            .get_metadata(0, PlayerSlot::Usb, 1)
            .await
            .expect("responder dropped");
        assert!(matches!(outcome, Err(QueryError::Fatal(_))));
        let outcome = provider
            .get_metadata(9, PlayerSlot::Usb, 1)
            .await
            .expect("responder dropped");
        assert!(matches!(outcome, Err(QueryError::Fatal(_))));
    }

    fn empty_registry() -> Arc<Mutex<PlayerRegistry>> {
        let (events, events_rx) = tokio_mpsc::unbounded_channel();
        let (actions, actions_rx) = tokio_mpsc::unbounded_channel();
        std::mem::forget(events_rx);
        std::mem::forget(actions_rx);
        let beatgrids: BeatgridStore = Arc::new(DataStore::new(8));
        Arc::new(Mutex::new(PlayerRegistry::new(events, actions, beatgrids)))
    }

    #[tokio::test]
    async fn test_store_answers_before_sources() {
        let registry = empty_registry();
        let nfs = NfsClient::new().await.unwrap();
        let beatgrids: BeatgridStore = Arc::new(DataStore::new(8));
        let config = Config::default();
        let (_provider, mut worker) =
            ProviderWorker::new(&config, registry, nfs, beatgrids);

        let metadata = TrackMetadata {
            title: "Cached".into(),
            track_id: 42,
            ..Default::default()
        };
        worker
            .stores
            .metadata
            .insert((2, PlayerSlot::Usb, 42), metadata);

        // no player in the registry and no servers around: only the
        // store can answer this
        let request = QueryRequest::new(2, PlayerSlot::Usb, QueryKind::Metadata { track_id: 42 });
        let value = worker.resolve(&request).await.unwrap();
        match value {
            QueryValue::Metadata(md) => assert_eq!(md.title, "Cached"),
            _ => panic!("expected metadata"),
        }
    }

    #[tokio::test]
    async fn test_media_invalidation_clears_stores() {
        let registry = empty_registry();
        let nfs = NfsClient::new().await.unwrap();
        let beatgrids: BeatgridStore = Arc::new(DataStore::new(8));
        let config = Config::default();
        let (_provider, worker) = ProviderWorker::new(&config, registry, nfs, beatgrids);

        worker.stores.metadata.insert(
            (2, PlayerSlot::Usb, 42),
            TrackMetadata::default(),
        );
        worker
            .stores
            .waveform
            .insert((2, PlayerSlot::Usb, 42), Arc::new(vec![1, 2, 3]));
        worker.invalidate_slot(2, PlayerSlot::Usb);
        assert!(worker.stores.metadata.get(&(2, PlayerSlot::Usb, 42)).is_none());
        assert!(worker.stores.waveform.get(&(2, PlayerSlot::Usb, 42)).is_none());
    }
}
