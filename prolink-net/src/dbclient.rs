//! Client for the players' remote database service.
//!
//! One lazily-opened TCP session per player, reaped after 30 idle gc
//! sweeps or on a broken pipe. List data is fetched in two phases: a
//! request that answers with the entry count, then a render command
//! whose reply is a stream of menu items terminated by a menu footer.
//! Replies can span many socket reads, so parsing is retried as bytes
//! accumulate, bounded by parse and timeout budgets.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use prolink_core::anlz;
use prolink_core::grid::parse_live_beatgrid;
use prolink_core::packets::dbmessage::{
    build_db_server_query, parse_db_server_reply, DbField, DbMessage, MessageKind,
    DB_SERVER_QUERY_PORT, NXS2_ID_COLOR_PREVIEW_WAVEFORM, NXS2_ID_COLOR_WAVEFORM, NXS2_ID_EXT,
};
use prolink_core::packets::PlayerSlot;

use crate::error::{QueryError, QueryResult};
use crate::model::{
    BrowseRow, MenuColumn, MountInfo, QueryKind, QueryValue, SortMode, TrackColor, TrackMetadata,
};
use crate::registry::PlayerRegistry;

/// Sweeps of idleness before a session is closed.
const SESSION_TTL: i32 = 30;

/// Reparse attempts while a reply accumulates.
const PARSE_RETRY_LIMIT: usize = 40;

/// Socket read timeouts tolerated per reply.
const RECEIVE_TIMEOUT_LIMIT: usize = 3;

const READ_TIMEOUT: Duration = Duration::from_secs(1);

struct Session {
    stream: TcpStream,
    ttl: i32,
    transaction_id: u32,
}

pub struct DbClient {
    registry: Arc<Mutex<PlayerRegistry>>,
    /// Player number we present in queries; 0 works with up to three
    /// players on the link.
    query_player_number: u8,
    sessions: HashMap<u8, Session>,
    remote_ports: HashMap<u8, SocketAddr>,
    /// Port answering the db port discovery query; fixed on real
    /// hardware, overridable for tests.
    discovery_port: u16,
}

impl DbClient {
    pub fn new(registry: Arc<Mutex<PlayerRegistry>>, query_player_number: u8) -> Self {
        DbClient {
            registry,
            query_player_number,
            sessions: HashMap::new(),
            remote_ports: HashMap::new(),
            discovery_port: DB_SERVER_QUERY_PORT,
        }
    }

    #[cfg(test)]
    pub fn set_discovery_port(&mut self, port: u16) {
        self.discovery_port = port;
    }

    /// Idle sweep: sessions not used since the previous sweep move
    /// toward expiry; expired ones are closed.
    pub fn gc(&mut self) {
        let expired: Vec<u8> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.ttl <= 0)
            .map(|(n, _)| *n)
            .collect();
        for player_number in expired {
            info!(player_number, "closing idle db session");
            self.sessions.remove(&player_number);
        }
        for session in self.sessions.values_mut() {
            session.ttl -= 1;
        }
    }

    pub fn close_all(&mut self) {
        self.sessions.clear();
    }

    /// Entry point used by the data provider.
    pub async fn handle(
        &mut self,
        player_number: u8,
        slot: PlayerSlot,
        kind: &QueryKind,
    ) -> QueryResult<QueryValue> {
        self.ensure_request_possible(player_number, kind)?;
        debug!(player_number, %slot, ?kind, "db query");
        match *kind {
            QueryKind::Metadata { track_id } => {
                let messages = self
                    .query_list(
                        player_number,
                        slot,
                        None,
                        &[track_id],
                        MessageKind::MetadataRequest,
                    )
                    .await?;
                Ok(fold_metadata(&messages))
            }
            QueryKind::RootMenu => {
                let messages = self
                    .query_list(player_number, slot, None, &[], MessageKind::RootMenuRequest)
                    .await?;
                Ok(rows_value(&messages))
            }
            QueryKind::Titles { sort } => {
                let messages = self
                    .query_list(
                        player_number,
                        slot,
                        Some(sort),
                        &[],
                        MessageKind::TitleRequest,
                    )
                    .await?;
                Ok(rows_value(&messages))
            }
            QueryKind::TitlesByAlbum { sort, album_id } => {
                let messages = self
                    .query_list(
                        player_number,
                        slot,
                        Some(sort),
                        &[album_id],
                        MessageKind::TitleByAlbumRequest,
                    )
                    .await?;
                Ok(rows_value(&messages))
            }
            QueryKind::TitlesByArtistAlbum {
                sort,
                artist_id,
                album_id,
            } => {
                let messages = self
                    .query_list(
                        player_number,
                        slot,
                        Some(sort),
                        &[artist_id, album_id],
                        MessageKind::TitleByArtistAlbumRequest,
                    )
                    .await?;
                Ok(rows_value(&messages))
            }
            QueryKind::TitlesByGenreArtistAlbum {
                sort,
                genre_id,
                artist_id,
                album_id,
            } => {
                let messages = self
                    .query_list(
                        player_number,
                        slot,
                        Some(sort),
                        &[genre_id, artist_id, album_id],
                        MessageKind::TitleByGenreArtistAlbumRequest,
                    )
                    .await?;
                Ok(rows_value(&messages))
            }
            QueryKind::Artists => {
                let messages = self
                    .query_list(player_number, slot, None, &[], MessageKind::ArtistRequest)
                    .await?;
                Ok(rows_value(&messages))
            }
            QueryKind::ArtistsByGenre { genre_id } => {
                let messages = self
                    .query_list(
                        player_number,
                        slot,
                        None,
                        &[genre_id],
                        MessageKind::ArtistByGenreRequest,
                    )
                    .await?;
                Ok(rows_value(&messages))
            }
            QueryKind::Albums => {
                let messages = self
                    .query_list(player_number, slot, None, &[], MessageKind::AlbumRequest)
                    .await?;
                Ok(rows_value(&messages))
            }
            QueryKind::AlbumsByArtist { artist_id } => {
                let messages = self
                    .query_list(
                        player_number,
                        slot,
                        None,
                        &[artist_id],
                        MessageKind::AlbumByArtistRequest,
                    )
                    .await?;
                Ok(rows_value(&messages))
            }
            QueryKind::AlbumsByGenreArtist {
                genre_id,
                artist_id,
            } => {
                let messages = self
                    .query_list(
                        player_number,
                        slot,
                        None,
                        &[genre_id, artist_id],
                        MessageKind::AlbumByGenreArtistRequest,
                    )
                    .await?;
                Ok(rows_value(&messages))
            }
            QueryKind::Genres => {
                let messages = self
                    .query_list(player_number, slot, None, &[], MessageKind::GenreRequest)
                    .await?;
                Ok(rows_value(&messages))
            }
            QueryKind::PlaylistFolder { folder_id } => {
                let messages = self
                    .query_playlist(player_number, slot, SortMode::Default, folder_id, true)
                    .await?;
                Ok(rows_value(&messages))
            }
            QueryKind::Playlist { sort, playlist_id } => {
                let messages = self
                    .query_playlist(player_number, slot, sort, playlist_id, false)
                    .await?;
                Ok(rows_value(&messages))
            }
            QueryKind::Artwork { artwork_id } => {
                let blob = self
                    .query_blob(player_number, slot, artwork_id, MessageKind::ArtworkRequest, 8)
                    .await?;
                Ok(blob_value(blob))
            }
            QueryKind::Waveform { track_id } => {
                let blob = self
                    .query_blob(player_number, slot, track_id, MessageKind::WaveformRequest, 1)
                    .await?;
                // the first 20 bytes are a header the renderer never needs
                Ok(blob_value(
                    blob.map(|b| b.get(20..).map(|s| s.to_vec()).unwrap_or_default()),
                ))
            }
            QueryKind::PreviewWaveform { track_id } => {
                let blob = self
                    .query_blob(
                        player_number,
                        slot,
                        track_id,
                        MessageKind::PreviewWaveformRequest,
                        8,
                    )
                    .await?;
                Ok(blob_value(blob))
            }
            QueryKind::ColorWaveform { track_id } => {
                let blob = self
                    .query_blob(player_number, slot, track_id, MessageKind::Nxs2ExtRequest, 1)
                    .await?;
                Ok(color_waveform_value(blob)?)
            }
            QueryKind::ColorPreviewWaveform { track_id } => {
                let blob = self
                    .query_blob(player_number, slot, track_id, MessageKind::Nxs2ExtRequest, 8)
                    .await?;
                Ok(color_waveform_value(blob)?)
            }
            QueryKind::Beatgrid { track_id } => {
                let blob = self
                    .query_blob(player_number, slot, track_id, MessageKind::BeatgridRequest, 8)
                    .await?;
                match blob {
                    None => Ok(QueryValue::Unavailable),
                    Some(data) => {
                        let beats = parse_live_beatgrid(&data).map_err(|e| {
                            QueryError::Fatal(format!("failed to parse beatgrid data: {}", e))
                        })?;
                        Ok(QueryValue::Beatgrid(Arc::new(beats)))
                    }
                }
            }
            QueryKind::MountInfo { track_id } => {
                let messages = self
                    .query_list(
                        player_number,
                        slot,
                        None,
                        &[track_id],
                        MessageKind::MountInfoRequest,
                    )
                    .await?;
                Ok(fold_mount_info(&messages))
            }
            QueryKind::TrackInfo { track_id } => {
                let messages = self
                    .query_list(
                        player_number,
                        slot,
                        None,
                        &[track_id],
                        MessageKind::TrackInfoRequest,
                    )
                    .await?;
                Ok(fold_metadata(&messages))
            }
        }
    }

    /// Players whose database service is in a not-ready play state do
    /// not answer reliably; defer instead of wasting a session on them.
    fn ensure_request_possible(&self, player_number: u8, kind: &QueryKind) -> QueryResult<()> {
        let registry = self.registry.lock().unwrap();
        let Some(player) = registry.player(player_number) else {
            return Err(QueryError::Temporary(format!(
                "player {} not in registry",
                player_number
            )));
        };
        let critical = matches!(
            kind,
            QueryKind::Metadata { .. }
                | QueryKind::Artwork { .. }
                | QueryKind::PreviewWaveform { .. }
                | QueryKind::Beatgrid { .. }
                | QueryKind::Waveform { .. }
        );
        if critical && player.play_state.is_not_ready() {
            return Err(QueryError::Temporary(format!(
                "deferring query, player {} play state is {:?}",
                player_number, player.play_state
            )));
        }
        Ok(())
    }

    /// The first request argument packs our identity and the target
    /// location into one word.
    fn address_word(&self, location: u8, slot: PlayerSlot) -> u32 {
        (self.query_player_number as u32) << 24
            | (location as u32) << 16
            | (slot.to_raw() as u32) << 8
            | 1
    }

    async fn query_playlist(
        &mut self,
        player_number: u8,
        slot: PlayerSlot,
        sort: SortMode,
        id: u32,
        folder: bool,
    ) -> QueryResult<Vec<DbMessage>> {
        let args = vec![
            DbField::U32(self.address_word(1, slot)),
            DbField::U32(if folder { 0 } else { sort.sort_id() }),
            DbField::U32(id),
            DbField::U32(if folder { 1 } else { 0 }),
        ];
        self.query_rendered(player_number, MessageKind::PlaylistRequest, args)
            .await
    }

    async fn query_list(
        &mut self,
        player_number: u8,
        slot: PlayerSlot,
        sort: Option<SortMode>,
        id_list: &[u32],
        kind: MessageKind,
    ) -> QueryResult<Vec<DbMessage>> {
        let mut args = vec![DbField::U32(self.address_word(1, slot))];
        match kind {
            MessageKind::RootMenuRequest => {
                args.push(DbField::U32(0));
                args.push(DbField::U32(0xffffff));
            }
            MessageKind::MetadataRequest
            | MessageKind::MountInfoRequest
            | MessageKind::TrackInfoRequest => {
                args.push(DbField::U32(id_list[0]));
            }
            _ => {
                args.push(DbField::U32(sort.unwrap_or(SortMode::Default).sort_id()));
                for &item_id in id_list {
                    // id 0 stands for "all"; the service expects all
                    // bits set for that
                    args.push(DbField::U32(if item_id == 0 { 0xffffffff } else { item_id }));
                }
            }
        }
        self.query_rendered(player_number, kind, args).await
    }

    /// Two-phase exchange: request for the count, render for the rows.
    async fn query_rendered(
        &mut self,
        player_number: u8,
        kind: MessageKind,
        args: Vec<DbField>,
    ) -> QueryResult<Vec<DbMessage>> {
        let slot_word = args[0].clone();
        let transaction_id = self.next_transaction_id(player_number).await?;
        let request = DbMessage::new(transaction_id, kind, args);
        debug!(?kind, transaction_id, "list request");
        self.send(player_number, &request.encode()).await?;

        let reply = self.receive_message(player_number).await?;
        if reply.kind != MessageKind::Success {
            return Err(QueryError::Fatal(format!(
                "{:?} failed on player {} (got {:?})",
                kind, player_number, reply.kind
            )));
        }
        let entry_count = reply
            .args
            .get(1)
            .and_then(DbField::as_u32)
            .unwrap_or(0xffffffff);
        if entry_count == 0 || entry_count == 0xffffffff {
            warn!(?kind, entry_count, "empty result");
            return Ok(Vec::new());
        }
        debug!(?kind, entry_count, "entries available");

        // hundreds of entries arrive fine in one go, no need to
        // fragment the render request
        let transaction_id = self.next_transaction_id(player_number).await?;
        let render = DbMessage::new(
            transaction_id,
            MessageKind::Render,
            vec![
                slot_word,
                DbField::U32(0),
                DbField::U32(entry_count),
                DbField::U32(0),
                DbField::U32(entry_count),
                DbField::U32(0),
            ],
        );
        self.send(player_number, &render.encode()).await?;
        self.receive_rendered(player_number, kind).await
    }

    async fn query_blob(
        &mut self,
        player_number: u8,
        slot: PlayerSlot,
        item_id: u32,
        kind: MessageKind,
        location: u8,
    ) -> QueryResult<Option<Vec<u8>>> {
        let mut args = vec![
            DbField::U32(self.address_word(location, slot)),
            DbField::U32(item_id),
        ];
        match kind {
            MessageKind::WaveformRequest => args.push(DbField::U32(0)),
            MessageKind::PreviewWaveformRequest => {
                args.insert(1, DbField::U32(4));
                args.push(DbField::U32(0));
            }
            MessageKind::Nxs2ExtRequest => {
                // sub-resource selector: color waveform at location 1,
                // color preview elsewhere
                let resource = if location == 1 {
                    NXS2_ID_COLOR_WAVEFORM
                } else {
                    NXS2_ID_COLOR_PREVIEW_WAVEFORM
                };
                args.push(DbField::U32(resource));
                args.push(DbField::U32(NXS2_ID_EXT));
            }
            _ => {}
        }

        let transaction_id = self.next_transaction_id(player_number).await?;
        let request = DbMessage::new(transaction_id, kind, args);
        debug!(?kind, item_id, "blob request");
        self.send(player_number, &request.encode()).await?;
        let reply = self.receive_message(player_number).await?;

        if reply.kind == MessageKind::InvalidRequest
            || reply.args.len() < 4
            || reply.args.get(2).and_then(DbField::as_u32) == Some(0)
        {
            warn!(?kind, player_number, reply = ?reply.kind, "blob not available");
            return Ok(None);
        }
        let blob = reply.args[3]
            .as_binary()
            .ok_or_else(|| QueryError::Fatal("blob reply argument is not binary".into()))?;
        debug!(bytes = blob.len(), "blob received");
        Ok(Some(blob.to_vec()))
    }

    /// Receives one message, accumulating bytes until it parses.
    async fn receive_message(&mut self, player_number: u8) -> QueryResult<DbMessage> {
        let mut parse_errors = 0;
        let mut timeouts = 0;
        let mut data = Vec::new();
        while parse_errors < PARSE_RETRY_LIMIT && timeouts < RECEIVE_TIMEOUT_LIMIT {
            let chunk = self.read_chunk(player_number).await?;
            if chunk.is_empty() {
                timeouts += 1;
                continue;
            }
            data.extend_from_slice(&chunk);
            match DbMessage::decode(&data) {
                Ok((message, _)) => return Ok(message),
                Err(e) if e.is_truncated() => {
                    debug!(bytes = data.len(), "partial message, reading more");
                    parse_errors += 1;
                }
                Err(e) => return Err(QueryError::Fatal(format!("bad db message: {}", e))),
            }
        }
        Err(QueryError::Temporary(format!(
            "no complete reply after {} parse attempts and {} timeouts",
            parse_errors, timeouts
        )))
    }

    /// Receives a rendered stream until its menu footer arrives.
    async fn receive_rendered(
        &mut self,
        player_number: u8,
        kind: MessageKind,
    ) -> QueryResult<Vec<DbMessage>> {
        let mut parse_errors = 0;
        let mut timeouts = 0;
        let mut data = Vec::new();
        while parse_errors < PARSE_RETRY_LIMIT && timeouts < RECEIVE_TIMEOUT_LIMIT {
            let chunk = self.read_chunk(player_number).await?;
            if chunk.is_empty() {
                timeouts += 1;
                continue;
            }
            data.extend_from_slice(&chunk);
            match DbMessage::decode_many(&data) {
                Ok(messages) => {
                    if messages.last().map(|m| m.kind) == Some(MessageKind::MenuFooter) {
                        return Ok(messages);
                    }
                    debug!(?kind, bytes = data.len(), "no footer yet, reading more");
                    parse_errors += 1;
                }
                Err(e) if e.is_truncated() => {
                    debug!(?kind, bytes = data.len(), "partial render reply");
                    parse_errors += 1;
                }
                Err(e) => return Err(QueryError::Fatal(format!("bad render reply: {}", e))),
            }
        }
        Err(QueryError::Fatal(format!(
            "failed to receive {:?} render reply after {} timeouts, {} parse errors",
            kind, timeouts, parse_errors
        )))
    }

    async fn read_chunk(&mut self, player_number: u8) -> QueryResult<Vec<u8>> {
        let session = self
            .sessions
            .get_mut(&player_number)
            .ok_or_else(|| QueryError::Temporary("session vanished".into()))?;
        let mut buf = vec![0u8; 4096];
        match tokio::time::timeout(READ_TIMEOUT, session.stream.read(&mut buf)).await {
            Ok(Ok(0)) => {
                self.sessions.remove(&player_number);
                Err(QueryError::Temporary(format!(
                    "connection to player {} closed",
                    player_number
                )))
            }
            Ok(Ok(len)) => {
                buf.truncate(len);
                Ok(buf)
            }
            Ok(Err(e)) => {
                self.sessions.remove(&player_number);
                Err(QueryError::Temporary(format!("read failed: {}", e)))
            }
            Err(_) => {
                warn!(player_number, "socket receive timeout");
                Ok(Vec::new())
            }
        }
    }

    async fn send(&mut self, player_number: u8, data: &[u8]) -> QueryResult<()> {
        let session = self
            .sessions
            .get_mut(&player_number)
            .ok_or_else(|| QueryError::Temporary("session vanished".into()))?;
        match session.stream.write_all(data).await {
            Ok(()) => Ok(()),
            Err(e) => {
                // broken pipe: forget the session, retry gets a new one
                self.sessions.remove(&player_number);
                Err(QueryError::Temporary(format!(
                    "connection to player {} lost: {}",
                    player_number, e
                )))
            }
        }
    }

    async fn next_transaction_id(&mut self, player_number: u8) -> QueryResult<u32> {
        self.open_session(player_number).await?;
        let session = self
            .sessions
            .get_mut(&player_number)
            .ok_or_else(|| QueryError::Temporary("session vanished".into()))?;
        session.ttl = SESSION_TTL;
        let id = session.transaction_id;
        session.transaction_id += 1;
        Ok(id)
    }

    async fn discover_port(&mut self, player_number: u8) -> QueryResult<SocketAddr> {
        if let Some(addr) = self.remote_ports.get(&player_number) {
            return Ok(*addr);
        }
        let ip = {
            let registry = self.registry.lock().unwrap();
            registry
                .player(player_number)
                .map(|p| p.ip_addr)
                .ok_or_else(|| {
                    QueryError::Temporary(format!("player {} unknown", player_number))
                })?
        };
        let mut stream = TcpStream::connect((ip, self.discovery_port))
            .await
            .map_err(QueryError::temporary)?;
        stream
            .write_all(&build_db_server_query())
            .await
            .map_err(QueryError::temporary)?;
        let mut reply = [0u8; 2];
        tokio::time::timeout(READ_TIMEOUT, stream.read_exact(&mut reply))
            .await
            .map_err(|_| QueryError::Temporary("port discovery timed out".into()))?
            .map_err(QueryError::temporary)?;
        let port = parse_db_server_reply(&reply).map_err(QueryError::fatal)?;
        let addr = SocketAddr::from((ip, port));
        info!(player_number, port, "db server port discovered");
        self.remote_ports.insert(player_number, addr);
        Ok(addr)
    }

    async fn open_session(&mut self, player_number: u8) -> QueryResult<()> {
        if self.sessions.contains_key(&player_number) {
            return Ok(());
        }
        let addr = self.discover_port(player_number).await?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(QueryError::temporary)?;
        self.sessions.insert(
            player_number,
            Session {
                stream,
                ttl: SESSION_TTL,
                transaction_id: 1,
            },
        );

        // connection hello: a bare int32 field, reply is tolerated even
        // if unparsable
        self.send(player_number, &DbField::U32(1).to_bytes()).await?;
        let _ = self.read_chunk(player_number).await?;

        // announce our player number
        let setup = DbMessage::new(
            0xfffffffe,
            MessageKind::Setup,
            vec![DbField::U32(self.query_player_number as u32)],
        );
        self.send(player_number, &setup.encode()).await?;
        let reply = self.receive_message(player_number).await?;
        info!(
            player_number,
            announced = reply.args.get(1).and_then(DbField::as_u32),
            "connected to db server"
        );
        Ok(())
    }
}

fn rows_value(messages: &[DbMessage]) -> QueryValue {
    QueryValue::Rows(parse_rows(messages))
}

fn blob_value(blob: Option<Vec<u8>>) -> QueryValue {
    match blob {
        Some(data) if !data.is_empty() => QueryValue::Blob(Arc::new(data)),
        _ => QueryValue::Unavailable,
    }
}

/// Color waveforms come back as an analysis tag smuggled over the live
/// protocol; run it through the tag parser to get the raw entries.
fn color_waveform_value(blob: Option<Vec<u8>>) -> QueryResult<QueryValue> {
    let Some(data) = blob else {
        return Ok(QueryValue::Unavailable);
    };
    if data.len() <= 4 {
        return Ok(QueryValue::Unavailable);
    }
    let tag = anlz::parse_single_tag(&data[4..])
        .map_err(|e| QueryError::Fatal(format!("bad color waveform payload: {}", e)))?;
    match tag {
        anlz::AnlzTag::ColorWaveform(entries)
        | anlz::AnlzTag::ColorPreviewWaveform(entries) => {
            Ok(QueryValue::Blob(Arc::new(entries)))
        }
        _ => Err(QueryError::Fatal(
            "color waveform reply carried an unexpected tag".into(),
        )),
    }
}

/// Folds a rendered metadata reply into one record.
fn fold_metadata(messages: &[DbMessage]) -> QueryValue {
    let mut metadata = TrackMetadata::default();
    let mut any = false;
    for row in parse_rows(messages) {
        for column in row.0 {
            metadata.apply_column(column);
            any = true;
        }
    }
    if any {
        QueryValue::Metadata(metadata)
    } else {
        QueryValue::Unavailable
    }
}

fn fold_mount_info(messages: &[DbMessage]) -> QueryValue {
    let mut info = MountInfo::default();
    let mut any = false;
    for row in parse_rows(messages) {
        for column in row.0 {
            match column {
                MenuColumn::MountPath(path) => {
                    info.mount_path = path;
                    any = true;
                }
                MenuColumn::Duration(v) => info.duration = v,
                MenuColumn::Bpm(v) => info.bpm = Some(v),
                MenuColumn::Title { track_id, .. } => info.track_id = track_id,
                _ => {}
            }
        }
    }
    if any {
        QueryValue::MountInfo(info)
    } else {
        QueryValue::Unavailable
    }
}

fn parse_rows(messages: &[DbMessage]) -> Vec<BrowseRow> {
    let mut rows = Vec::new();
    for message in messages {
        match message.kind {
            MessageKind::MenuHeader => continue,
            MessageKind::MenuFooter => break,
            MessageKind::MenuItem => {
                if let Some(columns) = columns_from_item(&message.args) {
                    rows.push(BrowseRow(columns));
                }
            }
            other => warn!(?other, "unexpected message in rendered list"),
        }
    }
    rows
}

/// Decodes one menu item's argument vector into its columns. The
/// argument layout is fixed across every observed list reply: two
/// leading ids, two strings, the metadata type code and a trailing
/// artwork id.
fn columns_from_item(args: &[DbField]) -> Option<Vec<MenuColumn>> {
    if args.len() < 9 {
        warn!(argument_count = args.len(), "menu item too short");
        return None;
    }
    let id1 = args[0].as_u32()?;
    let id2 = args[1].as_u32()?;
    let string1 = args[3].as_str()?.to_string();
    let string2 = args[5].as_str()?.to_string();
    let code = args[6].as_u32()? as u16;
    let id3 = args[8].as_u32()?;

    // composite "title and x" codes merge two columns into one row
    if code & 0x00ff == 0x04 && code > 0x00ff {
        let mut columns = vec![MenuColumn::Title {
            text: string1,
            track_id: id2,
            artist_id: id1,
            artwork_id: id3,
        }];
        match column_for_code(code >> 8, string2, id1, id1, id3) {
            Some(second) => columns.push(second),
            None => warn!(code, "second column of composite item not parseable"),
        }
        return Some(columns);
    }

    column_for_code(code, string1, id1, id2, id3).map(|column| vec![column])
}

fn column_for_code(
    code: u16,
    text: String,
    id1: u32,
    id2: u32,
    id3: u32,
) -> Option<MenuColumn> {
    let column = match code {
        0x0000 => MenuColumn::MountPath(text),
        0x0001 => MenuColumn::Folder { name: text, id: id2 },
        0x0002 => MenuColumn::Album { name: text, id: id2 },
        0x0003 => MenuColumn::Disc(id2),
        0x0004 => MenuColumn::Title {
            text,
            track_id: id2,
            artist_id: id1,
            artwork_id: id3,
        },
        0x0006 => MenuColumn::Genre { name: text, id: id2 },
        0x0007 => MenuColumn::Artist { name: text, id: id2 },
        0x0008 => MenuColumn::Playlist {
            name: text,
            id: id2,
            parent_id: id1,
        },
        0x000a => MenuColumn::Rating(id2),
        0x000b => MenuColumn::Duration(id2),
        0x000d => MenuColumn::Bpm(id2 as f64 / 100.0),
        0x000e => MenuColumn::Label { name: text, id: id2 },
        0x000f => MenuColumn::Key { name: text, id: id2 },
        0x0010 => MenuColumn::Bitrate(id2),
        0x0011 => MenuColumn::Year(id2),
        0x0013..=0x001b => MenuColumn::Color {
            color: TrackColor::from_id((code - 0x0013) as u8),
            text,
        },
        0x0023 => MenuColumn::Comment(text),
        0x0028 => MenuColumn::OriginalArtist { name: text, id: id2 },
        0x0029 => MenuColumn::Remixer { name: text, id: id2 },
        0x002a => MenuColumn::PlayCount(id2),
        0x002e => MenuColumn::DateAdded(text),
        // root menu category rows
        0x0080..=0x0098 => MenuColumn::MenuName {
            name: text,
            menu_id: id2,
        },
        0x00a0 => MenuColumn::All(text),
        other => {
            warn!(code = other, "unknown metadata type");
            return None;
        }
    };
    Some(column)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{BeatgridStore, PlayerRegistry};
    use prolink_core::packets::keepalive::{KeepaliveContent, KeepalivePacket};
    use prolink_core::packets::DeviceType;
    use prolink_core::DataStore;
    use std::net::Ipv4Addr;
    use std::time::Instant;
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    fn menu_item(code: u16, s1: &str, s2: &str, id1: u32, id2: u32, id3: u32) -> Vec<DbField> {
        vec![
            DbField::U32(id1),
            DbField::U32(id2),
            DbField::U32(0),
            DbField::String(s1.into()),
            DbField::U32(0),
            DbField::String(s2.into()),
            DbField::U32(code as u32),
            DbField::U32(0),
            DbField::U32(id3),
        ]
    }

    #[test]
    fn test_simple_column() {
        let columns =
            columns_from_item(&menu_item(0x0007, "Loopmasters", "", 0, 9, 0)).unwrap();
        assert_eq!(
            columns,
            vec![MenuColumn::Artist {
                name: "Loopmasters".into(),
                id: 9
            }]
        );
    }

    #[test]
    fn test_composite_title_and_artist() {
        let columns =
            columns_from_item(&menu_item(0x0704, "Demo Track 1", "Loopmasters", 9, 42, 17))
                .unwrap();
        assert_eq!(columns.len(), 2);
        assert_eq!(
            columns[0],
            MenuColumn::Title {
                text: "Demo Track 1".into(),
                track_id: 42,
                artist_id: 9,
                artwork_id: 17,
            }
        );
        assert_eq!(
            columns[1],
            MenuColumn::Artist {
                name: "Loopmasters".into(),
                id: 9
            }
        );
    }

    #[test]
    fn test_root_menu_column() {
        let columns =
            columns_from_item(&menu_item(0x0083, "\u{fffa}TRACK\u{fffb}", "", 0, 4, 0))
                .unwrap();
        assert_eq!(
            columns,
            vec![MenuColumn::MenuName {
                name: "\u{fffa}TRACK\u{fffb}".into(),
                menu_id: 4
            }]
        );
    }

    #[test]
    fn test_unknown_code_dropped() {
        assert!(columns_from_item(&menu_item(0x7777, "x", "", 0, 0, 0)).is_none());
    }

    #[test]
    fn test_metadata_fold_from_messages() {
        let messages = vec![
            DbMessage::new(1, MessageKind::MenuHeader, vec![]),
            DbMessage::new(1, MessageKind::MenuItem, menu_item(0x0704, "Song", "Artist", 9, 42, 3)),
            DbMessage::new(1, MessageKind::MenuItem, menu_item(0x0002, "Album", "", 0, 7, 0)),
            DbMessage::new(1, MessageKind::MenuItem, menu_item(0x000b, "", "", 0, 211, 0)),
            DbMessage::new(1, MessageKind::MenuFooter, vec![]),
        ];
        match fold_metadata(&messages) {
            QueryValue::Metadata(md) => {
                assert_eq!(md.title, "Song");
                assert_eq!(md.track_id, 42);
                assert_eq!(md.artist, "Artist");
                assert_eq!(md.album, "Album");
                assert_eq!(md.album_id, 7);
                assert_eq!(md.duration, 211);
            }
            other => panic!("unexpected value {:?}", std::mem::discriminant(&other)),
        }
    }

    fn registry_with_player(ip: Ipv4Addr) -> Arc<Mutex<PlayerRegistry>> {
        let (events, _events_rx) = mpsc::unbounded_channel();
        let (actions, _actions_rx) = mpsc::unbounded_channel();
        let beatgrids: BeatgridStore = Arc::new(DataStore::new(8));
        let mut registry = PlayerRegistry::new(events, actions, beatgrids);
        registry.ingest_keepalive(
            &KeepalivePacket {
                model: "XDJ-1000".into(),
                device_type: DeviceType::Cdj,
                content: KeepaliveContent::Status {
                    player_number: 2,
                    mac_addr: [0; 6],
                    ip_addr: ip,
                    device_count: 1,
                },
            },
            Instant::now(),
        );
        // leak the receivers so events do not error
        std::mem::forget(_events_rx);
        std::mem::forget(_actions_rx);
        Arc::new(Mutex::new(registry))
    }

    /// Scripted db server: port discovery plus a metadata exchange.
    async fn fake_db_server() -> u16 {
        let data_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let data_port = data_listener.local_addr().unwrap().port();
        let discovery_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let discovery_port = discovery_listener.local_addr().unwrap().port();

        tokio::spawn(async move {
            if let Ok((mut stream, _)) = discovery_listener.accept().await {
                let mut buf = [0u8; 64];
                let _ = stream.read(&mut buf).await;
                let _ = stream.write_all(&data_port.to_be_bytes()).await;
            }
        });

        tokio::spawn(async move {
            let (mut stream, _) = data_listener.accept().await.unwrap();
            let mut buf = vec![0u8; 8192];

            // hello field
            let _ = stream.read(&mut buf).await.unwrap();
            stream
                .write_all(&[0x11, 0, 0, 0, 1])
                .await
                .unwrap();

            // setup message
            let _ = stream.read(&mut buf).await.unwrap();
            let confirm = DbMessage::new(
                0xfffffffe,
                MessageKind::Success,
                vec![DbField::U32(0), DbField::U32(2)],
            );
            stream.write_all(&confirm.encode()).await.unwrap();

            // metadata request -> entry count
            let _ = stream.read(&mut buf).await.unwrap();
            let success = DbMessage::new(
                2,
                MessageKind::Success,
                vec![DbField::U32(0), DbField::U32(2)],
            );
            stream.write_all(&success.encode()).await.unwrap();

            // render -> header, two items, footer
            let _ = stream.read(&mut buf).await.unwrap();
            let mut reply = Vec::new();
            reply.extend(DbMessage::new(3, MessageKind::MenuHeader, vec![]).encode());
            reply.extend(
                DbMessage::new(
                    3,
                    MessageKind::MenuItem,
                    menu_item(0x0704, "Demo Track 1", "Loopmasters", 9, 42, 17),
                )
                .encode(),
            );
            reply.extend(
                DbMessage::new(3, MessageKind::MenuItem, menu_item(0x0002, "Demo Album", "", 0, 7, 0))
                    .encode(),
            );
            reply.extend(DbMessage::new(3, MessageKind::MenuFooter, vec![]).encode());
            stream.write_all(&reply).await.unwrap();
        });

        discovery_port
    }

    #[tokio::test]
    async fn test_metadata_query_against_scripted_server() {
        let discovery_port = fake_db_server().await;
        let registry = registry_with_player(Ipv4Addr::new(127, 0, 0, 1));
        let mut client = DbClient::new(registry, 0);
        client.set_discovery_port(discovery_port);

        let value = client
            .handle(2, PlayerSlot::Usb, &QueryKind::Metadata { track_id: 42 })
            .await
            .unwrap();
        match value {
            QueryValue::Metadata(md) => {
                assert_eq!(md.title, "Demo Track 1");
                assert_eq!(md.artist, "Loopmasters");
                assert_eq!(md.album, "Demo Album");
                assert_eq!(md.track_id, 42);
            }
            _ => panic!("expected metadata"),
        }
    }

    #[tokio::test]
    async fn test_unknown_player_is_temporary() {
        let registry = registry_with_player(Ipv4Addr::new(127, 0, 0, 1));
        let mut client = DbClient::new(registry, 0);
        let err = client
            .handle(9, PlayerSlot::Usb, &QueryKind::Metadata { track_id: 1 })
            .await
            .unwrap_err();
        assert!(err.is_temporary());
    }

    #[tokio::test]
    async fn test_session_ttl_expiry() {
        let registry = registry_with_player(Ipv4Addr::new(127, 0, 0, 1));
        let mut client = DbClient::new(registry, 0);
        // no sessions: sweep is a no-op
        client.gc();
        assert!(client.sessions.is_empty());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap())
            .await
            .unwrap();
        client.sessions.insert(
            2,
            Session {
                stream,
                ttl: SESSION_TTL,
                transaction_id: 1,
            },
        );

        // idle sweeps count the session down, then reap it
        for _ in 0..SESSION_TTL {
            client.gc();
            assert_eq!(client.sessions.len(), 1);
        }
        client.gc();
        assert!(client.sessions.is_empty());
    }
}
