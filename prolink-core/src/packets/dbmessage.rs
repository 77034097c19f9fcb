//! The TCP database protocol message envelope.
//!
//! Every message is a sequence of self-typed fields: a magic int32, a
//! transaction id, a u16 message kind, an argument count, a 12-byte
//! packed argument-type vector and the arguments themselves. The
//! argument count and type vector are always rebuilt from the actual
//! argument list on encode; stored counts are never trusted.
//!
//! Replies to a render request arrive as many concatenated messages
//! which are parsed greedily until a menu footer or input exhaustion.

use serde::{Deserialize, Serialize};

use crate::bytesio::{ByteReader, ByteWriter};
use crate::error::{Error, Result};

/// Udp port answering the db server port discovery query.
pub const DB_SERVER_QUERY_PORT: u16 = 12523;

/// Message magic, carried as the first int32 field.
pub const DB_MESSAGE_MAGIC: u32 = 0x872349ae;

/// Resource ids for `Nxs2ExtRequest` sub-requests.
pub const NXS2_ID_COLOR_PREVIEW_WAVEFORM: u32 = 0x34565750; // "4VWP"
pub const NXS2_ID_COLOR_WAVEFORM: u32 = 0x35565750; // "5VWP"
pub const NXS2_ID_EXT: u32 = 0x00545845; // "TXE"

/// Builds the fixed query sent to port 12523 to discover the db port.
pub fn build_db_server_query() -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(20);
    w.u32_be(0x0f);
    w.bytes(b"RemoteDBServer\0");
    w.into_vec()
}

/// Parses the two-byte port announcement reply.
pub fn parse_db_server_reply(data: &[u8]) -> Result<u16> {
    ByteReader::new(data).u16_be()
}

/// A single typed protocol field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbField {
    U8(u8),
    U16(u16),
    U32(u32),
    String(String),
    Binary(Vec<u8>),
}

const FIELD_U8: u8 = 0x0f;
const FIELD_U16: u8 = 0x10;
const FIELD_U32: u8 = 0x11;
const FIELD_BINARY: u8 = 0x14;
const FIELD_STRING: u8 = 0x26;

impl DbField {
    pub(crate) fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        match r.u8()? {
            FIELD_U8 => Ok(DbField::U8(r.u8()?)),
            FIELD_U16 => Ok(DbField::U16(r.u16_be()?)),
            FIELD_U32 => Ok(DbField::U32(r.u32_be()?)),
            FIELD_STRING => {
                let prefix = r.u32_be()?;
                if prefix == 0 {
                    return Err(Error::StringEncoding(
                        "zero-length string prefix".into(),
                    ));
                }
                // prefix counts utf-16 units plus one
                let byte_len = (prefix as usize - 1) * 2;
                let text = r.utf16_be(byte_len)?;
                r.skip(2)?;
                Ok(DbField::String(text))
            }
            FIELD_BINARY => {
                let len = r.u32_be()? as usize;
                Ok(DbField::Binary(r.take(len)?.to_vec()))
            }
            v => Err(Error::UnknownValue {
                what: "db field type",
                value: v as u64,
            }),
        }
    }

    pub(crate) fn encode(&self, w: &mut ByteWriter) {
        match self {
            DbField::U8(v) => {
                w.u8(FIELD_U8);
                w.u8(*v);
            }
            DbField::U16(v) => {
                w.u8(FIELD_U16);
                w.u16_be(*v);
            }
            DbField::U32(v) => {
                w.u8(FIELD_U32);
                w.u32_be(*v);
            }
            DbField::String(s) => {
                w.u8(FIELD_STRING);
                let units: Vec<u16> = s.encode_utf16().collect();
                w.u32_be(units.len() as u32 + 1);
                for unit in units {
                    w.u16_be(unit);
                }
                w.zeros(2);
            }
            DbField::Binary(data) => {
                w.u8(FIELD_BINARY);
                w.u32_be(data.len() as u32);
                w.bytes(data);
            }
        }
    }

    /// Wire form of one field outside a message envelope; the
    /// connection handshake sends a bare int32 field.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut w = ByteWriter::new();
        self.encode(&mut w);
        w.into_vec()
    }

    /// Parses one bare field from the start of `data`.
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::decode(&mut ByteReader::new(data))
    }

    /// Entry for the packed argument-type vector.
    fn arg_type_code(&self) -> u8 {
        match self {
            DbField::U8(_) => 0x04,
            DbField::U16(_) => 0x05,
            DbField::U32(_) => 0x06,
            DbField::Binary(_) => 0x03,
            DbField::String(_) => 0x02,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            DbField::U8(v) => Some(*v as u32),
            DbField::U16(v) => Some(*v as u32),
            DbField::U32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            DbField::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_binary(&self) -> Option<&[u8]> {
        match self {
            DbField::Binary(b) => Some(b),
            _ => None,
        }
    }
}

macro_rules! message_kinds {
    ($($name:ident = $code:expr,)*) => {
        /// Request and reply kinds of the db protocol.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        pub enum MessageKind {
            $($name,)*
        }

        impl MessageKind {
            pub fn from_code(code: u16) -> Result<Self> {
                match code {
                    $($code => Ok(MessageKind::$name),)*
                    v => Err(Error::UnknownValue {
                        what: "db message kind",
                        value: v as u64,
                    }),
                }
            }

            pub fn code(self) -> u16 {
                match self {
                    $(MessageKind::$name => $code,)*
                }
            }
        }
    };
}

message_kinds! {
    Setup = 0x0000,
    Invalid = 0x0001,
    Invalid2 = 0x0100,
    // list requests, cascading by appending id parameters
    RootMenuRequest = 0x1000,
    GenreRequest = 0x1001,
    ArtistRequest = 0x1002,
    AlbumRequest = 0x1003,
    TitleRequest = 0x1004,
    BpmRequest = 0x1006,
    RatingRequest = 0x1007,
    CenturyRequest = 0x1008,
    LabelRequest = 0x100a,
    ColorRequest = 0x100d,
    DurationRequest = 0x1010,
    BitrateRequest = 0x1011,
    HistoryRequest = 0x1012,
    FilenameRequest = 0x1013,
    ArtistByGenreRequest = 0x1101,
    AlbumByArtistRequest = 0x1102,
    TitleByAlbumRequest = 0x1103,
    PlaylistRequest = 0x1105,
    YearByCenturyRequest = 0x1108,
    ArtistByLabelRequest = 0x110a,
    TitleByColorRequest = 0x110d,
    TitleByDurationRequest = 0x1110,
    TitleByBitrateRequest = 0x1111,
    TitleByHistoryRequest = 0x1112,
    AlbumByGenreArtistRequest = 0x1201,
    TitleByArtistAlbumRequest = 0x1202,
    TitleByBpmRequest = 0x1206,
    TitleByCenturyYearRequest = 0x1208,
    AlbumByLabelArtistRequest = 0x120a,
    TitleByGenreArtistAlbumRequest = 0x1301,
    OriginalArtistRequest = 0x1302,
    TitleByLabelArtistAlbumRequest = 0x130a,
    AlbumByOriginalArtistRequest = 0x1402,
    TitleByOriginalArtistAlbumRequest = 0x1502,
    RemixerRequest = 0x1602,
    AlbumByRemixerRequest = 0x1702,
    TitleByRemixerAlbumRequest = 0x1802,
    // track specific requests
    HotCueBankRequest = 0x2001,
    MetadataRequest = 0x2002,
    ArtworkRequest = 0x2003,
    PreviewWaveformRequest = 0x2004,
    FolderRequest = 0x2006,
    MountInfoRequest = 0x2102,
    CuesRequest = 0x2104,
    TrackInfoRequest = 0x2202,
    BeatgridRequest = 0x2204,
    Unknown1Request = 0x2504,
    WaveformRequest = 0x2904,
    Unknown2Request = 0x2b04,
    Nxs2ExtRequest = 0x2c04,
    Render = 0x3000,
    Unknown3Request = 0x3100,
    // replies
    Success = 0x4000,
    MenuHeader = 0x4001,
    Artwork = 0x4002,
    InvalidRequest = 0x4003,
    MenuItem = 0x4101,
    MenuFooter = 0x4201,
    PreviewWaveform = 0x4402,
    Unknown1 = 0x4502,
    Beatgrid = 0x4602,
    Cues = 0x4702,
    Waveform = 0x4a02,
    Unknown2 = 0x4e02,
    Nxs2Ext = 0x4f02,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DbMessage {
    pub transaction_id: u32,
    pub kind: MessageKind,
    pub args: Vec<DbField>,
}

impl DbMessage {
    pub fn new(transaction_id: u32, kind: MessageKind, args: Vec<DbField>) -> Self {
        Self {
            transaction_id,
            kind,
            args,
        }
    }

    /// Decodes one message, returning it and the number of bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(Self, usize)> {
        let mut r = ByteReader::new(data);

        match DbField::decode(&mut r)? {
            DbField::U32(DB_MESSAGE_MAGIC) => {}
            _ => {
                return Err(Error::BadMagic {
                    what: "db message",
                })
            }
        }
        let transaction_id = match DbField::decode(&mut r)? {
            DbField::U32(v) => v,
            _ => {
                return Err(Error::UnknownValue {
                    what: "db transaction id field",
                    value: 0,
                })
            }
        };
        let kind = match DbField::decode(&mut r)? {
            DbField::U16(v) => MessageKind::from_code(v)?,
            _ => {
                return Err(Error::UnknownValue {
                    what: "db message kind field",
                    value: 0,
                })
            }
        };
        let argument_count = match DbField::decode(&mut r)? {
            DbField::U8(v) => v as usize,
            _ => {
                return Err(Error::UnknownValue {
                    what: "db argument count field",
                    value: 0,
                })
            }
        };
        // packed argument-type vector; the argument fields are
        // self-typed so the vector is not needed for decoding
        match DbField::decode(&mut r)? {
            DbField::Binary(_) => {}
            _ => {
                return Err(Error::UnknownValue {
                    what: "db argument type vector",
                    value: 0,
                })
            }
        }

        let mut args = Vec::with_capacity(argument_count);
        for _ in 0..argument_count {
            args.push(DbField::decode(&mut r)?);
        }

        Ok((
            DbMessage {
                transaction_id,
                kind,
                args,
            },
            r.position(),
        ))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = ByteWriter::with_capacity(64);
        DbField::U32(DB_MESSAGE_MAGIC).encode(&mut w);
        DbField::U32(self.transaction_id).encode(&mut w);
        DbField::U16(self.kind.code()).encode(&mut w);
        DbField::U8(self.args.len() as u8).encode(&mut w);

        let mut arg_types = [0u8; 12];
        for (slot, arg) in arg_types.iter_mut().zip(self.args.iter()) {
            *slot = arg.arg_type_code();
        }
        DbField::Binary(arg_types.to_vec()).encode(&mut w);

        for arg in &self.args {
            arg.encode(&mut w);
        }
        w.into_vec()
    }

    /// Parses a stream of concatenated messages until the input is
    /// exhausted. A partial trailing message surfaces as
    /// [`Error::Truncated`] so stream consumers can read more bytes and
    /// retry.
    pub fn decode_many(data: &[u8]) -> Result<Vec<DbMessage>> {
        let mut messages = Vec::new();
        let mut pos = 0;
        while pos < data.len() {
            let (message, consumed) = DbMessage::decode(&data[pos..])?;
            messages.push(message);
            pos += consumed;
        }
        Ok(messages)
    }
}
