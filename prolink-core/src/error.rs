//! Error types for prolink-core

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The input ended before the structure was complete. Callers that
    /// accumulate bytes from a stream treat this as "read more and retry".
    #[error("truncated input: need {needed} more bytes at offset {offset}")]
    Truncated { offset: usize, needed: usize },

    #[error("bad magic in {what}")]
    BadMagic { what: &'static str },

    #[error("unknown value {value:#x} for {what}")]
    UnknownValue { what: &'static str, value: u64 },

    #[error("binary format error: {0}")]
    BinRw(String),

    #[error("string encoding error: {0}")]
    StringEncoding(String),

    #[error("database file error: {0}")]
    Database(String),

    #[error("nfs error {status}: {message}")]
    Nfs { status: u32, message: &'static str },

    #[error("analysis file error: {0}")]
    Analysis(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True when more input could turn this parse into a success.
    pub fn is_truncated(&self) -> bool {
        matches!(self, Error::Truncated { .. })
    }
}

impl From<binrw::Error> for Error {
    fn from(e: binrw::Error) -> Self {
        match e {
            binrw::Error::Io(io) => Error::Io(io),
            other => Error::BinRw(other.to_string()),
        }
    }
}
