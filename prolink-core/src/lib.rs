//! prolink-core: Pioneer ProDJ Link codecs and file formats
//!
//! This crate provides the pure, I/O-free parts of the link client:
//! - the three UDP packet families (keepalive, beat, status)
//! - the TCP database protocol message envelope
//! - ONC-RPC / portmap / mount / NFSv2 wire structures
//! - export.pdb (DeviceSQL database) parsing - little-endian
//! - ANLZ analysis file parsing (.DAT, .EXT) - big-endian
//! - the LRU store caching query results
//!
//! Based on Deep Symmetry's reverse engineering notes.

pub mod anlz;
mod bytesio;
pub mod error;
pub mod grid;
pub mod packets;
pub mod pdb;
pub mod store;

pub use error::{Error, Result};
pub use grid::GridBeat;
pub use packets::{DeviceType, PlayerSlot, TrackAnalyzeType};
pub use store::DataStore;
