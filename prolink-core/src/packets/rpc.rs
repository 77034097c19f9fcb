//! ONC-RPC, portmap, mount and NFSv2 wire structures.
//!
//! Only the procedures the players' export service needs are covered:
//! portmap getport, mount mnt, nfs lookup/getattr/read. All integers
//! are big-endian per XDR; the call payload is padded to a 4-byte
//! boundary. Path components and export names go over the wire as
//! length-prefixed UTF-16LE, a vendor quirk.

use std::io::Cursor;

use binrw::{binrw, BinRead};
use serde::{Deserialize, Serialize};

use crate::bytesio::{ByteReader, ByteWriter};
use crate::error::{Error, Result};

pub const RPC_VERSION: u32 = 2;
pub const PORTMAP_PORT: u16 = 111;
pub const PORTMAP_VERSION: u32 = 2;
pub const MOUNT_VERSION: u32 = 1;
pub const NFS_VERSION: u32 = 2;

/// Protocol selector for portmap getport.
pub const PORTMAP_PROTOCOL_UDP: u32 = 17;

pub const FHANDLE_SIZE: usize = 32;
pub type Fhandle = [u8; FHANDLE_SIZE];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcProgram {
    Portmap,
    Nfs,
    Mount,
}

impl RpcProgram {
    pub fn number(self) -> u32 {
        match self {
            RpcProgram::Portmap => 100000,
            RpcProgram::Nfs => 100003,
            RpcProgram::Mount => 100005,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum PortmapProcedure {
    Getport = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MountProcedure {
    Mnt = 1,
    Umnt = 3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum NfsProcedure {
    Getattr = 1,
    Lookup = 4,
    Read = 6,
}

/// Builds a complete RPC call datagram with unix credentials and a null
/// verifier, the procedure arguments appended 4-byte aligned.
pub fn build_call(
    xid: u32,
    prog: RpcProgram,
    vers: u32,
    proc: u32,
    auth_stamp: u32,
    args: &[u8],
) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(56 + args.len());
    w.u32_be(xid);
    w.u32_be(0); // call
    w.u32_be(RPC_VERSION);
    w.u32_be(prog.number());
    w.u32_be(vers);
    w.u32_be(proc);
    // unix credentials: stamp, empty machine name, uid/gid 0, no gids
    w.u32_be(1);
    w.u32_be(20);
    w.u32_be(auth_stamp);
    w.u32_be(0);
    w.u32_be(0);
    w.u32_be(0);
    w.u32_be(0);
    // null verifier
    w.u32_be(0);
    w.u32_be(0);
    w.bytes(args);
    w.align(4);
    w.into_vec()
}

/// Reply status after RPC-level demultiplexing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RpcReplyBody {
    /// Accepted and successful; the payload is the procedure result.
    Success(Vec<u8>),
    /// The server rejected the call outright.
    Denied { reject_stat: u32 },
    /// Accepted but unsuccessful (program unavailable, garbage args, ...).
    Unsuccessful { accept_stat: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcReply {
    pub xid: u32,
    pub body: RpcReplyBody,
}

/// Parses an RPC reply datagram far enough to demultiplex by xid and
/// extract the procedure result.
pub fn parse_reply(data: &[u8]) -> Result<RpcReply> {
    let mut r = ByteReader::new(data);
    let xid = r.u32_be()?;
    if r.u32_be()? != 1 {
        return Err(Error::UnknownValue {
            what: "rpc message type",
            value: 0,
        });
    }
    let reply_stat = r.u32_be()?;
    if reply_stat != 0 {
        let reject_stat = r.u32_be().unwrap_or(0);
        return Ok(RpcReply {
            xid,
            body: RpcReplyBody::Denied { reject_stat },
        });
    }
    // verifier: flavor + opaque length + body
    r.skip(4)?;
    let verf_len = r.u32_be()? as usize;
    r.skip(verf_len)?;
    let accept_stat = r.u32_be()?;
    if accept_stat != 0 {
        return Ok(RpcReply {
            xid,
            body: RpcReplyBody::Unsuccessful { accept_stat },
        });
    }
    let payload = r.take(r.remaining())?.to_vec();
    Ok(RpcReply {
        xid,
        body: RpcReplyBody::Success(payload),
    })
}

fn write_utf16le_string(w: &mut ByteWriter, s: &str) {
    let units: Vec<u16> = s.encode_utf16().collect();
    w.u32_be(units.len() as u32 * 2);
    for unit in units {
        w.bytes(&unit.to_le_bytes());
    }
    w.align(4);
}

// ---------------------------------------------------------------------
// portmap

pub fn build_getport_args(prog: RpcProgram, vers: u32) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(16);
    w.u32_be(prog.number());
    w.u32_be(vers);
    w.u32_be(PORTMAP_PROTOCOL_UDP);
    w.u32_be(0);
    w.into_vec()
}

/// A port of 0 means the program is not registered on the peer.
pub fn parse_getport_reply(data: &[u8]) -> Result<u32> {
    ByteReader::new(data).u32_be()
}

// ---------------------------------------------------------------------
// mount

pub fn build_mnt_args(export: &str) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(16);
    write_utf16le_string(&mut w, export);
    w.into_vec()
}

pub fn parse_mnt_reply(data: &[u8]) -> Result<Fhandle> {
    let mut r = ByteReader::new(data);
    let status = r.u32_be()?;
    if status != 0 {
        return Err(Error::UnknownValue {
            what: "mount status",
            value: status as u64,
        });
    }
    let mut fhandle = [0u8; FHANDLE_SIZE];
    fhandle.copy_from_slice(r.take(FHANDLE_SIZE)?);
    Ok(fhandle)
}

// ---------------------------------------------------------------------
// nfs

#[binrw]
#[brw(big)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfsTime {
    pub seconds: u32,
    pub useconds: u32,
}

/// NFSv2 fattr. Only `size` matters to the downloader; the rest is kept
/// as received.
#[binrw]
#[brw(big)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfsAttributes {
    pub file_type: u32,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u32,
    pub blocksize: u32,
    pub rdev: u32,
    pub blocks: u32,
    pub fsid: u32,
    pub fileid: u32,
    pub atime: NfsTime,
    pub mtime: NfsTime,
    pub ctime: NfsTime,
}

const NFS_ATTRIBUTES_SIZE: usize = 17 * 4;

pub fn nfs_status_name(status: u32) -> &'static str {
    match status {
        0 => "ok",
        1 => "not owner",
        2 => "no such file or directory",
        5 => "io error",
        6 => "no such device or address",
        13 => "permission denied",
        17 => "file exists",
        19 => "no such device",
        20 => "not a directory",
        21 => "is a directory",
        27 => "file too large",
        28 => "no space left on device",
        30 => "read-only file system",
        63 => "file name too long",
        66 => "directory not empty",
        69 => "disk quota exceeded",
        70 => "stale file handle",
        99 => "write cache flushed",
        _ => "unknown error",
    }
}

fn read_nfs_status(r: &mut ByteReader<'_>) -> Result<()> {
    let status = r.u32_be()?;
    if status != 0 {
        return Err(Error::Nfs {
            status,
            message: nfs_status_name(status),
        });
    }
    Ok(())
}

pub fn build_lookup_args(fhandle: &Fhandle, name: &str) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(48 + name.len() * 2);
    w.bytes(fhandle);
    write_utf16le_string(&mut w, name);
    w.into_vec()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupReply {
    pub fhandle: Fhandle,
    pub attributes: NfsAttributes,
}

pub fn parse_lookup_reply(data: &[u8]) -> Result<LookupReply> {
    let mut r = ByteReader::new(data);
    read_nfs_status(&mut r)?;
    let mut fhandle = [0u8; FHANDLE_SIZE];
    fhandle.copy_from_slice(r.take(FHANDLE_SIZE)?);
    let attrs_raw = r.take(NFS_ATTRIBUTES_SIZE)?;
    let attributes = NfsAttributes::read(&mut Cursor::new(attrs_raw))?;
    Ok(LookupReply {
        fhandle,
        attributes,
    })
}

pub fn build_read_args(fhandle: &Fhandle, offset: u32, count: u32) -> Vec<u8> {
    let mut w = ByteWriter::with_capacity(44);
    w.bytes(fhandle);
    w.u32_be(offset);
    w.u32_be(count);
    w.u32_be(0); // totalcount, unused
    w.into_vec()
}

pub fn parse_read_reply(data: &[u8]) -> Result<Vec<u8>> {
    let mut r = ByteReader::new(data);
    read_nfs_status(&mut r)?;
    r.skip(NFS_ATTRIBUTES_SIZE)?;
    let len = r.u32_be()? as usize;
    Ok(r.take(len)?.to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_layout() {
        let call = build_call(7, RpcProgram::Portmap, PORTMAP_VERSION, 3, 0xdead, &[1, 2, 3]);
        assert_eq!(&call[0..4], &7u32.to_be_bytes());
        assert_eq!(&call[4..8], &[0; 4]); // call
        assert_eq!(&call[12..16], &100000u32.to_be_bytes());
        assert_eq!(&call[20..24], &3u32.to_be_bytes());
        // payload aligned to 4
        assert_eq!(call.len() % 4, 0);
    }

    #[test]
    fn test_reply_roundtrip() {
        // hand-built accepted/success reply with a null verifier
        let mut w = ByteWriter::new();
        w.u32_be(7);
        w.u32_be(1);
        w.u32_be(0);
        w.u32_be(0);
        w.u32_be(0);
        w.u32_be(0);
        w.bytes(&[0xaa, 0xbb]);
        let reply = parse_reply(&w.into_vec()).unwrap();
        assert_eq!(reply.xid, 7);
        assert_eq!(reply.body, RpcReplyBody::Success(vec![0xaa, 0xbb]));
    }

    #[test]
    fn test_reply_denied() {
        let mut w = ByteWriter::new();
        w.u32_be(9);
        w.u32_be(1);
        w.u32_be(1);
        w.u32_be(0);
        let reply = parse_reply(&w.into_vec()).unwrap();
        assert_eq!(reply.xid, 9);
        assert!(matches!(reply.body, RpcReplyBody::Denied { .. }));
    }

    #[test]
    fn test_mnt_args_are_utf16le() {
        let args = build_mnt_args("/C/");
        assert_eq!(&args[0..4], &6u32.to_be_bytes());
        assert_eq!(&args[4..10], &[b'/', 0, b'C', 0, b'/', 0]);
        assert_eq!(args.len() % 4, 0);
    }

    #[test]
    fn test_lookup_reply_parsing() {
        let mut w = ByteWriter::new();
        w.u32_be(0); // ok
        w.bytes(&[0x11; FHANDLE_SIZE]);
        w.u32_be(1); // file
        w.u32_be(0o644);
        w.u32_be(1);
        w.u32_be(0);
        w.u32_be(0);
        w.u32_be(123456); // size
        for _ in 0..5 {
            w.u32_be(0);
        }
        for _ in 0..3 {
            w.u32_be(0); // times
            w.u32_be(0);
        }
        let reply = parse_lookup_reply(&w.into_vec()).unwrap();
        assert_eq!(reply.fhandle, [0x11; FHANDLE_SIZE]);
        assert_eq!(reply.attributes.size, 123456);
    }

    #[test]
    fn test_read_reply_parsing() {
        let mut w = ByteWriter::new();
        w.u32_be(0);
        w.zeros(NFS_ATTRIBUTES_SIZE);
        w.u32_be(4);
        w.bytes(&[9, 8, 7, 6]);
        assert_eq!(parse_read_reply(&w.into_vec()).unwrap(), vec![9, 8, 7, 6]);
    }

    #[test]
    fn test_error_status_surfaces() {
        let mut w = ByteWriter::new();
        w.u32_be(70); // stale handle
        assert!(parse_read_reply(&w.into_vec()).is_err());
    }
}
