//! Asynchronous NFSv2 client fetching exported files from players.
//!
//! The players expose their storage through portmap + mount + NFSv2
//! over UDP. Whole-file downloads pipeline a bounded window of read
//! requests and reassemble the out-of-order completions; see
//! [`download`] for the reassembly rules.

mod download;
mod rpc;

pub use download::DownloadOutcome;

use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;

use tokio::task::JoinSet;
use tracing::{debug, warn};

use prolink_core::packets::rpc::{
    self as wire, Fhandle, MountProcedure, NfsProcedure, RpcProgram, MOUNT_VERSION, NFS_VERSION,
    PORTMAP_PORT, PORTMAP_VERSION,
};
use prolink_core::packets::PlayerSlot;

use crate::error::{NetError, Result};
use download::{Progress, Reassembly, Sink};

/// Chunk size staying under the common MTU; larger reads get fragmented
/// by the players and start failing under load.
const DOWNLOAD_CHUNK_SIZE: u32 = 1350;

/// Reads kept in flight at once.
const MAX_IN_FLIGHT: usize = 5;

/// Per-read retry budget before the whole download fails.
const READ_RETRY_LIMIT: usize = 3;

/// Export path of each downloadable slot.
fn export_for_slot(slot: PlayerSlot) -> Result<&'static str> {
    match slot {
        PlayerSlot::Sd => Ok("/B/"),
        PlayerSlot::Usb => Ok("/C/"),
        other => Err(NetError::SlotNotDownloadable(other)),
    }
}

#[derive(Clone)]
pub struct NfsClient {
    rpc: rpc::RpcClient,
}

impl NfsClient {
    pub async fn new() -> Result<Self> {
        Ok(NfsClient {
            rpc: rpc::RpcClient::new().await?,
        })
    }

    async fn getport(&self, ip: Ipv4Addr, prog: RpcProgram, vers: u32) -> Result<u16> {
        let args = wire::build_getport_args(prog, vers);
        let reply = self
            .rpc
            .call(
                SocketAddr::from((ip, PORTMAP_PORT)),
                RpcProgram::Portmap,
                PORTMAP_VERSION,
                wire::PortmapProcedure::Getport as u32,
                &args,
            )
            .await?;
        let port = wire::parse_getport_reply(&reply)?;
        if port == 0 {
            return Err(NetError::Rpc(format!(
                "program {} not available on {}",
                prog.number(),
                ip
            )));
        }
        Ok(port as u16)
    }

    async fn mount(&self, host: SocketAddr, export: &str) -> Result<Fhandle> {
        let args = wire::build_mnt_args(export);
        let reply = self
            .rpc
            .call(
                host,
                RpcProgram::Mount,
                MOUNT_VERSION,
                MountProcedure::Mnt as u32,
                &args,
            )
            .await?;
        Ok(wire::parse_mnt_reply(&reply)?)
    }

    /// Resolves a '/'-separated path component by component.
    async fn lookup_path(
        &self,
        host: SocketAddr,
        mount_handle: Fhandle,
        path: &str,
    ) -> Result<wire::LookupReply> {
        let mut current = wire::LookupReply {
            fhandle: mount_handle,
            attributes: blank_attributes(),
        };
        for component in path.split('/').filter(|c| !c.is_empty()) {
            debug!(component, "nfs lookup");
            let args = wire::build_lookup_args(&current.fhandle, component);
            let reply = self
                .rpc
                .call(
                    host,
                    RpcProgram::Nfs,
                    NFS_VERSION,
                    NfsProcedure::Lookup as u32,
                    &args,
                )
                .await?;
            current = wire::parse_lookup_reply(&reply)?;
        }
        Ok(current)
    }

    async fn read(
        &self,
        host: SocketAddr,
        fhandle: &Fhandle,
        offset: u32,
        count: u32,
    ) -> Result<Vec<u8>> {
        let args = wire::build_read_args(fhandle, offset, count);
        let reply = self
            .rpc
            .call(
                host,
                RpcProgram::Nfs,
                NFS_VERSION,
                NfsProcedure::Read as u32,
                &args,
            )
            .await?;
        Ok(wire::parse_read_reply(&reply)?)
    }

    /// One chunk with a bounded retry budget; only timeouts are
    /// retried, protocol errors fail immediately.
    async fn read_with_retries(
        &self,
        host: SocketAddr,
        fhandle: Fhandle,
        offset: u32,
        count: u32,
    ) -> Result<Vec<u8>> {
        let mut attempt = 0;
        loop {
            match self.read(host, &fhandle, offset, count).await {
                Ok(data) => return Ok(data),
                Err(NetError::Timeout(what)) => {
                    attempt += 1;
                    if attempt > READ_RETRY_LIMIT {
                        return Err(NetError::DownloadFailed(format!(
                            "read at offset {} timed out {} times ({})",
                            offset, attempt, what
                        )));
                    }
                    warn!(offset, attempt, "read timed out, retrying");
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Downloads `src_path` from a player slot into an in-memory buffer.
    pub async fn download_buffer(
        &self,
        ip: Ipv4Addr,
        slot: PlayerSlot,
        src_path: &str,
    ) -> Result<Vec<u8>> {
        match self.download(ip, slot, src_path, None).await? {
            DownloadOutcome::Buffer(data) => Ok(data),
            DownloadOutcome::File(_) => unreachable!("buffer download returned a file"),
        }
    }

    /// Downloads `src_path` from a player slot into `dst_path`, which
    /// must not exist yet.
    pub async fn download_file(
        &self,
        ip: Ipv4Addr,
        slot: PlayerSlot,
        src_path: &str,
        dst_path: PathBuf,
    ) -> Result<PathBuf> {
        match self.download(ip, slot, src_path, Some(dst_path)).await? {
            DownloadOutcome::File(path) => Ok(path),
            DownloadOutcome::Buffer(_) => unreachable!("file download returned a buffer"),
        }
    }

    async fn download(
        &self,
        ip: Ipv4Addr,
        slot: PlayerSlot,
        src_path: &str,
        dst_path: Option<PathBuf>,
    ) -> Result<DownloadOutcome> {
        let export = export_for_slot(slot)?;
        debug!(%ip, %slot, src_path, "starting download");

        let mount_port = self.getport(ip, RpcProgram::Mount, MOUNT_VERSION).await?;
        let nfs_port = self.getport(ip, RpcProgram::Nfs, NFS_VERSION).await?;
        debug!(mount_port, nfs_port, "resolved rpc ports");

        let mount_host = SocketAddr::from((ip, mount_port));
        let nfs_host = SocketAddr::from((ip, nfs_port));
        let mount_handle = self.mount(mount_host, export).await?;

        let target = self.lookup_path(nfs_host, mount_handle, src_path).await?;
        let size = target.attributes.size as u64;

        let mut sink = match dst_path {
            Some(path) => Sink::file(path).await?,
            None => Sink::buffer(size as usize).await,
        };
        if size == 0 {
            return sink.finish().await;
        }

        let mut reassembly = Reassembly::new();
        let mut progress = Progress::new(size);
        let mut read_offset: u64 = 0;
        let mut tasks: JoinSet<(u64, Result<Vec<u8>>)> = JoinSet::new();

        while reassembly.write_offset() < size {
            while tasks.len() < MAX_IN_FLIGHT && read_offset < size {
                let chunk = DOWNLOAD_CHUNK_SIZE.min((size - read_offset) as u32);
                let client = self.clone();
                let fhandle = target.fhandle;
                let offset = read_offset;
                tasks.spawn(async move {
                    let result = client
                        .read_with_retries(nfs_host, fhandle, offset as u32, chunk)
                        .await;
                    (offset, result)
                });
                read_offset += chunk as u64;
            }

            let Some(joined) = tasks.join_next().await else {
                break;
            };
            let (offset, result) = joined.map_err(|e| NetError::DownloadFailed(e.to_string()))?;
            let data = result?;
            if data.is_empty() {
                return Err(NetError::DownloadFailed(format!(
                    "empty read at offset {}",
                    offset
                )));
            }
            for block in reassembly.insert(offset, data) {
                sink.commit(&block).await?;
            }
            progress.update(reassembly.write_offset());
        }

        if reassembly.write_offset() != size {
            return Err(NetError::DownloadFailed(format!(
                "download ended at {} of {} bytes",
                reassembly.write_offset(),
                size
            )));
        }
        sink.finish().await
    }
}

fn blank_attributes() -> wire::NfsAttributes {
    wire::NfsAttributes {
        file_type: 0,
        mode: 0,
        nlink: 0,
        uid: 0,
        gid: 0,
        size: 0,
        blocksize: 0,
        rdev: 0,
        blocks: 0,
        fsid: 0,
        fileid: 0,
        atime: wire::NfsTime {
            seconds: 0,
            useconds: 0,
        },
        mtime: wire::NfsTime {
            seconds: 0,
            useconds: 0,
        },
        ctime: wire::NfsTime {
            seconds: 0,
            useconds: 0,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_export_paths() {
        assert_eq!(export_for_slot(PlayerSlot::Sd).unwrap(), "/B/");
        assert_eq!(export_for_slot(PlayerSlot::Usb).unwrap(), "/C/");
        assert!(export_for_slot(PlayerSlot::Cd).is_err());
        assert!(export_for_slot(PlayerSlot::Rekordbox).is_err());
    }
}
