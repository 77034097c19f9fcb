//! Chunked, pipelined file download with in-order reassembly.
//!
//! Reads complete out of order but are committed to the sink strictly
//! contiguously; the transfer is done exactly when the write offset
//! reaches the file size.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Instant;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::error::{NetError, Result};

/// Out-of-order block buffer. Blocks are keyed by offset and handed
/// back as soon as they extend the contiguous prefix.
pub(crate) struct Reassembly {
    write_offset: u64,
    blocks: BTreeMap<u64, Vec<u8>>,
}

impl Reassembly {
    pub fn new() -> Self {
        Reassembly {
            write_offset: 0,
            blocks: BTreeMap::new(),
        }
    }

    pub fn write_offset(&self) -> u64 {
        self.write_offset
    }

    /// Accepts one completed read and returns every block that is now
    /// committable, in offset order.
    pub fn insert(&mut self, offset: u64, data: Vec<u8>) -> Vec<Vec<u8>> {
        if offset < self.write_offset {
            warn!(offset, "block received twice, ignoring");
            return Vec::new();
        }
        self.blocks.insert(offset, data);
        let mut ready = Vec::new();
        while let Some(data) = self.blocks.remove(&self.write_offset) {
            self.write_offset += data.len() as u64;
            ready.push(data);
        }
        if !self.blocks.is_empty() {
            debug!(queued = self.blocks.len(), "blocks waiting for a gap to fill");
        }
        ready
    }
}

/// Where the downloaded bytes go.
pub(crate) enum Sink {
    Buffer(Vec<u8>),
    File { file: tokio::fs::File, path: PathBuf },
}

impl Sink {
    pub async fn buffer(size_hint: usize) -> Sink {
        Sink::Buffer(Vec::with_capacity(size_hint))
    }

    /// Refuses to overwrite an existing destination.
    pub async fn file(path: PathBuf) -> Result<Sink> {
        if tokio::fs::try_exists(&path).await? {
            return Err(NetError::FileExists(path));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = tokio::fs::File::create(&path).await?;
        Ok(Sink::File { file, path })
    }

    pub async fn commit(&mut self, data: &[u8]) -> Result<()> {
        match self {
            Sink::Buffer(buf) => buf.extend_from_slice(data),
            Sink::File { file, .. } => file.write_all(data).await?,
        }
        Ok(())
    }

    pub async fn finish(self) -> Result<DownloadOutcome> {
        match self {
            Sink::Buffer(buf) => Ok(DownloadOutcome::Buffer(buf)),
            Sink::File { mut file, path } => {
                file.flush().await?;
                Ok(DownloadOutcome::File(path))
            }
        }
    }
}

pub enum DownloadOutcome {
    Buffer(Vec<u8>),
    File(PathBuf),
}

/// Progress reporting at roughly 3% granularity.
pub(crate) struct Progress {
    size: u64,
    last_percent: i64,
    started: Instant,
}

impl Progress {
    pub fn new(size: u64) -> Self {
        Progress {
            size,
            last_percent: -4,
            started: Instant::now(),
        }
    }

    pub fn update(&mut self, offset: u64) {
        if self.size == 0 {
            return;
        }
        let percent = (100 * offset / self.size) as i64;
        if percent > self.last_percent + 3 {
            self.last_percent = percent;
            let elapsed = self.started.elapsed().as_secs_f64().max(1e-6);
            let speed = offset as f64 / elapsed / 1024.0 / 1024.0;
            info!(
                percent,
                offset,
                size = self.size,
                mib_per_s = format!("{:.2}", speed),
                "download progress"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reassembly_commits_in_order() {
        let mut reassembly = Reassembly::new();
        let mut committed: Vec<u8> = Vec::new();

        // chunks complete out of order: 200, 0, 100
        assert!(reassembly.insert(200, vec![3; 100]).is_empty());
        for block in reassembly.insert(0, vec![1; 100]) {
            committed.extend_from_slice(&block);
        }
        assert_eq!(committed.len(), 100);
        for block in reassembly.insert(100, vec![2; 100]) {
            committed.extend_from_slice(&block);
        }

        assert_eq!(committed.len(), 300);
        assert_eq!(reassembly.write_offset(), 300);
        assert!(committed[..100].iter().all(|&b| b == 1));
        assert!(committed[100..200].iter().all(|&b| b == 2));
        assert!(committed[200..].iter().all(|&b| b == 3));
    }

    #[test]
    fn test_reassembly_ignores_duplicates() {
        let mut reassembly = Reassembly::new();
        reassembly.insert(0, vec![1; 50]);
        assert_eq!(reassembly.write_offset(), 50);
        assert!(reassembly.insert(0, vec![9; 50]).is_empty());
        assert_eq!(reassembly.write_offset(), 50);
    }

    #[test]
    fn test_reassembly_handles_short_final_block() {
        let mut reassembly = Reassembly::new();
        reassembly.insert(0, vec![0; 100]);
        let ready = reassembly.insert(100, vec![0; 42]);
        assert_eq!(ready.len(), 1);
        assert_eq!(reassembly.write_offset(), 142);
    }

    #[tokio::test]
    async fn test_file_sink_refuses_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.pdb");
        tokio::fs::write(&path, b"present").await.unwrap();
        assert!(matches!(
            Sink::file(path).await,
            Err(NetError::FileExists(_))
        ));
    }

    #[tokio::test]
    async fn test_file_sink_writes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub/dir/data.bin");
        let mut sink = Sink::file(path.clone()).await.unwrap();
        sink.commit(b"hello ").await.unwrap();
        sink.commit(b"world").await.unwrap();
        match sink.finish().await.unwrap() {
            DownloadOutcome::File(written) => assert_eq!(written, path),
            _ => unreachable!(),
        }
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"hello world");
    }
}
