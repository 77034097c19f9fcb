//! UDP RPC transport with xid-based reply demultiplexing.
//!
//! One socket serves every in-flight call: a receiver task parses
//! replies and completes the matching oneshot. Calls carry their own
//! timeout; a pending entry is removed when its call completes, times
//! out or is dropped, so abandoned futures do not leak.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use prolink_core::packets::rpc::{self, RpcProgram, RpcReplyBody};

use crate::error::{NetError, Result};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

type Pending = Arc<Mutex<HashMap<u32, oneshot::Sender<Result<Vec<u8>>>>>>;

#[derive(Clone)]
pub struct RpcClient {
    sock: Arc<UdpSocket>,
    pending: Pending,
    xid: Arc<AtomicU32>,
    auth_stamp: u32,
    timeout: Duration,
    /// Keeps the receiver task alive exactly as long as any clone of
    /// this client; dropping the last clone stops it and releases the
    /// socket.
    _receiver: Arc<AbortOnDrop>,
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Removes the pending entry when a call future goes away without an
/// answer.
struct PendingGuard {
    pending: Pending,
    xid: u32,
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.lock().unwrap().remove(&self.xid);
    }
}

impl RpcClient {
    pub async fn new() -> Result<Self> {
        let sock = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        let recv_sock = sock.clone();
        let recv_pending = pending.clone();
        let receiver = tokio::spawn(async move {
            receiver_loop(recv_sock, recv_pending).await;
        });

        Ok(RpcClient {
            sock,
            pending,
            xid: Arc::new(AtomicU32::new(1)),
            auth_stamp: 0xdeadbeef,
            timeout: REQUEST_TIMEOUT,
            _receiver: Arc::new(AbortOnDrop(receiver)),
        })
    }

    #[cfg(test)]
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    fn next_xid(&self) -> u32 {
        self.xid.fetch_add(1, Ordering::Relaxed)
    }

    /// One RPC round trip. Times out with a typed error; the reply is
    /// the raw procedure result.
    pub async fn call(
        &self,
        host: SocketAddr,
        prog: RpcProgram,
        vers: u32,
        proc: u32,
        args: &[u8],
    ) -> Result<Vec<u8>> {
        let xid = self.next_xid();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(xid, tx);
        let _guard = PendingGuard {
            pending: self.pending.clone(),
            xid,
        };

        let datagram = rpc::build_call(xid, prog, vers, proc, self.auth_stamp, args);
        self.sock.send_to(&datagram, host).await?;

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(NetError::Rpc("reply channel closed".into())),
            Err(_) => Err(NetError::Timeout(format!(
                "rpc call to {} (prog {})",
                host,
                prog.number()
            ))),
        }
    }
}

async fn receiver_loop(sock: Arc<UdpSocket>, pending: Pending) {
    let mut buf = vec![0u8; 65536];
    loop {
        let len = match sock.recv(&mut buf).await {
            Ok(len) => len,
            Err(e) => {
                warn!(error = %e, "rpc receive failed");
                continue;
            }
        };
        let reply = match rpc::parse_reply(&buf[..len]) {
            Ok(reply) => reply,
            Err(e) => {
                warn!(error = %e, "failed to parse rpc reply");
                continue;
            }
        };
        let Some(tx) = pending.lock().unwrap().remove(&reply.xid) else {
            debug!(xid = reply.xid, "reply for unknown or expired xid");
            continue;
        };
        let outcome = match reply.body {
            RpcReplyBody::Success(payload) => Ok(payload),
            RpcReplyBody::Denied { reject_stat } => Err(NetError::Rpc(format!(
                "call denied with status {}",
                reject_stat
            ))),
            RpcReplyBody::Unsuccessful { accept_stat } => Err(NetError::Rpc(format!(
                "call unsuccessful with status {}",
                accept_stat
            ))),
        };
        // the caller may have timed out and dropped the receiver
        let _ = tx.send(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prolink_core::packets::rpc::PORTMAP_VERSION;

    /// Minimal portmap responder answering every call with port 2049.
    async fn fake_portmap() -> SocketAddr {
        let sock = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = sock.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 1024];
            while let Ok((_len, peer)) = sock.recv_from(&mut buf).await {
                let xid = u32::from_be_bytes(buf[0..4].try_into().unwrap());
                let mut reply = Vec::new();
                reply.extend_from_slice(&xid.to_be_bytes());
                reply.extend_from_slice(&1u32.to_be_bytes()); // reply
                reply.extend_from_slice(&0u32.to_be_bytes()); // accepted
                reply.extend_from_slice(&0u32.to_be_bytes()); // null verf
                reply.extend_from_slice(&0u32.to_be_bytes());
                reply.extend_from_slice(&0u32.to_be_bytes()); // success
                reply.extend_from_slice(&2049u32.to_be_bytes());
                let _ = sock.send_to(&reply, peer).await;
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_call_roundtrip() {
        let server = fake_portmap().await;
        let client = RpcClient::new().await.unwrap();
        let args = rpc::build_getport_args(RpcProgram::Nfs, 2);
        let reply = client
            .call(server, RpcProgram::Portmap, PORTMAP_VERSION, 3, &args)
            .await
            .unwrap();
        assert_eq!(rpc::parse_getport_reply(&reply).unwrap(), 2049);
    }

    #[tokio::test]
    async fn test_timeout_and_pending_cleanup() {
        // nothing listens here
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();
        let mut client = RpcClient::new().await.unwrap();
        client.set_timeout(Duration::from_millis(50));
        let result = client
            .call(addr, RpcProgram::Portmap, PORTMAP_VERSION, 3, &[])
            .await;
        assert!(matches!(result, Err(NetError::Timeout(_))));
        assert!(client.pending.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_calls_demultiplex() {
        let server = fake_portmap().await;
        let client = RpcClient::new().await.unwrap();
        let mut handles = Vec::new();
        for _ in 0..8 {
            let client = client.clone();
            handles.push(tokio::spawn(async move {
                let args = rpc::build_getport_args(RpcProgram::Mount, 1);
                client
                    .call(server, RpcProgram::Portmap, PORTMAP_VERSION, 3, &args)
                    .await
            }));
        }
        for handle in handles {
            assert!(handle.await.unwrap().is_ok());
        }
    }
}
