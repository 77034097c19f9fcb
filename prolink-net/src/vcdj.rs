//! The synthetic player identity we present on the link.
//!
//! Players only answer queries from peers that announce themselves, so
//! a keepalive goes out every 1.5 seconds. The same identity is used to
//! source link info queries, remote load commands and fader start
//! packets. No protocol state lives here.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::UdpSocket;
use tracing::{debug, warn};

use prolink_core::packets::beat::{BeatContent, BeatPacket, FaderCommand};
use prolink_core::packets::keepalive::{KeepaliveContent, KeepalivePacket};
use prolink_core::packets::status::{LinkQuery, LoadCmd, StatusContent, StatusPacket};
use prolink_core::packets::{DeviceType, PlayerSlot, BEAT_PORT, KEEPALIVE_PORT, STATUS_PORT};

use crate::error::Result;

pub const ANNOUNCE_INTERVAL: Duration = Duration::from_millis(1500);

#[derive(Clone)]
pub struct VirtualCdj {
    pub player_number: u8,
    pub model: String,
    ip_addr: Ipv4Addr,
    mac_addr: [u8; 6],
    broadcast: Ipv4Addr,
    keepalive_sock: Arc<UdpSocket>,
    beat_sock: Arc<UdpSocket>,
    status_sock: Arc<UdpSocket>,
}

impl VirtualCdj {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        player_number: u8,
        model: String,
        ip_addr: Ipv4Addr,
        mac_addr: [u8; 6],
        broadcast: Ipv4Addr,
        keepalive_sock: Arc<UdpSocket>,
        beat_sock: Arc<UdpSocket>,
        status_sock: Arc<UdpSocket>,
    ) -> Self {
        VirtualCdj {
            player_number,
            model,
            ip_addr,
            mac_addr,
            broadcast,
            keepalive_sock,
            beat_sock,
            status_sock,
        }
    }

    fn announce_packet(&self) -> Vec<u8> {
        KeepalivePacket {
            model: self.model.clone(),
            device_type: DeviceType::Cdj,
            content: KeepaliveContent::Status {
                player_number: self.player_number,
                mac_addr: self.mac_addr,
                ip_addr: self.ip_addr,
                device_count: 1,
            },
        }
        .encode()
    }

    pub async fn announce(&self) -> Result<()> {
        let target = SocketAddr::from((self.broadcast, KEEPALIVE_PORT));
        self.keepalive_sock
            .send_to(&self.announce_packet(), target)
            .await?;
        Ok(())
    }

    /// Broadcasts our presence until cancelled.
    pub async fn run(self) {
        let mut interval = tokio::time::interval(ANNOUNCE_INTERVAL);
        loop {
            interval.tick().await;
            if let Err(e) = self.announce().await {
                warn!(error = %e, "keepalive announcement failed");
            }
        }
    }

    /// Asks a player for the storage info of one slot; the answer comes
    /// back as a link reply status packet.
    pub async fn query_link_info(
        &self,
        player_ip: Ipv4Addr,
        player_number: u8,
        slot: PlayerSlot,
    ) -> Result<()> {
        let packet = StatusPacket {
            model: self.model.clone(),
            player_number: self.player_number,
            content: StatusContent::LinkQuery(LinkQuery {
                source_ip: self.ip_addr,
                remote_player_number: player_number,
                slot,
            }),
        };
        debug!(player_number, %slot, "querying link info");
        self.status_sock
            .send_to(&packet.encode(), SocketAddr::from((player_ip, STATUS_PORT)))
            .await?;
        Ok(())
    }

    /// Commands a player to load a track from some player's storage.
    pub async fn command_load_track(
        &self,
        player_ip: Ipv4Addr,
        load_player_number: u8,
        load_slot: PlayerSlot,
        load_track_id: u32,
    ) -> Result<()> {
        let packet = StatusPacket {
            model: self.model.clone(),
            // our own number, so the confirmation comes back to us
            player_number: self.player_number,
            content: StatusContent::LoadCmd(LoadCmd {
                load_player_number,
                load_slot,
                load_track_id,
            }),
        };
        self.status_sock
            .send_to(&packet.encode(), SocketAddr::from((player_ip, STATUS_PORT)))
            .await?;
        Ok(())
    }

    /// Starts or stops players via fader start, one command per channel.
    pub async fn command_fader_start(&self, commands: [FaderCommand; 4]) -> Result<()> {
        let packet = BeatPacket {
            model: self.model.clone(),
            player_number: self.player_number,
            content: BeatContent::FaderStart { player: commands },
        };
        self.beat_sock
            .send_to(
                &packet.encode(),
                SocketAddr::from((self.broadcast, BEAT_PORT)),
            )
            .await?;
        Ok(())
    }

    /// Single-channel convenience wrapper around fader start.
    pub async fn command_fader_start_single(
        &self,
        player_number: u8,
        start: bool,
    ) -> Result<()> {
        let mut commands = [FaderCommand::Ignore; 4];
        if (1..=4).contains(&player_number) {
            commands[player_number as usize - 1] = if start {
                FaderCommand::Start
            } else {
                FaderCommand::Stop
            };
        }
        self.command_fader_start(commands).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vcdj(socks: (Arc<UdpSocket>, Arc<UdpSocket>, Arc<UdpSocket>)) -> VirtualCdj {
        VirtualCdj::new(
            5,
            "Virtual CDJ".into(),
            Ipv4Addr::new(192, 168, 1, 5),
            [2, 0, 0, 0, 0, 5],
            Ipv4Addr::new(192, 168, 1, 255),
            socks.0,
            socks.1,
            socks.2,
        )
    }

    async fn loopback_socket() -> Arc<UdpSocket> {
        Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap())
    }

    #[tokio::test]
    async fn test_announce_packet_decodes() {
        let socks = (
            loopback_socket().await,
            loopback_socket().await,
            loopback_socket().await,
        );
        let v = vcdj(socks);
        let packet = KeepalivePacket::decode(&v.announce_packet()).unwrap();
        match packet.content {
            KeepaliveContent::Status { player_number, .. } => assert_eq!(player_number, 5),
            other => panic!("unexpected content {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_link_query_hits_the_wire() {
        let receiver = loopback_socket().await;
        let receiver_addr = receiver.local_addr().unwrap();
        let socks = (
            loopback_socket().await,
            loopback_socket().await,
            loopback_socket().await,
        );
        let v = vcdj(socks);

        // aim at the test receiver instead of a player
        let packet = StatusPacket {
            model: v.model.clone(),
            player_number: v.player_number,
            content: StatusContent::LinkQuery(LinkQuery {
                source_ip: Ipv4Addr::new(192, 168, 1, 5),
                remote_player_number: 2,
                slot: PlayerSlot::Usb,
            }),
        };
        v.status_sock
            .send_to(&packet.encode(), receiver_addr)
            .await
            .unwrap();

        let mut buf = [0u8; 256];
        let (len, _) = receiver.recv_from(&mut buf).await.unwrap();
        let decoded = StatusPacket::decode(&buf[..len]).unwrap();
        assert!(matches!(decoded.content, StatusContent::LinkQuery(_)));
    }
}
