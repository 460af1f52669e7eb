// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `TransportMux` (§4.5): per session, per track, a [`ReadSide`]/[`WriteSide`]
//! pair over one of the three interchangeable substrates (UDP unicast, UDP
//! multicast, TCP-interleaved), plus the [`write_queue`] that serialises
//! outbound media against everything else on the connection.

pub mod tcp;
pub mod udp;
pub mod write_queue;

use bytes::Bytes;
use tokio::io::AsyncWrite;

use crate::Error;

pub use write_queue::{WriteQueueReceiver, WriteQueueSender};

/// One track's outbound item, queued by user code or a periodic RTCP
/// reporter and drained by [`run_writer`].
#[derive(Debug, Clone)]
pub enum OutboundPacket {
    Rtp(Bytes),
    Rtcp(Bytes),
}

/// One track's write path, regardless of which substrate SETUP negotiated.
pub enum WriteSide<W> {
    Udp(udp::UdpSubstrate),
    UdpMulticast(udp::MulticastSubstrate),
    Tcp(tcp::TcpSubstrate<W>),
}

impl<W: AsyncWrite + Unpin> WriteSide<W> {
    pub async fn write_rtp(&self, data: &[u8]) -> Result<(), Error> {
        match self {
            WriteSide::Udp(u) => u.send_rtp(data).await.map_err(|e| crate::wrap!(crate::ErrorInt::Io(e))),
            WriteSide::UdpMulticast(_) => {
                // Multicast sends go through the per-reader listener addresses
                // the distributor tracks, not a single fixed peer; handled by
                // the caller, which has that context. A bare write here would
                // have no destination to target.
                Err(crate::wrap!(crate::ErrorInt::Transport {
                    conn_ctx: crate::ConnectionContext::dummy(),
                    description: "multicast writes must go through the distributor".to_owned(),
                }))
            }
            WriteSide::Tcp(t) => t.write_rtp(data).await,
        }
    }

    pub async fn write_rtcp(&self, data: &[u8]) -> Result<(), Error> {
        match self {
            WriteSide::Udp(u) => u.send_rtcp(data).await.map_err(|e| crate::wrap!(crate::ErrorInt::Io(e))),
            WriteSide::UdpMulticast(_) => Err(crate::wrap!(crate::ErrorInt::Transport {
                conn_ctx: crate::ConnectionContext::dummy(),
                description: "multicast writes must go through the distributor".to_owned(),
            })),
            WriteSide::Tcp(t) => t.write_rtcp(data).await,
        }
    }
}

/// One track's read path. TCP has nothing of its own to poll: interleaved
/// frames arrive through the connection's shared `MessageFramer` and are
/// demultiplexed by `channel_id`.
pub enum ReadSide {
    Udp(udp::UdpSubstrate),
    UdpMulticast(udp::MulticastSubstrate),
    Tcp { channel_id: u8 },
}

/// Drains `queue`, writing each item to `side` until the queue's senders are
/// all dropped or a write fails. Runs as the dedicated writer task per
/// track/session described in §4.5.
pub async fn run_writer<W: AsyncWrite + Unpin>(mut queue: WriteQueueReceiver<OutboundPacket>, side: WriteSide<W>) {
    while let Some(pkt) = queue.pop().await {
        let result = match &pkt {
            OutboundPacket::Rtp(data) => side.write_rtp(data).await,
            OutboundPacket::Rtcp(data) => side.write_rtcp(data).await,
        };
        if let Err(e) = result {
            log::warn!("transport write failed, stopping writer task: {}", e);
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::Mutex as AsyncMutex;

    #[tokio::test]
    async fn run_writer_drains_queue_over_tcp() {
        let (client, mut server) = tokio::io::duplex(1024);
        let writer = Arc::new(AsyncMutex::new(client));
        let side = WriteSide::Tcp(tcp::TcpSubstrate::new(writer, (0, 1)));
        let (tx, rx) = write_queue::bounded::<OutboundPacket>(8);
        tx.push(OutboundPacket::Rtp(Bytes::from_static(b"abc"))).unwrap();
        drop(tx);

        run_writer(rx, side).await;

        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 7];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x24, 0, 0, 3, b'a', b'b', b'c']);
    }
}
