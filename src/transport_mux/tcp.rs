// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! TCP-interleaved substrate (§4.5): RTP/RTCP share the RTSP connection's
//! byte stream as `InterleavedFrame`s on a consecutive channel pair. Writes
//! are serialised against RTSP writes on the same connection; here that's
//! modeled as a shared, mutex-guarded writer rather than a separate actor
//! task, since the RTSP side and the media side of one connection already
//! share a single `AsyncWrite` half.

use std::sync::Arc;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;

use crate::{bail, wrap, Error, ErrorInt};

const INTERLEAVED_MARKER: u8 = 0x24;

/// One track's TCP-interleaved read/write path. The RTP/RTCP channel ids
/// are always `(k, k+1)` with `k` even (§3's invariant; validated at SETUP
/// time by [`crate::transport::validate_channel_pair`]).
pub struct TcpSubstrate<W> {
    writer: Arc<AsyncMutex<W>>,
    channel: (u8, u8),
}

impl<W: AsyncWrite + Unpin> TcpSubstrate<W> {
    pub fn new(writer: Arc<AsyncMutex<W>>, channel: (u8, u8)) -> Self {
        Self { writer, channel }
    }

    pub fn channel(&self) -> (u8, u8) {
        self.channel
    }

    pub async fn write_rtp(&self, data: &[u8]) -> Result<(), Error> {
        self.write_channel(self.channel.0, data).await
    }

    pub async fn write_rtcp(&self, data: &[u8]) -> Result<(), Error> {
        self.write_channel(self.channel.1, data).await
    }

    async fn write_channel(&self, channel_id: u8, data: &[u8]) -> Result<(), Error> {
        if data.len() > u16::MAX as usize {
            bail!(ErrorInt::RtspDataMessageError {
                conn_ctx: crate::ConnectionContext::dummy(),
                msg_ctx: crate::RtspMessageContext::dummy(),
                channel_id,
                stream_id: 0,
                description: format!("interleaved frame of {} bytes exceeds u16 length field", data.len()),
            });
        }
        let mut header = [0u8; 4];
        header[0] = INTERLEAVED_MARKER;
        header[1] = channel_id;
        header[2..4].copy_from_slice(&(data.len() as u16).to_be_bytes());
        let mut w = self.writer.lock().await;
        w.write_all(&header).await.map_err(|e| wrap!(ErrorInt::Io(e)))?;
        w.write_all(data).await.map_err(|e| wrap!(ErrorInt::Io(e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn writes_frame_with_correct_header() {
        let (client, mut server) = tokio::io::duplex(1024);
        let writer = Arc::new(AsyncMutex::new(client));
        let sub = TcpSubstrate::new(writer, (0, 1));
        sub.write_rtp(b"abc").await.unwrap();

        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 7];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf, [0x24, 0, 0, 3, b'a', b'b', b'c']);
    }

    #[tokio::test]
    async fn rtcp_uses_odd_channel() {
        let (client, mut server) = tokio::io::duplex(1024);
        let writer = Arc::new(AsyncMutex::new(client));
        let sub = TcpSubstrate::new(writer, (4, 5));
        sub.write_rtcp(b"x").await.unwrap();

        use tokio::io::AsyncReadExt;
        let mut buf = [0u8; 5];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(buf[1], 5);
    }
}
