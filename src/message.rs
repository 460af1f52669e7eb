// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The `MessageFramer` collaborator (§4.1): delimits RTSP text messages and
//! interleaved binary frames on one duplex byte stream, and serialises
//! outgoing messages to their canonical wire form.

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{bail, wrap, ConnectionContext, Error, ErrorInt, RtspMessageContext};

/// Leading byte that marks an interleaved binary frame rather than an RTSP
/// text message, per §3/§4.1.
const INTERLEAVED_MARKER: u8 = 0x24; // '$'

/// Default cap on a single RTSP message's header section or interleaved
/// frame payload; exceeding it is a fatal framing error, per §4.1.
const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// One RTP/RTCP frame carried inline on the RTSP TCP connection, per the
/// `0x24 | channel:u8 | length:u16-BE | payload[length]` wire format.
#[derive(Debug, Clone)]
pub struct InterleavedFrame {
    pub channel_id: u8,
    pub data: Bytes,
}

/// Something read off the wire by [`MessageFramer::read_message`]: either
/// half of the RTSP request/response exchange, or an interleaved media frame
/// sharing the same byte stream.
#[derive(Debug)]
pub enum Message {
    Request(rtsp_types::Request<Bytes>),
    Response(rtsp_types::Response<Bytes>),
    Interleaved(InterleavedFrame),
}

/// Frames RTSP messages and interleaved binary frames on one duplex byte
/// stream `RW`. Owns the connection's read buffer and read position; see
/// §4.1 for the framing rules this implements.
pub struct MessageFramer<RW> {
    io: RW,
    read_buf: BytesMut,
    /// Absolute byte position of `read_buf`'s start within the connection,
    /// for inclusion in [`RtspMessageContext`].
    read_pos: u64,
    max_message_size: usize,
    conn_ctx: ConnectionContext,
}

impl<RW: AsyncRead + AsyncWrite + Unpin> MessageFramer<RW> {
    pub fn new(io: RW) -> Self {
        Self::with_conn_ctx(io, ConnectionContext::dummy())
    }

    pub fn with_conn_ctx(io: RW, conn_ctx: ConnectionContext) -> Self {
        Self {
            io,
            read_buf: BytesMut::with_capacity(4096),
            read_pos: 0,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            conn_ctx,
        }
    }

    pub fn set_max_message_size(&mut self, max: usize) {
        self.max_message_size = max;
    }

    /// Reads until `self.read_buf` holds at least `len` bytes starting at
    /// offset `start`, growing the buffer as needed.
    async fn fill_to(&mut self, start: usize, len: usize) -> Result<(), Error> {
        while self.read_buf.len() < start + len {
            if start + len > self.max_message_size {
                bail!(ErrorInt::RtspFramingError {
                    conn_ctx: self.conn_ctx,
                    msg_ctx: RtspMessageContext::new(self.read_pos),
                    description: format!(
                        "message of at least {} bytes exceeds cap of {} bytes",
                        start + len,
                        self.max_message_size
                    ),
                });
            }
            let mut chunk = [0u8; 4096];
            let n = self.io.read(&mut chunk).await.map_err(|e| wrap!(ErrorInt::Io(e)))?;
            if n == 0 {
                bail!(ErrorInt::RtspFramingError {
                    conn_ctx: self.conn_ctx,
                    msg_ctx: RtspMessageContext::new(self.read_pos),
                    description: "connection closed mid-message".to_owned(),
                });
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        }
        Ok(())
    }

    fn advance(&mut self, n: usize) {
        self.read_buf.advance(n);
        self.read_pos += n as u64;
    }

    /// Reads the next framed item: an interleaved frame if the stream's next
    /// byte is `$`, otherwise a complete RTSP request or response.
    pub async fn read_message(&mut self) -> Result<Message, Error> {
        self.fill_to(0, 1).await?;
        if self.read_buf[0] == INTERLEAVED_MARKER {
            return self.read_interleaved().await;
        }
        self.read_rtsp_message().await
    }

    async fn read_interleaved(&mut self) -> Result<Message, Error> {
        self.fill_to(0, 4).await?;
        let channel_id = self.read_buf[1];
        let len = u16::from_be_bytes([self.read_buf[2], self.read_buf[3]]) as usize;
        self.fill_to(4, len).await?;
        let data = Bytes::copy_from_slice(&self.read_buf[4..4 + len]);
        self.advance(4 + len);
        Ok(Message::Interleaved(InterleavedFrame { channel_id, data }))
    }

    async fn read_rtsp_message(&mut self) -> Result<Message, Error> {
        let msg_ctx = RtspMessageContext::new(self.read_pos);
        let header_end = loop {
            if let Some(i) = find_header_terminator(&self.read_buf) {
                break i;
            }
            if self.read_buf.len() >= self.max_message_size {
                bail!(ErrorInt::RtspFramingError {
                    conn_ctx: self.conn_ctx,
                    msg_ctx,
                    description: format!("header section exceeds cap of {} bytes", self.max_message_size),
                });
            }
            let mut chunk = [0u8; 4096];
            let n = self.io.read(&mut chunk).await.map_err(|e| wrap!(ErrorInt::Io(e)))?;
            if n == 0 {
                bail!(ErrorInt::RtspFramingError {
                    conn_ctx: self.conn_ctx,
                    msg_ctx,
                    description: "connection closed mid-header".to_owned(),
                });
            }
            self.read_buf.extend_from_slice(&chunk[..n]);
        };

        // header_end points just past the blank-line terminator; rtsp_types
        // wants the whole buffer and tells us how much it consumed.
        self.fill_to(0, header_end).await?;
        let content_length = parse_content_length(&self.read_buf[..header_end])
            .map_err(|description| wrap!(ErrorInt::RtspFramingError { conn_ctx: self.conn_ctx, msg_ctx, description }))?;
        self.fill_to(0, header_end + content_length).await?;

        let total = header_end + content_length;
        let (msg, consumed) = rtsp_types::Message::parse(&self.read_buf[..total]).map_err(|e| {
            wrap!(ErrorInt::RtspFramingError {
                conn_ctx: self.conn_ctx,
                msg_ctx,
                description: format!("{:?}", e),
            })
        })?;
        if consumed != total {
            bail!(ErrorInt::RtspFramingError {
                conn_ctx: self.conn_ctx,
                msg_ctx,
                description: format!("parser consumed {} of {} expected bytes", consumed, total),
            });
        }
        let result = match msg {
            rtsp_types::Message::Request(r) => Message::Request(r.map_body(|b| Bytes::copy_from_slice(b))),
            rtsp_types::Message::Response(r) => Message::Response(r.map_body(|b| Bytes::copy_from_slice(b))),
            rtsp_types::Message::Data(_) => bail!(ErrorInt::RtspFramingError {
                conn_ctx: self.conn_ctx,
                msg_ctx,
                description: "unexpected interleaved data framing inside text-message parse".to_owned(),
            }),
        };
        self.advance(total);
        Ok(result)
    }

    pub async fn write_request(&mut self, req: &rtsp_types::Request<Bytes>) -> Result<(), Error> {
        let mut buf = Vec::new();
        req.write(&mut buf).map_err(|e| {
            wrap!(ErrorInt::RtspFramingError {
                conn_ctx: self.conn_ctx,
                msg_ctx: RtspMessageContext::dummy(),
                description: format!("failed serializing request: {:?}", e),
            })
        })?;
        self.io.write_all(&buf).await.map_err(|e| wrap!(ErrorInt::Io(e)))?;
        Ok(())
    }

    pub async fn write_response(&mut self, resp: &rtsp_types::Response<Bytes>) -> Result<(), Error> {
        let mut buf = Vec::new();
        resp.write(&mut buf).map_err(|e| {
            wrap!(ErrorInt::RtspFramingError {
                conn_ctx: self.conn_ctx,
                msg_ctx: RtspMessageContext::dummy(),
                description: format!("failed serializing response: {:?}", e),
            })
        })?;
        self.io.write_all(&buf).await.map_err(|e| wrap!(ErrorInt::Io(e)))?;
        Ok(())
    }

    /// Writes a pre-framed interleaved frame; used by the transport mux's
    /// writer task to serialise media writes against RTSP writes (§4.5).
    pub async fn write_interleaved(&mut self, channel_id: u8, data: &[u8]) -> Result<(), Error> {
        if data.len() > u16::MAX as usize {
            bail!(ErrorInt::RtspFramingError {
                conn_ctx: self.conn_ctx,
                msg_ctx: RtspMessageContext::dummy(),
                description: format!("interleaved frame of {} bytes exceeds u16 length field", data.len()),
            });
        }
        let mut header = [0u8; 4];
        header[0] = INTERLEAVED_MARKER;
        header[1] = channel_id;
        header[2..4].copy_from_slice(&(data.len() as u16).to_be_bytes());
        self.io.write_all(&header).await.map_err(|e| wrap!(ErrorInt::Io(e)))?;
        self.io.write_all(data).await.map_err(|e| wrap!(ErrorInt::Io(e)))?;
        Ok(())
    }
}

/// Finds the end of the header section (index just past `\r\n\r\n`), or
/// `None` if not yet fully buffered.
fn find_header_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Extracts `Content-Length` from a buffered header section; a missing
/// header means a zero-length body, per §4.1.
fn parse_content_length(header_section: &[u8]) -> Result<usize, String> {
    let text = std::str::from_utf8(header_section).map_err(|_| "headers are not valid UTF-8".to_owned())?;
    for line in text.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case("content-length") {
                return value
                    .trim()
                    .parse()
                    .map_err(|_| format!("unparseable Content-Length {:?}", value));
            }
        }
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reads_a_request_with_no_body() {
        let (client, mut server) = tokio::io::duplex(1024);
        server
            .write_all(b"OPTIONS rtsp://h/s RTSP/1.0\r\nCSeq: 1\r\n\r\n")
            .await
            .unwrap();
        let mut framer = MessageFramer::new(client);
        match framer.read_message().await.unwrap() {
            Message::Request(r) => assert_eq!(r.method(), rtsp_types::Method::Options),
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn reads_a_response_with_body() {
        let (client, mut server) = tokio::io::duplex(1024);
        server
            .write_all(b"RTSP/1.0 200 OK\r\nCSeq: 1\r\nContent-Length: 5\r\n\r\nhello")
            .await
            .unwrap();
        let mut framer = MessageFramer::new(client);
        match framer.read_message().await.unwrap() {
            Message::Response(r) => assert_eq!(&r.body()[..], b"hello"),
            other => panic!("expected response, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn reads_an_interleaved_frame() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut raw = vec![0x24, 0x00];
        raw.extend_from_slice(&3u16.to_be_bytes());
        raw.extend_from_slice(b"abc");
        server.write_all(&raw).await.unwrap();
        let mut framer = MessageFramer::new(client);
        match framer.read_message().await.unwrap() {
            Message::Interleaved(f) => {
                assert_eq!(f.channel_id, 0);
                assert_eq!(&f.data[..], b"abc");
            }
            other => panic!("expected interleaved frame, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn distinguishes_interleaved_from_rtsp_on_the_same_stream() {
        let (client, mut server) = tokio::io::duplex(4096);
        let mut raw = vec![0x24, 0x01];
        raw.extend_from_slice(&2u16.to_be_bytes());
        raw.extend_from_slice(b"xy");
        raw.extend_from_slice(b"RTSP/1.0 200 OK\r\nCSeq: 9\r\n\r\n");
        server.write_all(&raw).await.unwrap();
        let mut framer = MessageFramer::new(client);
        assert!(matches!(framer.read_message().await.unwrap(), Message::Interleaved(_)));
        assert!(matches!(framer.read_message().await.unwrap(), Message::Response(_)));
    }

    #[tokio::test]
    async fn fatal_error_on_cap_exceeded() {
        let (client, mut server) = tokio::io::duplex(1 << 20);
        let mut framer = MessageFramer::new(client);
        framer.set_max_message_size(16);
        server
            .write_all(b"OPTIONS rtsp://host/a-very-long-path-that-is-too-big RTSP/1.0\r\nCSeq: 1\r\n\r\n")
            .await
            .unwrap();
        assert!(framer.read_message().await.is_err());
    }

    #[tokio::test]
    async fn writes_canonical_request_form() {
        let (client, mut server) = tokio::io::duplex(1024);
        let mut framer = MessageFramer::new(client);
        let req = rtsp_types::Request::builder(rtsp_types::Method::Options, rtsp_types::Version::V1_0)
            .header(rtsp_types::headers::CSEQ, "1")
            .request_uri("rtsp://h/s")
            .build(Bytes::new());
        framer.write_request(&req).await.unwrap();
        let mut buf = vec![0u8; 256];
        let n = server.read(&mut buf).await.unwrap();
        let text = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(text.starts_with("OPTIONS rtsp://h/s RTSP/1.0\r\n"));
        assert!(text.contains("CSeq: 1\r\n"));
    }
}
