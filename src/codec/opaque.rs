// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Passthrough depacketizer for codecs that don't need reassembly beyond what the
//! marker bit already tells us: each RTP packet (for audio/application media) or
//! each run of packets up to the marked one (for video) becomes one frame, with
//! no codec-specific framing applied. Suitable for simple one-sample-per-packet
//! audio codecs (G.711, L16, Opus in its RTP default mode) and as a conservative
//! fallback for anything this crate doesn't special-case.

use bytes::{BufMut, Bytes, BytesMut};

use super::{AudioFrame, CodecItem, MessageFrame, PacketCodec, VideoFrame};
use crate::client::rtp::Packet;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Media {
    Video,
    Audio,
    Application,
}

#[derive(Debug)]
pub(crate) struct Depacketizer {
    clock_rate: u32,
    media: Media,
    in_progress: BytesMut,
    pending: Option<CodecItem>,
}

impl Depacketizer {
    pub(super) fn new(clock_rate: u32, media: &str) -> Result<Self, String> {
        let media = match media {
            "video" => Media::Video,
            "audio" => Media::Audio,
            "application" => Media::Application,
            other => return Err(format!("unknown SDP media type {}", other)),
        };
        Ok(Self {
            clock_rate,
            media,
            in_progress: BytesMut::new(),
            pending: None,
        })
    }
}

impl PacketCodec for Depacketizer {
    fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    fn pts_equals_dts(&self) -> bool {
        true
    }

    fn push(&mut self, pkt: Packet) -> Result<(), String> {
        if pkt.payload.is_empty() {
            return Err("empty RTP payload".to_owned());
        }
        self.in_progress.put_slice(&pkt.payload);
        if !pkt.mark {
            return Ok(());
        }
        let data: Bytes = std::mem::take(&mut self.in_progress).freeze();
        self.pending = Some(match self.media {
            Media::Video => CodecItem::VideoFrame(VideoFrame {
                ctx: pkt.ctx,
                stream_id: pkt.stream_id,
                timestamp: pkt.timestamp,
                loss: pkt.loss,
                // Without codec-specific NAL/slice inspection we can't tell
                // whether this frame is independently decodable.
                is_random_access_point: false,
                is_disposable: false,
                data,
            }),
            Media::Audio => CodecItem::AudioFrame(AudioFrame {
                ctx: pkt.ctx,
                stream_id: pkt.stream_id,
                timestamp: pkt.timestamp,
                loss: pkt.loss,
                frame_length: None,
                data,
            }),
            Media::Application => CodecItem::MessageFrame(MessageFrame {
                ctx: pkt.ctx,
                stream_id: pkt.stream_id,
                timestamp: pkt.timestamp,
                loss: pkt.loss,
                data,
            }),
        });
        Ok(())
    }

    fn pull(&mut self) -> Option<CodecItem> {
        self.pending.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU32;

    fn packet(payload: &[u8], mark: bool) -> Packet {
        Packet {
            ctx: crate::RtspMessageContext::dummy(),
            channel_id: 0,
            stream_id: 0,
            timestamp: crate::Timestamp::new(0, NonZeroU32::new(8_000).unwrap(), 0).unwrap(),
            ssrc: 0,
            sequence_number: 0,
            loss: 0,
            mark,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    #[test]
    fn one_marked_packet_is_one_audio_frame() {
        let mut d = Depacketizer::new(8_000, "audio").unwrap();
        d.push(packet(b"abc", true)).unwrap();
        match d.pull().unwrap() {
            CodecItem::AudioFrame(f) => assert_eq!(&f.data[..], b"abc"),
            _ => panic!("expected audio frame"),
        }
    }

    #[test]
    fn unmarked_packets_accumulate_until_marked() {
        let mut d = Depacketizer::new(90_000, "video").unwrap();
        d.push(packet(b"ab", false)).unwrap();
        assert!(d.pull().is_none());
        d.push(packet(b"cd", true)).unwrap();
        match d.pull().unwrap() {
            CodecItem::VideoFrame(f) => assert_eq!(&f.data[..], b"abcd"),
            _ => panic!("expected video frame"),
        }
    }

    #[test]
    fn rejects_unknown_media_type() {
        assert!(Depacketizer::new(8_000, "text").is_err());
    }
}
