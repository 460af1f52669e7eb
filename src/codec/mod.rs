// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The `PacketCodec` collaborator: RTP depacketization and RTCP packet recognition.
//!
//! This crate's core is the session state machines, the message framer, and the
//! transport mux (see the crate root docs); codec-specific depacketization is
//! explicitly out of scope and is represented here only as a closed,
//! pattern-matchable union of capability structs. Each variant knows its clock
//! rate and how to reassemble its own RTP payloads into frames; it does not parse
//! codec-internal structures (SPS/PPS, ADTS headers, RFC 6381 codec strings, and
//! so on) beyond what's needed to do that reassembly.

use std::num::NonZeroU32;

use bytes::Bytes;
use pretty_hex::PrettyHex;

pub(crate) mod g723;
pub(crate) mod h264;
pub(crate) mod opaque;
pub mod rtcp;

use crate::client::rtp::Packet;

#[derive(Debug)]
pub enum CodecItem {
    VideoFrame(VideoFrame),
    AudioFrame(AudioFrame),
    MessageFrame(MessageFrame),
}

#[derive(Clone)]
pub struct VideoFrame {
    pub ctx: crate::RtspMessageContext,
    pub stream_id: usize,
    pub timestamp: crate::Timestamp,
    pub loss: u16,

    /// True if this frame can be decoded without reference to any prior frame
    /// (eg an H.264 IDR access unit).
    pub is_random_access_point: bool,

    /// True if no subsequent frame depends on this one.
    pub is_disposable: bool,

    pub data: Bytes,
}

impl std::fmt::Debug for VideoFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VideoFrame")
            .field("ctx", &self.ctx)
            .field("stream_id", &self.stream_id)
            .field("timestamp", &self.timestamp)
            .field("loss", &self.loss)
            .field("is_random_access_point", &self.is_random_access_point)
            .field("is_disposable", &self.is_disposable)
            .field("data", &self.data.hex_dump())
            .finish()
    }
}

#[derive(Clone)]
pub struct AudioFrame {
    pub ctx: crate::RtspMessageContext,
    pub stream_id: usize,
    pub timestamp: crate::Timestamp,
    pub loss: u16,
    pub frame_length: Option<NonZeroU32>,
    pub data: Bytes,
}

impl std::fmt::Debug for AudioFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioFrame")
            .field("ctx", &self.ctx)
            .field("stream_id", &self.stream_id)
            .field("timestamp", &self.timestamp)
            .field("loss", &self.loss)
            .field("frame_length", &self.frame_length)
            .field("data", &self.data.hex_dump())
            .finish()
    }
}

/// A non-media "application" track frame, eg ONVIF metadata.
#[derive(Clone)]
pub struct MessageFrame {
    pub ctx: crate::RtspMessageContext,
    pub stream_id: usize,
    pub timestamp: crate::Timestamp,
    pub loss: u16,
    pub data: Bytes,
}

impl std::fmt::Debug for MessageFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageFrame")
            .field("ctx", &self.ctx)
            .field("stream_id", &self.stream_id)
            .field("timestamp", &self.timestamp)
            .field("loss", &self.loss)
            .field("data", &self.data.hex_dump())
            .finish()
    }
}

/// The capability set every codec variant implements.
pub trait PacketCodec: std::fmt::Debug {
    fn clock_rate(&self) -> u32;

    /// Whether presentation and decode timestamps coincide for this codec (true for
    /// most audio and intra-only video codecs; false for codecs with B-frame reordering).
    fn pts_equals_dts(&self) -> bool;

    /// Feeds one already-demultiplexed RTP packet in. At most one frame is pending
    /// at a time; callers must [`Self::pull`] it before pushing again.
    fn push(&mut self, pkt: Packet) -> Result<(), String>;

    fn pull(&mut self) -> Option<CodecItem>;
}

/// The closed union of depacketizers this core knows how to construct, keyed by the
/// SDP `rtpmap` encoding name. Consumers outside the core match on this rather than
/// on a trait object.
#[derive(Debug)]
pub enum Depacketizer {
    H264(h264::Depacketizer),
    G723(g723::Depacketizer),
    Opaque(opaque::Depacketizer),
}

impl Depacketizer {
    /// Constructs a depacketizer for `encoding_name` (as seen in an SDP `rtpmap`
    /// attribute, eg `H264` or `MPEG4-GENERIC`) at the given `clock_rate`. `media`
    /// is the SDP media type (`video`, `audio`, or `application`) and is used only
    /// to pick a sensible fallback when `encoding_name` isn't one we special-case.
    pub fn new(encoding_name: &str, clock_rate: u32, media: &str) -> Result<Self, String> {
        match encoding_name.to_ascii_uppercase().as_str() {
            "H264" => Ok(Depacketizer::H264(h264::Depacketizer::new(clock_rate)?)),
            "G723" => Ok(Depacketizer::G723(g723::Depacketizer::new(clock_rate)?)),
            _ => Ok(Depacketizer::Opaque(opaque::Depacketizer::new(
                clock_rate,
                media,
            )?)),
        }
    }
}

impl PacketCodec for Depacketizer {
    fn clock_rate(&self) -> u32 {
        match self {
            Depacketizer::H264(d) => d.clock_rate(),
            Depacketizer::G723(d) => d.clock_rate(),
            Depacketizer::Opaque(d) => d.clock_rate(),
        }
    }

    fn pts_equals_dts(&self) -> bool {
        match self {
            Depacketizer::H264(d) => d.pts_equals_dts(),
            Depacketizer::G723(d) => d.pts_equals_dts(),
            Depacketizer::Opaque(d) => d.pts_equals_dts(),
        }
    }

    fn push(&mut self, pkt: Packet) -> Result<(), String> {
        match self {
            Depacketizer::H264(d) => d.push(pkt),
            Depacketizer::G723(d) => d.push(pkt),
            Depacketizer::Opaque(d) => d.push(pkt),
        }
    }

    fn pull(&mut self) -> Option<CodecItem> {
        match self {
            Depacketizer::H264(d) => d.pull(),
            Depacketizer::G723(d) => d.pull(),
            Depacketizer::Opaque(d) => d.pull(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_h264_by_name_case_insensitively() {
        assert!(matches!(
            Depacketizer::new("h264", 90_000, "video").unwrap(),
            Depacketizer::H264(_)
        ));
    }

    #[test]
    fn falls_back_to_opaque_for_unknown_encodings() {
        assert!(matches!(
            Depacketizer::new("MPEG4-GENERIC", 48_000, "audio").unwrap(),
            Depacketizer::Opaque(_)
        ));
    }
}
