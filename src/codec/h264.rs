// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! H.264 depacketization as specified in
//! [RFC 6184](https://datatracker.ietf.org/doc/html/rfc6184).
//!
//! This reassembles single NAL units and FU-A fragmentation units into Annex-B
//! access units (`00 00 00 01`-prefixed NALs concatenated back to back). It does
//! not parse SPS/PPS, so it can't report pixel dimensions or an RFC 6381 codec
//! string; that belongs to a richer collaborator outside this crate's scope.

use bytes::{BufMut, Bytes, BytesMut};

use super::{CodecItem, PacketCodec, VideoFrame};
use crate::client::rtp::Packet;

const ANNEXB_START_CODE: &[u8] = &[0, 0, 0, 1];

/// NAL unit types carrying FU-A fragments and STAP-A aggregates, per RFC 6184 §5.2.
const NAL_TYPE_STAP_A: u8 = 24;
const NAL_TYPE_FU_A: u8 = 28;

/// The packet-level fields of the access unit currently being assembled.
#[derive(Clone, Copy)]
struct FrameHead {
    ctx: crate::RtspMessageContext,
    stream_id: usize,
    timestamp: crate::Timestamp,
    loss: u16,
}

#[derive(Debug)]
pub(crate) struct Depacketizer {
    clock_rate: u32,
    /// Accumulated Annex-B bytes for the access unit in progress.
    in_progress: BytesMut,
    /// Set once a FU-A start fragment has been seen but no end fragment yet.
    fragmenting: bool,
    is_random_access_point: bool,
    head: Option<FrameHead>,
    pending: Option<VideoFrame>,
}

impl Depacketizer {
    pub(super) fn new(clock_rate: u32) -> Result<Self, String> {
        Ok(Self {
            clock_rate,
            in_progress: BytesMut::new(),
            fragmenting: false,
            is_random_access_point: false,
            head: None,
            pending: None,
        })
    }

    fn push_nal(&mut self, head: FrameHead, nal_header: u8, nal_type: u8, body: &[u8], mark: bool) {
        if nal_type == 5 {
            self.is_random_access_point = true;
        }
        if self.head.is_none() {
            self.head = Some(head);
        }
        self.in_progress.put_slice(ANNEXB_START_CODE);
        self.in_progress.put_u8(nal_header);
        self.in_progress.put_slice(body);
        if mark {
            self.finish();
        }
    }

    fn finish(&mut self) {
        if self.in_progress.is_empty() {
            return;
        }
        let head = self.head.take().expect("head set alongside in_progress");
        let data = std::mem::take(&mut self.in_progress).freeze();
        self.pending = Some(VideoFrame {
            ctx: head.ctx,
            stream_id: head.stream_id,
            timestamp: head.timestamp,
            loss: head.loss,
            is_random_access_point: self.is_random_access_point,
            is_disposable: false,
            data,
        });
        self.is_random_access_point = false;
    }
}

impl PacketCodec for Depacketizer {
    fn clock_rate(&self) -> u32 {
        self.clock_rate
    }

    fn pts_equals_dts(&self) -> bool {
        // H.264 streams with B-frames reorder presentation order relative to
        // decode order; this minimal depacketizer doesn't reconstruct that, so
        // downstream consumers must not assume the two coincide.
        false
    }

    fn push(&mut self, pkt: Packet) -> Result<(), String> {
        if pkt.payload.is_empty() {
            return Err("empty H.264 RTP payload".to_owned());
        }
        let first = pkt.payload[0];
        let nal_type = first & 0x1f;
        let head = FrameHead {
            ctx: pkt.ctx,
            stream_id: pkt.stream_id,
            timestamp: pkt.timestamp,
            loss: pkt.loss,
        };

        match nal_type {
            NAL_TYPE_FU_A => {
                if pkt.payload.len() < 2 {
                    return Err("FU-A packet too short".to_owned());
                }
                let fu_header = pkt.payload[1];
                let start = fu_header & 0x80 != 0;
                let end = fu_header & 0x40 != 0;
                let nal_type = fu_header & 0x1f;
                if start {
                    if self.fragmenting {
                        return Err("FU-A start without preceding end".to_owned());
                    }
                    self.fragmenting = true;
                    let reconstructed_header = (first & 0xe0) | nal_type;
                    self.push_nal(head, reconstructed_header, nal_type, &pkt.payload[2..], false);
                } else {
                    if !self.fragmenting {
                        return Err("FU-A continuation without start".to_owned());
                    }
                    self.in_progress.put_slice(&pkt.payload[2..]);
                }
                if end {
                    self.fragmenting = false;
                    if pkt.mark {
                        self.finish();
                    }
                }
            }
            NAL_TYPE_STAP_A => {
                let mut rest = &pkt.payload[1..];
                while rest.len() >= 2 {
                    let size = u16::from_be_bytes([rest[0], rest[1]]) as usize;
                    rest = &rest[2..];
                    if rest.len() < size {
                        return Err("truncated STAP-A aggregation unit".to_owned());
                    }
                    let (nal, remainder) = rest.split_at(size);
                    if nal.is_empty() {
                        return Err("empty NAL inside STAP-A".to_owned());
                    }
                    let nal_type = nal[0] & 0x1f;
                    self.push_nal(head, nal[0], nal_type, &nal[1..], false);
                    rest = remainder;
                }
                if pkt.mark {
                    self.finish();
                }
            }
            _ => {
                self.push_nal(head, first, nal_type, &pkt.payload[1..], pkt.mark);
            }
        }
        Ok(())
    }

    fn pull(&mut self) -> Option<CodecItem> {
        self.pending.take().map(CodecItem::VideoFrame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU32;

    fn packet(payload: Vec<u8>, mark: bool) -> Packet {
        Packet {
            ctx: crate::RtspMessageContext::dummy(),
            channel_id: 0,
            stream_id: 0,
            timestamp: crate::Timestamp::new(0, NonZeroU32::new(90_000).unwrap(), 0).unwrap(),
            ssrc: 0,
            sequence_number: 0,
            loss: 0,
            mark,
            payload: Bytes::from(payload),
        }
    }

    #[test]
    fn single_nal_unit_is_passed_through_with_start_code() {
        let mut d = Depacketizer::new(90_000).unwrap();
        d.push(packet(vec![0x67, 0xaa, 0xbb], true)).unwrap();
        let frame = match d.pull().unwrap() {
            CodecItem::VideoFrame(f) => f,
            _ => panic!("expected video frame"),
        };
        assert_eq!(&frame.data[..], &[0, 0, 0, 1, 0x67, 0xaa, 0xbb]);
    }

    #[test]
    fn fu_a_fragments_reassemble_into_one_nal() {
        let mut d = Depacketizer::new(90_000).unwrap();
        // FU indicator: nal_ref_idc=3, type=28 (FU-A): 0b011_11000
        let fu_indicator = 0x7c;
        // FU header start, original nal_type = 5 (IDR): 0b1_0_0_00101
        d.push(packet(vec![fu_indicator, 0x85, 0xaa], false))
            .unwrap();
        assert!(d.pull().is_none());
        d.push(packet(vec![fu_indicator, 0x45, 0xbb], true))
            .unwrap();
        let frame = match d.pull().unwrap() {
            CodecItem::VideoFrame(f) => f,
            _ => panic!("expected video frame"),
        };
        assert!(frame.is_random_access_point);
        assert_eq!(&frame.data[..], &[0, 0, 0, 1, 0x65, 0xaa, 0xbb]);
    }

    #[test]
    fn rejects_empty_payload() {
        let mut d = Depacketizer::new(90_000).unwrap();
        assert!(d.push(packet(vec![], true)).is_err());
    }
}
