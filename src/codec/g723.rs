// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! G.723.1 audio as specified in [RFC 3551 section 4.5.3](https://datatracker.ietf.org/doc/html/rfc3551#section-4.5.3).
//!
//! One RTP packet always carries exactly one G.723.1 frame, so this depacketizer
//! just validates the payload length/header bits and passes the bytes through.

use std::num::NonZeroU32;

use bytes::Bytes;
use pretty_hex::PrettyHex;

use super::{AudioFrame, CodecItem, PacketCodec};
use crate::client::rtp::Packet;

const FIXED_CLOCK_RATE: u32 = 8_000;
const FIXED_FRAME_LENGTH: u32 = 240;

#[derive(Debug)]
pub(crate) struct Depacketizer {
    pending: Option<AudioFrame>,
}

impl Depacketizer {
    pub(super) fn new(clock_rate: u32) -> Result<Self, String> {
        if clock_rate != FIXED_CLOCK_RATE {
            return Err(format!(
                "Expected clock rate of {} for G.723, got {}",
                FIXED_CLOCK_RATE, clock_rate
            ));
        }
        Ok(Self { pending: None })
    }

    fn validate(pkt: &Packet) -> bool {
        let expected_hdr_bits = match pkt.payload.len() {
            24 => 0b00,
            20 => 0b01,
            4 => 0b10,
            _ => return false,
        };
        let actual_hdr_bits = pkt.payload[0] & 0b11;
        actual_hdr_bits == expected_hdr_bits
    }
}

impl PacketCodec for Depacketizer {
    fn clock_rate(&self) -> u32 {
        FIXED_CLOCK_RATE
    }

    fn pts_equals_dts(&self) -> bool {
        true
    }

    fn push(&mut self, pkt: Packet) -> Result<(), String> {
        assert!(self.pending.is_none());
        if !Self::validate(&pkt) {
            return Err(format!(
                "Invalid G.723 packet: {:#?}",
                pkt.payload.hex_dump()
            ));
        }
        self.pending = Some(AudioFrame {
            ctx: pkt.ctx,
            loss: pkt.loss,
            stream_id: pkt.stream_id,
            timestamp: pkt.timestamp,
            frame_length: NonZeroU32::new(FIXED_FRAME_LENGTH),
            data: pkt.payload,
        });
        Ok(())
    }

    fn pull(&mut self) -> Option<CodecItem> {
        self.pending.take().map(CodecItem::AudioFrame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(payload: Bytes) -> Packet {
        Packet {
            ctx: crate::RtspMessageContext::dummy(),
            channel_id: 0,
            stream_id: 0,
            timestamp: crate::Timestamp::new(0, NonZeroU32::new(8_000).unwrap(), 0).unwrap(),
            ssrc: 0,
            sequence_number: 0,
            loss: 0,
            mark: true,
            payload,
        }
    }

    #[test]
    fn rejects_wrong_clock_rate() {
        assert!(Depacketizer::new(16_000).is_err());
    }

    #[test]
    fn passes_through_one_frame_per_packet() {
        let mut d = Depacketizer::new(FIXED_CLOCK_RATE).unwrap();
        let mut payload = vec![0u8; 24];
        payload[0] = 0b00;
        d.push(packet(Bytes::from(payload))).unwrap();
        match d.pull().unwrap() {
            CodecItem::AudioFrame(f) => assert_eq!(f.frame_length, NonZeroU32::new(240)),
            _ => panic!("expected audio frame"),
        }
        assert!(d.pull().is_none());
    }

    #[test]
    fn rejects_malformed_header_bits() {
        let mut d = Depacketizer::new(FIXED_CLOCK_RATE).unwrap();
        let mut payload = vec![0u8; 24];
        payload[0] = 0b01; // wrong bits for a 24-byte frame
        assert!(d.push(packet(Bytes::from(payload))).is_err());
    }
}
