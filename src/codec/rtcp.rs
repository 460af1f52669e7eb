// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Minimal RTCP packet recognition, just enough to hand sender reports to
//! [`crate::client::rtp::StrictSequenceChecker`] and otherwise treat RTCP as an
//! opaque sink for the `ReportEngine` collaborator (out of scope per the design doc).
//!
//! See [RFC 3550 §6.4.1](https://datatracker.ietf.org/doc/html/rfc3550#section-6.4.1)
//! for the sender-report wire layout.

use crate::NtpTimestamp;

#[derive(Debug)]
pub struct SenderReportPacket<'a> {
    data: &'a [u8],
}

impl<'a> SenderReportPacket<'a> {
    pub fn ssrc(&self) -> u32 {
        u32::from_be_bytes(self.data[4..8].try_into().unwrap())
    }

    pub fn ntp_timestamp(&self) -> NtpTimestamp {
        NtpTimestamp(u64::from_be_bytes(self.data[8..16].try_into().unwrap()))
    }

    pub fn rtp_timestamp(&self) -> u32 {
        u32::from_be_bytes(self.data[16..20].try_into().unwrap())
    }
}

#[derive(Debug)]
pub struct UnknownPacket<'a> {
    data: &'a [u8],
}

impl<'a> UnknownPacket<'a> {
    pub fn payload_type(&self) -> u8 {
        self.data[1]
    }
}

#[derive(Debug)]
pub enum Packet<'a> {
    SenderReport(SenderReportPacket<'a>),
    Unknown(UnknownPacket<'a>),
}

const SENDER_REPORT_PT: u8 = 200;
const FIXED_HEADER_LEN: usize = 4;
const SENDER_REPORT_MIN_LEN: usize = 20;

impl<'a> Packet<'a> {
    /// Parses one RTCP packet from the front of `data`, returning it and the remainder.
    /// RTCP packets are "compound": several may be concatenated back to back.
    pub fn parse(data: &'a [u8]) -> Result<(Self, &'a [u8]), String> {
        if data.len() < FIXED_HEADER_LEN {
            return Err(format!("RTCP packet too short: {} bytes", data.len()));
        }
        let version = data[0] >> 6;
        if version != 2 {
            return Err(format!("unsupported RTCP version {}", version));
        }
        let length_words = u16::from_be_bytes([data[2], data[3]]) as usize;
        let total_len = (length_words + 1) * 4;
        if data.len() < total_len {
            return Err(format!(
                "RTCP packet truncated: declared {} bytes, have {}",
                total_len,
                data.len()
            ));
        }
        let (this, rest) = data.split_at(total_len);
        let payload_type = this[1];
        let pkt = if payload_type == SENDER_REPORT_PT {
            if this.len() < SENDER_REPORT_MIN_LEN {
                return Err("truncated RTCP sender report".to_owned());
            }
            Packet::SenderReport(SenderReportPacket { data: this })
        } else {
            Packet::Unknown(UnknownPacket { data: this })
        };
        Ok((pkt, rest))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sender_report(ssrc: u32, ntp: u64, rtp_ts: u32) -> Vec<u8> {
        let mut buf = vec![0u8; 28];
        buf[0] = 0b1000_0000; // version 2, no padding, RC=0
        buf[1] = SENDER_REPORT_PT;
        buf[2..4].copy_from_slice(&6u16.to_be_bytes()); // length in 32-bit words minus one
        buf[4..8].copy_from_slice(&ssrc.to_be_bytes());
        buf[8..16].copy_from_slice(&ntp.to_be_bytes());
        buf[16..20].copy_from_slice(&rtp_ts.to_be_bytes());
        buf
    }

    #[test]
    fn parses_sender_report() {
        let data = sender_report(0x1234_5678, 0xdead_beef_0000_0001, 90_000);
        let (pkt, rest) = Packet::parse(&data).unwrap();
        assert!(rest.is_empty());
        match pkt {
            Packet::SenderReport(sr) => {
                assert_eq!(sr.ssrc(), 0x1234_5678);
                assert_eq!(sr.ntp_timestamp(), NtpTimestamp(0xdead_beef_0000_0001));
                assert_eq!(sr.rtp_timestamp(), 90_000);
            }
            Packet::Unknown(_) => panic!("expected sender report"),
        }
    }

    #[test]
    fn compound_packets_split_correctly() {
        let mut data = sender_report(1, 0, 0);
        // Append a minimal "unknown" RTCP packet (e.g. an SDES, PT=202) of 1 word.
        data.extend_from_slice(&[0b1000_0000, 202, 0x00, 0x00]);
        let (first, rest) = Packet::parse(&data).unwrap();
        assert!(matches!(first, Packet::SenderReport(_)));
        let (second, rest) = Packet::parse(rest).unwrap();
        assert!(rest.is_empty());
        match second {
            Packet::Unknown(u) => assert_eq!(u.payload_type(), 202),
            _ => panic!("expected unknown packet"),
        }
    }

    #[test]
    fn rejects_truncated_packet() {
        let data = [0b1000_0000u8, SENDER_REPORT_PT, 0x00, 0x06];
        assert!(Packet::parse(&data).is_err());
    }
}
