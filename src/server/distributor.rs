// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `StreamDistributor` (§2/§5): fans one published track's RTP/RTCP out to
//! however many PLAY readers are subscribed, best-effort. A slow reader's
//! [`crate::transport_mux::write_queue`] filling up (`QueueFull`) drops that
//! reader's packets; it never blocks the publisher or the other readers.

use std::collections::HashMap;

use bytes::Bytes;
use log::debug;

use crate::transport_mux::{write_queue, OutboundPacket, WriteQueueSender};

/// One subscriber's outbound queue, keyed by an opaque id the caller picks
/// (typically the subscribing session's id).
pub struct StreamDistributor {
    ssrc: Option<u32>,
    readers: HashMap<String, WriteQueueSender<OutboundPacket>>,
}

impl StreamDistributor {
    pub fn new() -> Self {
        Self {
            ssrc: None,
            readers: HashMap::new(),
        }
    }

    pub fn ssrc(&self) -> Option<u32> {
        self.ssrc
    }

    pub fn set_ssrc(&mut self, ssrc: u32) {
        self.ssrc = Some(ssrc);
    }

    pub fn reader_count(&self) -> usize {
        self.readers.len()
    }

    /// Registers `reader_id` as a subscriber and returns the receiving half
    /// of its queue; the caller spawns a writer task over it (§4.5's
    /// per-track writer task, reused for the fan-out path).
    pub fn add_reader(&mut self, reader_id: String, capacity: usize) -> write_queue::WriteQueueReceiver<OutboundPacket> {
        let (tx, rx) = write_queue::bounded(capacity);
        self.readers.insert(reader_id, tx);
        rx
    }

    pub fn remove_reader(&mut self, reader_id: &str) {
        self.readers.remove(reader_id);
    }

    /// Best-effort fan-out: each reader that's full is logged and skipped,
    /// never blocking the others or the publisher (§5's "best effort per
    /// reader" requirement).
    pub fn publish_rtp(&self, data: Bytes) {
        self.publish(OutboundPacket::Rtp(data));
    }

    pub fn publish_rtcp(&self, data: Bytes) {
        self.publish(OutboundPacket::Rtcp(data));
    }

    fn publish(&self, pkt: OutboundPacket) {
        for (reader_id, tx) in &self.readers {
            if let Err(e) = tx.push(pkt.clone()) {
                debug!("reader {} dropped a packet: {}", reader_id, e);
            }
        }
    }
}

impl Default for StreamDistributor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fan_out_reaches_every_reader() {
        let mut dist = StreamDistributor::new();
        let mut rx_a = dist.add_reader("a".to_owned(), 4);
        let mut rx_b = dist.add_reader("b".to_owned(), 4);
        dist.publish_rtp(Bytes::from_static(b"pkt"));
        assert!(matches!(rx_a.pop().await, Some(OutboundPacket::Rtp(_))));
        assert!(matches!(rx_b.pop().await, Some(OutboundPacket::Rtp(_))));
    }

    #[tokio::test]
    async fn slow_reader_drops_without_affecting_others() {
        let mut dist = StreamDistributor::new();
        let _rx_slow = dist.add_reader("slow".to_owned(), 1);
        let mut rx_fast = dist.add_reader("fast".to_owned(), 4);
        dist.publish_rtp(Bytes::from_static(b"1"));
        dist.publish_rtp(Bytes::from_static(b"2")); // overflows "slow"'s queue of 1
        assert!(rx_fast.pop().await.is_some());
        assert!(rx_fast.pop().await.is_some());
    }

    #[test]
    fn remove_reader_stops_future_fan_out() {
        let mut dist = StreamDistributor::new();
        dist.add_reader("a".to_owned(), 4);
        assert_eq!(dist.reader_count(), 1);
        dist.remove_reader("a");
        assert_eq!(dist.reader_count(), 0);
    }
}
