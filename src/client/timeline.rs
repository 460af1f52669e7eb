// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Tracks a monotonically-advancing, wraparound-corrected [`crate::Timestamp`] per stream.

use std::num::NonZeroU32;

use crate::Timestamp;

/// Unwraps 32-bit RTP timestamps onto a continuous `i64` line and exposes them as
/// [`Timestamp`]s relative to the stream's starting RTP timestamp.
#[derive(Debug)]
pub struct Timeline {
    clock_rate: NonZeroU32,
    start: u32,
    prev: Option<i64>,
}

impl Timeline {
    pub fn new(start_rtptime: Option<u32>, clock_rate: u32) -> Result<Self, String> {
        let clock_rate =
            NonZeroU32::new(clock_rate).ok_or_else(|| "clock rate must be non-zero".to_owned())?;
        Ok(Self {
            clock_rate,
            start: start_rtptime.unwrap_or(0),
            prev: None,
        })
    }

    /// Advances the timeline to `rtp_timestamp`, correcting for 32-bit wraparound
    /// relative to the most recently seen timestamp, and remembers the result.
    pub fn advance_to(&mut self, rtp_timestamp: u32) -> Result<Timestamp, String> {
        let next = self.unwrap(rtp_timestamp);
        self.prev = Some(next);
        Timestamp::new(next, self.clock_rate, self.start)
            .ok_or_else(|| format!("timestamp {} underflows stream start {}", next, self.start))
    }

    /// Like [`Self::advance_to`] but doesn't remember the result; used for RTCP
    /// sender reports, whose timestamps may arrive out of band from the RTP sequence.
    pub fn place(&self, rtp_timestamp: u32) -> Result<Timestamp, String> {
        let next = self.unwrap(rtp_timestamp);
        Timestamp::new(next, self.clock_rate, self.start)
            .ok_or_else(|| format!("timestamp {} underflows stream start {}", next, self.start))
    }

    fn unwrap(&self, rtp_timestamp: u32) -> i64 {
        match self.prev {
            None => i64::from(rtp_timestamp),
            Some(prev) => {
                let delta = rtp_timestamp.wrapping_sub(prev as u32) as i32;
                prev + i64::from(delta)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advances_monotonically() {
        let mut t = Timeline::new(Some(1000), 90_000).unwrap();
        let a = t.advance_to(1000).unwrap();
        assert_eq!(a.elapsed(), 0);
        let b = t.advance_to(1000 + 90_000).unwrap();
        assert_eq!(b.elapsed(), 90_000);
    }

    #[test]
    fn handles_wraparound() {
        let mut t = Timeline::new(Some(0), 90_000).unwrap();
        let near_wrap = u32::MAX - 10;
        let a = t.advance_to(near_wrap).unwrap();
        assert_eq!(a.timestamp(), i64::from(near_wrap));
        let b = t.advance_to(20);
        // 20 wraps past u32::MAX relative to near_wrap; unwrap should land just after it.
        let b = b.unwrap();
        assert!(b.timestamp() > a.timestamp());
    }

    #[test]
    fn place_does_not_mutate() {
        let mut t = Timeline::new(Some(0), 90_000).unwrap();
        t.advance_to(1000).unwrap();
        let placed = t.place(5000).unwrap();
        let advanced = t.advance_to(1000).unwrap();
        assert_eq!(advanced.elapsed(), 1000);
        assert!(placed.elapsed() >= 1000);
    }

    #[test]
    fn rejects_zero_clock_rate() {
        assert!(Timeline::new(None, 0).is_err());
    }
}
