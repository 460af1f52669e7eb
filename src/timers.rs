// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `KeepaliveTimer` & `TimeoutSupervisor` (§4.6): the three independent
//! per-session timers (keep-alive, receive-timeout, periodic RTCP) expressed
//! as plain `tokio::time::Interval`/deadline wrappers that a session's event
//! loop polls via `tokio::select!` alongside command arrivals.

use std::time::Duration;

use tokio::time::{Instant, Interval};

/// Fires periodically so the caller can send a keep-alive (`OPTIONS` or
/// `GET_PARAMETER`), rescaled whenever the server's `Session: timeout=`
/// becomes known.
pub struct KeepaliveTimer {
    interval: Interval,
    period: Duration,
}

impl KeepaliveTimer {
    pub fn new(period: Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        Self { interval, period }
    }

    pub async fn tick(&mut self) -> Instant {
        self.interval.tick().await
    }

    /// Replaces the period (e.g. once a `Session: timeout=N` is known),
    /// taking effect from the next tick.
    pub fn reset(&mut self, period: Duration) {
        self.period = period;
        self.interval = tokio::time::interval(period);
        self.interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    }

    pub fn period(&self) -> Duration {
        self.period
    }
}

/// What a lapsed timeout means the caller should do, per §4.6's
/// mode-dependent `check-timeout` semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutAction {
    /// Initial UDP window expired with no packets: switch to TCP.
    SwitchToTcp,
    /// Steady-state read-timeout expired: terminate the session.
    Terminate,
}

/// Tracks the deadline for "some packet must arrive by now", reset on every
/// observed packet; distinguishes the initial UDP probe window from the
/// steady-state read-timeout per §4.6.
pub struct TimeoutSupervisor {
    last_packet: Instant,
    initial_udp_read_timeout: Duration,
    read_timeout: Duration,
    saw_any_packet: bool,
}

impl TimeoutSupervisor {
    pub fn new(initial_udp_read_timeout: Duration, read_timeout: Duration) -> Self {
        Self {
            last_packet: Instant::now(),
            initial_udp_read_timeout,
            read_timeout,
            saw_any_packet: false,
        }
    }

    /// Records that a packet (RTP, RTCP, or TCP-interleaved frame) was just
    /// observed on some track, resetting the deadline.
    pub fn record_packet(&mut self) {
        self.last_packet = Instant::now();
        self.saw_any_packet = true;
    }

    /// Checks whether the applicable deadline has passed. The initial-window
    /// deadline only applies until the first packet is seen; after that,
    /// `read_timeout` governs.
    pub fn check(&self) -> Option<TimeoutAction> {
        let elapsed = self.last_packet.elapsed();
        if !self.saw_any_packet {
            if elapsed >= self.initial_udp_read_timeout {
                return Some(TimeoutAction::SwitchToTcp);
            }
            return None;
        }
        if elapsed >= self.read_timeout {
            return Some(TimeoutAction::Terminate);
        }
        None
    }

    /// The duration until this supervisor's next deadline, for use as a
    /// `tokio::time::sleep` target in a `select!` arm.
    pub fn deadline(&self) -> Instant {
        let timeout = if self.saw_any_packet {
            self.read_timeout
        } else {
            self.initial_udp_read_timeout
        };
        self.last_packet + timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_window_with_no_packets_switches_to_tcp() {
        let mut sup = TimeoutSupervisor::new(Duration::from_millis(0), Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(1));
        assert_eq!(sup.check(), Some(TimeoutAction::SwitchToTcp));
        sup.record_packet();
        assert_eq!(sup.check(), None);
    }

    #[test]
    fn steady_state_times_out_after_read_timeout() {
        let mut sup = TimeoutSupervisor::new(Duration::from_secs(3), Duration::from_millis(0));
        sup.record_packet();
        std::thread::sleep(Duration::from_millis(1));
        assert_eq!(sup.check(), Some(TimeoutAction::Terminate));
    }

    #[tokio::test]
    async fn keepalive_timer_reset_changes_period() {
        let mut t = KeepaliveTimer::new(Duration::from_secs(30));
        assert_eq!(t.period(), Duration::from_secs(30));
        t.reset(Duration::from_secs(10));
        assert_eq!(t.period(), Duration::from_secs(10));
    }
}
