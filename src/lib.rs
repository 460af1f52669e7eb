// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Core RTSP 1.0 client/server library: session state machines, the
//! RTSP/interleaved-frame message framer, authentication, and the
//! UDP/UDP-multicast/TCP transport multiplexer.
//!
//! SDP parsing and RTP/RTCP payload marshalling are treated as external
//! collaborators (see [`description`] and [`codec`]) rather than fully
//! modeled here; this crate owns the protocol state machines and the
//! bytes-on-the-wire plumbing around them.

use log::trace;
use rand::Rng;
use std::fmt::{Debug, Display};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::num::NonZeroU32;
use std::ops::Range;

mod error;

pub use error::{Error, ErrorKind};

pub(crate) use error::ErrorInt;

/// Wraps the supplied `ErrorInt` and returns it as an `Err`.
macro_rules! bail {
    ($e:expr) => {
        return Err($crate::Error::from($e))
    };
}
pub(crate) use bail;

/// Wraps the supplied `ErrorInt` as an `Error` without returning.
macro_rules! wrap {
    ($e:expr) => {
        $crate::Error::from($e)
    };
}
pub(crate) use wrap;

pub mod auth;
pub mod client;
pub mod codec;
pub mod description;
pub mod message;
pub mod server;
pub mod timers;
pub mod transport;
pub mod transport_mux;

pub static X_ACCEPT_DYNAMIC_RATE: once_cell::sync::Lazy<rtsp_types::HeaderName> =
    once_cell::sync::Lazy::new(|| {
        rtsp_types::HeaderName::from_static_str("x-Accept-Dynamic-Rate").expect("is ascii")
    });

/// A monotonically increasing timestamp within an RTP stream.
///
/// The [Display]/[Debug] impls show the bottom 32 bits (as seen on the wire), the
/// full unwrapped timestamp, and the normal-play-time (NPT) offset since stream start.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct Timestamp {
    /// Must be compared against `start`; top bits are inferred from 32-bit wraparound.
    timestamp: i64,
    clock_rate: NonZeroU32,
    /// The stream's starting RTP timestamp, as given by the `RTP-Info` header (client)
    /// or chosen at `RECORD`/`PLAY` time (server).
    start: u32,
}

impl Timestamp {
    /// Creates a new timestamp unless `timestamp - start` underflows.
    #[inline]
    pub fn new(timestamp: i64, clock_rate: NonZeroU32, start: u32) -> Option<Self> {
        timestamp.checked_sub(i64::from(start)).map(|_| Timestamp {
            timestamp,
            clock_rate,
            start,
        })
    }

    #[inline]
    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    #[inline]
    pub fn start(&self) -> u32 {
        self.start
    }

    #[inline]
    pub fn clock_rate(&self) -> NonZeroU32 {
        self.clock_rate
    }

    /// Elapsed time since stream start, in clock-rate units.
    #[inline]
    pub fn elapsed(&self) -> i64 {
        self.timestamp - i64::from(self.start)
    }

    /// Elapsed time since stream start, in seconds (RTSP "normal play time").
    #[inline]
    pub fn elapsed_secs(&self) -> f64 {
        (self.elapsed() as f64) / (self.clock_rate.get() as f64)
    }

    /// Returns `self + delta` unless it would overflow.
    pub fn try_add(&self, delta: u32) -> Option<Self> {
        self.timestamp
            .checked_add(i64::from(delta))
            .map(|timestamp| Timestamp {
                timestamp,
                clock_rate: self.clock_rate,
                start: self.start,
            })
    }
}

impl Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} (mod-2^32: {}), npt {:.03}",
            self.timestamp,
            self.timestamp as u32,
            self.elapsed_secs()
        )
    }
}

impl Debug for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}

pub const UNIX_EPOCH: NtpTimestamp = NtpTimestamp(2_208_988_800 << 32);

/// A wallclock time in Network Time Protocol format: 32 bits of seconds since the
/// NTP epoch, 32 bits of fraction. Carried by RTCP sender reports; not necessarily
/// sourced from a real NTP server, and allowed to jump backwards or be nonsense.
#[derive(Copy, Clone, PartialEq, PartialOrd, Eq, Ord)]
pub struct NtpTimestamp(pub u64);

impl std::fmt::Debug for NtpTimestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:#018x}", self.0)
    }
}

/// A wall time taken from the local realtime clock, used only for diagnostics.
#[derive(Copy, Clone, Debug)]
pub struct WallTime(std::time::SystemTime);

impl WallTime {
    fn now() -> Self {
        Self(std::time::SystemTime::now())
    }
}

impl Display for WallTime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => write!(f, "{}.{:03}", d.as_secs(), d.subsec_millis()),
            Err(_) => write!(f, "<before-epoch>"),
        }
    }
}

/// Context identifying one connection, for inclusion in errors/logs -- enough to
/// pick the flow out of a packet capture.
#[derive(Copy, Clone, Debug)]
pub struct ConnectionContext {
    pub local_addr: SocketAddr,
    pub peer_addr: SocketAddr,
    established_wall: WallTime,
    established: std::time::Instant,
}

impl ConnectionContext {
    pub fn new(local_addr: SocketAddr, peer_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            peer_addr,
            established_wall: WallTime::now(),
            established: std::time::Instant::now(),
        }
    }

    #[doc(hidden)]
    pub fn dummy() -> Self {
        let addr = SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), 0);
        Self::new(addr, addr)
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.established.elapsed()
    }
}

impl Display for ConnectionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}<->{}@{}",
            &self.local_addr, &self.peer_addr, &self.established_wall
        )
    }
}

/// Context of one received (or sent) RTSP message within a connection's byte stream.
#[derive(Copy, Clone, Debug)]
pub struct RtspMessageContext {
    /// Starting byte position within the connection's input stream.
    pos: u64,
    received_wall: WallTime,
    received: std::time::Instant,
}

impl RtspMessageContext {
    pub fn new(pos: u64) -> Self {
        Self {
            pos,
            received_wall: WallTime::now(),
            received: std::time::Instant::now(),
        }
    }

    #[doc(hidden)]
    pub fn dummy() -> Self {
        Self::new(0)
    }

    pub fn received(&self) -> std::time::Instant {
        self.received
    }

    pub fn pos(&self) -> u64 {
        self.pos
    }
}

impl Display for RtspMessageContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.pos, &self.received_wall)
    }
}

/// Returns the byte range within `buf` that `subset` occupies.
/// Returns `None` if `subset` is empty; panics if `subset` isn't within `buf`.
pub(crate) fn as_range(buf: &[u8], subset: &[u8]) -> Option<Range<usize>> {
    if subset.is_empty() {
        return None;
    }
    let subset_p = subset.as_ptr() as usize;
    let buf_p = buf.as_ptr() as usize;
    let off = subset_p
        .checked_sub(buf_p)
        .unwrap_or_else(|| panic!("{}-byte subset not within {}-byte buf", subset.len(), buf.len()));
    let end = off + subset.len();
    assert!(end <= buf.len());
    Some(off..end)
}

/// A pair of local UDP sockets for one track's RTP/RTCP traffic. The RTP port is
/// always even; the RTCP port is always the next (odd) integer, per §9's
/// client-port-pairing design note.
pub(crate) struct UdpPair {
    pub rtp_port: u16,
    pub rtp_socket: UdpSocket,
    pub rtcp_socket: UdpSocket,
}

impl UdpPair {
    /// Picks two consecutive free ports within `range` (even/odd), retrying on conflict.
    pub fn for_ip(ip_addr: IpAddr, range: Range<u16>) -> Result<Self, std::io::Error> {
        const MAX_TRIES: usize = 10;
        let mut rng = rand::thread_rng();
        let even_range = range.start..range.end.saturating_sub(1).max(range.start);
        for i in 0..MAX_TRIES {
            let rtp_port = rng.gen_range(even_range.clone()) & !0b1;
            let rtp_addr = SocketAddr::new(ip_addr, rtp_port);
            let rtp_socket = match UdpSocket::bind(rtp_addr) {
                Ok(s) => s,
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    trace!("try {}/{}: unable to bind RTP addr {:?}", i, MAX_TRIES, rtp_addr);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let rtcp_addr = SocketAddr::new(ip_addr, rtp_port + 1);
            let rtcp_socket = match UdpSocket::bind(rtcp_addr) {
                Ok(s) => s,
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    trace!("try {}/{}: unable to bind RTCP addr {:?}", i, MAX_TRIES, rtcp_addr);
                    continue;
                }
                Err(e) => return Err(e),
            };
            return Ok(Self {
                rtp_port,
                rtp_socket,
                rtcp_socket,
            });
        }
        Err(std::io::Error::new(
            std::io::ErrorKind::AddrInUse,
            format!(
                "unable to find a free even/odd port pair in {}:{}..{} after {} tries",
                ip_addr, range.start, range.end, MAX_TRIES
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    #[test]
    fn local_udp_pair() {
        UdpPair::for_ip(IpAddr::V4(Ipv4Addr::LOCALHOST), 20_000..20_100).unwrap();
    }

    #[test]
    fn timestamp_wraparound_add() {
        let ts = Timestamp::new(i64::from(u32::MAX) - 1, NonZeroU32::new(90_000).unwrap(), 0).unwrap();
        let ts2 = ts.try_add(10).unwrap();
        assert_eq!(ts2.timestamp(), i64::from(u32::MAX) + 9);
    }

    #[test]
    fn as_range_rejects_foreign_slice() {
        let buf = [0u8; 4];
        let other = [0u8; 4];
        assert!(std::panic::catch_unwind(|| as_range(&buf, &other[..])).is_err());
    }
}
