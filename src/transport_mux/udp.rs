// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! UDP unicast and multicast substrates (§4.5): a pair of sockets per track
//! (RTP even port, RTCP odd port), with inbound source validation and
//! firewall-puncture support.

use std::net::{Ipv4Addr, SocketAddr};

use tokio::net::UdpSocket;

/// One track's UDP unicast read/write path. Sockets are always a
/// consecutive even/odd pair, per [`crate::UdpPair`].
pub struct UdpSubstrate {
    rtp: UdpSocket,
    rtcp: UdpSocket,
    /// The peer this track expects to exchange packets with, once learned
    /// from the `Transport` header negotiation. `None` means "accept
    /// anything" (only sensible before that's known).
    expected_peer: Option<SocketAddr>,
    /// When set, only the source IP is checked, not the source port;
    /// accommodates servers whose RTP source port doesn't match their
    /// advertised `server_port` (§4.5's `any-port-enable`).
    any_port_enable: bool,
}

impl UdpSubstrate {
    /// Wraps an already-bound [`crate::UdpPair`] (setting both sockets
    /// non-blocking, as `tokio::net::UdpSocket::from_std` requires).
    pub fn from_pair(pair: crate::UdpPair, expected_peer: Option<SocketAddr>, any_port_enable: bool) -> std::io::Result<Self> {
        pair.rtp_socket.set_nonblocking(true)?;
        pair.rtcp_socket.set_nonblocking(true)?;
        Ok(Self {
            rtp: UdpSocket::from_std(pair.rtp_socket)?,
            rtcp: UdpSocket::from_std(pair.rtcp_socket)?,
            expected_peer,
            any_port_enable,
        })
    }

    pub fn local_rtp_addr(&self) -> std::io::Result<SocketAddr> {
        self.rtp.local_addr()
    }

    pub fn local_rtcp_addr(&self) -> std::io::Result<SocketAddr> {
        self.rtcp.local_addr()
    }

    pub fn set_expected_peer(&mut self, peer: SocketAddr) {
        self.expected_peer = Some(peer);
    }

    fn source_allowed(&self, from: SocketAddr) -> bool {
        match self.expected_peer {
            None => true,
            Some(expected) if self.any_port_enable => expected.ip() == from.ip(),
            Some(expected) => expected == from,
        }
    }

    /// Reads one RTP datagram; returns `None` (and logs nothing itself --
    /// callers decide) when the source doesn't match the expected peer.
    pub async fn recv_rtp(&self, buf: &mut [u8]) -> std::io::Result<Option<usize>> {
        let (n, from) = self.rtp.recv_from(buf).await?;
        Ok(if self.source_allowed(from) { Some(n) } else { None })
    }

    pub async fn recv_rtcp(&self, buf: &mut [u8]) -> std::io::Result<Option<usize>> {
        let (n, from) = self.rtcp.recv_from(buf).await?;
        Ok(if self.source_allowed(from) { Some(n) } else { None })
    }

    pub async fn send_rtp(&self, data: &[u8]) -> std::io::Result<()> {
        let peer = self.require_peer()?;
        self.rtp.send_to(data, peer).await.map(|_| ())
    }

    pub async fn send_rtcp(&self, data: &[u8]) -> std::io::Result<()> {
        let peer = self.require_peer()?;
        self.rtcp.send_to(data, SocketAddr::new(peer.ip(), peer.port() + 1)).await.map(|_| ())
    }

    fn require_peer(&self) -> std::io::Result<SocketAddr> {
        self.expected_peer
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotConnected, "no peer address known yet"))
    }

    /// Sends one empty RTP and one empty RTCP packet to punch a path through
    /// NAT/firewall state ahead of media flowing, per §4.5.
    pub async fn puncture(&self) -> std::io::Result<()> {
        self.send_rtp(&[]).await?;
        self.send_rtcp(&[]).await?;
        Ok(())
    }
}

/// One track's UDP multicast read/write path: a pair of listeners joined to
/// a shared group address. Puncturing is suppressed here to avoid a
/// self-loop (§4.5).
pub struct MulticastSubstrate {
    rtp: UdpSocket,
    rtcp: UdpSocket,
    group: Ipv4Addr,
}

impl MulticastSubstrate {
    /// Joins `group`/`port` (RTP) and `port + 1` (RTCP) on `interface`,
    /// scoping outbound multicast traffic to `ttl` hops so a session's media
    /// doesn't leak past the advertised `Transport: ...;ttl=` value (§4.5).
    pub fn join(group: Ipv4Addr, port: u16, interface: Ipv4Addr, ttl: u8) -> std::io::Result<Self> {
        let rtp_std = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port))?;
        rtp_std.set_nonblocking(true)?;
        rtp_std.set_multicast_ttl_v4(u32::from(ttl))?;
        let rtp = UdpSocket::from_std(rtp_std)?;
        rtp.join_multicast_v4(group, interface)?;

        let rtcp_std = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port + 1))?;
        rtcp_std.set_nonblocking(true)?;
        rtcp_std.set_multicast_ttl_v4(u32::from(ttl))?;
        let rtcp = UdpSocket::from_std(rtcp_std)?;
        rtcp.join_multicast_v4(group, interface)?;

        Ok(Self { rtp, rtcp, group })
    }

    pub fn group(&self) -> Ipv4Addr {
        self.group
    }

    /// Readers must add themselves so RTCP feedback is accepted only from
    /// known source IPs (§4.5); this is a no-op placeholder for source
    /// tracking that a fuller implementation would maintain per-reader.
    pub async fn recv_rtp(&self, buf: &mut [u8]) -> std::io::Result<usize> {
        let (n, _from) = self.rtp.recv_from(buf).await?;
        Ok(n)
    }

    pub async fn recv_rtcp(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.rtcp.recv_from(buf).await
    }

    pub async fn send_rtp(&self, data: &[u8], port: u16) -> std::io::Result<()> {
        self.rtp.send_to(data, SocketAddr::new(self.group.into(), port)).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::IpAddr;

    #[tokio::test]
    async fn unicast_round_trip_through_loopback() {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let a = crate::UdpPair::for_ip(ip, 31_000..31_100).unwrap();
        let a_rtp_port = a.rtp_port;
        let b = crate::UdpPair::for_ip(ip, 31_000..31_100).unwrap();
        let b_rtp_port = b.rtp_port;

        let a_sub = UdpSubstrate::from_pair(a, Some(SocketAddr::new(ip, b_rtp_port)), false).unwrap();
        let b_sub = UdpSubstrate::from_pair(b, Some(SocketAddr::new(ip, a_rtp_port)), false).unwrap();

        a_sub.send_rtp(b"hello").await.unwrap();
        let mut buf = [0u8; 16];
        let n = b_sub.recv_rtp(&mut buf).await.unwrap().unwrap();
        assert_eq!(&buf[..n], b"hello");
    }

    #[tokio::test]
    async fn drops_packets_from_unexpected_source() {
        let ip = IpAddr::V4(Ipv4Addr::LOCALHOST);
        let a = crate::UdpPair::for_ip(ip, 31_100..31_200).unwrap();
        let b = crate::UdpPair::for_ip(ip, 31_100..31_200).unwrap();
        let b_rtp_port = b.rtp_port;

        // a expects a bogus peer, so b's packet should be dropped.
        let bogus = SocketAddr::new(ip, 1);
        let a_sub = UdpSubstrate::from_pair(a, Some(bogus), false).unwrap();
        let b_sub = UdpSubstrate::from_pair(b, Some(SocketAddr::new(ip, 1)), false).unwrap();
        let _ = b_rtp_port;

        // Send directly to a's RTP port bypassing send_rtp's peer check.
        let a_rtp_addr = a_sub.local_rtp_addr().unwrap();
        b_sub.rtp.send_to(b"x", a_rtp_addr).await.unwrap();
        let mut buf = [0u8; 16];
        let got = a_sub.recv_rtp(&mut buf).await.unwrap();
        assert_eq!(got, None);
    }
}
