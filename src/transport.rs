// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Transport header grammar (§6): parsing and canonical serialization of the
//! `Transport:` header, and the resolved [`TransportSpec`] a `SETUP` either
//! side agrees to.

use std::net::IpAddr;

/// `RTP/AVP` carried over UDP or TCP-interleaved; multicast is a `delivery`,
/// not a protocol, per the grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Unicast,
    Multicast,
}

/// One parsed `Transport:` header entry. Fields not present on the wire are
/// `None`; a caller then derives the concrete substrate (UDP unicast, UDP
/// multicast, TCP-interleaved) from `protocol`/`delivery`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportHeader {
    pub protocol: Option<Protocol>,
    pub delivery: Option<Delivery>,
    pub client_port: Option<(u16, u16)>,
    pub server_port: Option<(u16, u16)>,
    pub interleaved: Option<(u8, u8)>,
    pub ssrc: Option<u32>,
    pub mode_record: Option<bool>,
    pub destination: Option<IpAddr>,
    pub port: Option<(u16, u16)>,
    pub ttl: Option<u8>,
}

/// The transport substrate a SETUP actually bound, after validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportSpec {
    Udp {
        client_port: (u16, u16),
        server_port: Option<(u16, u16)>,
    },
    UdpMulticast {
        destination: IpAddr,
        port: (u16, u16),
        ttl: u8,
    },
    Tcp {
        channel: (u8, u8),
    },
}

impl TransportSpec {
    /// Builds the `Transport:` header this spec serializes to, for echoing a
    /// resolved SETUP back to its caller (§4.4).
    pub fn to_header(&self) -> TransportHeader {
        match *self {
            TransportSpec::Udp { client_port, server_port } => TransportHeader {
                protocol: Some(Protocol::Udp),
                delivery: Some(Delivery::Unicast),
                client_port: Some(client_port),
                server_port,
                ..Default::default()
            },
            TransportSpec::UdpMulticast { destination, port, ttl } => TransportHeader {
                protocol: Some(Protocol::Udp),
                delivery: Some(Delivery::Multicast),
                destination: Some(destination),
                port: Some(port),
                ttl: Some(ttl),
                ..Default::default()
            },
            TransportSpec::Tcp { channel } => TransportHeader {
                protocol: Some(Protocol::Tcp),
                delivery: Some(Delivery::Unicast),
                interleaved: Some(channel),
                ..Default::default()
            },
        }
    }
}

fn parse_port_pair(s: &str) -> Result<(u16, u16), String> {
    let (a, b) = s
        .split_once('-')
        .ok_or_else(|| format!("port range {:?} missing '-'", s))?;
    let a: u16 = a.parse().map_err(|_| format!("bad port {:?}", a))?;
    let b: u16 = b.parse().map_err(|_| format!("bad port {:?}", b))?;
    Ok((a, b))
}

fn parse_channel_pair(s: &str) -> Result<(u8, u8), String> {
    let (a, b) = s
        .split_once('-')
        .ok_or_else(|| format!("channel range {:?} missing '-'", s))?;
    let a: u8 = a.parse().map_err(|_| format!("bad channel {:?}", a))?;
    let b: u8 = b.parse().map_err(|_| format!("bad channel {:?}", b))?;
    Ok((a, b))
}

/// Validates a channel pair is `(k, k+1)` with `k` even, per §3's invariant.
pub fn validate_channel_pair(pair: (u8, u8)) -> Result<(), String> {
    let (a, b) = pair;
    if a % 2 != 0 {
        return Err(format!("interleaved channel {} is not even", a));
    }
    if a.checked_add(1) != Some(b) {
        return Err(format!("expected adjacent channels; got {}-{}", a, b));
    }
    Ok(())
}

/// Validates a UDP client-port pair is `(k, k+1)` with `k` even, rejecting
/// mismatched pairs as `InvalidPorts` (§9 open question, resolved: reject
/// rather than silently reassigning the RTCP port).
pub fn validate_client_ports(pair: (u16, u16)) -> Result<(), String> {
    let (a, b) = pair;
    if a % 2 != 0 {
        return Err(format!("client_port {} is not even", a));
    }
    if a.checked_add(1) != Some(b) {
        return Err(format!("expected adjacent client ports; got {}-{}", a, b));
    }
    Ok(())
}

impl TransportHeader {
    /// Parses one `Transport:` header value. A header may list several
    /// comma-separated transport specs in preference order; this parses
    /// only the first, which is what every SETUP this crate sends or
    /// accepts uses.
    pub fn parse(value: &str) -> Result<Self, String> {
        let first = value.split(',').next().unwrap_or("");
        let mut parts = first.split(';');
        let spec = parts.next().ok_or_else(|| "empty Transport header".to_owned())?;
        let (protocol, delivery) = match spec.trim() {
            "RTP/AVP" | "RTP/AVP/UDP" => (Some(Protocol::Udp), None),
            "RTP/AVP/TCP" => (Some(Protocol::Tcp), None),
            other => return Err(format!("unrecognized Transport spec {:?}", other)),
        };
        let mut header = TransportHeader {
            protocol,
            delivery,
            ..Default::default()
        };
        for part in parts {
            let part = part.trim();
            if part.eq_ignore_ascii_case("unicast") {
                header.delivery = Some(Delivery::Unicast);
            } else if part.eq_ignore_ascii_case("multicast") {
                header.delivery = Some(Delivery::Multicast);
            } else if let Some(v) = part.strip_prefix("client_port=") {
                header.client_port = Some(parse_port_pair(v)?);
            } else if let Some(v) = part.strip_prefix("server_port=") {
                header.server_port = Some(parse_port_pair(v)?);
            } else if let Some(v) = part.strip_prefix("interleaved=") {
                header.interleaved = Some(parse_channel_pair(v)?);
            } else if let Some(v) = part.strip_prefix("ssrc=") {
                header.ssrc = Some(u32::from_str_radix(v, 16).map_err(|_| format!("bad ssrc {:?}", v))?);
            } else if let Some(v) = part.strip_prefix("mode=") {
                let v = v.trim_matches('"');
                header.mode_record = Some(v.eq_ignore_ascii_case("RECORD"));
            } else if let Some(v) = part.strip_prefix("destination=") {
                header.destination = Some(v.parse().map_err(|_| format!("bad destination {:?}", v))?);
            } else if let Some(v) = part.strip_prefix("port=") {
                header.port = Some(parse_port_pair(v)?);
            } else if let Some(v) = part.strip_prefix("ttl=") {
                header.ttl = Some(v.parse().map_err(|_| format!("bad ttl {:?}", v))?);
            }
            // Unknown parameters are ignored rather than rejected; servers
            // routinely add vendor extensions here.
        }
        Ok(header)
    }

    /// Derives the concrete substrate this header describes, validating the
    /// invariants a SETUP must enforce (§4.4): channel-pair parity and
    /// client-port parity.
    pub fn to_spec(&self) -> Result<TransportSpec, String> {
        match (self.protocol, self.delivery) {
            (Some(Protocol::Tcp), _) => {
                let channel = self
                    .interleaved
                    .ok_or_else(|| "TCP transport missing interleaved= parameter".to_owned())?;
                validate_channel_pair(channel)?;
                Ok(TransportSpec::Tcp { channel })
            }
            (Some(Protocol::Udp), Some(Delivery::Multicast)) => {
                let destination = self
                    .destination
                    .ok_or_else(|| "multicast transport missing destination=".to_owned())?;
                let port = self.port.ok_or_else(|| "multicast transport missing port=".to_owned())?;
                Ok(TransportSpec::UdpMulticast {
                    destination,
                    port,
                    ttl: self.ttl.unwrap_or(127),
                })
            }
            (Some(Protocol::Udp), _) => {
                let client_port = self
                    .client_port
                    .ok_or_else(|| "UDP unicast transport missing client_port=".to_owned())?;
                validate_client_ports(client_port)?;
                Ok(TransportSpec::Udp {
                    client_port,
                    server_port: self.server_port,
                })
            }
            (None, _) => Err("Transport header missing a protocol".to_owned()),
        }
    }

    /// Serialises back to wire form; fields are written in the grammar's
    /// documented order, case-sensitively (§6).
    pub fn write(&self) -> String {
        let mut s = match self.protocol {
            Some(Protocol::Tcp) => "RTP/AVP/TCP".to_owned(),
            Some(Protocol::Udp) | None => "RTP/AVP".to_owned(),
        };
        match self.delivery {
            Some(Delivery::Unicast) => s.push_str(";unicast"),
            Some(Delivery::Multicast) => s.push_str(";multicast"),
            None => {}
        }
        if let Some((a, b)) = self.client_port {
            s.push_str(&format!(";client_port={}-{}", a, b));
        }
        if let Some((a, b)) = self.server_port {
            s.push_str(&format!(";server_port={}-{}", a, b));
        }
        if let Some((a, b)) = self.interleaved {
            s.push_str(&format!(";interleaved={}-{}", a, b));
        }
        if let Some(ssrc) = self.ssrc {
            s.push_str(&format!(";ssrc={:08x}", ssrc));
        }
        if let Some(record) = self.mode_record {
            s.push_str(if record { ";mode=\"RECORD\"" } else { ";mode=\"PLAY\"" });
        }
        if let Some(dest) = self.destination {
            s.push_str(&format!(";destination={}", dest));
        }
        if let Some((a, b)) = self.port {
            s.push_str(&format!(";port={}-{}", a, b));
        }
        if let Some(ttl) = self.ttl {
            s.push_str(&format!(";ttl={}", ttl));
        }
        s
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_interleaved() {
        let h = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=0-1").unwrap();
        assert_eq!(h.to_spec().unwrap(), TransportSpec::Tcp { channel: (0, 1) });
    }

    #[test]
    fn rejects_non_adjacent_channels() {
        let h = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=0-5").unwrap();
        assert!(h.to_spec().is_err());
    }

    #[test]
    fn rejects_odd_leading_channel() {
        let h = TransportHeader::parse("RTP/AVP/TCP;unicast;interleaved=1-2").unwrap();
        assert!(h.to_spec().is_err());
    }

    #[test]
    fn parses_udp_unicast_client_port() {
        let h = TransportHeader::parse("RTP/AVP;unicast;client_port=6970-6971").unwrap();
        assert_eq!(
            h.to_spec().unwrap(),
            TransportSpec::Udp {
                client_port: (6970, 6971),
                server_port: None,
            }
        );
    }

    #[test]
    fn rejects_mismatched_client_port_pair() {
        let h = TransportHeader::parse("RTP/AVP;unicast;client_port=6970-7100").unwrap();
        assert!(h.to_spec().is_err());
    }

    #[test]
    fn round_trips_write_then_parse() {
        let mut h = TransportHeader {
            protocol: Some(Protocol::Udp),
            delivery: Some(Delivery::Unicast),
            client_port: Some((6970, 6971)),
            ssrc: Some(0xdeadbeef),
            ..Default::default()
        };
        let written = h.write();
        let reparsed = TransportHeader::parse(&written).unwrap();
        h.mode_record = None;
        assert_eq!(reparsed.client_port, Some((6970, 6971)));
        assert_eq!(reparsed.ssrc, Some(0xdeadbeef));
    }

    #[test]
    fn parses_multicast_with_default_ttl() {
        let h = TransportHeader::parse("RTP/AVP;multicast;destination=239.1.1.1;port=5000-5001").unwrap();
        match h.to_spec().unwrap() {
            TransportSpec::UdpMulticast { ttl, .. } => assert_eq!(ttl, 127),
            other => panic!("expected multicast, got {:?}", other),
        }
    }
}
