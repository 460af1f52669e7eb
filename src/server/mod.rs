// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The server half: a connection-oriented request router
//! ([`connection::ServerConnection`]) driving one or more session state
//! machines ([`session::ServerSession`]), with a publish-path fan-out
//! ([`distributor::StreamDistributor`]) for RECORDed media.

pub mod connection;
pub mod distributor;
pub mod registry;
pub mod session;

use std::net::Ipv4Addr;
use std::ops::Range;
use std::time::Duration;

pub use connection::{Handler, Observer, ServerConnection};
pub use distributor::StreamDistributor;
pub use registry::DistributorRegistry;
pub use session::{AnnouncedTrack, Mode, RequestError, ServerSession, SessionCloseReason, SessionHandle};

/// Default port range offered to UDP SETUPs when none is configured.
const DEFAULT_UDP_PORT_RANGE: Range<u16> = 20_000..20_100;

/// Tunables for a [`ServerConnection`] and the sessions it creates (§10.3 of
/// the expanded spec). A plain builder struct, as `client::SessionOptions`
/// is on the other side of the wire.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// `WWW-Authenticate`/`Authorization` schemes this server advertises and
    /// accepts; empty means no authentication is required.
    pub auth_schemes: Vec<crate::auth::Scheme>,
    pub realm: String,
    /// The single credential pair [`crate::auth::AuthEngine`] challenges
    /// for; unused when `auth_schemes` is empty.
    pub username: String,
    pub password: String,
    pub udp_port_range: Range<u16>,
    pub multicast_group: Option<Ipv4Addr>,
    pub multicast_ttl: u8,
    /// Accept UDP source IPs that don't match the negotiated source port
    /// (some NATed publishers rewrite only the port).
    pub any_port_enable: bool,
    /// How long a RECORD session may go without a UDP packet before it's
    /// considered dead (§4.6's `NoUDPPacketsInAWhile`).
    pub read_timeout: Duration,
    /// How long a session with no in-flight request may sit idle before
    /// being torn down.
    pub session_timeout: Duration,
    /// Largest Request-Line + headers this connection's framer will accept
    /// before answering 413/400 and closing.
    pub max_request_size: usize,
    /// Largest body (an ANNOUNCEd SDP payload, chiefly) this connection's
    /// framer will accept.
    pub max_body_size: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            auth_schemes: Vec::new(),
            realm: "rtsp-core".to_owned(),
            username: String::new(),
            password: String::new(),
            udp_port_range: DEFAULT_UDP_PORT_RANGE,
            multicast_group: None,
            multicast_ttl: 127,
            any_port_enable: false,
            read_timeout: Duration::from_secs(60),
            session_timeout: Duration::from_secs(60),
            max_request_size: 16 * 1024,
            max_body_size: 1024 * 1024,
        }
    }
}

impl ServerOptions {
    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }

    pub fn with_auth_schemes(mut self, schemes: Vec<crate::auth::Scheme>) -> Self {
        self.auth_schemes = schemes;
        self
    }

    pub fn with_credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    pub fn with_udp_port_range(mut self, range: Range<u16>) -> Self {
        self.udp_port_range = range;
        self
    }

    pub fn with_multicast_group(mut self, group: Ipv4Addr, ttl: u8) -> Self {
        self.multicast_group = Some(group);
        self.multicast_ttl = ttl;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }
}
