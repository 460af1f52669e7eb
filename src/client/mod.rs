// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Client-side RTSP: the [`ClientSession`] state machine (§4.3), SETUP/PLAY/
//! DESCRIBE response parsing, and the per-track packet types delivered to
//! observers.

pub mod parse;
pub mod rtp;
pub mod timeline;

use std::ops::Range;
use std::time::Duration;

use bytes::Bytes;
use log::{debug, info, warn};
use rtsp_types::Method;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};
use url::Url;

use crate::auth::Credentials;
use crate::description::{Presentation, Stream, StreamState};
use crate::message::MessageFramer;
use crate::timers::{KeepaliveTimer, TimeoutAction, TimeoutSupervisor};
use crate::transport_mux::udp::UdpSubstrate;
use crate::{bail, wrap, ConnectionContext, Error, ErrorInt};

/// Default keep-alive period used before a `Session: ...;timeout=` is known.
const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(30);
const KEEPALIVE_FRACTION: f64 = 0.8;
const INITIAL_UDP_READ_TIMEOUT: Duration = Duration::from_secs(3);
/// Default client-port range offered on UDP SETUPs, matching the conventional
/// `ffmpeg`/VLC client range rather than the server's ephemeral-looking one.
const DEFAULT_CLIENT_UDP_PORT_RANGE: Range<u16> = 6970..7070;

/// How a session's tracks get their RTP/RTCP carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

/// User-controllable policy for [`ClientSession`]. Constructed with defaults via
/// [`SessionOptions::default`], then customized with the builder methods.
///
/// Not `Clone`: a `Digest`-challenged [`Credentials`] carries `digest_auth`'s
/// internal nonce-count state, which isn't meant to be duplicated mid-session.
#[derive(Debug)]
pub struct SessionOptions {
    pub creds: Option<Credentials>,
    pub user_agent: String,
    /// Pins the transport rather than letting the session negotiate UDP-first
    /// with fallback to TCP, per §4.3.
    pub transport: Option<Transport>,
    pub initial_udp_read_timeout: Duration,
    /// Some cameras emit RTP data from stale sessions, or wrap interleaved
    /// frames inside other interleaved frames; when set, mismatched
    /// SSRC/framing is logged and dropped instead of erroring the session.
    pub ignore_spurious_data: bool,
    /// Local port range to try when binding a track's UDP socket pair.
    pub udp_port_range: Range<u16>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            creds: None,
            user_agent: "rtsp-core".to_owned(),
            transport: None,
            initial_udp_read_timeout: INITIAL_UDP_READ_TIMEOUT,
            ignore_spurious_data: false,
            udp_port_range: DEFAULT_CLIENT_UDP_PORT_RANGE,
        }
    }
}

impl SessionOptions {
    pub fn creds(mut self, creds: Option<Credentials>) -> Self {
        self.creds = creds;
        self
    }

    pub fn user_agent(mut self, user_agent: String) -> Self {
        self.user_agent = user_agent;
        self
    }

    pub fn transport(mut self, transport: Transport) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn udp_port_range(mut self, range: Range<u16>) -> Self {
        self.udp_port_range = range;
        self
    }
}

/// Which substrate one SETUP track ended up bound to.
enum TrackTransport {
    Udp(UdpSubstrate),
    Tcp { channel: (u8, u8) },
}

/// One item delivered to the application from a playing session.
#[derive(Debug)]
pub enum PacketItem {
    RtpPacket(rtp::Packet),
    SenderReport(rtp::SenderReport),
}

/// Reasons a session ended, passed to `on_session_close`.
#[derive(Debug, Clone)]
pub enum SessionCloseReason {
    Teardown,
    Error(Error),
}

/// The client-side session states from §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Initial,
    PrePlay,
    Play,
    PreRecord,
    Record,
}

impl State {
    fn name(self) -> &'static str {
        match self {
            State::Initial => "INITIAL",
            State::PrePlay => "PRE_PLAY",
            State::Play => "PLAY",
            State::PreRecord => "PRE_RECORD",
            State::Record => "RECORD",
        }
    }
}

/// Commands the public handle posts to the session task. Constructed only via
/// [`SessionHandle`]'s methods; the variants themselves aren't meant to be
/// built directly.
pub enum Command {
    /// Replies with the number of streams the presentation advertises.
    Describe(oneshot::Sender<Result<usize, Error>>),
    Setup {
        stream_index: usize,
        reply: oneshot::Sender<Result<(), Error>>,
    },
    Play(oneshot::Sender<Result<(), Error>>),
    Teardown(oneshot::Sender<Result<(), Error>>),
}

/// A handle to a running client session task; cheaply cloneable. Mutation
/// happens only inside the task itself (§5 per-session ownership).
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
}

impl SessionHandle {
    /// Creates a linked `(SessionHandle, Receiver<Command>)` pair; pass the
    /// receiver to [`ClientSession::run`] (typically via `tokio::spawn`).
    pub fn channel(buffer: usize) -> (SessionHandle, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(buffer);
        (SessionHandle { tx }, rx)
    }

    /// Issues `DESCRIBE` and returns the number of streams the returned
    /// presentation advertises, for driving a `SETUP` loop.
    pub async fn describe(&self) -> Result<usize, Error> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Describe(tx)).await;
        rx.await.unwrap_or_else(|_| Err(wrap!(ErrorInt::Terminated)))
    }

    pub async fn setup(&self, stream_index: usize) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Setup {
            stream_index,
            reply: tx,
        })
        .await;
        rx.await.unwrap_or_else(|_| Err(wrap!(ErrorInt::Terminated)))
    }

    pub async fn play(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Play(tx)).await;
        rx.await.unwrap_or_else(|_| Err(wrap!(ErrorInt::Terminated)))
    }

    pub async fn teardown(&self) -> Result<(), Error> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Teardown(tx)).await;
        rx.await.unwrap_or_else(|_| Err(wrap!(ErrorInt::Terminated)))
    }

    async fn send(&self, cmd: Command) {
        if self.tx.send(cmd).await.is_err() {
            debug!("session task already gone");
        }
    }
}

/// Observer callbacks per §6. All are optional; a default no-op is provided
/// for each so implementors only override what they need.
pub trait Observer: Send + 'static {
    fn on_request_sent(&mut self, _cseq: u32, _method: &Method) {}
    fn on_response_received(&mut self, _cseq: u32) {}
    fn on_server_request(&mut self, _method: &Method) {}
    fn on_transport_switch(&mut self, _to: Transport) {}
    fn on_packets_lost(&mut self, _stream_id: usize, _count: u16) {}
    fn on_decode_error(&mut self, _stream_id: usize, _description: &str) {}
    fn on_packet_rtp(&mut self, _pkt: &rtp::Packet) {}
    fn on_packet_rtcp(&mut self, _sr: &rtp::SenderReport) {}
    fn on_session_open(&mut self, _conn_ctx: &ConnectionContext) {}
    fn on_session_close(&mut self, _reason: &SessionCloseReason) {}
}

/// Holds per-stream CSeq-matched RTSP request/response plumbing plus the
/// session state machine. Owns its connection and all mutable state; see the
/// per-session-ownership design note.
pub struct ClientSession<RW, O: Observer> {
    state: State,
    options: SessionOptions,
    url: Url,
    conn_ctx: ConnectionContext,
    framer: MessageFramer<RW>,
    next_cseq: u32,
    session_id: Option<String>,
    keepalive_period: Duration,
    supports_get_parameter: bool,
    /// Set once an `OPTIONS` has been sent, whether user-issued or the
    /// transparent first-non-OPTIONS-method probe (§4.3).
    probed_options: bool,
    presentation: Option<Presentation>,
    observer: O,
    /// Indexed by stream index; `None` until that track's SETUP succeeds.
    transports: Vec<Option<TrackTransport>>,
    /// Indexed by stream index, parallel to `transports`; built at PLAY time.
    checkers: Vec<Option<rtp::StrictSequenceChecker>>,
    /// `Some` only while playing with at least one UDP-transported track.
    timeout_sup: Option<TimeoutSupervisor>,
}

impl<RW, O> ClientSession<RW, O>
where
    RW: AsyncRead + AsyncWrite + Unpin,
    O: Observer,
{
    pub fn new(io: RW, conn_ctx: ConnectionContext, url: Url, options: SessionOptions, observer: O) -> Self {
        Self {
            state: State::Initial,
            options,
            url,
            conn_ctx,
            framer: MessageFramer::new(io),
            next_cseq: 1,
            session_id: None,
            keepalive_period: DEFAULT_SESSION_TIMEOUT.mul_f64(KEEPALIVE_FRACTION),
            supports_get_parameter: false,
            probed_options: false,
            presentation: None,
            observer,
            transports: Vec::new(),
            checkers: Vec::new(),
            timeout_sup: None,
        }
    }

    fn check_legal(&self, method: Method) -> Result<(), Error> {
        use Method::*;
        use State::*;
        let legal = match (method, self.state) {
            (Options, Initial) | (Options, PrePlay) | (Options, PreRecord) => true,
            (Describe, Initial) | (Describe, PrePlay) | (Describe, PreRecord) => true,
            (Announce, Initial) => true,
            (Setup, Initial) | (Setup, PrePlay) | (Setup, PreRecord) => true,
            (Play, PrePlay) | (Play, Play) => true,
            (Record, PreRecord) => true,
            (TearDown, _) => true,
            (GetParameter, _) | (SetParameter, _) => true,
            _ => false,
        };
        if !legal {
            bail!(ErrorInt::InvalidState {
                conn_ctx: self.conn_ctx,
                method: format!("{:?}", method),
                state: self.state.name(),
            });
        }
        Ok(())
    }

    fn next_cseq(&mut self) -> u32 {
        let c = self.next_cseq;
        self.next_cseq += 1;
        c
    }

    /// Builds a request with the mandatory `CSeq`/`User-Agent` and, once
    /// assigned, the `Session` header.
    fn build_request(&mut self, method: Method, url: &Url) -> (u32, rtsp_types::Request<Bytes>) {
        let cseq = self.next_cseq();
        let mut builder = rtsp_types::Request::builder(method, rtsp_types::Version::V1_0)
            .header(rtsp_types::headers::CSEQ, cseq.to_string())
            .header(rtsp_types::headers::USER_AGENT, self.options.user_agent.clone());
        if let Some(sid) = &self.session_id {
            builder = builder.header(rtsp_types::headers::SESSION, sid.clone());
        }
        if let Some(creds) = &mut self.options.creds {
            if let Some(auth) = creds.authorization_header(method, url.as_str()) {
                builder = builder.header(rtsp_types::headers::AUTHORIZATION, auth);
            }
        }
        (cseq, builder.request_uri(url.as_str()).build(Bytes::new()))
    }

    /// Sends `req`, waits for its CSeq-matched response, retrying once on 401
    /// per the single-auth-retry policy (§4.2/§7).
    async fn send_request(
        &mut self,
        method: Method,
        url: Url,
    ) -> Result<rtsp_types::Response<Bytes>, Error> {
        self.check_legal(method)?;
        let (cseq, req) = self.build_request(method, &url);
        self.observer.on_request_sent(cseq, &method);
        self.framer.write_request(&req).await?;
        let resp = self.await_response(cseq).await?;

        if resp.status() == rtsp_types::StatusCode::Unauthorized {
            if self.options.creds.is_none() {
                bail!(ErrorInt::Auth {
                    description: "401 received with no credentials configured".to_owned(),
                });
            }
            let challenge = resp
                .header(&rtsp_types::headers::WWW_AUTHENTICATE)
                .ok_or_else(|| wrap!(ErrorInt::Auth {
                    description: "401 with no WWW-Authenticate header".to_owned(),
                }))?;
            if let Some(creds) = &mut self.options.creds {
                creds
                    .accept_challenge(challenge.as_str())
                    .map_err(|description| wrap!(ErrorInt::Auth { description }))?;
            }
            let (cseq, req) = self.build_request(method, &url);
            self.observer.on_request_sent(cseq, &method);
            self.framer.write_request(&req).await?;
            let resp = self.await_response(cseq).await?;
            if resp.status() == rtsp_types::StatusCode::Unauthorized {
                bail!(ErrorInt::Auth {
                    description: "credentials rejected on retry".to_owned(),
                });
            }
            return Ok(resp);
        }
        Ok(resp)
    }

    /// Reads framed messages until the response matching `cseq` arrives,
    /// transparently answering server-initiated OPTIONS requests and handing
    /// interleaved frames to the caller via the observer (§5 suspension points).
    async fn await_response(&mut self, cseq: u32) -> Result<rtsp_types::Response<Bytes>, Error> {
        loop {
            match self.framer.read_message().await? {
                crate::message::Message::Response(resp) => {
                    let got_cseq = parse::get_cseq(&resp);
                    if got_cseq.is_none() || got_cseq == Some(cseq) {
                        self.observer.on_response_received(cseq);
                        return Ok(resp);
                    }
                    warn!("discarding response with mismatched CSeq {:?}", got_cseq);
                }
                crate::message::Message::Request(req) => {
                    self.observer.on_server_request(req.method());
                    if req.method() == Method::Options {
                        self.reply_to_server_options(&req).await?;
                    }
                }
                crate::message::Message::Interleaved(frame) => {
                    debug!(
                        "discarding interleaved frame on channel {} before PLAY",
                        frame.channel_id
                    );
                }
            }
        }
    }

    async fn reply_to_server_options(&mut self, req: &rtsp_types::Request<Bytes>) -> Result<(), Error> {
        let cseq = parse::get_cseq_request(req).unwrap_or(0);
        let resp = rtsp_types::Response::builder(rtsp_types::Version::V1_0, rtsp_types::StatusCode::Ok)
            .header(rtsp_types::headers::CSEQ, cseq.to_string())
            .build(Bytes::new());
        self.framer.write_response(&resp).await
    }

    /// Issues `OPTIONS` and remembers whether the server advertises
    /// `GET_PARAMETER`, per §4.3's "first non-OPTIONS method" probe.
    pub async fn options(&mut self) -> Result<(), Error> {
        let url = self.url.clone();
        let resp = self.send_request(Method::Options, url).await?;
        if let Some(public) = resp.header(&rtsp_types::headers::PUBLIC) {
            self.supports_get_parameter = public.as_str().contains("GET_PARAMETER");
        }
        self.probed_options = true;
        Ok(())
    }

    /// Transparently issues `OPTIONS` the first time any other method is
    /// about to be sent, per §4.3's "first non-OPTIONS method" probe. A
    /// no-op on every call after the first (or if the caller already issued
    /// `OPTIONS` itself).
    async fn ensure_options_probed(&mut self) -> Result<(), Error> {
        if self.probed_options {
            return Ok(());
        }
        self.options().await
    }

    pub fn presentation(&self) -> Option<&Presentation> {
        self.presentation.as_ref()
    }

    /// Returns the 301–305 `Location` to follow, if `resp` is a redirect.
    fn redirect_location(resp: &rtsp_types::Response<Bytes>) -> Option<Url> {
        use rtsp_types::StatusCode::*;
        if !matches!(
            resp.status(),
            MovedPermanently | MovedTemporarily | SeeOther | UseProxy
        ) {
            return None;
        }
        resp.header(&rtsp_types::headers::LOCATION)
            .and_then(|v| Url::parse(v.as_str()).ok())
    }

    /// Issues `DESCRIBE`, resolving the presentation's base URL with the
    /// documented precedence (control attribute → Content-Base → request URL),
    /// and stores the result (retrievable via [`Self::presentation`]).
    ///
    /// Follows same-authority redirects (301–305 with `Location`) in place;
    /// a redirect to a different host/port can't be followed on this
    /// already-connected socket and is surfaced as `ErrorKind::Redirect` for
    /// the caller to open a new connection and re-describe, per §4.3.
    pub async fn describe(&mut self) -> Result<(), Error> {
        if !matches!(self.state, State::Initial | State::PrePlay | State::PreRecord) {
            bail!(ErrorInt::InvalidState {
                conn_ctx: self.conn_ctx,
                method: "DESCRIBE".to_owned(),
                state: self.state.name(),
            });
        }
        self.ensure_options_probed().await?;
        let mut url = self.url.clone();
        loop {
            let resp = self.send_request(Method::Describe, url.clone()).await?;
            if let Some(location) = Self::redirect_location(&resp) {
                self.state = State::Initial;
                self.session_id = None;
                self.presentation = None;
                let same_authority = location.scheme() == url.scheme()
                    && location.host() == url.host()
                    && location.port_or_known_default() == url.port_or_known_default();
                if !same_authority {
                    bail!(ErrorInt::Redirect { location });
                }
                url = location;
                self.url = url.clone();
                continue;
            }
            if resp.status() != rtsp_types::StatusCode::Ok {
                bail!(ErrorInt::RtspResponseError {
                    conn_ctx: self.conn_ctx,
                    msg_ctx: crate::RtspMessageContext::dummy(),
                    description: format!("DESCRIBE returned {}", resp.status()),
                });
            }
            let content_base = resp
                .header(&rtsp_types::headers::CONTENT_BASE)
                .or_else(|| resp.header(&rtsp_types::headers::CONTENT_LOCATION))
                .map(|v| v.as_str());
            let presentation = crate::description::parse_sdp(url, content_base, resp.body())
                .map_err(|description| {
                    wrap!(ErrorInt::RtspResponseError {
                        conn_ctx: self.conn_ctx,
                        msg_ctx: crate::RtspMessageContext::dummy(),
                        description,
                    })
                })?;
            self.presentation = Some(presentation);
            return Ok(());
        }
    }

    /// `SETUP`s one track, trying UDP first unless a transport is pinned or
    /// the scheme is `rtsps` (forced TCP), falling back to TCP on 461 per §4.3.
    pub async fn setup(&mut self, stream_index: usize) -> Result<(), Error> {
        if !matches!(self.state, State::Initial | State::PrePlay | State::PreRecord) {
            bail!(ErrorInt::InvalidState {
                conn_ctx: self.conn_ctx,
                method: "SETUP".to_owned(),
                state: self.state.name(),
            });
        }
        let forced_tcp = self.url.scheme() == "rtsps";
        let try_udp = !forced_tcp && !matches!(self.options.transport, Some(Transport::Tcp));

        let control = {
            let presentation = self
                .presentation
                .as_ref()
                .ok_or_else(|| wrap!(ErrorInt::InvalidState {
                    conn_ctx: self.conn_ctx,
                    method: "SETUP".to_owned(),
                    state: "no DESCRIBE performed",
                }))?;
            presentation.streams[stream_index].control.clone()
        };

        let mut udp_pair = if try_udp {
            Some(
                crate::UdpPair::for_ip(self.conn_ctx.local_addr.ip(), self.options.udp_port_range.clone())
                    .map_err(|e| wrap!(ErrorInt::Io(e)))?,
            )
        } else {
            None
        };

        let transport_header = match &udp_pair {
            Some(pair) => format!("RTP/AVP;unicast;client_port={}-{}", pair.rtp_port, pair.rtp_port + 1),
            None => format!("RTP/AVP/TCP;unicast;interleaved={}-{}", stream_index * 2, stream_index * 2 + 1),
        };

        let resp = self.setup_with_transport(&control, &transport_header).await?;
        let resp = if resp.status() == rtsp_types::StatusCode::UnsupportedTransport && try_udp {
            udp_pair = None;
            let tcp_header = format!(
                "RTP/AVP/TCP;unicast;interleaved={}-{}",
                stream_index * 2,
                stream_index * 2 + 1
            );
            self.setup_with_transport(&control, &tcp_header).await?
        } else {
            resp
        };

        if resp.status() != rtsp_types::StatusCode::Ok {
            bail!(ErrorInt::RtspResponseError {
                conn_ctx: self.conn_ctx,
                msg_ctx: crate::RtspMessageContext::dummy(),
                description: format!("SETUP returned {}", resp.status()),
            });
        }
        let setup = parse::parse_setup(&resp).map_err(|description| {
            wrap!(ErrorInt::RtspResponseError {
                conn_ctx: self.conn_ctx,
                msg_ctx: crate::RtspMessageContext::dummy(),
                description,
            })
        })?;
        if self.session_id.is_none() {
            self.session_id = Some(setup.session_id.to_owned());
        }
        if let Some(presentation) = &mut self.presentation {
            presentation.streams[stream_index].state = StreamState::Init(crate::description::StreamStateInit {
                ssrc: setup.ssrc,
                initial_seq: None,
                initial_rtptime: None,
            });
        }

        let transport = match udp_pair {
            Some(pair) => {
                let expected_peer = setup
                    .server_port
                    .map(|(rtp_port, _)| std::net::SocketAddr::new(self.conn_ctx.peer_addr.ip(), rtp_port));
                let substrate = UdpSubstrate::from_pair(pair, expected_peer, false).map_err(|e| wrap!(ErrorInt::Io(e)))?;
                TrackTransport::Udp(substrate)
            }
            None => {
                let channel = setup
                    .channel_id
                    .map(|c| (c, c + 1))
                    .unwrap_or((stream_index as u8 * 2, stream_index as u8 * 2 + 1));
                TrackTransport::Tcp { channel }
            }
        };
        if self.transports.len() <= stream_index {
            self.transports.resize_with(stream_index + 1, || None);
        }
        self.transports[stream_index] = Some(transport);

        if self.state == State::Initial {
            self.state = State::PrePlay;
        }
        Ok(())
    }

    async fn setup_with_transport(
        &mut self,
        control: &Url,
        transport: &str,
    ) -> Result<rtsp_types::Response<Bytes>, Error> {
        self.check_legal(Method::Setup)?;
        let (cseq, mut req) = self.build_request(Method::Setup, control);
        req.insert_header(rtsp_types::headers::TRANSPORT, transport.to_owned());
        self.observer.on_request_sent(cseq, &Method::Setup);
        self.framer.write_request(&req).await?;
        self.await_response(cseq).await
    }

    /// `PLAY`s the session; on success transitions `PRE_PLAY -> PLAY`.
    pub async fn play(&mut self) -> Result<(), Error> {
        if !matches!(self.state, State::PrePlay | State::Play) {
            bail!(ErrorInt::InvalidState {
                conn_ctx: self.conn_ctx,
                method: "PLAY".to_owned(),
                state: self.state.name(),
            });
        }
        let url = self
            .presentation
            .as_ref()
            .map(|p| p.control.clone())
            .unwrap_or_else(|| self.url.clone());
        let (cseq, mut req) = self.build_request(Method::Play, &url);
        req.insert_header(rtsp_types::headers::RANGE, "npt=0-".to_owned());
        self.observer.on_request_sent(cseq, &Method::Play);
        self.framer.write_request(&req).await?;
        let resp = self.await_response(cseq).await?;
        if resp.status() != rtsp_types::StatusCode::Ok {
            bail!(ErrorInt::RtspResponseError {
                conn_ctx: self.conn_ctx,
                msg_ctx: crate::RtspMessageContext::dummy(),
                description: format!("PLAY returned {}", resp.status()),
            });
        }
        if let (Some(rtp_info), Some(presentation)) = (
            resp.header(&rtsp_types::headers::RTP_INFO).map(|v| v.as_str().to_owned()),
            self.presentation.as_mut(),
        ) {
            parse::apply_rtp_info(&rtp_info, presentation)
                .map_err(|description| wrap!(ErrorInt::RtspResponseError {
                    conn_ctx: self.conn_ctx,
                    msg_ctx: crate::RtspMessageContext::dummy(),
                    description,
                }))?;
        }

        // Builds this PLAY's depacketizers and starts each setup track's
        // timeline, so the run loop's inbound-message handling (§4.6) has
        // somewhere to deliver packets from the moment PLAY succeeds.
        let mut checkers = Vec::with_capacity(self.transports.len());
        if let Some(presentation) = &mut self.presentation {
            for stream in presentation.streams.iter_mut() {
                match &stream.state {
                    StreamState::Init(init) => {
                        checkers.push(Some(rtp::StrictSequenceChecker::new(init.ssrc, init.initial_seq)));
                        let timeline = crate::client::timeline::Timeline::new(init.initial_rtptime, stream.clock_rate)
                            .map_err(|description| wrap!(ErrorInt::RtspResponseError {
                                conn_ctx: self.conn_ctx,
                                msg_ctx: crate::RtspMessageContext::dummy(),
                                description,
                            }))?;
                        let rtp_seq_base = init.initial_seq.unwrap_or(0);
                        stream.state = StreamState::Playing { timeline, rtp_seq_base };
                    }
                    _ => checkers.push(None),
                }
            }
        }
        self.checkers = checkers;
        self.timeout_sup = if self.transports.iter().any(|t| matches!(t, Some(TrackTransport::Udp(_)))) {
            Some(TimeoutSupervisor::new(self.options.initial_udp_read_timeout, self.session_timeout()))
        } else {
            None
        };

        self.state = State::Play;
        self.keepalive_period = self.session_timeout().mul_f64(KEEPALIVE_FRACTION);
        info!("session {:?} now playing", self.session_id);
        Ok(())
    }

    fn session_timeout(&self) -> Duration {
        DEFAULT_SESSION_TIMEOUT
    }

    /// Sends `TEARDOWN` and waits for its response, without otherwise ending
    /// the session task; used both by the public, always-terminal
    /// [`Self::teardown`] and internally by [`Self::switch_to_tcp`].
    async fn send_teardown_request(&mut self) -> Result<(), Error> {
        let url = self
            .presentation
            .as_ref()
            .map(|p| p.control.clone())
            .unwrap_or_else(|| self.url.clone());
        let (cseq, req) = self.build_request(Method::TearDown, &url);
        self.observer.on_request_sent(cseq, &Method::TearDown);
        self.framer.write_request(&req).await?;
        let _ = self.await_response(cseq).await;
        Ok(())
    }

    /// `TEARDOWN`s the session unconditionally; always terminal.
    pub async fn teardown(&mut self) -> Result<(), Error> {
        self.send_teardown_request().await?;
        self.state = State::Initial;
        self.observer.on_session_close(&SessionCloseReason::Teardown);
        bail!(ErrorInt::Teardown);
    }

    /// Performs the UDP→TCP transport switch (§4.3/§4.6): TEARDOWNs the
    /// session, re-SETUPs every already-setup track forcing TCP-interleaved
    /// transport on this same connection, then re-PLAYs. The session itself
    /// isn't torn down; only its RTSP-level session ID and per-track state are.
    async fn switch_to_tcp(&mut self) -> Result<(), Error> {
        if !self.transports.iter().any(|t| matches!(t, Some(TrackTransport::Udp(_)))) {
            bail!(ErrorInt::AutoswitchToTcp);
        }
        warn!(
            "no UDP packets received within {:?}; switching session {:?} to TCP-interleaved",
            self.options.initial_udp_read_timeout, self.session_id
        );
        let stream_indices: Vec<usize> = self
            .transports
            .iter()
            .enumerate()
            .filter_map(|(i, t)| t.is_some().then(|| i))
            .collect();

        self.send_teardown_request().await?;
        self.session_id = None;
        self.transports.clear();
        self.checkers.clear();
        self.timeout_sup = None;
        self.state = State::PrePlay;
        if let Some(presentation) = &mut self.presentation {
            for s in presentation.streams.iter_mut() {
                s.state = StreamState::Uninit;
            }
        }
        self.options.transport = Some(Transport::Tcp);

        for i in stream_indices {
            self.setup(i).await?;
        }
        self.play().await?;
        self.observer.on_transport_switch(Transport::Tcp);
        Ok(())
    }

    /// Sends a keep-alive (`GET_PARAMETER` if supported, else `OPTIONS`),
    /// without awaiting the response per §4.3 (some devices never answer).
    pub async fn send_keepalive(&mut self) -> Result<(), Error> {
        let url = self
            .presentation
            .as_ref()
            .map(|p| p.control.clone())
            .unwrap_or_else(|| self.url.clone());
        let method = if self.supports_get_parameter {
            Method::GetParameter
        } else {
            Method::Options
        };
        let (cseq, req) = self.build_request(method, &url);
        self.observer.on_request_sent(cseq, &method);
        self.framer.write_request(&req).await
    }

    pub fn keepalive_period(&self) -> Duration {
        self.keepalive_period
    }

    /// Dispatches one message read from the framer while playing/recording:
    /// delivers interleaved RTP/RTCP to the depacketizers, answers a
    /// server-initiated `OPTIONS`, and discards anything else unexpected.
    async fn handle_inbound_message(&mut self, msg: crate::message::Message) -> Result<(), Error> {
        match msg {
            crate::message::Message::Interleaved(frame) => self.handle_interleaved(frame).await,
            crate::message::Message::Request(req) => {
                self.observer.on_server_request(req.method());
                if req.method() == Method::Options {
                    self.reply_to_server_options(&req).await?;
                }
                Ok(())
            }
            crate::message::Message::Response(resp) => {
                debug!("discarding unexpected response (cseq {:?}) while playing", parse::get_cseq(&resp));
                Ok(())
            }
        }
    }

    async fn handle_interleaved(&mut self, frame: crate::message::InterleavedFrame) -> Result<(), Error> {
        if let Some(sup) = &mut self.timeout_sup {
            sup.record_packet();
        }
        let stream_index = usize::from(frame.channel_id / 2);
        let is_rtp = frame.channel_id % 2 == 0;
        self.deliver_packet(stream_index, is_rtp, frame.channel_id, frame.data)
    }

    /// Polls every UDP-transported track's RTP and RTCP sockets, returning
    /// the first datagram received. Never resolves if no track uses UDP.
    async fn poll_udp(transports: &[Option<TrackTransport>]) -> Option<(usize, bool, std::io::Result<Option<usize>>, Vec<u8>)> {
        let mut futs: Vec<std::pin::Pin<Box<dyn std::future::Future<Output = (usize, bool, std::io::Result<Option<usize>>, Vec<u8>)> + '_>>> =
            Vec::new();
        for (i, t) in transports.iter().enumerate() {
            if let Some(TrackTransport::Udp(sub)) = t {
                futs.push(Box::pin(async move {
                    let mut buf = vec![0u8; 2048];
                    let r = sub.recv_rtp(&mut buf).await;
                    (i, true, r, buf)
                }));
                futs.push(Box::pin(async move {
                    let mut buf = vec![0u8; 2048];
                    let r = sub.recv_rtcp(&mut buf).await;
                    (i, false, r, buf)
                }));
            }
        }
        if futs.is_empty() {
            return std::future::pending().await;
        }
        let (result, _idx, _rest) = futures::future::select_all(futs).await;
        Some(result)
    }

    async fn handle_udp_datagram(&mut self, stream_index: usize, is_rtp: bool, data: Bytes) -> Result<(), Error> {
        if let Some(sup) = &mut self.timeout_sup {
            sup.record_packet();
        }
        let channel_id = stream_index as u8 * 2 + u8::from(!is_rtp);
        self.deliver_packet(stream_index, is_rtp, channel_id, data)
    }

    /// Runs `data` through `stream_index`'s depacketizer and hands the result
    /// to the observer; a no-op if that stream isn't (yet) playing.
    fn deliver_packet(&mut self, stream_index: usize, is_rtp: bool, channel_id: u8, data: Bytes) -> Result<(), Error> {
        let msg_ctx = crate::RtspMessageContext::dummy();
        let conn_ctx = self.conn_ctx;
        let presentation = match &mut self.presentation {
            Some(p) => p,
            None => return Ok(()),
        };
        let stream = match presentation.streams.get_mut(stream_index) {
            Some(s) => s,
            None => return Ok(()),
        };
        let timeline = match &mut stream.state {
            StreamState::Playing { timeline, .. } => timeline,
            _ => return Ok(()),
        };
        let checker = match self.checkers.get_mut(stream_index).and_then(|c| c.as_mut()) {
            Some(c) => c,
            None => return Ok(()),
        };
        if is_rtp {
            match checker.rtp(&self.options, &conn_ctx, &msg_ctx, timeline, channel_id, stream_index, data) {
                Ok(Some(PacketItem::RtpPacket(pkt))) => {
                    if pkt.loss > 0 {
                        self.observer.on_packets_lost(stream_index, pkt.loss);
                    }
                    self.observer.on_packet_rtp(&pkt);
                    Ok(())
                }
                Ok(_) => Ok(()),
                Err(e) => Err(e),
            }
        } else {
            match checker.rtcp(&self.options, &msg_ctx, timeline, stream_index, data) {
                Ok(Some(PacketItem::SenderReport(sr))) => {
                    self.observer.on_packet_rtcp(&sr);
                    Ok(())
                }
                Ok(_) => Ok(()),
                Err(description) => {
                    self.observer.on_decode_error(stream_index, &description);
                    Ok(())
                }
            }
        }
    }

    /// Runs the session's single logical task: multiplexes command arrivals,
    /// keep-alive ticks, inbound media (TCP-interleaved and UDP), the
    /// receive-timeout supervisor, and cancellation, per §5. Consumes `self`;
    /// on return the session is gone (torn down or terminated).
    pub async fn run(mut self, mut commands: mpsc::Receiver<Command>, mut cancel: oneshot::Receiver<()>) {
        self.observer.on_session_open(&self.conn_ctx);
        let mut keepalive = KeepaliveTimer::new(self.keepalive_period());
        keepalive.tick().await; // first tick fires immediately; skip it

        let close_reason = loop {
            tokio::select! {
                biased;

                _ = &mut cancel => {
                    let _ = self.teardown().await;
                    break SessionCloseReason::Teardown;
                }

                cmd = commands.recv() => {
                    let cmd = match cmd {
                        Some(c) => c,
                        None => break SessionCloseReason::Teardown,
                    };
                    match cmd {
                        Command::Describe(reply) => {
                            let r = self.describe().await;
                            let is_err = r.is_err();
                            let r = r.map(|()| self.presentation().map(|p| p.streams.len()).unwrap_or(0));
                            let _ = reply.send(r);
                            if is_err {
                                break SessionCloseReason::Teardown;
                            }
                        }
                        Command::Setup { stream_index, reply } => {
                            let r = self.setup(stream_index).await;
                            let _ = reply.send(r);
                        }
                        Command::Play(reply) => {
                            let r = self.play().await;
                            keepalive.reset(self.keepalive_period());
                            keepalive.tick().await;
                            let _ = reply.send(r);
                        }
                        Command::Teardown(reply) => {
                            let r = self.teardown().await;
                            let _ = reply.send(Ok(()));
                            let _ = r;
                            break SessionCloseReason::Teardown;
                        }
                    }
                }

                _ = keepalive.tick() => {
                    if matches!(self.state, State::Play | State::Record) {
                        if let Err(e) = self.send_keepalive().await {
                            break SessionCloseReason::Error(e);
                        }
                    }
                }

                result = self.framer.read_message(), if matches!(self.state, State::Play | State::Record) => {
                    match result {
                        Ok(msg) => {
                            if let Err(e) = self.handle_inbound_message(msg).await {
                                break SessionCloseReason::Error(e);
                            }
                        }
                        Err(e) => break SessionCloseReason::Error(e),
                    }
                }

                udp_result = Self::poll_udp(&self.transports), if matches!(self.state, State::Play | State::Record) => {
                    if let Some((stream_index, is_rtp, recv_result, buf)) = udp_result {
                        match recv_result {
                            Ok(Some(n)) => {
                                let data = Bytes::copy_from_slice(&buf[..n]);
                                if let Err(e) = self.handle_udp_datagram(stream_index, is_rtp, data).await {
                                    break SessionCloseReason::Error(e);
                                }
                            }
                            Ok(None) => {} // datagram from an unexpected source; dropped
                            Err(e) => break SessionCloseReason::Error(wrap!(ErrorInt::Io(e))),
                        }
                    }
                }

                _ = tokio::time::sleep_until(self.timeout_sup.as_ref().unwrap().deadline()), if self.timeout_sup.is_some() => {
                    let action = self.timeout_sup.as_ref().and_then(TimeoutSupervisor::check);
                    match action {
                        Some(TimeoutAction::SwitchToTcp) => {
                            if let Err(e) = self.switch_to_tcp().await {
                                break SessionCloseReason::Error(e);
                            }
                        }
                        Some(TimeoutAction::Terminate) => {
                            break SessionCloseReason::Error(wrap!(ErrorInt::Transport {
                                conn_ctx: self.conn_ctx,
                                description: "no RTP/RTCP packets received within the read timeout".to_owned(),
                            }));
                        }
                        None => {}
                    }
                }
            }
        };
        self.observer.on_session_close(&close_reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state_allows_options_describe_setup_not_play() {
        // State transition legality is cheap to check directly without spinning
        // up a full session + I/O harness.
        let legal = |method: Method, state: State| -> bool {
            use Method::*;
            use State::*;
            match (method, state) {
                (Options, Initial) | (Options, PrePlay) | (Options, PreRecord) => true,
                (Describe, Initial) | (Describe, PrePlay) | (Describe, PreRecord) => true,
                (Announce, Initial) => true,
                (Setup, Initial) | (Setup, PrePlay) | (Setup, PreRecord) => true,
                (Play, PrePlay) | (Play, Play) => true,
                (Record, PreRecord) => true,
                (TearDown, _) => true,
                (GetParameter, _) | (SetParameter, _) => true,
                _ => false,
            }
        };
        assert!(legal(Method::Options, State::Initial));
        assert!(legal(Method::Describe, State::Initial));
        assert!(!legal(Method::Play, State::Initial));
        assert!(legal(Method::Play, State::PrePlay));
        assert!(legal(Method::TearDown, State::Play));
    }
}
