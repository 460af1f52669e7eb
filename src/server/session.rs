// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The [`ServerSession`] state machine (§4.4): ANNOUNCE/SETUP/PLAY/RECORD/
//! PAUSE/TEARDOWN guards, per-track transport assignment, and the UDP
//! publish-timeout supervisor. Owns no connection I/O itself -- a
//! [`super::connection::ServerConnection`] parses requests and drives this
//! session's methods, formatting the wire response from what they return.

use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use log::{debug, info, warn};
use rand::Rng;
use rtsp_types::StatusCode;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::distributor::StreamDistributor;
use super::registry::DistributorRegistry;
use super::ServerOptions;
use crate::transport::{TransportHeader, TransportSpec};
use crate::transport_mux::udp::{MulticastSubstrate, UdpSubstrate};
use crate::transport_mux::write_queue::WriteQueueReceiver;
use crate::transport_mux::OutboundPacket;
use crate::ConnectionContext;

/// A request-level failure: becomes a 4xx/5xx response rather than
/// unwinding the session task, per §7 ("protocol violations from the peer...
/// do not unwind the session unless the violation is also a framing error").
#[derive(Debug, Clone)]
pub struct RequestError {
    pub status: StatusCode,
    pub description: String,
}

impl RequestError {
    fn new(status: StatusCode, description: impl Into<String>) -> Self {
        Self {
            status,
            description: description.into(),
        }
    }
}

impl std::fmt::Display for RequestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.status, self.description)
    }
}

/// The server-side session states from §4.4; named the same as the client's
/// (§4.3) because the transition graph mirrors it.
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

/// Which direction this session's media flows, fixed by whichever of
/// ANNOUNCE/first-SETUP happened first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Play,
    Record,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SubstrateKind {
    Udp,
    Multicast,
    Tcp,
}

fn substrate_kind(spec: &TransportSpec) -> SubstrateKind {
    match spec {
        TransportSpec::Udp { .. } => SubstrateKind::Udp,
        TransportSpec::UdpMulticast { .. } => SubstrateKind::Multicast,
        TransportSpec::Tcp { .. } => SubstrateKind::Tcp,
    }
}

/// A track the client ANNOUNCEd (publish path), per §3. Mirrors
/// [`crate::description::Stream`] minus its client-only playback state.
#[derive(Debug, Clone)]
pub struct AnnouncedTrack {
    pub control: String,
    pub media: String,
    pub encoding_name: String,
    pub clock_rate: u32,
    pub rtp_payload_type: u8,
}

/// How one setupped track's RTP/RTCP actually flow, once SETUP has bound a
/// substrate. The TCP case carries no socket: interleaved reads/writes go
/// through the connection's shared `MessageFramer`. UDP sockets are
/// `Arc`-wrapped so the session can hand clones to the background fan-out
/// tasks `setup`/`record` spawn (§5) while keeping one itself for puncturing
/// and liveness bookkeeping.
pub enum TrackSubstrate {
    Udp(Arc<UdpSubstrate>),
    Multicast(Arc<MulticastSubstrate>),
    Tcp,
}

/// One SETUP-bound track.
pub struct SetuppedTrack {
    pub control: String,
    pub spec: TransportSpec,
    pub substrate: TrackSubstrate,
    /// This track's slot in the cross-connection fan-out registry (§5):
    /// a RECORD track publishes into it, a PLAY track reads out of it.
    pub distributor: Arc<Mutex<StreamDistributor>>,
}

/// One `RTP-Info` entry emitted by a successful PLAY (§4.4).
#[derive(Debug, Clone)]
pub struct RtpInfoEntry {
    pub control: String,
    pub seq: u16,
    pub rtptime: u32,
}

fn unix_now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}

/// Owns all mutable session state; see the per-session-ownership design note
/// (§9). External callers reach it only via [`SessionHandle`]'s commands.
pub struct ServerSession {
    id: String,
    state: State,
    mode: Option<Mode>,
    base_path: String,
    options: Arc<ServerOptions>,
    local_addr: IpAddr,
    announced: Vec<AnnouncedTrack>,
    setupped: Vec<SetuppedTrack>,
    channel_claims: HashSet<(u8, u8)>,
    substrate_kind: Option<SubstrateKind>,
    paused_range: Option<String>,
    last_frame_unix: Arc<AtomicI64>,
    last_request_unix: i64,
    registry: DistributorRegistry,
    /// Background fan-out tasks spawned by `setup`/`record` (§5); aborted on
    /// `teardown` so a torn-down session doesn't leave readers/publishers
    /// spinning on sockets nothing drains anymore.
    spawned: Vec<JoinHandle<()>>,
}

impl ServerSession {
    pub fn new(id: String, base_path: String, conn_ctx: &ConnectionContext, options: Arc<ServerOptions>, registry: DistributorRegistry) -> Self {
        Self {
            id,
            state: State::Initial,
            mode: None,
            base_path,
            options,
            local_addr: conn_ctx.local_addr.ip(),
            announced: Vec::new(),
            setupped: Vec::new(),
            channel_claims: HashSet::new(),
            substrate_kind: None,
            paused_range: None,
            last_frame_unix: Arc::new(AtomicI64::new(unix_now())),
            last_request_unix: unix_now(),
            registry,
            spawned: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn mode(&self) -> Option<Mode> {
        self.mode
    }

    /// A handle reader tasks can use to record packet arrival, for the UDP
    /// publish-timeout check (§4.6's "any per-track frame resets the timer").
    pub fn last_frame_handle(&self) -> Arc<AtomicI64> {
        self.last_frame_unix.clone()
    }

    /// This session's claimed TCP-interleaved channel pairs plus its
    /// liveness clock, so `ServerConnection` can credit an inbound
    /// interleaved RTP/RTCP frame to the right RECORD session (§4.6) without
    /// this session needing to know about connection-level framing at all.
    pub fn channel_claims(&self) -> (Vec<(u8, u8)>, Arc<AtomicI64>) {
        (self.channel_claims.iter().copied().collect(), self.last_frame_unix.clone())
    }

    fn touch(&mut self) {
        self.last_request_unix = unix_now();
    }

    fn check_legal(&self, method: rtsp_types::Method) -> Result<(), RequestError> {
        use rtsp_types::Method::*;
        use State::*;
        let legal = match (method, self.state) {
            (Options, _) => true,
            (Describe, Initial) | (Describe, PrePlay) | (Describe, PreRecord) => true,
            (Announce, Initial) => true,
            (Setup, Initial) | (Setup, PrePlay) | (Setup, PreRecord) => true,
            (Play, PrePlay) | (Play, Play) => true,
            (Record, PreRecord) => true,
            (Pause, s) => s != Initial,
            (TearDown, _) => true,
            (GetParameter, _) | (SetParameter, _) => true,
            _ => false,
        };
        if !legal {
            return Err(RequestError::new(
                StatusCode::MethodNotValidInThisState,
                format!("{:?} not legal in state {}", method, self.state.name()),
            ));
        }
        Ok(())
    }

    /// The methods legal from the current state, for an OPTIONS `Public`/
    /// `Allow` response (§10.5 of the expanded spec).
    pub fn allowed_methods(&self) -> Vec<&'static str> {
        use State::*;
        let mut out = vec!["OPTIONS", "GET_PARAMETER", "SET_PARAMETER", "TEARDOWN"];
        match self.state {
            Initial => {
                out.push("DESCRIBE");
                out.push("ANNOUNCE");
                out.push("SETUP");
            }
            PrePlay => {
                out.push("DESCRIBE");
                out.push("SETUP");
                out.push("PLAY");
                out.push("PAUSE");
            }
            Play => {
                out.push("PLAY");
                out.push("PAUSE");
            }
            PreRecord => {
                out.push("DESCRIBE");
                out.push("SETUP");
                out.push("RECORD");
                out.push("PAUSE");
            }
            Record => {
                out.push("PAUSE");
            }
        }
        out
    }

    /// ANNOUNCE (§4.4): accepts only in `INITIAL`; every track's control URL
    /// must be a sub-path of `announce_path`.
    pub fn announce(&mut self, tracks: Vec<AnnouncedTrack>) -> Result<(), RequestError> {
        self.touch();
        self.check_legal(rtsp_types::Method::Announce)?;
        for t in &tracks {
            if !t.control.starts_with(&self.base_path) {
                return Err(RequestError::new(
                    StatusCode::BadRequest,
                    format!("track control {:?} is not under announced path {:?}", t.control, self.base_path),
                ));
            }
        }
        self.announced = tracks;
        self.mode = Some(Mode::Record);
        self.state = State::PreRecord;
        info!("session {} ANNOUNCE accepted, {} track(s)", self.id, self.announced.len());
        Ok(())
    }

    /// SETUP (§4.4): parses `transport_header`, derives and validates the
    /// substrate, binds server-side resources, and returns the resolved
    /// [`TransportSpec`] (with server ports/ports filled in) for the caller
    /// to format into the response's `Transport:` header.
    pub fn setup(&mut self, control: String, transport_header: &str) -> Result<TransportSpec, RequestError> {
        self.touch();
        self.check_legal(rtsp_types::Method::Setup)?;

        let header = TransportHeader::parse(transport_header)
            .map_err(|e| RequestError::new(StatusCode::BadRequest, e))?;
        let mut spec = header.to_spec().map_err(|e| RequestError::new(StatusCode::BadRequest, e))?;

        if matches!(spec, TransportSpec::UdpMulticast { .. }) {
            if self.options.multicast_group.is_none() {
                return Err(RequestError::new(
                    StatusCode::UnsupportedTransport,
                    "server has no multicast range configured".to_owned(),
                ));
            }
            if self.mode == Some(Mode::Record) {
                return Err(RequestError::new(
                    StatusCode::UnsupportedTransport,
                    "multicast is not supported for RECORD".to_owned(),
                ));
            }
        }

        let kind = substrate_kind(&spec);
        if let Some(existing) = self.substrate_kind {
            if existing != kind {
                return Err(RequestError::new(
                    StatusCode::UnsupportedTransport,
                    "mixed transport substrates within one session".to_owned(),
                ));
            }
        }

        // ANNOUNCE (if any) always precedes SETUP, so mode is already
        // Record by then; otherwise this SETUP is establishing Play.
        let is_play_side = self.mode != Some(Mode::Record);
        let distributor = self.registry.get_or_create(&control);

        let substrate = match &mut spec {
            TransportSpec::Tcp { channel } => {
                let channel = *channel;
                crate::transport::validate_channel_pair(channel)
                    .map_err(|e| RequestError::new(StatusCode::BadRequest, e))?;
                if self.channel_claims.contains(&channel) {
                    return Err(RequestError::new(
                        StatusCode::BadRequest,
                        "interleaved channel pair already in use".to_owned(),
                    ));
                }
                self.channel_claims.insert(channel);
                TrackSubstrate::Tcp
            }
            TransportSpec::Udp { server_port, .. } => {
                let pair = crate::UdpPair::for_ip(self.local_addr, self.options.udp_port_range.clone())
                    .map_err(|e| RequestError::new(StatusCode::InternalServerError, e.to_string()))?;
                let port = pair.rtp_port;
                *server_port = Some((port, port + 1));
                let sub = UdpSubstrate::from_pair(pair, None, self.options.any_port_enable)
                    .map_err(|e| RequestError::new(StatusCode::InternalServerError, e.to_string()))?;
                let sub = Arc::new(sub);
                if is_play_side {
                    self.spawn_play_udp_tasks(sub.clone(), distributor.clone());
                }
                TrackSubstrate::Udp(sub)
            }
            TransportSpec::UdpMulticast { destination, port, ttl } => {
                let group = self.options.multicast_group.unwrap();
                *destination = IpAddr::V4(group);
                *ttl = self.options.multicast_ttl;
                let sub = MulticastSubstrate::join(group, port.0, std::net::Ipv4Addr::UNSPECIFIED, *ttl)
                    .map_err(|e| RequestError::new(StatusCode::InternalServerError, e.to_string()))?;
                TrackSubstrate::Multicast(Arc::new(sub))
            }
        };

        self.substrate_kind = Some(kind);
        self.setupped.push(SetuppedTrack {
            control,
            spec: spec.clone(),
            substrate,
            distributor,
        });

        if self.state == State::Initial {
            self.mode = Some(Mode::Play);
            self.state = State::PrePlay;
        }

        Ok(spec)
    }

    /// Starts this PLAY track's two background halves (§5): a writer that
    /// drains `dist`'s fan-out queue onto `sub`, and a reader that watches
    /// `sub` for the reader's own RTCP (the only thing a PLAY-side UDP
    /// socket receives) purely to keep the liveness clock current.
    fn spawn_play_udp_tasks(&mut self, sub: Arc<UdpSubstrate>, dist: Arc<Mutex<StreamDistributor>>) {
        let rx = dist.lock().unwrap().add_reader(self.id.clone(), 256);
        self.spawned.push(tokio::spawn(run_udp_fanout_writer(sub.clone(), rx)));
        self.spawned.push(tokio::spawn(run_udp_liveness_reader(sub, self.last_frame_unix.clone())));
    }

    /// PLAY (§4.4): legal from `PRE_PLAY` or `PLAY` (idempotent restart
    /// permitted on UDP). Returns one `RTP-Info` entry per setupped track.
    pub fn play(&mut self) -> Result<Vec<RtpInfoEntry>, RequestError> {
        self.touch();
        self.check_legal(rtsp_types::Method::Play)?;
        let mut rng = rand::thread_rng();
        let infos = self
            .setupped
            .iter()
            .map(|t| RtpInfoEntry {
                control: t.control.clone(),
                seq: rng.gen(),
                rtptime: rng.gen(),
            })
            .collect();
        self.state = State::Play;
        Ok(infos)
    }

    /// RECORD (§4.4): legal only from `PRE_RECORD`; requires every announced
    /// track to have been setupped. Punctures each UDP track's firewall path
    /// before transitioning to `RECORD`.
    pub async fn record(&mut self) -> Result<(), RequestError> {
        self.touch();
        self.check_legal(rtsp_types::Method::Record)?;
        if self.setupped.len() != self.announced.len() {
            return Err(RequestError::new(
                StatusCode::BadRequest,
                format!(
                    "{} track(s) setupped but {} announced",
                    self.setupped.len(),
                    self.announced.len()
                ),
            ));
        }
        let mut new_tasks = Vec::new();
        for t in &self.setupped {
            if let TrackSubstrate::Udp(sub) = &t.substrate {
                if let Err(e) = sub.puncture().await {
                    warn!("session {} firewall puncture failed: {}", self.id, e);
                }
                new_tasks.push(tokio::spawn(run_udp_publish_reader(
                    sub.clone(),
                    t.distributor.clone(),
                    self.last_frame_unix.clone(),
                    true,
                )));
                new_tasks.push(tokio::spawn(run_udp_publish_reader(
                    sub.clone(),
                    t.distributor.clone(),
                    self.last_frame_unix.clone(),
                    false,
                )));
            }
        }
        self.spawned.extend(new_tasks);
        self.state = State::Record;
        self.last_frame_unix.store(unix_now(), Ordering::Relaxed);
        Ok(())
    }

    /// PAUSE (§4.4): legal from any non-`INITIAL` state; reverses PLAY/RECORD
    /// without tearing the session down. Remembers `range` (if given) so a
    /// following PLAY without its own `Range` resumes from here.
    pub fn pause(&mut self, range: Option<String>) -> Result<(), RequestError> {
        self.touch();
        self.check_legal(rtsp_types::Method::Pause)?;
        if range.is_some() {
            self.paused_range = range;
        }
        self.state = match self.state {
            State::Play => State::PrePlay,
            State::Record => State::PreRecord,
            other => other, // PAUSE after PAUSE is a no-op (§8 idempotence).
        };
        Ok(())
    }

    pub fn paused_range(&self) -> Option<&str> {
        self.paused_range.as_deref()
    }

    /// TEARDOWN (§4.4): unconditional and terminal; releases every claimed
    /// resource (channel pairs are dropped with the session; sockets close
    /// when their `UdpSubstrate`/`MulticastSubstrate` is dropped).
    pub fn teardown(&mut self) {
        for handle in self.spawned.drain(..) {
            handle.abort();
        }
        for t in &self.setupped {
            t.distributor.lock().unwrap().remove_reader(&self.id);
        }
        if self.mode == Some(Mode::Record) {
            for t in &self.setupped {
                self.registry.remove(&t.control);
            }
        }
        self.state = State::Initial;
        self.mode = None;
        self.announced.clear();
        self.setupped.clear();
        self.channel_claims.clear();
        self.substrate_kind = None;
        self.paused_range = None;
        debug!("session {} torn down", self.id);
    }

    /// Checks the publish/playback liveness invariant (§4.6): in `PLAY`/
    /// `RECORD` on UDP, some packet must arrive within `read_timeout`; an
    /// idle session (no active media) times out after `session_timeout` of
    /// request inactivity.
    pub fn check_timeout(&self) -> Option<&'static str> {
        let now = unix_now();
        match self.state {
            State::Play | State::Record => {
                if self.setupped.iter().any(|t| matches!(t.substrate, TrackSubstrate::Udp(_))) {
                    let last = self.last_frame_unix.load(Ordering::Relaxed);
                    if now - last >= self.options.read_timeout.as_secs() as i64 {
                        return Some("no UDP packets in a while");
                    }
                }
                None
            }
            _ => {
                if now - self.last_request_unix >= self.options.session_timeout.as_secs() as i64 {
                    Some("session idle timeout")
                } else {
                    None
                }
            }
        }
    }
}

/// Drains `dist`'s fan-out queue onto a PLAY track's UDP socket (§5), the
/// UDP-unicast counterpart of [`crate::transport_mux::run_writer`]; stops
/// once the queue closes (every `WriteQueueSender` dropped) or a send fails.
async fn run_udp_fanout_writer(sub: Arc<UdpSubstrate>, mut rx: WriteQueueReceiver<OutboundPacket>) {
    while let Some(pkt) = rx.pop().await {
        let result = match &pkt {
            OutboundPacket::Rtp(data) => sub.send_rtp(data).await,
            OutboundPacket::Rtcp(data) => sub.send_rtcp(data).await,
        };
        if let Err(e) = result {
            warn!("UDP fan-out write failed, stopping writer task: {}", e);
            break;
        }
    }
}

/// Watches a PLAY track's UDP socket for the reader's own RTCP traffic
/// (receiver reports), touching `last_frame` so `check_timeout` sees the
/// session as alive; the payload itself isn't otherwise consumed, matching
/// this core's scope of not modelling a `ReportEngine` (§1's non-goals).
async fn run_udp_liveness_reader(sub: Arc<UdpSubstrate>, last_frame: Arc<AtomicI64>) {
    let mut buf = vec![0u8; 2048];
    loop {
        match sub.recv_rtcp(&mut buf).await {
            Ok(Some(_)) => last_frame.store(unix_now(), Ordering::Relaxed),
            Ok(None) => {}
            Err(_) => break,
        }
    }
}

/// Reads one direction (RTP or RTCP) of a RECORD track's inbound UDP
/// traffic, publishing each datagram to `dist` and touching `last_frame`.
async fn run_udp_publish_reader(sub: Arc<UdpSubstrate>, dist: Arc<Mutex<StreamDistributor>>, last_frame: Arc<AtomicI64>, is_rtp: bool) {
    let mut buf = vec![0u8; 2048];
    loop {
        let result = if is_rtp { sub.recv_rtp(&mut buf).await } else { sub.recv_rtcp(&mut buf).await };
        match result {
            Ok(Some(n)) => {
                last_frame.store(unix_now(), Ordering::Relaxed);
                let data = Bytes::copy_from_slice(&buf[..n]);
                let dist = dist.lock().unwrap();
                if is_rtp {
                    dist.publish_rtp(data);
                } else {
                    dist.publish_rtcp(data);
                }
            }
            Ok(None) => {}
            Err(_) => break,
        }
    }
}

/// Commands a [`super::connection::ServerConnection`] posts to a session's
/// task, with a oneshot reply of the session-logic result. Response wire
/// formatting (status line, CSeq, Session header) happens at the connection,
/// which owns the request/response framing.
pub enum Command {
    Announce {
        tracks: Vec<AnnouncedTrack>,
        reply: oneshot::Sender<Result<(), RequestError>>,
    },
    Setup {
        control: String,
        transport_header: String,
        reply: oneshot::Sender<Result<TransportSpec, RequestError>>,
    },
    Play(oneshot::Sender<Result<Vec<RtpInfoEntry>, RequestError>>),
    Record(oneshot::Sender<Result<(), RequestError>>),
    Pause {
        range: Option<String>,
        reply: oneshot::Sender<Result<(), RequestError>>,
    },
    Teardown(oneshot::Sender<()>),
    AllowedMethods(oneshot::Sender<Vec<&'static str>>),
    ChannelClaims(oneshot::Sender<(Vec<(u8, u8)>, Arc<AtomicI64>)>),
}

/// A cheaply-cloneable handle to a running session task.
#[derive(Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<Command>,
}

impl SessionHandle {
    pub fn channel(buffer: usize) -> (SessionHandle, mpsc::Receiver<Command>) {
        let (tx, rx) = mpsc::channel(buffer);
        (SessionHandle { tx }, rx)
    }

    async fn send(&self, cmd: Command) -> bool {
        self.tx.send(cmd).await.is_ok()
    }

    fn internal_error() -> RequestError {
        RequestError::new(StatusCode::InternalServerError, "session task is gone".to_owned())
    }

    pub async fn announce(&self, tracks: Vec<AnnouncedTrack>) -> Result<(), RequestError> {
        let (tx, rx) = oneshot::channel();
        if !self.send(Command::Announce { tracks, reply: tx }).await {
            return Err(Self::internal_error());
        }
        rx.await.unwrap_or_else(|_| Err(Self::internal_error()))
    }

    pub async fn setup(&self, control: String, transport_header: String) -> Result<TransportSpec, RequestError> {
        let (tx, rx) = oneshot::channel();
        if !self
            .send(Command::Setup {
                control,
                transport_header,
                reply: tx,
            })
            .await
        {
            return Err(Self::internal_error());
        }
        rx.await.unwrap_or_else(|_| Err(Self::internal_error()))
    }

    pub async fn play(&self) -> Result<Vec<RtpInfoEntry>, RequestError> {
        let (tx, rx) = oneshot::channel();
        if !self.send(Command::Play(tx)).await {
            return Err(Self::internal_error());
        }
        rx.await.unwrap_or_else(|_| Err(Self::internal_error()))
    }

    pub async fn record(&self) -> Result<(), RequestError> {
        let (tx, rx) = oneshot::channel();
        if !self.send(Command::Record(tx)).await {
            return Err(Self::internal_error());
        }
        rx.await.unwrap_or_else(|_| Err(Self::internal_error()))
    }

    pub async fn pause(&self, range: Option<String>) -> Result<(), RequestError> {
        let (tx, rx) = oneshot::channel();
        if !self.send(Command::Pause { range, reply: tx }).await {
            return Err(Self::internal_error());
        }
        rx.await.unwrap_or_else(|_| Err(Self::internal_error()))
    }

    pub async fn teardown(&self) {
        let (tx, rx) = oneshot::channel();
        if self.send(Command::Teardown(tx)).await {
            let _ = rx.await;
        }
    }

    pub async fn allowed_methods(&self) -> Vec<&'static str> {
        let (tx, rx) = oneshot::channel();
        if !self.send(Command::AllowedMethods(tx)).await {
            return vec!["OPTIONS"];
        }
        rx.await.unwrap_or_else(|_| vec!["OPTIONS"])
    }

    /// This session's claimed interleaved channel pairs and liveness clock;
    /// `None` if the session task is already gone.
    pub async fn channel_claims(&self) -> Option<(Vec<(u8, u8)>, Arc<AtomicI64>)> {
        let (tx, rx) = oneshot::channel();
        if !self.send(Command::ChannelClaims(tx)).await {
            return None;
        }
        rx.await.ok()
    }
}

/// Reasons a server session ended.
#[derive(Debug, Clone)]
pub enum SessionCloseReason {
    Teardown,
    Timeout(&'static str),
    Terminated,
}

/// Runs one session's command loop (§5: per-session ownership of mutable
/// state) until TEARDOWN, a liveness timeout, or `cancel` fires.
pub async fn run(mut session: ServerSession, mut commands: mpsc::Receiver<Command>, mut cancel: oneshot::Receiver<()>) -> SessionCloseReason {
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    ticker.tick().await; // first tick fires immediately; skip it

    loop {
        tokio::select! {
            biased;

            _ = &mut cancel => {
                session.teardown();
                return SessionCloseReason::Terminated;
            }

            cmd = commands.recv() => {
                let cmd = match cmd {
                    Some(c) => c,
                    None => {
                        session.teardown();
                        return SessionCloseReason::Teardown;
                    }
                };
                match cmd {
                    Command::Announce { tracks, reply } => {
                        let _ = reply.send(session.announce(tracks));
                    }
                    Command::Setup { control, transport_header, reply } => {
                        let _ = reply.send(session.setup(control, &transport_header));
                    }
                    Command::Play(reply) => {
                        let _ = reply.send(session.play());
                    }
                    Command::Record(reply) => {
                        let _ = reply.send(session.record().await);
                    }
                    Command::Pause { range, reply } => {
                        let _ = reply.send(session.pause(range));
                    }
                    Command::Teardown(reply) => {
                        session.teardown();
                        let _ = reply.send(());
                        return SessionCloseReason::Teardown;
                    }
                    Command::AllowedMethods(reply) => {
                        let _ = reply.send(session.allowed_methods());
                    }
                    Command::ChannelClaims(reply) => {
                        let _ = reply.send(session.channel_claims());
                    }
                }
            }

            _ = ticker.tick() => {
                if let Some(reason) = session.check_timeout() {
                    info!("session {} timed out: {}", session.id(), reason);
                    session.teardown();
                    return SessionCloseReason::Timeout(reason);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dummy_conn_ctx() -> ConnectionContext {
        ConnectionContext::dummy()
    }

    fn opts() -> Arc<ServerOptions> {
        Arc::new(ServerOptions::default())
    }

    #[test]
    fn announce_moves_to_pre_record() {
        let mut s = ServerSession::new("sess1".to_owned(), "/cam".to_owned(), &dummy_conn_ctx(), opts(), DistributorRegistry::new());
        s.announce(vec![AnnouncedTrack {
            control: "/cam/trackID=0".to_owned(),
            media: "video".to_owned(),
            encoding_name: "H264".to_owned(),
            clock_rate: 90_000,
            rtp_payload_type: 96,
        }])
        .unwrap();
        assert_eq!(s.mode(), Some(Mode::Record));
    }

    #[tokio::test]
    async fn record_rejects_when_not_every_announced_track_is_setupped() {
        let mut s = ServerSession::new("sess1".to_owned(), "/cam".to_owned(), &dummy_conn_ctx(), opts(), DistributorRegistry::new());
        s.announce(vec![AnnouncedTrack {
            control: "/cam/trackID=0".to_owned(),
            media: "video".to_owned(),
            encoding_name: "H264".to_owned(),
            clock_rate: 90_000,
            rtp_payload_type: 96,
        }])
        .unwrap();
        let err = s.record().await.unwrap_err();
        assert_eq!(err.status, StatusCode::BadRequest);
    }

    #[test]
    fn announce_rejects_track_outside_base_path() {
        let mut s = ServerSession::new("sess1".to_owned(), "/cam".to_owned(), &dummy_conn_ctx(), opts(), DistributorRegistry::new());
        let err = s
            .announce(vec![AnnouncedTrack {
                control: "/other/trackID=0".to_owned(),
                media: "video".to_owned(),
                encoding_name: "H264".to_owned(),
                clock_rate: 90_000,
                rtp_payload_type: 96,
            }])
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BadRequest);
    }

    #[test]
    fn setup_before_describe_allowed_from_initial() {
        let mut s = ServerSession::new("sess1".to_owned(), "/cam".to_owned(), &dummy_conn_ctx(), opts(), DistributorRegistry::new());
        let spec = s
            .setup("/cam/trackID=0".to_owned(), "RTP/AVP/TCP;unicast;interleaved=0-1")
            .unwrap();
        assert_eq!(spec, TransportSpec::Tcp { channel: (0, 1) });
    }

    #[test]
    fn second_setup_with_same_channel_pair_is_rejected() {
        let mut s = ServerSession::new("sess1".to_owned(), "/cam".to_owned(), &dummy_conn_ctx(), opts(), DistributorRegistry::new());
        s.setup("/cam/trackID=0".to_owned(), "RTP/AVP/TCP;unicast;interleaved=0-1").unwrap();
        let err = s
            .setup("/cam/trackID=1".to_owned(), "RTP/AVP/TCP;unicast;interleaved=0-1")
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BadRequest);
    }

    #[test]
    fn play_requires_prior_setup_state() {
        let mut s = ServerSession::new("sess1".to_owned(), "/cam".to_owned(), &dummy_conn_ctx(), opts(), DistributorRegistry::new());
        assert!(s.play().is_err());
        s.setup("/cam/trackID=0".to_owned(), "RTP/AVP/TCP;unicast;interleaved=0-1").unwrap();
        let infos = s.play().unwrap();
        assert_eq!(infos.len(), 1);
    }

    #[test]
    fn pause_after_pause_is_idempotent() {
        let mut s = ServerSession::new("sess1".to_owned(), "/cam".to_owned(), &dummy_conn_ctx(), opts(), DistributorRegistry::new());
        s.setup("/cam/trackID=0".to_owned(), "RTP/AVP/TCP;unicast;interleaved=0-1").unwrap();
        s.play().unwrap();
        s.pause(None).unwrap();
        s.pause(None).unwrap();
    }
}
