// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! `ServerConnection` (§5): owns one accepted connection's I/O, parses
//! requests, enforces auth, and routes each request either to a stateless
//! handler (OPTIONS/DESCRIBE) or to the [`super::session::ServerSession`]
//! task the request's `Session:` header names (creating one on ANNOUNCE or
//! a session-less SETUP).

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use log::{debug, info, warn};
use rtsp_types::{Method, StatusCode, Version};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

use super::session::{self, AnnouncedTrack, RequestError, ServerSession, SessionCloseReason, SessionHandle};
use super::{DistributorRegistry, ServerOptions};
use crate::auth::AuthEngine;
use crate::message::{InterleavedFrame, Message, MessageFramer};
use crate::{ConnectionContext, Error};

/// Supplies what's out of this core's scope: SDP bodies for DESCRIBE, and
/// acceptance/rejection of an incoming publish (§1's "SDP marshalling is out
/// of scope, supplied by a collaborator").
pub trait Handler: Send + Sync + 'static {
    /// Returns the pre-serialized SDP body for `path`, or `None` for a 404.
    fn describe(&self, path: &str) -> Option<Bytes>;

    /// Approves or rejects an ANNOUNCEd set of tracks for `path`.
    fn accept_announce(&self, path: &str, tracks: &[AnnouncedTrack]) -> Result<(), String> {
        let _ = (path, tracks);
        Ok(())
    }
}

/// Connection-level lifecycle hooks; each session also gets its own via
/// [`super::session::run`]'s caller-supplied bookkeeping.
pub trait Observer: Send + 'static {
    fn on_request_received(&mut self, _cseq: Option<u32>, _method: &Method) {}
    fn on_session_open(&mut self, _session_id: &str) {}
    fn on_session_close(&mut self, _session_id: &str, _reason: &SessionCloseReason) {}
}

fn generate_session_id() -> String {
    use rand::RngCore;
    format!("{:016x}", rand::thread_rng().next_u64())
}

struct SessionEntry {
    handle: SessionHandle,
    cancel: Option<oneshot::Sender<()>>,
}

/// One accepted RTSP connection. `H` supplies presentation data; `O` is a
/// caller-supplied observer for logging/metrics.
pub struct ServerConnection<RW, H, O> {
    framer: MessageFramer<RW>,
    conn_ctx: ConnectionContext,
    options: Arc<ServerOptions>,
    handler: Arc<H>,
    observer: O,
    auth: Option<AuthEngine>,
    sessions: HashMap<String, SessionEntry>,
    /// Shared with every other `ServerConnection` on this listener, so a
    /// RECORD session here and a PLAY session on another connection can fan
    /// out through the same `StreamDistributor` (§5).
    registry: DistributorRegistry,
}

impl<RW, H, O> ServerConnection<RW, H, O>
where
    RW: AsyncRead + AsyncWrite + Unpin,
    H: Handler,
    O: Observer,
{
    pub fn new(io: RW, conn_ctx: ConnectionContext, options: Arc<ServerOptions>, handler: Arc<H>, observer: O, registry: DistributorRegistry) -> Self {
        let auth = if options.auth_schemes.is_empty() {
            None
        } else {
            Some(AuthEngine::new(
                options.realm.clone(),
                options.username.clone(),
                options.password.clone(),
                options.auth_schemes.clone(),
            ))
        };
        let mut framer = MessageFramer::with_conn_ctx(io, conn_ctx);
        framer.set_max_message_size(options.max_request_size.max(options.max_body_size));
        Self {
            framer,
            conn_ctx,
            options,
            handler,
            observer,
            auth,
            sessions: HashMap::new(),
            registry,
        }
    }

    /// Drives this connection until the peer closes it or a fatal framing
    /// error occurs. Non-fatal protocol violations are answered inline and
    /// do not end the loop (§7).
    pub async fn run(mut self) -> Result<(), Error> {
        loop {
            let msg = match self.framer.read_message().await {
                Ok(m) => m,
                Err(e) if e.kind() == crate::ErrorKind::Transport => {
                    debug!("connection {} closed: {}", self.conn_ctx, e);
                    break;
                }
                Err(e) => return Err(e),
            };
            match msg {
                Message::Request(req) => self.dispatch(req).await?,
                Message::Response(_) => {
                    debug!("ignoring unsolicited response on {}", self.conn_ctx);
                }
                Message::Interleaved(frame) => self.handle_inbound_media(frame).await,
            }
        }
        self.shutdown().await;
        Ok(())
    }

    async fn shutdown(&mut self) {
        for (id, entry) in self.sessions.drain() {
            if let Some(cancel) = entry.cancel {
                let _ = cancel.send(());
            }
            debug!("connection closing, releasing session {}", id);
        }
    }

    /// Inbound RTP/RTCP on a RECORD session's TCP channel; touches that
    /// session's liveness clock (§4.6). Forwarding published TCP-interleaved
    /// media to PLAY readers elsewhere is a separate, still-open gap (see
    /// DESIGN.md's Known Simplifications) -- this only keeps the publisher
    /// from being timed out.
    async fn handle_inbound_media(&mut self, frame: InterleavedFrame) {
        for entry in self.sessions.values() {
            if let Some((claims, last_frame)) = entry.handle.channel_claims().await {
                if claims.iter().any(|&(rtp, rtcp)| rtp == frame.channel_id || rtcp == frame.channel_id) {
                    last_frame.store(unix_seconds_now(), std::sync::atomic::Ordering::Relaxed);
                }
            }
        }
    }

    async fn dispatch(&mut self, req: rtsp_types::Request<Bytes>) -> Result<(), Error> {
        let method = req.method();
        let cseq = crate::client::parse::get_cseq_request(&req);
        self.observer.on_request_received(cseq, &method);

        if method != Method::Options {
            if let Some(resp) = self.check_auth(&req, cseq) {
                return self.framer.write_response(&resp).await;
            }
        }

        let result = match method {
            Method::Options => Ok(self.handle_options(&req).await),
            Method::Describe => Ok(self.handle_describe(&req)),
            Method::Announce => self.handle_announce(&req).await,
            Method::Setup => self.handle_setup(&req).await,
            Method::Play => self.handle_play(&req).await,
            Method::Record => self.handle_record(&req).await,
            Method::Pause => self.handle_pause(&req).await,
            Method::TearDown => self.handle_teardown(&req).await,
            Method::GetParameter | Method::SetParameter => Ok(self.handle_parameter_passthrough(&req)),
            other => Ok(self.error_response(cseq, StatusCode::NotImplemented, format!("{:?} not supported", other))),
        };

        let resp = match result {
            Ok(resp) => resp,
            Err(e) => self.error_response(cseq, e.status, e.description),
        };
        self.framer.write_response(&resp).await
    }

    fn check_auth(&self, req: &rtsp_types::Request<Bytes>, cseq: Option<u32>) -> Option<rtsp_types::Response<Bytes>> {
        let auth = self.auth.as_ref()?;
        let uri = req.request_uri().map(|u| u.to_string()).unwrap_or_default();
        let method_name = req.method().to_string();
        let ok = match req.header(&rtsp_types::headers::AUTHORIZATION) {
            Some(header) => auth.validate(header.as_str(), &method_name, &uri).is_ok(),
            None => false,
        };
        if ok {
            return None;
        }
        let mut builder = rtsp_types::Response::builder(Version::V1_0, StatusCode::Unauthorized).header(rtsp_types::headers::CSEQ, cseq.unwrap_or(0).to_string());
        for challenge in auth.generate_challenge() {
            builder = builder.header(rtsp_types::headers::WWW_AUTHENTICATE, challenge);
        }
        Some(builder.build(Bytes::new()))
    }

    fn error_response(&self, cseq: Option<u32>, status: StatusCode, description: String) -> rtsp_types::Response<Bytes> {
        warn!("[{}] {} -> {}: {}", self.conn_ctx, cseq.unwrap_or(0), status, description);
        rtsp_types::Response::builder(Version::V1_0, status)
            .header(rtsp_types::headers::CSEQ, cseq.unwrap_or(0).to_string())
            .build(Bytes::new())
    }

    fn ok_response(&self, cseq: Option<u32>) -> rtsp_types::response::Builder {
        rtsp_types::Response::builder(Version::V1_0, StatusCode::Ok).header(rtsp_types::headers::CSEQ, cseq.unwrap_or(0).to_string())
    }

    async fn handle_options(&mut self, req: &rtsp_types::Request<Bytes>) -> rtsp_types::Response<Bytes> {
        let cseq = crate::client::parse::get_cseq_request(req);
        let session_id = req.header(&rtsp_types::headers::SESSION).map(|v| v.as_str().to_owned());
        let allowed = match session_id.as_deref().and_then(|id| self.sessions.get(id)) {
            Some(entry) => entry.handle.allowed_methods().await,
            None => vec!["OPTIONS", "DESCRIBE", "ANNOUNCE", "SETUP", "GET_PARAMETER", "SET_PARAMETER", "TEARDOWN"],
        };
        self.ok_response(cseq).header(rtsp_types::headers::PUBLIC, allowed.join(", ")).build(Bytes::new())
    }

    fn handle_describe(&mut self, req: &rtsp_types::Request<Bytes>) -> rtsp_types::Response<Bytes> {
        let cseq = crate::client::parse::get_cseq_request(req);
        let path = req.request_uri().map(|u| u.to_string()).unwrap_or_default();
        match self.handler.describe(&path) {
            Some(body) => self
                .ok_response(cseq)
                .header(rtsp_types::headers::CONTENT_TYPE, "application/sdp")
                .build(body),
            None => self.error_response(cseq, StatusCode::NotFound, format!("no presentation at {:?}", path)),
        }
    }

    async fn handle_announce(&mut self, req: &rtsp_types::Request<Bytes>) -> Result<rtsp_types::Response<Bytes>, RequestError> {
        let cseq = crate::client::parse::get_cseq_request(req);
        let content_type = req.header(&rtsp_types::headers::CONTENT_TYPE).map(|v| v.as_str());
        if content_type != Some("application/sdp") {
            return Err(RequestError {
                status: StatusCode::UnsupportedMediaType,
                description: "ANNOUNCE body must be application/sdp".to_owned(),
            });
        }
        let base = req.request_uri().cloned().ok_or_else(|| RequestError {
            status: StatusCode::BadRequest,
            description: "ANNOUNCE missing a request URI".to_owned(),
        })?;
        let path = base.to_string();
        let presentation = crate::description::parse_sdp(base, None, req.body()).map_err(|e| RequestError {
            status: StatusCode::BadRequest,
            description: e,
        })?;
        let tracks: Vec<AnnouncedTrack> = presentation
            .streams
            .iter()
            .map(|s| AnnouncedTrack {
                control: s.control.as_str().to_owned(),
                media: s.media.clone(),
                encoding_name: s.encoding_name.clone(),
                clock_rate: s.clock_rate,
                rtp_payload_type: s.rtp_payload_type,
            })
            .collect();
        self.handler.accept_announce(&path, &tracks).map_err(|description| RequestError {
            status: StatusCode::NotAcceptable,
            description,
        })?;

        let session_id = generate_session_id();
        let session = ServerSession::new(session_id.clone(), path, &self.conn_ctx, self.options.clone(), self.registry.clone());
        let (session_tx, session_rx) = SessionHandle::channel(16);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let task_handle = session_tx.clone();
        tokio::spawn(async move {
            session::run(session, session_rx, cancel_rx).await;
        });
        task_handle.announce(tracks).await?;
        self.sessions.insert(
            session_id.clone(),
            SessionEntry {
                handle: task_handle,
                cancel: Some(cancel_tx),
            },
        );
        self.observer.on_session_open(&session_id);
        info!("[{}] session {} created via ANNOUNCE", self.conn_ctx, session_id);

        Ok(self
            .ok_response(cseq)
            .header(rtsp_types::headers::SESSION, session_id)
            .build(Bytes::new()))
    }

    fn session_id_of(&self, req: &rtsp_types::Request<Bytes>) -> Option<String> {
        req.header(&rtsp_types::headers::SESSION).map(|v| {
            let s = v.as_str();
            match s.find(';') {
                Some(i) => s[..i].to_owned(),
                None => s.to_owned(),
            }
        })
    }

    async fn handle_setup(&mut self, req: &rtsp_types::Request<Bytes>) -> Result<rtsp_types::Response<Bytes>, RequestError> {
        let cseq = crate::client::parse::get_cseq_request(req);
        let transport_header = req
            .header(&rtsp_types::headers::TRANSPORT)
            .ok_or_else(|| RequestError {
                status: StatusCode::BadRequest,
                description: "SETUP missing Transport header".to_owned(),
            })?
            .as_str()
            .to_owned();
        let control = req.request_uri().map(|u| u.to_string()).unwrap_or_default();

        let existing_id = self.session_id_of(req);
        let session_id = match existing_id {
            Some(id) if self.sessions.contains_key(&id) => id,
            Some(id) => {
                return Err(RequestError {
                    status: StatusCode::SessionNotFound,
                    description: format!("unknown session {:?}", id),
                })
            }
            None => {
                let id = generate_session_id();
                let (tx, rx) = SessionHandle::channel(16);
                let (cancel_tx, cancel_rx) = oneshot::channel();
                let session = ServerSession::new(id.clone(), control.clone(), &self.conn_ctx, self.options.clone(), self.registry.clone());
                tokio::spawn(async move {
                    session::run(session, rx, cancel_rx).await;
                });
                self.sessions.insert(
                    id.clone(),
                    SessionEntry {
                        handle: tx,
                        cancel: Some(cancel_tx),
                    },
                );
                self.observer.on_session_open(&id);
                id
            }
        };

        let handle = self.sessions.get(&session_id).unwrap().handle.clone();
        let spec = handle.setup(control, transport_header).await?;

        Ok(self
            .ok_response(cseq)
            .header(rtsp_types::headers::SESSION, session_id)
            .header(rtsp_types::headers::TRANSPORT, spec.to_header().write())
            .build(Bytes::new()))
    }

    async fn handle_play(&mut self, req: &rtsp_types::Request<Bytes>) -> Result<rtsp_types::Response<Bytes>, RequestError> {
        let cseq = crate::client::parse::get_cseq_request(req);
        let handle = self.require_session(req)?;
        let infos = handle.play().await?;
        let rtp_info = infos
            .iter()
            .map(|i| format!("url={};seq={};rtptime={}", i.control, i.seq, i.rtptime))
            .collect::<Vec<_>>()
            .join(",");
        Ok(self.ok_response(cseq).header(rtsp_types::headers::RTP_INFO, rtp_info).build(Bytes::new()))
    }

    async fn handle_record(&mut self, req: &rtsp_types::Request<Bytes>) -> Result<rtsp_types::Response<Bytes>, RequestError> {
        let cseq = crate::client::parse::get_cseq_request(req);
        let handle = self.require_session(req)?;
        handle.record().await?;
        Ok(self.ok_response(cseq).build(Bytes::new()))
    }

    async fn handle_pause(&mut self, req: &rtsp_types::Request<Bytes>) -> Result<rtsp_types::Response<Bytes>, RequestError> {
        let cseq = crate::client::parse::get_cseq_request(req);
        let range = req.header(&rtsp_types::headers::RANGE).map(|v| v.as_str().to_owned());
        let handle = self.require_session(req)?;
        handle.pause(range).await?;
        Ok(self.ok_response(cseq).build(Bytes::new()))
    }

    async fn handle_teardown(&mut self, req: &rtsp_types::Request<Bytes>) -> Result<rtsp_types::Response<Bytes>, RequestError> {
        let cseq = crate::client::parse::get_cseq_request(req);
        if let Some(id) = self.session_id_of(req) {
            if let Some(entry) = self.sessions.remove(&id) {
                entry.handle.teardown().await;
                if let Some(cancel) = entry.cancel {
                    let _ = cancel.send(());
                }
                self.observer.on_session_close(&id, &SessionCloseReason::Teardown);
            }
        }
        Ok(self.ok_response(cseq).build(Bytes::new()))
    }

    fn handle_parameter_passthrough(&mut self, req: &rtsp_types::Request<Bytes>) -> rtsp_types::Response<Bytes> {
        // No parameter language is parsed or interpreted (§1's explicit
        // non-goal); this just round-trips the method as a no-op 200.
        let cseq = crate::client::parse::get_cseq_request(req);
        self.ok_response(cseq).build(Bytes::new())
    }

    fn require_session(&self, req: &rtsp_types::Request<Bytes>) -> Result<SessionHandle, RequestError> {
        let id = self.session_id_of(req).ok_or_else(|| RequestError {
            status: StatusCode::BadRequest,
            description: "request requires a Session header".to_owned(),
        })?;
        self.sessions
            .get(&id)
            .map(|e| e.handle.clone())
            .ok_or_else(|| RequestError {
                status: StatusCode::SessionNotFound,
                description: format!("unknown session {:?}", id),
            })
    }
}

fn unix_seconds_now() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}
