// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Connects to an RTSP server, runs `DESCRIBE`/`SETUP`/`PLAY` on every
//! stream the presentation advertises, and logs packets/session events
//! until interrupted.

use anyhow::{anyhow, Error};
use log::{error, info};
use rtsp_core::client::{rtp, ClientSession, Observer, SessionCloseReason, SessionHandle, SessionOptions, Transport};
use rtsp_core::{auth::Credentials, ConnectionContext};
use std::str::FromStr;
use structopt::StructOpt;

#[derive(StructOpt)]
struct Opts {
    #[structopt(long, parse(try_from_str))]
    url: url::Url,

    #[structopt(long, requires = "password")]
    username: Option<String>,

    #[structopt(long, requires = "username")]
    password: Option<String>,

    /// Forces TCP-interleaved transport instead of trying UDP first.
    #[structopt(long)]
    tcp: bool,
}

fn init_logging() -> mylog::Handle {
    let h = mylog::Builder::new()
        .set_format(
            ::std::env::var("MOONFIRE_FORMAT")
                .map_err(|_| ())
                .and_then(|s| mylog::Format::from_str(&s))
                .unwrap_or(mylog::Format::Google),
        )
        .set_spec(::std::env::var("MOONFIRE_LOG").as_deref().unwrap_or("info"))
        .build();
    h.clone().install().unwrap();
    h
}

#[tokio::main]
async fn main() {
    let mut h = init_logging();
    if let Err(e) = {
        let _a = h.async_scope();
        main_inner().await
    } {
        error!("Fatal: {}", e);
        std::process::exit(1);
    }
    info!("Done");
}

/// Interprets the `username`/`password` of [Opts].
fn creds(username: Option<String>, password: Option<String>) -> Option<Credentials> {
    match (username, password) {
        (Some(username), Some(password)) => Some(Credentials::new(username, password)),
        (None, None) => None,
        _ => unreachable!(), // structopt enforces username and password's mutual "requires".
    }
}

struct LoggingObserver;

impl Observer for LoggingObserver {
    fn on_session_open(&mut self, conn_ctx: &ConnectionContext) {
        info!("session open: {}", conn_ctx);
    }

    fn on_session_close(&mut self, reason: &SessionCloseReason) {
        info!("session closed: {:?}", reason);
    }

    fn on_transport_switch(&mut self, to: Transport) {
        info!("transport switched to {:?}", to);
    }

    fn on_packet_rtp(&mut self, pkt: &rtp::Packet) {
        info!("stream {}: rtp seq={} len={}", pkt.stream_id, pkt.sequence_number, pkt.payload.len());
    }

    fn on_packet_rtcp(&mut self, sr: &rtp::SenderReport) {
        info!("stream {}: sender report ntp={:?}", sr.stream_id, sr.ntp_timestamp);
    }

    fn on_packets_lost(&mut self, stream_id: usize, count: u16) {
        log::warn!("stream {}: lost {} packets", stream_id, count);
    }

    fn on_decode_error(&mut self, stream_id: usize, description: &str) {
        log::warn!("stream {}: {}", stream_id, description);
    }
}

async fn main_inner() -> Result<(), Error> {
    let opts = Opts::from_args();
    let creds = creds(opts.username, opts.password);
    let host = opts.url.host_str().ok_or_else(|| anyhow!("url has no host"))?;
    let port = opts.url.port().unwrap_or(554);
    let stream = tokio::net::TcpStream::connect((host, port)).await?;
    let conn_ctx = ConnectionContext::new(stream.local_addr()?, stream.peer_addr()?);

    let mut options = SessionOptions::default().creds(creds);
    if opts.tcp {
        options = options.transport(Transport::Tcp);
    }

    let (handle, commands) = SessionHandle::channel(4);
    let session = ClientSession::new(stream, conn_ctx, opts.url, options, LoggingObserver);
    let (_cancel_tx, cancel_rx) = tokio::sync::oneshot::channel();
    let task = tokio::spawn(session.run(commands, cancel_rx));

    let stream_count = handle.describe().await?;
    for stream_index in 0..stream_count {
        handle.setup(stream_index).await?;
    }
    handle.play().await?;

    tokio::signal::ctrl_c().await?;
    let _ = handle.teardown().await;
    let _ = task.await;
    Ok(())
}
