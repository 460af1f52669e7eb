// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! End-to-end coverage of `ServerConnection` driving real bytes over a
//! `tokio::io::duplex` pipe, rather than calling its handlers directly.

use std::sync::Arc;

use bytes::Bytes;
use rtsp_core::message::{Message, MessageFramer};
use rtsp_core::server::{DistributorRegistry, Handler, Observer, ServerConnection, ServerOptions};
use rtsp_core::ConnectionContext;

struct OneCamera;

impl Handler for OneCamera {
    fn describe(&self, path: &str) -> Option<Bytes> {
        if !path.ends_with("/cam") {
            return None;
        }
        Some(Bytes::from_static(
            b"v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=-\r\n\
c=IN IP4 127.0.0.1\r\n\
t=0 0\r\n\
m=video 0 RTP/AVP 96\r\n\
a=control:trackID=0\r\n\
a=rtpmap:96 H264/90000\r\n",
        ))
    }
}

struct NullObserver;
impl Observer for NullObserver {}

async fn spawn_server() -> MessageFramer<tokio::io::DuplexStream> {
    let (client, server_io) = tokio::io::duplex(8192);
    let options = Arc::new(ServerOptions::default());
    let conn = ServerConnection::new(server_io, ConnectionContext::dummy(), options, Arc::new(OneCamera), NullObserver, DistributorRegistry::new());
    tokio::spawn(async move {
        let _ = conn.run().await;
    });
    MessageFramer::new(client)
}

fn build_request(method: rtsp_types::Method, cseq: u32, uri: &str) -> rtsp_types::Request<Bytes> {
    rtsp_types::Request::builder(method, rtsp_types::Version::V1_0)
        .header(rtsp_types::headers::CSEQ, cseq.to_string())
        .request_uri(uri)
        .build(Bytes::new())
}

#[tokio::test]
async fn options_returns_ok_with_public_header() {
    let mut framer = spawn_server().await;
    framer.write_request(&build_request(rtsp_types::Method::Options, 1, "rtsp://localhost/cam")).await.unwrap();
    match framer.read_message().await.unwrap() {
        Message::Response(resp) => {
            assert_eq!(resp.status(), rtsp_types::StatusCode::Ok);
            assert!(resp.header(&rtsp_types::headers::PUBLIC).is_some());
        }
        other => panic!("expected a response, got {:?}", other),
    }
}

#[tokio::test]
async fn describe_unknown_path_is_not_found() {
    let mut framer = spawn_server().await;
    framer.write_request(&build_request(rtsp_types::Method::Describe, 1, "rtsp://localhost/nope")).await.unwrap();
    match framer.read_message().await.unwrap() {
        Message::Response(resp) => assert_eq!(resp.status(), rtsp_types::StatusCode::NotFound),
        other => panic!("expected a response, got {:?}", other),
    }
}

#[tokio::test]
async fn describe_known_path_returns_sdp_body() {
    let mut framer = spawn_server().await;
    framer.write_request(&build_request(rtsp_types::Method::Describe, 1, "rtsp://localhost/cam")).await.unwrap();
    match framer.read_message().await.unwrap() {
        Message::Response(resp) => {
            assert_eq!(resp.status(), rtsp_types::StatusCode::Ok);
            assert!(resp.body().starts_with(b"v=0"));
        }
        other => panic!("expected a response, got {:?}", other),
    }
}

#[tokio::test]
async fn play_without_session_is_rejected() {
    let mut framer = spawn_server().await;
    framer.write_request(&build_request(rtsp_types::Method::Play, 1, "rtsp://localhost/cam")).await.unwrap();
    match framer.read_message().await.unwrap() {
        Message::Response(resp) => assert_ne!(resp.status(), rtsp_types::StatusCode::Ok),
        other => panic!("expected a response, got {:?}", other),
    }
}
