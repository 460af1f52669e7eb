// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! RTSP response parsing helpers specific to the client's `SETUP`/`PLAY`
//! handshake; SDP/`DESCRIBE` parsing lives in [`crate::description`].

use bytes::Bytes;

use crate::description::{split_once, Presentation, StreamState};

/// Returns the `CSeq` from a response, or `None` if missing/unparseable (the
/// RTSP spec tolerates responses without one).
pub(crate) fn get_cseq(response: &rtsp_types::Response<Bytes>) -> Option<u32> {
    response
        .header(&rtsp_types::headers::CSEQ)
        .and_then(|v| v.as_str().parse().ok())
}

pub(crate) fn get_cseq_request(request: &rtsp_types::Request<Bytes>) -> Option<u32> {
    request
        .header(&rtsp_types::headers::CSEQ)
        .and_then(|v| v.as_str().parse().ok())
}

pub(crate) struct SetupResponse<'a> {
    pub(crate) session_id: &'a str,
    pub(crate) ssrc: Option<u32>,
    pub(crate) channel_id: Option<u8>,
    pub(crate) server_port: Option<(u16, u16)>,
}

/// Parses a `SETUP` response's `Session` and `Transport` headers.
pub(crate) fn parse_setup(response: &rtsp_types::Response<Bytes>) -> Result<SetupResponse<'_>, String> {
    let session = response
        .header(&rtsp_types::headers::SESSION)
        .ok_or_else(|| "SETUP response has no Session header".to_owned())?;
    let session_id = match session.as_str().find(';') {
        None => session.as_str(),
        Some(i) => &session.as_str()[..i],
    };
    let transport = response
        .header(&rtsp_types::headers::TRANSPORT)
        .ok_or_else(|| "SETUP response has no Transport header".to_owned())?;

    let mut channel_id = None;
    let mut ssrc = None;
    let mut server_port = None;
    for part in transport.as_str().split(';') {
        if let Some(v) = part.strip_prefix("ssrc=") {
            ssrc = Some(u32::from_str_radix(v, 16).map_err(|_| format!("unparseable ssrc {}", v))?);
        } else if let Some(interleaved) = part.strip_prefix("interleaved=") {
            let (n, m) = split_once(interleaved, '-')
                .ok_or_else(|| "interleaved range missing '-'".to_owned())?;
            let n: u8 = n.parse().map_err(|_| format!("bad channel number {}", n))?;
            let m: u8 = m.parse().map_err(|_| format!("bad channel number {}", m))?;
            if n.checked_add(1) != Some(m) {
                return Err(format!("expected adjacent channels; got {}-{}", n, m));
            }
            channel_id = Some(n);
        } else if let Some(v) = part.strip_prefix("server_port=") {
            let (a, b) = split_once(v, '-').ok_or_else(|| "server_port range missing '-'".to_owned())?;
            let a: u16 = a.parse().map_err(|_| format!("bad server_port {}", a))?;
            let b: u16 = b.parse().map_err(|_| format!("bad server_port {}", b))?;
            server_port = Some((a, b));
        }
    }
    Ok(SetupResponse {
        session_id,
        channel_id,
        ssrc,
        server_port,
    })
}

/// Applies a `PLAY` response's `RTP-Info` header to the presentation's
/// per-track state, per [RFC 2326 §12.33](https://tools.ietf.org/html/rfc2326#section-12.33).
pub(crate) fn apply_rtp_info(rtp_info: &str, presentation: &mut Presentation) -> Result<(), String> {
    for s in rtp_info.split(',') {
        let s = s.trim();
        let mut parts = s.split(';');
        let url = parts
            .next()
            .expect("split always yields at least one part")
            .strip_prefix("url=")
            .ok_or_else(|| "RTP-Info entry missing url=".to_owned())?;
        let url = crate::description::join_control(&presentation.base_url, url)?;
        let stream = match presentation.streams.iter_mut().find(|s| s.control == url) {
            Some(s) => s,
            None => continue, // server described a stream we didn't SETUP
        };
        let state = match &mut stream.state {
            StreamState::Uninit => continue,
            StreamState::Init(init) => init,
            StreamState::Playing { .. } => continue,
        };
        for part in parts {
            let (key, value) =
                split_once(part, '=').ok_or_else(|| "RTP-Info param has no '='".to_owned())?;
            match key {
                "seq" => {
                    state.initial_seq =
                        Some(value.parse().map_err(|_| format!("bad seq {:?}", value))?);
                }
                "rtptime" => {
                    state.initial_rtptime =
                        Some(value.parse().map_err(|_| format!("bad rtptime {:?}", value))?);
                }
                "ssrc" => {
                    state.ssrc = Some(
                        u32::from_str_radix(value, 16)
                            .map_err(|_| format!("unparseable ssrc {}", value))?,
                    );
                }
                _ => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use url::Url;

    fn raw_response(raw: &'static [u8]) -> rtsp_types::Response<Bytes> {
        let (msg, len) = rtsp_types::Message::parse(raw).unwrap();
        assert_eq!(len, raw.len());
        match msg {
            rtsp_types::Message::Response(r) => r.map_body(|b| Bytes::copy_from_slice(b)),
            _ => panic!("unexpected message type"),
        }
    }

    #[test]
    fn parses_setup_response_with_interleaved_channels() {
        let raw = b"RTSP/1.0 200 OK\r\n\
CSeq: 2\r\n\
Session: 634214675641;timeout=60\r\n\
Transport: RTP/AVP/TCP;unicast;interleaved=0-1\r\n\
\r\n";
        let resp = raw_response(raw);
        let setup = parse_setup(&resp).unwrap();
        assert_eq!(setup.session_id, "634214675641");
        assert_eq!(setup.channel_id, Some(0));
        assert_eq!(setup.ssrc, None);
    }

    #[test]
    fn rejects_non_adjacent_interleaved_channels() {
        let raw = b"RTSP/1.0 200 OK\r\n\
CSeq: 2\r\n\
Session: abc\r\n\
Transport: RTP/AVP/TCP;unicast;interleaved=0-5\r\n\
\r\n";
        let resp = raw_response(raw);
        assert!(parse_setup(&resp).is_err());
    }

    #[test]
    fn applies_rtp_info_to_matching_stream() {
        const TEST_SDP: &[u8] = b"v=0\r\n\
o=- 0 0 IN IP4 127.0.0.1\r\n\
s=s\r\n\
t=0 0\r\n\
m=video 0 RTP/AVP 96\r\n\
a=control:trackID=0\r\n\
a=rtpmap:96 H264/90000\r\n";
        let base = Url::parse("rtsp://h/s/").unwrap();
        let mut presentation = crate::description::parse_sdp(base, None, TEST_SDP).unwrap();
        presentation.streams[0].state = StreamState::Init(Default::default());
        apply_rtp_info("url=trackID=0;seq=47121;rtptime=3475222385", &mut presentation).unwrap();
        match &presentation.streams[0].state {
            StreamState::Init(s) => {
                assert_eq!(s.initial_seq, Some(47121));
                assert_eq!(s.initial_rtptime, Some(3475222385));
            }
            _ => panic!("expected Init state"),
        }
    }
}
