// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The `DescriptionCodec` collaborator: SDP decoding and track/control-URL
//! resolution for a `DESCRIBE` (client) or `ANNOUNCE` (server) body.
//!
//! This module owns the [`sdp`] dependency and exposes a [`Presentation`] /
//! [`Stream`] view that [`crate::client`] and [`crate::server`] build sessions
//! from; it does not itself know about RTSP request/response framing.

use std::convert::TryFrom;

use bytes::Buf;
use sdp::media_description::MediaDescription;
use sdp::session_description::SessionDescription;
use url::Url;

/// Joins a base URL with an SDP `control` attribute value per
/// [RFC 2326 appendix C.1.1](https://tools.ietf.org/html/rfc2326#appendix-C.1.1).
/// A bare `*` means "the base URL itself".
pub fn join_control(base_url: &Url, control: &str) -> Result<Url, String> {
    if control == "*" {
        return Ok(base_url.clone());
    }
    base_url
        .join(control)
        .map_err(|e| format!("unable to join base url {} with control {:?}: {}", base_url, control, e))
}

/// Splits on the first occurrence of `delimiter`, matching the stable-since-1.52
/// `str::split_once` without requiring it.
pub(crate) fn split_once(s: &str, delimiter: char) -> Option<(&str, &str)> {
    s.find(delimiter).map(|p| (&s[..p], &s[p + delimiter.len_utf8()..]))
}

/// One track within a [`Presentation`], as resolved from its SDP media description.
#[derive(Debug, Clone)]
pub struct Stream {
    /// The SDP media type: `video`, `audio`, or `application`.
    pub media: String,
    pub encoding_name: String,
    pub clock_rate: u32,
    pub rtp_payload_type: u8,
    /// The resolved absolute control URL for this track's SETUP/PLAY/RECORD.
    pub control: Url,
    pub state: StreamState,
}

#[derive(Debug, Clone)]
pub enum StreamState {
    /// Not yet SETUP.
    Uninit,
    /// SETUP but not yet seen an RTP-Info entry (client) or not yet playing (server).
    Init(StreamStateInit),
    /// Actively playing or recording.
    Playing {
        timeline: crate::client::timeline::Timeline,
        rtp_seq_base: u16,
    },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StreamStateInit {
    pub ssrc: Option<u32>,
    pub initial_seq: Option<u16>,
    pub initial_rtptime: Option<u32>,
}

/// A fully decoded, track-resolved SDP session description.
#[derive(Debug)]
pub struct Presentation {
    pub streams: Vec<Stream>,
    pub base_url: Url,
    /// The presentation-level control URL (from the global `control` attribute
    /// or, failing that, `base_url`).
    pub control: Url,
    pub accept_dynamic_rate: bool,
    pub sdp: SessionDescription,
}

fn parse_media(base_url: &Url, m: &MediaDescription) -> Result<Stream, String> {
    if !m.media_name.protos.iter().any(|p| p == "RTP") {
        return Err("expected an RTP-based proto in m= line".to_owned());
    }

    let rtp_payload_type_str = m
        .media_name
        .formats
        .first()
        .ok_or_else(|| "missing RTP payload type".to_owned())?;
    let rtp_payload_type: u8 = rtp_payload_type_str
        .parse()
        .map_err(|_| "invalid RTP payload type".to_owned())?;
    if rtp_payload_type & 0x80 != 0 {
        return Err("invalid RTP payload type".to_owned());
    }

    let mut rtpmap = None;
    let mut control = None;
    for a in &m.attributes {
        if a.key == "rtpmap" {
            let v = a
                .value
                .as_ref()
                .ok_or_else(|| "rtpmap attribute with no value".to_owned())?;
            let (payload_type, v) =
                split_once(v, ' ').ok_or_else(|| "invalid rtpmap attribute".to_owned())?;
            if payload_type == rtp_payload_type_str {
                rtpmap = Some(v.to_owned());
            }
        } else if a.key == "control" {
            control = a
                .value
                .as_deref()
                .map(|c| join_control(base_url, c))
                .transpose()?;
        }
    }
    let control = control.ok_or_else(|| "no control url for media".to_owned())?;
    let rtpmap = rtpmap.ok_or_else(|| "expected rtpmap for primary payload type".to_owned())?;

    let (encoding_name, rest) =
        split_once(&rtpmap, '/').ok_or_else(|| "invalid rtpmap attribute".to_owned())?;
    let clock_rate_str = match rest.find('/') {
        None => rest,
        Some(i) => &rest[..i],
    };
    let clock_rate: u32 = clock_rate_str
        .parse()
        .map_err(|_| "bad clock rate in rtpmap".to_owned())?;

    Ok(Stream {
        media: m.media_name.media.clone(),
        encoding_name: encoding_name.to_owned(),
        clock_rate,
        rtp_payload_type,
        control,
        state: StreamState::Uninit,
    })
}

/// Decodes an SDP body (as received in a `DESCRIBE` response or `ANNOUNCE`
/// request) into a [`Presentation`], resolving each track's control URL
/// against `base_url`/the global `control` attribute per the precedence
/// documented in the design notes: SDP `control` → `Content-Base` → request URL.
pub fn parse_sdp(request_url: Url, content_base: Option<&str>, body: &[u8]) -> Result<Presentation, String> {
    let sdp = {
        let mut cursor = std::io::Cursor::new(body);
        let sdp = SessionDescription::unmarshal(&mut cursor)
            .map_err(|e| format!("invalid SDP: {}", e))?;
        if cursor.has_remaining() {
            let pos = usize::try_from(cursor.position()).unwrap();
            return Err(format!("garbage after SDP: {:?}", &body[pos..]));
        }
        sdp
    };

    let base_url = match content_base {
        Some(v) => Url::parse(v).map_err(|e| format!("bad Content-Base: {}", e))?,
        None => request_url,
    };

    let mut control = None;
    for a in &sdp.attributes {
        if a.key == "control" {
            control = a.value.as_deref().map(|c| join_control(&base_url, c)).transpose()?;
            break;
        }
    }
    let control = control.unwrap_or_else(|| base_url.clone());

    // Per the documented precedence (control attribute -> Content-Base ->
    // request URL), each track's own relative control resolves against the
    // already-resolved presentation-level `control`, not the raw base_url.
    let streams = sdp
        .media_descriptions
        .iter()
        .enumerate()
        .map(|(i, m)| parse_media(&control, m).map_err(|e| format!("stream {}: {}", i, e)))
        .collect::<Result<Vec<Stream>, String>>()?;

    let accept_dynamic_rate = sdp
        .attributes
        .iter()
        .any(|a| a.key == "x-accept-dynamic-rate" && a.value.as_deref() == Some("1"));

    Ok(Presentation {
        streams,
        base_url,
        control,
        accept_dynamic_rate,
        sdp,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAHUA_SDP: &[u8] = b"v=0\r\n\
o=- 0 0 IN IP4 192.168.5.111\r\n\
s=Session streamed by \"Dahua RTSP Server\"\r\n\
i=h264\r\n\
t=0 0\r\n\
a=control:*\r\n\
m=video 0 RTP/AVP 96\r\n\
a=control:trackID=0\r\n\
a=rtpmap:96 H264/90000\r\n\
a=fmtp:96 packetization-mode=1\r\n\
m=audio 0 RTP/AVP 8\r\n\
a=control:trackID=1\r\n\
a=rtpmap:8 PCMA/8000\r\n";

    #[test]
    fn parses_two_tracks_with_trailing_control_resolution() {
        let base = Url::parse("rtsp://192.168.5.111:554/cam/realmonitor").unwrap();
        let p = parse_sdp(base.clone(), None, DAHUA_SDP).unwrap();
        assert_eq!(p.streams.len(), 2);
        assert_eq!(p.streams[0].media, "video");
        assert_eq!(p.streams[0].encoding_name, "H264");
        assert_eq!(p.streams[0].clock_rate, 90_000);
        assert_eq!(p.streams[0].rtp_payload_type, 96);
        assert_eq!(
            p.streams[0].control.as_str(),
            "rtsp://192.168.5.111:554/cam/trackID=0"
        );
        assert_eq!(p.streams[1].encoding_name, "PCMA");
        assert_eq!(p.streams[1].clock_rate, 8_000);
    }

    #[test]
    fn content_base_overrides_request_url() {
        let base = Url::parse("rtsp://h/original").unwrap();
        let p = parse_sdp(base, Some("rtsp://h/renamed/"), DAHUA_SDP).unwrap();
        assert_eq!(p.base_url.as_str(), "rtsp://h/renamed/");
    }

    #[test]
    fn global_control_attribute_overrides_content_base_for_tracks() {
        let sdp = b"v=0\r\n\
o=- 0 0 IN IP4 192.168.5.111\r\n\
s=s\r\n\
t=0 0\r\n\
a=control:rtsp://192.168.5.111/renamed/\r\n\
m=video 0 RTP/AVP 96\r\n\
a=control:trackID=0\r\n\
a=rtpmap:96 H264/90000\r\n";
        let base = Url::parse("rtsp://192.168.5.111/original/").unwrap();
        let p = parse_sdp(base, None, sdp).unwrap();
        assert_eq!(p.control.as_str(), "rtsp://192.168.5.111/renamed/");
        assert_eq!(
            p.streams[0].control.as_str(),
            "rtsp://192.168.5.111/renamed/trackID=0"
        );
    }

    #[test]
    fn rejects_non_rtp_proto() {
        let sdp = b"v=0\r\no=- 0 0 IN IP4 1.1.1.1\r\ns=s\r\nt=0 0\r\nm=video 0 UDP 0\r\n";
        let base = Url::parse("rtsp://h/s").unwrap();
        assert!(parse_sdp(base, None, sdp).is_err());
    }
}
