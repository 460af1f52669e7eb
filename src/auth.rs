// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The `AuthEngine` collaborator (§4.2): server-side challenge generation
//! and validation, and the client-side [`Credentials`] that accept a
//! challenge and compute subsequent `Authorization` headers. Basic and
//! Digest only; the server's challenges carry no `qop`, so `digest_auth`
//! falls back to the simpler RFC 2069-style response formula on the client
//! side, which [`AuthEngine::validate`] computes the same way server-side.

use std::collections::HashMap;
use std::fmt;

use digest_auth::{AuthContext, HttpMethod, WwwAuthenticateHeader};
use rand::RngCore;

/// An authentication scheme a server may advertise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scheme {
    Basic,
    Digest,
}

enum ClientChallenge {
    Basic,
    Digest(WwwAuthenticateHeader),
}

/// Client-held username/password plus whatever the most recently accepted
/// challenge said about how to present them. `Debug` redacts the password.
pub struct Credentials {
    username: String,
    password: String,
    challenge: Option<ClientChallenge>,
}

impl Credentials {
    pub fn new(username: String, password: String) -> Self {
        Self {
            username,
            password,
            challenge: None,
        }
    }

    /// Parses a `WWW-Authenticate` header value and remembers it for
    /// subsequent [`Self::authorization_header`] calls. Recognizes `Basic`
    /// and `Digest`; anything else is an error (§4.2's "strongest supported"
    /// selection only matters when a server offers both in separate headers,
    /// which callers handle by calling this once per header and keeping
    /// whichever accepted last — Digest should be passed last).
    pub fn accept_challenge(&mut self, header: &str) -> Result<(), String> {
        let header = header.trim();
        if strip_scheme(header, "Digest").is_some() {
            let parsed = digest_auth::parse(header)
                .map_err(|e| format!("invalid Digest challenge {:?}: {}", header, e))?;
            self.challenge = Some(ClientChallenge::Digest(parsed));
            Ok(())
        } else if strip_scheme(header, "Basic").is_some() {
            self.challenge = Some(ClientChallenge::Basic);
            Ok(())
        } else {
            Err(format!("unsupported authentication scheme in challenge {:?}", header))
        }
    }

    /// Computes this connection's `Authorization` header for `method`/`uri`,
    /// or `None` if no challenge has been accepted yet. Mutates the stored
    /// Digest challenge's internal nonce-count on every call, per
    /// `digest_auth`'s `respond` contract.
    pub fn authorization_header(&mut self, method: rtsp_types::Method, uri: &str) -> Option<String> {
        match self.challenge.as_mut()? {
            ClientChallenge::Basic => {
                let token = base64::encode(format!("{}:{}", self.username, self.password));
                Some(format!("Basic {}", token))
            }
            ClientChallenge::Digest(www_authenticate) => {
                let context = AuthContext::new_with_method(
                    self.username.as_str(),
                    self.password.as_str(),
                    uri,
                    HttpMethod::OTHER(method.to_string()),
                );
                www_authenticate.respond(&context).ok().map(|h| h.to_string())
            }
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Server-side challenge generation and validation against the single
/// configured credential pair this connection's sessions authenticate
/// against.
pub struct AuthEngine {
    realm: String,
    username: String,
    password: String,
    schemes: Vec<Scheme>,
    nonce: String,
}

impl AuthEngine {
    /// Generates a fresh random nonce for this engine's lifetime (typically
    /// one per connection or per server, per deployment preference).
    pub fn new(realm: String, username: String, password: String, schemes: Vec<Scheme>) -> Self {
        let mut nonce_bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        Self {
            realm,
            username,
            password,
            schemes,
            nonce: hex::encode(nonce_bytes),
        }
    }

    /// Returns one `WWW-Authenticate` header value per advertised scheme.
    pub fn generate_challenge(&self) -> Vec<String> {
        self.schemes
            .iter()
            .map(|s| match s {
                Scheme::Basic => format!("Basic realm=\"{}\"", self.realm),
                Scheme::Digest => format!("Digest realm=\"{}\", nonce=\"{}\"", self.realm, self.nonce),
            })
            .collect()
    }

    /// Validates a client's `Authorization` header against the method and
    /// request-URI it was computed for. Every failure mode — missing
    /// attribute, wrong username, stale nonce, wrong response — returns the
    /// same opaque error so callers can't leak which attribute was wrong in
    /// the resulting 401 (§4.2).
    pub fn validate(&self, authorization: &str, method: &str, request_uri: &str) -> Result<(), String> {
        const FAILURE: &str = "authentication failed";
        let authorization = authorization.trim();

        if let Some(rest) = strip_scheme(authorization, "Basic") {
            let decoded = base64::decode(rest.trim()).map_err(|_| FAILURE.to_owned())?;
            let expected = format!("{}:{}", self.username, self.password);
            return if ct_eq(&decoded, expected.as_bytes()) {
                Ok(())
            } else {
                Err(FAILURE.to_owned())
            };
        }

        if let Some(rest) = strip_scheme(authorization, "Digest") {
            let params = parse_auth_params(rest);
            let get = |k: &str| params.get(k).cloned().ok_or_else(|| FAILURE.to_owned());
            let username = get("username")?;
            let realm = get("realm")?;
            let nonce = get("nonce")?;
            let uri = get("uri")?;
            let response = get("response")?;

            if !ct_eq_str(&username, &self.username) || !ct_eq_str(&realm, &self.realm) || !ct_eq_str(&nonce, &self.nonce)
            {
                return Err(FAILURE.to_owned());
            }
            if !uris_match(&uri, request_uri) {
                return Err(FAILURE.to_owned());
            }
            let ha1 = md5_hex(&format!("{}:{}:{}", self.username, self.realm, self.password));
            let ha2 = md5_hex(&format!("{}:{}", method, uri));
            let expected = md5_hex(&format!("{}:{}:{}", ha1, self.nonce, ha2));
            return if ct_eq_str(&expected, &response) {
                Ok(())
            } else {
                Err(FAILURE.to_owned())
            };
        }

        Err(FAILURE.to_owned())
    }
}

impl fmt::Debug for AuthEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthEngine")
            .field("realm", &self.realm)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("schemes", &self.schemes)
            .finish()
    }
}

fn strip_scheme<'a>(header: &'a str, scheme: &str) -> Option<&'a str> {
    let bytes = header.as_bytes();
    if header.len() > scheme.len() && header[..scheme.len()].eq_ignore_ascii_case(scheme) && bytes[scheme.len()] == b' ' {
        Some(header[scheme.len()..].trim_start())
    } else {
        None
    }
}

/// Parses a comma-separated `key=value` or `key="value"` attribute list, as
/// found in both `WWW-Authenticate` and `Authorization` Digest headers.
fn parse_auth_params(s: &str) -> HashMap<String, String> {
    let mut out = HashMap::new();
    for part in s.split(',') {
        let part = part.trim();
        if let Some((k, v)) = part.split_once('=') {
            out.insert(k.trim().to_owned(), v.trim().trim_matches('"').to_owned());
        }
    }
    out
}

/// Per §4.2's URI tolerance workaround: some clients (VLC) present a bare
/// `uri` attribute (just the path) while the server's request-URI is
/// absolute; retry the comparison after stripping each side down to its
/// path (everything from the first `/` following the scheme and host, or
/// the whole string if there's no `rtsp(s)://` prefix to strip).
fn uris_match(presented: &str, request_uri: &str) -> bool {
    if presented == request_uri {
        return true;
    }
    path_only(presented) == path_only(request_uri)
}

fn path_only(uri: &str) -> &str {
    let rest = uri.strip_prefix("rtsp://").or_else(|| uri.strip_prefix("rtsps://"));
    match rest {
        Some(rest) => match rest.find('/') {
            Some(i) => &rest[i..],
            None => "/",
        },
        None => uri,
    }
}

fn md5_hex(input: &str) -> String {
    format!("{:x}", md5::compute(input.as_bytes()))
}

/// Constant-time comparison so a mismatch's position can't leak through
/// timing (§4.2: both "missing field" and "wrong credentials" must be
/// indistinguishable from outside).
fn ct_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

fn ct_eq_str(a: &str, b: &str) -> bool {
    ct_eq(a.as_bytes(), b.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn basic_round_trips() {
        let mut creds = Credentials::new("alice".to_owned(), "hunter2".to_owned());
        creds.accept_challenge("Basic realm=\"cam\"").unwrap();
        let header = creds
            .authorization_header(rtsp_types::Method::Describe, "rtsp://h/s")
            .unwrap();
        let engine = AuthEngine::new("cam".to_owned(), "alice".to_owned(), "hunter2".to_owned(), vec![Scheme::Basic]);
        assert!(engine.validate(&header, "DESCRIBE", "rtsp://h/s").is_ok());
    }

    #[test]
    fn digest_round_trips() {
        let engine = AuthEngine::new(
            "IPCAM".to_owned(),
            "admin".to_owned(),
            "secret".to_owned(),
            vec![Scheme::Digest],
        );
        let challenge = engine.generate_challenge();
        let mut creds = Credentials::new("admin".to_owned(), "secret".to_owned());
        creds.accept_challenge(&challenge[0]).unwrap();
        let header = creds
            .authorization_header(rtsp_types::Method::Describe, "rtsp://h/s")
            .unwrap();
        assert!(engine.validate(&header, "DESCRIBE", "rtsp://h/s").is_ok());
    }

    #[test]
    fn digest_rejects_wrong_password() {
        let engine = AuthEngine::new(
            "IPCAM".to_owned(),
            "admin".to_owned(),
            "secret".to_owned(),
            vec![Scheme::Digest],
        );
        let challenge = engine.generate_challenge();
        let mut creds = Credentials::new("admin".to_owned(), "wrong".to_owned());
        creds.accept_challenge(&challenge[0]).unwrap();
        let header = creds
            .authorization_header(rtsp_types::Method::Describe, "rtsp://h/s")
            .unwrap();
        assert!(engine.validate(&header, "DESCRIBE", "rtsp://h/s").is_err());
    }

    #[test]
    fn digest_tolerates_vlc_style_uri_mismatch() {
        let engine = AuthEngine::new(
            "IPCAM".to_owned(),
            "admin".to_owned(),
            "secret".to_owned(),
            vec![Scheme::Digest],
        );
        let challenge = engine.generate_challenge();
        let mut creds = Credentials::new("admin".to_owned(), "secret".to_owned());
        creds.accept_challenge(&challenge[0]).unwrap();
        // VLC computes against a bare path while the server's request-URI is absolute.
        let header = creds
            .authorization_header(rtsp_types::Method::Describe, "/stream")
            .unwrap();
        assert!(engine.validate(&header, "DESCRIBE", "rtsp://h/stream").is_ok());
    }

    #[test]
    fn no_credentials_accepted_yet_yields_no_header() {
        let mut creds = Credentials::new("admin".to_owned(), "secret".to_owned());
        assert!(creds.authorization_header(rtsp_types::Method::Describe, "rtsp://h/s").is_none());
    }
}
