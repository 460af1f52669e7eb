// Copyright (C) 2021 Scott Lamb <slamb@slamb.org>
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Error type. See the design doc's error-handling section for the full taxonomy;
//! this module only defines the opaque wrapper and its internal representation.

use std::sync::Arc;

use url::Url;

use crate::{ConnectionContext, RtspMessageContext};

/// The externally visible, language-neutral error kind. Branch on this, not on
/// [`ErrorInt`]'s variants, which may grow or be renamed without a semver bump.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum ErrorKind {
    InvalidState,
    Protocol,
    Transport,
    Auth,
    AutoswitchToTcp,
    Redirect,
    ResourceBusy,
    Teardown,
    Terminated,
}

/// An opaque, cheaply-`Clone`able error.
#[derive(Clone, Debug)]
pub struct Error(pub(crate) Arc<ErrorInt>);

impl Error {
    pub fn kind(&self) -> ErrorKind {
        self.0.kind()
    }
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&*self.0, f)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&*self.0)
    }
}

impl From<ErrorInt> for Error {
    fn from(e: ErrorInt) -> Self {
        Error(Arc::new(e))
    }
}

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub(crate) enum ErrorInt {
    #[error("[{conn_ctx}] method {method} illegal in state {state}")]
    InvalidState {
        conn_ctx: ConnectionContext,
        method: String,
        state: &'static str,
    },

    #[error("[{conn_ctx}, {msg_ctx}] RTSP framing error: {description}")]
    RtspFramingError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        description: String,
    },

    #[error("[{conn_ctx}, {msg_ctx}] {description}")]
    RtspResponseError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        description: String,
    },

    #[error("[{conn_ctx}, {msg_ctx}] bad data on channel {channel_id} (stream {stream_id}): {description}")]
    RtspDataMessageError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        channel_id: u8,
        stream_id: usize,
        description: String,
    },

    #[error("[{conn_ctx}, {msg_ctx}] bad RTP packet on channel {channel_id} (stream {stream_id}, ssrc={ssrc:08x}, seq={sequence_number:04x}): {description}")]
    RtpPacketError {
        conn_ctx: ConnectionContext,
        msg_ctx: RtspMessageContext,
        channel_id: u8,
        stream_id: usize,
        ssrc: u32,
        sequence_number: u16,
        description: String,
    },

    #[error("[{conn_ctx}] {description}")]
    Transport {
        conn_ctx: ConnectionContext,
        description: String,
    },

    #[error("authentication failed: {description}")]
    Auth { description: String },

    #[error("write queue full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("session torn down")]
    Teardown,

    #[error("session terminated")]
    Terminated,

    #[error("switching to TCP after no UDP packets were received")]
    AutoswitchToTcp,

    #[error("redirected to {location}")]
    Redirect { location: Url },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ErrorInt {
    fn kind(&self) -> ErrorKind {
        match self {
            ErrorInt::InvalidState { .. } => ErrorKind::InvalidState,
            ErrorInt::RtspFramingError { .. }
            | ErrorInt::RtspResponseError { .. }
            | ErrorInt::RtspDataMessageError { .. }
            | ErrorInt::RtpPacketError { .. } => ErrorKind::Protocol,
            ErrorInt::Transport { .. } | ErrorInt::Io(_) => ErrorKind::Transport,
            ErrorInt::Auth { .. } => ErrorKind::Auth,
            ErrorInt::QueueFull { .. } => ErrorKind::ResourceBusy,
            ErrorInt::Teardown => ErrorKind::Teardown,
            ErrorInt::Terminated => ErrorKind::Terminated,
            ErrorInt::AutoswitchToTcp => ErrorKind::AutoswitchToTcp,
            ErrorInt::Redirect { .. } => ErrorKind::Redirect,
        }
    }
}
