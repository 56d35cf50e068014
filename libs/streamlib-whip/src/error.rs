// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WhipError {
    #[error("Already publishing: a WHIP session is active on this controller")]
    AlreadyPublishing,

    #[error("Not publishing: no active WHIP session")]
    NotPublishing,

    #[error("Peer transport is already driven by another WHIP session")]
    TransportInUse,

    #[error("HTTP error: {status} - {message}")]
    Http { status: u16, message: String },

    #[error("Malformed SDP: {0}")]
    MalformedSdp(String),

    #[error("No transceiver for mid '{0}'")]
    UnresolvedTransceiver(String),

    #[error("Transport failure: {0}")]
    TransportFailure(String),

    #[error("Peer transport operation failed: {0}")]
    Transport(String),

    #[error("HTTP request failed: {0}")]
    Request(String),

    #[error("WHIP protocol violation: {0}")]
    Protocol(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(#[from] url::ParseError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WhipError {
    /// HTTP status carried by the error, if it came from a non-2xx response.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Http { status, .. } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, WhipError>;
