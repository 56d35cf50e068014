// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

// Peer transport capability
//
// The media engine (offer/answer creation, ICE gathering, DTLS) lives behind
// this trait. The session controller only consumes it.

use crate::error::Result;
use crate::sdp::IceCandidate;
use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

/// Peer connection state as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// Disconnected and failed are fatal for a WHIP publish.
    pub fn is_fatal(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatheringState {
    New,
    Gathering,
    Complete,
}

/// A locally gathered ICE candidate plus the mid of the media section it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalCandidate {
    /// Attribute value, `candidate:<foundation> <component> ...` (no `a=` prefix).
    pub candidate: String,
    pub mid: String,
}

impl LocalCandidate {
    pub fn new(candidate: impl Into<String>, mid: impl Into<String>) -> Self {
        let candidate = candidate.into();
        let candidate = match candidate.strip_prefix("a=") {
            Some(stripped) => stripped.to_owned(),
            None => candidate,
        };
        Self {
            candidate,
            mid: mid.into(),
        }
    }

    /// The `a=candidate:...` SDP line for this candidate.
    pub fn attribute_line(&self) -> String {
        format!("a={}", self.candidate)
    }

    pub fn parsed(&self) -> Result<IceCandidate> {
        IceCandidate::parse(&self.candidate)
    }
}

/// Events pushed by the transport, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    ConnectionState(ConnectionState),
    GatheringState(GatheringState),
    Candidate(LocalCandidate),
    /// No more candidates will be gathered.
    EndOfCandidates,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MediaKind {
    Audio,
    Video,
    Application,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Audio => f.write_str("audio"),
            Self::Video => f.write_str("video"),
            Self::Application => f.write_str("application"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransceiverInfo {
    pub mid: String,
    pub kind: MediaKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCredentials {
    pub username_fragment: String,
    pub password: String,
}

/// Capability interface for the media transport (a peer connection).
///
/// A transport is owned by exactly one WHIP session for its lifetime; the
/// session closes it on termination.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Opens a fresh event stream. Events raised before the call are not replayed.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent>;

    async fn create_offer(&self) -> Result<String>;

    async fn set_local_description(&self, sdp: &str) -> Result<()>;

    async fn set_remote_description(&self, sdp: &str) -> Result<()>;

    /// Current transceivers, used to resolve a candidate's mid to a media kind.
    async fn transceivers(&self) -> Vec<TransceiverInfo>;

    /// Local ICE credentials when the engine exposes them directly.
    async fn local_ice_credentials(&self) -> Option<IceCredentials> {
        None
    }

    async fn close(&self) -> Result<()>;
}
