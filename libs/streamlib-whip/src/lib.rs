// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! WHIP (WebRTC-HTTP Ingestion Protocol) publishing client.
//!
//! [`SessionController`] runs one publish at a time: it creates and applies the
//! local offer on a [`PeerTransport`], POSTs it to the WHIP endpoint, applies
//! the answer, delivers ICE candidates (embedded in the offer, or trickled via
//! PATCH) and DELETEs the resource on stop.
//!
//! ```no_run
//! # async fn run() -> streamlib_whip::Result<()> {
//! use std::sync::Arc;
//! use streamlib_whip::{SessionController, WebRtcTransport, WhipConfig};
//!
//! let config = WhipConfig::trickle();
//! let transport = Arc::new(WebRtcTransport::new_send_only(&config).await?);
//! let mut controller = SessionController::with_hyper(config)?;
//! controller
//!     .publish("https://ingest.example.com/whip/endpoint", Some("token"), transport)
//!     .await?;
//! // ... write samples to transport.video_track() / audio_track() ...
//! controller.stop().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod http;
pub mod sdp;
pub mod session;
pub mod transport;
pub mod webrtc_transport;

pub use config::{IceMode, TrickleBatch, WhipConfig};
pub use controller::SessionController;
pub use error::{Result, WhipError};
pub use http::{HttpRequest, HttpResponse, HttpTransport, HyperHttpTransport};
pub use session::{SessionNotification, SessionState};
pub use transport::{
    ConnectionState, GatheringState, IceCredentials, LocalCandidate, MediaKind, PeerTransport,
    TransceiverInfo, TransportEvent,
};
pub use webrtc_transport::WebRtcTransport;
