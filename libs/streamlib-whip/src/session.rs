// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

// WHIP session state machine
//
// `Session` owns the mutable state of one publish and is driven one input at a
// time. `handle` never performs I/O; it returns the HTTP requests, transport
// calls and notifications the caller must carry out. Completions are fed back
// as inputs, which keeps every transition testable with a scripted sequence.

use crate::config::{IceMode, TrickleBatch};
use crate::error::{Result, WhipError};
use crate::http::{HttpRequest, HttpResponse, SDP_CONTENT_TYPE, TRICKLE_CONTENT_TYPE};
use crate::sdp;
use crate::transport::{
    ConnectionState, GatheringState, IceCredentials, LocalCandidate, TransceiverInfo,
    TransportEvent,
};
use hyper::Method;
use hyper::header;
use std::sync::Arc;
use url::Url;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Offering,
    AwaitingAnswer,
    Active,
    Trickling,
    Terminating,
    Closed,
    Failed,
}

impl SessionState {
    /// Teardown has started or finished.
    pub fn is_closing(self) -> bool {
        matches!(self, Self::Terminating | Self::Closed | Self::Failed)
    }
}

/// Immutable per-session settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint_url: Url,
    pub auth_token: Option<String>,
    pub ice_mode: IceMode,
    pub trickle_batch: TrickleBatch,
}

#[derive(Debug, Clone)]
pub enum SessionNotification {
    StateChanged {
        from: SessionState,
        to: SessionState,
    },
    ResourceCreated {
        url: Url,
    },
    TransportState(ConnectionState),
    CandidatesDelivered {
        count: usize,
        end_of_candidates: bool,
    },
    Error {
        error: Arc<WhipError>,
        fatal: bool,
    },
}

#[derive(Debug)]
pub enum SessionInput {
    /// The offer has been created and applied as the local description.
    LocalDescriptionApplied {
        offer: String,
        ice_credentials: Option<IceCredentials>,
        transceivers: Vec<TransceiverInfo>,
    },
    Transport(TransportEvent),
    OfferResponse(Result<HttpResponse>),
    AnswerApplied(Result<()>),
    TrickleResponse {
        delivered: usize,
        end_of_candidates: bool,
        result: Result<HttpResponse>,
    },
    FlushRequested,
    Stop,
    TransportClosed,
}

#[derive(Debug)]
pub enum SessionAction {
    PostOffer(HttpRequest),
    ApplyAnswer {
        sdp: String,
    },
    Patch {
        request: HttpRequest,
        delivered: usize,
        end_of_candidates: bool,
    },
    Delete(HttpRequest),
    CloseTransport,
    Notify(SessionNotification),
}

pub struct Session {
    config: SessionConfig,
    state: SessionState,

    /// Set from the POST response `Location`, never replaced.
    resource_url: Option<Url>,
    etag: Option<String>,

    offer: Option<String>,
    offer_sent: bool,
    /// Candidates embedded in the POSTed offer (no-trickle).
    offered_candidates: usize,

    pending_candidates: Vec<LocalCandidate>,
    /// End-of-candidates reached and not yet delivered.
    candidate_gathering_complete: bool,
    gathering_finished: bool,

    ice_credentials: Option<IceCredentials>,
    transceivers: Vec<TransceiverInfo>,

    flush_in_flight: bool,
    flush_requested: bool,
}

impl Session {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: SessionState::Idle,
            resource_url: None,
            etag: None,
            offer: None,
            offer_sent: false,
            offered_candidates: 0,
            pending_candidates: Vec::new(),
            candidate_gathering_complete: false,
            gathering_finished: false,
            ice_credentials: None,
            transceivers: Vec::new(),
            flush_in_flight: false,
            flush_requested: false,
        }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn resource_url(&self) -> Option<&Url> {
        self.resource_url.as_ref()
    }

    pub fn offer(&self) -> Option<&str> {
        self.offer.as_deref()
    }

    pub fn pending_candidates(&self) -> &[LocalCandidate] {
        &self.pending_candidates
    }

    pub fn candidate_gathering_complete(&self) -> bool {
        self.candidate_gathering_complete
    }

    /// Idle -> Offering. Called once when publishing starts.
    pub fn begin(&mut self) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        if self.state == SessionState::Idle {
            self.transition(SessionState::Offering, &mut actions);
        }
        actions
    }

    pub fn handle(&mut self, input: SessionInput) -> Vec<SessionAction> {
        let mut actions = Vec::new();
        match input {
            SessionInput::LocalDescriptionApplied {
                offer,
                ice_credentials,
                transceivers,
            } => self.on_local_description(offer, ice_credentials, transceivers, &mut actions),
            SessionInput::Transport(event) => self.on_transport_event(event, &mut actions),
            SessionInput::OfferResponse(result) => self.on_offer_response(result, &mut actions),
            SessionInput::AnswerApplied(result) => self.on_answer_applied(result, &mut actions),
            SessionInput::TrickleResponse {
                delivered,
                end_of_candidates,
                result,
            } => self.on_trickle_response(delivered, end_of_candidates, result, &mut actions),
            SessionInput::FlushRequested => self.request_flush(&mut actions),
            SessionInput::Stop => self.terminate(&mut actions),
            SessionInput::TransportClosed => {
                if self.state == SessionState::Terminating {
                    self.transition(SessionState::Closed, &mut actions);
                }
            }
        }
        actions
    }

    fn transition(&mut self, to: SessionState, actions: &mut Vec<SessionAction>) {
        if self.state == to {
            return;
        }
        let from = self.state;
        self.state = to;
        tracing::info!("[WhipSession] {:?} -> {:?}", from, to);
        actions.push(SessionAction::Notify(SessionNotification::StateChanged { from, to }));
    }

    fn on_local_description(
        &mut self,
        offer: String,
        ice_credentials: Option<IceCredentials>,
        transceivers: Vec<TransceiverInfo>,
        actions: &mut Vec<SessionAction>,
    ) {
        if self.state != SessionState::Offering {
            tracing::debug!("[WhipSession] Local description ignored in {:?}", self.state);
            return;
        }

        self.offer = Some(offer);
        self.ice_credentials = ice_credentials;
        self.transceivers = transceivers;

        match self.config.ice_mode {
            IceMode::Trickle => self.send_offer(actions),
            IceMode::NoTrickle if self.gathering_finished => self.send_offer(actions),
            IceMode::NoTrickle => {
                tracing::debug!("[WhipSession] Waiting for ICE gathering before POST");
            }
        }
    }

    fn on_transport_event(&mut self, event: TransportEvent, actions: &mut Vec<SessionAction>) {
        match event {
            TransportEvent::Candidate(candidate) => {
                if self.state.is_closing() {
                    tracing::debug!("[WhipSession] Candidate ignored while closing");
                    return;
                }
                if self.config.ice_mode == IceMode::NoTrickle && self.offer_sent {
                    tracing::warn!(
                        "[WhipSession] Candidate after offer was sent, not delivered: {}",
                        candidate.candidate
                    );
                    return;
                }
                tracing::debug!(
                    "[WhipSession] ICE candidate (mid {}): {}",
                    candidate.mid,
                    candidate.candidate
                );
                self.pending_candidates.push(candidate);
                if self.config.ice_mode == IceMode::Trickle {
                    self.request_flush(actions);
                }
            }
            TransportEvent::EndOfCandidates
            | TransportEvent::GatheringState(GatheringState::Complete) => {
                self.on_gathering_complete(actions)
            }
            TransportEvent::GatheringState(state) => {
                tracing::debug!("[WhipSession] ICE gathering state: {:?}", state);
            }
            TransportEvent::ConnectionState(state) => {
                tracing::info!("[WhipSession] Peer connection state: {:?}", state);
                actions.push(SessionAction::Notify(SessionNotification::TransportState(state)));
                if state.is_fatal() {
                    self.fail(
                        WhipError::TransportFailure(format!("peer connection {:?}", state)),
                        actions,
                    );
                }
            }
        }
    }

    fn on_gathering_complete(&mut self, actions: &mut Vec<SessionAction>) {
        if self.gathering_finished || self.state.is_closing() {
            return;
        }
        self.gathering_finished = true;
        self.candidate_gathering_complete = true;
        tracing::debug!(
            "[WhipSession] ICE gathering complete ({} pending candidates)",
            self.pending_candidates.len()
        );

        match self.config.ice_mode {
            IceMode::NoTrickle => {
                if self.state == SessionState::Offering && self.offer.is_some() {
                    self.send_offer(actions);
                }
            }
            IceMode::Trickle => self.request_flush(actions),
        }
    }

    fn send_offer(&mut self, actions: &mut Vec<SessionAction>) {
        if self.offer_sent || self.offer.is_none() {
            return;
        }

        if self.config.ice_mode == IceMode::NoTrickle {
            self.discard_undeliverable(false, actions);
        }
        let Some(offer) = self.offer.as_deref() else {
            return;
        };

        let body = match self.config.ice_mode {
            IceMode::NoTrickle => {
                match sdp::splice_candidates_into_offer(offer, &self.pending_candidates, true) {
                    Ok(spliced) => spliced,
                    Err(e) => return self.fail(e, actions),
                }
            }
            IceMode::Trickle => offer.to_owned(),
        };

        let request = match HttpRequest::new(Method::POST, self.config.endpoint_url.clone())
            .bearer(self.config.auth_token.as_deref())
        {
            Ok(request) => request.body(SDP_CONTENT_TYPE, body.clone()),
            Err(e) => return self.fail(e, actions),
        };

        if self.config.ice_mode == IceMode::NoTrickle {
            self.offered_candidates = self.pending_candidates.len();
        }
        self.offer = Some(body);
        self.offer_sent = true;

        tracing::debug!("[WhipSession] POST offer to {}", self.config.endpoint_url);
        self.transition(SessionState::AwaitingAnswer, actions);
        actions.push(SessionAction::PostOffer(request));
    }

    fn on_offer_response(
        &mut self,
        result: Result<HttpResponse>,
        actions: &mut Vec<SessionAction>,
    ) {
        if self.state != SessionState::AwaitingAnswer {
            tracing::debug!("[WhipSession] POST response ignored in {:?}", self.state);
            // Teardown raced the POST: release whatever the server created.
            if self.state.is_closing() && self.resource_url.is_none() {
                if let Some(request) = result
                    .ok()
                    .and_then(|response| orphaned_resource_delete(&self.config, &response))
                {
                    actions.push(SessionAction::Delete(request));
                }
            }
            return;
        }

        let response = match result.and_then(|r| r.error_for_status("POST")) {
            Ok(response) => response,
            Err(e) => return self.fail(e, actions),
        };

        // Location comes from the headers, before the body is consumed.
        let Some(location) = response.header(header::LOCATION) else {
            return self.fail(
                WhipError::Protocol(format!(
                    "WHIP server returned {} without Location header",
                    response.status
                )),
                actions,
            );
        };
        let resource_url = match response.url.join(location) {
            Ok(url) => url,
            Err(e) => return self.fail(e.into(), actions),
        };

        if self.resource_url.is_none() {
            tracing::info!(
                "[WhipSession] Location '{}' -> resource URL '{}'",
                location,
                resource_url
            );
            self.resource_url = Some(resource_url.clone());
            self.etag = response.header(header::ETAG).map(str::to_owned);
            actions.push(SessionAction::Notify(SessionNotification::ResourceCreated {
                url: resource_url,
            }));
        }

        if self.config.ice_mode == IceMode::NoTrickle {
            let delivered = self.offered_candidates.min(self.pending_candidates.len());
            self.pending_candidates.drain(..delivered);
            self.candidate_gathering_complete = false;
        }

        match response.body_text() {
            Ok(sdp) => actions.push(SessionAction::ApplyAnswer { sdp }),
            Err(e) => self.fail(e, actions),
        }
    }

    fn on_answer_applied(&mut self, result: Result<()>, actions: &mut Vec<SessionAction>) {
        if self.state != SessionState::AwaitingAnswer {
            return;
        }
        if let Err(e) = result {
            return self.fail(e, actions);
        }

        self.transition(SessionState::Active, actions);
        if self.config.ice_mode == IceMode::Trickle {
            self.request_flush(actions);
        }
    }

    fn request_flush(&mut self, actions: &mut Vec<SessionAction>) {
        if self.state.is_closing() {
            return;
        }
        self.flush_requested = true;
        if !self.flush_in_flight {
            self.start_flush(actions);
        }
    }

    fn flush_gate_open(&self) -> bool {
        if self.resource_url.is_none() || self.config.ice_mode != IceMode::Trickle {
            return false;
        }
        let has_candidates = !self.pending_candidates.is_empty();
        match self.config.trickle_batch {
            TrickleBatch::UntilGatheringComplete => {
                has_candidates && self.candidate_gathering_complete
            }
            TrickleBatch::Incremental => has_candidates || self.candidate_gathering_complete,
        }
    }

    fn start_flush(&mut self, actions: &mut Vec<SessionAction>) {
        self.flush_requested = false;
        if self.state != SessionState::Active {
            return;
        }
        self.discard_undeliverable(true, actions);
        if !self.flush_gate_open() {
            return;
        }
        let Some(resource_url) = self.resource_url.clone() else {
            return;
        };

        let credentials = match self.ice_credentials.clone() {
            Some(credentials) => Ok(credentials),
            None => sdp::extract_ice_credentials(self.offer.as_deref().unwrap_or_default()),
        };
        let end_of_candidates = self.candidate_gathering_complete;

        let fragment = credentials.and_then(|credentials| {
            sdp::build_trickle_fragment(
                &credentials.username_fragment,
                &credentials.password,
                &self.pending_candidates,
                |mid| {
                    self.transceivers
                        .iter()
                        .find(|t| t.mid == mid)
                        .map(|t| t.kind)
                },
                end_of_candidates,
            )
        });

        let request = fragment.and_then(|fragment| {
            let mut request = HttpRequest::new(Method::PATCH, resource_url)
                .bearer(self.config.auth_token.as_deref())?;
            if let Some(etag) = &self.etag {
                request = request.header(header::IF_MATCH, etag)?;
            }
            Ok(request.body(TRICKLE_CONTENT_TYPE, fragment))
        });

        let request = match request {
            Ok(request) => request,
            Err(e) => {
                tracing::warn!("[WhipSession] Cannot build trickle fragment: {}", e);
                actions.push(SessionAction::Notify(SessionNotification::Error {
                    error: Arc::new(e),
                    fatal: false,
                }));
                return;
            }
        };

        let delivered = self.pending_candidates.len();
        tracing::debug!(
            "[WhipSession] PATCH {} candidates (end-of-candidates: {})",
            delivered,
            end_of_candidates
        );
        self.flush_in_flight = true;
        self.transition(SessionState::Trickling, actions);
        actions.push(SessionAction::Patch {
            request,
            delivered,
            end_of_candidates,
        });
    }

    fn on_trickle_response(
        &mut self,
        delivered: usize,
        end_of_candidates: bool,
        result: Result<HttpResponse>,
        actions: &mut Vec<SessionAction>,
    ) {
        self.flush_in_flight = false;
        if self.state.is_closing() {
            tracing::debug!("[WhipSession] PATCH completion ignored while closing");
            return;
        }
        self.transition(SessionState::Active, actions);

        match result.and_then(|r| r.error_for_status("PATCH")) {
            Ok(_) => {
                let delivered = delivered.min(self.pending_candidates.len());
                self.pending_candidates.drain(..delivered);
                if end_of_candidates {
                    self.candidate_gathering_complete = false;
                }
                tracing::debug!("[WhipSession] Delivered {} ICE candidates", delivered);
                actions.push(SessionAction::Notify(SessionNotification::CandidatesDelivered {
                    count: delivered,
                    end_of_candidates,
                }));
            }
            Err(e) => {
                // Candidates stay queued for the next trigger.
                tracing::warn!("[WhipSession] Trickle PATCH failed: {}", e);
                actions.push(SessionAction::Notify(SessionNotification::Error {
                    error: Arc::new(e),
                    fatal: false,
                }));
            }
        }

        if self.flush_requested {
            self.start_flush(actions);
        }
    }

    /// Removes queued candidates that can never be delivered and reports each
    /// one, so they cannot hold back the rest of the queue.
    fn discard_undeliverable(
        &mut self,
        require_transceiver: bool,
        actions: &mut Vec<SessionAction>,
    ) {
        let transceivers = &self.transceivers;
        let mut rejected = Vec::new();
        self.pending_candidates.retain(|candidate| {
            let problem = match candidate.parsed() {
                Err(e) => Some(e),
                Ok(_)
                    if require_transceiver
                        && !transceivers.iter().any(|t| t.mid == candidate.mid) =>
                {
                    Some(WhipError::UnresolvedTransceiver(candidate.mid.clone()))
                }
                Ok(_) => None,
            };
            match problem {
                Some(e) => {
                    rejected.push(e);
                    false
                }
                None => true,
            }
        });

        for error in rejected {
            tracing::warn!("[WhipSession] Dropping undeliverable ICE candidate: {}", error);
            actions.push(SessionAction::Notify(SessionNotification::Error {
                error: Arc::new(error),
                fatal: false,
            }));
        }
    }

    fn fail(&mut self, error: WhipError, actions: &mut Vec<SessionAction>) {
        if matches!(self.state, SessionState::Terminating | SessionState::Closed) {
            tracing::debug!("[WhipSession] Error after teardown started: {}", error);
            return;
        }
        tracing::error!("[WhipSession] Session failed: {}", error);
        self.transition(SessionState::Failed, actions);
        actions.push(SessionAction::Notify(SessionNotification::Error {
            error: Arc::new(error),
            fatal: true,
        }));
        self.terminate(actions);
    }

    fn terminate(&mut self, actions: &mut Vec<SessionAction>) {
        if matches!(self.state, SessionState::Terminating | SessionState::Closed) {
            return;
        }
        self.flush_requested = false;
        self.transition(SessionState::Terminating, actions);

        match &self.resource_url {
            Some(url) => match HttpRequest::new(Method::DELETE, url.clone())
                .bearer(self.config.auth_token.as_deref())
            {
                Ok(request) => actions.push(SessionAction::Delete(request)),
                Err(e) => tracing::warn!("[WhipSession] Cannot build DELETE: {}", e),
            },
            None => {
                tracing::warn!("[WhipSession] WHIP resource URL not available at stop");
                actions.push(SessionAction::Notify(SessionNotification::Error {
                    error: Arc::new(WhipError::Protocol(
                        "WHIP resource URL not available at stop".into(),
                    )),
                    fatal: false,
                }));
            }
        }
        actions.push(SessionAction::CloseTransport);
    }
}

/// DELETE for a resource whose POST succeeded after the session tore down.
pub(crate) fn orphaned_resource_delete(
    config: &SessionConfig,
    response: &HttpResponse,
) -> Option<HttpRequest> {
    if !response.status.is_success() {
        return None;
    }
    let url = response.url.join(response.header(header::LOCATION)?).ok()?;
    tracing::info!("[WhipSession] POST completed after teardown, releasing {}", url);
    HttpRequest::new(Method::DELETE, url).bearer(config.auth_token.as_deref()).ok()
}
