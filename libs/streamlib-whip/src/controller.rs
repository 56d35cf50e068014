// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

// WHIP session controller
//
// Application-facing surface: publish / stop / flush_trickle plus a
// notification channel. Each publish spawns one actor task that owns the
// `Session` machine and the transport. HTTP POST/PATCH run in their own tasks
// and report back through the actor's input queue, so the machine only ever
// sees one input at a time.

use crate::config::WhipConfig;
use crate::error::{Result, WhipError};
use crate::http::{HttpRequest, HttpResponse, HttpTransport, HyperHttpTransport};
use crate::session::{
    self, Session, SessionAction, SessionConfig, SessionInput, SessionNotification, SessionState,
};
use crate::transport::{PeerTransport, TransportEvent};
use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, LazyLock, Mutex};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use url::Url;

/// Transports currently driven by a session, keyed by allocation address.
static CLAIMED_TRANSPORTS: LazyLock<Mutex<HashSet<usize>>> =
    LazyLock::new(|| Mutex::new(HashSet::new()));

/// Exclusive hold on a transport for the lifetime of one session.
struct TransportClaim(usize);

impl TransportClaim {
    fn acquire(transport: &Arc<dyn PeerTransport>) -> Result<Self> {
        // The Arc keeps the allocation alive, so the address cannot be reused
        // while the claim exists.
        let key = Arc::as_ptr(transport) as *const () as usize;
        let mut claimed = CLAIMED_TRANSPORTS
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if !claimed.insert(key) {
            return Err(WhipError::TransportInUse);
        }
        Ok(Self(key))
    }
}

impl Drop for TransportClaim {
    fn drop(&mut self) {
        CLAIMED_TRANSPORTS
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.0);
    }
}

struct SessionHandle {
    inputs: mpsc::UnboundedSender<SessionInput>,
    state: watch::Receiver<SessionState>,
    /// Taken by `stop`.
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    fn is_live(&self) -> bool {
        *self.state.borrow() != SessionState::Closed
    }
}

/// Drives at most one WHIP session at a time.
pub struct SessionController {
    config: WhipConfig,
    http: Arc<dyn HttpTransport>,
    notifications: broadcast::Sender<SessionNotification>,
    active: Option<SessionHandle>,
}

impl SessionController {
    pub fn new(config: WhipConfig, http: Arc<dyn HttpTransport>) -> Result<Self> {
        config.validate()?;
        let (notifications, _) = broadcast::channel(config.notification_capacity);
        Ok(Self {
            config,
            http,
            notifications,
            active: None,
        })
    }

    /// Controller backed by the hyper + rustls HTTP transport.
    pub fn with_hyper(config: WhipConfig) -> Result<Self> {
        let http = HyperHttpTransport::new(&config)?;
        Self::new(config, Arc::new(http))
    }

    pub fn config(&self) -> &WhipConfig {
        &self.config
    }

    /// State transitions, resource creation, delivery progress and errors for
    /// every session this controller runs.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionNotification> {
        self.notifications.subscribe()
    }

    /// State of the current (or most recent) session; `Idle` before the first publish.
    pub fn state(&self) -> SessionState {
        self.active
            .as_ref()
            .map(|handle| *handle.state.borrow())
            .unwrap_or(SessionState::Idle)
    }

    pub fn is_publishing(&self) -> bool {
        self.active.as_ref().is_some_and(SessionHandle::is_live)
    }

    /// Starts a WHIP publish over `transport`.
    ///
    /// Returns once the local offer has been applied. The HTTP exchange
    /// continues in the background; its progress and failures are reported
    /// through [`subscribe`](Self::subscribe).
    ///
    /// A transport serves one session at a time: publishing on a transport
    /// another live session still drives fails with
    /// [`WhipError::TransportInUse`].
    pub async fn publish(
        &mut self,
        endpoint_url: &str,
        auth_token: Option<&str>,
        transport: Arc<dyn PeerTransport>,
    ) -> Result<()> {
        if self.is_publishing() {
            return Err(WhipError::AlreadyPublishing);
        }

        let endpoint_url = Url::parse(endpoint_url)?;
        if !matches!(endpoint_url.scheme(), "http" | "https") {
            return Err(WhipError::Configuration(format!(
                "WHIP endpoint must be http(s), got '{}'",
                endpoint_url
            )));
        }
        // Reject tokens that cannot be sent before touching the transport.
        HttpRequest::new(hyper::Method::POST, endpoint_url.clone()).bearer(auth_token)?;

        let claim = TransportClaim::acquire(&transport)?;

        tracing::info!("[WhipController] Publishing to {}", endpoint_url);

        // Subscribe first so no candidate raised during offer creation is missed.
        let events = transport.subscribe();

        let mut session = Session::new(SessionConfig {
            endpoint_url,
            auth_token: auth_token.map(str::to_owned),
            ice_mode: self.config.ice_mode,
            trickle_batch: self.config.trickle_batch,
        });
        let begin_actions = session.begin();

        let offer = match Self::apply_local_offer(transport.as_ref()).await {
            Ok(offer) => offer,
            Err(e) => {
                tracing::error!("[WhipController] Failed to create local offer: {}", e);
                if let Err(close_err) = transport.close().await {
                    tracing::warn!("[WhipController] Transport close failed: {}", close_err);
                }
                return Err(e);
            }
        };
        let ice_credentials = transport.local_ice_credentials().await;
        let transceivers = transport.transceivers().await;

        let (input_tx, input_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(session.state());

        let actor = SessionActor {
            session,
            transport,
            _claim: claim,
            http: Arc::clone(&self.http),
            inputs: input_tx.clone(),
            state: state_tx,
            notifications: self.notifications.clone(),
        };
        for action in begin_actions {
            if let SessionAction::Notify(notification) = action {
                actor.notify(notification);
            }
        }

        let first = SessionInput::LocalDescriptionApplied {
            offer,
            ice_credentials,
            transceivers,
        };
        let task = tokio::spawn(actor.run(events, input_rx, first));

        self.active = Some(SessionHandle {
            inputs: input_tx,
            state: state_rx,
            task: Some(task),
        });
        Ok(())
    }

    async fn apply_local_offer(transport: &dyn PeerTransport) -> Result<String> {
        let offer = transport.create_offer().await?;
        transport.set_local_description(&offer).await?;
        Ok(offer)
    }

    /// Terminates the active session and waits until it reaches `Closed`.
    ///
    /// DELETE and transport close failures are reported through the
    /// notification channel; they never fail the stop itself.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(handle) = self.active.as_mut().filter(|handle| handle.is_live()) else {
            return Err(WhipError::NotPublishing);
        };

        tracing::info!("[WhipController] Stopping WHIP session");
        // The actor may already be gone if it just reached Closed.
        let _ = handle.inputs.send(SessionInput::Stop);

        if let Some(task) = handle.task.take() {
            task.await.map_err(|e| {
                WhipError::Other(anyhow::anyhow!("WHIP session task failed: {}", e))
            })?;
        }

        tracing::info!("[WhipController] WHIP session closed");
        Ok(())
    }

    /// Asks the active session to deliver pending trickle candidates.
    ///
    /// Requests are coalesced: at most one PATCH is in flight per session, and
    /// the flush gate decides whether anything is sent at all.
    pub fn flush_trickle(&self) -> Result<()> {
        match &self.active {
            Some(handle) if handle.is_live() => handle
                .inputs
                .send(SessionInput::FlushRequested)
                .map_err(|_| WhipError::NotPublishing),
            _ => Err(WhipError::NotPublishing),
        }
    }

    /// Waits until the current session reaches `Closed`, including after an
    /// automatic stop. Returns immediately when no session exists.
    pub async fn closed(&self) {
        let Some(handle) = &self.active else {
            return;
        };
        let mut state = handle.state.clone();
        // Sender dropped means the actor exited, which only happens at Closed.
        let _ = state.wait_for(|s| *s == SessionState::Closed).await;
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        if let Some(handle) = self.active.take() {
            if handle.is_live() {
                tracing::debug!("[WhipController] Dropped while publishing, stopping session");
                let _ = handle.inputs.send(SessionInput::Stop);
            }
        }
    }
}

struct SessionActor {
    session: Session,
    transport: Arc<dyn PeerTransport>,
    _claim: TransportClaim,
    http: Arc<dyn HttpTransport>,
    /// Completion path for spawned HTTP requests.
    inputs: mpsc::UnboundedSender<SessionInput>,
    state: watch::Sender<SessionState>,
    notifications: broadcast::Sender<SessionNotification>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        mut commands: mpsc::UnboundedReceiver<SessionInput>,
        first: SessionInput,
    ) {
        let mut queue = VecDeque::from([first]);

        loop {
            while let Some(input) = queue.pop_front() {
                let actions = self.session.handle(input);
                self.apply(actions, &mut queue).await;
            }

            if self.session.state() == SessionState::Closed {
                break;
            }

            let input = tokio::select! {
                Some(input) = commands.recv() => input,
                Some(event) = events.recv() => SessionInput::Transport(event),
                else => break,
            };
            queue.push_back(input);
        }

        // Completions that raced teardown; later ones are handled by the
        // request task itself.
        commands.close();
        while let Ok(input) = commands.try_recv() {
            let actions = self.session.handle(input);
            self.apply(actions, &mut queue).await;
        }

        tracing::debug!("[WhipController] Session actor exiting");
    }

    async fn apply(&mut self, actions: Vec<SessionAction>, queue: &mut VecDeque<SessionInput>) {
        for action in actions {
            match action {
                SessionAction::Notify(notification) => self.notify(notification),
                SessionAction::PostOffer(request) => {
                    self.spawn_request(request, SessionInput::OfferResponse)
                }
                SessionAction::Patch {
                    request,
                    delivered,
                    end_of_candidates,
                } => self.spawn_request(request, move |result| SessionInput::TrickleResponse {
                    delivered,
                    end_of_candidates,
                    result,
                }),
                SessionAction::ApplyAnswer { sdp } => {
                    let result = self.transport.set_remote_description(&sdp).await;
                    queue.push_back(SessionInput::AnswerApplied(result));
                }
                SessionAction::Delete(request) => self.delete(request).await,
                SessionAction::CloseTransport => {
                    if let Err(e) = self.transport.close().await {
                        tracing::warn!("[WhipController] Transport close failed: {}", e);
                    }
                    queue.push_back(SessionInput::TransportClosed);
                }
            }
        }
    }

    fn notify(&self, notification: SessionNotification) {
        let state = match &notification {
            SessionNotification::StateChanged { to, .. } => Some(*to),
            _ => None,
        };
        // No subscribers is fine.
        let _ = self.notifications.send(notification);
        // Published after the broadcast so `closed()` waiters see every notification.
        if let Some(state) = state {
            self.state.send_replace(state);
        }
    }

    fn spawn_request<F>(&self, request: HttpRequest, complete: F)
    where
        F: FnOnce(Result<HttpResponse>) -> SessionInput + Send + 'static,
    {
        let http = Arc::clone(&self.http);
        let inputs = self.inputs.clone();
        let config = self.session.config().clone();
        tokio::spawn(async move {
            let result = http.send(request).await;
            // Receiver gone means the session already closed.
            let Err(mpsc::error::SendError(SessionInput::OfferResponse(Ok(response)))) =
                inputs.send(complete(result))
            else {
                return;
            };
            if let Some(delete) = session::orphaned_resource_delete(&config, &response) {
                if let Err(e) = http.send(delete).await {
                    tracing::warn!("[WhipController] DELETE of orphaned resource failed: {}", e);
                }
            }
        });
    }

    async fn delete(&self, request: HttpRequest) {
        tracing::info!("[WhipController] Sending DELETE to {}", request.url);
        match self
            .http
            .send(request)
            .await
            .and_then(|response| response.error_for_status("DELETE"))
        {
            Ok(response) => {
                tracing::info!("[WhipController] Session terminated ({})", response.status)
            }
            Err(e) => {
                tracing::warn!("[WhipController] DELETE failed (continuing teardown): {}", e);
                self.notify(SessionNotification::Error {
                    error: Arc::new(e),
                    fatal: false,
                });
            }
        }
    }
}
