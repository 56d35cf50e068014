// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Scriptable fakes for the transport and HTTP capabilities.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Method, StatusCode};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use streamlib_whip::{
    HttpRequest, HttpResponse, HttpTransport, LocalCandidate, MediaKind, PeerTransport, Result,
    TransceiverInfo, TransportEvent, WhipError,
};
use tokio::sync::{Semaphore, mpsc};

pub const ENDPOINT: &str = "https://host/whip/endpoint";
pub const RESOURCE: &str = "https://host/whip/resource/abc123";
pub const ANSWER: &str = "v=0\r\no=- 9 9 IN IP4 127.0.0.1\r\ns=-\r\nt=0 0\r\nm=audio 9 UDP/TLS/RTP/SAVPF 111\r\na=mid:0\r\nm=video 9 UDP/TLS/RTP/SAVPF 102\r\na=mid:1\r\n";

pub const OFFER: &str = "v=0\r\n\
    o=- 4611731400430051336 2 IN IP4 127.0.0.1\r\n\
    s=-\r\n\
    t=0 0\r\n\
    a=group:BUNDLE 0 1\r\n\
    m=audio 9 UDP/TLS/RTP/SAVPF 111\r\n\
    c=IN IP4 0.0.0.0\r\n\
    a=ice-ufrag:EsAw\r\n\
    a=ice-pwd:bP+XJMM09aR8AiX1jdukzR6Y\r\n\
    a=mid:0\r\n\
    a=sendonly\r\n\
    a=rtpmap:111 opus/48000/2\r\n\
    m=video 9 UDP/TLS/RTP/SAVPF 102\r\n\
    c=IN IP4 0.0.0.0\r\n\
    a=ice-ufrag:EsAw\r\n\
    a=ice-pwd:bP+XJMM09aR8AiX1jdukzR6Y\r\n\
    a=mid:1\r\n\
    a=sendonly\r\n\
    a=rtpmap:102 H264/90000\r\n";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn candidate(n: u32, mid: &str) -> LocalCandidate {
    LocalCandidate::new(
        format!(
            "candidate:{} 1 udp {} 192.168.1.{} {} typ host",
            n,
            2122260223 - n,
            n,
            50000 + n
        ),
        mid,
    )
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn eventually(what: &str, condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for: {}", what);
}

pub struct FakeTransport {
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    remote_description: Mutex<Option<String>>,
    close_count: AtomicUsize,
    fail_offer: bool,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Self::build(false)
    }

    pub fn failing_offer() -> Arc<Self> {
        Self::build(true)
    }

    fn build(fail_offer: bool) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(None),
            remote_description: Mutex::new(None),
            close_count: AtomicUsize::new(0),
            fail_offer,
        })
    }

    pub fn emit(&self, event: TransportEvent) {
        if let Some(tx) = self.events.lock().unwrap().as_ref() {
            let _ = tx.send(event);
        }
    }

    pub fn emit_candidate(&self, candidate: LocalCandidate) {
        self.emit(TransportEvent::Candidate(candidate));
    }

    pub fn close_count(&self) -> usize {
        self.close_count.load(Ordering::SeqCst)
    }

    pub fn remote_description(&self) -> Option<String> {
        self.remote_description.lock().unwrap().clone()
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    fn subscribe(&self) -> mpsc::UnboundedReceiver<TransportEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.events.lock().unwrap() = Some(tx);
        rx
    }

    async fn create_offer(&self) -> Result<String> {
        if self.fail_offer {
            return Err(WhipError::Transport("offer creation failed".into()));
        }
        Ok(OFFER.to_owned())
    }

    async fn set_local_description(&self, _sdp: &str) -> Result<()> {
        Ok(())
    }

    async fn set_remote_description(&self, sdp: &str) -> Result<()> {
        *self.remote_description.lock().unwrap() = Some(sdp.to_owned());
        Ok(())
    }

    async fn transceivers(&self) -> Vec<TransceiverInfo> {
        vec![
            TransceiverInfo {
                mid: "0".into(),
                kind: MediaKind::Audio,
            },
            TransceiverInfo {
                mid: "1".into(),
                kind: MediaKind::Video,
            },
        ]
    }

    async fn close(&self) -> Result<()> {
        self.close_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

type Responder = Box<dyn Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync>;

/// Records every request and answers like a well-behaved WHIP server unless
/// a custom responder is installed.
pub struct FakeHttp {
    requests: Mutex<Vec<HttpRequest>>,
    responder: Responder,
    /// Responses to this method wait for a permit.
    held: Option<(Method, Arc<Semaphore>)>,
}

impl FakeHttp {
    pub fn new() -> Arc<Self> {
        Self::with_responder(whip_server)
    }

    pub fn with_responder(
        responder: impl Fn(&HttpRequest) -> Result<HttpResponse> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            responder: Box::new(responder),
            held: None,
        })
    }

    /// PATCH responses wait for a permit from the returned semaphore.
    pub fn with_held_patches() -> (Arc<Self>, Arc<Semaphore>) {
        Self::with_held(Method::PATCH)
    }

    /// Responses to `method` wait for a permit from the returned semaphore.
    pub fn with_held(method: Method) -> (Arc<Self>, Arc<Semaphore>) {
        let permits = Arc::new(Semaphore::new(0));
        let http = Arc::new(Self {
            requests: Mutex::new(Vec::new()),
            responder: Box::new(whip_server),
            held: Some((method, Arc::clone(&permits))),
        });
        (http, permits)
    }

    pub fn requests(&self, method: Method) -> Vec<HttpRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.method == method)
            .cloned()
            .collect()
    }

    pub fn bodies(&self, method: Method) -> Vec<String> {
        self.requests(method)
            .iter()
            .map(|r| String::from_utf8(r.body.to_vec()).unwrap())
            .collect()
    }

    pub fn count(&self, method: Method) -> usize {
        self.requests(method).len()
    }
}

#[async_trait]
impl HttpTransport for FakeHttp {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.requests.lock().unwrap().push(request.clone());
        if let Some((method, permits)) = &self.held {
            if request.method == *method {
                permits.acquire().await.unwrap().forget();
            }
        }
        (self.responder)(&request)
    }
}

pub fn response(
    request: &HttpRequest,
    status: u16,
    headers: &[(header::HeaderName, &str)],
    body: &str,
) -> HttpResponse {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        map.insert(name.clone(), HeaderValue::from_str(value).unwrap());
    }
    HttpResponse {
        status: StatusCode::from_u16(status).unwrap(),
        headers: map,
        body: Bytes::from(body.to_owned()),
        url: request.url.clone(),
    }
}

pub fn whip_server(request: &HttpRequest) -> Result<HttpResponse> {
    Ok(match request.method {
        Method::POST => response(
            request,
            201,
            &[
                (header::LOCATION, "/whip/resource/abc123"),
                (header::ETAG, "\"v1\""),
            ],
            ANSWER,
        ),
        Method::PATCH => response(request, 204, &[], ""),
        _ => response(request, 200, &[], ""),
    })
}
