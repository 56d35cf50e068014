// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

// WHIP HTTP transport
//
// The session only needs "send a request, get status/headers/body back".
// HyperHttpTransport is the production implementation (hyper + rustls).

use crate::config::WhipConfig;
use crate::error::{Result, WhipError};
use async_trait::async_trait;
use bytes::Bytes;
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::{Method, StatusCode};
use url::Url;

pub const SDP_CONTENT_TYPE: &str = "application/sdp";
pub const TRICKLE_CONTENT_TYPE: &str = "application/trickle-ice-sdpfrag";

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpRequest {
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    /// Adds `Authorization: Bearer <token>` when a token is present.
    pub fn bearer(mut self, token: Option<&str>) -> Result<Self> {
        if let Some(token) = token {
            let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|e| {
                WhipError::Configuration(format!("Invalid bearer token: {}", e))
            })?;
            self.headers.insert(header::AUTHORIZATION, value);
        }
        Ok(self)
    }

    pub fn header(mut self, name: header::HeaderName, value: &str) -> Result<Self> {
        let value = HeaderValue::from_str(value).map_err(|e| {
            WhipError::Protocol(format!("Invalid {} header value: {}", name, e))
        })?;
        self.headers.insert(name, value);
        Ok(self)
    }

    pub fn body(mut self, content_type: &'static str, body: impl Into<Bytes>) -> Self {
        self.headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_static(content_type));
        self.body = body.into();
        self
    }
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
    /// Effective request URL after redirects; `Location` resolves against it.
    pub url: Url,
}

impl HttpResponse {
    pub fn header(&self, name: header::HeaderName) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn body_text(&self) -> Result<String> {
        String::from_utf8(self.body.to_vec())
            .map_err(|e| WhipError::Protocol(format!("Invalid UTF-8 in response body: {}", e)))
    }

    /// Maps a non-2xx response to `WhipError::Http`.
    pub fn error_for_status(self, operation: &str) -> Result<Self> {
        if self.status.is_success() {
            return Ok(self);
        }

        let detail = String::from_utf8(self.body.to_vec())
            .ok()
            .filter(|text| !text.trim().is_empty())
            .unwrap_or_else(|| format!("HTTP {}", self.status));

        let message = if self.status == StatusCode::SERVICE_UNAVAILABLE {
            format!(
                "WHIP {} failed, server overloaded, retry after: {}",
                operation,
                self.header(header::RETRY_AFTER).unwrap_or("unknown")
            )
        } else {
            format!("WHIP {} failed: {}", operation, detail)
        };

        Err(WhipError::Http {
            status: self.status.as_u16(),
            message,
        })
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

type BoxBody =
    http_body_util::combinators::BoxBody<Bytes, Box<dyn std::error::Error + Send + Sync>>;

type HyperClient = hyper_util::client::legacy::Client<
    hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
    BoxBody,
>;

/// hyper + rustls HTTP transport with per-request timeout and 307/308 handling.
pub struct HyperHttpTransport {
    http_client: HyperClient,
    timeout: std::time::Duration,
    max_redirects: u32,
}

impl HyperHttpTransport {
    pub fn new(config: &WhipConfig) -> Result<Self> {
        // Install rustls crypto provider if needed
        if rustls::crypto::CryptoProvider::get_default().is_none() {
            // Losing the race to another installer is fine.
            let _ = rustls::crypto::ring::default_provider().install_default();
        }

        tracing::debug!("[HyperHttp] Building HTTPS connector with native roots...");
        let builder = match hyper_rustls::HttpsConnectorBuilder::new().with_native_roots() {
            Ok(builder) => builder,
            Err(e) => {
                // https:// endpoints will fail verification; http:// still works.
                tracing::warn!("[HyperHttp] No native CA roots ({}), using empty root store", e);
                let tls = rustls::ClientConfig::builder()
                    .with_root_certificates(rustls::RootCertStore::empty())
                    .with_no_client_auth();
                hyper_rustls::HttpsConnectorBuilder::new().with_tls_config(tls)
            }
        };
        let https = builder
            .https_or_http() // Allow http:// for local testing
            .enable_http1()
            .enable_http2()
            .build();

        let http_client =
            hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
                .pool_idle_timeout(std::time::Duration::from_secs(30))
                .build(https);

        Ok(Self {
            http_client,
            timeout: config.timeout(),
            max_redirects: config.max_redirects,
        })
    }

    async fn send_once(&self, request: &HttpRequest) -> Result<(StatusCode, HeaderMap, Bytes)> {
        use http_body_util::{BodyExt, Full};

        let boxed_body = Full::new(request.body.clone())
            .map_err(|never| match never {})
            .boxed();

        let mut builder = hyper::Request::builder()
            .method(request.method.clone())
            .uri(request.url.as_str());
        for (name, value) in request.headers.iter() {
            builder = builder.header(name, value);
        }
        let req = builder.body(boxed_body).map_err(|e| {
            WhipError::Request(format!("Failed to build {} request: {}", request.method, e))
        })?;

        tracing::debug!("[HyperHttp] {} {}", request.method, request.url);

        let response = tokio::time::timeout(self.timeout, self.http_client.request(req))
            .await
            .map_err(|_| {
                WhipError::Request(format!(
                    "{} {} timed out after {}ms",
                    request.method,
                    request.url,
                    self.timeout.as_millis()
                ))
            })?
            .map_err(|e| WhipError::Request(format!("{} {} failed: {}", request.method, request.url, e)))?;

        let status = response.status();
        let headers = response.headers().clone();

        let body = tokio::time::timeout(self.timeout, BodyExt::collect(response.into_body()))
            .await
            .map_err(|_| WhipError::Request("Timed out reading response body".into()))?
            .map_err(|e| WhipError::Request(format!("Failed to read response body: {}", e)))?
            .to_bytes();

        Ok((status, headers, body))
    }
}

#[async_trait]
impl HttpTransport for HyperHttpTransport {
    async fn send(&self, mut request: HttpRequest) -> Result<HttpResponse> {
        let mut redirects = 0;
        loop {
            let (status, headers, body) = self.send_once(&request).await?;

            let is_redirect = matches!(
                status,
                StatusCode::TEMPORARY_REDIRECT | StatusCode::PERMANENT_REDIRECT
            );
            if !is_redirect {
                return Ok(HttpResponse {
                    status,
                    headers,
                    body,
                    url: request.url,
                });
            }

            if redirects >= self.max_redirects {
                return Err(WhipError::Protocol(format!(
                    "Too many redirects ({}) for {}",
                    redirects, request.url
                )));
            }
            let location = headers
                .get(header::LOCATION)
                .and_then(|v| v.to_str().ok())
                .ok_or_else(|| {
                    WhipError::Protocol(format!("{} redirect without Location header", status))
                })?;

            let target = request.url.join(location)?;
            tracing::info!("[HyperHttp] Redirecting to: {}", target);
            request.url = target;
            redirects += 1;
        }
    }
}
