// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Authenticated request client.
//!
//! Every call carries the current bearer token and a trace id. A call that
//! fails with an expired token is replayed exactly once after a single-flight
//! renewal; every other failure is surfaced as-is without retry. Downloads
//! take the same path but return the raw body of a 2xx response instead of
//! unwrapping the envelope.

pub mod classify;
pub mod ids;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, CONTENT_DISPOSITION, CONTENT_TYPE};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, Method, Url};
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::config::ClientConfig;
use crate::credential::logout::{LogoutReason, LogoutTrigger};
use crate::credential::renewal::RenewalGate;
use crate::credential::{CredentialStore, Token};
use crate::epoch_ms;
use crate::error::TransportError;
use crate::request::classify::{classify, Classified};
use crate::request::ids::RequestIds;

/// Request payload.
#[derive(Debug, Clone)]
pub enum RequestBody {
    Json(Value),
    /// `multipart/form-data`. Kept as parts so a replay can rebuild the form.
    Multipart(Vec<FilePart>),
}

/// One file of a multipart upload.
#[derive(Debug, Clone)]
pub struct FilePart {
    /// Form field name; `file` unless overridden.
    pub field: String,
    pub file_name: String,
    pub content_type: Option<String>,
    pub data: Bytes,
}

impl FilePart {
    pub fn new(file_name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            field: "file".to_owned(),
            file_name: file_name.into(),
            content_type: None,
            data: data.into(),
        }
    }

    pub fn field(mut self, field: impl Into<String>) -> Self {
        self.field = field.into();
        self
    }

    pub fn content_type(mut self, mime: impl Into<String>) -> Self {
        self.content_type = Some(mime.into());
        self
    }

    fn to_part(&self) -> Result<Part, TransportError> {
        let part = Part::bytes(self.data.to_vec()).file_name(self.file_name.clone());
        match self.content_type {
            Some(ref mime) => part
                .mime_str(mime)
                .map_err(|e| TransportError::InvalidRequest(format!("{}: {e}", self.file_name))),
            None => Ok(part),
        }
    }
}

/// Raw body of a successful download.
#[derive(Debug, Clone, PartialEq)]
pub struct Download {
    pub bytes: Bytes,
    pub content_type: Option<String>,
    /// File name from `Content-Disposition`, when the backend sent one.
    pub file_name: Option<String>,
}

/// Description of one outbound call.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: Method,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: Option<RequestBody>,
    pub headers: Vec<(String, String)>,
    /// Send without credentials (login and other public endpoints).
    pub anonymous: bool,
    /// Overrides the client-wide timeout.
    pub timeout: Option<Duration>,
}

impl ApiRequest {
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: None,
            headers: Vec::new(),
            anonymous: false,
            timeout: None,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(Method::GET, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::POST, path).body(body)
    }

    pub fn put(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PUT, path).body(body)
    }

    pub fn patch(path: impl Into<String>, body: Value) -> Self {
        Self::new(Method::PATCH, path).body(body)
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(Method::DELETE, path)
    }

    /// `POST` of a single file as `multipart/form-data`.
    pub fn upload(path: impl Into<String>, part: FilePart) -> Self {
        Self::new(Method::POST, path).file(part)
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    /// Add a file to the multipart body, replacing any JSON body.
    pub fn file(mut self, part: FilePart) -> Self {
        match self.body {
            Some(RequestBody::Multipart(ref mut parts)) => parts.push(part),
            _ => self.body = Some(RequestBody::Multipart(vec![part])),
        }
        self
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn anonymous(mut self) -> Self {
        self.anonymous = true;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A request bound to its trace id, kept until the call completes so it can
/// be replayed once after renewal.
struct PendingRequest {
    id: String,
    request: ApiRequest,
}

/// Per-call retry bookkeeping.
#[derive(Debug, Default, Clone, Copy)]
struct CallContext {
    retried: bool,
}

/// How a 2xx response body is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponseMode {
    /// Unwrap the `{ success, code, message, data }` envelope.
    Envelope,
    /// Hand back the body untouched.
    Raw,
}

/// One response as read off the wire.
struct Received {
    status: u16,
    headers: HeaderMap,
    body: Bytes,
}

/// A successful call: the envelope `data` (`null` in raw mode) and the
/// response it came from.
struct Reply {
    data: Value,
    headers: HeaderMap,
    body: Bytes,
}

/// HTTP client for the dashboard API.
pub struct RequestClient {
    http: Client,
    base_url: String,
    timeout: Duration,
    expired_code: i64,
    store: Arc<CredentialStore>,
    renewal: Arc<RenewalGate>,
    logout: Arc<LogoutTrigger>,
    ids: RequestIds,
}

impl RequestClient {
    pub fn new(
        config: &ClientConfig,
        store: Arc<CredentialStore>,
        renewal: Arc<RenewalGate>,
        logout: Arc<LogoutTrigger>,
    ) -> Self {
        let http = crate::http_client(None);
        Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_owned(),
            timeout: config.request_timeout(),
            expired_code: config.expired_code,
            store,
            renewal,
            logout,
            ids: RequestIds::new(),
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.store
    }

    /// Perform a call and return the envelope's `data`.
    pub async fn call(&self, request: ApiRequest) -> Result<Value, TransportError> {
        Ok(self.execute(request, ResponseMode::Envelope).await?.data)
    }

    /// Perform a call whose 2xx body is a file rather than an envelope.
    ///
    /// Failures are still classified from the status and envelope, and an
    /// expired token is renewed and the download replayed once.
    pub async fn download(&self, request: ApiRequest) -> Result<Download, TransportError> {
        let reply = self.execute(request, ResponseMode::Raw).await?;
        let header = |name: HeaderName| reply.headers.get(name).and_then(|v| v.to_str().ok());
        Ok(Download {
            content_type: header(CONTENT_TYPE).map(str::to_owned),
            file_name: header(CONTENT_DISPOSITION).and_then(attachment_name),
            bytes: reply.body,
        })
    }

    /// Upload one file as `multipart/form-data` and return the envelope's `data`.
    pub async fn upload(&self, path: &str, part: FilePart) -> Result<Value, TransportError> {
        self.call(ApiRequest::upload(path, part)).await
    }

    async fn execute(&self, request: ApiRequest, mode: ResponseMode) -> Result<Reply, TransportError> {
        let pending = PendingRequest { id: self.ids.next_id(), request };
        let mut ctx = CallContext::default();
        let mut token = if pending.request.anonymous { None } else { self.store.current() };

        loop {
            let received = self.dispatch(&pending, token.as_deref()).await?;
            let classified = match mode {
                ResponseMode::Raw if (200..300).contains(&received.status) => {
                    raw_success(&received, self.expired_code)
                }
                _ => classify(received.status, &received.body, self.expired_code),
            };

            match classified {
                Classified::Success(data) => {
                    return Ok(Reply { data, headers: received.headers, body: received.body });
                }
                Classified::CredentialExpired(message) => {
                    if ctx.retried || pending.request.anonymous {
                        tracing::warn!(request_id = %pending.id, "credential still expired after renewal");
                        if !pending.request.anonymous {
                            self.logout.fire(LogoutReason::Rejected);
                        }
                        return Err(TransportError::AuthenticationFailed(
                            message.unwrap_or_else(|| "credential expired".to_owned()),
                        ));
                    }

                    let stale = token.as_ref().map(|t| t.access.as_str());
                    match self.renewal.renew(stale).await {
                        Ok(renewed) => {
                            tracing::debug!(request_id = %pending.id, "replaying request after renewal");
                            ctx.retried = true;
                            token = Some(renewed);
                        }
                        Err(e) => {
                            self.logout.fire(LogoutReason::RenewalFailed);
                            return Err(e.into());
                        }
                    }
                }
                Classified::Failure(e) => {
                    if matches!(e, TransportError::AuthenticationFailed(_)) && !pending.request.anonymous
                    {
                        self.logout.fire(LogoutReason::Rejected);
                    }
                    tracing::debug!(
                        request_id = %pending.id,
                        status = received.status,
                        code = e.as_str(),
                        "request failed"
                    );
                    return Err(e);
                }
            }
        }
    }

    /// Perform a call and decode `data` into `T`.
    pub async fn call_json<T: DeserializeOwned>(
        &self,
        request: ApiRequest,
    ) -> Result<T, TransportError> {
        let data = self.call(request).await?;
        serde_json::from_value(data)
            .map_err(|e| TransportError::InvalidResponse(format!("unexpected payload: {e}")))
    }

    pub async fn get(&self, path: &str) -> Result<Value, TransportError> {
        self.call(ApiRequest::get(path)).await
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<Value, TransportError> {
        self.call(ApiRequest::post(path, body)).await
    }

    pub async fn put(&self, path: &str, body: Value) -> Result<Value, TransportError> {
        self.call(ApiRequest::put(path, body)).await
    }

    pub async fn patch(&self, path: &str, body: Value) -> Result<Value, TransportError> {
        self.call(ApiRequest::patch(path, body)).await
    }

    pub async fn delete(&self, path: &str) -> Result<Value, TransportError> {
        self.call(ApiRequest::delete(path)).await
    }

    fn url(&self, req: &ApiRequest) -> Result<Url, TransportError> {
        let raw = if req.path.starts_with("http://") || req.path.starts_with("https://") {
            req.path.clone()
        } else if req.path.starts_with('/') {
            format!("{}{}", self.base_url, req.path)
        } else {
            format!("{}/{}", self.base_url, req.path)
        };
        let mut url = Url::parse(&raw)
            .map_err(|e| TransportError::InvalidRequest(format!("{}: {e}", req.path)))?;

        let bust_cache = req.method == Method::GET;
        if !req.query.is_empty() || bust_cache {
            let mut pairs = url.query_pairs_mut();
            for (k, v) in &req.query {
                pairs.append_pair(k, v);
            }
            if bust_cache {
                pairs.append_pair("_t", &epoch_ms().to_string());
            }
        }
        Ok(url)
    }

    /// Send one attempt and read the full body.
    async fn dispatch(
        &self,
        pending: &PendingRequest,
        token: Option<&Token>,
    ) -> Result<Received, TransportError> {
        let req = &pending.request;
        let url = self.url(req)?;

        let mut builder = self
            .http
            .request(req.method.clone(), url)
            .timeout(req.timeout.unwrap_or(self.timeout))
            .header("X-Request-ID", &pending.id)
            .header("X-Request-Time", epoch_ms().to_string());
        for (name, value) in &req.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(token) = token {
            builder = builder.bearer_auth(&token.access);
        }
        match req.body {
            Some(RequestBody::Json(ref body)) => builder = builder.json(body),
            Some(RequestBody::Multipart(ref parts)) => {
                let mut form = Form::new();
                for part in parts {
                    form = form.part(part.field.clone(), part.to_part()?);
                }
                builder = builder.multipart(form);
            }
            None => {}
        }

        let resp = builder.send().await.map_err(send_error)?;
        let status = resp.status().as_u16();
        let headers = resp.headers().clone();
        let body = resp.bytes().await.map_err(send_error)?;
        tracing::debug!(
            request_id = %pending.id,
            method = %req.method,
            path = %req.path,
            status,
            "response received"
        );
        Ok(Received { status, headers, body })
    }
}

/// A 2xx raw body is the payload, unless it is a JSON envelope reporting a
/// business failure.
fn raw_success(received: &Received, expired_code: i64) -> Classified {
    let json = received
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));
    if json {
        if let failed @ Classified::Failure(TransportError::BusinessError(_)) =
            classify(received.status, &received.body, expired_code)
        {
            return failed;
        }
    }
    Classified::Success(Value::Null)
}

/// File name from a `Content-Disposition` value. `filename*` (RFC 5987)
/// wins over a plain `filename`.
fn attachment_name(disposition: &str) -> Option<String> {
    let mut plain = None;
    for param in disposition.split(';').map(str::trim) {
        if let Some(value) = param.strip_prefix("filename*=") {
            let encoded = value.rsplit_once('\'').map_or(value, |(_, name)| name);
            if let Ok(name) = urlencoding::decode(encoded.trim_matches('"')) {
                return Some(name.into_owned()).filter(|n| !n.is_empty());
            }
        } else if let Some(value) = param.strip_prefix("filename=") {
            let value = value.trim_matches('"');
            plain = Some(
                urlencoding::decode(value).map_or_else(|_| value.to_owned(), |n| n.into_owned()),
            );
        }
    }
    plain.filter(|n| !n.is_empty())
}

fn send_error(e: reqwest::Error) -> TransportError {
    if e.is_timeout() {
        TransportError::Timeout
    } else if e.is_builder() {
        TransportError::InvalidRequest(e.to_string())
    } else {
        TransportError::NetworkUnavailable(e.to_string())
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
