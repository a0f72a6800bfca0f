// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Shared test infrastructure: an in-process mock backend, scripted
//! collaborators, and assertion helpers.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Multipart, Path, Query, State, WebSocketUpgrade};
use axum::http::{header, HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::channel::ChannelState;
use crate::config::ClientConfig;
use crate::credential::logout::{LogoutReason, LogoutTrigger};
use crate::credential::refresh::{HttpRenewer, TokenRenewer};
use crate::credential::renewal::RenewalGate;
use crate::credential::{CredentialStore, Token};
use crate::dispatch::events::Envelope;
use crate::error::AuthError;
use crate::request::RequestClient;

/// Password the mock backend accepts for any username.
pub const PASSWORD: &str = "secret";

/// Access token the mock backend rejects outright (not an expiry).
pub const REVOKED_TOKEN: &str = "revoked";

/// Captcha id and answer the mock backend hands out and accepts.
pub const CAPTCHA_ID: &str = "captcha-1";
pub const CAPTCHA_ANSWER: &str = "7k3q";

/// Body of every file served by the mock download route.
pub const REPORT_BYTES: &[u8] = b"%PDF-1.4\n%\xe2\xe3\xcf\xd3\n1 0 obj\n<< /Type /Catalog >>\nendobj\n";

/// Assert that an expression evaluates to `Err` whose Display output
/// contains the given substring.
#[macro_export]
macro_rules! assert_err_contains {
    ($expr:expr, $substr:expr) => {{
        let result = $expr;
        let err = result.expect_err(concat!("expected Err for: ", stringify!($expr)));
        let msg = err.to_string();
        assert!(msg.contains($substr), "expected error containing {:?}, got: {msg:?}", $substr);
    }};
}

/// Poll `cond` every 10ms until it holds or `timeout` elapses.
pub async fn wait_for(timeout: Duration, mut cond: impl FnMut() -> bool) -> anyhow::Result<()> {
    let deadline = tokio::time::Instant::now() + timeout;
    while !cond() {
        if tokio::time::Instant::now() >= deadline {
            anyhow::bail!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    Ok(())
}

/// Client config with timings scaled down for tests.
pub fn fast_config(base_url: impl Into<String>) -> ClientConfig {
    let mut config = ClientConfig::new(base_url);
    config.timeout_ms = 2000;
    config.connect_timeout_ms = 1000;
    config.heartbeat_ms = 200;
    config.reconnect_attempts = 3;
    config.reconnect_delay_ms = 50;
    config
}

// -- Scripted renewer --------------------------------------------------------

/// A [`TokenRenewer`] with a fixed outcome and an optional delay.
///
/// Successful renewals hand out `access-N` / `refresh-N` where `N` is the
/// call count.
pub struct ScriptedRenewer {
    calls: AtomicU32,
    delay: Duration,
    failure: Option<AuthError>,
    seen: Mutex<Vec<String>>,
}

impl ScriptedRenewer {
    pub fn succeeding(delay: Duration) -> Arc<Self> {
        Arc::new(Self { calls: AtomicU32::new(0), delay, failure: None, seen: Mutex::new(Vec::new()) })
    }

    pub fn failing(delay: Duration, err: AuthError) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicU32::new(0),
            delay,
            failure: Some(err),
            seen: Mutex::new(Vec::new()),
        })
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Refresh tokens presented, in call order.
    pub fn seen(&self) -> Vec<String> {
        self.seen.lock().clone()
    }
}

impl TokenRenewer for ScriptedRenewer {
    fn renew<'a>(
        &'a self,
        refresh_token: &'a str,
    ) -> Pin<Box<dyn Future<Output = Result<Token, AuthError>> + Send + 'a>> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.seen.lock().push(refresh_token.to_owned());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            match self.failure {
                Some(ref e) => Err(e.clone()),
                None => Ok(Token::new(format!("access-{n}"), format!("refresh-{n}"))),
            }
        })
    }
}

// -- Wired client stack ------------------------------------------------------

/// Credential store, renewal gate, logout trigger and request client wired
/// together against one backend, recording every logout.
pub struct ClientStack {
    pub store: Arc<CredentialStore>,
    pub renewal: Arc<RenewalGate>,
    pub logout: Arc<LogoutTrigger>,
    pub client: Arc<RequestClient>,
    logouts: Arc<Mutex<Vec<LogoutReason>>>,
}

impl ClientStack {
    /// Stack renewing over HTTP against `config.base_url`.
    pub fn new(config: &ClientConfig, token: Option<Token>) -> Self {
        let renewer = HttpRenewer::new(&config.base_url, config.request_timeout(), config.expired_code);
        Self::with_renewer(config, token, Arc::new(renewer))
    }

    pub fn with_renewer(
        config: &ClientConfig,
        token: Option<Token>,
        renewer: Arc<dyn TokenRenewer>,
    ) -> Self {
        let store = match token {
            Some(token) => CredentialStore::with_token(token),
            None => CredentialStore::new(),
        };
        let logouts = Arc::new(Mutex::new(Vec::new()));
        let recorded = Arc::clone(&logouts);
        let logout = LogoutTrigger::with_action(Arc::clone(&store), move |reason| {
            recorded.lock().push(reason);
        });
        let renewal = RenewalGate::new(Arc::clone(&store), renewer);
        let client = Arc::new(RequestClient::new(
            config,
            Arc::clone(&store),
            Arc::clone(&renewal),
            Arc::clone(&logout),
        ));
        Self { store, renewal, logout, client, logouts }
    }

    pub fn logouts(&self) -> Vec<LogoutReason> {
        self.logouts.lock().clone()
    }
}

/// Record every state a channel publishes, starting with the current one.
pub fn record_states(mut rx: watch::Receiver<ChannelState>) -> Arc<Mutex<Vec<ChannelState>>> {
    let states = Arc::new(Mutex::new(vec![*rx.borrow_and_update()]));
    let sink = Arc::clone(&states);
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let state = *rx.borrow_and_update();
            sink.lock().push(state);
        }
    });
    states
}

// -- Mock backend ------------------------------------------------------------

/// One request seen by an authenticated route.
#[derive(Debug, Clone)]
pub struct SeenRequest {
    pub path: String,
    pub request_id: Option<String>,
    pub bearer: Option<String>,
}

#[derive(Debug, Clone)]
enum PushCommand {
    Text(String),
    /// Drop the socket without a close handshake.
    Drop,
    Close(u16),
}

#[derive(Default)]
struct Counters {
    refresh_calls: AtomicU32,
    logout_calls: AtomicU32,
    always_expired_hits: AtomicU32,
    upgrade_attempts: AtomicU32,
    ws_opens: AtomicU32,
    ws_active: AtomicU32,
}

struct BackendState {
    counters: Counters,
    valid: Mutex<HashSet<String>>,
    next_token: AtomicU32,
    refresh_delay_ms: AtomicU64,
    refresh_fails: AtomicBool,
    seen: Mutex<Vec<SeenRequest>>,
    push: broadcast::Sender<PushCommand>,
    answer_heartbeats: AtomicBool,
    refuse_upgrades: AtomicU32,
    ws_tokens: Mutex<Vec<Option<String>>>,
    received: Mutex<Vec<String>>,
}

impl BackendState {
    fn issue(&self) -> Token {
        let n = self.next_token.fetch_add(1, Ordering::SeqCst);
        let token = Token::new(format!("access-{n}"), format!("refresh-{n}"));
        self.valid.lock().insert(token.access.clone());
        token
    }
}

/// In-process dashboard backend on a random local port.
///
/// HTTP routes live under `/api`, the push channel at `/ws`. Any bearer token
/// the backend did not issue (or that was expired with [`Self::expire_all`])
/// is answered with a `TOKEN_EXPIRED` 401.
pub struct MockBackend {
    pub addr: SocketAddr,
    state: Arc<BackendState>,
    handle: JoinHandle<()>,
}

impl MockBackend {
    pub async fn spawn() -> anyhow::Result<Self> {
        let (push, _) = broadcast::channel(64);
        let state = Arc::new(BackendState {
            counters: Counters::default(),
            valid: Mutex::new(HashSet::new()),
            next_token: AtomicU32::new(1),
            refresh_delay_ms: AtomicU64::new(0),
            refresh_fails: AtomicBool::new(false),
            seen: Mutex::new(Vec::new()),
            push,
            answer_heartbeats: AtomicBool::new(true),
            refuse_upgrades: AtomicU32::new(0),
            ws_tokens: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
        });

        let router = Router::new()
            .route("/api/auth/login", post(login))
            .route("/api/auth/refresh", post(refresh))
            .route("/api/auth/logout", post(logout))
            .route("/api/auth/user", get(current_user))
            .route("/api/auth/change-password", post(change_password))
            .route("/api/auth/captcha", get(captcha))
            .route("/api/files/upload", post(upload))
            .route("/api/files/{id}/download", get(download))
            .route("/api/echo", any(echo))
            .route("/api/always-expired", any(always_expired))
            .route("/api/status/{code}", any(status))
            .route("/api/business-fail", get(business_fail))
            .route("/api/malformed", get(malformed))
            .route("/api/slow", get(slow))
            .route("/ws", get(ws_upgrade))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });
        Ok(Self { addr, state, handle })
    }

    pub fn base_url(&self) -> String {
        format!("http://{}/api", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.addr)
    }

    /// Fast test config pointed at this backend.
    pub fn config(&self) -> ClientConfig {
        let mut config = fast_config(self.base_url());
        config.ws_url = Some(self.ws_url());
        config
    }

    /// Issue a token pair the backend accepts.
    pub fn issue_token(&self) -> Token {
        self.state.issue()
    }

    /// Expire every issued access token.
    pub fn expire_all(&self) {
        self.state.valid.lock().clear();
    }

    pub fn set_refresh_delay(&self, delay: Duration) {
        self.state.refresh_delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn fail_refresh(&self, fail: bool) {
        self.state.refresh_fails.store(fail, Ordering::SeqCst);
    }

    pub fn refresh_calls(&self) -> u32 {
        self.state.counters.refresh_calls.load(Ordering::SeqCst)
    }

    pub fn logout_calls(&self) -> u32 {
        self.state.counters.logout_calls.load(Ordering::SeqCst)
    }

    pub fn always_expired_hits(&self) -> u32 {
        self.state.counters.always_expired_hits.load(Ordering::SeqCst)
    }

    /// Requests seen by authenticated routes, in arrival order.
    pub fn seen_requests(&self) -> Vec<SeenRequest> {
        self.state.seen.lock().clone()
    }

    /// Push an event envelope to every open push connection.
    pub fn push_event(&self, kind: &str, data: Value) {
        let text = serde_json::to_string(&Envelope::new(kind, data)).unwrap_or_default();
        self.push_raw(text);
    }

    pub fn push_raw(&self, text: impl Into<String>) {
        let _ = self.state.push.send(PushCommand::Text(text.into()));
    }

    /// Drop every push connection without a close handshake.
    pub fn drop_connections(&self) {
        let _ = self.state.push.send(PushCommand::Drop);
    }

    /// Close every push connection with `code`.
    pub fn close_connections(&self, code: u16) {
        let _ = self.state.push.send(PushCommand::Close(code));
    }

    /// Whether push connections echo heartbeats back.
    pub fn answer_heartbeats(&self, answer: bool) {
        self.state.answer_heartbeats.store(answer, Ordering::SeqCst);
    }

    /// Refuse the next `n` push upgrades with a 503.
    pub fn refuse_upgrades(&self, n: u32) {
        self.state.refuse_upgrades.store(n, Ordering::SeqCst);
    }

    /// Upgrade requests received, refused ones included.
    pub fn upgrade_attempts(&self) -> u32 {
        self.state.counters.upgrade_attempts.load(Ordering::SeqCst)
    }

    /// Push connections opened so far.
    pub fn ws_opens(&self) -> u32 {
        self.state.counters.ws_opens.load(Ordering::SeqCst)
    }

    /// Push connections currently open.
    pub fn ws_active(&self) -> u32 {
        self.state.counters.ws_active.load(Ordering::SeqCst)
    }

    /// `token` query parameter of each accepted upgrade.
    pub fn ws_tokens(&self) -> Vec<Option<String>> {
        self.state.ws_tokens.lock().clone()
    }

    /// Text frames received from clients, heartbeats included.
    pub fn received_frames(&self) -> Vec<String> {
        self.state.received.lock().clone()
    }

    pub fn heartbeats_received(&self) -> usize {
        self.state.received.lock().iter().filter(|f| f.contains("\"heartbeat\"")).count()
    }

    pub async fn wait_for_ws(&self, active: u32) -> anyhow::Result<()> {
        wait_for(Duration::from_secs(5), || self.ws_active() == active).await
    }
}

impl Drop for MockBackend {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

// -- Routes ------------------------------------------------------------------

fn envelope(status: StatusCode, body: Value) -> Response {
    (status, Json(body)).into_response()
}

fn ok(data: Value) -> Response {
    envelope(StatusCode::OK, json!({ "success": true, "code": 200, "message": "ok", "data": data }))
}

fn expired() -> Response {
    envelope(
        StatusCode::UNAUTHORIZED,
        json!({ "success": false, "code": "TOKEN_EXPIRED", "message": "token expired" }),
    )
}

fn rejected(message: &str) -> Response {
    envelope(StatusCode::UNAUTHORIZED, json!({ "success": false, "code": 401, "message": message }))
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::to_owned)
}

/// Record the request and check its bearer token.
fn authorize(state: &BackendState, headers: &HeaderMap, path: &str) -> Result<String, Response> {
    let bearer =
        header_value(headers, "authorization").and_then(|v| v.strip_prefix("Bearer ").map(str::to_owned));
    state.seen.lock().push(SeenRequest {
        path: path.to_owned(),
        request_id: header_value(headers, "x-request-id"),
        bearer: bearer.clone(),
    });

    match bearer {
        None => Err(rejected("missing credential")),
        Some(t) if t == REVOKED_TOKEN => Err(rejected("invalid signature")),
        Some(t) if state.valid.lock().contains(&t) => Ok(t),
        Some(_) => Err(expired()),
    }
}

fn user_json(username: &str) -> Value {
    json!({
        "id": 1,
        "userId": "U-0001",
        "username": username,
        "fullName": "Duty Operator",
        "department": "Line 1 Control",
        "role": "OPERATOR",
        "status": "ACTIVE",
    })
}

async fn login(State(s): State<Arc<BackendState>>, Json(body): Json<Value>) -> Response {
    let username = body["username"].as_str().unwrap_or_default();
    if body["password"].as_str() != Some(PASSWORD) || username.is_empty() {
        return rejected("invalid username or password");
    }
    if body["captcha"].as_str().is_some_and(|c| c != CAPTCHA_ANSWER) {
        return envelope(
            StatusCode::OK,
            json!({ "success": false, "code": 400, "message": "captcha incorrect" }),
        );
    }
    let token = s.issue();
    ok(json!({
        "token": token.access,
        "refreshToken": token.refresh,
        "expiresIn": 3600,
        "user": user_json(username),
    }))
}

async fn refresh(State(s): State<Arc<BackendState>>, Json(body): Json<Value>) -> Response {
    s.counters.refresh_calls.fetch_add(1, Ordering::SeqCst);
    let delay = s.refresh_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    let presented = body["refreshToken"].as_str().unwrap_or_default();
    if s.refresh_fails.load(Ordering::SeqCst) || presented.is_empty() {
        return rejected("refresh token invalid");
    }
    let token = s.issue();
    ok(json!({ "token": token.access, "refreshToken": token.refresh, "expiresIn": 3600 }))
}

async fn logout(State(s): State<Arc<BackendState>>) -> Response {
    s.counters.logout_calls.fetch_add(1, Ordering::SeqCst);
    ok(Value::Null)
}

async fn current_user(State(s): State<Arc<BackendState>>, headers: HeaderMap) -> Response {
    match authorize(&s, &headers, "/auth/user") {
        Ok(_) => ok(user_json("operator")),
        Err(resp) => resp,
    }
}

async fn change_password(
    State(s): State<Arc<BackendState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    if let Err(resp) = authorize(&s, &headers, "/auth/change-password") {
        return resp;
    }
    if body["oldPassword"].as_str() != Some(PASSWORD) {
        return envelope(
            StatusCode::OK,
            json!({ "success": false, "code": 400, "message": "old password incorrect" }),
        );
    }
    ok(Value::Null)
}

async fn captcha() -> Response {
    ok(json!({ "captchaId": CAPTCHA_ID, "captchaImage": "data:image/png;base64,iVBORw0KGgo=" }))
}

async fn upload(
    State(s): State<Arc<BackendState>>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Response {
    if let Err(resp) = authorize(&s, &headers, "/files/upload") {
        return resp;
    }
    let mut files = Vec::new();
    loop {
        match multipart.next_field().await {
            Ok(Some(field)) => {
                let name = field.name().map(str::to_owned);
                let file_name = field.file_name().map(str::to_owned);
                let content_type = field.content_type().map(str::to_owned);
                match field.bytes().await {
                    Ok(data) => files.push(json!({
                        "field": name,
                        "fileName": file_name,
                        "contentType": content_type,
                        "size": data.len(),
                    })),
                    Err(e) => return envelope(StatusCode::BAD_REQUEST, json!({ "message": e.to_string() })),
                }
            }
            Ok(None) => break,
            Err(e) => return envelope(StatusCode::BAD_REQUEST, json!({ "message": e.to_string() })),
        }
    }
    ok(json!({ "files": files }))
}

async fn download(
    State(s): State<Arc<BackendState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
) -> Response {
    if let Err(resp) = authorize(&s, &headers, "/files/download") {
        return resp;
    }
    if id == "missing" {
        return envelope(
            StatusCode::NOT_FOUND,
            json!({ "success": false, "code": 404, "message": "file not found" }),
        );
    }
    let disposition = format!("attachment; filename*=UTF-8''shift%20report%20%E2%84%96{id}.pdf");
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/pdf".to_owned()), (header::CONTENT_DISPOSITION, disposition)],
        REPORT_BYTES,
    )
        .into_response()
}

async fn echo(
    State(s): State<Arc<BackendState>>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    let bearer = match authorize(&s, &headers, "/echo") {
        Ok(t) => t,
        Err(resp) => return resp,
    };
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    ok(json!({
        "method": method.as_str(),
        "bearer": bearer,
        "query": query,
        "requestId": header_value(&headers, "x-request-id"),
        "requestTime": header_value(&headers, "x-request-time"),
        "custom": header_value(&headers, "x-custom"),
        "body": body,
    }))
}

async fn always_expired(State(s): State<Arc<BackendState>>, headers: HeaderMap) -> Response {
    s.counters.always_expired_hits.fetch_add(1, Ordering::SeqCst);
    if let Err(resp) = authorize(&s, &headers, "/always-expired") {
        return resp;
    }
    expired()
}

async fn status(Path(code): Path<u16>) -> Response {
    let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    envelope(status, json!({ "success": false, "code": code, "message": format!("status {code}") }))
}

async fn business_fail() -> Response {
    envelope(StatusCode::OK, json!({ "success": false, "code": 500, "message": "device offline" }))
}

async fn malformed() -> Response {
    (StatusCode::OK, "<html>gateway</html>").into_response()
}

async fn slow() -> Response {
    tokio::time::sleep(Duration::from_secs(3)).await;
    ok(Value::Null)
}

// -- Push channel ------------------------------------------------------------

#[derive(Debug, serde::Deserialize)]
struct PushQuery {
    token: Option<String>,
}

async fn ws_upgrade(
    State(s): State<Arc<BackendState>>,
    Query(query): Query<PushQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    s.counters.upgrade_attempts.fetch_add(1, Ordering::SeqCst);
    let refused = s
        .refuse_upgrades
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok();
    if refused {
        return (StatusCode::SERVICE_UNAVAILABLE, "push channel unavailable").into_response();
    }
    s.ws_tokens.lock().push(query.token);
    ws.on_upgrade(move |socket| handle_push(socket, s)).into_response()
}

async fn handle_push(socket: WebSocket, s: Arc<BackendState>) {
    s.counters.ws_opens.fetch_add(1, Ordering::SeqCst);
    s.counters.ws_active.fetch_add(1, Ordering::SeqCst);

    let mut commands = s.push.subscribe();
    let (mut ws_tx, mut ws_rx) = socket.split();

    loop {
        tokio::select! {
            cmd = commands.recv() => {
                match cmd {
                    Ok(PushCommand::Text(text)) => {
                        if ws_tx.send(Message::Text(text.into())).await.is_err() {
                            break;
                        }
                    }
                    Ok(PushCommand::Drop) => break,
                    Ok(PushCommand::Close(code)) => {
                        let frame = CloseFrame { code, reason: "server closing".into() };
                        let _ = ws_tx.send(Message::Close(Some(frame))).await;
                        break;
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let text = text.as_str().to_owned();
                        let is_heartbeat = serde_json::from_str::<Envelope>(&text)
                            .is_ok_and(|e| e.is_heartbeat());
                        s.received.lock().push(text);
                        if is_heartbeat && s.answer_heartbeats.load(Ordering::SeqCst) {
                            let ack = serde_json::to_string(&Envelope::heartbeat()).unwrap_or_default();
                            if ws_tx.send(Message::Text(ack.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    _ => {}
                }
            }
        }
    }

    s.counters.ws_active.fetch_sub(1, Ordering::SeqCst);
}
