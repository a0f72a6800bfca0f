// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Driver task: owns the socket, heartbeat and reconnect policy.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use super::{ChannelState, Shared};
use crate::credential::logout::LogoutReason;
use crate::dispatch::events::{decode_frame, Envelope, Inbound};
use crate::error::ChannelError;

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const OUTBOUND_CAPACITY: usize = 64;
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Why a connected session ended.
#[derive(Debug)]
enum SessionEnd {
    /// `disconnect()` was called.
    Cancelled,
    /// Peer closed with a normal close code.
    Clean,
    /// Anything else: error, EOF, abnormal close code, heartbeat timeout.
    Lost(String),
}

/// Open the channel, report the result to `connect()`, then drive it until
/// it is closed, cleanly disconnected, or reconnects are exhausted.
pub(super) async fn run(shared: Arc<Shared>, ready: oneshot::Sender<Result<(), ChannelError>>) {
    let mut socket = match open_cancellable(&shared).await {
        Ok(socket) => socket,
        Err(e) => {
            tracing::warn!(err = %e, "push channel open failed");
            shared.set_state(ChannelState::Disconnected);
            let _ = ready.send(Err(e));
            return;
        }
    };

    let (tx, mut outbound) = mpsc::channel(OUTBOUND_CAPACITY);
    *shared.outbound.lock() = Some(tx);
    if !shared.set_state(ChannelState::Connected) {
        let _ = ready.send(Err(ChannelError::Closed));
        return;
    }
    tracing::info!("push channel connected");
    let _ = ready.send(Ok(()));

    loop {
        let end = session(&shared, &mut socket, &mut outbound).await;
        discard(&mut outbound);

        match end {
            SessionEnd::Cancelled => {
                let frame = CloseFrame { code: CloseCode::Normal, reason: "client disconnect".into() };
                let _ = tokio::time::timeout(CLOSE_GRACE, socket.close(Some(frame))).await;
                return;
            }
            SessionEnd::Clean => {
                tracing::info!("push channel closed by peer");
                shared.outbound.lock().take();
                shared.set_state(ChannelState::Disconnected);
                return;
            }
            SessionEnd::Lost(reason) => {
                tracing::warn!(reason = %reason, "push channel lost");
                let Some(next) = reconnect(&shared).await else {
                    return;
                };
                socket = next;
                discard(&mut outbound);
                if !shared.set_state(ChannelState::Connected) {
                    return;
                }
            }
        }
    }
}

/// Pump one connected session until it ends.
async fn session(
    shared: &Shared,
    socket: &mut Socket,
    outbound: &mut mpsc::Receiver<String>,
) -> SessionEnd {
    let period = shared.settings.heartbeat;
    let mut heartbeat = tokio::time::interval_at(Instant::now() + period, period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut awaiting_ack = false;

    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => return SessionEnd::Cancelled,

            _ = heartbeat.tick() => {
                if awaiting_ack {
                    return SessionEnd::Lost("heartbeat unanswered".to_owned());
                }
                let text = serde_json::to_string(&Envelope::heartbeat()).unwrap_or_default();
                if let Err(e) = socket.send(Message::Text(text.into())).await {
                    return SessionEnd::Lost(format!("heartbeat send: {e}"));
                }
                awaiting_ack = true;
            }

            Some(text) = outbound.recv() => {
                if let Err(e) = socket.send(Message::Text(text.into())).await {
                    return SessionEnd::Lost(format!("send: {e}"));
                }
            }

            msg = socket.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        awaiting_ack = false;
                        ingest(shared, text.as_str());
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        awaiting_ack = false;
                        match std::str::from_utf8(&bytes) {
                            Ok(text) => ingest(shared, text),
                            Err(_) => tracing::warn!(len = bytes.len(), "dropping non-utf8 binary frame"),
                        }
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_))) => awaiting_ack = false,
                    Some(Ok(Message::Close(frame))) => {
                        return match frame {
                            Some(ref f) if f.code == CloseCode::Normal => SessionEnd::Clean,
                            Some(f) => SessionEnd::Lost(format!("closed with code {}", u16::from(f.code))),
                            None => SessionEnd::Lost("closed without status".to_owned()),
                        };
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => return SessionEnd::Lost(e.to_string()),
                    None => return SessionEnd::Lost("stream ended".to_owned()),
                }
            }
        }
    }
}

/// Decode and dispatch one inbound frame. Malformed frames are dropped.
fn ingest(shared: &Shared, text: &str) {
    match decode_frame(text) {
        Ok(Inbound::Event(event)) => {
            shared.dispatcher.dispatch(&event);
        }
        Ok(Inbound::Heartbeat) => {}
        Ok(Inbound::Unknown(kind)) => {
            tracing::debug!(kind = %kind, "dropping event of unknown kind");
        }
        Err(e) => {
            tracing::warn!(err = %e, "dropping malformed frame");
        }
    }
}

/// Fixed-delay bounded reconnect. Returns `None` when closed or exhausted.
async fn reconnect(shared: &Shared) -> Option<Socket> {
    let max = shared.settings.reconnect_attempts;
    for attempt in 1..=max {
        if !shared.set_state(ChannelState::Reconnecting) {
            return None;
        }
        tokio::select! {
            _ = shared.cancel.cancelled() => return None,
            _ = tokio::time::sleep(shared.settings.reconnect_delay) => {}
        }
        if !shared.set_state(ChannelState::Connecting) {
            return None;
        }

        match open_cancellable(shared).await {
            Ok(socket) => {
                tracing::info!(attempt, "push channel reconnected");
                return Some(socket);
            }
            Err(ChannelError::Closed) => return None,
            Err(e) => {
                tracing::warn!(attempt, max, err = %e, "reconnect attempt failed");
            }
        }
    }

    if shared.set_state(ChannelState::Closed) {
        shared.cancel.cancel();
        shared.outbound.lock().take();
        let err = ChannelError::ReconnectExhausted { attempts: max };
        tracing::error!(err = %err, "push channel giving up");
        shared.report(&err);
        shared.logout.fire(LogoutReason::ReconnectExhausted);
    }
    None
}

async fn open_cancellable(shared: &Shared) -> Result<Socket, ChannelError> {
    tokio::select! {
        _ = shared.cancel.cancelled() => Err(ChannelError::Closed),
        result = open(shared) => result,
    }
}

/// One open attempt with the current access token and the open timeout.
async fn open(shared: &Shared) -> Result<Socket, ChannelError> {
    let url = authenticated_url(shared)?;
    let timeout = shared.settings.connect_timeout;
    match tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url.as_str())).await {
        Ok(Ok((socket, _))) => Ok(socket),
        Ok(Err(e)) => Err(ChannelError::ConnectFailed(e.to_string())),
        Err(_) => Err(ChannelError::ConnectFailed(format!("open timed out after {timeout:?}"))),
    }
}

/// Push URL with the current access token as the `token` query parameter.
fn authenticated_url(shared: &Shared) -> Result<String, ChannelError> {
    let mut url = reqwest::Url::parse(&shared.settings.url)
        .map_err(|e| ChannelError::ConnectFailed(format!("invalid push url: {e}")))?;
    if let Some(token) = shared.store.access_token() {
        url.query_pairs_mut().append_pair("token", &token);
    }
    Ok(url.into())
}

/// Drop anything queued for a connection that no longer exists.
fn discard(outbound: &mut mpsc::Receiver<String>) {
    let mut dropped = 0usize;
    while outbound.try_recv().is_ok() {
        dropped += 1;
    }
    if dropped > 0 {
        tracing::debug!(dropped, "discarded outbound messages across reconnect");
    }
}
