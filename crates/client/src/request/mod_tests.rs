// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::Deserialize;
use serde_json::json;

use super::{attachment_name, raw_success, ApiRequest, FilePart, Received};
use crate::credential::logout::LogoutReason;
use crate::credential::Token;
use crate::error::{AuthError, TransportError};
use crate::request::classify::Classified;
use crate::test_support::{
    fast_config, ClientStack, MockBackend, ScriptedRenewer, REPORT_BYTES, REVOKED_TOKEN,
};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Echo {
    method: String,
    bearer: String,
    query: std::collections::HashMap<String, String>,
    request_id: Option<String>,
    request_time: Option<String>,
    custom: Option<String>,
    body: serde_json::Value,
}

async fn logged_in() -> anyhow::Result<(MockBackend, ClientStack)> {
    let backend = MockBackend::spawn().await?;
    let stack = ClientStack::new(&backend.config(), Some(backend.issue_token()));
    Ok((backend, stack))
}

#[tokio::test]
async fn attaches_credentials_and_trace_headers() -> anyhow::Result<()> {
    let (_backend, stack) = logged_in().await?;
    let echo: Echo = stack
        .client
        .call_json(ApiRequest::get("/echo").query("deviceId", "DEV 1").header("X-Custom", "yes"))
        .await?;

    assert_eq!(echo.method, "GET");
    assert_eq!(Some(echo.bearer), stack.store.access_token());
    assert_eq!(echo.query.get("deviceId").map(String::as_str), Some("DEV 1"));
    assert!(echo.query.get("_t").is_some_and(|t| t.parse::<u64>().is_ok()));
    assert!(echo.request_id.is_some());
    assert!(echo.request_time.is_some_and(|t| t.parse::<u64>().is_ok()));
    assert_eq!(echo.custom.as_deref(), Some("yes"));
    Ok(())
}

#[tokio::test]
async fn non_get_requests_send_json_body_without_cache_buster() -> anyhow::Result<()> {
    let (_backend, stack) = logged_in().await?;
    let body = json!({ "deviceId": "DEV-001", "ack": true });
    let data = stack.client.post("/echo", body.clone()).await?;
    let echo: Echo = serde_json::from_value(data)?;

    assert_eq!(echo.method, "POST");
    assert_eq!(echo.body, body);
    assert!(!echo.query.contains_key("_t"));
    Ok(())
}

#[tokio::test]
async fn request_ids_are_unique_per_call() -> anyhow::Result<()> {
    let (backend, stack) = logged_in().await?;
    for _ in 0..3 {
        stack.client.get("/echo").await?;
    }
    let ids: std::collections::HashSet<_> =
        backend.seen_requests().into_iter().filter_map(|r| r.request_id).collect();
    assert_eq!(ids.len(), 3);
    Ok(())
}

#[tokio::test]
async fn expired_call_is_renewed_and_replayed_once() -> anyhow::Result<()> {
    let (backend, stack) = logged_in().await?;
    let stale = stack.store.access_token();
    backend.expire_all();

    let echo: Echo = stack.client.call_json(ApiRequest::get("/echo")).await?;

    assert_eq!(backend.refresh_calls(), 1);
    assert_ne!(Some(echo.bearer.clone()), stale);
    assert_eq!(Some(echo.bearer), stack.store.access_token());

    // The replay reuses the original request id.
    let seen = backend.seen_requests();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].request_id, seen[1].request_id);
    assert_eq!(seen[0].bearer, stale);
    assert!(stack.logouts().is_empty());
    Ok(())
}

#[tokio::test]
async fn concurrent_expired_calls_share_one_renewal() -> anyhow::Result<()> {
    let (backend, stack) = logged_in().await?;
    backend.expire_all();
    backend.set_refresh_delay(Duration::from_millis(100));
    let stack = Arc::new(stack);

    let mut tasks = Vec::new();
    for n in 0..2 {
        let stack = Arc::clone(&stack);
        tasks.push(tokio::spawn(async move {
            stack.client.post("/echo", json!({ "n": n })).await
        }));
    }
    for task in tasks {
        let data = task.await??;
        assert_eq!(data["bearer"].as_str().map(str::to_owned), stack.store.access_token());
    }

    assert_eq!(backend.refresh_calls(), 1);
    assert_eq!(stack.renewal.renewals_started(), 1);
    assert!(stack.logouts().is_empty());
    Ok(())
}

#[tokio::test]
async fn many_concurrent_expired_calls_share_one_renewal() -> anyhow::Result<()> {
    let backend = MockBackend::spawn().await?;
    let renewer = ScriptedRenewer::succeeding(Duration::from_millis(200));
    let stack = Arc::new(ClientStack::with_renewer(
        &backend.config(),
        Some(Token::new("stale", "refresh-0")),
        renewer.clone(),
    ));

    // The scripted renewer's tokens are unknown to the backend, so every
    // replay is rejected again: each call fails after exactly one replay.
    let mut tasks = Vec::new();
    for _ in 0..10 {
        let stack = Arc::clone(&stack);
        tasks.push(tokio::spawn(async move { stack.client.get("/echo").await }));
    }
    for task in tasks {
        assert!(matches!(task.await?, Err(TransportError::AuthenticationFailed(_))));
    }

    assert_eq!(renewer.calls(), 1);
    assert_eq!(backend.seen_requests().len(), 20);
    assert_eq!(stack.logouts(), vec![LogoutReason::Rejected]);
    Ok(())
}

#[tokio::test]
async fn second_expiry_is_not_retried_again() -> anyhow::Result<()> {
    let (backend, stack) = logged_in().await?;

    let result = stack.client.get("/always-expired").await;
    assert!(matches!(result, Err(TransportError::AuthenticationFailed(_))), "got {result:?}");

    assert_eq!(backend.always_expired_hits(), 2);
    assert_eq!(backend.refresh_calls(), 1);
    assert_eq!(stack.logouts(), vec![LogoutReason::Rejected]);
    assert!(!stack.store.is_logged_in());
    Ok(())
}

#[tokio::test]
async fn failed_renewal_logs_out_without_retry() -> anyhow::Result<()> {
    let (backend, stack) = logged_in().await?;
    backend.expire_all();
    backend.fail_refresh(true);

    let result = stack.client.get("/echo").await;
    assert!(matches!(result, Err(TransportError::AuthenticationFailed(_))), "got {result:?}");

    assert_eq!(backend.seen_requests().len(), 1);
    assert_eq!(backend.refresh_calls(), 1);
    assert_eq!(stack.logouts(), vec![LogoutReason::RenewalFailed]);
    assert!(!stack.store.is_logged_in());
    Ok(())
}

#[tokio::test]
async fn concurrent_failed_renewal_logs_out_once() -> anyhow::Result<()> {
    let backend = MockBackend::spawn().await?;
    let renewer = ScriptedRenewer::failing(
        Duration::from_millis(50),
        AuthError::Rejected("refresh token invalid".into()),
    );
    let stack = Arc::new(ClientStack::with_renewer(
        &backend.config(),
        Some(Token::new("stale", "refresh-0")),
        renewer.clone(),
    ));

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let stack = Arc::clone(&stack);
        tasks.push(tokio::spawn(async move { stack.client.get("/echo").await }));
    }
    for task in tasks {
        assert!(matches!(task.await?, Err(TransportError::AuthenticationFailed(_))));
    }

    assert_eq!(renewer.calls(), 1);
    assert_eq!(stack.logouts(), vec![LogoutReason::RenewalFailed]);
    Ok(())
}

#[tokio::test]
async fn missing_refresh_token_fails_without_renewal_call() -> anyhow::Result<()> {
    let backend = MockBackend::spawn().await?;
    let stack = ClientStack::new(&backend.config(), None);

    let result = stack.client.get("/echo").await;
    // No credential at all: the backend rejects outright, no expiry signal.
    assert!(matches!(result, Err(TransportError::AuthenticationFailed(_))));
    assert_eq!(backend.refresh_calls(), 0);

    let stack = ClientStack::new(&backend.config(), Some(Token::new("stale", "")));
    let result = stack.client.get("/echo").await;
    assert!(matches!(result, Err(TransportError::AuthenticationFailed(_))));
    assert_eq!(backend.refresh_calls(), 0);
    assert_eq!(stack.logouts(), vec![LogoutReason::RenewalFailed]);
    Ok(())
}

#[tokio::test]
async fn rejected_credential_logs_out_without_renewal() -> anyhow::Result<()> {
    let backend = MockBackend::spawn().await?;
    let stack = ClientStack::new(&backend.config(), Some(Token::new(REVOKED_TOKEN, "refresh-0")));

    let result = stack.client.get("/echo").await;
    assert_eq!(result, Err(TransportError::AuthenticationFailed("invalid signature".into())));
    assert_eq!(backend.refresh_calls(), 0);
    assert_eq!(stack.logouts(), vec![LogoutReason::Rejected]);
    Ok(())
}

#[yare::parameterized(
    forbidden   = { 403, "FORBIDDEN" },
    not_found   = { 404, "NOT_FOUND" },
    server      = { 500, "SERVER_ERROR" },
    bad_gateway = { 502, "SERVICE_UNAVAILABLE" },
    unavailable = { 503, "SERVICE_UNAVAILABLE" },
    teapot      = { 418, "UNCLASSIFIED" },
)]
#[test_macro(tokio::test)]
async fn error_statuses_surface_without_retry(status: u16, code: &str) {
    let Ok((backend, stack)) = logged_in().await else {
        unreachable!("backend failed to start");
    };
    let result = stack.client.get(&format!("/status/{status}")).await;
    match result {
        Err(e) => {
            assert_eq!(e.as_str(), code);
            assert!(e.to_string().contains(&format!("status {status}")), "{e}");
        }
        Ok(v) => unreachable!("expected failure, got {v}"),
    }
    assert_eq!(backend.refresh_calls(), 0);
    assert!(stack.logouts().is_empty());
}

#[tokio::test]
async fn business_failure_on_200() -> anyhow::Result<()> {
    let (_backend, stack) = logged_in().await?;
    let result = stack.client.get("/business-fail").await;
    assert_eq!(result, Err(TransportError::BusinessError("device offline".into())));

    let result = stack.client.get("/malformed").await;
    assert!(matches!(result, Err(TransportError::InvalidResponse(_))));
    Ok(())
}

#[tokio::test]
async fn typed_decode_mismatch_is_invalid_response() -> anyhow::Result<()> {
    let (_backend, stack) = logged_in().await?;
    let result = stack.client.call_json::<Vec<u32>>(ApiRequest::get("/echo")).await;
    assert!(matches!(result, Err(TransportError::InvalidResponse(_))));
    Ok(())
}

#[tokio::test]
async fn slow_response_times_out() -> anyhow::Result<()> {
    let (_backend, stack) = logged_in().await?;
    let result =
        stack.client.call(ApiRequest::get("/slow").timeout(Duration::from_millis(100))).await;
    assert_eq!(result, Err(TransportError::Timeout));
    Ok(())
}

#[tokio::test]
async fn unreachable_backend_is_network_unavailable() -> anyhow::Result<()> {
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        listener.local_addr()?
    };
    let stack = ClientStack::new(&fast_config(format!("http://{addr}/api")), None);
    let result = stack.client.get("/echo").await;
    assert!(matches!(result, Err(TransportError::NetworkUnavailable(_))), "got {result:?}");
    Ok(())
}

#[tokio::test]
async fn anonymous_requests_carry_no_credential() -> anyhow::Result<()> {
    let (backend, stack) = logged_in().await?;
    let result = stack.client.call(ApiRequest::get("/echo").anonymous()).await;

    assert!(matches!(result, Err(TransportError::AuthenticationFailed(_))));
    assert_eq!(backend.seen_requests()[0].bearer, None);
    // Anonymous failures never end the session.
    assert!(stack.logouts().is_empty());
    assert!(stack.store.is_logged_in());
    Ok(())
}

#[tokio::test]
async fn absolute_urls_bypass_base() -> anyhow::Result<()> {
    let (backend, stack) = logged_in().await?;
    let data = stack.client.get(&format!("{}/echo", backend.base_url())).await?;
    assert_eq!(data["method"], "GET");
    Ok(())
}

// -- Files -------------------------------------------------------------------

#[tokio::test]
async fn download_returns_the_raw_body() -> anyhow::Result<()> {
    let (_backend, stack) = logged_in().await?;
    let file = stack.client.download(ApiRequest::get("/files/7/download")).await?;

    assert_eq!(file.bytes.as_ref(), REPORT_BYTES);
    assert_eq!(file.content_type.as_deref(), Some("application/pdf"));
    assert_eq!(file.file_name.as_deref(), Some("shift report \u{2116}7.pdf"));
    Ok(())
}

#[tokio::test]
async fn expired_download_is_renewed_and_replayed() -> anyhow::Result<()> {
    let (backend, stack) = logged_in().await?;
    backend.expire_all();

    let file = stack.client.download(ApiRequest::get("/files/7/download")).await?;
    assert_eq!(file.bytes.as_ref(), REPORT_BYTES);
    assert_eq!(backend.refresh_calls(), 1);
    assert_eq!(backend.seen_requests().len(), 2);
    assert!(stack.logouts().is_empty());
    Ok(())
}

#[tokio::test]
async fn failed_download_is_classified() -> anyhow::Result<()> {
    let (_backend, stack) = logged_in().await?;
    let result = stack.client.download(ApiRequest::get("/files/missing/download")).await;
    assert_eq!(result, Err(TransportError::NotFound(Some("file not found".into()))));
    Ok(())
}

#[tokio::test]
async fn upload_sends_multipart_file() -> anyhow::Result<()> {
    let (_backend, stack) = logged_in().await?;
    let part = FilePart::new("alarm-log.csv", &b"time,device\n08:00,DEV-001\n"[..])
        .content_type("text/csv");
    let data = stack.client.upload("/files/upload", part).await?;

    let file = &data["files"][0];
    assert_eq!(file["field"], "file");
    assert_eq!(file["fileName"], "alarm-log.csv");
    assert_eq!(file["contentType"], "text/csv");
    assert_eq!(file["size"], 26);
    Ok(())
}

#[tokio::test]
async fn expired_upload_is_renewed_and_replayed() -> anyhow::Result<()> {
    let (backend, stack) = logged_in().await?;
    backend.expire_all();

    let request = ApiRequest::upload("/files/upload", FilePart::new("a.bin", vec![0_u8; 4096]))
        .file(FilePart::new("b.bin", vec![1_u8; 10]).field("attachment"));
    let data = stack.client.call(request).await?;

    assert_eq!(backend.refresh_calls(), 1);
    let seen = backend.seen_requests();
    assert_eq!(seen.len(), 2);
    assert_eq!(seen[0].request_id, seen[1].request_id);
    // The replay carries the whole form again.
    assert_eq!(data["files"][0]["size"], 4096);
    assert_eq!(data["files"][1]["field"], "attachment");
    assert_eq!(data["files"][1]["size"], 10);
    Ok(())
}

#[tokio::test]
async fn invalid_part_content_type_is_invalid_request() -> anyhow::Result<()> {
    let (backend, stack) = logged_in().await?;
    let part = FilePart::new("a.txt", &b"x"[..]).content_type("not a mime");
    let result = stack.client.upload("/files/upload", part).await;

    assert!(matches!(result, Err(TransportError::InvalidRequest(_))), "got {result:?}");
    assert!(backend.seen_requests().is_empty());
    Ok(())
}

#[yare::parameterized(
    extended      = { "attachment; filename*=UTF-8''%E6%8A%A5%E5%91%8A.pdf", Some("\u{62a5}\u{544a}.pdf") },
    extended_wins = { "attachment; filename=\"fallback.pdf\"; filename*=UTF-8''real.pdf", Some("real.pdf") },
    quoted        = { "attachment; filename=\"daily log.txt\"", Some("daily log.txt") },
    percent       = { "attachment;filename=%E6%97%A5%E5%BF%97.csv", Some("\u{65e5}\u{5fd7}.csv") },
    bare          = { "attachment", None },
    empty         = { "attachment; filename=\"\"", None },
)]
fn attachment_names(disposition: &str, expected: Option<&str>) {
    assert_eq!(attachment_name(disposition).as_deref(), expected);
}

#[yare::parameterized(
    file          = { "application/pdf", &b"%PDF-1.4"[..], None },
    json_file     = { "application/json", &br#"{"rows":[1,2]}"#[..], None },
    json_envelope = { "application/json", &br#"{"success":true,"data":{"a":1}}"#[..], None },
    refused       = {
        "application/json",
        &br#"{"success":false,"code":500,"message":"export busy"}"#[..],
        Some("export busy")
    },
)]
fn raw_body_is_kept_unless_the_backend_refused(
    content_type: &str,
    body: &[u8],
    failure: Option<&str>,
) {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(content_type) {
        headers.insert(CONTENT_TYPE, value);
    }
    let received = Received { status: 200, headers, body: Bytes::copy_from_slice(body) };
    let expected = match failure {
        Some(message) => Classified::Failure(TransportError::BusinessError(message.to_owned())),
        None => Classified::Success(serde_json::Value::Null),
    };
    assert_eq!(raw_success(&received, 40101), expected);
}
