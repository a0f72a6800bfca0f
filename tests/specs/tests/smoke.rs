// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! End-to-end smoke tests that run the real `dashlink` binary against the
//! in-process mock backend.

use std::time::Duration;

use serde_json::json;

use dashlink::test_support::{MockBackend, PASSWORD, REPORT_BYTES};
use dashlink_specs::Dashlink;

const TIMEOUT: Duration = Duration::from_secs(10);

async fn logged_in(backend: &MockBackend) -> anyhow::Result<Dashlink> {
    let dashlink = Dashlink::new(backend.base_url(), backend.ws_url())?;
    let out = dashlink
        .run(&["login", "--username", "operator", "--password", PASSWORD], TIMEOUT)
        .await?;
    anyhow::ensure!(out.code == Some(0), "login failed: {}", out.stderr);
    Ok(dashlink)
}

// -- Request commands ---------------------------------------------------------

#[tokio::test]
async fn login_call_status_logout() -> anyhow::Result<()> {
    let backend = MockBackend::spawn().await?;
    let dashlink = Dashlink::new(backend.base_url(), backend.ws_url())?;

    let out = dashlink
        .run(&["login", "--username", "operator", "--password", PASSWORD], TIMEOUT)
        .await?;
    assert_eq!(out.code, Some(0), "stderr: {}", out.stderr);
    let login = out.json()?;
    assert_eq!(login["loggedIn"], true);
    assert_eq!(login["user"]["username"], "operator");
    assert!(dashlink.state_dir().join("credentials.json").exists());

    let out = dashlink.run(&["call", "get", "/echo", "--query", "line=3"], TIMEOUT).await?;
    assert_eq!(out.code, Some(0), "stderr: {}", out.stderr);
    let echo = out.json()?;
    assert_eq!(echo["method"], "GET");
    assert_eq!(echo["query"]["line"], "3");
    assert!(echo["requestId"].is_string());

    let out = dashlink
        .run(&["call", "post", "/echo", "--body", r#"{"deviceId":"d-1"}"#], TIMEOUT)
        .await?;
    assert_eq!(out.json()?["body"], json!({ "deviceId": "d-1" }));

    // The profile from login is persisted with the token pair.
    let status = dashlink.run(&["status"], TIMEOUT).await?.json()?;
    assert_eq!(status["loggedIn"], true);
    assert_eq!(status["user"]["username"], "operator");

    let out = dashlink.run(&["logout"], TIMEOUT).await?;
    assert_eq!(out.code, Some(0));
    assert_eq!(backend.logout_calls(), 1);

    let status = dashlink.run(&["status"], TIMEOUT).await?.json()?;
    assert_eq!(status["loggedIn"], false);
    assert!(status["user"].is_null());
    Ok(())
}

#[tokio::test]
async fn call_renews_expired_token_across_invocations() -> anyhow::Result<()> {
    let backend = MockBackend::spawn().await?;
    let dashlink = logged_in(&backend).await?;

    backend.expire_all();
    let out = dashlink.run(&["call", "get", "/echo"], TIMEOUT).await?;
    assert_eq!(out.code, Some(0), "stderr: {}", out.stderr);
    assert_eq!(backend.refresh_calls(), 1);

    // The renewed pair was persisted; the next process uses it directly.
    let out = dashlink.run(&["call", "get", "/echo"], TIMEOUT).await?;
    assert_eq!(out.code, Some(0), "stderr: {}", out.stderr);
    assert_eq!(backend.refresh_calls(), 1);
    Ok(())
}

#[tokio::test]
async fn failures_report_error_code() -> anyhow::Result<()> {
    let backend = MockBackend::spawn().await?;
    let dashlink = Dashlink::new(backend.base_url(), backend.ws_url())?;

    let out = dashlink.run(&["call", "get", "/echo"], TIMEOUT).await?;
    assert_eq!(out.code, Some(1));
    assert!(out.stderr.contains("AUTHENTICATION_FAILED"), "stderr: {}", out.stderr);

    let out = dashlink.run(&["call", "get", "/status/503"], TIMEOUT).await?;
    assert_eq!(out.code, Some(1));
    assert!(out.stderr.contains("SERVICE_UNAVAILABLE"), "stderr: {}", out.stderr);
    Ok(())
}

#[tokio::test]
async fn invalid_base_url_is_a_usage_error() -> anyhow::Result<()> {
    let dashlink = Dashlink::new("ftp://nowhere", "ws://nowhere/ws")?;
    let out = dashlink.run(&["status"], TIMEOUT).await?;
    assert_eq!(out.code, Some(2));
    assert!(out.stderr.contains("--base-url"), "stderr: {}", out.stderr);
    Ok(())
}

#[tokio::test]
async fn download_writes_the_raw_file() -> anyhow::Result<()> {
    let backend = MockBackend::spawn().await?;
    let dashlink = logged_in(&backend).await?;
    let output = dashlink.state_dir().join("report.pdf");
    let output_arg = output.display().to_string();

    backend.expire_all();
    let out = dashlink
        .run(&["download", "/files/9/download", "--output", output_arg.as_str()], TIMEOUT)
        .await?;
    assert_eq!(out.code, Some(0), "stderr: {}", out.stderr);
    assert_eq!(backend.refresh_calls(), 1);
    assert_eq!(std::fs::read(&output)?, REPORT_BYTES);

    let saved = out.json()?;
    assert_eq!(saved["contentType"], "application/pdf");
    assert_eq!(saved["size"], REPORT_BYTES.len());
    Ok(())
}

// -- Push channel -------------------------------------------------------------

#[tokio::test]
async fn watch_prints_subscribed_events() -> anyhow::Result<()> {
    let backend = MockBackend::spawn().await?;
    let dashlink = logged_in(&backend).await?;

    let mut watch = dashlink.spawn(&["watch", "--kind", "alert"])?;
    backend.wait_for_ws(1).await?;

    backend.push_event("device", json!({ "deviceId": "d-1", "status": "online" }));
    backend.push_event(
        "alert",
        json!({ "alertId": "a-9", "deviceId": "d-1", "alertLevel": "CRITICAL" }),
    );

    let line = watch.next_line(TIMEOUT).await?.ok_or_else(|| anyhow::anyhow!("stdout closed"))?;
    let event: serde_json::Value = serde_json::from_str(&line)?;
    assert_eq!(event["type"], "alert");
    assert_eq!(event["data"]["alertId"], "a-9");
    assert_eq!(event["data"]["alertLevel"], "CRITICAL");

    // A normal close from the backend ends the watch cleanly.
    backend.close_connections(1000);
    assert_eq!(watch.wait_exit(TIMEOUT).await?, Some(0));
    Ok(())
}

#[tokio::test]
async fn watch_fails_when_reconnects_are_exhausted() -> anyhow::Result<()> {
    let backend = MockBackend::spawn().await?;
    let dashlink = logged_in(&backend).await?;

    let mut watch = dashlink.spawn(&["watch"])?;
    backend.wait_for_ws(1).await?;

    backend.refuse_upgrades(u32::MAX);
    backend.drop_connections();
    assert_eq!(watch.wait_exit(TIMEOUT).await?, Some(1));

    // Giving up on the channel ends the persisted session too.
    let status = dashlink.run(&["status"], TIMEOUT).await?.json()?;
    assert_eq!(status["loggedIn"], false);
    Ok(())
}
