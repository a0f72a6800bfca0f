// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Command-line front end.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use tracing_subscriber::EnvFilter;

use crate::channel::ChannelState;
use crate::config::ClientConfig;
use crate::credential::CredentialStore;
use crate::dispatch::EventKind;
use crate::error::TransportError;
use crate::request::{ApiRequest, FilePart};
use crate::Transport;

/// Exit code for a failed call or a channel that gave up.
pub const EXIT_FAILURE: i32 = 1;
/// Exit code for invalid configuration.
pub const EXIT_USAGE: i32 = 2;

#[derive(Debug, Parser)]
#[command(name = "dashlink", version, about = "Resilient client for the operations dashboard API")]
pub struct Cli {
    #[command(flatten)]
    pub config: ClientConfig,

    /// Log format.
    #[arg(long, default_value = "text", value_parser = ["text", "json"], env = "DASHLINK_LOG_FORMAT")]
    pub log_format: String,

    /// Log level filter (tracing `EnvFilter` syntax).
    #[arg(long, default_value = "info", env = "DASHLINK_LOG_LEVEL")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Perform one API call and print its `data` as JSON.
    Call {
        /// HTTP method (GET, POST, PUT, PATCH, DELETE).
        method: String,
        /// Path relative to the base URL, or an absolute URL.
        path: String,
        /// JSON request body.
        #[arg(long)]
        body: Option<String>,
        /// Query parameter as `key=value`. Repeatable.
        #[arg(long = "query", value_name = "KEY=VALUE")]
        query: Vec<String>,
    },
    /// Upload a file as `multipart/form-data` and print the response `data`.
    Upload {
        /// Path relative to the base URL, e.g. `/files/upload`.
        path: String,
        /// Local file to send.
        file: PathBuf,
        /// Form field name.
        #[arg(long, default_value = "file")]
        field: String,
        /// MIME type of the file part.
        #[arg(long)]
        content_type: Option<String>,
    },
    /// Save a file endpoint's raw response body.
    Download {
        /// Path relative to the base URL, e.g. `/files/42/download`.
        path: String,
        /// Where to write the body.
        #[arg(long, short)]
        output: PathBuf,
    },
    /// Stream realtime events as JSON lines until interrupted.
    Watch {
        /// Only print these kinds. Repeatable; all kinds when omitted.
        #[arg(long = "kind", value_parser = parse_kind)]
        kinds: Vec<EventKind>,
    },
    /// Log in and persist the token pair.
    Login {
        #[arg(long, env = "DASHLINK_USERNAME")]
        username: String,
        #[arg(long, env = "DASHLINK_PASSWORD", hide_env_values = true)]
        password: String,
    },
    /// End the session and remove persisted credentials.
    Logout,
    /// Print the local session state.
    Status,
}

fn parse_kind(s: &str) -> Result<EventKind, String> {
    EventKind::parse(s).ok_or_else(|| format!("unknown event kind {s:?} (device, message, alert, system)"))
}

pub fn init_tracing(cli: &Cli) {
    use tracing_subscriber::fmt;

    let filter = EnvFilter::try_new(&cli.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let result = match cli.log_format.as_str() {
        "json" => fmt::fmt().with_env_filter(filter).with_writer(std::io::stderr).json().try_init(),
        _ => fmt::fmt().with_env_filter(filter).with_writer(std::io::stderr).try_init(),
    };
    drop(result);
}

/// Run a parsed command line. Returns the process exit code.
pub async fn run(cli: Cli) -> anyhow::Result<i32> {
    if let Err(e) = cli.config.validate() {
        eprintln!("error: {e}");
        return Ok(EXIT_USAGE);
    }
    init_tracing(&cli);

    let store = CredentialStore::persistent(cli.config.credentials_path());
    let transport = Transport::new(&cli.config, store, |reason| {
        tracing::warn!(reason = %reason, "session ended, log in again");
    });

    match cli.command {
        Command::Call { method, path, body, query } => call(&transport, &method, path, body, &query).await,
        Command::Upload { path, file, field, content_type } => {
            let data = tokio::fs::read(&file)
                .await
                .map_err(|e| anyhow::anyhow!("cannot read {}: {e}", file.display()))?;
            let file_name = file
                .file_name()
                .map_or_else(|| "upload".to_owned(), |n| n.to_string_lossy().into_owned());
            let mut part = FilePart::new(file_name, data).field(field);
            if let Some(mime) = content_type {
                part = part.content_type(mime);
            }
            report(transport.requests.upload(&path, part).await)
        }
        Command::Download { path, output } => download(&transport, path, &output).await,
        Command::Watch { kinds } => watch(&transport, &kinds).await,
        Command::Login { username, password } => {
            let user = transport.auth.login(&username, &password).await;
            report(user.map(|u| json!({ "loggedIn": true, "user": u })))
        }
        Command::Logout => {
            transport.auth.logout().await;
            print_json(&json!({ "loggedIn": false }))?;
            Ok(0)
        }
        Command::Status => {
            let token = transport.store.current();
            print_json(&json!({
                "loggedIn": token.is_some(),
                "user": transport.store.user(),
                "expiresAt": token.as_ref().and_then(|t| t.expires_at),
                "expired": token.as_ref().is_some_and(|t| t.is_expired()),
                "baseUrl": cli.config.base_url,
                "pushUrl": cli.config.push_url(),
                "credentials": cli.config.credentials_path(),
            }))?;
            Ok(0)
        }
    }
}

async fn call(
    transport: &Transport,
    method: &str,
    path: String,
    body: Option<String>,
    query: &[String],
) -> anyhow::Result<i32> {
    let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
        .map_err(|_| anyhow::anyhow!("invalid method: {method}"))?;
    let mut request = ApiRequest::new(method, path);
    if let Some(body) = body {
        let body: Value = serde_json::from_str(&body)
            .map_err(|e| anyhow::anyhow!("--body is not valid JSON: {e}"))?;
        request = request.body(body);
    }
    for pair in query {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| anyhow::anyhow!("--query expects KEY=VALUE, got {pair:?}"))?;
        request = request.query(key, value);
    }
    report(transport.requests.call(request).await)
}

async fn download(transport: &Transport, path: String, output: &Path) -> anyhow::Result<i32> {
    let file = match transport.requests.download(ApiRequest::get(path)).await {
        Ok(file) => file,
        Err(e) => return report(Err(e)),
    };
    tokio::fs::write(output, &file.bytes)
        .await
        .map_err(|e| anyhow::anyhow!("cannot write {}: {e}", output.display()))?;
    print_json(&json!({
        "output": output,
        "size": file.bytes.len(),
        "contentType": file.content_type,
        "fileName": file.file_name,
    }))?;
    Ok(0)
}

async fn watch(transport: &Transport, kinds: &[EventKind]) -> anyhow::Result<i32> {
    let kinds: Vec<EventKind> = if kinds.is_empty() { EventKind::ALL.to_vec() } else { kinds.to_vec() };
    for kind in kinds {
        transport.dispatcher.subscribe(kind, |event| {
            println!("{}", serde_json::to_string(&event.to_envelope())?);
            Ok(())
        });
    }

    let failure = Arc::new(parking_lot::Mutex::new(None));
    let sink = Arc::clone(&failure);
    transport.channel.on_error(move |e| *sink.lock() = Some(e.clone()));

    if let Err(e) = transport.channel.connect().await {
        eprintln!("error: {}: {e}", e.as_str());
        return Ok(EXIT_FAILURE);
    }

    let mut state = transport.channel.watch_state();
    let code = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break 0,
            changed = state.changed() => {
                if changed.is_err() {
                    break EXIT_FAILURE;
                }
                let current = *state.borrow_and_update();
                match current {
                    ChannelState::Disconnected => break 0,
                    ChannelState::Closed => break EXIT_FAILURE,
                    _ => {}
                }
            }
        }
    };
    transport.channel.disconnect();

    if let Some(e) = failure.lock().take() {
        eprintln!("error: {}: {e}", e.as_str());
    }
    Ok(code)
}

fn report(result: Result<Value, TransportError>) -> anyhow::Result<i32> {
    match result {
        Ok(data) => {
            print_json(&data)?;
            Ok(0)
        }
        Err(e) => {
            eprintln!("error: {}: {e}", e.as_str());
            Ok(EXIT_FAILURE)
        }
    }
}

fn print_json(value: &Value) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
#[path = "cli_tests.rs"]
mod tests;
