// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Test harness for end-to-end binary smoke tests.
//!
//! Runs the real `dashlink` binary as a subprocess against an in-process
//! mock backend, with credentials isolated in a temporary state directory.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tokio::process::{Child, ChildStdout, Command};

/// Resolve the path to the compiled `dashlink` binary.
pub fn dashlink_binary() -> PathBuf {
    let manifest = Path::new(env!("CARGO_MANIFEST_DIR"));
    // tests/specs → tests → workspace root
    let workspace = manifest.parent().and_then(|p| p.parent()).unwrap_or(manifest);
    workspace.join("target").join("debug").join("dashlink")
}

/// Captured result of one finished invocation.
#[derive(Debug)]
pub struct Output {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl Output {
    /// Parse stdout as a single JSON document.
    pub fn json(&self) -> anyhow::Result<serde_json::Value> {
        Ok(serde_json::from_str(&self.stdout)?)
    }
}

/// Invocation settings shared by every command of one test.
pub struct Dashlink {
    base_url: String,
    ws_url: String,
    state_dir: tempfile::TempDir,
}

impl Dashlink {
    /// Point the binary at a backend, with a fresh state directory.
    pub fn new(base_url: impl Into<String>, ws_url: impl Into<String>) -> anyhow::Result<Self> {
        let binary = dashlink_binary();
        anyhow::ensure!(binary.exists(), "dashlink binary not found at {}", binary.display());
        Ok(Self { base_url: base_url.into(), ws_url: ws_url.into(), state_dir: tempfile::tempdir()? })
    }

    pub fn state_dir(&self) -> &Path {
        self.state_dir.path()
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(dashlink_binary());
        cmd.args(["--log-format", "text", "--log-level", "warn"])
            .args(args)
            .env("DASHLINK_BASE_URL", &self.base_url)
            .env("DASHLINK_WS_URL", &self.ws_url)
            .env("DASHLINK_STATE_DIR", self.state_dir.path())
            .env("DASHLINK_TIMEOUT_MS", "3000")
            .env("DASHLINK_HEARTBEAT_MS", "1000")
            .env("DASHLINK_RECONNECT_ATTEMPTS", "3")
            .env("DASHLINK_RECONNECT_DELAY_MS", "50")
            .stdin(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    /// Run a command to completion within `timeout`.
    pub async fn run(&self, args: &[&str], timeout: Duration) -> anyhow::Result<Output> {
        let output = tokio::time::timeout(timeout, self.command(args).output())
            .await
            .map_err(|_| anyhow::anyhow!("dashlink {args:?} did not exit within {timeout:?}"))??;
        Ok(Output {
            code: output.status.code(),
            stdout: String::from_utf8(output.stdout)?,
            stderr: String::from_utf8(output.stderr)?,
        })
    }

    /// Start a long-running command with stdout captured line by line.
    pub fn spawn(&self, args: &[&str]) -> anyhow::Result<DashlinkProcess> {
        let mut child = self.command(args).stdout(Stdio::piped()).stderr(Stdio::null()).spawn()?;
        let stdout = child.stdout.take().ok_or_else(|| anyhow::anyhow!("stdout not captured"))?;
        Ok(DashlinkProcess { child, lines: BufReader::new(stdout).lines() })
    }
}

/// A running `dashlink` process that is killed on drop.
pub struct DashlinkProcess {
    child: Child,
    lines: Lines<BufReader<ChildStdout>>,
}

impl DashlinkProcess {
    /// Next stdout line, or `None` once the process closed stdout.
    pub async fn next_line(&mut self, timeout: Duration) -> anyhow::Result<Option<String>> {
        tokio::time::timeout(timeout, self.lines.next_line())
            .await
            .map_err(|_| anyhow::anyhow!("no output within {timeout:?}"))?
            .map_err(Into::into)
    }

    /// Wait for the process to exit within `timeout`.
    pub async fn wait_exit(&mut self, timeout: Duration) -> anyhow::Result<Option<i32>> {
        let status = tokio::time::timeout(timeout, self.child.wait())
            .await
            .map_err(|_| anyhow::anyhow!("dashlink did not exit within {timeout:?}"))??;
        Ok(status.code())
    }
}
