// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use clap::Parser;
use tracing::error;

use dashlink::cli::Cli;

#[tokio::main]
async fn main() {
    dashlink::ensure_crypto();
    let cli = Cli::parse();

    match dashlink::cli::run(cli).await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            error!("fatal: {e:#}");
            eprintln!("error: {e:#}");
            std::process::exit(1);
        }
    }
}
