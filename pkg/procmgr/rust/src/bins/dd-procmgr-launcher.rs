// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result};
use clap::Parser;
use dd_procmgr::config::{Config, build_manager};
use dd_procmgr::prefork::{Prefork, watch_helpers};
use dd_procmgr::remote::serve;
use log::{info, warn};
use std::path::PathBuf;
use tokio::net::UnixListener;
use tokio::signal::unix::{SignalKind, signal};

#[derive(Parser)]
#[command(
    name = "dd-procmgr-launcher",
    version,
    about = "Start processes on behalf of a remote controller"
)]
struct Cli {
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listen on a Unix socket instead of serving stdin/stdout
    #[arg(long)]
    socket: Option<PathBuf>,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&Config::path(cli.config.as_deref()))?;
    simple_logger::SimpleLogger::new()
        .with_level(config.log_level())
        .init()?;
    info!(
        "[launcher] starting (version {})",
        env!("CARGO_PKG_VERSION")
    );

    let prefork = Prefork::from_env()?;
    if let Some(ref prefork) = prefork {
        watch_helpers(prefork)?;
    }

    match cli.socket {
        None => {
            let manager = build_manager(&config, prefork.as_ref()).await?;
            serve(manager, tokio::io::stdin(), tokio::io::stdout()).await?;
        }
        Some(path) => {
            if path.exists() {
                std::fs::remove_file(&path)
                    .with_context(|| format!("removing stale socket {}", path.display()))?;
            }
            let listener = UnixListener::bind(&path)
                .with_context(|| format!("binding {}", path.display()))?;
            info!("[launcher] listening on {}", path.display());

            let mut sigterm = signal(SignalKind::terminate())?;
            let mut sigint = signal(SignalKind::interrupt())?;
            loop {
                let stream = tokio::select! {
                    accepted = listener.accept() => accepted?.0,
                    _ = sigterm.recv() => break,
                    _ = sigint.recv() => break,
                };
                info!("[launcher] controller connected");
                let (reader, writer) = stream.into_split();
                let manager = build_manager(&config, prefork.as_ref()).await?;
                if let Err(e) = serve(manager, reader, writer).await {
                    warn!("[launcher] session ended with an error: {e}");
                }
                info!("[launcher] controller disconnected");
            }
            let _ = std::fs::remove_file(&path);
        }
    }
    info!("[launcher] exiting");
    Ok(())
}
