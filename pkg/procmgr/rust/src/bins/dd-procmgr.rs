// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result, anyhow};
use clap::{Args, Parser, Subcommand};
use dd_procmgr::config::{Config, build_manager};
use dd_procmgr::env::parse_environment_file;
use dd_procmgr::prefork::{Prefork, watch_helpers};
use dd_procmgr::{BackendEvent, ExitStatus, ProcessInfo, RunTracker};
use log::{debug, info, warn};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tokio::signal::unix::{SignalKind, signal};

#[derive(Parser)]
#[command(name = "dd-procmgr", version, about = "Run a process through a backend manager")]
struct Cli {
    /// Configuration file (defaults to $DD_PROCMGR_CONFIG or /etc/datadog-agent/procmgr.yaml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a program, relay its output and stop it on SIGTERM/SIGINT
    Run(RunArgs),
    /// List the configured factory chain
    Factories,
}

#[derive(Args)]
struct RunArgs {
    /// Name used in log lines and by match delegates
    #[arg(long)]
    identifier: Option<String>,

    /// Grace period between SIGTERM and SIGKILL
    #[arg(long, default_value_t = 5000)]
    stop_timeout_ms: i64,

    /// Extra environment, systemd EnvironmentFile syntax
    #[arg(long)]
    env_file: Option<String>,

    #[arg(long)]
    working_directory: Option<String>,

    #[arg(long, allow_negative_numbers = true)]
    priority: Option<i32>,

    /// Extra specification entries as KEY=JSON (or KEY=text)
    #[arg(long = "set", value_name = "KEY=VALUE")]
    values: Vec<String>,

    program: String,

    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    arguments: Vec<String>,
}

impl RunArgs {
    fn process_info(&self) -> Result<ProcessInfo> {
        let mut info = ProcessInfo::new();
        info.set_program(&self.program);
        info.set_arguments(self.arguments.clone());
        if let Some(ref identifier) = self.identifier {
            info.set_identifier(identifier);
        }
        if let Some(ref dir) = self.working_directory {
            info.set_working_directory(dir);
        }
        if let Some(priority) = self.priority {
            info.set_priority(priority);
        }
        if let Some(ref path) = self.env_file {
            let mut environment = info.resolved_environment(std::env::vars());
            environment.extend(parse_environment_file(path)?);
            info.set_environment(environment);
        }
        for entry in &self.values {
            let (key, raw) = entry
                .split_once('=')
                .ok_or_else(|| anyhow!("--set {entry}: expected KEY=VALUE"))?;
            let value = serde_json::from_str(raw)
                .unwrap_or_else(|_| serde_json::Value::String(raw.to_string()));
            info.set_value(key, value);
        }
        Ok(info)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load(&Config::path(cli.config.as_deref()))?;
    simple_logger::SimpleLogger::new()
        .with_level(config.log_level())
        .init()?;

    let prefork = Prefork::from_env()?;
    if let Some(ref prefork) = prefork {
        watch_helpers(prefork)?;
    }

    match cli.command {
        Command::Factories => {
            let manager = build_manager(&config, prefork.as_ref()).await?;
            for (position, factory) in manager.factories().iter().enumerate() {
                println!("{position}: {}", factory.name());
            }
            Ok(())
        }
        Command::Run(args) => {
            let code = run(&config, prefork.as_ref(), &args).await?;
            std::process::exit(code)
        }
    }
}

async fn run(config: &Config, prefork: Option<&Prefork>, args: &RunArgs) -> Result<i32> {
    let info = args.process_info()?;
    let label = info.label().to_string();
    let mut manager = build_manager(config, prefork).await?;
    let mut backend = manager
        .create(&info)
        .ok_or_else(|| anyhow!("no factory accepts {label}"))?;

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut stdout = tokio::io::stdout();
    let mut stderr = tokio::io::stderr();
    let mut stopping = false;
    let mut run = RunTracker::default();

    info!("[{label}] starting");
    backend.start();
    loop {
        tokio::select! {
            event = backend.next_event() => {
                let Some(event) = event else {
                    return Err(anyhow!("[{label}] backend went away"));
                };
                if run.ends_run(&event) && !event.is_finished() {
                    return Err(anyhow!("[{label}] failed to start"));
                }
                match event {
                    BackendEvent::StandardOutput(data) => {
                        stdout.write_all(&data).await?;
                        stdout.flush().await?;
                    }
                    BackendEvent::StandardError(data) => {
                        stderr.write_all(&data).await?;
                        stderr.flush().await?;
                    }
                    BackendEvent::Started { pid } => info!("[{label}] started (pid={pid})"),
                    BackendEvent::StateChanged(state) => debug!("[{label}] {state}"),
                    BackendEvent::Error { error, message } => {
                        warn!("[{label}] {error}: {message}");
                    }
                    BackendEvent::Finished { exit_code, exit_status } => {
                        info!("[{label}] finished: {exit_status:?} ({exit_code})");
                        return Ok(match exit_status {
                            ExitStatus::NormalExit => exit_code,
                            ExitStatus::CrashExit if stopping => 0,
                            ExitStatus::CrashExit => 1,
                        });
                    }
                }
            }
            _ = sigterm.recv() => {
                info!("[{label}] received SIGTERM, stopping");
                backend.stop(if stopping { 0 } else { args.stop_timeout_ms });
                stopping = true;
            }
            _ = sigint.recv() => {
                info!("[{label}] received SIGINT, stopping");
                backend.stop(if stopping { 0 } else { args.stop_timeout_ms });
                stopping = true;
            }
            event = manager.next_idle() => debug!("[{label}] idle: {event:?}"),
        }
    }
}
