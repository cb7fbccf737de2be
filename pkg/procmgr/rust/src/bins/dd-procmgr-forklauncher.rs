// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result};
use dd_procmgr::config::Config;
use dd_procmgr::forklauncher::{self, LauncherExit};
use log::error;
use std::io;
use std::os::fd::AsFd;

fn main() -> Result<()> {
    let config = Config::load(&Config::path(None))?;
    simple_logger::SimpleLogger::new()
        .with_level(config.log_level())
        .init()?;

    // Copies, so a child's new stdin/stdout survive the launcher closing its
    // descriptors.
    let input = io::stdin().as_fd().try_clone_to_owned().context("stdin")?;
    let output = io::stdout().as_fd().try_clone_to_owned().context("stdout")?;

    match forklauncher::run(input, output)? {
        LauncherExit::Halted => Ok(()),
        LauncherExit::Child(launch) => {
            let Err(e) = launch.exec();
            error!("[{}] failed to execute: {e}", launch.id);
            std::process::exit(127)
        }
    }
}
