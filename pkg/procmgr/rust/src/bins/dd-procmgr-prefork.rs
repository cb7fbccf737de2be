// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use anyhow::{Context, Result};
use dd_procmgr::config::Config;
use dd_procmgr::prefork;
use log::debug;

const USAGE: &str = "usage: dd-procmgr-prefork -- PRIMARY [ARGS...] -- HELPER [ARGS...] [-- HELPER [ARGS...]]...";

fn main() -> Result<()> {
    let config = Config::load(&Config::path(None))?;
    simple_logger::SimpleLogger::new()
        .with_level(config.log_level())
        .init()?;

    let args: Vec<String> = std::env::args().collect();
    let layout = prefork::split_args(&args).context(USAGE)?;
    debug!("[prefork] controller arguments: {:?}", layout.controller);

    let Err(e) = prefork::launch(&layout);
    Err(e).with_context(|| format!("starting {}", layout.primary.join(" ")))
}
