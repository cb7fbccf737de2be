// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("could not encode message: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("could not decode message: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("bad frame header: {context}")]
    BadFrameHeader { context: String },

    #[error("frame of {size} bytes exceeds the {limit} byte limit")]
    FrameTooLarge { size: usize, limit: usize },

    #[error("invalid value for '{key}': {context}")]
    InvalidValue { key: String, context: String },

    #[error("backend {id} was already re-identified")]
    AlreadyIdentified { id: u32 },

    #[error("unknown capability '{0}'")]
    UnknownCapability(String),

    #[error("invalid prefork argument layout: {context}")]
    PreforkLayout { context: String },

    #[error("could not load '{path}': {context}")]
    DynamicLoad { path: String, context: String },

    #[error("launcher connection lost: {0}")]
    ConnectionLost(String),

    #[error("launcher could not list its internal processes: {0}")]
    RemoteInternalProcesses(String),

    #[error("system call failed: {0}")]
    Sys(#[from] nix::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
