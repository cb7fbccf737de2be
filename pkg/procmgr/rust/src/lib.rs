// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

// Correctness
#![deny(clippy::undocumented_unsafe_blocks)]
// Panicking code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::unimplemented)]
#![deny(clippy::todo)]
// Debug code that shouldn't be in production
#![deny(clippy::dbg_macro)]
#![deny(clippy::print_stdout)]
#![deny(clippy::print_stderr)]

//! Process backends behind one interface: local children, children run
//! under a debugger, warm pre-launched instances, and children started by
//! a remote launcher over a framed MessagePack protocol.

pub mod backend;
pub mod config;
pub mod delegate;
pub mod env;
mod errors;
pub mod factory;
pub mod forklauncher;
pub mod idle;
pub mod info;
pub mod manager;
pub mod platform;
pub mod prefork;
pub mod protocol;
pub mod remote;
pub mod state;

pub use backend::{BackendId, ProcessBackend};
pub use errors::{Error, Result};
pub use factory::ProcessBackendFactory;
pub use info::ProcessInfo;
pub use manager::BackendManager;
pub use state::{BackendEvent, ExitStatus, ProcessError, ProcessState, RunTracker};
