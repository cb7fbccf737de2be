// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use super::{FactoryDelegates, ProcessBackendFactory};
use crate::backend::{ProcessBackend, UnixProcessBackend};
use crate::delegate::{DEFAULT_DEBUGGER, GdbRewriteDelegate, KeyMatchDelegate};
use crate::info::ProcessInfo;

/// Key a specification sets to be run under the debugger.
pub const DEBUG_KEY: &str = "gdb";

/// Local backends run under a debugger, for specifications that carry the
/// `gdb` key.
pub struct DebuggerFactory {
    delegates: FactoryDelegates,
}

impl DebuggerFactory {
    pub fn new(debugger: &str) -> Self {
        Self {
            delegates: FactoryDelegates::new()
                .with_match(KeyMatchDelegate::new(DEBUG_KEY))
                .with_rewrite(GdbRewriteDelegate::new(debugger)),
        }
    }
}

impl Default for DebuggerFactory {
    fn default() -> Self {
        Self::new(DEFAULT_DEBUGGER)
    }
}

impl ProcessBackendFactory for DebuggerFactory {
    fn name(&self) -> &str {
        "debugger"
    }

    fn delegates(&self) -> &FactoryDelegates {
        &self.delegates
    }

    fn delegates_mut(&mut self) -> &mut FactoryDelegates {
        &mut self.delegates
    }

    fn create(&mut self, info: ProcessInfo) -> Option<Box<dyn ProcessBackend>> {
        Some(Box::new(UnixProcessBackend::new(info)))
    }
}
