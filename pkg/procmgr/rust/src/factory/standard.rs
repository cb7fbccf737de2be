// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use super::{FactoryDelegates, ProcessBackendFactory};
use crate::backend::{ProcessBackend, UnixProcessBackend};
use crate::info::ProcessInfo;

/// Creates local backends.
#[derive(Default)]
pub struct StandardFactory {
    delegates: FactoryDelegates,
}

impl StandardFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delegates(delegates: FactoryDelegates) -> Self {
        Self { delegates }
    }
}

impl ProcessBackendFactory for StandardFactory {
    fn name(&self) -> &str {
        "standard"
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
