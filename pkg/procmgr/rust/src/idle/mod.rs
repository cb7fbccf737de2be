// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Idle delegates decide when background work (preparing warm processes)
//! may run.
//!
//! A delegate is active only while it is both enabled and requested. While
//! inactive, [`IdleDelegate::next_event`] never completes.

mod load;
mod timer;

pub use load::{
    CpuLoadSampler, DEFAULT_THRESHOLD, IoLoadSampler, LoadIdleDelegate, LoadSampler, fires,
};
pub use timer::{DEFAULT_INTERVAL, TimerIdleDelegate};

use async_trait::async_trait;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum IdleEvent {
    /// Background work may proceed now.
    Available,
    /// Raw load sample, emitted every interval by load-sampling delegates.
    LoadUpdated { load: f64, below_threshold: bool },
}

#[async_trait]
pub trait IdleDelegate: Send {
    fn set_enabled(&mut self, enabled: bool);

    fn set_requested(&mut self, requested: bool);

    fn is_active(&self) -> bool;

    async fn next_event(&mut self) -> IdleEvent;
}

/// Enabled/requested pair with edge detection on the combined state.
#[derive(Debug, Clone, Copy)]
pub(crate) struct IdleGate {
    enabled: bool,
    requested: bool,
}

impl Default for IdleGate {
    fn default() -> Self {
        Self {
            enabled: true,
            requested: false,
        }
    }
}

impl IdleGate {
    pub(crate) fn is_active(&self) -> bool {
        self.enabled && self.requested
    }

    /// Returns the new active state if it changed.
    pub(crate) fn set_enabled(&mut self, enabled: bool) -> Option<bool> {
        let before = self.is_active();
        self.enabled = enabled;
        self.edge(before)
    }

    pub(crate) fn set_requested(&mut self, requested: bool) -> Option<bool> {
        let before = self.is_active();
        self.requested = requested;
        self.edge(before)
    }

    fn edge(&self, before: bool) -> Option<bool> {
        let after = self.is_active();
        (after != before).then_some(after)
    }
}
