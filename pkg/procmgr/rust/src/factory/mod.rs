// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Backend factories. Each factory creates one kind of backend and may
//! carry a match delegate (which specifications it accepts) and a rewrite
//! delegate (how it adjusts them).

mod debugger;
pub mod prelaunch;
pub mod remote;
mod standard;

pub use debugger::DebuggerFactory;
pub use prelaunch::{PrelaunchFactory, PrelaunchPacer};
pub use remote::RemoteFactory;
pub use standard::StandardFactory;

use crate::backend::ProcessBackend;
use crate::delegate::{MatchDelegate, RewriteDelegate};
use crate::errors::Result;
use crate::info::ProcessInfo;
use std::sync::Arc;
use tokio::sync::Notify;

pub trait ProcessBackendFactory: Send {
    /// Short name used in log lines.
    fn name(&self) -> &str;

    fn delegates(&self) -> &FactoryDelegates;

    fn delegates_mut(&mut self) -> &mut FactoryDelegates;

    fn can_create(&self, info: &ProcessInfo) -> bool {
        self.delegates().matches(info)
    }

    fn rewrite(&self, info: &mut ProcessInfo) {
        self.delegates().rewrite(info)
    }

    /// Build a backend for an already rewritten specification that
    /// `can_create` accepted.
    fn create(&mut self, info: ProcessInfo) -> Option<Box<dyn ProcessBackend>>;

    /// Shed memory (warm instances) while restricted.
    fn set_memory_restricted(&mut self, _restricted: bool) {}

    /// Whether this factory wants idle time right now.
    fn idle_cpu_requested(&self) -> bool {
        false
    }

    fn idle_cpu_available(&mut self) {}

    fn idle_load_updated(&mut self, _load: f64, _below_threshold: bool) {}

    /// Pids this factory owns outside of any backend it handed out.
    fn internal_processes(&self) -> Result<Vec<u32>> {
        Ok(Vec::new())
    }

    /// Called once by the manager. Factories whose idle request can change
    /// on their own notify it so the manager re-aggregates requests.
    fn set_idle_notifier(&mut self, _notify: Arc<Notify>) {}
}

/// At most one match and one rewrite delegate.
#[derive(Default)]
pub struct FactoryDelegates {
    match_delegate: Option<Box<dyn MatchDelegate>>,
    rewrite_delegate: Option<Box<dyn RewriteDelegate>>,
}

impl FactoryDelegates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_match(mut self, delegate: impl MatchDelegate + 'static) -> Self {
        self.set_match(Box::new(delegate));
        self
    }

    pub fn with_rewrite(mut self, delegate: impl RewriteDelegate + 'static) -> Self {
        self.set_rewrite(Box::new(delegate));
        self
    }

    /// Replaces any previous match delegate.
    pub fn set_match(&mut self, delegate: Box<dyn MatchDelegate>) {
        self.match_delegate = Some(delegate);
    }

    pub fn set_rewrite(&mut self, delegate: Box<dyn RewriteDelegate>) {
        self.rewrite_delegate = Some(delegate);
    }

    pub fn matches(&self, info: &ProcessInfo) -> bool {
        self.match_delegate
            .as_ref()
            .is_none_or(|delegate| delegate.matches(info))
    }

    pub fn rewrite(&self, info: &mut ProcessInfo) {
        if let Some(ref delegate) = self.rewrite_delegate {
            delegate.rewrite(info);
        }
    }
}
