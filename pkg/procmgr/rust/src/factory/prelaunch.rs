// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use super::{FactoryDelegates, ProcessBackendFactory};
use crate::backend::{PrelaunchProcessBackend, ProcessBackend};
use crate::errors::Result;
use crate::info::ProcessInfo;
use log::{debug, info, warn};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::time::{Duration, Instant};

/// Decides when a requested warm instance may actually be launched.
///
/// With load sampling, `samples_required` consecutive below-threshold samples
/// are needed. Once `max_wait` has passed since the request, the launch is
/// forced whatever the load.
#[derive(Debug, Clone)]
pub struct PrelaunchPacer {
    samples_required: u32,
    max_wait: Option<Duration>,
    consecutive: u32,
    requested_at: Option<Instant>,
}

impl PrelaunchPacer {
    pub fn new(samples_required: u32, max_wait: Option<Duration>) -> Self {
        Self {
            samples_required,
            max_wait,
            consecutive: 0,
            requested_at: None,
        }
    }

    pub fn request(&mut self) {
        if self.requested_at.is_none() {
            self.requested_at = Some(Instant::now());
            self.consecutive = 0;
        }
    }

    pub fn is_requested(&self) -> bool {
        self.requested_at.is_some()
    }

    pub fn record_sample(&mut self, below_threshold: bool) {
        self.consecutive = if below_threshold {
            self.consecutive.saturating_add(1)
        } else {
            0
        };
    }

    /// Enough quiet samples were seen.
    pub fn settled(&self) -> bool {
        self.consecutive >= self.samples_required
    }

    /// The request has waited at least `max_wait`.
    pub fn overdue(&self) -> bool {
        match (self.requested_at, self.max_wait) {
            (Some(at), Some(max_wait)) => at.elapsed() >= max_wait,
            _ => false,
        }
    }

    pub fn complete(&mut self) {
        self.requested_at = None;
        self.consecutive = 0;
    }
}

impl Default for PrelaunchPacer {
    fn default() -> Self {
        Self::new(0, None)
    }
}

/// Keeps one warm backend started from a template and hands it out with the
/// real specification on `create`.
pub struct PrelaunchFactory {
    delegates: FactoryDelegates,
    template: ProcessInfo,
    warm: Option<PrelaunchProcessBackend>,
    pacer: PrelaunchPacer,
    memory_restricted: bool,
    notify: Option<Arc<Notify>>,
}

impl PrelaunchFactory {
    pub fn new(template: ProcessInfo, pacer: PrelaunchPacer) -> Self {
        let mut pacer = pacer;
        pacer.request();
        Self {
            delegates: FactoryDelegates::default(),
            template,
            warm: None,
            pacer,
            memory_restricted: false,
            notify: None,
        }
    }

    pub fn with_delegates(mut self, delegates: FactoryDelegates) -> Self {
        self.delegates = delegates;
        self
    }

    pub fn template(&self) -> &ProcessInfo {
        &self.template
    }

    /// Deliver what the warm instance has queued and tell whether it is
    /// still alive.
    pub fn refresh_warm_instance(&mut self) -> bool {
        if let Some(ref mut warm) = self.warm {
            warm.pump();
            return warm.is_alive();
        }
        false
    }

    /// Start the next warm instance now.
    pub fn prelaunch(&mut self) {
        if self.memory_restricted {
            debug!("memory restricted, not preparing a warm instance");
            return;
        }
        info!("[{}] preparing warm instance", self.template.label());
        self.warm = Some(PrelaunchProcessBackend::launch(self.template.clone()));
        self.pacer.complete();
        self.notify_manager();
    }

    fn schedule_next(&mut self) {
        self.pacer.request();
        self.notify_manager();
    }

    fn notify_manager(&self) {
        if let Some(ref notify) = self.notify {
            notify.notify_one();
        }
    }
}

impl ProcessBackendFactory for PrelaunchFactory {
    fn name(&self) -> &str {
        "prelaunch"
    }

    fn delegates(&self) -> &FactoryDelegates {
        &self.delegates
    }

    fn delegates_mut(&mut self) -> &mut FactoryDelegates {
        &mut self.delegates
    }

    fn create(&mut self, info: ProcessInfo) -> Option<Box<dyn ProcessBackend>> {
        let label = info.label().to_string();
        let claimed = self.warm.take().and_then(|mut warm| {
            warm.pump();
            if warm.is_alive() {
                Some(warm)
            } else {
                warn!("[{label}] warm instance died, launching a fresh one");
                None
            }
        });
        self.schedule_next();

        let mut backend = match claimed {
            Some(warm) => {
                debug!("[{label}] claimed warm instance");
                warm
            }
            None => PrelaunchProcessBackend::launch(self.template.clone()),
        };
        if let Err(e) = backend.set_info(info) {
            warn!("[{label}] {e}");
        }
        Some(Box::new(backend))
    }

    fn set_memory_restricted(&mut self, restricted: bool) {
        self.memory_restricted = restricted;
        if restricted && self.warm.take().is_some() {
            info!(
                "[{}] dropped warm instance under memory pressure",
                self.template.label()
            );
        }
        if !restricted && self.warm.is_none() {
            self.pacer.request();
        }
        self.notify_manager();
    }

    fn idle_cpu_requested(&self) -> bool {
        !self.memory_restricted && self.warm.is_none() && self.pacer.is_requested()
    }

    fn idle_cpu_available(&mut self) {
        if !self.idle_cpu_requested() {
            return;
        }
        if self.pacer.settled() || self.pacer.overdue() {
            self.prelaunch();
        }
    }

    fn idle_load_updated(&mut self, _load: f64, below_threshold: bool) {
        if !self.idle_cpu_requested() {
            return;
        }
        self.pacer.record_sample(below_threshold);
        if self.pacer.overdue() {
            info!(
                "[{}] waited too long for an idle system, preparing anyway",
                self.template.label()
            );
            self.prelaunch();
        }
    }

    fn internal_processes(&self) -> Result<Vec<u32>> {
        Ok(self
            .warm
            .as_ref()
            .and_then(PrelaunchProcessBackend::process_id)
            .into_iter()
            .collect())
    }

    fn set_idle_notifier(&mut self, notify: Arc<Notify>) {
        self.notify = Some(notify);
    }
}
