// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use super::{IdleDelegate, IdleEvent, IdleGate};
use async_trait::async_trait;
use log::{debug, warn};
use std::collections::VecDeque;
use std::path::PathBuf;
use tokio::time::{Duration, Instant, Interval, MissedTickBehavior, interval_at};

pub const DEFAULT_THRESHOLD: f64 = 0.5;

/// Source of load fractions in `[0, 1]`.
pub trait LoadSampler: Send {
    /// Load since the previous call. The first call only primes the sampler
    /// and returns `None`.
    fn sample(&mut self) -> Option<f64>;
}

/// Whether a sampled load allows idle work. A threshold of 1.0 or more
/// always fires, a negative threshold never does.
pub fn fires(load: f64, threshold: f64) -> bool {
    if threshold >= 1.0 {
        return true;
    }
    if threshold < 0.0 {
        return false;
    }
    load <= threshold
}

/// Samples load once per interval. Emits `LoadUpdated` every interval and
/// `Available` when the load is at or below the threshold.
pub struct LoadIdleDelegate {
    gate: IdleGate,
    interval: Duration,
    threshold: f64,
    sampler: Box<dyn LoadSampler>,
    ticker: Option<Interval>,
    pending: VecDeque<IdleEvent>,
}

impl LoadIdleDelegate {
    pub fn new(interval: Duration, threshold: f64, sampler: Box<dyn LoadSampler>) -> Self {
        Self {
            gate: IdleGate::default(),
            interval,
            threshold,
            sampler,
            ticker: None,
            pending: VecDeque::new(),
        }
    }

    pub fn cpu(interval: Duration, threshold: f64) -> Self {
        Self::new(interval, threshold, Box::new(CpuLoadSampler::new()))
    }

    pub fn io(interval: Duration, threshold: f64, device: &str) -> Self {
        Self::new(interval, threshold, Box::new(IoLoadSampler::new(device)))
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    fn on_edge(&mut self, active: Option<bool>) {
        match active {
            Some(true) => {
                self.sampler.sample();
                let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.ticker = Some(ticker);
            }
            Some(false) => {
                self.ticker = None;
                self.pending.clear();
            }
            None => {}
        }
    }
}

#[async_trait]
impl IdleDelegate for LoadIdleDelegate {
    fn set_enabled(&mut self, enabled: bool) {
        let edge = self.gate.set_enabled(enabled);
        self.on_edge(edge);
    }

    fn set_requested(&mut self, requested: bool) {
        let edge = self.gate.set_requested(requested);
        self.on_edge(edge);
    }

    fn is_active(&self) -> bool {
        self.gate.is_active()
    }

    async fn next_event(&mut self) -> IdleEvent {
        loop {
            if let Some(event) = self.pending.pop_front() {
                return event;
            }
            match self.ticker {
                Some(ref mut ticker) => {
                    ticker.tick().await;
                }
                None => std::future::pending::<()>().await,
            }
            let Some(load) = self.sampler.sample() else {
                continue;
            };
            let below_threshold = fires(load, self.threshold);
            debug!(
                "sampled load {load:.3} (threshold {}, below={below_threshold})",
                self.threshold
            );
            self.pending.push_back(IdleEvent::LoadUpdated {
                load,
                below_threshold,
            });
            if below_threshold {
                self.pending.push_back(IdleEvent::Available);
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CpuTimes {
    busy: u64,
    total: u64,
}

fn parse_cpu_times(stat: &str) -> Option<CpuTimes> {
    let line = stat.lines().find(|l| l.starts_with("cpu "))?;
    let values: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .map(|v| v.parse().ok())
        .collect::<Option<_>>()?;
    // user nice system idle iowait irq softirq steal
    let idle = values.get(3)? + values.get(4).copied().unwrap_or(0);
    let total: u64 = values.iter().sum();
    Some(CpuTimes {
        busy: total.saturating_sub(idle),
        total,
    })
}

/// Fraction of non-idle CPU time since the previous sample, from `/proc/stat`.
pub struct CpuLoadSampler {
    path: PathBuf,
    previous: Option<CpuTimes>,
}

impl CpuLoadSampler {
    pub fn new() -> Self {
        Self::with_path("/proc/stat")
    }

    pub fn with_path(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            previous: None,
        }
    }
}

impl Default for CpuLoadSampler {
    fn default() -> Self {
        Self::new()
    }
}

impl LoadSampler for CpuLoadSampler {
    fn sample(&mut self) -> Option<f64> {
        let current = match std::fs::read_to_string(&self.path) {
            Ok(stat) => parse_cpu_times(&stat)?,
            Err(e) => {
                warn!("failed to read {}: {e}", self.path.display());
                return None;
            }
        };
        let previous = self.previous.replace(current)?;
        let total = current.total.saturating_sub(previous.total);
        if total == 0 {
            return Some(0.0);
        }
        let busy = current.busy.saturating_sub(previous.busy);
        Some((busy as f64 / total as f64).clamp(0.0, 1.0))
    }
}

/// Milliseconds `device` has spent doing I/O, field 13 of `/proc/diskstats`.
fn parse_io_ticks(diskstats: &str, device: &str) -> Option<u64> {
    diskstats.lines().find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.get(2) != Some(&device) {
            return None;
        }
        fields.get(12)?.parse().ok()
    })
}

/// Fraction of wall time `device` was busy since the previous sample.
pub struct IoLoadSampler {
    path: PathBuf,
    device: String,
    previous: Option<(Instant, u64)>,
}

impl IoLoadSampler {
    pub fn new(device: &str) -> Self {
        Self::with_path("/proc/diskstats", device)
    }

    pub fn with_path(path: impl Into<PathBuf>, device: &str) -> Self {
        Self {
            path: path.into(),
            device: device.to_string(),
            previous: None,
        }
    }
}

impl LoadSampler for IoLoadSampler {
    fn sample(&mut self) -> Option<f64> {
        let ticks = match std::fs::read_to_string(&self.path) {
            Ok(stats) => parse_io_ticks(&stats, &self.device),
            Err(e) => {
                warn!("failed to read {}: {e}", self.path.display());
                return None;
            }
        };
        let Some(ticks) = ticks else {
            warn!("device {} not found in {}", self.device, self.path.display());
            return None;
        };
        let now = Instant::now();
        let (then, previous) = self.previous.replace((now, ticks))?;
        let elapsed_ms = now.duration_since(then).as_millis();
        if elapsed_ms == 0 {
            return Some(0.0);
        }
        let busy_ms = ticks.saturating_sub(previous);
        Some((busy_ms as f64 / elapsed_ms as f64).clamp(0.0, 1.0))
    }
}
