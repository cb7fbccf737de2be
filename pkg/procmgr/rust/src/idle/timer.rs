// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use super::{IdleDelegate, IdleEvent, IdleGate};
use async_trait::async_trait;
use log::debug;
use tokio::time::{Duration, Instant, Interval, MissedTickBehavior, interval_at};

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Emits `Available` every interval while active.
pub struct TimerIdleDelegate {
    gate: IdleGate,
    interval: Duration,
    ticker: Option<Interval>,
}

impl TimerIdleDelegate {
    pub fn new(interval: Duration) -> Self {
        Self {
            gate: IdleGate::default(),
            interval,
            ticker: None,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn on_edge(&mut self, active: Option<bool>) {
        match active {
            Some(true) => {
                debug!("idle timer armed ({:?})", self.interval);
                let mut ticker = interval_at(Instant::now() + self.interval, self.interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.ticker = Some(ticker);
            }
            Some(false) => {
                debug!("idle timer disarmed");
                self.ticker = None;
            }
            None => {}
        }
    }
}

impl Default for TimerIdleDelegate {
    fn default() -> Self {
        Self::new(DEFAULT_INTERVAL)
    }
}

#[async_trait]
impl IdleDelegate for TimerIdleDelegate {
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
        match self.ticker {
            Some(ref mut ticker) => {
                ticker.tick().await;
                IdleEvent::Available
            }
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    #[tokio::test]
    async fn test_silent_unless_enabled_and_requested() {
        let mut delegate = TimerIdleDelegate::new(Duration::from_millis(20));
        assert!(
            timeout(Duration::from_millis(100), delegate.next_event())
                .await
                .is_err()
        );

        delegate.set_requested(true);
        delegate.set_enabled(false);
        assert!(
            timeout(Duration::from_millis(100), delegate.next_event())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_fires_with_configured_period() {
        let mut delegate = TimerIdleDelegate::new(Duration::from_millis(50));
        delegate.set_requested(true);

        let begin = std::time::Instant::now();
        for _ in 0..3 {
            assert_eq!(delegate.next_event().await, IdleEvent::Available);
        }
        assert!(begin.elapsed() >= Duration::from_millis(150));
    }

    #[tokio::test]
    async fn test_unrequest_stops_firing() {
        let mut delegate = TimerIdleDelegate::new(Duration::from_millis(20));
        delegate.set_requested(true);
        assert_eq!(delegate.next_event().await, IdleEvent::Available);
        delegate.set_requested(false);
        assert!(!delegate.is_active());
        assert!(
            timeout(Duration::from_millis(100), delegate.next_event())
                .await
                .is_err()
        );
    }
}
