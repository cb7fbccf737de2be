// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::backend::ProcessBackend;
use crate::errors::Result;
use crate::factory::ProcessBackendFactory;
use crate::idle::{IdleDelegate, IdleEvent, TimerIdleDelegate};
use crate::info::ProcessInfo;
use log::{debug, info};
use std::sync::Arc;
use tokio::sync::Notify;

/// Routes creation requests through an ordered factory chain and hands idle
/// time to the factories that asked for it.
pub struct BackendManager {
    factories: Vec<Box<dyn ProcessBackendFactory>>,
    idle: Box<dyn IdleDelegate>,
    idle_notify: Arc<Notify>,
    memory_restricted: bool,
}

impl BackendManager {
    pub fn new(idle: Box<dyn IdleDelegate>) -> Self {
        Self {
            factories: Vec::new(),
            idle,
            idle_notify: Arc::new(Notify::new()),
            memory_restricted: false,
        }
    }

    /// Append a factory. Earlier factories win.
    pub fn add_factory(&mut self, mut factory: Box<dyn ProcessBackendFactory>) {
        factory.set_idle_notifier(self.idle_notify.clone());
        if self.memory_restricted {
            factory.set_memory_restricted(true);
        }
        debug!(
            "registered factory #{} ({})",
            self.factories.len(),
            factory.name()
        );
        self.factories.push(factory);
        self.idle_notify.notify_one();
    }

    pub fn factories(&self) -> &[Box<dyn ProcessBackendFactory>] {
        &self.factories
    }

    /// Replace the idle delegate, carrying over the current request.
    pub fn set_idle_delegate(&mut self, mut idle: Box<dyn IdleDelegate>) {
        idle.set_requested(self.idle_requested());
        self.idle = idle;
    }

    pub fn idle_delegate_mut(&mut self) -> &mut dyn IdleDelegate {
        self.idle.as_mut()
    }

    /// Create a backend from the first factory accepting the rewritten
    /// specification. `None` means no factory handles it.
    pub fn create(&mut self, info: &ProcessInfo) -> Option<Box<dyn ProcessBackend>> {
        let label = info.label().to_string();
        let created = self.factories.iter_mut().enumerate().find_map(|(i, factory)| {
            let mut candidate = info.clone();
            factory.rewrite(&mut candidate);
            if !factory.can_create(&candidate) {
                return None;
            }
            debug!("[{label}] using factory #{i} ({})", factory.name());
            Some(factory.create(candidate))
        });
        // Creating may change idle requests (prelaunch refills).
        self.idle_notify.notify_one();
        match created {
            Some(backend) => backend,
            None => {
                info!("[{label}] no factory can create this process");
                None
            }
        }
    }

    pub fn memory_restricted(&self) -> bool {
        self.memory_restricted
    }

    pub fn set_memory_restricted(&mut self, restricted: bool) {
        if self.memory_restricted == restricted {
            return;
        }
        info!("memory restriction {}", if restricted { "on" } else { "off" });
        self.memory_restricted = restricted;
        for factory in &mut self.factories {
            factory.set_memory_restricted(restricted);
        }
        self.idle_notify.notify_one();
    }

    /// Whether any factory wants idle time.
    pub fn idle_requested(&self) -> bool {
        self.factories.iter().any(|f| f.idle_cpu_requested())
    }

    /// Pids owned by factories, sorted and deduplicated.
    pub fn internal_processes(&self) -> Result<Vec<u32>> {
        let mut pids = Vec::new();
        for factory in &self.factories {
            pids.extend(factory.internal_processes()?);
        }
        pids.sort_unstable();
        pids.dedup();
        Ok(pids)
    }

    /// Handle for waking [`next_idle`](Self::next_idle) after a factory's
    /// request changed outside of the manager's API.
    pub fn idle_notifier(&self) -> Arc<Notify> {
        self.idle_notify.clone()
    }

    fn refresh_idle_request(&mut self) {
        let requested = self.idle_requested();
        self.idle.set_requested(requested);
    }

    /// Wait for the next idle event and dispatch it: `Available` goes to the
    /// first factory (in order) that requested idle time, load updates go to
    /// every factory. Cancel safe.
    pub async fn next_idle(&mut self) -> IdleEvent {
        loop {
            self.refresh_idle_request();
            let notify = self.idle_notify.clone();
            let event = tokio::select! {
                _ = notify.notified() => continue,
                event = self.idle.next_event() => event,
            };
            self.dispatch_idle(event);
            return event;
        }
    }

    fn dispatch_idle(&mut self, event: IdleEvent) {
        match event {
            IdleEvent::Available => {
                if let Some(factory) = self
                    .factories
                    .iter_mut()
                    .find(|f| f.idle_cpu_requested())
                {
                    debug!("idle time goes to {}", factory.name());
                    factory.idle_cpu_available();
                }
            }
            IdleEvent::LoadUpdated {
                load,
                below_threshold,
            } => {
                for factory in &mut self.factories {
                    factory.idle_load_updated(load, below_threshold);
                }
            }
        }
        self.refresh_idle_request();
    }
}

impl Default for BackendManager {
    fn default() -> Self {
        Self::new(Box::new(TimerIdleDelegate::default()))
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::delegate::KeyMatchDelegate;
    use crate::factory::{DebuggerFactory, FactoryDelegates, StandardFactory};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::{Duration, timeout};

    /// Records which calls reached it; never creates anything real.
    struct ProbeFactory {
        name: String,
        delegates: FactoryDelegates,
        wants_idle: bool,
        log: Arc<Mutex<Vec<String>>>,
        given_idle: Arc<AtomicUsize>,
    }

    impl ProbeFactory {
        fn new(name: &str, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                delegates: FactoryDelegates::new(),
                wants_idle: false,
                log: log.clone(),
                given_idle: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl ProcessBackendFactory for ProbeFactory {
        fn name(&self) -> &str {
            &self.name
        }

        fn delegates(&self) -> &FactoryDelegates {
            &self.delegates
        }

        fn delegates_mut(&mut self) -> &mut FactoryDelegates {
            &mut self.delegates
        }

        fn create(&mut self, info: ProcessInfo) -> Option<Box<dyn ProcessBackend>> {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:{}", self.name, info.label()));
            None
        }

        fn set_memory_restricted(&mut self, restricted: bool) {
            self.log
                .lock()
                .unwrap()
                .push(format!("{}:memory={restricted}", self.name));
        }

        fn idle_cpu_requested(&self) -> bool {
            self.wants_idle
        }

        fn idle_cpu_available(&mut self) {
            self.given_idle.fetch_add(1, Ordering::SeqCst);
            self.wants_idle = false;
        }

        fn internal_processes(&self) -> Result<Vec<u32>> {
            Ok(vec![42, 7])
        }
    }

    #[test]
    fn test_first_matching_factory_wins() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = BackendManager::default();

        let mut first = ProbeFactory::new("first", &log);
        first
            .delegates_mut()
            .set_match(Box::new(KeyMatchDelegate::new("special")));
        manager.add_factory(Box::new(first));
        manager.add_factory(Box::new(ProbeFactory::new("second", &log)));
        manager.add_factory(Box::new(ProbeFactory::new("third", &log)));

        let mut info = ProcessInfo::new();
        info.set_identifier("plain");
        manager.create(&info);
        info.set_identifier("special-one");
        info.set_value("special", true);
        manager.create(&info);

        assert_eq!(
            *log.lock().unwrap(),
            vec!["second:plain", "first:special-one"]
        );
    }

    #[test]
    fn test_no_matching_factory_returns_none() {
        let mut manager = BackendManager::default();
        manager.add_factory(Box::new(StandardFactory::with_delegates(
            FactoryDelegates::new().with_match(KeyMatchDelegate::new("gdb")),
        )));
        assert!(
            manager
                .create(&ProcessInfo::with_program("echoClient", &[]))
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_debugger_factory_rewrites() {
        let mut manager = BackendManager::default();
        manager.add_factory(Box::new(DebuggerFactory::default()));
        manager.add_factory(Box::new(StandardFactory::new()));

        let mut info = ProcessInfo::with_program("/usr/bin/app", &["-v"]);
        let backend = manager.create(&info).unwrap();
        assert_eq!(backend.info().program(), Some("/usr/bin/app"));

        info.set_value("gdb", true);
        let backend = manager.create(&info).unwrap();
        assert_eq!(backend.info().program(), Some("gdb"));
        assert_eq!(
            backend.info().arguments(),
            vec!["--", "/usr/bin/app", "-v"]
        );
        assert_eq!(info.program(), Some("/usr/bin/app"), "caller's copy untouched");
    }

    #[test]
    fn test_memory_restriction_is_broadcast() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = BackendManager::default();
        manager.add_factory(Box::new(ProbeFactory::new("a", &log)));
        manager.add_factory(Box::new(ProbeFactory::new("b", &log)));

        manager.set_memory_restricted(true);
        manager.set_memory_restricted(true);
        assert_eq!(*log.lock().unwrap(), vec!["a:memory=true", "b:memory=true"]);
        assert!(manager.memory_restricted());
    }

    #[test]
    fn test_internal_processes_aggregate() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager = BackendManager::default();
        manager.add_factory(Box::new(ProbeFactory::new("a", &log)));
        manager.add_factory(Box::new(ProbeFactory::new("b", &log)));
        assert_eq!(manager.internal_processes().unwrap(), vec![7, 42]);
    }

    #[tokio::test]
    async fn test_idle_goes_to_first_requesting_factory() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut manager =
            BackendManager::new(Box::new(TimerIdleDelegate::new(Duration::from_millis(10))));

        let idle_factory = ProbeFactory::new("quiet", &log);
        let mut first = ProbeFactory::new("first", &log);
        first.wants_idle = true;
        let first_count = first.given_idle.clone();
        let mut second = ProbeFactory::new("second", &log);
        second.wants_idle = true;
        let second_count = second.given_idle.clone();

        manager.add_factory(Box::new(idle_factory));
        manager.add_factory(Box::new(first));
        manager.add_factory(Box::new(second));
        assert!(manager.idle_requested());

        manager.next_idle().await;
        assert_eq!(first_count.load(Ordering::SeqCst), 1);
        assert_eq!(second_count.load(Ordering::SeqCst), 0);

        manager.next_idle().await;
        assert_eq!(second_count.load(Ordering::SeqCst), 1);
        assert!(!manager.idle_requested());

        assert!(
            timeout(Duration::from_millis(100), manager.next_idle())
                .await
                .is_err(),
            "nothing requested, nothing fires"
        );
    }
}
