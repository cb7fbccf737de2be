// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use super::{FactoryDelegates, ProcessBackendFactory};
use crate::backend::{ProcessBackend, RemoteProcessBackend};
use crate::errors::{Error, Result};
use crate::info::ProcessInfo;
use crate::prefork::Prefork;
use crate::protocol::Command;
use crate::remote::RemoteConnection;
use log::{debug, info, warn};
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio::net::unix::pipe;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

/// Ids handed to remote backends start here, per connection.
pub const FIRST_REMOTE_ID: u32 = 101;

/// Creates backends that run behind a launcher: a child process on a pipe, a
/// Unix socket, or a prefork helper.
pub struct RemoteFactory {
    name: String,
    delegates: FactoryDelegates,
    connection: RemoteConnection,
    next_id: u32,
    /// Launcher processes this factory owns.
    launcher_pids: Vec<u32>,
    watcher: Option<JoinHandle<()>>,
}

impl RemoteFactory {
    /// Speak the protocol over `reader`/`writer`.
    pub fn from_streams<R, W>(name: &str, reader: R, writer: W) -> Self
    where
        R: tokio::io::AsyncRead + Unpin + Send + 'static,
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        Self {
            name: name.to_string(),
            delegates: FactoryDelegates::default(),
            connection: RemoteConnection::spawn(name, reader, writer),
            next_id: FIRST_REMOTE_ID,
            launcher_pids: Vec::new(),
            watcher: None,
        }
    }

    /// Start `program` as a launcher on stdin/stdout.
    pub fn pipe(program: &str, arguments: &[String]) -> Result<Self> {
        let mut child = tokio::process::Command::new(program)
            .args(arguments)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;
        let missing = || Error::Io(io::Error::other("launcher pipes unavailable"));
        let stdin = child.stdin.take().ok_or_else(missing)?;
        let stdout = child.stdout.take().ok_or_else(missing)?;
        let pid = child.id();

        let name = format!("pipe:{program}");
        info!("[{name}] launcher started (pid={})", pid.unwrap_or(0));
        let label = name.clone();
        // Closing stdin halts the launcher; reap it once it is gone.
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => info!("[{label}] launcher exited: {status}"),
                Err(e) => warn!("[{label}] failed to wait for launcher: {e}"),
            }
        });

        let mut factory = Self::from_streams(&name, stdout, stdin);
        factory.launcher_pids.extend(pid);
        Ok(factory)
    }

    /// Connect to a launcher listening on `path`.
    pub async fn socket(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path).await?;
        let (reader, writer) = stream.into_split();
        Ok(Self::from_streams(
            &format!("socket:{}", path.display()),
            reader,
            writer,
        ))
    }

    /// Talk to prefork helper `index`.
    pub fn prefork(prefork: &Prefork, index: usize) -> Result<Self> {
        let helper = prefork.helper(index).ok_or_else(|| Error::PreforkLayout {
            context: format!(
                "no helper #{index}, the group has {}",
                prefork.helpers().len()
            ),
        })?;
        let writer = pipe::Sender::from_owned_fd(duplicate(helper.input)?)?;
        let reader = pipe::Receiver::from_owned_fd(duplicate(helper.output)?)?;
        let mut factory = Self::from_streams(&format!("prefork:{index}"), reader, writer);
        factory.launcher_pids.push(helper.pid);
        Ok(factory)
    }

    pub fn with_delegates(mut self, delegates: FactoryDelegates) -> Self {
        self.delegates = delegates;
        self
    }

    pub fn connection(&self) -> &RemoteConnection {
        &self.connection
    }
}

/// Own a copy of an inherited descriptor, leaving the original untouched.
fn duplicate(fd: RawFd) -> Result<OwnedFd> {
    // SAFETY: dup only reads the descriptor number.
    let copy = unsafe { libc::dup(fd) };
    if copy < 0 {
        return Err(io::Error::last_os_error().into());
    }
    // SAFETY: `copy` is a fresh descriptor nothing else owns.
    Ok(unsafe { OwnedFd::from_raw_fd(copy) })
}

impl ProcessBackendFactory for RemoteFactory {
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
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(FIRST_REMOTE_ID);
        debug!("[{}] remote backend {id} for {}", self.name, info.label());
        Some(Box::new(RemoteProcessBackend::new(
            id,
            info,
            self.connection.clone(),
        )))
    }

    fn set_memory_restricted(&mut self, restricted: bool) {
        self.connection.send(Command::Memory { restricted });
    }

    fn idle_cpu_requested(&self) -> bool {
        let status = self.connection.status();
        status.connected && status.idle_requested
    }

    fn idle_cpu_available(&mut self) {
        self.connection.send(Command::IdleCpuAvailable);
    }

    fn internal_processes(&self) -> Result<Vec<u32>> {
        let status = self.connection.status();
        if !status.connected {
            return Err(Error::ConnectionLost(self.name.clone()));
        }
        if let Some(error) = status.internal_error {
            return Err(Error::RemoteInternalProcesses(error));
        }
        let mut pids = self.launcher_pids.clone();
        pids.extend(status.internal_pids);
        Ok(pids)
    }

    fn set_idle_notifier(&mut self, notify: Arc<Notify>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(
                "[{}] no runtime, launcher idle requests will not be noticed",
                self.name
            );
            return;
        };
        let mut status = self.connection.watch();
        let watcher = runtime.spawn(async move {
            while status.changed().await.is_ok() {
                notify.notify_one();
            }
        });
        if let Some(previous) = self.watcher.replace(watcher) {
            previous.abort();
        }
    }
}

impl Drop for RemoteFactory {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::idle::TimerIdleDelegate;
    use crate::manager::BackendManager;
    use crate::protocol::{Event, FramedReader, write_message};
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf, duplex, split};
    use tokio::time::{Duration, timeout};

    struct FakeLauncher {
        reader: FramedReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeLauncher {
        async fn command(&mut self) -> Command {
            timeout(Duration::from_secs(5), self.reader.next::<Command>())
                .await
                .unwrap()
                .unwrap()
                .unwrap()
        }

        async fn send(&mut self, event: Event) {
            write_message(&mut self.writer, &event).await.unwrap();
        }
    }

    fn factory() -> (RemoteFactory, FakeLauncher) {
        let (ours, theirs) = duplex(64 * 1024);
        let (reader, writer) = split(ours);
        let factory = RemoteFactory::from_streams("fake", reader, writer);
        let (reader, writer) = split(theirs);
        (
            factory,
            FakeLauncher {
                reader: FramedReader::new(reader),
                writer,
            },
        )
    }

    #[tokio::test]
    async fn test_ids_start_at_first_remote_id() {
        let (mut factory, mut launcher) = factory();
        let mut first = factory
            .create(ProcessInfo::with_program("/bin/true", &[]))
            .unwrap();
        let mut second = factory
            .create(ProcessInfo::with_program("/bin/true", &[]))
            .unwrap();
        assert_eq!(first.id(), FIRST_REMOTE_ID);
        assert_eq!(second.id(), FIRST_REMOTE_ID + 1);

        first.start();
        second.start();
        assert!(matches!(launcher.command().await, Command::Start { id: 101, .. }));
        assert!(matches!(launcher.command().await, Command::Start { id: 102, .. }));
    }

    #[tokio::test]
    async fn test_manager_sees_launcher_idle_requests() {
        let (factory, mut launcher) = factory();
        let mut manager =
            BackendManager::new(Box::new(TimerIdleDelegate::new(Duration::from_millis(10))));
        manager.add_factory(Box::new(factory));
        assert!(!manager.idle_requested());

        launcher
            .send(Event::IdleCpuRequested { request: true })
            .await;
        timeout(Duration::from_secs(5), async {
            while !manager.idle_requested() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        // The timer delegate fires and the offer goes to the launcher.
        timeout(Duration::from_secs(5), manager.next_idle())
            .await
            .unwrap();
        assert_eq!(launcher.command().await, Command::IdleCpuAvailable);

        manager.set_memory_restricted(true);
        assert_eq!(
            launcher.command().await,
            Command::Memory { restricted: true }
        );
    }

    #[tokio::test]
    async fn test_internal_processes_follow_launcher() {
        let (factory, mut launcher) = factory();
        let mut watch = factory.connection().watch();
        assert_eq!(factory.internal_processes().unwrap(), Vec::<u32>::new());

        launcher
            .send(Event::InternalProcesses { pids: vec![31, 32] })
            .await;
        timeout(Duration::from_secs(5), watch.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(factory.internal_processes().unwrap(), vec![31, 32]);

        launcher
            .send(Event::InternalProcessError {
                error: "boom".to_string(),
            })
            .await;
        timeout(Duration::from_secs(5), watch.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            factory.internal_processes(),
            Err(Error::RemoteInternalProcesses(_))
        ));

        drop(launcher);
        timeout(Duration::from_secs(5), watch.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(
            factory.internal_processes(),
            Err(Error::ConnectionLost(_))
        ));
    }
}
