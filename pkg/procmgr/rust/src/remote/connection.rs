// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

use crate::backend::BackendId;
use crate::protocol::{Command, Event, FramedReader, write_message};
use crate::state::{BackendEvent, ExitStatus, ProcessError, ProcessState, RunTracker};
use log::{debug, info, warn};
use std::collections::HashMap;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};

const CONNECTION_LOST: &str = "launcher connection lost";

/// What the controller knows about the launcher on the other end.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteStatus {
    pub connected: bool,
    /// Last `idlecpurequested` value.
    pub idle_requested: bool,
    /// Last `internalprocesses` list.
    pub internal_pids: Vec<u32>,
    /// Last `internalprocesserror`, cleared by the next list.
    pub internal_error: Option<String>,
}

pub(crate) enum Request {
    Register {
        id: BackendId,
        events: mpsc::UnboundedSender<BackendEvent>,
    },
    Unregister {
        id: BackendId,
    },
    Send(Command),
}

/// Handle on one launcher connection.
///
/// A background task owns the stream: it writes commands, routes incoming
/// events to registered backends by id and keeps [`RemoteStatus`] current.
/// When the last handle is dropped the task sends `halt` and closes the
/// stream.
#[derive(Clone)]
pub struct RemoteConnection {
    requests: mpsc::UnboundedSender<Request>,
    status: watch::Receiver<RemoteStatus>,
}

impl RemoteConnection {
    /// Take over `reader`/`writer` and start routing. Must be called inside a
    /// tokio runtime.
    pub fn spawn<R, W>(label: &str, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(RemoteStatus {
            connected: true,
            ..RemoteStatus::default()
        });
        let router = Router {
            label: label.to_string(),
            routes: HashMap::new(),
            status: status_tx,
        };
        tokio::spawn(router.run(FramedReader::new(reader), writer, requests_rx));
        Self {
            requests: requests_tx,
            status: status_rx,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status.borrow().connected
    }

    pub fn status(&self) -> RemoteStatus {
        self.status.borrow().clone()
    }

    /// Receiver that wakes on every status change.
    pub fn watch(&self) -> watch::Receiver<RemoteStatus> {
        self.status.clone()
    }

    /// Queue `command` for the launcher. False once the connection task is
    /// gone.
    pub fn send(&self, command: Command) -> bool {
        self.is_connected() && self.requests.send(Request::Send(command)).is_ok()
    }

    pub(crate) fn register(
        &self,
        id: BackendId,
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> bool {
        self.requests.send(Request::Register { id, events }).is_ok()
    }

    pub(crate) fn unregister(&self, id: BackendId) {
        let _ = self.requests.send(Request::Unregister { id });
    }
}

/// A registered backend and where its current run stands.
struct Route {
    events: mpsc::UnboundedSender<BackendEvent>,
    run: RunTracker,
}

impl Route {
    fn new(events: mpsc::UnboundedSender<BackendEvent>) -> Self {
        Self {
            events,
            run: RunTracker::default(),
        }
    }

    /// End the run locally: the launcher can no longer report on it.
    fn fail(&self) {
        let _ = self.events.send(BackendEvent::Error {
            error: ProcessError::UnknownError,
            message: CONNECTION_LOST.to_string(),
        });
        let _ = self
            .events
            .send(BackendEvent::StateChanged(ProcessState::NotRunning));
        if self.run.spawned() {
            let _ = self.events.send(BackendEvent::Finished {
                exit_code: -1,
                exit_status: ExitStatus::CrashExit,
            });
        }
    }
}

struct Router {
    label: String,
    routes: HashMap<BackendId, Route>,
    status: watch::Sender<RemoteStatus>,
}

impl Router {
    async fn run<R, W>(
        mut self,
        mut reader: FramedReader<R>,
        mut writer: W,
        mut requests: mpsc::UnboundedReceiver<Request>,
    ) where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            tokio::select! {
                request = requests.recv() => match request {
                    Some(Request::Register { id, events }) => {
                        if self.routes.insert(id, Route::new(events)).is_some() {
                            warn!("[{}] backend {id} registered twice", self.label);
                        }
                    }
                    Some(Request::Unregister { id }) => {
                        self.routes.remove(&id);
                    }
                    Some(Request::Send(command)) => {
                        if let Err(e) = write_message(&mut writer, &command).await {
                            warn!("[{}] failed to send command: {e}", self.label);
                            break;
                        }
                    }
                    None => {
                        debug!("[{}] no handles left, halting launcher", self.label);
                        if let Err(e) = write_message(&mut writer, &Command::Halt).await {
                            debug!("[{}] failed to send halt: {e}", self.label);
                        }
                        return;
                    }
                },
                event = reader.next::<Event>() => match event {
                    Ok(Some(event)) => self.route(event),
                    Ok(None) => {
                        info!("[{}] launcher closed the connection", self.label);
                        break;
                    }
                    Err(e) => {
                        warn!("[{}] launcher connection failed: {e}", self.label);
                        break;
                    }
                },
            }
        }

        self.status.send_modify(|status| status.connected = false);
        for (id, route) in self.routes.drain() {
            debug!("[{}] failing backend {id}", self.label);
            route.fail();
        }
        // Late registrations fail right away.
        while let Some(request) = requests.recv().await {
            if let Request::Register { events, .. } = request {
                Route::new(events).fail();
            }
        }
    }

    fn route(&mut self, event: Event) {
        match event {
            Event::IdleCpuRequested { request } => {
                self.status.send_if_modified(|status| {
                    let changed = status.idle_requested != request;
                    status.idle_requested = request;
                    changed
                });
            }
            Event::InternalProcesses { pids } => {
                self.status.send_if_modified(|status| {
                    let changed = status.internal_pids != pids || status.internal_error.is_some();
                    status.internal_pids = pids;
                    status.internal_error = None;
                    changed
                });
            }
            Event::InternalProcessError { error } => {
                warn!("[{}] launcher internal processes: {error}", self.label);
                self.status
                    .send_modify(|status| status.internal_error = Some(error));
            }
            event => {
                let Some(id) = event.backend_id() else {
                    return;
                };
                let Some(route) = self.routes.get_mut(&id) else {
                    debug!("[{}] dropping event for unknown backend {id}", self.label);
                    return;
                };
                let decoded = match event.into_backend_events() {
                    Ok(decoded) => decoded,
                    Err(e) => {
                        warn!("[{}] bad event for backend {id}: {e}", self.label);
                        return;
                    }
                };
                let mut last = false;
                for event in decoded {
                    last = route.run.ends_run(&event);
                    let _ = route.events.send(event);
                }
                if last {
                    self.routes.remove(&id);
                }
            }
        }
    }
}

#[allow(clippy::unwrap_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{DuplexStream, ReadHalf, WriteHalf, duplex, split};
    use tokio::time::{Duration, timeout};

    /// The launcher side of an in-memory connection.
    struct FakeLauncher {
        reader: FramedReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl FakeLauncher {
        async fn command(&mut self) -> Option<Command> {
            timeout(Duration::from_secs(5), self.reader.next::<Command>())
                .await
                .unwrap()
                .unwrap()
        }

        async fn send(&mut self, event: Event) {
            write_message(&mut self.writer, &event).await.unwrap();
        }
    }

    fn connect() -> (RemoteConnection, FakeLauncher) {
        let (ours, theirs) = duplex(64 * 1024);
        let (reader, writer) = split(ours);
        let connection = RemoteConnection::spawn("test", reader, writer);
        let (reader, writer) = split(theirs);
        (
            connection,
            FakeLauncher {
                reader: FramedReader::new(reader),
                writer,
            },
        )
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<BackendEvent>) -> BackendEvent {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_events_are_routed_by_id() {
        let (connection, mut launcher) = connect();
        let (a_tx, mut a_rx) = mpsc::unbounded_channel();
        let (b_tx, mut b_rx) = mpsc::unbounded_channel();
        assert!(connection.register(1, a_tx));
        assert!(connection.register(2, b_tx));
        assert!(connection.send(Command::Halt));
        assert_eq!(launcher.command().await, Some(Command::Halt));

        launcher.send(Event::Started { id: 2, pid: 20 }).await;
        launcher.send(Event::Started { id: 1, pid: 10 }).await;
        launcher
            .send(Event::Finished {
                id: 1,
                exit_code: 0,
                exit_status: ExitStatus::NormalExit,
            })
            .await;
        launcher
            .send(Event::StateChanged {
                id: 1,
                state: ProcessState::Running,
            })
            .await;

        assert_eq!(recv(&mut a_rx).await, BackendEvent::Started { pid: 10 });
        assert!(recv(&mut a_rx).await.is_finished());
        assert_eq!(recv(&mut b_rx).await, BackendEvent::Started { pid: 20 });
        // Nothing follows finished for id 1.
        assert!(
            timeout(Duration::from_millis(100), a_rx.recv())
                .await
                .map(|e| e.is_none())
                .unwrap_or(true)
        );
    }

    #[tokio::test]
    async fn test_control_events_update_status() {
        let (connection, mut launcher) = connect();
        let mut watch = connection.watch();
        launcher
            .send(Event::IdleCpuRequested { request: true })
            .await;
        timeout(Duration::from_secs(5), watch.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(connection.status().idle_requested);

        launcher
            .send(Event::InternalProcesses { pids: vec![5, 6] })
            .await;
        timeout(Duration::from_secs(5), watch.changed())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(connection.status().internal_pids, vec![5, 6]);
    }

    #[tokio::test]
    async fn test_lost_connection_fails_live_backends() {
        let (connection, launcher) = connect();
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(connection.register(9, tx));
        drop(launcher);

        assert_eq!(
            recv(&mut rx).await,
            BackendEvent::Error {
                error: ProcessError::UnknownError,
                message: CONNECTION_LOST.to_string(),
            }
        );
        assert_eq!(
            recv(&mut rx).await,
            BackendEvent::StateChanged(ProcessState::NotRunning)
        );
        assert!(!connection.is_connected());
        assert!(!connection.send(Command::Halt));

        let (late_tx, mut late_rx) = mpsc::unbounded_channel();
        connection.register(10, late_tx);
        assert!(matches!(
            recv(&mut late_rx).await,
            BackendEvent::Error {
                error: ProcessError::UnknownError,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_failed_start_ends_the_route() {
        let (connection, mut launcher) = connect();
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(connection.register(3, tx));
        launcher
            .send(Event::StateChanged {
                id: 3,
                state: ProcessState::Starting,
            })
            .await;
        launcher
            .send(Event::for_backend(3, BackendEvent::error(ProcessError::FailedToStart)))
            .await;
        launcher
            .send(Event::StateChanged {
                id: 3,
                state: ProcessState::NotRunning,
            })
            .await;

        recv(&mut rx).await;
        recv(&mut rx).await;
        assert_eq!(
            recv(&mut rx).await,
            BackendEvent::StateChanged(ProcessState::NotRunning)
        );
        // The route let go of its sender.
        assert_eq!(
            timeout(Duration::from_secs(5), rx.recv()).await.unwrap(),
            None
        );

        let (again_tx, mut again_rx) = mpsc::unbounded_channel();
        assert!(connection.register(3, again_tx));
        launcher.send(Event::Started { id: 3, pid: 33 }).await;
        assert_eq!(recv(&mut again_rx).await, BackendEvent::Started { pid: 33 });
    }

    #[tokio::test]
    async fn test_lost_connection_finishes_spawned_backends() {
        let (connection, mut launcher) = connect();
        let (tx, mut rx) = mpsc::unbounded_channel();
        assert!(connection.register(4, tx));
        launcher.send(Event::Started { id: 4, pid: 44 }).await;
        assert_eq!(recv(&mut rx).await, BackendEvent::Started { pid: 44 });
        drop(launcher);

        assert!(matches!(
            recv(&mut rx).await,
            BackendEvent::Error {
                error: ProcessError::UnknownError,
                ..
            }
        ));
        assert_eq!(
            recv(&mut rx).await,
            BackendEvent::StateChanged(ProcessState::NotRunning)
        );
        assert_eq!(
            recv(&mut rx).await,
            BackendEvent::Finished {
                exit_code: -1,
                exit_status: ExitStatus::CrashExit
            }
        );
    }

    #[tokio::test]
    async fn test_last_handle_sends_halt() {
        let (connection, mut launcher) = connect();
        let copy = connection.clone();
        drop(connection);
        drop(copy);
        assert_eq!(launcher.command().await, Some(Command::Halt));
        assert_eq!(launcher.command().await, None);
    }
}
