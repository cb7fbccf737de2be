// Unless explicitly stated otherwise all files in this repository are licensed
// under the Apache License Version 2.0.
// This product includes software developed at Datadog (https://www.datadoghq.com/).
// Copyright 2026-present Datadog, Inc.

//! Remote transport protocol: commands sent from a controller to a launcher
//! and the events a launcher sends back, carried in [`frame`]s.

pub mod frame;

use crate::errors::{Error, Result};
use crate::info::ProcessInfo;
use crate::state::{BackendEvent, ExitStatus, ProcessError, ProcessState};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use frame::FrameBuffer;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlKey {
    #[serde(rename = "priority")]
    Priority,
    #[serde(rename = "oomAdjustment")]
    OomAdjustment,
}

/// Controller to launcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", rename_all = "lowercase")]
pub enum Command {
    Start {
        id: u32,
        spec: ProcessInfo,
    },
    Stop {
        id: u32,
        timeout: i64,
    },
    Set {
        id: u32,
        key: ControlKey,
        value: i64,
    },
    /// `data` is base64.
    Write {
        id: u32,
        data: String,
    },
    Memory {
        restricted: bool,
    },
    IdleCpuAvailable,
    Halt,
}

impl Command {
    pub fn write(id: u32, data: &[u8]) -> Self {
        Command::Write {
            id,
            data: encode_data(data),
        }
    }
}

/// Launcher to controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum Event {
    #[serde(rename = "started")]
    Started { id: u32, pid: u32 },
    #[serde(rename = "stateChanged")]
    StateChanged { id: u32, state: ProcessState },
    /// Either stream is base64 when present.
    #[serde(rename = "output")]
    Output {
        id: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stdout: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        stderr: Option<String>,
    },
    #[serde(rename = "finished")]
    Finished {
        id: u32,
        #[serde(rename = "exitCode")]
        exit_code: i32,
        #[serde(rename = "exitStatus")]
        exit_status: ExitStatus,
    },
    #[serde(rename = "error")]
    Error {
        id: u32,
        error: ProcessError,
        #[serde(rename = "errorString")]
        error_string: String,
    },
    #[serde(rename = "idlecpurequested")]
    IdleCpuRequested { request: bool },
    #[serde(rename = "internalprocesses")]
    InternalProcesses { pids: Vec<u32> },
    #[serde(rename = "internalprocesserror")]
    InternalProcessError { error: String },
}

impl Event {
    /// Tag a backend event with the id it belongs to.
    pub fn for_backend(id: u32, event: BackendEvent) -> Self {
        match event {
            BackendEvent::Started { pid } => Event::Started { id, pid },
            BackendEvent::StateChanged(state) => Event::StateChanged { id, state },
            BackendEvent::StandardOutput(data) => Event::Output {
                id,
                stdout: Some(encode_data(&data)),
                stderr: None,
            },
            BackendEvent::StandardError(data) => Event::Output {
                id,
                stdout: None,
                stderr: Some(encode_data(&data)),
            },
            BackendEvent::Finished {
                exit_code,
                exit_status,
            } => Event::Finished {
                id,
                exit_code,
                exit_status,
            },
            BackendEvent::Error { error, message } => Event::Error {
                id,
                error,
                error_string: message,
            },
        }
    }

    /// The backend this event is addressed to, `None` for control events.
    pub fn backend_id(&self) -> Option<u32> {
        match self {
            Event::Started { id, .. }
            | Event::StateChanged { id, .. }
            | Event::Output { id, .. }
            | Event::Finished { id, .. }
            | Event::Error { id, .. } => Some(*id),
            Event::IdleCpuRequested { .. }
            | Event::InternalProcesses { .. }
            | Event::InternalProcessError { .. } => None,
        }
    }

    /// Backend events carried by this event. An `output` event with both
    /// streams yields stdout first.
    pub fn into_backend_events(self) -> Result<Vec<BackendEvent>> {
        let events = match self {
            Event::Started { pid, .. } => vec![BackendEvent::Started { pid }],
            Event::StateChanged { state, .. } => vec![BackendEvent::StateChanged(state)],
            Event::Output { stdout, stderr, .. } => {
                let mut events = Vec::with_capacity(2);
                if let Some(data) = stdout {
                    events.push(BackendEvent::StandardOutput(decode_data(&data)?));
                }
                if let Some(data) = stderr {
                    events.push(BackendEvent::StandardError(decode_data(&data)?));
                }
                events
            }
            Event::Finished {
                exit_code,
                exit_status,
                ..
            } => vec![BackendEvent::Finished {
                exit_code,
                exit_status,
            }],
            Event::Error {
                error,
                error_string,
                ..
            } => vec![BackendEvent::Error {
                error,
                message: error_string,
            }],
            Event::IdleCpuRequested { .. }
            | Event::InternalProcesses { .. }
            | Event::InternalProcessError { .. } => Vec::new(),
        };
        Ok(events)
    }
}

pub fn encode_data(data: &[u8]) -> String {
    BASE64.encode(data)
}

pub fn decode_data(data: &str) -> Result<Vec<u8>> {
    BASE64.decode(data).map_err(|e| Error::InvalidValue {
        key: "data".to_string(),
        context: e.to_string(),
    })
}

/// Reads framed messages from an async byte stream.
pub struct FramedReader<R> {
    reader: R,
    buffer: FrameBuffer,
    chunk: Vec<u8>,
}

impl<R: AsyncRead + Unpin> FramedReader<R> {
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            buffer: FrameBuffer::new(),
            chunk: vec![0; 16 * 1024],
        }
    }

    /// Next decoded message, `Ok(None)` on a clean end of stream.
    ///
    /// Cancel safe: bytes already read stay buffered.
    pub async fn next<T: DeserializeOwned>(&mut self) -> Result<Option<T>> {
        loop {
            if let Some(frame) = self.buffer.next_frame()? {
                return Ok(Some(frame::decode(&frame)?));
            }
            let n = self.reader.read(&mut self.chunk).await?;
            if n == 0 {
                if self.buffer.pending() > 0 {
                    return Err(Error::BadFrameHeader {
                        context: format!(
                            "stream ended inside a frame ({} bytes pending)",
                            self.buffer.pending()
                        ),
                    });
                }
                return Ok(None);
            }
            self.buffer.extend(&self.chunk[..n]);
        }
    }
}

/// Encode `message` and write it as one frame.
pub async fn write_message<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let frame = frame::encode(message)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
}

#[allow(clippy::unwrap_used, clippy::panic)]
#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn round_trip_command(command: &Command) -> Command {
        let frame = frame::encode(command).unwrap();
        frame::decode(&frame).unwrap()
    }

    #[test]
    fn test_start_preserves_every_spec_key() {
        let mut spec = ProcessInfo::with_program("/bin/cat", &["-u"]);
        spec.insert_environment("LANG", "C");
        spec.set_priority(-5);
        spec.set_value("custom", json!({"list": [1, "two", true], "n": null}));

        let command = Command::Start { id: 101, spec };
        assert_eq!(round_trip_command(&command), command);
    }

    #[test]
    fn test_command_tags() {
        let value = rmp_serde::from_slice::<serde_json::Value>(
            &rmp_serde::to_vec_named(&Command::Halt).unwrap(),
        )
        .unwrap();
        assert_eq!(value, json!({"command": "halt"}));

        let value = rmp_serde::from_slice::<serde_json::Value>(
            &rmp_serde::to_vec_named(&Command::Set {
                id: 3,
                key: ControlKey::OomAdjustment,
                value: 500,
            })
            .unwrap(),
        )
        .unwrap();
        assert_eq!(
            value,
            json!({"command": "set", "id": 3, "key": "oomAdjustment", "value": 500})
        );

        assert_eq!(
            round_trip_command(&Command::IdleCpuAvailable),
            Command::IdleCpuAvailable
        );
    }

    #[test]
    fn test_event_field_names() {
        let event = Event::Finished {
            id: 7,
            exit_code: 0,
            exit_status: ExitStatus::NormalExit,
        };
        let value = rmp_serde::from_slice::<serde_json::Value>(
            &rmp_serde::to_vec_named(&event).unwrap(),
        )
        .unwrap();
        assert_eq!(
            value,
            json!({"event": "finished", "id": 7, "exitCode": 0, "exitStatus": "NormalExit"})
        );
    }

    #[test]
    fn test_output_event_carries_bytes() {
        let event = Event::for_backend(4, BackendEvent::StandardError(vec![0, 255, 10]));
        let frame = frame::encode(&event).unwrap();
        let decoded: Event = frame::decode(&frame).unwrap();
        assert_eq!(decoded.backend_id(), Some(4));
        assert_eq!(
            decoded.into_backend_events().unwrap(),
            vec![BackendEvent::StandardError(vec![0, 255, 10])]
        );
    }

    #[test]
    fn test_write_command_is_base64() {
        let Command::Write { data, .. } = Command::write(1, b"stop\n") else {
            panic!("not a write command");
        };
        assert_eq!(data, "c3RvcAo=");
        assert_eq!(decode_data(&data).unwrap(), b"stop\n");
        assert!(decode_data("***").is_err());
    }

    #[tokio::test]
    async fn test_framed_reader_over_split_writes() {
        let (mut tx, rx) = tokio::io::duplex(8);
        let mut reader = FramedReader::new(rx);

        let writer = tokio::spawn(async move {
            write_message(&mut tx, &Event::Started { id: 1, pid: 42 })
                .await
                .unwrap();
            write_message(&mut tx, &Event::IdleCpuRequested { request: true })
                .await
                .unwrap();
        });

        let first: Event = reader.next().await.unwrap().unwrap();
        let second: Event = reader.next().await.unwrap().unwrap();
        writer.await.unwrap();
        assert_eq!(first, Event::Started { id: 1, pid: 42 });
        assert_eq!(second, Event::IdleCpuRequested { request: true });
        assert!(reader.next::<Event>().await.unwrap().is_none());
    }
}
