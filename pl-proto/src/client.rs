//! `SimClient`: blocking request/reply session with one simulator instance.
//!
//! The session is strictly synchronous: one outstanding sync event at a time,
//! commands are allowed while it is outstanding, and the event must be
//! acknowledged before the next one can be awaited.

use std::io::{self, Write as _};
use std::net::{Shutdown, SocketAddr, TcpStream, ToSocketAddrs};
use std::time::Duration;

use pl_core::InputState;
use thiserror::Error;

use crate::codec::{encode_ack, encode_command_into, read_event};
use crate::protocol::{Command, Event, FrameRequest, MessageType};
use crate::snapshot::{SimulationSnapshot, SnapshotError};
use crate::wire::{MessageReader, WireError};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connect failed: {0}")]
    Connect(io::Error),
    #[error("wire error: {0}")]
    Wire(#[from] WireError),
    #[error("malformed simulation state: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("sync event {0:?} is still unacknowledged")]
    Unacknowledged(MessageType),
    #[error("no sync event to acknowledge")]
    NothingToAck,
    #[error("expected {expected:?}, got {got:?}")]
    UnexpectedEvent {
        expected: MessageType,
        got: MessageType,
    },
    #[error("session closed")]
    Closed,
}

/// Coarse error class used by callers to choose between retry and reconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Recoverable: abort the episode, keep the session.
    Timeout,
    /// Fatal for the session: reconnect.
    Connection,
    /// Fatal for the session: the stream can no longer be trusted.
    Protocol,
}

impl ClientError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ClientError::Wire(WireError::Timeout) => ErrorClass::Timeout,
            ClientError::Connect(_)
            | ClientError::Closed
            | ClientError::Wire(WireError::ConnectionLost(_))
            | ClientError::Wire(WireError::Io(_)) => ErrorClass::Connection,
            _ => ErrorClass::Protocol,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.class() != ErrorClass::Timeout
    }
}

#[derive(Debug)]
pub struct SimClient {
    stream: TcpStream,
    registered: bool,
    timeout: Option<Duration>,
    pending: Option<MessageType>,
    frame_request: Option<FrameRequest>,
    last_step_ms: i32,
    closed: bool,
    out: Vec<u8>,
}

impl SimClient {
    pub fn connect<A: ToSocketAddrs>(
        addr: A,
        timeout: Option<Duration>,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr).map_err(ClientError::Connect)?;
        Self::from_stream(stream, timeout)
    }

    /// Like [`SimClient::connect`] but bounds the connect itself.
    pub fn connect_with_timeout(
        addr: &SocketAddr,
        connect_timeout: Duration,
        timeout: Option<Duration>,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect_timeout(addr, connect_timeout).map_err(ClientError::Connect)?;
        Self::from_stream(stream, timeout)
    }

    fn from_stream(stream: TcpStream, timeout: Option<Duration>) -> Result<Self, ClientError> {
        stream.set_nodelay(true).ok();
        stream.set_read_timeout(timeout).map_err(ClientError::Connect)?;
        stream.set_write_timeout(timeout).map_err(ClientError::Connect)?;
        Ok(Self {
            stream,
            registered: false,
            timeout,
            pending: None,
            frame_request: None,
            last_step_ms: 0,
            closed: false,
            out: Vec::with_capacity(64),
        })
    }

    /// Wait for the simulator's on-connect event, configure the session and acknowledge.
    pub fn register(&mut self, simulator_timeout_ms: u32, step_period_ms: u32) -> Result<(), ClientError> {
        match self.await_event()? {
            Event::OnConnect => {}
            other => {
                return Err(ClientError::UnexpectedEvent {
                    expected: MessageType::OnConnectSync,
                    got: other.tag(),
                })
            }
        }
        self.set_timeout(simulator_timeout_ms)?;
        self.set_on_step_period(step_period_ms)?;
        self.ack()?;
        self.registered = true;
        Ok(())
    }

    pub fn is_registered(&self) -> bool {
        self.registered
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn pending_event(&self) -> Option<MessageType> {
        self.pending
    }

    pub fn frame_request(&self) -> Option<FrameRequest> {
        self.frame_request
    }

    /// Block until the next sync event. The previous one must have been acknowledged.
    pub fn await_event(&mut self) -> Result<Event, ClientError> {
        if self.closed {
            return Err(ClientError::Closed);
        }
        if let Some(tag) = self.pending {
            return Err(ClientError::Unacknowledged(tag));
        }
        let mut ev = read_event(&mut self.stream, self.frame_request)?;
        match &mut ev {
            Event::RunStep { time_ms } => self.last_step_ms = *time_ms,
            Event::FrameReady(frame) => frame.step = self.last_step_ms,
            _ => {}
        }
        self.pending = Some(ev.tag());
        Ok(ev)
    }

    /// Release the simulator from the outstanding sync event.
    pub fn ack(&mut self) -> Result<(), ClientError> {
        let tag = self.pending.take().ok_or(ClientError::NothingToAck)?;
        self.write(&encode_ack(tag))
    }

    pub fn send(&mut self, cmd: &Command) -> Result<(), ClientError> {
        if self.closed {
            return Err(ClientError::Closed);
        }
        let mut out = std::mem::take(&mut self.out);
        encode_command_into(&mut out, cmd);
        let res = self.write(&out);
        self.out = out;
        res?;
        match cmd {
            Command::RequestFrame { width, height } => {
                self.frame_request = Some(FrameRequest {
                    width: *width,
                    height: *height,
                })
            }
            Command::UnrequestFrame => self.frame_request = None,
            _ => {}
        }
        Ok(())
    }

    fn write(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        self.stream
            .write_all(bytes)
            .map_err(|e| ClientError::Wire(WireError::from_write(e)))
    }

    pub fn set_speed(&mut self, speed: f32) -> Result<(), ClientError> {
        self.send(&Command::SetSpeed(speed))
    }

    pub fn rewind_to_state(&mut self, state: &SimulationSnapshot) -> Result<(), ClientError> {
        self.send(&Command::RewindToState(state.raw().to_vec()))
    }

    pub fn rewind_to_current_state(&mut self) -> Result<(), ClientError> {
        self.send(&Command::RewindToCurrentState)
    }

    pub fn get_simulation_state(&mut self) -> Result<SimulationSnapshot, ClientError> {
        self.send(&Command::GetSimulationState)?;
        let raw = MessageReader::new(&mut self.stream)
            .read_blob()
            .map_err(response_error)?;
        Ok(SimulationSnapshot::parse(raw)?)
    }

    pub fn set_input_state(&mut self, inputs: InputState) -> Result<(), ClientError> {
        self.send(&Command::SetInputState(inputs))
    }

    pub fn give_up(&mut self) -> Result<(), ClientError> {
        self.send(&Command::GiveUp)
    }

    pub fn prevent_simulation_finish(&mut self) -> Result<(), ClientError> {
        self.send(&Command::PreventSimulationFinish)
    }

    pub fn execute_command(&mut self, command: &str) -> Result<(), ClientError> {
        self.send(&Command::ExecuteCommand(command.to_string()))
    }

    pub fn set_timeout(&mut self, timeout_ms: u32) -> Result<(), ClientError> {
        self.send(&Command::SetTimeout(timeout_ms))
    }

    pub fn race_finished(&mut self) -> Result<bool, ClientError> {
        self.send(&Command::RaceFinished)?;
        let v = MessageReader::new(&mut self.stream)
            .read_i32()
            .map_err(response_error)?;
        Ok(v != 0)
    }

    pub fn request_frame(&mut self, width: u32, height: u32) -> Result<(), ClientError> {
        self.send(&Command::RequestFrame { width, height })
    }

    pub fn unrequest_frame(&mut self) -> Result<(), ClientError> {
        self.send(&Command::UnrequestFrame)
    }

    pub fn reset_camera(&mut self) -> Result<(), ClientError> {
        self.send(&Command::ResetCamera)
    }

    pub fn set_on_step_period(&mut self, period_ms: u32) -> Result<(), ClientError> {
        self.send(&Command::SetOnStepPeriod(period_ms))
    }

    /// Send `shutdown` and close the socket. Idempotent.
    pub fn close(&mut self) -> Result<(), ClientError> {
        if self.closed {
            return Ok(());
        }
        let res = self.send(&Command::Shutdown);
        self.closed = true;
        self.pending = None;
        let _ = self.stream.shutdown(Shutdown::Both);
        res
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

/// A response that never arrives leaves the stream out of step with us.
fn response_error(e: WireError) -> ClientError {
    match e {
        WireError::Timeout => ClientError::Wire(WireError::Truncated { got: 0, want: 4 }),
        other => ClientError::Wire(other),
    }
}

impl Drop for SimClient {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
