//! Simulator protocol definitions.
//!
//! Every message starts with a little-endian `i32` tag. Sync events flow
//! simulator -> client and block the simulator until the client writes the
//! same tag back; commands flow client -> simulator.

use pl_core::InputState;

use crate::wire::WireError;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8477;

/// Guardrail for length-prefixed payloads (state blobs, command text, frames).
pub const MAX_PAYLOAD_LEN: u32 = 64 * 1024 * 1024;

/// Closed set of message tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageType {
    RunStepSync = 1,
    CheckpointCountChangedSync = 2,
    LapCountChangedSync = 3,
    RequestedFrameSync = 4,
    OnConnectSync = 5,
    SetSpeed = 6,
    RewindToState = 7,
    RewindToCurrentState = 8,
    GetSimulationState = 9,
    SetInputState = 10,
    GiveUp = 11,
    PreventSimulationFinish = 12,
    Shutdown = 13,
    ExecuteCommand = 14,
    SetTimeout = 15,
    RaceFinished = 16,
    RequestFrame = 17,
    ResetCamera = 18,
    SetOnStepPeriod = 19,
    UnrequestFrame = 20,
}

impl MessageType {
    pub fn from_i32(tag: i32) -> Option<Self> {
        use MessageType::*;
        Some(match tag {
            1 => RunStepSync,
            2 => CheckpointCountChangedSync,
            3 => LapCountChangedSync,
            4 => RequestedFrameSync,
            5 => OnConnectSync,
            6 => SetSpeed,
            7 => RewindToState,
            8 => RewindToCurrentState,
            9 => GetSimulationState,
            10 => SetInputState,
            11 => GiveUp,
            12 => PreventSimulationFinish,
            13 => Shutdown,
            14 => ExecuteCommand,
            15 => SetTimeout,
            16 => RaceFinished,
            17 => RequestFrame,
            18 => ResetCamera,
            19 => SetOnStepPeriod,
            20 => UnrequestFrame,
            _ => return None,
        })
    }

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Simulator-initiated and waiting for an acknowledgment.
    pub fn is_sync_event(self) -> bool {
        (self as i32) <= MessageType::OnConnectSync as i32
    }
}

/// Raw BGRA8 pixels delivered for an outstanding frame request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Engine time of the run-step that preceded delivery; filled in by the session,
    /// not carried on the wire.
    pub step: i32,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn byte_len(width: u32, height: u32) -> usize {
        width as usize * height as usize * 4
    }

    /// Payload size of a `width x height` frame, or `TooLarge` past [`MAX_PAYLOAD_LEN`].
    pub fn checked_byte_len(width: u32, height: u32) -> Result<usize, WireError> {
        let len = u64::from(width)
            .saturating_mul(u64::from(height))
            .saturating_mul(4);
        if len > u64::from(MAX_PAYLOAD_LEN) {
            return Err(WireError::TooLarge {
                len,
                max: MAX_PAYLOAD_LEN,
            });
        }
        Ok(len as usize)
    }
}

/// Dimensions of the currently requested frame, needed to size a frame-ready payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRequest {
    pub width: u32,
    pub height: u32,
}

/// Simulator -> client sync events.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    RunStep { time_ms: i32 },
    CheckpointCountChanged { current: i32, target: i32 },
    LapCountChanged { current: i32, target: i32 },
    FrameReady(Frame),
    OnConnect,
}

impl Event {
    pub fn tag(&self) -> MessageType {
        match self {
            Event::RunStep { .. } => MessageType::RunStepSync,
            Event::CheckpointCountChanged { .. } => MessageType::CheckpointCountChangedSync,
            Event::LapCountChanged { .. } => MessageType::LapCountChangedSync,
            Event::FrameReady(_) => MessageType::RequestedFrameSync,
            Event::OnConnect => MessageType::OnConnectSync,
        }
    }
}

/// Client -> simulator commands.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    SetSpeed(f32),
    RewindToState(Vec<u8>),
    RewindToCurrentState,
    /// Response: `i32` length + state bytes.
    GetSimulationState,
    SetInputState(InputState),
    GiveUp,
    PreventSimulationFinish,
    Shutdown,
    ExecuteCommand(String),
    SetTimeout(u32),
    /// Response: `i32`, nonzero when the race is finished.
    RaceFinished,
    RequestFrame { width: u32, height: u32 },
    ResetCamera,
    SetOnStepPeriod(u32),
    UnrequestFrame,
}

impl Command {
    pub fn tag(&self) -> MessageType {
        match self {
            Command::SetSpeed(_) => MessageType::SetSpeed,
            Command::RewindToState(_) => MessageType::RewindToState,
            Command::RewindToCurrentState => MessageType::RewindToCurrentState,
            Command::GetSimulationState => MessageType::GetSimulationState,
            Command::SetInputState(_) => MessageType::SetInputState,
            Command::GiveUp => MessageType::GiveUp,
            Command::PreventSimulationFinish => MessageType::PreventSimulationFinish,
            Command::Shutdown => MessageType::Shutdown,
            Command::ExecuteCommand(_) => MessageType::ExecuteCommand,
            Command::SetTimeout(_) => MessageType::SetTimeout,
            Command::RaceFinished => MessageType::RaceFinished,
            Command::RequestFrame { .. } => MessageType::RequestFrame,
            Command::ResetCamera => MessageType::ResetCamera,
            Command::SetOnStepPeriod(_) => MessageType::SetOnStepPeriod,
            Command::UnrequestFrame => MessageType::UnrequestFrame,
        }
    }

    /// The simulator answers this command with a payload the client must read.
    pub fn has_response(&self) -> bool {
        matches!(self, Command::GetSimulationState | Command::RaceFinished)
    }
}
