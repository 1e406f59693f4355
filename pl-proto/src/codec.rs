//! Binary codec for commands, events and command responses.
//!
//! Encoders build one contiguous buffer per message so a session can send it
//! with a single write. Decoders read straight from the stream through
//! [`MessageReader`] because payload sizes are only known from their headers.

use std::io::Read;

use pl_core::InputState;

use crate::protocol::{Command, Event, Frame, FrameRequest, MessageType};
use crate::wire::{check_len, MessageReader, WireError};

fn put_i32(out: &mut Vec<u8>, v: i32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_tag(out: &mut Vec<u8>, tag: MessageType) {
    put_i32(out, tag.as_i32());
}

fn put_blob(out: &mut Vec<u8>, bytes: &[u8]) {
    put_i32(out, bytes.len() as i32);
    out.extend_from_slice(bytes);
}

pub fn encode_command(cmd: &Command) -> Vec<u8> {
    let mut out = Vec::with_capacity(16);
    encode_command_into(&mut out, cmd);
    out
}

pub fn encode_command_into(out: &mut Vec<u8>, cmd: &Command) {
    out.clear();
    put_tag(out, cmd.tag());
    match cmd {
        Command::SetSpeed(speed) => out.extend_from_slice(&speed.to_le_bytes()),
        Command::RewindToState(state) => put_blob(out, state),
        Command::SetInputState(inp) => {
            out.push(inp.left as u8);
            out.push(inp.right as u8);
            out.push(inp.accelerate as u8);
            out.push(inp.brake as u8);
        }
        Command::ExecuteCommand(text) => put_blob(out, text.as_bytes()),
        Command::SetTimeout(ms) | Command::SetOnStepPeriod(ms) => {
            out.extend_from_slice(&ms.to_le_bytes())
        }
        Command::RequestFrame { width, height } => {
            put_i32(out, *width as i32);
            put_i32(out, *height as i32);
        }
        Command::RewindToCurrentState
        | Command::GetSimulationState
        | Command::GiveUp
        | Command::PreventSimulationFinish
        | Command::Shutdown
        | Command::RaceFinished
        | Command::ResetCamera
        | Command::UnrequestFrame => {}
    }
}

/// Simulator side: read one command. Sync event tags are rejected as `Unexpected`.
pub fn read_command<R: Read>(r: &mut R) -> Result<Command, WireError> {
    let mut m = MessageReader::new(r);
    let tag = m.read_tag()?;
    Ok(match tag {
        MessageType::SetSpeed => Command::SetSpeed(m.read_f32()?),
        MessageType::RewindToState => Command::RewindToState(m.read_blob()?),
        MessageType::RewindToCurrentState => Command::RewindToCurrentState,
        MessageType::GetSimulationState => Command::GetSimulationState,
        MessageType::SetInputState => {
            let left = m.read_bool()?;
            let right = m.read_bool()?;
            let accelerate = m.read_bool()?;
            let brake = m.read_bool()?;
            Command::SetInputState(InputState::new(left, right, accelerate, brake))
        }
        MessageType::GiveUp => Command::GiveUp,
        MessageType::PreventSimulationFinish => Command::PreventSimulationFinish,
        MessageType::Shutdown => Command::Shutdown,
        MessageType::ExecuteCommand => {
            let bytes = m.read_blob()?;
            Command::ExecuteCommand(String::from_utf8(bytes).map_err(|_| WireError::InvalidUtf8)?)
        }
        MessageType::SetTimeout => Command::SetTimeout(m.read_u32()?),
        MessageType::RaceFinished => Command::RaceFinished,
        MessageType::RequestFrame => {
            let width = check_len(m.read_i32()?)? as u32;
            let height = check_len(m.read_i32()?)? as u32;
            Command::RequestFrame { width, height }
        }
        MessageType::ResetCamera => Command::ResetCamera,
        MessageType::SetOnStepPeriod => Command::SetOnStepPeriod(m.read_u32()?),
        MessageType::UnrequestFrame => Command::UnrequestFrame,
        sync => return Err(WireError::Unexpected(sync)),
    })
}

pub fn encode_event(ev: &Event) -> Vec<u8> {
    let mut out = Vec::with_capacity(12);
    put_tag(&mut out, ev.tag());
    match ev {
        Event::RunStep { time_ms } => put_i32(&mut out, *time_ms),
        Event::CheckpointCountChanged { current, target }
        | Event::LapCountChanged { current, target } => {
            put_i32(&mut out, *current);
            put_i32(&mut out, *target);
        }
        Event::FrameReady(frame) => out.extend_from_slice(&frame.data),
        Event::OnConnect => {}
    }
    out
}

/// Client side: read one sync event.
///
/// `frame` sizes a frame-ready payload; a frame arriving while no request is
/// outstanding is a protocol error. The returned frame's `step` is 0.
pub fn read_event<R: Read>(r: &mut R, frame: Option<FrameRequest>) -> Result<Event, WireError> {
    let mut m = MessageReader::new(r);
    let tag = m.read_tag()?;
    Ok(match tag {
        MessageType::RunStepSync => Event::RunStep {
            time_ms: m.read_i32()?,
        },
        MessageType::CheckpointCountChangedSync => Event::CheckpointCountChanged {
            current: m.read_i32()?,
            target: m.read_i32()?,
        },
        MessageType::LapCountChangedSync => Event::LapCountChanged {
            current: m.read_i32()?,
            target: m.read_i32()?,
        },
        MessageType::RequestedFrameSync => {
            let req = frame.ok_or(WireError::UnrequestedFrame)?;
            let len = Frame::checked_byte_len(req.width, req.height)?;
            Event::FrameReady(Frame {
                width: req.width,
                height: req.height,
                step: 0,
                data: m.read_bytes(len)?,
            })
        }
        MessageType::OnConnectSync => Event::OnConnect,
        other => return Err(WireError::Unexpected(other)),
    })
}

/// Acknowledgment of a sync event: the event's tag alone.
pub fn encode_ack(tag: MessageType) -> [u8; 4] {
    tag.as_i32().to_le_bytes()
}

/// Simulator side: read an acknowledgment.
pub fn read_ack<R: Read>(r: &mut R) -> Result<MessageType, WireError> {
    let tag = MessageReader::new(r).read_tag()?;
    if !tag.is_sync_event() {
        return Err(WireError::Unexpected(tag));
    }
    Ok(tag)
}

/// Simulator side: `get-simulation-state` answer.
pub fn encode_state_response(state: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + state.len());
    put_blob(&mut out, state);
    out
}

/// Simulator side: `race-finished` answer.
pub fn encode_race_finished_response(finished: bool) -> [u8; 4] {
    (finished as i32).to_le_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn all_commands() -> Vec<Command> {
        vec![
            Command::SetSpeed(20.0),
            Command::RewindToState(vec![1, 2, 3, 250]),
            Command::RewindToCurrentState,
            Command::GetSimulationState,
            Command::SetInputState(InputState::new(true, false, true, false)),
            Command::GiveUp,
            Command::PreventSimulationFinish,
            Command::Shutdown,
            Command::ExecuteCommand("toggle_console".to_string()),
            Command::SetTimeout(2_000),
            Command::RaceFinished,
            Command::RequestFrame {
                width: 160,
                height: 120,
            },
            Command::ResetCamera,
            Command::SetOnStepPeriod(10),
            Command::UnrequestFrame,
        ]
    }

    #[test]
    fn oversized_frame_request_is_rejected_before_reading() {
        let mut bytes = encode_event(&Event::OnConnect);
        bytes[0] = MessageType::RequestedFrameSync.as_i32() as u8;
        let req = FrameRequest {
            width: 8_192,
            height: 4_096,
        };
        match read_event(&mut Cursor::new(&bytes), Some(req)) {
            Err(WireError::TooLarge { len, max }) => {
                assert_eq!(len, 8_192 * 4_096 * 4);
                assert_eq!(max, crate::MAX_PAYLOAD_LEN);
            }
            other => panic!("unexpected {other:?}"),
        }

        let huge = FrameRequest {
            width: u32::MAX,
            height: u32::MAX,
        };
        assert!(matches!(
            read_event(&mut Cursor::new(&bytes), Some(huge)),
            Err(WireError::TooLarge { .. })
        ));
    }

    #[test]
    fn every_command_survives_the_wire() {
        for cmd in all_commands() {
            let bytes = encode_command(&cmd);
            let mut c = Cursor::new(bytes);
            assert_eq!(read_command(&mut c).unwrap(), cmd);
            assert_eq!(c.position() as usize, c.get_ref().len());
        }
    }

    #[test]
    fn every_event_survives_the_wire() {
        let req = FrameRequest {
            width: 2,
            height: 3,
        };
        let events = vec![
            Event::RunStep { time_ms: -10 },
            Event::CheckpointCountChanged {
                current: 3,
                target: 7,
            },
            Event::LapCountChanged {
                current: 1,
                target: 1,
            },
            Event::FrameReady(Frame {
                width: 2,
                height: 3,
                step: 0,
                data: (0..24).collect(),
            }),
            Event::OnConnect,
        ];
        for ev in events {
            let mut c = Cursor::new(encode_event(&ev));
            assert_eq!(read_event(&mut c, Some(req)).unwrap(), ev);
        }
    }

    #[test]
    fn set_input_state_layout() {
        let bytes = encode_command(&Command::SetInputState(InputState::new(
            false, true, true, false,
        )));
        assert_eq!(bytes, vec![10, 0, 0, 0, 0, 1, 1, 0]);
    }

    #[test]
    fn frame_without_request_is_an_error() {
        let mut c = Cursor::new(encode_ack(MessageType::RequestedFrameSync).to_vec());
        assert!(matches!(
            read_event(&mut c, None),
            Err(WireError::UnrequestedFrame)
        ));
    }

    #[test]
    fn command_tag_is_not_an_event() {
        let mut c = Cursor::new(encode_command(&Command::GiveUp));
        assert!(matches!(
            read_event(&mut c, None),
            Err(WireError::Unexpected(MessageType::GiveUp))
        ));
    }

    #[test]
    fn bad_bool_byte_is_rejected() {
        let mut bytes = encode_command(&Command::SetInputState(InputState::default()));
        bytes[5] = 2;
        assert!(matches!(
            read_command(&mut Cursor::new(bytes)),
            Err(WireError::BadBool(2))
        ));
    }

    #[test]
    fn ack_must_be_a_sync_tag() {
        let mut c = Cursor::new(encode_ack(MessageType::RunStepSync).to_vec());
        assert_eq!(read_ack(&mut c).unwrap(), MessageType::RunStepSync);
        let mut c = Cursor::new(MessageType::GiveUp.as_i32().to_le_bytes().to_vec());
        assert!(read_ack(&mut c).is_err());
    }
}
