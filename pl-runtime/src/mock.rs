//! Deterministic in-memory simulator.
//!
//! A car drives along world +x. Holding accelerate raises its speed, braking
//! lowers it, coasting bleeds it slowly. Checkpoints sit at fixed x positions;
//! passing the last one finishes the race. Faults (repeated frames, skipped
//! run-steps, empty states, mid-episode reconnects, timeouts, disconnects) can
//! be scripted by engine time or event count.

use std::collections::{HashSet, VecDeque};
use std::io;

use pl_core::InputState;
use pl_proto::{
    CheckpointData, ClientError, Command, Dynamics, Event, Frame, FrameRequest, MessageType,
    SimulationSnapshot, WireError,
};

use crate::sim::Simulator;

/// Car faces +x: right = -z, up = +y, forward = +x.
pub const FACING_X: [f32; 9] = [0.0, 0.0, 1.0, 0.0, 1.0, 0.0, -1.0, 0.0, 0.0];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    /// `await_event` times out once, then the session continues.
    Timeout,
    /// The connection is gone for good.
    Disconnect,
}

#[derive(Debug, Clone, Default)]
pub struct Faults {
    /// Decision times whose frame repeats the previous frame's bytes.
    pub repeat_frame_at: HashSet<i32>,
    /// Run-step times that are never emitted (the clock jumps over them).
    pub skip_step_at: HashSet<i32>,
    /// Times at which `get-simulation-state` answers with an empty blob.
    pub empty_state_at: HashSet<i32>,
    /// Times after which an on-connect event is injected.
    pub on_connect_at: HashSet<i32>,
    /// Fail once the given number of events has been emitted over the session.
    pub fail_after_events: Option<(u64, InjectedFailure)>,
}

#[derive(Debug, Clone)]
pub struct MockTrack {
    pub checkpoints_x: Vec<f32>,
    pub engine_step_ms: i32,
    /// Engine time right after `give-up` (countdown runs at negative times).
    pub start_time_ms: i32,
    pub accel_per_step: f32,
    pub brake_per_step: f32,
    pub drag_per_step: f32,
    pub max_speed: f32,
}

impl Default for MockTrack {
    fn default() -> Self {
        Self {
            checkpoints_x: vec![20.0, 40.0, 60.0],
            engine_step_ms: 10,
            start_time_ms: -20,
            accel_per_step: 1.0,
            brake_per_step: 2.0,
            drag_per_step: 0.1,
            max_speed: 100.0,
        }
    }
}

#[derive(Debug)]
pub struct ScriptedSim {
    track: MockTrack,
    faults: Faults,
    time_ms: i32,
    x: f32,
    speed: f32,
    cp_passed: usize,
    inputs: InputState,
    queue: VecDeque<Event>,
    pending: Option<MessageType>,
    frame_request: Option<FrameRequest>,
    last_frame: Vec<u8>,
    events_emitted: u64,
    failed: bool,
    disconnected: bool,
    closed: bool,
    /// Every command received, in order.
    pub commands: Vec<Command>,
}

impl ScriptedSim {
    pub fn new(track: MockTrack, faults: Faults) -> Self {
        let start = track.start_time_ms;
        let mut s = Self {
            track,
            faults,
            time_ms: start,
            x: 0.0,
            speed: 0.0,
            cp_passed: 0,
            inputs: InputState::default(),
            queue: VecDeque::new(),
            pending: None,
            frame_request: None,
            last_frame: Vec::new(),
            events_emitted: 0,
            failed: false,
            disconnected: false,
            closed: false,
            commands: Vec::new(),
        };
        s.reset();
        s
    }

    /// Like a freshly launched simulator: the first event is on-connect.
    pub fn connecting(track: MockTrack, faults: Faults) -> Self {
        let mut s = Self::new(track, faults);
        s.queue.push_back(Event::OnConnect);
        s
    }

    /// Zone centers matching the checkpoint layout, starting at the origin.
    pub fn zone_centers(&self) -> Vec<[f32; 3]> {
        std::iter::once([0.0, 0.0, 0.0])
            .chain(self.track.checkpoints_x.iter().map(|&x| [x, 0.0, 0.0]))
            .collect()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn time_ms(&self) -> i32 {
        self.time_ms
    }

    fn reset(&mut self) {
        self.time_ms = self.track.start_time_ms;
        self.x = 0.0;
        self.speed = 0.0;
        self.cp_passed = 0;
        self.inputs = InputState::default();
        self.queue.retain(|e| matches!(e, Event::OnConnect));
        self.last_frame.clear();
    }

    fn lost() -> ClientError {
        ClientError::Wire(WireError::ConnectionLost(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "scripted disconnect",
        )))
    }

    fn check_usable(&self) -> Result<(), ClientError> {
        if self.closed {
            return Err(ClientError::Closed);
        }
        if self.disconnected {
            return Err(Self::lost());
        }
        Ok(())
    }

    fn advance(&mut self) {
        let step = self.track.engine_step_ms;
        self.time_ms += step;
        while self.faults.skip_step_at.contains(&self.time_ms) {
            self.time_ms += step;
        }
        if self.time_ms > 0 {
            let t = &self.track;
            if self.inputs.accelerate {
                self.speed = (self.speed + t.accel_per_step).min(t.max_speed);
            } else if self.inputs.brake {
                self.speed = (self.speed - t.brake_per_step).max(0.0);
            } else {
                self.speed = (self.speed - t.drag_per_step).max(0.0);
            }
            self.x += self.speed * (step as f32) / 1000.0;
        }
        self.queue.push_back(Event::RunStep {
            time_ms: self.time_ms,
        });
        let target = self.track.checkpoints_x.len();
        while self.cp_passed < target && self.x >= self.track.checkpoints_x[self.cp_passed] {
            self.cp_passed += 1;
            self.queue.push_back(Event::CheckpointCountChanged {
                current: self.cp_passed as i32,
                target: target as i32,
            });
        }
        if self.faults.on_connect_at.contains(&self.time_ms) {
            self.queue.push_back(Event::OnConnect);
        }
    }

    fn frame(&mut self, req: FrameRequest) -> Frame {
        let len = Frame::byte_len(req.width, req.height);
        let data = if self.faults.repeat_frame_at.contains(&self.time_ms) && self.last_frame.len() == len {
            self.last_frame.clone()
        } else {
            let v = (self.time_ms.rem_euclid(251)) as u8;
            vec![v; len]
        };
        self.last_frame = data.clone();
        Frame {
            width: req.width,
            height: req.height,
            step: self.time_ms,
            data,
        }
    }

    pub fn snapshot(&self) -> SimulationSnapshot {
        let n = self.track.checkpoints_x.len();
        let states = (0..n).map(|i| (i < self.cp_passed) as u8).collect();
        let times = (0..n)
            .map(|i| if i < self.cp_passed { self.time_ms } else { -1 })
            .collect();
        SimulationSnapshot::build(
            Dynamics {
                race_time_ms: self.time_ms,
                position: [self.x, 0.0, 0.0],
                velocity: [self.speed, 0.0, 0.0],
                orientation: FACING_X,
            },
            CheckpointData { states, times },
            &[0xAB; 16],
        )
    }
}

impl Simulator for ScriptedSim {
    fn await_event(&mut self) -> Result<Event, ClientError> {
        self.check_usable()?;
        if let Some(tag) = self.pending {
            return Err(ClientError::Unacknowledged(tag));
        }
        if let Some((after, kind)) = self.faults.fail_after_events {
            if self.events_emitted >= after && !self.failed {
                self.failed = true;
                return Err(match kind {
                    InjectedFailure::Timeout => ClientError::Wire(WireError::Timeout),
                    InjectedFailure::Disconnect => {
                        self.disconnected = true;
                        Self::lost()
                    }
                });
            }
        }
        if self.queue.is_empty() {
            self.advance();
        }
        let ev = match self.queue.pop_front() {
            Some(ev) => ev,
            None => return Err(ClientError::Wire(WireError::Timeout)),
        };
        self.events_emitted += 1;
        self.pending = Some(ev.tag());
        Ok(ev)
    }

    fn ack(&mut self) -> Result<(), ClientError> {
        self.check_usable()?;
        let tag = self.pending.take().ok_or(ClientError::NothingToAck)?;
        if tag == MessageType::RunStepSync {
            if let Some(req) = self.frame_request {
                let f = self.frame(req);
                self.queue.push_front(Event::FrameReady(f));
            }
        }
        Ok(())
    }

    fn send(&mut self, cmd: &Command) -> Result<(), ClientError> {
        self.check_usable()?;
        self.commands.push(cmd.clone());
        match cmd {
            Command::GiveUp => self.reset(),
            Command::SetInputState(inp) => self.inputs = *inp,
            Command::RequestFrame { width, height } => {
                self.frame_request = Some(FrameRequest {
                    width: *width,
                    height: *height,
                })
            }
            Command::UnrequestFrame => self.frame_request = None,
            Command::Shutdown => self.closed = true,
            _ => {}
        }
        Ok(())
    }

    fn get_simulation_state(&mut self) -> Result<SimulationSnapshot, ClientError> {
        self.send(&Command::GetSimulationState)?;
        if self.faults.empty_state_at.contains(&self.time_ms) {
            return Ok(SimulationSnapshot::empty());
        }
        Ok(self.snapshot())
    }

    fn race_finished(&mut self) -> Result<bool, ClientError> {
        self.send(&Command::RaceFinished)?;
        Ok(self.cp_passed == self.track.checkpoints_x.len())
    }

    fn close(&mut self) -> Result<(), ClientError> {
        if self.closed {
            return Ok(());
        }
        let res = self.send(&Command::Shutdown);
        self.closed = true;
        res
    }
}
