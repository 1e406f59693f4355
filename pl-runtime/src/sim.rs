//! The simulator seam: what the episode driver needs from a session.

use pl_core::InputState;
use pl_proto::{ClientError, Command, Event, SimClient, SimulationSnapshot};

pub trait Simulator {
    fn await_event(&mut self) -> Result<Event, ClientError>;
    fn ack(&mut self) -> Result<(), ClientError>;
    fn send(&mut self, cmd: &Command) -> Result<(), ClientError>;
    fn get_simulation_state(&mut self) -> Result<SimulationSnapshot, ClientError>;
    fn race_finished(&mut self) -> Result<bool, ClientError>;
    fn close(&mut self) -> Result<(), ClientError>;

    fn give_up(&mut self) -> Result<(), ClientError> {
        self.send(&Command::GiveUp)
    }

    fn set_speed(&mut self, speed: f32) -> Result<(), ClientError> {
        self.send(&Command::SetSpeed(speed))
    }

    fn set_input_state(&mut self, inputs: InputState) -> Result<(), ClientError> {
        self.send(&Command::SetInputState(inputs))
    }

    fn request_frame(&mut self, width: u32, height: u32) -> Result<(), ClientError> {
        self.send(&Command::RequestFrame { width, height })
    }

    fn unrequest_frame(&mut self) -> Result<(), ClientError> {
        self.send(&Command::UnrequestFrame)
    }

    fn prevent_simulation_finish(&mut self) -> Result<(), ClientError> {
        self.send(&Command::PreventSimulationFinish)
    }

    fn set_timeout(&mut self, timeout_ms: u32) -> Result<(), ClientError> {
        self.send(&Command::SetTimeout(timeout_ms))
    }

    fn set_on_step_period(&mut self, period_ms: u32) -> Result<(), ClientError> {
        self.send(&Command::SetOnStepPeriod(period_ms))
    }
}

impl Simulator for SimClient {
    fn await_event(&mut self) -> Result<Event, ClientError> {
        SimClient::await_event(self)
    }

    fn ack(&mut self) -> Result<(), ClientError> {
        SimClient::ack(self)
    }

    fn send(&mut self, cmd: &Command) -> Result<(), ClientError> {
        SimClient::send(self, cmd)
    }

    fn get_simulation_state(&mut self) -> Result<SimulationSnapshot, ClientError> {
        SimClient::get_simulation_state(self)
    }

    fn race_finished(&mut self) -> Result<bool, ClientError> {
        SimClient::race_finished(self)
    }

    fn close(&mut self) -> Result<(), ClientError> {
        SimClient::close(self)
    }
}
