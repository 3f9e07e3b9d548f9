//! Message types for the station actor
//!
//! Operator intents reach the station as [`StationCommand`]s over an `mpsc` channel.
//! Every command carries a `oneshot` reply; the helper constructors return the command
//! together with the receiving end.

use crate::automation::AutomationState;
use crate::core::LoopState;
use crate::error::{AppResult, StationError};
use crate::instrument::{Axis, Opcode, SweepAction};
use crate::parameter::ApplyRequest;
use crate::status::StationStatus;
use chrono::{DateTime, Local};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::sync::oneshot;

/// Reply channel carried by every command
pub type Reply<T> = oneshot::Sender<AppResult<T>>;

/// The three device sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resource {
    /// Spectrum analyzer (VISA)
    Instrument,
    /// Antenna positioner (serial)
    Motor,
    /// RF relay PLC (serial)
    Relay,
}

impl Resource {
    /// All resources, in connection order
    pub const ALL: [Resource; 3] = [Resource::Instrument, Resource::Motor, Resource::Relay];

    /// Session name
    pub fn as_str(self) -> &'static str {
        match self {
            Resource::Instrument => "instrument",
            Resource::Motor => "motor",
            Resource::Relay => "relay",
        }
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resource {
    type Err = StationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "instrument" | "analyzer" | "visa" => Ok(Resource::Instrument),
            "motor" | "positioner" => Ok(Resource::Motor),
            "relay" | "plc" => Ok(Resource::Relay),
            other => Err(StationError::Protocol(format!(
                "unknown resource '{other}' (expected instrument, motor or relay)"
            ))),
        }
    }
}

/// Commands handled by the station actor
#[derive(Debug)]
pub enum StationCommand {
    /// Open a session; `None` uses the configured address
    Connect {
        resource: Resource,
        address: Option<String>,
        response: Reply<()>,
    },

    /// Close a session
    Disconnect {
        resource: Resource,
        response: Reply<()>,
    },

    /// `*IDN?` split into fields
    Identify { response: Reply<Vec<String>> },

    /// One apply pass on the analyzer
    Apply {
        request: ApplyRequest,
        response: Reply<()>,
    },

    /// Continuous sweep flag
    SetContinuous { on: bool, response: Reply<()> },

    /// Trigger one sweep
    SingleSweep { response: Reply<()> },

    /// Toggle or restart the sweep; replies with the new continuous state
    SweepControl {
        action: SweepAction,
        response: Reply<bool>,
    },

    /// Ask the measurement machine for a new state
    RequestMeasurementState {
        state: LoopState,
        response: Reply<()>,
    },

    /// Ask the motion machine for a new state
    RequestMotionState {
        state: LoopState,
        response: Reply<()>,
    },

    /// Relative move on one axis
    Jog {
        axis: Axis,
        degrees: f64,
        response: Reply<()>,
    },

    /// Absolute move
    Point {
        azimuth: f64,
        elevation: f64,
        response: Reply<()>,
    },

    /// Move to the park position
    Park { response: Reply<()> },

    /// Stop both axes
    Halt { response: Reply<()> },

    /// Send one PLC opcode; replies with the status it reported
    Plc {
        opcode: Opcode,
        response: Reply<u8>,
    },

    /// Ask the PLC for its status
    PlcStatus { response: Reply<u8> },

    /// Queue one automation time
    Enqueue {
        at: DateTime<Local>,
        response: Reply<()>,
    },

    /// Queue evenly spaced times; replies with how many were added
    EnqueueRange {
        start: DateTime<Local>,
        end: DateTime<Local>,
        interval: Duration,
        response: Reply<usize>,
    },

    /// Empty the automation queue
    ClearQueue { response: Reply<()> },

    /// Queued times
    Queue {
        response: Reply<Vec<DateTime<Local>>>,
    },

    /// Start automation with `script`, or the configured hooks
    StartAutomation {
        script: Option<String>,
        response: Reply<()>,
    },

    /// Stop automation
    StopAutomation { response: Reply<()> },

    /// Start or stop automation; replies with the new state
    ToggleAutomation {
        script: Option<String>,
        response: Reply<AutomationState>,
    },

    /// Fresh status
    Status { response: Reply<StationStatus> },

    /// Stop every loop and close the sessions
    Shutdown { response: Reply<()> },
}

impl StationCommand {
    /// Helper to create a Connect command
    pub fn connect(
        resource: Resource,
        address: Option<String>,
    ) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Connect {
                resource,
                address,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a Disconnect command
    pub fn disconnect(resource: Resource) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Disconnect { resource, response: tx }, rx)
    }

    /// Helper to create an Identify command
    pub fn identify() -> (Self, oneshot::Receiver<AppResult<Vec<String>>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Identify { response: tx }, rx)
    }

    /// Helper to create an Apply command
    pub fn apply(request: ApplyRequest) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Apply { request, response: tx }, rx)
    }

    /// Helper to create a SetContinuous command
    pub fn set_continuous(on: bool) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::SetContinuous { on, response: tx }, rx)
    }

    /// Helper to create a SingleSweep command
    pub fn single_sweep() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::SingleSweep { response: tx }, rx)
    }

    /// Helper to create a SweepControl command
    pub fn sweep_control(action: SweepAction) -> (Self, oneshot::Receiver<AppResult<bool>>) {
        let (tx, rx) = oneshot::channel();
        (Self::SweepControl { action, response: tx }, rx)
    }

    /// Helper to create a RequestMeasurementState command
    pub fn request_measurement(state: LoopState) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::RequestMeasurementState { state, response: tx }, rx)
    }

    /// Helper to create a RequestMotionState command
    pub fn request_motion(state: LoopState) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::RequestMotionState { state, response: tx }, rx)
    }

    /// Helper to create a Jog command
    pub fn jog(axis: Axis, degrees: f64) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Jog {
                axis,
                degrees,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a Point command
    pub fn point(azimuth: f64, elevation: f64) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Point {
                azimuth,
                elevation,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a Park command
    pub fn park() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Park { response: tx }, rx)
    }

    /// Helper to create a Halt command
    pub fn halt() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Halt { response: tx }, rx)
    }

    /// Helper to create a Plc command
    pub fn plc(opcode: Opcode) -> (Self, oneshot::Receiver<AppResult<u8>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Plc { opcode, response: tx }, rx)
    }

    /// Helper to create a PlcStatus command
    pub fn plc_status() -> (Self, oneshot::Receiver<AppResult<u8>>) {
        let (tx, rx) = oneshot::channel();
        (Self::PlcStatus { response: tx }, rx)
    }

    /// Helper to create an Enqueue command
    pub fn enqueue(at: DateTime<Local>) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Enqueue { at, response: tx }, rx)
    }

    /// Helper to create an EnqueueRange command
    pub fn enqueue_range(
        start: DateTime<Local>,
        end: DateTime<Local>,
        interval: Duration,
    ) -> (Self, oneshot::Receiver<AppResult<usize>>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::EnqueueRange {
                start,
                end,
                interval,
                response: tx,
            },
            rx,
        )
    }

    /// Helper to create a ClearQueue command
    pub fn clear_queue() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::ClearQueue { response: tx }, rx)
    }

    /// Helper to create a Queue command
    pub fn queue() -> (Self, oneshot::Receiver<AppResult<Vec<DateTime<Local>>>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Queue { response: tx }, rx)
    }

    /// Helper to create a StartAutomation command
    pub fn start_automation(script: Option<String>) -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::StartAutomation { script, response: tx }, rx)
    }

    /// Helper to create a StopAutomation command
    pub fn stop_automation() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::StopAutomation { response: tx }, rx)
    }

    /// Helper to create a ToggleAutomation command
    pub fn toggle_automation(
        script: Option<String>,
    ) -> (Self, oneshot::Receiver<AppResult<AutomationState>>) {
        let (tx, rx) = oneshot::channel();
        (Self::ToggleAutomation { script, response: tx }, rx)
    }

    /// Helper to create a Status command
    pub fn status() -> (Self, oneshot::Receiver<AppResult<StationStatus>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Status { response: tx }, rx)
    }

    /// Helper to create a Shutdown command
    pub fn shutdown() -> (Self, oneshot::Receiver<AppResult<()>>) {
        let (tx, rx) = oneshot::channel();
        (Self::Shutdown { response: tx }, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_aliases() {
        assert_eq!("PLC".parse::<Resource>().unwrap(), Resource::Relay);
        assert_eq!("visa".parse::<Resource>().unwrap(), Resource::Instrument);
        assert_eq!("motor".parse::<Resource>().unwrap(), Resource::Motor);
        assert!("camera".parse::<Resource>().is_err());
    }

    #[tokio::test]
    async fn test_reply_round_trip() {
        let (command, rx) = StationCommand::plc_status();
        match command {
            StationCommand::PlcStatus { response } => {
                response.send(Ok(80)).unwrap();
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert_eq!(rx.await.unwrap().unwrap(), 80);
    }
}
