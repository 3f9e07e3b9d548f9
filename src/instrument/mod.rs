//! Device drivers for the station's three resources.
//!
//! - [`analyzer`]: spectrum analyzer helpers and the measurement state machine
//! - [`display`]: trace fetch-and-publish loop on the analyzer session
//! - [`motion`]: antenna positioner state machine and manual moves
//! - [`plc`]: RF relay PLC opcode protocol

pub mod analyzer;
pub mod display;
pub mod motion;
pub mod plc;

pub use analyzer::{MeasurementMachine, MeasurementSnapshot, SweepAction};
pub use display::{DisplayLoop, Trace};
pub use motion::{Axis, MotionMachine, MotionSnapshot};
pub use plc::{Opcode, PlcController, PlcSnapshot};
