//! Control core for an antenna spectrum monitoring station.
//!
//! The station drives three devices, each behind one [`session::Session`]:
//!
//! - a spectrum analyzer over VISA ([`instrument::analyzer`], [`instrument::display`])
//! - an antenna positioner over serial ([`instrument::motion`])
//! - an RF relay PLC over serial ([`instrument::plc`])
//!
//! Analyzer settings go through the [`sequencer`], which writes pending parameters and
//! then refreshes every parameter under one session lock. Long-running loops (measurement,
//! display, motion, scheduler, status) are wired together by [`station::Station`] and
//! driven through a [`station::StationHandle`]. Timed routines are Rhai hook scripts run
//! by [`automation`].

pub mod adapters;
pub mod automation;
pub mod config;
pub mod console;
pub mod core;
pub mod error;
pub mod error_recovery;
pub mod instrument;
pub mod logging;
pub mod messages;
pub mod parameter;
pub mod record;
pub mod scripting;
pub mod sequencer;
pub mod session;
pub mod station;
pub mod status;

pub use error::{AppResult, StationError};
pub use station::{Station, StationHandle};
