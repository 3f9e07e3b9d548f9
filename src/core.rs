//! Core data types shared by the control loops.
//!
//! This module defines the state and observation types every loop speaks:
//!
//! - [`LoopState`]: the IDLE/INIT/LOOP/CLEANUP state of a machine
//! - [`Position`] and [`PositionSink`]: antenna angles pushed out by the motion loop
//! - [`SampleSink`]: trace records pushed out by the display loop
//! - [`SpectrumPlot`] / [`PositionPlot`]: plot surfaces, each behind its own display lock
//!
//! # Data Flow
//!
//! ```text
//! Session --(SessionIo)--> loops --[SampleRecord / Position]--> sinks ---> presentation
//!                              \--> display locks (SpectrumPlot, PositionPlot)
//! ```
//!
//! # Thread Safety
//!
//! Sinks are called from loop tasks and must be `Send + Sync`. They are invoked
//! outside any session lock, so a slow sink delays the loop but never the device.

use crate::record::SampleRecord;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;

// =============================================================================
// Loop state
// =============================================================================

/// State of a control loop.
///
/// `Cleanup` is only meaningful for the motion machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoopState {
    /// Waiting; inputs disabled
    #[default]
    Idle,
    /// Bringing the device to a known state
    Init,
    /// Running
    Loop,
    /// Releasing the device before returning to idle
    Cleanup,
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoopState::Idle => write!(f, "IDLE"),
            LoopState::Init => write!(f, "INIT"),
            LoopState::Loop => write!(f, "LOOP"),
            LoopState::Cleanup => write!(f, "CLEANUP"),
        }
    }
}

impl std::str::FromStr for LoopState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "idle" => Ok(Self::Idle),
            "init" => Ok(Self::Init),
            "loop" => Ok(Self::Loop),
            "cleanup" => Ok(Self::Cleanup),
            other => Err(format!("unknown loop state '{other}'")),
        }
    }
}

/// Which delay a loop sleeps after an iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pace {
    /// `idle_delay`
    Idle,
    /// The machine's own loop delay
    Loop,
}

// =============================================================================
// Observations
// =============================================================================

/// Antenna pointing in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    /// Azimuth (x axis)
    pub azimuth: f64,
    /// Elevation (y axis)
    pub elevation: f64,
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "az {:.4}°, el {:.4}°", self.azimuth, self.elevation)
    }
}

/// Receives every position the motion loop computes.
pub trait PositionSink: Send + Sync {
    /// A new position was read from the encoders
    fn publish_position(&self, position: Position);
}

impl<F> PositionSink for F
where
    F: Fn(Position) + Send + Sync,
{
    fn publish_position(&self, position: Position) {
        self(position)
    }
}

/// Receives every trace the display loop fetches.
pub trait SampleSink: Send + Sync {
    /// A new trace (with its loggable parameters) was fetched
    fn publish_sample(&self, record: &SampleRecord);
}

impl<F> SampleSink for F
where
    F: Fn(&SampleRecord) + Send + Sync,
{
    fn publish_sample(&self, record: &SampleRecord) {
        self(record)
    }
}

/// Sink that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullSink;

impl PositionSink for NullSink {
    fn publish_position(&self, _position: Position) {}
}

impl SampleSink for NullSink {
    fn publish_sample(&self, _record: &SampleRecord) {}
}

// =============================================================================
// Plot surfaces
// =============================================================================

/// Axis limits of the spectrum plot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PlotBounds {
    /// Left edge: Hz, or seconds in zero span
    pub x_min: f64,
    /// Right edge
    pub x_max: f64,
    /// Bottom edge in the Y unit
    pub y_min: f64,
    /// Top edge (reference level)
    pub y_max: f64,
}

/// Spectrum plot contents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SpectrumPlot {
    /// Limits computed after each apply
    pub bounds: Option<PlotBounds>,
    /// Frequency (or time) axis of the latest trace
    pub x: Vec<f64>,
    /// Amplitudes of the latest trace
    pub y: Vec<f64>,
}

/// Position plot contents.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PositionPlot {
    /// Latest antenna position
    pub position: Option<Position>,
}

/// Display lock around a plot surface.
pub type DisplayLock<T> = Arc<Mutex<T>>;

/// Create a display lock over an empty plot
pub fn display_lock<T: Default>() -> DisplayLock<T> {
    Arc::new(Mutex::new(T::default()))
}

/// Round to `digits` decimal places.
pub fn round_to(value: f64, digits: i32) -> f64 {
    let scale = 10f64.powi(digits);
    (value * scale).round() / scale
}
