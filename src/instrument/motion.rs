//! Antenna positioner: drive control, encoder polling and manual moves.
//!
//! # States
//!
//! ```text
//!   IDLE ──Request(Init)──> INIT ──drives on──> LOOP ──poll error──> IDLE
//!    ^                        │                   │
//!    └────────error───────────┘      Request(Cleanup)
//!    └──────────────── CLEANUP <──────────────────┘   (drives off, always ends IDLE)
//! ```
//!
//! Manual moves ([`MotionMachine::jog`], [`MotionMachine::point`], ...) take the motor
//! lock independently of the loop. Neither side knows the other's target, so the last
//! command written wins.

use crate::config::{CalibrationConfig, TimingConfig};
use crate::core::{round_to, DisplayLock, LoopState, Pace, Position, PositionPlot, PositionSink};
use crate::error::{AppResult, StationError};
use crate::session::{Session, SessionIo};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Allowed azimuth for absolute pointing, degrees
pub const AZIMUTH_RANGE: (f64, f64) = (0.0, 360.0);
/// Allowed elevation for absolute pointing, degrees
pub const ELEVATION_RANGE: (f64, f64) = (-90.0, 10.0);

const X_ENCODER: &str = "PRINT P6144";
const Y_ENCODER: &str = "PRINT P6160";
const MOVE_SETTLE: Duration = Duration::from_millis(100);

/// Positioner axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    /// x
    Azimuth,
    /// y
    Elevation,
}

impl Axis {
    fn letter(self) -> char {
        match self {
            Axis::Azimuth => 'x',
            Axis::Elevation => 'y',
        }
    }

    fn field(self) -> &'static str {
        match self {
            Axis::Azimuth => "azimuth",
            Axis::Elevation => "elevation",
        }
    }
}

impl std::str::FromStr for Axis {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "az" | "azimuth" | "x" => Ok(Axis::Azimuth),
            "el" | "elevation" | "y" => Ok(Axis::Elevation),
            other => Err(format!("unknown axis '{other}'")),
        }
    }
}

// =============================================================================
// Protocol helpers
// =============================================================================

/// Degrees from an encoder count: `round((count - home) / (cpr / 360), 4)`.
pub fn encoder_to_degrees(count: i64, home: i64, counts_per_rotation: i64) -> f64 {
    let counts_per_degree = counts_per_rotation as f64 / 360.0;
    round_to((count as f64 - home as f64) / counts_per_degree, 4)
}

/// Extract the single encoder count from a `PRINT` reply.
///
/// Echo lines (containing `PRINT`), prompt lines (containing `P00`) and blank lines are
/// dropped; exactly one integer line must remain.
pub fn parse_encoder(reply: &str) -> AppResult<i64> {
    let lines: Vec<&str> = reply
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.contains("P00") && !line.contains("PRINT"))
        .collect();
    match lines.as_slice() {
        [line] => line
            .parse::<i64>()
            .map_err(|_| StationError::Protocol(format!("encoder reply is not an integer: '{line}'"))),
        [] => Err(StationError::Protocol("encoder query returned no value".into())),
        more => Err(StationError::Protocol(format!(
            "encoder query expected 1 line and returned {}: {:?}",
            more.len(),
            more
        ))),
    }
}

/// Drive state from a `DRIVE X` / `DRIVE Y` reply.
pub fn parse_drive(axis: &str, reply: &str) -> AppResult<bool> {
    if reply.contains("OFF") {
        Ok(false)
    } else if reply.contains("ON") {
        Ok(true)
    } else {
        Err(StationError::Protocol(format!(
            "unexpected response from {axis}: '{}'",
            reply.trim()
        )))
    }
}

/// Query both drives; `(axis0, axis1)`.
pub async fn query_drive_states(io: &mut SessionIo) -> AppResult<(bool, bool)> {
    let x = parse_drive("AXIS0", &io.query("DRIVE X").await?)?;
    let y = parse_drive("AXIS1", &io.query("DRIVE Y").await?)?;
    Ok((x, y))
}

fn check_range(field: &str, value: f64, (min, max): (f64, f64)) -> AppResult<()> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(())
    } else {
        Err(StationError::range(field, value, min, max))
    }
}

// =============================================================================
// State machine
// =============================================================================

/// Inputs to the motion machine
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MotionEvent {
    /// Start of an iteration
    Tick {
        /// Whether the motor session is open
        session_open: bool,
    },
    /// Drives enabled and program running
    InitCompleted,
    /// Initialization failed
    InitFailed,
    /// Encoders read
    PollCompleted(Position),
    /// Encoder read failed
    PollFailed,
    /// Drives released (successfully or not)
    CleanupDone,
    /// External state change
    Request(LoopState),
}

/// Work the motion machine asks its driver to perform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MotionEffect {
    /// Grey out jog inputs
    DisableInputs,
    /// Enable jog inputs
    EnableInputs,
    /// Start the program and enable the drives
    RunInit,
    /// Read both encoders and publish the position
    Poll,
    /// Disable the drives
    RunCleanup,
    /// End the iteration
    Sleep(Pace),
}

/// Pure transition function of the motion machine.
pub fn transition(state: LoopState, event: MotionEvent) -> (LoopState, Vec<MotionEffect>) {
    use LoopState::*;
    use MotionEffect::*;
    use MotionEvent::*;

    match (state, event) {
        (_, Request(next)) => (next, vec![]),

        (Idle, Tick { .. }) => (Idle, vec![DisableInputs, Sleep(Pace::Idle)]),

        (Init, Tick { session_open: false }) => (Idle, vec![DisableInputs]),
        (Init, Tick { .. }) => (Init, vec![DisableInputs, RunInit]),
        (Init, InitCompleted) => (Loop, vec![EnableInputs]),
        (Init, InitFailed) => (Idle, vec![DisableInputs]),

        (Loop, Tick { session_open: false }) => (Idle, vec![DisableInputs]),
        (Loop, Tick { .. }) => (Loop, vec![Poll]),
        (Loop, PollCompleted(_)) => (Loop, vec![EnableInputs, Sleep(Pace::Loop)]),
        (Loop, PollFailed) => (Idle, vec![DisableInputs, Sleep(Pace::Loop)]),

        (Cleanup, Tick { .. }) => (Cleanup, vec![RunCleanup]),
        (Cleanup, CleanupDone) => (Idle, vec![DisableInputs]),

        (state, _) => (state, vec![]),
    }
}

/// Observable state of the positioner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct MotionSnapshot {
    /// Current state
    pub state: LoopState,
    /// Azimuth drive enabled, once queried
    pub axis0: Option<bool>,
    /// Elevation drive enabled, once queried
    pub axis1: Option<bool>,
    /// Last computed position
    pub position: Option<Position>,
    /// Jog inputs enabled
    pub inputs_enabled: bool,
}

/// Drives the positioner through [`transition`] and serves manual moves.
pub struct MotionMachine {
    session: Arc<Session>,
    calibration: CalibrationConfig,
    plot: DisplayLock<PositionPlot>,
    sink: Arc<dyn PositionSink>,
    idle_delay: Duration,
    loop_delay: Duration,
    state: watch::Sender<MotionSnapshot>,
}

impl MotionMachine {
    /// Machine over the motor session, idle
    pub fn new(
        session: Arc<Session>,
        calibration: CalibrationConfig,
        plot: DisplayLock<PositionPlot>,
        sink: Arc<dyn PositionSink>,
        timing: &TimingConfig,
    ) -> Self {
        let (state, _) = watch::channel(MotionSnapshot::default());
        Self {
            session,
            calibration,
            plot,
            sink,
            idle_delay: timing.idle_delay,
            loop_delay: timing.motor_loop_delay,
            state,
        }
    }

    /// Current state, drive flags and position
    pub fn snapshot(&self) -> MotionSnapshot {
        *self.state.borrow()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<MotionSnapshot> {
        self.state.subscribe()
    }

    /// Ask for a state change; takes effect on the next iteration.
    pub fn request(&self, requested: LoopState) {
        self.state.send_if_modified(|s| {
            let (next, _) = transition(s.state, MotionEvent::Request(requested));
            info!(from = %s.state, to = %next, "motion state requested");
            let changed = next != s.state;
            s.state = next;
            changed
        });
    }

    /// Run one iteration and return how long to sleep before the next.
    pub async fn step(&self) -> Duration {
        let mut events = VecDeque::from([MotionEvent::Tick {
            session_open: self.session.is_open(),
        }]);
        let mut pause = Duration::ZERO;

        while let Some(event) = events.pop_front() {
            let current = self.snapshot().state;
            let (next, effects) = transition(current, event);
            if next != current {
                info!(from = %current, to = %next, ?event, "motion state");
                self.state.send_modify(|s| s.state = next);
            }
            for effect in effects {
                if let Some(follow_up) = self.perform(effect, &mut pause).await {
                    events.push_back(follow_up);
                }
            }
        }
        pause
    }

    async fn perform(&self, effect: MotionEffect, pause: &mut Duration) -> Option<MotionEvent> {
        use MotionEffect::*;

        match effect {
            DisableInputs => self.state.send_modify(|s| s.inputs_enabled = false),
            EnableInputs => self.state.send_modify(|s| s.inputs_enabled = true),
            Sleep(Pace::Idle) => *pause = self.idle_delay,
            Sleep(Pace::Loop) => *pause = self.loop_delay,
            RunInit => {
                return Some(match self.run_init().await {
                    Ok(()) => MotionEvent::InitCompleted,
                    Err(e) => {
                        error!(error = %e, "positioner initialization failed");
                        MotionEvent::InitFailed
                    }
                });
            }
            Poll => {
                return Some(match self.poll().await {
                    Ok(position) => MotionEvent::PollCompleted(position),
                    Err(e) => {
                        error!(error = %e, "encoder poll failed");
                        MotionEvent::PollFailed
                    }
                });
            }
            RunCleanup => {
                if let Err(e) = self.release_drives().await {
                    error!(error = %e, "positioner cleanup failed");
                }
                return Some(MotionEvent::CleanupDone);
            }
        }
        None
    }

    async fn run_init(&self) -> AppResult<()> {
        let mut io = self.session.lock().await;
        io.write("\n").await?;
        let prog = io.query("Prog 0").await?;
        if !prog.contains("P00") {
            return Err(StationError::Protocol(format!(
                "unexpected response from motor controller: '{}'",
                prog.trim()
            )));
        }
        io.write("DRIVE ON X Y").await?;
        let (axis0, axis1) = self.refresh_drives(&mut io).await?;
        if !axis0 || !axis1 {
            return Err(StationError::Protocol(
                "one or more drives did not respond to enable command".into(),
            ));
        }
        Ok(())
    }

    async fn refresh_drives(&self, io: &mut SessionIo) -> AppResult<(bool, bool)> {
        let (axis0, axis1) = query_drive_states(io).await?;
        self.state.send_modify(|s| {
            s.axis0 = Some(axis0);
            s.axis1 = Some(axis1);
        });
        Ok((axis0, axis1))
    }

    async fn poll(&self) -> AppResult<Position> {
        let (x, y) = {
            let mut io = self.session.lock().await;
            let x = parse_encoder(&io.query(X_ENCODER).await?)?;
            let y = parse_encoder(&io.query(Y_ENCODER).await?)?;
            (x, y)
        };
        let cal = &self.calibration;
        let position = Position {
            azimuth: encoder_to_degrees(x, cal.x_enc_home, cal.x_countsperrotation),
            elevation: encoder_to_degrees(y, cal.y_enc_home, cal.y_countsperrotation),
        };

        self.plot.lock().await.position = Some(position);
        self.state.send_modify(|s| s.position = Some(position));
        self.sink.publish_position(position);
        Ok(position)
    }

    async fn release_drives(&self) -> AppResult<(bool, bool)> {
        let mut io = self.session.lock().await;
        io.write("DRIVE OFF X Y").await?;
        self.refresh_drives(&mut io).await
    }

    /// Release the drives now and go idle; used at shutdown.
    pub async fn cleanup_now(&self) -> AppResult<()> {
        let result = if self.session.is_open() {
            self.release_drives().await.map(|_| ())
        } else {
            Ok(())
        };
        self.state.send_modify(|s| {
            s.state = LoopState::Idle;
            s.inputs_enabled = false;
        });
        result
    }

    // =========================================================================
    // Manual commands
    // =========================================================================

    /// Move one axis by `degrees` relative to where it is.
    pub async fn jog(&self, axis: Axis, degrees: f64) -> AppResult<()> {
        if !degrees.is_finite() {
            return Err(StationError::range(axis.field(), degrees, "-inf", "inf"));
        }
        let mut io = self.session.lock().await;
        io.write(&format!("jog inc {} {degrees}", axis.letter())).await?;
        tokio::time::sleep(MOVE_SETTLE).await;
        io.flush_input().await
    }

    /// Stop both axes.
    pub async fn halt(&self) -> AppResult<()> {
        let mut io = self.session.lock().await;
        io.write("JOG OFF X Y").await?;
        tokio::time::sleep(MOVE_SETTLE).await;
        io.flush_input().await
    }

    /// Move to the configured park position.
    pub async fn park(&self) -> AppResult<()> {
        let (az, el) = (self.calibration.park_azimuth, self.calibration.park_elevation);
        self.session.write(&format!("jog abs x {az} y {el}")).await
    }

    /// Point at an absolute azimuth and elevation.
    pub async fn point(&self, azimuth: f64, elevation: f64) -> AppResult<()> {
        check_range("azimuth", azimuth, AZIMUTH_RANGE)?;
        check_range("elevation", elevation, ELEVATION_RANGE)?;
        self.session
            .write(&format!("jog abs x {azimuth} y {elevation}"))
            .await
    }

    /// Iterate until `shutdown` turns true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("motion loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let pause = self.step().await;
            tokio::select! {
                _ = tokio::time::sleep(pause) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        warn!("shutdown channel closed");
                        break;
                    }
                }
            }
        }
        info!("motion loop stopped");
    }
}
