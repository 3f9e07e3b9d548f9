//! Spectrum analyzer helpers and the measurement state machine.
//!
//! # States
//!
//! ```text
//!            Request(Init)
//!   IDLE ───────────────────> INIT ──InitSucceeded──> LOOP
//!    ^                          │                       │
//!    └──────InitFailed──────────┘                       │
//!    └──────session closed / fatal status error─────────┘
//! ```
//!
//! In LOOP, a requested sweep (continuous or single) polls the operation register and
//! issues `:INIT:SAN` once the instrument is no longer busy.

use crate::config::TimingConfig;
use crate::core::{LoopState, Pace};
use crate::error::{AppResult, StationError};
use crate::parameter::ApplyRequest;
use crate::sequencer::Sequencer;
use crate::session::{Session, SessionIo};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Calibrating, settling, sweeping or measuring bits of `:STAT:OPER:COND?`
pub const BUSY_MASK: u32 = 0b0001_1011;

// =============================================================================
// Helpers (all expect the session lock to be held)
// =============================================================================

/// Parse a comma-separated ASCII reply, tolerating surrounding brackets.
pub fn parse_ascii_values(text: &str) -> AppResult<Vec<f64>> {
    let text = text.trim().trim_matches(|c| c == '[' || c == ']');
    if text.is_empty() {
        return Ok(Vec::new());
    }
    text.split(',')
        .map(|field| {
            let field = field.trim();
            field
                .parse::<f64>()
                .map_err(|_| StationError::Protocol(format!("not a number: '{field}'")))
        })
        .collect()
}

async fn query_register(io: &mut SessionIo, command: &str) -> AppResult<u32> {
    let reply = io.query(command).await?;
    let value = parse_ascii_values(&reply)?
        .first()
        .copied()
        .ok_or_else(|| StationError::Protocol(format!("empty reply to {command}")))?;
    Ok(value as u32)
}

fn strip_reply(reply: &str) -> String {
    reply.trim().trim_matches(|c| c == '[' || c == ']').trim().to_string()
}

/// `*IDN?` split into manufacturer, model, serial and firmware.
pub async fn identify(io: &mut SessionIo) -> AppResult<Vec<String>> {
    let reply = io.query("*IDN?").await?;
    Ok(strip_reply(&reply)
        .split(',')
        .map(|field| field.trim().to_string())
        .collect())
}

/// Preset the instrument and switch to single sweep.
pub async fn reset(io: &mut SessionIo) -> AppResult<()> {
    io.write("*RST").await?;
    io.write("*WAI").await?;
    io.write(":INIT:CONT OFF").await
}

/// Next entry of the error queue
pub async fn query_errors(io: &mut SessionIo) -> AppResult<String> {
    let reply = strip_reply(&io.query(":SYST:ERR?").await?);
    info!(session = io.name(), errors = %reply, "error queue");
    Ok(reply)
}

/// Errors recorded since power-up
pub async fn power_up_errors(io: &mut SessionIo) -> AppResult<String> {
    let reply = strip_reply(&io.query(":SYST:ERR:PUP?").await?);
    info!(session = io.name(), errors = %reply, "power-up errors");
    Ok(reply)
}

/// Operation status condition register
pub async fn operation_status(io: &mut SessionIo) -> AppResult<u32> {
    query_register(io, ":STAT:OPER:COND?").await
}

/// Standard event status register
pub async fn event_status(io: &mut SessionIo) -> AppResult<u32> {
    query_register(io, "*ESR?").await
}

/// Questionable calibration condition register
pub async fn calibration_status(io: &mut SessionIo) -> AppResult<u32> {
    query_register(io, ":STAT:QUES:CAL:COND?").await
}

/// Whether an operation register value means the instrument is busy.
pub fn is_busy(status: u32) -> bool {
    status & BUSY_MASK != 0
}

/// Front-panel sweep buttons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SweepAction {
    /// Flip between continuous and single sweep
    Toggle,
    /// Restart the current sweep
    Restart,
}

/// Apply a sweep button; returns whether the instrument is now sweeping continuously.
pub async fn sweep_control(io: &mut SessionIo, action: SweepAction) -> AppResult<bool> {
    let continuous = query_flag(io).await?;
    match action {
        SweepAction::Toggle => {
            let next = if continuous { "0" } else { "1" };
            io.write(&format!(":INIT:CONT {next}")).await?;
        }
        SweepAction::Restart => io.write(":INIT:IMM").await?,
    }
    query_flag(io).await
}

async fn query_flag(io: &mut SessionIo) -> AppResult<bool> {
    let values = parse_ascii_values(&io.query(":INIT:CONT?").await?)?;
    Ok(values.first().is_some_and(|v| *v != 0.0))
}

// =============================================================================
// State machine
// =============================================================================

/// Inputs to the measurement machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementEvent {
    /// Start of an iteration
    Tick {
        /// Whether the instrument session is open
        session_open: bool,
        /// Continuous or single sweep requested
        sweep_requested: bool,
    },
    /// Reset and refresh completed
    InitSucceeded,
    /// Reset or refresh failed
    InitFailed,
    /// Operation register read
    Status {
        /// Any busy bit set
        busy: bool,
    },
    /// Operation register could not be read
    StatusFailed {
        /// The failure was a timeout
        recoverable: bool,
    },
    /// `:INIT:SAN` could not be written
    SweepFailed {
        /// The failure was a timeout
        recoverable: bool,
    },
    /// External state change
    Request(LoopState),
}

/// Work the machine asks its driver to perform, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeasurementEffect {
    /// Grey out operator inputs
    DisableInputs,
    /// Enable operator inputs
    EnableInputs,
    /// Reset the instrument and refresh every parameter
    RunInit,
    /// Read the operation register
    ReadStatus,
    /// Issue `:INIT:SAN`
    StartSweep,
    /// Drop the single-sweep request
    ClearSingle,
    /// Drop the continuous-sweep request
    ClearContinuous,
    /// Log the error queue, best effort
    QueryErrors,
    /// End the iteration
    Sleep(Pace),
}

/// Pure transition function of the measurement machine.
pub fn transition(
    state: LoopState,
    event: MeasurementEvent,
) -> (LoopState, Vec<MeasurementEffect>) {
    use LoopState::*;
    use MeasurementEffect::*;
    use MeasurementEvent::*;

    match (state, event) {
        (_, Request(next)) => (next, vec![]),

        (Idle | Cleanup, Tick { .. }) => (Idle, vec![DisableInputs, Sleep(Pace::Idle)]),

        (Init, Tick { session_open: false, .. }) => (Idle, vec![DisableInputs]),
        (Init, Tick { .. }) => (Init, vec![RunInit]),
        (Init, InitSucceeded) => (Loop, vec![EnableInputs]),
        (Init, InitFailed) => (Idle, vec![QueryErrors, DisableInputs]),

        (Loop, Tick { session_open: false, .. }) => (Idle, vec![DisableInputs]),
        (Loop, Tick { sweep_requested: true, .. }) => (Loop, vec![EnableInputs, ReadStatus]),
        (Loop, Tick { .. }) => (Loop, vec![EnableInputs, Sleep(Pace::Idle)]),
        (Loop, Status { busy: true }) => (Loop, vec![Sleep(Pace::Loop)]),
        (Loop, Status { busy: false }) => (Loop, vec![StartSweep, ClearSingle, Sleep(Pace::Loop)]),
        (Loop, StatusFailed { recoverable: true }) => {
            (Loop, vec![ClearContinuous, Sleep(Pace::Loop)])
        }
        (Loop, StatusFailed { recoverable: false }) => (Idle, vec![ClearContinuous, DisableInputs]),
        (Loop, SweepFailed { recoverable: true }) => (Loop, vec![ClearContinuous]),
        (Loop, SweepFailed { recoverable: false }) => (Idle, vec![ClearContinuous, DisableInputs]),

        // Late results for a state that was left
        (state, _) => (state, vec![]),
    }
}

/// Observable state of the measurement machine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MeasurementSnapshot {
    /// Current state
    pub state: LoopState,
    /// Continuous sweep requested
    pub continuous: bool,
    /// Single sweep requested
    pub single: bool,
    /// Operator inputs enabled
    pub inputs_enabled: bool,
}

/// Drives the analyzer through [`transition`].
pub struct MeasurementMachine {
    session: Arc<Session>,
    sequencer: Arc<Sequencer>,
    idle_delay: Duration,
    loop_delay: Duration,
    state: watch::Sender<MeasurementSnapshot>,
}

impl MeasurementMachine {
    /// Machine over the analyzer session, idle
    pub fn new(session: Arc<Session>, sequencer: Arc<Sequencer>, timing: &TimingConfig) -> Self {
        let (state, _) = watch::channel(MeasurementSnapshot::default());
        Self {
            session,
            sequencer,
            idle_delay: timing.idle_delay,
            loop_delay: timing.analyzer_loop_delay,
            state,
        }
    }

    /// Current state and flags
    pub fn snapshot(&self) -> MeasurementSnapshot {
        *self.state.borrow()
    }

    /// Watch state changes
    pub fn subscribe(&self) -> watch::Receiver<MeasurementSnapshot> {
        self.state.subscribe()
    }

    /// Ask for a state change; takes effect on the next iteration.
    pub fn request(&self, requested: LoopState) {
        self.state.send_if_modified(|s| {
            let (next, _) = transition(s.state, MeasurementEvent::Request(requested));
            info!(from = %s.state, to = %next, "measurement state requested");
            let changed = next != s.state;
            s.state = next;
            changed
        });
    }

    /// Request or cancel continuous sweeping
    pub fn set_continuous(&self, on: bool) {
        self.state.send_modify(|s| s.continuous = on);
    }

    /// Request one sweep
    pub fn single_sweep(&self) {
        self.state.send_modify(|s| s.single = true);
    }

    /// Run one iteration and return how long to sleep before the next.
    pub async fn step(&self) -> Duration {
        let snapshot = self.snapshot();
        let mut events = VecDeque::from([MeasurementEvent::Tick {
            session_open: self.session.is_open(),
            sweep_requested: snapshot.continuous || snapshot.single,
        }]);
        let mut pause = Duration::ZERO;
        // Held from the status read through the sweep trigger
        let mut held: Option<SessionIo> = None;

        while let Some(event) = events.pop_front() {
            let current = self.snapshot().state;
            let (next, effects) = transition(current, event);
            if current == LoopState::Init && next == LoopState::Idle {
                if let MeasurementEvent::Tick { session_open: false, .. } = event {
                    error!("analyzer session is not open; connect, then reinitialize");
                }
            }
            if next != current {
                info!(from = %current, to = %next, ?event, "measurement state");
                self.state.send_modify(|s| s.state = next);
            }
            for effect in effects {
                if let Some(follow_up) = self.perform(effect, &mut pause, &mut held).await {
                    events.push_back(follow_up);
                }
            }
        }
        pause
    }

    async fn hold<'a>(&self, held: &'a mut Option<SessionIo>) -> &'a mut SessionIo {
        let io = match held.take() {
            Some(io) => io,
            None => self.session.lock().await,
        };
        held.insert(io)
    }

    async fn perform(
        &self,
        effect: MeasurementEffect,
        pause: &mut Duration,
        held: &mut Option<SessionIo>,
    ) -> Option<MeasurementEvent> {
        use MeasurementEffect::*;

        match effect {
            DisableInputs => self.state.send_modify(|s| s.inputs_enabled = false),
            EnableInputs => self.state.send_modify(|s| s.inputs_enabled = true),
            ClearSingle => self.state.send_modify(|s| s.single = false),
            ClearContinuous => self.state.send_modify(|s| s.continuous = false),
            Sleep(Pace::Idle) => *pause = self.idle_delay,
            Sleep(Pace::Loop) => *pause = self.loop_delay,
            RunInit => {
                return Some(match self.run_init(self.hold(held).await).await {
                    Ok(()) => MeasurementEvent::InitSucceeded,
                    Err(e) => {
                        error!(error = %e, "analyzer initialization failed");
                        MeasurementEvent::InitFailed
                    }
                });
            }
            QueryErrors => {
                if let Err(e) = query_errors(self.hold(held).await).await {
                    debug!(error = %e, "could not read the error queue");
                }
            }
            ReadStatus => {
                return Some(match operation_status(self.hold(held).await).await {
                    Ok(status) => MeasurementEvent::Status {
                        busy: is_busy(status),
                    },
                    Err(e) => {
                        error!(error = %e, "could not read the operation status register");
                        MeasurementEvent::StatusFailed {
                            recoverable: e.is_recoverable(),
                        }
                    }
                });
            }
            StartSweep => {
                if let Err(e) = self.hold(held).await.write(":INIT:SAN").await {
                    error!(error = %e, "could not start a sweep");
                    return Some(MeasurementEvent::SweepFailed {
                        recoverable: e.is_recoverable(),
                    });
                }
            }
        }
        None
    }

    async fn run_init(&self, io: &mut SessionIo) -> AppResult<()> {
        reset(io).await?;
        power_up_errors(io).await?;
        self.sequencer.apply_locked(io, &ApplyRequest::new()).await
    }

    /// Iterate until `shutdown` turns true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("measurement loop started");
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
        info!("measurement loop stopped");
    }
}
