//! Station bindings for hook scripts.
//!
//! Scripts reach hardware through three handle types plus a few free functions. Every
//! call takes the relevant session lock itself, exactly like an operator command, so a
//! script can never hold a lock across its own statements.
//!
//! ```rhai
//! fn onSchedule() {
//!     relay().send("EMS_CHAIN1");
//!     apply(#{ startfreq: 0, stopfreq: 1e9, tracetype: "MAXH" });
//!     sleep(30.0);
//!     let path = save_trace();
//!     print(`saved ${path}`);
//!     motor().point(120.0, -5.0);
//! }
//! ```
//!
//! | Binding | Effect |
//! |---|---|
//! | `instrument().write(cmd)` / `.query(cmd)` | raw analyzer I/O |
//! | `instrument().param(key)` | last value read back for `key` |
//! | `instrument().restart_sweep()` | `:INIT:IMM` |
//! | `apply(map)` | one apply pass on the analyzer |
//! | `motor().jog(axis, deg)` / `.point(az, el)` / `.park()` / `.halt()` / `.position()` | positioner |
//! | `relay().send(op)` / `.status()` / `.chain()` | RF relay PLC |
//! | `sleep(seconds)` | pause the hook |
//! | `save_trace()` | fetch a trace and write it under the data directory |
//!
//! # Async→Sync Bridge
//!
//! Bindings block on the station runtime with [`Handle::block_on`]. That is only legal
//! off the async workers, which is why hooks are always called on the blocking pool.

use crate::error::{AppResult, StationError};
use crate::instrument::analyzer::{sweep_control, SweepAction};
use crate::instrument::display::fetch_trace;
use crate::instrument::motion::{Axis, MotionMachine};
use crate::instrument::plc::{Opcode, PlcController};
use crate::parameter::ApplyRequest;
use crate::record::{next_record_path, SampleRecord};
use crate::sequencer::Sequencer;
use crate::session::Session;
use rhai::{Dynamic, Engine, EvalAltResult, Map, Position, INT};
use std::fmt::Display;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;

/// Everything hook scripts may touch
#[derive(Clone)]
pub struct StationBindings {
    /// Runtime the bindings block on
    pub runtime: Handle,
    /// Analyzer session
    pub instrument: Arc<Session>,
    /// Analyzer parameter sequencer
    pub sequencer: Arc<Sequencer>,
    /// Positioner
    pub motion: Arc<MotionMachine>,
    /// RF relay PLC
    pub plc: Arc<PlcController>,
    /// Where `save_trace` writes records
    pub data_dir: PathBuf,
}

/// `instrument()` in scripts
#[derive(Clone)]
pub struct InstrumentHandle {
    bindings: StationBindings,
}

/// `motor()` in scripts
#[derive(Clone)]
pub struct MotorHandle {
    bindings: StationBindings,
}

/// `relay()` in scripts
#[derive(Clone)]
pub struct RelayHandle {
    bindings: StationBindings,
}

type ScriptResult<T> = Result<T, Box<EvalAltResult>>;

fn script_error(label: &str, e: impl Display) -> Box<EvalAltResult> {
    Box::new(EvalAltResult::ErrorRuntime(
        format!("{label}: {e}").into(),
        Position::NONE,
    ))
}

fn run_blocking<T>(
    runtime: &Handle,
    label: &str,
    future: impl Future<Output = AppResult<T>>,
) -> ScriptResult<T> {
    runtime.block_on(future).map_err(|e| script_error(label, e))
}

/// Integral floats print without a fraction so `1e9` reaches the analyzer as `1000000000`.
fn argument_text(value: &Dynamic) -> String {
    if let Some(x) = value.clone().try_cast::<f64>() {
        if x.fract() == 0.0 && x.abs() < 1e15 {
            return format!("{}", x as i64);
        }
        return x.to_string();
    }
    value.to_string()
}

fn apply_map(bindings: &StationBindings, map: Map) -> ScriptResult<()> {
    let request: ApplyRequest = map
        .iter()
        .map(|(key, value)| (key.to_string(), argument_text(value)))
        .collect();
    let sequencer = bindings.sequencer.clone();
    let session = bindings.instrument.clone();
    run_blocking(&bindings.runtime, "apply", async move {
        sequencer.apply(&session, &request).await
    })
}

fn save_trace(bindings: &StationBindings) -> ScriptResult<String> {
    let session = bindings.instrument.clone();
    let sequencer = bindings.sequencer.clone();
    let record = run_blocking(&bindings.runtime, "save_trace", async move {
        let trace = fetch_trace(&session).await?;
        Ok(SampleRecord {
            parameters: sequencer.registry().loggable_snapshot().await,
            x: trace.x,
            y: trace.y,
        })
    })?;

    std::fs::create_dir_all(&bindings.data_dir).map_err(|e| script_error("save_trace", e))?;
    let path = next_record_path(&bindings.data_dir, &bindings.plc.snapshot().chain);
    record
        .write_delimited(&path)
        .map_err(|e| script_error("save_trace", format!("{e:#}")))?;
    tracing::info!(target: "automation", path = %path.display(), "trace saved");
    Ok(path.display().to_string())
}

fn position_map(motion: &MotionMachine) -> Map {
    let mut map = Map::new();
    if let Some(position) = motion.snapshot().position {
        map.insert("azimuth".into(), Dynamic::from_float(position.azimuth));
        map.insert("elevation".into(), Dynamic::from_float(position.elevation));
    }
    map
}

/// Register the handle types and functions on `engine`.
pub fn register_station(engine: &mut Engine, bindings: StationBindings) {
    engine.register_type_with_name::<InstrumentHandle>("Instrument");
    engine.register_type_with_name::<MotorHandle>("Motor");
    engine.register_type_with_name::<RelayHandle>("Relay");

    let b = bindings.clone();
    engine.register_fn("instrument", move || InstrumentHandle { bindings: b.clone() });
    let b = bindings.clone();
    engine.register_fn("motor", move || MotorHandle { bindings: b.clone() });
    let b = bindings.clone();
    engine.register_fn("relay", move || RelayHandle { bindings: b.clone() });

    // =========================================================================
    // Analyzer
    // =========================================================================

    engine.register_fn(
        "write",
        |h: &mut InstrumentHandle, command: &str| -> ScriptResult<()> {
            let session = h.bindings.instrument.clone();
            let command = command.to_string();
            run_blocking(&h.bindings.runtime, "instrument.write", async move {
                session.write(&command).await
            })
        },
    );
    engine.register_fn(
        "query",
        |h: &mut InstrumentHandle, command: &str| -> ScriptResult<String> {
            let session = h.bindings.instrument.clone();
            let command = command.to_string();
            run_blocking(&h.bindings.runtime, "instrument.query", async move {
                session.query(&command).await.map(|reply| reply.trim().to_string())
            })
        },
    );
    engine.register_fn("param", |h: &mut InstrumentHandle, key: &str| -> String {
        let registry = h.bindings.sequencer.registry().clone();
        let key = key.to_string();
        h.bindings
            .runtime
            .block_on(async move { registry.value(&key).await })
            .unwrap_or_default()
    });
    engine.register_fn("apply", |h: &mut InstrumentHandle, map: Map| {
        apply_map(&h.bindings, map)
    });
    engine.register_fn(
        "restart_sweep",
        |h: &mut InstrumentHandle| -> ScriptResult<bool> {
            let session = h.bindings.instrument.clone();
            run_blocking(&h.bindings.runtime, "instrument.restart_sweep", async move {
                let mut io = session.lock().await;
                sweep_control(&mut io, SweepAction::Restart).await
            })
        },
    );
    engine.register_fn("is_open", |h: &mut InstrumentHandle| h.bindings.instrument.is_open());

    let b = bindings.clone();
    engine.register_fn("apply", move |map: Map| apply_map(&b, map));
    let b = bindings.clone();
    engine.register_fn("save_trace", move || save_trace(&b));

    // =========================================================================
    // Positioner
    // =========================================================================

    fn jog(h: &mut MotorHandle, axis: &str, degrees: f64) -> ScriptResult<()> {
        let axis: Axis = axis.parse().map_err(|e| script_error("motor.jog", e))?;
        let motion = h.bindings.motion.clone();
        run_blocking(&h.bindings.runtime, "motor.jog", async move {
            motion.jog(axis, degrees).await
        })
    }
    fn point(h: &mut MotorHandle, azimuth: f64, elevation: f64) -> ScriptResult<()> {
        let motion = h.bindings.motion.clone();
        run_blocking(&h.bindings.runtime, "motor.point", async move {
            motion.point(azimuth, elevation).await
        })
    }

    engine.register_fn("jog", jog);
    engine.register_fn("jog", |h: &mut MotorHandle, axis: &str, degrees: INT| {
        jog(h, axis, degrees as f64)
    });
    engine.register_fn("point", point);
    engine.register_fn("point", |h: &mut MotorHandle, azimuth: INT, elevation: INT| {
        point(h, azimuth as f64, elevation as f64)
    });
    engine.register_fn("park", |h: &mut MotorHandle| -> ScriptResult<()> {
        let motion = h.bindings.motion.clone();
        run_blocking(&h.bindings.runtime, "motor.park", async move { motion.park().await })
    });
    engine.register_fn("halt", |h: &mut MotorHandle| -> ScriptResult<()> {
        let motion = h.bindings.motion.clone();
        run_blocking(&h.bindings.runtime, "motor.halt", async move { motion.halt().await })
    });
    engine.register_fn("position", |h: &mut MotorHandle| position_map(&h.bindings.motion));

    // =========================================================================
    // Relay PLC
    // =========================================================================

    fn send(h: &mut RelayHandle, opcode: Opcode) -> ScriptResult<INT> {
        let plc = h.bindings.plc.clone();
        run_blocking(&h.bindings.runtime, "relay.send", async move {
            plc.send(opcode).await.map(INT::from)
        })
    }

    engine.register_fn("send", |h: &mut RelayHandle, opcode: &str| -> ScriptResult<INT> {
        let opcode = opcode
            .parse::<Opcode>()
            .map_err(|e| script_error("relay.send", e))?;
        send(h, opcode)
    });
    engine.register_fn("send", |h: &mut RelayHandle, opcode: INT| -> ScriptResult<INT> {
        let opcode = u8::try_from(opcode)
            .map(Opcode)
            .map_err(|_| script_error("relay.send", StationError::range("opcode", opcode, 0, 255)))?;
        send(h, opcode)
    });
    engine.register_fn("status", |h: &mut RelayHandle| INT::from(h.bindings.plc.snapshot().status));
    engine.register_fn("chain", |h: &mut RelayHandle| h.bindings.plc.snapshot().chain);

    // =========================================================================
    // Utilities
    // =========================================================================

    let runtime = bindings.runtime.clone();
    engine.register_fn("sleep", move |seconds: f64| -> ScriptResult<()> {
        if !seconds.is_finite() || seconds < 0.0 {
            return Err(script_error("sleep", StationError::range("seconds", seconds, 0, "inf")));
        }
        runtime.block_on(tokio::time::sleep(Duration::from_secs_f64(seconds)));
        Ok(())
    });
    let runtime = bindings.runtime;
    engine.register_fn("sleep", move |seconds: INT| -> ScriptResult<()> {
        let seconds = u64::try_from(seconds)
            .map_err(|_| script_error("sleep", StationError::range("seconds", seconds, 0, "inf")))?;
        runtime.block_on(tokio::time::sleep(Duration::from_secs(seconds)));
        Ok(())
    });
}
