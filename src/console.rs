//! Line-oriented operator console.
//!
//! Each line is one intent for the station. Arguments are whitespace separated;
//! double quotes group an argument that contains spaces.
//!
//! ```text
//! connect instrument "TCPIP0::10.0.0.5::INSTR"
//! apply startfreq=0 stopfreq=1e9 tracetype=MAXH
//! measure init
//! motion init
//! point 120 -5
//! plc DFS_CHAIN1
//! range "2026-10-20 08:00" "2026-10-20 20:00" 1h
//! start max-hold
//! status json
//! quit
//! ```

use crate::core::LoopState;
use crate::error::{AppResult, StationError};
use crate::instrument::{Axis, Opcode, SweepAction};
use crate::messages::Resource;
use crate::parameter::ApplyRequest;
use crate::scripting::preset;
use crate::station::StationHandle;
use chrono::{DateTime, Local, NaiveDateTime, NaiveTime, TimeZone};
use once_cell::sync::Lazy;
use regex::Regex;
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

static TOKEN: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r#""([^"]*)"|(\S+)"#).unwrap()
});

static KEY_VALUE: Lazy<Regex> = Lazy::new(|| {
    #[allow(clippy::unwrap_used)]
    Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)=(.*)$").unwrap()
});

const DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
];
const TIME_FORMATS: &[&str] = &["%H:%M:%S", "%H:%M"];

/// Help text printed by `help`
pub const HELP: &str = "\
connect <instrument|motor|relay> [address]   open a session
disconnect <instrument|motor|relay>          close a session
identify                                     analyzer *IDN?
apply key=value ...                          one apply pass
continuous <on|off> | single                 sweep flags
sweep <toggle|restart>                       sweep buttons
measure <idle|init|loop>                     measurement state
motion <idle|init|loop|cleanup>              motion state
jog <az|el> <degrees> | point <az> <el>      positioner moves
park | halt                                  positioner park / stop
plc <opcode> | plc-status                    relay PLC
enqueue <time> | range <start> <end> [interval] | clear-queue | queue
start [preset|file] | stop | toggle [preset|file]
status [json] | help | quit";

/// One parsed console line
#[derive(Debug, Clone, PartialEq)]
pub enum ConsoleCommand {
    /// `connect <resource> [address]`
    Connect(Resource, Option<String>),
    /// `disconnect <resource>`
    Disconnect(Resource),
    /// `identify`
    Identify,
    /// `apply k=v ...`
    Apply(ApplyRequest),
    /// `continuous on|off`
    Continuous(bool),
    /// `single`
    Single,
    /// `sweep toggle|restart`
    Sweep(SweepAction),
    /// `measure <state>`
    Measure(LoopState),
    /// `motion <state>`
    Motion(LoopState),
    /// `jog <axis> <degrees>`
    Jog(Axis, f64),
    /// `point <az> <el>`
    Point(f64, f64),
    /// `park`
    Park,
    /// `halt`
    Halt,
    /// `plc <opcode>`
    Plc(Opcode),
    /// `plc-status`
    PlcStatus,
    /// `enqueue <time>`
    Enqueue(DateTime<Local>),
    /// `range <start> <end> [interval]`
    Range(DateTime<Local>, DateTime<Local>, Duration),
    /// `clear-queue`
    ClearQueue,
    /// `queue`
    Queue,
    /// `start [preset|file]`
    Start(Option<String>),
    /// `stop`
    Stop,
    /// `toggle [preset|file]`
    Toggle(Option<String>),
    /// `status [json]`
    Status { json: bool },
    /// `help`
    Help,
    /// `quit` / `exit`
    Quit,
}

fn usage(message: impl Into<String>) -> StationError {
    StationError::Protocol(message.into())
}

/// Split a line into arguments, honouring double quotes.
pub fn tokenize(line: &str) -> Vec<String> {
    TOKEN
        .captures_iter(line)
        .filter_map(|c| c.get(1).or_else(|| c.get(2)))
        .map(|m| m.as_str().to_string())
        .collect()
}

/// `key=value` arguments into an apply request
pub fn parse_assignments(args: &[String]) -> AppResult<ApplyRequest> {
    args.iter()
        .map(|arg| {
            KEY_VALUE
                .captures(arg)
                .map(|c| (c[1].to_string(), c[2].to_string()))
                .ok_or_else(|| usage(format!("expected key=value, got '{arg}'")))
        })
        .collect::<AppResult<Vec<_>>>()
        .map(|pairs| pairs.into_iter().collect())
}

/// Local wall-clock time: a full date and time, or a time of day today.
pub fn parse_local_time(text: &str) -> AppResult<DateTime<Local>> {
    let naive = DATE_TIME_FORMATS
        .iter()
        .find_map(|format| NaiveDateTime::parse_from_str(text, format).ok())
        .or_else(|| {
            TIME_FORMATS
                .iter()
                .find_map(|format| NaiveTime::parse_from_str(text, format).ok())
                .map(|time| Local::now().date_naive().and_time(time))
        })
        .ok_or_else(|| usage(format!("cannot read '{text}' as a time (YYYY-MM-DD HH:MM[:SS] or HH:MM)")))?;

    Local
        .from_local_datetime(&naive)
        .earliest()
        .ok_or_else(|| usage(format!("'{text}' does not exist in the local time zone")))
}

/// `1h`, `30m`, `90s`, or plain seconds
pub fn parse_interval(text: &str) -> AppResult<Duration> {
    if let Ok(seconds) = text.parse::<u64>() {
        return Ok(Duration::from_secs(seconds));
    }
    humantime_serde::re::humantime::parse_duration(text)
        .map_err(|e| usage(format!("bad interval '{text}': {e}")))
}

fn number(arg: Option<&String>, what: &str) -> AppResult<f64> {
    let arg = arg.ok_or_else(|| usage(format!("missing {what}")))?;
    arg.parse::<f64>()
        .map_err(|_| usage(format!("{what} '{arg}' is not a number")))
}

fn required<'a>(arg: Option<&'a String>, what: &str) -> AppResult<&'a str> {
    arg.map(String::as_str)
        .ok_or_else(|| usage(format!("missing {what}")))
}

/// Parse one line. Blank lines and `#` comments yield `None`.
pub fn parse_line(line: &str) -> AppResult<Option<ConsoleCommand>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(None);
    }
    let tokens = tokenize(line);
    let Some((verb, args)) = tokens.split_first() else {
        return Ok(None);
    };

    let command = match verb.to_ascii_lowercase().as_str() {
        "connect" => ConsoleCommand::Connect(
            required(args.first(), "resource")?.parse()?,
            args.get(1).cloned(),
        ),
        "disconnect" => ConsoleCommand::Disconnect(required(args.first(), "resource")?.parse()?),
        "identify" | "idn" => ConsoleCommand::Identify,
        "apply" => ConsoleCommand::Apply(parse_assignments(args)?),
        "continuous" => match required(args.first(), "on|off")?.to_ascii_lowercase().as_str() {
            "on" | "1" | "true" => ConsoleCommand::Continuous(true),
            "off" | "0" | "false" => ConsoleCommand::Continuous(false),
            other => return Err(usage(format!("continuous expects on|off, got '{other}'"))),
        },
        "single" => ConsoleCommand::Single,
        "sweep" => match required(args.first(), "toggle|restart")?.to_ascii_lowercase().as_str() {
            "toggle" => ConsoleCommand::Sweep(SweepAction::Toggle),
            "restart" => ConsoleCommand::Sweep(SweepAction::Restart),
            other => return Err(usage(format!("sweep expects toggle|restart, got '{other}'"))),
        },
        "measure" => ConsoleCommand::Measure(required(args.first(), "state")?.parse().map_err(usage)?),
        "motion" => ConsoleCommand::Motion(required(args.first(), "state")?.parse().map_err(usage)?),
        "jog" => ConsoleCommand::Jog(
            required(args.first(), "axis")?.parse().map_err(usage)?,
            number(args.get(1), "degrees")?,
        ),
        "point" => ConsoleCommand::Point(number(args.first(), "azimuth")?, number(args.get(1), "elevation")?),
        "park" => ConsoleCommand::Park,
        "halt" => ConsoleCommand::Halt,
        "plc" => ConsoleCommand::Plc(required(args.first(), "opcode")?.parse()?),
        "plc-status" => ConsoleCommand::PlcStatus,
        "enqueue" => ConsoleCommand::Enqueue(parse_local_time(required(args.first(), "time")?)?),
        "range" => ConsoleCommand::Range(
            parse_local_time(required(args.first(), "start time")?)?,
            parse_local_time(required(args.get(1), "end time")?)?,
            match args.get(2) {
                Some(interval) => parse_interval(interval)?,
                None => Duration::ZERO,
            },
        ),
        "clear-queue" => ConsoleCommand::ClearQueue,
        "queue" => ConsoleCommand::Queue,
        "start" => ConsoleCommand::Start(args.first().cloned()),
        "stop" => ConsoleCommand::Stop,
        "toggle" => ConsoleCommand::Toggle(args.first().cloned()),
        "status" => ConsoleCommand::Status {
            json: args.first().is_some_and(|a| a.eq_ignore_ascii_case("json")),
        },
        "help" | "?" => ConsoleCommand::Help,
        "quit" | "exit" => ConsoleCommand::Quit,
        other => return Err(usage(format!("unknown command '{other}', try 'help'"))),
    };
    Ok(Some(command))
}

/// Hook script text for `start`/`toggle`: a preset name or a file path.
pub async fn resolve_hooks(argument: Option<String>) -> AppResult<Option<String>> {
    match argument {
        None => Ok(None),
        Some(name) => match preset(&name) {
            Some(script) => Ok(Some(script.to_string())),
            None => Ok(Some(tokio::fs::read_to_string(PathBuf::from(name)).await?)),
        },
    }
}

/// Result of one console command
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Text to print; may be empty
    Reply(String),
    /// Leave the console
    Quit,
}

/// Send `command` to the station and render the reply.
pub async fn execute(handle: &StationHandle, command: ConsoleCommand) -> AppResult<Outcome> {
    debug!(?command, "console command");
    let text = match command {
        ConsoleCommand::Connect(resource, address) => {
            handle.connect(resource, address).await?;
            format!("{resource} connected")
        }
        ConsoleCommand::Disconnect(resource) => {
            handle.disconnect(resource).await?;
            format!("{resource} disconnected")
        }
        ConsoleCommand::Identify => handle.identify().await?.join(", "),
        ConsoleCommand::Apply(request) => {
            handle.apply(request).await?;
            String::new()
        }
        ConsoleCommand::Continuous(on) => {
            handle.set_continuous(on).await?;
            String::new()
        }
        ConsoleCommand::Single => {
            handle.single_sweep().await?;
            String::new()
        }
        ConsoleCommand::Sweep(action) => {
            let continuous = handle.sweep_control(action).await?;
            format!("continuous {}", if continuous { "on" } else { "off" })
        }
        ConsoleCommand::Measure(state) => {
            handle.request_measurement(state).await?;
            String::new()
        }
        ConsoleCommand::Motion(state) => {
            handle.request_motion(state).await?;
            String::new()
        }
        ConsoleCommand::Jog(axis, degrees) => {
            handle.jog(axis, degrees).await?;
            String::new()
        }
        ConsoleCommand::Point(azimuth, elevation) => {
            handle.point(azimuth, elevation).await?;
            String::new()
        }
        ConsoleCommand::Park => {
            handle.park().await?;
            String::new()
        }
        ConsoleCommand::Halt => {
            handle.halt().await?;
            String::new()
        }
        ConsoleCommand::Plc(opcode) => format!("plc status {}", handle.plc(opcode).await?),
        ConsoleCommand::PlcStatus => format!("plc status {}", handle.plc_status().await?),
        ConsoleCommand::Enqueue(at) => {
            handle.enqueue(at).await?;
            format!("queued {}", at.format("%Y-%m-%d %H:%M:%S"))
        }
        ConsoleCommand::Range(start, end, interval) => {
            let added = handle.enqueue_range(start, end, interval).await?;
            format!("queued {added} times")
        }
        ConsoleCommand::ClearQueue => {
            handle.clear_queue().await?;
            "queue cleared".to_string()
        }
        ConsoleCommand::Queue => handle
            .queue()
            .await?
            .iter()
            .map(|at| at.format("%Y-%m-%d %H:%M:%S").to_string())
            .collect::<Vec<_>>()
            .join("\n"),
        ConsoleCommand::Start(hooks) => {
            handle.start_automation(resolve_hooks(hooks).await?).await?;
            "automation ACTIVE".to_string()
        }
        ConsoleCommand::Stop => {
            handle.stop_automation().await?;
            "automation IDLE".to_string()
        }
        ConsoleCommand::Toggle(hooks) => {
            let state = handle.toggle_automation(resolve_hooks(hooks).await?).await?;
            format!("automation {state}")
        }
        ConsoleCommand::Status { json } => {
            let status = handle.status().await?;
            if json {
                serde_json::to_string_pretty(&status)
                    .map_err(|e| StationError::Protocol(format!("status encoding failed: {e}")))?
            } else {
                status.summary()
            }
        }
        ConsoleCommand::Help => HELP.to_string(),
        ConsoleCommand::Quit => return Ok(Outcome::Quit),
    };
    Ok(Outcome::Reply(text))
}

/// Read commands from `input` until EOF or `quit`, writing replies to `output`.
///
/// Errors are printed and the console keeps going; only I/O on the console itself ends it.
pub async fn run<R, W>(handle: &StationHandle, input: R, mut output: W) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        let reply = match parse_line(&line) {
            Ok(None) => continue,
            Ok(Some(command)) => execute(handle, command).await,
            Err(e) => Err(e),
        };
        match reply {
            Ok(Outcome::Quit) => break,
            Ok(Outcome::Reply(text)) if text.is_empty() => output.write_all(b"ok\n").await?,
            Ok(Outcome::Reply(text)) => output.write_all(format!("{text}\n").as_bytes()).await?,
            Err(e) => {
                warn!(error = %e, "console command failed");
                output.write_all(format!("error: {e}\n").as_bytes()).await?;
            }
        }
        output.flush().await?;
    }
    Ok(())
}
