//! Trace fetch-and-publish loop.
//!
//! Runs beside the measurement machine on the same analyzer session. `:FETCH:SAN?`
//! refuses to answer mid-sweep, so each iteration rebuilds the X axis from the
//! start/stop/points settings and reads the raw trace instead.

use super::analyzer::parse_ascii_values;
use crate::core::{DisplayLock, SampleSink, SpectrumPlot};
use crate::error::{AppResult, StationError};
use crate::record::SampleRecord;
use crate::sequencer::Registry;
use crate::session::Session;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Evenly spaced axis: `x[i] = start + i * (stop - start) / (points - 1)`.
pub fn x_axis(start: f64, stop: f64, points: usize) -> Vec<f64> {
    match points {
        0 => Vec::new(),
        1 => vec![start],
        n => {
            let step = (stop - start) / (n - 1) as f64;
            (0..n).map(|i| start + i as f64 * step).collect()
        }
    }
}

/// One fetched trace
#[derive(Debug, Clone, PartialEq)]
pub struct Trace {
    /// X axis
    pub x: Vec<f64>,
    /// Amplitudes
    pub y: Vec<f64>,
}

/// Fetch start, stop, points and the trace under one session lock.
pub async fn fetch_trace(session: &Session) -> AppResult<Trace> {
    let mut io = session.lock().await;
    let start = first_value(&io.query(":SENS:FREQ:START?").await?, "start frequency")?;
    let stop = first_value(&io.query(":SENS:FREQ:STOP?").await?, "stop frequency")?;
    let points = first_value(&io.query(":SENS:SWEEP:POINTS?").await?, "sweep points")?;
    let y = parse_ascii_values(&io.query(":TRACE:DATA? TRACE1").await?)?;
    drop(io);

    Ok(Trace {
        x: x_axis(start, stop, points.max(0.0) as usize),
        y,
    })
}

fn first_value(reply: &str, what: &str) -> AppResult<f64> {
    parse_ascii_values(reply)?
        .first()
        .copied()
        .ok_or_else(|| StationError::Protocol(format!("empty {what} reply")))
}

/// Periodically fetches the trace, stores it on the plot and publishes a record.
pub struct DisplayLoop {
    session: Arc<Session>,
    registry: Registry,
    plot: DisplayLock<SpectrumPlot>,
    sink: Arc<dyn SampleSink>,
    refresh_delay: Duration,
    previous: Mutex<Vec<f64>>,
}

impl DisplayLoop {
    /// Loop over the analyzer session
    pub fn new(
        session: Arc<Session>,
        registry: Registry,
        plot: DisplayLock<SpectrumPlot>,
        sink: Arc<dyn SampleSink>,
        refresh_delay: Duration,
    ) -> Self {
        Self {
            session,
            registry,
            plot,
            sink,
            refresh_delay,
            previous: Mutex::new(Vec::new()),
        }
    }

    /// Fetch and publish once. Returns the record, or `None` when nothing was published.
    pub async fn step(&self) -> Option<SampleRecord> {
        if !self.session.is_open() {
            return None;
        }
        let trace = match fetch_trace(&self.session).await {
            Ok(trace) => trace,
            Err(e) => {
                debug!(error = %e, "trace fetch skipped");
                return None;
            }
        };

        {
            let mut plot = self.plot.lock().await;
            plot.x = trace.x.clone();
            plot.y = trace.y.clone();
        }

        let changed = {
            let mut previous = self.previous.lock().await;
            let changed = *previous != trace.y;
            if changed {
                previous.clone_from(&trace.y);
            }
            changed
        };
        if changed {
            let now = chrono::Local::now().to_rfc3339();
            if let Err(e) = self.registry.stamp("time", now).await {
                warn!(error = %e, "could not stamp trace time");
            }
        }

        let record = SampleRecord {
            parameters: self.registry.loggable_snapshot().await,
            x: trace.x,
            y: trace.y,
        };
        self.sink.publish_sample(&record);
        Some(record)
    }

    /// Iterate until `shutdown` turns true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("display loop started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.step().await;
            tokio::select! {
                _ = tokio::time::sleep(self.refresh_delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("display loop stopped");
    }
}
