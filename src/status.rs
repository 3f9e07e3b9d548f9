//! Read-only status monitor.
//!
//! Every `status_monitor_delay` the monitor gathers the lock-free snapshots published by
//! the sessions, state machines, PLC controller and automation, and republishes them as
//! one [`StationStatus`] on a `watch` channel. It never takes a session lock and never
//! changes core state.

use crate::automation::{Automation, AutomationSnapshot};
use crate::instrument::{MeasurementMachine, MeasurementSnapshot, MotionMachine, MotionSnapshot};
use crate::instrument::{PlcController, PlcSnapshot};
use crate::session::{Session, SessionInfo};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Everything the presentation layer shows about the station
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StationStatus {
    /// Analyzer session
    pub instrument: SessionInfo,
    /// Positioner session
    pub motor: SessionInfo,
    /// Relay PLC session
    pub relay: SessionInfo,
    /// Measurement machine
    pub measurement: MeasurementSnapshot,
    /// Motion machine
    pub motion: MotionSnapshot,
    /// PLC status and chain
    pub plc: PlcSnapshot,
    /// Automation state and queue length
    pub automation: AutomationSnapshot,
}

/// `Connected` or `NC`
pub fn connection_label(info: &SessionInfo) -> &'static str {
    if info.open {
        "Connected"
    } else {
        "NC"
    }
}

fn drive_label(enabled: Option<bool>) -> &'static str {
    match enabled {
        Some(true) => "ENABLED",
        Some(false) => "STOPPED",
        None => "-",
    }
}

impl StationStatus {
    /// One-line summary used for change logging and the console
    pub fn summary(&self) -> String {
        let position = self
            .motion
            .position
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        format!(
            "analyzer {} {} | motor {} {} az {} el {} ({position}) | plc {} {} | automation {} ({} queued)",
            connection_label(&self.instrument),
            self.measurement.state,
            connection_label(&self.motor),
            self.motion.state,
            drive_label(self.motion.axis0),
            drive_label(self.motion.axis1),
            connection_label(&self.relay),
            self.plc.chain,
            self.automation.state,
            self.automation.queued,
        )
    }
}

/// Components the monitor reads from
#[derive(Clone)]
pub struct StatusSources {
    /// Analyzer session
    pub instrument: Arc<Session>,
    /// Positioner session
    pub motor: Arc<Session>,
    /// Relay PLC session
    pub relay: Arc<Session>,
    /// Measurement machine
    pub measurement: Arc<MeasurementMachine>,
    /// Motion machine
    pub motion: Arc<MotionMachine>,
    /// PLC controller
    pub plc: Arc<PlcController>,
    /// Automation
    pub automation: Arc<Automation>,
}

/// Polls [`StatusSources`] and publishes [`StationStatus`].
pub struct StatusMonitor {
    sources: StatusSources,
    delay: Duration,
    status: watch::Sender<StationStatus>,
}

impl StatusMonitor {
    /// Monitor polling every `delay`
    pub fn new(sources: StatusSources, delay: Duration) -> Self {
        let (status, _) = watch::channel(StationStatus::default());
        Self {
            sources,
            delay,
            status,
        }
    }

    /// Latest published status
    pub fn subscribe(&self) -> watch::Receiver<StationStatus> {
        self.status.subscribe()
    }

    /// Gather a fresh status without publishing it.
    pub fn collect(&self) -> StationStatus {
        let s = &self.sources;
        StationStatus {
            instrument: s.instrument.info(),
            motor: s.motor.info(),
            relay: s.relay.info(),
            measurement: s.measurement.snapshot(),
            motion: s.motion.snapshot(),
            plc: s.plc.snapshot(),
            automation: s.automation.snapshot(),
        }
    }

    /// Collect and publish; returns whether anything changed.
    pub fn refresh(&self) -> bool {
        let next = self.collect();
        let previous_summary = self.status.borrow().summary();
        let changed = self.status.send_if_modified(|current| {
            if *current == next {
                false
            } else {
                *current = next;
                true
            }
        });
        if changed {
            let summary = self.status.borrow().summary();
            if summary != previous_summary {
                info!(target: "status", "{summary}");
            } else {
                debug!(target: "status", "status updated");
            }
        }
        changed
    }

    /// Poll until `shutdown` turns true.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!("status monitor started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            self.refresh();
            tokio::select! {
                _ = tokio::time::sleep(self.delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }
        info!("status monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{LoopState, Position};

    #[test]
    fn test_summary_labels() {
        let mut status = StationStatus::default();
        status.instrument.open = true;
        status.measurement.state = LoopState::Loop;
        status.motion.axis0 = Some(true);
        status.motion.axis1 = Some(false);
        status.motion.position = Some(Position {
            azimuth: 12.5,
            elevation: -3.0,
        });

        let summary = status.summary();
        assert!(summary.starts_with("analyzer Connected LOOP | motor NC IDLE az ENABLED el STOPPED"));
        assert!(summary.contains("plc NC SLEEP"));
        assert!(summary.contains("automation IDLE (0 queued)"));
    }
}
