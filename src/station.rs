//! Station wiring, command actor and graceful shutdown.
//!
//! [`Station`] builds every component from [`Settings`]: three sessions, the sequencer,
//! both state machines, the display loop, the PLC controller, automation and the status
//! monitor. [`Station::spawn`] starts the long-lived loops plus a [`StationActor`] and
//! returns a [`StationHandle`] for issuing [`StationCommand`]s.
//!
//! ```text
//! StationHandle ──mpsc──> StationActor ──┬── inline: state requests, queue edits, status
//!                                        └── spawned: device I/O (apply, jog, plc, ...)
//!
//! loops: measurement · display · motion · scheduler · status monitor
//!        (each stops on the shared shutdown watch)
//! ```
//!
//! Commands that talk to a device run as their own tasks so a slow query never blocks
//! state requests; the session lock still serializes them per device.

use crate::adapters::{MockAdapter, VisaOptions};
use crate::automation::{Automation, AutomationState, JobScheduler, SchedulerPolicy};
use crate::config::{ConfigError, Settings};
use crate::core::{display_lock, NullSink, PositionSink, SampleSink};
use crate::error::{AppResult, StationError};
use crate::error_recovery::{combine, retry, RetryPolicy};
use crate::instrument::analyzer::{identify, sweep_control};
use crate::instrument::{DisplayLoop, MeasurementMachine, MotionMachine, PlcController};
use crate::messages::{Reply, Resource, StationCommand};
use crate::parameter::{ApplyRequest, ParameterSink};
use crate::scripting::{HookEngine, HookLimits, StationBindings, DEFAULT_HOOKS};
use crate::sequencer::{Registry, Sequencer};
use crate::session::{
    mock_connector, serial_connector, visa_connector, Connector, Session, SessionOptions,
};
use crate::status::{StationStatus, StatusMonitor, StatusSources};
use chrono::{DateTime, Local};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

const COMMAND_CAPACITY: usize = 64;

/// Transport factories for the three sessions
#[derive(Clone)]
pub struct Connectors {
    /// Analyzer transports
    pub instrument: Connector,
    /// Positioner transports
    pub motor: Connector,
    /// Relay PLC transports
    pub relay: Connector,
}

impl Connectors {
    /// VISA for the analyzer, serial ports for the positioner and the PLC
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            instrument: visa_connector(VisaOptions::from(&settings.instrument)),
            motor: serial_connector(
                settings.motor.baud_rate,
                Duration::from_millis(settings.motor.timeout_ms),
            ),
            relay: serial_connector(
                settings.relay.baud_rate,
                Duration::from_millis(settings.relay.timeout_ms),
            ),
        }
    }

    /// In-memory devices, for tests and dry runs
    pub fn mock(instrument: MockAdapter, motor: MockAdapter, relay: MockAdapter) -> Self {
        Self {
            instrument: mock_connector(instrument),
            motor: mock_connector(motor),
            relay: mock_connector(relay),
        }
    }
}

/// Presentation-side receivers
#[derive(Clone)]
pub struct Sinks {
    /// Every fetched trace
    pub sample: Arc<dyn SampleSink>,
    /// Every computed antenna position
    pub position: Arc<dyn PositionSink>,
    /// Every refreshed parameter, if anyone listens
    pub parameter: Option<Arc<dyn ParameterSink>>,
}

impl Default for Sinks {
    fn default() -> Self {
        Self {
            sample: Arc::new(NullSink),
            position: Arc::new(NullSink),
            parameter: None,
        }
    }
}

/// Default record directory: `application.data_dir`, else the user data dir.
pub fn data_dir(settings: &Settings) -> PathBuf {
    settings.application.data_dir.clone().unwrap_or_else(|| {
        dirs::data_dir()
            .map(|dir| dir.join("spectrum-monitor").join("records"))
            .unwrap_or_else(|| PathBuf::from("records"))
    })
}

/// Every station component. Cloning shares them.
#[derive(Clone)]
pub struct Station {
    settings: Arc<Settings>,
    instrument: Arc<Session>,
    motor: Arc<Session>,
    relay: Arc<Session>,
    sequencer: Arc<Sequencer>,
    measurement: Arc<MeasurementMachine>,
    display: Arc<DisplayLoop>,
    motion: Arc<MotionMachine>,
    plc: Arc<PlcController>,
    automation: Arc<Automation>,
    monitor: Arc<StatusMonitor>,
    parameter_sink: Option<Arc<dyn ParameterSink>>,
    data_dir: PathBuf,
}

impl Station {
    /// Build every component; nothing is opened or started yet.
    pub fn new(settings: Settings, connectors: Connectors, sinks: Sinks) -> Self {
        let timing = &settings.timing;

        let instrument = Arc::new(Session::new(
            Resource::Instrument.as_str(),
            SessionOptions::visa(&settings.instrument),
            connectors.instrument,
        ));
        let motor = Arc::new(Session::new(
            Resource::Motor.as_str(),
            SessionOptions::motor(&settings.motor),
            connectors.motor,
        ));
        let relay = Arc::new(Session::new(
            Resource::Relay.as_str(),
            SessionOptions::relay(&settings.relay),
            connectors.relay,
        ));

        let sequencer = Arc::new(Sequencer::new(Registry::standard(), display_lock()));
        let measurement = Arc::new(MeasurementMachine::new(
            instrument.clone(),
            sequencer.clone(),
            timing,
        ));
        let display = Arc::new(DisplayLoop::new(
            instrument.clone(),
            sequencer.registry().clone(),
            sequencer.plot().clone(),
            sinks.sample,
            timing.analyzer_refresh_delay,
        ));
        let motion = Arc::new(MotionMachine::new(
            motor.clone(),
            settings.calibration.clone(),
            display_lock(),
            sinks.position,
            timing,
        ));
        let plc = Arc::new(PlcController::new(relay.clone(), &settings.relay));

        let scheduler = Arc::new(JobScheduler::new(SchedulerPolicy::from(&settings.automation)));
        let automation = Arc::new(Automation::new(scheduler));

        let monitor = Arc::new(StatusMonitor::new(
            StatusSources {
                instrument: instrument.clone(),
                motor: motor.clone(),
                relay: relay.clone(),
                measurement: measurement.clone(),
                motion: motion.clone(),
                plc: plc.clone(),
                automation: automation.clone(),
            },
            timing.status_monitor_delay,
        ));

        let data_dir = data_dir(&settings);
        Self {
            settings: Arc::new(settings),
            instrument,
            motor,
            relay,
            sequencer,
            measurement,
            display,
            motion,
            plc,
            automation,
            monitor,
            parameter_sink: sinks.parameter,
            data_dir,
        }
    }

    /// Hardware connectors and no sinks
    pub fn from_settings(settings: Settings) -> Self {
        let connectors = Connectors::from_settings(&settings);
        Self::new(settings, connectors, Sinks::default())
    }

    /// Loaded configuration
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Session for `resource`
    pub fn session(&self, resource: Resource) -> &Arc<Session> {
        match resource {
            Resource::Instrument => &self.instrument,
            Resource::Motor => &self.motor,
            Resource::Relay => &self.relay,
        }
    }

    /// Analyzer parameter sequencer
    pub fn sequencer(&self) -> &Arc<Sequencer> {
        &self.sequencer
    }

    /// Measurement state machine
    pub fn measurement(&self) -> &Arc<MeasurementMachine> {
        &self.measurement
    }

    /// Motion state machine
    pub fn motion(&self) -> &Arc<MotionMachine> {
        &self.motion
    }

    /// Relay PLC controller
    pub fn plc(&self) -> &Arc<PlcController> {
        &self.plc
    }

    /// Automation queue and scheduler
    pub fn automation(&self) -> &Arc<Automation> {
        &self.automation
    }

    /// Where `save_trace` writes records
    pub fn data_dir(&self) -> &PathBuf {
        &self.data_dir
    }

    /// Start the loops and the actor. Must be called from inside a tokio runtime.
    pub fn spawn(self) -> StationHandle {
        let (shutdown, shutdown_rx) = watch::channel(false);
        let loops = vec![
            ("measurement", tokio::spawn(self.measurement.clone().run(shutdown_rx.clone()))),
            ("display", tokio::spawn(self.display.clone().run(shutdown_rx.clone()))),
            ("motion", tokio::spawn(self.motion.clone().run(shutdown_rx.clone()))),
            (
                "scheduler",
                tokio::spawn(self.automation.scheduler().clone().run(shutdown_rx.clone())),
            ),
            ("status", tokio::spawn(self.monitor.clone().run(shutdown_rx))),
        ];

        let hooks = HookEngine::with_station(
            HookLimits::from(&self.settings.automation),
            StationBindings {
                runtime: Handle::current(),
                instrument: self.instrument.clone(),
                sequencer: self.sequencer.clone(),
                motion: self.motion.clone(),
                plc: self.plc.clone(),
                data_dir: self.data_dir.clone(),
            },
        );

        let (sender, receiver) = mpsc::channel(COMMAND_CAPACITY);
        let status = self.monitor.subscribe();
        let actor = StationActor {
            station: self,
            hooks,
            shutdown,
            loops,
            in_flight: JoinSet::new(),
            retry: RetryPolicy::default(),
        };
        tokio::spawn(actor.run(receiver));

        StationHandle { sender, status }
    }

    async fn connect(&self, resource: Resource, address: Option<String>) -> AppResult<()> {
        let configured = match resource {
            Resource::Instrument => self.settings.instrument.address.clone(),
            Resource::Motor => self.settings.motor.port.clone(),
            Resource::Relay => self.settings.relay.port.clone(),
        };
        let address = address.or(configured).ok_or_else(|| {
            StationError::Config(ConfigError::ValidationError(format!(
                "no address configured for {resource}"
            )))
        })?;

        let session = self.session(resource);
        let mut io = session.lock().await;
        io.open(&address).await?;

        match resource {
            Resource::Instrument => match identify(&mut io).await {
                Ok(idn) => {
                    let short = idn.iter().take(3).cloned().collect::<Vec<_>>().join(", ");
                    info!(idn = %short, "analyzer identified");
                }
                Err(e) => warn!(error = %e, "analyzer did not identify"),
            },
            Resource::Relay => {
                drop(io);
                let plc = self.plc.clone();
                tokio::spawn(async move {
                    if let Err(e) = plc.query_status().await {
                        warn!(error = %e, "initial PLC status query failed");
                    }
                });
            }
            Resource::Motor => {}
        }
        Ok(())
    }

    async fn load_hooks(&self, script: Option<String>) -> AppResult<String> {
        if let Some(script) = script {
            return Ok(script);
        }
        match &self.settings.automation.hooks_file {
            Some(path) => Ok(tokio::fs::read_to_string(path).await?),
            None => Ok(DEFAULT_HOOKS.to_string()),
        }
    }
}

/// Processes [`StationCommand`]s until shutdown
pub struct StationActor {
    station: Station,
    hooks: HookEngine,
    shutdown: watch::Sender<bool>,
    loops: Vec<(&'static str, JoinHandle<()>)>,
    in_flight: JoinSet<()>,
    retry: RetryPolicy,
}

impl StationActor {
    /// Run the actor event loop, processing commands until shutdown
    pub async fn run(mut self, mut commands: mpsc::Receiver<StationCommand>) {
        info!(station = %self.station.settings.application.name, "station actor started");
        if let Some(sink) = self.station.parameter_sink.clone() {
            self.station.sequencer.registry().bind_all(sink).await;
        }

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(StationCommand::Shutdown { response }) => {
                        info!("shutdown command received");
                        let result = self.shutdown().await;
                        let _ = response.send(result);
                        break;
                    }
                    Some(command) => self.handle(command).await,
                    None => {
                        info!("all station handles dropped");
                        if let Err(e) = self.shutdown().await {
                            error!(error = %e, "shutdown incomplete");
                        }
                        break;
                    }
                },
                Some(joined) = self.in_flight.join_next(), if !self.in_flight.is_empty() => {
                    if let Err(e) = joined {
                        error!(error = %e, "station command task failed");
                    }
                }
            }
        }

        info!("station actor stopped");
    }

    fn spawn_reply<T, F>(&mut self, response: Reply<T>, future: F)
    where
        T: Send + 'static,
        F: Future<Output = AppResult<T>> + Send + 'static,
    {
        self.in_flight.spawn(async move {
            let _ = response.send(future.await);
        });
    }

    async fn handle(&mut self, command: StationCommand) {
        debug!(?command, "station command");
        let station = self.station.clone();

        match command {
            StationCommand::Connect {
                resource,
                address,
                response,
            } => self.spawn_reply(response, async move { station.connect(resource, address).await }),

            StationCommand::Disconnect { resource, response } => self.spawn_reply(response, async move {
                station.session(resource).close().await
            }),

            StationCommand::Identify { response } => self.spawn_reply(response, async move {
                let mut io = station.instrument.lock().await;
                identify(&mut io).await
            }),

            StationCommand::Apply { request, response } => self.spawn_reply(response, async move {
                station.sequencer.apply(&station.instrument, &request).await
            }),

            StationCommand::SweepControl { action, response } => {
                self.spawn_reply(response, async move {
                    let mut io = station.instrument.lock().await;
                    let continuous = sweep_control(&mut io, action).await?;
                    station.measurement.set_continuous(continuous);
                    Ok(continuous)
                })
            }

            StationCommand::SetContinuous { on, response } => {
                station.measurement.set_continuous(on);
                let _ = response.send(Ok(()));
            }

            StationCommand::SingleSweep { response } => {
                station.measurement.single_sweep();
                let _ = response.send(Ok(()));
            }

            StationCommand::RequestMeasurementState { state, response } => {
                station.measurement.request(state);
                let _ = response.send(Ok(()));
            }

            StationCommand::RequestMotionState { state, response } => {
                station.motion.request(state);
                let _ = response.send(Ok(()));
            }

            StationCommand::Jog {
                axis,
                degrees,
                response,
            } => self.spawn_reply(response, async move { station.motion.jog(axis, degrees).await }),

            StationCommand::Point {
                azimuth,
                elevation,
                response,
            } => self.spawn_reply(response, async move {
                station.motion.point(azimuth, elevation).await
            }),

            StationCommand::Park { response } => {
                self.spawn_reply(response, async move { station.motion.park().await })
            }

            StationCommand::Halt { response } => {
                self.spawn_reply(response, async move { station.motion.halt().await })
            }

            StationCommand::Plc { opcode, response } => {
                self.spawn_reply(response, async move { station.plc.send(opcode).await })
            }

            StationCommand::PlcStatus { response } => {
                self.spawn_reply(response, async move { station.plc.query_status().await })
            }

            StationCommand::Enqueue { at, response } => {
                let _ = response.send(station.automation.enqueue(at).await);
            }

            StationCommand::EnqueueRange {
                start,
                end,
                interval,
                response,
            } => {
                let _ = response.send(station.automation.enqueue_range(start, end, interval).await);
            }

            StationCommand::ClearQueue { response } => {
                let _ = response.send(station.automation.clear_queue().await);
            }

            StationCommand::Queue { response } => {
                let _ = response.send(Ok(station.automation.queue().await));
            }

            StationCommand::StartAutomation { script, response } => {
                let _ = response.send(self.start_automation(script).await);
            }

            StationCommand::StopAutomation { response } => {
                let _ = response.send(station.automation.stop().await);
            }

            StationCommand::ToggleAutomation { script, response } => {
                let result = match station.automation.snapshot().state {
                    AutomationState::Idle => self.start_automation(script).await,
                    AutomationState::Active => station.automation.stop().await,
                };
                let _ = response.send(result.map(|()| station.automation.snapshot().state));
            }

            StationCommand::Status { response } => {
                let _ = response.send(Ok(station.monitor.collect()));
            }

            StationCommand::Shutdown { response } => {
                // handled by the run loop
                let _ = response.send(Err(StationError::ShuttingDown));
            }
        }
    }

    async fn start_automation(&self, script: Option<String>) -> AppResult<()> {
        let text = self.station.load_hooks(script).await?;
        let hooks = self.hooks.compile(&text)?;
        self.station.automation.start(Arc::new(hooks)).await
    }

    /// Stop automation, release the drives, stop the loops and close the sessions.
    async fn shutdown(&mut self) -> AppResult<()> {
        info!("shutting down station");
        let station = self.station.clone();
        let mut errors = Vec::new();

        if let Err(e) = retry(&self.retry, "automation stop", || station.automation.stop()).await {
            errors.push(e);
        }
        if let Err(e) = retry(&self.retry, "motion cleanup", || station.motion.cleanup_now()).await {
            errors.push(e);
        }

        let _ = self.shutdown.send(true);
        let timeout = station.settings.timing.shutdown_timeout;
        for (name, handle) in self.loops.drain(..) {
            let abort = handle.abort_handle();
            match tokio::time::timeout(timeout, handle).await {
                Ok(Ok(())) => debug!(task = name, "loop joined"),
                Ok(Err(e)) => warn!(task = name, error = %e, "loop task failed"),
                Err(_) => {
                    warn!(task = name, ?timeout, "loop did not stop in time, aborting");
                    abort.abort();
                }
            }
        }
        let drained = tokio::time::timeout(timeout, async {
            while self.in_flight.join_next().await.is_some() {}
        })
        .await;
        if drained.is_err() {
            warn!(pending = self.in_flight.len(), "aborting in-flight commands");
            self.in_flight.abort_all();
        }

        for resource in Resource::ALL {
            let session = station.session(resource);
            if !session.is_open() {
                continue;
            }
            if let Err(e) = retry(&self.retry, resource.as_str(), || session.close()).await {
                errors.push(e);
            }
        }

        let result = combine(errors);
        match &result {
            Ok(()) => info!("station shutdown complete"),
            Err(e) => error!(error = %e, "station shutdown incomplete"),
        }
        result
    }
}

/// Cloneable front door to a running station
#[derive(Clone)]
pub struct StationHandle {
    sender: mpsc::Sender<StationCommand>,
    status: watch::Receiver<StationStatus>,
}

impl StationHandle {
    async fn request<T>(
        &self,
        (command, reply): (StationCommand, oneshot::Receiver<AppResult<T>>),
    ) -> AppResult<T> {
        self.sender
            .send(command)
            .await
            .map_err(|_| StationError::ShuttingDown)?;
        reply.await.map_err(|_| StationError::ShuttingDown)?
    }

    /// Status published by the monitor
    pub fn subscribe(&self) -> watch::Receiver<StationStatus> {
        self.status.clone()
    }

    /// Whether the actor is still accepting commands
    pub fn is_running(&self) -> bool {
        !self.sender.is_closed()
    }

    /// Open `resource` at `address`, or at its configured address.
    pub async fn connect(&self, resource: Resource, address: Option<String>) -> AppResult<()> {
        self.request(StationCommand::connect(resource, address)).await
    }

    /// Close `resource`.
    pub async fn disconnect(&self, resource: Resource) -> AppResult<()> {
        self.request(StationCommand::disconnect(resource)).await
    }

    /// Analyzer identification fields
    pub async fn identify(&self) -> AppResult<Vec<String>> {
        self.request(StationCommand::identify()).await
    }

    /// One apply pass
    pub async fn apply(&self, request: ApplyRequest) -> AppResult<()> {
        self.request(StationCommand::apply(request)).await
    }

    /// Continuous sweep on or off
    pub async fn set_continuous(&self, on: bool) -> AppResult<()> {
        self.request(StationCommand::set_continuous(on)).await
    }

    /// One sweep
    pub async fn single_sweep(&self) -> AppResult<()> {
        self.request(StationCommand::single_sweep()).await
    }

    /// Toggle or restart the sweep
    pub async fn sweep_control(&self, action: crate::instrument::SweepAction) -> AppResult<bool> {
        self.request(StationCommand::sweep_control(action)).await
    }

    /// Request a measurement state
    pub async fn request_measurement(&self, state: crate::core::LoopState) -> AppResult<()> {
        self.request(StationCommand::request_measurement(state)).await
    }

    /// Request a motion state
    pub async fn request_motion(&self, state: crate::core::LoopState) -> AppResult<()> {
        self.request(StationCommand::request_motion(state)).await
    }

    /// Relative move
    pub async fn jog(&self, axis: crate::instrument::Axis, degrees: f64) -> AppResult<()> {
        self.request(StationCommand::jog(axis, degrees)).await
    }

    /// Absolute move
    pub async fn point(&self, azimuth: f64, elevation: f64) -> AppResult<()> {
        self.request(StationCommand::point(azimuth, elevation)).await
    }

    /// Move to the park position
    pub async fn park(&self) -> AppResult<()> {
        self.request(StationCommand::park()).await
    }

    /// Stop both axes
    pub async fn halt(&self) -> AppResult<()> {
        self.request(StationCommand::halt()).await
    }

    /// Send a PLC opcode
    pub async fn plc(&self, opcode: crate::instrument::Opcode) -> AppResult<u8> {
        self.request(StationCommand::plc(opcode)).await
    }

    /// Query the PLC status
    pub async fn plc_status(&self) -> AppResult<u8> {
        self.request(StationCommand::plc_status()).await
    }

    /// Queue one automation time
    pub async fn enqueue(&self, at: DateTime<Local>) -> AppResult<()> {
        self.request(StationCommand::enqueue(at)).await
    }

    /// Queue evenly spaced times
    pub async fn enqueue_range(
        &self,
        start: DateTime<Local>,
        end: DateTime<Local>,
        interval: Duration,
    ) -> AppResult<usize> {
        self.request(StationCommand::enqueue_range(start, end, interval))
            .await
    }

    /// Empty the queue
    pub async fn clear_queue(&self) -> AppResult<()> {
        self.request(StationCommand::clear_queue()).await
    }

    /// Queued times
    pub async fn queue(&self) -> AppResult<Vec<DateTime<Local>>> {
        self.request(StationCommand::queue()).await
    }

    /// Start automation
    pub async fn start_automation(&self, script: Option<String>) -> AppResult<()> {
        self.request(StationCommand::start_automation(script)).await
    }

    /// Stop automation
    pub async fn stop_automation(&self) -> AppResult<()> {
        self.request(StationCommand::stop_automation()).await
    }

    /// Start or stop automation
    pub async fn toggle_automation(&self, script: Option<String>) -> AppResult<AutomationState> {
        self.request(StationCommand::toggle_automation(script)).await
    }

    /// Fresh status
    pub async fn status(&self) -> AppResult<StationStatus> {
        self.request(StationCommand::status()).await
    }

    /// Stop everything; returns once the station has shut down.
    pub async fn shutdown(&self) -> AppResult<()> {
        self.request(StationCommand::shutdown()).await
    }
}
