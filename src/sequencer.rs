//! Parameter registry and the write-then-refresh apply protocol.
//!
//! # Apply
//!
//! One pass over the analyzer, under a single session lock:
//!
//! ```text
//! validate ──> mark pending ──> order (pending first, stable) ──┐
//!                                                               │
//!   WRITE   "{cmd} {arg}"  for each pending parameter   <───────┘
//!   REFRESH "{cmd}?"       for each parameter with a command
//!                                                               │
//! display lock ──> recompute plot bounds  <─────────────────────┘
//! ```
//!
//! The registry is never reordered; the execution order is computed per pass.

use crate::core::{round_to, DisplayLock, PlotBounds, SpectrumPlot};
use crate::error::{AppResult, StationError};
use crate::parameter::{standard_parameters, ApplyRequest, Parameter, ParameterSink};
use crate::session::{Session, SessionIo};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, error, instrument};

/// Characters trimmed from values written into sample records
const RECORD_TRIM: &[char] = &['[', ']', '{', '}', '(', ')', '#', '*', ' ', '\n', '\t'];

/// Ordered set of analyzer parameters.
///
/// Cloning shares the same parameters. The inner lock is only ever held for
/// bookkeeping, never across device I/O.
#[derive(Clone)]
pub struct Registry {
    parameters: Arc<RwLock<Vec<Parameter>>>,
}

impl Registry {
    /// Registry over `parameters`, in the given order
    pub fn new(parameters: Vec<Parameter>) -> Self {
        Self {
            parameters: Arc::new(RwLock::new(parameters)),
        }
    }

    /// The analyzer's standard parameter set
    pub fn standard() -> Self {
        Self::new(standard_parameters())
    }

    /// Keys in registration order
    pub async fn keys(&self) -> Vec<String> {
        self.parameters
            .read()
            .await
            .iter()
            .map(|p| p.key().to_string())
            .collect()
    }

    /// Snapshot of one parameter
    pub async fn get(&self, key: &str) -> Option<Parameter> {
        self.parameters
            .read()
            .await
            .iter()
            .find(|p| p.key() == key)
            .cloned()
    }

    /// Last observed value of `key`
    pub async fn value(&self, key: &str) -> Option<String> {
        self.get(key).await.and_then(|p| p.value().map(str::to_string))
    }

    /// Last observed value of `key` as a number
    pub async fn value_f64(&self, key: &str) -> Option<f64> {
        self.get(key).await.and_then(|p| p.value_f64())
    }

    /// Bind `sink` to one parameter
    pub async fn bind(&self, key: &str, sink: Arc<dyn ParameterSink>) -> AppResult<()> {
        let mut parameters = self.parameters.write().await;
        let parameter = parameters
            .iter_mut()
            .find(|p| p.key() == key)
            .ok_or_else(|| StationError::UnknownParameter(key.to_string()))?;
        parameter.bind(sink);
        Ok(())
    }

    /// Bind `sink` to every parameter
    pub async fn bind_all(&self, sink: Arc<dyn ParameterSink>) {
        for parameter in self.parameters.write().await.iter_mut() {
            parameter.bind(sink.clone());
        }
    }

    /// Set an observed value directly, e.g. the display loop's `time` stamp.
    pub async fn stamp(&self, key: &str, value: impl Into<String>) -> AppResult<()> {
        let index = self
            .parameters
            .read()
            .await
            .iter()
            .position(|p| p.key() == key)
            .ok_or_else(|| StationError::UnknownParameter(key.to_string()))?;
        self.observe_at(index, value.into()).await;
        Ok(())
    }

    /// Store `value` on the parameter at `index`, then tell its sink with the lock released.
    async fn observe_at(&self, index: usize, value: String) {
        let (key, sink) = {
            let mut parameters = self.parameters.write().await;
            let parameter = &mut parameters[index];
            (parameter.key().to_string(), parameter.record(value.clone()))
        };
        if let Some(sink) = sink {
            sink.publish(&key, &value);
        }
    }

    /// `(display name, value)` for every loggable parameter, in registration order.
    pub async fn loggable_snapshot(&self) -> Vec<(String, String)> {
        self.parameters
            .read()
            .await
            .iter()
            .filter(|p| p.is_loggable())
            .map(|p| {
                let value = p.value().unwrap_or_default().trim_matches(RECORD_TRIM);
                (p.name().to_string(), value.to_string())
            })
            .collect()
    }

    /// Whether any parameter still has an argument waiting
    pub async fn has_pending(&self) -> bool {
        self.parameters
            .read()
            .await
            .iter()
            .any(|p| p.pending().is_some())
    }

    async fn clear_pending(&self) {
        for parameter in self.parameters.write().await.iter_mut() {
            parameter.clear_pending();
        }
    }
}

/// One step of an apply pass
#[derive(Debug, Clone, PartialEq)]
struct Step {
    index: usize,
    write: Option<String>,
    query: Option<String>,
}

/// Stable partition of registry indices: pending first, then the rest.
pub fn execution_order(parameters: &[Parameter]) -> Vec<usize> {
    let (mut order, rest): (Vec<usize>, Vec<usize>) =
        (0..parameters.len()).partition(|&i| parameters[i].pending().is_some());
    order.extend(rest);
    order
}

/// Plot limits from the refreshed parameter values, if all needed values are known.
pub fn plot_bounds(
    span: Option<f64>,
    sweeptime: Option<f64>,
    start: Option<f64>,
    stop: Option<f64>,
    reference: Option<f64>,
    numdiv: Option<f64>,
    yscale: Option<f64>,
) -> Option<PlotBounds> {
    let (x_min, x_max) = if span? == 0.0 {
        (0.0, round_to(sweeptime?, 5))
    } else {
        (start?, stop?)
    };
    let y_max = reference?;
    Some(PlotBounds {
        x_min,
        x_max,
        y_min: y_max - numdiv? * yscale?,
        y_max,
    })
}

/// Owns the registry and drives apply passes against the analyzer session.
pub struct Sequencer {
    registry: Registry,
    plot: DisplayLock<SpectrumPlot>,
}

impl Sequencer {
    /// Sequencer over `registry` that updates bounds on `plot`
    pub fn new(registry: Registry, plot: DisplayLock<SpectrumPlot>) -> Self {
        Self { registry, plot }
    }

    /// The parameter registry
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// The spectrum plot's display lock
    pub fn plot(&self) -> &DisplayLock<SpectrumPlot> {
        &self.plot
    }

    /// Apply `request`, taking the session lock for the whole pass.
    pub async fn apply(&self, session: &Session, request: &ApplyRequest) -> AppResult<()> {
        // Reject bad input before waiting on the device
        self.validate(request).await?;
        let mut io = session.lock().await;
        self.apply_locked(&mut io, request).await
    }

    /// Apply `request` with the session lock already held.
    #[instrument(skip_all, fields(session = io.name(), arguments = request.len()))]
    pub async fn apply_locked(&self, io: &mut SessionIo, request: &ApplyRequest) -> AppResult<()> {
        let arguments = self.validate(request).await?;
        let steps = self.plan(arguments).await;

        let result = self.execute(io, &steps).await;
        if let Err(e) = &result {
            self.registry.clear_pending().await;
            error!(error = %e, "apply aborted");
            return result;
        }

        self.update_bounds().await;
        Ok(())
    }

    /// Resolve every argument against its parameter; no I/O.
    async fn validate(&self, request: &ApplyRequest) -> AppResult<Vec<(usize, String)>> {
        let parameters = self.registry.parameters.read().await;
        request
            .iter()
            .map(|(key, argument)| -> AppResult<(usize, String)> {
                let index = parameters
                    .iter()
                    .position(|p| p.key() == key && p.command().is_some())
                    .ok_or_else(|| StationError::UnknownParameter(key.to_string()))?;
                Ok((index, parameters[index].resolve_argument(argument)?))
            })
            .collect()
    }

    /// Mark pending arguments and freeze the pass into steps.
    async fn plan(&self, arguments: Vec<(usize, String)>) -> Vec<Step> {
        let mut parameters = self.registry.parameters.write().await;
        for parameter in parameters.iter_mut() {
            parameter.clear_pending();
        }
        for (index, argument) in arguments {
            parameters[index].set_pending(argument);
        }

        execution_order(&parameters)
            .into_iter()
            .map(|index| {
                let parameter = &parameters[index];
                Step {
                    index,
                    write: parameter
                        .pending()
                        .and_then(|argument| parameter.write_command(argument)),
                    query: parameter.query_command(),
                }
            })
            .collect()
    }

    async fn execute(&self, io: &mut SessionIo, steps: &[Step]) -> AppResult<()> {
        for step in steps {
            if let Some(command) = &step.write {
                io.write(command).await?;
                self.registry.parameters.write().await[step.index].take_pending();
            }
        }

        for step in steps {
            if let Some(command) = &step.query {
                let reply = io.query(command).await?;
                let value = reply.trim().to_string();
                debug!(command = %command, value = %value, "refreshed");
                self.registry.observe_at(step.index, value).await;
            }
        }
        Ok(())
    }

    /// Recompute plot bounds from the refreshed values under the display lock.
    pub async fn update_bounds(&self) {
        let values = {
            let parameters = self.registry.parameters.read().await;
            let lookup = |key: &str| {
                parameters
                    .iter()
                    .find(|p| p.key() == key)
                    .and_then(Parameter::value_f64)
            };
            plot_bounds(
                lookup("span"),
                lookup("sweeptime"),
                lookup("startfreq"),
                lookup("stopfreq"),
                lookup("ref"),
                lookup("numdiv"),
                lookup("yscale"),
            )
        };

        let mut plot = self.plot.lock().await;
        match values {
            Some(bounds) => plot.bounds = Some(bounds),
            None => debug!("plot bounds unchanged, values missing"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_order_is_stable_partition() {
        let mut params = standard_parameters();
        params[3].set_pending("1e9".into()); // stopfreq
        params[2].set_pending("0".into()); // startfreq
        params[11].set_pending("10".into()); // atten

        let order = execution_order(&params);
        assert_eq!(&order[..3], &[2, 3, 11]);
        assert_eq!(order.len(), params.len());
        assert_eq!(order[3], 0);
        assert_eq!(order[4], 1);
        assert_eq!(order[5], 4);
    }

    #[test]
    fn test_bounds_swept_span() {
        let bounds = plot_bounds(
            Some(1e9),
            Some(0.01),
            Some(0.0),
            Some(1e9),
            Some(0.0),
            Some(10.0),
            Some(10.0),
        )
        .unwrap();
        assert_eq!((bounds.x_min, bounds.x_max), (0.0, 1e9));
        assert_eq!((bounds.y_min, bounds.y_max), (-100.0, 0.0));
    }

    #[test]
    fn test_bounds_zero_span_uses_sweep_time() {
        let bounds = plot_bounds(
            Some(0.0),
            Some(0.0123456),
            None,
            None,
            Some(-10.0),
            Some(8.0),
            Some(5.0),
        )
        .unwrap();
        assert_eq!((bounds.x_min, bounds.x_max), (0.0, 0.01235));
        assert_eq!(bounds.y_min, -50.0);
    }

    #[test]
    fn test_bounds_missing_value() {
        assert!(plot_bounds(Some(1e9), None, Some(0.0), None, Some(0.0), Some(10.0), Some(10.0)).is_none());
        assert!(plot_bounds(None, Some(1.0), Some(0.0), Some(1.0), Some(0.0), Some(1.0), Some(1.0)).is_none());
    }

    #[tokio::test]
    async fn test_sink_runs_with_registry_unlocked() {
        let registry = Registry::standard();
        let inside = registry.clone();
        let unlocked = Arc::new(std::sync::Mutex::new(Vec::new()));
        let seen = unlocked.clone();
        registry
            .bind(
                "time",
                Arc::new(move |_key: &str, _value: &str| {
                    seen.lock().unwrap().push(inside.parameters.try_write().is_ok());
                }),
            )
            .await
            .unwrap();

        registry.stamp("time", "12:00:00").await.unwrap();

        assert_eq!(*unlocked.lock().unwrap(), vec![true]);
        assert_eq!(registry.value("time").await.as_deref(), Some("12:00:00"));
    }

    #[tokio::test]
    async fn test_loggable_snapshot_uses_display_names() {
        let registry = Registry::standard();
        registry.stamp("startfreq", "[+0.0E+00]").await.unwrap();
        let snapshot = registry.loggable_snapshot().await;
        assert_eq!(snapshot[0], ("Start Frequency".to_string(), "+0.0E+00".to_string()));
        assert!(snapshot.iter().any(|(name, value)| name == "X Axis Units" && value == "Hz"));
        assert!(!snapshot.iter().any(|(name, _)| name == "Span"));
    }

    #[tokio::test]
    async fn test_unknown_and_commandless_keys_rejected() {
        let sequencer = Sequencer::new(Registry::standard(), crate::core::display_lock());
        let err = sequencer
            .validate(&ApplyRequest::new().set("nosuch", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, StationError::UnknownParameter(_)));

        let err = sequencer
            .validate(&ApplyRequest::new().set("time", "now"))
            .await
            .unwrap_err();
        assert!(matches!(err, StationError::UnknownParameter(_)));
    }
}
