//! Analyzer parameters bound to SCPI commands.
//!
//! A [`Parameter`] couples a request key (`startfreq`) with the command that sets and
//! queries it (`:SENS:FREQ:START`). It carries the argument waiting to be written, the
//! value last read back from the instrument, and an optional [`ParameterSink`] that is
//! told about every refreshed value.
//!
//! # Example
//!
//! ```rust,ignore
//! use spectrum_monitor::parameter::{ApplyRequest, Parameter};
//!
//! let atten = Parameter::new("atten", "Attenuation")
//!     .with_command(":SENS:POWER:RF:ATTENUATION")
//!     .logged();
//! assert_eq!(atten.write_command("10").as_deref(), Some(":SENS:POWER:RF:ATTENUATION 10"));
//!
//! let request = ApplyRequest::new().set("startfreq", 0).set("stopfreq", 1e9);
//! ```

use crate::error::{AppResult, StationError};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

// =============================================================================
// Sink
// =============================================================================

/// Receives every value the sequencer reads back from the instrument.
pub trait ParameterSink: Send + Sync {
    /// `key` was refreshed to `value`
    fn publish(&self, key: &str, value: &str);
}

impl<F> ParameterSink for F
where
    F: Fn(&str, &str) + Send + Sync,
{
    fn publish(&self, key: &str, value: &str) {
        self(key, value)
    }
}

// =============================================================================
// Argument choices
// =============================================================================

/// Enumerated arguments, by parameter key. Position in the slice is the index an
/// operator may use instead of the literal.
pub static ARGUMENT_CHOICES: Lazy<BTreeMap<&'static str, &'static [&'static str]>> =
    Lazy::new(|| {
        BTreeMap::from([
            ("rbwfiltershape", &["GAUS", "FLAT"][..]),
            ("rbwfiltertype", &["DB3", "DB6", "IMP", "NOISE"][..]),
            ("tracetype", &["WRIT", "AVER", "MAXH", "MINH"][..]),
            ("avgtype", &["LOG", "RMS", "SCALAR"][..]),
        ])
    });

// =============================================================================
// Parameter
// =============================================================================

/// One named analyzer setting.
#[derive(Clone)]
pub struct Parameter {
    key: String,
    name: String,
    command: Option<String>,
    loggable: bool,
    choices: Option<&'static [&'static str]>,
    pending: Option<String>,
    value: Option<String>,
    sink: Option<Arc<dyn ParameterSink>>,
}

impl Parameter {
    /// Create a parameter with no command, not logged.
    pub fn new(key: impl Into<String>, name: impl Into<String>) -> Self {
        let key = key.into();
        let choices = ARGUMENT_CHOICES.get(key.as_str()).copied();
        Self {
            key,
            name: name.into(),
            command: None,
            loggable: false,
            choices,
            pending: None,
            value: None,
            sink: None,
        }
    }

    /// Bind the SCPI command used for both writing and querying
    pub fn with_command(mut self, command: impl Into<String>) -> Self {
        self.command = Some(command.into());
        self
    }

    /// Include this parameter in sample records
    pub fn logged(mut self) -> Self {
        self.loggable = true;
        self
    }

    /// Restrict arguments to an enumerated set
    pub fn with_choices(mut self, choices: &'static [&'static str]) -> Self {
        self.choices = Some(choices);
        self
    }

    /// Seed the observed value (for parameters without a command)
    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    /// Request key, e.g. `startfreq`
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Display name, e.g. `Start Frequency`
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bound command, if any
    pub fn command(&self) -> Option<&str> {
        self.command.as_deref()
    }

    /// Whether the parameter appears in sample records
    pub fn is_loggable(&self) -> bool {
        self.loggable
    }

    /// Enumerated arguments, if restricted
    pub fn choices(&self) -> Option<&'static [&'static str]> {
        self.choices
    }

    /// Argument waiting to be written
    pub fn pending(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    /// Last value read back (or stamped)
    pub fn value(&self) -> Option<&str> {
        self.value.as_deref()
    }

    /// Observed value parsed as a number
    pub fn value_f64(&self) -> Option<f64> {
        self.value.as_deref().and_then(parse_number)
    }

    /// Attach the sink told about refreshed values
    pub fn bind(&mut self, sink: Arc<dyn ParameterSink>) {
        self.sink = Some(sink);
    }

    /// Turn an operator argument into the literal sent to the instrument.
    ///
    /// Enumerated parameters accept either an index into their choices or the literal
    /// itself (case-insensitive); anything else is a range error.
    pub fn resolve_argument(&self, argument: &str) -> AppResult<String> {
        let argument = argument.trim();
        let Some(choices) = self.choices else {
            return Ok(argument.to_string());
        };
        if let Ok(index) = argument.parse::<usize>() {
            return choices
                .get(index)
                .map(|choice| choice.to_string())
                .ok_or_else(|| StationError::range(&self.key, index, 0, choices.len() - 1));
        }
        choices
            .iter()
            .find(|choice| choice.eq_ignore_ascii_case(argument))
            .map(|choice| choice.to_string())
            .ok_or_else(|| {
                StationError::range(&self.key, argument, choices[0], choices[choices.len() - 1])
            })
    }

    /// `"{command} {argument}"` for the pending argument, if there is one.
    pub fn write_command(&self, argument: &str) -> Option<String> {
        self.command.as_ref().map(|cmd| format!("{cmd} {argument}"))
    }

    /// `"{command}?"`, if the parameter has a command.
    pub fn query_command(&self) -> Option<String> {
        self.command.as_ref().map(|cmd| format!("{cmd}?"))
    }

    pub(crate) fn set_pending(&mut self, argument: String) {
        self.pending = Some(argument);
    }

    pub(crate) fn take_pending(&mut self) -> Option<String> {
        self.pending.take()
    }

    pub(crate) fn clear_pending(&mut self) {
        self.pending = None;
    }

    /// Store an observed value and tell the sink.
    pub fn observe(&mut self, value: impl Into<String>) {
        let value = value.into();
        if let Some(sink) = self.record(value.clone()) {
            sink.publish(&self.key, &value);
        }
    }

    /// Store an observed value and hand back the sink to tell, if any.
    pub(crate) fn record(&mut self, value: String) -> Option<Arc<dyn ParameterSink>> {
        self.value = Some(value);
        self.sink.clone()
    }
}

impl fmt::Debug for Parameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Parameter")
            .field("key", &self.key)
            .field("command", &self.command)
            .field("pending", &self.pending)
            .field("value", &self.value)
            .finish_non_exhaustive()
    }
}

/// Parse an instrument reply such as `+1.00000000E+009` or `10`.
pub fn parse_number(text: &str) -> Option<f64> {
    text.trim().parse::<f64>().ok()
}

/// The analyzer's parameters, in registration order.
pub fn standard_parameters() -> Vec<Parameter> {
    vec![
        Parameter::new("centerfreq", "Center Frequency").with_command(":SENS:FREQ:CENTER"),
        Parameter::new("span", "Span").with_command(":SENS:FREQ:SPAN"),
        Parameter::new("startfreq", "Start Frequency")
            .with_command(":SENS:FREQ:START")
            .logged(),
        Parameter::new("stopfreq", "Stop Frequency")
            .with_command(":SENS:FREQ:STOP")
            .logged(),
        Parameter::new("sweeptime", "Sweep Time")
            .with_command(":SWE:TIME")
            .logged(),
        Parameter::new("rbw", "RBW")
            .with_command(":SENS:BANDWIDTH:RESOLUTION")
            .logged(),
        Parameter::new("vbw", "VBW")
            .with_command(":SENS:BANDWIDTH:VIDEO")
            .logged(),
        Parameter::new("bwratio", "VBW:3 dB RBW").with_command(":SENS:BANDWIDTH:VIDEO:RATIO"),
        Parameter::new("ref", "Ref Level").with_command(":DISP:WINDOW:TRACE:Y:RLEVEL"),
        Parameter::new("numdiv", "Number of Divisions").with_command(":DISP:WINDOW:TRACE:Y:NDIV"),
        Parameter::new("yscale", "Scale/Div").with_command(":DISP:WINDOW:TRACE:Y:PDIV"),
        Parameter::new("atten", "Attenuation")
            .with_command(":SENS:POWER:RF:ATTENUATION")
            .logged(),
        Parameter::new("spantype", "Swept Span").with_command(":SENS:FREQ:SPAN"),
        Parameter::new("sweeptype", "Auto Sweep Time").with_command(":SWE:TIME:AUTO"),
        Parameter::new("rbwtype", "Auto RBW").with_command(":SENS:BAND:RES:AUTO"),
        Parameter::new("vbwtype", "Auto VBW").with_command(":SENS:BAND:VID:AUTO"),
        Parameter::new("bwratiotype", "Auto VBW:RBW Ratio").with_command(":SENS:BAND:VID:RATIO"),
        Parameter::new("rbwfiltershape", "RBW Filter")
            .with_command(":SENS:BAND:SHAP")
            .logged(),
        Parameter::new("rbwfiltertype", "RBW Filter BW")
            .with_command(":SENS:BAND:TYPE")
            .logged(),
        Parameter::new("attentype", "Auto Attenuation").with_command(":SENS:POWER:ATT:AUTO"),
        Parameter::new("xunit", "X Axis Units").logged().with_value("Hz"),
        Parameter::new("yunit", "Y Axis Units")
            .with_command(":UNIT:POW")
            .logged(),
        Parameter::new("tracetype", "Trace Type")
            .with_command(":TRACE:TYPE")
            .logged(),
        Parameter::new("avgtype", "Average Type")
            .with_command(":SENS:AVER:TYPE")
            .logged(),
        Parameter::new("avgautoman", "Auto Average Type").with_command(":SENS:AVER:TYPE:AUTO"),
        Parameter::new("avgcount", "Average/Hold Count").with_command(":SENS:AVER:COUNT"),
        Parameter::new("sweeppoints", "Number of Points")
            .with_command(":SENS:SWEEP:POINTS")
            .logged(),
        Parameter::new("time", "Time").logged(),
    ]
}

// =============================================================================
// Apply request
// =============================================================================

/// Arguments for one apply pass, by parameter key.
///
/// An empty request refreshes every parameter without writing anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ApplyRequest {
    arguments: BTreeMap<String, String>,
}

impl ApplyRequest {
    /// Empty request
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `key = value`
    pub fn set(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.arguments.insert(key.into(), value.to_string());
        self
    }

    /// Add `key = value` in place
    pub fn insert(&mut self, key: impl Into<String>, value: impl ToString) {
        self.arguments.insert(key.into(), value.to_string());
    }

    /// Whether no arguments were given
    pub fn is_empty(&self) -> bool {
        self.arguments.is_empty()
    }

    /// Number of arguments
    pub fn len(&self) -> usize {
        self.arguments.len()
    }

    /// Iterate over `(key, argument)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.arguments
            .iter()
            .map(|(key, value)| (key.as_str(), value.as_str()))
    }

    /// Argument for `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.arguments.get(key).map(String::as_str)
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for ApplyRequest {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut request = Self::new();
        for (key, value) in iter {
            request.insert(key, value);
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_standard_registry_shape() {
        let params = standard_parameters();
        assert_eq!(params.len(), 28);
        assert_eq!(params[0].key(), "centerfreq");
        assert_eq!(params[27].key(), "time");

        let without_command: Vec<_> = params
            .iter()
            .filter(|p| p.command().is_none())
            .map(Parameter::key)
            .collect();
        assert_eq!(without_command, vec!["xunit", "time"]);

        let xunit = params.iter().find(|p| p.key() == "xunit").unwrap();
        assert_eq!(xunit.value(), Some("Hz"));
    }

    #[test]
    fn test_resolve_choice_by_index_or_literal() {
        let trace = Parameter::new("tracetype", "Trace Type").with_command(":TRACE:TYPE");
        assert_eq!(trace.resolve_argument("2").unwrap(), "MAXH");
        assert_eq!(trace.resolve_argument("aver").unwrap(), "AVER");

        let err = trace.resolve_argument("4").unwrap_err();
        assert!(matches!(err, StationError::Range { .. }));
        assert!(trace.resolve_argument("PEAK").is_err());
    }

    #[test]
    fn test_free_arguments_pass_through() {
        let start = Parameter::new("startfreq", "Start Frequency").with_command(":SENS:FREQ:START");
        assert_eq!(start.resolve_argument(" 1e9 ").unwrap(), "1e9");
        assert_eq!(
            start.write_command("1e9").as_deref(),
            Some(":SENS:FREQ:START 1e9")
        );
        assert_eq!(start.query_command().as_deref(), Some(":SENS:FREQ:START?"));
    }

    #[test]
    fn test_observe_publishes_to_sink() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink_seen = seen.clone();
        let mut span = Parameter::new("span", "Span").with_command(":SENS:FREQ:SPAN");
        span.bind(Arc::new(move |key: &str, value: &str| {
            sink_seen.lock().unwrap().push(format!("{key}={value}"));
        }));
        span.observe("+1.00000000E+009");

        assert_eq!(span.value_f64(), Some(1e9));
        assert_eq!(*seen.lock().unwrap(), vec!["span=+1.00000000E+009"]);
    }

    #[test]
    fn test_apply_request_builder() {
        let request = ApplyRequest::new().set("startfreq", 0).set("stopfreq", 1e9);
        assert_eq!(request.len(), 2);
        assert_eq!(request.get("stopfreq"), Some("1000000000"));
        assert!(ApplyRequest::new().is_empty());

        let collected: ApplyRequest = [("rbw", "3e6")].into_iter().collect();
        assert_eq!(collected.get("rbw"), Some("3e6"));
    }
}
