//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use spectrum_monitor::adapters::MockAdapter;
use spectrum_monitor::config::Settings;
use spectrum_monitor::session::{mock_connector, Session, SessionOptions};
use std::sync::Arc;
use std::time::Duration;

/// No settle delay and a short query timeout
pub fn fast_options() -> SessionOptions {
    SessionOptions {
        terminator: "\n".to_string(),
        settle: Duration::ZERO,
        query_timeout: Duration::from_millis(200),
    }
}

/// Closed session whose transports are clones of `mock`
pub fn mock_session(name: &str, mock: &MockAdapter) -> Arc<Session> {
    Arc::new(Session::new(name, fast_options(), mock_connector(mock.clone())))
}

/// Open session over a fresh mock at `address`
pub async fn open_session(name: &str, address: &str) -> (Arc<Session>, MockAdapter) {
    let mock = MockAdapter::new(address);
    let session = mock_session(name, &mock);
    session.open(address).await.expect("open mock session");
    (session, mock)
}

/// Analyzer that answers every query with plausible values
pub async fn scripted_analyzer(mock: &MockAdapter) {
    mock.respond_with(|command| {
        let reply = match command {
            "*IDN?" => "Keysight Technologies,N9020A,MY12345678,A.14.16",
            ":SENS:FREQ:START?" => "+0.00000000E+000",
            ":SENS:FREQ:STOP?" => "+1.00000000E+009",
            ":SENS:FREQ:SPAN?" => "+1.00000000E+009",
            ":SENS:SWEEP:POINTS?" => "5",
            ":SWE:TIME?" => "+1.00000000E-002",
            ":DISP:WINDOW:TRACE:Y:RLEVEL?" => "+0.00000000E+000",
            ":DISP:WINDOW:TRACE:Y:NDIV?" => "10",
            ":DISP:WINDOW:TRACE:Y:PDIV?" => "+1.00000000E+001",
            ":TRACE:DATA? TRACE1" => "-81.5,-80.25,-79.0,-80.0,-82.75",
            ":SYST:ERR?" | ":SYST:ERR:PUP?" => "+0,\"No error\"",
            ":STAT:OPER:COND?" => "+0",
            ":INIT:CONT?" => "0",
            other if other.ends_with('?') => "0",
            _ => return None,
        };
        Some(reply.to_string())
    })
    .await;
}

/// Positioner that enables its drives and reports fixed encoder counts
pub async fn scripted_positioner(mock: &MockAdapter, x_count: i64, y_count: i64) {
    mock.respond_with(move |command| match command {
        "Prog 0" => Some("P00>".to_string()),
        "DRIVE X" | "DRIVE Y" => Some("DRIVE ON".to_string()),
        "PRINT P6144" => Some(format!("PRINT P6144\r\n{x_count}\r\nP00>")),
        "PRINT P6160" => Some(format!("PRINT P6160\r\n{y_count}\r\nP00>")),
        _ => None,
    })
    .await;
}

/// Defaults with loops and windows short enough for tests
pub fn fast_settings() -> Settings {
    let mut settings = Settings::default();
    settings.instrument.timeout_ms = 200;
    settings.motor.settle = Duration::ZERO;
    settings.motor.query_timeout = Duration::from_millis(200);
    settings.relay.echo_window = Duration::from_millis(60);
    settings.relay.status_window = Duration::from_millis(60);
    settings.relay.init_window = Duration::from_millis(60);
    settings.relay.disable_window = Duration::from_millis(60);
    settings.timing.idle_delay = Duration::from_millis(20);
    settings.timing.analyzer_loop_delay = Duration::from_millis(20);
    settings.timing.analyzer_refresh_delay = Duration::from_millis(50);
    settings.timing.motor_loop_delay = Duration::from_millis(20);
    settings.timing.status_monitor_delay = Duration::from_millis(20);
    settings.timing.shutdown_timeout = Duration::from_secs(2);
    settings
}

/// Poll `condition` every 10 ms until it holds or `within` passes
pub async fn eventually<F>(within: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
