//! Resource sessions: one transport, one exclusion lock.
//!
//! Every byte that reaches a device goes through a [`SessionIo`] guard obtained from
//! [`Session::lock`]. A composite operation (apply, init sequences, trace fetches) takes
//! the guard once and calls any number of primitives on it; there is no way to issue
//! device I/O without holding the lock, and no way to deadlock by nesting primitives.
//!
//! Observers never lock. Each session publishes a [`SessionInfo`] snapshot on a
//! `watch` channel whenever its lifecycle changes.

use crate::adapters::{MockAdapter, SerialAdapter, Transport, TransportKind, VisaAdapter, VisaOptions};
use crate::config::{InstrumentConfig, MotorConfig, RelayConfig};
use crate::error::{AppResult, StationError};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Builds a closed transport for an address.
pub type Connector = Arc<dyn Fn(&str) -> Box<dyn Transport> + Send + Sync>;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Per-session protocol settings.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// Appended to writes that do not already end in `\n`; may be empty
    pub terminator: String,
    /// Pause between a query's write and its first read
    pub settle: Duration,
    /// Default bound for [`SessionIo::query`]
    pub query_timeout: Duration,
}

impl SessionOptions {
    /// Analyzer session: configurable terminator, no settle delay
    pub fn visa(config: &InstrumentConfig) -> Self {
        Self {
            terminator: config.write_terminator().to_string(),
            settle: Duration::ZERO,
            query_timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    /// Positioner session: `\r\n` and a settle delay before reading
    pub fn motor(config: &MotorConfig) -> Self {
        Self {
            terminator: "\r\n".to_string(),
            settle: config.settle,
            query_timeout: config.query_timeout,
        }
    }

    /// Relay PLC session: `\n`, replies are drained by the caller
    pub fn relay(config: &RelayConfig) -> Self {
        Self {
            terminator: "\n".to_string(),
            settle: Duration::ZERO,
            query_timeout: Duration::from_millis(config.timeout_ms),
        }
    }
}

/// Lock-free snapshot of a session's lifecycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SessionInfo {
    /// `instrument`, `motor` or `relay`
    pub name: String,
    /// Address of the open (or last attempted) transport
    pub address: Option<String>,
    /// Transport kind, once one has been created
    pub kind: Option<TransportKind>,
    /// Whether the transport is open
    pub open: bool,
    /// Most recent failure, cleared by a successful open
    pub last_error: Option<String>,
}

struct Shared {
    name: String,
    options: SessionOptions,
    connector: Connector,
    info: watch::Sender<SessionInfo>,
}

#[derive(Default)]
struct Slot {
    address: Option<String>,
    transport: Option<Box<dyn Transport>>,
}

/// A named device session.
pub struct Session {
    shared: Arc<Shared>,
    slot: Arc<Mutex<Slot>>,
}

impl Session {
    /// Create a closed session that builds transports with `connector`.
    pub fn new(name: impl Into<String>, options: SessionOptions, connector: Connector) -> Self {
        let name = name.into();
        let (info, _) = watch::channel(SessionInfo {
            name: name.clone(),
            ..SessionInfo::default()
        });
        Self {
            shared: Arc::new(Shared {
                name,
                options,
                connector,
                info,
            }),
            slot: Arc::new(Mutex::new(Slot::default())),
        }
    }

    /// Session name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Protocol settings
    pub fn options(&self) -> &SessionOptions {
        &self.shared.options
    }

    /// Current lifecycle snapshot, without locking.
    pub fn info(&self) -> SessionInfo {
        self.shared.info.borrow().clone()
    }

    /// Whether the transport is open, without locking.
    pub fn is_open(&self) -> bool {
        self.shared.info.borrow().open
    }

    /// Watch lifecycle changes
    pub fn subscribe(&self) -> watch::Receiver<SessionInfo> {
        self.shared.info.subscribe()
    }

    /// Take the exclusion lock.
    pub async fn lock(&self) -> SessionIo {
        SessionIo {
            slot: self.slot.clone().lock_owned().await,
            shared: self.shared.clone(),
        }
    }

    /// Open `address` under the lock.
    pub async fn open(&self, address: &str) -> AppResult<()> {
        self.lock().await.open(address).await
    }

    /// Close under the lock.
    pub async fn close(&self) -> AppResult<()> {
        self.lock().await.close().await
    }

    /// Single locked write
    pub async fn write(&self, text: &str) -> AppResult<()> {
        self.lock().await.write(text).await
    }

    /// Single locked read
    pub async fn read(&self) -> AppResult<String> {
        self.lock().await.read().await
    }

    /// Single locked query with the default timeout
    pub async fn query(&self, text: &str) -> AppResult<String> {
        self.lock().await.query(text).await
    }

    /// Single locked input flush
    pub async fn flush_input(&self) -> AppResult<()> {
        self.lock().await.flush_input().await
    }
}

/// Exclusive access to a session's transport.
///
/// Dropping the guard releases the lock.
pub struct SessionIo {
    slot: OwnedMutexGuard<Slot>,
    shared: Arc<Shared>,
}

impl SessionIo {
    /// Session name
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Whether the transport is open
    pub fn is_open(&self) -> bool {
        self.slot
            .transport
            .as_ref()
            .is_some_and(|transport| transport.is_open())
    }

    /// Address of the current transport
    pub fn address(&self) -> Option<&str> {
        self.slot.address.as_deref()
    }

    /// Open a transport for `address` built by the session's connector.
    ///
    /// Same address while open is a no-op; a different address closes the old transport first.
    pub async fn open(&mut self, address: &str) -> AppResult<()> {
        if self.is_open() && self.slot.address.as_deref() == Some(address) {
            debug!(target: "session", session = %self.shared.name, address, "already open");
            return Ok(());
        }
        let transport = (self.shared.connector)(address);
        self.open_with(address, transport).await
    }

    /// Open a caller-supplied transport under this session's name.
    pub async fn open_with(&mut self, address: &str, mut transport: Box<dyn Transport>) -> AppResult<()> {
        self.close().await?;
        let kind = transport.kind();
        self.slot.address = Some(address.to_string());

        let opened = async {
            transport.open().await?;
            transport.flush_input().await
        }
        .await;

        if let Err(e) = opened {
            let err = match e.downcast::<StationError>() {
                Ok(station_err) => station_err,
                Err(e) => StationError::connection(&self.shared.name, format!("{e:#}")),
            };
            warn!(session = %self.shared.name, address, error = %err, "open failed");
            self.publish(Some(kind), Some(err.to_string()));
            return Err(err);
        }

        self.slot.transport = Some(transport);
        info!(session = %self.shared.name, address, %kind, "session opened");
        self.publish(Some(kind), None);
        Ok(())
    }

    /// Close the transport; closing a closed session is a no-op.
    pub async fn close(&mut self) -> AppResult<()> {
        let Some(mut transport) = self.slot.transport.take() else {
            return Ok(());
        };
        let kind = transport.kind();
        let result = transport.close().await;
        info!(session = %self.shared.name, address = ?self.slot.address, "session closed");
        match result {
            Ok(()) => {
                self.publish(Some(kind), None);
                Ok(())
            }
            Err(e) => {
                let err = StationError::Transport(e);
                self.publish(Some(kind), Some(err.to_string()));
                Err(err)
            }
        }
    }

    /// Write `text`, appending the session terminator unless it already ends in `\n`.
    pub async fn write(&mut self, text: &str) -> AppResult<()> {
        let payload = terminate(text, &self.shared.options.terminator);
        debug!(target: "session", session = %self.shared.name, command = %text.trim_end(), "write");
        let result = self.transport()?.write(payload.as_bytes()).await;
        self.record(result)
    }

    /// Whatever the device has sent, possibly empty.
    pub async fn read(&mut self) -> AppResult<String> {
        let result = self.transport()?.read().await;
        let bytes = self.record(result)?;
        let text = String::from_utf8_lossy(&bytes).into_owned();
        if !text.is_empty() {
            debug!(target: "session", session = %self.shared.name, reply = %text.trim_end(), "read");
        }
        Ok(text)
    }

    /// Query with the session's default timeout.
    pub async fn query(&mut self, text: &str) -> AppResult<String> {
        let timeout = self.shared.options.query_timeout;
        self.query_with_timeout(text, timeout).await
    }

    /// Write `text`, wait the settle delay, then poll until data arrives or `timeout` passes.
    pub async fn query_with_timeout(&mut self, text: &str, timeout: Duration) -> AppResult<String> {
        self.write(text).await?;
        let settle = self.shared.options.settle;
        if !settle.is_zero() {
            tokio::time::sleep(settle).await;
        }

        let deadline = Instant::now() + timeout;
        let mut reply = String::new();
        loop {
            let chunk = self.read().await?;
            if !chunk.is_empty() {
                reply.push_str(&chunk);
                break;
            }
            if Instant::now() >= deadline {
                let err = StationError::Timeout {
                    command: text.trim_end().to_string(),
                    after: timeout,
                };
                self.publish_error(&err);
                return Err(err);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        if self.transport()?.message_based() {
            return Ok(reply);
        }

        // Pick up the tail of a reply split across reads
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            let chunk = self.read().await?;
            if chunk.is_empty() {
                break;
            }
            reply.push_str(&chunk);
        }
        Ok(reply)
    }

    /// Discard pending input.
    pub async fn flush_input(&mut self) -> AppResult<()> {
        let result = self.transport()?.flush_input().await;
        self.record(result)
    }

    fn transport(&mut self) -> AppResult<&mut Box<dyn Transport>> {
        let name = &self.shared.name;
        self.slot
            .transport
            .as_mut()
            .filter(|transport| transport.is_open())
            .ok_or_else(|| StationError::connection(name, "session is not open"))
    }

    fn record<T>(&self, result: anyhow::Result<T>) -> AppResult<T> {
        result.map_err(|e| {
            let err = StationError::Transport(e);
            self.publish_error(&err);
            err
        })
    }

    fn publish_error(&self, err: &StationError) {
        let message = err.to_string();
        self.shared.info.send_modify(|info| info.last_error = Some(message));
    }

    fn publish(&self, kind: Option<TransportKind>, last_error: Option<String>) {
        let open = self.is_open();
        let address = self.slot.address.clone();
        self.shared.info.send_modify(|info| {
            info.address = address;
            info.kind = kind;
            info.open = open;
            info.last_error = last_error;
        });
    }
}

/// Append `terminator` unless `text` already ends in `\n`.
pub fn terminate(text: &str, terminator: &str) -> String {
    if text.ends_with('\n') {
        text.to_string()
    } else {
        format!("{text}{terminator}")
    }
}

/// Connector for VISA resources
pub fn visa_connector(options: VisaOptions) -> Connector {
    Arc::new(move |address| Box::new(VisaAdapter::new(address).with_options(options.clone())))
}

/// Connector for serial ports
pub fn serial_connector(baud_rate: u32, timeout: Duration) -> Connector {
    Arc::new(move |address| Box::new(SerialAdapter::new(address, baud_rate).with_timeout(timeout)))
}

/// Connector that always hands out clones of one mock device
pub fn mock_connector(mock: MockAdapter) -> Connector {
    Arc::new(move |_| Box::new(mock.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    fn options() -> SessionOptions {
        SessionOptions {
            terminator: "\n".to_string(),
            settle: Duration::ZERO,
            query_timeout: Duration::from_millis(200),
        }
    }

    async fn open_mock() -> (Session, MockAdapter) {
        let mock = MockAdapter::new("ADDR1");
        let session = Session::new("instrument", options(), mock_connector(mock.clone()));
        session.open("ADDR1").await.unwrap();
        (session, mock)
    }

    #[test]
    fn test_terminate() {
        assert_eq!(terminate("*IDN?", "\n"), "*IDN?\n");
        assert_eq!(terminate("DRIVE X", "\r\n"), "DRIVE X\r\n");
        assert_eq!(terminate("\n", "\r\n"), "\n");
        assert_eq!(terminate(":INIT:SAN", ""), ":INIT:SAN");
    }

    #[tokio::test]
    async fn test_open_same_address_is_noop() {
        let (session, mock) = open_mock().await;
        session.open("ADDR1").await.unwrap();
        assert_eq!(mock.open_count().await, 1);
        assert!(session.is_open());
        assert_eq!(session.info().address.as_deref(), Some("ADDR1"));
    }

    #[tokio::test]
    async fn test_open_new_address_closes_old() {
        let first = MockAdapter::new("ADDR1");
        let second = MockAdapter::new("ADDR2");
        let (a, b) = (first.clone(), second.clone());
        let connector: Connector = Arc::new(move |address| {
            if address == "ADDR1" {
                Box::new(a.clone())
            } else {
                Box::new(b.clone())
            }
        });
        let session = Session::new("instrument", options(), connector);
        session.open("ADDR1").await.unwrap();
        session.open("ADDR2").await.unwrap();

        assert!(!first.is_open());
        assert!(second.is_open());
        assert_eq!(session.info().address.as_deref(), Some("ADDR2"));
    }

    #[tokio::test]
    async fn test_open_failure_reports_connection_error() {
        let mock = MockAdapter::new("ADDR9");
        mock.fail_open(true).await;
        let session = Session::new("motor", options(), mock_connector(mock));
        let err = session.open("ADDR9").await.unwrap_err();
        assert!(matches!(err, StationError::Connection { .. }));
        let info = session.info();
        assert!(!info.open);
        assert!(info.last_error.is_some());
    }

    #[tokio::test]
    async fn test_write_on_closed_session_fails() {
        let session = Session::new("relay", options(), mock_connector(MockAdapter::new("COM3")));
        let err = assert_err!(session.write("111").await);
        assert!(matches!(err, StationError::Connection { .. }));
    }

    #[tokio::test]
    async fn test_query_returns_reply() {
        let (session, mock) = open_mock().await;
        mock.reply("*IDN?", "Keysight,N9020A,MY123,A.01").await;
        let reply = assert_ok!(session.query("*IDN?").await);
        assert_eq!(reply, "Keysight,N9020A,MY123,A.01");
    }

    #[tokio::test]
    async fn test_query_times_out() {
        let (session, _mock) = open_mock().await;
        let mut io = session.lock().await;
        let err = io
            .query_with_timeout(":SYST:ERR?", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.is_recoverable());
        drop(io);
        assert!(session.info().last_error.unwrap().contains(":SYST:ERR?"));
    }

    #[tokio::test]
    async fn test_composite_under_one_lock_does_not_deadlock() {
        let (session, mock) = open_mock().await;
        mock.reply(":SENS:FREQ:START?", "0").await;

        let composite = async {
            let mut io = session.lock().await;
            io.write(":SENS:FREQ:START?").await?;
            let first = io.read().await?;
            let second = io.read().await?;
            Ok::<_, StationError>((first, second))
        };
        let (first, second) = tokio::time::timeout(Duration::from_secs(1), composite)
            .await
            .expect("composite deadlocked")
            .unwrap();
        assert_eq!(first, "0");
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_info_tracks_close() {
        let (session, _mock) = open_mock().await;
        let mut rx = session.subscribe();
        session.close().await.unwrap();
        rx.changed().await.unwrap();
        assert!(!rx.borrow().open);
        assert!(!session.is_open());
    }
}
