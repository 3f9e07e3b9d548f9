//! VISA transport for the spectrum analyzer
//!
//! Supports resource strings like:
//! - "GPIB0::1::INSTR" (GPIB interface)
//! - "USB0::0x1234::0x5678::SERIAL::INSTR" (USB)
//! - "TCPIP0::10.0.0.5::INSTR" (Ethernet/LXI)

use super::{Transport, TransportKind};
use crate::config::InstrumentConfig;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::time::Duration;

#[cfg(feature = "instrument_visa")]
use anyhow::Context;
#[cfg(feature = "instrument_visa")]
use std::sync::Arc;
#[cfg(feature = "instrument_visa")]
use tokio::sync::Mutex;
#[cfg(feature = "instrument_visa")]
use tracing::debug;
#[cfg(feature = "instrument_visa")]
use visa_rs::prelude::*;

/// Session options applied when the resource is opened
#[derive(Debug, Clone, PartialEq)]
pub struct VisaOptions {
    /// I/O timeout
    pub timeout: Duration,
    /// Maximum bytes per read
    pub chunk_size: usize,
    /// Assert END on the last byte of each write
    pub send_end: bool,
    /// Stop reads at the termination character
    pub enable_termination: bool,
    /// Read termination character (`\n` or `\r`)
    pub termination: char,
}

impl Default for VisaOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2000),
            chunk_size: 20480,
            send_end: true,
            enable_termination: false,
            termination: '\n',
        }
    }
}

impl From<&InstrumentConfig> for VisaOptions {
    fn from(settings: &InstrumentConfig) -> Self {
        Self {
            timeout: Duration::from_millis(settings.timeout_ms),
            chunk_size: settings.chunk_size,
            send_end: settings.send_end,
            enable_termination: settings.enable_termination,
            termination: settings.termination.chars().next().unwrap_or('\n'),
        }
    }
}

#[cfg(feature = "instrument_visa")]
struct VisaHandle {
    // Sessions die with their resource manager
    _rm: DefaultRM,
    instrument: Instrument,
}

/// VISA transport
///
/// Wraps visa-rs; every blocking call runs on Tokio's blocking pool.
pub struct VisaAdapter {
    resource_string: String,
    options: VisaOptions,

    #[cfg(feature = "instrument_visa")]
    handle: Option<Arc<Mutex<VisaHandle>>>,
}

impl VisaAdapter {
    /// Create a closed adapter for `resource_string` with default options
    pub fn new(resource_string: impl Into<String>) -> Self {
        Self {
            resource_string: resource_string.into(),
            options: VisaOptions::default(),
            #[cfg(feature = "instrument_visa")]
            handle: None,
        }
    }

    /// Replace all session options
    pub fn with_options(mut self, options: VisaOptions) -> Self {
        self.options = options;
        self
    }

    /// Set the I/O timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.options.timeout = timeout;
        self
    }

    /// Options the resource is (or will be) opened with
    pub fn options(&self) -> &VisaOptions {
        &self.options
    }

    #[cfg(feature = "instrument_visa")]
    fn handle(&self) -> Result<Arc<Mutex<VisaHandle>>> {
        self.handle
            .clone()
            .ok_or_else(|| anyhow!("VISA resource '{}' is not open", self.resource_string))
    }
}

#[cfg(not(feature = "instrument_visa"))]
fn visa_disabled() -> anyhow::Error {
    anyhow::Error::new(crate::error::StationError::FeatureNotEnabled(
        "instrument_visa".to_string(),
    ))
}

#[async_trait]
impl Transport for VisaAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Visa
    }

    fn address(&self) -> &str {
        &self.resource_string
    }

    fn message_based(&self) -> bool {
        true
    }

    async fn open(&mut self) -> Result<()> {
        #[cfg(feature = "instrument_visa")]
        {
            let resource = self.resource_string.clone();
            let timeout = self.options.timeout;
            let handle = tokio::task::spawn_blocking(move || -> Result<VisaHandle> {
                let rm = DefaultRM::new().context("Failed to create VISA resource manager")?;
                let name = std::ffi::CString::new(resource.as_str())
                    .with_context(|| format!("Invalid VISA resource string: {}", resource))?;
                let instrument = rm
                    .open(&name.into(), AccessMode::NO_LOCK, timeout)
                    .with_context(|| format!("Failed to open VISA resource: {}", resource))?;
                Ok(VisaHandle {
                    _rm: rm,
                    instrument,
                })
            })
            .await
            .context("VISA open task panicked")??;

            self.handle = Some(Arc::new(Mutex::new(handle)));
            debug!(
                "VISA resource '{}' opened with {}ms timeout",
                self.resource_string,
                self.options.timeout.as_millis()
            );
            Ok(())
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            Err(visa_disabled())
        }
    }

    async fn close(&mut self) -> Result<()> {
        #[cfg(feature = "instrument_visa")]
        {
            if self.handle.take().is_some() {
                debug!("VISA resource '{}' closed", self.resource_string);
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        #[cfg(feature = "instrument_visa")]
        {
            self.handle.is_some()
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            false
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        #[cfg(feature = "instrument_visa")]
        {
            let handle = self.handle()?;
            let data = data.to_vec();
            tokio::task::spawn_blocking(move || {
                use std::io::Write;

                let guard = handle.blocking_lock();
                (&guard.instrument)
                    .write_all(&data)
                    .with_context(|| {
                        format!("VISA write failed for: {}", String::from_utf8_lossy(&data).trim())
                    })?;
                debug!("VISA write sent: {}", String::from_utf8_lossy(&data).trim());
                Ok(())
            })
            .await
            .context("VISA write task panicked")?
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            let _ = data;
            Err(visa_disabled())
        }
    }

    async fn read(&mut self) -> Result<Vec<u8>> {
        #[cfg(feature = "instrument_visa")]
        {
            let handle = self.handle()?;
            let chunk_size = self.options.chunk_size;
            let terminator = self
                .options
                .enable_termination
                .then_some(self.options.termination as u8);
            tokio::task::spawn_blocking(move || {
                use std::io::Read;

                let guard = handle.blocking_lock();
                let mut response = Vec::new();
                let mut chunk = vec![0u8; chunk_size];
                loop {
                    let count = match (&guard.instrument).read(&mut chunk) {
                        Ok(count) => count,
                        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => 0,
                        Err(e) => return Err(anyhow!("VISA read error: {}", e)),
                    };
                    response.extend_from_slice(&chunk[..count]);
                    // A short chunk means the device asserted END
                    let terminated = terminator.is_some_and(|t| response.last() == Some(&t));
                    if count < chunk_size || terminated {
                        break;
                    }
                }
                Ok(response)
            })
            .await
            .context("VISA read task panicked")?
        }

        #[cfg(not(feature = "instrument_visa"))]
        {
            Err(visa_disabled())
        }
    }

    async fn flush_input(&mut self) -> Result<()> {
        // Message-based sessions have no stray input between transactions
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visa_adapter_creation() {
        let adapter = VisaAdapter::new("GPIB0::1::INSTR");
        assert_eq!(adapter.kind(), TransportKind::Visa);
        assert!(!adapter.is_open());
        assert_eq!(adapter.address(), "GPIB0::1::INSTR");
        assert!(adapter.message_based());
        assert_eq!(adapter.options().timeout, Duration::from_millis(2000));
        assert_eq!(adapter.options().chunk_size, 20480);
    }

    #[test]
    fn test_options_from_settings() {
        let settings = InstrumentConfig {
            timeout_ms: 5000,
            chunk_size: 4096,
            termination: "\r".to_string(),
            ..InstrumentConfig::default()
        };
        let adapter = VisaAdapter::new("TCPIP0::10.0.0.5::INSTR")
            .with_options(VisaOptions::from(&settings));
        assert_eq!(adapter.options().timeout, Duration::from_millis(5000));
        assert_eq!(adapter.options().chunk_size, 4096);
        assert_eq!(adapter.options().termination, '\r');
    }

    #[cfg(not(feature = "instrument_visa"))]
    #[tokio::test]
    async fn test_open_without_feature_reports_it() {
        let mut adapter = VisaAdapter::new("TCPIP0::10.0.0.5::INSTR");
        let err = adapter.open().await.unwrap_err();
        assert!(err.to_string().contains("instrument_visa"));
    }
}
