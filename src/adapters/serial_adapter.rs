//! RS-232 transport for the positioner controller and the relay PLC.

use super::{Transport, TransportKind};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

#[cfg(feature = "instrument_serial")]
use serialport::{ClearBuffer, SerialPort};
#[cfg(feature = "instrument_serial")]
use std::sync::Arc;
#[cfg(feature = "instrument_serial")]
use tokio::sync::Mutex;

/// Serial transport
///
/// Wraps the serialport crate and moves every blocking call onto Tokio's
/// blocking pool. Reads never wait: they return what the driver has buffered.
pub struct SerialAdapter {
    /// Port name (e.g., "/dev/ttyUSB0", "COM3")
    port_name: String,

    /// Baud rate (e.g., 9600, 115200)
    baud_rate: u32,

    /// Driver-level write timeout
    timeout: Duration,

    #[cfg(feature = "instrument_serial")]
    port: Option<Arc<Mutex<Box<dyn SerialPort>>>>,
}

impl SerialAdapter {
    /// Create a closed adapter for `port_name` at `baud_rate`
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            timeout: Duration::from_millis(1000),
            #[cfg(feature = "instrument_serial")]
            port: None,
        }
    }

    /// Set the driver-level timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Configured baud rate
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    #[cfg(feature = "instrument_serial")]
    fn port(&self) -> Result<Arc<Mutex<Box<dyn SerialPort>>>> {
        self.port
            .clone()
            .ok_or_else(|| anyhow!("Serial port '{}' is not open", self.port_name))
    }
}

#[cfg(not(feature = "instrument_serial"))]
fn serial_disabled() -> anyhow::Error {
    anyhow::Error::new(crate::error::StationError::FeatureNotEnabled(
        "instrument_serial".to_string(),
    ))
}

#[async_trait]
impl Transport for SerialAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn address(&self) -> &str {
        &self.port_name
    }

    async fn open(&mut self) -> Result<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let port_name = self.port_name.clone();
            let baud_rate = self.baud_rate;
            let timeout = self.timeout;
            let port = tokio::task::spawn_blocking(move || {
                serialport::new(&port_name, baud_rate)
                    .timeout(timeout)
                    .open()
                    .with_context(|| {
                        format!("Failed to open serial port '{}' at {} baud", port_name, baud_rate)
                    })
            })
            .await
            .context("Serial open task panicked")??;

            self.port = Some(Arc::new(Mutex::new(port)));
            debug!("Serial port '{}' opened at {} baud", self.port_name, self.baud_rate);
            Ok(())
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(serial_disabled())
        }
    }

    async fn close(&mut self) -> Result<()> {
        #[cfg(feature = "instrument_serial")]
        {
            if self.port.take().is_some() {
                debug!("Serial port '{}' closed", self.port_name);
            }
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        #[cfg(feature = "instrument_serial")]
        {
            self.port.is_some()
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            false
        }
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.port()?;
            let data = data.to_vec();
            tokio::task::spawn_blocking(move || {
                use std::io::Write;

                let mut port_guard = port.blocking_lock();
                port_guard
                    .write_all(&data)
                    .context("Failed to write to serial port")?;
                port_guard.flush().context("Failed to flush serial port")?;
                debug!("Sent serial data: {:?}", String::from_utf8_lossy(&data).trim());
                Ok(())
            })
            .await
            .context("Serial I/O task panicked")?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            let _ = data;
            Err(serial_disabled())
        }
    }

    async fn read(&mut self) -> Result<Vec<u8>> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.port()?;
            tokio::task::spawn_blocking(move || {
                use std::io::Read;

                let mut port_guard = port.blocking_lock();
                let pending = port_guard
                    .bytes_to_read()
                    .context("Failed to query serial input buffer")?;
                if pending == 0 {
                    return Ok(Vec::new());
                }
                let mut buffer = vec![0u8; pending as usize];
                let count = match port_guard.read(&mut buffer) {
                    Ok(count) => count,
                    Err(e) if e.kind() == std::io::ErrorKind::TimedOut => 0,
                    Err(e) => return Err(anyhow!("Serial read error: {}", e)),
                };
                buffer.truncate(count);
                Ok(buffer)
            })
            .await
            .context("Serial I/O task panicked")?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Err(serial_disabled())
        }
    }

    async fn flush_input(&mut self) -> Result<()> {
        #[cfg(feature = "instrument_serial")]
        {
            let port = self.port()?;
            tokio::task::spawn_blocking(move || {
                port.blocking_lock()
                    .clear(ClearBuffer::Input)
                    .context("Failed to clear serial input buffer")
            })
            .await
            .context("Serial I/O task panicked")?
        }

        #[cfg(not(feature = "instrument_serial"))]
        {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_serial_adapter_creation() {
        let adapter = SerialAdapter::new("/dev/ttyUSB0", 9600);
        assert_eq!(adapter.kind(), TransportKind::Serial);
        assert_eq!(adapter.address(), "/dev/ttyUSB0");
        assert_eq!(adapter.baud_rate(), 9600);
        assert!(!adapter.message_based());
        assert!(!adapter.is_open());
    }

    #[tokio::test]
    async fn test_io_on_closed_port_fails() {
        let mut adapter = SerialAdapter::new("COM3", 115200);
        assert!(adapter.write(b"1\n").await.is_err());
        assert!(adapter.read().await.is_err());
        assert!(adapter.close().await.is_ok());
    }

    #[cfg(not(feature = "instrument_serial"))]
    #[tokio::test]
    async fn test_open_without_feature_reports_it() {
        let mut adapter = SerialAdapter::new("COM4", 9600);
        let err = adapter.open().await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<crate::error::StationError>(),
            Some(crate::error::StationError::FeatureNotEnabled(feature)) if feature == "instrument_serial"
        ));
        assert!(adapter.write(b"1\n").await.unwrap_err().is::<crate::error::StationError>());
    }
}
