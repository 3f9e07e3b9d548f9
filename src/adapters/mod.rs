//! Hardware transport implementations
//!
//! This module contains the [`Transport`] trait and its implementations, the low-level
//! byte movers underneath every [`Session`](crate::session::Session):
//!
//! - [`VisaAdapter`]: message-based VISA resources (the spectrum analyzer)
//! - [`SerialAdapter`]: RS-232 byte streams (the positioner and the relay PLC)
//! - [`MockAdapter`]: scripted in-memory device used by tests and dry runs
//!
//! Transports are deliberately dumb: no locking, no terminators, no timeouts beyond
//! their own port settings. Those belong to the session.

pub mod mock_adapter;
pub mod serial_adapter;
pub mod visa_adapter;

pub use mock_adapter::MockAdapter;
pub use serial_adapter::SerialAdapter;
pub use visa_adapter::{VisaAdapter, VisaOptions};

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which physical protocol a transport speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Request/response over a VISA resource string
    Visa,
    /// Raw line-oriented byte stream
    Serial,
    /// In-memory test double
    Mock,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Visa => f.write_str("visa"),
            Self::Serial => f.write_str("serial"),
            Self::Mock => f.write_str("mock"),
        }
    }
}

/// Low-level I/O to one physical device.
///
/// `read` must not block waiting for data: it returns whatever is currently
/// available, possibly nothing. Polling and timeouts are the caller's job.
#[async_trait]
pub trait Transport: Send {
    /// Protocol spoken by this transport
    fn kind(&self) -> TransportKind;

    /// Address the transport was created for (resource string or port name)
    fn address(&self) -> &str;

    /// Open the underlying device
    async fn open(&mut self) -> Result<()>;

    /// Close the underlying device; closing a closed transport is a no-op
    async fn close(&mut self) -> Result<()>;

    /// Whether the device handle is currently held
    fn is_open(&self) -> bool;

    /// Write raw bytes, already terminated
    async fn write(&mut self, data: &[u8]) -> Result<()>;

    /// Read whatever bytes are available right now
    async fn read(&mut self) -> Result<Vec<u8>>;

    /// Whether one successful `read` returns a whole reply.
    ///
    /// Message-based transports end a read at the device's END indicator and may block
    /// until their own I/O timeout when nothing is pending, so sessions never poll them
    /// for the tail of a reply.
    fn message_based(&self) -> bool {
        false
    }

    /// Discard anything waiting in the input buffer
    async fn flush_input(&mut self) -> Result<()>;
}
