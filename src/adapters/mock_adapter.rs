//! Scripted in-memory transport.
//!
//! `MockAdapter` stands in for a device in tests. Clones share state, so a test keeps
//! one clone to script replies and inspect the transcript while the session owns another.
//!
//! ```rust,ignore
//! let mock = MockAdapter::new("ADDR1");
//! mock.reply(":SENS:FREQ:START?", "0").await;
//! session.open_with(Box::new(mock.clone())).await?;
//! assert_eq!(mock.writes().await, vec![":SENS:FREQ:START?"]);
//! ```

use super::{Transport, TransportKind};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

type Responder = Box<dyn FnMut(&str) -> Option<String> + Send>;

#[derive(Default)]
struct MockState {
    open_count: usize,
    replies: HashMap<String, VecDeque<String>>,
    sticky: HashMap<String, String>,
    responder: Option<Responder>,
    failing: HashSet<String>,
    fail_open: bool,
    inbox: VecDeque<Vec<u8>>,
    writes: Vec<String>,
}

/// In-memory device with canned replies and a write transcript
#[derive(Clone)]
pub struct MockAdapter {
    address: String,
    open: Arc<AtomicBool>,
    state: Arc<Mutex<MockState>>,
}

impl MockAdapter {
    /// Create a closed mock device at `address`
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            open: Arc::new(AtomicBool::new(false)),
            state: Arc::new(Mutex::new(MockState::default())),
        }
    }

    /// Always answer `command` with `reply`
    pub async fn reply(&self, command: &str, reply: impl Into<String>) {
        self.state
            .lock()
            .await
            .sticky
            .insert(command.to_string(), reply.into());
    }

    /// Answer the next occurrence of `command` with `reply`; queued replies win over sticky ones
    pub async fn reply_once(&self, command: &str, reply: impl Into<String>) {
        self.state
            .lock()
            .await
            .replies
            .entry(command.to_string())
            .or_default()
            .push_back(reply.into());
    }

    /// Fallback for commands without a canned reply
    pub async fn respond_with<F>(&self, responder: F)
    where
        F: FnMut(&str) -> Option<String> + Send + 'static,
    {
        self.state.lock().await.responder = Some(Box::new(responder));
    }

    /// Make every write of `command` fail with a transport error
    pub async fn fail_on(&self, command: &str) {
        self.state.lock().await.failing.insert(command.to_string());
    }

    /// Stop failing `command`
    pub async fn heal(&self, command: &str) {
        self.state.lock().await.failing.remove(command);
    }

    /// Make the next `open` fail
    pub async fn fail_open(&self, fail: bool) {
        self.state.lock().await.fail_open = fail;
    }

    /// Queue unsolicited bytes for the next read
    pub async fn push_input(&self, data: impl Into<Vec<u8>>) {
        self.state.lock().await.inbox.push_back(data.into());
    }

    /// Commands written so far, terminators stripped
    pub async fn writes(&self) -> Vec<String> {
        self.state.lock().await.writes.clone()
    }

    /// Forget the transcript
    pub async fn clear_writes(&self) {
        self.state.lock().await.writes.clear();
    }

    /// How many times the device has been opened
    pub async fn open_count(&self) -> usize {
        self.state.lock().await.open_count
    }

    /// Simulate the device dropping off the bus
    pub fn disconnect(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockAdapter {
    fn kind(&self) -> TransportKind {
        TransportKind::Mock
    }

    fn address(&self) -> &str {
        &self.address
    }

    async fn open(&mut self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.fail_open {
            return Err(anyhow!("Mock device '{}' refused to open", self.address));
        }
        state.open_count += 1;
        self.open.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        self.open.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn write(&mut self, data: &[u8]) -> Result<()> {
        if !self.is_open() {
            return Err(anyhow!("Mock device '{}' is not open", self.address));
        }
        let mut state = self.state.lock().await;
        let command = String::from_utf8_lossy(data)
            .trim_end_matches(['\r', '\n'])
            .to_string();
        state.writes.push(command.clone());

        if state.failing.contains(&command) {
            return Err(anyhow!("Mock device '{}' failed on '{}'", self.address, command));
        }

        let reply = match state.replies.get_mut(&command).and_then(VecDeque::pop_front) {
            Some(reply) => Some(reply),
            None => match state.sticky.get(&command) {
                Some(reply) => Some(reply.clone()),
                None => state.responder.as_mut().and_then(|respond| respond(&command)),
            },
        };
        if let Some(reply) = reply {
            state.inbox.push_back(reply.into_bytes());
        }
        Ok(())
    }

    async fn read(&mut self) -> Result<Vec<u8>> {
        if !self.is_open() {
            return Err(anyhow!("Mock device '{}' is not open", self.address));
        }
        let mut state = self.state.lock().await;
        Ok(state.inbox.pop_front().unwrap_or_default())
    }

    async fn flush_input(&mut self) -> Result<()> {
        self.state.lock().await.inbox.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_queued_reply_wins_over_sticky() {
        let mut mock = MockAdapter::new("ADDR1");
        mock.reply("*IDN?", "sticky").await;
        mock.reply_once("*IDN?", "first").await;
        mock.open().await.unwrap();

        mock.write(b"*IDN?\n").await.unwrap();
        assert_eq!(mock.read().await.unwrap(), b"first".to_vec());
        mock.write(b"*IDN?\n").await.unwrap();
        assert_eq!(mock.read().await.unwrap(), b"sticky".to_vec());
        assert!(mock.read().await.unwrap().is_empty());
        assert_eq!(mock.writes().await, vec!["*IDN?", "*IDN?"]);
    }

    #[tokio::test]
    async fn test_closed_device_rejects_io() {
        let mut mock = MockAdapter::new("COM3");
        assert!(mock.write(b"DRIVE X\r\n").await.is_err());
        mock.open().await.unwrap();
        mock.disconnect();
        assert!(mock.read().await.is_err());
    }

    #[tokio::test]
    async fn test_failure_injection() {
        let mut mock = MockAdapter::new("ADDR1");
        mock.open().await.unwrap();
        mock.fail_on(":INIT:SAN").await;
        assert!(mock.write(b":INIT:SAN\n").await.is_err());
        mock.heal(":INIT:SAN").await;
        assert!(mock.write(b":INIT:SAN\n").await.is_ok());
    }
}
