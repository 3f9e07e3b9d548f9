//! RF relay PLC: opcode protocol over the relay serial session.
//!
//! Opcodes go out as binary digits followed by `\n` (`P1_INIT` is `101\n`). The PLC
//! answers with free-form log lines and, after `QUERY_STATUS`, a bare integer: the
//! last opcode it acted on. That integer is the relay status used to pick the active
//! RF chain.

use crate::config::RelayConfig;
use crate::error::{AppResult, StationError};
use crate::session::Session;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

const DRAIN_INTERVAL: Duration = Duration::from_millis(20);

/// One PLC opcode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct Opcode(pub u8);

#[allow(missing_docs)]
impl Opcode {
    pub const SLEEP: Opcode = Opcode(0);
    pub const RETURN_OPCODES: Opcode = Opcode(1);
    pub const GET_FW_VERSION: Opcode = Opcode(2);
    pub const PRINT_MODULES: Opcode = Opcode(3);
    pub const IS_BASE_ACTIVE: Opcode = Opcode(4);
    pub const P1_INIT: Opcode = Opcode(5);
    pub const P1_DISABLE: Opcode = Opcode(6);
    pub const QUERY_STATUS: Opcode = Opcode(7);
    pub const CHECK_24V_SL1: Opcode = Opcode(9);
    pub const CHECK_24V_SL2: Opcode = Opcode(10);
    pub const CHECK_24V_SL3: Opcode = Opcode(11);
    pub const WLIGHT_EXCL: Opcode = Opcode(0b1111);
    pub const READ_STATUS_SL1: Opcode = Opcode(0x11);
    pub const READ_STATUS_SL2: Opcode = Opcode(0x12);
    pub const READ_STATUS_SL3: Opcode = Opcode(0x13);
    pub const EMS_SELECT: Opcode = Opcode(0b0100_0000);
    pub const DFS_SELECT: Opcode = Opcode(0b0101_0000);
    pub const EMS_CHAIN1: Opcode = Opcode(Self::EMS_SELECT.0 | Self::channel_bits(1));
    pub const DFS_CHAIN1: Opcode = Opcode(Self::DFS_SELECT.0 | Self::channel_bits(1));
    pub const WLIGHT_ON: Opcode = Opcode(0x80);
    pub const WLIGHT_CLR: Opcode = Opcode(0x7F);

    const NAMED: [(&'static str, Opcode); 21] = [
        ("SLEEP", Self::SLEEP),
        ("RETURN_OPCODES", Self::RETURN_OPCODES),
        ("GET_FW_VERSION", Self::GET_FW_VERSION),
        ("PRINT_MODULES", Self::PRINT_MODULES),
        ("IS_BASE_ACTIVE", Self::IS_BASE_ACTIVE),
        ("P1_INIT", Self::P1_INIT),
        ("P1_DISABLE", Self::P1_DISABLE),
        ("QUERY_STATUS", Self::QUERY_STATUS),
        ("CHECK_24V_SL1", Self::CHECK_24V_SL1),
        ("CHECK_24V_SL2", Self::CHECK_24V_SL2),
        ("CHECK_24V_SL3", Self::CHECK_24V_SL3),
        ("WLIGHT_EXCL", Self::WLIGHT_EXCL),
        ("READ_STATUS_SL1", Self::READ_STATUS_SL1),
        ("READ_STATUS_SL2", Self::READ_STATUS_SL2),
        ("READ_STATUS_SL3", Self::READ_STATUS_SL3),
        ("EMS_SELECT", Self::EMS_SELECT),
        ("DFS_SELECT", Self::DFS_SELECT),
        ("EMS_CHAIN1", Self::EMS_CHAIN1),
        ("DFS_CHAIN1", Self::DFS_CHAIN1),
        ("WLIGHT_ON", Self::WLIGHT_ON),
        ("WLIGHT_CLR", Self::WLIGHT_CLR),
    ];

    /// Low nibble for channel `n` (1..=16): CH1 is `0b0000`, CH16 is `0b1111`.
    const fn channel_bits(n: u8) -> u8 {
        (n - 1) & 0x0F
    }

    /// EMS chain `n` (1..=16)
    pub fn ems_chain(n: u8) -> AppResult<Opcode> {
        Self::chain(Self::EMS_SELECT, n)
    }

    /// DFS chain `n` (1..=16)
    pub fn dfs_chain(n: u8) -> AppResult<Opcode> {
        Self::chain(Self::DFS_SELECT, n)
    }

    fn chain(select: Opcode, n: u8) -> AppResult<Opcode> {
        if !(1..=16).contains(&n) {
            return Err(StationError::range("channel", n, 1, 16));
        }
        Ok(Opcode(select.0 | Self::channel_bits(n)))
    }

    /// Symbolic name, when the opcode has one
    pub fn name(self) -> Option<&'static str> {
        Self::NAMED
            .iter()
            .find(|(_, op)| *op == self)
            .map(|(name, _)| *name)
    }

    /// Wire form: binary digits and a newline
    pub fn encode(self) -> String {
        format!("{:b}\n", self.0)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.name() {
            Some(name) => f.write_str(name),
            None => write!(f, "{:#010b}", self.0),
        }
    }
}

impl std::str::FromStr for Opcode {
    type Err = StationError;

    /// Accepts a symbolic name (any case), a decimal value or a `0b`/`0x` literal.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some((_, op)) = Self::NAMED.iter().find(|(name, _)| name.eq_ignore_ascii_case(s)) {
            return Ok(*op);
        }
        let parsed = if let Some(bits) = s.strip_prefix("0b") {
            u8::from_str_radix(bits, 2)
        } else if let Some(hex) = s.strip_prefix("0x") {
            u8::from_str_radix(hex, 16)
        } else {
            s.parse::<u8>()
        };
        parsed
            .map(Opcode)
            .map_err(|_| StationError::Protocol(format!("unknown PLC opcode '{s}'")))
    }
}

/// RF chain selected by the last reported status.
///
/// Status codes that do not select a chain (P1_INIT, diagnostics) leave it unchanged.
pub fn chain_after(status: u8, previous: &str) -> String {
    match Opcode(status) {
        Opcode::SLEEP | Opcode::P1_DISABLE => "SLEEP".to_string(),
        Opcode::EMS_CHAIN1 => "EMS1".to_string(),
        Opcode::DFS_CHAIN1 => "DFS1".to_string(),
        _ => previous.to_string(),
    }
}

/// Last status reported by the PLC
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlcSnapshot {
    /// Raw status code
    pub status: u8,
    /// Active chain label, used as the record file prefix
    pub chain: String,
}

impl Default for PlcSnapshot {
    fn default() -> Self {
        Self {
            status: Opcode::SLEEP.0,
            chain: "SLEEP".to_string(),
        }
    }
}

/// Sends opcodes to the relay PLC and tracks its status.
pub struct PlcController {
    session: Arc<Session>,
    echo_window: Duration,
    status_window: Duration,
    init_window: Duration,
    disable_window: Duration,
    state: watch::Sender<PlcSnapshot>,
}

impl PlcController {
    /// Controller over the relay session, status SLEEP until the PLC reports otherwise
    pub fn new(session: Arc<Session>, config: &RelayConfig) -> Self {
        let (state, _) = watch::channel(PlcSnapshot::default());
        Self {
            session,
            echo_window: config.echo_window,
            status_window: config.status_window,
            init_window: config.init_window,
            disable_window: config.disable_window,
            state,
        }
    }

    /// The relay session
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Last reported status and chain
    pub fn snapshot(&self) -> PlcSnapshot {
        self.state.borrow().clone()
    }

    /// Watch status changes
    pub fn subscribe(&self) -> watch::Receiver<PlcSnapshot> {
        self.state.subscribe()
    }

    /// How long to collect the status reply after `opcode`
    pub fn status_window_for(&self, opcode: Opcode) -> Duration {
        match opcode {
            Opcode::P1_INIT => self.init_window,
            Opcode::P1_DISABLE => self.disable_window,
            _ => self.status_window,
        }
    }

    /// Write `opcode`, collect its echo, then ask for and collect the status.
    #[instrument(skip(self, opcode), fields(opcode = %opcode))]
    pub async fn send(&self, opcode: Opcode) -> AppResult<u8> {
        info!("PLC >>> {opcode}");
        self.session.write(&opcode.encode()).await?;
        self.drain(self.echo_window).await?;
        self.write_status_query(self.status_window_for(opcode)).await
    }

    /// Ask for the status without sending anything else.
    pub async fn query_status(&self) -> AppResult<u8> {
        self.write_status_query(self.status_window).await
    }

    async fn write_status_query(&self, window: Duration) -> AppResult<u8> {
        self.session.write(&Opcode::QUERY_STATUS.encode()).await?;
        self.drain(window).await?;
        Ok(self.snapshot().status)
    }

    /// Read whatever arrives for `window`, one short lock per read.
    async fn drain(&self, window: Duration) -> AppResult<()> {
        let deadline = Instant::now() + window;
        while Instant::now() < deadline {
            let chunk = self.session.read().await?;
            self.handle_reply(&chunk);
            tokio::time::sleep(DRAIN_INTERVAL).await;
        }
        Ok(())
    }

    /// Integer lines update the status; everything else is PLC chatter.
    pub fn handle_reply(&self, text: &str) {
        for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
            match line.parse::<u8>() {
                Ok(status) => {
                    debug!(status, "PLC status");
                    self.state.send_modify(|s| {
                        s.chain = chain_after(status, &s.chain);
                        s.status = status;
                    });
                }
                Err(_) => info!(target: "session", "PLC: {line}"),
            }
        }
    }
}
