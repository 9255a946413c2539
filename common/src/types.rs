use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectivityState {
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

impl ConnectivityState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "DISCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Unconnected,
    Connected,
    Faulted,
}

impl ChannelState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unconnected => "UNCONNECTED",
            Self::Connected => "CONNECTED",
            Self::Faulted => "FAULTED",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Booting,
    AwaitingNetwork,
    AwaitingTelemetry,
    Running,
    Recovering,
}

impl SupervisorState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Booting => "BOOTING",
            Self::AwaitingNetwork => "AWAITING_NETWORK",
            Self::AwaitingTelemetry => "AWAITING_TELEMETRY",
            Self::Running => "RUNNING",
            Self::Recovering => "RECOVERING",
        }
    }
}

/// The remote fan toggle.
///
/// The telemetry channel holds the only writing clone and updates it from
/// inside `poll_inbound`; the supervisor reads it after the poll returns.
/// Both run on the same task today, the atomic keeps the contract intact if
/// a second task ever appears.
#[derive(Debug, Clone, Default)]
pub struct FanSwitch {
    on: Arc<AtomicBool>,
}

impl FanSwitch {
    pub fn is_on(&self) -> bool {
        self.on.load(Ordering::Acquire)
    }

    pub fn set(&self, on: bool) {
        self.on.store(on, Ordering::Release);
    }
}

/// Most recent temperature reading. Never stored past the tick that made it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetrySample {
    pub celsius: f32,
}

impl TelemetrySample {
    /// There is no sensor on the board; the reading is derived from uptime.
    pub fn simulated(uptime_ms: u64) -> Self {
        Self {
            celsius: 24.5 + (uptime_ms % 1000) as f32 / 100.0,
        }
    }

    /// Shortest round-trip decimal text, always with a fractional part.
    pub fn payload(&self) -> String {
        format!("{:?}", self.celsius)
    }
}
