pub mod actuator;
pub mod config;
pub mod display;
pub mod error;
pub mod network;
pub mod platform;
pub mod supervisor;
pub mod telemetry;
pub mod topics;
pub mod types;

#[cfg(test)]
mod testing;

pub use actuator::{ActuatorBank, ActuatorOutputs, PwmOutput, DUTY_FULL, DUTY_OFF};
pub use config::{BrokerConfig, HardwareConfig, LoopPolicy, NetworkConfig, RuntimeConfig};
pub use display::{DisplayFrame, DisplaySurface, PanelFactory, TextPanel, DISPLAY_LINES};
pub use error::{
    ConnectError, DisplayError, DisplayInitError, FatalError, HardwareError, PollError,
    PublishError, StationError, TickError, TransportError,
};
pub use network::{NetworkSession, RetryPolicy, WifiStation};
pub use platform::{monotonic_ms, Platform};
pub use supervisor::{Components, ControlSupervisor, StepOutcome, TickReport};
pub use telemetry::{
    decode_fan_command, BrokerTransport, InboundMessage, PollOutcome, TelemetryChannel,
    MAX_INBOUND_PAYLOAD_BYTES,
};
pub use topics::*;
pub use types::{ChannelState, ConnectivityState, FanSwitch, SupervisorState, TelemetrySample};
