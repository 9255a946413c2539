use thiserror::Error;

use crate::types::ChannelState;

macro_rules! driver_error {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Error)]
        #[error("{0}")]
        pub struct $name(String);

        impl $name {
            pub fn new(message: impl Into<String>) -> Self {
                Self(message.into())
            }

            pub fn message(&self) -> &str {
                &self.0
            }
        }
    };
}

driver_error!(
    /// Failure reported by the WiFi station driver.
    StationError
);
driver_error!(
    /// Failure reported by the MQTT client underneath a `BrokerTransport`.
    TransportError
);
driver_error!(
    /// PWM channel refused a duty update.
    HardwareError
);
driver_error!(
    /// The display panel could not be brought up. Cached; never retried.
    DisplayInitError
);
driver_error!(DisplayError);

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("wifi association not observed after {attempts} polls")]
    Timeout { attempts: u32 },
    #[error("wifi station rejected association request: {0}")]
    Station(#[source] StationError),
    #[error("broker connection failed: {0}")]
    Broker(#[source] TransportError),
    #[error("subscribe to `{topic}` failed: {source}")]
    Subscribe {
        topic: String,
        #[source]
        source: TransportError,
    },
}

#[derive(Debug, Error)]
pub enum PollError {
    #[error("telemetry channel is {} and cannot poll", .0.as_str())]
    Unavailable(ChannelState),
    #[error("inbound poll failed: {0}")]
    Transport(#[source] TransportError),
    #[error("payload on `{topic}` is not valid text")]
    InvalidPayload { topic: String },
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("telemetry channel is {} and cannot publish", .0.as_str())]
    Unavailable(ChannelState),
    #[error("publish to `{topic}` failed: {source}")]
    Transport {
        topic: String,
        #[source]
        source: TransportError,
    },
}

/// Anything that aborts a running tick. Recovery never looks at the variant.
#[derive(Debug, Error)]
pub enum TickError {
    #[error(transparent)]
    Poll(#[from] PollError),
    #[error("actuator update failed: {0}")]
    Actuator(#[from] HardwareError),
    #[error(transparent)]
    Publish(#[from] PublishError),
}

/// Errors that end in a device reset.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("wifi bring-up failed: {0}")]
    Network(#[source] ConnectError),
    #[error("broker bring-up failed: {0}")]
    Broker(#[source] ConnectError),
    #[error("{failures} consecutive ticks failed; last error: {last}")]
    TickFailures { failures: u32, last: TickError },
}
