use log::{debug, info, warn};

use crate::{
    config::BrokerConfig,
    error::{ConnectError, PollError, PublishError, TransportError},
    topics::FeedTopics,
    types::{ChannelState, FanSwitch, TelemetrySample},
};

/// Control payloads above this size are never decoded.
pub const MAX_INBOUND_PAYLOAD_BYTES: usize = 512;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[allow(async_fn_in_trait)]
pub trait BrokerTransport {
    async fn connect(&mut self, broker: &BrokerConfig) -> Result<(), TransportError>;

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError>;

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError>;

    /// Takes one buffered message if there is one. Must not wait.
    fn try_receive(&mut self) -> Result<Option<InboundMessage>, TransportError>;
}

/// What a single `poll_inbound` call did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Idle,
    Ignored { topic: String },
    FanCommand { on: bool },
}

/// Exact affirmative token, compared after uppercasing. No trimming.
pub fn decode_fan_command(payload: &str) -> bool {
    payload.to_uppercase() == "ON"
}

/// Broker session with one subscribed control topic and one telemetry topic.
pub struct TelemetryChannel<T> {
    transport: T,
    topics: FeedTopics,
    fan: FanSwitch,
    state: ChannelState,
}

impl<T: BrokerTransport> TelemetryChannel<T> {
    pub fn new(transport: T, topics: FeedTopics, fan: FanSwitch) -> Self {
        Self {
            transport,
            topics,
            fan,
            state: ChannelState::Unconnected,
        }
    }

    pub fn state(&self) -> ChannelState {
        self.state
    }

    /// Connects and subscribes to the control topic. Also the way out of `Faulted`.
    pub async fn connect(&mut self, broker: &BrokerConfig) -> Result<(), ConnectError> {
        self.state = ChannelState::Unconnected;

        if let Err(err) = self.transport.connect(broker).await {
            self.state = ChannelState::Faulted;
            return Err(ConnectError::Broker(err));
        }

        if let Err(source) = self.transport.subscribe(&self.topics.fan).await {
            self.state = ChannelState::Faulted;
            return Err(ConnectError::Subscribe {
                topic: self.topics.fan.clone(),
                source,
            });
        }

        info!(
            "broker {}:{} connected, subscribed to `{}`",
            broker.host, broker.port, self.topics.fan
        );
        self.state = ChannelState::Connected;
        Ok(())
    }

    /// Handles at most one buffered message. A fan command is applied to the
    /// switch before this returns.
    pub fn poll_inbound(&mut self) -> Result<PollOutcome, PollError> {
        if self.state != ChannelState::Connected {
            return Err(PollError::Unavailable(self.state));
        }

        let message = match self.transport.try_receive() {
            Ok(Some(message)) => message,
            Ok(None) => return Ok(PollOutcome::Idle),
            Err(err) => {
                self.state = ChannelState::Faulted;
                return Err(PollError::Transport(err));
            }
        };

        if message.topic != self.topics.fan {
            debug!("ignoring message on `{}`", message.topic);
            return Ok(PollOutcome::Ignored {
                topic: message.topic,
            });
        }

        if message.payload.len() > MAX_INBOUND_PAYLOAD_BYTES {
            warn!(
                "oversized fan command on `{}` ({} bytes), treating as off",
                message.topic,
                message.payload.len()
            );
            self.fan.set(false);
            return Ok(PollOutcome::FanCommand { on: false });
        }

        match std::str::from_utf8(&message.payload) {
            Ok(text) => {
                let on = decode_fan_command(text);
                self.fan.set(on);
                info!("fan toggle received: {}", text.to_uppercase());
                Ok(PollOutcome::FanCommand { on })
            }
            Err(_) => {
                self.fan.set(false);
                Err(PollError::InvalidPayload {
                    topic: message.topic,
                })
            }
        }
    }

    pub async fn publish(&mut self, topic: &str, payload: &str) -> Result<(), PublishError> {
        if self.state != ChannelState::Connected {
            return Err(PublishError::Unavailable(self.state));
        }

        if let Err(source) = self.transport.publish(topic, payload.as_bytes()).await {
            self.state = ChannelState::Faulted;
            return Err(PublishError::Transport {
                topic: topic.to_string(),
                source,
            });
        }

        debug!("published `{payload}` to `{topic}`");
        Ok(())
    }

    pub async fn publish_sample(&mut self, sample: &TelemetrySample) -> Result<(), PublishError> {
        let topic = self.topics.temperature.clone();
        self.publish(&topic, &sample.payload()).await
    }
}
