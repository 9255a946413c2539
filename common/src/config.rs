use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::topics::FeedTopics;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub wifi_ssid: String,
    pub wifi_pass: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: String,
    pub key: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "io.adafruit.com".to_string(),
            port: 1883,
            client_id: "fanctl-node".to_string(),
            username: String::new(),
            key: String::new(),
        }
    }
}

impl BrokerConfig {
    pub fn topics(&self) -> FeedTopics {
        FeedTopics::for_user(&self.username)
    }
}

/// Timing and retry budget of the supervisor, in milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoopPolicy {
    pub boot_settle_ms: u64,
    pub wifi_attempts: u32,
    pub wifi_retry_ms: u64,
    pub wifi_settle_ms: u64,
    pub grace_ms: u64,
    pub tick_interval_ms: u64,
    pub recovery_backoff_ms: u64,
    pub broker_connect_timeout_ms: u64,
    #[serde(default)]
    pub max_consecutive_tick_failures: Option<u32>,
}

impl Default for LoopPolicy {
    fn default() -> Self {
        Self {
            boot_settle_ms: 1_000,
            wifi_attempts: 15,
            wifi_retry_ms: 1_000,
            wifi_settle_ms: 1_000,
            grace_ms: 5_000,
            tick_interval_ms: 2_000,
            recovery_backoff_ms: 5_000,
            broker_connect_timeout_ms: 10_000,
            max_consecutive_tick_failures: None,
        }
    }
}

impl LoopPolicy {
    pub fn sanitize(&mut self) {
        self.wifi_attempts = self.wifi_attempts.clamp(1, 600);
        self.wifi_retry_ms = self.wifi_retry_ms.clamp(100, 60_000);
        self.tick_interval_ms = self.tick_interval_ms.clamp(100, 3_600_000);
        self.recovery_backoff_ms = self.recovery_backoff_ms.max(self.tick_interval_ms);
        self.broker_connect_timeout_ms = self.broker_connect_timeout_ms.clamp(1_000, 120_000);

        if self.max_consecutive_tick_failures == Some(0) {
            self.max_consecutive_tick_failures = None;
        }
    }

    pub fn boot_settle(&self) -> Duration {
        Duration::from_millis(self.boot_settle_ms)
    }

    pub fn wifi_retry_interval(&self) -> Duration {
        Duration::from_millis(self.wifi_retry_ms)
    }

    pub fn wifi_settle(&self) -> Duration {
        Duration::from_millis(self.wifi_settle_ms)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn recovery_backoff(&self) -> Duration {
        Duration::from_millis(self.recovery_backoff_ms)
    }

    pub fn broker_connect_timeout(&self) -> Duration {
        Duration::from_millis(self.broker_connect_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HardwareConfig {
    pub pwm_frequency_hz: u32,
    pub i2c_frequency_hz: u32,
    pub display_width: u32,
    pub display_height: u32,
    pub line_height: u32,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            pwm_frequency_hz: 1_000,
            i2c_frequency_hz: 400_000,
            display_width: 128,
            display_height: 64,
            line_height: 10,
        }
    }
}

impl HardwareConfig {
    pub fn sanitize(&mut self) {
        self.pwm_frequency_hz = self.pwm_frequency_hz.clamp(100, 40_000);
        self.i2c_frequency_hz = self.i2c_frequency_hz.clamp(10_000, 1_000_000);

        // Four text lines have to fit on the panel.
        if self.line_height == 0 || self.line_height.saturating_mul(4) > self.display_height {
            self.line_height = (self.display_height / 4).max(1);
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    pub network: NetworkConfig,
    pub broker: BrokerConfig,
    #[serde(default)]
    pub policy: LoopPolicy,
    #[serde(default)]
    pub hardware: HardwareConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.policy.sanitize();
        self.hardware.sanitize();
    }
}
