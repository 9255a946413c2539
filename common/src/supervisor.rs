use std::net::Ipv4Addr;

use log::{error, info, warn};

use crate::{
    actuator::{ActuatorBank, ActuatorOutputs, PwmOutput},
    config::RuntimeConfig,
    display::{DisplayFrame, DisplaySurface, PanelFactory},
    error::{FatalError, TickError},
    network::{NetworkSession, RetryPolicy, WifiStation},
    platform::Platform,
    telemetry::{BrokerTransport, PollOutcome, TelemetryChannel},
    types::{FanSwitch, SupervisorState, TelemetrySample},
};

/// Result of one successful tick.
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub inbound: PollOutcome,
    pub fan_on: bool,
    pub outputs: ActuatorOutputs,
    pub sample: TelemetrySample,
}

#[derive(Debug)]
pub enum StepOutcome {
    Ticked(TickReport),
    Recovered(TickError),
}

/// Hardware and services the supervisor is built from.
pub struct Components<W, T, P, F> {
    pub station: W,
    pub transport: T,
    pub actuators: ActuatorBank<P>,
    pub panel: F,
}

/// The control task: boot sequence, then the tick loop with recovery.
///
/// Boot-phase connectivity failures are fatal and hand a [`FatalError`] back to
/// the caller, who resets the device. Tick failures never leave the loop
/// unless an escalation limit is configured.
pub struct ControlSupervisor<W, T, P, F, C>
where
    F: PanelFactory,
{
    config: RuntimeConfig,
    network: NetworkSession<W>,
    telemetry: TelemetryChannel<T>,
    actuators: ActuatorBank<P>,
    display: DisplaySurface<F>,
    platform: C,
    fan: FanSwitch,
    state: SupervisorState,
    consecutive_failures: u32,
}

impl<W, T, P, F, C> ControlSupervisor<W, T, P, F, C>
where
    W: WifiStation,
    T: BrokerTransport,
    P: PwmOutput,
    F: PanelFactory,
    C: Platform,
{
    pub fn new(mut config: RuntimeConfig, components: Components<W, T, P, F>, platform: C) -> Self {
        config.sanitize();

        let fan = FanSwitch::default();
        let telemetry = TelemetryChannel::new(
            components.transport,
            config.broker.topics(),
            fan.clone(),
        );
        let display = DisplaySurface::new(components.panel, config.hardware.line_height);

        Self {
            network: NetworkSession::new(components.station),
            telemetry,
            actuators: components.actuators,
            display,
            platform,
            fan,
            state: SupervisorState::Booting,
            consecutive_failures: 0,
            config,
        }
    }

    pub fn state(&self) -> SupervisorState {
        self.state
    }

    pub fn fan_on(&self) -> bool {
        self.fan.is_on()
    }

    pub fn telemetry(&self) -> &TelemetryChannel<T> {
        &self.telemetry
    }

    /// Boots, then ticks until something fatal happens.
    pub async fn run(&mut self) -> FatalError {
        if let Err(err) = self.boot().await {
            return err;
        }

        loop {
            if let Err(err) = self.step().await {
                return err;
            }
        }
    }

    pub async fn boot(&mut self) -> Result<Ipv4Addr, FatalError> {
        self.state = SupervisorState::Booting;
        if let Err(err) = self.actuators.neutral() {
            warn!("failed to drive boot indicator pattern: {err}");
        }
        self.display.init();
        self.platform.sleep(self.config.policy.boot_settle()).await;

        self.transition(SupervisorState::AwaitingNetwork);
        let retry = RetryPolicy {
            max_attempts: self.config.policy.wifi_attempts,
            retry_interval: self.config.policy.wifi_retry_interval(),
            settle: self.config.policy.wifi_settle(),
        };
        let display = &mut self.display;
        let connected = self
            .network
            .connect(
                &mut self.platform,
                &self.config.network.wifi_ssid,
                &self.config.network.wifi_pass,
                retry,
                || display.write_line(0, "Connecting WiFi"),
            )
            .await;
        let address = match connected {
            Ok(address) => address,
            Err(err) => {
                error!("wifi bring-up failed: {err}");
                self.display.write_line(1, "WiFi Failed");
                self.display.write_line(0, "WiFi Fail");
                self.platform.sleep(self.config.policy.grace()).await;
                return Err(FatalError::Network(err));
            }
        };
        self.display.write_line(1, &format!("IP: {address}"));

        self.transition(SupervisorState::AwaitingTelemetry);
        if let Err(err) = self.telemetry.connect(&self.config.broker).await {
            error!("broker bring-up failed: {err}");
            self.display.write_line(2, "MQTT Fail");
            self.platform.sleep(self.config.policy.grace()).await;
            return Err(FatalError::Broker(err));
        }
        self.display.write_line(2, "MQTT OK");

        self.transition(SupervisorState::Running);
        Ok(address)
    }

    /// One pass of the running loop without the inter-tick wait.
    ///
    /// Stages run in order and the first failing stage ends the tick. The
    /// display stage cannot fail, so publish is always reached once the poll
    /// and actuator stages succeed.
    pub async fn tick(&mut self) -> Result<TickReport, TickError> {
        let inbound = self.telemetry.poll_inbound()?;
        let fan_on = self.fan.is_on();

        let sample = TelemetrySample::simulated(self.platform.uptime_ms());

        // The toggle is the only input; the temperature does not steer the fan.
        let outputs = self.actuators.apply(fan_on)?;

        self.display.render(&DisplayFrame::for_tick(&sample, fan_on));

        self.telemetry.publish_sample(&sample).await?;

        Ok(TickReport {
            inbound,
            fan_on,
            outputs,
            sample,
        })
    }

    /// A tick followed by its wait: the regular interval, or the recovery
    /// backoff when the tick failed.
    pub async fn step(&mut self) -> Result<StepOutcome, FatalError> {
        self.platform.heartbeat();

        match self.tick().await {
            Ok(report) => {
                self.consecutive_failures = 0;
                self.platform.sleep(self.config.policy.tick_interval()).await;
                Ok(StepOutcome::Ticked(report))
            }
            Err(err) => {
                warn!("loop error: {err}");
                self.transition(SupervisorState::Recovering);
                self.consecutive_failures = self.consecutive_failures.saturating_add(1);
                self.display.write_line(0, "Error");
                self.platform
                    .sleep(self.config.policy.recovery_backoff())
                    .await;

                if let Some(limit) = self.config.policy.max_consecutive_tick_failures {
                    if self.consecutive_failures >= limit {
                        error!("{} consecutive ticks failed, giving up", self.consecutive_failures);
                        return Err(FatalError::TickFailures {
                            failures: self.consecutive_failures,
                            last: err,
                        });
                    }
                }

                self.transition(SupervisorState::Running);
                Ok(StepOutcome::Recovered(err))
            }
        }
    }

    /// Last stop before a reset when the control task died unexpectedly.
    pub async fn crash(&mut self) {
        error!("control task crashed in state {}", self.state.as_str());
        self.display.write_line(0, "Crash");
        self.platform.sleep(self.config.policy.grace()).await;
    }

    fn transition(&mut self, next: SupervisorState) {
        if self.state != next {
            info!("supervisor {} -> {}", self.state.as_str(), next.as_str());
            self.state = next;
        }
    }
}
