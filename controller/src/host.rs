use std::{
    io::ErrorKind,
    net::Ipv4Addr,
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
    time::Duration,
};

use anyhow::Context;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use tokio::{
    runtime::Runtime,
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use fanctl_common::{
    monotonic_ms, ActuatorBank, BrokerConfig, BrokerTransport, Components, ControlSupervisor,
    DisplayError, DisplayInitError, FatalError, HardwareError, InboundMessage, PanelFactory, Platform,
    PwmOutput, RuntimeConfig, StationError, TextPanel, TransportError, WifiStation,
    DISPLAY_LINES,
};

const INBOUND_QUEUE_DEPTH: usize = 32;

/// Runs the controller against a real broker with simulated board peripherals.
///
/// A fatal supervisor error or a panic in the control task stands in for a
/// device reset: everything is torn down and rebuilt from the same config.
pub fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = load_runtime_config().unwrap_or_else(|err| {
        warn!("failed to load runtime config: {err:#}");
        RuntimeConfig::default()
    });
    let config = apply_env_overrides(config);

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build control runtime")?;

    let association_polls = std::env::var("FANCTL_SIM_WIFI_POLLS")
        .ok()
        .and_then(|value| value.parse::<u32>().ok())
        .unwrap_or(2);
    let display_attached = std::env::var("FANCTL_DISPLAY").map_or(true, |value| value != "0");

    let mut boot: u64 = 0;
    loop {
        boot = boot.saturating_add(1);
        info!(
            "controller boot #{boot}, broker {}:{}",
            config.broker.host, config.broker.port
        );

        let components = Components {
            station: SimulatedStation::new(association_polls),
            transport: MqttTransport::new(config.policy.broker_connect_timeout()),
            actuators: ActuatorBank::new(
                LoggedPwm::new("fan"),
                LoggedPwm::new("red"),
                LoggedPwm::new("green"),
                LoggedPwm::new("blue"),
            ),
            panel: ConsolePanelFactory {
                attached: display_attached,
                line_height: config.hardware.line_height,
            },
        };
        let mut supervisor =
            ControlSupervisor::new(config.clone(), components, TokioPlatform::new());

        match run_until_reset(&runtime, &mut supervisor) {
            ResetCause::Fatal(err) => error!("controller stopped: {err}"),
            ResetCause::Crashed => error!("controller crashed"),
        }
        warn!("resetting controller");
    }
}

/// Why one boot of the control task ended.
#[derive(Debug)]
enum ResetCause {
    Fatal(FatalError),
    Crashed,
}

/// Drives one boot to its end. A panic anywhere in the control task is
/// caught here and reported on the display before the reset.
fn run_until_reset<W, T, P, F, C>(
    runtime: &Runtime,
    supervisor: &mut ControlSupervisor<W, T, P, F, C>,
) -> ResetCause
where
    W: WifiStation,
    T: BrokerTransport,
    P: PwmOutput,
    F: PanelFactory,
    C: Platform,
{
    let outcome = panic::catch_unwind(AssertUnwindSafe(|| runtime.block_on(supervisor.run())));
    match outcome {
        Ok(err) => ResetCause::Fatal(err),
        Err(_) => {
            runtime.block_on(supervisor.crash());
            ResetCause::Crashed
        }
    }
}

fn config_path() -> PathBuf {
    std::env::var("FANCTL_CONFIG")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.fanctl/runtime.json"))
}

fn load_runtime_config() -> anyhow::Result<RuntimeConfig> {
    let path = config_path();
    match std::fs::read(&path) {
        Ok(raw) => serde_json::from_slice::<RuntimeConfig>(&raw)
            .with_context(|| format!("invalid runtime config at {}", path.display())),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(RuntimeConfig::default()),
        Err(err) => Err(err.into()),
    }
}

fn apply_env_overrides(config: RuntimeConfig) -> RuntimeConfig {
    apply_overrides(config, |key| std::env::var(key).ok())
}

fn apply_overrides(
    mut config: RuntimeConfig,
    lookup: impl Fn(&str) -> Option<String>,
) -> RuntimeConfig {
    if let Some(ssid) = lookup("WIFI_SSID") {
        config.network.wifi_ssid = ssid;
    }
    if let Some(pass) = lookup("WIFI_PASS") {
        config.network.wifi_pass = pass;
    }
    if let Some(host) = lookup("MQTT_HOST") {
        config.broker.host = host;
    }
    if let Some(port) = lookup("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
        config.broker.port = port;
    }
    if let Some(client_id) = lookup("MQTT_CLIENT_ID") {
        config.broker.client_id = client_id;
    }
    if let Some(user) = lookup("MQTT_USER") {
        config.broker.username = user;
    }
    if let Some(key) = lookup("MQTT_PASS") {
        config.broker.key = key;
    }

    config.sanitize();
    config
}

/// Associates after a fixed number of polls and reports the loopback address.
struct SimulatedStation {
    associate_after: u32,
    polls: Option<u32>,
}

impl SimulatedStation {
    fn new(associate_after: u32) -> Self {
        Self {
            associate_after,
            polls: None,
        }
    }
}

impl WifiStation for SimulatedStation {
    fn disconnect(&mut self) -> Result<(), StationError> {
        self.polls = None;
        Ok(())
    }

    fn begin_association(&mut self, ssid: &str, _password: &str) -> Result<(), StationError> {
        info!("simulated station associating with `{ssid}`");
        self.polls = Some(0);
        Ok(())
    }

    fn poll_association(&mut self) -> Result<Option<Ipv4Addr>, StationError> {
        let Some(polls) = self.polls.as_mut() else {
            return Err(StationError::new("association was never started"));
        };
        *polls = polls.saturating_add(1);

        Ok((*polls >= self.associate_after).then_some(Ipv4Addr::LOCALHOST))
    }
}

struct MqttTransport {
    connect_timeout: Duration,
    client: Option<AsyncClient>,
    inbound: Option<mpsc::Receiver<Result<InboundMessage, TransportError>>>,
    pump: Option<JoinHandle<()>>,
}

impl MqttTransport {
    fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            client: None,
            inbound: None,
            pump: None,
        }
    }

    fn client(&self) -> Result<&AsyncClient, TransportError> {
        self.client
            .as_ref()
            .ok_or_else(|| TransportError::new("mqtt client is not connected"))
    }

    fn shutdown(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
        self.client = None;
        self.inbound = None;
    }
}

impl Drop for MqttTransport {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl BrokerTransport for MqttTransport {
    async fn connect(&mut self, broker: &BrokerConfig) -> Result<(), TransportError> {
        self.shutdown();

        let mut options =
            MqttOptions::new(broker.client_id.clone(), broker.host.clone(), broker.port);
        options.set_keep_alive(Duration::from_secs(30));
        options.set_clean_session(true);
        if !broker.username.is_empty() {
            options.set_credentials(broker.username.clone(), broker.key.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(options, 64);

        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => return Ok(()),
                    Ok(_) => {}
                    Err(err) => return Err(TransportError::new(err.to_string())),
                }
            }
        };
        tokio::time::timeout(self.connect_timeout, handshake)
            .await
            .map_err(|_| {
                TransportError::new(format!(
                    "no CONNACK from {}:{} within {:?}",
                    broker.host, broker.port, self.connect_timeout
                ))
            })??;

        let (tx, rx) = mpsc::channel(INBOUND_QUEUE_DEPTH);
        self.pump = Some(spawn_mqtt_pump(eventloop, tx));
        self.inbound = Some(rx);
        self.client = Some(client);
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client()?
            .subscribe(topic, QoS::AtMostOnce)
            .await
            .map_err(|err| TransportError::new(err.to_string()))
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.client()?
            .publish(topic, QoS::AtMostOnce, false, payload.to_vec())
            .await
            .map_err(|err| TransportError::new(err.to_string()))
    }

    fn try_receive(&mut self) -> Result<Option<InboundMessage>, TransportError> {
        let inbound = self
            .inbound
            .as_mut()
            .ok_or_else(|| TransportError::new("mqtt client is not connected"))?;

        match inbound.try_recv() {
            Ok(message) => message.map(Some),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => {
                Err(TransportError::new("mqtt event loop stopped"))
            }
        }
    }
}

/// Drives the rumqttc event loop and queues inbound publishes until the
/// control task polls for them. The first connection error ends the pump.
fn spawn_mqtt_pump(
    mut eventloop: EventLoop,
    tx: mpsc::Sender<Result<InboundMessage, TransportError>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    let inbound = InboundMessage {
                        topic: message.topic,
                        payload: message.payload.to_vec(),
                    };
                    match tx.try_send(Ok(inbound)) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            warn!("inbound mqtt queue full, dropping message");
                        }
                        Err(TrySendError::Closed(_)) => return,
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    let _ = tx.send(Err(TransportError::new(err.to_string()))).await;
                    return;
                }
            }
        }
    })
}

struct LoggedPwm {
    channel: &'static str,
    duty: Option<u16>,
}

impl LoggedPwm {
    fn new(channel: &'static str) -> Self {
        Self {
            channel,
            duty: None,
        }
    }
}

impl PwmOutput for LoggedPwm {
    fn set_duty_u16(&mut self, duty: u16) -> Result<(), HardwareError> {
        if self.duty != Some(duty) {
            debug!("pwm {} duty {duty}", self.channel);
            self.duty = Some(duty);
        }
        Ok(())
    }
}

struct ConsolePanelFactory {
    attached: bool,
    line_height: u32,
}

impl PanelFactory for ConsolePanelFactory {
    type Panel = ConsolePanel;

    fn init(&mut self) -> Result<ConsolePanel, DisplayInitError> {
        if !self.attached {
            return Err(DisplayInitError::new("console display disabled"));
        }
        Ok(ConsolePanel::new(self.line_height))
    }
}

/// Text grid that logs its contents on every flush.
struct ConsolePanel {
    line_height: u32,
    lines: [String; DISPLAY_LINES],
}

impl ConsolePanel {
    fn new(line_height: u32) -> Self {
        Self {
            line_height: line_height.max(1),
            lines: Default::default(),
        }
    }

    fn line_at(&self, top: u32) -> Result<usize, DisplayError> {
        let line = (top / self.line_height) as usize;
        if line >= DISPLAY_LINES {
            return Err(DisplayError::new(format!("row {top} is off the panel")));
        }
        Ok(line)
    }
}

impl TextPanel for ConsolePanel {
    fn clear(&mut self) -> Result<(), DisplayError> {
        self.lines.iter_mut().for_each(String::clear);
        Ok(())
    }

    fn clear_band(&mut self, top: u32, height: u32) -> Result<(), DisplayError> {
        let first = self.line_at(top)?;
        let last = ((top + height.max(1) - 1) / self.line_height) as usize;
        for line in first..=last.min(DISPLAY_LINES - 1) {
            self.lines[line].clear();
        }
        Ok(())
    }

    fn draw_text(&mut self, text: &str, top: u32) -> Result<(), DisplayError> {
        let line = self.line_at(top)?;
        self.lines[line] = text.to_string();
        Ok(())
    }

    fn flush(&mut self) -> Result<(), DisplayError> {
        info!(
            "display [{}] [{}] [{}] [{}]",
            self.lines[0], self.lines[1], self.lines[2], self.lines[3]
        );
        Ok(())
    }
}

struct TokioPlatform {
    booted_at_ms: u64,
}

impl TokioPlatform {
    fn new() -> Self {
        Self {
            booted_at_ms: monotonic_ms(),
        }
    }
}

impl Platform for TokioPlatform {
    async fn sleep(&mut self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn uptime_ms(&self) -> u64 {
        monotonic_ms().saturating_sub(self.booted_at_ms)
    }
}
