use core::convert::TryInto;
use std::{
    net::Ipv4Addr,
    panic::{self, AssertUnwindSafe},
    sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError},
    thread,
    time::Duration,
};

use anyhow::{anyhow, Context};
use embedded_graphics::{
    mono_font::{ascii::FONT_6X10, MonoTextStyle},
    pixelcolor::BinaryColor,
    prelude::*,
    primitives::{PrimitiveStyle, Rectangle},
    text::{Baseline, Text},
};
use embedded_svc::{
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::{
    i2c::{I2cConfig, I2cDriver},
    ledc::{config::TimerConfig, LedcDriver, LedcTimerDriver},
    prelude::*,
    task::block_on,
};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::EspDefaultNvsPartition,
    sys::EspError,
    wifi::EspWifi,
};
use log::{error, info, warn};
use ssd1306::{mode::BufferedGraphicsMode, prelude::*, I2CDisplayInterface, Ssd1306};

use fanctl_common::{
    monotonic_ms, ActuatorBank, BrokerConfig, BrokerTransport, Components, ControlSupervisor,
    DisplayError, DisplayInitError, HardwareConfig, HardwareError, InboundMessage, PanelFactory,
    Platform, PwmOutput, RuntimeConfig, StationError, TextPanel, TransportError, WifiStation,
};

const CREDENTIAL_PLACEHOLDER: &str = "CHANGE_ME";
const WATCHDOG_TIMEOUT_SEC: u32 = 90;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let config = board_config();
    info!(
        "fan controller starting: ssid=`{}`, broker=`{}:{}`, feeds for `{}`",
        config.network.wifi_ssid,
        config.broker.host,
        config.broker.port,
        config.broker.username,
    );

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let Peripherals {
        modem,
        ledc,
        i2c0,
        pins,
        ..
    } = Peripherals::take()?;

    let wifi = EspWifi::new(modem, sys_loop, Some(nvs_partition)).context("wifi init failed")?;

    let timer = LedcTimerDriver::new(
        ledc.timer0,
        &TimerConfig::default().frequency(config.hardware.pwm_frequency_hz.Hz().into()),
    )
    .context("LEDC timer init failed")?;
    // Shared by all four channels for the life of the program.
    let timer: &'static LedcTimerDriver<'static, _> = Box::leak(Box::new(timer));
    let actuators = ActuatorBank::new(
        LedcPwm::new(LedcDriver::new(ledc.channel0, timer, pins.gpio16)?),
        LedcPwm::new(LedcDriver::new(ledc.channel1, timer, pins.gpio17)?),
        LedcPwm::new(LedcDriver::new(ledc.channel2, timer, pins.gpio18)?),
        LedcPwm::new(LedcDriver::new(ledc.channel3, timer, pins.gpio19)?),
    );
    info!(
        "PWM ready at {}Hz: fan=GPIO16, rgb=GPIO17/18/19",
        config.hardware.pwm_frequency_hz
    );

    let i2c = match I2cDriver::new(
        i2c0,
        pins.gpio4,
        pins.gpio5,
        &I2cConfig::new().baudrate(config.hardware.i2c_frequency_hz.Hz().into()),
    ) {
        Ok(i2c) => Some(i2c),
        Err(err) => {
            warn!("I2C bus init failed, running without display: {err}");
            None
        }
    };
    let panel = OledPanelFactory {
        i2c,
        hardware: config.hardware.clone(),
    };

    if let Err(err) =
        init_watchdog(WATCHDOG_TIMEOUT_SEC).and_then(|()| add_current_task_to_watchdog())
    {
        warn!("task watchdog unavailable: {err:#}");
    }

    let components = Components {
        station: EspStation { wifi },
        transport: EspMqttTransport::new(config.policy.broker_connect_timeout()),
        actuators,
        panel,
    };
    let mut supervisor = ControlSupervisor::new(config, components, EspPlatform);

    match panic::catch_unwind(AssertUnwindSafe(|| block_on(supervisor.run()))) {
        Ok(err) => error!("controller stopped: {err}"),
        Err(_) => block_on(supervisor.crash()),
    }

    restart()
}

/// Credentials are baked in at build time from the environment.
fn board_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.network.wifi_ssid = option_env!("WIFI_SSID")
        .unwrap_or(CREDENTIAL_PLACEHOLDER)
        .to_string();
    config.network.wifi_pass = option_env!("WIFI_PASS")
        .unwrap_or(CREDENTIAL_PLACEHOLDER)
        .to_string();
    config.broker.username = option_env!("MQTT_USER")
        .unwrap_or(CREDENTIAL_PLACEHOLDER)
        .to_string();
    config.broker.key = option_env!("MQTT_PASS")
        .unwrap_or(CREDENTIAL_PLACEHOLDER)
        .to_string();
    if let Some(host) = option_env!("MQTT_HOST") {
        config.broker.host = host.to_string();
    }
    if let Some(port) = option_env!("MQTT_PORT").and_then(|value| value.parse::<u16>().ok()) {
        config.broker.port = port;
    }
    if let Some(client_id) = option_env!("MQTT_CLIENT_ID") {
        config.broker.client_id = client_id.to_string();
    }

    if config.network.wifi_ssid == CREDENTIAL_PLACEHOLDER
        || config.broker.username == CREDENTIAL_PLACEHOLDER
    {
        warn!("firmware built without credentials; set WIFI_SSID/WIFI_PASS/MQTT_USER/MQTT_PASS");
    }

    config.sanitize();
    config
}

#[allow(unreachable_code)]
fn restart() -> ! {
    warn!("restarting device");
    unsafe { esp_idf_svc::sys::esp_restart() };
    loop {
        thread::sleep(Duration::from_secs(1));
    }
}

fn station_error(err: EspError) -> StationError {
    StationError::new(err.to_string())
}

struct EspStation {
    wifi: EspWifi<'static>,
}

impl WifiStation for EspStation {
    fn disconnect(&mut self) -> Result<(), StationError> {
        if self.wifi.is_started().map_err(station_error)? {
            self.wifi.disconnect().map_err(station_error)?;
        }
        Ok(())
    }

    fn begin_association(&mut self, ssid: &str, password: &str) -> Result<(), StationError> {
        let auth_method = if password.is_empty() {
            AuthMethod::None
        } else {
            AuthMethod::WPAWPA2Personal
        };

        self.wifi
            .set_configuration(&Configuration::Client(ClientConfiguration {
                ssid: ssid
                    .try_into()
                    .map_err(|_| StationError::new("wifi ssid too long"))?,
                password: password
                    .try_into()
                    .map_err(|_| StationError::new("wifi password too long"))?,
                auth_method,
                ..Default::default()
            }))
            .map_err(station_error)?;

        if !self.wifi.is_started().map_err(station_error)? {
            self.wifi.start().map_err(station_error)?;
        }
        self.wifi.connect().map_err(station_error)
    }

    fn poll_association(&mut self) -> Result<Option<Ipv4Addr>, StationError> {
        if !self.wifi.is_connected().map_err(station_error)? {
            return Ok(None);
        }

        let netif = self.wifi.sta_netif();
        if !netif.is_up().map_err(station_error)? {
            return Ok(None);
        }

        let ip = netif.get_ip_info().map_err(station_error)?.ip;
        Ok((!ip.is_unspecified()).then_some(ip))
    }
}

enum MqttEvent {
    Connected,
    Message(InboundMessage),
    Failed(String),
}

struct EspMqttTransport {
    connect_timeout: Duration,
    client: Option<EspMqttClient<'static>>,
    events: Option<Receiver<MqttEvent>>,
}

impl EspMqttTransport {
    fn new(connect_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            client: None,
            events: None,
        }
    }

    fn client(&mut self) -> Result<&mut EspMqttClient<'static>, TransportError> {
        self.client
            .as_mut()
            .ok_or_else(|| TransportError::new("mqtt client is not connected"))
    }
}

impl BrokerTransport for EspMqttTransport {
    async fn connect(&mut self, broker: &BrokerConfig) -> Result<(), TransportError> {
        self.client = None;
        self.events = None;

        let url = format!("mqtt://{}:{}", broker.host, broker.port);
        let conf = MqttClientConfiguration {
            client_id: Some(broker.client_id.as_str()),
            username: (!broker.username.is_empty()).then_some(broker.username.as_str()),
            password: (!broker.key.is_empty()).then_some(broker.key.as_str()),
            keep_alive_interval: Some(Duration::from_secs(30)),
            ..Default::default()
        };
        let (client, conn) = EspMqttClient::new(url.as_str(), &conf)
            .map_err(|err| TransportError::new(err.to_string()))?;

        let (tx, rx) = mpsc::channel();
        spawn_mqtt_receiver(conn, tx)?;

        loop {
            match rx.recv_timeout(self.connect_timeout) {
                Ok(MqttEvent::Connected) => break,
                Ok(MqttEvent::Message(_)) => {}
                Ok(MqttEvent::Failed(reason)) => return Err(TransportError::new(reason)),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(TransportError::new(format!(
                        "no connection to {url} within {:?}",
                        self.connect_timeout
                    )))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(TransportError::new("mqtt receiver stopped"))
                }
            }
        }

        self.client = Some(client);
        self.events = Some(rx);
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.client()?
            .subscribe(topic, QoS::AtMostOnce)
            .map(|_| ())
            .map_err(|err| TransportError::new(err.to_string()))
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        self.client()?
            .publish(topic, QoS::AtMostOnce, false, payload)
            .map(|_| ())
            .map_err(|err| TransportError::new(err.to_string()))
    }

    fn try_receive(&mut self) -> Result<Option<InboundMessage>, TransportError> {
        let events = self
            .events
            .as_ref()
            .ok_or_else(|| TransportError::new("mqtt client is not connected"))?;

        loop {
            match events.try_recv() {
                Ok(MqttEvent::Message(message)) => return Ok(Some(message)),
                Ok(MqttEvent::Connected) => {}
                Ok(MqttEvent::Failed(reason)) => return Err(TransportError::new(reason)),
                Err(TryRecvError::Empty) => return Ok(None),
                Err(TryRecvError::Disconnected) => {
                    return Err(TransportError::new("mqtt receiver stopped"))
                }
            }
        }
    }
}

/// Forwards connection events until the connection fails or nobody listens.
fn spawn_mqtt_receiver(
    mut conn: EspMqttConnection,
    tx: Sender<MqttEvent>,
) -> Result<(), TransportError> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(8 * 1024)
        .spawn(move || loop {
            let forwarded = match conn.next() {
                Ok(event) => match event.payload() {
                    EventPayload::Connected(_) => tx.send(MqttEvent::Connected),
                    EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } => {
                        if !matches!(details, Details::Complete) {
                            continue;
                        }
                        tx.send(MqttEvent::Message(InboundMessage {
                            topic: topic.to_string(),
                            payload: data.to_vec(),
                        }))
                    }
                    EventPayload::Disconnected => {
                        let _ = tx.send(MqttEvent::Failed("broker disconnected".into()));
                        return;
                    }
                    _ => Ok(()),
                },
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    let _ = tx.send(MqttEvent::Failed(err.to_string()));
                    return;
                }
            };

            if forwarded.is_err() {
                return;
            }
        })
        .map(|_| ())
        .map_err(|err| TransportError::new(format!("failed to spawn mqtt receiver: {err}")))
}

struct LedcPwm {
    driver: LedcDriver<'static>,
    max_duty: u32,
}

impl LedcPwm {
    fn new(driver: LedcDriver<'static>) -> Self {
        let max_duty = driver.get_max_duty();
        Self { driver, max_duty }
    }
}

impl PwmOutput for LedcPwm {
    fn set_duty_u16(&mut self, duty: u16) -> Result<(), HardwareError> {
        let scaled = u64::from(duty) * u64::from(self.max_duty) / u64::from(u16::MAX);
        self.driver
            .set_duty(scaled as u32)
            .map_err(|err| HardwareError::new(err.to_string()))
    }
}

type Oled = Ssd1306<
    I2CInterface<I2cDriver<'static>>,
    DisplaySize128x64,
    BufferedGraphicsMode<DisplaySize128x64>,
>;

struct OledPanelFactory {
    i2c: Option<I2cDriver<'static>>,
    hardware: HardwareConfig,
}

impl PanelFactory for OledPanelFactory {
    type Panel = OledPanel;

    fn init(&mut self) -> Result<OledPanel, DisplayInitError> {
        let i2c = self
            .i2c
            .take()
            .ok_or_else(|| DisplayInitError::new("I2C bus unavailable"))?;

        let mut display = Ssd1306::new(
            I2CDisplayInterface::new(i2c),
            DisplaySize128x64,
            DisplayRotation::Rotate0,
        )
        .into_buffered_graphics_mode();
        display
            .init()
            .map_err(|err| DisplayInitError::new(format!("ssd1306 init failed: {err:?}")))?;

        Ok(OledPanel {
            display,
            width: self.hardware.display_width,
            style: MonoTextStyle::new(&FONT_6X10, BinaryColor::On),
        })
    }
}

struct OledPanel {
    display: Oled,
    width: u32,
    style: MonoTextStyle<'static, BinaryColor>,
}

fn display_error(err: impl core::fmt::Debug) -> DisplayError {
    DisplayError::new(format!("{err:?}"))
}

impl TextPanel for OledPanel {
    fn clear(&mut self) -> Result<(), DisplayError> {
        self.display.clear_buffer();
        Ok(())
    }

    fn clear_band(&mut self, top: u32, height: u32) -> Result<(), DisplayError> {
        Rectangle::new(Point::new(0, top as i32), Size::new(self.width, height))
            .into_styled(PrimitiveStyle::with_fill(BinaryColor::Off))
            .draw(&mut self.display)
            .map_err(display_error)
    }

    fn draw_text(&mut self, text: &str, top: u32) -> Result<(), DisplayError> {
        Text::with_baseline(text, Point::new(0, top as i32), self.style, Baseline::Top)
            .draw(&mut self.display)
            .map(|_| ())
            .map_err(display_error)
    }

    fn flush(&mut self) -> Result<(), DisplayError> {
        self.display.flush().map_err(display_error)
    }
}

struct EspPlatform;

impl Platform for EspPlatform {
    async fn sleep(&mut self, duration: Duration) {
        feed_watchdog();
        thread::sleep(duration);
    }

    fn uptime_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn heartbeat(&mut self) {
        feed_watchdog();
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = esp_idf_svc::sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_init(&config) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { esp_idf_svc::sys::esp_task_wdt_add(core::ptr::null_mut()) };
    if rc == esp_idf_svc::sys::ESP_OK || rc == esp_idf_svc::sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { esp_idf_svc::sys::esp_task_wdt_reset() };
}
