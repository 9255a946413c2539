//! In-memory stand-ins for every hardware seam.

use std::{cell::RefCell, collections::VecDeque, net::Ipv4Addr, rc::Rc, time::Duration};

use crate::{
    actuator::PwmOutput,
    config::BrokerConfig,
    display::{PanelFactory, TextPanel},
    error::{DisplayError, DisplayInitError, HardwareError, StationError, TransportError},
    network::WifiStation,
    platform::Platform,
    telemetry::{BrokerTransport, InboundMessage},
};

#[derive(Debug, Default)]
struct PwmRecord {
    duty: Option<u16>,
    fail_next: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingPwm {
    record: Rc<RefCell<PwmRecord>>,
}

impl RecordingPwm {
    pub fn duty(&self) -> Option<u16> {
        self.record.borrow().duty
    }

    pub fn fail_next(&self, message: &str) {
        self.record.borrow_mut().fail_next = Some(message.to_string());
    }
}

impl PwmOutput for RecordingPwm {
    fn set_duty_u16(&mut self, duty: u16) -> Result<(), HardwareError> {
        let mut record = self.record.borrow_mut();
        if let Some(message) = record.fail_next.take() {
            return Err(HardwareError::new(message));
        }
        record.duty = Some(duty);
        Ok(())
    }
}

#[derive(Debug, Default)]
struct StationRecord {
    calls: Vec<String>,
    polls: u32,
}

#[derive(Debug, Clone)]
pub struct StationLog {
    record: Rc<RefCell<StationRecord>>,
}

impl StationLog {
    pub fn polls(&self) -> u32 {
        self.record.borrow().polls
    }

    pub fn calls(&self) -> Vec<String> {
        self.record.borrow().calls.clone()
    }
}

/// Associates on a fixed poll number, or never.
pub struct ScriptedStation {
    associate_on_poll: Option<(u32, Ipv4Addr)>,
    poll_errors: u32,
    reject: Option<String>,
    record: Rc<RefCell<StationRecord>>,
}

impl ScriptedStation {
    pub fn never() -> Self {
        Self {
            associate_on_poll: None,
            poll_errors: 0,
            reject: None,
            record: Rc::default(),
        }
    }

    pub fn after_polls(polls: u32, address: Ipv4Addr) -> Self {
        Self {
            associate_on_poll: Some((polls, address)),
            ..Self::never()
        }
    }

    /// The first `count` polls report a driver error.
    pub fn with_poll_errors(mut self, count: u32) -> Self {
        self.poll_errors = count;
        self
    }

    pub fn rejecting(mut self, message: &str) -> Self {
        self.reject = Some(message.to_string());
        self
    }

    pub fn log(&self) -> StationLog {
        StationLog {
            record: self.record.clone(),
        }
    }
}

impl WifiStation for ScriptedStation {
    fn disconnect(&mut self) -> Result<(), StationError> {
        self.record.borrow_mut().calls.push("disconnect".into());
        Ok(())
    }

    fn begin_association(&mut self, ssid: &str, _password: &str) -> Result<(), StationError> {
        self.record
            .borrow_mut()
            .calls
            .push(format!("associate {ssid}"));
        match &self.reject {
            Some(message) => Err(StationError::new(message.clone())),
            None => Ok(()),
        }
    }

    fn poll_association(&mut self) -> Result<Option<Ipv4Addr>, StationError> {
        let mut record = self.record.borrow_mut();
        record.calls.push("poll".into());
        record.polls += 1;

        if record.polls <= self.poll_errors {
            return Err(StationError::new("association status unavailable"));
        }

        Ok(match self.associate_on_poll {
            Some((polls, address)) if record.polls >= polls => Some(address),
            _ => None,
        })
    }
}

#[derive(Debug, Default)]
struct TransportRecord {
    connects: u32,
    subscriptions: Vec<String>,
    inbound: VecDeque<InboundMessage>,
    receive_error: Option<String>,
    publish_error: Option<String>,
    publish_attempts: u32,
    published: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct BrokerLog {
    record: Rc<RefCell<TransportRecord>>,
}

impl BrokerLog {
    pub fn push_inbound(&self, topic: &str, payload: &[u8]) {
        self.record.borrow_mut().inbound.push_back(InboundMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
    }

    /// The next receive fails once.
    pub fn fail_receive(&self, message: &str) {
        self.record.borrow_mut().receive_error = Some(message.to_string());
    }

    /// Every publish from now on fails.
    pub fn fail_publish(&self, message: &str) {
        self.record.borrow_mut().publish_error = Some(message.to_string());
    }

    pub fn connects(&self) -> u32 {
        self.record.borrow().connects
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.record.borrow().subscriptions.clone()
    }

    pub fn publish_attempts(&self) -> u32 {
        self.record.borrow().publish_attempts
    }

    pub fn published(&self) -> Vec<(String, String)> {
        self.record.borrow().published.clone()
    }
}

#[derive(Debug, Default)]
pub struct ScriptedTransport {
    refuse_connect: Option<String>,
    refuse_subscribe: Option<String>,
    record: Rc<RefCell<TransportRecord>>,
}

impl ScriptedTransport {
    pub fn refusing_connect(mut self, message: &str) -> Self {
        self.refuse_connect = Some(message.to_string());
        self
    }

    pub fn refusing_subscribe(mut self, message: &str) -> Self {
        self.refuse_subscribe = Some(message.to_string());
        self
    }

    pub fn log(&self) -> BrokerLog {
        BrokerLog {
            record: self.record.clone(),
        }
    }
}

impl BrokerTransport for ScriptedTransport {
    async fn connect(&mut self, _broker: &BrokerConfig) -> Result<(), TransportError> {
        self.record.borrow_mut().connects += 1;
        match &self.refuse_connect {
            Some(message) => Err(TransportError::new(message.clone())),
            None => Ok(()),
        }
    }

    async fn subscribe(&mut self, topic: &str) -> Result<(), TransportError> {
        self.record
            .borrow_mut()
            .subscriptions
            .push(topic.to_string());
        match &self.refuse_subscribe {
            Some(message) => Err(TransportError::new(message.clone())),
            None => Ok(()),
        }
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), TransportError> {
        let mut record = self.record.borrow_mut();
        record.publish_attempts += 1;
        if let Some(message) = &record.publish_error {
            return Err(TransportError::new(message.clone()));
        }
        record.published.push((
            topic.to_string(),
            String::from_utf8_lossy(payload).into_owned(),
        ));
        Ok(())
    }

    fn try_receive(&mut self) -> Result<Option<InboundMessage>, TransportError> {
        let mut record = self.record.borrow_mut();
        if let Some(message) = record.receive_error.take() {
            return Err(TransportError::new(message));
        }
        Ok(record.inbound.pop_front())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PanelOp {
    Clear,
    ClearBand(u32, u32),
    Text(String, u32),
    Flush,
}

#[derive(Debug, Default)]
struct PanelRecord {
    init_attempts: u32,
    ops: Vec<PanelOp>,
    draw_error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct PanelLog {
    record: Rc<RefCell<PanelRecord>>,
}

impl PanelLog {
    pub fn init_attempts(&self) -> u32 {
        self.record.borrow().init_attempts
    }

    pub fn ops(&self) -> Vec<PanelOp> {
        self.record.borrow().ops.clone()
    }

    /// Every panel operation from now on fails.
    pub fn fail_draws(&self, message: &str) {
        self.record.borrow_mut().draw_error = Some(message.to_string());
    }

    /// Latest text drawn on `line`, assuming 10-pixel lines.
    pub fn line_text(&self, line: u32) -> Option<String> {
        self.record
            .borrow()
            .ops
            .iter()
            .rev()
            .find_map(|op| match op {
                PanelOp::Text(text, top) if *top == line * 10 => Some(text.clone()),
                _ => None,
            })
    }
}

pub struct RecordingPanel {
    record: Rc<RefCell<PanelRecord>>,
}

impl RecordingPanel {
    fn push(&mut self, op: PanelOp) -> Result<(), DisplayError> {
        let mut record = self.record.borrow_mut();
        if let Some(message) = &record.draw_error {
            return Err(DisplayError::new(message.clone()));
        }
        record.ops.push(op);
        Ok(())
    }
}

impl TextPanel for RecordingPanel {
    fn clear(&mut self) -> Result<(), DisplayError> {
        self.push(PanelOp::Clear)
    }

    fn clear_band(&mut self, top: u32, height: u32) -> Result<(), DisplayError> {
        self.push(PanelOp::ClearBand(top, height))
    }

    fn draw_text(&mut self, text: &str, top: u32) -> Result<(), DisplayError> {
        self.push(PanelOp::Text(text.to_string(), top))
    }

    fn flush(&mut self) -> Result<(), DisplayError> {
        self.push(PanelOp::Flush)
    }
}

pub struct RecordingPanelFactory {
    present: bool,
    record: Rc<RefCell<PanelRecord>>,
}

impl RecordingPanelFactory {
    pub fn working() -> Self {
        Self {
            present: true,
            record: Rc::default(),
        }
    }

    pub fn missing() -> Self {
        Self {
            present: false,
            record: Rc::default(),
        }
    }

    pub fn log(&self) -> PanelLog {
        PanelLog {
            record: self.record.clone(),
        }
    }
}

impl PanelFactory for RecordingPanelFactory {
    type Panel = RecordingPanel;

    fn init(&mut self) -> Result<RecordingPanel, DisplayInitError> {
        self.record.borrow_mut().init_attempts += 1;
        if !self.present {
            return Err(DisplayInitError::new("no device at 0x3c"));
        }
        Ok(RecordingPanel {
            record: self.record.clone(),
        })
    }
}

#[derive(Debug, Default)]
struct Timeline {
    uptime_ms: u64,
    sleeps: Vec<Duration>,
}

/// Sleeps return at once and only advance a virtual clock.
#[derive(Debug, Clone, Default)]
pub struct VirtualPlatform {
    timeline: Rc<RefCell<Timeline>>,
}

impl VirtualPlatform {
    pub fn sleeps(&self) -> Vec<Duration> {
        self.timeline.borrow().sleeps.clone()
    }
}

impl Platform for VirtualPlatform {
    async fn sleep(&mut self, duration: Duration) {
        let mut timeline = self.timeline.borrow_mut();
        timeline.uptime_ms += duration.as_millis() as u64;
        timeline.sleeps.push(duration);
    }

    fn uptime_ms(&self) -> u64 {
        self.timeline.borrow().uptime_ms
    }
}
