use std::{net::Ipv4Addr, time::Duration};

use log::{info, warn};

use crate::{
    error::{ConnectError, StationError},
    platform::Platform,
    types::ConnectivityState,
};

pub trait WifiStation {
    fn disconnect(&mut self) -> Result<(), StationError>;

    fn begin_association(&mut self, ssid: &str, password: &str) -> Result<(), StationError>;

    /// `Some(address)` once the station is associated and has an address.
    fn poll_association(&mut self) -> Result<Option<Ipv4Addr>, StationError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub retry_interval: Duration,
    /// Pause after the forced disconnect, before association starts.
    pub settle: Duration,
}

/// WiFi bring-up with a bounded number of association polls.
///
/// Once connected the session does not watch the link; a dropped link only
/// shows up later as broker errors.
pub struct NetworkSession<W> {
    station: W,
    state: ConnectivityState,
    address: Option<Ipv4Addr>,
}

impl<W: WifiStation> NetworkSession<W> {
    pub fn new(station: W) -> Self {
        Self {
            station,
            state: ConnectivityState::Disconnected,
            address: None,
        }
    }

    pub fn state(&self) -> ConnectivityState {
        self.state
    }

    pub fn address(&self) -> Option<Ipv4Addr> {
        self.address
    }

    /// `on_settled` runs once the forced disconnect has settled, right before
    /// association starts.
    pub async fn connect<P: Platform>(
        &mut self,
        platform: &mut P,
        ssid: &str,
        password: &str,
        retry: RetryPolicy,
        on_settled: impl FnOnce(),
    ) -> Result<Ipv4Addr, ConnectError> {
        self.state = ConnectivityState::Connecting;
        self.address = None;

        // Stale association from before a soft reset would make the first poll lie.
        if let Err(err) = self.station.disconnect() {
            warn!("wifi disconnect before connect failed: {err}");
        }
        platform.sleep(retry.settle).await;
        on_settled();

        info!("wifi connecting to `{ssid}`");
        if let Err(err) = self.station.begin_association(ssid, password) {
            self.state = ConnectivityState::Failed;
            return Err(ConnectError::Station(err));
        }

        let max_attempts = retry.max_attempts.max(1);
        for attempt in 1..=max_attempts {
            match self.station.poll_association() {
                Ok(Some(address)) => {
                    info!("wifi connected on attempt {attempt}/{max_attempts}, ip {address}");
                    self.state = ConnectivityState::Connected;
                    self.address = Some(address);
                    return Ok(address);
                }
                Ok(None) => {}
                Err(err) => warn!("wifi poll failed on attempt {attempt}/{max_attempts}: {err}"),
            }

            if attempt < max_attempts {
                platform.sleep(retry.retry_interval).await;
            }
        }

        warn!("wifi not associated after {max_attempts} polls");
        self.state = ConnectivityState::Failed;
        Err(ConnectError::Timeout {
            attempts: max_attempts,
        })
    }
}
