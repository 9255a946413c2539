use std::{
    sync::OnceLock,
    time::{Duration, Instant},
};

/// Board services the supervisor needs besides its four components.
///
/// `sleep` is the only suspension point of the control task. Nothing else in
/// the loop waits.
#[allow(async_fn_in_trait)]
pub trait Platform {
    async fn sleep(&mut self, duration: Duration);

    fn uptime_ms(&self) -> u64;

    /// Called once per supervisor step. Boards with a task watchdog feed it here.
    fn heartbeat(&mut self) {}
}

pub fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}
