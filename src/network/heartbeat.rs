//! Heartbeat Monitor
//!
//! Emits a `ping` envelope on a fixed interval while the connection is up.
//! The monitor lives inside the connected phase; dropping it stops pings.

use std::time::Duration;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::debug;

use crate::network::envelope::ClientCommand;

pub struct HeartbeatMonitor {
    interval: Interval,
    period: Duration,
    sent: u64,
}

impl HeartbeatMonitor {
    /// Start a monitor whose first beat is one full period from now
    pub fn start(period: Duration) -> Self {
        let mut interval = interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!("Heartbeat started ({:?})", period);
        Self {
            interval,
            period,
            sent: 0,
        }
    }

    /// Wait for the next beat and return the ping to send
    pub async fn tick(&mut self) -> ClientCommand {
        self.interval.tick().await;
        self.sent += 1;
        ClientCommand::Ping {}
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    /// Pings emitted since start
    pub fn beats(&self) -> u64 {
        self.sent
    }
}

impl Drop for HeartbeatMonitor {
    fn drop(&mut self) {
        debug!("Heartbeat stopped after {} pings", self.sent);
    }
}
