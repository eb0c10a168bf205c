//! Heartbeat monitor: periodically sweep connections that stopped pinging.
//!
//! Half-open transports never report closure, so silence is the only signal.

use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::services::registry::ConnectionRegistry;

pub struct HeartbeatMonitor {
    registry: ConnectionRegistry,
    interval: Duration,
    timeout: Duration,
}

impl HeartbeatMonitor {
    /// A connection is swept once it has been silent for more than `missed_limit` intervals.
    pub fn new(registry: ConnectionRegistry, interval: Duration, missed_limit: u32) -> Self {
        Self {
            registry,
            interval,
            timeout: interval * missed_limit,
        }
    }

    /// Close and unregister every connection silent past the timeout. Returns how many.
    pub async fn sweep(&self) -> usize {
        let stale = self
            .registry
            .stale_connections(Instant::now(), self.timeout)
            .await;
        let mut swept = 0;
        for id in stale {
            if self.registry.unregister(id).await {
                info!(connection_id = %id, "heartbeat timeout");
                swept += 1;
            }
        }
        debug!(swept, "heartbeat sweep");
        swept
    }

    /// Run the sweep every interval until the task is aborted.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + self.interval, self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                self.sweep().await;
            }
        })
    }
}
