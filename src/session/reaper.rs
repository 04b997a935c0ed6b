use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use super::SessionRegistry;

/// Periodically evicts sessions idle for longer than `idle_timeout`.
pub fn spawn_reaper(registry: SessionRegistry, idle_timeout: Duration, every: Duration) -> JoinHandle<()> {
    info!(
        idle_timeout_ms = idle_timeout.as_millis() as u64,
        interval_ms = every.as_millis() as u64,
        "Starting idle session reaper"
    );
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let reaped = registry.reap_idle(idle_timeout).await;
            if reaped > 0 {
                info!("Reaped {} idle sessions", reaped);
            }
        }
    })
}
