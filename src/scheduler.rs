//! Periodic poll tasks.
//!
//! Two timers drive the whole acquisition: a 2-second status poll that,
//! subject to per-bus queue backpressure, makes every instrument request
//! its status and archive data, and a 12-hour clock resync that pushes the
//! server wall time into every instrument RTC.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::registry::CounterRegistry;

/// Period of the status/archive poll.
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Period of the instrument RTC resync.
pub const CLOCK_RESYNC_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Spawn the cyclic status poll.
pub fn spawn_status_poll(registry: Arc<Mutex<CounterRegistry>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + STATUS_POLL_INTERVAL;
        let mut interval = tokio::time::interval_at(start, STATUS_POLL_INTERVAL);
        loop {
            interval.tick().await;
            registry.lock().await.poll_status_cycle();
        }
    })
}

/// Spawn the cyclic clock resync.
pub fn spawn_clock_resync(registry: Arc<Mutex<CounterRegistry>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let start = tokio::time::Instant::now() + CLOCK_RESYNC_INTERVAL;
        let mut interval = tokio::time::interval_at(start, CLOCK_RESYNC_INTERVAL);
        loop {
            interval.tick().await;
            tracing::info!("resyncing instrument clocks");
            registry.lock().await.resync_clocks();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::driver::testing::PendingDriver;
    use crate::bus::{BusManager, BusRouter};
    use crate::core::logging::LogBook;
    use std::sync::atomic::AtomicU64;
    use tokio::sync::mpsc;

    fn registry_with_one_instrument() -> (Arc<Mutex<CounterRegistry>>, tempfile::TempDir) {
        let (bus_tx, _bus_rx) = mpsc::unbounded_channel();
        let manager = BusManager::spawn(
            0,
            Box::new(PendingDriver),
            Duration::from_millis(0),
            Arc::new(AtomicU64::new(1)),
            bus_tx,
        );
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let dir = tempfile::tempdir().unwrap();
        let mut registry = CounterRegistry::new(
            BusRouter::new(vec![manager]),
            LogBook::new(),
            events_tx,
            dir.path(),
        );
        registry.add(1, 0, 7);
        (Arc::new(Mutex::new(registry)), dir)
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_poll_fires_after_two_seconds() {
        let (registry, _dir) = registry_with_one_instrument();
        let before = registry.lock().await.pending_count_for_test(1);

        let _task = spawn_status_poll(registry.clone());
        tokio::time::sleep(Duration::from_millis(2100)).await;

        // One tick: status (4) + archive (1) + next archive (1)
        let after = registry.lock().await.pending_count_for_test(1);
        assert_eq!(after, before + 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_poll_does_not_fire_early() {
        let (registry, _dir) = registry_with_one_instrument();
        let before = registry.lock().await.pending_count_for_test(1);

        let _task = spawn_status_poll(registry.clone());
        tokio::time::sleep(Duration::from_millis(1900)).await;

        assert_eq!(registry.lock().await.pending_count_for_test(1), before);
    }

    #[tokio::test(start_paused = true)]
    async fn test_clock_resync_after_twelve_hours() {
        let (registry, _dir) = registry_with_one_instrument();
        let before = registry.lock().await.pending_count_for_test(1);

        let _task = spawn_clock_resync(registry.clone());
        tokio::time::sleep(CLOCK_RESYNC_INTERVAL + Duration::from_secs(1)).await;

        // One resync: six RTC registers plus the set-clock command
        let after = registry.lock().await.pending_count_for_test(1);
        assert_eq!(after, before + 7);
    }
}
