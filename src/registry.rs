//! The instrument registry.
//!
//! Owns every [`ParticleCounter`], loads and persists their configuration,
//! dispatches inbound bus events to the owning agent by transaction id and
//! runs the poll cycles the scheduler triggers. The registry is the
//! process-wide serialisation point: bus events, scheduler ticks and
//! control-surface queries all pass through it one at a time.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::bus::{BusEvent, BusRouter};
use crate::core::error::Result;
use crate::core::logging::{LogBook, Severity};
use crate::instrument::{MeasurementSender, ParticleCounter};

/// Poll dispatch is suppressed for a bus once either of its queues holds
/// this many telegrams.
pub const POLL_BACKPRESSURE_LIMIT: usize = 20;

const LOG_SOURCE: &str = "ParticleCounterDatabase";

/// Registry of all configured particle counters.
pub struct CounterRegistry {
    counters: Vec<ParticleCounter>,
    buses: BusRouter,
    log: LogBook,
    events: MeasurementSender,
    data_dir: PathBuf,
}

impl CounterRegistry {
    /// Create an empty registry.
    pub fn new(
        buses: BusRouter,
        log: LogBook,
        events: MeasurementSender,
        data_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            counters: Vec::new(),
            buses,
            log,
            events,
            data_dir: data_dir.into(),
        }
    }

    /// Number of registered instruments.
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    /// Whether no instruments are registered.
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// The shared bus router.
    pub fn buses(&self) -> &BusRouter {
        &self.buses
    }

    // ========================================================================
    // Lifecycle
    // ========================================================================

    /// Enumerate `*.csv` files in the persistence directory in
    /// lexicographic order, instantiate one instrument per file and
    /// initialise it.
    pub fn load_from_disk(&mut self) -> Result<()> {
        let mut paths: Vec<PathBuf> = match std::fs::read_dir(&self.data_dir) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .map(|entry| entry.path())
                .filter(|path| path.extension().is_some_and(|ext| ext == "csv"))
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        paths.sort();

        for path in paths {
            let mut counter = ParticleCounter::new(
                self.buses.clone(),
                self.log.clone(),
                self.events.clone(),
                &self.data_dir,
            );
            if let Err(e) = counter.load(&path) {
                tracing::error!(path = %path.display(), error = %e, "skipping unreadable instrument file");
                continue;
            }
            tracing::info!(
                id = counter.id(),
                bus = ?counter.bus_index(),
                unit = ?counter.unit_address(),
                "loaded instrument"
            );
            counter.init();
            self.counters.push(counter);
        }
        Ok(())
    }

    /// Create, persist and initialise a new instrument. Returns a
    /// human-readable status string for the control surface.
    pub fn add(&mut self, id: u32, bus_index: usize, unit_address: u8) -> String {
        if self.counter_by_id(id).is_some() {
            return format!("Warning[ParticleCounterDatabase]: ID {} already exists.", id);
        }

        let mut counter = ParticleCounter::new(
            self.buses.clone(),
            self.log.clone(),
            self.events.clone(),
            &self.data_dir,
        );
        counter.set_id(id);
        counter.set_bus_index(Some(bus_index));
        counter.set_unit_address(Some(unit_address));
        counter.set_autosave(true);
        if let Err(e) = counter.save() {
            tracing::error!(id, error = %e, "could not persist new instrument");
        }
        counter.init();
        self.counters.push(counter);

        format!("OK[ParticleCounterDatabase]: Added ID {}", id)
    }

    /// Remove an instrument: erase its file, clear its log entries and
    /// release it.
    pub fn delete(&mut self, id: u32) -> String {
        let Some(index) = self.counters.iter().position(|c| c.id() == id) else {
            return format!("Warning[ParticleCounterDatabase]: ID {} not found.", id);
        };
        let counter = self.counters.remove(index);
        counter.delete_file();
        counter.delete_all_errors();
        format!("OK[ParticleCounterDatabase]: Removed ID {}", id)
    }

    /// Ids of all instruments, in registration order.
    pub fn ids(&self) -> Vec<u32> {
        self.counters.iter().map(|c| c.id()).collect()
    }

    /// Ids of every instrument on the given bus.
    pub fn ids_on_bus(&self, bus_index: usize) -> Vec<u32> {
        self.counters
            .iter()
            .filter(|c| c.bus_index() == Some(bus_index))
            .map(|c| c.id())
            .collect()
    }

    /// `(id, busID)` pairs for the `list-particlecounters` command, busID
    /// rendered as -1 while unset.
    pub fn list_instruments(&self) -> Vec<(u32, i64)> {
        self.counters
            .iter()
            .map(|c| (c.id(), c.bus_index().map_or(-1, |b| b as i64)))
            .collect()
    }

    /// Whether an instrument with this id exists.
    pub fn has_instrument(&self, id: u32) -> bool {
        self.counter_by_id(id).is_some()
    }

    fn counter_by_id(&self, id: u32) -> Option<&ParticleCounter> {
        self.counters.iter().find(|c| c.id() == id)
    }

    fn counter_by_id_mut(&mut self, id: u32) -> Option<&mut ParticleCounter> {
        self.counters.iter_mut().find(|c| c.id() == id)
    }

    // ========================================================================
    // String-typed query surface
    // ========================================================================

    /// Read a single value by name.
    pub fn get_data(&self, id: u32, key: &str) -> String {
        match self.counter_by_id(id) {
            Some(counter) => counter.get_data(key),
            None => format!("Warning[ParticleCounterDatabase]: ID {} not found.", id),
        }
    }

    /// Read several values by name. The sentinel key `actual` expands to
    /// the full live key set and marks the response with `actualData=1` so
    /// downstream formatters can take the live path. An unknown id yields
    /// an empty map.
    pub fn get_data_map(&self, id: u32, keys: &[String]) -> BTreeMap<String, String> {
        let mut response = BTreeMap::new();
        let Some(counter) = self.counter_by_id(id) else {
            return response;
        };

        let keys: Vec<String> = if keys.iter().any(|k| k == "actual") {
            // Only the live values matter now, the answer takes a special
            // processing path downstream
            response.insert("actualData".to_string(), "1".to_string());
            ParticleCounter::actual_keys()
        } else {
            keys.to_vec()
        };

        for key in keys {
            let value = counter.get_data(&key);
            response.insert(key, value);
        }
        response
    }

    /// Set a single value by name.
    pub fn set_data(&mut self, id: u32, key: &str, value: &str) -> String {
        match self.counter_by_id_mut(id) {
            Some(counter) => {
                counter.set_data(key, value);
                format!("OK[ParticleCounterDatabase]: Setting {} to {}", key, value)
            }
            None => format!("Warning[ParticleCounterDatabase]: ID {} not found.", id),
        }
    }

    /// Set several values by name.
    pub fn set_data_map(&mut self, id: u32, data: &BTreeMap<String, String>) -> String {
        let Some(counter) = self.counter_by_id_mut(id) else {
            return format!("Warning[ParticleCounterDatabase]: ID {} not found.", id);
        };

        let mut applied = String::new();
        for (key, value) in data {
            counter.set_data(key, value);
            applied.push_str(&format!(" {}:{}", key, value));
        }
        format!("OK[ParticleCounterDatabase]: Setting data:{}", applied)
    }

    // ========================================================================
    // Bus event demux
    // ========================================================================

    /// Route one bus event to the instrument owning its transaction id.
    /// Events with no owner are logged as routing errors and dropped.
    pub fn dispatch_bus_event(&mut self, event: BusEvent) {
        match event {
            BusEvent::HoldingRead {
                tx_id,
                unit,
                start,
                words,
            } => match self.claim(tx_id) {
                Some(index) => self.counters[index].handle_holding_registers(unit, start, &words),
                None => self.routing_error(tx_id),
            },
            BusEvent::InputRead {
                tx_id,
                unit,
                start,
                words,
            } => match self.claim(tx_id) {
                Some(index) => self.counters[index].handle_input_registers(unit, start, &words),
                None => self.routing_error(tx_id),
            },
            BusEvent::TransactionLost { tx_id } => match self.claim(tx_id) {
                Some(index) => self.counters[index].handle_transaction_lost(tx_id),
                None => self.routing_error(tx_id),
            },
            // Write telegrams produce no data event, their id is retired
            // here. Read ids are already gone by the time this arrives.
            BusEvent::TransactionFinished { tx_id } => {
                let _ = self.claim(tx_id);
            }
        }
    }

    /// The first instrument owning the transaction wins and consumes the
    /// id.
    fn claim(&mut self, tx_id: u64) -> Option<usize> {
        self.counters
            .iter_mut()
            .position(|c| c.claim_transaction(tx_id, true))
    }

    fn routing_error(&self, tx_id: u64) {
        tracing::debug!(tx_id, "bus event with no owning instrument");
        self.log
            .new_entry(Severity::Error, LOG_SOURCE, "Telegram id mismatch.");
    }

    // ========================================================================
    // Poll cycles
    // ========================================================================

    /// One status-poll tick: for every bus whose queues are below the
    /// backpressure limit, make each of its instruments request status,
    /// the current archive dataset and the archive advance, in that order.
    pub fn poll_status_cycle(&mut self) {
        let buses = self.buses.clone();
        for bus in buses.iter() {
            let depth = bus.queue_depth(false).max(bus.queue_depth(true));
            if depth >= POLL_BACKPRESSURE_LIMIT {
                tracing::debug!(bus = bus.index(), depth, "poll suppressed by backpressure");
                continue;
            }
            for counter in &mut self.counters {
                if counter.bus_index() == Some(bus.index()) {
                    counter.request_status();
                    counter.request_archive_dataset();
                    counter.request_next_archive();
                }
            }
        }
    }

    /// Push the server wall time into every instrument's real-time clock.
    pub fn resync_clocks(&mut self) {
        for counter in &mut self.counters {
            counter.set_clock();
        }
    }

    #[cfg(test)]
    pub(crate) fn pending_count_for_test(&self, id: u32) -> usize {
        self.counter_by_id(id)
            .map(|c| c.pending_transaction_count())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::driver::testing::PendingDriver;
    use crate::bus::BusManager;
    use crate::instrument::MeasurementEvent;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        registry: CounterRegistry,
        managers: Vec<BusManager>,
        log: LogBook,
        _events_rx: mpsc::UnboundedReceiver<MeasurementEvent>,
        _dir: tempfile::TempDir,
    }

    fn fixture(bus_count: usize) -> Fixture {
        let (bus_tx, _bus_rx) = mpsc::unbounded_channel();
        let tx_ids = Arc::new(AtomicU64::new(1));
        let managers: Vec<BusManager> = (0..bus_count)
            .map(|index| {
                BusManager::spawn(
                    index,
                    Box::new(PendingDriver),
                    Duration::from_millis(0),
                    tx_ids.clone(),
                    bus_tx.clone(),
                )
            })
            .collect();

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let log = LogBook::new();
        let dir = tempfile::tempdir().unwrap();
        let registry = CounterRegistry::new(
            BusRouter::new(managers.clone()),
            log.clone(),
            events_tx,
            dir.path(),
        );

        Fixture {
            registry,
            managers,
            log,
            _events_rx: events_rx,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn test_add_and_list() {
        let mut f = fixture(1);

        let response = f.registry.add(5, 0, 11);
        assert_eq!(response, "OK[ParticleCounterDatabase]: Added ID 5");
        assert_eq!(f.registry.list_instruments(), vec![(5, 0)]);
        assert!(f
            ._dir
            .path()
            .join("particlecounter-000005.csv")
            .exists());
    }

    #[tokio::test]
    async fn test_add_duplicate_id_is_rejected() {
        let mut f = fixture(1);
        f.registry.add(5, 0, 11);

        let response = f.registry.add(5, 0, 12);
        assert_eq!(
            response,
            "Warning[ParticleCounterDatabase]: ID 5 already exists."
        );
        assert_eq!(f.registry.len(), 1);
    }

    #[tokio::test]
    async fn test_delete_removes_file_and_entry() {
        let mut f = fixture(1);
        f.registry.add(5, 0, 11);
        let path = f._dir.path().join("particlecounter-000005.csv");
        assert!(path.exists());

        let response = f.registry.delete(5);
        assert_eq!(response, "OK[ParticleCounterDatabase]: Removed ID 5");
        assert!(!path.exists());
        assert!(f.registry.is_empty());

        assert_eq!(
            f.registry.delete(5),
            "Warning[ParticleCounterDatabase]: ID 5 not found."
        );
    }

    #[tokio::test]
    async fn test_load_from_disk_sorted() {
        let mut f = fixture(1);
        let dir = f._dir.path().to_path_buf();
        std::fs::write(
            dir.join("particlecounter-000020.csv"),
            "id=20 bus=0 modbusAddress=2\n",
        )
        .unwrap();
        std::fs::write(
            dir.join("particlecounter-000003.csv"),
            "id=3 bus=0 modbusAddress=1\n",
        )
        .unwrap();

        f.registry.load_from_disk().unwrap();

        assert_eq!(f.registry.ids(), vec![3, 20]);
        // init() ran for both: the full dialogue is in flight
        assert!(f.registry.counters[0].pending_transaction_count() > 0);
    }

    #[tokio::test]
    async fn test_demux_routes_by_transaction_id() {
        let mut f = fixture(1);
        // Identical (bus, unit) pairs may coexist; routing is by tx id only
        f.registry.add(1, 0, 7);
        f.registry.add(2, 0, 7);

        // Grab one pending transaction of instrument 2
        let tx_id = *f.registry.counters[1]
            .pending_transactions_for_test()
            .iter()
            .next()
            .unwrap();

        f.registry.dispatch_bus_event(BusEvent::InputRead {
            tx_id,
            unit: 7,
            start: crate::core::registers::input::STATUS,
            words: vec![0b0001],
        });

        assert!(!f.registry.counters[0].actual_data().online);
        assert!(f.registry.counters[1].actual_data().online);
    }

    #[tokio::test]
    async fn test_demux_unknown_transaction_logs_routing_error() {
        let mut f = fixture(1);
        f.registry.add(1, 0, 7);

        f.registry.dispatch_bus_event(BusEvent::InputRead {
            tx_id: 999_999,
            unit: 7,
            start: 0,
            words: vec![0],
        });

        assert!(f
            .log
            .is_active(Severity::Error, LOG_SOURCE, "Telegram id mismatch."));
        assert!(!f.registry.counters[0].actual_data().online);
    }

    #[tokio::test]
    async fn test_finished_write_retires_transaction_id() {
        let mut f = fixture(1);
        f.registry.add(1, 0, 7);
        let before = f.registry.counters[0].pending_transaction_count();
        let tx_id = *f.registry.counters[0]
            .pending_transactions_for_test()
            .iter()
            .next()
            .unwrap();

        f.registry
            .dispatch_bus_event(BusEvent::TransactionFinished { tx_id });

        assert_eq!(
            f.registry.counters[0].pending_transaction_count(),
            before - 1
        );
        // A finished transaction is not a routing error
        assert!(!f
            .log
            .is_active(Severity::Error, LOG_SOURCE, "Telegram id mismatch."));
    }

    #[tokio::test]
    async fn test_lost_transaction_reaches_owner_only() {
        let mut f = fixture(1);
        f.registry.add(1, 0, 7);
        f.registry.add(2, 0, 8);

        let tx_id = *f.registry.counters[0]
            .pending_transactions_for_test()
            .iter()
            .next()
            .unwrap();
        f.registry
            .dispatch_bus_event(BusEvent::TransactionLost { tx_id });

        assert_eq!(f.registry.counters[0].actual_data().lost_telegrams, 1);
        assert_eq!(f.registry.counters[1].actual_data().lost_telegrams, 0);
    }

    #[tokio::test]
    async fn test_poll_backpressure_per_bus() {
        let mut f = fixture(2);
        f.registry.add(1, 0, 7);
        f.registry.add(2, 1, 7);
        let pending_before_0 = f.registry.counters[0].pending_transaction_count();
        let pending_before_1 = f.registry.counters[1].pending_transaction_count();

        // Push bus 0 beyond the backpressure limit with filler telegrams
        for _ in 0..(POLL_BACKPRESSURE_LIMIT + 2) {
            f.managers[0].read_holding(99, 0, 1);
        }
        assert!(
            f.managers[0].queue_depth(false) >= POLL_BACKPRESSURE_LIMIT,
            "bus 0 must be congested"
        );

        f.registry.poll_status_cycle();

        // Bus 0 suppressed, bus 1 dispatched status + archive + next (6)
        assert_eq!(
            f.registry.counters[0].pending_transaction_count(),
            pending_before_0
        );
        assert_eq!(
            f.registry.counters[1].pending_transaction_count(),
            pending_before_1 + 6
        );
    }

    #[tokio::test]
    async fn test_get_data_map_actual_sentinel() {
        let mut f = fixture(1);
        f.registry.add(1, 0, 7);

        let map = f
            .registry
            .get_data_map(1, &["actual".to_string(), "id".to_string()]);

        assert_eq!(map.get("actualData").unwrap(), "1");
        assert!(map.contains_key("online"));
        assert!(map.contains_key("countChannel_8"));
        assert!(map.contains_key("timestamp"));
        // The explicit key list is dropped on the live path
        assert!(!map.contains_key("id"));
    }

    #[tokio::test]
    async fn test_get_data_unknown_id() {
        let f = fixture(1);
        assert_eq!(
            f.registry.get_data(42, "online"),
            "Warning[ParticleCounterDatabase]: ID 42 not found."
        );
        assert!(f.registry.get_data_map(42, &["actual".to_string()]).is_empty());
    }

    #[tokio::test]
    async fn test_set_data_map() {
        let mut f = fixture(2);
        f.registry.add(1, 0, 7);

        let mut data = BTreeMap::new();
        data.insert("busID".to_string(), "1".to_string());
        data.insert("unit".to_string(), "9".to_string());
        let response = f.registry.set_data_map(1, &data);

        assert_eq!(
            response,
            "OK[ParticleCounterDatabase]: Setting data: busID:1 unit:9"
        );
        assert_eq!(f.registry.get_data(1, "busID"), "1");
        assert_eq!(f.registry.get_data(1, "unit"), "9");
    }

    #[tokio::test]
    async fn test_ids_on_bus() {
        let mut f = fixture(2);
        f.registry.add(1, 0, 7);
        f.registry.add(2, 1, 7);
        f.registry.add(3, 0, 8);

        assert_eq!(f.registry.ids_on_bus(0), vec![1, 3]);
        assert_eq!(f.registry.ids_on_bus(1), vec![2]);
    }
}
