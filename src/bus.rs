//! Field-bus plumbing: the driver seam and the per-line telegram queues.

pub mod driver;
pub mod manager;

pub use driver::{BusDriver, RtuBusDriver, TelegramReply, TelegramRequest};
pub use manager::{BusEvent, BusManager};

use std::sync::Arc;

/// Immutable lookup table from bus index to its [`BusManager`].
///
/// Instruments hold a router clone and resolve their configured bus index
/// on every operation, logging a configuration error when the bus does not
/// exist.
#[derive(Clone, Default)]
pub struct BusRouter {
    buses: Arc<Vec<BusManager>>,
}

impl BusRouter {
    /// Build the router over all configured lines.
    pub fn new(buses: Vec<BusManager>) -> Self {
        Self {
            buses: Arc::new(buses),
        }
    }

    /// Look up a line by bus index.
    pub fn bus(&self, index: usize) -> Option<&BusManager> {
        self.buses.get(index)
    }

    /// Number of configured lines.
    pub fn len(&self) -> usize {
        self.buses.len()
    }

    /// Whether no lines are configured.
    pub fn is_empty(&self) -> bool {
        self.buses.is_empty()
    }

    /// Iterate over all lines in bus-index order.
    pub fn iter(&self) -> impl Iterator<Item = &BusManager> {
        self.buses.iter()
    }
}
