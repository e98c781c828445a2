//! Per-line telegram scheduling.
//!
//! A [`BusManager`] multiplexes many instruments onto one shared serial
//! line. It is strictly serial: exactly one telegram is in flight at a
//! time; queued telegrams are dispatched FIFO within each of two priority
//! classes, high priority draining first. Between telegrams the worker
//! observes a configurable transmit delay so slow converters can turn the
//! line around. Queue depth is observable for the poll scheduler's
//! backpressure rule.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, Notify};

use super::driver::{BusDriver, TelegramReply, TelegramRequest};

/// How long the worker waits for a reply before declaring the transaction
/// lost.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_millis(1000);

/// Parsed-response and loss events re-emitted upstream. All buses feed the
/// same channel; the registry demuxes by transaction id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusEvent {
    /// A holding-register read completed.
    HoldingRead {
        /// Transaction id of the request.
        tx_id: u64,
        /// Unit address the reply came from.
        unit: u8,
        /// First register offset of the reply.
        start: u16,
        /// Register contents in increasing register order.
        words: Vec<u16>,
    },
    /// An input-register read completed.
    InputRead {
        /// Transaction id of the request.
        tx_id: u64,
        /// Unit address the reply came from.
        unit: u8,
        /// First register offset of the reply.
        start: u16,
        /// Register contents in increasing register order.
        words: Vec<u16>,
    },
    /// The telegram was sent but no valid reply arrived in time.
    TransactionLost {
        /// Transaction id of the request.
        tx_id: u64,
    },
    /// The telegram completed (reads complete after their data event).
    TransactionFinished {
        /// Transaction id of the request.
        tx_id: u64,
    },
}

#[derive(Debug)]
struct QueuedTelegram {
    tx_id: u64,
    request: TelegramRequest,
}

#[derive(Debug, Default)]
struct TelegramQueues {
    high: VecDeque<QueuedTelegram>,
    standard: VecDeque<QueuedTelegram>,
}

impl TelegramQueues {
    fn pop(&mut self) -> Option<QueuedTelegram> {
        self.high.pop_front().or_else(|| self.standard.pop_front())
    }
}

struct Shared {
    queues: Mutex<TelegramQueues>,
    notify: Notify,
}

/// Handle to one serial line's telegram queue. Cheap to clone.
///
/// Requests return their transaction id immediately; the reply, or its
/// loss, arrives later as a [`BusEvent`] on the shared event channel.
#[derive(Clone)]
pub struct BusManager {
    index: usize,
    shared: Arc<Shared>,
    tx_ids: Arc<AtomicU64>,
}

impl BusManager {
    /// Create the manager for one line and spawn its worker task.
    ///
    /// `tx_ids` is shared across all lines so transaction ids are unique
    /// per process, which is what the registry demux relies on.
    pub fn spawn(
        index: usize,
        driver: Box<dyn BusDriver>,
        tx_delay: Duration,
        tx_ids: Arc<AtomicU64>,
        events: mpsc::UnboundedSender<BusEvent>,
    ) -> Self {
        let shared = Arc::new(Shared {
            queues: Mutex::new(TelegramQueues::default()),
            notify: Notify::new(),
        });

        tokio::spawn(worker(shared.clone(), driver, tx_delay, events));

        Self {
            index,
            shared,
            tx_ids,
        }
    }

    /// Index of this line (the `busIndex` stored on each instrument).
    pub fn index(&self) -> usize {
        self.index
    }

    /// Queue a telegram and return its transaction id immediately.
    pub fn submit(&self, request: TelegramRequest, high_priority: bool) -> u64 {
        let tx_id = self.tx_ids.fetch_add(1, Ordering::Relaxed);
        let telegram = QueuedTelegram { tx_id, request };
        {
            let mut queues = self.shared.queues.lock().unwrap();
            if high_priority {
                queues.high.push_back(telegram);
            } else {
                queues.standard.push_back(telegram);
            }
        }
        self.shared.notify.notify_one();
        tx_id
    }

    /// Queue a holding-register read at standard priority.
    pub fn read_holding(&self, unit: u8, start: u16, count: u16) -> u64 {
        self.submit(TelegramRequest::ReadHolding { unit, start, count }, false)
    }

    /// Queue an input-register read at standard priority.
    pub fn read_input(&self, unit: u8, start: u16, count: u16) -> u64 {
        self.submit(TelegramRequest::ReadInput { unit, start, count }, false)
    }

    /// Queue a single-register write at standard priority.
    pub fn write_single(&self, unit: u8, register: u16, value: u16) -> u64 {
        self.submit(
            TelegramRequest::WriteSingle {
                unit,
                register,
                value,
            },
            false,
        )
    }

    /// Number of telegrams waiting in the given priority class.
    pub fn queue_depth(&self, high_priority: bool) -> usize {
        let queues = self.shared.queues.lock().unwrap();
        if high_priority {
            queues.high.len()
        } else {
            queues.standard.len()
        }
    }
}

/// The per-line worker: pops one telegram at a time, executes it on the
/// driver with a response timeout, emits the resulting events and observes
/// the inter-telegram delay. The queue lock is never held across an await.
async fn worker(
    shared: Arc<Shared>,
    mut driver: Box<dyn BusDriver>,
    tx_delay: Duration,
    events: mpsc::UnboundedSender<BusEvent>,
) {
    loop {
        let telegram = { shared.queues.lock().unwrap().pop() };
        let Some(telegram) = telegram else {
            shared.notify.notified().await;
            continue;
        };

        let unit = telegram.request.unit();
        let result = tokio::time::timeout(RESPONSE_TIMEOUT, driver.execute(&telegram.request)).await;

        let event = match result {
            Ok(Ok(reply)) => {
                let data_event = match (reply, &telegram.request) {
                    (TelegramReply::Holding(words), TelegramRequest::ReadHolding { start, .. }) => {
                        Some(BusEvent::HoldingRead {
                            tx_id: telegram.tx_id,
                            unit,
                            start: *start,
                            words,
                        })
                    }
                    (TelegramReply::Input(words), TelegramRequest::ReadInput { start, .. }) => {
                        Some(BusEvent::InputRead {
                            tx_id: telegram.tx_id,
                            unit,
                            start: *start,
                            words,
                        })
                    }
                    _ => None,
                };
                if let Some(data_event) = data_event {
                    let _ = events.send(data_event);
                }
                BusEvent::TransactionFinished {
                    tx_id: telegram.tx_id,
                }
            }
            Ok(Err(e)) => {
                tracing::warn!(tx_id = telegram.tx_id, unit, error = %e, "transaction failed");
                BusEvent::TransactionLost {
                    tx_id: telegram.tx_id,
                }
            }
            Err(_elapsed) => {
                tracing::warn!(tx_id = telegram.tx_id, unit, "transaction timed out");
                BusEvent::TransactionLost {
                    tx_id: telegram.tx_id,
                }
            }
        };

        if events.send(event).is_err() {
            // Receiver dropped, daemon is shutting down
            return;
        }

        tokio::time::sleep(tx_delay).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::driver::testing::{MockDriver, PendingDriver};
    use crate::core::error::ServerError;

    fn manager_with_mock(
        driver: Box<dyn BusDriver>,
    ) -> (BusManager, mpsc::UnboundedReceiver<BusEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let manager = BusManager::spawn(
            0,
            driver,
            Duration::from_millis(0),
            Arc::new(AtomicU64::new(1)),
            tx,
        );
        (manager, rx)
    }

    #[tokio::test]
    async fn test_read_emits_data_then_finished() {
        let (driver, _executed) = MockDriver::new();
        let (manager, mut rx) = manager_with_mock(Box::new(driver));

        let tx_id = manager.read_input(5, 256, 30);

        let first = rx.recv().await.unwrap();
        assert_eq!(
            first,
            BusEvent::InputRead {
                tx_id,
                unit: 5,
                start: 256,
                words: vec![0; 30],
            }
        );
        let second = rx.recv().await.unwrap();
        assert_eq!(second, BusEvent::TransactionFinished { tx_id });
    }

    #[tokio::test]
    async fn test_write_emits_finished_only() {
        let (driver, _executed) = MockDriver::new();
        let (manager, mut rx) = manager_with_mock(Box::new(driver));

        let tx_id = manager.write_single(3, 99, 17);

        assert_eq!(
            rx.recv().await.unwrap(),
            BusEvent::TransactionFinished { tx_id }
        );
    }

    #[tokio::test]
    async fn test_driver_error_is_transaction_lost() {
        let (driver, _executed) = MockDriver::with_handler(Box::new(|_| {
            Err(ServerError::Transaction("no reply".to_string()))
        }));
        let (manager, mut rx) = manager_with_mock(Box::new(driver));

        let tx_id = manager.read_holding(1, 2, 1);

        assert_eq!(
            rx.recv().await.unwrap(),
            BusEvent::TransactionLost { tx_id }
        );
    }

    #[tokio::test]
    async fn test_fifo_order_within_priority_class() {
        let (driver, executed) = MockDriver::new();
        let (manager, mut rx) = manager_with_mock(Box::new(driver));

        let a = manager.read_holding(1, 10, 1);
        let b = manager.read_holding(1, 20, 1);
        let c = manager.read_holding(1, 30, 1);

        // Six events: data + finished per telegram, in submission order
        let mut finished = Vec::new();
        for _ in 0..6 {
            if let BusEvent::TransactionFinished { tx_id } = rx.recv().await.unwrap() {
                finished.push(tx_id);
            }
        }
        assert_eq!(finished, vec![a, b, c]);

        let starts: Vec<u16> = executed
            .lock()
            .unwrap()
            .iter()
            .map(|request| match request {
                TelegramRequest::ReadHolding { start, .. } => *start,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(starts, vec![10, 20, 30]);
    }

    #[tokio::test]
    async fn test_high_priority_drains_first() {
        use crate::bus::driver::testing::ScriptedDriver;

        // Hold the worker mid-telegram so the queues fill up behind it
        let (driver, replies, executed) = ScriptedDriver::new();
        let (manager, mut rx) = manager_with_mock(Box::new(driver));

        manager.read_holding(1, 1, 1); // occupies the worker
        while executed.lock().unwrap().is_empty() {
            tokio::task::yield_now().await;
        }

        manager.submit(
            TelegramRequest::ReadHolding {
                unit: 1,
                start: 100,
                count: 1,
            },
            false,
        );
        let high = manager.submit(
            TelegramRequest::ReadHolding {
                unit: 1,
                start: 200,
                count: 1,
            },
            true,
        );

        assert_eq!(manager.queue_depth(false), 1);
        assert_eq!(manager.queue_depth(true), 1);

        for _ in 0..3 {
            replies.send(Ok(TelegramReply::Holding(vec![0]))).unwrap();
        }

        let mut finished = Vec::new();
        while finished.len() < 3 {
            if let BusEvent::TransactionFinished { tx_id } = rx.recv().await.unwrap() {
                finished.push(tx_id);
            }
        }
        // The high-priority telegram overtakes the queued standard one
        assert_eq!(finished[1], high);
    }

    #[tokio::test]
    async fn test_queue_depth_observable() {
        let (manager, _rx) = manager_with_mock(Box::new(PendingDriver));

        assert_eq!(manager.queue_depth(false), 0);
        for _ in 0..5 {
            manager.read_input(1, 256, 30);
        }
        // One telegram may already be in flight; the rest stay queued
        while manager.queue_depth(false) > 4 {
            tokio::task::yield_now().await;
        }
        assert_eq!(manager.queue_depth(false), 4);
        assert_eq!(manager.queue_depth(true), 0);
    }
}
