//! # particleserver
//!
//! A headless daemon that acquires particle-count measurements from
//! cleanroom particle-counting instruments over multi-drop serial Modbus
//! lines, persists each instrument's configuration locally, and pushes
//! every measurement as a time-series point to InfluxDB. A line-oriented
//! TCP control interface lets operators list/add/remove instruments,
//! query live values and inspect logs.
//!
//! ## Architecture
//!
//! ```text
//! Scheduler ──> Registry ──> Instrument ──> Bus Manager ──> Bus Driver ──> wire
//!                  ^                                            │
//!                  └──────────── demux by transaction id <──────┘
//!                  │
//!                  └──> Measurement Sink (InfluxDB)
//!                  └──> Control Surface (TCP, live fan-out)
//! ```
//!
//! Each serial line is strictly serial: one telegram in flight, two FIFO
//! priority queues, observable depth for poll backpressure. Instruments
//! are protocol state machines that reassemble fragmented multi-register
//! replies into live and archive datasets; the registry routes bus events
//! to them by transaction id and is the process-wide serialisation point.

pub mod bus;
pub mod config;
pub mod control;
pub mod core;
pub mod instrument;
pub mod registry;
pub mod scheduler;
pub mod sink;

pub use crate::core::error::{Result, ServerError};

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::bus::{BusEvent, BusManager, BusRouter};
    pub use crate::config::DaemonConfig;
    pub use crate::core::data::*;
    pub use crate::core::error::{Result, ServerError};
    pub use crate::core::logging::{LogBook, Severity};
    pub use crate::instrument::{MeasurementEvent, ParticleCounter};
    pub use crate::registry::CounterRegistry;
    pub use crate::sink::MeasurementSink;
}
