//! Core abstractions for the particle server.
//!
//! This module provides the domain data model, the authoritative register
//! map, the error type and the edge-triggered operator log.

pub mod data;
pub mod error;
pub mod logging;
pub mod registers;

pub use data::{
    ActualData, ArchiveDataset, ChannelData, ChannelStatus, ConfigData, DeviceInfo,
    ErrorstateRegister, OutputDataFormat, StatusRegister,
};
pub use error::{Result, ServerError};
pub use logging::{LogBook, Severity};
pub use registers::Command;
