//! Error types for the particle server.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors raised by the particle server core.
///
/// None of these are fatal at runtime: tasks log the error and keep the
/// daemon running. `main` only propagates errors during startup.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration file could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// An instrument references a bus index that is not configured.
    #[error("bus {0} not found")]
    BusNotFound(usize),

    /// An instrument is missing its bus index or unit address.
    #[error("instrument id={0} not configured")]
    NotConfigured(u32),

    /// No instrument with the given id exists in the registry.
    #[error("instrument id={0} not found")]
    InstrumentNotFound(u32),

    /// Serial line could not be opened.
    #[error("serial port {port}: {source}")]
    Serial {
        /// Device path of the serial line.
        port: String,
        #[source]
        source: tokio_serial::Error,
    },

    /// Field-bus transaction failed at the transport level.
    #[error("bus transaction failed: {0}")]
    Transaction(String),

    /// File or socket I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Time-series sink rejected or never received a write.
    #[error("sink: {0}")]
    Sink(String),
}
