//! Field-bus driver seam.
//!
//! Transport-level framing and CRC are not implemented here: the production
//! driver delegates to `tokio-modbus` over a `tokio-serial` stream. The
//! crate's own code starts at [`BusDriver`], which executes exactly one
//! telegram at a time and either returns the parsed reply or fails, which
//! the bus manager surfaces as a lost transaction.

use async_trait::async_trait;
use tokio_modbus::client::{rtu, Context, Reader, Writer};
use tokio_modbus::slave::{Slave, SlaveContext};
use tokio_serial::SerialPortBuilderExt;

use crate::core::error::{Result, ServerError};

/// One request telegram for the field bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelegramRequest {
    /// Read `count` holding registers starting at `start`.
    ReadHolding {
        /// Unit address on the bus segment.
        unit: u8,
        /// First register offset.
        start: u16,
        /// Number of registers.
        count: u16,
    },
    /// Read `count` input registers starting at `start`.
    ReadInput {
        /// Unit address on the bus segment.
        unit: u8,
        /// First register offset.
        start: u16,
        /// Number of registers.
        count: u16,
    },
    /// Write a single holding register.
    WriteSingle {
        /// Unit address on the bus segment.
        unit: u8,
        /// Register offset.
        register: u16,
        /// Value to write.
        value: u16,
    },
}

impl TelegramRequest {
    /// Unit address this telegram is directed at.
    pub fn unit(&self) -> u8 {
        match *self {
            Self::ReadHolding { unit, .. }
            | Self::ReadInput { unit, .. }
            | Self::WriteSingle { unit, .. } => unit,
        }
    }
}

/// Parsed reply to a [`TelegramRequest`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TelegramReply {
    /// Holding register contents, in increasing register order.
    Holding(Vec<u16>),
    /// Input register contents, in increasing register order.
    Input(Vec<u16>),
    /// A single-register write was acknowledged.
    WriteAck,
}

/// A transport that can execute one telegram against the wire.
///
/// Implementations do not queue: the bus manager owns scheduling and calls
/// `execute` strictly serially per line.
#[async_trait]
pub trait BusDriver: Send {
    /// Execute one telegram and wait for its reply.
    async fn execute(&mut self, request: &TelegramRequest) -> Result<TelegramReply>;
}

/// Production driver: Modbus RTU over a serial line at 19200/8-E-1.
pub struct RtuBusDriver {
    ctx: Context,
}

impl RtuBusDriver {
    /// Open the serial line and attach the RTU transport.
    pub fn open(device: &str) -> Result<Self> {
        let builder = tokio_serial::new(device, 19_200)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::Even)
            .stop_bits(tokio_serial::StopBits::One);
        let stream = builder
            .open_native_async()
            .map_err(|source| ServerError::Serial {
                port: device.to_string(),
                source,
            })?;
        Ok(Self {
            ctx: rtu::attach(stream),
        })
    }
}

#[async_trait]
impl BusDriver for RtuBusDriver {
    async fn execute(&mut self, request: &TelegramRequest) -> Result<TelegramReply> {
        self.ctx.set_slave(Slave(request.unit()));
        match *request {
            TelegramRequest::ReadHolding { start, count, .. } => {
                let words = flatten(self.ctx.read_holding_registers(start, count).await)?;
                Ok(TelegramReply::Holding(words))
            }
            TelegramRequest::ReadInput { start, count, .. } => {
                let words = flatten(self.ctx.read_input_registers(start, count).await)?;
                Ok(TelegramReply::Input(words))
            }
            TelegramRequest::WriteSingle {
                register, value, ..
            } => {
                flatten(self.ctx.write_single_register(register, value).await)?;
                Ok(TelegramReply::WriteAck)
            }
        }
    }
}

/// Collapse the transport/exception result nesting into the crate error.
fn flatten<T>(
    result: std::result::Result<
        std::result::Result<T, tokio_modbus::ExceptionCode>,
        tokio_modbus::Error,
    >,
) -> Result<T> {
    match result {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(exception)) => Err(ServerError::Transaction(format!(
            "modbus exception: {exception}"
        ))),
        Err(e) => Err(ServerError::Transaction(e.to_string())),
    }
}

/// Stand-in for a serial line that could not be opened. Keeps the bus
/// index alignment intact; every telegram on it is reported lost.
pub struct DeadLineDriver {
    device: String,
}

impl DeadLineDriver {
    /// Create a dead line for the given device path.
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
        }
    }
}

#[async_trait]
impl BusDriver for DeadLineDriver {
    async fn execute(&mut self, _request: &TelegramRequest) -> Result<TelegramReply> {
        Err(ServerError::Transaction(format!(
            "serial line {} is not open",
            self.device
        )))
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scriptable drivers for tests of the queueing and demux layers.

    use std::sync::{Arc, Mutex};

    use super::*;

    /// Records every executed request and replies via a programmable
    /// handler. The default handler answers reads with zeroed words.
    pub struct MockDriver {
        pub executed: Arc<Mutex<Vec<TelegramRequest>>>,
        handler: Box<dyn FnMut(&TelegramRequest) -> Result<TelegramReply> + Send>,
    }

    impl MockDriver {
        pub fn new() -> (Self, Arc<Mutex<Vec<TelegramRequest>>>) {
            Self::with_handler(Box::new(|request| Ok(default_reply(request))))
        }

        pub fn with_handler(
            handler: Box<dyn FnMut(&TelegramRequest) -> Result<TelegramReply> + Send>,
        ) -> (Self, Arc<Mutex<Vec<TelegramRequest>>>) {
            let executed = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    executed: executed.clone(),
                    handler,
                },
                executed,
            )
        }
    }

    #[async_trait]
    impl BusDriver for MockDriver {
        async fn execute(&mut self, request: &TelegramRequest) -> Result<TelegramReply> {
            self.executed.lock().unwrap().push(request.clone());
            (self.handler)(request)
        }
    }

    /// Never completes a telegram; keeps everything queued or in flight.
    pub struct PendingDriver;

    #[async_trait]
    impl BusDriver for PendingDriver {
        async fn execute(&mut self, _request: &TelegramRequest) -> Result<TelegramReply> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    /// Executes requests only when the test feeds a scripted reply, so a
    /// test can hold the worker mid-telegram and inspect the queues.
    pub struct ScriptedDriver {
        pub executed: Arc<Mutex<Vec<TelegramRequest>>>,
        replies: tokio::sync::mpsc::UnboundedReceiver<Result<TelegramReply>>,
    }

    impl ScriptedDriver {
        pub fn new() -> (
            Self,
            tokio::sync::mpsc::UnboundedSender<Result<TelegramReply>>,
            Arc<Mutex<Vec<TelegramRequest>>>,
        ) {
            let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
            let executed = Arc::new(Mutex::new(Vec::new()));
            (
                Self {
                    executed: executed.clone(),
                    replies: rx,
                },
                tx,
                executed,
            )
        }
    }

    #[async_trait]
    impl BusDriver for ScriptedDriver {
        async fn execute(&mut self, request: &TelegramRequest) -> Result<TelegramReply> {
            self.executed.lock().unwrap().push(request.clone());
            match self.replies.recv().await {
                Some(reply) => reply,
                None => std::future::pending().await,
            }
        }
    }

    pub fn default_reply(request: &TelegramRequest) -> TelegramReply {
        match *request {
            TelegramRequest::ReadHolding { count, .. } => {
                TelegramReply::Holding(vec![0; count as usize])
            }
            TelegramRequest::ReadInput { count, .. } => {
                TelegramReply::Input(vec![0; count as usize])
            }
            TelegramRequest::WriteSingle { .. } => TelegramReply::WriteAck,
        }
    }
}
