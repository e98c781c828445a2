//! TCP control surface.
//!
//! A line-oriented UTF-8 protocol on localhost for operators and tooling:
//! list/add/remove instruments, query live values, inspect the operator
//! log and the bus queue levels. The server additionally fans live
//! datasets out to every client that switched into live mode.
//!
//! The wire format is a compatibility surface: response strings, the
//! `Hello` banner and the `Liveshow=on|off` acknowledgements are parsed by
//! deployed tooling and must not change.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use crate::core::error::Result;
use crate::core::logging::{LogBook, Severity};
use crate::registry::CounterRegistry;

/// Listen address. Restricted to localhost; remote access goes through an
/// ssh tunnel endpoint.
pub const CONTROL_ADDR: &str = "127.0.0.1:16001";

/// If no client has ever connected within this window after startup, an
/// informational "No connection to server." error is raised.
pub const FIRST_CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

const LOG_SOURCE: &str = "Remotecontroller";
const NO_CONNECTION_TEXT: &str = "No connection to server.";

/// One live dataset, pre-rendered as the key map clients print.
#[derive(Debug, Clone)]
pub struct LiveUpdate {
    /// Emitting instrument.
    pub id: u32,
    /// The live key map.
    pub values: BTreeMap<String, String>,
}

/// Sender half of the live-subscriber fan-out.
pub type LiveSender = broadcast::Sender<LiveUpdate>;

/// The TCP control server.
pub struct ControlServer {
    listener: TcpListener,
    registry: Arc<Mutex<CounterRegistry>>,
    log: LogBook,
    live: LiveSender,
}

impl ControlServer {
    /// Bind the listen socket.
    pub async fn bind(
        addr: &str,
        registry: Arc<Mutex<CounterRegistry>>,
        log: LogBook,
        live: LiveSender,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "control server listening");
        Ok(Self {
            listener,
            registry,
            log,
            live,
        })
    }

    /// The bound address.
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Spawn the accept loop.
    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let clients = Arc::new(AtomicUsize::new(0));
        let (connected_tx, mut connected_rx) = watch::channel(false);

        // Informational startup watchdog, stopped by the first connection
        let watchdog_log = self.log.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(FIRST_CONNECTION_TIMEOUT) => {
                    watchdog_log.new_entry(Severity::Error, LOG_SOURCE, NO_CONNECTION_TEXT);
                }
                _ = connected_rx.changed() => {}
            }
        });

        loop {
            let (socket, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!(error = %e, "accept failed");
                    continue;
                }
            };
            tracing::debug!(%peer, "control client connected");

            if clients.fetch_add(1, Ordering::SeqCst) == 0 {
                self.log
                    .entry_gone(Severity::Error, LOG_SOURCE, NO_CONNECTION_TEXT);
                let _ = connected_tx.send(true);
            }

            let registry = self.registry.clone();
            let log = self.log.clone();
            let live_rx = self.live.subscribe();
            let clients = clients.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_client(socket, registry, &log, live_rx).await {
                    tracing::debug!(%peer, error = %e, "control client i/o error");
                }
                tracing::debug!(%peer, "control client disconnected");
                if clients.fetch_sub(1, Ordering::SeqCst) == 1 {
                    log.new_entry(Severity::Error, LOG_SOURCE, NO_CONNECTION_TEXT);
                }
            });
        }
    }
}

async fn handle_client(
    socket: TcpStream,
    registry: Arc<Mutex<CounterRegistry>>,
    log: &LogBook,
    mut live_rx: broadcast::Receiver<LiveUpdate>,
) -> std::io::Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut lines = BufReader::new(read_half).lines();
    let mut livemode = false;

    write_half.write_all(b"Hello\r\n").await?;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(());
                };
                let response = handle_command(&line, &registry, log, &mut livemode).await;
                write_half.write_all(response.as_bytes()).await?;
            }
            update = live_rx.recv() => {
                match update {
                    Ok(update) if livemode => {
                        write_live_update(&mut write_half, &update).await?;
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::debug!(missed, "live subscriber lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => {}
                }
            }
        }
    }
}

async fn write_live_update(
    write_half: &mut OwnedWriteHalf,
    update: &LiveUpdate,
) -> std::io::Result<()> {
    let mut line = format!("ActualData from id={}", update.id);
    for (key, value) in &update.values {
        line.push_str(&format!(" {}={}", key, value));
    }
    line.push_str("\r\n");
    write_half.write_all(line.as_bytes()).await
}

/// Split one input line into the command word and its `--key[=value]`
/// flags. Value-less flags map to the marker value `query`. Chunks that
/// cannot be decoded produce error lines.
fn parse_command(line: &str) -> (String, BTreeMap<String, String>, Vec<String>) {
    let line = line.trim_matches(['\r', '\n']);
    let mut parts = line.split_whitespace();
    let command = parts.next().unwrap_or_default().to_string();

    let mut args = BTreeMap::new();
    let mut errors = Vec::new();
    for chunk in parts {
        let pieces: Vec<&str> = chunk.split('=').collect();
        if pieces.len() > 2 {
            errors.push("ERROR: key_value_pair length invalid\r\n".to_string());
            continue;
        }
        let Some(key) = pieces[0].strip_prefix("--") else {
            continue;
        };
        if pieces.len() == 2 {
            args.insert(key.to_string(), pieces[1].to_string());
        } else {
            args.insert(key.to_string(), "query".to_string());
        }
    }
    (command, args, errors)
}

fn parse_arg<T: std::str::FromStr>(args: &BTreeMap<String, String>, key: &str) -> Option<T> {
    args.get(key).and_then(|value| value.parse().ok())
}

async fn handle_command(
    line: &str,
    registry: &Arc<Mutex<CounterRegistry>>,
    log: &LogBook,
    livemode: &mut bool,
) -> String {
    let (command, args, parse_errors) = parse_command(line);
    if !parse_errors.is_empty() {
        return parse_errors.concat();
    }

    match command.as_str() {
        "" => String::new(),
        "help" => HELP_TEXT.to_string(),
        "hostname" => format!(
            "Hostname={}\n",
            gethostname::gethostname().to_string_lossy()
        ),
        "startlive" => {
            *livemode = true;
            "Liveshow=on\n".to_string()
        }
        "stoplive" => {
            *livemode = false;
            "Liveshow=off\n".to_string()
        }
        "list-particlecounters" => {
            let registry = registry.lock().await;
            registry
                .list_instruments()
                .iter()
                .map(|(id, bus)| format!("Particle Counter id={} busID={}\r\n", id, bus))
                .collect()
        }
        "log" => format!(
            "{}\n{}\n{}\n",
            log.dump(Severity::Info),
            log.dump(Severity::Warning),
            log.dump(Severity::Error)
        ),
        "buffers" => {
            let registry = registry.lock().await;
            registry
                .buses()
                .iter()
                .enumerate()
                .map(|(index, bus)| {
                    format!(
                        "Particle Counter ModBus line {}: \
                         TelegramQueueLevel_standardPriority={} \
                         TelegramQueueLevel_highPriority={}\r\n",
                        index,
                        bus.queue_depth(false),
                        bus.queue_depth(true)
                    )
                })
                .collect()
        }
        "add-particlecounter" => {
            let Some(bus) = parse_arg::<usize>(&args, "bus") else {
                return "Error[Commandparser]: parameter \"bus\" not specified or bus cannot be parsed. Abort.\r\n".to_string();
            };
            let Some(id) = parse_arg::<u32>(&args, "id") else {
                return "Error[Commandparser]: parameter \"id\" not specified or id can not be parsed. Abort.\r\n".to_string();
            };
            let Some(unit) = parse_arg::<u8>(&args, "unit") else {
                return "Error[Commandparser]: parameter \"unit\" not specified or id can not be parsed. Abort.\r\n".to_string();
            };
            let response = registry.lock().await.add(id, bus, unit);
            format!("{}\r\n", response)
        }
        "delete-particlecounter" => {
            let id = parse_arg::<u32>(&args, "id");
            let bus = parse_arg::<usize>(&args, "bus");
            if id.is_none() && bus.is_none() {
                return "Error[Commandparser]: Neither parameter \"id\" nor parameter \"bus\" specified. Abort.\r\n".to_string();
            }

            let mut registry = registry.lock().await;
            let mut response = String::new();
            if let Some(id) = id {
                response.push_str(&registry.delete(id));
                response.push('\n');
            }
            if let Some(bus) = bus {
                for id in registry.ids_on_bus(bus) {
                    response.push_str(&registry.delete(id));
                    response.push('\n');
                }
            }
            format!("{}\r\n", response)
        }
        "set" => {
            let Some(id) = parse_arg::<u32>(&args, "id") else {
                return "Error[Commandparser]: parameter \"id\" not specified or id can not be parsed. Abort.\r\n".to_string();
            };
            let mut registry = registry.lock().await;
            let response = if registry.has_instrument(id) {
                registry.set_data_map(id, &args)
            } else {
                String::new()
            };
            format!("{}\r\n", response)
        }
        "get" => {
            let Some(id) = parse_arg::<u32>(&args, "id") else {
                return "Error[Commandparser]: parameter \"id\" not specified or id can not be parsed. Abort.\r\n".to_string();
            };
            let keys: Vec<String> = args
                .iter()
                .filter(|(key, value)| *value == "query" && *key != "id")
                .map(|(key, _)| key.clone())
                .collect();

            let registry = registry.lock().await;
            let mut response_data = if registry.has_instrument(id) {
                registry.get_data_map(id, &keys)
            } else {
                BTreeMap::new()
            };

            let is_actual = response_data
                .remove("actualData")
                .is_some_and(|marker| marker == "1");
            let mut response = if is_actual {
                format!("ActualData from id={}", id)
            } else {
                format!("Data from id={}", id)
            };

            let mut errors = String::new();
            for (key, value) in &response_data {
                if value.starts_with("Error[Particle Counter]:") {
                    errors.push_str(value);
                    errors.push_str("\r\n");
                } else {
                    response.push_str(&format!(" {}={}", key, value));
                }
            }
            response.push_str("\r\n");
            response.push_str(&errors);
            response
        }
        _ => format!("ERROR: Command not supported: {}\r\n", command),
    }
}

const HELP_TEXT: &str = "This is the commandset of the openFFUcontrol remote unit:\r\n\
\r\n\
<COMMAND> [--key[=value]]\r\n\
\r\n\
COMMANDS:\r\n\
\x20   hostname\r\n\
\x20       Show the hostname of the controller.\r\n\
\x20   startlive\r\n\
\x20       Show data of particle counters in realtime. Can be stopped with stoplive\r\n\
\x20   stoplive\r\n\
\x20       Stop live showing of particle counter data.\r\n\
\x20   list-particlecounters\r\n\
\x20       Show the list of currently configured particlecounters from the controller database.\r\n\
\x20   log\r\n\
\x20       Show the log consisting of infos, warnings and errors.\r\n\
\r\n\
\x20   buffers\r\n\
\x20       Show buffer levels.\r\n\
\r\n\
\x20   add-particlecounter --bus=BUSNR --unit=ADR --id=ID\r\n\
\x20       Add a new particle counter with ID to the controller database at BUSNR with OCU at modbus address ADR.\r\n\
\r\n\
\x20   delete-particlecounter --id=ID --bus=BUSNR\r\n\
\x20       Delete particle counter with ID from the controller database.\r\n\
\x20       Note that you can delete all particle counters of a certain bus by using BUSNR only.\r\n\
\r\n\
\x20   set --id=ID --parameter=VALUE\r\n\
\r\n\
\x20   get --id=ID --parameter\r\n\
\x20       parameter 'actual' lists all actual values of the selected unit id.\r\n\
\r\n";
