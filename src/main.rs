use clap::{Args, Parser, Subcommand};
use serde::de::DeserializeOwned;
use serde_json::json;
use serial_engine::codec::{CommTimeouts, DcbBundle, TermiosBundle};
use serial_engine::config::{Config, ConfigError, ConfigLoader, DispatcherKind, PortSection};
use serial_engine::events::{Dispatch, EventKind, SerialData, SerialEvent};
use serial_engine::{
    logging, NativePort, PortConfiguration, SerialError, SerialPort, ThreadDispatcher,
    TokioDispatcher,
};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{debug, info};

#[derive(Debug, Error)]
enum CliError {
    #[error(transparent)]
    Serial(#[from] SerialError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to enumerate serial ports: {0}")]
    Enumerate(#[from] serialport::Error),

    #[error("Background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

type CliResult<T> = Result<T, CliError>;

// Command-line arguments
#[derive(Parser, Debug)]
#[command(
    name = "serial-engine",
    version,
    about = "Open, configure and drive serial ports from the command line."
)]
struct Cli {
    /// Configuration file. Defaults to the standard search path.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List serial ports present on this machine.
    List,

    /// Open a port, write data, wait for it to drain, and close.
    Send {
        port: String,
        data: String,
        /// Interpret DATA as hex bytes ("01 ff 7e").
        #[arg(long)]
        hex: bool,
        #[command(flatten)]
        line: LineArgs,
    },

    /// Print notifications and received data until Ctrl-C.
    Monitor {
        port: String,
        #[command(flatten)]
        line: LineArgs,
    },

    /// Print the termios and DCB images for the configured line settings.
    Termios {
        #[command(flatten)]
        line: LineArgs,
    },
}

/// Line settings that override the `[port]` section.
#[derive(Args, Debug, Default)]
struct LineArgs {
    #[arg(short, long)]
    baud: Option<u32>,
    #[arg(long)]
    data_bits: Option<u8>,
    /// none, odd, even, mark or space
    #[arg(long, value_parser = parse_setting::<serial_engine::Parity>)]
    parity: Option<serial_engine::Parity>,
    /// one, one_point_five or two
    #[arg(long, value_parser = parse_setting::<serial_engine::StopBits>)]
    stop_bits: Option<serial_engine::StopBits>,
    /// none, xonxoff, rts or rts_xonxoff
    #[arg(long, value_parser = parse_setting::<serial_engine::Handshake>)]
    handshake: Option<serial_engine::Handshake>,
    /// Read timeout in milliseconds, -1 for infinite.
    #[arg(long, allow_hyphen_values = true)]
    read_timeout: Option<i64>,
    /// Write timeout in milliseconds, -1 for infinite.
    #[arg(long, allow_hyphen_values = true)]
    write_timeout: Option<i64>,
}

/// Parse a setting using the same spelling as the configuration file.
fn parse_setting<T: DeserializeOwned>(value: &str) -> Result<T, String> {
    serde_json::from_value(serde_json::Value::String(value.to_lowercase()))
        .map_err(|e| e.to_string())
}

impl LineArgs {
    fn apply(&self, port: Option<&str>, section: &PortSection) -> CliResult<PortConfiguration> {
        let mut section = section.clone();
        if let Some(name) = port {
            section.name = name.to_string();
        }
        if let Some(baud) = self.baud {
            section.baud_rate = baud;
        }
        if let Some(bits) = self.data_bits {
            section.data_bits = bits;
        }
        if let Some(parity) = self.parity {
            section.parity = parity;
        }
        if let Some(stop_bits) = self.stop_bits {
            section.stop_bits = stop_bits;
        }
        if let Some(handshake) = self.handshake {
            section.handshake = handshake;
            if handshake.uses_rts() {
                section.rts = false;
            }
        }
        if let Some(ms) = self.read_timeout {
            section.read_timeout_ms = ms;
        }
        if let Some(ms) = self.write_timeout {
            section.write_timeout_ms = ms;
        }
        Ok(section.to_configuration()?)
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let code = match run(cli).await {
        Ok(()) => 0,
        Err(e) => {
            eprintln!("error: {}", e);
            1
        }
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> CliResult<()> {
    let loader = match &cli.config {
        Some(path) => ConfigLoader::load_from(path)?,
        None => ConfigLoader::load()?,
    };
    let source = loader.source();
    let path = loader.config_path.clone();
    let config = loader.into_config();
    logging::init(&config.logging);
    match path {
        Some(path) => debug!("Configuration from {} ({:?})", path.display(), source),
        None => debug!("No configuration file, using defaults"),
    }

    match cli.command {
        Command::List => list_ports(),
        Command::Send {
            port,
            data,
            hex,
            line,
        } => {
            let payload = if hex { parse_hex(&data)? } else { data.into_bytes() };
            let port_config = line.apply(Some(&port), &config.port)?;
            send(&config, port_config, payload).await
        }
        Command::Monitor { port, line } => {
            let port_config = line.apply(Some(&port), &config.port)?;
            monitor(&config, port_config).await
        }
        Command::Termios { line } => {
            let port_config = line.apply(None, &config.port)?;
            print_images(&port_config)
        }
    }
}

fn list_ports() -> CliResult<()> {
    let ports = serialport::available_ports()?;
    if ports.is_empty() {
        println!("No serial ports found");
    }
    for port in ports {
        let detail = match port.port_type {
            serialport::SerialPortType::UsbPort(usb) => format!(
                "USB {:04x}:{:04x} {}",
                usb.vid,
                usb.pid,
                usb.product.unwrap_or_default()
            ),
            serialport::SerialPortType::PciPort => "PCI".to_string(),
            serialport::SerialPortType::BluetoothPort => "Bluetooth".to_string(),
            serialport::SerialPortType::Unknown => "unknown".to_string(),
        };
        println!("{}\t{}", port.port_name, detail);
    }
    Ok(())
}

fn parse_hex(data: &str) -> CliResult<Vec<u8>> {
    let digits: String = data.chars().filter(|c| !c.is_whitespace()).collect();
    if let Some(bad) = digits.chars().find(|c| !c.is_ascii_hexdigit()) {
        return Err(CliError::InvalidData(format!("'{}' is not a hex digit", bad)));
    }
    if digits.len() % 2 != 0 {
        return Err(CliError::InvalidData(format!(
            "odd number of hex digits in '{}'",
            data
        )));
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .map_err(|e| CliError::InvalidData(e.to_string()))
        })
        .collect()
}

fn dispatcher_for(config: &Config) -> Arc<dyn Dispatch> {
    match config.engine.dispatcher {
        DispatcherKind::Thread => Arc::new(ThreadDispatcher),
        DispatcherKind::Tokio => Arc::new(TokioDispatcher::current()),
    }
}

fn build_port(config: &Config, port_config: PortConfiguration) -> CliResult<SerialPort<NativePort>> {
    Ok(SerialPort::with_config(port_config)?
        .with_dispatcher(dispatcher_for(config))
        .with_close_wait(config.engine.close_wait()))
}

async fn send(config: &Config, port_config: PortConfiguration, payload: Vec<u8>) -> CliResult<()> {
    let mut port = build_port(config, port_config)?;
    let written = tokio::task::spawn_blocking(move || -> CliResult<usize> {
        port.open()?;
        port.write(&payload)?;
        port.flush()?;
        port.close()?;
        Ok(payload.len())
    })
    .await??;
    info!("Wrote {} bytes", written);
    Ok(())
}

async fn monitor(config: &Config, port_config: PortConfiguration) -> CliResult<()> {
    let name = port_config.port_name.clone();
    let mut port = build_port(config, port_config)?;

    let (tx, mut rx) = mpsc::unbounded_channel::<SerialEvent>();
    for kind in [EventKind::Data, EventKind::Error, EventKind::PinChanged] {
        let tx = tx.clone();
        port.subscribe(kind, move |event| {
            let _ = tx.send(*event);
        });
    }
    drop(tx);

    let port = tokio::task::spawn_blocking(move || -> CliResult<_> {
        port.open()?;
        Ok(Arc::new(Mutex::new(port)))
    })
    .await??;
    eprintln!("Monitoring {} (Ctrl-C to stop)", name);

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => break,
            event = rx.recv() => {
                let Some(event) = event else { break };
                match event {
                    SerialEvent::Data(SerialData::Chars) | SerialEvent::Data(SerialData::Eof) => {
                        let port = Arc::clone(&port);
                        let bytes = tokio::task::spawn_blocking(move || drain_input(&port)).await??;
                        if !bytes.is_empty() {
                            print!("{}", String::from_utf8_lossy(&bytes));
                        }
                    }
                    other => eprintln!("[{}] {}", name, other),
                }
            }
        }
    }

    tokio::task::spawn_blocking(move || port.lock().close()).await??;
    eprintln!("Closed {}", name);
    Ok(())
}

fn drain_input(port: &Mutex<SerialPort<NativePort>>) -> CliResult<Vec<u8>> {
    let port = port.lock();
    let available = port.bytes_to_read()?;
    let mut buf = vec![0u8; available];
    let mut filled = 0;
    while filled < available {
        match port.read(&mut buf[filled..]) {
            Ok(n) => filled += n,
            Err(SerialError::Timeout(_)) => break,
            Err(e) => return Err(e.into()),
        }
    }
    buf.truncate(filled);
    Ok(buf)
}

fn print_images(config: &PortConfiguration) -> CliResult<()> {
    let mut termios = TermiosBundle::default();
    let termios = match termios.configure(config) {
        Ok(()) => json!({
            "c_iflag": format!("{:#010x}", termios.input),
            "c_oflag": format!("{:#010x}", termios.output),
            "c_cflag": format!("{:#010x}", termios.control),
            "c_lflag": format!("{:#010x}", termios.local),
            "c_ispeed": termios.ispeed,
            "c_ospeed": termios.ospeed,
            "c_cc": termios.cc.to_vec(),
        }),
        Err(e) => json!({ "error": e.to_string() }),
    };

    let mut dcb = DcbBundle::default();
    let dcb = match dcb.initialize(config, config.read_buffer_size as u32) {
        Ok(()) => json!({
            "BaudRate": dcb.baud_rate,
            "flags": format!("{:#010x}", dcb.flags),
            "ByteSize": dcb.byte_size,
            "Parity": dcb.parity,
            "StopBits": dcb.stop_bits,
            "XonLim": dcb.xon_limit,
            "XoffLim": dcb.xoff_limit,
            "ErrorChar": dcb.error_char,
            "EofChar": dcb.eof_char,
            "EvtChar": dcb.event_char,
        }),
        Err(e) => json!({ "error": e.to_string() }),
    };

    let timeouts = CommTimeouts::from_timeouts(config.read_timeout, config.write_timeout);
    let report = json!({
        "port": config.port_name,
        "termios": termios,
        "dcb": dcb,
        "comm_timeouts": {
            "ReadIntervalTimeout": timeouts.read_interval,
            "ReadTotalTimeoutMultiplier": timeouts.read_total_multiplier,
            "ReadTotalTimeoutConstant": timeouts.read_total_constant,
            "WriteTotalTimeoutMultiplier": timeouts.write_total_multiplier,
            "WriteTotalTimeoutConstant": timeouts.write_total_constant,
        },
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&report).map_err(|e| CliError::InvalidData(e.to_string()))?
    );
    Ok(())
}
