//! `firmata-host` command line
use clap::{Parser, Subcommand};
use firmata_rs::{Firmata, FirmataConfig, SerialTransport, SimulatedBoard, Transport};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Talk to a Firmata board over a serial port
#[derive(Parser, Debug)]
#[command(name = "firmata-host", version, about = "Host-side Firmata driver")]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Serial port (overrides transport.port)
    #[arg(short, long)]
    port: Option<String>,

    /// Baud rate (overrides transport.baud)
    #[arg(short, long)]
    baud: Option<u32>,

    /// Use the built-in simulated board instead of a serial port
    #[arg(long)]
    simulate: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Handshake and print firmware, protocol version and pins
    Info {
        #[arg(long)]
        json: bool,
    },
    /// List serial ports
    Ports,
    DigitalRead { pin: u8 },
    DigitalWrite {
        pin: u8,
        #[arg(value_parser = parse_level)]
        level: bool,
    },
    /// Read an analog channel (not a pin number)
    AnalogRead { channel: u8 },
    /// PWM write
    AnalogWrite { pin: u8, value: u32 },
    PinState { pin: u8 },
    /// Send SYSTEM_RESET
    Reset,
}

fn parse_level(s: &str) -> Result<bool, String> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "high" | "on" => Ok(true),
        "0" | "low" | "off" => Ok(false),
        other => Err(format!("Invalid level '{}': expected high/low or 1/0", other)),
    }
}

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => tracing::Level::INFO,
        1 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).init();

    if let Commands::Ports = cli.command {
        for port in SerialTransport::available_ports() {
            println!("{}", port);
        }
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => {
            let path = path.to_string_lossy();
            tracing::info!("Loading configuration from: {}", path);
            firmata_rs::load_config(&path)?
        }
        None => FirmataConfig::default(),
    };
    if let Some(port) = cli.port {
        config.transport.port = port;
    }
    if let Some(baud) = cli.baud {
        config.transport.baud = baud;
    }

    let (firmata, _runner) = if cli.simulate {
        tracing::info!("Using simulated board");
        let (board, signals) = SimulatedBoard::open();
        Firmata::spawn(board as Arc<dyn Transport>, signals, config.clone())
    } else {
        if config.transport.port.is_empty() {
            return Err("No serial port given: use --port, transport.port or --simulate".into());
        }
        let (transport, signals) = SerialTransport::open(&config.transport.port, config.transport.baud)?;
        Firmata::spawn(Arc::new(transport), signals, config.clone())
    };

    let ready_timeout = config.handshake.grace_period()
        + config.handshake.report_version_timeout() * (config.handshake.retries + 1)
        + config.requests.timeout() * 3;
    firmata.wait_ready(ready_timeout).await?;

    match cli.command {
        Commands::Info { json } => {
            let board = firmata.board().await;
            if json {
                println!("{}", serde_json::to_string_pretty(&board)?);
            } else {
                if let Some(firmware) = board.firmware() {
                    println!(
                        "Firmware: {} {}.{}",
                        firmware.name, firmware.version.major, firmware.version.minor
                    );
                }
                if let Some(version) = board.protocol_version() {
                    println!("Protocol: {}.{}", version.major, version.minor);
                }
                for pin in board.pins() {
                    let modes: Vec<String> = pin.supported_modes.iter().map(|m| m.to_string()).collect();
                    let analog = pin.analog_channel.map(|c| format!(" A{}", c)).unwrap_or_default();
                    println!("pin {:>3}{}: {}", pin.index, analog, modes.join(", "));
                }
            }
        }
        Commands::DigitalRead { pin } => println!("{}", firmata.digital_read(pin).await?),
        Commands::DigitalWrite { pin, level } => firmata.digital_write(pin, level).await?,
        Commands::AnalogRead { channel } => println!("{}", firmata.analog_read(channel).await?),
        Commands::AnalogWrite { pin, value } => firmata.analog_write(pin, value).await?,
        Commands::PinState { pin } => {
            let (mode, state) = firmata.query_pin_state(pin).await?;
            println!("pin {}: {} state {}", pin, mode, state);
        }
        Commands::Reset => firmata.system_reset().await?,
        Commands::Ports => {}
    }

    // let queued output drain before the process exits
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}
