use clap::{Parser, Subcommand};
use hotfire_core::{default_config_path, load_config, StationConfig};
use hotfire_safety::{SafetyEngine, SafetyReport};
use hotfire_serial::{available_ports, codec, SerialPortTransport, TransportEvent};
use station_lib::logging::{self, LogOptions};
use station_lib::Station;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "station")]
#[command(about = "Test-stand ground station")]
#[command(version)]
#[command(propagate_version = true)]
struct Cli {
    /// Station config (default: <config dir>/hotfire/station.json)
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Sequence definitions (default: sequences.json next to the config)
    #[arg(short = 's', long = "sequences", global = true)]
    sequences: Option<PathBuf>,

    /// Increase output verbosity (show debug messages)
    #[arg(short = 'v', long = "verbose", global = true)]
    verbose: bool,

    /// Log as JSON lines
    #[arg(long = "log-json", global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every safety check over the sequence file
    Validate,

    /// Replay one sequence (or all but Emergency Shutdown) for forbidden states
    DryRun {
        /// Sequence name
        name: Option<String>,
    },

    /// List serial ports
    Ports,

    /// Print the wire frame of a command, or verify a captured frame
    Frame {
        /// Command payload, or a framed line with --check
        text: String,

        /// Message id
        #[arg(long, default_value_t = 1)]
        id: u64,

        /// Verify TEXT as `<payload>,<id>,<HH>` instead of framing it
        #[arg(long)]
        check: bool,
    },

    /// Connect and run one sequence; Ctrl-C cancels it
    Run {
        /// Sequence name
        name: String,

        /// Override the configured port
        #[arg(short = 'p', long = "port")]
        port: Option<String>,
    },

    /// Connect and print inbound lines until Ctrl-C
    Monitor {
        /// Override the configured port
        #[arg(short = 'p', long = "port")]
        port: Option<String>,
    },
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> CliResult {
    let cli = Cli::parse();
    if let Err(e) = logging::init(LogOptions {
        verbose: cli.verbose,
        json: cli.log_json,
    }) {
        eprintln!("logging disabled: {}", e);
    }

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => default_config_path()?,
    };
    let sequences_path = cli.sequences.clone().unwrap_or_else(|| {
        config_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join("sequences.json")
    });

    match cli.command {
        Commands::Ports => list_ports(),
        Commands::Frame { text, id, check } => frame(&text, id, check),
        Commands::Validate => {
            let config = load_config(&config_path)?;
            let report = SafetyEngine::load(&sequences_path, &config)?.validate();
            print_report(&report);
            if report.valid {
                Ok(())
            } else {
                Err(report.summary().into())
            }
        }
        Commands::DryRun { name } => {
            let config = load_config(&config_path)?;
            let safety = SafetyEngine::load(&sequences_path, &config)?;
            let violations = match name {
                Some(name) => safety.dry_run_sequence(&name)?,
                None => safety.dry_run_all(),
            };
            for v in &violations {
                println!("{}", v);
            }
            println!("{} dynamic violation(s)", violations.len());
            if violations.is_empty() {
                Ok(())
            } else {
                Err("forbidden valve states reached".into())
            }
        }
        Commands::Run { name, port } => {
            let config = with_port(load_config(&config_path)?, port);
            run(config, &sequences_path, &name).await
        }
        Commands::Monitor { port } => {
            let config = with_port(load_config(&config_path)?, port);
            monitor(config, &sequences_path).await
        }
    }
}

fn with_port(mut config: StationConfig, port: Option<String>) -> StationConfig {
    if let Some(port) = port {
        config.serial.port_name = port;
    }
    config
}

fn list_ports() -> CliResult {
    let ports = available_ports()?;
    if ports.is_empty() {
        println!("no serial ports found");
    }
    for port in ports {
        println!("{:<24} {}", port.name, port.kind);
    }
    Ok(())
}

fn frame(text: &str, id: u64, check: bool) -> CliResult {
    if !check {
        println!("{}", codec::frame(text, id));
        return Ok(());
    }
    match codec::decode_frame(text) {
        Some(decoded) => {
            println!("OK: '{}' id {}", decoded.payload, decoded.id);
            Ok(())
        }
        None => Err(format!("'{}' is not a valid frame", text).into()),
    }
}

fn print_report(report: &SafetyReport) {
    for v in &report.violations {
        println!("{}", v);
    }
    for w in &report.warnings {
        println!("warning: {}", w);
    }
    println!(
        "{}: {}",
        if report.valid { "VALID" } else { "INVALID" },
        report.summary()
    );
}

async fn connected_station(
    config: StationConfig,
    sequences_path: &Path,
) -> Result<Arc<Station>, Box<dyn std::error::Error>> {
    let validated = SafetyEngine::load(sequences_path, &config)?.into_validated()?;
    let station = Arc::new(Station::build(config, validated, SerialPortTransport::new()));
    station.connect().await?;
    Ok(station)
}

async fn run(config: StationConfig, sequences_path: &Path, name: &str) -> CliResult {
    let station = connected_station(config, sequences_path).await?;
    let pump = station.spawn_event_pump();

    let runner = station.clone();
    let sequence = name.to_string();
    let mut task = tokio::spawn(async move { runner.run_sequence(&sequence).await });

    let result = tokio::select! {
        joined = &mut task => joined,
        _ = tokio::signal::ctrl_c() => {
            log::warn!("[station] interrupted, cancelling '{}'", name);
            station.sequences().cancel();
            task.await
        }
    };

    let _ = station.disconnect().await;
    if let Some(pump) = pump {
        pump.abort();
    }
    result??;
    Ok(())
}

async fn monitor(config: StationConfig, sequences_path: &Path) -> CliResult {
    let station = connected_station(config, sequences_path).await?;
    let pump = station.spawn_event_pump();
    let Some(engine) = station.engine() else {
        return Ok(());
    };
    let mut events = engine.subscribe();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(TransportEvent::Data(line)) => println!("{}", line),
                Ok(TransportEvent::Status(status)) => println!("# {:?}", status),
                Ok(TransportEvent::Error(e)) => println!("# error: {}", e),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    println!("# {} events dropped", n)
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    if let Ok(snapshot) = engine.snapshot().await {
        println!("# {}", serde_json::to_string(&snapshot)?);
    }
    let _ = station.disconnect().await;
    if let Some(pump) = pump {
        pump.abort();
    }
    Ok(())
}
