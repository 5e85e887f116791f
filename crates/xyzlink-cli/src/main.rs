//! Binary entrypoint for the xyzlink CLI.
//!
//! Commands:
//! - `ports` - list serial ports, `*` marking likely printers
//! - `encode <in> [<out>]` / `decode <in> [<out>]` - convert between g-code and `.3w`
//! - `monitor [-c <port>]` - print status and log lines until Ctrl-C
//! - `send [-c <port>] <line>` - send one command line and print the response
//! - `control [-c <port>] <pause|resume|cancel>` - control the running job
//! - `upload [-c <port>] -p <file>` - transfer a file and start printing it
//!
//! Settings come from `--config` (or the platform settings file); flags override them.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use xyzlink_core::prelude::*;
use xyzlink_core::protocol::list_ports;
use xyzlink_core::threew;

#[derive(Parser)]
#[command(name = "xyzlink")]
#[command(about = "Talk to XYZ da Vinci printers over USB serial")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Settings file (defaults to the platform config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Verbose logging (-v, -vv for more)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// List serial ports
    Ports,
    /// Wrap g-code in a .3w container
    Encode {
        input: PathBuf,
        /// Output path (defaults to the input with a .3w extension)
        output: Option<PathBuf>,
    },
    /// Extract g-code from a .3w container
    Decode {
        input: PathBuf,
        /// Output path (defaults to the input with a .gcode extension)
        output: Option<PathBuf>,
    },
    /// Print printer telemetry until interrupted
    Monitor {
        #[command(flatten)]
        port: PortArgs,
    },
    /// Send one command line and print the response
    Send {
        #[command(flatten)]
        port: PortArgs,
        /// Full command line, e.g. `XYZv3/query=a`
        line: String,
        /// Seconds to wait for the response
        #[arg(short, long, default_value_t = 3)]
        timeout: u64,
    },
    /// Pause, resume or cancel the current job
    Control {
        #[command(flatten)]
        port: PortArgs,
        action: ControlAction,
    },
    /// Upload a file and start printing it
    Upload {
        #[command(flatten)]
        port: PortArgs,
        /// File to print; plain g-code is wrapped first
        #[arg(short = 'p', long = "file")]
        file: PathBuf,
        /// Name shown on the printer (defaults to the file name)
        #[arg(long)]
        name: Option<String>,
        /// Transfer variant expected by the firmware
        #[arg(long, value_enum)]
        profile: Option<ProfileArg>,
    },
}

#[derive(clap::Args)]
struct PortArgs {
    /// Serial port (e.g. /dev/ttyACM0 or COM3)
    #[arg(short = 'c', long = "port")]
    port: Option<String>,
}

#[derive(Clone, Copy, ValueEnum)]
enum ControlAction {
    Pause,
    Resume,
    Cancel,
}

impl From<ControlAction> for PrintAction {
    fn from(action: ControlAction) -> Self {
        match action {
            ControlAction::Pause => PrintAction::Pause,
            ControlAction::Resume => PrintAction::Resume,
            ControlAction::Cancel => PrintAction::Cancel,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ProfileArg {
    /// Little-endian frames, per-block ok, explicit upload slot
    Acknowledged,
    /// Big-endian CRC32 frames, no per-block ok
    Streaming,
}

impl From<ProfileArg> for TransferProfile {
    fn from(profile: ProfileArg) -> Self {
        match profile {
            ProfileArg::Acknowledged => TransferProfile::acknowledged(),
            ProfileArg::Streaming => TransferProfile::streaming(),
        }
    }
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "xyzlink=info,xyzlink_core=info",
        1 => "xyzlink=debug,xyzlink_core=debug",
        _ => "xyzlink=trace,xyzlink_core=trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let path = match path {
        Some(path) => return Settings::load(path).context("loading settings"),
        None => Settings::default_path(),
    };
    match path {
        Ok(path) => Settings::load_or_default(&path).context("loading settings"),
        Err(e) => {
            warn!("{e}; using defaults");
            Ok(Settings::default())
        }
    }
}

/// Resolve the port: flag, then settings, then the first likely printer
fn choose_port(settings: &mut Settings, args: &PortArgs) -> Result<()> {
    if let Some(port) = &args.port {
        settings.connection.port_name = port.clone();
    }
    if settings.connection.port_name.is_empty() {
        let ports = list_ports();
        let found = ports
            .iter()
            .find(|p| p.looks_like_printer())
            .or_else(|| ports.first())
            .context("no serial port given and none found")?;
        info!("Using {}", found.name);
        settings.connection.port_name = found.name.clone();
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    let mut settings = load_settings(cli.config.as_deref())?;

    match cli.command {
        Commands::Ports => {
            for port in list_ports() {
                let label = [port.manufacturer.as_deref(), port.product.as_deref()]
                    .into_iter()
                    .flatten()
                    .collect::<Vec<_>>()
                    .join(" ");
                let marker = if port.looks_like_printer() { "*" } else { " " };
                println!("{marker} {:<20} {label}", port.name);
            }
        }
        Commands::Encode { input, output } => {
            let output = output.unwrap_or_else(|| input.with_extension("3w"));
            let size = threew::encode_file(&input, &output)
                .with_context(|| format!("encoding {}", input.display()))?;
            info!("Wrote {} ({size} bytes)", output.display());
        }
        Commands::Decode { input, output } => {
            let output = output.unwrap_or_else(|| input.with_extension("gcode"));
            let size = threew::decode_file(&input, &output)
                .with_context(|| format!("decoding {}", input.display()))?;
            info!("Wrote {} ({size} bytes)", output.display());
        }
        Commands::Monitor { port } => {
            choose_port(&mut settings, &port)?;
            let printer = Printer::connect(settings).await?;
            monitor(&printer).await;
            printer.disconnect().await;
        }
        Commands::Send {
            port,
            line,
            timeout,
        } => {
            choose_port(&mut settings, &port)?;
            let printer = Printer::connect(settings).await?;
            let lines = printer
                .exchange(&Command::Raw(line), Some(Duration::from_secs(timeout)))
                .await?;
            for line in lines {
                println!("{line}");
            }
            printer.disconnect().await;
        }
        Commands::Control { port, action } => {
            choose_port(&mut settings, &port)?;
            let printer = Printer::connect(settings).await?;
            // Control commands need a fresh token
            printer.exchange(&Command::QueryStatus, None).await?;
            let token = printer.connection().token();
            if token.is_none() {
                warn!("printer issued no token; sending without one");
            }
            printer
                .send(&Command::Print {
                    action: action.into(),
                    token,
                })
                .await?;
            printer.disconnect().await;
        }
        Commands::Upload {
            port,
            file,
            name,
            profile,
        } => {
            choose_port(&mut settings, &port)?;
            if let Some(profile) = profile {
                settings.upload.profile = profile.into();
            }
            upload(settings, &file, name).await?;
        }
    }

    Ok(())
}

async fn monitor(printer: &Printer) {
    let mut events = printer.subscribe();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(PrinterEvent::Status(status)) => {
                    let state = status.state.as_deref().unwrap_or("unknown");
                    println!(
                        "{state:<20} extruder {:>6} / {:<6} bed {:>5} / {:<5} {}%",
                        fmt_temp(status.extruder_actual_c),
                        fmt_temp(status.extruder_target_c),
                        fmt_temp(status.bed_actual_c),
                        fmt_temp(status.bed_target_c),
                        status.print_percent.unwrap_or(0),
                    );
                }
                Ok(PrinterEvent::Calibrate(cal)) => match cal.readings {
                    Some(readings) => println!("calibration {}: {readings:?}", cal.stage),
                    None => println!("calibration {}", cal.stage),
                },
                Ok(PrinterEvent::Log(log)) => println!("> {}", log.raw),
                Ok(PrinterEvent::Token(token)) => println!("token {token}"),
                Ok(PrinterEvent::Connection(event)) => info!("{event:?}"),
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("dropped {n} events");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

fn fmt_temp(value: Option<f64>) -> String {
    value.map_or_else(|| "-".to_string(), |v| format!("{v:.1}"))
}

async fn upload(settings: Settings, file: &Path, name: Option<String>) -> Result<()> {
    let data = tokio::fs::read(file)
        .await
        .with_context(|| format!("reading {}", file.display()))?;

    let source = if threew::is_container(&data) {
        file.to_path_buf()
    } else {
        let stem = file
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "job".to_string());
        let wrapped = std::env::temp_dir().join(format!("{stem}.3w"));
        tokio::fs::write(&wrapped, threew::encode(&data)?).await?;
        info!("Wrapped {} into {}", file.display(), wrapped.display());
        wrapped
    };

    let name = match name {
        Some(name) => name,
        None => match source.file_name() {
            Some(name) => name.to_string_lossy().into_owned(),
            None => bail!("cannot derive a file name from {}", source.display()),
        },
    };

    let printer = Printer::connect(settings).await?;
    let mut progress = printer.upload_progress();
    let reporter = tokio::spawn(async move {
        while progress.changed().await.is_ok() {
            let p = progress.borrow_and_update().clone();
            info!(
                "{:?} block {}/{} ({:.0}%)",
                p.state,
                p.block,
                p.blocks_total,
                p.fraction() * 100.0
            );
            if p.state.is_terminal() {
                break;
            }
        }
    });

    let result = printer.upload_file(&source, &name).await;
    reporter.abort();

    let report = result?;
    for warning in &report.warnings {
        warn!("{warning:?}");
    }
    println!("{}", serde_json::to_string_pretty(&report)?);
    printer.disconnect().await;
    Ok(())
}
