//! ambit-sync CLI: command-line sync tool for Suunto Ambit watches.

use ambit_sync_core::device::{discover_devices, DiscoveredDevice};
use ambit_sync_core::driver::{LogSink, OrbitWriteOutcome, Progress};
use ambit_sync_core::pmem20::{LogEntry, LogHeader};
use ambit_sync_core::{Config, Session};
use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "ambit-sync", version, about = "Sync Suunto Ambit GPS watches over USB")]
struct Cli {
    /// JSON configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Log filter, e.g. "debug" or "ambit_sync_core=trace". Defaults to RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Serial number of the watch to use when several are connected.
    #[arg(long, global = true)]
    serial: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List connected Ambit watches.
    ListDevices,
    /// Show model, serial and firmware of the watch.
    Info,
    /// Show battery charge.
    Status,
    /// Set the watch clock to the host's local time.
    SetTime,
    /// Dump the personal settings block as hex.
    Settings,
    /// Read log entries and print them as JSON lines.
    ReadLogs {
        /// Skip entries recorded at or before this time ("YYYY-MM-DD" or "YYYY-MM-DD HH:MM:SS").
        #[arg(long, value_parser = parse_since)]
        since: Option<NaiveDateTime>,
    },
    /// Show the header of the GPS orbit data on the watch.
    OrbitHeader,
    /// Upload GPS orbit (SGEE) data.
    WriteOrbit {
        /// Orbit data file.
        file: PathBuf,
    },
}

fn parse_since(value: &str) -> std::result::Result<NaiveDateTime, String> {
    if let Ok(time) = NaiveDateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S") {
        return Ok(time);
    }
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .ok_or_else(|| format!("invalid time '{value}', expected YYYY-MM-DD[ HH:MM:SS]"))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(" ")
}

/// Prints pushed entries as JSON lines and skips entries older than `since`.
struct PrintSink {
    since: Option<NaiveDateTime>,
}

impl LogSink for PrintSink {
    fn skip(&mut self, header: &LogHeader) -> bool {
        let Some(since) = self.since else {
            return false;
        };
        match header.date_time.to_naive() {
            Ok(recorded) => recorded <= since,
            Err(e) => {
                tracing::warn!(error = %e, "Entry has an invalid timestamp, reading it anyway");
                false
            }
        }
    }

    fn push(&mut self, entry: LogEntry) {
        let line = serde_json::json!({
            "header": entry.header,
            "body_len": entry.body.len(),
        });
        println!("{line}");
    }

    fn progress(&mut self, progress: Progress) {
        tracing::info!(
            done = progress.done,
            total = progress.total,
            "Log read {}%",
            progress.percent()
        );
    }
}

fn select_device(serial: Option<&str>) -> Result<DiscoveredDevice> {
    let devices = discover_devices()?;
    let device = match serial {
        Some(serial) => devices
            .into_iter()
            .find(|d| d.serial.as_deref() == Some(serial))
            .ok_or_else(|| anyhow::anyhow!("No Ambit watch with serial {serial} found"))?,
        None => devices
            .into_iter()
            .next()
            .ok_or_else(|| anyhow::anyhow!("No supported Ambit watch found"))?,
    };
    Ok(device)
}

fn open_session(cli: &Cli, config: &Config) -> Result<Session> {
    let device = select_device(cli.serial.as_deref())?;
    Session::open_hid(&device, config)
        .with_context(|| format!("open watch at {}", device.path))
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match &cli.log_level {
        Some(level) => EnvFilter::try_new(level).context("invalid --log-level")?,
        None => EnvFilter::from_default_env(),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    match &cli.command {
        Commands::ListDevices => {
            let devices = discover_devices()?;
            if devices.is_empty() {
                println!("No Ambit watches found.");
                println!("Ensure the watch is connected and udev rules allow access.");
            } else {
                for dev in &devices {
                    println!(
                        "VID: 0x{:04X}, PID: 0x{:04X}, serial: {}, path: {}",
                        dev.vendor_id,
                        dev.product_id,
                        dev.serial.as_deref().unwrap_or("-"),
                        dev.path
                    );
                }
            }
        }
        Commands::Info => {
            let session = open_session(&cli, &config)?;
            println!("{}", session.device().name);
            println!("{}", serde_json::to_string_pretty(session.info())?);
            println!("Capabilities: {:?}", session.capabilities());
        }
        Commands::Status => {
            let mut session = open_session(&cli, &config)?;
            let status = session.status()?;
            println!("Charge: {}%", status.charge);
        }
        Commands::SetTime => {
            let mut session = open_session(&cli, &config)?;
            let set = session.sync_time()?;
            println!("Clock set to {set}");
        }
        Commands::Settings => {
            let mut session = open_session(&cli, &config)?;
            let settings = session.personal_settings()?;
            println!("{}", hex(&settings.raw));
        }
        Commands::ReadLogs { since } => {
            let mut session = open_session(&cli, &config)?;
            let mut sink = PrintSink { since: *since };
            let pushed = session.read_logs(&mut sink)?;
            eprintln!("Read {pushed} entries");
        }
        Commands::OrbitHeader => {
            let mut session = open_session(&cli, &config)?;
            let header = session.gps_orbit_header()?;
            println!("{}", hex(&header));
        }
        Commands::WriteOrbit { file } => {
            let data = std::fs::read(file).with_context(|| format!("read {}", file.display()))?;
            let mut session = open_session(&cli, &config)?;
            match session.write_gps_orbit(&data)? {
                OrbitWriteOutcome::AlreadyCurrent => println!("GPS orbit data already up to date"),
                OrbitWriteOutcome::Written(write) => println!(
                    "Wrote {} bytes in {} pages at 0x{:08X}",
                    write.bytes_written, write.pages, write.start_address
                ),
            }
        }
    }

    Ok(())
}
