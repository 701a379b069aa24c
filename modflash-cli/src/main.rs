//! modflash CLI - firmware updater for USB-serial robotics modules.
//!
//! ## Features
//!
//! - Concurrent update of every connected network/camera module
//! - Per-device and aggregate progress bars
//! - Port listing with USB metadata
//! - Shell completion generation
//! - Environment variable support

use std::io;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgAction, CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use console::style;
use env_logger::Env;
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use log::debug;
use modflash::{
    MultiUpdater, NativePort, SerialConfig, UpdateEventSink, VersionCatalog,
    MAX_CONCURRENT_UPDATES,
};

/// modflash - concurrent firmware updater for USB-serial modules.
///
/// Environment variables:
///   MODFLASH_FIRMWARE_ROOT   - Default firmware image directory
///   MODFLASH_CATALOG         - Default version catalog file
#[derive(Parser)]
#[command(name = "modflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Update the firmware of connected modules.
    Update {
        /// Directory holding the firmware images.
        #[arg(long, env = "MODFLASH_FIRMWARE_ROOT")]
        firmware_root: PathBuf,

        /// Version catalog JSON file (network/camera app versions).
        #[arg(long, env = "MODFLASH_CATALOG")]
        catalog: PathBuf,

        /// Serial port to update (repeatable; defaults to every detected
        /// module port).
        #[arg(short, long = "port")]
        ports: Vec<String>,
    },

    /// List available serial ports.
    ListPorts {
        /// Output the port list as JSON to stdout.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell to generate completions for.
        #[arg(value_enum)]
        shell: Shell,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    if std::env::var("NO_COLOR").is_ok() || !console::Term::stderr().is_term() {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    debug!("modflash v{}", env!("CARGO_PKG_VERSION"));

    match &cli.command {
        Commands::Update {
            firmware_root,
            catalog,
            ports,
        } => cmd_update(&cli, firmware_root, catalog, ports),
        Commands::ListPorts { json } => {
            cmd_list_ports(*json);
            Ok(())
        }
        Commands::Completions { shell } => {
            cmd_completions(*shell);
            Ok(())
        }
    }
}

/// Per-device progress rendering backed by indicatif.
struct ProgressSink {
    // Held so the shared draw state outlives the bars.
    _multi: MultiProgress,
    total: ProgressBar,
    devices: Vec<ProgressBar>,
}

impl ProgressSink {
    fn new(device_count: usize, quiet: bool) -> Self {
        let multi = if quiet || !console::Term::stderr().is_term() {
            MultiProgress::with_draw_target(ProgressDrawTarget::hidden())
        } else {
            MultiProgress::with_draw_target(ProgressDrawTarget::stderr())
        };

        #[allow(clippy::unwrap_used)] // Static template strings
        let device_style = ProgressStyle::default_bar()
            .template("{prefix:>12} [{bar:30.cyan/blue}] {pos:>3}% {msg}")
            .unwrap()
            .progress_chars("#>-");
        #[allow(clippy::unwrap_used)]
        let total_style = ProgressStyle::default_bar()
            .template("{prefix:>12} [{bar:30.green/blue}] {pos:>3}% {msg}")
            .unwrap()
            .progress_chars("#>-");

        let devices = (0..device_count)
            .map(|i| {
                let bar = multi.add(ProgressBar::new(100));
                bar.set_style(device_style.clone());
                bar.set_prefix(format!("device {i}"));
                bar
            })
            .collect();

        let total = multi.add(ProgressBar::new(100));
        total.set_style(total_style);
        total.set_prefix("total");

        Self {
            _multi: multi,
            total,
            devices,
        }
    }

    fn finish(&self) {
        for bar in &self.devices {
            if !bar.is_finished() {
                bar.finish();
            }
        }
        self.total.finish();
    }
}

impl UpdateEventSink for ProgressSink {
    fn device_uuid(&mut self, index: usize, uuid: &str) {
        if let Some(bar) = self.devices.get(index) {
            bar.set_prefix(uuid.to_string());
        }
    }

    fn device_progress(&mut self, index: usize, percent: u8) {
        if let Some(bar) = self.devices.get(index) {
            bar.set_position(u64::from(percent));
        }
    }

    fn device_state(&mut self, index: usize, state: i32) {
        if let Some(bar) = self.devices.get(index) {
            if state == 0 {
                bar.set_position(100);
                bar.finish_with_message(style("ok").green().to_string());
            } else {
                bar.abandon_with_message(style("failed").red().to_string());
            }
        }
    }

    fn device_error(&mut self, index: usize, message: &str) {
        if let Some(bar) = self.devices.get(index) {
            bar.set_message(style(message.to_string()).red().to_string());
        }
    }

    fn total_progress(&mut self, percent: u8) {
        self.total.set_position(u64::from(percent));
    }

    fn total_status(&mut self, status: &str) {
        self.total.set_message(status.to_string());
    }
}

/// Update command implementation.
fn cmd_update(
    cli: &Cli,
    firmware_root: &PathBuf,
    catalog_path: &PathBuf,
    ports: &[String],
) -> Result<()> {
    let catalog = VersionCatalog::from_file(catalog_path)
        .with_context(|| format!("failed to load catalog {}", catalog_path.display()))?;

    if !cli.quiet {
        eprintln!(
            "{} network v{}, camera v{}",
            style("Firmware:").bold(),
            catalog.network.app,
            catalog.camera.app
        );
    }

    let ports: Vec<String> = if ports.is_empty() {
        modflash::discover_module_ports()
            .into_iter()
            .map(|p| p.name)
            .collect()
    } else {
        ports.to_vec()
    };

    if ports.is_empty() {
        anyhow::bail!("no module port is connected");
    }

    if !cli.quiet {
        for port in &ports {
            eprintln!("  {} {}", style("•").green(), style(port).cyan());
        }
    }

    let mut supervisor = MultiUpdater::new(firmware_root);
    let mut sink = ProgressSink::new(ports.len().min(MAX_CONCURRENT_UPDATES), cli.quiet);

    let outcomes = supervisor.run(
        &ports,
        |name| NativePort::open(SerialConfig::module(name)),
        &catalog,
        &mut sink,
    )?;
    sink.finish();

    let mut failures = 0usize;
    for outcome in &outcomes {
        let device = outcome
            .uuid
            .map_or_else(|| outcome.port.clone(), |uuid| format!("0x{uuid:X}"));
        if outcome.ok {
            if !cli.quiet {
                eprintln!("{} {} updated", style("✓").green().bold(), device);
            }
        } else {
            failures += 1;
            eprintln!(
                "{} {} failed: {}",
                style("✗").red().bold(),
                device,
                outcome.message
            );
        }
    }

    if failures > 0 {
        anyhow::bail!("{failures} of {} update(s) failed", outcomes.len());
    }

    if !cli.quiet {
        eprintln!("\n{} {}", style("🎉").green().bold(), "All modules updated");
    }
    Ok(())
}

/// List ports command implementation.
fn cmd_list_ports(json: bool) {
    let detected = modflash::detect_ports();

    if json {
        let ports: Vec<serde_json::Value> = detected
            .iter()
            .map(|p| {
                serde_json::json!({
                    "name": p.name,
                    "device": p.device.name(),
                    "known": p.device.is_known(),
                    "vid": p.vid,
                    "pid": p.pid,
                    "manufacturer": p.manufacturer,
                    "product": p.product,
                    "serial": p.serial,
                })
            })
            .collect();
        println!(
            "{}",
            serde_json::to_string_pretty(&ports).unwrap_or_default()
        );
        return;
    }

    eprintln!("{}", style("Available ports").bold().underlined());

    if detected.is_empty() {
        eprintln!("  {}", style("no serial ports found").dim());
        return;
    }

    for port in &detected {
        let device_type = if port.device.is_known() {
            format!(" [{}]", style(port.device.name()).yellow())
        } else {
            String::new()
        };

        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };

        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{}{}{}",
            style("•").green(),
            style(&port.name).cyan(),
            device_type,
            vid_pid,
            product
        );
    }
}

/// Generate shell completions.
fn cmd_completions(shell: Shell) {
    let mut cmd = Cli::command();
    let name = cmd.get_name().to_string();
    generate(shell, &mut cmd, name, &mut io::stdout());
}
