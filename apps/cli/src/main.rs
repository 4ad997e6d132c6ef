//! hotvol - Removable-volume hotplug daemon.
//!
//! The daemon subcommand runs the receive loop against the kernel uevent
//! socket; inject pushes a synthetic event through the same dispatch path,
//! which is handy for exercising a config without real hardware.

mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Default config location.
const DEFAULT_CONFIG: &str = "/etc/hotvol.json";

/// Removable-volume hotplug lifecycle manager.
#[derive(Parser)]
#[command(name = "hotvol")]
#[command(about = "Removable-volume hotplug lifecycle manager", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the hotplug daemon: receive kernel uevents and drive the
    /// configured volumes through their lifecycle.
    Daemon {
        /// Path to the volume configuration file.
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
    },
    /// Inject one simulated uevent through the normal dispatch path.
    Inject {
        /// Path to the volume configuration file.
        #[arg(long, default_value = DEFAULT_CONFIG)]
        config: PathBuf,
        /// Subsystem of the simulated event (e.g. "block").
        subsystem: String,
        /// Device path of the simulated event.
        devpath: String,
        /// Event action: add, remove or change.
        action: String,
        /// Additional KEY=VALUE parameters.
        params: Vec<String>,
    },
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Daemon { config } => daemon::run_daemon(&config),
        Commands::Inject {
            config,
            subsystem,
            devpath,
            action,
            params,
        } => daemon::run_inject(&config, &subsystem, &devpath, &action, &params),
    };

    if let Err(e) = result {
        eprintln!("hotvol error: {}", e);
        std::process::exit(1);
    }
}
