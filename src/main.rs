//! droidbox CLI entry point.

use clap::{Parser, Subcommand};
use droidbox::config::DroidboxConfig;
use tracing_subscriber::EnvFilter;

mod cli;

/// droidbox - QEMU worker VM supervisor for Android emulator disk surgery
#[derive(Parser, Debug)]
#[command(name = "droidbox")]
#[command(about = "QEMU worker VM supervisor for Android emulator disk surgery")]
#[command(version)]
struct Cli {
    /// Configuration file to use instead of the default location.
    #[arg(long, global = true)]
    config: Option<std::path::PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the worker VM and wait for the guest to come up.
    Start(cli::start::StartCmd),

    /// Stop the worker VM.
    Stop(cli::stop::StopCmd),

    /// Report worker VM status.
    Status(cli::status::StatusCmd),

    /// Run a shell command inside the guest.
    Exec(cli::exec::ExecCmd),

    /// Hotplug a disk image into the running VM.
    Attach(cli::attach::AttachCmd),

    /// Detach a previously hotplugged disk image.
    Eject(cli::eject::EjectCmd),

    /// Adopt a leftover worker VM from a previous run.
    Recover(cli::recover::RecoverCmd),
}

fn main() {
    let cli = Cli::parse();

    // Initialize logging based on RUST_LOG or default to warn
    init_logging();

    tracing::debug!(version = droidbox::VERSION, "starting droidbox");

    let config = match DroidboxConfig::load(cli.config.as_deref()) {
        Ok(c) => c,
        Err(e) => {
            tracing::warn!(error = %e, "failed to load config, using defaults");
            DroidboxConfig::default()
        }
    };

    let result = match cli.command {
        Commands::Start(cmd) => cmd.run(&config),
        Commands::Stop(cmd) => cmd.run(&config),
        Commands::Status(cmd) => cmd.run(&config),
        Commands::Exec(cmd) => cmd.run(&config),
        Commands::Attach(cmd) => cmd.run(&config),
        Commands::Eject(cmd) => cmd.run(&config),
        Commands::Recover(cmd) => cmd.run(&config),
    };

    if let Err(e) = result {
        tracing::error!(error = %e, "command failed");
        eprintln!("Error: {}", e);
        std::process::exit(1);
    }
}

/// Initialize the tracing subscriber.
fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("droidbox=warn"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();
}
