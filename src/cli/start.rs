//! Start command implementation.

use clap::Args;
use droidbox::config::DroidboxConfig;
use droidbox::mount::TargetKind;
use droidbox::session::RemoteSessionManager;
use std::path::PathBuf;
use std::time::Duration;

/// Parse a duration string (e.g., "30s", "5m").
fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}

/// Start the worker VM and wait for the guest to come up.
#[derive(Args, Debug)]
pub struct StartCmd {
    /// Target emulator disk image to attach at boot (second drive).
    #[arg(long)]
    pub disk: Option<PathBuf>,

    /// Emulator product the disk comes from (ldplayer, memu, bluestacks).
    #[arg(long, default_value = "unknown")]
    pub target: String,

    /// How long to wait for guest SSH (e.g. "90s", "3m").
    #[arg(long, default_value = "90s", value_parser = parse_duration)]
    pub boot_timeout: Duration,

    /// Skip mounting the target partition after boot.
    #[arg(long)]
    pub no_mount: bool,
}

impl StartCmd {
    /// Execute the start command.
    ///
    /// A worker VM left over from a previous invocation is stopped first,
    /// so `start` always ends with a freshly booted guest.
    pub fn run(self, config: &DroidboxConfig) -> droidbox::Result<()> {
        let supervisor = super::discover_supervisor(config);
        let session = RemoteSessionManager::new(config.clone());

        if let Some(pid) = supervisor.pid() {
            println!("Stopping previous worker VM (PID: {})...", pid);
            session.close();
            supervisor.stop()?;
        }

        let pid = supervisor.start(self.disk.as_deref())?;
        println!("Worker VM started (PID: {})", pid);

        session.set_target_kind(TargetKind::parse(&self.target));

        println!(
            "Waiting for guest SSH (up to {})...",
            humantime::format_duration(self.boot_timeout)
        );
        session.wait_for_connection(self.boot_timeout)?;

        if self.disk.is_some() && !self.no_mount {
            let device = session.mount_target()?;
            println!("Target partition mounted from {}", device);
            if !session.is_target_mounted() {
                println!("Warning: mounted volume does not look like an Android system");
            }
        }

        println!("Guest ready on ssh port {}", config.ssh_port);
        Ok(())
    }
}
