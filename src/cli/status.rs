//! Status command implementation.

use clap::Args;
use droidbox::config::DroidboxConfig;
use droidbox::session::RemoteSessionManager;

/// Report worker VM status.
#[derive(Args, Debug)]
pub struct StatusCmd {
    /// Also probe the guest over SSH (slower, but distinguishes a booting
    /// VM from a ready one).
    #[arg(long)]
    pub probe: bool,
}

impl StatusCmd {
    /// Execute the status command.
    ///
    /// Three states: `stopped` (no process), `starting` (process alive but
    /// the guest does not answer over SSH yet), `running` (guest answers).
    /// Without `--probe` a live process is reported as `running`.
    pub fn run(self, config: &DroidboxConfig) -> droidbox::Result<()> {
        let supervisor = super::discover_supervisor(config);

        let Some(pid) = supervisor.pid() else {
            println!("stopped");
            return Ok(());
        };

        if self.probe {
            let session = RemoteSessionManager::new(config.clone());
            if session.check_health() {
                println!("running (PID: {})", pid);
            } else {
                println!("starting (PID: {})", pid);
            }
        } else {
            println!("running (PID: {})", pid);
        }
        Ok(())
    }
}
