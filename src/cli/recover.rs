//! Recover command implementation.

use clap::Args;
use droidbox::config::DroidboxConfig;
use droidbox::session::RemoteSessionManager;
use droidbox::supervisor::VmSupervisor;

/// Adopt a leftover worker VM from a previous run.
#[derive(Args, Debug)]
pub struct RecoverCmd {}

impl RecoverCmd {
    /// Execute the recover command.
    ///
    /// Scans the process table for a worker VM matching this configuration
    /// and probes it over SSH. A healthy one is adopted; an unresponsive
    /// one is terminated so the next `start` gets a clean slate.
    pub fn run(self, config: &DroidboxConfig) -> droidbox::Result<()> {
        let supervisor = VmSupervisor::new(config.clone());
        let session = RemoteSessionManager::new(config.clone());

        if supervisor.recover(&session) {
            session.close();
            println!(
                "Recovered worker VM (PID: {})",
                supervisor.pid().unwrap_or(0)
            );
        } else {
            println!("No recoverable worker VM found");
        }
        Ok(())
    }
}
