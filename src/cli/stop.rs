//! Stop command implementation.

use clap::Args;
use droidbox::config::DroidboxConfig;
use droidbox::session::RemoteSessionManager;

/// Stop the worker VM.
#[derive(Args, Debug)]
pub struct StopCmd {}

impl StopCmd {
    /// Execute the stop command.
    pub fn run(self, config: &DroidboxConfig) -> droidbox::Result<()> {
        let supervisor = super::discover_supervisor(config);

        let Some(pid) = supervisor.pid() else {
            println!("No worker VM is running");
            return Ok(());
        };

        // Close the guest session cleanly before the process goes away.
        let session = RemoteSessionManager::new(config.clone());
        if session.check_health() {
            if session.connect().is_ok() {
                let _ = session.execute(&format!(
                    "umount {} 2>/dev/null || true",
                    config.mount_point
                ));
                session.close();
            }
        }

        println!("Stopping worker VM (PID: {})...", pid);
        supervisor.stop()?;
        println!("Stopped");
        Ok(())
    }
}
