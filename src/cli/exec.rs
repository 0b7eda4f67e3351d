//! Exec command implementation.

use clap::Args;
use droidbox::config::DroidboxConfig;
use droidbox::error::Error;
use droidbox::session::RemoteSessionManager;

/// Run a shell command inside the guest.
#[derive(Args, Debug)]
pub struct ExecCmd {
    /// Command to execute.
    #[arg(trailing_var_arg = true, required = true)]
    pub command: Vec<String>,

    /// Print exit status and keep stdout/stderr separate.
    #[arg(long)]
    pub full: bool,
}

impl ExecCmd {
    /// Execute the exec command.
    pub fn run(self, config: &DroidboxConfig) -> droidbox::Result<()> {
        let supervisor = super::discover_supervisor(config);
        if !supervisor.is_running() {
            return Err(Error::VmNotRunning);
        }

        let session = RemoteSessionManager::new(config.clone());
        session.connect()?;

        let cmd = self.command.join(" ");
        if self.full {
            let out = session.execute_full(&cmd)?;
            session.close();
            if !out.stdout.is_empty() {
                print!("{}", out.stdout);
            }
            if !out.stderr.is_empty() {
                eprint!("{}", out.stderr);
            }
            std::process::exit(out.exit_status);
        }

        let out = session.execute(&cmd)?;
        session.close();
        println!("{}", out);
        Ok(())
    }
}
