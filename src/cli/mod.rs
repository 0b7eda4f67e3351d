//! CLI command implementations.

pub mod attach;
pub mod eject;
pub mod exec;
pub mod recover;
pub mod start;
pub mod status;
pub mod stop;

use droidbox::config::DroidboxConfig;
use droidbox::supervisor::VmSupervisor;

/// Build a supervisor and re-attach it to a worker VM left by a previous
/// invocation, if one exists. The CLI holds no state between runs; every
/// command re-discovers the VM from the OS process table.
pub fn discover_supervisor(config: &DroidboxConfig) -> VmSupervisor {
    let supervisor = VmSupervisor::new(config.clone());
    if let Some(pid) = supervisor.find_existing() {
        supervisor.adopt(pid);
    }
    supervisor
}
