//! Eject command implementation.

use clap::Args;
use droidbox::config::DroidboxConfig;
use droidbox::hotplug::HotplugCoordinator;
use droidbox::session::RemoteSessionManager;
use std::path::PathBuf;

/// Detach a previously hotplugged disk image.
///
/// The id is deterministic per host path, so ejecting by the original
/// image path works across CLI invocations.
#[derive(Args, Debug)]
pub struct EjectCmd {
    /// Host disk image that was attached.
    pub image: PathBuf,
}

impl EjectCmd {
    /// Execute the eject command.
    pub fn run(self, config: &DroidboxConfig) -> droidbox::Result<()> {
        let supervisor = super::discover_supervisor(config);
        let session = RemoteSessionManager::new(config.clone());
        session.connect()?;

        let coordinator = HotplugCoordinator::new(config.hotplug_root.clone());
        let id = coordinator.id_for(&self.image);
        supervisor.hotplug_eject(&coordinator, &session, &id)?;
        session.close();

        println!("Ejected {} (id: {})", self.image.display(), id);
        Ok(())
    }
}
