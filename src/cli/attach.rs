//! Attach command implementation.

use clap::Args;
use droidbox::config::DroidboxConfig;
use droidbox::hotplug::HotplugCoordinator;
use droidbox::session::RemoteSessionManager;
use std::path::PathBuf;

/// Hotplug a disk image into the running VM.
#[derive(Args, Debug)]
pub struct AttachCmd {
    /// Host disk image to attach (raw/qcow2/vmdk/vhd/vhdx/vdi).
    pub image: PathBuf,
}

impl AttachCmd {
    /// Execute the attach command.
    pub fn run(self, config: &DroidboxConfig) -> droidbox::Result<()> {
        let supervisor = super::discover_supervisor(config);
        let session = RemoteSessionManager::new(config.clone());
        session.connect()?;

        let coordinator = HotplugCoordinator::new(config.hotplug_root.clone());
        let handle = supervisor.hotplug_attach(&coordinator, &session, &self.image)?;
        session.close();

        println!(
            "Attached {} as guest disk {} (id: {})",
            self.image.display(),
            handle.guest_device,
            handle.id
        );
        for mount in &handle.partition_mounts {
            if mount.mounted {
                println!("  {} mounted at {}", mount.device, mount.mount_path);
            } else {
                println!("  {} failed to mount", mount.device);
            }
        }
        Ok(())
    }
}
