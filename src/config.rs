//! Global droidbox configuration.
//!
//! All paths, ports, and credentials the supervisor and session manager
//! consume live here. The file is TOML under the user config directory;
//! a missing file yields the defaults.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};

/// Application name for config file storage.
const APP_NAME: &str = "droidbox";

/// Static last-resort mount candidates, tried after the heuristics.
fn default_fallback_devices() -> Vec<String> {
    [
        "/dev/vdb2", "/dev/vdb1", "/dev/vdb", "/dev/sdb2", "/dev/sdb1", "/dev/sdb",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_mount_point() -> String {
    "/mnt/android".to_string()
}

fn default_hotplug_root() -> String {
    "/mnt/hotplug".to_string()
}

/// Global droidbox configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DroidboxConfig {
    /// Configuration format version.
    pub version: u8,

    /// Path to the QEMU system emulator binary.
    pub qemu_executable: PathBuf,

    /// Path to the worker VM boot image (drive index 0).
    pub worker_image: PathBuf,

    /// Memory in MiB passed to QEMU `-m`.
    pub memory_mib: u32,

    /// Host port forwarded to the guest's SSH port.
    pub ssh_port: u16,

    /// Localhost port for the QEMU human monitor.
    pub monitor_port: u16,

    /// SSH host (the user-mode network forwards through localhost).
    pub ssh_host: String,

    /// SSH username for the worker VM.
    pub ssh_user: String,

    /// SSH password for the worker VM.
    pub ssh_password: String,

    /// Guest mount point for the target Android filesystem.
    #[serde(default = "default_mount_point")]
    pub mount_point: String,

    /// Guest directory under which hotplugged disks are mounted.
    #[serde(default = "default_hotplug_root")]
    pub hotplug_root: String,

    /// Static device-name guesses appended after the mount heuristics.
    #[serde(default = "default_fallback_devices")]
    pub fallback_devices: Vec<String>,
}

impl Default for DroidboxConfig {
    fn default() -> Self {
        Self {
            version: 1,
            qemu_executable: PathBuf::from("qemu-system-x86_64"),
            worker_image: PathBuf::from("worker.qcow2"),
            memory_mib: 512,
            ssh_port: 10022,
            monitor_port: 4444,
            ssh_host: "127.0.0.1".to_string(),
            ssh_user: "root".to_string(),
            ssh_password: String::new(),
            mount_point: default_mount_point(),
            hotplug_root: default_hotplug_root(),
            fallback_devices: default_fallback_devices(),
        }
    }
}

impl DroidboxConfig {
    /// Default config file location (`<config dir>/droidbox/config.toml`).
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .ok_or_else(|| Error::ConfigLoad("could not determine config directory".into()))?;
        Ok(dir.join(APP_NAME).join("config.toml"))
    }

    /// Load configuration from `path`, or from the default location.
    ///
    /// A missing file returns the default configuration.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };

        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(&path)
            .map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&raw).map_err(|e| Error::ConfigLoad(format!("{}: {}", path.display(), e)))
    }

    /// Save configuration to `path`, or to the default location.
    pub fn save(&self, path: Option<&Path>) -> Result<()> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => Self::default_path()?,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::ConfigSave(format!("{}: {}", parent.display(), e)))?;
        }

        let raw = toml::to_string_pretty(self).map_err(|e| Error::ConfigSave(e.to_string()))?;
        std::fs::write(&path, raw)
            .map_err(|e| Error::ConfigSave(format!("{}: {}", path.display(), e)))
    }

    /// Socket address of the QEMU monitor port.
    pub fn monitor_addr(&self) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), self.monitor_port)
    }

    /// The exact hostfwd argument this config produces.
    ///
    /// Used both when spawning QEMU and when scanning the process table for
    /// a leftover VM that belongs to us.
    pub fn hostfwd_arg(&self) -> String {
        format!("hostfwd=tcp::{}-:22", self.ssh_port)
    }

    /// Where QEMU console output is redirected.
    pub fn qemu_log_path(&self) -> PathBuf {
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join(APP_NAME)
            .join("qemu.log")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DroidboxConfig::default();
        assert_eq!(config.memory_mib, 512);
        assert_eq!(config.ssh_port, 10022);
        assert_eq!(config.monitor_port, 4444);
        assert_eq!(config.mount_point, "/mnt/android");
        assert_eq!(config.fallback_devices.first().unwrap(), "/dev/vdb2");
    }

    #[test]
    fn test_hostfwd_arg_tracks_ssh_port() {
        let config = DroidboxConfig {
            ssh_port: 2222,
            ..Default::default()
        };
        assert_eq!(config.hostfwd_arg(), "hostfwd=tcp::2222-:22");
    }

    #[test]
    fn test_toml_round_trip() {
        let config = DroidboxConfig {
            ssh_password: "hunter2".into(),
            memory_mib: 1024,
            ..Default::default()
        };

        let raw = toml::to_string_pretty(&config).unwrap();
        let parsed: DroidboxConfig = toml::from_str(&raw).unwrap();
        assert_eq!(parsed.memory_mib, 1024);
        assert_eq!(parsed.ssh_password, "hunter2");
        assert_eq!(parsed.fallback_devices, config.fallback_devices);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let config = DroidboxConfig {
            ssh_port: 2345,
            worker_image: PathBuf::from("/images/worker.qcow2"),
            ..Default::default()
        };
        config.save(Some(&path)).unwrap();

        let loaded = DroidboxConfig::load(Some(&path)).unwrap();
        assert_eq!(loaded.ssh_port, 2345);
        assert_eq!(loaded.worker_image, PathBuf::from("/images/worker.qcow2"));
    }

    #[test]
    fn test_load_missing_file_returns_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = DroidboxConfig::load(Some(&dir.path().join("nope.toml"))).unwrap();
        assert_eq!(loaded.ssh_port, DroidboxConfig::default().ssh_port);
    }

    #[test]
    fn test_missing_optional_fields_use_defaults() {
        // Older config files lack the mount section entirely.
        let minimal = r#"
            version = 1
            qemu_executable = "/opt/qemu/qemu-system-x86_64"
            worker_image = "/opt/droidbox/worker.qcow2"
            memory_mib = 512
            ssh_port = 10022
            monitor_port = 4444
            ssh_host = "127.0.0.1"
            ssh_user = "root"
            ssh_password = ""
        "#;

        let config: DroidboxConfig = toml::from_str(minimal).unwrap();
        assert_eq!(config.mount_point, "/mnt/android");
        assert_eq!(config.hotplug_root, "/mnt/hotplug");
        assert!(!config.fallback_devices.is_empty());
    }
}
