//! Error types for droidbox.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using droidbox's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in droidbox operations.
#[derive(Error, Debug)]
pub enum Error {
    // Supervisor errors
    /// A worker VM is already running.
    #[error("a worker VM is already running (pid {pid}); stop it first")]
    AlreadyRunning {
        /// PID of the running VM.
        pid: u32,
    },

    /// The forwarded SSH port is bound by another process.
    #[error("port {port} is already in use by another process")]
    PortConflict {
        /// The contested host port.
        port: u16,
    },

    /// The QEMU executable or the worker boot image is missing.
    #[error("missing asset: {}", path.display())]
    MissingAsset {
        /// Path that was not found.
        path: PathBuf,
    },

    /// No worker VM is running.
    #[error("no worker VM is running")]
    VmNotRunning,

    // Session errors
    /// SSH authentication failed.
    #[error("ssh authentication failed: {0}")]
    Auth(String),

    /// Could not establish the SSH connection.
    #[error("ssh connection failed: {0}")]
    Connect(String),

    /// A deadline elapsed before the operation completed.
    #[error("timed out after {secs} seconds: {what}")]
    Timeout {
        /// What was being waited for.
        what: String,
        /// The elapsed budget.
        secs: u64,
    },

    /// No persistent session exists.
    #[error("not connected; call connect() or wait_for_connection() first")]
    NotConnected,

    /// Every mount candidate failed verification.
    #[error("failed to mount any of {candidates:?} at {mount_point}")]
    MountFailed {
        /// All candidates that were attempted, in order.
        candidates: Vec<String>,
        /// Guest mount point.
        mount_point: String,
    },

    // Hotplug errors
    /// The monitor channel could not be used.
    #[error("monitor command failed: {0}")]
    ControlChannel(String),

    /// The guest never reported a new disk after attach.
    #[error("no new guest disk appeared within {attempts} polls after attaching {}", path.display())]
    DiskNotDetected {
        /// Host disk image that was attached.
        path: PathBuf,
        /// How many polls were made.
        attempts: u32,
    },

    /// Nothing on the attached disk could be mounted.
    #[error("no mountable volumes on {device}")]
    NoMountableVolumes {
        /// Discovered guest device.
        device: String,
    },

    /// The host disk image does not exist.
    #[error("invalid path: {}", path.display())]
    InvalidPath {
        /// The rejected path.
        path: PathBuf,
    },

    // Configuration errors
    /// Failed to load configuration.
    #[error("failed to load config: {0}")]
    ConfigLoad(String),

    /// Failed to save configuration.
    #[error("failed to save config: {0}")]
    ConfigSave(String),

    // IO errors
    /// IO error wrapper.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create an auth error with a message.
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Auth(msg.into())
    }

    /// Create a connect error with a message.
    pub fn connect(msg: impl Into<String>) -> Self {
        Self::Connect(msg.into())
    }

    /// Create a control-channel error with a message.
    pub fn control_channel(msg: impl Into<String>) -> Self {
        Self::ControlChannel(msg.into())
    }

    /// Create a timeout error.
    pub fn timeout(what: impl Into<String>, secs: u64) -> Self {
        Self::Timeout {
            what: what.into(),
            secs,
        }
    }

    /// Create a missing-asset error.
    pub fn missing_asset(path: impl Into<PathBuf>) -> Self {
        Self::MissingAsset { path: path.into() }
    }
}
