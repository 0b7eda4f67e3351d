//! droidbox: supervision of a QEMU worker VM used to open and edit Android
//! emulator disk images.
//!
//! The crate is built around four long-lived services:
//!
//! - [`supervisor::VmSupervisor`] owns the QEMU process itself (spawn,
//!   liveness, graceful stop, orphan recovery).
//! - [`monitor::MonitorClient`] speaks the QEMU human-monitor protocol over
//!   localhost TCP for administrative commands.
//! - [`session::RemoteSessionManager`] holds the one persistent SSH session
//!   into the guest and the target-partition mount state.
//! - [`hotplug::HotplugCoordinator`] attaches secondary disk images into the
//!   running VM and discovers them guest-side.
//!
//! All I/O is synchronous and bounded by per-operation timeouts; there is
//! exactly one VM and one remote session per process.

pub mod config;
pub mod error;
pub mod hotplug;
pub mod monitor;
pub mod mount;
pub mod retry;
pub mod session;
pub mod supervisor;

pub use error::{Error, Result};

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
