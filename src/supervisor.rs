//! Worker VM process lifecycle management.
//!
//! The supervisor owns exactly one QEMU process at a time: either a child it
//! spawned, or a process id it adopted after discovering a leftover VM from
//! a previous run. Liveness and termination branch internally on that
//! distinction; callers only see `is_running`, `pid`, `start`, `stop`.

use crate::config::DroidboxConfig;
use crate::error::{Error, Result};
use crate::hotplug::{DiskFormat, HotplugCoordinator, HotplugHandle};
use crate::monitor::MonitorClient;
use crate::session::RemoteSessionManager;
use parking_lot::Mutex;
use std::net::TcpListener;
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};
use sysinfo::System;

/// Grace window between SIGTERM and SIGKILL.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// The supervised QEMU process.
///
/// `Owned` holds the handle of a child we spawned; `Adopted` is a bare pid
/// recovered from the OS process table. The two are mutually exclusive.
enum VmProcess {
    Owned(Child),
    Adopted(libc::pid_t),
}

impl VmProcess {
    fn pid(&self) -> u32 {
        match self {
            VmProcess::Owned(child) => child.id(),
            VmProcess::Adopted(pid) => *pid as u32,
        }
    }

    /// Whether the process is still alive.
    fn is_alive(&mut self) -> bool {
        match self {
            VmProcess::Owned(child) => matches!(child.try_wait(), Ok(None)),
            // Signal 0 probes existence without delivering anything.
            VmProcess::Adopted(pid) => unsafe { libc::kill(*pid, 0) == 0 },
        }
    }

    /// Graceful termination: SIGTERM, wait out the grace window, SIGKILL.
    fn shutdown(mut self, grace: Duration) {
        let pid = self.pid();

        match &mut self {
            VmProcess::Owned(child) => {
                unsafe {
                    libc::kill(child.id() as libc::pid_t, libc::SIGTERM);
                }
                if wait_for_exit(&mut self, grace) {
                    tracing::info!(pid, "worker VM stopped");
                    return;
                }
                tracing::warn!(pid, "worker VM did not exit in time, force-killing");
                if let VmProcess::Owned(child) = &mut self {
                    let _ = child.kill();
                    let _ = child.wait();
                }
            }
            VmProcess::Adopted(raw) => {
                let raw = *raw;
                unsafe {
                    libc::kill(raw, libc::SIGTERM);
                }
                if wait_for_exit(&mut self, grace) {
                    tracing::info!(pid, "adopted worker VM stopped");
                    return;
                }
                tracing::warn!(pid, "adopted worker VM did not exit in time, force-killing");
                unsafe {
                    libc::kill(raw, libc::SIGKILL);
                }
            }
        }
    }
}

/// Poll until the process exits or `grace` elapses.
fn wait_for_exit(process: &mut VmProcess, grace: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < grace {
        if !process.is_alive() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(100));
    }
    !process.is_alive()
}

/// Terminate an arbitrary pid with the same grace-then-kill sequence.
fn terminate_pid(pid: u32, grace: Duration) {
    VmProcess::Adopted(pid as libc::pid_t).shutdown(grace);
}

/// Supervisor for the worker VM's OS process.
pub struct VmSupervisor {
    config: DroidboxConfig,
    slot: Mutex<Option<VmProcess>>,
}

impl VmSupervisor {
    /// Create a supervisor with no process attached.
    pub fn new(config: DroidboxConfig) -> Self {
        Self {
            config,
            slot: Mutex::new(None),
        }
    }

    /// PID of the supervised process, if any.
    pub fn pid(&self) -> Option<u32> {
        self.slot.lock().as_ref().map(VmProcess::pid)
    }

    /// Whether the supervised process is alive.
    ///
    /// A dead process is lazily cleared from the slot, so a crashed VM never
    /// blocks a later `start()`.
    pub fn is_running(&self) -> bool {
        let mut slot = self.slot.lock();
        let alive = slot.as_mut().is_some_and(|process| process.is_alive());
        if !alive {
            *slot = None;
        }
        alive
    }

    /// Return true if `port` on localhost is already bound by another
    /// process, determined by attempting a bind.
    pub fn is_port_in_use(port: u16) -> bool {
        TcpListener::bind(("127.0.0.1", port)).is_err()
    }

    /// Spawn the worker VM and return its PID immediately.
    ///
    /// Does NOT wait for the guest to boot; that is the session manager's
    /// `wait_for_connection`. `target_disk` is optionally attached as drive
    /// index 1 so the target image is visible at first boot.
    pub fn start(&self, target_disk: Option<&Path>) -> Result<u32> {
        {
            let mut slot = self.slot.lock();
            if let Some(process) = slot.as_mut() {
                if process.is_alive() {
                    return Err(Error::AlreadyRunning {
                        pid: process.pid(),
                    });
                }
                *slot = None;
            }
        }

        if Self::is_port_in_use(self.config.ssh_port) {
            return Err(Error::PortConflict {
                port: self.config.ssh_port,
            });
        }

        if !self.config.qemu_executable.is_file() {
            return Err(Error::missing_asset(&self.config.qemu_executable));
        }
        if !self.config.worker_image.is_file() {
            return Err(Error::missing_asset(&self.config.worker_image));
        }

        let mut cmd = Command::new(&self.config.qemu_executable);
        cmd.arg("-m")
            .arg(self.config.memory_mib.to_string())
            .arg("-nographic")
            .arg("-net")
            .arg(format!("user,{}", self.config.hostfwd_arg()))
            .arg("-net")
            .arg("nic")
            .arg("-monitor")
            .arg(format!(
                "tcp:127.0.0.1:{},server,nowait",
                self.config.monitor_port
            ))
            .arg("-device")
            .arg("virtio-scsi-pci,id=scsi0")
            .arg("-drive")
            .arg(format!(
                "file={},format=qcow2,if=virtio,index=0",
                self.config.worker_image.display()
            ));

        if let Some(disk) = target_disk {
            if !disk.is_file() {
                return Err(Error::InvalidPath {
                    path: disk.to_path_buf(),
                });
            }
            cmd.arg("-drive").arg(format!(
                "file={},format={},if=virtio,index=1",
                disk.display(),
                DiskFormat::from_path(disk)
            ));
        }

        // Console output goes to a log file for post-mortem debugging.
        let log_path = self.config.qemu_log_path();
        if let Some(parent) = log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let log = std::fs::File::create(&log_path)?;
        cmd.stdin(Stdio::null())
            .stdout(log.try_clone()?)
            .stderr(log);

        let child = cmd.spawn()?;
        let pid = child.id();
        tracing::info!(pid, console = %log_path.display(), "worker VM started");

        *self.slot.lock() = Some(VmProcess::Owned(child));
        Ok(pid)
    }

    /// Stop the supervised process.
    ///
    /// No-op when nothing is running. Always leaves the slot cleared, even
    /// when termination misbehaves, so a stuck process cannot block future
    /// `start()` calls.
    pub fn stop(&self) -> Result<()> {
        let process = self.slot.lock().take();
        match process {
            Some(process) => {
                let pid = process.pid();
                tracing::info!(pid, "stopping worker VM");
                process.shutdown(STOP_GRACE);
            }
            None => {
                tracing::warn!("stop() called but no worker VM is running");
            }
        }
        Ok(())
    }

    /// Adopt an externally-discovered pid as the supervised process.
    pub fn adopt(&self, pid: u32) {
        tracing::info!(pid, "adopted existing worker VM");
        *self.slot.lock() = Some(VmProcess::Adopted(pid as libc::pid_t));
    }

    /// Scan the OS process table for a leftover worker VM that belongs to
    /// this configuration.
    ///
    /// A match needs both the QEMU executable name and the exact hostfwd
    /// argument this application would have used; that distinguishes "our"
    /// orphan from an unrelated QEMU instance.
    pub fn find_existing(&self) -> Option<u32> {
        let needle = self.config.hostfwd_arg();
        let exe_name = self
            .config
            .qemu_executable
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "qemu-system-x86_64".into());

        let mut sys = System::new();
        sys.refresh_processes();

        for (pid, process) in sys.processes() {
            if !process.name().to_lowercase().contains(exe_name.as_str()) {
                continue;
            }
            if process.cmd().iter().any(|arg| arg.contains(&needle)) {
                return Some(pid.as_u32());
            }
        }
        None
    }

    /// Try to adopt a leftover worker VM from a previous run.
    ///
    /// Probes it over SSH first; a healthy VM is reused as-is (the caller
    /// re-establishes the target mount lazily), an unresponsive one is
    /// terminated so no zombie lingers. Returns true on successful adoption.
    pub fn recover(&self, session: &RemoteSessionManager) -> bool {
        let Some(pid) = self.find_existing() else {
            return false;
        };

        tracing::info!(pid, "found existing worker VM, probing");

        if session.check_health() {
            match session.connect() {
                Ok(()) => {
                    self.adopt(pid);
                    tracing::info!(pid, "recovered existing worker VM session");
                    return true;
                }
                Err(e) => {
                    tracing::error!(pid, error = %e, "healthy VM but ssh connect failed");
                }
            }
        } else {
            tracing::warn!(pid, "existing worker VM is unresponsive over ssh");
        }

        // Found but unverifiable: kill it so the next start gets a clean slate.
        tracing::info!(pid, "terminating orphaned worker VM");
        terminate_pid(pid, STOP_GRACE);
        false
    }

    /// Hotplug a secondary disk into the running VM.
    ///
    /// The running-VM precondition lives here rather than in the
    /// coordinator: only the supervisor knows whether a monitor endpoint
    /// exists to talk to.
    pub fn hotplug_attach(
        &self,
        coordinator: &HotplugCoordinator,
        session: &RemoteSessionManager,
        host_path: &Path,
    ) -> Result<HotplugHandle> {
        if !self.is_running() {
            return Err(Error::VmNotRunning);
        }
        let monitor = MonitorClient::new(self.config.monitor_addr());
        session.with_exec(|exec| coordinator.attach(&monitor, exec, host_path))
    }

    /// Detach a previously hotplugged disk.
    pub fn hotplug_eject(
        &self,
        coordinator: &HotplugCoordinator,
        session: &RemoteSessionManager,
        id: &str,
    ) -> Result<()> {
        if !self.is_running() {
            return Err(Error::VmNotRunning);
        }
        let monitor = MonitorClient::new(self.config.monitor_addr());
        session.with_exec(|exec| {
            coordinator.eject(&monitor, exec, id);
            Ok(())
        })
    }
}

impl Drop for VmSupervisor {
    fn drop(&mut self) {
        // Owned children must not outlive the supervisor unreaped; adopted
        // processes are deliberately left alone (they survive restarts).
        let process = self.slot.lock().take();
        if let Some(VmProcess::Owned(child)) = process {
            VmProcess::Owned(child).shutdown(STOP_GRACE);
        }
    }
}
