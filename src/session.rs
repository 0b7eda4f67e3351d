//! Persistent SSH session into the worker VM's guest OS.
//!
//! One authenticated session process-wide. Health probes never touch it:
//! they open and tear down their own short-timeout connection so liveness
//! can be tested without disturbing whatever the persistent session is in
//! the middle of.

use crate::config::DroidboxConfig;
use crate::error::{Error, Result};
use crate::mount::{self, TargetKind};
use crate::retry::Deadline;
use parking_lot::Mutex;
use ssh2::Session;
use std::io::Read;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Fixed string echoed by the health probe; the probe passes only on an
/// exact match.
const HEALTH_SENTINEL: &str = "droidbox-health-ok";

/// Budget for the out-of-band health probe connection.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// TCP + handshake budget for the persistent connection.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Blocking-operation timeout on the persistent session, bounding each
/// `execute` call.
const EXEC_TIMEOUT: Duration = Duration::from_secs(30);

/// Sleep between attempts while waiting out guest boot.
const BOOT_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Command execution in the guest.
///
/// The seam that lets mount selection and hotplug logic run against a
/// scripted guest in tests.
pub trait GuestExec {
    /// Run one shell command, returning combined stdout+stderr, trimmed.
    fn exec(&mut self, cmd: &str) -> Result<String>;
}

/// Output of a remote command with the streams kept apart.
///
/// `execute()` collapses this into one combined string, which is what the
/// established callers parse; new call sites that care about exit status
/// use `execute_full()`.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
    /// Remote exit status, -1 when it could not be collected.
    pub exit_status: i32,
}

impl ExecOutput {
    /// stdout and stderr concatenated and trimmed, the coarse form the
    /// long-standing callers parse.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr).trim().to_string()
    }
}

/// Result of `ensure_ready` for callers racing to establish the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// The persistent session exists and the target mount was attempted.
    Ready,
    /// Another caller is currently connecting and mounting; try again later.
    Establishing,
}

/// An open, authenticated SSH connection.
struct SshSession {
    inner: Session,
}

impl SshSession {
    fn run(&self, cmd: &str) -> Result<ExecOutput> {
        tracing::debug!(cmd, "guest exec");
        let mut channel = self
            .inner
            .channel_session()
            .map_err(|e| Error::connect(format!("channel open failed: {}", e)))?;
        channel
            .exec(cmd)
            .map_err(|e| Error::connect(format!("exec failed: {}", e)))?;

        let mut stdout = String::new();
        channel
            .read_to_string(&mut stdout)
            .map_err(|e| Error::connect(format!("read stdout failed: {}", e)))?;
        let mut stderr = String::new();
        channel
            .stderr()
            .read_to_string(&mut stderr)
            .map_err(|e| Error::connect(format!("read stderr failed: {}", e)))?;

        let _ = channel.wait_close();
        let exit_status = channel.exit_status().unwrap_or(-1);

        Ok(ExecOutput {
            stdout,
            stderr,
            exit_status,
        })
    }
}

impl GuestExec for SshSession {
    fn exec(&mut self, cmd: &str) -> Result<String> {
        self.run(cmd).map(|out| out.combined())
    }
}

/// Resolve the configured SSH endpoint to a socket address.
fn ssh_addr(config: &DroidboxConfig) -> Result<SocketAddr> {
    (config.ssh_host.as_str(), config.ssh_port)
        .to_socket_addrs()
        .map_err(|e| Error::connect(format!("resolve {}: {}", config.ssh_host, e)))?
        .next()
        .ok_or_else(|| Error::connect(format!("no address for {}", config.ssh_host)))
}

/// Open and authenticate one SSH connection with the given timeout.
fn open_session(config: &DroidboxConfig, timeout: Duration) -> Result<Session> {
    let addr = ssh_addr(config)?;
    let stream = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| Error::connect(format!("tcp connect to {}: {}", addr, e)))?;

    let mut session =
        Session::new().map_err(|e| Error::connect(format!("session init: {}", e)))?;
    session.set_tcp_stream(stream);
    session.set_timeout(timeout.as_millis() as u32);
    session
        .handshake()
        .map_err(|e| Error::connect(format!("handshake: {}", e)))?;
    session
        .userauth_password(&config.ssh_user, &config.ssh_password)
        .map_err(|e| Error::auth(e.to_string()))?;
    if !session.authenticated() {
        return Err(Error::auth("authentication did not complete".to_string()));
    }
    Ok(session)
}

/// Manager for the single persistent remote-execution session.
pub struct RemoteSessionManager {
    config: DroidboxConfig,
    target_kind: Mutex<TargetKind>,
    target_mounted: AtomicBool,
    slot: Mutex<Option<SshSession>>,
    /// Held by whichever caller is connecting-and-mounting; `try_lock`
    /// losers report `Establishing` instead of racing a second attempt.
    establish_lock: Mutex<()>,
}

impl RemoteSessionManager {
    /// Create a manager with no connection.
    pub fn new(config: DroidboxConfig) -> Self {
        Self {
            config,
            target_kind: Mutex::new(TargetKind::default()),
            target_mounted: AtomicBool::new(false),
            slot: Mutex::new(None),
            establish_lock: Mutex::new(()),
        }
    }

    /// Set the emulator product kind driving the mount heuristic.
    pub fn set_target_kind(&self, kind: TargetKind) {
        *self.target_kind.lock() = kind;
    }

    /// The currently configured product kind.
    pub fn target_kind(&self) -> TargetKind {
        self.target_kind.lock().clone()
    }

    /// True only after a mount succeeded AND the Android root markers were
    /// found on it.
    pub fn is_target_mounted(&self) -> bool {
        self.target_mounted.load(Ordering::Relaxed)
    }

    /// Whether a persistent session currently exists.
    pub fn is_connected(&self) -> bool {
        self.slot.lock().is_some()
    }

    /// Open the persistent session. No internal retry; fails fast while the
    /// guest is still booting (use `wait_for_connection` for that).
    pub fn connect(&self) -> Result<()> {
        let session = open_session(&self.config, CONNECT_TIMEOUT)?;
        session.set_timeout(EXEC_TIMEOUT.as_millis() as u32);
        *self.slot.lock() = Some(SshSession { inner: session });
        tracing::info!(
            host = %self.config.ssh_host,
            port = self.config.ssh_port,
            "worker session connected"
        );
        Ok(())
    }

    /// Close the persistent session, if any.
    pub fn close(&self) {
        if let Some(session) = self.slot.lock().take() {
            let _ = session.inner.disconnect(None, "closing", None);
            tracing::info!("worker session closed");
        }
        self.target_mounted.store(false, Ordering::Relaxed);
    }

    /// Poll until SSH is connectable or `timeout` elapses.
    ///
    /// Each round is a cheap raw TCP reachability check followed by a full
    /// `connect()`; this is where guest boot time is waited out, since
    /// `connect()` alone fails fast while sshd is not yet listening.
    pub fn wait_for_connection(&self, timeout: Duration) -> Result<()> {
        let deadline = Deadline::new(timeout);
        let mut attempt = 0u32;

        loop {
            if deadline.expired() {
                return Err(Error::timeout("ssh connection", deadline.budget_secs()));
            }
            attempt += 1;
            tracing::debug!(
                attempt,
                remaining_secs = deadline.remaining().as_secs(),
                "waiting for guest ssh"
            );

            let reachable = ssh_addr(&self.config)
                .and_then(|addr| {
                    TcpStream::connect_timeout(&addr, PROBE_TIMEOUT)
                        .map_err(|e| Error::connect(e.to_string()))
                })
                .is_ok();
            if reachable {
                match self.connect() {
                    Ok(()) => {
                        tracing::info!(attempt, "guest ssh is ready");
                        return Ok(());
                    }
                    Err(e) => tracing::debug!(error = %e, "ssh not ready yet"),
                }
            }
            std::thread::sleep(BOOT_POLL_INTERVAL);
        }
    }

    /// Out-of-band liveness probe.
    ///
    /// Opens a brand-new short-timeout connection, echoes the sentinel, and
    /// returns true only on an exact match. The probe connection is dropped
    /// before returning on every path; the persistent session is never
    /// touched.
    pub fn check_health(&self) -> bool {
        let session = match open_session(&self.config, PROBE_TIMEOUT) {
            Ok(s) => s,
            Err(e) => {
                tracing::debug!(error = %e, "health probe could not connect (guest booting?)");
                return false;
            }
        };

        let probe = SshSession { inner: session };
        match probe.run(&format!("echo '{}'", HEALTH_SENTINEL)) {
            Ok(out) => out.combined() == HEALTH_SENTINEL,
            Err(e) => {
                tracing::debug!(error = %e, "health probe command failed");
                false
            }
        }
        // `probe` drops here, closing the connection regardless of outcome.
    }

    /// Run a command on the persistent session.
    ///
    /// Returns combined stdout+stderr, trimmed; remote failures are not
    /// distinguished from transport errors at this layer.
    pub fn execute(&self, cmd: &str) -> Result<String> {
        self.with_exec(|exec| exec.exec(cmd))
    }

    /// Run a command and keep exit status and streams separate.
    pub fn execute_full(&self, cmd: &str) -> Result<ExecOutput> {
        let mut slot = self.slot.lock();
        let session = slot.as_mut().ok_or(Error::NotConnected)?;
        session.run(cmd)
    }

    /// Run `f` with exclusive access to the persistent session's executor.
    pub fn with_exec<T>(&self, f: impl FnOnce(&mut dyn GuestExec) -> Result<T>) -> Result<T> {
        let mut slot = self.slot.lock();
        let session = slot.as_mut().ok_or(Error::NotConnected)?;
        f(session)
    }

    /// Select and mount the target Android partition.
    ///
    /// Returns the device that mounted. `is_target_mounted` is set only
    /// when the root-marker sanity check also passed.
    pub fn mount_target(&self) -> Result<String> {
        let kind = self.target_kind();
        let outcome = self.with_exec(|exec| {
            mount::mount_target(
                exec,
                &kind,
                &self.config.mount_point,
                &self.config.fallback_devices,
            )
        })?;
        self.target_mounted
            .store(outcome.markers_present, Ordering::Relaxed);
        Ok(outcome.device)
    }

    /// Make sure a ready session exists, without racing other callers.
    ///
    /// The first caller to notice the missing session connects and mounts;
    /// concurrent callers get `Establishing` immediately instead of opening
    /// a second connection.
    pub fn ensure_ready(&self) -> Result<SessionStatus> {
        if self.is_connected() {
            return Ok(SessionStatus::Ready);
        }

        match self.establish_lock.try_lock() {
            Some(_guard) => {
                self.connect()?;
                self.mount_target()?;
                Ok(SessionStatus::Ready)
            }
            None => Ok(SessionStatus::Establishing),
        }
    }

    /// Remount the target filesystem read-write (best-effort).
    pub fn remount_rw(&self) -> Result<String> {
        self.with_exec(|exec| mount::remount_rw(exec, &self.config.mount_point))
    }

    /// Remount the target filesystem read-only (best-effort).
    pub fn remount_ro(&self) -> Result<String> {
        self.with_exec(|exec| mount::remount_ro(exec, &self.config.mount_point))
    }

    // ── SFTP file primitives ────────────────────────────────────────────

    /// Upload a local file to `remote_path`, creating parent directories.
    pub fn upload_file(&self, local_path: &Path, remote_path: &str) -> Result<()> {
        if let Some(parent) = Path::new(remote_path).parent() {
            self.execute(&format!("mkdir -p {}", parent.display()))?;
        }

        let mut slot = self.slot.lock();
        let session = slot.as_mut().ok_or(Error::NotConnected)?;
        let sftp = session
            .inner
            .sftp()
            .map_err(|e| Error::connect(format!("sftp open: {}", e)))?;

        let mut local = std::fs::File::open(local_path)?;
        let mut remote = sftp
            .create(Path::new(remote_path))
            .map_err(|e| Error::connect(format!("sftp create {}: {}", remote_path, e)))?;
        let bytes = std::io::copy(&mut local, &mut remote)?;
        tracing::info!(local = %local_path.display(), remote = remote_path, bytes, "sftp put");
        Ok(())
    }

    /// Download `remote_path` to a local file.
    pub fn download_file(&self, remote_path: &str, local_path: &Path) -> Result<()> {
        let mut slot = self.slot.lock();
        let session = slot.as_mut().ok_or(Error::NotConnected)?;
        let sftp = session
            .inner
            .sftp()
            .map_err(|e| Error::connect(format!("sftp open: {}", e)))?;

        let mut remote = sftp
            .open(Path::new(remote_path))
            .map_err(|e| Error::connect(format!("sftp open {}: {}", remote_path, e)))?;
        let mut local = std::fs::File::create(local_path)?;
        let bytes = std::io::copy(&mut remote, &mut local)?;
        tracing::info!(remote = remote_path, local = %local_path.display(), bytes, "sftp get");
        Ok(())
    }

    /// Read a remote file into memory.
    pub fn read_file(&self, remote_path: &str) -> Result<Vec<u8>> {
        let mut slot = self.slot.lock();
        let session = slot.as_mut().ok_or(Error::NotConnected)?;
        let sftp = session
            .inner
            .sftp()
            .map_err(|e| Error::connect(format!("sftp open: {}", e)))?;

        let mut remote = sftp
            .open(Path::new(remote_path))
            .map_err(|e| Error::connect(format!("sftp open {}: {}", remote_path, e)))?;
        let mut data = Vec::new();
        remote.read_to_end(&mut data)?;
        Ok(data)
    }

    /// Write bytes to a remote file.
    pub fn write_file(&self, remote_path: &str, data: &[u8]) -> Result<()> {
        use std::io::Write;

        let mut slot = self.slot.lock();
        let session = slot.as_mut().ok_or(Error::NotConnected)?;
        let sftp = session
            .inner
            .sftp()
            .map_err(|e| Error::connect(format!("sftp open: {}", e)))?;

        let mut remote = sftp
            .create(Path::new(remote_path))
            .map_err(|e| Error::connect(format!("sftp create {}: {}", remote_path, e)))?;
        remote.write_all(data)?;
        tracing::info!(remote = remote_path, bytes = data.len(), "sftp write");
        Ok(())
    }
}
