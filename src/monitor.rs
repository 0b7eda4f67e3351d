//! QEMU human-monitor client.
//!
//! The monitor is a line-oriented administrative channel exposed by the QEMU
//! process itself on a localhost TCP port. Each call opens a fresh
//! connection, waits for the `(qemu) ` greeting prompt, writes exactly one
//! command, and reads until the prompt reappears. Stateless per call.

use crate::error::{Error, Result};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::time::Duration;

/// The monitor's prompt marker; both the greeting and every response end
/// with it.
const PROMPT: &str = "(qemu)";

/// Bound on each read phase and the connect attempt.
const MONITOR_TIMEOUT: Duration = Duration::from_secs(2);

/// One administrative command round trip.
///
/// Seam for the hotplug coordinator, so attach/detach sequencing is testable
/// against a scripted channel.
pub trait ControlChannel {
    /// Send one command and return its textual response, prompt stripped.
    fn command(&self, cmd: &str) -> Result<String>;
}

/// TCP client for the QEMU human monitor.
pub struct MonitorClient {
    addr: SocketAddr,
    timeout: Duration,
}

impl MonitorClient {
    /// Create a client for the monitor at `addr`.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            timeout: MONITOR_TIMEOUT,
        }
    }

    /// Override the per-phase timeout (tests use a shorter one).
    pub fn with_timeout(addr: SocketAddr, timeout: Duration) -> Self {
        Self { addr, timeout }
    }

    /// Read from `stream` until the prompt marker appears, returning
    /// everything read with the prompt and anything after it stripped.
    fn read_to_prompt(&self, stream: &mut TcpStream) -> Result<String> {
        let mut buf = Vec::new();
        let mut chunk = [0u8; 4096];

        loop {
            let text = String::from_utf8_lossy(&buf);
            if let Some(pos) = text.find(PROMPT) {
                return Ok(text[..pos].to_string());
            }

            let n = stream.read(&mut chunk).map_err(|e| {
                Error::control_channel(format!("read from monitor failed: {}", e))
            })?;
            if n == 0 {
                return Err(Error::control_channel(
                    "monitor closed connection before prompt",
                ));
            }
            buf.extend_from_slice(&chunk[..n]);
        }
    }
}

impl ControlChannel for MonitorClient {
    fn command(&self, cmd: &str) -> Result<String> {
        let mut stream = TcpStream::connect_timeout(&self.addr, self.timeout)
            .map_err(|e| Error::control_channel(format!("connect to monitor failed: {}", e)))?;
        stream
            .set_read_timeout(Some(self.timeout))
            .map_err(|e| Error::control_channel(e.to_string()))?;
        stream
            .set_write_timeout(Some(self.timeout))
            .map_err(|e| Error::control_channel(e.to_string()))?;

        // Greeting phase: QEMU prints a banner ending in the prompt.
        self.read_to_prompt(&mut stream)?;

        stream
            .write_all(format!("{}\n", cmd).as_bytes())
            .map_err(|e| Error::control_channel(format!("write to monitor failed: {}", e)))?;

        let response = self.read_to_prompt(&mut stream)?;
        tracing::debug!(cmd, response = response.trim(), "monitor round trip");
        Ok(response.trim().to_string())
    }
}
