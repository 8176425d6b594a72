//! Single-port modem probe.
//!
//! Opens one serial device, pokes it with `AT` (and `ATI` if that stays
//! silent), and reports whether something modem-shaped answered. Stateless
//! and side-effect free beyond the port open/close — the handle is always
//! released before returning, whatever happened. Retries are the caller's
//! business.

use std::io::{Read, Write};
use std::time::Duration;

use serde::Serialize;
use tracing::debug;

/// One candidate serial device. Rebuilt on every discovery pass — device
/// paths are not stable across USB re-enumeration.
#[derive(Debug, Clone, Serialize)]
pub struct SerialEndpoint {
    pub path: String,
    pub baud_rate: u32,
    /// Per-step read timeout used while probing and opening.
    #[serde(skip)]
    pub read_timeout: Duration,
}

impl SerialEndpoint {
    pub fn new(path: impl Into<String>, baud_rate: u32, read_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            baud_rate,
            read_timeout,
        }
    }
}

/// What one probe attempt concluded about a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    /// Answered `OK` to `AT`, or gave a substantive `ATI` reply.
    Functional,
    /// Opened fine but never said anything recognizable.
    NoAtResponse,
    /// Could not be opened — held by another process or access denied.
    Busy,
    /// Anything else (port vanished mid-probe, driver error).
    UnexpectedError,
}

/// Immutable record of one probe attempt, kept for diagnostics export.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeResult {
    pub endpoint: SerialEndpoint,
    /// OS-reported device description (filled in by discovery).
    pub description: String,
    pub status: ProbeStatus,
    /// Raw reply to `AT`, verbatim.
    pub at_reply: String,
    /// Raw reply to `ATI`, verbatim (empty when `AT` already answered).
    pub ati_reply: String,
    /// Open/IO error detail for the non-functional classifications.
    pub error: Option<String>,
}

impl ProbeResult {
    pub fn is_functional(&self) -> bool {
        self.status == ProbeStatus::Functional
    }
}

/// Pause after opening before the first write, and after each write before
/// reading back — cheap modems need both.
const SETTLE: Duration = Duration::from_millis(200);
const REPLY_WAIT: Duration = Duration::from_millis(500);

/// Probe one endpoint: open, handshake, classify. Never retries, never
/// keeps the port open.
pub fn probe(endpoint: &SerialEndpoint) -> ProbeResult {
    debug!("probing {} at {} baud", endpoint.path, endpoint.baud_rate);

    let mut port = match serialport::new(&endpoint.path, endpoint.baud_rate)
        .data_bits(serialport::DataBits::Eight)
        .parity(serialport::Parity::None)
        .stop_bits(serialport::StopBits::One)
        .timeout(endpoint.read_timeout)
        .open()
    {
        Ok(port) => port,
        Err(e) => {
            let text = e.to_string();
            let lowered = text.to_lowercase();
            let status = if lowered.contains("busy")
                || lowered.contains("in use")
                || lowered.contains("access denied")
                || lowered.contains("permission denied")
            {
                ProbeStatus::Busy
            } else {
                ProbeStatus::UnexpectedError
            };
            return ProbeResult {
                endpoint: endpoint.clone(),
                description: String::new(),
                status,
                at_reply: String::new(),
                ati_reply: String::new(),
                error: Some(text),
            };
        }
    };

    let _ = port.clear(serialport::ClearBuffer::All);
    std::thread::sleep(SETTLE);

    let at_reply = match handshake(port.as_mut(), b"AT\r\n") {
        Ok(reply) => reply,
        Err(e) => return io_failure(endpoint, e),
    };

    let ati_reply = if at_reply.contains("OK") {
        String::new()
    } else {
        match handshake(port.as_mut(), b"ATI\r\n") {
            Ok(reply) => reply,
            Err(e) => return io_failure(endpoint, e),
        }
    };

    let status = classify_replies(&at_reply, &ati_reply);
    debug!(
        "probe {}: {:?} (AT {:?}, ATI {:?})",
        endpoint.path,
        status,
        at_reply.trim(),
        ati_reply.trim()
    );

    ProbeResult {
        endpoint: endpoint.clone(),
        description: String::new(),
        status,
        at_reply,
        ati_reply,
        error: None,
    }
}

/// Functional when `AT` got an `OK`, or `ATI` produced anything substantive
/// (Qualcomm data ports answer `ATI` with model text but swallow `AT`).
pub fn classify_replies(at_reply: &str, ati_reply: &str) -> ProbeStatus {
    if at_reply.contains("OK") || ati_reply.trim().len() > 5 {
        ProbeStatus::Functional
    } else {
        ProbeStatus::NoAtResponse
    }
}

fn handshake(port: &mut dyn serialport::SerialPort, command: &[u8]) -> std::io::Result<String> {
    port.write_all(command)?;
    std::thread::sleep(REPLY_WAIT);
    read_available(port)
}

/// Drain whatever the device has queued right now.
fn read_available(port: &mut dyn serialport::SerialPort) -> std::io::Result<String> {
    let available = port.bytes_to_read().unwrap_or(0) as usize;
    if available == 0 {
        return Ok(String::new());
    }
    let mut buf = vec![0u8; available];
    let n = match port.read(&mut buf) {
        Ok(n) => n,
        Err(e) if e.kind() == std::io::ErrorKind::TimedOut => 0,
        Err(e) => return Err(e),
    };
    Ok(String::from_utf8_lossy(&buf[..n]).to_string())
}

fn io_failure(endpoint: &SerialEndpoint, e: std::io::Error) -> ProbeResult {
    ProbeResult {
        endpoint: endpoint.clone(),
        description: String::new(),
        status: ProbeStatus::UnexpectedError,
        at_reply: String::new(),
        ati_reply: String::new(),
        error: Some(e.to_string()),
    }
}
