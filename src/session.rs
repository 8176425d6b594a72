//! The AT request/response session primitive.
//!
//! One [`AtSession`] wraps one open serial handle and is the only way any
//! other module touches the device. The protocol is half-duplex line text:
//! write a command, then poll at 100 ms granularity accumulating whatever
//! bytes arrive until a terminal token shows up or the deadline passes.
//!
//! Failures never panic and never propagate as errors from the wait
//! primitives — a timeout or `ERROR` comes back as a [`CommandOutcome`] so
//! upstream retry logic (init sequences, USSD encoding negotiation) can
//! decide what to do next.

use std::io::Read;
use std::time::{Duration, Instant};

use serialport::SerialPort;
use tracing::debug;

use crate::error::ModemError;
use crate::patterns;
use crate::probe::SerialEndpoint;

/// Poll granularity for response accumulation.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Read buffer size — AT responses are small.
const READ_BUF_SIZE: usize = 1024;

/// Byte-level access to the device, so the session logic runs identically
/// against real serial ports and scripted fakes in tests.
pub trait Transport: Send {
    /// Write all bytes.
    fn write_bytes(&mut self, data: &[u8]) -> Result<(), ModemError>;
    /// Block up to [`POLL_INTERVAL`], returning how many bytes arrived
    /// (0 on an idle tick).
    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, ModemError>;
    /// Discard anything buffered in both directions.
    fn clear_buffers(&mut self) -> Result<(), ModemError>;
}

/// Real serial transport: 8N1, no flow control, read timeout = poll interval.
pub struct SerialTransport {
    port: Box<dyn SerialPort>,
}

impl SerialTransport {
    /// Open the endpoint's device. Open errors are classified so callers can
    /// distinguish a busy port from a missing one.
    pub fn open(endpoint: &SerialEndpoint) -> Result<Self, ModemError> {
        let port = serialport::new(&endpoint.path, endpoint.baud_rate)
            .data_bits(serialport::DataBits::Eight)
            .parity(serialport::Parity::None)
            .stop_bits(serialport::StopBits::One)
            .timeout(POLL_INTERVAL)
            .open()
            .map_err(|e| classify_open_error(&endpoint.path, &e))?;
        Ok(Self { port })
    }
}

/// Map a serial open failure onto the error taxonomy.
fn classify_open_error(path: &str, err: &serialport::Error) -> ModemError {
    let text = err.to_string().to_lowercase();
    if text.contains("busy")
        || text.contains("in use")
        || text.contains("access denied")
        || text.contains("permission denied")
    {
        ModemError::DeviceBusy(path.to_string())
    } else {
        ModemError::Serial(format!("open {path}: {err}"))
    }
}

impl Transport for SerialTransport {
    fn write_bytes(&mut self, data: &[u8]) -> Result<(), ModemError> {
        self.port
            .write_all(data)
            .map_err(|e| ModemError::Serial(format!("write: {e}")))
    }

    fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, ModemError> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(ModemError::Serial(format!("read: {e}"))),
        }
    }

    fn clear_buffers(&mut self) -> Result<(), ModemError> {
        self.port
            .clear(serialport::ClearBuffer::All)
            .map_err(|e| ModemError::Serial(format!("clear buffers: {e}")))
    }
}

/// Terminal token that ended one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Terminal {
    /// The expected token (default `OK`) appeared.
    Ok,
    /// The modem answered `ERROR` (or a CMS/CME variant).
    Error,
    /// The `>` body prompt appeared (SMS send flow).
    Prompt,
    /// The deadline passed with neither.
    Timeout,
}

/// Result of one AT exchange. Consumed immediately by the caller; never stored.
#[derive(Debug, Clone)]
pub struct CommandOutcome {
    pub success: bool,
    /// Everything read during the exchange, verbatim (lossy UTF-8).
    pub text: String,
    pub terminal: Terminal,
    /// Numeric `+CMS ERROR:` / `+CME ERROR:` code when present.
    pub error_code: Option<u16>,
}

/// One open AT command session. Exclusive `&mut` access enforces the
/// half-duplex invariant: at most one exchange in flight per session.
pub struct AtSession {
    io: Box<dyn Transport>,
}

impl AtSession {
    pub fn new(io: Box<dyn Transport>) -> Self {
        Self { io }
    }

    /// Open a real serial session on the endpoint.
    pub fn open(endpoint: &SerialEndpoint) -> Result<Self, ModemError> {
        Ok(Self::new(Box::new(SerialTransport::open(endpoint)?)))
    }

    /// Write `command` and wait for `token` (success), `ERROR` (failure with
    /// code extraction), or the timeout. The input buffer is cleared first so
    /// stale fragments from an abandoned exchange can't be misattributed.
    pub fn expect(&mut self, command: &str, token: &str, timeout: Duration) -> CommandOutcome {
        if let Err(e) = self.begin(command) {
            debug!("AT {command}: {e}");
            return CommandOutcome {
                success: false,
                text: String::new(),
                terminal: Terminal::Timeout,
                error_code: None,
            };
        }
        self.accumulate(token, timeout)
    }

    /// `expect` with the default `OK` token, reduced to a bool.
    pub fn send_expect(&mut self, command: &str, timeout: Duration) -> bool {
        let outcome = self.expect(command, "OK", timeout);
        if !outcome.success {
            debug!(
                "AT {command} failed ({:?}): {}",
                outcome.terminal,
                outcome.text.trim()
            );
        }
        outcome.success
    }

    /// Write `command` and return the raw response once `OK` or `ERROR`
    /// appears (or the timeout passes) without interpreting it — for
    /// structured output the caller parses itself (CSQ, COPS, CSCA).
    pub fn send_collect(&mut self, command: &str, timeout: Duration) -> String {
        if let Err(e) = self.begin(command) {
            debug!("AT {command}: {e}");
            return String::new();
        }
        let outcome = self.wait_until(timeout, |text| {
            text.contains("OK") || text.contains("ERROR")
        });
        outcome.text.trim().to_string()
    }

    /// Write raw bytes mid-exchange (the SMS body + Ctrl-Z terminator).
    pub fn write_raw(&mut self, data: &[u8]) -> Result<(), ModemError> {
        self.io.write_bytes(data)
    }

    /// Accumulate without writing anything, until `done(text)` or timeout.
    /// Used for delayed unsolicited results (`+CMGS`, `+CUSD`).
    pub fn wait_until(
        &mut self,
        timeout: Duration,
        done: impl Fn(&str) -> bool,
    ) -> CommandOutcome {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; READ_BUF_SIZE];
        let mut text = String::with_capacity(256);

        loop {
            if done(&text) {
                return CommandOutcome {
                    success: true,
                    text,
                    terminal: Terminal::Ok,
                    error_code: None,
                };
            }
            if Instant::now() >= deadline {
                return CommandOutcome {
                    success: false,
                    error_code: patterns::extract_error_code(&text),
                    text,
                    terminal: Terminal::Timeout,
                };
            }
            match self.io.read_chunk(&mut buf) {
                Ok(0) => {}
                Ok(n) => text.push_str(&String::from_utf8_lossy(&buf[..n])),
                Err(e) => {
                    debug!("read during wait: {e}");
                    return CommandOutcome {
                        success: false,
                        text,
                        terminal: Terminal::Timeout,
                        error_code: None,
                    };
                }
            }
        }
    }

    /// Discard any buffered input (required before the next exchange after a
    /// timed-out one — there is no way to cancel an in-flight command).
    pub fn clear(&mut self) {
        if let Err(e) = self.io.clear_buffers() {
            debug!("clear buffers: {e}");
        }
    }

    fn begin(&mut self, command: &str) -> Result<(), ModemError> {
        self.io.clear_buffers()?;
        self.io.write_bytes(format!("{command}\r\n").as_bytes())
    }

    fn accumulate(&mut self, token: &str, timeout: Duration) -> CommandOutcome {
        let deadline = Instant::now() + timeout;
        let mut buf = [0u8; READ_BUF_SIZE];
        let mut text = String::with_capacity(256);

        loop {
            if text.contains(token) {
                return CommandOutcome {
                    success: true,
                    text,
                    terminal: if token == ">" { Terminal::Prompt } else { Terminal::Ok },
                    error_code: None,
                };
            }
            if text.contains("ERROR") {
                return CommandOutcome {
                    success: false,
                    error_code: patterns::extract_error_code(&text),
                    text,
                    terminal: Terminal::Error,
                };
            }
            if Instant::now() >= deadline {
                return CommandOutcome {
                    success: false,
                    text,
                    terminal: Terminal::Timeout,
                    error_code: None,
                };
            }
            match self.io.read_chunk(&mut buf) {
                Ok(0) => {}
                Ok(n) => text.push_str(&String::from_utf8_lossy(&buf[..n])),
                Err(e) => {
                    debug!("read during exchange: {e}");
                    return CommandOutcome {
                        success: false,
                        text,
                        terminal: Terminal::Timeout,
                        error_code: None,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! Scripted transport for driving the engine without hardware.

    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::Transport;
    use crate::error::ModemError;

    /// Replays canned replies keyed by a substring of the written data.
    /// Unmatched writes produce no reply (the "device never answers" case).
    pub struct ScriptedTransport {
        script: VecDeque<(String, Vec<u8>)>,
        pending: VecDeque<u8>,
        /// Every write, in order, for assertions.
        pub writes: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedTransport {
        pub fn new(script: Vec<(&str, &str)>) -> Self {
            Self {
                script: script
                    .into_iter()
                    .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
                    .collect(),
                pending: VecDeque::new(),
                writes: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// A transport that never answers anything.
        pub fn silent() -> Self {
            Self::new(Vec::new())
        }
    }

    impl Transport for ScriptedTransport {
        fn write_bytes(&mut self, data: &[u8]) -> Result<(), ModemError> {
            let written = String::from_utf8_lossy(data).to_string();
            self.writes.lock().unwrap().push(written.clone());
            if let Some((key, _)) = self.script.front() {
                if written.contains(key.as_str()) {
                    let (_, reply) = self.script.pop_front().unwrap();
                    self.pending.extend(reply);
                }
            }
            Ok(())
        }

        fn read_chunk(&mut self, buf: &mut [u8]) -> Result<usize, ModemError> {
            if self.pending.is_empty() {
                // Mimic the serial read timeout so timeout tests stay fast
                // without spinning.
                std::thread::sleep(Duration::from_millis(2));
                return Ok(0);
            }
            let mut n = 0;
            while n < buf.len() {
                match self.pending.pop_front() {
                    Some(b) => {
                        buf[n] = b;
                        n += 1;
                    }
                    None => break,
                }
            }
            Ok(n)
        }

        fn clear_buffers(&mut self) -> Result<(), ModemError> {
            self.pending.clear();
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::ScriptedTransport;
    use super::*;

    #[test]
    fn test_send_expect_ok() {
        let io = ScriptedTransport::new(vec![("AT", "\r\nOK\r\n")]);
        let mut session = AtSession::new(Box::new(io));
        assert!(session.send_expect("AT", Duration::from_millis(500)));
    }

    #[test]
    fn test_send_expect_error_with_code() {
        let io = ScriptedTransport::new(vec![("AT+CMGF=1", "\r\n+CMS ERROR: 302\r\nERROR\r\n")]);
        let mut session = AtSession::new(Box::new(io));
        let outcome = session.expect("AT+CMGF=1", "OK", Duration::from_millis(500));
        assert!(!outcome.success);
        assert_eq!(outcome.terminal, Terminal::Error);
        assert_eq!(outcome.error_code, Some(302));
    }

    #[test]
    fn test_send_expect_times_out_without_reply() {
        let io = ScriptedTransport::silent();
        let mut session = AtSession::new(Box::new(io));
        let start = Instant::now();
        let ok = session.send_expect("AT", Duration::from_millis(150));
        assert!(!ok);
        // Must not block meaningfully past the configured timeout.
        assert!(start.elapsed() < Duration::from_millis(600));
    }

    #[test]
    fn test_send_collect_returns_raw_text() {
        let io = ScriptedTransport::new(vec![("AT+CSQ", "\r\n+CSQ: 17,99\r\n\r\nOK\r\n")]);
        let mut session = AtSession::new(Box::new(io));
        let text = session.send_collect("AT+CSQ", Duration::from_millis(500));
        assert!(text.contains("+CSQ: 17,99"));
        assert!(text.contains("OK"));
    }

    #[test]
    fn test_prompt_terminal() {
        let io = ScriptedTransport::new(vec![("AT+CMGS", "\r\n> ")]);
        let mut session = AtSession::new(Box::new(io));
        let outcome = session.expect("AT+CMGS=\"+258841112233\"", ">", Duration::from_millis(500));
        assert!(outcome.success);
        assert_eq!(outcome.terminal, Terminal::Prompt);
    }

    #[test]
    fn test_fragmented_reply_accumulates() {
        // Token split across reads still matches on the accumulated text.
        let io = ScriptedTransport::new(vec![("AT", "\r\nO")]);
        let mut session = AtSession::new(Box::new(io));
        // Only "O" arrives; no full token, so this times out.
        assert!(!session.send_expect("AT", Duration::from_millis(100)));
    }
}
