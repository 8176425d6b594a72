//! Error taxonomy for modem operations.
//!
//! Callers branch on the failure class: a timeout means "wait and retry", a
//! rejection means "fix the code or configuration", a missing device means
//! "rediscover". Raw device text is carried verbatim so an operator can see
//! exactly what the modem said.

use std::time::Duration;

use thiserror::Error;

/// Failure classes for modem engine operations.
///
/// None of these are process-fatal; the worst case is "modem unavailable"
/// while the rest of the server keeps serving.
#[derive(Debug, Error)]
pub enum ModemError {
    /// Discovery exhausted every candidate port without finding a modem.
    #[error("no GSM modem found on any serial port")]
    DeviceNotFound,

    /// The port exists but could not be opened (held by another process,
    /// permission denied, or mid-reenumeration).
    #[error("serial port {0} is busy or inaccessible")]
    DeviceBusy(String),

    /// The device opened but never answered the `AT` handshake.
    #[error("no AT handshake reply from {0}")]
    HandshakeTimeout(String),

    /// A mandatory initialization command failed after a good handshake.
    #[error("modem initialization failed: {0}")]
    InitFailed(String),

    /// The modem answered `ERROR` (optionally with a CMS/CME code).
    #[error("command rejected by modem{}: {raw}", code.map(|c| format!(" (code {c})")).unwrap_or_default())]
    CommandRejected {
        /// Numeric `+CMS ERROR:` / `+CME ERROR:` code when one was present.
        code: Option<u16>,
        /// Raw response text, verbatim.
        raw: String,
    },

    /// No terminal token arrived before the deadline.
    #[error("no reply from modem within {timeout:?}")]
    CommandTimeout {
        timeout: Duration,
        /// Whatever partial text accumulated before the deadline.
        raw: String,
    },

    /// Every USSD request encoding was rejected at the command layer.
    #[error("all USSD request encodings rejected: {raw}")]
    EncodingExhausted { raw: String },

    /// No modem session is currently established.
    #[error("modem not connected")]
    NotConnected,

    /// Underlying serial I/O failure (write error, port vanished mid-read).
    #[error("serial I/O: {0}")]
    Serial(String),
}

impl ModemError {
    /// True for failures where waiting and retrying is the right remediation,
    /// as opposed to a configuration or command problem.
    #[must_use]
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::CommandTimeout { .. } | Self::HandshakeTimeout(_)
        )
    }
}
