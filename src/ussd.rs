//! USSD session execution.
//!
//! USSD is the messiest corner of the AT surface: the request encoding the
//! network accepts varies by carrier and firmware, the reply can arrive in
//! three different shapes, and the payload may or may not be hex-encoded
//! UCS-2. The strategy, learned the hard way from live hardware: cancel
//! whatever session may be stale, then try one request encoding after
//! another until a recognizable `+CUSD` reply lands, and throw the payload
//! at the text codec.
//!
//! The engine is stateless between exchanges — a multi-step menu
//! conversation is a sequence of [`UssdExchange`]s correlated by the caller.

use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::ModemConfig;
use crate::error::ModemError;
use crate::patterns;
use crate::session::{AtSession, Terminal};
use crate::textcodec::{collapse_controls, decode_hex_payload, HexPayload};

/// Cancel-stale-session wait.
const CANCEL_TIMEOUT: Duration = Duration::from_secs(2);
/// Command-layer acceptance window per encoding attempt.
const ACCEPT_TIMEOUT: Duration = Duration::from_secs(5);
/// Settle time after opening a fresh port (one-shot path).
const OPEN_SETTLE: Duration = Duration::from_millis(500);

/// Request encoding attempted for one exchange, in negotiation order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UssdEncoding {
    /// Plain 7-bit with DCS 15.
    Gsm7,
    /// Code as-is, DCS 72 (UCS-2 announced, text payload).
    Ucs2Text,
    /// No DCS flag at all — let the modem pick.
    Unspecified,
    /// Code transcoded to UCS-2 hex code points, DCS 72.
    Ucs2Hex,
}

/// One request/response cycle.
#[derive(Debug, Clone, Serialize)]
pub struct UssdExchange {
    /// The dialed code, as requested.
    pub code: String,
    /// Which request encoding the network finally accepted.
    pub encoding: UssdEncoding,
    /// `+CUSD` result status: 0 = done, 1 = further action expected,
    /// anything else = terminated/error per the network.
    pub status: u8,
    /// Decoded, control-flattened reply text (empty for status-only replies).
    pub text: String,
    /// The raw reply, verbatim, for operator diagnosis.
    pub raw: String,
}

impl UssdExchange {
    /// True when the network expects a follow-up reply in this session.
    #[must_use]
    pub fn session_active(&self) -> bool {
        self.status == 1
    }
}

/// Execute one USSD exchange on the shared session.
///
/// Tries up to four request encodings; a command-layer `ERROR` moves to the
/// next immediately, while the overall `timeout` is shared across attempts.
pub fn execute(
    session: &mut AtSession,
    code: &str,
    timeout: Duration,
) -> Result<UssdExchange, ModemError> {
    info!("USSD {code} (timeout {}s)", timeout.as_secs());

    // A stale session from a previous caller makes the network silently
    // swallow the new request. Cancel it; failure here means nothing.
    session.send_expect("AT+CUSD=2", CANCEL_TIMEOUT);
    session.clear();

    negotiate(session, code, timeout)
}

/// Send a follow-up reply within an active USSD session (a menu choice,
/// typically bare digits). Never cancels first — that would end the very
/// session the caller is continuing.
pub fn continue_session(
    session: &mut AtSession,
    reply: &str,
    timeout: Duration,
) -> Result<UssdExchange, ModemError> {
    info!("USSD session reply {reply:?} (timeout {}s)", timeout.as_secs());
    negotiate(session, reply, timeout)
}

/// The encoding negotiation loop shared by [`execute`] and
/// [`continue_session`].
fn negotiate(
    session: &mut AtSession,
    code: &str,
    timeout: Duration,
) -> Result<UssdExchange, ModemError> {
    let variants = request_variants(code);
    let attempts = variants.len() as u32;
    let deadline = Instant::now() + timeout;
    let mut rejected = 0u32;
    let mut last_raw = String::new();

    for (i, (encoding, command)) in variants.into_iter().enumerate() {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        // Share what is left of the overall budget across remaining attempts
        // so a silent network can't starve the later encodings.
        let budget = (deadline - now) / (attempts - i as u32);
        let attempt_deadline = now + budget;
        debug!("USSD attempt {} ({encoding:?}): {command}", i + 1);

        let accept = session.expect(&command, "OK", ACCEPT_TIMEOUT.min(budget));
        if accept.terminal == Terminal::Error {
            debug!("encoding {encoding:?} rejected: {}", accept.text.trim());
            rejected += 1;
            last_raw = accept.text;
            continue;
        }

        // Accepted (or still silent) — wait out this attempt's share for a
        // recognizable reply, counting text already accumulated.
        let prefix = accept.text;
        let wait = attempt_deadline.saturating_duration_since(Instant::now());
        let more = session.wait_until(wait, |t| {
            let combined = format!("{prefix}{t}");
            find_reply(&combined).is_some() || combined.contains("ERROR")
        });
        let raw = format!("{prefix}{}", more.text);

        if let Some((status, payload)) = find_reply(&raw) {
            let text = payload.map(|p| decode_payload(&p)).unwrap_or_default();
            info!("USSD reply (status {status}): {text}");
            return Ok(UssdExchange {
                code: code.to_string(),
                encoding,
                status,
                text,
                raw,
            });
        }

        if raw.contains("ERROR") {
            debug!("encoding {encoding:?} errored after acceptance");
            rejected += 1;
        }
        last_raw = raw;
    }

    if rejected == attempts {
        warn!("USSD {code}: every request encoding rejected");
        Err(ModemError::EncodingExhausted { raw: last_raw })
    } else {
        warn!("USSD {code}: no reply before timeout");
        Err(ModemError::CommandTimeout {
            timeout,
            raw: last_raw,
        })
    }
}

/// Cancel any active USSD session.
pub fn cancel(session: &mut AtSession) -> bool {
    session.send_expect("AT+CUSD=2", ACCEPT_TIMEOUT)
}

/// Whether the modem advertises the CUSD command set at all.
pub fn supported(session: &mut AtSession) -> bool {
    session
        .send_collect("AT+CUSD=?", ACCEPT_TIMEOUT)
        .contains("+CUSD:")
}

/// One-off USSD against a freshly opened port, for diagnostics paths that
/// don't hold the long-lived session. Must not run concurrently with the
/// shared session on the same physical device.
pub fn execute_oneshot(
    cfg: &ModemConfig,
    path: &str,
    code: &str,
    timeout: Duration,
) -> Result<UssdExchange, ModemError> {
    let endpoint = cfg.endpoint(path);
    let mut session = AtSession::open(&endpoint)?;
    std::thread::sleep(OPEN_SETTLE);

    if !session.send_expect("AT", CANCEL_TIMEOUT) {
        return Err(ModemError::HandshakeTimeout(path.to_string()));
    }
    execute(&mut session, code, timeout)
}

/// The four request encodings, in the order networks tend to accept them.
fn request_variants(code: &str) -> Vec<(UssdEncoding, String)> {
    vec![
        (UssdEncoding::Gsm7, format!("AT+CUSD=1,\"{code}\",15")),
        (UssdEncoding::Ucs2Text, format!("AT+CUSD=1,\"{code}\",72")),
        (UssdEncoding::Unspecified, format!("AT+CUSD=1,\"{code}\"")),
        (
            UssdEncoding::Ucs2Hex,
            format!("AT+CUSD=1,\"{}\",72", ucs2_hex(code)),
        ),
    ]
}

/// Transcode to UCS-2 hex code points: `*` → `002A`.
fn ucs2_hex(code: &str) -> String {
    code.chars().map(|c| format!("{:04X}", c as u32)).collect()
}

/// Match the reply against the known `+CUSD` shapes, most specific first.
/// Returns the result status and the payload, when one is attached.
fn find_reply(raw: &str) -> Option<(u8, Option<String>)> {
    for shape in patterns::CUSD_SHAPES.iter() {
        if let Some(caps) = shape.captures(raw) {
            let status = caps[1].parse().unwrap_or(u8::MAX);
            let payload = caps
                .get(2)
                .map(|m| m.as_str().trim().to_string())
                .filter(|p| !p.is_empty());
            return Some((status, payload));
        }
    }
    None
}

/// Hex-decode the payload when it is hex; otherwise it already is the text.
/// Control characters are flattened either way.
fn decode_payload(payload: &str) -> String {
    let text = match decode_hex_payload(payload) {
        HexPayload::Decoded(text) => text,
        HexPayload::NotHex | HexPayload::Undecodable => payload.to_string(),
    };
    collapse_controls(&text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fake::ScriptedTransport;

    #[test]
    fn test_execute_negotiates_second_encoding() {
        // First encoding rejected, second accepted with a hex payload.
        let io = ScriptedTransport::new(vec![
            ("AT+CUSD=2", "\r\nOK\r\n"),
            ("AT+CUSD=1,\"*125#\",15", "\r\nERROR\r\n"),
            (
                "AT+CUSD=1,\"*125#\",72",
                "\r\nOK\r\n\r\n+CUSD: 0,\"3136323335\",15\r\n",
            ),
        ]);
        let mut session = AtSession::new(Box::new(io));
        let exchange = execute(&mut session, "*125#", Duration::from_secs(5)).unwrap();
        assert_eq!(exchange.encoding, UssdEncoding::Ucs2Text);
        assert_eq!(exchange.status, 0);
        assert_eq!(exchange.text, "16235");
        assert!(!exchange.session_active());
    }

    #[test]
    fn test_execute_plain_text_reply_with_menu() {
        let io = ScriptedTransport::new(vec![
            ("AT+CUSD=2", "\r\nOK\r\n"),
            (
                "AT+CUSD=1,\"*144#\",15",
                "\r\nOK\r\n\r\n+CUSD: 1,\"1. Saldo\r\n2. Recargas\",15\r\n",
            ),
        ]);
        let mut session = AtSession::new(Box::new(io));
        let exchange = execute(&mut session, "*144#", Duration::from_secs(5)).unwrap();
        assert_eq!(exchange.status, 1);
        assert!(exchange.session_active());
        // CR/LF inside the menu collapsed to single spaces
        assert_eq!(exchange.text, "1. Saldo 2. Recargas");
    }

    #[test]
    fn test_execute_status_only_reply() {
        let io = ScriptedTransport::new(vec![
            ("AT+CUSD=2", "\r\nOK\r\n"),
            ("AT+CUSD=1,\"*100#\",15", "\r\nOK\r\n\r\n+CUSD: 2\r\n"),
        ]);
        let mut session = AtSession::new(Box::new(io));
        let exchange = execute(&mut session, "*100#", Duration::from_secs(5)).unwrap();
        assert_eq!(exchange.status, 2);
        assert!(exchange.text.is_empty());
    }

    #[test]
    fn test_continue_session_never_cancels() {
        let io = ScriptedTransport::new(vec![(
            "AT+CUSD=1,\"1\",15",
            "\r\nOK\r\n\r\n+CUSD: 1,\"Envie o valor\",15\r\n",
        )]);
        let writes = io.writes.clone();
        let mut session = AtSession::new(Box::new(io));
        let exchange = continue_session(&mut session, "1", Duration::from_secs(5)).unwrap();
        assert_eq!(exchange.status, 1);
        assert_eq!(exchange.text, "Envie o valor");
        let writes = writes.lock().unwrap();
        assert!(!writes.iter().any(|w| w.contains("AT+CUSD=2")));
    }

    #[test]
    fn test_execute_all_encodings_rejected() {
        let io = ScriptedTransport::new(vec![
            ("AT+CUSD=2", "\r\nOK\r\n"),
            ("AT+CUSD=1,\"*125#\",15", "\r\nERROR\r\n"),
            ("AT+CUSD=1,\"*125#\",72", "\r\nERROR\r\n"),
            ("AT+CUSD=1,\"*125#\"", "\r\nERROR\r\n"),
            ("AT+CUSD=1,\"002A0031003200350023\",72", "\r\nERROR\r\n"),
        ]);
        let mut session = AtSession::new(Box::new(io));
        let err = execute(&mut session, "*125#", Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, ModemError::EncodingExhausted { .. }));
    }

    #[test]
    fn test_execute_silence_is_timeout_not_rejection() {
        let io = ScriptedTransport::new(vec![("AT+CUSD=2", "\r\nOK\r\n")]);
        let mut session = AtSession::new(Box::new(io));
        let err = execute(&mut session, "*125#", Duration::from_millis(400)).unwrap_err();
        assert!(matches!(err, ModemError::CommandTimeout { .. }));
        assert!(err.is_timeout());
    }

    #[test]
    fn test_ucs2_hex_transcoding() {
        assert_eq!(ucs2_hex("*125#"), "002A0031003200350023");
    }

    #[test]
    fn test_find_reply_prefers_quoted_shape() {
        let (status, payload) = find_reply("+CUSD: 0,\"abc,def\",15\r\n").unwrap();
        assert_eq!(status, 0);
        assert_eq!(payload.as_deref(), Some("abc,def"));
    }

    #[test]
    fn test_find_reply_unquoted() {
        let (status, payload) = find_reply("+CUSD: 1,Escolha uma opcao\r\n").unwrap();
        assert_eq!(status, 1);
        assert_eq!(payload.as_deref(), Some("Escolha uma opcao"));
    }

    #[test]
    fn test_find_reply_waits_out_split_reads() {
        // Accumulation can pause anywhere; a half-arrived quoted payload
        // must not be taken for an unquoted one.
        assert!(find_reply("\r\n+CUSD: 0,\"3136").is_none());
        let (status, payload) = find_reply("\r\n+CUSD: 0,\"3136323335\",15\r\n").unwrap();
        assert_eq!(status, 0);
        assert_eq!(payload.as_deref(), Some("3136323335"));
    }

    #[test]
    fn test_decode_payload_passthrough_for_plain_text() {
        assert_eq!(decode_payload("Saldo: 100 MT"), "Saldo: 100 MT");
    }
}
