//! Text-mode SMS: send, list, delete.
//!
//! Sending is the one place the AT protocol goes interactive: `AT+CMGS`
//! answers with a `>` body prompt instead of `OK`, the body goes out
//! terminated by Ctrl-Z, and the network's message reference arrives as a
//! delayed `+CMGS: <n>` line — sometimes tens of seconds later.

use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::ModemError;
use crate::patterns;
use crate::session::{AtSession, Terminal};

/// Wait for the `>` body prompt.
const PROMPT_TIMEOUT: Duration = Duration::from_secs(10);
/// Wait for the network to confirm the send.
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);
/// Wait for the full inbox listing.
const LIST_TIMEOUT: Duration = Duration::from_secs(15);
/// Per-record delete.
const DELETE_TIMEOUT: Duration = Duration::from_secs(5);

/// Ctrl-Z ends the message body in text mode.
const BODY_TERMINATOR: u8 = 0x1A;

/// A successful send: the network-assigned message reference.
#[derive(Debug, Clone, Serialize)]
pub struct SmsReceipt {
    pub message_id: String,
}

/// One message parsed from a `+CMGL` record.
#[derive(Debug, Clone, Serialize)]
pub struct InboundMessage {
    /// Storage index on the SIM (used for deletion).
    pub index: u32,
    /// Status tag as reported, e.g. `REC UNREAD`.
    pub status: String,
    pub sender: String,
    /// Timestamp string as reported by the modem, unparsed.
    pub timestamp: String,
    pub body: String,
}

/// Send one text message. The whole prompt → payload → confirmation sequence
/// runs on the exclusive session; raw device text rides along on failures.
pub fn send(
    session: &mut AtSession,
    country_prefix: &str,
    to: &str,
    body: &str,
) -> Result<SmsReceipt, ModemError> {
    let number = normalize_number(to, country_prefix);
    info!("sending SMS to {number} ({} chars)", body.len());

    let prompt = session.expect(&format!("AT+CMGS=\"{number}\""), ">", PROMPT_TIMEOUT);
    if !prompt.success {
        return Err(match prompt.terminal {
            Terminal::Error => ModemError::CommandRejected {
                code: prompt.error_code,
                raw: prompt.text,
            },
            _ => ModemError::CommandTimeout {
                timeout: PROMPT_TIMEOUT,
                raw: prompt.text,
            },
        });
    }

    let mut payload = body.as_bytes().to_vec();
    payload.push(BODY_TERMINATOR);
    session.write_raw(&payload)?;

    let confirm = session.wait_until(CONFIRM_TIMEOUT, |text| {
        patterns::CMGS_REF.is_match(text) || text.contains("ERROR")
    });

    if let Some(caps) = patterns::CMGS_REF.captures(&confirm.text) {
        let message_id = caps[1].to_string();
        info!("SMS accepted, message reference {message_id}");
        return Ok(SmsReceipt { message_id });
    }

    if confirm.text.contains("ERROR") {
        warn!("SMS send rejected: {}", confirm.text.trim());
        return Err(ModemError::CommandRejected {
            code: patterns::extract_error_code(&confirm.text),
            raw: confirm.text,
        });
    }

    warn!("SMS send confirmation timed out");
    Err(ModemError::CommandTimeout {
        timeout: CONFIRM_TIMEOUT,
        raw: confirm.text,
    })
}

/// List every stored message, optionally deleting each one after a
/// successful parse. A failed delete is logged and never retried — the
/// parsed record stays valid either way.
pub fn read_all(session: &mut AtSession, delete_after_read: bool) -> Vec<InboundMessage> {
    let raw = session.send_collect("AT+CMGL=\"ALL\"", LIST_TIMEOUT);
    let messages = parse_cmgl(&raw);

    if !messages.is_empty() {
        info!("read {} stored message(s)", messages.len());
    }

    if delete_after_read {
        for message in &messages {
            if !session.send_expect(&format!("AT+CMGD={}", message.index), DELETE_TIMEOUT) {
                warn!(
                    "failed to delete message {} from storage (continuing)",
                    message.index
                );
            }
        }
    }

    messages
}

/// Parse a multi-record `+CMGL` reply: header line then body line per record.
pub fn parse_cmgl(raw: &str) -> Vec<InboundMessage> {
    patterns::CMGL_RECORD
        .captures_iter(raw)
        .filter_map(|caps| {
            let index = caps[1].parse().ok()?;
            Some(InboundMessage {
                index,
                status: caps[2].to_string(),
                sender: caps[3].to_string(),
                timestamp: caps[4].to_string(),
                body: caps[5].trim().to_string(),
            })
        })
        .collect()
}

/// Normalize a destination number: strip everything but digits (and a
/// leading `+`), then prefix bare 9-digit local numbers with the configured
/// country code.
pub fn normalize_number(raw: &str, country_prefix: &str) -> String {
    let international = raw.trim_start().starts_with('+');
    let digits: String = raw.chars().filter(char::is_ascii_digit).collect();

    if international {
        return format!("+{digits}");
    }
    if digits.len() == 9 {
        debug!("prefixing local number with {country_prefix}");
        return format!("{country_prefix}{digits}");
    }
    digits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::fake::ScriptedTransport;

    #[test]
    fn test_send_success_extracts_reference() {
        let io = ScriptedTransport::new(vec![
            ("AT+CMGS=\"+258841112233\"", "\r\n> "),
            ("Ola mundo", "\r\n+CMGS: 42\r\n\r\nOK\r\n"),
        ]);
        let mut session = AtSession::new(Box::new(io));
        let receipt = send(&mut session, "+258", "841112233", "Ola mundo").unwrap();
        assert_eq!(receipt.message_id, "42");
    }

    #[test]
    fn test_send_rejected_at_prompt() {
        let io = ScriptedTransport::new(vec![(
            "AT+CMGS",
            "\r\n+CMS ERROR: 302\r\nERROR\r\n",
        )]);
        let mut session = AtSession::new(Box::new(io));
        let err = send(&mut session, "+258", "+258841112233", "x").unwrap_err();
        match err {
            ModemError::CommandRejected { code, raw } => {
                assert_eq!(code, Some(302));
                assert!(raw.contains("+CMS ERROR: 302"));
            }
            other => panic!("expected rejection, got {other:?}"),
        }
    }

    #[test]
    fn test_send_error_after_body() {
        let io = ScriptedTransport::new(vec![
            ("AT+CMGS", "\r\n> "),
            ("boom", "\r\nERROR\r\n"),
        ]);
        let mut session = AtSession::new(Box::new(io));
        let err = send(&mut session, "+258", "+258841112233", "boom").unwrap_err();
        assert!(matches!(err, ModemError::CommandRejected { .. }));
    }

    #[test]
    fn test_read_all_parses_and_deletes() {
        let listing = "+CMGL: 1,\"REC UNREAD\",\"+258841234567\",,\"24/06/30,14:22:05+08\"\r\n\
                       Saldo baixo\r\n\
                       +CMGL: 5,\"REC READ\",\"151\",,\"24/06/30,15:00:11+08\"\r\n\
                       Promocao ativa\r\n\
                       OK\r\n";
        let io = ScriptedTransport::new(vec![
            ("AT+CMGL=\"ALL\"", listing),
            ("AT+CMGD=1", "\r\nOK\r\n"),
            ("AT+CMGD=5", "\r\nOK\r\n"),
        ]);
        let mut session = AtSession::new(Box::new(io));
        let messages = read_all(&mut session, true);
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].index, 1);
        assert_eq!(messages[0].sender, "+258841234567");
        assert_eq!(messages[0].body, "Saldo baixo");
        assert_eq!(messages[1].index, 5);
        assert_eq!(messages[1].status, "REC READ");
    }

    #[test]
    fn test_read_all_delete_failure_keeps_record() {
        let listing = "+CMGL: 2,\"REC UNREAD\",\"+258841234567\",,\"24/06/30,14:22:05+08\"\r\n\
                       ainda aqui\r\nOK\r\n";
        let io = ScriptedTransport::new(vec![
            ("AT+CMGL=\"ALL\"", listing),
            ("AT+CMGD=2", "\r\nERROR\r\n"),
        ]);
        let mut session = AtSession::new(Box::new(io));
        let messages = read_all(&mut session, true);
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].body, "ainda aqui");
    }

    #[test]
    fn test_read_all_empty_inbox() {
        let io = ScriptedTransport::new(vec![("AT+CMGL=\"ALL\"", "\r\nOK\r\n")]);
        let mut session = AtSession::new(Box::new(io));
        assert!(read_all(&mut session, true).is_empty());
    }

    #[test]
    fn test_normalize_number() {
        assert_eq!(normalize_number("841112233", "+258"), "+258841112233");
        assert_eq!(normalize_number("84 111-22.33", "+258"), "+258841112233");
        assert_eq!(normalize_number("+258841112233", "+258"), "+258841112233");
        assert_eq!(normalize_number("258841112233", "+258"), "258841112233");
        assert_eq!(normalize_number("+1 (555) 010-9999", "+258"), "+15550109999");
    }
}
