//! Every wire response shape the engine matches, in one place.
//!
//! AT responses have no framing beyond line text, so parsing is pattern
//! matching over the raw accumulation buffer. Keeping all shapes in one
//! module lets them be exercised directly against recorded device
//! transcripts when a vendor does something new.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// `+CMS ERROR: 305` / `+CME ERROR: 258` — numeric failure detail.
    pub static ref ERROR_CODE: Regex =
        Regex::new(r"\+(?:CMS|CME) ERROR:\s*(\d+)").unwrap();

    /// `+CMGS: 42` — message reference after a successful send. The line
    /// break is part of the match: accumulation polls on this pattern, and
    /// without it a read split mid-number would yield a truncated id.
    pub static ref CMGS_REF: Regex = Regex::new(r"\+CMGS:\s*(\d+)\s*\r?\n").unwrap();

    /// `+CMGL: 3,"REC UNREAD","+258841234567",,"24/06/30,14:22:05+08"` then
    /// the body on the following line. Alpha field between sender and
    /// timestamp is frequently empty and unquoted, hence `[^,]*`.
    pub static ref CMGL_RECORD: Regex =
        Regex::new(r#"\+CMGL:\s*(\d+),\s*"([^"]*)",\s*"([^"]*)",[^,]*,\s*"([^"]*)"\r?\n([^\r\n]+)"#)
            .unwrap();

    /// `+CSCA: "+25884080020",145` — service-center address.
    pub static ref CSCA_ADDR: Regex = Regex::new(r#"\+CSCA:\s*"([^"]+)""#).unwrap();

    /// `+CSQ: 17,99` — raw RSSI index.
    pub static ref CSQ_RSSI: Regex = Regex::new(r"\+CSQ:\s*(\d+),").unwrap();

    /// `+COPS: 0,0,"Vodacom",7` — registered operator name.
    pub static ref COPS_OPERATOR: Regex =
        Regex::new(r#"\+COPS:\s*\d+,\d+,"([^"]+)""#).unwrap();

    /// Dialable USSD code shape: `*125#`, `*150*841112233#`, `#123#`.
    pub static ref USSD_CODE: Regex = Regex::new(r"^[*#]\d+([*#]\d+)*#?$").unwrap();

    /// USSD replies, most to least specific. Tried in order; first match wins.
    ///
    /// 1. quoted payload with status and optional data-coding scheme
    /// 2. unquoted payload (some firmwares skip the quotes)
    /// 3. status only — a network action with no text attached
    ///
    /// Every shape requires the terminating line break. Accumulation polls
    /// on these patterns, and a read can split anywhere: without the
    /// terminator, `+CUSD: 0,"3136` (half of a quoted hex payload) would
    /// match shape 2 and `+CUSD: 0` alone would match shape 3. The unquoted
    /// payload additionally must not start with a quote, so the first line
    /// of a still-arriving multi-line quoted payload never passes as shape 2.
    pub static ref CUSD_SHAPES: [Regex; 3] = [
        Regex::new(r#"\+CUSD:\s*(\d+),"([^"]*)"(?:,(\d+))?\s*\r?\n"#).unwrap(),
        Regex::new(r#"\+CUSD:\s*(\d+),([^",\r\n][^,\r\n]*?)\s*(?:,(\d+))?\r?\n"#).unwrap(),
        Regex::new(r"\+CUSD:\s*(\d+)\s*\r?\n").unwrap(),
    ];
}

/// Extract the numeric CMS/CME error code from raw response text, if any.
pub fn extract_error_code(raw: &str) -> Option<u16> {
    ERROR_CODE
        .captures(raw)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_cms() {
        assert_eq!(extract_error_code("+CMS ERROR: 305\r\n"), Some(305));
    }

    #[test]
    fn test_error_code_cme() {
        assert_eq!(extract_error_code("junk\r\n+CME ERROR: 258\r\n"), Some(258));
    }

    #[test]
    fn test_error_code_bare_error() {
        assert_eq!(extract_error_code("\r\nERROR\r\n"), None);
    }

    #[test]
    fn test_cmgs_ref() {
        let caps = CMGS_REF.captures("\r\n+CMGS: 42\r\n\r\nOK\r\n").unwrap();
        assert_eq!(&caps[1], "42");
    }

    #[test]
    fn test_cmgs_ref_requires_line_break() {
        // A read split mid-number must not yield a truncated id.
        assert!(!CMGS_REF.is_match("\r\n+CMGS: 4"));
        let caps = CMGS_REF.captures("\r\n+CMGS: 42\r\n").unwrap();
        assert_eq!(&caps[1], "42");
    }

    #[test]
    fn test_cmgl_record_with_empty_alpha() {
        let raw = "+CMGL: 3,\"REC UNREAD\",\"+258841234567\",,\"24/06/30,14:22:05+08\"\r\nOla mundo\r\nOK\r\n";
        let caps = CMGL_RECORD.captures(raw).unwrap();
        assert_eq!(&caps[1], "3");
        assert_eq!(&caps[2], "REC UNREAD");
        assert_eq!(&caps[3], "+258841234567");
        assert_eq!(&caps[4], "24/06/30,14:22:05+08");
        assert_eq!(&caps[5], "Ola mundo");
    }

    #[test]
    fn test_csca() {
        let caps = CSCA_ADDR.captures("+CSCA: \"+25884080020\",145\r\nOK").unwrap();
        assert_eq!(&caps[1], "+25884080020");
    }

    #[test]
    fn test_ussd_code_shapes() {
        assert!(USSD_CODE.is_match("*125#"));
        assert!(USSD_CODE.is_match("*150*841112233#"));
        assert!(USSD_CODE.is_match("#123#"));
        assert!(!USSD_CODE.is_match("125"));
        assert!(!USSD_CODE.is_match("*12a#"));
        assert!(!USSD_CODE.is_match(""));
    }

    #[test]
    fn test_cusd_quoted_with_dcs() {
        let caps = CUSD_SHAPES[0]
            .captures("+CUSD: 0,\"3136323335\",15\r\n")
            .unwrap();
        assert_eq!(&caps[1], "0");
        assert_eq!(&caps[2], "3136323335");
        assert_eq!(caps.get(3).map(|m| m.as_str()), Some("15"));
    }

    #[test]
    fn test_cusd_unquoted() {
        let caps = CUSD_SHAPES[1].captures("+CUSD: 1,Escolha uma opcao\r\n").unwrap();
        assert_eq!(&caps[1], "1");
        assert_eq!(&caps[2], "Escolha uma opcao");
    }

    #[test]
    fn test_cusd_status_only() {
        let caps = CUSD_SHAPES[2].captures("+CUSD: 2\r\n").unwrap();
        assert_eq!(&caps[1], "2");
    }

    #[test]
    fn test_cusd_shapes_ignore_partial_lines() {
        // Half of a quoted hex payload: no shape may match yet.
        for shape in CUSD_SHAPES.iter() {
            assert!(!shape.is_match("\r\n+CUSD: 0,\"3136"));
        }
        // First line of a multi-line quoted payload, break included: the
        // unquoted and status-only shapes must still wait.
        assert!(!CUSD_SHAPES[1].is_match("+CUSD: 1,\"1. Saldo\r\n"));
        assert!(!CUSD_SHAPES[2].is_match("+CUSD: 1,\"1. Saldo\r\n"));
        // A bare status with no line break yet is also incomplete.
        assert!(!CUSD_SHAPES[2].is_match("+CUSD: 2"));
    }
}
