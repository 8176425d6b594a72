//! Decoding of hex-encoded USSD/SMS payloads.
//!
//! Carriers answer USSD in whatever encoding the request negotiation landed
//! on, and several vendors hex-encode the octets on top. `decode_hex_payload`
//! turns such a string back into readable text by trying UTF-8, then Latin-1,
//! then big-endian UTF-16 (the UCS-2 wire form), in that order.

/// Outcome of [`decode_hex_payload`].
///
/// `NotHex` is not an error: callers fall back to treating the input as
/// already-plain text. `Undecodable` means the octets matched no known
/// encoding and the raw string is all there is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HexPayload {
    /// Valid hex whose octets decoded under one of the candidate encodings.
    Decoded(String),
    /// Input was not an even-length string of hex digits.
    NotHex,
    /// Valid hex, but no candidate encoding produced readable text.
    Undecodable,
}

/// Decode a hex-encoded octet string into readable text.
///
/// Whitespace is stripped first. Returns [`HexPayload::NotHex`] unless the
/// remainder is entirely hex digits with even length.
pub fn decode_hex_payload(payload: &str) -> HexPayload {
    let clean: String = payload.chars().filter(|c| !c.is_whitespace()).collect();

    if clean.is_empty() || clean.len() % 2 != 0 || !clean.chars().all(|c| c.is_ascii_hexdigit()) {
        return HexPayload::NotHex;
    }

    let bytes: Vec<u8> = (0..clean.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&clean[i..i + 2], 16).unwrap_or(0))
        .collect();

    if let Some(text) = try_utf8(&bytes) {
        return HexPayload::Decoded(text);
    }
    if let Some(text) = try_latin1(&bytes) {
        return HexPayload::Decoded(text);
    }
    if let Some(text) = try_utf16_be(&bytes) {
        return HexPayload::Decoded(text);
    }

    HexPayload::Undecodable
}

/// Collapse CR/LF/NUL and other control characters into single spaces.
///
/// USSD menu replies arrive with embedded CR/LF separators and the occasional
/// stale NUL; flattening them keeps the text renderable on one line.
pub fn collapse_controls(text: &str) -> String {
    let flattened: String = text
        .chars()
        .map(|c| {
            if c.is_control() || c == '\u{FFFD}' {
                ' '
            } else {
                c
            }
        })
        .collect();
    flattened.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// A decode "succeeds" only when the result is actually readable: control
/// characters outside CR/LF/TAB mean the bytes belong to a different
/// encoding (UCS-2 text read as UTF-8 is full of NUL high bytes).
fn is_readable(text: &str) -> bool {
    text.chars()
        .all(|c| !c.is_control() || c == '\r' || c == '\n' || c == '\t')
}

fn try_utf8(bytes: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(bytes).ok()?;
    is_readable(text).then(|| text.to_string())
}

/// ISO-8859-1 maps every byte, so "failure" here means the result contains
/// C0 controls or the undefined 0x80–0x9F range.
fn try_latin1(bytes: &[u8]) -> Option<String> {
    if bytes.iter().any(|&b| (0x80..=0x9F).contains(&b)) {
        return None;
    }
    let text: String = bytes.iter().map(|&b| b as char).collect();
    is_readable(&text).then_some(text)
}

fn try_utf16_be(bytes: &[u8]) -> Option<String> {
    if bytes.len() % 2 != 0 {
        return None;
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect();
    let text = String::from_utf16(&units).ok()?;
    is_readable(&text).then_some(text)
}
