//! Text encodings for the metadata stream
//!
//! Free-form values (paths, link targets) are URI-style percent-encoded
//! before they are written to the metadata stream; integers are printed in
//! an advisory base so that mode bits stay readable as octal.

/// Bytes passed through unencoded by [`uri_encode`].
///
/// The alphabet is `A-Z a-z 0-9 - _ . / ~` plus `%`. Keeping `%` in the
/// pass-through set makes the encoder idempotent: every `%` an encoded
/// string contains is already part of a `%xx` escape, so re-encoding is a
/// no-op.
fn is_passthrough(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b'/' | b'~' | b'%')
}

/// Perform URI-style escaping of a byte string. Bytes outside the
/// pass-through alphabet are encoded as `%xx` with lowercase hex digits.
pub fn uri_encode(input: &[u8]) -> String {
    let mut out = String::with_capacity(input.len());
    for &b in input {
        if is_passthrough(b) {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{:02x}", b));
        }
    }
    out
}

/// Decode a string produced by [`uri_encode`]. Malformed escapes (a `%`
/// not followed by two hex digits) are passed through unchanged.
pub fn uri_decode(input: &str) -> Vec<u8> {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            if let (Some(hi), Some(lo)) = (
                bytes.get(i + 1).and_then(|b| (*b as char).to_digit(16)),
                bytes.get(i + 2).and_then(|b| (*b as char).to_digit(16)),
            ) {
                out.push((hi * 16 + lo) as u8);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    out
}

/// Return the string representation of an integer. Produces hexadecimal or
/// octal output for positive values when asked; the base is advisory and
/// negative numbers always print in decimal.
pub fn format_int(n: i64, base: u32) -> String {
    match base {
        16 if n >= 0 => format!("0x{:x}", n),
        8 if n > 0 => format!("0{:o}", n),
        _ => format!("{}", n),
    }
}

/// Parse the string representation of an integer, recognizing the `0x`
/// and leading-`0` prefixes that [`format_int`] produces.
pub fn parse_int(s: &str) -> Option<i64> {
    if let Some(hex) = s.strip_prefix("0x") {
        return i64::from_str_radix(hex, 16).ok();
    }
    if s.len() > 1 && s.starts_with('0') {
        return i64::from_str_radix(&s[1..], 8).ok();
    }
    s.parse().ok()
}
