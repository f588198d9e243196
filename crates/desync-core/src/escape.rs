use std::fmt::Write as _;

/// Render raw wire bytes with everything outside printable ASCII escaped as
/// `\xHH`. Used only when writing PoC reports; the bytes on the wire stay
/// literal.
pub fn escape_non_printable(raw: &[u8]) -> String {
    let mut out = String::with_capacity(raw.len());
    for &b in raw {
        if (0x20..=0x7e).contains(&b) {
            out.push(b as char);
        } else {
            let _ = write!(out, "\\x{b:02X}");
        }
    }
    out
}
