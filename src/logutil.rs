//! Logging helpers for peer-supplied text. binkp command arguments (M_NUL
//! lines, M_ERR reasons, file names) come straight off the wire and must not
//! be able to split or forge log lines.

const MAX_PREVIEW: usize = 200;

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///   Other control characters become `\xNN`. Output is capped at 200 chars.
pub fn escape_log(s: &str) -> String {
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Escape raw command bytes. binkp arguments are nominally ASCII; anything
/// else is decoded lossily first.
pub fn escape_bytes(b: &[u8]) -> String {
    escape_log(&String::from_utf8_lossy(b))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_newlines_and_controls() {
        assert_eq!(escape_log("SYS x\nZYZ\r\t\u{7}"), "SYS x\\nZYZ\\r\\t\\x07");
    }

    #[test]
    fn truncates_long_payloads() {
        let long = "a".repeat(500);
        let out = escape_log(&long);
        assert_eq!(out.chars().count(), MAX_PREVIEW + 1);
        assert!(out.ends_with('…'));
    }

    #[test]
    fn lossy_bytes() {
        assert_eq!(escape_bytes(b"OK\xff"), "OK\u{FFFD}");
    }
}
