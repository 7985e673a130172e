//! Cooking of literal source text: numbers, string and template escapes.

/// Numeric literal value, including `0x`/`0o`/`0b` prefixes, `_` separators
/// and a BigInt `n` suffix (read as a plain number).
pub(crate) fn number(text: &str) -> Option<f64> {
    let text = text.strip_suffix('n').unwrap_or(text).replace('_', "");
    let radix = match text.get(..2) {
        Some("0x" | "0X") => 16,
        Some("0o" | "0O") => 8,
        Some("0b" | "0B") => 2,
        _ => return text.parse::<f64>().ok(),
    };
    u64::from_str_radix(&text[2..], radix).ok().map(|n| n as f64)
}

/// Decode backslash escapes in the body of a string or template chunk.
pub(crate) fn unescape(raw: &str) -> String {
    if !raw.contains('\\') {
        return raw.to_string();
    }
    let mut out = String::with_capacity(raw.len());
    let mut chars = raw.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        let Some(escaped) = chars.next() else { break };
        match escaped {
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'b' => out.push('\u{8}'),
            'f' => out.push('\u{c}'),
            'v' => out.push('\u{b}'),
            '0' => out.push('\0'),
            // Line continuation.
            '\n' | '\u{2028}' | '\u{2029}' => {}
            '\r' => {
                chars.next_if_eq(&'\n');
            }
            'x' => {
                let hex: String = chars.by_ref().take(2).collect();
                out.push(code_point(&hex));
            }
            'u' => {
                let hex: String = if chars.next_if_eq(&'{').is_some() {
                    chars.by_ref().take_while(|&c| c != '}').collect()
                } else {
                    chars.by_ref().take(4).collect()
                };
                out.push(code_point(&hex));
            }
            other => out.push(other),
        }
    }
    out
}

fn code_point(hex: &str) -> char {
    u32::from_str_radix(hex, 16)
        .ok()
        .and_then(char::from_u32)
        .unwrap_or('\u{FFFD}')
}
