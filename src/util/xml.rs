//! XML escaping. DIDL-Lite travels as text embedded inside a SOAP
//! `<Result>` element, so it crosses two XML parses on the way to the
//! client: once for the SOAP envelope itself, once more when the client
//! unwraps `<Result>` and reparses the DIDL-Lite document inside it. The
//! double-escaped forms below are what survive that round trip.

const SINGLE: &[(char, &str)] = &[
    ('&', "&amp;"),
    ('<', "&lt;"),
    ('>', "&gt;"),
    ('"', "&quot;"),
    ('\'', "&#39;"),
];

const DOUBLE: &[(char, &str)] = &[
    ('&', "&amp;amp;"),
    ('<', "&amp;lt;"),
    ('>', "&amp;gt;"),
    ('"', "&amp;quot;"),
    ('\'', "&amp;#39;"),
];

fn escape_with(s: &str, table: &[(char, &str)]) -> String {
    if !s.chars().any(|c| table.iter().any(|(from, _)| *from == c)) {
        return s.to_string();
    }
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match table.iter().find(|(from, _)| *from == c) {
            Some((_, to)) => out.push_str(to),
            None => out.push(c),
        }
    }
    out
}

/// Single-level XML escape, for SOAP envelope text nodes.
pub fn xml_escape(s: &str) -> String {
    escape_with(s, SINGLE)
}

/// Double escape, for DIDL-Lite embedded inside a SOAP `<Result>`.
pub fn xml_escape_double(s: &str) -> String {
    escape_with(s, DOUBLE)
}

/// Single-level in-place-style decode of the five named entities.
pub fn xml_unescape(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'&' {
            if let Some(rest) = s.get(i..) {
                if let Some(stripped) = rest.strip_prefix("&amp;") {
                    out.push('&');
                    i += rest.len() - stripped.len();
                    continue;
                } else if let Some(stripped) = rest.strip_prefix("&lt;") {
                    out.push('<');
                    i += rest.len() - stripped.len();
                    continue;
                } else if let Some(stripped) = rest.strip_prefix("&gt;") {
                    out.push('>');
                    i += rest.len() - stripped.len();
                    continue;
                } else if let Some(stripped) = rest.strip_prefix("&quot;") {
                    out.push('"');
                    i += rest.len() - stripped.len();
                    continue;
                } else if let Some(stripped) = rest.strip_prefix("&#39;") {
                    out.push('\'');
                    i += rest.len() - stripped.len();
                    continue;
                }
            }
        }
        let ch = s[i..].chars().next().unwrap();
        out.push(ch);
        i += ch.len_utf8();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_escape_roundtrip() {
        let s = "Tom & Jerry <\"quoted\"> it's";
        assert_eq!(xml_unescape(&xml_escape(s)), s);
    }

    #[test]
    fn double_escape_then_single_unescape_yields_single_escaped() {
        // A client single-unescaping the Result text should recover the
        // once-escaped DIDL-Lite document exactly.
        let name = "Rock & Roll";
        let double = xml_escape_double(name);
        let once = xml_unescape(&double);
        assert_eq!(once, xml_escape(name));
    }

    #[test]
    fn escape_noop_when_clean() {
        let s = "plain-text-123";
        assert_eq!(xml_escape(s), s);
        assert_eq!(xml_escape_double(s), s);
    }
}
