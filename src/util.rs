use chrono::{Local, TimeZone, Utc};

/// Return index of first occurrence of `needle` in `haystack`.
pub fn find(needle: &[u8], haystack: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    for i in 0..haystack.len() {
        if haystack[i..].starts_with(needle) {
            return Some(i);
        }
    }
    None
}

/// Return absolute index of first occurrence of `needle` at or after `from`.
pub fn find_from(needle: &[u8], haystack: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() {
        return None;
    }
    find(needle, &haystack[from..]).map(|i| i + from)
}

/// RFC1123 date for the `Date:` response header.
pub fn http_date(timestamp: libc::time_t) -> String {
    Utc.timestamp(timestamp, 0)
        .format("%a, %d %b %Y %H:%M:%S GMT")
        .to_string()
}

/// Bracketed Common Log Format timestamp in the local timezone.
pub fn clf_date(timestamp: libc::time_t) -> String {
    Local
        .timestamp(timestamp, 0)
        .format("[%d/%b/%Y:%H:%M:%S %z]")
        .to_string()
}

/// Escape markup characters so client-supplied names are inert in listing
/// and error pages.
pub fn html_escape(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Make a request field safe for the access log: quotes, backslashes,
/// control bytes, and non-ASCII are emitted as \xHH escapes.
pub fn log_escape(field: &str) -> String {
    let mut escaped = String::with_capacity(field.len());
    for &byte in field.as_bytes() {
        let printable =
            byte == b' ' || (byte.is_ascii_graphic() && byte != b'"' && byte != b'\\');
        if printable {
            escaped.push(byte as char);
        } else {
            escaped.push_str(&format!("\\x{:02x}", byte));
        }
    }
    escaped
}
