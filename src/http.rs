use std::collections::{BTreeMap, HashMap};

use anyhow::{bail, Result};

use crate::util::find_from;

/// Locate the header/body separator in `buffer`. Prefers `\r\n\r\n`, tolerates
/// `\n\n`. Returns the offset of the terminator and its length.
pub fn find_header_terminator(buffer: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = find_from(b"\r\n\r\n", buffer, 0) {
        return Some((pos, 4));
    }
    find_from(b"\n\n", buffer, 0).map(|pos| (pos, 2))
}

/// Parse a block of `Name: value` lines. Names are lowercased, values are
/// trimmed of spaces and tabs, duplicate names are last-wins. Lines without a
/// colon are skipped.
pub fn parse_headers(header_block: &str) -> HashMap<String, String> {
    let mut headers = HashMap::new();
    for line in header_block.lines() {
        let colon = match line.find(':') {
            Some(colon) => colon,
            None => continue,
        };
        let name = line[..colon].to_lowercase();
        let value = line[colon + 1..].trim_matches(|c| c == ' ' || c == '\t');
        headers.insert(name, value.to_string());
    }
    headers
}

#[derive(Debug, Clone, Default)]
pub struct HttpRequest {
    method: String,
    path: String,
    query_string: String,
    version: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl HttpRequest {
    /// Parse a fully-framed request. The buffer must hold the request line,
    /// the header block, and exactly the body bytes after the terminator.
    pub fn parse(raw: &[u8]) -> Result<HttpRequest> {
        let (header_end, sep_len) = match find_header_terminator(raw) {
            Some(terminator) => terminator,
            None => (raw.len(), 0),
        };
        let head = String::from_utf8_lossy(&raw[..header_end]).into_owned();
        let mut lines = head.lines();
        let request_line = lines.next().unwrap_or("");
        let mut parts = request_line.split_whitespace();
        let method = parts.next().unwrap_or("").to_string();
        let target = parts.next().unwrap_or("").to_string();
        let version = parts.next().unwrap_or("").to_string();
        if method.is_empty() || target.is_empty() {
            bail!("malformed request line: {:?}", request_line);
        }

        let (path, query_string) = match target.find('?') {
            Some(pos) => (target[..pos].to_string(), target[pos + 1..].to_string()),
            None => (target, String::new()),
        };

        let header_block = match head.find('\n') {
            Some(pos) => &head[pos + 1..],
            None => "",
        };
        let headers = parse_headers(header_block);

        let body = if header_end + sep_len <= raw.len() {
            raw[header_end + sep_len..].to_vec()
        } else {
            Vec::new()
        };

        Ok(HttpRequest {
            method,
            path,
            query_string,
            version,
            headers,
            body,
        })
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn query_string(&self) -> &str {
        &self.query_string
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    /// Look up a header by name. Stored names are lowercase.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_lowercase()).map(String::as_str)
    }

    /// HTTP/1.1 defaults to keep-alive unless `Connection: close`; HTTP/1.0
    /// keeps the connection only on an explicit `Connection: keep-alive`.
    pub fn wants_keep_alive(&self) -> bool {
        let connection = self
            .header("connection")
            .map(str::to_lowercase)
            .unwrap_or_default();
        if self.version == "HTTP/1.1" {
            connection != "close"
        } else {
            connection == "keep-alive"
        }
    }
}

/// Progress of the chunked transfer decoder over a partially-received buffer.
#[derive(Debug, PartialEq)]
pub enum ChunkStatus {
    /// More bytes are needed before the body is complete.
    Incomplete,
    /// The decoded body exceeded the permitted size.
    TooLarge,
    /// The framing is invalid and the request cannot be recovered.
    Malformed,
    /// The full body was decoded; `consumed` is the buffer offset just past
    /// the trailing CRLF.
    Complete { consumed: usize, decoded: Vec<u8> },
}

/// Decode a chunked body starting at `start`. The running decoded size is
/// checked against `max_body` after each chunk.
pub fn decode_chunked_body(data: &[u8], start: usize, max_body: u64) -> ChunkStatus {
    let mut pos = start;
    let mut decoded = Vec::new();
    loop {
        let line_end = match find_from(b"\r\n", data, pos) {
            Some(line_end) => line_end,
            None => return ChunkStatus::Incomplete,
        };
        let size_line = String::from_utf8_lossy(&data[pos..line_end]).into_owned();
        let size_field = size_line
            .split(';')
            .next()
            .unwrap_or("")
            .trim_matches(|c| c == ' ' || c == '\t');
        if size_field.is_empty() {
            return ChunkStatus::Malformed;
        }
        let chunk_size = match usize::from_str_radix(size_field, 16) {
            Ok(chunk_size) => chunk_size,
            Err(_) => return ChunkStatus::Malformed,
        };
        pos = line_end + 2;
        if chunk_size == 0 {
            // Tolerate a single trailer line before the final CRLF.
            let trailer_end = match find_from(b"\r\n", data, pos) {
                Some(trailer_end) => trailer_end,
                None => return ChunkStatus::Incomplete,
            };
            return ChunkStatus::Complete {
                consumed: trailer_end + 2,
                decoded,
            };
        }
        if (decoded.len() as u64).saturating_add(chunk_size as u64) > max_body {
            return ChunkStatus::TooLarge;
        }
        if data.len() < pos + chunk_size + 2 {
            return ChunkStatus::Incomplete;
        }
        decoded.extend_from_slice(&data[pos..pos + chunk_size]);
        pos += chunk_size;
        if &data[pos..pos + 2] != b"\r\n" {
            return ChunkStatus::Malformed;
        }
        pos += 2;
    }
}

/// Rebuild a chunked request as an identity-framed one: the original request
/// line and headers minus `Transfer-Encoding`/`Content-Length`, a single
/// `Content-Length` for the decoded body, then the body itself.
pub fn normalize_chunked_request(buffer: &[u8], header_end: usize, decoded: &[u8]) -> Vec<u8> {
    let head = String::from_utf8_lossy(&buffer[..header_end]).into_owned();
    let mut lines = head.lines();
    let mut normalized = Vec::new();
    normalized.extend_from_slice(lines.next().unwrap_or("").as_bytes());
    normalized.extend_from_slice(b"\r\n");
    for line in lines {
        let colon = match line.find(':') {
            Some(colon) => colon,
            None => continue,
        };
        let name = line[..colon].to_lowercase();
        if name == "transfer-encoding" || name == "content-length" {
            continue;
        }
        normalized.extend_from_slice(line.as_bytes());
        normalized.extend_from_slice(b"\r\n");
    }
    normalized.extend_from_slice(format!("Content-Length: {}\r\n\r\n", decoded.len()).as_bytes());
    normalized.extend_from_slice(decoded);
    normalized
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    status: u16,
    headers: BTreeMap<String, String>,
    body: Vec<u8>,
}

impl HttpResponse {
    pub fn new() -> HttpResponse {
        HttpResponse {
            status: 200,
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn set_header<V: Into<String>>(&mut self, name: &str, value: V) {
        self.headers.insert(name.to_string(), value.into());
    }

    pub fn set_body<B: Into<Vec<u8>>>(&mut self, body: B) {
        self.body = body.into();
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// The number of body bytes this response declares, for access logging.
    pub fn content_length(&self) -> usize {
        self.headers
            .get("Content-Length")
            .and_then(|value| value.parse().ok())
            .unwrap_or_else(|| self.body().len())
    }

    pub fn set_default_error_body(&mut self) {
        let body = format!(
            "<html><body><h1>{}</h1></body></html>",
            status_message(self.status)
        );
        self.set_body(body.into_bytes());
        self.set_header("Content-Type", "text/html");
    }

    pub fn set_allow_header(&mut self, methods: &std::collections::BTreeSet<String>) {
        let allow = methods.iter().cloned().collect::<Vec<_>>().join(", ");
        self.set_header("Allow", allow);
    }

    /// Serialize the status line, headers, and body. `Content-Length` is set
    /// from the body size unless a handler already pinned it (CGI, HEAD,
    /// streamed files). For HEAD responses the body is omitted.
    pub fn generate(&mut self, is_head: bool) -> Vec<u8> {
        if !self.headers.contains_key("Content-Length") {
            let length = self.body.len().to_string();
            self.set_header("Content-Length", length);
        }
        let mut out = Vec::new();
        out.extend_from_slice(
            format!("HTTP/1.1 {} {}\r\n", self.status, status_message(self.status)).as_bytes(),
        );
        for (name, value) in &self.headers {
            out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        out.extend_from_slice(b"\r\n");
        if !is_head {
            out.extend_from_slice(&self.body);
        }
        out
    }
}

pub fn status_message(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        301 => "Moved Permanently",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        413 => "Payload Too Large",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        504 => "Gateway Timeout",
        _ => "Unknown",
    }
}
