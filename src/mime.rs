use std::collections::HashMap;

use once_cell::sync::Lazy;

pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";

const DEFAULT_EXTENSIONS_MAP: &[&str] = &[
    "application/json        json",
    "application/ogg         ogg",
    "application/pdf         pdf",
    "application/wasm        wasm",
    "application/xml         xsl xml",
    "application/xml-dtd     dtd",
    "application/xslt+xml    xslt",
    "application/zip         zip",
    "audio/mpeg              mp2 mp3 mpga",
    "image/gif               gif",
    "image/jpeg              jpeg jpe jpg",
    "image/png               png",
    "image/svg+xml           svg",
    "image/x-icon            ico",
    "text/css                css",
    "text/html               html htm",
    "text/javascript         js",
    "text/plain              txt asc",
    "video/mpeg              mpeg mpe mpg",
    "video/quicktime         qt mov",
    "video/x-msvideo         avi",
    "video/mp4               mp4",
];

static MIME_MAP: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    let mut mime_map = HashMap::new();
    for line in DEFAULT_EXTENSIONS_MAP {
        add_mimetype_line(&mut mime_map, line);
    }
    mime_map
});

/// Add line from an extension map.
fn add_mimetype_line(mime_map: &mut HashMap<&'static str, &'static str>, line: &'static str) {
    let mut fields = line
        .split(|c| matches!(c, ' ' | '\t'))
        .filter(|field| !field.is_empty());
    let mimetype = match fields.next() {
        Some(mimetype) => mimetype,
        None => return, // empty line
    };
    if mimetype.starts_with('#') {
        return; // comment
    }
    for extension in fields {
        mime_map.insert(extension, mimetype);
    }
}

/// Get content type for a path, keyed by the extension after the last dot.
pub fn content_type_for(path: &str) -> &'static str {
    path.rsplit('.')
        .next()
        .and_then(|extension| MIME_MAP.get(extension).copied())
        .unwrap_or(DEFAULT_MIME_TYPE)
}
