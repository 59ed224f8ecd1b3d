use std::cmp::max;
use std::fs::{self, File};
use std::os::unix::fs::DirBuilderExt;

use crate::config::{LocationConfig, ServerConfig};
use crate::http::{HttpRequest, HttpResponse};
use crate::mime;
use crate::resolve::resolve_path;
use crate::server::{FileStream, FILE_CHUNK_BYTES};
use crate::util::{find_from, html_escape};

/// What the router decided for a request. CGI hand-offs return without a
/// response; the reactor builds one when the child completes.
pub enum Dispatch {
    Response(HttpResponse),
    Stream(HttpResponse, FileStream),
    Cgi,
}

/// Route a parsed request. Selection order: OPTIONS, CGI trigger, allowed
/// methods, redirect, method dispatch, 501.
pub fn dispatch(request: &HttpRequest, config: &ServerConfig, now: libc::time_t) -> Dispatch {
    let location = config.find_location(request.path());
    let effective_root = config.effective_root(request.path()).to_string();
    let method = request.method();

    if method == "OPTIONS" {
        return Dispatch::Response(handle_options(request, config));
    }

    if location.is_cgi_path(request.path()) && matches!(method, "GET" | "HEAD" | "POST") {
        return Dispatch::Cgi;
    }

    let allowed = config.allowed_methods_for(request.path());
    if !allowed.contains(method) {
        let mut response = error_page_response(405, config);
        response.set_allow_header(&allowed);
        return Dispatch::Response(response);
    }

    if !location.redirect.is_empty() {
        return Dispatch::Response(redirect_response(&location.redirect));
    }

    match method {
        "GET" | "HEAD" => {
            handle_get_head(request, config, location, &effective_root, method == "HEAD")
        }
        "POST" => Dispatch::Response(handle_post(request, config, location, &effective_root, now)),
        "PUT" => Dispatch::Response(handle_put(request, config, location, &effective_root, now)),
        "DELETE" => Dispatch::Response(handle_delete(request, config, &effective_root)),
        _ => Dispatch::Response(error_page_response(501, config)),
    }
}

/// Build an error response, honoring the server's error-page overrides. The
/// page path goes through the same resolver as any other request so a
/// misconfigured page cannot become a traversal vector.
pub fn error_page_response(status: u16, config: &ServerConfig) -> HttpResponse {
    let mut response = HttpResponse::new();
    response.set_status(status);
    if let Some(page) = config.error_pages.get(&status) {
        if let Some(path) = resolve_path(config, &config.root, page) {
            if let Ok(body) = fs::read(&path) {
                response.set_body(body);
                response.set_header("Content-Type", "text/html");
                return response;
            }
        }
    }
    response.set_default_error_body();
    response
}

fn redirect_response(url: &str) -> HttpResponse {
    let mut response = HttpResponse::new();
    response.set_status(301);
    response.set_header("Location", url);
    response.set_header("Content-Type", "text/html");
    response.set_body(
        format!(
            "<html><body><h1>301 Moved Permanently</h1>\
             <p>The document has moved to <a href=\"{0}\">{0}</a></p></body></html>",
            url
        )
        .into_bytes(),
    );
    response
}

fn handle_options(request: &HttpRequest, config: &ServerConfig) -> HttpResponse {
    let mut methods = config.allowed_methods_for(request.path());
    methods.insert("OPTIONS".to_string());
    let mut response = HttpResponse::new();
    response.set_status(200);
    response.set_allow_header(&methods);
    response.set_header("Content-Length", "0");
    response
}

fn handle_get_head(
    request: &HttpRequest,
    config: &ServerConfig,
    location: &LocationConfig,
    effective_root: &str,
    is_head: bool,
) -> Dispatch {
    let resolved = match resolve_path(config, effective_root, request.path()) {
        Some(resolved) => resolved,
        None => return Dispatch::Response(error_page_response(403, config)),
    };
    let metadata = match fs::metadata(&resolved) {
        Ok(metadata) => metadata,
        Err(_) => return Dispatch::Response(error_page_response(404, config)),
    };

    if metadata.is_dir() {
        // The location-specific index takes priority over the server list.
        let mut index_files = config.index_files.clone();
        if !location.index.is_empty() && !index_files.contains(&location.index) {
            index_files.insert(0, location.index.clone());
        }
        if index_files.is_empty() {
            index_files.push("index.html".to_string());
        }
        for index_name in &index_files {
            if let Some(index_path) = resolve_path(config, &resolved, index_name) {
                if let Ok(index_metadata) = fs::metadata(&index_path) {
                    if index_metadata.is_file() {
                        return serve_file(&index_path, index_metadata.len(), config, is_head);
                    }
                }
            }
        }
        if location.autoindex {
            return Dispatch::Response(directory_listing(&resolved, request.path(), config));
        }
        Dispatch::Response(error_page_response(404, config))
    } else if metadata.is_file() {
        serve_file(&resolved, metadata.len(), config, is_head)
    } else {
        Dispatch::Response(error_page_response(403, config))
    }
}

/// Serve a regular file. Small files are buffered whole; anything larger
/// than one chunk is handed to the reactor as a FileStream so a slow client
/// cannot pin a large allocation.
fn serve_file(path: &str, size: u64, config: &ServerConfig, is_head: bool) -> Dispatch {
    let mut response = HttpResponse::new();
    response.set_status(200);
    response.set_header("Content-Type", mime::content_type_for(path));
    if is_head {
        response.set_header("Content-Length", size.to_string());
        return Dispatch::Response(response);
    }
    if size > FILE_CHUNK_BYTES as u64 {
        match File::open(path) {
            Ok(file) => {
                response.set_header("Content-Length", size.to_string());
                Dispatch::Stream(response, FileStream::new(file, size))
            }
            Err(error) => Dispatch::Response(open_error_response(&error, config)),
        }
    } else {
        match fs::read(path) {
            Ok(body) => {
                response.set_body(body);
                Dispatch::Response(response)
            }
            Err(error) => Dispatch::Response(open_error_response(&error, config)),
        }
    }
}

/// mkdir -p with the upload-store mode.
fn create_dir_tree(path: &str) -> std::io::Result<()> {
    fs::DirBuilder::new().recursive(true).mode(0o755).create(path)
}

fn open_error_response(error: &std::io::Error, config: &ServerConfig) -> HttpResponse {
    let status = match error.kind() {
        std::io::ErrorKind::PermissionDenied => 403,
        std::io::ErrorKind::NotFound => 404,
        _ => 500,
    };
    error_page_response(status, config)
}

fn directory_listing(dir_path: &str, request_path: &str, config: &ServerConfig) -> HttpResponse {
    let entries = match fs::read_dir(dir_path) {
        Ok(entries) => entries,
        Err(_) => return error_page_response(500, config),
    };
    let mut entries: Vec<_> = entries.filter_map(|entry| entry.ok()).collect();
    entries.sort_by_key(|entry| entry.file_name());

    let mut items = String::new();
    for entry in &entries {
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        let mut href = request_path.to_string();
        if !href.ends_with('/') {
            href.push('/');
        }
        href.push_str(&name);
        if is_dir {
            href.push('/');
        }
        items.push_str(&format!(
            "<li><a href=\"{}\">{}{}</a></li>",
            href,
            html_escape(&name),
            if is_dir { "/" } else { "" }
        ));
    }

    let mut response = HttpResponse::new();
    response.set_status(200);
    response.set_header("Content-Type", "text/html");
    response.set_body(
        format!(
            "<!DOCTYPE html><html><head><title>Index of {0}</title></head>\
             <body><h1>Index of {0}</h1><ul>{1}</ul></body></html>",
            html_escape(request_path),
            items
        )
        .into_bytes(),
    );
    response
}

fn handle_post(
    request: &HttpRequest,
    config: &ServerConfig,
    location: &LocationConfig,
    effective_root: &str,
    now: libc::time_t,
) -> HttpResponse {
    if location.upload_store.is_empty() {
        let mut response = error_page_response(405, config);
        response.set_allow_header(&config.allowed_methods_for(request.path()));
        return response;
    }
    if request.body().len() as u64 > config.client_max_body_size {
        return error_page_response(413, config);
    }

    // A leading slash on the upload store still means "under the root".
    let upload_store = location.upload_store.trim_start_matches('/');
    let upload_dir = match resolve_path(config, effective_root, upload_store) {
        Some(upload_dir) => upload_dir,
        None => return error_page_response(500, config),
    };
    if !fs::metadata(&upload_dir).map(|m| m.is_dir()).unwrap_or(false) {
        if let Err(error) = create_dir_tree(&upload_dir) {
            eprintln!(
                "warning: could not create upload directory {}: {}",
                upload_dir, error
            );
            return error_page_response(500, config);
        }
    }

    let content_type = request.header("content-type").unwrap_or("");
    let mut saved: Option<(String, String)> = None;

    if content_type.to_lowercase().starts_with("multipart/form-data") {
        if let Some(boundary) = extract_boundary(content_type) {
            if let Some((filename, content)) = first_file_part(request.body(), &boundary) {
                if let Some(full_path) = resolve_path(config, &upload_dir, &filename) {
                    if fs::write(&full_path, content).is_ok() {
                        saved = Some((filename, full_path));
                    }
                }
            }
        }
    }

    // Not multipart, or multipart parsing failed: save the raw body.
    if saved.is_none() {
        let filename = suggest_filename_from_headers(request)
            .unwrap_or_else(|| format!("upload_{}", now));
        let full_path = match resolve_path(config, &upload_dir, &filename) {
            Some(full_path) => full_path,
            None => return error_page_response(500, config),
        };
        if fs::write(&full_path, request.body()).is_err() {
            return error_page_response(500, config);
        }
        saved = Some((filename, full_path));
    }

    let (filename, full_path) = saved.unwrap();
    let mut response = HttpResponse::new();
    response.set_status(201);
    response.set_header("Content-Type", "text/html");
    response.set_body(
        format!(
            "<html><body><h1>File uploaded successfully to {}</h1></body></html>",
            full_path
        )
        .into_bytes(),
    );
    let request_path = request.path();
    let location_value = if request_path.ends_with('/') {
        format!("{}{}", request_path, filename)
    } else {
        format!("{}/{}", request_path, filename)
    };
    response.set_header("Location", location_value);
    response
}

fn handle_put(
    request: &HttpRequest,
    config: &ServerConfig,
    location: &LocationConfig,
    effective_root: &str,
    now: libc::time_t,
) -> HttpResponse {
    if request.body().len() as u64 > config.client_max_body_size {
        return error_page_response(413, config);
    }

    let target_dir = if location.upload_store.is_empty() {
        effective_root.to_string()
    } else {
        let upload_store = location.upload_store.trim_start_matches('/');
        match resolve_path(config, effective_root, upload_store) {
            Some(target_dir) => target_dir,
            None => return error_page_response(500, config),
        }
    };
    if !fs::metadata(&target_dir).map(|m| m.is_dir()).unwrap_or(false) {
        if create_dir_tree(&target_dir).is_err() {
            return error_page_response(500, config);
        }
    }

    let suggested = suggest_filename_from_headers(request);

    // The URL tail after the location prefix names the target file, or a
    // directory when it has no dot and a header suggested the filename.
    let uri_path = request.path();
    let relative_subpath = if !location.path.is_empty() && uri_path.starts_with(&location.path) {
        uri_path[location.path.len()..]
            .trim_start_matches('/')
            .to_string()
    } else {
        match uri_path.rfind('/') {
            Some(pos) => uri_path[pos + 1..].to_string(),
            None => uri_path.to_string(),
        }
    };

    let final_path = if relative_subpath.is_empty() {
        let name = suggested.unwrap_or_else(|| format!("put_{}", now));
        match resolve_path(config, &target_dir, &name) {
            Some(final_path) => final_path,
            None => return error_page_response(403, config),
        }
    } else {
        let last_segment = relative_subpath.rsplit('/').next().unwrap_or("");
        let treat_as_directory = !last_segment.contains('.') && suggested.is_some();
        if treat_as_directory {
            let dir_resolved = match resolve_path(config, &target_dir, &relative_subpath) {
                Some(dir_resolved) => dir_resolved,
                None => return error_page_response(403, config),
            };
            if create_dir_tree(&dir_resolved).is_err() {
                return error_page_response(500, config);
            }
            match resolve_path(config, &dir_resolved, suggested.as_deref().unwrap()) {
                Some(final_path) => final_path,
                None => return error_page_response(403, config),
            }
        } else {
            let final_path = match resolve_path(config, &target_dir, &relative_subpath) {
                Some(final_path) => final_path,
                None => return error_page_response(403, config),
            };
            if let Some(pos) = final_path.rfind('/') {
                if create_dir_tree(&final_path[..pos]).is_err() {
                    return error_page_response(500, config);
                }
            }
            final_path
        }
    };

    if fs::write(&final_path, request.body()).is_err() {
        return error_page_response(500, config);
    }

    let mut response = HttpResponse::new();
    response.set_status(201);
    response.set_header("Content-Type", "text/plain");
    response.set_body(format!("Created: {}", final_path).into_bytes());
    response
}

fn handle_delete(
    request: &HttpRequest,
    config: &ServerConfig,
    effective_root: &str,
) -> HttpResponse {
    let resolved = match resolve_path(config, effective_root, request.path()) {
        Some(resolved) => resolved,
        None => return error_page_response(403, config),
    };
    let metadata = match fs::metadata(&resolved) {
        Ok(metadata) => metadata,
        Err(_) => return error_page_response(404, config),
    };
    // Only regular files may be removed, not directories or special files.
    if !metadata.is_file() {
        return error_page_response(403, config);
    }
    match fs::remove_file(&resolved) {
        Ok(()) => {
            let mut response = HttpResponse::new();
            response.set_status(200);
            response.set_header("Content-Type", "text/html");
            response.set_body(
                b"<html><body><h1>File deleted successfully</h1></body></html>".to_vec(),
            );
            response
        }
        Err(_) => error_page_response(500, config),
    }
}

/// Pull a boundary parameter out of a multipart Content-Type value.
fn extract_boundary(content_type: &str) -> Option<String> {
    for token in content_type.split(';') {
        let token = token.trim();
        if token.to_lowercase().starts_with("boundary=") {
            let value = unquote(token[9..].trim());
            if !value.is_empty() {
                return Some(value);
            }
        }
    }
    None
}

/// Scan multipart parts for the first one carrying a filename; return its
/// name and content (trailing CRLF trimmed).
fn first_file_part(body: &[u8], boundary: &str) -> Option<(String, Vec<u8>)> {
    let sep = format!("--{}", boundary).into_bytes();
    let mut search_pos = 0;
    loop {
        let boundary_pos = find_from(&sep, body, search_pos)?;
        let mut after = boundary_pos + sep.len();
        if body.get(after) == Some(&b'-') && body.get(after + 1) == Some(&b'-') {
            return None; // final boundary
        }
        if body.get(after) == Some(&b'\r') && body.get(after + 1) == Some(&b'\n') {
            after += 2;
        }
        let headers_end = find_from(b"\r\n\r\n", body, after)?;
        let part_headers = String::from_utf8_lossy(&body[after..headers_end]).into_owned();
        let mut filename = String::new();
        for line in part_headers.lines() {
            if line.to_lowercase().starts_with("content-disposition:") {
                filename = extract_filename_from_content_disposition(line);
            }
        }
        let content_start = headers_end + 4;
        let next_mark = find_from(&sep, body, content_start)?;
        let mut content_end = next_mark;
        if content_end >= 2 && &body[content_end - 2..content_end] == b"\r\n" {
            content_end -= 2;
        }
        if !filename.is_empty() {
            let content_end = max(content_end, content_start);
            return Some((filename, body[content_start..content_end].to_vec()));
        }
        search_pos = next_mark + sep.len();
    }
}

/// Client-suggested filename: `X-Filename` wins, then `Content-Disposition`.
fn suggest_filename_from_headers(request: &HttpRequest) -> Option<String> {
    if let Some(name) = request.header("x-filename") {
        if !name.is_empty() {
            return Some(basename_like(name));
        }
    }
    if let Some(disposition) = request.header("content-disposition") {
        let name = extract_filename_from_content_disposition(disposition);
        if !name.is_empty() {
            return Some(name);
        }
    }
    None
}

/// Extract a filename from a Content-Disposition value, preferring the RFC
/// 5987 `filename*` form over plain `filename`.
fn extract_filename_from_content_disposition(header: &str) -> String {
    let lower = header.to_lowercase();
    if let Some(pos) = lower.find("filename*=") {
        let mut rest = header[pos + 10..].to_string();
        if let Some(semicolon) = rest.find(';') {
            rest.truncate(semicolon);
        }
        if let Some(apostrophes) = rest.find("''") {
            rest = rest[apostrophes + 2..].to_string();
        }
        let rest = rest.trim_start_matches(|c| c == ' ' || c == '\t');
        return basename_like(&unquote(rest));
    }
    if let Some(pos) = lower.find("filename=") {
        let rest = header[pos + 9..].trim_start_matches(|c| c == ' ' || c == '\t');
        let value = if rest.starts_with('"') || rest.starts_with('\'') {
            unquote(rest)
        } else {
            match rest.find(';') {
                Some(semicolon) => rest[..semicolon].to_string(),
                None => rest.to_string(),
            }
        };
        return basename_like(&value);
    }
    String::new()
}

fn unquote(value: &str) -> String {
    let mut chars = value.chars();
    match chars.next() {
        Some(quote @ '"') | Some(quote @ '\'') => {
            let rest = &value[1..];
            match rest.find(quote) {
                Some(end) => rest[..end].to_string(),
                None => rest.to_string(),
            }
        }
        _ => value.to_string(),
    }
}

/// Strip any path components from a client-supplied name.
fn basename_like(path: &str) -> String {
    match path.rfind(|c| c == '/' || c == '\\') {
        Some(pos) => path[pos + 1..].to_string(),
        None => path.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    use crate::http::HttpRequest;

    fn test_config(root: &std::path::Path) -> ServerConfig {
        let mut config = ServerConfig::default();
        config.root = root.to_string_lossy().into_owned();
        config.default_location.root = config.root.clone();
        config
    }

    fn get(path: &str) -> HttpRequest {
        HttpRequest::parse(format!("GET {} HTTP/1.1\r\nHost: a\r\n\r\n", path).as_bytes())
            .unwrap()
    }

    fn response_of(dispatch: Dispatch) -> HttpResponse {
        match dispatch {
            Dispatch::Response(response) => response,
            _ => panic!("expected a buffered response"),
        }
    }

    #[test]
    fn get_serves_small_file() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("index.html"), "hello").unwrap();
        let config = test_config(root.path());
        let response = response_of(dispatch(&get("/index.html"), &config, 0));
        assert_eq!(response.status(), 200);
        assert_eq!(response.body(), b"hello");
        let text = String::from_utf8(response.clone().generate(false)).unwrap();
        assert!(text.contains("Content-Type: text/html\r\n"));
        assert!(text.contains("Content-Length: 5\r\n"));
    }

    #[test]
    fn get_missing_file_is_404() {
        let root = tempfile::tempdir().unwrap();
        let config = test_config(root.path());
        let response = response_of(dispatch(&get("/nope.html"), &config, 0));
        assert_eq!(response.status(), 404);
    }

    #[test]
    fn head_sets_length_and_omits_body() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("a.txt"), "12345").unwrap();
        let config = test_config(root.path());
        let request =
            HttpRequest::parse(b"HEAD /a.txt HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
        let mut response = response_of(dispatch(&request, &config, 0));
        let text = String::from_utf8(response.generate(true)).unwrap();
        assert!(text.contains("Content-Length: 5\r\n"));
        assert!(text.ends_with("\r\n\r\n"));
    }

    #[test]
    fn directory_serves_index_file() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("index.html"), "front").unwrap();
        let mut config = test_config(root.path());
        config.index_files.push("index.html".to_string());
        let response = response_of(dispatch(&get("/"), &config, 0));
        assert_eq!(response.status(), 200);
        assert_eq!(response.body(), b"front");
    }

    #[test]
    fn location_index_takes_priority() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("index.html"), "server").unwrap();
        fs::write(root.path().join("special.html"), "special").unwrap();
        let mut config = test_config(root.path());
        config.index_files.push("index.html".to_string());
        config.default_location.index = "special.html".to_string();
        let response = response_of(dispatch(&get("/"), &config, 0));
        assert_eq!(response.body(), b"special");
    }

    #[test]
    fn directory_without_index_is_404_when_autoindex_off() {
        let root = tempfile::tempdir().unwrap();
        let config = test_config(root.path());
        let response = response_of(dispatch(&get("/"), &config, 0));
        assert_eq!(response.status(), 404);
    }

    #[test]
    fn autoindex_lists_entries() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("a.txt"), "x").unwrap();
        fs::create_dir(root.path().join("sub")).unwrap();
        let mut config = test_config(root.path());
        config.default_location.autoindex = true;
        let response = response_of(dispatch(&get("/"), &config, 0));
        assert_eq!(response.status(), 200);
        let body = String::from_utf8(response.body().to_vec()).unwrap();
        assert!(body.contains("<a href=\"/a.txt\">a.txt</a>"));
        assert!(body.contains("<a href=\"/sub/\">sub/</a>"));
        assert!(!body.contains("\"..\""));
    }

    #[test]
    fn large_file_is_streamed() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("big.bin"), vec![0u8; FILE_CHUNK_BYTES + 1]).unwrap();
        let config = test_config(root.path());
        match dispatch(&get("/big.bin"), &config, 0) {
            Dispatch::Stream(response, _stream) => {
                let text = String::from_utf8(response.clone().generate(false)).unwrap();
                assert!(text
                    .contains(&format!("Content-Length: {}\r\n", FILE_CHUNK_BYTES + 1)));
            }
            _ => panic!("expected a streamed response"),
        }
    }

    #[test]
    fn method_not_allowed_carries_allow_header() {
        let root = tempfile::tempdir().unwrap();
        let config = test_config(root.path());
        let request =
            HttpRequest::parse(b"DELETE /a HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
        let response = response_of(dispatch(&request, &config, 0));
        assert_eq!(response.status(), 405);
        let text = String::from_utf8(response.clone().generate(false)).unwrap();
        assert!(text.contains("Allow: GET, HEAD, OPTIONS\r\n"));
    }

    #[test]
    fn options_reports_allowed_methods() {
        let root = tempfile::tempdir().unwrap();
        let mut config = test_config(root.path());
        config.default_location.methods =
            vec!["GET".to_string(), "POST".to_string()];
        let request =
            HttpRequest::parse(b"OPTIONS / HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
        let response = response_of(dispatch(&request, &config, 0));
        assert_eq!(response.status(), 200);
        assert!(response.body().is_empty());
        let text = String::from_utf8(response.clone().generate(false)).unwrap();
        assert!(text.contains("Allow: GET, OPTIONS, POST\r\n"));
        assert!(text.contains("Content-Length: 0\r\n"));
    }

    #[test]
    fn redirect_location_wins_over_file_serving() {
        let root = tempfile::tempdir().unwrap();
        let mut config = test_config(root.path());
        config.default_location.redirect = "http://example.com/".to_string();
        let response = response_of(dispatch(&get("/anything"), &config, 0));
        assert_eq!(response.status(), 301);
        let text = String::from_utf8(response.clone().generate(false)).unwrap();
        assert!(text.contains("Location: http://example.com/\r\n"));
    }

    #[test]
    fn unknown_method_is_501() {
        let root = tempfile::tempdir().unwrap();
        let mut config = test_config(root.path());
        config.default_location.methods = vec!["PATCH".to_string()];
        let request = HttpRequest::parse(b"PATCH / HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
        let response = response_of(dispatch(&request, &config, 0));
        assert_eq!(response.status(), 501);
    }

    #[test]
    fn error_page_override_is_used() {
        let root = tempfile::tempdir().unwrap();
        fs::create_dir(root.path().join("errors")).unwrap();
        fs::write(root.path().join("errors/404.html"), "custom miss").unwrap();
        let mut config = test_config(root.path());
        config
            .error_pages
            .insert(404, "/errors/404.html".to_string());
        let response = error_page_response(404, &config);
        assert_eq!(response.body(), b"custom miss");
    }

    #[test]
    fn error_page_falls_back_to_template() {
        let root = tempfile::tempdir().unwrap();
        let config = test_config(root.path());
        let response = error_page_response(404, &config);
        assert_eq!(
            response.body(),
            b"<html><body><h1>Not Found</h1></body></html>"
        );
    }

    fn post_location(upload_store: &str) -> LocationConfig {
        let mut location = LocationConfig::default();
        location.path = "/uploads/".to_string();
        location.upload_store = upload_store.to_string();
        location.methods = vec!["GET".to_string(), "POST".to_string(), "PUT".to_string()];
        location
    }

    #[test]
    fn post_multipart_saves_first_file_part() {
        let root = tempfile::tempdir().unwrap();
        let mut config = test_config(root.path());
        config
            .locations
            .insert("/uploads/".to_string(), post_location("/up"));
        let body = b"--X\r\nContent-Disposition: form-data; name=\"f\"; filename=\"a.bin\"\r\n\r\nPAYLOAD\r\n--X--\r\n";
        let raw = format!(
            "POST /uploads/ HTTP/1.1\r\nHost: a\r\nContent-Type: multipart/form-data; boundary=X\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        let mut raw = raw.into_bytes();
        raw.extend_from_slice(body);
        let request = HttpRequest::parse(&raw).unwrap();
        let response = response_of(dispatch(&request, &config, 0));
        assert_eq!(response.status(), 201);
        let text = String::from_utf8(response.clone().generate(false)).unwrap();
        assert!(text.contains("Location: /uploads/a.bin\r\n"));
        let saved = fs::read(root.path().join("up/a.bin")).unwrap();
        assert_eq!(saved, b"PAYLOAD");
    }

    #[test]
    fn post_raw_body_uses_suggested_filename() {
        let root = tempfile::tempdir().unwrap();
        let mut config = test_config(root.path());
        config
            .locations
            .insert("/uploads/".to_string(), post_location("/up"));
        let request = HttpRequest::parse(
            b"POST /uploads/ HTTP/1.1\r\nHost: a\r\nX-Filename: data.txt\r\nContent-Length: 3\r\n\r\nabc",
        )
        .unwrap();
        let response = response_of(dispatch(&request, &config, 0));
        assert_eq!(response.status(), 201);
        assert_eq!(fs::read(root.path().join("up/data.txt")).unwrap(), b"abc");
    }

    #[test]
    fn post_without_upload_store_is_405() {
        let root = tempfile::tempdir().unwrap();
        let mut config = test_config(root.path());
        config.default_location.methods =
            vec!["GET".to_string(), "POST".to_string()];
        let request = HttpRequest::parse(
            b"POST /x HTTP/1.1\r\nHost: a\r\nContent-Length: 1\r\n\r\nz",
        )
        .unwrap();
        let response = response_of(dispatch(&request, &config, 0));
        assert_eq!(response.status(), 405);
    }

    #[test]
    fn put_writes_url_tail_under_store() {
        let root = tempfile::tempdir().unwrap();
        let mut config = test_config(root.path());
        let mut location = post_location("/up");
        location.path = "/".to_string();
        config.locations.insert("/".to_string(), location);
        let request = HttpRequest::parse(
            b"PUT /files/new.txt HTTP/1.1\r\nHost: a\r\nContent-Length: 3\r\n\r\nabc",
        )
        .unwrap();
        let response = response_of(dispatch(&request, &config, 0));
        assert_eq!(response.status(), 201);
        assert_eq!(
            fs::read(root.path().join("up/files/new.txt")).unwrap(),
            b"abc"
        );
    }

    #[test]
    fn put_dotless_tail_with_suggestion_becomes_directory() {
        let root = tempfile::tempdir().unwrap();
        let mut config = test_config(root.path());
        let mut location = post_location("/up");
        location.path = "/".to_string();
        config.locations.insert("/".to_string(), location);
        let request = HttpRequest::parse(
            b"PUT /d/ HTTP/1.1\r\nHost: a\r\nX-Filename: y\r\nContent-Length: 3\r\n\r\nabc",
        )
        .unwrap();
        let response = response_of(dispatch(&request, &config, 0));
        assert_eq!(response.status(), 201);
        assert_eq!(fs::read(root.path().join("up/d/y")).unwrap(), b"abc");
    }

    #[test]
    fn put_overwrites_silently() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("old.txt"), "old").unwrap();
        let mut config = test_config(root.path());
        let mut location = LocationConfig::default();
        location.path = "/".to_string();
        location.methods = vec!["PUT".to_string()];
        config.locations.insert("/".to_string(), location);
        let request = HttpRequest::parse(
            b"PUT /old.txt HTTP/1.1\r\nHost: a\r\nContent-Length: 3\r\n\r\nnew",
        )
        .unwrap();
        let response = response_of(dispatch(&request, &config, 0));
        assert_eq!(response.status(), 201);
        assert_eq!(fs::read(root.path().join("old.txt")).unwrap(), b"new");
    }

    #[test]
    fn delete_removes_regular_files_only() {
        let root = tempfile::tempdir().unwrap();
        fs::write(root.path().join("a.txt"), "x").unwrap();
        fs::create_dir(root.path().join("dir")).unwrap();
        let mut config = test_config(root.path());
        config.default_location.methods = vec!["DELETE".to_string()];
        let delete = |path: &str| {
            HttpRequest::parse(format!("DELETE {} HTTP/1.1\r\nHost: a\r\n\r\n", path).as_bytes())
                .unwrap()
        };
        let response = response_of(dispatch(&delete("/a.txt"), &config, 0));
        assert_eq!(response.status(), 200);
        assert!(!root.path().join("a.txt").exists());
        let response = response_of(dispatch(&delete("/dir"), &config, 0));
        assert_eq!(response.status(), 403);
        let response = response_of(dispatch(&delete("/missing"), &config, 0));
        assert_eq!(response.status(), 404);
    }

    #[test]
    fn cgi_trigger_defers_response() {
        let root = tempfile::tempdir().unwrap();
        let config = test_config(root.path());
        let request = HttpRequest::parse(
            b"GET /cgi-bin/run.sh HTTP/1.1\r\nHost: a\r\n\r\n",
        )
        .unwrap();
        assert!(matches!(dispatch(&request, &config, 0), Dispatch::Cgi));
    }

    #[test_case("multipart/form-data; boundary=X", Some("X") ; "bare")]
    #[test_case("multipart/form-data; boundary=\"quoted\"", Some("quoted") ; "quoted")]
    #[test_case("multipart/form-data; charset=utf-8; boundary=abc", Some("abc") ; "after other params")]
    #[test_case("multipart/form-data", None ; "missing")]
    fn extract_boundary_works(content_type: &str, expected: Option<&str>) {
        assert_eq!(
            extract_boundary(content_type),
            expected.map(|s| s.to_string())
        );
    }

    #[test_case("form-data; name=\"f\"; filename=\"a.bin\"", "a.bin" ; "quoted filename")]
    #[test_case("form-data; filename=plain.txt", "plain.txt" ; "bare filename")]
    #[test_case("form-data; filename=\"../../evil\"", "evil" ; "path stripped")]
    #[test_case("form-data; filename*=UTF-8''encoded.bin", "encoded.bin" ; "rfc5987")]
    #[test_case("form-data; name=\"f\"", "" ; "no filename")]
    fn extract_filename_works(header: &str, expected: &str) {
        assert_eq!(extract_filename_from_content_disposition(header), expected);
    }

    #[test]
    fn first_file_part_skips_fileless_parts() {
        let body = b"--B\r\nContent-Disposition: form-data; name=\"field\"\r\n\r\nvalue\r\n--B\r\nContent-Disposition: form-data; name=\"f\"; filename=\"x.txt\"\r\n\r\ncontent\r\n--B--\r\n";
        let (filename, content) = first_file_part(body, "B").unwrap();
        assert_eq!(filename, "x.txt");
        assert_eq!(content, b"content");
    }

    #[test]
    fn first_file_part_handles_empty_content() {
        let body = b"--B\r\nContent-Disposition: form-data; filename=\"e\"\r\n\r\n\r\n--B--\r\n";
        let (filename, content) = first_file_part(body, "B").unwrap();
        assert_eq!(filename, "e");
        assert_eq!(content, b"");
    }

    #[test]
    fn suggested_filename_prefers_x_filename() {
        let request = HttpRequest::parse(
            b"POST / HTTP/1.1\r\nX-Filename: /tmp/a.bin\r\nContent-Disposition: attachment; filename=\"b.bin\"\r\n\r\n",
        )
        .unwrap();
        assert_eq!(
            suggest_filename_from_headers(&request),
            Some("a.bin".to_string())
        );
    }
}
