use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::{BufRead, BufReader, Lines};

use anyhow::{anyhow, Context, Result};

const DEFAULT_MAX_BODY_SIZE: u64 = 1024 * 1024;

/// Per-prefix policy from a `location` block (or the server-level defaults).
#[derive(Debug, Clone, Default)]
pub struct LocationConfig {
    pub path: String,
    pub root: String,
    pub index: String,
    pub methods: Vec<String>,
    pub redirect: String,
    pub autoindex: bool,
    pub cgi_pass: String,
    pub upload_store: String,
}

impl LocationConfig {
    /// The CGI trigger: an explicit interpreter, or a path that looks like a
    /// script by convention.
    pub fn is_cgi_path(&self, request_path: &str) -> bool {
        !self.cgi_pass.is_empty()
            || request_path.contains("/cgi-bin/")
            || request_path.contains(".php")
            || request_path.contains(".py")
            || request_path.contains(".cgi")
    }

    pub fn allowed_methods(&self) -> BTreeSet<String> {
        if !self.methods.is_empty() {
            return self.methods.iter().cloned().collect();
        }
        let mut methods = BTreeSet::new();
        methods.insert("GET".to_string());
        methods.insert("HEAD".to_string());
        methods.insert("OPTIONS".to_string());
        methods
    }
}

/// One virtual host. Immutable once configuration loading completes.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub listen_ports: Vec<u16>,
    pub server_name: String,
    pub root: String,
    pub index_files: Vec<String>,
    pub error_pages: HashMap<u16, String>,
    pub client_max_body_size: u64,
    pub locations: HashMap<String, LocationConfig>,
    pub default_location: LocationConfig,
}

impl Default for ServerConfig {
    fn default() -> ServerConfig {
        ServerConfig {
            listen_ports: Vec::new(),
            server_name: String::new(),
            root: String::new(),
            index_files: Vec::new(),
            error_pages: HashMap::new(),
            client_max_body_size: DEFAULT_MAX_BODY_SIZE,
            locations: HashMap::new(),
            default_location: LocationConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Longest-prefix match of `path` against the location table. A key
    /// ending in `/` also matches the key minus the trailing slash exactly.
    /// Falls back to the default location with an empty matched prefix.
    pub fn match_location(&self, path: &str) -> (&str, &LocationConfig) {
        let mut best_path = "";
        let mut best_config = &self.default_location;
        for (location_path, location) in &self.locations {
            let mut matches = path.starts_with(location_path.as_str());
            if !matches && location_path.ends_with('/') {
                let mut path_with_slash = path.to_string();
                if !path_with_slash.ends_with('/') {
                    path_with_slash.push('/');
                }
                matches = path_with_slash.starts_with(location_path.as_str())
                    || path == &location_path[..location_path.len() - 1];
            }
            if matches && location_path.len() > best_path.len() {
                best_path = location_path.as_str();
                best_config = location;
            }
        }
        (best_path, best_config)
    }

    pub fn find_location(&self, path: &str) -> &LocationConfig {
        self.match_location(path).1
    }

    pub fn allowed_methods_for(&self, path: &str) -> BTreeSet<String> {
        self.find_location(path).allowed_methods()
    }

    /// The document root in force for a request path.
    pub fn effective_root(&self, path: &str) -> &str {
        let location = self.find_location(path);
        if location.root.is_empty() {
            &self.root
        } else {
            &location.root
        }
    }
}

/// Parse the configuration file into an ordered list of virtual hosts.
pub fn parse_config_file(path: &str) -> Result<Vec<ServerConfig>> {
    let file =
        File::open(path).with_context(|| format!("failed to open config file {}", path))?;
    let mut lines = BufReader::new(file).lines();
    let mut servers = Vec::new();
    while let Some(line) = lines.next() {
        let line = line.with_context(|| format!("failed to read config file {}", path))?;
        let line = strip_comment(&line);
        if line.is_empty() {
            continue;
        }
        if line == "server {" {
            servers.push(parse_server_block(&mut lines)?);
        } else {
            eprintln!(
                "warning: ignoring unexpected line outside of server block: {}",
                line
            );
        }
    }
    if servers.is_empty() {
        return Err(anyhow!("no server blocks found in {}", path));
    }
    Ok(servers)
}

/// Trim whitespace and drop anything after a `#`.
fn strip_comment(line: &str) -> &str {
    let line = match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    };
    line.trim()
}

/// Split a directive line into its name and value, dropping a trailing `;`.
fn split_directive(line: &str) -> (&str, &str) {
    let (directive, value) = match line.find(|c| c == ' ' || c == '\t') {
        Some(pos) => (&line[..pos], line[pos + 1..].trim()),
        None => (line, ""),
    };
    let value = value.trim_end_matches(';').trim();
    (directive, value)
}

fn parse_server_block(lines: &mut Lines<BufReader<File>>) -> Result<ServerConfig> {
    let mut server = ServerConfig::default();
    while let Some(line) = lines.next() {
        let line = line.context("failed to read config file")?;
        let line = strip_comment(&line);
        if line.is_empty() {
            continue;
        }
        if line == "}" {
            break;
        }
        let (directive, value) = split_directive(line);
        match directive {
            "listen" => {
                for port in value.split_whitespace() {
                    match port.parse::<u16>() {
                        Ok(port) if port > 0 => server.listen_ports.push(port),
                        _ => eprintln!("warning: invalid listen port {}", port),
                    }
                }
            }
            "server_name" => server.server_name = value.to_string(),
            "root" => {
                server.root = value.to_string();
            }
            "index" => {
                server.index_files = value.split_whitespace().map(str::to_string).collect();
                if let Some(first) = server.index_files.first() {
                    server.default_location.index = first.clone();
                }
            }
            "error_page" => {
                let parts: Vec<&str> = value.split_whitespace().collect();
                if parts.len() >= 2 {
                    let page_path = parts[parts.len() - 1];
                    for code in &parts[..parts.len() - 1] {
                        match code.parse::<u16>() {
                            Ok(code) => {
                                server.error_pages.insert(code, page_path.to_string());
                            }
                            Err(_) => eprintln!(
                                "warning: invalid error code {} in error_page directive",
                                code
                            ),
                        }
                    }
                }
            }
            "client_max_body_size" => match parse_size(value) {
                Ok(size) => server.client_max_body_size = size,
                Err(_) => eprintln!("warning: invalid client_max_body_size {}", value),
            },
            "location" => {
                let prefix = value.trim_end_matches('{').trim();
                let mut location = LocationConfig::default();
                location.path = prefix.to_string();
                // Locations inherit the server index; root stays empty unless
                // explicitly overridden, which switches path resolution to the
                // override with the location prefix stripped.
                if let Some(first) = server.index_files.first() {
                    location.index = first.clone();
                }
                parse_location_block(lines, &mut location)?;
                server.locations.insert(prefix.to_string(), location);
            }
            // Location-scoped directives at server level configure the
            // default location.
            "autoindex" | "allow_methods" | "methods" | "return" | "cgi_pass"
            | "upload_store" => {
                apply_location_directive(&mut server.default_location, directive, value);
            }
            _ => eprintln!("warning: unknown directive {} in server block", directive),
        }
    }
    if server.listen_ports.is_empty() {
        eprintln!("warning: server block without listen directive, defaulting to port 8080");
        server.listen_ports.push(8080);
    }
    if server.default_location.root.is_empty() {
        server.default_location.root = server.root.clone();
    }
    Ok(server)
}

fn parse_location_block(
    lines: &mut Lines<BufReader<File>>,
    location: &mut LocationConfig,
) -> Result<()> {
    while let Some(line) = lines.next() {
        let line = line.context("failed to read config file")?;
        let line = strip_comment(&line);
        if line.is_empty() {
            continue;
        }
        if line == "}" {
            return Ok(());
        }
        let (directive, value) = split_directive(line);
        apply_location_directive(location, directive, value);
    }
    Err(anyhow!(
        "unterminated location block for {}",
        location.path
    ))
}

fn apply_location_directive(location: &mut LocationConfig, directive: &str, value: &str) {
    match directive {
        "root" => location.root = value.to_string(),
        "index" => {
            if let Some(first) = value.split_whitespace().next() {
                location.index = first.to_string();
            }
        }
        "allow_methods" | "methods" => {
            location.methods = value.split_whitespace().map(str::to_string).collect();
        }
        "return" => location.redirect = value.to_string(),
        "autoindex" => location.autoindex = value == "on",
        "cgi_pass" => location.cgi_pass = value.to_string(),
        "upload_store" => location.upload_store = value.to_string(),
        _ => eprintln!(
            "warning: unknown directive {} in location block for {}",
            directive, location.path
        ),
    }
}

/// Parse a byte count with an optional `k`/`m`/`g` suffix.
fn parse_size(value: &str) -> Result<u64> {
    let value = value.trim();
    if value.is_empty() {
        return Err(anyhow!("empty size"));
    }
    let (digits, multiplier) = match value.chars().last().map(|c| c.to_ascii_lowercase()) {
        Some('k') => (&value[..value.len() - 1], 1024),
        Some('m') => (&value[..value.len() - 1], 1024 * 1024),
        Some('g') => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        _ => (value, 1),
    };
    let number: u64 = digits
        .trim()
        .parse()
        .with_context(|| format!("invalid size {}", value))?;
    Ok(number * multiplier)
}
