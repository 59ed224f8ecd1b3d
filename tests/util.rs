use std::collections::HashMap;
use std::io;
use std::io::Read;
use std::net::{TcpListener, TcpStream};
use std::path::Path;
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;

use tempfile::{tempdir, TempDir};

pub fn unused_port() -> u16 {
    TcpListener::bind(("localhost", 0))
        .expect("failed to bind probe socket")
        .local_addr()
        .unwrap()
        .port()
}

fn wait_for_port(port: u16) -> bool {
    for _ in 0..5000 {
        if TcpStream::connect(("localhost", port)).is_ok() {
            return true;
        }
        sleep(Duration::from_millis(1));
    }
    false
}

struct ScopedChild(Child);

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

pub struct TestServer {
    _child: ScopedChild,
    port: u16,
    root: TempDir,
    _config_dir: TempDir,
}

impl TestServer {
    /// Start a server on a fresh document root with the given location
    /// blocks spliced into a single-host config.
    pub fn with_locations(locations: &str) -> TestServer {
        let root = tempdir().expect("failed to create tempdir");
        let port = unused_port();
        let config = format!(
            "server {{\n\
                 listen {};\n\
                 server_name localhost;\n\
                 root {};\n\
                 index index.html;\n\
                 client_max_body_size 1m;\n\
                 {}\n\
             }}\n",
            port,
            root.path().display(),
            locations
        );
        Self::launch(root, port, &config)
    }

    /// Start a server from a complete config file. The caller prepares the
    /// document roots referenced by the config.
    pub fn launch(root: TempDir, port: u16, config: &str) -> TestServer {
        let config_dir = tempdir().expect("failed to create config tempdir");
        let config_path = config_dir.path().join("server.conf");
        std::fs::write(&config_path, config).expect("failed to write config file");

        let child = Command::new(env!("CARGO_BIN_EXE_monohttpd"))
            .arg(&config_path)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn monohttpd");

        let server = TestServer {
            _child: ScopedChild(child),
            port,
            root,
            _config_dir: config_dir,
        };

        assert!(wait_for_port(port), "failed to connect to monohttpd");
        server
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn stream(&self) -> TcpStream {
        let stream =
            TcpStream::connect(("localhost", self.port)).expect("failed to connect to monohttpd");
        // Timeouts prevent tests from hanging.
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    /// Send raw request bytes and read until the server closes the
    /// connection. The request should carry `Connection: close`.
    pub fn raw_request(&self, request: &[u8]) -> Vec<u8> {
        use std::io::Write;
        let mut stream = self.stream();
        stream.write_all(request).expect("failed to write request");
        let mut buf = Vec::new();
        stream
            .read_to_end(&mut buf)
            .expect("failed to read response");
        buf
    }

    pub fn request(&self, request: &[u8]) -> Response {
        let raw = self.raw_request(request);
        Response::read_from(&mut raw.as_slice()).expect("malformed response")
    }
}

/// One HTTP response, read off the wire. The body is framed by the
/// response's own `Content-Length`, so several of these can be pulled from a
/// single keep-alive stream.
pub struct Response {
    pub status: u16,
    pub reason: String,
    headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    /// Consume exactly one response: accumulate bytes until the blank line,
    /// split the head into status line and header fields, then read the
    /// declared number of body bytes.
    pub fn read_from<R: Read>(reader: &mut R) -> io::Result<Response> {
        let mut head = Vec::new();
        let mut byte = [0u8; 1];
        while !head.ends_with(b"\r\n\r\n") {
            reader.read_exact(&mut byte)?;
            head.push(byte[0]);
        }
        let head = String::from_utf8(head)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "response head is not UTF-8"))?;

        let mut lines = head.lines();
        let status_line = lines.next().unwrap_or("");
        let mut words = status_line.splitn(3, ' ');
        let _protocol = words.next();
        let status = words
            .next()
            .and_then(|code| code.parse().ok())
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "status line has no code")
            })?;
        let reason = words.next().unwrap_or("").to_string();

        // Header names are folded to lowercase so lookups are
        // case-insensitive.
        let mut headers = HashMap::new();
        for line in lines {
            if let Some(colon) = line.find(':') {
                headers.insert(
                    line[..colon].to_ascii_lowercase(),
                    line[colon + 1..].trim().to_string(),
                );
            }
        }

        let length: usize = headers
            .get("content-length")
            .and_then(|value| value.parse().ok())
            .unwrap_or(0);
        let mut body = vec![0u8; length];
        reader.read_exact(&mut body)?;

        Ok(Response {
            status,
            reason,
            headers,
            body,
        })
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }
}
