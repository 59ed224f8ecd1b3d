use std::cmp::min;
use std::collections::BTreeMap;
use std::ffi::CString;
use std::net::IpAddr;
use std::os::unix::io::RawFd;

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{
    access, close, dup2, execve, fork, pipe, read, write, AccessFlags, ForkResult, Pid,
};

use crate::config::ServerConfig;
use crate::http::{find_header_terminator, HttpRequest, HttpResponse};
use crate::resolve::resolve_path;

const PIPE_CHUNK_BYTES: usize = 16 * 1024;

/// An in-flight CGI exchange, owned by its client connection. The reactor
/// pumps both pipes; the child is killed and reaped whenever the connection
/// is torn down.
pub struct Cgi {
    pid: Pid,
    pub pipe_in: Option<RawFd>,
    pub pipe_out: Option<RawFd>,
    body: Vec<u8>,
    body_written: usize,
    pub output: Vec<u8>,
    pub write_complete: bool,
    pub read_complete: bool,
    pub last_io: libc::time_t,
    pub is_head: bool,
    pub config_index: usize,
}

pub enum CgiOutcome {
    Running,
    Success,
    Failure,
}

/// Resolve the script, wire up the pipes, and fork the child. Returns the
/// HTTP status to answer with when the exchange cannot be started.
pub fn start_cgi(
    request: &HttpRequest,
    config: &ServerConfig,
    config_index: usize,
    peer: IpAddr,
    port: u16,
    now: libc::time_t,
) -> Result<Cgi, u16> {
    let location = config.find_location(request.path());
    let effective_root = config.effective_root(request.path());

    let script_path = match resolve_path(config, effective_root, request.path()) {
        Some(script_path) => script_path,
        None => return Err(404),
    };
    let exec_path = if location.cgi_pass.is_empty() {
        script_path.clone()
    } else {
        location.cgi_pass.clone()
    };
    if access(exec_path.as_str(), AccessFlags::X_OK).is_err() {
        eprintln!("warning: CGI target not executable: {}", exec_path);
        return Err(404);
    }

    // pipe_in carries the request body to the child's stdin; pipe_out carries
    // the child's stdout back.
    let pipe_in = match pipe() {
        Ok(fds) => fds,
        Err(_) => return Err(500),
    };
    let pipe_out = match pipe() {
        Ok(fds) => fds,
        Err(_) => {
            close(pipe_in.0).ok();
            close(pipe_in.1).ok();
            return Err(500);
        }
    };

    let env = build_cgi_env(request, config, &script_path, peer, port);

    match unsafe { fork() } {
        Ok(ForkResult::Child) => {
            close(pipe_in.1).ok();
            close(pipe_out.0).ok();
            if dup2(pipe_in.0, libc::STDIN_FILENO).is_err()
                || dup2(pipe_out.1, libc::STDOUT_FILENO).is_err()
            {
                std::process::exit(1);
            }
            close(pipe_in.0).ok();
            close(pipe_out.1).ok();

            let exec_c = match CString::new(exec_path.as_str()) {
                Ok(exec_c) => exec_c,
                Err(_) => std::process::exit(1),
            };
            let env_c: Vec<CString> = env
                .iter()
                .filter_map(|(name, value)| CString::new(format!("{}={}", name, value)).ok())
                .collect();
            let env_refs: Vec<&std::ffi::CStr> = env_c.iter().map(|e| e.as_c_str()).collect();
            let argv = [exec_c.as_c_str()];
            let err = execve(&exec_c, &argv, &env_refs).unwrap_err();
            eprintln!("execve failed for {}: {}", exec_path, err);
            std::process::exit(1);
        }
        Ok(ForkResult::Parent { child }) => {
            close(pipe_in.0).ok();
            close(pipe_out.1).ok();
            set_nonblocking(pipe_in.1);
            set_nonblocking(pipe_out.0);

            let body = request.body().to_vec();
            let mut cgi = Cgi {
                pid: child,
                pipe_in: Some(pipe_in.1),
                pipe_out: Some(pipe_out.0),
                body,
                body_written: 0,
                output: Vec::new(),
                write_complete: false,
                read_complete: false,
                last_io: now,
                is_head: request.method() == "HEAD",
                config_index,
            };
            if cgi.body.is_empty() {
                // Nothing to feed; signal EOF on the child's stdin right away.
                close(pipe_in.1).ok();
                cgi.pipe_in = None;
                cgi.write_complete = true;
            }
            Ok(cgi)
        }
        Err(_) => {
            close(pipe_in.0).ok();
            close(pipe_in.1).ok();
            close(pipe_out.0).ok();
            close(pipe_out.1).ok();
            Err(500)
        }
    }
}

fn set_nonblocking(fd: RawFd) {
    if let Ok(flags) = fcntl(fd, FcntlArg::F_GETFL) {
        fcntl(
            fd,
            FcntlArg::F_SETFL(OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK),
        )
        .ok();
    }
}

/// The CGI/1.1 environment. Every request header is exported as HTTP_<NAME>.
fn build_cgi_env(
    request: &HttpRequest,
    config: &ServerConfig,
    script_path: &str,
    peer: IpAddr,
    port: u16,
) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();
    env.insert("GATEWAY_INTERFACE".to_string(), "CGI/1.1".to_string());
    env.insert(
        "SERVER_SOFTWARE".to_string(),
        format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")),
    );
    env.insert(
        "SERVER_NAME".to_string(),
        if config.server_name.is_empty() {
            "localhost".to_string()
        } else {
            config.server_name.clone()
        },
    );
    env.insert("SERVER_PROTOCOL".to_string(), request.version().to_string());
    env.insert("SERVER_PORT".to_string(), port.to_string());
    env.insert("REQUEST_METHOD".to_string(), request.method().to_string());
    env.insert("SCRIPT_NAME".to_string(), request.path().to_string());
    env.insert("SCRIPT_FILENAME".to_string(), script_path.to_string());
    env.insert("PATH_INFO".to_string(), request.path().to_string());
    env.insert("PATH_TRANSLATED".to_string(), script_path.to_string());
    env.insert("REQUEST_URI".to_string(), request.path().to_string());
    env.insert(
        "QUERY_STRING".to_string(),
        request.query_string().to_string(),
    );
    env.insert("REMOTE_ADDR".to_string(), peer.to_string());
    env.insert("REMOTE_HOST".to_string(), peer.to_string());

    for (name, value) in request.headers() {
        let mut env_name = String::from("HTTP_");
        for c in name.chars() {
            if c == '-' {
                env_name.push('_');
            } else {
                env_name.push(c.to_ascii_uppercase());
            }
        }
        env.insert(env_name, value.clone());
    }

    if request.method() == "POST" {
        env.insert(
            "CONTENT_TYPE".to_string(),
            request.header("content-type").unwrap_or("").to_string(),
        );
        env.insert(
            "CONTENT_LENGTH".to_string(),
            request.body().len().to_string(),
        );
    }

    env
}

impl Cgi {
    /// Feed the next slice of the captured body into the child's stdin. The
    /// pipe is closed as soon as the body has been written in full.
    pub fn pump_write(&mut self, now: libc::time_t) {
        let fd = match self.pipe_in {
            Some(fd) if !self.write_complete => fd,
            _ => return,
        };
        let end = min(self.body_written + PIPE_CHUNK_BYTES, self.body.len());
        match write(fd, &self.body[self.body_written..end]) {
            Ok(written) if written > 0 => {
                self.body_written += written;
                self.last_io = now;
                if self.body_written >= self.body.len() {
                    close(fd).ok();
                    self.pipe_in = None;
                    self.write_complete = true;
                }
            }
            Ok(_) => {}
            Err(e) if e.as_errno() == Some(Errno::EAGAIN) => {}
            Err(_) => {
                close(fd).ok();
                self.pipe_in = None;
                self.write_complete = true;
            }
        }
    }

    /// Drain a chunk of the child's stdout into the accumulator. EOF marks
    /// the exchange read-complete.
    pub fn pump_read(&mut self, now: libc::time_t) {
        let fd = match self.pipe_out {
            Some(fd) if !self.read_complete => fd,
            _ => return,
        };
        let mut buf = [0u8; PIPE_CHUNK_BYTES];
        match read(fd, &mut buf) {
            Ok(0) => self.read_complete = true,
            Ok(bytes_read) => {
                self.output.extend_from_slice(&buf[..bytes_read]);
                self.last_io = now;
            }
            Err(e) if e.as_errno() == Some(Errno::EAGAIN) => {}
            Err(_) => self.read_complete = true,
        }
    }

    /// Non-blocking wait for the child once its output pipe has hit EOF.
    pub fn poll_child(&mut self) -> CgiOutcome {
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) => CgiOutcome::Running,
            Ok(WaitStatus::Exited(_, 0)) => CgiOutcome::Success,
            Ok(_) => CgiOutcome::Failure,
            Err(_) => CgiOutcome::Failure,
        }
    }

    pub fn close_pipes(&mut self) {
        if let Some(fd) = self.pipe_in.take() {
            close(fd).ok();
        }
        if let Some(fd) = self.pipe_out.take() {
            close(fd).ok();
        }
    }

    /// Forced teardown: close both pipes, SIGKILL the child, reap it without
    /// blocking.
    pub fn kill_and_reap(&mut self) {
        self.close_pipes();
        kill(self.pid, Signal::SIGKILL).ok();
        waitpid(self.pid, Some(WaitPidFlag::WNOHANG)).ok();
    }
}

/// Turn accumulated CGI output into an HTTP response. The output is split at
/// the first blank line; a `Status:` header overrides the response status and
/// a missing `Content-Type` defaults to text/html. Output with no separator
/// at all is treated as a bare body.
pub fn build_response(output: &[u8]) -> HttpResponse {
    let mut response = HttpResponse::new();
    let (header_end, sep_len) = match find_header_terminator(output) {
        Some(terminator) => terminator,
        None => {
            response.set_header("Content-Type", "text/html");
            response.set_body(output.to_vec());
            return response;
        }
    };
    let head = String::from_utf8_lossy(&output[..header_end]).into_owned();
    let mut content_type_set = false;
    for line in head.lines() {
        let colon = match line.find(':') {
            Some(colon) => colon,
            None => continue,
        };
        let name = &line[..colon];
        let value = line[colon + 1..].trim_matches(|c| c == ' ' || c == '\t');
        if name == "Status" {
            if let Some(code) = value.split_whitespace().next() {
                if let Ok(code) = code.parse() {
                    response.set_status(code);
                }
            }
        } else {
            if name == "Content-Type" {
                content_type_set = true;
            }
            response.set_header(name, value);
        }
    }
    if !content_type_set {
        response.set_header("Content-Type", "text/html");
    }
    response.set_body(output[header_end + sep_len..].to_vec());
    response
}
