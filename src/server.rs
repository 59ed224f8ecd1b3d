use std::collections::{BTreeSet, HashMap};
use std::fs::File;
use std::io::Read;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{anyhow, Result};
use chrono::Utc;
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::select::{select, FdSet};
use nix::sys::socket::{
    self, sockopt, AddressFamily, InetAddr, MsgFlags, SockAddr, SockFlag, SockProtocol, SockType,
};
use nix::sys::time::TimeVal;
use nix::unistd::close;

use crate::cgi::{self, CgiOutcome};
use crate::config::ServerConfig;
use crate::handlers::{self, Dispatch};
use crate::http::{self, ChunkStatus, HttpRequest};
use crate::util::{clf_date, http_date, log_escape};

// Event loop tuning knobs
const SELECT_TIMEOUT_SECS: libc::time_t = 1;
const CLIENT_TIMEOUT_SECS: libc::time_t = 30;
const CGI_TIMEOUT_SECS: libc::time_t = 120;
const MAX_HEADER_BYTES: usize = 32 * 1024;
const MAX_REQUEST_BYTES: usize = 200 * 1024 * 1024;
const RECV_CHUNK_BYTES: usize = 8 * 1024;
const LISTEN_BACKLOG: usize = 128;
pub const FILE_CHUNK_BYTES: usize = 16 * 1024;

static RUNNING: AtomicBool = AtomicBool::new(true);

/// Signal handler installed for SIGINT/SIGTERM; the next loop iteration
/// unwinds and closes every descriptor.
pub extern "C" fn request_stop(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn is_running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

/// An in-flight file body, read in bounded chunks so one slow client never
/// holds a whole file in memory.
pub struct FileStream {
    file: File,
    offset: u64,
    size: u64,
    pending: Vec<u8>,
}

impl FileStream {
    pub fn new(file: File, size: u64) -> FileStream {
        FileStream {
            file,
            offset: 0,
            size,
            pending: Vec::new(),
        }
    }
}

/// Per-connection state, keyed by descriptor in the reactor. The optional
/// FileStream and Cgi sub-states live here rather than in side maps.
struct ClientState {
    socket: TcpStream,
    addr: IpAddr,
    port: u16,
    in_buffer: Vec<u8>,
    out_buffer: Vec<u8>,
    out_offset: usize,
    keep_alive: bool,
    closing: bool,
    sent_continue: bool,
    last_activity: libc::time_t,
    file_stream: Option<FileStream>,
    cgi: Option<cgi::Cgi>,
}

fn needs_write(state: &ClientState) -> bool {
    if state.out_offset < state.out_buffer.len() {
        return true;
    }
    if let Some(stream) = &state.file_stream {
        if !stream.pending.is_empty() || stream.offset < stream.size {
            return true;
        }
    }
    false
}

fn teardown_client(clients: &mut HashMap<RawFd, ClientState>, fd: RawFd) {
    if let Some(mut state) = clients.remove(&fd) {
        if let Some(mut cgi) = state.cgi.take() {
            cgi.kill_and_reap();
        }
    }
    // The TcpStream and any FileStream handle close on drop.
}

struct Listener {
    fd: RawFd,
    port: u16,
}

pub struct Server {
    configs: Vec<ServerConfig>,
    port_to_configs: HashMap<u16, Vec<usize>>,
    listeners: Vec<Listener>,
}

impl Server {
    pub fn new(configs: Vec<ServerConfig>) -> Result<Server> {
        if configs.is_empty() {
            return Err(anyhow!("no server configurations loaded"));
        }
        let mut port_to_configs: HashMap<u16, Vec<usize>> = HashMap::new();
        for (index, config) in configs.iter().enumerate() {
            for &port in &config.listen_ports {
                port_to_configs.entry(port).or_default().push(index);
            }
        }
        Ok(Server {
            configs,
            port_to_configs,
            listeners: Vec::new(),
        })
    }

    /// Bind every configured port and run the readiness loop until a
    /// shutdown signal or an unrecoverable select error.
    pub fn start(&mut self) -> Result<()> {
        self.bind_listeners()?;
        println!("Server is running. Press Ctrl+C to stop.");

        let mut clients: HashMap<RawFd, ClientState> = HashMap::new();
        let mut result = Ok(());
        while is_running() {
            if let Err(error) = self.tick(&mut clients) {
                result = Err(error);
                break;
            }
        }

        for listener in &self.listeners {
            close(listener.fd).ok();
        }
        let fds: Vec<RawFd> = clients.keys().copied().collect();
        for fd in fds {
            teardown_client(&mut clients, fd);
        }
        result
    }

    fn bind_listeners(&mut self) -> Result<()> {
        let mut ports = BTreeSet::new();
        for config in &self.configs {
            for &port in &config.listen_ports {
                ports.insert(port);
            }
        }
        for &port in &ports {
            let fd = match socket::socket(
                AddressFamily::Inet,
                SockType::Stream,
                SockFlag::empty(),
                SockProtocol::Tcp,
            ) {
                Ok(fd) => fd,
                Err(error) => {
                    eprintln!("error creating socket for port {}: {}", port, error);
                    continue;
                }
            };
            set_nonblocking(fd);
            if let Err(error) = socket::setsockopt(fd, sockopt::ReuseAddr, &true) {
                eprintln!("error setting SO_REUSEADDR: {}", error);
                close(fd).ok();
                continue;
            }
            let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
            if let Err(error) = socket::bind(fd, &SockAddr::Inet(InetAddr::from_std(&addr))) {
                eprintln!("error binding socket to port {}: {}", port, error);
                close(fd).ok();
                continue;
            }
            if let Err(error) = socket::listen(fd, LISTEN_BACKLOG) {
                eprintln!("error listening on port {}: {}", port, error);
                close(fd).ok();
                continue;
            }
            self.listeners.push(Listener { fd, port });
            println!("Server is listening on port {}", port);
        }
        if self.listeners.is_empty() {
            return Err(anyhow!("failed to set up any listening sockets"));
        }
        Ok(())
    }

    /// One reactor tick: rebuild the interest sets, wait for readiness, then
    /// run the fixed stage order. The wall clock is sampled once per tick.
    fn tick(&mut self, clients: &mut HashMap<RawFd, ClientState>) -> Result<()> {
        let mut read_fds = FdSet::new();
        let mut write_fds = FdSet::new();
        for listener in &self.listeners {
            read_fds.insert(listener.fd);
        }
        for (fd, state) in clients.iter() {
            read_fds.insert(*fd);
            if needs_write(state) {
                write_fds.insert(*fd);
            }
            if let Some(cgi) = &state.cgi {
                if let Some(pipe_out) = cgi.pipe_out {
                    if !cgi.read_complete {
                        read_fds.insert(pipe_out);
                    }
                }
                if let Some(pipe_in) = cgi.pipe_in {
                    if !cgi.write_complete {
                        write_fds.insert(pipe_in);
                    }
                }
            }
        }

        // A bounded wait keeps timeouts ticking even under quiescence.
        let mut timeout = TimeVal::from(libc::timeval {
            tv_sec: SELECT_TIMEOUT_SECS,
            tv_usec: 0,
        });
        match select(
            None,
            Some(&mut read_fds),
            Some(&mut write_fds),
            None,
            Some(&mut timeout),
        ) {
            Ok(_) => {}
            Err(error) => {
                if error.as_errno() == Some(Errno::EINTR) {
                    return Ok(()); // interrupted by signal
                }
                return Err(anyhow!("select() failed: {}", error));
            }
        }

        // Sample the wall clock once and reuse it for every stage.
        let now = Utc::now().timestamp();

        self.expire_idle_clients(clients, now);
        self.expire_hung_cgi(clients, now);
        self.accept_connections(clients, &mut read_fds, now);
        self.pump_cgi(clients, &mut read_fds, &mut write_fds, now);
        self.process_client_reads(clients, &mut read_fds, now);
        self.process_client_writes(clients, &mut write_fds, now);
        Ok(())
    }

    fn expire_idle_clients(&self, clients: &mut HashMap<RawFd, ClientState>, now: libc::time_t) {
        let expired: Vec<RawFd> = clients
            .iter()
            .filter(|(_, state)| now - state.last_activity > CLIENT_TIMEOUT_SECS)
            .map(|(fd, _)| *fd)
            .collect();
        for fd in expired {
            teardown_client(clients, fd);
        }
    }

    /// A CGI exchange with no pipe traffic for too long gets a 504, a
    /// SIGKILL, and a non-blocking reap. The connection stays registered so
    /// the 504 is written back, then closes.
    fn expire_hung_cgi(&self, clients: &mut HashMap<RawFd, ClientState>, now: libc::time_t) {
        let fds: Vec<RawFd> = clients.keys().copied().collect();
        for fd in fds {
            let state = match clients.get_mut(&fd) {
                Some(state) => state,
                None => continue,
            };
            let timed_out = state
                .cgi
                .as_ref()
                .map_or(false, |cgi| now - cgi.last_io > CGI_TIMEOUT_SECS);
            if !timed_out {
                continue;
            }
            let mut cgi = state.cgi.take().unwrap();
            cgi.kill_and_reap();
            let config = &self.configs[cgi.config_index];
            let mut response = handlers::error_page_response(504, config);
            response.set_header("Connection", "close");
            response.set_header("Date", http_date(now));
            state.keep_alive = false;
            state.closing = true;
            let bytes = response.generate(cgi.is_head);
            state.out_buffer.extend_from_slice(&bytes);
        }
    }

    fn accept_connections(
        &self,
        clients: &mut HashMap<RawFd, ClientState>,
        read_fds: &mut FdSet,
        now: libc::time_t,
    ) {
        for listener in &self.listeners {
            if !read_fds.contains(listener.fd) {
                continue;
            }
            loop {
                match socket::accept(listener.fd) {
                    Ok(fd) => {
                        let socket = unsafe { TcpStream::from_raw_fd(fd) };
                        if socket.set_nonblocking(true).is_err() {
                            continue; // dropped, which closes the socket
                        }
                        let addr = socket
                            .peer_addr()
                            .map(|peer| peer.ip())
                            .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED));
                        clients.insert(
                            fd,
                            ClientState {
                                socket,
                                addr,
                                port: listener.port,
                                in_buffer: Vec::new(),
                                out_buffer: Vec::new(),
                                out_offset: 0,
                                // true until a request decides otherwise, so a
                                // connection is never closed before it has
                                // been answered
                                keep_alive: true,
                                closing: false,
                                sent_continue: false,
                                last_activity: now,
                                file_stream: None,
                                cgi: None,
                            },
                        );
                    }
                    Err(error) => {
                        if error.as_errno() != Some(Errno::EAGAIN) {
                            eprintln!("warning: accept() failed: {}", error);
                        }
                        break;
                    }
                }
            }
        }
    }

    /// Pump every attached CGI exchange: feed the captured body, drain the
    /// output, and once the output pipe hits EOF reap the child and queue
    /// the response.
    fn pump_cgi(
        &self,
        clients: &mut HashMap<RawFd, ClientState>,
        read_fds: &mut FdSet,
        write_fds: &mut FdSet,
        now: libc::time_t,
    ) {
        let mut fds: Vec<RawFd> = clients.keys().copied().collect();
        fds.sort_unstable();
        for fd in fds {
            let state = match clients.get_mut(&fd) {
                Some(state) => state,
                None => continue,
            };
            let mut outcome = CgiOutcome::Running;
            if let Some(cgi) = state.cgi.as_mut() {
                if let Some(pipe_in) = cgi.pipe_in {
                    if write_fds.contains(pipe_in) {
                        cgi.pump_write(now);
                    }
                }
                if let Some(pipe_out) = cgi.pipe_out {
                    if read_fds.contains(pipe_out) {
                        cgi.pump_read(now);
                    }
                }
                if cgi.read_complete {
                    outcome = cgi.poll_child();
                }
            } else {
                continue;
            }
            let success = match outcome {
                CgiOutcome::Running => continue,
                CgiOutcome::Success => true,
                CgiOutcome::Failure => false,
            };
            let mut cgi = state.cgi.take().unwrap();
            cgi.close_pipes();
            let config = &self.configs[cgi.config_index];
            let mut response = if success {
                cgi::build_response(&cgi.output)
            } else {
                handlers::error_page_response(502, config)
            };
            response.set_header("Connection", "close");
            response.set_header("Date", http_date(now));
            state.keep_alive = false;
            state.closing = true;
            let bytes = response.generate(cgi.is_head);
            state.out_buffer.extend_from_slice(&bytes);
        }
    }

    fn process_client_reads(
        &self,
        clients: &mut HashMap<RawFd, ClientState>,
        read_fds: &mut FdSet,
        now: libc::time_t,
    ) {
        let mut fds: Vec<RawFd> = clients.keys().copied().collect();
        fds.sort_unstable();
        for fd in fds {
            if read_fds.contains(fd) {
                let closed = match clients.get_mut(&fd) {
                    Some(state) => self.recv_into(state, now),
                    None => continue,
                };
                if closed {
                    teardown_client(clients, fd);
                    continue;
                }
            }
            // Parse whatever is buffered, including requests left over from a
            // previous tick once a stream or CGI exchange has drained.
            if let Some(state) = clients.get_mut(&fd) {
                self.process_in_buffer(state, now);
            }
        }
    }

    /// Drain the socket until it would block. Returns true when the peer
    /// closed or the read failed fatally.
    fn recv_into(&self, state: &mut ClientState, now: libc::time_t) -> bool {
        let fd = state.socket.as_raw_fd();
        loop {
            let mut buf = [0u8; RECV_CHUNK_BYTES];
            match socket::recv(fd, &mut buf, MsgFlags::empty()) {
                Ok(0) => return true,
                Ok(received) => {
                    state.in_buffer.extend_from_slice(&buf[..received]);
                    state.last_activity = now;
                    if state.in_buffer.len() > MAX_REQUEST_BYTES {
                        let config = &self.configs[self.config_index_for(state.port, "")];
                        Self::queue_error(state, 413, config, now);
                        return false;
                    }
                }
                Err(error) => {
                    if error.as_errno() == Some(Errno::EAGAIN) {
                        return false;
                    }
                    return true;
                }
            }
        }
    }

    /// Frame and dispatch as many requests as the inbound buffer holds.
    /// Parsing stops while a response is still streaming or a CGI child is
    /// attached so responses hit the wire in request order.
    fn process_in_buffer(&self, state: &mut ClientState, now: libc::time_t) {
        loop {
            if state.closing || state.cgi.is_some() || state.file_stream.is_some() {
                break;
            }
            let (header_end, sep_len) = match http::find_header_terminator(&state.in_buffer) {
                Some(terminator) => terminator,
                None => {
                    if state.in_buffer.len() > MAX_HEADER_BYTES {
                        let config = &self.configs[self.config_index_for(state.port, "")];
                        Self::queue_error(state, 431, config, now);
                    }
                    break;
                }
            };
            let body_start = header_end + sep_len;
            let head = String::from_utf8_lossy(&state.in_buffer[..header_end]).into_owned();
            let header_block = match head.find('\n') {
                Some(pos) => &head[pos + 1..],
                None => "",
            };
            let headers = http::parse_headers(header_block);
            let host = headers.get("host").map(String::as_str).unwrap_or("");
            let config_index = self.config_index_for(state.port, host);
            let config = &self.configs[config_index];

            let has_content_length = headers.contains_key("content-length");
            let content_length: u64 = headers
                .get("content-length")
                .and_then(|value| value.trim().parse().ok())
                .unwrap_or(0);
            let is_chunked = headers
                .get("transfer-encoding")
                .map_or(false, |value| value.to_lowercase().contains("chunked"));
            let expects_continue = headers
                .get("expect")
                .map_or(false, |value| value.contains("100-continue"));

            if expects_continue && !state.sent_continue {
                state
                    .out_buffer
                    .extend_from_slice(b"HTTP/1.1 100 Continue\r\n\r\n");
                state.sent_continue = true;
            }

            if has_content_length && content_length > config.client_max_body_size {
                Self::queue_error(state, 413, config, now);
                break;
            }

            let (consumed, normalized) = if has_content_length {
                let have = (state.in_buffer.len() - body_start) as u64;
                if have < content_length {
                    break; // body not complete yet
                }
                let consumed = body_start + content_length as usize;
                (consumed, state.in_buffer[..consumed].to_vec())
            } else if is_chunked {
                match http::decode_chunked_body(
                    &state.in_buffer,
                    body_start,
                    config.client_max_body_size,
                ) {
                    ChunkStatus::Incomplete => break,
                    ChunkStatus::TooLarge => {
                        Self::queue_error(state, 413, config, now);
                        break;
                    }
                    ChunkStatus::Malformed => {
                        Self::queue_error(state, 400, config, now);
                        break;
                    }
                    ChunkStatus::Complete { consumed, decoded } => {
                        let normalized = http::normalize_chunked_request(
                            &state.in_buffer,
                            header_end,
                            &decoded,
                        );
                        (consumed, normalized)
                    }
                }
            } else {
                (body_start, state.in_buffer[..body_start].to_vec())
            };

            match HttpRequest::parse(&normalized) {
                Ok(request) => {
                    state.keep_alive = request.wants_keep_alive();
                    self.dispatch_request(state, &request, config, config_index, now);
                }
                Err(_) => {
                    Self::queue_error(state, 400, config, now);
                }
            }

            let consumed = consumed.min(state.in_buffer.len());
            state.in_buffer.drain(..consumed);
            state.sent_continue = false;
        }
    }

    fn dispatch_request(
        &self,
        state: &mut ClientState,
        request: &HttpRequest,
        config: &ServerConfig,
        config_index: usize,
        now: libc::time_t,
    ) {
        let is_head = request.method() == "HEAD";
        match handlers::dispatch(request, config, now) {
            Dispatch::Response(mut response) => {
                self.finish_response(state, request, &mut response, is_head, now);
            }
            Dispatch::Stream(mut response, stream) => {
                self.finish_response(state, request, &mut response, false, now);
                state.file_stream = Some(stream);
            }
            Dispatch::Cgi => {
                match cgi::start_cgi(request, config, config_index, state.addr, state.port, now) {
                    Ok(cgi) => {
                        // The response is built when the child completes.
                        state.cgi = Some(cgi);
                    }
                    Err(status) => {
                        let mut response = handlers::error_page_response(status, config);
                        self.finish_response(state, request, &mut response, is_head, now);
                    }
                }
            }
        }
    }

    fn finish_response(
        &self,
        state: &mut ClientState,
        request: &HttpRequest,
        response: &mut crate::http::HttpResponse,
        is_head: bool,
        now: libc::time_t,
    ) {
        response.set_header(
            "Connection",
            if state.keep_alive { "keep-alive" } else { "close" },
        );
        response.set_header("Date", http_date(now));
        let status = response.status();
        let length = response.content_length();
        let bytes = response.generate(is_head);
        state.out_buffer.extend_from_slice(&bytes);
        log_request(state, request, status, length, now);
    }

    fn queue_error(
        state: &mut ClientState,
        status: u16,
        config: &ServerConfig,
        now: libc::time_t,
    ) {
        let mut response = handlers::error_page_response(status, config);
        response.set_header("Connection", "close");
        response.set_header("Date", http_date(now));
        state.keep_alive = false;
        state.closing = true;
        let bytes = response.generate(false);
        state.out_buffer.extend_from_slice(&bytes);
    }

    fn process_client_writes(
        &self,
        clients: &mut HashMap<RawFd, ClientState>,
        write_fds: &mut FdSet,
        now: libc::time_t,
    ) {
        let mut fds: Vec<RawFd> = clients.keys().copied().collect();
        fds.sort_unstable();
        for fd in fds {
            if !write_fds.contains(fd) {
                continue;
            }
            let closed = match clients.get_mut(&fd) {
                Some(state) => flush_client(state, now),
                None => continue,
            };
            if closed {
                teardown_client(clients, fd);
                continue;
            }
            let close_now = match clients.get(&fd) {
                Some(state) => {
                    !needs_write(state)
                        && state.cgi.is_none()
                        && (state.closing || !state.keep_alive)
                }
                None => false,
            };
            if close_now {
                teardown_client(clients, fd);
            }
        }
    }

    /// Host-header virtual host selection: strip any `:port` suffix,
    /// lowercase, and match against the server names registered for the
    /// accepting port; the first config for the port is the default.
    fn config_index_for(&self, port: u16, host_header: &str) -> usize {
        let indices = match self.port_to_configs.get(&port) {
            Some(indices) if !indices.is_empty() => indices,
            _ => return 0,
        };
        let mut hostname = host_header.to_lowercase();
        if let Some(colon) = hostname.find(':') {
            hostname.truncate(colon);
        }
        for &index in indices {
            if self.configs[index].server_name.to_lowercase() == hostname {
                return index;
            }
        }
        indices[0]
    }
}

/// Flush the outbound buffer, then feed the attached file stream, until the
/// socket would block. Returns true when the connection must be torn down.
fn flush_client(state: &mut ClientState, now: libc::time_t) -> bool {
    let fd = state.socket.as_raw_fd();
    while state.out_offset < state.out_buffer.len() {
        match socket::send(
            fd,
            &state.out_buffer[state.out_offset..],
            MsgFlags::empty(),
        ) {
            Ok(sent) if sent > 0 => {
                state.out_offset += sent;
                state.last_activity = now;
            }
            Err(error) if error.as_errno() == Some(Errno::EAGAIN) => return false,
            _ => return true, // closure or other error
        }
    }
    if state.out_offset >= state.out_buffer.len() {
        state.out_buffer.clear();
        state.out_offset = 0;
    }

    // The headers are fully out; stream the file body.
    let mut stream_done = false;
    let mut stream_failed = false;
    if state.out_buffer.is_empty() {
        if let Some(stream) = state.file_stream.as_mut() {
            if stream.pending.is_empty() && stream.offset < stream.size {
                let mut buf = [0u8; FILE_CHUNK_BYTES];
                match stream.file.read(&mut buf) {
                    Ok(0) => stream_done = true, // unexpected EOF; stop streaming
                    Ok(bytes_read) => {
                        stream.pending.extend_from_slice(&buf[..bytes_read]);
                        stream.offset += bytes_read as u64;
                    }
                    Err(_) => stream_failed = true,
                }
            }
            if !stream_done && !stream_failed {
                while !stream.pending.is_empty() {
                    match socket::send(fd, &stream.pending, MsgFlags::empty()) {
                        Ok(sent) if sent > 0 => {
                            stream.pending.drain(..sent);
                            state.last_activity = now;
                        }
                        Err(error) if error.as_errno() == Some(Errno::EAGAIN) => break,
                        _ => {
                            stream_failed = true;
                            break;
                        }
                    }
                }
                if stream.pending.is_empty() && stream.offset >= stream.size {
                    stream_done = true;
                }
            }
        }
    }
    if stream_failed {
        return true;
    }
    if stream_done {
        state.file_stream = None;
    }
    false
}

/// One Common Log Format line per completed request.
fn log_request(
    state: &ClientState,
    request: &HttpRequest,
    status: u16,
    length: usize,
    now: libc::time_t,
) {
    println!(
        "{} - - {} \"{} {} {}\" {} {} \"{}\" \"{}\"",
        state.addr,
        clf_date(now),
        log_escape(request.method()),
        log_escape(request.path()),
        log_escape(request.version()),
        status,
        length,
        log_escape(request.header("referer").unwrap_or("")),
        log_escape(request.header("user-agent").unwrap_or("")),
    );
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
