use anyhow::{Context, Result};
use nix::sys::signal::{signal, SigHandler, Signal};

mod cgi;
mod config;
mod handlers;
mod http;
mod mime;
mod resolve;
mod server;
mod util;

const DEFAULT_CONFIG_PATH: &str = "config/default.conf";

fn main() -> Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| DEFAULT_CONFIG_PATH.to_string());

    let configs = config::parse_config_file(&config_path)
        .with_context(|| format!("failed to load configuration from {}", config_path))?;

    // A peer disconnecting mid-send must not kill the process.
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(server::request_stop)) }
        .context("failed to set SIGINT handler")?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(server::request_stop)) }
        .context("failed to set SIGTERM handler")?;

    let mut server = server::Server::new(configs)?;
    server.start()
}
