//! The `wsd` WebSocket daemon.
//!
//! Starts a [`ws_rt::Server`], prints every text message it receives and
//! broadcasts each line typed on stdin to all connected clients. Closing
//! stdin (Ctrl-D) stops the server.
//!
//! Options:
//! - `--host`, `--port` - Bind address (override the config file)
//! - `--config` - TOML file with `ServerConfig` fields
//! - `--log-level` - `nothing`, `subtle` or `verbose` (`RUST_LOG` wins when set)
//! - `--mode` - `echo` replies to the sender, `relay` forwards to everyone else

use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::{Arc, Weak};

use anyhow::Context;
use clap::{Parser, ValueEnum};
use crossbeam_channel::Receiver;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use ws_rt::{event_channel, Message, Server, ServerConfig, ServerEvent};

#[derive(Parser, Debug)]
#[command(name = "wsd", version, about = "A standalone WebSocket server")]
struct Cli {
    /// Address to bind
    #[arg(long)]
    host: Option<String>,

    /// Port to listen on (0 picks a free port)
    #[arg(short, long)]
    port: Option<u16>,

    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// How much to log
    #[arg(long = "log-level", value_enum, default_value_t = LogLevel::Subtle)]
    log_level: LogLevel,

    /// What to do with received messages besides printing them
    #[arg(long, value_enum)]
    mode: Option<Mode>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum LogLevel {
    Nothing,
    Subtle,
    Verbose,
}

impl LogLevel {
    fn filter(self) -> &'static str {
        match self {
            LogLevel::Nothing => "off",
            LogLevel::Subtle => "info",
            LogLevel::Verbose => "debug",
        }
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum Mode {
    /// Send each message back to its sender
    Echo,
    /// Forward each text message to every other client
    Relay,
}

impl Cli {
    fn server_config(&self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => ServerConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ServerConfig::default(),
        };
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        config.validate()?;
        Ok(config)
    }
}

fn init_logging(level: LogLevel) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.filter()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level);
    let config = cli.server_config()?;

    let (handler, events) = event_channel();
    let server = Arc::new(Server::new(config, handler));
    let addr = server.start().context("failed to start server")?;
    info!(%addr, mode = ?cli.mode, "wsd ready, type a line to broadcast it, Ctrl-D to stop");

    let consumer = {
        let server = Arc::downgrade(&server);
        let mode = cli.mode;
        std::thread::Builder::new()
            .name("wsd-events".into())
            .spawn(move || consume_events(&events, &server, mode))?
    };

    for line in io::stdin().lock().lines() {
        let line = line.context("reading stdin")?;
        if line.is_empty() {
            continue;
        }
        let report = server.broadcast(&line, None);
        info!(delivered = report.delivered, failed = report.failed.len(), "broadcast");
    }

    server.stop();
    // Dropping the last handle drops the handler, which ends the event stream.
    drop(server);
    if consumer.join().is_err() {
        warn!("event thread panicked");
    }
    Ok(())
}

fn consume_events(events: &Receiver<ServerEvent>, server: &Weak<Server>, mode: Option<Mode>) {
    for event in events {
        match event {
            ServerEvent::Connected(conn) => {
                println!("[{}] Connected ({})", conn.id(), conn.peer_addr());
            }
            ServerEvent::Disconnected(conn, reason) => {
                println!("[{}] Disconnected: {}", conn.id(), reason);
            }
            ServerEvent::Message(conn, message) => {
                print_message(conn.id(), &message);
                let result = match mode {
                    Some(Mode::Echo) => match message.as_text() {
                        Some(text) => conn.send_text(text),
                        None => conn.send_binary(&message.data),
                    },
                    Some(Mode::Relay) => {
                        if let (Some(server), Some(text)) = (server.upgrade(), message.as_text()) {
                            server.broadcast(text, Some(conn.id()));
                        }
                        Ok(())
                    }
                    None => Ok(()),
                };
                if let Err(e) = result {
                    warn!(conn_id = conn.id(), error = %e, "reply failed");
                }
            }
        }
    }
}

fn print_message(id: u64, message: &Message) {
    match message.as_text() {
        Some(text) => println!("[{}] {}", id, text),
        None => println!("[{}] <{} bytes binary>", id, message.data.len()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_defaults() {
        let cli = Cli::parse_from(["wsd"]);
        assert_eq!(cli.log_level, LogLevel::Subtle);
        assert_eq!(cli.mode, None);
        let config = cli.server_config().unwrap();
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "wsd",
            "--host",
            "127.0.0.1",
            "-p",
            "0",
            "--log-level",
            "verbose",
            "--mode",
            "relay",
        ]);
        assert_eq!(cli.log_level.filter(), "debug");
        assert_eq!(cli.mode, Some(Mode::Relay));
        let config = cli.server_config().unwrap();
        assert_eq!(config.bind_addr(), "127.0.0.1:0");
    }

    #[test]
    fn log_levels() {
        assert_eq!(LogLevel::Nothing.filter(), "off");
        assert_eq!(LogLevel::Subtle.filter(), "info");
        assert!(Cli::try_parse_from(["wsd", "--log-level", "loud"]).is_err());
    }

    #[test]
    fn missing_config_file_is_an_error() {
        let cli = Cli::parse_from(["wsd", "--config", "/nonexistent/wsd.toml"]);
        let err = cli.server_config().unwrap_err();
        assert!(format!("{err:#}").contains("/nonexistent/wsd.toml"));
    }
}
