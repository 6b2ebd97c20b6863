//! Console client for the blackjack line protocol.
//!
//! Connects to the game server, prints every session event and turns typed
//! commands into requests. A lost link is redialled with backoff until the
//! session itself gives up.
//!
//! Run with: `cargo run -p bj-client -- --server 127.0.0.1 --port 10000 --nickname bob`

mod commands;

use std::io::BufRead;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use bj_config::{CliArgs, Config, default_config_dir};
use bj_net::{GameClient, ReconnectConfig, ReconnectState, SessionEvent, TransportConfig};
use clap::Parser;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{error, info, warn};

use crate::commands::{Command, HELP};

/// How long one wait for session events may block.
const EVENT_POLL: Duration = Duration::from_millis(100);

fn main() -> ExitCode {
    let args = CliArgs::parse();

    let config_dir = args
        .config
        .clone()
        .or_else(default_config_dir)
        .unwrap_or_else(|| PathBuf::from("."));

    let mut config = Config::load_or_create(&config_dir).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}, using defaults");
        Config::default()
    });
    config.apply_cli_overrides(&args);

    let log_dir = config_dir.join("logs");
    bj_log::init_logging(Some(&log_dir), cfg!(debug_assertions), Some(&config));

    if let Err(e) = config.validate() {
        error!("{e}");
        return ExitCode::FAILURE;
    }

    let session = bj_net::SessionConfig::from(&config.session);
    let reconnect = ReconnectConfig::from(&config.network).bounded_by(&session);
    let (client, events) = GameClient::new(TransportConfig::from(&config.network), session);
    let client = Arc::new(client);

    let host = config.network.server_address.as_str();
    let port = config.network.server_port;
    info!("Connecting to {host}:{port}");
    if let Err(e) = client.connect(host, port) {
        error!("Cannot start networking: {e}");
        return ExitCode::FAILURE;
    }

    let input = match spawn_stdin_reader() {
        Ok(input) => input,
        Err(e) => {
            error!("Failed to spawn input thread: {e}");
            return ExitCode::FAILURE;
        }
    };

    println!("{HELP}");
    let mut console = Console {
        client: Arc::clone(&client),
        nickname: args.nickname.clone(),
        backoff: ReconnectState::new(reconnect),
        redial_at: None,
    };
    let code = console.run(&events, &input);
    client.disconnect("client exiting");
    code
}

/// Lines typed by the user, read on a dedicated thread.
fn spawn_stdin_reader() -> std::io::Result<Receiver<String>> {
    let (tx, rx) = crossbeam_channel::unbounded();
    thread::Builder::new()
        .name("bj-stdin".into())
        .spawn(move || {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        })?;
    Ok(rx)
}

struct Console {
    client: Arc<GameClient>,
    /// Nickname to log in with whenever the server asks for one.
    nickname: Option<String>,
    backoff: ReconnectState,
    redial_at: Option<Instant>,
}

enum Flow {
    Continue,
    Exit(ExitCode),
}

impl Console {
    fn run(&mut self, events: &Receiver<SessionEvent>, input: &Receiver<String>) -> ExitCode {
        loop {
            for line in input.try_iter() {
                if let Flow::Exit(code) = self.on_input(&line) {
                    return code;
                }
            }

            match events.recv_timeout(EVENT_POLL) {
                Ok(event) => {
                    if let Flow::Exit(code) = self.on_event(event) {
                        return code;
                    }
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    error!("Session event channel closed");
                    return ExitCode::FAILURE;
                }
            }

            if let Flow::Exit(code) = self.redial_if_due(Instant::now()) {
                return code;
            }
        }
    }

    fn on_input(&mut self, line: &str) -> Flow {
        let command = match commands::parse(line) {
            Ok(Some(command)) => command,
            Ok(None) => return Flow::Continue,
            Err(e) => {
                println!("{e}");
                return Flow::Continue;
            }
        };

        match &command {
            Command::Quit => return Flow::Exit(ExitCode::SUCCESS),
            Command::Help => println!("{HELP}"),
            _ => {}
        }
        match command.apply(&self.client) {
            Ok(()) => {
                if let Command::Login(nickname) = command {
                    self.nickname = Some(nickname);
                }
            }
            Err(e) => println!("! {e}"),
        }
        Flow::Continue
    }

    fn on_event(&mut self, event: SessionEvent) -> Flow {
        match event {
            SessionEvent::Message { command, args } => {
                // Traffic means the link is healthy again.
                self.backoff.reset();
                println!("< {command} {}", args.as_deref().unwrap_or(""));
                self.follow_up(&command, args.as_deref());
            }
            SessionEvent::Offline { reason } => {
                println!("* offline: {reason}");
                if self.redial_at.is_none() {
                    match self.backoff.next_deadline(Instant::now()) {
                        Some(at) => self.redial_at = Some(at),
                        None => {
                            error!("Reconnect budget exhausted");
                            return Flow::Exit(ExitCode::FAILURE);
                        }
                    }
                }
            }
            SessionEvent::Fatal { reason } => {
                error!("{reason}");
                println!("* fatal: {reason}");
                return Flow::Exit(ExitCode::FAILURE);
            }
            SessionEvent::RequestExpired { command } => {
                println!("* no answer to {command}, giving up");
            }
            SessionEvent::Rejected { command, reason } => {
                println!("* {command} not sent: {reason}");
            }
        }
        Flow::Continue
    }

    /// Automatic replies the server expects from an interactive client.
    fn follow_up(&self, command: &str, args: Option<&str>) {
        let result = match command {
            "REQ_NICK" => match &self.nickname {
                Some(nickname) => self.client.login(nickname),
                None => {
                    println!("* server asks for a nickname: login <nick>");
                    Ok(())
                }
            },
            // Restored into a running game: fetch the table.
            "ACK__REC" if args.and_then(|a| a.rsplit(';').next()) != Some("-1") => {
                self.client.request_game_state()
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!("Automatic reply to {command} failed: {e}");
        }
    }

    fn redial_if_due(&mut self, now: Instant) -> Flow {
        let Some(at) = self.redial_at else {
            return Flow::Continue;
        };
        if now < at {
            return Flow::Continue;
        }

        self.redial_at = None;
        info!("Reconnection attempt {}", self.backoff.attempts());
        if let Err(e) = self.client.reconnect() {
            warn!("Reconnect failed: {e}");
            match self.backoff.next_deadline(now) {
                Some(at) => self.redial_at = Some(at),
                None => return Flow::Exit(ExitCode::FAILURE),
            }
        }
        Flow::Continue
    }
}
