//! Protocol session: request/acknowledgement tracking, heartbeats and
//! liveness for one logical client session.
//!
//! [`ProtocolSession`] runs on the transport loop thread as its
//! [`Protocol`]. It validates inbound lines, keeps at most one
//! acknowledgement-pending request, retries it on timeout, answers `PING____`
//! and decides when the connection should be considered dead. Everything the
//! consumer needs to know leaves through a [`SessionEvent`] channel; the
//! current [`SessionState`] is additionally published on a [`watch`] channel.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use tokio::sync::watch;

use crate::framing::{self, Classification, FrameError};
use crate::transport::{Link, Protocol, StopCause};

/// Session policy values. Defaults match the deployed peer.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionConfig {
    /// How long to wait for an ACK/NACK before resending. Default: 5 s.
    pub ack_timeout: Duration,
    /// Resends before a request is given up. Default: 3.
    pub max_retries: u32,
    /// Silence after which the connection is presumed dead. Default: 10 s.
    pub liveness_window: Duration,
    /// Failed connection cycles tolerated before giving up. Default: 5.
    pub max_reconnect_attempts: u32,
    /// Consecutive invalid lines tolerated. Default: 3.
    pub max_invalid_messages: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ack_timeout: Duration::from_secs(5),
            max_retries: 3,
            liveness_window: Duration::from_secs(10),
            max_reconnect_attempts: 5,
            max_invalid_messages: 3,
        }
    }
}

/// Session lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// No connection loop is running.
    Disconnected,
    /// Connected (or connecting); the peer has not accepted a nickname yet.
    AwaitingNickname,
    /// Connected with no outstanding request.
    Idle,
    /// One acknowledgement-requiring request is outstanding.
    AwaitingAck,
}

/// Events delivered to the consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// An inbound command: acknowledgements and application events alike.
    /// `command` is the token verbatim (e.g. `ACK__NIC`).
    Message {
        /// Command token.
        command: String,
        /// Opaque argument payload.
        args: Option<String>,
    },
    /// The connection was lost; the consumer should drive a reconnect.
    Offline {
        /// What was observed.
        reason: String,
    },
    /// The session cannot continue; the client should stop.
    Fatal {
        /// Human-readable reason.
        reason: String,
    },
    /// A request ran out of retries without an acknowledgement.
    RequestExpired {
        /// Command of the abandoned request.
        command: String,
    },
    /// A request was refused locally and never sent.
    Rejected {
        /// Command of the refused request.
        command: String,
        /// Why it was refused.
        reason: String,
    },
}

/// Errors from [`ProtocolSession::submit_request`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    /// An acknowledgement-requiring request is already outstanding.
    #[error("request {command} is still awaiting acknowledgement")]
    RequestPending {
        /// Command of the outstanding request.
        command: String,
    },
    /// There is no connection to send on.
    #[error("session is not connected")]
    NotConnected,
    /// The request could not be framed.
    #[error(transparent)]
    Frame(#[from] FrameError),
}

/// A caller request, already framed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    command: String,
    frame: String,
    requires_ack: bool,
}

impl Request {
    /// Frame `command` with `args`. Fails if the command cannot be framed.
    pub fn new(command: &str, args: &[&str], requires_ack: bool) -> Result<Self, FrameError> {
        let frame = framing::encode(command, args)?;
        Ok(Self {
            command: framing::pad_command(command),
            frame,
            requires_ack,
        })
    }

    /// The padded command token.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The exact wire frame, delimiter included.
    pub fn frame(&self) -> &str {
        &self.frame
    }

    /// Whether the peer must acknowledge this request.
    pub fn requires_ack(&self) -> bool {
        self.requires_ack
    }
}

/// The one request awaiting acknowledgement.
#[derive(Debug, Clone)]
struct PendingRequest {
    command: String,
    frame: String,
    sent_at: Instant,
    retries: u32,
}

/// Counters that decide whether the connection is healthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionHealth {
    /// When the last valid line arrived (or the connection attempt began).
    pub last_message_at: Instant,
    /// Invalid lines since the last valid one.
    pub invalid_messages: u32,
    /// Connection cycles lost since the last heartbeat. Both liveness
    /// timeouts and transport faults the session did not ask for (peer
    /// close, connect/read/write errors) count; only `PING____` resets it.
    pub reconnect_attempts: u32,
}

/// Observable session state backed by a [`watch`] channel.
pub struct StateWatch {
    tx: watch::Sender<SessionState>,
    rx: watch::Receiver<SessionState>,
}

impl Default for StateWatch {
    fn default() -> Self {
        Self::new()
    }
}

impl StateWatch {
    /// Create a new watch initialized to [`SessionState::Disconnected`].
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(SessionState::Disconnected);
        Self { tx, rx }
    }

    fn set(&self, state: SessionState) {
        let _ = self.tx.send(state);
    }

    /// Return a new subscriber receiver.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.rx.clone()
    }

    /// Return the current state without blocking.
    pub fn current(&self) -> SessionState {
        *self.rx.borrow()
    }
}

/// Client-side protocol state machine.
pub struct ProtocolSession {
    config: SessionConfig,
    state: SessionState,
    pending: Option<PendingRequest>,
    health: SessionHealth,
    events: Sender<SessionEvent>,
    watch: Arc<StateWatch>,
    /// The current loop is ending at the session's own request.
    stopping: bool,
    invalid_reported: bool,
    exhaustion_reported: bool,
}

impl ProtocolSession {
    /// Create a disconnected session that reports to `events`.
    pub fn new(config: SessionConfig, events: Sender<SessionEvent>) -> Self {
        Self {
            config,
            state: SessionState::Disconnected,
            pending: None,
            health: SessionHealth {
                last_message_at: Instant::now(),
                invalid_messages: 0,
                reconnect_attempts: 0,
            },
            events,
            watch: Arc::new(StateWatch::new()),
            stopping: false,
            invalid_reported: false,
            exhaustion_reported: false,
        }
    }

    /// Shared handle to the published state.
    pub fn state_watch(&self) -> Arc<StateWatch> {
        Arc::clone(&self.watch)
    }

    /// Current state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Current health counters.
    pub fn health(&self) -> SessionHealth {
        self.health
    }

    /// Command of the outstanding request, if any.
    pub fn pending_command(&self) -> Option<&str> {
        self.pending.as_ref().map(|p| p.command.as_str())
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            tracing::debug!("Session state {:?} -> {:?}", self.state, state);
            self.state = state;
            self.watch.set(state);
        }
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Session event dropped, consumer has gone away");
        }
    }

    fn request_stop(&mut self, link: &mut Link, reason: &str) {
        self.stopping = true;
        link.stop(reason);
    }

    /// Send a request. Fire-and-forget requests go straight out; requests
    /// needing acknowledgement become the pending request.
    pub fn submit_request(
        &mut self,
        request: Request,
        now: Instant,
        link: &mut Link,
    ) -> Result<(), SessionError> {
        if self.state == SessionState::Disconnected {
            return Err(SessionError::NotConnected);
        }

        if !request.requires_ack {
            tracing::debug!("Sending {}", request.command);
            link.send(request.frame);
            return Ok(());
        }

        if let Some(pending) = &self.pending {
            return Err(SessionError::RequestPending {
                command: pending.command.clone(),
            });
        }

        tracing::debug!("Sending {} (awaiting acknowledgement)", request.command);
        link.send(request.frame.clone());
        self.pending = Some(PendingRequest {
            command: request.command,
            frame: request.frame,
            sent_at: now,
            retries: 0,
        });
        self.set_state(SessionState::AwaitingAck);
        Ok(())
    }

    /// Process one inbound line.
    pub fn on_incoming_line(&mut self, raw: &str, now: Instant, link: &mut Link) {
        let frame = match framing::decode(raw) {
            Ok(frame) => frame,
            Err(_) => {
                self.health.invalid_messages += 1;
                tracing::debug!("Discarding invalid protocol message: {raw:?}");
                if self.health.invalid_messages > self.config.max_invalid_messages
                    && !self.invalid_reported
                {
                    tracing::error!(
                        "{} invalid messages in a row, disconnecting",
                        self.health.invalid_messages
                    );
                    self.invalid_reported = true;
                    self.emit(SessionEvent::Fatal {
                        reason: "Detected invalid messages from server".to_string(),
                    });
                    self.request_stop(link, "too many invalid messages");
                }
                return;
            }
        };

        self.health.last_message_at = now;
        self.health.invalid_messages = 0;

        match frame.classify() {
            Classification::Ack | Classification::Nack if self.pending.is_some() => {
                self.pending = None;
                self.set_state(SessionState::Idle);
                self.emit(SessionEvent::Message {
                    command: frame.command,
                    args: frame.args,
                });
            }
            Classification::Heartbeat => {
                tracing::trace!("Answering heartbeat");
                self.health.reconnect_attempts = 0;
                link.send(format!("{}{}", framing::PREFIX, framing::PONG));
            }
            _ => self.emit(SessionEvent::Message {
                command: frame.command,
                args: frame.args,
            }),
        }
    }

    /// Evaluate timers: reconnect exhaustion, liveness, then the pending
    /// request's retry schedule.
    pub fn on_tick(&mut self, now: Instant, link: &mut Link) {
        if self.health.reconnect_attempts > self.config.max_reconnect_attempts {
            if !self.exhaustion_reported {
                tracing::error!(
                    "Gave up after {} failed connection cycles",
                    self.health.reconnect_attempts
                );
                self.exhaustion_reported = true;
                self.emit(SessionEvent::Fatal {
                    reason: "Ran out of reconnection attempts.".to_string(),
                });
            }
            self.request_stop(link, "reconnection attempts exhausted");
            return;
        }

        if now.saturating_duration_since(self.health.last_message_at) > self.config.liveness_window
        {
            tracing::warn!(
                "No message for {:?}, marking connection offline",
                self.config.liveness_window
            );
            self.emit(SessionEvent::Offline {
                reason: "connection timed out".to_string(),
            });
            self.request_stop(link, "liveness timeout");
            self.health.last_message_at = now;
            self.health.reconnect_attempts += 1;
            return;
        }

        let Some(pending) = self.pending.as_mut() else {
            return;
        };
        if now.saturating_duration_since(pending.sent_at) <= self.config.ack_timeout {
            return;
        }

        if pending.retries < self.config.max_retries {
            pending.retries += 1;
            pending.sent_at = now;
            tracing::warn!(
                "No acknowledgement for {}, resending ({}/{})",
                pending.command,
                pending.retries,
                self.config.max_retries
            );
            link.send(pending.frame.clone());
        } else {
            let command = pending.command.clone();
            tracing::warn!("No acknowledgement for {command} after max retries, giving up");
            self.pending = None;
            self.set_state(SessionState::Idle);
            self.emit(SessionEvent::RequestExpired { command });
        }
    }
}

impl Protocol for ProtocolSession {
    type Request = Request;

    fn on_connecting(&mut self, now: Instant) {
        self.pending = None;
        self.health.last_message_at = now;
        self.health.invalid_messages = 0;
        self.stopping = false;
        self.invalid_reported = false;
        self.set_state(SessionState::AwaitingNickname);
    }

    fn on_line(&mut self, line: &str, now: Instant, link: &mut Link) {
        self.on_incoming_line(line, now, link);
    }

    fn on_request(&mut self, request: Request, now: Instant, link: &mut Link) {
        let command = request.command.clone();
        if let Err(e) = self.submit_request(request, now, link) {
            tracing::warn!("Rejected {command}: {e}");
            self.emit(SessionEvent::Rejected {
                command,
                reason: e.to_string(),
            });
        }
    }

    fn on_tick(&mut self, now: Instant, link: &mut Link) {
        ProtocolSession::on_tick(self, now, link);
    }

    fn on_stopped(&mut self, cause: &StopCause) {
        if let Some(pending) = self.pending.take() {
            tracing::debug!("Dropping pending {} on disconnect", pending.command);
        }
        self.set_state(SessionState::Disconnected);

        if cause.is_fault() && !self.stopping {
            self.health.reconnect_attempts += 1;
            tracing::warn!(
                "Link lost ({}), reconnect attempt counter now {}",
                cause.reason(),
                self.health.reconnect_attempts
            );
            self.emit(SessionEvent::Offline {
                reason: cause.reason().to_string(),
            });
        }
        self.stopping = false;
    }
}

#[cfg(test)]
#[path = "session_tests.rs"]
mod tests;
