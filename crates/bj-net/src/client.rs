//! Game client: a [`TransportEngine`] driving a [`ProtocolSession`], plus
//! typed helpers for every request the game server understands.
//!
//! Requests that change server-side state (`LOGIN___`, `JOIN____`, ...) are
//! sent with acknowledgement tracking; gameplay nudges (`HIT_____`,
//! `PAG_____`, `REC__GAM`) are fire-and-forget.

use std::sync::Arc;

use crossbeam_channel::Receiver;
use tokio::sync::watch;

use crate::framing::FrameError;
use crate::session::{
    ProtocolSession, Request, SessionConfig, SessionEvent, SessionState, StateWatch,
};
use crate::transport::{TransportConfig, TransportEngine, TransportError};

/// Shortest accepted nickname, in characters.
pub const NICKNAME_MIN_LEN: usize = 3;
/// Longest accepted nickname, in characters.
pub const NICKNAME_MAX_LEN: usize = 10;

/// Errors returned by [`GameClient`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// The transport refused the operation.
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// The request could not be framed.
    #[error(transparent)]
    Frame(#[from] FrameError),
    /// The nickname would be rejected by the server.
    #[error("invalid nickname: {0}")]
    InvalidNickname(String),
}

/// Check a nickname against the server's rules before it goes on the wire.
pub fn validate_nickname(nickname: &str) -> Result<(), ClientError> {
    let len = nickname.chars().count();
    if !(NICKNAME_MIN_LEN..=NICKNAME_MAX_LEN).contains(&len) {
        return Err(ClientError::InvalidNickname(format!(
            "must be {NICKNAME_MIN_LEN} to {NICKNAME_MAX_LEN} characters long"
        )));
    }
    if nickname.contains([';', ':']) {
        return Err(ClientError::InvalidNickname(
            "must not contain ';' or ':'".to_string(),
        ));
    }
    Ok(())
}

/// Handle to one game server session.
///
/// All methods take `&self`; wrap the client in an `Arc` to drive it from
/// several threads.
pub struct GameClient {
    engine: TransportEngine<ProtocolSession>,
    state: Arc<StateWatch>,
}

impl GameClient {
    /// Build an idle client. Session events arrive on the returned receiver.
    pub fn new(
        transport: TransportConfig,
        session: SessionConfig,
    ) -> (Self, Receiver<SessionEvent>) {
        let (events_tx, events_rx) = crossbeam_channel::unbounded();
        let session = ProtocolSession::new(session, events_tx);
        let state = session.state_watch();
        let client = Self {
            engine: TransportEngine::new(transport, session),
            state,
        };
        (client, events_rx)
    }

    /// Start connecting to `host:port`. Connection failures arrive later as
    /// [`SessionEvent::Offline`].
    pub fn connect(&self, host: &str, port: u16) -> Result<(), ClientError> {
        self.engine.start(host, port)?;
        Ok(())
    }

    /// Drop the current connection and dial the same endpoint again.
    pub fn reconnect(&self) -> Result<(), ClientError> {
        self.engine.reconnect()?;
        Ok(())
    }

    /// Close the connection. Safe to call when already disconnected.
    pub fn disconnect(&self, reason: &str) {
        self.engine.stop(reason);
    }

    /// Whether the transport loop is running.
    pub fn is_connected(&self) -> bool {
        self.engine.is_running()
    }

    /// Current session state.
    pub fn state(&self) -> SessionState {
        self.state.current()
    }

    /// Subscribe to session state changes.
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Endpoint of the last connect.
    pub fn endpoint(&self) -> Option<(String, u16)> {
        self.engine.endpoint()
    }

    /// Send an arbitrary command.
    pub fn submit(
        &self,
        command: &str,
        args: &[&str],
        requires_ack: bool,
    ) -> Result<(), ClientError> {
        let request = Request::new(command, args, requires_ack)?;
        self.engine.submit(request)?;
        Ok(())
    }

    /// Queue a raw line, bypassing the session.
    pub fn send_raw(&self, message: impl Into<String>) -> Result<(), ClientError> {
        self.engine.send(message)?;
        Ok(())
    }

    /// Identify with the server. Answered by `ACK__NIC` or `NACK_NIC`.
    pub fn login(&self, nickname: &str) -> Result<(), ClientError> {
        validate_nickname(nickname)?;
        self.submit("LOGIN", &[nickname], true)
    }

    /// Sit down in `room`. Answered by `ACK__JON` or `NACK_JON`.
    pub fn join_room(&self, room: u32) -> Result<(), ClientError> {
        self.submit("JOIN", &[&room.to_string()], true)
    }

    /// Leave the current room. Answered by `ACK_LVRO`.
    pub fn leave_room(&self) -> Result<(), ClientError> {
        self.submit("LVRO", &[], true)
    }

    /// End the turn. Answered by `ACK_STND`.
    pub fn stand(&self) -> Result<(), ClientError> {
        self.submit("STAND", &[], true)
    }

    /// Toggle readiness for the next round. Answered by `ACK__RDY` or `ACK__NRD`.
    pub fn set_ready(&self, ready: bool) -> Result<(), ClientError> {
        let command = if ready { "RDY" } else { "NRD" };
        self.submit(command, &[], true)
    }

    /// Place a bet. Answered by `ACK___BT` or `NACK__BT`.
    pub fn bet(&self, amount: u32) -> Result<(), ClientError> {
        self.submit("BT", &[&amount.to_string()], true)
    }

    /// Draw a card. Fire-and-forget; the dealt card arrives as a regular
    /// game message.
    pub fn hit(&self) -> Result<(), ClientError> {
        self.submit("HIT", &[], false)
    }

    /// Stay at the table for another round. Fire-and-forget.
    pub fn play_again(&self) -> Result<(), ClientError> {
        self.submit("PAG", &[], false)
    }

    /// Ask the server to resend the full game state. Fire-and-forget.
    pub fn request_game_state(&self) -> Result<(), ClientError> {
        self.submit("REC__GAM", &[], false)
    }
}
