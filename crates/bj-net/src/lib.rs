//! Line-protocol networking for the blackjack client: framing, the
//! transport readiness loop, the acknowledgement/heartbeat session and a
//! typed client facade.

pub mod client;
pub mod framing;
pub mod platform;
pub mod reconnection;
pub mod session;
pub mod transport;

pub use client::{ClientError, GameClient, validate_nickname};
pub use framing::{Classification, Frame, FrameConfig, FrameError, LineBuffer, decode, encode};
pub use platform::{SocketConfig, configure_stream};
pub use reconnection::{ReconnectConfig, ReconnectState};
pub use session::{
    ProtocolSession, Request, SessionConfig, SessionError, SessionEvent, SessionHealth,
    SessionState, StateWatch,
};
pub use transport::{Link, Protocol, StopCause, TransportConfig, TransportEngine, TransportError};
