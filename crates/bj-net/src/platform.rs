//! TCP socket tuning for the client connection.
//!
//! [`SocketConfig`] collects the per-connection options (TCP_NODELAY and
//! keepalive) and [`configure_stream`] applies them once the non-blocking
//! connect has completed.

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

/// Socket options applied to every connection the transport opens.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm. Control frames are tiny. Default: true.
    pub tcp_nodelay: bool,
    /// Enable TCP keepalive. Default: true.
    pub keepalive_enabled: bool,
    /// Idle time before the first keepalive packet. Default: 30s.
    pub keepalive_idle: Duration,
    /// Interval between keepalive packets. Default: 5s.
    pub keepalive_interval: Duration,
    /// Unanswered keepalives before the OS declares the connection dead. Default: 3.
    pub keepalive_retries: u32,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            tcp_nodelay: true,
            keepalive_enabled: true,
            keepalive_idle: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(5),
            keepalive_retries: 3,
        }
    }
}

/// Apply `config` to a freshly connected stream.
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.tcp_nodelay)?;
    if !config.keepalive_enabled {
        return Ok(());
    }

    let keepalive = TcpKeepalive::new()
        .with_time(config.keepalive_idle)
        .with_interval(config.keepalive_interval);
    // macOS has no per-socket keepalive count.
    #[cfg(any(target_os = "linux", target_os = "windows"))]
    let keepalive = keepalive.with_retries(config.keepalive_retries);

    SockRef::from(stream).set_tcp_keepalive(&keepalive)?;
    tracing::debug!(
        "Keepalive on: idle {:?}, interval {:?}",
        config.keepalive_idle,
        config.keepalive_interval
    );
    Ok(())
}
