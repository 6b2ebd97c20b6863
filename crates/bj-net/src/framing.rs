//! Line-delimited `BJ:` framing.
//!
//! Every message on the wire is a single UTF-8 line:
//!
//! ```text
//! +------+----------------+-------------------------+------+
//! | BJ:  | CMD (8 chars)  | [":" ARG1[,ARG2...]]    | \n   |
//! +------+----------------+-------------------------+------+
//! ```
//!
//! `CMD` is a fixed-width token padded with `_` (e.g. `LOGIN___`, `ACK__NIC`).
//! The argument payload belongs to the application and is passed through
//! untouched. Any line that does not begin with `BJ:` is invalid.

use std::fmt;

/// Required prefix of every frame.
pub const PREFIX: &str = "BJ:";

/// Line delimiter.
pub const DELIMITER: u8 = b'\n';

/// Width of the command token.
pub const COMMAND_WIDTH: usize = 8;

/// Heartbeat sent by the peer.
pub const PING: &str = "PING____";

/// Heartbeat response sent back to the peer.
pub const PONG: &str = "PONG____";

/// Configuration for the reassembly buffer.
#[derive(Debug, Clone)]
pub struct FrameConfig {
    /// Maximum number of bytes an unterminated line may grow to. Default: 64 KiB.
    pub max_line_len: usize,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            max_line_len: 64 * 1024,
        }
    }
}

/// Errors that can occur while encoding or decoding frames.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    /// The line does not start with `BJ:`.
    #[error("line is missing the `BJ:` prefix")]
    MissingPrefix,

    /// The command token is wider than [`COMMAND_WIDTH`].
    #[error("command `{0}` is longer than 8 characters")]
    CommandTooLong(String),

    /// The command token is empty.
    #[error("command is empty")]
    EmptyCommand,

    /// The command or an argument contains a character that would break framing.
    #[error("`{0}` contains a reserved character")]
    ForbiddenCharacter(String),

    /// An unterminated line outgrew the reassembly limit.
    #[error("unterminated line of {len} bytes exceeds maximum {max}")]
    LineTooLong {
        /// Bytes buffered without a delimiter.
        len: usize,
        /// The configured maximum.
        max: usize,
    },
}

/// A decoded frame: command token plus the opaque argument payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Command token, e.g. `ACK__NIC`.
    pub command: String,
    /// Everything after the first `:` following the command, if present.
    pub args: Option<String>,
}

/// Closed classification of inbound commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// Positive acknowledgement (`ACK_...`).
    Ack,
    /// Negative acknowledgement (`NACK...`).
    Nack,
    /// Heartbeat (`PING____`).
    Heartbeat,
    /// Anything else.
    Generic,
}

impl Frame {
    /// Classify the command token.
    ///
    /// The response class is the text before the first `_`, so `ACK__NIC`
    /// and `ACK_LVRO` are both [`Classification::Ack`].
    pub fn classify(&self) -> Classification {
        if self.command == PING {
            return Classification::Heartbeat;
        }
        match self.command.split('_').next() {
            Some("ACK") => Classification::Ack,
            Some("NACK") => Classification::Nack,
            _ => Classification::Generic,
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.args {
            Some(args) => write!(f, "{PREFIX}{}:{args}", self.command),
            None => write!(f, "{PREFIX}{}", self.command),
        }
    }
}

fn has_reserved(text: &str, forbid_colon: bool) -> bool {
    text.chars()
        .any(|c| c == '\n' || c == '\r' || (forbid_colon && c == ':'))
}

/// Pad a command token with `_` up to [`COMMAND_WIDTH`].
pub fn pad_command(command: &str) -> String {
    let mut padded = command.to_string();
    let padding = COMMAND_WIDTH.saturating_sub(command.chars().count());
    padded.extend(std::iter::repeat_n('_', padding));
    padded
}

/// Encode a command and its arguments into a delimited wire frame.
///
/// The command is padded with `_` to [`COMMAND_WIDTH`]. Arguments are joined
/// with `,`; an empty slice produces no trailing `:`.
pub fn encode(command: &str, args: &[&str]) -> Result<String, FrameError> {
    if command.is_empty() {
        return Err(FrameError::EmptyCommand);
    }
    if has_reserved(command, true) {
        return Err(FrameError::ForbiddenCharacter(command.to_string()));
    }
    if command.chars().count() > COMMAND_WIDTH {
        return Err(FrameError::CommandTooLong(command.to_string()));
    }
    if let Some(arg) = args.iter().find(|a| has_reserved(a, false)) {
        return Err(FrameError::ForbiddenCharacter((*arg).to_string()));
    }

    let mut frame = String::with_capacity(PREFIX.len() + COMMAND_WIDTH + 16);
    frame.push_str(PREFIX);
    frame.push_str(&pad_command(command));
    if !args.is_empty() {
        frame.push(':');
        frame.push_str(&args.join(","));
    }
    frame.push(DELIMITER as char);
    Ok(frame)
}

/// Append the line delimiter unless the message already ends with one.
pub fn ensure_delimited(message: impl Into<String>) -> String {
    let mut message = message.into();
    if !message.ends_with(DELIMITER as char) {
        message.push(DELIMITER as char);
    }
    message
}

/// Decode one line (without its delimiter) into a [`Frame`].
///
/// Only the prefix is validated; trailing whitespace is trimmed and the
/// argument payload is returned verbatim.
pub fn decode(line: &str) -> Result<Frame, FrameError> {
    let content = line.strip_prefix(PREFIX).ok_or(FrameError::MissingPrefix)?;
    let content = content.trim();
    let (command, args) = match content.split_once(':') {
        Some((command, args)) => (command, Some(args.to_string())),
        None => (content, None),
    };
    Ok(Frame {
        command: command.to_string(),
        args,
    })
}

fn utf8_only(bytes: &[u8]) -> String {
    let mut line = String::with_capacity(bytes.len());
    for chunk in bytes.utf8_chunks() {
        line.push_str(chunk.valid());
    }
    line
}

/// Reassembly buffer for the inbound byte stream.
///
/// After every [`push`](Self::push) the buffer holds only the bytes after the
/// last delimiter seen.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
    max_line_len: usize,
}

impl LineBuffer {
    /// Create an empty buffer with the given limit for unterminated lines.
    pub fn new(config: &FrameConfig) -> Self {
        Self {
            pending: Vec::new(),
            max_line_len: config.max_line_len,
        }
    }

    /// Append `bytes` and return every completed line in arrival order.
    ///
    /// Bytes that are not valid UTF-8 are dropped from the line; prefix
    /// validation is left to the session.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, FrameError> {
        self.pending.extend_from_slice(bytes);

        let mut lines = Vec::new();
        let mut start = 0;
        while let Some(offset) = self.pending[start..].iter().position(|&b| b == DELIMITER) {
            let end = start + offset;
            lines.push(utf8_only(&self.pending[start..end]));
            start = end + 1;
        }
        self.pending.drain(..start);

        if self.max_line_len > 0 && self.pending.len() > self.max_line_len {
            let len = self.pending.len();
            self.pending.clear();
            return Err(FrameError::LineTooLong {
                len,
                max: self.max_line_len,
            });
        }
        Ok(lines)
    }

    /// Discard any buffered partial line.
    pub fn clear(&mut self) {
        self.pending.clear();
    }

    /// Number of buffered bytes awaiting a delimiter.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Whether no partial line is buffered.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer() -> LineBuffer {
        LineBuffer::new(&FrameConfig::default())
    }

    #[test]
    fn test_encode_pads_command() {
        assert_eq!(encode("LOGIN", &["bob"]).unwrap(), "BJ:LOGIN___:bob\n");
        assert_eq!(encode("PONG____", &[]).unwrap(), "BJ:PONG____\n");
    }

    #[test]
    fn test_pad_command() {
        assert_eq!(pad_command("RDY"), "RDY_____");
        assert_eq!(pad_command("REC__GAM"), "REC__GAM");
    }

    #[test]
    fn test_encode_joins_args_with_comma() {
        assert_eq!(encode("BT", &["10", "20"]).unwrap(), "BJ:BT______:10,20\n");
    }

    #[test]
    fn test_encode_rejects_bad_commands() {
        assert_eq!(encode("", &[]), Err(FrameError::EmptyCommand));
        assert!(matches!(
            encode("TOOLONGCMD", &[]),
            Err(FrameError::CommandTooLong(_))
        ));
        assert!(matches!(
            encode("A:B", &[]),
            Err(FrameError::ForbiddenCharacter(_))
        ));
        assert!(matches!(
            encode("JOIN", &["room\n1"]),
            Err(FrameError::ForbiddenCharacter(_))
        ));
    }

    #[test]
    fn test_ensure_delimited_is_idempotent() {
        assert_eq!(ensure_delimited("BJ:HIT_____"), "BJ:HIT_____\n");
        assert_eq!(ensure_delimited("BJ:HIT_____\n"), "BJ:HIT_____\n");
    }

    #[test]
    fn test_decode_splits_on_first_colon_only() {
        let frame = decode("BJ:LBBYINFO:3:6:room;1").unwrap();
        assert_eq!(frame.command, "LBBYINFO");
        assert_eq!(frame.args.as_deref(), Some("3:6:room;1"));
    }

    #[test]
    fn test_decode_without_args_and_with_cr() {
        let frame = decode("BJ:PING____\r").unwrap();
        assert_eq!(frame.command, "PING____");
        assert_eq!(frame.args, None);
    }

    #[test]
    fn test_decode_requires_prefix() {
        assert_eq!(decode("XX:PING____"), Err(FrameError::MissingPrefix));
        assert_eq!(decode(""), Err(FrameError::MissingPrefix));
        assert_eq!(decode("bj:PING____"), Err(FrameError::MissingPrefix));
    }

    #[test]
    fn test_classification() {
        let class = |line: &str| decode(line).unwrap().classify();
        assert_eq!(class("BJ:ACK__NIC:bob;100"), Classification::Ack);
        assert_eq!(class("BJ:ACK_LVRO"), Classification::Ack);
        assert_eq!(class("BJ:NACK_JON:full"), Classification::Nack);
        assert_eq!(class("BJ:NACK__BT"), Classification::Nack);
        assert_eq!(class("BJ:PING____"), Classification::Heartbeat);
        assert_eq!(class("BJ:PONG____"), Classification::Generic);
        assert_eq!(class("BJ:ACKNOWLG"), Classification::Generic);
        assert_eq!(class("BJ:GAMESTAT:x"), Classification::Generic);
    }

    #[test]
    fn test_display_matches_wire_text() {
        let frame = decode("BJ:ACK__NIC:bob;100").unwrap();
        assert_eq!(frame.to_string(), "BJ:ACK__NIC:bob;100");
    }

    #[test]
    fn test_line_buffer_keeps_remainder() {
        let mut buf = buffer();
        let lines = buf.push(b"BJ:PING____\nBJ:ACK").unwrap();
        assert_eq!(lines, vec!["BJ:PING____"]);
        assert_eq!(buf.len(), 6);

        let lines = buf.push(b"__NIC:bob\n").unwrap();
        assert_eq!(lines, vec!["BJ:ACK__NIC:bob"]);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_line_buffer_is_read_boundary_independent() {
        let stream = b"BJ:ROMSTAUP:a;b\nBJ:PING____\n\nBJ:GAMESTAT:1,2,3\nBJ:tail";

        let mut whole = buffer();
        let expected = whole.push(stream).unwrap();

        for chunk_size in 1..stream.len() {
            let mut split = buffer();
            let mut lines = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                lines.extend(split.push(chunk).unwrap());
            }
            assert_eq!(lines, expected, "chunk size {chunk_size}");
            assert_eq!(split.len(), whole.len());
        }
    }

    #[test]
    fn test_line_buffer_emits_empty_lines() {
        let mut buf = buffer();
        assert_eq!(buf.push(b"\n\n").unwrap(), vec!["", ""]);
    }

    #[test]
    fn test_line_buffer_drops_invalid_utf8() {
        let mut buf = buffer();
        let lines = buf.push(b"BJ:PING\xff____\nBJ:GAMESTAT:caf\xc3\xa9\xc3\n").unwrap();
        assert_eq!(lines, vec!["BJ:PING____", "BJ:GAMESTAT:caf\u{e9}"]);
        assert_eq!(decode(&lines[0]).unwrap().classify(), Classification::Heartbeat);
    }

    #[test]
    fn test_line_buffer_limit() {
        let mut buf = LineBuffer::new(&FrameConfig { max_line_len: 8 });
        assert!(buf.push(b"BJ:").is_ok());
        let result = buf.push(b"0123456789");
        assert!(matches!(result, Err(FrameError::LineTooLong { .. })));
        assert!(buf.is_empty());
    }

    #[test]
    fn test_line_buffer_clear() {
        let mut buf = buffer();
        buf.push(b"BJ:partial").unwrap();
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.push(b"\n").unwrap(), vec![""]);
    }
}
