//! Console command parsing.

use bj_net::{ClientError, GameClient};

/// One line typed at the prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Login(String),
    Join(u32),
    Ready,
    Unready,
    Bet(u32),
    Hit,
    Stand,
    Leave,
    Again,
    /// Ask for the full game state.
    State,
    /// Send a line verbatim, for poking at the server.
    Raw(String),
    Help,
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("unknown command `{0}`, try `help`")]
    Unknown(String),
    #[error("`{0}` needs an argument")]
    MissingArgument(&'static str),
    #[error("`{0}` is not a non-negative number")]
    InvalidNumber(String),
}

pub const HELP: &str = "\
commands:
  login <nick>   join <room>   leave
  ready          unready       bet <amount>
  hit            stand         again
  state          raw <line>    quit";

/// Parse one input line. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>, ParseError> {
    let line = line.trim();
    let (word, rest) = match line.split_once(char::is_whitespace) {
        Some((word, rest)) => (word, rest.trim()),
        None => (line, ""),
    };

    let command = match word.to_ascii_lowercase().as_str() {
        "" => return Ok(None),
        "login" => Command::Login(argument("login", rest)?.to_string()),
        "join" => Command::Join(number(argument("join", rest)?)?),
        "ready" => Command::Ready,
        "unready" => Command::Unready,
        "bet" => Command::Bet(number(argument("bet", rest)?)?),
        "hit" => Command::Hit,
        "stand" => Command::Stand,
        "leave" => Command::Leave,
        "again" => Command::Again,
        "state" => Command::State,
        "raw" => Command::Raw(argument("raw", rest)?.to_string()),
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        other => return Err(ParseError::Unknown(other.to_string())),
    };
    Ok(Some(command))
}

fn argument<'a>(command: &'static str, rest: &'a str) -> Result<&'a str, ParseError> {
    if rest.is_empty() {
        Err(ParseError::MissingArgument(command))
    } else {
        Ok(rest)
    }
}

fn number(text: &str) -> Result<u32, ParseError> {
    text.parse()
        .map_err(|_| ParseError::InvalidNumber(text.to_string()))
}

impl Command {
    /// Issue the matching request. `Help` and `Quit` are handled by the caller.
    pub fn apply(&self, client: &GameClient) -> Result<(), ClientError> {
        match self {
            Self::Login(nickname) => client.login(nickname),
            Self::Join(room) => client.join_room(*room),
            Self::Ready => client.set_ready(true),
            Self::Unready => client.set_ready(false),
            Self::Bet(amount) => client.bet(*amount),
            Self::Hit => client.hit(),
            Self::Stand => client.stand(),
            Self::Leave => client.leave_room(),
            Self::Again => client.play_again(),
            Self::State => client.request_game_state(),
            Self::Raw(line) => client.send_raw(line.as_str()),
            Self::Help | Self::Quit => Ok(()),
        }
    }
}
