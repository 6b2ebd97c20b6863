//! Configuration for the blackjack client.
//!
//! Settings persist to disk as `config.ron` and can be overridden from the
//! command line. Every section converts into the runtime config structs of
//! `bj-net`.

mod cli;
mod config;
mod error;

pub use cli::CliArgs;
pub use config::{Config, DebugConfig, NetworkConfig, SessionConfig, default_config_dir};
pub use error::ConfigError;
