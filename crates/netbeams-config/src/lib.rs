//! Configuration system for the NetBeams server.
//!
//! Settings persist to disk as a RON file, can be overridden from the command
//! line via clap, and are validated before the server starts. The server never
//! writes configuration at runtime; components receive a snapshot.

mod cli;
mod config;
mod error;
mod validate;

pub use cli::CliArgs;
pub use config::{
    AuthConfig, CONFIG_FILE_NAME, Config, GeneralConfig, LoggingConfig, ProtocolConfig,
    QuotaConfig,
};
pub use error::ConfigError;
pub use validate::{ConfigIssue, Severity};
