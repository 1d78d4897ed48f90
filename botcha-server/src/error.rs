//! Startup and configuration errors.

use botcha::BotchaError;
use thiserror::Error;

/// Errors that stop the server from starting.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The configuration is present but unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The configuration file is not valid TOML for [`ServerConfig`](crate::config::ServerConfig).
    #[error("failed to parse configuration: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// Reading the configuration file or binding the listener failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A core service rejected its settings.
    #[error(transparent)]
    Botcha(#[from] BotchaError),
}

/// Result alias for server setup.
pub type Result<T> = std::result::Result<T, ServerError>;
