//! Error types for the buckos init system.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for init system operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the init system.
///
/// Nothing in the boot sequence propagates these past the stage that
/// produced them; they are logged and the sequence carries on.
#[derive(Error, Debug)]
pub enum Error {
    /// Service already exists
    #[error("Service already exists: {0}")]
    ServiceAlreadyExists(String),

    /// Process spawn error
    #[error("Failed to spawn process: {0}")]
    Spawn(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Filesystem table could not be read or parsed
    #[error("fstab error: {path}: {reason}")]
    Fstab { path: PathBuf, reason: String },

    /// Control socket error
    #[error("Control socket error: {0}")]
    Control(String),

    /// Runlevel out of range or not allowed right now
    #[error("Invalid runlevel: {0}")]
    InvalidRunlevel(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("TOML parsing error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Nix error
    #[error("System error: {0}")]
    Nix(#[from] nix::Error),
}
