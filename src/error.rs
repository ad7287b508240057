//! Fatal server errors.

use crate::config::ConfigError;
use crate::socket::BootstrapError;
use std::fmt;
use std::io;

/// Errors that stop the server. Anything recoverable is logged inside the
/// event loop instead of surfacing here.
#[derive(Debug)]
pub enum ServerError {
    Config(ConfigError),
    Bootstrap(BootstrapError),
    /// The completion queue could not be created.
    QueueInit(io::Error),
    /// The backend is not available on this platform.
    #[cfg_attr(target_os = "linux", allow(dead_code))]
    Unsupported(&'static str),
    Io(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(e) => write!(f, "{}", e),
            Self::Bootstrap(e) => write!(f, "{}", e),
            Self::QueueInit(e) => write!(f, "Failed to initialize completion queue: {}", e),
            Self::Unsupported(what) => write!(f, "{} is not supported on this platform", what),
            Self::Io(e) => write!(f, "I/O error: {}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Config(e) => Some(e),
            Self::Bootstrap(e) => Some(e),
            Self::QueueInit(e) | Self::Io(e) => Some(e),
            Self::Unsupported(_) => None,
        }
    }
}

impl From<ConfigError> for ServerError {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<BootstrapError> for ServerError {
    fn from(e: BootstrapError) -> Self {
        Self::Bootstrap(e)
    }
}

impl From<io::Error> for ServerError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

pub type Result<T> = std::result::Result<T, ServerError>;
