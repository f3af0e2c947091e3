use std::error::Error;
use std::fmt::{self, Display, Formatter};

/// Startup failures that are allowed to reach `main`: a broken config file,
/// an address that cannot be bound, or a poll registry error. Per-connection
/// failures never take this path, they become client state transitions.
#[derive(Debug)]
pub enum FatalError {
    Io(std::io::Error),
    Config(String),
    Usage,
}

impl Display for FatalError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            FatalError::Io(e) => write!(f, "{}", e),
            FatalError::Config(msg) => write!(f, "configuration: {}", msg),
            FatalError::Usage => write!(f, "Usage: webserv [configuration file] [output log file]"),
        }
    }
}

impl Error for FatalError {}

impl From<std::io::Error> for FatalError {
    fn from(e: std::io::Error) -> Self {
        FatalError::Io(e)
    }
}

impl From<serde_json::Error> for FatalError {
    fn from(e: serde_json::Error) -> Self {
        FatalError::Config(e.to_string())
    }
}

impl From<String> for FatalError {
    fn from(s: String) -> Self {
        FatalError::Config(s)
    }
}

impl From<&str> for FatalError {
    fn from(s: &str) -> Self {
        FatalError::Config(s.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FatalError>;
