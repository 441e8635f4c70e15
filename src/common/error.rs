//! Error types for the binding

use std::fmt;
use std::io;
use thiserror::Error;

/// Lifecycle phase a start failure belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    ConfigLoad,
    CoreInit,
    Startup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::ConfigLoad => write!(f, "config-load"),
            Phase::CoreInit => write!(f, "core-init"),
            Phase::Startup => write!(f, "startup"),
        }
    }
}

/// Binding error type
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("config-load failed: {0}")]
    ConfigLoad(String),

    #[error("core-init failed: {0}")]
    CoreInit(String),

    #[error("startup failed: {0}")]
    Startup(String),

    #[error("point already exist: {0}")]
    AlreadyExists(i32),

    #[error("core instance not running")]
    NotRunning,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Socket protection failed: {0}")]
    Protect(String),

    #[error("Timeout error: {0}")]
    Timeout(String),

    #[error("status != 20x: {0}")]
    Status(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Invalid address: {0}")]
    Address(String),

    #[error("Runtime error: {0}")]
    Runtime(String),
}

impl Error {
    pub fn config_load<S: Into<String>>(msg: S) -> Self {
        Error::ConfigLoad(msg.into())
    }

    pub fn config<S: Into<String>>(msg: S) -> Self {
        Error::Config(msg.into())
    }

    pub fn parse<S: Into<String>>(msg: S) -> Self {
        Error::Parse(msg.into())
    }

    pub fn connection<S: Into<String>>(msg: S) -> Self {
        Error::Connection(msg.into())
    }

    pub fn protect<S: Into<String>>(msg: S) -> Self {
        Error::Protect(msg.into())
    }

    pub fn timeout<S: Into<String>>(msg: S) -> Self {
        Error::Timeout(msg.into())
    }

    pub fn status<S: Into<String>>(msg: S) -> Self {
        Error::Status(msg.into())
    }

    pub fn tls<S: Into<String>>(msg: S) -> Self {
        Error::Tls(msg.into())
    }

    pub fn address<S: Into<String>>(msg: S) -> Self {
        Error::Address(msg.into())
    }

    pub fn runtime<S: Into<String>>(msg: S) -> Self {
        Error::Runtime(msg.into())
    }

    /// Lifecycle phase of a start failure, if this is one
    pub fn phase(&self) -> Option<Phase> {
        match self {
            Error::ConfigLoad(_) => Some(Phase::ConfigLoad),
            Error::CoreInit(_) => Some(Phase::CoreInit),
            Error::Startup(_) => Some(Phase::Startup),
            _ => None,
        }
    }

    /// Re-tag an error with the lifecycle phase it surfaced in
    pub fn in_phase(self, phase: Phase) -> Self {
        if self.phase().is_some() {
            return self;
        }
        let msg = self.to_string();
        match phase {
            Phase::ConfigLoad => Error::ConfigLoad(msg),
            Phase::CoreInit => Error::CoreInit(msg),
            Phase::Startup => Error::Startup(msg),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Parse(e.to_string())
    }
}

/// Result type alias using our Error
pub type Result<T> = std::result::Result<T, Error>;
