use std::{fmt::Display, io};

use derive_more::derive::Display;
use thiserror::Error;

use crate::rule::EndpointKey;

/// Whether an error may be contained where it happened or must stop the process.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Recoverable,
    Fatal,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid rule {rule}: {field} {reason}")]
    InvalidRule { rule: String, field: &'static str, reason: String },
    #[error("duplicate endpoint {key}")]
    DuplicateEndpoint { key: EndpointKey },
    #[error("invalid relay connection: {0}")]
    InvalidConnection(String),
}

impl ConfigError {
    pub(crate) fn invalid(rule: impl Display, field: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidRule {
            rule: rule.to_string(),
            field,
            reason: reason.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BindError {
    #[error("address already in use: {0}")]
    AddrInUse(String),
    #[error("permission denied binding {0}")]
    PermissionDenied(String),
    #[error("address not available on this host: {0}")]
    AddrNotAvailable(String),
    #[error("no bindable address for {0}")]
    NoBindableAddress(String),
    #[error("resolve {host} failed: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("{0} is not supported on this platform")]
    Unsupported(String),
    #[error("bind {addr} failed: {source}")]
    Io {
        addr: String,
        #[source]
        source: io::Error,
    },
}

impl BindError {
    pub fn from_io(addr: impl Display, err: io::Error) -> Self {
        let addr = addr.to_string();
        match err.kind() {
            io::ErrorKind::AddrInUse => Self::AddrInUse(addr),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(addr),
            io::ErrorKind::AddrNotAvailable => Self::AddrNotAvailable(addr),
            _ => Self::Io { addr, source: err },
        }
    }

    pub fn severity(&self) -> Severity {
        match self {
            BindError::Resolve { source, .. } | BindError::Io { source, .. } => classify_io_error(source),
            _ => Severity::Recoverable,
        }
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("relay rejected credentials: {0}")]
    Security(String),
    #[error("relay endpoint unreachable: {0}")]
    Unreachable(String),
    #[error("relay operation timed out")]
    Timeout,
    #[error("relay transport failed: {0}")]
    Fatal(String),
}

impl TransportError {
    pub fn severity(&self) -> Severity {
        match self {
            TransportError::Fatal(_) => Severity::Fatal,
            _ => Severity::Recoverable,
        }
    }
}

#[derive(Debug, Display, Clone, Copy, PartialEq, Eq)]
pub enum PumpSide {
    #[display("source")]
    Source,
    #[display("destination")]
    Destination,
}

#[derive(Debug, Error)]
#[error("{side} side failed: {source}")]
pub struct PumpError {
    pub side: PumpSide,
    #[source]
    pub source: io::Error,
}

impl PumpError {
    pub fn severity(&self) -> Severity {
        classify_io_error(&self.source)
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Bind(#[from] BindError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Pump(#[from] PumpError),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl EngineError {
    pub fn severity(&self) -> Severity {
        match self {
            EngineError::Config(_) => Severity::Recoverable,
            EngineError::Bind(e) => e.severity(),
            EngineError::Transport(e) => e.severity(),
            EngineError::Pump(e) => e.severity(),
            EngineError::Fatal(_) => Severity::Fatal,
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.severity() == Severity::Fatal
    }
}

/// Out of memory and file descriptor exhaustion leave the process in a state no
/// single bridge can recover from, everything else stays local to the failing operation.
pub fn classify_io_error(err: &io::Error) -> Severity {
    if err.kind() == io::ErrorKind::OutOfMemory {
        return Severity::Fatal;
    }
    #[cfg(unix)]
    {
        // ENFILE, EMFILE
        if matches!(err.raw_os_error(), Some(23) | Some(24)) {
            return Severity::Fatal;
        }
    }
    Severity::Recoverable
}
