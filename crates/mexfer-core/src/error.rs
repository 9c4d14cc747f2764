//! Error types for terminal operations.

use std::fmt;

use thiserror::Error;

use crate::firmware::archive::ArchiveError;
use crate::protocol::{ProtocolError, RouteError};
use crate::transport::TransportError;

/// Result type alias for terminal operations.
pub type Result<T> = std::result::Result<T, Error>;

/// What kind of resource could not be found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    LocalFile,
    RemoteFile,
    RemoteFolder,
    ArchiveMember,
    Helper,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::LocalFile => write!(f, "local file"),
            ResourceKind::RemoteFile => write!(f, "remote file"),
            ResourceKind::RemoteFolder => write!(f, "remote folder"),
            ResourceKind::ArchiveMember => write!(f, "archive member"),
            ResourceKind::Helper => write!(f, "helper"),
        }
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Protocol violation: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("{kind} not found: {path}")]
    NotFound { kind: ResourceKind, path: String },

    #[error("Remote file {path} already exists and overwrite was not requested")]
    AlreadyExists { path: String },

    #[error("Terminal not ready: attribute {attribute} reported {value:02X?}")]
    NotReady { attribute: u16, value: Vec<u8> },

    #[error("Transfer instance {instance} failed: {source}")]
    Transfer {
        instance: u16,
        #[source]
        source: Box<Error>,
    },

    #[error("{function} returned code {code}: {message}")]
    RemoteFunction {
        function: String,
        code: u32,
        message: String,
    },

    #[error("Registry key {key} is not readable")]
    RegistryKeyNotAllowed { key: String },

    #[error("Registry read of {key} returned code {code}")]
    Registry { key: String, code: u32 },

    #[error("Terminal failed validation: {0}")]
    Validation(String),

    #[error("Unsupported terminal generation for {operation}: ME major version {major}")]
    UnsupportedGeneration { operation: &'static str, major: u32 },

    #[error("Update {file} declares {declared} bytes but the package holds {actual}")]
    SizeMismatch {
        file: String,
        declared: u64,
        actual: u64,
    },

    #[error("No catalog entry of the package matches this terminal")]
    CatalogMismatch,

    #[error("Firmware package: {0}")]
    Package(String),

    #[error("Archive error: {0}")]
    Archive(#[from] ArchiveError),

    #[error("Invalid communication path: {0}")]
    Route(#[from] RouteError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn not_found(kind: ResourceKind, path: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            path: path.into(),
        }
    }

    /// The innermost error, looking through transfer instance wrappers.
    pub fn root(&self) -> &Error {
        match self {
            Error::Transfer { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound { .. })
    }

    pub fn is_stale_transfer(&self) -> bool {
        matches!(
            self.root(),
            Error::Protocol(ProtocolError::StaleTransfer { .. })
        )
    }

    pub fn is_disconnect(&self) -> bool {
        matches!(self.root(), Error::Transport(e) if e.is_disconnect())
    }
}
