//! CIP transport abstraction.
//!
//! Defines the `CipTransport` trait carrying one generic message at a time,
//! allowing different implementations (EtherNet/IP, mock, etc.).

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::CommPath;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to connect to {path}: {message}")]
    ConnectFailed { path: String, message: String },

    #[error("Transport is not open")]
    NotOpen,

    #[error("Connection lost: {0}")]
    Disconnected(String),

    #[error("Timeout after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("CIP status 0x{general:02X} (extended {extended:04X?}) for service 0x{service:02X}")]
    CipStatus {
        service: u8,
        general: u8,
        extended: Vec<u16>,
    },

    #[error("Encapsulation error: {0}")]
    Encapsulation(String),

    #[error("{0:?} messaging is not supported by this backend")]
    Unsupported(MessageMode),

    #[error("Invalid route: {0}")]
    Route(#[from] crate::protocol::RouteError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// True for errors meaning the terminal dropped the connection.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, TransportError::Disconnected(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageMode {
    /// Class 3 connected explicit message (the default for file exchange).
    Connected,
    /// Unconnected message, routed through Unconnected Send when needed.
    Unconnected,
}

/// Transport backend selected by configuration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// EtherNet/IP over TCP.
    #[default]
    Enip,
    /// In-memory simulated terminal.
    Mock,
}

/// One CIP generic message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CipRequest<'a> {
    pub service: u8,
    pub class: u16,
    pub instance: u16,
    pub attribute: Option<u16>,
    pub data: &'a [u8],
    pub mode: MessageMode,
}

impl<'a> CipRequest<'a> {
    pub fn new(service: u8, class: u16, instance: u16) -> Self {
        Self {
            service,
            class,
            instance,
            attribute: None,
            data: &[],
            mode: MessageMode::Connected,
        }
    }

    pub fn attribute(mut self, attribute: u16) -> Self {
        self.attribute = Some(attribute);
        self
    }

    pub fn data(mut self, data: &'a [u8]) -> Self {
        self.data = data;
        self
    }

    pub fn unconnected(mut self) -> Self {
        self.mode = MessageMode::Unconnected;
        self
    }
}

/// Abstract CIP transport interface.
///
/// This trait enables:
/// - Production implementation over EtherNet/IP
/// - Mock implementation for unit testing
/// - Future alternative backends
pub trait CipTransport: Send {
    /// Opens the session (and connection, if the backend uses one).
    /// Reopening resets the connected message sequence.
    fn open(&mut self) -> Result<(), TransportError>;

    /// Closes the session. Closing a closed transport is a no-op.
    fn close(&mut self) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    /// Sends one request and returns the reply data after the CIP status.
    fn generic_message(&mut self, request: &CipRequest<'_>) -> Result<Vec<u8>, TransportError>;

    fn timeout(&self) -> Duration;

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError>;

    /// Path this transport talks to.
    fn path(&self) -> &CommPath;

    /// Whether the backend can carry messages in the given mode.
    fn supports(&self, mode: MessageMode) -> bool {
        let _ = mode;
        true
    }
}

impl<T: CipTransport + ?Sized> CipTransport for Box<T> {
    fn open(&mut self) -> Result<(), TransportError> {
        (**self).open()
    }

    fn close(&mut self) -> Result<(), TransportError> {
        (**self).close()
    }

    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    fn generic_message(&mut self, request: &CipRequest<'_>) -> Result<Vec<u8>, TransportError> {
        (**self).generic_message(request)
    }

    fn timeout(&self) -> Duration {
        (**self).timeout()
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        (**self).set_timeout(timeout)
    }

    fn path(&self) -> &CommPath {
        (**self).path()
    }

    fn supports(&self, mode: MessageMode) -> bool {
        (**self).supports(mode)
    }
}

/// Sends a request after checking the backend can carry its mode.
pub fn send<T: CipTransport + ?Sized>(
    transport: &mut T,
    request: &CipRequest<'_>,
) -> Result<Vec<u8>, TransportError> {
    if !transport.supports(request.mode) {
        return Err(TransportError::Unsupported(request.mode));
    }
    transport.generic_message(request)
}
