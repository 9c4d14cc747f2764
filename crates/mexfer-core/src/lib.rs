//! mexfer-core: file transfer and firmware upgrade client for ME terminals.
//!
//! Talks to the vendor file exchange, remote helper and NVS update objects
//! of an HMI terminal over CIP, either directly or routed through a
//! backplane.
//!
//! # Architecture
//!
//! The crate is organized into layers:
//!
//! - **Protocol**: Service constants, payload codecs, communication paths
//! - **Transport**: CIP generic message abstraction (EtherNet/IP, mock)
//! - **Transfer**: Transfer instance lifecycle and chunked streams
//! - **Remote**: Helper DLL functions and registry reads
//! - **Device**: Identity, generation paths, allow-list validation
//! - **Firmware**: Legacy, card image and DMK upgrades
//! - **Events**: Observer pattern and the per-operation device log
//! - **Session**: High-level facade running whole operations
//!
//! # Example
//!
//! ```no_run
//! use mexfer_core::{SessionConfig, TerminalSession};
//!
//! let path = "192.168.1.20".parse().expect("valid path");
//! let mut session = TerminalSession::connect(SessionConfig::default(), path);
//! let info = session.info().expect("terminal reachable");
//! println!("{}", info);
//! for line in session.log().entries() {
//!     println!("{}", line);
//! }
//! ```

pub mod config;
pub mod context;
pub mod device;
pub mod device_log;
pub mod error;
pub mod events;
pub mod firmware;
pub mod protocol;
pub mod remote;
pub mod session;
pub mod transfer;
pub mod transport;

// Re-exports for convenience
pub use config::SessionConfig;
pub use context::OpContext;
pub use device::{DeviceIdentity, DeviceInfo, DevicePaths, Generation, TerminalCatalog};
pub use device_log::DeviceLog;
pub use error::{Error, ResourceKind, Result};
pub use events::{FnObserver, HmiEvent, LogLevel, NullObserver, Observer, Phase, TracingObserver};
pub use firmware::{FirmwareSource, FlashOptions};
pub use protocol::CommPath;
pub use remote::RebootOutcome;
pub use session::TerminalSession;
pub use transfer::FileRecord;
pub use transport::{Backend, CipTransport, EnipTransport, MockTransport, TransportError};
