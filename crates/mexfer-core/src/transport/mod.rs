//! Transport layer module.

pub mod enip;
pub mod mock;
pub mod traits;

pub use enip::EnipTransport;
pub use mock::{FlashedImage, LoggedRequest, MockFault, MockTransport};
pub use traits::{Backend, CipRequest, CipTransport, MessageMode, TransportError, send};

use crate::config::SessionConfig;
use crate::protocol::CommPath;

/// Creates the configured backend for one communication path.
///
/// The transport is returned closed.
pub fn connect(config: &SessionConfig, path: CommPath) -> Box<dyn CipTransport> {
    match config.backend {
        Backend::Enip => Box::new(EnipTransport::new(path, config.port, config.timeout())),
        Backend::Mock => Box::new(MockTransport::new().with_path(path)),
    }
}
