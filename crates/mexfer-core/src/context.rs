//! Context passed to every terminal operation.

use tracing::trace;

use crate::device_log::{DeviceLog, Reporter};
use crate::events::Observer;
use crate::transport::{self, CipRequest, CipTransport, TransportError};

/// Transport plus reporting for one logical operation.
pub struct OpContext<'a, T: CipTransport + ?Sized> {
    pub transport: &'a mut T,
    pub report: Reporter<'a>,
}

impl<'a, T: CipTransport + ?Sized> OpContext<'a, T> {
    pub fn new(transport: &'a mut T, observer: &'a dyn Observer, log: &'a mut DeviceLog) -> Self {
        Self {
            transport,
            report: Reporter::new(observer, log),
        }
    }

    /// Sends one generic message and returns the reply data.
    pub fn send(&mut self, request: &CipRequest<'_>) -> Result<Vec<u8>, TransportError> {
        trace!(
            service = %format!("0x{:02X}", request.service),
            class = %format!("0x{:04X}", request.class),
            instance = request.instance,
            len = request.data.len(),
            "CIP request"
        );
        let reply = transport::send(&mut *self.transport, request)?;
        trace!(len = reply.len(), "CIP reply");
        Ok(reply)
    }
}
