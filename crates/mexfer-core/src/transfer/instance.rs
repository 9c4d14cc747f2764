//! Lifecycle of a terminal-side transfer instance.
//!
//! ```text
//! Unopened -> Created -> (Ready ->) Streaming -> Closed
//! ```
//!
//! Once the terminal has assigned an instance id, the instance is deleted
//! exactly once: by [`TransferInstance::finish`], by [`TransferInstance::close`],
//! or by the drop guard if neither ran.

use std::fmt;

use tracing::{debug, info, warn};

use crate::context::OpContext;
use crate::error::{Error, Result};
use crate::protocol::*;
use crate::transport::{CipRequest, CipTransport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Local file to terminal.
    Download,
    /// Terminal file to local.
    Upload,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Download => write!(f, "download"),
            Direction::Upload => write!(f, "upload"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Unopened,
    Created,
    /// Marked in use (downloads only).
    Ready,
    Streaming,
    Closed,
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceState::Unopened => write!(f, "Unopened"),
            InstanceState::Created => write!(f, "Created"),
            InstanceState::Ready => write!(f, "Ready"),
            InstanceState::Streaming => write!(f, "Streaming"),
            InstanceState::Closed => write!(f, "Closed"),
        }
    }
}

/// What the terminal agreed to when the instance was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferDescriptor {
    pub instance: u16,
    pub chunk_size: u16,
    pub total_bytes: u32,
    pub direction: Direction,
}

/// Checks the two readiness attributes of the file exchange class.
pub fn check_ready<T: CipTransport + ?Sized>(ctx: &mut OpContext<'_, T>) -> Result<()> {
    for attribute in [ATTR_READY_1, ATTR_READY_2] {
        let value = ctx.send(
            &CipRequest::new(SVC_GET_ATTRIBUTE_SINGLE, CLASS_FILE_EXCHANGE, 0).attribute(attribute),
        )?;
        if !READY_PATTERNS.iter().any(|p| value.as_slice() == p) {
            ctx.report.error(format!(
                "Terminal not ready: attribute {} = {:02X?}",
                attribute, value
            ));
            return Err(Error::NotReady { attribute, value });
        }
    }
    debug!("Terminal ready for transfer");
    Ok(())
}

/// A transfer instance bound to the operation context that created it.
pub struct TransferInstance<'c, 'a, T: CipTransport + ?Sized> {
    ctx: &'c mut OpContext<'a, T>,
    state: InstanceState,
    descriptor: Option<TransferDescriptor>,
}

impl<'c, 'a, T: CipTransport + ?Sized> TransferInstance<'c, 'a, T> {
    pub fn new(ctx: &'c mut OpContext<'a, T>) -> Self {
        Self {
            ctx,
            state: InstanceState::Unopened,
            descriptor: None,
        }
    }

    pub fn state(&self) -> InstanceState {
        self.state
    }

    pub fn descriptor(&self) -> Option<TransferDescriptor> {
        self.descriptor
    }

    pub fn ctx(&mut self) -> &mut OpContext<'a, T> {
        self.ctx
    }

    fn goto_state(&mut self, next: InstanceState) {
        debug!(from = %self.state, to = %next, "Transfer instance state");
        self.state = next;
    }

    pub fn create_download(
        &mut self,
        path: &str,
        file_size: u32,
        overwrite: bool,
        chunk_size: u16,
    ) -> Result<TransferDescriptor> {
        let payload = CreateDownloadRequest {
            overwrite,
            chunk_size,
            file_size,
            path: path.to_string(),
        }
        .to_bytes();
        let reply = self
            .ctx
            .send(&CipRequest::new(SVC_CREATE, CLASS_FILE_EXCHANGE, 0).data(&payload))?;
        let response = CreateTransferResponse::from_download_bytes(&reply)?;
        self.accept(response, chunk_size, file_size, Direction::Download)
    }

    pub fn create_upload(&mut self, path: &str, chunk_size: u16) -> Result<TransferDescriptor> {
        let payload = CreateUploadRequest {
            chunk_size,
            path: path.to_string(),
        }
        .to_bytes();
        let reply = self
            .ctx
            .send(&CipRequest::new(SVC_CREATE, CLASS_FILE_EXCHANGE, 0).data(&payload))?;
        let response = CreateTransferResponse::from_upload_bytes(&reply)?;
        let total = response.file_size.unwrap_or(0);
        self.accept(response, chunk_size, total, Direction::Upload)
    }

    fn accept(
        &mut self,
        response: CreateTransferResponse,
        chunk_size: u16,
        total_bytes: u32,
        direction: Direction,
    ) -> Result<TransferDescriptor> {
        if let Err(e) = response.check(chunk_size) {
            // A stale message instance means the terminal still owns an
            // older exchange; the returned id is not ours to delete.
            if !matches!(e, ProtocolError::StaleTransfer { .. }) {
                self.descriptor = Some(TransferDescriptor {
                    instance: response.transfer_instance,
                    chunk_size,
                    total_bytes,
                    direction,
                });
                self.goto_state(InstanceState::Created);
            }
            self.ctx.report.error(format!("Create {} rejected: {}", direction, e));
            return Err(e.into());
        }
        let descriptor = TransferDescriptor {
            instance: response.transfer_instance,
            chunk_size,
            total_bytes,
            direction,
        };
        self.descriptor = Some(descriptor);
        self.goto_state(InstanceState::Created);
        self.ctx.report.info(format!(
            "Created {} instance {} ({} bytes, chunk {})",
            direction, descriptor.instance, total_bytes, chunk_size
        ));
        Ok(descriptor)
    }

    /// Sets the instance's ready attribute to mark it in use.
    pub fn mark_in_use(&mut self) -> Result<()> {
        let instance = self.require_instance()?;
        self.ctx.send(
            &CipRequest::new(SVC_SET_ATTRIBUTE_SINGLE, CLASS_FILE_EXCHANGE, instance)
                .attribute(ATTR_READY_1)
                .data(&READY_MARK_IN_USE),
        )?;
        self.goto_state(InstanceState::Ready);
        Ok(())
    }

    /// Descriptor of the created instance, moving it to `Streaming`.
    pub fn begin_streaming(&mut self) -> Result<TransferDescriptor> {
        let descriptor = self.descriptor.ok_or_else(not_created)?;
        self.goto_state(InstanceState::Streaming);
        Ok(descriptor)
    }

    fn require_instance(&self) -> Result<u16> {
        self.descriptor
            .map(|d| d.instance)
            .ok_or_else(not_created)
    }

    /// Deletes the instance. Failures are logged, never returned.
    pub fn close(mut self) {
        self.delete();
    }

    /// Closes the instance and attaches its id to a failed result.
    pub fn finish<R>(mut self, result: Result<R>) -> Result<R> {
        let instance = self.descriptor.map(|d| d.instance);
        self.delete();
        match (result, instance) {
            (Err(e), Some(instance)) => Err(Error::Transfer {
                instance,
                source: Box::new(e),
            }),
            (result, _) => result,
        }
    }

    fn delete(&mut self) {
        if self.state == InstanceState::Closed {
            return;
        }
        let Some(descriptor) = self.descriptor else {
            self.goto_state(InstanceState::Closed);
            return;
        };
        let request = CipRequest::new(SVC_DELETE, CLASS_FILE_EXCHANGE, descriptor.instance);
        match self.ctx.send(&request) {
            Ok(_) => {
                info!(instance = descriptor.instance, "Deleted transfer instance");
                self.ctx
                    .report
                    .info(format!("Deleted transfer instance {}", descriptor.instance));
            }
            Err(e) => {
                warn!(instance = descriptor.instance, error = %e, "Delete transfer instance failed");
                self.ctx.report.warn(format!(
                    "Could not delete transfer instance {}: {}",
                    descriptor.instance, e
                ));
            }
        }
        self.goto_state(InstanceState::Closed);
    }
}

impl<T: CipTransport + ?Sized> Drop for TransferInstance<'_, '_, T> {
    fn drop(&mut self) {
        self.delete();
    }
}

fn not_created() -> Error {
    Error::Protocol(ProtocolError::FieldMismatch {
        field: "transfer instance",
        expected: 1,
        actual: 0,
    })
}
