//! Chunked streaming over a created transfer instance.

use tracing::{debug, trace};

use crate::context::OpContext;
use crate::error::{Error, Result};
use crate::protocol::*;
use crate::transport::{CipRequest, CipTransport};

use super::instance::TransferDescriptor;

/// Writes `data` in chunks, then the end-of-file sentinel.
///
/// Chunk numbers start at 1 and every reply must acknowledge exactly the
/// chunk sent. The sentinel goes out even for empty files.
pub fn write_stream<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    descriptor: &TransferDescriptor,
    data: &[u8],
    description: &str,
) -> Result<()> {
    let total = data.len() as u64;
    let mut sent = 0u64;
    for (index, chunk) in data.chunks(descriptor.chunk_size as usize).enumerate() {
        let chunk_number = index as u32 + 1;
        let payload = WriteChunkRequest::new(chunk_number, chunk).to_bytes();
        let reply = ctx.send(
            &CipRequest::new(SVC_WRITE_CHUNK, CLASS_FILE_EXCHANGE, descriptor.instance)
                .data(&payload),
        )?;
        WriteChunkResponse::from_bytes(&reply)?
            .check(chunk_number)
            .inspect_err(|e| {
                ctx.report
                    .error(format!("Chunk {} rejected: {}", chunk_number, e))
            })?;
        sent += chunk.len() as u64;
        trace!(chunk_number, sent, "Chunk written");
        ctx.report.progress(description, total, sent);
    }

    let eof = WriteChunkRequest::end_of_file().to_bytes();
    ctx.send(&CipRequest::new(SVC_WRITE_CHUNK, CLASS_FILE_EXCHANGE, descriptor.instance).data(&eof))?;
    debug!(instance = descriptor.instance, bytes = sent, "Download stream complete");
    if total == 0 {
        ctx.report.progress(description, 0, 0);
    }
    Ok(())
}

/// Upper bound of the buffer reserved up front for an upload.
pub const MAX_INITIAL_CAPACITY: usize = 1 << 20;

/// Reads chunks until the terminal answers with the end-of-file marker.
pub fn read_stream<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    descriptor: &TransferDescriptor,
    description: &str,
) -> Result<Vec<u8>> {
    let total = descriptor.total_bytes as u64;
    // The size comes from the terminal; only trust it up to a point.
    let mut data = Vec::with_capacity((descriptor.total_bytes as usize).min(MAX_INITIAL_CAPACITY));
    let mut chunk_number = 1u32;
    loop {
        let payload = ReadChunkRequest { chunk_number }.to_bytes();
        let reply = ctx.send(
            &CipRequest::new(SVC_READ_CHUNK, CLASS_FILE_EXCHANGE, descriptor.instance)
                .data(&payload),
        )?;
        let response = ReadChunkResponse::from_bytes(&reply)?;
        if response.is_end_of_file() {
            break;
        }
        if response.chunk_number != chunk_number {
            let e = ProtocolError::FieldMismatch {
                field: "read chunk echo",
                expected: chunk_number as u64,
                actual: response.chunk_number as u64,
            };
            ctx.report.error(format!("Chunk {} rejected: {}", chunk_number, e));
            return Err(Error::Protocol(e));
        }
        data.extend_from_slice(&response.data);
        trace!(chunk_number, received = data.len(), "Chunk read");
        ctx.report.progress(description, total, data.len() as u64);
        chunk_number += 1;
    }
    debug!(instance = descriptor.instance, bytes = data.len(), "Upload stream complete");
    if data.is_empty() {
        ctx.report.progress(description, total, 0);
    }
    Ok(data)
}
