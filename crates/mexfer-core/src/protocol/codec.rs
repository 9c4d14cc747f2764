//! Request and response payloads of the file exchange, helper and firmware
//! update services.
//!
//! Every struct mirrors one wire layout field by field. Fields the terminal
//! fills with values of unknown purpose are kept as `unknown*` members so the
//! framing stays exact; checks against their observed values live in the
//! `check` methods, not in the parsers.

use byteorder::{BigEndian, LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Cursor, Read};
use thiserror::Error;

use super::constants::*;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("{what}: buffer too small, expected {expected} bytes, got {actual}")]
    Truncated {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{field}: expected {expected:#x}, got {actual:#x}")]
    FieldMismatch {
        field: &'static str,
        expected: u64,
        actual: u64,
    },
    #[error(
        "terminal reports message instance {msg_instance} from an unfinished transfer; reboot the terminal"
    )]
    StaleTransfer { msg_instance: u16 },
    #[error("chunk size {actual} does not match the requested {requested}; unsupported terminal version")]
    ChunkSizeMismatch { requested: u16, actual: u16 },
    #[error("{what}: missing NUL terminator")]
    Unterminated { what: &'static str },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    fn mismatch(field: &'static str, expected: impl Into<u64>, actual: impl Into<u64>) -> Self {
        Self::FieldMismatch {
            field,
            expected: expected.into(),
            actual: actual.into(),
        }
    }
}

fn ensure_len(what: &'static str, data: &[u8], expected: usize) -> Result<(), ProtocolError> {
    if data.len() < expected {
        return Err(ProtocolError::Truncated {
            what,
            expected,
            actual: data.len(),
        });
    }
    Ok(())
}

fn put_cstr(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(s.as_bytes());
    buf.push(0);
}

/// Reads a NUL-terminated string starting at the cursor position.
fn read_cstr(cursor: &mut Cursor<&[u8]>, what: &'static str) -> Result<String, ProtocolError> {
    let data = *cursor.get_ref();
    let start = cursor.position() as usize;
    let rest = &data[start.min(data.len())..];
    let end = rest
        .iter()
        .position(|&b| b == 0)
        .ok_or(ProtocolError::Unterminated { what })?;
    cursor.set_position((start + end + 1) as u64);
    Ok(String::from_utf8_lossy(&rest[..end]).into_owned())
}

/// Trailing text of a reply. The terminal may or may not NUL-terminate it.
fn trailing_text(cursor: &mut Cursor<&[u8]>) -> Result<String, ProtocolError> {
    let mut rest = Vec::new();
    cursor.read_to_end(&mut rest)?;
    if let Some(end) = rest.iter().position(|&b| b == 0) {
        rest.truncate(end);
    }
    Ok(String::from_utf8_lossy(&rest).into_owned())
}

/// Create transfer request for a download (local → terminal).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateDownloadRequest {
    pub overwrite: bool,
    pub chunk_size: u16,
    pub file_size: u32,
    pub path: String,
}

impl CreateDownloadRequest {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.path.len() + 1);
        buf.push(TRANSFER_TYPE_DOWNLOAD);
        buf.push(u8::from(self.overwrite));
        buf.write_u16::<LittleEndian>(self.chunk_size).unwrap();
        buf.write_u32::<LittleEndian>(self.file_size).unwrap();
        put_cstr(&mut buf, &self.path);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len("create download request", data, 9)?;
        let mut cursor = Cursor::new(data);
        let transfer_type = cursor.read_u8()?;
        if transfer_type != TRANSFER_TYPE_DOWNLOAD {
            return Err(ProtocolError::mismatch(
                "transfer type",
                TRANSFER_TYPE_DOWNLOAD,
                transfer_type,
            ));
        }
        Ok(Self {
            overwrite: cursor.read_u8()? != 0,
            chunk_size: cursor.read_u16::<LittleEndian>()?,
            file_size: cursor.read_u32::<LittleEndian>()?,
            path: read_cstr(&mut cursor, "create download path")?,
        })
    }
}

/// Create transfer request for an upload (terminal → local).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateUploadRequest {
    pub chunk_size: u16,
    pub path: String,
}

impl CreateUploadRequest {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.path.len() + 1);
        buf.push(TRANSFER_TYPE_UPLOAD);
        buf.push(0);
        buf.write_u16::<LittleEndian>(self.chunk_size).unwrap();
        put_cstr(&mut buf, &self.path);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len("create upload request", data, 5)?;
        let mut cursor = Cursor::new(data);
        let transfer_type = cursor.read_u8()?;
        if transfer_type != TRANSFER_TYPE_UPLOAD {
            return Err(ProtocolError::mismatch(
                "transfer type",
                TRANSFER_TYPE_UPLOAD,
                transfer_type,
            ));
        }
        let _reserved = cursor.read_u8()?;
        Ok(Self {
            chunk_size: cursor.read_u16::<LittleEndian>()?,
            path: read_cstr(&mut cursor, "create upload path")?,
        })
    }
}

/// Reply to either create request. Upload replies carry the file size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreateTransferResponse {
    pub msg_instance: u16,
    pub unknown: u16,
    pub transfer_instance: u16,
    pub chunk_size: u16,
    pub file_size: Option<u32>,
}

impl CreateTransferResponse {
    pub const SIZE: usize = 8;
    pub const UPLOAD_SIZE: usize = 12;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::UPLOAD_SIZE);
        buf.write_u16::<LittleEndian>(self.msg_instance).unwrap();
        buf.write_u16::<LittleEndian>(self.unknown).unwrap();
        buf.write_u16::<LittleEndian>(self.transfer_instance).unwrap();
        buf.write_u16::<LittleEndian>(self.chunk_size).unwrap();
        if let Some(size) = self.file_size {
            buf.write_u32::<LittleEndian>(size).unwrap();
        }
        buf
    }

    pub fn from_download_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Self::parse(data, false)
    }

    pub fn from_upload_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        Self::parse(data, true)
    }

    fn parse(data: &[u8], upload: bool) -> Result<Self, ProtocolError> {
        let expected = if upload { Self::UPLOAD_SIZE } else { Self::SIZE };
        ensure_len("create transfer response", data, expected)?;
        let mut cursor = Cursor::new(data);
        Ok(Self {
            msg_instance: cursor.read_u16::<LittleEndian>()?,
            unknown: cursor.read_u16::<LittleEndian>()?,
            transfer_instance: cursor.read_u16::<LittleEndian>()?,
            chunk_size: cursor.read_u16::<LittleEndian>()?,
            file_size: if upload {
                Some(cursor.read_u32::<LittleEndian>()?)
            } else {
                None
            },
        })
    }

    /// Checks the fixed fields and the chunk size echo.
    pub fn check(&self, requested_chunk_size: u16) -> Result<(), ProtocolError> {
        if self.msg_instance != 0 {
            return Err(ProtocolError::StaleTransfer {
                msg_instance: self.msg_instance,
            });
        }
        if self.unknown != 0 {
            return Err(ProtocolError::mismatch("create unknown", 0u16, self.unknown));
        }
        if self.chunk_size != requested_chunk_size {
            return Err(ProtocolError::ChunkSizeMismatch {
                requested: requested_chunk_size,
                actual: self.chunk_size,
            });
        }
        Ok(())
    }
}

/// One data chunk of a download, or the end-of-file sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteChunkRequest<'a> {
    pub chunk_number: u32,
    pub data: &'a [u8],
}

impl<'a> WriteChunkRequest<'a> {
    pub const HEADER_SIZE: usize = 6;

    pub fn new(chunk_number: u32, data: &'a [u8]) -> Self {
        Self { chunk_number, data }
    }

    /// The 8-byte sentinel sent after the last data chunk.
    pub fn end_of_file() -> WriteChunkRequest<'static> {
        WriteChunkRequest {
            chunk_number: EOF_CHUNK_NUMBER,
            data: &EOF_PAYLOAD,
        }
    }

    pub fn is_end_of_file(&self) -> bool {
        self.chunk_number == EOF_CHUNK_NUMBER && self.data == EOF_PAYLOAD
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::HEADER_SIZE + self.data.len());
        buf.write_u32::<LittleEndian>(self.chunk_number).unwrap();
        buf.write_u16::<LittleEndian>(self.data.len() as u16).unwrap();
        buf.extend_from_slice(self.data);
        buf
    }

    pub fn from_bytes(data: &'a [u8]) -> Result<Self, ProtocolError> {
        ensure_len("write chunk request", data, Self::HEADER_SIZE)?;
        let mut cursor = Cursor::new(data);
        let chunk_number = cursor.read_u32::<LittleEndian>()?;
        let len = cursor.read_u16::<LittleEndian>()? as usize;
        ensure_len("write chunk data", data, Self::HEADER_SIZE + len)?;
        Ok(Self {
            chunk_number,
            data: &data[Self::HEADER_SIZE..Self::HEADER_SIZE + len],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteChunkResponse {
    pub unknown: u32,
    pub chunk_number: u32,
    pub next_chunk_number: u32,
}

impl WriteChunkResponse {
    pub const SIZE: usize = 12;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_u32::<LittleEndian>(self.unknown).unwrap();
        buf.write_u32::<LittleEndian>(self.chunk_number).unwrap();
        buf.write_u32::<LittleEndian>(self.next_chunk_number).unwrap();
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len("write chunk response", data, Self::SIZE)?;
        let mut cursor = Cursor::new(data);
        Ok(Self {
            unknown: cursor.read_u32::<LittleEndian>()?,
            chunk_number: cursor.read_u32::<LittleEndian>()?,
            next_chunk_number: cursor.read_u32::<LittleEndian>()?,
        })
    }

    /// The terminal must acknowledge exactly the chunk that was sent.
    pub fn check(&self, chunk_number: u32) -> Result<(), ProtocolError> {
        if self.unknown != 0 {
            return Err(ProtocolError::mismatch("write chunk unknown", 0u32, self.unknown));
        }
        if self.chunk_number != chunk_number {
            return Err(ProtocolError::mismatch(
                "write chunk echo",
                chunk_number,
                self.chunk_number,
            ));
        }
        if self.next_chunk_number != chunk_number + 1 {
            return Err(ProtocolError::mismatch(
                "write chunk next",
                chunk_number + 1,
                self.next_chunk_number,
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadChunkRequest {
    pub chunk_number: u32,
}

impl ReadChunkRequest {
    pub fn to_bytes(&self) -> Vec<u8> {
        self.chunk_number.to_le_bytes().to_vec()
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len("read chunk request", data, 4)?;
        let mut cursor = Cursor::new(data);
        Ok(Self {
            chunk_number: cursor.read_u32::<LittleEndian>()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadChunkResponse {
    pub unknown: u32,
    pub chunk_number: u32,
    pub data: Vec<u8>,
}

impl ReadChunkResponse {
    pub const HEADER_SIZE: usize = 10;

    pub fn end_of_file() -> Self {
        Self {
            unknown: 0,
            chunk_number: EOF_CHUNK_NUMBER,
            data: EOF_PAYLOAD.to_vec(),
        }
    }

    pub fn is_end_of_file(&self) -> bool {
        self.chunk_number == EOF_CHUNK_NUMBER && self.data == EOF_PAYLOAD
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::HEADER_SIZE + self.data.len());
        buf.write_u32::<LittleEndian>(self.unknown).unwrap();
        buf.write_u32::<LittleEndian>(self.chunk_number).unwrap();
        buf.write_u16::<LittleEndian>(self.data.len() as u16).unwrap();
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len("read chunk response", data, Self::HEADER_SIZE)?;
        let mut cursor = Cursor::new(data);
        let unknown = cursor.read_u32::<LittleEndian>()?;
        let chunk_number = cursor.read_u32::<LittleEndian>()?;
        let len = cursor.read_u16::<LittleEndian>()? as usize;
        ensure_len("read chunk data", data, Self::HEADER_SIZE + len)?;
        Ok(Self {
            unknown,
            chunk_number,
            data: data[Self::HEADER_SIZE..Self::HEADER_SIZE + len].to_vec(),
        })
    }
}

/// Remote procedure call into a helper DLL on the terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFunctionRequest {
    pub dll_path: String,
    pub function: String,
    pub args: String,
}

impl RunFunctionRequest {
    pub fn new(dll_path: &str, function: &str, args: &str) -> Self {
        Self {
            dll_path: dll_path.to_string(),
            function: function.to_string(),
            args: args.to_string(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf =
            Vec::with_capacity(self.dll_path.len() + self.function.len() + self.args.len() + 3);
        put_cstr(&mut buf, &self.dll_path);
        put_cstr(&mut buf, &self.function);
        put_cstr(&mut buf, &self.args);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(data);
        Ok(Self {
            dll_path: read_cstr(&mut cursor, "run function dll")?,
            function: read_cstr(&mut cursor, "run function name")?,
            args: read_cstr(&mut cursor, "run function args")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunFunctionResponse {
    pub code: u32,
    pub message: String,
}

impl RunFunctionResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.message.len() + 1);
        buf.write_u32::<LittleEndian>(self.code).unwrap();
        put_cstr(&mut buf, &self.message);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len("run function response", data, 4)?;
        let mut cursor = Cursor::new(data);
        let code = cursor.read_u32::<LittleEndian>()?;
        Ok(Self {
            code,
            message: trailing_text(&mut cursor)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRegistryRequest {
    pub key: String,
}

impl ReadRegistryRequest {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(self.key.len() + 1);
        put_cstr(&mut buf, &self.key);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        let mut cursor = Cursor::new(data);
        Ok(Self {
            key: read_cstr(&mut cursor, "registry key")?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRegistryResponse {
    pub code: u32,
    pub unknown: u32,
    pub value: String,
}

impl ReadRegistryResponse {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(8 + self.value.len() + 1);
        buf.write_u32::<LittleEndian>(self.code).unwrap();
        buf.write_u32::<LittleEndian>(self.unknown).unwrap();
        put_cstr(&mut buf, &self.value);
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len("registry response", data, 8)?;
        let mut cursor = Cursor::new(data);
        let code = cursor.read_u32::<LittleEndian>()?;
        let unknown = cursor.read_u32::<LittleEndian>()?;
        Ok(Self {
            code,
            unknown,
            value: trailing_text(&mut cursor)?,
        })
    }
}

/// Opens a firmware update on an NVS instance. Bound to the device serial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwarePreamble {
    pub file_size: u32,
    pub reserved: u32,
    pub magic: u32,
    pub serial_number: u32,
}

impl FirmwarePreamble {
    pub const SIZE: usize = 16;

    pub fn new(file_size: u32, serial_number: u32) -> Self {
        Self {
            file_size,
            reserved: FW_PREAMBLE_RESERVED,
            magic: FW_PREAMBLE_MAGIC,
            serial_number,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_u32::<LittleEndian>(self.file_size).unwrap();
        buf.write_u32::<LittleEndian>(self.reserved).unwrap();
        buf.write_u32::<LittleEndian>(self.magic).unwrap();
        // Hex digits of the serial, most significant byte first.
        buf.write_u32::<BigEndian>(self.serial_number).unwrap();
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len("firmware preamble", data, Self::SIZE)?;
        let mut cursor = Cursor::new(data);
        Ok(Self {
            file_size: cursor.read_u32::<LittleEndian>()?,
            reserved: cursor.read_u32::<LittleEndian>()?,
            magic: cursor.read_u32::<LittleEndian>()?,
            serial_number: cursor.read_u32::<BigEndian>()?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreambleResponse {
    pub unknown_0: u32,
    pub chunk_size: u32,
    pub unknown_1: u32,
}

impl PreambleResponse {
    pub const SIZE: usize = 12;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_u32::<LittleEndian>(self.unknown_0).unwrap();
        buf.write_u32::<LittleEndian>(self.chunk_size).unwrap();
        buf.write_u32::<LittleEndian>(self.unknown_1).unwrap();
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len("preamble response", data, Self::SIZE)?;
        let mut cursor = Cursor::new(data);
        Ok(Self {
            unknown_0: cursor.read_u32::<LittleEndian>()?,
            chunk_size: cursor.read_u32::<LittleEndian>()?,
            unknown_1: cursor.read_u32::<LittleEndian>()?,
        })
    }

    pub fn check(&self) -> Result<(), ProtocolError> {
        if self.unknown_0 != 0 {
            return Err(ProtocolError::mismatch("preamble unknown 0", 0u32, self.unknown_0));
        }
        if self.unknown_1 != 0 {
            return Err(ProtocolError::mismatch("preamble unknown 1", 0u32, self.unknown_1));
        }
        if self.chunk_size == 0 {
            return Err(ProtocolError::mismatch("preamble chunk size", 1u32, 0u32));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareChunkRequest<'a> {
    pub offset: u32,
    pub data: &'a [u8],
}

impl<'a> FirmwareChunkRequest<'a> {
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(4 + self.data.len());
        buf.write_u32::<LittleEndian>(self.offset).unwrap();
        buf.extend_from_slice(self.data);
        buf
    }

    pub fn from_bytes(data: &'a [u8]) -> Result<Self, ProtocolError> {
        ensure_len("firmware chunk request", data, 4)?;
        let mut cursor = Cursor::new(data);
        Ok(Self {
            offset: cursor.read_u32::<LittleEndian>()?,
            data: &data[4..],
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FirmwareChunkResponse {
    pub offset: u32,
    pub next_offset: u32,
    pub status: u16,
}

impl FirmwareChunkResponse {
    pub const SIZE: usize = 10;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE);
        buf.write_u32::<LittleEndian>(self.offset).unwrap();
        buf.write_u32::<LittleEndian>(self.next_offset).unwrap();
        buf.write_u16::<LittleEndian>(self.status).unwrap();
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len("firmware chunk response", data, Self::SIZE)?;
        let mut cursor = Cursor::new(data);
        Ok(Self {
            offset: cursor.read_u32::<LittleEndian>()?,
            next_offset: cursor.read_u32::<LittleEndian>()?,
            status: cursor.read_u16::<LittleEndian>()?,
        })
    }

    pub fn check(&self, offset: u32) -> Result<(), ProtocolError> {
        if self.offset != offset {
            return Err(ProtocolError::mismatch("firmware offset echo", offset, self.offset));
        }
        if self.status != FW_CHUNK_STATUS_OK {
            return Err(ProtocolError::mismatch(
                "firmware chunk status",
                FW_CHUNK_STATUS_OK,
                self.status,
            ));
        }
        Ok(())
    }

    pub fn is_end_of_update(&self) -> bool {
        self.next_offset == FW_END_OF_UPDATE
    }
}

/// Attributes of the CIP identity object (`GetAttributesAll` reply).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityAttributes {
    pub vendor_id: u16,
    pub product_type: u16,
    pub product_code: u16,
    pub major_revision: u8,
    pub minor_revision: u8,
    pub status: u16,
    pub serial_number: u32,
    pub product_name: String,
}

impl IdentityAttributes {
    pub const FIXED_SIZE: usize = 15;

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::FIXED_SIZE + self.product_name.len());
        buf.write_u16::<LittleEndian>(self.vendor_id).unwrap();
        buf.write_u16::<LittleEndian>(self.product_type).unwrap();
        buf.write_u16::<LittleEndian>(self.product_code).unwrap();
        buf.push(self.major_revision);
        buf.push(self.minor_revision);
        buf.write_u16::<LittleEndian>(self.status).unwrap();
        buf.write_u32::<LittleEndian>(self.serial_number).unwrap();
        buf.push(self.product_name.len() as u8);
        buf.extend_from_slice(self.product_name.as_bytes());
        buf
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        ensure_len("identity attributes", data, Self::FIXED_SIZE)?;
        let mut cursor = Cursor::new(data);
        let vendor_id = cursor.read_u16::<LittleEndian>()?;
        let product_type = cursor.read_u16::<LittleEndian>()?;
        let product_code = cursor.read_u16::<LittleEndian>()?;
        let major_revision = cursor.read_u8()?;
        let minor_revision = cursor.read_u8()?;
        let status = cursor.read_u16::<LittleEndian>()?;
        let serial_number = cursor.read_u32::<LittleEndian>()?;
        let name_len = cursor.read_u8()? as usize;
        ensure_len("identity product name", data, Self::FIXED_SIZE + name_len)?;
        let name = &data[Self::FIXED_SIZE..Self::FIXED_SIZE + name_len];
        Ok(Self {
            vendor_id,
            product_type,
            product_code,
            major_revision,
            minor_revision,
            status,
            serial_number,
            product_name: String::from_utf8_lossy(name).trim_end().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_download_layout() {
        let req = CreateDownloadRequest {
            overwrite: true,
            chunk_size: 1984,
            file_size: 0x0001_0203,
            path: "\\A\\b.mer".to_string(),
        };
        let bytes = req.to_bytes();
        assert_eq!(&bytes[..8], &[0x01, 0x01, 0xC0, 0x07, 0x03, 0x02, 0x01, 0x00]);
        assert_eq!(&bytes[8..], b"\\A\\b.mer\0");
        assert_eq!(CreateDownloadRequest::from_bytes(&bytes).unwrap(), req);
    }

    #[test]
    fn test_create_upload_layout() {
        let req = CreateUploadRequest {
            chunk_size: 462,
            path: "x".to_string(),
        };
        assert_eq!(req.to_bytes(), vec![0x00, 0x00, 0xCE, 0x01, b'x', 0]);
    }

    #[test]
    fn test_create_response_stale_transfer() {
        let resp = CreateTransferResponse {
            msg_instance: 3,
            unknown: 0,
            transfer_instance: 7,
            chunk_size: 1984,
            file_size: None,
        };
        let parsed = CreateTransferResponse::from_download_bytes(&resp.to_bytes()).unwrap();
        assert!(matches!(
            parsed.check(1984),
            Err(ProtocolError::StaleTransfer { msg_instance: 3 })
        ));
    }

    #[test]
    fn test_create_response_chunk_echo() {
        let resp = CreateTransferResponse {
            msg_instance: 0,
            unknown: 0,
            transfer_instance: 7,
            chunk_size: 1000,
            file_size: Some(55),
        };
        let parsed = CreateTransferResponse::from_upload_bytes(&resp.to_bytes()).unwrap();
        assert_eq!(parsed.file_size, Some(55));
        assert!(matches!(
            parsed.check(1984),
            Err(ProtocolError::ChunkSizeMismatch {
                requested: 1984,
                actual: 1000
            })
        ));
        assert!(parsed.check(1000).is_ok());
    }

    #[test]
    fn test_upload_response_requires_size() {
        let resp = CreateTransferResponse {
            msg_instance: 0,
            unknown: 0,
            transfer_instance: 1,
            chunk_size: 1984,
            file_size: None,
        };
        assert!(matches!(
            CreateTransferResponse::from_upload_bytes(&resp.to_bytes()),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_write_eof_sentinel_bytes() {
        let eof = WriteChunkRequest::end_of_file().to_bytes();
        assert_eq!(eof, vec![0, 0, 0, 0, 0x02, 0x00, 0xFF, 0xFF]);
        assert!(WriteChunkRequest::from_bytes(&eof).unwrap().is_end_of_file());
    }

    #[test]
    fn test_write_response_checks_echo_and_next() {
        let ok = WriteChunkResponse {
            unknown: 0,
            chunk_number: 4,
            next_chunk_number: 5,
        };
        assert!(ok.check(4).is_ok());
        assert!(ok.check(3).is_err());

        let skipped = WriteChunkResponse {
            next_chunk_number: 6,
            ..ok
        };
        assert!(matches!(
            skipped.check(4),
            Err(ProtocolError::FieldMismatch {
                field: "write chunk next",
                ..
            })
        ));
    }

    #[test]
    fn test_read_chunk_eof() {
        let bytes = ReadChunkResponse::end_of_file().to_bytes();
        let parsed = ReadChunkResponse::from_bytes(&bytes).unwrap();
        assert!(parsed.is_end_of_file());

        let data = ReadChunkResponse {
            unknown: 0,
            chunk_number: 1,
            data: vec![0xFF, 0xFF],
        };
        assert!(!data.is_end_of_file());
    }

    #[test]
    fn test_read_chunk_truncated_payload() {
        let mut bytes = ReadChunkResponse {
            unknown: 0,
            chunk_number: 1,
            data: vec![1, 2, 3, 4],
        }
        .to_bytes();
        bytes.truncate(bytes.len() - 1);
        assert!(matches!(
            ReadChunkResponse::from_bytes(&bytes),
            Err(ProtocolError::Truncated { .. })
        ));
    }

    #[test]
    fn test_run_function_layout() {
        let req = RunFunctionRequest::new("\\Windows\\H.dll", "FileExists", "\\a.txt");
        let bytes = req.to_bytes();
        assert_eq!(bytes, b"\\Windows\\H.dll\0FileExists\0\\a.txt\0".to_vec());
        assert_eq!(RunFunctionRequest::from_bytes(&bytes).unwrap(), req);

        let resp = RunFunctionResponse::from_bytes(b"\x00\x00\x00\x00ok\x00").unwrap();
        assert_eq!(resp.code, 0);
        assert_eq!(resp.message, "ok");

        let unterminated = RunFunctionResponse::from_bytes(b"\x01\x00\x00\x00fail").unwrap();
        assert_eq!(unterminated.code, 1);
        assert_eq!(unterminated.message, "fail");
    }

    #[test]
    fn test_registry_response() {
        let resp = ReadRegistryResponse::from_bytes(b"\x00\x00\x00\x00\x05\x00\x00\x0011.00.25\x00")
            .unwrap();
        assert_eq!(resp.code, 0);
        assert_eq!(resp.unknown, 5);
        assert_eq!(resp.value, "11.00.25");
    }

    #[test]
    fn test_firmware_preamble_layout() {
        let bytes = FirmwarePreamble::new(1000, 0x40A1_B2C3).to_bytes();
        assert_eq!(&bytes[0..4], &1000u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &FW_PREAMBLE_RESERVED.to_le_bytes());
        assert_eq!(&bytes[8..12], &FW_PREAMBLE_MAGIC.to_le_bytes());
        assert_eq!(&bytes[12..16], &[0x40, 0xA1, 0xB2, 0xC3]);
        assert_eq!(
            FirmwarePreamble::from_bytes(&bytes).unwrap().serial_number,
            0x40A1_B2C3
        );
    }

    #[test]
    fn test_firmware_chunk_response_checks() {
        let resp = FirmwareChunkResponse {
            offset: 256,
            next_offset: FW_END_OF_UPDATE,
            status: FW_CHUNK_STATUS_OK,
        };
        assert!(resp.check(256).is_ok());
        assert!(resp.is_end_of_update());
        let bad = FirmwareChunkResponse { status: 0x03, ..resp };
        assert!(bad.check(256).is_err());
    }

    #[test]
    fn test_identity_attributes() {
        let id = IdentityAttributes {
            vendor_id: 1,
            product_type: 24,
            product_code: 0x0154,
            major_revision: 11,
            minor_revision: 2,
            status: 0x0030,
            serial_number: 0xDEAD_BEEF,
            product_name: "PanelView Plus 7".to_string(),
        };
        let parsed = IdentityAttributes::from_bytes(&id.to_bytes()).unwrap();
        assert_eq!(parsed, id);
    }
}
