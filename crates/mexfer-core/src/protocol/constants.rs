//! CIP service codes, class numbers and the fixed byte values observed on
//! ME terminals.
//!
//! Values documented as "opaque" were captured from working sessions and are
//! sent or compared verbatim. Their meaning is unknown.

// Common CIP services
pub const SVC_GET_ATTRIBUTES_ALL: u8 = 0x01;
pub const SVC_RESET: u8 = 0x05;
pub const SVC_CREATE: u8 = 0x08;
pub const SVC_DELETE: u8 = 0x09;
pub const SVC_GET_ATTRIBUTE_SINGLE: u8 = 0x0E;
pub const SVC_SET_ATTRIBUTE_SINGLE: u8 = 0x10;

// Vendor specific services
pub const SVC_READ_CHUNK: u8 = 0x4F;
pub const SVC_WRITE_CHUNK: u8 = 0x50;
pub const SVC_RUN_FUNCTION: u8 = 0x50;
pub const SVC_READ_REGISTRY: u8 = 0x51;
pub const SVC_FW_PREAMBLE: u8 = 0x4B;
pub const SVC_FW_CHUNK: u8 = 0x4C;

// Classes
pub const CLASS_IDENTITY: u16 = 0x01;
pub const CLASS_FILE_EXCHANGE: u16 = 0x04FE;
pub const CLASS_REMOTE_HELPER: u16 = 0x04FD;
pub const CLASS_NVS_UPDATE: u16 = 0xA1;

pub const IDENTITY_INSTANCE: u16 = 0x01;
/// Vendor attribute on the identity object carrying the hardware revision.
/// Older terminals do not implement it.
pub const ATTR_HARDWARE_REVISION: u16 = 0x6C;

// Transfer types in the create request
pub const TRANSFER_TYPE_UPLOAD: u8 = 0x00;
pub const TRANSFER_TYPE_DOWNLOAD: u8 = 0x01;

/// Chunk size used on direct (unrouted) communication paths.
pub const DEFAULT_CHUNK_SIZE: u16 = 1984;
/// Frame budget available to a routed file exchange message.
pub const ROUTED_FRAME_BUDGET: usize = 466;
/// Bytes of the routed budget that are never available to chunk data.
pub const ROUTED_RESERVED_BYTES: usize = 2;

// Readiness gate on the file exchange class (opaque).
pub const ATTR_READY_1: u16 = 0x01;
pub const ATTR_READY_2: u16 = 0x02;
pub const READY_UNK1: [u8; 2] = [0x00, 0x00];
pub const READY_UNK2: [u8; 2] = [0x01, 0x00];
pub const READY_UNK3: [u8; 2] = [0x02, 0x00];
/// Byte patterns a ready terminal has been observed to report.
pub const READY_PATTERNS: [[u8; 2]; 3] = [READY_UNK1, READY_UNK2, READY_UNK3];
/// Value written to the instance's ready attribute to mark the exchange in use.
pub const READY_MARK_IN_USE: [u8; 2] = READY_UNK2;

/// Chunk number that marks the end of a stream in either direction.
pub const EOF_CHUNK_NUMBER: u32 = 0;
pub const EOF_PAYLOAD: [u8; 2] = [0xFF, 0xFF];

// Run function
pub const FUNCTION_SUCCESS: u32 = 0;
/// Folder creation reports success with a non-zero code.
pub const CREATE_FOLDER_SUCCESS: u32 = 1;

// Firmware preamble / chunk (opaque)
pub const FW_PREAMBLE_RESERVED: u32 = 0;
pub const FW_PREAMBLE_MAGIC: u32 = 0x0000_0003;
pub const FW_CHUNK_STATUS_OK: u16 = 0x02;
pub const FW_END_OF_UPDATE: u32 = 0xFFFF_FFFF;

/// Registry keys the terminal agrees to serve.
pub const REGISTRY_ME_VERSION: &str =
    "HKEY_LOCAL_MACHINE\\SOFTWARE\\Rockwell Software\\RSViewME\\MEVersion";
pub const REGISTRY_STARTUP_APP: &str =
    "HKEY_LOCAL_MACHINE\\SOFTWARE\\Rockwell Software\\RSViewME\\Startup Options\\CurrentApp";
pub const REGISTRY_WHITELIST: [&str; 2] = [REGISTRY_ME_VERSION, REGISTRY_STARTUP_APP];
