//! Simulated ME terminal for testing and dry runs.
//!
//! Answers the file exchange, helper, registry, identity and firmware update
//! services from in-memory state. Clones share the same terminal, so a test
//! can hand one clone to the code under test and inspect another.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use super::traits::{CipRequest, CipTransport, TransportError};
use crate::device::DevicePaths;
use crate::device::paths::file_name;
use crate::protocol::*;
use crate::remote::functions::*;

// Win32 error codes the helper DLL reports.
const ERROR_FILE_NOT_FOUND: u32 = 2;
const ERROR_PATH_NOT_FOUND: u32 = 3;
const ERROR_MOD_NOT_FOUND: u32 = 126;
const ERROR_PROC_NOT_FOUND: u32 = 127;

// CIP general status codes.
const STATUS_PATH_DESTINATION_UNKNOWN: u8 = 0x05;
const STATUS_SERVICE_NOT_SUPPORTED: u8 = 0x08;
const STATUS_OBJECT_STATE_CONFLICT: u8 = 0x0C;
const STATUS_ATTRIBUTE_NOT_SUPPORTED: u8 = 0x14;
const STATUS_OBJECT_DOES_NOT_EXIST: u8 = 0x16;
const STATUS_INVALID_PARAMETER: u8 = 0x20;
const STATUS_VENDOR_SPECIFIC: u8 = 0x1F;

/// One request as the terminal received it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedRequest {
    pub service: u8,
    pub class: u16,
    pub instance: u16,
    pub attribute: Option<u16>,
    pub data: Vec<u8>,
}

/// Failure injected into the simulated terminal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockFault {
    /// The `occurrence`-th (1-based) matching request gets a CIP error status.
    Status {
        class: u16,
        service: u8,
        occurrence: usize,
    },
    /// The `occurrence`-th matching request drops the connection.
    Disconnect {
        class: u16,
        service: u8,
        occurrence: usize,
    },
    /// Write chunk replies echo the chunk number plus this offset.
    WriteEchoOffset(u32),
    /// Create replies echo this chunk size instead of the requested one.
    ChunkSizeEcho(u16),
    /// Read chunk replies echo the chunk number plus this offset.
    ReadEchoOffset(u32),
}

impl MockFault {
    pub fn status(class: u16, service: u8, occurrence: usize) -> Self {
        MockFault::Status {
            class,
            service,
            occurrence,
        }
    }

    pub fn disconnect(class: u16, service: u8, occurrence: usize) -> Self {
        MockFault::Disconnect {
            class,
            service,
            occurrence,
        }
    }
}

#[derive(Debug)]
enum MockExchange {
    Download {
        path: String,
        declared: u32,
        data: Vec<u8>,
        next_chunk: u32,
    },
    Upload {
        data: Vec<u8>,
        chunk_size: usize,
    },
}

#[derive(Debug)]
struct MockNvsUpdate {
    declared: u32,
    data: Vec<u8>,
    expected_offset: u32,
}

/// Firmware image received on an NVS instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashedImage {
    pub instance: u16,
    pub data: Vec<u8>,
}

#[derive(Debug)]
struct MockState {
    open: bool,
    open_count: usize,
    close_count: usize,
    timeout: Duration,
    timeout_history: Vec<Duration>,
    identity: IdentityAttributes,
    hardware_revision: Option<u16>,
    registry: HashMap<String, String>,
    /// Keyed by lowercase path.
    files: BTreeMap<String, (String, Vec<u8>)>,
    folders: BTreeSet<String>,
    processes: BTreeSet<String>,
    helper_version: String,
    flags: HashMap<&'static str, bool>,
    ready: HashMap<u16, Vec<u8>>,
    next_instance: u16,
    exchanges: HashMap<u16, MockExchange>,
    stale_msg_instance: u16,
    nvs_chunk_size: u32,
    offset_script: VecDeque<u32>,
    nvs: HashMap<u16, MockNvsUpdate>,
    flashed: Vec<FlashedImage>,
    reboot_acknowledged: bool,
    reboot_count: usize,
    reset_count: usize,
    faults: Vec<MockFault>,
    requests: Vec<LoggedRequest>,
}

impl MockState {
    fn new() -> Self {
        let mut registry = HashMap::new();
        registry.insert(REGISTRY_ME_VERSION.to_string(), "11.00.25".to_string());
        let mut state = Self {
            open: false,
            open_count: 0,
            close_count: 0,
            timeout: Duration::from_secs(10),
            timeout_history: Vec::new(),
            identity: IdentityAttributes {
                vendor_id: 1,
                product_type: 24,
                product_code: 0x00C8,
                major_revision: 11,
                minor_revision: 2,
                status: 0x0030,
                serial_number: 0x40A1_B2C3,
                product_name: "PanelView Plus 7 Standard".to_string(),
            },
            hardware_revision: Some(0x0002),
            registry,
            files: BTreeMap::new(),
            folders: BTreeSet::new(),
            processes: BTreeSet::new(),
            helper_version: "11.00.00".to_string(),
            flags: HashMap::new(),
            ready: HashMap::from([
                (ATTR_READY_1, READY_UNK1.to_vec()),
                (ATTR_READY_2, READY_UNK2.to_vec()),
            ]),
            next_instance: 1,
            exchanges: HashMap::new(),
            stale_msg_instance: 0,
            nvs_chunk_size: 256,
            offset_script: VecDeque::new(),
            nvs: HashMap::new(),
            flashed: Vec::new(),
            reboot_acknowledged: false,
            reboot_count: 0,
            reset_count: 0,
            faults: Vec::new(),
            requests: Vec::new(),
        };
        state.install_helper();
        state
    }

    /// Places the remote helper DLL where the current ME version expects it.
    fn install_helper(&mut self) {
        let dll = self.paths().helper_dll;
        self.put_file(&dll, b"MZ".to_vec());
    }

    fn me_major(&self) -> u32 {
        self.registry
            .get(REGISTRY_ME_VERSION)
            .and_then(|v| v.split('.').next())
            .and_then(|m| m.trim().parse().ok())
            .unwrap_or(u32::from(self.identity.major_revision))
    }

    fn paths(&self) -> DevicePaths {
        DevicePaths::for_major(self.me_major())
    }

    fn put_file(&mut self, path: &str, data: Vec<u8>) {
        self.files
            .insert(path.to_ascii_lowercase(), (path.to_string(), data));
    }

    fn file(&self, path: &str) -> Option<&Vec<u8>> {
        self.files.get(&path.to_ascii_lowercase()).map(|(_, d)| d)
    }

    fn folder_exists(&self, path: &str) -> bool {
        let key = path.trim_end_matches('\\').to_ascii_lowercase();
        let prefix = format!("{}\\", key);
        self.folders.contains(&key)
            || self.folders.iter().any(|f| f.starts_with(&prefix))
            || self.files.keys().any(|f| f.starts_with(&prefix))
    }

    fn injected_fault(&self, request: &CipRequest<'_>) -> Option<TransportError> {
        let seen = self
            .requests
            .iter()
            .filter(|r| r.class == request.class && r.service == request.service)
            .count();
        self.faults.iter().find_map(|fault| match *fault {
            MockFault::Status {
                class,
                service,
                occurrence,
            } if class == request.class && service == request.service && occurrence == seen => {
                Some(TransportError::CipStatus {
                    service: request.service,
                    general: STATUS_VENDOR_SPECIFIC,
                    extended: vec![0x0001],
                })
            }
            MockFault::Disconnect {
                class,
                service,
                occurrence,
            } if class == request.class && service == request.service && occurrence == seen => {
                Some(TransportError::Disconnected("injected".to_string()))
            }
            _ => None,
        })
    }

    fn write_echo_offset(&self) -> u32 {
        self.faults
            .iter()
            .find_map(|f| match f {
                MockFault::WriteEchoOffset(n) => Some(*n),
                _ => None,
            })
            .unwrap_or(0)
    }

    fn read_echo_offset(&self) -> u32 {
        self.faults
            .iter()
            .find_map(|f| match f {
                MockFault::ReadEchoOffset(n) => Some(*n),
                _ => None,
            })
            .unwrap_or(0)
    }

    fn chunk_size_echo(&self, requested: u16) -> u16 {
        self.faults
            .iter()
            .find_map(|f| match f {
                MockFault::ChunkSizeEcho(n) => Some(*n),
                _ => None,
            })
            .unwrap_or(requested)
    }

    fn handle(&mut self, request: &CipRequest<'_>) -> Result<Vec<u8>, TransportError> {
        match request.class {
            CLASS_IDENTITY => self.identity_service(request),
            CLASS_FILE_EXCHANGE => self.file_exchange_service(request),
            CLASS_REMOTE_HELPER => self.helper_service(request),
            CLASS_NVS_UPDATE => self.nvs_service(request),
            _ => Err(status(request, STATUS_PATH_DESTINATION_UNKNOWN)),
        }
    }

    fn identity_service(&mut self, request: &CipRequest<'_>) -> Result<Vec<u8>, TransportError> {
        match (request.service, request.attribute) {
            (SVC_GET_ATTRIBUTES_ALL, _) => Ok(self.identity.to_bytes()),
            (SVC_GET_ATTRIBUTE_SINGLE, Some(ATTR_HARDWARE_REVISION)) => self
                .hardware_revision
                .map(|r| r.to_le_bytes().to_vec())
                .ok_or_else(|| status(request, STATUS_ATTRIBUTE_NOT_SUPPORTED)),
            (SVC_RESET, _) => {
                self.reset_count += 1;
                self.open = false;
                Err(TransportError::Disconnected("terminal reset".to_string()))
            }
            _ => Err(status(request, STATUS_SERVICE_NOT_SUPPORTED)),
        }
    }

    fn file_exchange_service(&mut self, request: &CipRequest<'_>) -> Result<Vec<u8>, TransportError> {
        match request.service {
            SVC_GET_ATTRIBUTE_SINGLE => request
                .attribute
                .and_then(|a| self.ready.get(&a).cloned())
                .ok_or_else(|| status(request, STATUS_ATTRIBUTE_NOT_SUPPORTED)),
            SVC_SET_ATTRIBUTE_SINGLE => {
                if self.exchanges.contains_key(&request.instance) {
                    Ok(Vec::new())
                } else {
                    Err(status(request, STATUS_OBJECT_DOES_NOT_EXIST))
                }
            }
            SVC_CREATE => self.create_exchange(request),
            SVC_WRITE_CHUNK => self.write_chunk(request),
            SVC_READ_CHUNK => self.read_chunk(request),
            SVC_DELETE => self
                .exchanges
                .remove(&request.instance)
                .map(|_| Vec::new())
                .ok_or_else(|| status(request, STATUS_OBJECT_DOES_NOT_EXIST)),
            _ => Err(status(request, STATUS_SERVICE_NOT_SUPPORTED)),
        }
    }

    fn create_exchange(&mut self, request: &CipRequest<'_>) -> Result<Vec<u8>, TransportError> {
        let bad = |_| status(request, STATUS_INVALID_PARAMETER);
        let (exchange, chunk_size, file_size) = match request.data.first() {
            Some(&TRANSFER_TYPE_DOWNLOAD) => {
                let create = CreateDownloadRequest::from_bytes(request.data).map_err(bad)?;
                if self.file(&create.path).is_some() && !create.overwrite {
                    return Err(status(request, STATUS_OBJECT_STATE_CONFLICT));
                }
                let exchange = MockExchange::Download {
                    path: create.path,
                    declared: create.file_size,
                    data: Vec::new(),
                    next_chunk: 1,
                };
                (exchange, create.chunk_size, None)
            }
            Some(&TRANSFER_TYPE_UPLOAD) => {
                let create = CreateUploadRequest::from_bytes(request.data).map_err(bad)?;
                let data = self
                    .file(&create.path)
                    .cloned()
                    .ok_or_else(|| status(request, STATUS_PATH_DESTINATION_UNKNOWN))?;
                let size = data.len() as u32;
                let exchange = MockExchange::Upload {
                    data,
                    chunk_size: create.chunk_size as usize,
                };
                (exchange, create.chunk_size, Some(size))
            }
            _ => return Err(status(request, STATUS_INVALID_PARAMETER)),
        };

        let msg_instance = std::mem::take(&mut self.stale_msg_instance);
        let transfer_instance = self.next_instance;
        self.next_instance = self.next_instance.wrapping_add(1).max(1);
        if msg_instance == 0 {
            self.exchanges.insert(transfer_instance, exchange);
        }
        Ok(CreateTransferResponse {
            msg_instance,
            unknown: 0,
            transfer_instance,
            chunk_size: self.chunk_size_echo(chunk_size),
            file_size,
        }
        .to_bytes())
    }

    fn write_chunk(&mut self, request: &CipRequest<'_>) -> Result<Vec<u8>, TransportError> {
        let chunk = WriteChunkRequest::from_bytes(request.data)
            .map_err(|_| status(request, STATUS_INVALID_PARAMETER))?;
        let echo_offset = self.write_echo_offset();
        let Some(MockExchange::Download {
            path,
            declared,
            data,
            next_chunk,
        }) = self.exchanges.get_mut(&request.instance)
        else {
            return Err(status(request, STATUS_OBJECT_DOES_NOT_EXIST));
        };

        if chunk.is_end_of_file() {
            if data.len() != *declared as usize {
                return Err(status(request, STATUS_OBJECT_STATE_CONFLICT));
            }
            let (path, data) = (path.clone(), std::mem::take(data));
            self.put_file(&path, data);
            return Ok(vec![0; WriteChunkResponse::SIZE]);
        }
        if chunk.chunk_number != *next_chunk {
            return Err(status(request, STATUS_INVALID_PARAMETER));
        }
        data.extend_from_slice(chunk.data);
        *next_chunk += 1;
        let echo = chunk.chunk_number + echo_offset;
        Ok(WriteChunkResponse {
            unknown: 0,
            chunk_number: echo,
            next_chunk_number: echo + 1,
        }
        .to_bytes())
    }

    fn read_chunk(&mut self, request: &CipRequest<'_>) -> Result<Vec<u8>, TransportError> {
        let read = ReadChunkRequest::from_bytes(request.data)
            .map_err(|_| status(request, STATUS_INVALID_PARAMETER))?;
        let echo_offset = self.read_echo_offset();
        let Some(MockExchange::Upload { data, chunk_size }) = self.exchanges.get(&request.instance)
        else {
            return Err(status(request, STATUS_OBJECT_DOES_NOT_EXIST));
        };
        if read.chunk_number == 0 {
            return Err(status(request, STATUS_INVALID_PARAMETER));
        }
        let start = (read.chunk_number as usize - 1) * chunk_size;
        if start >= data.len() {
            return Ok(ReadChunkResponse::end_of_file().to_bytes());
        }
        let end = (start + chunk_size).min(data.len());
        Ok(ReadChunkResponse {
            unknown: 0,
            chunk_number: read.chunk_number + echo_offset,
            data: data[start..end].to_vec(),
        }
        .to_bytes())
    }

    fn helper_service(&mut self, request: &CipRequest<'_>) -> Result<Vec<u8>, TransportError> {
        match request.service {
            SVC_RUN_FUNCTION => {
                let call = RunFunctionRequest::from_bytes(request.data)
                    .map_err(|_| status(request, STATUS_INVALID_PARAMETER))?;
                if self.file(&call.dll_path).is_none() {
                    return Ok(reply(ERROR_MOD_NOT_FOUND, "module not found"));
                }
                self.run_function(&call.function, &call.args)
            }
            SVC_READ_REGISTRY => {
                let read = ReadRegistryRequest::from_bytes(request.data)
                    .map_err(|_| status(request, STATUS_INVALID_PARAMETER))?;
                let response = match self.registry.get(&read.key) {
                    Some(value) => ReadRegistryResponse {
                        code: 0,
                        unknown: 0,
                        value: value.clone(),
                    },
                    None => ReadRegistryResponse {
                        code: ERROR_FILE_NOT_FOUND,
                        unknown: 0,
                        value: String::new(),
                    },
                };
                Ok(response.to_bytes())
            }
            _ => Err(status(request, STATUS_SERVICE_NOT_SUPPORTED)),
        }
    }

    fn run_function(&mut self, function: &str, args: &str) -> Result<Vec<u8>, TransportError> {
        let flag = |b: bool| reply(FUNCTION_SUCCESS, if b { "1" } else { "0" });
        let key = args.trim_end_matches('\\').to_ascii_lowercase();
        Ok(match function {
            FILE_EXISTS => flag(self.file(args).is_some()),
            FOLDER_EXISTS => flag(self.folder_exists(args)),
            GET_FILE_SIZE => match self.file(args) {
                Some(data) => reply(FUNCTION_SUCCESS, &data.len().to_string()),
                None => reply(ERROR_FILE_NOT_FOUND, "file not found"),
            },
            DELETE_FILE => match self.files.remove(&key) {
                Some(_) => reply(FUNCTION_SUCCESS, ""),
                None => reply(ERROR_FILE_NOT_FOUND, "file not found"),
            },
            CREATE_FOLDER => {
                if self.folder_exists(args) {
                    reply(0, "already exists")
                } else {
                    self.folders.insert(key);
                    reply(CREATE_FOLDER_SUCCESS, "")
                }
            }
            DELETE_FOLDER => {
                if !self.folder_exists(args) {
                    return Ok(reply(ERROR_PATH_NOT_FOUND, "path not found"));
                }
                let prefix = format!("{}\\", key);
                self.folders.retain(|f| *f != key && !f.starts_with(&prefix));
                self.files.retain(|f, _| !f.starts_with(&prefix));
                reply(FUNCTION_SUCCESS, "")
            }
            GET_FOLDER_CONTENTS => {
                let prefix = format!("{}\\", key);
                let listing: String = self
                    .files
                    .iter()
                    .filter(|(k, _)| k.starts_with(&prefix) && !k[prefix.len()..].contains('\\'))
                    .map(|(_, (path, _))| format!("{}\r\n", file_name(path)))
                    .collect();
                let list_path = self.paths().upload_list;
                self.put_file(&list_path, listing.into_bytes());
                reply(FUNCTION_SUCCESS, "")
            }
            IS_PROCESS_RUNNING => flag(self.processes.contains(&args.to_ascii_lowercase())),
            TERMINATE_PROCESS => {
                self.processes.remove(&args.to_ascii_lowercase());
                reply(FUNCTION_SUCCESS, "")
            }
            START_PROCESS => {
                if self.file(args).is_none() {
                    return Ok(reply(ERROR_FILE_NOT_FOUND, "file not found"));
                }
                self.processes.insert(file_name(args).to_ascii_lowercase());
                reply(FUNCTION_SUCCESS, "")
            }
            REBOOT_DEVICE => {
                self.reboot_count += 1;
                if self.reboot_acknowledged {
                    reply(FUNCTION_SUCCESS, "")
                } else {
                    self.open = false;
                    return Err(TransportError::Disconnected("terminal rebooting".to_string()));
                }
            }
            GET_VERSION => reply(FUNCTION_SUCCESS, &self.helper_version),
            SET_SCREENSAVER => {
                self.flags.insert(SET_SCREENSAVER, args == "1");
                reply(FUNCTION_SUCCESS, "")
            }
            SET_CORRUPTION_WARNING => {
                self.flags.insert(SET_CORRUPTION_WARNING, args == "1");
                reply(FUNCTION_SUCCESS, "")
            }
            _ => reply(ERROR_PROC_NOT_FOUND, "procedure not found"),
        })
    }

    fn nvs_service(&mut self, request: &CipRequest<'_>) -> Result<Vec<u8>, TransportError> {
        match request.service {
            SVC_FW_PREAMBLE => {
                let preamble = FirmwarePreamble::from_bytes(request.data)
                    .map_err(|_| status(request, STATUS_INVALID_PARAMETER))?;
                if preamble.magic != FW_PREAMBLE_MAGIC
                    || preamble.serial_number != self.identity.serial_number
                {
                    return Err(status(request, STATUS_INVALID_PARAMETER));
                }
                self.nvs.insert(
                    request.instance,
                    MockNvsUpdate {
                        declared: preamble.file_size,
                        data: vec![0; preamble.file_size as usize],
                        expected_offset: 0,
                    },
                );
                Ok(PreambleResponse {
                    unknown_0: 0,
                    chunk_size: self.nvs_chunk_size,
                    unknown_1: 0,
                }
                .to_bytes())
            }
            SVC_FW_CHUNK => {
                let chunk = FirmwareChunkRequest::from_bytes(request.data)
                    .map_err(|_| status(request, STATUS_INVALID_PARAMETER))?;
                let Some(update) = self.nvs.get_mut(&request.instance) else {
                    return Err(status(request, STATUS_OBJECT_DOES_NOT_EXIST));
                };
                let start = chunk.offset as usize;
                let end = start + chunk.data.len();
                if chunk.offset != update.expected_offset || end > update.data.len() {
                    return Err(status(request, STATUS_INVALID_PARAMETER));
                }
                update.data[start..end].copy_from_slice(chunk.data);
                let next = match self.offset_script.pop_front() {
                    Some(next) => next,
                    None if end as u32 >= update.declared => FW_END_OF_UPDATE,
                    None => end as u32,
                };
                update.expected_offset = next;
                if next == FW_END_OF_UPDATE {
                    let done = self.nvs.remove(&request.instance).map(|u| u.data);
                    self.flashed.push(FlashedImage {
                        instance: request.instance,
                        data: done.unwrap_or_default(),
                    });
                }
                Ok(FirmwareChunkResponse {
                    offset: chunk.offset,
                    next_offset: next,
                    status: FW_CHUNK_STATUS_OK,
                }
                .to_bytes())
            }
            _ => Err(status(request, STATUS_SERVICE_NOT_SUPPORTED)),
        }
    }
}

fn status(request: &CipRequest<'_>, general: u8) -> TransportError {
    TransportError::CipStatus {
        service: request.service,
        general,
        extended: Vec::new(),
    }
}

fn reply(code: u32, message: &str) -> Vec<u8> {
    RunFunctionResponse {
        code,
        message: message.to_string(),
    }
    .to_bytes()
}

/// Mock transport simulating one terminal.
#[derive(Clone)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
    path: CommPath,
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::new())),
            path: CommPath::direct("mock"),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        // A panic while holding the lock only happens in a failing test.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn with_path(mut self, path: CommPath) -> Self {
        self.path = path;
        self
    }

    /// Sets the ME version reported in the registry and moves the helper
    /// DLL to the matching generation's location.
    pub fn with_me_version(self, version: &str) -> Self {
        {
            let mut state = self.state();
            let old = state.paths().helper_dll;
            state.files.remove(&old.to_ascii_lowercase());
            state
                .registry
                .insert(REGISTRY_ME_VERSION.to_string(), version.to_string());
            if let Some(major) = version.split('.').next().and_then(|m| m.parse::<u8>().ok()) {
                state.identity.major_revision = major;
            }
            state.install_helper();
        }
        self
    }

    pub fn with_helper_version(self, version: &str) -> Self {
        self.state().helper_version = version.to_string();
        self
    }

    pub fn with_identity(self, identity: IdentityAttributes) -> Self {
        self.state().identity = identity;
        self
    }

    pub fn with_product_code(self, code: u16) -> Self {
        self.state().identity.product_code = code;
        self
    }

    pub fn with_product_type(self, product_type: u16) -> Self {
        self.state().identity.product_type = product_type;
        self
    }

    pub fn with_serial_number(self, serial: u32) -> Self {
        self.state().identity.serial_number = serial;
        self
    }

    /// Terminal without the hardware revision attribute.
    pub fn without_hardware_revision(self) -> Self {
        self.state().hardware_revision = None;
        self
    }

    pub fn with_file(self, path: &str, data: Vec<u8>) -> Self {
        self.add_file(path, data);
        self
    }

    pub fn with_folder(self, path: &str) -> Self {
        self.state()
            .folders
            .insert(path.trim_end_matches('\\').to_ascii_lowercase());
        self
    }

    pub fn with_process(self, name: &str) -> Self {
        self.state().processes.insert(name.to_ascii_lowercase());
        self
    }

    pub fn with_registry(self, key: &str, value: &str) -> Self {
        self.state()
            .registry
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Next create reply carries this message instance.
    pub fn with_stale_msg_instance(self, msg_instance: u16) -> Self {
        self.state().stale_msg_instance = msg_instance;
        self
    }

    pub fn with_fault(self, fault: MockFault) -> Self {
        self.state().faults.push(fault);
        self
    }

    pub fn with_nvs_chunk_size(self, chunk_size: u32) -> Self {
        self.state().nvs_chunk_size = chunk_size;
        self
    }

    /// Next offsets returned by firmware chunk replies, in order.
    pub fn with_offset_script(self, offsets: &[u32]) -> Self {
        self.state().offset_script = offsets.iter().copied().collect();
        self
    }

    /// Reboot requests get a normal reply instead of a disconnect.
    pub fn with_reboot_acknowledged(self) -> Self {
        self.state().reboot_acknowledged = true;
        self
    }

    pub fn add_file(&self, path: &str, data: Vec<u8>) {
        self.state().put_file(path, data);
    }

    pub fn remove_file(&self, path: &str) {
        self.state().files.remove(&path.to_ascii_lowercase());
    }

    pub fn set_ready_value(&self, attribute: u16, value: Vec<u8>) {
        self.state().ready.insert(attribute, value);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.state().file(path).cloned()
    }

    pub fn has_folder(&self, path: &str) -> bool {
        self.state().folder_exists(path)
    }

    pub fn is_running(&self, process: &str) -> bool {
        self.state().processes.contains(&process.to_ascii_lowercase())
    }

    /// Last value written through a display flag function.
    pub fn flag(&self, function: &str) -> Option<bool> {
        self.state().flags.get(function).copied()
    }

    /// All requests received so far.
    pub fn requests(&self) -> Vec<LoggedRequest> {
        self.state().requests.clone()
    }

    pub fn requests_for(&self, class: u16, service: u8) -> Vec<LoggedRequest> {
        self.state()
            .requests
            .iter()
            .filter(|r| r.class == class && r.service == service)
            .cloned()
            .collect()
    }

    /// Helper functions called, in order, with their arguments.
    pub fn function_calls(&self) -> Vec<(String, String)> {
        self.requests_for(CLASS_REMOTE_HELPER, SVC_RUN_FUNCTION)
            .iter()
            .filter_map(|r| RunFunctionRequest::from_bytes(&r.data).ok())
            .map(|call| (call.function, call.args))
            .collect()
    }

    pub fn clear_requests(&self) {
        self.state().requests.clear();
    }

    pub fn open_transfers(&self) -> usize {
        self.state().exchanges.len()
    }

    pub fn flashed(&self) -> Vec<FlashedImage> {
        self.state().flashed.clone()
    }

    pub fn open_count(&self) -> usize {
        self.state().open_count
    }

    pub fn close_count(&self) -> usize {
        self.state().close_count
    }

    pub fn reboot_count(&self) -> usize {
        self.state().reboot_count
    }

    pub fn reset_count(&self) -> usize {
        self.state().reset_count
    }

    /// Every timeout set on the transport, in order.
    pub fn timeout_history(&self) -> Vec<Duration> {
        self.state().timeout_history.clone()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl CipTransport for MockTransport {
    fn open(&mut self) -> Result<(), TransportError> {
        let mut state = self.state();
        state.open = true;
        state.open_count += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<(), TransportError> {
        let mut state = self.state();
        if state.open {
            state.open = false;
            state.close_count += 1;
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.state().open
    }

    fn generic_message(&mut self, request: &CipRequest<'_>) -> Result<Vec<u8>, TransportError> {
        let mut state = self.state();
        if !state.open {
            return Err(TransportError::NotOpen);
        }
        state.requests.push(LoggedRequest {
            service: request.service,
            class: request.class,
            instance: request.instance,
            attribute: request.attribute,
            data: request.data.to_vec(),
        });
        if let Some(err) = state.injected_fault(request) {
            if err.is_disconnect() {
                state.open = false;
            }
            return Err(err);
        }
        state.handle(request)
    }

    fn timeout(&self) -> Duration {
        self.state().timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        let mut state = self.state();
        state.timeout = timeout;
        state.timeout_history.push(timeout);
        Ok(())
    }

    fn path(&self) -> &CommPath {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(mock: &mut MockTransport, function: &str, args: &str) -> RunFunctionResponse {
        let payload = RunFunctionRequest::new("\\Windows\\RemoteHelper.DLL", function, args).to_bytes();
        let reply = mock
            .generic_message(&CipRequest::new(SVC_RUN_FUNCTION, CLASS_REMOTE_HELPER, 1).data(&payload))
            .unwrap();
        RunFunctionResponse::from_bytes(&reply).unwrap()
    }

    #[test]
    fn test_mock_requires_open() {
        let mut mock = MockTransport::new();
        let request = CipRequest::new(SVC_GET_ATTRIBUTES_ALL, CLASS_IDENTITY, IDENTITY_INSTANCE);
        assert!(matches!(
            mock.generic_message(&request),
            Err(TransportError::NotOpen)
        ));
        mock.open().unwrap();
        let identity = IdentityAttributes::from_bytes(&mock.generic_message(&request).unwrap()).unwrap();
        assert_eq!(identity.product_type, 24);
        mock.close().unwrap();
        mock.close().unwrap();
        assert_eq!(mock.close_count(), 1);
    }

    #[test]
    fn test_mock_clones_share_state() {
        let mut mock = MockTransport::new();
        let observer = mock.clone();
        mock.open().unwrap();
        call(&mut mock, FILE_EXISTS, "\\x");
        assert_eq!(observer.requests().len(), 1);
        assert!(observer.is_open());
    }

    #[test]
    fn test_mock_folder_listing() {
        let mut mock = MockTransport::new()
            .with_file("\\Data\\a.mer", vec![1])
            .with_file("\\Data\\b.mer", vec![2])
            .with_file("\\Data\\Sub\\c.mer", vec![3]);
        mock.open().unwrap();
        assert_eq!(call(&mut mock, GET_FOLDER_CONTENTS, "\\Data").code, 0);
        let listing = mock.file(&DevicePaths::for_major(11).upload_list).unwrap();
        assert_eq!(listing, b"a.mer\r\nb.mer\r\n".to_vec());
    }

    #[test]
    fn test_mock_missing_dll() {
        let mut mock = MockTransport::new().with_me_version("5.10.00");
        mock.open().unwrap();
        // modern helper location is gone on a legacy terminal
        assert_eq!(call(&mut mock, FILE_EXISTS, "\\x").code, ERROR_MOD_NOT_FOUND);
    }

    #[test]
    fn test_mock_injected_disconnect_closes() {
        let mut mock = MockTransport::new().with_fault(MockFault::disconnect(
            CLASS_REMOTE_HELPER,
            SVC_RUN_FUNCTION,
            1,
        ));
        mock.open().unwrap();
        let payload = RunFunctionRequest::new("\\Windows\\RemoteHelper.DLL", GET_VERSION, "").to_bytes();
        let err = mock
            .generic_message(&CipRequest::new(SVC_RUN_FUNCTION, CLASS_REMOTE_HELPER, 1).data(&payload))
            .unwrap_err();
        assert!(err.is_disconnect());
        assert!(!mock.is_open());
    }
}
