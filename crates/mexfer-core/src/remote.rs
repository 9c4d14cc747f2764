//! Calls into the helper DLLs on the terminal and whitelisted registry reads.
//!
//! Every helper call is a *run function* request naming the DLL, the
//! exported function and a single string argument. Query functions answer in
//! the response string ("1"/"0", a decimal size, a version).

use tracing::{debug, instrument, warn};

use crate::context::OpContext;
use crate::device::DevicePaths;
use crate::error::{Error, ResourceKind, Result};
use crate::protocol::*;
use crate::transport::{CipRequest, CipTransport, TransportError};

/// Exported helper DLL functions.
pub mod functions {
    pub const FILE_EXISTS: &str = "FileExists";
    pub const FOLDER_EXISTS: &str = "FolderExists";
    pub const GET_FILE_SIZE: &str = "GetFileSize";
    pub const DELETE_FILE: &str = "DeleteFile";
    pub const CREATE_FOLDER: &str = "CreateFolder";
    pub const DELETE_FOLDER: &str = "DeleteFolder";
    /// Writes the names in a folder to the upload list file, one per line.
    pub const GET_FOLDER_CONTENTS: &str = "GetFolderContents";
    pub const IS_PROCESS_RUNNING: &str = "IsProcessRunning";
    pub const TERMINATE_PROCESS: &str = "TerminateProcess";
    pub const START_PROCESS: &str = "StartProcess";
    pub const REBOOT_DEVICE: &str = "RebootDevice";
    pub const GET_VERSION: &str = "GetVersion";
    pub const SET_SCREENSAVER: &str = "SetScreensaver";
    pub const SET_CORRUPTION_WARNING: &str = "SetCorruptionWarning";
}

use functions::*;

/// Sends a run function request without interpreting the response code.
pub fn run_function<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    dll: &str,
    function: &str,
    args: &str,
) -> Result<RunFunctionResponse> {
    let payload = RunFunctionRequest::new(dll, function, args).to_bytes();
    let reply = ctx.send(&CipRequest::new(SVC_RUN_FUNCTION, CLASS_REMOTE_HELPER, 1).data(&payload))?;
    let response = RunFunctionResponse::from_bytes(&reply)?;
    debug!(function, args, code = response.code, message = %response.message, "Run function");
    Ok(response)
}

/// Runs a function and requires the given success code.
pub fn call<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    dll: &str,
    function: &str,
    args: &str,
    success: u32,
) -> Result<String> {
    let response = run_function(ctx, dll, function, args)?;
    if response.code != success {
        return Err(Error::RemoteFunction {
            function: function.to_string(),
            code: response.code,
            message: response.message,
        });
    }
    Ok(response.message)
}

fn query_flag<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    dll: &str,
    function: &str,
    args: &str,
) -> Result<bool> {
    let answer = call(ctx, dll, function, args, FUNCTION_SUCCESS)?;
    Ok(answer.trim() == "1")
}

pub fn file_exists<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    dll: &str,
    path: &str,
) -> Result<bool> {
    query_flag(ctx, dll, FILE_EXISTS, path)
}

pub fn folder_exists<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    dll: &str,
    path: &str,
) -> Result<bool> {
    query_flag(ctx, dll, FOLDER_EXISTS, path)
}

pub fn file_size<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    dll: &str,
    path: &str,
) -> Result<u64> {
    let response = run_function(ctx, dll, GET_FILE_SIZE, path)?;
    if response.code != FUNCTION_SUCCESS {
        return Err(Error::not_found(ResourceKind::RemoteFile, path));
    }
    response.message.trim().parse().map_err(|_| Error::RemoteFunction {
        function: GET_FILE_SIZE.to_string(),
        code: response.code,
        message: format!("unparseable size '{}'", response.message),
    })
}

pub fn delete_file<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    dll: &str,
    path: &str,
) -> Result<()> {
    call(ctx, dll, DELETE_FILE, path, FUNCTION_SUCCESS)?;
    ctx.report.info(format!("Deleted {}", path));
    Ok(())
}

pub fn create_folder<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    dll: &str,
    path: &str,
) -> Result<()> {
    call(ctx, dll, CREATE_FOLDER, path, CREATE_FOLDER_SUCCESS)?;
    ctx.report.info(format!("Created folder {}", path));
    Ok(())
}

/// Creates a folder and any missing parents.
pub fn ensure_folder<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    dll: &str,
    path: &str,
) -> Result<()> {
    for folder in crate::device::paths::ancestors(path) {
        if !folder_exists(ctx, dll, &folder)? {
            create_folder(ctx, dll, &folder)?;
        }
    }
    Ok(())
}

pub fn delete_folder<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    dll: &str,
    path: &str,
) -> Result<()> {
    call(ctx, dll, DELETE_FOLDER, path, FUNCTION_SUCCESS)?;
    ctx.report.info(format!("Deleted folder {}", path));
    Ok(())
}

pub fn is_process_running<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    dll: &str,
    process: &str,
) -> Result<bool> {
    query_flag(ctx, dll, IS_PROCESS_RUNNING, process)
}

pub fn terminate_process<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    dll: &str,
    process: &str,
) -> Result<()> {
    call(ctx, dll, TERMINATE_PROCESS, process, FUNCTION_SUCCESS)?;
    ctx.report.info(format!("Stopped {}", process));
    Ok(())
}

/// Stops a process if it is running.
pub fn stop_if_running<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    dll: &str,
    process: &str,
) -> Result<()> {
    if is_process_running(ctx, dll, process)? {
        terminate_process(ctx, dll, process)?;
    }
    Ok(())
}

pub fn start_process<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    dll: &str,
    path: &str,
) -> Result<()> {
    call(ctx, dll, START_PROCESS, path, FUNCTION_SUCCESS)?;
    ctx.report.info(format!("Started {}", path));
    Ok(())
}

pub fn helper_version<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    dll: &str,
) -> Result<String> {
    let version = call(ctx, dll, GET_VERSION, "", FUNCTION_SUCCESS)?;
    Ok(version.trim().to_string())
}

pub fn set_screensaver<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    dll: &str,
    enabled: bool,
) -> Result<()> {
    call(ctx, dll, SET_SCREENSAVER, flag_arg(enabled), FUNCTION_SUCCESS)?;
    Ok(())
}

pub fn set_corruption_warning<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    dll: &str,
    enabled: bool,
) -> Result<()> {
    call(ctx, dll, SET_CORRUPTION_WARNING, flag_arg(enabled), FUNCTION_SUCCESS)?;
    Ok(())
}

fn flag_arg(enabled: bool) -> &'static str {
    if enabled { "1" } else { "0" }
}

/// Names in a remote folder.
///
/// The helper writes the listing to the upload list file, which is then
/// uploaded and split into lines.
#[instrument(skip(ctx, paths))]
pub fn list_folder<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    paths: &DevicePaths,
    folder: &str,
) -> Result<Vec<String>> {
    if !folder_exists(ctx, &paths.helper_dll, folder)? {
        return Err(Error::not_found(ResourceKind::RemoteFolder, folder));
    }
    call(ctx, &paths.helper_dll, GET_FOLDER_CONTENTS, folder, FUNCTION_SUCCESS)?;
    let listing = crate::transfer::upload_bytes(ctx, paths, &paths.upload_list)?;
    Ok(String::from_utf8_lossy(&listing)
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Reads a whitelisted registry value.
pub fn read_registry<T: CipTransport + ?Sized>(ctx: &mut OpContext<'_, T>, key: &str) -> Result<String> {
    if !REGISTRY_WHITELIST.contains(&key) {
        return Err(Error::RegistryKeyNotAllowed {
            key: key.to_string(),
        });
    }
    let payload = ReadRegistryRequest {
        key: key.to_string(),
    }
    .to_bytes();
    let reply = ctx.send(&CipRequest::new(SVC_READ_REGISTRY, CLASS_REMOTE_HELPER, 1).data(&payload))?;
    let response = ReadRegistryResponse::from_bytes(&reply)?;
    if response.code != FUNCTION_SUCCESS {
        return Err(Error::Registry {
            key: key.to_string(),
            code: response.code,
        });
    }
    Ok(response.value.trim().to_string())
}

/// Result of a command the terminal answers by dropping the connection.
#[derive(Debug)]
pub enum RebootOutcome {
    /// The connection dropped, as a restarting terminal does.
    ExpectedDisconnect,
    /// The terminal replied normally. It may not be restarting.
    Acknowledged,
    UnexpectedError(Error),
}

impl RebootOutcome {
    fn classify(result: std::result::Result<Vec<u8>, TransportError>) -> Self {
        match result {
            Err(e) if e.is_disconnect() => RebootOutcome::ExpectedDisconnect,
            Err(e) => RebootOutcome::UnexpectedError(e.into()),
            Ok(_) => RebootOutcome::Acknowledged,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, RebootOutcome::ExpectedDisconnect)
    }

    /// Short status for batch reports. Only `restarting` is a success.
    pub fn status(&self) -> &'static str {
        match self {
            RebootOutcome::ExpectedDisconnect => "restarting",
            RebootOutcome::Acknowledged => "unconfirmed",
            RebootOutcome::UnexpectedError(_) => "failed",
        }
    }

    /// Converts to a result, treating an acknowledged reboot as success.
    pub fn into_result(self) -> Result<()> {
        match self {
            RebootOutcome::UnexpectedError(e) => Err(e),
            _ => Ok(()),
        }
    }

    fn report<T: CipTransport + ?Sized>(&self, ctx: &mut OpContext<'_, T>, what: &str) {
        match self {
            RebootOutcome::ExpectedDisconnect => {
                ctx.report.info(format!("{}: terminal disconnected, restarting", what))
            }
            RebootOutcome::Acknowledged => {
                warn!("{} acknowledged without disconnect", what);
                ctx.report.warn(format!(
                    "{}: terminal replied instead of disconnecting; it may not restart",
                    what
                ))
            }
            RebootOutcome::UnexpectedError(e) => ctx.report.error(format!("{} failed: {}", what, e)),
        }
    }
}

/// Asks the helper DLL to reboot the terminal.
pub fn reboot<T: CipTransport + ?Sized>(ctx: &mut OpContext<'_, T>, dll: &str) -> RebootOutcome {
    let payload = RunFunctionRequest::new(dll, REBOOT_DEVICE, "").to_bytes();
    let outcome = RebootOutcome::classify(
        ctx.send(&CipRequest::new(SVC_RUN_FUNCTION, CLASS_REMOTE_HELPER, 1).data(&payload)),
    );
    outcome.report(ctx, "Reboot");
    outcome
}

/// Sends the identity object reset service.
pub fn reset_device<T: CipTransport + ?Sized>(ctx: &mut OpContext<'_, T>) -> RebootOutcome {
    let outcome = RebootOutcome::classify(
        ctx.send(&CipRequest::new(SVC_RESET, CLASS_IDENTITY, IDENTITY_INSTANCE).data(&[0])),
    );
    outcome.report(ctx, "Reset");
    outcome
}
