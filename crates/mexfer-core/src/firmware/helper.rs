//! Firmware helper DLL staging.

use std::path::Path;
use std::time::Duration;

use tracing::{info, instrument};

use crate::context::OpContext;
use crate::device::DevicePaths;
use crate::error::{Error, ResourceKind, Result};
use crate::remote;
use crate::transfer;
use crate::transport::CipTransport;

/// Where a terminal may already carry the firmware helper.
pub const FIRMWARE_HELPER_LOCATIONS: [&str; 2] =
    ["\\Windows\\FUWhelper.dll", "\\Storage Card\\FUWhelper.dll"];

/// Where a supplied firmware helper is placed.
pub const FIRMWARE_HELPER_STAGING: &str = "\\Storage Card\\FUWhelper.dll";

pub const FIRMWARE_HELPER_NAME: &str = "FUWhelper.dll";

/// Makes sure the firmware helper DLL is on the terminal.
///
/// Known locations are checked first. Otherwise `helper_file` is downloaded
/// to the staging location and the terminal gets `settle` to load it. The
/// location found is recorded in `paths.firmware_helper`.
#[instrument(skip(ctx, paths))]
pub fn ensure_firmware_helper<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    paths: &mut DevicePaths,
    helper_file: Option<&Path>,
    settle: Duration,
) -> Result<String> {
    for location in FIRMWARE_HELPER_LOCATIONS {
        if remote::file_exists(ctx, &paths.helper_dll, location)? {
            ctx.report.info(format!("Firmware helper present at {}", location));
            paths.firmware_helper = Some(location.to_string());
            return Ok(location.to_string());
        }
    }

    let Some(helper_file) = helper_file else {
        ctx.report
            .error("Firmware helper is not on the terminal and no helper file was given");
        return Err(Error::not_found(ResourceKind::Helper, FIRMWARE_HELPER_NAME));
    };
    ctx.report.info(format!(
        "Staging firmware helper {} to {}",
        helper_file.display(),
        FIRMWARE_HELPER_STAGING
    ));
    let data = transfer::read_local(helper_file)?;
    transfer::download_bytes(ctx, &data, FIRMWARE_HELPER_STAGING, false)?;

    info!(settle_ms = settle.as_millis() as u64, "Waiting for firmware helper");
    std::thread::sleep(settle);
    paths.firmware_helper = Some(FIRMWARE_HELPER_STAGING.to_string());
    Ok(FIRMWARE_HELPER_STAGING.to_string())
}
