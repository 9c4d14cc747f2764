//! Card image upgrade of ME 6 and newer terminals.

use std::path::Path;

use tracing::instrument;

use crate::context::OpContext;
use crate::device::DevicePaths;
use crate::device::paths::join;
use crate::error::Result;
use crate::events::Phase;
use crate::remote;
use crate::transfer;
use crate::transport::CipTransport;

use super::{RESUME_MARKER, RUNTIME_PROCESS};

/// Folder the terminal applies a card image from on the next boot.
pub const CARD_IMAGE_FOLDER: &str = "\\Storage Card\\vfs\\platform firmware";
pub const CARD_IMAGE_NAME: &str = "SC.IMG";

pub fn card_image_path() -> String {
    join(CARD_IMAGE_FOLDER, CARD_IMAGE_NAME)
}

/// Places a card image where the terminal picks it up.
#[instrument(skip(ctx, paths))]
pub fn flash_card_image<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    paths: &DevicePaths,
    image: &Path,
) -> Result<()> {
    let data = transfer::read_local(image)?;
    let dll = paths.helper_dll.as_str();

    ctx.report.phase(Phase::Upgrade);
    remote::ensure_folder(ctx, dll, CARD_IMAGE_FOLDER)?;
    if remote::file_exists(ctx, dll, RESUME_MARKER)? {
        remote::delete_file(ctx, dll, RESUME_MARKER)?;
    }
    remote::stop_if_running(ctx, dll, RUNTIME_PROCESS)?;

    ctx.report.phase(Phase::Transfer);
    let destination = card_image_path();
    let exists = remote::file_exists(ctx, dll, &destination)?;
    transfer::download_bytes(ctx, &data, &destination, exists)?;
    ctx.report
        .info(format!("Card image staged, {} bytes", data.len()));
    Ok(())
}
