//! Firmware upgrade of legacy (ME 5 and older) terminals.
//!
//! The upgrade files are staged into two upgrade folders and the terminal's
//! own upgrade program is launched to apply them. Once the cover program
//! runs the terminal cannot resume normal operation, so nothing here is
//! restartable.

use std::fmt;

use tracing::{debug, info, instrument};

use crate::context::OpContext;
use crate::device::DevicePaths;
use crate::device::paths::join;
use crate::error::{Error, ResourceKind, Result};
use crate::events::Phase;
use crate::remote;
use crate::transfer;
use crate::transport::CipTransport;

use super::archive::PackageArchive;
use super::{RESUME_MARKER, RUNTIME_PROCESS};

/// Full screen program hiding the desktop during the upgrade.
pub const COVER_EXE: &str = "FUWCover.exe";
/// Upgrade program launched once everything is staged.
pub const ENTRY_POINT: &str = "Upgrade.exe";
/// Package member listing terminal files to remove before staging.
pub const DELETE_LIST: &str = "delete.lst";
/// Drivers from other vendors, removed because the new image replaces them.
pub const THIRD_PARTY_DRIVERS: &str = "\\Storage Card\\Rockwell Software\\RSViewME\\Drivers\\ThirdParty";

/// Remote folder an upgrade file is staged into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeFolder {
    StorageCard,
    Windows,
}

impl UpgradeFolder {
    pub const ALL: [UpgradeFolder; 2] = [UpgradeFolder::StorageCard, UpgradeFolder::Windows];

    pub fn path(&self) -> &'static str {
        match self {
            UpgradeFolder::StorageCard => "\\Storage Card\\upgrade",
            UpgradeFolder::Windows => "\\Windows\\upgrade",
        }
    }

    /// Folder for a file the manifest does not list.
    pub fn for_unlisted(name: &str) -> Self {
        let lower = name.to_ascii_lowercase();
        if lower.starts_with("fuw") || lower.ends_with(".bin") || lower.ends_with(".exe") {
            UpgradeFolder::Windows
        } else {
            UpgradeFolder::StorageCard
        }
    }
}

impl fmt::Display for UpgradeFolder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.path())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ManifestEntry {
    pub name: &'static str,
    pub folder: UpgradeFolder,
    pub required: bool,
}

const fn entry(name: &'static str, folder: UpgradeFolder, required: bool) -> ManifestEntry {
    ManifestEntry {
        name,
        folder,
        required,
    }
}

use UpgradeFolder::{StorageCard, Windows};

/// Known upgrade files, in transfer order.
pub const MANIFEST: [ManifestEntry; 23] = [
    entry("Upgrade.exe", Windows, true),
    entry("UpgradeLib.dll", Windows, true),
    entry("FUWhelper.dll", Windows, true),
    entry("EBOOT.bin", Windows, true),
    entry("NK.bin", Windows, true),
    entry("KEYPAD.bin", Windows, false),
    entry("TOUCH.bin", Windows, false),
    entry("DISPLAY.bin", Windows, false),
    entry("BOOTLOGO.bin", Windows, false),
    entry("FPGA.bin", Windows, false),
    entry("Upgrade.inf", StorageCard, true),
    entry("Build.inf", StorageCard, true),
    entry("System.cab", StorageCard, true),
    entry("ME.cab", StorageCard, true),
    entry("MEFonts.cab", StorageCard, false),
    entry("MEHelp.cab", StorageCard, false),
    entry("KEPServer.cab", StorageCard, false),
    entry("Drivers.cab", StorageCard, false),
    entry("Browser.cab", StorageCard, false),
    entry("Viewer.cab", StorageCard, false),
    entry("PDFViewer.cab", StorageCard, false),
    entry("VNC.cab", StorageCard, false),
    entry("Legacy.cab", StorageCard, false),
];

/// One package member and where it goes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedFile {
    /// Name as stored in the package.
    pub member: String,
    pub remote_path: String,
}

/// What a legacy upgrade will do with a package.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LegacyPlan {
    pub cover: Option<StagedFile>,
    pub files: Vec<StagedFile>,
    /// Optional manifest files the package lacks.
    pub skipped: Vec<&'static str>,
    /// Terminal files named by the delete list.
    pub deletions: Vec<String>,
}

impl LegacyPlan {
    /// Matches a package against the manifest.
    ///
    /// Fails with a not-found error for the cover program or any missing
    /// required file.
    pub fn build(package: &mut dyn PackageArchive) -> Result<Self> {
        let mut plan = LegacyPlan::default();

        let cover = package
            .find(COVER_EXE)
            .ok_or_else(|| Error::not_found(ResourceKind::ArchiveMember, COVER_EXE))?;
        plan.cover = Some(StagedFile {
            remote_path: join(Windows.path(), &cover),
            member: cover,
        });

        for entry in MANIFEST {
            match package.find(entry.name) {
                Some(member) => plan.files.push(StagedFile {
                    remote_path: join(entry.folder.path(), &member),
                    member,
                }),
                None if entry.required => {
                    return Err(Error::not_found(ResourceKind::ArchiveMember, entry.name));
                }
                None => plan.skipped.push(entry.name),
            }
        }

        for member in package.member_names() {
            let known = member.eq_ignore_ascii_case(COVER_EXE)
                || member.eq_ignore_ascii_case(DELETE_LIST)
                || MANIFEST.iter().any(|e| e.name.eq_ignore_ascii_case(&member));
            if !known {
                let folder = UpgradeFolder::for_unlisted(&member);
                debug!(member = %member, folder = %folder, "Unlisted upgrade file");
                plan.files.push(StagedFile {
                    remote_path: join(folder.path(), &member),
                    member,
                });
            }
        }

        if let Some(list) = package.find(DELETE_LIST) {
            let text = package.read_member(&list)?;
            plan.deletions = String::from_utf8_lossy(&text)
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty() && !l.starts_with(';'))
                .map(str::to_string)
                .collect();
        }
        Ok(plan)
    }

    pub fn entry_point(&self) -> String {
        join(Windows.path(), ENTRY_POINT)
    }
}

/// Stages a legacy upgrade and launches it.
///
/// `paths.firmware_helper` must already be set.
#[instrument(skip_all)]
pub fn flash_legacy<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    paths: &DevicePaths,
    package: &mut dyn PackageArchive,
) -> Result<()> {
    let plan = LegacyPlan::build(package)?;
    for name in &plan.skipped {
        ctx.report.info(format!("Optional upgrade file {} not in package, skipped", name));
    }
    let dll = paths.helper_dll.as_str();
    let fw_dll = paths
        .firmware_helper
        .as_deref()
        .ok_or_else(|| Error::not_found(ResourceKind::Helper, super::helper::FIRMWARE_HELPER_NAME))?;

    ctx.report.phase(Phase::Upgrade);
    remote::set_screensaver(ctx, fw_dll, false)?;
    remote::set_corruption_warning(ctx, fw_dll, false)?;
    remote::stop_if_running(ctx, dll, RUNTIME_PROCESS)?;

    for folder in UpgradeFolder::ALL {
        if remote::folder_exists(ctx, dll, folder.path())? {
            remote::delete_folder(ctx, dll, folder.path())?;
        }
        remote::ensure_folder(ctx, dll, folder.path())?;
    }
    if remote::file_exists(ctx, dll, RESUME_MARKER)? {
        remote::delete_file(ctx, dll, RESUME_MARKER)?;
    }
    for path in &plan.deletions {
        if remote::file_exists(ctx, dll, path)? {
            remote::delete_file(ctx, dll, path)?;
        } else {
            debug!(path = %path, "Listed for deletion but absent");
        }
    }
    if remote::folder_exists(ctx, dll, THIRD_PARTY_DRIVERS)? {
        remote::delete_folder(ctx, dll, THIRD_PARTY_DRIVERS)?;
    }

    ctx.report.phase(Phase::Transfer);
    if let Some(cover) = &plan.cover {
        stage(ctx, package, cover)?;
        remote::start_process(ctx, fw_dll, &cover.remote_path)?;
    }
    remote::stop_if_running(ctx, dll, RUNTIME_PROCESS)?;

    for file in &plan.files {
        stage(ctx, package, file)?;
    }

    ctx.report.phase(Phase::Upgrade);
    remote::set_screensaver(ctx, fw_dll, true)?;
    remote::set_corruption_warning(ctx, fw_dll, true)?;
    let entry_point = plan.entry_point();
    remote::start_process(ctx, fw_dll, &entry_point)?;
    info!(files = plan.files.len(), "Legacy upgrade launched");
    ctx.report.info(format!("Launched {}", entry_point));
    Ok(())
}

fn stage<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    package: &mut dyn PackageArchive,
    file: &StagedFile,
) -> Result<()> {
    let data = package.read_member(&file.member)?;
    transfer::download_bytes(ctx, &data, &file.remote_path, false)
}
