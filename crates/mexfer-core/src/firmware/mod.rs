//! Firmware upgrades.
//!
//! Three package kinds exist: a folder of upgrade files for legacy
//! terminals, a single card image for ME 6 and newer, and DMK card update
//! archives. Packages are prepared (parsed and checked locally) before the
//! terminal is contacted, then flashed with the transport timeout raised.

pub mod archive;
pub mod dmk;
pub mod helper;
pub mod legacy;
pub mod modern;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{info, instrument, warn};

use crate::config::SessionConfig;
use crate::context::OpContext;
use crate::device::{DeviceInfo, Generation};
use crate::error::{Error, ResourceKind, Result};
use crate::transport::CipTransport;

pub use archive::{ArchiveError, DirectoryPackage, MemoryPackage, PackageArchive, ZipPackage};
pub use dmk::{CatalogRule, DmkManifest, DmkPackage, NvsUpdate, flash_dmk};
pub use helper::ensure_firmware_helper;
pub use legacy::{LegacyPlan, UpgradeFolder, flash_legacy};
pub use modern::flash_card_image;

/// ME runtime process, stopped before upgrade files are staged.
pub const RUNTIME_PROCESS: &str = "MERuntime.exe";
/// Left behind by an interrupted upgrade; a stale one would resume it.
pub const RESUME_MARKER: &str = "\\Storage Card\\FUWResume.dat";

/// Where the firmware comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FirmwareSource {
    /// Folder of legacy upgrade files.
    Legacy(PathBuf),
    /// `SC.IMG` card image.
    CardImage(PathBuf),
    /// DMK card update archive.
    Dmk(PathBuf),
}

impl FirmwareSource {
    pub fn path(&self) -> &Path {
        match self {
            FirmwareSource::Legacy(p) | FirmwareSource::CardImage(p) | FirmwareSource::Dmk(p) => p,
        }
    }

    /// Opens and checks the package without contacting a terminal.
    pub fn prepare(&self) -> Result<PreparedFirmware> {
        let path = self.path();
        if !path.exists() {
            return Err(Error::not_found(ResourceKind::LocalFile, path.display().to_string()));
        }
        match self {
            FirmwareSource::Legacy(dir) => {
                let mut package = DirectoryPackage::open(dir)?;
                let plan = LegacyPlan::build(&mut package)?;
                Ok(PreparedFirmware::Legacy {
                    package: Box::new(package),
                    plan,
                })
            }
            FirmwareSource::CardImage(file) => Ok(PreparedFirmware::CardImage {
                size: std::fs::metadata(file)?.len(),
                path: file.clone(),
            }),
            FirmwareSource::Dmk(file) => Ok(PreparedFirmware::Dmk(DmkPackage::load(Box::new(
                ZipPackage::open(file)?,
            ))?)),
        }
    }
}

impl fmt::Display for FirmwareSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FirmwareSource::Legacy(p) => write!(f, "legacy upgrade {}", p.display()),
            FirmwareSource::CardImage(p) => write!(f, "card image {}", p.display()),
            FirmwareSource::Dmk(p) => write!(f, "DMK {}", p.display()),
        }
    }
}

/// A package ready to flash.
pub enum PreparedFirmware {
    Legacy {
        package: Box<dyn PackageArchive>,
        plan: LegacyPlan,
    },
    CardImage {
        path: PathBuf,
        size: u64,
    },
    Dmk(DmkPackage),
}

impl PreparedFirmware {
    fn operation(&self) -> &'static str {
        match self {
            PreparedFirmware::Legacy { .. } => "legacy upgrade",
            PreparedFirmware::CardImage { .. } => "card image upgrade",
            PreparedFirmware::Dmk(_) => "DMK update",
        }
    }

    /// Whether a terminal of this generation can take the package.
    pub fn supports(&self, generation: Generation) -> bool {
        match self {
            PreparedFirmware::Legacy { .. } => generation == Generation::Legacy,
            PreparedFirmware::CardImage { .. } => generation == Generation::Modern,
            PreparedFirmware::Dmk(_) => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashOptions {
    /// Local firmware helper DLL, staged when the terminal lacks one.
    pub helper: Option<PathBuf>,
    /// Check everything but write nothing.
    pub dry_run: bool,
    pub flash_timeout: Duration,
    pub helper_settle: Duration,
}

impl FlashOptions {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            helper: None,
            dry_run: false,
            flash_timeout: config.flash_timeout(),
            helper_settle: config.helper_settle(),
        }
    }

    pub fn with_helper(mut self, helper: Option<PathBuf>) -> Self {
        self.helper = helper;
        self
    }

    pub fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }
}

impl Default for FlashOptions {
    fn default() -> Self {
        Self::from_config(&SessionConfig::default())
    }
}

/// Flashes a prepared package to the terminal described by `info`.
///
/// The transport timeout is raised to the flash timeout for the duration and
/// restored afterwards, whatever the outcome.
#[instrument(skip_all, fields(generation = %info.generation()))]
pub fn flash_firmware<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    info: &mut DeviceInfo,
    firmware: &mut PreparedFirmware,
    options: &FlashOptions,
) -> Result<()> {
    if !firmware.supports(info.generation()) {
        ctx.report.error(format!(
            "A {} does not apply to {} terminals",
            firmware.operation(),
            info.generation()
        ));
        return Err(Error::UnsupportedGeneration {
            operation: firmware.operation(),
            major: info.major_version,
        });
    }

    if options.dry_run {
        if let Some(message) = dry_run_summary(firmware) {
            ctx.report.info(message);
            return Ok(());
        }
    }

    let previous = ctx.transport.timeout();
    ctx.transport.set_timeout(options.flash_timeout)?;
    info!(timeout_secs = options.flash_timeout.as_secs(), "Flash timeout set");

    let result = (|| -> Result<()> {
        match firmware {
            PreparedFirmware::Legacy { package, .. } => {
                ensure_firmware_helper(
                    ctx,
                    &mut info.paths,
                    options.helper.as_deref(),
                    options.helper_settle,
                )?;
                flash_legacy(ctx, &info.paths, package.as_mut())
            }
            PreparedFirmware::CardImage { path, .. } => {
                ensure_firmware_helper(
                    ctx,
                    &mut info.paths,
                    options.helper.as_deref(),
                    options.helper_settle,
                )?;
                flash_card_image(ctx, &info.paths, path)
            }
            PreparedFirmware::Dmk(package) => {
                // A dry run stages nothing, the helper included.
                if !options.dry_run {
                    ensure_firmware_helper(
                        ctx,
                        &mut info.paths,
                        options.helper.as_deref(),
                        options.helper_settle,
                    )?;
                }
                flash_dmk(
                    ctx,
                    &info.identity,
                    package,
                    options.flash_timeout,
                    options.dry_run,
                )
            }
        }
    })();

    if let Err(e) = ctx.transport.set_timeout(previous) {
        warn!(error = %e, "Could not restore the transport timeout");
    }
    result
}

/// What a dry run reports, or `None` when the flash itself handles it.
fn dry_run_summary(firmware: &PreparedFirmware) -> Option<String> {
    match firmware {
        PreparedFirmware::Legacy { plan, .. } => Some(format!(
            "Dry run: would stage {} upgrade files ({} optional missing) and delete {} listed files",
            plan.files.len() + usize::from(plan.cover.is_some()),
            plan.skipped.len(),
            plan.deletions.len()
        )),
        PreparedFirmware::CardImage { path, size } => Some(format!(
            "Dry run: would stage {} ({} bytes) as {}",
            path.display(),
            size,
            modern::card_image_path()
        )),
        PreparedFirmware::Dmk(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::query_device_info;
    use crate::device_log::DeviceLog;
    use crate::events::NullObserver;
    use crate::transport::MockTransport;

    fn options() -> FlashOptions {
        FlashOptions {
            helper: None,
            dry_run: false,
            flash_timeout: Duration::from_secs(600),
            helper_settle: Duration::ZERO,
        }
    }

    fn card_image(dir: &Path) -> PathBuf {
        let path = dir.join("SC.IMG");
        std::fs::write(&path, vec![7u8; 3000]).unwrap();
        path
    }

    #[test]
    fn test_missing_source() {
        let err = FirmwareSource::CardImage(PathBuf::from("/nonexistent/SC.IMG"))
            .prepare()
            .err()
            .unwrap();
        assert!(matches!(
            err,
            Error::NotFound {
                kind: ResourceKind::LocalFile,
                ..
            }
        ));
    }

    #[test]
    fn test_card_image_rejected_on_legacy_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let mut firmware = FirmwareSource::CardImage(card_image(dir.path())).prepare().unwrap();

        let mut mock = MockTransport::new().with_me_version("5.10.00");
        mock.open().unwrap();
        let mut log = DeviceLog::new();
        let mut ctx = OpContext::new(&mut mock, &NullObserver, &mut log);
        let mut info = query_device_info(&mut ctx).unwrap();

        let err = flash_firmware(&mut ctx, &mut info, &mut firmware, &options()).unwrap_err();
        assert!(matches!(err, Error::UnsupportedGeneration { major: 5, .. }));
    }

    #[test]
    fn test_card_image_flash_restores_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut firmware = FirmwareSource::CardImage(card_image(dir.path())).prepare().unwrap();

        let mut mock = MockTransport::new().with_file("\\Windows\\FUWhelper.dll", b"MZ".to_vec());
        mock.open().unwrap();
        let mut log = DeviceLog::new();
        let mut ctx = OpContext::new(&mut mock, &NullObserver, &mut log);
        let mut info = query_device_info(&mut ctx).unwrap();

        flash_firmware(&mut ctx, &mut info, &mut firmware, &options()).unwrap();
        drop(ctx);
        assert_eq!(info.paths.firmware_helper.as_deref(), Some("\\Windows\\FUWhelper.dll"));
        assert_eq!(mock.file(&modern::card_image_path()), Some(vec![7u8; 3000]));
        assert_eq!(
            mock.timeout_history(),
            vec![Duration::from_secs(600), Duration::from_secs(10)]
        );
    }

    #[test]
    fn test_card_image_without_helper_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut firmware = FirmwareSource::CardImage(card_image(dir.path())).prepare().unwrap();

        let mut mock = MockTransport::new();
        mock.open().unwrap();
        let mut log = DeviceLog::new();
        let mut ctx = OpContext::new(&mut mock, &NullObserver, &mut log);
        let mut info = query_device_info(&mut ctx).unwrap();

        let err = flash_firmware(&mut ctx, &mut info, &mut firmware, &options()).unwrap_err();
        assert!(err.is_not_found());
        drop(ctx);
        assert!(mock.file(&modern::card_image_path()).is_none());
        // timeout restored on failure too
        assert_eq!(mock.timeout_history().last(), Some(&Duration::from_secs(10)));
    }

    fn dmk_archive(dir: &Path) -> PathBuf {
        use std::io::Write;
        let path = dir.join("update.dmk");
        let mut writer = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
        let options = zip::write::SimpleFileOptions::default();
        writer.start_file(dmk::CONTENTS_HEADER, options).unwrap();
        writer
            .write_all(b"[ContentsHeader]\n[Catalog1]\nVendorID=1\nProductType=24\nProductCode=200\n")
            .unwrap();
        writer.start_file("fw.nvs", options).unwrap();
        writer
            .write_all(b"[Header]\nNumberOfUpdates=1\n[Update1]\nInstance=3\nFileSize=600\nFileName=fw.bin\n")
            .unwrap();
        writer.start_file("fw.bin", options).unwrap();
        writer.write_all(&[0x5Au8; 600]).unwrap();
        writer.finish().unwrap();
        path
    }

    #[test]
    fn test_dmk_without_helper_fails() {
        let dir = tempfile::tempdir().unwrap();
        let mut firmware = FirmwareSource::Dmk(dmk_archive(dir.path())).prepare().unwrap();

        let mut mock = MockTransport::new();
        mock.open().unwrap();
        let mut log = DeviceLog::new();
        let mut ctx = OpContext::new(&mut mock, &NullObserver, &mut log);
        let mut info = query_device_info(&mut ctx).unwrap();

        let err = flash_firmware(&mut ctx, &mut info, &mut firmware, &options()).unwrap_err();
        assert!(err.is_not_found());
        drop(ctx);
        assert!(mock.flashed().is_empty());
        assert_eq!(mock.timeout_history().last(), Some(&Duration::from_secs(10)));
    }

    #[test]
    fn test_dmk_stages_helper_before_update() {
        let dir = tempfile::tempdir().unwrap();
        let mut firmware = FirmwareSource::Dmk(dmk_archive(dir.path())).prepare().unwrap();
        let helper_file = dir.path().join("FUWhelper.dll");
        std::fs::write(&helper_file, b"MZhelper").unwrap();

        let mut mock = MockTransport::new();
        mock.open().unwrap();
        let mut log = DeviceLog::new();
        let mut ctx = OpContext::new(&mut mock, &NullObserver, &mut log);
        let mut info = query_device_info(&mut ctx).unwrap();

        let options = options().with_helper(Some(helper_file));
        flash_firmware(&mut ctx, &mut info, &mut firmware, &options).unwrap();
        drop(ctx);
        assert_eq!(
            mock.file(helper::FIRMWARE_HELPER_STAGING),
            Some(b"MZhelper".to_vec())
        );
        assert_eq!(
            info.paths.firmware_helper.as_deref(),
            Some(helper::FIRMWARE_HELPER_STAGING)
        );
        assert_eq!(mock.flashed().len(), 1);
        assert_eq!(mock.flashed()[0].data, vec![0x5Au8; 600]);
    }

    #[test]
    fn test_dry_run_card_image_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let mut firmware = FirmwareSource::CardImage(card_image(dir.path())).prepare().unwrap();

        let mut mock = MockTransport::new();
        mock.open().unwrap();
        let mut log = DeviceLog::new();
        let mut ctx = OpContext::new(&mut mock, &NullObserver, &mut log);
        let mut info = query_device_info(&mut ctx).unwrap();
        ctx.transport.clear_requests();

        flash_firmware(&mut ctx, &mut info, &mut firmware, &options().dry_run(true)).unwrap();
        drop(ctx);
        assert!(mock.requests().is_empty());
        assert!(log.entries().iter().any(|l| l.starts_with("Dry run")));
    }

    #[test]
    fn test_legacy_folder_flash() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(legacy::COVER_EXE), b"cover").unwrap();
        for entry in legacy::MANIFEST.iter().filter(|e| e.required) {
            std::fs::write(dir.path().join(entry.name), entry.name).unwrap();
        }
        let mut firmware = FirmwareSource::Legacy(dir.path().to_path_buf()).prepare().unwrap();

        let mut mock = MockTransport::new()
            .with_me_version("5.10.00")
            .with_file("\\Storage Card\\FUWhelper.dll", b"MZ".to_vec());
        mock.open().unwrap();
        let mut log = DeviceLog::new();
        let mut ctx = OpContext::new(&mut mock, &NullObserver, &mut log);
        let mut info = query_device_info(&mut ctx).unwrap();

        flash_firmware(&mut ctx, &mut info, &mut firmware, &options()).unwrap();
        drop(ctx);
        assert!(mock.is_running(legacy::ENTRY_POINT));
        assert_eq!(mock.file("\\Windows\\upgrade\\EBOOT.bin"), Some(b"EBOOT.bin".to_vec()));
    }

    #[test]
    fn test_dmk_size_mismatch_fails_before_any_request() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.dmk");
        {
            use std::io::Write;
            let mut writer = zip::ZipWriter::new(std::fs::File::create(&path).unwrap());
            let options = zip::write::SimpleFileOptions::default();
            writer.start_file(dmk::CONTENTS_HEADER, options).unwrap();
            writer
                .write_all(b"[ContentsHeader]\n[Catalog1]\nVendorID=1\nProductType=24\nProductCode=200\n")
                .unwrap();
            writer.start_file("fw.nvs", options).unwrap();
            writer
                .write_all(b"[Header]\nNumberOfUpdates=1\n[Update1]\nInstance=3\nFileSize=1000\nFileName=fw.bin\n")
                .unwrap();
            writer.start_file("fw.bin", options).unwrap();
            writer.write_all(&[0u8; 999]).unwrap();
            writer.finish().unwrap();
        }
        let err = FirmwareSource::Dmk(path).prepare().err().unwrap();
        assert!(matches!(
            err,
            Error::SizeMismatch {
                declared: 1000,
                actual: 999,
                ..
            }
        ));
    }
}
