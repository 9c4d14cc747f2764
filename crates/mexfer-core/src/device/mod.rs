//! Terminal identity, generation dependent paths and validation.

pub mod identity;
pub mod paths;
pub mod validation;

use std::fmt;

use tracing::{instrument, warn};

use crate::context::OpContext;
use crate::error::{Error, Result};
use crate::events::Phase;
use crate::remote;
use crate::transport::CipTransport;

pub use identity::{DeviceIdentity, fetch_identity, fetch_me_version, major_version, version_prefix};
pub use paths::{DevicePaths, Generation};
pub use validation::{GenerationRules, TerminalCatalog, ValidationReport};

/// Everything queried from a terminal at the start of an operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub identity: DeviceIdentity,
    pub me_version: String,
    pub major_version: u32,
    pub helper_version: String,
    pub paths: DevicePaths,
}

impl DeviceInfo {
    pub fn generation(&self) -> Generation {
        self.paths.generation
    }
}

impl fmt::Display for DeviceInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Product:        {}", self.identity.product_name)?;
        writeln!(f, "Vendor ID:      {}", self.identity.vendor_id)?;
        writeln!(f, "Product type:   {}", self.identity.product_type)?;
        writeln!(f, "Product code:   {}", self.identity.product_code)?;
        writeln!(
            f,
            "Revision:       {}.{}",
            self.identity.major_revision, self.identity.minor_revision
        )?;
        match self.identity.hardware_revision {
            Some(rev) => writeln!(f, "Hardware rev:   {}", rev)?,
            None => writeln!(f, "Hardware rev:   (not reported)")?,
        }
        writeln!(f, "Serial number:  0x{:08X}", self.identity.serial_number)?;
        writeln!(f, "Status:         0x{:04X}", self.identity.status)?;
        writeln!(f, "ME version:     {}", self.me_version)?;
        writeln!(f, "Helper version: {}", self.helper_version)?;
        write!(f, "Generation:     {}", self.generation())
    }
}

/// Queries identity, ME version, paths and helper version.
#[instrument(skip(ctx))]
pub fn query_device_info<T: CipTransport + ?Sized>(ctx: &mut OpContext<'_, T>) -> Result<DeviceInfo> {
    ctx.report.phase(Phase::Identify);
    let identity = fetch_identity(ctx)?;
    let me_version = fetch_me_version(ctx)?;
    let major = major_version(&me_version)?;
    let paths = DevicePaths::for_major(major);
    ctx.report.info(format!("Generation: {}", paths.generation));
    let helper_version = remote::helper_version(ctx, &paths.helper_dll)?;
    ctx.report.info(format!("Helper version {}", helper_version));
    Ok(DeviceInfo {
        identity,
        me_version,
        major_version: major,
        helper_version,
        paths,
    })
}

pub fn is_valid_me_terminal(info: &DeviceInfo, catalog: &TerminalCatalog) -> bool {
    catalog.check(info).is_valid()
}

/// Validates the terminal, failing unless `ignore_invalid` is set.
///
/// With `ignore_invalid` a failed check is logged as a warning and the
/// report is returned.
pub fn validate<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    info: &DeviceInfo,
    catalog: &TerminalCatalog,
    ignore_invalid: bool,
) -> Result<ValidationReport> {
    ctx.report.phase(Phase::Validate);
    let report = catalog.check(info);
    if report.is_valid() {
        ctx.report.info("Terminal is a supported ME terminal");
        return Ok(report);
    }
    for failure in &report.failures {
        ctx.report.warn(format!("Validation: {}", failure));
    }
    if ignore_invalid {
        warn!(failures = %report.summary(), "Continuing with unsupported terminal");
        ctx.report
            .warn("Terminal failed validation, continuing because invalid terminals are ignored");
        return Ok(report);
    }
    ctx.report.error("Terminal failed validation");
    Err(Error::Validation(report.summary()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_log::DeviceLog;
    use crate::events::NullObserver;
    use crate::transport::MockTransport;

    #[test]
    fn test_query_modern_terminal() {
        let mut mock = MockTransport::new();
        mock.open().unwrap();
        let mut log = DeviceLog::new();
        let mut ctx = OpContext::new(&mut mock, &NullObserver, &mut log);
        let info = query_device_info(&mut ctx).unwrap();
        assert_eq!(info.major_version, 11);
        assert_eq!(info.generation(), Generation::Modern);
        assert_eq!(info.helper_version, "11.00.00");
        assert!(is_valid_me_terminal(&info, &TerminalCatalog::default()));
    }

    #[test]
    fn test_query_legacy_terminal_uses_storage_card_helper() {
        let mut mock = MockTransport::new()
            .with_me_version("5.10.00")
            .with_helper_version("5.10.01")
            .with_product_code(0x0030);
        mock.open().unwrap();
        let mut log = DeviceLog::new();
        let mut ctx = OpContext::new(&mut mock, &NullObserver, &mut log);
        let info = query_device_info(&mut ctx).unwrap();
        assert_eq!(info.generation(), Generation::Legacy);
        assert!(info.paths.helper_dll.starts_with("\\Storage Card"));
        assert!(is_valid_me_terminal(&info, &TerminalCatalog::default()));
    }

    #[test]
    fn test_validate_soft_and_hard() {
        let mut mock = MockTransport::new().with_product_code(999);
        mock.open().unwrap();
        let mut log = DeviceLog::new();
        let mut ctx = OpContext::new(&mut mock, &NullObserver, &mut log);
        let info = query_device_info(&mut ctx).unwrap();
        let catalog = TerminalCatalog::default();

        assert!(matches!(
            validate(&mut ctx, &info, &catalog, false),
            Err(Error::Validation(_))
        ));
        let report = validate(&mut ctx, &info, &catalog, true).unwrap();
        assert!(!report.is_valid());
        drop(ctx);
        assert!(log.entries().iter().any(|l| l.starts_with("WARN: Terminal failed validation")));
    }
}
