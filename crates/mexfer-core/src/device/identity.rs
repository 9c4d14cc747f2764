//! CIP identity and ME version queries.

use std::fmt;

use tracing::debug;

use crate::context::OpContext;
use crate::error::{Error, Result};
use crate::protocol::*;
use crate::remote;
use crate::transport::{CipRequest, CipTransport};

/// Snapshot of the terminal's identity object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    /// Missing on older hardware.
    pub hardware_revision: Option<u16>,
    pub major_revision: u8,
    pub minor_revision: u8,
    pub product_code: u16,
    pub product_name: String,
    pub product_type: u16,
    pub serial_number: u32,
    pub vendor_id: u16,
    pub status: u16,
}

impl DeviceIdentity {
    pub fn from_attributes(attributes: IdentityAttributes, hardware_revision: Option<u16>) -> Self {
        Self {
            hardware_revision,
            major_revision: attributes.major_revision,
            minor_revision: attributes.minor_revision,
            product_code: attributes.product_code,
            product_name: attributes.product_name,
            product_type: attributes.product_type,
            serial_number: attributes.serial_number,
            vendor_id: attributes.vendor_id,
            status: attributes.status,
        }
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (vendor {}, type {}, code {}, rev {}.{}, serial 0x{:08X})",
            self.product_name,
            self.vendor_id,
            self.product_type,
            self.product_code,
            self.major_revision,
            self.minor_revision,
            self.serial_number
        )
    }
}

/// Reads the identity object, then the hardware revision if the terminal
/// has it.
pub fn fetch_identity<T: CipTransport + ?Sized>(ctx: &mut OpContext<'_, T>) -> Result<DeviceIdentity> {
    let reply = ctx.send(
        &CipRequest::new(SVC_GET_ATTRIBUTES_ALL, CLASS_IDENTITY, IDENTITY_INSTANCE).unconnected(),
    )?;
    let attributes = IdentityAttributes::from_bytes(&reply)?;

    let hardware_revision = match ctx.send(
        &CipRequest::new(SVC_GET_ATTRIBUTE_SINGLE, CLASS_IDENTITY, IDENTITY_INSTANCE)
            .attribute(ATTR_HARDWARE_REVISION)
            .unconnected(),
    ) {
        Ok(bytes) if bytes.len() >= 2 => Some(u16::from_le_bytes([bytes[0], bytes[1]])),
        Ok(_) => None,
        Err(e) if e.is_disconnect() => return Err(e.into()),
        Err(e) => {
            debug!(error = %e, "No hardware revision attribute");
            None
        }
    };

    let identity = DeviceIdentity::from_attributes(attributes, hardware_revision);
    ctx.report.info(format!("Terminal: {}", identity));
    match identity.hardware_revision {
        Some(rev) => ctx.report.info(format!("Hardware revision {}", rev)),
        None => ctx
            .report
            .info("Hardware revision not reported, assuming native older hardware"),
    }
    Ok(identity)
}

/// Reads the ME version string from the registry.
pub fn fetch_me_version<T: CipTransport + ?Sized>(ctx: &mut OpContext<'_, T>) -> Result<String> {
    let version = remote::read_registry(ctx, REGISTRY_ME_VERSION)?;
    ctx.report.info(format!("ME version {}", version));
    Ok(version)
}

/// First dot separated component of a version string.
pub fn major_version(version: &str) -> Result<u32> {
    version
        .split('.')
        .next()
        .and_then(|m| m.trim().parse().ok())
        .ok_or_else(|| Error::Validation(format!("unparseable ME version '{}'", version)))
}

/// `major.minor` of a version string, used for allow-list matching.
pub fn version_prefix(version: &str) -> String {
    version
        .trim()
        .splitn(3, '.')
        .take(2)
        .collect::<Vec<_>>()
        .join(".")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device_log::DeviceLog;
    use crate::events::NullObserver;
    use crate::transport::MockTransport;

    #[test]
    fn test_version_helpers() {
        assert_eq!(major_version("11.00.25").unwrap(), 11);
        assert_eq!(major_version("5").unwrap(), 5);
        assert!(major_version("x.1").is_err());
        assert_eq!(version_prefix("11.00.25"), "11.00");
        assert_eq!(version_prefix("6.10"), "6.10");
    }

    #[test]
    fn test_identity_without_hardware_revision() {
        let mut mock = MockTransport::new().without_hardware_revision();
        mock.open().unwrap();
        let mut log = DeviceLog::new();
        let mut ctx = OpContext::new(&mut mock, &NullObserver, &mut log);
        let identity = fetch_identity(&mut ctx).unwrap();
        assert_eq!(identity.hardware_revision, None);
        assert_eq!(identity.product_type, 24);
        drop(ctx);
        assert!(log.entries().iter().any(|l| l.contains("assuming native")));
    }

    #[test]
    fn test_identity_with_hardware_revision() {
        let mut mock = MockTransport::new();
        mock.open().unwrap();
        let mut log = DeviceLog::new();
        let mut ctx = OpContext::new(&mut mock, &NullObserver, &mut log);
        let identity = fetch_identity(&mut ctx).unwrap();
        assert_eq!(identity.hardware_revision, Some(2));
        assert_eq!(identity.serial_number, 0x40A1_B2C3);
    }
}
