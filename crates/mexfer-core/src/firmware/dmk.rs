//! DMK card updates.
//!
//! A DMK package is a zip holding a contents header with catalog rules, an
//! NVS manifest listing the updates, and the update binaries. Each update is
//! written to an NVS object of the terminal in a fresh connected session:
//! a preamble bound to the terminal serial number opens it, then chunks go
//! to whatever offset the terminal asks for next until it reports the end.

use std::time::Duration;

use tracing::{debug, info, instrument, warn};

use crate::context::OpContext;
use crate::device::DeviceIdentity;
use crate::error::{Error, ResourceKind, Result};
use crate::events::Phase;
use crate::protocol::*;
use crate::remote::{self, RebootOutcome};
use crate::transport::{CipRequest, CipTransport};

use super::archive::PackageArchive;

/// Package member holding the catalog rules.
pub const CONTENTS_HEADER: &str = "ContentsHeader.txt";
pub const NVS_EXTENSION: &str = ".nvs";

/// Parsed INI text. Section and key lookups ignore case.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniDocument {
    sections: Vec<IniSection>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniSection {
    pub name: String,
    entries: Vec<(String, String)>,
}

impl IniSection {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(key))
            .map(|(_, v)| v.as_str())
    }
}

impl IniDocument {
    /// Lines outside any section and lines without `=` are ignored.
    pub fn parse(text: &str) -> Self {
        let mut doc = IniDocument::default();
        for line in text.lines() {
            let line = line.trim().trim_start_matches('\u{feff}');
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }
            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                doc.sections.push(IniSection {
                    name: name.trim().to_string(),
                    entries: Vec::new(),
                });
                continue;
            }
            let (Some(section), Some((key, value))) = (doc.sections.last_mut(), line.split_once('='))
            else {
                continue;
            };
            let value = value.trim().trim_matches('"');
            section
                .entries
                .push((key.trim().to_string(), value.to_string()));
        }
        doc
    }

    pub fn section(&self, name: &str) -> Option<&IniSection> {
        self.sections.iter().find(|s| s.name.eq_ignore_ascii_case(name))
    }

    pub fn sections(&self) -> impl Iterator<Item = &IniSection> {
        self.sections.iter()
    }
}

/// Decimal or `0x` hexadecimal.
fn parse_number(value: &str) -> Option<u64> {
    let value = value.trim();
    match value.strip_prefix("0x").or_else(|| value.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16).ok(),
        None => value.parse().ok(),
    }
}

fn number<N: TryFrom<u64>>(section: &IniSection, key: &str) -> Result<N> {
    let raw = section
        .get(key)
        .ok_or_else(|| Error::Package(format!("[{}] has no {}", section.name, key)))?;
    parse_number(raw)
        .and_then(|n| N::try_from(n).ok())
        .ok_or_else(|| Error::Package(format!("[{}] {} = '{}' is not a valid number", section.name, key, raw)))
}

fn number_or<N: TryFrom<u64>>(section: &IniSection, key: &str, default: N) -> Result<N> {
    match section.get(key) {
        Some(_) => number(section, key),
        None => Ok(default),
    }
}

/// Terminals a package applies to, compared under per-field masks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogRule {
    pub vendor_id: u16,
    pub vendor_id_mask: u16,
    pub product_type: u16,
    pub product_type_mask: u16,
    pub product_code: u16,
    pub product_code_mask: u16,
}

impl CatalogRule {
    fn from_section(section: &IniSection) -> Result<Self> {
        Ok(Self {
            vendor_id: number(section, "VendorID")?,
            vendor_id_mask: number_or(section, "VendorIDMask", u16::MAX)?,
            product_type: number(section, "ProductType")?,
            product_type_mask: number_or(section, "ProductTypeMask", u16::MAX)?,
            product_code: number(section, "ProductCode")?,
            product_code_mask: number_or(section, "ProductCodeMask", u16::MAX)?,
        })
    }

    pub fn matches(&self, identity: &DeviceIdentity) -> bool {
        identity.vendor_id & self.vendor_id_mask == self.vendor_id & self.vendor_id_mask
            && identity.product_type & self.product_type_mask
                == self.product_type & self.product_type_mask
            && identity.product_code & self.product_code_mask
                == self.product_code & self.product_code_mask
    }
}

/// One binary written to one NVS object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NvsUpdate {
    pub instance: u16,
    pub revision: String,
    pub max_timeout: Duration,
    /// Informational; the terminal directs the offsets.
    pub starting_location: u32,
    pub file_size: u64,
    pub file_name: String,
    pub reset_device: bool,
}

impl NvsUpdate {
    fn from_section(section: &IniSection) -> Result<Self> {
        let file_name = section
            .get("FileName")
            .filter(|f| !f.is_empty())
            .ok_or_else(|| Error::Package(format!("[{}] has no FileName", section.name)))?;
        let reset = section.get("ResetDevice").unwrap_or("no");
        Ok(Self {
            instance: number(section, "Instance")?,
            revision: section.get("Revision").unwrap_or_default().to_string(),
            max_timeout: Duration::from_secs(number_or(section, "MaxTimeout", 0)?),
            starting_location: number_or(section, "StartingLocation", 0)?,
            file_size: number(section, "FileSize")?,
            file_name: file_name.to_string(),
            reset_device: matches!(reset.to_ascii_lowercase().as_str(), "yes" | "true" | "1"),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DmkManifest {
    pub catalogs: Vec<CatalogRule>,
    /// Updates in the order they are applied.
    pub updates: Vec<NvsUpdate>,
}

impl DmkManifest {
    /// Parses the contents header and NVS manifest texts.
    pub fn parse(contents_header: &str, nvs_manifest: &str) -> Result<Self> {
        let contents = IniDocument::parse(contents_header);
        if contents.section("ContentsHeader").is_none() {
            return Err(Error::Package(format!("{} has no [ContentsHeader]", CONTENTS_HEADER)));
        }
        let catalogs = contents
            .sections()
            .filter(|s| is_numbered(&s.name, "Catalog"))
            .map(CatalogRule::from_section)
            .collect::<Result<Vec<_>>>()?;
        if catalogs.is_empty() {
            return Err(Error::Package(format!("{} lists no catalogs", CONTENTS_HEADER)));
        }

        let nvs = IniDocument::parse(nvs_manifest);
        let header = nvs
            .section("Header")
            .ok_or_else(|| Error::Package("NVS manifest has no [Header]".to_string()))?;
        let count: usize = number(header, "NumberOfUpdates")?;
        let updates = (1..=count)
            .map(|n| {
                let name = format!("Update{}", n);
                nvs.section(&name)
                    .ok_or_else(|| Error::Package(format!("NVS manifest has no [{}]", name)))
                    .and_then(NvsUpdate::from_section)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { catalogs, updates })
    }

    /// Reads both manifests from a package.
    pub fn from_package(package: &mut dyn PackageArchive) -> Result<Self> {
        let header_name = package
            .find(CONTENTS_HEADER)
            .ok_or_else(|| Error::not_found(ResourceKind::ArchiveMember, CONTENTS_HEADER))?;
        let nvs_name = package
            .member_names()
            .into_iter()
            .find(|m| m.to_ascii_lowercase().ends_with(NVS_EXTENSION))
            .ok_or_else(|| Error::not_found(ResourceKind::ArchiveMember, format!("*{}", NVS_EXTENSION)))?;
        debug!(nvs = %nvs_name, "DMK manifests");
        let header = package.read_member(&header_name)?;
        let nvs = package.read_member(&nvs_name)?;
        Self::parse(&String::from_utf8_lossy(&header), &String::from_utf8_lossy(&nvs))
    }

    /// Compares every declared size with the package member.
    pub fn validate_sizes(&self, package: &mut dyn PackageArchive) -> Result<()> {
        for update in &self.updates {
            if !package.contains(&update.file_name) {
                return Err(Error::not_found(ResourceKind::ArchiveMember, update.file_name.as_str()));
            }
            let actual = package.member_size(&update.file_name)?;
            if actual != update.file_size {
                return Err(Error::SizeMismatch {
                    file: update.file_name.clone(),
                    declared: update.file_size,
                    actual,
                });
            }
            if u32::try_from(actual).is_err() {
                return Err(Error::Package(format!("{} is too large", update.file_name)));
            }
        }
        Ok(())
    }

    /// First catalog rule matching the terminal.
    pub fn validate_for_terminal(&self, identity: &DeviceIdentity) -> Result<&CatalogRule> {
        self.catalogs
            .iter()
            .find(|rule| rule.matches(identity))
            .ok_or(Error::CatalogMismatch)
    }

    /// Longest declared update timeout.
    pub fn max_timeout(&self) -> Duration {
        self.updates
            .iter()
            .map(|u| u.max_timeout)
            .max()
            .unwrap_or_default()
    }
}

fn is_numbered(name: &str, prefix: &str) -> bool {
    name.len() > prefix.len()
        && name[..prefix.len()].eq_ignore_ascii_case(prefix)
        && name[prefix.len()..].chars().all(|c| c.is_ascii_digit())
}

/// A parsed package whose sizes have been checked.
pub struct DmkPackage {
    pub manifest: DmkManifest,
    pub archive: Box<dyn PackageArchive>,
}

impl DmkPackage {
    /// Parses and size-checks a package without touching the terminal.
    pub fn load(mut archive: Box<dyn PackageArchive>) -> Result<Self> {
        let manifest = DmkManifest::from_package(archive.as_mut())?;
        manifest.validate_sizes(archive.as_mut())?;
        Ok(Self { manifest, archive })
    }
}

/// Writes every update of a checked package to the terminal.
///
/// The catalog is checked first. With `dry_run` nothing is written. The
/// transport is reopened for each update and left closed at the end.
#[instrument(skip_all)]
pub fn flash_dmk<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    identity: &DeviceIdentity,
    package: &mut DmkPackage,
    flash_timeout: Duration,
    dry_run: bool,
) -> Result<()> {
    let rule = *package.manifest.validate_for_terminal(identity)?;
    debug!(?rule, "Catalog match");
    ctx.report.info(format!(
        "Package matches terminal, {} update(s)",
        package.manifest.updates.len()
    ));
    if dry_run {
        for update in &package.manifest.updates {
            ctx.report.info(format!(
                "Dry run: would write {} ({} bytes) to instance {}",
                update.file_name, update.file_size, update.instance
            ));
        }
        return Ok(());
    }

    ctx.report.phase(Phase::Upgrade);
    let updates = package.manifest.updates.clone();
    for (n, update) in updates.iter().enumerate() {
        ctx.report.info(format!(
            "Update {}/{}: {} revision {} to instance {} (start 0x{:X})",
            n + 1,
            updates.len(),
            update.file_name,
            update.revision,
            update.instance,
            update.starting_location
        ));
        let data = package.archive.read_member(&update.file_name)?;

        ctx.transport.close()?;
        ctx.transport.open()?;
        ctx.transport
            .set_timeout(flash_timeout.max(update.max_timeout))?;
        write_update(ctx, update, &data, identity.serial_number)?;
        ctx.transport.close()?;

        if update.reset_device {
            ctx.report.phase(Phase::Rebooting);
            ctx.transport.open()?;
            let outcome = remote::reset_device(ctx);
            if let RebootOutcome::Acknowledged = outcome {
                warn!(instance = update.instance, "Reset acknowledged without disconnect");
            }
            outcome.into_result()?;
            ctx.transport.close()?;
        }
    }
    info!(updates = updates.len(), "DMK update complete");
    Ok(())
}

fn write_update<T: CipTransport + ?Sized>(
    ctx: &mut OpContext<'_, T>,
    update: &NvsUpdate,
    data: &[u8],
    serial_number: u32,
) -> Result<()> {
    let preamble = FirmwarePreamble::new(data.len() as u32, serial_number).to_bytes();
    let reply = ctx.send(
        &CipRequest::new(SVC_FW_PREAMBLE, CLASS_NVS_UPDATE, update.instance).data(&preamble),
    )?;
    let response = PreambleResponse::from_bytes(&reply)?;
    response.check()?;
    let chunk_size = response.chunk_size as usize;
    debug!(instance = update.instance, chunk_size, "Preamble accepted");

    let description = format!("Writing {}", update.file_name);
    let total = data.len() as u64;
    let mut offset = 0u32;
    loop {
        let start = offset as usize;
        if start > data.len() || (start == data.len() && !data.is_empty()) {
            return Err(ProtocolError::FieldMismatch {
                field: "firmware next offset",
                expected: total,
                actual: u64::from(offset),
            }
            .into());
        }
        let end = (start + chunk_size).min(data.len());
        let payload = FirmwareChunkRequest {
            offset,
            data: &data[start..end],
        }
        .to_bytes();
        let reply = ctx.send(
            &CipRequest::new(SVC_FW_CHUNK, CLASS_NVS_UPDATE, update.instance).data(&payload),
        )?;
        let response = FirmwareChunkResponse::from_bytes(&reply)?;
        response.check(offset)?;
        debug!(offset, next = response.next_offset, "Firmware chunk");
        ctx.report.progress(&description, total, end as u64);
        if response.is_end_of_update() {
            break;
        }
        offset = response.next_offset;
    }
    ctx.report.info(format!(
        "Wrote {} bytes to instance {}",
        data.len(),
        update.instance
    ));
    Ok(())
}
