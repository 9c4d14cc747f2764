//! Allow-lists of supported terminals.

use serde::{Deserialize, Serialize};

use super::identity::version_prefix;
use super::{DeviceInfo, Generation};

/// What one generation of terminals must report to be accepted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRules {
    /// Helper DLL versions, `major.minor`.
    pub helper_versions: Vec<String>,
    /// ME versions, `major.minor`.
    pub me_versions: Vec<String>,
    pub product_codes: Vec<u16>,
    pub product_types: Vec<u16>,
}

/// Allow-lists per generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TerminalCatalog {
    pub legacy: GenerationRules,
    pub modern: GenerationRules,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

impl Default for TerminalCatalog {
    fn default() -> Self {
        Self {
            legacy: GenerationRules {
                helper_versions: strings(&["3.00", "3.10", "3.20", "4.00", "4.10", "5.00", "5.10"]),
                me_versions: strings(&["3.00", "3.10", "3.20", "4.00", "4.10", "5.00", "5.10"]),
                product_codes: vec![0x0030, 0x0031, 0x0032, 0x0033, 0x0041, 0x0042, 0x0043],
                product_types: vec![24],
            },
            modern: GenerationRules {
                helper_versions: strings(&[
                    "6.00", "6.10", "7.00", "8.00", "8.10", "8.20", "9.00", "10.00", "11.00",
                    "12.00", "13.00", "14.00", "15.00",
                ]),
                me_versions: strings(&[
                    "6.00", "6.10", "7.00", "8.00", "8.10", "8.20", "9.00", "10.00", "11.00",
                    "12.00", "13.00", "14.00", "15.00",
                ]),
                product_codes: vec![
                    0x0051, 0x0052, 0x0053, 0x0061, 0x0062, 0x00B4, 0x00B5, 0x00C8, 0x00C9,
                    0x00CA, 0x0102, 0x0103,
                ],
                product_types: vec![24],
            },
        }
    }
}

impl TerminalCatalog {
    pub fn rules(&self, generation: Generation) -> &GenerationRules {
        match generation {
            Generation::Legacy => &self.legacy,
            Generation::Modern => &self.modern,
        }
    }

    /// Checks every rule, collecting all mismatches.
    pub fn check(&self, info: &DeviceInfo) -> ValidationReport {
        let rules = self.rules(info.generation());
        let mut failures = Vec::new();

        if !rules.product_types.contains(&info.identity.product_type) {
            failures.push(format!("product type {} is not supported", info.identity.product_type));
        }
        if !rules.product_codes.contains(&info.identity.product_code) {
            failures.push(format!("product code {} is not supported", info.identity.product_code));
        }
        let helper = version_prefix(&info.helper_version);
        if !rules.helper_versions.contains(&helper) {
            failures.push(format!("helper version {} is not supported", info.helper_version));
        }
        let me = version_prefix(&info.me_version);
        if !rules.me_versions.contains(&me) {
            failures.push(format!("ME version {} is not supported", info.me_version));
        }
        ValidationReport { failures }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ValidationReport {
    pub failures: Vec<String>,
}

impl ValidationReport {
    pub fn is_valid(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn summary(&self) -> String {
        self.failures.join("; ")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceIdentity, DevicePaths};

    fn info(me_version: &str, helper: &str, code: u16, product_type: u16) -> DeviceInfo {
        let major = me_version.split('.').next().unwrap().parse().unwrap();
        DeviceInfo {
            identity: DeviceIdentity {
                hardware_revision: None,
                major_revision: major as u8,
                minor_revision: 0,
                product_code: code,
                product_name: "PVP".into(),
                product_type,
                serial_number: 1,
                vendor_id: 1,
                status: 0,
            },
            me_version: me_version.into(),
            major_version: major,
            helper_version: helper.into(),
            paths: DevicePaths::for_major(major),
        }
    }

    #[test]
    fn test_listed_modern_terminal_is_valid() {
        let catalog = TerminalCatalog::default();
        let report = catalog.check(&info("11.00.25", "11.00.00", 0x00C8, 24));
        assert!(report.is_valid(), "{}", report.summary());
    }

    #[test]
    fn test_unlisted_product_code_is_invalid() {
        let catalog = TerminalCatalog::default();
        let report = catalog.check(&info("11.00.25", "11.00.00", 999, 24));
        assert!(!report.is_valid());
        assert_eq!(report.failures.len(), 1);
        assert!(report.failures[0].contains("999"));
    }

    #[test]
    fn test_rules_follow_generation() {
        let catalog = TerminalCatalog::default();
        // a modern product code on a legacy terminal
        let report = catalog.check(&info("5.10.00", "5.10.00", 0x00C8, 24));
        assert!(!report.is_valid());
        assert!(catalog.check(&info("5.10.00", "5.10.00", 0x0030, 24)).is_valid());
    }

    #[test]
    fn test_catalog_from_toml() {
        let catalog: TerminalCatalog = toml::from_str(
            r#"
            [modern]
            helper_versions = ["11.00"]
            me_versions = ["11.00"]
            product_codes = [999]
            product_types = [24]
            "#,
        )
        .unwrap();
        assert!(catalog.check(&info("11.00.25", "11.00.00", 999, 24)).is_valid());
        // omitted generation falls back to the compiled rules
        assert_eq!(catalog.legacy, TerminalCatalog::default().legacy);
    }
}
