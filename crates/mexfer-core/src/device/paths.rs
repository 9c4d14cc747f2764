//! Generation dependent locations on the terminal filesystem.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Hardware/software generation of an ME terminal, derived from the ME
/// major version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Generation {
    /// ME 5 and older.
    Legacy,
    /// ME 6 and newer.
    Modern,
}

impl Generation {
    pub const LAST_LEGACY_MAJOR: u32 = 5;

    pub fn from_major(major: u32) -> Self {
        if major <= Self::LAST_LEGACY_MAJOR {
            Generation::Legacy
        } else {
            Generation::Modern
        }
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Generation::Legacy => write!(f, "legacy (v5 and older)"),
            Generation::Modern => write!(f, "modern (v6 and newer)"),
        }
    }
}

const LEGACY_HELPER_DLL: &str = "\\Storage Card\\Rockwell Software\\RSViewME\\RemoteHelper.DLL";
const LEGACY_STORAGE: &str = "\\Storage Card\\Rockwell Software\\RSViewME";
const MODERN_HELPER_DLL: &str = "\\Windows\\RemoteHelper.DLL";
const MODERN_STORAGE: &str = "\\Application Data\\Rockwell Software\\RSViewME";

/// Paths computed once from the reported ME version.
///
/// Only `firmware_helper` changes afterwards, when an upgrade discovers or
/// stages the firmware helper DLL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePaths {
    pub generation: Generation,
    /// Helper DLL serving the run function calls.
    pub helper_dll: String,
    /// Root of the ME file storage.
    pub storage: String,
    /// Folder holding runtime (`.mer`) applications.
    pub runtime: String,
    /// File the helper writes folder listings to.
    pub upload_list: String,
    pub firmware_helper: Option<String>,
}

impl DevicePaths {
    pub fn for_generation(generation: Generation) -> Self {
        let (helper_dll, storage) = match generation {
            Generation::Legacy => (LEGACY_HELPER_DLL, LEGACY_STORAGE),
            Generation::Modern => (MODERN_HELPER_DLL, MODERN_STORAGE),
        };
        let runtime = format!("{}\\Runtime", storage);
        Self {
            generation,
            helper_dll: helper_dll.to_string(),
            storage: storage.to_string(),
            upload_list: format!("{}\\Results.txt", runtime),
            runtime,
            firmware_helper: None,
        }
    }

    pub fn for_major(major: u32) -> Self {
        Self::for_generation(Generation::from_major(major))
    }

    /// Remote path of a runtime application file.
    pub fn runtime_file(&self, name: &str) -> String {
        join(&self.runtime, name)
    }
}

/// Joins a terminal folder and a name with a single backslash.
pub fn join(folder: &str, name: &str) -> String {
    format!(
        "{}\\{}",
        folder.trim_end_matches('\\'),
        name.trim_start_matches('\\')
    )
}

/// Parent folders of a terminal path, outermost first, excluding the root.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut current = String::new();
    for part in path.split('\\').filter(|p| !p.is_empty()) {
        current.push('\\');
        current.push_str(part);
        out.push(current.clone());
    }
    out
}

/// Final component of a terminal path.
pub fn file_name(path: &str) -> &str {
    path.rsplit('\\').next().unwrap_or(path)
}
