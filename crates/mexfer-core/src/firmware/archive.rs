//! Firmware package containers with named member access.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, Read, Seek};
use std::path::{Path, PathBuf};

use thiserror::Error;
use zip::ZipArchive;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("Zip error: {0}")]
    Zip(#[from] zip::result::ZipError),

    #[error("Package has no member named {0}")]
    MissingMember(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Random access to the named members of a firmware package.
///
/// Lookups are case-insensitive, matching the terminal's filesystem.
pub trait PackageArchive {
    /// Member names in package order.
    fn member_names(&self) -> Vec<String>;

    fn member_size(&mut self, name: &str) -> Result<u64, ArchiveError>;

    fn read_member(&mut self, name: &str) -> Result<Vec<u8>, ArchiveError>;

    /// Stored name of a member, looked up case-insensitively.
    fn find(&self, name: &str) -> Option<String> {
        self.member_names()
            .into_iter()
            .find(|m| m.eq_ignore_ascii_case(name))
    }

    fn contains(&self, name: &str) -> bool {
        self.find(name).is_some()
    }
}

/// Zip file package (DMK card updates).
pub struct ZipPackage<R: Read + Seek> {
    archive: ZipArchive<R>,
}

impl ZipPackage<File> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, ArchiveError> {
        Self::new(File::open(path)?)
    }
}

impl<R: Read + Seek> ZipPackage<R> {
    pub fn new(reader: R) -> Result<Self, ArchiveError> {
        Ok(Self {
            archive: ZipArchive::new(reader)?,
        })
    }

    fn stored_name(&self, name: &str) -> Result<String, ArchiveError> {
        self.find(name)
            .ok_or_else(|| ArchiveError::MissingMember(name.to_string()))
    }
}

impl<R: Read + Seek> PackageArchive for ZipPackage<R> {
    fn member_names(&self) -> Vec<String> {
        (0..self.archive.len())
            .filter_map(|i| self.archive.name_for_index(i))
            .filter(|n| !n.ends_with('/'))
            .map(str::to_string)
            .collect()
    }

    fn member_size(&mut self, name: &str) -> Result<u64, ArchiveError> {
        let stored = self.stored_name(name)?;
        Ok(self.archive.by_name(&stored)?.size())
    }

    fn read_member(&mut self, name: &str) -> Result<Vec<u8>, ArchiveError> {
        let stored = self.stored_name(name)?;
        let mut file = self.archive.by_name(&stored)?;
        let mut data = Vec::with_capacity(file.size() as usize);
        file.read_to_end(&mut data)?;
        Ok(data)
    }
}

/// Package held in memory.
#[derive(Debug, Default, Clone)]
pub struct MemoryPackage {
    members: Vec<(String, Vec<u8>)>,
}

impl MemoryPackage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_member(mut self, name: &str, data: impl Into<Vec<u8>>) -> Self {
        self.insert(name, data);
        self
    }

    pub fn insert(&mut self, name: &str, data: impl Into<Vec<u8>>) {
        let data = data.into();
        match self
            .members
            .iter_mut()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
        {
            Some(member) => member.1 = data,
            None => self.members.push((name.to_string(), data)),
        }
    }

    fn get(&self, name: &str) -> Result<&Vec<u8>, ArchiveError> {
        self.members
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, d)| d)
            .ok_or_else(|| ArchiveError::MissingMember(name.to_string()))
    }
}

impl PackageArchive for MemoryPackage {
    fn member_names(&self) -> Vec<String> {
        self.members.iter().map(|(n, _)| n.clone()).collect()
    }

    fn member_size(&mut self, name: &str) -> Result<u64, ArchiveError> {
        Ok(self.get(name)?.len() as u64)
    }

    fn read_member(&mut self, name: &str) -> Result<Vec<u8>, ArchiveError> {
        Ok(self.get(name)?.clone())
    }
}

/// Files directly inside a local folder (legacy upgrade packages).
#[derive(Debug, Clone)]
pub struct DirectoryPackage {
    root: PathBuf,
    files: BTreeMap<String, PathBuf>,
}

impl DirectoryPackage {
    pub fn open<P: AsRef<Path>>(root: P) -> Result<Self, ArchiveError> {
        let root = root.as_ref().to_path_buf();
        let mut files = BTreeMap::new();
        for entry in std::fs::read_dir(&root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                let name = entry.file_name().to_string_lossy().into_owned();
                files.insert(name, entry.path());
            }
        }
        Ok(Self { root, files })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_of(&self, name: &str) -> Result<&PathBuf, ArchiveError> {
        self.files
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, p)| p)
            .ok_or_else(|| ArchiveError::MissingMember(name.to_string()))
    }
}

impl PackageArchive for DirectoryPackage {
    fn member_names(&self) -> Vec<String> {
        self.files.keys().cloned().collect()
    }

    fn member_size(&mut self, name: &str) -> Result<u64, ArchiveError> {
        Ok(std::fs::metadata(self.path_of(name)?)?.len())
    }

    fn read_member(&mut self, name: &str) -> Result<Vec<u8>, ArchiveError> {
        Ok(std::fs::read(self.path_of(name)?)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use zip::write::SimpleFileOptions;

    fn zip_bytes(members: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = zip::ZipWriter::new(Cursor::new(Vec::new()));
        for (name, data) in members {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }

    #[test]
    fn test_zip_package_members() {
        let bytes = zip_bytes(&[("ContentsHeader.txt", b"[ContentsHeader]"), ("fw.bin", &[7u8; 1000])]);
        let mut package = ZipPackage::new(Cursor::new(bytes)).unwrap();
        assert_eq!(package.member_names(), vec!["ContentsHeader.txt", "fw.bin"]);
        assert_eq!(package.member_size("FW.BIN").unwrap(), 1000);
        assert_eq!(package.read_member("fw.bin").unwrap(), vec![7u8; 1000]);
        assert!(matches!(
            package.read_member("other.bin"),
            Err(ArchiveError::MissingMember(_))
        ));
    }

    #[test]
    fn test_memory_package_replaces_members() {
        let mut package = MemoryPackage::new().with_member("a.bin", vec![1]);
        package.insert("A.BIN", vec![1, 2]);
        assert_eq!(package.member_names(), vec!["a.bin"]);
        assert_eq!(package.member_size("a.bin").unwrap(), 2);
    }

    #[test]
    fn test_directory_package() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("NK.bin"), [1, 2, 3]).unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let mut package = DirectoryPackage::open(dir.path()).unwrap();
        assert_eq!(package.member_names(), vec!["NK.bin"]);
        assert_eq!(package.find("nk.BIN").as_deref(), Some("NK.bin"));
        assert_eq!(package.read_member("nk.bin").unwrap(), vec![1, 2, 3]);
    }
}
