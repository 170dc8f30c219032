use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use anyhow::Context;


#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Collaborator interface to the filesystem. Paths are the protocol's path strings; a
///  leading `@` marks a path relative to the store's configured root (the save/module
///  directory), which is also where plain relative paths land.
pub trait FileStore: Send + Sync + 'static {
    fn exists(&self, path: &str) -> bool;

    fn is_dir(&self, path: &str) -> bool;

    fn size(&self, path: &str) -> anyhow::Result<u64>;

    fn read(&self, path: &str) -> anyhow::Result<Vec<u8>>;

    /// Writes a chunk at the given offset, growing the file as needed.
    fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> anyhow::Result<()>;

    /// Length reconciliation: forces the file on disk to the announced size.
    fn set_len(&self, path: &str, len: u64) -> anyhow::Result<()>;

    fn mkdir(&self, path: &str) -> anyhow::Result<()>;

    fn copy(&self, from: &str, to: &str) -> anyhow::Result<()>;

    fn list_dir(&self, path: &str) -> anyhow::Result<Vec<DirEntry>>;
}


/// [FileStore] over std::fs, everything resolved below one root directory.
pub struct StdFileStore {
    root: PathBuf,
}

impl StdFileStore {
    pub fn new(root: impl Into<PathBuf>) -> StdFileStore {
        StdFileStore {
            root: root.into(),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        let relative = path.trim_start_matches('@').trim_start_matches('/');
        self.root.join(relative)
    }

    fn open_for_write(&self, path: &Path) -> anyhow::Result<File> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Ok(OpenOptions::new()
            .write(true)
            .create(true)
            .open(path)?)
    }
}

impl FileStore for StdFileStore {
    fn exists(&self, path: &str) -> bool {
        self.resolve(path).exists()
    }

    fn is_dir(&self, path: &str) -> bool {
        self.resolve(path).is_dir()
    }

    fn size(&self, path: &str) -> anyhow::Result<u64> {
        let resolved = self.resolve(path);
        Ok(std::fs::metadata(&resolved)
            .with_context(|| format!("no metadata for {:?}", resolved))?
            .len())
    }

    fn read(&self, path: &str) -> anyhow::Result<Vec<u8>> {
        let resolved = self.resolve(path);
        std::fs::read(&resolved)
            .with_context(|| format!("could not read {:?}", resolved))
    }

    fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        let mut file = self.open_for_write(&self.resolve(path))?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    fn set_len(&self, path: &str, len: u64) -> anyhow::Result<()> {
        let file = self.open_for_write(&self.resolve(path))?;
        file.set_len(len)?;
        Ok(())
    }

    fn mkdir(&self, path: &str) -> anyhow::Result<()> {
        std::fs::create_dir_all(self.resolve(path))?;
        Ok(())
    }

    fn copy(&self, from: &str, to: &str) -> anyhow::Result<()> {
        let to = self.resolve(to);
        if let Some(parent) = to.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::copy(self.resolve(from), to)?;
        Ok(())
    }

    fn list_dir(&self, path: &str) -> anyhow::Result<Vec<DirEntry>> {
        let resolved = self.resolve(path);
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&resolved)
            .with_context(|| format!("could not list {:?}", resolved))?
        {
            let entry = entry?;
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: entry.file_type()?.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}
