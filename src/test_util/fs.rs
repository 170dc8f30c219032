use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};

use anyhow::bail;

use crate::transfer::file_store::{DirEntry, FileStore};


fn norm(path: &str) -> String {
    path.trim_start_matches('@').trim_start_matches('/').to_string()
}

struct MemFs {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    /// directories whose listing fails, for error path tests
    poisoned: BTreeSet<String>,
    write_log: Vec<String>,
}

/// [FileStore] over an in-memory map, with a log of every chunk write for assertions on
///  what actually went over the wire.
pub struct MemFileStore {
    state: Mutex<MemFs>,
}

impl MemFileStore {
    pub fn new() -> Arc<MemFileStore> {
        Arc::new(MemFileStore {
            state: Mutex::new(MemFs {
                files: BTreeMap::new(),
                dirs: BTreeSet::new(),
                poisoned: BTreeSet::new(),
                write_log: Vec::new(),
            }),
        })
    }

    /// Seeds a file without going through the write log.
    pub fn put(&self, path: &str, contents: &[u8]) {
        self.state.lock().unwrap()
            .files
            .insert(norm(path), contents.to_vec());
    }

    pub fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.state.lock().unwrap()
            .files
            .get(&norm(path))
            .cloned()
    }

    /// The (normalized) paths of all `write_at` calls, in order.
    pub fn write_log(&self) -> Vec<String> {
        self.state.lock().unwrap().write_log.clone()
    }

    /// Makes listing this directory fail.
    pub fn poison_dir(&self, path: &str) {
        self.state.lock().unwrap()
            .poisoned
            .insert(norm(path));
    }
}

impl FileStore for MemFileStore {
    fn exists(&self, path: &str) -> bool {
        let state = self.state.lock().unwrap();
        let path = norm(path);
        state.files.contains_key(&path) || state.dirs.contains(&path)
    }

    fn is_dir(&self, path: &str) -> bool {
        self.state.lock().unwrap().dirs.contains(&norm(path))
    }

    fn size(&self, path: &str) -> anyhow::Result<u64> {
        match self.state.lock().unwrap().files.get(&norm(path)) {
            Some(contents) => Ok(contents.len() as u64),
            None => bail!("no such file: {:?}", path),
        }
    }

    fn read(&self, path: &str) -> anyhow::Result<Vec<u8>> {
        match self.state.lock().unwrap().files.get(&norm(path)) {
            Some(contents) => Ok(contents.clone()),
            None => bail!("no such file: {:?}", path),
        }
    }

    fn write_at(&self, path: &str, offset: u64, data: &[u8]) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let path = norm(path);

        let file = state.files.entry(path.clone()).or_default();
        let end = offset as usize + data.len();
        if file.len() < end {
            file.resize(end, 0);
        }
        file[offset as usize..end].copy_from_slice(data);

        state.write_log.push(path);
        Ok(())
    }

    fn set_len(&self, path: &str, len: u64) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.files.entry(norm(path)).or_default().resize(len as usize, 0);
        Ok(())
    }

    fn mkdir(&self, path: &str) -> anyhow::Result<()> {
        self.state.lock().unwrap().dirs.insert(norm(path));
        Ok(())
    }

    fn copy(&self, from: &str, to: &str) -> anyhow::Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(contents) = state.files.get(&norm(from)).cloned() else {
            bail!("no such file: {:?}", from);
        };
        state.files.insert(norm(to), contents);
        Ok(())
    }

    fn list_dir(&self, path: &str) -> anyhow::Result<Vec<DirEntry>> {
        let state = self.state.lock().unwrap();
        let path = norm(path);
        if state.poisoned.contains(&path) {
            bail!("could not list {:?}", path);
        }
        if !state.dirs.contains(&path) {
            bail!("not a directory: {:?}", path);
        }

        let prefix = format!("{}/", path);
        let direct_child = |key: &str| -> Option<String> {
            let rest = key.strip_prefix(&prefix)?;
            if rest.is_empty() || rest.contains('/') {
                return None;
            }
            Some(rest.to_string())
        };

        let mut entries = Vec::new();
        for key in state.files.keys() {
            if let Some(name) = direct_child(key) {
                entries.push(DirEntry { name, is_dir: false });
            }
        }
        for key in state.dirs.iter() {
            if let Some(name) = direct_child(key) {
                entries.push(DirEntry { name, is_dir: true });
            }
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}
