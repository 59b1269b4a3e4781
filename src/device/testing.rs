//! In-memory namespace used by the remote backend tests
//!
//! Errors are positive POSIX error numbers; each backend's test double
//! converts them into its own native status type.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Default)]
struct State {
    files: BTreeMap<String, Vec<u8>>,
    dirs: BTreeSet<String>,
    connects: usize,
    fail_connect: Option<i32>,
    fail_write: Option<i32>,
    ignore_truncate: bool,
}

/// Shared handle to a namespace of files and directories
#[derive(Clone, Default)]
pub struct MemoryFs {
    state: Arc<Mutex<State>>,
}

fn parent(path: &str) -> Option<&str> {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) | None => None,
        Some(index) => Some(&trimmed[..index]),
    }
}

impl MemoryFs {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count a connection, or fail it with the injected errno
    pub fn connect(&self) -> Result<(), i32> {
        let mut state = self.lock();
        if let Some(errno) = state.fail_connect {
            return Err(errno);
        }
        state.connects += 1;
        Ok(())
    }

    pub fn connects(&self) -> usize {
        self.lock().connects
    }

    pub fn fail_connect(&self, errno: i32) {
        self.lock().fail_connect = Some(errno);
    }

    pub fn fail_writes(&self, errno: i32) {
        self.lock().fail_write = Some(errno);
    }

    /// Make `truncate` report success without changing the size
    pub fn ignore_truncate(&self) {
        self.lock().ignore_truncate = true;
    }

    fn check_parent(state: &State, path: &str) -> Result<(), i32> {
        match parent(path) {
            Some(dir) if !state.dirs.contains(dir) => Err(libc::ENOENT),
            _ => Ok(()),
        }
    }

    pub fn stat(&self, path: &str) -> Result<u64, i32> {
        let state = self.lock();
        if state.dirs.contains(path) {
            return Err(libc::EISDIR);
        }
        state
            .files
            .get(path)
            .map(|data| data.len() as u64)
            .ok_or(libc::ENOENT)
    }

    pub fn mkdir(&self, path: &str) -> Result<(), i32> {
        let mut state = self.lock();
        Self::check_parent(&state, path)?;
        if state.dirs.contains(path) || state.files.contains_key(path) {
            return Err(libc::EEXIST);
        }
        state.dirs.insert(path.to_string());
        Ok(())
    }

    pub fn is_dir(&self, path: &str) -> bool {
        self.lock().dirs.contains(path)
    }

    /// Create an empty file, replacing existing content
    pub fn create(&self, path: &str) -> Result<(), i32> {
        let mut state = self.lock();
        Self::check_parent(&state, path)?;
        state.files.insert(path.to_string(), Vec::new());
        Ok(())
    }

    pub fn exists(&self, path: &str) -> bool {
        self.lock().files.contains_key(path)
    }

    pub fn contents(&self, path: &str) -> Option<Vec<u8>> {
        self.lock().files.get(path).cloned()
    }

    pub fn read_at(&self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize, i32> {
        let state = self.lock();
        let data = state.files.get(path).ok_or(libc::ENOENT)?;
        let start = (offset as usize).min(data.len());
        let n = buf.len().min(data.len() - start);
        buf[..n].copy_from_slice(&data[start..start + n]);
        Ok(n)
    }

    /// Write at `offset`, creating the file when `create` is set
    pub fn write_at(&self, path: &str, offset: u64, bytes: &[u8], create: bool) -> Result<usize, i32> {
        let mut state = self.lock();
        if let Some(errno) = state.fail_write {
            return Err(errno);
        }
        if create {
            Self::check_parent(&state, path)?;
            state.files.entry(path.to_string()).or_default();
        }
        let data = state.files.get_mut(path).ok_or(libc::ENOENT)?;
        let offset = offset as usize;
        if data.len() < offset + bytes.len() {
            data.resize(offset + bytes.len(), 0);
        }
        data[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(bytes.len())
    }

    pub fn remove(&self, path: &str) -> Result<(), i32> {
        self.lock().files.remove(path).map(|_| ()).ok_or(libc::ENOENT)
    }

    pub fn truncate(&self, path: &str, size: u64) -> Result<(), i32> {
        let mut state = self.lock();
        let ignore = state.ignore_truncate;
        let data = state.files.get_mut(path).ok_or(libc::ENOENT)?;
        if !ignore {
            data.resize(size as usize, 0);
        }
        Ok(())
    }
}

#[test]
fn test_memory_fs_parents() {
    let fs = MemoryFs::new();
    assert_eq!(fs.create("/a/Vol"), Err(libc::ENOENT));
    fs.mkdir("/a").unwrap();
    assert_eq!(fs.mkdir("/a"), Err(libc::EEXIST));
    fs.create("/a/Vol").unwrap();
    assert_eq!(fs.write_at("/a/Vol", 2, b"xy", false).unwrap(), 2);
    assert_eq!(fs.contents("/a/Vol").unwrap(), vec![0, 0, b'x', b'y']);
}
