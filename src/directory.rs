//! Directory abstraction over the physical file system
//!
//! The engine assumes per-file write-once-then-immutable semantics and a
//! durable `sync`. Publishing a catalog generation relies on `rename`
//! being atomic and followed by a directory sync.

use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

use crate::error::{Result, TidepoolError};

/// Exclusive lock obtained from a directory. Dropping the guard releases
/// the lock; `release` reports errors instead of swallowing them.
pub trait DirectoryLock: Send {
    fn release(&mut self) -> Result<()>;
}

/// Abstract file-system collaborator for the engine.
///
/// Files are written once and never mutated in place; deletes and renames
/// are the only operations on existing names.
pub trait Directory: Send + Sync {
    fn list_all(&self) -> Result<Vec<String>>;

    fn read_file(&self, name: &str) -> Result<Vec<u8>>;

    fn write_file(&self, name: &str, data: &[u8]) -> Result<()>;

    fn delete_file(&self, name: &str) -> Result<()>;

    fn file_size(&self, name: &str) -> Result<u64>;

    /// Durably persist the named files.
    fn sync(&self, names: &[String]) -> Result<()>;

    /// Atomically rename `from` to `to` and durably record the rename.
    fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// Obtain an exclusive lock, waiting up to `timeout` before failing
    /// with `LockTimeout`.
    fn obtain_lock(&self, name: &str, timeout: Duration) -> Result<Box<dyn DirectoryLock>>;

    fn file_exists(&self, name: &str) -> Result<bool> {
        Ok(self.list_all()?.iter().any(|f| f == name))
    }
}

const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);

// ---------------------------------------------------------------------------
// Filesystem-backed directory

/// Directory backed by a real filesystem path.
pub struct FsDirectory {
    path: PathBuf,
}

impl FsDirectory {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        fs::create_dir_all(&path)?;
        Ok(Self {
            path: path.as_ref().to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn full_path(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    fn sync_dir(&self) -> Result<()> {
        // Windows cannot open directories for sync; the rename itself is
        // still atomic there.
        #[cfg(unix)]
        {
            File::open(&self.path)?.sync_all()?;
        }
        Ok(())
    }
}

impl Directory for FsDirectory {
    fn list_all(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.path)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }

    fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.full_path(name))?)
    }

    fn write_file(&self, name: &str, data: &[u8]) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.full_path(name))?;
        file.write_all(data)?;
        Ok(())
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        Ok(fs::remove_file(self.full_path(name))?)
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        Ok(fs::metadata(self.full_path(name))?.len())
    }

    fn sync(&self, names: &[String]) -> Result<()> {
        for name in names {
            File::open(self.full_path(name))?.sync_all()?;
        }
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        fs::rename(self.full_path(from), self.full_path(to))?;
        self.sync_dir()
    }

    fn obtain_lock(&self, name: &str, timeout: Duration) -> Result<Box<dyn DirectoryLock>> {
        let path = self.full_path(name);
        let start = Instant::now();
        loop {
            match OpenOptions::new().create_new(true).write(true).open(&path) {
                Ok(_) => {
                    return Ok(Box::new(FsLock {
                        path: path.clone(),
                        held: true,
                    }))
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    if start.elapsed() >= timeout {
                        return Err(TidepoolError::LockTimeout {
                            waited: start.elapsed(),
                        });
                    }
                    std::thread::sleep(LOCK_POLL_INTERVAL);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn file_exists(&self, name: &str) -> Result<bool> {
        Ok(self.full_path(name).exists())
    }
}

struct FsLock {
    path: PathBuf,
    held: bool,
}

impl DirectoryLock for FsLock {
    fn release(&mut self) -> Result<()> {
        if self.held {
            self.held = false;
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }
}

impl Drop for FsLock {
    fn drop(&mut self) {
        if self.held {
            let _ = fs::remove_file(&self.path);
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory directory

#[derive(Default)]
struct RamState {
    files: HashMap<String, Vec<u8>>,
    locks: HashSet<String>,
}

/// In-memory directory used by tests and as a source for external
/// segment imports.
#[derive(Default)]
pub struct RamDirectory {
    state: Arc<RwLock<RamState>>,
}

impl RamDirectory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Directory for RamDirectory {
    fn list_all(&self) -> Result<Vec<String>> {
        let state = self.state.read();
        let mut names: Vec<_> = state.files.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        self.state.read().files.get(name).cloned().ok_or_else(|| {
            TidepoolError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such file: {}", name),
            ))
        })
    }

    fn write_file(&self, name: &str, data: &[u8]) -> Result<()> {
        self.state
            .write()
            .files
            .insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn delete_file(&self, name: &str) -> Result<()> {
        match self.state.write().files.remove(name) {
            Some(_) => Ok(()),
            None => Err(TidepoolError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such file: {}", name),
            ))),
        }
    }

    fn file_size(&self, name: &str) -> Result<u64> {
        self.state
            .read()
            .files
            .get(name)
            .map(|d| d.len() as u64)
            .ok_or_else(|| {
                TidepoolError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    format!("no such file: {}", name),
                ))
            })
    }

    fn sync(&self, _names: &[String]) -> Result<()> {
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> Result<()> {
        let mut state = self.state.write();
        match state.files.remove(from) {
            Some(data) => {
                state.files.insert(to.to_string(), data);
                Ok(())
            }
            None => Err(TidepoolError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no such file: {}", from),
            ))),
        }
    }

    fn obtain_lock(&self, name: &str, timeout: Duration) -> Result<Box<dyn DirectoryLock>> {
        let start = Instant::now();
        loop {
            {
                let mut state = self.state.write();
                if state.locks.insert(name.to_string()) {
                    return Ok(Box::new(RamLock {
                        state: Arc::clone(&self.state),
                        name: name.to_string(),
                        held: true,
                    }));
                }
            }
            if start.elapsed() >= timeout {
                return Err(TidepoolError::LockTimeout {
                    waited: start.elapsed(),
                });
            }
            std::thread::sleep(LOCK_POLL_INTERVAL);
        }
    }

    fn file_exists(&self, name: &str) -> Result<bool> {
        Ok(self.state.read().files.contains_key(name))
    }
}

struct RamLock {
    state: Arc<RwLock<RamState>>,
    name: String,
    held: bool,
}

impl DirectoryLock for RamLock {
    fn release(&mut self) -> Result<()> {
        if self.held {
            self.held = false;
            self.state.write().locks.remove(&self.name);
        }
        Ok(())
    }
}

impl Drop for RamLock {
    fn drop(&mut self) {
        if self.held {
            self.state.write().locks.remove(&self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exercise_roundtrip(dir: &dyn Directory) {
        dir.write_file("a.bin", b"hello").unwrap();
        assert_eq!(dir.read_file("a.bin").unwrap(), b"hello");
        assert_eq!(dir.file_size("a.bin").unwrap(), 5);
        assert!(dir.file_exists("a.bin").unwrap());
        assert!(!dir.file_exists("b.bin").unwrap());

        dir.sync(&["a.bin".to_string()]).unwrap();
        dir.rename("a.bin", "b.bin").unwrap();
        assert!(!dir.file_exists("a.bin").unwrap());
        assert_eq!(dir.read_file("b.bin").unwrap(), b"hello");

        dir.delete_file("b.bin").unwrap();
        assert!(dir.list_all().unwrap().is_empty());
    }

    #[test]
    fn test_ram_directory_roundtrip() {
        exercise_roundtrip(&RamDirectory::new());
    }

    #[test]
    fn test_fs_directory_roundtrip() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = FsDirectory::open(tmp.path()).unwrap();
        exercise_roundtrip(&dir);
    }

    #[test]
    fn test_read_missing_file() {
        let dir = RamDirectory::new();
        assert!(dir.read_file("nope.bin").is_err());
    }

    #[test]
    fn test_lock_excludes_second_holder() {
        let dir = RamDirectory::new();
        let lock = dir
            .obtain_lock("write.lock", Duration::from_millis(50))
            .unwrap();

        let second = dir.obtain_lock("write.lock", Duration::from_millis(50));
        assert!(matches!(second, Err(TidepoolError::LockTimeout { .. })));

        drop(lock);
        let third = dir.obtain_lock("write.lock", Duration::from_millis(50));
        assert!(third.is_ok());
    }

    #[test]
    fn test_fs_lock_released_on_explicit_release() {
        let tmp = tempfile::TempDir::new().unwrap();
        let dir = FsDirectory::open(tmp.path()).unwrap();
        let mut lock = dir
            .obtain_lock("write.lock", Duration::from_millis(50))
            .unwrap();
        assert!(dir.file_exists("write.lock").unwrap());
        lock.release().unwrap();
        assert!(!dir.file_exists("write.lock").unwrap());
    }

    #[test]
    fn test_rename_is_observed_atomically() {
        let dir = RamDirectory::new();
        dir.write_file("cat_1.pending", b"payload").unwrap();
        dir.rename("cat_1.pending", "cat_1.bin").unwrap();
        let names = dir.list_all().unwrap();
        assert_eq!(names, vec!["cat_1.bin".to_string()]);
    }
}
