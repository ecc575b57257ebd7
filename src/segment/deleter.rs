//! File reference counting
//!
//! Tracks how many holders (the writer's working set, the last durable
//! commit point, and every open segment reader) reference each index
//! file. A file whose count reaches zero is deleted from the directory;
//! files that cannot be deleted right now are retried on later passes.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::directory::Directory;

/// Reference-counted view of every file the engine may delete.
#[derive(Debug, Default)]
pub struct FileDeleter {
    counts: HashMap<String, usize>,
    /// Deletions that failed and should be retried
    pending_deletes: Vec<String>,
}

impl FileDeleter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one reference to each named file.
    pub fn inc_ref<I, S>(&mut self, files: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for file in files {
            *self.counts.entry(file.as_ref().to_string()).or_insert(0) += 1;
        }
    }

    /// Drop one reference from each named file, deleting files whose
    /// count reaches zero. Deletion failures are kept for retry.
    pub fn dec_ref<I, S>(&mut self, dir: &dyn Directory, files: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for file in files {
            let name = file.as_ref();
            let remove = match self.counts.get_mut(name) {
                Some(count) => {
                    *count = count.saturating_sub(1);
                    *count == 0
                }
                None => {
                    warn!(file = name, "dec_ref on untracked file");
                    false
                }
            };
            if remove {
                self.counts.remove(name);
                self.delete_now(dir, name.to_string());
            }
        }
        self.retry_pending(dir);
    }

    fn delete_now(&mut self, dir: &dyn Directory, name: String) {
        match dir.delete_file(&name) {
            Ok(()) => debug!(file = %name, "deleted unreferenced file"),
            Err(e) => {
                warn!(file = %name, error = %e, "deferring file delete");
                self.pending_deletes.push(name);
            }
        }
    }

    /// Retry deletions that failed earlier.
    pub fn retry_pending(&mut self, dir: &dyn Directory) {
        if self.pending_deletes.is_empty() {
            return;
        }
        let pending = std::mem::take(&mut self.pending_deletes);
        for name in pending {
            if dir.file_exists(&name).unwrap_or(false) {
                self.delete_now(dir, name);
            }
        }
    }

    pub fn ref_count(&self, file: &str) -> usize {
        self.counts.get(file).copied().unwrap_or(0)
    }

    pub fn tracked_files(&self) -> usize {
        self.counts.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::RamDirectory;

    #[test]
    fn test_file_survives_while_referenced() {
        let dir = RamDirectory::new();
        dir.write_file("seg_0.dat", b"x").unwrap();

        let mut deleter = FileDeleter::new();
        deleter.inc_ref(["seg_0.dat"]);
        deleter.inc_ref(["seg_0.dat"]);
        assert_eq!(deleter.ref_count("seg_0.dat"), 2);

        deleter.dec_ref(&dir, ["seg_0.dat"]);
        assert!(dir.file_exists("seg_0.dat").unwrap());

        deleter.dec_ref(&dir, ["seg_0.dat"]);
        assert!(!dir.file_exists("seg_0.dat").unwrap());
        assert_eq!(deleter.ref_count("seg_0.dat"), 0);
    }

    #[test]
    fn test_dec_ref_of_missing_file_is_retried_not_fatal() {
        let dir = RamDirectory::new();
        let mut deleter = FileDeleter::new();
        deleter.inc_ref(["ghost.dat"]);
        // The file never existed; the deferred delete must not wedge
        // later passes.
        deleter.dec_ref(&dir, ["ghost.dat"]);
        dir.write_file("seg_1.dat", b"x").unwrap();
        deleter.inc_ref(["seg_1.dat"]);
        deleter.dec_ref(&dir, ["seg_1.dat"]);
        assert!(!dir.file_exists("seg_1.dat").unwrap());
    }

    #[test]
    fn test_untracked_dec_ref_is_ignored() {
        let dir = RamDirectory::new();
        dir.write_file("keep.dat", b"x").unwrap();
        let mut deleter = FileDeleter::new();
        deleter.dec_ref(&dir, ["keep.dat"]);
        assert!(dir.file_exists("keep.dat").unwrap());
    }
}
