//! Shared sub-reader pool
//!
//! At most one live `SegmentReader` instance exists per (segment,
//! delete-generation, update-generation) triple: readers opened at
//! different times that reference unchanged segments share the decoded
//! structures. The pool holds weak back-references for lookup only;
//! strong references are held by the readers themselves.

use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::directory::Directory;
use crate::error::Result;

use super::catalog::SegmentEntry;
use super::deleter::FileDeleter;
use super::reader::{reader_key, ReaderKey, SegmentReader};

#[derive(Default)]
pub struct ReaderPool {
    readers: DashMap<ReaderKey, Weak<SegmentReader>>,
}

impl ReaderPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the shared reader for this entry's generations, opening
    /// and caching one when none is alive.
    pub fn get_or_open(
        &self,
        dir: &Arc<dyn Directory>,
        entry: &SegmentEntry,
        deleter: &Arc<Mutex<FileDeleter>>,
    ) -> Result<Arc<SegmentReader>> {
        let key = reader_key(entry);
        if let Some(weak) = self.readers.get(&key) {
            if let Some(reader) = weak.upgrade() {
                return Ok(reader);
            }
        }
        let reader = Arc::new(SegmentReader::open(dir, entry, Some(Arc::clone(deleter)))?);
        self.readers.insert(key, Arc::downgrade(&reader));
        self.prune();
        Ok(reader)
    }

    /// Drop map entries whose reader has been released.
    pub fn prune(&self) {
        self.readers.retain(|_, weak| weak.strong_count() > 0);
    }

    /// Number of live cached sub-readers.
    pub fn live_count(&self) -> usize {
        self.readers
            .iter()
            .filter(|e| e.value().strong_count() > 0)
            .count()
    }

    pub fn clear(&self) {
        self.readers.clear();
    }
}
