//! Flush policy and buffer-to-segment conversion
//!
//! A flush policy observes aggregate RAM and per-buffer document counts
//! on every add/update/delete and decides whether one buffer should be
//! flushed. Flushing converts one buffer into one immutable pending
//! segment. An I/O failure here is aborting: the buffer is discarded
//! and no partial segment is ever registered.

use tracing::debug;

use crate::codec::Codec;
use crate::directory::Directory;
use crate::error::{Result, TidepoolError};

use super::buffer::ThreadBuffer;
use super::catalog::{SegmentEntry, SegmentInfo};
use super::types::SegmentId;

/// Aggregate indexing pressure observed after each operation.
#[derive(Clone, Copy, Debug, Default)]
pub struct FlushStats {
    pub ram_bytes: usize,
    pub largest_buffer_docs: u32,
    pub buffered_update_bytes: usize,
}

/// Decides, on every mutating call, whether a buffer should be flushed.
pub trait FlushPolicy: Send + Sync {
    fn should_flush(&self, stats: &FlushStats) -> bool;
}

/// Default policy: flush when aggregate buffered RAM or the largest
/// buffer's document count crosses a threshold.
#[derive(Clone, Debug)]
pub struct ThresholdFlushPolicy {
    pub max_ram_bytes: usize,
    pub max_buffer_docs: u32,
}

impl Default for ThresholdFlushPolicy {
    fn default() -> Self {
        Self {
            // 64MB
            max_ram_bytes: 64 * 1024 * 1024,
            // 10k docs per buffer
            max_buffer_docs: 10_000,
        }
    }
}

impl FlushPolicy for ThresholdFlushPolicy {
    fn should_flush(&self, stats: &FlushStats) -> bool {
        stats.ram_bytes >= self.max_ram_bytes || stats.largest_buffer_docs >= self.max_buffer_docs
    }
}

/// Convert one buffer into one immutable segment: write the base files
/// through the codec, write the initial live-docs file when the buffer
/// carried deletions, and sync everything before returning the entry.
///
/// Any failure is mapped to an aborting error; partial files are cleaned
/// up best-effort and nothing is registered.
pub fn flush_buffer(
    dir: &dyn Directory,
    codec: &dyn Codec,
    id: SegmentId,
    buffer: ThreadBuffer,
) -> Result<SegmentEntry> {
    let (data, live, max_seq) = buffer.into_segment_parts();

    let mut info = SegmentInfo {
        id,
        doc_count: data.doc_count,
        max_seq,
        codec: codec.name().to_string(),
        compound: false,
        size_bytes: 0,
        files: Vec::new(),
    };

    let mut written: Vec<String> = Vec::new();
    let result = (|| -> Result<SegmentEntry> {
        let files = codec.write_segment(dir, &info, &data)?;
        written.extend(files.iter().cloned());
        info.compound = files.len() == 1;
        info.files = files;

        let mut entry = SegmentEntry::new(info.clone());
        if live.deleted_count() > 0 {
            let name = codec.write_live_docs(dir, &info, 1, &live)?;
            written.push(name);
            entry.del_gen = 1;
            entry.del_count = live.deleted_count();
        }

        dir.sync(&written)?;

        let mut size = 0u64;
        for name in &entry.info.files {
            size += dir.file_size(name)?;
        }
        entry.info.size_bytes = size;
        Ok(entry)
    })();

    match result {
        Ok(entry) => {
            debug!(
                segment = %entry.info.name(),
                docs = entry.info.doc_count,
                deleted = entry.del_count,
                "flushed buffer to segment"
            );
            Ok(entry)
        }
        Err(e) => {
            for name in written {
                let _ = dir.delete_file(&name);
            }
            Err(TidepoolError::Aborting(format!(
                "flush of {} failed: {}",
                id, e
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::PlainCodec;
    use crate::directory::RamDirectory;
    use crate::segment::types::{Document, Term};

    #[test]
    fn test_threshold_policy() {
        let policy = ThresholdFlushPolicy {
            max_ram_bytes: 1000,
            max_buffer_docs: 10,
        };

        assert!(!policy.should_flush(&FlushStats {
            ram_bytes: 999,
            largest_buffer_docs: 9,
            buffered_update_bytes: 0,
        }));
        assert!(policy.should_flush(&FlushStats {
            ram_bytes: 1000,
            largest_buffer_docs: 0,
            buffered_update_bytes: 0,
        }));
        assert!(policy.should_flush(&FlushStats {
            ram_bytes: 0,
            largest_buffer_docs: 10,
            buffered_update_bytes: 0,
        }));
    }

    #[test]
    fn test_flush_clean_buffer() {
        let dir = RamDirectory::new();
        let mut buffer = ThreadBuffer::new();
        buffer
            .add_document(&Document::with_keyword("id", "a"), 1)
            .unwrap();
        buffer
            .add_document(&Document::with_keyword("id", "b"), 2)
            .unwrap();

        let entry = flush_buffer(&dir, &PlainCodec, SegmentId::new(0), buffer).unwrap();
        assert_eq!(entry.info.doc_count, 2);
        assert_eq!(entry.live_doc_count(), 2);
        assert_eq!(entry.del_gen, 0);
        assert_eq!(entry.info.max_seq, 2);
        assert!(entry.info.size_bytes > 0);
        assert!(dir.file_exists("seg_0.dat").unwrap());
    }

    #[test]
    fn test_flush_carries_buffered_deletes() {
        let dir = RamDirectory::new();
        let mut buffer = ThreadBuffer::new();
        buffer
            .add_document(&Document::with_keyword("id", "a"), 1)
            .unwrap();
        buffer
            .add_document(&Document::with_keyword("id", "b"), 2)
            .unwrap();
        buffer.apply_delete_term(&Term::new("id", "a"), 3);

        let entry = flush_buffer(&dir, &PlainCodec, SegmentId::new(1), buffer).unwrap();
        assert_eq!(entry.info.doc_count, 2);
        assert_eq!(entry.live_doc_count(), 1);
        assert_eq!(entry.del_gen, 1);
        assert!(dir.file_exists("seg_1_1.liv").unwrap());
    }

    #[test]
    fn test_flush_failure_is_aborting_and_leaves_no_files() {
        struct FailingDir {
            inner: RamDirectory,
        }

        impl Directory for FailingDir {
            fn list_all(&self) -> Result<Vec<String>> {
                self.inner.list_all()
            }
            fn read_file(&self, name: &str) -> Result<Vec<u8>> {
                self.inner.read_file(name)
            }
            fn write_file(&self, _name: &str, _data: &[u8]) -> Result<()> {
                Err(TidepoolError::Io(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )))
            }
            fn delete_file(&self, name: &str) -> Result<()> {
                self.inner.delete_file(name)
            }
            fn file_size(&self, name: &str) -> Result<u64> {
                self.inner.file_size(name)
            }
            fn sync(&self, names: &[String]) -> Result<()> {
                self.inner.sync(names)
            }
            fn rename(&self, from: &str, to: &str) -> Result<()> {
                self.inner.rename(from, to)
            }
            fn obtain_lock(
                &self,
                name: &str,
                timeout: std::time::Duration,
            ) -> Result<Box<dyn crate::directory::DirectoryLock>> {
                self.inner.obtain_lock(name, timeout)
            }
        }

        let dir = FailingDir {
            inner: RamDirectory::new(),
        };
        let mut buffer = ThreadBuffer::new();
        buffer
            .add_document(&Document::with_keyword("id", "a"), 1)
            .unwrap();

        let err = flush_buffer(&dir, &PlainCodec, SegmentId::new(2), buffer).unwrap_err();
        assert!(err.is_aborting());
        assert!(dir.list_all().unwrap().is_empty());
    }
}
