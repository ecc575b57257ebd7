//! Point-in-time readers
//!
//! A `SegmentReader` is an immutable view of one segment pinned to a
//! specific (segment, delete-generation, update-generation) triple. An
//! `IndexReader` composes sub-readers into a reference-counted snapshot
//! of the whole index; deletes and updates applied after it was opened
//! are invisible to it.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwapOption;
use parking_lot::Mutex;

use crate::codec::{resolve_codec, SegmentData};
use crate::directory::Directory;
use crate::error::{Result, TidepoolError};

use super::catalog::{SegmentCatalog, SegmentEntry};
use super::deleter::FileDeleter;
use super::live_docs::LiveDocs;
use super::types::{DocNo, FieldValue, Generation, Term};
use super::updates::{DocValueView, FieldUpdates};
use super::writer::WriterCore;

/// Identity of a sub-reader: (segment id, delete gen, update gen).
pub type ReaderKey = (u64, Generation, Generation);

pub fn reader_key(entry: &SegmentEntry) -> ReaderKey {
    (entry.id().0, entry.del_gen, entry.update_gen)
}

struct ReaderRetain {
    dir: Arc<dyn Directory>,
    deleter: Arc<Mutex<FileDeleter>>,
    files: Vec<String>,
}

/// Immutable per-segment reader.
pub struct SegmentReader {
    entry: SegmentEntry,
    data: SegmentData,
    live: Option<LiveDocs>,
    updates: Option<FieldUpdates>,
    retain: Option<ReaderRetain>,
}

impl std::fmt::Debug for SegmentReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentReader").finish_non_exhaustive()
    }
}

impl SegmentReader {
    /// Decode a segment at the generations recorded in `entry`. When a
    /// deleter is supplied the reader holds one reference on each of its
    /// files until dropped.
    pub fn open(
        dir: &Arc<dyn Directory>,
        entry: &SegmentEntry,
        deleter: Option<Arc<Mutex<FileDeleter>>>,
    ) -> Result<SegmentReader> {
        let codec = resolve_codec(&entry.info.codec)?;
        let data = codec.read_segment(dir.as_ref(), &entry.info)?;
        let live = if entry.del_gen > 0 {
            Some(codec.read_live_docs(dir.as_ref(), &entry.info, entry.del_gen)?)
        } else {
            None
        };
        let updates = if entry.update_gen > 0 {
            Some(codec.read_field_updates(dir.as_ref(), &entry.info, entry.update_gen)?)
        } else {
            None
        };

        let retain = deleter.map(|deleter| {
            let files = entry.all_files();
            deleter.lock().inc_ref(&files);
            ReaderRetain {
                dir: Arc::clone(dir),
                deleter,
                files,
            }
        });

        Ok(SegmentReader {
            entry: entry.clone(),
            data,
            live,
            updates,
            retain,
        })
    }

    pub fn key(&self) -> ReaderKey {
        reader_key(&self.entry)
    }

    pub fn entry(&self) -> &SegmentEntry {
        &self.entry
    }

    pub fn doc_count(&self) -> u32 {
        self.entry.info.doc_count
    }

    pub fn live_doc_count(&self) -> u32 {
        match &self.live {
            Some(live) => live.live_count(),
            None => self.entry.info.doc_count,
        }
    }

    pub fn is_live(&self, docno: DocNo) -> bool {
        match &self.live {
            Some(live) => live.is_live(docno),
            None => docno.as_u32() < self.entry.info.doc_count,
        }
    }

    /// Snapshot of the liveness bitmap this reader was opened with.
    pub fn live_docs(&self) -> LiveDocs {
        match &self.live {
            Some(live) => live.clone(),
            None => LiveDocs::new(self.entry.info.doc_count),
        }
    }

    /// All docnos indexed under `term`, including deleted ones.
    pub fn docs_for_term(&self, term: &Term) -> Vec<DocNo> {
        self.data
            .docs_for_term(term)
            .iter()
            .map(|d| DocNo::new(*d))
            .collect()
    }

    /// Live docnos indexed under `term`.
    pub fn live_docs_for_term(&self, term: &Term) -> Vec<DocNo> {
        self.docs_for_term(term)
            .into_iter()
            .filter(|d| self.is_live(*d))
            .collect()
    }

    /// Every term in the segment with its raw postings (merge input).
    pub fn terms(&self) -> impl Iterator<Item = (&Term, &Vec<u32>)> {
        self.data.postings.iter()
    }

    /// Names of every stored-value field in the segment.
    pub fn field_names(&self) -> impl Iterator<Item = &String> {
        self.data.doc_values.keys()
    }
}

impl DocValueView for SegmentReader {
    fn doc_count(&self) -> u32 {
        self.entry.info.doc_count
    }

    /// Stored value with the field-update overlay applied: an updated
    /// value wins over the flushed one.
    fn value(&self, field: &str, docno: DocNo) -> Option<FieldValue> {
        if let Some(updates) = &self.updates {
            if let Some(v) = updates.get(field, docno.as_u32()) {
                return Some(v.clone());
            }
        }
        self.data.value(field, docno.as_u32()).cloned()
    }
}

impl Drop for SegmentReader {
    fn drop(&mut self) {
        if let Some(retain) = &self.retain {
            retain
                .deleter
                .lock()
                .dec_ref(retain.dir.as_ref(), &retain.files);
        }
    }
}

enum ReaderSource {
    Committed {
        dir: Arc<dyn Directory>,
    },
    NearRealTime {
        writer: Weak<WriterCore>,
        dir: Arc<dyn Directory>,
        apply_all_deletes: bool,
    },
}

/// A reference-counted, immutable multi-segment snapshot.
pub struct IndexReader {
    segments: ArcSwapOption<Vec<Arc<SegmentReader>>>,
    refs: AtomicU32,
    version: u64,
    generation: Generation,
    user_data: BTreeMap<String, String>,
    max_doc: u32,
    num_docs: u32,
    source: ReaderSource,
}

impl IndexReader {
    /// Open the latest durable commit point.
    pub fn open(dir: Arc<dyn Directory>) -> Result<Arc<IndexReader>> {
        Self::open_committed(dir, None)
    }

    fn open_committed(
        dir: Arc<dyn Directory>,
        reuse: Option<&IndexReader>,
    ) -> Result<Arc<IndexReader>> {
        let catalog = SegmentCatalog::load(dir.as_ref())?;
        let mut segments = Vec::with_capacity(catalog.entries.len());
        for entry in &catalog.entries {
            let key = reader_key(entry);
            let shared = reuse.and_then(|r| r.segment_with_key(key));
            let reader = match shared {
                Some(existing) => existing,
                None => Arc::new(SegmentReader::open(&dir, entry, None)?),
            };
            segments.push(reader);
        }
        Ok(Self::assemble(
            segments,
            catalog.generation,
            catalog.generation,
            catalog.user_data,
            ReaderSource::Committed { dir },
        ))
    }

    /// Snapshot of the writer's committed plus pending state. Built by
    /// the writer; exposed here so reader and writer share one assembly
    /// path.
    pub(crate) fn new_near_real_time(
        writer: Weak<WriterCore>,
        dir: Arc<dyn Directory>,
        segments: Vec<Arc<SegmentReader>>,
        version: u64,
        generation: Generation,
        user_data: BTreeMap<String, String>,
        apply_all_deletes: bool,
    ) -> Arc<IndexReader> {
        Self::assemble(
            segments,
            version,
            generation,
            user_data,
            ReaderSource::NearRealTime {
                writer,
                dir,
                apply_all_deletes,
            },
        )
    }

    fn assemble(
        segments: Vec<Arc<SegmentReader>>,
        version: u64,
        generation: Generation,
        user_data: BTreeMap<String, String>,
        source: ReaderSource,
    ) -> Arc<IndexReader> {
        let max_doc = segments.iter().map(|s| s.doc_count()).sum();
        let num_docs = segments.iter().map(|s| s.live_doc_count()).sum();
        Arc::new(IndexReader {
            segments: ArcSwapOption::new(Some(Arc::new(segments))),
            refs: AtomicU32::new(1),
            version,
            generation,
            user_data,
            max_doc,
            num_docs,
            source,
        })
    }

    /// Total documents in the snapshot, including deleted ones.
    pub fn max_doc(&self) -> u32 {
        self.max_doc
    }

    /// Live documents in the snapshot.
    pub fn num_docs(&self) -> u32 {
        self.num_docs
    }

    pub fn num_deleted_docs(&self) -> u32 {
        self.max_doc - self.num_docs
    }

    /// Monotonically increasing snapshot version.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Catalog generation this snapshot was built from.
    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn user_data(&self) -> &BTreeMap<String, String> {
        &self.user_data
    }

    pub fn ref_count(&self) -> u32 {
        self.refs.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.refs.load(Ordering::SeqCst) == 0
    }

    /// Add a reference. Fails once the count has reached zero; a closed
    /// reader can never be resurrected.
    pub fn inc_ref(&self) -> Result<()> {
        if self.try_inc_ref() {
            Ok(())
        } else {
            Err(TidepoolError::AlreadyClosed("reader".into()))
        }
    }

    /// Attempt to add a reference, failing (rather than erroring) once
    /// the count has reached zero.
    pub fn try_inc_ref(&self) -> bool {
        let mut current = self.refs.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                return false;
            }
            match self.refs.compare_exchange_weak(
                current,
                current + 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Drop a reference. When the count reaches zero the sub-readers are
    /// released, which in turn releases their file references.
    pub fn dec_ref(&self) -> Result<()> {
        let mut current = self.refs.load(Ordering::SeqCst);
        loop {
            if current == 0 {
                return Err(TidepoolError::AlreadyClosed("reader".into()));
            }
            match self.refs.compare_exchange_weak(
                current,
                current - 1,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        if current == 1 {
            self.segments.store(None);
        }
        Ok(())
    }

    /// Release the opening reference.
    pub fn close(&self) -> Result<()> {
        self.dec_ref()
    }

    /// The per-segment sub-readers backing this snapshot.
    pub fn segment_readers(&self) -> Result<Vec<Arc<SegmentReader>>> {
        match self.segments.load_full() {
            Some(segments) => Ok(segments.as_ref().clone()),
            None => Err(TidepoolError::AlreadyClosed("reader".into())),
        }
    }

    fn segment_with_key(&self, key: ReaderKey) -> Option<Arc<SegmentReader>> {
        self.segments
            .load_full()?
            .iter()
            .find(|s| s.key() == key)
            .cloned()
    }

    /// Number of live documents containing `term`.
    pub fn doc_freq(&self, term: &Term) -> Result<u32> {
        let mut count = 0;
        for segment in self.segment_readers()? {
            count += segment.live_docs_for_term(term).len() as u32;
        }
        Ok(count)
    }

    /// Stored values of `field` on live documents matching `term`.
    pub fn stored_values(&self, term: &Term, field: &str) -> Result<Vec<FieldValue>> {
        let mut values = Vec::new();
        for segment in self.segment_readers()? {
            for docno in segment.live_docs_for_term(term) {
                if let Some(v) = segment.value(field, docno) {
                    values.push(v);
                }
            }
        }
        Ok(values)
    }

    /// Whether any changes (commits for committed readers, any writer
    /// change for near-real-time readers) happened since this snapshot.
    pub fn is_current(&self) -> Result<bool> {
        if self.is_closed() {
            return Err(TidepoolError::AlreadyClosed("reader".into()));
        }
        match &self.source {
            ReaderSource::Committed { dir } => match SegmentCatalog::load(dir.as_ref()) {
                Ok(catalog) => Ok(catalog.generation == self.generation),
                Err(TidepoolError::NoCatalog) => Ok(false),
                Err(e) => Err(e),
            },
            ReaderSource::NearRealTime { writer, .. } => match writer.upgrade() {
                Some(core) => Ok(core.change_version() == self.version),
                None => Ok(false),
            },
        }
    }

    /// Return a fresh snapshot when anything changed, sharing unchanged
    /// sub-readers with this one, or `None` when nothing did.
    pub fn open_if_changed(&self) -> Result<Option<Arc<IndexReader>>> {
        if self.is_current()? {
            return Ok(None);
        }
        match &self.source {
            ReaderSource::Committed { dir } => {
                Ok(Some(Self::open_committed(Arc::clone(dir), Some(self))?))
            }
            ReaderSource::NearRealTime {
                writer,
                dir,
                apply_all_deletes,
            } => match writer.upgrade() {
                Some(core) => Ok(Some(core.open_nrt_reader(*apply_all_deletes)?)),
                None => Ok(Some(Self::open_committed(Arc::clone(dir), Some(self))?)),
            },
        }
    }
}
