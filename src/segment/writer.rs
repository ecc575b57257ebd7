//! Index writer and the commit/rollback coordinator
//!
//! The writer owns the directory's exclusive lock, the per-thread write
//! buffers, the buffered update queue, and the working segment set.
//! Registering a segment and publishing a commit generation are the two
//! serialized critical sections; the add/update/delete hot path holds no
//! global lock.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::codec::{resolve_codec, Codec};
use crate::config::{WriterConfig, WRITE_LOCK_NAME};
use crate::directory::{Directory, DirectoryLock};
use crate::error::{Result, TidepoolError};

use super::buffer::{validate_document, BufferPool};
use super::catalog::{
    catalog_file_name, pending_file_name, SegmentCatalog, SegmentEntry,
};
use super::deleter::FileDeleter;
use super::flush::{flush_buffer, FlushStats};
use super::live_docs::LiveDocs;
use super::merge::{MergeSpec, SegmentStats};
use super::pool::ReaderPool;
use super::reader::{IndexReader, SegmentReader};
use super::types::{DocNo, Document, FieldValue, Generation, SegmentId, SeqNo, Term};
use super::updates::{
    DeleteQuery, DocValueView, FieldUpdates, UpdateEntry, UpdateKind, UpdateQueue,
};

struct WriterState {
    /// Working segment set: committed entries plus flushed-but-uncommitted
    /// ones, with merges applied as they complete
    entries: Vec<SegmentEntry>,
    next_segment_id: SegmentId,
    /// The last durable commit point
    committed: SegmentCatalog,
    /// A prepared (written but unpublished) commit, and the change count
    /// it captured
    prepared: Option<(SegmentCatalog, u64)>,
}

/// Shared writer internals. Background merge workers and near-real-time
/// readers hold this alongside the `IndexWriter` handle.
pub struct WriterCore {
    dir: Arc<dyn Directory>,
    codec: Arc<dyn Codec>,
    config: WriterConfig,
    state: Mutex<WriterState>,
    buffers: BufferPool,
    queue: UpdateQueue,
    pool: ReaderPool,
    deleter: Arc<Mutex<FileDeleter>>,
    /// Serializes resolution passes over the update queue
    resolve_lock: Mutex<()>,
    /// Segments currently claimed by an in-flight merge
    merging: Mutex<HashSet<SegmentId>>,
    weak_self: Weak<WriterCore>,
    change_count: AtomicU64,
    last_commit_change: AtomicU64,
    flush_count: AtomicU64,
    merge_count: AtomicU64,
    merges_disabled: AtomicBool,
    abort_merges: AtomicBool,
    closed: AtomicBool,
    last_merge_failure: Mutex<Option<String>>,
}

impl WriterCore {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            Err(TidepoolError::AlreadyClosed("writer".into()))
        } else {
            Ok(())
        }
    }

    pub(crate) fn directory(&self) -> &Arc<dyn Directory> {
        &self.dir
    }

    pub(crate) fn codec(&self) -> &Arc<dyn Codec> {
        &self.codec
    }

    pub(crate) fn codec_name(&self) -> &str {
        &self.config.codec
    }

    pub(crate) fn change_version(&self) -> u64 {
        self.change_count.load(Ordering::SeqCst)
    }

    fn bump_change(&self) {
        self.change_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn alloc_segment_id(&self) -> SegmentId {
        let mut state = self.state.lock();
        let id = state.next_segment_id;
        state.next_segment_id = id.next();
        id
    }

    pub(crate) fn merges_aborted(&self) -> bool {
        self.abort_merges.load(Ordering::SeqCst)
    }

    pub(crate) fn open_pooled_reader(&self, entry: &SegmentEntry) -> Result<Arc<SegmentReader>> {
        self.pool.get_or_open(&self.dir, entry, &self.deleter)
    }

    /// Current entries for a merge spec, or None when any source has
    /// already been swapped away.
    pub(crate) fn entries_for(&self, spec: &MergeSpec) -> Option<Vec<SegmentEntry>> {
        let state = self.state.lock();
        spec.segments
            .iter()
            .map(|id| state.entries.iter().find(|e| e.id() == *id).cloned())
            .collect()
    }

    // -- flushing ----------------------------------------------------------

    /// Flush the fullest buffer into one pending segment. Returns false
    /// when every buffer is empty.
    fn flush_one_buffer(&self) -> Result<bool> {
        let Some(buffer) = self.buffers.take_largest() else {
            return Ok(false);
        };
        let id = self.alloc_segment_id();
        let entry = flush_buffer(self.dir.as_ref(), self.codec.as_ref(), id, buffer)?;
        self.register_flushed(entry);
        Ok(true)
    }

    /// Flush every non-empty buffer.
    fn flush_all_buffers(&self) -> Result<()> {
        for buffer in self.buffers.take_all() {
            let id = self.alloc_segment_id();
            let entry = flush_buffer(self.dir.as_ref(), self.codec.as_ref(), id, buffer)?;
            self.register_flushed(entry);
        }
        Ok(())
    }

    fn register_flushed(&self, entry: SegmentEntry) {
        let files = entry.all_files();
        {
            let mut state = self.state.lock();
            state.entries.push(entry);
        }
        self.deleter.lock().inc_ref(&files);
        self.flush_count.fetch_add(1, Ordering::SeqCst);
        self.bump_change();
    }

    // -- buffered update resolution ---------------------------------------

    /// Resolve queued deletes/updates against every flushed segment,
    /// producing new delete/update generations. Entries fully applied to
    /// every segment are pruned afterwards.
    fn resolve_buffered_updates(&self) -> Result<()> {
        let _guard = self.resolve_lock.lock();

        let queued = self.queue.snapshot();
        if queued.is_empty() {
            return Ok(());
        }
        let entries: Vec<SegmentEntry> = self.state.lock().entries.clone();

        let mut any_change = false;
        for entry in &entries {
            let pending: Vec<&UpdateEntry> =
                queued.iter().filter(|u| u.seq > entry.applied_seq).collect();
            if pending.is_empty() {
                continue;
            }
            let changed = self.resolve_for_segment(entry, &pending)?;
            any_change |= changed;
        }

        if any_change {
            self.bump_change();
        }

        // Every queued entry has now been applied to (or skipped for)
        // every segment; drop those below the lowest watermark.
        let min_applied = {
            let state = self.state.lock();
            state
                .entries
                .iter()
                .map(|e| e.applied_seq)
                .min()
                .unwrap_or_else(|| self.queue.last_seq())
        };
        self.queue.prune_through(min_applied);
        Ok(())
    }

    /// Apply pending entries to one segment. Returns whether any file
    /// generation advanced.
    fn resolve_for_segment(
        &self,
        entry: &SegmentEntry,
        pending: &[&UpdateEntry],
    ) -> Result<bool> {
        let reader = self.open_pooled_reader(entry)?;
        let mut live = reader.live_docs();
        let mut overlay = match entry.update_gen {
            0 => FieldUpdates::default(),
            gen => self
                .codec
                .read_field_updates(self.dir.as_ref(), &entry.info, gen)?,
        };

        let start_deleted = live.deleted_count();
        let mut overlay_changed = false;

        for update in pending {
            match &update.kind {
                UpdateKind::DeleteTerm(term) => {
                    for docno in reader.docs_for_term(term) {
                        live.delete(docno);
                    }
                }
                UpdateKind::DeleteQuery(query) => {
                    let view = OverlayView {
                        reader: reader.as_ref(),
                        overlay: &overlay,
                    };
                    for docno in query.matching_docs(&view) {
                        live.delete(docno);
                    }
                }
                UpdateKind::FieldValue { term, field, value } => {
                    for docno in reader.docs_for_term(term) {
                        if live.is_live(docno) {
                            overlay.set(field.clone(), docno.as_u32(), value.clone());
                            overlay_changed = true;
                        }
                    }
                }
                UpdateKind::DeleteAll => {
                    for docno in 0..entry.info.doc_count {
                        live.delete(DocNo::new(docno));
                    }
                }
            }
        }

        let deletes_changed = live.deleted_count() > start_deleted;
        let new_applied_seq = pending.last().map(|u| u.seq).unwrap_or(entry.applied_seq);

        let mut updated = entry.clone();
        updated.applied_seq = new_applied_seq;
        let mut new_files = Vec::new();
        if deletes_changed {
            updated.del_gen = entry.del_gen + 1;
            updated.del_count = live.deleted_count();
            new_files.push(self.codec.write_live_docs(
                self.dir.as_ref(),
                &entry.info,
                updated.del_gen,
                &live,
            )?);
        }
        if overlay_changed {
            updated.update_gen = entry.update_gen + 1;
            new_files.push(self.codec.write_field_updates(
                self.dir.as_ref(),
                &entry.info,
                updated.update_gen,
                &overlay,
            )?);
        }
        if !new_files.is_empty() {
            self.dir.sync(&new_files)?;
        }

        // Publish the new generations into the working set, unless a
        // merge swapped the segment away while we worked.
        let mut state = self.state.lock();
        let Some(slot) = state
            .entries
            .iter_mut()
            .find(|e| e.id() == entry.id() && e.del_gen == entry.del_gen && e.update_gen == entry.update_gen)
        else {
            drop(state);
            for name in &new_files {
                let _ = self.dir.delete_file(name);
            }
            return Ok(false);
        };
        let old_aux: Vec<String> = slot
            .live_docs_file()
            .into_iter()
            .chain(slot.field_updates_file())
            .filter(|f| !updated.all_files().contains(f))
            .collect();
        *slot = updated;
        drop(state);

        let mut deleter = self.deleter.lock();
        deleter.inc_ref(&new_files);
        deleter.dec_ref(self.dir.as_ref(), &old_aux);
        Ok(!new_files.is_empty())
    }

    // -- merging -----------------------------------------------------------

    fn segment_stats(&self) -> Vec<SegmentStats> {
        let merging = self.merging.lock();
        self.state
            .lock()
            .entries
            .iter()
            .filter(|e| !merging.contains(&e.id()))
            .map(|e| SegmentStats {
                id: e.id(),
                doc_count: e.info.doc_count,
                live_doc_count: e.live_doc_count(),
                size_bytes: e.info.size_bytes,
            })
            .collect()
    }

    fn register_specs(&self, specs: Vec<MergeSpec>) -> Vec<MergeSpec> {
        let mut merging = self.merging.lock();
        specs
            .into_iter()
            .filter(|spec| {
                if spec.segments.iter().any(|id| merging.contains(id)) {
                    return false;
                }
                merging.extend(spec.segments.iter().copied());
                true
            })
            .collect()
    }

    /// Ask the policy for natural merges and hand them to the scheduler.
    fn maybe_merge(&self) {
        if self.closed.load(Ordering::SeqCst)
            || self.merges_disabled.load(Ordering::SeqCst)
            || self.merges_aborted()
        {
            return;
        }
        let Some(core) = self.weak_self.upgrade() else {
            return;
        };
        let stats = self.segment_stats();
        let specs = self.config.merge_policy.find_merges(&stats);
        let specs = self.register_specs(specs);
        if !specs.is_empty() {
            let _ = self.config.merge_scheduler.merge(&core, specs);
        }
    }

    /// Swap merge sources for the merged segment, re-resolving any
    /// deletes or updates that arrived for a source while the merge ran.
    pub(crate) fn commit_merge(
        &self,
        spec: &MergeSpec,
        merged: Option<SegmentEntry>,
        doc_maps: Vec<std::collections::HashMap<u32, u32>>,
        start_entries: Vec<SegmentEntry>,
        start_live: Vec<LiveDocs>,
    ) -> Result<()> {
        let mut state = self.state.lock();

        let mut positions = Vec::with_capacity(start_entries.len());
        for source in &start_entries {
            match state.entries.iter().position(|e| e.id() == source.id()) {
                Some(p) => positions.push(p),
                None => {
                    // A competing swap won; drop our result files.
                    drop(state);
                    if let Some(entry) = merged {
                        for name in entry.all_files() {
                            let _ = self.dir.delete_file(&name);
                        }
                    }
                    debug!(segments = ?spec.segments, "merge result discarded, sources gone");
                    return Ok(());
                }
            }
        }

        let mut final_entry: Option<SegmentEntry> = None;
        if let Some(mut entry) = merged {
            let mut live = LiveDocs::new(entry.info.doc_count);
            let mut overlay = FieldUpdates::default();
            let mut have_overlay = false;

            for (i, source) in start_entries.iter().enumerate() {
                let current = &state.entries[positions[i]];
                if current.del_gen != source.del_gen {
                    let current_live = self.codec.read_live_docs(
                        self.dir.as_ref(),
                        &current.info,
                        current.del_gen,
                    )?;
                    for docno in current_live.newly_deleted_since(&start_live[i]) {
                        if let Some(&new_docno) = doc_maps[i].get(&docno.as_u32()) {
                            live.delete(DocNo::new(new_docno));
                        }
                    }
                }
                if current.update_gen != source.update_gen {
                    let current_updates = self.codec.read_field_updates(
                        self.dir.as_ref(),
                        &current.info,
                        current.update_gen,
                    )?;
                    let remapped =
                        current_updates.remap_docnos(|d| doc_maps[i].get(&d).copied());
                    if !remapped.is_empty() {
                        for (field, column) in remapped.values {
                            for (docno, value) in column {
                                overlay.set(field.clone(), docno, value);
                            }
                        }
                        have_overlay = true;
                    }
                }
            }

            entry.applied_seq = positions
                .iter()
                .map(|&p| state.entries[p].applied_seq)
                .min()
                .unwrap_or(entry.applied_seq);

            let mut aux_files = Vec::new();
            if live.deleted_count() > 0 {
                entry.del_gen = 1;
                entry.del_count = live.deleted_count();
                aux_files.push(self.codec.write_live_docs(
                    self.dir.as_ref(),
                    &entry.info,
                    1,
                    &live,
                )?);
            }
            if have_overlay {
                entry.update_gen = 1;
                aux_files.push(self.codec.write_field_updates(
                    self.dir.as_ref(),
                    &entry.info,
                    1,
                    &overlay,
                )?);
            }
            if !aux_files.is_empty() {
                self.dir.sync(&aux_files)?;
            }

            if entry.live_doc_count() == 0 {
                // Every document died while we merged: drop the result
                // entirely rather than registering an empty segment.
                for name in entry.all_files() {
                    let _ = self.dir.delete_file(&name);
                }
            } else {
                final_entry = Some(entry);
            }
        }

        let insert_at = positions.iter().copied().min().unwrap_or(0);
        let removed: Vec<SegmentEntry> = state
            .entries
            .iter()
            .filter(|e| spec.segments.contains(&e.id()))
            .cloned()
            .collect();
        state.entries.retain(|e| !spec.segments.contains(&e.id()));
        let new_files = final_entry.as_ref().map(|e| e.all_files());
        if let Some(entry) = final_entry {
            let at = insert_at.min(state.entries.len());
            state.entries.insert(at, entry);
        }
        drop(state);

        let mut deleter = self.deleter.lock();
        if let Some(files) = new_files {
            deleter.inc_ref(&files);
        }
        for entry in &removed {
            deleter.dec_ref(self.dir.as_ref(), entry.all_files());
        }
        drop(deleter);
        self.pool.prune();

        self.merge_count.fetch_add(1, Ordering::SeqCst);
        self.bump_change();
        info!(sources = ?spec.segments, "merge committed");
        Ok(())
    }

    /// Called by schedulers when a merge finished, successfully or not.
    pub(crate) fn finish_merge(&self, spec: &MergeSpec, result: Result<()>) {
        {
            let mut merging = self.merging.lock();
            for id in &spec.segments {
                merging.remove(id);
            }
        }
        match result {
            Ok(()) => {
                self.maybe_merge();
            }
            Err(TidepoolError::MergeAborted) => {
                self.config
                    .merge_failure_handler
                    .on_merge_failure(spec, &TidepoolError::MergeAborted);
            }
            Err(e) => {
                self.config.merge_failure_handler.on_merge_failure(spec, &e);
                *self.last_merge_failure.lock() = Some(e.to_string());
                // Fatal to the scheduler, not to the writer: indexing
                // continues with merging disabled until retried.
                self.merges_disabled.store(true, Ordering::SeqCst);
                warn!(error = %e, "merging disabled after failure");
            }
        }
    }

    // -- readers -----------------------------------------------------------

    /// Build a near-real-time snapshot of committed plus pending state,
    /// flushing in-memory buffers first so no half-flushed buffer is
    /// ever exposed.
    pub(crate) fn open_nrt_reader(&self, apply_all_deletes: bool) -> Result<Arc<IndexReader>> {
        self.ensure_open()?;
        self.flush_all_buffers()?;
        if apply_all_deletes {
            self.resolve_buffered_updates()?;
        }
        let (entries, generation, user_data) = {
            let state = self.state.lock();
            (
                state.entries.clone(),
                state.committed.generation,
                state.committed.user_data.clone(),
            )
        };
        let mut segments = Vec::with_capacity(entries.len());
        for entry in &entries {
            segments.push(self.open_pooled_reader(entry)?);
        }
        Ok(IndexReader::new_near_real_time(
            Weak::clone(&self.weak_self),
            Arc::clone(&self.dir),
            segments,
            self.change_version(),
            generation,
            user_data,
            apply_all_deletes,
        ))
    }
}

/// The single writer for a directory. Only one may hold the directory's
/// exclusive write lock at a time; a second writer times out distinctly
/// from a corrupt-index failure.
pub struct IndexWriter {
    core: Arc<WriterCore>,
    lock: Mutex<Option<Box<dyn DirectoryLock>>>,
}

impl IndexWriter {
    /// Open a writer over `dir`, acquiring the exclusive write lock and
    /// loading the latest commit point (or starting empty when the
    /// config allows it).
    pub fn open(dir: Arc<dyn Directory>, config: WriterConfig) -> Result<IndexWriter> {
        let lock = dir.obtain_lock(WRITE_LOCK_NAME, config.lock_timeout)?;

        let catalog = match SegmentCatalog::load(dir.as_ref()) {
            Ok(catalog) => catalog,
            Err(TidepoolError::NoCatalog) if config.create_if_missing => SegmentCatalog::new(),
            Err(e) => return Err(e),
        };
        let codec = resolve_codec(&config.codec)?;

        // Remove leftovers from earlier crashes or rollbacks: anything
        // not referenced by the loaded commit point.
        let mut keep: HashSet<String> = catalog.referenced_files().into_iter().collect();
        keep.insert(WRITE_LOCK_NAME.to_string());
        if catalog.generation > 0 {
            keep.insert(catalog_file_name(catalog.generation));
        }
        for name in dir.list_all()? {
            if !keep.contains(&name) {
                debug!(file = %name, "removing stale file at open");
                let _ = dir.delete_file(&name);
            }
        }

        let mut deleter = FileDeleter::new();
        // One reference for the durable commit point, one for the
        // working set.
        if catalog.generation > 0 {
            deleter.inc_ref([catalog_file_name(catalog.generation)]);
        }
        deleter.inc_ref(catalog.referenced_files());
        deleter.inc_ref(catalog.referenced_files());

        let queue = UpdateQueue::new(catalog.last_seq);
        let buffers = BufferPool::new(config.max_buffer_count);
        let state = WriterState {
            entries: catalog.entries.clone(),
            next_segment_id: catalog.next_segment_id,
            committed: catalog,
            prepared: None,
        };

        let core = Arc::new_cyclic(|weak| WriterCore {
            dir,
            codec,
            config,
            state: Mutex::new(state),
            buffers,
            queue,
            pool: ReaderPool::new(),
            deleter: Arc::new(Mutex::new(deleter)),
            resolve_lock: Mutex::new(()),
            merging: Mutex::new(HashSet::new()),
            weak_self: Weak::clone(weak),
            change_count: AtomicU64::new(0),
            last_commit_change: AtomicU64::new(0),
            flush_count: AtomicU64::new(0),
            merge_count: AtomicU64::new(0),
            merges_disabled: AtomicBool::new(false),
            abort_merges: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            last_merge_failure: Mutex::new(None),
        });

        Ok(IndexWriter {
            core,
            lock: Mutex::new(Some(lock)),
        })
    }

    // -- document operations ----------------------------------------------

    /// Buffer a document for indexing. Returns the operation's sequence
    /// number.
    pub fn add_document(&self, doc: Document) -> Result<SeqNo> {
        self.core.ensure_open()?;
        let seq = self.core.queue.next_seq();
        self.core
            .buffers
            .with_free_buffer(|b| b.add_document(&doc, seq))?;
        self.core.bump_change();
        self.after_mutation()?;
        Ok(seq)
    }

    /// Atomically delete every document matching `term` and add `doc`.
    /// Within one buffered session the re-added document is the single
    /// surviving copy (last write by sequence number wins).
    pub fn update_document(&self, term: Term, doc: Document) -> Result<SeqNo> {
        self.core.ensure_open()?;
        // Validate first so a rejected document does not leave the
        // delete half of the update applied.
        validate_document(&doc)?;
        let seq = self.core.queue.next_seq();
        self.core.buffers.apply_to_all(|b| {
            b.apply_delete_term(&term, seq);
        });
        self.core.queue.push(UpdateEntry {
            seq,
            kind: UpdateKind::DeleteTerm(term),
        });
        self.core
            .buffers
            .with_free_buffer(|b| b.add_document(&doc, seq))?;
        self.core.bump_change();
        self.after_mutation()?;
        Ok(seq)
    }

    /// Buffer a delete of every document matching `term`.
    pub fn delete_by_term(&self, term: Term) -> Result<SeqNo> {
        self.core.ensure_open()?;
        let seq = self.core.queue.next_seq();
        self.core.buffers.apply_to_all(|b| {
            b.apply_delete_term(&term, seq);
        });
        self.core.queue.push(UpdateEntry {
            seq,
            kind: UpdateKind::DeleteTerm(term),
        });
        self.core.bump_change();
        self.after_mutation()?;
        Ok(seq)
    }

    /// Buffer a delete of every document matching `query`.
    pub fn delete_by_query(&self, query: Arc<dyn DeleteQuery>) -> Result<SeqNo> {
        self.core.ensure_open()?;
        let seq = self.core.queue.next_seq();
        self.core.buffers.apply_to_all(|b| {
            b.apply_delete_query(query.as_ref(), seq);
        });
        self.core.queue.push(UpdateEntry {
            seq,
            kind: UpdateKind::DeleteQuery(query),
        });
        self.core.bump_change();
        self.after_mutation()?;
        Ok(seq)
    }

    /// Buffer a stored-value update for every document matching `term`.
    /// A later delete or update of the same document wins by sequence
    /// number, regardless of kind.
    pub fn update_field_value(
        &self,
        term: Term,
        field: impl Into<String>,
        value: FieldValue,
    ) -> Result<SeqNo> {
        self.core.ensure_open()?;
        let field = field.into();
        let seq = self.core.queue.next_seq();
        self.core.buffers.apply_to_all(|b| {
            b.apply_field_update(&term, &field, &value, seq);
        });
        self.core.queue.push(UpdateEntry {
            seq,
            kind: UpdateKind::FieldValue { term, field, value },
        });
        self.core.bump_change();
        self.after_mutation()?;
        Ok(seq)
    }

    /// Delete every document, buffered and flushed, in one sequenced
    /// operation. Commit history is unaffected.
    pub fn delete_all(&self) -> Result<SeqNo> {
        self.core.ensure_open()?;
        let seq = self.core.queue.next_seq();
        self.core.buffers.apply_to_all(|b| {
            b.apply_delete_all(seq);
        });
        self.core.queue.push(UpdateEntry {
            seq,
            kind: UpdateKind::DeleteAll,
        });
        self.core.bump_change();
        self.after_mutation()?;
        Ok(seq)
    }

    fn after_mutation(&self) -> Result<()> {
        let core = &self.core;
        let stats = FlushStats {
            ram_bytes: core.buffers.ram_bytes_used(),
            largest_buffer_docs: core.buffers.largest_buffer_docs(),
            buffered_update_bytes: core.queue.ram_bytes_used(),
        };
        if core.config.flush_policy.should_flush(&stats) {
            core.flush_one_buffer()?;
            core.maybe_merge();
        }
        if core
            .queue
            .needs_resolution(core.config.update_queue_max_bytes)
        {
            core.resolve_buffered_updates()?;
        }
        // Backpressure: far over budget, the calling thread pays for the
        // flush before its operation returns.
        while core.buffers.ram_bytes_used() > core.config.stall_bytes {
            if !core.flush_one_buffer()? {
                break;
            }
        }
        Ok(())
    }

    // -- flush / merge -----------------------------------------------------

    /// Flush all in-memory buffers into pending segments and resolve the
    /// buffered update queue.
    pub fn flush(&self) -> Result<()> {
        self.core.ensure_open()?;
        self.core.flush_all_buffers()?;
        self.core.resolve_buffered_updates()?;
        self.core.maybe_merge();
        Ok(())
    }

    /// Merge until at most `max_segments` remain. Blocks until the
    /// scheduler confirms completion or failure.
    pub fn force_merge(&self, max_segments: usize) -> Result<()> {
        self.core.ensure_open()?;
        self.core.flush_all_buffers()?;
        self.core.resolve_buffered_updates()?;

        loop {
            let stats = self.core.segment_stats();
            if stats.len() <= max_segments.max(1) {
                self.core.config.merge_scheduler.wait_for_idle();
                break;
            }
            let specs = self
                .core
                .config
                .merge_policy
                .find_forced_merges(&stats, max_segments);
            if specs.is_empty() {
                break;
            }
            let specs = self.core.register_specs(specs);
            if specs.is_empty() {
                // Sources busy in background merges; wait and re-plan.
                self.core.config.merge_scheduler.wait_for_idle();
                continue;
            }
            self.core
                .config
                .merge_scheduler
                .merge(&self.core, specs)?;
            self.core.config.merge_scheduler.wait_for_idle();

            if let Some(msg) = self.core.last_merge_failure.lock().clone() {
                return Err(TidepoolError::Aborting(msg));
            }
        }
        Ok(())
    }

    /// Re-enable merging after a merge failure disabled it.
    pub fn retry_merges(&self) {
        self.core.merges_disabled.store(false, Ordering::SeqCst);
        *self.core.last_merge_failure.lock() = None;
        self.core.maybe_merge();
    }

    /// Import every committed segment from the source directories,
    /// copying files under fresh segment ids. Externally-deleted
    /// documents stay deleted.
    pub fn add_external_segments(&self, sources: &[&dyn Directory]) -> Result<SeqNo> {
        self.core.ensure_open()?;
        let seq = self.core.queue.next_seq();
        for source in sources {
            let catalog = SegmentCatalog::load(*source)?;
            for entry in &catalog.entries {
                self.import_segment(*source, entry, seq)?;
            }
        }
        self.core.bump_change();
        self.core.maybe_merge();
        Ok(seq)
    }

    fn import_segment(
        &self,
        source: &dyn Directory,
        entry: &SegmentEntry,
        seq: SeqNo,
    ) -> Result<()> {
        let core = &self.core;
        let new_id = core.alloc_segment_id();
        let old_name = entry.info.name();
        let new_name = new_id.to_string();

        let mut imported = entry.clone();
        imported.info.id = new_id;
        imported.info.max_seq = seq;
        // Queued entries from before the import must not touch the
        // imported documents.
        imported.applied_seq = core.queue.last_seq();
        imported.info.files = Vec::new();

        let mut copied = Vec::new();
        for file in entry.all_files() {
            let new_file = file.replacen(&old_name, &new_name, 1);
            let data = source.read_file(&file)?;
            core.dir.write_file(&new_file, &data)?;
            copied.push(new_file);
        }
        for file in &entry.info.files {
            imported
                .info
                .files
                .push(file.replacen(&old_name, &new_name, 1));
        }
        core.dir.sync(&copied)?;

        {
            let mut state = core.state.lock();
            state.entries.push(imported.clone());
        }
        core.deleter.lock().inc_ref(imported.all_files());
        debug!(
            source_segment = %old_name,
            segment = %new_name,
            docs = imported.info.doc_count,
            "imported external segment"
        );
        Ok(())
    }

    // -- commit protocol ---------------------------------------------------

    /// Phase one: flush everything, resolve the update queue, and write
    /// a provisional catalog generation durably without publishing it.
    pub fn prepare_commit(
        &self,
        user_data: Option<BTreeMap<String, String>>,
    ) -> Result<Generation> {
        self.core.ensure_open()?;
        {
            let state = self.core.state.lock();
            if state.prepared.is_some() {
                return Err(TidepoolError::InvalidArgument(
                    "commit already prepared".into(),
                ));
            }
        }
        self.core.flush_all_buffers()?;
        self.core.resolve_buffered_updates()?;

        let catalog = {
            let mut state = self.core.state.lock();
            let catalog = SegmentCatalog {
                format: SegmentCatalog::FORMAT,
                generation: state.committed.generation + 1,
                next_segment_id: state.next_segment_id,
                last_seq: self.core.queue.last_seq(),
                entries: state.entries.clone(),
                user_data: user_data.unwrap_or_else(|| state.committed.user_data.clone()),
            };
            state.prepared = Some((catalog.clone(), self.core.change_version()));
            catalog
        };

        // Segment files referenced here were synced at flush and
        // resolution time; only the catalog body remains.
        match catalog.persist_pending(self.core.dir.as_ref()) {
            Ok(_) => Ok(catalog.generation),
            Err(e) => {
                // Transient failure: forget the prepared state so the
                // same writer can retry.
                self.core.state.lock().prepared = None;
                Err(e)
            }
        }
    }

    /// Phase two: atomically publish the prepared generation. Without a
    /// prior `prepare_commit` both phases run back to back.
    pub fn commit(&self, user_data: Option<BTreeMap<String, String>>) -> Result<Generation> {
        self.core.ensure_open()?;
        let already_prepared = self.core.state.lock().prepared.is_some();
        if already_prepared {
            if user_data.is_some() {
                return Err(TidepoolError::InvalidArgument(
                    "user data must be given to prepare_commit once prepared".into(),
                ));
            }
        } else {
            self.prepare_commit(user_data)?;
        }
        self.finish_commit()
    }

    fn finish_commit(&self) -> Result<Generation> {
        let core = &self.core;
        let (catalog, prepared_change) = {
            let state = core.state.lock();
            match &state.prepared {
                Some((catalog, change)) => (catalog.clone(), *change),
                None => {
                    return Err(TidepoolError::InvalidArgument(
                        "no prepared commit to finish".into(),
                    ))
                }
            }
        };

        // The publish is a single atomic rename; a crash before it
        // leaves only an ignorable pending file.
        catalog.publish(core.dir.as_ref())?;

        let previous = {
            let mut state = core.state.lock();
            state.prepared = None;
            std::mem::replace(&mut state.committed, catalog.clone())
        };

        let mut deleter = core.deleter.lock();
        deleter.inc_ref([catalog.file_name()]);
        deleter.inc_ref(catalog.referenced_files());
        if previous.generation > 0 {
            deleter.dec_ref(core.dir.as_ref(), [catalog_file_name(previous.generation)]);
        }
        deleter.dec_ref(core.dir.as_ref(), previous.referenced_files());
        drop(deleter);

        core.last_commit_change
            .store(prepared_change, Ordering::SeqCst);
        info!(
            generation = catalog.generation,
            segments = catalog.segment_count(),
            "commit published"
        );
        core.maybe_merge();
        Ok(catalog.generation)
    }

    /// Discard all pending segments and unresolved buffered updates,
    /// restore the last commit point, release the write lock, and close
    /// the writer. Idempotent; safe to call after earlier failures.
    pub fn rollback(&self) -> Result<()> {
        if self.core.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let core = &self.core;
        core.abort_merges.store(true, Ordering::SeqCst);
        core.config.merge_scheduler.shutdown();

        core.buffers.discard_all();
        core.queue.clear();

        {
            let mut state = core.state.lock();
            let committed = state.committed.clone();

            let working: Vec<String> = state
                .entries
                .iter()
                .flat_map(|e| e.all_files())
                .collect();
            state.entries = committed.entries.clone();
            if let Some((prepared, _)) = state.prepared.take() {
                let _ = core
                    .dir
                    .delete_file(&pending_file_name(prepared.generation));
            }
            drop(state);

            let mut deleter = core.deleter.lock();
            // The working set returns to the committed one: balance the
            // registration references.
            deleter.inc_ref(committed.referenced_files());
            deleter.dec_ref(core.dir.as_ref(), working);
        }
        core.pool.prune();
        self.release_lock();
        info!("writer rolled back");
        Ok(())
    }

    /// Wait for in-flight merges, commit pending changes, and release
    /// the lock. Readers opened earlier stay valid.
    pub fn close(&self) -> Result<()> {
        if self.core.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.core.config.merge_scheduler.wait_for_idle();
        if self.has_uncommitted_changes() {
            self.commit(None)?;
        }
        self.core.config.merge_scheduler.shutdown();
        self.core.closed.store(true, Ordering::SeqCst);
        self.release_lock();
        Ok(())
    }

    fn release_lock(&self) {
        if let Some(mut lock) = self.lock.lock().take() {
            if let Err(e) = lock.release() {
                warn!(error = %e, "failed to release write lock");
            }
        }
    }

    // -- readers and introspection ----------------------------------------

    /// Near-real-time snapshot of committed plus pending state. With
    /// `apply_all_deletes` the buffered update queue is resolved first;
    /// without it, queued deletes may not yet be reflected.
    pub fn get_reader(&self, apply_all_deletes: bool) -> Result<Arc<IndexReader>> {
        self.core.open_nrt_reader(apply_all_deletes)
    }

    /// `get_reader` with all deletes applied.
    pub fn open_reader(&self) -> Result<Arc<IndexReader>> {
        self.get_reader(true)
    }

    /// Whether any change since the last commit is still unpublished.
    pub fn has_uncommitted_changes(&self) -> bool {
        let core = &self.core;
        core.change_version() != core.last_commit_change.load(Ordering::SeqCst)
            || !core.queue.is_empty()
            || core.buffers.buffered_doc_count() > 0
            || core.state.lock().prepared.is_some()
    }

    pub fn segment_count(&self) -> usize {
        self.core.state.lock().entries.len()
    }

    /// Live documents across flushed segments and in-memory buffers.
    pub fn doc_count_estimate(&self) -> u64 {
        let flushed: u64 = {
            let state = self.core.state.lock();
            state.entries.iter().map(|e| e.live_doc_count() as u64).sum()
        };
        flushed + self.core.buffers.buffered_live_doc_count() as u64
    }

    pub fn ram_bytes_used(&self) -> usize {
        self.core.buffers.ram_bytes_used() + self.core.queue.ram_bytes_used()
    }

    pub fn flush_count(&self) -> u64 {
        self.core.flush_count.load(Ordering::SeqCst)
    }

    pub fn merge_count(&self) -> u64 {
        self.core.merge_count.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.core.closed.load(Ordering::SeqCst)
    }
}

impl Drop for IndexWriter {
    fn drop(&mut self) {
        if !self.core.closed.load(Ordering::SeqCst) {
            let _ = self.rollback();
        }
    }
}

/// Delete-query view combining a segment reader with the overlay built
/// up so far in the same resolution pass, so later entries observe
/// earlier ones in sequence order.
struct OverlayView<'a> {
    reader: &'a SegmentReader,
    overlay: &'a FieldUpdates,
}

impl DocValueView for OverlayView<'_> {
    fn doc_count(&self) -> u32 {
        DocValueView::doc_count(self.reader)
    }

    fn value(&self, field: &str, docno: DocNo) -> Option<FieldValue> {
        if let Some(v) = self.overlay.get(field, docno.as_u32()) {
            return Some(v.clone());
        }
        self.reader.value(field, docno)
    }
}
