//! Per-thread write buffers
//!
//! Each indexing thread checks out an independent buffer so the common
//! add/update/delete path holds no global lock. Buffered deletes and
//! updates are applied eagerly here, sequence-aware: an entry only
//! affects documents whose own sequence number is strictly lower.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::codec::SegmentData;
use crate::error::{Result, TidepoolError};

use super::live_docs::LiveDocs;
use super::types::{DocNo, Document, Field, FieldValue, SeqNo, Term};
use super::updates::{DeleteQuery, DocValueView};

/// A document held in a buffer, stamped with its add sequence number.
#[derive(Clone, Debug)]
pub struct BufferedDoc {
    pub seq: SeqNo,
    pub fields: Vec<Field>,
    pub deleted: bool,
}

/// In-memory buffer owned by one indexing thread at a time.
#[derive(Debug, Default)]
pub struct ThreadBuffer {
    docs: Vec<BufferedDoc>,
    postings: BTreeMap<Term, Vec<u32>>,
    ram_bytes: usize,
    deleted_count: u32,
    max_seq: SeqNo,
}

impl ThreadBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a document. Validation failures are non-aborting: the
    /// document is rejected, nothing is buffered, and the session
    /// continues.
    pub fn add_document(&mut self, doc: &Document, seq: SeqNo) -> Result<DocNo> {
        validate_document(doc)?;

        let docno = DocNo::new(self.docs.len() as u32);
        for term in doc.index_terms() {
            self.ram_bytes += term.field.len() + term.text.len() + std::mem::size_of::<u32>();
            self.postings.entry(term).or_default().push(docno.as_u32());
        }
        self.ram_bytes += doc.ram_bytes() + std::mem::size_of::<BufferedDoc>();
        self.docs.push(BufferedDoc {
            seq,
            fields: doc.fields.clone(),
            deleted: false,
        });
        if seq > self.max_seq {
            self.max_seq = seq;
        }
        Ok(docno)
    }

    /// Mark buffered documents matching `term` as deleted. Only
    /// documents added before the entry (lower sequence number) are
    /// affected. Returns the number of documents marked.
    pub fn apply_delete_term(&mut self, term: &Term, seq: SeqNo) -> u32 {
        let Some(docnos) = self.postings.get(term) else {
            return 0;
        };
        let mut marked = 0;
        for docno in docnos.clone() {
            let doc = &mut self.docs[docno as usize];
            if !doc.deleted && doc.seq < seq {
                doc.deleted = true;
                self.deleted_count += 1;
                marked += 1;
            }
        }
        if seq > self.max_seq {
            self.max_seq = seq;
        }
        marked
    }

    /// Mark buffered documents matching a delete query.
    pub fn apply_delete_query(&mut self, query: &dyn DeleteQuery, seq: SeqNo) -> u32 {
        let matches = query.matching_docs(self);
        let mut marked = 0;
        for docno in matches {
            let doc = &mut self.docs[docno.as_usize()];
            if !doc.deleted && doc.seq < seq {
                doc.deleted = true;
                self.deleted_count += 1;
                marked += 1;
            }
        }
        if seq > self.max_seq {
            self.max_seq = seq;
        }
        marked
    }

    /// Overwrite a stored field value on buffered documents matching
    /// `term`. Index terms are not re-derived; only the stored value
    /// changes, mirroring the deferred-update semantics of flushed
    /// segments.
    pub fn apply_field_update(
        &mut self,
        term: &Term,
        field: &str,
        value: &FieldValue,
        seq: SeqNo,
    ) -> u32 {
        let Some(docnos) = self.postings.get(term) else {
            return 0;
        };
        let mut updated = 0;
        for docno in docnos.clone() {
            let doc = &mut self.docs[docno as usize];
            if doc.deleted || doc.seq >= seq {
                continue;
            }
            match doc.fields.iter_mut().rfind(|f| f.name == field) {
                Some(existing) => existing.value = value.clone(),
                None => doc.fields.push(Field::new(field, value.clone())),
            }
            updated += 1;
        }
        if seq > self.max_seq {
            self.max_seq = seq;
        }
        updated
    }

    /// Mark every buffered document as deleted.
    pub fn apply_delete_all(&mut self, seq: SeqNo) -> u32 {
        let mut marked = 0;
        for doc in &mut self.docs {
            if !doc.deleted && doc.seq < seq {
                doc.deleted = true;
                self.deleted_count += 1;
                marked += 1;
            }
        }
        if seq > self.max_seq {
            self.max_seq = seq;
        }
        marked
    }

    pub fn doc_count(&self) -> u32 {
        self.docs.len() as u32
    }

    pub fn live_doc_count(&self) -> u32 {
        self.docs.len() as u32 - self.deleted_count
    }

    pub fn ram_bytes(&self) -> usize {
        self.ram_bytes
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn max_seq(&self) -> SeqNo {
        self.max_seq
    }

    /// Convert the buffer into the codec exchange format plus the
    /// initial liveness bitmap. All buffered documents are written,
    /// including deleted ones; liveness is carried separately.
    pub fn into_segment_parts(self) -> (SegmentData, LiveDocs, SeqNo) {
        let doc_count = self.docs.len() as u32;
        let mut live = LiveDocs::new(doc_count);

        let mut field_names: BTreeMap<String, ()> = BTreeMap::new();
        for doc in &self.docs {
            for field in &doc.fields {
                field_names.entry(field.name.clone()).or_insert(());
            }
        }

        let mut doc_values: BTreeMap<String, Vec<Option<FieldValue>>> = BTreeMap::new();
        for name in field_names.keys() {
            let column = self
                .docs
                .iter()
                .map(|doc| {
                    doc.fields
                        .iter()
                        .rfind(|f| &f.name == name)
                        .map(|f| f.value.clone())
                })
                .collect();
            doc_values.insert(name.clone(), column);
        }

        for (i, doc) in self.docs.iter().enumerate() {
            if doc.deleted {
                live.delete(DocNo::new(i as u32));
            }
        }

        let data = SegmentData {
            doc_count,
            postings: self.postings,
            doc_values,
        };
        (data, live, self.max_seq)
    }
}

impl DocValueView for ThreadBuffer {
    fn doc_count(&self) -> u32 {
        self.docs.len() as u32
    }

    fn value(&self, field: &str, docno: DocNo) -> Option<FieldValue> {
        self.docs
            .get(docno.as_usize())
            .and_then(|doc| doc.fields.iter().rfind(|f| f.name == field))
            .map(|f| f.value.clone())
    }
}

pub(crate) fn validate_document(doc: &Document) -> Result<()> {
    if doc.fields.is_empty() {
        return Err(TidepoolError::NonAborting("document has no fields".into()));
    }
    for field in &doc.fields {
        if field.name.is_empty() {
            return Err(TidepoolError::NonAborting("empty field name".into()));
        }
        if let FieldValue::Keyword(text) = &field.value {
            if text.is_empty() {
                return Err(TidepoolError::NonAborting(format!(
                    "empty keyword term for field '{}'",
                    field.name
                )));
            }
        }
    }
    Ok(())
}

/// Pool of thread buffers. An indexing call checks out any free buffer
/// (creating one up to the cap), so a flush of one buffer never blocks
/// the others.
pub struct BufferPool {
    slots: Mutex<Vec<Arc<Mutex<ThreadBuffer>>>>,
    max_slots: usize,
}

impl BufferPool {
    pub fn new(max_slots: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            max_slots: max_slots.max(1),
        }
    }

    fn slot_list(&self) -> Vec<Arc<Mutex<ThreadBuffer>>> {
        self.slots.lock().clone()
    }

    /// Run `f` against a buffer no other thread currently holds.
    pub fn with_free_buffer<R>(&self, f: impl FnOnce(&mut ThreadBuffer) -> R) -> R {
        for slot in self.slot_list() {
            if let Some(mut guard) = slot.try_lock() {
                return f(&mut guard);
            }
        }
        {
            let mut slots = self.slots.lock();
            if slots.len() < self.max_slots {
                let slot = Arc::new(Mutex::new(ThreadBuffer::new()));
                slots.push(Arc::clone(&slot));
                drop(slots);
                let mut guard = slot.lock();
                return f(&mut guard);
            }
        }
        // Every slot busy and the pool is at capacity: wait on one.
        let slot = self.slot_list().into_iter().next().expect("pool at capacity");
        let mut guard = slot.lock();
        f(&mut guard)
    }

    /// Apply `f` to every buffer in turn (eager delete/update paths).
    pub fn apply_to_all(&self, mut f: impl FnMut(&mut ThreadBuffer)) {
        for slot in self.slot_list() {
            let mut guard = slot.lock();
            f(&mut guard);
        }
    }

    /// Take the contents of the fullest non-empty buffer, leaving an
    /// empty buffer in its place. The slot is only locked for the swap.
    pub fn take_largest(&self) -> Option<ThreadBuffer> {
        let mut best: Option<Arc<Mutex<ThreadBuffer>>> = None;
        let mut best_bytes = 0usize;
        for slot in self.slot_list() {
            let guard = slot.lock();
            if !guard.is_empty() && guard.ram_bytes() >= best_bytes {
                best_bytes = guard.ram_bytes();
                drop(guard);
                best = Some(slot);
            }
        }
        best.map(|slot| std::mem::take(&mut *slot.lock()))
    }

    /// Take the contents of every non-empty buffer.
    pub fn take_all(&self) -> Vec<ThreadBuffer> {
        let mut taken = Vec::new();
        for slot in self.slot_list() {
            let mut guard = slot.lock();
            if !guard.is_empty() {
                taken.push(std::mem::take(&mut *guard));
            }
        }
        taken
    }

    /// Discard every buffered document.
    pub fn discard_all(&self) {
        for slot in self.slot_list() {
            *slot.lock() = ThreadBuffer::new();
        }
    }

    pub fn ram_bytes_used(&self) -> usize {
        self.slot_list().iter().map(|s| s.lock().ram_bytes()).sum()
    }

    pub fn buffered_doc_count(&self) -> u32 {
        self.slot_list().iter().map(|s| s.lock().doc_count()).sum()
    }

    pub fn buffered_live_doc_count(&self) -> u32 {
        self.slot_list()
            .iter()
            .map(|s| s.lock().live_doc_count())
            .sum()
    }

    pub fn largest_buffer_docs(&self) -> u32 {
        self.slot_list()
            .iter()
            .map(|s| s.lock().doc_count())
            .max()
            .unwrap_or(0)
    }
}
