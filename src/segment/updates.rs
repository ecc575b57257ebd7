//! Buffered update queue
//!
//! An append-only sequence of delete-by-term, delete-by-query, and
//! field-value-update entries, each stamped with a global sequence
//! number at submission time. Entries are applied eagerly to in-memory
//! buffers and lazily to flushed segments; for any document the final
//! liveness/value comes from the highest matching sequence number,
//! deletes and updates interleaving purely by sequence.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use super::types::{DocNo, FieldValue, SeqNo, Term};

/// Read access to per-document field values, implemented by both
/// in-memory buffers and segment readers so delete-by-query can run
/// against either.
pub trait DocValueView {
    fn doc_count(&self) -> u32;
    fn value(&self, field: &str, docno: DocNo) -> Option<FieldValue>;
}

/// A document-set selector evaluated against a value view. The query
/// layer proper lives outside the engine; resolution only needs the
/// matching docnos.
pub trait DeleteQuery: Send + Sync + fmt::Debug {
    fn matching_docs(&self, view: &dyn DocValueView) -> Vec<DocNo>;
}

/// Deletes every document whose stored value for `field` equals `value`.
#[derive(Clone, Debug)]
pub struct ValueMatchQuery {
    pub field: String,
    pub value: FieldValue,
}

impl ValueMatchQuery {
    pub fn new(field: impl Into<String>, value: FieldValue) -> Self {
        Self {
            field: field.into(),
            value,
        }
    }
}

impl DeleteQuery for ValueMatchQuery {
    fn matching_docs(&self, view: &dyn DocValueView) -> Vec<DocNo> {
        (0..view.doc_count())
            .map(DocNo::new)
            .filter(|d| view.value(&self.field, *d).as_ref() == Some(&self.value))
            .collect()
    }
}

/// One buffered operation.
#[derive(Clone, Debug)]
pub enum UpdateKind {
    DeleteTerm(Term),
    DeleteQuery(Arc<dyn DeleteQuery>),
    FieldValue {
        term: Term,
        field: String,
        value: FieldValue,
    },
    DeleteAll,
}

/// A buffered operation stamped with its submission sequence number.
#[derive(Clone, Debug)]
pub struct UpdateEntry {
    pub seq: SeqNo,
    pub kind: UpdateKind,
}

impl UpdateEntry {
    /// Approximate in-memory footprint, used for queue flush accounting.
    pub fn ram_bytes(&self) -> usize {
        let base = std::mem::size_of::<Self>();
        match &self.kind {
            UpdateKind::DeleteTerm(t) => base + t.field.len() + t.text.len(),
            UpdateKind::DeleteQuery(_) => base + 64,
            UpdateKind::FieldValue { term, field, value } => {
                base + term.field.len() + term.text.len() + field.len() + value.ram_bytes()
            }
            UpdateKind::DeleteAll => base,
        }
    }
}

/// Resolved field-value overlays for one segment, persisted under an
/// update generation. Each generation file carries the full overlay so
/// readers only consult the latest one.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct FieldUpdates {
    /// field name -> docno -> value
    pub values: BTreeMap<String, BTreeMap<u32, FieldValue>>,
}

impl FieldUpdates {
    pub fn set(&mut self, field: impl Into<String>, docno: u32, value: FieldValue) {
        self.values.entry(field.into()).or_default().insert(docno, value);
    }

    pub fn get(&self, field: &str, docno: u32) -> Option<&FieldValue> {
        self.values.get(field).and_then(|m| m.get(&docno))
    }

    pub fn is_empty(&self) -> bool {
        self.values.values().all(|m| m.is_empty())
    }

    pub fn num_updates(&self) -> usize {
        self.values.values().map(|m| m.len()).sum()
    }

    /// Rewrite docnos through a renumbering, dropping entries for
    /// documents the mapping no longer contains.
    pub fn remap_docnos(&self, map: impl Fn(u32) -> Option<u32>) -> FieldUpdates {
        let mut out = FieldUpdates::default();
        for (field, col) in &self.values {
            for (docno, value) in col {
                if let Some(new_docno) = map(*docno) {
                    out.set(field.clone(), new_docno, value.clone());
                }
            }
        }
        out
    }
}

/// The buffered update queue shared by all indexing threads. It is also
/// the authority for sequence numbers: every mutating operation draws
/// its stamp from here.
pub struct UpdateQueue {
    next_seq: AtomicU64,
    bytes: AtomicUsize,
    entries: Mutex<Vec<UpdateEntry>>,
}

impl UpdateQueue {
    /// `start_seq` is the highest sequence number already issued (from
    /// the last commit); the first operation gets `start_seq + 1`.
    pub fn new(start_seq: SeqNo) -> Self {
        Self {
            next_seq: AtomicU64::new(start_seq),
            bytes: AtomicUsize::new(0),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Draw the next global sequence number.
    pub fn next_seq(&self) -> SeqNo {
        self.next_seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Highest sequence number issued so far.
    pub fn last_seq(&self) -> SeqNo {
        self.next_seq.load(Ordering::SeqCst)
    }

    /// Append an already-stamped entry.
    pub fn push(&self, entry: UpdateEntry) {
        self.bytes.fetch_add(entry.ram_bytes(), Ordering::Relaxed);
        self.entries.lock().push(entry);
    }

    /// Clone the queued entries in sequence order.
    pub fn snapshot(&self) -> Vec<UpdateEntry> {
        self.entries.lock().clone()
    }

    /// Drop entries with `seq <= through`, typically after a resolution
    /// pass advanced every segment's watermark past them.
    pub fn prune_through(&self, through: SeqNo) {
        let mut entries = self.entries.lock();
        entries.retain(|e| e.seq > through);
        let remaining: usize = entries.iter().map(|e| e.ram_bytes()).sum();
        self.bytes.store(remaining, Ordering::Relaxed);
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
        self.bytes.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn ram_bytes_used(&self) -> usize {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Whether the accumulated entries crossed the resolution threshold.
    pub fn needs_resolution(&self, max_bytes: usize) -> bool {
        self.ram_bytes_used() >= max_bytes
    }
}
