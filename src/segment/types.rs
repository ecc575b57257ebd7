//! Core types for the segment-based document store

use serde::{Deserialize, Serialize};
use std::fmt;

/// Segment identifier (monotonically increasing per index)
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SegmentId(pub u64);

impl SegmentId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl fmt::Display for SegmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "seg_{}", self.0)
    }
}

/// Dense document number within a segment (0..doc_count)
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DocNo(pub u32);

impl DocNo {
    pub fn new(n: u32) -> Self {
        Self(n)
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

/// Global sequence number assigned to every mutating operation.
///
/// For any document, the final applied value or liveness is the one from
/// the highest sequence number among all entries matching it.
pub type SeqNo = u64;

/// Generation counter for the catalog or for a segment's liveness and
/// field-update files. Generation 0 means "no auxiliary file exists".
pub type Generation = u64;

/// An indexed (field, text) pair used to address documents.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Term {
    pub field: String,
    pub text: String,
}

impl Term {
    pub fn new(field: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            text: text.into(),
        }
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.field, self.text)
    }
}

/// A stored field value. Keyword values are also indexed as terms;
/// numeric and boolean values are stored as per-document values only.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    Keyword(String),
    Numeric(i64),
    Boolean(bool),
}

impl FieldValue {
    /// Approximate in-memory footprint, used for buffer accounting.
    pub fn ram_bytes(&self) -> usize {
        match self {
            FieldValue::Keyword(s) => std::mem::size_of::<Self>() + s.len(),
            _ => std::mem::size_of::<Self>(),
        }
    }
}

/// A named field within a document
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Field {
    pub name: String,
    pub value: FieldValue,
}

impl Field {
    pub fn new(name: impl Into<String>, value: FieldValue) -> Self {
        Self {
            name: name.into(),
            value,
        }
    }
}

/// A document to be indexed. Analysis happens outside the engine: keyword
/// fields arrive as the exact terms to index.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub fields: Vec<Field>,
}

impl Document {
    pub fn new() -> Self {
        Self { fields: Vec::new() }
    }

    pub fn add_field(&mut self, name: impl Into<String>, value: FieldValue) -> &mut Self {
        self.fields.push(Field::new(name, value));
        self
    }

    /// Convenience constructor for a single-keyword document
    pub fn with_keyword(name: impl Into<String>, text: impl Into<String>) -> Self {
        let mut doc = Self::new();
        doc.add_field(name, FieldValue::Keyword(text.into()));
        doc
    }

    /// Terms this document will be indexed under
    pub fn index_terms(&self) -> impl Iterator<Item = Term> + '_ {
        self.fields.iter().filter_map(|f| match &f.value {
            FieldValue::Keyword(text) => Some(Term::new(f.name.clone(), text.clone())),
            _ => None,
        })
    }

    /// Approximate in-memory footprint, used for buffer accounting.
    pub fn ram_bytes(&self) -> usize {
        self.fields
            .iter()
            .map(|f| f.name.len() + f.value.ram_bytes() + std::mem::size_of::<Field>())
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segment_id() {
        let id = SegmentId::new(42);
        assert_eq!(id.0, 42);
        assert_eq!(id.next().0, 43);
        assert_eq!(format!("{}", id), "seg_42");
    }

    #[test]
    fn test_docno() {
        let docno = DocNo::new(100);
        assert_eq!(docno.as_u32(), 100);
        assert_eq!(docno.as_usize(), 100);
    }

    #[test]
    fn test_term_display() {
        let term = Term::new("id", "doc-7");
        assert_eq!(term.to_string(), "id:doc-7");
    }

    #[test]
    fn test_document_index_terms() {
        let mut doc = Document::new();
        doc.add_field("id", FieldValue::Keyword("doc-1".to_string()));
        doc.add_field("rank", FieldValue::Numeric(3));
        doc.add_field("tag", FieldValue::Keyword("blue".to_string()));

        let terms: Vec<_> = doc.index_terms().collect();
        assert_eq!(terms.len(), 2);
        assert_eq!(terms[0], Term::new("id", "doc-1"));
        assert_eq!(terms[1], Term::new("tag", "blue"));
    }

    #[test]
    fn test_ram_accounting_grows_with_content() {
        let small = Document::with_keyword("id", "a");
        let large = Document::with_keyword("id", "a".repeat(100));
        assert!(large.ram_bytes() > small.ram_bytes());
    }
}
