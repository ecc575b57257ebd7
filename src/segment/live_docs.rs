//! Per-segment liveness bitmap
//!
//! An absent bitmap means every document in the segment is live. Once a
//! document is marked dead it can never become live again; there is no
//! undelete API on purpose.

use roaring::RoaringBitmap;

use crate::error::{Result, TidepoolError};

use super::types::DocNo;

/// Marks which documents in a segment are not deleted.
#[derive(Clone, Debug, PartialEq)]
pub struct LiveDocs {
    doc_count: u32,
    deleted: RoaringBitmap,
}

impl LiveDocs {
    pub fn new(doc_count: u32) -> Self {
        Self {
            doc_count,
            deleted: RoaringBitmap::new(),
        }
    }

    pub fn doc_count(&self) -> u32 {
        self.doc_count
    }

    /// Mark a document dead. Returns true if it was live before.
    pub fn delete(&mut self, docno: DocNo) -> bool {
        if docno.as_u32() >= self.doc_count {
            return false;
        }
        self.deleted.insert(docno.as_u32())
    }

    pub fn is_deleted(&self, docno: DocNo) -> bool {
        self.deleted.contains(docno.as_u32())
    }

    pub fn is_live(&self, docno: DocNo) -> bool {
        docno.as_u32() < self.doc_count && !self.deleted.contains(docno.as_u32())
    }

    pub fn live_count(&self) -> u32 {
        self.doc_count - self.deleted.len() as u32
    }

    pub fn deleted_count(&self) -> u32 {
        self.deleted.len() as u32
    }

    pub fn delete_ratio(&self) -> f64 {
        if self.doc_count == 0 {
            0.0
        } else {
            self.deleted.len() as f64 / self.doc_count as f64
        }
    }

    /// Iterate over live docnos in ascending order
    pub fn live_iter(&self) -> impl Iterator<Item = DocNo> + '_ {
        (0..self.doc_count)
            .filter(move |n| !self.deleted.contains(*n))
            .map(DocNo::new)
    }

    /// Docnos dead in `self` but live in `earlier`: the deletes that
    /// arrived between the two snapshots.
    pub fn newly_deleted_since(&self, earlier: &LiveDocs) -> Vec<DocNo> {
        (&self.deleted - &earlier.deleted)
            .iter()
            .map(DocNo::new)
            .collect()
    }

    /// Serialize to bytes: doc_count (u32 LE) followed by the bitmap.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.doc_count.to_le_bytes());
        self.deleted
            .serialize_into(&mut out)
            .map_err(TidepoolError::Io)?;
        Ok(out)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < 4 {
            return Err(TidepoolError::corrupt("live docs", "truncated header"));
        }
        let doc_count = u32::from_le_bytes([data[0], data[1], data[2], data[3]]);
        let deleted = RoaringBitmap::deserialize_from(&data[4..])
            .map_err(|e| TidepoolError::corrupt("live docs", e.to_string()))?;
        Ok(Self { doc_count, deleted })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_all_live_initially() {
        let live = LiveDocs::new(5);
        assert_eq!(live.live_count(), 5);
        assert_eq!(live.deleted_count(), 0);
        assert!(live.is_live(DocNo(0)));
        assert!(live.is_live(DocNo(4)));
        assert!(!live.is_live(DocNo(5)));
    }

    #[test]
    fn test_delete_is_permanent() {
        let mut live = LiveDocs::new(3);
        assert!(live.delete(DocNo(1)));
        assert!(live.is_deleted(DocNo(1)));
        assert_eq!(live.live_count(), 2);

        // A second delete of the same document is a no-op
        assert!(!live.delete(DocNo(1)));
        assert_eq!(live.live_count(), 2);
    }

    #[test]
    fn test_delete_out_of_range_ignored() {
        let mut live = LiveDocs::new(2);
        assert!(!live.delete(DocNo(9)));
        assert_eq!(live.live_count(), 2);
    }

    #[test]
    fn test_live_iter_skips_deleted() {
        let mut live = LiveDocs::new(4);
        live.delete(DocNo(1));
        live.delete(DocNo(3));
        let live_docs: Vec<_> = live.live_iter().collect();
        assert_eq!(live_docs, vec![DocNo(0), DocNo(2)]);
    }

    #[test]
    fn test_newly_deleted_since() {
        let mut before = LiveDocs::new(6);
        before.delete(DocNo(0));

        let mut after = before.clone();
        after.delete(DocNo(2));
        after.delete(DocNo(5));

        assert_eq!(after.newly_deleted_since(&before), vec![DocNo(2), DocNo(5)]);
        assert!(before.newly_deleted_since(&before).is_empty());
    }

    #[test]
    fn test_serialization_roundtrip() {
        let mut live = LiveDocs::new(100);
        live.delete(DocNo(7));
        live.delete(DocNo(42));

        let bytes = live.to_bytes().unwrap();
        let restored = LiveDocs::from_bytes(&bytes).unwrap();
        assert_eq!(restored, live);
        assert_eq!(restored.live_count(), 98);
    }

    #[test]
    fn test_deserialize_truncated_fails() {
        assert!(LiveDocs::from_bytes(&[1, 2]).is_err());
    }

    #[test]
    fn test_delete_ratio() {
        let mut live = LiveDocs::new(4);
        assert_eq!(live.delete_ratio(), 0.0);
        live.delete(DocNo(0));
        assert_eq!(live.delete_ratio(), 0.25);
        assert_eq!(LiveDocs::new(0).delete_ratio(), 0.0);
    }
}
