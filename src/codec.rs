//! Pluggable segment serialization
//!
//! The engine is agnostic to the byte layout of segment files; it only
//! requires that a codec can be named, resolved by the identifier stored
//! in segment metadata, and that reading back what it wrote either
//! succeeds or fails with a checksum error. An unregistered codec
//! identifier fails distinctly when opening a segment.
//!
//! Record framing for engine-owned files:
//! - u32 payload length (little endian)
//! - u32 crc32 of payload
//! - raw payload bytes

use std::collections::BTreeMap;
use std::sync::{Arc, OnceLock};

use crc32fast::Hasher;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::directory::Directory;
use crate::error::{Result, TidepoolError};
use crate::segment::catalog::SegmentInfo;
use crate::segment::live_docs::LiveDocs;
use crate::segment::types::{FieldValue, Generation, Term};
use crate::segment::updates::FieldUpdates;

/// Frame a payload with its length and crc32.
pub fn frame_bytes(payload: &[u8]) -> Vec<u8> {
    let mut hasher = Hasher::new();
    hasher.update(payload);
    let crc = hasher.finalize();

    let mut out = Vec::with_capacity(payload.len() + 8);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&crc.to_le_bytes());
    out.extend_from_slice(payload);
    out
}

/// Validate framing and return the payload slice.
pub fn unframe_bytes<'a>(resource: &str, data: &'a [u8]) -> Result<&'a [u8]> {
    if data.len() < 8 {
        return Err(TidepoolError::corrupt(resource, "truncated header"));
    }
    let len = u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize;
    let stored_crc = u32::from_le_bytes([data[4], data[5], data[6], data[7]]);
    if data.len() != len + 8 {
        return Err(TidepoolError::corrupt(
            resource,
            format!("length mismatch: header says {}, have {}", len, data.len() - 8),
        ));
    }
    let payload = &data[8..];
    let mut hasher = Hasher::new();
    hasher.update(payload);
    if hasher.finalize() != stored_crc {
        return Err(TidepoolError::corrupt(resource, "checksum mismatch"));
    }
    Ok(payload)
}

/// Decoded contents of one segment as exchanged with a codec.
///
/// Postings map each term to the ascending docnos containing it; doc
/// values are dense per-field columns. Deleted documents stay present in
/// both; liveness is tracked separately.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SegmentData {
    pub doc_count: u32,
    pub postings: BTreeMap<Term, Vec<u32>>,
    pub doc_values: BTreeMap<String, Vec<Option<FieldValue>>>,
}

impl SegmentData {
    pub fn docs_for_term(&self, term: &Term) -> &[u32] {
        self.postings.get(term).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn value(&self, field: &str, docno: u32) -> Option<&FieldValue> {
        self.doc_values
            .get(field)
            .and_then(|col| col.get(docno as usize))
            .and_then(|v| v.as_ref())
    }
}

/// Pluggable serializer for segment file formats.
pub trait Codec: Send + Sync + std::fmt::Debug {
    fn name(&self) -> &'static str;

    /// Write the base files for a segment. Returns the file names
    /// created; callers are responsible for syncing them.
    fn write_segment(
        &self,
        dir: &dyn Directory,
        info: &SegmentInfo,
        data: &SegmentData,
    ) -> Result<Vec<String>>;

    fn read_segment(&self, dir: &dyn Directory, info: &SegmentInfo) -> Result<SegmentData>;

    fn write_live_docs(
        &self,
        dir: &dyn Directory,
        info: &SegmentInfo,
        gen: Generation,
        live: &LiveDocs,
    ) -> Result<String>;

    fn read_live_docs(
        &self,
        dir: &dyn Directory,
        info: &SegmentInfo,
        gen: Generation,
    ) -> Result<LiveDocs>;

    fn write_field_updates(
        &self,
        dir: &dyn Directory,
        info: &SegmentInfo,
        gen: Generation,
        updates: &FieldUpdates,
    ) -> Result<String>;

    fn read_field_updates(
        &self,
        dir: &dyn Directory,
        info: &SegmentInfo,
        gen: Generation,
    ) -> Result<FieldUpdates>;
}

/// Default codec: bincode payloads inside crc32 framing, one compound
/// file per segment.
#[derive(Debug, Default)]
pub struct PlainCodec;

impl PlainCodec {
    pub const NAME: &'static str = "plain-v1";

    fn segment_file(info: &SegmentInfo) -> String {
        format!("{}.dat", info.name())
    }
}

impl Codec for PlainCodec {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    fn write_segment(
        &self,
        dir: &dyn Directory,
        info: &SegmentInfo,
        data: &SegmentData,
    ) -> Result<Vec<String>> {
        let name = Self::segment_file(info);
        let payload = bincode::serialize(data)?;
        dir.write_file(&name, &frame_bytes(&payload))?;
        Ok(vec![name])
    }

    fn read_segment(&self, dir: &dyn Directory, info: &SegmentInfo) -> Result<SegmentData> {
        let name = Self::segment_file(info);
        let raw = dir.read_file(&name)?;
        let payload = unframe_bytes(&name, &raw)?;
        let data: SegmentData =
            bincode::deserialize(payload).map_err(|e| TidepoolError::corrupt(&name, e.to_string()))?;
        if data.doc_count != info.doc_count {
            return Err(TidepoolError::corrupt(
                &name,
                format!(
                    "doc count mismatch: metadata says {}, file has {}",
                    info.doc_count, data.doc_count
                ),
            ));
        }
        Ok(data)
    }

    fn write_live_docs(
        &self,
        dir: &dyn Directory,
        info: &SegmentInfo,
        gen: Generation,
        live: &LiveDocs,
    ) -> Result<String> {
        let name = info.live_docs_file(gen);
        dir.write_file(&name, &frame_bytes(&live.to_bytes()?))?;
        Ok(name)
    }

    fn read_live_docs(
        &self,
        dir: &dyn Directory,
        info: &SegmentInfo,
        gen: Generation,
    ) -> Result<LiveDocs> {
        let name = info.live_docs_file(gen);
        let raw = dir.read_file(&name)?;
        LiveDocs::from_bytes(unframe_bytes(&name, &raw)?)
    }

    fn write_field_updates(
        &self,
        dir: &dyn Directory,
        info: &SegmentInfo,
        gen: Generation,
        updates: &FieldUpdates,
    ) -> Result<String> {
        let name = info.field_updates_file(gen);
        let payload = bincode::serialize(updates)?;
        dir.write_file(&name, &frame_bytes(&payload))?;
        Ok(name)
    }

    fn read_field_updates(
        &self,
        dir: &dyn Directory,
        info: &SegmentInfo,
        gen: Generation,
    ) -> Result<FieldUpdates> {
        let name = info.field_updates_file(gen);
        let raw = dir.read_file(&name)?;
        bincode::deserialize(unframe_bytes(&name, &raw)?)
            .map_err(|e| TidepoolError::corrupt(&name, e.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Codec registry

static REGISTRY: OnceLock<DashMap<String, Arc<dyn Codec>>> = OnceLock::new();

fn registry() -> &'static DashMap<String, Arc<dyn Codec>> {
    REGISTRY.get_or_init(|| {
        let map: DashMap<String, Arc<dyn Codec>> = DashMap::new();
        map.insert(PlainCodec::NAME.to_string(), Arc::new(PlainCodec));
        map
    })
}

/// Register a codec under its name, replacing any previous registration.
pub fn register_codec(codec: Arc<dyn Codec>) {
    registry().insert(codec.name().to_string(), codec);
}

/// Resolve a codec by the identifier stored in segment metadata.
pub fn resolve_codec(name: &str) -> Result<Arc<dyn Codec>> {
    registry()
        .get(name)
        .map(|entry| Arc::clone(entry.value()))
        .ok_or_else(|| TidepoolError::UnknownCodec(name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::RamDirectory;
    use crate::segment::types::{DocNo, SegmentId};

    fn test_info(id: u64, doc_count: u32) -> SegmentInfo {
        SegmentInfo {
            id: SegmentId::new(id),
            doc_count,
            max_seq: 0,
            codec: PlainCodec::NAME.to_string(),
            compound: true,
            size_bytes: 0,
            files: Vec::new(),
        }
    }

    #[test]
    fn test_framing_roundtrip() {
        let framed = frame_bytes(b"payload");
        assert_eq!(unframe_bytes("x", &framed).unwrap(), b"payload");
    }

    #[test]
    fn test_framing_detects_corruption() {
        let mut framed = frame_bytes(b"payload");
        let last = framed.len() - 1;
        framed[last] ^= 0x01;
        assert!(matches!(
            unframe_bytes("x", &framed),
            Err(TidepoolError::CorruptData { .. })
        ));
    }

    #[test]
    fn test_framing_detects_truncation() {
        let framed = frame_bytes(b"payload");
        assert!(unframe_bytes("x", &framed[..framed.len() - 2]).is_err());
        assert!(unframe_bytes("x", &framed[..4]).is_err());
    }

    #[test]
    fn test_segment_roundtrip() {
        let dir = RamDirectory::new();
        let info = test_info(3, 2);

        let mut data = SegmentData {
            doc_count: 2,
            ..Default::default()
        };
        data.postings.insert(Term::new("id", "a"), vec![0]);
        data.postings.insert(Term::new("id", "b"), vec![1]);
        data.doc_values.insert(
            "id".to_string(),
            vec![
                Some(FieldValue::Keyword("a".to_string())),
                Some(FieldValue::Keyword("b".to_string())),
            ],
        );

        let codec = PlainCodec;
        let files = codec.write_segment(&dir, &info, &data).unwrap();
        assert_eq!(files, vec!["seg_3.dat".to_string()]);

        let read = codec.read_segment(&dir, &info).unwrap();
        assert_eq!(read, data);
        assert_eq!(read.docs_for_term(&Term::new("id", "a")), &[0]);
        assert_eq!(
            read.value("id", 1),
            Some(&FieldValue::Keyword("b".to_string()))
        );
        assert_eq!(read.value("id", 5), None);
    }

    #[test]
    fn test_live_docs_roundtrip() {
        let dir = RamDirectory::new();
        let info = test_info(1, 4);
        let codec = PlainCodec;

        let mut live = LiveDocs::new(4);
        live.delete(DocNo(2));

        let name = codec.write_live_docs(&dir, &info, 1, &live).unwrap();
        assert_eq!(name, "seg_1_1.liv");
        let read = codec.read_live_docs(&dir, &info, 1).unwrap();
        assert_eq!(read, live);
    }

    #[test]
    fn test_field_updates_roundtrip() {
        let dir = RamDirectory::new();
        let info = test_info(2, 4);
        let codec = PlainCodec;

        let mut updates = FieldUpdates::default();
        updates.set("rank", 1, FieldValue::Numeric(9));

        codec.write_field_updates(&dir, &info, 3, &updates).unwrap();
        let read = codec.read_field_updates(&dir, &info, 3).unwrap();
        assert_eq!(read, updates);
    }

    #[test]
    fn test_unknown_codec_is_distinct() {
        let err = resolve_codec("vendored-v7").unwrap_err();
        assert!(matches!(err, TidepoolError::UnknownCodec(_)));
    }

    #[test]
    fn test_default_codec_registered() {
        let codec = resolve_codec(PlainCodec::NAME).unwrap();
        assert_eq!(codec.name(), PlainCodec::NAME);
    }
}
