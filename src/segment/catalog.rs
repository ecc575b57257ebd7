//! Segment metadata catalog
//!
//! The catalog is the durable commit point: an ordered set of segments,
//! the catalog's own generation, and opaque user commit data. Publishing
//! a new generation follows the atomicity protocol:
//! 1. Referenced segment files are written and fsynced first
//! 2. Write cat_<gen>.pending and fsync it
//! 3. Atomic rename to cat_<gen>.bin, fsync directory
//!
//! A crash between steps leaves a pending file that loading ignores.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::codec::{frame_bytes, unframe_bytes};
use crate::directory::Directory;
use crate::error::{Result, TidepoolError};

use super::types::{Generation, SegmentId, SeqNo};

/// Immutable description of a flushed segment.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentInfo {
    /// Unique segment ordinal
    pub id: SegmentId,
    /// Number of documents in the segment, including deleted ones
    pub doc_count: u32,
    /// Highest sequence number of any document in the segment at flush
    pub max_seq: SeqNo,
    /// Codec identifier used to write the segment files
    pub codec: String,
    /// Whether the segment is stored as a single compound file
    pub compound: bool,
    /// Total size of the base files in bytes
    pub size_bytes: u64,
    /// Base file names written by the codec
    pub files: Vec<String>,
}

impl SegmentInfo {
    pub fn name(&self) -> String {
        self.id.to_string()
    }

    pub fn live_docs_file(&self, gen: Generation) -> String {
        format!("{}_{}.liv", self.name(), gen)
    }

    pub fn field_updates_file(&self, gen: Generation) -> String {
        format!("{}_{}.fup", self.name(), gen)
    }
}

/// Catalog state for one segment: the immutable info plus the mutable
/// generation counters for its liveness and field-update files.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentEntry {
    pub info: SegmentInfo,
    /// Generation of the live-docs file; 0 means all documents live
    pub del_gen: Generation,
    /// Generation of the field-updates file; 0 means none
    pub update_gen: Generation,
    /// Number of deleted documents recorded in the live-docs file
    pub del_count: u32,
    /// Buffered updates with sequence numbers at or below this watermark
    /// have already been resolved against this segment
    pub applied_seq: SeqNo,
}

impl SegmentEntry {
    pub fn new(info: SegmentInfo) -> Self {
        let applied_seq = info.max_seq;
        Self {
            info,
            del_gen: 0,
            update_gen: 0,
            del_count: 0,
            applied_seq,
        }
    }

    pub fn id(&self) -> SegmentId {
        self.info.id
    }

    pub fn live_doc_count(&self) -> u32 {
        self.info.doc_count - self.del_count
    }

    pub fn delete_ratio(&self) -> f64 {
        if self.info.doc_count == 0 {
            0.0
        } else {
            self.del_count as f64 / self.info.doc_count as f64
        }
    }

    pub fn live_docs_file(&self) -> Option<String> {
        (self.del_gen > 0).then(|| self.info.live_docs_file(self.del_gen))
    }

    pub fn field_updates_file(&self) -> Option<String> {
        (self.update_gen > 0).then(|| self.info.field_updates_file(self.update_gen))
    }

    /// Every file this entry references at its current generations.
    pub fn all_files(&self) -> Vec<String> {
        let mut files = self.info.files.clone();
        files.extend(self.live_docs_file());
        files.extend(self.field_updates_file());
        files
    }
}

/// The durable, versioned list of segments constituting one consistent
/// index state.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SegmentCatalog {
    /// Catalog format version (for upgrades)
    pub format: u32,
    /// Generation of this commit point
    pub generation: Generation,
    /// Next segment ordinal to allocate
    pub next_segment_id: SegmentId,
    /// Highest sequence number issued before this commit
    pub last_seq: SeqNo,
    /// Committed segments in order
    pub entries: Vec<SegmentEntry>,
    /// Opaque user commit data
    pub user_data: BTreeMap<String, String>,
}

impl SegmentCatalog {
    /// Current catalog format version
    pub const FORMAT: u32 = 1;

    pub fn new() -> Self {
        Self {
            format: Self::FORMAT,
            generation: 0,
            next_segment_id: SegmentId::new(0),
            last_seq: 0,
            entries: Vec::new(),
            user_data: BTreeMap::new(),
        }
    }

    pub fn segment_count(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn total_doc_count(&self) -> u64 {
        self.entries.iter().map(|e| e.info.doc_count as u64).sum()
    }

    pub fn total_live_doc_count(&self) -> u64 {
        self.entries.iter().map(|e| e.live_doc_count() as u64).sum()
    }

    pub fn get_entry(&self, id: SegmentId) -> Option<&SegmentEntry> {
        self.entries.iter().find(|e| e.id() == id)
    }

    /// Every file referenced by this commit point, excluding the catalog
    /// file itself.
    pub fn referenced_files(&self) -> Vec<String> {
        self.entries.iter().flat_map(|e| e.all_files()).collect()
    }

    pub fn file_name(&self) -> String {
        catalog_file_name(self.generation)
    }

    fn encode(&self) -> Result<Vec<u8>> {
        let payload = bincode::serialize(self)?;
        Ok(frame_bytes(&payload))
    }

    fn decode(resource: &str, data: &[u8]) -> Result<Self> {
        let payload = unframe_bytes(resource, data)?;
        let catalog: SegmentCatalog = bincode::deserialize(payload)
            .map_err(|e| TidepoolError::corrupt(resource, e.to_string()))?;
        if catalog.format != Self::FORMAT {
            return Err(TidepoolError::corrupt(
                resource,
                format!("unsupported catalog format {}", catalog.format),
            ));
        }
        Ok(catalog)
    }

    /// Write this catalog as a pending (unpublished) generation file.
    /// The caller must have made all referenced segment files durable
    /// first. Returns the pending file name.
    pub fn persist_pending(&self, dir: &dyn Directory) -> Result<String> {
        let name = pending_file_name(self.generation);
        dir.write_file(&name, &self.encode()?)?;
        dir.sync(std::slice::from_ref(&name))?;
        Ok(name)
    }

    /// Atomically publish a previously written pending file.
    pub fn publish(&self, dir: &dyn Directory) -> Result<Generation> {
        dir.rename(&pending_file_name(self.generation), &self.file_name())?;
        Ok(self.generation)
    }

    /// Load the latest published generation. Fails with `NoCatalog` when
    /// the directory holds no published generation at all, and with
    /// `CorruptData` when the latest generation exists but does not
    /// validate.
    pub fn load(dir: &dyn Directory) -> Result<Self> {
        let mut gens = published_generations(dir)?;
        match gens.pop() {
            None => Err(TidepoolError::NoCatalog),
            Some(gen) => Self::load_generation(dir, gen),
        }
    }

    /// Load a specific published generation.
    pub fn load_generation(dir: &dyn Directory, gen: Generation) -> Result<Self> {
        let name = catalog_file_name(gen);
        let data = dir.read_file(&name)?;
        let catalog = Self::decode(&name, &data)?;
        if catalog.generation != gen {
            return Err(TidepoolError::corrupt(
                &name,
                format!("file claims generation {}", catalog.generation),
            ));
        }
        Ok(catalog)
    }

    /// Like `load`, but when the latest generation is corrupt, explicitly
    /// fall back to the newest prior generation that validates. The
    /// original corruption error is surfaced when no prior generation
    /// exists.
    pub fn load_with_fallback(dir: &dyn Directory) -> Result<Self> {
        let gens = published_generations(dir)?;
        if gens.is_empty() {
            return Err(TidepoolError::NoCatalog);
        }
        let mut first_err = None;
        for gen in gens.into_iter().rev() {
            match Self::load_generation(dir, gen) {
                Ok(catalog) => {
                    if first_err.is_some() {
                        warn!(generation = gen, "fell back to prior catalog generation");
                    }
                    return Ok(catalog);
                }
                Err(e) => {
                    first_err.get_or_insert(e);
                }
            }
        }
        Err(first_err.expect("at least one generation was attempted"))
    }

    /// All loadable published commit points, oldest first. Corrupt
    /// retained generations are skipped with a warning.
    pub fn list_commits(dir: &dyn Directory) -> Result<Vec<SegmentCatalog>> {
        let gens = published_generations(dir)?;
        if gens.is_empty() {
            return Err(TidepoolError::NoCatalog);
        }
        let mut commits = Vec::new();
        for gen in gens {
            match Self::load_generation(dir, gen) {
                Ok(catalog) => commits.push(catalog),
                Err(e) => warn!(generation = gen, error = %e, "skipping unloadable commit"),
            }
        }
        Ok(commits)
    }
}

impl Default for SegmentCatalog {
    fn default() -> Self {
        Self::new()
    }
}

pub fn catalog_file_name(gen: Generation) -> String {
    format!("cat_{}.bin", gen)
}

pub fn pending_file_name(gen: Generation) -> String {
    format!("cat_{}.pending", gen)
}

/// Parse a published catalog file name back into its generation.
pub fn parse_catalog_file_name(name: &str) -> Option<Generation> {
    name.strip_prefix("cat_")?
        .strip_suffix(".bin")?
        .parse()
        .ok()
}

/// Parse a pending catalog file name back into its generation.
pub fn parse_pending_file_name(name: &str) -> Option<Generation> {
    name.strip_prefix("cat_")?
        .strip_suffix(".pending")?
        .parse()
        .ok()
}

fn published_generations(dir: &dyn Directory) -> Result<Vec<Generation>> {
    let mut gens: Vec<_> = dir
        .list_all()?
        .iter()
        .filter_map(|n| parse_catalog_file_name(n))
        .collect();
    gens.sort_unstable();
    Ok(gens)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::RamDirectory;

    fn test_info(id: u64, doc_count: u32) -> SegmentInfo {
        SegmentInfo {
            id: SegmentId::new(id),
            doc_count,
            max_seq: doc_count as u64,
            codec: "plain-v1".to_string(),
            compound: false,
            size_bytes: 1024,
            files: vec![format!("seg_{}.dat", id)],
        }
    }

    fn persist_published(catalog: &mut SegmentCatalog, dir: &dyn Directory) {
        catalog.generation += 1;
        catalog.persist_pending(dir).unwrap();
        catalog.publish(dir).unwrap();
    }

    #[test]
    fn test_entry_accounting() {
        let mut entry = SegmentEntry::new(test_info(1, 100));
        assert_eq!(entry.live_doc_count(), 100);
        assert_eq!(entry.delete_ratio(), 0.0);
        assert!(entry.live_docs_file().is_none());

        entry.del_gen = 2;
        entry.del_count = 25;
        assert_eq!(entry.live_doc_count(), 75);
        assert_eq!(entry.delete_ratio(), 0.25);
        assert_eq!(entry.live_docs_file(), Some("seg_1_2.liv".to_string()));
        assert_eq!(
            entry.all_files(),
            vec!["seg_1.dat".to_string(), "seg_1_2.liv".to_string()]
        );
    }

    #[test]
    fn test_load_empty_directory_is_distinct_from_corruption() {
        let dir = RamDirectory::new();
        assert!(matches!(
            SegmentCatalog::load(&dir),
            Err(TidepoolError::NoCatalog)
        ));
    }

    #[test]
    fn test_persist_and_load_roundtrip() {
        let dir = RamDirectory::new();
        let mut catalog = SegmentCatalog::new();
        catalog.entries.push(SegmentEntry::new(test_info(0, 10)));
        catalog.next_segment_id = SegmentId::new(1);
        catalog
            .user_data
            .insert("writer".to_string(), "test".to_string());
        persist_published(&mut catalog, &dir);

        let loaded = SegmentCatalog::load(&dir).unwrap();
        assert_eq!(loaded, catalog);
        assert_eq!(loaded.total_doc_count(), 10);
        assert_eq!(loaded.user_data.get("writer").unwrap(), "test");
    }

    #[test]
    fn test_pending_generation_is_invisible() {
        let dir = RamDirectory::new();
        let mut catalog = SegmentCatalog::new();
        persist_published(&mut catalog, &dir);

        // A later prepare that never published must be ignored by load.
        let mut provisional = catalog.clone();
        provisional.generation += 1;
        provisional.persist_pending(&dir).unwrap();

        let loaded = SegmentCatalog::load(&dir).unwrap();
        assert_eq!(loaded.generation, catalog.generation);
    }

    #[test]
    fn test_corrupt_latest_surfaces_by_default() {
        let dir = RamDirectory::new();
        let mut catalog = SegmentCatalog::new();
        persist_published(&mut catalog, &dir);
        persist_published(&mut catalog, &dir);

        // Flip bytes in the newest generation.
        let name = catalog_file_name(2);
        let mut data = dir.read_file(&name).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        dir.write_file(&name, &data).unwrap();

        assert!(matches!(
            SegmentCatalog::load(&dir),
            Err(TidepoolError::CorruptData { .. })
        ));

        // Explicit fallback recovers the prior generation.
        let fallback = SegmentCatalog::load_with_fallback(&dir).unwrap();
        assert_eq!(fallback.generation, 1);
    }

    #[test]
    fn test_fallback_with_no_valid_prior_surfaces_corruption() {
        let dir = RamDirectory::new();
        let mut catalog = SegmentCatalog::new();
        persist_published(&mut catalog, &dir);

        let name = catalog_file_name(1);
        dir.write_file(&name, b"garbage").unwrap();

        assert!(matches!(
            SegmentCatalog::load_with_fallback(&dir),
            Err(TidepoolError::CorruptData { .. })
        ));
    }

    #[test]
    fn test_list_commits_ascending() {
        let dir = RamDirectory::new();
        let mut catalog = SegmentCatalog::new();
        persist_published(&mut catalog, &dir);
        catalog.entries.push(SegmentEntry::new(test_info(0, 5)));
        persist_published(&mut catalog, &dir);

        let commits = SegmentCatalog::list_commits(&dir).unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].generation, 1);
        assert_eq!(commits[1].generation, 2);
        assert_eq!(commits[1].segment_count(), 1);
    }

    #[test]
    fn test_file_name_parsing() {
        assert_eq!(parse_catalog_file_name("cat_17.bin"), Some(17));
        assert_eq!(parse_catalog_file_name("cat_17.pending"), None);
        assert_eq!(parse_pending_file_name("cat_17.pending"), Some(17));
        assert_eq!(parse_catalog_file_name("seg_17.dat"), None);
    }
}
