//! Merge policy and scheduling
//!
//! Segment consolidation runs concurrently with indexing. A policy
//! selects groups of segments to combine; a scheduler executes them,
//! inline or on background workers fed through a channel. A merge reads
//! each source's live docs at start, writes one consolidated segment of
//! live documents, and swaps sources for the result inside the catalog
//! critical section, re-resolving deletes and updates that arrived
//! while the merge ran through the document renumbering.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{unbounded, Sender};
use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::codec::SegmentData;
use crate::error::{Result, TidepoolError};

use super::catalog::{SegmentEntry, SegmentInfo};
use super::live_docs::LiveDocs;
use super::types::{DocNo, SegmentId};
use super::updates::DocValueView;
use super::writer::WriterCore;

/// Size and liveness summary a merge policy works from.
#[derive(Clone, Copy, Debug)]
pub struct SegmentStats {
    pub id: SegmentId,
    pub doc_count: u32,
    pub live_doc_count: u32,
    pub size_bytes: u64,
}

impl SegmentStats {
    pub fn delete_ratio(&self) -> f64 {
        if self.doc_count == 0 {
            0.0
        } else {
            1.0 - (self.live_doc_count as f64 / self.doc_count as f64)
        }
    }
}

/// A group of segments to combine into one.
#[derive(Clone, Debug, PartialEq)]
pub struct MergeSpec {
    pub segments: Vec<SegmentId>,
}

impl MergeSpec {
    pub fn new(segments: Vec<SegmentId>) -> Self {
        Self { segments }
    }
}

/// Selects merges from the current segment set.
pub trait MergePolicy: Send + Sync + fmt::Debug {
    /// Natural merges to run in the background.
    fn find_merges(&self, segments: &[SegmentStats]) -> Vec<MergeSpec>;

    /// Merges required to bring the index down to `max_segments`.
    fn find_forced_merges(&self, segments: &[SegmentStats], max_segments: usize) -> Vec<MergeSpec>;
}

/// Policy that never merges; for tests and tools that must disable the
/// behavior entirely.
#[derive(Clone, Debug, Default)]
pub struct NoMergePolicy;

impl MergePolicy for NoMergePolicy {
    fn find_merges(&self, _segments: &[SegmentStats]) -> Vec<MergeSpec> {
        Vec::new()
    }

    fn find_forced_merges(&self, _segments: &[SegmentStats], _max: usize) -> Vec<MergeSpec> {
        Vec::new()
    }
}

/// Configuration for the tiered merge policy
#[derive(Clone, Debug)]
pub struct MergePolicyConfig {
    /// Maximum size for a merged segment
    pub max_merged_segment_bytes: u64,
    /// Target number of segments per size tier
    pub segments_per_tier: usize,
    /// Minimum number of segments to merge at once
    pub min_merge_count: usize,
    /// Maximum number of segments to merge at once
    pub max_merge_count: usize,
    /// Delete ratio above which a segment is merged to reclaim space
    pub delete_ratio_threshold: f64,
    /// Segments below this size all land in the lowest tier
    pub floor_segment_bytes: u64,
}

impl Default for MergePolicyConfig {
    fn default() -> Self {
        Self {
            max_merged_segment_bytes: 5 * 1024 * 1024 * 1024, // 5GB
            segments_per_tier: 10,
            min_merge_count: 2,
            max_merge_count: 10,
            delete_ratio_threshold: 0.15,
            floor_segment_bytes: 1024 * 1024, // 1MB
        }
    }
}

/// Tiered merge policy: groups segments into size tiers and merges
/// same-tier runs, preferring segments carrying many deletes.
#[derive(Clone, Debug, Default)]
pub struct TieredMergePolicy {
    config: MergePolicyConfig,
}

impl TieredMergePolicy {
    pub fn new(config: MergePolicyConfig) -> Self {
        Self { config }
    }

    fn find_high_delete_merge(&self, segments: &[SegmentStats]) -> Option<MergeSpec> {
        let high: Vec<_> = segments
            .iter()
            .filter(|s| s.delete_ratio() > self.config.delete_ratio_threshold)
            .collect();
        if high.len() >= self.config.min_merge_count {
            Some(MergeSpec::new(
                high.iter()
                    .take(self.config.max_merge_count)
                    .map(|s| s.id)
                    .collect(),
            ))
        } else {
            None
        }
    }

    fn find_tier_merges(&self, segments: &[SegmentStats]) -> Vec<MergeSpec> {
        let mut tiers: HashMap<usize, Vec<SegmentStats>> = HashMap::new();
        for stat in segments {
            tiers.entry(self.size_to_tier(stat.size_bytes)).or_default().push(*stat);
        }

        let mut specs = Vec::new();
        let mut tier_keys: Vec<_> = tiers.keys().copied().collect();
        tier_keys.sort_unstable();
        for tier in tier_keys {
            let tier_segments = tiers.get_mut(&tier).expect("tier exists");
            if tier_segments.len() <= self.config.segments_per_tier {
                continue;
            }
            // Merge the smallest run of the overflowing tier.
            tier_segments.sort_by_key(|s| s.size_bytes);
            let count = (tier_segments.len() - self.config.segments_per_tier + 1)
                .clamp(self.config.min_merge_count, self.config.max_merge_count);
            if count > tier_segments.len() {
                continue;
            }
            let ids: Vec<_> = tier_segments.iter().take(count).map(|s| s.id).collect();
            let total: u64 = tier_segments
                .iter()
                .take(count)
                .map(|s| s.size_bytes)
                .sum();
            if total <= self.config.max_merged_segment_bytes {
                specs.push(MergeSpec::new(ids));
            }
        }
        specs
    }

    fn size_to_tier(&self, size: u64) -> usize {
        let floor = self.config.floor_segment_bytes.max(1);
        let ratio = (self.config.segments_per_tier as u64).max(2);
        if size <= floor {
            return 0;
        }
        let mut tier_max = floor * ratio;
        let mut tier = 0;
        while size > tier_max && tier < 10 {
            tier += 1;
            tier_max = tier_max.saturating_mul(ratio);
        }
        tier
    }
}

impl MergePolicy for TieredMergePolicy {
    fn find_merges(&self, segments: &[SegmentStats]) -> Vec<MergeSpec> {
        if segments.len() < self.config.min_merge_count {
            return Vec::new();
        }

        let mut specs = Vec::new();
        if let Some(spec) = self.find_high_delete_merge(segments) {
            specs.push(spec);
        }
        specs.extend(self.find_tier_merges(segments));

        // Later specs must not claim segments an earlier one already did.
        let mut claimed: HashSet<SegmentId> = HashSet::new();
        specs.retain(|spec| {
            if spec.segments.iter().any(|id| claimed.contains(id)) {
                return false;
            }
            claimed.extend(spec.segments.iter().copied());
            true
        });
        specs
    }

    fn find_forced_merges(&self, segments: &[SegmentStats], max_segments: usize) -> Vec<MergeSpec> {
        let max_segments = max_segments.max(1);
        if segments.len() <= max_segments {
            return Vec::new();
        }
        // Merge the smallest segments first; callers loop until the
        // target count is reached.
        let mut sorted: Vec<_> = segments.to_vec();
        sorted.sort_by_key(|s| s.size_bytes);
        let excess = segments.len() - max_segments + 1;
        let count = excess.min(self.config.max_merge_count).max(2);
        vec![MergeSpec::new(
            sorted.iter().take(count).map(|s| s.id).collect(),
        )]
    }
}

/// Receives merge failures. The default handler logs; the writer
/// disables merging (not itself) after a non-aborted failure until
/// `retry_merges` is called.
pub trait MergeFailureHandler: Send + Sync {
    fn on_merge_failure(&self, spec: &MergeSpec, error: &TidepoolError);
}

#[derive(Clone, Debug, Default)]
pub struct LoggingFailureHandler;

impl MergeFailureHandler for LoggingFailureHandler {
    fn on_merge_failure(&self, spec: &MergeSpec, error: &TidepoolError) {
        warn!(segments = ?spec.segments, error = %error, "merge failed");
    }
}

/// Executes merge specifications, sequentially or on background workers,
/// while indexing continues.
pub trait MergeScheduler: Send + Sync {
    fn merge(&self, core: &Arc<WriterCore>, specs: Vec<MergeSpec>) -> Result<()>;

    /// Block until every scheduled merge finished or failed.
    fn wait_for_idle(&self);

    /// Stop accepting work and join workers. Idempotent.
    fn shutdown(&self);
}

/// Runs each merge inline on the calling thread.
#[derive(Clone, Debug, Default)]
pub struct SerialMergeScheduler;

impl MergeScheduler for SerialMergeScheduler {
    fn merge(&self, core: &Arc<WriterCore>, specs: Vec<MergeSpec>) -> Result<()> {
        for spec in specs {
            run_scheduled_merge(core, &spec);
        }
        Ok(())
    }

    fn wait_for_idle(&self) {}

    fn shutdown(&self) {}
}

struct WorkerState {
    tx: Option<Sender<(Arc<WriterCore>, MergeSpec)>>,
    handles: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

/// Background merge workers fed by a channel.
pub struct ConcurrentMergeScheduler {
    workers: Mutex<Option<WorkerState>>,
    in_flight: Arc<InFlight>,
    max_threads: usize,
}

impl ConcurrentMergeScheduler {
    pub fn new(max_threads: usize) -> Self {
        Self {
            workers: Mutex::new(None),
            in_flight: Arc::new(InFlight::default()),
            max_threads: max_threads.max(1),
        }
    }

    fn ensure_workers(&self) -> Option<Sender<(Arc<WriterCore>, MergeSpec)>> {
        let mut workers = self.workers.lock();
        if let Some(state) = workers.as_ref() {
            return state.tx.clone();
        }
        let (tx, rx) = unbounded::<(Arc<WriterCore>, MergeSpec)>();
        let mut handles = Vec::with_capacity(self.max_threads);
        for i in 0..self.max_threads {
            let rx = rx.clone();
            let in_flight = Arc::clone(&self.in_flight);
            let handle = std::thread::Builder::new()
                .name(format!("tidepool-merge-{}", i))
                .spawn(move || {
                    while let Ok((core, spec)) = rx.recv() {
                        run_scheduled_merge(&core, &spec);
                        let mut count = in_flight.count.lock();
                        *count -= 1;
                        if *count == 0 {
                            in_flight.idle.notify_all();
                        }
                    }
                })
                .expect("spawn merge worker");
            handles.push(handle);
        }
        let sender = tx.clone();
        *workers = Some(WorkerState {
            tx: Some(tx),
            handles,
        });
        Some(sender)
    }
}

impl Default for ConcurrentMergeScheduler {
    fn default() -> Self {
        Self::new((num_cpus::get() / 2).max(1))
    }
}

impl MergeScheduler for ConcurrentMergeScheduler {
    fn merge(&self, core: &Arc<WriterCore>, specs: Vec<MergeSpec>) -> Result<()> {
        let Some(tx) = self.ensure_workers() else {
            return Ok(());
        };
        for spec in specs {
            *self.in_flight.count.lock() += 1;
            if tx.send((Arc::clone(core), spec)).is_err() {
                *self.in_flight.count.lock() -= 1;
                return Err(TidepoolError::MergeAborted);
            }
        }
        Ok(())
    }

    fn wait_for_idle(&self) {
        let mut count = self.in_flight.count.lock();
        while *count > 0 {
            self.in_flight.idle.wait(&mut count);
        }
    }

    fn shutdown(&self) {
        let state = {
            let mut workers = self.workers.lock();
            workers.take()
        };
        if let Some(mut state) = state {
            state.tx.take();
            for handle in state.handles {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for ConcurrentMergeScheduler {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run one scheduled merge and route the outcome back into the writer.
pub(crate) fn run_scheduled_merge(core: &Arc<WriterCore>, spec: &MergeSpec) {
    let result = execute_merge(core, spec);
    core.finish_merge(spec, result);
}

/// The merge proper: snapshot sources, write the consolidated segment,
/// and hand the swap to the catalog critical section.
pub(crate) fn execute_merge(core: &Arc<WriterCore>, spec: &MergeSpec) -> Result<()> {
    if core.merges_aborted() {
        return Err(TidepoolError::MergeAborted);
    }

    // Pin the sources at their current generations. Sources already
    // swapped away by a competing merge make this a silent no-op.
    let Some(entries) = core.entries_for(spec) else {
        debug!(segments = ?spec.segments, "merge sources no longer present, skipping");
        return Ok(());
    };
    let mut readers = Vec::with_capacity(entries.len());
    for entry in &entries {
        readers.push(core.open_pooled_reader(entry)?);
    }

    // Renumber live documents into the merged segment.
    let mut doc_maps: Vec<HashMap<u32, u32>> = Vec::with_capacity(readers.len());
    let mut start_live: Vec<LiveDocs> = Vec::with_capacity(readers.len());
    let mut next_docno = 0u32;
    for reader in &readers {
        if core.merges_aborted() {
            return Err(TidepoolError::MergeAborted);
        }
        let live = reader.live_docs();
        let mut map = HashMap::new();
        for docno in live.live_iter() {
            map.insert(docno.as_u32(), next_docno);
            next_docno += 1;
        }
        start_live.push(live);
        doc_maps.push(map);
    }

    if next_docno == 0 {
        // Nothing live anywhere: drop the sources without writing a
        // segment at all.
        return core.commit_merge(spec, None, doc_maps, entries, start_live);
    }

    let mut merged = SegmentData {
        doc_count: next_docno,
        ..Default::default()
    };

    for (idx, reader) in readers.iter().enumerate() {
        if core.merges_aborted() {
            return Err(TidepoolError::MergeAborted);
        }
        for (term, docnos) in reader.terms() {
            for docno in docnos {
                if let Some(&new_docno) = doc_maps[idx].get(docno) {
                    merged
                        .postings
                        .entry(term.clone())
                        .or_default()
                        .push(new_docno);
                }
            }
        }
    }

    let mut field_names: HashSet<String> = HashSet::new();
    for reader in &readers {
        field_names.extend(reader.field_names().cloned());
    }
    for field in field_names {
        let mut column = vec![None; next_docno as usize];
        for (idx, reader) in readers.iter().enumerate() {
            for (&old, &new) in &doc_maps[idx] {
                // Current value, with any field-update overlay baked in.
                column[new as usize] = reader.value(&field, DocNo::new(old));
            }
        }
        merged.doc_values.insert(field, column);
    }

    let mut info = SegmentInfo {
        id: core.alloc_segment_id(),
        doc_count: next_docno,
        max_seq: entries.iter().map(|e| e.info.max_seq).max().unwrap_or(0),
        codec: core.codec_name().to_string(),
        compound: false,
        size_bytes: 0,
    files: Vec::new(),
    };

    let dir = core.directory();
    let codec = core.codec();
    let files = codec.write_segment(dir.as_ref(), &info, &merged)?;
    dir.sync(&files)?;
    info.compound = files.len() == 1;
    let mut size = 0u64;
    for name in &files {
        size += dir.file_size(name)?;
    }
    info.size_bytes = size;
    info.files = files;

    let mut entry = SegmentEntry::new(info);
    // Entries above the lowest source watermark may not be reflected in
    // the merged data yet; resolution will replay them.
    entry.applied_seq = entries
        .iter()
        .map(|e| e.applied_seq)
        .min()
        .unwrap_or(entry.info.max_seq);

    core.commit_merge(spec, Some(entry), doc_maps, entries, start_live)
}
