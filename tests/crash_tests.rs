//! Crash-safety tests for the two-phase commit protocol: a process that
//! dies between phases must leave the directory loadable at the last
//! published generation, and commit failures must be retryable.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use tidepool::segment::merge::{NoMergePolicy, SerialMergeScheduler};
use tidepool::{
    Directory, DirectoryLock, Document, FsDirectory, IndexReader, IndexWriter, RamDirectory,
    Result, SegmentCatalog, Term, TidepoolError, WriterConfig, WRITE_LOCK_NAME,
};

fn quiet_config() -> WriterConfig {
    WriterConfig::default()
        .with_merge_policy(Arc::new(NoMergePolicy))
        .with_merge_scheduler(Arc::new(SerialMergeScheduler))
        .with_lock_timeout(Duration::from_millis(100))
}

fn doc(id: &str) -> Document {
    Document::with_keyword("id", id)
}

/// Simulate a hard crash: the writer is forgotten without rollback, and
/// the stale lock is cleared the way an OS-level lock release would.
fn crash(writer: IndexWriter, dir: &dyn Directory) {
    std::mem::forget(writer);
    let _ = dir.delete_file(WRITE_LOCK_NAME);
}

#[test]
fn test_crash_between_prepare_and_finish_falls_back() {
    let tmp = TempDir::new().unwrap();
    let dir: Arc<dyn Directory> = Arc::new(FsDirectory::open(tmp.path()).unwrap());

    let writer = IndexWriter::open(Arc::clone(&dir), quiet_config()).unwrap();
    writer.add_document(doc("committed")).unwrap();
    writer.commit(None).unwrap();

    writer.add_document(doc("prepared-only")).unwrap();
    writer.prepare_commit(None).unwrap();
    crash(writer, dir.as_ref());

    // The provisional generation is invisible; the index reopens at the
    // last fully published one.
    let reader = IndexReader::open(Arc::clone(&dir)).unwrap();
    assert_eq!(reader.num_docs(), 1);
    assert_eq!(reader.doc_freq(&Term::new("id", "committed")).unwrap(), 1);
    assert_eq!(
        reader.doc_freq(&Term::new("id", "prepared-only")).unwrap(),
        0
    );
    reader.close().unwrap();

    // A new writer cleans the orphaned pending file up.
    let reopened = IndexWriter::open(Arc::clone(&dir), quiet_config()).unwrap();
    assert!(!dir
        .list_all()
        .unwrap()
        .iter()
        .any(|f| f.ends_with(".pending")));
    reopened.rollback().unwrap();
}

#[test]
fn test_crash_before_any_commit_leaves_no_index() {
    let tmp = TempDir::new().unwrap();
    let dir: Arc<dyn Directory> = Arc::new(FsDirectory::open(tmp.path()).unwrap());

    let writer = IndexWriter::open(Arc::clone(&dir), quiet_config()).unwrap();
    writer.add_document(doc("a")).unwrap();
    writer.flush().unwrap();
    crash(writer, dir.as_ref());

    assert!(matches!(
        IndexReader::open(Arc::clone(&dir)),
        Err(TidepoolError::NoCatalog)
    ));

    // Reopening for write reclaims the orphaned segment files.
    let reopened = IndexWriter::open(Arc::clone(&dir), quiet_config()).unwrap();
    let leftovers: Vec<String> = dir
        .list_all()
        .unwrap()
        .into_iter()
        .filter(|f| f != WRITE_LOCK_NAME)
        .collect();
    assert!(leftovers.is_empty(), "leftover files: {:?}", leftovers);
    reopened.rollback().unwrap();
}

#[test]
fn test_corrupt_latest_generation_surfaced_then_fallback() {
    let dir: Arc<dyn Directory> = Arc::new(RamDirectory::new());

    let writer = IndexWriter::open(Arc::clone(&dir), quiet_config()).unwrap();
    writer.add_document(doc("first")).unwrap();
    writer.commit(None).unwrap();
    writer.close().unwrap();

    // Keep a copy of the published generation, then corrupt the newer
    // one written by a second session.
    let gen1 = SegmentCatalog::load(dir.as_ref()).unwrap();
    let writer = IndexWriter::open(Arc::clone(&dir), quiet_config()).unwrap();
    writer.add_document(doc("second")).unwrap();
    writer.commit(None).unwrap();
    writer.close().unwrap();
    let gen2 = SegmentCatalog::load(dir.as_ref()).unwrap();
    assert_eq!(gen2.generation, gen1.generation + 1);

    // Truncate the newest generation file.
    let gen2_name = gen2.file_name();
    let mut bytes = dir.read_file(&gen2_name).unwrap();
    bytes.truncate(bytes.len() / 2);
    dir.write_file(&gen2_name, &bytes).unwrap();

    // Default load surfaces the corruption rather than silently
    // recovering.
    assert!(matches!(
        SegmentCatalog::load(dir.as_ref()),
        Err(TidepoolError::CorruptData { .. })
    ));

    // The superseded generation was deleted at commit time, so explicit
    // fallback has nowhere to go and the corruption still surfaces.
    assert!(matches!(
        SegmentCatalog::load_with_fallback(dir.as_ref()),
        Err(TidepoolError::CorruptData { .. })
    ));

    // Republish the retained copy of the prior generation: fallback now
    // recovers it while default load still reports the broken newest.
    gen1.persist_pending(dir.as_ref()).unwrap();
    gen1.publish(dir.as_ref()).unwrap();
    assert!(matches!(
        SegmentCatalog::load(dir.as_ref()),
        Err(TidepoolError::CorruptData { .. })
    ));
    let recovered = SegmentCatalog::load_with_fallback(dir.as_ref()).unwrap();
    assert_eq!(recovered.generation, gen1.generation);
}

/// Directory wrapper that fails writes while a flag is set.
struct FailingWrites<D> {
    inner: D,
    fail: AtomicBool,
}

impl<D: Directory> FailingWrites<D> {
    fn new(inner: D) -> Self {
        Self {
            inner,
            fail: AtomicBool::new(false),
        }
    }
}

impl<D: Directory> Directory for FailingWrites<D> {
    fn list_all(&self) -> Result<Vec<String>> {
        self.inner.list_all()
    }
    fn read_file(&self, name: &str) -> Result<Vec<u8>> {
        self.inner.read_file(name)
    }
    fn write_file(&self, name: &str, data: &[u8]) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TidepoolError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected write failure",
            )));
        }
        self.inner.write_file(name, data)
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
    fn obtain_lock(&self, name: &str, timeout: Duration) -> Result<Box<dyn DirectoryLock>> {
        self.inner.obtain_lock(name, timeout)
    }
}

#[test]
fn test_transient_commit_failure_is_retryable() {
    let failing = Arc::new(FailingWrites::new(RamDirectory::new()));
    let dir: Arc<dyn Directory> = Arc::clone(&failing) as Arc<dyn Directory>;

    let writer = IndexWriter::open(Arc::clone(&dir), quiet_config()).unwrap();
    writer.add_document(doc("a")).unwrap();
    writer.flush().unwrap();

    // The catalog write fails; the writer must remain usable.
    failing.fail.store(true, Ordering::SeqCst);
    assert!(writer.commit(None).is_err());

    failing.fail.store(false, Ordering::SeqCst);
    let generation = writer.commit(None).unwrap();
    assert_eq!(generation, 1);

    let reader = IndexReader::open(Arc::clone(&dir)).unwrap();
    assert_eq!(reader.num_docs(), 1);
    reader.close().unwrap();
    writer.close().unwrap();
}

#[test]
fn test_rollback_after_failed_commit_still_unlocks() {
    let failing = Arc::new(FailingWrites::new(RamDirectory::new()));
    let dir: Arc<dyn Directory> = Arc::clone(&failing) as Arc<dyn Directory>;

    let writer = IndexWriter::open(Arc::clone(&dir), quiet_config()).unwrap();
    writer.add_document(doc("a")).unwrap();
    failing.fail.store(true, Ordering::SeqCst);
    assert!(writer.commit(None).is_err());

    // Rollback after the failure must close, unlock, and leave the
    // directory at the last commit (here: empty).
    failing.fail.store(false, Ordering::SeqCst);
    writer.rollback().unwrap();
    assert!(writer.is_closed());

    let second = IndexWriter::open(Arc::clone(&dir), quiet_config()).unwrap();
    second.rollback().unwrap();
}

#[test]
fn test_commit_is_atomic_across_reopen() {
    // Repeated sessions each commit one more document; after every
    // simulated crash the directory reopens at a consistent commit.
    let tmp = TempDir::new().unwrap();
    let dir: Arc<dyn Directory> = Arc::new(FsDirectory::open(tmp.path()).unwrap());

    for round in 0..5u32 {
        let writer = IndexWriter::open(Arc::clone(&dir), quiet_config()).unwrap();
        writer.add_document(doc(&format!("round-{}", round))).unwrap();
        writer.commit(None).unwrap();
        // Crash with a further uncommitted document in memory.
        writer.add_document(doc("uncommitted")).unwrap();
        crash(writer, dir.as_ref());

        let reader = IndexReader::open(Arc::clone(&dir)).unwrap();
        assert_eq!(reader.num_docs(), round + 1);
        assert_eq!(reader.doc_freq(&Term::new("id", "uncommitted")).unwrap(), 0);
        reader.close().unwrap();
    }
}
