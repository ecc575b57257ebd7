//! Writer configuration

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::segment::flush::{FlushPolicy, ThresholdFlushPolicy};
use crate::segment::merge::{
    ConcurrentMergeScheduler, LoggingFailureHandler, MergeFailureHandler, MergePolicy,
    MergeScheduler, TieredMergePolicy,
};

/// Name of the directory's exclusive writer lock file.
pub const WRITE_LOCK_NAME: &str = "write.lock";

/// Configuration for an `IndexWriter`.
#[derive(Clone)]
pub struct WriterConfig {
    /// Decides after every operation whether a buffer should flush
    pub flush_policy: Arc<dyn FlushPolicy>,
    /// Hard RAM ceiling: past this, the calling thread flushes before
    /// its operation returns (backpressure)
    pub stall_bytes: usize,
    /// Maximum number of per-thread write buffers
    pub max_buffer_count: usize,
    /// Resolve the buffered update queue once it holds this many bytes
    pub update_queue_max_bytes: usize,
    /// How long to wait for the directory write lock
    pub lock_timeout: Duration,
    /// Codec identifier for newly written segments
    pub codec: String,
    /// Create an empty index when the directory has no catalog
    pub create_if_missing: bool,
    pub merge_policy: Arc<dyn MergePolicy>,
    pub merge_scheduler: Arc<dyn MergeScheduler>,
    pub merge_failure_handler: Arc<dyn MergeFailureHandler>,
}

impl Default for WriterConfig {
    fn default() -> Self {
        Self {
            flush_policy: Arc::new(ThresholdFlushPolicy::default()),
            // 128MB
            stall_bytes: 128 * 1024 * 1024,
            max_buffer_count: 8,
            // 16MB
            update_queue_max_bytes: 16 * 1024 * 1024,
            lock_timeout: Duration::from_secs(1),
            codec: crate::codec::PlainCodec::NAME.to_string(),
            create_if_missing: true,
            merge_policy: Arc::new(TieredMergePolicy::default()),
            merge_scheduler: Arc::new(ConcurrentMergeScheduler::default()),
            merge_failure_handler: Arc::new(LoggingFailureHandler),
        }
    }
}

impl WriterConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_flush_policy(mut self, policy: Arc<dyn FlushPolicy>) -> Self {
        self.flush_policy = policy;
        self
    }

    pub fn with_stall_bytes(mut self, bytes: usize) -> Self {
        self.stall_bytes = bytes;
        self
    }

    pub fn with_max_buffer_count(mut self, count: usize) -> Self {
        self.max_buffer_count = count.max(1);
        self
    }

    pub fn with_update_queue_max_bytes(mut self, bytes: usize) -> Self {
        self.update_queue_max_bytes = bytes;
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn with_codec(mut self, codec: impl Into<String>) -> Self {
        self.codec = codec.into();
        self
    }

    pub fn with_create_if_missing(mut self, create: bool) -> Self {
        self.create_if_missing = create;
        self
    }

    pub fn with_merge_policy(mut self, policy: Arc<dyn MergePolicy>) -> Self {
        self.merge_policy = policy;
        self
    }

    pub fn with_merge_scheduler(mut self, scheduler: Arc<dyn MergeScheduler>) -> Self {
        self.merge_scheduler = scheduler;
        self
    }

    pub fn with_merge_failure_handler(mut self, handler: Arc<dyn MergeFailureHandler>) -> Self {
        self.merge_failure_handler = handler;
        self
    }
}

impl fmt::Debug for WriterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriterConfig")
            .field("stall_bytes", &self.stall_bytes)
            .field("max_buffer_count", &self.max_buffer_count)
            .field("update_queue_max_bytes", &self.update_queue_max_bytes)
            .field("lock_timeout", &self.lock_timeout)
            .field("codec", &self.codec)
            .field("create_if_missing", &self.create_if_missing)
            .field("merge_policy", &self.merge_policy)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::merge::NoMergePolicy;

    #[test]
    fn test_default_config() {
        let config = WriterConfig::default();
        assert_eq!(config.codec, "plain-v1");
        assert_eq!(config.max_buffer_count, 8);
        assert!(config.create_if_missing);
    }

    #[test]
    fn test_builder_chain() {
        let config = WriterConfig::new()
            .with_stall_bytes(1024)
            .with_max_buffer_count(0)
            .with_lock_timeout(Duration::from_millis(5))
            .with_merge_policy(Arc::new(NoMergePolicy))
            .with_codec("plain-v1");

        assert_eq!(config.stall_bytes, 1024);
        // The buffer count floor is 1.
        assert_eq!(config.max_buffer_count, 1);
        assert_eq!(config.lock_timeout, Duration::from_millis(5));
        assert!(config.merge_policy.find_merges(&[]).is_empty());
    }
}
