//! tidepool: an embedded, segment-structured document-indexing storage
//! engine. Documents are buffered per thread, flushed into immutable
//! segments, consolidated by background merges, and read through
//! reference-counted point-in-time snapshots; commits are two-phase and
//! crash-safe.

pub mod codec;
pub mod config;
pub mod directory;
pub mod error;
pub mod segment;

pub use codec::{register_codec, resolve_codec, Codec, PlainCodec, SegmentData};
pub use config::{WriterConfig, WRITE_LOCK_NAME};
pub use directory::{Directory, DirectoryLock, FsDirectory, RamDirectory};
pub use error::{Result, TidepoolError};
pub use segment::{
    Document, Field, FieldValue, IndexReader, IndexWriter, SegmentCatalog, Term,
};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
