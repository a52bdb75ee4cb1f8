#![warn(missing_docs)]

//! arcstore engine: crawl-record archiving to ARC/WARC container files
//!
//! Write path: FetchOutcome → Dedup decision → Builder chain → Writer pool → Framed, compressed record → Container file
//! Read path:  Container file → Frame → Header → Body → Integrity check

pub mod builders;
pub mod codec;
pub mod compression;
pub mod config;
pub mod container;
pub mod dedup;
pub mod error;
pub mod fetch;
pub mod header_block;
pub mod pool;
pub mod processor;
pub mod reader;
pub mod record;
pub mod replay;
pub mod writer;

pub use builders::{BuilderChain, RecordBuilder};
pub use compression::CompressionKind;
pub use config::{ArchiveConfig, BuilderSettings, PoolConfig, WriterSettings};
pub use container::{ContainerNamer, SerialNumber};
pub use dedup::{payload_digest, DedupDecision, DedupStore, MemoryDedupStore, NullDedupStore, RevisitKind, RevisitProfile, StoredRecordRef};
pub use error::{ArchiveError, ArchiveResult};
pub use fetch::{FetchOutcome, HostLookup, OutcomeHostLookup, StaticHostLookup};
pub use header_block::HeaderBlock;
pub use pool::WriterPool;
pub use processor::{ArchiveProcessor, ProcessorStats};
pub use reader::{validate_files, ArchiveReader, ArchiveRecord, ReadPolicy, ReadWarning, ValidationReport};
pub use record::{ArchiveFormat, Record, RecordHeader, RecordId, RecordType, Truncation};
pub use replay::{ContentSource, ReaderSource, RecordedBytes, Recorder, ReplaySource, SliceSource};
pub use writer::{ArchiveWriter, RecordInterceptor, WriteReceipt, WriterFactory, WriterStats};
