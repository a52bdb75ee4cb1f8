//! Per-fetch pipeline: dedup decision, record building, pooled writing.

use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use data_encoding::BASE32;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::builders::BuilderChain;
use crate::config::BuilderSettings;
use crate::dedup::{DedupDecision, DedupStore, RevisitProfile, StoredRecordRef};
use crate::error::{ArchiveError, ArchiveResult};
use crate::fetch::{FetchOutcome, HostLookup};
use crate::pool::WriterPool;
use crate::record::{ArchiveFormat, Record, RecordType};
use crate::replay::ReplaySource;
use crate::writer::WriteReceipt;

/// HTTP status meaning the server confirmed the content is unchanged.
const NOT_MODIFIED: i32 = 304;

/// Counters across every processed fetch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ProcessorStats {
    /// Fetches that produced at least one record.
    pub fetches_archived: u64,
    /// Fetches skipped as not archivable.
    pub fetches_skipped: u64,
    /// Records written.
    pub records_written: u64,
    /// Revisit records written.
    pub revisits_written: u64,
    /// Bytes written, descriptors excluded.
    pub bytes_written: u64,
    /// Fetches whose records could not be written.
    pub failures: u64,
}

#[derive(Default)]
struct Counters {
    fetches_archived: AtomicU64,
    fetches_skipped: AtomicU64,
    records_written: AtomicU64,
    revisits_written: AtomicU64,
    bytes_written: AtomicU64,
    failures: AtomicU64,
}

/// Turns fetch outcomes into stored records.
///
/// Shared between worker threads; every call borrows its own writer from
/// the pool so all records of one fetch land in the same file, in order.
pub struct ArchiveProcessor {
    pool: Arc<WriterPool>,
    chain: BuilderChain,
    dedup: Arc<dyn DedupStore>,
    settings: BuilderSettings,
    counters: Counters,
}

impl ArchiveProcessor {
    /// Processor with the standard builder chain.
    pub fn new(
        pool: Arc<WriterPool>,
        settings: BuilderSettings,
        lookup: Arc<dyn HostLookup>,
        dedup: Arc<dyn DedupStore>,
    ) -> Self {
        let chain = BuilderChain::standard(&settings, lookup);
        Self::with_chain(pool, chain, settings, dedup)
    }

    /// Processor with a custom builder chain.
    pub fn with_chain(
        pool: Arc<WriterPool>,
        chain: BuilderChain,
        settings: BuilderSettings,
        dedup: Arc<dyn DedupStore>,
    ) -> Self {
        Self {
            pool,
            chain,
            dedup,
            settings,
            counters: Counters::default(),
        }
    }

    /// Writer pool in use.
    pub fn pool(&self) -> &Arc<WriterPool> {
        &self.pool
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> ProcessorStats {
        let c = &self.counters;
        ProcessorStats {
            fetches_archived: c.fetches_archived.load(Ordering::Relaxed),
            fetches_skipped: c.fetches_skipped.load(Ordering::Relaxed),
            records_written: c.records_written.load(Ordering::Relaxed),
            revisits_written: c.revisits_written.load(Ordering::Relaxed),
            bytes_written: c.bytes_written.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
        }
    }

    /// Store every record for `outcome`. Returns no receipts when the fetch
    /// has nothing worth archiving.
    pub fn process(&self, outcome: &mut FetchOutcome) -> ArchiveResult<Vec<WriteReceipt>> {
        if !outcome.should_archive() {
            debug!(url = %outcome.url, status = outcome.status, "nothing to archive");
            self.counters.fetches_skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(Vec::new());
        }

        let format = self.pool.factory().settings().format;
        if outcome.content_digest.is_none() {
            outcome.content_digest = response_digest(outcome)?;
        }
        if format == ArchiveFormat::Warc {
            self.decide_revisit(outcome);
        }

        let mut records = self.chain.build_all(outcome)?;
        if format == ArchiveFormat::Arc {
            records.retain(|r| matches!(r.record_type, RecordType::Response | RecordType::Resource));
        }
        if records.is_empty() {
            self.counters.fetches_skipped.fetch_add(1, Ordering::Relaxed);
            return Ok(Vec::new());
        }

        let receipts = self.pool.with_writer(|writer| write_all(writer, records));
        let receipts = match receipts {
            Ok(r) => r,
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                warn!(url = %outcome.url, error = %e, "failed to store fetch");
                return Err(e);
            }
        };

        self.remember_payloads(&receipts);
        self.count(&receipts);
        Ok(receipts)
    }

    fn decide_revisit(&self, outcome: &mut FetchOutcome) {
        if outcome.revisit.is_some() {
            return;
        }
        if outcome.status == NOT_MODIFIED && self.settings.write_revisit_for_not_modified {
            outcome.revisit = Some(RevisitProfile::server_not_modified(
                outcome.etag.clone(),
                outcome.last_modified.clone(),
            ));
            return;
        }
        if !self.settings.write_revisit_for_identical_digests {
            return;
        }
        if let Some(digest) = outcome.content_digest.as_deref() {
            if let DedupDecision::Duplicate(profile) = self.dedup.lookup(digest, &outcome.url) {
                debug!(url = %outcome.url, digest, "storing revisit for identical payload");
                outcome.revisit = Some(profile);
            }
        }
    }

    fn remember_payloads(&self, receipts: &[WriteReceipt]) {
        for r in receipts {
            if !matches!(r.record_type, RecordType::Response | RecordType::Resource) {
                continue;
            }
            if let Some(digest) = &r.payload_digest {
                self.dedup.remember(
                    digest,
                    StoredRecordRef {
                        id: r.id.clone(),
                        url: r.url.clone(),
                        date: r.date,
                        path: Some(r.path.clone()),
                        offset: Some(r.offset),
                    },
                );
            }
        }
    }

    fn count(&self, receipts: &[WriteReceipt]) {
        let c = &self.counters;
        c.fetches_archived.fetch_add(1, Ordering::Relaxed);
        c.records_written.fetch_add(receipts.len() as u64, Ordering::Relaxed);
        let revisits = receipts.iter().filter(|r| r.record_type == RecordType::Revisit).count();
        c.revisits_written.fetch_add(revisits as u64, Ordering::Relaxed);
        let bytes: u64 = receipts.iter().map(|r| r.length).sum();
        c.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Close the pool and log the final counters.
    pub fn shutdown(&self) -> ArchiveResult<ProcessorStats> {
        self.pool.close()?;
        let stats = self.stats();
        info!(
            fetches = stats.fetches_archived,
            records = stats.records_written,
            revisits = stats.revisits_written,
            bytes = stats.bytes_written,
            failures = stats.failures,
            "archive processor shut down"
        );
        Ok(stats)
    }
}

fn write_all(writer: &mut crate::writer::ArchiveWriter, records: Vec<Record>) -> ArchiveResult<Vec<WriteReceipt>> {
    let mut receipts = Vec::with_capacity(records.len());
    for record in records {
        receipts.push(writer.write(record)?);
    }
    Ok(receipts)
}

/// Digest of the payload part of the recorded response.
fn response_digest(outcome: &FetchOutcome) -> ArchiveResult<Option<String>> {
    let response = match outcome.recorder.as_ref().and_then(|r| r.response.as_ref()) {
        Some(r) => r,
        None => return Ok(None),
    };
    Ok(Some(digest_payload(&**response)?))
}

/// `sha256:` + base32 digest of everything after `content_begin`.
pub fn digest_payload(source: &dyn ReplaySource) -> ArchiveResult<String> {
    let mut content = source.replay();
    let skip = source.content_begin();
    std::io::copy(&mut content.by_ref().take(skip), &mut std::io::sink())?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = content.read(&mut buf).map_err(ArchiveError::Io)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("sha256:{}", BASE32.encode(&hasher.finalize())))
}
