//! Payload-digest deduplication: revisit profiles and digest stores.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use data_encoding::BASE32;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::codec::field;
use crate::error::ArchiveResult;
use crate::header_block::HeaderBlock;
use crate::record::{timestamp_iso, RecordId};

/// Profile URI for revisits of byte-identical payloads.
pub const PROFILE_IDENTICAL_DIGEST: &str =
    "http://netpreserve.org/warc/1.0/revisit/identical-payload-digest";
/// Profile URI for revisits of server-confirmed unchanged content.
pub const PROFILE_SERVER_NOT_MODIFIED: &str =
    "http://netpreserve.org/warc/1.0/revisit/server-not-modified";

/// Why a fetch is stored as a revisit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RevisitKind {
    /// Payload digest matches a stored record.
    IdenticalDigest,
    /// Server answered "not modified".
    ServerNotModified,
}

impl RevisitKind {
    /// Profile URI written in the revisit record.
    pub fn profile_uri(self) -> &'static str {
        match self {
            RevisitKind::IdenticalDigest => PROFILE_IDENTICAL_DIGEST,
            RevisitKind::ServerNotModified => PROFILE_SERVER_NOT_MODIFIED,
        }
    }
}

/// Revisit decision for one fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisitProfile {
    /// Profile kind.
    pub kind: RevisitKind,
    /// Payload digest shared with the original.
    pub digest: Option<String>,
    /// Id of the original record.
    pub refers_to: Option<RecordId>,
    /// URL of the original record.
    pub refers_to_url: Option<String>,
    /// Capture date of the original record.
    pub refers_to_date: Option<DateTime<Utc>>,
    /// Server ETag, for not-modified revisits.
    pub etag: Option<String>,
    /// Server Last-Modified, for not-modified revisits.
    pub last_modified: Option<String>,
}

impl RevisitProfile {
    /// Identical-digest revisit of `original`.
    pub fn identical_digest(digest: impl Into<String>, original: &StoredRecordRef) -> Self {
        Self {
            kind: RevisitKind::IdenticalDigest,
            digest: Some(digest.into()),
            refers_to: Some(original.id.clone()),
            refers_to_url: Some(original.url.clone()),
            refers_to_date: Some(original.date),
            etag: None,
            last_modified: None,
        }
    }

    /// Server-not-modified revisit with no known original.
    pub fn server_not_modified(etag: Option<String>, last_modified: Option<String>) -> Self {
        Self {
            kind: RevisitKind::ServerNotModified,
            digest: None,
            refers_to: None,
            refers_to_url: None,
            refers_to_date: None,
            etag,
            last_modified,
        }
    }

    /// Add the profile and reference headers to `headers`.
    pub fn write_headers(&self, headers: &mut HeaderBlock) -> ArchiveResult<()> {
        headers.push(field::PROFILE, self.kind.profile_uri())?;
        if let Some(id) = &self.refers_to {
            headers.push(field::REFERS_TO, id.as_str())?;
        }
        if let Some(url) = &self.refers_to_url {
            headers.push(field::REFERS_TO_TARGET_URI, url)?;
        }
        if let Some(date) = &self.refers_to_date {
            headers.push(field::REFERS_TO_DATE, &timestamp_iso(date))?;
        }
        if let Some(etag) = &self.etag {
            headers.push(field::ETAG, etag)?;
        }
        if let Some(lm) = &self.last_modified {
            headers.push(field::LAST_MODIFIED, lm)?;
        }
        Ok(())
    }
}

/// Where a payload was first stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredRecordRef {
    /// Record id.
    pub id: RecordId,
    /// Target URL.
    pub url: String,
    /// Capture date.
    pub date: DateTime<Utc>,
    /// Container file.
    pub path: Option<PathBuf>,
    /// Offset in the container file.
    pub offset: Option<u64>,
}

/// Answer of a digest lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupDecision {
    /// Content not seen before.
    Novel,
    /// Content already stored.
    Duplicate(RevisitProfile),
}

/// Digest history consulted before writing a payload.
pub trait DedupStore: Send + Sync {
    /// Look up a payload digest fetched from `url`.
    fn lookup(&self, digest: &str, url: &str) -> DedupDecision;

    /// Remember where a payload was stored.
    /// Returns true if this was a new entry; the first stored copy wins.
    fn remember(&self, digest: &str, original: StoredRecordRef) -> bool;

    /// Number of remembered payloads.
    fn entry_count(&self) -> usize;
}

/// In-memory digest history.
pub struct MemoryDedupStore {
    entries: RwLock<HashMap<String, StoredRecordRef>>,
    same_url_only: bool,
}

impl MemoryDedupStore {
    /// Store matching digests across all URLs.
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            same_url_only: false,
        }
    }

    /// Store matching a digest only against earlier fetches of the same URL.
    pub fn per_url() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            same_url_only: true,
        }
    }

    fn key(&self, digest: &str, url: &str) -> String {
        if self.same_url_only {
            format!("{} {}", url, digest)
        } else {
            digest.to_string()
        }
    }
}

impl Default for MemoryDedupStore {
    fn default() -> Self {
        Self::new()
    }
}

impl DedupStore for MemoryDedupStore {
    fn lookup(&self, digest: &str, url: &str) -> DedupDecision {
        let entries = self.entries.read();
        match entries.get(&self.key(digest, url)) {
            Some(original) => {
                debug!(digest, url, original = %original.id, "digest already stored");
                DedupDecision::Duplicate(RevisitProfile::identical_digest(digest, original))
            }
            None => DedupDecision::Novel,
        }
    }

    fn remember(&self, digest: &str, original: StoredRecordRef) -> bool {
        let key = self.key(digest, &original.url);
        let mut entries = self.entries.write();
        if entries.contains_key(&key) {
            false
        } else {
            debug!(digest, url = %original.url, id = %original.id, "remembered payload digest");
            entries.insert(key, original);
            true
        }
    }

    fn entry_count(&self) -> usize {
        self.entries.read().len()
    }
}

/// Store that never reports duplicates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullDedupStore;

impl DedupStore for NullDedupStore {
    fn lookup(&self, _digest: &str, _url: &str) -> DedupDecision {
        DedupDecision::Novel
    }

    fn remember(&self, _digest: &str, _original: StoredRecordRef) -> bool {
        false
    }

    fn entry_count(&self) -> usize {
        0
    }
}

/// `sha256:` + base32 digest of `payload`.
pub fn payload_digest(payload: &[u8]) -> String {
    let hash = Sha256::digest(payload);
    format!("sha256:{}", BASE32.encode(&hash))
}
